//! Derive the canonical status of a [Session].
//!
//! # Precedence
//!
//! Windows and timestamps may overlap, so rules are evaluated in a fixed order and the first match
//! wins. The most terminal state always takes precedence: a session that has ended but still carries
//! an active-looking contract is reported as [Status::Ended], never [Status::Active].
//!
//! 1. No lifecycle: [Status::Unknown].
//! 2. `ended_at <= now`: [Status::Ended].
//! 3. Contract recorded and `started_at <= now`: [Status::Active].
//! 4. `started_at <= now` without a contract: [Status::PendingDeployment].
//! 5. Election with a nomination window containing `now`: [Status::Nomination].
//! 6. Poll whose window has opened but that was never started: [Status::ReadyToStart].
//! 7. Anything else: [Status::Upcoming].
//!
//! An election whose nomination window has closed but whose voting has not started falls through
//! to [Status::Upcoming].

use crate::types::{Kind, Session};
use serde::{Deserialize, Serialize};
use std::{fmt, time::SystemTime};

/// Lifecycle status of a [Session] at a point in time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Unknown,
    Upcoming,
    Nomination,
    ReadyToStart,
    PendingDeployment,
    Active,
    Ended,
}

impl Status {
    /// Whether voting has opened (successfully deployed or not).
    pub fn is_live(&self) -> bool {
        matches!(self, Self::PendingDeployment | Self::Active | Self::Ended)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::Upcoming => "upcoming",
            Self::Nomination => "nomination",
            Self::ReadyToStart => "ready_to_start",
            Self::PendingDeployment => "pending_deployment",
            Self::Active => "active",
            Self::Ended => "ended",
        };
        f.write_str(name)
    }
}

/// Resolve the [Status] of `session` at `now`.
pub fn resolve(session: &Session, now: SystemTime) -> Status {
    let Some(lifecycle) = &session.lifecycle else {
        return Status::Unknown;
    };
    let reached = |at: Option<SystemTime>| at.is_some_and(|at| at <= now);

    if reached(lifecycle.ended_at) {
        return Status::Ended;
    }
    if reached(lifecycle.started_at) {
        return match session.contract {
            Some(_) => Status::Active,
            None => Status::PendingDeployment,
        };
    }
    match (session.kind(), &lifecycle.window) {
        (Kind::Election, Some(window)) if window.contains(now) => Status::Nomination,
        (Kind::Poll, Some(window)) if lifecycle.started_at.is_none() && now >= window.start => {
            Status::ReadyToStart
        }
        _ => Status::Upcoming,
    }
}
