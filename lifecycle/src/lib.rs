//! Derive, deploy, and reconcile the lifecycle of voting sessions.
//!
//! # Overview
//!
//! A voting session (poll, election, or tournament) is administered in a document store and may be
//! anchored on a public ledger. This crate owns the parts of that process that must stay consistent
//! across both:
//!
//! - [status]: derive the canonical [status::Status] of a session from its timestamps and contract.
//! - [orchestrator]: deploy a session to the ledger and end it, with bounded waits and recoverable
//!   partial failures.
//! - [reconciler]: keep the locally stored tally consistent with the ledger, on demand and on an
//!   interval.
//! - [governor]: decide whether an edit applies immediately or is queued for approval.
//! - [admission]: accept or refuse nominations during an election's nomination window.
//! - [ballot]: validate and submit votes.
//! - [schedule]: turn a poll's scheduled window into start and end actions.
//!
//! The document store ([store::Store]), the ledger ([ledger::Ledger]), and the notification sink
//! ([Reporter]) are provided by the caller. All waiting is done against a
//! [commonware_runtime::Clock], so every component runs unchanged in the deterministic runtime.
//!
//! # Status
//!
//! `tally-lifecycle` is **ALPHA** software and is not yet recommended for production use. Developers
//! should expect breaking changes and occasional instability.

use commonware_macros::select;
use commonware_runtime::Clock;
use futures::pin_mut;
use std::{
    future::Future,
    time::{Duration, SystemTime},
};

pub mod admission;
pub mod ballot;
mod config;
pub use config::Config;
pub mod governor;
pub mod ledger;
pub mod orchestrator;
pub mod reconciler;
pub mod schedule;
pub mod status;
pub mod store;
pub mod types;

#[cfg(any(test, feature = "mocks"))]
pub mod mocks;

use types::{Address, ChoiceId, RequestId, SessionId};

/// Notifications emitted as sessions move through their lifecycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    DeploymentSucceeded {
        session: SessionId,
        contract: Address,
    },
    DeploymentFailed {
        session: SessionId,
        reason: String,
    },
    SessionEnded {
        session: SessionId,
        at: SystemTime,

        /// Set if the ledger could not confirm that voting closed.
        ledger_warning: Option<String>,
    },
    SyncCompleted {
        session: SessionId,
        voters: u64,
        block: u64,
    },
    SyncFailed {
        session: SessionId,
        reason: String,
    },
    EditRequestCreated {
        session: SessionId,
        request: RequestId,
    },
    CandidateAdmitted {
        session: SessionId,
        request: RequestId,
        candidate: ChoiceId,
    },
}

/// Receives [Event]s (for example, to notify users).
pub trait Reporter: Clone + Send + Sync + 'static {
    /// Report an event.
    fn report(&mut self, event: Event) -> impl Future<Output = ()> + Send;
}

/// A bounded call did not complete in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Elapsed;

/// Await `future` for at most `duration` of `context` time.
///
/// If the deadline fires first, `future` is dropped without being polled again.
pub(crate) async fn bounded<E: Clock, T>(
    context: &E,
    duration: Duration,
    future: impl Future<Output = T>,
) -> Result<T, Elapsed> {
    pin_mut!(future);
    select! {
        result = future => {
            Ok(result)
        },
        _ = context.sleep(duration) => {
            Err(Elapsed)
        },
    }
}
