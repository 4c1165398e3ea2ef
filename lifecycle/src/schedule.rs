//! Turn a poll's scheduled window into start and end actions.
//!
//! Only polls follow their window automatically. Elections use the window for nominations and
//! tournaments have no schedule, so both are started and ended by an operator.

use crate::{
    status::{resolve, Status},
    types::{Kind, Session},
};
use std::time::SystemTime;

/// An action that is due for a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Open voting (deploy the session).
    Start,

    /// Close voting.
    End,
}

/// Returns the action due for `session` at `now`, if any.
pub fn due(session: &Session, now: SystemTime) -> Option<Action> {
    if session.kind() != Kind::Poll {
        return None;
    }
    let window = session.window().filter(|w| w.is_ordered());
    match resolve(session, now) {
        Status::ReadyToStart => Some(Action::Start),
        Status::Active | Status::PendingDeployment => {
            let window = window?;
            if window.end <= now {
                Some(Action::End)
            } else if session.contract.is_none() {
                // Started but never deployed (for example, after a deploy timeout)
                Some(Action::Start)
            } else {
                None
            }
        }
        _ => None,
    }
}
