//! Mock implementations of the lifecycle interfaces and session builders for tests.

use crate::types::{Ballot, Candidate, Choice, ChoiceId, Identity, Mode, Profile, Session, Window};
use std::time::{Duration, SystemTime};

mod ledger;
pub use ledger::{address, Behavior, Ledger};
mod reporter;
pub use reporter::Reporter;
mod store;
pub use store::{Delayed, Store};

/// Seconds after the epoch (where the deterministic runtime starts its clock).
pub fn at(secs: u64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
}

/// A window from `start` to `end` seconds after the epoch.
pub fn window(start: u64, end: u64) -> Window {
    Window {
        start: at(start),
        end: at(end),
    }
}

/// A single-choice poll with one option per name, created at the epoch.
pub fn poll(id: &str, options: &[&str]) -> Session {
    let options = options.iter().map(|name| Choice::new(*name, *name)).collect();
    Session::new(id, id, Ballot::Poll { options }, Mode::Single, at(0))
}

/// A single-choice tournament with one participant per name, created at the epoch.
pub fn tournament(id: &str, participants: &[&str]) -> Session {
    let participants = participants
        .iter()
        .map(|name| Choice::new(*name, *name))
        .collect();
    Session::new(id, id, Ballot::Tournament { participants }, Mode::Single, at(0))
}

/// A single-choice election with one candidate per name, created at the epoch.
pub fn election(id: &str, candidates: &[&str]) -> Session {
    let candidates = candidates
        .iter()
        .map(|name| Candidate {
            id: ChoiceId::new(*name),
            identity: Identity::new(*name),
            profile: Profile {
                full_name: name.to_string(),
                ..Default::default()
            },
            votes: 0,
        })
        .collect();
    Session::new(id, id, Ballot::Election { candidates }, Mode::Single, at(0))
}
