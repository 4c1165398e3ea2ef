//! Interface to the public ledger that anchors sessions and their tallies.

use crate::types::{Address, ChoiceId, Mode, Session, SessionId, Window};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, future::Future};
use thiserror::Error;

/// Errors returned by a [Ledger].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("network error: {0}")]
    Network(String),
    #[error("transaction rejected: {0}")]
    Rejected(String),
    #[error("transaction reverted: {0}")]
    Reverted(String),
}

/// Immutable parameters used to deploy a session contract.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Params {
    pub session: SessionId,
    pub choices: Vec<ChoiceId>,
    pub mode: Mode,
    pub window: Option<Window>,
}

impl Params {
    /// Snapshot the roster, choice mode, and schedule of a session.
    pub fn from_session(session: &Session) -> Self {
        Self {
            session: session.id.clone(),
            choices: session.ballot.ids(),
            mode: session.mode,
            window: session.window().copied(),
        }
    }
}

/// Tally recorded by a session contract.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TallySnapshot {
    pub counts: BTreeMap<ChoiceId, u64>,
    pub voters: u64,

    /// Block at which the tally was read.
    pub block: u64,
}

/// Choices submitted by a voter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Vote {
    Single(ChoiceId),
    Multiple(Vec<ChoiceId>),

    /// Choices in order of preference.
    Ranked(Vec<ChoiceId>),
}

impl Vote {
    /// The [Mode] this vote is valid for.
    pub fn mode(&self) -> Mode {
        match self {
            Self::Single(_) => Mode::Single,
            Self::Multiple(_) => Mode::Multiple,
            Self::Ranked(_) => Mode::Ranked,
        }
    }

    pub fn choices(&self) -> &[ChoiceId] {
        match self {
            Self::Single(choice) => std::slice::from_ref(choice),
            Self::Multiple(choices) | Self::Ranked(choices) => choices,
        }
    }
}

/// Confirmation of a submitted transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub transaction: String,
    pub block: u64,
}

/// A ledger that hosts one contract per deployed session.
///
/// Any call may fail or never complete. Callers bound every call with their own timeout.
pub trait Ledger: Clone + Send + Sync + 'static {
    /// Deploy a contract for a session, returning its address once confirmed.
    fn deploy(&self, params: Params) -> impl Future<Output = Result<Address, Error>> + Send;

    /// Close voting on a contract.
    ///
    /// Returns `false` if the ledger declined to end the contract.
    fn end(&self, contract: Address) -> impl Future<Output = Result<bool, Error>> + Send;

    /// Read the tally recorded by a contract.
    fn tally(&self, contract: Address) -> impl Future<Output = Result<TallySnapshot, Error>> + Send;

    /// Submit a vote to a contract.
    fn submit(
        &self,
        contract: Address,
        vote: Vote,
    ) -> impl Future<Output = Result<Receipt, Error>> + Send;
}
