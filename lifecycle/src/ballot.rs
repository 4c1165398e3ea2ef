//! Validate and submit votes.
//!
//! Votes go straight to the session's contract. The locally stored tally is only updated by
//! [crate::reconciler], so a submitted vote appears locally after the next sync.

use crate::{
    bounded,
    ledger::{self, Ledger, Receipt, Vote},
    status::{resolve, Status},
    store::{self, within, Store},
    types::{ChoiceId, Mode, Session, SessionId},
    Config,
};
use commonware_runtime::Clock;
use std::{collections::BTreeSet, time::Duration};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can occur when casting a vote.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("voting is not open: {0}")]
    NotActive(Status),
    #[error("vote does not match mode: expected {0:?}")]
    WrongMode(Mode),
    #[error("no choices selected")]
    Empty,
    #[error("choice selected more than once: {0}")]
    Repeated(ChoiceId),
    #[error("unknown choice: {0}")]
    UnknownChoice(ChoiceId),
    #[error("ranking must include all {expected} choices, found {found}")]
    IncompleteRanking { expected: usize, found: usize },
    #[error("store error: {0}")]
    Store(#[from] store::Error),
    #[error("ledger error: {0}")]
    Ledger(#[from] ledger::Error),
    #[error("ledger timed out after {0:?}")]
    Timeout(Duration),
}

/// Check that `vote` is a valid ballot for `session`.
pub fn validate(session: &Session, vote: &Vote) -> Result<(), Error> {
    if vote.mode() != session.mode {
        return Err(Error::WrongMode(session.mode));
    }
    let choices = vote.choices();
    if choices.is_empty() {
        return Err(Error::Empty);
    }
    let mut seen = BTreeSet::new();
    for choice in choices {
        if !session.ballot.contains(choice) {
            return Err(Error::UnknownChoice(choice.clone()));
        }
        if !seen.insert(choice) {
            return Err(Error::Repeated(choice.clone()));
        }
    }
    if let Vote::Ranked(ranking) = vote {
        let expected = session.ballot.len();
        if ranking.len() != expected {
            return Err(Error::IncompleteRanking {
                expected,
                found: ranking.len(),
            });
        }
    }
    Ok(())
}

/// Submits votes to session contracts.
#[derive(Clone)]
pub struct Caster<E: Clock, S: Store, L: Ledger> {
    context: E,
    store: S,
    ledger: L,
    ledger_timeout: Duration,
    store_timeout: Duration,
}

impl<E: Clock, S: Store, L: Ledger> Caster<E, S, L> {
    pub fn new(context: E, store: S, ledger: L, cfg: &Config) -> Self {
        Self {
            context,
            store,
            ledger,
            ledger_timeout: cfg.ledger_timeout,
            store_timeout: cfg.store_timeout,
        }
    }

    /// Cast a vote in an active session.
    pub async fn cast(&self, id: &SessionId, vote: Vote) -> Result<Receipt, Error> {
        let session = within(&self.context, self.store_timeout, self.store.get(id)).await?;
        let status = resolve(&session, self.context.current());
        let Some(contract) = session.contract.filter(|_| status == Status::Active) else {
            return Err(Error::NotActive(status));
        };
        validate(&session, &vote)?;

        match bounded(
            &self.context,
            self.ledger_timeout,
            self.ledger.submit(contract, vote),
        )
        .await
        {
            Ok(Ok(receipt)) => {
                debug!(session = %id, transaction = %receipt.transaction, "vote submitted");
                Ok(receipt)
            }
            Ok(Err(err)) => {
                warn!(session = %id, ?err, "vote rejected");
                Err(err.into())
            }
            Err(_) => {
                warn!(session = %id, "vote submission timed out");
                Err(Error::Timeout(self.ledger_timeout))
            }
        }
    }
}
