//! Keep the locally stored tally of a session consistent with its contract.
//!
//! A sync reads the tally recorded by a session's contract (bounded by `read_timeout`) and
//! overwrites the stored count of every matching choice. Counts are never added to: repeating a
//! sync with the same snapshot leaves the store unchanged. The store keeps the snapshot read at the
//! latest block, so a slow read that completes after a newer one is discarded ([Outcome::Stale]).
//!
//! Failures are soft. A failed sync leaves the previously stored tally untouched, is reported as
//! [crate::Event::SyncFailed], and is retried on the next interval.
//!
//! # Engine
//!
//! [Engine] runs syncs for tracked sessions every `sync_interval`, never syncing the same session
//! more often than `min_spacing` on its own schedule. Each sync runs in its own task. Syncs
//! requested through the [Mailbox] run immediately, unless a sync of the same session is already
//! running, in which case they start as soon as it completes. Once an ended session has been
//! synced, its tally is final and the session is no longer tracked.

use crate::{
    bounded,
    ledger::{self, Ledger, TallySnapshot},
    status::{resolve, Status},
    store::{self, within, Store, Update},
    types::{ChoiceId, Session, SessionId, Tally},
    Config, Event, Reporter,
};
use commonware_runtime::{Clock, Metrics};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{debug, warn};

mod engine;
pub use engine::Engine;
mod ingress;
pub use ingress::{Mailbox, Message};
mod metrics;

/// Why a sync was skipped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Skip {
    /// No contract is recorded for the session.
    NotDeployed,

    /// Voting has not opened.
    NotStarted(Status),
}

/// Why a sync failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    #[error("store error: {0}")]
    Store(#[from] store::Error),
    #[error("ledger error: {0}")]
    Ledger(#[from] ledger::Error),
    #[error("ledger timed out after {0:?}")]
    Timeout(Duration),
    #[error("tally at block {block} includes unknown choice: {choice}")]
    Unmatched { choice: ChoiceId, block: u64 },
}

/// Result of a sync.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The snapshot was stored.
    Synced(TallySnapshot),

    /// Nothing to sync.
    Skipped(Skip),

    /// The snapshot was read at an older block than the stored tally and was discarded.
    Stale { stored: u64, read: u64 },

    /// The stored tally was left unchanged.
    Failed(Failure),
}

/// Build the update that stores `snapshot` for `session`.
///
/// Every choice in the snapshot must be on the roster. Choices missing from the snapshot keep
/// their stored count.
pub fn merge(
    session: &Session,
    snapshot: &TallySnapshot,
    now: SystemTime,
) -> Result<Update, Failure> {
    if let Some(choice) = snapshot
        .counts
        .keys()
        .find(|choice| !session.ballot.contains(choice))
    {
        return Err(Failure::Unmatched {
            choice: choice.clone(),
            block: snapshot.block,
        });
    }
    Ok(Update::Tally {
        counts: snapshot.counts.clone(),
        tally: Tally {
            synced_at: now,
            voters: snapshot.voters,
            block: snapshot.block,
        },
    })
}

/// Syncs the tally of a session from its contract.
#[derive(Clone)]
pub struct Reconciler<E: Clock + Metrics, S: Store, L: Ledger, R: Reporter> {
    context: E,
    store: S,
    ledger: L,
    reporter: R,

    read_timeout: Duration,
    store_timeout: Duration,

    metrics: metrics::Metrics,
}

impl<E: Clock + Metrics, S: Store, L: Ledger, R: Reporter> Reconciler<E, S, L, R> {
    pub fn new(context: E, store: S, ledger: L, reporter: R, cfg: &Config) -> Self {
        let metrics = metrics::Metrics::init(&context);
        Self {
            context,
            store,
            ledger,
            reporter,
            read_timeout: cfg.read_timeout,
            store_timeout: cfg.store_timeout,
            metrics,
        }
    }

    /// Sync the tally of a session.
    pub async fn sync(&mut self, id: &SessionId) -> Outcome {
        self.reconcile(id).await.0
    }

    /// Sync the tally of a session, also returning the status it was synced in.
    pub(crate) async fn reconcile(&mut self, id: &SessionId) -> (Outcome, Option<Status>) {
        let (outcome, status) = match self.read(id).await {
            Ok((snapshot, status)) => (snapshot, Some(status)),
            Err(outcome) => (outcome, None),
        };
        match &outcome {
            Outcome::Synced(snapshot) => {
                self.metrics.synced.inc();
                debug!(session = %id, block = snapshot.block, voters = snapshot.voters, "synced");
                self.reporter
                    .report(Event::SyncCompleted {
                        session: id.clone(),
                        voters: snapshot.voters,
                        block: snapshot.block,
                    })
                    .await;
            }
            Outcome::Skipped(reason) => {
                self.metrics.skipped.inc();
                debug!(session = %id, ?reason, "skipped sync");
            }
            Outcome::Stale { stored, read } => {
                self.metrics.stale.inc();
                debug!(session = %id, stored, read, "discarded stale tally");
            }
            Outcome::Failed(failure) => {
                self.metrics.failed.inc();
                warn!(session = %id, ?failure, "sync failed");
                self.reporter
                    .report(Event::SyncFailed {
                        session: id.clone(),
                        reason: failure.to_string(),
                    })
                    .await;
            }
        }
        (outcome, status)
    }

    async fn read(&self, id: &SessionId) -> Result<(Outcome, Status), Outcome> {
        let session = within(&self.context, self.store_timeout, self.store.get(id))
            .await
            .map_err(|err| Outcome::Failed(err.into()))?;
        let status = resolve(&session, self.context.current());
        let Some(contract) = session.contract else {
            return Err(Outcome::Skipped(Skip::NotDeployed));
        };
        if !status.is_live() {
            return Err(Outcome::Skipped(Skip::NotStarted(status)));
        }

        // Read the tally
        let snapshot = match bounded(&self.context, self.read_timeout, self.ledger.tally(contract))
            .await
        {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(err)) => return Err(Outcome::Failed(err.into())),
            Err(_) => return Err(Outcome::Failed(Failure::Timeout(self.read_timeout))),
        };
        let update = merge(&session, &snapshot, self.context.current()).map_err(Outcome::Failed)?;

        // Store it (unless a newer tally is already stored)
        let read = snapshot.block;
        match within(&self.context, self.store_timeout, self.store.update(id, update)).await {
            Ok(_) => Ok((Outcome::Synced(snapshot), status)),
            Err(store::Error::Stale(stored)) => Ok((Outcome::Stale { stored, read }, status)),
            Err(err) => Err(Outcome::Failed(err.into())),
        }
    }
}
