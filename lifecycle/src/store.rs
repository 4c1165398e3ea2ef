//! Interface to the document store that persists sessions and requests.
//!
//! The store is the source of truth for serialization: every [Update] is applied atomically and
//! the conditional variants ([Update::Deploy], [Update::End], [Update::Tally]) are evaluated against
//! the stored document, not a copy held by the caller. [Update::apply] implements these rules for a
//! single document and can be reused by any backend inside its own transaction.

use crate::{
    bounded,
    types::{
        Address, AdmissionStatus, Candidate, CandidateRequest, ChoiceId, EditRequest, EditStatus,
        Identity, Patch, Profile, RequestId, Session, SessionId, Tally,
    },
};
use commonware_runtime::Clock;
use std::{
    collections::BTreeMap,
    future::Future,
    time::{Duration, SystemTime},
};
use thiserror::Error;

/// Errors returned by a [Store].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),
    #[error("request not found: {0}")]
    RequestNotFound(RequestId),
    #[error("session has no lifecycle: {0}")]
    MissingLifecycle(SessionId),
    #[error("contract already recorded: {0}")]
    Conflict(Address),
    #[error("session already ended at {0:?}")]
    Ended(SystemTime),
    #[error("stale tally: stored block {0}")]
    Stale(u64),
    #[error("open nomination already exists: {0}")]
    Duplicate(RequestId),
    #[error("request already resolved: {0}")]
    Resolved(RequestId),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// An atomic change to a single [Session].
#[derive(Clone, Debug, PartialEq)]
pub enum Update {
    /// Record a deployment.
    ///
    /// Compare-and-set on the contract: fails with [Error::Conflict] if a different contract is
    /// already recorded and succeeds without change if the same one is. `started_at` is written
    /// with the contract unless an earlier (or equal) start is already stored, so a session with a
    /// contract has always started.
    Deploy {
        contract: Address,
        started_at: SystemTime,
    },

    /// Set `ended_at`, failing with [Error::Ended] if it is already set.
    End { ended_at: SystemTime },

    /// Overwrite roster counts and record sync metadata.
    ///
    /// Fails with [Error::Stale] if the stored tally was read at a later block.
    Tally {
        counts: BTreeMap<ChoiceId, u64>,
        tally: Tally,
    },

    /// Add a candidate unless one with the same identity is on the roster.
    Admit { candidate: Candidate },

    /// Apply a [Patch].
    Edit { patch: Patch, at: SystemTime },
}

impl Update {
    /// Apply this update to `session`, enforcing the conditional rules of each variant.
    ///
    /// On error, `session` is left unchanged.
    pub fn apply(self, session: &mut Session) -> Result<(), Error> {
        match self {
            Self::Deploy {
                contract,
                started_at,
            } => {
                if let Some(existing) = session.contract {
                    if existing == contract {
                        return Ok(());
                    }
                    return Err(Error::Conflict(existing));
                }
                let lifecycle = session
                    .lifecycle
                    .as_mut()
                    .ok_or_else(|| Error::MissingLifecycle(session.id.clone()))?;
                if !lifecycle.started_at.is_some_and(|existing| existing <= started_at) {
                    lifecycle.started_at = Some(started_at);
                }
                session.contract = Some(contract);
            }
            Self::End { ended_at } => {
                let lifecycle = session
                    .lifecycle
                    .as_mut()
                    .ok_or_else(|| Error::MissingLifecycle(session.id.clone()))?;
                if let Some(existing) = lifecycle.ended_at {
                    return Err(Error::Ended(existing));
                }
                lifecycle.ended_at = Some(ended_at);
            }
            Self::Tally { counts, tally } => {
                if let Some(stored) = session.tally {
                    if stored.block > tally.block {
                        return Err(Error::Stale(stored.block));
                    }
                }
                for (id, votes) in counts {
                    session.ballot.set_votes(&id, votes);
                }
                session.tally = Some(tally);
            }
            Self::Admit { candidate } => {
                session.ballot.admit(candidate);
            }
            Self::Edit { patch, at } => patch.apply(session, at),
        }
        Ok(())
    }
}

/// Move a request out of its pending state.
///
/// Resolving to the current status is a no-op. Resolving an already resolved request to a
/// different status fails with [Error::Resolved].
pub fn resolve<S: Copy + PartialEq>(
    id: &RequestId,
    current: &mut S,
    pending: S,
    target: S,
) -> Result<(), Error> {
    if *current == target {
        return Ok(());
    }
    if *current != pending {
        return Err(Error::Resolved(id.clone()));
    }
    *current = target;
    Ok(())
}

/// Await a store call for at most `timeout`, mapping expiry to [Error::Timeout].
pub(crate) async fn within<E: Clock, T>(
    context: &E,
    timeout: Duration,
    call: impl Future<Output = Result<T, Error>>,
) -> Result<T, Error> {
    bounded(context, timeout, call)
        .await
        .unwrap_or(Err(Error::Timeout(timeout)))
}

/// Persistence for sessions, edit requests, and candidate requests.
pub trait Store: Clone + Send + Sync + 'static {
    /// Fetch a session.
    fn get(&self, id: &SessionId) -> impl Future<Output = Result<Session, Error>> + Send;

    /// Atomically apply an [Update], returning the stored session afterwards.
    fn update(
        &self,
        id: &SessionId,
        update: Update,
    ) -> impl Future<Output = Result<Session, Error>> + Send;

    /// Create a pending [EditRequest].
    fn create_edit_request(
        &self,
        session: &SessionId,
        proposed_by: Identity,
        patch: Patch,
        created_at: SystemTime,
    ) -> impl Future<Output = Result<EditRequest, Error>> + Send;

    /// Fetch an [EditRequest].
    fn edit_request(&self, id: &RequestId)
        -> impl Future<Output = Result<EditRequest, Error>> + Send;

    /// List the [EditRequest]s of a session, oldest first.
    fn edit_requests(
        &self,
        session: &SessionId,
    ) -> impl Future<Output = Result<Vec<EditRequest>, Error>> + Send;

    /// Resolve a pending [EditRequest] (see [resolve]) without touching the session.
    fn resolve_edit_request(
        &self,
        id: &RequestId,
        status: EditStatus,
    ) -> impl Future<Output = Result<EditRequest, Error>> + Send;

    /// Atomically approve a pending [EditRequest] and apply its patch to the session, returning
    /// the stored session afterwards.
    ///
    /// Fails with [Error::Resolved] (leaving the session untouched) if the request is no longer
    /// pending.
    fn approve_edit_request(
        &self,
        id: &RequestId,
        at: SystemTime,
    ) -> impl Future<Output = Result<Session, Error>> + Send;

    /// Create a pending [CandidateRequest].
    ///
    /// Fails with [Error::Duplicate] if the identity already has a pending or accepted request for
    /// the session.
    fn create_candidate_request(
        &self,
        session: &SessionId,
        identity: Identity,
        profile: Profile,
        requested_at: SystemTime,
    ) -> impl Future<Output = Result<CandidateRequest, Error>> + Send;

    /// Fetch a [CandidateRequest].
    fn candidate_request(
        &self,
        id: &RequestId,
    ) -> impl Future<Output = Result<CandidateRequest, Error>> + Send;

    /// List the [CandidateRequest]s of a session, oldest first.
    fn candidate_requests(
        &self,
        session: &SessionId,
    ) -> impl Future<Output = Result<Vec<CandidateRequest>, Error>> + Send;

    /// Resolve a pending [CandidateRequest] (see [resolve]) without touching the roster.
    fn resolve_candidate_request(
        &self,
        id: &RequestId,
        status: AdmissionStatus,
    ) -> impl Future<Output = Result<CandidateRequest, Error>> + Send;

    /// Atomically accept a pending [CandidateRequest] and admit its candidate (see
    /// [Update::Admit]).
    ///
    /// Fails with [Error::Resolved] (leaving the roster untouched) if the request is no longer
    /// pending.
    fn accept_candidate_request(
        &self,
        id: &RequestId,
    ) -> impl Future<Output = Result<CandidateRequest, Error>> + Send;
}
