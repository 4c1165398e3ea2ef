//! Accept or refuse nominations during an election's nomination window.
//!
//! Anyone may submit a nomination while an election is in [Status::Nomination]. Each identity may
//! hold at most one open (pending or accepted) nomination per election. Accepting a nomination adds
//! the nominee to the roster with zero votes. Nominations can only be resolved while the window is
//! open, and each is resolved at most once.

use crate::{
    status::{resolve, Status},
    store::{self, within, Store},
    types::{
        AdmissionStatus, CandidateRequest, Identity, Kind, Profile, RequestId, Session, SessionId,
    },
    Config, Event, Reporter,
};
use commonware_runtime::Clock;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Errors that can occur when submitting or resolving a nomination.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("session is not an election")]
    NotElection,
    #[error("nominations are closed: {0}")]
    WindowClosed(Status),
    #[error("nomination already open: {0}")]
    Duplicate(RequestId),
    #[error("nomination already resolved: {0}")]
    AlreadyResolved(RequestId),
    #[error("store error: {0}")]
    Store(store::Error),
}

impl From<store::Error> for Error {
    fn from(err: store::Error) -> Self {
        match err {
            store::Error::Duplicate(id) => Self::Duplicate(id),
            store::Error::Resolved(id) => Self::AlreadyResolved(id),
            err => Self::Store(err),
        }
    }
}

/// Handles nominations for elections.
#[derive(Clone)]
pub struct Admission<E: Clock, S: Store, R: Reporter> {
    context: E,
    store: S,
    reporter: R,
    store_timeout: Duration,
}

impl<E: Clock, S: Store, R: Reporter> Admission<E, S, R> {
    pub fn new(context: E, store: S, reporter: R, cfg: &Config) -> Self {
        Self {
            context,
            store,
            reporter,
            store_timeout: cfg.store_timeout,
        }
    }

    /// Fetch a session and check that it is accepting nominations.
    async fn open(&self, id: &SessionId) -> Result<Session, Error> {
        let session = within(&self.context, self.store_timeout, self.store.get(id)).await?;
        if session.kind() != Kind::Election {
            return Err(Error::NotElection);
        }
        let status = resolve(&session, self.context.current());
        if status != Status::Nomination {
            return Err(Error::WindowClosed(status));
        }
        Ok(session)
    }

    async fn request(&self, id: &RequestId) -> Result<CandidateRequest, Error> {
        Ok(within(
            &self.context,
            self.store_timeout,
            self.store.candidate_request(id),
        )
        .await?)
    }

    /// Submit a nomination.
    pub async fn submit(
        &mut self,
        id: &SessionId,
        identity: Identity,
        profile: Profile,
    ) -> Result<CandidateRequest, Error> {
        self.open(id).await?;
        let request = within(
            &self.context,
            self.store_timeout,
            self.store
                .create_candidate_request(id, identity, profile, self.context.current()),
        )
        .await?;
        info!(session = %id, request = %request.id, identity = %request.identity, "nominated");
        Ok(request)
    }

    /// Accept a nomination, adding the nominee to the roster.
    pub async fn accept(&mut self, request: &RequestId) -> Result<CandidateRequest, Error> {
        let pending = self.request(request).await?;
        match pending.status {
            AdmissionStatus::Pending => {}
            AdmissionStatus::Accepted => return Ok(pending),
            AdmissionStatus::Refused => return Err(Error::AlreadyResolved(request.clone())),
        }
        self.open(&pending.session).await?;

        // Admit and resolve in one step so a concurrent refusal cannot leave the nominee on the roster
        let accepted = match within(
            &self.context,
            self.store_timeout,
            self.store.accept_candidate_request(request),
        )
        .await
        {
            Ok(accepted) => accepted,
            Err(store::Error::Resolved(_)) => {
                let resolved = self.request(request).await?;
                if resolved.status != AdmissionStatus::Accepted {
                    return Err(Error::AlreadyResolved(request.clone()));
                }
                return Ok(resolved);
            }
            Err(err) => return Err(err.into()),
        };
        info!(session = %accepted.session, %request, identity = %accepted.identity, "admitted");
        self.reporter
            .report(Event::CandidateAdmitted {
                session: accepted.session.clone(),
                request: request.clone(),
                candidate: accepted.candidate().id,
            })
            .await;
        Ok(accepted)
    }

    /// Refuse a nomination.
    pub async fn refuse(&mut self, request: &RequestId) -> Result<CandidateRequest, Error> {
        let pending = self.request(request).await?;
        match pending.status {
            AdmissionStatus::Pending => {}
            AdmissionStatus::Refused => return Ok(pending),
            AdmissionStatus::Accepted => return Err(Error::AlreadyResolved(request.clone())),
        }
        self.open(&pending.session).await?;
        let refused = within(
            &self.context,
            self.store_timeout,
            self.store
                .resolve_candidate_request(request, AdmissionStatus::Refused),
        )
        .await?;
        info!(session = %refused.session, %request, "refused");
        Ok(refused)
    }
}
