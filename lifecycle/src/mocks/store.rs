//! In-memory [crate::store::Store] and a wrapper that slows it down.

use crate::{
    store::{self, resolve, Error, Store as _, Update},
    types::{
        AdmissionStatus, CandidateRequest, EditRequest, EditStatus, Identity, Patch, Profile,
        RequestId, Session, SessionId,
    },
};
use commonware_runtime::Clock;
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};

#[derive(Default)]
struct State {
    sessions: BTreeMap<SessionId, Session>,
    edits: BTreeMap<RequestId, EditRequest>,
    nominations: BTreeMap<RequestId, CandidateRequest>,
    next_request: u64,

    /// Number of upcoming updates to fail
    failing_updates: usize,

    /// Updates applied (successfully or not)
    updates: usize,
}

impl State {
    fn request_id(&mut self) -> RequestId {
        self.next_request += 1;
        RequestId::new(format!("request-{}", self.next_request))
    }
}

/// A [crate::store::Store] that keeps every document in memory.
///
/// Each call takes a single lock, so every [Update] is atomic.
#[derive(Clone, Default)]
pub struct Store {
    state: Arc<Mutex<State>>,
}

impl Store {
    /// Create a store containing `sessions`.
    pub fn new(sessions: impl IntoIterator<Item = Session>) -> Self {
        let store = Self::default();
        for session in sessions {
            store.insert(session);
        }
        store
    }

    /// Insert (or replace) a session document.
    pub fn insert(&self, session: Session) {
        let mut state = self.state.lock().unwrap();
        state.sessions.insert(session.id.clone(), session);
    }

    /// Read a session document without going through the async interface.
    pub fn session(&self, id: &SessionId) -> Option<Session> {
        self.state.lock().unwrap().sessions.get(id).cloned()
    }

    /// Fail the next `count` calls to [crate::store::Store::update].
    pub fn fail_updates(&self, count: usize) {
        self.state.lock().unwrap().failing_updates = count;
    }

    /// Number of calls made to [crate::store::Store::update].
    pub fn updates(&self) -> usize {
        self.state.lock().unwrap().updates
    }
}

impl store::Store for Store {
    async fn get(&self, id: &SessionId) -> Result<Session, Error> {
        let state = self.state.lock().unwrap();
        state
            .sessions
            .get(id)
            .cloned()
            .ok_or_else(|| Error::SessionNotFound(id.clone()))
    }

    async fn update(&self, id: &SessionId, update: Update) -> Result<Session, Error> {
        let mut state = self.state.lock().unwrap();
        state.updates += 1;
        if state.failing_updates > 0 {
            state.failing_updates -= 1;
            return Err(Error::Unavailable("injected failure".into()));
        }
        let session = state
            .sessions
            .get_mut(id)
            .ok_or_else(|| Error::SessionNotFound(id.clone()))?;

        // Apply to a copy so a failed update leaves the document untouched
        let mut updated = session.clone();
        update.apply(&mut updated)?;
        *session = updated.clone();
        Ok(updated)
    }

    async fn create_edit_request(
        &self,
        session: &SessionId,
        proposed_by: Identity,
        patch: Patch,
        created_at: SystemTime,
    ) -> Result<EditRequest, Error> {
        let mut state = self.state.lock().unwrap();
        if !state.sessions.contains_key(session) {
            return Err(Error::SessionNotFound(session.clone()));
        }
        let request = EditRequest {
            id: state.request_id(),
            session: session.clone(),
            proposed_by,
            patch,
            status: EditStatus::Pending,
            created_at,
        };
        state.edits.insert(request.id.clone(), request.clone());
        Ok(request)
    }

    async fn edit_request(&self, id: &RequestId) -> Result<EditRequest, Error> {
        let state = self.state.lock().unwrap();
        state
            .edits
            .get(id)
            .cloned()
            .ok_or_else(|| Error::RequestNotFound(id.clone()))
    }

    async fn edit_requests(&self, session: &SessionId) -> Result<Vec<EditRequest>, Error> {
        let state = self.state.lock().unwrap();
        let mut requests: Vec<_> = state
            .edits
            .values()
            .filter(|r| &r.session == session)
            .cloned()
            .collect();
        requests.sort_by_key(|r| r.created_at);
        Ok(requests)
    }

    async fn resolve_edit_request(
        &self,
        id: &RequestId,
        status: EditStatus,
    ) -> Result<EditRequest, Error> {
        let mut state = self.state.lock().unwrap();
        let request = state
            .edits
            .get_mut(id)
            .ok_or_else(|| Error::RequestNotFound(id.clone()))?;
        resolve(id, &mut request.status, EditStatus::Pending, status)?;
        Ok(request.clone())
    }

    async fn approve_edit_request(&self, id: &RequestId, at: SystemTime) -> Result<Session, Error> {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        let request = state
            .edits
            .get_mut(id)
            .ok_or_else(|| Error::RequestNotFound(id.clone()))?;
        if request.status != EditStatus::Pending {
            return Err(Error::Resolved(id.clone()));
        }
        let session = state
            .sessions
            .get_mut(&request.session)
            .ok_or_else(|| Error::SessionNotFound(request.session.clone()))?;
        let mut updated = session.clone();
        Update::Edit {
            patch: request.patch.clone(),
            at,
        }
        .apply(&mut updated)?;
        *session = updated.clone();
        request.status = EditStatus::Approved;
        Ok(updated)
    }

    async fn create_candidate_request(
        &self,
        session: &SessionId,
        identity: Identity,
        profile: Profile,
        requested_at: SystemTime,
    ) -> Result<CandidateRequest, Error> {
        let mut state = self.state.lock().unwrap();
        if !state.sessions.contains_key(session) {
            return Err(Error::SessionNotFound(session.clone()));
        }
        if let Some(existing) = state
            .nominations
            .values()
            .find(|r| &r.session == session && r.identity == identity && r.is_open())
        {
            return Err(Error::Duplicate(existing.id.clone()));
        }
        let request = CandidateRequest {
            id: state.request_id(),
            session: session.clone(),
            identity,
            profile,
            status: AdmissionStatus::Pending,
            requested_at,
        };
        state
            .nominations
            .insert(request.id.clone(), request.clone());
        Ok(request)
    }

    async fn candidate_request(&self, id: &RequestId) -> Result<CandidateRequest, Error> {
        let state = self.state.lock().unwrap();
        state
            .nominations
            .get(id)
            .cloned()
            .ok_or_else(|| Error::RequestNotFound(id.clone()))
    }

    async fn candidate_requests(&self, session: &SessionId) -> Result<Vec<CandidateRequest>, Error> {
        let state = self.state.lock().unwrap();
        let mut requests: Vec<_> = state
            .nominations
            .values()
            .filter(|r| &r.session == session)
            .cloned()
            .collect();
        requests.sort_by_key(|r| r.requested_at);
        Ok(requests)
    }

    async fn resolve_candidate_request(
        &self,
        id: &RequestId,
        status: AdmissionStatus,
    ) -> Result<CandidateRequest, Error> {
        let mut state = self.state.lock().unwrap();
        let request = state
            .nominations
            .get_mut(id)
            .ok_or_else(|| Error::RequestNotFound(id.clone()))?;
        resolve(id, &mut request.status, AdmissionStatus::Pending, status)?;
        Ok(request.clone())
    }

    async fn accept_candidate_request(&self, id: &RequestId) -> Result<CandidateRequest, Error> {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        let request = state
            .nominations
            .get_mut(id)
            .ok_or_else(|| Error::RequestNotFound(id.clone()))?;
        if request.status != AdmissionStatus::Pending {
            return Err(Error::Resolved(id.clone()));
        }
        let session = state
            .sessions
            .get_mut(&request.session)
            .ok_or_else(|| Error::SessionNotFound(request.session.clone()))?;
        Update::Admit {
            candidate: request.candidate(),
        }
        .apply(session)?;
        request.status = AdmissionStatus::Accepted;
        Ok(request.clone())
    }
}

/// A [Store] whose mutating calls wait for a fixed delay before reaching the documents.
#[derive(Clone)]
pub struct Delayed<E: Clock> {
    context: E,
    inner: Store,
    delay: Duration,
}

impl<E: Clock> Delayed<E> {
    pub fn new(context: E, inner: Store, delay: Duration) -> Self {
        Self {
            context,
            inner,
            delay,
        }
    }
}

impl<E: Clock> store::Store for Delayed<E> {
    async fn get(&self, id: &SessionId) -> Result<Session, Error> {
        self.inner.get(id).await
    }

    async fn update(&self, id: &SessionId, update: Update) -> Result<Session, Error> {
        self.context.sleep(self.delay).await;
        self.inner.update(id, update).await
    }

    async fn create_edit_request(
        &self,
        session: &SessionId,
        proposed_by: Identity,
        patch: Patch,
        created_at: SystemTime,
    ) -> Result<EditRequest, Error> {
        self.inner
            .create_edit_request(session, proposed_by, patch, created_at)
            .await
    }

    async fn edit_request(&self, id: &RequestId) -> Result<EditRequest, Error> {
        self.inner.edit_request(id).await
    }

    async fn edit_requests(&self, session: &SessionId) -> Result<Vec<EditRequest>, Error> {
        self.inner.edit_requests(session).await
    }

    async fn resolve_edit_request(
        &self,
        id: &RequestId,
        status: EditStatus,
    ) -> Result<EditRequest, Error> {
        self.context.sleep(self.delay).await;
        self.inner.resolve_edit_request(id, status).await
    }

    async fn approve_edit_request(&self, id: &RequestId, at: SystemTime) -> Result<Session, Error> {
        self.context.sleep(self.delay).await;
        self.inner.approve_edit_request(id, at).await
    }

    async fn create_candidate_request(
        &self,
        session: &SessionId,
        identity: Identity,
        profile: Profile,
        requested_at: SystemTime,
    ) -> Result<CandidateRequest, Error> {
        self.inner
            .create_candidate_request(session, identity, profile, requested_at)
            .await
    }

    async fn candidate_request(&self, id: &RequestId) -> Result<CandidateRequest, Error> {
        self.inner.candidate_request(id).await
    }

    async fn candidate_requests(&self, session: &SessionId) -> Result<Vec<CandidateRequest>, Error> {
        self.inner.candidate_requests(session).await
    }

    async fn resolve_candidate_request(
        &self,
        id: &RequestId,
        status: AdmissionStatus,
    ) -> Result<CandidateRequest, Error> {
        self.context.sleep(self.delay).await;
        self.inner.resolve_candidate_request(id, status).await
    }

    async fn accept_candidate_request(&self, id: &RequestId) -> Result<CandidateRequest, Error> {
        self.context.sleep(self.delay).await;
        self.inner.accept_candidate_request(id).await
    }
}
