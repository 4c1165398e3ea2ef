//! Decide whether an edit to a session applies immediately or is queued for approval.
//!
//! Which fields of a session may change depends on whether voting has opened ([Status::is_live]):
//!
//! | Fields                                           | Live          | Pre-live |
//! |--------------------------------------------------|---------------|----------|
//! | name, description, organization                  | applied       | applied  |
//! | window, mode                                     | locked        | applied  |
//! | roster                                           | locked        | applied  |
//! | verification, visibility, secret phrase, access  | governed      | applied  |
//!
//! A patch is handled as a whole: if it touches any locked field it is rejected, and if it touches
//! any governed field while the session is live it is queued as an [EditRequest] unless the actor
//! may edit directly (a [Role::Leader], or any member of a session with `direct_edit` enabled).
//!
//! Election candidates are never added through a patch. They join through [crate::admission].

use crate::{
    status::{resolve, Status},
    store::{self, within, Store, Update},
    types::{
        EditRequest, EditStatus, Field, Identity, Kind, Patch, RequestId, RosterChange, Session,
        SessionId,
    },
    Config, Event, Reporter,
};
use commonware_runtime::Clock;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Errors that can occur when proposing or resolving an edit.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("{0:?} cannot change while {1}")]
    Locked(Field, Status),
    #[error("candidates must be admitted through a nomination")]
    AdmissionRequired,
    #[error("patch is empty")]
    EmptyPatch,
    #[error("window ends before it starts")]
    InvalidWindow,
    #[error("request already resolved: {0}")]
    AlreadyResolved(RequestId),
    #[error("store error: {0}")]
    Store(store::Error),
}

impl From<store::Error> for Error {
    fn from(err: store::Error) -> Self {
        match err {
            store::Error::Resolved(id) => Self::AlreadyResolved(id),
            err => Self::Store(err),
        }
    }
}

/// Role of a team member within the organization that owns a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Leader,
    Member,
}

/// The team member proposing an edit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Actor {
    pub identity: Identity,
    pub role: Role,
}

impl Actor {
    pub fn leader(identity: impl Into<String>) -> Self {
        Self {
            identity: Identity::new(identity),
            role: Role::Leader,
        }
    }

    pub fn member(identity: impl Into<String>) -> Self {
        Self {
            identity: Identity::new(identity),
            role: Role::Member,
        }
    }
}

/// How a field is treated once a session is live.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Gate {
    Free,
    Locked,
    Governed,
}

fn gate(field: Field) -> Gate {
    match field {
        Field::Name | Field::Description | Field::Organization => Gate::Free,
        Field::Window | Field::Mode | Field::Roster => Gate::Locked,
        Field::Verification | Field::Visibility | Field::SecretPhrase | Field::Access => {
            Gate::Governed
        }
    }
}

/// What to do with a permitted patch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Apply,
    Queue,
}

/// Check that `patch` may be applied to `session` in `status` at all.
fn check(session: &Session, patch: &Patch, status: Status) -> Result<(), Error> {
    let fields = patch.fields();
    if fields.is_empty() {
        return Err(Error::EmptyPatch);
    }
    if status.is_live() {
        if let Some(field) = fields.iter().find(|f| gate(**f) == Gate::Locked) {
            return Err(Error::Locked(*field, status));
        }
    }
    if session.started_at().is_some() && fields.contains(&Field::Mode) {
        return Err(Error::Locked(Field::Mode, status));
    }
    if patch.window.is_some_and(|w| !w.is_ordered()) {
        return Err(Error::InvalidWindow);
    }
    if session.kind() == Kind::Election
        && patch
            .roster
            .iter()
            .any(|change| matches!(change, RosterChange::Add(_)))
    {
        return Err(Error::AdmissionRequired);
    }
    Ok(())
}

/// Decide how `actor` may apply `patch` to `session` in `status`.
pub fn decide(
    session: &Session,
    patch: &Patch,
    actor: &Actor,
    status: Status,
) -> Result<Decision, Error> {
    check(session, patch, status)?;
    let governed = patch.fields().into_iter().any(|f| gate(f) == Gate::Governed);
    let direct = actor.role == Role::Leader || session.direct_edit;
    if status.is_live() && governed && !direct {
        return Ok(Decision::Queue);
    }
    Ok(Decision::Apply)
}

/// Result of [Governor::propose].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Proposal {
    /// The patch was applied.
    Applied(Session),

    /// The patch awaits approval.
    Queued(EditRequest),
}

/// Applies or queues edits to sessions.
#[derive(Clone)]
pub struct Governor<E: Clock, S: Store, R: Reporter> {
    context: E,
    store: S,
    reporter: R,
    store_timeout: Duration,
}

impl<E: Clock, S: Store, R: Reporter> Governor<E, S, R> {
    pub fn new(context: E, store: S, reporter: R, cfg: &Config) -> Self {
        Self {
            context,
            store,
            reporter,
            store_timeout: cfg.store_timeout,
        }
    }

    async fn get(&self, id: &SessionId) -> Result<Session, store::Error> {
        within(&self.context, self.store_timeout, self.store.get(id)).await
    }

    async fn apply(&self, id: &SessionId, patch: Patch) -> Result<Session, store::Error> {
        let update = Update::Edit {
            patch,
            at: self.context.current(),
        };
        within(&self.context, self.store_timeout, self.store.update(id, update)).await
    }

    /// Propose a patch to a session.
    pub async fn propose(
        &mut self,
        id: &SessionId,
        patch: Patch,
        actor: &Actor,
    ) -> Result<Proposal, Error> {
        let session = self.get(id).await?;
        let status = resolve(&session, self.context.current());
        match decide(&session, &patch, actor, status)? {
            Decision::Apply => {
                let fields = patch.fields();
                let session = self.apply(id, patch).await?;
                debug!(session = %id, actor = %actor.identity, ?fields, "applied edit");
                Ok(Proposal::Applied(session))
            }
            Decision::Queue => {
                let request = within(
                    &self.context,
                    self.store_timeout,
                    self.store.create_edit_request(
                        id,
                        actor.identity.clone(),
                        patch,
                        self.context.current(),
                    ),
                )
                .await?;
                info!(session = %id, request = %request.id, actor = %actor.identity, "queued edit");
                self.reporter
                    .report(Event::EditRequestCreated {
                        session: id.clone(),
                        request: request.id.clone(),
                    })
                    .await;
                Ok(Proposal::Queued(request))
            }
        }
    }

    /// Apply a queued patch and mark its request approved.
    ///
    /// The patch is checked again against the current status of the session. Approving an approved
    /// request returns the session unchanged. The patch and the approval are written in one store
    /// operation, so a request rejected concurrently never has its patch applied.
    pub async fn approve(&mut self, request: &RequestId) -> Result<Session, Error> {
        let pending = within(
            &self.context,
            self.store_timeout,
            self.store.edit_request(request),
        )
        .await?;
        match pending.status {
            EditStatus::Pending => {}
            EditStatus::Approved => return Ok(self.get(&pending.session).await?),
            EditStatus::Rejected => return Err(Error::AlreadyResolved(request.clone())),
        }

        let session = self.get(&pending.session).await?;
        check(
            &session,
            &pending.patch,
            resolve(&session, self.context.current()),
        )?;
        let approved = within(
            &self.context,
            self.store_timeout,
            self.store
                .approve_edit_request(request, self.context.current()),
        )
        .await;
        match approved {
            Ok(session) => {
                info!(session = %session.id, %request, "approved edit");
                Ok(session)
            }
            Err(store::Error::Resolved(_)) => {
                // Resolved concurrently
                let resolved = within(
                    &self.context,
                    self.store_timeout,
                    self.store.edit_request(request),
                )
                .await?;
                if resolved.status != EditStatus::Approved {
                    return Err(Error::AlreadyResolved(request.clone()));
                }
                Ok(self.get(&pending.session).await?)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Mark a queued request rejected without applying it.
    pub async fn reject(&mut self, request: &RequestId) -> Result<EditRequest, Error> {
        let rejected = within(
            &self.context,
            self.store_timeout,
            self.store
                .resolve_edit_request(request, EditStatus::Rejected),
        )
        .await?;
        info!(session = %rejected.session, %request, "rejected edit");
        Ok(rejected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mocks::{self, address, at, election, poll, window},
        types::{Choice, ChoiceId, Mode, Verification, Visibility},
    };
    use commonware_macros::test_traced;
    use commonware_runtime::{deterministic, Metrics, Runner, Spawner};

    fn patch(field: Field) -> Patch {
        let mut patch = Patch::default();
        match field {
            Field::Name => patch.name = Some("renamed".into()),
            Field::Description => patch.description = Some("about".into()),
            Field::Organization => patch.organization = Some("org".into()),
            Field::Window => patch.window = Some(window(10, 20)),
            Field::Mode => patch.mode = Some(Mode::Multiple),
            Field::Roster => patch.roster = vec![RosterChange::Add(Choice::new("c", "C"))],
            Field::Verification => patch.verification = Some(Verification::Kyc),
            Field::Visibility => patch.visibility = Some(Visibility::AfterEnd),
            Field::SecretPhrase => patch.secret_phrase = Some("hunter2".into()),
            Field::Access => patch.access = Some(crate::types::Access::Private),
        }
        patch
    }

    const FIELDS: [Field; 10] = [
        Field::Name,
        Field::Description,
        Field::Organization,
        Field::Window,
        Field::Mode,
        Field::Roster,
        Field::Verification,
        Field::Visibility,
        Field::SecretPhrase,
        Field::Access,
    ];

    #[test]
    fn test_gating_table() {
        let upcoming = poll("p", &["a", "b"]);
        let mut active = upcoming.clone();
        active.lifecycle.as_mut().unwrap().started_at = Some(at(0));
        active.contract = Some(address(1));
        let mut ended = active.clone();
        ended.lifecycle.as_mut().unwrap().ended_at = Some(at(0));
        let mut pending = upcoming.clone();
        pending.lifecycle.as_mut().unwrap().started_at = Some(at(0));
        let mut nominating = election("e", &["alice", "bob"]);
        nominating.lifecycle.as_mut().unwrap().window = Some(window(0, 100));

        let leader = Actor::leader("lead");
        let member = Actor::member("member");
        for field in FIELDS {
            let patch = patch(field);

            // Pre-live: everything applies directly
            for status in [Status::Upcoming, Status::ReadyToStart, Status::Unknown] {
                assert_eq!(
                    decide(&upcoming, &patch, &member, status),
                    Ok(Decision::Apply),
                    "{field:?} in {status}"
                );
            }

            // Nomination is pre-live, but candidates only join through admission
            let expected = match field {
                Field::Roster => Err(Error::AdmissionRequired),
                _ => Ok(Decision::Apply),
            };
            for actor in [&member, &leader] {
                assert_eq!(
                    decide(&nominating, &patch, actor, Status::Nomination),
                    expected,
                    "{field:?} in nomination"
                );
            }

            // Live
            for (session, status) in [
                (&active, Status::Active),
                (&ended, Status::Ended),
                (&pending, Status::PendingDeployment),
            ] {
                let (as_member, as_leader) = match gate(field) {
                    Gate::Free => (Ok(Decision::Apply), Ok(Decision::Apply)),
                    Gate::Locked => (
                        Err(Error::Locked(field, status)),
                        Err(Error::Locked(field, status)),
                    ),
                    Gate::Governed => (Ok(Decision::Queue), Ok(Decision::Apply)),
                };
                assert_eq!(decide(session, &patch, &member, status), as_member);
                assert_eq!(decide(session, &patch, &leader, status), as_leader);
            }
        }
    }

    #[test]
    fn test_direct_edit_allows_members() {
        let mut session = poll("p", &["a"]);
        session.lifecycle.as_mut().unwrap().started_at = Some(at(0));
        session.contract = Some(address(1));
        session.direct_edit = true;
        assert_eq!(
            decide(
                &session,
                &patch(Field::Visibility),
                &Actor::member("m"),
                Status::Active
            ),
            Ok(Decision::Apply)
        );
    }

    #[test]
    fn test_patch_is_handled_whole() {
        let mut session = poll("p", &["a"]);
        session.lifecycle.as_mut().unwrap().started_at = Some(at(0));
        session.contract = Some(address(1));
        let member = Actor::member("m");

        // One locked field rejects the whole patch
        let mixed = Patch {
            name: Some("renamed".into()),
            window: Some(window(10, 20)),
            ..Default::default()
        };
        assert_eq!(
            decide(&session, &mixed, &member, Status::Active),
            Err(Error::Locked(Field::Window, Status::Active))
        );

        // One governed field queues the whole patch
        let mixed = Patch {
            name: Some("renamed".into()),
            visibility: Some(Visibility::AfterEnd),
            ..Default::default()
        };
        assert_eq!(
            decide(&session, &mixed, &member, Status::Active),
            Ok(Decision::Queue)
        );
    }

    #[test]
    fn test_invalid_patches() {
        let session = poll("p", &["a"]);
        let member = Actor::member("m");
        assert_eq!(
            decide(&session, &Patch::default(), &member, Status::Upcoming),
            Err(Error::EmptyPatch)
        );
        let reversed = Patch {
            window: Some(window(20, 10)),
            ..Default::default()
        };
        assert_eq!(
            decide(&session, &reversed, &member, Status::Upcoming),
            Err(Error::InvalidWindow)
        );
    }

    #[test]
    fn test_election_roster_requires_admission() {
        let session = election("e", &["alice", "bob"]);
        let leader = Actor::leader("l");
        assert_eq!(
            decide(&session, &patch(Field::Roster), &leader, Status::Nomination),
            Err(Error::AdmissionRequired)
        );
        let remove = Patch {
            roster: vec![RosterChange::Remove(ChoiceId::from("bob"))],
            ..Default::default()
        };
        assert_eq!(
            decide(&session, &remove, &leader, Status::Nomination),
            Ok(Decision::Apply)
        );
    }

    fn live() -> Session {
        let mut session = poll("p", &["a", "b"]);
        session.lifecycle.as_mut().unwrap().started_at = Some(at(0));
        session.contract = Some(address(1));
        session
    }

    fn setup(
        context: &deterministic::Context,
        session: Session,
    ) -> (
        Governor<deterministic::Context, mocks::Store, mocks::Reporter>,
        mocks::Store,
        mocks::Reporter,
    ) {
        let store = mocks::Store::new([session]);
        let reporter = mocks::Reporter::new();
        let governor = Governor::new(
            context.clone(),
            store.clone(),
            reporter.clone(),
            &Config::default(),
        );
        (governor, store, reporter)
    }

    #[test_traced]
    fn test_propose_applies_or_queues() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (mut governor, store, reporter) = setup(&context, live());
            let id = SessionId::from("p");
            let member = Actor::member("m");

            let proposal = governor
                .propose(&id, patch(Field::Name), &member)
                .await
                .unwrap();
            let Proposal::Applied(session) = proposal else {
                panic!("unexpected proposal: {proposal:?}");
            };
            assert_eq!(session.name, "renamed");

            let proposal = governor
                .propose(&id, patch(Field::Visibility), &member)
                .await
                .unwrap();
            let Proposal::Queued(request) = proposal else {
                panic!("unexpected proposal: {proposal:?}");
            };
            assert_eq!(request.status, EditStatus::Pending);
            assert_eq!(request.proposed_by, Identity::from("m"));
            assert_eq!(
                store.session(&id).unwrap().settings.visibility,
                Visibility::RealTime
            );
            assert_eq!(
                reporter.events(),
                vec![Event::EditRequestCreated {
                    session: id.clone(),
                    request: request.id.clone(),
                }]
            );

            let err = governor
                .propose(&id, patch(Field::Roster), &member)
                .await
                .unwrap_err();
            assert_eq!(err, Error::Locked(Field::Roster, Status::Active));
            assert_eq!(store.session(&id).unwrap().ballot.len(), 2);
        });
    }

    #[test_traced]
    fn test_approve_and_reject_are_terminal() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (mut governor, store, _) = setup(&context, live());
            let id = SessionId::from("p");
            let member = Actor::member("m");

            let Proposal::Queued(first) = governor
                .propose(&id, patch(Field::Visibility), &member)
                .await
                .unwrap()
            else {
                panic!("expected queued proposal");
            };
            let session = governor.approve(&first.id).await.unwrap();
            assert_eq!(session.settings.visibility, Visibility::AfterEnd);
            assert_eq!(
                store.edit_requests(&id).await.unwrap()[0].status,
                EditStatus::Approved
            );

            // Approving again is a no-op, rejecting is not allowed
            governor.approve(&first.id).await.unwrap();
            assert_eq!(
                governor.reject(&first.id).await,
                Err(Error::AlreadyResolved(first.id.clone()))
            );

            let Proposal::Queued(second) = governor
                .propose(&id, patch(Field::Access), &member)
                .await
                .unwrap()
            else {
                panic!("expected queued proposal");
            };
            let rejected = governor.reject(&second.id).await.unwrap();
            assert_eq!(rejected.status, EditStatus::Rejected);
            governor.reject(&second.id).await.unwrap();
            assert_eq!(
                governor.approve(&second.id).await,
                Err(Error::AlreadyResolved(second.id.clone()))
            );
            assert_eq!(
                store.session(&id).unwrap().settings.access,
                crate::types::Access::Public
            );
        });
    }

    #[test_traced]
    fn test_approve_rechecks_locks() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (mut governor, store, _) = setup(&context, live());
            let id = SessionId::from("p");

            // A request queued before voting opened
            let request = store
                .create_edit_request(&id, Identity::from("m"), patch(Field::Window), at(0))
                .await
                .unwrap();
            assert_eq!(
                governor.approve(&request.id).await,
                Err(Error::Locked(Field::Window, Status::Active))
            );
            assert_eq!(
                store.edit_request(&request.id).await.unwrap().status,
                EditStatus::Pending
            );
        });
    }

    #[test_traced]
    fn test_reject_during_approval_discards_patch() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let store = mocks::Store::new([live()]);
            let id = SessionId::from("p");
            let request = store
                .create_edit_request(&id, Identity::from("m"), patch(Field::Visibility), at(0))
                .await
                .unwrap();

            // The approver's writes reach the store one second late
            let slow = mocks::Delayed::new(context.clone(), store.clone(), Duration::from_secs(1));
            let mut approver =
                Governor::new(context.clone(), slow, mocks::Reporter::new(), &Config::default());
            let approval = context.with_label("approver").spawn({
                let request = request.id.clone();
                move |_| async move { approver.approve(&request).await }
            });

            context.sleep(Duration::from_millis(500)).await;
            let mut rejecter = Governor::new(
                context.clone(),
                store.clone(),
                mocks::Reporter::new(),
                &Config::default(),
            );
            rejecter.reject(&request.id).await.unwrap();

            assert_eq!(
                approval.await.unwrap(),
                Err(Error::AlreadyResolved(request.id.clone()))
            );
            assert_eq!(
                store.session(&id).unwrap().settings.visibility,
                Visibility::RealTime
            );
            assert_eq!(
                store.edit_request(&request.id).await.unwrap().status,
                EditStatus::Rejected
            );
        });
    }
}
