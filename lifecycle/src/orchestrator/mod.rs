//! Deploy sessions to the ledger and end them.
//!
//! # Deploying
//!
//! [Orchestrator::deploy] validates a session before any side effect, asks the ledger to deploy a
//! contract (bounded by `deploy_timeout`), and records the contract address in the store. The
//! store records at most one contract per session: if two deployments race, the first address
//! recorded wins and the other contract is logged as orphaned. Both callers receive the recorded
//! address.
//!
//! A deployment that the ledger confirmed but the store failed to record is a partial failure.
//! [Error::PartialFailure] carries the confirmed address so that it can be recorded later with
//! [Orchestrator::recover] instead of deploying (and paying for) a second contract.
//!
//! # Ending
//!
//! [Orchestrator::end] always records the end of a session locally. If the ledger fails to close
//! the contract (or does not answer within `ledger_timeout`), the session is still ended and the
//! failure is returned as a warning.

use crate::{
    bounded,
    ledger::{self, Ledger, Params},
    schedule::{self, Action},
    store::{self, within, Store, Update},
    types::{Address, Session, SessionId},
    Config, Event, Reporter,
};
use commonware_runtime::{Clock, Metrics};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{debug, error, info, warn};

mod metrics;

/// Reasons a session cannot be deployed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invalid {
    #[error("session has no lifecycle")]
    MissingLifecycle,
    #[error("session has ended")]
    Ended,
    #[error("roster is empty")]
    EmptyRoster,
    #[error("window ends before it starts")]
    Window,
}

/// Errors that can occur when deploying or ending a session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid session: {0}")]
    Invalid(#[from] Invalid),
    #[error("store error: {0}")]
    Store(#[from] store::Error),
    #[error("ledger error: {0}")]
    Ledger(#[from] ledger::Error),
    #[error("ledger timed out after {0:?}")]
    Timeout(Duration),
    #[error("deployed {address} but failed to record it: {source}")]
    PartialFailure {
        address: Address,
        source: store::Error,
    },
}

/// A session with a recorded contract.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Deployment {
    /// The contract recorded for the session.
    pub address: Address,

    /// The session as stored after the deployment was recorded.
    pub session: Session,
}

/// Result of ending a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EndOutcome {
    /// The ledger closed the contract and the end was recorded.
    Ended { at: SystemTime },

    /// The end was recorded but the ledger did not confirm that voting closed.
    EndedWithLedgerWarning { at: SystemTime, warning: String },

    /// The session was never deployed, so only the end was recorded.
    EndedLocalOnly { at: SystemTime },

    /// The session had already ended.
    AlreadyEnded { at: SystemTime },
}

impl EndOutcome {
    /// When the session ended.
    pub fn at(&self) -> SystemTime {
        match self {
            Self::Ended { at }
            | Self::EndedWithLedgerWarning { at, .. }
            | Self::EndedLocalOnly { at }
            | Self::AlreadyEnded { at } => *at,
        }
    }
}

/// Result of [Orchestrator::advance].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Advanced {
    Started(Deployment),
    Ended(EndOutcome),
}

/// Check that a session can be deployed.
fn validate(session: &Session) -> Result<(), Invalid> {
    let lifecycle = session
        .lifecycle
        .as_ref()
        .ok_or(Invalid::MissingLifecycle)?;
    if lifecycle.ended_at.is_some() {
        return Err(Invalid::Ended);
    }
    if session.ballot.is_empty() {
        return Err(Invalid::EmptyRoster);
    }
    if lifecycle.window.is_some_and(|w| !w.is_ordered()) {
        return Err(Invalid::Window);
    }
    Ok(())
}

/// Deploys and ends sessions.
#[derive(Clone)]
pub struct Orchestrator<E: Clock + Metrics, S: Store, L: Ledger, R: Reporter> {
    context: E,
    store: S,
    ledger: L,
    reporter: R,

    deploy_timeout: Duration,
    ledger_timeout: Duration,
    store_timeout: Duration,

    metrics: metrics::Metrics,
}

impl<E: Clock + Metrics, S: Store, L: Ledger, R: Reporter> Orchestrator<E, S, L, R> {
    pub fn new(context: E, store: S, ledger: L, reporter: R, cfg: &Config) -> Self {
        let metrics = metrics::Metrics::init(&context);
        Self {
            context,
            store,
            ledger,
            reporter,
            deploy_timeout: cfg.deploy_timeout,
            ledger_timeout: cfg.ledger_timeout,
            store_timeout: cfg.store_timeout,
            metrics,
        }
    }

    async fn get(&self, id: &SessionId) -> Result<Session, store::Error> {
        within(&self.context, self.store_timeout, self.store.get(id)).await
    }

    async fn update(&self, id: &SessionId, update: Update) -> Result<Session, store::Error> {
        within(&self.context, self.store_timeout, self.store.update(id, update)).await
    }

    /// Deploy a session, returning the recorded contract.
    ///
    /// If a contract is already recorded, it is returned without calling the ledger.
    pub async fn deploy(&mut self, id: &SessionId) -> Result<Deployment, Error> {
        let session = self.get(id).await?;
        if let Some(address) = session.contract {
            debug!(session = %id, %address, "already deployed");
            return Ok(Deployment { address, session });
        }
        validate(&session)?;

        // Deploy the contract
        let params = Params::from_session(&session);
        let address = match bounded(&self.context, self.deploy_timeout, self.ledger.deploy(params))
            .await
        {
            Ok(Ok(address)) => address,
            Ok(Err(err)) => return Err(self.failed(id, Error::Ledger(err)).await),
            Err(_) => return Err(self.failed(id, Error::Timeout(self.deploy_timeout)).await),
        };
        self.record(id, address).await
    }

    /// Record a contract that was deployed for a session but never recorded.
    ///
    /// Follows the same rules as [Orchestrator::deploy] without calling the ledger.
    pub async fn recover(&mut self, id: &SessionId, address: Address) -> Result<Deployment, Error> {
        self.record(id, address).await
    }

    async fn record(&mut self, id: &SessionId, address: Address) -> Result<Deployment, Error> {
        let update = Update::Deploy {
            contract: address,
            started_at: self.context.current(),
        };
        match self.update(id, update).await {
            Ok(session) => {
                self.metrics.deployments.inc();
                info!(session = %id, %address, "deployed");
                self.reporter
                    .report(Event::DeploymentSucceeded {
                        session: id.clone(),
                        contract: address,
                    })
                    .await;
                Ok(Deployment { address, session })
            }
            Err(store::Error::Conflict(recorded)) => {
                self.metrics.orphaned.inc();
                warn!(session = %id, orphaned = %address, %recorded, "contract already recorded");
                let session = self.get(id).await?;
                Ok(Deployment {
                    address: recorded,
                    session,
                })
            }
            Err(source) => {
                self.metrics.partial_failures.inc();
                error!(session = %id, %address, ?source, "failed to record deployed contract");
                let err = Error::PartialFailure { address, source };
                self.reporter
                    .report(Event::DeploymentFailed {
                        session: id.clone(),
                        reason: err.to_string(),
                    })
                    .await;
                Err(err)
            }
        }
    }

    async fn failed(&mut self, id: &SessionId, err: Error) -> Error {
        self.metrics.deploy_failures.inc();
        warn!(session = %id, ?err, "deployment failed");
        self.reporter
            .report(Event::DeploymentFailed {
                session: id.clone(),
                reason: err.to_string(),
            })
            .await;
        err
    }

    /// End a session.
    pub async fn end(&mut self, id: &SessionId) -> Result<EndOutcome, Error> {
        let session = self.get(id).await?;
        let lifecycle = session
            .lifecycle
            .as_ref()
            .ok_or(Invalid::MissingLifecycle)?;
        if let Some(at) = lifecycle.ended_at {
            debug!(session = %id, "already ended");
            return Ok(EndOutcome::AlreadyEnded { at });
        }

        // Close the contract (if any)
        let warning = match session.contract {
            None => None,
            Some(contract) => {
                match bounded(&self.context, self.ledger_timeout, self.ledger.end(contract)).await
                {
                    Ok(Ok(true)) => None,
                    Ok(Ok(false)) => Some("ledger declined to end contract".to_string()),
                    Ok(Err(err)) => Some(err.to_string()),
                    Err(_) => Some(format!("ledger timed out after {:?}", self.ledger_timeout)),
                }
            }
        };

        // Record the end even if the ledger failed
        let at = self.context.current();
        match self.update(id, Update::End { ended_at: at }).await {
            Ok(_) => {}
            Err(store::Error::Ended(at)) => {
                debug!(session = %id, "ended concurrently");
                return Ok(EndOutcome::AlreadyEnded { at });
            }
            Err(err) => return Err(err.into()),
        }
        self.metrics.ends.inc();
        let outcome = match (&warning, session.contract) {
            (Some(warning), _) => {
                self.metrics.ledger_warnings.inc();
                warn!(session = %id, %warning, "ended without ledger confirmation");
                EndOutcome::EndedWithLedgerWarning {
                    at,
                    warning: warning.clone(),
                }
            }
            (None, Some(_)) => {
                info!(session = %id, "ended");
                EndOutcome::Ended { at }
            }
            (None, None) => {
                info!(session = %id, "ended without contract");
                EndOutcome::EndedLocalOnly { at }
            }
        };
        self.reporter
            .report(Event::SessionEnded {
                session: id.clone(),
                at,
                ledger_warning: warning,
            })
            .await;
        Ok(outcome)
    }

    /// Run the scheduled action due for a session, if any (see [schedule::due]).
    pub async fn advance(&mut self, id: &SessionId) -> Result<Option<Advanced>, Error> {
        let session = self.get(id).await?;
        match schedule::due(&session, self.context.current()) {
            Some(Action::Start) => Ok(Some(Advanced::Started(self.deploy(id).await?))),
            Some(Action::End) => Ok(Some(Advanced::Ended(self.end(id).await?))),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mocks::{self, address, at, poll, window, Behavior},
        status::{resolve, Status},
        types::{Ballot, ChoiceId},
    };
    use commonware_macros::test_traced;
    use commonware_runtime::{deterministic, Runner, Spawner};

    type TestOrchestrator = Orchestrator<
        deterministic::Context,
        mocks::Store,
        mocks::Ledger<deterministic::Context>,
        mocks::Reporter,
    >;

    fn setup(
        context: &deterministic::Context,
        session: Session,
    ) -> (
        TestOrchestrator,
        mocks::Store,
        mocks::Ledger<deterministic::Context>,
        mocks::Reporter,
    ) {
        let store = mocks::Store::new([session]);
        let ledger = mocks::Ledger::new(context.clone());
        let reporter = mocks::Reporter::new();
        let orchestrator = Orchestrator::new(
            context.with_label("orchestrator"),
            store.clone(),
            ledger.clone(),
            reporter.clone(),
            &Config::default(),
        );
        (orchestrator, store, ledger, reporter)
    }

    fn id() -> SessionId {
        SessionId::from("p")
    }

    #[test_traced]
    fn test_deploy_is_idempotent() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (mut orchestrator, store, ledger, reporter) =
                setup(&context, poll("p", &["a", "b"]));

            let first = orchestrator.deploy(&id()).await.unwrap();
            let second = orchestrator.deploy(&id()).await.unwrap();
            assert_eq!(first.address, address(1));
            assert_eq!(second.address, first.address);
            assert_eq!(ledger.deployments().len(), 1);
            assert_eq!(
                ledger.deployments()[0].choices,
                vec![ChoiceId::from("a"), ChoiceId::from("b")]
            );

            let session = store.session(&id()).unwrap();
            assert_eq!(resolve(&session, context.current()), Status::Active);
            assert_eq!(
                reporter.events(),
                vec![Event::DeploymentSucceeded {
                    session: id(),
                    contract: address(1),
                }]
            );
        });
    }

    #[test_traced]
    fn test_deploy_empty_roster() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (mut orchestrator, store, ledger, reporter) = setup(&context, poll("p", &[]));

            let err = orchestrator.deploy(&id()).await.unwrap_err();
            assert_eq!(err, Error::Invalid(Invalid::EmptyRoster));
            assert!(ledger.deployments().is_empty());
            assert_eq!(store.updates(), 0);
            assert!(reporter.events().is_empty());
        });
    }

    #[test_traced]
    fn test_deploy_rejects_invalid_sessions() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let mut missing = poll("p", &["a"]);
            missing.lifecycle = None;
            let mut ended = poll("p", &["a"]);
            ended.lifecycle.as_mut().unwrap().ended_at = Some(at(0));
            let mut reversed = poll("p", &["a"]);
            reversed.lifecycle.as_mut().unwrap().window = Some(window(10, 5));

            for (i, (session, expected)) in [
                (missing, Invalid::MissingLifecycle),
                (ended, Invalid::Ended),
                (reversed, Invalid::Window),
            ]
            .into_iter()
            .enumerate()
            {
                let context = context.with_label(&format!("case_{i}"));
                let (mut orchestrator, _, ledger, _) = setup(&context, session);
                assert_eq!(
                    orchestrator.deploy(&id()).await,
                    Err(Error::Invalid(expected))
                );
                assert!(ledger.deployments().is_empty());
            }
        });
    }

    #[test_traced]
    fn test_deploy_timeout_writes_nothing() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (mut orchestrator, store, ledger, reporter) = setup(&context, poll("p", &["a"]));
            ledger.set_deploy(Behavior::Hang);

            let start = context.current();
            let err = orchestrator.deploy(&id()).await.unwrap_err();
            assert_eq!(err, Error::Timeout(Duration::from_secs(30)));
            assert!(context.current().duration_since(start).unwrap() >= Duration::from_secs(30));

            let session = store.session(&id()).unwrap();
            assert_eq!(session.contract, None);
            assert_eq!(session.started_at(), None);
            assert_eq!(store.updates(), 0);
            assert_eq!(
                reporter.count(|e| matches!(e, Event::DeploymentFailed { .. })),
                1
            );
        });
    }

    #[test_traced]
    fn test_deploy_ledger_failure() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (mut orchestrator, store, ledger, _) = setup(&context, poll("p", &["a"]));
            ledger.set_deploy(Behavior::Fail(ledger::Error::Reverted("out of gas".into())));

            let err = orchestrator.deploy(&id()).await.unwrap_err();
            assert_eq!(
                err,
                Error::Ledger(ledger::Error::Reverted("out of gas".into()))
            );
            assert_eq!(store.session(&id()).unwrap().contract, None);

            // Retrying after the ledger recovers deploys normally
            ledger.set_deploy(Behavior::Respond);
            let deployment = orchestrator.deploy(&id()).await.unwrap();
            assert_eq!(deployment.address, address(2));
        });
    }

    #[test_traced]
    fn test_partial_failure_recovers_without_redeploying() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (mut orchestrator, store, ledger, _) = setup(&context, poll("p", &["a"]));
            store.fail_updates(1);

            let err = orchestrator.deploy(&id()).await.unwrap_err();
            let Error::PartialFailure { address, .. } = err else {
                panic!("unexpected error: {err:?}");
            };
            assert_eq!(address, mocks::address(1));
            assert_eq!(store.session(&id()).unwrap().contract, None);

            let deployment = orchestrator.recover(&id(), address).await.unwrap();
            assert_eq!(deployment.address, address);
            assert_eq!(deployment.session.contract, Some(address));
            assert_eq!(ledger.deployments().len(), 1);
        });
    }

    #[test_traced]
    fn test_concurrent_deploys_record_one_contract() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (orchestrator, store, ledger, reporter) = setup(&context, poll("p", &["a"]));
            ledger.set_deploy(Behavior::Delay(Duration::from_secs(1)));

            let mut handles = Vec::new();
            for label in ["first", "second"] {
                let mut orchestrator = orchestrator.clone();
                handles.push(
                    context
                        .with_label(label)
                        .spawn(move |_| async move { orchestrator.deploy(&id()).await }),
                );
            }
            let mut addresses = Vec::new();
            for handle in handles {
                addresses.push(handle.await.unwrap().unwrap().address);
            }

            // Both callers observe the single recorded contract
            assert_eq!(ledger.deployments().len(), 2);
            let recorded = store.session(&id()).unwrap().contract.unwrap();
            assert_eq!(addresses, vec![recorded, recorded]);
            assert_eq!(
                reporter.count(|e| matches!(e, Event::DeploymentSucceeded { .. })),
                1
            );
        });
    }

    #[test_traced]
    fn test_deploy_preserves_started_at() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let mut session = poll("p", &["a"]);
            session.lifecycle.as_mut().unwrap().started_at = Some(at(0));
            let (mut orchestrator, _, _, _) = setup(&context, session);

            context.sleep(Duration::from_secs(60)).await;
            let deployment = orchestrator.deploy(&id()).await.unwrap();
            assert_eq!(deployment.session.started_at(), Some(at(0)));
        });
    }

    #[test_traced]
    fn test_deploy_starts_session_scheduled_later() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let mut session = poll("p", &["a", "b"]);
            session.lifecycle.as_mut().unwrap().started_at = Some(at(1000));
            let (mut orchestrator, _, _, _) = setup(&context, session);

            context.sleep(Duration::from_secs(10)).await;
            let deployment = orchestrator.deploy(&id()).await.unwrap();
            assert_eq!(deployment.session.started_at(), Some(at(10)));
            assert_eq!(
                resolve(&deployment.session, context.current()),
                Status::Active
            );
        });
    }

    #[test_traced]
    fn test_end_is_idempotent() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (mut orchestrator, _, ledger, reporter) = setup(&context, poll("p", &["a"]));
            orchestrator.deploy(&id()).await.unwrap();

            let first = orchestrator.end(&id()).await.unwrap();
            assert!(matches!(first, EndOutcome::Ended { .. }));
            context.sleep(Duration::from_secs(5)).await;
            let second = orchestrator.end(&id()).await.unwrap();
            assert_eq!(second, EndOutcome::AlreadyEnded { at: first.at() });

            assert_eq!(ledger.ends(), vec![address(1)]);
            assert_eq!(
                reporter.count(|e| matches!(e, Event::SessionEnded { .. })),
                1
            );
        });
    }

    #[test_traced]
    fn test_concurrent_ends_report_once() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (mut orchestrator, store, ledger, reporter) = setup(&context, poll("p", &["a"]));
            orchestrator.deploy(&id()).await.unwrap();
            ledger.set_end(Behavior::Delay(Duration::from_secs(1)));

            // Both calls read the session before either records the end
            let mut handles = Vec::new();
            for label in ["first", "second"] {
                let mut orchestrator = orchestrator.clone();
                handles.push(
                    context
                        .with_label(label)
                        .spawn(move |_| async move { orchestrator.end(&id()).await }),
                );
            }
            let mut outcomes = Vec::new();
            for handle in handles {
                outcomes.push(handle.await.unwrap().unwrap());
            }

            let at = store.session(&id()).unwrap().ended_at().unwrap();
            assert_eq!(ledger.ends().len(), 2);
            assert_eq!(
                outcomes
                    .iter()
                    .filter(|o| matches!(o, EndOutcome::Ended { .. }))
                    .count(),
                1
            );
            assert!(outcomes.contains(&EndOutcome::AlreadyEnded { at }));
            assert_eq!(
                reporter.count(|e| matches!(e, Event::SessionEnded { .. })),
                1
            );
        });
    }

    #[test_traced]
    fn test_end_with_ledger_warning() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (mut orchestrator, store, ledger, reporter) = setup(&context, poll("p", &["a"]));
            orchestrator.deploy(&id()).await.unwrap();
            ledger.set_end(Behavior::Hang);

            let outcome = orchestrator.end(&id()).await.unwrap();
            let EndOutcome::EndedWithLedgerWarning { at, warning } = outcome else {
                panic!("unexpected outcome: {outcome:?}");
            };
            assert!(warning.contains("timed out"));
            let session = store.session(&id()).unwrap();
            assert_eq!(session.ended_at(), Some(at));
            assert_eq!(resolve(&session, context.current()), Status::Ended);
            assert_eq!(
                reporter.events().last(),
                Some(&Event::SessionEnded {
                    session: id(),
                    at,
                    ledger_warning: Some(warning),
                })
            );

            // Ending again does not retry the ledger
            let outcome = orchestrator.end(&id()).await.unwrap();
            assert_eq!(outcome, EndOutcome::AlreadyEnded { at });
            assert_eq!(ledger.ends().len(), 1);
        });
    }

    #[test_traced]
    fn test_end_declined_by_ledger() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (mut orchestrator, _, ledger, _) = setup(&context, poll("p", &["a"]));
            orchestrator.deploy(&id()).await.unwrap();
            ledger.set_end(Behavior::Decline);

            let outcome = orchestrator.end(&id()).await.unwrap();
            assert!(matches!(
                outcome,
                EndOutcome::EndedWithLedgerWarning { .. }
            ));
        });
    }

    #[test_traced]
    fn test_end_without_contract() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (mut orchestrator, store, ledger, _) = setup(&context, poll("p", &["a"]));

            let outcome = orchestrator.end(&id()).await.unwrap();
            assert!(matches!(outcome, EndOutcome::EndedLocalOnly { .. }));
            assert_eq!(store.session(&id()).unwrap().ended_at(), Some(outcome.at()));
            assert!(ledger.ends().is_empty());
        });
    }

    #[test_traced]
    fn test_advance_follows_schedule() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let mut session = poll("p", &["a", "b"]);
            session.lifecycle.as_mut().unwrap().window = Some(window(100, 200));
            let (mut orchestrator, store, _, _) = setup(&context, session);

            assert_eq!(orchestrator.advance(&id()).await.unwrap(), None);

            context.sleep(Duration::from_secs(100)).await;
            let advanced = orchestrator.advance(&id()).await.unwrap();
            assert!(matches!(advanced, Some(Advanced::Started(_))));
            assert_eq!(orchestrator.advance(&id()).await.unwrap(), None);

            context.sleep(Duration::from_secs(100)).await;
            let advanced = orchestrator.advance(&id()).await.unwrap();
            assert!(matches!(
                advanced,
                Some(Advanced::Ended(EndOutcome::Ended { .. }))
            ));
            assert_eq!(orchestrator.advance(&id()).await.unwrap(), None);

            let session = store.session(&id()).unwrap();
            assert!(matches!(session.ballot, Ballot::Poll { .. }));
            assert_eq!(resolve(&session, context.current()), Status::Ended);
        });
    }
}
