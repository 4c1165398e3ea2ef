use super::{
    ingress::{Mailbox, Message},
    metrics::EngineMetrics,
    Failure, Outcome, Reconciler,
};
use crate::{
    ledger::Ledger,
    status::Status,
    store::{self, Store},
    types::SessionId,
    Config, Reporter,
};
use commonware_macros::select;
use commonware_runtime::{Clock, Handle, Metrics, Spawner};
use futures::{
    channel::{mpsc, oneshot},
    SinkExt, StreamExt,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    time::{Duration, SystemTime},
};
use tracing::{debug, info};

/// A sync that finished in its own task.
struct Completed {
    session: SessionId,
    outcome: Outcome,
    status: Option<Status>,
    responders: Vec<oneshot::Sender<Outcome>>,
}

/// Syncs tracked sessions on an interval and serves on-demand syncs.
///
/// Every sync runs in its own task, so a slow ledger read only delays the session it belongs to.
/// At most one sync per session runs at a time: an on-demand sync requested while one is running
/// starts once it completes.
pub struct Engine<E: Clock + Spawner + Metrics, S: Store, L: Ledger, R: Reporter> {
    context: E,
    reconciler: Reconciler<E, S, L, R>,

    interval: Duration,
    min_spacing: Duration,

    mailbox: mpsc::Receiver<Message>,
    completions: mpsc::Receiver<Completed>,
    completer: mpsc::Sender<Completed>,

    /// Tracked sessions and the start of their last sync (if any).
    tracked: BTreeMap<SessionId, Option<SystemTime>>,

    /// Sessions with a sync running.
    running: BTreeSet<SessionId>,

    /// On-demand syncs waiting for a running sync of the same session.
    waiting: BTreeMap<SessionId, Vec<oneshot::Sender<Outcome>>>,

    metrics: EngineMetrics,
}

impl<E: Clock + Spawner + Metrics, S: Store, L: Ledger, R: Reporter> Engine<E, S, L, R> {
    /// Create a new engine and the mailbox used to control it.
    pub fn new(context: E, store: S, ledger: L, reporter: R, cfg: &Config) -> (Self, Mailbox) {
        let (sender, receiver) = mpsc::channel(cfg.mailbox_size);
        let (completer, completions) = mpsc::channel(cfg.mailbox_size);
        let reconciler = Reconciler::new(
            context.with_label("reconciler"),
            store,
            ledger,
            reporter,
            cfg,
        );
        let metrics = EngineMetrics::init(&context);
        (
            Self {
                context,
                reconciler,
                interval: cfg.sync_interval,
                min_spacing: cfg.min_spacing,
                mailbox: receiver,
                completions,
                completer,
                tracked: BTreeMap::new(),
                running: BTreeSet::new(),
                waiting: BTreeMap::new(),
                metrics,
            },
            Mailbox::new(sender),
        )
    }

    /// Start the engine.
    pub fn start(mut self) -> Handle<()> {
        self.context.spawn_ref()(self.run())
    }

    async fn run(mut self) {
        let mut next = self.context.current() + self.interval;
        loop {
            select! {
                _ = self.context.sleep_until(next) => {
                    let now = self.context.current();
                    next = now + self.interval;
                    self.tick(now);
                },
                completed = self.completions.next() => {
                    // The engine holds a sender, so the channel never closes
                    let Some(completed) = completed else {
                        return;
                    };
                    self.complete(completed);
                },
                mail = self.mailbox.next() => {
                    let Some(message) = mail else {
                        debug!("mailbox closed");
                        return;
                    };
                    match message {
                        Message::Track { session } => {
                            debug!(%session, "tracking");
                            self.tracked.entry(session).or_insert(None);
                        }
                        Message::Untrack { session } => {
                            debug!(%session, "untracking");
                            self.tracked.remove(&session);
                        }
                        Message::Sync { session, responder } => {
                            if self.running.contains(&session) {
                                debug!(%session, "sync already running");
                                self.waiting.entry(session).or_default().push(responder);
                            } else {
                                self.launch(session, vec![responder]);
                            }
                        }
                    }
                },
            }
            self.metrics.tracked.set(self.tracked.len() as i64);
        }
    }

    /// Start a sync of every tracked session whose last sync started at least `min_spacing` before
    /// `now`.
    fn tick(&mut self, now: SystemTime) {
        let due: Vec<SessionId> = self
            .tracked
            .iter()
            .filter(|(_, last)| match last {
                Some(last) => now.duration_since(*last).unwrap_or_default() >= self.min_spacing,
                None => true,
            })
            .map(|(session, _)| session.clone())
            .collect();
        let deferred = self.tracked.len() - due.len();
        if deferred > 0 {
            self.metrics.deferred.inc_by(deferred as u64);
        }

        for session in due {
            if self.running.contains(&session) {
                debug!(%session, "sync still running");
                continue;
            }
            self.launch(session, Vec::new());
        }
    }

    /// Sync `session` in a new task, answering `responders` with the outcome.
    fn launch(&mut self, session: SessionId, responders: Vec<oneshot::Sender<Outcome>>) {
        if let Some(last) = self.tracked.get_mut(&session) {
            *last = Some(self.context.current());
        }
        self.running.insert(session.clone());

        let mut reconciler = self.reconciler.clone();
        let mut completer = self.completer.clone();
        self.context.with_label("sync").spawn(move |_| async move {
            let (outcome, status) = reconciler.reconcile(&session).await;
            let _ = completer
                .send(Completed {
                    session,
                    outcome,
                    status,
                    responders,
                })
                .await;
        });
    }

    fn complete(&mut self, completed: Completed) {
        let Completed {
            session,
            outcome,
            status,
            responders,
        } = completed;
        self.running.remove(&session);

        let finished = match (&outcome, status) {
            // The tally is final once an ended session has been synced
            (Outcome::Synced(_) | Outcome::Stale { .. }, Some(Status::Ended)) => true,
            (Outcome::Failed(Failure::Store(store::Error::SessionNotFound(_))), _) => true,
            _ => false,
        };
        if finished && self.tracked.remove(&session).is_some() {
            info!(%session, "no longer tracking");
        }
        for responder in responders {
            let _ = responder.send(outcome.clone());
        }

        if let Some(waiting) = self.waiting.remove(&session) {
            self.launch(session, waiting);
        }
    }
}
