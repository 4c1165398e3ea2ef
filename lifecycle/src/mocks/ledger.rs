//! Scriptable [crate::ledger::Ledger].

use crate::{
    ledger::{self, Error, Params, Receipt, TallySnapshot, Vote},
    types::{Address, ADDRESS_LENGTH},
};
use commonware_runtime::Clock;
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::Duration,
};

/// How the mock answers a call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Behavior {
    /// Answer immediately.
    #[default]
    Respond,

    /// Answer after a delay.
    Delay(Duration),

    /// Fail with the given error.
    Fail(Error),

    /// Never answer.
    Hang,

    /// Return `false` from [ledger::Ledger::end]. Other calls fail with [Error::Rejected].
    Decline,
}

/// Derive the address of the `n`th contract deployed by [Ledger].
pub fn address(n: u64) -> Address {
    let mut bytes = [0u8; ADDRESS_LENGTH];
    bytes[ADDRESS_LENGTH - 8..].copy_from_slice(&n.to_be_bytes());
    Address::new(bytes)
}

#[derive(Default)]
struct State {
    deploy: Behavior,
    end: Behavior,
    tally: Behavior,
    submit: Behavior,

    /// Tally behavior for specific contracts
    tallies: BTreeMap<Address, Behavior>,

    snapshot: TallySnapshot,

    deployments: Vec<Params>,
    ends: Vec<Address>,
    reads: Vec<Address>,
    votes: Vec<(Address, Vote)>,
}

/// A [ledger::Ledger] that records every call and answers according to a [Behavior] per method.
///
/// Contracts are assigned sequential addresses (see [address]).
#[derive(Clone)]
pub struct Ledger<E: Clock> {
    context: E,
    state: Arc<Mutex<State>>,
}

impl<E: Clock> Ledger<E> {
    pub fn new(context: E) -> Self {
        Self {
            context,
            state: Arc::default(),
        }
    }

    pub fn set_deploy(&self, behavior: Behavior) {
        self.state.lock().unwrap().deploy = behavior;
    }

    pub fn set_end(&self, behavior: Behavior) {
        self.state.lock().unwrap().end = behavior;
    }

    pub fn set_tally(&self, behavior: Behavior) {
        self.state.lock().unwrap().tally = behavior;
    }

    /// Override the tally behavior for one contract.
    pub fn set_tally_for(&self, contract: Address, behavior: Behavior) {
        self.state.lock().unwrap().tallies.insert(contract, behavior);
    }

    pub fn set_submit(&self, behavior: Behavior) {
        self.state.lock().unwrap().submit = behavior;
    }

    /// Set the snapshot returned by [ledger::Ledger::tally].
    pub fn set_snapshot(&self, snapshot: TallySnapshot) {
        self.state.lock().unwrap().snapshot = snapshot;
    }

    /// Parameters of every deployment attempt, including ones that failed.
    pub fn deployments(&self) -> Vec<Params> {
        self.state.lock().unwrap().deployments.clone()
    }

    /// Contracts passed to every end attempt.
    pub fn ends(&self) -> Vec<Address> {
        self.state.lock().unwrap().ends.clone()
    }

    /// Contracts passed to every tally read.
    pub fn reads(&self) -> Vec<Address> {
        self.state.lock().unwrap().reads.clone()
    }

    /// Every vote submitted.
    pub fn votes(&self) -> Vec<(Address, Vote)> {
        self.state.lock().unwrap().votes.clone()
    }

    /// Resolve `behavior`, returning whether the call was accepted.
    async fn wait(&self, behavior: Behavior) -> Result<bool, Error> {
        match behavior {
            Behavior::Respond => Ok(true),
            Behavior::Delay(duration) => {
                self.context.sleep(duration).await;
                Ok(true)
            }
            Behavior::Fail(err) => Err(err),
            Behavior::Hang => futures::future::pending().await,
            Behavior::Decline => Ok(false),
        }
    }

    async fn accepted(&self, behavior: Behavior) -> Result<(), Error> {
        if !self.wait(behavior).await? {
            return Err(Error::Rejected("declined".into()));
        }
        Ok(())
    }
}

impl<E: Clock> ledger::Ledger for Ledger<E> {
    async fn deploy(&self, params: Params) -> Result<Address, Error> {
        let (behavior, n) = {
            let mut state = self.state.lock().unwrap();
            state.deployments.push(params);
            (state.deploy.clone(), state.deployments.len() as u64)
        };
        self.accepted(behavior).await?;
        Ok(address(n))
    }

    async fn end(&self, contract: Address) -> Result<bool, Error> {
        let behavior = {
            let mut state = self.state.lock().unwrap();
            state.ends.push(contract);
            state.end.clone()
        };
        self.wait(behavior).await
    }

    async fn tally(&self, contract: Address) -> Result<TallySnapshot, Error> {
        let behavior = {
            let mut state = self.state.lock().unwrap();
            state.reads.push(contract);
            state
                .tallies
                .get(&contract)
                .cloned()
                .unwrap_or_else(|| state.tally.clone())
        };
        self.accepted(behavior).await?;
        Ok(self.state.lock().unwrap().snapshot.clone())
    }

    async fn submit(&self, contract: Address, vote: Vote) -> Result<Receipt, Error> {
        let (behavior, n) = {
            let mut state = self.state.lock().unwrap();
            state.votes.push((contract, vote));
            (state.submit.clone(), state.votes.len())
        };
        self.accepted(behavior).await?;
        Ok(Receipt {
            transaction: format!("0x{n:064x}"),
            block: n as u64,
        })
    }
}
