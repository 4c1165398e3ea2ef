use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration shared by the lifecycle components.
///
/// Durations are (de)serialized as milliseconds. Omitted fields take their default.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum time to wait for the ledger to confirm a deployment.
    #[serde(with = "millis")]
    pub deploy_timeout: Duration,

    /// Maximum time to wait for a tally read during reconciliation.
    ///
    /// Shorter than other ledger calls because reads run on a recurring schedule.
    #[serde(with = "millis")]
    pub read_timeout: Duration,

    /// Maximum time to wait for any other ledger call (ending a contract, submitting a vote).
    #[serde(with = "millis")]
    pub ledger_timeout: Duration,

    /// Maximum time to wait for any store call.
    #[serde(with = "millis")]
    pub store_timeout: Duration,

    /// How often the reconciliation engine syncs tracked sessions.
    #[serde(with = "millis")]
    pub sync_interval: Duration,

    /// Minimum time between scheduled syncs of the same session.
    #[serde(with = "millis")]
    pub min_spacing: Duration,

    /// The maximum size of the reconciliation mailbox backlog.
    pub mailbox_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            deploy_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(10),
            ledger_timeout: Duration::from_secs(30),
            store_timeout: Duration::from_secs(5),
            sync_interval: Duration::from_secs(15),
            min_spacing: Duration::from_secs(15),
            mailbox_size: 1024,
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
