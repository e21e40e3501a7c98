use std::net::SocketAddr;
use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "127.0.0.1:3000")]
    pub address: SocketAddr,

    /// Set to run on the in-memory store instead of SQLite.
    #[envconfig(default = "false")]
    pub memory_store: bool,

    #[envconfig(default = "sqlite://bdi.db?mode=rwc")]
    pub database_url: String,

    /// readsb-hist day directory to ingest from.
    #[envconfig(
        default = "https://samples.adsbexchange.com/readsb-hist/2023/11/01"
    )]
    pub source_url: String,

    /// Records per store write.
    #[envconfig(default = "500")]
    pub batch_size: usize,

    /// Maximum attempts per pipeline stage, including the first one.
    #[envconfig(default = "3")]
    pub retry_limit: u32,

    /// How stale a repeated aggregate query may be (cache TTL).
    #[envconfig(default = "5000")]
    pub stale_bound: EnvMsDuration,

    /// Merge/persist parallelism (entity-hash partitions).
    #[envconfig(default = "8")]
    pub partitions: usize,

    #[envconfig(default = "10000")]
    pub fetch_timeout: EnvMsDuration,

    /// Pause between source polls once the stream is drained.
    #[envconfig(default = "30000")]
    pub poll_interval: EnvMsDuration,

    #[envconfig(nested = true)]
    pub retry_policy: RetryPolicyConfig,

    #[envconfig(default = "true")]
    pub export_prometheus: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Envconfig, Clone)]
pub struct RetryPolicyConfig {
    #[envconfig(default = "2")]
    pub backoff_coefficient: u32,

    #[envconfig(default = "1000")]
    pub initial_interval: EnvMsDuration,

    #[envconfig(default = "60000")]
    pub maximum_interval: EnvMsDuration,
}
