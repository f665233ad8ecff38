//! Configuration types for the resharding worker.

use crate::error::{Error, Result};
use std::net::SocketAddr;
use std::time::Duration;

/// Main configuration for a copy run.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Cell whose rdonly tablets serve the copy and get their roles back
    /// during cleanup.
    pub cell: String,

    /// Capacity of each destination's batch queue.
    pub channel_buffer: usize,

    /// How long `finding_targets` may take before the run fails.
    pub startup_timeout: Duration,

    /// Address the stats endpoint binds to. Port 0 lets the OS choose.
    pub stats_addr: SocketAddr,

    /// Retry and backoff limits for destination writes.
    pub retry: RetryConfig,

    /// Copy strategy options.
    pub strategy: StrategyFlags,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            cell: "test_nj".to_string(),
            channel_buffer: 4,
            startup_timeout: Duration::from_secs(30),
            stats_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            retry: RetryConfig::default(),
            strategy: StrategyFlags::default(),
        }
    }
}

impl WorkerConfig {
    /// Create a configuration for the given cell.
    pub fn new(cell: impl Into<String>) -> Self {
        Self {
            cell: cell.into(),
            ..Default::default()
        }
    }

    /// Set the per-destination queue capacity.
    pub fn with_channel_buffer(mut self, buffer: usize) -> Self {
        self.channel_buffer = buffer.max(1);
        self
    }

    /// Set the startup timeout for resolving destinations.
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Set the stats endpoint address.
    pub fn with_stats_addr(mut self, addr: SocketAddr) -> Self {
        self.stats_addr = addr;
        self
    }

    /// Set retry configuration.
    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set strategy flags.
    pub fn with_strategy(mut self, strategy: StrategyFlags) -> Self {
        self.strategy = strategy;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.cell.is_empty() {
            return Err(Error::Config("cell must not be empty".to_string()));
        }
        if self.channel_buffer == 0 {
            return Err(Error::Config("channel_buffer must be > 0".to_string()));
        }
        if self.startup_timeout.is_zero() {
            return Err(Error::Config("startup_timeout must be > 0".to_string()));
        }
        self.retry.validate()
    }
}

/// Retry limits and backoff shape for the retrying writer.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Stale-master retries allowed per batch before the shard fails.
    pub max_stale_master_retries: u32,

    /// Consecutive topology/transport failures allowed per batch.
    pub max_topology_retries: u32,

    /// First backoff delay.
    pub initial_backoff: Duration,

    /// Upper bound for a single backoff delay.
    pub max_backoff: Duration,

    /// Growth factor between consecutive delays.
    pub backoff_multiplier: f64,

    /// Randomize each delay within [delay/2, delay].
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_stale_master_retries: 10,
            max_topology_retries: 5,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Short delays and no jitter, for tests.
    pub fn fast() -> Self {
        Self {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(10),
            jitter: false,
            ..Default::default()
        }
    }

    /// Set the stale-master retry ceiling.
    pub fn with_max_stale_master_retries(mut self, max: u32) -> Self {
        self.max_stale_master_retries = max;
        self
    }

    /// Set the topology retry ceiling.
    pub fn with_max_topology_retries(mut self, max: u32) -> Self {
        self.max_topology_retries = max;
        self
    }

    /// Set the backoff bounds.
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.backoff_multiplier < 1.0 {
            return Err(Error::Config("backoff_multiplier must be >= 1.0".to_string()));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(Error::Config(
                "initial_backoff must not exceed max_backoff".to_string(),
            ));
        }
        Ok(())
    }
}

/// Copy strategy options, parsed from a flag string.
///
/// ```text
/// -populate_blp_checkpoint -skip_set_source_shards
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StrategyFlags {
    /// Record a replication checkpoint on each destination after the copy.
    pub populate_blp_checkpoint: bool,
    /// Do not record the source shard on the destinations after the copy.
    pub skip_set_source_shards: bool,
    /// Do not compare schemas before copying.
    pub skip_schema_check: bool,
}

impl StrategyFlags {
    /// Parse a whitespace separated list of `-flag` entries.
    pub fn parse(s: &str) -> Result<Self> {
        let mut flags = Self::default();
        for token in s.split_whitespace() {
            let name = token.trim_start_matches('-');
            match name {
                "populate_blp_checkpoint" => flags.populate_blp_checkpoint = true,
                "skip_set_source_shards" => flags.skip_set_source_shards = true,
                "skip_schema_check" => flags.skip_schema_check = true,
                _ => {
                    return Err(Error::Config(format!("unknown strategy flag {:?}", token)));
                }
            }
        }
        Ok(flags)
    }
}
