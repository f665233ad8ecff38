//! Error types for the resharding worker.

use crate::types::ShardTarget;
use std::fmt;
use std::io;
use thiserror::Error;

/// Result type alias for worker operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the resharding worker.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// The tablet we wrote to is no longer the master of its shard.
    #[error("stale master for {target}: tablet {alias} at generation {generation} is not master")]
    StaleMaster {
        target: ShardTarget,
        alias: String,
        /// Generation the write was addressed with.
        generation: u64,
        /// Generation the tablet reported, if it knows a newer one.
        current_generation: Option<u64>,
    },

    /// Topology could not answer, or the tablet transport failed transiently.
    #[error("topology unavailable for {target}: {reason}")]
    TopologyUnavailable { target: ShardTarget, reason: String },

    /// Source and destination schemas differ.
    #[error("schema mismatch between {source_target} and {destination}: {reason}")]
    SchemaMismatch {
        source_target: ShardTarget,
        destination: ShardTarget,
        reason: String,
    },

    /// Diff found rows that differ between source and destination.
    #[error("data mismatch on {destination}: {missing} missing, {extra} extra, {mismatched} mismatched")]
    DataMismatch {
        destination: ShardTarget,
        missing: usize,
        extra: usize,
        mismatched: usize,
    },

    /// Diff was requested before the copy reached `done`.
    #[error("diff requested while worker is in state {state}")]
    PrematureDiff { state: String },

    /// A retry ceiling was exceeded.
    #[error("retries exhausted for {target} after {attempts} attempts: {last}")]
    RetriesExhausted {
        target: ShardTarget,
        category: ErrorCategory,
        attempts: u32,
        last: String,
    },

    /// Illegal worker state transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// The run was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// Stats endpoint and other socket errors.
    #[error("network error: {0}")]
    Network(String),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse error classification used for retry decisions and counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    StaleMaster,
    TopologyUnavailable,
    SchemaMismatch,
    DataMismatch,
    PrematureDiff,
    RetriesExhausted,
    InvalidTransition,
    Cancelled,
    Timeout,
    Config,
    Network,
    Internal,
}

impl ErrorCategory {
    /// Label used in counters and the stats document.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StaleMaster => "stale_master",
            Self::TopologyUnavailable => "topology_unavailable",
            Self::SchemaMismatch => "schema_mismatch",
            Self::DataMismatch => "data_mismatch",
            Self::PrematureDiff => "premature_diff",
            Self::RetriesExhausted => "retries_exhausted",
            Self::InvalidTransition => "invalid_transition",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
            Self::Config => "config",
            Self::Network => "network",
            Self::Internal => "internal",
        }
    }

    /// Whether the retrying writer may retry this category locally.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StaleMaster | Self::TopologyUnavailable)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Classify this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::StaleMaster { .. } => ErrorCategory::StaleMaster,
            Self::TopologyUnavailable { .. } => ErrorCategory::TopologyUnavailable,
            Self::SchemaMismatch { .. } => ErrorCategory::SchemaMismatch,
            Self::DataMismatch { .. } => ErrorCategory::DataMismatch,
            Self::PrematureDiff { .. } => ErrorCategory::PrematureDiff,
            Self::RetriesExhausted { .. } => ErrorCategory::RetriesExhausted,
            Self::InvalidTransition { .. } => ErrorCategory::InvalidTransition,
            Self::Cancelled => ErrorCategory::Cancelled,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::Config(_) => ErrorCategory::Config,
            Self::Network(_) => ErrorCategory::Network,
            Self::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Category of the failure that ultimately caused this error.
    ///
    /// Exhausted retries report the category that kept failing.
    pub fn triggering_category(&self) -> ErrorCategory {
        match self {
            Self::RetriesExhausted { category, .. } => *category,
            other => other.category(),
        }
    }

    /// Whether this error can be retried by the writer.
    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }

    /// Shorthand for a topology failure.
    pub fn topology_unavailable(target: &ShardTarget, reason: impl Into<String>) -> Self {
        Self::TopologyUnavailable {
            target: target.clone(),
            reason: reason.into(),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Network(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Network(format!("stats encoding: {}", e))
    }
}
