use std::{fmt, future::Future, time::Duration};

use chainscan_common::{node::NodeError, storage::StorageError};
use thiserror::Error;
use tokio_retry::{strategy::FixedInterval, RetryIf};
use tracing::warn;

pub mod account;
pub mod address;
pub mod baker;
pub mod catchup;
pub mod delegation;
pub mod finalization;
pub mod parameters;
pub mod pipeline;
pub mod state;

#[derive(Error, Debug, PartialEq)]
pub enum ImportError {
    #[error("Importer setup failed: {0}")]
    Setup(String),
    #[error("Node request failed: {0}")]
    Node(#[from] NodeError),
    #[error("Storage failure: {0}")]
    Storage(#[from] StorageError),
    /// An event referenced an entity that protocol ordering guarantees must
    /// already exist. Never auto-recovered; masking it would silently
    /// corrupt derived aggregates.
    #[error("Data inconsistency: {0}")]
    DataInconsistency(String),
    #[error("Unknown protocol variant: {0}")]
    UnknownVariant(String),
}

impl ImportError {
    /// Whether the failed operation may be retried as-is. Only
    /// infrastructure problems qualify; data errors never do.
    pub fn is_transient(&self) -> bool {
        match self {
            ImportError::Node(err) => err.is_transient(),
            ImportError::Storage(StorageError::Unavailable(_)) => true,
            _ => false,
        }
    }
}

/// Per-block lifecycle of the sequential pipeline, tracked for logs and
/// metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportPhase {
    Fetching,
    Decoding,
    Reconciling,
    Committing,
    Checkpointed,
}

impl fmt::Display for ImportPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ImportPhase::Fetching => "fetching",
            ImportPhase::Decoding => "decoding",
            ImportPhase::Reconciling => "reconciling",
            ImportPhase::Committing => "committing",
            ImportPhase::Checkpointed => "checkpointed",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub delay_between_retries: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 3, delay_between_retries: Duration::from_secs(5) }
    }
}

/// Runs `operation`, retrying transient failures per `policy`. Data errors
/// and retry exhaustion propagate to the caller.
pub(crate) async fn with_retries<T, F, Fut>(
    policy: &RetryPolicy,
    operation_name: &'static str,
    operation: F,
) -> Result<T, ImportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ImportError>>,
{
    let strategy = FixedInterval::new(policy.delay_between_retries).take(policy.max_retries);
    RetryIf::spawn(strategy, operation, |err: &ImportError| {
        let transient = err.is_transient();
        if transient {
            warn!(operation = operation_name, %err, "Transient failure, retrying");
        }
        transient
    })
    .await
}
