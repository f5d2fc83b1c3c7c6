//! Errors returned by connector executions, pools and the transaction
//! coordinator.

use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

pub type Result<T, E = ConnectorError> = std::result::Result<T, E>;

type BoxedSource = Box<dyn StdError + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    /// Missing or invalid configuration. Fatal at startup.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Timeout waiting for a connection for identity '{identity}' after {}ms", waited.as_millis())]
    PoolTimeout { identity: String, waited: Duration },

    /// An operation was invoked in a state that does not allow it.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Security error: {0}")]
    Security(String),

    /// Credentials held by a backend session are no longer accepted.
    #[error("Authentication expired: {0}")]
    AuthExpired(String),

    /// Raw status reported by a backend. Pagination adapters may map
    /// specific statuses to end-of-data.
    #[error("Source returned status {status}: {message}")]
    SourceStatus { status: u16, message: String },

    #[error("Source operation failed: {message}")]
    SourceOperation {
        message: String,
        #[source]
        source: Option<BoxedSource>,
    },

    #[error("Execution cancelled: {0}")]
    Cancelled(String),

    #[error(transparent)]
    Branch(#[from] BranchError),

    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl ConnectorError {
    pub fn source_operation(message: impl Into<String>) -> Self {
        ConnectorError::SourceOperation {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(message: impl Into<String>, source: BoxedSource) -> Self {
        ConnectorError::SourceOperation {
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        ConnectorError::InvalidState(message.into())
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        ConnectorError::Configuration(message.into())
    }

    /// Cancellations are expected outcomes. Callers should neither log them
    /// as failures nor retry.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ConnectorError::Cancelled(_))
    }

    /// Whether the caller may retry the same operation.
    pub fn is_retryable(&self) -> bool {
        match self {
            ConnectorError::PoolTimeout { .. } => true,
            ConnectorError::Branch(err) => err.kind.resolution() == Resolution::Retry,
            _ => false,
        }
    }
}

/// Heuristic decision reported by a resource manager that completed a branch
/// on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeuristicOutcome {
    Commit,
    Rollback,
    Mixed,
    Hazard,
}

impl fmt::Display for HeuristicOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HeuristicOutcome::Commit => "commit",
            HeuristicOutcome::Rollback => "rollback",
            HeuristicOutcome::Mixed => "mixed",
            HeuristicOutcome::Hazard => "hazard",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BranchErrorKind {
    /// The branch can only be rolled back.
    RollbackOnly,
    /// The resource manager already decided the outcome.
    Heuristic(HeuristicOutcome),
    /// The resource manager could not be reached.
    ResourceManagerUnavailable,
}

impl BranchErrorKind {
    pub fn resolution(&self) -> Resolution {
        match self {
            BranchErrorKind::RollbackOnly => Resolution::Compensate,
            BranchErrorKind::Heuristic(_) => Resolution::Escalate,
            BranchErrorKind::ResourceManagerUnavailable => Resolution::Retry,
        }
    }
}

impl fmt::Display for BranchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BranchErrorKind::RollbackOnly => write!(f, "rollback-only"),
            BranchErrorKind::Heuristic(outcome) => write!(f, "heuristic-{outcome}"),
            BranchErrorKind::ResourceManagerUnavailable => write!(f, "resource-manager-unavailable"),
        }
    }
}

/// What the coordinator should do about a failed branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Retry,
    Compensate,
    Escalate,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Transaction branch error ({kind}): {message}")]
pub struct BranchError {
    pub kind: BranchErrorKind,
    pub message: String,
}

impl BranchError {
    pub fn new(kind: BranchErrorKind, message: impl Into<String>) -> Self {
        BranchError {
            kind,
            message: message.into(),
        }
    }

    pub fn rollback_only(message: impl Into<String>) -> Self {
        Self::new(BranchErrorKind::RollbackOnly, message)
    }

    pub fn heuristic(outcome: HeuristicOutcome, message: impl Into<String>) -> Self {
        Self::new(BranchErrorKind::Heuristic(outcome), message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(BranchErrorKind::ResourceManagerUnavailable, message)
    }
}

pub trait ResultExt<T> {
    /// Wrap the error as a source operation failure with additional context.
    fn context(self, msg: &str) -> Result<T>;

    fn context_fn<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: StdError + Send + Sync + 'static,
{
    fn context(self, msg: &str) -> Result<T> {
        self.map_err(|e| ConnectorError::with_source(msg, Box::new(e)))
    }

    fn context_fn<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| ConnectorError::with_source(f(), Box::new(e)))
    }
}

pub trait OptionExt<T> {
    /// Return a configuration error naming the missing value.
    fn required(self, what: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn required(self, what: &str) -> Result<T> {
        self.ok_or_else(|| ConnectorError::Configuration(format!("Missing required {what}")))
    }
}
