use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use federa_error::{ConnectorError, Result};
use uuid::Uuid;

pub const DEFAULT_BATCH_SIZE: usize = 2048;

/// Cancellation flag shared between the caller and an execution.
///
/// Cloning shares the same underlying flag.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Error if the flag has been set.
    pub fn check(&self, what: impl fmt::Display) -> Result<()> {
        if self.is_cancelled() {
            return Err(ConnectorError::Cancelled(what.to_string()));
        }
        Ok(())
    }
}

/// Per-invocation metadata for an execution.
///
/// Owned by the caller. Executions only read it.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    request_id: String,
    part_id: String,
    execution_count_id: u32,
    batch_size: usize,
    keep_alive: bool,
    principal: Option<String>,
    cancel: CancelFlag,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        ExecutionContext {
            request_id: Uuid::new_v4().to_string(),
            part_id: "0".to_string(),
            execution_count_id: 0,
            batch_size: DEFAULT_BATCH_SIZE,
            keep_alive: false,
            principal: None,
            cancel: CancelFlag::new(),
        }
    }
}

impl ExecutionContext {
    pub fn new(request_id: impl Into<String>) -> Self {
        ExecutionContext {
            request_id: request_id.into(),
            ..Default::default()
        }
    }

    pub fn with_part_id(mut self, part_id: impl Into<String>) -> Self {
        self.part_id = part_id.into();
        self
    }

    pub fn with_execution_count_id(mut self, id: u32) -> Self {
        self.execution_count_id = id;
        self
    }

    /// Zero is treated as one.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn part_id(&self) -> &str {
        &self.part_id
    }

    pub fn execution_count_id(&self) -> u32 {
        self.execution_count_id
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn principal(&self) -> Option<&str> {
        self.principal.as_deref()
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Identifier used in log fields and error messages.
    pub fn execution_id(&self) -> String {
        format!(
            "{}.{}.{}",
            self.request_id, self.part_id, self.execution_count_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_cancellation() {
        let ctx = ExecutionContext::new("req").with_part_id("3");
        let other = ctx.clone();
        assert!(!other.is_cancelled());
        ctx.cancel_flag().cancel();
        assert!(other.is_cancelled());
        assert!(other.cancel_flag().check("req.3.0").unwrap_err().is_cancellation());
    }

    #[test]
    fn defaults() {
        let ctx = ExecutionContext::default();
        assert_eq!(DEFAULT_BATCH_SIZE, ctx.batch_size());
        assert!(!ctx.keep_alive());
        assert!(Uuid::parse_str(ctx.request_id()).is_ok());
        assert_eq!(1, ctx.with_batch_size(0).batch_size());
    }
}
