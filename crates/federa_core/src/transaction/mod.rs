//! Distributed transaction branches.

pub mod coordinator;
pub mod xid;

use std::fmt;

use federa_error::BranchError;

pub use coordinator::{BranchState, InDoubtBranch, TransactionCoordinator, TransactionState};
pub use xid::Xid;

/// Vote returned by a branch during prepare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareVote {
    Ok,
    /// The branch did no writes and has already completed.
    ReadOnly,
}

/// A backend's participant in a distributed transaction.
pub trait XaResource: Send + Sync + fmt::Debug {
    fn start(&self, xid: &Xid) -> Result<(), BranchError>;

    /// Dissociate work from the branch. `success` is false when the branch
    /// will be rolled back.
    fn end(&self, xid: &Xid, success: bool) -> Result<(), BranchError>;

    fn prepare(&self, xid: &Xid) -> Result<PrepareVote, BranchError>;

    fn commit(&self, xid: &Xid, one_phase: bool) -> Result<(), BranchError>;

    fn rollback(&self, xid: &Xid) -> Result<(), BranchError>;

    /// Discard knowledge of a heuristically completed branch.
    fn forget(&self, xid: &Xid) -> Result<(), BranchError>;
}
