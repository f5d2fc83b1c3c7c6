use std::collections::{HashMap, VecDeque};

use federa_error::BranchError;
use parking_lot::Mutex;
use tracing::trace;

use crate::transaction::{PrepareVote, XaResource, Xid};

/// XA operation kinds, used to inject failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XaOp {
    Start,
    End,
    Prepare,
    Commit,
    Rollback,
    Forget,
}

/// A recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XaCall {
    Start(Xid),
    End { xid: Xid, success: bool },
    Prepare(Xid),
    Commit { xid: Xid, one_phase: bool },
    Rollback(Xid),
    Forget(Xid),
}

impl XaCall {
    pub fn xid(&self) -> &Xid {
        match self {
            XaCall::Start(xid)
            | XaCall::Prepare(xid)
            | XaCall::Rollback(xid)
            | XaCall::Forget(xid) => xid,
            XaCall::End { xid, .. } | XaCall::Commit { xid, .. } => xid,
        }
    }

    pub fn op(&self) -> XaOp {
        match self {
            XaCall::Start(_) => XaOp::Start,
            XaCall::End { .. } => XaOp::End,
            XaCall::Prepare(_) => XaOp::Prepare,
            XaCall::Commit { .. } => XaOp::Commit,
            XaCall::Rollback(_) => XaOp::Rollback,
            XaCall::Forget(_) => XaOp::Forget,
        }
    }
}

#[derive(Debug, Default)]
struct XaState {
    calls: Vec<XaCall>,
    failures: HashMap<XaOp, VecDeque<BranchError>>,
    read_only: bool,
}

/// Records every XA call and fails the ones queued with
/// [`DebugXaResource::fail_next`].
#[derive(Debug, Default)]
pub struct DebugXaResource {
    state: Mutex<XaState>,
}

impl DebugXaResource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next call of `op` with `error`. Queued failures are used in
    /// order.
    pub fn fail_next(&self, op: XaOp, error: BranchError) {
        self.state
            .lock()
            .failures
            .entry(op)
            .or_default()
            .push_back(error);
    }

    /// Vote read-only on prepare.
    pub fn set_read_only(&self, read_only: bool) {
        self.state.lock().read_only = read_only;
    }

    pub fn calls(&self) -> Vec<XaCall> {
        self.state.lock().calls.clone()
    }

    /// Recorded operations, in call order.
    pub fn ops(&self) -> Vec<XaOp> {
        self.state.lock().calls.iter().map(XaCall::op).collect()
    }

    fn record(&self, call: XaCall) -> Result<bool, BranchError> {
        trace!(?call, "xa call");
        let mut state = self.state.lock();
        let op = call.op();
        state.calls.push(call);
        if let Some(err) = state.failures.get_mut(&op).and_then(|q| q.pop_front()) {
            return Err(err);
        }
        Ok(state.read_only)
    }
}

impl XaResource for DebugXaResource {
    fn start(&self, xid: &Xid) -> Result<(), BranchError> {
        self.record(XaCall::Start(xid.clone())).map(|_| ())
    }

    fn end(&self, xid: &Xid, success: bool) -> Result<(), BranchError> {
        self.record(XaCall::End {
            xid: xid.clone(),
            success,
        })
        .map(|_| ())
    }

    fn prepare(&self, xid: &Xid) -> Result<PrepareVote, BranchError> {
        let read_only = self.record(XaCall::Prepare(xid.clone()))?;
        Ok(if read_only {
            PrepareVote::ReadOnly
        } else {
            PrepareVote::Ok
        })
    }

    fn commit(&self, xid: &Xid, one_phase: bool) -> Result<(), BranchError> {
        self.record(XaCall::Commit {
            xid: xid.clone(),
            one_phase,
        })
        .map(|_| ())
    }

    fn rollback(&self, xid: &Xid) -> Result<(), BranchError> {
        self.record(XaCall::Rollback(xid.clone())).map(|_| ())
    }

    fn forget(&self, xid: &Xid) -> Result<(), BranchError> {
        self.record(XaCall::Forget(xid.clone())).map(|_| ())
    }
}
