//! Coordinates the branches opened by one federated transaction.
//!
//! Branch failures are resolved by kind: unavailable resource managers are
//! retried, rollback-only branches roll the whole transaction back, and
//! heuristic outcomes are left in doubt for an operator.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::thread;

use chrono::{DateTime, Utc};
use federa_error::{BranchError, BranchErrorKind, ConnectorError, Resolution, Result};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::{PrepareVote, XaResource, Xid};
use crate::config::TransactionConfig;
use crate::execution::CancelHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    RollbackOnly,
    Prepared,
    Committed,
    RolledBack,
    /// At least one branch needs operator attention.
    InDoubt,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransactionState::Active => "active",
            TransactionState::RollbackOnly => "rollback-only",
            TransactionState::Prepared => "prepared",
            TransactionState::Committed => "committed",
            TransactionState::RolledBack => "rolled-back",
            TransactionState::InDoubt => "in-doubt",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchState {
    Active,
    Ended,
    Prepared,
    ReadOnly,
    Committed,
    RolledBack,
    InDoubt(BranchErrorKind),
}

impl BranchState {
    fn is_complete(&self) -> bool {
        matches!(
            self,
            BranchState::ReadOnly
                | BranchState::Committed
                | BranchState::RolledBack
                | BranchState::InDoubt(_)
        )
    }
}

/// A branch whose outcome could not be resolved automatically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InDoubtBranch {
    pub transaction_id: String,
    pub xid: Xid,
    pub connector: String,
    pub error: BranchError,
}

#[derive(Debug)]
struct Branch {
    xid: Xid,
    connector: String,
    resource: Arc<dyn XaResource>,
    state: BranchState,
    failure: Option<BranchError>,
}

#[derive(Debug)]
struct GlobalTransaction {
    state: TransactionState,
    branches: Vec<Branch>,
    next_ordinal: u16,
}

#[derive(Debug)]
struct TransactionEntry {
    xid: Xid,
    transaction_id: String,
    session_id: String,
    started_at: DateTime<Utc>,
    /// Kept outside `inner` so termination never waits on a branch call.
    enlisted: Mutex<Vec<(Xid, CancelHandle)>>,
    inner: Mutex<GlobalTransaction>,
}

impl TransactionEntry {
    fn cancel_enlisted(&self, branch: Option<&Xid>) {
        let enlisted = self.enlisted.lock();
        for (xid, handle) in enlisted.iter() {
            if branch.is_none_or(|b| b == xid) {
                debug!(transaction_id = %self.transaction_id, branch = %xid, execution_id = handle.execution_id(), "cancelling enlisted execution");
                handle.cancel();
            }
        }
    }
}

/// Tracks distributed transactions and their branches.
#[derive(Debug)]
pub struct TransactionCoordinator {
    config: TransactionConfig,
    transactions: RwLock<HashMap<Xid, Arc<TransactionEntry>>>,
}

impl TransactionCoordinator {
    pub fn new(config: TransactionConfig) -> Self {
        TransactionCoordinator {
            config,
            transactions: RwLock::new(HashMap::new()),
        }
    }

    /// Register a global transaction owned by `session_id`. Returns the
    /// transaction id.
    pub fn begin(&self, xid: Xid, session_id: impl Into<String>) -> Result<String> {
        let mut transactions = self.transactions.write();
        if transactions.contains_key(&xid) {
            return Err(ConnectorError::invalid_state(format!(
                "Transaction {xid} already exists"
            )));
        }
        let entry = TransactionEntry {
            transaction_id: xid.key(),
            session_id: session_id.into(),
            started_at: Utc::now(),
            enlisted: Mutex::new(Vec::new()),
            inner: Mutex::new(GlobalTransaction {
                state: TransactionState::Active,
                branches: Vec::new(),
                next_ordinal: 1,
            }),
            xid: xid.clone(),
        };
        let transaction_id = entry.transaction_id.clone();
        info!(%transaction_id, session_id = %entry.session_id, "transaction started");
        transactions.insert(xid, Arc::new(entry));
        Ok(transaction_id)
    }

    /// Open a branch of `xid` on `resource` and return the branch id.
    pub fn begin_branch(&self, xid: &Xid, connector: &str, resource: Arc<dyn XaResource>) -> Result<Xid> {
        let entry = self.entry(xid)?;
        let mut txn = entry.inner.lock();
        match txn.state {
            TransactionState::Active => (),
            TransactionState::RollbackOnly => {
                return Err(BranchError::rollback_only(format!(
                    "Transaction {} is marked rollback-only",
                    entry.transaction_id
                ))
                .into());
            }
            state => {
                return Err(ConnectorError::invalid_state(format!(
                    "Cannot add a branch to transaction {} in state {state}",
                    entry.transaction_id
                )));
            }
        }

        let branch_xid = xid.branch(txn.next_ordinal)?;
        resource.start(&branch_xid)?;
        txn.next_ordinal = txn.next_ordinal.checked_add(1).ok_or_else(|| {
            ConnectorError::invalid_state(format!(
                "Transaction {} has too many branches",
                entry.transaction_id
            ))
        })?;

        debug!(transaction_id = %entry.transaction_id, branch = %branch_xid, %connector, "branch started");
        txn.branches.push(Branch {
            xid: branch_xid.clone(),
            connector: connector.to_string(),
            resource,
            state: BranchState::Active,
            failure: None,
        });
        Ok(branch_xid)
    }

    /// Attach an execution to a branch so termination can cancel it.
    pub fn enlist(&self, branch: &Xid, handle: CancelHandle) -> Result<()> {
        let entry = self.entry_for_branch(branch)?;
        entry.enlisted.lock().push((branch.clone(), handle));
        Ok(())
    }

    pub fn mark_rollback_only(&self, xid: &Xid) -> Result<()> {
        let entry = self.entry(xid)?;
        let mut txn = entry.inner.lock();
        match txn.state {
            TransactionState::Active | TransactionState::RollbackOnly => {
                txn.state = TransactionState::RollbackOnly;
                info!(transaction_id = %entry.transaction_id, "transaction marked rollback-only");
                Ok(())
            }
            state => Err(ConnectorError::invalid_state(format!(
                "Cannot mark transaction {} rollback-only in state {state}",
                entry.transaction_id
            ))),
        }
    }

    /// First phase of two-phase commit. Any failed branch rolls the whole
    /// transaction back.
    pub fn prepare(&self, xid: &Xid) -> Result<Vec<(Xid, PrepareVote)>> {
        let entry = self.entry(xid)?;
        let mut txn = entry.inner.lock();
        let result = self.prepare_locked(&entry, &mut txn);
        let state = txn.state;
        drop(txn);
        self.finish(&entry, state);
        result
    }

    /// Commit every branch. Uses one-phase commit when a single branch
    /// participates.
    pub fn commit(&self, xid: &Xid) -> Result<()> {
        let entry = self.entry(xid)?;
        let mut txn = entry.inner.lock();
        let result = self.commit_locked(&entry, &mut txn);
        let state = txn.state;
        drop(txn);
        self.finish(&entry, state);
        result
    }

    pub fn commit_branch(&self, branch: &Xid, one_phase: bool) -> Result<()> {
        let entry = self.entry_for_branch(branch)?;
        let mut txn = entry.inner.lock();
        let result = self.commit_branch_locked(&entry, &mut txn, branch, one_phase);
        let state = Self::settle(&entry, &mut txn);
        drop(txn);
        self.finish(&entry, state);
        result
    }

    pub fn rollback_branch(&self, branch: &Xid) -> Result<()> {
        let entry = self.entry_for_branch(branch)?;
        entry.cancel_enlisted(Some(branch));
        let mut txn = entry.inner.lock();
        let result = match txn.branches.iter_mut().find(|b| &b.xid == branch) {
            Some(branch) => match self.rollback_one(&entry, branch) {
                Some(e) => Err(e.into()),
                None => Ok(()),
            },
            None => Err(ConnectorError::InvalidArgument(format!("Unknown branch {branch}"))),
        };
        let state = Self::settle(&entry, &mut txn);
        drop(txn);
        self.finish(&entry, state);
        result
    }

    /// Roll back every branch.
    pub fn rollback(&self, xid: &Xid) -> Result<()> {
        let entry = self.entry(xid)?;
        entry.cancel_enlisted(None);
        let mut txn = entry.inner.lock();
        let result = self.rollback_locked(&entry, &mut txn);
        let state = txn.state;
        drop(txn);
        self.finish(&entry, state);
        result
    }

    /// Cancel and roll back a transaction identified only by its id and
    /// owning session.
    ///
    /// Enlisted executions are cancelled through their cancel handles, never
    /// through their own locks.
    pub fn terminate(&self, transaction_id: &str, session_id: &str) -> Result<()> {
        let entry = self
            .transactions
            .read()
            .values()
            .find(|e| e.transaction_id == transaction_id)
            .cloned()
            .ok_or_else(|| {
                ConnectorError::InvalidArgument(format!("Unknown transaction '{transaction_id}'"))
            })?;

        if entry.session_id != session_id {
            return Err(ConnectorError::Security(format!(
                "Session '{session_id}' does not own transaction '{transaction_id}'"
            )));
        }

        info!(%transaction_id, %session_id, "terminating transaction");
        entry.cancel_enlisted(None);
        let mut txn = entry.inner.lock();
        let result = self.rollback_locked(&entry, &mut txn);
        let state = txn.state;
        drop(txn);
        self.finish(&entry, state);
        result
    }

    /// Forget an in-doubt transaction once an operator has resolved it.
    pub fn forget(&self, xid: &Xid) -> Result<()> {
        let entry = self.entry(xid)?;
        let txn = entry.inner.lock();
        if txn.state != TransactionState::InDoubt {
            return Err(ConnectorError::invalid_state(format!(
                "Transaction {} is not in doubt",
                entry.transaction_id
            )));
        }
        for branch in &txn.branches {
            if let BranchState::InDoubt(_) = branch.state {
                if let Err(e) = branch.resource.forget(&branch.xid) {
                    warn!(transaction_id = %entry.transaction_id, branch = %branch.xid, error = %e, "failed to forget branch");
                }
            }
        }
        info!(transaction_id = %entry.transaction_id, "forgot in-doubt transaction");
        drop(txn);
        self.transactions.write().remove(&entry.xid);
        Ok(())
    }

    /// Branches awaiting operator resolution.
    pub fn in_doubt(&self) -> Vec<InDoubtBranch> {
        let entries: Vec<_> = self.transactions.read().values().cloned().collect();
        let mut out = Vec::new();
        for entry in entries {
            let txn = entry.inner.lock();
            for branch in &txn.branches {
                if let (BranchState::InDoubt(kind), failure) = (branch.state, &branch.failure) {
                    out.push(InDoubtBranch {
                        transaction_id: entry.transaction_id.clone(),
                        xid: branch.xid.clone(),
                        connector: branch.connector.clone(),
                        error: failure
                            .clone()
                            .unwrap_or_else(|| BranchError::new(kind, "in doubt")),
                    });
                }
            }
        }
        out.sort_by(|a, b| a.xid.cmp(&b.xid));
        out
    }

    /// State of a tracked transaction. Completed transactions are no longer
    /// tracked.
    pub fn state(&self, xid: &Xid) -> Option<TransactionState> {
        let entry = self.transactions.read().get(xid).cloned()?;
        let state = entry.inner.lock().state;
        Some(state)
    }

    pub fn branch_states(&self, xid: &Xid) -> Vec<(Xid, BranchState)> {
        match self.transactions.read().get(xid).cloned() {
            Some(entry) => entry
                .inner
                .lock()
                .branches
                .iter()
                .map(|b| (b.xid.clone(), b.state))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Ids and start times of tracked transactions.
    pub fn transactions(&self) -> Vec<(String, DateTime<Utc>)> {
        let mut out: Vec<_> = self
            .transactions
            .read()
            .values()
            .map(|e| (e.transaction_id.clone(), e.started_at))
            .collect();
        out.sort();
        out
    }

    /// Roll back every transaction that is still active.
    pub fn rollback_all(&self) {
        let xids: Vec<_> = self.transactions.read().keys().cloned().collect();
        for xid in xids {
            if matches!(
                self.state(&xid),
                Some(TransactionState::Active | TransactionState::RollbackOnly)
            ) {
                if let Err(e) = self.rollback(&xid) {
                    warn!(transaction = %xid, error = %e, "failed to roll back transaction");
                }
            }
        }
    }

    fn entry(&self, xid: &Xid) -> Result<Arc<TransactionEntry>> {
        self.transactions
            .read()
            .get(xid)
            .cloned()
            .ok_or_else(|| ConnectorError::InvalidArgument(format!("Unknown transaction {xid}")))
    }

    fn entry_for_branch(&self, branch: &Xid) -> Result<Arc<TransactionEntry>> {
        self.transactions
            .read()
            .values()
            .find(|e| e.xid.same_global(branch) && e.inner.lock().branches.iter().any(|b| &b.xid == branch))
            .cloned()
            .ok_or_else(|| ConnectorError::InvalidArgument(format!("Unknown branch {branch}")))
    }

    /// Stop tracking the transaction once it completed cleanly. Must not be
    /// called with the transaction locked.
    fn finish(&self, entry: &TransactionEntry, state: TransactionState) {
        if matches!(
            state,
            TransactionState::Committed | TransactionState::RolledBack
        ) {
            self.transactions.write().remove(&entry.xid);
        }
    }

    fn commit_branch_locked(
        &self,
        entry: &TransactionEntry,
        txn: &mut GlobalTransaction,
        branch: &Xid,
        one_phase: bool,
    ) -> Result<()> {
        let branch = txn
            .branches
            .iter_mut()
            .find(|b| &b.xid == branch)
            .ok_or_else(|| ConnectorError::InvalidArgument(format!("Unknown branch {branch}")))?;

        match (branch.state, one_phase) {
            (BranchState::Prepared, false) => (),
            (BranchState::Active, true) => {
                if let Err(e) = branch.resource.end(&branch.xid, true) {
                    return Err(self.fail_branch(entry, branch, e));
                }
                branch.state = BranchState::Ended;
            }
            (BranchState::Ended, true) => (),
            (state, _) => {
                return Err(ConnectorError::invalid_state(format!(
                    "Cannot commit branch {} in state {state:?}",
                    branch.xid
                )));
            }
        }

        match self.with_retry(&branch.xid, "commit", || branch.resource.commit(&branch.xid, one_phase)) {
            Ok(()) => {
                branch.state = BranchState::Committed;
                info!(transaction_id = %entry.transaction_id, branch = %branch.xid, one_phase, "branch committed");
                Ok(())
            }
            Err(e) => Err(self.fail_branch(entry, branch, e)),
        }
    }

    /// Derive the transaction state after a branch level operation.
    ///
    /// Once every branch is complete the transaction is committed, rolled
    /// back or in doubt. A rollback of some branches of an active
    /// transaction makes it rollback-only.
    fn settle(entry: &TransactionEntry, txn: &mut GlobalTransaction) -> TransactionState {
        let branches = &txn.branches;
        if branches.iter().all(|b| b.state.is_complete()) {
            let state = if branches.iter().any(|b| matches!(b.state, BranchState::InDoubt(_))) {
                TransactionState::InDoubt
            } else if branches.iter().any(|b| b.state == BranchState::Committed) {
                TransactionState::Committed
            } else {
                TransactionState::RolledBack
            };
            if state != txn.state {
                info!(transaction_id = %entry.transaction_id, %state, "transaction completed branch by branch");
                txn.state = state;
            }
        } else if txn.state == TransactionState::Active
            && branches.iter().any(|b| b.state == BranchState::RolledBack)
        {
            txn.state = TransactionState::RollbackOnly;
        }
        txn.state
    }

    fn with_retry<T>(
        &self,
        branch: &Xid,
        op: &str,
        mut f: impl FnMut() -> std::result::Result<T, BranchError>,
    ) -> std::result::Result<T, BranchError> {
        let mut retries = 0;
        loop {
            match f() {
                Err(e)
                    if e.kind.resolution() == Resolution::Retry
                        && retries < self.config.commit_retry_attempts =>
                {
                    retries += 1;
                    warn!(%branch, op, retries, error = %e, "retrying branch operation");
                    thread::sleep(self.config.commit_retry_delay);
                }
                other => return other,
            }
        }
    }

    /// Record a failure that leaves the branch unresolved.
    fn fail_branch(&self, entry: &TransactionEntry, branch: &mut Branch, err: BranchError) -> ConnectorError {
        if err.kind == BranchErrorKind::RollbackOnly {
            // The resource manager already rolled the branch back.
            branch.state = BranchState::RolledBack;
        } else {
            error!(transaction_id = %entry.transaction_id, branch = %branch.xid, connector = %branch.connector, kind = %err.kind, error = %err.message, "branch outcome in doubt");
            branch.state = BranchState::InDoubt(err.kind);
            branch.failure = Some(err.clone());
        }
        err.into()
    }

    fn prepare_locked(
        &self,
        entry: &TransactionEntry,
        txn: &mut GlobalTransaction,
    ) -> Result<Vec<(Xid, PrepareVote)>> {
        match txn.state {
            TransactionState::Active => (),
            TransactionState::RollbackOnly => {
                self.rollback_locked(entry, txn)?;
                return Err(BranchError::rollback_only(format!(
                    "Transaction {} was marked rollback-only",
                    entry.transaction_id
                ))
                .into());
            }
            state => {
                return Err(ConnectorError::invalid_state(format!(
                    "Cannot prepare transaction {} in state {state}",
                    entry.transaction_id
                )));
            }
        }

        let mut votes = Vec::with_capacity(txn.branches.len());
        let mut failure = None;
        for branch in txn.branches.iter_mut() {
            if branch.state == BranchState::Active {
                if let Err(e) = branch.resource.end(&branch.xid, true) {
                    failure = Some(e);
                    break;
                }
                branch.state = BranchState::Ended;
            }
            if branch.state != BranchState::Ended {
                continue;
            }
            match branch.resource.prepare(&branch.xid) {
                Ok(vote) => {
                    branch.state = match vote {
                        PrepareVote::Ok => BranchState::Prepared,
                        PrepareVote::ReadOnly => BranchState::ReadOnly,
                    };
                    votes.push((branch.xid.clone(), vote));
                }
                Err(e) => {
                    if e.kind == BranchErrorKind::RollbackOnly {
                        branch.state = BranchState::RolledBack;
                    }
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(err) = failure {
            warn!(transaction_id = %entry.transaction_id, error = %err, "prepare failed, rolling back");
            // Report the prepare failure even if rollback leaves branches in doubt.
            let _ = self.rollback_locked(entry, txn);
            return Err(err.into());
        }

        txn.state = TransactionState::Prepared;
        debug!(transaction_id = %entry.transaction_id, branches = votes.len(), "transaction prepared");
        Ok(votes)
    }

    fn commit_locked(&self, entry: &TransactionEntry, txn: &mut GlobalTransaction) -> Result<()> {
        if txn.state == TransactionState::Active && txn.branches.len() <= 1 {
            if let Some(branch) = txn.branches.first_mut() {
                let result = branch
                    .resource
                    .end(&branch.xid, true)
                    .and_then(|_| {
                        branch.state = BranchState::Ended;
                        self.with_retry(&branch.xid, "commit", || branch.resource.commit(&branch.xid, true))
                    });
                if let Err(e) = result {
                    let err = self.fail_branch(entry, branch, e);
                    txn.state = match branch.state {
                        BranchState::InDoubt(_) => TransactionState::InDoubt,
                        _ => TransactionState::RolledBack,
                    };
                    return Err(err);
                }
                branch.state = BranchState::Committed;
            }
            txn.state = TransactionState::Committed;
            info!(transaction_id = %entry.transaction_id, one_phase = true, "transaction committed");
            return Ok(());
        }

        if txn.state != TransactionState::Prepared {
            self.prepare_locked(entry, txn)?;
        }

        let mut first_error = None;
        for branch in txn.branches.iter_mut() {
            if branch.state != BranchState::Prepared {
                continue;
            }
            match self.with_retry(&branch.xid, "commit", || branch.resource.commit(&branch.xid, false)) {
                Ok(()) => branch.state = BranchState::Committed,
                Err(e) => {
                    // Other branches are committed regardless, a commit can't
                    // be undone.
                    let err = self.fail_branch(entry, branch, e);
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => {
                txn.state = TransactionState::InDoubt;
                Err(err)
            }
            None => {
                txn.state = TransactionState::Committed;
                info!(transaction_id = %entry.transaction_id, branches = txn.branches.len(), "transaction committed");
                Ok(())
            }
        }
    }

    /// Roll back one branch, returning the error if it's left in doubt.
    fn rollback_one(&self, entry: &TransactionEntry, branch: &mut Branch) -> Option<BranchError> {
        if branch.state.is_complete() {
            return None;
        }
        if branch.state == BranchState::Active {
            if let Err(e) = branch.resource.end(&branch.xid, false) {
                debug!(branch = %branch.xid, error = %e, "ending branch before rollback failed");
            }
            branch.state = BranchState::Ended;
        }
        match self.with_retry(&branch.xid, "rollback", || branch.resource.rollback(&branch.xid)) {
            Ok(()) => {
                branch.state = BranchState::RolledBack;
                None
            }
            Err(e) if e.kind == BranchErrorKind::RollbackOnly => {
                branch.state = BranchState::RolledBack;
                None
            }
            Err(e) => {
                let _ = self.fail_branch(entry, branch, e.clone());
                Some(e)
            }
        }
    }

    fn rollback_locked(&self, entry: &TransactionEntry, txn: &mut GlobalTransaction) -> Result<()> {
        let mut first_error = None;
        for branch in txn.branches.iter_mut() {
            if let Some(e) = self.rollback_one(entry, branch) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(err) => {
                txn.state = TransactionState::InDoubt;
                Err(err.into())
            }
            None => {
                txn.state = TransactionState::RolledBack;
                info!(transaction_id = %entry.transaction_id, "transaction rolled back");
                Ok(())
            }
        }
    }
}
