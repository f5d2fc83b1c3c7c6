//! Execution lifecycle.
//!
//! `Created -> Executing -> Streaming* -> Closed`, or `Cancelled` from any
//! state before `Closed`. Closing a cancelled execution still moves it to
//! `Closed`.
//!
//! One thread drives `execute`/`next`. `cancel` and `close` may be called
//! from any thread. A close that finds the driving thread holding the
//! execution is recorded and performed by that thread at its next
//! checkpoint, or as it returns.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use federa_error::{ConnectorError, Result};
use parking_lot::Mutex;
use tracing::debug;

use crate::command::{Call, Command};
use crate::context::{CancelFlag, ExecutionContext};
use crate::pool::PooledConnection;
use crate::value::{Row, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExecutionState {
    Created = 0,
    Executing = 1,
    Streaming = 2,
    Closed = 3,
    Cancelled = 4,
}

impl ExecutionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ExecutionState::Created,
            1 => ExecutionState::Executing,
            2 => ExecutionState::Streaming,
            3 => ExecutionState::Closed,
            _ => ExecutionState::Cancelled,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ExecutionState::Created | ExecutionState::Executing | ExecutionState::Streaming
        )
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionState::Created => "created",
            ExecutionState::Executing => "executing",
            ExecutionState::Streaming => "streaming",
            ExecutionState::Closed => "closed",
            ExecutionState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Backend side of an execution.
///
/// Implementations only ever see their connection through the lease and may
/// poll `ctx.cancel_flag()` during long backend calls.
pub trait BackendExecution<C: Send + 'static>: Send {
    fn execute(&mut self, conn: &PooledConnection<C>, ctx: &ExecutionContext) -> Result<()>;

    /// Fetch up to `batch_size` rows. None signals end of data.
    fn next_batch(
        &mut self,
        conn: &PooledConnection<C>,
        ctx: &ExecutionContext,
        batch_size: usize,
    ) -> Result<Option<Vec<Row>>>;

    /// Output parameter values by name. Only called for procedures.
    fn output_parameters(&mut self, conn: &PooledConnection<C>) -> Result<Vec<(String, Value)>> {
        let _ = conn;
        Ok(Vec::new())
    }

    /// Affected row counts, one per statement. Only called for updates.
    fn update_counts(&self) -> Vec<u64> {
        Vec::new()
    }

    /// Release backend resources held for this execution. The connection
    /// goes back to the pool afterwards.
    fn close(&mut self, conn: &PooledConnection<C>) {
        let _ = conn;
    }
}

/// Engine facing execution handle.
pub trait Execution: Send + Sync + fmt::Debug {
    fn execute(&self) -> Result<()>;

    /// Next row, or None at end of data.
    fn next(&self) -> Result<Option<Row>>;

    /// Next batch of rows, or None at end of data.
    fn next_batch(&self) -> Result<Option<Vec<Row>>>;

    /// Procedure output values, return parameter first. Only available
    /// once closed.
    fn output_parameter_values(&self) -> Result<Vec<Value>>;

    fn update_counts(&self) -> Result<Vec<u64>>;

    fn cancel(&self);

    fn close(&self);

    fn state(&self) -> ExecutionState;

    fn was_cancelled(&self) -> bool;

    fn cancel_handle(&self) -> CancelHandle;

    fn context(&self) -> &ExecutionContext;

    fn command(&self) -> &Arc<Command>;
}

#[derive(Debug)]
struct ExecutionShared {
    id: String,
    state: AtomicU8,
    cancel: CancelFlag,
    close_requested: AtomicBool,
    was_cancelled: AtomicBool,
}

impl ExecutionShared {
    fn state(&self) -> ExecutionState {
        ExecutionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn transition(&self, from: ExecutionState, to: ExecutionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Move any active state to cancelled.
    fn mark_cancelled(&self) -> bool {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            if !ExecutionState::from_u8(current).is_active() {
                return false;
            }
            match self.state.compare_exchange(
                current,
                ExecutionState::Cancelled as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    self.was_cancelled.store(true, Ordering::SeqCst);
                    debug!(execution_id = %self.id, "execution cancelled");
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }
}

/// Cancels an execution without touching its lock.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    shared: Arc<ExecutionShared>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.shared.cancel.cancel();
        self.shared.mark_cancelled();
    }

    pub fn execution_id(&self) -> &str {
        &self.shared.id
    }

    pub fn state(&self) -> ExecutionState {
        self.shared.state()
    }
}

struct Inner<C: Send + 'static> {
    backend: Box<dyn BackendExecution<C>>,
    /// None once released.
    conn: Option<PooledConnection<C>>,
    buffer: VecDeque<Row>,
    exhausted: bool,
    outputs: Option<Result<Vec<Value>, String>>,
    update_counts: Option<Vec<u64>>,
}

impl<C: Send + 'static> Inner<C> {
    /// Collect results, close the backend side and release the connection.
    fn finish(&mut self, shared: &ExecutionShared, command: &Command) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let cancelled = shared.cancel.is_cancelled();

        if let Some(call) = command.as_call() {
            if !cancelled {
                self.outputs = Some(
                    self.backend
                        .output_parameters(&conn)
                        .map(|values| order_outputs(call, values))
                        .map_err(|e| e.to_string()),
                );
            }
        }
        if command.is_update() {
            self.update_counts = Some(self.backend.update_counts());
        }

        self.backend.close(&conn);
        debug!(execution_id = %shared.id, handle_id = conn.handle_id(), "releasing connection");
        conn.release();
    }

    fn close(&mut self, shared: &ExecutionShared, command: &Command) {
        self.finish(shared, command);
        self.buffer.clear();
        let prev = ExecutionState::from_u8(
            shared
                .state
                .swap(ExecutionState::Closed as u8, Ordering::SeqCst),
        );
        if prev == ExecutionState::Cancelled {
            shared.was_cancelled.store(true, Ordering::SeqCst);
        }
        if prev != ExecutionState::Closed {
            debug!(execution_id = %shared.id, from = %prev, "execution closed");
        }
    }
}

/// Order output values the way the call declares them. Missing values are
/// null.
fn order_outputs(call: &Call, values: Vec<(String, Value)>) -> Vec<Value> {
    call.output_parameters()
        .into_iter()
        .map(|param| {
            values
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(&param.name))
                .map(|(_, v)| v.clone())
                .unwrap_or(Value::Null)
        })
        .collect()
}

/// Drives a [`BackendExecution`] over a pooled connection.
pub struct ConnectorExecution<C: Send + 'static> {
    shared: Arc<ExecutionShared>,
    ctx: ExecutionContext,
    command: Arc<Command>,
    inner: Mutex<Inner<C>>,
}

impl<C: Send + 'static> ConnectorExecution<C> {
    pub fn new(
        command: Arc<Command>,
        ctx: ExecutionContext,
        conn: PooledConnection<C>,
        backend: Box<dyn BackendExecution<C>>,
    ) -> Self {
        let shared = Arc::new(ExecutionShared {
            id: ctx.execution_id(),
            state: AtomicU8::new(ExecutionState::Created as u8),
            cancel: ctx.cancel_flag().clone(),
            close_requested: AtomicBool::new(false),
            was_cancelled: AtomicBool::new(false),
        });
        debug!(execution_id = %shared.id, command = %command, handle_id = conn.handle_id(), "execution created");
        ConnectorExecution {
            shared,
            ctx,
            command,
            inner: Mutex::new(Inner {
                backend,
                conn: Some(conn),
                buffer: VecDeque::new(),
                exhausted: false,
                outputs: None,
                update_counts: None,
            }),
        }
    }

    fn cancelled_error(&self) -> ConnectorError {
        ConnectorError::Cancelled(format!("Execution {} was cancelled", self.shared.id))
    }

    fn closed_error(&self) -> ConnectorError {
        ConnectorError::invalid_state(format!("Execution {} was closed", self.shared.id))
    }

    fn execute_locked(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.checkpoint(&mut inner)?;

        if !self
            .shared
            .transition(ExecutionState::Created, ExecutionState::Executing)
        {
            let state = self.shared.state();
            if state == ExecutionState::Cancelled {
                return Err(self.cancelled_error());
            }
            return Err(ConnectorError::invalid_state(format!(
                "Cannot execute {} in state {state}",
                self.shared.id
            )));
        }
        debug!(execution_id = %self.shared.id, command = %self.command, "executing");

        let result = {
            let Inner { backend, conn, .. } = &mut *inner;
            match conn.as_ref() {
                Some(conn) => backend.execute(conn, &self.ctx),
                None => Err(ConnectorError::invalid_state("Execution has no connection")),
            }
        };
        let result = self.observe(result);
        if self.deferred_close(&mut inner) {
            result?;
            return Err(self.closed_error());
        }
        result
    }

    fn next_locked(&self) -> Result<Option<Row>> {
        let mut inner = self.inner.lock();
        self.ready(&mut inner)?;
        if let Some(row) = inner.buffer.pop_front() {
            return Ok(Some(row));
        }
        match self.fetch(&mut inner)? {
            Some(rows) => {
                inner.buffer.extend(rows);
                Ok(inner.buffer.pop_front())
            }
            None => Ok(None),
        }
    }

    fn next_batch_locked(&self) -> Result<Option<Vec<Row>>> {
        let mut inner = self.inner.lock();
        self.ready(&mut inner)?;
        if !inner.buffer.is_empty() {
            return Ok(Some(inner.buffer.drain(..).collect()));
        }
        self.fetch(&mut inner)
    }

    /// Perform a close that arrived while the driving thread held the lock.
    /// Runs after every driver call, once the lock is released.
    fn close_if_requested(&self) {
        if !self.shared.close_requested.load(Ordering::SeqCst)
            || self.shared.state() == ExecutionState::Closed
        {
            return;
        }
        // On contention the lock holder performs the close when it finishes.
        if let Some(mut inner) = self.inner.try_lock() {
            debug!(execution_id = %self.shared.id, "performing close requested during driver call");
            inner.close(&self.shared, &self.command);
        }
    }

    /// Perform a close requested by another thread.
    fn deferred_close(&self, inner: &mut Inner<C>) -> bool {
        if self.shared.close_requested.load(Ordering::SeqCst) {
            inner.close(&self.shared, &self.command);
            return true;
        }
        false
    }

    /// Perform a deferred close and observe cancellation.
    fn checkpoint(&self, inner: &mut Inner<C>) -> Result<()> {
        if self.deferred_close(inner) {
            return Err(self.closed_error());
        }
        if self.shared.cancel.is_cancelled() {
            self.shared.mark_cancelled();
            return Err(self.cancelled_error());
        }
        Ok(())
    }

    /// Map backend failures caused by cancellation.
    fn observe<T>(&self, result: Result<T>) -> Result<T> {
        match result {
            Err(e) if self.shared.cancel.is_cancelled() && !e.is_cancellation() => {
                debug!(execution_id = %self.shared.id, error = %e, "backend error after cancellation");
                self.shared.mark_cancelled();
                Err(self.cancelled_error())
            }
            Err(e) if e.is_cancellation() => {
                self.shared.mark_cancelled();
                Err(e)
            }
            other => other,
        }
    }

    /// Check the execution can produce rows.
    fn ready(&self, inner: &mut Inner<C>) -> Result<()> {
        match self.shared.state() {
            ExecutionState::Closed => {
                return Err(ConnectorError::invalid_state(format!(
                    "Execution {} is closed",
                    self.shared.id
                )));
            }
            ExecutionState::Cancelled => return Err(self.cancelled_error()),
            _ => (),
        }
        self.checkpoint(inner)?;
        match self.shared.state() {
            ExecutionState::Executing | ExecutionState::Streaming => Ok(()),
            ExecutionState::Cancelled => Err(self.cancelled_error()),
            state => Err(ConnectorError::invalid_state(format!(
                "Cannot fetch from execution {} in state {state}",
                self.shared.id
            ))),
        }
    }

    fn fetch(&self, inner: &mut Inner<C>) -> Result<Option<Vec<Row>>> {
        loop {
            self.ready(inner)?;
            if inner.exhausted {
                return Ok(None);
            }

            let page = {
                let Inner { backend, conn, .. } = &mut *inner;
                match conn.as_ref() {
                    Some(conn) => backend.next_batch(conn, &self.ctx, self.ctx.batch_size()),
                    None => Ok(None),
                }
            };
            let page = self.observe(page);
            if self.deferred_close(inner) {
                page?;
                return Err(self.closed_error());
            }
            let page = page?;

            match page {
                Some(rows) => {
                    self.shared
                        .transition(ExecutionState::Executing, ExecutionState::Streaming);
                    if rows.is_empty() {
                        continue;
                    }
                    return Ok(Some(rows));
                }
                None => {
                    inner.exhausted = true;
                    debug!(execution_id = %self.shared.id, "end of data");
                    if !self.ctx.keep_alive() {
                        inner.finish(&self.shared, &self.command);
                    }
                    return Ok(None);
                }
            }
        }
    }
}

impl<C: Send + 'static> fmt::Debug for ConnectorExecution<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorExecution")
            .field("id", &self.shared.id)
            .field("state", &self.shared.state())
            .field("command", &self.command)
            .finish_non_exhaustive()
    }
}

impl<C: Send + 'static> Execution for ConnectorExecution<C> {
    fn execute(&self) -> Result<()> {
        let result = self.execute_locked();
        self.close_if_requested();
        result
    }

    fn next(&self) -> Result<Option<Row>> {
        let result = self.next_locked();
        self.close_if_requested();
        result
    }

    fn next_batch(&self) -> Result<Option<Vec<Row>>> {
        let result = self.next_batch_locked();
        self.close_if_requested();
        result
    }

    fn output_parameter_values(&self) -> Result<Vec<Value>> {
        if !self.command.is_procedure() {
            return Err(ConnectorError::invalid_state(format!(
                "Execution {} is not a procedure call",
                self.shared.id
            )));
        }
        if self.shared.state() != ExecutionState::Closed {
            return Err(ConnectorError::invalid_state(format!(
                "Output parameters of {} are available once closed",
                self.shared.id
            )));
        }
        let inner = self.inner.lock();
        match &inner.outputs {
            Some(Ok(values)) => Ok(values.clone()),
            Some(Err(msg)) => Err(ConnectorError::source_operation(msg.clone())),
            None => Err(self.cancelled_error()),
        }
    }

    fn update_counts(&self) -> Result<Vec<u64>> {
        if !self.command.is_update() {
            return Err(ConnectorError::invalid_state(format!(
                "Execution {} is not an update",
                self.shared.id
            )));
        }
        if self.shared.state() == ExecutionState::Created {
            return Err(ConnectorError::invalid_state(format!(
                "Execution {} has not been executed",
                self.shared.id
            )));
        }
        let counts = {
            let inner = self.inner.lock();
            match &inner.update_counts {
                Some(counts) => counts.clone(),
                None => inner.backend.update_counts(),
            }
        };
        self.close_if_requested();
        Ok(counts)
    }

    fn cancel(&self) {
        self.cancel_handle().cancel();
    }

    fn close(&self) {
        if self.shared.state() == ExecutionState::Closed {
            return;
        }
        self.shared.close_requested.store(true, Ordering::SeqCst);
        match self.inner.try_lock() {
            Some(mut inner) => inner.close(&self.shared, &self.command),
            None => debug!(execution_id = %self.shared.id, "close deferred to driving thread"),
        }
    }

    fn state(&self) -> ExecutionState {
        self.shared.state()
    }

    fn was_cancelled(&self) -> bool {
        self.shared.was_cancelled.load(Ordering::SeqCst)
    }

    fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            shared: self.shared.clone(),
        }
    }

    fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    fn command(&self) -> &Arc<Command> {
        &self.command
    }
}

impl<C: Send + 'static> Drop for ConnectorExecution<C> {
    fn drop(&mut self) {
        if self.shared.state() != ExecutionState::Closed {
            self.inner.get_mut().close(&self.shared, &self.command);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::command::{Delete, ParameterDirection, ProcedureParameter, Select};
    use crate::config::PoolConfig;
    use crate::identity::ConnectorIdentity;
    use crate::pool::{ConnectionPool, ManageConnection};
    use crate::value::ValueType;

    struct Manager;

    impl ManageConnection for Manager {
        type Connection = ();

        fn connect(&self, _identity: &ConnectorIdentity) -> Result<()> {
            Ok(())
        }

        fn is_valid(&self, _conn: &mut ()) -> Result<()> {
            Ok(())
        }
    }

    /// Serves `pages` then end of data. Blocks on a page of `None` rows
    /// until cancelled.
    struct Scripted {
        pages: VecDeque<Option<Vec<Row>>>,
        closed: Arc<AtomicBool>,
    }

    impl BackendExecution<()> for Scripted {
        fn execute(&mut self, _conn: &PooledConnection<()>, _ctx: &ExecutionContext) -> Result<()> {
            Ok(())
        }

        fn next_batch(
            &mut self,
            _conn: &PooledConnection<()>,
            ctx: &ExecutionContext,
            _batch_size: usize,
        ) -> Result<Option<Vec<Row>>> {
            match self.pages.pop_front() {
                Some(Some(rows)) => Ok(Some(rows)),
                Some(None) => loop {
                    ctx.cancel_flag().check("blocked fetch")?;
                    thread::sleep(Duration::from_millis(1));
                },
                None => Ok(None),
            }
        }

        fn output_parameters(&mut self, _conn: &PooledConnection<()>) -> Result<Vec<(String, Value)>> {
            Ok(vec![
                ("b".to_string(), Value::Int(2)),
                ("ret".to_string(), Value::Int(0)),
            ])
        }

        fn update_counts(&self) -> Vec<u64> {
            vec![3]
        }

        fn close(&mut self, _conn: &PooledConnection<()>) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn pool() -> ConnectionPool<()> {
        let config = PoolConfig {
            max_pool_size: 1,
            wait_time_for_resource: Duration::from_millis(1),
            ..Default::default()
        };
        ConnectionPool::new("exec", config, Manager).unwrap()
    }

    fn execution(
        pool: &ConnectionPool<()>,
        command: Command,
        ctx: ExecutionContext,
        pages: Vec<Option<Vec<Row>>>,
    ) -> (Arc<ConnectorExecution<()>>, Arc<AtomicBool>) {
        let closed = Arc::new(AtomicBool::new(false));
        let conn = pool.lease(&ConnectorIdentity::Singleton).unwrap();
        let backend = Scripted {
            pages: pages.into(),
            closed: closed.clone(),
        };
        let exec = ConnectorExecution::new(Arc::new(command), ctx, conn, Box::new(backend));
        (Arc::new(exec), closed)
    }

    fn select() -> Command {
        Command::Select(Select::all("t"))
    }

    #[test]
    fn lifecycle_and_rows() {
        let pool = pool();
        let (exec, closed) = execution(
            &pool,
            select(),
            ExecutionContext::new("r").with_keep_alive(true),
            vec![
                Some(vec![vec![Value::Int(1)], vec![Value::Int(2)]]),
                Some(vec![]),
                Some(vec![vec![Value::Int(3)]]),
            ],
        );

        assert_eq!(ExecutionState::Created, exec.state());
        assert!(matches!(exec.next(), Err(ConnectorError::InvalidState(_))));

        exec.execute().unwrap();
        assert_eq!(ExecutionState::Executing, exec.state());
        assert!(matches!(exec.execute(), Err(ConnectorError::InvalidState(_))));

        let mut seen = Vec::new();
        while let Some(row) = exec.next().unwrap() {
            seen.push(row[0].clone());
        }
        assert_eq!(vec![Value::Int(1), Value::Int(2), Value::Int(3)], seen);
        assert_eq!(ExecutionState::Streaming, exec.state());
        // Keep alive holds the connection until close.
        assert_eq!(1, pool.stats().leased);
        assert!(!closed.load(Ordering::SeqCst));

        exec.close();
        exec.close();
        assert_eq!(ExecutionState::Closed, exec.state());
        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(0, pool.stats().leased);
        assert!(matches!(exec.next(), Err(ConnectorError::InvalidState(_))));
    }

    #[test]
    fn end_of_data_releases_without_keep_alive() {
        let pool = pool();
        let (exec, _) = execution(
            &pool,
            select(),
            ExecutionContext::new("r"),
            vec![Some(vec![vec![Value::Int(1)]])],
        );
        exec.execute().unwrap();
        assert_eq!(1, exec.next_batch().unwrap().unwrap().len());
        assert_eq!(None, exec.next_batch().unwrap());
        assert_eq!(0, pool.stats().leased);
        assert_eq!(None, exec.next().unwrap());
    }

    #[test]
    fn cancel_blocked_fetch_from_other_thread() {
        let pool = pool();
        let (exec, _) = execution(&pool, select(), ExecutionContext::new("r"), vec![None]);
        exec.execute().unwrap();

        let handle = exec.cancel_handle();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            handle.cancel();
        });

        let err = exec.next().unwrap_err();
        assert!(err.is_cancellation(), "{err}");
        canceller.join().unwrap();
        assert_eq!(ExecutionState::Cancelled, exec.state());
        assert!(exec.next().unwrap_err().is_cancellation());

        exec.close();
        assert_eq!(ExecutionState::Closed, exec.state());
        assert!(exec.was_cancelled());
        assert_eq!(0, pool.stats().leased);
    }

    #[test]
    fn close_from_other_thread_is_deferred() {
        let pool = pool();
        let ctx = ExecutionContext::new("r");
        let flag = ctx.cancel_flag().clone();
        let (exec, closed) = execution(&pool, select(), ctx, vec![None]);
        exec.execute().unwrap();

        let driver = {
            let exec = exec.clone();
            thread::spawn(move || exec.next())
        };
        thread::sleep(Duration::from_millis(20));
        exec.close();
        // Still inside the backend call.
        assert_ne!(ExecutionState::Closed, exec.state());

        flag.cancel();
        assert!(driver.join().unwrap().is_err());
        assert_eq!(ExecutionState::Closed, exec.state());
        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(0, pool.stats().leased);
    }

    #[test]
    fn close_while_driver_holds_lock_runs_on_release() {
        let pool = pool();
        let (exec, closed) = execution(&pool, select(), ExecutionContext::new("r"), vec![]);
        exec.execute().unwrap();

        let guard = exec.inner.lock();
        exec.close();
        assert_ne!(ExecutionState::Closed, exec.state());
        drop(guard);

        exec.close_if_requested();
        assert_eq!(ExecutionState::Closed, exec.state());
        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(0, pool.stats().leased);
    }

    #[test]
    fn close_racing_update_counts_is_not_lost() {
        let pool = pool();
        let delete = Command::Delete(Delete {
            table: "t".to_string(),
            filter: None,
        });
        let (exec, closed) = execution(&pool, delete, ExecutionContext::new("r"), vec![]);
        exec.execute().unwrap();

        let guard = exec.inner.lock();
        exec.close();
        let reader = {
            let exec = exec.clone();
            thread::spawn(move || exec.update_counts())
        };
        thread::sleep(Duration::from_millis(20));
        drop(guard);

        assert_eq!(vec![3], reader.join().unwrap().unwrap());
        assert_eq!(ExecutionState::Closed, exec.state());
        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(0, pool.stats().leased);
    }

    #[test]
    fn output_parameters_after_close() {
        let pool = pool();
        let call = Command::Call(Call {
            procedure: "p".to_string(),
            parameters: vec![
                ProcedureParameter::input("a", Value::Int(1)),
                ProcedureParameter::output("b", ParameterDirection::Out, ValueType::Int),
                ProcedureParameter::output("c", ParameterDirection::InOut, ValueType::Int),
                ProcedureParameter::output("ret", ParameterDirection::Return, ValueType::Int),
            ],
        });
        let (exec, _) = execution(&pool, call, ExecutionContext::new("r"), vec![]);
        exec.execute().unwrap();
        assert!(matches!(
            exec.output_parameter_values(),
            Err(ConnectorError::InvalidState(_))
        ));
        exec.close();
        assert_eq!(
            vec![Value::Int(0), Value::Int(2), Value::Null],
            exec.output_parameter_values().unwrap()
        );
        assert!(exec.update_counts().is_err());
    }

    #[test]
    fn update_counts_for_updates() {
        let pool = pool();
        let delete = Command::Delete(Delete {
            table: "t".to_string(),
            filter: None,
        });
        let (exec, _) = execution(&pool, delete, ExecutionContext::new("r"), vec![]);
        assert!(exec.update_counts().is_err());
        exec.execute().unwrap();
        assert_eq!(vec![3], exec.update_counts().unwrap());
        exec.close();
        assert_eq!(vec![3], exec.update_counts().unwrap());
    }

    #[test]
    fn drop_releases_connection() {
        let pool = pool();
        let (exec, closed) = execution(&pool, select(), ExecutionContext::new("r"), vec![]);
        exec.execute().unwrap();
        drop(exec);
        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(0, pool.stats().leased);
    }
}
