//! The `debug` backend: commands run against a [`DebugStore`].

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use federa_error::{ConnectorError, Result};
use tracing::debug;

use super::store::{DEBUG_FUNCTIONS, DebugStore};
use super::xa::DebugXaResource;
use crate::capability::{self, Capabilities, CapabilityValue};
use crate::command::Command;
use crate::config::ConnectorConfig;
use crate::context::ExecutionContext;
use crate::execution::BackendExecution;
use crate::factory::{Connector, ExecutionFactory, FactoryConnector};
use crate::identity::ConnectorIdentity;
use crate::pool::{ManageConnection, PooledConnection};
use crate::transaction::XaResource;
use crate::value::{Row, Value, ValueType};

pub const DEBUG_BACKEND: &str = "debug";

/// Property holding the JSON seed for the store.
pub const SEED_PROPERTY: &str = "seed";

/// Tables with special behaviour, available in every debug store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugTableType {
    /// Fails on the first fetch.
    ErrorDuringExecution,
    /// Never stops returning rows.
    NeverEnding,
    /// Blocks on the first fetch until cancelled.
    Blocking,
}

impl DebugTableType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DebugTableType::ErrorDuringExecution => "error_during_execution",
            DebugTableType::NeverEnding => "never_ending",
            DebugTableType::Blocking => "blocking",
        }
    }

    fn row(&self, idx: u64) -> Row {
        let base = idx as i64;
        vec![Value::Int(base), Value::Int(base * 2), Value::Int(base * 3)]
    }
}

impl fmt::Display for DebugTableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DebugTableType {
    type Err = ConnectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "error_during_execution" => DebugTableType::ErrorDuringExecution,
            "never_ending" => DebugTableType::NeverEnding,
            "blocking" => DebugTableType::Blocking,
            other => {
                return Err(ConnectorError::InvalidArgument(format!(
                    "Unknown debug table type: {other}"
                )));
            }
        })
    }
}

#[derive(Debug)]
pub struct DebugConnection {
    pub id: u64,
    pub identity: ConnectorIdentity,
    /// Reported as broken on the next validation.
    pub broken: bool,
}

#[derive(Debug, Default)]
struct ManagerCounters {
    next_id: AtomicU64,
    closed: AtomicU64,
    reject_connects: AtomicBool,
}

/// Opens numbered connections and counts how many were closed.
#[derive(Debug, Clone, Default)]
pub struct DebugManager {
    counters: Arc<ManagerCounters>,
}

impl DebugManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn opened(&self) -> u64 {
        self.counters.next_id.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> u64 {
        self.counters.closed.load(Ordering::SeqCst)
    }

    /// Make subsequent connects fail.
    pub fn reject_connects(&self, reject: bool) {
        self.counters.reject_connects.store(reject, Ordering::SeqCst);
    }
}

impl ManageConnection for DebugManager {
    type Connection = DebugConnection;

    fn connect(&self, identity: &ConnectorIdentity) -> Result<DebugConnection> {
        if self.counters.reject_connects.load(Ordering::SeqCst) {
            return Err(ConnectorError::source_operation(format!(
                "Debug backend refused connection for {identity}"
            )));
        }
        let id = self.counters.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(DebugConnection {
            id,
            identity: identity.clone(),
            broken: false,
        })
    }

    fn is_valid(&self, conn: &mut DebugConnection) -> Result<()> {
        if conn.broken {
            return Err(ConnectorError::source_operation(format!(
                "Debug connection {} is broken",
                conn.id
            )));
        }
        Ok(())
    }

    fn has_broken(&self, conn: &mut DebugConnection) -> bool {
        conn.broken
    }

    fn close(&self, conn: DebugConnection) {
        debug!(id = conn.id, "closing debug connection");
        self.counters.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Supports every pushdown the store can evaluate.
#[derive(Debug, Clone, Copy, Default)]
pub struct DebugCapabilities;

impl Capabilities for DebugCapabilities {
    fn probe(&self, name: &str) -> Option<CapabilityValue> {
        Some(match name {
            capability::SUPPORTS_ORDER_BY
            | capability::SUPPORTS_ROW_LIMIT
            | capability::SUPPORTS_COMPARE_EQUALS
            | capability::SUPPORTS_COMPARE_ORDERED
            | capability::SUPPORTS_OR_CRITERIA
            | capability::SUPPORTS_NOT_CRITERIA
            | capability::SUPPORTS_IS_NULL_CRITERIA
            | capability::SUPPORTS_BULK_UPDATE => CapabilityValue::Bool(true),
            capability::NULL_ORDER => CapabilityValue::Str("low".to_string()),
            capability::TRANSACTION_SUPPORT => CapabilityValue::Str("xa".to_string()),
            _ => return None,
        })
    }

    fn supported_functions(&self) -> Vec<String> {
        DEBUG_FUNCTIONS.iter().map(|f| f.to_string()).collect()
    }

    fn supports_function_signature(&self, name: &str, args: &[ValueType]) -> bool {
        match (name.to_ascii_lowercase().as_str(), args) {
            ("upper" | "lower" | "length", [ValueType::Text]) => true,
            ("abs", [ValueType::Int | ValueType::Float]) => true,
            ("coalesce", args) => !args.is_empty() && args.iter().all(|a| *a == args[0]),
            _ => false,
        }
    }
}

#[derive(Debug)]
pub struct DebugFactory {
    store: Arc<DebugStore>,
    xa: Arc<DebugXaResource>,
}

impl DebugFactory {
    pub fn new(store: Arc<DebugStore>) -> Self {
        DebugFactory {
            store,
            xa: Arc::new(DebugXaResource::new()),
        }
    }

    pub fn store(&self) -> &Arc<DebugStore> {
        &self.store
    }

    /// The transaction participant shared by every identity.
    pub fn xa(&self) -> &Arc<DebugXaResource> {
        &self.xa
    }
}

impl ExecutionFactory for DebugFactory {
    type Connection = DebugConnection;

    fn capabilities(&self) -> Arc<dyn Capabilities> {
        Arc::new(DebugCapabilities)
    }

    fn create_execution(
        &self,
        command: &Arc<Command>,
        _ctx: &ExecutionContext,
    ) -> Result<Box<dyn BackendExecution<DebugConnection>>> {
        Ok(Box::new(DebugExecution {
            command: command.clone(),
            store: self.store.clone(),
            table_type: None,
            rows: VecDeque::new(),
            produced: 0,
            update_counts: Vec::new(),
            outputs: Vec::new(),
        }))
    }

    fn xa_resource(&self, _identity: &ConnectorIdentity) -> Result<Arc<dyn XaResource>> {
        Ok(self.xa.clone())
    }
}

/// Rows emitted per page by never ending tables.
const NEVER_ENDING_BATCH: u64 = 30;

struct DebugExecution {
    command: Arc<Command>,
    store: Arc<DebugStore>,
    table_type: Option<DebugTableType>,
    rows: VecDeque<Row>,
    produced: u64,
    update_counts: Vec<u64>,
    outputs: Vec<(String, Value)>,
}

impl BackendExecution<DebugConnection> for DebugExecution {
    fn execute(&mut self, conn: &PooledConnection<DebugConnection>, _ctx: &ExecutionContext) -> Result<()> {
        let id = conn.with_handle(|c| c.id)?;
        debug!(connection = id, command = %self.command, "debug execute");

        match self.command.as_ref() {
            Command::Select(select) => match select.table.parse::<DebugTableType>() {
                Ok(typ) => self.table_type = Some(typ),
                Err(_) => {
                    let (_, rows) = self.store.select(select)?;
                    self.rows = rows.into();
                }
            },
            Command::Insert(insert) => self.update_counts = vec![self.store.insert(insert)?],
            Command::Update(update) => self.update_counts = vec![self.store.update(update)?],
            Command::Delete(delete) => self.update_counts = vec![self.store.delete(delete)?],
            Command::Call(call) => {
                let result = self.store.call(call)?;
                self.rows = result.rows.into();
                self.outputs = result.outputs;
            }
        }
        Ok(())
    }

    fn next_batch(
        &mut self,
        _conn: &PooledConnection<DebugConnection>,
        ctx: &ExecutionContext,
        batch_size: usize,
    ) -> Result<Option<Vec<Row>>> {
        match self.table_type {
            Some(DebugTableType::ErrorDuringExecution) => Err(ConnectorError::source_operation(
                "Debug table failed during execution",
            )),
            Some(typ @ DebugTableType::NeverEnding) => {
                let start = self.produced;
                self.produced += NEVER_ENDING_BATCH;
                Ok(Some((start..self.produced).map(|i| typ.row(i)).collect()))
            }
            Some(DebugTableType::Blocking) => loop {
                ctx.cancel_flag().check("blocking debug fetch")?;
                thread::sleep(Duration::from_millis(1));
            },
            None => {
                if self.rows.is_empty() {
                    return Ok(None);
                }
                let n = batch_size.min(self.rows.len());
                Ok(Some(self.rows.drain(..n).collect()))
            }
        }
    }

    fn output_parameters(&mut self, _conn: &PooledConnection<DebugConnection>) -> Result<Vec<(String, Value)>> {
        Ok(std::mem::take(&mut self.outputs))
    }

    fn update_counts(&self) -> Vec<u64> {
        self.update_counts.clone()
    }

    fn close(&mut self, _conn: &PooledConnection<DebugConnection>) {
        self.rows.clear();
    }
}

pub type DebugConnector = FactoryConnector<DebugFactory>;

/// Build a debug connector over an existing store.
pub fn debug_connector(config: &ConnectorConfig, store: Arc<DebugStore>) -> Result<DebugConnector> {
    FactoryConnector::new(config, DebugFactory::new(store), DebugManager::new())
}

/// Registry constructor for `debug`. The store is seeded from the `seed`
/// property when present.
pub fn create_debug_connector(config: &ConnectorConfig) -> Result<Arc<dyn Connector>> {
    let store = match config.property(SEED_PROPERTY) {
        Some(seed) => DebugStore::from_seed_json(seed).map_err(|e| {
            ConnectorError::configuration(format!("Connector '{}': invalid seed: {e}", config.name))
        })?,
        None => DebugStore::new(),
    };
    Ok(Arc::new(debug_connector(config, Arc::new(store))?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::TRANSACTION_SUPPORT;
    use crate::command::{Call, Expr, Insert, ParameterDirection, ProcedureParameter, Select};
    use crate::debug::store::DebugProcedure;
    use crate::execution::ExecutionState;

    fn connector() -> DebugConnector {
        let store = Arc::new(DebugStore::new());
        store
            .create_table(
                "t",
                vec!["a".to_string()],
                (0..5).map(|i| vec![Value::Int(i)]).collect(),
            )
            .unwrap();
        store.register_procedure(
            "proc",
            DebugProcedure {
                rows: Vec::new(),
                outputs: [("ret".to_string(), Value::Int(1)), ("o".to_string(), Value::from("x"))]
                    .into_iter()
                    .collect(),
            },
        );
        debug_connector(&ConnectorConfig::new("dbg", DEBUG_BACKEND), store).unwrap()
    }

    #[test]
    fn select_in_batches() {
        let conn = connector();
        let exec = conn
            .create_execution(
                Arc::new(Command::Select(Select::all("t"))),
                ExecutionContext::new("r").with_batch_size(2),
            )
            .unwrap();
        exec.execute().unwrap();
        let mut sizes = Vec::new();
        while let Some(batch) = exec.next_batch().unwrap() {
            sizes.push(batch.len());
        }
        assert_eq!(vec![2, 2, 1], sizes);
        assert_eq!(0, conn.pool_stats().leased);
    }

    #[test]
    fn insert_reports_counts() {
        let conn = connector();
        let exec = conn
            .create_execution(
                Arc::new(Command::Insert(Insert {
                    table: "t".to_string(),
                    columns: vec!["a".to_string()],
                    rows: vec![vec![Value::Int(9)], vec![Value::Int(10)]],
                })),
                ExecutionContext::new("r"),
            )
            .unwrap();
        exec.execute().unwrap();
        assert_eq!(vec![2], exec.update_counts().unwrap());
        exec.close();
        assert_eq!(7, conn.factory().store().table("t").unwrap().rows.len());
    }

    #[test]
    fn procedure_outputs_after_close() {
        let conn = connector();
        let exec = conn
            .create_execution(
                Arc::new(Command::Call(Call {
                    procedure: "proc".to_string(),
                    parameters: vec![
                        ProcedureParameter::output("o", ParameterDirection::Out, ValueType::Text),
                        ProcedureParameter::input("i", Value::Int(3)),
                        ProcedureParameter::output("ret", ParameterDirection::Return, ValueType::Int),
                    ],
                })),
                ExecutionContext::new("r"),
            )
            .unwrap();
        exec.execute().unwrap();
        assert!(exec.output_parameter_values().is_err());
        assert_eq!(None, exec.next().unwrap());
        exec.close();
        assert_eq!(
            vec![Value::Int(1), Value::from("x")],
            exec.output_parameter_values().unwrap()
        );
    }

    #[test]
    fn error_table_fails_on_fetch() {
        let conn = connector();
        let exec = conn
            .create_execution(
                Arc::new(Command::Select(Select::all("error_during_execution"))),
                ExecutionContext::new("r"),
            )
            .unwrap();
        exec.execute().unwrap();
        assert!(matches!(
            exec.next(),
            Err(ConnectorError::SourceOperation { .. })
        ));
        exec.close();
        assert_eq!(ExecutionState::Closed, exec.state());
        assert_eq!(0, conn.pool_stats().leased);
    }

    #[test]
    fn unsupported_function_rejected_before_lease() {
        let conn = connector();
        let mut select = Select::all("t");
        select.filter = Some(Expr::eq(
            Expr::Function {
                name: "soundex".to_string(),
                args: vec![Expr::column("a")],
            },
            Expr::lit("x"),
        ));
        let err = conn
            .create_execution(Arc::new(Command::Select(select)), ExecutionContext::new("r"))
            .unwrap_err();
        assert!(matches!(err, ConnectorError::Unsupported(_)));
        assert_eq!(0, conn.pool_stats().total);
    }

    #[test]
    fn advertises_xa_and_signatures() {
        let conn = connector();
        assert_eq!(
            Some("xa".to_string()),
            conn.capabilities().get_str(TRANSACTION_SUPPORT)
        );
        assert!(conn.capabilities().supports_function_signature("ABS", &[ValueType::Float]));
        assert!(!conn.capabilities().supports_function_signature("abs", &[ValueType::Text]));
        assert!(conn.xa_resource(&ExecutionContext::new("r")).is_ok());
    }
}
