//! The `debug-sheet` backend, a spreadsheet-like query service paged with
//! LIMIT/OFFSET.
//!
//! Queries look like `SELECT A, B [FROM sheet] [LIMIT n [OFFSET m]]
//! [LABEL ..] [FORMAT ..] [OPTIONS ..]`. Offsets past the last row fail with
//! a generic server error status.

use std::sync::{Arc, LazyLock};

use chrono::TimeDelta;
use federa_error::{ConnectorError, Result, ResultExt};
use parking_lot::Mutex;
use regex::Regex;
use tracing::trace;

use super::session::{SessionIssuer, SessionToken};
use super::store::{json_rows, project};
use crate::capability::{self, Capabilities, CapabilityValue, NATIVE_QUERY_PROCEDURE};
use crate::command::Command;
use crate::config::{ConnectorConfig, PagingConfig};
use crate::context::ExecutionContext;
use crate::execution::BackendExecution;
use crate::factory::{Connector, ExecutionFactory, FactoryConnector};
use crate::identity::ConnectorIdentity;
use crate::paging::{OffsetPaginator, OffsetSource, PagedExecution, Reauthenticate};
use crate::pool::ManageConnection;
use crate::value::Row;

pub const SHEET_BACKEND: &str = "debug-sheet";

/// Status returned for offsets past the end of the sheet.
pub const SHEET_OUT_OF_RANGE_STATUS: u16 = 500;

const BAD_REQUEST_STATUS: u16 = 400;

pub const DEFAULT_TOKEN_VALIDITY: TimeDelta = TimeDelta::minutes(30);

static QUERY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?is)^\s*SELECT\s+(?P<cols>.+?)(?:\s+FROM\s+\w+)?(?:\s+LIMIT\s+(?P<limit>\d+)(?:\s+OFFSET\s+(?P<offset>\d+))?)?(?:\s+(?:LABEL|FORMAT|OPTIONS)\b.*)?\s*$",
    )
    .unwrap()
});

static LIMIT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bLIMIT\b").unwrap());

#[derive(Debug)]
pub struct SheetService {
    columns: Vec<String>,
    rows: Vec<Row>,
    sessions: SessionIssuer,
    queries: Mutex<Vec<String>>,
}

impl SheetService {
    pub fn new(columns: Vec<String>, rows: Vec<Row>, token_validity: TimeDelta) -> Self {
        SheetService {
            columns,
            rows,
            sessions: SessionIssuer::new(token_validity),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn authenticate(&self) -> SessionToken {
        self.sessions.issue()
    }

    /// Revoke every outstanding session.
    pub fn expire_sessions(&self) {
        self.sessions.expire_all();
    }

    pub fn authentications(&self) -> u64 {
        self.sessions.issued()
    }

    /// Every query received, including rejected ones.
    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().clone()
    }

    pub fn query(&self, token: &SessionToken, query: &str) -> Result<Vec<Row>> {
        self.queries.lock().push(query.to_string());
        self.sessions.check(token)?;

        let bad_request = |message: String| ConnectorError::SourceStatus {
            status: BAD_REQUEST_STATUS,
            message,
        };
        let caps = QUERY_RE
            .captures(query)
            .ok_or_else(|| bad_request(format!("Cannot parse query: {query}")))?;
        let parse = |name: &str| -> Result<Option<usize>> {
            caps.name(name)
                .map(|m| m.as_str().parse::<usize>())
                .transpose()
                .context("Invalid LIMIT/OFFSET")
        };
        let limit = parse("limit")?;
        let offset = parse("offset")?.unwrap_or(0);
        if limit.is_none() && LIMIT_RE.is_match(query) {
            return Err(bad_request(format!("Misplaced LIMIT clause: {query}")));
        }

        let cols = caps.name("cols").map(|m| m.as_str().trim()).unwrap_or("*");
        let projection: Vec<String> = if cols == "*" {
            Vec::new()
        } else {
            cols.split(',').map(|c| c.trim().to_string()).collect()
        };

        if offset > 0 && offset >= self.rows.len() {
            return Err(ConnectorError::SourceStatus {
                status: SHEET_OUT_OF_RANGE_STATUS,
                message: format!("Offset {offset} is out of range"),
            });
        }
        let end = match limit {
            Some(limit) => offset.saturating_add(limit).min(self.rows.len()),
            None => self.rows.len(),
        };
        let rows = self.rows.get(offset..end).unwrap_or_default().to_vec();
        trace!(offset, ?limit, rows = rows.len(), "sheet query");

        let (_, rows) = project(&self.columns, rows, &projection)
            .map_err(|e| bad_request(e.to_string()))?;
        Ok(rows)
    }
}

#[derive(Debug)]
pub struct SheetConnection {
    service: Arc<SheetService>,
    token: SessionToken,
}

impl SheetConnection {
    pub fn token(&self) -> &SessionToken {
        &self.token
    }
}

#[derive(Debug, Clone)]
pub struct SheetManager {
    service: Arc<SheetService>,
}

impl ManageConnection for SheetManager {
    type Connection = SheetConnection;

    fn connect(&self, _identity: &ConnectorIdentity) -> Result<SheetConnection> {
        Ok(SheetConnection {
            service: self.service.clone(),
            token: self.service.authenticate(),
        })
    }

    fn is_valid(&self, conn: &mut SheetConnection) -> Result<()> {
        self.service.sessions.check(&conn.token)
    }
}

/// Offset source issuing queries on a sheet connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct SheetSource;

impl Reauthenticate<SheetConnection> for SheetSource {
    fn reauthenticate(&mut self, conn: &mut SheetConnection) -> Result<()> {
        conn.token = conn.service.authenticate();
        Ok(())
    }
}

impl OffsetSource<SheetConnection> for SheetSource {
    fn run_query(&mut self, conn: &mut SheetConnection, query: &str) -> Result<Vec<Row>> {
        conn.service.query(&conn.token, query)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SheetCapabilities;

impl Capabilities for SheetCapabilities {
    fn probe(&self, name: &str) -> Option<CapabilityValue> {
        match name {
            capability::SUPPORTS_ROW_LIMIT | capability::SUPPORTS_ROW_OFFSET => {
                Some(CapabilityValue::Bool(true))
            }
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct SheetFactory {
    service: Arc<SheetService>,
    paging: PagingConfig,
    native_procedure: String,
}

impl SheetFactory {
    pub fn new(service: Arc<SheetService>, mut paging: PagingConfig, native_procedure: impl Into<String>) -> Self {
        paging.out_of_range_status = paging.out_of_range_status.or(Some(SHEET_OUT_OF_RANGE_STATUS));
        SheetFactory {
            service,
            paging,
            native_procedure: native_procedure.into(),
        }
    }

    pub fn service(&self) -> &Arc<SheetService> {
        &self.service
    }
}

impl ExecutionFactory for SheetFactory {
    type Connection = SheetConnection;

    fn capabilities(&self) -> Arc<dyn Capabilities> {
        Arc::new(SheetCapabilities)
    }

    fn create_execution(
        &self,
        command: &Arc<Command>,
        _ctx: &ExecutionContext,
    ) -> Result<Box<dyn BackendExecution<SheetConnection>>> {
        let paginator = match command.as_ref() {
            Command::Select(_) => OffsetPaginator::for_command(SheetSource, command, self.paging.clone()),
            Command::Call(call) if call.procedure.eq_ignore_ascii_case(&self.native_procedure) => {
                let query = call
                    .input_values()
                    .first()
                    .and_then(|(_, v)| v.as_str())
                    .ok_or_else(|| {
                        ConnectorError::InvalidArgument(format!(
                            "Procedure '{}' expects the query text as its first argument",
                            call.procedure
                        ))
                    })?
                    .to_string();
                OffsetPaginator::new(SheetSource, query, None, self.paging.clone())
            }
            other => {
                return Err(ConnectorError::Unsupported(format!(
                    "Sheets only support queries, got {:?}",
                    other.kind()
                )));
            }
        };
        Ok(Box::new(PagedExecution::new(paginator)))
    }
}

pub type SheetConnector = FactoryConnector<SheetFactory>;

pub fn sheet_connector(config: &ConnectorConfig, service: Arc<SheetService>) -> Result<SheetConnector> {
    let overrides = config.capability_overrides();
    let native = overrides
        .get(NATIVE_QUERY_PROCEDURE)
        .unwrap_or("native")
        .to_string();
    let manager = SheetManager {
        service: service.clone(),
    };
    FactoryConnector::new(config, SheetFactory::new(service, config.paging.clone(), native), manager)
}

/// Service built from the `columns`, `rows` and `token-validity-ms`
/// properties.
pub fn sheet_service_from_config(config: &ConnectorConfig) -> Result<SheetService> {
    let columns: Vec<String> = config
        .property("columns")
        .map(|c| c.split(',').map(|s| s.trim().to_string()).collect())
        .unwrap_or_default();
    let rows = match config.property("rows") {
        Some(raw) => {
            let json: Vec<Vec<serde_json::Value>> = serde_json::from_str(raw).map_err(|e| {
                ConnectorError::configuration(format!("Connector '{}': invalid rows: {e}", config.name))
            })?;
            json_rows(&json)?
        }
        None => Vec::new(),
    };
    if let Some(row) = rows.iter().find(|r| r.len() != columns.len()) {
        return Err(ConnectorError::configuration(format!(
            "Connector '{}': row has {} values for {} columns",
            config.name,
            row.len(),
            columns.len()
        )));
    }
    let validity = config
        .parse_property::<i64>("token-validity-ms")?
        .map(TimeDelta::milliseconds)
        .unwrap_or(DEFAULT_TOKEN_VALIDITY);
    Ok(SheetService::new(columns, rows, validity))
}

/// Registry constructor for `debug-sheet`.
pub fn create_sheet_connector(config: &ConnectorConfig) -> Result<Arc<dyn Connector>> {
    let service = Arc::new(sheet_service_from_config(config)?);
    Ok(Arc::new(sheet_connector(config, service)?))
}
