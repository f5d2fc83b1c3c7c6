//! The `debug-feed` backend, a record feed paged with opaque continuation
//! tokens.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::TimeDelta;
use federa_error::{ConnectorError, Result};
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::session::{SessionIssuer, SessionToken};
use super::sheet::DEFAULT_TOKEN_VALIDITY;
use super::store::{json_rows, project};
use crate::capability::Capabilities;
use crate::command::Command;
use crate::config::ConnectorConfig;
use crate::context::ExecutionContext;
use crate::execution::BackendExecution;
use crate::factory::{Connector, ExecutionFactory, FactoryConnector};
use crate::identity::ConnectorIdentity;
use crate::paging::{CursorPaginator, CursorSource, PagedExecution, Reauthenticate};
use crate::pool::ManageConnection;
use crate::value::Row;

pub const FEED_BACKEND: &str = "debug-feed";

/// Continuation tokens kept before the oldest is dropped.
pub const DEFAULT_MAX_CURSORS: usize = 1024;

/// Outstanding continuation tokens in issue order.
#[derive(Debug, Default)]
struct Cursors {
    /// Token to issue sequence and the record it resumes at.
    positions: HashMap<String, (u64, usize)>,
    by_seq: BTreeMap<u64, String>,
    next_seq: u64,
}

impl Cursors {
    fn insert(&mut self, token: String, position: usize, max: usize) {
        while self.positions.len() >= max {
            let Some((_, oldest)) = self.by_seq.pop_first() else {
                break;
            };
            self.positions.remove(&oldest);
            debug!(token = %oldest, "dropping oldest continuation token");
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.by_seq.insert(seq, token.clone());
        self.positions.insert(token, (seq, position));
    }

    fn redeem(&mut self, token: &str) -> Option<usize> {
        let (seq, position) = self.positions.remove(token)?;
        self.by_seq.remove(&seq);
        Some(position)
    }
}

#[derive(Debug)]
pub struct FeedService {
    columns: Vec<String>,
    records: Vec<Row>,
    sessions: SessionIssuer,
    cursors: Mutex<Cursors>,
    max_cursors: usize,
    /// End of data is signalled with a blank token instead of none.
    blank_final_token: bool,
}

impl FeedService {
    pub fn new(columns: Vec<String>, records: Vec<Row>, token_validity: TimeDelta) -> Self {
        FeedService {
            columns,
            records,
            sessions: SessionIssuer::new(token_validity),
            cursors: Mutex::new(Cursors::default()),
            max_cursors: DEFAULT_MAX_CURSORS,
            blank_final_token: false,
        }
    }

    pub fn with_blank_final_token(mut self, blank: bool) -> Self {
        self.blank_final_token = blank;
        self
    }

    /// Cap on unredeemed continuation tokens. Issuing past it drops the
    /// oldest.
    pub fn with_max_cursors(mut self, max: usize) -> Self {
        self.max_cursors = max.max(1);
        self
    }

    pub fn authenticate(&self) -> SessionToken {
        self.sessions.issue()
    }

    pub fn expire_sessions(&self) {
        self.sessions.expire_all();
    }

    pub fn authentications(&self) -> u64 {
        self.sessions.issued()
    }

    /// Continuation tokens not yet redeemed.
    pub fn outstanding_cursors(&self) -> usize {
        self.cursors.lock().positions.len()
    }

    /// Fetch up to `amount` records of `projection` after `cursor`.
    /// Tokens are single use.
    pub fn fetch(
        &self,
        session: &SessionToken,
        projection: &[String],
        cursor: Option<&str>,
        amount: usize,
    ) -> Result<(Vec<Row>, Option<String>)> {
        self.sessions.check(session)?;

        let start = match cursor {
            None => 0,
            Some(token) => self.cursors.lock().redeem(token).ok_or_else(|| {
                ConnectorError::InvalidArgument(format!("Unknown continuation token: {token}"))
            })?,
        };
        let end = start.saturating_add(amount).min(self.records.len());
        let rows = self.records[start.min(end)..end].to_vec();
        let (_, rows) = project(&self.columns, rows, projection)?;

        let next = if end < self.records.len() {
            let token = Uuid::new_v4().simple().to_string();
            self.cursors.lock().insert(token.clone(), end, self.max_cursors);
            Some(token)
        } else if self.blank_final_token {
            Some(String::new())
        } else {
            None
        };
        Ok((rows, next))
    }
}

#[derive(Debug)]
pub struct FeedConnection {
    service: Arc<FeedService>,
    session: SessionToken,
}

#[derive(Debug, Clone)]
pub struct FeedManager {
    service: Arc<FeedService>,
}

impl ManageConnection for FeedManager {
    type Connection = FeedConnection;

    fn connect(&self, _identity: &ConnectorIdentity) -> Result<FeedConnection> {
        Ok(FeedConnection {
            service: self.service.clone(),
            session: self.service.authenticate(),
        })
    }

    fn is_valid(&self, conn: &mut FeedConnection) -> Result<()> {
        self.service.sessions.check(&conn.session)
    }
}

/// Cursor source reading one projection of the feed.
#[derive(Debug, Clone, Default)]
pub struct FeedSource {
    projection: Vec<String>,
}

impl Reauthenticate<FeedConnection> for FeedSource {
    fn reauthenticate(&mut self, conn: &mut FeedConnection) -> Result<()> {
        conn.session = conn.service.authenticate();
        Ok(())
    }
}

impl CursorSource<FeedConnection> for FeedSource {
    fn fetch(&mut self, conn: &mut FeedConnection, token: Option<&str>, amount: usize) -> Result<(Vec<Row>, Option<String>)> {
        conn.service
            .fetch(&conn.session, &self.projection, token, amount)
    }
}

/// Feeds support no pushdown beyond projection.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeedCapabilities;

impl Capabilities for FeedCapabilities {}

#[derive(Debug)]
pub struct FeedFactory {
    service: Arc<FeedService>,
}

impl FeedFactory {
    pub fn new(service: Arc<FeedService>) -> Self {
        FeedFactory { service }
    }

    pub fn service(&self) -> &Arc<FeedService> {
        &self.service
    }
}

impl ExecutionFactory for FeedFactory {
    type Connection = FeedConnection;

    fn capabilities(&self) -> Arc<dyn Capabilities> {
        Arc::new(FeedCapabilities)
    }

    fn create_execution(
        &self,
        command: &Arc<Command>,
        _ctx: &ExecutionContext,
    ) -> Result<Box<dyn BackendExecution<FeedConnection>>> {
        match command.as_ref() {
            Command::Select(select) => {
                let source = FeedSource {
                    projection: select.projection.clone(),
                };
                Ok(Box::new(PagedExecution::new(CursorPaginator::new(source))))
            }
            other => Err(ConnectorError::Unsupported(format!(
                "Feeds only support queries, got {:?}",
                other.kind()
            ))),
        }
    }
}

pub type FeedConnector = FactoryConnector<FeedFactory>;

pub fn feed_connector(config: &ConnectorConfig, service: Arc<FeedService>) -> Result<FeedConnector> {
    let manager = FeedManager {
        service: service.clone(),
    };
    FactoryConnector::new(config, FeedFactory::new(service), manager)
}

/// Registry constructor for `debug-feed`. Records come from the `columns`
/// and `rows` properties.
pub fn create_feed_connector(config: &ConnectorConfig) -> Result<Arc<dyn Connector>> {
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
    let blank_final = config.parse_property::<bool>("blank-final-token")?.unwrap_or(false);
    let service = FeedService::new(columns, rows, DEFAULT_TOKEN_VALIDITY).with_blank_final_token(blank_final);
    Ok(Arc::new(feed_connector(config, Arc::new(service))?))
}
