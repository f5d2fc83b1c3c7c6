//! Execution factories and the connectors built from them.

use std::fmt;
use std::sync::Arc;

use federa_error::{ConnectorError, Result};
use tracing::debug;

use crate::capability::{CapabilityDescriptor, Capabilities, TRANSACTION_SUPPORT};
use crate::command::Command;
use crate::config::ConnectorConfig;
use crate::context::ExecutionContext;
use crate::execution::{BackendExecution, ConnectorExecution, Execution};
use crate::identity::{ConnectorIdentity, IdentityMode};
use crate::pool::{ConnectionInfo, ConnectionPool, ManageConnection, PoolStats};
use crate::transaction::XaResource;

/// Per backend type factory for executions.
pub trait ExecutionFactory: Send + Sync + 'static {
    type Connection: Send + 'static;

    /// Capabilities implemented by this backend type.
    fn capabilities(&self) -> Arc<dyn Capabilities>;

    /// Create the backend side of an execution. Called before a connection
    /// is leased.
    fn create_execution(
        &self,
        command: &Arc<Command>,
        ctx: &ExecutionContext,
    ) -> Result<Box<dyn BackendExecution<Self::Connection>>>;

    /// Transaction participant for connections of `identity`.
    fn xa_resource(&self, identity: &ConnectorIdentity) -> Result<Arc<dyn XaResource>> {
        let _ = identity;
        Err(ConnectorError::Unsupported(
            "Backend does not participate in distributed transactions".to_string(),
        ))
    }
}

/// A configured backend as seen by the planner.
pub trait Connector: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn backend_type(&self) -> &str;

    fn capabilities(&self) -> &CapabilityDescriptor;

    fn identity_mode(&self) -> IdentityMode;

    /// Pool bucket for the caller described by `ctx`.
    fn identity_for(&self, ctx: &ExecutionContext) -> Result<ConnectorIdentity> {
        self.identity_mode().identity_for(ctx.principal())
    }

    /// Lease a connection and bind a new execution of `command` to it.
    fn create_execution(&self, command: Arc<Command>, ctx: ExecutionContext) -> Result<Arc<dyn Execution>>;

    fn xa_resource(&self, ctx: &ExecutionContext) -> Result<Arc<dyn XaResource>>;

    fn pool_stats(&self) -> PoolStats;

    fn connections(&self) -> Vec<ConnectionInfo>;

    fn shutdown(&self);
}

/// Pairs an [`ExecutionFactory`] with its resolved capabilities and pool.
pub struct FactoryConnector<F: ExecutionFactory> {
    name: String,
    backend_type: String,
    identity_mode: IdentityMode,
    capabilities: CapabilityDescriptor,
    pool: ConnectionPool<F::Connection>,
    factory: F,
}

impl<F: ExecutionFactory> FactoryConnector<F> {
    pub fn new<M>(config: &ConnectorConfig, factory: F, manager: M) -> Result<Self>
    where
        M: ManageConnection<Connection = F::Connection>,
    {
        config.validate()?;
        let capabilities = CapabilityDescriptor::resolve(
            config.backend_type.clone(),
            factory.capabilities(),
            &config.capability_overrides(),
        )
        .map_err(|e| match e {
            ConnectorError::Configuration(msg) => {
                ConnectorError::Configuration(format!("Connector '{}': {msg}", config.name))
            }
            other => other,
        })?;
        let pool = ConnectionPool::new(config.name.clone(), config.pool.clone(), manager)?;

        Ok(FactoryConnector {
            name: config.name.clone(),
            backend_type: config.backend_type.clone(),
            identity_mode: config.identity,
            capabilities,
            pool,
            factory,
        })
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    pub fn pool(&self) -> &ConnectionPool<F::Connection> {
        &self.pool
    }
}

impl<F: ExecutionFactory> fmt::Debug for FactoryConnector<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FactoryConnector")
            .field("name", &self.name)
            .field("backend_type", &self.backend_type)
            .field("identity_mode", &self.identity_mode)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl<F: ExecutionFactory> Connector for FactoryConnector<F> {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend_type(&self) -> &str {
        &self.backend_type
    }

    fn capabilities(&self) -> &CapabilityDescriptor {
        &self.capabilities
    }

    fn identity_mode(&self) -> IdentityMode {
        self.identity_mode
    }

    fn create_execution(&self, command: Arc<Command>, ctx: ExecutionContext) -> Result<Arc<dyn Execution>> {
        self.capabilities.check_command(&command)?;
        let identity = self.identity_for(&ctx)?;
        let backend = self.factory.create_execution(&command, &ctx)?;
        let conn = self.pool.lease(&identity)?;
        debug!(connector = %self.name, execution_id = %ctx.execution_id(), %identity, "created execution");
        Ok(Arc::new(ConnectorExecution::new(command, ctx, conn, backend)))
    }

    fn xa_resource(&self, ctx: &ExecutionContext) -> Result<Arc<dyn XaResource>> {
        let support = self.capabilities.get_str(TRANSACTION_SUPPORT).unwrap_or_default();
        if support != "xa" {
            return Err(ConnectorError::Unsupported(format!(
                "Connector '{}' has transaction support '{support}', not 'xa'",
                self.name
            )));
        }
        let identity = self.identity_for(ctx)?;
        self.factory.xa_resource(&identity)
    }

    fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    fn connections(&self) -> Vec<ConnectionInfo> {
        self.pool.connections()
    }

    fn shutdown(&self) {
        self.pool.shutdown();
    }
}
