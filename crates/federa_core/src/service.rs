//! The connector service: every configured connector plus the transaction
//! coordinator, built once at startup.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use federa_error::{ConnectorError, Result};
use tracing::{debug, info};

use crate::command::Command;
use crate::config::FederaConfig;
use crate::context::ExecutionContext;
use crate::execution::Execution;
use crate::factory::Connector;
use crate::registry::FactoryRegistry;
use crate::transaction::{TransactionCoordinator, Xid};

#[derive(Debug)]
pub struct ConnectorManager {
    connectors: BTreeMap<String, Arc<dyn Connector>>,
    coordinator: TransactionCoordinator,
    shut_down: AtomicBool,
}

impl ConnectorManager {
    /// Create every configured connector. Connectors created before a
    /// failure are shut down.
    pub fn new(registry: &FactoryRegistry, config: &FederaConfig) -> Result<Self> {
        config.validate()?;

        let mut connectors: BTreeMap<String, Arc<dyn Connector>> = BTreeMap::new();
        for conn_config in &config.connectors {
            match registry.create(conn_config) {
                Ok(connector) => {
                    debug!(name = %conn_config.name, backend_type = %conn_config.backend_type, "created connector");
                    connectors.insert(conn_config.name.clone(), connector);
                }
                Err(e) => {
                    for connector in connectors.values() {
                        connector.shutdown();
                    }
                    return Err(e);
                }
            }
        }
        info!(connectors = connectors.len(), "connector manager started");

        Ok(ConnectorManager {
            connectors,
            coordinator: TransactionCoordinator::new(config.transactions.clone()),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn connector(&self, name: &str) -> Result<&Arc<dyn Connector>> {
        self.connectors
            .get(name)
            .ok_or_else(|| ConnectorError::InvalidArgument(format!("Unknown connector '{name}'")))
    }

    pub fn connector_names(&self) -> impl Iterator<Item = &str> {
        self.connectors.keys().map(|k| k.as_str())
    }

    pub fn coordinator(&self) -> &TransactionCoordinator {
        &self.coordinator
    }

    pub fn create_execution(
        &self,
        connector: &str,
        command: Arc<Command>,
        ctx: ExecutionContext,
    ) -> Result<Arc<dyn Execution>> {
        self.check_running()?;
        self.connector(connector)?.create_execution(command, ctx)
    }

    /// Open a branch of `xid` on a connector's transaction participant.
    pub fn begin_branch(&self, xid: &Xid, connector: &str, ctx: &ExecutionContext) -> Result<Xid> {
        self.check_running()?;
        let resource = self.connector(connector)?.xa_resource(ctx)?;
        self.coordinator.begin_branch(xid, connector, resource)
    }

    /// Open a branch and create an execution enlisted in it, so terminating
    /// the transaction cancels the execution.
    pub fn create_branch_execution(
        &self,
        xid: &Xid,
        connector: &str,
        command: Arc<Command>,
        ctx: ExecutionContext,
    ) -> Result<(Xid, Arc<dyn Execution>)> {
        let branch = self.begin_branch(xid, connector, &ctx)?;
        let execution = match self.create_execution(connector, command, ctx) {
            Ok(execution) => execution,
            Err(e) => {
                self.coordinator.mark_rollback_only(xid)?;
                return Err(e);
            }
        };
        self.coordinator
            .enlist(&branch, execution.cancel_handle())?;
        Ok((branch, execution))
    }

    /// Roll back outstanding transactions and shut down every pool.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.coordinator.rollback_all();
        for connector in self.connectors.values() {
            connector.shutdown();
        }
        info!("connector manager shut down");
    }

    fn check_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(ConnectorError::invalid_state("Connector manager is shut down"));
        }
        Ok(())
    }
}
