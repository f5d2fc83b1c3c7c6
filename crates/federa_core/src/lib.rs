//! Connector execution and federation.
//!
//! A [`factory::Connector`] pairs a backend's resolved capabilities with an
//! identity-keyed connection pool and creates [`execution::Execution`]s for
//! pushed-down commands. Result paging, distributed transaction branches
//! and the service owning every connector live alongside.

pub mod capability;
pub mod command;
pub mod config;
pub mod context;
pub mod debug;
pub mod execution;
pub mod factory;
pub mod identity;
pub mod paging;
pub mod pool;
pub mod registry;
pub mod service;
pub mod transaction;
pub mod value;

pub use capability::{CapabilityDescriptor, CapabilityOverrides, CapabilityValue, Capabilities};
pub use command::Command;
pub use config::{ConnectorConfig, FederaConfig};
pub use context::{CancelFlag, ExecutionContext};
pub use execution::{Execution, ExecutionState};
pub use factory::{Connector, ExecutionFactory, FactoryConnector};
pub use identity::{ConnectorIdentity, IdentityMode};
pub use pool::{ConnectionPool, PooledConnection};
pub use registry::FactoryRegistry;
pub use service::ConnectorManager;
pub use value::{Row, Value};
