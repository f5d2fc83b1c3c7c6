use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use federa_error::{ConnectorError, Result};

use crate::config::ConnectorConfig;
use crate::debug::{
    DEBUG_BACKEND, FEED_BACKEND, SHEET_BACKEND, create_debug_connector, create_feed_connector,
    create_sheet_connector,
};
use crate::factory::Connector;

/// Builds a connector from its configuration.
pub type ConnectorConstructor = Arc<dyn Fn(&ConnectorConfig) -> Result<Arc<dyn Connector>> + Send + Sync>;

/// Constructors keyed by backend type.
#[derive(Clone, Default)]
pub struct FactoryRegistry {
    constructors: BTreeMap<String, ConnectorConstructor>,
}

impl FactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the debug backend types.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.constructors.insert(DEBUG_BACKEND.to_string(), Arc::new(create_debug_connector));
        registry.constructors.insert(SHEET_BACKEND.to_string(), Arc::new(create_sheet_connector));
        registry.constructors.insert(FEED_BACKEND.to_string(), Arc::new(create_feed_connector));
        registry
    }

    pub fn register<F>(&mut self, backend_type: impl Into<String>, constructor: F) -> Result<()>
    where
        F: Fn(&ConnectorConfig) -> Result<Arc<dyn Connector>> + Send + Sync + 'static,
    {
        let backend_type = backend_type.into();
        if self.constructors.contains_key(&backend_type) {
            return Err(ConnectorError::configuration(format!(
                "Duplicate backend type '{backend_type}'"
            )));
        }
        self.constructors.insert(backend_type, Arc::new(constructor));
        Ok(())
    }

    pub fn with_backend<F>(mut self, backend_type: impl Into<String>, constructor: F) -> Result<Self>
    where
        F: Fn(&ConnectorConfig) -> Result<Arc<dyn Connector>> + Send + Sync + 'static,
    {
        self.register(backend_type, constructor)?;
        Ok(self)
    }

    pub fn contains(&self, backend_type: &str) -> bool {
        self.constructors.contains_key(backend_type)
    }

    pub fn backend_types(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(|k| k.as_str())
    }

    pub fn create(&self, config: &ConnectorConfig) -> Result<Arc<dyn Connector>> {
        let constructor = self.constructors.get(&config.backend_type).ok_or_else(|| {
            ConnectorError::configuration(format!(
                "Connector '{}' has unknown backend type '{}'",
                config.name, config.backend_type
            ))
        })?;
        constructor(config)
    }
}

impl fmt::Debug for FactoryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FactoryRegistry")
            .field("backend_types", &self.constructors.keys().collect::<Vec<_>>())
            .finish()
    }
}
