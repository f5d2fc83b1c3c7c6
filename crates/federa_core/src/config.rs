//! Configuration consumed by connectors, pools and the coordinator.
//!
//! Loaded from JSON. Keys are kebab-case and durations are milliseconds.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use federa_error::{ConnectorError, Result, ResultExt};
use serde::{Deserialize, Serialize};

use crate::capability::CapabilityOverrides;
use crate::identity::IdentityMode;

pub const DEFAULT_MAX_POOL_SIZE: usize = 20;
pub const DEFAULT_WAIT_TIME_FOR_RESOURCE: Duration = Duration::from_secs(30);
pub const DEFAULT_RESOURCE_TEST_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_TRAILING_CLAUSES: &[&str] = &["LABEL", "FORMAT", "OPTIONS"];
pub const DEFAULT_COMMIT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_COMMIT_RETRY_DELAY: Duration = Duration::from_millis(50);

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct PoolConfig {
    pub max_pool_size: usize,
    /// Cap on connections held by a single identity bucket.
    pub max_per_identity: Option<usize>,
    #[serde(with = "duration_ms")]
    pub wait_time_for_resource: Duration,
    #[serde(with = "duration_ms")]
    pub resource_test_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            max_per_identity: None,
            wait_time_for_resource: DEFAULT_WAIT_TIME_FOR_RESOURCE,
            resource_test_interval: DEFAULT_RESOURCE_TEST_INTERVAL,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_pool_size == 0 {
            return Err(ConnectorError::configuration(
                "max-pool-size must be greater than zero",
            ));
        }
        if let Some(per_identity) = self.max_per_identity {
            if per_identity == 0 || per_identity > self.max_pool_size {
                return Err(ConnectorError::Configuration(format!(
                    "max-per-identity must be between 1 and max-pool-size ({}), got {per_identity}",
                    self.max_pool_size
                )));
            }
        }
        Ok(())
    }
}

/// Paging behavior for a backend class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct PagingConfig {
    /// Clauses that must stay after an injected LIMIT/OFFSET.
    pub trailing_clauses: Vec<String>,
    /// Status the backend reports for an offset past the end of the data.
    pub out_of_range_status: Option<u16>,
}

impl Default for PagingConfig {
    fn default() -> Self {
        PagingConfig {
            trailing_clauses: DEFAULT_TRAILING_CLAUSES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            out_of_range_status: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct TransactionConfig {
    pub commit_retry_attempts: u32,
    #[serde(with = "duration_ms")]
    pub commit_retry_delay: Duration,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        TransactionConfig {
            commit_retry_attempts: DEFAULT_COMMIT_RETRY_ATTEMPTS,
            commit_retry_delay: DEFAULT_COMMIT_RETRY_DELAY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ConnectorConfig {
    pub name: String,
    pub backend_type: String,
    #[serde(default)]
    pub identity: IdentityMode,
    #[serde(default)]
    pub pool: PoolConfig,
    /// Capability override properties.
    #[serde(default)]
    pub capabilities: BTreeMap<String, String>,
    #[serde(default)]
    pub paging: PagingConfig,
    /// Backend specific properties.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl ConnectorConfig {
    pub fn new(name: impl Into<String>, backend_type: impl Into<String>) -> Self {
        ConnectorConfig {
            name: name.into(),
            backend_type: backend_type.into(),
            identity: IdentityMode::default(),
            pool: PoolConfig::default(),
            capabilities: BTreeMap::new(),
            paging: PagingConfig::default(),
            properties: BTreeMap::new(),
        }
    }

    pub fn capability_overrides(&self) -> CapabilityOverrides {
        CapabilityOverrides::new(self.capabilities.clone())
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(|s| s.as_str())
    }

    /// Parse an optional property, returning a configuration error if present
    /// but malformed.
    pub fn parse_property<T: FromStr>(&self, name: &str) -> Result<Option<T>> {
        match self.property(name) {
            Some(raw) => raw.trim().parse().map(Some).map_err(|_| {
                ConnectorError::Configuration(format!(
                    "Connector '{}' has an invalid value for property '{name}': '{raw}'",
                    self.name
                ))
            }),
            None => Ok(None),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ConnectorError::configuration("Connector name must not be empty"));
        }
        if self.backend_type.trim().is_empty() {
            return Err(ConnectorError::Configuration(format!(
                "Connector '{}' is missing a backend-type",
                self.name
            )));
        }
        self.pool.validate().map_err(|e| match e {
            ConnectorError::Configuration(msg) => {
                ConnectorError::Configuration(format!("Connector '{}': {msg}", self.name))
            }
            other => other,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct FederaConfig {
    pub connectors: Vec<ConnectorConfig>,
    pub transactions: TransactionConfig,
}

impl FederaConfig {
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: FederaConfig = serde_json::from_str(s)
            .map_err(|e| ConnectorError::Configuration(format!("Invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .context_fn(|| format!("Failed to read configuration file {}", path.display()))?;
        Self::from_json_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for connector in &self.connectors {
            connector.validate()?;
            if !names.insert(connector.name.as_str()) {
                return Err(ConnectorError::Configuration(format!(
                    "Duplicate connector name '{}'",
                    connector.name
                )));
            }
        }
        Ok(())
    }

    pub fn connector(&self, name: &str) -> Option<&ConnectorConfig> {
        self.connectors.iter().find(|c| c.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_document() {
        let config = FederaConfig::from_json_str(
            r#"{
                "connectors": [
                    {
                        "name": "orders",
                        "backend-type": "debug",
                        "identity": "per-principal",
                        "pool": {
                            "max-pool-size": 2,
                            "wait-time-for-resource": 1,
                            "resource-test-interval": 500
                        },
                        "capabilities": { "supports_order_by": "true" },
                        "paging": { "out-of-range-status": 500 },
                        "properties": { "block-ms": "10" }
                    }
                ],
                "transactions": { "commit-retry-attempts": 5 }
            }"#,
        )
        .unwrap();

        let orders = config.connector("orders").unwrap();
        assert_eq!(IdentityMode::PerPrincipal, orders.identity);
        assert_eq!(2, orders.pool.max_pool_size);
        assert_eq!(Duration::from_millis(1), orders.pool.wait_time_for_resource);
        assert_eq!(Duration::from_millis(500), orders.pool.resource_test_interval);
        assert_eq!(Some(500), orders.paging.out_of_range_status);
        assert_eq!(vec!["LABEL", "FORMAT", "OPTIONS"], orders.paging.trailing_clauses);
        assert_eq!(Some(10), orders.parse_property::<u64>("block-ms").unwrap());
        assert_eq!(5, config.transactions.commit_retry_attempts);
        assert_eq!(DEFAULT_COMMIT_RETRY_DELAY, config.transactions.commit_retry_delay);
    }

    #[test]
    fn defaults_for_minimal_connector() {
        let config = FederaConfig::from_json_str(
            r#"{ "connectors": [ { "name": "a", "backend-type": "debug" } ] }"#,
        )
        .unwrap();
        let a = &config.connectors[0];
        assert_eq!(PoolConfig::default(), a.pool);
        assert_eq!(IdentityMode::Singleton, a.identity);
    }

    #[test]
    fn invalid_documents() {
        let cases = [
            r#"{ "connectors": [ { "name": "a" } ] }"#,
            r#"{ "connectors": [ { "name": "a", "backend-type": "debug", "pool": { "max-pool-size": 0 } } ] }"#,
            r#"{ "connectors": [ { "name": "a", "backend-type": "debug", "pool": { "max-pool-size": 2, "max-per-identity": 3 } } ] }"#,
            r#"{ "connectors": [ { "name": "a", "backend-type": "debug" }, { "name": "a", "backend-type": "debug" } ] }"#,
            r#"{ "connectors": [ { "name": "a", "backend-type": "debug", "identity": "everyone" } ] }"#,
            r#"{ "connectors": [ { "name": " ", "backend-type": "debug" } ] }"#,
        ];
        for case in cases {
            let err = FederaConfig::from_json_str(case).unwrap_err();
            assert!(matches!(err, ConnectorError::Configuration(_)), "{case}: {err}");
        }
    }

    #[test]
    fn malformed_property() {
        let mut config = ConnectorConfig::new("a", "debug");
        config.properties.insert("block-ms".to_string(), "soon".to_string());
        let err = config.parse_property::<u64>("block-ms").unwrap_err();
        assert!(matches!(err, ConnectorError::Configuration(_)));
        assert_eq!(None, config.parse_property::<u64>("missing").unwrap());
    }
}
