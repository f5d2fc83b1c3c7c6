//! Operator commands for federa connector configurations.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use federa_core::config::PoolConfig;
use federa_core::{Connector, ConnectorManager, FactoryRegistry, FederaConfig, IdentityMode};
use federa_error::{Result, ResultExt};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum LogFormatArg {
    #[default]
    Human,
    Json,
}

impl From<LogFormatArg> for logutil::LogFormat {
    fn from(format: LogFormatArg) -> Self {
        match format {
            LogFormatArg::Human => logutil::LogFormat::HumanReadable,
            LogFormatArg::Json => logutil::LogFormat::Json,
        }
    }
}

#[derive(Debug, Parser)]
#[clap(name = "federa")]
#[clap(version)]
#[clap(about = "Inspect federa connector configurations", long_about = None)]
pub struct Cli {
    /// Log verbosity. Repeat for more detail.
    #[clap(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Format of log lines written to stderr.
    #[clap(long, value_enum, env = "FEDERA_LOG_FORMAT", default_value = "human", global = true)]
    pub log_format: LogFormatArg,

    #[clap(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn log_level(&self) -> tracing::Level {
        match self.verbose {
            0 => tracing::Level::WARN,
            1 => tracing::Level::INFO,
            2 => tracing::Level::DEBUG,
            _ => tracing::Level::TRACE,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Load a configuration, create every connector and print the resolved
    /// capabilities and pool settings.
    Validate {
        /// Path to the JSON configuration file.
        config: PathBuf,

        /// Print the report as JSON.
        #[clap(long)]
        json: bool,
    },
    /// List the backend types connectors can be configured with.
    Backends,
}

/// Resolved view of one configured connector.
#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConnectorReport {
    pub name: String,
    pub backend_type: String,
    pub identity: IdentityMode,
    pub pool: PoolConfig,
    pub capabilities: BTreeMap<String, String>,
}

impl ConnectorReport {
    fn new(connector: &dyn Connector, pool: PoolConfig) -> Self {
        ConnectorReport {
            name: connector.name().to_string(),
            backend_type: connector.backend_type().to_string(),
            identity: connector.identity_mode(),
            pool,
            capabilities: connector
                .capabilities()
                .entries()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
        }
    }

    fn write_text(&self, out: &mut dyn Write) -> std::io::Result<()> {
        writeln!(out, "connector {} ({})", self.name, self.backend_type)?;
        let identity = match self.identity {
            IdentityMode::Singleton => "singleton",
            IdentityMode::PerPrincipal => "per-principal",
        };
        writeln!(out, "  identity: {identity}")?;
        writeln!(out, "  pool:")?;
        writeln!(out, "    max-pool-size: {}", self.pool.max_pool_size)?;
        match self.pool.max_per_identity {
            Some(n) => writeln!(out, "    max-per-identity: {n}")?,
            None => writeln!(out, "    max-per-identity: unlimited")?,
        }
        writeln!(
            out,
            "    wait-time-for-resource: {}ms",
            self.pool.wait_time_for_resource.as_millis()
        )?;
        writeln!(
            out,
            "    resource-test-interval: {}ms",
            self.pool.resource_test_interval.as_millis()
        )?;
        writeln!(out, "  capabilities:")?;
        for (name, value) in &self.capabilities {
            writeln!(out, "    {name}: {value}")?;
        }
        Ok(())
    }
}

/// Build reports for every connector in the configuration at `path`.
///
/// Connectors are created for real so capability overrides and pool sizing
/// are checked the same way they are at startup.
pub fn validate_config(registry: &FactoryRegistry, path: &std::path::Path) -> Result<Vec<ConnectorReport>> {
    let config = FederaConfig::from_path(path)?;
    let manager = ConnectorManager::new(registry, &config)?;

    let mut reports = Vec::with_capacity(config.connectors.len());
    for conn_config in &config.connectors {
        let connector = manager.connector(&conn_config.name)?;
        reports.push(ConnectorReport::new(connector.as_ref(), conn_config.pool.clone()));
    }
    manager.shutdown();

    info!(path = %path.display(), connectors = reports.len(), "configuration is valid");
    Ok(reports)
}

pub fn run(command: &Commands, out: &mut dyn Write) -> Result<()> {
    let registry = FactoryRegistry::with_builtin();
    match command {
        Commands::Validate { config, json } => {
            let reports = validate_config(&registry, config)?;
            if *json {
                let s = serde_json::to_string_pretty(&reports).context("Failed to encode report")?;
                writeln!(out, "{s}").context("Failed to write report")?;
            } else {
                for report in &reports {
                    report.write_text(out).context("Failed to write report")?;
                }
            }
        }
        Commands::Backends => {
            for backend_type in registry.backend_types() {
                writeln!(out, "{backend_type}").context("Failed to write backend types")?;
            }
        }
    }
    Ok(())
}
