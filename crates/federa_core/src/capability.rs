//! Capability negotiation.
//!
//! Values resolve in order: built-in defaults, then the backend's
//! [`Capabilities`] implementation, then the configured override properties.
//! Parameterized probes (those that take arguments) never consult overrides.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, LazyLock};

use federa_error::{ConnectorError, Result};
use tracing::debug;

use crate::command::{Command, Expr};
use crate::value::ValueType;

/// Prefix for override keys that toggle individual function support.
pub const FUNCTION_OVERRIDE_PREFIX: &str = "function.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilityValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl CapabilityValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            CapabilityValue::Bool(b) => Some(*b),
            CapabilityValue::Str(s) => parse_bool(s),
            CapabilityValue::Int(_) => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            CapabilityValue::Int(i) => Some(*i),
            CapabilityValue::Str(s) => s.trim().parse().ok(),
            CapabilityValue::Bool(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            CapabilityValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for CapabilityValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapabilityValue::Bool(b) => write!(f, "{b}"),
            CapabilityValue::Int(i) => write!(f, "{i}"),
            CapabilityValue::Str(s) => write!(f, "{s}"),
        }
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy)]
enum DefaultValue {
    Bool(bool),
    Int(i64),
    Str(&'static str),
    Enum {
        default: &'static str,
        allowed: &'static [&'static str],
    },
}

impl DefaultValue {
    fn value(&self) -> CapabilityValue {
        match self {
            DefaultValue::Bool(b) => CapabilityValue::Bool(*b),
            DefaultValue::Int(i) => CapabilityValue::Int(*i),
            DefaultValue::Str(s) => CapabilityValue::Str(s.to_string()),
            DefaultValue::Enum { default, .. } => CapabilityValue::Str(default.to_string()),
        }
    }
}

#[derive(Debug)]
pub struct CapabilityDef {
    pub name: &'static str,
    pub description: &'static str,
    default: DefaultValue,
}

impl CapabilityDef {
    const fn new(name: &'static str, description: &'static str, default: DefaultValue) -> Self {
        CapabilityDef {
            name,
            description,
            default,
        }
    }

    pub fn default_value(&self) -> CapabilityValue {
        self.default.value()
    }

    /// Allowed values for enum-typed capabilities.
    pub fn allowed_values(&self) -> Option<&'static [&'static str]> {
        match self.default {
            DefaultValue::Enum { allowed, .. } => Some(allowed),
            _ => None,
        }
    }
}

pub const SUPPORTS_SELECT_DISTINCT: &str = "supports_select_distinct";
pub const SUPPORTS_ORDER_BY: &str = "supports_order_by";
pub const SUPPORTS_ROW_LIMIT: &str = "supports_row_limit";
pub const SUPPORTS_ROW_OFFSET: &str = "supports_row_offset";
pub const SUPPORTS_COMPARE_EQUALS: &str = "supports_compare_criteria_equals";
pub const SUPPORTS_COMPARE_ORDERED: &str = "supports_compare_criteria_ordered";
pub const SUPPORTS_OR_CRITERIA: &str = "supports_or_criteria";
pub const SUPPORTS_NOT_CRITERIA: &str = "supports_not_criteria";
pub const SUPPORTS_IS_NULL_CRITERIA: &str = "supports_is_null_criteria";
pub const SUPPORTS_INNER_JOINS: &str = "supports_inner_joins";
pub const SUPPORTS_AGGREGATES_COUNT: &str = "supports_aggregates_count";
pub const SUPPORTS_BULK_UPDATE: &str = "supports_bulk_update";
pub const SUPPORTS_BATCHED_UPDATES: &str = "supports_batched_updates";
pub const REQUIRES_CRITERIA: &str = "requires_criteria";
pub const MAX_IN_CRITERIA_SIZE: &str = "max_in_criteria_size";
pub const MAX_PROJECTED_COLUMNS: &str = "max_projected_columns";
pub const NULL_ORDER: &str = "null_order";
pub const TRANSACTION_SUPPORT: &str = "transaction_support";
pub const NATIVE_QUERY_PROCEDURE: &str = "native_query_procedure_name";
pub const COLLATION_LOCALE: &str = "collation_locale";

pub static BUILTIN_CAPABILITIES: &[CapabilityDef] = &[
    CapabilityDef::new(SUPPORTS_SELECT_DISTINCT, "DISTINCT in the select clause", DefaultValue::Bool(false)),
    CapabilityDef::new(SUPPORTS_ORDER_BY, "ORDER BY pushdown", DefaultValue::Bool(false)),
    CapabilityDef::new(SUPPORTS_ROW_LIMIT, "Row limit pushdown", DefaultValue::Bool(false)),
    CapabilityDef::new(SUPPORTS_ROW_OFFSET, "Row offset pushdown", DefaultValue::Bool(false)),
    CapabilityDef::new(SUPPORTS_COMPARE_EQUALS, "Equality comparisons", DefaultValue::Bool(false)),
    CapabilityDef::new(SUPPORTS_COMPARE_ORDERED, "Ordered comparisons (<, <=, >, >=)", DefaultValue::Bool(false)),
    CapabilityDef::new(SUPPORTS_OR_CRITERIA, "OR criteria", DefaultValue::Bool(false)),
    CapabilityDef::new(SUPPORTS_NOT_CRITERIA, "NOT criteria", DefaultValue::Bool(false)),
    CapabilityDef::new(SUPPORTS_IS_NULL_CRITERIA, "IS NULL criteria", DefaultValue::Bool(false)),
    CapabilityDef::new(SUPPORTS_INNER_JOINS, "Inner join pushdown", DefaultValue::Bool(false)),
    CapabilityDef::new(SUPPORTS_AGGREGATES_COUNT, "COUNT aggregate pushdown", DefaultValue::Bool(false)),
    CapabilityDef::new(SUPPORTS_BULK_UPDATE, "Multiple value sets in one statement", DefaultValue::Bool(false)),
    CapabilityDef::new(SUPPORTS_BATCHED_UPDATES, "Multiple statements in one batch", DefaultValue::Bool(false)),
    CapabilityDef::new(REQUIRES_CRITERIA, "Queries must have criteria", DefaultValue::Bool(false)),
    CapabilityDef::new(MAX_IN_CRITERIA_SIZE, "Maximum IN list size, -1 for unlimited", DefaultValue::Int(-1)),
    CapabilityDef::new(MAX_PROJECTED_COLUMNS, "Maximum projected columns, -1 for unlimited", DefaultValue::Int(-1)),
    CapabilityDef::new(
        NULL_ORDER,
        "Where nulls sort by default",
        DefaultValue::Enum {
            default: "unknown",
            allowed: &["unknown", "low", "high", "first", "last"],
        },
    ),
    CapabilityDef::new(
        TRANSACTION_SUPPORT,
        "Transaction participation",
        DefaultValue::Enum {
            default: "none",
            allowed: &["none", "local", "xa"],
        },
    ),
    CapabilityDef::new(NATIVE_QUERY_PROCEDURE, "Procedure name used for native queries", DefaultValue::Str("native")),
    CapabilityDef::new(COLLATION_LOCALE, "Collation used by the backend for sorting", DefaultValue::Str("")),
];

static BUILTIN_BY_NAME: LazyLock<HashMap<&'static str, &'static CapabilityDef>> = LazyLock::new(|| {
    let mut map = HashMap::new();
    for def in BUILTIN_CAPABILITIES {
        if map.insert(def.name, def).is_some() {
            panic!("Duplicate capability name: {}", def.name);
        }
    }
    map
});

pub fn builtin_capability(name: &str) -> Option<&'static CapabilityDef> {
    BUILTIN_BY_NAME.get(name).copied()
}

/// Capabilities implemented by a backend type.
pub trait Capabilities: fmt::Debug + Sync + Send + 'static {
    /// Value of a no-argument probe.
    ///
    /// Returning None falls back to the built-in default.
    fn probe(&self, name: &str) -> Option<CapabilityValue> {
        let _ = name;
        None
    }

    /// Functions this backend can evaluate.
    fn supported_functions(&self) -> Vec<String> {
        Vec::new()
    }

    /// Parameterized probe for a function with a specific signature.
    fn supports_function_signature(&self, name: &str, args: &[ValueType]) -> bool {
        let _ = args;
        self.supported_functions()
            .iter()
            .any(|f| f.eq_ignore_ascii_case(name))
    }
}

/// Backend with nothing beyond the built-in defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCapabilities;

impl Capabilities for DefaultCapabilities {}

/// Override properties loaded from configuration.
///
/// Read-only once constructed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilityOverrides {
    props: BTreeMap<String, String>,
}

impl CapabilityOverrides {
    pub fn new<I, K, V>(props: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        CapabilityOverrides {
            props: props
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Override for `name`, with blank values treated as absent.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.props
            .get(name)
            .map(|s| s.as_str())
            .filter(|s| !s.trim().is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }

    fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.props.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Resolved view of a backend's capabilities.
///
/// Wraps the backend's implementation with the override table. Resolution
/// happens once at construction so repeated lookups are deterministic.
#[derive(Debug, Clone)]
pub struct CapabilityDescriptor {
    backend_type: String,
    base: Arc<dyn Capabilities>,
    resolved: BTreeMap<String, CapabilityValue>,
    function_overrides: HashMap<String, bool>,
}

impl CapabilityDescriptor {
    pub fn resolve(
        backend_type: impl Into<String>,
        base: Arc<dyn Capabilities>,
        overrides: &CapabilityOverrides,
    ) -> Result<Self> {
        let backend_type = backend_type.into();
        let mut resolved = BTreeMap::new();

        for def in BUILTIN_CAPABILITIES {
            let base_value = base.probe(def.name).unwrap_or_else(|| def.default_value());
            let value = match overrides.get(def.name) {
                Some(raw) => parse_override(def.name, raw, &base_value, def.allowed_values())?,
                None => base_value,
            };
            resolved.insert(def.name.to_string(), value);
        }

        let mut function_overrides = HashMap::new();
        for (name, raw) in overrides.iter() {
            if let Some(func) = name.strip_prefix(FUNCTION_OVERRIDE_PREFIX) {
                if raw.trim().is_empty() {
                    continue;
                }
                let enabled = parse_bool(raw).ok_or_else(|| {
                    ConnectorError::Configuration(format!(
                        "Capability override '{name}' for '{backend_type}' must be 'true' or 'false', got '{raw}'"
                    ))
                })?;
                function_overrides.insert(func.to_ascii_lowercase(), enabled);
                continue;
            }

            if builtin_capability(name).is_some() {
                continue;
            }

            // Not a built-in. Type the override after the base value if the
            // backend knows the name, otherwise keep it as a string.
            let value = match (base.probe(name), overrides.get(name)) {
                (Some(base_value), Some(raw)) => parse_override(name, raw, &base_value, None)?,
                (Some(base_value), None) => base_value,
                (None, Some(raw)) => CapabilityValue::Str(raw.to_string()),
                (None, None) => continue,
            };
            resolved.insert(name.to_string(), value);
        }

        debug!(%backend_type, overrides = ?overrides, "resolved capabilities");

        Ok(CapabilityDescriptor {
            backend_type,
            base,
            resolved,
            function_overrides,
        })
    }

    pub fn backend_type(&self) -> &str {
        &self.backend_type
    }

    pub fn get(&self, name: &str) -> Option<CapabilityValue> {
        match self.resolved.get(name) {
            Some(v) => Some(v.clone()),
            None => self.base.probe(name),
        }
    }

    /// Boolean probe. Unknown or non-boolean capabilities are unsupported.
    pub fn supports(&self, name: &str) -> bool {
        self.get_bool(name).unwrap_or(false)
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(|v| v.as_bool())
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(|v| v.as_int())
    }

    pub fn get_str(&self, name: &str) -> Option<String> {
        self.get(name).map(|v| v.to_string())
    }

    /// Whether a function is supported, consulting `function.<name>`
    /// overrides first.
    pub fn supports_function(&self, name: &str) -> bool {
        if let Some(enabled) = self.function_overrides.get(&name.to_ascii_lowercase()) {
            return *enabled;
        }
        self.base
            .supported_functions()
            .iter()
            .any(|f| f.eq_ignore_ascii_case(name))
    }

    /// Parameterized probe. Always answered by the backend implementation,
    /// overrides are never consulted.
    pub fn supports_function_signature(&self, name: &str, args: &[ValueType]) -> bool {
        self.base.supports_function_signature(name, args)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.resolved.keys().map(|k| k.as_str())
    }

    /// Resolved capabilities, sorted by name.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &CapabilityValue)> {
        self.resolved.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Check that a command only uses features this backend supports.
    pub fn check_command(&self, command: &Command) -> Result<()> {
        match command {
            Command::Select(select) => {
                match &select.filter {
                    Some(filter) => self.check_expr(filter)?,
                    None if self.supports(REQUIRES_CRITERIA) => {
                        return Err(self.unsupported(format!(
                            "queries against '{}' require criteria",
                            select.table
                        )));
                    }
                    None => (),
                }
                if !select.order_by.is_empty() && !self.supports(SUPPORTS_ORDER_BY) {
                    return Err(self.unsupported("ORDER BY"));
                }
                if select.limit.is_some() && !self.supports(SUPPORTS_ROW_LIMIT) {
                    return Err(self.unsupported("LIMIT"));
                }
                let max_cols = self.get_int(MAX_PROJECTED_COLUMNS).unwrap_or(-1);
                if max_cols >= 0 && select.projection.len() as i64 > max_cols {
                    return Err(self.unsupported(format!(
                        "projecting {} columns (maximum {max_cols})",
                        select.projection.len()
                    )));
                }
                Ok(())
            }
            Command::Insert(insert) => {
                if insert.rows.len() > 1
                    && !(self.supports(SUPPORTS_BULK_UPDATE) || self.supports(SUPPORTS_BATCHED_UPDATES))
                {
                    return Err(self.unsupported("multi-row INSERT"));
                }
                Ok(())
            }
            Command::Update(update) => {
                for (_, expr) in &update.assignments {
                    self.check_expr(expr)?;
                }
                match &update.filter {
                    Some(filter) => self.check_expr(filter),
                    None => Ok(()),
                }
            }
            Command::Delete(delete) => match &delete.filter {
                Some(filter) => self.check_expr(filter),
                None => Ok(()),
            },
            Command::Call(_) => Ok(()),
        }
    }

    fn check_expr(&self, expr: &Expr) -> Result<()> {
        use crate::command::CompareOp;

        match expr {
            Expr::Column(_) | Expr::Literal(_) => Ok(()),
            Expr::Compare { left, op, right } => {
                let cap = match op {
                    CompareOp::Eq | CompareOp::NotEq => SUPPORTS_COMPARE_EQUALS,
                    _ => SUPPORTS_COMPARE_ORDERED,
                };
                if !self.supports(cap) {
                    return Err(self.unsupported(format!("comparison '{}'", op.as_str())));
                }
                self.check_expr(left)?;
                self.check_expr(right)
            }
            Expr::And(exprs) => exprs.iter().try_for_each(|e| self.check_expr(e)),
            Expr::Or(exprs) => {
                if !self.supports(SUPPORTS_OR_CRITERIA) {
                    return Err(self.unsupported("OR criteria"));
                }
                exprs.iter().try_for_each(|e| self.check_expr(e))
            }
            Expr::Not(inner) => {
                if !self.supports(SUPPORTS_NOT_CRITERIA) {
                    return Err(self.unsupported("NOT criteria"));
                }
                self.check_expr(inner)
            }
            Expr::IsNull(inner) => {
                if !self.supports(SUPPORTS_IS_NULL_CRITERIA) {
                    return Err(self.unsupported("IS NULL criteria"));
                }
                self.check_expr(inner)
            }
            Expr::Function { name, args } => {
                if !self.supports_function(name) {
                    return Err(self.unsupported(format!("function '{name}'")));
                }
                args.iter().try_for_each(|e| self.check_expr(e))
            }
        }
    }

    fn unsupported(&self, what: impl fmt::Display) -> ConnectorError {
        ConnectorError::Unsupported(format!(
            "Backend '{}' does not support {what}",
            self.backend_type
        ))
    }
}

fn parse_override(
    name: &str,
    raw: &str,
    typed_as: &CapabilityValue,
    allowed: Option<&[&str]>,
) -> Result<CapabilityValue> {
    let raw = raw.trim();
    let value = match typed_as {
        CapabilityValue::Bool(_) => parse_bool(raw).map(CapabilityValue::Bool),
        CapabilityValue::Int(_) => raw.parse().ok().map(CapabilityValue::Int),
        CapabilityValue::Str(_) => match allowed {
            Some(allowed) => allowed
                .iter()
                .find(|a| a.eq_ignore_ascii_case(raw))
                .map(|a| CapabilityValue::Str(a.to_string())),
            None => Some(CapabilityValue::Str(raw.to_string())),
        },
    };

    value.ok_or_else(|| {
        let expected = match (typed_as, allowed) {
            (CapabilityValue::Bool(_), _) => "'true' or 'false'".to_string(),
            (CapabilityValue::Int(_), _) => "an integer".to_string(),
            (CapabilityValue::Str(_), Some(allowed)) => format!("one of {allowed:?}"),
            (CapabilityValue::Str(_), None) => "a string".to_string(),
        };
        ConnectorError::Configuration(format!(
            "Capability override '{name}' must be {expected}, got '{raw}'"
        ))
    })
}
