//! In-memory tables and procedures backing the debug connectors.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use federa_error::{ConnectorError, Result, ResultExt};
use parking_lot::RwLock;
use serde::Deserialize;

use crate::command::{Call, CompareOp, Delete, Expr, Insert, ParameterDirection, Select, Update};
use crate::value::{Row, Value};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DebugTable {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl DebugTable {
    pub fn new(columns: Vec<String>, rows: Vec<Row>) -> Result<Self> {
        if let Some(row) = rows.iter().find(|r| r.len() != columns.len()) {
            return Err(ConnectorError::InvalidArgument(format!(
                "Row has {} values, table has {} columns",
                row.len(),
                columns.len()
            )));
        }
        Ok(DebugTable { columns, rows })
    }

    fn column_index(&self, name: &str) -> Result<usize> {
        column_index(&self.columns, name)
    }
}

/// Canned result of a procedure.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DebugProcedure {
    pub rows: Vec<Row>,
    /// Values for Out and Return parameters by name. InOut parameters
    /// without a value here echo their input.
    pub outputs: BTreeMap<String, Value>,
}

/// Result of calling a procedure.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallResult {
    pub rows: Vec<Row>,
    pub outputs: Vec<(String, Value)>,
}

#[derive(Debug, Default)]
pub struct DebugStore {
    tables: RwLock<BTreeMap<String, DebugTable>>,
    procedures: RwLock<BTreeMap<String, DebugProcedure>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Seed {
    #[serde(default)]
    tables: BTreeMap<String, SeedTable>,
    #[serde(default)]
    procedures: BTreeMap<String, SeedProcedure>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SeedTable {
    columns: Vec<String>,
    #[serde(default)]
    rows: Vec<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SeedProcedure {
    #[serde(default)]
    rows: Vec<Vec<serde_json::Value>>,
    #[serde(default)]
    outputs: BTreeMap<String, serde_json::Value>,
}

/// Convert a JSON scalar to a value.
pub fn json_to_value(json: &serde_json::Value) -> Result<Value> {
    Ok(match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Boolean(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        serde_json::Value::String(s) => Value::Text(s.clone()),
        other => {
            return Err(ConnectorError::InvalidArgument(format!(
                "Unsupported seed value: {other}"
            )));
        }
    })
}

/// Convert JSON rows to rows of values.
pub fn json_rows(rows: &[Vec<serde_json::Value>]) -> Result<Vec<Row>> {
    rows.iter()
        .map(|row| row.iter().map(json_to_value).collect())
        .collect()
}

impl DebugStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from a JSON seed document:
    ///
    /// `{"tables": {"t": {"columns": [..], "rows": [[..]]}}, "procedures": {"p": {"rows": [..], "outputs": {..}}}}`
    pub fn from_seed_json(seed: &str) -> Result<Self> {
        let seed: Seed = serde_json::from_str(seed).context("Failed to parse debug seed")?;
        let store = DebugStore::new();
        for (name, table) in seed.tables {
            store.create_table(name, table.columns, json_rows(&table.rows)?)?;
        }
        for (name, proc) in seed.procedures {
            let outputs = proc
                .outputs
                .iter()
                .map(|(k, v)| Ok((k.clone(), json_to_value(v)?)))
                .collect::<Result<_>>()?;
            store.register_procedure(
                name,
                DebugProcedure {
                    rows: json_rows(&proc.rows)?,
                    outputs,
                },
            );
        }
        Ok(store)
    }

    pub fn create_table(&self, name: impl Into<String>, columns: Vec<String>, rows: Vec<Row>) -> Result<()> {
        let name = name.into();
        let table = DebugTable::new(columns, rows)?;
        let mut tables = self.tables.write();
        if tables.contains_key(&name) {
            return Err(ConnectorError::InvalidArgument(format!(
                "Duplicate table: {name}"
            )));
        }
        tables.insert(name, table);
        Ok(())
    }

    pub fn register_procedure(&self, name: impl Into<String>, procedure: DebugProcedure) {
        self.procedures.write().insert(name.into(), procedure);
    }

    pub fn table(&self, name: &str) -> Option<DebugTable> {
        self.tables.read().get(name).cloned()
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.read().keys().cloned().collect()
    }

    pub fn select(&self, select: &Select) -> Result<(Vec<String>, Vec<Row>)> {
        let tables = self.tables.read();
        let table = lookup(&tables, &select.table)?;

        let mut rows = Vec::new();
        for row in &table.rows {
            if matches_filter(select.filter.as_ref(), &table.columns, row)? {
                rows.push(row.clone());
            }
        }

        if !select.order_by.is_empty() {
            let keys = select
                .order_by
                .iter()
                .map(|o| Ok((table.column_index(&o.column)?, o.ascending)))
                .collect::<Result<Vec<_>>>()?;
            rows.sort_by(|a, b| {
                for (idx, ascending) in &keys {
                    // Nulls sort low.
                    let ord = match (&a[*idx], &b[*idx]) {
                        (Value::Null, Value::Null) => Ordering::Equal,
                        (Value::Null, _) => Ordering::Less,
                        (_, Value::Null) => Ordering::Greater,
                        (x, y) => x.sql_cmp(y).unwrap_or(Ordering::Equal),
                    };
                    let ord = if *ascending { ord } else { ord.reverse() };
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            });
        }

        if let Some(limit) = select.limit {
            rows.truncate(limit as usize);
        }

        project(&table.columns, rows, &select.projection)
    }

    pub fn insert(&self, insert: &Insert) -> Result<u64> {
        let mut tables = self.tables.write();
        let table = lookup_mut(&mut tables, &insert.table)?;
        let positions = insert
            .columns
            .iter()
            .map(|c| table.column_index(c))
            .collect::<Result<Vec<_>>>()?;

        let mut new_rows = Vec::with_capacity(insert.rows.len());
        for values in &insert.rows {
            if values.len() != positions.len() {
                return Err(ConnectorError::InvalidArgument(format!(
                    "Insert into {} has {} values for {} columns",
                    insert.table,
                    values.len(),
                    positions.len()
                )));
            }
            let mut row = vec![Value::Null; table.columns.len()];
            for (pos, value) in positions.iter().zip(values) {
                row[*pos] = value.clone();
            }
            new_rows.push(row);
        }
        let count = new_rows.len() as u64;
        table.rows.extend(new_rows);
        Ok(count)
    }

    pub fn update(&self, update: &Update) -> Result<u64> {
        let mut tables = self.tables.write();
        let table = lookup_mut(&mut tables, &update.table)?;
        let targets = update
            .assignments
            .iter()
            .map(|(col, expr)| Ok((table.column_index(col)?, expr)))
            .collect::<Result<Vec<_>>>()?;

        // Evaluate everything before writing so a failure leaves the table
        // untouched.
        let mut changes = Vec::new();
        for (idx, row) in table.rows.iter().enumerate() {
            if matches_filter(update.filter.as_ref(), &table.columns, row)? {
                let values = targets
                    .iter()
                    .map(|(pos, expr)| Ok((*pos, eval(expr, &table.columns, row)?)))
                    .collect::<Result<Vec<_>>>()?;
                changes.push((idx, values));
            }
        }
        let count = changes.len() as u64;
        for (idx, values) in changes {
            for (pos, value) in values {
                table.rows[idx][pos] = value;
            }
        }
        Ok(count)
    }

    pub fn delete(&self, delete: &Delete) -> Result<u64> {
        let mut tables = self.tables.write();
        let table = lookup_mut(&mut tables, &delete.table)?;
        let mut keep = Vec::with_capacity(table.rows.len());
        for row in &table.rows {
            keep.push(!matches_filter(delete.filter.as_ref(), &table.columns, row)?);
        }
        let before = table.rows.len();
        let mut flags = keep.into_iter();
        table.rows.retain(|_| flags.next().unwrap_or(true));
        Ok((before - table.rows.len()) as u64)
    }

    pub fn call(&self, call: &Call) -> Result<CallResult> {
        let procedures = self.procedures.read();
        let procedure = procedures.get(&call.procedure).ok_or_else(|| {
            ConnectorError::source_operation(format!("Unknown procedure: {}", call.procedure))
        })?;

        let outputs = call
            .output_parameters()
            .into_iter()
            .filter_map(|param| {
                let value = procedure.outputs.get(&param.name).cloned().or_else(|| {
                    (param.direction == ParameterDirection::InOut)
                        .then(|| param.value.clone())
                        .flatten()
                })?;
                Some((param.name.clone(), value))
            })
            .collect();

        Ok(CallResult {
            rows: procedure.rows.clone(),
            outputs,
        })
    }
}

fn lookup<'a>(tables: &'a BTreeMap<String, DebugTable>, name: &str) -> Result<&'a DebugTable> {
    tables
        .get(name)
        .ok_or_else(|| ConnectorError::source_operation(format!("Missing table: {name}")))
}

fn lookup_mut<'a>(tables: &'a mut BTreeMap<String, DebugTable>, name: &str) -> Result<&'a mut DebugTable> {
    tables
        .get_mut(name)
        .ok_or_else(|| ConnectorError::source_operation(format!("Missing table: {name}")))
}

fn column_index(columns: &[String], name: &str) -> Result<usize> {
    columns
        .iter()
        .position(|c| c.eq_ignore_ascii_case(name))
        .ok_or_else(|| ConnectorError::source_operation(format!("Missing column: {name}")))
}

/// Project `rows` onto `projection`. An empty projection keeps every column.
pub fn project(columns: &[String], rows: Vec<Row>, projection: &[String]) -> Result<(Vec<String>, Vec<Row>)> {
    if projection.is_empty() {
        return Ok((columns.to_vec(), rows));
    }
    let positions = projection
        .iter()
        .map(|p| column_index(columns, p))
        .collect::<Result<Vec<_>>>()?;
    let rows = rows
        .into_iter()
        .map(|row| positions.iter().map(|p| row[*p].clone()).collect())
        .collect();
    Ok((projection.to_vec(), rows))
}

fn matches_filter(filter: Option<&Expr>, columns: &[String], row: &Row) -> Result<bool> {
    match filter {
        Some(expr) => Ok(eval(expr, columns, row)? == Value::Boolean(true)),
        None => Ok(true),
    }
}

/// Evaluate an expression against a row. Comparisons involving null yield
/// null.
pub fn eval(expr: &Expr, columns: &[String], row: &Row) -> Result<Value> {
    Ok(match expr {
        Expr::Column(name) => row[column_index(columns, name)?].clone(),
        Expr::Literal(value) => value.clone(),
        Expr::Compare { left, op, right } => {
            let left = eval(left, columns, row)?;
            let right = eval(right, columns, row)?;
            match left.sql_cmp(&right) {
                Some(ord) => Value::Boolean(match op {
                    CompareOp::Eq => ord == Ordering::Equal,
                    CompareOp::NotEq => ord != Ordering::Equal,
                    CompareOp::Lt => ord == Ordering::Less,
                    CompareOp::LtEq => ord != Ordering::Greater,
                    CompareOp::Gt => ord == Ordering::Greater,
                    CompareOp::GtEq => ord != Ordering::Less,
                }),
                None => Value::Null,
            }
        }
        Expr::And(exprs) => {
            let mut saw_null = false;
            for e in exprs {
                match eval(e, columns, row)? {
                    Value::Boolean(false) => return Ok(Value::Boolean(false)),
                    Value::Boolean(true) => (),
                    _ => saw_null = true,
                }
            }
            if saw_null { Value::Null } else { Value::Boolean(true) }
        }
        Expr::Or(exprs) => {
            let mut saw_null = false;
            for e in exprs {
                match eval(e, columns, row)? {
                    Value::Boolean(true) => return Ok(Value::Boolean(true)),
                    Value::Boolean(false) => (),
                    _ => saw_null = true,
                }
            }
            if saw_null { Value::Null } else { Value::Boolean(false) }
        }
        Expr::Not(inner) => match eval(inner, columns, row)? {
            Value::Boolean(b) => Value::Boolean(!b),
            _ => Value::Null,
        },
        Expr::IsNull(inner) => Value::Boolean(eval(inner, columns, row)?.is_null()),
        Expr::Function { name, args } => {
            let args = args
                .iter()
                .map(|a| eval(a, columns, row))
                .collect::<Result<Vec<_>>>()?;
            call_function(name, args)?
        }
    })
}

/// Scalar functions understood by the debug backends.
pub const DEBUG_FUNCTIONS: &[&str] = &["upper", "lower", "length", "abs", "coalesce"];

fn call_function(name: &str, args: Vec<Value>) -> Result<Value> {
    let lower = name.to_ascii_lowercase();
    let bad_args = || {
        ConnectorError::InvalidArgument(format!("Invalid arguments for function '{name}'"))
    };
    Ok(match (lower.as_str(), args.as_slice()) {
        ("coalesce", args) if !args.is_empty() => args
            .iter()
            .find(|v| !v.is_null())
            .cloned()
            .unwrap_or(Value::Null),
        (_, [Value::Null]) if lower != "coalesce" => Value::Null,
        ("upper", [Value::Text(s)]) => Value::Text(s.to_uppercase()),
        ("lower", [Value::Text(s)]) => Value::Text(s.to_lowercase()),
        ("length", [Value::Text(s)]) => Value::Int(s.chars().count() as i64),
        ("abs", [Value::Int(i)]) => Value::Int(i.checked_abs().ok_or_else(bad_args)?),
        ("abs", [Value::Float(f)]) => Value::Float(f.abs()),
        (f, _) if DEBUG_FUNCTIONS.contains(&f) => return Err(bad_args()),
        _ => {
            return Err(ConnectorError::Unsupported(format!(
                "Unknown function '{name}'"
            )));
        }
    })
}
