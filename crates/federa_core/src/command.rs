//! Commands pushed down to a backend.
//!
//! A command is immutable once handed to an execution and is shared behind an
//! `Arc`.

use std::fmt;

use crate::value::{Row, Value, ValueType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl CompareOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::NotEq => "<>",
            CompareOp::Lt => "<",
            CompareOp::LtEq => "<=",
            CompareOp::Gt => ">",
            CompareOp::GtEq => ">=",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Column(String),
    Literal(Value),
    Compare {
        left: Box<Expr>,
        op: CompareOp,
        right: Box<Expr>,
    },
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    IsNull(Box<Expr>),
    Function {
        name: String,
        args: Vec<Expr>,
    },
}

impl Expr {
    pub fn column(name: impl Into<String>) -> Self {
        Expr::Column(name.into())
    }

    pub fn lit(value: impl Into<Value>) -> Self {
        Expr::Literal(value.into())
    }

    pub fn compare(left: Expr, op: CompareOp, right: Expr) -> Self {
        Expr::Compare {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    pub fn eq(left: Expr, right: Expr) -> Self {
        Self::compare(left, CompareOp::Eq, right)
    }

    /// Names of every function referenced by this expression.
    pub fn functions(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.collect_functions(&mut names);
        names
    }

    fn collect_functions<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Column(_) | Expr::Literal(_) => (),
            Expr::Compare { left, right, .. } => {
                left.collect_functions(out);
                right.collect_functions(out);
            }
            Expr::And(exprs) | Expr::Or(exprs) => {
                exprs.iter().for_each(|e| e.collect_functions(out));
            }
            Expr::Not(expr) | Expr::IsNull(expr) => expr.collect_functions(out),
            Expr::Function { name, args } => {
                out.push(name);
                args.iter().for_each(|e| e.collect_functions(out));
            }
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Column(name) => write!(f, "{name}"),
            Expr::Literal(value) => write!(f, "{value}"),
            Expr::Compare { left, op, right } => write!(f, "{left} {} {right}", op.as_str()),
            Expr::And(exprs) => write_joined(f, exprs, " AND "),
            Expr::Or(exprs) => write_joined(f, exprs, " OR "),
            Expr::Not(expr) => write!(f, "NOT ({expr})"),
            Expr::IsNull(expr) => write!(f, "{expr} IS NULL"),
            Expr::Function { name, args } => {
                write!(f, "{name}(")?;
                for (idx, arg) in args.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, exprs: &[Expr], sep: &str) -> fmt::Result {
    write!(f, "(")?;
    for (idx, expr) in exprs.iter().enumerate() {
        if idx > 0 {
            f.write_str(sep)?;
        }
        write!(f, "{expr}")?;
    }
    write!(f, ")")
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub column: String,
    pub ascending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub table: String,
    /// Empty projection selects every column.
    pub projection: Vec<String>,
    pub filter: Option<Expr>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<u64>,
}

impl Select {
    pub fn all(table: impl Into<String>) -> Self {
        Select {
            table: table.into(),
            projection: Vec::new(),
            filter: None,
            order_by: Vec::new(),
            limit: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Insert {
    pub table: String,
    pub columns: Vec<String>,
    /// One statement per row.
    pub rows: Vec<Row>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub table: String,
    pub assignments: Vec<(String, Expr)>,
    pub filter: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Delete {
    pub table: String,
    pub filter: Option<Expr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterDirection {
    In,
    InOut,
    Out,
    Return,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcedureParameter {
    pub name: String,
    pub direction: ParameterDirection,
    pub value_type: ValueType,
    /// Input value for In and InOut parameters.
    pub value: Option<Value>,
}

impl ProcedureParameter {
    pub fn input(name: impl Into<String>, value: Value) -> Self {
        let value_type = value.value_type().unwrap_or(ValueType::Text);
        ProcedureParameter {
            name: name.into(),
            direction: ParameterDirection::In,
            value_type,
            value: Some(value),
        }
    }

    pub fn output(name: impl Into<String>, direction: ParameterDirection, ty: ValueType) -> Self {
        ProcedureParameter {
            name: name.into(),
            direction,
            value_type: ty,
            value: None,
        }
    }

    pub fn is_output(&self) -> bool {
        matches!(
            self.direction,
            ParameterDirection::InOut | ParameterDirection::Out | ParameterDirection::Return
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub procedure: String,
    pub parameters: Vec<ProcedureParameter>,
}

impl Call {
    /// Output parameters in retrieval order: the return parameter first, then
    /// InOut and Out parameters in declaration order.
    pub fn output_parameters(&self) -> Vec<&ProcedureParameter> {
        let ret = self
            .parameters
            .iter()
            .filter(|p| p.direction == ParameterDirection::Return);
        let rest = self.parameters.iter().filter(|p| {
            matches!(
                p.direction,
                ParameterDirection::InOut | ParameterDirection::Out
            )
        });
        ret.chain(rest).collect()
    }

    pub fn input_values(&self) -> Vec<(&str, &Value)> {
        self.parameters
            .iter()
            .filter_map(|p| match (&p.direction, &p.value) {
                (ParameterDirection::In | ParameterDirection::InOut, Some(v)) => {
                    Some((p.name.as_str(), v))
                }
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Select,
    Insert,
    Update,
    Delete,
    Call,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Select(Select),
    Insert(Insert),
    Update(Update),
    Delete(Delete),
    Call(Call),
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Select(_) => CommandKind::Select,
            Command::Insert(_) => CommandKind::Insert,
            Command::Update(_) => CommandKind::Update,
            Command::Delete(_) => CommandKind::Delete,
            Command::Call(_) => CommandKind::Call,
        }
    }

    /// Table or procedure this command targets.
    pub fn target(&self) -> &str {
        match self {
            Command::Select(s) => &s.table,
            Command::Insert(i) => &i.table,
            Command::Update(u) => &u.table,
            Command::Delete(d) => &d.table,
            Command::Call(c) => &c.procedure,
        }
    }

    /// Whether this command reports affected row counts.
    pub fn is_update(&self) -> bool {
        matches!(
            self,
            Command::Insert(_) | Command::Update(_) | Command::Delete(_)
        )
    }

    pub fn is_procedure(&self) -> bool {
        matches!(self, Command::Call(_))
    }

    pub fn as_call(&self) -> Option<&Call> {
        match self {
            Command::Call(c) => Some(c),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Select(select) => {
                if select.projection.is_empty() {
                    write!(f, "SELECT *")?;
                } else {
                    write!(f, "SELECT {}", select.projection.join(", "))?;
                }
                write!(f, " FROM {}", select.table)?;
                if let Some(filter) = &select.filter {
                    write!(f, " WHERE {filter}")?;
                }
                if !select.order_by.is_empty() {
                    let order = select
                        .order_by
                        .iter()
                        .map(|o| format!("{} {}", o.column, if o.ascending { "ASC" } else { "DESC" }))
                        .collect::<Vec<_>>()
                        .join(", ");
                    write!(f, " ORDER BY {order}")?;
                }
                if let Some(limit) = select.limit {
                    write!(f, " LIMIT {limit}")?;
                }
                Ok(())
            }
            Command::Insert(insert) => {
                write!(f, "INSERT INTO {} ({}) VALUES ", insert.table, insert.columns.join(", "))?;
                for (idx, row) in insert.rows.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    let vals = row.iter().map(|v| v.to_string()).collect::<Vec<_>>();
                    write!(f, "({})", vals.join(", "))?;
                }
                Ok(())
            }
            Command::Update(update) => {
                let sets = update
                    .assignments
                    .iter()
                    .map(|(col, expr)| format!("{col} = {expr}"))
                    .collect::<Vec<_>>();
                write!(f, "UPDATE {} SET {}", update.table, sets.join(", "))?;
                if let Some(filter) = &update.filter {
                    write!(f, " WHERE {filter}")?;
                }
                Ok(())
            }
            Command::Delete(delete) => {
                write!(f, "DELETE FROM {}", delete.table)?;
                if let Some(filter) = &delete.filter {
                    write!(f, " WHERE {filter}")?;
                }
                Ok(())
            }
            Command::Call(call) => {
                let args = call
                    .parameters
                    .iter()
                    .filter(|p| p.direction != ParameterDirection::Return)
                    .map(|p| match &p.value {
                        Some(v) => v.to_string(),
                        None => "?".to_string(),
                    })
                    .collect::<Vec<_>>();
                write!(f, "CALL {}({})", call.procedure, args.join(", "))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_select() {
        let cmd = Command::Select(Select {
            table: "orders".to_string(),
            projection: vec!["id".to_string(), "total".to_string()],
            filter: Some(Expr::And(vec![
                Expr::eq(Expr::column("status"), Expr::lit("open")),
                Expr::compare(Expr::column("total"), CompareOp::Gt, Expr::lit(10)),
            ])),
            order_by: vec![OrderBy {
                column: "id".to_string(),
                ascending: true,
            }],
            limit: Some(5),
        });
        assert_eq!(
            "SELECT id, total FROM orders WHERE (status = 'open' AND total > 10) ORDER BY id ASC LIMIT 5",
            cmd.to_string()
        );
    }

    #[test]
    fn output_parameter_order() {
        let call = Call {
            procedure: "p".to_string(),
            parameters: vec![
                ProcedureParameter::output("b", ParameterDirection::Out, ValueType::Int),
                ProcedureParameter::input("a", Value::Int(1)),
                ProcedureParameter {
                    name: "c".to_string(),
                    direction: ParameterDirection::InOut,
                    value_type: ValueType::Int,
                    value: Some(Value::Int(2)),
                },
                ProcedureParameter::output("ret", ParameterDirection::Return, ValueType::Int),
            ],
        };
        let names: Vec<_> = call
            .output_parameters()
            .iter()
            .map(|p| p.name.as_str())
            .collect();
        assert_eq!(vec!["ret", "b", "c"], names);
        assert_eq!("CALL p(?, 1, 2)", Command::Call(call).to_string());
    }

    #[test]
    fn functions_referenced() {
        let expr = Expr::eq(
            Expr::Function {
                name: "upper".to_string(),
                args: vec![Expr::Function {
                    name: "trim".to_string(),
                    args: vec![Expr::column("name")],
                }],
            },
            Expr::lit("BOB"),
        );
        assert_eq!(vec!["upper", "trim"], expr.functions());
    }
}
