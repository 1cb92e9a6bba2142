//! SQL statement building for the router's CRUD helpers.
//!
//! Table and column names are validated identifiers; values are always bound
//! as positional parameters.

use std::collections::BTreeMap;

use rusqlite::{params_from_iter, Connection};

use crate::error::{Result, ShardError};

pub use rusqlite::types::Value;

/// One row keyed by column name.
pub type Row = BTreeMap<String, Value>;

const RESERVED: &[&str] = &[
    "ALTER", "AND", "CREATE", "DELETE", "DROP", "FROM", "INDEX", "INSERT", "INTO", "NOT", "NULL",
    "OR", "SELECT", "SET", "TABLE", "UPDATE", "VALUES", "WHERE",
];

/// Accept `[A-Za-z_][A-Za-z0-9_]*` that is not a reserved word.
pub fn validate_identifier(name: &str) -> Result<&str> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid_start || !valid_rest || RESERVED.iter().any(|w| w.eq_ignore_ascii_case(name)) {
        return Err(ShardError::InvalidIdentifier(name.to_owned()));
    }
    Ok(name)
}

/// A statement with its bound parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Statement {
    pub fn execute(&self, conn: &Connection) -> Result<usize> {
        Ok(conn.execute(&self.sql, params_from_iter(self.params.iter()))?)
    }

    pub fn query(&self, conn: &Connection) -> Result<Vec<Row>> {
        query_rows(conn, &self.sql, &self.params)
    }
}

fn where_clause(filter: &Row, params: &mut Vec<Value>) -> Result<String> {
    if filter.is_empty() {
        return Ok(String::new());
    }
    let mut terms = Vec::with_capacity(filter.len());
    for (column, value) in filter {
        terms.push(format!("{} = ?", validate_identifier(column)?));
        params.push(value.clone());
    }
    Ok(format!(" WHERE {}", terms.join(" AND ")))
}

pub fn insert(table: &str, row: &Row) -> Result<Statement> {
    let table = validate_identifier(table)?;
    if row.is_empty() {
        return Err(ShardError::Operation(format!(
            "insert into {table} needs at least one column"
        )));
    }
    let columns = row
        .keys()
        .map(|c| validate_identifier(c))
        .collect::<Result<Vec<_>>>()?;
    let placeholders = vec!["?"; columns.len()].join(", ");
    Ok(Statement {
        sql: format!(
            "INSERT INTO {table} ({}) VALUES ({placeholders})",
            columns.join(", ")
        ),
        params: row.values().cloned().collect(),
    })
}

/// `SELECT *` with an equality filter. An empty filter selects every row.
pub fn select(table: &str, filter: &Row) -> Result<Statement> {
    let table = validate_identifier(table)?;
    let mut params = Vec::new();
    let clause = where_clause(filter, &mut params)?;
    Ok(Statement {
        sql: format!("SELECT * FROM {table}{clause}"),
        params,
    })
}

pub fn update(table: &str, set: &Row, filter: &Row) -> Result<Statement> {
    let table = validate_identifier(table)?;
    if set.is_empty() {
        return Err(ShardError::Operation(format!(
            "update of {table} needs at least one column"
        )));
    }
    let mut params = Vec::with_capacity(set.len() + filter.len());
    let mut assignments = Vec::with_capacity(set.len());
    for (column, value) in set {
        assignments.push(format!("{} = ?", validate_identifier(column)?));
        params.push(value.clone());
    }
    let clause = where_clause(filter, &mut params)?;
    Ok(Statement {
        sql: format!("UPDATE {table} SET {}{clause}", assignments.join(", ")),
        params,
    })
}

pub fn delete(table: &str, filter: &Row) -> Result<Statement> {
    let table = validate_identifier(table)?;
    let mut params = Vec::new();
    let clause = where_clause(filter, &mut params)?;
    Ok(Statement {
        sql: format!("DELETE FROM {table}{clause}"),
        params,
    })
}

/// Run a query and decode every row by column name.
pub fn query_rows(conn: &Connection, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(str::to_owned).collect();
    let mut rows = stmt.query(params_from_iter(params.iter()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut decoded = Row::new();
        for (i, column) in columns.iter().enumerate() {
            decoded.insert(column.clone(), row.get::<_, Value>(i)?);
        }
        out.push(decoded);
    }
    Ok(out)
}

/// Build a [`Row`] from `(column, value)` pairs.
pub fn row<I, K, V>(pairs: I) -> Row
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

pub fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Integer(i) => (*i).into(),
        Value::Real(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Text(s) => s.clone().into(),
        Value::Blob(b) => b.iter().map(|x| format!("{x:02x}")).collect::<String>().into(),
    }
}

pub fn row_to_json(row: &Row) -> serde_json::Value {
    serde_json::Value::Object(
        row.iter()
            .map(|(k, v)| (k.clone(), value_to_json(v)))
            .collect(),
    )
}
