//! Combining per-shard results into one answer.

use std::cmp::Ordering;
use std::fmt;

use rusqlite::types::Value;
use rusqlite::Connection;

use crate::error::{Result, ShardError};
use crate::router::FanOut;
use crate::sql::{self, Row};

/// Concatenate rows from every shard, in shard id order.
pub fn concat_rows(fan: FanOut<Vec<Row>>) -> Vec<Row> {
    fan.results.into_iter().flat_map(|(_, rows)| rows).collect()
}

/// Sum of affected-row counts.
pub fn total_affected(fan: &FanOut<usize>) -> usize {
    fan.values().sum()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateKind {
    Count,
    Sum,
    Min,
    Max,
    Avg,
}

impl AggregateKind {
    fn name(self) -> &'static str {
        match self {
            AggregateKind::Count => "COUNT",
            AggregateKind::Sum => "SUM",
            AggregateKind::Min => "MIN",
            AggregateKind::Max => "MAX",
            AggregateKind::Avg => "AVG",
        }
    }
}

/// One shard's contribution to an aggregate. `count` is only meaningful for
/// `AVG`, where `value` holds the shard's sum.
#[derive(Debug, Clone, PartialEq)]
pub struct Partial {
    pub value: Value,
    pub count: i64,
}

/// A parsed aggregate expression such as `COUNT(*)` or `sum(amount)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregate {
    kind: AggregateKind,
    column: Option<String>,
}

impl Aggregate {
    pub fn parse(expr: &str) -> Result<Self> {
        let invalid = || ShardError::Operation(format!("unsupported aggregate expression {expr:?}"));
        let expr = expr.trim();
        let open = expr.find('(').ok_or_else(invalid)?;
        let inner = expr[open + 1..].strip_suffix(')').ok_or_else(invalid)?.trim();
        let kind = match expr[..open].trim().to_ascii_uppercase().as_str() {
            "COUNT" => AggregateKind::Count,
            "SUM" => AggregateKind::Sum,
            "MIN" => AggregateKind::Min,
            "MAX" => AggregateKind::Max,
            "AVG" => AggregateKind::Avg,
            _ => return Err(invalid()),
        };
        let column = match inner {
            "*" if kind == AggregateKind::Count => None,
            "*" => return Err(invalid()),
            name => Some(sql::validate_identifier(name)?.to_owned()),
        };
        Ok(Self { kind, column })
    }

    pub fn kind(&self) -> AggregateKind {
        self.kind
    }

    fn target(&self) -> &str {
        self.column.as_deref().unwrap_or("*")
    }

    /// Compute this shard's partial. `table` must be a validated identifier.
    pub fn partial(&self, conn: &Connection, table: &str) -> Result<Partial> {
        let col = self.target();
        let sql = match self.kind {
            AggregateKind::Avg => format!("SELECT SUM({col}), COUNT({col}) FROM {table}"),
            kind => format!("SELECT {}({col}), 0 FROM {table}", kind.name()),
        };
        let partial = conn.query_row(&sql, [], |row| {
            Ok(Partial {
                value: row.get(0)?,
                count: row.get(1)?,
            })
        })?;
        Ok(partial)
    }

    /// Merge shard partials into the cluster-wide value.
    pub fn merge<'a>(&self, partials: impl IntoIterator<Item = &'a Partial>) -> Value {
        let partials = partials.into_iter();
        match self.kind {
            AggregateKind::Count | AggregateKind::Sum => {
                let total = partials.fold(None, |acc, p| add(acc, &p.value));
                match (self.kind, total) {
                    (AggregateKind::Count, None) => Value::Integer(0),
                    (_, total) => total.unwrap_or(Value::Null),
                }
            }
            AggregateKind::Min => extreme(partials, Ordering::Less),
            AggregateKind::Max => extreme(partials, Ordering::Greater),
            AggregateKind::Avg => {
                let mut count = 0i64;
                let mut sum = None;
                for p in partials {
                    count += p.count;
                    sum = add(sum, &p.value);
                }
                match (sum.as_ref().and_then(as_f64), count) {
                    (Some(sum), count) if count > 0 => Value::Real(sum / count as f64),
                    _ => Value::Null,
                }
            }
        }
    }
}

impl fmt::Display for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind.name(), self.target())
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Integer(i) => Some(*i as f64),
        Value::Real(r) => Some(*r),
        _ => None,
    }
}

/// Numeric addition that stays integral until a real shows up. `NULL`
/// partials (empty shards) are skipped.
fn add(acc: Option<Value>, next: &Value) -> Option<Value> {
    match (acc, next) {
        (acc, Value::Null) => acc,
        (None, v) => Some(v.clone()),
        (Some(Value::Integer(a)), Value::Integer(b)) => Some(match a.checked_add(*b) {
            Some(sum) => Value::Integer(sum),
            None => Value::Real(a as f64 + *b as f64),
        }),
        (Some(a), b) => match (as_f64(&a), as_f64(b)) {
            (Some(a), Some(b)) => Some(Value::Real(a + b)),
            _ => Some(a),
        },
    }
}

fn extreme<'a>(partials: impl Iterator<Item = &'a Partial>, want: Ordering) -> Value {
    partials
        .map(|p| &p.value)
        .filter(|v| !matches!(v, Value::Null))
        .fold(None::<&Value>, |best, v| match best {
            Some(b) if compare(v, b) != want => Some(b),
            _ => Some(v),
        })
        .cloned()
        .unwrap_or(Value::Null)
}

/// SQLite's cross-type ordering: numbers, then text, then blobs.
fn compare(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Integer(_) | Value::Real(_) => 1,
            Value::Text(_) => 2,
            Value::Blob(_) => 3,
        }
    }
    match (a, b) {
        (Value::Text(x), Value::Text(y)) => x.cmp(y),
        (Value::Blob(x), Value::Blob(y)) => x.cmp(y),
        _ => match (as_f64(a), as_f64(b)) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => rank(a).cmp(&rank(b)),
        },
    }
}
