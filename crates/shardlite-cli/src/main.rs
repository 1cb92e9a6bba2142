use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::json;
use shardlite_core::sql::{row_to_json, value_to_json, Value};
use shardlite_core::{Result, Row, ShardError, ShardKey, ShardManager, ShardliteConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "shardlite")]
#[command(about = "Manage and query a directory of SQLite shards")]
struct Cli {
    /// JSON or YAML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides `db_dir` from the configuration.
    #[arg(long)]
    db_dir: Option<PathBuf>,

    /// Overrides `num_shards` from the configuration.
    #[arg(long)]
    shards: Option<u32>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the shard directory and files.
    Init,
    /// Apply a DDL script to every shard.
    Schema {
        /// SQL text, or `@path` to read it from a file.
        ddl: String,
    },
    /// Show which shard each key routes to.
    Route { keys: Vec<ShardKey> },
    /// Shard sizes, key distribution and pool usage.
    Stats,
    /// Check that every shard file opens.
    Validate,
    /// Insert a JSON object as one row on the key's shard.
    Insert {
        table: String,
        #[arg(long, allow_hyphen_values = true)]
        key: ShardKey,
        /// Row as a JSON object, e.g. '{"id": 1, "name": "a"}'.
        row: String,
    },
    /// Select rows from one shard, or every shard without `--key`.
    Select {
        table: String,
        #[arg(long, allow_hyphen_values = true)]
        key: Option<ShardKey>,
        /// Equality filter as a JSON object.
        #[arg(long = "where")]
        filter: Option<String>,
    },
    /// Cluster-wide aggregate such as 'SUM(amount)'.
    Aggregate { table: String, expr: String },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let mut cfg = match &cli.config {
        Some(path) => ShardliteConfig::load_from_file(path)?,
        None => ShardliteConfig::default(),
    };
    if let Some(dir) = cli.db_dir {
        cfg.db_dir = dir;
    }
    if let Some(n) = cli.shards {
        cfg.num_shards = n;
    }

    tracing::debug!(?cfg, "configuration resolved");
    let manager = ShardManager::open(cfg)?;
    match cli.cmd {
        Command::Init => {
            print_json(&json!({
                "db_dir": manager.config().db_dir,
                "shards": manager.shard_info(),
            }))?;
        }
        Command::Schema { ddl } => {
            let ddl = match ddl.strip_prefix('@') {
                Some(path) => std::fs::read_to_string(path)?,
                None => ddl,
            };
            manager.apply_schema(&ddl)?;
            print_json(&json!({ "applied": manager.config().num_shards }))?;
        }
        Command::Route { keys } => {
            let routes = keys
                .iter()
                .map(|&key| -> Result<serde_json::Value> {
                    Ok(json!({ "key": key, "shard": manager.shard_for(key)? }))
                })
                .collect::<Result<Vec<_>>>()?;
            print_json(&serde_json::Value::Array(routes))?;
        }
        Command::Stats => {
            print_json(&json!({
                "shards": manager.shard_stats(),
                "pools": manager.pool_stats(),
            }))?;
        }
        Command::Validate => {
            let valid = manager.validate_shard_files();
            print_json(&json!({ "valid": valid }))?;
            if !valid {
                return Err(ShardError::Config("one or more shard files are invalid".into()));
            }
        }
        Command::Insert { table, key, row } => {
            let row = parse_row(&row)?;
            let inserted = manager.insert(&table, &row, key)?;
            print_json(&json!({ "shard": manager.shard_for(key)?, "inserted": inserted }))?;
        }
        Command::Select { table, key, filter } => {
            let filter = match filter {
                Some(text) => parse_row(&text)?,
                None => Row::new(),
            };
            let rows = manager.select(&table, &filter, key)?;
            print_json(&serde_json::Value::Array(
                rows.iter().map(row_to_json).collect(),
            ))?;
        }
        Command::Aggregate { table, expr } => {
            let value = manager.aggregate(&table, &expr)?;
            print_json(&json!({ "expr": expr, "value": value_to_json(&value) }))?;
        }
    }
    manager.shutdown();
    Ok(())
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Parse a flat JSON object into SQL values.
fn parse_row(text: &str) -> Result<Row> {
    let object = match serde_json::from_str::<serde_json::Value>(text)? {
        serde_json::Value::Object(map) => map,
        _ => return Err(ShardError::Config("row must be a JSON object".into())),
    };
    object
        .into_iter()
        .map(|(column, value)| {
            let value = match value {
                serde_json::Value::Null => Value::Null,
                serde_json::Value::Bool(b) => Value::Integer(i64::from(b)),
                serde_json::Value::Number(n) => match n.as_i64() {
                    Some(i) => Value::Integer(i),
                    None => Value::Real(n.as_f64().unwrap_or(f64::NAN)),
                },
                serde_json::Value::String(s) => Value::Text(s),
                other => {
                    return Err(ShardError::Config(format!(
                        "column {column} has unsupported value {other}"
                    )))
                }
            };
            Ok((column, value))
        })
        .collect()
}
