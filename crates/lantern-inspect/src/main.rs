use anyhow::{Context, bail};
use serde_json::{Value, json};
use tracing::info;

use lantern_store::config::{BackendKind, StorageConfig};
use lantern_store::facade::LocalStorage;
use lantern_store::structured::Database;
use lantern_types::ChannelQuery;

const USAGE: &str = "usage:
  lantern-inspect stats
  lantern-inspect channels <filters-json> [sort-json] [offset] [limit]
  lantern-inspect messages <cid> [limit]
  lantern-inspect sweep";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lantern=debug".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = StorageConfig::from_env();
    info!(
        "Backend {:?} at {}",
        config.backend,
        config
            .path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| ":memory:".into())
    );

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        bail!("{USAGE}");
    };

    let output = match command.as_str() {
        "stats" => stats(&config)?,
        "channels" => {
            let filters = parse_json(args.get(1), "filters")?;
            let sort = parse_json(args.get(2), "sort")?;
            let offset = parse_number(args.get(3), 0)?;
            let limit = parse_number(args.get(4), 30)?;

            let storage = LocalStorage::new(config);
            let query = ChannelQuery::new(filters, sort);
            let channels = storage.query_channel_states(&query, offset, limit).await;
            json!({ "signature": query.signature(), "channels": channels })
        }
        "messages" => {
            let cid = args.get(1).context("messages needs a cid")?;
            let limit = parse_number(args.get(2), 50)?;

            let storage = LocalStorage::new(config);
            let messages = storage.query_messages(cid, limit, None).await;
            json!({ "cid": cid, "messages": messages })
        }
        "sweep" => {
            let storage = LocalStorage::new(config);
            json!({ "removed": storage.sweep_orphans().await })
        }
        other => bail!("unknown command `{other}`\n{USAGE}"),
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Row counts are only tracked by the structured backend.
fn stats(config: &StorageConfig) -> anyhow::Result<Value> {
    if config.backend != BackendKind::Structured {
        bail!("stats needs the structured backend");
    }
    let db = match &config.path {
        Some(path) => Database::open(path, config.encryption_key.as_deref())?,
        None => Database::open_in_memory()?,
    };
    Ok(serde_json::to_value(db.stats()?)?)
}

fn parse_json(arg: Option<&String>, what: &str) -> anyhow::Result<Value> {
    match arg {
        Some(raw) => serde_json::from_str(raw).with_context(|| format!("invalid {what} JSON")),
        None => Ok(Value::Null),
    }
}

fn parse_number(arg: Option<&String>, default: usize) -> anyhow::Result<usize> {
    match arg {
        Some(raw) => raw.parse().with_context(|| format!("invalid number `{raw}`")),
        None => Ok(default),
    }
}
