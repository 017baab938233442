//! Schema Forms CLI
//!
//! Validates a values document against a form schema and prints the
//! result as JSON:
//!
//! ```text
//! schema-forms <schema.json> <values.json> [entity-id]
//! ```

use anyhow::{bail, Context, Result};
use schema_forms::{EngineConfig, FormSession, MemoryStore, Schema, Stores};
use serde_json::{json, Map, Value};
use std::io;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "schema_forms=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (schema_path, values_path, entity_id) = match args.as_slice() {
        [schema, values] => (schema, values, None),
        [schema, values, entity] => (schema, values, Some(entity.clone())),
        _ => bail!("usage: schema-forms <schema.json> <values.json> [entity-id]"),
    };

    let schema_json = std::fs::read_to_string(schema_path)
        .with_context(|| format!("reading {schema_path}"))?;
    let schema = Schema::from_json(&schema_json)?;

    let values_json = std::fs::read_to_string(values_path)
        .with_context(|| format!("reading {values_path}"))?;
    let values: Map<String, Value> =
        serde_json::from_str(&values_json).context("values must be a JSON object")?;

    let config = EngineConfig::load().unwrap_or_else(|e| {
        tracing::warn!("Ignoring unreadable config: {e}");
        EngineConfig::default()
    });

    let store = Arc::new(MemoryStore::new().with_schema(schema.clone()));
    let mut session = FormSession::new(
        schema,
        values,
        entity_id,
        Stores::from_shared(store),
        config,
    );

    let is_valid = session.validate_all().await;
    let report = json!({
        "isValid": is_valid,
        "errors": session.state().errors,
        "firstError": session.first_error(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !is_valid {
        std::process::exit(1);
    }
    Ok(())
}
