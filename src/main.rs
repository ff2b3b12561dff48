//! # Keel demo service
//!
//! A small notes API wired with every part of the framework: configuration
//! loading, telemetry, validated extractors, health checks and lifecycle
//! hooks.
//!
//! ```bash
//! # Start with defaults
//! keel-demo
//!
//! # Start with a config file; SIGHUP re-reads it
//! keel-demo --config service.yaml
//!
//! # Validate a config file and exit
//! keel-demo --config service.yaml --check
//!
//! # Environment overrides
//! KEEL_PORT=9000 KEEL_LOG_FORMAT=compact keel-demo
//! ```

use anyhow::Context;
use axum::{http::StatusCode, Extension, Json};
use clap::Parser;
use keel_config::{load_config, ServiceConfig};
use keel_server::{
    check_fn, ApiError, App, HookContext, RequestContext, ValidatedJson, ValidatedPath,
    ValidatedQuery,
};
use keel_telemetry::init_telemetry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info};
use validator::Validate;

/// Keel demo service
#[derive(Parser, Debug)]
#[command(name = "keel-demo")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (YAML or TOML)
    #[arg(short, long, env = "KEEL_CONFIG")]
    config: Option<PathBuf>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[derive(Debug, Clone, Serialize)]
struct Note {
    id: u64,
    title: String,
    body: String,
}

#[derive(Debug, Deserialize, Validate)]
struct CreateNote {
    #[validate(length(min = 1, max = 120))]
    title: String,
    #[validate(length(max = 10_000))]
    #[serde(default)]
    body: String,
}

#[derive(Debug, Deserialize, Validate)]
struct NotePath {
    #[validate(range(min = 1))]
    id: u64,
}

#[derive(Debug, Deserialize, Validate)]
struct ListQuery {
    #[validate(range(min = 1, max = 100))]
    #[serde(default = "default_limit")]
    limit: usize,
}

const fn default_limit() -> usize {
    20
}

#[derive(Debug, Default)]
struct NoteStore {
    next_id: AtomicU64,
    notes: RwLock<BTreeMap<u64, Note>>,
}

type Store = Arc<NoteStore>;

async fn create_note(
    Extension(store): Extension<Store>,
    ctx: RequestContext,
    ValidatedJson(input): ValidatedJson<CreateNote>,
) -> (StatusCode, Json<Note>) {
    let id = store.next_id.fetch_add(1, Ordering::SeqCst) + 1;
    let note = Note {
        id,
        title: input.title,
        body: input.body,
    };
    store.notes.write().await.insert(id, note.clone());
    info!(note_id = id, request_id = %ctx.request_id, "Note created");
    (StatusCode::CREATED, Json(note))
}

async fn get_note(
    Extension(store): Extension<Store>,
    ValidatedPath(path): ValidatedPath<NotePath>,
) -> Result<Json<Note>, ApiError> {
    store
        .notes
        .read()
        .await
        .get(&path.id)
        .cloned()
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("Note {} not found", path.id)))
}

async fn list_notes(
    Extension(store): Extension<Store>,
    ValidatedQuery(query): ValidatedQuery<ListQuery>,
) -> Json<Vec<Note>> {
    let notes = store.notes.read().await;
    Json(notes.values().take(query.limit).cloned().collect())
}

/// Application entry point
#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        error!(error = %e, "Application failed");
        eprintln!("keel-demo: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref()).context("loading configuration")?;

    if cli.check {
        println!("Configuration for '{}' is valid", config.service.name);
        return Ok(());
    }

    let telemetry = init_telemetry(&config).context("initializing telemetry")?;
    info!(
        service = %config.service.name,
        version = %config.service.version,
        environment = %config.service.environment,
        tracing = telemetry.tracing_active(),
        "Starting"
    );

    build_app(config, cli.config, Arc::default())
        .telemetry(telemetry)
        .build()?
        .run()
        .await?;
    Ok(())
}

fn build_app(
    config: ServiceConfig,
    source: Option<PathBuf>,
    store: Store,
) -> keel_server::AppBuilder {
    let mut builder = App::builder(config)
        .post("/notes", create_note)
        .get("/notes", list_notes)
        .get("/notes/:id", get_note)
        .extension(Arc::clone(&store))
        .liveness_check(check_fn("runtime", || async { Ok(()) }))
        .readiness_check({
            let store = Arc::clone(&store);
            check_fn("note_store", move || {
                let store = Arc::clone(&store);
                async move {
                    store
                        .notes
                        .try_read()
                        .map(|_| ())
                        .map_err(|_| "note store is locked".to_string())
                }
            })
        })
        .on_start(|ctx: HookContext| async move {
            info!(service = %ctx.config.service.name, "Warming up");
            Ok::<_, std::io::Error>(())
        })
        .on_ready(|ctx: HookContext| async move {
            info!(host = %ctx.config.server.host, port = ctx.config.server.port, "Ready");
            Ok::<_, std::io::Error>(())
        })
        .on_shutdown({
            let store = Arc::clone(&store);
            move |_| {
                let store = Arc::clone(&store);
                async move {
                    let count = store.notes.read().await.len();
                    info!(notes = count, "Discarding in-memory notes");
                    Ok::<_, std::io::Error>(())
                }
            }
        })
        .on_reload(|ctx: HookContext| async move {
            info!(log_level = %ctx.config.observability.logging.level, "Configuration reloaded");
            Ok::<_, std::io::Error>(())
        })
        .on_stop(|_| async { Ok::<_, std::io::Error>(()) });

    if let Some(path) = source {
        builder = builder.config_source(path);
    }
    builder
}
