//! Clinical evidence ingestion service.
//!
//! Single Rust binary exposing the HTTP surface (C10) over the ingestion
//! pipeline (C7): images/PDFs of lab reports, prescriptions, radiology
//! reports, and vitals sheets in, validated FHIR R4 bundles out.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, Semaphore};
use tracing::{error, info, warn};

use clinical_ingest::config::{Cli, Config};
use clinical_ingest::http::{build_router, AppState};
use clinical_ingest::llm::client::OpenAiCompatClient;
use clinical_ingest::llm::LlmClient;
use clinical_ingest::logging;
use clinical_ingest::store::db::Db;
use clinical_ingest::store::files;

/// How often the orphaned-upload janitor sweeps `uploads_dir` (§4.8).
const JANITOR_INTERVAL: Duration = Duration::from_secs(900);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli).context("failed to load configuration")?;

    let _logging_guard = match &config.log_dir {
        Some(dir) => Some(logging::init_production(dir).context("failed to initialize logging")?),
        None => {
            logging::init_console();
            None
        }
    };

    info!("clinical ingestion service starting");

    let db = Db::open(&config.db_path).await.context("failed to open database")?;
    let llm: Arc<dyn LlmClient> = Arc::new(OpenAiCompatClient::new(
        config.llm_endpoint.clone(),
        config.llm_model.clone(),
        config.llm_api_key.clone(),
        config.llm_timeout_ms,
    ));
    let llm_semaphore = Arc::new(Semaphore::new(config.llm_concurrency));

    let uploads_dir = config.uploads_dir.clone();
    let bind_addr = config.bind_addr.clone();

    let state = Arc::new(AppState {
        db,
        llm,
        config,
        llm_semaphore,
        rerun_locks: Mutex::new(HashSet::new()),
    });

    spawn_janitor(Arc::clone(&state), uploads_dir);

    let router = build_router(Arc::clone(&state));

    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    info!(addr = %bind_addr, "listening");

    axum::serve(listener, router.into_make_service())
        .await
        .context("server error")?;

    Ok(())
}

/// Periodically reap orphaned upload directories with no matching
/// submission row (§4.8 janitor sweep).
fn spawn_janitor(state: Arc<AppState>, uploads_dir: std::path::PathBuf) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(JANITOR_INTERVAL);
        loop {
            interval.tick().await;

            let known_ids = match state.db.list_recent(i64::MAX).await {
                Ok(rows) => rows.into_iter().map(|r| r.id).collect::<HashSet<_>>(),
                Err(e) => {
                    warn!(error = %e, "janitor: failed to list known submissions, skipping sweep");
                    continue;
                }
            };

            match files::janitor_sweep(&uploads_dir, &known_ids) {
                Ok(removed) if !removed.is_empty() => {
                    info!(count = removed.len(), "janitor: reaped orphaned upload directories");
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "janitor sweep failed"),
            }
        }
    });
}
