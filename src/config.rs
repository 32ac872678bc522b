//! Runtime configuration, loaded from the environment.
//!
//! `.env` is loaded first via `dotenvy` (if present), then every field is
//! read from `std::env`. Clap flags, when passed, take precedence over the
//! corresponding environment variable. Precedence: CLI flag > env var >
//! documented default.

use std::path::PathBuf;

use clap::Parser;

/// Resolved runtime configuration for the ingestion service.
#[derive(Debug, Clone)]
pub struct Config {
    /// Upstream OpenAI-compatible chat endpoint base URL.
    pub llm_endpoint: String,
    /// Bearer token for the upstream LLM endpoint.
    pub llm_api_key: String,
    /// Model identifier passed to the upstream endpoint.
    pub llm_model: String,
    /// Per-call deadline for the LLM client, in milliseconds.
    pub llm_timeout_ms: u64,
    /// Repair budget: maximum re-prompt attempts per ingest.
    pub max_attempts: u32,
    /// End-to-end deadline for a single ingest request, in milliseconds.
    pub request_deadline_ms: u64,
    /// Maximum concurrent in-flight LLM calls.
    pub llm_concurrency: usize,
    /// Enables semantic-firewall completeness checks.
    pub strict_extraction: bool,
    /// Requires the full CBC+Differential+Platelet panel when strict.
    pub require_expected_tests: bool,
    /// Requires a non-empty patient name and identifier.
    pub require_patient: bool,
    /// Retains an extracted report date when it parses as ISO-8601.
    pub allow_report_date: bool,
    /// Minimum observation rows required for a LAB submission.
    pub min_observations: u32,
    /// Optional admin override token, bypassing per-key DB lookup.
    pub master_api_key: Option<String>,
    /// HTTP bind address.
    pub bind_addr: String,
    /// SQLite database file path.
    pub db_path: PathBuf,
    /// Directory for persisted original uploads.
    pub uploads_dir: PathBuf,
    /// Optional log directory; console-only logging when unset.
    pub log_dir: Option<PathBuf>,
}

/// Command-line flags overriding the corresponding environment variable.
#[derive(Debug, Parser)]
#[command(name = "clinical-ingest", about = "Clinical evidence ingestion service")]
pub struct Cli {
    /// Override `BIND_ADDR`.
    #[arg(long)]
    pub bind: Option<String>,
    /// Override `DB_PATH`.
    #[arg(long)]
    pub db_path: Option<PathBuf>,
    /// Override `UPLOADS_DIR`.
    #[arg(long)]
    pub uploads_dir: Option<PathBuf>,
    /// Override `LOG_DIR`.
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from `.env` (if present), the process
    /// environment, and CLI overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a required variable (`LLM_ENDPOINT`,
    /// `LLM_API_KEY`, `LLM_MODEL`) is missing.
    pub fn load(cli: &Cli) -> anyhow::Result<Self> {
        // Missing .env is not an error -- env vars or defaults still apply.
        let _ = dotenvy::dotenv();

        let llm_endpoint = std::env::var("LLM_ENDPOINT")
            .map_err(|_| anyhow::anyhow!("LLM_ENDPOINT is required"))?;
        let llm_api_key = std::env::var("LLM_API_KEY")
            .map_err(|_| anyhow::anyhow!("LLM_API_KEY is required"))?;
        let llm_model =
            std::env::var("LLM_MODEL").map_err(|_| anyhow::anyhow!("LLM_MODEL is required"))?;

        Ok(Self {
            llm_endpoint,
            llm_api_key,
            llm_model,
            llm_timeout_ms: env_u64("LLM_TIMEOUT_MS", 90_000),
            max_attempts: env_u32("MAX_ATTEMPTS", 3),
            request_deadline_ms: env_u64("REQUEST_DEADLINE_MS", 120_000),
            llm_concurrency: env_usize("LLM_CONCURRENCY", 8),
            strict_extraction: env_bool("STRICT_EXTRACTION", false),
            require_expected_tests: env_bool("REQUIRE_EXPECTED_TESTS", false),
            require_patient: env_bool("REQUIRE_PATIENT", false),
            allow_report_date: env_bool("ALLOW_REPORT_DATE", false),
            min_observations: env_u32("MIN_OBSERVATIONS", 3),
            master_api_key: std::env::var("MASTER_API_KEY").ok(),
            bind_addr: cli
                .bind
                .clone()
                .unwrap_or_else(|| env_string("BIND_ADDR", "0.0.0.0:8080")),
            db_path: cli
                .db_path
                .clone()
                .unwrap_or_else(|| PathBuf::from(env_string("DB_PATH", "./data/ingestion.db"))),
            uploads_dir: cli.uploads_dir.clone().unwrap_or_else(|| {
                PathBuf::from(env_string("UPLOADS_DIR", "./data/uploaded_files"))
            }),
            log_dir: cli
                .log_dir
                .clone()
                .or_else(|| std::env::var("LOG_DIR").ok().map(PathBuf::from)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_u32_falls_back_to_default_on_missing_or_invalid() {
        assert_eq!(env_u32("CLINICAL_INGEST_TEST_UNSET_U32", 3), 3);
        std::env::set_var("CLINICAL_INGEST_TEST_U32", "not-a-number");
        assert_eq!(env_u32("CLINICAL_INGEST_TEST_U32", 7), 7);
        std::env::remove_var("CLINICAL_INGEST_TEST_U32");
    }

    #[test]
    fn env_bool_parses_true_false() {
        std::env::set_var("CLINICAL_INGEST_TEST_BOOL", "true");
        assert!(env_bool("CLINICAL_INGEST_TEST_BOOL", false));
        std::env::remove_var("CLINICAL_INGEST_TEST_BOOL");
    }
}
