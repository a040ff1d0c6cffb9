//! Helpers shared by integration tests.

#![allow(dead_code)]

pub mod socket_guard;

use devflow_core::api::{ApiClient, AsyncApiClient};
use devflow_core::subtask::RunContext;
use devflow_core::{Database, EngineConfig};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Installs a test subscriber honoring `RUST_LOG`; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Engine configuration without throttling or retry delays worth waiting for.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        api_retry: 0,
        api_requests_per_hour: 0,
        ..EngineConfig::default()
    }
}

/// File-backed database in a temporary directory.
///
/// # Errors
///
/// Returns error if temp directory or database creation fails.
pub async fn setup_test_db() -> Result<(Database, TempDir), Box<dyn std::error::Error>> {
    let temp_dir = TempDir::new()?;
    let db_path = temp_dir.path().join("devflow.db");
    let db = Database::new(&db_path).await?;
    Ok((db, temp_dir))
}

/// Run context for one subtask of the `github` plugin.
pub fn run_context(db: &Database, cancel: CancellationToken) -> RunContext {
    RunContext::new(db.clone(), test_config(), cancel)
        .with_plugin("github")
        .for_subtask("collectIssues", 1, 1)
}

/// Async client pointed at `endpoint`.
///
/// # Errors
///
/// Returns error if the client cannot be built.
pub fn async_client(
    endpoint: &str,
    concurrency: usize,
    cancel: CancellationToken,
) -> Result<AsyncApiClient, Box<dyn std::error::Error>> {
    let config = test_config();
    let client = ApiClient::new(endpoint, &config)?;
    Ok(AsyncApiClient::new(client, &config, concurrency, cancel)?)
}
