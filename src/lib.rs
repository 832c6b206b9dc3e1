//! HTTP front end for `yt-dlp`: takes a media URL plus a few options and
//! relays back the downloaded, remuxed or transcoded file.

pub mod config;
pub mod delivery;
pub mod downloader;
pub mod error;
pub mod extractor;
pub mod jobs;
pub mod options;
pub mod retry;
pub mod routes;
pub mod transcode;

use tokio::net::TcpListener;
use tracing::{info, warn};

pub use config::Config;
pub use error::ApiError;
pub use routes::{AppState, build_router};

/// Temp folders left behind by a previous run are removed once they are this old.
const STALE_TEMP_ENTRY_AGE: std::time::Duration = std::time::Duration::from_secs(2 * 60 * 60);

pub async fn run(config: Config) -> Result<(), ApiError> {
    tokio::fs::create_dir_all(&config.work_dir)
        .await
        .map_err(|error| {
            ApiError::internal(format!(
                "Could not create work folder {:?}: {error}",
                config.work_dir
            ))
        })?;
    delivery::cleanup_stale_entries(&config.work_dir, STALE_TEMP_ENTRY_AGE).await;

    if config.allowed_origins.is_none() {
        warn!("ALLOWED_ORIGINS is not set. Any origin may call the API.");
    }
    if !config.static_dir.join("index.html").exists() {
        warn!("no index.html under {:?}; / will return 404", config.static_dir);
    }

    let state = AppState::from_config(&config);
    state.jobs.spawn_sweeper();

    let app = build_router(state, &config);
    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .map_err(|error| {
            ApiError::internal(format!("Could not bind {}: {error}", config.bind_addr))
        })?;

    info!(
        "listening on http://{} (yt-dlp: {:?}, work dir: {:?})",
        config.bind_addr, config.yt_dlp_bin, config.work_dir
    );

    axum::serve(listener, app)
        .await
        .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}
