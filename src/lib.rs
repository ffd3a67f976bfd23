pub mod archive;
pub mod catalog;
pub mod config;
pub mod error;
pub mod games;
pub mod jobs;
pub mod launcher;
pub mod legendary;
pub mod logger;
pub mod progress;
pub mod proton;
pub mod rpc;
pub mod server;
pub mod service;
pub mod session;
pub mod status;

use std::sync::Arc;

use tokio::net::TcpListener;

pub use crate::catalog::{CatalogSource, Game};
pub use crate::config::Config;
pub use crate::error::ApiError;
pub use crate::games::{GameStore, InstalledGame};
pub use crate::jobs::{Job, JobContext, JobKey, JobKind, JobState};
pub use crate::launcher::{LaunchCommand, LaunchHandle};
pub use crate::proton::{Proton, ProtonSource};
pub use crate::service::{ApiService, Backends};
pub use crate::session::{Credentials, Identity, IdentityProvider, Session};
pub use crate::status::StatusReport;

/// Loads the config, starts logging and serves the API until Ctrl-C.
pub async fn run() -> Result<(), String> {
    let cfg = match Config::default_path() {
        Some(path) => Config::load(&path)?,
        None => Config::default(),
    };
    let level = cfg.log_level_filter()?;
    logger::init(&cfg.logs_dir(), level, cfg!(debug_assertions))?;

    log::info!(
        "epic-session {} starting (games: {}, protons: {})",
        env!("CARGO_PKG_VERSION"),
        cfg.games_dir().display(),
        cfg.proton_dir().display()
    );

    let svc = Arc::new(ApiService::from_config(&cfg));
    let listener = TcpListener::bind(&cfg.api_address)
        .await
        .map_err(|e| format!("failed to bind {}: {e}", cfg.api_address))?;

    server::serve(listener, svc, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    })
    .await
    .map_err(|e| e.to_string())
}
