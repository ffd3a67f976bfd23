use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::Game;
use crate::error::ApiError;
use crate::jobs::JobContext;
use crate::launcher::LaunchCommand;
use crate::progress::JobProgress;
use crate::proton::Proton;

const MARKER_FILE: &str = ".epic-session.json";
const STAGING_DIR: &str = ".staging";
const TRASH_DIR: &str = ".trash";

/// The store that owns game content: downloads it, tracks installs and knows
/// how to start a game.
#[async_trait]
pub trait GameStore: Send + Sync {
    /// Downloads `app_id` somewhere below `staging` and returns the game directory.
    async fn download(
        &self,
        app_id: &str,
        staging: &Path,
        ctx: &JobContext,
    ) -> Result<PathBuf, ApiError>;

    /// Tells the store the game now lives at `install_dir`.
    async fn register(&self, app_id: &str, install_dir: &Path) -> Result<(), ApiError>;

    /// Makes the store forget the game. Files are handled by the caller.
    async fn unregister(&self, app_id: &str) -> Result<(), ApiError>;

    fn launch_command(
        &self,
        game: &InstalledGame,
        proton: &Proton,
        compat_data: &Path,
    ) -> Result<LaunchCommand, ApiError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstalledGame {
    pub app_id: String,
    pub title: String,
    #[serde(skip_deserializing)]
    pub path: PathBuf,
    pub installed_at: DateTime<Utc>,
}

/// App ids double as directory names, so they must be a single plain path component.
pub fn validate_app_id(app_id: &str) -> Result<(), ApiError> {
    if app_id.trim().is_empty() {
        return Err(ApiError::validation("app id is empty"));
    }
    if app_id.starts_with('.')
        || app_id
            .chars()
            .any(|c| c.is_whitespace() || c == '/' || c == '\\' || c.is_control())
    {
        return Err(ApiError::validation(format!("malformed app id `{app_id}`")));
    }
    Ok(())
}

fn remove_dir_if_empty(path: &Path) {
    let _ = std::fs::remove_dir(path);
}

/// Installed games on disk: one directory per app id, each holding a marker
/// written before the directory is moved into place.
pub struct GameLibrary {
    root: PathBuf,
    store: Arc<dyn GameStore>,
}

impl GameLibrary {
    pub fn new(root: PathBuf, store: Arc<dyn GameStore>) -> Self {
        Self { root, store }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn game_dir(&self, app_id: &str) -> PathBuf {
        self.root.join(app_id)
    }

    pub fn store(&self) -> &Arc<dyn GameStore> {
        &self.store
    }

    fn read_marker(dir: &Path) -> Option<InstalledGame> {
        let text = std::fs::read_to_string(dir.join(MARKER_FILE)).ok()?;
        let mut game: InstalledGame = serde_json::from_str(&text).ok()?;
        game.path = dir.to_path_buf();
        Some(game)
    }

    /// Completed installs, sorted by app id. Staging and trash never show up.
    pub fn list_installed(&self) -> Vec<InstalledGame> {
        let Ok(rd) = std::fs::read_dir(&self.root) else {
            return vec![];
        };
        let mut out: Vec<InstalledGame> = vec![];
        for e in rd.flatten() {
            let Ok(ty) = e.file_type() else { continue };
            if !ty.is_dir() {
                continue;
            }
            let path = e.path();
            let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            if let Some(game) = Self::read_marker(&path).filter(|g| g.app_id == name) {
                out.push(game);
            }
        }
        out.sort_by(|a, b| a.app_id.cmp(&b.app_id));
        out
    }

    pub fn installed(&self, app_id: &str) -> Option<InstalledGame> {
        Self::read_marker(&self.game_dir(app_id)).filter(|g| g.app_id == app_id)
    }

    /// Download, stamp, then move into place in one rename.
    ///
    /// Anything that fails before the rename only leaves a staging dir behind,
    /// which is removed. A failed store registration after the rename moves
    /// the files back out.
    pub async fn install(&self, game: &Game, ctx: &JobContext) -> Result<(), ApiError> {
        const STEPS_TOTAL: u32 = 3;
        let app_id = game.app_id.as_str();
        let final_dir = self.game_dir(app_id);
        if final_dir.exists() {
            return Err(ApiError::install(format!(
                "{} already exists",
                final_dir.to_string_lossy()
            )));
        }

        let staging_root = self.root.join(STAGING_DIR);
        let staging = staging_root.join(format!("{app_id}-{}", ctx.id()));
        if staging.exists() {
            let _ = std::fs::remove_dir_all(&staging);
        }
        std::fs::create_dir_all(&staging)
            .map_err(|e| ApiError::install(format!("failed to create staging dir: {e}")))?;

        let cleanup = |staging: &Path| {
            if let Err(e) = std::fs::remove_dir_all(staging) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("failed to remove {}: {e}", staging.to_string_lossy());
                }
            }
            remove_dir_if_empty(&staging_root);
        };

        ctx.report(
            JobProgress::step(1, STEPS_TOTAL, "Download")
                .with_detail(format!("Downloading {}...", game.title)),
        );
        log::info!("Downloading {app_id} into {}", staging.to_string_lossy());

        let prepared: Result<PathBuf, ApiError> = async {
            ctx.check_cancelled()?;
            let content = self.store.download(app_id, &staging, ctx).await?;
            if !content.starts_with(&staging) || !content.is_dir() {
                return Err(ApiError::install(format!(
                    "store returned unexpected install dir {}",
                    content.to_string_lossy()
                )));
            }
            ctx.check_cancelled()?;

            ctx.report(JobProgress::step(2, STEPS_TOTAL, "Finalize").with_detail("Writing install record..."));
            let marker = InstalledGame {
                app_id: app_id.to_string(),
                title: game.title.clone(),
                path: PathBuf::new(),
                installed_at: Utc::now(),
            };
            let json = serde_json::to_string_pretty(&marker)
                .map_err(|e| ApiError::install(e.to_string()))?;
            std::fs::write(content.join(MARKER_FILE), json)
                .map_err(|e| ApiError::install(format!("failed to write install record: {e}")))?;
            Ok(content)
        }
        .await;

        let content = match prepared {
            Ok(c) => c,
            Err(e) => {
                cleanup(&staging);
                return Err(e);
            }
        };

        std::fs::create_dir_all(&self.root).map_err(|e| ApiError::install(e.to_string()))?;
        if let Err(e) = std::fs::rename(&content, &final_dir) {
            cleanup(&staging);
            return Err(ApiError::install(format!("failed to move game into place: {e}")));
        }

        let rollback = |reason: ApiError| {
            log::warn!("rolling back install of {app_id}: {reason}");
            if let Err(e) = std::fs::rename(&final_dir, &content) {
                log::error!("rollback rename failed, removing {}: {e}", final_dir.to_string_lossy());
                let _ = std::fs::remove_dir_all(&final_dir);
            }
            cleanup(&staging);
            reason
        };

        if ctx.is_cancelled() {
            return Err(rollback(ApiError::install("cancelled")));
        }

        ctx.report(JobProgress::step(3, STEPS_TOTAL, "Register").with_detail("Registering install..."));
        if let Err(e) = self.store.register(app_id, &final_dir).await {
            return Err(rollback(ApiError::install(format!(
                "failed to register install: {}",
                e.reason()
            ))));
        }

        cleanup(&staging);
        ctx.report(JobProgress::step(3, STEPS_TOTAL, "Register").with_progress(1.0));
        log::info!("{app_id} installed at {}", final_dir.to_string_lossy());
        Ok(())
    }

    /// Moves the game out of sight first, then asks the store to forget it.
    pub async fn uninstall(&self, app_id: &str, ctx: &JobContext) -> Result<(), ApiError> {
        const STEPS_TOTAL: u32 = 2;
        let final_dir = self.game_dir(app_id);
        if self.installed(app_id).is_none() {
            return Err(ApiError::install(format!("{app_id} is not installed")));
        }
        ctx.check_cancelled()?;

        ctx.report(JobProgress::step(1, STEPS_TOTAL, "Unregister").with_detail(format!("Removing {app_id}...")));
        let trash_root = self.root.join(TRASH_DIR);
        std::fs::create_dir_all(&trash_root).map_err(|e| ApiError::install(e.to_string()))?;
        let trash = trash_root.join(format!("{app_id}-{}", ctx.id()));
        std::fs::rename(&final_dir, &trash)
            .map_err(|e| ApiError::install(format!("failed to move game out of place: {e}")))?;

        if let Err(e) = self.store.unregister(app_id).await {
            let restore = std::fs::rename(&trash, &final_dir);
            remove_dir_if_empty(&trash_root);
            if let Err(re) = restore {
                log::error!("failed to restore {app_id} after unregister error: {re}");
            }
            return Err(ApiError::install(format!(
                "failed to unregister: {}",
                e.reason()
            )));
        }

        ctx.report(JobProgress::step(2, STEPS_TOTAL, "Delete files"));
        let trash_clone = trash.clone();
        let removed = tokio::task::spawn_blocking(move || std::fs::remove_dir_all(&trash_clone))
            .await
            .map_err(|e| ApiError::install(e.to_string()))?;
        if let Err(e) = removed {
            // The game is already gone from every listing; only disk space is lost.
            log::warn!("failed to delete {}: {e}", trash.to_string_lossy());
        }
        remove_dir_if_empty(&trash_root);
        log::info!("{app_id} uninstalled");
        Ok(())
    }
}
