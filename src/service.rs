use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast;

use crate::catalog::{CatalogService, CatalogSource, Game};
use crate::config::Config;
use crate::error::ApiError;
use crate::games::{validate_app_id, GameLibrary, GameStore, InstalledGame};
use crate::jobs::{Job, JobEngine, JobKey, JobKind, SubmitPolicy};
use crate::launcher::{LaunchCoordinator, LaunchHandle};
use crate::legendary::Legendary;
use crate::proton::{validate_version, GithubReleases, Proton, ProtonRegistry, ProtonSource};
use crate::session::{Credentials, IdentityProvider, Session, SessionManager};
use crate::status::StatusReport;

/// The pluggable edges of the service.
pub struct Backends {
    pub identity: Arc<dyn IdentityProvider>,
    pub catalog: Arc<dyn CatalogSource>,
    pub store: Arc<dyn GameStore>,
    pub proton_source: Arc<dyn ProtonSource>,
}

impl Backends {
    /// `legendary` for everything store related, GitHub for Proton-GE.
    pub fn production(cfg: &Config) -> Self {
        let legendary = Arc::new(Legendary::new(cfg.legendary_path()));
        Self {
            identity: legendary.clone(),
            catalog: legendary.clone(),
            store: legendary,
            proton_source: Arc::new(GithubReleases::new(cfg.proton_release_url.clone())),
        }
    }
}

/// Every operation the front-end can call. All but `login` need a session token.
pub struct ApiService {
    sessions: SessionManager,
    catalog: CatalogService,
    games: Arc<GameLibrary>,
    protons: Arc<ProtonRegistry>,
    jobs: JobEngine,
    launcher: LaunchCoordinator,
    compat_data_dir: PathBuf,
    /// Held while deciding between a launch and an uninstall, so the launcher
    /// and the job table are never read apart.
    gate: Mutex<()>,
}

impl ApiService {
    pub fn new(cfg: &Config, backends: Backends) -> Self {
        Self {
            sessions: SessionManager::new(backends.identity, cfg.session_ttl()),
            catalog: CatalogService::new(backends.catalog),
            games: Arc::new(GameLibrary::new(cfg.games_dir(), backends.store)),
            protons: Arc::new(ProtonRegistry::new(cfg.proton_dir(), backends.proton_source)),
            jobs: JobEngine::new(cfg.max_parallel_jobs),
            launcher: LaunchCoordinator::new(),
            compat_data_dir: cfg.compat_data_dir(),
            gate: Mutex::new(()),
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(cfg, Backends::production(cfg))
    }

    pub async fn login(&self, credentials: Credentials) -> Result<Session, ApiError> {
        self.sessions.login(credentials).await
    }

    /// Idempotent: logging out without a session succeeds.
    pub async fn logout(&self, token: &str) -> Result<(), ApiError> {
        if self.sessions.current_session().is_some() {
            self.sessions.validate(token)?;
        }
        self.sessions.logout().await;
        Ok(())
    }

    pub fn current_session(&self) -> Option<Session> {
        self.sessions.current_session()
    }

    pub async fn list_games(&self, token: &str) -> Result<Vec<Game>, ApiError> {
        self.sessions.validate(token)?;
        self.catalog.list_games().await
    }

    pub fn list_installed(&self, token: &str) -> Result<Vec<InstalledGame>, ApiError> {
        self.sessions.validate(token)?;
        Ok(self.games.list_installed())
    }

    pub async fn install_game(&self, token: &str, app_id: &str) -> Result<Job, ApiError> {
        self.sessions.validate(token)?;
        validate_app_id(app_id)?;
        let key = JobKey::Game(app_id.to_string());
        self.ensure_idle(&key)?;
        if self.games.installed(app_id).is_some() {
            return Err(ApiError::validation(format!("{app_id} is already installed")));
        }
        let game = self
            .catalog
            .find(app_id)
            .await?
            .ok_or_else(|| ApiError::validation(format!("unknown app id `{app_id}`")))?;

        let games = self.games.clone();
        self.jobs.submit(key, JobKind::InstallGame, SubmitPolicy::Reject, move |ctx| async move {
            games.install(&game, &ctx).await
        })
    }

    pub async fn uninstall_game(&self, token: &str, app_id: &str) -> Result<Job, ApiError> {
        self.sessions.validate(token)?;
        validate_app_id(app_id)?;
        let key = JobKey::Game(app_id.to_string());
        let _gate = self.gate();
        self.ensure_idle(&key)?;
        if self.launcher.is_running(app_id) {
            return Err(ApiError::conflict(format!("{app_id} is running")));
        }
        if self.games.installed(app_id).is_none() {
            return Err(ApiError::validation(format!("{app_id} is not installed")));
        }

        let games = self.games.clone();
        let launcher = self.launcher.clone();
        let app_id = app_id.to_string();
        self.jobs.submit(key, JobKind::UninstallGame, SubmitPolicy::Reject, move |ctx| async move {
            if launcher.is_running(&app_id) {
                return Err(ApiError::install(format!("{app_id} is running")));
            }
            games.uninstall(&app_id, &ctx).await
        })
    }

    pub fn list_protons(&self, token: &str) -> Result<Vec<Proton>, ApiError> {
        self.sessions.validate(token)?;
        Ok(self.protons.list())
    }

    /// Requests for a version already being installed join that job.
    pub fn install_proton(&self, token: &str, version: &str) -> Result<Job, ApiError> {
        self.sessions.validate(token)?;
        let version = validate_version(version)?;
        let protons = self.protons.clone();
        self.jobs.submit(
            JobKey::Proton(version.clone()),
            JobKind::InstallProton,
            SubmitPolicy::Coalesce,
            move |ctx| async move { protons.install(&version, &ctx).await },
        )
    }

    pub fn uninstall_proton(&self, token: &str, version: &str) -> Result<Job, ApiError> {
        self.sessions.validate(token)?;
        let version = validate_version(version)?;
        let proton = self
            .protons
            .find(&version)
            .ok_or_else(|| ApiError::validation(format!("{version} is not installed")))?;
        let _gate = self.gate();
        if self.launcher.uses_proton(&proton.path) {
            return Err(ApiError::conflict(format!("{version} is in use by a running game")));
        }
        let protons = self.protons.clone();
        let launcher = self.launcher.clone();
        self.jobs.submit(
            JobKey::Proton(version.clone()),
            JobKind::UninstallProton,
            SubmitPolicy::Reject,
            move |ctx| async move {
                if launcher.uses_proton(&proton.path) {
                    return Err(ApiError::install(format!(
                        "{version} is in use by a running game"
                    )));
                }
                protons.uninstall(&version, &ctx).await
            },
        )
    }

    pub fn launch_game(
        &self,
        token: &str,
        app_id: &str,
        proton_path: &Path,
    ) -> Result<LaunchHandle, ApiError> {
        self.sessions.validate(token)?;
        validate_app_id(app_id)?;
        let _gate = self.gate();
        let game = self
            .games
            .installed(app_id)
            .ok_or_else(|| ApiError::validation(format!("{app_id} is not installed")))?;
        let proton = self.protons.find_by_path(proton_path).ok_or_else(|| {
            ApiError::validation(format!(
                "{} is not an installed Proton",
                proton_path.to_string_lossy()
            ))
        })?;
        self.ensure_idle(&JobKey::Game(app_id.to_string()))?;
        self.ensure_idle(&JobKey::Proton(proton.name.clone()))?;

        let compat_data = self.compat_data_dir.join(app_id);
        std::fs::create_dir_all(&compat_data)
            .map_err(|e| ApiError::launch(format!("failed to create prefix dir: {e}")))?;
        let cmd = self
            .games
            .store()
            .launch_command(&game, &proton, &compat_data)?;
        self.launcher.launch(app_id, &proton.path, cmd)
    }

    pub async fn terminate_game(&self, token: &str, app_id: &str) -> Result<bool, ApiError> {
        self.sessions.validate(token)?;
        Ok(self.launcher.terminate(app_id).await)
    }

    pub fn active_launches(&self, token: &str) -> Result<Vec<LaunchHandle>, ApiError> {
        self.sessions.validate(token)?;
        Ok(self.launcher.active())
    }

    pub fn job(&self, token: &str, job_id: &str) -> Result<Job, ApiError> {
        self.sessions.validate(token)?;
        self.jobs
            .get(job_id)
            .ok_or_else(|| ApiError::NotFound(format!("job {job_id}")))
    }

    pub fn jobs(&self, token: &str) -> Result<Vec<Job>, ApiError> {
        self.sessions.validate(token)?;
        Ok(self.jobs.list())
    }

    pub async fn wait_job(&self, token: &str, job_id: &str) -> Result<Job, ApiError> {
        self.sessions.validate(token)?;
        self.jobs.wait(job_id).await
    }

    pub fn cancel_job(&self, token: &str, job_id: &str) -> Result<Job, ApiError> {
        self.sessions.validate(token)?;
        self.jobs.cancel(job_id)
    }

    pub fn subscribe_jobs(&self, token: &str) -> Result<broadcast::Receiver<Job>, ApiError> {
        self.sessions.validate(token)?;
        Ok(self.jobs.subscribe())
    }

    pub fn get_status(&self, token: &str) -> Result<StatusReport, ApiError> {
        let session = self.sessions.validate(token)?;
        Ok(StatusReport {
            user: session.user,
            session_expires_at: session.expires_at,
            installed_games: self.games.list_installed().len(),
            installed_protons: self.protons.list().len(),
            running_jobs: self.jobs.running(),
            active_launches: self.launcher.active(),
        })
    }

    fn gate(&self) -> MutexGuard<'_, ()> {
        self.gate
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn ensure_idle(&self, key: &JobKey) -> Result<(), ApiError> {
        match self.jobs.active_for(key) {
            Some(job) => Err(ApiError::conflict(format!(
                "a {} job for {key} is already active ({})",
                job.kind, job.id
            ))),
            None => Ok(()),
        }
    }
}
