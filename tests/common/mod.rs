#![allow(dead_code)]

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use flate2::{write::GzEncoder, Compression};

use epic_session::legendary::proton_env;
use epic_session::{
    ApiError, ApiService, Backends, CatalogSource, Config, Credentials, Game, GameStore, Identity,
    IdentityProvider, InstalledGame, Job, JobContext, JobState, LaunchCommand, Proton,
    ProtonSource,
};

pub struct FakeIdentity {
    pub down: AtomicBool,
}

#[async_trait]
impl IdentityProvider for FakeIdentity {
    async fn authenticate(&self, credentials: &Credentials) -> Result<Identity, ApiError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(ApiError::unavailable("connection refused"));
        }
        match credentials.auth_code.as_deref() {
            Some("bad") => Err(ApiError::auth("invalid authorization code")),
            _ => Ok(Identity {
                user: "tester".to_string(),
            }),
        }
    }
}

pub struct FakeCatalog {
    pub down: AtomicBool,
}

#[async_trait]
impl CatalogSource for FakeCatalog {
    async fn fetch_games(&self) -> Result<Vec<Game>, ApiError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(ApiError::unavailable("catalog offline"));
        }
        Ok(vec![
            Game {
                app_id: "Sugar".to_string(),
                title: "Rocket League".to_string(),
            },
            Game {
                app_id: "Fortnite".to_string(),
                title: "Fortnite".to_string(),
            },
        ])
    }
}

/// Writes a small game folder into staging and keeps a set of registered ids.
pub struct FakeStore {
    pub download_delay: Mutex<Duration>,
    pub fail_download: AtomicBool,
    pub fail_register: AtomicBool,
    pub fail_unregister: AtomicBool,
    pub registered: Mutex<HashSet<String>>,
    pub launch_script: Mutex<String>,
}

impl FakeStore {
    pub fn registered(&self) -> HashSet<String> {
        self.registered.lock().expect("registered lock").clone()
    }

    pub fn set_delay(&self, d: Duration) {
        *self.download_delay.lock().expect("delay lock") = d;
    }
}

#[async_trait]
impl GameStore for FakeStore {
    async fn download(
        &self,
        app_id: &str,
        staging: &Path,
        ctx: &JobContext,
    ) -> Result<PathBuf, ApiError> {
        let dir = staging.join(format!("{app_id}-files"));
        std::fs::create_dir_all(dir.join("bin"))?;
        std::fs::write(dir.join("bin").join("game.exe"), b"MZ")?;

        let delay = *self.download_delay.lock().expect("delay lock");
        let mut waited = Duration::ZERO;
        while waited < delay {
            ctx.check_cancelled()?;
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += Duration::from_millis(10);
        }

        if self.fail_download.load(Ordering::SeqCst) {
            return Err(ApiError::install("disk full"));
        }
        Ok(dir)
    }

    async fn register(&self, app_id: &str, install_dir: &Path) -> Result<(), ApiError> {
        if self.fail_register.load(Ordering::SeqCst) {
            return Err(ApiError::install("store refused the import"));
        }
        assert!(install_dir.join("bin").join("game.exe").is_file());
        self.registered
            .lock()
            .expect("registered lock")
            .insert(app_id.to_string());
        Ok(())
    }

    async fn unregister(&self, app_id: &str) -> Result<(), ApiError> {
        if self.fail_unregister.load(Ordering::SeqCst) {
            return Err(ApiError::install("store is busy"));
        }
        self.registered
            .lock()
            .expect("registered lock")
            .remove(app_id);
        Ok(())
    }

    fn launch_command(
        &self,
        game: &InstalledGame,
        proton: &Proton,
        compat_data: &Path,
    ) -> Result<LaunchCommand, ApiError> {
        let script = self.launch_script.lock().expect("script lock").clone();
        Ok(LaunchCommand {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script],
            env: proton_env(proton, compat_data),
            cwd: Some(game.path.clone()),
        })
    }
}

/// Serves a generated Proton-GE style tarball.
pub struct FakeProtonSource {
    pub fetches: AtomicUsize,
    pub delay: Mutex<Duration>,
}

impl FakeProtonSource {
    pub fn set_delay(&self, d: Duration) {
        *self.delay.lock().expect("delay lock") = d;
    }
}

pub fn proton_tarball(version: &str) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    let files: [(String, Vec<u8>); 2] = [
        (format!("{version}/proton"), b"#!/bin/sh\nexec \"$@\"\n".to_vec()),
        (
            format!("{version}/version"),
            format!("1700000000 {version}\n").into_bytes(),
        ),
    ];
    for (path, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder
            .append_data(&mut header, path, data.as_slice())
            .expect("append tar entry");
    }
    builder
        .into_inner()
        .expect("finish tar")
        .finish()
        .expect("finish gzip")
}

#[async_trait]
impl ProtonSource for FakeProtonSource {
    async fn fetch(&self, version: &str, dest: &Path, ctx: &JobContext) -> Result<(), ApiError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if version == "GE-Missing" {
            return Err(ApiError::install(format!("no release named {version}")));
        }
        let delay = *self.delay.lock().expect("delay lock");
        let mut waited = Duration::ZERO;
        while waited < delay {
            ctx.check_cancelled()?;
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += Duration::from_millis(10);
        }
        if version == "GE-Garbage" {
            std::fs::write(dest, b"<html>not found</html>")?;
        } else {
            std::fs::write(dest, proton_tarball(version))?;
        }
        Ok(())
    }
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub cfg: Config,
    pub identity: Arc<FakeIdentity>,
    pub catalog: Arc<FakeCatalog>,
    pub store: Arc<FakeStore>,
    pub protons: Arc<FakeProtonSource>,
    pub svc: ApiService,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let cfg = Config {
            data_dir: dir.path().join("data"),
            games_dir: Some(dir.path().join("games")),
            proton_dir: Some(dir.path().join("compatibilitytools.d")),
            ..Config::default()
        };
        let identity = Arc::new(FakeIdentity {
            down: AtomicBool::new(false),
        });
        let catalog = Arc::new(FakeCatalog {
            down: AtomicBool::new(false),
        });
        let store = Arc::new(FakeStore {
            download_delay: Mutex::new(Duration::ZERO),
            fail_download: AtomicBool::new(false),
            fail_register: AtomicBool::new(false),
            fail_unregister: AtomicBool::new(false),
            registered: Mutex::new(HashSet::new()),
            launch_script: Mutex::new("sleep 0.3".to_string()),
        });
        let protons = Arc::new(FakeProtonSource {
            fetches: AtomicUsize::new(0),
            delay: Mutex::new(Duration::ZERO),
        });
        let svc = ApiService::new(
            &cfg,
            Backends {
                identity: identity.clone(),
                catalog: catalog.clone(),
                store: store.clone(),
                proton_source: protons.clone(),
            },
        );
        Self {
            dir,
            cfg,
            identity,
            catalog,
            store,
            protons,
            svc,
        }
    }

    pub async fn login(&self) -> String {
        self.svc
            .login(Credentials::default())
            .await
            .expect("login")
            .token
    }

    pub fn games_dir(&self) -> PathBuf {
        self.cfg.games_dir()
    }

    pub fn proton_dir(&self) -> PathBuf {
        self.cfg.proton_dir()
    }

    pub async fn install_proton(&self, token: &str, version: &str) -> Proton {
        let job = self.svc.install_proton(token, version).expect("submit proton install");
        let done = self.svc.wait_job(token, &job.id).await.expect("wait proton job");
        assert_eq!(done.state, JobState::Succeeded);
        self.svc
            .list_protons(token)
            .expect("list protons")
            .into_iter()
            .find(|p| p.name == version)
            .expect("proton listed")
    }

    pub async fn install_game(&self, token: &str, app_id: &str) -> Job {
        let job = self.svc.install_game(token, app_id).await.expect("submit install");
        self.svc.wait_job(token, &job.id).await.expect("wait install job")
    }
}

/// Every path below `root`, relative and sorted. A missing root reads as empty.
pub fn tree(root: &Path) -> Vec<PathBuf> {
    let mut out = vec![];
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(rd) = std::fs::read_dir(&dir) else {
            continue;
        };
        for e in rd.flatten() {
            let path = e.path();
            if path.is_dir() {
                stack.push(path.clone());
            }
            if let Ok(rel) = path.strip_prefix(root) {
                out.push(rel.to_path_buf());
            }
        }
    }
    out.sort();
    out
}
