//! Store integration backed by the `legendary` Epic Games CLI.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::archive;
use crate::catalog::{CatalogSource, Game};
use crate::error::ApiError;
use crate::games::{GameStore, InstalledGame};
use crate::jobs::JobContext;
use crate::launcher::LaunchCommand;
use crate::progress::{parse_percent, JobProgress};
use crate::proton::Proton;
use crate::session::{Credentials, Identity, IdentityProvider};

const NOT_LOGGED_IN: &str = "<not logged in>";

#[derive(Debug, Deserialize)]
struct StatusJson {
    account: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListedGame {
    app_name: String,
    app_title: String,
}

struct Output {
    success: bool,
    stdout: String,
    stderr: String,
}

impl Output {
    /// Last non-empty stderr line, which is where legendary puts its error.
    fn error_line(&self) -> String {
        self.stderr
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or("legendary exited with an error")
            .to_string()
    }
}

pub struct Legendary {
    bin: PathBuf,
}

impl Legendary {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self { bin: bin.into() }
    }

    async fn run(&self, args: &[&str]) -> Result<Output, ApiError> {
        log::debug!("legendary {}", args.join(" "));
        let out = Command::new(&self.bin)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                ApiError::unavailable(format!(
                    "failed to run {}: {e}",
                    self.bin.to_string_lossy()
                ))
            })?;
        Ok(Output {
            success: out.status.success(),
            stdout: String::from_utf8_lossy(&out.stdout).to_string(),
            stderr: String::from_utf8_lossy(&out.stderr).to_string(),
        })
    }

    /// `legendary -y install` into `base`, reporting its `Progress:` lines.
    async fn install_into(&self, app_id: &str, base: &Path, ctx: &JobContext) -> Result<(), ApiError> {
        let base_str = base.to_string_lossy().to_string();
        let args = [
            "-y",
            "install",
            app_id,
            "--base-path",
            base_str.as_str(),
            "--skip-sdl",
        ];
        log::info!("legendary {}", args.join(" "));

        let mut child = Command::new(&self.bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ApiError::unavailable(format!("failed to spawn legendary: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ApiError::install("failed to capture stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ApiError::install("failed to capture stderr"))?;

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        for reader in [
            Box::new(stdout) as Box<dyn tokio::io::AsyncRead + Send + Unpin>,
            Box::new(stderr),
        ] {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut r = BufReader::new(reader).lines();
                while let Ok(Some(line)) = r.next_line().await {
                    let _ = tx.send(line);
                }
            });
        }
        drop(tx);

        let mut last_error: Option<String> = None;
        let mut ticks = tokio::time::interval(Duration::from_millis(500));
        let mut output_done = false;

        let status = loop {
            tokio::select! {
                s = child.wait() => {
                    break s.map_err(|e| ApiError::install(e.to_string()))?;
                }
                _ = ticks.tick() => {
                    if ctx.is_cancelled() {
                        let _ = child.kill().await;
                        return Err(ApiError::install("cancelled"));
                    }
                }
                msg = rx.recv(), if !output_done => {
                    let Some(line) = msg else {
                        output_done = true;
                        continue;
                    };
                    log::info!("legendary: {line}");
                    if let Some(p) = parse_percent(&line) {
                        ctx.report(
                            JobProgress::step(1, 3, "Download")
                                .with_progress(p)
                                .with_detail(line.trim().to_string()),
                        );
                    }
                    if line.contains("ERROR") || line.contains("CRITICAL") {
                        last_error = Some(line);
                    }
                }
            }
        };

        if !status.success() {
            return Err(ApiError::install(last_error.unwrap_or_else(|| {
                format!("legendary install exited with {status}")
            })));
        }
        Ok(())
    }
}

#[async_trait]
impl IdentityProvider for Legendary {
    async fn authenticate(&self, credentials: &Credentials) -> Result<Identity, ApiError> {
        if let Some(code) = credentials.auth_code.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
            let out = self.run(&["auth", "--code", code]).await?;
            if !out.success {
                return Err(ApiError::auth(out.error_line()));
            }
        }

        let out = self.run(&["status", "--json"]).await?;
        if !out.success {
            return Err(ApiError::auth(out.error_line()));
        }
        let status: StatusJson = serde_json::from_str(&out.stdout)
            .map_err(|e| ApiError::auth(format!("unexpected legendary status output: {e}")))?;
        match status.account {
            Some(user) if !user.is_empty() && user != NOT_LOGGED_IN => Ok(Identity { user }),
            _ => Err(ApiError::auth("not logged in to Epic Games")),
        }
    }

    async fn forget(&self) -> Result<(), ApiError> {
        let out = self.run(&["auth", "--delete"]).await?;
        if out.success {
            Ok(())
        } else {
            Err(ApiError::unavailable(out.error_line()))
        }
    }
}

#[async_trait]
impl CatalogSource for Legendary {
    async fn fetch_games(&self) -> Result<Vec<Game>, ApiError> {
        let out = self.run(&["list", "--json"]).await?;
        if !out.success {
            return Err(ApiError::unavailable(out.error_line()));
        }
        parse_game_list(&out.stdout)
    }
}

fn parse_game_list(json: &str) -> Result<Vec<Game>, ApiError> {
    let listed: Vec<ListedGame> = serde_json::from_str(json)
        .map_err(|e| ApiError::unavailable(format!("unexpected catalog output: {e}")))?;
    Ok(listed
        .into_iter()
        .map(|g| Game {
            app_id: g.app_name,
            title: g.app_title,
        })
        .collect())
}

#[async_trait]
impl GameStore for Legendary {
    async fn download(&self, app_id: &str, staging: &Path, ctx: &JobContext) -> Result<PathBuf, ApiError> {
        self.install_into(app_id, staging, ctx).await?;
        // legendary creates a single folder named after the game below the base path.
        let mut dirs = archive::top_level_dirs(staging);
        match dirs.len() {
            1 => Ok(dirs.remove(0)),
            0 => Err(ApiError::install("legendary finished without writing any files")),
            n => Err(ApiError::install(format!(
                "expected one game folder in staging, found {n}"
            ))),
        }
    }

    async fn register(&self, app_id: &str, install_dir: &Path) -> Result<(), ApiError> {
        let dir = install_dir.to_string_lossy().to_string();
        let out = self
            .run(&["-y", "import", app_id, dir.as_str(), "--disable-check"])
            .await?;
        if out.success {
            Ok(())
        } else {
            Err(ApiError::install(out.error_line()))
        }
    }

    async fn unregister(&self, app_id: &str) -> Result<(), ApiError> {
        let out = self.run(&["-y", "uninstall", app_id, "--keep-files"]).await?;
        if out.success {
            Ok(())
        } else {
            Err(ApiError::install(out.error_line()))
        }
    }

    fn launch_command(
        &self,
        game: &InstalledGame,
        proton: &Proton,
        compat_data: &Path,
    ) -> Result<LaunchCommand, ApiError> {
        Ok(LaunchCommand {
            program: self.bin.clone(),
            args: launch_args(&game.app_id, proton)?,
            env: proton_env(proton, compat_data),
            cwd: Some(game.path.clone()),
        })
    }
}

/// `legendary launch` with Proton as the wrapper instead of wine.
fn launch_args(app_id: &str, proton: &Proton) -> Result<Vec<String>, ApiError> {
    let script = proton.script().to_string_lossy().to_string();
    let quoted = shlex::try_quote(&script)
        .map_err(|e| ApiError::validation(format!("unusable proton path: {e}")))?;
    Ok(vec![
        "launch".to_string(),
        app_id.to_string(),
        "--no-wine".to_string(),
        "--wrapper".to_string(),
        format!("{quoted} run"),
    ])
}

/// Environment Proton expects when run outside Steam.
pub fn proton_env(proton: &Proton, compat_data: &Path) -> Vec<(String, String)> {
    let steam_root = proton
        .path
        .parent()
        .and_then(Path::parent)
        .map(Path::to_path_buf)
        .unwrap_or_else(|| proton.path.clone());
    vec![
        (
            "STEAM_COMPAT_DATA_PATH".to_string(),
            compat_data.to_string_lossy().to_string(),
        ),
        (
            "STEAM_COMPAT_CLIENT_INSTALL_PATH".to_string(),
            steam_root.to_string_lossy().to_string(),
        ),
    ]
}
