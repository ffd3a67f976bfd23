use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};

use crate::error::ApiError;

/// A fully resolved command line for starting a game.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LaunchHandle {
    pub app_id: String,
    pub proton_path: PathBuf,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct ExitSummary {
    pub code: Option<i32>,
    pub success: bool,
    pub killed: bool,
}

struct RunningGame {
    handle: LaunchHandle,
    kill_tx: Option<oneshot::Sender<()>>,
    exited: watch::Receiver<Option<ExitSummary>>,
}

type RunningMap = Arc<Mutex<HashMap<String, RunningGame>>>;

fn lock(map: &RunningMap) -> std::sync::MutexGuard<'_, HashMap<String, RunningGame>> {
    map.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Starts games and supervises them until they exit. One process per app id.
#[derive(Clone, Default)]
pub struct LaunchCoordinator {
    running: RunningMap,
}

impl LaunchCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns `cmd` for `app_id` and returns without waiting for it.
    ///
    /// The child gets its own process group so terminating it also takes down
    /// whatever Proton started underneath.
    pub fn launch(
        &self,
        app_id: &str,
        proton_path: &Path,
        cmd: LaunchCommand,
    ) -> Result<LaunchHandle, ApiError> {
        let mut guard = lock(&self.running);
        if let Some(r) = guard.get(app_id) {
            return Err(ApiError::conflict(format!(
                "{app_id} is already running (pid {})",
                r.handle.pid
            )));
        }

        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .envs(cmd.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &cmd.cwd {
            command.current_dir(cwd);
        }
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| {
            ApiError::launch(format!(
                "failed to launch {}: {e}",
                cmd.program.to_string_lossy()
            ))
        })?;
        let pid = child
            .id()
            .ok_or_else(|| ApiError::launch("process exited before it could be tracked"))?;

        forward_output(app_id, &mut child);

        let handle = LaunchHandle {
            app_id: app_id.to_string(),
            proton_path: proton_path.to_path_buf(),
            pid,
            started_at: Utc::now(),
        };
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        guard.insert(
            app_id.to_string(),
            RunningGame {
                handle: handle.clone(),
                kill_tx: Some(kill_tx),
                exited: exit_rx,
            },
        );
        drop(guard);

        log::info!("launched {app_id} (pid {pid}) with {}", proton_path.to_string_lossy());
        tokio::spawn(supervise(
            self.running.clone(),
            app_id.to_string(),
            child,
            kill_rx,
            exit_tx,
        ));
        Ok(handle)
    }

    pub fn active(&self) -> Vec<LaunchHandle> {
        let guard = lock(&self.running);
        let mut out: Vec<LaunchHandle> = guard.values().map(|r| r.handle.clone()).collect();
        out.sort_by(|a, b| a.app_id.cmp(&b.app_id));
        out
    }

    pub fn is_running(&self, app_id: &str) -> bool {
        lock(&self.running).contains_key(app_id)
    }

    pub fn uses_proton(&self, proton_path: &Path) -> bool {
        lock(&self.running)
            .values()
            .any(|r| r.handle.proton_path == proton_path)
    }

    /// Resolves when the game exits. `None` if it was not running.
    pub async fn wait_exit(&self, app_id: &str) -> Option<ExitSummary> {
        let mut rx = lock(&self.running).get(app_id)?.exited.clone();
        let summary = rx.wait_for(Option::is_some).await.ok()?;
        *summary
    }

    /// Kills the game's process group and waits until it is reaped.
    ///
    /// Returns `false` when nothing was running for `app_id`.
    pub async fn terminate(&self, app_id: &str) -> bool {
        let (kill_tx, rx) = {
            let mut guard = lock(&self.running);
            let Some(r) = guard.get_mut(app_id) else {
                return false;
            };
            (r.kill_tx.take(), r.exited.clone())
        };
        if let Some(tx) = kill_tx {
            log::info!("terminating {app_id}");
            let _ = tx.send(());
        }
        let mut rx = rx;
        let _ = rx.wait_for(Option::is_some).await;
        true
    }
}

fn forward_output(app_id: &str, child: &mut Child) {
    if let Some(stdout) = child.stdout.take() {
        let tag = app_id.to_string();
        tokio::spawn(async move {
            let mut r = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = r.next_line().await {
                log::debug!("[{tag}] {line}");
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let tag = app_id.to_string();
        tokio::spawn(async move {
            let mut r = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = r.next_line().await {
                log::debug!("[{tag}] stderr: {line}");
            }
        });
    }
}

#[cfg(unix)]
fn kill_group(pid: u32) {
    // SAFETY: plain syscall on a process group we created; errors are ignored.
    let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
    let err = std::io::Error::last_os_error();
    if rc != 0 && err.raw_os_error() != Some(libc::ESRCH) {
        log::debug!("killpg({pid}) failed: {err}");
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) {}

/// Owns the child: waits for it (or kills it), reaps it, then drops the handle.
async fn supervise(
    running: RunningMap,
    app_id: String,
    mut child: Child,
    mut kill_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<ExitSummary>>,
) {
    let pid = child.id().unwrap_or(0);
    let mut killed = false;
    let status = tokio::select! {
        status = child.wait() => {
            // Helpers such as wineserver outlive the leader in its group.
            kill_group(pid);
            status
        }
        Ok(()) = &mut kill_rx => {
            killed = true;
            kill_group(pid);
            let _ = child.start_kill();
            child.wait().await
        }
    };

    let summary = match status {
        Ok(s) => ExitSummary {
            code: s.code(),
            success: s.success(),
            killed,
        },
        Err(e) => {
            log::error!("failed to wait for {app_id} (pid {pid}): {e}");
            ExitSummary {
                code: None,
                success: false,
                killed,
            }
        }
    };

    {
        let mut guard = lock(&running);
        if guard.get(&app_id).is_some_and(|r| r.handle.pid == pid) {
            guard.remove(&app_id);
        }
    }
    log::info!("{app_id} (pid {pid}) exited: {summary:?}");
    let _ = exit_tx.send(Some(summary));
}
