use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Serialize;

use crate::archive;
use crate::error::ApiError;
use crate::jobs::JobContext;
use crate::progress::JobProgress;

/// An installed compatibility tool under the tools folder.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Proton {
    pub name: String,
    pub version: String,
    pub path: PathBuf,
}

impl Proton {
    /// The `proton` entry script inside the build.
    pub fn script(&self) -> PathBuf {
        self.path.join("proton")
    }
}

/// Fetches the release archive of a Proton version.
#[async_trait]
pub trait ProtonSource: Send + Sync {
    /// Writes the `.tar.gz` for `version` to `dest`.
    async fn fetch(&self, version: &str, dest: &Path, ctx: &JobContext) -> Result<(), ApiError>;
}

/// Proton-GE releases published on GitHub.
pub struct GithubReleases {
    client: reqwest::Client,
    url_template: String,
}

impl GithubReleases {
    pub fn new(url_template: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url_template: url_template.into(),
        }
    }

    pub fn url_for(&self, version: &str) -> String {
        self.url_template.replace("{version}", version)
    }
}

#[async_trait]
impl ProtonSource for GithubReleases {
    async fn fetch(&self, version: &str, dest: &Path, ctx: &JobContext) -> Result<(), ApiError> {
        let url = self.url_for(version);
        log::info!("Downloading {version} from {url} to {}", dest.to_string_lossy());

        // Stream download into file (avoid holding whole tarball in memory).
        let response = self
            .client
            .get(&url)
            .header("User-Agent", concat!("epic-session/", env!("CARGO_PKG_VERSION")))
            .send()
            .await
            .map_err(|e| ApiError::unavailable(format!("failed to download {version}: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(if status == reqwest::StatusCode::NOT_FOUND {
                ApiError::install(format!("no release named {version}"))
            } else {
                ApiError::install(format!("{version} download failed with status {status}"))
            });
        }

        let total = response.content_length();
        let mut file = File::create(dest).map_err(|e| ApiError::install(e.to_string()))?;
        let mut downloaded: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            ctx.check_cancelled()?;
            let chunk = chunk.map_err(|e| ApiError::install(format!("download interrupted: {e}")))?;
            file.write_all(&chunk)
                .map_err(|e| ApiError::install(e.to_string()))?;
            downloaded = downloaded.saturating_add(chunk.len() as u64);
            ctx.report(
                JobProgress::step(1, STEPS_TOTAL, "Download")
                    .with_bytes(downloaded, total)
                    .with_detail(format!("Downloading {version}...")),
            );
        }
        file.flush().map_err(|e| ApiError::install(e.to_string()))?;
        Ok(())
    }
}

const STEPS_TOTAL: u32 = 3;

/// Version names become directory names: plain characters only.
pub fn validate_version(version: &str) -> Result<String, ApiError> {
    let v = version.trim();
    if v.is_empty() {
        return Err(ApiError::validation("proton version is empty"));
    }
    let ok = !v.starts_with('.')
        && v
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '+'));
    if !ok {
        return Err(ApiError::validation(format!("malformed proton version `{v}`")));
    }
    Ok(v.to_string())
}

fn dir_has_any_entries(path: &Path) -> bool {
    std::fs::read_dir(path).ok().and_then(|mut rd| rd.next()).is_some()
}

/// Hidden scratch paths for one job. The job id keeps concurrent jobs apart.
fn scratch_paths(root: &Path, version: &str, job_id: &str) -> (PathBuf, PathBuf) {
    (
        root.join(format!(".tmp_{version}_{job_id}.tar.gz")),
        root.join(format!(".tmp_extract_{version}_{job_id}")),
    )
}

/// Proton builds ship a `version` file shaped like `1700000000 GE-Proton9-1`.
fn read_version_file(dir: &Path) -> Option<String> {
    let text = std::fs::read_to_string(dir.join("version")).ok()?;
    let mut parts = text.split_whitespace();
    let first = parts.next()?;
    Some(parts.next().unwrap_or(first).to_string())
}

/// The compatibility tools folder and the installs in it.
pub struct ProtonRegistry {
    root: PathBuf,
    source: Arc<dyn ProtonSource>,
}

impl ProtonRegistry {
    pub fn new(root: PathBuf, source: Arc<dyn ProtonSource>) -> Self {
        Self { root, source }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Installed builds sorted by name. Hidden temp dirs and empty dirs are skipped.
    pub fn list(&self) -> Vec<Proton> {
        let Ok(rd) = std::fs::read_dir(&self.root) else {
            return vec![];
        };
        let mut out: Vec<Proton> = vec![];
        for e in rd.flatten() {
            let path = e.path();
            let Ok(ty) = e.file_type() else { continue };
            if !ty.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
                continue;
            };
            if name.starts_with('.') || !dir_has_any_entries(&path) {
                continue;
            }
            out.push(Proton {
                name: name.to_string(),
                version: read_version_file(&path).unwrap_or_else(|| name.to_string()),
                path,
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn find_by_path(&self, path: &Path) -> Option<Proton> {
        self.list().into_iter().find(|p| p.path == path)
    }

    pub fn find(&self, version: &str) -> Option<Proton> {
        self.list().into_iter().find(|p| p.name == version)
    }

    /// Download, extract into a hidden temp dir, then move into place.
    pub async fn install(&self, version: &str, ctx: &JobContext) -> Result<(), ApiError> {
        std::fs::create_dir_all(&self.root).map_err(|e| ApiError::install(e.to_string()))?;

        let final_dir = self.root.join(version);
        if final_dir.exists() && dir_has_any_entries(&final_dir) {
            log::info!("{version} already installed at {}", final_dir.to_string_lossy());
            ctx.report(JobProgress::step(STEPS_TOTAL, STEPS_TOTAL, "Finalize").with_detail("Already installed"));
            return Ok(());
        }
        // If the dir exists but is empty/corrupt, remove it and reinstall.
        if final_dir.exists() {
            log::warn!("{} exists but is empty; reinstalling", final_dir.to_string_lossy());
            let _ = std::fs::remove_dir_all(&final_dir);
        }

        let (tar_path, extract_tmp) = scratch_paths(&self.root, version, ctx.id());
        let cleanup = || {
            let _ = std::fs::remove_file(&tar_path);
            let _ = std::fs::remove_dir_all(&extract_tmp);
        };

        let res = self.install_staged(version, &tar_path, &extract_tmp, &final_dir, ctx).await;
        cleanup();
        if res.is_ok() {
            log::info!("{version} installed successfully at {}", final_dir.to_string_lossy());
        }
        res
    }

    async fn install_staged(
        &self,
        version: &str,
        tar_path: &Path,
        extract_tmp: &Path,
        final_dir: &Path,
        ctx: &JobContext,
    ) -> Result<(), ApiError> {
        ctx.report(JobProgress::step(1, STEPS_TOTAL, "Download").with_detail(format!("Downloading {version}...")));
        self.source.fetch(version, tar_path, ctx).await?;
        ctx.check_cancelled()?;

        if !archive::looks_like_gzip(tar_path).map_err(ApiError::install)? {
            return Err(ApiError::install(format!(
                "{version} download is not a valid .tar.gz (got non-gzip response)"
            )));
        }

        ctx.report(JobProgress::step(2, STEPS_TOTAL, "Extract").with_detail("Extracting..."));
        let tar_clone = tar_path.to_path_buf();
        let extract_clone = extract_tmp.to_path_buf();
        let cancel = ctx.cancel_flag();
        tokio::task::spawn_blocking(move || {
            archive::extract_tar_gz_with_progress(&tar_clone, &extract_clone, &cancel, |done, _| {
                if done % 500 == 0 {
                    log::debug!("extracted {done} entries");
                }
            })
        })
        .await
        .map_err(|e| ApiError::install(e.to_string()))?
        .map_err(ApiError::install)?;
        ctx.check_cancelled()?;

        // Expect a top-level folder named after the version; accept a single
        // differently named folder too.
        let expected = extract_tmp.join(version);
        let extracted_dir = if expected.is_dir() {
            expected
        } else {
            let mut dirs = archive::top_level_dirs(extract_tmp);
            if dirs.len() != 1 {
                return Err(ApiError::install(format!(
                    "{version} archive did not contain expected top-level folder `{version}`"
                )));
            }
            dirs.remove(0)
        };

        ctx.report(JobProgress::step(3, STEPS_TOTAL, "Finalize").with_detail("Moving into place..."));
        // Same filesystem: one rename makes the build visible all at once.
        std::fs::rename(&extracted_dir, final_dir)
            .map_err(|e| ApiError::install(format!("failed to move {version} into place: {e}")))?;
        Ok(())
    }

    pub async fn uninstall(&self, version: &str, ctx: &JobContext) -> Result<(), ApiError> {
        let dir = self.root.join(version);
        if !dir.is_dir() {
            return Err(ApiError::install(format!("{version} is not installed")));
        }
        ctx.check_cancelled()?;
        ctx.report(JobProgress::step(1, 1, "Remove").with_detail(format!("Removing {version}...")));

        let trash = self.root.join(format!(".trash_{version}_{}", ctx.id()));
        std::fs::rename(&dir, &trash)
            .map_err(|e| ApiError::install(format!("failed to remove {version}: {e}")))?;
        let trash_clone = trash.clone();
        let removed = tokio::task::spawn_blocking(move || std::fs::remove_dir_all(&trash_clone))
            .await
            .map_err(|e| ApiError::install(e.to_string()))?;
        if let Err(e) = removed {
            log::warn!("failed to delete {}: {e}", trash.to_string_lossy());
        }
        log::info!("{version} uninstalled");
        Ok(())
    }
}
