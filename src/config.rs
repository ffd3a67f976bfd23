use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const CONFIG_ENV: &str = "EPIC_SESSION_CONFIG";

const DEFAULT_API_ADDRESS: &str = "127.0.0.1:8080";
const DEFAULT_SESSION_TTL_SECS: u64 = 12 * 60 * 60;
const DEFAULT_MAX_PARALLEL_JOBS: usize = 2;
const DEFAULT_LEGENDARY_BIN: &str = "legendary";
pub const DEFAULT_PROTON_RELEASE_URL: &str =
    "https://github.com/GloriousEggroll/proton-ge-custom/releases/download/{version}/{version}.tar.gz";

/// Daemon configuration.
///
/// Every key is optional in the file; anything left out takes the default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub api_address: String,
    pub log_level: String,
    pub data_dir: PathBuf,
    pub games_dir: Option<PathBuf>,
    pub proton_dir: Option<PathBuf>,
    pub legendary_bin: PathBuf,
    /// Python virtualenv holding legendary. Used when `legendary_bin` is left at its default.
    pub venv_path: Option<PathBuf>,
    pub session_ttl_secs: u64,
    pub max_parallel_jobs: usize,
    /// `{version}` is replaced with the requested Proton version.
    pub proton_release_url: String,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("epic-session");
        Self {
            api_address: DEFAULT_API_ADDRESS.to_string(),
            log_level: "info".to_string(),
            data_dir,
            games_dir: None,
            proton_dir: None,
            legendary_bin: PathBuf::from(DEFAULT_LEGENDARY_BIN),
            venv_path: None,
            session_ttl_secs: DEFAULT_SESSION_TTL_SECS,
            max_parallel_jobs: DEFAULT_MAX_PARALLEL_JOBS,
            proton_release_url: DEFAULT_PROTON_RELEASE_URL.to_string(),
        }
    }
}

impl Config {
    /// Resolves the config path: `$EPIC_SESSION_CONFIG`, else the per-user config dir.
    pub fn default_path() -> Option<PathBuf> {
        if let Some(p) = std::env::var_os(CONFIG_ENV) {
            return Some(PathBuf::from(p));
        }
        dirs::config_dir().map(|d| d.join("epic-session").join("config.json"))
    }

    /// Reads `path`. A missing file is not an error: defaults are used.
    pub fn load(path: &Path) -> Result<Self, String> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(format!("failed to read {}: {e}", path.display())),
        };
        let cfg: Config = serde_json::from_str(&text)
            .map_err(|e| format!("failed to parse {}: {e}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), String> {
        if self.max_parallel_jobs == 0 {
            return Err("max_parallel_jobs must be at least 1".to_string());
        }
        if self.session_ttl_secs == 0 {
            return Err("session_ttl_secs must be at least 1".to_string());
        }
        if !self.proton_release_url.contains("{version}") {
            return Err("proton_release_url must contain `{version}`".to_string());
        }
        self.log_level_filter()?;
        Ok(())
    }

    pub fn log_level_filter(&self) -> Result<log::LevelFilter, String> {
        self.log_level
            .parse::<log::LevelFilter>()
            .map_err(|_| format!("unknown log_level `{}`", self.log_level))
    }

    pub fn games_dir(&self) -> PathBuf {
        self.games_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("games"))
    }

    /// Steam's compatibility tools folder, where Proton-GE builds are expected.
    pub fn proton_dir(&self) -> PathBuf {
        if let Some(dir) = &self.proton_dir {
            return dir.clone();
        }
        dirs::home_dir()
            .unwrap_or_else(|| self.data_dir.clone())
            .join(".steam")
            .join("root")
            .join("compatibilitytools.d")
    }

    /// The legendary executable to run. An explicit `legendary_bin` beats `venv_path`.
    pub fn legendary_path(&self) -> PathBuf {
        match &self.venv_path {
            Some(venv) if self.legendary_bin.as_path() == Path::new(DEFAULT_LEGENDARY_BIN) => {
                venv.join("bin").join("legendary")
            }
            _ => self.legendary_bin.clone(),
        }
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// Wine prefixes handed to Proton, one per game.
    pub fn compat_data_dir(&self) -> PathBuf {
        self.data_dir.join("compatdata")
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}
