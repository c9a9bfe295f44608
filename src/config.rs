use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::manager::{ManagerConfig, DEFAULT_COMMAND_TIMEOUT};

/// Top-level daemon config, loaded from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub manager: ManagerSection,
}

/// Session registry and reaper policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Program exec'd inside each session's PTY. When absent, sessions run
    /// a plain interactive shell.
    pub program: Option<String>,
    /// Roots a session's working directory must lie within. Empty means no
    /// restriction (single-user development default).
    #[serde(default)]
    pub allowed_roots: Vec<PathBuf>,
    /// Maximum live sessions; `None` means the registry default.
    pub max_sessions: Option<usize>,
    /// Reaper sweep interval, seconds.
    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,
    /// Idle age past which a session is reaped, seconds.
    #[serde(default = "default_idle_max_age_secs")]
    pub idle_max_age_secs: u64,
}

fn default_reaper_interval_secs() -> u64 {
    60
}

fn default_idle_max_age_secs() -> u64 {
    600
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            program: None,
            allowed_roots: vec![],
            max_sessions: None,
            reaper_interval_secs: default_reaper_interval_secs(),
            idle_max_age_secs: default_idle_max_age_secs(),
        }
    }
}

impl SessionsConfig {
    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    pub fn idle_max_age(&self) -> Duration {
        Duration::from_secs(self.idle_max_age_secs)
    }
}

/// Command queue driver section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerSection {
    /// The external CLI binary.
    #[serde(default = "default_manager_program")]
    pub program: String,
    /// Fixed arguments passed on every invocation.
    #[serde(default)]
    pub args: Vec<String>,
    /// Instruction preamble composed with each command.
    pub prompt_preamble: Option<String>,
    /// Per-invocation timeout, seconds.
    pub command_timeout_secs: Option<u64>,
    /// Override for the run sentinel location.
    pub sentinel_path: Option<PathBuf>,
}

fn default_manager_program() -> String {
    "agent".to_string()
}

impl Default for ManagerSection {
    fn default() -> Self {
        Self {
            program: default_manager_program(),
            args: vec![],
            prompt_preamble: None,
            command_timeout_secs: None,
            sentinel_path: None,
        }
    }
}

impl ManagerSection {
    /// Lower this section into the manager's runtime config, filling
    /// defaults for anything unset.
    pub fn to_manager_config(&self) -> ManagerConfig {
        let defaults = ManagerConfig::default();
        ManagerConfig {
            program: self.program.clone(),
            args: self.args.clone(),
            prompt_preamble: self
                .prompt_preamble
                .clone()
                .unwrap_or(defaults.prompt_preamble),
            command_timeout: self
                .command_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_COMMAND_TIMEOUT),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {0}: {1}")]
    ReadFailed(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config {0}: {1}")]
    ParseFailed(PathBuf, #[source] toml::de::Error),
}

impl Config {
    /// Load config from a TOML file path. Returns `None` if the file does
    /// not exist (defaults apply).
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        Ok(Some(config))
    }
}

/// Whether `cwd` lies within one of the authorized roots.
///
/// Paths are canonicalized so `..` segments and symlinks cannot escape a
/// root. An empty root list allows any existing directory. This check
/// belongs to the HTTP layer — the registry itself trusts its caller.
pub fn cwd_allowed(roots: &[PathBuf], cwd: &Path) -> bool {
    let Ok(canonical) = cwd.canonicalize() else {
        return false;
    };
    if !canonical.is_dir() {
        return false;
    }
    if roots.is_empty() {
        return true;
    }
    roots.iter().any(|root| {
        root.canonicalize()
            .map(|root| canonical.starts_with(root))
            .unwrap_or(false)
    })
}
