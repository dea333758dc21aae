use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from supervisor.toml.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct SupervisorConfig {
    pub core: CoreConfig,
    pub restart: RestartConfig,
    pub shutdown: ShutdownConfig,
    pub log: LogConfig,
    pub privileged: PrivilegedConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Path to the managed core binary.
    pub executable: PathBuf,
    /// Path to the core's own configuration file.
    pub config_file: PathBuf,
    /// Working directory for the core (defaults to the executable's directory).
    pub working_dir: Option<PathBuf>,
    /// Arguments; `{config}` is replaced with `config_file`.
    pub args: Vec<String>,
    /// Image name matched during discovery (defaults to the executable file name).
    pub process_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    pub max_attempts: u32,
    pub backoff_secs: u64,
    pub stability_secs: u64,
    pub post_start_delay_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub graceful_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub max_bytes: u64,
}

/// How a TUN-requiring core config gets the rights it needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivilegeMode {
    /// `Elevate` on macOS, `Capabilities` on other unix, `None` on Windows.
    Auto,
    /// Start through the elevation trampoline.
    Elevate,
    /// Require file capabilities on the binary, never elevate.
    Capabilities,
    /// Always spawn directly.
    None,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PrivilegedConfig {
    pub mode: PrivilegeMode,
    /// Command prefix that runs the trampoline script with elevated rights.
    pub elevator: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

// --- Default implementations ---

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from(default_executable()),
            config_file: PathBuf::from("config.json"),
            working_dir: None,
            args: vec!["run".to_string(), "-c".to_string(), "{config}".to_string()],
            process_name: None,
        }
    }
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_secs: 2,
            stability_secs: 180,
            post_start_delay_secs: 2,
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            graceful_timeout_secs: 2,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_bytes: 10 * 1024 * 1024,
        }
    }
}

impl Default for PrivilegedConfig {
    fn default() -> Self {
        Self {
            mode: PrivilegeMode::Auto,
            elevator: default_elevator(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".core-supervisor"),
        }
    }
}

fn default_executable() -> &'static str {
    if cfg!(windows) {
        "bin/sing-box.exe"
    } else {
        "bin/sing-box"
    }
}

/// `path` joined onto `base` unless it is already absolute.
pub fn anchor(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn default_elevator() -> Vec<String> {
    if cfg!(target_os = "linux") {
        vec!["pkexec".to_string()]
    } else {
        vec!["sudo".to_string(), "-A".to_string()]
    }
}

impl CoreConfig {
    /// Image name used to find running instances of the core.
    pub fn image_name(&self) -> String {
        if let Some(name) = &self.process_name {
            return name.clone();
        }
        self.executable
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.executable.to_string_lossy().to_string())
    }

    /// Directory the core runs in.
    pub fn resolved_working_dir(&self) -> PathBuf {
        if let Some(dir) = &self.working_dir {
            return dir.clone();
        }
        match self.executable.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    /// Copy with the executable, config file and working dir resolved
    /// against `base`. The core runs in another directory, so relative
    /// paths would otherwise resolve differently for it.
    pub fn anchored(&self, base: &Path) -> CoreConfig {
        CoreConfig {
            executable: anchor(base, &self.executable),
            config_file: anchor(base, &self.config_file),
            working_dir: self.working_dir.as_deref().map(|dir| anchor(base, dir)),
            args: self.args.clone(),
            process_name: self.process_name.clone(),
        }
    }

    /// Build the argument list, replacing `{config}` placeholders with the config path.
    pub fn build_args(&self) -> Vec<String> {
        let config = self.config_file.to_string_lossy();
        self.args
            .iter()
            .map(|arg| arg.replace("{config}", &config))
            .collect()
    }
}

impl RestartConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }

    pub fn stability_threshold(&self) -> Duration {
        Duration::from_secs(self.stability_secs)
    }

    pub fn post_start_delay(&self) -> Duration {
        Duration::from_secs(self.post_start_delay_secs)
    }
}

impl ShutdownConfig {
    pub fn graceful_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_timeout_secs)
    }
}

impl PrivilegeMode {
    /// Collapse `Auto` into the concrete mode for the host platform.
    pub fn resolve(self) -> PrivilegeMode {
        match self {
            PrivilegeMode::Auto if cfg!(target_os = "macos") => PrivilegeMode::Elevate,
            PrivilegeMode::Auto if cfg!(unix) => PrivilegeMode::Capabilities,
            PrivilegeMode::Auto => PrivilegeMode::None,
            other => other,
        }
    }
}

impl SupervisorConfig {
    /// Load configuration from a TOML file. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        Self::parse(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Parse configuration from TOML text.
    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }
}

/// Errors from loading the supervisor configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "invalid config {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}
