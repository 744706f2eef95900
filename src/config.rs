//! Configuration loader.
//!
//! Loads configuration from:
//! 1. Default values
//! 2. `.plugwright/config.yaml` in project directory
//! 3. `~/.plugwright/config.yaml` in home directory
//! 4. Environment variables with `PLUGWRIGHT_` prefix

use crate::host::RestartMode;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub host: HostConfig,
    #[serde(default)]
    pub terminal: TerminalConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub install: InstallConfig,
}

/// HTTP server configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
}

fn default_port() -> u16 {
    8787
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

/// Host application layout
///
/// Only `base_dir` is required; the rest are derived from it when unset:
/// frontend `<base>/../web`, public `<base>/public`, runtime `<base>/runtime`.
#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    #[serde(default)]
    pub frontend_dir: Option<PathBuf>,
    #[serde(default)]
    pub public_dir: Option<PathBuf>,
    #[serde(default)]
    pub runtime_dir: Option<PathBuf>,
}

fn default_base_dir() -> PathBuf {
    PathBuf::from(".")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            frontend_dir: None,
            public_dir: None,
            runtime_dir: None,
        }
    }
}

impl PathsConfig {
    pub fn base(&self) -> PathBuf {
        self.base_dir.clone()
    }

    pub fn frontend(&self) -> PathBuf {
        self.frontend_dir.clone().unwrap_or_else(|| {
            self.base_dir
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| self.base_dir.join(".."))
                .join("web")
        })
    }

    pub fn public(&self) -> PathBuf {
        self.public_dir
            .clone()
            .unwrap_or_else(|| self.base_dir.join("public"))
    }

    pub fn runtime(&self) -> PathBuf {
        self.runtime_dir
            .clone()
            .unwrap_or_else(|| self.base_dir.join("runtime"))
    }

    /// Where uploaded packages are unpacked and tracked
    pub fn install_dir(&self) -> PathBuf {
        self.runtime().join("packages")
    }
}

/// Database used for plugin SQL scripts
#[derive(Debug, Deserialize, Clone, Default)]
pub struct DatabaseConfig {
    /// SQLite database file. When unset, SQL scripts are skipped.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Host process control
#[derive(Debug, Deserialize, Clone, Default)]
pub struct HostConfig {
    #[serde(default)]
    pub restart_mode: RestartMode,
    /// Process to signal on graceful restart (default: parent process)
    #[serde(default)]
    pub supervisor_pid: Option<i32>,
}

/// A command added to (or replacing one in) the allow-list
#[derive(Debug, Deserialize, Clone)]
pub struct CommandEntry {
    pub command: String,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub remove_before: Vec<String>,
}

/// Command runner configuration
#[derive(Debug, Deserialize, Clone)]
pub struct TerminalConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Require a token on the terminal stream
    #[serde(default = "default_true")]
    pub auth_required: bool,
    /// Extra allow-list entries keyed `group.variant` (or `group`)
    #[serde(default)]
    pub commands: BTreeMap<String, CommandEntry>,
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_true() -> bool {
    true
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            auth_required: true,
            commands: BTreeMap::new(),
        }
    }
}

/// Tokens accepted by the terminal stream
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AuthConfig {
    #[serde(default)]
    pub admin_tokens: Vec<String>,
    #[serde(default)]
    pub user_tokens: Vec<String>,
}

impl AuthConfig {
    pub fn is_configured(&self) -> bool {
        !self.admin_tokens.is_empty() || !self.user_tokens.is_empty()
    }
}

/// Upload limits
#[derive(Debug, Deserialize, Clone)]
pub struct UploadConfig {
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    #[serde(default = "default_extensions")]
    pub allowed_extensions: Vec<String>,
}

fn default_max_size() -> usize {
    5 * 1024 * 1024
}

fn default_extensions() -> Vec<String> {
    vec!["zip".to_string()]
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            allowed_extensions: default_extensions(),
        }
    }
}

/// Dependency install commands run after a plugin declares dependencies
#[derive(Debug, Deserialize, Clone)]
pub struct InstallConfig {
    #[serde(default = "default_npm_command")]
    pub npm_command: String,
    #[serde(default = "default_composer_command")]
    pub composer_command: String,
}

fn default_npm_command() -> String {
    "web-install.pnpm".to_string()
}

fn default_composer_command() -> String {
    "composer.update".to_string()
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            npm_command: default_npm_command(),
            composer_command: default_composer_command(),
        }
    }
}

/// Load configuration from files and environment
pub fn load_config() -> Result<AppConfig, ConfigError> {
    let mut sources = vec![PathBuf::from(".plugwright/config.yaml")];
    if let Some(home) = dirs::home_dir() {
        sources.push(home.join(".plugwright/config.yaml"));
    }
    load_config_from(&sources)
}

/// Load configuration from the given files (earlier files take precedence
/// over later ones) and the environment
pub fn load_config_from(files: &[PathBuf]) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder();

    builder = builder
        .set_default("server.port", default_port() as i64)?
        .set_default("server.host", default_host())?
        .set_default("terminal.poll_interval_ms", default_poll_interval_ms() as i64)?
        .set_default("upload.max_size", default_max_size() as i64)?
        .set_default("install.npm_command", default_npm_command())?
        .set_default("install.composer_command", default_composer_command())?;

    // Later sources override earlier ones, so add in reverse precedence
    for path in files.iter().rev() {
        if path.exists() {
            builder = builder.add_source(File::from(path.clone()).required(false));
        }
    }

    // e.g. PLUGWRIGHT_SERVER__PORT=9090, PLUGWRIGHT_HOST__RESTART_MODE=signal
    builder = builder.add_source(
        Environment::with_prefix("PLUGWRIGHT")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

/// Starter configuration written by `plugwright init`
pub const DEFAULT_CONFIG_YAML: &str = r#"# plugwright configuration

server:
  host: 127.0.0.1
  port: 8787

paths:
  # Root of the backend application (composer.json lives here)
  base_dir: .
  # frontend_dir: ../web
  # public_dir: ./public
  # runtime_dir: ./runtime

database:
  # SQLite database used for plugin install/update/uninstall scripts
  # path: ./runtime/app.db

host:
  # signal | shutdown | none
  restart_mode: shutdown
  # supervisor_pid: 1234

terminal:
  poll_interval_ms: 500
  auth_required: true
  # commands:
  #   lint.web:
  #     cwd: "{frontend}"
  #     command: npm run lint

auth:
  admin_tokens: []
  user_tokens: []

upload:
  max_size: 5242880
  allowed_extensions: [zip]

install:
  npm_command: web-install.pnpm
  composer_command: composer.update
"#;
