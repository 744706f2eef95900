//! Command runner - executes allow-listed shell commands and streams their
//! output as ordered [`TerminalMessage`]s.
//!
//! Only keys present in the [`CommandTable`] can run; nothing from the
//! request is ever interpolated into a command line. Output is captured
//! through a per-run log file that is polled and diffed, so partial lines are
//! held back until a line break arrives.

use crate::archive;
use crate::config::{AppConfig, CommandEntry};
use crate::host::HostControl;
use crate::install::{Ecosystem, Installer, MODULE_INSTALL_PREFIX};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub const MSG_NOT_ALLOWED: &str = "The command was not allowed to be executed";
pub const MSG_NO_PERMISSION: &str = "Error: No permission";
pub const MSG_AUTH_FAILED: &str = "Error: Authentication failed";
pub const MSG_DIR_MISSING: &str = "Error: dir not exist";
pub const MSG_CALLBACK_FAILED: &str =
    "Error: Command execution succeeded, but callback execution failed";
pub const CONNECTION_SUCCESS: &str = "connection-success";
pub const EXEC_SUCCESS: &str = "exec-success";
pub const EXEC_ERROR: &str = "exec-error";
pub const EXEC_COMPLETED: &str = "exec-completed";

#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("The command was not allowed to be executed: {0}")]
    NotAllowed(String),

    #[error("Failed to run command: {0}")]
    Spawn(String),
}

// ---------------------------------------------------------------------------
// Allow-list
// ---------------------------------------------------------------------------

/// Host directories available to command `cwd` templates
#[derive(Debug, Clone)]
pub struct HostDirs {
    pub base: PathBuf,
    pub frontend: PathBuf,
    pub public: PathBuf,
    pub runtime: PathBuf,
}

impl HostDirs {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            base: config.paths.base(),
            frontend: config.paths.frontend(),
            public: config.paths.public(),
            runtime: config.paths.runtime(),
        }
    }

    fn expand(&self, template: &str) -> PathBuf {
        let expanded = template
            .replace("{base}", &self.base.to_string_lossy())
            .replace("{frontend}", &self.frontend.to_string_lossy())
            .replace("{public}", &self.public.to_string_lossy())
            .replace("{runtime}", &self.runtime.to_string_lossy());
        PathBuf::from(expanded)
    }
}

/// An allow-listed command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Working directory template (`{base}`, `{frontend}`, `{public}`, `{runtime}`)
    pub cwd: String,
    pub command: String,
    /// Files (relative to `cwd`) deleted before the command runs
    pub remove_before: Vec<String>,
}

impl CommandSpec {
    fn new(cwd: &str, command: &str) -> Self {
        Self {
            cwd: cwd.to_string(),
            command: command.to_string(),
            remove_before: Vec::new(),
        }
    }

    fn removing(mut self, file: &str) -> Self {
        self.remove_before.push(file.to_string());
        self
    }
}

/// A command ready to run: templates expanded
#[derive(Debug, Clone)]
pub struct ResolvedCommand {
    pub key: String,
    pub cwd: PathBuf,
    pub command: String,
    pub remove_before: Vec<PathBuf>,
}

/// Command allow-list keyed `group.variant` (or a bare `group`)
#[derive(Debug, Clone, Default)]
pub struct CommandTable {
    entries: BTreeMap<String, CommandSpec>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard table: tool versions, install tests, frontend install and
    /// build, registry switches and composer update
    pub fn default_table() -> Self {
        let mut table = Self::new();
        for (variant, cmd) in [
            ("npm", "npm -v"),
            ("yarn", "yarn -v"),
            ("pnpm", "pnpm -v"),
            ("node", "node -v"),
        ] {
            table.insert(&format!("version.{}", variant), CommandSpec::new("{base}", cmd));
        }
        for tool in ["npm", "yarn", "pnpm"] {
            let mut test = CommandSpec::new("{public}/npm-install-test", &format!("{} install", tool));
            let mut install = CommandSpec::new("{frontend}", &format!("{} install", tool));
            if tool == "pnpm" {
                test = test.removing("pnpm-lock.yaml");
                install = install.removing("pnpm-lock.yaml");
            }
            table.insert(&format!("test.{}", tool), test);
            table.insert(&format!("web-install.{}", tool), install);
            table.insert(
                &format!("web-build.{}", tool),
                CommandSpec::new("{frontend}", &format!("{} run build", tool)),
            );
        }
        for (variant, registry) in [
            ("npm", "https://registry.npmjs.org/"),
            ("taobao", "https://registry.npmmirror.com/"),
            ("tencent", "https://mirrors.cloud.tencent.com/npm/"),
        ] {
            table.insert(
                &format!("set-npm-registry.{}", variant),
                CommandSpec::new(
                    "{base}",
                    &format!(
                        "npm config set registry {} && npm config get registry",
                        registry
                    ),
                ),
            );
        }
        table.insert(
            "set-composer-registry.composer",
            CommandSpec::new("{base}", "composer config --unset repos.packagist"),
        );
        for (variant, mirror) in [
            ("tencent", "https://mirrors.cloud.tencent.com/composer/"),
            ("huawei", "https://mirrors.huaweicloud.com/repository/php/"),
            ("kkame", "https://packagist.kr"),
        ] {
            table.insert(
                &format!("set-composer-registry.{}", variant),
                CommandSpec::new(
                    "{base}",
                    &format!("composer config -g repos.packagist composer {}", mirror),
                ),
            );
        }
        table.insert(
            "composer.update",
            CommandSpec::new("{base}", "composer update --no-interaction"),
        );
        table
    }

    pub fn insert(&mut self, key: &str, spec: CommandSpec) {
        self.entries.insert(key.to_string(), spec);
    }

    /// Add or replace entries from configuration
    pub fn with_overrides(mut self, overrides: &BTreeMap<String, CommandEntry>) -> Self {
        for (key, entry) in overrides {
            self.insert(
                key,
                CommandSpec {
                    cwd: entry.cwd.clone().unwrap_or_else(|| "{base}".to_string()),
                    command: entry.command.clone(),
                    remove_before: entry.remove_before.clone(),
                },
            );
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&CommandSpec> {
        if key.is_empty() {
            return None;
        }
        self.entries.get(key)
    }

    pub fn resolve(&self, key: &str, dirs: &HostDirs) -> Option<ResolvedCommand> {
        let spec = self.get(key)?;
        let cwd = dirs.expand(&spec.cwd);
        Some(ResolvedCommand {
            key: key.to_string(),
            remove_before: spec.remove_before.iter().map(|f| cwd.join(f)).collect(),
            cwd,
            command: spec.command.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Authorization
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    Granted,
    /// Authenticated but not allowed to run commands
    Denied,
    /// Missing or invalid credentials
    Failed,
}

pub trait Authorizer: Send + Sync {
    fn authorize(&self, token: Option<&str>) -> AuthDecision;
}

/// Static token lists: admin tokens may run commands, user tokens may not
pub struct TokenAuthorizer {
    admin: HashSet<String>,
    user: HashSet<String>,
}

impl TokenAuthorizer {
    pub fn new(admin: Vec<String>, user: Vec<String>) -> Self {
        Self {
            admin: admin.into_iter().collect(),
            user: user.into_iter().collect(),
        }
    }
}

impl Authorizer for TokenAuthorizer {
    fn authorize(&self, token: Option<&str>) -> AuthDecision {
        match token.map(str::trim).filter(|t| !t.is_empty()) {
            Some(t) if self.admin.contains(t) => AuthDecision::Granted,
            Some(t) if self.user.contains(t) => AuthDecision::Denied,
            _ => AuthDecision::Failed,
        }
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// One streamed line of a command run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TerminalMessage {
    pub data: String,
    pub uuid: String,
    pub extend: String,
    pub key: String,
}

/// A request to run an allow-listed command
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecRequest {
    pub command: String,
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub extend: String,
    #[serde(default)]
    pub token: Option<String>,
    /// Whether the token must be checked
    #[serde(skip)]
    pub auth: bool,
}

struct Emitter {
    tx: mpsc::UnboundedSender<TerminalMessage>,
    uuid: String,
    extend: String,
    key: String,
}

impl Emitter {
    fn send(&self, data: impl Into<String>) {
        let _ = self.tx.send(TerminalMessage {
            data: data.into(),
            uuid: self.uuid.clone(),
            extend: self.extend.clone(),
            key: self.key.clone(),
        });
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Process status as seen by the poll loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcMark {
    NotStarted,
    Running,
    Finished,
}

/// Length of the prefix of `bytes` that ends with a line break, if any
fn complete_lines_end(bytes: &[u8]) -> Option<usize> {
    bytes
        .iter()
        .rposition(|b| *b == b'\n' || *b == b'\r')
        .map(|pos| pos + 1)
}

/// Kill the command's whole process group, then reap the shell itself
async fn kill_process_group(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: killpg(2) only sends a signal; a stale group yields -1/errno
        let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
        if rc != 0 {
            debug!(pid = pid, error = %std::io::Error::last_os_error(), "killpg failed");
        }
    }
    let _ = child.kill().await;
}

/// Plugin named by a `module-install:<app>` extend payload
fn module_install_target(extend: &str) -> Option<String> {
    extend
        .strip_prefix(MODULE_INSTALL_PREFIX)
        .map(str::trim)
        .filter(|app| !app.is_empty())
        .map(str::to_string)
}

fn shell_command(command: &str) -> Command {
    let (shell, shell_arg) = if cfg!(target_os = "windows") {
        ("cmd", "/C")
    } else {
        ("sh", "-c")
    };
    let mut cmd = Command::new(shell);
    cmd.arg(shell_arg).arg(command);
    cmd
}

/// Clean captured command output: trim, strip ANSI colour sequences and
/// normalize line endings
pub fn output_filter(output: &str) -> String {
    static ANSI: OnceLock<Option<Regex>> = OnceLock::new();
    let trimmed = output.trim();
    let stripped = match ANSI.get_or_init(|| Regex::new(r"\x1b?\[[0-9;]*m").ok()) {
        Some(re) => re.replace_all(trimmed, "").into_owned(),
        None => trimmed.to_string(),
    };
    stripped.replace("\r\n", "\n").replace('\r', "\n")
}

/// Move a finished frontend build (`dist/index.html`, `dist/assets`) into
/// the public directory, replacing the previous build
pub fn move_dist(frontend: &Path, public: &Path) -> Result<(), archive::ArchiveError> {
    let dist = frontend.join("dist");
    let index = dist.join("index.html");
    let assets = dist.join("assets");
    if !index.is_file() || !assets.is_dir() {
        return Err(archive::ArchiveError::Io {
            path: dist,
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "build output missing"),
        });
    }
    let to_index = public.join("index.html");
    let to_assets = public.join("assets");
    archive::delete_tree(&to_index)?;
    archive::delete_tree(&to_assets)?;
    archive::move_path(&index, &to_index)?;
    archive::move_path(&assets, &to_assets)?;
    archive::delete_tree(&dist)?;
    info!(public = ?public, "Published frontend build");
    Ok(())
}

// ---------------------------------------------------------------------------
// Terminal
// ---------------------------------------------------------------------------

/// Runs allow-listed commands and streams their output
#[derive(Clone)]
pub struct Terminal {
    table: Arc<CommandTable>,
    dirs: HostDirs,
    authorizer: Option<Arc<dyn Authorizer>>,
    installer: Option<Arc<Installer>>,
    host: Option<Arc<dyn HostControl>>,
    poll_interval: Duration,
    log_dir: PathBuf,
}

impl Terminal {
    pub fn new(table: CommandTable, dirs: HostDirs) -> Self {
        let log_dir = dirs.runtime.join("terminal");
        Self {
            table: Arc::new(table),
            dirs,
            authorizer: None,
            installer: None,
            host: None,
            poll_interval: Duration::from_millis(500),
            log_dir,
        }
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    /// Installer notified when dependency installs finish
    pub fn with_installer(mut self, installer: Arc<Installer>) -> Self {
        self.host = Some(installer.host().clone());
        self.installer = Some(installer);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn table(&self) -> &CommandTable {
        &self.table
    }

    /// Start a command run. Messages arrive in order on the returned channel,
    /// which always ends with `exec-completed`. Dropping the receiver kills
    /// the command.
    pub fn exec(&self, request: ExecRequest) -> mpsc::UnboundedReceiver<TerminalMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        let terminal = self.clone();
        tokio::spawn(async move {
            let out = Emitter {
                tx,
                uuid: request.uuid.clone(),
                extend: request.extend.clone(),
                key: request.command.clone(),
            };
            terminal.run(&request, &out).await;
            out.send(EXEC_COMPLETED);
        });
        rx
    }

    async fn run(&self, request: &ExecRequest, out: &Emitter) {
        let Some(command) = self.table.resolve(&request.command, &self.dirs) else {
            warn!(key = %request.command, "Rejected command not in allow-list");
            out.send(MSG_NOT_ALLOWED);
            out.send(EXEC_ERROR);
            return;
        };

        if request.auth {
            // no authorizer means no valid token exists
            let decision = match &self.authorizer {
                Some(authorizer) => authorizer.authorize(request.token.as_deref()),
                None => AuthDecision::Failed,
            };
            match decision {
                AuthDecision::Granted => {}
                AuthDecision::Denied => {
                    out.send(MSG_NO_PERMISSION);
                    out.send(EXEC_ERROR);
                    return;
                }
                AuthDecision::Failed => {
                    warn!(key = %request.command, "Rejected unauthenticated command");
                    out.send(MSG_AUTH_FAILED);
                    out.send(EXEC_ERROR);
                    return;
                }
            }
        }

        for file in &command.remove_before {
            if file.is_file() {
                if let Err(e) = fs::remove_file(file) {
                    warn!(path = ?file, error = %e, "Failed to remove file before command");
                }
            }
        }

        out.send(CONNECTION_SUCCESS);
        out.send(format!("> {}", command.command));

        if !command.cwd.is_dir() {
            out.send(MSG_DIR_MISSING);
            out.send(EXEC_ERROR);
            return;
        }

        let log_path = self
            .log_dir
            .join(format!("exec-{}.log", uuid::Uuid::new_v4().simple()));
        let exit_code = match self.spawn_and_stream(&command, &log_path, out).await {
            Ok(Some(code)) => code,
            Ok(None) => {
                let _ = fs::remove_file(&log_path);
                return;
            }
            Err(e) => {
                let _ = fs::remove_file(&log_path);
                out.send(format!("Error: {}", e));
                out.send(EXEC_ERROR);
                return;
            }
        };
        let _ = fs::remove_file(&log_path);

        out.send(format!("exitCode: {}", exit_code));
        if exit_code == 0 {
            if self.success_callback(&command.key, &request.extend).await {
                out.send(EXEC_SUCCESS);
            } else {
                out.send(MSG_CALLBACK_FAILED);
                out.send(EXEC_ERROR);
            }
        } else {
            out.send(EXEC_ERROR);
        }
    }

    /// Spawn the command with output redirected to `log_path` and stream new
    /// output until it exits. Returns `None` when the receiver went away.
    async fn spawn_and_stream(
        &self,
        command: &ResolvedCommand,
        log_path: &Path,
        out: &Emitter,
    ) -> std::io::Result<Option<i32>> {
        fs::create_dir_all(&self.log_dir)?;
        let log = fs::File::create(log_path)?;
        let log_err = log.try_clone()?;

        let mut cmd = shell_command(&command.command);
        // own process group so cancellation reaches everything the shell forks
        #[cfg(unix)]
        cmd.process_group(0);
        let mut child = cmd
            .current_dir(&command.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true)
            .spawn()?;
        info!(key = %command.key, pid = ?child.id(), "Started command");

        let mut seen = 0usize;
        let mut mark = ProcMark::NotStarted;
        let exit_code = loop {
            match child.try_wait()? {
                None => mark = ProcMark::Running,
                Some(status) => {
                    if mark == ProcMark::Finished {
                        break status.code().unwrap_or(-1);
                    }
                    // one more pass to flush output written before exit
                    mark = ProcMark::Finished;
                }
            }

            let contents = tokio::fs::read(log_path).await.unwrap_or_default();
            if let Some(fresh) = contents.get(seen..) {
                if let Some(end) = complete_lines_end(fresh) {
                    out.send(String::from_utf8_lossy(&fresh[..end]).into_owned());
                    seen += end;
                }
            }

            if out.is_closed() {
                debug!(key = %command.key, "Stream closed, killing command");
                kill_process_group(&mut child).await;
                return Ok(None);
            }
            if mark != ProcMark::Finished {
                tokio::time::sleep(self.poll_interval).await;
            }
        };
        info!(key = %command.key, exit_code = exit_code, "Command finished");
        Ok(Some(exit_code))
    }

    async fn success_callback(&self, key: &str, extend: &str) -> bool {
        let group = key.split('.').next().unwrap_or(key);
        match group {
            "web-build" => match move_dist(&self.dirs.frontend, &self.dirs.public) {
                Ok(()) => true,
                Err(e) => {
                    error!(error = %e, "Failed to publish frontend build");
                    false
                }
            },
            "web-install" | "composer" => {
                let Some(app) = module_install_target(extend) else {
                    return true;
                };
                let Some(installer) = self.installer.clone() else {
                    warn!(app = %app, "No installer attached, skipping dependency completion");
                    return true;
                };
                let composer = group == "composer";
                let ecosystem = if composer {
                    Ecosystem::Composer
                } else {
                    Ecosystem::Npm
                };
                let host = self.host.clone();
                let result = tokio::task::spawn_blocking(move || {
                    installer.dependent_install_complete(&app, ecosystem)?;
                    if composer {
                        if let Some(host) = host {
                            host.restart();
                        }
                    }
                    Ok::<(), crate::install::InstallError>(())
                })
                .await;
                match result {
                    Ok(Ok(())) => true,
                    Ok(Err(e)) => {
                        error!(error = %e, "Dependency completion failed");
                        false
                    }
                    Err(e) => {
                        error!(error = %e, "Dependency completion task panicked");
                        false
                    }
                }
            }
            _ => true,
        }
    }

    /// Run an allow-listed command to completion and return its filtered
    /// output (stdout followed by stderr)
    pub async fn capture(&self, key: &str) -> Result<String, TerminalError> {
        let command = self
            .table
            .resolve(key, &self.dirs)
            .ok_or_else(|| TerminalError::NotAllowed(key.to_string()))?;
        let mut cmd = shell_command(&command.command);
        if command.cwd.is_dir() {
            cmd.current_dir(&command.cwd);
        }
        let output = cmd
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| TerminalError::Spawn(e.to_string()))?;
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(output_filter(&text))
    }
}
