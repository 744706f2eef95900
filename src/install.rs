//! Install state machine.
//!
//! Drives a plugin package through its lifecycle:
//!
//! ```text
//! upload ──> WAIT_INSTALL ──install──> INSTALLED
//!                 │                       ^
//!                 └──> DEPENDENT_WAIT_INSTALL ──(deps installed)──┘
//! ```
//!
//! Every destructive change (dependency merge, uninstall) is preceded by a
//! zip backup in `<install_dir>/backups/`.

use crate::archive::{self, ArchiveError};
use crate::config::AppConfig;
use crate::depends::{DependsError, DependsFile, DependsKind, PluginDepends};
use crate::host::HostControl;
use crate::manifest::{
    InstallState, IniValue, Manifest, ManifestError, ManifestStore, KEY_APP,
    KEY_COMPOSER_WAIT, KEY_NPM_WAIT, KEY_UPDATE,
};
use crate::sql::{import_sql, SqlError, SqlExecutor};
use crate::version;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Name of the backups directory inside the install dir
pub const BACKUPS_DIR: &str = "backups";

/// Extend payload prefix tying a dependency install back to its plugin
pub const MODULE_INSTALL_PREFIX: &str = "module-install:";

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Integrity(String),

    #[error(transparent)]
    Persistence(#[from] ManifestError),

    #[error("SQL error: {0}")]
    Sql(#[from] SqlError),

    #[error("Dependency error: {0}")]
    Depends(#[from] DependsError),

    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for InstallError {
    fn from(e: std::io::Error) -> Self {
        InstallError::Io(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Ecosystems and install outcome
// ---------------------------------------------------------------------------

/// Dependency ecosystem whose install has completed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Ecosystem {
    Npm,
    Composer,
    All,
}

impl FromStr for Ecosystem {
    type Err = InstallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "npm" => Ok(Self::Npm),
            "composer" => Ok(Self::Composer),
            "all" => Ok(Self::All),
            other => Err(InstallError::Validation(format!(
                "unknown dependency type: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for Ecosystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Npm => write!(f, "npm"),
            Self::Composer => write!(f, "composer"),
            Self::All => write!(f, "all"),
        }
    }
}

/// A dependency install the caller should run through the terminal
#[derive(Debug, Clone, Serialize)]
pub struct PendingDependencyInstall {
    pub ecosystem: Ecosystem,
    pub command: String,
    pub extend: String,
}

/// Result of a successful install call
#[derive(Debug, Clone, Serialize)]
pub struct InstallOutcome {
    pub manifest: Manifest,
    pub pending: Vec<PendingDependencyInstall>,
}

// ---------------------------------------------------------------------------
// Layout
// ---------------------------------------------------------------------------

/// Filesystem layout the installer works against
#[derive(Debug, Clone)]
pub struct HostLayout {
    pub install_dir: PathBuf,
    pub backups_dir: PathBuf,
    pub base_dir: PathBuf,
    pub frontend_dir: PathBuf,
    /// Allow-list key used to install frontend dependencies
    pub npm_command: String,
    /// Allow-list key used to install backend dependencies
    pub composer_command: String,
}

impl HostLayout {
    pub fn new(install_dir: PathBuf, base_dir: PathBuf, frontend_dir: PathBuf) -> Self {
        Self {
            backups_dir: install_dir.join(BACKUPS_DIR),
            install_dir,
            base_dir,
            frontend_dir,
            npm_command: "web-install.pnpm".to_string(),
            composer_command: "composer.update".to_string(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        let mut layout = Self::new(
            config.paths.install_dir(),
            config.paths.base(),
            config.paths.frontend(),
        );
        layout.npm_command = config.install.npm_command.clone();
        layout.composer_command = config.install.composer_command.clone();
        layout
    }

    pub fn app_dir(&self, app: &str) -> PathBuf {
        self.install_dir.join(app)
    }

    fn frontend_name(&self) -> String {
        self.frontend_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "web".to_string())
    }

    fn composer_json(&self) -> PathBuf {
        self.base_dir.join(DependsKind::Composer.file_name())
    }

    fn package_json(&self) -> PathBuf {
        self.frontend_dir.join(DependsKind::Npm.file_name())
    }

    /// Directory both host roots live under, used to name backup entries
    fn common_root(&self) -> PathBuf {
        let mut root = self.base_dir.clone();
        while !self.frontend_dir.starts_with(&root) {
            match root.parent() {
                Some(parent) => root = parent.to_path_buf(),
                None => return PathBuf::new(),
            }
        }
        root
    }
}

// ---------------------------------------------------------------------------
// Leases
// ---------------------------------------------------------------------------

/// Per-plugin exclusive leases
#[derive(Default)]
struct Leases {
    busy: Mutex<HashSet<String>>,
    released: Condvar,
}

struct Lease<'a> {
    leases: &'a Leases,
    app: String,
}

impl Leases {
    fn try_acquire(&self, app: &str) -> Option<Lease<'_>> {
        let mut busy = self.busy.lock().unwrap_or_else(|e| e.into_inner());
        if !busy.insert(app.to_string()) {
            return None;
        }
        Some(Lease {
            leases: self,
            app: app.to_string(),
        })
    }

    fn acquire(&self, app: &str) -> Lease<'_> {
        let mut busy = self.busy.lock().unwrap_or_else(|e| e.into_inner());
        while busy.contains(app) {
            busy = self
                .released
                .wait(busy)
                .unwrap_or_else(|e| e.into_inner());
        }
        busy.insert(app.to_string());
        Lease {
            leases: self,
            app: app.to_string(),
        }
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        let mut busy = self.leases.busy.lock().unwrap_or_else(|e| e.into_inner());
        busy.remove(&self.app);
        self.leases.released.notify_all();
    }
}

// ---------------------------------------------------------------------------
// Installer
// ---------------------------------------------------------------------------

fn timestamp() -> String {
    chrono::Local::now().format("%Y%m%d%H%M%S").to_string()
}

/// Validate a plugin name before it is used as a path component
pub fn validate_app_name(app: &str) -> Result<(), InstallError> {
    let valid = !app.is_empty()
        && app != BACKUPS_DIR
        && app
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(InstallError::Validation(format!(
            "invalid plugin name: {:?}",
            app
        )))
    }
}

/// Plugin lifecycle manager
pub struct Installer {
    layout: HostLayout,
    sql: Arc<dyn SqlExecutor>,
    host: Arc<dyn HostControl>,
    leases: Leases,
    merge_lock: Mutex<()>,
}

impl Installer {
    pub fn new(layout: HostLayout, sql: Arc<dyn SqlExecutor>, host: Arc<dyn HostControl>) -> Self {
        Self {
            layout,
            sql,
            host,
            leases: Leases::default(),
            merge_lock: Mutex::new(()),
        }
    }

    pub fn layout(&self) -> &HostLayout {
        &self.layout
    }

    pub fn host(&self) -> &Arc<dyn HostControl> {
        &self.host
    }

    fn ensure_dirs(&self) -> Result<(), InstallError> {
        fs::create_dir_all(&self.layout.install_dir)?;
        fs::create_dir_all(&self.layout.backups_dir)?;
        Ok(())
    }

    fn lease(&self, app: &str) -> Result<Lease<'_>, InstallError> {
        self.leases.try_acquire(app).ok_or_else(|| {
            InstallError::Conflict(format!("another operation is in progress for {}", app))
        })
    }

    /// Current install state. Never mutates anything.
    pub fn install_state(&self, app: &str) -> InstallState {
        let dir = self.layout.app_dir(app);
        if !dir.is_dir() {
            return InstallState::Uninstalled;
        }
        if let Some(state) = ManifestStore::read(&dir).state() {
            return state;
        }
        if archive::dir_is_empty(&dir) {
            InstallState::Uninstalled
        } else {
            InstallState::DirectoryOccupied
        }
    }

    /// Package paths and the host paths they deploy to
    pub fn allowed_paths(&self, app: &str) -> Vec<(PathBuf, PathBuf)> {
        let pkg = self.layout.app_dir(app);
        let views = Path::new("src").join("views").join(app);
        vec![
            (
                pkg.join("plugin").join(app),
                self.layout.base_dir.join("plugin").join(app),
            ),
            (
                pkg.join(self.layout.frontend_name()).join(&views),
                self.layout.frontend_dir.join(&views),
            ),
        ]
    }

    /// Accept an uploaded zip archive. The archive file is consumed.
    pub fn upload(&self, archive_path: &Path) -> Result<Manifest, InstallError> {
        self.ensure_dirs()?;
        let temp_zip = self.layout.install_dir.join(format!(
            "uploadTemp{}-{}.zip",
            timestamp(),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        ));
        archive::move_path(archive_path, &temp_zip)?;

        let extracted = archive::extract_archive(&temp_zip);
        archive::delete_tree(&temp_zip)?;
        let extracted = match extracted {
            Ok(dir) => dir,
            Err(e @ (ArchiveError::Zip(_) | ArchiveError::UnsafeEntry(_))) => {
                warn!(error = %e, "Rejected malformed upload");
                return Err(InstallError::Validation("invalid package".to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let info = ManifestStore::read(&extracted);
        let app = match info.app() {
            Some(app) if validate_app_name(&app).is_ok() => app,
            _ => {
                archive::delete_tree(&extracted)?;
                return Err(InstallError::Validation("invalid package".to_string()));
            }
        };

        let Some(_lease) = self.leases.try_acquire(&app) else {
            archive::delete_tree(&extracted)?;
            return Err(InstallError::Conflict(format!(
                "another operation is in progress for {}",
                app
            )));
        };

        let app_dir = self.layout.app_dir(&app);
        let mut upgrade = false;
        if app_dir.is_dir() {
            let old = ManifestStore::read(&app_dir);
            if old.app().is_some() {
                let candidate = version::bump_patch(&old.version().unwrap_or_default());
                upgrade = version::compare(&candidate, &info.version().unwrap_or_default());
                if !upgrade {
                    archive::delete_tree(&extracted)?;
                    return Err(InstallError::Conflict(format!("{} already exists", app)));
                }
            }

            if archive::dir_is_empty(&app_dir) {
                debug!(app = %app, "Removing empty plugin directory");
                archive::delete_tree(&app_dir)?;
            } else if !upgrade {
                archive::delete_tree(&extracted)?;
                return Err(InstallError::Conflict(format!(
                    "directory occupied: {}",
                    app_dir.display()
                )));
            }
        }

        let mut changes = Manifest::new();
        changes.set_state(&InstallState::WaitInstall);
        if upgrade {
            changes.set(KEY_UPDATE, 1i64);
            info!(app = %app, "Upgrading plugin, removing previous version");
            archive::delete_tree(&app_dir)?;
        }

        archive::move_path(&extracted, &app_dir)?;
        self.check_package(&app)?;
        ManifestStore::merge(&app_dir, &changes)?;

        info!(app = %app, version = ?info.version(), upgrade = upgrade, "Plugin uploaded");
        Ok(info)
    }

    /// Verify a plugin directory holds a complete manifest. Incomplete
    /// packages are deleted.
    pub fn check_package(&self, app: &str) -> Result<(), InstallError> {
        let dir = self.layout.app_dir(app);
        if !dir.is_dir() {
            return Err(InstallError::Validation(format!(
                "plugin directory does not exist: {}",
                app
            )));
        }
        let manifest = ManifestStore::read(&dir);
        let missing = manifest.missing_keys();
        if !missing.is_empty() {
            warn!(app = %app, missing = ?missing, "Incomplete plugin manifest, removing package");
            archive::delete_tree(&dir)?;
            return Err(InstallError::Integrity(format!(
                "incomplete configuration (missing {})",
                missing.join(", ")
            )));
        }
        Ok(())
    }

    /// Install (or upgrade) an uploaded plugin
    pub fn install(&self, app: &str) -> Result<InstallOutcome, InstallError> {
        validate_app_name(app)?;
        let _lease = self.lease(app)?;

        let state = self.install_state(app);
        match state {
            InstallState::Installed | InstallState::DirectoryOccupied => {
                return Err(InstallError::Conflict(format!("{} already exists", app)))
            }
            InstallState::DependentWaitInstall => {
                return Err(InstallError::Conflict(format!(
                    "{} is waiting on dependencies",
                    app
                )))
            }
            InstallState::Uninstalled | InstallState::Unknown(_) => {
                return Err(InstallError::Validation(format!(
                    "{} has not been uploaded",
                    app
                )))
            }
            InstallState::WaitInstall | InstallState::ConflictPending => {}
        }

        info!(app = %app, "Installing plugin");
        let dir = self.layout.app_dir(app);
        let mut manifest = ManifestStore::read(&dir);

        if state == InstallState::WaitInstall {
            import_sql(&dir.join("install.sql"), self.sql.as_ref())?;
        }

        if manifest.get(KEY_UPDATE).and_then(IniValue::as_i64) == Some(1) {
            import_sql(&dir.join("update.sql"), self.sql.as_ref())?;
            manifest.remove(KEY_UPDATE);
            ManifestStore::write(&dir, &manifest)?;
        }

        self.conflict_handle_locked(app)?;

        for (source, dest) in self.allowed_paths(app) {
            if !source.is_dir() {
                debug!(source = ?source, "No files to deploy");
                continue;
            }
            archive::copy_dir_recursive(&source, &dest).map_err(|e| {
                InstallError::Io(format!("deploying to {}: {}", dest.display(), e))
            })?;
            debug!(source = ?source, dest = ?dest, "Deployed plugin files");
        }

        self.update_handle_locked(app)?;

        let current = ManifestStore::read(&dir);
        let extend = format!("{}{}", MODULE_INSTALL_PREFIX, app);
        let mut pending = Vec::new();
        if current.flag(KEY_NPM_WAIT) {
            pending.push(PendingDependencyInstall {
                ecosystem: Ecosystem::Npm,
                command: self.layout.npm_command.clone(),
                extend: extend.clone(),
            });
        }
        if current.flag(KEY_COMPOSER_WAIT) {
            pending.push(PendingDependencyInstall {
                ecosystem: Ecosystem::Composer,
                command: self.layout.composer_command.clone(),
                extend,
            });
        }

        self.host.restart();
        info!(app = %app, state = %self.install_state(app), pending = pending.len(), "Plugin install finished");
        Ok(InstallOutcome { manifest, pending })
    }

    /// Remove an installed plugin, backing up its deployed files first.
    /// Returns the backup archive path when anything was deployed.
    pub fn uninstall(&self, app: &str) -> Result<Option<PathBuf>, InstallError> {
        validate_app_name(app)?;
        let _lease = self.lease(app)?;

        if self.install_state(app) != InstallState::Installed {
            return Err(InstallError::Conflict(format!(
                "{} is not fully installed",
                app
            )));
        }
        self.ensure_dirs()?;

        info!(app = %app, "Uninstalling plugin");
        let dir = self.layout.app_dir(app);
        import_sql(&dir.join("uninstall.sql"), self.sql.as_ref())?;

        let deployed: Vec<PathBuf> = self
            .allowed_paths(app)
            .into_iter()
            .map(|(_, dest)| dest)
            .filter(|dest| dest.is_dir())
            .collect();

        let backup = if deployed.is_empty() {
            None
        } else {
            let entries: Vec<(String, PathBuf)> = deployed
                .iter()
                .enumerate()
                .map(|(i, dest)| (format!("{}-{}", app, i + 1), dest.clone()))
                .collect();
            let zip = self
                .layout
                .backups_dir
                .join(format!("{}-uninstall-{}.zip", app, timestamp()));
            archive::zip_paths(&entries, &zip)?;
            info!(app = %app, backup = ?zip, "Backed up plugin files");
            Some(zip)
        };

        for dest in &deployed {
            archive::delete_tree(dest)?;
        }
        archive::delete_tree(&dir)?;

        self.host.restart();
        info!(app = %app, "Plugin uninstalled");
        Ok(backup)
    }

    /// Merge a plugin's declared dependencies into the host manifests.
    /// Returns false when the plugin is not in a state that needs it.
    pub fn depend_conflict_handle(&self, app: &str) -> Result<bool, InstallError> {
        validate_app_name(app)?;
        let _lease = self.leases.acquire(app);
        self.conflict_handle_locked(app)
    }

    fn conflict_handle_locked(&self, app: &str) -> Result<bool, InstallError> {
        let dir = self.layout.app_dir(app);
        let mut manifest = ManifestStore::read(&dir);
        match manifest.state() {
            Some(InstallState::WaitInstall) | Some(InstallState::ConflictPending) => {}
            _ => return Ok(false),
        }

        let depends = PluginDepends::load(&dir);
        if depends.is_empty() {
            manifest.set_state(&InstallState::Installed);
            ManifestStore::write(&dir, &manifest)?;
            return Ok(true);
        }

        // Host manifests are shared by all plugins
        let _merge = self.merge_lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut cover = Vec::new();
        if depends.has_backend() {
            cover.push(self.layout.composer_json());
        }
        if depends.has_frontend() {
            cover.push(self.layout.package_json());
        }
        cover.dedup();
        let root = self.layout.common_root();
        let entries: Vec<(String, PathBuf)> = cover
            .iter()
            .filter(|p| p.is_file())
            .map(|p| {
                let name = p
                    .strip_prefix(&root)
                    .map(|rel| rel.to_string_lossy().replace('\\', "/"))
                    .unwrap_or_else(|_| p.display().to_string());
                (name, p.clone())
            })
            .collect();
        if !entries.is_empty() {
            self.ensure_dirs()?;
            let zip = self
                .layout
                .backups_dir
                .join(format!("{}-cover-{}.zip", app, timestamp()));
            archive::zip_paths(&entries, &zip)?;
            info!(app = %app, backup = ?zip, "Backed up host dependency manifests");
        }

        let mut composer_changed = false;
        if depends.has_backend() {
            let mut composer = DependsFile::open(&self.layout.composer_json(), DependsKind::Composer)?;
            if !depends.composer_config.is_empty() {
                composer_changed |= composer.set_composer_config(&depends.composer_config, true);
            }
            composer_changed |= composer.add_depends(&depends.require, false, true)?;
            composer_changed |= composer.add_depends(&depends.require_dev, true, true)?;
            composer.save()?;
        }

        let mut npm_changed = false;
        if depends.has_frontend() {
            let mut npm = DependsFile::open(&self.layout.package_json(), DependsKind::Npm)?;
            npm_changed |= npm.add_depends(&depends.dependencies, false, true)?;
            npm_changed |= npm.add_depends(&depends.dev_dependencies, true, true)?;
            npm.save()?;
        }

        if npm_changed {
            manifest.set(KEY_NPM_WAIT, 1i64);
        }
        if composer_changed {
            manifest.set(KEY_COMPOSER_WAIT, 1i64);
        }
        let state = if npm_changed || composer_changed {
            InstallState::DependentWaitInstall
        } else {
            InstallState::Installed
        };
        manifest.set_state(&state);
        ManifestStore::write(&dir, &manifest)?;
        info!(app = %app, npm = npm_changed, composer = composer_changed, state = %state, "Merged plugin dependencies");
        Ok(true)
    }

    /// Mark a dependency install as finished. The plugin becomes INSTALLED
    /// once no wait flags remain.
    pub fn dependent_install_complete(&self, app: &str, ecosystem: Ecosystem) -> Result<(), InstallError> {
        validate_app_name(app)?;
        let _lease = self.leases.acquire(app);

        let dir = self.layout.app_dir(app);
        let mut manifest = ManifestStore::read(&dir);
        if manifest.state() != Some(InstallState::DependentWaitInstall) {
            debug!(app = %app, ecosystem = %ecosystem, "Plugin not waiting on dependencies");
            return Ok(());
        }
        match ecosystem {
            Ecosystem::Npm => {
                manifest.remove(KEY_NPM_WAIT);
            }
            Ecosystem::Composer => {
                manifest.remove(KEY_COMPOSER_WAIT);
            }
            Ecosystem::All => {
                manifest.remove(KEY_NPM_WAIT);
                manifest.remove(KEY_COMPOSER_WAIT);
            }
        }
        if !manifest.contains(KEY_NPM_WAIT) && !manifest.contains(KEY_COMPOSER_WAIT) {
            manifest.set_state(&InstallState::Installed);
        }
        ManifestStore::write(&dir, &manifest)?;
        info!(app = %app, ecosystem = %ecosystem, state = ?manifest.state(), "Dependency install completed");
        Ok(())
    }

    /// Promote a plugin stuck in DEPENDENT_WAIT_INSTALL with no pending
    /// flags to INSTALLED
    pub fn depend_update_handle(&self, app: &str) -> Result<(), InstallError> {
        validate_app_name(app)?;
        let _lease = self.leases.acquire(app);
        self.update_handle_locked(app)
    }

    fn update_handle_locked(&self, app: &str) -> Result<(), InstallError> {
        let dir = self.layout.app_dir(app);
        let mut manifest = ManifestStore::read(&dir);
        if manifest.state() == Some(InstallState::DependentWaitInstall)
            && !manifest.contains(KEY_NPM_WAIT)
            && !manifest.contains(KEY_COMPOSER_WAIT)
        {
            manifest.set_state(&InstallState::Installed);
            ManifestStore::write(&dir, &manifest)?;
        }
        Ok(())
    }

    /// Manifests of every plugin present in the install dir, sorted by name
    pub fn installed_list(&self) -> Vec<Manifest> {
        let Ok(entries) = fs::read_dir(&self.layout.install_dir) else {
            return Vec::new();
        };
        let mut dirs: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir() && p.file_name().is_some_and(|n| n != BACKUPS_DIR))
            .collect();
        dirs.sort();
        dirs.iter()
            .map(|d| ManifestStore::read(d))
            .filter(|m| m.contains(KEY_APP))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostError;
    use crate::sql::NullSqlExecutor;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    #[derive(Default)]
    struct CountingHost {
        restarts: AtomicUsize,
    }

    impl HostControl for CountingHost {
        fn graceful_restart(&self) -> Result<(), HostError> {
            self.restarts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn stop_all(&self) {}
    }

    struct Fixture {
        _tmp: TempDir,
        root: PathBuf,
        installer: Installer,
        host: Arc<CountingHost>,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_path_buf();
        let base = root.join("server");
        let frontend = root.join("web");
        fs::create_dir_all(&base).unwrap();
        fs::create_dir_all(&frontend).unwrap();
        let layout = HostLayout::new(base.join("runtime/packages"), base, frontend);
        let host = Arc::new(CountingHost::default());
        let installer = Installer::new(layout, Arc::new(NullSqlExecutor), host.clone());
        Fixture {
            _tmp: tmp,
            root,
            installer,
            host,
        }
    }

    fn info_ini(app: &str, version: &str) -> String {
        format!(
            "app = {}\ntitle = Shop\nabout = A shop\nauthor = dev\nversion = {}\nstate = 0\n",
            app, version
        )
    }

    fn package(root: &Path, name: &str, files: &[(&str, &str)]) -> PathBuf {
        let path = root.join(name);
        let mut zip = ZipWriter::new(fs::File::create(&path).unwrap());
        for (entry, content) in files {
            zip.start_file(*entry, SimpleFileOptions::default()).unwrap();
            zip.write_all(content.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
        path
    }

    #[test]
    fn test_install_state_resolution() {
        let f = fixture();
        assert_eq!(f.installer.install_state("shop"), InstallState::Uninstalled);

        let dir = f.installer.layout().app_dir("shop");
        fs::create_dir_all(&dir).unwrap();
        assert_eq!(f.installer.install_state("shop"), InstallState::Uninstalled);

        fs::write(dir.join("readme.txt"), "x").unwrap();
        assert_eq!(f.installer.install_state("shop"), InstallState::DirectoryOccupied);

        fs::write(dir.join("info.ini"), "app = shop\nstate = 4\n").unwrap();
        assert_eq!(
            f.installer.install_state("shop"),
            InstallState::DependentWaitInstall
        );

        fs::write(dir.join("info.ini"), "app = shop\nstate = weird\n").unwrap();
        assert_eq!(
            f.installer.install_state("shop"),
            InstallState::Unknown("weird".to_string())
        );
    }

    #[test]
    fn test_allowed_paths() {
        let f = fixture();
        let paths = f.installer.allowed_paths("shop");
        let pkg = f.installer.layout().app_dir("shop");
        assert_eq!(paths.len(), 2);
        assert_eq!(paths[0].0, pkg.join("plugin/shop"));
        assert_eq!(paths[0].1, f.root.join("server/plugin/shop"));
        assert_eq!(paths[1].0, pkg.join("web/src/views/shop"));
        assert_eq!(paths[1].1, f.root.join("web/src/views/shop"));
    }

    #[test]
    fn test_upload_rejects_non_zip_without_leftovers() {
        let f = fixture();
        let bogus = f.root.join("bogus.zip");
        fs::write(&bogus, b"this is not a zip").unwrap();

        let err = f.installer.upload(&bogus).unwrap_err();
        assert!(matches!(err, InstallError::Validation(_)), "{err:?}");

        let mut left: Vec<String> = fs::read_dir(&f.installer.layout().install_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        left.sort();
        assert_eq!(left, vec![BACKUPS_DIR.to_string()]);
    }

    #[test]
    fn test_upload_sets_wait_install() {
        let f = fixture();
        let zip = package(
            &f.root,
            "shop.zip",
            &[("info.ini", &info_ini("shop", "1.0.0")), ("plugin/shop/a.txt", "a")],
        );

        let info = f.installer.upload(&zip).unwrap();
        assert_eq!(info.app().as_deref(), Some("shop"));
        assert!(!zip.exists());
        assert_eq!(f.installer.install_state("shop"), InstallState::WaitInstall);
        let manifest = ManifestStore::read(&f.installer.layout().app_dir("shop"));
        assert!(!manifest.contains(KEY_UPDATE));
    }

    #[test]
    fn test_upload_without_app_is_rejected_and_cleaned() {
        let f = fixture();
        let zip = package(&f.root, "bad.zip", &[("info.ini", "title = nothing\n")]);

        let err = f.installer.upload(&zip).unwrap_err();
        assert!(matches!(err, InstallError::Validation(_)));
        let leftovers: Vec<_> = fs::read_dir(&f.installer.layout().install_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name() != BACKUPS_DIR)
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_upload_incomplete_manifest_is_purged() {
        let f = fixture();
        let zip = package(&f.root, "p.zip", &[("info.ini", "app = shop\nversion = 1.0.0\n")]);

        let err = f.installer.upload(&zip).unwrap_err();
        assert!(matches!(err, InstallError::Integrity(_)));
        assert!(!f.installer.layout().app_dir("shop").exists());
    }

    #[test]
    fn test_upload_upgrade_rules() {
        let f = fixture();
        let dir = f.installer.layout().app_dir("shop");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("info.ini"), info_ini("shop", "1.0.0").replace("state = 0", "state = 1")).unwrap();

        let same = package(&f.root, "same.zip", &[("info.ini", &info_ini("shop", "1.0.0"))]);
        let err = f.installer.upload(&same).unwrap_err();
        assert!(matches!(err, InstallError::Conflict(_)));
        assert_eq!(f.installer.install_state("shop"), InstallState::Installed);

        let next = package(&f.root, "next.zip", &[("info.ini", &info_ini("shop", "1.0.1"))]);
        f.installer.upload(&next).unwrap();
        let manifest = ManifestStore::read(&dir);
        assert_eq!(manifest.state(), Some(InstallState::WaitInstall));
        assert!(manifest.flag(KEY_UPDATE));
        assert_eq!(manifest.version().as_deref(), Some("1.0.1"));
    }

    #[test]
    fn test_upload_into_occupied_directory() {
        let f = fixture();
        let dir = f.installer.layout().app_dir("shop");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("stray.txt"), "x").unwrap();

        let zip = package(&f.root, "shop.zip", &[("info.ini", &info_ini("shop", "1.0.0"))]);
        let err = f.installer.upload(&zip).unwrap_err();
        assert!(matches!(err, InstallError::Conflict(_)));
        assert!(dir.join("stray.txt").exists());
    }

    #[test]
    fn test_install_without_dependencies() {
        let f = fixture();
        let zip = package(
            &f.root,
            "shop.zip",
            &[
                ("info.ini", &info_ini("shop", "1.0.0")),
                ("plugin/shop/app.php", "<?php"),
                ("web/src/views/shop/index.vue", "<template/>"),
            ],
        );
        f.installer.upload(&zip).unwrap();

        let outcome = f.installer.install("shop").unwrap();
        assert!(outcome.pending.is_empty());
        assert_eq!(f.installer.install_state("shop"), InstallState::Installed);
        assert!(f.root.join("server/plugin/shop/app.php").exists());
        assert!(f.root.join("web/src/views/shop/index.vue").exists());
        assert_eq!(f.host.restarts.load(Ordering::SeqCst), 1);

        let err = f.installer.install("shop").unwrap_err();
        assert!(matches!(err, InstallError::Conflict(_)));
    }

    #[test]
    fn test_install_not_uploaded() {
        let f = fixture();
        let err = f.installer.install("ghost").unwrap_err();
        assert!(matches!(err, InstallError::Validation(_)));
        assert!(!f.installer.layout().app_dir("ghost").exists());
    }

    #[test]
    fn test_install_with_dependencies_and_completion() {
        let f = fixture();
        fs::write(
            f.root.join("server/composer.json"),
            r#"{"require":{"php":">=8.0"}}"#,
        )
        .unwrap();
        fs::write(f.root.join("web/package.json"), r#"{"dependencies":{}}"#).unwrap();

        let zip = package(
            &f.root,
            "shop.zip",
            &[
                ("info.ini", &info_ini("shop", "1.0.0")),
                (
                    "config.json",
                    r#"{"require":{"acme/pay":"^2.0"},"dependencies":{"chart.js":"^4"}}"#,
                ),
            ],
        );
        f.installer.upload(&zip).unwrap();
        let outcome = f.installer.install("shop").unwrap();

        assert_eq!(
            f.installer.install_state("shop"),
            InstallState::DependentWaitInstall
        );
        assert_eq!(outcome.pending.len(), 2);
        assert_eq!(outcome.pending[0].ecosystem, Ecosystem::Npm);
        assert_eq!(outcome.pending[0].command, "web-install.pnpm");
        assert_eq!(outcome.pending[1].extend, "module-install:shop");

        let backups: Vec<_> = fs::read_dir(&f.installer.layout().backups_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(backups.len(), 1);
        assert!(backups[0].starts_with("shop-cover-"));

        let composer = fs::read_to_string(f.root.join("server/composer.json")).unwrap();
        assert!(composer.contains("acme/pay"));

        let err = f.installer.install("shop").unwrap_err();
        assert!(matches!(err, InstallError::Conflict(_)));

        f.installer
            .dependent_install_complete("shop", Ecosystem::Npm)
            .unwrap();
        assert_eq!(
            f.installer.install_state("shop"),
            InstallState::DependentWaitInstall
        );
        f.installer
            .dependent_install_complete("shop", Ecosystem::Composer)
            .unwrap();
        assert_eq!(f.installer.install_state("shop"), InstallState::Installed);
    }

    #[test]
    fn test_dependencies_already_present_install_directly() {
        let f = fixture();
        fs::write(f.root.join("web/package.json"), r#"{"dependencies":{"vue":"^3"}}"#).unwrap();
        let zip = package(
            &f.root,
            "shop.zip",
            &[
                ("info.ini", &info_ini("shop", "1.0.0")),
                ("config.json", r#"{"dependencies":{"vue":"^3"}}"#),
            ],
        );
        f.installer.upload(&zip).unwrap();
        let outcome = f.installer.install("shop").unwrap();
        assert!(outcome.pending.is_empty());
        assert_eq!(f.installer.install_state("shop"), InstallState::Installed);
    }

    #[test]
    fn test_complete_all_and_wrong_state() {
        let f = fixture();
        let dir = f.installer.layout().app_dir("shop");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("info.ini"),
            "app = shop\nstate = 4\nnpm_dependent_wait_install = 1\ncomposer_dependent_wait_install = 1\n",
        )
        .unwrap();
        f.installer
            .dependent_install_complete("shop", Ecosystem::All)
            .unwrap();
        let manifest = ManifestStore::read(&dir);
        assert_eq!(manifest.state(), Some(InstallState::Installed));
        assert!(!manifest.contains(KEY_NPM_WAIT));

        // no-op outside DEPENDENT_WAIT_INSTALL
        fs::write(dir.join("info.ini"), "app = shop\nstate = 2\n").unwrap();
        f.installer
            .dependent_install_complete("shop", Ecosystem::All)
            .unwrap();
        assert_eq!(f.installer.install_state("shop"), InstallState::WaitInstall);
    }

    #[test]
    fn test_depend_update_handle_promotes() {
        let f = fixture();
        let dir = f.installer.layout().app_dir("shop");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("info.ini"), "app = shop\nstate = 4\n").unwrap();
        f.installer.depend_update_handle("shop").unwrap();
        assert_eq!(f.installer.install_state("shop"), InstallState::Installed);
    }

    #[test]
    fn test_conflict_handle_skips_other_states() {
        let f = fixture();
        let dir = f.installer.layout().app_dir("shop");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("info.ini"), "app = shop\nstate = 1\n").unwrap();
        assert!(!f.installer.depend_conflict_handle("shop").unwrap());
    }

    #[test]
    fn test_uninstall_backs_up_and_removes() {
        let f = fixture();
        let zip = package(
            &f.root,
            "shop.zip",
            &[
                ("info.ini", &info_ini("shop", "1.0.0")),
                ("plugin/shop/app.php", "<?php"),
            ],
        );
        f.installer.upload(&zip).unwrap();
        f.installer.install("shop").unwrap();

        let backup = f.installer.uninstall("shop").unwrap().unwrap();
        assert!(backup
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("shop-uninstall-"));
        assert!(!f.root.join("server/plugin/shop").exists());
        assert!(!f.installer.layout().app_dir("shop").exists());
        assert_eq!(f.installer.install_state("shop"), InstallState::Uninstalled);

        let mut archive = zip::ZipArchive::new(fs::File::open(&backup).unwrap()).unwrap();
        assert!(archive.by_name("shop-1/app.php").is_ok());
    }

    #[test]
    fn test_uninstall_requires_installed() {
        let f = fixture();
        let zip = package(&f.root, "shop.zip", &[("info.ini", &info_ini("shop", "1.0.0"))]);
        f.installer.upload(&zip).unwrap();

        let err = f.installer.uninstall("shop").unwrap_err();
        assert!(matches!(err, InstallError::Conflict(_)));
        assert_eq!(f.installer.install_state("shop"), InstallState::WaitInstall);
    }

    #[test]
    fn test_lease_blocks_concurrent_operations() {
        let f = fixture();
        let lease = f.installer.leases.try_acquire("shop").unwrap();
        let err = f.installer.install("shop").unwrap_err();
        assert!(matches!(err, InstallError::Conflict(_)));
        drop(lease);
        assert!(f.installer.leases.try_acquire("shop").is_some());
    }

    #[test]
    fn test_installed_list_and_names() {
        let f = fixture();
        let zip = package(&f.root, "shop.zip", &[("info.ini", &info_ini("shop", "1.0.0"))]);
        f.installer.upload(&zip).unwrap();
        fs::create_dir_all(f.installer.layout().app_dir("empty")).unwrap();

        let list = f.installer.installed_list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].app().as_deref(), Some("shop"));

        assert!(validate_app_name("shop_v2-x").is_ok());
        assert!(validate_app_name("../etc").is_err());
        assert!(validate_app_name("backups").is_err());
        assert!("composer".parse::<Ecosystem>().is_ok());
        assert!("pip".parse::<Ecosystem>().is_err());
    }
}
