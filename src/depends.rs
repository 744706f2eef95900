//! Dependency merger for the host's `composer.json` (backend) and
//! `package.json` (frontend) manifests.

use serde_json::{Map, Value};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Plugin-local file declaring dependencies
pub const PLUGIN_DEPENDS_FILE: &str = "config.json";

#[derive(Debug, Error)]
pub enum DependsError {
    #[error("Failed to read {path}: {message}")]
    Read { path: PathBuf, message: String },

    #[error("Invalid JSON in {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("{path} is not a JSON object")]
    NotAnObject { path: PathBuf },

    #[error("Failed to write {path}: {message}")]
    Write { path: PathBuf, message: String },

    #[error("Dependency conflict for {package}: existing {existing}, requested {requested}")]
    Conflict {
        package: String,
        existing: String,
        requested: String,
    },
}

/// Which package manager a manifest belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DependsKind {
    Composer,
    Npm,
}

impl DependsKind {
    fn block_key(&self, is_dev: bool) -> &'static str {
        match (self, is_dev) {
            (Self::Composer, false) => "require",
            (Self::Composer, true) => "require-dev",
            (Self::Npm, false) => "dependencies",
            (Self::Npm, true) => "devDependencies",
        }
    }

    fn indent(&self) -> &'static [u8] {
        match self {
            Self::Composer => b"    ",
            Self::Npm => b"  ",
        }
    }

    pub fn file_name(&self) -> &'static str {
        match self {
            Self::Composer => "composer.json",
            Self::Npm => "package.json",
        }
    }
}

impl fmt::Display for DependsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Composer => write!(f, "composer"),
            Self::Npm => write!(f, "npm"),
        }
    }
}

/// A host dependency manifest opened for merging
pub struct DependsFile {
    path: PathBuf,
    kind: DependsKind,
    root: Map<String, Value>,
    dirty: bool,
}

impl DependsFile {
    /// Load a manifest. A missing file starts as an empty object.
    pub fn open(path: &Path, kind: DependsKind) -> Result<Self, DependsError> {
        let root = if path.is_file() {
            let content = fs::read_to_string(path).map_err(|e| DependsError::Read {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
            let value: Value =
                serde_json::from_str(&content).map_err(|e| DependsError::Parse {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                })?;
            match value {
                Value::Object(map) => map,
                _ => {
                    return Err(DependsError::NotAnObject {
                        path: path.to_path_buf(),
                    })
                }
            }
        } else {
            Map::new()
        };
        Ok(Self {
            path: path.to_path_buf(),
            kind,
            root,
            dirty: false,
        })
    }

    /// Current block contents (`require`, `devDependencies`, ...)
    pub fn block(&self, is_dev: bool) -> Option<&Map<String, Value>> {
        self.root
            .get(self.kind.block_key(is_dev))
            .and_then(Value::as_object)
    }

    /// Merge packages into the runtime or dev block.
    ///
    /// With `overwrite` the incoming constraint wins on collision; without it
    /// a collision with a different constraint is a conflict and nothing is
    /// changed. Returns whether any key was added or modified.
    pub fn add_depends(
        &mut self,
        depends: &Map<String, Value>,
        is_dev: bool,
        overwrite: bool,
    ) -> Result<bool, DependsError> {
        if depends.is_empty() {
            return Ok(false);
        }
        let key = self.kind.block_key(is_dev);
        let block = self
            .root
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !block.is_object() {
            *block = Value::Object(Map::new());
        }
        let Value::Object(block) = block else {
            return Ok(false);
        };

        if !overwrite {
            for (package, requested) in depends {
                if let Some(existing) = block.get(package) {
                    if existing != requested {
                        return Err(DependsError::Conflict {
                            package: package.clone(),
                            existing: value_text(existing),
                            requested: value_text(requested),
                        });
                    }
                }
            }
        }

        let mut changed = false;
        for (package, constraint) in depends {
            if block.get(package) != Some(constraint) {
                block.insert(package.clone(), constraint.clone());
                changed = true;
            }
        }
        if changed {
            self.dirty = true;
            debug!(path = ?self.path, block = key, "Merged dependencies");
        }
        Ok(changed)
    }

    /// Merge a `composerConfig` object into the manifest one level deep:
    /// object values are merged key by key, everything else is replaced.
    /// Without `overwrite` existing keys are left untouched.
    pub fn set_composer_config(&mut self, config: &Map<String, Value>, overwrite: bool) -> bool {
        let mut changed = false;
        for (key, incoming) in config {
            match (self.root.get_mut(key), incoming) {
                (Some(Value::Object(existing)), Value::Object(fields)) => {
                    for (field, value) in fields {
                        let present = existing.get(field);
                        if present == Some(value) || (present.is_some() && !overwrite) {
                            continue;
                        }
                        existing.insert(field.clone(), value.clone());
                        changed = true;
                    }
                }
                (Some(existing), _) => {
                    if overwrite && existing != incoming {
                        *existing = incoming.clone();
                        changed = true;
                    }
                }
                (None, _) => {
                    self.root.insert(key.clone(), incoming.clone());
                    changed = true;
                }
            }
        }
        if changed {
            self.dirty = true;
        }
        changed
    }

    /// Write the manifest back if anything changed
    pub fn save(&mut self) -> Result<bool, DependsError> {
        if !self.dirty {
            return Ok(false);
        }
        let write_err = |message: String| DependsError::Write {
            path: self.path.clone(),
            message,
        };
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(self.kind.indent());
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        serde::Serialize::serialize(&self.root, &mut ser).map_err(|e| write_err(e.to_string()))?;
        buf.push(b'\n');
        fs::write(&self.path, buf).map_err(|e| write_err(e.to_string()))?;
        self.dirty = false;
        info!(path = ?self.path, kind = %self.kind, "Saved dependency manifest");
        Ok(true)
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Dependencies declared by a plugin in its `config.json`
#[derive(Debug, Default, Clone)]
pub struct PluginDepends {
    pub require: Map<String, Value>,
    pub require_dev: Map<String, Value>,
    pub dependencies: Map<String, Value>,
    pub dev_dependencies: Map<String, Value>,
    pub composer_config: Map<String, Value>,
}

impl PluginDepends {
    /// Load from `<plugin_dir>/config.json`. Missing or malformed files yield
    /// no dependencies.
    pub fn load(plugin_dir: &Path) -> Self {
        let path = plugin_dir.join(PLUGIN_DEPENDS_FILE);
        let Ok(content) = fs::read_to_string(&path) else {
            return Self::default();
        };
        let root = match serde_json::from_str::<Value>(&content) {
            Ok(Value::Object(map)) => map,
            Ok(_) => {
                warn!(path = ?path, "Plugin config.json is not an object, ignoring");
                return Self::default();
            }
            Err(e) => {
                warn!(path = ?path, error = %e, "Invalid plugin config.json, ignoring");
                return Self::default();
            }
        };
        let block = |key: &str| {
            root.get(key)
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default()
        };
        Self {
            require: block("require"),
            require_dev: block("require-dev"),
            dependencies: block("dependencies"),
            dev_dependencies: block("devDependencies"),
            composer_config: block("composerConfig"),
        }
    }

    pub fn has_backend(&self) -> bool {
        !self.require.is_empty() || !self.require_dev.is_empty()
    }

    pub fn has_frontend(&self) -> bool {
        !self.dependencies.is_empty() || !self.dev_dependencies.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_backend() && !self.has_frontend()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn obj(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_add_depends_union_and_changed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("package.json");
        fs::write(&path, r#"{"name":"web","dependencies":{"vue":"^3.0.0"}}"#).unwrap();

        let mut file = DependsFile::open(&path, DependsKind::Npm).unwrap();
        let changed = file
            .add_depends(&obj(json!({"vue": "^3.0.0", "axios": "^1.0.0"})), false, true)
            .unwrap();
        assert!(changed);
        let unchanged = file
            .add_depends(&obj(json!({"axios": "^1.0.0"})), false, true)
            .unwrap();
        assert!(!unchanged);

        assert!(file.save().unwrap());
        let written = fs::read_to_string(&path).unwrap();
        assert!(written.ends_with("}\n"));
        assert!(written.contains("\n  \"dependencies\""));
        let parsed: Value = serde_json::from_str(&written).unwrap();
        assert_eq!(parsed["dependencies"]["axios"], "^1.0.0");
        // key order preserved
        assert!(written.find("\"name\"").unwrap() < written.find("\"dependencies\"").unwrap());
    }

    #[test]
    fn test_add_depends_conflict_without_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("composer.json");
        fs::write(&path, r#"{"require":{"php":">=8.0"}}"#).unwrap();

        let mut file = DependsFile::open(&path, DependsKind::Composer).unwrap();
        let err = file
            .add_depends(&obj(json!({"php": ">=8.1"})), false, false)
            .unwrap_err();
        assert!(matches!(err, DependsError::Conflict { .. }));

        let changed = file
            .add_depends(&obj(json!({"php": ">=8.1"})), false, true)
            .unwrap();
        assert!(changed);
        assert_eq!(file.block(false).unwrap()["php"], ">=8.1");
    }

    #[test]
    fn test_save_untouched_is_noop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("composer.json");
        fs::write(&path, "{\"require\":{}}").unwrap();

        let mut file = DependsFile::open(&path, DependsKind::Composer).unwrap();
        assert!(!file.save().unwrap());
        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"require\":{}}");
    }

    #[test]
    fn test_composer_indent_and_dev_block() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("composer.json");

        let mut file = DependsFile::open(&path, DependsKind::Composer).unwrap();
        file.add_depends(&obj(json!({"phpunit/phpunit": "^10"})), true, true)
            .unwrap();
        file.save().unwrap();
        let written = fs::read_to_string(&path).unwrap();
        assert!(written.contains("\n    \"require-dev\""));
    }

    #[test]
    fn test_set_composer_config_one_level_merge() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("composer.json");
        fs::write(
            &path,
            r#"{"config":{"sort-packages":true},"minimum-stability":"stable"}"#,
        )
        .unwrap();

        let mut file = DependsFile::open(&path, DependsKind::Composer).unwrap();
        let changed = file.set_composer_config(
            &obj(json!({
                "config": {"optimize-autoloader": true},
                "minimum-stability": "dev",
                "prefer-stable": true
            })),
            true,
        );
        assert!(changed);
        file.save().unwrap();

        let parsed: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed["config"]["sort-packages"], true);
        assert_eq!(parsed["config"]["optimize-autoloader"], true);
        assert_eq!(parsed["minimum-stability"], "dev");
        assert_eq!(parsed["prefer-stable"], true);
    }

    #[test]
    fn test_plugin_depends_load() {
        let dir = TempDir::new().unwrap();
        assert!(PluginDepends::load(dir.path()).is_empty());

        fs::write(dir.path().join(PLUGIN_DEPENDS_FILE), "not json").unwrap();
        assert!(PluginDepends::load(dir.path()).is_empty());

        fs::write(
            dir.path().join(PLUGIN_DEPENDS_FILE),
            r#"{"require":{"a/b":"^1"},"devDependencies":{"vite":"^5"},"dependencies":{}}"#,
        )
        .unwrap();
        let depends = PluginDepends::load(dir.path());
        assert!(depends.has_backend());
        assert!(depends.has_frontend());
        assert!(depends.dependencies.is_empty());
        assert_eq!(depends.dev_dependencies["vite"], "^5");
    }
}
