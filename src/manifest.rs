//! Manifest Store - typed key/value descriptor kept in every plugin directory.
//!
//! Each plugin carries an `info.ini` next to its code:
//!
//! ```ini
//! app = shop
//! title = Shop
//! about = "Storefront module"
//! author = acme
//! version = 1.2.0
//! state = 2
//! npm_dependent_wait_install = 1
//!
//! [menu]
//! icon = cart
//! ```
//!
//! Values are typed on read (integers, booleans, null, strings) and written
//! back so that the next read yields the same types. Key order is preserved.

use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// File name of the plugin manifest inside a plugin directory
pub const MANIFEST_FILE: &str = "info.ini";

/// Keys that must all be present for a manifest to be considered complete
pub const REQUIRED_KEYS: [&str; 6] = ["app", "title", "about", "author", "version", "state"];

pub const KEY_APP: &str = "app";
pub const KEY_VERSION: &str = "version";
pub const KEY_STATE: &str = "state";
pub const KEY_UPDATE: &str = "update";
pub const KEY_NPM_WAIT: &str = "npm_dependent_wait_install";
pub const KEY_COMPOSER_WAIT: &str = "composer_dependent_wait_install";

// ---------------------------------------------------------------------------
// Install state
// ---------------------------------------------------------------------------

/// Install state of a plugin. Exactly one value at a time per plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallState {
    Uninstalled,
    Installed,
    WaitInstall,
    ConflictPending,
    DependentWaitInstall,
    DirectoryOccupied,
    /// A `state` value on disk that is not one of the known codes
    Unknown(String),
}

impl InstallState {
    /// Numeric code as stored in `info.ini`
    pub fn code(&self) -> Option<i64> {
        match self {
            Self::Uninstalled => Some(0),
            Self::Installed => Some(1),
            Self::WaitInstall => Some(2),
            Self::ConflictPending => Some(3),
            Self::DependentWaitInstall => Some(4),
            Self::DirectoryOccupied => Some(5),
            Self::Unknown(_) => None,
        }
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            0 => Self::Uninstalled,
            1 => Self::Installed,
            2 => Self::WaitInstall,
            3 => Self::ConflictPending,
            4 => Self::DependentWaitInstall,
            5 => Self::DirectoryOccupied,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Resolve a raw manifest value into a state
    pub fn from_value(value: &IniValue) -> Self {
        match value.as_i64() {
            Some(code) => Self::from_code(code),
            None => Self::Unknown(value.to_string()),
        }
    }

    /// Value to persist for this state
    pub fn to_value(&self) -> IniValue {
        match self.code() {
            Some(code) => IniValue::Int(code),
            None => match self {
                Self::Unknown(raw) => IniValue::Str(raw.clone()),
                _ => IniValue::Null,
            },
        }
    }
}

impl fmt::Display for InstallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninstalled => write!(f, "uninstalled"),
            Self::Installed => write!(f, "installed"),
            Self::WaitInstall => write!(f, "wait_install"),
            Self::ConflictPending => write!(f, "conflict_pending"),
            Self::DependentWaitInstall => write!(f, "dependent_wait_install"),
            Self::DirectoryOccupied => write!(f, "directory_occupied"),
            Self::Unknown(raw) => write!(f, "unknown({})", raw),
        }
    }
}

impl Serialize for InstallState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Unknown(raw) => serializer.serialize_str(raw),
            known => serializer.serialize_i64(known.code().unwrap_or_default()),
        }
    }
}

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// A typed manifest value
#[derive(Debug, Clone, PartialEq)]
pub enum IniValue {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    /// Named section holding grouped scalar values
    Section(Vec<(String, IniValue)>),
}

impl IniValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            Self::Bool(b) => Some(i64::from(*b)),
            Self::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// True for values a reader would treat as "set": non-zero ints, true,
    /// non-empty strings
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Bool(b) => *b,
            Self::Int(n) => *n != 0,
            Self::Str(s) => !s.is_empty() && s != "0",
            Self::Section(entries) => !entries.is_empty(),
        }
    }

    /// Parse an unquoted scalar the way a typed INI scanner does
    fn parse_scalar(raw: &str) -> Self {
        let raw = raw.trim();
        if let Some(quoted) = unquote(raw) {
            return Self::Str(quoted);
        }
        match raw.to_ascii_lowercase().as_str() {
            "true" | "on" | "yes" => return Self::Bool(true),
            "false" | "off" | "no" | "none" => return Self::Bool(false),
            "null" => return Self::Null,
            _ => {}
        }
        if looks_like_int(raw) {
            if let Ok(n) = raw.parse::<i64>() {
                return Self::Int(n);
            }
        }
        Self::Str(raw.to_string())
    }

    /// Render a scalar so that `parse_scalar` yields the same value back
    fn render_scalar(&self) -> String {
        match self {
            Self::Null => "null".to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Int(n) => n.to_string(),
            Self::Str(s) => {
                if needs_quoting(s) {
                    quote(s)
                } else {
                    s.clone()
                }
            }
            Self::Section(_) => String::new(),
        }
    }
}

impl fmt::Display for IniValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => write!(f, "{}", s),
            Self::Section(entries) => write!(f, "[{} keys]", entries.len()),
            scalar => write!(f, "{}", scalar.render_scalar()),
        }
    }
}

impl From<&str> for IniValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for IniValue {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<i64> for IniValue {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<bool> for IniValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl Serialize for IniValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_none(),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Int(n) => serializer.serialize_i64(*n),
            Self::Str(s) => serializer.serialize_str(s),
            Self::Section(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (k, v) in entries {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
        }
    }
}

fn looks_like_int(raw: &str) -> bool {
    let digits = raw.strip_prefix(['-', '+']).unwrap_or(raw);
    !digits.is_empty()
        && digits.chars().all(|c| c.is_ascii_digit())
        // "007" would come back as 7
        && (digits.len() == 1 || !digits.starts_with('0'))
}

fn needs_quoting(s: &str) -> bool {
    if s.is_empty() || s.trim() != s {
        return true;
    }
    if s.contains(['"', ';', '#', '=', '[', ']', '\n', '\r', '\\']) {
        return true;
    }
    // Anything that would come back typed differently
    !matches!(IniValue::parse_scalar(s), IniValue::Str(ref parsed) if parsed == s)
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

fn unquote(raw: &str) -> Option<String> {
    let inner = raw
        .strip_prefix('"')
        .and_then(|r| r.strip_suffix('"'))
        .filter(|_| raw.len() >= 2)?;
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('r') => out.push('\r'),
                Some(other) => out.push(other),
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    Some(out)
}

/// Strip a trailing `;` comment from an unquoted value
fn strip_inline_comment(raw: &str) -> &str {
    let trimmed = raw.trim();
    if trimmed.starts_with('"') {
        return trimmed;
    }
    match trimmed.find(';') {
        Some(pos) => trimmed[..pos].trim_end(),
        None => trimmed,
    }
}

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

/// An ordered, typed plugin manifest
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Manifest {
    entries: Vec<(String, IniValue)>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse manifest text. Malformed lines are skipped.
    pub fn parse(content: &str) -> Self {
        let mut manifest = Self::new();
        let mut section: Option<(String, Vec<(String, IniValue)>)> = None;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }
            if line.starts_with('[') && line.ends_with(']') {
                if let Some((name, entries)) = section.take() {
                    manifest.set(name, IniValue::Section(entries));
                }
                let name = line[1..line.len() - 1].trim().to_string();
                section = Some((name, Vec::new()));
                continue;
            }
            let Some((key, raw)) = line.split_once('=') else {
                debug!(line = %line, "Skipping malformed manifest line");
                continue;
            };
            let key = key.trim().to_string();
            if key.is_empty() {
                continue;
            }
            let value = IniValue::parse_scalar(strip_inline_comment(raw));
            match section.as_mut() {
                Some((_, entries)) => upsert(entries, key, value),
                None => manifest.set(key, value),
            }
        }
        if let Some((name, entries)) = section.take() {
            manifest.set(name, IniValue::Section(entries));
        }
        manifest
    }

    /// Render to manifest text: top-level scalars first, then sections
    pub fn render(&self) -> String {
        let mut lines = Vec::new();
        for (key, value) in &self.entries {
            if !matches!(value, IniValue::Section(_)) {
                lines.push(format!("{} = {}", key, value.render_scalar()));
            }
        }
        for (key, value) in &self.entries {
            if let IniValue::Section(entries) = value {
                lines.push(format!("[{}]", key));
                for (k, v) in entries {
                    lines.push(format!("{} = {}", k, v.render_scalar()));
                }
            }
        }
        let mut out = lines.join("\n");
        out.push('\n');
        out
    }

    pub fn get(&self, key: &str) -> Option<&IniValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Insert or replace a value, keeping the original position of an
    /// existing key
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<IniValue>) {
        upsert(&mut self.entries, key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<IniValue> {
        let pos = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(pos).1)
    }

    /// Overlay every entry of `other` onto this manifest
    pub fn merge(&mut self, other: &Manifest) {
        for (k, v) in &other.entries {
            self.set(k.clone(), v.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    /// String view of a key (integers and booleans rendered as text)
    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            IniValue::Null | IniValue::Section(_) => None,
            IniValue::Str(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Plugin identifier, if present and non-empty
    pub fn app(&self) -> Option<String> {
        self.get_str(KEY_APP).filter(|s| !s.trim().is_empty())
    }

    pub fn version(&self) -> Option<String> {
        self.get_str(KEY_VERSION)
    }

    /// Stored state, if the manifest has a `state` key
    pub fn state(&self) -> Option<InstallState> {
        self.get(KEY_STATE).map(InstallState::from_value)
    }

    pub fn set_state(&mut self, state: &InstallState) {
        self.set(KEY_STATE, state.to_value());
    }

    /// Whether an optional flag key is present and set
    pub fn flag(&self, key: &str) -> bool {
        self.get(key).is_some_and(IniValue::is_truthy)
    }

    /// Required keys that are missing
    pub fn missing_keys(&self) -> Vec<&'static str> {
        REQUIRED_KEYS
            .iter()
            .copied()
            .filter(|k| !self.contains(k))
            .collect()
    }

    /// Complete iff every required key is present
    pub fn is_complete(&self) -> bool {
        self.missing_keys().is_empty()
    }
}

fn upsert(entries: &mut Vec<(String, IniValue)>, key: String, value: IniValue) {
    if let Some(slot) = entries.iter_mut().find(|(k, _)| *k == key) {
        slot.1 = value;
    } else {
        entries.push((key, value));
    }
}

impl Serialize for Manifest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Errors raised when persisting a manifest
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Manifest not writable at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Reads and writes `info.ini` inside plugin directories
pub struct ManifestStore;

impl ManifestStore {
    pub fn path(dir: &Path) -> PathBuf {
        dir.join(MANIFEST_FILE)
    }

    /// Read a plugin manifest. Missing or unreadable files yield an empty
    /// manifest.
    pub fn read(dir: &Path) -> Manifest {
        let path = Self::path(dir);
        if !path.is_file() {
            return Manifest::new();
        }
        match fs::read_to_string(&path) {
            Ok(content) => Manifest::parse(&content),
            Err(e) => {
                warn!(path = ?path, error = %e, "Failed to read plugin manifest");
                Manifest::new()
            }
        }
    }

    /// Replace the manifest on disk
    pub fn write(dir: &Path, manifest: &Manifest) -> Result<(), ManifestError> {
        let path = Self::path(dir);
        fs::write(&path, manifest.render()).map_err(|source| ManifestError::Write {
            path: path.clone(),
            source,
        })?;
        debug!(path = ?path, "Wrote plugin manifest");
        Ok(())
    }

    /// Read, overlay `changes`, write back. Returns the merged manifest.
    pub fn merge(dir: &Path, changes: &Manifest) -> Result<Manifest, ManifestError> {
        let mut manifest = Self::read(dir);
        manifest.merge(changes);
        Self::write(dir, &manifest)?;
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
; shipped with the package
app = shop
title = Shop
about = "Storefront; with carts"
author = acme
version = 1.2.0
state = 2
enabled = on

[menu]
icon = cart
order = 10
"#;

    #[test]
    fn test_parse_typed_values() {
        let m = Manifest::parse(SAMPLE);
        assert_eq!(m.app().as_deref(), Some("shop"));
        assert_eq!(m.get("version"), Some(&IniValue::Str("1.2.0".into())));
        assert_eq!(m.get("state"), Some(&IniValue::Int(2)));
        assert_eq!(m.get("enabled"), Some(&IniValue::Bool(true)));
        assert_eq!(
            m.get("about"),
            Some(&IniValue::Str("Storefront; with carts".into()))
        );
        assert_eq!(m.state(), Some(InstallState::WaitInstall));
        match m.get("menu") {
            Some(IniValue::Section(entries)) => {
                assert_eq!(entries.len(), 2);
                assert_eq!(entries[1], ("order".to_string(), IniValue::Int(10)));
            }
            other => panic!("expected section, got {:?}", other),
        }
    }

    #[test]
    fn test_render_round_trips_types() {
        let mut m = Manifest::new();
        m.set("app", "shop");
        m.set("code", "42");
        m.set("flag", "yes");
        m.set("empty", "");
        m.set("padded", " x ");
        m.set("count", 7i64);
        m.set("on", true);
        m.set("quoted", "say \"hi\"");
        m.set("zero_led", "007");
        m.set("grp", IniValue::Section(vec![("k".into(), IniValue::Str("1.0".into()))]));

        let back = Manifest::parse(&m.render());
        assert_eq!(back, m);
    }

    #[test]
    fn test_set_keeps_position_and_remove() {
        let mut m = Manifest::parse("app = a\nstate = 2\nversion = 1.0.0\n");
        m.set("state", 1i64);
        m.set(KEY_UPDATE, 1i64);
        let keys: Vec<_> = m.keys().collect();
        assert_eq!(keys, vec!["app", "state", "version", "update"]);
        assert_eq!(m.remove(KEY_UPDATE), Some(IniValue::Int(1)));
        assert!(!m.contains(KEY_UPDATE));
    }

    #[test]
    fn test_completeness() {
        let m = Manifest::parse(SAMPLE);
        assert!(m.is_complete());
        let partial = Manifest::parse("app = shop\nversion = 1.0.0\n");
        assert!(!partial.is_complete());
        assert_eq!(partial.missing_keys(), vec!["title", "about", "author", "state"]);
    }

    #[test]
    fn test_state_codes() {
        for code in 0..=5 {
            let state = InstallState::from_code(code);
            assert_eq!(state.code(), Some(code));
        }
        let unknown = InstallState::from_value(&IniValue::Str("weird".into()));
        assert_eq!(unknown, InstallState::Unknown("weird".into()));
        assert_eq!(serde_json::to_string(&InstallState::Installed).unwrap(), "1");
        assert_eq!(InstallState::from_value(&IniValue::Str("4".into())), InstallState::DependentWaitInstall);
    }

    #[test]
    fn test_flags() {
        let m = Manifest::parse("a = 1\nb = 0\nc = true\nd = \"\"\n");
        assert!(m.flag("a"));
        assert!(!m.flag("b"));
        assert!(m.flag("c"));
        assert!(!m.flag("d"));
        assert!(!m.flag("missing"));
    }

    #[test]
    fn test_store_read_missing_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(ManifestStore::read(dir.path()).is_empty());
    }

    #[test]
    fn test_store_write_and_merge() {
        let dir = TempDir::new().unwrap();
        let m = Manifest::parse(SAMPLE);
        ManifestStore::write(dir.path(), &m).unwrap();

        let mut changes = Manifest::new();
        changes.set_state(&InstallState::Installed);
        changes.set(KEY_UPDATE, 1i64);
        let merged = ManifestStore::merge(dir.path(), &changes).unwrap();

        let reread = ManifestStore::read(dir.path());
        assert_eq!(reread, merged);
        assert_eq!(reread.state(), Some(InstallState::Installed));
        assert!(reread.flag(KEY_UPDATE));
        assert_eq!(reread.get_str("about").as_deref(), Some("Storefront; with carts"));
    }

    #[test]
    fn test_store_write_fails_for_missing_dir() {
        let dir = TempDir::new().unwrap();
        let gone = dir.path().join("nope");
        let err = ManifestStore::write(&gone, &Manifest::new()).unwrap_err();
        assert!(err.to_string().contains("not writable"));
    }

    #[test]
    fn test_manifest_serializes_as_object() {
        let m = Manifest::parse("app = shop\nstate = 1\n");
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json, serde_json::json!({"app": "shop", "state": 1}));
    }
}
