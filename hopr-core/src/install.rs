//! Client installation discovery and settings patching
//!
//! Every installation is snapshotted before anything is written to it, and
//! restore always writes the snapshot bytes back verbatim. A patched
//! installation is marked dirty until its restore succeeds, so restore can be
//! called any number of times and only touches files that still need it.

use crate::config::InstallConfig;
use crate::error::{PatchError, Result};
use serde_json::ser::PrettyFormatter;
use serde_json::{Map, Serializer, Value};
use std::fs::{self, OpenOptions, Permissions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// A root directory holding at least one version folder with the client
#[derive(Debug, Clone, PartialEq)]
pub struct InstallRoot {
    pub name: String,
    pub path: PathBuf,
    pub versions: Vec<PathBuf>,
}

/// Settings file contents and metadata captured before the first write
#[derive(Debug, Clone)]
pub struct Snapshot {
    raw: Vec<u8>,
    parsed: Map<String, Value>,
    permissions: Permissions,
}

impl Snapshot {
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn parsed(&self) -> &Map<String, Value> {
        &self.parsed
    }
}

/// One installation taking part in a run
#[derive(Debug)]
pub struct AppInstallation {
    root: InstallRoot,
    settings_path: PathBuf,
    snapshot: Snapshot,
    dirty: bool,
}

impl AppInstallation {
    pub fn name(&self) -> &str {
        &self.root.name
    }

    pub fn base_path(&self) -> &Path {
        &self.root.path
    }

    pub fn settings_path(&self) -> &Path {
        &self.settings_path
    }

    pub fn versions(&self) -> &[PathBuf] {
        &self.root.versions
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// True from the first write of the override until a restore succeeds
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

/// Ordered keys merged into a settings snapshot
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigOverride {
    entries: Vec<(String, Value)>,
}

impl ConfigOverride {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys that route the client's HTTP stack through `host_and_port`
    pub fn proxy(host_and_port: &str) -> Self {
        Self::new()
            .with("DFStringHttpCurlProxyHostAndPort", host_and_port)
            .with(
                "DFStringDebugPlayerHttpProxyUrl",
                format!("http://{}", host_and_port),
            )
            .with("DFFlagDebugEnableHttpProxy", "True")
            .with("DFStringHttpCurlProxyHostAndPortForExternalUrl", host_and_port)
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.entries.push((key.into(), value.into()));
        self
    }

    pub fn entries(&self) -> &[(String, Value)] {
        &self.entries
    }

    /// Merge into `settings`; existing keys keep their position, new ones go last
    pub fn apply(&self, settings: &Map<String, Value>) -> Map<String, Value> {
        let mut merged = settings.clone();
        for (key, value) in &self.entries {
            merged.insert(key.clone(), value.clone());
        }
        merged
    }
}

/// Finds installations and applies or reverts a settings override on them
pub struct ConfigPatcher {
    config: InstallConfig,
}

impl ConfigPatcher {
    pub fn new(config: InstallConfig) -> Self {
        Self { config }
    }

    /// List installation roots with at least one qualifying version folder
    ///
    /// Roots come back in configuration order. Nothing is written.
    pub fn discover(&self) -> Vec<InstallRoot> {
        let suffix = self.config.executable_suffix.to_ascii_lowercase();

        self.config
            .roots
            .iter()
            .filter_map(|root| {
                let versions = find_versions(&root.path, &suffix);
                if versions.is_empty() {
                    debug!("No client versions under {:?}", root.path);
                    return None;
                }
                Some(InstallRoot {
                    name: root.name.clone(),
                    path: root.path.clone(),
                    versions,
                })
            })
            .collect()
    }

    /// Capture every discovered installation and make sure its versions trust `ca_pem`
    pub fn snapshot(&self, ca_pem: &str) -> Result<Vec<AppInstallation>> {
        let mut installations = Vec::new();

        for root in self.discover() {
            let settings_path = root.path.join(&self.config.settings_file);
            let snapshot = capture(&settings_path)?;

            for version in &root.versions {
                let bundle = version.join(&self.config.trust_bundle);
                ensure_trusted(&bundle, ca_pem)?;
            }

            info!(
                "Found {} installation at {:?} ({} version(s))",
                root.name,
                root.path,
                root.versions.len()
            );
            installations.push(AppInstallation {
                root,
                settings_path,
                snapshot,
                dirty: false,
            });
        }

        Ok(installations)
    }

    /// Write the override into every installation, in order
    ///
    /// On failure, installations already patched are restored before the
    /// error is returned.
    pub fn patch(&self, installations: &mut [AppInstallation], overrides: &ConfigOverride) -> Result<()> {
        for index in 0..installations.len() {
            if let Err(e) = patch_one(&mut installations[index], overrides) {
                warn!(
                    "Patching {} failed, rolling back: {}",
                    installations[index].name(),
                    e
                );
                if let Err(rollback) = self.restore(installations) {
                    warn!("Rollback after failed patch was incomplete: {}", rollback);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Put the captured bytes and permissions back on every dirty installation
    ///
    /// Every installation is attempted; the first error is returned.
    pub fn restore(&self, installations: &mut [AppInstallation]) -> Result<()> {
        let mut first_error = None;

        for installation in installations.iter_mut().filter(|i| i.dirty) {
            match restore_one(installation) {
                Ok(()) => {
                    installation.dirty = false;
                    info!("Restored settings for {}", installation.name());
                }
                Err(e) => {
                    warn!("Failed to restore {}: {}", installation.name(), e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn find_versions(root: &Path, suffix: &str) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(root.join("Versions")) else {
        return Vec::new();
    };

    let mut versions: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir() && holds_executable(path, suffix))
        .collect();
    versions.sort();
    versions
}

fn holds_executable(dir: &Path, suffix: &str) -> bool {
    let Ok(entries) = fs::read_dir(dir) else {
        return false;
    };
    entries.filter_map(|entry| entry.ok()).any(|entry| {
        entry.path().is_file()
            && entry
                .file_name()
                .to_string_lossy()
                .to_ascii_lowercase()
                .ends_with(suffix)
    })
}

fn capture(settings_path: &Path) -> Result<Snapshot> {
    if !settings_path.exists() {
        if let Some(parent) = settings_path.parent() {
            fs::create_dir_all(parent).map_err(|source| PatchError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(settings_path, b"{}").map_err(|source| PatchError::Write {
            path: settings_path.to_path_buf(),
            source,
        })?;
        debug!("Created empty settings file {:?}", settings_path);
    }

    let raw = fs::read(settings_path).map_err(|source| PatchError::Read {
        path: settings_path.to_path_buf(),
        source,
    })?;
    let permissions = fs::metadata(settings_path)
        .map_err(|source| PatchError::Read {
            path: settings_path.to_path_buf(),
            source,
        })?
        .permissions();
    let parsed = parse_settings(settings_path, &raw)?;

    Ok(Snapshot {
        raw,
        parsed,
        permissions,
    })
}

fn parse_settings(path: &Path, raw: &[u8]) -> Result<Map<String, Value>> {
    if raw.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(Map::new());
    }

    match serde_json::from_slice::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(PatchError::InvalidJson {
            path: path.to_path_buf(),
            reason: format!("expected an object, found {}", json_kind(&other)),
        }),
        Err(e) => Err(PatchError::InvalidJson {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn ensure_trusted(bundle: &Path, ca_pem: &str) -> Result<()> {
    let bundle_error = |source| PatchError::TrustBundle {
        path: bundle.to_path_buf(),
        source,
    };

    if !bundle.exists() {
        if let Some(parent) = bundle.parent() {
            fs::create_dir_all(parent).map_err(bundle_error)?;
        }
        fs::write(bundle, ca_pem).map_err(bundle_error)?;
        debug!("Created trust bundle {:?}", bundle);
        return Ok(());
    }

    let existing = fs::read(bundle).map_err(bundle_error)?;
    if String::from_utf8_lossy(&existing).contains(ca_pem) {
        return Ok(());
    }

    let mut file = OpenOptions::new()
        .append(true)
        .open(bundle)
        .map_err(bundle_error)?;
    file.write_all(format!("\n{}", ca_pem).as_bytes())
        .map_err(bundle_error)?;
    debug!("Appended CA to trust bundle {:?}", bundle);
    Ok(())
}

fn patch_one(installation: &mut AppInstallation, overrides: &ConfigOverride) -> Result<()> {
    let merged = overrides.apply(&installation.snapshot.parsed);
    let path = installation.settings_path.clone();
    let contents = to_pretty_json(&path, &merged)?;

    set_writable(&path)?;
    // Permissions changed: dirty until restored
    installation.dirty = true;
    write_atomic(&path, &contents)?;
    set_permissions(&path, read_only(&installation.snapshot.permissions))?;

    info!("Patched settings for {} at {:?}", installation.name(), path);
    Ok(())
}

fn restore_one(installation: &AppInstallation) -> Result<()> {
    let path = &installation.settings_path;
    if path.exists() {
        set_writable(path)?;
    }
    write_atomic(path, &installation.snapshot.raw)?;
    set_permissions(path, installation.snapshot.permissions.clone())
}

fn to_pretty_json(path: &Path, settings: &Map<String, Value>) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut serializer = Serializer::with_formatter(&mut out, PrettyFormatter::with_indent(b"    "));
    serde::Serialize::serialize(settings, &mut serializer).map_err(|e| PatchError::Write {
        path: path.to_path_buf(),
        source: e.into(),
    })?;
    Ok(out)
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let write_error = |source| PatchError::Write {
        path: path.to_path_buf(),
        source,
    };

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = path.with_file_name(format!(".{}.hopr-tmp", file_name));

    let mut file = fs::File::create(&tmp_path).map_err(write_error)?;
    file.write_all(contents).map_err(write_error)?;
    file.sync_all().map_err(write_error)?;
    drop(file);

    if let Err(source) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(write_error(source));
    }
    Ok(())
}

fn set_permissions(path: &Path, permissions: Permissions) -> Result<()> {
    fs::set_permissions(path, permissions).map_err(|source| PatchError::Permissions {
        path: path.to_path_buf(),
        source,
    })
}

fn set_writable(path: &Path) -> Result<()> {
    let current = fs::metadata(path)
        .map_err(|source| PatchError::Permissions {
            path: path.to_path_buf(),
            source,
        })?
        .permissions();
    set_permissions(path, writable(&current))
}

#[cfg(unix)]
fn writable(permissions: &Permissions) -> Permissions {
    use std::os::unix::fs::PermissionsExt;
    Permissions::from_mode(permissions.mode() | 0o200)
}

#[cfg(not(unix))]
#[allow(clippy::permissions_set_readonly_false)]
fn writable(permissions: &Permissions) -> Permissions {
    let mut permissions = permissions.clone();
    permissions.set_readonly(false);
    permissions
}

fn read_only(permissions: &Permissions) -> Permissions {
    let mut permissions = permissions.clone();
    permissions.set_readonly(true);
    permissions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstallRootConfig;
    use serde_json::json;
    use tempfile::TempDir;

    const CA_PEM: &str = "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n";

    fn make_root(base: &Path, name: &str, versions: &[&str]) -> InstallRootConfig {
        let path = base.join(name);
        for version in versions {
            let dir = path.join("Versions").join(version);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("RobloxPlayerBeta.exe"), b"MZ").unwrap();
        }
        InstallRootConfig {
            name: name.to_string(),
            path,
        }
    }

    fn patcher(roots: Vec<InstallRootConfig>) -> ConfigPatcher {
        ConfigPatcher::new(InstallConfig {
            roots,
            ..InstallConfig::default()
        })
    }

    fn write_settings(root: &InstallRootConfig, contents: &str) -> PathBuf {
        let path = root.path.join("ClientSettings/IxpSettings.json");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_discover_filters_versions() {
        let dir = TempDir::new().unwrap();
        let roblox = make_root(dir.path(), "Roblox", &["version-a", "version-b"]);
        let empty = make_root(dir.path(), "Bloxstrap", &[]);
        // Studio-only version folder does not qualify
        let studio = dir.path().join("Roblox/Versions/version-studio");
        fs::create_dir_all(&studio).unwrap();
        fs::write(studio.join("RobloxStudioBeta.exe"), b"MZ").unwrap();
        let missing = InstallRootConfig {
            name: "Fishstrap".to_string(),
            path: dir.path().join("absent"),
        };

        let found = patcher(vec![roblox, empty, missing]).discover();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "Roblox");
        assert_eq!(found[0].versions.len(), 2);
    }

    #[test]
    fn test_executable_suffix_case_insensitive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Roblox/Versions/v1");
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join("ROBLOXPLAYERBETA.EXE"), b"MZ").unwrap();

        let found = patcher(vec![InstallRootConfig {
            name: "Roblox".to_string(),
            path: dir.path().join("Roblox"),
        }])
        .discover();
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn test_patch_and_restore_scenario() {
        let dir = TempDir::new().unwrap();
        let root = make_root(dir.path(), "Roblox", &["v1"]);
        let settings = write_settings(&root, r#"{"a":1}"#);
        let patcher = patcher(vec![root]);

        let mut installs = patcher.snapshot(CA_PEM).unwrap();
        assert_eq!(installs.len(), 1);
        assert_eq!(installs[0].snapshot().raw(), br#"{"a":1}"#);

        let overrides = ConfigOverride::new().with("proxy", "127.0.0.1:51823");
        patcher.patch(&mut installs, &overrides).unwrap();
        assert!(installs[0].is_dirty());

        let patched: Value = serde_json::from_slice(&fs::read(&settings).unwrap()).unwrap();
        assert_eq!(patched, json!({"a": 1, "proxy": "127.0.0.1:51823"}));
        assert!(fs::metadata(&settings).unwrap().permissions().readonly());

        patcher.restore(&mut installs).unwrap();
        assert!(!installs[0].is_dirty());
        assert_eq!(fs::read(&settings).unwrap(), br#"{"a":1}"#);
        assert!(!fs::metadata(&settings).unwrap().permissions().readonly());
    }

    #[test]
    fn test_patched_file_is_four_space_pretty_json() {
        let dir = TempDir::new().unwrap();
        let root = make_root(dir.path(), "Roblox", &["v1"]);
        let settings = write_settings(&root, r#"{"a":1}"#);
        let patcher = patcher(vec![root]);

        let mut installs = patcher.snapshot(CA_PEM).unwrap();
        patcher
            .patch(&mut installs, &ConfigOverride::new().with("b", true))
            .unwrap();

        let text = fs::read_to_string(&settings).unwrap();
        assert_eq!(text, "{\n    \"a\": 1,\n    \"b\": true\n}");
        patcher.restore(&mut installs).unwrap();
    }

    #[test]
    fn test_restore_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let root = make_root(dir.path(), "Roblox", &["v1"]);
        let settings = write_settings(&root, "{\"keep\": \"me\"}\n");
        let patcher = patcher(vec![root]);

        let mut installs = patcher.snapshot(CA_PEM).unwrap();
        // Restore before patch touches nothing
        patcher.restore(&mut installs).unwrap();

        patcher
            .patch(&mut installs, &ConfigOverride::proxy("127.0.0.1:51823"))
            .unwrap();
        patcher.restore(&mut installs).unwrap();
        patcher.restore(&mut installs).unwrap();

        assert_eq!(fs::read(&settings).unwrap(), b"{\"keep\": \"me\"}\n");
    }

    #[test]
    fn test_missing_settings_created() {
        let dir = TempDir::new().unwrap();
        let root = make_root(dir.path(), "Fishstrap", &["v1"]);
        let settings = root.path.join("ClientSettings/IxpSettings.json");
        let patcher = patcher(vec![root]);

        let mut installs = patcher.snapshot(CA_PEM).unwrap();
        assert_eq!(fs::read(&settings).unwrap(), b"{}");
        assert!(installs[0].snapshot().parsed().is_empty());

        patcher
            .patch(&mut installs, &ConfigOverride::proxy("127.0.0.1:51823"))
            .unwrap();
        patcher.restore(&mut installs).unwrap();
        assert_eq!(fs::read(&settings).unwrap(), b"{}");
    }

    #[test]
    fn test_empty_settings_file_is_empty_object() {
        let dir = TempDir::new().unwrap();
        let root = make_root(dir.path(), "Roblox", &["v1"]);
        write_settings(&root, "");

        let installs = patcher(vec![root]).snapshot(CA_PEM).unwrap();
        assert!(installs[0].snapshot().parsed().is_empty());
        assert!(installs[0].snapshot().raw().is_empty());
    }

    #[test]
    fn test_non_object_settings_rejected() {
        let dir = TempDir::new().unwrap();
        let root = make_root(dir.path(), "Roblox", &["v1"]);
        write_settings(&root, "[1, 2]");

        let err = patcher(vec![root]).snapshot(CA_PEM).unwrap_err();
        assert!(matches!(err, PatchError::InvalidJson { .. }));
    }

    #[test]
    fn test_trust_bundle_deduplicated() {
        let dir = TempDir::new().unwrap();
        let root = make_root(dir.path(), "Roblox", &["v1", "v2"]);
        let existing = root.path.join("Versions/v2/ssl/cacert.pem");
        fs::create_dir_all(existing.parent().unwrap()).unwrap();
        fs::write(&existing, "SYSTEM ROOTS").unwrap();
        let patcher = patcher(vec![root.clone()]);

        patcher.snapshot(CA_PEM).unwrap();
        patcher.snapshot(CA_PEM).unwrap();

        let created = fs::read_to_string(root.path.join("Versions/v1/ssl/cacert.pem")).unwrap();
        assert_eq!(created, CA_PEM);
        let appended = fs::read_to_string(&existing).unwrap();
        assert_eq!(appended, format!("SYSTEM ROOTS\n{}", CA_PEM));
    }

    #[test]
    fn test_failed_patch_rolls_back_earlier_installs() {
        let dir = TempDir::new().unwrap();
        let first = make_root(dir.path(), "Roblox", &["v1"]);
        let second = make_root(dir.path(), "Bloxstrap", &["v1"]);
        let first_settings = write_settings(&first, r#"{"a":1}"#);
        let second_settings = write_settings(&second, r#"{"b":2}"#);
        let patcher = patcher(vec![first, second]);

        let mut installs = patcher.snapshot(CA_PEM).unwrap();
        assert_eq!(installs.len(), 2);

        // Replace the second settings directory with a plain file
        let second_dir = second_settings.parent().unwrap().to_path_buf();
        fs::remove_dir_all(&second_dir).unwrap();
        fs::write(&second_dir, b"not a directory").unwrap();

        let result = patcher.patch(&mut installs, &ConfigOverride::proxy("127.0.0.1:51823"));
        assert!(result.is_err());

        assert!(!installs[0].is_dirty());
        assert!(!installs[1].is_dirty());
        assert_eq!(fs::read(&first_settings).unwrap(), br#"{"a":1}"#);
    }

    #[test]
    fn test_untouched_install_not_dirty_after_failed_patch() {
        let dir = TempDir::new().unwrap();
        let root = make_root(dir.path(), "Roblox", &["v1"]);
        let settings = write_settings(&root, r#"{"a":1}"#);
        let patcher = patcher(vec![root]);

        let mut installs = patcher.snapshot(CA_PEM).unwrap();
        fs::remove_file(&settings).unwrap();

        let result = patcher.patch(&mut installs, &ConfigOverride::proxy("127.0.0.1:51823"));
        assert!(matches!(result, Err(PatchError::Permissions { .. })));
        assert!(!installs[0].is_dirty());

        // Nothing was written, so there is nothing to restore
        patcher.restore(&mut installs).unwrap();
        assert!(!settings.exists());
    }

    #[test]
    fn test_proxy_override_keys() {
        let overrides = ConfigOverride::proxy("127.0.0.1:51823");
        let merged = overrides.apply(&Map::new());

        assert_eq!(merged["DFStringHttpCurlProxyHostAndPort"], "127.0.0.1:51823");
        assert_eq!(merged["DFStringDebugPlayerHttpProxyUrl"], "http://127.0.0.1:51823");
        assert_eq!(merged["DFFlagDebugEnableHttpProxy"], "True");
        assert_eq!(
            merged["DFStringHttpCurlProxyHostAndPortForExternalUrl"],
            "127.0.0.1:51823"
        );
    }

    #[test]
    fn test_override_keeps_existing_keys_in_place() {
        let mut settings = Map::new();
        settings.insert("first".to_string(), json!(1));
        settings.insert("DFFlagDebugEnableHttpProxy".to_string(), json!("False"));
        settings.insert("last".to_string(), json!(3));

        let merged = ConfigOverride::new()
            .with("DFFlagDebugEnableHttpProxy", "True")
            .with("added", 4)
            .apply(&settings);

        let keys: Vec<&str> = merged.keys().map(|k| k.as_str()).collect();
        assert_eq!(keys, ["first", "DFFlagDebugEnableHttpProxy", "last", "added"]);
        assert_eq!(merged["DFFlagDebugEnableHttpProxy"], "True");
    }
}
