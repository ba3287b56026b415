//! Persisted user configuration: active profiles, project preferences and the
//! environment registry.
//!
//! The document lives at a fixed per-user location. [`ConfigStore`] is
//! constructed once in `main` and handed by reference to every command, so
//! all readers observe the same in-memory state. Nothing here locks the file:
//! two `anydev` processes mutating it at once race, and the last writer wins.

use crate::error::{AnydevError, Result};
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

const CONFIG_FILE_NAME: &str = "config.yaml";

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Configuration {
    pub active_profiles: BTreeSet<String>,
    pub projects_path: String,
    pub organize_projects: bool,
    #[serde(alias = "registry")]
    pub projects: BTreeMap<String, EnvironmentRecord>,
}

/// Registry entry as stored on disk; the name is the map key.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct EnvironmentRecord {
    pub path: PathBuf,
    #[serde(default = "unknown_template")]
    pub template: String,
}

fn unknown_template() -> String {
    crate::environment::UNKNOWN_TEMPLATE.to_string()
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            active_profiles: BTreeSet::new(),
            projects_path: default_projects_path(),
            organize_projects: false,
            projects: BTreeMap::new(),
        }
    }
}

impl Configuration {
    /// Clearing the projects path also turns off project organisation, which
    /// has nowhere to put anything without it.
    pub fn set_projects_path(&mut self, value: &str) {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            self.projects_path = String::new();
            self.organize_projects = false;
        } else {
            self.projects_path = trimmed.to_string();
        }
    }

    pub fn set_organize_projects(&mut self, enabled: bool) {
        self.organize_projects = enabled && !self.projects_path.trim().is_empty();
    }

    pub fn projects_dir(&self) -> Option<PathBuf> {
        let trimmed = self.projects_path.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(PathBuf::from(expand_path(trimmed)))
    }
}

fn default_projects_path() -> String {
    home_dir()
        .map(|home| home.join("Projects").to_string_lossy().to_string())
        .unwrap_or_default()
}

pub struct ConfigStore {
    path: PathBuf,
    document: Configuration,
    configured: bool,
}

impl ConfigStore {
    /// Reads the document at `path`. A missing file (or a path whose parent is
    /// not a directory) yields defaults and marks the store unconfigured; an unreadable or malformed one is reported and
    /// also yields defaults.
    pub fn load(path: &Path) -> Self {
        let (document, configured) = match fs::read_to_string(path) {
            Ok(content) => (parse_document(path, &content), true),
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
                ) =>
            {
                tracing::debug!(path = %path.display(), "no configuration file yet; using defaults");
                (Configuration::default(), false)
            }
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    "could not read configuration ({err}); using defaults"
                );
                (Configuration::default(), true)
            }
        };
        Self {
            path: path.to_path_buf(),
            document,
            configured,
        }
    }

    pub fn save(&mut self) -> Result<()> {
        let content = serde_yaml::to_string(&self.document)?;
        write_atomic_text_file(&self.path, &content).map_err(|source| {
            AnydevError::Persistence {
                path: self.path.clone(),
                source,
            }
        })?;
        self.configured = true;
        tracing::debug!(path = %self.path.display(), "configuration saved");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn document(&self) -> &Configuration {
        &self.document
    }

    pub fn document_mut(&mut self) -> &mut Configuration {
        &mut self.document
    }

    /// False until a configuration file has existed on disk.
    pub fn is_configured(&self) -> bool {
        self.configured
    }
}

fn parse_document(path: &Path, content: &str) -> Configuration {
    if content.trim().is_empty() {
        return Configuration::default();
    }
    match serde_yaml::from_str::<Configuration>(content) {
        Ok(document) => document,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                "configuration is malformed ({err}); using defaults"
            );
            Configuration::default()
        }
    }
}

pub fn default_config_dir() -> PathBuf {
    if let Ok(path) = env::var("ANYDEV_CONFIG_DIR") {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    let mut base = home_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push(".anydev");
    base
}

pub fn resolve_config_path(override_path: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var("ANYDEV_CONFIG") {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    default_config_dir().join(CONFIG_FILE_NAME)
}

/// Directory holding the shared services composition.
pub fn resolve_services_dir(override_path: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var("ANYDEV_SERVICES_DIR") {
        if !path.trim().is_empty() {
            return PathBuf::from(expand_path(path.trim()));
        }
    }
    default_config_dir().join("services")
}

pub fn expand_path(input: &str) -> String {
    if let Some(stripped) = input.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(stripped).to_string_lossy().to_string();
        }
    }
    input.to_string()
}

fn ensure_parent(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn write_atomic_text_file(path: &Path, content: &str) -> io::Result<()> {
    ensure_parent(path)?;
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let tmp_path = parent.join(format!(
        ".{}.tmp.{}.{}",
        path.file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "anydev".to_string()),
        std::process::id(),
        ts
    ));
    fs::write(&tmp_path, content)?;
    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }
    Ok(())
}
