//! Optional service profiles declared in a composition manifest.

use crate::config::ConfigStore;
use crate::error::{AnydevError, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE_NAMES: [&str; 4] = [
    "docker-compose.yml",
    "docker-compose.yaml",
    "compose.yml",
    "compose.yaml",
];

#[derive(Debug, Deserialize, Default)]
struct ComposeManifest {
    #[serde(default)]
    services: BTreeMap<String, Option<ServiceDecl>>,
}

#[derive(Debug, Deserialize, Default)]
struct ServiceDecl {
    #[serde(default)]
    profiles: Vec<String>,
}

/// First manifest that exists in `dir`, in the order docker compose itself
/// looks for them.
pub fn find_manifest(dir: &Path) -> Option<PathBuf> {
    MANIFEST_FILE_NAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Union of all profiles declared by the manifest's services, sorted and
/// deduplicated.
pub fn available_profiles(manifest_path: &Path) -> Result<Vec<String>> {
    let content = fs::read_to_string(manifest_path).map_err(|err| AnydevError::Parse {
        path: manifest_path.to_path_buf(),
        message: err.to_string(),
    })?;
    let manifest: ComposeManifest =
        serde_yaml::from_str(&content).map_err(|err| AnydevError::Parse {
            path: manifest_path.to_path_buf(),
            message: err.to_string(),
        })?;
    let profiles: BTreeSet<String> = manifest
        .services
        .into_values()
        .flatten()
        .flat_map(|service| service.profiles)
        .collect();
    Ok(profiles.into_iter().collect())
}

/// Replaces the active selection. Callers persist with [`ConfigStore::save`].
/// An empty selection is valid and means only the default services start.
pub fn set_active_profiles(store: &mut ConfigStore, selection: &[String]) {
    let document = store.document_mut();
    document.active_profiles = selection
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(ToString::to_string)
        .collect();
    if document.active_profiles.is_empty() {
        tracing::info!("no profiles selected; the minimal service set will be used on next start");
    }
}

/// Profiles that are selected but not declared by `available`. They stay in
/// the configuration and simply do nothing until the manifest declares them
/// again.
pub fn stale_profiles<'a>(active: &'a BTreeSet<String>, available: &[String]) -> Vec<&'a str> {
    active
        .iter()
        .filter(|p| !available.iter().any(|a| a == *p))
        .map(String::as_str)
        .collect()
}
