//! The set of known environments, kept inside the configuration document and
//! ordered by name.

use crate::config::{ConfigStore, EnvironmentRecord};
use crate::environment::{self, Environment};
use crate::error::{AnydevError, Result};
use std::path::Path;

/// Result of reconciling the registry against the filesystem.
#[derive(Debug, Default)]
pub struct Reconciled {
    pub valid: Vec<Environment>,
    /// Entries removed because their directory no longer qualifies.
    pub dropped: Vec<Environment>,
    /// Entries kept in the registry but skipped because their declaration
    /// file could not be read.
    pub unreadable: Vec<(Environment, String)>,
}

pub struct Registry<'a> {
    store: &'a mut ConfigStore,
}

impl<'a> Registry<'a> {
    pub fn new(store: &'a mut ConfigStore) -> Self {
        Self { store }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.store.document().projects.contains_key(name)
    }

    pub fn entries(&self) -> Vec<Environment> {
        self.store
            .document()
            .projects
            .iter()
            .map(|(name, record)| to_environment(name, record))
            .collect()
    }

    /// Inserts or replaces the entry keyed by `env.name` and persists.
    pub fn register(&mut self, env: &Environment) -> Result<()> {
        if env.name.trim().is_empty() {
            return Err(AnydevError::Validation(
                "environment name must be non-empty".to_string(),
            ));
        }
        self.store.document_mut().projects.insert(
            env.name.clone(),
            EnvironmentRecord {
                path: env.path.clone(),
                template: env.template.clone(),
            },
        );
        self.store.save()
    }

    /// Removes `name` if present. Returns whether an entry was removed.
    pub fn unregister(&mut self, name: &str) -> Result<bool> {
        if self.store.document_mut().projects.remove(name).is_none() {
            return Ok(false);
        }
        self.store.save()?;
        Ok(true)
    }

    /// Re-validates every entry against its stored path. Entries that no
    /// longer qualify are unregistered as a side effect.
    pub fn list_valid(&mut self) -> Result<Reconciled> {
        let mut reconciled = Reconciled::default();
        for env in self.entries() {
            match environment::is_environment(&env.path) {
                Ok(true) => reconciled.valid.push(env),
                Ok(false) => {
                    tracing::warn!(
                        name = %env.name,
                        path = %env.path.display(),
                        "environment is no longer valid; removing it from the registry"
                    );
                    reconciled.dropped.push(env);
                }
                Err(err) => {
                    tracing::warn!(
                        name = %env.name,
                        "skipping environment with unreadable declaration: {err}"
                    );
                    reconciled.unreadable.push((env, err.to_string()));
                }
            }
        }
        if !reconciled.dropped.is_empty() {
            let projects = &mut self.store.document_mut().projects;
            for env in &reconciled.dropped {
                projects.remove(&env.name);
            }
            self.store.save()?;
        }
        Ok(reconciled)
    }
}

fn to_environment(name: &str, record: &EnvironmentRecord) -> Environment {
    Environment {
        name: name.to_string(),
        path: record.path.clone(),
        template: record.template.clone(),
    }
}

/// Validates `dir` and registers it when it is not known yet. Commands that
/// operate on an environment call this before touching docker.
pub fn require_environment(store: &mut ConfigStore, dir: &Path) -> Result<(Environment, bool)> {
    let inspection = environment::inspect(dir)?;
    if !inspection.is_environment() {
        return Err(AnydevError::Validation(format!(
            "{} is not a valid anydev environment ({})",
            dir.display(),
            inspection.summary()
        )));
    }
    let env = environment::describe(dir)?;
    let mut registry = Registry::new(store);
    if registry.contains(&env.name) {
        return Ok((env, false));
    }
    registry.register(&env)?;
    tracing::info!(name = %env.name, "registered environment");
    Ok((env, true))
}
