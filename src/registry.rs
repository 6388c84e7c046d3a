//! The set of admitted applications
//!
//! Readers take snapshots; mutations happen only through
//! [`Registrar`](crate::registration::Registrar), which serializes them.

use crate::app::AppDefinition;
use crate::conflict::{self, Verdict};
use parking_lot::RwLock;
use tracing::debug;

/// Admitted application definitions in insertion order
#[derive(Debug, Default)]
pub struct AppRegistry {
    apps: RwLock<Vec<AppDefinition>>,
}

impl AppRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<AppDefinition> {
        self.apps.read().clone()
    }

    pub fn len(&self) -> usize {
        self.apps.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.read().is_empty()
    }

    /// Run the conflict detector against the current set
    pub fn try_admit(&self, candidate: &AppDefinition) -> Verdict {
        conflict::check(candidate, &self.apps.read())
    }

    /// Insert a definition, replacing one with the same composite name in place
    pub fn commit(&self, app: AppDefinition) {
        let mut apps = self.apps.write();
        match apps.iter_mut().find(|a| a.name == app.name) {
            Some(existing) => {
                debug!(app = %app.name, port = %app.port_display(), "Replacing application definition");
                *existing = app;
            }
            None => {
                debug!(app = %app.name, port = %app.port_display(), "Adding application definition");
                apps.push(app);
            }
        }
    }

    pub fn find(&self, name: &str) -> Option<AppDefinition> {
        self.apps.read().iter().find(|a| a.name == name).cloned()
    }

    /// First application in insertion order whose version is `version`
    pub fn find_version(&self, version: &str) -> Option<AppDefinition> {
        self.apps
            .read()
            .iter()
            .find(|a| a.version().as_deref() == Some(version))
            .cloned()
    }

    /// Drop a definition by composite name
    pub fn remove(&self, name: &str) -> Option<AppDefinition> {
        let mut apps = self.apps.write();
        let index = apps.iter().position(|a| a.name == name)?;
        debug!(app = %name, "Removing application definition");
        Some(apps.remove(index))
    }

    /// First application in insertion order mounted exactly at `prefix`
    pub fn default_for_prefix(&self, prefix: &str) -> Option<AppDefinition> {
        self.apps.read().iter().find(|a| a.path == prefix).cloned()
    }
}
