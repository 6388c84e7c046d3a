//! Discovery of application definitions on disk
//!
//! Each backend directory carries a small YAML file:
//!
//! ```yaml
//! application:
//!   path: /demo-app
//!   script: .next/standalone/server.js
//!   name: demo-app      # optional, falls back to package.json
//!   version: 0.1.0      # optional, falls back to package.json
//! ```
//!
//! The nearest `package.json` in the same directory or above supplies the
//! name and version when the YAML file leaves them out.

use crate::app::{AppDefinition, AppIdentifier};
use crate::error::DiscoveryError;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Default name of the per-application configuration file
pub const DEFAULT_CONFIG_FILE: &str = "wrs.config.yml";

/// Name of the package metadata file consulted for fallbacks
pub const PACKAGE_FILE: &str = "package.json";

#[derive(Debug, Deserialize)]
struct AppConfigFile {
    application: AppConfigEntry,
}

#[derive(Debug, Deserialize)]
struct AppConfigEntry {
    path: String,
    script: String,
    name: Option<String>,
    version: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct PackageMetadata {
    name: Option<String>,
    version: Option<String>,
}

/// Result of a scan: the definitions found plus the files that could not be used
#[derive(Debug, Default)]
pub struct Discovery {
    /// Definitions in discovery order, unique by composite name
    pub apps: Vec<AppDefinition>,
    /// Per-file failures; they do not abort the scan
    pub errors: Vec<DiscoveryError>,
}

impl Discovery {
    pub fn get(&self, name: &str) -> Option<&AppDefinition> {
        self.apps.iter().find(|app| app.name == name)
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }

    fn insert(&mut self, app: AppDefinition) {
        match self.apps.iter_mut().find(|existing| existing.name == app.name) {
            Some(existing) => {
                debug!(app = %app.name, "Replacing earlier definition with the same name");
                *existing = app;
            }
            None => self.apps.push(app),
        }
    }
}

/// Scans a directory tree for application configuration files
#[derive(Debug, Clone)]
pub struct DiscoveryService {
    root_dir: PathBuf,
    config_file: String,
    scope: String,
}

impl DiscoveryService {
    pub fn new(root_dir: impl Into<PathBuf>, config_file: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            root_dir: root_dir.into(),
            config_file: config_file.into(),
            scope: scope.into(),
        }
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Walk the tree depth first and collect every application definition
    ///
    /// Only an unreadable root directory fails the whole scan.
    pub fn discover(&self) -> Result<Discovery, DiscoveryError> {
        let started = Instant::now();
        std::fs::read_dir(&self.root_dir).map_err(|source| DiscoveryError::Io {
            path: self.root_dir.clone(),
            source,
        })?;

        info!(root = %self.root_dir.display(), file = %self.config_file, "Scanning for application definitions");

        let mut discovery = Discovery::default();
        let mut packages: HashMap<PathBuf, Option<PackageMetadata>> = HashMap::new();

        let walker = WalkDir::new(&self.root_dir)
            .follow_links(false)
            .sort_by_file_name();

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(source) => {
                    let path = source
                        .path()
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|| self.root_dir.clone());
                    warn!(path = %path.display(), error = %source, "Skipping unreadable entry");
                    discovery.errors.push(DiscoveryError::Walk { path, source });
                    continue;
                }
            };

            if !entry.file_type().is_file() || entry.file_name() != self.config_file.as_str() {
                continue;
            }

            match self.load_definition(entry.path(), &mut packages) {
                Ok(app) => {
                    debug!(app = %app.name, path = %app.path, script = %app.script, "Discovered application");
                    discovery.insert(app);
                }
                Err(e) => {
                    warn!(error = %e, "Skipping application config");
                    discovery.errors.push(e);
                }
            }
        }

        info!(
            apps = discovery.apps.len(),
            errors = discovery.errors.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Discovery complete"
        );

        Ok(discovery)
    }

    fn load_definition(
        &self,
        config_path: &Path,
        packages: &mut HashMap<PathBuf, Option<PackageMetadata>>,
    ) -> Result<AppDefinition, DiscoveryError> {
        let content = std::fs::read_to_string(config_path).map_err(|source| DiscoveryError::Io {
            path: config_path.to_path_buf(),
            source,
        })?;
        let config: AppConfigFile =
            serde_yaml::from_str(&content).map_err(|source| DiscoveryError::Config {
                path: config_path.to_path_buf(),
                source,
            })?;
        let entry = config.application;

        let config_dir = config_path.parent().unwrap_or(&self.root_dir);
        let package = self.nearest_package(config_dir, packages)?;

        let name = entry
            .name
            .or_else(|| package.as_ref().and_then(|p| p.name.clone()))
            .map(|n| unscoped(&n).to_string())
            .ok_or_else(|| DiscoveryError::MissingField {
                path: config_path.to_path_buf(),
                field: "name",
            })?;
        let version = entry
            .version
            .or_else(|| package.as_ref().and_then(|p| p.version.clone()))
            .ok_or_else(|| DiscoveryError::MissingField {
                path: config_path.to_path_buf(),
                field: "version",
            })?;

        let composite = AppIdentifier::new(self.scope.as_str(), name, version).composite();
        // Reject anything that would not survive a round trip through the composite form
        AppIdentifier::parse(&composite).map_err(|source| DiscoveryError::InvalidName {
            path: config_path.to_path_buf(),
            source,
        })?;

        let script = config_dir.join(&entry.script);
        Ok(AppDefinition::unassigned(
            composite,
            script.to_string_lossy(),
            entry.path,
        ))
    }

    /// Closest package.json at or above `dir`, without leaving the root
    fn nearest_package(
        &self,
        dir: &Path,
        packages: &mut HashMap<PathBuf, Option<PackageMetadata>>,
    ) -> Result<Option<PackageMetadata>, DiscoveryError> {
        for ancestor in dir.ancestors() {
            if !ancestor.starts_with(&self.root_dir) {
                break;
            }
            if let Some(found) = self.package_in(ancestor, packages)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    fn package_in(
        &self,
        dir: &Path,
        packages: &mut HashMap<PathBuf, Option<PackageMetadata>>,
    ) -> Result<Option<PackageMetadata>, DiscoveryError> {
        if let Some(cached) = packages.get(dir) {
            return Ok(cached.clone());
        }

        let path = dir.join(PACKAGE_FILE);
        let metadata = if path.is_file() {
            let content = std::fs::read_to_string(&path).map_err(|source| DiscoveryError::Io {
                path: path.clone(),
                source,
            })?;
            let parsed: PackageMetadata = serde_json::from_str(&content)
                .map_err(|source| DiscoveryError::Package { path: path.clone(), source })?;
            Some(parsed)
        } else {
            None
        };

        packages.insert(dir.to_path_buf(), metadata.clone());
        Ok(metadata)
    }
}

/// `@org/pkg` -> `pkg`
fn unscoped(name: &str) -> &str {
    match name.strip_prefix('@').and_then(|n| n.split_once('/')) {
        Some((_, rest)) => rest,
        None => name,
    }
}
