//! Path-prefix routing and target selection

use crate::app::AppDefinition;
use crate::registry::AppRegistry;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashSet};
use tracing::debug;

/// Registered path prefixes and per-application health endpoints.
///
/// Both sets only grow.
#[derive(Debug, Default)]
pub struct RouteTable {
    prefixes: RwLock<BTreeSet<String>>,
    health_endpoints: RwLock<HashSet<String>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mount an application's prefix (if new) and its health endpoint
    pub fn register_app(&self, app: &AppDefinition) {
        if self.prefixes.write().insert(app.path.clone()) {
            debug!(prefix = %app.path, "Registered route prefix");
        }
        self.health_endpoints.write().insert(app.name.clone());
    }

    /// Longest registered prefix matching `path`
    pub fn match_prefix(&self, path: &str) -> Option<String> {
        self.prefixes
            .read()
            .iter()
            .filter(|prefix| prefix_matches(prefix, path))
            .max_by_key(|prefix| prefix.len())
            .cloned()
    }

    pub fn has_health_endpoint(&self, name: &str) -> bool {
        self.health_endpoints.read().contains(name)
    }

    pub fn prefixes(&self) -> Vec<String> {
        self.prefixes.read().iter().cloned().collect()
    }
}

/// `prefix` matches `path` if it is empty, equal, or followed by a `/`
pub fn prefix_matches(prefix: &str, path: &str) -> bool {
    if prefix.is_empty() || path == prefix {
        return true;
    }
    path.strip_prefix(prefix)
        .map(|rest| rest.starts_with('/'))
        .unwrap_or(false)
}

/// Pick the application serving `prefix`.
///
/// The default is the first application mounted at the prefix. A requested
/// version selects the first registered application carrying that version,
/// falling back to the default when none does.
pub fn select_target(
    registry: &AppRegistry,
    prefix: &str,
    version: Option<&str>,
) -> Option<AppDefinition> {
    let default = registry.default_for_prefix(prefix)?;

    let Some(version) = version else {
        return Some(default);
    };

    match registry.find_version(version) {
        Some(versioned) => Some(versioned),
        None => {
            debug!(app = %default.name, version, "Requested version not registered, using default");
            Some(default)
        }
    }
}

/// Value of the `version` query parameter, if present
pub fn requested_version(query: Option<&str>) -> Option<String> {
    query?.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        if key != "version" || value.is_empty() {
            return None;
        }
        urlencoding::decode(value).ok().map(|v| v.into_owned())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app(name: &str, port: u16, path: &str) -> AppDefinition {
        AppDefinition::new(name, "server.js", port, path)
    }

    #[test]
    fn test_prefix_matches() {
        assert!(prefix_matches("", "/anything"));
        assert!(prefix_matches("/shop", "/shop"));
        assert!(prefix_matches("/shop", "/shop/cart"));
        assert!(!prefix_matches("/shop", "/shopping"));
        assert!(!prefix_matches("/shop", "/"));
    }

    #[test]
    fn test_longest_prefix_wins() {
        let routes = RouteTable::new();
        routes.register_app(&app("@ck/root@v1", 7000, ""));
        routes.register_app(&app("@ck/shop@v1", 7001, "/shop"));
        routes.register_app(&app("@ck/admin@v1", 7002, "/shop/admin"));

        assert_eq!(routes.match_prefix("/shop/admin/users").as_deref(), Some("/shop/admin"));
        assert_eq!(routes.match_prefix("/shop/cart").as_deref(), Some("/shop"));
        assert_eq!(routes.match_prefix("/shopping").as_deref(), Some(""));
    }

    #[test]
    fn test_no_match_without_catch_all() {
        let routes = RouteTable::new();
        routes.register_app(&app("@ck/shop@v1", 7001, "/shop"));
        assert!(routes.match_prefix("/blog").is_none());
    }

    #[test]
    fn test_register_is_additive() {
        let routes = RouteTable::new();
        routes.register_app(&app("@ck/shop@v1", 7000, "/shop"));
        routes.register_app(&app("@ck/shop@v2", 7001, "/shop"));

        assert_eq!(routes.prefixes(), vec!["/shop".to_string()]);
        assert!(routes.has_health_endpoint("@ck/shop@v1"));
        assert!(routes.has_health_endpoint("@ck/shop@v2"));
        assert!(!routes.has_health_endpoint("@ck/shop@v3"));
    }

    #[test]
    fn test_select_target_by_version() {
        let registry = AppRegistry::new();
        registry.commit(app("@ck/shop@v1", 7000, "/shop"));
        registry.commit(app("@ck/shop@v2", 7001, "/shop"));

        let default = select_target(&registry, "/shop", None).unwrap();
        assert_eq!(default.port, Some(7000));

        let v2 = select_target(&registry, "/shop", Some("2")).unwrap();
        assert_eq!(v2.port, Some(7001));

        let fallback = select_target(&registry, "/shop", Some("9")).unwrap();
        assert_eq!(fallback.port, Some(7000));

        assert!(select_target(&registry, "/none", None).is_none());
    }

    #[test]
    fn test_version_lookup_searches_whole_set() {
        let registry = AppRegistry::new();
        registry.commit(app("@ck/shop@v1", 7000, "/shop"));
        registry.commit(app("@ck/blog@v2", 7001, "/blog"));

        let target = select_target(&registry, "/shop", Some("2")).unwrap();
        assert_eq!(target.name, "@ck/blog@v2");
    }

    #[test]
    fn test_requested_version() {
        assert_eq!(requested_version(Some("version=2")).as_deref(), Some("2"));
        assert_eq!(requested_version(Some("a=1&version=1.0.3")).as_deref(), Some("1.0.3"));
        assert_eq!(requested_version(Some("versions=2")), None);
        assert_eq!(requested_version(Some("version=")), None);
        assert_eq!(requested_version(None), None);
    }
}
