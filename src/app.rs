//! Application identifiers and definitions
//!
//! Every backend is known by a composite name of the form
//! `@scope/name@vVERSION`. The composite name is the key of the
//! application set, the process name handed to the supervisor and the
//! suffix of the per-application health endpoint.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Decomposed form of a composite application name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AppIdentifier {
    pub scope: String,
    pub name: String,
    pub version: String,
}

/// Error returned when a composite name does not follow `@scope/name@vVERSION`
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid application name '{0}': expected @scope/name@vVERSION")]
pub struct InvalidAppName(pub String);

impl AppIdentifier {
    pub fn new(
        scope: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            scope: scope.into(),
            name: name.into(),
            version: version.into(),
        }
    }

    /// Parse a composite name into its scope, name and version
    pub fn parse(composite: &str) -> Result<Self, InvalidAppName> {
        let invalid = || InvalidAppName(composite.to_string());

        let rest = composite.strip_prefix('@').ok_or_else(invalid)?;
        let (scope, rest) = rest.split_once('/').ok_or_else(invalid)?;
        let (name, version) = rest.split_once('@').ok_or_else(invalid)?;
        let version = version.strip_prefix('v').ok_or_else(invalid)?;

        let valid_segment = |s: &str| !s.is_empty() && !s.contains(|c| c == '@' || c == '/');
        if !valid_segment(scope) || !valid_segment(name) || !valid_segment(version) {
            return Err(invalid());
        }

        Ok(Self::new(scope, name, version))
    }

    /// The identity shared by every version of an application
    pub fn base_name(&self) -> String {
        format!("{}/{}", self.scope, self.name)
    }

    pub fn composite(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for AppIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}/{}@v{}", self.scope, self.name, self.version)
    }
}

/// Definition of a backend as it is registered with the gateway
///
/// `port` is `None` until the port allocator assigns one. On the wire an
/// absent or negative port means "unassigned".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppDefinition {
    /// Composite name (`@scope/name@vVERSION`)
    pub name: String,
    /// Absolute path of the script the supervisor launches
    pub script: String,
    #[serde(
        default,
        serialize_with = "serialize_port",
        deserialize_with = "deserialize_port"
    )]
    pub port: Option<u16>,
    /// URL prefix routed to this backend; empty routes the root
    #[serde(default)]
    pub path: String,
}

impl AppDefinition {
    pub fn new(name: impl Into<String>, script: impl Into<String>, port: u16, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: script.into(),
            port: Some(port),
            path: path.into(),
        }
    }

    /// Definition produced by discovery, before a port is allocated
    pub fn unassigned(name: impl Into<String>, script: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: script.into(),
            port: None,
            path: path.into(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn identifier(&self) -> Result<AppIdentifier, InvalidAppName> {
        AppIdentifier::parse(&self.name)
    }

    /// Base name, falling back to the raw composite name when it cannot be parsed
    pub fn base_name(&self) -> String {
        self.identifier()
            .map(|id| id.base_name())
            .unwrap_or_else(|_| self.name.clone())
    }

    pub fn version(&self) -> Option<String> {
        self.identifier().ok().map(|id| id.version)
    }

    /// Same name, port and path. The script is not part of the identity.
    pub fn is_same_definition(&self, other: &AppDefinition) -> bool {
        self.name == other.name && self.port == other.port && self.path == other.path
    }

    /// Same base name but a different version
    pub fn is_other_version_of(&self, other: &AppDefinition) -> bool {
        match (self.identifier(), other.identifier()) {
            (Ok(a), Ok(b)) => a.base_name() == b.base_name() && a.version != b.version,
            _ => false,
        }
    }

    /// Port formatted for log and error messages (`-1` when unassigned)
    pub fn port_display(&self) -> String {
        self.port.map(|p| p.to_string()).unwrap_or_else(|| "-1".to_string())
    }
}

fn serialize_port<S: Serializer>(port: &Option<u16>, serializer: S) -> Result<S::Ok, S::Error> {
    match port {
        Some(p) => serializer.serialize_i64(i64::from(*p)),
        None => serializer.serialize_i64(-1),
    }
}

fn deserialize_port<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u16>, D::Error> {
    let raw = Option::<i64>::deserialize(deserializer)?;
    match raw {
        None => Ok(None),
        Some(p) if p < 0 => Ok(None),
        Some(p) => u16::try_from(p)
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("port {} is out of range", p))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_composite_name() {
        let id = AppIdentifier::parse("@ck/demo-app@v0.1.0").unwrap();
        assert_eq!(id.scope, "ck");
        assert_eq!(id.name, "demo-app");
        assert_eq!(id.version, "0.1.0");
        assert_eq!(id.base_name(), "ck/demo-app");
    }

    #[test]
    fn test_compose_round_trip() {
        for (name, version) in [("svc", "1"), ("home", "0.1.0"), ("a-b_c", "2.0.0-rc.1")] {
            let id = AppIdentifier::new("ck", name, version);
            let composite = id.composite();
            let parsed = AppIdentifier::parse(&composite).unwrap();
            assert_eq!(parsed, id);
            assert_eq!(parsed.composite(), composite);
        }
    }

    #[test]
    fn test_parse_rejects_malformed_names() {
        for bad in [
            "",
            "svc",
            "ck/svc@v1",
            "@ck/svc",
            "@ck/svc@1",
            "@/svc@v1",
            "@ck/@v1",
            "@ck/svc@v",
            "@ck/svc@v1@v2",
            "@ck/nested/svc@v1",
        ] {
            assert!(AppIdentifier::parse(bad).is_err(), "expected '{}' to be rejected", bad);
        }
    }

    #[test]
    fn test_same_definition_ignores_script() {
        let a = AppDefinition::new("@ck/svc@v1", "/a/server.js", 7000, "/svc");
        let b = AppDefinition::new("@ck/svc@v1", "/b/server.js", 7000, "/svc");
        assert!(a.is_same_definition(&b));

        let c = AppDefinition::new("@ck/svc@v1", "/a/server.js", 7001, "/svc");
        assert!(!a.is_same_definition(&c));
    }

    #[test]
    fn test_other_version_of() {
        let v1 = AppDefinition::new("@ck/svc@v1", "s", 7000, "/svc");
        let v2 = AppDefinition::new("@ck/svc@v2", "s", 7001, "/svc");
        let other = AppDefinition::new("@ck/other@v2", "s", 7002, "/other");
        assert!(v1.is_other_version_of(&v2));
        assert!(!v1.is_other_version_of(&v1));
        assert!(!v2.is_other_version_of(&other));
    }

    #[test]
    fn test_definition_json_wire_format() {
        let json = r#"{"name":"@ck/svc@v1","script":"./server.js","port":7000,"path":"/svc"}"#;
        let def: AppDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(def.port, Some(7000));
        assert_eq!(def.path, "/svc");

        let unassigned: AppDefinition =
            serde_json::from_str(r#"{"name":"@ck/svc@v1","script":"s","port":-1,"path":""}"#).unwrap();
        assert_eq!(unassigned.port, None);
        assert_eq!(serde_json::to_value(&unassigned).unwrap()["port"], -1);

        let too_big = serde_json::from_str::<AppDefinition>(
            r#"{"name":"@ck/svc@v1","script":"s","port":70000,"path":""}"#,
        );
        assert!(too_big.is_err());
    }
}
