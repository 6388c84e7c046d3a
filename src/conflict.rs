//! Admission checks for new or changed application definitions
//!
//! Different applications must never collide on a port or a path prefix.
//! Versions of the same application may share a prefix but never a port,
//! and re-registering an identical definition is always allowed.

use crate::app::AppDefinition;

/// Outcome of an admission check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Admit,
    Reject(String),
}

impl Verdict {
    pub fn is_admit(&self) -> bool {
        matches!(self, Verdict::Admit)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Verdict::Admit => None,
            Verdict::Reject(reason) => Some(reason),
        }
    }
}

fn port_in_use(candidate: &AppDefinition) -> Verdict {
    Verdict::Reject(format!(
        "App {} Port: {} is already in use.",
        candidate.name,
        candidate.port_display()
    ))
}

fn path_in_use(candidate: &AppDefinition) -> Verdict {
    Verdict::Reject(format!(
        "App {} Path: {} is already in use.",
        candidate.name, candidate.path
    ))
}

/// Decide whether `candidate` may join `existing`
pub fn check(candidate: &AppDefinition, existing: &[AppDefinition]) -> Verdict {
    if let Some(current) = existing.iter().find(|app| app.name == candidate.name) {
        if current.is_same_definition(candidate) {
            return Verdict::Admit;
        }
        if current.port == candidate.port {
            return port_in_use(candidate);
        }
        // A matched entry always carries the candidate's own version, so
        // multi-version coexistence is settled by the set-wide checks below.
    }

    if existing.iter().any(|app| app.port == candidate.port) {
        return port_in_use(candidate);
    }

    let base_name = candidate.base_name();
    if existing
        .iter()
        .any(|app| app.path == candidate.path && app.base_name() != base_name)
    {
        return path_in_use(candidate);
    }

    Verdict::Admit
}
