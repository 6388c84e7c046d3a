//! Process supervisor interface
//!
//! The gateway never spawns backends itself; it asks a supervisor to
//! describe, start, restart and stop processes by name. Every call
//! completes exactly once with either a value or a [`SupervisorError`].

use crate::error::SupervisorError;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Status of a supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessStatus {
    Online,
    Launching,
    Stopping,
    Stopped,
    Errored,
    OneLaunchStatus,
}

impl ProcessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::Online => "online",
            ProcessStatus::Launching => "launching",
            ProcessStatus::Stopping => "stopping",
            ProcessStatus::Stopped => "stopped",
            ProcessStatus::Errored => "errored",
            ProcessStatus::OneLaunchStatus => "one-launch-status",
        }
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the supervisor knows about one process
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessInfo {
    pub name: String,
    pub status: ProcessStatus,
    pub pid: Option<u32>,
    pub memory_bytes: Option<u64>,
    pub cpu_percent: Option<f64>,
}

impl ProcessInfo {
    pub fn new(name: impl Into<String>, status: ProcessStatus) -> Self {
        Self {
            name: name.into(),
            status,
            pid: None,
            memory_bytes: None,
            cpu_percent: None,
        }
    }

    pub fn is_online(&self) -> bool {
        self.status == ProcessStatus::Online
    }
}

/// Everything needed to launch a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub name: String,
    pub script: String,
    pub env: HashMap<String, String>,
}

#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    /// Current state of `name`, or `None` if the supervisor has never seen it
    async fn describe(&self, name: &str) -> Result<Option<ProcessInfo>, SupervisorError>;

    /// Launch a process; replaces a running process of the same name
    async fn start(&self, spec: LaunchSpec) -> Result<(), SupervisorError>;

    /// Restart a known process with its last launch spec
    async fn restart(&self, name: &str) -> Result<(), SupervisorError>;

    /// Stop a process and keep it known as stopped
    async fn stop(&self, name: &str) -> Result<(), SupervisorError>;
}

pub type SharedSupervisor = Arc<dyn ProcessSupervisor>;

/// Short-lived cache in front of [`ProcessSupervisor::describe`]
///
/// Only successful lookups are cached. A zero TTL disables caching.
pub struct StatusCache {
    supervisor: SharedSupervisor,
    ttl: Duration,
    entries: DashMap<String, (Instant, Option<ProcessInfo>)>,
}

impl StatusCache {
    pub fn new(supervisor: SharedSupervisor, ttl: Duration) -> Self {
        Self {
            supervisor,
            ttl,
            entries: DashMap::new(),
        }
    }

    pub fn supervisor(&self) -> &SharedSupervisor {
        &self.supervisor
    }

    pub async fn describe(&self, name: &str) -> Result<Option<ProcessInfo>, SupervisorError> {
        if !self.ttl.is_zero() {
            if let Some(entry) = self.entries.get(name) {
                let (fetched_at, info) = entry.value();
                if fetched_at.elapsed() < self.ttl {
                    return Ok(info.clone());
                }
            }
        }

        let info = self.supervisor.describe(name).await?;
        if !self.ttl.is_zero() {
            self.entries
                .insert(name.to_string(), (Instant::now(), info.clone()));
        }
        Ok(info)
    }

    pub fn invalidate(&self, name: &str) {
        if self.entries.remove(name).is_some() {
            debug!(app = name, "Invalidated cached process status");
        }
    }
}
