//! Admission of applications at startup and at runtime
//!
//! Every mutation of the application set goes through [`Registrar`], which
//! holds one async lock for the whole check → supervisor call → commit
//! sequence so concurrent registrations cannot interleave.

use crate::app::AppDefinition;
use crate::conflict::{self, Verdict};
use crate::error::{RegistrationError, SupervisorError};
use crate::registry::AppRegistry;
use crate::router::RouteTable;
use crate::supervisor::{LaunchSpec, StatusCache};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// What a successful registration did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationOutcome {
    /// New application, started and added
    Admitted,
    /// Identical definition already present, restarted
    Refreshed,
    /// Same name with a new port or path, old process replaced
    Superseded,
}

impl RegistrationOutcome {
    pub fn message(&self) -> &'static str {
        match self {
            RegistrationOutcome::Admitted => "App registered successfully",
            RegistrationOutcome::Refreshed => "App refreshed successfully",
            RegistrationOutcome::Superseded => "App updated successfully",
        }
    }
}

pub struct Registrar {
    registry: Arc<AppRegistry>,
    routes: Arc<RouteTable>,
    status: Arc<StatusCache>,
    port_env: String,
    lock: Mutex<()>,
}

impl Registrar {
    pub fn new(
        registry: Arc<AppRegistry>,
        routes: Arc<RouteTable>,
        status: Arc<StatusCache>,
        port_env: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            routes,
            status,
            port_env: port_env.into(),
            lock: Mutex::new(()),
        }
    }

    fn launch_spec(&self, app: &AppDefinition) -> Result<LaunchSpec, RegistrationError> {
        let port = app
            .port
            .ok_or_else(|| RegistrationError::Invalid(format!("App {} has no port assigned", app.name)))?;

        let mut env = HashMap::new();
        env.insert(self.port_env.clone(), port.to_string());

        Ok(LaunchSpec {
            name: app.name.clone(),
            script: app.script.clone(),
            env,
        })
    }

    /// Commit before mounting so a matched prefix always has an entry
    fn publish(&self, app: &AppDefinition) {
        self.status.invalidate(&app.name);
        self.registry.commit(app.clone());
        self.routes.register_app(app);
    }

    /// Relaunch a stopped definition whose replacement failed to start.
    /// If that fails too the definition leaves the set.
    async fn restore(&self, previous: &AppDefinition) {
        let relaunched = match self.launch_spec(previous) {
            Ok(spec) => self.status.supervisor().start(spec).await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        self.status.invalidate(&previous.name);

        match relaunched {
            Ok(()) => warn!(
                app = %previous.name,
                port = %previous.port_display(),
                "Replacement failed to start, previous definition relaunched"
            ),
            Err(e) => {
                error!(app = %previous.name, error = %e, "Failed to relaunch previous definition, removing it");
                self.registry.remove(&previous.name);
            }
        }
    }

    /// Admit, refresh or supersede `candidate`
    pub async fn register(
        &self,
        candidate: AppDefinition,
    ) -> Result<RegistrationOutcome, RegistrationError> {
        let _guard = self.lock.lock().await;
        let started = Instant::now();

        candidate
            .identifier()
            .map_err(|e| RegistrationError::Invalid(e.to_string()))?;
        let spec = self.launch_spec(&candidate)?;

        if let Verdict::Reject(reason) = self.registry.try_admit(&candidate) {
            warn!(app = %candidate.name, %reason, "Registration rejected");
            return Err(RegistrationError::Conflict(reason));
        }

        let supervisor = self.status.supervisor();
        let outcome = match self.registry.find(&candidate.name) {
            Some(existing) if existing.is_same_definition(&candidate) => {
                supervisor.restart(&candidate.name).await?;
                self.status.invalidate(&candidate.name);
                RegistrationOutcome::Refreshed
            }
            Some(existing) => {
                info!(
                    app = %candidate.name,
                    old_port = %existing.port_display(),
                    new_port = %candidate.port_display(),
                    "Replacing application definition"
                );
                match supervisor.stop(&existing.name).await {
                    Ok(()) | Err(SupervisorError::UnknownProcess(_)) => {}
                    Err(e) => return Err(e.into()),
                }
                self.status.invalidate(&existing.name);
                if let Err(e) = supervisor.start(spec).await {
                    self.restore(&existing).await;
                    return Err(e.into());
                }
                self.publish(&candidate);
                RegistrationOutcome::Superseded
            }
            None => {
                supervisor.start(spec).await?;
                self.publish(&candidate);
                RegistrationOutcome::Admitted
            }
        };

        info!(
            app = %candidate.name,
            port = %candidate.port_display(),
            path = %candidate.path,
            outcome = ?outcome,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Registration complete"
        );
        Ok(outcome)
    }

    /// Admit the discovered applications at startup.
    ///
    /// Conflicting applications are skipped and start failures are logged;
    /// only a failure to describe a process aborts.
    pub async fn bootstrap(&self, apps: Vec<AppDefinition>) -> Result<usize, SupervisorError> {
        let _guard = self.lock.lock().await;
        let started = Instant::now();
        let mut admitted = 0;

        for (index, app) in apps.iter().enumerate() {
            let others: Vec<AppDefinition> = apps
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != index)
                .map(|(_, a)| a.clone())
                .collect();

            if let Verdict::Reject(reason) = conflict::check(app, &others) {
                warn!(app = %app.name, %reason, "Skipping conflicting application");
                continue;
            }

            let spec = match self.launch_spec(app) {
                Ok(spec) => spec,
                Err(e) => {
                    warn!(app = %app.name, error = %e, "Skipping application");
                    continue;
                }
            };

            let supervisor = self.status.supervisor();
            let online = supervisor
                .describe(&app.name)
                .await?
                .map(|info| info.is_online())
                .unwrap_or(false);

            if online {
                info!(app = %app.name, "Already online");
            } else if let Err(e) = supervisor.start(spec).await {
                error!(app = %app.name, error = %e, "Failed to start application");
            }

            self.publish(app);
            admitted += 1;
        }

        info!(
            admitted,
            discovered = apps.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Bootstrap complete"
        );
        Ok(admitted)
    }

    pub fn registry(&self) -> &Arc<AppRegistry> {
        &self.registry
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    pub fn status(&self) -> &Arc<StatusCache> {
        &self.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::select_target;
    use crate::supervisor::{ProcessInfo, ProcessStatus, ProcessSupervisor};
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;
    use std::collections::HashSet;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSupervisor {
        calls: SyncMutex<Vec<String>>,
        online: SyncMutex<HashMap<String, bool>>,
        fail_start: SyncMutex<bool>,
        fail_ports: SyncMutex<HashSet<String>>,
        fail_describe: SyncMutex<bool>,
        start_delay: SyncMutex<Duration>,
    }

    impl RecordingSupervisor {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl ProcessSupervisor for RecordingSupervisor {
        async fn describe(&self, name: &str) -> Result<Option<ProcessInfo>, SupervisorError> {
            if *self.fail_describe.lock() {
                return Err(SupervisorError::Describe {
                    name: name.to_string(),
                    reason: "daemon unreachable".to_string(),
                });
            }
            Ok(self.online.lock().get(name).map(|online| {
                let status = if *online { ProcessStatus::Online } else { ProcessStatus::Stopped };
                ProcessInfo::new(name, status)
            }))
        }

        async fn start(&self, spec: LaunchSpec) -> Result<(), SupervisorError> {
            self.calls
                .lock()
                .push(format!("start {} PORT={}", spec.name, spec.env["PORT"]));
            let delay = *self.start_delay.lock();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if *self.fail_start.lock() || self.fail_ports.lock().contains(&spec.env["PORT"]) {
                return Err(SupervisorError::Start {
                    name: spec.name,
                    reason: "boom".to_string(),
                });
            }
            self.online.lock().insert(spec.name, true);
            Ok(())
        }

        async fn restart(&self, name: &str) -> Result<(), SupervisorError> {
            self.calls.lock().push(format!("restart {}", name));
            Ok(())
        }

        async fn stop(&self, name: &str) -> Result<(), SupervisorError> {
            self.calls.lock().push(format!("stop {}", name));
            self.online.lock().insert(name.to_string(), false);
            Ok(())
        }
    }

    fn registrar(supervisor: Arc<RecordingSupervisor>) -> Registrar {
        let cache = StatusCache::new(supervisor, Duration::ZERO);
        Registrar::new(
            Arc::new(AppRegistry::new()),
            Arc::new(RouteTable::new()),
            Arc::new(cache),
            "PORT",
        )
    }

    fn app(name: &str, port: u16, path: &str) -> AppDefinition {
        AppDefinition::new(name, "/srv/server.js", port, path)
    }

    #[tokio::test]
    async fn test_register_new_app_starts_and_commits() {
        let supervisor = Arc::new(RecordingSupervisor::default());
        let registrar = registrar(supervisor.clone());

        let outcome = registrar.register(app("@ck/a@v1", 7000, "/a")).await.unwrap();

        assert_eq!(outcome, RegistrationOutcome::Admitted);
        assert_eq!(outcome.message(), "App registered successfully");
        assert_eq!(supervisor.calls(), vec!["start @ck/a@v1 PORT=7000"]);
        assert_eq!(registrar.registry().len(), 1);
        assert_eq!(registrar.routes().match_prefix("/a/x").as_deref(), Some("/a"));
        assert!(registrar.routes().has_health_endpoint("@ck/a@v1"));
    }

    #[tokio::test]
    async fn test_reregister_identical_restarts() {
        let supervisor = Arc::new(RecordingSupervisor::default());
        let registrar = registrar(supervisor.clone());

        registrar.register(app("@ck/a@v1", 7000, "/a")).await.unwrap();
        let outcome = registrar.register(app("@ck/a@v1", 7000, "/a")).await.unwrap();

        assert_eq!(outcome, RegistrationOutcome::Refreshed);
        assert_eq!(supervisor.calls()[1], "restart @ck/a@v1");
        assert_eq!(registrar.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_port_conflict_rejected_without_supervisor_calls() {
        let supervisor = Arc::new(RecordingSupervisor::default());
        let registrar = registrar(supervisor.clone());

        registrar.register(app("@ck/a@v1", 7000, "/a")).await.unwrap();
        let err = registrar.register(app("@ck/b@v1", 7000, "/b")).await.unwrap_err();

        assert!(matches!(err, RegistrationError::Conflict(_)));
        assert!(err.to_string().contains("Port: 7000"));
        assert_eq!(supervisor.calls().len(), 1);
        assert_eq!(registrar.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_path_conflict_rejected() {
        let supervisor = Arc::new(RecordingSupervisor::default());
        let registrar = registrar(supervisor.clone());

        registrar.register(app("@ck/a@v1", 7000, "/shared")).await.unwrap();
        let err = registrar.register(app("@ck/b@v1", 7001, "/shared")).await.unwrap_err();
        assert!(err.to_string().contains("Path: /shared"));
    }

    #[tokio::test]
    async fn test_second_version_coexists() {
        let supervisor = Arc::new(RecordingSupervisor::default());
        let registrar = registrar(supervisor.clone());

        registrar.register(app("@ck/shop@v1", 7000, "/shop")).await.unwrap();
        let outcome = registrar.register(app("@ck/shop@v2", 7001, "/shop")).await.unwrap();

        assert_eq!(outcome, RegistrationOutcome::Admitted);
        assert_eq!(registrar.registry().len(), 2);
    }

    #[tokio::test]
    async fn test_changed_port_supersedes() {
        let supervisor = Arc::new(RecordingSupervisor::default());
        let registrar = registrar(supervisor.clone());

        registrar.register(app("@ck/a@v1", 7000, "/a")).await.unwrap();
        let outcome = registrar.register(app("@ck/a@v1", 7001, "/a")).await.unwrap();

        assert_eq!(outcome, RegistrationOutcome::Superseded);
        assert_eq!(outcome.message(), "App updated successfully");
        assert_eq!(
            supervisor.calls(),
            vec!["start @ck/a@v1 PORT=7000", "stop @ck/a@v1", "start @ck/a@v1 PORT=7001"]
        );
        let apps = registrar.registry().snapshot();
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].port, Some(7001));
    }

    #[tokio::test]
    async fn test_failed_replacement_relaunches_previous() {
        let supervisor = Arc::new(RecordingSupervisor::default());
        let registrar = registrar(supervisor.clone());

        registrar.register(app("@ck/a@v1", 7000, "/a")).await.unwrap();
        supervisor.fail_ports.lock().insert("7001".to_string());
        let err = registrar.register(app("@ck/a@v1", 7001, "/a")).await.unwrap_err();

        assert!(matches!(err, RegistrationError::Supervisor(_)));
        assert_eq!(
            supervisor.calls(),
            vec![
                "start @ck/a@v1 PORT=7000",
                "stop @ck/a@v1",
                "start @ck/a@v1 PORT=7001",
                "start @ck/a@v1 PORT=7000",
            ]
        );
        let apps = registrar.registry().snapshot();
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].port, Some(7000));
        let info = registrar.status().describe("@ck/a@v1").await.unwrap().unwrap();
        assert!(info.is_online());
    }

    #[tokio::test]
    async fn test_failed_replacement_and_relaunch_removes_entry() {
        let supervisor = Arc::new(RecordingSupervisor::default());
        let registrar = registrar(supervisor.clone());

        registrar.register(app("@ck/a@v1", 7000, "/a")).await.unwrap();
        *supervisor.fail_start.lock() = true;
        let err = registrar.register(app("@ck/a@v1", 7001, "/a")).await.unwrap_err();

        assert!(matches!(err, RegistrationError::Supervisor(_)));
        assert!(registrar.registry().is_empty());
        assert!(registrar.routes().match_prefix("/a").is_some());
        assert!(select_target(registrar.registry(), "/a", None).is_none());
    }

    #[tokio::test]
    async fn test_concurrent_registrations_are_serialized() {
        let supervisor = Arc::new(RecordingSupervisor::default());
        *supervisor.start_delay.lock() = Duration::from_millis(50);
        let registrar = Arc::new(registrar(supervisor.clone()));

        let (first, second) = tokio::join!(
            registrar.register(app("@ck/a@v1", 7000, "/a")),
            registrar.register(app("@ck/b@v1", 7000, "/b")),
        );

        let admitted = [&first, &second].iter().filter(|r| r.is_ok()).count();
        assert_eq!(admitted, 1);
        let rejected = if first.is_ok() { second } else { first };
        assert!(matches!(rejected, Err(RegistrationError::Conflict(_))));
        assert_eq!(supervisor.calls().len(), 1);
        assert_eq!(registrar.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_same_port_different_path_is_conflict() {
        let supervisor = Arc::new(RecordingSupervisor::default());
        let registrar = registrar(supervisor.clone());

        registrar.register(app("@ck/a@v1", 7000, "/a")).await.unwrap();
        let err = registrar.register(app("@ck/a@v1", 7000, "/a2")).await.unwrap_err();
        assert!(matches!(err, RegistrationError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_failed_start_commits_nothing() {
        let supervisor = Arc::new(RecordingSupervisor::default());
        *supervisor.fail_start.lock() = true;
        let registrar = registrar(supervisor.clone());

        let err = registrar.register(app("@ck/a@v1", 7000, "/a")).await.unwrap_err();

        assert!(matches!(err, RegistrationError::Supervisor(_)));
        assert!(registrar.registry().is_empty());
        assert!(registrar.routes().match_prefix("/a").is_none());
    }

    #[tokio::test]
    async fn test_invalid_definitions_rejected() {
        let supervisor = Arc::new(RecordingSupervisor::default());
        let registrar = registrar(supervisor.clone());

        let unassigned = AppDefinition::unassigned("@ck/a@v1", "server.js", "/a");
        assert!(matches!(
            registrar.register(unassigned).await,
            Err(RegistrationError::Invalid(_))
        ));
        assert!(matches!(
            registrar.register(app("not-a-name", 7000, "/a")).await,
            Err(RegistrationError::Invalid(_))
        ));
        assert!(supervisor.calls().is_empty());
    }

    #[tokio::test]
    async fn test_bootstrap_starts_offline_and_skips_online() {
        let supervisor = Arc::new(RecordingSupervisor::default());
        supervisor.online.lock().insert("@ck/b@v1".to_string(), true);
        let registrar = registrar(supervisor.clone());

        let admitted = registrar
            .bootstrap(vec![app("@ck/a@v1", 7000, "/a"), app("@ck/b@v1", 7001, "/b")])
            .await
            .unwrap();

        assert_eq!(admitted, 2);
        assert_eq!(supervisor.calls(), vec!["start @ck/a@v1 PORT=7000"]);
        assert_eq!(registrar.registry().len(), 2);
    }

    #[tokio::test]
    async fn test_bootstrap_skips_conflicts_and_keeps_failed_starts() {
        let supervisor = Arc::new(RecordingSupervisor::default());
        *supervisor.fail_start.lock() = true;
        let registrar = registrar(supervisor.clone());

        let admitted = registrar
            .bootstrap(vec![
                app("@ck/a@v1", 7000, "/a"),
                app("@ck/b@v1", 7001, "/same"),
                app("@ck/c@v1", 7002, "/same"),
            ])
            .await
            .unwrap();

        assert_eq!(admitted, 1);
        assert_eq!(registrar.registry().snapshot()[0].name, "@ck/a@v1");
        assert!(registrar.routes().match_prefix("/a").is_some());
    }

    #[tokio::test]
    async fn test_bootstrap_describe_failure_is_fatal() {
        let supervisor = Arc::new(RecordingSupervisor::default());
        *supervisor.fail_describe.lock() = true;
        let registrar = registrar(supervisor.clone());

        let result = registrar.bootstrap(vec![app("@ck/a@v1", 7000, "/a")]).await;
        assert!(result.is_err());
        assert!(registrar.registry().is_empty());
    }
}
