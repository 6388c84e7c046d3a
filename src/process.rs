//! Process supervisor that runs backends as local child processes

use crate::config::SupervisorConfig;
use crate::error::SupervisorError;
use crate::supervisor::{LaunchSpec, ProcessInfo, ProcessStatus, ProcessSupervisor};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

/// CPU time observed at a point in time, used to derive a usage percentage
#[derive(Debug, Clone, Copy)]
struct CpuSample {
    at: Instant,
    ticks: u64,
}

/// A process launched by this supervisor
struct ManagedProcess {
    /// Launch spec used for restarts
    spec: LaunchSpec,
    /// Child handle while the process is (believed to be) running
    child: Option<Child>,
    status: ProcessStatus,
    pid: Option<u32>,
    last_cpu: Option<CpuSample>,
}

impl ManagedProcess {
    fn new(spec: LaunchSpec) -> Self {
        Self {
            spec,
            child: None,
            status: ProcessStatus::Launching,
            pid: None,
            last_cpu: None,
        }
    }

    /// Fold an exited child into the recorded status
    fn refresh(&mut self, name: &str) {
        let Some(child) = self.child.as_mut() else {
            return;
        };
        match child.try_wait() {
            Ok(None) => {}
            Ok(Some(exit)) => {
                self.status = if exit.success() {
                    ProcessStatus::Stopped
                } else {
                    ProcessStatus::Errored
                };
                info!(app = name, ?exit, status = %self.status, "Backend process exited");
                self.child = None;
                self.pid = None;
                self.last_cpu = None;
            }
            Err(e) => {
                warn!(app = name, error = %e, "Failed to poll backend process");
                self.status = ProcessStatus::Errored;
            }
        }
    }
}

/// Supervises backends as local child processes.
///
/// `LocalSupervisor` is designed to be shared behind an `Arc`; the
/// [`new`](LocalSupervisor::new) constructor returns `Arc<Self>` directly.
/// Children are killed if the supervisor is dropped without stopping them.
pub struct LocalSupervisor {
    /// Processes keyed by composite application name
    processes: DashMap<String, Mutex<ManagedProcess>>,
    config: SupervisorConfig,
}

impl LocalSupervisor {
    pub fn new(config: SupervisorConfig) -> Arc<Self> {
        Arc::new(Self {
            processes: DashMap::new(),
            config,
        })
    }

    fn grace_period(&self) -> Duration {
        Duration::from_secs(self.config.shutdown_grace_period_secs)
    }

    fn build_command(&self, spec: &LaunchSpec) -> Command {
        let mut cmd = match self.config.interpreter.as_deref() {
            Some(interpreter) => {
                let mut cmd = Command::new(interpreter);
                cmd.arg(&spec.script);
                cmd
            }
            None => Command::new(&spec.script),
        };

        if let Some(dir) = Path::new(&spec.script).parent().filter(|d| d.is_dir()) {
            cmd.current_dir(dir);
        }

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        cmd
    }

    /// Spawn the child for an already-registered entry and record the outcome
    fn launch(&self, spec: &LaunchSpec) -> Result<(), String> {
        info!(app = %spec.name, script = %spec.script, "Starting backend");

        let spawned = self.build_command(spec).spawn();

        let Some(entry) = self.processes.get(&spec.name) else {
            return Err("process entry vanished during launch".to_string());
        };
        let mut process = entry.lock();

        match spawned {
            Ok(mut child) => {
                let pid = child.id();
                if let Some(stdout) = child.stdout.take() {
                    relay_output(spec.name.clone(), stdout, false);
                }
                if let Some(stderr) = child.stderr.take() {
                    relay_output(spec.name.clone(), stderr, true);
                }

                process.child = Some(child);
                process.pid = pid;
                process.status = ProcessStatus::Online;
                process.last_cpu = Some(CpuSample {
                    at: Instant::now(),
                    ticks: 0,
                });
                info!(app = %spec.name, pid = pid.unwrap_or(0), "Backend process spawned");
                Ok(())
            }
            Err(e) => {
                process.status = ProcessStatus::Errored;
                process.pid = None;
                error!(app = %spec.name, error = %e, "Failed to spawn backend");
                Err(e.to_string())
            }
        }
    }

    /// Take the child out of an entry and stop it; leaves the entry `stopped`
    async fn halt(&self, name: &str) {
        let child = match self.processes.get(name) {
            Some(entry) => {
                let mut process = entry.lock();
                let child = process.child.take();
                if child.is_some() {
                    process.status = ProcessStatus::Stopping;
                }
                child
            }
            None => return,
        };

        if let Some(mut child) = child {
            stop_child(name, &mut child, self.grace_period()).await;
        }

        if let Some(entry) = self.processes.get(name) {
            let mut process = entry.lock();
            process.status = ProcessStatus::Stopped;
            process.pid = None;
            process.last_cpu = None;
        }
    }

    /// Stop every running backend
    pub async fn stop_all(&self) {
        let names: Vec<String> = self.processes.iter().map(|e| e.key().clone()).collect();
        for name in names {
            self.halt(&name).await;
        }
    }
}

#[async_trait]
impl ProcessSupervisor for LocalSupervisor {
    async fn describe(&self, name: &str) -> Result<Option<ProcessInfo>, SupervisorError> {
        let Some(entry) = self.processes.get(name) else {
            return Ok(None);
        };
        let mut process = entry.lock();
        process.refresh(name);

        let mut info = ProcessInfo::new(name, process.status);
        info.pid = process.pid;
        if let Some(pid) = process.pid {
            let (memory, cpu) = sample_usage(pid, &mut process.last_cpu);
            info.memory_bytes = memory;
            info.cpu_percent = cpu;
        }
        Ok(Some(info))
    }

    async fn start(&self, spec: LaunchSpec) -> Result<(), SupervisorError> {
        if self.processes.contains_key(&spec.name) {
            debug!(app = %spec.name, "Replacing existing process");
            self.halt(&spec.name).await;
        }

        self.processes
            .insert(spec.name.clone(), Mutex::new(ManagedProcess::new(spec.clone())));

        self.launch(&spec).map_err(|reason| SupervisorError::Start {
            name: spec.name.clone(),
            reason,
        })
    }

    async fn restart(&self, name: &str) -> Result<(), SupervisorError> {
        let spec = self
            .processes
            .get(name)
            .map(|entry| entry.lock().spec.clone())
            .ok_or_else(|| SupervisorError::UnknownProcess(name.to_string()))?;

        info!(app = name, "Restarting backend");
        self.halt(name).await;

        if let Some(entry) = self.processes.get(name) {
            entry.lock().status = ProcessStatus::Launching;
        }

        self.launch(&spec).map_err(|reason| SupervisorError::Restart {
            name: name.to_string(),
            reason,
        })
    }

    async fn stop(&self, name: &str) -> Result<(), SupervisorError> {
        if !self.processes.contains_key(name) {
            return Err(SupervisorError::UnknownProcess(name.to_string()));
        }
        self.halt(name).await;
        Ok(())
    }
}

/// Forward a child's output stream to the log, line by line
fn relay_output<R>(name: String, stream: R, is_stderr: bool)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if is_stderr => warn!(app = %name, "{}", line),
                Ok(Some(line)) => info!(app = %name, "{}", line),
                Ok(None) => break,
                Err(e) => {
                    debug!(app = %name, error = %e, "Output stream closed");
                    break;
                }
            }
        }
    });
}

/// SIGTERM, wait for the grace period, then SIGKILL
async fn stop_child(name: &str, child: &mut Child, grace_period: Duration) {
    if let Some(pid) = child.id() {
        info!(app = name, pid, "Sending SIGTERM to backend");

        #[cfg(unix)]
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }

        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }
    }

    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(Ok(status)) => {
            info!(app = name, ?status, "Backend process exited gracefully");
        }
        Ok(Err(e)) => {
            warn!(app = name, error = %e, "Error waiting for backend to exit");
        }
        Err(_) => {
            warn!(
                app = name,
                grace_period_secs = grace_period.as_secs(),
                "Grace period exceeded, sending SIGKILL"
            );
            let _ = child.kill().await;
        }
    }
}

/// Resident memory in bytes and CPU percentage since the previous sample
#[cfg(target_os = "linux")]
fn sample_usage(pid: u32, last: &mut Option<CpuSample>) -> (Option<u64>, Option<f64>) {
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let ticks_per_sec = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };

    let memory = std::fs::read_to_string(format!("/proc/{}/statm", pid))
        .ok()
        .and_then(|statm| statm.split_whitespace().nth(1)?.parse::<u64>().ok())
        .filter(|_| page_size > 0)
        .map(|pages| pages * page_size as u64);

    let ticks = std::fs::read_to_string(format!("/proc/{}/stat", pid))
        .ok()
        .and_then(|stat| parse_cpu_ticks(&stat));

    let cpu = match (ticks, last.as_ref()) {
        (Some(now_ticks), Some(previous)) if ticks_per_sec > 0 => {
            let elapsed = previous.at.elapsed().as_secs_f64();
            let used = now_ticks.saturating_sub(previous.ticks) as f64 / ticks_per_sec as f64;
            (elapsed > 0.0).then(|| (used / elapsed * 100.0 * 10.0).round() / 10.0)
        }
        _ => None,
    };

    if let Some(ticks) = ticks {
        *last = Some(CpuSample {
            at: Instant::now(),
            ticks,
        });
    }

    (memory, cpu)
}

#[cfg(not(target_os = "linux"))]
fn sample_usage(_pid: u32, _last: &mut Option<CpuSample>) -> (Option<u64>, Option<f64>) {
    (None, None)
}

/// utime + stime from the contents of `/proc/<pid>/stat`
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_cpu_ticks(stat: &str) -> Option<u64> {
    // The command name may contain spaces; fields resume after the last ')'
    let (_, rest) = stat.rsplit_once(')')?;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}
