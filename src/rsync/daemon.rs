//! The rsync daemon supervisor: a detached process that keeps a workflow task synchronized
//! with a local directory. The parent spawns it, hands over parameters through the
//! environment, and tracks it with a JSON PID file; the daemon polls the task, owns the
//! engine and the filesystem observer, and removes the PID file on exit.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::client::ServiceClient;
use crate::login::{LoginConfig, LoginManager};
use crate::rsync::client::{RsyncClient, RsyncClientOptions};
use crate::rsync::watch::WorkspaceObserver;
use crate::rsync::{get_workflow_task, RsyncRequest};
use crate::{config, OsmoError, Result};

/// Environment variable carrying the serialized [`DaemonParams`] into the child process.
pub const DAEMON_PARAMS_ENV: &str = "OSMO_RSYNC_DAEMON_PARAMS";

/// Task statuses under which the daemon keeps waiting for the task to come up.
const PENDING_STATUSES: &[&str] = &[
    "SUBMITTING",
    "WAITING",
    "PROCESSING",
    "SCHEDULING",
    "INITIALIZING",
    "RESCHEDULED",
];

/// Metadata persisted in the PID file. The file exists iff a daemon with `pid` is expected to
/// be alive; `last_synced` is updated in place after every successful upload.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RsyncDaemonMetadata {
    pub pid: u32,
    pub rsync_request: RsyncRequest,
    pub start_time: String,
    #[serde(default)]
    pub last_synced: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RsyncDaemonStatus {
    Running,
    Stopped,
}

impl RsyncDaemonStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RsyncDaemonStatus::Running => "RUNNING",
            RsyncDaemonStatus::Stopped => "STOPPED",
        }
    }
}

/// A daemon discovered from its PID file.
#[derive(Debug, Clone)]
pub struct RsyncDaemonInfo {
    pub metadata: RsyncDaemonMetadata,
    pub status: RsyncDaemonStatus,
    pub log_file: Option<PathBuf>,
}

/// Everything the detached child needs to run, serialized into its environment.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DaemonParams {
    pub rsync_request: RsyncRequest,
    pub poll_interval: f64,
    pub debounce_delay: f64,
    pub reconcile_interval: f64,
    pub timeout_secs: u64,
    pub rate_limit: Option<u64>,
    pub max_log_size: u64,
    pub verbose: bool,
}

fn daemon_dir() -> PathBuf {
    config::client_state_dir().join("rsync")
}

pub fn log_file_path(workflow_id: &str, task_name: &str) -> PathBuf {
    daemon_dir().join(format!("rsync_daemon_{}_{}.log", workflow_id, task_name))
}

pub fn pid_file_path(workflow_id: &str, task_name: &str) -> PathBuf {
    daemon_dir().join(format!("rsync_daemon_{}_{}.pid", workflow_id, task_name))
}

#[cfg(unix)]
fn is_process_running(pid: u32) -> bool {
    // Signal 0 probes liveness without delivering anything
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
fn is_process_running(_pid: u32) -> bool {
    false
}

fn read_metadata(pid_file: &Path) -> Result<RsyncDaemonMetadata> {
    let raw = std::fs::read_to_string(pid_file)?;
    serde_json::from_str(&raw).map_err(OsmoError::from)
}

/// Whether a live daemon already exists for the request. A stale PID file (process dead) is
/// removed.
pub fn validate_daemon_exists(rsync_request: &RsyncRequest) -> Result<bool> {
    let pid_file = pid_file_path(&rsync_request.workflow_id, &rsync_request.task_name);
    if !pid_file.exists() {
        return Ok(false);
    }
    let metadata = read_metadata(&pid_file)?;
    if is_process_running(metadata.pid) {
        tracing::info!(
            "Existing rsync daemon running for {}/{} with PID {}",
            rsync_request.workflow_id,
            rsync_request.task_name,
            metadata.pid
        );
        return Ok(true);
    }
    tracing::info!(
        "Existing rsync daemon PID file exists but PID {} does not exist, removing",
        metadata.pid
    );
    std::fs::remove_file(&pid_file)?;
    Ok(false)
}

/// Lists rsync daemons from the PID files, optionally filtered by workflow, task, and status.
pub fn rsync_status(
    workflow_id: Option<&str>,
    task_name: Option<&str>,
    statuses: Option<&[RsyncDaemonStatus]>,
) -> Result<Vec<RsyncDaemonInfo>> {
    let mut daemons = Vec::new();
    let dir = daemon_dir();
    if !dir.exists() {
        return Ok(daemons);
    }

    for entry in std::fs::read_dir(&dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("pid") {
            continue;
        }
        let metadata = match read_metadata(&path) {
            Ok(metadata) => metadata,
            Err(err) => {
                tracing::error!(error = %err, "Error parsing rsync daemon metadata");
                continue;
            }
        };
        if workflow_id.is_some_and(|wf| wf != metadata.rsync_request.workflow_id) {
            continue;
        }
        if task_name.is_some_and(|task| task != metadata.rsync_request.task_name) {
            continue;
        }
        let status = if is_process_running(metadata.pid) {
            RsyncDaemonStatus::Running
        } else {
            RsyncDaemonStatus::Stopped
        };
        if statuses.is_some_and(|filter| !filter.contains(&status)) {
            continue;
        }
        let log_file = log_file_path(
            &metadata.rsync_request.workflow_id,
            &metadata.rsync_request.task_name,
        );
        daemons.push(RsyncDaemonInfo {
            metadata,
            status,
            log_file: log_file.exists().then_some(log_file),
        });
    }
    Ok(daemons)
}

/// Sends SIGTERM to a running daemon.
#[cfg(unix)]
pub fn terminate_daemon(info: &RsyncDaemonInfo) -> Result<()> {
    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(info.metadata.pid as i32),
        nix::sys::signal::Signal::SIGTERM,
    )
    .map_err(|e| OsmoError::Other(format!("Failed to signal daemon: {}", e)))
}

#[cfg(not(unix))]
pub fn terminate_daemon(_info: &RsyncDaemonInfo) -> Result<()> {
    Err(OsmoError::Other(
        "Stopping daemons is only supported on unix".to_owned(),
    ))
}

/// Spawns the rsync daemon as a detached child of the current binary. Refuses when a live
/// daemon already owns the `(workflow, task)` pair.
pub fn spawn_daemon(params: &DaemonParams, quiet: bool) -> Result<()> {
    if validate_daemon_exists(&params.rsync_request)? {
        return Err(OsmoError::user(
            "Rsync daemon already running, please stop the existing daemon before starting a \
             new one.",
        ));
    }
    std::fs::create_dir_all(daemon_dir())?;

    let exe = std::env::current_exe()?;
    let mut command = std::process::Command::new(exe);
    command
        .arg("workflow")
        .arg("rsync-daemon")
        .env(DAEMON_PARAMS_ENV, serde_json::to_string(params)?)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());

    // The daemon owns no terminal and survives the parent's session
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        unsafe {
            command.pre_exec(|| {
                nix::unistd::setsid()
                    .map(|_| ())
                    .map_err(|e| std::io::Error::other(e.to_string()))
            });
        }
    }

    let child = command.spawn()?;

    if !quiet {
        let log_file = log_file_path(
            &params.rsync_request.workflow_id,
            &params.rsync_request.task_name,
        );
        println!(
            "Rsync daemon started in detached process: PID {}",
            child.id()
        );
        println!("To view daemon logs: tail -f {}", log_file.display());
    }
    Ok(())
}

/// A size-capped log writer keeping one rotated backup (`<log>.1`).
#[derive(Clone)]
pub struct RotatingFileWriter {
    inner: Arc<std::sync::Mutex<RotatingFileState>>,
}

struct RotatingFileState {
    path: PathBuf,
    max_size: u64,
    current_size: u64,
    file: std::fs::File,
}

impl RotatingFileWriter {
    pub fn new(path: PathBuf, max_size: u64) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        let current_size = file.metadata()?.len();
        Ok(RotatingFileWriter {
            inner: Arc::new(std::sync::Mutex::new(RotatingFileState {
                path,
                max_size,
                current_size,
                file,
            })),
        })
    }
}

impl Write for RotatingFileWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut state = self.inner.lock().expect("log writer lock poisoned");
        if state.current_size + buf.len() as u64 > state.max_size {
            let backup = state.path.with_extension("log.1");
            let _ = std::fs::remove_file(&backup);
            std::fs::rename(&state.path, &backup)?;
            state.file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&state.path)?;
            state.current_size = 0;
        }
        let written = state.file.write(buf)?;
        state.current_size += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner
            .lock()
            .expect("log writer lock poisoned")
            .file
            .flush()
    }
}

struct DaemonInner {
    service_client: ServiceClient,
    request: RsyncRequest,
    pid_file: PathBuf,
    poll_interval: Duration,
    debounce_delay: Duration,
    reconcile_interval: Duration,
    timeout: Duration,
    rate_limit: Option<u64>,
    stop: CancellationToken,
    rsync_client: tokio::sync::Mutex<Option<RsyncClient>>,
    observer: tokio::sync::Mutex<Option<WorkspaceObserver>>,
}

/// Uploads a directory to a remote workflow task continuously until the task reaches a
/// terminal state, the PID file changes hands, or a signal arrives.
#[derive(Clone)]
pub struct RsyncUploadDaemon {
    inner: Arc<DaemonInner>,
}

impl RsyncUploadDaemon {
    pub fn new(service_client: ServiceClient, params: &DaemonParams, pid_file: PathBuf) -> Self {
        RsyncUploadDaemon {
            inner: Arc::new(DaemonInner {
                service_client,
                request: params.rsync_request.clone(),
                pid_file,
                poll_interval: Duration::from_secs_f64(params.poll_interval),
                debounce_delay: Duration::from_secs_f64(params.debounce_delay),
                reconcile_interval: Duration::from_secs_f64(params.reconcile_interval),
                timeout: Duration::from_secs(params.timeout_secs),
                rate_limit: params.rate_limit,
                stop: CancellationToken::new(),
                rsync_client: tokio::sync::Mutex::new(None),
                observer: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Runs the daemon loops until stopped.
    pub async fn start(&self) {
        tracing::info!("Starting rsync daemon...");

        let pid_monitor = {
            let this = self.clone();
            tokio::spawn(async move { this.poll_pid_file().await })
        };

        while !self.inner.stop.is_cancelled() {
            if let Err(err) = self.poll_task().await {
                tracing::error!(error = %err, "Error polling task");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.inner.poll_interval) => {}
                _ = self.inner.stop.cancelled() => break,
            }
        }

        pid_monitor.abort();
        tracing::info!("Rsync daemon stopped");
    }

    /// Schedules an orderly shutdown: the observer and engine stop, the loops drain.
    pub async fn stop(&self) {
        tracing::info!("Stopping rsync daemon...");
        self.inner.stop.cancel();
        if let Some(observer) = self.inner.observer.lock().await.take() {
            observer.stop();
        }
        if let Some(client) = self.inner.rsync_client.lock().await.take() {
            client.stop().await;
        }
    }

    pub fn stop_token(&self) -> CancellationToken {
        self.inner.stop.clone()
    }

    /// Re-reads the PID file every poll interval; if another process has taken ownership (or
    /// the file is gone) this daemon stands down.
    async fn poll_pid_file(&self) {
        while !self.inner.stop.is_cancelled() {
            match read_metadata(&self.inner.pid_file) {
                Ok(metadata) if metadata.pid == std::process::id() => {}
                Ok(metadata) => {
                    tracing::info!(
                        "Rsync daemon PID {} does not match current process PID {}, stopping...",
                        metadata.pid,
                        std::process::id()
                    );
                    self.stop().await;
                    break;
                }
                Err(err) => {
                    tracing::error!(error = %err, "Error reading PID file");
                    self.stop().await;
                    break;
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(self.inner.poll_interval) => {}
                _ = self.inner.stop.cancelled() => break,
            }
        }
    }

    async fn poll_task(&self) -> Result<()> {
        tracing::info!("Polling task...");
        let task = get_workflow_task(
            &self.inner.service_client,
            &self.inner.request.workflow_id,
            &self.inner.request.task_name,
            self.inner.timeout,
        )
        .await?;

        let Some(status) = task.get("status").and_then(|s| s.as_str()) else {
            tracing::error!("Task status not found");
            return Ok(());
        };

        if PENDING_STATUSES.contains(&status) {
            tracing::info!("Task is in pending state: {}", status);
            return Ok(());
        }
        if status != "RUNNING" {
            tracing::info!("Task is in terminal state: {}", status);
            self.stop().await;
            return Ok(());
        }

        tracing::info!("Task is in running state...");
        self.handle_running_task().await
    }

    /// On the first transition to running: build the engine, run the initial upload, and
    /// attach the filesystem observer.
    async fn handle_running_task(&self) -> Result<()> {
        let mut client_slot = self.inner.rsync_client.lock().await;
        if client_slot.is_none() {
            let pid_file = self.inner.pid_file.clone();
            let client = RsyncClient::new(
                self.inner.service_client.clone(),
                self.inner.request.clone(),
                RsyncClientOptions {
                    timeout: self.inner.timeout,
                    upload_rate_limit: self.inner.rate_limit,
                    reconcile_interval: self.inner.reconcile_interval,
                    upload_callback: Some(Arc::new(move || {
                        if let Err(err) = update_last_synced(&pid_file) {
                            tracing::error!(error = %err, "Error calling upload callback");
                        }
                    })),
                    stop: Some(self.inner.stop.child_token()),
                },
            );
            client.start().await?;
            client.upload().await?; // Initial sync
            *client_slot = Some(client);
        }

        let mut observer_slot = self.inner.observer.lock().await;
        if observer_slot.is_none() {
            let client = client_slot.as_ref().expect("engine built above").clone();
            *observer_slot = Some(WorkspaceObserver::start(
                &self.inner.request.src,
                client,
                self.inner.debounce_delay,
            )?);
        }
        Ok(())
    }
}

/// Rewrites the `last_synced` field of the PID file in place.
fn update_last_synced(pid_file: &Path) -> Result<()> {
    let mut metadata = read_metadata(pid_file)?;
    metadata.last_synced = Some(Local::now().to_rfc3339());
    std::fs::write(pid_file, serde_json::to_string(&metadata)?)?;
    Ok(())
}

/// Entry point of the detached daemon process (the hidden `workflow rsync-daemon`
/// subcommand). Reads its parameters from the environment, claims the PID file, wires
/// logging to the rotating file, and drives the supervisor with signal handling.
pub async fn run_daemon(login_config: LoginConfig) -> Result<()> {
    let raw_params = std::env::var(DAEMON_PARAMS_ENV)
        .map_err(|_| OsmoError::user("Missing rsync daemon parameters"))?;
    let params: DaemonParams = serde_json::from_str(&raw_params)?;

    std::fs::create_dir_all(daemon_dir())?;
    let pid_file = pid_file_path(
        &params.rsync_request.workflow_id,
        &params.rsync_request.task_name,
    );
    let metadata = RsyncDaemonMetadata {
        pid: std::process::id(),
        rsync_request: params.rsync_request.clone(),
        start_time: Local::now().to_rfc3339(),
        last_synced: None,
    };
    std::fs::write(&pid_file, serde_json::to_string(&metadata)?)?;

    let log_file = log_file_path(
        &params.rsync_request.workflow_id,
        &params.rsync_request.task_name,
    );
    let writer = RotatingFileWriter::new(log_file, params.max_log_size)?;
    let level = if params.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(format!("osmo={}", level)))
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .init();

    let login_manager = LoginManager::new(login_config, crate::LIB_USER_AGENT_PREFIX)?;
    let service_client = ServiceClient::new(login_manager)?;
    let daemon = RsyncUploadDaemon::new(service_client, &params, pid_file.clone());

    // Graceful shutdown on SIGTERM/SIGINT
    #[cfg(unix)]
    {
        let daemon = daemon.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = signal(SignalKind::terminate()).expect("signal handler installs");
            let mut sigint = signal(SignalKind::interrupt()).expect("signal handler installs");
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("Received SIGTERM, stopping daemon..."),
                _ = sigint.recv() => tracing::info!("Received SIGINT, stopping daemon..."),
            }
            daemon.stop().await;
        });
    }

    daemon.start().await;

    if pid_file.exists() {
        let _ = std::fs::remove_file(&pid_file);
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_request() -> RsyncRequest {
        RsyncRequest {
            workflow_id: "wf-1".into(),
            task_name: "task-a".into(),
            src: PathBuf::from("/tmp/data"),
            dst_module: "osmo".into(),
            dst_path: "sub".into(),
            original_dst_path: "/osmo/run/workspace/sub".into(),
        }
    }

    #[test]
    fn test_metadata_round_trips_through_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("rsync_daemon_wf-1_task-a.pid");
        let metadata = RsyncDaemonMetadata {
            pid: 4242,
            rsync_request: sample_request(),
            start_time: "2026-01-01T00:00:00Z".into(),
            last_synced: None,
        };
        std::fs::write(&pid_file, serde_json::to_string(&metadata).unwrap()).unwrap();

        let parsed = read_metadata(&pid_file).unwrap();
        assert_eq!(parsed.pid, 4242);
        assert_eq!(parsed.rsync_request, sample_request());
        assert!(parsed.last_synced.is_none());

        update_last_synced(&pid_file).unwrap();
        let parsed = read_metadata(&pid_file).unwrap();
        assert!(parsed.last_synced.is_some());
        // Only last_synced changed
        assert_eq!(parsed.start_time, "2026-01-01T00:00:00Z");
    }

    #[test]
    fn test_rotating_writer_keeps_one_backup() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("daemon.log");
        let mut writer = RotatingFileWriter::new(log.clone(), 64).unwrap();

        let line = vec![b'a'; 48];
        writer.write_all(&line).unwrap();
        writer.write_all(&line).unwrap(); // exceeds the cap, triggers rotation
        writer.flush().unwrap();

        let backup = log.with_extension("log.1");
        assert!(backup.exists());
        assert_eq!(std::fs::metadata(&backup).unwrap().len(), 48);
        assert_eq!(std::fs::metadata(&log).unwrap().len(), 48);

        // A second rotation replaces the old backup rather than accumulating
        writer.write_all(&line).unwrap();
        writer.flush().unwrap();
        assert!(backup.exists());
        assert_eq!(std::fs::metadata(&log).unwrap().len(), 48);
    }

    #[test]
    fn test_current_process_counts_as_running() {
        assert!(is_process_running(std::process::id()));
    }

    #[test]
    fn test_live_pid_file_blocks_second_daemon() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var(crate::config::OSMO_STATE_OVERRIDE, dir.path());

        let request = sample_request();
        std::fs::create_dir_all(daemon_dir()).unwrap();
        let pid_file = pid_file_path(&request.workflow_id, &request.task_name);

        // A PID file owned by a live process (this one) refuses a second daemon
        let metadata = RsyncDaemonMetadata {
            pid: std::process::id(),
            rsync_request: request.clone(),
            start_time: "2026-01-01T00:00:00Z".into(),
            last_synced: None,
        };
        std::fs::write(&pid_file, serde_json::to_string(&metadata).unwrap()).unwrap();
        assert!(validate_daemon_exists(&request).unwrap());
        assert!(pid_file.exists(), "refusal must leave the PID file intact");

        let listed = rsync_status(Some("wf-1"), None, None).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, RsyncDaemonStatus::Running);

        // A stale PID file (dead process) is cleaned up and no longer blocks
        let stale = RsyncDaemonMetadata {
            pid: i32::MAX as u32,
            ..metadata
        };
        std::fs::write(&pid_file, serde_json::to_string(&stale).unwrap()).unwrap();
        assert!(!validate_daemon_exists(&request).unwrap());
        assert!(!pid_file.exists());

        std::env::remove_var(crate::config::OSMO_STATE_OVERRIDE);
    }
}
