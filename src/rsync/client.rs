//! The rsync upload engine: a loopback TCP tunnel to the remote task's rsync daemon, a
//! subprocess `rsync` client pointed at it, and a reconciliation loop that guarantees every
//! requested upload is eventually fulfilled.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::client::ServiceClient;
use crate::limit::TokenBucket;
use crate::rsync::{
    get_task_rsync_port_forward_params, RsyncRequest, LOCAL_HOST_IP, RSYNC_BUFFER_SIZE,
    RSYNC_FLAGS,
};
use crate::tunnel::{self, TcpTunnelOptions};
use crate::{OsmoError, Result};

/// Callback invoked after every successful upload.
pub type UploadCallback = Arc<dyn Fn() + Send + Sync>;

/// Synchronizes concurrent upload requests.
///
/// Requests arriving while an upload is in flight only bump the pending counter; the
/// reconciliation loop retries until the completed counter catches up, so no request is lost.
#[derive(Default)]
pub struct RsyncUploadCounter {
    counters: std::sync::Mutex<(u64, u64)>,
}

impl RsyncUploadCounter {
    pub fn increment_pending(&self) {
        self.counters.lock().expect("counter lock poisoned").0 += 1;
    }

    pub fn pending(&self) -> u64 {
        self.counters.lock().expect("counter lock poisoned").0
    }

    /// Advances the completed counter to `count`, never backwards.
    pub fn set_complete(&self, count: u64) {
        let mut counters = self.counters.lock().expect("counter lock poisoned");
        counters.1 = counters.1.max(count);
    }

    /// Whether any requested upload has not yet been covered by a completed run.
    pub fn needs_upload(&self) -> bool {
        let counters = self.counters.lock().expect("counter lock poisoned");
        counters.1 < counters.0
    }
}

struct Inner {
    service_client: ServiceClient,
    request: RsyncRequest,
    timeout: Duration,
    stop: CancellationToken,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
    local_port: std::sync::Mutex<Option<u16>>,
    upload_lock: Mutex<()>,
    counter: RsyncUploadCounter,
    rate_limiter: Option<Arc<TokenBucket>>,
    reconcile_interval: Duration,
    upload_callback: Option<UploadCallback>,
    tasks: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

/// A client wrapper for rsync with a remote workflow task. Clones share one engine.
#[derive(Clone)]
pub struct RsyncClient {
    inner: Arc<Inner>,
}

/// Construction options for [`RsyncClient`].
pub struct RsyncClientOptions {
    pub timeout: Duration,
    pub upload_rate_limit: Option<u64>,
    pub reconcile_interval: Duration,
    pub upload_callback: Option<UploadCallback>,
    /// Stop signal shared with the owner; a fresh token is created when absent.
    pub stop: Option<CancellationToken>,
}

impl Default for RsyncClientOptions {
    fn default() -> Self {
        RsyncClientOptions {
            timeout: Duration::from_secs(30),
            upload_rate_limit: None,
            reconcile_interval: Duration::from_secs(60),
            upload_callback: None,
            stop: None,
        }
    }
}

impl RsyncClient {
    pub fn new(
        service_client: ServiceClient,
        request: RsyncRequest,
        options: RsyncClientOptions,
    ) -> Self {
        let (ready_tx, ready_rx) = watch::channel(false);
        RsyncClient {
            inner: Arc::new(Inner {
                service_client,
                request,
                timeout: options.timeout,
                stop: options.stop.unwrap_or_default(),
                ready_tx,
                ready_rx,
                local_port: std::sync::Mutex::new(None),
                upload_lock: Mutex::new(()),
                counter: RsyncUploadCounter::default(),
                rate_limiter: options
                    .upload_rate_limit
                    .map(|limit| Arc::new(TokenBucket::new(limit, limit))),
                reconcile_interval: options.reconcile_interval,
                upload_callback: options.upload_callback,
                tasks: std::sync::Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn src(&self) -> &std::path::Path {
        &self.inner.request.src
    }

    pub fn stopped(&self) -> bool {
        self.inner.stop.is_cancelled()
    }

    /// Starts the port-forward and reconciliation loops, waits for the TCP tunnel to come up,
    /// and validates that the requested module is eligible on the remote task.
    pub async fn start(&self) -> Result<()> {
        tracing::info!("Starting rsync client...");

        let port_forward = {
            let this = self.clone();
            tokio::spawn(async move { this.port_forward_loop().await })
        };
        let reconciler = {
            let this = self.clone();
            tokio::spawn(async move { this.reconcile_loop().await })
        };
        self.inner
            .tasks
            .lock()
            .expect("task list lock poisoned")
            .extend([port_forward, reconciler]);

        let mut ready = self.inner.ready_rx.clone();
        let became_ready = tokio::select! {
            result = tokio::time::timeout(self.inner.timeout, ready.wait_for(|up| *up)) => {
                result.is_ok()
            }
            _ = self.inner.stop.cancelled() => false,
        };
        if !became_ready {
            self.stop().await;
            return Err(OsmoError::Other(format!(
                "Timed out waiting for TCP port forwarding to be ready, is Rsync running on \
                 the remote task? (workflow {})",
                self.inner.request.workflow_id
            )));
        }

        // Validate that the requested module is eligible for rsync
        let modules = self.list_modules().await?;
        if modules.is_empty() {
            return Err(OsmoError::Other(format!(
                "No rsync modules found on the remote task, is Rsync running on the remote \
                 task? (workflow {})",
                self.inner.request.workflow_id
            )));
        }
        if !modules.contains(&self.inner.request.dst_module) {
            return Err(OsmoError::user(format!(
                "Rsync module {} is not eligible for rsync",
                self.inner.request.dst_module
            )));
        }
        Ok(())
    }

    /// Stops the engine: cancels the background loops and marks the tunnel down. Idempotent.
    pub async fn stop(&self) {
        tracing::info!("Stopping rsync client...");
        self.inner.stop.cancel();
        let _ = self.inner.ready_tx.send(false);
        *self.inner.local_port.lock().expect("port lock poisoned") = None;
        for task in self
            .inner
            .tasks
            .lock()
            .expect("task list lock poisoned")
            .drain(..)
        {
            task.abort();
        }
    }

    /// Uploads the local path to the remote workflow task.
    ///
    /// Calls arriving while an upload is running only register the demand and return; the
    /// reconciler coalesces the deferred work into a later run.
    pub async fn upload(&self) -> Result<()> {
        tracing::info!("Uploading {}", self.inner.request.src.display());

        self.inner.counter.increment_pending();

        if self.stopped() {
            return Err(OsmoError::Other("Rsync client is not running".to_owned()));
        }

        let Ok(_guard) = self.inner.upload_lock.try_lock() else {
            tracing::info!("Upload already in progress, queueing...");
            return Ok(());
        };

        let mut ready = self.inner.ready_rx.clone();
        tokio::time::timeout(self.inner.timeout, ready.wait_for(|up| *up))
            .await
            .map_err(|_| {
                OsmoError::Other(format!(
                    "Timeout waiting for TCP port forwarding to be ready (workflow {})",
                    self.inner.request.workflow_id
                ))
            })?
            .map_err(|_| OsmoError::Other("Rsync client is not running".to_owned()))?;

        let local_port = self
            .local_port()
            .ok_or_else(|| OsmoError::Other("Rsync client is not running".to_owned()))?;
        let resolved_dst = format!(
            "rsync://{}:{}/{}/{}",
            LOCAL_HOST_IP, local_port, self.inner.request.dst_module, self.inner.request.dst_path
        );

        tracing::debug!(
            "Uploading from {} to {}, with flags {}",
            self.inner.request.src.display(),
            resolved_dst,
            RSYNC_FLAGS
        );

        // Snapshot the demand this run will satisfy before the subprocess starts
        let cur_pending = self.inner.counter.pending();

        let output = tokio::process::Command::new(rsync_bin())
            .arg(RSYNC_FLAGS)
            .arg(&self.inner.request.src)
            .arg(&resolved_dst)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            return Err(OsmoError::server(format!(
                "Rsync failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        tracing::info!(
            "Rsync upload completed successfully for {}/{}",
            self.inner.request.workflow_id,
            self.inner.request.task_name
        );
        self.inner.counter.set_complete(cur_pending);

        if let Some(callback) = &self.inner.upload_callback {
            callback();
        }
        Ok(())
    }

    /// Lists the rsync modules exported by the remote task.
    pub async fn list_modules(&self) -> Result<Vec<String>> {
        let local_port = self
            .local_port()
            .ok_or_else(|| OsmoError::Other("Rsync client is not running".to_owned()))?;
        let remote_host = format!("rsync://{}:{}", LOCAL_HOST_IP, local_port);
        tracing::debug!("Listing modules from {}", remote_host);

        let output = tokio::process::Command::new(rsync_bin())
            .arg(&remote_host)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;
        if !output.status.success() {
            return Err(OsmoError::server(format!(
                "Rsync failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .map(|module| module.to_owned())
            .collect())
    }

    fn local_port(&self) -> Option<u16> {
        *self.inner.local_port.lock().expect("port lock poisoned")
    }

    /// Holds the TCP tunnel open for the engine's lifetime, re-requesting connection
    /// parameters and backing off after every disconnect. Fatal service errors stop the
    /// engine.
    async fn port_forward_loop(&self) {
        let mut retry: u32 = 0;
        while !self.stopped() {
            if retry > 0 {
                tracing::info!("Starting rsync port forwarding... (retry {})", retry);
            } else {
                tracing::info!("Starting rsync port forwarding...");
            }

            let attempt = self.port_forward_once().await;

            let _ = self.inner.ready_tx.send(false);
            *self.inner.local_port.lock().expect("port lock poisoned") = None;

            if self.stopped() {
                break;
            }
            match attempt {
                Err(err) if !err.is_retryable() && err.status_code().is_some() => {
                    tracing::error!(error = %err, "Port forward failed with fatal error");
                    self.stop().await;
                    break;
                }
                Err(err) => {
                    tracing::error!(error = %err, "Rsync port-forward connection failed, retrying...");
                }
                Ok(()) => {}
            }
            retry += 1;
            let delay = tunnel::exponential_backoff_delay(retry);
            tracing::info!("Reconnect to rsync port in {} seconds...", delay.as_secs());
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.inner.stop.cancelled() => break,
            }
        }
    }

    async fn port_forward_once(&self) -> Result<()> {
        let params = get_task_rsync_port_forward_params(
            &self.inner.service_client,
            &self.inner.request.workflow_id,
            &self.inner.request.task_name,
            self.inner.timeout,
        )
        .await?;

        let listener = TcpListener::bind((LOCAL_HOST_IP, 0)).await?;
        let local_addr = listener.local_addr()?;
        *self.inner.local_port.lock().expect("port lock poisoned") = Some(local_addr.port());

        let message = format!(
            "Starting rsync port forwarding from {}/{} to {}:{}.",
            self.inner.request.workflow_id,
            self.inner.request.task_name,
            local_addr.ip(),
            local_addr.port()
        );

        tunnel::run_tcp(
            &self.inner.service_client,
            listener,
            &message,
            &format!("api/router/rsync/{}/client", self.inner.request.workflow_id),
            self.inner.timeout,
            &params,
            TcpTunnelOptions {
                query: vec![(
                    "timeout".to_owned(),
                    self.inner.timeout.as_secs().to_string(),
                )],
                ready: Some(self.inner.ready_tx.clone()),
                close: self.inner.stop.child_token(),
                buffer_size: RSYNC_BUFFER_SIZE,
                rate_limiter: self.inner.rate_limiter.clone(),
            },
        )
        .await
    }

    /// Continuously monitors the upload counters and performs uploads when demand was
    /// deferred by an in-flight run or a dead tunnel.
    async fn reconcile_loop(&self) {
        while !self.stopped() {
            let mut ready = self.inner.ready_rx.clone();
            tokio::select! {
                _ = ready.wait_for(|up| *up) => {}
                _ = self.inner.stop.cancelled() => break,
            }

            if self.inner.upload_lock.try_lock().is_ok() && self.inner.counter.needs_upload() {
                tracing::info!(
                    "Reconciling upload for {}",
                    self.inner.request.src.display()
                );
                if let Err(err) = self.upload().await {
                    tracing::error!(error = %err, "Error reconciling upload");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.inner.reconcile_interval) => {}
                _ = self.inner.stop.cancelled() => break,
            }
        }
    }
}

/// The rsync binary to run, overridable for bundled installs.
fn rsync_bin() -> String {
    std::env::var("OSMO_RSYNC_BIN").unwrap_or_else(|_| "rsync".to_owned())
}

/// Convenience wrapper for a single foreground upload to a remote workflow task.
pub async fn rsync_upload_task(
    service_client: &ServiceClient,
    rsync_request: RsyncRequest,
    timeout: Duration,
    rate_limit: Option<u64>,
) -> Result<()> {
    let client = RsyncClient::new(
        service_client.clone(),
        rsync_request,
        RsyncClientOptions {
            timeout,
            upload_rate_limit: rate_limit,
            ..Default::default()
        },
    );
    let result = async {
        client.start().await?;
        client.upload().await
    }
    .await;
    if !client.stopped() {
        client.stop().await;
    }
    result
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_upload_counter_tracks_deferred_demand() {
        let counter = RsyncUploadCounter::default();
        assert!(!counter.needs_upload());

        for _ in 0..5 {
            counter.increment_pending();
        }
        assert!(counter.needs_upload());

        // A run that started after 3 requests only covers those 3
        counter.set_complete(3);
        assert!(counter.needs_upload());

        counter.set_complete(5);
        assert!(!counter.needs_upload());
    }

    #[test]
    fn test_upload_counter_never_regresses() {
        let counter = RsyncUploadCounter::default();
        counter.increment_pending();
        counter.set_complete(1);
        counter.set_complete(0);
        assert!(!counter.needs_upload());
    }
}
