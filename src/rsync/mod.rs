//! Client-side rsync with remote workflow tasks: request parsing and destination validation,
//! the upload engine, the filesystem observer, and the background daemon supervisor.

pub mod client;
pub mod daemon;
pub mod watch;

pub use client::RsyncClient;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::client::{Method, RequestOptions, ServiceClient};
use crate::tunnel::{exponential_backoff_delay, TunnelParams};
use crate::{config, OsmoError, Result};

pub const RSYNC_FLAGS: &str = "-av";
pub const RSYNC_BUFFER_SIZE: usize = 8 * 1024;
pub const LOCAL_HOST_IP: &str = "127.0.0.1";

pub const DEFAULT_DAEMON_DEBOUNCE_DELAY: f64 = 30.0;
pub const DEFAULT_DAEMON_POLL_INTERVAL: f64 = 120.0;
pub const DEFAULT_DAEMON_RECONCILE_INTERVAL: f64 = 60.0;
pub const DEFAULT_DAEMON_MAX_LOG_SIZE: u64 = 2 * 1024 * 1024;

/// A validated destination on a remote workflow task.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RsyncRequest {
    pub workflow_id: String,
    pub task_name: String,
    pub src: PathBuf,
    pub dst_module: String,
    pub dst_path: String,
    pub original_dst_path: String,
}

/// A server-declared subtree that rsync destinations may land under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RsyncModuleInfo {
    pub name: String,
    pub path: PathBuf,
    pub writable: bool,
}

/// The workspace module that is always available on a task.
pub fn default_module() -> RsyncModuleInfo {
    RsyncModuleInfo {
        name: "osmo".to_owned(),
        path: PathBuf::from("/osmo/run/workspace"),
        writable: true,
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct AllowedPathConfig {
    pub path: String,
    pub writable: bool,
}

/// The rsync section of the server's plugin configuration.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct RsyncConfig {
    #[serde(default)]
    pub allowed_paths: HashMap<String, AllowedPathConfig>,
    #[serde(default)]
    pub client_upload_rate_limit: u64,
    #[serde(default)]
    pub daemon_debounce_delay: Option<f64>,
    #[serde(default)]
    pub daemon_poll_interval: Option<f64>,
    #[serde(default)]
    pub daemon_reconcile_interval: Option<f64>,
}

/// Fetches the rsync plugin configuration from the service. A service without the plugin
/// configured yields the defaults.
pub async fn get_rsync_config(client: &ServiceClient) -> Result<RsyncConfig> {
    let plugins = client
        .request_json(Method::GET, "api/plugins/configs", RequestOptions::default())
        .await?;
    match plugins.get("rsync") {
        Some(section) if !section.is_null() => serde_json::from_value(section.clone())
            .map_err(|e| OsmoError::server(format!("Malformed rsync config from service: {}", e))),
        _ => Ok(RsyncConfig::default()),
    }
}

/// The configured modules, always including the default workspace module.
pub fn get_allowed_paths(rsync_config: &RsyncConfig) -> Vec<RsyncModuleInfo> {
    let mut output = vec![default_module()];
    for (name, path_config) in &rsync_config.allowed_paths {
        output.push(RsyncModuleInfo {
            name: name.clone(),
            path: config::normalize(Path::new(&path_config.path)),
            writable: path_config.writable,
        });
    }
    output
}

/// Validates a source path: it must exist and resolve to a real local path.
pub fn validate_src_path(src: &str) -> Result<PathBuf> {
    if src.is_empty() {
        return Err(OsmoError::user("Invalid rsync path format: missing source"));
    }
    config::resolve_local_path(src)
}

/// Validates a destination path against the allowed modules and strips the matched module
/// prefix, returning `(module name, module-relative path)`.
///
/// The longest writable prefix wins; read-only matches fall through to shorter prefixes.
pub fn validate_dst_path(rsync_config: &RsyncConfig, dst: &str) -> Result<(String, String)> {
    if !dst.starts_with('/') {
        return Err(OsmoError::user(format!(
            "Destination path must be an absolute path on remote host: {}",
            dst
        )));
    }
    let sanitized = config::normalize(Path::new(dst));

    let mut allowed_paths = get_allowed_paths(rsync_config);
    allowed_paths.sort_by_key(|module| std::cmp::Reverse(module.path.as_os_str().len()));

    for module in &allowed_paths {
        if sanitized.starts_with(&module.path) && module.writable {
            let relative = sanitized
                .strip_prefix(&module.path)
                .expect("starts_with implies strip_prefix succeeds")
                .to_string_lossy()
                .into_owned();
            return Ok((module.name.clone(), relative));
        }
    }

    let bases = allowed_paths
        .iter()
        .map(|module| module.path.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(", ");
    Err(OsmoError::user(format!(
        "Destination path is not allowed for rsync: {}. The allowed base paths are: {}",
        dst, bases
    )))
}

/// Splits `src:dst` at the first unescaped colon. `\:` escapes a literal colon and is
/// unescaped in both halves.
pub fn split_rsync_path(rsync_path: &str) -> Result<(String, String)> {
    let bytes = rsync_path.as_bytes();
    let mut colon_index = None;
    for (i, b) in bytes.iter().enumerate() {
        if *b == b':' {
            if i > 0 && bytes[i - 1] == b'\\' {
                continue;
            }
            colon_index = Some(i);
            break;
        }
    }
    let colon_index = colon_index.ok_or_else(|| {
        OsmoError::user(
            "Invalid rsync path format: missing colon, path should be in the format of \
             <src>:<dst>",
        )
    })?;
    let unescape = |s: &str| s.replace("\\:", ":");
    Ok((
        unescape(&rsync_path[..colon_index]),
        unescape(&rsync_path[colon_index + 1..]),
    ))
}

/// Parses and validates a `src:dst` path into an [`RsyncRequest`].
pub fn parse_rsync_request(
    rsync_config: &RsyncConfig,
    workflow_id: &str,
    task_name: &str,
    rsync_path: &str,
) -> Result<RsyncRequest> {
    let (src, dst) = split_rsync_path(rsync_path)?;
    let sanitized_src = validate_src_path(&src)?;
    let (dst_module, dst_path) = validate_dst_path(rsync_config, &dst)?;
    Ok(RsyncRequest {
        workflow_id: workflow_id.to_owned(),
        task_name: task_name.to_owned(),
        src: sanitized_src,
        dst_module,
        dst_path,
        original_dst_path: dst,
    })
}

/// Fetches the lead task name of the first group of a workflow.
pub async fn get_lead_task_name(client: &ServiceClient, workflow_id: &str) -> Result<String> {
    let workflow = client
        .request_json(
            Method::GET,
            &format!("api/workflow/{}", workflow_id),
            RequestOptions::default(),
        )
        .await?;

    let groups = workflow
        .get("groups")
        .and_then(|g| g.as_array())
        .filter(|g| !g.is_empty())
        .ok_or_else(|| OsmoError::user(format!("Workflow {} has no groups", workflow_id)))?;

    let lead_group = &groups[0];
    let group_name = lead_group.get("name").and_then(|n| n.as_str()).unwrap_or("");
    let tasks = lead_group
        .get("tasks")
        .and_then(|t| t.as_array())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| OsmoError::user(format!("Lead group {} has no tasks", group_name)))?;

    for task in tasks {
        if task.get("lead").and_then(|l| l.as_bool()).unwrap_or(false) {
            if let Some(name) = task.get("name").and_then(|n| n.as_str()) {
                return Ok(name.to_owned());
            }
        }
    }
    Err(OsmoError::user(format!(
        "Cannot find lead task in group {}",
        group_name
    )))
}

/// Requests rsync port-forward parameters for a task, retrying retryable service errors with
/// backoff until `timeout` elapses.
pub async fn get_task_rsync_port_forward_params(
    client: &ServiceClient,
    workflow_id: &str,
    task_name: &str,
    timeout: Duration,
) -> Result<TunnelParams> {
    let request = async {
        let mut retry = 0;
        loop {
            match client
                .request_json(
                    Method::POST,
                    &format!("api/workflow/{}/rsync/task/{}", workflow_id, task_name),
                    RequestOptions::default(),
                )
                .await
            {
                Ok(result) => {
                    return serde_json::from_value::<TunnelParams>(result).map_err(|e| {
                        OsmoError::server(format!("Malformed rsync response from service: {}", e))
                    })
                }
                Err(err) if err.is_retryable() => {
                    retry += 1;
                    let delay = exponential_backoff_delay(retry);
                    tracing::info!(
                        "Retrying rsync task request in {} seconds...",
                        delay.as_secs()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    };
    tokio::time::timeout(timeout, request)
        .await
        .map_err(|_| OsmoError::server("Timeout waiting for rsync client parameters"))?
}

/// Fetches a workflow task, retrying retryable service errors with backoff until `timeout`
/// elapses.
pub async fn get_workflow_task(
    client: &ServiceClient,
    workflow_id: &str,
    task_name: &str,
    timeout: Duration,
) -> Result<serde_json::Value> {
    let request = async {
        let mut retry = 0;
        loop {
            match client
                .request_json(
                    Method::GET,
                    &format!("api/workflow/{}/task/{}", workflow_id, task_name),
                    RequestOptions::default(),
                )
                .await
            {
                Ok(result) => return Ok(result),
                Err(err) if err.is_retryable() => {
                    retry += 1;
                    let delay = exponential_backoff_delay(retry);
                    tracing::info!(
                        "Retrying workflow task request in {} seconds...",
                        delay.as_secs()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    };
    tokio::time::timeout(timeout, request)
        .await
        .map_err(|_| OsmoError::server("Timeout waiting for workflow task"))?
}

/// Resolves a daemon timer: the server value is a floor when configured, otherwise the user
/// value or the default applies.
fn resolve_float_param(server_value: Option<f64>, default_value: f64, user_value: Option<f64>) -> f64 {
    match server_value {
        None => user_value.unwrap_or(default_value),
        Some(server) => server.max(user_value.unwrap_or(server)),
    }
}

/// Options for [`rsync_upload`].
#[derive(Debug, Clone)]
pub struct RsyncUploadOptions {
    /// Run continuously in a background daemon rather than a single foreground upload.
    pub daemon: bool,
    pub timeout: Duration,
    pub upload_rate_limit: Option<u64>,
    pub debounce_delay: Option<f64>,
    pub poll_interval: Option<f64>,
    pub reconcile_interval: Option<f64>,
    pub max_log_size: u64,
    pub verbose: bool,
    pub quiet: bool,
}

impl Default for RsyncUploadOptions {
    fn default() -> Self {
        RsyncUploadOptions {
            daemon: false,
            timeout: Duration::from_secs(10),
            upload_rate_limit: None,
            debounce_delay: None,
            poll_interval: None,
            reconcile_interval: None,
            max_log_size: DEFAULT_DAEMON_MAX_LOG_SIZE,
            verbose: false,
            quiet: false,
        }
    }
}

/// Rsync uploads to a remote workflow task, either once in the foreground or continuously
/// through a detached daemon. When no task name is given, the lead task of the first group is
/// used.
pub async fn rsync_upload(
    client: &ServiceClient,
    workflow_id: &str,
    task_name: Option<&str>,
    path: &str,
    opts: &RsyncUploadOptions,
) -> Result<()> {
    let rsync_config = get_rsync_config(client).await?;
    let task_name = match task_name {
        Some(task) => task.to_owned(),
        None => get_lead_task_name(client, workflow_id).await?,
    };
    let rsync_request = parse_rsync_request(&rsync_config, workflow_id, &task_name, path)?;

    // The server cap is authoritative when configured; the effective limit is the lower of
    // the two. A zero server value means no cap.
    let mut rate_limit = opts.upload_rate_limit;
    if rsync_config.client_upload_rate_limit > 0 {
        let cap = rsync_config.client_upload_rate_limit;
        rate_limit = Some(rate_limit.unwrap_or(cap).min(cap));
    }

    if !opts.daemon {
        return client::rsync_upload_task(client, rsync_request, opts.timeout, rate_limit).await;
    }

    let debounce_delay = resolve_float_param(
        rsync_config.daemon_debounce_delay,
        DEFAULT_DAEMON_DEBOUNCE_DELAY,
        opts.debounce_delay,
    );
    let poll_interval = resolve_float_param(
        rsync_config.daemon_poll_interval,
        DEFAULT_DAEMON_POLL_INTERVAL,
        opts.poll_interval,
    );
    let reconcile_interval = resolve_float_param(
        rsync_config.daemon_reconcile_interval,
        DEFAULT_DAEMON_RECONCILE_INTERVAL,
        opts.reconcile_interval,
    );

    daemon::spawn_daemon(&daemon::DaemonParams {
        rsync_request,
        poll_interval,
        debounce_delay,
        reconcile_interval,
        timeout_secs: opts.timeout.as_secs(),
        rate_limit,
        max_log_size: opts.max_log_size,
        verbose: opts.verbose,
    }, opts.quiet)
}

#[cfg(test)]
mod test {
    use super::*;

    fn config_with_data_module() -> RsyncConfig {
        let mut allowed = HashMap::new();
        allowed.insert(
            "data".to_owned(),
            AllowedPathConfig {
                path: "/osmo/data".to_owned(),
                writable: false,
            },
        );
        RsyncConfig {
            allowed_paths: allowed,
            ..Default::default()
        }
    }

    #[test]
    fn test_dst_matching_picks_writable_module_and_strips_prefix() {
        let config = config_with_data_module();
        let (module, dst_path) =
            validate_dst_path(&config, "/osmo/run/workspace/sub/file").unwrap();
        assert_eq!(module, "osmo");
        assert_eq!(dst_path, "sub/file");
    }

    #[test]
    fn test_dst_matching_rejects_read_only_and_unmatched() {
        let config = config_with_data_module();
        let err = validate_dst_path(&config, "/osmo/data/x").unwrap_err();
        assert!(err.to_string().contains("allowed base paths"));
        assert!(validate_dst_path(&config, "/elsewhere").is_err());
    }

    #[test]
    fn test_dst_must_be_absolute() {
        let config = RsyncConfig::default();
        assert!(validate_dst_path(&config, "relative/path").is_err());
    }

    #[test]
    fn test_dst_prefix_match_is_component_wise() {
        // /osmo/run/workspacex shares a string prefix but not a path prefix
        let config = RsyncConfig::default();
        assert!(validate_dst_path(&config, "/osmo/run/workspacex/file").is_err());
    }

    #[test]
    fn test_split_on_first_unescaped_colon() {
        assert_eq!(
            split_rsync_path("a\\:b:/x").unwrap(),
            ("a:b".to_owned(), "/x".to_owned())
        );
        assert_eq!(
            split_rsync_path("/tmp/data:/osmo/run/workspace/sub").unwrap(),
            ("/tmp/data".to_owned(), "/osmo/run/workspace/sub".to_owned())
        );
        assert!(split_rsync_path("no-colon-here").is_err());
    }

    #[test]
    fn test_resolve_float_param_server_floor() {
        // Server value unset: user wins, default fills in
        assert_eq!(resolve_float_param(None, 30.0, None), 30.0);
        assert_eq!(resolve_float_param(None, 30.0, Some(5.0)), 5.0);
        // Server value set: acts as a floor and is authoritative without a user value
        assert_eq!(resolve_float_param(Some(60.0), 30.0, None), 60.0);
        assert_eq!(resolve_float_param(Some(60.0), 30.0, Some(10.0)), 60.0);
        assert_eq!(resolve_float_param(Some(60.0), 30.0, Some(90.0)), 90.0);
    }

    #[test]
    fn test_allowed_paths_include_default_module() {
        let paths = get_allowed_paths(&RsyncConfig::default());
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].name, "osmo");
        assert_eq!(paths[0].path, PathBuf::from("/osmo/run/workspace"));
        assert!(paths[0].writable);
    }
}
