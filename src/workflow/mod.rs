//! The workflow submission pipeline: template expansion through a server dry-run, inlining of
//! local files referenced by the spec, discovery and upload of local-path datasets, and the
//! final submission. Restart and validation-only modes share the same scaffolding.

pub mod ports;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::Serialize;
use serde_yaml::Value;

use crate::client::{Method, RequestOptions, ResponseMode, ServiceClient};
use crate::{config, datasets, rsync, OsmoError, Result};

/// Scheduling priority for a workflow. The scheduler drains HIGH before NORMAL before LOW;
/// LOW workflows may be preempted to make room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowPriority {
    High,
    Normal,
    Low,
}

impl WorkflowPriority {
    pub fn preemptible(&self) -> bool {
        matches!(self, WorkflowPriority::Low)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowPriority::High => "HIGH",
            WorkflowPriority::Normal => "NORMAL",
            WorkflowPriority::Low => "LOW",
        }
    }
}

impl std::str::FromStr for WorkflowPriority {
    type Err = OsmoError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "HIGH" => Ok(WorkflowPriority::High),
            "NORMAL" => Ok(WorkflowPriority::Normal),
            "LOW" => Ok(WorkflowPriority::Low),
            other => Err(OsmoError::user(format!(
                "Invalid priority {}, expected HIGH, NORMAL, or LOW",
                other
            ))),
        }
    }
}

impl std::fmt::Display for WorkflowPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output rendering requested with `--format-type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Parsed template data from a workflow file, shaped for the submission payload.
#[derive(Serialize, Debug, Clone)]
pub struct TemplateData {
    pub file: String,
    pub set_variables: Vec<String>,
    pub set_string_variables: Vec<String>,
    pub uploaded_templated_spec: Option<String>,
    #[serde(skip)]
    pub is_templated: bool,
}

/// Classifies workflow text and wraps it with the `--set`/`--set-string` assignments. A file
/// is templated if it contains template markers or a `default-values` block.
pub fn parse_file_for_template(
    contents: &str,
    set_variables: Vec<String>,
    set_string_variables: Vec<String>,
) -> TemplateData {
    let is_templated = contents.contains("{%")
        || contents.contains("{{")
        || contents.contains("{#")
        || contents.contains("default-values");
    TemplateData {
        file: contents.to_owned(),
        set_variables,
        set_string_variables,
        uploaded_templated_spec: None,
        is_templated,
    }
}

/// Whether a string is plausibly a workflow id rather than a file path.
pub fn is_workflow_id(potential_id: &str) -> bool {
    let wfid = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]*$").expect("static regex compiles");
    wfid.is_match(potential_id)
}

/// Fetches the default pool assigned in the user's profile.
pub async fn fetch_default_pool(client: &ServiceClient) -> Result<String> {
    let settings = client
        .request_json(Method::GET, "api/profile/settings", RequestOptions::default())
        .await?;
    settings
        .get("default_pool")
        .and_then(|p| p.as_str())
        .filter(|p| !p.is_empty())
        .map(|p| p.to_owned())
        .ok_or_else(|| {
            OsmoError::user("No pool specified and no default pool is set in the profile")
        })
}

fn tasks_of(workflow: &Value) -> Vec<&Value> {
    let mut tasks = Vec::new();
    let Some(spec) = workflow.get("workflow") else {
        return tasks;
    };
    // v1 spec keeps tasks at the top level, v2 nests them in groups
    if let Some(seq) = spec.get("tasks").and_then(Value::as_sequence) {
        tasks.extend(seq.iter());
    }
    if let Some(groups) = spec.get("groups").and_then(Value::as_sequence) {
        for group in groups {
            if let Some(seq) = group.get("tasks").and_then(Value::as_sequence) {
                tasks.extend(seq.iter());
            }
        }
    }
    tasks
}

fn for_each_task_mut(
    workflow: &mut Value,
    f: &mut dyn FnMut(&mut Value) -> Result<()>,
) -> Result<()> {
    let Some(spec) = workflow.get_mut("workflow") else {
        return Ok(());
    };
    if let Some(seq) = spec.get_mut("tasks").and_then(Value::as_sequence_mut) {
        for task in seq {
            f(task)?;
        }
    }
    if let Some(groups) = spec.get_mut("groups").and_then(Value::as_sequence_mut) {
        for group in groups {
            if let Some(seq) = group.get_mut("tasks").and_then(Value::as_sequence_mut) {
                for task in seq {
                    f(task)?;
                }
            }
        }
    }
    Ok(())
}

/// Inlines every `files[]` entry carrying a `localpath` into a `contents` field, resolving
/// relative paths against the base directory. An entry with both fields is rejected.
pub fn load_local_files(base_dir: &Path, workflow: &mut Value) -> Result<()> {
    for_each_task_mut(workflow, &mut |task| {
        let Some(files) = task.get_mut("files").and_then(Value::as_sequence_mut) else {
            return Ok(());
        };
        for file_entry in files {
            let Some(mapping) = file_entry.as_mapping_mut() else {
                continue;
            };
            let localpath_key = Value::from("localpath");
            let has_localpath = mapping.contains_key(&localpath_key);
            if has_localpath && mapping.contains_key(Value::from("contents")) {
                return Err(OsmoError::Submission {
                    message: "Files tag does not support contents and localpath together"
                        .to_owned(),
                    workflow_id: None,
                    status_code: None,
                });
            }
            if !has_localpath {
                continue;
            }
            let localpath = mapping
                .get(&localpath_key)
                .and_then(Value::as_str)
                .ok_or_else(|| OsmoError::user("localpath must be a string"))?;
            let resolved = config::absolute_path(localpath, base_dir);
            if !resolved.exists() {
                return Err(OsmoError::Submission {
                    message: format!("The file/path {} does not exist!", resolved.display()),
                    workflow_id: None,
                    status_code: None,
                });
            }
            let contents = std::fs::read_to_string(&resolved)?;
            mapping.insert(Value::from("contents"), Value::from(contents));
            mapping.remove(&localpath_key);
        }
        Ok(())
    })
}

/// A `(dataset name, resolved local path)` pair referenced by at least one task input.
pub type LocalpathDatasetInput = (String, PathBuf);

/// Collects every dataset input with a `localpath` field across all tasks, deduplicated in
/// discovery order. Dataset names containing `:` (a tag or version id) are rejected.
pub fn collect_localpath_dataset_inputs(
    base_dir: &Path,
    workflow: &Value,
) -> Result<Vec<LocalpathDatasetInput>> {
    let mut seen = Vec::new();
    for task in tasks_of(workflow) {
        let Some(inputs) = task.get("inputs").and_then(Value::as_sequence) else {
            continue;
        };
        for input in inputs {
            let Some(dataset) = input.get("dataset") else {
                continue;
            };
            let Some(localpath) = dataset.get("localpath").and_then(Value::as_str) else {
                continue;
            };
            let name = dataset
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| OsmoError::user("Dataset input is missing a name"))?;
            if name.contains(':') {
                return Err(OsmoError::Submission {
                    message: "Localpath Dataset name cannot contain tag or version id!"
                        .to_owned(),
                    workflow_id: None,
                    status_code: None,
                });
            }
            let resolved = config::absolute_path(localpath, base_dir);
            if !resolved.exists() {
                return Err(OsmoError::Submission {
                    message: format!("The localpath {} does not exist!", resolved.display()),
                    workflow_id: None,
                    status_code: None,
                });
            }
            let entry = (name.to_owned(), resolved);
            if !seen.contains(&entry) {
                seen.push(entry);
            }
        }
    }
    Ok(seen)
}

/// Rewrites every local-path dataset input to reference its uploaded version
/// (`name:<version_id>`) and removes the `localpath` field.
pub fn backfill_dataset_versions(
    base_dir: &Path,
    workflow: &mut Value,
    versions: &HashMap<LocalpathDatasetInput, String>,
) -> Result<()> {
    for_each_task_mut(workflow, &mut |task| {
        let Some(inputs) = task.get_mut("inputs").and_then(Value::as_sequence_mut) else {
            return Ok(());
        };
        for input in inputs {
            let Some(dataset) = input.get_mut("dataset").and_then(Value::as_mapping_mut) else {
                continue;
            };
            let localpath_key = Value::from("localpath");
            let Some(localpath) = dataset.get(&localpath_key).and_then(Value::as_str) else {
                continue;
            };
            let resolved = config::absolute_path(localpath, base_dir);
            let name = dataset
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .split(':')
                .next()
                .unwrap_or_default()
                .to_owned();
            let Some(version) = versions.get(&(name.clone(), resolved)) else {
                continue;
            };
            dataset.insert(
                Value::from("name"),
                Value::from(format!("{}:{}", name, version)),
            );
            dataset.remove(&localpath_key);
        }
        Ok(())
    })
}

/// Options shared by `workflow submit` and `app submit`.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub pool: Option<String>,
    pub set: Vec<String>,
    pub set_string: Vec<String>,
    pub set_env: Vec<String>,
    pub priority: Option<WorkflowPriority>,
    pub dry_run: bool,
    pub local_path: Option<PathBuf>,
    pub rsync: Option<String>,
    pub format: OutputFormat,
}

/// Prints workflow submission results in the requested format, with the preemption warning
/// for preemptible priorities.
pub fn print_submission_results(
    result: &serde_json::Value,
    format: OutputFormat,
    priority: Option<WorkflowPriority>,
    parent_workflow_id: Option<&str>,
) -> Result<()> {
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }
    let message = match parent_workflow_id {
        Some(parent) => format!("Workflow {} restarted.", parent),
        None => "Workflow submit successful.".to_owned(),
    };
    let name = result.get("name").and_then(|v| v.as_str()).unwrap_or("-");
    let overview = result
        .get("overview")
        .and_then(|v| v.as_str())
        .unwrap_or("-");
    println!(
        "{}\nWorkflow ID        - {}\nWorkflow Overview  - {}",
        message, name, overview
    );
    if let Some(dashboard) = result.get("dashboard_url").and_then(|v| v.as_str()) {
        println!("Workflow Dashboard - {}", dashboard);
    }
    let priority = priority.unwrap_or(WorkflowPriority::Normal);
    if priority.preemptible() {
        println!(
            "\nWARNING: {} priority can be preempted during the run.",
            priority
        );
    }
    Ok(())
}

fn wrap_submission_error(err: OsmoError) -> OsmoError {
    match &err {
        OsmoError::Credential { workflow_id, .. } | OsmoError::Submission { workflow_id, .. } => {
            let workflow_string = workflow_id
                .as_deref()
                .map(|id| format!("{} ", id))
                .unwrap_or_default();
            OsmoError::Submission {
                message: format!("Workflow {}submit failed:\n{}", workflow_string, err),
                workflow_id: workflow_id.clone(),
                status_code: err.status_code(),
            }
        }
        _ => err,
    }
}

/// Submits a workflow file or, when the argument is not a file, restarts submission of a
/// previously-uploaded spec by workflow id.
pub async fn submit(
    client: &ServiceClient,
    workflow_file: &str,
    opts: &SubmitOptions,
) -> Result<()> {
    tracing::debug!("Submit workflow");
    let pool = match &opts.pool {
        Some(pool) => pool.clone(),
        None => fetch_default_pool(client).await?,
    };

    let mut params: Vec<(String, String)> = Vec::new();
    if let Some(priority) = opts.priority {
        params.push(("priority".to_owned(), priority.to_string()));
    }

    let workflow_path = std::path::absolute(workflow_file)?;
    let contents = match std::fs::read_to_string(&workflow_path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            // If the argument is not a workflow id either, surface the missing file
            if !is_workflow_id(workflow_file) {
                return Err(OsmoError::Submission {
                    message: format!("Workflow file {} does not exist", workflow_file),
                    workflow_id: None,
                    status_code: None,
                });
            }
            if opts.dry_run {
                eprintln!(
                    "Please remove the --dry-run flag when submitting a workflow using a \
                     workflow ID."
                );
                return Ok(());
            }
            if !opts.set.is_empty() {
                eprintln!(
                    "Please remove the --set flag when submitting a workflow using a \
                     workflow ID."
                );
                return Ok(());
            }

            // Interpret the argument as a workflow id and submit it as a reference
            params.push(("workflow_id".to_owned(), workflow_file.to_owned()));
            let result = client
                .request_json(
                    Method::POST,
                    &format!("api/pool/{}/workflow", pool),
                    RequestOptions::with_params(params),
                )
                .await
                .map_err(wrap_submission_error)?;
            print_submission_results(&result, opts.format, opts.priority, None)?;
            start_rsync_daemon(client, &result, opts).await?;
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let template_data =
        parse_file_for_template(&contents, opts.set.clone(), opts.set_string.clone());
    submit_helper(client, &pool, template_data, &workflow_path, params, opts).await
}

async fn submit_helper(
    client: &ServiceClient,
    pool: &str,
    mut template_data: TemplateData,
    workflow_path: &Path,
    mut params: Vec<(String, String)>,
    opts: &SubmitOptions,
) -> Result<()> {
    let endpoint = format!("api/pool/{}/workflow", pool);
    let mut expanded_spec: Option<String> = None;

    // Do a dry run if explicitly requested or if we need to expand templates
    if template_data.is_templated || opts.dry_run {
        params.push(("dry_run".to_owned(), "true".to_owned()));
        let result = client
            .request_json(
                Method::POST,
                &endpoint,
                RequestOptions {
                    params: params.clone(),
                    payload: Some(serde_json::to_value(&template_data)?),
                    ..Default::default()
                },
            )
            .await?;
        let spec = result
            .get("spec")
            .and_then(|s| s.as_str())
            .unwrap_or_default()
            .to_owned();
        if opts.dry_run {
            println!("{}", spec);
            return Ok(());
        }
        expanded_spec = Some(spec);
        // Not a dry run, so reset the flag for the actual submission
        params.retain(|(key, _)| key != "dry_run");
    }

    for env_var in &opts.set_env {
        params.push(("env_vars".to_owned(), env_var.clone()));
    }

    let mut workflow_doc: Value = match expanded_spec {
        Some(spec) => {
            // Keep the original templated text alongside the expanded submission
            template_data.uploaded_templated_spec = Some(template_data.file.clone());
            serde_yaml::from_str(&spec)?
        }
        None => serde_yaml::from_str(&template_data.file)?,
    };

    let local_base = opts.local_path.clone().unwrap_or_else(|| {
        workflow_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .to_owned()
    });

    load_local_files(&local_base, &mut workflow_doc)?;

    let localpath_inputs = collect_localpath_dataset_inputs(&local_base, &workflow_doc)?;
    if !localpath_inputs.is_empty() {
        // Uploading localpath datasets is expensive, so validate the workflow first
        params.push(("validation_only".to_owned(), "true".to_owned()));
        client
            .request_json(
                Method::POST,
                &endpoint,
                RequestOptions {
                    params: params.clone(),
                    payload: Some(serde_json::to_value(&template_data)?),
                    ..Default::default()
                },
            )
            .await?;
        params.retain(|(key, _)| key != "validation_only");

        let workflow_name = workflow_doc
            .get("workflow")
            .and_then(|w| w.get("name"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();

        let mut versions = HashMap::new();
        for (dataset_name, localpath) in &localpath_inputs {
            let version_id = datasets::upload_localpath_dataset(
                client,
                dataset_name,
                localpath,
                &workflow_name,
            )
            .await?;
            versions.insert((dataset_name.clone(), localpath.clone()), version_id);
        }
        backfill_dataset_versions(&local_base, &mut workflow_doc, &versions)?;
    }

    template_data.file = serde_yaml::to_string(&workflow_doc)?;

    let result = client
        .request_json(
            Method::POST,
            &endpoint,
            RequestOptions {
                params,
                payload: Some(serde_json::to_value(&template_data)?),
                ..Default::default()
            },
        )
        .await
        .map_err(wrap_submission_error)?;

    print_submission_results(&result, opts.format, opts.priority, None)?;
    start_rsync_daemon(client, &result, opts).await?;
    Ok(())
}

async fn start_rsync_daemon(
    client: &ServiceClient,
    result: &serde_json::Value,
    opts: &SubmitOptions,
) -> Result<()> {
    let Some(rsync_path) = &opts.rsync else {
        return Ok(());
    };
    let workflow_id = result
        .get("name")
        .and_then(|n| n.as_str())
        .ok_or_else(|| OsmoError::server("Submission result did not contain a workflow id"))?;
    rsync::rsync_upload(
        client,
        workflow_id,
        None,
        rsync_path,
        &rsync::RsyncUploadOptions {
            daemon: true,
            quiet: opts.format == OutputFormat::Json,
            ..Default::default()
        },
    )
    .await
}

/// Restarts a workflow. Pool selection order: the explicit `--pool`, then the workflow's
/// recorded pool, then the profile default.
pub async fn restart(
    client: &ServiceClient,
    workflow_id: &str,
    pool: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    tracing::debug!("Restart workflow");
    let mut pool_name = pool;
    if pool_name.is_none() {
        let workflow_result = client
            .request_json(
                Method::GET,
                &format!("api/workflow/{}", workflow_id),
                RequestOptions::default(),
            )
            .await?;
        pool_name = workflow_result
            .get("pool")
            .and_then(|p| p.as_str())
            .filter(|p| !p.is_empty())
            .map(|p| p.to_owned());
    }
    let pool_name = match pool_name {
        Some(pool) => pool,
        None => fetch_default_pool(client).await?,
    };

    let result = client
        .request_json(
            Method::POST,
            &format!("api/pool/{}/workflow/{}/restart", pool_name, workflow_id),
            RequestOptions::default(),
        )
        .await
        .map_err(wrap_submission_error)?;
    print_submission_results(&result, format, None, Some(workflow_id))
}

/// Validates a workflow file server-side without submitting it; the service's validation log
/// is printed verbatim.
pub async fn validate(
    client: &ServiceClient,
    workflow_file: &Path,
    pool: Option<String>,
    set: Vec<String>,
    set_string: Vec<String>,
) -> Result<()> {
    tracing::debug!("Validate workflow");
    let pool = match pool {
        Some(pool) => pool,
        None => fetch_default_pool(client).await?,
    };
    let endpoint = format!("api/pool/{}/workflow", pool);

    let contents = std::fs::read_to_string(workflow_file).map_err(|e| OsmoError::Submission {
        message: format!("{}: {}", workflow_file.display(), e),
        workflow_id: None,
        status_code: None,
    })?;
    let mut template_data = parse_file_for_template(&contents, set, set_string);

    let mut workflow_doc: Value = if template_data.is_templated {
        let result = client
            .request_json(
                Method::POST,
                &endpoint,
                RequestOptions {
                    params: vec![
                        ("validation_only".to_owned(), "true".to_owned()),
                        ("dry_run".to_owned(), "true".to_owned()),
                    ],
                    payload: Some(serde_json::to_value(&template_data)?),
                    ..Default::default()
                },
            )
            .await?;
        let spec = result
            .get("spec")
            .and_then(|s| s.as_str())
            .unwrap_or_default();
        serde_yaml::from_str(spec)?
    } else {
        serde_yaml::from_str(&template_data.file)?
    };

    let base_dir = workflow_file.parent().unwrap_or_else(|| Path::new("."));
    load_local_files(base_dir, &mut workflow_doc)?;
    template_data.file = serde_yaml::to_string(&workflow_doc)?;

    let result = client
        .request_json(
            Method::POST,
            &endpoint,
            RequestOptions {
                params: vec![
                    ("validation_only".to_owned(), "true".to_owned()),
                    ("dry_run".to_owned(), "false".to_owned()),
                ],
                payload: Some(serde_json::to_value(&template_data)?),
                ..Default::default()
            },
        )
        .await?;
    println!(
        "{}",
        result.get("logs").and_then(|l| l.as_str()).unwrap_or("")
    );
    Ok(())
}

/// Streams a line-oriented response body to stdout, giving a friendly note when a chunked log
/// stream times out mid-flight.
pub async fn print_streaming_response(resp: reqwest::Response, friendly_timeout: bool) -> Result<()> {
    use tokio::io::AsyncBufReadExt;
    use tokio_stream::StreamExt;

    let stream = resp
        .bytes_stream()
        .map(|chunk| chunk.map_err(|e| std::io::Error::other(e.to_string())));
    let reader = tokio_util::io::StreamReader::new(stream);
    let mut lines = tokio::io::BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => println!("{}", line),
            Ok(None) => return Ok(()),
            Err(err) => {
                // An abrupt chunk boundary is how the service ends a timed-out log stream
                if friendly_timeout {
                    println!(
                        "\nLog stream has timed out or failed. Please run the command again \
                         to continue viewing logs."
                    );
                    return Ok(());
                }
                return Err(OsmoError::server(format!("Failed to fetch stream: {}", err)));
            }
        }
    }
}

/// Fetches and prints workflow logs (or error logs) as they stream.
pub async fn print_logs(
    client: &ServiceClient,
    workflow_id: &str,
    task: Option<&str>,
    retry_id: Option<u32>,
    error_logs: bool,
    last_n_lines: Option<u32>,
) -> Result<()> {
    tracing::debug!(workflow_id, "Fetch workflow logs");
    if (error_logs || retry_id.is_some()) && task.is_none() {
        return Err(OsmoError::user("Specify task for retry ID or error logs."));
    }

    let mut params = Vec::new();
    if let Some(n) = last_n_lines {
        params.push(("last_n_lines".to_owned(), n.to_string()));
    }
    if let Some(task) = task {
        params.push(("task_name".to_owned(), task.to_owned()));
    }
    if let Some(retry) = retry_id {
        params.push(("retry_id".to_owned(), retry.to_string()));
    }

    let endpoint = if error_logs {
        format!("api/workflow/{}/error_logs", workflow_id)
    } else {
        format!("api/workflow/{}/logs", workflow_id)
    };
    let resp = client
        .request(
            Method::GET,
            &endpoint,
            RequestOptions::with_params(params),
            ResponseMode::Streaming,
        )
        .await?
        .into_stream()?;

    if error_logs {
        println!("Workflow {} has error logs:", workflow_id);
    } else {
        println!("Workflow {} has logs:", workflow_id);
    }
    print_streaming_response(resp, true).await
}

/// Streams the stored workflow spec (or the original templated spec) to stdout.
pub async fn print_spec(client: &ServiceClient, workflow_id: &str, template: bool) -> Result<()> {
    tracing::debug!(workflow_id, "Get workflow spec");
    let resp = client
        .request(
            Method::GET,
            &format!("api/workflow/{}/spec", workflow_id),
            RequestOptions::with_params(vec![(
                "use_template".to_owned(),
                template.to_string(),
            )]),
            ResponseMode::Streaming,
        )
        .await?
        .into_stream()?;
    print_streaming_response(resp, false).await
}

#[cfg(test)]
mod test {
    use super::*;

    const PLAIN_SPEC: &str = r#"
workflow:
  name: train
  groups:
    - name: g1
      tasks:
        - name: lead
          lead: true
"#;

    #[test]
    fn test_templating_detection() {
        for templated in [
            "replicas: {{ replicas }}",
            "{% for i in tasks %}",
            "{# comment #}",
            "default-values:\n  replicas: 2",
        ] {
            assert!(
                parse_file_for_template(templated, vec![], vec![]).is_templated,
                "{} should be templated",
                templated
            );
        }
        assert!(!parse_file_for_template(PLAIN_SPEC, vec![], vec![]).is_templated);
    }

    #[test]
    fn test_is_workflow_id() {
        assert!(is_workflow_id("wf-1"));
        assert!(is_workflow_id("wonderful-darwin-1234"));
        assert!(!is_workflow_id("flows/train.yaml"));
        assert!(!is_workflow_id("./train.yaml"));
        assert!(!is_workflow_id(""));
    }

    #[test]
    fn test_load_local_files_inlines_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("startup.sh"), "echo hi\n").unwrap();
        let spec = r#"
workflow:
  name: train
  tasks:
    - name: t1
      files:
        - path: /opt/startup.sh
          localpath: startup.sh
  groups:
    - tasks:
        - name: t2
          files:
            - path: /opt/other.sh
              localpath: startup.sh
"#;
        let mut doc: Value = serde_yaml::from_str(spec).unwrap();
        load_local_files(dir.path(), &mut doc).unwrap();

        let first_pass = serde_yaml::to_string(&doc).unwrap();
        assert!(first_pass.contains("echo hi"));
        assert!(!first_pass.contains("localpath"));

        // Running the pipeline again over the expanded document changes nothing
        let mut doc_again: Value = serde_yaml::from_str(&first_pass).unwrap();
        load_local_files(dir.path(), &mut doc_again).unwrap();
        assert_eq!(serde_yaml::to_string(&doc_again).unwrap(), first_pass);
    }

    #[test]
    fn test_load_local_files_rejects_contents_with_localpath() {
        let dir = tempfile::tempdir().unwrap();
        let spec = r#"
workflow:
  tasks:
    - name: t1
      files:
        - path: /opt/x
          contents: "already here"
          localpath: x.sh
"#;
        let mut doc: Value = serde_yaml::from_str(spec).unwrap();
        let err = load_local_files(dir.path(), &mut doc).unwrap_err();
        assert!(matches!(err, OsmoError::Submission { .. }));
    }

    #[test]
    fn test_collect_localpath_datasets_rejects_versioned_names() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("data")).unwrap();
        let spec = r#"
workflow:
  tasks:
    - name: t1
      inputs:
        - dataset:
            name: training:v3
            localpath: data
"#;
        let doc: Value = serde_yaml::from_str(spec).unwrap();
        let err = collect_localpath_dataset_inputs(dir.path(), &doc).unwrap_err();
        assert!(matches!(err, OsmoError::Submission { .. }));
    }

    #[test]
    fn test_localpath_dataset_backfill() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("data")).unwrap();
        let spec = r#"
workflow:
  tasks:
    - name: t1
      inputs:
        - dataset:
            name: training
            localpath: data
        - dataset:
            name: training
            localpath: data
"#;
        let mut doc: Value = serde_yaml::from_str(spec).unwrap();

        let inputs = collect_localpath_dataset_inputs(dir.path(), &doc).unwrap();
        // Duplicate references to the same (name, path) coalesce into one upload
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs[0].0, "training");

        let mut versions = HashMap::new();
        versions.insert(inputs[0].clone(), "v42".to_owned());
        backfill_dataset_versions(dir.path(), &mut doc, &versions).unwrap();

        let rendered = serde_yaml::to_string(&doc).unwrap();
        assert!(rendered.contains("training:v42"));
        assert!(!rendered.contains("localpath"));
    }
}
