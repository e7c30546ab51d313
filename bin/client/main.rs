use std::io::IsTerminal;
use std::time::Duration;

use clap::Parser;
use comfy_table::Table;
use osmo::client::{Method, RequestOptions, ServiceClient};
use osmo::login::{LoginConfig, LoginManager};
use osmo::tunnel::exec::INTERACTIVE_COMMANDS;
use osmo::workflow::SubmitOptions;
use osmo::{rsync, tunnel, workflow, OsmoError};

mod opts;

use opts::*;

type Result<T> = osmo::Result<T>;

#[tokio::main]
async fn main() {
    let opts = Opts::parse();

    // The hidden daemon entry point owns its logging (a rotating file) and must not touch
    // the terminal subscriber
    if let SubCommand::Workflow(workflow_opts) = &opts.subcmd {
        if matches!(workflow_opts.command, WorkflowCommand::RsyncDaemon) {
            if let Err(e) = rsync::daemon::run_daemon(LoginConfig::default()).await {
                eprintln!("{}", e);
                std::process::exit(1);
            }
            return;
        }
    }

    init_tracing();

    // Trap and format error messages using the proper value
    if let Err(e) = run(opts).await.map_err(anyhow::Error::new) {
        eprintln!("{}", e);
        for (i, cause) in e.chain().enumerate() {
            // Skip the first message because it is printed above.
            if i > 0 {
                if i == 1 {
                    eprintln!("\nError trace:");
                }
                eprintln!("\t{}: {}", i, cause);
            }
        }
        std::process::exit(1);
    }
}

fn init_tracing() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    // Logs also land in <state_dir>/client.log when it is writable
    let state_dir = osmo::config::client_state_dir();
    let _ = std::fs::create_dir_all(&state_dir);
    let file_layer = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(osmo::config::client_log_file())
        .ok()
        .map(|file| {
            tracing_subscriber::fmt::layer()
                .with_writer(std::sync::Arc::new(file))
                .with_ansi(false)
        });

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(std::io::stderr().is_terminal()),
        )
        .with(file_layer)
        .init();
}

async fn run(opts: Opts) -> Result<()> {
    let login_manager = LoginManager::new(LoginConfig::default(), osmo::CLIENT_USER_AGENT_PREFIX)?;
    let client = ServiceClient::new(login_manager)?;

    match opts.subcmd {
        SubCommand::Login(login_opts) => login(&client, login_opts).await,
        SubCommand::Logout => {
            client.login_manager().logout().await?;
            println!("Successfully logged out.");
            Ok(())
        }
        SubCommand::Version => version(&client).await,
        SubCommand::Workflow(workflow_opts) => match workflow_opts.command {
            WorkflowCommand::Submit(submit_opts) => submit(&client, submit_opts).await,
            WorkflowCommand::Restart(restart_opts) => {
                workflow::restart(
                    &client,
                    &restart_opts.workflow_id,
                    restart_opts.pool,
                    restart_opts.format_type.into(),
                )
                .await
            }
            WorkflowCommand::Validate(validate_opts) => {
                workflow::validate(
                    &client,
                    &validate_opts.workflow_file,
                    validate_opts.pool,
                    validate_opts.set,
                    validate_opts.set_string,
                )
                .await
            }
            WorkflowCommand::Logs(logs_opts) => {
                workflow::print_logs(
                    &client,
                    &logs_opts.workflow_id,
                    logs_opts.task.as_deref(),
                    logs_opts.retry_id,
                    logs_opts.error,
                    logs_opts.last_n_lines,
                )
                .await
            }
            WorkflowCommand::Cancel(cancel_opts) => cancel(&client, cancel_opts).await,
            WorkflowCommand::Query(query_opts) => query(&client, query_opts).await,
            WorkflowCommand::List(list_opts) => list(&client, list_opts).await,
            WorkflowCommand::Tag(tag_opts) => tag(&client, tag_opts).await,
            WorkflowCommand::Exec(exec_opts) => exec(&client, exec_opts).await,
            WorkflowCommand::Spec(spec_opts) => {
                workflow::print_spec(&client, &spec_opts.workflow_id, spec_opts.template).await
            }
            WorkflowCommand::PortForward(pf_opts) => port_forward(&client, pf_opts).await,
            WorkflowCommand::Rsync(rsync_opts) => rsync_command(&client, rsync_opts).await,
            WorkflowCommand::RsyncDaemon => unreachable!("handled before subscriber setup"),
        },
    }
}

async fn login(client: &ServiceClient, args: Login) -> Result<()> {
    let manager = client.login_manager();

    // Get the url from args or fall back to the last used url
    let url = match args.url {
        Some(url) => url,
        None => manager.url().await.map_err(|_| {
            OsmoError::user(
                "No url provided and no previous login found. Please provide a url: \
                 osmo login <url>",
            )
        })?,
    };
    let parsed = url::Url::parse(&url)
        .map_err(|e| OsmoError::user(format!("Bad url {}: {}", url, e)))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(OsmoError::user(format!("Bad url {}: not an http(s) url", url)));
    }

    println!("Logging in to {}", url);

    let username = args.username;
    let password = match args.password_file {
        Some(path) => Some(
            std::fs::read_to_string(path)?
                .trim_end_matches('\n')
                .to_owned(),
        ),
        None => args.password,
    };

    match args.method {
        LoginMethod::Code => {
            let (device_endpoint, client_id) = match args.device_endpoint {
                Some(endpoint) => (endpoint, None),
                None => manager.fetch_login_info(&url).await?,
            };
            manager
                .device_code_login(&url, &device_endpoint, client_id.as_deref())
                .await
        }
        LoginMethod::Password => {
            let username = username.ok_or_else(|| OsmoError::user("Must provide username"))?;
            let password = password.ok_or_else(|| OsmoError::user("Must provide password"))?;
            manager.owner_password_login(&url, &username, &password).await
        }
        LoginMethod::Token => {
            let token = match args.token_file {
                Some(path) => std::fs::read_to_string(path)?.trim().to_owned(),
                None => args.token.ok_or_else(|| {
                    OsmoError::user("Must provide token with --token or --token-file")
                })?,
            };
            manager.token_login(&url, &token).await
        }
        LoginMethod::Dev => {
            let username = username.ok_or_else(|| OsmoError::user("Must provide username"))?;
            manager.dev_login(&url, &username).await
        }
    }
}

async fn version(client: &ServiceClient) -> Result<()> {
    println!("Client Version  - {}", osmo::Version::current());
    match client
        .request_json(Method::GET, "api/version", RequestOptions::default())
        .await
    {
        Ok(result) => {
            let service_version = result
                .get("version")
                .map(|v| match v.as_str() {
                    Some(s) => s.to_owned(),
                    None => v.to_string(),
                })
                .unwrap_or_else(|| "-".to_owned());
            println!("Service Version - {}", service_version);
        }
        Err(err) => eprintln!("Could not fetch service version: {}", err),
    }
    Ok(())
}

async fn submit(client: &ServiceClient, args: Submit) -> Result<()> {
    let opts = SubmitOptions {
        pool: args.pool,
        set: args.set,
        set_string: args.set_string,
        set_env: args.set_env,
        priority: args.priority,
        dry_run: args.dry_run,
        local_path: args.local_path,
        rsync: args.rsync,
        format: args.format_type.into(),
    };
    workflow::submit(client, &args.workflow_file, &opts).await
}

async fn cancel(client: &ServiceClient, args: Cancel) -> Result<()> {
    tracing::debug!("Canceling workflow(s) {}", args.workflow_ids.join(","));
    let mut params = vec![("force".to_owned(), args.force.to_string())];
    if let Some(message) = &args.message {
        params.push(("message".to_owned(), message.clone()));
    }
    for workflow_id in &args.workflow_ids {
        let result = client
            .request_json(
                Method::POST,
                &format!("api/workflow/{}/cancel", workflow_id),
                RequestOptions::with_params(params.clone()),
            )
            .await;
        match result {
            Ok(result) => {
                if args.format_type == FormatType::Json {
                    println!("{}", serde_json::to_string_pretty(&result)?);
                } else {
                    let name = result.get("name").and_then(|n| n.as_str()).unwrap_or("-");
                    println!("Cancel job for workflow {} is submitted!", name);
                }
            }
            Err(err) => println!(
                "Workflow cancelation failed for workflow {}: {}",
                workflow_id, err
            ),
        }
    }
    Ok(())
}

/// Converts a UTC timestamp from the service into the user's local timezone for display.
fn to_user_zone(value: &str) -> String {
    match chrono::DateTime::parse_from_rfc3339(value) {
        Ok(dt) => dt
            .with_timezone(&chrono::Local)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
        Err(_) => value.to_owned(),
    }
}

async fn query(client: &ServiceClient, args: Query) -> Result<()> {
    tracing::debug!("Query workflow {}", args.workflow_id);
    let result = client
        .request_json(
            Method::GET,
            &format!("api/workflow/{}", args.workflow_id),
            RequestOptions::with_params(vec![(
                "verbose".to_owned(),
                args.verbose.to_string(),
            )]),
        )
        .await?;

    if args.format_type == FormatType::Json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    let get_str = |key: &str| {
        result
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or("-")
            .to_owned()
    };
    let submit_time = to_user_zone(&get_str("submit_time"));
    println!(
        "--------------------------------------------------------------------\n\
         \nWorkflow ID : {}\
         \nStatus      : {}\
         \nUser        : {}\
         \nSubmit Time : {}\
         \nOverview    : {}\n",
        args.workflow_id,
        get_str("status"),
        get_str("submitted_by"),
        submit_time,
        get_str("overview"),
    );

    let mut table = Table::new();
    if args.verbose {
        table.set_header(["Task Name", "Retry ID", "Start Time", "Status"]);
    } else {
        table.set_header(["Task Name", "Start Time", "Status"]);
    }
    let empty = Vec::new();
    let groups = result.get("groups").and_then(|g| g.as_array()).unwrap_or(&empty);
    for group in groups {
        let tasks = group.get("tasks").and_then(|t| t.as_array()).unwrap_or(&empty);
        for task in tasks {
            let name = task.get("name").and_then(|n| n.as_str()).unwrap_or("-");
            let status = task.get("status").and_then(|s| s.as_str()).unwrap_or("-");
            let start_time = task
                .get("start_time")
                .and_then(|t| t.as_str())
                .map(to_user_zone)
                .unwrap_or_else(|| "-".to_owned());
            if args.verbose {
                let retry_id = task
                    .get("retry_id")
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "-".to_owned());
                table.add_row([name.to_owned(), retry_id, start_time, status.to_owned()]);
            } else {
                table.add_row([name.to_owned(), start_time, status.to_owned()]);
            }
        }
    }
    println!("{}", table);
    Ok(())
}

async fn list(client: &ServiceClient, args: List) -> Result<()> {
    let mut params: Vec<(String, String)> = Vec::new();
    for user in &args.user {
        params.push(("users".to_owned(), user.clone()));
    }
    for status in &args.status {
        params.push(("statuses".to_owned(), status.clone()));
    }
    if let Some(name) = &args.name {
        params.push(("name".to_owned(), name.clone()));
    }
    params.push((
        "order".to_owned(),
        match args.order {
            Order::Asc => "ASC".to_owned(),
            Order::Desc => "DESC".to_owned(),
        },
    ));
    if args.all_users {
        params.push(("all_users".to_owned(), "true".to_owned()));
    }
    for tag in &args.tags {
        params.push(("tags".to_owned(), tag.clone()));
    }
    if args.pool.is_empty() {
        params.push(("all_pools".to_owned(), "true".to_owned()));
    } else {
        for pool in &args.pool {
            params.push(("pools".to_owned(), pool.clone()));
        }
    }
    for priority in &args.priority {
        params.push(("priority".to_owned(), priority.to_string()));
    }

    let parse_date = |value: &str| -> Result<chrono::NaiveDate> {
        chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|_| {
            OsmoError::user(format!("Date {} must be in format YYYY-MM-DD", value))
        })
    };
    let submitted_after = args.submitted_after.as_deref().map(parse_date).transpose()?;
    let submitted_before = args
        .submitted_before
        .as_deref()
        .map(parse_date)
        .transpose()?;
    if let (Some(after), Some(before)) = (submitted_after, submitted_before) {
        if after > before {
            return Err(OsmoError::user(format!(
                "Value submitted-before ({}) needs to be later than submitted-after ({}).",
                before, after
            )));
        }
    }
    if let Some(after) = submitted_after {
        params.push(("submitted_after".to_owned(), format!("{}T00:00:00", after)));
    }
    if let Some(before) = submitted_before {
        params.push(("submitted_before".to_owned(), format!("{}T00:00:00", before)));
    }

    // Page through the server in chunks until the requested count is reached
    let mut workflows: Vec<serde_json::Value> = Vec::new();
    let mut current_count: u32 = 0;
    loop {
        let count = (args.count - current_count).min(1000);
        let mut page_params = params.clone();
        page_params.push(("limit".to_owned(), count.to_string()));
        page_params.push(("offset".to_owned(), current_count.to_string()));

        let result = client
            .request_json(
                Method::GET,
                "api/workflow",
                RequestOptions::with_params(page_params),
            )
            .await?;
        let mut page = result
            .get("workflows")
            .and_then(|w| w.as_array())
            .cloned()
            .unwrap_or_default();
        page.extend(workflows);
        workflows = page;
        current_count += count;
        let more = result
            .get("more_entries")
            .and_then(|m| m.as_bool())
            .unwrap_or(false);
        if args.count <= current_count || !more {
            break;
        }
    }

    if args.format_type == FormatType::Json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({ "workflows": workflows }))?
        );
        return Ok(());
    }

    if workflows.is_empty() {
        println!("There are no workflows to view.");
        return Ok(());
    }
    let mut table = Table::new();
    table.set_header(["User", "Workflow ID", "Submit Time", "Status", "Priority", "Overview"]);
    for wf in &workflows {
        let get = |key: &str| {
            wf.get(key)
                .and_then(|v| v.as_str())
                .unwrap_or("-")
                .to_owned()
        };
        table.add_row([
            get("user"),
            get("name"),
            to_user_zone(&get("submit_time")),
            get("status"),
            get("priority"),
            get("overview"),
        ]);
    }
    println!("{}", table);
    Ok(())
}

async fn tag(client: &ServiceClient, args: Tag) -> Result<()> {
    if (!args.add.is_empty() || !args.remove.is_empty()) && args.workflow.is_empty() {
        return Err(OsmoError::user("No workflow specified to add/remove tags from!"));
    }
    if !args.workflow.is_empty() && args.add.is_empty() && args.remove.is_empty() {
        return Err(OsmoError::user("No tags specified to add/remove!"));
    }

    if !args.workflow.is_empty() {
        let mut params: Vec<(String, String)> = Vec::new();
        for tag in &args.add {
            params.push(("add".to_owned(), tag.clone()));
        }
        for tag in &args.remove {
            params.push(("remove".to_owned(), tag.clone()));
        }
        for workflow_id in &args.workflow {
            let result = client
                .request_json(
                    Method::POST,
                    &format!("api/workflow/{}/tag", workflow_id),
                    RequestOptions::with_params(params.clone()),
                )
                .await;
            match result {
                Ok(_) => println!("Workflow {} updated.", workflow_id),
                Err(err @ OsmoError::User { .. }) => println!("{}", err),
                Err(err) => return Err(err),
            }
        }
        return Ok(());
    }

    let result = client
        .request_json(Method::GET, "api/tag", RequestOptions::default())
        .await?;
    let empty = Vec::new();
    let tags = result.get("tags").and_then(|t| t.as_array()).unwrap_or(&empty);
    if tags.is_empty() {
        println!("No tags have been set by admins.");
    }
    println!("Tags:");
    for tag in tags {
        println!("- {}", tag.as_str().unwrap_or_default());
    }
    Ok(())
}

async fn exec(client: &ServiceClient, args: Exec) -> Result<()> {
    tracing::debug!("Exec into workflow {}", args.workflow_id);
    let timeout = Duration::from_secs(args.connect_timeout);
    let params = vec![("entry_command".to_owned(), args.exec_entry_command.clone())];

    if let Some(group) = &args.group {
        if INTERACTIVE_COMMANDS
            .iter()
            .any(|shell| args.exec_entry_command.ends_with(shell))
        {
            return Err(OsmoError::user(
                "Interactive commands are not supported for exec groups. Use \"--entry\" to \
                 specify a non-interactive command.",
            ));
        }
        if args.keep_alive {
            return Err(OsmoError::user("Keep-alive is not supported for exec groups."));
        }

        let result = client
            .request_json(
                Method::POST,
                &format!("api/workflow/{}/exec/group/{}", args.workflow_id, group),
                RequestOptions::with_params(params),
            )
            .await?;
        let connections = result.as_object().ok_or_else(|| {
            OsmoError::server("Malformed exec group response from service")
        })?;

        let mut sessions = Vec::new();
        for (task_name, value) in connections {
            let tunnel_params: tunnel::TunnelParams = serde_json::from_value(value.clone())
                .map_err(|e| {
                    OsmoError::server(format!("Malformed exec response from service: {}", e))
                })?;
            let client = client.clone();
            let workflow_id = args.workflow_id.clone();
            let task_name = task_name.clone();
            sessions.push(tokio::spawn(async move {
                if let Err(err) = tunnel::exec::run_exec_command(
                    &client,
                    &workflow_id,
                    &task_name,
                    &tunnel_params,
                    timeout,
                )
                .await
                {
                    tracing::error!(error = %err, task = %task_name, "Exec failed");
                }
            }));
        }
        futures::future::join_all(sessions).await;
        return Ok(());
    }

    let task = args.task.as_deref().expect("clap enforces task xor group");
    let endpoint = format!("api/workflow/{}/exec/task/{}", args.workflow_id, task);

    loop {
        let result = client
            .request_json(
                Method::POST,
                &endpoint,
                RequestOptions::with_params(params.clone()),
            )
            .await?;
        let tunnel_params: tunnel::TunnelParams =
            serde_json::from_value(result).map_err(|e| {
                OsmoError::server(format!("Malformed exec response from service: {}", e))
            })?;

        match tunnel::exec::run_exec_interactive(client, &args.workflow_id, &tunnel_params, timeout)
            .await
        {
            Ok(()) => return Ok(()),
            Err(err) if args.keep_alive => {
                println!("Reconnecting to the exec session... ({})", err);
                tokio::time::sleep(Duration::from_secs(10)).await;
            }
            Err(err) => return Err(err),
        }
    }
}

async fn port_forward(client: &ServiceClient, args: PortForward) -> Result<()> {
    tracing::debug!(
        "Port forward for workflow {}, task {}",
        args.workflow_id,
        args.task
    );
    let (local_ports, remote_ports) = workflow::ports::parse_port_spec(&args.port)?;
    let timeout = Duration::from_secs(args.connect_timeout);

    let results = tunnel::request_port_forward(
        client,
        &args.workflow_id,
        &args.task,
        &remote_ports,
        args.udp,
    )
    .await?;
    if results.len() != local_ports.len() {
        return Err(OsmoError::server(
            "Service returned a mismatched number of port-forward parameters",
        ));
    }

    let mut forwards = Vec::new();
    for ((local_port, remote_port), params) in local_ports
        .into_iter()
        .zip(remote_ports.into_iter())
        .zip(results.into_iter())
    {
        let client = client.clone();
        let workflow_id = args.workflow_id.clone();
        let task = args.task.clone();
        let host = args.host.clone();
        let use_udp = args.udp;
        forwards.push(tokio::spawn(async move {
            if let Err(err) = tunnel::forward_single_port(
                &client,
                &workflow_id,
                &task,
                &host,
                local_port,
                remote_port,
                use_udp,
                timeout,
                params,
            )
            .await
            {
                tracing::error!(error = %err, port = local_port, "Port forward ended");
            }
        }));
    }

    // Hold all tunnels until the first one dies or the user interrupts
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = futures::future::select_all(&mut forwards) => {}
    }
    for forward in &forwards {
        forward.abort();
    }
    Ok(())
}

async fn rsync_command(client: &ServiceClient, mut args: Rsync) -> Result<()> {
    if args.status {
        return rsync_status_table();
    }
    if args.stop {
        return rsync_stop(args.workflow_id.as_deref(), args.task.as_deref());
    }

    let Some(workflow_id) = args.workflow_id.clone() else {
        return Err(OsmoError::user("Workflow ID is required for rsync."));
    };
    if args.path.is_none() && args.task.is_none() {
        return Err(OsmoError::user("Path is required for rsync."));
    }
    if args.path.is_none() {
        // Only workflow_id and path were provided; shift the task argument over
        args.path = args.task.take();
    }
    let path = args.path.expect("path populated above");

    rsync::rsync_upload(
        client,
        &workflow_id,
        args.task.as_deref(),
        &path,
        &rsync::RsyncUploadOptions {
            daemon: !args.once,
            timeout: Duration::from_secs(args.timeout),
            upload_rate_limit: args.upload_rate_limit,
            debounce_delay: args.debounce_delay,
            poll_interval: args.poll_interval,
            reconcile_interval: args.reconcile_interval,
            max_log_size: args.max_log_size,
            verbose: args.verbose,
            quiet: false,
        },
    )
    .await
}

fn rsync_status_table() -> Result<()> {
    let daemons = rsync::daemon::rsync_status(None, None, None)?;
    if daemons.is_empty() {
        println!("No rsync daemons found");
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header([
        "Workflow ID",
        "Task Name",
        "PID",
        "Status",
        "Last Synced",
        "Source Path",
        "Destination Path",
        "Log File",
    ]);
    for daemon in &daemons {
        let metadata = &daemon.metadata;
        table.add_row([
            metadata.rsync_request.workflow_id.clone(),
            metadata.rsync_request.task_name.clone(),
            metadata.pid.to_string(),
            daemon.status.as_str().to_owned(),
            metadata
                .last_synced
                .clone()
                .unwrap_or_else(|| "-".to_owned()),
            metadata.rsync_request.src.display().to_string(),
            metadata.rsync_request.original_dst_path.clone(),
            daemon
                .log_file
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "-".to_owned()),
        ]);
    }
    println!("\n{}\n", table);
    Ok(())
}

fn rsync_stop(workflow_id: Option<&str>, task: Option<&str>) -> Result<()> {
    let running = rsync::daemon::rsync_status(
        workflow_id,
        task,
        Some(&[rsync::daemon::RsyncDaemonStatus::Running]),
    )?;
    if running.is_empty() {
        println!("No running rsync daemons found");
        return Ok(());
    }

    // Stopping everything at once deserves a confirmation
    if workflow_id.is_none() && task.is_none() {
        let daemon_names = running
            .iter()
            .map(|d| {
                format!(
                    "{}/{}",
                    d.metadata.rsync_request.workflow_id, d.metadata.rsync_request.task_name
                )
            })
            .collect::<Vec<_>>()
            .join("\n\t* ");
        print!(
            "Are you sure you want to stop all running daemons?\n\n\t* {}\n\n[y/N] ",
            daemon_names
        );
        use std::io::Write;
        std::io::stdout().flush()?;
        let mut answer = String::new();
        std::io::stdin().read_line(&mut answer)?;
        if !answer.trim().to_lowercase().starts_with('y') {
            println!("Aborted");
            return Ok(());
        }
    }

    for daemon in &running {
        let name = format!(
            "{}/{}",
            daemon.metadata.rsync_request.workflow_id, daemon.metadata.rsync_request.task_name
        );
        println!("Stopping rsync daemon {}", name);
        if let Err(err) = rsync::daemon::terminate_daemon(daemon) {
            println!("Failed to stop rsync daemon {}: {}", name, err);
        }
    }
    Ok(())
}
