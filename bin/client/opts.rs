use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use osmo::workflow::{OutputFormat, WorkflowPriority};

const DESCRIPTION: &str = r#"
The OSMO Client

OSMO is a distributed workflow-execution platform. This program submits and
manages workflows and holds live channels (logs, exec, port-forward, rsync)
open against running tasks.
"#;

#[derive(Parser)]
#[command(name = "osmo", version, about = DESCRIPTION)]
pub struct Opts {
    #[command(subcommand)]
    pub subcmd: SubCommand,
}

#[derive(Subcommand)]
pub enum SubCommand {
    #[command(about = "Log in with device flow or client credentials flow")]
    Login(Login),
    #[command(about = "Remove stored access tokens")]
    Logout,
    #[command(about = "Manage workflows submitted to the workflow service")]
    Workflow(WorkflowOpts),
    #[command(about = "Show the client and service versions")]
    Version,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LoginMethod {
    /// Get a device code and url to log in securely through a browser
    Code,
    /// Provide username and password directly through the CLI
    Password,
    /// Read an access token directly from a flag or file
    Token,
    /// Send the username as a non-verified header (development only)
    Dev,
}

#[derive(Parser)]
pub struct Login {
    #[arg(
        help = "The url of the osmo server to connect to. If not provided, uses the last \
                used url."
    )]
    pub url: Option<String>,
    #[arg(
        long,
        help = "The url to use to complete device flow authentication. If not provided, it \
                will be fetched from the service."
    )]
    pub device_endpoint: Option<String>,
    #[arg(long, value_enum, default_value = "code")]
    pub method: LoginMethod,
    #[arg(
        long,
        help = "Username if logging in with credentials. This should only be used for \
                service accounts that cannot authenticate via web browser."
    )]
    pub username: Option<String>,
    #[arg(long, help = "Password if logging in with credentials")]
    pub password: Option<String>,
    #[arg(
        long,
        conflicts_with = "password",
        help = "File containing password if logging in with credentials"
    )]
    pub password_file: Option<PathBuf>,
    #[arg(long, help = "Token if logging in with credentials")]
    pub token: Option<String>,
    #[arg(
        long,
        conflicts_with = "token",
        help = "File containing the access token"
    )]
    pub token_file: Option<PathBuf>,
}

#[derive(Parser)]
pub struct WorkflowOpts {
    #[command(subcommand)]
    pub command: WorkflowCommand,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
pub enum FormatType {
    #[default]
    Text,
    Json,
}

impl From<FormatType> for OutputFormat {
    fn from(format: FormatType) -> Self {
        match format {
            FormatType::Text => OutputFormat::Text,
            FormatType::Json => OutputFormat::Json,
        }
    }
}

pub fn parse_priority(value: &str) -> Result<WorkflowPriority, String> {
    value.parse().map_err(|e: osmo::OsmoError| e.to_string())
}

#[derive(Subcommand)]
pub enum WorkflowCommand {
    #[command(about = "Submit a workflow to the workflow service")]
    Submit(Submit),
    #[command(about = "Restart a failed workflow")]
    Restart(Restart),
    #[command(about = "Validate a workflow against the workflow service")]
    Validate(Validate),
    #[command(about = "Get the logs from a workflow")]
    Logs(Logs),
    #[command(about = "Cancel a queued or running workflow")]
    Cancel(Cancel),
    #[command(about = "Query the status of a running workflow")]
    Query(Query),
    #[command(about = "List workflows with different filters")]
    List(List),
    #[command(about = "List or change tags on workflow(s)")]
    Tag(Tag),
    #[command(about = "Exec into a task of a workflow")]
    Exec(Exec),
    #[command(about = "Get workflow spec")]
    Spec(Spec),
    #[command(about = "Port-forward data from workflow to local machine")]
    PortForward(PortForward),
    #[command(about = "Rsync data from local machine to a remote workflow task")]
    Rsync(Rsync),
    #[command(hide = true)]
    RsyncDaemon,
}

#[derive(Parser)]
pub struct Submit {
    #[arg(
        help = "The workflow file to submit, or a workflow ID to resubmit. If using a \
                workflow ID, --dry-run and --set are not supported."
    )]
    pub workflow_file: String,
    #[arg(short = 't', long, value_enum, default_value = "text")]
    pub format_type: FormatType,
    #[arg(
        long,
        num_args = 1..,
        help = "Assign fields in the workflow file in the form \"<field>=<value>\". Values \
                will be cast as int or float if applicable."
    )]
    pub set: Vec<String>,
    #[arg(
        long = "set-string",
        num_args = 1..,
        help = "Assign fields in the workflow file in the form \"<field>=<value>\". All \
                values will be cast as string."
    )]
    pub set_string: Vec<String>,
    #[arg(
        long = "set-env",
        num_args = 1..,
        help = "Assign environment variables to the workflow in the format <key>=<value>. \
                Values declared here override values in the workflow."
    )]
    pub set_env: Vec<String>,
    #[arg(
        long = "dry-run",
        help = "Does not submit the workflow and prints the expanded workflow to the console"
    )]
    pub dry_run: bool,
    #[arg(
        short,
        long,
        help = "The target pool to run the workflow with. If no pool is specified, the \
                default pool assigned in the profile will be used."
    )]
    pub pool: Option<String>,
    #[arg(
        short = 'l',
        long = "local-path",
        help = "The absolute path local files in the workflow file should be fetched from. \
                Defaults to the directory of the workflow file."
    )]
    pub local_path: Option<PathBuf>,
    #[arg(
        long,
        help = "Start a background rsync daemon to continuously upload data from the local \
                machine to the lead task of the workflow, in the format \
                <local_path>:<remote_path>."
    )]
    pub rsync: Option<String>,
    #[arg(
        long,
        value_parser = parse_priority,
        help = "The priority to use when scheduling the workflow (HIGH, NORMAL, LOW). LOW \
                workflows may be preempted to allow a higher priority workflow to run."
    )]
    pub priority: Option<WorkflowPriority>,
}

#[derive(Parser)]
pub struct Restart {
    #[arg(help = "The workflow ID or UUID to restart")]
    pub workflow_id: String,
    #[arg(short = 't', long, value_enum, default_value = "text")]
    pub format_type: FormatType,
    #[arg(short, long, help = "The target pool to run the workflow with")]
    pub pool: Option<String>,
}

#[derive(Parser)]
pub struct Validate {
    #[arg(help = "The workflow file to validate")]
    pub workflow_file: PathBuf,
    #[arg(long, num_args = 1..)]
    pub set: Vec<String>,
    #[arg(long = "set-string", num_args = 1..)]
    pub set_string: Vec<String>,
    #[arg(short, long, help = "The target pool to validate the workflow against")]
    pub pool: Option<String>,
}

#[derive(Parser)]
pub struct Logs {
    #[arg(help = "The workflow ID or UUID for which to fetch the logs")]
    pub workflow_id: String,
    #[arg(short, long, help = "The task name for which to fetch the logs")]
    pub task: Option<String>,
    #[arg(
        short,
        long = "retry-id",
        help = "The retry ID of the task for which to fetch the logs. Defaults to the \
                latest retry."
    )]
    pub retry_id: Option<u32>,
    #[arg(long, help = "Show task error logs instead of regular logs")]
    pub error: bool,
    #[arg(short = 'n', help = "Show last n lines of logs")]
    pub last_n_lines: Option<u32>,
}

#[derive(Parser)]
pub struct Cancel {
    #[arg(required = true, help = "The workflow IDs or UUIDs to cancel")]
    pub workflow_ids: Vec<String>,
    #[arg(short, long, help = "Additional message describing reason for cancellation")]
    pub message: Option<String>,
    #[arg(short, long, help = "Force cancel task group pods in the cluster")]
    pub force: bool,
    #[arg(short = 't', long, value_enum, default_value = "text")]
    pub format_type: FormatType,
}

#[derive(Parser)]
pub struct Query {
    #[arg(help = "The workflow ID or UUID to query the status of")]
    pub workflow_id: String,
    #[arg(short, long, help = "Whether to show all retried tasks")]
    pub verbose: bool,
    #[arg(short = 't', long, value_enum, default_value = "text")]
    pub format_type: FormatType,
}

#[derive(Parser)]
pub struct List {
    #[arg(short, long, default_value_t = 20, help = "Display the given count of workflows")]
    pub count: u32,
    #[arg(short, long, help = "Display workflows whose name contains the string")]
    pub name: Option<String>,
    #[arg(
        short,
        long,
        default_value = "asc",
        help = "Display in submission order: asc means latest at the bottom, desc means \
                latest at the top"
    )]
    pub order: Order,
    #[arg(short, long, num_args = 1.., help = "Display all workflows with the given status(es)")]
    pub status: Vec<String>,
    #[arg(short = 't', long, value_enum, default_value = "text")]
    pub format_type: FormatType,
    #[arg(
        long = "submitted-after",
        help = "Filter for workflows submitted after AND including this date (YYYY-MM-DD)"
    )]
    pub submitted_after: Option<String>,
    #[arg(
        long = "submitted-before",
        help = "Filter for workflows submitted before (NOT including) this date (YYYY-MM-DD)"
    )]
    pub submitted_before: Option<String>,
    #[arg(long, num_args = 1.., help = "Filter for workflows that contain the tag(s)")]
    pub tags: Vec<String>,
    #[arg(
        long,
        num_args = 1..,
        value_parser = parse_priority,
        help = "Filter workflows by priority levels"
    )]
    pub priority: Vec<WorkflowPriority>,
    #[arg(short, long, num_args = 1.., conflicts_with = "all_users",
          help = "Display all workflows by these users")]
    pub user: Vec<String>,
    #[arg(short, long = "all-users", help = "Display all workflows with no filtering on users")]
    pub all_users: bool,
    #[arg(short, long, num_args = 1.., help = "Display all workflows in these pools")]
    pub pool: Vec<String>,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Order {
    Asc,
    Desc,
}

#[derive(Parser)]
pub struct Tag {
    #[arg(
        short,
        long,
        num_args = 1..,
        help = "List of workflows to update. If not set, the CLI will return the list of \
                available tags to assign."
    )]
    pub workflow: Vec<String>,
    #[arg(short, long, num_args = 1.., help = "List of tags to add")]
    pub add: Vec<String>,
    #[arg(short, long, num_args = 1.., help = "List of tags to remove")]
    pub remove: Vec<String>,
}

#[derive(Parser)]
#[command(group(clap::ArgGroup::new("target").required(true).args(["task", "group"])))]
pub struct Exec {
    #[arg(help = "The workflow ID or UUID to exec in")]
    pub workflow_id: String,
    #[arg(help = "The task name to exec into")]
    pub task: Option<String>,
    #[arg(long, help = "Send command to all tasks in the group")]
    pub group: Option<String>,
    #[arg(
        long = "entry",
        default_value = "/bin/bash",
        help = "Specify the entry point for exec"
    )]
    pub exec_entry_command: String,
    #[arg(
        long = "connect-timeout",
        default_value_t = 60,
        help = "The connection timeout period in seconds"
    )]
    pub connect_timeout: u64,
    #[arg(long = "keep-alive", help = "Restart the exec command if connection is lost")]
    pub keep_alive: bool,
}

#[derive(Parser)]
pub struct Spec {
    #[arg(help = "The workflow ID or UUID to fetch the spec of")]
    pub workflow_id: String,
    #[arg(long, help = "Show the original templated spec")]
    pub template: bool,
}

#[derive(Parser)]
pub struct PortForward {
    #[arg(help = "The ID or UUID of the workflow to port forward from")]
    pub workflow_id: String,
    #[arg(help = "Name of the task in the workflow to port forward from")]
    pub task: String,
    #[arg(
        long,
        default_value = "localhost",
        help = "The hostname used to bind the local port"
    )]
    pub host: String,
    #[arg(
        long,
        required = true,
        help = "Ports to forward, as local_port[:task_port] items or inclusive ranges, \
                comma separated. e.g. \"8000:2000\", \"8000\", \"8000-8010:9000-9010,8015\"."
    )]
    pub port: String,
    #[arg(long, help = "Use UDP port forward")]
    pub udp: bool,
    #[arg(
        long = "connect-timeout",
        default_value_t = 60,
        help = "The connection timeout period in seconds"
    )]
    pub connect_timeout: u64,
}

#[derive(Parser)]
pub struct Rsync {
    #[arg(help = "The ID or UUID of the workflow to rsync to")]
    pub workflow_id: Option<String>,
    #[arg(
        help = "(Optional) The task to rsync upload to. If not provided, the upload goes to \
                the lead task of the first group."
    )]
    pub task: Option<String>,
    #[arg(help = "The src:dst path to rsync between")]
    pub path: Option<String>,
    #[arg(short, long, help = "Show the status of all rsync daemons")]
    pub status: bool,
    #[arg(long, help = "Stop one or more rsync daemons")]
    pub stop: bool,
    #[arg(long, default_value_t = 10, help = "The connection timeout period in seconds")]
    pub timeout: u64,
    #[arg(
        long = "upload-rate-limit",
        help = "Rate limit the upload speed in bytes per second. The upload speed is also \
                subject to the admin-configured rate limit."
    )]
    pub upload_rate_limit: Option<u64>,
    #[arg(
        long = "poll-interval",
        help = "Seconds between polling the task for changes in daemon mode. Defaults to \
                the admin-configured value."
    )]
    pub poll_interval: Option<f64>,
    #[arg(
        long = "debounce-delay",
        help = "Seconds of inactivity after the last file change before a sync triggers in \
                daemon mode. Defaults to the admin-configured value."
    )]
    pub debounce_delay: Option<f64>,
    #[arg(
        long = "reconcile-interval",
        help = "Seconds between reconciling the upload in daemon mode, so uploads deferred \
                by network interruptions resume. Defaults to the admin-configured value."
    )]
    pub reconcile_interval: Option<f64>,
    #[arg(
        long = "max-log-size",
        default_value_t = 2 * 1024 * 1024,
        help = "The maximum log size in bytes for the daemon before log rotation"
    )]
    pub max_log_size: u64,
    #[arg(long, help = "Enable verbose logging for the daemon")]
    pub verbose: bool,
    #[arg(
        long,
        help = "Run a single rsync upload to the workflow in the foreground and exit once \
                the upload completes"
    )]
    pub once: bool,
}
