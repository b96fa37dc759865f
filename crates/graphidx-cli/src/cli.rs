use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use graphidx::config::LogFormat;
use graphidx::JobStatus;

#[derive(Parser, Debug)]
#[command(name = "graphidx", version, about = "Queue and run knowledge-graph indexing jobs")]
pub struct Cli {
    /// JSON config file. Missing file means defaults.
    #[arg(long, global = true, env = "GRAPHIDX_CONFIG")]
    pub config: Option<PathBuf>,

    /// Overrides `databasePath` from the config.
    #[arg(long, global = true, env = "GRAPHIDX_DATABASE")]
    pub database: Option<PathBuf>,

    /// Overrides `maxConcurrentJobs` from the config.
    #[arg(long, global = true, env = "GRAPHIDX_WORKERS")]
    pub workers: Option<usize>,

    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormatArg>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogFormatArg {
    Plain,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Plain => LogFormat::Plain,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Manage workspaces
    #[command(subcommand)]
    Workspace(WorkspaceCommand),

    /// Queue an indexing job and follow it until it finishes
    Index(IndexArgs),

    /// Inspect and control jobs
    #[command(subcommand)]
    Jobs(JobsCommand),

    /// Aggregate job statistics
    Stats,

    /// Run the scheduler until interrupted
    Serve,
}

#[derive(Subcommand, Debug)]
pub enum WorkspaceCommand {
    /// Register a workspace
    Add { name: String, data_path: PathBuf },
    /// Show one workspace
    Show { id: String },
    /// List workspaces
    List,
}

#[derive(Args, Debug)]
pub struct IndexArgs {
    pub workspace_id: String,

    #[arg(long)]
    pub chunk_size: Option<u32>,

    #[arg(long)]
    pub chunk_overlap: Option<u32>,

    #[arg(long)]
    pub max_files: Option<u32>,

    /// Comma-separated entity types
    #[arg(long, value_delimiter = ',')]
    pub entity_types: Option<Vec<String>>,

    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Print the queued job and exit instead of running it
    #[arg(long)]
    pub detach: bool,
}

#[derive(Subcommand, Debug)]
pub enum JobsCommand {
    /// List jobs, newest first
    List {
        #[arg(long, value_parser = parse_status)]
        status: Option<JobStatus>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show one job
    Show { id: String },
    /// Cancel a queued or running job
    Cancel { id: String },
    /// Re-queue a failed job
    Retry { id: String },
    /// Workspace job history
    ForWorkspace { workspace_id: String },
}

fn parse_status(s: &str) -> Result<JobStatus, String> {
    s.parse().map_err(|e: graphidx::JobError| e.to_string())
}
