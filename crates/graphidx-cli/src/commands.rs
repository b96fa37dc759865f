//! Command handlers. Every handler prints one JSON `ApiResponse` on stdout
//! and reports whether it succeeded.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use graphidx::api::{action_response, ApiResponse, ApiStatus};
use graphidx::{
    Caller, CommandIndexer, CreateJobRequest, Database, IndexingConfig, IndexingManager,
    IndexingOperation, JobError, JobEventKind, JobStatus, OrchestratorConfig, SqliteWorkspaces,
    WorkspaceDirectory,
};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cli::{Cli, Commands, IndexArgs, JobsCommand, WorkspaceCommand};

/// `~/.graphidx/config.json`
pub fn default_config_path() -> Option<PathBuf> {
    graphidx::db::default_database_path()
        .and_then(|db| db.parent().and_then(|d| d.parent()).map(|root| root.join("config.json")))
}

/// Loads the config file and applies command-line overrides.
pub fn load_config(cli: &Cli) -> Result<OrchestratorConfig, String> {
    let mut config = match cli.config.clone().or_else(default_config_path) {
        Some(path) => graphidx::load_config_or_default(&path).map_err(|e| e.to_string())?,
        None => OrchestratorConfig::default(),
    };
    if let Some(db) = &cli.database {
        config.database_path = Some(db.clone());
    }
    if let Some(workers) = cli.workers {
        if workers == 0 {
            return Err("--workers must be at least 1".to_string());
        }
        config.max_concurrent_jobs = workers;
    }
    Ok(config)
}

fn emit<T: Serialize>(response: &ApiResponse<T>) -> bool {
    match serde_json::to_string_pretty(response) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Failed to encode response: {}", e),
    }
    response.success
}

fn fail(status: ApiStatus, message: impl Into<String>) -> bool {
    emit(&ApiResponse::<()>::err(status, message))
}

fn interrupt_token() -> Result<CancellationToken, String> {
    let token = CancellationToken::new();
    let handler_token = token.clone();
    ctrlc::set_handler(move || handler_token.cancel())
        .map_err(|e| format!("failed to install Ctrl-C handler: {}", e))?;
    Ok(token)
}

struct App {
    config: OrchestratorConfig,
    workspaces: SqliteWorkspaces,
    manager: IndexingManager,
}

impl App {
    fn open(config: OrchestratorConfig) -> Result<Self, String> {
        let path = config
            .resolved_database_path()
            .ok_or_else(|| "cannot determine database path; pass --database".to_string())?;
        let db = Database::open(&path).map_err(|e| e.to_string())?;
        let operation: Arc<dyn IndexingOperation> =
            Arc::new(CommandIndexer::from_config(&config.indexer));
        let manager = IndexingManager::from_config(&db, operation, &config);
        Ok(Self {
            workspaces: SqliteWorkspaces::new(db),
            config,
            manager,
        })
    }
}

pub async fn run(cli: Cli, config: OrchestratorConfig) -> bool {
    let app = match App::open(config) {
        Ok(app) => app,
        Err(e) => return fail(ApiStatus::Internal, e),
    };
    let caller = Caller::system();

    match cli.command {
        Commands::Workspace(cmd) => workspace(&app, cmd),
        Commands::Index(args) => index(&app, &caller, args).await,
        Commands::Jobs(cmd) => jobs(&app, &caller, cmd).await,
        Commands::Stats => emit(&ApiResponse::from_result(
            app.manager.get_indexing_stats().await,
        )),
        Commands::Serve => serve(&app).await,
    }
}

fn workspace(app: &App, cmd: WorkspaceCommand) -> bool {
    match cmd {
        WorkspaceCommand::Add { name, data_path } => {
            match app.workspaces.register(&name, &data_path.to_string_lossy()) {
                Ok(ws) => emit(&ApiResponse::created(ws)),
                Err(e) => emit(&ApiResponse::<()>::from_error(&e)),
            }
        }
        WorkspaceCommand::Show { id } => {
            let result = app
                .workspaces
                .get_workspace(&id)
                .and_then(|ws| ws.ok_or_else(|| JobError::workspace_not_found(&id)));
            emit(&ApiResponse::from_result(result))
        }
        WorkspaceCommand::List => emit(&ApiResponse::from_result(app.workspaces.list())),
    }
}

fn request_from_args(args: &IndexArgs) -> CreateJobRequest {
    let mut config = IndexingConfig::default();
    if let Some(size) = args.chunk_size {
        config.chunk_size = size;
    }
    if let Some(overlap) = args.chunk_overlap {
        config.chunk_overlap = overlap;
    }
    if let Some(types) = &args.entity_types {
        config.entity_types = types.clone();
    }
    config.max_files = args.max_files;
    CreateJobRequest {
        workspace_id: args.workspace_id.clone(),
        config,
        max_retries: args.max_retries,
    }
}

async fn index(app: &App, caller: &Caller, args: IndexArgs) -> bool {
    let request = request_from_args(&args);

    if args.detach {
        return match app.manager.create_job(caller, request).await {
            Ok(job) => emit(&ApiResponse::created(job)),
            Err(e) => emit(&ApiResponse::<()>::from_error(&e)),
        };
    }

    let interrupt = match interrupt_token() {
        Ok(token) => token,
        Err(e) => return fail(ApiStatus::Internal, e),
    };
    if let Err(e) = app.manager.start().await {
        return emit(&ApiResponse::<()>::from_error(&e));
    }

    let mut events = app.manager.subscribe();
    let job = match app.manager.create_job(caller, request).await {
        Ok(job) => job,
        Err(e) => {
            app.manager.shutdown().await;
            return emit(&ApiResponse::<()>::from_error(&e));
        }
    };
    info!(job_id = %job.id, workspace_id = %job.workspace_id, "Following indexing job");

    // Events only cover jobs run by this process; the poll covers the rest.
    let mut poll = tokio::time::interval(Duration::from_millis(status_poll_ms(&app.config)));
    let mut cancel_sent = false;
    loop {
        tokio::select! {
            _ = interrupt.cancelled(), if !cancel_sent => {
                cancel_sent = true;
                warn!(job_id = %job.id, "Interrupted, cancelling job");
                if let Err(e) = app.manager.cancel_job(caller, &job.id).await {
                    warn!(error = %e, "Cancel failed");
                }
            }
            event = events.recv() => match event {
                Ok(event) if event.job_id == job.id => {
                    match event.kind {
                        JobEventKind::Progress => info!(
                            stage = event.stage.as_deref().unwrap_or_default(),
                            progress = event.progress_percentage,
                            "Progress"
                        ),
                        JobEventKind::Completed | JobEventKind::Failed | JobEventKind::Cancelled => break,
                        _ => {}
                    }
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
            _ = poll.tick() => {
                match app.manager.get_job(&job.id).await {
                    Ok(current) if current.status.is_terminal() => break,
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Status poll failed"),
                }
            }
        }
    }

    let result = app.manager.get_job(&job.id).await;
    app.manager.shutdown().await;

    let completed = matches!(&result, Ok(j) if j.status == JobStatus::Completed);
    emit(&ApiResponse::from_result(result)) && completed
}

fn status_poll_ms(config: &OrchestratorConfig) -> u64 {
    config.poll_interval_ms.clamp(100, 2000)
}

async fn jobs(app: &App, caller: &Caller, cmd: JobsCommand) -> bool {
    let manager = &app.manager;
    match cmd {
        JobsCommand::List { status, limit } => {
            emit(&ApiResponse::from_result(manager.list_jobs(status, limit).await))
        }
        JobsCommand::Show { id } => emit(&ApiResponse::from_result(manager.get_job(&id).await)),
        JobsCommand::Cancel { id } => {
            let result = manager.cancel_job(caller, &id).await;
            emit(&action_response(
                &id,
                "cancel",
                result,
                "job already finished",
            ))
        }
        JobsCommand::Retry { id } => {
            let result = manager.retry_job(caller, &id).await;
            emit(&action_response(
                &id,
                "retry",
                result,
                "job is not failed or has no retries left",
            ))
        }
        JobsCommand::ForWorkspace { workspace_id } => emit(&ApiResponse::from_result(
            manager.get_jobs_for_workspace(&workspace_id).await,
        )),
    }
}

async fn serve(app: &App) -> bool {
    let interrupt = match interrupt_token() {
        Ok(token) => token,
        Err(e) => return fail(ApiStatus::Internal, e),
    };

    let recovered = match app.manager.start().await {
        Ok(n) => n,
        Err(e) => return emit(&ApiResponse::<()>::from_error(&e)),
    };
    info!(
        recovered,
        workers = app.config.max_concurrent_jobs,
        "Serving indexing jobs, press Ctrl-C to stop"
    );

    interrupt.cancelled().await;
    app.manager.shutdown().await;
    emit(&ApiResponse::ok("stopped"))
}
