use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use jobstore_lite::clock::SystemClock;
use jobstore_lite::config::{open_store, ServerConfig, SqliteConfig, StoreConfig};
use jobstore_lite::dashboard::run_dashboard;
use jobstore_lite::models::{Job, JobSpec, JobStateType};
use jobstore_lite::shutdown::install_shutdown_handler;
use jobstore_lite::store::{
    JobCondition, JobHistoryFilter, JobQuery, JobSortField, JobStore, UpdateJobStateRequest,
};

#[derive(Parser, Debug)]
#[command(name = "jobstore-lite")]
#[command(version)]
#[command(about = "Job and execution state store with optimistic concurrency")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Serve the job store over HTTP
    Serve(ServeArgs),

    /// Job commands run directly against a store
    Job {
        #[command(flatten)]
        store: StoreArgs,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,

        #[command(subcommand)]
        command: JobCommands,
    },
}

// =============================================================================
// Shared Arguments
// =============================================================================

#[derive(clap::Args, Debug)]
struct StoreArgs {
    /// SQLite database file
    #[arg(long, default_value = "jobstore.db")]
    db: PathBuf,

    /// Use a throwaway in-memory store instead of --db
    #[arg(long)]
    memory: bool,

    /// Maximum SQLite pool connections
    #[arg(long, default_value = "5")]
    max_connections: u32,
}

impl StoreArgs {
    fn config(&self) -> StoreConfig {
        if self.memory {
            StoreConfig::in_memory()
        } else {
            StoreConfig::sqlite(
                SqliteConfig::file(&self.db).with_max_connections(self.max_connections),
            )
        }
    }
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    #[command(flatten)]
    store: StoreArgs,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Job Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Submit a new job
    Submit {
        /// Client submitting the job
        #[arg(long, default_value = "cli")]
        client_id: String,

        /// Execution engine
        #[arg(long, default_value = "docker")]
        engine: String,

        /// Timeout in seconds (0 = none)
        #[arg(long, default_value = "0")]
        timeout: u64,

        /// Number of nodes that should run the job
        #[arg(long, default_value = "1")]
        concurrency: u32,

        /// Annotation tag (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Explicit job ID instead of a generated one
        #[arg(long)]
        id: Option<String>,

        /// Entrypoint and arguments
        #[arg(last = true)]
        entrypoint: Vec<String>,
    },
    /// Show a job's specification
    Get {
        /// Job ID or short ID
        job_id: String,
    },
    /// List jobs
    List {
        /// Only jobs from this client
        #[arg(long)]
        client_id: Option<String>,

        /// Jobs from every client
        #[arg(long)]
        all: bool,

        #[arg(long = "include-tag")]
        include_tags: Vec<String>,

        #[arg(long = "exclude-tag")]
        exclude_tags: Vec<String>,

        /// Sort field: id or created_at
        #[arg(long)]
        sort_by: Option<JobSortField>,

        #[arg(long)]
        reverse: bool,

        /// Maximum jobs to show (0 = all)
        #[arg(long, default_value = "0")]
        limit: usize,

        #[arg(long, default_value = "0")]
        offset: usize,
    },
    /// Show a job's current state and executions
    State {
        /// Job ID or short ID
        job_id: String,
    },
    /// Move a job to a new state
    SetState {
        /// Full job ID
        job_id: String,

        /// Target state (e.g. queued, cancelled)
        state: JobStateType,

        /// Fail unless the job is at this version
        #[arg(long)]
        expected_version: Option<u64>,

        #[arg(long, default_value = "")]
        comment: String,
    },
    /// Show a job's history
    History {
        /// Job ID or short ID
        job_id: String,

        /// Only entries at or after this RFC 3339 time
        #[arg(long)]
        since: Option<chrono::DateTime<chrono::Utc>>,

        #[arg(long)]
        exclude_job_level: bool,

        #[arg(long)]
        exclude_execution_level: bool,
    },
    /// List jobs that have not reached a terminal state
    InProgress,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobListOutput {
    jobs: Vec<Job>,
    total_count: usize,
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = ServerConfig::new(args.listen).with_store(args.store.config());
    let shutdown = install_shutdown_handler()?;

    tracing::info!(
        listen_addr = %config.listen_addr,
        backend = %config.store.backend,
        "Starting jobstore-lite server"
    );

    let store = open_store(&config.store, Arc::new(SystemClock)).await?;
    let in_progress = store.get_in_progress_jobs().await?;
    tracing::info!(count = in_progress.len(), "Recovered in-progress jobs");

    run_dashboard(config.listen_addr, store.clone(), shutdown).await?;
    store.close().await?;
    Ok(())
}

// =============================================================================
// Job Command Handlers
// =============================================================================

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_job_table(jobs: &[Job]) {
    println!(
        "{:<38} {:<12} {:<10} {:<25} TAGS",
        "JOB ID", "CLIENT", "ENGINE", "CREATED"
    );
    println!("{}", "-".repeat(95));
    for job in jobs {
        println!(
            "{:<38} {:<12} {:<10} {:<25} {}",
            job.id,
            job.client_id,
            job.spec.engine,
            job.created_at.format("%Y-%m-%d %H:%M:%S%.3f"),
            job.spec.annotations.join(",")
        );
    }
}

async fn handle_job_command(
    store: &dyn JobStore,
    command: JobCommands,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        JobCommands::Submit {
            client_id,
            engine,
            timeout,
            concurrency,
            tags,
            id,
            entrypoint,
        } => {
            let spec = JobSpec {
                engine,
                entrypoint,
                concurrency,
                timeout_secs: timeout,
                annotations: tags,
            };
            let job = match id {
                Some(id) => Job::with_id(id, client_id, spec),
                None => Job::new(client_id, spec),
            };
            let job = store.create_job(job).await?;
            match output {
                OutputFormat::Json => print_json(&job)?,
                OutputFormat::Table => {
                    println!("Job submitted successfully!");
                    println!("Job ID: {} ({})", job.id, job.short_id());
                }
            }
        }
        JobCommands::Get { job_id } => {
            let job = store.get_job(&job_id).await?;
            match output {
                OutputFormat::Json => print_json(&job)?,
                OutputFormat::Table => {
                    println!("Job ID:      {}", job.id);
                    println!("Client:      {}", job.client_id);
                    println!("Engine:      {}", job.spec.engine);
                    println!("Entrypoint:  {}", job.spec.entrypoint.join(" "));
                    println!("Concurrency: {}", job.spec.concurrency);
                    println!("Timeout:     {}s", job.spec.timeout_secs);
                    println!("Tags:        {}", job.spec.annotations.join(","));
                    println!("Created:     {}", job.created_at.to_rfc3339());
                }
            }
        }
        JobCommands::List {
            client_id,
            all,
            include_tags,
            exclude_tags,
            sort_by,
            reverse,
            limit,
            offset,
        } => {
            let query = JobQuery {
                id: None,
                client_id,
                include_tags,
                exclude_tags,
                limit,
                offset,
                return_all: all,
                sort_by,
                sort_reverse: reverse,
            };
            let jobs = store.get_jobs(&query).await?;
            let total_count = store.get_jobs_count(&query).await?;
            match output {
                OutputFormat::Json => print_json(&JobListOutput { jobs, total_count })?,
                OutputFormat::Table => {
                    if jobs.is_empty() {
                        println!("No jobs found.");
                    } else {
                        print_job_table(&jobs);
                        println!();
                        println!("Showing {} of {} jobs", jobs.len(), total_count);
                    }
                }
            }
        }
        JobCommands::State { job_id } => {
            let state = store.get_job_state(&job_id).await?;
            match output {
                OutputFormat::Json => print_json(&state)?,
                OutputFormat::Table => {
                    println!("Job ID:   {}", state.job_id);
                    println!("State:    {} (was {})", state.state, state.previous_state);
                    println!("Version:  {}", state.version);
                    println!("Updated:  {}", state.update_time.to_rfc3339());
                    match state.timeout_at {
                        Some(at) => println!("Timeout:  {}", at.to_rfc3339()),
                        None => println!("Timeout:  -"),
                    }
                    println!();
                    if state.executions.is_empty() {
                        println!("No executions.");
                    } else {
                        println!("{:<20} {:<38} {:<22} VERSION", "NODE", "EXECUTION", "STATE");
                        println!("{}", "-".repeat(90));
                        for exec in &state.executions {
                            println!(
                                "{:<20} {:<38} {:<22} {}",
                                exec.id.node_id, exec.id.execution_id, exec.state, exec.version
                            );
                        }
                    }
                }
            }
        }
        JobCommands::SetState {
            job_id,
            state,
            expected_version,
            comment,
        } => {
            let mut condition = JobCondition::new();
            if let Some(version) = expected_version {
                condition = condition.expect_version(version);
            }
            let request = UpdateJobStateRequest::new(&job_id, state)
                .with_condition(condition)
                .with_comment(comment);
            let version = store.update_job_state(request).await?;
            match output {
                OutputFormat::Json => print_json(&serde_json::json!({
                    "job_id": job_id,
                    "state": state,
                    "version": version,
                }))?,
                OutputFormat::Table => {
                    println!("Job {} is now {} (version {})", job_id, state, version)
                }
            }
        }
        JobCommands::History {
            job_id,
            since,
            exclude_job_level,
            exclude_execution_level,
        } => {
            let filter = JobHistoryFilter {
                since,
                exclude_job_level,
                exclude_execution_level,
            };
            let history = store.get_job_history(&job_id, &filter).await?;
            match output {
                OutputFormat::Json => print_json(&history)?,
                OutputFormat::Table => {
                    println!(
                        "{:<30} {:<10} {:<40} {:<8} COMMENT",
                        "TIME", "LEVEL", "TRANSITION", "VERSION"
                    );
                    println!("{}", "-".repeat(100));
                    for entry in &history {
                        let transition = match (&entry.job_state, &entry.execution_state) {
                            (Some(change), _) => format!("{} -> {}", change.previous, change.new),
                            (None, Some(change)) => format!(
                                "{}: {} -> {}",
                                entry.node_id.as_deref().unwrap_or("-"),
                                change.previous,
                                change.new
                            ),
                            (None, None) => "-".to_string(),
                        };
                        println!(
                            "{:<30} {:<10} {:<40} {:<8} {}",
                            entry.time.to_rfc3339(),
                            entry.history_type,
                            transition,
                            entry.new_version,
                            entry.comment
                        );
                    }
                }
            }
        }
        JobCommands::InProgress => {
            let jobs = store.get_in_progress_jobs().await?;
            match output {
                OutputFormat::Json => print_json(&jobs)?,
                OutputFormat::Table => {
                    if jobs.is_empty() {
                        println!("No jobs in progress.");
                    } else {
                        println!("{:<38} {:<14} {:<8} EXECUTIONS", "JOB ID", "STATE", "VERSION");
                        println!("{}", "-".repeat(72));
                        for info in &jobs {
                            println!(
                                "{:<38} {:<14} {:<8} {}",
                                info.job.id,
                                info.state.state,
                                info.state.version,
                                info.state.executions.len()
                            );
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Serve(serve_args) => {
            run_server(serve_args).await?;
        }
        Commands::Job {
            store,
            output,
            command,
        } => {
            let store = open_store(&store.config(), Arc::new(SystemClock)).await?;
            let result = handle_job_command(store.as_ref(), command, &output).await;
            store.close().await?;
            result?;
        }
    }

    Ok(())
}
