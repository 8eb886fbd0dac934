use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use deal_scheduler::config::AppConfig;
use deal_scheduler::deals::DevnetNegotiator;
use deal_scheduler::scheduler::{ContentId, Job, JobId, JobState, Scheduler, StorageConfig};
use deal_scheduler::selector::build_selector;
use deal_scheduler::shutdown::install_shutdown_handler;
use deal_scheduler::store::{FileDatastore, JobStore};

const STORE_DIR: &str = "jobs.db";

#[derive(Parser, Debug)]
#[command(name = "deal-scheduler")]
#[command(version)]
#[command(about = "Crash-resumable storage deal scheduler")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Resume unfinished jobs, submit new content, and run until all jobs finish
    Run(RunArgs),

    /// Inspect or cancel persisted jobs
    Jobs {
        #[command(flatten)]
        store: StoreArgs,

        #[command(subcommand)]
        command: JobCommands,
    },
}

// =============================================================================
// Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct RunArgs {
    /// JSON configuration file
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Override the configured data directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Override the maximum number of concurrently executing jobs
    #[arg(long)]
    max_parallel: Option<usize>,

    /// Successful deals required per job
    #[arg(long, default_value = "1")]
    rep_factor: usize,

    /// Trusted miner addresses, in priority order (comma-separated)
    #[arg(long, value_delimiter = ',')]
    trusted: Vec<String>,

    /// Excluded miner addresses (comma-separated)
    #[arg(long, value_delimiter = ',')]
    excluded: Vec<String>,

    /// Maximum epoch price; 0 means unbounded
    #[arg(long, default_value = "0")]
    max_price: u64,

    /// Content sizes for the devnet negotiator, as "cid=bytes" (comma-separated)
    #[arg(long, value_delimiter = ',')]
    content_size: Vec<String>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,

    /// Content ids to store
    content: Vec<String>,
}

#[derive(Parser, Debug)]
struct StoreArgs {
    /// Data directory holding the job store
    #[arg(long, default_value = "./deal-scheduler-data")]
    data_dir: PathBuf,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// List jobs, oldest first
    List {
        /// Only jobs in this state (queued, executing, success, failed, canceled)
        #[arg(long)]
        state: Option<JobState>,
    },
    /// Show one job
    Status {
        /// The job ID (UUID)
        job_id: JobId,
    },
    /// Cancel a job that no running scheduler is driving
    Cancel {
        /// The job ID (UUID)
        job_id: JobId,
    },
}

// =============================================================================
// Output
// =============================================================================

#[derive(Serialize)]
struct JobListOutput<'a> {
    jobs: &'a [Job],
    total_count: usize,
}

fn print_jobs(jobs: &[Job], output: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match output {
        OutputFormat::Json => {
            let out = JobListOutput {
                jobs,
                total_count: jobs.len(),
            };
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Table => {
            if jobs.is_empty() {
                println!("No jobs found.");
                return Ok(());
            }
            println!("{:<38} {:<10} {:<6} CONTENT", "JOB ID", "STATE", "DEALS");
            println!("{}", "-".repeat(78));
            for job in jobs {
                let content = job.content_id.as_str();
                let content = if content.chars().count() > 20 {
                    format!("{}...", content.chars().take(17).collect::<String>())
                } else {
                    content.to_string()
                };
                println!(
                    "{:<38} {:<10} {:<6} {}",
                    job.id,
                    job.state.as_str().to_uppercase(),
                    format!("{}/{}", job.deals.len(), job.storage_config.rep_factor),
                    content
                );
            }
            println!();
            println!("{} jobs", jobs.len());
        }
    }
    Ok(())
}

fn print_job(job: &Job, output: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(job)?),
        OutputFormat::Table => {
            println!("Job ID:      {}", job.id);
            println!("Content:     {}", job.content_id);
            println!("State:       {}", job.state.as_str().to_uppercase());
            println!("Rep factor:  {}", job.storage_config.rep_factor);
            println!("Created:     {}", job.created_at);
            println!("Updated:     {}", job.updated_at);
            if let Some(cause) = &job.err_cause {
                println!("Error:       {}", cause);
            }
            if !job.deals.is_empty() {
                println!("Deals:");
                for deal in &job.deals {
                    println!("  {} {} @ {}", deal.miner, deal.proposal_cid, deal.epoch_price);
                }
            }
            if !job.deal_errors.is_empty() {
                println!("Deal errors:");
                for de in &job.deal_errors {
                    let proposal = de.proposal_cid.as_deref().unwrap_or("<undefined>");
                    println!("  {} {}: {}", de.miner, proposal, de.message);
                }
            }
        }
    }
    Ok(())
}

fn open_store(data_dir: &Path) -> Result<JobStore, Box<dyn std::error::Error>> {
    let ds = FileDatastore::open(data_dir.join(STORE_DIR))?;
    Ok(JobStore::new(Arc::new(ds)))
}

fn parse_content_sizes(raw: &[String]) -> Result<Vec<(ContentId, u64)>, String> {
    raw.iter()
        .map(|entry| {
            let (cid, size) = entry
                .split_once('=')
                .ok_or_else(|| format!("invalid content size {:?}, expected cid=bytes", entry))?;
            let size: u64 = size
                .parse()
                .map_err(|_| format!("invalid size in {:?}", entry))?;
            Ok((ContentId::new(cid.trim()), size))
        })
        .collect()
}

// =============================================================================
// Run
// =============================================================================

async fn run(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(max_parallel) = args.max_parallel {
        config.scheduler.max_parallel = max_parallel;
    }

    let peers = config.network.bootstrap_peers()?;
    tracing::info!(
        network = %config.network.network,
        bootstrappers = peers.len(),
        data_dir = %config.data_dir.display(),
        miners = config.selector.pool_size(),
        "Starting deal-scheduler"
    );

    let store = open_store(&config.data_dir)?;
    let selector = build_selector(&config.selector);
    let negotiator = Arc::new(DevnetNegotiator::new(config.devnet.clone()));
    for (cid, size) in parse_content_sizes(&args.content_size)? {
        negotiator.register_content(cid, size);
    }
    let scheduler = Scheduler::new(config.scheduler.clone(), store, selector, negotiator)?;

    let shutdown = install_shutdown_handler();
    let mut updates = scheduler.watch();
    let runner = scheduler.clone();
    let run_shutdown = shutdown.clone();
    let handle = tokio::spawn(async move { runner.run(run_shutdown).await });

    let storage_config = StorageConfig {
        rep_factor: args.rep_factor,
        trusted_miners: args.trusted,
        excluded_miners: args.excluded.into_iter().collect(),
        max_price: args.max_price,
        ..StorageConfig::default()
    };
    for content in args.content {
        let id = scheduler
            .submit(ContentId::new(content), storage_config.clone())
            .await?;
        tracing::debug!(job_id = %id, "Queued");
    }

    loop {
        let unfinished = scheduler.list_jobs(Some(JobState::Queued))?.len()
            + scheduler.list_jobs(Some(JobState::Executing))?.len();
        if unfinished == 0 {
            break;
        }
        tokio::select! {
            _ = shutdown.cancelled() => break,
            update = updates.recv() => match update {
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
        }
    }

    scheduler.shutdown();
    handle.await?;
    print_jobs(&scheduler.list_jobs(None)?, &args.output)?;
    Ok(())
}

// =============================================================================
// Job Commands
// =============================================================================

async fn handle_jobs(store_args: StoreArgs, command: JobCommands) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(&store_args.data_dir)?;
    match command {
        JobCommands::List { state } => {
            let jobs = match state {
                Some(state) => store.list_by_state(state, None)?,
                None => store.list_all()?,
            };
            print_jobs(&jobs, &store_args.output)?;
        }
        JobCommands::Status { job_id } => {
            let job = store
                .get(&job_id)?
                .ok_or_else(|| format!("Job not found: {}", job_id))?;
            print_job(&job, &store_args.output)?;
        }
        JobCommands::Cancel { job_id } => {
            // Nothing runs here, so every unfinished job is canceled directly.
            let scheduler = Scheduler::new(
                Default::default(),
                store,
                build_selector(&Default::default()),
                Arc::new(DevnetNegotiator::default()),
            )?;
            scheduler.cancel(&job_id).await?;
            print_job(&scheduler.status(&job_id)?, &store_args.output)?;
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
        .init();

    let args = Args::parse();
    match args.command {
        Commands::Run(run_args) => run(run_args).await?,
        Commands::Jobs { store, command } => handle_jobs(store, command).await?,
    }
    Ok(())
}
