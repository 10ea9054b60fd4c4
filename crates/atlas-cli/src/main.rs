//! Atlas CLI
//!
//! Entry point for the `atlas` command-line tool. Every command prints JSON
//! on stdout; logs go to stderr.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{info, warn};

use atlas::config::apply_env_overrides;
use atlas::{init_tracing, load_settings, JobProgressEvent, Service, Settings, Upload, WorkerPool};

#[derive(Parser)]
#[command(name = "atlas")]
#[command(about = "Photogrammetry reconstruction job engine", version)]
struct Cli {
    /// Settings file (JSON); built-in defaults when omitted
    #[arg(long, short = 'c', global = true, env = "ATLAS_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stage images and queue a reconstruction job
    Submit {
        /// Input photographs
        #[arg(required = true)]
        images: Vec<PathBuf>,

        /// Job options as a JSON object
        #[arg(long, conflicts_with = "options_file")]
        options: Option<String>,

        /// Read job options from a file
        #[arg(long)]
        options_file: Option<PathBuf>,
    },

    /// Show the status record of a job
    Status { job_id: String },

    /// List every known job, oldest first
    List,

    /// Copy the model of a completed job
    Fetch {
        job_id: String,

        /// Destination file (default: atlas-<job_id>.glb in the current directory)
        #[arg(long, short = 'o')]
        out: Option<PathBuf>,
    },

    /// Remove a job's workspace, model and status record
    Delete { job_id: String },

    /// Remove expired workspaces of finished jobs
    Sweep,

    /// Run background workers until interrupted
    Worker {
        /// Number of workers (default: worker.count from settings)
        #[arg(long, short = 'w')]
        workers: Option<usize>,

        /// Also print every progress event
        #[arg(long)]
        events: bool,
    },
}

#[derive(Serialize)]
struct Fetched<'a> {
    job_id: &'a str,
    path: &'a Path,
    size_bytes: u64,
}

#[derive(Serialize)]
struct Deleted<'a> {
    job_id: &'a str,
    deleted: bool,
}

#[derive(Serialize)]
struct Swept {
    swept: Vec<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let settings = settings(cli.config.as_deref())?;
    init_tracing(&settings.logging).context("Failed to initialize logging")?;
    let service = Service::open(settings).context("Failed to open storage")?;

    match cli.command {
        Commands::Submit {
            images,
            options,
            options_file,
        } => run_submit(&service, &images, options, options_file),
        Commands::Status { job_id } => print_pretty(&service.status(&job_id)?),
        Commands::List => print_pretty(&service.list()?),
        Commands::Fetch { job_id, out } => run_fetch(&service, &job_id, out),
        Commands::Delete { job_id } => {
            service.delete(&job_id)?;
            print_pretty(&Deleted {
                job_id: &job_id,
                deleted: true,
            })
        }
        Commands::Sweep => print_pretty(&Swept {
            swept: service.sweep(Utc::now())?,
        }),
        Commands::Worker { workers, events } => run_worker(&service, workers, events),
    }
}

fn settings(config: Option<&Path>) -> anyhow::Result<Settings> {
    let mut settings = match config {
        Some(path) => load_settings(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => Settings::default(),
    };
    apply_env_overrides(&mut settings).context("Invalid environment override")?;
    Ok(settings)
}

fn run_submit(
    service: &Service,
    images: &[PathBuf],
    options: Option<String>,
    options_file: Option<PathBuf>,
) -> anyhow::Result<()> {
    let raw_options = match (options, options_file) {
        (Some(raw), _) => raw,
        (None, Some(path)) => std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read options from {}", path.display()))?,
        (None, None) => String::new(),
    };

    let uploads = images
        .iter()
        .map(|path| {
            Upload::from_path(path).with_context(|| format!("Failed to open {}", path.display()))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let receipt = service.submit(uploads, &raw_options)?;
    print_pretty(&receipt)
}

fn run_fetch(service: &Service, job_id: &str, out: Option<PathBuf>) -> anyhow::Result<()> {
    let handle = service.artifact(job_id)?;
    let out = out.unwrap_or_else(|| PathBuf::from(&handle.file_name));
    if out.is_dir() {
        bail!("{} is a directory", out.display());
    }

    let size_bytes = std::fs::copy(&handle.path, &out)
        .with_context(|| format!("Failed to write {}", out.display()))?;
    print_pretty(&Fetched {
        job_id,
        path: &out,
        size_bytes,
    })
}

fn run_worker(service: &Service, workers: Option<usize>, events: bool) -> anyhow::Result<()> {
    let mut progress = events.then(|| service.subscribe());
    let pool = service
        .start_workers(workers)
        .context("Failed to start workers")?;
    install_interrupt_handler(&pool)?;
    info!(workers = pool.worker_count(), "Workers running, press Ctrl-C to stop");

    loop {
        if let Some(report) = pool.recv_report_timeout(Duration::from_millis(200)) {
            print_line(&report)?;
        }
        if let Some(rx) = progress.as_mut() {
            drain_events(rx)?;
        }
        if pool.is_shutdown() && pool.has_stopped() {
            break;
        }
    }

    while let Some(report) = pool.try_recv_report() {
        print_line(&report)?;
    }
    if let Some(rx) = progress.as_mut() {
        drain_events(rx)?;
    }
    pool.wait();
    Ok(())
}

/// First interrupt stops claiming; the second also cancels running jobs.
fn install_interrupt_handler(pool: &WorkerPool) -> anyhow::Result<()> {
    let control = pool.control();
    let interrupts = AtomicUsize::new(0);

    ctrlc::set_handler(move || match interrupts.fetch_add(1, Ordering::SeqCst) {
        0 => {
            eprintln!("\nReceived interrupt, finishing running jobs...");
            control.shutdown();
        }
        1 => {
            eprintln!("\nReceived second interrupt, abandoning running jobs...");
            control.abort();
        }
        _ => {}
    })
    .context("Failed to install interrupt handler")
}

fn drain_events(rx: &mut broadcast::Receiver<JobProgressEvent>) -> anyhow::Result<()> {
    loop {
        match rx.try_recv() {
            Ok(event) => print_line(&event)?,
            Err(TryRecvError::Lagged(skipped)) => {
                warn!(skipped, "Progress events dropped");
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return Ok(()),
        }
    }
}

fn print_pretty<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_line<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}
