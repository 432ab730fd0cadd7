//! docvault-worker: runs the background processing pools, or pushes local
//! files through intake.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use docvault::config::{default_config_path, load_config};
use docvault::intake::{IntakePolicy, UploadedFile};
use docvault::processor::ProcessorRegistry;
use docvault::service::{UploadError, VaultService};
use docvault::worker::crossbeam_channel::bounded;
use log::{error, info};

#[derive(Parser)]
#[command(name = "docvault-worker", version, about = "docvault background processing")]
struct Cli {
    /// Config file (defaults to $DOCVAULT_CONFIG or ~/.docvault/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start every worker pool and the stalled-job watchdog until Ctrl-C
    Run,
    /// Validate and queue local files, printing the upload response
    Ingest {
        /// Files to ingest
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Let valid files through even when others in the batch are rejected
        #[arg(long)]
        lenient: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config_path = match cli.config.map(Ok).unwrap_or_else(default_config_path) {
        Ok(path) => path,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    let config = match load_config(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {}: {}", config_path.display(), e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = docvault::telemetry::init(&config.logging) {
        eprintln!("{}", e);
        return ExitCode::FAILURE;
    }
    info!("Starting docvault-worker v{}", env!("CARGO_PKG_VERSION"));

    let processors = ProcessorRegistry::from_config(&config);
    let service = match VaultService::open(config) {
        Ok(service) => service,
        Err(e) => {
            error!("Failed to open storage: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Commands::Run => run(&service, &processors),
        Commands::Ingest { files, lenient } => ingest(&service, files, lenient),
    }
}

fn run(service: &VaultService, processors: &ProcessorRegistry) -> ExitCode {
    let (stop_tx, stop_rx) = bounded::<()>(1);
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    }) {
        error!("Failed to install Ctrl-C handler: {}", e);
        return ExitCode::FAILURE;
    }

    let workers = match service.start_workers(processors) {
        Ok(workers) => workers,
        Err(e) => {
            error!("Failed to start workers: {}", e);
            return ExitCode::FAILURE;
        }
    };
    info!("Workers running, press Ctrl-C to stop");

    loop {
        if stop_rx.recv_timeout(Duration::from_millis(500)).is_ok() {
            break;
        }
        for pool in workers.pools() {
            while let Some(result) = pool.try_recv_result() {
                info!(
                    "{} job {} (document {}): {:?}",
                    result.category, result.job_id, result.document_id, result.outcome
                );
            }
        }
    }

    info!("Stopping workers...");
    workers.shutdown();
    workers.wait();
    ExitCode::SUCCESS
}

fn ingest(service: &VaultService, paths: Vec<PathBuf>, lenient: bool) -> ExitCode {
    let mut files = Vec::with_capacity(paths.len());
    for path in &paths {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to read {}: {}", path.display(), e);
                return ExitCode::FAILURE;
            }
        };
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        let claimed = mime_guess::from_path(path).first_raw();
        files.push(UploadedFile::new(name, claimed, bytes));
    }

    let policy = if lenient {
        IntakePolicy::lenient()
    } else {
        IntakePolicy::strict()
    };

    let (body, code) = match service.upload(files, &policy) {
        Ok(response) => (serde_json::to_string_pretty(&response), ExitCode::SUCCESS),
        Err(UploadError::Rejected { rejected }) => (
            serde_json::to_string_pretty(&serde_json::json!({ "rejected": rejected })),
            ExitCode::from(2),
        ),
        Err(e) => {
            error!("Upload failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match body {
        Ok(json) => {
            println!("{}", json);
            code
        }
        Err(e) => {
            error!("Failed to encode response: {}", e);
            ExitCode::FAILURE
        }
    }
}
