use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use repo_sentry::config::Config;
use repo_sentry::engine::{self, EngineConfig};
use repo_sentry::manager::{WorkerConfig, WorkerManager};
use repo_sentry::queue::{JobQueue, QueueConfig};
use repo_sentry::registry::{RegistryConfig, ScanRegistry};
use repo_sentry::service::{self, ScanService, StartScanOutcome};
use repo_sentry::types::ScanStatus;

#[derive(Parser)]
#[command(name = "repo-sentry")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Asynchronous repository vulnerability scanner", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue a scan and wait for the result
    Scan {
        /// Repository URL (https://github.com/<owner>/<repo>)
        repo_url: String,
    },

    /// Check that the external clone and scan tools are available
    Doctor,

    /// Engine entrypoint, spawned by the orchestrator for each job
    #[command(hide = true)]
    Worker {
        /// Unix socket to dial back to the orchestrator
        #[arg(long)]
        socket: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Scan { repo_url } => {
            init_tracing("info");
            run_scan(&repo_url).await
        }
        Commands::Doctor => {
            init_tracing("warn");
            run_doctor().await
        }
        Commands::Worker { socket } => {
            // Worker stderr lands in the orchestrator's 4 KiB ring; keep it
            // quiet so a crash fingerprint is never scrolled out.
            init_tracing("warn");
            run_worker(&socket).await
        }
    }
}

fn init_tracing(default_level: &str) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// One-shot façade: validate, wire the core, queue a single scan, poll the
/// registry until the record is terminal, print it.
async fn run_scan(repo_url: &str) -> Result<()> {
    let url = service::validate_repo_url(repo_url).context("invalid repository URL")?;
    let config = Config::from_env();

    println!("🛡️  repo-sentry v{}", env!("CARGO_PKG_VERSION"));
    println!(
        "   Queue: {} pending max, {} concurrent",
        config.queue_max_size, config.queue_max_concurrent
    );
    println!("   Worker timeout: {}s", config.worker_timeout.as_secs());
    println!("   Memory usage: {}KB", self_memory_kb());
    println!();

    let registry = Arc::new(ScanRegistry::new(RegistryConfig {
        max_entries: config.registry_max_entries,
        max_vulns_per_scan: config.registry_max_vulns_per_scan,
    }));
    let queue = Arc::new(JobQueue::new(QueueConfig {
        max_queued: config.queue_max_size,
        max_concurrent: config.queue_max_concurrent,
    }));
    let manager = Arc::new(WorkerManager::new(
        WorkerConfig::from_config(&config)?,
        Arc::clone(&registry),
        Arc::clone(&queue),
    ));
    let service = ScanService::new(registry, queue, manager, config.retry_after);

    let scan_id = match service.start_scan(url.as_str())? {
        StartScanOutcome::Queued { scan_id } => scan_id,
        StartScanOutcome::Rejected { retry_after, .. } => {
            println!("⚠️  Queue is full — retry in {}s", retry_after.as_secs());
            std::process::exit(1);
        }
    };
    println!("🔍 Scan {scan_id} queued");

    let mut last_status = ScanStatus::Queued;
    let view = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!();
                println!("⚠️  Interrupted — draining workers...");
                service.shutdown(config.shutdown_grace).await;
                std::process::exit(130);
            }
            _ = sleep(Duration::from_millis(500)) => {}
        }

        let Some(view) = service.get_scan(&scan_id) else {
            anyhow::bail!("scan record was evicted while waiting");
        };
        if view.status != last_status {
            println!("   {} → {}", last_status, view.status);
            last_status = view.status;
        }
        if view.status.is_terminal() {
            break view;
        }
    };

    println!();
    println!("{}", serde_json::to_string_pretty(&view)?);

    service.shutdown(config.shutdown_grace).await;
    if view.status == ScanStatus::Failed {
        std::process::exit(1);
    }
    Ok(())
}

/// Preflight: both external tools must resolve on PATH for real scans.
async fn run_doctor() -> Result<()> {
    println!("🩺 repo-sentry doctor");

    let mut all_ok = true;
    let tools: [(&str, &str); 2] = [
        ("git", "install git to clone repositories"),
        ("trivy", "Is trivy installed? See https://trivy.dev"),
    ];
    for (bin, hint) in tools {
        match tokio::process::Command::new(bin)
            .arg("--version")
            .output()
            .await
        {
            Ok(output) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout);
                println!("✅ {} ({})", bin, version.lines().next().unwrap_or("").trim());
            }
            _ => {
                println!("❌ {bin} not found on PATH — {hint}");
                all_ok = false;
            }
        }
    }

    if !all_ok {
        std::process::exit(1);
    }
    Ok(())
}

async fn run_worker(socket: &Path) -> Result<()> {
    let config = Config::from_env();
    engine::run_worker(socket, EngineConfig::from_config(&config)).await
}

/// Resident memory of this process, for the startup banner.
fn self_memory_kb() -> u64 {
    use sysinfo::{Pid, System};

    let own_pid = Pid::from_u32(std::process::id());
    let mut system = System::new();
    system.refresh_process(own_pid);
    system
        .process(own_pid)
        .map(|process| process.memory() / 1024)
        .unwrap_or(0)
}
