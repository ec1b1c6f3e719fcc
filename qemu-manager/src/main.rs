mod cli;
mod config;
mod console;
mod error;
mod registry;
mod storage;
mod vm;
mod web;

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::registry::{Registry, StateFileRegistry};
use crate::storage::{AttachmentTracker, DiskCatalog, IsoCatalog, QemuImg};
use crate::vm::supervisor::{ProcessSupervisor, QemuSupervisor};
use crate::vm::VmManager;

#[derive(Parser)]
#[command(name = "qemu-manager", about = "QEMU virtual machine manager with a WebSocket VNC relay")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API and console relay.
    Serve {
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Verify prerequisites before running 'serve'. Exits 0 if all pass.
    Check {
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Show VMs and catalogs from the state file (no daemon needed).
    Status {
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Check { config: config_path } => {
            let config = Config::resolve(config_path.as_deref())?;
            cli::run_check(&config)?;
        }
        Commands::Status { config: config_path } => {
            let config = Config::resolve(config_path.as_deref())?;
            cli::run_status(&config)?;
        }
        Commands::Serve { config: config_path } => {
            let config = Arc::new(Config::resolve(config_path.as_deref())?);
            // Held for the whole serve duration.
            let _lock_file = acquire_instance_lock(&config.server.state_file)?;
            tracing::info!("qemu-manager starting with config: {:?}", config);
            serve(config).await?;
        }
    }

    Ok(())
}

/// Take an exclusive flock next to the state file so two daemons never
/// share one registry.
fn acquire_instance_lock(state_file: &Path) -> Result<File> {
    use std::os::unix::io::AsRawFd;

    let lock_path = state_file
        .parent()
        .map(|p| p.join("qemu-manager.lock"))
        .unwrap_or_else(|| PathBuf::from("/var/lib/qemu-manager/qemu-manager.lock"));
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let lock_file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)
        .context("failed to open instance lock file")?;
    let result = unsafe { libc::flock(lock_file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result != 0 {
        anyhow::bail!(
            "Another qemu-manager instance is already using {}.\n\
             Stop the other instance first, or check: qemu-manager status",
            state_file.display()
        );
    }
    Ok(lock_file)
}

async fn serve(config: Arc<Config>) -> Result<()> {
    for dir in [&config.storage.disks_dir, &config.storage.isos_dir] {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating storage directory {}", dir.display()))?;
    }
    if let Some(dir) = &config.vm.log_dir {
        if let Err(e) = std::fs::create_dir_all(dir) {
            tracing::warn!(dir = %dir.display(), error = %e, "cannot create VM log directory");
        }
    }

    let registry: Arc<dyn Registry> = Arc::new(StateFileRegistry::open(&config.server.state_file).await?);
    let supervisor: Arc<dyn ProcessSupervisor> = Arc::new(QemuSupervisor::new(config.supervisor_config()));
    let vm_manager = Arc::new(VmManager::new(
        config.vm_manager_config(),
        Arc::clone(&registry),
        supervisor,
    ));

    match vm_manager.reconcile().await {
        Ok(report) => tracing::info!(
            stopped = report.stopped,
            adopted = report.adopted,
            "reconciled persisted VMs"
        ),
        Err(e) => tracing::warn!(error = %e, "startup reconciliation failed"),
    }

    let attachments = Arc::new(AttachmentTracker::new(Arc::clone(&registry), vm_manager.locks()));
    let disks = Arc::new(DiskCatalog::new(
        Arc::clone(&registry),
        Arc::new(QemuImg::new(config.storage.qemu_img_binary.clone())),
        config.storage.disks_dir.clone(),
        config.storage.default_disk_size_gb,
    ));
    let isos = Arc::new(IsoCatalog::new(Arc::clone(&registry), config.storage.isos_dir.clone()));

    if config.storage.scan_on_startup {
        match disks.scan().await {
            Ok(n) => tracing::info!(registered = n, dir = %disks.dir().display(), "scanned disk directory"),
            Err(e) => tracing::warn!(error = %e, "disk directory scan failed"),
        }
        match isos.scan().await {
            Ok(n) => tracing::info!(registered = n, dir = %isos.dir().display(), "scanned ISO directory"),
            Err(e) => tracing::warn!(error = %e, "ISO directory scan failed"),
        }
    }

    let state = Arc::new(web::AppState {
        vm_manager: Arc::clone(&vm_manager),
        attachments,
        disks,
        isos,
        config: Arc::clone(&config),
    });

    tracing::info!("qemu-manager ready");
    let serve_result = web::serve(state, shutdown_signal()).await;

    // Cleanup runs regardless of how the server exited.
    if config.server.stop_vms_on_shutdown {
        let stopped = vm_manager.shutdown_all().await;
        tracing::info!(stopped, "stopped running VMs");
    }
    tracing::info!("qemu-manager shut down");

    serve_result
}

async fn shutdown_signal() {
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to register SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, initiating shutdown");
        }
        _ = sigterm => {
            tracing::info!("received SIGTERM, initiating shutdown");
        }
    }
}
