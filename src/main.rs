use anyhow::{bail, Context, Result};
use axum::Router;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use build_patcher::api;
use build_patcher::install::{BuildInstaller, InstallController, InstallJob, InstallOutcome};
use build_patcher::local::{package_build, LocalBackend, MANIFEST_FILE_NAME};
use build_patcher::manifest::BuildManifest;
use build_patcher::utils::{self, config::Config};

#[derive(Parser)]
#[command(name = "build-patcher", version, about = "Install, patch and verify application builds")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Install or patch a build from a cloud directory
    Install {
        /// Directory holding the chunks of the target build
        #[arg(long)]
        cloud_dir: PathBuf,

        #[arg(long)]
        install_dir: PathBuf,

        /// Target manifest, defaults to <cloud-dir>/manifest.json
        #[arg(long)]
        target: Option<PathBuf>,

        /// Manifest of the build currently installed; written on success
        #[arg(long)]
        installed_manifest: Option<PathBuf>,

        /// Defaults to <install-dir>/Staging
        #[arg(long)]
        staging_dir: Option<PathBuf>,

        #[arg(long)]
        backup_dir: Option<PathBuf>,

        /// Serve the status API on this port while installing
        #[arg(long)]
        status_port: Option<u16>,
    },

    /// Check an install directory against a manifest
    Verify {
        #[arg(long)]
        manifest: PathBuf,

        #[arg(long)]
        install_dir: PathBuf,
    },

    /// Chunk a build directory into a cloud directory and write its manifest
    Package {
        #[arg(long)]
        build_dir: PathBuf,

        #[arg(long)]
        cloud_dir: PathBuf,

        #[arg(long)]
        app: String,

        #[arg(long)]
        build_version: String,

        #[arg(long)]
        chunk_size: Option<usize>,

        /// Prerequisite installer, relative to the install directory
        #[arg(long)]
        prereq_path: Option<String>,

        #[arg(long, default_value = "")]
        prereq_args: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    utils::logging::init_tracing();
    let config = Config::load()?;
    let cli = Cli::parse();

    info!("build-patcher v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Install {
            cloud_dir,
            install_dir,
            target,
            installed_manifest,
            staging_dir,
            backup_dir,
            status_port,
        } => {
            let mut config = config;
            if backup_dir.is_some() {
                config.backup_dir = backup_dir;
            }
            if status_port.is_some() {
                config.status_port = status_port;
            }

            let target_path = target.unwrap_or_else(|| cloud_dir.join(MANIFEST_FILE_NAME));
            let target = BuildManifest::load(&target_path)?;
            let current = match installed_manifest.as_ref() {
                Some(path) if path.exists() => Some(BuildManifest::load(path)?),
                _ => None,
            };
            let staging_dir = staging_dir.unwrap_or_else(|| install_dir.join("Staging"));

            run_install(config, cloud_dir, InstallJob::new(current, target, install_dir, staging_dir), installed_manifest).await
        }
        Command::Verify { manifest, install_dir } => {
            let manifest = BuildManifest::load(&manifest)?;
            let outcome = tokio::task::spawn_blocking(move || {
                manifest.verify_against_directory(&install_dir, &mut |_| {}, &|| false, &|| false)
            })
            .await?;

            if outcome.success() {
                info!("All files verified");
                Ok(())
            } else {
                for file in &outcome.corrupt_files {
                    error!("Corrupt or missing: {}", file);
                }
                bail!("{} file(s) failed verification", outcome.corrupt_files.len())
            }
        }
        Command::Package {
            build_dir,
            cloud_dir,
            app,
            build_version,
            chunk_size,
            prereq_path,
            prereq_args,
        } => {
            let chunk_size = chunk_size.unwrap_or(config.chunk_size);
            let manifest = tokio::task::spawn_blocking({
                let cloud_dir = cloud_dir.clone();
                move || package_build(&build_dir, &cloud_dir, &app, &build_version, chunk_size)
            })
            .await??;
            let manifest = match prereq_path {
                Some(path) => manifest.with_prerequisite(path, prereq_args),
                None => manifest,
            };

            let path = cloud_dir.join(MANIFEST_FILE_NAME);
            manifest.save(&path)?;
            info!("Wrote {}", path.display());
            Ok(())
        }
    }
}

async fn run_install(
    config: Config,
    cloud_dir: PathBuf,
    job: InstallJob,
    installed_manifest: Option<PathBuf>,
) -> Result<()> {
    let backend = Arc::new(LocalBackend::new(cloud_dir, config.download_workers));
    let status_port = config.status_port;
    let installer = BuildInstaller::new(job, config, backend);
    let controller = installer.controller();

    if let Some(port) = status_port {
        tokio::spawn(serve_status(controller.clone(), port));
    }

    let cancel_controller = controller.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling installation");
            cancel_controller.cancel();
        }
    });

    let handle = installer.start(move |outcome: InstallOutcome| {
        if !outcome.success {
            return;
        }
        if let Some(path) = installed_manifest {
            match outcome.manifest.save(&path) {
                Ok(()) => info!("Recorded installed build in {}", path.display()),
                Err(e) => error!("Failed to record installed build: {:#}", e),
            }
        }
    })?;

    let outcome = tokio::task::spawn_blocking(move || handle.wait())
        .await
        .context("Installer thread failed")?;

    if outcome.success {
        info!(
            "Installed {} {} in {}",
            outcome.manifest.app_name,
            outcome.manifest.version,
            humantime::format_duration(std::time::Duration::from_secs(outcome.stats.process_execute_time as u64))
        );
        Ok(())
    } else {
        bail!("Installation failed: {}", outcome.stats.failure_reason)
    }
}

async fn serve_status(controller: InstallController, port: u16) {
    let app = Router::new()
        .nest("/api", api::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(controller);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind status API on {}: {}", addr, e);
            return;
        }
    };
    info!("Status API listening on http://{}", addr);
    if let Err(e) = axum::serve(listener, app).await {
        error!("Status API stopped: {}", e);
    }
}
