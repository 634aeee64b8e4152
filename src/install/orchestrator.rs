use super::attributes::FileAttributeApplier;
use super::backup::{remove_file_if_exists, BackupRelocationManager};
use super::prereq::{PrereqOutcome, PrerequisiteRunner};
use super::verifier::{VerificationEngine, VerifyReport};
use super::{
    BuildStats, ControlState, Downloader, ErrorCategory, ErrorState, InstallBackend, InstallError,
    InstallJob, InstallStage, InstallerState, PhaseContext, ProgressTracker,
};
use crate::manifest::BuildManifest;
use crate::utils::config::Config;
use crate::utils::log_buffer::{LogBuffer, LogEntry};
use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver};
use parking_lot::Mutex;
use serde::Serialize;
use std::fs;
use std::ops::Deref;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Progress weight of the prerequisites stage when the build has one
const PREREQ_STAGE_WEIGHT: f32 = 0.06;

/// Final result handed to the completion callback
#[derive(Debug, Clone)]
pub struct InstallOutcome {
    pub success: bool,
    pub manifest: Arc<BuildManifest>,
    pub stats: BuildStats,
}

/// Mutable run status read by status queries. Every critical section is short.
#[derive(Debug, Default)]
pub(crate) struct InstallerStatus {
    pub stats: BuildStats,
    pub running: bool,
    pub inited: bool,
    pub complete: bool,
    pub state: Option<InstallerState>,
    pub download_speed: f64,
    pub download_bytes_left: u64,
    pub initial_download_size: u64,
    pub paused_at: Option<Instant>,
    pub time_paused: Duration,
}

pub(crate) struct InstallerCore {
    pub ctx: PhaseContext,
    pub config: Arc<Config>,
    pub backend: Arc<dyn InstallBackend>,
    pub backup: BackupRelocationManager,
    pub status: Mutex<InstallerStatus>,
    pub active_downloader: Mutex<Option<Arc<dyn Downloader>>>,
    pub log_buffer: LogBuffer,
}

/// Point-in-time view of an installer for status surfaces
#[derive(Debug, Clone, Serialize)]
pub struct InstallerSnapshot {
    pub id: Uuid,
    pub app_name: String,
    pub version: String,
    pub state: Option<InstallerState>,
    pub stage: Option<InstallStage>,
    pub progress: f32,
    pub paused: bool,
    pub running: bool,
    pub complete: bool,
    pub has_error: bool,
    pub cancelled: bool,
    pub error: String,
    pub error_category: Option<ErrorCategory>,
    /// Bytes per second, -1 when not downloading
    pub download_speed: f64,
    pub download_bytes_left: u64,
    pub initial_download_size: u64,
    pub stats: BuildStats,
}

/// Cheap cloneable handle for status queries and pause/cancel.
/// Safe to use from any thread while the installer runs.
#[derive(Clone)]
pub struct InstallController {
    core: Arc<InstallerCore>,
}

impl InstallController {
    pub fn id(&self) -> Uuid {
        self.core.ctx.job.id
    }

    pub fn is_complete(&self) -> bool {
        self.core.status.lock().complete
    }

    /// A fatal error other than user cancellation
    pub fn has_error(&self) -> bool {
        let errors = &self.core.ctx.errors;
        errors.has_fatal() && !errors.is_cancelled()
    }

    pub fn is_paused(&self) -> bool {
        self.core.ctx.control.is_paused()
    }

    pub fn progress(&self) -> f32 {
        self.core.ctx.progress.progress()
    }

    pub fn stage_progress(&self, stage: InstallStage) -> f32 {
        self.core.ctx.progress.stage_progress(stage)
    }

    pub fn stats(&self) -> BuildStats {
        self.core.status.lock().stats.clone()
    }

    /// Files moved into the install directory by the latest attempt
    pub fn files_installed(&self) -> Vec<String> {
        self.core.backup.files_installed()
    }

    pub fn logs(&self, limit: Option<usize>) -> Vec<LogEntry> {
        self.core.log_buffer.get_logs(limit)
    }

    /// Pause or resume. Refused while a fatal error is pending.
    /// Returns whether the installer is now paused.
    pub fn toggle_pause(&self) -> bool {
        let ctx = &self.core.ctx;
        if ctx.errors.has_fatal() {
            return ctx.control.is_paused();
        }

        let mut status = self.core.status.lock();
        let paused = ctx.control.toggle_pause();
        if paused {
            status.paused_at = Some(Instant::now());
            info!("Installation paused");
        } else if let Some(paused_at) = status.paused_at.take() {
            status.time_paused += paused_at.elapsed();
            info!("Installation resumed");
        }
        paused
    }

    /// Cancel the run. Aborts in-flight downloads and releases any pause.
    pub fn cancel(&self) {
        let core = &self.core;
        info!("Cancelling installation {}", core.ctx.job.id);
        core.ctx.errors.set_fatal(InstallError::UserCancelled);
        {
            let mut status = core.status.lock();
            core.ctx.control.cancel();
            if let Some(paused_at) = status.paused_at.take() {
                status.time_paused += paused_at.elapsed();
            }
        }
        if let Some(downloader) = core.active_downloader.lock().as_ref() {
            downloader.abort();
        }
        core.log_buffer.add_log("warn", "Installation cancelled", None);
    }

    pub fn snapshot(&self) -> InstallerSnapshot {
        let core = &self.core;
        let errors = &core.ctx.errors;
        let job = &core.ctx.job;
        let status = core.status.lock();
        InstallerSnapshot {
            id: job.id,
            app_name: job.target_manifest.app_name.clone(),
            version: job.target_manifest.version.clone(),
            state: status.state,
            stage: core.ctx.progress.current_stage(),
            progress: core.ctx.progress.progress(),
            paused: core.ctx.control.is_paused(),
            running: status.running,
            complete: status.complete,
            has_error: errors.has_fatal() && !errors.is_cancelled(),
            cancelled: errors.is_cancelled(),
            error: errors.error_string(),
            error_category: errors.category(),
            download_speed: status.download_speed,
            download_bytes_left: status.download_bytes_left,
            initial_download_size: status.initial_download_size,
            stats: status.stats.clone(),
        }
    }
}

/// Owns one installation job until it is started
pub struct BuildInstaller {
    core: Arc<InstallerCore>,
}

impl BuildInstaller {
    pub fn new(job: InstallJob, config: Config, backend: Arc<dyn InstallBackend>) -> Self {
        let job = Arc::new(job);
        let backup = BackupRelocationManager::new(
            job.clone(),
            config.backup_dir.clone(),
            config.move_retries,
            config.move_retry_delay(),
        );
        let log_buffer = LogBuffer::new(config.log_buffer_size);
        let core = InstallerCore {
            ctx: PhaseContext {
                job,
                errors: Arc::new(ErrorState::new()),
                progress: Arc::new(ProgressTracker::new()),
                control: Arc::new(ControlState::new()),
            },
            config: Arc::new(config),
            backend,
            backup,
            status: Mutex::new(InstallerStatus {
                download_speed: -1.0,
                ..Default::default()
            }),
            active_downloader: Mutex::new(None),
            log_buffer,
        };
        Self { core: Arc::new(core) }
    }

    pub fn controller(&self) -> InstallController {
        InstallController {
            core: self.core.clone(),
        }
    }

    /// Begin the installation on a dedicated worker thread.
    ///
    /// `on_complete` is not called by the worker; it runs on whichever thread
    /// calls [`InstallerHandle::dispatch_completion`] or [`InstallerHandle::wait`].
    pub fn start<F>(self, on_complete: F) -> Result<InstallerHandle>
    where
        F: FnOnce(InstallOutcome) + Send + 'static,
    {
        let job = &self.core.ctx.job;
        fs::create_dir_all(&job.install_dir).with_context(|| {
            format!("Failed to create install directory {}", job.install_dir.display())
        })?;

        let (tx, rx) = bounded(1);
        let core = self.core.clone();
        let thread = thread::Builder::new()
            .name(format!("installer-{}", &job.id.to_string()[..8]))
            .spawn(move || {
                let outcome = core.run();
                let _ = tx.send(outcome);
            })
            .context("Failed to spawn installer thread")?;

        Ok(InstallerHandle {
            controller: self.controller(),
            completion: rx,
            callback: Some(Box::new(on_complete)),
            thread: Some(thread),
            outcome: None,
        })
    }
}

/// A running installation
pub struct InstallerHandle {
    controller: InstallController,
    completion: Receiver<InstallOutcome>,
    callback: Option<Box<dyn FnOnce(InstallOutcome) + Send>>,
    thread: Option<JoinHandle<()>>,
    outcome: Option<InstallOutcome>,
}

impl Deref for InstallerHandle {
    type Target = InstallController;

    fn deref(&self) -> &Self::Target {
        &self.controller
    }
}

impl InstallerHandle {
    pub fn controller(&self) -> InstallController {
        self.controller.clone()
    }

    /// Run the completion callback on this thread if the worker has finished.
    /// Returns true once the callback has been dispatched.
    pub fn dispatch_completion(&mut self) -> bool {
        if self.outcome.is_none() {
            match self.completion.try_recv() {
                Ok(outcome) => self.outcome = Some(outcome),
                Err(_) => return false,
            }
        }
        if let (Some(callback), Some(outcome)) = (self.callback.take(), self.outcome.as_ref()) {
            callback(outcome.clone());
        }
        true
    }

    /// Block until the worker finishes, dispatch the callback if it has not
    /// run yet, and return the outcome
    pub fn wait(mut self) -> InstallOutcome {
        let outcome = match self.outcome.take() {
            Some(outcome) => outcome,
            None => match self.completion.recv() {
                Ok(outcome) => outcome,
                Err(_) => {
                    error!("Installer thread exited without reporting an outcome");
                    self.controller.core.abandoned_outcome()
                }
            },
        };
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        if let Some(callback) = self.callback.take() {
            callback(outcome.clone());
        }
        outcome
    }
}

impl InstallerCore {
    fn set_state(&self, state: InstallerState) {
        self.status.lock().state = Some(state);
    }

    fn log_event(&self, level: &str, message: String, attempt: Option<u32>) {
        self.log_buffer.add_log(level, message, attempt);
    }

    fn needs_prerequisites(&self) -> bool {
        let job = &self.ctx.job;
        job.is_first_install() && !job.target_manifest.prereq_path.is_empty()
    }

    /// Clear per-attempt error state without losing a pending cancellation
    fn reset_errors(&self) {
        self.ctx.errors.reset();
        if self.ctx.control.is_cancelling() {
            self.ctx.errors.set_fatal(InstallError::UserCancelled);
        }
    }

    fn abandoned_outcome(&self) -> InstallOutcome {
        let mut stats = self.status.lock().stats.clone();
        stats.process_success = false;
        InstallOutcome {
            success: false,
            manifest: self.ctx.job.target_manifest.clone(),
            stats,
        }
    }

    /// The whole state machine; runs on the worker thread
    pub(crate) fn run(&self) -> InstallOutcome {
        let started = Instant::now();
        let job = self.ctx.job.clone();
        let target = &job.target_manifest;

        {
            let mut status = self.status.lock();
            status.running = true;
            status.state = Some(InstallerState::Initializing);
            let stats = &mut status.stats;
            stats.app_name = target.app_name.clone();
            stats.app_patch_version = target.version.clone();
            stats.app_installed_version = job
                .current()
                .map(|m| m.version.clone())
                .unwrap_or_else(|| "NONE".to_string());
            stats.cloud_directory = self.backend.cloud_directory();
        }
        self.reset_errors();
        info!(
            "Installing {} {} into {}{}",
            target.app_name,
            target.version,
            job.install_dir.display(),
            if job.is_repair { " (repair)" } else { "" }
        );
        self.log_event("info", format!("Installing {} {}", target.app_name, target.version), None);

        if let Some(current) = job.current() {
            self.backend.register_installation(current, &job.install_dir);
        }

        let progress = &self.ctx.progress;
        if job.is_repair {
            for stage in [InstallStage::Downloading, InstallStage::Installing, InstallStage::MovingToInstall] {
                progress.set_stage_progress(stage, 1.0);
            }
        }
        if self.needs_prerequisites() {
            progress.set_stage_weight(InstallStage::PrerequisitesInstall, PREREQ_STAGE_WEIGHT);
        }
        self.status.lock().inited = true;

        let max_attempts = self.config.install_retries.max(1);
        let mut required_files: Vec<String> = Vec::new();
        let mut success = false;

        for attempt in 1..=max_attempts {
            self.reset_errors();
            self.backup.clear_files_installed();
            self.status.lock().stats.num_attempts = attempt;
            info!("Installation attempt {} of {}", attempt, max_attempts);
            self.log_event("info", format!("Attempt {} started", attempt), Some(attempt));

            self.set_state(InstallerState::Installing);
            let mut attempt_ok = self.run_installation(std::mem::take(&mut required_files));

            if attempt_ok {
                self.set_state(InstallerState::BackingUp);
                let (moved, report) = self.backup.relocate_staged_files(&self.ctx);
                self.log_event(
                    if moved { "info" } else { "error" },
                    format!("Moved {} file(s), removed {}", report.files_moved, report.files_removed),
                    Some(attempt),
                );
                attempt_ok = moved;
            }

            if attempt_ok {
                self.set_state(InstallerState::SettingAttributes);
                FileAttributeApplier::new(job.clone()).apply(&self.ctx, job.is_repair);
            }

            // Runs even after a failed phase so the retry sees every bad file
            self.set_state(InstallerState::Verifying);
            let report = self.run_verification();
            attempt_ok = attempt_ok && report.success && !self.ctx.errors.has_fatal();

            if attempt_ok {
                self.log_event("info", format!("Attempt {} succeeded", attempt), Some(attempt));
                self.clean_up();
                success = true;
                break;
            }

            let reason = self.ctx.errors.error_string();
            self.log_event("error", format!("Attempt {} failed: {}", attempt, reason), Some(attempt));

            if self.ctx.errors.is_cancelled() || self.ctx.control.is_cancelling() {
                info!("Installation cancelled, not retrying");
                break;
            }
            if self.ctx.errors.is_no_retry() {
                warn!("Error is not retryable: {}", reason);
                break;
            }
            if attempt == max_attempts {
                break;
            }

            self.set_state(InstallerState::Retrying);
            if let Err(e) = remove_file_if_exists(&job.resume_marker()) {
                warn!("Failed to remove resume marker: {}", e);
            }
            required_files = report.corrupt_files;
            info!("Retrying with {} file(s) to repair", required_files.len());
        }

        if success && self.needs_prerequisites() {
            self.set_state(InstallerState::PrereqInstall);
            success = self.run_prerequisites();
        }

        self.finish(started, success)
    }

    fn run_verification(&self) -> VerifyReport {
        let report = VerificationEngine::new(&self.ctx, &self.backup).verify();
        let mut status = self.status.lock();
        status.stats.verify_time += report.elapsed.as_secs_f64();
        report
    }

    fn clean_up(&self) {
        let job = &self.ctx.job;
        let started = Instant::now();
        if job.staging_dir.exists() {
            if let Err(e) = fs::remove_dir_all(&job.staging_dir) {
                warn!("Failed to remove staging directory {}: {}", job.staging_dir.display(), e);
            }
        }
        if let Err(e) = remove_file_if_exists(&job.resume_marker()) {
            warn!("Failed to remove resume marker: {}", e);
        }
        self.ctx.progress.set_stage_progress(InstallStage::CleanUp, 1.0);
        self.status.lock().stats.clean_up_time += started.elapsed().as_secs_f64();
    }

    fn run_prerequisites(&self) -> bool {
        let started = Instant::now();
        let runner = PrerequisiteRunner::new(self.config.prereq_restart_code);
        let result = runner.run(&self.ctx.job);
        self.status.lock().stats.prereq_time = started.elapsed().as_secs_f64();

        match result {
            Ok(outcome) => {
                let note = match outcome {
                    PrereqOutcome::Installed => "Prerequisites installed",
                    PrereqOutcome::RestartRequired => "Prerequisites installed, restart required",
                };
                self.log_event("info", note.to_string(), None);
                self.ctx.progress.set_stage_progress(InstallStage::PrerequisitesInstall, 1.0);
                true
            }
            Err(e) => {
                self.log_event("error", e.to_string(), None);
                self.ctx.errors.set_fatal(e);
                false
            }
        }
    }

    fn finish(&self, started: Instant, success: bool) -> InstallOutcome {
        let errors = &self.ctx.errors;
        let stats = {
            let mut status = self.status.lock();
            if let Some(paused_at) = status.paused_at.take() {
                status.time_paused += paused_at.elapsed();
            }
            let paused = status.time_paused;
            let stats = &mut status.stats;
            stats.process_paused_time = paused.as_secs_f64();
            stats.process_execute_time = started.elapsed().saturating_sub(paused).as_secs_f64();
            stats.process_success = success;
            stats.failure_reason = if success { String::new() } else { errors.error_string() };
            stats.failure_category = if success { None } else { errors.category() };
            status.download_speed = -1.0;
            status.state = Some(InstallerState::Done);
            status.running = false;
            status.complete = true;
            status.stats.clone()
        };

        log_build_stats(&stats);
        if success {
            self.log_event("info", "Installation complete".to_string(), None);
        } else {
            self.log_event("error", format!("Installation failed: {}", stats.failure_reason), None);
        }

        InstallOutcome {
            success,
            manifest: self.ctx.job.target_manifest.clone(),
            stats,
        }
    }
}

fn log_build_stats(stats: &BuildStats) {
    let secs = |value: f64| humantime::format_duration(Duration::from_millis((value * 1000.0) as u64)).to_string();
    info!("Build Stat: AppName: {}", stats.app_name);
    info!("Build Stat: AppInstalledVersion: {}", stats.app_installed_version);
    info!("Build Stat: AppPatchVersion: {}", stats.app_patch_version);
    info!("Build Stat: CloudDirectory: {}", stats.cloud_directory);
    info!("Build Stat: NumFilesInBuild: {}", stats.num_files_in_build);
    info!("Build Stat: NumFilesOutdated: {}", stats.num_files_outdated);
    info!("Build Stat: NumFilesToRemove: {}", stats.num_files_to_remove);
    info!("Build Stat: NumChunksRequired: {}", stats.num_chunks_required);
    info!("Build Stat: ChunksQueuedForDownload: {}", stats.chunks_queued_for_download);
    info!("Build Stat: ChunksLocallyAvailable: {}", stats.chunks_locally_available);
    info!("Build Stat: NumChunksDownloaded: {}", stats.num_chunks_downloaded);
    info!("Build Stat: NumChunksRecycled: {}", stats.num_chunks_recycled);
    info!("Build Stat: NumChunksCacheBooted: {}", stats.num_chunks_cache_booted);
    info!("Build Stat: NumDriveCacheChunkLoads: {}", stats.num_drive_cache_chunk_loads);
    info!("Build Stat: NumRecycleFailures: {}", stats.num_recycle_failures);
    info!("Build Stat: NumDriveCacheLoadFailures: {}", stats.num_drive_cache_load_failures);
    info!("Build Stat: TotalDownloadedData: {} bytes", stats.total_downloaded_data);
    info!("Build Stat: AverageDownloadSpeed: {:.1} bytes/s", stats.average_download_speed);
    info!("Build Stat: TheoreticalDownloadTime: {}", secs(stats.theoretical_download_time));
    info!("Build Stat: VerifyTime: {}", secs(stats.verify_time));
    info!("Build Stat: CleanUpTime: {}", secs(stats.clean_up_time));
    info!("Build Stat: PrereqTime: {}", secs(stats.prereq_time));
    info!("Build Stat: ProcessExecuteTime: {}", secs(stats.process_execute_time));
    info!("Build Stat: ProcessPausedTime: {}", secs(stats.process_paused_time));
    info!("Build Stat: NumAttempts: {}", stats.num_attempts);
    info!("Build Stat: ProcessSuccess: {}", stats.process_success);
    info!("Build Stat: FailureReason: {}", stats.failure_reason);
}
