pub mod attributes;
pub mod backup;
pub mod collaborators;
pub mod control;
pub mod dir_lock;
pub mod error;
pub mod installation;
pub mod orchestrator;
pub mod prereq;
pub mod progress;
pub mod verifier;

pub use backup::BackupRelocationManager;
pub use collaborators::{
    ChunkCache, ChunkCacheStats, DownloadRecord, Downloader, FileConstructor, InstallBackend,
    PhaseContext,
};
pub use control::{ControlState, RunState};
pub use error::{ErrorCategory, ErrorState, InstallError};
pub use installation::{average_download_speed, DownloadSummary};
pub use orchestrator::{BuildInstaller, InstallController, InstallOutcome, InstallerHandle, InstallerSnapshot};
pub use progress::{InstallStage, ProgressTracker};

use crate::manifest::BuildManifest;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

/// Zero-byte sentinel in the install directory: staged files were already
/// relocated by an earlier attempt
pub const RESUME_MARKER_NAME: &str = "$movedMarker";

/// Downloaded and recycled chunks, under the staging root
pub const DATA_STAGING_DIR: &str = "PatchData";

/// Fully constructed files waiting to be moved, under the staging root
pub const INSTALL_STAGING_DIR: &str = "Install";

/// One installation of a target build, optionally over an existing build
#[derive(Debug)]
pub struct InstallJob {
    pub id: Uuid,
    pub current_manifest: Option<Arc<BuildManifest>>,
    pub target_manifest: Arc<BuildManifest>,
    pub install_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub data_staging_dir: PathBuf,
    pub install_staging_dir: PathBuf,
    /// Current and target builds are identical: re-verify and re-fetch only
    pub is_repair: bool,
}

impl InstallJob {
    pub fn new(
        current_manifest: Option<BuildManifest>,
        target_manifest: BuildManifest,
        install_dir: impl Into<PathBuf>,
        staging_dir: impl Into<PathBuf>,
    ) -> Self {
        let install_dir = install_dir.into();
        let staging_dir = staging_dir.into();
        let is_repair = current_manifest
            .as_ref()
            .map_or(false, |current| current.is_same_as(&target_manifest));

        Self {
            id: Uuid::new_v4(),
            current_manifest: current_manifest.map(Arc::new),
            target_manifest: Arc::new(target_manifest),
            data_staging_dir: staging_dir.join(DATA_STAGING_DIR),
            install_staging_dir: staging_dir.join(INSTALL_STAGING_DIR),
            install_dir,
            staging_dir,
            is_repair,
        }
    }

    pub fn resume_marker(&self) -> PathBuf {
        self.install_dir.join(RESUME_MARKER_NAME)
    }

    pub fn is_first_install(&self) -> bool {
        self.current_manifest.is_none()
    }

    pub fn current(&self) -> Option<&BuildManifest> {
        self.current_manifest.as_deref()
    }

    pub fn installed_path(&self, filename: &str) -> PathBuf {
        self.install_dir.join(filename)
    }

    pub fn staged_path(&self, filename: &str) -> PathBuf {
        self.install_staging_dir.join(filename)
    }

}

/// Counters and timings for one run. Times are seconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildStats {
    pub app_name: String,
    pub app_patch_version: String,
    pub app_installed_version: String,
    pub cloud_directory: String,
    pub num_files_in_build: u64,
    pub num_files_outdated: u64,
    pub num_files_to_remove: u64,
    pub num_chunks_required: u64,
    pub chunks_queued_for_download: u64,
    pub chunks_locally_available: u64,
    pub num_chunks_downloaded: u64,
    pub num_chunks_recycled: u64,
    pub num_chunks_cache_booted: u64,
    pub num_drive_cache_chunk_loads: u64,
    pub num_recycle_failures: u64,
    pub num_drive_cache_load_failures: u64,
    pub total_downloaded_data: u64,
    /// Bytes per second, over non-overlapping download time
    pub average_download_speed: f64,
    pub theoretical_download_time: f64,
    pub verify_time: f64,
    pub clean_up_time: f64,
    pub prereq_time: f64,
    pub process_execute_time: f64,
    pub process_paused_time: f64,
    pub num_attempts: u32,
    pub process_success: bool,
    pub failure_reason: String,
    pub failure_category: Option<ErrorCategory>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InstallerState {
    Initializing,
    Installing,
    BackingUp,
    SettingAttributes,
    Verifying,
    Retrying,
    PrereqInstall,
    Done,
}

// Shared state handed to the worker thread and to status queries
pub type SharedJob = Arc<InstallJob>;
pub type SharedErrors = Arc<ErrorState>;
pub type SharedProgress = Arc<ProgressTracker>;
pub type SharedControl = Arc<ControlState>;
