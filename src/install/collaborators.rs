//! Contracts for the pieces the installer drives but does not implement:
//! chunk transport, chunk sourcing and byte-level file reconstruction.

use super::{InstallError, SharedControl, SharedErrors, SharedJob, SharedProgress};
use crate::manifest::{BuildManifest, ChunkId};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

/// One completed chunk transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DownloadRecord {
    pub start: Instant,
    pub end: Instant,
    pub bytes: u64,
}

pub trait Downloader: Send + Sync {
    fn add_chunks_to_download(&self, chunks: &[ChunkId]);

    /// No further chunks will be queued; the downloader completes once drained
    fn notify_no_more_chunks_to_add(&self);

    fn is_complete(&self) -> bool;

    fn num_bytes_left(&self) -> u64;

    /// Bytes received since the previous call
    fn byte_download_count_reset(&self) -> u64;

    fn download_records(&self) -> Vec<DownloadRecord>;

    /// Stop in-flight and queued transfers
    fn abort(&self);
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ChunkCacheStats {
    pub num_files_to_construct: u64,
    pub num_required_chunks: u64,
    pub num_chunks_to_download: u64,
    pub num_chunks_to_recycle: u64,
    pub num_chunks_locally_available: u64,
    pub total_chunk_download_size: u64,
    pub num_chunks_downloaded: u64,
    pub num_chunks_recycled: u64,
    pub num_chunks_cache_booted: u64,
    pub num_drive_cache_chunk_loads: u64,
    pub num_recycle_failures: u64,
    pub num_drive_cache_load_failures: u64,
}

pub trait ChunkCache: Send + Sync {
    fn stats(&self) -> ChunkCacheStats;

    /// True once at least one chunk had to be requested from the downloader
    fn have_downloads_started(&self) -> bool;

    /// Bytes of a chunk, blocking until it is available or the attempt fails
    fn chunk_data(&self, id: &ChunkId) -> Result<Vec<u8>, InstallError>;

    fn shutdown(&self);
}

pub trait FileConstructor: Send {
    fn is_complete(&self) -> bool;

    fn wait(self: Box<Self>);
}

/// What every phase and collaborator of one installer shares
#[derive(Clone)]
pub struct PhaseContext {
    pub job: SharedJob,
    pub errors: SharedErrors,
    pub progress: SharedProgress,
    pub control: SharedControl,
}

impl PhaseContext {
    /// True when the running attempt must unwind
    pub fn should_stop(&self) -> bool {
        self.errors.has_fatal() || self.control.is_cancelling()
    }
}

/// Factory for the collaborators of one attempt
pub trait InstallBackend: Send + Sync {
    /// Make an existing installation available for chunk recycling
    fn register_installation(&self, _manifest: &BuildManifest, _install_dir: &Path) {}

    /// Where chunks come from, for reporting
    fn cloud_directory(&self) -> String {
        String::new()
    }

    fn create_downloader(&self, ctx: &PhaseContext) -> Result<Arc<dyn Downloader>, InstallError>;

    /// Decide how each required chunk is sourced and queue downloads
    fn init_chunk_cache(
        &self,
        ctx: &PhaseContext,
        files_to_construct: &[String],
        downloader: Arc<dyn Downloader>,
    ) -> Result<Arc<dyn ChunkCache>, InstallError>;

    fn start_file_constructor(
        &self,
        ctx: &PhaseContext,
        files_to_construct: &[String],
        cache: Arc<dyn ChunkCache>,
    ) -> Result<Box<dyn FileConstructor>, InstallError>;
}
