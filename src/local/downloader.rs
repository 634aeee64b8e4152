use crate::install::{DownloadRecord, Downloader, InstallError, InstallStage, PhaseContext};
use crate::manifest::ChunkId;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{debug, warn};

#[derive(Debug)]
enum WorkItem {
    Chunk(ChunkId),
    Shutdown,
}

struct DownloadState {
    ctx: PhaseContext,
    cloud_dir: PathBuf,
    queued_bytes: AtomicU64,
    downloaded_bytes: AtomicU64,
    bytes_since_reset: AtomicU64,
    active_workers: AtomicUsize,
    no_more_chunks: AtomicBool,
    aborted: AtomicBool,
    records: Mutex<Vec<DownloadRecord>>,
}

impl DownloadState {
    fn transfer(&self, id: &ChunkId) -> Result<(), InstallError> {
        let file_name = id.file_name();
        let destination = self.ctx.job.data_staging_dir.join(&file_name);
        let start = Instant::now();

        let data = fs::read(self.cloud_dir.join(&file_name))
            .map_err(|e| InstallError::Download(format!("chunk {}: {}", id, e)))?;
        if ChunkId::for_data(&data) != *id {
            return Err(InstallError::Download(format!("chunk {} failed its hash check", id)));
        }

        let partial = destination.with_extension("part");
        fs::write(&partial, &data)
            .and_then(|_| fs::rename(&partial, &destination))
            .map_err(|e| InstallError::Download(format!("cannot stage chunk {}: {}", id, e)))?;

        let bytes = data.len() as u64;
        self.records.lock().push(DownloadRecord {
            start,
            end: Instant::now(),
            bytes,
        });
        self.bytes_since_reset.fetch_add(bytes, Ordering::AcqRel);
        let downloaded = self.downloaded_bytes.fetch_add(bytes, Ordering::AcqRel) + bytes;
        let queued = self.queued_bytes.load(Ordering::Acquire).max(1);
        self.ctx
            .progress
            .set_stage_progress(InstallStage::Downloading, downloaded as f32 / queued as f32);
        Ok(())
    }
}

/// Copies chunks from a cloud directory into data staging with a small
/// worker pool. Each transfer is hash checked and written atomically.
pub struct LocalDownloader {
    state: Arc<DownloadState>,
    work_sender: Sender<WorkItem>,
    num_workers: usize,
}

impl LocalDownloader {
    pub fn new(ctx: PhaseContext, cloud_dir: &Path, num_workers: usize) -> Result<Self, InstallError> {
        let num_workers = num_workers.max(1);
        let (work_sender, work_receiver) = unbounded();
        let state = Arc::new(DownloadState {
            ctx,
            cloud_dir: cloud_dir.to_path_buf(),
            queued_bytes: AtomicU64::new(0),
            downloaded_bytes: AtomicU64::new(0),
            bytes_since_reset: AtomicU64::new(0),
            active_workers: AtomicUsize::new(num_workers),
            no_more_chunks: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            records: Mutex::new(Vec::new()),
        });

        for worker_id in 0..num_workers {
            let worker_state = state.clone();
            let receiver = work_receiver.clone();
            thread::Builder::new()
                .name(format!("chunk-download-{}", worker_id))
                .spawn(move || Self::worker_loop(worker_id, worker_state, receiver))
                .map_err(|e| InstallError::Initialization(format!("cannot start download worker: {}", e)))?;
        }

        Ok(Self {
            state,
            work_sender,
            num_workers,
        })
    }

    fn worker_loop(worker_id: usize, state: Arc<DownloadState>, receiver: Receiver<WorkItem>) {
        debug!("Download worker {} started", worker_id);
        for item in receiver.iter() {
            match item {
                WorkItem::Shutdown => break,
                WorkItem::Chunk(id) => {
                    if state.aborted.load(Ordering::Acquire) {
                        continue;
                    }
                    if let Err(e) = state.transfer(&id) {
                        warn!("Download of {} failed: {}", id, e);
                        state.ctx.errors.set_fatal(e);
                    }
                }
            }
        }
        state.active_workers.fetch_sub(1, Ordering::AcqRel);
        debug!("Download worker {} stopped", worker_id);
    }

    fn shutdown_workers(&self) {
        if !self.state.no_more_chunks.swap(true, Ordering::AcqRel) {
            for _ in 0..self.num_workers {
                let _ = self.work_sender.send(WorkItem::Shutdown);
            }
        }
    }
}

impl Downloader for LocalDownloader {
    fn add_chunks_to_download(&self, chunks: &[ChunkId]) {
        let manifest = &self.state.ctx.job.target_manifest;
        for id in chunks {
            let size = manifest.chunk_size(id).unwrap_or(0);
            self.state.queued_bytes.fetch_add(size, Ordering::AcqRel);
            if self.work_sender.send(WorkItem::Chunk(*id)).is_err() {
                warn!("Download queue closed, dropping chunk {}", id);
            }
        }
    }

    fn notify_no_more_chunks_to_add(&self) {
        self.shutdown_workers();
    }

    fn is_complete(&self) -> bool {
        self.state.no_more_chunks.load(Ordering::Acquire)
            && self.state.active_workers.load(Ordering::Acquire) == 0
    }

    fn num_bytes_left(&self) -> u64 {
        let queued = self.state.queued_bytes.load(Ordering::Acquire);
        queued.saturating_sub(self.state.downloaded_bytes.load(Ordering::Acquire))
    }

    fn byte_download_count_reset(&self) -> u64 {
        self.state.bytes_since_reset.swap(0, Ordering::AcqRel)
    }

    fn download_records(&self) -> Vec<DownloadRecord> {
        self.state.records.lock().clone()
    }

    fn abort(&self) {
        if !self.state.aborted.swap(true, Ordering::AcqRel) {
            debug!("Aborting downloads");
        }
        self.shutdown_workers();
    }
}

impl Drop for LocalDownloader {
    fn drop(&mut self) {
        self.shutdown_workers();
    }
}
