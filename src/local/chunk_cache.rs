use crate::install::{ChunkCache, ChunkCacheStats, Downloader, InstallError, PhaseContext};
use crate::manifest::{BuildManifest, ChunkId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

const CHUNK_WAIT_INTERVAL: Duration = Duration::from_millis(10);

/// Where a whole chunk can be read back from an installed file
#[derive(Debug, Clone)]
struct RecycleSource {
    filename: String,
    position: u64,
    size: u64,
}

/// Whole chunks contained in the files of an installed build
fn recycle_sources(manifest: &BuildManifest) -> HashMap<ChunkId, RecycleSource> {
    let mut sources = HashMap::new();
    for file in &manifest.files {
        let mut position = 0u64;
        for part in &file.chunk_parts {
            let whole = part.offset == 0 && manifest.chunk_size(&part.chunk) == Some(part.size);
            if whole {
                sources.entry(part.chunk).or_insert_with(|| RecycleSource {
                    filename: file.filename.clone(),
                    position,
                    size: part.size,
                });
            }
            position += part.size;
        }
    }
    sources
}

fn read_range(path: &Path, position: u64, size: u64) -> std::io::Result<Vec<u8>> {
    let mut file = fs::File::open(path)?;
    file.seek(SeekFrom::Start(position))?;
    let mut data = vec![0u8; size as usize];
    file.read_exact(&mut data)?;
    Ok(data)
}

fn staged_chunk_is_valid(path: &Path, id: &ChunkId) -> bool {
    fs::read(path).map_or(false, |data| ChunkId::for_data(&data) == *id)
}

/// Sources every chunk needed for an attempt: chunks left in data staging by
/// an earlier attempt, chunks recycled from the installed build, and
/// downloads for the rest
pub struct LocalChunkCache {
    ctx: PhaseContext,
    downloader: Arc<dyn Downloader>,
    stats: Mutex<ChunkCacheStats>,
    downloads_started: bool,
}

impl LocalChunkCache {
    pub fn new(
        ctx: PhaseContext,
        files_to_construct: &[String],
        downloader: Arc<dyn Downloader>,
        installed: Option<(&BuildManifest, &Path)>,
    ) -> Self {
        let job = ctx.job.clone();
        let target = &job.target_manifest;
        let required = target.chunks_required_for_files(files_to_construct);
        let sources = installed.map(|(manifest, _)| recycle_sources(manifest)).unwrap_or_default();

        let mut stats = ChunkCacheStats {
            num_files_to_construct: files_to_construct.len() as u64,
            num_required_chunks: required.len() as u64,
            ..Default::default()
        };

        let mut to_download = Vec::new();
        let mut to_recycle = Vec::new();
        for id in required {
            if staged_chunk_is_valid(&job.data_staging_dir.join(id.file_name()), &id) {
                stats.num_chunks_locally_available += 1;
            } else if let Some(source) = sources.get(&id) {
                to_recycle.push((id, source.clone()));
            } else {
                to_download.push(id);
            }
        }
        stats.num_chunks_to_recycle = to_recycle.len() as u64;

        if let Some((_, install_dir)) = installed {
            for (id, source) in to_recycle {
                if Self::recycle(&job.data_staging_dir, install_dir, &id, &source) {
                    stats.num_chunks_recycled += 1;
                } else {
                    debug!("Could not recycle chunk {} from {}", id, source.filename);
                    stats.num_recycle_failures += 1;
                    to_download.push(id);
                }
            }
        }

        stats.num_chunks_to_download = to_download.len() as u64;
        stats.total_chunk_download_size = target.data_size(&to_download);
        info!(
            "Chunks: {} required, {} staged, {} recycled, {} to download ({} bytes)",
            stats.num_required_chunks,
            stats.num_chunks_locally_available,
            stats.num_chunks_recycled,
            stats.num_chunks_to_download,
            stats.total_chunk_download_size
        );

        let downloads_started = !to_download.is_empty();
        downloader.add_chunks_to_download(&to_download);

        Self {
            ctx,
            downloader,
            stats: Mutex::new(stats),
            downloads_started,
        }
    }

    fn recycle(staging: &Path, install_dir: &Path, id: &ChunkId, source: &RecycleSource) -> bool {
        let data = match read_range(&install_dir.join(&source.filename), source.position, source.size) {
            Ok(data) => data,
            Err(_) => return false,
        };
        if ChunkId::for_data(&data) != *id {
            return false;
        }
        fs::write(staging.join(id.file_name()), &data).is_ok()
    }

    fn staged_path(&self, id: &ChunkId) -> PathBuf {
        self.ctx.job.data_staging_dir.join(id.file_name())
    }

    fn stop_error(&self) -> InstallError {
        if self.ctx.errors.is_cancelled() || self.ctx.control.is_cancelling() {
            InstallError::UserCancelled
        } else {
            InstallError::Download("download stopped".to_string())
        }
    }
}

impl ChunkCache for LocalChunkCache {
    fn stats(&self) -> ChunkCacheStats {
        *self.stats.lock()
    }

    fn have_downloads_started(&self) -> bool {
        self.downloads_started
    }

    fn chunk_data(&self, id: &ChunkId) -> Result<Vec<u8>, InstallError> {
        let path = self.staged_path(id);
        loop {
            let download_finished = self.downloader.is_complete();
            if let Ok(data) = fs::read(&path) {
                if ChunkId::for_data(&data) == *id {
                    return Ok(data);
                }
                return Err(InstallError::Construction(format!("staged chunk {} is corrupt", id)));
            }
            if self.ctx.should_stop() {
                return Err(self.stop_error());
            }
            if download_finished {
                return Err(InstallError::Download(format!("chunk {} was never delivered", id)));
            }
            thread::sleep(CHUNK_WAIT_INTERVAL);
        }
    }

    fn shutdown(&self) {
        let stats = self.stats();
        let downloaded = self.downloader.download_records().len() as u64;
        self.stats.lock().num_chunks_downloaded = downloaded;
        debug!(
            "Chunk cache shut down: {} downloaded, {} recycled",
            downloaded, stats.num_chunks_recycled
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::install::{ControlState, DownloadRecord, ErrorState, InstallJob, ProgressTracker};
    use crate::manifest::{ChunkInfo, ChunkPart, FileHash, FileManifest};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    /// Records what was queued and never delivers anything
    #[derive(Default)]
    struct QueueOnly {
        queued: Mutex<Vec<ChunkId>>,
        complete: AtomicBool,
    }

    impl Downloader for QueueOnly {
        fn add_chunks_to_download(&self, chunks: &[ChunkId]) {
            self.queued.lock().extend_from_slice(chunks);
        }
        fn notify_no_more_chunks_to_add(&self) {
            self.complete.store(true, Ordering::Release);
        }
        fn is_complete(&self) -> bool {
            self.complete.load(Ordering::Acquire)
        }
        fn num_bytes_left(&self) -> u64 {
            0
        }
        fn byte_download_count_reset(&self) -> u64 {
            0
        }
        fn download_records(&self) -> Vec<DownloadRecord> {
            Vec::new()
        }
        fn abort(&self) {}
    }

    fn two_chunk_file(name: &str, a: &[u8], b: &[u8]) -> (FileManifest, Vec<ChunkInfo>) {
        let (ia, ib) = (ChunkId::for_data(a), ChunkId::for_data(b));
        let data = [a, b].concat();
        let file = FileManifest {
            filename: name.to_string(),
            file_hash: FileHash::of_bytes(&data),
            is_read_only: false,
            is_compressed: false,
            is_unix_executable: false,
            chunk_parts: vec![
                ChunkPart { chunk: ia, offset: 0, size: a.len() as u64 },
                ChunkPart { chunk: ib, offset: 0, size: b.len() as u64 },
            ],
        };
        let chunks = vec![
            ChunkInfo { id: ia, size: a.len() as u64 },
            ChunkInfo { id: ib, size: b.len() as u64 },
        ];
        (file, chunks)
    }

    #[test]
    fn test_recycles_unchanged_chunks_from_install() {
        let root = TempDir::new().unwrap();
        let install = root.path().join("install");
        fs::create_dir_all(&install).unwrap();
        fs::write(install.join("pak"), b"HEADERold-body").unwrap();

        let (old_file, old_chunks) = two_chunk_file("pak", b"HEADER", b"old-body");
        let (new_file, new_chunks) = two_chunk_file("pak", b"HEADER", b"new-body!");
        let current = BuildManifest::new("Game", "1.0", vec![old_file], old_chunks);
        let target = BuildManifest::new("Game", "1.1", vec![new_file], new_chunks);
        let job = InstallJob::new(Some(current.clone()), target, &install, root.path().join("Staging"));
        fs::create_dir_all(&job.data_staging_dir).unwrap();
        let ctx = PhaseContext {
            job: Arc::new(job),
            errors: Arc::new(ErrorState::new()),
            progress: Arc::new(ProgressTracker::new()),
            control: Arc::new(ControlState::new()),
        };

        let downloader = Arc::new(QueueOnly::default());
        let cache = LocalChunkCache::new(
            ctx.clone(),
            &["pak".to_string()],
            downloader.clone(),
            Some((&current, install.as_path())),
        );
        let stats = cache.stats();
        assert_eq!(stats.num_required_chunks, 2);
        assert_eq!(stats.num_chunks_recycled, 1);
        assert_eq!(stats.num_chunks_to_download, 1);
        assert_eq!(stats.total_chunk_download_size, 9);
        assert_eq!(*downloader.queued.lock(), vec![ChunkId::for_data(b"new-body!")]);
        assert!(cache.have_downloads_started());

        assert_eq!(cache.chunk_data(&ChunkId::for_data(b"HEADER")).unwrap(), b"HEADER");

        downloader.notify_no_more_chunks_to_add();
        assert!(matches!(
            cache.chunk_data(&ChunkId::for_data(b"new-body!")),
            Err(InstallError::Download(_))
        ));
    }

    #[test]
    fn test_cancel_unblocks_waiting_reader() {
        let root = TempDir::new().unwrap();
        let (file, chunks) = two_chunk_file("f", b"aa", b"bb");
        let target = BuildManifest::new("Game", "1.0", vec![file], chunks);
        let job = InstallJob::new(None, target, root.path().join("i"), root.path().join("Staging"));
        fs::create_dir_all(&job.data_staging_dir).unwrap();
        let ctx = PhaseContext {
            job: Arc::new(job),
            errors: Arc::new(ErrorState::new()),
            progress: Arc::new(ProgressTracker::new()),
            control: Arc::new(ControlState::new()),
        };
        let cache = LocalChunkCache::new(ctx.clone(), &["f".to_string()], Arc::new(QueueOnly::default()), None);

        ctx.errors.set_fatal(InstallError::UserCancelled);
        ctx.control.cancel();
        assert_eq!(cache.chunk_data(&ChunkId::for_data(b"aa")), Err(InstallError::UserCancelled));
    }
}
