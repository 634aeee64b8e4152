use crate::install::{ChunkCache, FileConstructor, InstallError, InstallStage, PhaseContext};
use crate::manifest::{FileHash, FileManifest};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

const PAUSE_CHECK_INTERVAL: Duration = Duration::from_millis(50);

/// Assembles files into install staging on a background thread
pub struct LocalFileConstructor {
    done: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl LocalFileConstructor {
    pub fn start(
        ctx: PhaseContext,
        files_to_construct: Vec<String>,
        cache: Arc<dyn ChunkCache>,
    ) -> Result<Self, InstallError> {
        let done = Arc::new(AtomicBool::new(false));
        let finished = done.clone();
        let thread = thread::Builder::new()
            .name("file-constructor".to_string())
            .spawn(move || {
                construct_all(&ctx, &files_to_construct, cache.as_ref());
                finished.store(true, Ordering::Release);
            })
            .map_err(|e| InstallError::Initialization(format!("cannot start file constructor: {}", e)))?;

        Ok(Self {
            done,
            thread: Some(thread),
        })
    }
}

impl FileConstructor for LocalFileConstructor {
    fn is_complete(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    fn wait(mut self: Box<Self>) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("File constructor thread panicked");
            }
        }
    }
}

fn construct_all(ctx: &PhaseContext, files: &[String], cache: &dyn ChunkCache) {
    let job = &ctx.job;
    let total = files.len().max(1) as f32;
    let mut built = 0usize;

    for (idx, filename) in files.iter().enumerate() {
        while ctx.control.is_paused() && !ctx.should_stop() {
            thread::sleep(PAUSE_CHECK_INTERVAL);
        }
        if ctx.should_stop() {
            debug!("File construction stopped before {}", filename);
            return;
        }
        let Some(file) = job.target_manifest.file(filename) else {
            warn!("{} is not part of the target build, skipping", filename);
            continue;
        };

        let staged = job.staged_path(filename);
        if is_already_staged(&staged, file) {
            debug!("{} already staged", filename);
        } else if let Err(e) = construct_file(&staged, file, cache) {
            let _ = fs::remove_file(&staged);
            ctx.errors.set_fatal(e);
            return;
        } else {
            built += 1;
        }
        ctx.progress
            .set_stage_progress(InstallStage::Installing, (idx + 1) as f32 / total);
    }
    info!("Constructed {} of {} file(s)", built, files.len());
}

fn is_already_staged(path: &Path, file: &FileManifest) -> bool {
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() && meta.len() == file.file_size() => {
            FileHash::of_file(path).map_or(false, |hash| hash == file.file_hash)
        }
        _ => false,
    }
}

fn construct_file(path: &Path, file: &FileManifest, cache: &dyn ChunkCache) -> Result<(), InstallError> {
    let io_error = |e: std::io::Error| InstallError::Construction(format!("{}: {}", file.filename, e));

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_error)?;
    }
    let mut writer = BufWriter::new(fs::File::create(path).map_err(io_error)?);
    for part in &file.chunk_parts {
        let data = cache.chunk_data(&part.chunk)?;
        let start = part.offset as usize;
        let end = start + part.size as usize;
        let Some(bytes) = data.get(start..end) else {
            return Err(InstallError::Construction(format!(
                "{}: chunk {} is shorter than expected",
                file.filename, part.chunk
            )));
        };
        writer.write_all(bytes).map_err(io_error)?;
    }
    writer.flush().map_err(io_error)?;
    drop(writer);

    let hash = FileHash::of_file(path).map_err(io_error)?;
    if hash != file.file_hash {
        return Err(InstallError::Construction(format!("{} failed its hash check", file.filename)));
    }
    Ok(())
}
