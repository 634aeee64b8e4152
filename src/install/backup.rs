use super::attributes::set_read_only;
use super::{InstallError, InstallStage, PhaseContext, SharedJob};
use crate::manifest::{verify_file, BuildManifest, FileHash};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Rename, falling back to copy and delete when the rename fails
/// (for example across filesystems)
pub(crate) fn move_file(src: &Path, dst: &Path) -> io::Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(e) => {
            debug!("Rename {} failed ({}), trying copy", src.display(), e);
            fs::copy(src, dst)?;
            if let Err(e) = fs::remove_file(src) {
                warn!("Copied {} but could not remove the source: {}", src.display(), e);
            }
            Ok(())
        }
    }
}

/// Remove a file, treating an already missing file as success
pub(crate) fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => {
            // Read-only files cannot be deleted on every platform
            if set_read_only(path, false).is_ok() {
                fs::remove_file(path)
            } else {
                Err(e)
            }
        }
        _ => Ok(()),
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RelocationReport {
    pub files_removed: u64,
    pub files_moved: u64,
}

/// Preserves user-modified files before they are replaced and moves
/// constructed files from staging into the install directory
pub struct BackupRelocationManager {
    job: SharedJob,
    backup_dir: Option<PathBuf>,
    move_retries: u32,
    move_retry_delay: Duration,
    files_installed: Mutex<HashSet<String>>,
}

impl BackupRelocationManager {
    pub fn new(
        job: SharedJob,
        backup_dir: Option<PathBuf>,
        move_retries: u32,
        move_retry_delay: Duration,
    ) -> Self {
        Self {
            job,
            backup_dir,
            move_retries,
            move_retry_delay,
            files_installed: Mutex::new(HashSet::new()),
        }
    }

    /// Forget what the previous attempt wrote
    pub fn clear_files_installed(&self) {
        self.files_installed.lock().clear();
    }

    pub fn files_installed(&self) -> Vec<String> {
        let mut files: Vec<String> = self.files_installed.lock().iter().cloned().collect();
        files.sort();
        files
    }

    pub fn was_installed_this_attempt(&self, filename: &str) -> bool {
        self.files_installed.lock().contains(filename)
    }

    /// Returns false only when a needed backup could not be made.
    ///
    /// `discovered_by_verification` is set for files that failed the
    /// post-install verification walk.
    pub fn backup_file_if_necessary(&self, filename: &str, discovered_by_verification: bool) -> bool {
        let Some(backup_dir) = self.backup_dir.as_ref() else {
            return true;
        };
        let installed = self.job.installed_path(filename);
        let backup = backup_dir.join(filename);

        if !installed.is_file() {
            return true;
        }
        if backup.exists() {
            debug!("Backup of {} already exists", filename);
            return true;
        }
        if self.was_installed_this_attempt(filename) {
            return true;
        }

        let target = &self.job.target_manifest;
        let current = self.job.current();

        if discovered_by_verification {
            if let Some(current) = current {
                if !BuildManifest::is_file_outdated(current, target, filename) {
                    info!("Backing up {}, not part of this patch", filename);
                    return self.move_to_backup(&installed, &backup);
                }
            }
        }

        let old = current.and_then(|c| c.file(filename));
        let new = target.file(filename);
        let user_edited = match fs::metadata(&installed) {
            Ok(meta) => {
                let size = meta.len();
                let size_differs = old.map(|f| f.file_size()) != Some(size)
                    && new.map(|f| f.file_size()) != Some(size);
                let hashes: Vec<FileHash> = old.iter().chain(new.iter()).map(|f| f.file_hash).collect();
                size_differs || verify_file(&installed, &hashes).is_none()
            }
            Err(_) => false,
        };

        if discovered_by_verification || user_edited {
            info!("Backing up modified file {}", filename);
            return self.move_to_backup(&installed, &backup);
        }
        true
    }

    fn move_to_backup(&self, installed: &Path, backup: &Path) -> bool {
        match move_file(installed, backup) {
            Ok(()) => true,
            Err(e) => {
                // Another process may have removed the file meanwhile
                warn!("Failed to back up {}: {}", installed.display(), e);
                !installed.exists()
            }
        }
    }

    /// Remove files the target build no longer has, then move every staged
    /// file into place. Returns false when a move failed; the fatal error is
    /// recorded in the shared error state.
    pub fn relocate_staged_files(&self, ctx: &PhaseContext) -> (bool, RelocationReport) {
        let mut report = RelocationReport::default();
        let job = &self.job;

        if let Some(current) = job.current() {
            for filename in BuildManifest::get_removable_files(current, &job.target_manifest) {
                self.backup_file_if_necessary(&filename, false);
                match remove_file_if_exists(&job.installed_path(&filename)) {
                    Ok(()) => report.files_removed += 1,
                    Err(e) => warn!("Failed to remove {}: {}", filename, e),
                }
            }
        }

        let files = job.target_manifest.file_list();
        let total = files.len().max(1) as f32;
        let mut marker_written = false;

        for (idx, filename) in files.iter().enumerate() {
            if ctx.should_stop() {
                return (false, report);
            }
            let staged = job.staged_path(filename);
            if !staged.is_file() {
                ctx.progress.set_stage_progress(InstallStage::MovingToInstall, (idx + 1) as f32 / total);
                continue;
            }

            if !marker_written {
                marker_written = true;
                if let Err(e) = fs::write(job.resume_marker(), b"") {
                    warn!("Failed to write resume marker: {}", e);
                }
                if ctx.progress.stage_weight(InstallStage::MovingToInstall) == 0.0 {
                    ctx.progress.set_stage_weight(InstallStage::MovingToInstall, 0.1);
                }
            }

            if !self.backup_file_if_necessary(filename, false) {
                warn!("Replacing {} without a backup", filename);
            }

            let installed = job.installed_path(filename);
            if !self.move_with_retries(&staged, &installed) {
                error!("Failed to move {} into the install directory", filename);
                ctx.errors.set_fatal(InstallError::MoveFileToInstall(filename.clone()));
                return (false, report);
            }
            self.files_installed.lock().insert(filename.clone());
            report.files_moved += 1;
            ctx.progress.set_stage_progress(InstallStage::MovingToInstall, (idx + 1) as f32 / total);
        }

        ctx.progress.set_stage_progress(InstallStage::MovingToInstall, 1.0);
        info!(
            "Relocation complete: {} moved, {} removed",
            report.files_moved, report.files_removed
        );
        (!ctx.errors.has_fatal(), report)
    }

    fn move_with_retries(&self, staged: &Path, installed: &Path) -> bool {
        if let Some(parent) = installed.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                warn!("Failed to create {}: {}", parent.display(), e);
            }
        }
        if installed.is_file() {
            let _ = set_read_only(installed, false);
        }

        let mut moved = fs::rename(staged, installed).is_ok();
        let mut retries = 0;
        while !moved && retries < self.move_retries {
            retries += 1;
            warn!(
                "Move of {} failed, retry {} of {}",
                staged.display(),
                retries,
                self.move_retries
            );
            match fs::copy(staged, installed) {
                Ok(_) => {
                    if let Err(e) = fs::remove_file(staged) {
                        warn!("Copied {} but could not remove it: {}", staged.display(), e);
                    }
                    moved = true;
                }
                Err(e) => {
                    debug!("Copy fallback failed: {}", e);
                    thread::sleep(self.move_retry_delay);
                    moved = fs::rename(staged, installed).is_ok();
                }
            }
        }
        moved
    }
}
