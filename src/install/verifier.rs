use super::backup::{remove_file_if_exists, BackupRelocationManager};
use super::dir_lock::{phase_lock, Phase};
use super::{InstallError, InstallStage, PhaseContext};
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct VerifyReport {
    pub success: bool,
    pub corrupt_files: Vec<String>,
    /// Wall time minus time spent paused
    pub elapsed: Duration,
    pub paused_for: Duration,
}

/// Re-checks every file of the target build after an attempt
pub struct VerificationEngine<'a> {
    ctx: &'a PhaseContext,
    backup: &'a BackupRelocationManager,
}

impl<'a> VerificationEngine<'a> {
    pub fn new(ctx: &'a PhaseContext, backup: &'a BackupRelocationManager) -> Self {
        Self { ctx, backup }
    }

    pub fn verify(&self) -> VerifyReport {
        let job = &self.ctx.job;
        let lock = phase_lock(&job.install_dir, Phase::Verification);
        let _guard = lock.lock();

        info!("Verifying {} files in {}", job.target_manifest.num_files(), job.install_dir.display());
        let started = Instant::now();
        let progress = &self.ctx.progress;
        let control = &self.ctx.control;
        let errors = &self.ctx.errors;

        let outcome = job.target_manifest.verify_against_directory(
            &job.install_dir,
            &mut |fraction| progress.set_stage_progress(InstallStage::BuildVerification, fraction),
            &|| control.is_paused(),
            &|| control.is_cancelling() || errors.is_cancelled(),
        );

        let elapsed = started.elapsed().saturating_sub(outcome.paused_for);
        let success = outcome.success();
        if !success && !outcome.aborted {
            errors.set_fatal(InstallError::BuildVerifyFail { count: outcome.corrupt_files.len() });
        }

        if !errors.is_cancelled() {
            for filename in &outcome.corrupt_files {
                self.backup.backup_file_if_necessary(filename, true);
                if let Err(e) = remove_file_if_exists(&job.installed_path(filename)) {
                    warn!("Failed to delete corrupt file {}: {}", filename, e);
                }
                if let Err(e) = remove_file_if_exists(&job.staged_path(filename)) {
                    warn!("Failed to delete staged copy of {}: {}", filename, e);
                }
            }
        }

        if success {
            info!("Verification passed in {:.2}s", elapsed.as_secs_f64());
        } else {
            warn!("Verification found {} corrupt file(s)", outcome.corrupt_files.len());
        }

        VerifyReport {
            success,
            corrupt_files: outcome.corrupt_files,
            elapsed,
            paused_for: outcome.paused_for,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::install::{ControlState, ErrorCategory, ErrorState, InstallJob, ProgressTracker};
    use crate::manifest::{BuildManifest, ChunkId, ChunkInfo, ChunkPart, FileHash, FileManifest};
    use std::fs;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    fn manifest(version: &str, files: &[(&str, &[u8])]) -> BuildManifest {
        let (files, chunks) = files
            .iter()
            .map(|(name, data)| {
                let chunk = ChunkId::for_data(data);
                (
                    FileManifest {
                        filename: name.to_string(),
                        file_hash: FileHash::of_bytes(data),
                        is_read_only: false,
                        is_compressed: false,
                        is_unix_executable: false,
                        chunk_parts: vec![ChunkPart { chunk, offset: 0, size: data.len() as u64 }],
                    },
                    ChunkInfo { id: chunk, size: data.len() as u64 },
                )
            })
            .unzip();
        BuildManifest::new("Game", version, files, chunks)
    }

    fn setup(current: Option<BuildManifest>, target: BuildManifest) -> (TempDir, PathBuf, PhaseContext, BackupRelocationManager) {
        let root = TempDir::new().unwrap();
        let install = root.path().join("install");
        fs::create_dir_all(&install).unwrap();
        let job = Arc::new(InstallJob::new(current, target, &install, root.path().join("Staging")));
        let backup = BackupRelocationManager::new(
            job.clone(),
            Some(root.path().join("backup")),
            5,
            Duration::from_millis(1),
        );
        let ctx = PhaseContext {
            job,
            errors: Arc::new(ErrorState::new()),
            progress: Arc::new(ProgressTracker::new()),
            control: Arc::new(ControlState::new()),
        };
        (root, install, ctx, backup)
    }

    #[test]
    fn test_clean_install_passes() {
        let (_root, install, ctx, backup) = setup(None, manifest("1.0", &[("a", b"a")]));
        fs::write(install.join("a"), b"a").unwrap();
        let report = VerificationEngine::new(&ctx, &backup).verify();
        assert!(report.success);
        assert!(!ctx.errors.has_fatal());
        assert_eq!(ctx.progress.stage_progress(InstallStage::BuildVerification), 1.0);
    }

    #[test]
    fn test_corrupt_unpatched_file_is_backed_up_and_cleared() {
        let v1 = manifest("1.0", &[("fileA", b"A1"), ("fileC", b"C")]);
        let v2 = manifest("2.0", &[("fileA", b"A2"), ("fileC", b"C")]);
        let (root, install, ctx, backup) = setup(Some(v1), v2);
        fs::write(install.join("fileA"), b"A2").unwrap();
        fs::write(install.join("fileC"), b"X").unwrap();
        let staged = ctx.job.staged_path("fileC");
        fs::create_dir_all(staged.parent().unwrap()).unwrap();
        fs::write(&staged, b"stale").unwrap();

        let report = VerificationEngine::new(&ctx, &backup).verify();
        assert!(!report.success);
        assert_eq!(report.corrupt_files, vec!["fileC".to_string()]);
        assert_eq!(ctx.errors.category(), Some(ErrorCategory::BuildVerifyFail));
        assert_eq!(fs::read(root.path().join("backup/fileC")).unwrap(), b"X");
        assert!(!install.join("fileC").exists());
        assert!(!staged.exists());
    }

    #[test]
    fn test_cancelled_run_leaves_files_alone() {
        let (_root, install, ctx, backup) = setup(None, manifest("1.0", &[("a", b"a")]));
        fs::write(install.join("a"), b"wrong").unwrap();
        ctx.errors.set_fatal(InstallError::UserCancelled);
        ctx.control.cancel();

        let report = VerificationEngine::new(&ctx, &backup).verify();
        assert!(!report.success);
        assert!(install.join("a").exists());
        assert_eq!(ctx.errors.category(), Some(ErrorCategory::UserCancelled));
    }

    #[test]
    fn test_pause_is_excluded_from_elapsed() {
        let (_root, install, ctx, backup) = setup(None, manifest("1.0", &[("a", b"a")]));
        fs::write(install.join("a"), b"a").unwrap();
        ctx.control.toggle_pause();

        let control = ctx.control.clone();
        let resumer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            control.toggle_pause();
        });
        let report = VerificationEngine::new(&ctx, &backup).verify();
        resumer.join().unwrap();

        assert!(report.success);
        assert!(report.paused_for >= Duration::from_millis(200));
        assert!(report.elapsed < report.paused_for);
    }
}
