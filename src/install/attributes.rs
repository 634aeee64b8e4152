use super::{PhaseContext, SharedJob};
use crate::manifest::FileManifest;
use std::fs;
use std::io;
use std::path::Path;
use tracing::{debug, info, warn};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Set or clear the read-only flag of a file
pub(crate) fn set_read_only(path: &Path, read_only: bool) -> io::Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    #[cfg(unix)]
    {
        let mode = perms.mode();
        let mode = if read_only { mode & !0o222 } else { mode | 0o200 };
        perms.set_mode(mode);
    }
    #[cfg(not(unix))]
    perms.set_readonly(read_only);
    fs::set_permissions(path, perms)
}

fn set_executable(path: &Path, executable: bool) -> io::Result<()> {
    #[cfg(unix)]
    {
        let mut perms = fs::metadata(path)?.permissions();
        let mode = perms.mode();
        perms.set_mode(if executable { mode | 0o111 } else { mode & !0o111 });
        fs::set_permissions(path, perms)
    }
    #[cfg(not(unix))]
    {
        let _ = (path, executable);
        Ok(())
    }
}

/// Filesystem compression is not available through std; treat it as applied
fn set_compressed(path: &Path, compressed: bool) -> io::Result<()> {
    if compressed {
        debug!("Compression requested for {}, leaving file as is", path.display());
    }
    Ok(())
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AttributeReport {
    pub files_updated: u64,
    pub warnings: u64,
}

/// Applies read-only, compressed and executable flags after files are moved
pub struct FileAttributeApplier {
    job: SharedJob,
}

impl FileAttributeApplier {
    pub fn new(job: SharedJob) -> Self {
        Self { job }
    }

    /// Apply target attributes. `force` touches every file (repair runs),
    /// otherwise only files with attributes or with attributes removed.
    /// Problems are logged, never fatal.
    pub fn apply(&self, ctx: &PhaseContext, force: bool) -> AttributeReport {
        let mut report = AttributeReport::default();
        let target = &self.job.target_manifest;

        if !force {
            if let Some(current) = self.job.current() {
                for file in &target.files {
                    if ctx.control.is_cancelling() {
                        return report;
                    }
                    let Some(old) = current.file(&file.filename) else {
                        continue;
                    };
                    let read_only_removed = old.is_read_only && !file.is_read_only;
                    let compression_removed = old.is_compressed && !file.is_compressed;
                    if read_only_removed || compression_removed {
                        self.apply_to_file(file, &mut report);
                    }
                }
            }
        }

        for file in &target.files {
            if ctx.control.is_cancelling() {
                break;
            }
            if force || file.has_attributes() {
                self.apply_to_file(file, &mut report);
            }
        }

        info!(
            "File attributes applied to {} file(s), {} warning(s)",
            report.files_updated, report.warnings
        );
        report
    }

    fn apply_to_file(&self, file: &FileManifest, report: &mut AttributeReport) {
        let path = self.job.installed_path(&file.filename);
        if !path.is_file() {
            warn!("Cannot set attributes, {} is not installed", file.filename);
            report.warnings += 1;
            return;
        }

        let steps: [(&str, io::Result<()>); 4] = [
            ("clear read-only", set_read_only(&path, false)),
            ("set compression", set_compressed(&path, file.is_compressed)),
            ("set executable", set_executable(&path, file.is_unix_executable)),
            ("set read-only", set_read_only(&path, file.is_read_only)),
        ];
        let mut failed = false;
        for (step, result) in steps {
            if let Err(e) = result {
                warn!("Failed to {} on {}: {}", step, file.filename, e);
                failed = true;
            }
        }

        if failed {
            report.warnings += 1;
        } else {
            report.files_updated += 1;
        }
    }
}
