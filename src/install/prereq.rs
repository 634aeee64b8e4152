use super::{InstallError, InstallJob};
use std::process::Command;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrereqOutcome {
    Installed,
    /// Installed, but the machine must restart before it takes effect
    RestartRequired,
}

/// Runs the build's prerequisite installer once, synchronously
pub struct PrerequisiteRunner {
    restart_code: i32,
}

impl PrerequisiteRunner {
    pub fn new(restart_code: i32) -> Self {
        Self { restart_code }
    }

    pub fn run(&self, job: &InstallJob) -> Result<PrereqOutcome, InstallError> {
        let manifest = &job.target_manifest;
        let path = job.install_dir.join(&manifest.prereq_path);
        let path = path.canonicalize().map_err(|e| {
            InstallError::Prerequisite(format!("cannot resolve {}: {}", path.display(), e))
        })?;

        let mut command = Command::new(&path);
        command.args(manifest.prereq_args.split_whitespace());
        if let Some(parent) = path.parent() {
            command.current_dir(parent);
        }

        info!("Running prerequisites installer {} {}", path.display(), manifest.prereq_args);
        let status = command.status().map_err(|e| {
            InstallError::Prerequisite(format!("failed to start {}: {}", path.display(), e))
        })?;

        match status.code() {
            Some(0) => {
                info!("Prerequisites installed");
                Ok(PrereqOutcome::Installed)
            }
            Some(code) if code == self.restart_code => {
                info!("Prerequisites installed, restart required (code {})", code);
                Ok(PrereqOutcome::RestartRequired)
            }
            Some(code) => {
                warn!("Prerequisites installer exited with code {}", code);
                Err(InstallError::Prerequisite(format!("exited with code {}", code)))
            }
            None => Err(InstallError::Prerequisite("terminated by signal".to_string())),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::manifest::BuildManifest;
    use std::fs;
    use tempfile::TempDir;

    fn job_with_script(dir: &TempDir, body: &str) -> InstallJob {
        let script = dir.path().join("setup.sh");
        fs::write(&script, body).unwrap();
        let target = BuildManifest::new("Game", "1.0", Vec::new(), Vec::new())
            .with_prerequisite("/bin/sh", script.to_string_lossy());
        InstallJob::new(None, target, dir.path(), dir.path().join("Staging"))
    }

    #[test]
    fn test_exit_codes() {
        let dir = TempDir::new().unwrap();
        let runner = PrerequisiteRunner::new(42);

        assert_eq!(runner.run(&job_with_script(&dir, "exit 0\n")), Ok(PrereqOutcome::Installed));
        assert_eq!(
            runner.run(&job_with_script(&dir, "exit 42\n")),
            Ok(PrereqOutcome::RestartRequired)
        );
        assert!(matches!(
            runner.run(&job_with_script(&dir, "exit 1\n")),
            Err(InstallError::Prerequisite(_))
        ));
    }

    #[test]
    fn test_missing_installer_is_fatal() {
        let dir = TempDir::new().unwrap();
        let target = BuildManifest::new("Game", "1.0", Vec::new(), Vec::new())
            .with_prerequisite("redist/missing-setup", "");
        let job = InstallJob::new(None, target, dir.path(), dir.path().join("Staging"));
        assert!(matches!(
            PrerequisiteRunner::new(3010).run(&job),
            Err(InstallError::Prerequisite(_))
        ));
    }

    #[test]
    fn test_arguments_are_passed() {
        let dir = TempDir::new().unwrap();
        let job = job_with_script(&dir, "touch \"$0.out\"\n");
        assert_eq!(PrerequisiteRunner::new(3010).run(&job), Ok(PrereqOutcome::Installed));
        assert!(dir.path().join("setup.sh.out").exists());
    }
}
