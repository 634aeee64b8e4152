use build_patcher::install::{
    BuildInstaller, ChunkCache, ChunkCacheStats, DownloadRecord, Downloader, ErrorCategory, FileConstructor,
    InstallBackend, InstallController, InstallError, InstallJob, InstallOutcome, InstallStage, PhaseContext,
    RESUME_MARKER_NAME,
};
use build_patcher::local::{package_build, LocalBackend};
use build_patcher::manifest::BuildManifest;
use build_patcher::utils::config::Config;
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const CHUNK_SIZE: usize = 4;

struct Workspace {
    _root: TempDir,
    cloud: PathBuf,
    install: PathBuf,
    staging: PathBuf,
    backup: PathBuf,
    builds: PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let root = TempDir::new().unwrap();
        let path = root.path().to_path_buf();
        Self {
            cloud: path.join("cloud"),
            install: path.join("install"),
            staging: path.join("install/Staging"),
            backup: path.join("backup"),
            builds: path.join("builds"),
            _root: root,
        }
    }

    fn package(&self, version: &str, files: &[(&str, &[u8])]) -> BuildManifest {
        let build_dir = self.builds.join(version);
        for (name, data) in files {
            let path = build_dir.join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, data).unwrap();
        }
        package_build(&build_dir, &self.cloud, "Game", version, CHUNK_SIZE).unwrap()
    }

    fn job(&self, current: Option<&BuildManifest>, target: &BuildManifest) -> InstallJob {
        InstallJob::new(current.cloned(), target.clone(), &self.install, &self.staging)
    }

    fn installed(&self, name: &str) -> PathBuf {
        self.install.join(name)
    }
}

fn test_config() -> Config {
    Config {
        move_retries: 1,
        move_retry_delay_ms: 1,
        poll_interval_ms: 5,
        download_workers: 2,
        ..Config::default()
    }
}

fn run(job: InstallJob, config: Config, backend: Arc<dyn InstallBackend>) -> (InstallOutcome, InstallController) {
    let installer = BuildInstaller::new(job, config, backend);
    let controller = installer.controller();
    let outcome = installer.start(|_| {}).unwrap().wait();
    (outcome, controller)
}

/// Local backend that counts downloader creations and can cancel the run
/// when a given attempt starts downloading
struct ObservedBackend {
    inner: LocalBackend,
    downloaders_created: AtomicUsize,
    cancel_on_attempt: Option<usize>,
    controller: Mutex<Option<InstallController>>,
}

impl ObservedBackend {
    fn new(cloud: &Path, cancel_on_attempt: Option<usize>) -> Self {
        Self {
            inner: LocalBackend::new(cloud, 2),
            downloaders_created: AtomicUsize::new(0),
            cancel_on_attempt,
            controller: Mutex::new(None),
        }
    }

    fn downloaders_created(&self) -> usize {
        self.downloaders_created.load(Ordering::SeqCst)
    }
}

impl InstallBackend for ObservedBackend {
    fn register_installation(&self, manifest: &BuildManifest, install_dir: &Path) {
        self.inner.register_installation(manifest, install_dir);
    }

    fn cloud_directory(&self) -> String {
        self.inner.cloud_directory()
    }

    fn create_downloader(&self, ctx: &PhaseContext) -> Result<Arc<dyn Downloader>, InstallError> {
        let created = self.downloaders_created.fetch_add(1, Ordering::SeqCst) + 1;
        if Some(created) == self.cancel_on_attempt {
            if let Some(controller) = self.controller.lock().as_ref() {
                controller.cancel();
            }
        }
        self.inner.create_downloader(ctx)
    }

    fn init_chunk_cache(
        &self,
        ctx: &PhaseContext,
        files_to_construct: &[String],
        downloader: Arc<dyn Downloader>,
    ) -> Result<Arc<dyn ChunkCache>, InstallError> {
        self.inner.init_chunk_cache(ctx, files_to_construct, downloader)
    }

    fn start_file_constructor(
        &self,
        ctx: &PhaseContext,
        files_to_construct: &[String],
        cache: Arc<dyn ChunkCache>,
    ) -> Result<Box<dyn FileConstructor>, InstallError> {
        self.inner.start_file_constructor(ctx, files_to_construct, cache)
    }
}

const LATE_DOWNLOAD_DELAY: Duration = Duration::from_millis(300);
const LATE_DOWNLOAD_BYTES: u64 = 1000;

/// Reports a single transfer that only finishes some time after the queue
/// is closed
#[derive(Default)]
struct LateDownloader {
    closed_at: Mutex<Option<Instant>>,
}

impl LateDownloader {
    fn finished_record(&self) -> Option<DownloadRecord> {
        let start = (*self.closed_at.lock())?;
        let end = start + LATE_DOWNLOAD_DELAY;
        (Instant::now() >= end).then_some(DownloadRecord {
            start,
            end,
            bytes: LATE_DOWNLOAD_BYTES,
        })
    }
}

impl Downloader for LateDownloader {
    fn add_chunks_to_download(&self, _chunks: &[build_patcher::manifest::ChunkId]) {}

    fn notify_no_more_chunks_to_add(&self) {
        self.closed_at.lock().get_or_insert_with(Instant::now);
    }

    fn is_complete(&self) -> bool {
        self.finished_record().is_some()
    }

    fn num_bytes_left(&self) -> u64 {
        if self.is_complete() {
            0
        } else {
            LATE_DOWNLOAD_BYTES
        }
    }

    fn byte_download_count_reset(&self) -> u64 {
        0
    }

    fn download_records(&self) -> Vec<DownloadRecord> {
        self.finished_record().into_iter().collect()
    }

    fn abort(&self) {}
}

struct NoChunks;

impl ChunkCache for NoChunks {
    fn stats(&self) -> ChunkCacheStats {
        ChunkCacheStats::default()
    }

    fn have_downloads_started(&self) -> bool {
        true
    }

    fn chunk_data(&self, id: &build_patcher::manifest::ChunkId) -> Result<Vec<u8>, InstallError> {
        Err(InstallError::Download(format!("chunk {} is not cached", id)))
    }

    fn shutdown(&self) {}
}

struct Finished;

impl FileConstructor for Finished {
    fn is_complete(&self) -> bool {
        true
    }

    fn wait(self: Box<Self>) {}
}

/// Stages files straight from a build directory and finishes at once, while
/// its downloader is still busy
struct LateDownloadBackend {
    build_dir: PathBuf,
}

impl InstallBackend for LateDownloadBackend {
    fn create_downloader(&self, _ctx: &PhaseContext) -> Result<Arc<dyn Downloader>, InstallError> {
        Ok(Arc::new(LateDownloader::default()))
    }

    fn init_chunk_cache(
        &self,
        _ctx: &PhaseContext,
        _files_to_construct: &[String],
        _downloader: Arc<dyn Downloader>,
    ) -> Result<Arc<dyn ChunkCache>, InstallError> {
        Ok(Arc::new(NoChunks))
    }

    fn start_file_constructor(
        &self,
        ctx: &PhaseContext,
        files_to_construct: &[String],
        _cache: Arc<dyn ChunkCache>,
    ) -> Result<Box<dyn FileConstructor>, InstallError> {
        for filename in files_to_construct {
            let staged = ctx.job.staged_path(filename);
            let copied = fs::create_dir_all(staged.parent().unwrap())
                .and_then(|_| fs::copy(self.build_dir.join(filename), &staged));
            copied.map_err(|e| InstallError::Construction(format!("{}: {}", filename, e)))?;
        }
        Ok(Box::new(Finished))
    }
}

#[test]
fn test_download_stats_wait_for_last_transfer() {
    let ws = Workspace::new();
    let v1 = ws.package("1.0", &[("fileA", b"H1 content")]);
    let backend = Arc::new(LateDownloadBackend {
        build_dir: ws.builds.join("1.0"),
    });

    let (outcome, _) = run(ws.job(None, &v1), test_config(), backend);

    assert!(outcome.success, "{}", outcome.stats.failure_reason);
    assert_eq!(outcome.stats.total_downloaded_data, LATE_DOWNLOAD_BYTES);
    assert!(outcome.stats.average_download_speed > 0.0);
}

#[test]
fn test_fresh_install() {
    let ws = Workspace::new();
    let v1 = ws.package("1.0", &[("fileA", b"H1 content"), ("data/common.bin", b"shared bytes")]);

    let (outcome, controller) = run(ws.job(None, &v1), test_config(), Arc::new(LocalBackend::new(&ws.cloud, 2)));

    assert!(outcome.success, "{}", outcome.stats.failure_reason);
    assert_eq!(fs::read(ws.installed("fileA")).unwrap(), b"H1 content");
    assert_eq!(fs::read(ws.installed("data/common.bin")).unwrap(), b"shared bytes");
    assert_eq!(outcome.stats.num_attempts, 1);
    assert_eq!(outcome.stats.app_installed_version, "NONE");
    assert_eq!(outcome.stats.failure_category, None);
    assert!(outcome.stats.num_chunks_downloaded > 0);
    assert!(!ws.staging.exists());
    assert!(!ws.installed(RESUME_MARKER_NAME).exists());
    assert!(controller.is_complete());
    assert!((controller.progress() - 1.0).abs() < 1e-4);
}

#[test]
fn test_patch_recycles_and_removes() {
    let ws = Workspace::new();
    let v1 = ws.package(
        "1.0",
        &[("fileA", b"H1 content"), ("common", b"unchanged"), ("old.txt", b"gone in 2.0")],
    );
    let v2 = ws.package(
        "2.0",
        &[("fileA", b"H2 content, longer"), ("fileB", b"new file"), ("common", b"unchanged")],
    );
    let (outcome, _) = run(ws.job(None, &v1), test_config(), Arc::new(LocalBackend::new(&ws.cloud, 2)));
    assert!(outcome.success);

    let (outcome, controller) = run(
        ws.job(Some(&v1), &v2),
        test_config(),
        Arc::new(LocalBackend::new(&ws.cloud, 2)),
    );

    assert!(outcome.success, "{}", outcome.stats.failure_reason);
    assert_eq!(fs::read(ws.installed("fileA")).unwrap(), b"H2 content, longer");
    assert_eq!(fs::read(ws.installed("fileB")).unwrap(), b"new file");
    assert_eq!(fs::read(ws.installed("common")).unwrap(), b"unchanged");
    assert!(!ws.installed("old.txt").exists());
    assert_eq!(controller.files_installed(), vec!["fileA", "fileB"]);

    let stats = &outcome.stats;
    assert_eq!(stats.app_installed_version, "1.0");
    assert_eq!(stats.app_patch_version, "2.0");
    assert_eq!(stats.num_files_in_build, 3);
    assert_eq!(stats.num_files_outdated, 2);
    assert_eq!(stats.num_files_to_remove, 1);
    // "onte" is shared with the 1.0 copy of fileA
    assert!(stats.num_chunks_recycled >= 1);
    assert!(!ws.staging.exists());
}

#[test]
fn test_user_edited_file_is_backed_up_before_patch() {
    let ws = Workspace::new();
    let v1 = ws.package("1.0", &[("config.ini", b"volume=5")]);
    let v2 = ws.package("2.0", &[("config.ini", b"volume=7")]);
    let (outcome, _) = run(ws.job(None, &v1), test_config(), Arc::new(LocalBackend::new(&ws.cloud, 2)));
    assert!(outcome.success);
    fs::write(ws.installed("config.ini"), b"volume=11, mine").unwrap();

    let config = Config {
        backup_dir: Some(ws.backup.clone()),
        ..test_config()
    };
    let (outcome, _) = run(ws.job(Some(&v1), &v2), config, Arc::new(LocalBackend::new(&ws.cloud, 2)));

    assert!(outcome.success);
    assert_eq!(fs::read(ws.installed("config.ini")).unwrap(), b"volume=7");
    assert_eq!(fs::read(ws.backup.join("config.ini")).unwrap(), b"volume=11, mine");
}

#[test]
fn test_resume_marker_skips_download() {
    let ws = Workspace::new();
    let v1 = ws.package("1.0", &[("fileA", b"H1 content"), ("fileB", b"more")]);

    // A previous run already moved everything into place
    fs::create_dir_all(&ws.install).unwrap();
    fs::write(ws.installed("fileA"), b"H1 content").unwrap();
    fs::write(ws.installed("fileB"), b"more").unwrap();
    fs::write(ws.installed(RESUME_MARKER_NAME), b"").unwrap();

    let backend = Arc::new(ObservedBackend::new(&ws.cloud, None));
    let (outcome, controller) = run(ws.job(None, &v1), test_config(), backend.clone());

    assert!(outcome.success, "{}", outcome.stats.failure_reason);
    assert_eq!(backend.downloaders_created(), 0);
    for stage in [
        InstallStage::Resuming,
        InstallStage::Downloading,
        InstallStage::Installing,
        InstallStage::MovingToInstall,
    ] {
        assert_eq!(controller.stage_progress(stage), 1.0, "{:?}", stage);
    }
    assert_eq!(outcome.stats.num_chunks_downloaded, 0);
    assert!(!ws.installed(RESUME_MARKER_NAME).exists());
}

#[test]
fn test_repair_refetches_corrupt_file() {
    let ws = Workspace::new();
    let v1 = ws.package("1.0", &[("fileA", b"H1 content"), ("fileC", b"intact")]);
    let (outcome, _) = run(ws.job(None, &v1), test_config(), Arc::new(LocalBackend::new(&ws.cloud, 2)));
    assert!(outcome.success);

    // Same size, so only the hash walk can notice
    fs::write(ws.installed("fileC"), b"broken").unwrap();

    let job = ws.job(Some(&v1), &v1);
    assert!(job.is_repair);
    let config = Config {
        backup_dir: Some(ws.backup.clone()),
        ..test_config()
    };
    let (outcome, controller) = run(job, config, Arc::new(LocalBackend::new(&ws.cloud, 2)));

    assert!(outcome.success, "{}", outcome.stats.failure_reason);
    assert_eq!(outcome.stats.num_attempts, 2);
    assert_eq!(outcome.stats.num_files_outdated, 1);
    assert_eq!(fs::read(ws.installed("fileC")).unwrap(), b"intact");
    assert_eq!(fs::read(ws.backup.join("fileC")).unwrap(), b"broken");
    assert_eq!(controller.files_installed(), vec!["fileC"]);
}

#[test]
fn test_move_failure_exhausts_retries() {
    let ws = Workspace::new();
    let v1 = ws.package("1.0", &[("fileA", b"H1 content"), ("fileB", b"more")]);

    // A non-empty directory where fileA must go blocks every move
    fs::create_dir_all(ws.installed("fileA").join("blocker")).unwrap();
    fs::write(ws.installed("fileA/blocker/keep"), b"x").unwrap();

    let (outcome, controller) = run(ws.job(None, &v1), test_config(), Arc::new(LocalBackend::new(&ws.cloud, 2)));

    assert!(!outcome.success);
    assert_eq!(outcome.stats.num_attempts, 5);
    assert_eq!(outcome.stats.failure_category, Some(ErrorCategory::MoveFileToInstall));
    assert!(outcome.stats.failure_reason.contains("fileA"));
    assert!(controller.has_error());
    // Staging is kept for the next run
    assert!(ws.staging.exists());
}

#[test]
fn test_cancel_stops_further_attempts() {
    let ws = Workspace::new();
    let v1 = ws.package("1.0", &[("fileA", b"H1 content")]);
    fs::create_dir_all(ws.installed("fileA").join("blocker")).unwrap();
    fs::write(ws.installed("fileA/blocker/keep"), b"x").unwrap();

    let backend = Arc::new(ObservedBackend::new(&ws.cloud, Some(2)));
    let installer = BuildInstaller::new(ws.job(None, &v1), test_config(), backend.clone());
    *backend.controller.lock() = Some(installer.controller());
    let outcome = installer.start(|_| {}).unwrap().wait();

    assert!(!outcome.success);
    assert_eq!(outcome.stats.num_attempts, 2);
    assert_eq!(outcome.stats.failure_category, Some(ErrorCategory::UserCancelled));
    assert_eq!(backend.downloaders_created(), 2);

    let controller = backend.controller.lock().clone().unwrap();
    assert!(!controller.has_error());
    assert!(controller.snapshot().cancelled);
}

#[test]
fn test_completion_runs_on_dispatching_thread() {
    let ws = Workspace::new();
    let v1 = ws.package("1.0", &[("fileA", b"H1 content")]);

    let called_on = Arc::new(Mutex::new(None));
    let installer = BuildInstaller::new(ws.job(None, &v1), test_config(), Arc::new(LocalBackend::new(&ws.cloud, 2)));
    let mut handle = installer
        .start({
            let called_on = called_on.clone();
            move |outcome: InstallOutcome| {
                assert!(outcome.success);
                *called_on.lock() = Some(thread::current().id());
            }
        })
        .unwrap();

    while !handle.dispatch_completion() {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(*called_on.lock(), Some(thread::current().id()));
    assert!(handle.is_complete());

    // The callback is delivered once
    *called_on.lock() = None;
    let outcome = handle.wait();
    assert!(outcome.success);
    assert_eq!(*called_on.lock(), None);
}

#[cfg(unix)]
mod permissions {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn test_repair_resets_stray_permissions() {
        let ws = Workspace::new();
        let v1 = ws.package("1.0", &[("tool", b"plain data")]);
        let (outcome, _) = run(ws.job(None, &v1), test_config(), Arc::new(LocalBackend::new(&ws.cloud, 2)));
        assert!(outcome.success);

        let path = ws.installed("tool");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o555)).unwrap();

        let job = ws.job(Some(&v1), &v1);
        assert!(job.is_repair);
        let (outcome, _) = run(job, test_config(), Arc::new(LocalBackend::new(&ws.cloud, 2)));

        assert!(outcome.success, "{}", outcome.stats.failure_reason);
        assert_eq!(outcome.stats.num_attempts, 1);
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0, "executable bit survived: {:o}", mode);
        assert_ne!(mode & 0o200, 0, "file left read-only: {:o}", mode);
    }

    #[test]
    fn test_patch_leaves_plain_files_alone() {
        let ws = Workspace::new();
        let v1 = ws.package("1.0", &[("tool", b"plain data"), ("fileA", b"H1 content")]);
        let v2 = ws.package("2.0", &[("tool", b"plain data"), ("fileA", b"H2 content")]);
        let (outcome, _) = run(ws.job(None, &v1), test_config(), Arc::new(LocalBackend::new(&ws.cloud, 2)));
        assert!(outcome.success);

        let path = ws.installed("tool");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();

        let (outcome, _) = run(ws.job(Some(&v1), &v2), test_config(), Arc::new(LocalBackend::new(&ws.cloud, 2)));

        assert!(outcome.success, "{}", outcome.stats.failure_reason);
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
    }
}

#[cfg(unix)]
mod prerequisites {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn package_with_script(ws: &Workspace, script: &str) -> BuildManifest {
        let build_dir = ws.builds.join("1.0");
        fs::create_dir_all(&build_dir).unwrap();
        let path = build_dir.join("setup.sh");
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        package_build(&build_dir, &ws.cloud, "Game", "1.0", CHUNK_SIZE)
            .unwrap()
            .with_prerequisite("setup.sh", "")
    }

    #[test]
    fn test_restart_code_counts_as_success() {
        let ws = Workspace::new();
        let manifest = package_with_script(&ws, "#!/bin/sh\ntouch prereq.done\nexit 3\n");
        let config = Config {
            prereq_restart_code: 3,
            ..test_config()
        };

        let (outcome, _) = run(ws.job(None, &manifest), config, Arc::new(LocalBackend::new(&ws.cloud, 2)));

        assert!(outcome.success, "{}", outcome.stats.failure_reason);
        assert!(ws.installed("prereq.done").exists());
    }

    #[test]
    fn test_failing_prerequisites_are_not_retried() {
        let ws = Workspace::new();
        let manifest = package_with_script(&ws, "#!/bin/sh\nexit 1\n");

        let (outcome, _) = run(ws.job(None, &manifest), test_config(), Arc::new(LocalBackend::new(&ws.cloud, 2)));

        assert!(!outcome.success);
        assert_eq!(outcome.stats.num_attempts, 1);
        assert_eq!(outcome.stats.failure_category, Some(ErrorCategory::Prerequisite));
    }

    #[test]
    fn test_patch_skips_prerequisites() {
        let ws = Workspace::new();
        let v1 = package_with_script(&ws, "#!/bin/sh\ntouch prereq.done\n");
        let (outcome, _) = run(ws.job(None, &v1), test_config(), Arc::new(LocalBackend::new(&ws.cloud, 2)));
        assert!(outcome.success);
        fs::remove_file(ws.installed("prereq.done")).unwrap();

        let (outcome, _) = run(ws.job(Some(&v1), &v1), test_config(), Arc::new(LocalBackend::new(&ws.cloud, 2)));

        assert!(outcome.success);
        assert!(!ws.installed("prereq.done").exists());
    }
}
