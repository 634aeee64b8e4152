//! Filesystem-backed collaborators: a "cloud" directory of chunk files stands
//! in for the network, so builds can be packaged, installed and patched
//! end to end on one machine.

pub mod chunk_cache;
pub mod constructor;
pub mod downloader;
pub mod packager;

pub use chunk_cache::LocalChunkCache;
pub use constructor::LocalFileConstructor;
pub use downloader::LocalDownloader;
pub use packager::package_build;

use crate::install::{ChunkCache, Downloader, FileConstructor, InstallBackend, InstallError, PhaseContext};
use crate::manifest::BuildManifest;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Name of the manifest file written next to the chunks of a packaged build
pub const MANIFEST_FILE_NAME: &str = "manifest.json";

pub struct LocalBackend {
    cloud_dir: PathBuf,
    download_workers: usize,
    installation: Mutex<Option<(Arc<BuildManifest>, PathBuf)>>,
}

impl LocalBackend {
    pub fn new(cloud_dir: impl Into<PathBuf>, download_workers: usize) -> Self {
        Self {
            cloud_dir: cloud_dir.into(),
            download_workers,
            installation: Mutex::new(None),
        }
    }
}

impl InstallBackend for LocalBackend {
    fn register_installation(&self, manifest: &BuildManifest, install_dir: &Path) {
        info!(
            "Registered {} {} at {} for chunk recycling",
            manifest.app_name,
            manifest.version,
            install_dir.display()
        );
        *self.installation.lock() = Some((Arc::new(manifest.clone()), install_dir.to_path_buf()));
    }

    fn cloud_directory(&self) -> String {
        self.cloud_dir.display().to_string()
    }

    fn create_downloader(&self, ctx: &PhaseContext) -> Result<Arc<dyn Downloader>, InstallError> {
        let downloader = LocalDownloader::new(ctx.clone(), &self.cloud_dir, self.download_workers)?;
        Ok(Arc::new(downloader))
    }

    fn init_chunk_cache(
        &self,
        ctx: &PhaseContext,
        files_to_construct: &[String],
        downloader: Arc<dyn Downloader>,
    ) -> Result<Arc<dyn ChunkCache>, InstallError> {
        let installation = self.installation.lock().clone();
        let installed = installation
            .as_ref()
            .map(|(manifest, dir)| (manifest.as_ref(), dir.as_path()));
        Ok(Arc::new(LocalChunkCache::new(
            ctx.clone(),
            files_to_construct,
            downloader,
            installed,
        )))
    }

    fn start_file_constructor(
        &self,
        ctx: &PhaseContext,
        files_to_construct: &[String],
        cache: Arc<dyn ChunkCache>,
    ) -> Result<Box<dyn FileConstructor>, InstallError> {
        let constructor = LocalFileConstructor::start(ctx.clone(), files_to_construct.to_vec(), cache)?;
        Ok(Box::new(constructor))
    }
}
