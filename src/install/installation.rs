use super::dir_lock::{phase_lock, Phase};
use super::orchestrator::InstallerCore;
use super::{ChunkCache, ChunkCacheStats, DownloadRecord, Downloader, FileConstructor, InstallError, InstallStage};
use crate::manifest::BuildManifest;
use std::collections::VecDeque;
use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Readings kept for the rolling download speed
const SPEED_SAMPLE_COUNT: usize = 5;

/// Minimum time between two speed readings
const SPEED_SAMPLE_TIME: Duration = Duration::from_millis(500);

/// Totals over a set of chunk downloads
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DownloadSummary {
    pub total_bytes: u64,
    /// Wall time during which at least one download was active
    pub time_downloading: Duration,
    /// Bytes per second over `time_downloading`
    pub average_speed: f64,
}

/// Average throughput that does not count overlapping transfers twice
pub fn average_download_speed(records: &[DownloadRecord]) -> DownloadSummary {
    let mut sorted = records.to_vec();
    sorted.sort_by_key(|record| record.start);

    let mut summary = DownloadSummary::default();
    let mut window: Option<(Instant, Instant)> = None;
    for record in &sorted {
        summary.total_bytes += record.bytes;
        let end = record.end.max(record.start);
        window = match window {
            Some((start, current_end)) if record.start <= current_end => Some((start, current_end.max(end))),
            Some((start, current_end)) => {
                summary.time_downloading += current_end - start;
                Some((record.start, end))
            }
            None => Some((record.start, end)),
        };
    }
    if let Some((start, end)) = window {
        summary.time_downloading += end - start;
    }

    let secs = summary.time_downloading.as_secs_f64();
    if secs > 0.0 {
        summary.average_speed = summary.total_bytes as f64 / secs;
    }
    summary
}

/// Rolling download speed for status reporting
pub(crate) struct DownloadSpeedSampler {
    readings: VecDeque<(Duration, u64)>,
    last_reading: Instant,
}

impl DownloadSpeedSampler {
    pub fn new() -> Self {
        Self {
            readings: VecDeque::with_capacity(SPEED_SAMPLE_COUNT),
            last_reading: Instant::now(),
        }
    }

    /// Take a reading if enough time has passed. Returns the current speed in
    /// bytes per second, or None when no reading has been taken yet.
    pub fn sample(&mut self, downloader: &dyn Downloader) -> Option<f64> {
        let since = self.last_reading.elapsed();
        if since >= SPEED_SAMPLE_TIME {
            let bytes = downloader.byte_download_count_reset();
            if self.readings.len() == SPEED_SAMPLE_COUNT {
                self.readings.pop_front();
            }
            self.readings.push_back((since, bytes));
            self.last_reading = Instant::now();
        }
        self.speed()
    }

    fn speed(&self) -> Option<f64> {
        let time: Duration = self.readings.iter().map(|(time, _)| *time).sum();
        let bytes: u64 = self.readings.iter().map(|(_, bytes)| *bytes).sum();
        let secs = time.as_secs_f64();
        (secs > 0.0).then(|| bytes as f64 / secs)
    }
}

impl InstallerCore {
    /// Download and construct every required file into the install staging
    /// directory. `corrupt_files` from a previous attempt, when not empty,
    /// replaces the manifest diff.
    pub(crate) fn run_installation(&self, corrupt_files: Vec<String>) -> bool {
        let job = self.ctx.job.clone();
        let lock = phase_lock(&job.install_dir, Phase::Installation);
        let _guard = lock.lock();

        let progress = &self.ctx.progress;
        let target = &job.target_manifest;
        let files_to_construct = if corrupt_files.is_empty() {
            BuildManifest::get_outdated_files(job.current(), target, &job.install_dir)
        } else {
            corrupt_files
        };

        {
            let mut status = self.status.lock();
            let stats = &mut status.stats;
            stats.num_files_in_build = target.num_files() as u64;
            stats.num_files_outdated = files_to_construct.len() as u64;
            stats.num_files_to_remove = job
                .current()
                .map_or(0, |current| BuildManifest::get_removable_files(current, target).len() as u64);
        }
        progress.set_stage_progress(InstallStage::Initializing, 1.0);
        info!("{} file(s) to construct", files_to_construct.len());

        if job.resume_marker().exists() {
            info!("Staged files were already moved by an earlier attempt, skipping to verification");
            for stage in [
                InstallStage::Resuming,
                InstallStage::Downloading,
                InstallStage::Installing,
                InstallStage::MovingToInstall,
            ] {
                progress.set_stage_progress(stage, 1.0);
            }
            return true;
        }

        for dir in [&job.data_staging_dir, &job.install_staging_dir] {
            if let Err(e) = fs::create_dir_all(dir) {
                self.ctx.errors.set_fatal(InstallError::Initialization(format!(
                    "cannot create staging directory {}: {}",
                    dir.display(),
                    e
                )));
                return false;
            }
        }

        let downloader = match self.backend.create_downloader(&self.ctx) {
            Ok(downloader) => downloader,
            Err(e) => {
                self.ctx.errors.set_fatal(e);
                return false;
            }
        };
        *self.active_downloader.lock() = Some(downloader.clone());
        if self.ctx.control.is_cancelling() {
            downloader.abort();
        }

        let succeeded = match self.backend.init_chunk_cache(&self.ctx, &files_to_construct, downloader.clone()) {
            Ok(cache) => {
                let result = self.construct_files(&files_to_construct, &downloader, cache.clone());
                cache.shutdown();
                self.record_cache_stats(&cache.stats());
                result
            }
            Err(e) => {
                self.ctx.errors.set_fatal(e);
                false
            }
        };

        if self.ctx.errors.has_fatal() {
            downloader.abort();
        }
        self.active_downloader.lock().take();

        let summary = average_download_speed(&downloader.download_records());
        {
            let mut status = self.status.lock();
            let download_size = status.initial_download_size;
            status.download_speed = -1.0;
            status.download_bytes_left = 0;
            let stats = &mut status.stats;
            stats.total_downloaded_data += summary.total_bytes;
            stats.average_download_speed = summary.average_speed;
            stats.theoretical_download_time = if summary.average_speed > 0.0 {
                download_size as f64 / summary.average_speed
            } else {
                0.0
            };
        }
        debug!(
            "Downloaded {} bytes in {:?} ({:.1} bytes/s)",
            summary.total_bytes, summary.time_downloading, summary.average_speed
        );

        succeeded && !self.ctx.errors.has_fatal()
    }

    fn construct_files(
        &self,
        files_to_construct: &[String],
        downloader: &Arc<dyn Downloader>,
        cache: Arc<dyn ChunkCache>,
    ) -> bool {
        let progress = &self.ctx.progress;
        let job = &self.ctx.job;
        let cache_stats = cache.stats();

        {
            let mut status = self.status.lock();
            status.initial_download_size = cache_stats.total_chunk_download_size;
            status.download_bytes_left = cache_stats.total_chunk_download_size;
            let stats = &mut status.stats;
            stats.num_chunks_required = cache_stats.num_required_chunks;
            stats.chunks_queued_for_download = cache_stats.num_chunks_to_download;
            stats.chunks_locally_available = cache_stats.num_chunks_locally_available;
        }

        if !job.is_repair {
            let required = cache_stats.num_required_chunks.max(1) as f32;
            progress.set_stage_weight(
                InstallStage::Downloading,
                cache_stats.num_chunks_to_download as f32 / required,
            );
            progress.set_stage_weight(
                InstallStage::Installing,
                0.1 + cache_stats.num_chunks_to_recycle as f32 / required,
            );
            progress.set_stage_weight(
                InstallStage::MovingToInstall,
                if files_to_construct.is_empty() { 0.0 } else { 0.05 },
            );
            progress.set_stage_weight(InstallStage::BuildVerification, 1.1 / 9.0);
        }
        progress.set_stage_progress(InstallStage::Resuming, 1.0);

        let constructor: Box<dyn FileConstructor> =
            match self.backend.start_file_constructor(&self.ctx, files_to_construct, cache.clone()) {
                Ok(constructor) => constructor,
                Err(e) => {
                    self.ctx.errors.set_fatal(e);
                    downloader.notify_no_more_chunks_to_add();
                    return false;
                }
            };
        downloader.notify_no_more_chunks_to_add();

        let mut sampler = DownloadSpeedSampler::new();
        let mut aborted = false;
        while !constructor.is_complete() {
            thread::sleep(self.config.poll_interval());
            if !aborted && self.ctx.should_stop() {
                warn!("Stopping installation: {}", self.ctx.errors.error_string());
                downloader.abort();
                aborted = true;
            }
            self.refresh_download_status(downloader.as_ref(), cache.as_ref(), &mut sampler);
        }
        constructor.wait();

        // Transfers are recorded after their chunk lands, so drain the
        // downloader before anyone reads its records
        while !downloader.is_complete() {
            if !aborted && self.ctx.should_stop() {
                downloader.abort();
                aborted = true;
            }
            self.refresh_download_status(downloader.as_ref(), cache.as_ref(), &mut sampler);
            thread::sleep(self.config.poll_interval());
        }

        if !self.ctx.errors.has_fatal() {
            progress.set_stage_progress(InstallStage::Downloading, 1.0);
            progress.set_stage_progress(InstallStage::Installing, 1.0);
        }
        !self.ctx.errors.has_fatal()
    }

    fn refresh_download_status(
        &self,
        downloader: &dyn Downloader,
        cache: &dyn ChunkCache,
        sampler: &mut DownloadSpeedSampler,
    ) {
        let downloading = cache.have_downloads_started() && !downloader.is_complete();
        let speed = if downloading { sampler.sample(downloader) } else { None };
        let bytes_left = downloader.num_bytes_left();

        let mut status = self.status.lock();
        status.download_speed = speed.unwrap_or(-1.0);
        status.download_bytes_left = bytes_left;
    }

    fn record_cache_stats(&self, cache_stats: &ChunkCacheStats) {
        let mut status = self.status.lock();
        let stats = &mut status.stats;
        stats.num_chunks_downloaded += cache_stats.num_chunks_downloaded;
        stats.num_chunks_recycled += cache_stats.num_chunks_recycled;
        stats.num_chunks_cache_booted += cache_stats.num_chunks_cache_booted;
        stats.num_drive_cache_chunk_loads += cache_stats.num_drive_cache_chunk_loads;
        stats.num_recycle_failures += cache_stats.num_recycle_failures;
        stats.num_drive_cache_load_failures += cache_stats.num_drive_cache_load_failures;
    }
}
