use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Where user-modified files are preserved before being replaced
    pub backup_dir: Option<PathBuf>,

    /// Install attempts before giving up
    pub install_retries: u32,

    /// Copy/rename retries per staged file
    pub move_retries: u32,

    pub move_retry_delay_ms: u64,

    /// How often the installation phase samples collaborator progress
    pub poll_interval_ms: u64,

    /// Prerequisite installer exit code meaning "installed, restart required"
    pub prereq_restart_code: i32,

    /// Concurrent chunk transfers
    pub download_workers: usize,

    /// Status API port, disabled when unset
    pub status_port: Option<u16>,

    /// Chunk size used when packaging builds
    pub chunk_size: usize,

    /// Installer events kept for the status API
    pub log_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backup_dir: None,
            install_retries: 5,
            move_retries: 5,
            move_retry_delay_ms: 500,
            poll_interval_ms: 100,
            prereq_restart_code: 3010,
            download_workers: num_cpus::get().clamp(1, 8),
            status_port: None,
            chunk_size: 1024 * 1024,
            log_buffer_size: 1000,
        }
    }
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(value) => {
            let parsed = value
                .trim()
                .parse()
                .with_context(|| format!("Invalid value for {}: {}", name, value))?;
            Ok(Some(parsed))
        }
        Err(_) => Ok(None),
    }
}

impl Config {
    /// Load config from environment (and `.env` if present)
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv();
        let mut config = Config::default();

        if let Ok(dir) = std::env::var("PATCHER_BACKUP_DIR") {
            if !dir.is_empty() {
                config.backup_dir = Some(PathBuf::from(dir));
            }
        }
        if let Some(retries) = env_parse::<u32>("PATCHER_INSTALL_RETRIES")? {
            config.install_retries = retries;
        }
        if let Some(retries) = env_parse::<u32>("PATCHER_MOVE_RETRIES")? {
            config.move_retries = retries;
        }
        if let Some(delay) = env_parse::<u64>("PATCHER_MOVE_RETRY_DELAY_MS")? {
            config.move_retry_delay_ms = delay;
        }
        if let Some(interval) = env_parse::<u64>("PATCHER_POLL_INTERVAL_MS")? {
            config.poll_interval_ms = interval;
        }
        if let Some(code) = env_parse::<i32>("PATCHER_PREREQ_RESTART_CODE")? {
            config.prereq_restart_code = code;
        }
        if let Some(workers) = env_parse::<usize>("PATCHER_DOWNLOAD_WORKERS")? {
            config.download_workers = workers.max(1);
        }
        if let Some(port) = env_parse::<u16>("PATCHER_STATUS_PORT")? {
            config.status_port = Some(port);
        }
        if let Some(size) = env_parse::<usize>("PATCHER_CHUNK_SIZE")? {
            config.chunk_size = size.max(1);
        }

        Ok(config)
    }

    pub fn move_retry_delay(&self) -> Duration {
        Duration::from_millis(self.move_retry_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}
