use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Phases that must not overlap with themselves on the same install directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Installation,
    Verification,
}

static PHASE_LOCKS: Lazy<Mutex<HashMap<(PathBuf, Phase), Arc<Mutex<()>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn lock_key(install_dir: &Path, phase: Phase) -> (PathBuf, Phase) {
    let dir = install_dir
        .canonicalize()
        .unwrap_or_else(|_| install_dir.to_path_buf());
    (dir, phase)
}

/// Lock shared by every installer working on `install_dir` in `phase`.
/// Installers on other directories never contend.
pub fn phase_lock(install_dir: &Path, phase: Phase) -> Arc<Mutex<()>> {
    let key = lock_key(install_dir, phase);
    let mut locks = PHASE_LOCKS.lock();
    // Entries only the registry still holds belong to finished phases
    locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    locks
        .entry(key)
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}
