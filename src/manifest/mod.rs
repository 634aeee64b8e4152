use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::io::{self, Read};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// How long the verification walk sleeps between pause checks
const PAUSE_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Read buffer used when hashing files
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// blake3 digest of a file or of a chunk
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct FileHash([u8; 32]);

impl FileHash {
    pub fn of_bytes(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    pub fn of_file(path: &Path) -> io::Result<Self> {
        let mut file = fs::File::open(path)?;
        let mut hasher = blake3::Hasher::new();
        let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
        loop {
            let read = file.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
        Ok(Self(*hasher.finalize().as_bytes()))
    }

    pub fn to_hex(&self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        blake3::Hash::from_hex(hex).ok().map(|h| Self(*h.as_bytes()))
    }
}

impl fmt::Display for FileHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for FileHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileHash({})", &self.to_hex()[..12])
    }
}

impl Serialize for FileHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for FileHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        FileHash::from_hex(&hex)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid hash: {}", hex)))
    }
}

/// Content address of a chunk: the hash of the chunk's bytes
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(FileHash);

impl ChunkId {
    pub fn for_data(data: &[u8]) -> Self {
        Self(FileHash::of_bytes(data))
    }

    pub fn hash(&self) -> &FileHash {
        &self.0
    }

    /// File name used for this chunk in staging and cloud directories
    pub fn file_name(&self) -> String {
        format!("{}.chunk", self.0.to_hex())
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkId({})", &self.0.to_hex()[..12])
    }
}

/// A slice of a chunk that makes up part of a file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPart {
    pub chunk: ChunkId,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileManifest {
    /// Path relative to the install directory, '/' separated
    pub filename: String,
    pub file_hash: FileHash,
    #[serde(default)]
    pub is_read_only: bool,
    #[serde(default)]
    pub is_compressed: bool,
    #[serde(default)]
    pub is_unix_executable: bool,
    #[serde(default)]
    pub chunk_parts: Vec<ChunkPart>,
}

impl FileManifest {
    pub fn file_size(&self) -> u64 {
        self.chunk_parts.iter().map(|p| p.size).sum()
    }

    /// True when any non-default attribute is set
    pub fn has_attributes(&self) -> bool {
        self.is_read_only || self.is_compressed || self.is_unix_executable
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub id: ChunkId,
    pub size: u64,
}

/// Immutable description of one build of an application
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildManifest {
    pub app_name: String,
    pub version: String,
    /// Prerequisite installer, relative to the install directory
    #[serde(default)]
    pub prereq_path: String,
    #[serde(default)]
    pub prereq_args: String,
    pub files: Vec<FileManifest>,
    pub chunks: Vec<ChunkInfo>,
    #[serde(skip)]
    file_lookup: HashMap<String, usize>,
    #[serde(skip)]
    chunk_lookup: HashMap<ChunkId, usize>,
}

/// Result of walking a manifest against an install directory
#[derive(Debug, Clone, Default)]
pub struct VerifyOutcome {
    pub corrupt_files: Vec<String>,
    pub paused_for: Duration,
    pub aborted: bool,
}

impl VerifyOutcome {
    pub fn success(&self) -> bool {
        !self.aborted && self.corrupt_files.is_empty()
    }
}

impl BuildManifest {
    pub fn new(
        app_name: impl Into<String>,
        version: impl Into<String>,
        files: Vec<FileManifest>,
        chunks: Vec<ChunkInfo>,
    ) -> Self {
        let mut manifest = Self {
            app_name: app_name.into(),
            version: version.into(),
            prereq_path: String::new(),
            prereq_args: String::new(),
            files,
            chunks,
            file_lookup: HashMap::new(),
            chunk_lookup: HashMap::new(),
        };
        manifest.rebuild_lookups();
        manifest
    }

    pub fn with_prerequisite(mut self, path: impl Into<String>, args: impl Into<String>) -> Self {
        self.prereq_path = path.into();
        self.prereq_args = args.into();
        self
    }

    fn rebuild_lookups(&mut self) {
        self.file_lookup = self
            .files
            .iter()
            .enumerate()
            .map(|(idx, f)| (f.filename.clone(), idx))
            .collect();
        self.chunk_lookup = self
            .chunks
            .iter()
            .enumerate()
            .map(|(idx, c)| (c.id, idx))
            .collect();
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path)
            .with_context(|| format!("Failed to read manifest {}", path.display()))?;
        let mut manifest: BuildManifest = serde_json::from_slice(&data)
            .with_context(|| format!("Failed to parse manifest {}", path.display()))?;
        manifest.rebuild_lookups();
        debug!(
            "Loaded manifest {} {} ({} files, {} chunks)",
            manifest.app_name,
            manifest.version,
            manifest.files.len(),
            manifest.chunks.len()
        );
        Ok(manifest)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(self)?;
        fs::write(path, data)
            .with_context(|| format!("Failed to write manifest {}", path.display()))?;
        Ok(())
    }

    pub fn file(&self, filename: &str) -> Option<&FileManifest> {
        self.file_lookup.get(filename).map(|&idx| &self.files[idx])
    }

    pub fn file_list(&self) -> Vec<String> {
        self.files.iter().map(|f| f.filename.clone()).collect()
    }

    pub fn num_files(&self) -> usize {
        self.files.len()
    }

    pub fn build_size(&self) -> u64 {
        self.files.iter().map(|f| f.file_size()).sum()
    }

    pub fn chunk_size(&self, id: &ChunkId) -> Option<u64> {
        self.chunk_lookup.get(id).map(|&idx| self.chunks[idx].size)
    }

    /// Total size of the given chunks, unknown chunks count as zero
    pub fn data_size(&self, chunks: &[ChunkId]) -> u64 {
        chunks.iter().filter_map(|id| self.chunk_size(id)).sum()
    }

    /// Unique chunks referenced by the given files, in first-use order
    pub fn chunks_required_for_files(&self, files: &[String]) -> Vec<ChunkId> {
        let mut seen = HashSet::new();
        let mut required = Vec::new();
        for name in files {
            if let Some(file) = self.file(name) {
                for part in &file.chunk_parts {
                    if seen.insert(part.chunk) {
                        required.push(part.chunk);
                    }
                }
            }
        }
        required
    }

    /// Content-identical comparison used to detect repair runs
    pub fn is_same_as(&self, other: &BuildManifest) -> bool {
        self.app_name == other.app_name && self.version == other.version && self.files == other.files
    }

    /// Files of the target build that must be constructed to bring an install
    /// of `current` (if any) up to `target`. Includes added files, changed
    /// files, and unchanged files whose installed copy is missing or has the
    /// wrong size.
    pub fn get_outdated_files(
        current: Option<&BuildManifest>,
        target: &BuildManifest,
        install_dir: &Path,
    ) -> Vec<String> {
        let current = match current {
            Some(current) => current,
            None => return target.file_list(),
        };

        target
            .files
            .iter()
            .filter(|file| {
                match current.file(&file.filename) {
                    None => true,
                    Some(old) if old.file_hash != file.file_hash => true,
                    Some(_) => {
                        // Same content in both builds, check what's really on disk
                        let installed = install_dir.join(&file.filename);
                        match fs::metadata(&installed) {
                            Ok(meta) => !meta.is_file() || meta.len() != file.file_size(),
                            Err(_) => true,
                        }
                    }
                }
            })
            .map(|file| file.filename.clone())
            .collect()
    }

    /// Files in `current` that no longer exist in `target`
    pub fn get_removable_files(current: &BuildManifest, target: &BuildManifest) -> Vec<String> {
        current
            .files
            .iter()
            .filter(|file| target.file(&file.filename).is_none())
            .map(|file| file.filename.clone())
            .collect()
    }

    /// Whether patching from `current` to `target` touches `filename`
    pub fn is_file_outdated(current: &BuildManifest, target: &BuildManifest, filename: &str) -> bool {
        match (current.file(filename), target.file(filename)) {
            (Some(old), Some(new)) => old.file_hash != new.file_hash,
            (None, None) => false,
            _ => true,
        }
    }

    /// Walk every file of this build and compare the on-disk size and hash.
    ///
    /// `is_paused` is polled before each file; paused time is reported back so
    /// callers can exclude it from timings. `should_abort` stops the walk early.
    pub fn verify_against_directory(
        &self,
        install_dir: &Path,
        progress: &mut dyn FnMut(f32),
        is_paused: &dyn Fn() -> bool,
        should_abort: &dyn Fn() -> bool,
    ) -> VerifyOutcome {
        let mut outcome = VerifyOutcome::default();
        let total_bytes = self.build_size().max(1) as f64;
        let mut processed_bytes = 0u64;

        progress(0.0);
        for file in &self.files {
            if is_paused() {
                let paused_at = Instant::now();
                while is_paused() && !should_abort() {
                    std::thread::sleep(PAUSE_CHECK_INTERVAL);
                }
                outcome.paused_for += paused_at.elapsed();
            }
            if should_abort() {
                info!("Verification aborted after {} bytes", processed_bytes);
                outcome.aborted = true;
                return outcome;
            }

            let path = install_dir.join(&file.filename);
            if !file_matches(&path, file) {
                debug!("Verify failed for {}", file.filename);
                outcome.corrupt_files.push(file.filename.clone());
            }

            processed_bytes += file.file_size();
            progress((processed_bytes as f64 / total_bytes).min(1.0) as f32);
        }
        progress(1.0);

        outcome
    }
}

/// Size check first so missing or truncated files never get hashed
fn file_matches(path: &Path, expected: &FileManifest) -> bool {
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() && meta.len() == expected.file_size() => {
            FileHash::of_file(path).map_or(false, |hash| hash == expected.file_hash)
        }
        _ => false,
    }
}

/// Returns which of the candidate hashes the file matches, if any
pub fn verify_file(path: &Path, candidates: &[FileHash]) -> Option<usize> {
    let hash = FileHash::of_file(path).ok()?;
    candidates.iter().position(|candidate| *candidate == hash)
}
