use crate::manifest::{BuildManifest, ChunkId, ChunkInfo, ChunkPart, FileHash, FileManifest};
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs;
use std::io::Read;
use std::path::Path;
use tracing::{debug, info};
use walkdir::WalkDir;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Split every file under `build_dir` into content-addressed chunks, store
/// new chunks in `cloud_dir` and describe the build as a manifest
pub fn package_build(
    build_dir: &Path,
    cloud_dir: &Path,
    app_name: &str,
    version: &str,
    chunk_size: usize,
) -> Result<BuildManifest> {
    let chunk_size = chunk_size.max(1);
    fs::create_dir_all(cloud_dir)
        .with_context(|| format!("Failed to create cloud directory {}", cloud_dir.display()))?;

    let mut files = Vec::new();
    let mut chunks = Vec::new();
    let mut known_chunks = HashSet::new();
    let mut buffer = vec![0u8; chunk_size];

    for entry in WalkDir::new(build_dir).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to walk {}", build_dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(build_dir)
            .with_context(|| format!("{} is outside the build", entry.path().display()))?;
        let filename = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        let mut reader = fs::File::open(entry.path())
            .with_context(|| format!("Failed to open {}", entry.path().display()))?;
        let mut chunk_parts = Vec::new();
        loop {
            let read = read_full(&mut reader, &mut buffer)?;
            if read == 0 {
                break;
            }
            let data = &buffer[..read];
            let id = ChunkId::for_data(data);
            if known_chunks.insert(id) {
                let path = cloud_dir.join(id.file_name());
                if !path.exists() {
                    fs::write(&path, data)
                        .with_context(|| format!("Failed to write chunk {}", path.display()))?;
                }
                chunks.push(ChunkInfo { id, size: read as u64 });
            }
            chunk_parts.push(ChunkPart {
                chunk: id,
                offset: 0,
                size: read as u64,
            });
        }

        let metadata = entry.metadata()?;
        #[cfg(unix)]
        let is_unix_executable = metadata.permissions().mode() & 0o111 != 0;
        #[cfg(not(unix))]
        let is_unix_executable = false;

        debug!("Packaged {} ({} chunk parts)", filename, chunk_parts.len());
        files.push(FileManifest {
            file_hash: FileHash::of_file(entry.path())?,
            is_read_only: metadata.permissions().readonly(),
            is_compressed: false,
            is_unix_executable,
            chunk_parts,
            filename,
        });
    }

    info!(
        "Packaged {} {}: {} files, {} unique chunks",
        app_name,
        version,
        files.len(),
        chunks.len()
    );
    Ok(BuildManifest::new(app_name, version, files, chunks))
}

/// Fill `buffer` unless the reader runs out first
fn read_full(reader: &mut impl Read, buffer: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        let read = reader.read(&mut buffer[filled..])?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}
