//! On-disk layout: a binary vector artifact plus a JSONL metadata sibling.
//!
//! The artifact is little-endian: magic `RGVX`, `u32` format version, `u32`
//! dimension, `u64` entry count, then `count * dimension` `f32` values. Both
//! files are written and synced to `.tmp` siblings first; nothing is renamed
//! into place unless both temp files are complete.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use regla_core::{ChunkMeta, IndexConfig, ReglaError, Result};
use tracing::{debug, warn};

use crate::index::VectorIndex;

const MAGIC: &[u8; 4] = b"RGVX";
const FORMAT_VERSION: u32 = 1;

/// Locations of the two index artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexPaths {
    pub vectors: PathBuf,
    pub metadata: PathBuf,
}

impl IndexPaths {
    /// `vectors.idx` and `metas.jsonl` inside `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            vectors: dir.join("vectors.idx"),
            metadata: dir.join("metas.jsonl"),
        }
    }

    pub fn from_config(config: &IndexConfig) -> Self {
        Self {
            vectors: config.vectors_path(),
            metadata: config.metadata_path(),
        }
    }
}

/// Result of reading an index from disk.
#[derive(Debug)]
pub struct LoadedIndex {
    pub index: VectorIndex,
    /// Non-fatal problems repaired while loading (missing or short metadata).
    pub warnings: Vec<String>,
}

/// Write `index` to `paths`, replacing any previous artifacts.
///
/// # Errors
///
/// Returns [`ReglaError::Persistence`] if either file cannot be written.
pub fn save(index: &VectorIndex, paths: &IndexPaths) -> Result<()> {
    let vectors_tmp = write_temp(&paths.vectors, |out| write_vectors(index, out))?;
    let metadata_tmp =
        match write_temp(&paths.metadata, |out| write_metadata(index.metas(), out)) {
            Ok(path) => path,
            Err(e) => {
                let _ = fs::remove_file(&vectors_tmp);
                return Err(e);
            }
        };

    // Metadata goes first: a pair interrupted between the renames has surplus
    // records, which `load` trims, rather than vectors without records.
    if let Err(e) = commit(&metadata_tmp, &paths.metadata) {
        let _ = fs::remove_file(&vectors_tmp);
        let _ = fs::remove_file(&metadata_tmp);
        return Err(e);
    }
    if let Err(e) = commit(&vectors_tmp, &paths.vectors) {
        let _ = fs::remove_file(&vectors_tmp);
        return Err(e);
    }
    debug!(
        path = %paths.vectors.display(),
        entries = index.len(),
        "index persisted"
    );
    Ok(())
}

/// Read an index from `paths`.
///
/// Returns `Ok(None)` when the vector artifact does not exist. A missing or
/// inconsistent metadata file is repaired with placeholder records and
/// reported in [`LoadedIndex::warnings`].
///
/// # Errors
///
/// Returns [`ReglaError::IndexUnavailable`] if the artifact is unreadable or
/// corrupt.
pub fn load(paths: &IndexPaths) -> Result<Option<LoadedIndex>> {
    if !paths.vectors.exists() {
        return Ok(None);
    }

    let (dimension, vectors) = read_vectors(&paths.vectors).map_err(|e| {
        ReglaError::IndexUnavailable(format!("{}: {e}", paths.vectors.display()))
    })?;
    if dimension == 0 {
        return Err(ReglaError::IndexUnavailable(format!(
            "{}: zero dimension",
            paths.vectors.display()
        )));
    }
    let count = vectors.len() / dimension;

    let mut warnings = Vec::new();
    let mut metas = if paths.metadata.exists() {
        read_metadata(&paths.metadata, &mut warnings)?
    } else {
        warnings.push(format!(
            "metadata file {} missing; using placeholder records",
            paths.metadata.display()
        ));
        Vec::new()
    };

    if metas.len() != count {
        if paths.metadata.exists() {
            warnings.push(format!(
                "metadata has {} records for {count} vectors; aligning to vectors",
                metas.len()
            ));
        }
        metas.truncate(count);
        let start = metas.len();
        metas.extend((start..count).map(ChunkMeta::placeholder));
    }

    for warning in &warnings {
        warn!(path = %paths.metadata.display(), "{warning}");
    }

    let index = VectorIndex::from_flat(dimension, vectors, metas)
        .map_err(|e| ReglaError::IndexUnavailable(e.to_string()))?;

    Ok(Some(LoadedIndex { index, warnings }))
}

/// Copy existing artifacts to `*.backup` siblings.
///
/// Returns the backup path of the vector artifact, or `None` if there was
/// nothing to back up.
pub fn backup(paths: &IndexPaths) -> Result<Option<PathBuf>> {
    if !paths.vectors.exists() {
        return Ok(None);
    }
    let target = with_suffix(&paths.vectors, "backup");
    fs::copy(&paths.vectors, &target)
        .map_err(|e| ReglaError::Persistence(format!("failed to back up index: {e}")))?;
    if paths.metadata.exists() {
        fs::copy(&paths.metadata, with_suffix(&paths.metadata, "backup"))
            .map_err(|e| ReglaError::Persistence(format!("failed to back up metadata: {e}")))?;
    }
    Ok(Some(target))
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

fn persistence_error(path: &Path, e: std::io::Error) -> ReglaError {
    ReglaError::Persistence(format!("failed to write {}: {e}", path.display()))
}

/// Write and sync `path`'s `.tmp` sibling, returning its location.
fn write_temp<F>(path: &Path, write: F) -> Result<PathBuf>
where
    F: FnOnce(&mut BufWriter<File>) -> std::io::Result<()>,
{
    let persistence = |e: std::io::Error| persistence_error(path, e);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(persistence)?;
    }
    let temp_path = with_suffix(path, "tmp");
    let file = File::create(&temp_path).map_err(persistence)?;
    let mut out = BufWriter::new(file);
    let written = write(&mut out)
        .and_then(|()| out.flush())
        .and_then(|()| out.get_ref().sync_all());
    if let Err(e) = written {
        let _ = fs::remove_file(&temp_path);
        return Err(persistence(e));
    }
    drop(out);
    Ok(temp_path)
}

fn commit(temp_path: &Path, path: &Path) -> Result<()> {
    fs::rename(temp_path, path).map_err(|e| persistence_error(path, e))
}

fn write_vectors(index: &VectorIndex, out: &mut impl Write) -> std::io::Result<()> {
    out.write_all(MAGIC)?;
    out.write_all(&FORMAT_VERSION.to_le_bytes())?;
    out.write_all(&(index.dimension() as u32).to_le_bytes())?;
    out.write_all(&(index.len() as u64).to_le_bytes())?;
    for value in index.raw_vectors() {
        out.write_all(&value.to_le_bytes())?;
    }
    Ok(())
}

fn write_metadata(metas: &[ChunkMeta], out: &mut impl Write) -> std::io::Result<()> {
    for meta in metas {
        serde_json::to_writer(&mut *out, meta)?;
        out.write_all(b"\n")?;
    }
    Ok(())
}

fn read_vectors(path: &Path) -> std::io::Result<(usize, Vec<f32>)> {
    use std::io::{Error, ErrorKind};

    let mut input = BufReader::new(File::open(path)?);

    let mut magic = [0u8; 4];
    input.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(Error::new(ErrorKind::InvalidData, "not a regla vector index"));
    }

    let mut word = [0u8; 4];
    input.read_exact(&mut word)?;
    let version = u32::from_le_bytes(word);
    if version != FORMAT_VERSION {
        return Err(Error::new(
            ErrorKind::InvalidData,
            format!("unsupported index format version {version}"),
        ));
    }

    input.read_exact(&mut word)?;
    let dimension = u32::from_le_bytes(word) as usize;

    let mut long = [0u8; 8];
    input.read_exact(&mut long)?;
    let count = u64::from_le_bytes(long) as usize;

    let floats = count
        .checked_mul(dimension)
        .ok_or_else(|| Error::new(ErrorKind::InvalidData, "entry count overflows"))?;
    let expected_bytes = (floats as u64).saturating_mul(4);
    let actual_bytes = fs::metadata(path)?.len().saturating_sub(20);
    if actual_bytes != expected_bytes {
        return Err(Error::new(
            ErrorKind::InvalidData,
            format!("expected {expected_bytes} bytes of vectors, found {actual_bytes}"),
        ));
    }

    let mut bytes = Vec::with_capacity(floats * 4);
    input.read_to_end(&mut bytes)?;
    let vectors = bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    Ok((dimension, vectors))
}

fn read_metadata(path: &Path, warnings: &mut Vec<String>) -> Result<Vec<ChunkMeta>> {
    let file = File::open(path)?;
    let mut metas = Vec::new();
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let position = metas.len();
        let meta = match serde_json::from_str::<ChunkMeta>(&line) {
            Ok(mut meta) => {
                if meta.chunk_id.is_empty() {
                    meta.chunk_id = position.to_string();
                }
                meta
            }
            Err(e) => {
                warnings.push(format!("line {}: unreadable metadata ({e})", line_no + 1));
                ChunkMeta::placeholder(position)
            }
        };
        metas.push(meta);
    }
    Ok(metas)
}
