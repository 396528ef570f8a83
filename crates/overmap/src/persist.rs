//! Durable storage for map chunks.
//!
//! A world save is a directory: a JSON manifest plus one binary record
//! per chunk under `chunks/`. Records carry a magic tag, format version,
//! chunk coordinates, the merge sequence, a timestamp, and a
//! crc32-checksummed raster payload (uniform, run-length, or raw encoded,
//! whichever is smallest). Writes go through a temp file and an atomic
//! rename so a crash can never leave a half-written record looking valid;
//! unreadable records surface as `MapError::CorruptChunk` and are treated
//! by callers as absent, never fatal.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use crc32fast::Hasher;
use serde::{Deserialize, Serialize};

use crate::chunk::{ChunkPos, MapChunk, CHUNK_AREA};
use crate::error::{MapError, Result};

const MANIFEST_FILE: &str = "manifest.json";
const CHUNKS_DIR: &str = "chunks";
const CHUNK_MAGIC: &[u8; 4] = b"OVMC";
const CHUNK_EXT: &str = "ovc";

pub const MANIFEST_FORMAT_TAG: &str = "overmap-world";
pub const MANIFEST_FORMAT_VERSION: u32 = 1;
pub const CHUNK_FORMAT_VERSION: u32 = 1;

// magic + version + x + z + sequence + updated_ms + payload_len + crc32
const RECORD_HEADER_LEN: usize = 4 + 4 + 4 + 4 + 8 + 8 + 4 + 4;

const ENCODING_UNIFORM: u8 = 0;
const ENCODING_RLE: u8 = 1;
const ENCODING_RAW: u8 = 2;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorldManifest {
    pub format: String,
    pub version: u32,
    pub created_ms: u64,
    pub last_modified_ms: u64,
}

impl WorldManifest {
    fn fresh() -> Self {
        let now = now_unix_ms();
        Self {
            format: MANIFEST_FORMAT_TAG.to_string(),
            version: MANIFEST_FORMAT_VERSION,
            created_ms: now,
            last_modified_ms: now,
        }
    }
}

/// Handle to one world's save directory.
#[derive(Debug)]
pub struct MapStorage {
    root: PathBuf,
}

impl MapStorage {
    /// Open a save root, creating the directory layout and a fresh
    /// manifest on first use. An existing manifest with the wrong format
    /// tag or version is refused.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let storage = Self { root: root.into() };
        std::fs::create_dir_all(storage.chunks_dir())?;
        match storage.load_manifest() {
            Ok(_) => {}
            Err(MapError::Io(error)) if error.kind() == io::ErrorKind::NotFound => {
                storage.write_manifest(&WorldManifest::fresh())?;
            }
            Err(error) => return Err(error),
        }
        Ok(storage)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn chunks_dir(&self) -> PathBuf {
        self.root.join(CHUNKS_DIR)
    }

    fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn chunk_path(&self, pos: ChunkPos) -> PathBuf {
        self.chunks_dir()
            .join(format!("c.{}.{}.{CHUNK_EXT}", pos.x, pos.z))
    }

    pub fn load_manifest(&self) -> Result<WorldManifest> {
        let path = self.manifest_path();
        let file = File::open(&path)?;
        let manifest: WorldManifest = serde_json::from_reader(io::BufReader::new(file))
            .map_err(|error| MapError::BadManifest {
                path: path.clone(),
                reason: error.to_string(),
            })?;
        if manifest.format != MANIFEST_FORMAT_TAG || manifest.version != MANIFEST_FORMAT_VERSION {
            return Err(MapError::BadManifest {
                path,
                reason: format!(
                    "format '{}' version {} is not supported",
                    manifest.format, manifest.version
                ),
            });
        }
        Ok(manifest)
    }

    fn write_manifest(&self, manifest: &WorldManifest) -> Result<()> {
        let tmp_path = self.root.join(format!("{MANIFEST_FILE}.tmp"));
        let final_path = self.manifest_path();
        {
            let file = File::create(&tmp_path)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, manifest)
                .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))?;
            writer.flush()?;
            let file = writer
                .into_inner()
                .map_err(|error| io::Error::new(io::ErrorKind::Other, error.to_string()))?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp_path, &final_path)?;
        fsync_directory(&self.root);
        Ok(())
    }

    /// Bump the manifest's modification timestamp; called after a flush
    /// cycle that persisted something.
    pub fn touch_manifest(&self) -> Result<()> {
        let mut manifest = self.load_manifest()?;
        manifest.last_modified_ms = now_unix_ms();
        self.write_manifest(&manifest)
    }

    /// Load one chunk record. `Ok(None)` when no record exists;
    /// `MapError::CorruptChunk` when one exists but cannot be trusted.
    pub fn load_chunk(&self, pos: ChunkPos) -> Result<Option<MapChunk>> {
        let path = self.chunk_path(pos);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error.into()),
        };
        parse_chunk_record(&path, pos, &bytes).map(Some)
    }

    /// Persist one chunk record atomically: temp file, fsync, rename.
    pub fn save_chunk(&self, pos: ChunkPos, chunk: &MapChunk) -> Result<()> {
        let final_path = self.chunk_path(pos);
        let tmp_path = final_path.with_extension(format!("{CHUNK_EXT}.tmp"));
        let payload = encode_raster(&chunk.colors);

        {
            let file = File::create(&tmp_path)?;
            let mut writer = BufWriter::new(file);
            writer.write_all(CHUNK_MAGIC)?;
            writer.write_all(&CHUNK_FORMAT_VERSION.to_le_bytes())?;
            writer.write_all(&pos.x.to_le_bytes())?;
            writer.write_all(&pos.z.to_le_bytes())?;
            writer.write_all(&chunk.sequence.to_le_bytes())?;
            writer.write_all(&chunk.updated_ms.to_le_bytes())?;
            writer.write_all(&(payload.len() as u32).to_le_bytes())?;
            writer.write_all(&crc32(&payload).to_le_bytes())?;
            writer.write_all(&payload)?;
            writer.flush()?;
            let file = writer
                .into_inner()
                .map_err(|error| io::Error::new(io::ErrorKind::Other, error.to_string()))?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp_path, &final_path)?;
        fsync_directory(&self.chunks_dir());
        Ok(())
    }

    /// Chunk coordinates with a persisted record, in directory order.
    /// Files that do not look like chunk records are skipped with a
    /// warning.
    pub fn scan_chunk_positions(&self) -> Result<Vec<ChunkPos>> {
        let mut positions = Vec::new();
        let entries = match std::fs::read_dir(self.chunks_dir()) {
            Ok(entries) => entries,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(positions),
            Err(error) => return Err(error.into()),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            match parse_chunk_file_name(name) {
                Some(pos) => positions.push(pos),
                None => {
                    if !name.ends_with(".tmp") {
                        log::warn!("ignoring unrecognized file in chunk directory: {name}");
                    }
                }
            }
        }
        Ok(positions)
    }

    /// Delete every chunk record and start the world over with a fresh
    /// manifest.
    pub fn reset_world(&self) -> Result<()> {
        let chunks_dir = self.chunks_dir();
        match std::fs::remove_dir_all(&chunks_dir) {
            Ok(()) => {}
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(error) => return Err(error.into()),
        }
        std::fs::create_dir_all(&chunks_dir)?;
        self.write_manifest(&WorldManifest::fresh())
    }
}

/// Whether a directory looks like a world save root.
pub fn is_world_root(path: &Path) -> bool {
    path.join(MANIFEST_FILE).is_file()
}

pub fn now_unix_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    now.as_millis().min(u64::MAX as u128) as u64
}

fn parse_chunk_file_name(name: &str) -> Option<ChunkPos> {
    let rest = name.strip_prefix("c.")?;
    let rest = rest.strip_suffix(&format!(".{CHUNK_EXT}"))?;
    let (x, z) = rest.split_once('.')?;
    Some(ChunkPos::new(x.parse().ok()?, z.parse().ok()?))
}

fn parse_chunk_record(path: &Path, pos: ChunkPos, bytes: &[u8]) -> Result<MapChunk> {
    let corrupt = |reason: String| MapError::CorruptChunk {
        path: path.to_path_buf(),
        reason,
    };

    if bytes.len() < RECORD_HEADER_LEN {
        return Err(corrupt(format!(
            "record is {} bytes, shorter than the {RECORD_HEADER_LEN}-byte header",
            bytes.len()
        )));
    }
    if &bytes[0..4] != CHUNK_MAGIC {
        return Err(corrupt("magic mismatch".to_string()));
    }
    let version = u32_at(bytes, 4);
    if version != CHUNK_FORMAT_VERSION {
        return Err(corrupt(format!("unsupported record version {version}")));
    }
    let x = u32_at(bytes, 8) as i32;
    let z = u32_at(bytes, 12) as i32;
    if x != pos.x || z != pos.z {
        return Err(corrupt(format!(
            "record is for chunk ({x}, {z}), expected ({}, {})",
            pos.x, pos.z
        )));
    }
    let sequence = u64_at(bytes, 16);
    let updated_ms = u64_at(bytes, 24);
    let payload_len = u32_at(bytes, 32) as usize;
    let checksum = u32_at(bytes, 36);

    let payload = &bytes[RECORD_HEADER_LEN..];
    if payload.len() != payload_len {
        return Err(corrupt(format!(
            "payload is {} bytes, header says {payload_len}",
            payload.len()
        )));
    }
    if crc32(payload) != checksum {
        return Err(corrupt("payload checksum mismatch".to_string()));
    }

    let colors = decode_raster(payload).map_err(corrupt)?;
    Ok(MapChunk::from_raster(colors, sequence, updated_ms))
}

fn encode_raster(colors: &[u8; CHUNK_AREA]) -> Vec<u8> {
    let first = colors[0];
    if colors.iter().all(|&c| c == first) {
        return vec![ENCODING_UNIFORM, first];
    }

    let runs = rle_encode(colors);
    let rle_size = 1 + 2 + runs.len() * 3;
    let raw_size = 1 + CHUNK_AREA;

    if rle_size < raw_size {
        let mut out = Vec::with_capacity(rle_size);
        out.push(ENCODING_RLE);
        out.extend_from_slice(&(runs.len() as u16).to_le_bytes());
        for (color, length) in runs {
            out.push(color);
            out.extend_from_slice(&(length as u16).to_le_bytes());
        }
        out
    } else {
        let mut out = Vec::with_capacity(raw_size);
        out.push(ENCODING_RAW);
        out.extend_from_slice(colors);
        out
    }
}

fn rle_encode(colors: &[u8; CHUNK_AREA]) -> Vec<(u8, usize)> {
    let mut runs = Vec::new();
    let mut current = colors[0];
    let mut length = 1usize;

    for &c in &colors[1..] {
        if c == current && length < u16::MAX as usize {
            length += 1;
        } else {
            runs.push((current, length));
            current = c;
            length = 1;
        }
    }
    runs.push((current, length));
    runs
}

fn decode_raster(payload: &[u8]) -> std::result::Result<Box<[u8; CHUNK_AREA]>, String> {
    let Some((&encoding, body)) = payload.split_first() else {
        return Err("empty payload".to_string());
    };
    match encoding {
        ENCODING_UNIFORM => {
            if body.len() != 1 {
                return Err(format!("uniform payload has {} body bytes", body.len()));
            }
            Ok(Box::new([body[0]; CHUNK_AREA]))
        }
        ENCODING_RLE => {
            if body.len() < 2 {
                return Err("run-length payload missing run count".to_string());
            }
            let run_count = u16::from_le_bytes([body[0], body[1]]) as usize;
            let runs = &body[2..];
            if runs.len() != run_count * 3 {
                return Err(format!(
                    "run-length payload has {} run bytes, expected {}",
                    runs.len(),
                    run_count * 3
                ));
            }
            let mut colors = Box::new([0u8; CHUNK_AREA]);
            let mut cursor = 0usize;
            for run in runs.chunks_exact(3) {
                let color = run[0];
                let length = u16::from_le_bytes([run[1], run[2]]) as usize;
                if cursor + length > CHUNK_AREA {
                    return Err("run-length payload overflows the raster".to_string());
                }
                colors[cursor..cursor + length].fill(color);
                cursor += length;
            }
            if cursor != CHUNK_AREA {
                return Err(format!(
                    "run-length payload covers {cursor} pixels, expected {CHUNK_AREA}"
                ));
            }
            Ok(colors)
        }
        ENCODING_RAW => {
            if body.len() != CHUNK_AREA {
                return Err(format!(
                    "raw payload has {} body bytes, expected {CHUNK_AREA}",
                    body.len()
                ));
            }
            let mut colors = Box::new([0u8; CHUNK_AREA]);
            colors.copy_from_slice(body);
            Ok(colors)
        }
        other => Err(format!("unknown raster encoding {other}")),
    }
}

fn u32_at(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn u64_at(bytes: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
        bytes[offset + 4],
        bytes[offset + 5],
        bytes[offset + 6],
        bytes[offset + 7],
    ])
}

fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

fn fsync_directory(path: &Path) {
    if let Ok(dir) = File::open(path) {
        let _ = dir.sync_all();
    }
}
