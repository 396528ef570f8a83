//! Applies incoming raster updates to the world map.
//!
//! An update carries a rectangular patch of packed palette bytes for a
//! single chunk, tagged with the update stream's sequence number. Pixels
//! merge under last-writer-wins by sequence: an incoming value lands only
//! where the stored pixel is unset or was last written by an update that
//! is not newer. Incoming unset pixels never erase stored detail, so a
//! stale or partial copy of an area cannot regress the map.

use crate::chunk::{world_to_chunk, ChunkPos, MapChunk, CHUNK_AREA, CHUNK_SIZE};
use crate::error::{MapError, Result};
use crate::palette;
use crate::persist::now_unix_ms;
use crate::store::WorldMap;

/// A rectangular patch of one chunk's raster.
#[derive(Clone, Debug)]
pub struct ChunkUpdate {
    pub pos: ChunkPos,
    /// Patch offset within the chunk.
    pub x: u32,
    pub z: u32,
    pub width: u32,
    pub height: u32,
    /// Packed palette bytes, row-major, `width * height` of them.
    pub colors: Vec<u8>,
    pub sequence: u64,
}

impl ChunkUpdate {
    /// An update replacing a chunk's whole raster.
    pub fn full_chunk(pos: ChunkPos, colors: Vec<u8>, sequence: u64) -> Result<Self> {
        if colors.len() != CHUNK_AREA {
            return Err(MapError::InvalidUpdate {
                reason: format!(
                    "full-chunk update carries {} bytes, expected {CHUNK_AREA}",
                    colors.len()
                ),
            });
        }
        Ok(Self {
            pos,
            x: 0,
            z: 0,
            width: CHUNK_SIZE as u32,
            height: CHUNK_SIZE as u32,
            colors,
            sequence,
        })
    }

    fn validate(&self) -> Result<()> {
        let size = CHUNK_SIZE as u32;
        if self.width == 0 || self.height == 0 {
            return Err(MapError::InvalidUpdate {
                reason: "empty update rect".to_string(),
            });
        }
        if self.x as u64 + self.width as u64 > size as u64
            || self.z as u64 + self.height as u64 > size as u64
        {
            return Err(MapError::InvalidUpdate {
                reason: format!(
                    "rect {}x{} at ({}, {}) exceeds the {size}x{size} chunk",
                    self.width, self.height, self.x, self.z
                ),
            });
        }
        let expected = (self.width * self.height) as usize;
        if self.colors.len() != expected {
            return Err(MapError::InvalidUpdate {
                reason: format!(
                    "rect carries {} bytes, expected {expected}",
                    self.colors.len()
                ),
            });
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct MergeOutcome {
    pub pixels_changed: usize,
}

impl MergeOutcome {
    pub fn changed_anything(self) -> bool {
        self.pixels_changed > 0
    }
}

/// Merge one update into its chunk. The update is validated up front and
/// applied whole or not at all; on any pixel change the chunk is flagged
/// for persistence and its position queued for consumers.
pub fn apply_update(world: &mut WorldMap, update: &ChunkUpdate) -> Result<MergeOutcome> {
    update.validate()?;

    let mut changed = 0usize;
    {
        let chunk = world.get_or_create(update.pos)?;
        for row in 0..update.height as usize {
            let src_base = row * update.width as usize;
            let dst_base =
                MapChunk::local_index(update.x as usize, update.z as usize + row);
            for col in 0..update.width as usize {
                let incoming = update.colors[src_base + col];
                if palette::packed_is_transparent(incoming) {
                    continue;
                }
                let idx = dst_base + col;
                let stored = chunk.colors[idx];
                if palette::packed_is_transparent(stored)
                    || update.sequence >= chunk.pixel_seq[idx]
                {
                    if chunk.write_pixel(idx, incoming, update.sequence) {
                        changed += 1;
                    }
                }
            }
        }
        if changed > 0 {
            chunk.dirty = true;
            chunk.sequence = chunk.sequence.max(update.sequence);
            chunk.updated_ms = now_unix_ms();
        }
    }
    if changed > 0 {
        world.mark_dirty(update.pos);
    }
    Ok(MergeOutcome {
        pixels_changed: changed,
    })
}

/// Split a world-space raster patch into per-chunk updates.
///
/// `apply_update` operates on exactly one chunk so each piece lands
/// atomically; this is the caller-side splitter for patches that straddle
/// chunk boundaries. Pieces cover the source rect exactly once.
pub fn split_world_update(
    world_x: i32,
    world_z: i32,
    width: u32,
    height: u32,
    colors: &[u8],
    sequence: u64,
) -> Result<Vec<ChunkUpdate>> {
    let expected = width as usize * height as usize;
    if width == 0 || height == 0 {
        return Err(MapError::InvalidUpdate {
            reason: "empty update rect".to_string(),
        });
    }
    if colors.len() != expected {
        return Err(MapError::InvalidUpdate {
            reason: format!("rect carries {} bytes, expected {expected}", colors.len()),
        });
    }

    let size = CHUNK_SIZE as i32;
    let far_x = world_x as i64 + width as i64 - 1;
    let far_z = world_z as i64 + height as i64 - 1;
    if far_x > i32::MAX as i64 || far_z > i32::MAX as i64 {
        return Err(MapError::InvalidUpdate {
            reason: "rect extends past the world coordinate range".to_string(),
        });
    }
    let max_x = far_x as i32;
    let max_z = far_z as i32;
    let (min_chunk, _) = world_to_chunk(world_x, world_z);
    let (max_chunk, _) = world_to_chunk(max_x, max_z);

    let mut pieces = Vec::new();
    for chunk_z in min_chunk.z..=max_chunk.z {
        for chunk_x in min_chunk.x..=max_chunk.x {
            let pos = ChunkPos::new(chunk_x, chunk_z);
            let (origin_x, origin_z) = pos.origin();

            let start_x = world_x.max(origin_x);
            let start_z = world_z.max(origin_z);
            let end_x = max_x.min(origin_x + size - 1);
            let end_z = max_z.min(origin_z + size - 1);
            let piece_w = (end_x - start_x + 1) as u32;
            let piece_h = (end_z - start_z + 1) as u32;

            let mut piece = Vec::with_capacity((piece_w * piece_h) as usize);
            for row in 0..piece_h as i32 {
                let src_row = (start_z - world_z + row) as usize;
                let src_col = (start_x - world_x) as usize;
                let base = src_row * width as usize + src_col;
                piece.extend_from_slice(&colors[base..base + piece_w as usize]);
            }

            pieces.push(ChunkUpdate {
                pos,
                x: (start_x - origin_x) as u32,
                z: (start_z - origin_z) as u32,
                width: piece_w,
                height: piece_h,
                colors: piece,
                sequence,
            });
        }
    }
    Ok(pieces)
}
