//! Windowed reads over the world raster.
//!
//! A window is an axis-aligned pixel rectangle centered on a world point
//! (corner = center - size / 2). Sampling composites from however many
//! chunks the window spans and is a pure read: absent chunks contribute
//! transparent pixels and are never allocated or faulted in. Callers that
//! need the footprint resident ahead of time enumerate it with
//! `chunks_covering` and load through the session.

use crate::chunk::{world_to_chunk, ChunkPos};
use crate::store::WorldMap;

/// A reusable output raster for window samples.
#[derive(Clone, Debug)]
pub struct WindowBuffer {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl WindowBuffer {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0u8; width as usize * height as usize],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Packed palette bytes, row-major.
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn pixel(&self, x: u32, z: u32) -> u8 {
        debug_assert!(x < self.width && z < self.height);
        self.pixels[(z * self.width + x) as usize]
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.pixels.resize(width as usize * height as usize, 0);
    }
}

/// Fill `out` with the window of `out.width x out.height` pixels centered
/// on the given world point. Deterministic for a given map state; does not
/// mutate the map.
pub fn sample(world: &WorldMap, center_x: i32, center_z: i32, out: &mut WindowBuffer) {
    let corner_x = center_x - out.width as i32 / 2;
    let corner_z = center_z - out.height as i32 / 2;

    let mut cached: Option<(ChunkPos, &crate::chunk::MapChunk)> = None;
    for z in 0..out.height as i32 {
        for x in 0..out.width as i32 {
            let (pos, idx) = world_to_chunk(corner_x + x, corner_z + z);
            let chunk = match cached {
                Some((cached_pos, chunk)) if cached_pos == pos => Some(chunk),
                _ => {
                    let chunk = world.get(pos);
                    cached = chunk.map(|c| (pos, c));
                    chunk
                }
            };
            let color = match chunk {
                Some(chunk) => chunk.colors[idx],
                None => 0,
            };
            out.pixels[(z * out.width as i32 + x) as usize] = color;
        }
    }
}

/// Chunk positions a window touches, row-major. A window no larger than a
/// chunk spans 1, 2, or 4 of them depending on alignment.
pub fn chunks_covering(center_x: i32, center_z: i32, width: u32, height: u32) -> Vec<ChunkPos> {
    if width == 0 || height == 0 {
        return Vec::new();
    }
    let corner_x = center_x - width as i32 / 2;
    let corner_z = center_z - height as i32 / 2;
    let (min_chunk, _) = world_to_chunk(corner_x, corner_z);
    let (max_chunk, _) = world_to_chunk(corner_x + width as i32 - 1, corner_z + height as i32 - 1);

    let mut positions = Vec::new();
    for z in min_chunk.z..=max_chunk.z {
        for x in min_chunk.x..=max_chunk.x {
            positions.push(ChunkPos::new(x, z));
        }
    }
    positions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{MapChunk, CHUNK_AREA};
    use crate::merge::{apply_update, ChunkUpdate};
    use crate::palette;

    #[test]
    fn unwritten_world_samples_fully_transparent_repeatedly() {
        let world = WorldMap::new();
        let mut buf = WindowBuffer::new(128, 128);
        for _ in 0..2 {
            sample(&world, 40, -900, &mut buf);
            assert!(buf
                .pixels()
                .iter()
                .all(|&c| palette::packed_is_transparent(c)));
        }
    }

    #[test]
    fn chunk_aligned_window_returns_the_raster_unchanged() {
        let mut world = WorldMap::new();
        let colors: Vec<u8> = (0..CHUNK_AREA).map(|i| (i % 251) as u8).collect();
        let update =
            ChunkUpdate::full_chunk(ChunkPos::new(0, 0), colors.clone(), 1).expect("full chunk");
        apply_update(&mut world, &update).expect("merge");

        // center 64,64 puts the corner at the chunk origin
        let mut buf = WindowBuffer::new(128, 128);
        sample(&world, 64, 64, &mut buf);

        let chunk = world.get(ChunkPos::new(0, 0)).expect("chunk");
        assert_eq!(buf.pixels(), &chunk.colors[..]);
        // transparent-family source bytes read back as transparent, the
        // rest verbatim
        for (out, src) in buf.pixels().iter().zip(colors.iter()) {
            if palette::packed_is_transparent(*src) {
                assert!(palette::packed_is_transparent(*out));
            } else {
                assert_eq!(out, src);
            }
        }
    }

    #[test]
    fn straddling_window_pulls_each_quadrant_from_its_chunk() {
        let mut world = WorldMap::new();
        // one distinct solid color per chunk around the origin corner
        for (pos, family) in [
            (ChunkPos::new(-1, -1), 10u8),
            (ChunkPos::new(0, -1), 11),
            (ChunkPos::new(-1, 0), 12),
            (ChunkPos::new(0, 0), 13),
        ] {
            let colors = vec![family * 4; CHUNK_AREA];
            let update = ChunkUpdate::full_chunk(pos, colors, 1).expect("full chunk");
            apply_update(&mut world, &update).expect("merge");
        }

        // centered on the corner: window rows 0..63 come from z chunk -1
        let mut buf = WindowBuffer::new(128, 128);
        sample(&world, 0, 0, &mut buf);

        assert_eq!(buf.pixel(0, 0), 40);
        assert_eq!(buf.pixel(127, 0), 44);
        assert_eq!(buf.pixel(0, 127), 48);
        assert_eq!(buf.pixel(127, 127), 52);

        // boundary pixels: last column/row of the negative chunks, first
        // of the positive ones
        assert_eq!(buf.pixel(63, 63), 40);
        assert_eq!(buf.pixel(64, 63), 44);
        assert_eq!(buf.pixel(63, 64), 48);
        assert_eq!(buf.pixel(64, 64), 52);
    }

    #[test]
    fn sampling_never_allocates_chunks() {
        let mut world = WorldMap::new();
        world
            .insert(ChunkPos::new(0, 0), MapChunk::new())
            .expect("in bounds");
        let mut buf = WindowBuffer::new(128, 128);
        sample(&world, 0, 0, &mut buf);
        assert_eq!(world.chunk_count(), 1);
    }

    #[test]
    fn footprint_enumeration_matches_alignment() {
        // aligned: exactly one chunk
        assert_eq!(
            chunks_covering(64, 64, 128, 128),
            vec![ChunkPos::new(0, 0)]
        );
        // centered on a corner: four
        assert_eq!(
            chunks_covering(0, 0, 128, 128),
            vec![
                ChunkPos::new(-1, -1),
                ChunkPos::new(0, -1),
                ChunkPos::new(-1, 0),
                ChunkPos::new(0, 0),
            ]
        );
        // offset along one axis only: two
        assert_eq!(
            chunks_covering(64, 32, 128, 128),
            vec![ChunkPos::new(0, -1), ChunkPos::new(0, 0)]
        );
        // a window larger than a chunk spans a 3x3 block
        assert_eq!(chunks_covering(64, 64, 256, 256).len(), 9);
    }
}
