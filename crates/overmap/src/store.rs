use std::collections::{HashMap, HashSet};

use crate::chunk::{ChunkPos, MapChunk};
use crate::config::WorldBounds;
use crate::error::{MapError, Result};

/// The sparse world raster: chunk coordinates to resident chunks.
///
/// Absent chunks are unexplored territory and read as fully transparent.
/// The map itself does no I/O and no locking; `MapSession` wraps it in a
/// mutex and brings chunks in and out of durable storage.
pub struct WorldMap {
    pub chunks: HashMap<ChunkPos, MapChunk>,
    bounds: Option<WorldBounds>,
    pending_dirty: Vec<ChunkPos>,
    pending_dirty_set: HashSet<ChunkPos>,
}

impl WorldMap {
    pub fn new() -> Self {
        Self::with_bounds(None)
    }

    pub fn with_bounds(bounds: Option<WorldBounds>) -> Self {
        Self {
            chunks: HashMap::new(),
            bounds,
            pending_dirty: Vec::new(),
            pending_dirty_set: HashSet::new(),
        }
    }

    pub fn bounds(&self) -> Option<WorldBounds> {
        self.bounds
    }

    pub fn in_bounds(&self, pos: ChunkPos) -> bool {
        match self.bounds {
            Some(bounds) => bounds.contains(pos),
            None => true,
        }
    }

    pub fn get(&self, pos: ChunkPos) -> Option<&MapChunk> {
        self.chunks.get(&pos)
    }

    pub fn get_mut(&mut self, pos: ChunkPos) -> Option<&mut MapChunk> {
        self.chunks.get_mut(&pos)
    }

    /// Resident chunk at `pos`, allocating a fresh all-transparent one on
    /// first touch. Rejects positions outside the configured bounds.
    pub fn get_or_create(&mut self, pos: ChunkPos) -> Result<&mut MapChunk> {
        if !self.in_bounds(pos) {
            return Err(MapError::OutOfBounds { pos });
        }
        Ok(self.chunks.entry(pos).or_insert_with(MapChunk::new))
    }

    /// Insert a pre-built chunk at the given position, replacing any
    /// resident one, and queue the position for consumers.
    pub fn insert(&mut self, pos: ChunkPos, chunk: MapChunk) -> Result<()> {
        if !self.in_bounds(pos) {
            return Err(MapError::OutOfBounds { pos });
        }
        self.chunks.insert(pos, chunk);
        self.mark_dirty(pos);
        Ok(())
    }

    pub fn contains(&self, pos: ChunkPos) -> bool {
        self.chunks.contains_key(&pos)
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Queue a chunk position for the next `drain_dirty` consumer poll.
    /// Marks coalesce: a position queued twice between drains is reported
    /// once, in first-marked order.
    pub fn mark_dirty(&mut self, pos: ChunkPos) {
        if self.pending_dirty_set.insert(pos) {
            self.pending_dirty.push(pos);
        }
    }

    /// Return every position marked since the previous drain and clear
    /// the queue.
    pub fn drain_dirty(&mut self) -> Vec<ChunkPos> {
        self.pending_dirty_set.clear();
        std::mem::take(&mut self.pending_dirty)
    }

    pub fn any_dirty(&self) -> bool {
        self.chunks.values().any(|c| c.dirty)
    }
}

impl Default for WorldMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::CHUNK_AREA;

    #[test]
    fn get_never_creates() {
        let mut world = WorldMap::new();
        assert!(world.get(ChunkPos::new(1, 1)).is_none());
        assert_eq!(world.chunk_count(), 0);

        world.get_or_create(ChunkPos::new(1, 1)).expect("in bounds");
        assert_eq!(world.chunk_count(), 1);
        assert!(world.get(ChunkPos::new(1, 1)).is_some());
    }

    #[test]
    fn bounds_reject_creation_outside_the_box() {
        let mut world = WorldMap::with_bounds(Some(WorldBounds::new(-1, -1, 1, 1)));
        assert!(world.get_or_create(ChunkPos::new(0, 0)).is_ok());
        let err = world.get_or_create(ChunkPos::new(2, 0)).unwrap_err();
        assert!(matches!(err, MapError::OutOfBounds { .. }));
        assert!(world
            .insert(ChunkPos::new(0, -2), MapChunk::new())
            .is_err());
    }

    #[test]
    fn drain_reports_each_marked_position_once() {
        let mut world = WorldMap::new();
        let a = ChunkPos::new(0, 0);
        let b = ChunkPos::new(3, -1);
        let c = ChunkPos::new(-7, 2);
        for pos in [a, b, a, c, b, a] {
            world.mark_dirty(pos);
        }
        assert_eq!(world.drain_dirty(), vec![a, b, c]);
        assert!(world.drain_dirty().is_empty());

        // marks after a drain are not lost
        world.mark_dirty(b);
        assert_eq!(world.drain_dirty(), vec![b]);
    }

    #[test]
    fn insert_queues_the_position() {
        let mut world = WorldMap::new();
        let pos = ChunkPos::new(5, 5);
        let mut colors = Box::new([0u8; CHUNK_AREA]);
        colors[0] = 16;
        world
            .insert(pos, MapChunk::from_raster(colors, 4, 0))
            .expect("in bounds");
        assert_eq!(world.drain_dirty(), vec![pos]);
        assert_eq!(world.get(pos).expect("resident").sequence, 4);
    }
}
