//! Owning handle for one world's map over a session's lifetime.
//!
//! `MapSession` wires the in-memory `WorldMap` to its durable storage:
//! it serializes all access behind a mutex, pre-faults chunk records
//! ahead of windowed reads so the per-frame query path never touches the
//! disk, and runs a background thread that flushes dirty chunks on an
//! interval. Flush failures are logged and retried with backoff, never
//! surfaced to the merge or query paths.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::chunk::{ChunkPos, MapChunk};
use crate::config::MapConfig;
use crate::error::Result;
use crate::persist::MapStorage;
use crate::store::WorldMap;
use crate::window;

const SHUTDOWN_POLL: Duration = Duration::from_millis(200);
const MAX_BACKOFF_MULTIPLIER: u32 = 8;

#[derive(Clone, Copy, Debug, Default)]
pub struct FlushReport {
    pub saved: usize,
    pub failed: usize,
}

pub struct MapSession {
    world: Arc<Mutex<WorldMap>>,
    storage: Arc<MapStorage>,
    shutdown: Arc<AtomicBool>,
    flush_thread: Option<JoinHandle<()>>,
}

impl MapSession {
    /// Open (or create) the world save named by `config` and start the
    /// periodic flush thread.
    pub fn open(config: MapConfig) -> Result<Self> {
        let storage = Arc::new(MapStorage::open(config.root.clone())?);
        let world = Arc::new(Mutex::new(WorldMap::with_bounds(config.bounds)));
        let shutdown = Arc::new(AtomicBool::new(false));
        let flush_thread = spawn_flush_thread(
            Arc::clone(&world),
            Arc::clone(&storage),
            Arc::clone(&shutdown),
            config.save_interval_secs,
        );
        log::info!("opened world map session at {}", config.root.display());
        Ok(Self {
            world,
            storage,
            shutdown,
            flush_thread: Some(flush_thread),
        })
    }

    /// Shared handle to the world, for consumers living on other threads.
    pub fn world(&self) -> Arc<Mutex<WorldMap>> {
        Arc::clone(&self.world)
    }

    pub fn lock_world(&self) -> MutexGuard<'_, WorldMap> {
        self.world.lock().expect("world map lock poisoned")
    }

    pub fn storage(&self) -> &MapStorage {
        &self.storage
    }

    /// Bring every persisted chunk covering the given window into
    /// residency, so a following `window::sample` sees it without any
    /// I/O. Corrupt records are dropped and regenerate from future
    /// updates. Returns how many chunks were brought in.
    pub fn ensure_window_resident(
        &self,
        center_x: i32,
        center_z: i32,
        width: u32,
        height: u32,
    ) -> Result<usize> {
        let mut loaded = 0usize;
        for pos in window::chunks_covering(center_x, center_z, width, height) {
            {
                let world = self.lock_world();
                if world.contains(pos) || !world.in_bounds(pos) {
                    continue;
                }
            }
            match self.storage.load_chunk(pos) {
                Ok(Some(chunk)) => {
                    // the lock was dropped during the read; an update may
                    // have created the chunk in the meantime and the
                    // merged state wins over the persisted one
                    let mut world = self.lock_world();
                    if !world.contains(pos) {
                        world.insert(pos, chunk)?;
                        loaded += 1;
                    }
                }
                Ok(None) => {}
                Err(error) if error.is_corrupt_record() => {
                    log::warn!("dropping unreadable chunk record: {error}");
                }
                Err(error) => return Err(error),
            }
        }
        Ok(loaded)
    }

    /// Persist every dirty chunk now. Failed chunks stay dirty and are
    /// retried on the next cycle.
    pub fn flush(&self) -> FlushReport {
        flush_once(&self.world, &self.storage)
    }

    /// Stop the flush thread and run one final flush.
    pub fn close(mut self) -> FlushReport {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.flush_thread.take() {
            let _ = handle.join();
        }
        let report = flush_once(&self.world, &self.storage);
        log::info!(
            "closed world map session ({} chunks flushed, {} failed)",
            report.saved,
            report.failed
        );
        report
    }
}

impl Drop for MapSession {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.flush_thread.take() {
            let _ = handle.join();
        }
    }
}

fn flush_once(world: &Mutex<WorldMap>, storage: &MapStorage) -> FlushReport {
    // Snapshot dirty chunks under the lock, write them outside it so
    // merges and window reads are never gated on disk I/O.
    let dirty: Vec<(ChunkPos, MapChunk)> = {
        let mut world = world.lock().expect("world map lock poisoned");
        world
            .chunks
            .iter_mut()
            .filter(|(_, chunk)| chunk.dirty)
            .map(|(&pos, chunk)| {
                chunk.dirty = false;
                (pos, chunk.clone())
            })
            .collect()
    };

    let mut report = FlushReport::default();
    for (pos, chunk) in &dirty {
        match storage.save_chunk(*pos, chunk) {
            Ok(()) => report.saved += 1,
            Err(error) => {
                report.failed += 1;
                log::warn!("failed to persist chunk {pos:?}: {error}");
                let mut world = world.lock().expect("world map lock poisoned");
                if let Some(resident) = world.get_mut(*pos) {
                    resident.dirty = true;
                }
            }
        }
    }
    if report.saved > 0 {
        if let Err(error) = storage.touch_manifest() {
            log::warn!("failed to update world manifest: {error}");
        }
    }
    report
}

fn spawn_flush_thread(
    world: Arc<Mutex<WorldMap>>,
    storage: Arc<MapStorage>,
    shutdown: Arc<AtomicBool>,
    interval_secs: u64,
) -> JoinHandle<()> {
    let base = Duration::from_secs(interval_secs.max(1));
    thread::spawn(move || {
        let mut multiplier = 1u32;
        loop {
            let target = base * multiplier;
            let mut waited = Duration::ZERO;
            while waited < target {
                if shutdown.load(Ordering::Relaxed) {
                    return;
                }
                thread::sleep(SHUTDOWN_POLL);
                waited += SHUTDOWN_POLL;
            }
            if shutdown.load(Ordering::Relaxed) {
                return;
            }

            let report = flush_once(&world, &storage);
            if report.failed > 0 {
                multiplier = (multiplier * 2).min(MAX_BACKOFF_MULTIPLIER);
                log::warn!(
                    "flush cycle left {} chunks unsaved, retrying in {:?}",
                    report.failed,
                    base * multiplier
                );
            } else {
                if report.saved > 0 {
                    log::debug!("flushed {} chunks", report.saved);
                }
                multiplier = 1;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::{apply_update, ChunkUpdate};
    use crate::window::WindowBuffer;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicU64;

    static TEST_UNIQUIFIER: AtomicU64 = AtomicU64::new(0);

    fn test_config(name: &str) -> MapConfig {
        let serial = TEST_UNIQUIFIER.fetch_add(1, Ordering::Relaxed);
        let mut root = std::env::temp_dir();
        root.push(format!(
            "overmap-session-{name}-{}-{}",
            std::process::id(),
            serial
        ));
        let _ = std::fs::remove_dir_all(&root);
        let mut config = MapConfig::with_defaults(root);
        // keep the background thread out of the way; tests flush by hand
        config.save_interval_secs = 3600;
        config
    }

    fn solid_update(pos: ChunkPos, color: u8, sequence: u64) -> ChunkUpdate {
        ChunkUpdate {
            pos,
            x: 0,
            z: 0,
            width: 8,
            height: 8,
            colors: vec![color; 64],
            sequence,
        }
    }

    #[test]
    fn merged_data_survives_a_session_restart() {
        let config = test_config("restart");
        let root: PathBuf = config.root.clone();

        let session = MapSession::open(config).expect("open session");
        {
            let mut world = session.lock_world();
            apply_update(&mut world, &solid_update(ChunkPos::new(0, 0), 48, 3))
                .expect("merge");
        }
        let report = session.close();
        assert_eq!(report.saved, 1);
        assert_eq!(report.failed, 0);

        let mut config = MapConfig::with_defaults(root);
        config.save_interval_secs = 3600;
        let session = MapSession::open(config).expect("reopen session");
        assert_eq!(
            session
                .ensure_window_resident(4, 4, 8, 8)
                .expect("pre-fault"),
            1
        );

        let world = session.lock_world();
        let chunk = world.get(ChunkPos::new(0, 0)).expect("chunk resident");
        assert_eq!(chunk.colors[0], 48);
        assert_eq!(chunk.sequence, 3);
        assert!(!chunk.dirty);
    }

    #[test]
    fn flush_clears_dirty_flags_and_is_then_a_noop() {
        let session = MapSession::open(test_config("flush")).expect("open session");
        {
            let mut world = session.lock_world();
            apply_update(&mut world, &solid_update(ChunkPos::new(1, 1), 20, 1))
                .expect("merge");
            apply_update(&mut world, &solid_update(ChunkPos::new(2, 2), 24, 1))
                .expect("merge");
        }

        let report = session.flush();
        assert_eq!(report.saved, 2);
        assert!(!session.lock_world().any_dirty());

        let report = session.flush();
        assert_eq!(report.saved, 0);
    }

    #[test]
    fn prefault_loads_only_the_window_footprint() {
        let config = test_config("footprint");
        let root = config.root.clone();
        let session = MapSession::open(config).expect("open session");
        {
            let mut world = session.lock_world();
            for x in 0..4 {
                apply_update(&mut world, &solid_update(ChunkPos::new(x, 0), 16, 1))
                    .expect("merge");
            }
        }
        session.close();

        let mut config = MapConfig::with_defaults(root);
        config.save_interval_secs = 3600;
        let session = MapSession::open(config).expect("reopen session");
        // window over chunk (0,0) only
        session
            .ensure_window_resident(64, 64, 128, 128)
            .expect("pre-fault");
        let world = session.lock_world();
        assert!(world.contains(ChunkPos::new(0, 0)));
        assert!(!world.contains(ChunkPos::new(2, 0)));
    }

    #[test]
    fn corrupt_record_is_dropped_and_window_reads_transparent() {
        let config = test_config("corrupt");
        let pos = ChunkPos::new(0, 0);
        let session = MapSession::open(config).expect("open session");
        {
            let mut world = session.lock_world();
            apply_update(&mut world, &solid_update(pos, 32, 1)).expect("merge");
        }
        session.flush();
        std::fs::write(session.storage().chunk_path(pos), b"garbage").expect("stomp record");

        // evict by restarting on the same root
        let root = session.storage().root().to_path_buf();
        session.close();
        let mut config = MapConfig::with_defaults(root);
        config.save_interval_secs = 3600;
        let session = MapSession::open(config).expect("reopen session");

        assert_eq!(
            session
                .ensure_window_resident(64, 64, 128, 128)
                .expect("pre-fault"),
            0
        );
        let world = session.lock_world();
        assert!(!world.contains(pos));
        let mut buf = WindowBuffer::new(16, 16);
        window::sample(&world, 8, 8, &mut buf);
        assert!(buf.pixels().iter().all(|&c| c == 0));
    }

    #[test]
    fn consumers_see_marks_from_merges_and_prefaults() {
        let config = test_config("marks");
        let root = config.root.clone();
        let session = MapSession::open(config).expect("open session");
        {
            let mut world = session.lock_world();
            apply_update(&mut world, &solid_update(ChunkPos::new(0, 0), 16, 1))
                .expect("merge");
            assert_eq!(world.drain_dirty(), vec![ChunkPos::new(0, 0)]);
        }
        session.close();

        let mut config = MapConfig::with_defaults(root);
        config.save_interval_secs = 3600;
        let session = MapSession::open(config).expect("reopen session");
        session
            .ensure_window_resident(64, 64, 128, 128)
            .expect("pre-fault");
        // a freshly loaded chunk invalidates consumers too
        assert_eq!(
            session.lock_world().drain_dirty(),
            vec![ChunkPos::new(0, 0)]
        );
    }
}
