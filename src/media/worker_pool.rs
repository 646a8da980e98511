#![forbid(unsafe_code)]

// Fixed worker pool and least-loaded room placement

use crate::media::config::WorkerConfig;
use crate::media::types::{MediaError, MediaResult};
use mediasoup::prelude::*;
use mediasoup::worker_manager::WorkerManager;
use std::collections::HashMap;
use std::sync::RwLock as StdRwLock;
use tracing::{error, info};

/// Counters for one pool slot, recomputed from a scan of live rooms.
#[derive(Debug, Clone, Copy, Default)]
struct SlotCounters {
    participants: usize,
    rooms: usize,
}

/// Snapshot of one slot for the stats surface.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSlotStats {
    pub worker_index: usize,
    pub participant_count: usize,
    pub room_count: usize,
}

/// Fixed set of mediasoup workers, spawned once at startup.
///
/// New rooms land on the slot with the fewest participants; counters are
/// replaced from a room scan before every selection so they stay
/// self-correcting rather than drifting with bump/unbump bookkeeping.
pub struct WorkerPool {
    #[allow(dead_code)]
    manager: WorkerManager,
    workers: Vec<Worker>,
    counters: StdRwLock<Vec<SlotCounters>>,
}

impl WorkerPool {
    /// Spawns exactly `pool_size` workers. A partial pool is refused: any
    /// spawn failure aborts startup with `WorkerInit`.
    pub async fn start(config: &WorkerConfig) -> MediaResult<Self> {
        let size = config.pool_size.max(1);
        info!("starting worker pool with {} workers", size);

        let manager = WorkerManager::new();
        let mut workers = Vec::with_capacity(size);

        for index in 0..size {
            let worker = manager
                .create_worker(config.to_worker_settings())
                .await
                .map_err(|e| MediaError::WorkerInit(format!("worker {index}: {e}")))?;

            worker
                .on_dead(move |reason| {
                    error!("worker {} died: {:?}", index, reason);
                })
                .detach();

            info!("worker {} up with id {}", index, worker.id());
            workers.push(worker);
        }

        let counters = StdRwLock::new(vec![SlotCounters::default(); size]);

        Ok(Self {
            manager,
            workers,
            counters,
        })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Worker handle for a slot. Handles are cheap clones over the same
    /// underlying worker.
    pub fn worker(&self, index: usize) -> MediaResult<Worker> {
        self.workers
            .get(index)
            .cloned()
            .ok_or_else(|| MediaError::WorkerInit(format!("no worker slot {index}")))
    }

    /// Replaces all counters from `(worker_index, participant_count)` tuples
    /// of live rooms. Slots hosting no room are zeroed.
    pub fn refresh_counters(&self, rooms: &[(usize, usize)]) {
        let mut counters = self.counters.write().unwrap_or_else(|e| e.into_inner());
        counters.fill(SlotCounters::default());
        for &(worker_index, participant_count) in rooms {
            if let Some(slot) = counters.get_mut(worker_index) {
                slot.participants += participant_count;
                slot.rooms += 1;
            }
        }
    }

    /// Picks the slot with the fewest participants, ties broken by the
    /// smallest index. The chosen slot is provisionally bumped so that a
    /// selection made before the new room registers does not land on the
    /// same worker; the next refresh replaces the provisional value.
    pub fn pick_least_loaded(&self) -> usize {
        let mut counters = self.counters.write().unwrap_or_else(|e| e.into_inner());
        let index = counters
            .iter()
            .enumerate()
            .min_by_key(|(index, slot)| (slot.participants, *index))
            .map(|(index, _)| index)
            .unwrap_or(0);
        if let Some(slot) = counters.get_mut(index) {
            slot.participants += 1;
            slot.rooms += 1;
        }
        index
    }

    /// Snapshot keyed by worker id. The Rust mediasoup worker runs as an
    /// in-process thread, so the worker id stands in for an OS pid.
    pub fn stats(&self) -> HashMap<String, WorkerSlotStats> {
        let counters = self.counters.read().unwrap_or_else(|e| e.into_inner());
        self.workers
            .iter()
            .enumerate()
            .map(|(index, worker)| {
                let slot = counters.get(index).copied().unwrap_or_default();
                (
                    worker.id().to_string(),
                    WorkerSlotStats {
                        worker_index: index,
                        participant_count: slot.participants,
                        room_count: slot.rooms,
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pool_starts_all_workers() {
        let mut config = WorkerConfig::default();
        config.pool_size = 2;
        let pool = WorkerPool::start(&config).await.unwrap();
        assert_eq!(pool.size(), 2);
        assert_eq!(pool.stats().len(), 2);
    }

    #[tokio::test]
    async fn back_to_back_picks_spread_over_lowest_indices() {
        let mut config = WorkerConfig::default();
        config.pool_size = 3;
        let pool = WorkerPool::start(&config).await.unwrap();

        pool.refresh_counters(&[]);
        let first = pool.pick_least_loaded();
        let second = pool.pick_least_loaded();
        assert_eq!((first, second), (0, 1));
    }

    #[tokio::test]
    async fn selection_minimises_participant_count() {
        let mut config = WorkerConfig::default();
        config.pool_size = 3;
        let pool = WorkerPool::start(&config).await.unwrap();

        // worker 0 hosts a big room, worker 2 a small one, worker 1 nothing
        pool.refresh_counters(&[(0, 9), (2, 3)]);
        assert_eq!(pool.pick_least_loaded(), 1);

        pool.refresh_counters(&[(0, 9), (1, 5), (2, 3)]);
        assert_eq!(pool.pick_least_loaded(), 2);
    }

    #[tokio::test]
    async fn refresh_zeroes_abandoned_slots() {
        let mut config = WorkerConfig::default();
        config.pool_size = 2;
        let pool = WorkerPool::start(&config).await.unwrap();

        pool.refresh_counters(&[(1, 4)]);
        assert_eq!(pool.pick_least_loaded(), 0);

        pool.refresh_counters(&[]);
        let stats = pool.stats();
        assert!(stats.values().all(|s| s.participant_count == 0 && s.room_count == 0));
    }
}
