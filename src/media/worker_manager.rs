#![forbid(unsafe_code)]

// Worker pool management for the media engine

use crate::media::engine::{EngineWorker, MediaEngine, Subscription};
use crate::media::types::{MediaError, MediaResult};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Reaction to a worker death. Rooms cannot be migrated off a dead worker, so
/// the production handler terminates the process.
pub type FatalHandler = Arc<dyn Fn(WorkerDeath) + Send + Sync>;

/// Details of a worker that reported death
#[derive(Debug, Clone)]
pub struct WorkerDeath {
    pub worker_index: usize,
    pub worker_id: String,
    pub reason: String,
}

/// Handler that logs and exits with status 1, leaving restarts to a supervisor
pub fn exit_process() -> FatalHandler {
    Arc::new(|death: WorkerDeath| {
        error!(
            "Worker {} (index {}) died: {}, exiting...",
            death.worker_id, death.worker_index, death.reason
        );
        std::process::exit(1);
    })
}

/// Fixed pool of engine workers handed out round-robin
pub struct WorkerPool {
    workers: Vec<Arc<dyn EngineWorker>>,
    next_worker_idx: AtomicUsize,
    _death_watch: Vec<Subscription>,
}

impl WorkerPool {
    /// Creates `count` workers up front and arms the fatal handler on each.
    ///
    /// # Errors
    /// Returns an error if `count` is zero or any worker fails to start
    pub async fn initialize(
        engine: &dyn MediaEngine,
        count: usize,
        on_fatal: FatalHandler,
    ) -> MediaResult<Self> {
        if count == 0 {
            return Err(MediaError::Worker("worker count must be at least 1".to_string()));
        }
        info!("Creating {} media workers...", count);

        let mut workers = Vec::with_capacity(count);
        let mut death_watch = Vec::with_capacity(count);

        for i in 0..count {
            let worker = engine.create_worker(i).await?;
            let worker_id = worker.id();
            info!("Created worker {} with id: {}", i, worker_id);

            let on_fatal = on_fatal.clone();
            let subscription = worker.on_died(Box::new(move |reason| {
                on_fatal(WorkerDeath {
                    worker_index: i,
                    worker_id,
                    reason,
                });
            }));

            death_watch.push(subscription);
            workers.push(worker);
        }

        info!("Media workers created");
        Ok(Self {
            workers,
            next_worker_idx: AtomicUsize::new(0),
            _death_watch: death_watch,
        })
    }

    /// Returns the next worker in strict rotation, wrapping modulo pool size
    pub fn next_worker(&self) -> Arc<dyn EngineWorker> {
        let idx = self.next_worker_idx.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        debug!("Selected worker index {}", idx);
        self.workers[idx].clone()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Number of workers that still report themselves alive
    pub fn alive_count(&self) -> usize {
        self.workers.iter().filter(|w| w.is_alive()).count()
    }
}
