//! Shared state between the tracking, local mapping and loop closing threads.
//!
//! The `SharedState` struct holds all data that needs to be accessed by
//! multiple threads, protected by appropriate synchronization primitives.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, warn};

use crate::atlas::Atlas;
use crate::atlas::MapIndex;
use crate::imu::{ImuBias, ImuQueue};

/// Inertial estimate handed back from the refiner to tracking.
#[derive(Debug, Clone, Copy)]
pub struct ImuUpdate {
    pub map_index: MapIndex,
    pub bias: ImuBias,
    /// Scale correction applied to the map; 1.0 when unchanged.
    pub scale: f64,
}

/// Background threads that take part in the reset handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Worker {
    LocalMapping,
    LoopClosing,
}

#[derive(Debug, Default)]
struct ResetState {
    /// Bumped on every reset request.
    generation: u64,
    in_progress: bool,
    acknowledged: HashMap<Worker, u64>,
}

/// Shared state accessible by all threads.
pub struct SharedState {
    /// The Atlas containing all maps, keyframes, and map points.
    pub atlas: RwLock<Atlas>,

    /// Inertial samples pushed by the producer, drained per frame by tracking.
    pub imu_queue: ImuQueue,

    /// Raised by the refiner after structural map edits; consumed by tracking.
    map_updated: AtomicBool,

    /// True while the refiner waits for work.
    refiner_idle: AtomicBool,

    /// Request background threads to finish processing and exit.
    shutdown_requested: AtomicBool,

    imu_update: Mutex<Option<ImuUpdate>>,

    reset: Mutex<ResetState>,
    reset_cvar: Condvar,
}

impl SharedState {
    /// Create a new SharedState with an empty Atlas.
    pub fn new(scale_factor: f64, num_levels: usize) -> Arc<Self> {
        Arc::new(Self {
            atlas: RwLock::new(Atlas::new(scale_factor, num_levels)),
            imu_queue: ImuQueue::new(),
            map_updated: AtomicBool::new(false),
            refiner_idle: AtomicBool::new(true),
            shutdown_requested: AtomicBool::new(false),
            imu_update: Mutex::new(None),
            reset: Mutex::new(ResetState::default()),
            reset_cvar: Condvar::new(),
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Refiner signals
    // ─────────────────────────────────────────────────────────────────────────

    pub fn set_map_updated(&self) {
        self.map_updated.store(true, Ordering::SeqCst);
    }

    /// Read and clear the map-updated flag.
    pub fn take_map_updated(&self) -> bool {
        self.map_updated.swap(false, Ordering::SeqCst)
    }

    pub fn is_refiner_idle(&self) -> bool {
        self.refiner_idle.load(Ordering::SeqCst)
    }

    pub fn set_refiner_idle(&self, idle: bool) {
        self.refiner_idle.store(idle, Ordering::SeqCst);
    }

    /// Publish a new bias (and scale) for tracking to adopt.
    pub fn publish_imu_update(&self, update: ImuUpdate) {
        *self.imu_update.lock() = Some(update);
    }

    pub fn take_imu_update(&self) -> Option<ImuUpdate> {
        self.imu_update.lock().take()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Shutdown
    // ─────────────────────────────────────────────────────────────────────────

    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
        // Wake anyone blocked in the reset handshake.
        self.reset_cvar.notify_all();
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reset handshake
    // ─────────────────────────────────────────────────────────────────────────

    /// Start a reset. Returns the generation workers must acknowledge.
    pub fn request_reset(&self) -> u64 {
        let mut reset = self.reset.lock();
        reset.generation += 1;
        reset.in_progress = true;
        debug!("Reset {} requested", reset.generation);
        reset.generation
    }

    /// Generation of a reset `worker` has not acknowledged yet.
    pub fn pending_reset(&self, worker: Worker) -> Option<u64> {
        let reset = self.reset.lock();
        let acked = reset.acknowledged.get(&worker).copied().unwrap_or(0);
        (reset.in_progress && acked < reset.generation).then_some(reset.generation)
    }

    pub fn acknowledge_reset(&self, worker: Worker, generation: u64) {
        let mut reset = self.reset.lock();
        reset.acknowledged.insert(worker, generation);
        debug!("Reset {} acknowledged by {:?}", generation, worker);
        self.reset_cvar.notify_all();
    }

    /// Block until every worker in `workers` acknowledged `generation`.
    ///
    /// Returns false if shutdown was requested or `timeout` elapsed first.
    pub fn wait_for_reset_acks(&self, generation: u64, workers: &[Worker], timeout: Duration) -> bool {
        let mut reset = self.reset.lock();
        loop {
            let done = workers.iter().all(|w| {
                reset
                    .acknowledged
                    .get(w)
                    .is_some_and(|acked| *acked >= generation)
            });
            if done {
                return true;
            }
            if self.is_shutdown_requested() {
                return false;
            }
            if self.reset_cvar.wait_for(&mut reset, timeout).timed_out() {
                warn!("Reset {} not acknowledged within {:?}", generation, timeout);
                return false;
            }
        }
    }

    pub fn finish_reset(&self) {
        let mut reset = self.reset.lock();
        reset.in_progress = false;
        self.reset_cvar.notify_all();
    }

    pub fn is_reset_in_progress(&self) -> bool {
        self.reset.lock().in_progress
    }
}
