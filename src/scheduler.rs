//! JobScheduler - periodic background compaction and rollup.
//!
//! One thread wakes every `interval` and sweeps every store of a
//! [`StoreRegistry`]. A sweep runs each family's compaction and rollup in
//! turn, so at most one background job of a store runs at a time.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use tracing::{debug, error, info};

use crate::options::StoreOptions;
use crate::store::StoreRegistry;
use crate::{Error, Result};

/// Wakes the background thread early on shutdown.
struct StopSignal {
    stop: Mutex<bool>,
    cond: Condvar,
}

/// Periodically compacts the stores of a registry.
///
/// The background thread only holds a weak handle between sweeps, so
/// dropping the last handle stops it even without [`shutdown`](Self::shutdown).
pub struct JobScheduler {
    registry: Arc<StoreRegistry>,
    interval: Duration,
    /// Set between startup and shutdown.
    running: AtomicBool,
    signal: Arc<StopSignal>,
    thread_handle: Mutex<Option<JoinHandle<()>>>,
    /// Completed sweeps.
    ticks: AtomicU64,
    /// Error from the last failed sweep.
    last_error: RwLock<Option<Error>>,
}

impl JobScheduler {
    /// Create a stopped scheduler.
    pub fn new(registry: Arc<StoreRegistry>, interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            registry,
            interval,
            running: AtomicBool::new(false),
            signal: Arc::new(StopSignal {
                stop: Mutex::new(false),
                cond: Condvar::new(),
            }),
            thread_handle: Mutex::new(None),
            ticks: AtomicU64::new(0),
            last_error: RwLock::new(None),
        })
    }

    /// Create a stopped scheduler ticking at `options.compaction_check_interval`.
    pub fn with_options(registry: Arc<StoreRegistry>, options: &StoreOptions) -> Arc<Self> {
        Self::new(registry, options.compaction_check_interval)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of sweeps run so far.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    pub fn last_error(&self) -> Option<Error> {
        self.last_error.read().clone()
    }

    /// Start the background thread. Returns false if already running.
    pub fn startup(self: &Arc<Self>) -> Result<bool> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(false);
        }
        *self.signal.stop.lock() = false;

        let scheduler = Arc::downgrade(self);
        let signal = Arc::clone(&self.signal);
        let interval = self.interval;
        let spawned = thread::Builder::new()
            .name("tskv-scheduler".to_string())
            .spawn(move || Self::background_loop(scheduler, signal, interval));
        match spawned {
            Ok(handle) => {
                *self.thread_handle.lock() = Some(handle);
                info!(interval_ms = self.interval.as_millis() as u64, "job scheduler started");
                Ok(true)
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                Err(e.into())
            }
        }
    }

    /// Stop the background thread and wait for it to exit. A running sweep
    /// finishes first. Returns false if not running.
    pub fn shutdown(&self) -> bool {
        if self
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        {
            let mut stop = self.signal.stop.lock();
            *stop = true;
            self.signal.cond.notify_all();
        }

        if let Some(handle) = self.thread_handle.lock().take() {
            // The last handle may be released by the background thread itself.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        info!("job scheduler stopped");
        true
    }

    /// Sweep every registered store once.
    pub fn run_once(&self) -> Result<()> {
        let mut result = Ok(());
        for store in self.registry.stores() {
            if let Err(e) = store.compact() {
                error!(store = %store.path().display(), error = %e, "store sweep failed");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        self.ticks.fetch_add(1, Ordering::SeqCst);
        debug!(ticks = self.ticks(), "sweep finished");
        result
    }

    fn background_loop(scheduler: Weak<Self>, signal: Arc<StopSignal>, interval: Duration) {
        let mut stop = signal.stop.lock();
        while !*stop {
            signal.cond.wait_for(&mut stop, interval);
            if *stop {
                break;
            }
            let this = match scheduler.upgrade() {
                Some(this) => this,
                None => break,
            };
            MutexGuard::unlocked(&mut stop, move || {
                if let Err(e) = this.run_once() {
                    *this.last_error.write() = Some(e);
                }
            });
        }
    }
}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
