//! The refresh scheduler.
//!
//! A service value owned by the application context: a min-heap of
//! `(next_refresh_time, table_key)` drained by a background worker thread.
//! The worker fires `refresh_table(key, evict = false)` on due tables,
//! updates the catalog bookkeeping, and re-inserts interval tables.
//! Errors during a scheduled refresh are logged and swallowed so stale
//! cached data stays usable.

use crate::manager::ForeignStorageMgr;
use crate::refresh::epoch_now;
use parking_lot::{Condvar, Mutex};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use strata_catalog::Catalog;
use strata_common::ChunkKey;
use tracing::{debug, info, warn};

/// Default worker sleep granularity
pub const DEFAULT_WAIT_DURATION_MS: u64 = 5_000;

#[derive(Default)]
struct SchedulerState {
    queue: BinaryHeap<Reverse<(i64, ChunkKey)>>,
}

/// Fires table refreshes at wall-clock deadlines
pub struct RefreshScheduler {
    catalog: Arc<Catalog>,
    mgr: Arc<ForeignStorageMgr>,
    state: Mutex<SchedulerState>,
    wakeup: Condvar,
    running: AtomicBool,
    has_refreshed_table: AtomicBool,
    wait_duration_ms: AtomicU64,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl RefreshScheduler {
    pub fn new(catalog: Arc<Catalog>, mgr: Arc<ForeignStorageMgr>) -> Arc<Self> {
        Arc::new(Self {
            catalog,
            mgr,
            state: Mutex::new(SchedulerState::default()),
            wakeup: Condvar::new(),
            running: AtomicBool::new(false),
            has_refreshed_table: AtomicBool::new(false),
            wait_duration_ms: AtomicU64::new(DEFAULT_WAIT_DURATION_MS),
            worker: Mutex::new(None),
        })
    }

    /// Spawn the worker. `program_running` is the process-wide liveness
    /// flag; the worker exits when it goes false or `stop` is called.
    pub fn start(self: &Arc<Self>, program_running: Arc<AtomicBool>) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        self.running.store(true, Ordering::Release);

        // Seed the queue from scheduled tables known to the catalog
        {
            let mut state = self.state.lock();
            state.queue.clear();
            self.catalog.for_each_table(|table| {
                if table.is_scheduled() {
                    if let Some(next) = table.refresh_times().next_refresh_time {
                        state.queue.push(Reverse((next, table.table_key())));
                    }
                }
            });
            debug!("scheduler seeded with {} tables", state.queue.len());
        }

        let this = Arc::clone(self);
        *worker = Some(thread::spawn(move || this.worker_loop(program_running)));
        info!("refresh scheduler started");
    }

    /// Cooperative shutdown; joins the worker
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.wakeup.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        info!("refresh scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Register a deadline for a table (e.g. right after CREATE)
    pub fn schedule_table(&self, table_key: ChunkKey, when: i64) {
        self.state.lock().queue.push(Reverse((when, table_key)));
        self.wakeup.notify_all();
    }

    /// One-shot observable for test synchronization: set after any
    /// successful scheduled refresh
    pub fn has_refreshed_table(&self) -> bool {
        self.has_refreshed_table.load(Ordering::Acquire)
    }

    pub fn reset_has_refreshed_table(&self) {
        self.has_refreshed_table.store(false, Ordering::Release);
    }

    /// Worker sleep granularity; tests set this to ~1 ms
    pub fn set_wait_duration(&self, ms: u64) {
        self.wait_duration_ms.store(ms.max(1), Ordering::Release);
        self.wakeup.notify_all();
    }

    fn worker_loop(self: Arc<Self>, program_running: Arc<AtomicBool>) {
        while self.running.load(Ordering::Acquire) && program_running.load(Ordering::Acquire) {
            let due_tables = {
                let mut state = self.state.lock();
                let now = epoch_now();
                let mut due = Vec::new();
                while state
                    .queue
                    .peek()
                    .is_some_and(|Reverse((when, _))| *when <= now)
                {
                    let Reverse((_, table_key)) =
                        state.queue.pop().expect("peeked entry exists");
                    due.push(table_key);
                }
                due
            };

            for table_key in due_tables {
                self.refresh_due_table(&table_key);
            }

            let wait = self.next_wait();
            let mut state = self.state.lock();
            if !self.running.load(Ordering::Acquire) {
                break;
            }
            self.wakeup.wait_for(&mut state, wait);
        }
        self.running.store(false, Ordering::Release);
    }

    /// Time to sleep before re-checking deadlines: the configured
    /// granularity, shortened when the earliest entry is due sooner
    fn next_wait(&self) -> Duration {
        let granularity = Duration::from_millis(self.wait_duration_ms.load(Ordering::Acquire));
        let state = self.state.lock();
        match state.queue.peek() {
            Some(Reverse((when, _))) => {
                let until_due = (*when - epoch_now()).max(0) as u64;
                granularity.min(Duration::from_secs(until_due).max(Duration::from_millis(1)))
            }
            None => granularity,
        }
    }

    /// Fire one due refresh. Overdue deadlines are not coalesced: one
    /// firing, and the next occurrence is computed from now.
    fn refresh_due_table(&self, table_key: &ChunkKey) {
        match self.mgr.refresh_table(table_key, false) {
            Ok(()) => {
                let now = epoch_now();
                if let Ok(table) = self
                    .catalog
                    .get_foreign_table(table_key.db_id(), table_key.table_id())
                {
                    table.set_last_refresh_time(now);
                }
                self.has_refreshed_table.store(true, Ordering::Release);
                debug!("scheduled refresh completed for table prefix {table_key}");
            }
            Err(e) => {
                // Swallow: a failing scan must not take the scheduler down,
                // and stale cached data remains usable
                warn!("scheduled refresh failed for table prefix {table_key}: {e}");
            }
        }

        // Reschedule interval tables regardless of the outcome
        if let Ok(table) = self
            .catalog
            .get_foreign_table(table_key.db_id(), table_key.table_id())
        {
            match table.refresh.interval_secs {
                Some(interval) => {
                    let next = epoch_now() + interval;
                    table.set_next_refresh_time(Some(next));
                    self.state
                        .lock()
                        .queue
                        .push(Reverse((next, table_key.clone())));
                }
                None => table.set_next_refresh_time(None),
            }
        }
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        self.wakeup.notify_all();
        if let Some(handle) = self.worker.get_mut().take() {
            let _ = handle.join();
        }
    }
}
