// SPDX-License-Identifier: GPL-2.0

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Instant;

use log::debug;
use log::warn;

use crate::affinity;
use crate::counters::CounterBlock;

/// Inner iterations per work cycle. A worker's total budget is
/// `m_cycles * INNER_ITERS` increments.
pub const INNER_ITERS: u64 = 1_000_000;

/// Optional per-iteration hook standing in for the privileged bus-stall
/// instruction pair of old I/O benchmarks. Not portable, so reduced to a
/// pluggable no-op.
pub type IoHook = fn();

fn io_stall() {
    std::hint::spin_loop();
}

/// Probe for raw I/O privilege. Only processes that can open the port device
/// read-write get the per-iteration hook.
pub fn detect_io_privilege() -> Option<IoHook> {
    match std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/port")
    {
        Ok(_) => Some(io_stall),
        Err(e) => {
            debug!("no raw I/O privilege ({}), hook disabled", e);
            None
        }
    }
}

/// Shared per-worker state, visible to both the worker thread and the main
/// thread while the run is in flight.
///
/// `progress` has a single writer (the worker) and is read with relaxed
/// loads by the monitor; a stale value is acceptable there. `active` may be
/// cleared by the main thread to request cancellation, and is always cleared
/// by the worker on exit. Only the worker ever sets `completed`.
pub struct WorkerHandle {
    pub index: usize,
    pub cpu: Option<usize>,
    active: AtomicBool,
    completed: AtomicBool,
    progress: AtomicU64,
}

impl WorkerHandle {
    pub fn new(index: usize, cpu: Option<usize>) -> Self {
        Self {
            index,
            cpu,
            active: AtomicBool::new(true),
            completed: AtomicBool::new(false),
            progress: AtomicU64::new(0),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Fuzzy read of the worker's progress counter.
    pub fn progress(&self) -> u64 {
        self.progress.load(Ordering::Relaxed)
    }

    /// Request cancellation. Only ever transitions active true -> false; the
    /// worker notices at the next outer-cycle boundary.
    pub fn cancel(&self) {
        self.active.store(false, Ordering::Relaxed);
    }
}

/// Worker thread body. Runs the full increment budget against one counter
/// slot unless cancelled, then reports its start/end timestamps back through
/// the thread's join value.
pub fn run(
    handle: &WorkerHandle,
    block: &CounterBlock,
    slot: usize,
    m_cycles: u32,
    io_hook: Option<IoHook>,
) -> (Instant, Instant) {
    if let Some(cpu) = handle.cpu {
        if affinity::bind_current(cpu) {
            debug!("worker {} bound to CPU {}", handle.index, cpu);
        } else {
            warn!(
                "worker {}: failed to bind to CPU {}, running unbound",
                handle.index, cpu
            );
        }
    }

    let ctr = block.slot(slot);
    let mut local: u64 = 0;
    let mut cancelled = false;

    let tic = Instant::now();
    for _ in 0..m_cycles {
        // Cancellation is only observed here, between cycles, so it never
        // perturbs the inner loop being measured.
        if !handle.is_active() {
            cancelled = true;
            break;
        }
        for _ in 0..INNER_ITERS {
            if let Some(hook) = io_hook {
                hook();
            }
            ctr.fetch_add(1, Ordering::Relaxed);
            local += 1;
            handle.progress.store(local, Ordering::Relaxed);
        }
    }
    let toc = Instant::now();

    if !cancelled {
        handle.completed.store(true, Ordering::Release);
    }
    handle.active.store(false, Ordering::Release);

    (tic, toc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_worker_runs_exact_budget() {
        let handle = WorkerHandle::new(0, None);
        let block = CounterBlock::new();

        let (tic, toc) = run(&handle, &block, 0, 2, None);

        assert_eq!(handle.progress(), 2 * INNER_ITERS);
        assert_eq!(block.value(0) as u64, 2 * INNER_ITERS);
        assert!(handle.is_completed());
        assert!(!handle.is_active());
        assert!(toc >= tic);
    }

    #[test]
    fn test_cancelled_worker_exits_early() {
        let handle = WorkerHandle::new(0, None);
        let block = CounterBlock::new();

        handle.cancel();
        run(&handle, &block, 0, 1000, None);

        assert_eq!(handle.progress(), 0);
        assert!(!handle.is_completed());
        assert!(!handle.is_active());
    }

    #[test]
    fn test_shared_slot_increments_are_race_free() {
        let block = Arc::new(CounterBlock::new());
        let nthreads = 4;
        let handles: Vec<Arc<WorkerHandle>> = (0..nthreads)
            .map(|i| Arc::new(WorkerHandle::new(i, None)))
            .collect();

        let threads: Vec<_> = handles
            .iter()
            .map(|h| {
                let h = h.clone();
                let block = block.clone();
                std::thread::spawn(move || run(&h, &block, 0, 1, None))
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        // All four workers hit slot 0; no increment may be lost.
        assert_eq!(block.value(0) as u64, nthreads as u64 * INNER_ITERS);
        for h in &handles {
            assert!(h.is_completed());
            assert_eq!(h.progress(), INNER_ITERS);
        }
    }

    #[test]
    fn test_io_hook_does_not_change_totals() {
        let handle = WorkerHandle::new(0, None);
        let block = CounterBlock::new();

        run(&handle, &block, 0, 1, Some(io_stall));

        assert_eq!(block.value(0) as u64, INNER_ITERS);
        assert!(handle.is_completed());
    }
}
