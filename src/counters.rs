// SPDX-License-Identifier: GPL-2.0

use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use log::warn;

/// Number of counter slots in the shared block.
pub const NR_SLOTS: usize = 1024;

/// Size of one counter slot in bytes.
pub const SLOT_SIZE: usize = std::mem::size_of::<u32>();

/// A fixed block of counters shared by all workers.
///
/// The block itself is aligned well past a cache line so that slot placement
/// is controlled entirely by the alignment stride: a stride of 0 puts every
/// worker on slot 0 (maximum contention), a stride of one cache line gives
/// each worker a private line, and anything in between aliases groups of
/// workers onto shared lines.
#[repr(align(256))]
pub struct CounterBlock {
    slots: [AtomicU32; NR_SLOTS],
}

impl CounterBlock {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| AtomicU32::new(0)),
        }
    }

    pub const fn capacity_bytes() -> usize {
        NR_SLOTS * SLOT_SIZE
    }

    pub fn slot(&self, idx: usize) -> &AtomicU32 {
        &self.slots[idx]
    }

    /// Fuzzy read of a slot's current value.
    pub fn value(&self, idx: usize) -> u32 {
        self.slots[idx].load(Ordering::Relaxed)
    }
}

/// Map a worker index to its counter slot for a given stride in bytes.
/// Strides smaller than a slot alias multiple workers onto one counter,
/// which is a supported experiment, not an error.
pub fn slot_index(worker_index: usize, align_stride: usize) -> usize {
    (worker_index * align_stride) / SLOT_SIZE
}

/// Largest alignment stride that keeps every worker's slot inside the block.
pub fn max_align_stride(nthreads: usize) -> usize {
    CounterBlock::capacity_bytes() / nthreads
}

/// Clamp a requested alignment stride so that slot assignment stays in
/// bounds for the given thread count. The block is partitioned by whole
/// bytes per thread; a clamped request is logged, not rejected.
pub fn clamp_align_stride(align_stride: usize, nthreads: usize) -> usize {
    let max = max_align_stride(nthreads);
    if align_stride > max {
        warn!(
            "alignment stride {} too large for {} threads, clamping to {}",
            align_stride, nthreads, max
        );
        return max;
    }
    align_stride
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_stride_aliases_slot_zero() {
        for i in 0..64 {
            assert_eq!(slot_index(i, 0), 0);
        }
    }

    #[test]
    fn test_cache_line_stride_separates_workers() {
        // 64-byte stride: one cache line (16 slots) apart per worker.
        assert_eq!(slot_index(0, 64), 0);
        assert_eq!(slot_index(1, 64), 16);
        assert_eq!(slot_index(2, 64), 32);
    }

    #[test]
    fn test_sub_slot_stride_groups_workers() {
        // A 2-byte stride packs two workers per counter.
        assert_eq!(slot_index(0, 2), 0);
        assert_eq!(slot_index(1, 2), 0);
        assert_eq!(slot_index(2, 2), 1);
        assert_eq!(slot_index(3, 2), 1);
    }

    #[test]
    fn test_clamp_keeps_worst_slot_in_bounds() {
        for nthreads in [1usize, 2, 3, 7, 64, 1000] {
            let stride = clamp_align_stride(usize::MAX, nthreads);
            let worst = slot_index(nthreads - 1, stride);
            assert!(
                worst < NR_SLOTS,
                "nthreads={} stride={} worst slot {}",
                nthreads,
                stride,
                worst
            );
        }
    }

    #[test]
    fn test_clamp_passes_small_strides_through() {
        assert_eq!(clamp_align_stride(64, 4), 64);
        assert_eq!(clamp_align_stride(0, 4), 0);
    }

    #[test]
    fn test_block_starts_zeroed() {
        let block = CounterBlock::new();
        assert_eq!(block.value(0), 0);
        assert_eq!(block.value(NR_SLOTS - 1), 0);
    }

    #[test]
    fn test_slot_accumulates() {
        let block = CounterBlock::new();
        block.slot(3).fetch_add(5, Ordering::Relaxed);
        block.slot(3).fetch_add(7, Ordering::Relaxed);
        assert_eq!(block.value(3), 12);
    }
}
