//! Cross-thread heap statistics registry.
//!
//! Each worker thread allocates and frees `gab_obj`s independently; this
//! registry gives the `gab run --dump` / diagnostics path a cheap way to
//! read aggregate heap activity without contending with the hot allocation
//! path. Each thread claims one exclusive slot and only ever writes its own
//! slot with plain atomic stores; readers (diagnostics) scan every slot.
//!
//! # Design
//!
//! The challenge: heap activity is generated per-worker, but reporting runs
//! from the CLI or a diagnostics thread. A global registry where each thread
//! owns an exclusive slot lets writers stay lock-free and readers do a single
//! scan.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// Maximum number of worker threads we can track (generously above the
/// scheduler's default `jobs` count plus the GC thread).
const MAX_THREADS: usize = 64;

/// Heap activity counters for a single thread.
#[derive(Debug)]
pub struct HeapSlot {
    /// Thread ID (0 = slot is free).
    pub thread_id: AtomicU64,
    /// Lifetime count of objects allocated on this thread.
    pub allocated: AtomicU64,
    /// Lifetime count of objects this thread's `Collector` has destroyed,
    /// whether by immediate RC drop or cycle collection.
    pub destroyed: AtomicU64,
    /// Number of `collect_cycles` passes run on this thread.
    pub cycle_collections: AtomicU64,
}

impl HeapSlot {
    const fn new() -> Self {
        Self {
            thread_id: AtomicU64::new(0),
            allocated: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
            cycle_collections: AtomicU64::new(0),
        }
    }
}

/// Global registry for cross-thread heap statistics.
pub struct HeapStatsRegistry {
    slots: Box<[HeapSlot]>,
    /// Count of threads that couldn't get a slot.
    pub overflow_count: AtomicU64,
}

impl HeapStatsRegistry {
    fn new(capacity: usize) -> Self {
        let slots: Vec<HeapSlot> = (0..capacity).map(|_| HeapSlot::new()).collect();
        Self { slots: slots.into_boxed_slice(), overflow_count: AtomicU64::new(0) }
    }

    /// Register the current thread and return its slot index, or `None` if
    /// the registry is full (the thread's stats simply go untracked).
    pub fn register(&self) -> Option<usize> {
        let thread_id = current_thread_id();
        for (idx, slot) in self.slots.iter().enumerate() {
            if slot.thread_id.compare_exchange(0, thread_id, Ordering::AcqRel, Ordering::Relaxed).is_ok() {
                return Some(idx);
            }
        }
        self.overflow_count.fetch_add(1, Ordering::Relaxed);
        None
    }

    #[inline]
    pub fn record_alloc(&self, slot_idx: usize) {
        if let Some(slot) = self.slots.get(slot_idx) {
            slot.allocated.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_destroyed(&self, slot_idx: usize, count: u64) {
        if let Some(slot) = self.slots.get(slot_idx) {
            slot.destroyed.fetch_add(count, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_cycle_collection(&self, slot_idx: usize) {
        if let Some(slot) = self.slots.get(slot_idx) {
            slot.cycle_collections.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn aggregate(&self) -> AggregateHeapStats {
        let mut out = AggregateHeapStats::default();
        for slot in self.slots.iter() {
            if slot.thread_id.load(Ordering::Acquire) > 0 {
                out.active_threads += 1;
                out.total_allocated += slot.allocated.load(Ordering::Relaxed);
                out.total_destroyed += slot.destroyed.load(Ordering::Relaxed);
                out.total_cycle_collections += slot.cycle_collections.load(Ordering::Relaxed);
            }
        }
        out.overflow_count = self.overflow_count.load(Ordering::Relaxed);
        out
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AggregateHeapStats {
    pub active_threads: usize,
    pub total_allocated: u64,
    pub total_destroyed: u64,
    pub total_cycle_collections: u64,
    pub overflow_count: u64,
}

impl AggregateHeapStats {
    pub fn live(&self) -> u64 {
        self.total_allocated.saturating_sub(self.total_destroyed)
    }
}

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THIS_THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

fn current_thread_id() -> u64 {
    THIS_THREAD_ID.with(|&id| id)
}

static HEAP_STATS_REGISTRY: OnceLock<HeapStatsRegistry> = OnceLock::new();

pub fn heap_stats_registry() -> &'static HeapStatsRegistry {
    HEAP_STATS_REGISTRY.get_or_init(|| HeapStatsRegistry::new(MAX_THREADS))
}

thread_local! {
    static SLOT_INDEX: std::cell::Cell<Option<usize>> = const { std::cell::Cell::new(None) };
}

/// Get or register the current thread's slot index.
pub fn get_or_register_slot() -> Option<usize> {
    SLOT_INDEX.with(|cell| {
        if let Some(idx) = cell.get() {
            Some(idx)
        } else {
            let idx = heap_stats_registry().register();
            cell.set(idx);
            idx
        }
    })
}

#[inline]
pub fn record_alloc() {
    if let Some(idx) = get_or_register_slot() {
        heap_stats_registry().record_alloc(idx);
    }
}

#[inline]
pub fn record_destroyed(count: u64) {
    if let Some(idx) = get_or_register_slot() {
        heap_stats_registry().record_destroyed(idx, count);
    }
}

#[inline]
pub fn record_cycle_collection() {
    if let Some(idx) = get_or_register_slot() {
        heap_stats_registry().record_cycle_collection(idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_aggregates_across_slots() {
        let registry = HeapStatsRegistry::new(4);
        let a = registry.register().unwrap();
        let b = registry.register().unwrap();
        registry.record_alloc(a);
        registry.record_alloc(a);
        registry.record_alloc(b);
        registry.record_destroyed(a, 1);

        let stats = registry.aggregate();
        assert_eq!(stats.active_threads, 2);
        assert_eq!(stats.total_allocated, 3);
        assert_eq!(stats.total_destroyed, 1);
        assert_eq!(stats.live(), 2);
    }

    #[test]
    fn thread_local_slot_is_cached() {
        let slot1 = get_or_register_slot();
        let slot2 = get_or_register_slot();
        assert_eq!(slot1, slot2);
    }

    #[test]
    fn concurrent_registration_is_thread_safe() {
        use std::thread;

        let handles: Vec<_> = (0..4)
            .map(|_| {
                thread::spawn(|| {
                    let slot = get_or_register_slot();
                    if slot.is_some() {
                        record_alloc();
                        record_alloc();
                    }
                    slot.is_some()
                })
            })
            .collect();

        let registered = handles.into_iter().map(|h| h.join().unwrap()).filter(|b| *b).count();
        assert!(registered <= 4);
    }
}
