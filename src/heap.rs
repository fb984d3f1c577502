/*!

The shared heap, as seen from the escape engine.

The engine only needs to carve chunks out of the heap, keep them parseable,
tell the heap's bookkeeping about new objects, and read and write words. How
the heap is collected is its own business, except that a collection must
never start while a [`NoGcScope`] is alive.

[`ArenaHeap`] is a bump-allocated word arena with thread-local allocation
buffers, used by the C ABI and the tests.

*/

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{Result, SbaError};
use crate::object::{Mark, Shape};
use crate::stats::TELEMETRY;
use crate::tagged_pointer::Ref;

/* ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
 * GC exclusion
 * ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
 */

#[derive(Debug, Default)]
pub struct GcLocker {
    depth: AtomicUsize,
}

impl GcLocker {
    pub fn is_active(&self) -> bool {
        self.depth.load(Ordering::Acquire) > 0
    }

    /// Forbid collections until the returned guard is dropped.
    pub fn exclude(locker: &Arc<GcLocker>) -> NoGcScope {
        locker.depth.fetch_add(1, Ordering::AcqRel);
        NoGcScope {
            locker: Arc::clone(locker),
        }
    }
}

/// A region of code during which the heap must not collect.
pub struct NoGcScope {
    locker: Arc<GcLocker>,
}

impl Drop for NoGcScope {
    fn drop(&mut self) {
        self.locker.depth.fetch_sub(1, Ordering::AcqRel);
    }
}

/* ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
 * Heap interface
 * ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
 */

pub trait Heap {
    /// Fast path: allocate from the thread-local buffer. Never collects.
    fn allocate_chunk(&mut self, words: usize) -> Option<usize>;

    /// Slow path. May collect, so any address not held in a root may be
    /// stale afterwards.
    fn allocate(&mut self, words: usize) -> Result<usize>;

    /// The largest request `allocate_chunk` can satisfy.
    fn max_chunk_words(&self) -> usize;

    /// Make `[addr, addr + words)` walkable as a single filler object.
    fn fill(&mut self, addr: usize, words: usize);

    /// Tell the heap's bookkeeping an object now lives at `addr`.
    fn mark_new_object(&mut self, addr: usize);

    fn word(&self, addr: usize) -> u64;

    fn set_word(&mut self, addr: usize, w: u64);

    fn copy_in(&mut self, addr: usize, words: &[u64]) {
        for (i, w) in words.iter().enumerate() {
            self.set_word(addr + i, *w);
        }
    }

    /// Collections so far. An escape compares this before and after
    /// allocating its chunks.
    fn total_collections(&self) -> u64;

    fn gc_locker(&self) -> &Arc<GcLocker>;
}

/// Allocate and initialize a heap object.
pub fn new_heap_object(heap: &mut dyn Heap, shape: Shape) -> Result<Ref> {
    let words = shape.body_words();
    let addr = match heap.allocate_chunk(words) {
        Some(addr) => addr,
        None => heap.allocate(words)?,
    };
    heap.set_word(addr, shape.mark().raw());
    for i in 1..words {
        heap.set_word(addr + i, 0);
    }
    heap.mark_new_object(addr);
    TELEMETRY.record_allocation(None, words);
    Ok(Ref::heap(addr))
}

/* ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
 * Arena heap
 * ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
 */

/// Bump-allocated word arena. Address 0 is never handed out.
pub struct ArenaHeap {
    words: Vec<u64>,
    top: usize,
    tlab_words: usize,
    tlab_top: usize,
    tlab_end: usize,
    collections: u64,
    /// Pretend to collect on every n-th slow-path allocation.
    collect_every: Option<u64>,
    slow_allocations: u64,
    new_objects: Vec<usize>,
    locker: Arc<GcLocker>,
}

impl ArenaHeap {
    pub fn new(capacity: usize, tlab_words: usize) -> ArenaHeap {
        debug_assert!(tlab_words >= 2);
        ArenaHeap {
            words: vec![0; capacity],
            top: 1,
            tlab_words,
            tlab_top: 1,
            tlab_end: 1,
            collections: 0,
            collect_every: None,
            slow_allocations: 0,
            new_objects: Vec::new(),
            locker: Arc::new(GcLocker::default()),
        }
    }

    /// Count a collection on every `n`-th slow-path allocation.
    pub fn collect_every(mut self, n: u64) -> ArenaHeap {
        self.collect_every = Some(n);
        self
    }

    pub fn used(&self) -> usize {
        self.top
    }

    pub fn new_objects(&self) -> &[usize] {
        &self.new_objects
    }

    fn retire_tlab(&mut self) {
        if self.tlab_top < self.tlab_end {
            let (top, end) = (self.tlab_top, self.tlab_end);
            self.fill(top, end - top);
        }
        self.tlab_top = self.top;
        self.tlab_end = self.top;
    }

    fn bump(&mut self, words: usize) -> Option<usize> {
        if self.top + words > self.words.len() {
            return None;
        }
        let addr = self.top;
        self.top += words;
        Some(addr)
    }

    /// Every object from the bottom of the arena to the top, skipping the
    /// unused tail of the current buffer.
    pub fn objects(&self) -> Vec<usize> {
        let mut out = Vec::new();
        let mut addr = 1;
        while addr < self.top {
            if addr == self.tlab_top && self.tlab_top < self.tlab_end {
                addr = self.tlab_end;
                continue;
            }
            let size = Mark::from_raw(self.words[addr]).size();
            assert!(size > 0, "unparseable heap word at {:#x}", addr);
            out.push(addr);
            addr += size;
        }
        out
    }
}

impl Heap for ArenaHeap {
    fn allocate_chunk(&mut self, words: usize) -> Option<usize> {
        if words > self.tlab_words {
            return None;
        }
        if self.tlab_top + words > self.tlab_end {
            self.retire_tlab();
            let start = self.bump(self.tlab_words)?;
            self.tlab_top = start;
            self.tlab_end = start + self.tlab_words;
        }
        let addr = self.tlab_top;
        self.tlab_top += words;
        Some(addr)
    }

    fn allocate(&mut self, words: usize) -> Result<usize> {
        self.slow_allocations += 1;
        if let Some(n) = self.collect_every {
            if self.slow_allocations % n == 0 {
                assert!(
                    !self.locker.is_active(),
                    "heap collection inside a no-GC scope"
                );
                self.collections += 1;
                tracing::debug!(collections = self.collections, "heap collection");
            }
        }
        self.retire_tlab();
        let addr = self.bump(words).ok_or(SbaError::OutOfMemory { words })?;
        self.tlab_top = self.top;
        self.tlab_end = self.top;
        Ok(addr)
    }

    fn max_chunk_words(&self) -> usize {
        self.tlab_words
    }

    fn fill(&mut self, addr: usize, words: usize) {
        if words == 0 {
            return;
        }
        self.words[addr] = Mark::filler(words).raw();
        for w in &mut self.words[addr + 1..addr + words] {
            *w = 0;
        }
    }

    fn mark_new_object(&mut self, addr: usize) {
        self.new_objects.push(addr);
    }

    #[inline(always)]
    fn word(&self, addr: usize) -> u64 {
        self.words[addr]
    }

    #[inline(always)]
    fn set_word(&mut self, addr: usize, w: u64) {
        self.words[addr] = w;
    }

    fn copy_in(&mut self, addr: usize, words: &[u64]) {
        self.words[addr..addr + words.len()].copy_from_slice(words);
    }

    fn total_collections(&self) -> u64 {
        self.collections
    }

    fn gc_locker(&self) -> &Arc<GcLocker> {
        &self.locker
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunks_come_from_buffers() {
        let mut heap = ArenaHeap::new(256, 16);
        let a = heap.allocate_chunk(10).unwrap();
        heap.fill(a, 10);
        let b = heap.allocate_chunk(10).unwrap();
        heap.fill(b, 10);
        // The second request did not fit the first buffer.
        assert_eq!(b, a + 16);
        assert!(heap.allocate_chunk(17).is_none());
        assert_eq!(heap.objects(), vec![a, a + 10, b]);
    }

    #[test]
    fn test_out_of_memory() {
        let mut heap = ArenaHeap::new(32, 8);
        assert!(heap.allocate(20).is_ok());
        assert_eq!(
            heap.allocate(20),
            Err(SbaError::OutOfMemory { words: 20 })
        );
    }

    #[test]
    fn test_heap_object() {
        let mut heap = ArenaHeap::new(64, 8);
        let r = new_heap_object(&mut heap, Shape::new(2, 1, 1)).unwrap();
        assert!(r.is_heap());
        assert_eq!(Mark::from_raw(heap.word(r.addr())).size(), 3);
        assert_eq!(heap.new_objects(), &[r.addr()]);
    }

    #[test]
    fn test_no_gc_scope_nests() {
        let heap = ArenaHeap::new(8, 4);
        let locker = heap.gc_locker();
        assert!(!locker.is_active());
        {
            let _a = GcLocker::exclude(locker);
            let _b = GcLocker::exclude(locker);
            assert!(locker.is_active());
        }
        assert!(!locker.is_active());
    }
}
