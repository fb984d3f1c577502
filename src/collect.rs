/*!

Thread-local copying collection of the stack region.

  1. FindLive. Mark everything reachable from the roots and add up live words
     per frame id. Derived roots are turned into offsets from their base.
  2. Resize. Pick the size of the half to copy into.
  3. CopyCompact. Walk the roots again, copying each live object into the
     slot reserved for its frame id in the other half, so frame order is
     kept. When much of the stack is live, objects without stack references
     go to the heap instead. Frame areas left short by that are filled.

Afterwards the region is dense, parseable and free of forwarded objects.

*/

use std::ops::Range;
use std::sync::atomic::{fence, Ordering};
use std::time::Instant;

use crate::area::SbaArea;
use crate::closure::{Spaces, Visitor};
use crate::config::SbaConfig;
use crate::error::Result;
use crate::heap::{GcLocker, Heap};
use crate::marks::MarkBits;
use crate::object::Mark;
use crate::preheader::{PreHeader, SiteHint};
use crate::stats::TELEMETRY;
use crate::tagged_pointer::Ref;
use crate::thread::SbaThread;
use crate::verify;
use crate::{record_time, Fid, ROOT_FID};

struct FindLive<'m> {
    marks: &'m mut MarkBits,
    fid_sz: &'m mut [usize],
}

impl Visitor for FindLive<'_> {
    fn visit_reference(&mut self, cx: &mut Spaces<'_>, p: &mut Ref) {
        if !p.is_stack() {
            return;
        }
        let obj = p.addr();
        let pre = cx.area.preheader(obj);
        debug_assert!(!pre.is_dead(), "root reaches vacated {:#x}", obj);
        if self.marks.test_set(obj) {
            return;
        }
        self.fid_sz[pre.fid() as usize] += cx.area.mark(obj).size() + 1;
        cx.oop_iterate(*p, self);
    }

    fn visit_derived_reference(&mut self, _cx: &mut Spaces<'_>, base: &mut Ref, derived: &mut Ref) {
        if !base.is_stack() {
            return;
        }
        // Holds the offset until the base has been copied.
        let offset = derived.addr() as isize - base.addr() as isize;
        *derived = Ref::from_raw(offset as u64);
    }
}

struct CopyCompact<'f> {
    to: Range<usize>,
    fid_end: &'f [usize],
    /// Heap words still available for objects thrown out of the region.
    excess: usize,
    heap_adr: usize,
    zap_hints: bool,
    moved_objects: u64,
    moved_words: u64,
    moved_heap_words: u64,
}

impl CopyCompact<'_> {
    fn copy_and_forward(&mut self, cx: &mut Spaces<'_>, p: &mut Ref) {
        let old = p.addr();
        let mut pre = cx.area.preheader(old);
        if self.zap_hints {
            pre.zap_hint();
        }
        let size = cx.area.mark(old).size();

        let new = if size + 1 < self.excess && cx.area.has_no_stack_refs(old) {
            let dst = self.heap_adr;
            self.heap_adr += size;
            self.excess -= size;
            self.moved_heap_words += size as u64;
            {
                let Spaces { area, heap } = cx;
                heap.copy_in(dst, area.body(old));
            }
            cx.heap.mark_new_object(dst);
            Ref::heap(dst)
        } else {
            let fid = pre.fid() as usize;
            let off = cx.area.fid_top[fid];
            debug_assert!(off + size + 1 <= self.fid_end[fid], "frame {} overflows", fid);
            cx.area.fid_top[fid] = off + size + 1;
            let dst_pre = self.to.start + off;
            cx.area.space[dst_pre] = pre.raw();
            cx.area.space.copy_within(old..old + size, dst_pre + 1);
            Ref::stack(dst_pre + 1, pre.fid())
        };
        self.moved_objects += 1;
        self.moved_words += size as u64 + 1;

        *p = new;
        cx.area.forward_to(old, new);
        cx.area.poison(old, size);
        cx.oop_iterate(new, self);
    }

    fn copied(&self, r: Ref) -> bool {
        self.to.contains(&r.addr())
    }
}

impl Visitor for CopyCompact<'_> {
    fn visit_reference(&mut self, cx: &mut Spaces<'_>, p: &mut Ref) {
        if !p.is_stack() || self.copied(*p) {
            return;
        }
        if cx.area.preheader(p.addr()).is_forwarded() {
            *p = cx.area.forwardee(p.addr());
            return;
        }
        self.copy_and_forward(cx, p);
    }

    fn visit_derived_reference(&mut self, cx: &mut Spaces<'_>, base: &mut Ref, derived: &mut Ref) {
        if !base.is_stack() {
            return;
        }
        let offset = derived.raw() as i64 as isize;
        if !self.copied(*base) {
            if cx.area.preheader(base.addr()).is_forwarded() {
                *base = cx.area.forwardee(base.addr());
            } else {
                self.copy_and_forward(cx, base);
            }
        }
        *derived = base.offset(offset);
    }
}

/// Size of the half to copy into. Grows until a quarter of it holds the live
/// data plus the pending request, grows further when collections come close
/// together, shrinks when they are far apart and an eighth would do.
fn policy_resize(
    area: &mut SbaArea,
    config: &SbaConfig,
    alloc_words: usize,
    total_live: usize,
) -> usize {
    let now = Instant::now();
    let secs = area
        .last_gc
        .map_or(f64::INFINITY, |t| now.duration_since(t).as_secs_f64());
    area.last_gc = Some(now);

    let interval = config.resize_interval_secs;
    let target = total_live + alloc_words;
    let mut tospace = area.capacity();
    if tospace >> 2 < target {
        while tospace >> 2 < target {
            tospace <<= 1;
        }
    } else if secs < interval && alloc_words > 0 {
        tospace <<= 1;
    } else if secs > 4.0 * interval && tospace >> 3 > target {
        tospace >>= 1;
    }
    tospace.clamp(config.initial_stack_words, config.max_stack_words)
}

pub(crate) fn collect(thread: &mut SbaThread, heap: &mut dyn Heap, alloc_words: usize) -> Result<()> {
    let started = Instant::now();
    if thread.config.verify {
        verify::verify(thread, heap);
    }
    let SbaThread {
        area, roots, config, ..
    } = thread;
    area.stats.stack_collections += 1;
    let capfid = area.curr_fid() as usize;
    let used_before = area.used();

    // Pass 1.
    let mut fid_end = vec![0usize; capfid + 1];
    let mut marks = MarkBits::new(area);
    record_time!(
        {
            let mut cx = Spaces {
                area: &mut *area,
                heap: &mut *heap,
            };
            let mut live = FindLive {
                marks: &mut marks,
                fid_sz: &mut fid_end,
            };
            roots.roots_do(ROOT_FID, &mut cx, &mut live);
        },
        area.stats.findlive_time
    );
    let total_live: usize = fid_end.iter().sum();

    // Pass 2.
    let tospace = policy_resize(area, config, alloc_words, total_live);
    let to_start = area.other_half();
    area.setup_alloc_space(to_start, tospace);
    debug_assert!(total_live <= tospace);
    area.fid_top[0] = 0;
    for i in 1..=capfid {
        area.fid_top[i] = fid_end[i - 1];
        fid_end[i] += fid_end[i - 1];
    }
    area.top = to_start + total_live;

    let mut excess = total_live
        .saturating_sub(config.max_stack_words >> 3)
        .min(heap.max_chunk_words());
    let mut heap_adr = 0;
    if excess > 0 {
        match heap.allocate_chunk(excess) {
            Some(adr) => heap_adr = adr,
            None => match heap.allocate(excess) {
                Ok(adr) => heap_adr = adr,
                Err(err) => {
                    tracing::debug!("no heap space for stack overflow: {}", err);
                    excess = 0;
                }
            },
        }
    }

    // Pass 3.
    let _no_gc = GcLocker::exclude(heap.gc_locker());
    let mut copier = CopyCompact {
        to: to_start..to_start + tospace,
        fid_end: &fid_end,
        excess,
        heap_adr,
        zap_hints: area.needs_parse_gc,
        moved_objects: 0,
        moved_words: 0,
        moved_heap_words: 0,
    };
    record_time!(
        {
            let mut cx = Spaces {
                area: &mut *area,
                heap: &mut *heap,
            };
            roots.roots_do(ROOT_FID, &mut cx, &mut copier);
        },
        area.stats.copy_compact_time
    );

    // Frame areas that lost objects to the heap.
    for fid in 0..capfid {
        let (top, end) = (area.fid_top[fid], fid_end[fid]);
        if top < end {
            let pre = to_start + top;
            area.space[pre] = PreHeader::new(fid as Fid, SiteHint::None).raw();
            area.space[pre + 1] = Mark::filler(end - top - 1).raw();
            area.fid_top[fid] = end;
        }
    }
    // The current frame just ends early.
    let live = total_live - (fid_end[capfid] - area.fid_top[capfid]);
    area.top = to_start + live;
    if copier.excess > 0 {
        heap.fill(copier.heap_adr, copier.excess);
    }
    area.needs_parse_gc = false;

    area.stats.moved_objects += copier.moved_objects;
    area.stats.moved_words += copier.moved_words;
    area.stats.moved_heap_words += copier.moved_heap_words;
    fence(Ordering::SeqCst);

    let elapsed = started.elapsed();
    TELEMETRY.record_stack_gc(elapsed);
    tracing::info!(
        before = used_before,
        after = live,
        to_heap = copier.moved_heap_words,
        capacity = tospace,
        elapsed_us = elapsed.as_micros() as u64,
        "stack collection"
    );
    drop(_no_gc);
    thread.sites.tick();

    if thread.config.verify {
        verify::verify(thread, heap);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn area(initial: usize, max: usize) -> (SbaArea, SbaConfig) {
        let config = SbaConfig {
            initial_stack_words: initial,
            max_stack_words: max,
            resize_interval_secs: 1.0,
            ..SbaConfig::default()
        };
        (SbaArea::new(&config), config)
    }

    #[test]
    fn test_resize_grows_to_fit() {
        let (mut a, config) = area(64, 1024);
        assert_eq!(policy_resize(&mut a, &config, 10, 40), 256);
        assert!(a.last_gc.is_some());
    }

    #[test]
    fn test_resize_bounds() {
        let (mut a, config) = area(64, 128);
        assert_eq!(policy_resize(&mut a, &config, 0, 100), 128);
        // First collection: far apart, tiny live set, but never below initial.
        let (mut a, config) = area(64, 128);
        assert_eq!(policy_resize(&mut a, &config, 0, 1), 64);
    }

    #[test]
    fn test_resize_doubles_on_frequent_collections() {
        let (mut a, config) = area(64, 1024);
        a.last_gc = Some(Instant::now());
        assert_eq!(policy_resize(&mut a, &config, 4, 4), 128);
    }
}
