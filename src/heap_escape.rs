/*!

Heap escape: move an object and everything it reaches on the stack into the
heap, in one go.

  1. Size pass. Mark everything stack-reachable from the escapee, pack the
     sizes into heap chunks first-fit, remember the oldest frame seen.
  1.5 If the escapee's allocation site is hot, walk the whole stack and add
     every other live object from that site.
  2. Allocate the chunks. This may collect the heap, so the escapee is held
     in a handle.
  2.5 Move pass. Copy each marked object into the chunk the packing chose for
     it, forwarding the stack copy. Replays 1.5 if it found anything.
  3. Fixup pass. Walk the roots down to the oldest frame and redirect every
     reference to a forwarded object.
  4. If everything from the escapee up to `top` moved, give that space back.

Passes 2.5 and 3 run with heap collections locked out.

*/

use std::sync::atomic::{fence, Ordering};

use rustc_hash::FxHashSet;
use smallvec::{smallvec, SmallVec};

use crate::area::SbaArea;
use crate::closure::{Spaces, Visitor};
use crate::error::Result;
use crate::heap::{GcLocker, Heap};
use crate::marks::MarkBits;
use crate::object::{lock_relock, Mark};
use crate::sites::EscapeSites;
use crate::stats::TELEMETRY;
use crate::tagged_pointer::Ref;
use crate::thread::SbaThread;
use crate::{record_time, Fid, ROOT_FID};

#[cfg(not(feature = "disable_eager_escape"))]
const EAGER_ESCAPE: bool = true;
#[cfg(feature = "disable_eager_escape")]
const EAGER_ESCAPE: bool = false;

/* ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
 * Chunk packing
 * ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
 */

/// First-fit packing of object sizes into chunks of at most `max_chunk`
/// words. A chunk that already holds something never takes an object that
/// would leave it with fewer than two free words; an empty chunk takes
/// anything.
pub(crate) struct ChunkPlan {
    max_chunk: usize,
    sizes: SmallVec<[usize; 4]>,
    chunk_idx: usize,
}

impl ChunkPlan {
    pub(crate) fn new(max_chunk: usize) -> ChunkPlan {
        debug_assert!(max_chunk >= 2);
        ChunkPlan {
            max_chunk,
            sizes: smallvec![0],
            chunk_idx: 0,
        }
    }

    fn size_at(&mut self, idx: usize) -> usize {
        if idx >= self.sizes.len() {
            self.sizes.resize(idx + 1, 0);
        }
        self.sizes[idx]
    }

    pub(crate) fn add(&mut self, size: usize) {
        let max = self.max_chunk;
        // Stop considering a chunk once less than 1/256 of it is left.
        while self.size_at(self.chunk_idx) + size >= max - 1
            && max.saturating_sub(self.sizes[self.chunk_idx]) < (max >> 8)
        {
            self.chunk_idx += 1;
        }
        let mut idx = self.chunk_idx;
        loop {
            let used = self.size_at(idx);
            if used != 0 && used + size >= max - 1 {
                idx += 1;
            } else {
                break;
            }
        }
        self.sizes[idx] += size;
    }

    pub(crate) fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    pub(crate) fn total(&self) -> usize {
        self.sizes.iter().sum()
    }
}

/// The move pass's view of the allocated chunks. Taking objects in the same
/// order the plan saw them lands each one in the chunk the plan picked.
struct MoveChunks {
    next: SmallVec<[usize; 4]>,
    remaining: SmallVec<[usize; 4]>,
    chunk_idx: usize,
}

impl MoveChunks {
    fn new(chunks: &[(usize, usize)]) -> MoveChunks {
        MoveChunks {
            next: chunks.iter().map(|c| c.0).collect(),
            remaining: chunks.iter().map(|c| c.1).collect(),
            chunk_idx: 0,
        }
    }

    fn take(&mut self, size: usize) -> usize {
        while self.remaining[self.chunk_idx] == 0 {
            self.chunk_idx += 1;
        }
        let mut idx = self.chunk_idx;
        while self.remaining[idx] < size {
            idx += 1;
        }
        let addr = self.next[idx];
        self.next[idx] += size;
        self.remaining[idx] -= size;
        addr
    }

    fn is_exhausted(&self) -> bool {
        self.remaining.iter().all(|r| *r == 0)
    }
}

/* ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
 * Visitors
 * ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
 */

struct ComputeEscapingSizes<'m> {
    marks: &'m mut MarkBits,
    plan: ChunkPlan,
    oldest_fid: Fid,
    words: usize,
    objects: usize,
}

struct SizePass {
    plan: ChunkPlan,
    oldest_fid: Fid,
    words: usize,
    objects: usize,
}

impl<'m> ComputeEscapingSizes<'m> {
    fn new(marks: &'m mut MarkBits, max_chunk: usize, curr_fid: Fid) -> Self {
        ComputeEscapingSizes {
            marks,
            plan: ChunkPlan::new(max_chunk),
            oldest_fid: curr_fid,
            words: 0,
            objects: 0,
        }
    }

    fn finish(self) -> SizePass {
        SizePass {
            plan: self.plan,
            oldest_fid: self.oldest_fid,
            words: self.words,
            objects: self.objects,
        }
    }
}

impl Visitor for ComputeEscapingSizes<'_> {
    fn visit_reference(&mut self, cx: &mut Spaces<'_>, p: &mut Ref) {
        if !p.is_stack() {
            return;
        }
        let obj = p.addr();
        let pre = cx.area.preheader(obj);
        debug_assert!(!pre.is_dead(), "live object points at vacated {:#x}", obj);
        if self.marks.test_set(obj) {
            return;
        }
        let size = cx.area.mark(obj).size();
        self.oldest_fid = self.oldest_fid.min(pre.fid());
        self.words += size;
        self.objects += 1;
        self.plan.add(size);
        tracing::trace!(obj, size, fid = pre.fid(), "escaping");
        cx.oop_iterate(*p, self);
    }
}

/// Walks everything reachable from the roots and hands live objects from
/// one allocation site to `inner`.
struct EagerEscape<'v> {
    inner: &'v mut dyn Visitor,
    site: u64,
    marks: MarkBits,
}

impl<'v> EagerEscape<'v> {
    fn new(inner: &'v mut dyn Visitor, site: u64, area: &SbaArea) -> Self {
        EagerEscape {
            inner,
            site,
            marks: MarkBits::new(area),
        }
    }
}

impl Visitor for EagerEscape<'_> {
    fn visit_reference(&mut self, cx: &mut Spaces<'_>, p: &mut Ref) {
        if !p.is_stack() {
            return;
        }
        let obj = p.addr();
        if self.marks.test_set(obj) {
            return;
        }
        let pre = cx.area.preheader(obj);
        if pre.is_dead() {
            // Moved earlier in this escape. Walk the copy so live objects are
            // met in the same order as when the chunks were planned.
            if pre.is_forwarded() {
                let copy = cx.area.forwardee(obj);
                cx.oop_iterate(copy, self);
            }
            return;
        }
        if pre.site_signature() == self.site {
            self.inner.visit_reference(cx, p);
        } else {
            cx.oop_iterate(*p, self);
        }
    }
}

/// Copies marked objects into their chunks. Only here, once the chunks are
/// secured, does an escape count against its allocation site.
struct MoveEscapingObjects<'m> {
    marks: &'m mut MarkBits,
    chunks: MoveChunks,
    locked: &'m FxHashSet<usize>,
    sites: &'m EscapeSites,
    use_hints: bool,
    words: usize,
}

impl Visitor for MoveEscapingObjects<'_> {
    fn visit_reference(&mut self, cx: &mut Spaces<'_>, p: &mut Ref) {
        if !p.is_stack() {
            return;
        }
        let obj = p.addr();
        if !self.marks.test_clr(obj) {
            return;
        }
        let mut pre = cx.area.preheader(obj);
        debug_assert!(!pre.is_dead());
        pre.update_allocation_site(self.sites, self.use_hints);
        cx.area.set_preheader(obj, pre);
        let size = cx.area.mark(obj).size();
        let dst = self.chunks.take(size);
        {
            let Spaces { area, heap } = cx;
            heap.copy_in(dst, area.body(obj));
        }
        cx.heap.mark_new_object(dst);
        let copy = Ref::heap(dst);
        cx.area.forward_to(obj, copy);
        self.words += size;
        tracing::trace!(obj, dst, size, "moved");

        cx.oop_iterate(copy, self);
        cx.area.poison(obj, size);

        if self.locked.contains(&obj) {
            let mark = Mark::from_raw(cx.heap.word(dst));
            let relocked = lock_relock(mark);
            if relocked != mark {
                cx.heap.set_word(dst, relocked.raw());
            }
        }
    }
}

/// Redirects references to forwarded objects and refreshes cached frame ids.
struct UpdateForwarding<'m> {
    marks: &'m mut MarkBits,
}

impl Visitor for UpdateForwarding<'_> {
    fn visit_reference(&mut self, cx: &mut Spaces<'_>, p: &mut Ref) {
        if !p.is_stack() {
            return;
        }
        let old = p.addr();
        let pre = cx.area.preheader(old);
        let new = if pre.is_dead() {
            debug_assert!(pre.is_forwarded());
            cx.area.forwardee(old)
        } else {
            debug_assert!(p.cached_fid().map_or(true, |f| f >= pre.fid()));
            p.with_fid(pre.fid())
        };
        *p = new;
        if self.marks.test_set(old) {
            return;
        }
        cx.oop_iterate(new, self);
    }

    fn visit_derived_reference(&mut self, cx: &mut Spaces<'_>, base: &mut Ref, derived: &mut Ref) {
        forward_derived(cx.area, *base, derived);
    }
}

/// Move `derived` along with its base if the base was forwarded. Must run
/// before the base slot itself is updated.
pub(crate) fn forward_derived(area: &SbaArea, base: Ref, derived: &mut Ref) {
    if !base.is_stack() {
        return;
    }
    if !area.preheader(base.addr()).is_forwarded() {
        return;
    }
    let delta = derived.addr() as isize - base.addr() as isize;
    *derived = area.forwardee(base.addr()).offset(delta);
}

/* ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
 * Driver
 * ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
 */

pub(crate) fn do_heap_escape(
    thread: &mut SbaThread,
    heap: &mut dyn Heap,
    escapee: Ref,
) -> Result<Ref> {
    let SbaThread {
        area,
        roots,
        sites,
        config,
    } = thread;
    let sites: &EscapeSites = sites;
    area.stats.heap_escape_events += 1;

    let pre_addr = escapee.addr() - 1;
    let signature = area.preheader(escapee.addr()).site_signature();
    let mut marks = MarkBits::new(area);

    // Size pass.
    let max_chunk = heap.max_chunk_words();
    let mut sizer = ComputeEscapingSizes::new(&mut marks, max_chunk, area.curr_fid());
    record_time!(
        {
            let mut cx = Spaces {
                area: &mut *area,
                heap: &mut *heap,
            };
            let mut e = escapee;
            sizer.visit_reference(&mut cx, &mut e);
        },
        area.stats.size_pass_time
    );

    let mut eager = false;
    if EAGER_ESCAPE && config.eager_escape && sites.is_hot(signature) {
        tracing::info!(
            site = format_args!("{:#x}", signature),
            "repeated escapes from one site, promoting its objects eagerly"
        );
        let before = sizer.objects;
        let mut cx = Spaces {
            area: &mut *area,
            heap: &mut *heap,
        };
        let mut walker = EagerEscape::new(&mut sizer, signature, &*cx.area);
        roots.roots_do(ROOT_FID, &mut cx, &mut walker);
        eager = sizer.objects > before;
    }
    let SizePass {
        plan,
        oldest_fid,
        words,
        objects,
    } = sizer.finish();
    debug_assert_eq!(plan.total(), words);

    area.stats.heap_escape_objects += objects as u64;
    area.stats.heap_escape_words += words as u64;
    if eager {
        area.stats.eager_escape_events += 1;
    }

    // Does the escape clear out everything from the escapee to the top?
    let escape_top = !area.needs_parse_gc
        && area
            .objects_between(pre_addr, area.top())
            .all(|obj| marks.test(obj));

    // Allocate the chunks. Nothing has moved yet if this fails.
    let handles = roots.handle_count();
    let h = roots.push_handle(escapee);
    let collections = heap.total_collections();
    let mut chunks: SmallVec<[(usize, usize); 4]> = SmallVec::new();
    for &size in plan.sizes().iter().filter(|s| **s > 0) {
        let base = match heap.allocate_chunk(size) {
            Some(base) => base,
            None => match heap.allocate(size) {
                Ok(base) => base,
                Err(err) => {
                    roots.truncate_handles(handles);
                    tracing::warn!(words = size, "heap escape failed: {}", err);
                    return Err(err);
                }
            },
        };
        heap.fill(base, size);
        TELEMETRY.record_allocation(None, size);
        chunks.push((base, size));
    }
    if heap.total_collections() != collections {
        tracing::debug!("heap collected while allocating escape chunks");
    }
    let escapee = roots.handle(h);

    let _no_gc = GcLocker::exclude(heap.gc_locker());

    // Move pass.
    let locked = roots.locked_stack_objects();
    let mut mover = MoveEscapingObjects {
        marks: &mut marks,
        chunks: MoveChunks::new(&chunks),
        locked: &locked,
        sites,
        use_hints: config.use_hints,
        words: 0,
    };
    record_time!(
        {
            let mut cx = Spaces {
                area: &mut *area,
                heap: &mut *heap,
            };
            let mut e = escapee;
            mover.visit_reference(&mut cx, &mut e);
            if eager {
                tracing::debug!("eager move pass");
                let mut walker = EagerEscape::new(&mut mover, signature, &*cx.area);
                roots.roots_do(ROOT_FID, &mut cx, &mut walker);
            }
        },
        area.stats.move_pass_time
    );
    debug_assert!(mover.chunks.is_exhausted(), "escape chunks not filled exactly");
    debug_assert_eq!(mover.words, words);
    debug_assert!(marks.is_clear());

    // Fixup pass.
    record_time!(
        {
            let mut cx = Spaces {
                area: &mut *area,
                heap: &mut *heap,
            };
            let mut fixup = UpdateForwarding { marks: &mut marks };
            roots.roots_do(oldest_fid, &mut cx, &mut fixup);
        },
        area.stats.fixup_pass_time
    );

    if escape_top {
        area.roll_back_top(pre_addr);
        area.stats.rollbacks += 1;
        tracing::debug!(top = pre_addr, "rolled back top after escape");
    }

    fence(Ordering::SeqCst);
    let result = roots.handle(h);
    roots.truncate_handles(handles);
    tracing::debug!(
        objects,
        words,
        chunks = chunks.len(),
        oldest_fid,
        ?result,
        "heap escape done"
    );
    Ok(result)
}
