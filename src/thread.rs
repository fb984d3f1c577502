/*!

One mutator thread: its stack region, its root set and the settings it runs
with. Store barriers live in `barrier.rs`, the escape engines take an
`SbaThread` and a heap.

*/

use std::sync::Arc;

use crate::area::{SbaArea, CAPPED_FID};
use crate::closure::read_word;
use crate::collect;
use crate::config::SbaConfig;
use crate::dispatch::{escape, Destination};
use crate::error::{Result, SbaError};
use crate::heap::{new_heap_object, Heap};
use crate::object::{LockState, Mark, Shape};
use crate::preheader::{PreHeader, SiteHint};
use crate::roots::{DerivedRoot, ShadowStack};
use crate::sites::EscapeSites;
use crate::stats::{AreaStats, TELEMETRY};
use crate::tagged_pointer::Ref;
use crate::verify;
use crate::Fid;

pub struct SbaThread {
    pub(crate) area: SbaArea,
    pub(crate) roots: ShadowStack,
    pub(crate) sites: Arc<EscapeSites>,
    pub(crate) config: SbaConfig,
}

impl SbaThread {
    /// A thread recording escapes in `sites`, which must use the escape
    /// threshold `config` asks for.
    pub fn new(config: SbaConfig, sites: Arc<EscapeSites>) -> Result<SbaThread> {
        config.validate()?;
        if sites.threshold() != config.escape_threshold {
            return Err(SbaError::InvalidConfig(format!(
                "escape_threshold {} does not match the site table's {}",
                config.escape_threshold,
                sites.threshold()
            )));
        }
        Ok(SbaThread {
            area: SbaArea::new(&config),
            roots: ShadowStack::new(),
            sites,
            config,
        })
    }

    pub fn area(&self) -> &SbaArea {
        &self.area
    }

    pub fn roots(&self) -> &ShadowStack {
        &self.roots
    }

    pub fn roots_mut(&mut self) -> &mut ShadowStack {
        &mut self.roots
    }

    pub fn sites(&self) -> &Arc<EscapeSites> {
        &self.sites
    }

    pub fn config(&self) -> &SbaConfig {
        &self.config
    }

    pub fn stats(&self) -> &AreaStats {
        &self.area.stats
    }

    pub fn curr_fid(&self) -> Fid {
        self.area.curr_fid()
    }

    /* ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
     * Frames
     * ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
     */

    pub fn push_frame(&mut self) -> Fid {
        let fid = self.area.enter_frame();
        self.roots.push_frame(fid);
        tracing::trace!(fid, depth = self.area.depth(), "push frame");
        fid
    }

    /// Leave the current frame. A pending exception allocated in it is moved
    /// to the caller's frame first.
    pub fn pop_frame(&mut self, heap: &mut dyn Heap) -> Result<()> {
        debug_assert!(self.area.depth() > 0, "popping the root frame");
        if self.config.verify {
            verify::verify(self, heap);
        }
        self.check_escape(heap)?;
        self.roots.pop_frame();
        self.area.exit_frame();
        tracing::trace!(fid = self.area.curr_fid(), "pop frame");
        if self.config.verify {
            verify::verify(self, heap);
        }
        Ok(())
    }

    fn check_escape(&mut self, heap: &mut dyn Heap) -> Result<()> {
        // The caller shares our frame id past the cap.
        if self.area.depth() == 0 || self.area.depth() > CAPPED_FID {
            return Ok(());
        }
        let new_fid = (self.area.depth() - 1) as Fid;
        let exception = self.roots.pending_exception();
        if !exception.is_stack() {
            return Ok(());
        }
        let pre = self.area.preheader(exception.addr());
        debug_assert!(pre.fid() <= new_fid + 1);
        if pre.fid() <= new_fid {
            return Ok(());
        }
        if self.area.has_no_stack_refs(exception.addr()) {
            self.cheap_escape(exception, new_fid);
        } else {
            let moved = escape(self, heap, exception, Destination::Frame(new_fid), "pop frame")?;
            self.roots.set_pending_exception(moved);
        }
        Ok(())
    }

    /// Copy a reference-free object to the top of frame `new_fid`. Nothing
    /// else can point at it: only the dying frame could, and its roots go
    /// away with it.
    fn cheap_escape(&mut self, exception: Ref, new_fid: Fid) {
        let area = &mut self.area;
        let obj = exception.addr();
        let size = area.mark(obj).size();
        let dst_pre = area.start + area.fid_top[new_fid as usize];
        debug_assert!(dst_pre < obj);
        area.space.copy_within(obj - 1..obj + size, dst_pre);
        let new_obj = dst_pre + 1;
        let mut pre = area.preheader(new_obj);
        pre.set_fid(new_fid);
        area.set_preheader(new_obj, pre);
        area.fid_top[new_fid as usize] += size + 1;
        area.stats.cheap_escapes += 1;
        tracing::debug!(from = obj, to = new_obj, fid = new_fid, "cheap escape");
        self.roots
            .set_pending_exception(Ref::stack(new_obj, new_fid));
    }

    /* ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
     * Allocation
     * ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
     */

    /// Stack-allocate in the current frame. `Ok(None)` means the object
    /// belongs in the heap: it is too big to ever escape in one chunk, its
    /// site escapes too often, or the region is full even after collecting.
    pub fn allocate(
        &mut self,
        heap: &mut dyn Heap,
        shape: Shape,
        hint: SiteHint,
    ) -> Result<Option<Ref>> {
        let words = shape.body_words();
        if words > heap.max_chunk_words() {
            return Ok(None);
        }
        if self.config.use_hints && hint != SiteHint::None {
            let site = PreHeader::new(0, hint).site_signature();
            if !self.sites.should_stack_allocate(site)
                && !(self.sites.tick() && self.sites.should_stack_allocate(site))
            {
                return Ok(None);
            }
        }
        if let Some(r) = self.area.allocate(shape, hint) {
            TELEMETRY.record_allocation(Some(self.curr_fid()), words + 1);
            return Ok(Some(r));
        }
        if !self.config.collect_on_exhaustion {
            return Ok(None);
        }
        collect::collect(self, heap, words + 1)?;
        let r = self.area.allocate(shape, hint);
        if r.is_some() {
            TELEMETRY.record_allocation(Some(self.curr_fid()), words + 1);
        }
        Ok(r)
    }

    /// Allocate on the stack when possible, in the heap otherwise.
    pub fn new_object(&mut self, heap: &mut dyn Heap, shape: Shape, hint: SiteHint) -> Result<Ref> {
        match self.allocate(heap, shape, hint)? {
            Some(r) => Ok(r),
            None => new_heap_object(heap, shape),
        }
    }

    /* ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
     * Field and slot access
     * ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
     */

    pub fn mark_of(&self, heap: &dyn Heap, obj: Ref) -> Mark {
        Mark::from_raw(read_word(&self.area, heap, obj, 0))
    }

    /// Body word `idx` of `obj`.
    pub fn load_word(&self, heap: &dyn Heap, obj: Ref, idx: usize) -> u64 {
        read_word(&self.area, heap, obj, idx)
    }

    pub fn load_field(&self, heap: &dyn Heap, obj: Ref, idx: usize) -> Ref {
        debug_assert!(idx >= 1 && idx <= self.mark_of(heap, obj).nrefs());
        Ref::from_raw(read_word(&self.area, heap, obj, idx))
    }

    /// Slot `slot` of the frame at `depth` (0 is the root frame).
    pub fn local(&self, depth: usize, slot: usize) -> Ref {
        self.roots
            .frame(depth)
            .slots
            .get(slot)
            .copied()
            .unwrap_or(Ref::NULL)
    }

    /// Store into a slot of the current frame. Needs no barrier: nothing
    /// visible to the current frame is younger than it.
    pub fn set_local(&mut self, slot: usize, r: Ref) {
        let frame = self.roots.current_mut();
        if frame.slots.len() <= slot {
            frame.slots.resize(slot + 1, Ref::NULL);
        }
        frame.slots[slot] = r;
    }

    /// Register `derived` as an interior pointer of the object in `base_slot`
    /// of the current frame. Returns its index for `derived`.
    pub fn add_derived(&mut self, base_slot: usize, derived: Ref) -> usize {
        let frame = self.roots.current_mut();
        debug_assert!(base_slot < frame.slots.len());
        frame.derived.push(DerivedRoot {
            base: base_slot,
            derived,
        });
        frame.derived.len() - 1
    }

    pub fn derived(&self, depth: usize, idx: usize) -> Ref {
        self.roots.frame(depth).derived[idx].derived
    }

    pub fn pending_exception(&self) -> Ref {
        self.roots.pending_exception()
    }

    pub fn set_pending_exception(&mut self, r: Ref) {
        self.roots.set_pending_exception(r);
    }

    /* ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
     * Locking
     * ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
     */

    /// Take a lock on `obj`. Stack objects are private to the thread, so only
    /// the lock record is kept; heap objects are biased towards this thread.
    pub fn lock(&mut self, heap: &mut dyn Heap, obj: Ref) {
        if obj.is_heap() {
            let mark = Mark::from_raw(heap.word(obj.addr()));
            if mark.lock() == LockState::Unlocked {
                heap.set_word(obj.addr(), mark.with_lock(LockState::SelfBiased).raw());
            }
        }
        self.roots.push_lock(obj);
    }

    pub fn unlock(&mut self, heap: &mut dyn Heap, obj: Ref) -> bool {
        if !self.roots.pop_lock(obj) {
            return false;
        }
        let still_held = self
            .roots
            .locks()
            .iter()
            .any(|l| l.space() == obj.space() && l.addr() == obj.addr());
        if obj.is_heap() && !still_held {
            let mark = Mark::from_raw(heap.word(obj.addr()));
            heap.set_word(obj.addr(), mark.with_lock(LockState::Unlocked).raw());
        }
        true
    }

    /* ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
     * Collection and checking
     * ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
     */

    /// Called by the heap when it may have discarded metadata that dead
    /// stack objects still refer to. The region is collected before the next
    /// sweep.
    pub fn gc_moved_metadata(&mut self) {
        self.area.needs_parse_gc = true;
    }

    /// Collect the region now.
    pub fn collect(&mut self, heap: &mut dyn Heap) -> Result<()> {
        collect::collect(self, heap, 0)
    }

    /// Panics on any structural inconsistency.
    pub fn verify(&mut self, heap: &mut dyn Heap) {
        verify::verify(self, heap)
    }
}
