/*!

The thread's root set: a shadow stack of frames holding reference slots, plus
handles (roots that are not tied to a frame), lock records and the pending
exception.

Frames are kept in call order. `frames[0]` is the root frame and the last
element is the current one.

*/

use rustc_hash::FxHashSet;

use crate::closure::{Spaces, Visitor};
use crate::tagged_pointer::Ref;
use crate::{Fid, ROOT_FID};

/// An interior pointer into the object held by `slots[base]` of the same
/// frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DerivedRoot {
    pub base: usize,
    pub derived: Ref,
}

#[derive(Debug, Clone)]
pub struct RootFrame {
    pub fid: Fid,
    pub slots: Vec<Ref>,
    pub derived: Vec<DerivedRoot>,
}

impl RootFrame {
    fn new(fid: Fid) -> RootFrame {
        RootFrame {
            fid,
            slots: Vec::new(),
            derived: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct ShadowStack {
    frames: Vec<RootFrame>,
    handles: Vec<Ref>,
    locks: Vec<Ref>,
    pending_exception: Ref,
}

impl Default for ShadowStack {
    fn default() -> Self {
        ShadowStack::new()
    }
}

impl ShadowStack {
    pub fn new() -> ShadowStack {
        ShadowStack {
            frames: vec![RootFrame::new(ROOT_FID)],
            handles: Vec::new(),
            locks: Vec::new(),
            pending_exception: Ref::NULL,
        }
    }

    pub fn push_frame(&mut self, fid: Fid) {
        self.frames.push(RootFrame::new(fid));
    }

    pub fn pop_frame(&mut self) -> Option<RootFrame> {
        if self.frames.len() == 1 {
            return None;
        }
        self.frames.pop()
    }

    pub fn depth(&self) -> usize {
        self.frames.len() - 1
    }

    pub fn frames(&self) -> &[RootFrame] {
        &self.frames
    }

    pub fn frame(&self, depth: usize) -> &RootFrame {
        &self.frames[depth]
    }

    pub fn frame_mut(&mut self, depth: usize) -> &mut RootFrame {
        &mut self.frames[depth]
    }

    pub fn current(&self) -> &RootFrame {
        &self.frames[self.frames.len() - 1]
    }

    pub fn current_mut(&mut self) -> &mut RootFrame {
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }

    /* ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~ */

    /// Returns the index to pass to `handle`.
    pub fn push_handle(&mut self, r: Ref) -> usize {
        self.handles.push(r);
        self.handles.len() - 1
    }

    pub fn handle(&self, idx: usize) -> Ref {
        self.handles[idx]
    }

    /// Drop every handle from `idx` up.
    pub fn truncate_handles(&mut self, idx: usize) {
        self.handles.truncate(idx);
    }

    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }

    pub fn push_lock(&mut self, r: Ref) {
        self.locks.push(r);
    }

    /// Release the innermost lock record for `r`. Returns false if there is
    /// none.
    pub fn pop_lock(&mut self, r: Ref) -> bool {
        match self.locks.iter().rposition(|l| l.space() == r.space() && l.addr() == r.addr()) {
            Some(i) => {
                self.locks.remove(i);
                true
            }
            None => false,
        }
    }

    pub fn locks(&self) -> &[Ref] {
        &self.locks
    }

    /// Addresses of stack objects with at least one lock record.
    pub fn locked_stack_objects(&self) -> FxHashSet<usize> {
        self.locks
            .iter()
            .filter(|r| r.is_stack())
            .map(|r| r.addr())
            .collect()
    }

    pub fn pending_exception(&self) -> Ref {
        self.pending_exception
    }

    pub fn set_pending_exception(&mut self, r: Ref) {
        self.pending_exception = r;
    }

    /* ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~ */

    /// Offer every root to `v`: slots of frames whose id is at least
    /// `from_fid` (derived pairs first, as a stack map lists them), then
    /// handles, lock records and the pending exception.
    pub fn roots_do(&mut self, from_fid: Fid, cx: &mut Spaces<'_>, v: &mut dyn Visitor) {
        for frame in self.frames.iter_mut().filter(|f| f.fid >= from_fid) {
            for d in frame.derived.iter_mut() {
                v.visit_derived_reference(cx, &mut frame.slots[d.base], &mut d.derived);
            }
            for slot in frame.slots.iter_mut() {
                v.visit_reference(cx, slot);
            }
        }
        for h in self.handles.iter_mut() {
            v.visit_reference(cx, h);
        }
        for l in self.locks.iter_mut() {
            v.visit_reference(cx, l);
        }
        v.visit_reference(cx, &mut self.pending_exception);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::area::SbaArea;
    use crate::config::SbaConfig;
    use crate::heap::ArenaHeap;

    struct Collect(Vec<Ref>);

    impl Visitor for Collect {
        fn visit_reference(&mut self, _cx: &mut Spaces<'_>, p: &mut Ref) {
            if !p.is_null() {
                self.0.push(*p);
            }
        }
    }

    #[test]
    fn test_roots_do_respects_from_fid() {
        let mut area = SbaArea::new(&SbaConfig::default());
        let mut heap = ArenaHeap::new(16, 4);
        let mut roots = ShadowStack::new();
        roots.current_mut().slots.push(Ref::heap(1));
        roots.push_frame(1);
        roots.current_mut().slots.push(Ref::heap(2));
        roots.push_frame(2);
        roots.current_mut().slots.push(Ref::heap(3));
        roots.push_handle(Ref::heap(4));
        roots.set_pending_exception(Ref::heap(5));

        let mut cx = Spaces {
            area: &mut area,
            heap: &mut heap,
        };
        let mut v = Collect(Vec::new());
        roots.roots_do(1, &mut cx, &mut v);
        assert_eq!(
            v.0,
            vec![Ref::heap(2), Ref::heap(3), Ref::heap(4), Ref::heap(5)]
        );
    }

    #[test]
    fn test_root_frame_is_not_popped() {
        let mut roots = ShadowStack::new();
        assert!(roots.pop_frame().is_none());
        roots.push_frame(1);
        assert_eq!(roots.depth(), 1);
        assert_eq!(roots.pop_frame().map(|f| f.fid), Some(1));
    }

    #[test]
    fn test_lock_records() {
        let mut roots = ShadowStack::new();
        let a = Ref::stack(9, 0);
        roots.push_lock(a);
        roots.push_lock(Ref::heap(3));
        assert!(roots.locked_stack_objects().contains(&9));
        assert!(roots.pop_lock(a));
        assert!(!roots.pop_lock(a));
        assert!(roots.locked_stack_objects().is_empty());
    }
}
