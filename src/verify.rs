//! Structural checks of a thread's region and roots. Panics on the first
//! inconsistency found.

use rustc_hash::FxHashSet;

use crate::closure::{Spaces, Visitor};
use crate::heap::Heap;
use crate::marks::MarkBits;
use crate::object::MIN_OBJECT_WORDS;
use crate::tagged_pointer::Ref;
use crate::thread::SbaThread;
use crate::Fid;

struct VerifyRefs {
    marks: MarkBits,
    heap_seen: FxHashSet<usize>,
    /// Frame id of the object or frame holding the slot being checked;
    /// `None` while inside a heap object.
    holder: Option<Fid>,
}

impl Visitor for VerifyRefs {
    fn visit_reference(&mut self, cx: &mut Spaces<'_>, p: &mut Ref) {
        if p.is_null() {
            return;
        }
        if p.is_heap() {
            if !self.heap_seen.insert(p.addr()) {
                return;
            }
            let saved = self.holder.take();
            cx.oop_iterate(*p, self);
            self.holder = saved;
            return;
        }

        let obj = p.addr();
        let holder = match self.holder {
            Some(fid) => fid,
            None => panic!("heap object refers to stack object {:?}", p),
        };
        assert!(cx.area.contains(obj), "{:?} is outside the live region", p);
        let pre = cx.area.preheader(obj);
        assert!(pre.is_live(), "{:?} refers to a vacated object ({})", p, pre);
        assert!(
            pre.fid() <= holder,
            "{:?} ({}) is younger than its holder in frame {}",
            p,
            pre,
            holder
        );
        if let Some(cached) = p.cached_fid() {
            assert_eq!(cached, pre.fid(), "stale frame id cached in {:?}", p);
        }
        if self.marks.test_set(obj) {
            return;
        }
        let saved = self.holder.replace(pre.fid());
        cx.oop_iterate(*p, self);
        self.holder = saved;
    }
}

pub(crate) fn verify(thread: &mut SbaThread, heap: &mut dyn Heap) {
    let SbaThread { area, roots, .. } = thread;
    let start = area.start();
    assert!(start <= area.top() && area.top() <= area.max(), "{}", area);

    let curr = area.curr_fid();
    let mut prev = 0;
    for fid in 0..curr {
        let b = area.boundary_of(fid);
        assert!(b >= prev, "frame {} ends before frame {}", fid, fid.saturating_sub(1));
        assert!(start + b <= area.top(), "frame {} ends above top", fid);
        prev = b;
    }

    let mut last_fid = 0;
    for obj in area.objects() {
        let size = area.mark(obj).size();
        assert!(size >= MIN_OBJECT_WORDS, "object at {:#x} has size {}", obj, size);
        assert!(obj + size <= area.top(), "object at {:#x} runs past top", obj);
        let pre = area.preheader(obj);
        if !pre.is_live() {
            continue;
        }
        let fid = pre.fid();
        assert!(fid >= last_fid, "frame ids out of order at {:#x}", obj);
        last_fid = fid;
        let lo = start + area.frame_base(fid);
        let hi = start + area.boundary_of(fid);
        assert!(
            obj > lo && obj + size <= hi,
            "object at {:#x} of frame {} lies outside [{:#x}, {:#x})",
            obj,
            fid,
            lo,
            hi
        );
    }

    let mut v = VerifyRefs {
        marks: MarkBits::new(area),
        heap_seen: FxHashSet::default(),
        holder: None,
    };
    let mut cx = Spaces {
        area: &mut *area,
        heap: &mut *heap,
    };
    for frame in roots.frames() {
        v.holder = Some(frame.fid);
        for d in &frame.derived {
            let base = frame.slots.get(d.base).copied().unwrap_or(Ref::NULL);
            if base.is_null() {
                continue;
            }
            let size = cx.mark(base).size();
            assert!(
                d.derived.space() == base.space()
                    && d.derived.addr() >= base.addr()
                    && d.derived.addr() < base.addr() + size,
                "derived {:?} is not inside its base {:?}",
                d.derived,
                base
            );
        }
        for slot in &frame.slots {
            let mut r = *slot;
            v.visit_reference(&mut cx, &mut r);
        }
    }
    v.holder = Some(curr);
    let others = roots
        .locks()
        .iter()
        .copied()
        .chain(std::iter::once(roots.pending_exception()));
    for mut r in others {
        v.visit_reference(&mut cx, &mut r);
    }
    for idx in 0..roots.handle_count() {
        let mut r = roots.handle(idx);
        v.visit_reference(&mut cx, &mut r);
    }
}
