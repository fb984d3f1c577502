/*!

Traversal framework shared by the escape engines, the stack collector and the
verifier.

A [`Visitor`] is offered reference slots, one at a time, and may rewrite them.
[`Spaces::oop_iterate`] offers every reference field of one object, writing
a field back only when the visitor changed it. Recursion is up to the visitor:
it calls `oop_iterate` again on the objects it wants to descend into, guarded
by its own mark bits.

*/

use crate::area::SbaArea;
use crate::heap::Heap;
use crate::object::Mark;
use crate::tagged_pointer::Ref;

/// Both places an object can live.
pub struct Spaces<'a> {
    pub area: &'a mut SbaArea,
    pub heap: &'a mut dyn Heap,
}

pub trait Visitor {
    fn visit_reference(&mut self, cx: &mut Spaces<'_>, p: &mut Ref);

    /// `derived` points into the body of the object `base` points to. The
    /// base slot is offered on its own as well, after all derived pairs.
    fn visit_derived_reference(&mut self, cx: &mut Spaces<'_>, base: &mut Ref, derived: &mut Ref) {
        let _ = (cx, base, derived);
    }
}

impl Spaces<'_> {
    #[inline(always)]
    pub fn word(&self, obj: Ref, idx: usize) -> u64 {
        read_word(&*self.area, &*self.heap, obj, idx)
    }

    #[inline(always)]
    pub fn set_word(&mut self, obj: Ref, idx: usize, w: u64) {
        write_word(&mut *self.area, &mut *self.heap, obj, idx, w)
    }

    #[inline(always)]
    pub fn mark(&self, obj: Ref) -> Mark {
        Mark::from_raw(self.word(obj, 0))
    }

    /// Offer each reference field of `obj` to `v`.
    pub fn oop_iterate(&mut self, obj: Ref, v: &mut dyn Visitor) {
        let nrefs = self.mark(obj).nrefs();
        for i in 1..=nrefs {
            let old = Ref::from_raw(self.word(obj, i));
            let mut field = old;
            v.visit_reference(self, &mut field);
            if field != old {
                self.set_word(obj, i, field.raw());
            }
        }
    }
}

/// Body word `idx` of `obj`, wherever it lives.
#[inline(always)]
pub(crate) fn read_word(area: &SbaArea, heap: &dyn Heap, obj: Ref, idx: usize) -> u64 {
    debug_assert!(!obj.is_null());
    if obj.is_stack() {
        area.word(obj.addr() + idx)
    } else {
        heap.word(obj.addr() + idx)
    }
}

#[inline(always)]
pub(crate) fn write_word(area: &mut SbaArea, heap: &mut dyn Heap, obj: Ref, idx: usize, w: u64) {
    debug_assert!(!obj.is_null());
    if obj.is_stack() {
        area.set_word(obj.addr() + idx, w)
    } else {
        heap.set_word(obj.addr() + idx, w)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SbaConfig;
    use crate::heap::{new_heap_object, ArenaHeap};
    use crate::object::Shape;
    use crate::preheader::SiteHint;

    /// Counts stack references and nulls them out.
    struct CutStack {
        seen: usize,
    }

    impl Visitor for CutStack {
        fn visit_reference(&mut self, _cx: &mut Spaces<'_>, p: &mut Ref) {
            if p.is_stack() {
                self.seen += 1;
                *p = Ref::NULL;
            }
        }
    }

    #[test]
    fn test_oop_iterate_writes_back() {
        let mut area = SbaArea::new(&SbaConfig::default());
        let mut heap = ArenaHeap::new(64, 16);
        let leaf = area.allocate(Shape::new(1, 0, 1), SiteHint::None).unwrap();
        let h = new_heap_object(&mut heap, Shape::new(2, 2, 0)).unwrap();
        let obj = area.allocate(Shape::new(2, 3, 1), SiteHint::None).unwrap();
        area.set_word(obj.addr() + 1, leaf.raw());
        area.set_word(obj.addr() + 2, h.raw());
        area.set_word(obj.addr() + 4, leaf.raw()); // scalar, not a field

        let mut cx = Spaces {
            area: &mut area,
            heap: &mut heap,
        };
        let mut v = CutStack { seen: 0 };
        cx.oop_iterate(obj, &mut v);
        assert_eq!(v.seen, 1);
        assert_eq!(cx.word(obj, 1), 0);
        assert_eq!(cx.word(obj, 2), h.raw());
        assert_eq!(cx.word(obj, 4), leaf.raw());
    }
}
