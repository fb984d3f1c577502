//! Store barriers. A stack reference may only be stored where it cannot
//! outlive its frame; anything else is escaped first and the store completes
//! with the corrected reference.

use crate::closure::write_word;
use crate::dispatch::{escape, Destination};
use crate::error::Result;
use crate::heap::Heap;
use crate::tagged_pointer::Ref;
use crate::thread::SbaThread;

impl SbaThread {
    /// Where `value` has to go before it may be stored into `holder`.
    fn store_destination(&self, holder: Ref, value: Ref) -> Option<Destination> {
        if !value.is_stack() {
            return None;
        }
        if holder.is_heap() {
            return Some(Destination::Heap);
        }
        let holder_fid = self.area.preheader(holder.addr()).fid();
        let value_fid = self.area.preheader(value.addr()).fid();
        if value_fid > holder_fid {
            Some(Destination::Frame(holder_fid))
        } else {
            None
        }
    }

    /// `obj.field[idx] = value`. Returns the reference actually stored.
    pub fn store_field(
        &mut self,
        heap: &mut dyn Heap,
        obj: Ref,
        idx: usize,
        value: Ref,
    ) -> Result<Ref> {
        debug_assert!(idx >= 1 && idx <= self.mark_of(heap, obj).nrefs());
        let mut obj = obj;
        let mut value = value;
        // A stack collection while making the region parseable may move the
        // holder to the heap, so check again after every escape.
        while let Some(dest) = self.store_destination(obj, value) {
            let h = self.roots.push_handle(obj);
            let escaped = escape(self, heap, value, dest, "store barrier");
            obj = self.roots.handle(h);
            self.roots.truncate_handles(h);
            value = escaped?;
        }
        write_word(&mut self.area, heap, obj, idx, value.raw());
        Ok(value)
    }

    /// Store into slot `slot` of the frame at `depth`.
    pub fn store_root(
        &mut self,
        heap: &mut dyn Heap,
        depth: usize,
        slot: usize,
        value: Ref,
    ) -> Result<Ref> {
        let frame_fid = self.roots.frame(depth).fid;
        let value = if value.is_stack() && self.area.preheader(value.addr()).fid() > frame_fid {
            escape(self, heap, value, Destination::Frame(frame_fid), "store root")?
        } else {
            value
        };
        let frame = self.roots.frame_mut(depth);
        if frame.slots.len() <= slot {
            frame.slots.resize(slot + 1, Ref::NULL);
        }
        frame.slots[slot] = value;
        Ok(value)
    }

    /// Scalar store; never needs a barrier.
    pub fn store_word(&mut self, heap: &mut dyn Heap, obj: Ref, idx: usize, w: u64) {
        debug_assert!(
            idx > self.mark_of(heap, obj).nrefs(),
            "reference fields go through store_field"
        );
        write_word(&mut self.area, heap, obj, idx, w);
    }
}
