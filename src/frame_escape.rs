/*!

Frame escape: re-parent an object, and everything it reaches on the stack, to
an older frame without moving it.

Frames are contiguous and nested, so every object between the end of the
target frame and the escapee belongs to a frame that is younger than the
target. Sweeping that span and lowering each frame id, then pulling the
boundaries of the skipped frames down to the end of the sweep, folds the span
into the target frame. The span reaches as far as the furthest object
referred to by anything swept.

*/

use std::sync::atomic::{fence, Ordering};

use crate::area::{SbaArea, CAPPED_FID};
use crate::closure::{Spaces, Visitor};
use crate::collect;
use crate::error::Result;
use crate::heap::{GcLocker, Heap};
use crate::marks::MarkBits;
use crate::tagged_pointer::{Ref, FIDS_IN_REF};
use crate::thread::SbaThread;
use crate::{record_time, Fid};

/// Brings the frame id cached in every reachable stack reference in line
/// with its target's pre-header.
struct UpdateFidsInStack {
    marks: MarkBits,
}

impl Visitor for UpdateFidsInStack {
    fn visit_reference(&mut self, cx: &mut Spaces<'_>, p: &mut Ref) {
        if !p.is_stack() {
            return;
        }
        let obj = p.addr();
        let pre = cx.area.preheader(obj);
        if !pre.is_live() {
            return;
        }
        if p.cached_fid() != Some(pre.fid()) {
            *p = p.with_fid(pre.fid());
        }
        if self.marks.test_set(obj) {
            return;
        }
        cx.oop_iterate(*p, self);
    }
}

/// Collect the region if the heap may have invalidated metadata of dead
/// objects. Returns the escapee's reference afterwards.
fn make_heap_parsable(thread: &mut SbaThread, heap: &mut dyn Heap, escapee: Ref) -> Result<Ref> {
    if !thread.area.needs_parse_gc {
        return Ok(escapee);
    }
    tracing::debug!("collecting stack before frame escape");
    let handles = thread.roots.handle_count();
    let h = thread.roots.push_handle(escapee);
    let collected = collect::collect(thread, heap, 0);
    let escapee = thread.roots.handle(h);
    thread.roots.truncate_handles(handles);
    collected?;
    Ok(escapee)
}

struct Sweep {
    /// Offset of the end of the last swept object.
    end: usize,
    objects: usize,
    words: usize,
}

/// Lower the frame id of everything from the end of frame `target` through
/// the escapee, extending the span through the reference fields of every
/// live object swept. The span never leaves the escapee's frame: a live
/// object there only refers to objects no younger than itself.
fn sweep(area: &mut SbaArea, escapee: Ref, escapee_fid: Fid, target: Fid) -> Sweep {
    let floor = area.start() + area.boundary_of(target);
    let ceiling = area.start() + area.boundary_of(escapee_fid);
    let obj = escapee.addr();
    let mut last = obj + area.mark(obj).size();
    debug_assert!(last <= ceiling);

    let mut objects = 0;
    let mut words = 0;
    let mut pre_addr = floor;
    while pre_addr < last {
        let obj = pre_addr + 1;
        let size = area.mark(obj).size();
        if size == 0 {
            debug_assert!(false, "unparseable stack word at {:#x}", obj);
            break;
        }
        let mut pre = area.preheader(obj);
        if pre.is_live() {
            if pre.fid() > target {
                pre.set_fid(target);
                area.set_preheader(obj, pre);
            }
            objects += 1;
            words += size;
            for i in 1..=area.mark(obj).nrefs() {
                let mut field = Ref::from_raw(area.word(obj + i));
                if !field.is_stack() || field.addr() <= floor || field.addr() >= ceiling {
                    continue;
                }
                // Garbage may hold references that no longer name an object.
                if !area.preheader(field.addr()).is_live() {
                    continue;
                }
                let end = field.addr() + area.mark(field.addr()).size();
                if end > last {
                    last = end.min(ceiling);
                }
                if FIDS_IN_REF && field.cached_fid().map_or(false, |f| f > target) {
                    field = field.with_fid(target);
                    area.set_word(obj + i, field.raw());
                }
            }
        }
        pre_addr = obj + size;
    }

    Sweep {
        end: pre_addr - area.start(),
        objects,
        words,
    }
}

pub(crate) fn do_frame_escape(
    thread: &mut SbaThread,
    heap: &mut dyn Heap,
    escapee: Ref,
    target: Fid,
) -> Result<Ref> {
    thread.area.stats.frame_escape_events += 1;

    let escapee = make_heap_parsable(thread, heap, escapee)?;
    if !escapee.is_stack() {
        return Ok(escapee);
    }
    let escapee_fid = thread.area.preheader(escapee.addr()).fid();
    if escapee_fid <= target {
        return Ok(escapee.with_fid(escapee_fid));
    }

    let _no_gc = GcLocker::exclude(heap.gc_locker());

    let swept = record_time!(
        sweep(&mut thread.area, escapee, escapee_fid, target),
        thread.area.stats.sweep_time
    );
    thread.area.stats.frame_escape_objects += swept.objects as u64;
    thread.area.stats.frame_escape_words += swept.words as u64;

    if FIDS_IN_REF {
        let SbaThread { area, roots, .. } = thread;
        let mut v = UpdateFidsInStack {
            marks: MarkBits::new(area),
        };
        let mut cx = Spaces {
            area: &mut *area,
            heap: &mut *heap,
        };
        roots.roots_do(target, &mut cx, &mut v);
    }

    for fid in target..escapee_fid {
        if (fid as usize) < CAPPED_FID {
            thread.area.set_boundary(fid, swept.end);
        }
    }

    fence(Ordering::SeqCst);
    tracing::debug!(
        objects = swept.objects,
        words = swept.words,
        from = escapee_fid,
        to = target,
        boundary = swept.end,
        "frame escape done"
    );
    Ok(escapee.with_fid(target))
}
