/*!

The per-thread stack allocation region.

The region reserves two halves of `max_stack_words` words each. `start` names
the half currently in use; the stack collector copies into the other one and
flips. Addresses handed out are indices into the reservation, so an address in
the old half can never be mistaken for one in the new half.

```text
    start            fid_top[0]        fid_top[1]               top       max
      |  frame 0 objs  |  frame 1 objs  |  frame 2 (current) objs  |  zeroes  |
```

Each object is a pre-header word followed by its body. Everything in
`[top, max)` is kept zeroed.

*/

use std::fmt;
use std::time::Instant;

use crate::config::SbaConfig;
use crate::object::{Mark, Shape};
use crate::preheader::{PreHeader, SiteHint};
use crate::stats::AreaStats;
use crate::tagged_pointer::Ref;
use crate::{Fid, MAX_FID};

/// Deepest frame with a frame id of its own; deeper frames share it.
pub(crate) const CAPPED_FID: usize = MAX_FID as usize - 1;

#[cfg(all(debug_assertions, not(feature = "nopoison")))]
const BAD_WORD: u64 = 0xbaad_baad_baad_baad;

pub struct SbaArea {
    pub(crate) space: Vec<u64>,
    pub(crate) half: usize,
    pub(crate) start: usize,
    pub(crate) max: usize,
    pub(crate) top: usize,
    /// Frame depth, not capped.
    pub(crate) fid_no_cap: usize,
    /// Offsets from `start`. `fid_top[f]` is where frame `f + 1` begins.
    pub(crate) fid_top: [usize; MAX_FID as usize],
    /// Set when metadata of dead objects may have gone stale and the region
    /// must be collected before it is swept.
    pub(crate) needs_parse_gc: bool,
    pub(crate) last_gc: Option<Instant>,
    pub(crate) stats: AreaStats,
}

impl SbaArea {
    pub fn new(config: &SbaConfig) -> SbaArea {
        let half = config.max_stack_words;
        let mut area = SbaArea {
            space: vec![0; 2 * half],
            half,
            start: 0,
            max: 0,
            top: 0,
            fid_no_cap: 0,
            fid_top: [0; MAX_FID as usize],
            needs_parse_gc: false,
            last_gc: None,
            stats: AreaStats::default(),
        };
        area.setup_alloc_space(0, config.initial_stack_words);
        area
    }

    /// Point the region at `[start, start + words)` and zero it.
    pub(crate) fn setup_alloc_space(&mut self, start: usize, words: usize) {
        debug_assert!(words <= self.half);
        debug_assert!(start == 0 || start == self.half);
        self.zero(start, start + words);
        self.start = start;
        self.max = start + words;
        self.top = start;
    }

    pub(crate) fn other_half(&self) -> usize {
        if self.start == 0 {
            self.half
        } else {
            0
        }
    }

    #[inline(always)]
    pub fn start(&self) -> usize {
        self.start
    }

    #[inline(always)]
    pub fn top(&self) -> usize {
        self.top
    }

    #[inline(always)]
    pub fn max(&self) -> usize {
        self.max
    }

    /// Words in use.
    #[inline(always)]
    pub fn used(&self) -> usize {
        self.top - self.start
    }

    pub fn capacity(&self) -> usize {
        self.max - self.start
    }

    pub fn free(&self) -> usize {
        self.max - self.top
    }

    /// Whether `addr` can be the body of an object in the live part of the
    /// region: its pre-header must fit above `start`.
    #[inline(always)]
    pub fn contains(&self, addr: usize) -> bool {
        addr > self.start && addr < self.top
    }

    #[inline(always)]
    pub fn curr_fid(&self) -> Fid {
        self.fid_no_cap.min(CAPPED_FID) as Fid
    }

    /// Frame depth, counting frames past the frame id cap.
    pub fn depth(&self) -> usize {
        self.fid_no_cap
    }

    pub fn stats(&self) -> &AreaStats {
        &self.stats
    }

    /* ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~ */

    /// Bump-allocate an object for the current frame. `None` if it does not
    /// fit; the caller falls back to the heap.
    pub fn allocate(&mut self, shape: Shape, hint: SiteHint) -> Option<Ref> {
        let body = shape.body_words();
        if self.top + 1 + body > self.max {
            return None;
        }
        let fid = self.curr_fid();
        let pre = self.top;
        self.top += 1 + body;
        let obj = pre + 1;
        self.space[pre] = PreHeader::new(fid, hint).raw();
        self.space[obj] = shape.mark().raw();
        debug_assert!(self.space[obj + 1..obj + body].iter().all(|w| *w == 0));
        Some(Ref::stack(obj, fid))
    }

    /// Record the current high-water mark and open a new frame.
    pub fn enter_frame(&mut self) -> Fid {
        if self.fid_no_cap < CAPPED_FID {
            self.fid_top[self.fid_no_cap] = self.used();
        }
        self.fid_no_cap += 1;
        self.curr_fid()
    }

    /// Discard the current frame's objects. Anything that had to survive must
    /// already have been escaped.
    pub fn exit_frame(&mut self) {
        debug_assert!(self.fid_no_cap > 0, "popping the root frame");
        self.fid_no_cap -= 1;
        if self.fid_no_cap >= CAPPED_FID {
            return;
        }
        let new_top = self.start + self.fid_top[self.fid_no_cap];
        debug_assert!(new_top <= self.top);
        self.zero(new_top, self.top);
        self.top = new_top;
    }

    /// Offset of the end of frame `fid`. A sweep that starts in a frame may
    /// not go past this without leaving it.
    pub fn boundary_of(&self, fid: Fid) -> usize {
        if fid >= self.curr_fid() {
            self.used()
        } else {
            self.fid_top[fid as usize]
        }
    }

    /// Offset where frame `fid` begins.
    pub fn frame_base(&self, fid: Fid) -> usize {
        if fid == 0 {
            0
        } else {
            self.boundary_of(fid - 1)
        }
    }

    pub(crate) fn set_boundary(&mut self, fid: Fid, offset: usize) {
        debug_assert!((fid as usize) < CAPPED_FID && fid < self.curr_fid());
        self.fid_top[fid as usize] = offset;
    }

    /// Give back everything from `pre_addr` up, pulling frame boundaries
    /// above it down with the bump pointer.
    pub(crate) fn roll_back_top(&mut self, pre_addr: usize) {
        debug_assert!(pre_addr >= self.start && pre_addr <= self.top);
        let offset = pre_addr - self.start;
        let mut fid = self.curr_fid() as usize;
        while fid > 0 {
            fid -= 1;
            if self.fid_top[fid] <= offset {
                break;
            }
            self.fid_top[fid] = offset;
        }
        let old_top = self.top;
        self.top = pre_addr;
        self.zero(pre_addr, old_top);
    }

    /* ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~ */

    #[inline(always)]
    pub fn word(&self, addr: usize) -> u64 {
        self.space[addr]
    }

    #[inline(always)]
    pub fn set_word(&mut self, addr: usize, w: u64) {
        self.space[addr] = w;
    }

    #[inline(always)]
    pub fn preheader(&self, obj: usize) -> PreHeader {
        PreHeader::from_raw(self.space[obj - 1])
    }

    #[inline(always)]
    pub(crate) fn set_preheader(&mut self, obj: usize, pre: PreHeader) {
        self.space[obj - 1] = pre.raw();
    }

    #[inline(always)]
    pub fn mark(&self, obj: usize) -> Mark {
        Mark::from_raw(self.space[obj])
    }

    /// The whole body of the object at `obj`, mark included.
    pub fn body(&self, obj: usize) -> &[u64] {
        let size = self.mark(obj).size();
        &self.space[obj..obj + size]
    }

    /// Whether none of the reference fields of `obj` point into a stack
    /// region.
    pub fn has_no_stack_refs(&self, obj: usize) -> bool {
        let nrefs = self.mark(obj).nrefs();
        (1..=nrefs).all(|i| !Ref::from_raw(self.space[obj + i]).is_stack())
    }

    /// Vacate `obj`, leaving `target` in body word 1.
    pub(crate) fn forward_to(&mut self, obj: usize, target: Ref) {
        let mut pre = self.preheader(obj);
        pre.mark_forwarded();
        self.set_preheader(obj, pre);
        self.space[obj + 1] = target.raw();
    }

    pub fn forwardee(&self, obj: usize) -> Ref {
        debug_assert!(self.preheader(obj).is_forwarded());
        Ref::from_raw(self.space[obj + 1])
    }

    /// Overwrite a vacated body past its mark and forward word.
    #[allow(unused_variables)]
    pub(crate) fn poison(&mut self, obj: usize, size: usize) {
        #[cfg(all(debug_assertions, not(feature = "nopoison")))]
        for w in &mut self.space[obj + 2..obj + size] {
            *w = BAD_WORD;
        }
    }

    pub(crate) fn zero(&mut self, from: usize, to: usize) {
        for w in &mut self.space[from..to] {
            *w = 0;
        }
    }

    /// Objects from `start` to `top`, in address order.
    pub fn objects(&self) -> AreaIter<'_> {
        self.objects_between(self.start, self.top)
    }

    /// Objects whose pre-header lies in `[from, to)`.
    pub fn objects_between(&self, from: usize, to: usize) -> AreaIter<'_> {
        AreaIter {
            area: self,
            pos: from,
            end: to,
        }
    }
}

/// Walks a region span header to header, yielding body addresses.
pub struct AreaIter<'a> {
    area: &'a SbaArea,
    pos: usize,
    end: usize,
}

impl Iterator for AreaIter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.pos >= self.end {
            return None;
        }
        let obj = self.pos + 1;
        let size = self.area.mark(obj).size();
        if size == 0 {
            debug_assert!(false, "zero-sized object at {:#x}", obj);
            self.pos = self.end;
            return None;
        }
        self.pos = obj + size;
        Some(obj)
    }
}

impl fmt::Display for SbaArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "SbaArea [{:#x}, {:#x}) top {:#x}, fid {} (depth {})",
            self.start,
            self.max,
            self.top,
            self.curr_fid(),
            self.fid_no_cap
        )?;
        for fid in 0..self.curr_fid() {
            write!(f, " {}:{:#x}", fid, self.fid_top[fid as usize])?;
        }
        writeln!(f)?;
        for obj in self.objects() {
            writeln!(f, "  {:#x} {} {:?}", obj, self.preheader(obj), self.mark(obj))?;
        }
        Ok(())
    }
}
