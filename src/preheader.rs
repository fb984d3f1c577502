/*!

The pre-header: one word stored immediately before the body of every object
allocated in a stack region.

```text
    bits  0..8   owning frame id
    bits  8..10  liveness (live, dead, forwarded)
    bits 10..12  allocation-site hint kind (none, method + bci, pc)
    bit  12      escaped to the heap at least once
    bits 16..32  bytecode index
    bits 32..64  site id (method id or pc)
```

*/

use std::fmt;

use crate::sites::EscapeSites;
use crate::Fid;

const FID_MASK: u64 = 0xff;

const STATE_SHIFT: u64 = 8;
const STATE_MASK: u64 = 0b11 << STATE_SHIFT;
const LIVE: u64 = 0;
const DEAD: u64 = 2;
const FORWARDED: u64 = 3;

const HINT_SHIFT: u64 = 10;
const HINT_MASK: u64 = 0b11 << HINT_SHIFT;
const HINT_NONE: u64 = 0;
const HINT_METHOD: u64 = 1;
const HINT_PC: u64 = 2;

const ESCAPED_BIT: u64 = 1 << 12;

const BCI_SHIFT: u64 = 16;
const SITE_SHIFT: u64 = 32;

/// Where an object was allocated, as far as the allocator knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteHint {
    None,
    /// Interpreted allocation: method id and bytecode index.
    Method { method: u32, bci: u16 },
    /// Compiled allocation: the allocating pc.
    Pc(u32),
}

#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PreHeader(u64);

impl PreHeader {
    pub fn new(fid: Fid, hint: SiteHint) -> PreHeader {
        debug_assert!(fid as u64 <= FID_MASK);
        let hint_bits = match hint {
            SiteHint::None => 0,
            SiteHint::Method { method, bci } => {
                (HINT_METHOD << HINT_SHIFT)
                    | ((bci as u64) << BCI_SHIFT)
                    | ((method as u64) << SITE_SHIFT)
            }
            SiteHint::Pc(pc) => (HINT_PC << HINT_SHIFT) | ((pc as u64) << SITE_SHIFT),
        };
        PreHeader((fid as u64 & FID_MASK) | hint_bits)
    }

    #[inline(always)]
    pub fn from_raw(raw: u64) -> PreHeader {
        PreHeader(raw)
    }

    #[inline(always)]
    pub fn raw(self) -> u64 {
        self.0
    }

    #[inline(always)]
    pub fn fid(self) -> Fid {
        (self.0 & FID_MASK) as Fid
    }

    /// Re-parent to an older frame. Frame ids only ever go down.
    #[inline(always)]
    pub fn set_fid(&mut self, fid: Fid) {
        debug_assert!(
            fid <= self.fid(),
            "raising fid {} to {} would orphan the object",
            self.fid(),
            fid
        );
        self.0 = (self.0 & !FID_MASK) | (fid as u64 & FID_MASK);
    }

    #[inline(always)]
    fn state(self) -> u64 {
        (self.0 & STATE_MASK) >> STATE_SHIFT
    }

    #[inline(always)]
    pub fn is_live(self) -> bool {
        self.state() == LIVE
    }

    /// True for vacated objects, with or without a forward reference.
    #[inline(always)]
    pub fn is_dead(self) -> bool {
        self.state() != LIVE
    }

    #[inline(always)]
    pub fn is_forwarded(self) -> bool {
        self.state() == FORWARDED
    }

    pub fn mark_dead(&mut self) {
        debug_assert!(self.is_live(), "object died twice");
        self.0 = (self.0 & !STATE_MASK) | (DEAD << STATE_SHIFT);
    }

    /// The forward reference itself lives in body word 1, see
    /// `SbaArea::forward_to`.
    pub fn mark_forwarded(&mut self) {
        debug_assert!(self.is_live(), "object moved twice");
        self.0 = (self.0 & !STATE_MASK) | (FORWARDED << STATE_SHIFT);
    }

    pub fn hint(self) -> SiteHint {
        let site = (self.0 >> SITE_SHIFT) as u32;
        match (self.0 & HINT_MASK) >> HINT_SHIFT {
            HINT_METHOD => SiteHint::Method {
                method: site,
                bci: (self.0 >> BCI_SHIFT) as u16,
            },
            HINT_PC => SiteHint::Pc(site),
            _ => SiteHint::None,
        }
    }

    pub fn has_hint(self) -> bool {
        (self.0 & HINT_MASK) >> HINT_SHIFT != HINT_NONE
    }

    /// Forget the allocation site. Used when site metadata may be stale.
    pub fn zap_hint(&mut self) {
        self.0 &= FID_MASK | STATE_MASK | ESCAPED_BIT;
    }

    pub fn escaped(self) -> bool {
        self.0 & ESCAPED_BIT != 0
    }

    /// The pre-header with frame, liveness and escape bits masked out. Two
    /// objects from the same allocation site have equal signatures whatever
    /// frame they live in.
    #[inline(always)]
    pub fn site_signature(self) -> u64 {
        self.0 & !(FID_MASK | STATE_MASK | ESCAPED_BIT)
    }

    /// Stamp "escaped to heap" and tell the site table about it.
    pub fn update_allocation_site(&mut self, sites: &EscapeSites, use_hints: bool) {
        self.0 |= ESCAPED_BIT;
        if use_hints && self.has_hint() {
            sites.record_escape(self.site_signature());
        }
    }
}

impl fmt::Debug for PreHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for PreHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state() {
            LIVE => "live",
            DEAD => "dead",
            FORWARDED => "fwd",
            _ => "bad",
        };
        write!(f, "fid={} {}", self.fid(), state)?;
        if self.escaped() {
            write!(f, " escaped")?;
        }
        match self.hint() {
            SiteHint::None => Ok(()),
            SiteHint::Method { method, bci } => write!(f, " m{}@{}", method, bci),
            SiteHint::Pc(pc) => write!(f, " pc={:#x}", pc),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preheader_fields() {
        let hint = SiteHint::Method {
            method: 0xdead,
            bci: 17,
        };
        let mut pre = PreHeader::new(5, hint);
        assert_eq!(pre.fid(), 5);
        assert_eq!(pre.hint(), hint);
        assert!(pre.is_live());
        assert!(!pre.escaped());

        pre.set_fid(3);
        assert_eq!(pre.fid(), 3);
        assert_eq!(pre.hint(), hint);

        pre.mark_forwarded();
        assert!(pre.is_dead());
        assert!(pre.is_forwarded());

        let mut hole = PreHeader::new(1, SiteHint::None);
        hole.mark_dead();
        assert!(hole.is_dead());
        assert!(!hole.is_forwarded());
        assert_eq!(hole.fid(), 1);
        assert_eq!(hole.to_string(), "fid=1 dead");
    }

    #[test]
    fn test_signature_ignores_frame() {
        let a = PreHeader::new(2, SiteHint::Pc(0x4000));
        let mut b = PreHeader::new(9, SiteHint::Pc(0x4000));
        b.update_allocation_site(&EscapeSites::new(8), false);
        assert!(b.escaped());
        assert_eq!(a.site_signature(), b.site_signature());
        assert_ne!(
            a.site_signature(),
            PreHeader::new(2, SiteHint::Pc(0x4001)).site_signature()
        );
    }

    #[test]
    fn test_zap_hint() {
        let mut pre = PreHeader::new(4, SiteHint::Pc(7));
        pre.zap_hint();
        assert_eq!(pre.hint(), SiteHint::None);
        assert_eq!(pre.fid(), 4);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic]
    fn test_raising_fid_panics() {
        let mut pre = PreHeader::new(2, SiteHint::None);
        pre.set_fid(3);
    }
}
