/*!

Tagged references. A reference is one 64-bit word: the two high bits name the
space the target lives in (null, stack region or heap), the low 48 bits hold
its word address. When the `fids_in_ref` feature is enabled, bits 48..56 also
cache the owning frame id of a stack target, so generated code can compare
frames without loading the pre-header.

*/

use std::fmt;

use crate::Fid;

/* ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~ */

/// The number of bits reserved for the address.
const POINTER_BITS: u64 = 48;

/// A mask to remove everything above the address.
const ADDR_MASK: u64 = (1 << POINTER_BITS) - 1;

/// Where the cached frame id starts.
const FID_SHIFT: u64 = POINTER_BITS;

const FID_MASK: u64 = 0xff;

/// Where the space id starts.
const SPACE_SHIFT: u64 = 62;

/// Whether stack references carry their frame id.
#[cfg(feature = "fids_in_ref")]
pub(crate) const FIDS_IN_REF: bool = true;
#[cfg(not(feature = "fids_in_ref"))]
pub(crate) const FIDS_IN_REF: bool = false;

/// The space a reference points into.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Space {
    Null = 0,
    Stack = 1,
    Heap = 2,
}

/// A tagged reference to an object body.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Ref(u64);

impl Ref {
    pub const NULL: Ref = Ref(0);

    #[inline(always)]
    pub fn stack(addr: usize, fid: Fid) -> Ref {
        debug_assert!(addr as u64 <= ADDR_MASK);
        let r = Ref((addr as u64) | ((Space::Stack as u64) << SPACE_SHIFT));
        r.with_fid(fid)
    }

    #[inline(always)]
    pub fn heap(addr: usize) -> Ref {
        debug_assert!(addr as u64 <= ADDR_MASK);
        Ref((addr as u64) | ((Space::Heap as u64) << SPACE_SHIFT))
    }

    #[inline(always)]
    pub fn from_raw(raw: u64) -> Ref {
        Ref(raw)
    }

    #[inline(always)]
    pub fn raw(self) -> u64 {
        self.0
    }

    #[inline(always)]
    pub fn space(self) -> Space {
        match self.0 >> SPACE_SHIFT {
            0 => Space::Null,
            1 => Space::Stack,
            _ => Space::Heap,
        }
    }

    #[inline(always)]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline(always)]
    pub fn is_stack(self) -> bool {
        self.space() == Space::Stack
    }

    #[inline(always)]
    pub fn is_heap(self) -> bool {
        self.space() == Space::Heap
    }

    #[inline(always)]
    pub fn addr(self) -> usize {
        (self.0 & ADDR_MASK) as usize
    }

    /// The frame id cached in the reference bits, if this build caches them.
    #[inline(always)]
    pub fn cached_fid(self) -> Option<Fid> {
        if FIDS_IN_REF && self.is_stack() {
            Some(((self.0 >> FID_SHIFT) & FID_MASK) as Fid)
        } else {
            None
        }
    }

    /// Re-stamp the cached frame id. A no-op unless FIDs live in references.
    #[inline(always)]
    pub fn with_fid(self, fid: Fid) -> Ref {
        if FIDS_IN_REF && self.is_stack() {
            debug_assert!(fid as u64 <= FID_MASK);
            let cleared = self.0 & !(FID_MASK << FID_SHIFT);
            Ref(cleared | ((fid as u64 & FID_MASK) << FID_SHIFT))
        } else {
            self
        }
    }

    /// A derived (interior) reference `delta` words away from this one, in
    /// the same space.
    #[inline(always)]
    pub fn offset(self, delta: isize) -> Ref {
        let addr = (self.addr() as isize + delta) as u64;
        debug_assert!(addr <= ADDR_MASK);
        Ref((self.0 & !ADDR_MASK) | addr)
    }
}

impl fmt::Debug for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.space() {
            Space::Null => write!(f, "null"),
            Space::Heap => write!(f, "heap:{:#x}", self.addr()),
            Space::Stack => match self.cached_fid() {
                Some(fid) => write!(f, "stack:{:#x}[fid {}]", self.addr(), fid),
                None => write!(f, "stack:{:#x}", self.addr()),
            },
        }
    }
}

impl fmt::Binary for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let val = self.0;
        fmt::Binary::fmt(&val, f) // delegate to u64's implementation
    }
}

#[test]
fn test_reference_tagging() {
    let s = Ref::stack(0x1234, 7);
    assert!(s.is_stack());
    assert_eq!(s.addr(), 0x1234);
    if FIDS_IN_REF {
        assert_eq!(s.cached_fid(), Some(7));
        assert_eq!(s.with_fid(3).cached_fid(), Some(3));
        assert_eq!(s.with_fid(3).addr(), 0x1234);
    } else {
        assert_eq!(s.cached_fid(), None);
        assert_eq!(s.with_fid(3), s);
    }

    let h = Ref::heap(0x40);
    assert!(h.is_heap());
    assert_eq!(h.addr(), 0x40);
    assert_eq!(h.cached_fid(), None);
    assert_eq!(h.offset(3).addr(), 0x43);
    assert!(h.offset(3).is_heap());

    assert!(Ref::NULL.is_null());
    assert_eq!(Ref::NULL.space(), Space::Null);
    assert_eq!(Ref::from_raw(s.raw()), s);
    // A stack reference at address zero is not null.
    assert!(!Ref::stack(0, 0).is_null());
}
