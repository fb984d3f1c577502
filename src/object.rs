//! Object bodies. Every body, on the stack or in the heap, starts with a mark
//! word describing its size, how many of the following words are references,
//! its kind and its lock state.

use std::fmt;

/// Smallest body: the mark word plus one word to carry a forward reference.
pub const MIN_OBJECT_WORDS: usize = 2;

/// Kind of filler objects that pad unused chunk and frame space.
pub const FILLER_KIND: u8 = 0;

const SIZE_MASK: u64 = 0xffff_ffff;
const NREFS_SHIFT: u64 = 32;
const NREFS_MASK: u64 = 0xffff;
const KIND_SHIFT: u64 = 48;
const KIND_MASK: u64 = 0xff;
const LOCK_SHIFT: u64 = 56;
const LOCK_MASK: u64 = 0b11;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked = 0,
    /// Biased towards the owning thread; survives a move unchanged.
    SelfBiased = 1,
    /// Speculatively locked; must be re-established after a move.
    SpecLocked = 2,
}

#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Mark(u64);

impl Mark {
    pub fn new(size: usize, nrefs: usize, kind: u8) -> Mark {
        debug_assert!(size >= 1 && nrefs < size);
        Mark(
            (size as u64 & SIZE_MASK)
                | ((nrefs as u64 & NREFS_MASK) << NREFS_SHIFT)
                | ((kind as u64) << KIND_SHIFT),
        )
    }

    /// A reference-free object of `size` words that only pads space.
    pub fn filler(size: usize) -> Mark {
        Mark::new(size, 0, FILLER_KIND)
    }

    #[inline(always)]
    pub fn from_raw(raw: u64) -> Mark {
        Mark(raw)
    }

    #[inline(always)]
    pub fn raw(self) -> u64 {
        self.0
    }

    /// Body words, mark included.
    #[inline(always)]
    pub fn size(self) -> usize {
        (self.0 & SIZE_MASK) as usize
    }

    #[inline(always)]
    pub fn nrefs(self) -> usize {
        ((self.0 >> NREFS_SHIFT) & NREFS_MASK) as usize
    }

    #[inline(always)]
    pub fn kind(self) -> u8 {
        ((self.0 >> KIND_SHIFT) & KIND_MASK) as u8
    }

    pub fn is_filler(self) -> bool {
        self.kind() == FILLER_KIND
    }

    pub fn lock(self) -> LockState {
        match (self.0 >> LOCK_SHIFT) & LOCK_MASK {
            1 => LockState::SelfBiased,
            2 => LockState::SpecLocked,
            _ => LockState::Unlocked,
        }
    }

    pub fn with_lock(self, lock: LockState) -> Mark {
        Mark((self.0 & !(LOCK_MASK << LOCK_SHIFT)) | ((lock as u64) << LOCK_SHIFT))
    }
}

impl fmt::Debug for Mark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Mark {{ size: {}, nrefs: {}, kind: {}, lock: {:?} }}",
            self.size(),
            self.nrefs(),
            self.kind(),
            self.lock()
        )
    }
}

/// Re-establish the lock of an object that was moved while locked. Biased
/// locks belong to the owning thread and travel with the mark word, anything
/// else is re-taken speculatively at the new address.
pub fn lock_relock(mark: Mark) -> Mark {
    match mark.lock() {
        LockState::SelfBiased => mark,
        _ => mark.with_lock(LockState::SpecLocked),
    }
}

/// What the allocator is asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shape {
    pub kind: u8,
    pub refs: u16,
    pub scalars: u32,
}

impl Shape {
    pub fn new(kind: u8, refs: u16, scalars: u32) -> Shape {
        debug_assert!(kind != FILLER_KIND, "kind 0 is reserved for fillers");
        Shape {
            kind,
            refs,
            scalars,
        }
    }

    pub fn body_words(&self) -> usize {
        (1 + self.refs as usize + self.scalars as usize).max(MIN_OBJECT_WORDS)
    }

    pub fn mark(&self) -> Mark {
        Mark::new(self.body_words(), self.refs as usize, self.kind)
    }
}
