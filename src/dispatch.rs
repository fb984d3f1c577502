//! The escape entry point: picks the engine for a destination, checks the
//! result and accounts the time spent.

use std::time::Instant;

use crate::error::{Result, SbaError};
use crate::frame_escape::do_frame_escape;
use crate::heap::Heap;
use crate::heap_escape::do_heap_escape;
use crate::stats::TELEMETRY;
use crate::tagged_pointer::Ref;
use crate::thread::SbaThread;
use crate::verify;
use crate::Fid;

/// Where an escaping object has to end up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Heap,
    /// A live frame at least as old as the object's own.
    Frame(Fid),
}

/// Make `value` safe to store where only objects of `dest` (or older) may be
/// referenced. Returns the reference to use from now on: a heap reference for
/// `Destination::Heap`, the same address re-parented to the frame otherwise
/// (or a heap reference if making the region parseable moved it there).
pub fn escape(
    thread: &mut SbaThread,
    heap: &mut dyn Heap,
    value: Ref,
    dest: Destination,
    reason: &str,
) -> Result<Ref> {
    if !value.is_stack() || !thread.area.contains(value.addr()) {
        return Err(SbaError::NotStackResident);
    }
    let started = Instant::now();
    let pre = thread.area.preheader(value.addr());
    debug_assert!(!pre.is_dead(), "escaping a vacated object");

    let result = match dest {
        Destination::Heap => {
            if thread.config.verify {
                verify::verify(thread, heap);
            }
            tracing::debug!(?value, %pre, reason, "escape to heap");
            do_heap_escape(thread, heap, value)?
        }
        Destination::Frame(fid) => {
            let current = thread.area.curr_fid();
            if fid > current {
                return Err(SbaError::InvalidFrame { fid, current });
            }
            if fid > pre.fid() {
                return Err(SbaError::EscapeToYoungerFrame {
                    from: pre.fid(),
                    to: fid,
                });
            }
            if fid == pre.fid() {
                return Ok(value);
            }
            if thread.config.verify {
                verify::verify(thread, heap);
            }
            tracing::debug!(?value, %pre, to = fid, reason, "escape to frame");
            do_frame_escape(thread, heap, value, fid)?
        }
    };

    debug_assert!(match dest {
        Destination::Heap => result.is_heap(),
        Destination::Frame(fid) =>
            !result.is_stack() || thread.area.preheader(result.addr()).fid() == fid,
    });
    if thread.config.verify {
        verify::verify(thread, heap);
    }

    let elapsed = started.elapsed();
    TELEMETRY.record_escape(elapsed);
    tracing::trace!(?result, elapsed_us = elapsed.as_micros() as u64, "escape done");
    Ok(result)
}

/// Escape `value` to the heap unless it is already there.
pub fn ensure_in_heap(
    thread: &mut SbaThread,
    heap: &mut dyn Heap,
    value: Ref,
    reason: &str,
) -> Result<Ref> {
    if value.is_stack() {
        escape(thread, heap, value, Destination::Heap, reason)
    } else {
        Ok(value)
    }
}
