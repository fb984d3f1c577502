/*!

The foreign function interface which exposes the escape engine to generated
code. Threads and heaps are opaque pointers owned by the caller; references
cross the boundary as raw tagged words, 0 being null.

 */

use std::ffi::CStr;
use std::ptr::null_mut;

use libc::c_char;

use crate::config::SbaConfig;
use crate::dispatch::{ensure_in_heap, escape, Destination};
use crate::error::Result;
use crate::heap::ArenaHeap;
use crate::object::Shape;
use crate::preheader::SiteHint;
use crate::sites::EscapeSites;
use crate::tagged_pointer::Ref;
use crate::thread::SbaThread;
use crate::{Fid, HEAP_FID};

fn report<T>(what: &str, result: Result<T>) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(err) => {
            #[cfg(debug_assertions)]
            eprintln!("{}: {}", what, err);
            tracing::warn!(what, "call failed: {}", err);
            None
        }
    }
}

unsafe fn reason<'a>(s: *const c_char) -> &'a str {
    if s.is_null() {
        return "ffi";
    }
    CStr::from_ptr(s).to_str().unwrap_or("ffi")
}

#[no_mangle]
pub extern "C" fn sba_heap_new(words: usize, tlab_words: usize) -> *mut ArenaHeap {
    if tlab_words < 2 || words <= tlab_words {
        return null_mut();
    }
    Box::into_raw(Box::new(ArenaHeap::new(words, tlab_words)))
}

/// # Safety
///
/// `heap` must come from `sba_heap_new` and not be used afterwards.
#[no_mangle]
pub unsafe extern "C" fn sba_heap_free(heap: *mut ArenaHeap) {
    if !heap.is_null() {
        drop(Box::from_raw(heap));
    }
}

#[no_mangle]
pub extern "C" fn sba_thread_new(initial_words: usize, max_words: usize) -> *mut SbaThread {
    let config = SbaConfig {
        initial_stack_words: initial_words,
        max_stack_words: max_words,
        ..SbaConfig::default()
    };
    match report("sba_thread_new", SbaThread::new(config.clone(), EscapeSites::global(&config))) {
        Some(thread) => Box::into_raw(Box::new(thread)),
        None => null_mut(),
    }
}

/// # Safety
///
/// `thread` must come from `sba_thread_new` and not be used afterwards.
#[no_mangle]
pub unsafe extern "C" fn sba_thread_free(thread: *mut SbaThread) {
    if !thread.is_null() {
        drop(Box::from_raw(thread));
    }
}

/// Returns the new frame's id.
///
/// # Safety
///
/// `thread` must be a live pointer from `sba_thread_new`.
#[no_mangle]
pub unsafe extern "C" fn sba_push_frame(thread: *mut SbaThread) -> i32 {
    match thread.as_mut() {
        Some(thread) => thread.push_frame() as i32,
        None => -1,
    }
}

/// # Safety
///
/// Both pointers must be live and unaliased.
#[no_mangle]
pub unsafe extern "C" fn sba_pop_frame(thread: *mut SbaThread, heap: *mut ArenaHeap) -> i32 {
    let (thread, heap) = match (thread.as_mut(), heap.as_mut()) {
        (Some(t), Some(h)) => (t, h),
        _ => return -1,
    };
    if thread.area().depth() == 0 {
        return -1;
    }
    match report("sba_pop_frame", thread.pop_frame(heap)) {
        Some(()) => 0,
        None => -1,
    }
}

/// Allocate an object with `refs` reference fields and `scalars` scalar
/// words, on the stack if possible. `site` is an allocation-site id, 0 for
/// none.
///
/// # Safety
///
/// Both pointers must be live and unaliased.
#[no_mangle]
pub unsafe extern "C" fn sba_allocate(
    thread: *mut SbaThread,
    heap: *mut ArenaHeap,
    kind: u8,
    refs: u16,
    scalars: u32,
    site: u32,
) -> u64 {
    let (thread, heap) = match (thread.as_mut(), heap.as_mut()) {
        (Some(t), Some(h)) => (t, h),
        _ => return 0,
    };
    if kind == 0 {
        return 0;
    }
    let hint = if site == 0 {
        SiteHint::None
    } else {
        SiteHint::Pc(site)
    };
    report(
        "sba_allocate",
        thread.new_object(heap, Shape::new(kind, refs, scalars), hint),
    )
    .map_or(0, Ref::raw)
}

/// Escape `value` to frame `dest_fid`, or to the heap for `HEAP_FID`.
/// Returns the reference to use from now on, 0 on failure.
///
/// # Safety
///
/// Both pointers must be live and unaliased; `why` is null or a C string.
#[no_mangle]
pub unsafe extern "C" fn sba_escape(
    thread: *mut SbaThread,
    heap: *mut ArenaHeap,
    value: u64,
    dest_fid: i32,
    why: *const c_char,
) -> u64 {
    let (thread, heap) = match (thread.as_mut(), heap.as_mut()) {
        (Some(t), Some(h)) => (t, h),
        _ => return 0,
    };
    let dest = match dest_fid {
        HEAP_FID => Destination::Heap,
        fid if fid >= 0 => Destination::Frame(fid as Fid),
        _ => return 0,
    };
    report(
        "sba_escape",
        escape(thread, heap, Ref::from_raw(value), dest, reason(why)),
    )
    .map_or(0, Ref::raw)
}

/// # Safety
///
/// Both pointers must be live and unaliased; `why` is null or a C string.
#[no_mangle]
pub unsafe extern "C" fn sba_ensure_in_heap(
    thread: *mut SbaThread,
    heap: *mut ArenaHeap,
    value: u64,
    why: *const c_char,
) -> u64 {
    let (thread, heap) = match (thread.as_mut(), heap.as_mut()) {
        (Some(t), Some(h)) => (t, h),
        _ => return 0,
    };
    report(
        "sba_ensure_in_heap",
        ensure_in_heap(thread, heap, Ref::from_raw(value), reason(why)),
    )
    .map_or(0, Ref::raw)
}
