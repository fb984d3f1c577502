use std::ffi::CString;
use std::ptr::null;

use sba_rt::ffi::*;
use sba_rt::{Ref, HEAP_FID};

#[test]
fn escape_through_the_c_abi() {
    unsafe {
        let heap = sba_heap_new(1 << 12, 64);
        assert!(!heap.is_null());
        let thread = sba_thread_new(256, 1024);
        assert!(!thread.is_null());

        assert_eq!(sba_push_frame(thread), 1);
        assert_eq!(sba_push_frame(thread), 2);
        let a = sba_allocate(thread, heap, 1, 1, 1, 0);
        assert!(Ref::from_raw(a).is_stack());

        let why = CString::new("test").unwrap();
        let a1 = sba_escape(thread, heap, a, 1, why.as_ptr());
        assert_eq!(Ref::from_raw(a1).addr(), Ref::from_raw(a).addr());
        // Younger than the object's frame now.
        assert_eq!(sba_escape(thread, heap, a1, 2, null()), 0);

        let h = sba_escape(thread, heap, a1, HEAP_FID, why.as_ptr());
        assert!(Ref::from_raw(h).is_heap());
        assert_eq!(sba_ensure_in_heap(thread, heap, h, null()), h);
        assert_eq!(sba_escape(thread, heap, h, HEAP_FID, null()), 0);

        assert_eq!(sba_pop_frame(thread, heap), 0);
        assert_eq!(sba_pop_frame(thread, heap), 0);
        assert_eq!(sba_pop_frame(thread, heap), -1);

        sba_thread_free(thread);
        sba_heap_free(heap);
    }
}

#[test]
fn bad_arguments_are_refused() {
    unsafe {
        assert!(sba_thread_new(100, 1024).is_null());
        assert!(sba_heap_new(8, 16).is_null());
        assert_eq!(sba_push_frame(std::ptr::null_mut()), -1);

        let heap = sba_heap_new(1 << 10, 32);
        let thread = sba_thread_new(64, 64);
        assert_eq!(sba_allocate(thread, heap, 0, 0, 1, 0), 0);
        assert_eq!(sba_escape(thread, heap, 0, HEAP_FID, null()), 0);
        assert_eq!(sba_escape(thread, heap, 0, -7, null()), 0);
        let bogus = Ref::stack(1 << 20, 0).raw();
        assert_eq!(sba_escape(thread, heap, bogus, HEAP_FID, null()), 0);
        assert_eq!(sba_ensure_in_heap(thread, heap, bogus, null()), 0);
        sba_thread_free(thread);
        sba_heap_free(heap);
    }
}
