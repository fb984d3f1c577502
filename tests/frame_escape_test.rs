mod utils;

use sba_rt::*;
use utils::graph::*;

/// Frames 1 to `depth`, with a small object in each.
fn nest(t: &mut SbaThread, heap: &mut ArenaHeap, depth: usize) {
    for i in 0..depth {
        t.push_frame();
        let o = leaf(t, heap, 100 + i as u64);
        t.set_local(0, o);
    }
}

#[test]
fn reparent_in_place() {
    let mut heap = heap();
    let mut t = thread();
    nest(&mut t, &mut heap, 4);
    let x = leaf(&mut t, &mut heap, 7);
    t.set_local(1, x);
    let x_end = x.addr() + 2 - t.area().start();

    let x2 = escape(&mut t, &mut heap, x, Destination::Frame(2), "test").unwrap();
    assert_eq!(x2.addr(), x.addr());
    assert_eq!(t.area().preheader(x.addr()).fid(), 2);
    // Frames 3 and 4 now start after x.
    assert_eq!(t.area().boundary_of(2), x_end);
    assert_eq!(t.area().boundary_of(3), x_end);
    assert_eq!(t.area().frame_base(4), x_end);
    // Everything between frame 2's old end and x went along.
    let frame3_obj = t.local(3, 0);
    assert_eq!(t.area().preheader(frame3_obj.addr()).fid(), 2);
    assert_eq!(t.stats().frame_escape_events, 1);
    assert_eq!(t.stats().frame_escape_objects, 3);

    // x now outlives frame 4.
    t.pop_frame(&mut heap).unwrap();
    t.pop_frame(&mut heap).unwrap();
    assert_eq!(t.curr_fid(), 2);
    assert!(t.area().contains(x.addr()));
    assert_eq!(tag(&t, &heap, x2), 7);
}

#[test]
fn reached_objects_are_swept() {
    let mut heap = heap();
    let mut t = thread();
    nest(&mut t, &mut heap, 2);
    let y = leaf(&mut t, &mut heap, 2);
    let x = node(&mut t, &mut heap, 1, &[y]);
    // Allocated after x but reachable from it.
    let z = leaf(&mut t, &mut heap, 3);
    t.store_field(&mut heap, x, 1, z).unwrap();
    t.set_local(1, x);
    t.set_local(2, y);

    escape(&mut t, &mut heap, x, Destination::Frame(1), "test").unwrap();
    for r in [x, z] {
        assert_eq!(t.area().preheader(r.addr()).fid(), 1);
    }
    assert_eq!(t.area().boundary_of(1), z.addr() + 2 - t.area().start());
    t.verify(&mut heap);
}

#[test]
fn swept_objects_take_their_referents_along() {
    let mut heap = heap();
    let mut t = thread();
    t.push_frame();
    let a = node(&mut t, &mut heap, 1, &[Ref::NULL]);
    t.set_local(0, a);
    let x = leaf(&mut t, &mut heap, 2);
    t.set_local(1, x);
    // Not reachable from x, but from a, which lies below x.
    let b = leaf(&mut t, &mut heap, 3);
    t.store_field(&mut heap, a, 1, b).unwrap();

    escape(&mut t, &mut heap, x, Destination::Frame(0), "test").unwrap();
    for r in [a, x, b] {
        assert_eq!(t.area().preheader(r.addr()).fid(), 0);
    }
    assert_eq!(t.area().boundary_of(0), b.addr() + 2 - t.area().start());
    assert_eq!(t.stats().frame_escape_objects, 3);
    t.verify(&mut heap);
    t.pop_frame(&mut heap).unwrap();
    assert_eq!(tag(&t, &heap, t.load_field(&heap, a, 1)), 3);
}

#[test]
fn bad_destinations_are_rejected() {
    let mut heap = heap();
    let mut t = thread();
    nest(&mut t, &mut heap, 4);
    t.pop_frame(&mut heap).unwrap();
    t.pop_frame(&mut heap).unwrap();
    let x = t.local(2, 0);
    t.push_frame();
    t.push_frame();

    assert_eq!(
        escape(&mut t, &mut heap, x, Destination::Frame(3), "test"),
        Err(SbaError::EscapeToYoungerFrame { from: 2, to: 3 })
    );
    assert_eq!(
        escape(&mut t, &mut heap, x, Destination::Frame(9), "test"),
        Err(SbaError::InvalidFrame {
            fid: 9,
            current: 4
        })
    );
    // Already there.
    assert_eq!(
        escape(&mut t, &mut heap, x, Destination::Frame(2), "test"),
        Ok(x)
    );
    assert_eq!(t.stats().frame_escape_events, 0);
}

#[test]
fn barriers_reparent_stored_values() {
    let mut heap = heap();
    let mut t = thread();
    nest(&mut t, &mut heap, 1);
    let holder = node(&mut t, &mut heap, 1, &[Ref::NULL]);
    t.set_local(1, holder);
    nest(&mut t, &mut heap, 2);
    assert_eq!(t.curr_fid(), 3);

    let v = leaf(&mut t, &mut heap, 5);
    let stored = t.store_field(&mut heap, holder, 1, v).unwrap();
    assert_eq!(stored.addr(), v.addr());
    assert_eq!(t.area().preheader(v.addr()).fid(), 1);
    assert_eq!(t.load_field(&heap, holder, 1), stored);

    let w = leaf(&mut t, &mut heap, 6);
    let rooted = t.store_root(&mut heap, 2, 1, w).unwrap();
    assert_eq!(t.area().preheader(rooted.addr()).fid(), 2);
    assert_eq!(t.local(2, 1), rooted);

    // Both survive the frames they were made in.
    t.pop_frame(&mut heap).unwrap();
    t.pop_frame(&mut heap).unwrap();
    assert_eq!(tag(&t, &heap, t.load_field(&heap, holder, 1)), 5);
    t.verify(&mut heap);
}

#[test]
fn exception_with_references_escapes_on_pop() {
    let mut heap = heap();
    let mut t = thread();
    nest(&mut t, &mut heap, 2);
    let cause = leaf(&mut t, &mut heap, 2);
    let exc = node(&mut t, &mut heap, 1, &[cause]);
    t.set_pending_exception(exc);
    let before = snapshot(&t, &heap, exc);

    t.pop_frame(&mut heap).unwrap();
    let exc2 = t.pending_exception();
    assert!(exc2.is_stack());
    assert_eq!(t.area().preheader(exc2.addr()).fid(), 1);
    let cause2 = t.load_field(&heap, exc2, 1);
    assert_eq!(t.area().preheader(cause2.addr()).fid(), 1);
    assert_eq!(snapshot(&t, &heap, exc2), before);
    assert_eq!(t.stats().frame_escape_events, 1);
    assert_eq!(t.stats().cheap_escapes, 0);
    t.verify(&mut heap);
}

#[test]
fn stale_metadata_collects_first() {
    let mut heap = heap();
    let mut t = thread();
    nest(&mut t, &mut heap, 3);
    let x = t
        .new_object(&mut heap, Shape::new(2, 0, 1), SiteHint::Pc(77))
        .unwrap();
    t.set_local(1, x);
    t.gc_moved_metadata();

    let x2 = escape(&mut t, &mut heap, x, Destination::Frame(1), "test").unwrap();
    assert_eq!(t.stats().stack_collections, 1);
    assert!(x2.is_stack());
    assert_ne!(x2.addr(), x.addr());
    assert_eq!(t.area().preheader(x2.addr()).fid(), 1);
    assert!(!t.area().preheader(x2.addr()).has_hint());
    assert_eq!(t.local(3, 1), x2);
    t.verify(&mut heap);
}
