//! Build object graphs on a thread and take snapshots of what is reachable
//! from a reference, independent of where the objects live.

#![allow(dead_code)]

use std::sync::Arc;

use rustc_hash::FxHashMap;

use sba_rt::*;

pub fn config() -> SbaConfig {
    SbaConfig {
        initial_stack_words: 1024,
        max_stack_words: 4096,
        verify: true,
        ..SbaConfig::default()
    }
}

/// A thread with its own escape-site table, so tests do not share counts.
pub fn thread_with(config: SbaConfig) -> SbaThread {
    let threshold = config.escape_threshold;
    SbaThread::new(config, Arc::new(EscapeSites::new(threshold))).unwrap()
}

pub fn thread() -> SbaThread {
    thread_with(config())
}

pub fn heap() -> ArenaHeap {
    ArenaHeap::new(1 << 16, 256)
}

/// A reference-free object carrying `tag`.
pub fn leaf(t: &mut SbaThread, heap: &mut ArenaHeap, tag: u64) -> Ref {
    node(t, heap, tag, &[])
}

/// An object with one reference field per entry of `kids` and a scalar
/// `tag` after them. Stores go through the barrier. The kids are held in
/// handles while allocating, in case the region is collected.
pub fn node(t: &mut SbaThread, heap: &mut ArenaHeap, tag: u64, kids: &[Ref]) -> Ref {
    let base = t.roots().handle_count();
    for k in kids {
        t.roots_mut().push_handle(*k);
    }
    let obj = t
        .new_object(heap, Shape::new(1, kids.len() as u16, 1), SiteHint::None)
        .unwrap();
    t.store_word(heap, obj, kids.len() + 1, tag);
    for i in 0..kids.len() {
        let k = t.roots().handle(base + i);
        t.store_field(heap, obj, i + 1, k).unwrap();
    }
    t.roots_mut().truncate_handles(base);
    obj
}

/// The scalar tag of an object built by `node`.
pub fn tag(t: &SbaThread, heap: &ArenaHeap, obj: Ref) -> u64 {
    let nrefs = t.mark_of(heap, obj).nrefs();
    t.load_word(heap, obj, nrefs + 1)
}

/// Everything reachable from a root, numbered in depth-first order. Each
/// node holds its tag and the numbers of its fields' targets, so sharing and
/// cycles are part of the shape.
#[derive(Debug, PartialEq, Eq)]
pub struct Graph {
    pub nodes: Vec<(u64, Vec<Option<usize>>)>,
}

pub fn snapshot(t: &SbaThread, heap: &ArenaHeap, root: Ref) -> Graph {
    let mut ids = FxHashMap::default();
    let mut nodes = Vec::new();
    walk(t, heap, root, &mut ids, &mut nodes);
    Graph { nodes }
}

fn walk(
    t: &SbaThread,
    heap: &ArenaHeap,
    r: Ref,
    ids: &mut FxHashMap<(Space, usize), usize>,
    nodes: &mut Vec<(u64, Vec<Option<usize>>)>,
) -> Option<usize> {
    if r.is_null() {
        return None;
    }
    if let Some(id) = ids.get(&(r.space(), r.addr())) {
        return Some(*id);
    }
    let id = nodes.len();
    ids.insert((r.space(), r.addr()), id);
    nodes.push((tag(t, heap, r), Vec::new()));
    let nrefs = t.mark_of(heap, r).nrefs();
    let mut kids = Vec::with_capacity(nrefs);
    for i in 1..=nrefs {
        kids.push(walk(t, heap, t.load_field(heap, r, i), ids, nodes));
    }
    nodes[id].1 = kids;
    Some(id)
}

/// Stack objects reachable from `root`.
pub fn stack_objects(t: &SbaThread, heap: &ArenaHeap, root: Ref) -> Vec<Ref> {
    let mut seen = Vec::new();
    let mut todo = vec![root];
    while let Some(r) = todo.pop() {
        if r.is_null() || seen.contains(&r) {
            continue;
        }
        seen.push(r);
        let nrefs = t.mark_of(heap, r).nrefs();
        for i in 1..=nrefs {
            todo.push(t.load_field(heap, r, i));
        }
    }
    seen.into_iter().filter(|r| r.is_stack()).collect()
}
