//! Random mutator programs against a model of the object graph. Whatever
//! escapes and collections happen underneath, every rooted object must keep
//! its tag and its edges.

mod utils;

use quickcheck::quickcheck;
use rustc_hash::{FxHashMap, FxHashSet};

use sba_rt::*;
use utils::graph::*;

#[derive(Default)]
struct Model {
    /// Fields of every object by tag.
    fields: FxHashMap<u64, [Option<u64>; 2]>,
    /// Live root slots, as (depth, slot).
    slots: Vec<(usize, usize)>,
    next_tag: u64,
}

fn check(t: &SbaThread, heap: &ArenaHeap, model: &Model, r: Ref, seen: &mut FxHashSet<u64>) -> bool {
    let tg = tag(t, heap, r);
    if !seen.insert(tg) {
        return true;
    }
    let expected = match model.fields.get(&tg) {
        Some(f) => *f,
        None => return false,
    };
    for (i, want) in expected.iter().enumerate() {
        let field = t.load_field(heap, r, i + 1);
        match want {
            None if field.is_null() => {}
            Some(w) if !field.is_null() && tag(t, heap, field) == *w => {
                if !check(t, heap, model, field, seen) {
                    return false;
                }
            }
            _ => return false,
        }
    }
    true
}

fn run(ops: &[(u8, u8, u8)], config: SbaConfig) -> bool {
    let mut heap = heap();
    let mut t = thread_with(config);
    let mut model = Model::default();

    for &(op, x, y) in ops.iter().take(80) {
        let depth = t.roots().depth();
        match op % 7 {
            0 if depth < 6 => {
                t.push_frame();
            }
            1 if depth > 0 => {
                t.pop_frame(&mut heap).unwrap();
                model.slots.retain(|(d, _)| *d <= t.roots().depth());
            }
            2 | 3 => {
                model.next_tag += 1;
                let tg = model.next_tag;
                let o = node(&mut t, &mut heap, tg, &[Ref::NULL, Ref::NULL]);
                let slot = t.roots().current().slots.len();
                t.set_local(slot, o);
                model.fields.insert(tg, [None, None]);
                model.slots.push((depth, slot));
            }
            4 if !model.slots.is_empty() => {
                let n = model.slots.len();
                let (hd, hs) = model.slots[x as usize % n];
                let (vd, vs) = model.slots[y as usize % n];
                let idx = 1 + (x as usize / 7) % 2;
                let holder = t.local(hd, hs);
                let value = t.local(vd, vs);
                t.store_field(&mut heap, holder, idx, value).unwrap();
                let (ht, vt) = (tag(&t, &heap, t.local(hd, hs)), tag(&t, &heap, t.local(vd, vs)));
                if let Some(f) = model.fields.get_mut(&ht) {
                    f[idx - 1] = Some(vt);
                }
            }
            5 if !model.slots.is_empty() => {
                let n = model.slots.len();
                let (d, s) = model.slots[x as usize % n];
                let r = t.local(d, s);
                if y % 2 == 0 {
                    ensure_in_heap(&mut t, &mut heap, r, "quickcheck").unwrap();
                } else if r.is_stack() {
                    let target = (y as u32 / 2) % (t.curr_fid() + 1);
                    let fid = t.area().preheader(r.addr()).fid();
                    if target <= fid {
                        escape(&mut t, &mut heap, r, Destination::Frame(target), "quickcheck").unwrap();
                    }
                }
            }
            6 => {
                t.collect(&mut heap).unwrap();
            }
            _ => {}
        }
    }

    t.verify(&mut heap);
    let mut seen = FxHashSet::default();
    model
        .slots
        .iter()
        .all(|&(d, s)| check(&t, &heap, &model, t.local(d, s), &mut seen))
}

quickcheck! {
    fn prop_graph_survives_escapes(ops: Vec<(u8, u8, u8)>) -> bool {
        run(&ops, config())
    }

    fn prop_graph_survives_small_regions(ops: Vec<(u8, u8, u8)>) -> bool {
        run(&ops, SbaConfig {
            initial_stack_words: 16,
            max_stack_words: 64,
            ..config()
        })
    }
}
