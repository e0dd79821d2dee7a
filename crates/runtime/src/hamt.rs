//! Persistent hash-array-mapped trie (spec 4.8). Root is a `Kind::Map`
//! heap object `{len, hash, root: Rc<Node>}`; interior nodes are plain,
//! non-heap `Rc<Node>` since they are never addressed by a `gab_value`
//! directly, only via the owning `Map`'s root field, and share structure
//! across persistent versions through `Rc` instead of GC refcounting.

use crate::heap::{Kind, ObjHeader, ObjPtr};
use crate::value::Value;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::ptr::NonNull;
use std::rc::Rc;

const BITS: u32 = 5;
const ARITY: u32 = 1 << BITS; // 32
const MAX_DEPTH: u32 = 64 / BITS as u64 as u32; // 13, per spec

#[derive(Clone)]
enum Slot {
    Leaf(String, Value),
    Branch(Rc<Node>),
}

/// `mask` marks which of the 32 hash groups at this level are occupied; the
/// matching entry in `slots` is either a leaf (`vmask` bit set) or a branch,
/// mirroring spec 4.8's `mask`/`vmask` bitmap pair.
#[derive(Default, Clone)]
struct Node {
    mask: u32,
    slots: Vec<Slot>,
}

impl Node {
    fn slot_index(&self, bit: u32) -> usize {
        (self.mask & (bit - 1)).count_ones() as usize
    }

    fn has(&self, bit: u32) -> bool {
        self.mask & bit != 0
    }
}

fn hash_key(key: &str) -> u64 {
    let mut h = DefaultHasher::new();
    key.hash(&mut h);
    h.finish()
}

fn bit_at(hash: u64, depth: u32) -> u32 {
    let shift = depth * BITS;
    1u32 << ((hash >> shift) & (ARITY as u64 - 1))
}

fn node_get(node: &Node, key: &str, hash: u64, depth: u32) -> Option<Value> {
    if depth >= MAX_DEPTH {
        return None;
    }
    let bit = bit_at(hash, depth);
    if !node.has(bit) {
        return None;
    }
    let idx = node.slot_index(bit);
    match &node.slots[idx] {
        Slot::Leaf(k, v) if k == key => Some(*v),
        Slot::Leaf(_, _) => None,
        Slot::Branch(child) => node_get(child, key, hash, depth + 1),
    }
}

fn node_insert(node: &Node, key: &str, hash: u64, value: Value, depth: u32) -> (Node, bool) {
    let bit = bit_at(hash, depth);
    let idx = node.slot_index(bit);
    if !node.has(bit) {
        let mut out = node.clone();
        out.mask |= bit;
        out.slots.insert(idx, Slot::Leaf(key.to_string(), value));
        return (out, true);
    }
    match &node.slots[idx] {
        Slot::Leaf(k, _) if k == key => {
            let mut out = node.clone();
            out.slots[idx] = Slot::Leaf(key.to_string(), value);
            (out, false)
        }
        Slot::Leaf(k, v) => {
            // Collision at this level: push both leaves one level deeper.
            let existing_hash = hash_key(k);
            let mut sub = Node::default();
            let (sub1, _) = node_insert(&sub, k, existing_hash, *v, depth + 1);
            sub = sub1;
            let (sub2, grew) = node_insert(&sub, key, hash, value, depth + 1);
            let mut out = node.clone();
            out.slots[idx] = Slot::Branch(Rc::new(sub2));
            (out, grew)
        }
        Slot::Branch(child) => {
            let (new_child, grew) = node_insert(child, key, hash, value, depth + 1);
            let mut out = node.clone();
            out.slots[idx] = Slot::Branch(Rc::new(new_child));
            (out, grew)
        }
    }
}

fn node_remove(node: &Node, key: &str, hash: u64, depth: u32) -> Option<Node> {
    let bit = bit_at(hash, depth);
    if !node.has(bit) {
        return None;
    }
    let idx = node.slot_index(bit);
    match &node.slots[idx] {
        Slot::Leaf(k, _) if k == key => {
            let mut out = node.clone();
            out.mask &= !bit;
            out.slots.remove(idx);
            Some(out)
        }
        Slot::Leaf(_, _) => None,
        Slot::Branch(child) => {
            let new_child = node_remove(child, key, hash, depth + 1)?;
            let mut out = node.clone();
            out.slots[idx] = Slot::Branch(Rc::new(new_child));
            Some(out)
        }
    }
}

fn node_for_each(node: &Node, visit: &mut impl FnMut(&str, Value)) {
    for slot in &node.slots {
        match slot {
            Slot::Leaf(k, v) => visit(k, *v),
            Slot::Branch(child) => node_for_each(child, visit),
        }
    }
}

#[repr(C)]
pub struct GabMap {
    pub header: ObjHeader,
    pub len: usize,
    root: Rc<Node>,
}

fn alloc_map(len: usize, root: Rc<Node>) -> ObjPtr {
    let boxed = Box::new(GabMap { header: ObjHeader::new(Kind::Map), len, root });
    ObjPtr(NonNull::new(Box::into_raw(boxed) as *mut _).expect("box never null"))
}

pub fn empty() -> ObjPtr {
    alloc_map(0, Rc::new(Node::default()))
}

pub fn get(map: ObjPtr, key: &str) -> Option<Value> {
    let m = unsafe { map.cast::<GabMap>() };
    node_get(&m.root, key, hash_key(key), 0)
}

pub fn put(map: ObjPtr, key: &str, value: Value) -> ObjPtr {
    let m = unsafe { map.cast::<GabMap>() };
    let (new_root, grew) = node_insert(&m.root, key, hash_key(key), value, 0);
    alloc_map(if grew { m.len + 1 } else { m.len }, Rc::new(new_root))
}

pub fn delete(map: ObjPtr, key: &str) -> ObjPtr {
    let m = unsafe { map.cast::<GabMap>() };
    match node_remove(&m.root, key, hash_key(key), 0) {
        Some(new_root) => alloc_map(m.len - 1, Rc::new(new_root)),
        None => map,
    }
}

pub fn len(map: ObjPtr) -> usize {
    unsafe { map.cast::<GabMap>() }.len
}

pub fn for_each_child(ptr: ObjPtr, mut visit: impl FnMut(Value)) {
    let m = unsafe { ptr.cast::<GabMap>() };
    node_for_each(&m.root, &mut |_, v| visit(v));
}

#[cfg(test)]
mod tests {
    use super::*;
    use gab_core::GabValue;

    #[test]
    fn put_then_get_roundtrips() {
        let m = empty();
        let m = put(m, "a", GabValue::number(1.0));
        let m = put(m, "b", GabValue::number(2.0));
        assert_eq!(get(m, "a").unwrap().as_number(), Some(1.0));
        assert_eq!(get(m, "b").unwrap().as_number(), Some(2.0));
        assert_eq!(len(m), 2);
    }

    #[test]
    fn put_does_not_disturb_other_keys() {
        let m = empty();
        let m = put(m, "a", GabValue::number(1.0));
        let m2 = put(m, "b", GabValue::number(2.0));
        assert_eq!(get(m2, "a").unwrap().as_number(), Some(1.0));
        assert_eq!(get(m, "b"), None);
    }

    #[test]
    fn delete_removes_key_only() {
        let m = empty();
        let m = put(m, "a", GabValue::number(1.0));
        let m = put(m, "b", GabValue::number(2.0));
        let m = delete(m, "a");
        assert_eq!(get(m, "a"), None);
        assert_eq!(get(m, "b").unwrap().as_number(), Some(2.0));
        assert_eq!(len(m), 1);
    }

    #[test]
    fn overwriting_a_key_keeps_length() {
        let m = empty();
        let m = put(m, "a", GabValue::number(1.0));
        let m = put(m, "a", GabValue::number(9.0));
        assert_eq!(len(m), 1);
        assert_eq!(get(m, "a").unwrap().as_number(), Some(9.0));
    }
}
