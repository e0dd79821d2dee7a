//! Reference counting with Bacon-Rajan trial-deletion cycle collection
//! (spec 4.5). Every heap object carries a refcount and a color in its
//! [`crate::heap::ObjHeader`]; this module holds the three ring buffers the
//! collector drains and the mark/scan/collect passes over candidate roots.

use crate::heap::{for_each_child, GabBox, Kind, ObjPtr};
use crate::value::{Value, ValueExt};
use std::collections::HashSet;

pub const MOD_BUFF_MAX: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    Green,
    Black,
    Gray,
    White,
    Purple,
}

/// Lifecycle flags, a hand-rolled bitset (the workspace carries no bitflags
/// dependency, and these four bits don't warrant adding one).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcFlags(u8);

impl GcFlags {
    pub const NONE: GcFlags = GcFlags(0);
    pub const NEW: GcFlags = GcFlags(1 << 0);
    pub const MODIFIED: GcFlags = GcFlags(1 << 1);
    pub const BUFFERED: GcFlags = GcFlags(1 << 2);
    pub const FREED: GcFlags = GcFlags(1 << 3);

    pub fn contains(self, other: GcFlags) -> bool {
        self.0 & other.0 == other.0
    }
    pub fn insert(&mut self, other: GcFlags) {
        self.0 |= other.0;
    }
    pub fn remove(&mut self, other: GcFlags) {
        self.0 &= !other.0;
    }
}

/// `GREEN` objects (long strings, natives, prototypes) are acyclic by
/// construction and never enter cycle collection.
fn is_green(kind: Kind) -> bool {
    matches!(kind, Kind::StringLong | Kind::SigilLong | Kind::Native | Kind::BlockPrototype | Kind::SuspensePrototype)
}

/// Per-engine GC state: the increment/decrement/modification buffers the
/// interpreter appends to as it runs, plus the set of destroyed objects so
/// `for_each_child` walks never revisit freed memory.
#[derive(Default)]
pub struct Collector {
    increments: Vec<ObjPtr>,
    decrements: Vec<ObjPtr>,
    modifications: Vec<ObjPtr>,
    destroyed: HashSet<*const ()>,
    lock_depth: u32,
}

/// A `Collector` is always accessed through an `Arc<Mutex<_>>` handed to the
/// dedicated GC thread; the raw pointers it stores are never dereferenced
/// concurrently from two threads.
unsafe impl Send for Collector {}

impl Collector {
    pub fn new() -> Self {
        Collector::default()
    }

    pub fn lock(&mut self) {
        self.lock_depth += 1;
    }

    pub fn unlock(&mut self) {
        self.lock_depth = self.lock_depth.saturating_sub(1);
    }

    fn is_freed(&self, ptr: ObjPtr) -> bool {
        self.destroyed.contains(&ptr.as_bits())
    }

    /// `iref`: increment an object's refcount, queueing it for modification
    /// tracking the way spec 4.5 describes.
    pub fn iref(&mut self, ptr: ObjPtr) {
        if self.is_freed(ptr) {
            return;
        }
        let header = ptr.header();
        let flags = header.flags.get();
        if flags.contains(GcFlags::NEW) {
            let mut f = flags;
            f.remove(GcFlags::NEW);
            header.flags.set(f);
        } else if !flags.contains(GcFlags::MODIFIED) {
            if !is_green(ptr.kind()) {
                for_each_child(ptr, |child| {
                    if let Some(obj) = child.as_obj() {
                        self.decrements.push(obj);
                    }
                });
            }
        }
        let mut f = ptr.header().flags.get();
        if !f.contains(GcFlags::MODIFIED) {
            f.insert(GcFlags::MODIFIED);
            ptr.header().flags.set(f);
            self.modifications.push(ptr);
        }
        header.references.set(header.references.get() + 1);
        header.color.set(Color::Black);
    }

    /// `dref`: decrement, freeing immediately when acyclic-safe or marking
    /// the object a cycle-collection candidate (`PURPLE`) otherwise.
    pub fn dref(&mut self, ptr: ObjPtr) {
        if self.is_freed(ptr) {
            return;
        }
        let header = ptr.header();
        if header.flags.get().contains(GcFlags::NEW) {
            self.decrements.push(ptr);
            return;
        }
        let rc = header.references.get() - 1;
        header.references.set(rc);
        if rc <= 0 && is_green(ptr.kind()) {
            self.destroy(ptr);
            return;
        }
        if rc <= 0 {
            self.destroy(ptr);
        } else {
            header.color.set(Color::Purple);
            let mut f = header.flags.get();
            if !f.contains(GcFlags::BUFFERED) {
                f.insert(GcFlags::BUFFERED);
                header.flags.set(f);
                self.modifications.push(ptr);
            }
        }
    }

    fn destroy(&mut self, ptr: ObjPtr) {
        if self.is_freed(ptr) {
            return;
        }
        self.destroyed.insert(ptr.as_bits());
        let mut f = ptr.header().flags.get();
        f.insert(GcFlags::FREED);
        ptr.header().flags.set(f);
        crate::memory_stats::record_destroyed(1);
        if ptr.kind() == Kind::Box_ {
            let b = unsafe { ptr.cast::<GabBox>() };
            if let Some(destructor) = b.destructor {
                destructor(b.payload.as_ref());
            }
        }
        for_each_child(ptr, |child| {
            if let Some(obj) = child.as_obj() {
                self.dref(obj);
            }
        });
    }

    /// Mark-scan-collect pass over buffered PURPLE candidates. Runs when the
    /// modification buffer fills, or on demand (`gab_collect`/tests).
    pub fn collect_cycles(&mut self) {
        if self.lock_depth > 0 {
            return;
        }
        let drained: Vec<ObjPtr> = self.modifications.drain(..).collect();
        let roots: Vec<ObjPtr> = drained
            .into_iter()
            .filter(|p| !self.is_freed(*p) && p.header().color.get() == Color::Purple)
            .collect();

        for &root in &roots {
            self.mark_gray(root);
        }
        for &root in &roots {
            self.scan(root);
        }
        for &root in &roots {
            self.collect_white(root);
        }
        crate::memory_stats::record_cycle_collection();
    }

    fn mark_gray(&mut self, ptr: ObjPtr) {
        if self.is_freed(ptr) || ptr.header().color.get() == Color::Gray {
            return;
        }
        ptr.header().color.set(Color::Gray);
        for_each_child(ptr, |child| {
            if let Some(obj) = child.as_obj() {
                if !self.is_freed(obj) {
                    obj.header().references.set(obj.header().references.get() - 1);
                    self.mark_gray(obj);
                }
            }
        });
    }

    fn scan(&mut self, ptr: ObjPtr) {
        if self.is_freed(ptr) || ptr.header().color.get() != Color::Gray {
            return;
        }
        if ptr.header().references.get() > 0 {
            self.scan_black(ptr);
        } else {
            ptr.header().color.set(Color::White);
            for_each_child(ptr, |child| {
                if let Some(obj) = child.as_obj() {
                    self.scan(obj);
                }
            });
        }
    }

    fn scan_black(&mut self, ptr: ObjPtr) {
        ptr.header().color.set(Color::Black);
        for_each_child(ptr, |child| {
            if let Some(obj) = child.as_obj() {
                if !self.is_freed(obj) {
                    obj.header().references.set(obj.header().references.get() + 1);
                    if obj.header().color.get() != Color::Black {
                        self.scan_black(obj);
                    }
                }
            }
        });
    }

    fn collect_white(&mut self, ptr: ObjPtr) {
        if self.is_freed(ptr) || ptr.header().color.get() != Color::White {
            return;
        }
        ptr.header().color.set(Color::Black);
        let children: Vec<Value> = {
            let mut out = Vec::new();
            for_each_child(ptr, |c| out.push(c));
            out
        };
        for child in children {
            if let Some(obj) = child.as_obj() {
                self.collect_white(obj);
            }
        }
        self.destroy(ptr);
    }

    pub fn should_collect(&self) -> bool {
        self.modifications.len() >= MOD_BUFF_MAX
    }

    pub fn destroyed_count(&self) -> usize {
        self.destroyed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{ObjHeader, Record, Shape};
    use std::ptr::NonNull;

    fn leak_shape() -> ObjPtr {
        let shape = Box::new(Shape { header: ObjHeader::new(Kind::Shape), hash: 0, keys: vec![] });
        ObjPtr(NonNull::new(Box::into_raw(shape) as *mut _).unwrap())
    }

    fn leak_record(shape: ObjPtr, data: Vec<Value>) -> ObjPtr {
        let rec = Box::new(Record { header: ObjHeader::new(Kind::Record), shape, data });
        ObjPtr(NonNull::new(Box::into_raw(rec) as *mut _).unwrap())
    }

    #[test]
    fn acyclic_record_is_destroyed_at_zero_refs() {
        let mut gc = Collector::new();
        let shape = leak_shape();
        let rec = leak_record(shape, vec![]);
        gc.iref(rec);
        gc.dref(rec);
        assert!(gc.is_freed(rec));
    }

    #[test]
    fn two_cycle_records_collected_after_trial_deletion() {
        let mut gc = Collector::new();
        let shape = leak_shape();
        let a = leak_record(shape, vec![]);
        let b = leak_record(shape, vec![Value::from_obj(a)]);
        unsafe { (*(a.0.as_ptr() as *mut Record)).data.push(Value::from_obj(b)) };
        gc.iref(a);
        gc.iref(b);
        gc.iref(b); // a -> b edge
        gc.iref(a); // b -> a edge
        gc.dref(a); // drop the stack's own reference to a
        gc.dref(b); // drop the stack's own reference to b
        gc.collect_cycles();
        assert!(gc.destroyed_count() >= 1);
    }
}
