//! Heap object model (spec 3.2): every `gab_obj` shares a three-byte header
//! of `{references, flags, kind}` followed by kind-specific fields. Objects
//! are allocated out of the engine's [`crate::alloc::Heap`] slab and never
//! move, so a [`gab_core::GabValue`] heap pointer stays valid for the
//! object's whole lifetime; only the GC in [`crate::gc`] frees them.

use gab_core::{Prototype as BytecodePrototype, UpvalueDescriptor};
use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::ptr::NonNull;

use crate::gc::{Color, GcFlags};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Kind {
    StringLong,
    SigilLong,
    Message,
    BlockPrototype,
    SuspensePrototype,
    Native,
    Block,
    Box_,
    Record,
    Shape,
    Channel,
    Suspense,
    Map,
    MapNode,
}

/// The header every heap object carries, plus `Cell`s so the GC (running on
/// its own worker) can mutate color/refcount through a shared `&ObjHeader`.
pub struct ObjHeader {
    pub references: Cell<i32>,
    pub flags: Cell<GcFlags>,
    pub color: Cell<Color>,
    pub kind: Kind,
}

impl ObjHeader {
    pub fn new(kind: Kind) -> Self {
        ObjHeader {
            references: Cell::new(0),
            flags: Cell::new(GcFlags::NEW),
            color: Cell::new(Color::Black),
            kind,
        }
    }
}

/// A type-erased pointer to a heap object, the runtime analogue of the
/// `gab_value` heap-pointer case. Equality is by address (object identity),
/// matching the NaN-box invariant that interning guarantees value identity.
#[derive(Clone, Copy)]
pub struct ObjPtr(pub NonNull<ObjHeader>);

/// Objects never move and the `Cell` fields are only mutated by the single
/// thread holding the `Collector`'s `Mutex` at a time (the GC thread or a
/// worker thread under its lock), mirroring `ChannelRegistry`'s rationale.
unsafe impl Send for ObjPtr {}

impl ObjPtr {
    pub fn header(&self) -> &ObjHeader {
        unsafe { self.0.as_ref() }
    }

    pub fn kind(&self) -> Kind {
        self.header().kind
    }

    pub fn as_bits(&self) -> *const () {
        self.0.as_ptr() as *const ()
    }

    /// # Safety
    /// `ptr` must point at a live object whose concrete type matches `T`.
    pub unsafe fn cast<T>(&self) -> &T {
        unsafe { &*(self.0.as_ptr() as *const T) }
    }

    /// # Safety
    /// `ptr` must point at a live object whose concrete type matches `T`, and
    /// the caller must not alias this mutable view with any other live
    /// reference to the same object (records are the only kind mutated after
    /// construction, and only ever from the owning fiber's VM loop).
    pub unsafe fn cast_mut<T>(&self) -> &mut T {
        unsafe { &mut *(self.0.as_ptr() as *mut T) }
    }
}

impl PartialEq for ObjPtr {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl Eq for ObjPtr {}

impl fmt::Debug for ObjPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjPtr({:?}, {:?})", self.0, self.kind())
    }
}

/// Long-form interned string or sigil: `{hash, len, bytes}`.
#[repr(C)]
pub struct GabString {
    pub header: ObjHeader,
    pub hash: u64,
    pub data: String,
}

/// Ordered immutable key sequence shared by structurally-equivalent records
/// (spec 3.2, "Shape"). Interned by `(keys, hash)` so two records with the
/// same fields in the same order share one shape, pointer-equal (E4).
#[repr(C)]
pub struct Shape {
    pub header: ObjHeader,
    pub hash: u64,
    pub keys: Vec<String>,
}

impl Shape {
    pub fn find(&self, key: &str) -> Option<usize> {
        self.keys.iter().position(|k| k == key)
    }
}

/// `{shape, data}` — mutable values under an immutable shape.
#[repr(C)]
pub struct Record {
    pub header: ObjHeader,
    pub shape: ObjPtr,
    pub data: Vec<crate::value::Value>,
}

/// `{name, specs}`. `specs` maps a receiver type-key to a specialization.
#[repr(C)]
pub struct Message {
    pub header: ObjHeader,
    pub name: String,
    /// Bumped on every `gab_spec` registration so inline caches can detect
    /// staleness by comparing a cached version (spec 4.4.1 / invariant 7).
    pub version: Cell<u64>,
    pub specs: HashMap<String, Specialization>,
}

#[derive(Clone)]
pub enum Specialization {
    Block(ObjPtr),
    Native(ObjPtr),
    Primitive(gab_core::Op),
}

/// `{prototype, upvalues}`. The callable closure value.
#[repr(C)]
pub struct Block {
    pub header: ObjHeader,
    pub prototype: BytecodePrototype,
    pub upvalue_descriptors: Vec<UpvalueDescriptor>,
    pub upvalues: Vec<crate::value::Value>,
}

pub type NativeFn = fn(&mut crate::vm::Vm, &[crate::value::Value]) -> Result<Vec<crate::value::Value>, crate::error::RuntimeError>;

#[repr(C)]
pub struct Native {
    pub header: ObjHeader,
    pub name: String,
    pub func: NativeFn,
}

/// A reified suspended coroutine frame (spec 4.4.4).
#[repr(C)]
pub struct Suspense {
    pub header: ObjHeader,
    pub block: ObjPtr,
    pub resume_offset: u32,
    pub want: i16,
    pub slots: Vec<crate::value::Value>,
}

#[repr(C)]
pub struct Channel {
    pub header: ObjHeader,
    pub capacity: usize,
    pub buffer: std::collections::VecDeque<crate::value::Value>,
    pub closed: bool,
}

/// Walks a box's payload for GC tracing, pushing any value it holds onto the
/// visitor closure (spec 3.2: box "visitor (for GC walk)").
pub type BoxVisitorFn = fn(&dyn std::any::Any, &mut dyn FnMut(crate::value::Value));
/// Runs when a box's owning object is actually freed (spec 3.2: box
/// "destructor"), to release whatever non-`gab_value` resource the payload
/// holds (a file handle, a native buffer, …).
pub type BoxDestructorFn = fn(&dyn std::any::Any);

/// User-data wrapper (spec 3.2 "Box"), the one heap kind a native module
/// constructs directly rather than the VM. `type_value` is this box's
/// `gab_valtype` for message dispatch (spec 4.6 step 2).
#[repr(C)]
pub struct GabBox {
    pub header: ObjHeader,
    pub type_value: crate::value::Value,
    pub payload: Box<dyn std::any::Any>,
    pub destructor: Option<BoxDestructorFn>,
    pub visitor: Option<BoxVisitorFn>,
}

/// Enumerate a heap object's children for GC tracing (spec 4.5 "Children
/// enumeration"). Primitive/GREEN kinds (long strings) have none.
pub fn for_each_child(ptr: ObjPtr, mut visit: impl FnMut(crate::value::Value)) {
    use crate::value::{Value, ValueExt};
    match ptr.kind() {
        Kind::Record => {
            let rec = unsafe { ptr.cast::<Record>() };
            visit(Value::from_obj(rec.shape));
            for v in &rec.data {
                visit(*v);
            }
        }
        Kind::Shape => {}
        Kind::Message => {
            let msg = unsafe { ptr.cast::<Message>() };
            for spec in msg.specs.values() {
                if let Specialization::Block(b) = spec {
                    visit(Value::from_obj(*b));
                }
                if let Specialization::Native(n) = spec {
                    visit(Value::from_obj(*n));
                }
            }
        }
        Kind::Block => {
            let block = unsafe { ptr.cast::<Block>() };
            for v in &block.upvalues {
                visit(*v);
            }
        }
        Kind::Suspense => {
            let s = unsafe { ptr.cast::<Suspense>() };
            visit(Value::from_obj(s.block));
            for v in &s.slots {
                visit(*v);
            }
        }
        Kind::Channel => {
            let c = unsafe { ptr.cast::<Channel>() };
            for v in &c.buffer {
                visit(*v);
            }
        }
        Kind::Map | Kind::MapNode => {
            crate::hamt::for_each_child(ptr, visit);
        }
        Kind::Box_ => {
            let b = unsafe { ptr.cast::<GabBox>() };
            visit(b.type_value);
            if let Some(visitor) = b.visitor {
                visitor(b.payload.as_ref(), &mut visit);
            }
        }
        Kind::StringLong | Kind::SigilLong | Kind::Native | Kind::BlockPrototype | Kind::SuspensePrototype => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Value, ValueExt};
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn shape_find_locates_keys_in_order() {
        let shape = Shape { header: ObjHeader::new(Kind::Shape), hash: 0, keys: vec!["x".into(), "y".into()] };
        assert_eq!(shape.find("x"), Some(0));
        assert_eq!(shape.find("y"), Some(1));
        assert_eq!(shape.find("z"), None);
    }

    static DESTROYED: AtomicBool = AtomicBool::new(false);

    fn visit_payload(payload: &dyn std::any::Any, visit: &mut dyn FnMut(Value)) {
        let held: &Vec<Value> = payload.downcast_ref().unwrap();
        for v in held {
            visit(*v);
        }
    }

    fn mark_destroyed(_payload: &dyn std::any::Any) {
        DESTROYED.store(true, Ordering::SeqCst);
    }

    #[test]
    fn box_for_each_child_visits_type_and_payload_via_user_callbacks() {
        let shape = crate::alloc::alloc(Shape { header: ObjHeader::new(Kind::Shape), hash: 0, keys: vec![] });
        let held_value = Value::number(3.0);
        let type_value = Value::from_obj(shape);
        let b = crate::alloc::alloc(GabBox {
            header: ObjHeader::new(Kind::Box_),
            type_value,
            payload: Box::new(vec![held_value]),
            destructor: Some(mark_destroyed),
            visitor: Some(visit_payload),
        });

        let mut seen = Vec::new();
        for_each_child(b, |v| seen.push(v));
        assert!(seen.contains(&type_value));
        assert!(seen.contains(&held_value));

        DESTROYED.store(false, Ordering::SeqCst);
        let boxed = unsafe { b.cast::<GabBox>() };
        if let Some(destructor) = boxed.destructor {
            destructor(boxed.payload.as_ref());
        }
        assert!(DESTROYED.load(Ordering::SeqCst));
    }
}
