//! Bridges [`gab_core::GabValue`]'s NaN-boxed bit pattern to the runtime's
//! heap: the `Value` alias is the type every VM/GC/dispatch function passes
//! around, and the conversions here are the only place a heap pointer is
//! extracted from or packed into a tagged 64-bit word.

use crate::heap::ObjPtr;
use gab_core::GabValue;
use std::ptr::NonNull;

pub type Value = GabValue;

pub trait ValueExt {
    fn from_obj(ptr: ObjPtr) -> Value;
    fn as_obj(&self) -> Option<ObjPtr>;
}

impl ValueExt for Value {
    fn from_obj(ptr: ObjPtr) -> Value {
        Value::from_heap_ptr(ptr.0.as_ptr() as *const ())
    }

    fn as_obj(&self) -> Option<ObjPtr> {
        self.as_heap_ptr().map(|p| ObjPtr(NonNull::new(p as *mut _).expect("heap pointers are never null")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{Kind, ObjHeader, Shape};

    #[test]
    fn heap_pointer_round_trips_through_value() {
        let shape = Box::new(Shape { header: ObjHeader::new(Kind::Shape), hash: 0, keys: vec![] });
        let ptr = ObjPtr(NonNull::new(Box::into_raw(shape) as *mut _).unwrap());
        let v = Value::from_obj(ptr);
        assert_eq!(v.as_obj().unwrap(), ptr);
    }
}
