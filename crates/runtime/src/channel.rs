//! First-class channel values (spec 4.7): a bounded queue of `gab_value`
//! with cooperative put/take blocking. Queue state lives in a process-global
//! registry keyed by the channel object's identity, guarded by May's
//! coroutine-aware `Mutex`/`Condvar` so a waiting strand yields to the
//! scheduler instead of parking its OS thread — the same registry-plus-ID
//! idiom the host's channel support is built on, just keyed by heap pointer
//! instead of an integer handle.

use crate::heap::ObjPtr;
use crate::value::Value;
use may::sync::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::OnceLock;

struct ChannelState {
    capacity: usize,
    buffer: VecDeque<Value>,
    closed: bool,
}

struct ChannelRegistry {
    channels: Mutex<HashMap<*const (), ChannelState>>,
    not_full: Condvar,
    not_empty: Condvar,
}

unsafe impl Send for ChannelRegistry {}
unsafe impl Sync for ChannelRegistry {}

fn registry() -> &'static ChannelRegistry {
    static REGISTRY: OnceLock<ChannelRegistry> = OnceLock::new();
    REGISTRY.get_or_init(|| ChannelRegistry {
        channels: Mutex::new(HashMap::new()),
        not_full: Condvar::new(),
        not_empty: Condvar::new(),
    })
}

/// Register a freshly allocated channel object with the registry. Must be
/// called once, right after the `Channel` heap object is constructed.
pub fn open(ptr: ObjPtr, capacity: usize) {
    registry().channels.lock().unwrap().insert(ptr.as_bits(), ChannelState {
        capacity: capacity.max(1),
        buffer: VecDeque::new(),
        closed: false,
    });
}

/// Blocks the calling strand until there is room in the buffer, then
/// enqueues `value`. Returns `false` if the channel was already closed.
pub fn put(ptr: ObjPtr, value: Value) -> bool {
    let reg = registry();
    let mut guard = reg.channels.lock().unwrap();
    loop {
        let Some(state) = guard.get_mut(&ptr.as_bits()) else { return false };
        if state.closed {
            return false;
        }
        if state.buffer.len() < state.capacity {
            state.buffer.push_back(value);
            reg.not_empty.notify_one();
            return true;
        }
        guard = reg.not_full.wait(guard).unwrap();
    }
}

/// Blocks until a value is available or the channel closes. `None` signals
/// close, matching spec 4.7's "`undefined` on close" contract at the value
/// layer (the caller maps `None` to `gab_undefined`).
pub fn take(ptr: ObjPtr) -> Option<Value> {
    let reg = registry();
    let mut guard = reg.channels.lock().unwrap();
    loop {
        let Some(state) = guard.get_mut(&ptr.as_bits()) else { return None };
        if let Some(v) = state.buffer.pop_front() {
            reg.not_full.notify_one();
            return Some(v);
        }
        if state.closed {
            return None;
        }
        guard = reg.not_empty.wait(guard).unwrap();
    }
}

/// Closes the channel, unblocking every waiter on both sides.
pub fn close(ptr: ObjPtr) {
    let reg = registry();
    let mut guard = reg.channels.lock().unwrap();
    if let Some(state) = guard.get_mut(&ptr.as_bits()) {
        state.closed = true;
    }
    drop(guard);
    reg.not_empty.notify_all();
    reg.not_full.notify_all();
}

pub fn is_closed(ptr: ObjPtr) -> bool {
    registry().channels.lock().unwrap().get(&ptr.as_bits()).map(|s| s.closed).unwrap_or(true)
}

pub fn len(ptr: ObjPtr) -> usize {
    registry().channels.lock().unwrap().get(&ptr.as_bits()).map(|s| s.buffer.len()).unwrap_or(0)
}

/// Drops a channel's queue state when its heap object is collected.
pub fn forget(ptr: ObjPtr) {
    registry().channels.lock().unwrap().remove(&ptr.as_bits());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{Kind, ObjHeader};
    use gab_core::GabValue;
    use std::ptr::NonNull;

    fn fake_channel() -> ObjPtr {
        let boxed = Box::new(ObjHeader::new(Kind::Channel));
        let ptr = ObjPtr(NonNull::new(Box::into_raw(boxed)).unwrap());
        open(ptr, 2);
        ptr
    }

    #[test]
    fn put_then_take_roundtrips_in_order() {
        let ch = fake_channel();
        assert!(put(ch, GabValue::number(1.0)));
        assert!(put(ch, GabValue::number(2.0)));
        assert_eq!(take(ch).unwrap().as_number(), Some(1.0));
        assert_eq!(take(ch).unwrap().as_number(), Some(2.0));
        forget(ch);
    }

    #[test]
    fn take_after_close_returns_none_once_drained() {
        let ch = fake_channel();
        put(ch, GabValue::number(9.0));
        close(ch);
        assert_eq!(take(ch).unwrap().as_number(), Some(9.0));
        assert!(take(ch).is_none());
        forget(ch);
    }

    #[test]
    fn put_after_close_is_rejected() {
        let ch = fake_channel();
        close(ch);
        assert!(!put(ch, GabValue::number(1.0)));
        forget(ch);
    }
}
