//! Integration coverage for block upvalue capture (spec 4.2.4, 4.4.3):
//! an inner block closing over an outer frame's local keeps seeing that
//! local's value after the outer frame has already returned.

use gab_core::{Constant, Op, Prototype, Span, UpvalueDescriptor, SEND_CACHE_LEN};
use gab_runtime::vm::{Engine, Vm};
use gab_runtime::Value;

fn with_spans(code: Vec<u8>) -> Vec<Span> {
    vec![Span::point(1, 1); code.len()]
}

fn send_bytes(msg_idx: u16, have: u8) -> Vec<u8> {
    let mut bytes = vec![Op::Send as u8];
    bytes.extend_from_slice(&msg_idx.to_le_bytes());
    bytes.push(have);
    bytes.extend(std::iter::repeat(0u8).take(SEND_CACHE_LEN));
    bytes
}

#[test]
fn inner_block_sees_outer_local_captured_as_upvalue() {
    // Inner block body: LOAD_UPVALUE 0; RETURN 1.
    let mut inner = Prototype::new("outer$block", 0);
    inner.nslots = 1;
    inner.code = vec![Op::LoadUpvalue as u8, 0, Op::Return as u8, 1];
    inner.spans = with_spans(inner.code.clone());
    inner.upvalues = vec![UpvalueDescriptor { from_parent_local: true, index: 1 }];

    // Outer body: store arg into local 1 (already there from the call),
    // build the inner block (capturing local 1), call it, return its result.
    let mut outer_code = vec![Op::Block as u8, 0, 0];
    outer_code.extend(send_bytes(0, 0));
    outer_code.push(Op::Return as u8);
    outer_code.push(1);

    let mut outer = Prototype::new("outer", 1);
    outer.code = outer_code.clone();
    outer.spans = with_spans(outer_code);
    outer.nslots = 2;
    outer.constants = vec![Constant::Message("call".to_string())];
    outer.protos = vec![inner];

    let engine = Engine::new();
    let block = gab_runtime::alloc::alloc(gab_runtime::heap::Block {
        header: gab_runtime::heap::ObjHeader::new(gab_runtime::heap::Kind::Block),
        prototype: outer,
        upvalue_descriptors: vec![],
        upvalues: vec![],
    });
    let mut vm = Vm::new(engine);
    let results = vm.call_top_level(block, vec![Value::number(41.0)]).expect("closure call failed");
    assert_eq!(results, vec![Value::number(41.0)]);
}

#[test]
fn two_closures_over_the_same_local_each_see_its_captured_value() {
    // Two sibling inner blocks, each just loading upvalue 0 and returning it;
    // both capture the same outer local, so calling them back to back must
    // yield the same value twice (no accidental aliasing/move on capture).
    let mut inner_a = Prototype::new("outer$a", 0);
    inner_a.nslots = 1;
    inner_a.code = vec![Op::LoadUpvalue as u8, 0, Op::Return as u8, 1];
    inner_a.spans = with_spans(inner_a.code.clone());
    inner_a.upvalues = vec![UpvalueDescriptor { from_parent_local: true, index: 1 }];

    let mut inner_b = Prototype::new("outer$b", 0);
    inner_b.nslots = 1;
    inner_b.code = vec![Op::LoadUpvalue as u8, 0, Op::Return as u8, 1];
    inner_b.spans = with_spans(inner_b.code.clone());
    inner_b.upvalues = vec![UpvalueDescriptor { from_parent_local: true, index: 1 }];

    // outer: BLOCK a; CALL; POP; BLOCK b; CALL; RETURN 1
    let mut outer_code = vec![Op::Block as u8, 0, 0];
    outer_code.extend(send_bytes(0, 0));
    outer_code.push(Op::Pop as u8);
    outer_code.push(Op::Block as u8);
    outer_code.extend_from_slice(&1u16.to_le_bytes());
    outer_code.extend(send_bytes(0, 0));
    outer_code.push(Op::Return as u8);
    outer_code.push(1);

    let mut outer = Prototype::new("outer", 1);
    outer.code = outer_code.clone();
    outer.spans = with_spans(outer_code);
    outer.nslots = 2;
    outer.constants = vec![Constant::Message("call".to_string())];
    outer.protos = vec![inner_a, inner_b];

    let engine = Engine::new();
    let block = gab_runtime::alloc::alloc(gab_runtime::heap::Block {
        header: gab_runtime::heap::ObjHeader::new(gab_runtime::heap::Kind::Block),
        prototype: outer,
        upvalue_descriptors: vec![],
        upvalues: vec![],
    });
    let mut vm = Vm::new(engine);
    let results = vm.call_top_level(block, vec![Value::number(7.0)]).expect("closure call failed");
    assert_eq!(results, vec![Value::number(7.0)]);
}
