//! Gab Core: NaN-boxed value encoding and the bytecode artifact shape shared
//! by the compiler and the VM.
//!
//! This crate is the single place that understands the bit-level layout of a
//! `gab_value`. Every other crate in the workspace treats values as opaque
//! 64-bit words and goes through [`value`] to inspect or construct one. It
//! also defines [`opcode::Op`] and [`chunk::Prototype`] so that `gab-compiler`
//! (which produces them) and `gab-runtime` (which executes them) agree on
//! their shape without depending on each other.
//!
//! # Modules
//!
//! - `value`: the `GabValue` wrapper and tag/kind discrimination.
//! - `opcode`: the bytecode instruction set.
//! - `chunk`: `Prototype`, the compiled artifact of one block/specialization.
//! - `span`: source provenance for diagnostics.

pub mod chunk;
pub mod opcode;
pub mod span;
pub mod value;

pub use chunk::{Constant, Prototype, SuspensePrototype, UpvalueDescriptor};
pub use opcode::{Arity, Op, SEND_CACHE_LEN};
pub use span::Span;
pub use value::{
    gab_false, gab_nil, gab_true, GabValue, ValueKind, CANONICAL_NAN, GAB_UNDEFINED,
    MAX_INLINE_LEN,
};
