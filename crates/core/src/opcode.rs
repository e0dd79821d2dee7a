//! The Gab bytecode instruction set.
//!
//! One byte of opcode followed by a fixed, opcode-specific number of
//! little-endian operand bytes. `SEND` and its monomorphic variants also
//! carry a 16-byte inline cache immediately after their operands (see
//! [`SEND_CACHE_LEN`]).

/// Bytes of inline polymorphic cache trailing every `SEND`-family opcode:
/// message-version (u32), cached type bits (u64), cached offset (u32).
pub const SEND_CACHE_LEN: usize = 16;

macro_rules! opcodes {
    ($($name:ident = $val:expr),* $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u8)]
        pub enum Op {
            $($name = $val),*
        }

        impl Op {
            pub fn from_byte(b: u8) -> Option<Op> {
                match b {
                    $($val => Some(Op::$name),)*
                    _ => None,
                }
            }
        }
    };
}

opcodes! {
    Nop = 0,

    // Constants
    Constant = 1,        // k16
    NConstant = 2,        // n8, k16*n
    PushNil = 3,
    PushTrue = 4,
    PushFalse = 5,
    PushUndefined = 6,

    // Locals / upvalues
    LoadLocal = 7,         // i8
    StoreLocal = 8,        // i8
    PopStoreLocal = 9,     // i8
    NLoadLocal = 10,       // n8, i8*n
    NPopStoreLocal = 11,   // n8, i8*n
    LoadUpvalue = 12,      // i8
    NLoadUpvalue = 13,     // n8, i8*n

    // Stack shuffling
    Pop = 14,
    PopN = 15,             // n8
    Dup = 16,
    Swap = 17,
    Shift = 18,            // n8
    Interpolate = 19,      // n8

    // Send
    Send = 20,             // m16, have8, [cache; SEND_CACHE_LEN]
    DynSend = 21,          // have8
    SendMonoBlock = 22,    // m16, have8, [cache]
    SendMonoNative = 23,   // m16, have8, [cache]
    SendMonoProperty = 24, // m16, have8, [cache]
    SendPrimitiveAdd = 25,
    SendPrimitiveSub = 26,
    SendPrimitiveMul = 27,
    SendPrimitiveDiv = 28,
    SendPrimitiveMod = 29,
    SendPrimitiveLt = 30,
    SendPrimitiveLte = 31,
    SendPrimitiveGt = 32,
    SendPrimitiveGte = 33,
    SendPrimitiveEq = 34,
    SendPrimitiveConcat = 35,

    // Control flow
    Jump = 36,             // d16
    JumpIfTrue = 37,       // d16
    JumpIfFalse = 38,      // d16
    PopJumpIfTrue = 39,    // d16
    PopJumpIfFalse = 40,   // d16
    LogicalAnd = 41,       // d16
    LogicalOr = 42,        // d16
    Loop = 43,             // d16

    // Calls / returns
    Return = 44,           // have8
    Yield = 45,            // p16, have8
    Trim = 46,             // want8
    Pack = 47,             // have8, below8, above8

    // Construction
    Block = 48,            // p16
    Spec = 49,             // p16, m16
    DynSpec = 50,          // p16
    Record = 51,           // n8
    Tuple = 52,            // have8

    // Misc
    Not = 53,
    Negate = 54,
    Type = 55,
    Match = 56,
}

/// Arity encoding used by `have8` operands: the low bit is the variadic
/// flag, the remaining 7 bits are the count. `0xFF` (all bits, odd) means
/// "the count is on top of the stack" per spec 4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arity(pub u8);

impl Arity {
    pub const VAR_ON_STACK: Arity = Arity(0xFF);

    pub fn fixed(count: u8) -> Self {
        Arity(count << 1)
    }

    pub fn variadic(count: u8) -> Self {
        Arity((count << 1) | 1)
    }

    pub fn is_variadic(self) -> bool {
        self.0 & 1 != 0
    }

    pub fn count(self) -> u8 {
        self.0 >> 1
    }

    pub fn count_is_on_stack(self) -> bool {
        self.0 == 0xFF
    }
}
