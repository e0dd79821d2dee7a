//! Source provenance shared by the lexer, compiler and runtime diagnostics.

/// A 1-indexed line/column range into a single source buffer. Kept tiny
/// (16 bytes) since one is stored per emitted bytecode byte in a
/// [`crate::chunk::Prototype`]'s token map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub line: u32,
    pub col_start: u32,
    pub col_end: u32,
}

impl Span {
    pub fn new(line: u32, col_start: u32, col_end: u32) -> Self {
        Span { line, col_start, col_end }
    }

    pub fn point(line: u32, col: u32) -> Self {
        Span::new(line, col, col)
    }
}
