//! Compile-time error taxonomy (spec 7, lex/parse/compile rows).

use gab_core::Span;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileErrorKind {
    MalformedToken,
    UnexpectedToken,
    UnexpectedEof,
    MissingEnd,
    TooManyLocals,
    TooManyUpvalues,
    TooManyParameters,
    TooManyExpressions,
    ReferenceBeforeInitialize,
    UnboundSymbol,
    LocalAlreadyExists,
    MalformedAssignment,
    InvalidRestVariable,
}

impl fmt::Display for CompileErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompileErrorKind::MalformedToken => "MALFORMED_TOKEN",
            CompileErrorKind::UnexpectedToken => "UNEXPECTED_TOKEN",
            CompileErrorKind::UnexpectedEof => "UNEXPECTED_EOF",
            CompileErrorKind::MissingEnd => "MISSING_END",
            CompileErrorKind::TooManyLocals => "TOO_MANY_LOCALS",
            CompileErrorKind::TooManyUpvalues => "TOO_MANY_UPVALUES",
            CompileErrorKind::TooManyParameters => "TOO_MANY_PARAMETERS",
            CompileErrorKind::TooManyExpressions => "TOO_MANY_EXPRESSIONS",
            CompileErrorKind::ReferenceBeforeInitialize => "REFERENCE_BEFORE_INITIALIZE",
            CompileErrorKind::UnboundSymbol => "UNBOUND_SYMBOL",
            CompileErrorKind::LocalAlreadyExists => "LOCAL_ALREADY_EXISTS",
            CompileErrorKind::MalformedAssignment => "MALFORMED_ASSIGNMENT",
            CompileErrorKind::InvalidRestVariable => "INVALID_REST_VARIABLE",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone)]
pub struct CompileError {
    pub kind: CompileErrorKind,
    pub message: String,
    pub span: Span,
}

impl CompileError {
    pub fn new(kind: CompileErrorKind, message: impl Into<String>, span: Span) -> Self {
        CompileError { kind, message: message.into(), span }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}: {}", self.span.line, self.span.col_start, self.kind, self.message)
    }
}

impl std::error::Error for CompileError {}
