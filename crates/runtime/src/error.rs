//! Runtime error taxonomy and diagnostic formatting (spec 7).
//!
//! Rust-native specializations and primitives propagate failure as an
//! ordinary `Result<_, RuntimeError>`; the one place that can't is a
//! `dlopen`ed native module's `extern "C" gab_lib` entry point (spec 6.4),
//! which crosses the FFI boundary and so cannot return a Rust `Result`. That
//! entry point instead calls [`set_panic`] before returning on failure, and
//! [`crate::module::load_native`] checks [`take_panic`] right after the call
//! to fold it back into a `RuntimeError`.

use gab_core::Span;
use std::cell::RefCell;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeErrorKind {
    TypeMismatch,
    NotNumber,
    NotString,
    NotCallable,
    NotMessage,
    Overflow,
    ImplementationMissing,
    ImplementationExists,
    Panic,
}

impl fmt::Display for RuntimeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RuntimeErrorKind::TypeMismatch => "TYPE_MISMATCH",
            RuntimeErrorKind::NotNumber => "NOT_NUMBER",
            RuntimeErrorKind::NotString => "NOT_STRING",
            RuntimeErrorKind::NotCallable => "NOT_CALLABLE",
            RuntimeErrorKind::NotMessage => "NOT_MESSAGE",
            RuntimeErrorKind::Overflow => "OVERFLOW",
            RuntimeErrorKind::ImplementationMissing => "IMPLEMENTATION_MISSING",
            RuntimeErrorKind::ImplementationExists => "IMPLEMENTATION_EXISTS",
            RuntimeErrorKind::Panic => "PANIC",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub kind: RuntimeErrorKind,
    pub message: String,
    pub span: Span,
    /// Name of the source/module the failing frame belongs to.
    pub src: String,
    pub token: String,
}

impl RuntimeError {
    pub fn new(kind: RuntimeErrorKind, message: impl Into<String>, span: Span) -> Self {
        RuntimeError { kind, message: message.into(), span, src: String::new(), token: String::new() }
    }

    pub fn with_context(mut self, src: impl Into<String>, token: impl Into<String>) -> Self {
        self.src = src.into();
        self.token = token.into();
        self
    }

    /// `status:src:token:msg:line:col_start:col_end:src_start:src_end`, the
    /// machine-parseable form selected by `ERR_STRUCTURED`.
    pub fn structured(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}:{}:{}:{}:{}",
            self.kind,
            self.src,
            self.token,
            self.message,
            self.span.line,
            self.span.col_start,
            self.span.col_end,
            self.span.col_start,
            self.span.col_end
        )
    }

    /// Pretty form: a source excerpt with `^^^` under the offending span.
    pub fn pretty(&self, source: &str) -> String {
        let line_text = source.lines().nth(self.span.line.saturating_sub(1) as usize).unwrap_or("");
        let col = self.span.col_start.saturating_sub(1) as usize;
        let width = (self.span.col_end.saturating_sub(self.span.col_start)).max(1) as usize;
        let underline: String = " ".repeat(col) + &"^".repeat(width);
        format!(
            "{}:{}: {}: {}\n  {}\n  {}",
            self.src.is_empty().then(|| "<input>").unwrap_or(&self.src),
            self.span.line,
            self.kind,
            self.message,
            line_text,
            underline
        )
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}: {}", self.span.line, self.span.col_start, self.kind, self.message)
    }
}

impl std::error::Error for RuntimeError {}

thread_local! {
    static LAST_PANIC: RefCell<Option<RuntimeError>> = const { RefCell::new(None) };
}

/// Record a panic on the current thread. Called from a native module's
/// `gab_lib` entry point in place of returning a Rust `Result` across the
/// `extern "C"` boundary; [`crate::module::load_native`] takes it back out
/// right after the call returns.
pub fn set_panic(err: RuntimeError) {
    LAST_PANIC.with(|p| *p.borrow_mut() = Some(err));
}

pub fn take_panic() -> Option<RuntimeError> {
    LAST_PANIC.with(|p| p.borrow_mut().take())
}

pub fn clear_panic() {
    LAST_PANIC.with(|p| *p.borrow_mut() = None);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_take_panic_round_trips() {
        clear_panic();
        assert!(take_panic().is_none());
        set_panic(RuntimeError::new(RuntimeErrorKind::NotCallable, "nil is not callable", Span::point(1, 1)));
        let err = take_panic().unwrap();
        assert_eq!(err.kind, RuntimeErrorKind::NotCallable);
        assert!(take_panic().is_none());
    }

    #[test]
    fn structured_format_has_nine_fields() {
        let err = RuntimeError::new(RuntimeErrorKind::NotNumber, "not a number", Span::new(3, 4, 8))
            .with_context("<test>", "+");
        assert_eq!(err.structured().split(':').count(), 9);
    }

    #[test]
    fn pretty_format_underlines_the_span() {
        let err = RuntimeError::new(RuntimeErrorKind::Overflow, "stack exhausted", Span::new(1, 1, 4));
        let out = err.pretty("boom");
        assert!(out.contains("^^^^") || out.contains("^^^"));
    }
}
