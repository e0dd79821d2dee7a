//! Gab Compiler
//!
//! Lexes, parses and compiles Gab source straight to bytecode in a single
//! pass: there is no intermediate AST and no separate type-checking phase.
//! The output is a [`gab_core::Prototype`] the runtime can load directly.

pub mod error;
pub mod frame;
pub mod lexer;
pub mod parser;

pub use error::{CompileError, CompileErrorKind};
pub use gab_core::Prototype;
pub use parser::Parser;

/// Compile a full source buffer into a top-level prototype named `name`
/// (typically the source file's path, for diagnostics).
pub fn compile(source: &str, name: &str) -> Result<Prototype, Vec<CompileError>> {
    let mut proto = Parser::new(source).compile()?;
    proto.name = name.to_string();
    Ok(proto)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_empty_source() {
        let proto = compile("", "<test>").expect("empty program compiles");
        assert_eq!(proto.nargs, 0);
    }

    #[test]
    fn compiles_arithmetic() {
        let proto = compile("1 + 2 * 3", "<test>").expect("arithmetic compiles");
        assert!(!proto.code.is_empty());
    }

    #[test]
    fn compiles_local_definition_and_use() {
        let proto = compile("def x = 1\nx + 1", "<test>").expect("locals compile");
        assert_eq!(proto.nlocals, 1);
    }

    #[test]
    fn compiles_block_with_capture() {
        let src = "def x = 1\ndef f = do\nx + 1\nend";
        let proto = compile(src, "<test>").expect("closures compile");
        assert_eq!(proto.protos.len(), 1);
        assert_eq!(proto.protos[0].nupvalues, 1);
    }

    #[test]
    fn mutable_capture_is_rejected() {
        let src = "def x\ndef f = do\nx\nend";
        let err = compile(src, "<test>").unwrap_err();
        assert!(!err.is_empty());
    }

    #[test]
    fn unbound_name_is_reported() {
        let err = compile("totally_unbound", "<test>").unwrap_err();
        assert_eq!(err[0].kind, CompileErrorKind::UnboundSymbol);
    }

    #[test]
    fn missing_end_is_reported() {
        let err = compile("def f = do\n1", "<test>").unwrap_err();
        assert!(err.iter().any(|e| e.kind == CompileErrorKind::MissingEnd));
    }

    #[test]
    fn record_and_tuple_literals_compile() {
        let proto = compile("[x = 1, y = 2]\n{1, 2, 3}", "<test>").expect("literals compile");
        assert!(!proto.code.is_empty());
    }

    #[test]
    fn message_send_compiles() {
        let proto = compile("def rec = [x = 1]\nrec:x", "<test>").expect("sends compile");
        assert!(proto.constants.iter().any(|c| matches!(c, gab_core::Constant::Message(m) if m == "x")));
    }

    #[test]
    fn loop_with_break_compiles() {
        let proto = compile("loop\nbreak\nend", "<test>").expect("loops compile");
        assert!(!proto.code.is_empty());
    }
}
