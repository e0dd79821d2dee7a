//! Pratt-precedence parser that doubles as the compiler: every production
//! appends bytecode to the current frame as it reduces (spec 4.2). There is
//! no intermediate AST.

use crate::error::{CompileError, CompileErrorKind};
use crate::frame::{Frame, LoopCtx};
use crate::lexer::{Lexer, Token, TokenKind};
use gab_core::{Constant, Op, Prototype, Span, SEND_CACHE_LEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Prec {
    None,
    Assignment,
    Or,
    And,
    Match,
    Equality,
    Comparison,
    BitwiseOr,
    BitwiseAnd,
    Term,
    Factor,
    Unary,
    Send,
    Primary,
}

impl Prec {
    fn next(self) -> Prec {
        match self {
            Prec::None => Prec::Assignment,
            Prec::Assignment => Prec::Or,
            Prec::Or => Prec::And,
            Prec::And => Prec::Match,
            Prec::Match => Prec::Equality,
            Prec::Equality => Prec::Comparison,
            Prec::Comparison => Prec::BitwiseOr,
            Prec::BitwiseOr => Prec::BitwiseAnd,
            Prec::BitwiseAnd => Prec::Term,
            Prec::Term => Prec::Factor,
            Prec::Factor => Prec::Unary,
            Prec::Unary => Prec::Send,
            Prec::Send => Prec::Primary,
            Prec::Primary => Prec::Primary,
        }
    }
}

fn precedence_of(kind: TokenKind) -> Prec {
    use TokenKind::*;
    match kind {
        Equal => Prec::Assignment,
        Or => Prec::Or,
        And => Prec::And,
        Then | Else => Prec::Match,
        EqualEqual => Prec::Equality,
        Less | LessEqual | Greater | GreaterEqual => Prec::Comparison,
        Pipe => Prec::BitwiseOr,
        Amp => Prec::BitwiseAnd,
        Plus | Minus | DotDot => Prec::Term,
        Star | Slash | Percent => Prec::Factor,
        Message | LParen => Prec::Send,
        _ => Prec::None,
    }
}

/// Parses one source buffer into a top-level [`Prototype`].
pub struct Parser<'src> {
    lexer: Lexer<'src>,
    previous: Token<'src>,
    current: Token<'src>,
    frames: Vec<Frame>,
    errors: Vec<CompileError>,
}

macro_rules! bail {
    ($self:expr, $kind:expr, $span:expr, $($arg:tt)*) => {
        return Err(CompileError::new($kind, format!($($arg)*), $span))
    };
}

impl<'src> Parser<'src> {
    pub fn new(source: &'src str) -> Self {
        let mut lexer = Lexer::new(source);
        let first = lexer.next_token();
        Parser {
            lexer,
            previous: first.clone(),
            current: first,
            frames: vec![Frame::new("main", 0)],
            errors: Vec::new(),
        }
    }

    /// Compile the whole source buffer as the body of an implicit top-level
    /// block. Returns every error accumulated during a best-effort parse.
    pub fn compile(mut self) -> Result<Prototype, Vec<CompileError>> {
        self.skip_newlines();
        while !self.check(TokenKind::Eof) {
            if let Err(e) = self.statement() {
                self.errors.push(e);
                self.synchronize();
            }
            self.skip_terminators();
        }
        let span = self.current.span;
        self.emit(Op::Return as u8, span);
        self.emit(0, span); // have = 0, not variadic

        if !self.errors.is_empty() {
            return Err(self.errors);
        }
        Ok(self.frames.pop().unwrap().into_prototype())
    }

    // -- token stream -----------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current.clone();
        loop {
            self.current = self.lexer.next_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            self.errors.push(CompileError::new(
                CompileErrorKind::MalformedToken,
                self.current.message.clone().unwrap_or_default(),
                self.current.span,
            ));
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<(), CompileError> {
        if self.check(kind) {
            self.advance();
            Ok(())
        } else if self.check(TokenKind::Eof) {
            bail!(self, CompileErrorKind::UnexpectedEof, self.current.span, "expected {what}, found end of input");
        } else {
            bail!(
                self,
                CompileErrorKind::UnexpectedToken,
                self.current.span,
                "expected {what}, found '{}'",
                self.current.lexeme
            );
        }
    }

    fn skip_newlines(&mut self) {
        while self.check(TokenKind::Newline) {
            self.advance();
        }
    }

    fn skip_terminators(&mut self) {
        while self.check(TokenKind::Newline) || self.check(TokenKind::Semicolon) {
            self.advance();
        }
    }

    fn synchronize(&mut self) {
        while !self.check(TokenKind::Eof) {
            if self.check(TokenKind::Newline) || self.check(TokenKind::Semicolon) {
                self.advance();
                return;
            }
            if matches!(self.current.kind, TokenKind::Def | TokenKind::End | TokenKind::Return) {
                return;
            }
            self.advance();
        }
    }

    // -- frame helpers ------------------------------------------------------

    fn frame(&mut self) -> &mut Frame {
        self.frames.last_mut().unwrap()
    }

    fn emit(&mut self, byte: u8, span: Span) {
        self.frame().emit_byte(byte, span);
    }

    fn emit_u16(&mut self, v: u16, span: Span) {
        self.frame().emit_u16(v, span);
    }

    fn emit_op(&mut self, op: Op) {
        let span = self.previous.span;
        self.emit(op as u8, span);
    }

    fn emit_jump(&mut self, op: Op) -> usize {
        let span = self.previous.span;
        self.emit(op as u8, span);
        let at = self.frame().code.len();
        self.emit_u16(0xFFFF, span);
        at
    }

    fn patch_jump(&mut self, at: usize) {
        let to = self.frame().code.len() as u16;
        self.frame().patch_u16(at, to);
    }

    fn constant(&mut self, c: Constant) -> u16 {
        self.frame().add_constant(c)
    }

    // -- statements ---------------------------------------------------------

    fn statement(&mut self) -> Result<(), CompileError> {
        if self.match_token(TokenKind::Def) {
            return self.def_statement();
        }
        if self.match_token(TokenKind::Return) {
            return self.return_statement();
        }
        if self.match_token(TokenKind::Yield) {
            return self.yield_statement();
        }
        if self.match_token(TokenKind::Loop) {
            return self.loop_statement();
        }
        if self.match_token(TokenKind::Break) {
            return self.break_statement();
        }
        // Expression statement; its value is discarded.
        self.expression(Prec::Assignment)?;
        self.emit_op(Op::Pop);
        Ok(())
    }

    /// `def NAME = expr` introduces a new immutable-by-default local.
    /// `def NAME` alone declares a mutable local initialized to nil.
    fn def_statement(&mut self) -> Result<(), CompileError> {
        self.expect(TokenKind::Identifier, "a name after 'def'")?;
        let name = self.previous.lexeme.to_string();
        let span = self.previous.span;

        let mutable = if self.match_token(TokenKind::Equal) {
            self.expression(Prec::Assignment)?;
            false
        } else {
            self.emit_op(Op::PushNil);
            true
        };

        let slot = self
            .frame()
            .declare_local(&name, mutable)
            .map_err(|m| CompileError::new(CompileErrorKind::LocalAlreadyExists, m, span))?;
        self.emit(Op::PopStoreLocal as u8, span);
        self.emit(slot, span);
        Ok(())
    }

    fn return_statement(&mut self) -> Result<(), CompileError> {
        let span = self.previous.span;
        let mut have: u8 = 0;
        if !self.at_statement_end() {
            self.expression(Prec::Assignment)?;
            have = 1;
            while self.match_token(TokenKind::Comma) {
                self.expression(Prec::Assignment)?;
                have += 1;
            }
        }
        self.emit(Op::Return as u8, span);
        self.emit(have, span);
        Ok(())
    }

    /// `yield` suspends the current fiber; the block resumes after its call
    /// site is rescheduled, with the yielded values left for the caller.
    fn yield_statement(&mut self) -> Result<(), CompileError> {
        let span = self.previous.span;
        let mut have: u8 = 0;
        if !self.at_statement_end() {
            self.expression(Prec::Assignment)?;
            have = 1;
            while self.match_token(TokenKind::Comma) {
                self.expression(Prec::Assignment)?;
                have += 1;
            }
        }
        self.emit(Op::Yield as u8, span);
        self.emit(have, span);
        self.emit_op(Op::Pop);
        Ok(())
    }

    fn at_statement_end(&self) -> bool {
        matches!(
            self.current.kind,
            TokenKind::Newline | TokenKind::Semicolon | TokenKind::Eof | TokenKind::End
        )
    }

    /// `loop ... end` or `loop ... until expr end`.
    fn loop_statement(&mut self) -> Result<(), CompileError> {
        let start = self.frame().code.len();
        self.frame().loop_stack.push(LoopCtx { start, breaks: Vec::new() });
        self.skip_terminators();
        while !self.check(TokenKind::End) && !self.check(TokenKind::Until) {
            if self.check(TokenKind::Eof) {
                bail!(self, CompileErrorKind::MissingEnd, self.current.span, "loop is missing a matching 'end'");
            }
            self.statement()?;
            self.skip_terminators();
        }
        if self.match_token(TokenKind::Until) {
            self.expression(Prec::Assignment)?;
            let exit = self.emit_jump(Op::PopJumpIfTrue);
            self.emit_loop(start);
            self.patch_jump(exit);
        } else {
            self.emit_loop(start);
        }
        self.expect(TokenKind::End, "'end' to close 'loop'")?;
        let ctx = self.frame().loop_stack.pop().unwrap();
        for b in ctx.breaks {
            self.patch_jump(b);
        }
        Ok(())
    }

    fn emit_loop(&mut self, start: usize) {
        let span = self.previous.span;
        self.emit(Op::Loop as u8, span);
        let offset = (self.frame().code.len() + 2 - start) as u16;
        self.emit_u16(offset, span);
    }

    fn break_statement(&mut self) -> Result<(), CompileError> {
        if !self.at_statement_end() {
            self.expression(Prec::Assignment)?;
        } else {
            self.emit_op(Op::PushNil);
        }
        if self.frame().loop_stack.is_empty() {
            bail!(self, CompileErrorKind::UnexpectedToken, self.previous.span, "'break' outside of a loop");
        }
        let at = self.emit_jump(Op::Jump);
        self.frame().loop_stack.last_mut().unwrap().breaks.push(at);
        Ok(())
    }

    // -- expressions ----------------------------------------------------------

    fn expression(&mut self, min_prec: Prec) -> Result<(), CompileError> {
        self.prefix()?;
        while precedence_of(self.current.kind) >= min_prec && precedence_of(self.current.kind) != Prec::None {
            self.infix()?;
        }
        Ok(())
    }

    fn prefix(&mut self) -> Result<(), CompileError> {
        self.advance();
        let span = self.previous.span;
        match self.previous.kind {
            TokenKind::Number => {
                let n: f64 = self.previous.lexeme.parse().unwrap_or(f64::NAN);
                let k = self.constant(Constant::Number(n));
                self.emit(Op::Constant as u8, span);
                self.emit_u16(k, span);
                Ok(())
            }
            TokenKind::String => {
                let text = unescape(self.previous.lexeme);
                let k = self.constant(Constant::String(text));
                self.emit(Op::Constant as u8, span);
                self.emit_u16(k, span);
                Ok(())
            }
            TokenKind::InterpolationBegin => self.interpolated_string(),
            TokenKind::Sigil => {
                let name = &self.previous.lexeme[1..];
                match name {
                    "true" => self.emit_op(Op::PushTrue),
                    "false" => self.emit_op(Op::PushFalse),
                    "nil" => self.emit_op(Op::PushNil),
                    _ => {
                        let k = self.constant(Constant::Sigil(name.to_string()));
                        self.emit(Op::Constant as u8, span);
                        self.emit_u16(k, span);
                    }
                }
                Ok(())
            }
            TokenKind::Message => {
                let name = self.previous.lexeme[1..].to_string();
                let k = self.constant(Constant::Message(name));
                self.emit(Op::Constant as u8, span);
                self.emit_u16(k, span);
                Ok(())
            }
            TokenKind::Identifier => self.variable(),
            TokenKind::LParen => {
                self.expression(Prec::Assignment)?;
                self.expect(TokenKind::RParen, "')' to close grouping")
            }
            TokenKind::Minus => {
                self.expression(Prec::Unary)?;
                self.emit_op(Op::Negate);
                Ok(())
            }
            TokenKind::Not => {
                self.expression(Prec::Unary)?;
                self.emit_op(Op::Not);
                Ok(())
            }
            TokenKind::Do => self.block_literal(),
            TokenKind::LBracket => self.record_literal(),
            TokenKind::LBrace => self.tuple_literal(),
            _ => bail!(
                self,
                CompileErrorKind::UnexpectedToken,
                span,
                "unexpected '{}' in expression position",
                self.previous.lexeme
            ),
        }
    }

    fn interpolated_string(&mut self) -> Result<(), CompileError> {
        let span = self.previous.span;
        let mut parts: u8 = 0;
        let leading = unescape(self.previous.lexeme);
        if !leading.is_empty() {
            let k = self.constant(Constant::String(leading));
            self.emit(Op::Constant as u8, span);
            self.emit_u16(k, span);
            parts += 1;
        }
        loop {
            self.expression(Prec::Assignment)?;
            parts += 1;
            self.advance();
            match self.previous.kind {
                TokenKind::InterpolationMiddle => {
                    let text = unescape(self.previous.lexeme);
                    if !text.is_empty() {
                        let k = self.constant(Constant::String(text));
                        self.emit(Op::Constant as u8, self.previous.span);
                        self.emit_u16(k, self.previous.span);
                        parts += 1;
                    }
                }
                TokenKind::InterpolationEnd => {
                    let text = unescape(self.previous.lexeme);
                    if !text.is_empty() {
                        let k = self.constant(Constant::String(text));
                        self.emit(Op::Constant as u8, self.previous.span);
                        self.emit_u16(k, self.previous.span);
                        parts += 1;
                    }
                    break;
                }
                _ => bail!(self, CompileErrorKind::UnexpectedToken, self.previous.span, "malformed string interpolation"),
            }
        }
        self.emit(Op::Interpolate as u8, span);
        self.emit(parts, span);
        Ok(())
    }

    /// Resolve an identifier against the local/upvalue chain, cascading the
    /// capture through every intermediate frame (spec 4.2.1).
    fn variable(&mut self) -> Result<(), CompileError> {
        let name = self.previous.lexeme.to_string();
        let span = self.previous.span;

        if self.match_token(TokenKind::Equal) {
            return self.assign_existing(&name, span);
        }

        if let Some(slot) = self.frame().resolve_local(&name) {
            let slot = self.frame().locals[slot].slot;
            self.emit(Op::LoadLocal as u8, span);
            self.emit(slot, span);
            return Ok(());
        }

        if let Some(idx) = self.resolve_upvalue(self.frames.len() - 1, &name)? {
            self.emit(Op::LoadUpvalue as u8, span);
            self.emit(idx, span);
            return Ok(());
        }

        bail!(self, CompileErrorKind::UnboundSymbol, span, "unbound name '{name}'");
    }

    fn assign_existing(&mut self, name: &str, span: Span) -> Result<(), CompileError> {
        self.expression(Prec::Assignment)?;
        if let Some(pos) = self.frame().resolve_local(name) {
            let (mutable, slot) = {
                let local = &self.frame().locals[pos];
                (local.flags.mutable, local.slot)
            };
            if !mutable {
                bail!(self, CompileErrorKind::MalformedAssignment, span, "'{name}' is immutable");
            }
            self.emit(Op::PopStoreLocal as u8, span);
            self.emit(slot, span);
            return Ok(());
        }
        bail!(self, CompileErrorKind::UnboundSymbol, span, "unbound name '{name}'");
    }

    /// Walk outward from `frame_idx` looking for `name` as a local in some
    /// enclosing frame. Every frame strictly between the definition site and
    /// the use site gets a forwarding upvalue entry (cascading capture), and
    /// the defining local is flagged `CAPTURED`.
    fn resolve_upvalue(&mut self, frame_idx: usize, name: &str) -> Result<Option<u8>, CompileError> {
        if frame_idx == 0 {
            return Ok(None);
        }
        let parent_idx = frame_idx - 1;
        if let Some(local_pos) = self.frames[parent_idx].resolve_local(name) {
            if !self.frames[parent_idx].locals[local_pos].flags.mutable {
                // ok to capture
            } else {
                bail!(
                    self,
                    CompileErrorKind::ReferenceBeforeInitialize,
                    self.current.span,
                    "cannot capture mutable local '{name}'; declare it with 'def {name} = ...'"
                );
            }
            self.frames[parent_idx].locals[local_pos].flags.captured = true;
            let slot = self.frames[parent_idx].locals[local_pos].slot;
            let idx = self.frames[frame_idx].add_upvalue(name, true, slot);
            return Ok(Some(idx));
        }
        if let Some(outer_idx) = self.resolve_upvalue(parent_idx, name)? {
            let idx = self.frames[frame_idx].add_upvalue(name, false, outer_idx);
            return Ok(Some(idx));
        }
        Ok(None)
    }

    fn infix(&mut self) -> Result<(), CompileError> {
        let kind = self.current.kind;
        let prec = precedence_of(kind);
        self.advance();
        let span = self.previous.span;
        match kind {
            TokenKind::Plus => self.binary(Op::SendPrimitiveAdd, prec),
            TokenKind::Minus => self.binary(Op::SendPrimitiveSub, prec),
            TokenKind::Star => self.binary(Op::SendPrimitiveMul, prec),
            TokenKind::Slash => self.binary(Op::SendPrimitiveDiv, prec),
            TokenKind::Percent => self.binary(Op::SendPrimitiveMod, prec),
            TokenKind::EqualEqual => self.binary(Op::SendPrimitiveEq, prec),
            TokenKind::Less => self.binary(Op::SendPrimitiveLt, prec),
            TokenKind::LessEqual => self.binary(Op::SendPrimitiveLte, prec),
            TokenKind::Greater => self.binary(Op::SendPrimitiveGt, prec),
            TokenKind::GreaterEqual => self.binary(Op::SendPrimitiveGte, prec),
            TokenKind::DotDot => self.binary(Op::SendPrimitiveConcat, prec),
            TokenKind::And => {
                let at = self.emit_jump(Op::JumpIfFalse);
                self.emit_op(Op::Pop);
                self.expression(prec.next())?;
                self.patch_jump(at);
                Ok(())
            }
            TokenKind::Or => {
                let at = self.emit_jump(Op::JumpIfTrue);
                self.emit_op(Op::Pop);
                self.expression(prec.next())?;
                self.patch_jump(at);
                Ok(())
            }
            TokenKind::Then => {
                let at = self.emit_jump(Op::PopJumpIfFalse);
                self.expression(prec.next())?;
                self.patch_jump(at);
                Ok(())
            }
            TokenKind::Else => {
                let at = self.emit_jump(Op::PopJumpIfTrue);
                self.expression(prec.next())?;
                self.patch_jump(at);
                Ok(())
            }
            TokenKind::Message => self.message_send(span),
            TokenKind::LParen => self.call_sugar(span),
            _ => bail!(self, CompileErrorKind::UnexpectedToken, span, "'{}' cannot appear here", self.previous.lexeme),
        }
    }

    fn binary(&mut self, op: Op, prec: Prec) -> Result<(), CompileError> {
        let span = self.previous.span;
        self.expression(prec.next())?;
        self.emit(op as u8, span);
        Ok(())
    }

    /// `receiver:message` (read/invoke, `have=0`) or `receiver:message(args)`.
    fn message_send(&mut self, span: Span) -> Result<(), CompileError> {
        let name = self.previous.lexeme[1..].to_string();
        let mut have: u8 = 0;
        if self.match_token(TokenKind::LParen) {
            have = self.argument_list()?;
        }
        let k = self.constant(Constant::Message(name));
        self.emit(Op::Send as u8, span);
        self.emit_u16(k, span);
        self.emit(have, span);
        for _ in 0..SEND_CACHE_LEN {
            self.emit(0, span); // zeroed inline cache
        }
        Ok(())
    }

    /// `callee(args)` is sugar for sending the well-known `call` message.
    fn call_sugar(&mut self, span: Span) -> Result<(), CompileError> {
        let have = self.argument_list()?;
        let k = self.constant(Constant::Message("call".to_string()));
        self.emit(Op::Send as u8, span);
        self.emit_u16(k, span);
        self.emit(have, span);
        for _ in 0..SEND_CACHE_LEN {
            self.emit(0, span);
        }
        Ok(())
    }

    fn argument_list(&mut self) -> Result<u8, CompileError> {
        let mut count: u8 = 0;
        if !self.check(TokenKind::RParen) {
            self.expression(Prec::Assignment)?;
            count += 1;
            while self.match_token(TokenKind::Comma) {
                self.expression(Prec::Assignment)?;
                count += 1;
            }
        }
        self.expect(TokenKind::RParen, "')' to close argument list")?;
        Ok(count)
    }

    /// `do (params) ... end` or `do ... end` with zero parameters.
    fn block_literal(&mut self) -> Result<(), CompileError> {
        let span = self.previous.span;
        let mut params = Vec::new();
        if self.match_token(TokenKind::LParen) {
            if !self.check(TokenKind::RParen) {
                loop {
                    self.expect(TokenKind::Identifier, "a parameter name")?;
                    params.push(self.previous.lexeme.to_string());
                    if !self.match_token(TokenKind::Comma) {
                        break;
                    }
                }
            }
            self.expect(TokenKind::RParen, "')' after block parameters")?;
        } else if self.check(TokenKind::Identifier) {
            // `do name; ...` sugar: a single bare parameter before ';'.
            loop {
                self.expect(TokenKind::Identifier, "a parameter name")?;
                params.push(self.previous.lexeme.to_string());
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
            if self.check(TokenKind::Semicolon) {
                self.advance();
            }
        }
        if params.len() > u8::MAX as usize - 1 {
            bail!(self, CompileErrorKind::TooManyParameters, span, "block has too many parameters");
        }

        let block_name = format!("{}$block", self.frames.last().unwrap().name);
        self.frames.push(Frame::new(block_name, params.len() as u8));
        for p in &params {
            self.frame().declare_local(p, false).map_err(|m| CompileError::new(CompileErrorKind::LocalAlreadyExists, m, span))?;
        }
        self.skip_terminators();
        while !self.check(TokenKind::End) {
            if self.check(TokenKind::Eof) {
                bail!(self, CompileErrorKind::MissingEnd, self.current.span, "block is missing a matching 'end'");
            }
            self.statement()?;
            self.skip_terminators();
        }
        self.expect(TokenKind::End, "'end' to close 'do'")?;
        let tail_span = self.previous.span;
        self.emit(Op::Return as u8, tail_span);
        self.emit(0, tail_span);

        let inner = self.frames.pop().unwrap();
        let proto = inner.into_prototype();
        let proto_slot = self.frame().add_proto(proto);
        self.emit(Op::Block as u8, span);
        self.emit_u16(proto_slot, span);
        Ok(())
    }

    fn record_literal(&mut self) -> Result<(), CompileError> {
        let span = self.previous.span;
        let mut count: u8 = 0;
        self.skip_newlines();
        if !self.check(TokenKind::RBracket) {
            loop {
                self.skip_newlines();
                self.expect(TokenKind::Identifier, "a field name")?;
                let key = self.previous.lexeme.to_string();
                let kspan = self.previous.span;
                let k = self.constant(Constant::Sigil(key));
                self.expect(TokenKind::Equal, "'=' after field name")?;
                self.expression(Prec::Assignment)?;
                self.emit(Op::Constant as u8, kspan);
                self.emit_u16(k, kspan);
                self.emit_op(Op::Swap);
                count += 1;
                self.skip_newlines();
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.skip_newlines();
        self.expect(TokenKind::RBracket, "']' to close record literal")?;
        self.emit(Op::Record as u8, span);
        self.emit(count, span);
        Ok(())
    }

    fn tuple_literal(&mut self) -> Result<(), CompileError> {
        let span = self.previous.span;
        let mut count: u8 = 0;
        self.skip_newlines();
        if !self.check(TokenKind::RBrace) {
            self.expression(Prec::Assignment)?;
            count += 1;
            while self.match_token(TokenKind::Comma) {
                self.skip_newlines();
                self.expression(Prec::Assignment)?;
                count += 1;
            }
        }
        self.skip_newlines();
        self.expect(TokenKind::RBrace, "'}' to close tuple literal")?;
        self.emit(Op::Tuple as u8, span);
        self.emit(count, span);
        Ok(())
    }
}

/// Collapse backslash escapes (`\n`, `\t`, `\\`, `\'`, `\"`) in a literal.
fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('\\') => out.push('\\'),
                Some('\'') => out.push('\''),
                Some('"') => out.push('"'),
                Some(other) => out.push(other),
                None => {}
            }
        } else {
            out.push(c);
        }
    }
    out
}
