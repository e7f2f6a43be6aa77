use std::rc::Rc;

use super::chunk::{Chunk, Function, OpCode};
use super::debug::disassemble_chunk;
use super::error::CompileError;
use super::lexer::{Scanner, Token, TokenKind};
use super::table::Interner;
use super::value::{Array, ElementType, Elements, Scalar};

const MAX_LOCALS: usize = 256;
const MAX_ARGS: usize = 255;

/// Compile `source` into the top-level script function.
///
/// Identifiers are interned through `strings`, so the caller's VM must share
/// the same interner to resolve globals.
pub fn compile(source: &str, strings: &mut Interner) -> Result<Rc<Function>, Vec<CompileError>> {
    Compiler::new(source, strings).compile()
}

/// Binding power, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * / .
    Unary,      // - + # ! & |
    Call,       // () @
    Primary,
}

impl Precedence {
    fn next(self) -> Self {
        match self {
            Self::None => Self::Assignment,
            Self::Assignment => Self::Or,
            Self::Or => Self::And,
            Self::And => Self::Equality,
            Self::Equality => Self::Comparison,
            Self::Comparison => Self::Term,
            Self::Term => Self::Factor,
            Self::Factor => Self::Unary,
            Self::Unary => Self::Call,
            Self::Call | Self::Primary => Self::Primary,
        }
    }
}

type ParseFn<'src, 'i> = fn(&mut Compiler<'src, 'i>, bool);

struct ParseRule<'src, 'i> {
    prefix: Option<ParseFn<'src, 'i>>,
    infix: Option<ParseFn<'src, 'i>>,
    precedence: Precedence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
}

#[derive(Debug)]
struct Local<'src> {
    name: &'src str,
    /// `None` while the initializer is still being compiled.
    depth: Option<usize>,
}

/// Per-function compilation state. Nested function declarations push a new
/// one; the enclosing states wait on `Compiler::enclosing`.
struct FunctionState<'src> {
    function: Function,
    kind: FunctionKind,
    locals: Vec<Local<'src>>,
    scope_depth: usize,
}

impl FunctionState<'_> {
    fn new(kind: FunctionKind, function: Function) -> Self {
        Self {
            function,
            kind,
            // Slot 0 holds the callee itself.
            locals: vec![Local {
                name: "",
                depth: Some(0),
            }],
            scope_depth: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyKind {
    Chars,
    Numbers,
}

/// Accumulates one bracketed literal. Elements go into `array` flat; the
/// shape is checked level by level and applied when the outermost level
/// closes.
struct LiteralBuilder {
    array: Array,
    body_kind: Option<BodyKind>,
    /// Brackets opened and not yet closed.
    open: usize,
}

impl LiteralBuilder {
    fn new() -> Self {
        Self {
            array: Array::new(ElementType::Unknown),
            body_kind: None,
            open: 1,
        }
    }

    /// Append the scalars of one raw body. Returns how many were added.
    fn add_body(&mut self, body: &str) -> Result<usize, String> {
        let Some(first) = body.bytes().next() else {
            return Ok(0);
        };
        let kind = if first.is_ascii_alphabetic() {
            BodyKind::Chars
        } else if first.is_ascii_digit() || matches!(first, b'-' | b'+' | b'.') {
            BodyKind::Numbers
        } else {
            return Err(format!("Unrecognized array element '{body}'."));
        };
        match self.body_kind {
            Some(existing) if existing != kind => {
                return Err("Cannot mix characters and numbers in one array literal.".into());
            }
            _ => self.body_kind = Some(kind),
        }
        match kind {
            BodyKind::Chars => {
                for byte in body.bytes() {
                    self.array.push(Scalar::Char(byte), false).map_err(|e| e.to_string())?;
                }
                Ok(body.len())
            }
            BodyKind::Numbers => {
                let mut added = 0;
                for text in body
                    .split(|c: char| c == ',' || c.is_whitespace())
                    .filter(|s| !s.is_empty())
                {
                    self.push_number(text)?;
                    added += 1;
                }
                Ok(added)
            }
        }
    }

    fn push_number(&mut self, text: &str) -> Result<(), String> {
        let is_float = matches!(self.array.elements(), Elements::Float(_));
        let scalar = match text.parse::<i64>() {
            #[allow(clippy::cast_precision_loss)]
            Ok(v) if is_float => Scalar::Float(v as f64),
            Ok(v) => Scalar::Int(v),
            Err(_) if is_integral(text) => return Err(out_of_range(text)),
            Err(_) => {
                let v: f64 = text
                    .parse()
                    .map_err(|_| format!("Invalid number '{text}' in array literal."))?;
                // One fractional element makes the whole literal float.
                self.array.promote_to_float();
                Scalar::Float(v)
            }
        };
        self.array.push(scalar, false).map_err(|e| e.to_string())
    }

    fn finish(mut self, shape: &[usize]) -> Array {
        for (axis, &extent) in shape.iter().enumerate() {
            self.array.set_dimension(extent, axis);
        }
        self.array
    }
}

/// Digits with an optional sign: text that must fit an integer element.
fn is_integral(text: &str) -> bool {
    let digits = text.strip_prefix(['-', '+']).unwrap_or(text);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

fn out_of_range(text: &str) -> String {
    format!("Integer literal '{text}' is out of range.")
}

/// Single-pass compiler: parses with a Pratt table and emits bytecode
/// directly, with no intermediate tree.
pub struct Compiler<'src, 'i> {
    scanner: Scanner<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    errors: Vec<CompileError>,
    panic_mode: bool,
    strings: &'i mut Interner,
    state: FunctionState<'src>,
    enclosing: Vec<FunctionState<'src>>,
    print_code: bool,
}

impl<'src, 'i> Compiler<'src, 'i> {
    pub fn new(source: &'src str, strings: &'i mut Interner) -> Self {
        Self {
            scanner: Scanner::new(source),
            current: Token::synthetic(),
            previous: Token::synthetic(),
            errors: Vec::new(),
            panic_mode: false,
            strings,
            state: FunctionState::new(FunctionKind::Script, Function::default()),
            enclosing: Vec::new(),
            print_code: false,
        }
    }

    /// Log a disassembly of every function that compiles cleanly.
    pub fn print_code(mut self, enabled: bool) -> Self {
        self.print_code = enabled;
        self
    }

    pub fn compile(mut self) -> Result<Rc<Function>, Vec<CompileError>> {
        self.advance();
        while !self.match_token(TokenKind::Eof) {
            self.declaration();
        }
        let function = self.end_function();
        if self.errors.is_empty() {
            Ok(Rc::new(function))
        } else {
            tracing::debug!(errors = self.errors.len(), "compilation failed");
            Err(self.errors)
        }
    }

    // ── Token cursor ───────────────────────────────────────────────

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let token = self.current;
            self.report(CompileError::lexer(token.lexeme, token.line));
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    // ── Diagnostics ────────────────────────────────────────────────

    fn report(&mut self, error: CompileError) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.errors.push(error);
    }

    fn location(token: &Token<'_>) -> String {
        match token.kind {
            TokenKind::Eof => " at end".to_string(),
            _ => format!(" at '{}'", token.lexeme),
        }
    }

    fn error(&mut self, message: &str) {
        let token = self.previous;
        self.report(CompileError::parser(message, token.line, Self::location(&token)));
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.current;
        self.report(CompileError::parser(message, token.line, Self::location(&token)));
    }

    /// Errors that are well-formed syntax but violate a compile-time limit or rule.
    fn semantic_error(&mut self, message: &str) {
        let token = self.previous;
        self.report(CompileError::compiler(message, token.line, Self::location(&token)));
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // ── Emission ───────────────────────────────────────────────────

    fn chunk(&mut self) -> &mut Chunk {
        &mut self.state.function.chunk
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.chunk().write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op.into());
    }

    fn emit_op_arg(&mut self, op: OpCode, arg: u8) {
        self.emit_op(op);
        self.emit_byte(arg);
    }

    fn emit_return(&mut self) {
        self.emit_op(OpCode::Nil);
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Rc<Array>) -> u8 {
        let index = self.chunk().add_constant(value);
        u8::try_from(index).unwrap_or_else(|_| {
            self.semantic_error("Too many constants in one chunk.");
            0
        })
    }

    fn emit_constant(&mut self, value: Array) {
        let index = self.make_constant(Rc::new(value));
        self.emit_op_arg(OpCode::Constant, index);
    }

    /// Emit a forward jump with a placeholder offset; returns the operand position.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.chunk().len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        let jump = self.chunk().len() - offset - 2;
        let Ok(jump) = u16::try_from(jump) else {
            self.semantic_error("Too much code to jump over.");
            return;
        };
        let [hi, lo] = jump.to_be_bytes();
        let code = &mut self.chunk().code;
        code[offset] = hi;
        code[offset + 1] = lo;
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.chunk().len() - loop_start + 2;
        let Ok(offset) = u16::try_from(offset) else {
            self.semantic_error("Loop body too large.");
            return;
        };
        let [hi, lo] = offset.to_be_bytes();
        self.emit_byte(hi);
        self.emit_byte(lo);
    }

    fn end_function(&mut self) -> Function {
        self.emit_return();
        let parent = self
            .enclosing
            .pop()
            .unwrap_or_else(|| FunctionState::new(FunctionKind::Script, Function::default()));
        let finished = std::mem::replace(&mut self.state, parent);
        let function = finished.function;
        let name = function.display_name().unwrap_or("<script>");
        tracing::debug!(
            function = name,
            bytes = function.chunk.len(),
            constants = function.chunk.constants.len(),
            "compiled chunk"
        );
        if self.print_code && self.errors.is_empty() {
            tracing::trace!("\n{}", disassemble_chunk(&function.chunk, name));
        }
        function
    }

    // ── Declarations and statements ────────────────────────────────

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        self.mark_initialized();
        self.function();
        self.define_variable(global);
    }

    fn function(&mut self) {
        let function = Function {
            name: Some(self.strings.intern(self.previous.lexeme)),
            ..Function::default()
        };
        let outer = std::mem::replace(&mut self.state, FunctionState::new(FunctionKind::Function, function));
        self.enclosing.push(outer);
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                self.state.function.arity += 1;
                if self.state.function.arity > MAX_ARGS {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let function = self.end_function();
        let index = self.make_constant(Rc::new(Array::function(Rc::new(function))));
        self.emit_op_arg(OpCode::Constant, index);
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after value.");
            self.emit_op(OpCode::Print);
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
            self.emit_op(OpCode::Pop);
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);

        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.chunk().len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenKind::Semicolon) {
            // No initializer.
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
            self.emit_op(OpCode::Pop);
        }

        let mut loop_start = self.chunk().len();
        let mut exit_jump = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.chunk().len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }
        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.state.kind == FunctionKind::Script {
            self.semantic_error("Can't return from top-level code.");
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    // ── Scopes and variables ───────────────────────────────────────

    fn begin_scope(&mut self) {
        self.state.scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.state.scope_depth -= 1;
        let depth = self.state.scope_depth;
        while self
            .state
            .locals
            .last()
            .is_some_and(|local| local.depth.map_or(true, |d| d > depth))
        {
            self.emit_op(OpCode::Pop);
            self.state.locals.pop();
        }
    }

    /// Constant-pool index of the key for `name`, reusing an existing entry.
    fn identifier_constant(&mut self, name: &str) -> u8 {
        let key = self.strings.intern(name);
        let existing = self
            .chunk()
            .constants
            .iter()
            .position(|c| c.as_key().is_some_and(|k| Rc::ptr_eq(k, &key)));
        if let Some(index) = existing.and_then(|i| u8::try_from(i).ok()) {
            return index;
        }
        self.make_constant(Rc::new(Array::key(key)))
    }

    fn resolve_local(&mut self, name: &str) -> Option<u8> {
        let (slot, initialized) = self
            .state
            .locals
            .iter()
            .enumerate()
            .rev()
            .find(|(_, local)| local.name == name)
            .map(|(slot, local)| (slot, local.depth.is_some()))?;
        if !initialized {
            self.error("Can't read local variable in its own initializer.");
        }
        u8::try_from(slot).ok()
    }

    fn add_local(&mut self, name: &'src str) {
        if self.state.locals.len() == MAX_LOCALS {
            self.semantic_error("Too many local variables in function.");
            return;
        }
        self.state.locals.push(Local { name, depth: None });
    }

    fn declare_variable(&mut self) {
        let depth = self.state.scope_depth;
        if depth == 0 {
            return;
        }
        let name = self.previous.lexeme;
        let duplicate = self
            .state
            .locals
            .iter()
            .rev()
            .take_while(|local| local.depth.map_or(true, |d| d >= depth))
            .any(|local| local.name == name);
        if duplicate {
            self.semantic_error("Already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.state.scope_depth > 0 {
            return 0;
        }
        let name = self.previous.lexeme;
        self.identifier_constant(name)
    }

    fn mark_initialized(&mut self) {
        let depth = self.state.scope_depth;
        if depth == 0 {
            return;
        }
        if let Some(local) = self.state.locals.last_mut() {
            local.depth = Some(depth);
        }
    }

    fn define_variable(&mut self, global: u8) {
        if self.state.scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op_arg(OpCode::DefineGlobal, global);
    }

    fn named_variable(&mut self, name: &'src str, can_assign: bool) {
        let (get, set, arg) = match self.resolve_local(name) {
            Some(slot) => (OpCode::GetLocal, OpCode::SetLocal, slot),
            None => {
                let index = self.identifier_constant(name);
                (OpCode::GetGlobal, OpCode::SetGlobal, index)
            }
        };
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op_arg(set, arg);
        } else {
            self.emit_op_arg(get, arg);
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: usize = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count == MAX_ARGS {
                    self.error("Can't have more than 255 arguments.");
                }
                count += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        u8::try_from(count).unwrap_or(u8::MAX)
    }

    // ── Expressions ────────────────────────────────────────────────

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = Self::rule(self.previous.kind).prefix else {
            self.error("Expect expression.");
            return;
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= Self::rule(self.current.kind).precedence {
            self.advance();
            if let Some(infix) = Self::rule(self.previous.kind).infix {
                infix(self, can_assign);
            }
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn rule(kind: TokenKind) -> ParseRule<'src, 'i> {
        let (prefix, infix, precedence): (Option<ParseFn<'src, 'i>>, Option<ParseFn<'src, 'i>>, _) =
            match kind {
                TokenKind::LeftParen => (Some(Self::grouping), Some(Self::call), Precedence::Call),
                TokenKind::LeftBracket => (Some(Self::array_literal), None, Precedence::None),
                TokenKind::At => (None, Some(Self::lookup), Precedence::Call),
                TokenKind::Minus | TokenKind::Plus => {
                    (Some(Self::unary), Some(Self::binary), Precedence::Term)
                }
                TokenKind::Slash | TokenKind::Star | TokenKind::Dot => {
                    (None, Some(Self::binary), Precedence::Factor)
                }
                TokenKind::Hash | TokenKind::Bang | TokenKind::Ampersand | TokenKind::Pipe => {
                    (Some(Self::unary), None, Precedence::None)
                }
                TokenKind::BangEqual | TokenKind::EqualEqual => {
                    (None, Some(Self::binary), Precedence::Equality)
                }
                TokenKind::Greater
                | TokenKind::GreaterEqual
                | TokenKind::Less
                | TokenKind::LessEqual => (None, Some(Self::binary), Precedence::Comparison),
                TokenKind::Identifier => (Some(Self::variable), None, Precedence::None),
                TokenKind::Number => (Some(Self::number), None, Precedence::None),
                TokenKind::True | TokenKind::False => (Some(Self::literal), None, Precedence::None),
                TokenKind::And => (None, Some(Self::and), Precedence::And),
                TokenKind::Or => (None, Some(Self::or), Precedence::Or),
                _ => (None, None, Precedence::None),
            };
        ParseRule {
            prefix,
            infix,
            precedence,
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn call(&mut self, _can_assign: bool) {
        let count = self.argument_list();
        self.emit_op_arg(OpCode::Call, count);
    }

    /// `source @ indices`. The index side binds at unary level, so chains
    /// group to the right.
    fn lookup(&mut self, _can_assign: bool) {
        self.parse_precedence(Precedence::Unary);
        self.emit_op(OpCode::Lookup);
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Plus => self.emit_op(OpCode::PreAdd),
            TokenKind::Hash => self.emit_op(OpCode::GetDims),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            TokenKind::Ampersand => self.emit_op(OpCode::All),
            TokenKind::Pipe => self.emit_op(OpCode::Any),
            _ => {}
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        let precedence = Self::rule(operator).precedence;
        self.parse_precedence(precedence.next());
        match operator {
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            TokenKind::Dot => self.emit_op(OpCode::DotProduct),
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::BangEqual => {
                self.emit_op(OpCode::Equal);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => {
                self.emit_op(OpCode::Less);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => {
                self.emit_op(OpCode::Greater);
                self.emit_op(OpCode::Not);
            }
            _ => {}
        }
    }

    fn and(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.lexeme;
        self.named_variable(name, can_assign);
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::False => self.emit_op(OpCode::False),
            _ => {}
        }
    }

    /// A bare number outside brackets: a one-element vector.
    fn number(&mut self, _can_assign: bool) {
        let text = self.previous.lexeme;
        let value = if is_integral(text) {
            text.parse().map(|v| Array::ints(vec![v])).map_err(|_| out_of_range(text))
        } else {
            text.parse()
                .map(|v| Array::floats(vec![v]))
                .map_err(|_| "Invalid number literal.".to_string())
        };
        match value {
            Ok(array) => self.emit_constant(array),
            Err(message) => self.error(&message),
        }
    }

    fn array_literal(&mut self, _can_assign: bool) {
        let mut builder = LiteralBuilder::new();
        match self.literal_level(&mut builder) {
            Some(shape) => {
                let array = builder.finish(&shape);
                self.emit_constant(array);
            }
            None => {
                // Skip the rest of the literal so parsing resumes after it.
                while builder.open > 0 && !self.check(TokenKind::Eof) {
                    match self.current.kind {
                        TokenKind::LeftBracket => builder.open += 1,
                        TokenKind::RightBracket => builder.open -= 1,
                        _ => {}
                    }
                    self.advance();
                }
            }
        }
    }

    /// Parse one bracket level whose `[` was just consumed. Returns the
    /// level's shape, or `None` after reporting an error.
    fn literal_level(&mut self, builder: &mut LiteralBuilder) -> Option<Vec<usize>> {
        let mut scalars = 0;
        let mut has_body = false;
        let mut children = 0;
        let mut child_shape: Option<Vec<usize>> = None;
        loop {
            match self.current.kind {
                TokenKind::RightBracket => {
                    self.advance();
                    builder.open -= 1;
                    break;
                }
                TokenKind::Comma => self.advance(),
                TokenKind::LeftBracket => {
                    self.advance();
                    builder.open += 1;
                    if has_body {
                        self.error("Cannot mix scalars and sub-arrays in one array literal.");
                        return None;
                    }
                    let shape = self.literal_level(builder)?;
                    match &child_shape {
                        Some(first) if *first != shape => {
                            self.error("Sub-arrays in a literal must all have the same shape.");
                            return None;
                        }
                        Some(_) => {}
                        None => child_shape = Some(shape),
                    }
                    children += 1;
                }
                TokenKind::ArrayBody => {
                    self.advance();
                    if children > 0 {
                        self.error("Cannot mix scalars and sub-arrays in one array literal.");
                        return None;
                    }
                    match builder.add_body(self.previous.lexeme) {
                        Ok(added) => scalars += added,
                        Err(message) => {
                            self.error(&message);
                            return None;
                        }
                    }
                    has_body = true;
                }
                TokenKind::Eof => {
                    self.error_at_current("Expect ']' after array literal.");
                    return None;
                }
                _ => {
                    self.error_at_current("Unexpected token in array literal.");
                    return None;
                }
            }
        }
        Some(match child_shape {
            Some(child) if !has_body => {
                let mut shape = vec![children];
                shape.extend(child);
                shape
            }
            _ => vec![scalars],
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    fn compile_ok(src: &str) -> Rc<Function> {
        let mut strings = Interner::new();
        compile(src, &mut strings).unwrap_or_else(|errors| panic!("compile failed: {errors:?}"))
    }

    fn compile_err(src: &str) -> Vec<CompileError> {
        let mut strings = Interner::new();
        compile(src, &mut strings).unwrap_err()
    }

    fn ops(function: &Function) -> Vec<OpCode> {
        let code = &function.chunk.code;
        let mut out = Vec::new();
        let mut offset = 0;
        while offset < code.len() {
            let op = OpCode::try_from(code[offset]).unwrap();
            out.push(op);
            offset += match op {
                OpCode::Constant
                | OpCode::GetLocal
                | OpCode::SetLocal
                | OpCode::GetGlobal
                | OpCode::DefineGlobal
                | OpCode::SetGlobal
                | OpCode::Call => 2,
                OpCode::Jump | OpCode::JumpIfFalse | OpCode::Loop => 3,
                _ => 1,
            };
        }
        out
    }

    fn first_constant(src: &str) -> Rc<Array> {
        Rc::clone(&compile_ok(src).chunk.constants[0])
    }

    #[test]
    fn print_literal() {
        let f = compile_ok("print [1,2,3];");
        assert_eq!(ops(&f), vec![OpCode::Constant, OpCode::Print, OpCode::Nil, OpCode::Return]);
        assert_eq!(f.chunk.constants[0].to_string(), "[1,2,3]");
    }

    #[test]
    fn literal_shapes_and_types() {
        let m = first_constant("[[1,2,3],[4,5,6]];");
        assert_eq!(m.dims(), &[2, 3]);
        assert_eq!(m.element_type(), ElementType::Int);

        let f = first_constant("[1 2.5 3];");
        assert_eq!(f.element_type(), ElementType::Float, "one fraction promotes the literal");
        assert_eq!(f.to_string(), "[1,2.5,3]");

        let c = first_constant("[[ab],[cd]];");
        assert_eq!(c.element_type(), ElementType::Char);
        assert_eq!(c.dims(), &[2, 2]);

        let e = first_constant("[];");
        assert_eq!(e.element_type(), ElementType::Unknown);
        assert_eq!(e.dims(), &[0]);
    }

    #[test]
    fn bare_numbers_are_one_element_vectors() {
        let n = first_constant("42;");
        assert_eq!(n.dims(), &[1]);
        assert_eq!(n.element_type(), ElementType::Int);
        assert_eq!(first_constant("0.5;").element_type(), ElementType::Float);
    }

    #[test]
    fn ragged_and_mixed_literals_are_rejected() {
        let errors = compile_err("print [[1,2],[3]];");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("same shape"), "{}", errors[0]);

        let errors = compile_err("print [1, [2]];");
        assert!(errors[0].message.contains("mix scalars"));

        let errors = compile_err("print [[ab],[12]];");
        assert!(errors[0].message.contains("characters and numbers"));
    }

    #[test]
    fn parsing_resumes_after_bad_literal() {
        let errors = compile_err("print [[1],[2,3]];\nprint (;");
        assert_eq!(errors.len(), 2, "{errors:?}");
        assert_eq!(errors[1].line, 2);
    }

    #[test]
    fn integer_overflow_is_rejected_in_and_out_of_brackets() {
        let bare = compile_err("print 99999999999999999999;");
        assert_eq!(bare[0].message, "Integer literal '99999999999999999999' is out of range.");
        let bracketed = compile_err("print [1 99999999999999999999];");
        assert_eq!(bracketed[0].message, bare[0].message);
        assert_eq!(first_constant("[-9223372036854775808];").element_type(), ElementType::Int);
        assert_eq!(first_constant("[1e30];").element_type(), ElementType::Float);
    }

    #[test]
    fn too_many_locals() {
        let decls: String = (0..256).map(|i| format!("var v{i} = 1; ")).collect();
        let errors = compile_err(&format!("{{ {decls}}}"));
        assert_eq!(errors.len(), 1, "{errors:?}");
        assert_eq!(errors[0].to_string(), "[line 1] Error at 'v255': Too many local variables in function.");

        let decls: String = (0..255).map(|i| format!("var v{i} = 1; ")).collect();
        compile_ok(&format!("{{ {decls}print v254; }}"));
    }

    #[test]
    fn negated_comparisons() {
        let f = compile_ok("1 <= 2;");
        assert_eq!(
            ops(&f),
            vec![OpCode::Constant, OpCode::Constant, OpCode::Greater, OpCode::Not, OpCode::Pop, OpCode::Nil, OpCode::Return]
        );
    }

    #[test]
    fn precedence_factor_over_term() {
        let f = compile_ok("1 + 2 * 3;");
        assert_eq!(
            ops(&f)[..5],
            [OpCode::Constant, OpCode::Constant, OpCode::Constant, OpCode::Multiply, OpCode::Add]
        );
    }

    #[test]
    fn lookup_is_right_associative() {
        let f = compile_ok("a @ b @ c;");
        assert_eq!(
            ops(&f)[..5],
            [OpCode::GetGlobal, OpCode::GetGlobal, OpCode::GetGlobal, OpCode::Lookup, OpCode::Lookup]
        );
    }

    #[test]
    fn global_names_share_one_constant() {
        let f = compile_ok("x = [1]; print x; print x;");
        let keys = f.chunk.constants.iter().filter(|c| c.as_key().is_some()).count();
        assert_eq!(keys, 1);
    }

    #[test]
    fn locals_use_slots() {
        let f = compile_ok("{ var a = 1; print a; }");
        assert_eq!(
            ops(&f),
            vec![OpCode::Constant, OpCode::GetLocal, OpCode::Print, OpCode::Pop, OpCode::Nil, OpCode::Return]
        );
        assert_eq!(f.chunk.code[3], 1, "slot 0 is reserved");
    }

    #[test]
    fn duplicate_local_in_same_scope() {
        let errors = compile_err("{ var a = 1; var a = 2; }");
        assert_eq!(errors[0].message, "Already a variable with this name in this scope.");
        assert_eq!(errors[0].kind, crate::dsl::error::ErrorKind::Compiler);
        // Shadowing in an inner scope is fine.
        compile_ok("{ var a = 1; { var a = 2; } }");
    }

    #[test]
    fn local_in_own_initializer() {
        let errors = compile_err("{ var a = a; }");
        assert_eq!(errors[0].message, "Can't read local variable in its own initializer.");
    }

    #[test]
    fn invalid_assignment_target() {
        let errors = compile_err("a + b = c;");
        assert_eq!(errors[0].message, "Invalid assignment target.");
    }

    #[test]
    fn top_level_return() {
        let errors = compile_err("return 1;");
        assert_eq!(errors[0].to_string(), "[line 1] Error at 'return': Can't return from top-level code.");
    }

    #[test]
    fn missing_semicolon_reports_location() {
        let errors = compile_err("print 1");
        assert_eq!(errors[0].to_string(), "[line 1] Error at end: Expect ';' after value.");
    }

    #[test]
    fn lexer_errors_surface() {
        let errors = compile_err("print $;");
        assert_eq!(errors[0].kind, crate::dsl::error::ErrorKind::Lexer);
        assert_eq!(errors[0].to_string(), "[line 1] Error: Unexpected character.");
    }

    #[test]
    fn synchronize_reports_independent_errors() {
        let errors = compile_err("var = 1;\nprint 2;\nvar ;\n");
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].line, 1);
        assert_eq!(errors[1].line, 3);
    }

    #[test]
    fn too_many_constants() {
        let src: String = (0..300).map(|i| format!("print {i};")).collect();
        let errors = compile_err(&src);
        assert_eq!(errors[0].message, "Too many constants in one chunk.");
    }

    #[test]
    fn functions_become_constants() {
        let f = compile_ok("fun add(a, b) { return a + b; } print add(1, 2);");
        let func = f.chunk.constants.iter().find_map(|c| c.as_function().cloned()).unwrap();
        assert_eq!(func.arity, 2);
        assert_eq!(func.to_string(), "<fn add>");
        assert_eq!(
            ops(&func),
            vec![OpCode::GetLocal, OpCode::GetLocal, OpCode::Add, OpCode::Return, OpCode::Nil, OpCode::Return]
        );
    }

    #[test]
    fn while_loop_jumps_back() {
        let f = compile_ok("while (false) print 1;");
        let listing = ops(&f);
        assert_eq!(listing[0], OpCode::False);
        assert_eq!(listing[1], OpCode::JumpIfFalse);
        assert!(listing.contains(&OpCode::Loop));
    }
}
