// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Single-pass compiler: lexing, recursive-descent parsing, and direct
//! bytecode emission.
//!
//! There is no separate AST pass. The parser writes opcodes into the
//! `Chunk`'s code array as it recognizes each construct; forward jumps
//! (`if`/`else`, `for`, the ternary, `break`/`continue`) record the
//! address of their placeholder operand and patch it once the jump
//! target is known.

pub mod lexer;
pub mod symbols;

#[cfg(test)]
mod compiler_test;

use crate::bytecode::{Chunk, FuncInfo, OpCode, StructInfo};
use crate::native;
use crate::types::{CodeAddr, Line};
use lexer::{LexError, Lexer, TokenKind, Token};
use symbols::{LoopStack, SymbolTables};
use std::fmt;

/// Resolves an `import "path"` to source text. Kept abstract so the
/// compiler itself performs no filesystem access; a hosted CLI supplies
/// a filesystem-backed implementation.
pub trait SourceLoader {
    fn load(&self, path: &str) -> Option<String>;
}

/// A `SourceLoader` that never resolves anything, for compiling
/// self-contained programs (including most tests).
pub struct NoImports;

impl SourceLoader for NoImports {
    fn load(&self, _path: &str) -> Option<String> {
        None
    }
}

/// A compile-time error, always attributable to a source line.
#[derive(Debug, Clone, PartialEq)]
pub enum CompileError {
    Lex(LexError),
    ExpectedToken { line: Line, expected: &'static str, found: String },
    UndefinedVariable { line: Line, name: String },
    UndefinedFunction { line: Line, name: String },
    UnknownStructType { line: Line, name: String },
    UnknownField { line: Line, struct_name: String, field: String },
    AccessOnUntyped { line: Line, field: String },
    AccessOnArray { line: Line, field: String },
    NativeArityMismatch { line: Line, name: String, expected: u8, found: u32 },
    BreakOutsideLoop { line: Line },
    ContinueOutsideLoop { line: Line },
    MapKeyMustBeString { line: Line },
    StructLiteralWithoutType { line: Line },
    CannotInferStructType { line: Line, field: String },
    ImportNotFound { line: Line, path: String },
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lex(e) => write!(f, "{e}"),
            Self::ExpectedToken { line, expected, found } => {
                write!(f, "[Line {line}] Error: Expected {expected}, got '{found}'")
            }
            Self::UndefinedVariable { line, name } => write!(f, "[Line {line}] Error: Undefined var '{name}'"),
            Self::UndefinedFunction { line, name } => write!(f, "[Line {line}] Error: Undefined function '{name}'"),
            Self::UnknownStructType { line, name } => write!(f, "[Line {line}] Error: Unknown struct type '{name}'"),
            Self::UnknownField { line, struct_name, field } => {
                write!(f, "[Line {line}] Error: Struct '{struct_name}' has no field '{field}'")
            }
            Self::AccessOnUntyped { line, field } => {
                write!(f, "[Line {line}] Error: Accessing member '{field}' of untyped var")
            }
            Self::AccessOnArray { line, field } => {
                write!(f, "[Line {line}] Error: Accessing member '{field}' on array")
            }
            Self::NativeArityMismatch { line, name, expected, found } => {
                write!(f, "[Line {line}] Error: StdLib function '{name}' expects {expected} args, got {found}")
            }
            Self::BreakOutsideLoop { line } => write!(f, "[Line {line}] Error: 'break' outside of loop"),
            Self::ContinueOutsideLoop { line } => write!(f, "[Line {line}] Error: 'continue' outside of loop"),
            Self::MapKeyMustBeString { line } => write!(f, "[Line {line}] Error: Map keys must be strings"),
            Self::StructLiteralWithoutType { line } => write!(f, "[Line {line}] Error: Struct literal without type"),
            Self::CannotInferStructType { line, field } => {
                write!(f, "[Line {line}] Error: Could not infer struct type from field '{field}'")
            }
            Self::ImportNotFound { line, path } => write!(f, "[Line {line}] Error: Cannot find import '{path}'"),
        }
    }
}

impl From<LexError> for CompileError {
    fn from(e: LexError) -> Self {
        Self::Lex(e)
    }
}

/// Compile a complete program (including any transitive imports) to a
/// bytecode `Chunk`.
///
/// # Errors
/// Returns the first `CompileError` encountered.
pub fn compile(source: &str, loader: &dyn SourceLoader) -> Result<Chunk, CompileError> {
    let mut compiler = Compiler::new(loader);
    compiler.parse_unit(source, false)?;
    Ok(compiler.chunk)
}

struct Compiler<'l> {
    lexer: Lexer,
    curr: Token,
    chunk: Chunk,
    symbols: SymbolTables,
    loops: LoopStack,
    inside_function: bool,
    search_paths: Vec<String>,
    loader: &'l dyn SourceLoader,
}

impl<'l> Compiler<'l> {
    fn new(loader: &'l dyn SourceLoader) -> Self {
        Self {
            lexer: Lexer::new(""),
            curr: Token { kind: TokenKind::Eof, text: String::new(), number: 0.0, line: 1 },
            chunk: Chunk::new(),
            symbols: SymbolTables::new(),
            loops: LoopStack::new(),
            inside_function: false,
            search_paths: Vec::new(),
            loader,
        }
    }

    fn line(&self) -> Line {
        self.curr.line
    }

    fn advance(&mut self) -> Result<(), CompileError> {
        self.curr = self.lexer.next_token()?;
        Ok(())
    }

    fn expect(&mut self, kind: TokenKind) -> Result<(), CompileError> {
        if self.curr.kind == kind {
            self.advance()
        } else {
            Err(CompileError::ExpectedToken {
                line: self.line(),
                expected: kind.describe(),
                found: self.curr.text.clone(),
            })
        }
    }

    fn expect_id(&mut self) -> Result<String, CompileError> {
        if self.curr.kind != TokenKind::Id {
            return Err(CompileError::ExpectedToken {
                line: self.line(),
                expected: TokenKind::Id.describe(),
                found: self.curr.text.clone(),
            });
        }
        let name = self.curr.text.clone();
        self.advance()?;
        Ok(name)
    }

    fn parse_namespaced_id(&mut self) -> Result<String, CompileError> {
        let mut name = self.expect_id()?;
        if self.curr.kind == TokenKind::Scope {
            self.advance()?;
            let sub = self.expect_id()?;
            name = format!("{name}_{sub}");
        }
        Ok(name)
    }

    fn emit(&mut self, op: OpCode, operands: &[f64]) -> CodeAddr {
        self.chunk.emit(op, operands, self.line())
    }

    fn patch_here(&mut self, operand_addr: CodeAddr) {
        let here = self.chunk.code_len() as f64;
        self.chunk.patch(operand_addr, here);
    }

    // --- variable resolution shared between statements and expressions ---

    /// Resolve a bare name used as an rvalue: local, namespace-mangled
    /// global, then bare global. Returns the static type (struct id,
    /// is_array) known for it, if any.
    fn emit_var_load(&mut self, name: &str) -> Result<(Option<u32>, bool), CompileError> {
        if let Some(loc) = self.symbols.find_local(name) {
            let local = self.symbols.locals[loc].clone_offset_info();
            self.emit(OpCode::Lvar, &[f64::from(local.0)]);
            return Ok((local.1, local.2));
        }
        let mangled = self.symbols.mangle(name);
        let idx = self
            .symbols
            .find_global(&mangled)
            .or_else(|| self.symbols.find_global(name))
            .ok_or_else(|| CompileError::UndefinedVariable { line: self.line(), name: name.to_owned() })?;
        let global = self.symbols.globals[idx].clone();
        self.emit(OpCode::Get, &[f64::from(global.slot)]);
        Ok((global.struct_id, global.is_array))
    }

    /// Resolve a name's storage for an assignment, emitting the matching
    /// store opcode for `SET`/`SVAR` family instructions via the caller.
    fn resolve_store_target(&mut self, name: &str) -> Result<(OpCode, u32), CompileError> {
        if let Some(loc) = self.symbols.find_local(name) {
            return Ok((OpCode::Svar, self.symbols.locals[loc].offset));
        }
        let mangled = self.symbols.mangle(name);
        let idx = self
            .symbols
            .find_global(&mangled)
            .or_else(|| self.symbols.find_global(name))
            .ok_or_else(|| CompileError::UndefinedVariable { line: self.line(), name: name.to_owned() })?;
        Ok((OpCode::Set, self.symbols.globals[idx].slot))
    }

    // --- expressions ---

    fn factor(&mut self) -> Result<(), CompileError> {
        match self.curr.kind {
            TokenKind::Num => {
                let idx = self.chunk.add_constant(self.curr.number);
                self.emit(OpCode::PshNum, &[f64::from(idx)]);
                self.advance()?;
            }
            TokenKind::Str => {
                let idx = self.chunk.add_string(&self.curr.text);
                self.emit(OpCode::PshStr, &[f64::from(idx)]);
                self.advance()?;
            }
            TokenKind::True => {
                let idx = self.chunk.add_constant(1.0);
                self.emit(OpCode::PshNum, &[f64::from(idx)]);
                self.advance()?;
            }
            TokenKind::False => {
                let idx = self.chunk.add_constant(0.0);
                self.emit(OpCode::PshNum, &[f64::from(idx)]);
                self.advance()?;
            }
            TokenKind::Minus => {
                self.advance()?;
                if self.curr.kind == TokenKind::Num {
                    let idx = self.chunk.add_constant(-self.curr.number);
                    self.emit(OpCode::PshNum, &[f64::from(idx)]);
                    self.advance()?;
                } else {
                    let zero = self.chunk.add_constant(0.0);
                    self.emit(OpCode::PshNum, &[f64::from(zero)]);
                    self.factor()?;
                    self.emit(OpCode::Sub, &[]);
                }
            }
            TokenKind::LBracket => self.array_literal()?,
            TokenKind::LBrace => self.ambiguous_brace_literal()?,
            TokenKind::FStr => self.interpolated_string()?,
            TokenKind::Id => self.identifier_factor()?,
            TokenKind::LParen => {
                self.advance()?;
                self.expression()?;
                self.expect(TokenKind::RParen)?;
            }
            _ => {
                return Err(CompileError::ExpectedToken {
                    line: self.line(),
                    expected: "an expression",
                    found: self.curr.text.clone(),
                });
            }
        }
        Ok(())
    }

    fn array_literal(&mut self) -> Result<(), CompileError> {
        self.advance()?; // [
        let mut count: u32 = 0;
        if self.curr.kind != TokenKind::RBracket {
            self.expression()?;
            count += 1;
            while self.curr.kind == TokenKind::Comma {
                self.advance()?;
                self.expression()?;
                count += 1;
            }
        }
        self.expect(TokenKind::RBracket)?;
        self.emit(OpCode::Arr, &[f64::from(count)]);
        Ok(())
    }

    /// `{` starts either a map literal (`{"k"=v,...}`) or a struct
    /// literal (`{field=v,...}`); disambiguate by a one-token lookahead
    /// without consuming anything.
    fn ambiguous_brace_literal(&mut self) -> Result<(), CompileError> {
        let mark = self.lexer.mark();
        let saved_tok = self.curr.clone();
        self.advance()?; // {
        let is_map = self.curr.kind == TokenKind::Str;
        self.lexer.reset_to(mark);
        self.curr = saved_tok;

        if is_map {
            self.parse_map_literal()
        } else {
            let mark2 = self.lexer.mark();
            let saved_tok2 = self.curr.clone();
            self.advance()?; // {
            let first_field = self.curr.text.clone();
            self.lexer.reset_to(mark2);
            self.curr = saved_tok2;
            match self.symbols.find_struct_with_field(&first_field) {
                Some(struct_id) => self.parse_struct_literal(struct_id),
                None => Err(CompileError::CannotInferStructType { line: self.line(), field: first_field }),
            }
        }
    }

    fn interpolated_string(&mut self) -> Result<(), CompileError> {
        let template = self.curr.text.clone();
        let line = self.line();
        let empty = self.chunk.add_string("");
        self.emit(OpCode::PshStr, &[f64::from(empty)]);

        let bytes = template.as_bytes();
        let mut i = 0usize;
        let mut seg_start = 0usize;
        while i < bytes.len() {
            if bytes[i] == b'{' {
                if i > seg_start {
                    let chunk_text = &template[seg_start..i];
                    let id = self.chunk.add_string(chunk_text);
                    self.emit(OpCode::PshStr, &[f64::from(id)]);
                    self.emit(OpCode::Cat, &[]);
                }
                i += 1;
                let expr_start = i;
                while i < bytes.len() && bytes[i] != b'}' {
                    i += 1;
                }
                let expr_code = &template[expr_start..i];
                self.compile_sub_expression(expr_code, line)?;
                self.emit(OpCode::Cat, &[]);
                if i < bytes.len() {
                    i += 1; // }
                }
                seg_start = i;
            } else {
                i += 1;
            }
        }
        if seg_start < bytes.len() {
            let chunk_text = &template[seg_start..];
            let id = self.chunk.add_string(chunk_text);
            self.emit(OpCode::PshStr, &[f64::from(id)]);
            self.emit(OpCode::Cat, &[]);
        }
        self.advance()?; // consume the FStr token
        Ok(())
    }

    /// Compile an embedded `{expr}` segment of an interpolated string:
    /// snapshot the outer lexer/token, lex and parse the segment as an
    /// independent source buffer, then restore the outer state.
    fn compile_sub_expression(&mut self, expr_code: &str, line: Line) -> Result<(), CompileError> {
        let outer_lexer = core::mem::replace(&mut self.lexer, Lexer::sub_lexer(expr_code, line));
        let outer_tok = core::mem::replace(&mut self.curr, Token { kind: TokenKind::Eof, text: String::new(), number: 0.0, line });
        self.advance()?;
        self.expression()?;
        self.lexer = outer_lexer;
        self.curr = outer_tok;
        Ok(())
    }

    fn identifier_factor(&mut self) -> Result<(), CompileError> {
        let name = self.parse_namespaced_id()?;

        if let Some(value) = self.symbols.find_enum_value(&name) {
            let idx = self.chunk.add_constant(value as f64);
            self.emit(OpCode::PshNum, &[f64::from(idx)]);
            return Ok(());
        }

        if self.curr.kind == TokenKind::LParen {
            self.call_expr(&name)?;
            return Ok(());
        }

        let (mut struct_id, mut is_array) = self.emit_var_load(&name)?;
        self.member_chain(&mut struct_id, &mut is_array, false)?;
        Ok(())
    }

    fn call_args(&mut self) -> Result<u32, CompileError> {
        self.advance()?; // (
        let mut count = 0u32;
        if self.curr.kind != TokenKind::RParen {
            self.expression()?;
            count += 1;
            while self.curr.kind == TokenKind::Comma {
                self.advance()?;
                self.expression()?;
                count += 1;
            }
        }
        self.expect(TokenKind::RParen)?;
        Ok(count)
    }

    fn call_expr(&mut self, name: &str) -> Result<(), CompileError> {
        let arg_count = self.call_args()?;
        if let Some(addr) = self.symbols.find_func(name) {
            self.emit(OpCode::Call, &[addr as f64, f64::from(arg_count)]);
            return Ok(());
        }
        if let Some((native_id, arity)) = native::lookup(name) {
            if u32::from(arity) != arg_count {
                return Err(CompileError::NativeArityMismatch {
                    line: self.line(),
                    name: name.to_owned(),
                    expected: arity,
                    found: arg_count,
                });
            }
            self.emit(OpCode::Native, &[native_id as f64]);
            return Ok(());
        }
        let mangled = self.symbols.mangle(name);
        if let Some(addr) = self.symbols.find_func(&mangled) {
            self.emit(OpCode::Call, &[addr as f64, f64::from(arg_count)]);
            return Ok(());
        }
        Err(CompileError::UndefinedFunction { line: self.line(), name: name.to_owned() })
    }

    /// Compile a trailing chain of `.field` and `[index]`/`[start:end]`
    /// accesses following a loaded value. `allow_assign` lets the
    /// statement-level caller detect a trailing `=` and emit a store
    /// instead of a load for the final access in the chain.
    fn member_chain(&mut self, struct_id: &mut Option<u32>, is_array: &mut bool, allow_assign: bool) -> Result<bool, CompileError> {
        while self.curr.kind == TokenKind::Dot || self.curr.kind == TokenKind::LBracket {
            if self.curr.kind == TokenKind::Dot {
                self.advance()?;
                let field = self.expect_id()?;
                let sid = struct_id.ok_or_else(|| CompileError::AccessOnUntyped { line: self.line(), field: field.clone() })?;
                if *is_array {
                    return Err(CompileError::AccessOnArray { line: self.line(), field });
                }
                let def = &self.symbols.structs[sid as usize];
                let offset = def
                    .field_offset(&field)
                    .ok_or_else(|| CompileError::UnknownField { line: self.line(), struct_name: def.name.clone(), field: field.clone() })?;

                if allow_assign && self.curr.kind == TokenKind::Assign {
                    self.advance()?;
                    self.expression()?;
                    self.emit(OpCode::Hset, &[f64::from(offset), f64::from(sid)]);
                    return Ok(true);
                }
                self.emit(OpCode::Hget, &[f64::from(offset), f64::from(sid)]);
                *struct_id = None;
            } else {
                self.advance()?;
                self.expression()?;
                if self.curr.kind == TokenKind::Colon {
                    self.advance()?;
                    self.expression()?;
                    self.expect(TokenKind::RBracket)?;
                    self.emit(OpCode::Slice, &[]);
                } else {
                    self.expect(TokenKind::RBracket)?;
                    if allow_assign && self.curr.kind == TokenKind::Assign {
                        self.advance()?;
                        self.expression()?;
                        self.emit(OpCode::Aset, &[]);
                        return Ok(true);
                    }
                    self.emit(OpCode::Aget, &[]);
                    if *is_array {
                        *is_array = false;
                    } else {
                        *struct_id = None;
                    }
                }
            }
        }
        Ok(false)
    }

    fn term(&mut self) -> Result<(), CompileError> {
        self.factor()?;
        loop {
            let op = match self.curr.kind {
                TokenKind::Mul => OpCode::Mul,
                TokenKind::Div => OpCode::Div,
                TokenKind::ModOp => OpCode::Mod,
                _ => break,
            };
            self.advance()?;
            self.factor()?;
            self.emit(op, &[]);
        }
        Ok(())
    }

    fn additive_expr(&mut self) -> Result<(), CompileError> {
        self.term()?;
        loop {
            let op = match self.curr.kind {
                TokenKind::Plus => OpCode::Add,
                TokenKind::Minus => OpCode::Sub,
                _ => break,
            };
            self.advance()?;
            self.term()?;
            self.emit(op, &[]);
        }
        Ok(())
    }

    fn relation_expr(&mut self) -> Result<(), CompileError> {
        self.additive_expr()?;
        loop {
            let op = match self.curr.kind {
                TokenKind::Lt => OpCode::Lt,
                TokenKind::Gt => OpCode::Gt,
                TokenKind::Le => OpCode::Le,
                TokenKind::Ge => OpCode::Ge,
                TokenKind::Eq => OpCode::Eq,
                TokenKind::Neq => OpCode::Neq,
                _ => break,
            };
            self.advance()?;
            self.additive_expr()?;
            self.emit(op, &[]);
        }
        Ok(())
    }

    fn expression(&mut self) -> Result<(), CompileError> {
        self.relation_expr()?;
        if self.curr.kind == TokenKind::Question {
            self.advance()?;
            let p1 = self.emit(OpCode::Jz, &[0.0]);
            self.expression()?;
            let p2 = self.emit(OpCode::Jmp, &[0.0]);
            self.patch_here(p1 + 1);
            self.expect(TokenKind::Else)?;
            self.expression()?;
            self.patch_here(p2 + 1);
        }
        Ok(())
    }

    // --- statements ---

    fn emit_get(&mut self, is_local: bool, addr: u32) {
        if is_local {
            self.emit(OpCode::Lvar, &[f64::from(addr)]);
        } else {
            self.emit(OpCode::Get, &[f64::from(addr)]);
        }
    }

    fn emit_set(&mut self, is_local: bool, addr: u32) {
        if is_local {
            self.emit(OpCode::Svar, &[f64::from(addr)]);
        } else {
            self.emit(OpCode::Set, &[f64::from(addr)]);
        }
    }

    /// Declares a compiler-introduced hidden local/global (`_end`, `_step`,
    /// `_arr`, `_idx`) and binds it to the value already sitting on top of
    /// the operand stack.
    ///
    /// For a local, the pushed value *is* the new slot: `alloc_var` assigns
    /// it the offset the value already occupies, exactly as `var_statement`
    /// relies on for ordinary `var` declarations (no store is emitted - a
    /// `SVAR` here would write one slot past the live stack top, since the
    /// slot doesn't exist as a frame slot until this value is already in
    /// it). For a global, `SET` still has to copy it into the newly
    /// assigned global slot.
    fn declare_hidden(&mut self, is_local: bool, name: &str, is_array: bool) -> u32 {
        let addr = self.symbols.alloc_var(is_local, name, None, is_array);
        if !is_local {
            self.emit(OpCode::Set, &[f64::from(addr)]);
        }
        addr
    }

    fn statement(&mut self) -> Result<(), CompileError> {
        match self.curr.kind {
            TokenKind::Print => self.print_statement(),
            TokenKind::Import => self.import_statement(),
            TokenKind::Mod => self.mod_statement(),
            TokenKind::Break => {
                let line = self.line();
                self.advance()?;
                if self.loops.is_empty() {
                    return Err(CompileError::BreakOutsideLoop { line });
                }
                let p = self.emit(OpCode::Jmp, &[0.0]);
                self.loops.record_break(p + 1);
                Ok(())
            }
            TokenKind::Continue => {
                let line = self.line();
                self.advance()?;
                if self.loops.is_empty() {
                    return Err(CompileError::ContinueOutsideLoop { line });
                }
                let p = self.emit(OpCode::Jmp, &[0.0]);
                self.loops.record_continue(p + 1);
                Ok(())
            }
            TokenKind::Enum => self.enum_decl(),
            TokenKind::ModulePath => self.module_path_statement(),
            TokenKind::Var => self.var_statement(),
            TokenKind::For => self.for_statement(),
            TokenKind::Id => self.id_statement(),
            TokenKind::Struct => self.struct_decl(),
            TokenKind::If => self.if_statement(),
            TokenKind::Ret => self.ret_statement(),
            TokenKind::Eof => Ok(()),
            _ => self.advance(),
        }
    }

    fn print_statement(&mut self) -> Result<(), CompileError> {
        self.advance()?; // print
        self.expect(TokenKind::LParen)?;
        if self.curr.kind == TokenKind::Str {
            let id = self.chunk.add_string(&self.curr.text);
            self.emit(OpCode::PshStr, &[f64::from(id)]);
            self.advance()?;
        } else {
            self.expression()?;
        }
        self.expect(TokenKind::RParen)?;
        self.emit(OpCode::Prn, &[]);
        Ok(())
    }

    fn import_statement(&mut self) -> Result<(), CompileError> {
        let line = self.line();
        self.advance()?; // import
        let path = self.curr.text.clone();
        self.expect(TokenKind::Str)?;

        let mut source = self.loader.load(&path);
        if source.is_none() {
            for base in &self.search_paths.clone() {
                source = self.loader.load(&format!("{base}/{path}"));
                if source.is_some() {
                    break;
                }
            }
        }
        let source = source.ok_or(CompileError::ImportNotFound { line, path })?;
        self.parse_unit(&source, true)
    }

    /// Parse a complete unit (the top-level program, or an imported
    /// file) by swapping in a fresh lexer, running statements/functions
    /// to end of input, then restoring the caller's lexer position.
    /// Imported units never emit their own `HLT`; only the outermost
    /// call does.
    fn parse_unit(&mut self, source: &str, is_import: bool) -> Result<(), CompileError> {
        let outer_lexer = core::mem::replace(&mut self.lexer, Lexer::new(source));
        let outer_tok = core::mem::replace(&mut self.curr, Token { kind: TokenKind::Eof, text: String::new(), number: 0.0, line: 1 });
        self.advance()?;
        while self.curr.kind != TokenKind::Eof {
            if self.curr.kind == TokenKind::Fn {
                self.function()?;
            } else {
                self.statement()?;
            }
        }
        if !is_import {
            self.emit(OpCode::Hlt, &[]);
        }
        self.lexer = outer_lexer;
        self.curr = outer_tok;
        Ok(())
    }

    fn mod_statement(&mut self) -> Result<(), CompileError> {
        self.advance()?; // mod
        let name = self.expect_id()?;
        self.expect(TokenKind::LBrace)?;
        let previous = self.symbols.enter_namespace(&name);
        while self.curr.kind != TokenKind::RBrace && self.curr.kind != TokenKind::Eof {
            if self.curr.kind == TokenKind::Fn {
                self.function()?;
            } else {
                self.statement()?;
            }
        }
        self.expect(TokenKind::RBrace)?;
        self.symbols.exit_namespace(previous);
        Ok(())
    }

    fn module_path_statement(&mut self) -> Result<(), CompileError> {
        self.advance()?; // module_path
        self.expect(TokenKind::LParen)?;
        let path = self.curr.text.clone();
        self.expect(TokenKind::Str)?;
        self.expect(TokenKind::RParen)?;
        self.search_paths.push(path);
        Ok(())
    }

    fn enum_decl(&mut self) -> Result<(), CompileError> {
        self.advance()?; // enum
        let enum_name = self.expect_id()?;
        self.expect(TokenKind::LBrace)?;
        let mut value: i64 = 0;
        while self.curr.kind != TokenKind::RBrace && self.curr.kind != TokenKind::Eof {
            let member = self.curr.text.clone();
            self.expect(TokenKind::Id)?;
            self.symbols.enums.push(symbols::EnumEntry { name: format!("{enum_name}_{member}"), value });
            value += 1;
            if self.curr.kind == TokenKind::Comma {
                self.advance()?;
            }
        }
        self.expect(TokenKind::RBrace)?;
        Ok(())
    }

    fn struct_decl(&mut self) -> Result<(), CompileError> {
        self.advance()?; // struct
        let name = self.parse_namespaced_id()?;
        let mangled = self.symbols.mangle(&name);
        self.expect(TokenKind::LBrace)?;
        let mut fields = Vec::new();
        while self.curr.kind == TokenKind::Var {
            self.advance()?;
            fields.push(self.expect_id()?);
        }
        self.expect(TokenKind::RBrace)?;
        self.symbols.structs.push(symbols::StructSymbol { name: mangled.clone(), fields: fields.clone() });
        self.chunk.structs.push(StructInfo { name: mangled, fields });
        Ok(())
    }

    /// `HSET`, like `ASET`, consumes both its reference and value operands
    /// and pushes the value back (see `parse_map_literal`'s identical
    /// `Dup ... Aset ... Pop` shape) - so chaining several field
    /// assignments against the one allocated ref needs a `Dup` before each
    /// `Hset` and a `Pop` after, to leave the ref (not the written value)
    /// on the stack for the next field.
    fn parse_struct_literal(&mut self, struct_id: u32) -> Result<(), CompileError> {
        self.advance()?; // {
        let field_count = self.symbols.structs[struct_id as usize].fields.len();
        self.emit(OpCode::Alloc, &[field_count as f64, f64::from(struct_id)]);
        while self.curr.kind != TokenKind::RBrace && self.curr.kind != TokenKind::Eof {
            let field_name = self.expect_id()?;
            let offset = self.symbols.structs[struct_id as usize]
                .field_offset(&field_name)
                .ok_or_else(|| CompileError::UnknownField {
                    line: self.line(),
                    struct_name: self.symbols.structs[struct_id as usize].name.clone(),
                    field: field_name.clone(),
                })?;
            if self.curr.kind == TokenKind::Colon {
                self.advance()?;
            } else {
                self.expect(TokenKind::Assign)?;
            }
            self.emit(OpCode::Dup, &[]);
            self.expression()?;
            self.emit(OpCode::Hset, &[f64::from(offset), f64::from(struct_id)]);
            self.emit(OpCode::Pop, &[]);
            if self.curr.kind == TokenKind::Comma {
                self.advance()?;
            }
        }
        self.expect(TokenKind::RBrace)?;
        Ok(())
    }

    fn parse_map_literal(&mut self) -> Result<(), CompileError> {
        self.advance()?; // {
        self.emit(OpCode::Map, &[]);
        while self.curr.kind != TokenKind::RBrace && self.curr.kind != TokenKind::Eof {
            self.emit(OpCode::Dup, &[]);
            if self.curr.kind != TokenKind::Str {
                return Err(CompileError::MapKeyMustBeString { line: self.line() });
            }
            let id = self.chunk.add_string(&self.curr.text);
            self.emit(OpCode::PshStr, &[f64::from(id)]);
            self.advance()?;
            self.expect(TokenKind::Assign)?;
            self.expression()?;
            self.emit(OpCode::Aset, &[]);
            self.emit(OpCode::Pop, &[]);
            if self.curr.kind == TokenKind::Comma {
                self.advance()?;
            }
        }
        self.expect(TokenKind::RBrace)?;
        Ok(())
    }

    fn var_statement(&mut self) -> Result<(), CompileError> {
        self.advance()?; // var
        let name = self.expect_id()?;
        let mut struct_id: Option<u32> = None;
        let mut is_array = false;
        if self.curr.kind == TokenKind::Colon {
            self.advance()?;
            let type_name = self.parse_namespaced_id()?;
            if self.curr.kind == TokenKind::LBracket {
                self.advance()?;
                self.expect(TokenKind::RBracket)?;
                is_array = true;
            }
            struct_id = self
                .symbols
                .find_struct(&type_name)
                .or_else(|| self.symbols.find_struct(&self.symbols.mangle(&type_name)));
        }
        self.expect(TokenKind::Assign)?;

        if let Some(sid) = struct_id {
            if self.curr.kind == TokenKind::LBracket {
                self.advance()?;
                let mut count = 0u32;
                if self.curr.kind != TokenKind::RBracket {
                    loop {
                        self.parse_struct_literal(sid)?;
                        count += 1;
                        if self.curr.kind == TokenKind::Comma {
                            self.advance()?;
                        }
                        if self.curr.kind == TokenKind::RBracket || self.curr.kind == TokenKind::Eof {
                            break;
                        }
                    }
                }
                self.expect(TokenKind::RBracket)?;
                self.emit(OpCode::Arr, &[f64::from(count)]);
                is_array = true;
            } else if self.curr.kind == TokenKind::LBrace {
                self.parse_struct_literal(sid)?;
            } else {
                self.expression()?;
            }
        } else if self.curr.kind == TokenKind::LBrace {
            let mark = self.lexer.mark();
            let saved_tok = self.curr.clone();
            self.advance()?; // {
            let is_map = self.curr.kind == TokenKind::Str;
            self.lexer.reset_to(mark);
            self.curr = saved_tok;
            if is_map {
                self.parse_map_literal()?;
            } else {
                return Err(CompileError::StructLiteralWithoutType { line: self.line() });
            }
        } else {
            self.expression()?;
        }

        let slot = self.symbols.alloc_var(self.inside_function, &name, struct_id, is_array);
        if !self.inside_function {
            self.emit(OpCode::Set, &[f64::from(slot)]);
        }
        Ok(())
    }

    fn id_statement(&mut self) -> Result<(), CompileError> {
        let name = self.parse_namespaced_id()?;

        if self.curr.kind == TokenKind::Assign {
            self.advance()?;
            self.expression()?;
            let (op, addr) = self.resolve_store_target(&name)?;
            self.emit(op, &[f64::from(addr)]);
            return Ok(());
        }

        if self.curr.kind == TokenKind::LParen {
            self.call_expr(&name)?;
            self.emit(OpCode::Pop, &[]);
            return Ok(());
        }

        if self.curr.kind == TokenKind::Dot || self.curr.kind == TokenKind::LBracket {
            let (mut struct_id, mut is_array) = self.emit_var_load(&name)?;
            // Every path through `member_chain` - a trailing read (HGET/AGET
            // push one value) or a trailing assignment (HSET/ASET consume
            // their ref and push the written value back) - leaves exactly
            // one value on the stack that a bare statement must discard.
            self.member_chain(&mut struct_id, &mut is_array, true)?;
            self.emit(OpCode::Pop, &[]);
            return Ok(());
        }

        Ok(())
    }

    fn if_statement(&mut self) -> Result<(), CompileError> {
        self.advance()?; // if
        self.expression()?;
        let p1 = self.emit(OpCode::Jz, &[0.0]);
        self.expect(TokenKind::LBrace)?;
        while self.curr.kind != TokenKind::RBrace {
            self.statement()?;
        }
        self.expect(TokenKind::RBrace)?;
        if self.curr.kind == TokenKind::Else {
            let p2 = self.emit(OpCode::Jmp, &[0.0]);
            self.patch_here(p1 + 1);
            self.advance()?; // else
            self.expect(TokenKind::LBrace)?;
            while self.curr.kind != TokenKind::RBrace {
                self.statement()?;
            }
            self.expect(TokenKind::RBrace)?;
            self.patch_here(p2 + 1);
        } else {
            self.patch_here(p1 + 1);
        }
        Ok(())
    }

    fn ret_statement(&mut self) -> Result<(), CompileError> {
        self.advance()?; // ret
        if self.curr.kind == TokenKind::RBrace {
            let idx = self.chunk.add_constant(0.0);
            self.emit(OpCode::PshNum, &[f64::from(idx)]);
        } else {
            self.expression()?;
        }
        self.emit(OpCode::Ret, &[]);
        Ok(())
    }

    fn function(&mut self) -> Result<(), CompileError> {
        self.advance()?; // fn
        let name = self.expect_id()?;
        let skip = self.emit(OpCode::Jmp, &[0.0]);

        let mangled = self.symbols.mangle(&name);
        let entry = self.chunk.code_len();
        self.symbols.funcs.push(symbols::FuncSymbol { name: mangled.clone(), addr: entry });
        self.chunk.functions.push(FuncInfo { name: mangled, addr: entry });

        let outer_inside_fn = self.inside_function;
        let outer_locals = self.symbols.enter_function();
        self.inside_function = true;

        self.expect(TokenKind::LParen)?;
        while self.curr.kind != TokenKind::RParen {
            let arg_name = self.expect_id()?;
            let mut arg_struct_id = None;
            let mut arg_is_array = false;
            if self.curr.kind == TokenKind::Colon {
                self.advance()?;
                let type_name = self.parse_namespaced_id()?;
                if self.curr.kind == TokenKind::LBracket {
                    self.advance()?;
                    self.expect(TokenKind::RBracket)?;
                    arg_is_array = true;
                }
                arg_struct_id = self.symbols.find_struct(&type_name);
            }
            self.symbols.alloc_var(true, &arg_name, arg_struct_id, arg_is_array);
            if self.curr.kind == TokenKind::Comma {
                self.advance()?;
            }
        }
        self.expect(TokenKind::RParen)?;

        self.expect(TokenKind::LBrace)?;
        while self.curr.kind != TokenKind::RBrace {
            self.statement()?;
        }
        self.expect(TokenKind::RBrace)?;

        let zero = self.chunk.add_constant(0.0);
        self.emit(OpCode::PshNum, &[f64::from(zero)]);
        self.emit(OpCode::Ret, &[]);
        self.patch_here(skip + 1);

        self.inside_function = outer_inside_fn;
        self.symbols.exit_function(outer_locals);
        Ok(())
    }

    // --- for loops ---

    fn for_statement(&mut self) -> Result<(), CompileError> {
        self.advance()?; // for
        self.expect(TokenKind::LParen)?;

        let mut name = String::new();
        let mut is_iter = false;
        let mut explicit_type: Option<u32> = None;

        if self.curr.kind == TokenKind::Var {
            self.advance()?;
            name = self.expect_id()?;
            if self.curr.kind == TokenKind::Colon {
                self.advance()?;
                let tn = self.parse_namespaced_id()?;
                explicit_type = self.symbols.find_struct(&tn);
            }
            is_iter = true;
        } else if self.curr.kind == TokenKind::Id {
            let mark = self.lexer.mark();
            let saved_tok = self.curr.clone();
            let temp_name = self.curr.text.clone();
            self.advance()?;
            let mut explicit_type_lookahead = None;
            if self.curr.kind == TokenKind::Colon {
                self.advance()?;
                let tn = self.parse_namespaced_id()?;
                explicit_type_lookahead = self.symbols.find_struct(&tn);
            }
            if self.curr.kind == TokenKind::In {
                is_iter = true;
                name = temp_name;
                explicit_type = explicit_type_lookahead;
            } else {
                self.lexer.reset_to(mark);
                self.curr = saved_tok;
            }
        }

        if is_iter {
            self.for_iter_statement(name, explicit_type)
        } else {
            self.for_conditional_statement()
        }
    }

    fn for_conditional_statement(&mut self) -> Result<(), CompileError> {
        let loop_start = self.chunk.code_len();
        self.expression()?;
        self.expect(TokenKind::RParen)?;
        let exit = self.emit(OpCode::Jz, &[0.0]);
        self.expect(TokenKind::LBrace)?;
        while self.curr.kind != TokenKind::RBrace && self.curr.kind != TokenKind::Eof {
            self.statement()?;
        }
        self.expect(TokenKind::RBrace)?;
        self.emit(OpCode::Jmp, &[loop_start as f64]);
        self.patch_here(exit + 1);
        Ok(())
    }

    fn for_iter_statement(&mut self, name: String, explicit_type: Option<u32>) -> Result<(), CompileError> {
        self.loops.push();
        let is_local = self.inside_function;

        let (var_addr, created) = if is_local {
            if let Some(loc) = self.symbols.find_local(&name) {
                (self.symbols.locals[loc].offset, false)
            } else {
                (self.symbols.alloc_var(true, &name, explicit_type, false), true)
            }
        } else {
            let mangled = self.symbols.mangle(&name);
            if let Some(idx) = self.symbols.find_global(&mangled) {
                (self.symbols.globals[idx].slot, false)
            } else {
                (self.symbols.alloc_var(false, &name, explicit_type, false), false)
            }
        };
        if created {
            let zero = self.chunk.add_constant(0.0);
            self.emit(OpCode::PshNum, &[f64::from(zero)]);
        }

        self.expect(TokenKind::In)?;
        self.expression()?;

        if self.curr.kind == TokenKind::Range {
            self.range_for_body(is_local, var_addr)
        } else {
            self.collection_for_body(is_local, var_addr, name)
        }
    }

    /// Compiles `for (var i = lo ... hi) { ... }`. Unlike the literal-only
    /// form this was first written against, `hi` is a full expression
    /// (SPEC_FULL.md's one deliberate generalization over the distilled
    /// spec): it is evaluated once into a hidden `_end` slot so the loop
    /// condition and step direction can re-read it on every iteration
    /// without re-evaluating side effects.
    #[expect(clippy::too_many_lines, reason = "mirrors one contiguous backpatch sequence in the source")]
    fn range_for_body(&mut self, is_local: bool, var_addr: u32) -> Result<(), CompileError> {
        self.emit_set(is_local, var_addr);
        self.advance()?; // ...
        self.expression()?;
        let end_addr = self.declare_hidden(is_local, "_end", false);

        // step = var < end ? 1 : (var > end ? -1 : 0)
        self.emit_get(is_local, var_addr);
        self.emit_get(is_local, end_addr);
        self.emit(OpCode::Lt, &[]);
        let p1 = self.emit(OpCode::Jz, &[0.0]);
        let one = self.chunk.add_constant(1.0);
        self.emit(OpCode::PshNum, &[f64::from(one)]);
        let p2 = self.emit(OpCode::Jmp, &[0.0]);
        self.patch_here(p1 + 1);

        self.emit_get(is_local, var_addr);
        self.emit_get(is_local, end_addr);
        self.emit(OpCode::Gt, &[]);
        let p3 = self.emit(OpCode::Jz, &[0.0]);
        let neg_one = self.chunk.add_constant(-1.0);
        self.emit(OpCode::PshNum, &[f64::from(neg_one)]);
        let p4 = self.emit(OpCode::Jmp, &[0.0]);
        self.patch_here(p3 + 1);
        let zero = self.chunk.add_constant(0.0);
        self.emit(OpCode::PshNum, &[f64::from(zero)]);
        self.patch_here(p2 + 1);
        self.patch_here(p4 + 1);
        let step_addr = self.declare_hidden(is_local, "_step", false);

        let loop_start = self.chunk.code_len();
        self.expect(TokenKind::RParen)?;
        self.expect(TokenKind::LBrace)?;
        while self.curr.kind != TokenKind::RBrace && self.curr.kind != TokenKind::Eof {
            self.statement()?;
        }
        self.expect(TokenKind::RBrace)?;

        let continue_dest = self.chunk.code_len();
        self.emit_get(is_local, var_addr);
        self.emit_get(is_local, step_addr);
        self.emit(OpCode::Add, &[]);
        self.emit_set(is_local, var_addr);
        // Loop while var != end+step, not var != end: the endpoint itself
        // is a valid iteration (spec §4.4, scenario 3: `0...5` visits 5).
        self.emit_get(is_local, end_addr);
        self.emit_get(is_local, step_addr);
        self.emit(OpCode::Add, &[]);
        self.emit_get(is_local, var_addr);
        self.emit(OpCode::Sub, &[]);
        self.emit(OpCode::Jnz, &[loop_start as f64]);

        let break_dest = self.chunk.code_len();
        let (breaks, continues) = self.loops.pop();
        for addr in breaks {
            self.chunk.patch(addr, break_dest as f64);
        }
        for addr in continues {
            self.chunk.patch(addr, continue_dest as f64);
        }
        Ok(())
    }

    fn collection_for_body(&mut self, is_local: bool, var_addr: u32, _name: String) -> Result<(), CompileError> {
        let coll_addr = self.declare_hidden(is_local, "_arr", true);
        let zero = self.chunk.add_constant(0.0);
        self.emit(OpCode::PshNum, &[f64::from(zero)]);
        let idx_addr = self.declare_hidden(is_local, "_idx", false);

        let loop_start = self.chunk.code_len();
        self.emit_get(is_local, idx_addr);
        self.emit_get(is_local, coll_addr);
        self.emit(OpCode::Alen, &[]);
        self.emit(OpCode::Lt, &[]);
        let exit = self.emit(OpCode::Jz, &[0.0]);
        self.emit_get(is_local, coll_addr);
        self.emit_get(is_local, idx_addr);
        self.emit(OpCode::Aget, &[]);
        self.emit_set(is_local, var_addr);

        self.expect(TokenKind::RParen)?;
        self.expect(TokenKind::LBrace)?;
        while self.curr.kind != TokenKind::RBrace && self.curr.kind != TokenKind::Eof {
            self.statement()?;
        }
        self.expect(TokenKind::RBrace)?;

        let continue_dest = self.chunk.code_len();
        self.emit_get(is_local, idx_addr);
        let one = self.chunk.add_constant(1.0);
        self.emit(OpCode::PshNum, &[f64::from(one)]);
        self.emit(OpCode::Add, &[]);
        self.emit_set(is_local, idx_addr);
        self.emit(OpCode::Jmp, &[loop_start as f64]);
        self.patch_here(exit + 1);

        let break_dest = self.chunk.code_len();
        let (breaks, continues) = self.loops.pop();
        for addr in breaks {
            self.chunk.patch(addr, break_dest as f64);
        }
        for addr in continues {
            self.chunk.patch(addr, continue_dest as f64);
        }
        Ok(())
    }
}
