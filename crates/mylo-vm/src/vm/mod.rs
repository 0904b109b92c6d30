// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! The stack-based bytecode executor.
//!
//! A single dispatch loop fetches the opcode at `ip`, mutates the operand
//! stack, `fp`, and `ip` accordingly, and either falls through to the next
//! instruction or jumps. There is no separate decode pass: `Chunk::code` is
//! read directly cell by cell.

#[cfg(test)]
mod vm_test;

use crate::bytecode::{Chunk, OpCode};
use crate::format::format_value;
use crate::heap::{Heap, HeapError, HeapKind};
use crate::native::{self, NativeCtx, NativeError};
use crate::types::{CodeAddr, HeapAddr, Line, StrId};
use crate::value::Value;
use std::fmt;
use tracing::{debug, trace};

/// A runtime error, always attributable to the source line active when it
/// was raised (via the chunk's parallel `lines` table).
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeError {
    StackUnderflow { line: Line, op: &'static str },
    StackOverflow { line: Line },
    DivisionByZero { line: Line },
    ModuloByZero { line: Line },
    TypeMismatch { line: Line, op: &'static str, found: &'static str },
    IndexOutOfBounds { line: Line },
    WrongStructId { line: Line, expected: u32, found: Option<u32> },
    NotAnObject { line: Line },
    NotAMap { line: Line },
    MapKeyMustBeString { line: Line },
    UnknownNative { line: Line, id: u8 },
    Native { line: Line, detail: String },
    Reserved { line: Line, opcode: &'static str },
    InvalidOpcode { line: Line, byte: u8 },
    CodeOutOfBounds { line: Line },
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StackUnderflow { line, op } => write!(f, "[Line {line}] Runtime Error: Stack underflow in '{op}'"),
            Self::StackOverflow { line } => write!(f, "[Line {line}] Runtime Error: Stack overflow"),
            Self::DivisionByZero { line } => write!(f, "[Line {line}] Runtime Error: Division by zero"),
            Self::ModuloByZero { line } => write!(f, "[Line {line}] Runtime Error: Modulo by zero"),
            Self::TypeMismatch { line, op, found } => {
                write!(f, "[Line {line}] Runtime Error: '{op}' cannot operate on a {found}")
            }
            Self::IndexOutOfBounds { line } => write!(f, "[Line {line}] Runtime Error: Index out of bounds"),
            Self::WrongStructId { line, expected, found: Some(found) } => {
                write!(f, "[Line {line}] Runtime Error: Expected struct id {expected}, found {found}")
            }
            Self::WrongStructId { line, expected, found: None } => {
                write!(f, "[Line {line}] Runtime Error: Expected struct id {expected}, found a non-struct value")
            }
            Self::NotAnObject { line } => write!(f, "[Line {line}] Runtime Error: Value is not a heap object"),
            Self::NotAMap { line } => write!(f, "[Line {line}] Runtime Error: Value is not a map"),
            Self::MapKeyMustBeString { line } => write!(f, "[Line {line}] Runtime Error: Map keys must be strings"),
            Self::UnknownNative { line, id } => write!(f, "[Line {line}] Runtime Error: Unknown native id {id}"),
            Self::Native { line, detail } => write!(f, "[Line {line}] Runtime Error: {detail}"),
            Self::Reserved { line, opcode } => write!(f, "[Line {line}] Runtime Error: Reserved opcode '{opcode}' has no defined behavior"),
            Self::InvalidOpcode { line, byte } => write!(f, "[Line {line}] Runtime Error: Invalid opcode byte {byte}"),
            Self::CodeOutOfBounds { line } => write!(f, "[Line {line}] Runtime Error: Instruction pointer ran off the end of the code"),
        }
    }
}

impl RuntimeError {
    fn heap(e: HeapError, line: Line) -> Self {
        match e {
            HeapError::NotAnObject => Self::NotAnObject { line },
            HeapError::IndexOutOfBounds => Self::IndexOutOfBounds { line },
            HeapError::WrongStructId { expected, found } => Self::WrongStructId { line, expected, found },
            HeapError::NotAnArrayOrBytes => Self::TypeMismatch { line, op: "heap access", found: "non-array/bytes value" },
            HeapError::NotAMap => Self::NotAMap { line },
            HeapError::MapKeyMustBeString => Self::MapKeyMustBeString { line },
        }
    }

    fn native(e: NativeError, line: Line) -> Self {
        Self::Native { line, detail: e.to_string() }
    }
}

/// Where `PRN` writes its output. Tests and embedders that want to assert
/// on stdout without spawning a subprocess use `Captured`.
enum Output {
    Stdout,
    Captured(String),
}

/// The VM: owns the bytecode image, the heap, the operand stack, and the
/// runtime string pool (a superset of the chunk's compiled strings, since
/// natives can intern new ones at runtime).
pub struct Vm {
    chunk: Chunk,
    heap: Heap,
    strings: Vec<String>,
    globals: Vec<Value>,
    stack: Vec<Value>,
    ip: CodeAddr,
    fp: usize,
    trace: bool,
    output: Output,
}

/// Operand-stack depth beyond which the VM treats further growth as a
/// runaway program (unbounded recursion with no base case) rather than
/// legitimate work.
const MAX_STACK_DEPTH: usize = 1 << 20;

impl Vm {
    #[must_use]
    pub fn new(chunk: Chunk) -> Self {
        let strings = chunk.strings.clone();
        Self {
            chunk,
            heap: Heap::new(),
            strings,
            globals: Vec::new(),
            stack: Vec::new(),
            ip: 0,
            fp: 0,
            trace: false,
            output: Output::Stdout,
        }
    }

    /// Build a VM whose `PRN` output is captured into a string instead of
    /// written to stdout, for subprocess-free end-to-end assertions.
    #[must_use]
    pub fn with_captured_output(chunk: Chunk) -> Self {
        let mut vm = Self::new(chunk);
        vm.output = Output::Captured(String::new());
        vm
    }

    /// Enable per-instruction `trace!` logging (the CLI's `--trace` flag).
    pub fn set_trace(&mut self, trace: bool) {
        self.trace = trace;
    }

    /// The text written so far by `PRN`, if this VM was built with
    /// [`Vm::with_captured_output`]; empty otherwise.
    #[must_use]
    pub fn captured_output(&self) -> &str {
        match &self.output {
            Output::Captured(s) => s,
            Output::Stdout => "",
        }
    }

    fn line(&self) -> Line {
        self.chunk.line_at(self.ip)
    }

    fn push(&mut self, v: Value) -> Result<(), RuntimeError> {
        if self.stack.len() >= MAX_STACK_DEPTH {
            return Err(RuntimeError::StackOverflow { line: self.line() });
        }
        self.stack.push(v);
        Ok(())
    }

    fn pop(&mut self, op: &'static str) -> Result<Value, RuntimeError> {
        self.stack.pop().ok_or(RuntimeError::StackUnderflow { line: self.line(), op })
    }

    fn pop_number(&mut self, op: &'static str) -> Result<f64, RuntimeError> {
        let v = self.pop(op)?;
        v.as_number().ok_or(RuntimeError::TypeMismatch { line: self.line(), op, found: v.type_name() })
    }

    fn global_slot(&mut self, slot: usize) -> &mut Value {
        if slot >= self.globals.len() {
            self.globals.resize(slot + 1, Value::number(0.0));
        }
        &mut self.globals[slot]
    }

    fn operand(&self, n: usize) -> f64 {
        self.chunk.code[self.ip + 1 + n]
    }

    fn operand_u32(&self, n: usize) -> u32 {
        self.operand(n) as u32
    }

    fn print(&mut self, text: &str) {
        match &mut self.output {
            Output::Stdout => print!("{text}"),
            Output::Captured(buf) => buf.push_str(text),
        }
    }

    /// Run the loaded chunk to completion (`HLT`).
    ///
    /// # Errors
    /// Returns the first `RuntimeError` encountered.
    pub fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            let Some(&raw_op) = self.chunk.code.get(self.ip) else {
                return Err(RuntimeError::CodeOutOfBounds { line: self.line() });
            };
            let Some(op) = OpCode::from_u8(raw_op as u8) else {
                return Err(RuntimeError::InvalidOpcode { line: self.line(), byte: raw_op as u8 });
            };

            if self.trace {
                trace!(ip = self.ip, op = op.name(), sp = self.stack.len(), "exec");
            }

            if self.step(op)? {
                return Ok(());
            }
        }
    }

    /// Execute one instruction. Returns `Ok(true)` on `HLT`.
    #[expect(clippy::too_many_lines, reason = "one dispatch arm per opcode, mirrors the instruction table directly")]
    fn step(&mut self, op: OpCode) -> Result<bool, RuntimeError> {
        let line = self.line();
        let mut advance_by = 1 + op.operand_count();

        match op {
            OpCode::PshNum => {
                let idx = self.operand_u32(0) as usize;
                let n = self.chunk.constants.get(idx).copied().unwrap_or(0.0);
                self.push(Value::number(n))?;
            }
            OpCode::PshStr => {
                let idx = self.operand_u32(0);
                self.push(Value::string(StrId(idx)))?;
            }
            OpCode::Add => {
                let b = self.pop("ADD")?;
                let a = self.pop("ADD")?;
                let result = self.add(a, b, line)?;
                self.push(result)?;
            }
            OpCode::Sub => {
                let b = self.pop_number("SUB")?;
                let a = self.pop_number("SUB")?;
                self.push(Value::number(a - b))?;
            }
            OpCode::Mul => {
                let b = self.pop_number("MUL")?;
                let a = self.pop_number("MUL")?;
                self.push(Value::number(a * b))?;
            }
            OpCode::Div => {
                let b = self.pop_number("DIV")?;
                let a = self.pop_number("DIV")?;
                if b == 0.0 {
                    return Err(RuntimeError::DivisionByZero { line });
                }
                self.push(Value::number(a / b))?;
            }
            OpCode::Mod => {
                let b = self.pop_number("MOD")?;
                let a = self.pop_number("MOD")?;
                if b == 0.0 {
                    return Err(RuntimeError::ModuloByZero { line });
                }
                self.push(Value::number(a % b))?;
            }
            OpCode::Lt | OpCode::Gt | OpCode::Le | OpCode::Ge | OpCode::Eq | OpCode::Neq => {
                let b = self.pop(op.name())?.raw();
                let a = self.pop(op.name())?.raw();
                let result = match op {
                    OpCode::Lt => a < b,
                    OpCode::Gt => a > b,
                    OpCode::Le => a <= b,
                    OpCode::Ge => a >= b,
                    OpCode::Eq => a == b,
                    OpCode::Neq => a != b,
                    _ => unreachable!(),
                };
                self.push(Value::number(f64::from(u8::from(result))))?;
            }
            OpCode::Cat => {
                let b = self.pop("CAT")?;
                let a = self.pop("CAT")?;
                let text = format_value(&self.heap, &self.strings, a) + &format_value(&self.heap, &self.strings, b);
                let id = self.intern(&text);
                self.push(Value::string(id))?;
            }
            OpCode::Get => {
                let slot = self.operand_u32(0) as usize;
                self.push(*self.global_slot(slot))?;
            }
            OpCode::Set => {
                let slot = self.operand_u32(0) as usize;
                let v = self.pop("SET")?;
                *self.global_slot(slot) = v;
            }
            OpCode::Lvar => {
                let offset = self.operand_u32(0) as usize;
                self.push(self.stack[self.fp + offset])?;
            }
            OpCode::Svar => {
                let offset = self.operand_u32(0) as usize;
                let v = self.pop("SVAR")?;
                self.stack[self.fp + offset] = v;
            }
            OpCode::Jmp => {
                self.ip = self.operand(0) as usize;
                advance_by = 0;
            }
            OpCode::Jz => {
                let cond = self.pop("JZ")?;
                if !cond.is_truthy() {
                    self.ip = self.operand(0) as usize;
                    advance_by = 0;
                }
            }
            OpCode::Jnz => {
                let cond = self.pop("JNZ")?;
                if cond.is_truthy() {
                    self.ip = self.operand(0) as usize;
                    advance_by = 0;
                }
            }
            OpCode::Call => {
                let target = self.operand(0) as usize;
                let argc = self.operand_u32(1) as usize;
                if self.stack.len() < argc {
                    return Err(RuntimeError::StackUnderflow { line, op: "CALL" });
                }
                let args_start = self.stack.len() - argc;
                let args: Vec<Value> = self.stack.split_off(args_start);
                let return_ip = self.ip + 1 + op.operand_count();
                self.push(Value::number(return_ip as f64))?;
                self.push(Value::number(self.fp as f64))?;
                self.fp = self.stack.len();
                self.stack.extend(args);
                debug!(target, argc, "call");
                self.ip = target;
                advance_by = 0;
            }
            OpCode::Ret => {
                let retval = self.pop("RET")?;
                if self.fp < 2 {
                    return Err(RuntimeError::StackUnderflow { line, op: "RET" });
                }
                let saved_fp = self.stack[self.fp - 1].as_number().unwrap_or(0.0) as usize;
                let saved_ip = self.stack[self.fp - 2].as_number().unwrap_or(0.0) as usize;
                self.stack.truncate(self.fp - 2);
                self.fp = saved_fp;
                self.ip = saved_ip;
                self.push(retval)?;
                debug!(return_ip = saved_ip, "ret");
                advance_by = 0;
            }
            OpCode::Alloc => {
                let size = self.operand_u32(0) as usize;
                let struct_id = self.operand_u32(1);
                let fields = vec![Value::number(0.0); size];
                let addr = self.heap.alloc_struct(struct_id, &fields);
                self.push(Value::object(addr))?;
            }
            OpCode::Hset => {
                let offset = self.operand_u32(0);
                let struct_id = self.operand_u32(1);
                let value = self.pop("HSET")?;
                let obj = self.pop("HSET")?;
                let addr = self.expect_obj(obj, "HSET", line)?;
                self.heap
                    .struct_set(addr, offset, struct_id, value)
                    .map_err(|e| RuntimeError::heap(e, line))?;
                self.push(value)?;
            }
            OpCode::Hget => {
                let offset = self.operand_u32(0);
                let struct_id = self.operand_u32(1);
                let obj = self.pop("HGET")?;
                let addr = self.expect_obj(obj, "HGET", line)?;
                let value = self.heap.struct_get(addr, offset, struct_id).map_err(|e| RuntimeError::heap(e, line))?;
                self.push(value)?;
            }
            OpCode::Arr => {
                let count = self.operand_u32(0) as usize;
                if self.stack.len() < count {
                    return Err(RuntimeError::StackUnderflow { line, op: "ARR" });
                }
                let start = self.stack.len() - count;
                let values = self.stack.split_off(start);
                let addr = self.heap.alloc_array(&values);
                self.push(Value::object(addr))?;
            }
            OpCode::Aget => {
                let key = self.pop("AGET")?;
                let coll = self.pop("AGET")?;
                let addr = self.expect_obj(coll, "AGET", line)?;
                let value = self.array_like_get(addr, key, line)?;
                self.push(value)?;
            }
            OpCode::Aset => {
                let value = self.pop("ASET")?;
                let key = self.pop("ASET")?;
                let coll = self.pop("ASET")?;
                let addr = self.expect_obj(coll, "ASET", line)?;
                self.array_like_set(addr, key, value, line)?;
                self.push(value)?;
            }
            OpCode::Alen => {
                let coll = self.pop("ALEN")?;
                let addr = self.expect_obj(coll, "ALEN", line)?;
                let len = self.heap.length(addr).map_err(|e| RuntimeError::heap(e, line))?;
                self.push(Value::number(len as f64))?;
            }
            OpCode::Slice => {
                let end = self.pop_number("SLICE")?;
                let start = self.pop_number("SLICE")?;
                let coll = self.pop("SLICE")?;
                let addr = self.expect_obj(coll, "SLICE", line)?;
                let sliced = self
                    .heap
                    .array_slice(addr, start as i64, end as i64)
                    .map_err(|e| RuntimeError::heap(e, line))?;
                self.push(Value::object(sliced))?;
            }
            OpCode::Map => {
                let addr = self.heap.alloc_map();
                self.push(Value::object(addr))?;
            }
            OpCode::Dup => {
                let v = *self.stack.last().ok_or(RuntimeError::StackUnderflow { line, op: "DUP" })?;
                self.push(v)?;
            }
            OpCode::Pop => {
                self.pop("POP")?;
            }
            OpCode::Prn => {
                let v = self.pop("PRN")?;
                let text = format_value(&self.heap, &self.strings, v);
                self.print(&text);
                self.print("\n");
            }
            OpCode::Native => {
                let id = self.operand_u32(0) as u8;
                self.dispatch_native(id, line)?;
            }
            OpCode::MkBytes => {
                let coll = self.pop("MK_BYTES")?;
                let addr = self.expect_obj(coll, "MK_BYTES", line)?;
                let len = self.heap.length(addr).map_err(|e| RuntimeError::heap(e, line))?;
                let mut bytes = Vec::with_capacity(len);
                for i in 0..len {
                    let elem = self.heap.array_get(addr, i as i64).map_err(|e| RuntimeError::heap(e, line))?;
                    let n = elem.as_number().ok_or(RuntimeError::TypeMismatch { line, op: "MK_BYTES", found: elem.type_name() })?;
                    bytes.push(n as u8);
                }
                let bytes_addr = self.heap.alloc_bytes(&bytes);
                self.push(Value::object(bytes_addr))?;
            }
            OpCode::Hlt => {
                return Ok(true);
            }
            OpCode::ItKey
            | OpCode::ItVal
            | OpCode::ItDef
            | OpCode::Embed
            | OpCode::MakeArr
            | OpCode::NewArena
            | OpCode::DelArena
            | OpCode::SetCtx
            | OpCode::Monitor
            | OpCode::Cast
            | OpCode::CheckType
            | OpCode::Or
            | OpCode::Range
            | OpCode::ScopeEnter
            | OpCode::ScopeExit
            | OpCode::Debugger => {
                return Err(RuntimeError::Reserved { line, opcode: op.name() });
            }
        }

        self.ip += advance_by;
        Ok(false)
    }

    fn add(&mut self, a: Value, b: Value, line: Line) -> Result<Value, RuntimeError> {
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => Ok(Value::number(x + y)),
            (Value::Obj(x), Value::Obj(y))
                if self.heap.kind_at(x) == Ok(HeapKind::Array) && self.heap.kind_at(y) == Ok(HeapKind::Array) =>
            {
                let mut values = Vec::new();
                let len_x = self.heap.length(x).map_err(|e| RuntimeError::heap(e, line))?;
                for i in 0..len_x {
                    values.push(self.heap.array_get(x, i as i64).map_err(|e| RuntimeError::heap(e, line))?);
                }
                let len_y = self.heap.length(y).map_err(|e| RuntimeError::heap(e, line))?;
                for i in 0..len_y {
                    values.push(self.heap.array_get(y, i as i64).map_err(|e| RuntimeError::heap(e, line))?);
                }
                Ok(Value::object(self.heap.alloc_array(&values)))
            }
            (other, _) => Err(RuntimeError::TypeMismatch { line, op: "ADD", found: other.type_name() }),
        }
    }

    fn expect_obj(&self, v: Value, op: &'static str, line: Line) -> Result<HeapAddr, RuntimeError> {
        v.as_heap_addr().ok_or(RuntimeError::TypeMismatch { line, op, found: v.type_name() })
    }

    /// `AGET`/`ASET` dispatch on the collection's heap kind: numeric index
    /// into arrays and byte buffers, string key into maps.
    fn array_like_get(&mut self, addr: HeapAddr, key: Value, line: Line) -> Result<Value, RuntimeError> {
        match self.heap.kind_at(addr).map_err(|e| RuntimeError::heap(e, line))? {
            HeapKind::Array => {
                let idx = key.as_number().ok_or(RuntimeError::TypeMismatch { line, op: "AGET", found: key.type_name() })?;
                self.heap.array_get(addr, idx as i64).map_err(|e| RuntimeError::heap(e, line))
            }
            HeapKind::Bytes => {
                let idx = key.as_number().ok_or(RuntimeError::TypeMismatch { line, op: "AGET", found: key.type_name() })?;
                let byte = self.heap.bytes_get(addr, idx as i64).map_err(|e| RuntimeError::heap(e, line))?;
                Ok(Value::number(f64::from(byte)))
            }
            HeapKind::Map => {
                let key_id = key.as_str_id().ok_or(RuntimeError::MapKeyMustBeString { line })?;
                // Map-miss yields the empty string rather than a trap
                // (spec's preserved soft-failure policy).
                Ok(self
                    .heap
                    .map_get(addr, key_id)
                    .map_err(|e| RuntimeError::heap(e, line))?
                    .unwrap_or_else(|| Value::string(self.intern(""))))
            }
            HeapKind::Struct(_) => Err(RuntimeError::TypeMismatch { line, op: "AGET", found: "struct" }),
        }
    }

    fn array_like_set(&mut self, addr: HeapAddr, key: Value, value: Value, line: Line) -> Result<(), RuntimeError> {
        match self.heap.kind_at(addr).map_err(|e| RuntimeError::heap(e, line))? {
            HeapKind::Array => {
                let idx = key.as_number().ok_or(RuntimeError::TypeMismatch { line, op: "ASET", found: key.type_name() })?;
                self.heap.array_set(addr, idx as i64, value).map_err(|e| RuntimeError::heap(e, line))
            }
            HeapKind::Map => {
                let key_id = key.as_str_id().ok_or(RuntimeError::MapKeyMustBeString { line })?;
                self.heap.map_set(addr, key_id, value).map_err(|e| RuntimeError::heap(e, line))
            }
            HeapKind::Bytes => Err(RuntimeError::TypeMismatch { line, op: "ASET", found: "byte buffer" }),
            HeapKind::Struct(_) => Err(RuntimeError::TypeMismatch { line, op: "ASET", found: "struct" }),
        }
    }

    fn dispatch_native(&mut self, id: u8, line: Line) -> Result<(), RuntimeError> {
        let arity = native::lookup_arity(id).ok_or(RuntimeError::UnknownNative { line, id })?;
        if self.stack.len() < usize::from(arity) {
            return Err(RuntimeError::StackUnderflow { line, op: "NATIVE" });
        }
        let args = self.stack.split_off(self.stack.len() - usize::from(arity));
        let mut ctx = NativeCtx { heap: &mut self.heap, strings: &mut self.strings };
        let result = native::call(id, &mut ctx, &args).map_err(|e| RuntimeError::native(e, line))?;
        self.push(result)
    }

    /// Intern a string at runtime (natives and `CAT` share this pool with
    /// the compiler's string pool - idempotent, same as `Chunk::add_string`).
    fn intern(&mut self, s: &str) -> StrId {
        if let Some(pos) = self.strings.iter().position(|existing| existing == s) {
            return StrId(pos as u32);
        }
        let id = StrId(self.strings.len() as u32);
        self.strings.push(s.to_owned());
        id
    }
}
