// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! The native-function registry (spec §4.8): a fixed-size table binding
//! integer ids to host callbacks of fixed arity.
//!
//! The compiler resolves a bare identifier used in call position against
//! [`lookup`] to get `(id, arity)` and enforces arity at the call site
//! (`CompileError::NativeArityMismatch`); the `NATIVE` opcode dispatches by
//! id at runtime with no further checking. Every entry here pops exactly
//! its declared arity off the operand stack and pushes exactly one result,
//! matching the contract spec.md §4.8 describes for an embedder's natives
//! in general - this crate just supplies a concrete standard library
//! (spec.md explicitly leaves the *behavior* of natives to "external
//! collaborators"; SPEC_FULL.md §4.8 supplements a real one so the
//! end-to-end scenarios in spec.md §8 are runnable).

#[cfg(test)]
mod native_test;

use crate::format::format_value;
use crate::heap::{Heap, HeapKind};
use crate::types::StrId;
use crate::value::Value;
use std::fmt;
use std::fs;
use std::io::Write as _;

/// Errors a native callback can raise. Always converted to a
/// `RuntimeError` (with the trapping line attached) by the VM dispatch
/// loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeError {
    TypeMismatch { name: &'static str, arg: u8, expected: &'static str },
    InvalidArgument { name: &'static str, detail: String },
    Io { name: &'static str, detail: String },
}

impl fmt::Display for NativeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TypeMismatch { name, arg, expected } => {
                write!(f, "'{name}' expects {expected} for argument {arg}")
            }
            Self::InvalidArgument { name, detail } => write!(f, "'{name}': {detail}"),
            Self::Io { name, detail } => write!(f, "'{name}': {detail}"),
        }
    }
}

/// Everything a native callback needs beyond its arguments: the heap (to
/// allocate results) and the runtime string pool (to intern new strings
/// and read existing ones).
pub struct NativeCtx<'a> {
    pub heap: &'a mut Heap,
    pub strings: &'a mut Vec<String>,
}

impl NativeCtx<'_> {
    /// Intern a string at runtime, matching `Chunk::add_string`'s
    /// deduplication (string-pool idempotence holds across compile-time
    /// and runtime interning alike).
    pub fn intern(&mut self, s: &str) -> StrId {
        if let Some(pos) = self.strings.iter().position(|existing| existing == s) {
            return StrId(pos as u32);
        }
        let id = StrId(self.strings.len() as u32);
        self.strings.push(s.to_owned());
        id
    }

    fn text_of(&self, v: Value) -> String {
        format_value(self.heap, self.strings, v)
    }
}

type NativeFn = fn(&mut NativeCtx, &[Value]) -> Result<Value, NativeError>;

/// One registry entry: name (for compile-time lookup and arity checks),
/// declared arity, and the callback.
struct NativeEntry {
    name: &'static str,
    arity: u8,
    func: NativeFn,
}

/// The stdlib surface, registered at startup in this fixed order and
/// assigned ids `0..N` (SPEC_FULL.md §4.8).
const REGISTRY: &[NativeEntry] = &[
    NativeEntry { name: "len", arity: 1, func: native_len },
    NativeEntry { name: "contains", arity: 2, func: native_contains },
    NativeEntry { name: "sqrt", arity: 1, func: native_sqrt },
    NativeEntry { name: "sin", arity: 1, func: native_sin },
    NativeEntry { name: "cos", arity: 1, func: native_cos },
    NativeEntry { name: "tan", arity: 1, func: native_tan },
    NativeEntry { name: "floor", arity: 1, func: native_floor },
    NativeEntry { name: "ceil", arity: 1, func: native_ceil },
    NativeEntry { name: "to_string", arity: 1, func: native_to_string },
    NativeEntry { name: "to_num", arity: 1, func: native_to_num },
    NativeEntry { name: "read_lines", arity: 1, func: native_read_lines },
    NativeEntry { name: "write_file", arity: 3, func: native_write_file },
    NativeEntry { name: "read_bytes", arity: 2, func: native_read_bytes },
    NativeEntry { name: "write_bytes", arity: 2, func: native_write_bytes },
];

/// Resolve a bare name used in call position to its native id and
/// declared arity, for the compiler's `(name, arity)` static check.
#[must_use]
pub fn lookup(name: &str) -> Option<(u8, u8)> {
    REGISTRY
        .iter()
        .position(|e| e.name == name)
        .map(|i| (i as u8, REGISTRY[i].arity))
}

/// The declared arity of native `id`, for the VM's `NATIVE` dispatch to know
/// how many operand-stack slots to pop before calling [`call`].
#[must_use]
pub fn lookup_arity(id: u8) -> Option<u8> {
    REGISTRY.get(id as usize).map(|e| e.arity)
}

/// Invoke the native callback `id` with `args` (already popped from the
/// operand stack by the VM in left-to-right order).
///
/// # Errors
/// `NativeError::Io`/`TypeMismatch`/`InvalidArgument` on failure; there is
/// no "unknown id" case reachable from compiled code since the compiler
/// only ever emits ids it obtained from [`lookup`].
pub fn call(id: u8, ctx: &mut NativeCtx, args: &[Value]) -> Result<Value, NativeError> {
    (REGISTRY[id as usize].func)(ctx, args)
}

fn expect_num(args: &[Value], idx: usize, name: &'static str) -> Result<f64, NativeError> {
    match args[idx] {
        Value::Number(n) => Ok(n),
        Value::Str(_) | Value::Obj(_) => Err(NativeError::TypeMismatch { name, arg: idx as u8, expected: "number" }),
    }
}

fn expect_str<'a>(ctx: &'a NativeCtx, args: &[Value], idx: usize, name: &'static str) -> Result<&'a str, NativeError> {
    match args[idx] {
        Value::Str(id) => Ok(ctx.strings.get(id.as_usize()).map_or("", String::as_str)),
        Value::Number(_) | Value::Obj(_) => Err(NativeError::TypeMismatch { name, arg: idx as u8, expected: "string" }),
    }
}

fn native_len(ctx: &mut NativeCtx, args: &[Value]) -> Result<Value, NativeError> {
    let len = match args[0] {
        Value::Str(id) => ctx.strings.get(id.as_usize()).map_or(0, String::len),
        Value::Obj(addr) => ctx.heap.length(addr).map_err(|_| NativeError::TypeMismatch {
            name: "len",
            arg: 0,
            expected: "array, bytes, map, or string",
        })?,
        Value::Number(_) => return Err(NativeError::TypeMismatch { name: "len", arg: 0, expected: "array, bytes, map, or string" }),
    };
    Ok(Value::number(len as f64))
}

fn native_contains(ctx: &mut NativeCtx, args: &[Value]) -> Result<Value, NativeError> {
    let found = match args[0] {
        Value::Str(id) => {
            let haystack = ctx.strings.get(id.as_usize()).map_or("", String::as_str);
            let needle = expect_str(ctx, args, 1, "contains")?;
            haystack.contains(needle)
        }
        Value::Obj(addr) => match ctx.heap.kind_at(addr) {
            Ok(HeapKind::Array) => {
                let len = ctx.heap.length(addr).unwrap_or(0);
                let needle_raw = args[1].raw();
                (0..len).any(|i| {
                    ctx.heap
                        .array_get(addr, i as i64)
                        .is_ok_and(|v| v.raw() == needle_raw)
                })
            }
            Ok(HeapKind::Map) => {
                let key = match args[1] {
                    Value::Str(id) => id,
                    _ => return Err(NativeError::TypeMismatch { name: "contains", arg: 1, expected: "string key" }),
                };
                ctx.heap.map_contains(addr, key).unwrap_or(false)
            }
            _ => return Err(NativeError::TypeMismatch { name: "contains", arg: 0, expected: "string, array, or map" }),
        },
        Value::Number(_) => return Err(NativeError::TypeMismatch { name: "contains", arg: 0, expected: "string, array, or map" }),
    };
    Ok(Value::number(if found { 1.0 } else { 0.0 }))
}

fn native_sqrt(_ctx: &mut NativeCtx, args: &[Value]) -> Result<Value, NativeError> {
    Ok(Value::number(expect_num(args, 0, "sqrt")?.sqrt()))
}

fn native_sin(_ctx: &mut NativeCtx, args: &[Value]) -> Result<Value, NativeError> {
    Ok(Value::number(expect_num(args, 0, "sin")?.sin()))
}

fn native_cos(_ctx: &mut NativeCtx, args: &[Value]) -> Result<Value, NativeError> {
    Ok(Value::number(expect_num(args, 0, "cos")?.cos()))
}

fn native_tan(_ctx: &mut NativeCtx, args: &[Value]) -> Result<Value, NativeError> {
    Ok(Value::number(expect_num(args, 0, "tan")?.tan()))
}

fn native_floor(_ctx: &mut NativeCtx, args: &[Value]) -> Result<Value, NativeError> {
    Ok(Value::number(expect_num(args, 0, "floor")?.floor()))
}

fn native_ceil(_ctx: &mut NativeCtx, args: &[Value]) -> Result<Value, NativeError> {
    Ok(Value::number(expect_num(args, 0, "ceil")?.ceil()))
}

fn native_to_string(ctx: &mut NativeCtx, args: &[Value]) -> Result<Value, NativeError> {
    let text = ctx.text_of(args[0]);
    let id = ctx.intern(&text);
    Ok(Value::string(id))
}

fn native_to_num(ctx: &mut NativeCtx, args: &[Value]) -> Result<Value, NativeError> {
    let n = match args[0] {
        Value::Number(n) => n,
        Value::Str(id) => ctx
            .strings
            .get(id.as_usize())
            .and_then(|s| s.trim().parse::<f64>().ok())
            .unwrap_or(0.0),
        Value::Obj(_) => return Err(NativeError::TypeMismatch { name: "to_num", arg: 0, expected: "number or string" }),
    };
    Ok(Value::number(n))
}

/// Read a file into an array of line strings; an empty array if the file
/// can't be opened. Trailing `\n`/`\r\n` is trimmed from every line.
fn native_read_lines(ctx: &mut NativeCtx, args: &[Value]) -> Result<Value, NativeError> {
    let path = expect_str(ctx, args, 0, "read_lines")?.to_owned();
    let lines: Vec<String> = fs::read_to_string(&path)
        .map(|content| content.lines().map(str::to_owned).collect())
        .unwrap_or_default();
    let values: Vec<Value> = lines.iter().map(|l| Value::string(ctx.intern(l))).collect();
    let addr = ctx.heap.alloc_array(&values);
    Ok(Value::object(addr))
}

/// `(path, mode, content)`: `mode` must be `"w"` (truncate) or `"a"`
/// (append). Returns `0.0` if the file can't be opened, `1.0` on success.
fn native_write_file(ctx: &mut NativeCtx, args: &[Value]) -> Result<Value, NativeError> {
    let path = expect_str(ctx, args, 0, "write_file")?.to_owned();
    let mode = expect_str(ctx, args, 1, "write_file")?.to_owned();
    let content = expect_str(ctx, args, 2, "write_file")?.to_owned();

    let open_result = match mode.as_str() {
        "w" => fs::File::create(&path),
        "a" => fs::OpenOptions::new().create(true).append(true).open(&path),
        other => {
            return Err(NativeError::InvalidArgument {
                name: "write_file",
                detail: format!("mode must be \"w\" or \"a\", got {other:?}"),
            });
        }
    };

    let Ok(mut file) = open_result else {
        return Ok(Value::number(0.0));
    };
    match file.write_all(content.as_bytes()) {
        Ok(()) => Ok(Value::number(1.0)),
        Err(_) => Ok(Value::number(0.0)),
    }
}

/// `(path, stride)`: `stride` must be `1` or `4` (else a runtime error)
/// but, preserving the source's exact quirk (spec.md Open Questions), has
/// no further effect - the byte buffer is always sized to the raw file
/// length.
fn native_read_bytes(ctx: &mut NativeCtx, args: &[Value]) -> Result<Value, NativeError> {
    let path = expect_str(ctx, args, 0, "read_bytes")?.to_owned();
    let stride = expect_num(args, 1, "read_bytes")?;
    if stride != 1.0 && stride != 4.0 {
        return Err(NativeError::InvalidArgument {
            name: "read_bytes",
            detail: format!("stride must be 1 or 4, got {stride}"),
        });
    }
    let bytes = fs::read(&path).map_err(|e| NativeError::Io { name: "read_bytes", detail: e.to_string() })?;
    let addr = ctx.heap.alloc_bytes(&bytes);
    Ok(Value::object(addr))
}

/// Writes a byte-buffer object's raw bytes to a file. Returns `0.0` if
/// the file can't be opened, `1.0` on success.
fn native_write_bytes(ctx: &mut NativeCtx, args: &[Value]) -> Result<Value, NativeError> {
    let path = expect_str(ctx, args, 0, "write_bytes")?.to_owned();
    let Value::Obj(addr) = args[1] else {
        return Err(NativeError::TypeMismatch { name: "write_bytes", arg: 1, expected: "byte buffer" });
    };
    let bytes = ctx
        .heap
        .read_bytes(addr)
        .map_err(|_| NativeError::TypeMismatch { name: "write_bytes", arg: 1, expected: "byte buffer" })?;

    let Ok(mut file) = fs::File::create(&path) else {
        return Ok(Value::number(0.0));
    };
    match file.write_all(&bytes) {
        Ok(()) => Ok(Value::number(1.0)),
        Err(_) => Ok(Value::number(0.0)),
    }
}
