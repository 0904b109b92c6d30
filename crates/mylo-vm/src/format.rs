// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Kind-aware value formatting shared by `PRN`, `CAT`, and the native
//! stdlib (`to_string`, `contains`, file-writing natives).
//!
//! One formatter serves all three call sites so `print(x)`, string
//! interpolation, and `to_string(x)` agree on how every value prints.

use crate::heap::{Heap, HeapKind};
use crate::value::Value;

/// Format a number the way `PRN` does: integers without a decimal point,
/// everything else in Rust's compact `Display` form ("short form").
#[must_use]
pub fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

/// Format a value for printing or stringification.
///
/// - Numbers: see [`format_number`].
/// - Strings: verbatim pool contents.
/// - Arrays: `[e1, e2, ...]`, recursively formatted.
/// - Byte buffers: `b"..."` (lossily decoded as UTF-8).
/// - Maps and structs: `[Ref: n]` (no kind-specific formatter).
#[must_use]
pub fn format_value(heap: &Heap, strings: &[String], value: Value) -> String {
    match value {
        Value::Number(n) => format_number(n),
        Value::Str(id) => strings.get(id.as_usize()).cloned().unwrap_or_default(),
        Value::Obj(addr) => match heap.kind_at(addr) {
            Ok(HeapKind::Array) => {
                let len = heap.length(addr).unwrap_or(0);
                let parts: Vec<String> = (0..len)
                    .map(|i| {
                        let elem = heap.array_get(addr, i as i64).unwrap_or(Value::number(0.0));
                        format_value(heap, strings, elem)
                    })
                    .collect();
                format!("[{}]", parts.join(", "))
            }
            Ok(HeapKind::Bytes) => {
                let bytes = heap.read_bytes(addr).unwrap_or_default();
                format!("b\"{}\"", String::from_utf8_lossy(&bytes))
            }
            Ok(HeapKind::Map | HeapKind::Struct(_)) | Err(_) => format!("[Ref: {}]", addr.0),
        },
    }
}
