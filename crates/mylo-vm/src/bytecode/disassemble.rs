// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Bytecode disassembler for `mylo --dump`.

use super::{Chunk, OpCode};
use std::fmt::Write as _;

/// Disassemble a chunk to a human-readable string: one line per
/// instruction (address, source line, opcode name, operands), followed by
/// the constant pool, string pool, function table, and struct table.
#[must_use]
pub fn disassemble(chunk: &Chunk) -> String {
    let mut out = String::new();
    let mut ip = 0;

    while ip < chunk.code.len() {
        let line = chunk.line_at(ip);
        let opcode_cell = chunk.code[ip];
        let Some(op) = OpCode::from_u8(opcode_cell as u8) else {
            let _ = writeln!(out, "{ip:04} [{line:>4}] ??? ({opcode_cell})");
            ip += 1;
            continue;
        };
        let operands = &chunk.code[ip + 1..ip + 1 + op.operand_count()];
        let _ = write!(out, "{ip:04} [{line:>4}] {:<10}", op.name());
        for operand in operands {
            let _ = write!(out, " {operand}");
        }
        let _ = writeln!(out);
        ip += 1 + op.operand_count();
    }

    if !chunk.constants.is_empty() {
        let _ = writeln!(out, "\nconstants:");
        for (i, c) in chunk.constants.iter().enumerate() {
            let _ = writeln!(out, "  {i:04}: {c}");
        }
    }

    if !chunk.strings.is_empty() {
        let _ = writeln!(out, "\nstrings:");
        for (i, s) in chunk.strings.iter().enumerate() {
            let _ = writeln!(out, "  {i:04}: {s:?}");
        }
    }

    if !chunk.functions.is_empty() {
        let _ = writeln!(out, "\nfunctions:");
        for f in &chunk.functions {
            let _ = writeln!(out, "  {}: {:04}", f.name, f.addr);
        }
    }

    if !chunk.structs.is_empty() {
        let _ = writeln!(out, "\nstructs:");
        for (id, s) in chunk.structs.iter().enumerate() {
            let _ = writeln!(out, "  {id}: {} {:?}", s.name, s.fields);
        }
    }

    out
}
