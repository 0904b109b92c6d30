// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! # mylo VM
//!
//! The compiler and runtime for mylo, a small scripting language that
//! compiles to a compact stack-based bytecode.
//!
//! This crate provides:
//! - A single-pass lexer and recursive-descent parser/emitter (no separate
//!   AST pass: bytecode is emitted as the source is parsed)
//! - The bytecode instruction set and chunk representation
//! - A stack-based virtual machine that executes chunks
//! - A flat tagged-value heap (arrays, byte buffers, hash-probed maps, and
//!   structs)
//! - A fixed-size native-function registry (the standard library surface)

pub mod bytecode;
pub mod compiler;
pub mod format;
pub mod heap;
pub mod native;
pub mod types;
pub mod value;
pub mod vm;

/// Crate version.
pub const VERSION: &str = match option_env!("CARGO_PKG_VERSION") {
    Some(v) => v,
    None => "unknown",
};
