// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Compile-time symbol tables.
//!
//! These exist only for the duration of compilation and are discarded
//! once a `Chunk` is produced; the VM never sees them.

use crate::types::CodeAddr;

/// A global variable: mangled name, storage slot, and optional static
/// type (struct id) for field-access resolution.
#[derive(Debug, Clone)]
pub struct GlobalSymbol {
    pub name: String,
    pub slot: u32,
    pub struct_id: Option<u32>,
    pub is_array: bool,
}

/// A local variable: frame-relative offset from the current call's `fp`.
#[derive(Debug, Clone)]
pub struct LocalSymbol {
    pub name: String,
    pub offset: u32,
    pub struct_id: Option<u32>,
    pub is_array: bool,
}

/// A declared function: mangled name and entry address.
#[derive(Debug, Clone)]
pub struct FuncSymbol {
    pub name: String,
    pub addr: CodeAddr,
}

/// A declared struct: mangled name and ordered field names.
#[derive(Debug, Clone)]
pub struct StructSymbol {
    pub name: String,
    pub fields: Vec<String>,
}

impl LocalSymbol {
    /// `(offset, struct_id, is_array)`, the bits `emit_var_load` needs
    /// without holding a borrow of `self.symbols` across the `emit` call.
    #[must_use]
    pub const fn clone_offset_info(&self) -> (u32, Option<u32>, bool) {
        (self.offset, self.struct_id, self.is_array)
    }
}

impl StructSymbol {
    #[must_use]
    pub fn field_offset(&self, field: &str) -> Option<u32> {
        self.fields.iter().position(|f| f == field).map(|i| i as u32)
    }
}

/// An enum member: fully mangled `Name_Member` key and its ordinal.
#[derive(Debug, Clone)]
pub struct EnumEntry {
    pub name: String,
    pub value: i64,
}

/// All compile-time symbol tables, plus the namespace stack used for name
/// mangling.
#[derive(Debug, Default)]
pub struct SymbolTables {
    pub globals: Vec<GlobalSymbol>,
    pub locals: Vec<LocalSymbol>,
    pub funcs: Vec<FuncSymbol>,
    pub structs: Vec<StructSymbol>,
    pub enums: Vec<EnumEntry>,
    namespace: String,
}

impl SymbolTables {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Enter a nested `mod name { ... }` block, returning the previous
    /// namespace so the caller can restore it on exit.
    pub fn enter_namespace(&mut self, name: &str) -> String {
        let previous = self.namespace.clone();
        self.namespace = if previous.is_empty() {
            name.to_owned()
        } else {
            format!("{previous}_{name}")
        };
        previous
    }

    pub fn exit_namespace(&mut self, previous: String) {
        self.namespace = previous;
    }

    /// Mangle a raw name with the current namespace prefix.
    #[must_use]
    pub fn mangle(&self, raw_name: &str) -> String {
        if self.namespace.is_empty() {
            raw_name.to_owned()
        } else {
            format!("{}_{raw_name}", self.namespace)
        }
    }

    #[must_use]
    pub fn find_local(&self, name: &str) -> Option<usize> {
        self.locals.iter().position(|l| l.name == name)
    }

    #[must_use]
    pub fn find_global(&self, name: &str) -> Option<usize> {
        self.globals.iter().position(|g| g.name == name)
    }

    #[must_use]
    pub fn find_func(&self, name: &str) -> Option<CodeAddr> {
        self.funcs.iter().find(|f| f.name == name).map(|f| f.addr)
    }

    #[must_use]
    pub fn find_struct(&self, name: &str) -> Option<u32> {
        self.structs.iter().position(|s| s.name == name).map(|i| i as u32)
    }

    /// Find the first declared struct containing `field`, used to infer
    /// the type of an untyped `{ field = expr, ... }` literal.
    #[must_use]
    pub fn find_struct_with_field(&self, field: &str) -> Option<u32> {
        self.structs
            .iter()
            .position(|s| s.fields.iter().any(|f| f == field))
            .map(|i| i as u32)
    }

    #[must_use]
    pub fn find_enum_value(&self, name: &str) -> Option<i64> {
        self.enums.iter().find(|e| e.name == name).map(|e| e.value)
    }

    /// Allocate a local or global variable slot, mangling global names
    /// with the current namespace. Returns the slot/offset assigned.
    pub fn alloc_var(&mut self, is_local: bool, name: &str, struct_id: Option<u32>, is_array: bool) -> u32 {
        if is_local {
            let offset = self.locals.len() as u32;
            self.locals.push(LocalSymbol {
                name: name.to_owned(),
                offset,
                struct_id,
                is_array,
            });
            offset
        } else {
            let mangled = self.mangle(name);
            let slot = self.globals.len() as u32;
            self.globals.push(GlobalSymbol {
                name: mangled,
                slot,
                struct_id,
                is_array,
            });
            slot
        }
    }

    /// Enter a function body: resets locals, returning the outer local
    /// table to restore on exit.
    pub fn enter_function(&mut self) -> Vec<LocalSymbol> {
        core::mem::take(&mut self.locals)
    }

    pub fn exit_function(&mut self, outer_locals: Vec<LocalSymbol>) {
        self.locals = outer_locals;
    }
}

/// Per-loop pending backpatch sites for `break` and `continue`.
#[derive(Debug, Default)]
struct LoopFrame {
    break_patches: Vec<CodeAddr>,
    continue_patches: Vec<CodeAddr>,
}

/// Stack of loop-control frames. Entering a loop pushes a frame; `break`
/// and `continue` record a placeholder jump operand address in the
/// innermost frame; closing the loop resolves every pending site to its
/// final address.
#[derive(Debug, Default)]
pub struct LoopStack {
    frames: Vec<LoopFrame>,
}

impl LoopStack {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self) {
        self.frames.push(LoopFrame::default());
    }

    /// Pop the innermost loop frame, returning its pending break and
    /// continue patch sites for the caller to backpatch.
    #[must_use]
    pub fn pop(&mut self) -> (Vec<CodeAddr>, Vec<CodeAddr>) {
        let frame = self.frames.pop().unwrap_or_default();
        (frame.break_patches, frame.continue_patches)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Record a `break` jump's placeholder operand address.
    ///
    /// # Panics
    /// Panics if called with no loop frame active; callers must check
    /// `is_empty()` first and raise `CompileError::BreakOutsideLoop`.
    pub fn record_break(&mut self, patch_addr: CodeAddr) {
        self.frames
            .last_mut()
            .expect("record_break called outside a loop")
            .break_patches
            .push(patch_addr);
    }

    /// Record a `continue` jump's placeholder operand address.
    ///
    /// # Panics
    /// Panics if called with no loop frame active; callers must check
    /// `is_empty()` first and raise `CompileError::ContinueOutsideLoop`.
    pub fn record_continue(&mut self, patch_addr: CodeAddr) {
        self.frames
            .last_mut()
            .expect("record_continue called outside a loop")
            .continue_patches
            .push(patch_addr);
    }
}
