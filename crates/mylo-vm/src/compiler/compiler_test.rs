// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Tests for the single-pass compiler: error paths, namespace mangling,
//! and the handful of compile-time-only behaviors (struct-literal type
//! inference, import resolution) that don't need a running VM to observe.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::*;

fn compile_ok(src: &str) -> Chunk {
    compile(src, &NoImports).expect("expected successful compile")
}

fn compile_err(src: &str) -> CompileError {
    compile(src, &NoImports).expect_err("expected a compile error")
}

#[test]
fn empty_program_emits_a_single_halt() {
    let chunk = compile_ok("");
    assert_eq!(chunk.code, vec![OpCode::Hlt as u8 as f64]);
}

#[test]
fn print_of_a_string_literal_interns_once() {
    let chunk = compile_ok(r#"print("hi") print("hi")"#);
    assert_eq!(chunk.strings, vec!["hi".to_owned()]);
}

#[test]
fn undefined_variable_is_a_compile_error() {
    let err = compile_err("print(missing)");
    assert!(matches!(err, CompileError::UndefinedVariable { name, .. } if name == "missing"));
}

#[test]
fn undefined_function_is_a_compile_error() {
    let err = compile_err("print(does_not_exist())");
    assert!(matches!(err, CompileError::UndefinedFunction { name, .. } if name == "does_not_exist"));
}

#[test]
fn native_arity_mismatch_is_a_compile_error() {
    let err = compile_err("print(sqrt(1, 2))");
    assert!(matches!(
        err,
        CompileError::NativeArityMismatch { name, expected: 1, found: 2, .. } if name == "sqrt"
    ));
}

#[test]
fn break_outside_loop_is_a_compile_error() {
    let err = compile_err("break");
    assert!(matches!(err, CompileError::BreakOutsideLoop { .. }));
}

#[test]
fn continue_outside_loop_is_a_compile_error() {
    let err = compile_err("continue");
    assert!(matches!(err, CompileError::ContinueOutsideLoop { .. }));
}

#[test]
fn break_inside_a_nested_function_loop_is_fine() {
    compile_ok("fn f() { for (var i in 0...3) { break } ret 0 } print(f())");
}

#[test]
fn map_literal_with_a_non_string_key_is_a_compile_error() {
    let err = compile_err("var m = {1=2}");
    assert!(matches!(err, CompileError::MapKeyMustBeString { .. }));
}

#[test]
fn struct_literal_without_a_matching_field_is_a_compile_error() {
    let err = compile_err("var p = {nope=1}");
    assert!(matches!(err, CompileError::CannotInferStructType { field, .. } if field == "nope"));
}

#[test]
fn struct_field_access_resolves_offsets() {
    let chunk = compile_ok("struct P { var age var name } var p : P = {age=30, name=\"Andy\"} print(p.age)");
    assert!(chunk.structs.iter().any(|s| s.name == "P" && s.fields == vec!["age".to_owned(), "name".to_owned()]));
}

#[test]
fn unknown_field_on_a_declared_struct_is_a_compile_error() {
    let err = compile_err("struct P { var age } var p : P = {age=1} print(p.nope)");
    assert!(matches!(err, CompileError::UnknownField { field, .. } if field == "nope"));
}

#[test]
fn field_access_on_an_untyped_var_is_a_compile_error() {
    let err = compile_err("var x = 1 print(x.field)");
    assert!(matches!(err, CompileError::AccessOnUntyped { field, .. } if field == "field"));
}

#[test]
fn namespace_mangling_prefixes_globals_and_funcs_declared_in_a_module() {
    let chunk = compile_ok("mod M { fn foo(){ ret 10 } } print(M::foo())");
    assert!(chunk.functions.iter().any(|f| f.name == "M_foo"));
}

#[test]
fn namespace_scoped_function_is_callable_by_its_bare_name_inside_the_module() {
    compile_ok("mod M { fn foo(){ ret 1 } fn bar(){ ret foo() } } print(M::bar())");
}

#[test]
fn enum_members_compile_to_precomputed_ordinals() {
    let chunk = compile_ok("enum Color { Red, Green, Blue, } print(Color::Green)");
    // PSH_NUM idx pushes const_pool[idx]; Green's ordinal is 1.
    assert!(chunk.constants.contains(&1.0));
}

#[test]
fn import_not_found_reports_the_path() {
    let err = compile_err(r#"import "missing.mylo""#);
    assert!(matches!(err, CompileError::ImportNotFound { path, .. } if path == "missing.mylo"));
}

struct FakeLoader;

impl SourceLoader for FakeLoader {
    fn load(&self, path: &str) -> Option<String> {
        (path == "lib.mylo").then(|| "fn helper() { ret 7 }".to_owned())
    }
}

#[test]
fn import_resolves_through_the_source_loader_and_does_not_double_halt() {
    let chunk = compile(r#"import "lib.mylo" print(helper())"#, &FakeLoader).unwrap();
    let halt_count = chunk.code.iter().filter(|&&c| c == OpCode::Hlt as u8 as f64).count();
    assert_eq!(halt_count, 1);
    assert!(chunk.functions.iter().any(|f| f.name == "helper"));
}

#[test]
fn ternary_compiles_to_two_backpatched_jumps() {
    let chunk = compile_ok("var x = 1 < 2 ? 3 : 4");
    let jz_count = chunk.code.iter().filter(|&&c| c == OpCode::Jz as u8 as f64).count();
    let jmp_count = chunk.code.iter().filter(|&&c| c == OpCode::Jmp as u8 as f64).count();
    assert_eq!(jz_count, 1);
    assert_eq!(jmp_count, 1);
}

#[test]
fn function_call_statement_discards_its_return_value() {
    let chunk = compile_ok("fn f() { ret 1 } f()");
    // A trailing POP after the CALL is how a call-as-statement differs
    // from a call used in an expression context.
    assert_eq!(chunk.code.last().copied(), Some(OpCode::Pop as u8 as f64));
}

#[test]
fn array_assignment_detects_trailing_equals_and_emits_a_store() {
    let chunk = compile_ok("var a = [1,2,3] a[0] = 9");
    assert!(chunk.code.contains(&(OpCode::Aset as u8 as f64)));
}

#[test]
fn plain_index_read_emits_a_load() {
    let chunk = compile_ok("var a = [1,2,3] print(a[0])");
    assert!(chunk.code.contains(&(OpCode::Aget as u8 as f64)));
    assert!(!chunk.code.contains(&(OpCode::Aset as u8 as f64)));
}

#[test]
fn slice_syntax_emits_slice_not_two_index_reads() {
    let chunk = compile_ok("var a = [1,2,3] print(a[0:1])");
    assert!(chunk.code.contains(&(OpCode::Slice as u8 as f64)));
}
