// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Tests for the VM dispatch loop: direct bytecode construction for the
//! opcodes that are awkward to reach from source, plus compiled-program
//! checks for the stack-discipline properties (call balance, loop
//! balance) that only make sense to observe end to end.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::*;
use crate::bytecode::Chunk;
use crate::compiler::{self, NoImports};
use proptest::prelude::*;

fn run_source(src: &str) -> Vm {
    let chunk = compiler::compile(src, &NoImports).expect("compile");
    let mut vm = Vm::with_captured_output(chunk);
    vm.run().expect("run");
    vm
}

#[test]
fn arithmetic_precedence_matches_the_worked_example() {
    let vm = run_source("print((((5 + 2)*7)+1)/2)");
    assert_eq!(vm.captured_output(), "25\n");
}

#[test]
fn recursive_fibonacci() {
    let vm = run_source("fn fib(n){ if (n<2){ret n} ret fib(n-1)+fib(n-2)} print(fib(10))");
    assert_eq!(vm.captured_output(), "55\n");
}

#[test]
fn call_balance_holds_after_a_successful_return() {
    let chunk = compiler::compile("fn f(a,b){ ret a+b } var x = f(3,4)", &NoImports).unwrap();
    let mut vm = Vm::with_captured_output(chunk);
    vm.run().unwrap();
    // `var x = f(3,4)` at top level: args pushed, CALL, RET pushes the
    // result, SET consumes it. The operand stack returns to empty.
    assert_eq!(vm.stack.len(), 0);
    assert_eq!(vm.fp, 0);
}

#[test]
fn loop_balance_holds_on_normal_exit_and_on_break() {
    for src in ["for (var i in 0...5) { }", "for (var i in 0...5) { break }"] {
        let chunk = compiler::compile(src, &NoImports).unwrap();
        let mut vm = Vm::with_captured_output(chunk);
        vm.run().unwrap();
        assert_eq!(vm.stack.len(), 0, "source: {src}");
    }
}

#[test]
fn stack_underflow_on_add_with_nothing_pushed() {
    let mut chunk = Chunk::new();
    chunk.emit(OpCode::Add, &[], 1);
    chunk.emit(OpCode::Hlt, &[], 1);
    let mut vm = Vm::new(chunk);
    assert!(matches!(vm.run(), Err(RuntimeError::StackUnderflow { .. })));
}

#[test]
fn division_by_zero_traps() {
    let vm_result = {
        let chunk = compiler::compile("print(1/0)", &NoImports).unwrap();
        Vm::with_captured_output(chunk).run()
    };
    assert!(matches!(vm_result, Err(RuntimeError::DivisionByZero { .. })));
}

#[test]
fn modulo_by_zero_traps() {
    let chunk = compiler::compile("print(1%0)", &NoImports).unwrap();
    let result = Vm::with_captured_output(chunk).run();
    assert!(matches!(result, Err(RuntimeError::ModuloByZero { .. })));
}

#[test]
fn reserved_opcode_traps_with_a_named_error() {
    let mut chunk = Chunk::new();
    chunk.emit(OpCode::Debugger, &[], 1);
    let mut vm = Vm::new(chunk);
    assert!(matches!(vm.run(), Err(RuntimeError::Reserved { opcode: "DEBUGGER", .. })));
}

#[test]
fn struct_id_mismatch_traps_on_hget() {
    let src = "struct A { var x } struct B { var y } var a : A = {x=1} print(a.x)";
    // Compiles fine (the compiler trusts its own emitted struct id); force
    // a mismatch by hand-assembling HGET against the wrong id.
    let mut chunk = compiler::compile(src, &NoImports).unwrap();
    // Flip the struct id operand on the HGET instruction (the one right
    // before HLT) to a non-existent id.
    let hget_pos = chunk
        .code
        .iter()
        .position(|&c| c == OpCode::Hget as u8 as f64)
        .unwrap();
    chunk.code[hget_pos + 2] = 99.0;
    let result = Vm::with_captured_output(chunk).run();
    assert!(matches!(result, Err(RuntimeError::WrongStructId { expected: 99, found: Some(0) })));
}

#[test]
fn array_index_out_of_bounds_traps() {
    let chunk = compiler::compile("var a = [1,2] print(a[5])", &NoImports).unwrap();
    let result = Vm::with_captured_output(chunk).run();
    assert!(matches!(result, Err(RuntimeError::IndexOutOfBounds { .. })));
}

#[test]
fn map_key_miss_is_a_soft_failure_yielding_the_empty_string() {
    let vm = run_source(r#"var m = {"a"=1} print(m["missing"])"#);
    assert_eq!(vm.captured_output(), "\n");
}

#[test]
fn range_for_counts_up_and_down() {
    let up = run_source("for (var i in 0...5) { print(i) }");
    assert_eq!(up.captured_output(), "0\n1\n2\n3\n4\n5\n");
    let down = run_source("for (var i in 5...0) { print(i) }");
    assert_eq!(down.captured_output(), "5\n4\n3\n2\n1\n0\n");
}

#[test]
fn map_literal_and_index_assignment() {
    let vm = run_source(r#"var m = {"name"="foo","age"=32} print(m["name"]) m["age"]=33 print(m["age"])"#);
    assert_eq!(vm.captured_output(), "foo\n33\n");
}

#[test]
fn struct_literal_and_field_reads() {
    let vm = run_source("struct P { var age var name } var p : P = {age=30, name=\"Andy\"} print(p.age) print(p.name)");
    assert_eq!(vm.captured_output(), "30\nAndy\n");
}

#[test]
fn negative_array_index_and_inclusive_slice() {
    let vm = run_source("var a=[1,2,3,4] print(a[-1]) print(a[1:2])");
    assert_eq!(vm.captured_output(), "4\n[2, 3]\n");
}

#[test]
fn namespaced_function_call() {
    let vm = run_source("mod M { fn foo(){ ret 10 } } print(M::foo())");
    assert_eq!(vm.captured_output(), "10\n");
}

#[test]
fn array_concatenation_via_add() {
    let vm = run_source("print([1,2] + [3])");
    assert_eq!(vm.captured_output(), "[1, 2, 3]\n");
}

#[test]
fn conditional_for_loop_runs_while_the_expression_is_nonzero() {
    let vm = run_source("var n = 3 for (n) { print(n) n = n - 1 }");
    assert_eq!(vm.captured_output(), "3\n2\n1\n");
}

#[test]
fn collection_for_loop_iterates_by_index() {
    let vm = run_source("var a = [10, 20, 30] for (var x in a) { print(x) }");
    assert_eq!(vm.captured_output(), "10\n20\n30\n");
}

#[test]
fn continue_skips_to_the_update_step() {
    let vm = run_source("for (var i in 0...4) { if (i == 2) { continue } print(i) }");
    assert_eq!(vm.captured_output(), "0\n1\n3\n4\n");
}

#[test]
fn string_interpolation_concatenates_literal_and_expression_segments() {
    let vm = run_source(r#"var name = "world" print(f"hello {name}!")"#);
    assert_eq!(vm.captured_output(), "hello world!\n");
}

proptest! {
    #[test]
    fn call_balance_holds_for_any_argument_count(argc in 0usize..6) {
        let args: Vec<String> = (0..argc).map(|i| format!("a{i}")).collect();
        let params = args.join(",");
        let sum = if args.is_empty() { "0".to_owned() } else { args.join("+") };
        let call_args = (0..argc).map(|i| (i + 1).to_string()).collect::<Vec<_>>().join(",");
        let src = format!("fn f({params}){{ ret {sum} }} var x = f({call_args})");
        let chunk = compiler::compile(&src, &NoImports).unwrap();
        let mut vm = Vm::with_captured_output(chunk);
        vm.run().unwrap();
        prop_assert_eq!(vm.stack.len(), 0);
        prop_assert_eq!(vm.fp, 0);
    }
}
