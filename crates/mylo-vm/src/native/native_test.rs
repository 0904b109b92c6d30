// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Tests for the native-function registry.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::*;
use std::sync::atomic::{AtomicU32, Ordering};

fn ctx(heap: &mut Heap, strings: &mut Vec<String>) -> NativeCtx<'_> {
    NativeCtx { heap, strings }
}

#[test]
fn lookup_returns_the_declared_arity() {
    assert_eq!(lookup("len"), Some((0, 1)));
    assert_eq!(lookup("write_file"), Some((11, 3)));
    assert_eq!(lookup("not_a_real_function"), None);
}

#[test]
fn lookup_arity_matches_lookup() {
    for name in ["len", "contains", "sqrt", "read_bytes"] {
        let (id, arity) = lookup(name).unwrap();
        assert_eq!(lookup_arity(id), Some(arity));
    }
}

#[test]
fn len_of_a_string_is_its_byte_length() {
    let mut heap = Heap::new();
    let mut strings = vec!["hello".to_owned()];
    let mut c = ctx(&mut heap, &mut strings);
    let result = call(0, &mut c, &[Value::string(StrId(0))]).unwrap();
    assert_eq!(result, Value::number(5.0));
}

#[test]
fn len_of_an_array() {
    let mut heap = Heap::new();
    let mut strings = Vec::new();
    let addr = heap.alloc_array(&[Value::number(1.0), Value::number(2.0), Value::number(3.0)]);
    let mut c = ctx(&mut heap, &mut strings);
    let result = call(0, &mut c, &[Value::object(addr)]).unwrap();
    assert_eq!(result, Value::number(3.0));
}

#[test]
fn contains_substring_search_on_strings() {
    let mut heap = Heap::new();
    let mut strings = vec!["hello world".to_owned(), "world".to_owned(), "xyz".to_owned()];
    let (id, _) = lookup("contains").unwrap();
    let mut c = ctx(&mut heap, &mut strings);
    let found = call(id, &mut c, &[Value::string(StrId(0)), Value::string(StrId(1))]).unwrap();
    assert_eq!(found, Value::number(1.0));
    let not_found = call(id, &mut c, &[Value::string(StrId(0)), Value::string(StrId(2))]).unwrap();
    assert_eq!(not_found, Value::number(0.0));
}

#[test]
fn contains_linear_scan_on_arrays() {
    let mut heap = Heap::new();
    let mut strings = Vec::new();
    let addr = heap.alloc_array(&[Value::number(1.0), Value::number(2.0)]);
    let (id, _) = lookup("contains").unwrap();
    let mut c = ctx(&mut heap, &mut strings);
    let found = call(id, &mut c, &[Value::object(addr), Value::number(2.0)]).unwrap();
    assert_eq!(found, Value::number(1.0));
    let missing = call(id, &mut c, &[Value::object(addr), Value::number(9.0)]).unwrap();
    assert_eq!(missing, Value::number(0.0));
}

#[test]
fn math_functions() {
    let mut heap = Heap::new();
    let mut strings = Vec::new();
    let mut c = ctx(&mut heap, &mut strings);
    assert_eq!(call(lookup("sqrt").unwrap().0, &mut c, &[Value::number(9.0)]).unwrap(), Value::number(3.0));
    assert_eq!(call(lookup("floor").unwrap().0, &mut c, &[Value::number(1.9)]).unwrap(), Value::number(1.0));
    assert_eq!(call(lookup("ceil").unwrap().0, &mut c, &[Value::number(1.1)]).unwrap(), Value::number(2.0));
}

#[test]
fn to_string_formats_a_number_without_a_trailing_decimal() {
    let mut heap = Heap::new();
    let mut strings = Vec::new();
    let (id, _) = lookup("to_string").unwrap();
    let mut c = ctx(&mut heap, &mut strings);
    let result = call(id, &mut c, &[Value::number(42.0)]).unwrap();
    let Value::Str(sid) = result else { panic!("expected a string") };
    assert_eq!(strings[sid.as_usize()], "42");
}

#[test]
fn to_num_parses_a_string_and_defaults_to_zero_on_failure() {
    let mut heap = Heap::new();
    let mut strings = vec!["3.5".to_owned(), "not a number".to_owned()];
    let (id, _) = lookup("to_num").unwrap();
    let mut c = ctx(&mut heap, &mut strings);
    assert_eq!(call(id, &mut c, &[Value::string(StrId(0))]).unwrap(), Value::number(3.5));
    assert_eq!(call(id, &mut c, &[Value::string(StrId(1))]).unwrap(), Value::number(0.0));
}

#[test]
fn read_lines_returns_an_empty_array_when_the_file_is_missing() {
    let mut heap = Heap::new();
    let mut strings = vec!["/nonexistent/path/mylo-native-test".to_owned()];
    let (id, _) = lookup("read_lines").unwrap();
    let mut c = ctx(&mut heap, &mut strings);
    let result = call(id, &mut c, &[Value::string(StrId(0))]).unwrap();
    let Value::Obj(addr) = result else { panic!("expected an array") };
    assert_eq!(heap.length(addr), Ok(0));
}

fn unique_temp_path(tag: &str) -> std::path::PathBuf {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("mylo-native-test-{tag}-{}-{n}.tmp", std::process::id()))
}

#[test]
fn write_file_then_read_lines_round_trips() {
    let path = unique_temp_path("write-read");
    let path_str = path.to_str().unwrap().to_owned();

    let mut heap = Heap::new();
    let mut strings = vec![path_str, "w".to_owned(), "line one\nline two\n".to_owned()];
    let (write_id, _) = lookup("write_file").unwrap();
    {
        let mut c = ctx(&mut heap, &mut strings);
        let wrote = call(write_id, &mut c, &[Value::string(StrId(0)), Value::string(StrId(1)), Value::string(StrId(2))]).unwrap();
        assert_eq!(wrote, Value::number(1.0));
    }

    let (read_id, _) = lookup("read_lines").unwrap();
    let mut c = ctx(&mut heap, &mut strings);
    let result = call(read_id, &mut c, &[Value::string(StrId(0))]).unwrap();
    let Value::Obj(addr) = result else { panic!("expected an array") };
    drop(c);
    assert_eq!(heap.length(addr), Ok(2));

    std::fs::remove_file(&path).ok();
}

#[test]
fn write_file_rejects_an_invalid_mode() {
    let path = unique_temp_path("bad-mode");
    let mut heap = Heap::new();
    let mut strings = vec![path.to_str().unwrap().to_owned(), "x".to_owned(), "content".to_owned()];
    let (id, _) = lookup("write_file").unwrap();
    let mut c = ctx(&mut heap, &mut strings);
    let result = call(id, &mut c, &[Value::string(StrId(0)), Value::string(StrId(1)), Value::string(StrId(2))]);
    assert!(matches!(result, Err(NativeError::InvalidArgument { name: "write_file", .. })));
}

#[test]
fn read_bytes_rejects_a_stride_other_than_1_or_4() {
    let path = unique_temp_path("stride");
    std::fs::write(&path, b"abc").unwrap();
    let mut heap = Heap::new();
    let mut strings = vec![path.to_str().unwrap().to_owned()];
    let (id, _) = lookup("read_bytes").unwrap();
    let mut c = ctx(&mut heap, &mut strings);
    let result = call(id, &mut c, &[Value::string(StrId(0)), Value::number(2.0)]);
    assert!(matches!(result, Err(NativeError::InvalidArgument { name: "read_bytes", .. })));
    std::fs::remove_file(&path).ok();
}

#[test]
fn read_bytes_ignores_stride_for_layout_and_sizes_to_the_raw_file_length() {
    let path = unique_temp_path("stride-noop");
    std::fs::write(&path, b"abcdefgh").unwrap();
    let mut heap = Heap::new();
    let mut strings = vec![path.to_str().unwrap().to_owned()];
    let (id, _) = lookup("read_bytes").unwrap();

    let addr_stride_1 = {
        let mut c = ctx(&mut heap, &mut strings);
        let result = call(id, &mut c, &[Value::string(StrId(0)), Value::number(1.0)]).unwrap();
        let Value::Obj(addr) = result else { panic!("expected a byte buffer") };
        addr
    };
    let addr_stride_4 = {
        let mut c = ctx(&mut heap, &mut strings);
        let result = call(id, &mut c, &[Value::string(StrId(0)), Value::number(4.0)]).unwrap();
        let Value::Obj(addr) = result else { panic!("expected a byte buffer") };
        addr
    };
    assert_eq!(heap.length(addr_stride_1), heap.length(addr_stride_4));
    std::fs::remove_file(&path).ok();
}

#[test]
fn write_bytes_then_read_back_with_read_bytes() {
    let path = unique_temp_path("bytes-roundtrip");
    let mut heap = Heap::new();
    let mut strings = vec![path.to_str().unwrap().to_owned()];
    let buf_addr = heap.alloc_bytes(&[1, 2, 3, 4]);

    let (write_id, _) = lookup("write_bytes").unwrap();
    {
        let mut c = ctx(&mut heap, &mut strings);
        let wrote = call(write_id, &mut c, &[Value::string(StrId(0)), Value::object(buf_addr)]).unwrap();
        assert_eq!(wrote, Value::number(1.0));
    }

    let on_disk = std::fs::read(&path).unwrap();
    assert_eq!(on_disk, vec![1, 2, 3, 4]);
    std::fs::remove_file(&path).ok();
}
