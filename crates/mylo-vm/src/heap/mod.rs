// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! The mylo heap: a flat, monotonically-growing store of tagged values.
//!
//! The source models this as a `double` array plus a parallel type-tag
//! array; since `Value` is already a tagged union here, the heap is simply
//! an append-only `Vec<Value>`. Objects are contiguous regions starting with
//! a header cell naming their kind: a negative sentinel for arrays, byte
//! buffers, and maps, or a non-negative struct id for structs. No cell is
//! ever freed - map growth abandons its old data region rather than
//! reclaiming it, matching the source's bump-allocator behavior.


use crate::types::{HeapAddr, StrId};
use crate::value::Value;

/// Initial map data-region capacity (in key/value pairs), matching the
/// source's `MAP_INITIAL_CAP`.
pub const MAP_INITIAL_CAP: usize = 16;

const ARRAY_TAG: f64 = -1.0;
const BYTES_TAG: f64 = -2.0;
const MAP_TAG: f64 = -3.0;

/// The kind of object a heap header cell identifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapKind {
    Array,
    Bytes,
    Map,
    Struct(u32),
}

/// Errors raised by out-of-bounds or mistyped heap access.
///
/// These are always converted into a `RuntimeError` (with a source line
/// attached) at the VM dispatch loop; the heap itself has no notion of
/// "current line".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    NotAnObject,
    IndexOutOfBounds,
    WrongStructId { expected: u32, found: Option<u32> },
    NotAnArrayOrBytes,
    NotAMap,
    MapKeyMustBeString,
}

/// The flat heap.
#[derive(Debug, Clone, Default)]
pub struct Heap {
    cells: Vec<Value>,
}

impl Heap {
    #[must_use]
    pub fn new() -> Self {
        Self { cells: Vec::new() }
    }

    /// Number of cells allocated so far (monotonically increases).
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    fn bump(&mut self, value: Value) -> HeapAddr {
        let addr = HeapAddr(self.cells.len() as u32);
        self.cells.push(value);
        addr
    }

    fn cell(&self, addr: HeapAddr) -> Value {
        self.cells[addr.as_usize()]
    }

    fn cell_mut(&mut self, addr: HeapAddr) -> &mut Value {
        &mut self.cells[addr.as_usize()]
    }

    /// Identify the kind of object at `addr` by reading its header cell.
    ///
    /// # Errors
    /// Returns `HeapError::NotAnObject` if `addr` doesn't name a header cell
    /// at all (out of range).
    pub fn kind_at(&self, addr: HeapAddr) -> Result<HeapKind, HeapError> {
        let header = self
            .cells
            .get(addr.as_usize())
            .ok_or(HeapError::NotAnObject)?;
        let Value::Number(tag) = *header else {
            return Err(HeapError::NotAnObject);
        };
        Ok(match tag {
            ARRAY_TAG => HeapKind::Array,
            BYTES_TAG => HeapKind::Bytes,
            MAP_TAG => HeapKind::Map,
            struct_id if struct_id >= 0.0 => HeapKind::Struct(struct_id as u32),
            _ => return Err(HeapError::NotAnObject),
        })
    }

    // --- arrays ---

    /// Allocate an array object holding `values` in order.
    pub fn alloc_array(&mut self, values: &[Value]) -> HeapAddr {
        let addr = self.bump(Value::number(ARRAY_TAG));
        self.bump(Value::number(values.len() as f64));
        for &v in values {
            self.bump(v);
        }
        addr
    }

    /// Length of an array or byte buffer at `addr`.
    ///
    /// # Errors
    /// `HeapError::NotAnArrayOrBytes` if `addr` is not an array/bytes header.
    pub fn length(&self, addr: HeapAddr) -> Result<usize, HeapError> {
        match self.kind_at(addr)? {
            HeapKind::Array | HeapKind::Bytes => {
                let Value::Number(len) = self.cell(addr.offset(1)) else {
                    return Err(HeapError::NotAnArrayOrBytes);
                };
                Ok(len as usize)
            }
            HeapKind::Map => {
                let Value::Number(count) = self.cell(addr.offset(2)) else {
                    return Err(HeapError::NotAMap);
                };
                Ok(count as usize)
            }
            HeapKind::Struct(_) => Err(HeapError::NotAnArrayOrBytes),
        }
    }

    /// Resolve a (possibly negative) mylo index against `len`, per the
    /// array-indexing invariant: `idx` in `[-len, len-1]` maps to
    /// `len + idx` when negative.
    #[must_use]
    pub fn normalize_index(idx: i64, len: usize) -> Option<usize> {
        if idx >= 0 {
            let idx = idx as usize;
            (idx < len).then_some(idx)
        } else {
            let wrapped = len as i64 + idx;
            (wrapped >= 0).then_some(wrapped as usize)
        }
    }

    /// Read an array element at (possibly negative) index `idx`.
    ///
    /// # Errors
    /// `HeapError::IndexOutOfBounds` if `idx` doesn't resolve within bounds.
    pub fn array_get(&self, addr: HeapAddr, idx: i64) -> Result<Value, HeapError> {
        if self.kind_at(addr)? != HeapKind::Array {
            return Err(HeapError::NotAnArrayOrBytes);
        }
        let len = self.length(addr)?;
        let i = Self::normalize_index(idx, len).ok_or(HeapError::IndexOutOfBounds)?;
        Ok(self.cell(addr.offset(2 + i as u32)))
    }

    /// Write an array element at (possibly negative) index `idx`.
    ///
    /// # Errors
    /// `HeapError::IndexOutOfBounds` if `idx` doesn't resolve within bounds.
    pub fn array_set(&mut self, addr: HeapAddr, idx: i64, value: Value) -> Result<(), HeapError> {
        if self.kind_at(addr)? != HeapKind::Array {
            return Err(HeapError::NotAnArrayOrBytes);
        }
        let len = self.length(addr)?;
        let i = Self::normalize_index(idx, len).ok_or(HeapError::IndexOutOfBounds)?;
        *self.cell_mut(addr.offset(2 + i as u32)) = value;
        Ok(())
    }

    /// Slice `a[s:e]` (inclusive on both ends) into a freshly allocated
    /// array. `s` is clamped to `0`, `e` to `len-1`; an empty slice results
    /// when `e < s` after clamping.
    pub fn array_slice(&mut self, addr: HeapAddr, start: i64, end: i64) -> Result<HeapAddr, HeapError> {
        if self.kind_at(addr)? != HeapKind::Array {
            return Err(HeapError::NotAnArrayOrBytes);
        }
        let len = self.length(addr)?;
        let start = start.max(0) as usize;
        let end = if end >= len as i64 { len.saturating_sub(1) } else { end.max(0) as usize };
        let values: Vec<Value> = if end >= start && start < len {
            (start..=end.min(len - 1))
                .map(|i| self.cell(addr.offset(2 + i as u32)))
                .collect()
        } else {
            Vec::new()
        };
        Ok(self.alloc_array(&values))
    }

    // --- byte buffers ---

    /// Allocate a byte-buffer object, packing 8 bytes per cell (re-using a
    /// `Value::Number`'s bit pattern as raw storage), matching the source's
    /// literal `memcpy` into `double` cells.
    pub fn alloc_bytes(&mut self, bytes: &[u8]) -> HeapAddr {
        let addr = self.bump(Value::number(BYTES_TAG));
        self.bump(Value::number(bytes.len() as f64));
        for chunk in bytes.chunks(8) {
            let mut buf = [0u8; 8];
            buf[..chunk.len()].copy_from_slice(chunk);
            self.bump(Value::number(f64::from_bits(u64::from_le_bytes(buf))));
        }
        addr
    }

    /// Read the raw bytes of a byte-buffer object back out.
    ///
    /// # Errors
    /// `HeapError::NotAnArrayOrBytes` if `addr` is not a bytes header.
    pub fn read_bytes(&self, addr: HeapAddr) -> Result<Vec<u8>, HeapError> {
        if self.kind_at(addr)? != HeapKind::Bytes {
            return Err(HeapError::NotAnArrayOrBytes);
        }
        let len = self.length(addr)?;
        let ncells = len.div_ceil(8);
        let mut out = Vec::with_capacity(len);
        for i in 0..ncells {
            let Value::Number(n) = self.cell(addr.offset(2 + i as u32)) else {
                return Err(HeapError::NotAnArrayOrBytes);
            };
            out.extend_from_slice(&n.to_bits().to_le_bytes());
        }
        out.truncate(len);
        Ok(out)
    }

    /// Read a single byte from a byte-buffer object at (possibly negative)
    /// index `idx`.
    pub fn bytes_get(&self, addr: HeapAddr, idx: i64) -> Result<u8, HeapError> {
        if self.kind_at(addr)? != HeapKind::Bytes {
            return Err(HeapError::NotAnArrayOrBytes);
        }
        let bytes = self.read_bytes(addr)?;
        let i = Self::normalize_index(idx, bytes.len()).ok_or(HeapError::IndexOutOfBounds)?;
        Ok(bytes[i])
    }

    // --- maps (hash-probed, open addressing) ---

    /// Allocate an empty map with the default initial capacity.
    pub fn alloc_map(&mut self) -> HeapAddr {
        let addr = self.bump(Value::number(MAP_TAG));
        self.bump(Value::number(MAP_INITIAL_CAP as f64)); // capacity
        self.bump(Value::number(0.0)); // count
        let data_ptr = self.alloc_map_data(MAP_INITIAL_CAP);
        self.bump(Value::number(f64::from(data_ptr.0)));
        addr
    }

    /// Allocate a fresh, empty probe table of `capacity` slots (2 cells per
    /// slot: key, value). The empty-slot sentinel is a `NaN` number cell -
    /// real keys are always `Value::Str`, so this is unambiguous.
    fn alloc_map_data(&mut self, capacity: usize) -> HeapAddr {
        let data_ptr = HeapAddr(self.cells.len() as u32);
        for _ in 0..capacity {
            self.bump(Value::number(f64::NAN));
            self.bump(Value::number(0.0));
        }
        data_ptr
    }

    fn map_header(&self, addr: HeapAddr) -> Result<(usize, usize, HeapAddr), HeapError> {
        if self.kind_at(addr)? != HeapKind::Map {
            return Err(HeapError::NotAMap);
        }
        let Value::Number(capacity) = self.cell(addr.offset(1)) else {
            return Err(HeapError::NotAMap);
        };
        let Value::Number(count) = self.cell(addr.offset(2)) else {
            return Err(HeapError::NotAMap);
        };
        let Value::Number(data_ptr) = self.cell(addr.offset(3)) else {
            return Err(HeapError::NotAMap);
        };
        Ok((capacity as usize, count as usize, HeapAddr(data_ptr as u32)))
    }

    fn probe_slot(&self, data_ptr: HeapAddr, capacity: usize, key: StrId) -> Option<usize> {
        let mut slot = key.0 as usize % capacity;
        for _ in 0..capacity {
            let key_cell = self.cell(data_ptr.offset((slot * 2) as u32));
            match key_cell {
                Value::Str(found) if found == key => return Some(slot),
                Value::Number(n) if n.is_nan() => return None,
                _ => {}
            }
            slot = (slot + 1) % capacity;
        }
        None
    }

    /// Look up `key` in the map at `addr`.
    ///
    /// Returns `None` on a miss; per the preserved source quirk, callers at
    /// the VM dispatch level turn a miss into the empty string rather than
    /// a trap.
    pub fn map_get(&self, addr: HeapAddr, key: StrId) -> Result<Option<Value>, HeapError> {
        let (capacity, _count, data_ptr) = self.map_header(addr)?;
        Ok(self
            .probe_slot(data_ptr, capacity, key)
            .map(|slot| self.cell(data_ptr.offset((slot * 2 + 1) as u32))))
    }

    /// Check whether `key` is present in the map at `addr`.
    pub fn map_contains(&self, addr: HeapAddr, key: StrId) -> Result<bool, HeapError> {
        let (capacity, _count, data_ptr) = self.map_header(addr)?;
        Ok(self.probe_slot(data_ptr, capacity, key).is_some())
    }

    /// Insert or update `key -> value` in the map at `addr`. Doubles the
    /// data region (rehashing all live entries) when the table is full and
    /// the key is new.
    pub fn map_set(&mut self, addr: HeapAddr, key: StrId, value: Value) -> Result<(), HeapError> {
        let (mut capacity, mut count, mut data_ptr) = self.map_header(addr)?;

        if let Some(slot) = self.probe_slot(data_ptr, capacity, key) {
            *self.cell_mut(data_ptr.offset((slot * 2 + 1) as u32)) = value;
            return Ok(());
        }

        if count >= capacity {
            let new_capacity = capacity * 2;
            let entries: Vec<(StrId, Value)> = (0..capacity)
                .filter_map(|slot| {
                    if let Value::Str(k) = self.cell(data_ptr.offset((slot * 2) as u32)) {
                        Some((k, self.cell(data_ptr.offset((slot * 2 + 1) as u32))))
                    } else {
                        None
                    }
                })
                .collect();
            let new_data_ptr = self.alloc_map_data(new_capacity);
            for (k, v) in entries {
                Self::insert_into(&mut self.cells, new_data_ptr, new_capacity, k, v);
            }
            capacity = new_capacity;
            data_ptr = new_data_ptr;
            *self.cell_mut(addr.offset(1)) = Value::number(capacity as f64);
            *self.cell_mut(addr.offset(3)) = Value::number(f64::from(data_ptr.0));
        }

        Self::insert_into(&mut self.cells, data_ptr, capacity, key, value);
        count += 1;
        *self.cell_mut(addr.offset(2)) = Value::number(count as f64);
        Ok(())
    }

    /// Insert a known-new key into a probe table, used both by `map_set`
    /// and by rehashing on growth.
    fn insert_into(cells: &mut [Value], data_ptr: HeapAddr, capacity: usize, key: StrId, value: Value) {
        let mut slot = key.0 as usize % capacity;
        loop {
            let key_idx = data_ptr.offset((slot * 2) as u32).as_usize();
            if matches!(cells[key_idx], Value::Number(n) if n.is_nan()) {
                cells[key_idx] = Value::string(key);
                cells[key_idx + 1] = value;
                return;
            }
            slot = (slot + 1) % capacity;
        }
    }

    // --- structs ---

    /// Allocate a struct instance of the given `struct_id` with `fields` in
    /// declared order.
    pub fn alloc_struct(&mut self, struct_id: u32, fields: &[Value]) -> HeapAddr {
        let addr = self.bump(Value::number(f64::from(struct_id)));
        for &f in fields {
            self.bump(f);
        }
        addr
    }

    /// Read field `offset` of a struct, verifying its header matches
    /// `expected_struct_id`.
    ///
    /// # Errors
    /// `HeapError::WrongStructId` if the header doesn't match.
    pub fn struct_get(&self, addr: HeapAddr, offset: u32, expected_struct_id: u32) -> Result<Value, HeapError> {
        match self.kind_at(addr)? {
            HeapKind::Struct(id) if id == expected_struct_id => {
                Ok(self.cell(addr.offset(1 + offset)))
            }
            HeapKind::Struct(id) => Err(HeapError::WrongStructId {
                expected: expected_struct_id,
                found: Some(id),
            }),
            HeapKind::Array | HeapKind::Bytes | HeapKind::Map => Err(HeapError::WrongStructId {
                expected: expected_struct_id,
                found: None,
            }),
        }
    }

    /// Write field `offset` of a struct, verifying its header matches
    /// `expected_struct_id`.
    pub fn struct_set(
        &mut self,
        addr: HeapAddr,
        offset: u32,
        expected_struct_id: u32,
        value: Value,
    ) -> Result<(), HeapError> {
        match self.kind_at(addr)? {
            HeapKind::Struct(id) if id == expected_struct_id => {
                *self.cell_mut(addr.offset(1 + offset)) = value;
                Ok(())
            }
            HeapKind::Struct(id) => Err(HeapError::WrongStructId {
                expected: expected_struct_id,
                found: Some(id),
            }),
            HeapKind::Array | HeapKind::Bytes | HeapKind::Map => Err(HeapError::WrongStructId {
                expected: expected_struct_id,
                found: None,
            }),
        }
    }
}
