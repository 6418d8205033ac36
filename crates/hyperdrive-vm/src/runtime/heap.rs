// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Object heap with a conservative mark-and-sweep collector.
//!
//! Allocation never collects. The runtime calls [`Heap::collect`] at
//! safepoints with its root set; any word that looks like a live heap
//! reference keeps its object alive.

use num_bigint::BigInt;
use rustc_hash::FxHashMap;

use super::class::ClassId;
use super::memory::Memory;
use super::thread::Block;
use crate::backend::Ptr;
use crate::value::{ObjRef, Value};

/// Reports the values reachable from a data block.
pub type MarkFn = fn(&Memory, Ptr, &mut Vec<Value>);

/// Releases a data block.
pub type FreeFn = fn(&mut Memory, Ptr);

/// A memory block owned by a heap object.
#[derive(Debug, Clone, Copy)]
pub struct DataHandle {
    /// The block
    pub ptr: Ptr,
    /// Mark callback
    pub mark: Option<MarkFn>,
    /// Free callback, run when the handle is swept
    pub free: Option<FreeFn>,
}

/// Key used to index hash tables: content for strings and bignums,
/// identity for everything else.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HashKey {
    /// Immediate or identity
    Word(u64),
    /// String contents
    Str(String),
    /// Bignum value
    Big(BigInt),
}

/// An insertion-ordered hash table.
#[derive(Debug, Clone, Default)]
pub struct HashTable {
    entries: Vec<(Value, Value)>,
    index: FxHashMap<HashKey, usize>,
}

impl HashTable {
    /// Looks up a key.
    pub fn get(&self, key: &HashKey) -> Option<Value> {
        self.index.get(key).map(|&i| self.entries[i].1)
    }

    /// Inserts or overwrites an entry.
    pub fn insert(&mut self, key: HashKey, k: Value, v: Value) {
        match self.index.get(&key) {
            Some(&i) => self.entries[i].1 = v,
            None => {
                self.index.insert(key, self.entries.len());
                self.entries.push((k, v));
            }
        }
    }

    /// Entries in insertion order.
    pub fn entries(&self) -> &[(Value, Value)] {
        &self.entries
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Object payloads.
#[derive(Debug, Clone)]
pub enum ObjectKind {
    /// Mutable string
    String(String),
    /// Array
    Array(Vec<Value>),
    /// Hash
    Hash(HashTable),
    /// Integer outside fixnum range
    Bignum(BigInt),
    /// Exception instance
    Exception {
        /// Message
        message: String,
    },
    /// Class object
    Class(ClassId),
    /// Proc wrapping a block
    Proc(Block),
    /// Memory block with callbacks
    Data(DataHandle),
    /// Plain instance
    Instance,
}

/// A heap object.
#[derive(Debug, Clone)]
pub struct Object {
    /// Class
    pub class: ClassId,
    /// Payload
    pub kind: ObjectKind,
    marked: bool,
}

/// Collection statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Completed collections
    pub collections: usize,
    /// Objects freed over all collections
    pub freed: usize,
}

/// The object heap.
#[derive(Debug, Default)]
pub struct Heap {
    slots: Vec<Option<Object>>,
    free: Vec<u32>,
    allocated: usize,
    stats: GcStats,
}

impl Heap {
    /// Creates an empty heap.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates an object.
    pub fn alloc(&mut self, class: ClassId, kind: ObjectKind) -> Value {
        let object = Object {
            class,
            kind,
            marked: false,
        };
        self.allocated += 1;
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(object);
                index as usize
            }
            None => {
                self.slots.push(Some(object));
                self.slots.len() - 1
            }
        };
        Value::object(ObjRef::new(index))
    }

    /// Looks up a live object.
    pub fn get(&self, value: Value) -> Option<&Object> {
        let obj = value.as_object()?;
        self.slots.get(obj.index())?.as_ref()
    }

    /// Looks up a live object mutably.
    pub fn get_mut(&mut self, value: Value) -> Option<&mut Object> {
        let obj = value.as_object()?;
        self.slots.get_mut(obj.index())?.as_mut()
    }

    /// String contents of `value`, if it is a string.
    pub fn string(&self, value: Value) -> Option<&str> {
        match &self.get(value)?.kind {
            ObjectKind::String(s) => Some(s),
            _ => None,
        }
    }

    /// Elements of `value`, if it is an array.
    pub fn array(&self, value: Value) -> Option<&[Value]> {
        match &self.get(value)?.kind {
            ObjectKind::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Elements of `value`, mutably, if it is an array.
    pub fn array_mut(&mut self, value: Value) -> Option<&mut Vec<Value>> {
        match &mut self.get_mut(value)?.kind {
            ObjectKind::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Table of `value`, if it is a hash.
    pub fn hash(&self, value: Value) -> Option<&HashTable> {
        match &self.get(value)?.kind {
            ObjectKind::Hash(table) => Some(table),
            _ => None,
        }
    }

    /// Table of `value`, mutably, if it is a hash.
    pub fn hash_mut(&mut self, value: Value) -> Option<&mut HashTable> {
        match &mut self.get_mut(value)?.kind {
            ObjectKind::Hash(table) => Some(table),
            _ => None,
        }
    }

    /// Bignum payload of `value`.
    pub fn bignum(&self, value: Value) -> Option<&BigInt> {
        match &self.get(value)?.kind {
            ObjectKind::Bignum(n) => Some(n),
            _ => None,
        }
    }

    /// Data handle of `value`.
    pub fn data(&self, value: Value) -> Option<DataHandle> {
        match &self.get(value)?.kind {
            ObjectKind::Data(handle) => Some(*handle),
            _ => None,
        }
    }

    /// The key `value` is indexed under in a hash.
    pub fn hash_key(&self, value: Value) -> HashKey {
        match self.get(value).map(|object| &object.kind) {
            Some(ObjectKind::String(s)) => HashKey::Str(s.clone()),
            Some(ObjectKind::Bignum(n)) => HashKey::Big(n.clone()),
            _ => HashKey::Word(value.raw()),
        }
    }

    /// Number of live objects.
    pub fn live(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Allocations since the last collection.
    pub fn allocated_since_gc(&self) -> usize {
        self.allocated
    }

    /// Collection statistics.
    pub fn stats(&self) -> GcStats {
        self.stats
    }

    /// Marks everything reachable from `roots` and frees the rest. Words
    /// that do not name a live object are ignored.
    pub fn collect(&mut self, roots: Vec<Value>, memory: &mut Memory) -> usize {
        let mut work = roots;
        while let Some(value) = work.pop() {
            let Some(object) = value
                .as_object()
                .and_then(|obj| self.slots.get_mut(obj.index()))
                .and_then(Option::as_mut)
            else {
                continue;
            };
            if object.marked {
                continue;
            }
            object.marked = true;
            match &object.kind {
                ObjectKind::Array(items) => work.extend_from_slice(items),
                ObjectKind::Hash(table) => {
                    for (k, v) in table.entries() {
                        work.push(*k);
                        work.push(*v);
                    }
                }
                ObjectKind::Proc(block) => block.trace(&mut work),
                ObjectKind::Data(DataHandle {
                    ptr,
                    mark: Some(mark),
                    ..
                }) => mark(memory, *ptr, &mut work),
                _ => {}
            }
        }

        let mut freed = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let Some(object) = slot else {
                continue;
            };
            if object.marked {
                object.marked = false;
                continue;
            }
            if let ObjectKind::Data(DataHandle {
                ptr,
                free: Some(free),
                ..
            }) = &object.kind
            {
                free(memory, *ptr);
            }
            *slot = None;
            self.free.push(index as u32);
            freed += 1;
        }
        self.allocated = 0;
        self.stats.collections += 1;
        self.stats.freed += freed;
        freed
    }
}

/// Mark callback for blocks whose every word may be a value.
pub fn mark_conservative(memory: &Memory, ptr: Ptr, out: &mut Vec<Value>) {
    if let Some(words) = memory.block(ptr) {
        out.extend(words.iter().map(|&word| Value::from_raw(word)));
    }
}

/// Free callback that releases the block.
pub fn free_block(memory: &mut Memory, ptr: Ptr) {
    memory.release(ptr);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class() -> ClassId {
        ClassId::new(0)
    }

    #[test]
    fn test_unreachable_objects_are_swept() {
        let mut heap = Heap::new();
        let mut memory = Memory::new(16);
        let kept = heap.alloc(class(), ObjectKind::String("kept".into()));
        let inner = heap.alloc(class(), ObjectKind::String("inner".into()));
        let array = heap.alloc(class(), ObjectKind::Array(vec![inner]));
        heap.alloc(class(), ObjectKind::String("garbage".into()));

        let freed = heap.collect(vec![kept, array, Value::fixnum(3).unwrap()], &mut memory);
        assert_eq!(freed, 1);
        assert_eq!(heap.string(inner), Some("inner"));
        assert_eq!(heap.live(), 3);
    }

    #[test]
    fn test_data_blocks_are_marked_and_freed() {
        let mut heap = Heap::new();
        let mut memory = Memory::new(16);
        let referenced = heap.alloc(class(), ObjectKind::String("x".into()));
        let ptr = memory.alloc(2);
        memory.write(ptr.add(1), referenced.raw());
        let handle = heap.alloc(
            class(),
            ObjectKind::Data(DataHandle {
                ptr,
                mark: Some(mark_conservative),
                free: Some(free_block),
            }),
        );

        heap.collect(vec![handle], &mut memory);
        assert_eq!(heap.string(referenced), Some("x"));
        assert_eq!(memory.live_blocks(), 1);

        heap.collect(vec![], &mut memory);
        assert_eq!(heap.live(), 0);
        assert_eq!(memory.live_blocks(), 0);
    }

    #[test]
    fn test_string_keys_hash_by_content() {
        let mut heap = Heap::new();
        let a = heap.alloc(class(), ObjectKind::String("k".into()));
        let b = heap.alloc(class(), ObjectKind::String("k".into()));
        assert_eq!(heap.hash_key(a), heap.hash_key(b));
        assert_ne!(heap.hash_key(Value::NIL), heap.hash_key(a));
    }
}
