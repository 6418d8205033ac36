// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Object allocation, conversion and comparison helpers.

use num_bigint::BigInt;
use num_traits::ToPrimitive;

use super::class::ClassId;
use super::heap::{DataHandle, HashTable, ObjectKind, free_block, mark_conservative};
use super::thread::Block;
use super::Runtime;
use crate::backend::Ptr;
use crate::error::RunResult;
use crate::iseq::Literal;
use crate::value::Value;

/// Words before the locals in an environment block: parent handle, self.
pub(crate) const ENV_HEADER: usize = 2;

impl Runtime {
    /// Class of any value.
    pub fn class_of(&self, value: Value) -> ClassId {
        match value {
            Value::NIL => self.core.nil,
            Value::TRUE => self.core.true_class,
            Value::FALSE => self.core.false_class,
            v if v.is_fixnum() => self.core.integer,
            v if v.is_symbol() => self.core.symbol,
            v => self
                .heap
                .get(v)
                .map(|object| object.class)
                .unwrap_or(self.core.object),
        }
    }

    /// Whether `value` is an instance of `class` or a subclass.
    pub fn is_a(&self, value: Value, class: ClassId) -> bool {
        self.classes.is_subclass(self.class_of(value), class)
    }

    /// Class id behind a class object.
    pub fn class_id(&self, value: Value) -> Option<ClassId> {
        match self.heap.get(value)?.kind {
            ObjectKind::Class(id) => Some(id),
            _ => None,
        }
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    /// A new string.
    pub fn str_new(&mut self, s: &str) -> Value {
        self.heap
            .alloc(self.core.string, ObjectKind::String(s.to_string()))
    }

    /// A new array.
    pub fn ary_new(&mut self, items: Vec<Value>) -> Value {
        self.heap.alloc(self.core.array, ObjectKind::Array(items))
    }

    /// A new hash from alternating keys and values.
    pub fn hash_new(&mut self, pairs: &[Value]) -> Value {
        let mut table = HashTable::default();
        for pair in pairs.chunks(2) {
            let (k, v) = (pair[0], pair.get(1).copied().unwrap_or(Value::NIL));
            table.insert(self.heap.hash_key(k), k, v);
        }
        self.heap.alloc(self.core.hash, ObjectKind::Hash(table))
    }

    /// A new exception.
    pub fn exception_new(&mut self, class: ClassId, message: String) -> Value {
        self.heap.alloc(class, ObjectKind::Exception { message })
    }

    /// An integer, as a fixnum when it fits.
    pub fn integer(&mut self, n: BigInt) -> Value {
        match n.to_i64().and_then(Value::fixnum) {
            Some(v) => v,
            None => self.heap.alloc(self.core.integer, ObjectKind::Bignum(n)),
        }
    }

    /// An integer from an `i64`.
    pub fn int(&mut self, n: i64) -> Value {
        match Value::fixnum(n) {
            Some(v) => v,
            None => self.integer(BigInt::from(n)),
        }
    }

    /// Integer value of a fixnum or bignum.
    pub fn big(&self, value: Value) -> Option<BigInt> {
        match value.as_fixnum() {
            Some(n) => Some(BigInt::from(n)),
            None => self.heap.bignum(value).cloned(),
        }
    }

    /// Materializes a literal.
    pub fn literal(&mut self, literal: &Literal) -> Value {
        match literal {
            Literal::Nil => Value::NIL,
            Literal::True => Value::TRUE,
            Literal::False => Value::FALSE,
            Literal::Int(n) => self.int(*n),
            Literal::Str(s) => self.str_new(s),
            Literal::Sym(name) => Value::symbol(self.intern(name)),
            Literal::Array(items) => {
                let values = items.iter().map(|item| self.literal(item)).collect();
                self.ary_new(values)
            }
        }
    }

    /// A new proc.
    pub fn proc_new(&mut self, block: Block) -> Value {
        self.heap.alloc(self.core.proc_class, ObjectKind::Proc(block))
    }

    /// The block behind a proc object.
    pub fn proc_block(&mut self, value: Value) -> RunResult<Block> {
        match self.heap.get(value).map(|object| &object.kind) {
            Some(ObjectKind::Proc(block)) => Ok(block.clone()),
            _ => Err(self.raise(self.core.type_error, "wrong argument type (expected Proc)")),
        }
    }

    /// Wraps a memory block in a GC handle that scans it conservatively
    /// and releases it when swept.
    pub fn wrap_block(&mut self, ptr: Ptr) -> Value {
        self.heap.alloc(
            self.core.data,
            ObjectKind::Data(DataHandle {
                ptr,
                mark: Some(mark_conservative),
                free: Some(free_block),
            }),
        )
    }

    /// Block pointer behind a data handle.
    pub fn data_ptr(&mut self, handle: Value) -> RunResult<Ptr> {
        match self.heap.data(handle) {
            Some(data) => Ok(data.ptr),
            None => Err(self.fatal(format!("{:?} is not a data handle", handle))),
        }
    }

    /// A new interpreter environment: `[parent, self, locals...]`.
    pub(crate) fn new_env(&mut self, parent: Value, self_value: Value, locals: usize) -> (Value, Ptr) {
        let ptr = self.memory.alloc(ENV_HEADER + locals);
        self.memory.write(ptr, parent.raw());
        self.memory.write(ptr.add(1), self_value.raw());
        for i in 0..locals {
            self.memory.write(ptr.add((ENV_HEADER + i) as i64), Value::NIL.raw());
        }
        (self.wrap_block(ptr), ptr)
    }

    // ========================================================================
    // Conversion
    // ========================================================================

    /// `to_s`
    pub fn to_s(&self, value: Value) -> String {
        if value.is_nil() {
            return String::new();
        }
        if let Some(sym) = value.as_symbol() {
            return self.symbols.name(sym).to_string();
        }
        match self.heap.get(value).map(|object| &object.kind) {
            Some(ObjectKind::String(s)) => s.clone(),
            Some(ObjectKind::Exception { message }) => message.clone(),
            Some(ObjectKind::Class(id)) => self.classes.get(*id).name.to_string(),
            _ => self.inspect(value),
        }
    }

    /// `inspect`
    pub fn inspect(&self, value: Value) -> String {
        match value {
            Value::NIL => return "nil".to_string(),
            Value::TRUE => return "true".to_string(),
            Value::FALSE => return "false".to_string(),
            _ => {}
        }
        if let Some(n) = value.as_fixnum() {
            return n.to_string();
        }
        if let Some(sym) = value.as_symbol() {
            return format!(":{}", self.symbols.name(sym));
        }
        let Some(object) = self.heap.get(value) else {
            return format!("{:?}", value);
        };
        match &object.kind {
            ObjectKind::String(s) => format!("{:?}", s),
            ObjectKind::Array(items) => {
                let parts: Vec<String> = items.iter().map(|item| self.inspect(*item)).collect();
                format!("[{}]", parts.join(", "))
            }
            ObjectKind::Hash(table) => {
                let parts: Vec<String> = table
                    .entries()
                    .iter()
                    .map(|(k, v)| format!("{}=>{}", self.inspect(*k), self.inspect(*v)))
                    .collect();
                format!("{{{}}}", parts.join(", "))
            }
            ObjectKind::Bignum(n) => n.to_string(),
            ObjectKind::Exception { message } => {
                format!("#<{}: {}>", self.classes.get(object.class).name, message)
            }
            ObjectKind::Class(id) => self.classes.get(*id).name.to_string(),
            ObjectKind::Proc(_) => "#<Proc>".to_string(),
            ObjectKind::Data(_) => "#<Data>".to_string(),
            ObjectKind::Instance if value == self.main_object() => "main".to_string(),
            ObjectKind::Instance => format!("#<{}>", self.classes.get(object.class).name),
        }
    }

    /// Message of an exception, or its `to_s`.
    pub fn exception_message(&self, value: Value) -> String {
        match self.heap.get(value).map(|object| &object.kind) {
            Some(ObjectKind::Exception { message }) => message.clone(),
            _ => self.to_s(value),
        }
    }

    /// `==` for core types: integers by value, strings by content, arrays
    /// element-wise, everything else by identity.
    pub fn values_equal(&self, a: Value, b: Value) -> bool {
        if a == b {
            return true;
        }
        let (Some(x), Some(y)) = (self.heap.get(a), self.heap.get(b)) else {
            return match (self.big(a), self.big(b)) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            };
        };
        match (&x.kind, &y.kind) {
            (ObjectKind::String(s), ObjectKind::String(t)) => s == t,
            (ObjectKind::Bignum(m), ObjectKind::Bignum(n)) => m == n,
            (ObjectKind::Array(xs), ObjectKind::Array(ys)) => {
                xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| self.values_equal(*x, *y))
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeConfig;

    #[test]
    fn test_integer_normalizes_to_fixnum() {
        let mut rt = Runtime::new(RuntimeConfig::default());
        let small = rt.integer(BigInt::from(42));
        assert_eq!(small.as_fixnum(), Some(42));

        let huge = rt.integer(BigInt::from(Value::FIXNUM_MAX) + 1);
        assert!(!huge.is_fixnum());
        assert_eq!(rt.inspect(huge), (Value::FIXNUM_MAX as i128 + 1).to_string());
    }

    #[test]
    fn test_inspect_nested_literals() {
        let mut rt = Runtime::new(RuntimeConfig::default());
        let lit = Literal::Array(vec![
            Literal::Int(1),
            Literal::Str("a".into()),
            Literal::Sym("b".into()),
            Literal::Nil,
        ]);
        let value = rt.literal(&lit);
        assert_eq!(rt.inspect(value), r#"[1, "a", :b, nil]"#);
        let pairs = [Value::fixnum(1).unwrap(), value];
        let hash = rt.hash_new(&pairs);
        assert_eq!(rt.inspect(hash), r#"{1=>[1, "a", :b, nil]}"#);
    }

    #[test]
    fn test_values_equal_by_content() {
        let mut rt = Runtime::new(RuntimeConfig::default());
        let a = rt.str_new("x");
        let b = rt.str_new("x");
        assert!(rt.values_equal(a, b));
        let big_a = rt.integer(BigInt::from(1) << 70);
        let big_b = rt.integer(BigInt::from(1) << 70);
        assert!(rt.values_equal(big_a, big_b));
        assert!(!rt.values_equal(a, Value::NIL));
    }
}
