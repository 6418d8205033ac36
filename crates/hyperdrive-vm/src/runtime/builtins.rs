// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Core methods implemented in Rust.
//!
//! Builtins receive the receiver and arguments as values and run inside
//! their own control frame, so the block passed to them is
//! [`Runtime::block_given`]. Temporaries that must survive a yield are
//! pinned.

use num_bigint::BigInt;

use super::class::ClassId;
use super::heap::ObjectKind;
use super::natives::{index_fast, index_set_fast};
use super::Runtime;
use crate::error::RunResult;
use crate::value::Value;

/// Defines every core method.
pub(crate) fn define(rt: &mut Runtime) {
    define_kernel(rt);
    define_integer(rt);
    define_string(rt);
    define_array(rt);
    define_hash(rt);
    define_class(rt);
}

fn arg(args: &[Value], i: usize) -> Value {
    args.get(i).copied().unwrap_or(Value::NIL)
}

fn check_args(rt: &mut Runtime, args: &[Value], min: usize, max: usize) -> RunResult<()> {
    if args.len() < min || args.len() > max {
        return Err(rt.argument_error(args.len(), min, Some(max)));
    }
    Ok(())
}

fn class_name(rt: &Runtime, value: Value) -> String {
    let class = rt.class_of(value);
    rt.classes.get(class).name.to_string()
}

// ============================================================================
// Kernel
// ============================================================================

fn define_kernel(rt: &mut Runtime) {
    let object = rt.core.object;
    rt.define_builtin(object, "puts", kernel_puts);
    rt.define_builtin(object, "print", kernel_print);
    rt.define_builtin(object, "p", kernel_p);
    rt.define_builtin(object, "raise", kernel_raise);
    rt.define_builtin(object, "block_given?", kernel_block_given);
    rt.define_builtin(object, "proc", kernel_proc);
    rt.define_builtin(object, "loop", kernel_loop);
    rt.define_builtin(object, "send", object_send);
    rt.define_builtin(object, "==", object_eq);
    rt.define_builtin(object, "!=", object_neq);
    rt.define_builtin(object, "!", object_not);
    rt.define_builtin(object, "nil?", object_is_nil);
    rt.define_builtin(object, "is_a?", object_is_a);
    rt.define_builtin(object, "class", object_class);
    rt.define_builtin(object, "inspect", object_inspect);
    rt.define_builtin(object, "to_s", object_to_s);

    let proc = rt.core.proc_class;
    rt.define_builtin(proc, "call", proc_call);
    let exception = rt.core.exception;
    rt.define_builtin(exception, "message", exception_message);
}

fn kernel_puts(rt: &mut Runtime, _recv: Value, args: &[Value]) -> RunResult<Value> {
    if args.is_empty() {
        rt.write_output("\n");
    }
    for &value in args {
        let lines: Vec<Value> = match rt.heap.array(value) {
            Some(items) => items.to_vec(),
            None => vec![value],
        };
        for line in lines {
            let mut text = rt.to_s(line);
            if !text.ends_with('\n') {
                text.push('\n');
            }
            rt.write_output(&text);
        }
    }
    Ok(Value::NIL)
}

fn kernel_print(rt: &mut Runtime, _recv: Value, args: &[Value]) -> RunResult<Value> {
    for &value in args {
        let text = rt.to_s(value);
        rt.write_output(&text);
    }
    Ok(Value::NIL)
}

fn kernel_p(rt: &mut Runtime, _recv: Value, args: &[Value]) -> RunResult<Value> {
    for &value in args {
        let text = format!("{}\n", rt.inspect(value));
        rt.write_output(&text);
    }
    Ok(match args {
        [] => Value::NIL,
        [single] => *single,
        many => rt.ary_new(many.to_vec()),
    })
}

fn kernel_raise(rt: &mut Runtime, _recv: Value, args: &[Value]) -> RunResult<Value> {
    check_args(rt, args, 0, 2)?;
    Err(match args {
        [] => rt.raise(rt.core.runtime_error, "unhandled exception"),
        [value] => rt.raise_object(*value),
        [class, message, ..] => {
            let Some(class) = rt.class_id(*class) else {
                return Err(rt.raise(rt.core.type_error, "exception class expected"));
            };
            let message = rt.to_s(*message);
            rt.raise(class, message)
        }
    })
}

fn kernel_block_given(rt: &mut Runtime, _recv: Value, _args: &[Value]) -> RunResult<Value> {
    let caller = rt.thread.frames.iter().rev().nth(1);
    Ok(Value::from_bool(caller.is_some_and(|frame| frame.block.is_some())))
}

fn kernel_proc(rt: &mut Runtime, _recv: Value, _args: &[Value]) -> RunResult<Value> {
    match rt.thread.frames.iter().rev().nth(1).and_then(|frame| frame.block.clone()) {
        Some(block) => Ok(rt.proc_new(block)),
        None => Err(rt.raise(
            rt.core.argument_error,
            "tried to create Proc object without a block",
        )),
    }
}

fn kernel_loop(rt: &mut Runtime, _recv: Value, _args: &[Value]) -> RunResult<Value> {
    let block = rt.block_given()?;
    loop {
        rt.yield_values(&block, &[])?;
    }
}

fn object_send(rt: &mut Runtime, recv: Value, args: &[Value]) -> RunResult<Value> {
    let Some((&name, rest)) = args.split_first() else {
        return Err(rt.argument_error(0, 1, None));
    };
    let mid = match (name.as_symbol(), rt.heap.string(name)) {
        (Some(sym), _) => sym,
        (None, Some(s)) => rt.intern(s),
        (None, None) => {
            let text = rt.inspect(name);
            return Err(rt.raise(rt.core.type_error, format!("{} is not a symbol nor a string", text)));
        }
    };
    let block = rt.thread.current_block().cloned();
    rt.invoke(recv, mid, rest, block)
}

fn object_eq(rt: &mut Runtime, recv: Value, args: &[Value]) -> RunResult<Value> {
    check_args(rt, args, 1, 1)?;
    Ok(Value::from_bool(rt.values_equal(recv, args[0])))
}

fn object_neq(rt: &mut Runtime, recv: Value, args: &[Value]) -> RunResult<Value> {
    check_args(rt, args, 1, 1)?;
    let eq = rt.intern("==");
    let result = rt.invoke(recv, eq, args, None)?;
    Ok(Value::from_bool(!result.truthy()))
}

fn object_not(_rt: &mut Runtime, recv: Value, _args: &[Value]) -> RunResult<Value> {
    Ok(Value::from_bool(!recv.truthy()))
}

fn object_is_nil(_rt: &mut Runtime, recv: Value, _args: &[Value]) -> RunResult<Value> {
    Ok(Value::from_bool(recv.is_nil()))
}

fn object_is_a(rt: &mut Runtime, recv: Value, args: &[Value]) -> RunResult<Value> {
    check_args(rt, args, 1, 1)?;
    match rt.class_id(args[0]) {
        Some(class) => Ok(Value::from_bool(rt.is_a(recv, class))),
        None => Err(rt.raise(rt.core.type_error, "class or module required")),
    }
}

fn object_class(rt: &mut Runtime, recv: Value, _args: &[Value]) -> RunResult<Value> {
    let class = rt.class_of(recv);
    Ok(rt.classes.get(class).object)
}

fn object_inspect(rt: &mut Runtime, recv: Value, _args: &[Value]) -> RunResult<Value> {
    let text = rt.inspect(recv);
    Ok(rt.str_new(&text))
}

fn object_to_s(rt: &mut Runtime, recv: Value, _args: &[Value]) -> RunResult<Value> {
    if rt.heap.string(recv).is_some() {
        return Ok(recv);
    }
    let text = rt.to_s(recv);
    Ok(rt.str_new(&text))
}

fn proc_call(rt: &mut Runtime, recv: Value, args: &[Value]) -> RunResult<Value> {
    let block = rt.proc_block(recv)?;
    rt.yield_values(&block, args)
}

fn exception_message(rt: &mut Runtime, recv: Value, _args: &[Value]) -> RunResult<Value> {
    let message = rt.exception_message(recv);
    Ok(rt.str_new(&message))
}

// ============================================================================
// Integer
// ============================================================================

fn define_integer(rt: &mut Runtime) {
    let integer = rt.core.integer;
    rt.define_builtin(integer, "+", int_plus);
    rt.define_builtin(integer, "-", int_minus);
    rt.define_builtin(integer, "*", int_mult);
    rt.define_builtin(integer, "/", int_div);
    rt.define_builtin(integer, "%", int_mod);
    rt.define_builtin(integer, "<", int_lt);
    rt.define_builtin(integer, "<=", int_le);
    rt.define_builtin(integer, ">", int_gt);
    rt.define_builtin(integer, ">=", int_ge);
    rt.define_builtin(integer, "times", int_times);
    rt.define_builtin(integer, "upto", int_upto);
    rt.define_builtin(integer, "succ", int_succ);
}

fn operands(rt: &mut Runtime, recv: Value, args: &[Value]) -> RunResult<(BigInt, BigInt)> {
    check_args(rt, args, 1, 1)?;
    match (rt.big(recv), rt.big(args[0])) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => {
            let name = class_name(rt, args[0]);
            Err(rt.raise(
                rt.core.type_error,
                format!("{} can't be coerced into Integer", name),
            ))
        }
    }
}

fn int_plus(rt: &mut Runtime, recv: Value, args: &[Value]) -> RunResult<Value> {
    let (a, b) = operands(rt, recv, args)?;
    Ok(rt.integer(a + b))
}

fn int_minus(rt: &mut Runtime, recv: Value, args: &[Value]) -> RunResult<Value> {
    let (a, b) = operands(rt, recv, args)?;
    Ok(rt.integer(a - b))
}

fn int_mult(rt: &mut Runtime, recv: Value, args: &[Value]) -> RunResult<Value> {
    let (a, b) = operands(rt, recv, args)?;
    Ok(rt.integer(a * b))
}

/// Floored quotient and remainder.
fn divmod(rt: &mut Runtime, recv: Value, args: &[Value]) -> RunResult<(BigInt, BigInt)> {
    let (a, b) = operands(rt, recv, args)?;
    let zero = BigInt::from(0);
    if b == zero {
        return Err(rt.raise(rt.core.zero_division_error, "divided by 0"));
    }
    let mut q = &a / &b;
    let mut r = &a % &b;
    if r != zero && (r < zero) != (b < zero) {
        q -= 1;
        r += &b;
    }
    Ok((q, r))
}

fn int_div(rt: &mut Runtime, recv: Value, args: &[Value]) -> RunResult<Value> {
    let (q, _) = divmod(rt, recv, args)?;
    Ok(rt.integer(q))
}

fn int_mod(rt: &mut Runtime, recv: Value, args: &[Value]) -> RunResult<Value> {
    let (_, r) = divmod(rt, recv, args)?;
    Ok(rt.integer(r))
}

fn compare(
    rt: &mut Runtime,
    recv: Value,
    args: &[Value],
    test: fn(&BigInt, &BigInt) -> bool,
) -> RunResult<Value> {
    check_args(rt, args, 1, 1)?;
    match (rt.big(recv), rt.big(args[0])) {
        (Some(a), Some(b)) => Ok(Value::from_bool(test(&a, &b))),
        _ => {
            let name = class_name(rt, args[0]);
            Err(rt.raise(
                rt.core.argument_error,
                format!("comparison of Integer with {} failed", name),
            ))
        }
    }
}

fn int_lt(rt: &mut Runtime, recv: Value, args: &[Value]) -> RunResult<Value> {
    compare(rt, recv, args, |a, b| a < b)
}

fn int_le(rt: &mut Runtime, recv: Value, args: &[Value]) -> RunResult<Value> {
    compare(rt, recv, args, |a, b| a <= b)
}

fn int_gt(rt: &mut Runtime, recv: Value, args: &[Value]) -> RunResult<Value> {
    compare(rt, recv, args, |a, b| a > b)
}

fn int_ge(rt: &mut Runtime, recv: Value, args: &[Value]) -> RunResult<Value> {
    compare(rt, recv, args, |a, b| a >= b)
}

fn int_times(rt: &mut Runtime, recv: Value, _args: &[Value]) -> RunResult<Value> {
    let block = rt.block_given()?;
    let n = recv.as_fixnum().unwrap_or(0);
    for i in 0..n {
        let i = rt.int(i);
        rt.yield_values(&block, &[i])?;
    }
    Ok(recv)
}

fn int_upto(rt: &mut Runtime, recv: Value, args: &[Value]) -> RunResult<Value> {
    check_args(rt, args, 1, 1)?;
    let block = rt.block_given()?;
    let (Some(from), Some(to)) = (recv.as_fixnum(), args[0].as_fixnum()) else {
        return Err(rt.raise(rt.core.type_error, "upto expects fixnum bounds"));
    };
    for i in from..=to {
        let i = rt.int(i);
        rt.yield_values(&block, &[i])?;
    }
    Ok(recv)
}

fn int_succ(rt: &mut Runtime, recv: Value, _args: &[Value]) -> RunResult<Value> {
    let one = Value::fixnum(1).unwrap_or(Value::NIL);
    int_plus(rt, recv, &[one])
}

// ============================================================================
// String
// ============================================================================

fn define_string(rt: &mut Runtime) {
    let string = rt.core.string;
    rt.define_builtin(string, "+", str_plus);
    rt.define_builtin(string, "<<", str_append);
    rt.define_builtin(string, "length", str_length);
    rt.define_builtin(string, "size", str_length);
}

fn string_arg(rt: &mut Runtime, args: &[Value]) -> RunResult<String> {
    check_args(rt, args, 1, 1)?;
    match rt.heap.string(args[0]) {
        Some(s) => Ok(s.to_string()),
        None => {
            let name = class_name(rt, args[0]);
            Err(rt.raise(
                rt.core.type_error,
                format!("no implicit conversion of {} into String", name),
            ))
        }
    }
}

fn str_plus(rt: &mut Runtime, recv: Value, args: &[Value]) -> RunResult<Value> {
    let tail = string_arg(rt, args)?;
    let text = format!("{}{}", rt.heap.string(recv).unwrap_or_default(), tail);
    Ok(rt.str_new(&text))
}

fn str_append(rt: &mut Runtime, recv: Value, args: &[Value]) -> RunResult<Value> {
    let tail = string_arg(rt, args)?;
    if let Some(object) = rt.heap.get_mut(recv)
        && let ObjectKind::String(s) = &mut object.kind
    {
        s.push_str(&tail);
    }
    Ok(recv)
}

fn str_length(rt: &mut Runtime, recv: Value, _args: &[Value]) -> RunResult<Value> {
    let len = rt.heap.string(recv).map_or(0, |s| s.chars().count());
    Ok(rt.int(len as i64))
}

// ============================================================================
// Array
// ============================================================================

fn define_array(rt: &mut Runtime) {
    let array = rt.core.array;
    rt.define_builtin(array, "each", ary_each);
    rt.define_builtin(array, "each_with_index", ary_each_with_index);
    rt.define_builtin(array, "map", ary_map);
    rt.define_builtin(array, "[]", ary_aref);
    rt.define_builtin(array, "[]=", ary_aset);
    rt.define_builtin(array, "<<", ary_push);
    rt.define_builtin(array, "push", ary_push);
    rt.define_builtin(array, "pop", ary_pop);
    rt.define_builtin(array, "length", ary_length);
    rt.define_builtin(array, "size", ary_length);
    rt.define_builtin(array, "empty?", ary_is_empty);
    rt.define_builtin(array, "first", ary_first);
    rt.define_builtin(array, "last", ary_last);
    rt.define_builtin(array, "include?", ary_include);
    rt.define_builtin(array, "sum", ary_sum);
    rt.define_builtin(array, "join", ary_join);
}

fn ary_len(rt: &Runtime, ary: Value) -> usize {
    rt.heap.array(ary).map_or(0, <[Value]>::len)
}

fn ary_at(rt: &Runtime, ary: Value, i: usize) -> Value {
    rt.heap
        .array(ary)
        .and_then(|items| items.get(i).copied())
        .unwrap_or(Value::NIL)
}

fn ary_each(rt: &mut Runtime, recv: Value, _args: &[Value]) -> RunResult<Value> {
    let block = rt.block_given()?;
    let mut i = 0;
    while i < ary_len(rt, recv) {
        let item = ary_at(rt, recv, i);
        rt.yield_values(&block, &[item])?;
        i += 1;
    }
    Ok(recv)
}

fn ary_each_with_index(rt: &mut Runtime, recv: Value, _args: &[Value]) -> RunResult<Value> {
    let block = rt.block_given()?;
    let mut i = 0;
    while i < ary_len(rt, recv) {
        let item = ary_at(rt, recv, i);
        let index = rt.int(i as i64);
        rt.yield_values(&block, &[item, index])?;
        i += 1;
    }
    Ok(recv)
}

fn ary_map(rt: &mut Runtime, recv: Value, _args: &[Value]) -> RunResult<Value> {
    let block = rt.block_given()?;
    let result = rt.ary_new(Vec::new());
    rt.pinned(result, |rt| {
        let mut i = 0;
        while i < ary_len(rt, recv) {
            let item = ary_at(rt, recv, i);
            let mapped = rt.yield_values(&block, &[item])?;
            if let Some(items) = rt.heap.array_mut(result) {
                items.push(mapped);
            }
            i += 1;
        }
        Ok(result)
    })
}

fn ary_aref(rt: &mut Runtime, recv: Value, args: &[Value]) -> RunResult<Value> {
    check_args(rt, args, 1, 1)?;
    match index_fast(rt, recv, args[0]) {
        value if value.is_undef() => {
            let name = class_name(rt, args[0]);
            Err(rt.raise(
                rt.core.type_error,
                format!("no implicit conversion of {} into Integer", name),
            ))
        }
        value => Ok(value),
    }
}

fn ary_aset(rt: &mut Runtime, recv: Value, args: &[Value]) -> RunResult<Value> {
    check_args(rt, args, 2, 2)?;
    let (index, value) = (args[0], args[1]);
    if !index_set_fast(rt, recv, index, value).is_undef() {
        return Ok(value);
    }
    let Some(i) = index.as_fixnum() else {
        let name = class_name(rt, index);
        return Err(rt.raise(
            rt.core.type_error,
            format!("no implicit conversion of {} into Integer", name),
        ));
    };
    let len = ary_len(rt, recv) as i64;
    if i < 0 {
        return Err(rt.raise(
            rt.core.index_error,
            format!("index {} too small for array; minimum: -{}", i, len),
        ));
    }
    if let Some(items) = rt.heap.array_mut(recv) {
        items.resize(i as usize, Value::NIL);
        items.push(value);
    }
    Ok(value)
}

fn ary_push(rt: &mut Runtime, recv: Value, args: &[Value]) -> RunResult<Value> {
    if let Some(items) = rt.heap.array_mut(recv) {
        items.extend_from_slice(args);
    }
    Ok(recv)
}

fn ary_pop(rt: &mut Runtime, recv: Value, _args: &[Value]) -> RunResult<Value> {
    Ok(rt
        .heap
        .array_mut(recv)
        .and_then(Vec::pop)
        .unwrap_or(Value::NIL))
}

fn ary_length(rt: &mut Runtime, recv: Value, _args: &[Value]) -> RunResult<Value> {
    let len = ary_len(rt, recv);
    Ok(rt.int(len as i64))
}

fn ary_is_empty(rt: &mut Runtime, recv: Value, _args: &[Value]) -> RunResult<Value> {
    Ok(Value::from_bool(ary_len(rt, recv) == 0))
}

fn ary_first(rt: &mut Runtime, recv: Value, _args: &[Value]) -> RunResult<Value> {
    Ok(ary_at(rt, recv, 0))
}

fn ary_last(rt: &mut Runtime, recv: Value, _args: &[Value]) -> RunResult<Value> {
    let len = ary_len(rt, recv);
    Ok(match len {
        0 => Value::NIL,
        len => ary_at(rt, recv, len - 1),
    })
}

fn ary_include(rt: &mut Runtime, recv: Value, args: &[Value]) -> RunResult<Value> {
    check_args(rt, args, 1, 1)?;
    let found = rt
        .heap
        .array(recv)
        .is_some_and(|items| items.iter().any(|&item| rt.values_equal(item, args[0])));
    Ok(Value::from_bool(found))
}

fn ary_sum(rt: &mut Runtime, recv: Value, _args: &[Value]) -> RunResult<Value> {
    let plus = rt.intern("+");
    let mut acc = Value::fixnum(0).unwrap_or(Value::NIL);
    let mut i = 0;
    while i < ary_len(rt, recv) {
        let item = ary_at(rt, recv, i);
        acc = rt.invoke(acc, plus, &[item], None)?;
        i += 1;
    }
    Ok(acc)
}

fn ary_join(rt: &mut Runtime, recv: Value, args: &[Value]) -> RunResult<Value> {
    check_args(rt, args, 0, 1)?;
    let separator = match args.first() {
        Some(&sep) => rt.to_s(sep),
        None => String::new(),
    };
    let parts: Vec<String> = rt
        .heap
        .array(recv)
        .unwrap_or_default()
        .iter()
        .map(|&item| rt.to_s(item))
        .collect();
    let text = parts.join(&separator);
    Ok(rt.str_new(&text))
}

// ============================================================================
// Hash
// ============================================================================

fn define_hash(rt: &mut Runtime) {
    let hash = rt.core.hash;
    rt.define_builtin(hash, "[]", hash_aref);
    rt.define_builtin(hash, "[]=", hash_aset);
    rt.define_builtin(hash, "each", hash_each);
    rt.define_builtin(hash, "length", hash_length);
    rt.define_builtin(hash, "size", hash_length);
    rt.define_builtin(hash, "keys", hash_keys);
    rt.define_builtin(hash, "values", hash_values);
    rt.define_builtin(hash, "key?", hash_has_key);
}

fn hash_aref(rt: &mut Runtime, recv: Value, args: &[Value]) -> RunResult<Value> {
    check_args(rt, args, 1, 1)?;
    Ok(index_fast(rt, recv, args[0]))
}

fn hash_aset(rt: &mut Runtime, recv: Value, args: &[Value]) -> RunResult<Value> {
    check_args(rt, args, 2, 2)?;
    Ok(index_set_fast(rt, recv, args[0], args[1]))
}

fn hash_entry(rt: &Runtime, hash: Value, i: usize) -> Option<(Value, Value)> {
    rt.heap.hash(hash)?.entries().get(i).copied()
}

fn hash_each(rt: &mut Runtime, recv: Value, _args: &[Value]) -> RunResult<Value> {
    let block = rt.block_given()?;
    let mut i = 0;
    while let Some((k, v)) = hash_entry(rt, recv, i) {
        rt.yield_values(&block, &[k, v])?;
        i += 1;
    }
    Ok(recv)
}

fn hash_length(rt: &mut Runtime, recv: Value, _args: &[Value]) -> RunResult<Value> {
    let len = rt.heap.hash(recv).map_or(0, |table| table.len());
    Ok(rt.int(len as i64))
}

fn hash_keys(rt: &mut Runtime, recv: Value, _args: &[Value]) -> RunResult<Value> {
    let keys = rt
        .heap
        .hash(recv)
        .map(|table| table.entries().iter().map(|(k, _)| *k).collect())
        .unwrap_or_default();
    Ok(rt.ary_new(keys))
}

fn hash_values(rt: &mut Runtime, recv: Value, _args: &[Value]) -> RunResult<Value> {
    let values = rt
        .heap
        .hash(recv)
        .map(|table| table.entries().iter().map(|(_, v)| *v).collect())
        .unwrap_or_default();
    Ok(rt.ary_new(values))
}

fn hash_has_key(rt: &mut Runtime, recv: Value, args: &[Value]) -> RunResult<Value> {
    check_args(rt, args, 1, 1)?;
    let key = rt.heap.hash_key(args[0]);
    let found = rt
        .heap
        .hash(recv)
        .is_some_and(|table| table.get(&key).is_some());
    Ok(Value::from_bool(found))
}

// ============================================================================
// Class
// ============================================================================

fn define_class(rt: &mut Runtime) {
    let class = rt.core.class;
    rt.define_builtin(class, "new", class_new);
    rt.define_builtin(class, "name", class_name_method);
}

fn class_new(rt: &mut Runtime, recv: Value, args: &[Value]) -> RunResult<Value> {
    let Some(class) = rt.class_id(recv) else {
        return Err(rt.fatal("Class#new on a non-class"));
    };
    if rt.classes.is_subclass(class, rt.core.exception) {
        check_args(rt, args, 0, 1)?;
        let message = match args.first() {
            Some(&message) => rt.to_s(message),
            None => rt.classes.get(class).name.to_string(),
        };
        return Ok(rt.exception_new(class, message));
    }
    instantiate(rt, class, args)
}

fn instantiate(rt: &mut Runtime, class: ClassId, args: &[Value]) -> RunResult<Value> {
    let object = rt.heap.alloc(class, ObjectKind::Instance);
    let initialize = rt.intern("initialize");
    if rt.classes.find_method(class, initialize).is_some() {
        let block = rt.thread.current_block().cloned();
        rt.invoke(object, initialize, args, block)?;
    } else if !args.is_empty() {
        return Err(rt.argument_error(args.len(), 0, Some(0)));
    }
    Ok(object)
}

fn class_name_method(rt: &mut Runtime, recv: Value, _args: &[Value]) -> RunResult<Value> {
    let text = rt.to_s(recv);
    Ok(rt.str_new(&text))
}

#[cfg(test)]
mod tests {
    use crate::runtime::{Runtime, RuntimeConfig};
    use crate::value::Value;

    fn int(n: i64) -> Value {
        Value::fixnum(n).unwrap()
    }

    fn call(rt: &mut Runtime, recv: Value, name: &str, args: &[Value]) -> Value {
        rt.call_method(recv, name, args).unwrap()
    }

    #[test]
    fn test_integer_division_floors() {
        let mut rt = Runtime::new(RuntimeConfig::default());
        assert_eq!(call(&mut rt, int(-7), "/", &[int(2)]), int(-4));
        assert_eq!(call(&mut rt, int(-7), "%", &[int(2)]), int(1));
        assert_eq!(call(&mut rt, int(7), "%", &[int(-2)]), int(-1));
        let err = rt.call_method(int(1), "/", &[int(0)]).unwrap_err();
        assert_eq!(err.to_string(), "ZeroDivisionError: divided by 0");
    }

    #[test]
    fn test_integer_overflow_promotes_to_bignum() {
        let mut rt = Runtime::new(RuntimeConfig::default());
        let big = call(&mut rt, int(Value::FIXNUM_MAX), "+", &[int(1)]);
        assert!(!big.is_fixnum());
        let back = call(&mut rt, big, "-", &[int(1)]);
        assert_eq!(back, int(Value::FIXNUM_MAX));
    }

    #[test]
    fn test_puts_and_p_output() {
        let mut rt = Runtime::new(RuntimeConfig::default());
        let main = rt.main_object();
        let s = rt.str_new("hi");
        let ary = rt.ary_new(vec![int(1), s]);
        call(&mut rt, main, "puts", &[ary]);
        call(&mut rt, main, "p", &[ary]);
        assert_eq!(rt.take_output(), "1\nhi\n[1, \"hi\"]\n");
    }

    #[test]
    fn test_array_store_pads_with_nil() {
        let mut rt = Runtime::new(RuntimeConfig::default());
        let ary = rt.ary_new(vec![]);
        call(&mut rt, ary, "[]=", &[int(2), int(5)]);
        assert_eq!(rt.inspect(ary), "[nil, nil, 5]");
        let err = rt.call_method(ary, "[]=", &[int(-9), int(1)]).unwrap_err();
        assert!(err.to_string().starts_with("IndexError"));
    }

    #[test]
    fn test_exception_new_and_message() {
        let mut rt = Runtime::new(RuntimeConfig::default());
        let class = rt.classes.get(rt.core.argument_error).object;
        let msg = rt.str_new("bad");
        let exc = call(&mut rt, class, "new", &[msg]);
        let message = call(&mut rt, exc, "message", &[]);
        assert_eq!(rt.heap.string(message), Some("bad"));
        assert!(rt.is_a(exc, rt.core.standard_error));
    }

    #[test]
    fn test_string_concat_rejects_non_string() {
        let mut rt = Runtime::new(RuntimeConfig::default());
        let s = rt.str_new("a");
        let err = rt.call_method(s, "+", &[int(1)]).unwrap_err();
        assert_eq!(err.to_string(), "TypeError: no implicit conversion of Integer into String");
    }
}
