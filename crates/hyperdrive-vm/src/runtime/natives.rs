// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Runtime entry points reachable from native code, and the fast paths
//! shared with the interpreter's specialized instructions.

use super::heap::HashKey;
use super::thread::Block;
use super::Runtime;
use crate::backend::{FuncId, Ptr, RuntimeFn};
use crate::error::{RunResult, State};
use crate::iseq::Instruction;
use crate::value::Value;

impl Runtime {
    /// Executes a runtime call made by native code. Arguments and the result
    /// are raw words.
    pub(crate) fn call_runtime(&mut self, target: &RuntimeFn, words: &[u64]) -> RunResult<u64> {
        self.safepoint();
        let value = |i: usize| Value::from_raw(words.get(i).copied().unwrap_or(Value::NIL.raw()));
        let values = |from: usize| -> Vec<Value> {
            words.get(from..).unwrap_or_default().iter().map(|&w| Value::from_raw(w)).collect()
        };

        let result = match target {
            RuntimeFn::Invoke { mid, .. } => self.invoke(value(0), *mid, &values(1), None)?,
            RuntimeFn::InvokeIterBlock { mid, .. } => {
                let block = self.thread.iter_blocks.last().cloned();
                self.invoke(value(0), *mid, &values(1), block)?
            }
            RuntimeFn::InvokeWithProc { mid, .. } => {
                let proc = value(1);
                let block = (!proc.is_nil()).then_some(Block::Proc(proc));
                self.invoke(value(0), *mid, &values(2), block)?
            }
            RuntimeFn::Iterate => {
                let trampoline = FuncId::from_word(words.first().copied().unwrap_or(0));
                let iter_arg = Ptr::from_raw(words.get(1).copied().unwrap_or(0));
                let body = FuncId::from_word(words.get(2).copied().unwrap_or(0));
                let block = Block::Native {
                    body,
                    scope: value(3),
                };
                self.iterate(trampoline, iter_arg, block)?
            }
            RuntimeFn::ProcNew => {
                let body = FuncId::from_word(words.first().copied().unwrap_or(0));
                self.proc_new(Block::Native {
                    body,
                    scope: value(1),
                })
            }
            RuntimeFn::Yield { .. } => self.yield_current(&values(0))?,
            RuntimeFn::Literal(literal) => self.literal(literal),
            RuntimeFn::StrNew(s) => self.str_new(s),
            RuntimeFn::ArrayNew { .. } => self.ary_new(values(0)),
            RuntimeFn::HashNew { .. } => self.hash_new(&values(0)),
            RuntimeFn::Constant(name) => self.constant(*name)?,
            RuntimeFn::ArrayFromMemory => {
                let ptr = Ptr::from_raw(words.first().copied().unwrap_or(0));
                let count = words.get(1).copied().unwrap_or(0) as i64;
                let items = (0..count)
                    .map(|i| self.memory.read(ptr.add(i)).map(Value::from_raw))
                    .collect::<Option<Vec<_>>>();
                match items {
                    Some(items) => self.ary_new(items),
                    None => return Err(self.fatal(format!("array read out of bounds at {:?}", ptr))),
                }
            }
            RuntimeFn::ArrayEntry { index } => self
                .heap
                .array(value(0))
                .and_then(|items| items.get(*index as usize).copied())
                .unwrap_or(Value::NIL),
            RuntimeFn::IndexFast => index_fast(self, value(0), value(1)),
            RuntimeFn::IndexSetFast => index_set_fast(self, value(0), value(1), value(2)),
            RuntimeFn::PushFast => push_fast(self, value(0), value(1)),
            RuntimeFn::AllocZeroed => {
                let words = words.first().copied().unwrap_or(0) as usize;
                return Ok(self.memory.alloc(words).raw());
            }
            RuntimeFn::WrapScope => {
                let ptr = Ptr::from_raw(words.first().copied().unwrap_or(0));
                self.wrap_block(ptr)
            }
            RuntimeFn::ScopePtr => return Ok(self.data_ptr(value(0))?.raw()),
            RuntimeFn::DynGet => {
                let key = HashKey::Word(value(1).raw());
                self.heap
                    .hash(value(0))
                    .and_then(|table| table.get(&key))
                    .unwrap_or(Value::NIL)
            }
            RuntimeFn::DynSet => {
                let (sym, val) = (value(1), value(2));
                match self.heap.hash_mut(value(0)) {
                    Some(table) => table.insert(HashKey::Word(sym.raw()), sym, val),
                    None => return Err(self.fatal("dynamic variable table missing")),
                }
                val
            }
            RuntimeFn::Throw { state } => {
                return Err(match (*state, State::from_code(*state)) {
                    (0, _) => self.raise_object(value(0)),
                    (_, Some(state)) => self.throw_state(state, value(0)),
                    (code, None) => self.fatal(format!("throw with state {}", code)),
                });
            }
            RuntimeFn::Rethrow => return Err(self.rethrow(value(0), value(1))),
            RuntimeFn::ArityError { min, max } => {
                let given = words.first().copied().unwrap_or(0) as usize;
                return Err(self.argument_error(given, *min as usize, max.map(|max| max as usize)));
            }
            RuntimeFn::Payload => {
                let code = words.first().copied().unwrap_or(0) as u32;
                State::from_code(code)
                    .map(|state| self.payload(state))
                    .unwrap_or(Value::NIL)
            }
            RuntimeFn::SplatParams { count, rest } => {
                let params = self.splat_params(value(0), *count as usize, *rest);
                self.ary_new(params)
            }
        };
        Ok(result.raw())
    }
}

/// `recv[index]` for arrays and hashes, `UNDEF` for anything else.
pub(crate) fn index_fast(rt: &Runtime, recv: Value, index: Value) -> Value {
    if let Some(items) = rt.heap.array(recv) {
        let Some(i) = index.as_fixnum() else {
            return Value::UNDEF;
        };
        let i = if i < 0 { i + items.len() as i64 } else { i };
        return usize::try_from(i)
            .ok()
            .and_then(|i| items.get(i).copied())
            .unwrap_or(Value::NIL);
    }
    if let Some(table) = rt.heap.hash(recv) {
        return table.get(&rt.heap.hash_key(index)).unwrap_or(Value::NIL);
    }
    Value::UNDEF
}

/// `recv[index] = value` for arrays (within bounds or appending) and
/// hashes, `UNDEF` for anything else.
pub(crate) fn index_set_fast(rt: &mut Runtime, recv: Value, index: Value, value: Value) -> Value {
    let key = rt.heap.hash_key(index);
    if let Some(table) = rt.heap.hash_mut(recv) {
        table.insert(key, index, value);
        return value;
    }
    let (Some(items), Some(i)) = (rt.heap.array_mut(recv), index.as_fixnum()) else {
        return Value::UNDEF;
    };
    let i = if i < 0 { i + items.len() as i64 } else { i };
    match usize::try_from(i) {
        Ok(i) if i < items.len() => items[i] = value,
        Ok(i) if i == items.len() => items.push(value),
        _ => return Value::UNDEF,
    }
    value
}

/// `recv << value` for arrays, `UNDEF` for anything else.
pub(crate) fn push_fast(rt: &mut Runtime, recv: Value, value: Value) -> Value {
    match rt.heap.array_mut(recv) {
        Some(items) => {
            items.push(value);
            recv
        }
        None => Value::UNDEF,
    }
}

/// Result of a specialized instruction when its operands allow the fast
/// path, or `None` to fall back to a method call.
pub(crate) fn specialized(rt: &mut Runtime, op: &Instruction, operands: &[Value]) -> Option<Value> {
    let fixnums = || {
        let a = operands.first()?.as_fixnum()?;
        let b = operands.get(1)?.as_fixnum()?;
        Some((a, b))
    };
    let defined = |v: Value| (!v.is_undef()).then_some(v);
    match op {
        Instruction::OptPlus => fixnums().and_then(|(a, b)| Value::fixnum(a.checked_add(b)?)),
        Instruction::OptMinus => fixnums().and_then(|(a, b)| Value::fixnum(a.checked_sub(b)?)),
        Instruction::OptMult => fixnums().and_then(|(a, b)| Value::fixnum(a.checked_mul(b)?)),
        Instruction::OptLt => fixnums().map(|(a, b)| Value::from_bool(a < b)),
        Instruction::OptLe => fixnums().map(|(a, b)| Value::from_bool(a <= b)),
        Instruction::OptGt => fixnums().map(|(a, b)| Value::from_bool(a > b)),
        Instruction::OptGe => fixnums().map(|(a, b)| Value::from_bool(a >= b)),
        Instruction::OptEq => fixnums().map(|(a, b)| Value::from_bool(a == b)),
        Instruction::OptNeq => fixnums().map(|(a, b)| Value::from_bool(a != b)),
        Instruction::OptSucc => operands
            .first()?
            .as_fixnum()
            .and_then(|n| Value::fixnum(n.checked_add(1)?)),
        Instruction::OptNot => Some(Value::from_bool(!operands.first()?.truthy())),
        Instruction::OptAref => defined(index_fast(rt, operands[0], *operands.get(1)?)),
        Instruction::OptAset => {
            defined(index_set_fast(rt, operands[0], *operands.get(1)?, *operands.get(2)?))
        }
        Instruction::OptLtlt => defined(push_fast(rt, operands[0], *operands.get(1)?)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeConfig;

    fn int(n: i64) -> Value {
        Value::fixnum(n).unwrap()
    }

    #[test]
    fn test_index_fast_handles_negative_and_missing() {
        let mut rt = Runtime::new(RuntimeConfig::default());
        let ary = rt.ary_new(vec![int(1), int(2), int(3)]);
        assert_eq!(index_fast(&rt, ary, int(-1)), int(3));
        assert_eq!(index_fast(&rt, ary, int(7)), Value::NIL);
        assert_eq!(index_fast(&rt, int(5), int(0)), Value::UNDEF);

        let key = rt.str_new("k");
        let hash = rt.hash_new(&[key, int(9)]);
        let probe = rt.str_new("k");
        assert_eq!(index_fast(&rt, hash, probe), int(9));
    }

    #[test]
    fn test_index_set_fast_appends_but_not_past_end() {
        let mut rt = Runtime::new(RuntimeConfig::default());
        let ary = rt.ary_new(vec![int(1)]);
        assert_eq!(index_set_fast(&mut rt, ary, int(1), int(2)), int(2));
        assert_eq!(index_set_fast(&mut rt, ary, int(5), int(2)), Value::UNDEF);
        assert_eq!(rt.heap.array(ary), Some(&[int(1), int(2)][..]));
    }

    #[test]
    fn test_specialized_overflow_falls_back() {
        let mut rt = Runtime::new(RuntimeConfig::default());
        let max = int(Value::FIXNUM_MAX);
        assert_eq!(specialized(&mut rt, &Instruction::OptPlus, &[max, int(1)]), None);
        assert_eq!(specialized(&mut rt, &Instruction::OptPlus, &[int(2), int(3)]), Some(int(5)));
        assert_eq!(specialized(&mut rt, &Instruction::OptLt, &[int(2), int(3)]), Some(Value::TRUE));
        assert_eq!(specialized(&mut rt, &Instruction::OptNot, &[Value::NIL]), Some(Value::TRUE));
    }

    #[test]
    fn test_dynamic_variable_table() {
        let mut rt = Runtime::new(RuntimeConfig::default());
        let table = rt.hash_new(&[]);
        let sym = Value::symbol(rt.intern("v"));
        let get = RuntimeFn::DynGet;
        assert_eq!(rt.call_runtime(&get, &[table.raw(), sym.raw()]), Ok(Value::NIL.raw()));
        rt.call_runtime(&RuntimeFn::DynSet, &[table.raw(), sym.raw(), int(4).raw()])
            .unwrap();
        assert_eq!(rt.call_runtime(&get, &[table.raw(), sym.raw()]), Ok(int(4).raw()));
    }

    #[test]
    fn test_throw_zero_raises_runtime_error() {
        let mut rt = Runtime::new(RuntimeConfig::default());
        let msg = rt.str_new("bad");
        let jump = rt
            .call_runtime(&RuntimeFn::Throw { state: 0 }, &[msg.raw()])
            .unwrap_err();
        assert_eq!(jump.state, State::Raise);
        assert_eq!(rt.exception_message(rt.thread.errinfo), "bad");
    }
}
