// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! The reference interpreter.
//!
//! Locals live in a heap-wrapped environment block (`[parent, self,
//! locals...]`) so blocks can reach them after their frame returns; the
//! operand stack lives on the value stack above a slot holding the
//! environment handle. Catch tables are consulted when an instruction
//! fails with a jump.

use std::cmp::Reverse;
use std::rc::Rc;
use std::sync::Arc;

use tracing::trace;

use super::natives;
use super::object::ENV_HEADER;
use super::thread::{Block, IseqBlock};
use super::Runtime;
use crate::backend::Ptr;
use crate::error::{Jump, RunResult, State};
use crate::iseq::{CatchEntry, CatchKind, Instruction, Iseq, Layout};
use crate::symbol::{SymbolId, SymbolTable};
use crate::value::Value;

/// Per-sequence data shared by every activation.
#[derive(Debug)]
pub(crate) struct IseqInfo {
    iseq: Arc<Iseq>,
    layout: Layout,
    names: Vec<Option<SymbolId>>,
    blocks: Vec<Arc<Iseq>>,
}

impl IseqInfo {
    pub(crate) fn new(iseq: &Arc<Iseq>, symbols: &SymbolTable) -> Self {
        Self {
            iseq: Arc::clone(iseq),
            layout: iseq.layout(),
            names: iseq
                .code
                .iter()
                .map(|insn| insn.method_name().map(|name| symbols.intern(name)))
                .collect(),
            blocks: iseq.blocks.iter().cloned().map(Arc::new).collect(),
        }
    }
}

/// Runs a top-level sequence.
pub(crate) fn run_top(rt: &mut Runtime, iseq: &Arc<Iseq>, self_value: Value) -> RunResult<Value> {
    let (env, env_ptr) = rt.new_env(Value::NIL, self_value, iseq.locals.len());
    Frame::enter(rt, iseq, env, env_ptr, self_value, None, 0)
}

/// Runs a method body with its arguments.
pub(crate) fn run_method(
    rt: &mut Runtime,
    iseq: &Arc<Iseq>,
    recv: Value,
    args: &[Value],
) -> RunResult<Value> {
    let block = rt.thread.current_block().cloned();
    let (env, env_ptr) = rt.new_env(Value::NIL, recv, iseq.locals.len());
    let start = bind_method_args(rt, iseq, env_ptr, args, block.as_ref())?;
    Frame::enter(rt, iseq, env, env_ptr, recv, block, start)
}

/// Runs a block body with a packed yield value.
pub(crate) fn run_block(rt: &mut Runtime, block: &IseqBlock, packed: Value) -> RunResult<Value> {
    let iseq = &block.iseq;
    let (env, env_ptr) = rt.new_env(block.env, block.self_value, iseq.locals.len());
    let params = &iseq.params;
    let count = params.positional_count();
    let mut start = 0;
    if count > 0 || params.rest.is_some() {
        let values = rt.splat_params(packed, count, params.rest.is_some());
        let names = params
            .required
            .iter()
            .chain(&params.optional)
            .chain(params.rest.iter());
        for (name, value) in names.zip(values) {
            set_named(rt, iseq, env_ptr, name, value);
        }
        start = params.opt_table.last().copied().unwrap_or(0);
    }
    Frame::enter(rt, iseq, env, env_ptr, block.self_value, block.outer.clone(), start)
}

fn set_named(rt: &mut Runtime, iseq: &Iseq, env_ptr: Ptr, name: &str, value: Value) {
    if let Some(index) = iseq.local_index(name) {
        rt.memory
            .write(env_ptr.add((ENV_HEADER + index) as i64), value.raw());
    }
}

fn bind_method_args(
    rt: &mut Runtime,
    iseq: &Iseq,
    env_ptr: Ptr,
    args: &[Value],
    block: Option<&Block>,
) -> RunResult<usize> {
    let params = &iseq.params;
    let (min, max) = params.arity();
    if args.len() < min || max.is_some_and(|max| args.len() > max) {
        return Err(rt.argument_error(args.len(), min, max));
    }
    let supplied = (args.len() - min).min(params.optional.len());
    let positional = params
        .required
        .iter()
        .chain(&params.optional[..supplied]);
    for (name, value) in positional.zip(args) {
        set_named(rt, iseq, env_ptr, name, *value);
    }
    if let Some(rest) = &params.rest {
        let tail = args[min + supplied..].to_vec();
        let array = rt.ary_new(tail);
        set_named(rt, iseq, env_ptr, rest, array);
    }
    if let Some(name) = &params.block {
        let value = match block {
            Some(block) => rt.proc_new(block.clone()),
            None => Value::NIL,
        };
        set_named(rt, iseq, env_ptr, name, value);
    }
    Ok(params.opt_table.get(supplied).copied().unwrap_or(0))
}

enum Step {
    Goto(usize),
    Return(Value),
}

struct Frame {
    info: Arc<IseqInfo>,
    env: Value,
    env_ptr: Ptr,
    self_value: Value,
    block: Option<Block>,
    base: usize,
}

impl Frame {
    fn enter(
        rt: &mut Runtime,
        iseq: &Arc<Iseq>,
        env: Value,
        env_ptr: Ptr,
        self_value: Value,
        block: Option<Block>,
        start: usize,
    ) -> RunResult<Value> {
        if rt.thread.depth >= rt.config.max_depth {
            return Err(rt.stack_overflow());
        }
        let base = rt.thread.sp;
        if !rt.memory.reserve_stack(base + 1) {
            return Err(rt.stack_overflow());
        }
        rt.memory.stack_mut()[base] = env.raw();
        rt.thread.sp = base + 1;
        rt.thread.depth += 1;

        let frame = Frame {
            info: rt.iseq_info(iseq),
            env,
            env_ptr,
            self_value,
            block,
            base,
        };
        let result = frame.run(rt, start);

        rt.thread.sp = base;
        rt.thread.depth -= 1;
        result
    }

    fn run(&self, rt: &mut Runtime, mut pc: usize) -> RunResult<Value> {
        loop {
            match self.step(rt, pc) {
                Ok(Step::Goto(next)) => pc = next,
                Ok(Step::Return(value)) => return Ok(value),
                Err(jump) => pc = self.catch(rt, pc, jump)?,
            }
        }
    }

    fn catch(&self, rt: &mut Runtime, pc: usize, jump: Jump) -> RunResult<usize> {
        let Some(entry) = self
            .info
            .iseq
            .catch_table
            .iter()
            .filter(|entry| entry.covers(pc) && catches(entry, jump.state))
            .min_by_key(|entry| (Reverse(entry.start), entry.end))
        else {
            return Err(jump);
        };
        trace!(iseq = %self.info.iseq.name, pc, kind = entry.kind.name(), state = jump.state.name(), "caught");
        rt.thread.sp = self.base + 1 + entry.sp;
        let payload = rt.payload(jump.state);
        match entry.kind {
            CatchKind::Rescue => self.push(rt, payload)?,
            CatchKind::Ensure => {
                self.push(rt, Value::fixnum(jump.state.code() as i64).unwrap_or(Value::NIL))?;
                self.push(rt, payload)?;
            }
            CatchKind::Break | CatchKind::Next => {
                let value = rt.take_jump_value();
                self.push(rt, value)?;
            }
            CatchKind::Retry | CatchKind::Redo => {}
        }
        Ok(match entry.kind {
            CatchKind::Rescue | CatchKind::Ensure => entry.handler.unwrap_or(entry.cont),
            _ => entry.cont,
        })
    }

    // ========================================================================
    // Operand stack
    // ========================================================================

    fn depth(&self, rt: &Runtime) -> usize {
        rt.thread.sp - self.base - 1
    }

    fn push(&self, rt: &mut Runtime, value: Value) -> RunResult<()> {
        let sp = rt.thread.sp;
        if !rt.memory.reserve_stack(sp + 1) {
            return Err(rt.stack_overflow());
        }
        rt.memory.stack_mut()[sp] = value.raw();
        rt.thread.sp = sp + 1;
        Ok(())
    }

    fn pop(&self, rt: &mut Runtime) -> RunResult<Value> {
        if self.depth(rt) == 0 {
            return Err(rt.fatal(format!("{}: operand stack underflow", self.info.iseq.name)));
        }
        rt.thread.sp -= 1;
        Ok(Value::from_raw(rt.memory.stack()[rt.thread.sp]))
    }

    fn peek(&self, rt: &mut Runtime, n: usize) -> RunResult<Value> {
        if n >= self.depth(rt) {
            return Err(rt.fatal(format!("{}: operand stack underflow", self.info.iseq.name)));
        }
        Ok(Value::from_raw(rt.memory.stack()[rt.thread.sp - 1 - n]))
    }

    /// The top `n` values, bottom first, left on the stack.
    fn operands(&self, rt: &mut Runtime, n: usize) -> RunResult<Vec<Value>> {
        if n > self.depth(rt) {
            return Err(rt.fatal(format!("{}: operand stack underflow", self.info.iseq.name)));
        }
        let sp = rt.thread.sp;
        Ok(rt.memory.stack()[sp - n..sp]
            .iter()
            .map(|&word| Value::from_raw(word))
            .collect())
    }

    /// Replaces the top `n` values with `value`.
    fn replace(&self, rt: &mut Runtime, n: usize, value: Value) -> RunResult<()> {
        rt.thread.sp -= n;
        self.push(rt, value)
    }

    // ========================================================================
    // Variables
    // ========================================================================

    fn env_at(&self, rt: &mut Runtime, level: usize) -> RunResult<Ptr> {
        let mut ptr = self.env_ptr;
        for _ in 0..level {
            let parent = rt.memory.read(ptr).map(Value::from_raw).unwrap_or(Value::NIL);
            ptr = rt.data_ptr(parent)?;
        }
        Ok(ptr)
    }

    fn local_ptr(&self, rt: &mut Runtime, index: usize, level: usize) -> RunResult<Ptr> {
        Ok(self.env_at(rt, level)?.add((ENV_HEADER + index) as i64))
    }

    fn get_local(&self, rt: &mut Runtime, index: usize, level: usize) -> RunResult<Value> {
        let ptr = self.local_ptr(rt, index, level)?;
        match rt.memory.read(ptr) {
            Some(word) => Ok(Value::from_raw(word)),
            None => Err(rt.fatal(format!("{}: bad local {}@{}", self.info.iseq.name, index, level))),
        }
    }

    fn set_local(&self, rt: &mut Runtime, index: usize, level: usize, value: Value) -> RunResult<()> {
        let ptr = self.local_ptr(rt, index, level)?;
        if rt.memory.write(ptr, value.raw()) {
            Ok(())
        } else {
            Err(rt.fatal(format!("{}: bad local {}@{}", self.info.iseq.name, index, level)))
        }
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    fn step(&self, rt: &mut Runtime, pc: usize) -> RunResult<Step> {
        let info = &self.info;
        let Some(index) = info.layout.index_of(pc) else {
            return Err(rt.fatal(format!("{}: no instruction at {}", info.iseq.name, pc)));
        };
        let insn = &info.iseq.code[index];
        let next = pc + insn.len();
        let jump_to = |offset: i32| (next as i64 + offset as i64) as usize;

        match insn {
            Instruction::Nop => {}
            Instruction::PutNil => self.push(rt, Value::NIL)?,
            Instruction::PutSelf => self.push(rt, self.self_value)?,
            Instruction::PutObject { value } => {
                let value = rt.literal(value);
                self.push(rt, value)?;
            }
            Instruction::PutString { value } => {
                let value = rt.str_new(value);
                self.push(rt, value)?;
            }
            Instruction::DupArray { values } => {
                let items = values.iter().map(|item| rt.literal(item)).collect();
                let value = rt.ary_new(items);
                self.push(rt, value)?;
            }
            Instruction::NewArray { count } => {
                let items = self.operands(rt, *count)?;
                let value = rt.ary_new(items);
                self.replace(rt, *count, value)?;
            }
            Instruction::NewHash { count } => {
                let items = self.operands(rt, *count)?;
                let value = rt.hash_new(&items);
                self.replace(rt, *count, value)?;
            }
            Instruction::GetConstant { name } => {
                let id = rt.intern(name);
                let value = rt.constant(id)?;
                self.push(rt, value)?;
            }
            Instruction::GetLocal { index } => {
                let value = self.get_local(rt, *index, 0)?;
                self.push(rt, value)?;
            }
            Instruction::SetLocal { index } => {
                let value = self.pop(rt)?;
                self.set_local(rt, *index, 0, value)?;
            }
            Instruction::GetDynamic { index, level } => {
                let value = self.get_local(rt, *index, *level)?;
                self.push(rt, value)?;
            }
            Instruction::SetDynamic { index, level } => {
                let value = self.pop(rt)?;
                self.set_local(rt, *index, *level, value)?;
            }
            Instruction::Pop => {
                self.pop(rt)?;
            }
            Instruction::Dup => {
                let value = self.peek(rt, 0)?;
                self.push(rt, value)?;
            }
            Instruction::Swap => {
                let a = self.pop(rt)?;
                let b = self.pop(rt)?;
                self.push(rt, a)?;
                self.push(rt, b)?;
            }
            Instruction::TopN { n } => {
                let value = self.peek(rt, *n)?;
                self.push(rt, value)?;
            }
            Instruction::SetN { n } => {
                let value = self.peek(rt, 0)?;
                self.peek(rt, *n)?;
                let at = rt.thread.sp - 1 - n;
                rt.memory.stack_mut()[at] = value.raw();
            }
            Instruction::Jump { offset } => return Ok(Step::Goto(jump_to(*offset))),
            Instruction::BranchIf { offset } => {
                if self.pop(rt)?.truthy() {
                    return Ok(Step::Goto(jump_to(*offset)));
                }
            }
            Instruction::BranchUnless { offset } => {
                if !self.pop(rt)?.truthy() {
                    return Ok(Step::Goto(jump_to(*offset)));
                }
            }
            Instruction::Send {
                argc,
                block,
                flags,
                ..
            } => {
                rt.safepoint();
                let mut operands = self.operands(rt, argc + 1)?;
                let recv = operands.remove(0);
                let mut args = operands;
                let mut attached = match block {
                    Some(i) => Some(Block::Iseq(Rc::new(IseqBlock {
                        iseq: Arc::clone(&info.blocks[*i]),
                        env: self.env,
                        self_value: self.self_value,
                        outer: self.block.clone(),
                    }))),
                    None => None,
                };
                if flags.blockarg {
                    let proc = args.pop().unwrap_or(Value::NIL);
                    attached = (!proc.is_nil()).then_some(Block::Proc(proc));
                }
                if flags.splat
                    && let Some(last) = args.pop()
                {
                    match rt.heap.array(last) {
                        Some(items) => args.extend_from_slice(items),
                        None => args.push(last),
                    }
                }
                let mid = self.name(rt, index)?;
                let result = rt.invoke(recv, mid, &args, attached)?;
                self.replace(rt, argc + 1, result)?;
            }
            Instruction::InvokeBlock { argc } => {
                rt.safepoint();
                let args = self.operands(rt, *argc)?;
                let Some(block) = self.block.clone() else {
                    return Err(rt.raise(rt.core.local_jump_error, "no block given (yield)"));
                };
                let result = rt.yield_values(&block, &args)?;
                self.replace(rt, *argc, result)?;
            }
            Instruction::Leave => return Ok(Step::Return(self.pop(rt)?)),
            Instruction::Throw { state } => {
                let value = self.pop(rt)?;
                return Err(match (*state, State::from_code(*state)) {
                    (0, _) => rt.raise_object(value),
                    (_, Some(state)) => rt.throw_state(state, value),
                    (code, None) => rt.fatal(format!("throw with state {}", code)),
                });
            }
            Instruction::Rethrow => {
                let payload = self.pop(rt)?;
                let state = self.pop(rt)?;
                return Err(rt.rethrow(state, payload));
            }
            op => {
                let (pops, _) = op.stack_effect();
                let operands = self.operands(rt, pops)?;
                let value = match natives::specialized(rt, op, &operands) {
                    Some(value) => value,
                    None => {
                        rt.safepoint();
                        let mid = self.name(rt, index)?;
                        rt.invoke(operands[0], mid, &operands[1..], None)?
                    }
                };
                self.replace(rt, pops, value)?;
            }
        }
        Ok(Step::Goto(next))
    }

    fn name(&self, rt: &mut Runtime, index: usize) -> RunResult<SymbolId> {
        match self.info.names.get(index).copied().flatten() {
            Some(mid) => Ok(mid),
            None => Err(rt.fatal(format!("{}: instruction {} has no method name", self.info.iseq.name, index))),
        }
    }
}

fn catches(entry: &CatchEntry, state: State) -> bool {
    match entry.kind {
        CatchKind::Rescue => state == State::Raise,
        CatchKind::Ensure => true,
        CatchKind::Retry => state == State::Retry,
        CatchKind::Break => state == State::Break,
        CatchKind::Redo => state == State::Redo,
        CatchKind::Next => state == State::Next,
    }
}

#[cfg(test)]
mod tests {
    use crate::iseq::{CatchKind, Instruction, IseqBuilder, Literal};
    use crate::runtime::{Runtime, RuntimeConfig};
    use crate::value::Value;

    fn run(b: IseqBuilder) -> Value {
        let mut rt = Runtime::new(RuntimeConfig::default());
        rt.run_main(&b.build().unwrap()).unwrap()
    }

    #[test]
    fn test_arithmetic_and_locals() {
        let mut b = IseqBuilder::top("main");
        b.int(40).setlocal("x");
        b.getlocal("x").int(2).op(Instruction::OptPlus).leave();
        assert_eq!(run(b).as_fixnum(), Some(42));
    }

    #[test]
    fn test_rescue_pushes_exception_and_continues() {
        let mut b = IseqBuilder::top("main");
        let start = b.label();
        let end = b.label();
        let handler = b.label();
        let cont = b.label();
        b.place(start);
        b.putstring("x").throw(0);
        b.place(end);
        b.place(handler);
        b.set_depth(1);
        b.pop().int(42).jump(cont);
        b.rescue(start, end, handler, cont, 0);
        b.place(cont);
        b.leave();
        assert_eq!(run(b).as_fixnum(), Some(42));
    }

    #[test]
    fn test_retry_restarts_region() {
        // x = 0; begin; x += 1; raise if x < 3; rescue; retry; end; x
        let mut b = IseqBuilder::top("main");
        b.int(0).setlocal("x");
        let start = b.label();
        let end = b.label();
        let handler = b.label();
        let cont = b.label();
        let done = b.label();
        b.place(start);
        b.getlocal("x").int(1).op(Instruction::OptPlus).setlocal("x");
        b.getlocal("x").int(3).op(Instruction::OptLt).branchunless(done);
        b.putstring("again").throw(0);
        b.place(end);
        b.place(handler);
        b.set_depth(1);
        b.pop().putnil().throw(4);
        b.rescue(start, end, handler, done, 0);
        b.region(CatchKind::Retry, handler, done, start, None, 0);
        b.place(done);
        b.getlocal("x").leave();
        assert_eq!(run(b).as_fixnum(), Some(3));
    }

    #[test]
    fn test_break_from_block() {
        // [1, 2, 3].each { |x| break 99 if x == 2 }
        let mut blk = IseqBuilder::block("block in main");
        blk.required("x");
        let skip = blk.label();
        blk.getlocal("x").int(2).op(Instruction::OptEq).branchunless(skip);
        blk.int(99).throw(2);
        blk.place(skip);
        blk.putnil().leave();
        let blk = blk.build().unwrap();

        let mut b = IseqBuilder::top("main");
        b.duparray(vec![Literal::Int(1), Literal::Int(2), Literal::Int(3)]);
        b.send_with_block("each", 0, blk);
        b.leave();
        assert_eq!(run(b).as_fixnum(), Some(99));
    }

    #[test]
    fn test_dynamic_variable_reaches_outer_local() {
        // sum = 0; [1, 2, 3].each { |x| sum += x }; sum
        let mut blk = IseqBuilder::block("block in main");
        blk.required("x");
        blk.getdynamic(0, 1).getlocal("x").op(Instruction::OptPlus).dup().setdynamic(0, 1).leave();
        let blk = blk.build().unwrap();

        let mut b = IseqBuilder::top("main");
        b.int(0).setlocal("sum");
        b.duparray(vec![Literal::Int(1), Literal::Int(2), Literal::Int(3)]);
        b.send_with_block("each", 0, blk).pop();
        b.getlocal("sum").leave();
        assert_eq!(run(b).as_fixnum(), Some(6));
    }
}
