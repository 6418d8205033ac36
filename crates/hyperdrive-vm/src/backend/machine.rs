// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! The executor for installed native code.
//!
//! Registers and frame memory live in the thread's value stack, so the
//! collector sees every word a native frame holds. Non-local exits travel
//! as `Err(Jump)`; when one reaches a frame whose tag is at the head of the
//! handler chain, execution resumes at that tag's checkpoint with the state
//! code in the checkpoint's register.

use std::sync::Arc;

use tracing::trace;

use super::builder::{BinOp, CheckedOp, Insn, UnOp};
use super::function::{CodeEntry, FuncId, FunctionBody};
use super::Ptr;
use crate::error::{Jump, RunResult, State};
use crate::runtime::{Runtime, TagRecord};
use crate::value::Value;

/// Runs the installed function `id` with the given parameter words.
pub fn execute(rt: &mut Runtime, id: FuncId, args: &[u64]) -> RunResult<u64> {
    let Some(entry) = rt.code.get(id).cloned() else {
        return Err(rt.fatal(format!("no native function {:?}", id)));
    };
    if rt.thread.depth >= rt.config.max_depth {
        return Err(rt.stack_overflow());
    }

    let body = Arc::clone(&entry.body);
    let base = rt.thread.sp;
    let top = base + body.nregs() + body.frame_words;
    if !rt.memory.reserve_stack(top) {
        return Err(rt.stack_overflow());
    }
    let stack = rt.memory.stack_mut();
    stack[base..top].fill(0);
    for (reg, arg) in body.params.iter().zip(args) {
        stack[base + reg.index()] = *arg;
    }
    trace!(function = %body.name, base, top, "enter");

    rt.thread.depth += 1;
    rt.thread.sp = top;
    let tag_base = rt.thread.tags.len();
    let saved_head = rt.thread.tag_head;
    rt.thread
        .tags
        .extend(std::iter::repeat_n(TagRecord::default(), body.ntags));

    let result = Frame {
        entry: &entry,
        body: &body,
        base,
        tag_base,
    }
    .run(rt);

    rt.thread.tags.truncate(tag_base);
    rt.thread.tag_head = saved_head;
    rt.thread.sp = base;
    rt.thread.depth -= 1;
    result
}

struct Frame<'a> {
    entry: &'a CodeEntry,
    body: &'a FunctionBody,
    base: usize,
    tag_base: usize,
}

impl Frame<'_> {
    fn get(&self, rt: &Runtime, reg: super::Reg) -> u64 {
        rt.memory.stack()[self.base + reg.index()]
    }

    fn set(&self, rt: &mut Runtime, reg: super::Reg, word: u64) {
        rt.memory.stack_mut()[self.base + reg.index()] = word;
    }

    fn run(&self, rt: &mut Runtime) -> RunResult<u64> {
        let mut pc = 0;
        loop {
            match self.step(rt, pc) {
                Ok(Flow::Next) => pc += 1,
                Ok(Flow::Goto(target)) => pc = target,
                Ok(Flow::Return(word)) => return Ok(word),
                Err(jump) => pc = self.unwind(rt, jump)?,
            }
        }
    }

    /// Finds the innermost tag of this frame with a resume point and lands
    /// there, or passes the jump to the caller.
    fn unwind(&self, rt: &mut Runtime, jump: Jump) -> RunResult<usize> {
        while let Some(head) = rt.thread.tag_head {
            if head < self.tag_base {
                break;
            }
            let record = &mut rt.thread.tags[head];
            match record.resume {
                Some((resume, dst)) if record.active => {
                    record.state = jump.state.code();
                    self.set(rt, dst, jump.state.code() as u64);
                    trace!(function = %self.body.name, state = jump.state.name(), resume, "landed");
                    return Ok(resume);
                }
                _ => {
                    record.active = false;
                    rt.thread.tag_head = record.prev;
                }
            }
        }
        Err(jump)
    }

    fn step(&self, rt: &mut Runtime, pc: usize) -> RunResult<Flow> {
        let Some(insn) = self.body.insns.get(pc) else {
            return Err(rt.fatal(format!("{}: fell off the end of native code", self.body.name)));
        };
        match insn {
            Insn::Const { dst, word } => self.set(rt, *dst, *word),
            Insn::Move { dst, src } => {
                let word = self.get(rt, *src);
                self.set(rt, *dst, word);
            }
            Insn::Binary { op, dst, lhs, rhs } => {
                let (l, r) = (self.get(rt, *lhs), self.get(rt, *rhs));
                self.set(rt, *dst, binary(*op, l, r));
            }
            Insn::Checked {
                op,
                dst,
                lhs,
                rhs,
                overflow,
            } => {
                let (l, r) = (self.get(rt, *lhs) as i64, self.get(rt, *rhs) as i64);
                let result = match op {
                    CheckedOp::Add => l.checked_add(r),
                    CheckedOp::Sub => l.checked_sub(r),
                    CheckedOp::Mul => l.checked_mul(r),
                };
                match result {
                    Some(word) => self.set(rt, *dst, word as u64),
                    None => return Ok(Flow::Goto(self.body.target(*overflow))),
                }
            }
            Insn::Unary { op, dst, src } => {
                let word = self.get(rt, *src);
                let result = match op {
                    UnOp::Not => !word,
                    UnOp::Truthy => Value::from_raw(word).truthy() as u64,
                    UnOp::IsFixnum => word & 1,
                    UnOp::ToBool => Value::from_bool(word != 0).raw(),
                };
                self.set(rt, *dst, result);
            }
            Insn::Branch { target } => return Ok(Flow::Goto(self.body.target(*target))),
            Insn::BranchIf { cond, target } => {
                if self.get(rt, *cond) != 0 {
                    return Ok(Flow::Goto(self.body.target(*target)));
                }
            }
            Insn::BranchUnless { cond, target } => {
                if self.get(rt, *cond) == 0 {
                    return Ok(Flow::Goto(self.body.target(*target)));
                }
            }
            Insn::Load { dst, ptr, offset } => {
                let at = Ptr::from_raw(self.get(rt, *ptr)).add(*offset as i64);
                let Some(word) = rt.memory.read(at) else {
                    return Err(rt.fatal(format!("{}: bad load from {:?}", self.body.name, at)));
                };
                self.set(rt, *dst, word);
            }
            Insn::Store { ptr, offset, src } => {
                let at = Ptr::from_raw(self.get(rt, *ptr)).add(*offset as i64);
                let word = self.get(rt, *src);
                if !rt.memory.write(at, word) {
                    return Err(rt.fatal(format!("{}: bad store to {:?}", self.body.name, at)));
                }
            }
            Insn::PtrAdd { dst, ptr, offset } => {
                let at = Ptr::from_raw(self.get(rt, *ptr)).add(*offset as i64);
                self.set(rt, *dst, at.raw());
            }
            Insn::FrameAddr { dst, offset } => {
                let at = self.base + self.body.nregs() + *offset as usize;
                self.set(rt, *dst, Ptr::new(0, at as u32).raw());
            }
            Insn::FuncAddr { dst, index } => {
                let id = self.entry.resolve(*index);
                self.set(rt, *dst, id.word());
            }
            Insn::Call { dst, target, args } => {
                let words: Vec<u64> = args.iter().map(|reg| self.get(rt, *reg)).collect();
                let result = rt.call_runtime(target, &words)?;
                if let Some(dst) = dst {
                    self.set(rt, *dst, result);
                }
            }
            Insn::CallFunction { dst, index, args } => {
                let words: Vec<u64> = args.iter().map(|reg| self.get(rt, *reg)).collect();
                let result = execute(rt, self.entry.resolve(*index), &words)?;
                if let Some(dst) = dst {
                    self.set(rt, *dst, result);
                }
            }
            Insn::LoadSp { dst } => {
                let sp = rt.thread.sp as u32;
                self.set(rt, *dst, Ptr::new(0, sp).raw());
            }
            Insn::SyncSp { src } => {
                let sp = Ptr::from_raw(self.get(rt, *src)).offset() as usize;
                if !rt.memory.reserve_stack(sp) {
                    return Err(rt.stack_overflow());
                }
                rt.thread.sp = sp;
            }
            Insn::PushTag { tag } => {
                let index = self.tag_base + tag.index();
                let prev = rt.thread.tag_head;
                rt.thread.tags[index] = TagRecord {
                    prev,
                    active: true,
                    state: 0,
                    resume: None,
                };
                rt.thread.tag_head = Some(index);
            }
            Insn::PopTag { tag } => {
                let record = &mut rt.thread.tags[self.tag_base + tag.index()];
                record.active = false;
                rt.thread.tag_head = record.prev;
            }
            Insn::Checkpoint { dst, tag } => {
                rt.thread.tags[self.tag_base + tag.index()].resume = Some((pc + 1, *dst));
                self.set(rt, *dst, 0);
            }
            Insn::JumpTag { state } => {
                let code = self.get(rt, *state);
                return match State::from_code(code as u32) {
                    Some(state) => Err(Jump::new(state)),
                    None => Err(rt.fatal(format!("{}: unknown state code {}", self.body.name, code))),
                };
            }
            Insn::Return { src } => return Ok(Flow::Return(self.get(rt, *src))),
        }
        Ok(Flow::Next)
    }
}

enum Flow {
    Next,
    Goto(usize),
    Return(u64),
}

fn binary(op: BinOp, l: u64, r: u64) -> u64 {
    let (sl, sr) = (l as i64, r as i64);
    match op {
        BinOp::Add => l.wrapping_add(r),
        BinOp::Sub => l.wrapping_sub(r),
        BinOp::Mul => sl.wrapping_mul(sr) as u64,
        BinOp::And => l & r,
        BinOp::Or => l | r,
        BinOp::Xor => l ^ r,
        BinOp::Shl => l.wrapping_shl(r as u32),
        BinOp::Sar => sl.wrapping_shr(r as u32) as u64,
        BinOp::Eq => (l == r) as u64,
        BinOp::Ne => (l != r) as u64,
        BinOp::Lt => (sl < sr) as u64,
        BinOp::Le => (sl <= sr) as u64,
        BinOp::Gt => (sl > sr) as u64,
        BinOp::Ge => (sl >= sr) as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FunctionBuilder, NativeFunction, RuntimeFn, Signature};
    use crate::runtime::{Runtime, RuntimeConfig};

    fn install(rt: &mut Runtime, body: FunctionBuilder) -> FuncId {
        rt.code
            .install(NativeFunction::new(body.finish().unwrap()))
            .unwrap()
    }

    #[test]
    fn test_checked_add_branches_on_overflow() {
        let mut rt = Runtime::new(RuntimeConfig::default());
        let mut fb = FunctionBuilder::new("add", Signature::Internal(2));
        let (a, b) = (fb.param(0), fb.param(1));
        let overflow = fb.new_label();
        let sum = fb.checked(CheckedOp::Add, a, b, overflow);
        fb.ret(sum);
        fb.place(overflow);
        let marker = fb.const_int(-1);
        fb.ret(marker);
        let id = install(&mut rt, fb);

        assert_eq!(execute(&mut rt, id, &[2, 3]), Ok(5));
        assert_eq!(execute(&mut rt, id, &[i64::MAX as u64, 1]), Ok(-1i64 as u64));
        assert_eq!(rt.thread.sp, 0);
    }

    #[test]
    fn test_checkpoint_resumes_with_state_and_restores_chain() {
        let mut rt = Runtime::new(RuntimeConfig::default());
        let mut fb = FunctionBuilder::new("guarded", Signature::Internal(1));
        let payload = fb.param(0);
        let tag = fb.new_tag();
        let caught = fb.new_label();
        fb.push_tag(tag);
        let state = fb.checkpoint(tag);
        fb.branch_if(state, caught);
        fb.call_void(RuntimeFn::Throw { state: 2 }, &[payload]);
        let unreachable = fb.const_int(0);
        fb.ret(unreachable);
        fb.place(caught);
        fb.pop_tag(tag);
        fb.ret(state);
        let id = install(&mut rt, fb);

        let value = Value::fixnum(7).unwrap().raw();
        assert_eq!(execute(&mut rt, id, &[value]), Ok(State::Break.code() as u64));
        assert_eq!(rt.thread.tag_head, None);
        assert_eq!(rt.thread.jump_value.raw(), value);
    }

    #[test]
    fn test_jump_without_tag_propagates() {
        let mut rt = Runtime::new(RuntimeConfig::default());
        let mut fb = FunctionBuilder::new("raise", Signature::Internal(0));
        let code = fb.const_int(State::Raise.code() as i64);
        fb.jump_tag(code);
        let id = install(&mut rt, fb);
        assert_eq!(execute(&mut rt, id, &[]), Err(Jump::new(State::Raise)));
        assert!(rt.thread.tags.is_empty());
    }
}
