// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Compile-time models of the operand stack.
//!
//! The static model gives every stack depth its own register and tags
//! each live slot with the offset after the instruction that pushed it.
//! The dynamic model keeps a runtime pointer into the thread's value
//! stack instead, which follows any control flow at the cost of a memory
//! access per push and pop.

use hyperdrive_vm::backend::{FunctionBuilder, Reg, Type};

use crate::error::{CompileError, Result};

/// Depth and slot tags of a static stack at some program point.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackShape {
    slots: Vec<usize>,
}

impl StackShape {
    /// Number of live slots.
    pub fn depth(&self) -> usize {
        self.slots.len()
    }
}

/// Register-per-depth operand stack.
#[derive(Debug, Default)]
pub struct StaticStack {
    regs: Vec<Reg>,
    shape: StackShape,
}

impl StaticStack {
    /// An empty stack.
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&mut self, fb: &mut FunctionBuilder, depth: usize) -> Reg {
        while self.regs.len() <= depth {
            let reg = fb.value(Type::Object);
            self.regs.push(reg);
        }
        self.regs[depth]
    }

    fn push(&mut self, fb: &mut FunctionBuilder, value: Reg, tag: usize) {
        let depth = self.shape.depth();
        let slot = self.slot(fb, depth);
        fb.store(slot, value);
        self.shape.slots.push(tag);
    }

    fn live(&self, n: usize, site: usize) -> Result<Reg> {
        let depth = self.shape.depth();
        if n >= depth {
            return Err(underflow(site));
        }
        Ok(self.regs[depth - 1 - n])
    }

    /// Fails when a live slot was pushed after `target`: branching there
    /// would let a later push at the same depth overwrite it.
    fn validate_branch(&self, site: usize, target: usize) -> Result<()> {
        match self.shape.slots.iter().find(|&&tag| tag > target) {
            Some(_) => Err(CompileError::UnsafeBranch { offset: site, target }),
            None => Ok(()),
        }
    }
}

/// Operand stack addressed through a runtime pointer into the value stack.
#[derive(Debug)]
pub struct DynamicStack {
    bottom: Reg,
    ptr: Reg,
}

impl DynamicStack {
    /// Emits the prologue: the stack starts at the thread's `sp` and
    /// `reserve` words above it are made addressable.
    pub fn new(fb: &mut FunctionBuilder, reserve: usize) -> Self {
        let bottom = fb.load_sp();
        let ptr = fb.copy(bottom);
        let limit = fb.ptr_add(bottom, reserve as i32);
        fb.sync_sp(limit);
        fb.sync_sp(bottom);
        Self { bottom, ptr }
    }
}

/// The operand stack model of one function.
#[derive(Debug)]
pub enum OperandStack {
    /// Register slots
    Static(StaticStack),
    /// Runtime stack pointer
    Dynamic(DynamicStack),
}

impl OperandStack {
    /// Pushes `value`, tagging static slots with `tag`.
    pub fn push(&mut self, fb: &mut FunctionBuilder, value: Reg, tag: usize) {
        match self {
            OperandStack::Static(stack) => stack.push(fb, value, tag),
            OperandStack::Dynamic(stack) => {
                fb.store_at(stack.ptr, 0, value);
                fb.ptr_add_into(stack.ptr, stack.ptr, 1);
            }
        }
    }

    /// Pops the top value into a fresh register.
    pub fn pop(&mut self, fb: &mut FunctionBuilder, site: usize) -> Result<Reg> {
        match self {
            OperandStack::Static(stack) => {
                let slot = stack.live(0, site)?;
                stack.shape.slots.pop();
                Ok(fb.copy(slot))
            }
            OperandStack::Dynamic(stack) => {
                fb.ptr_add_into(stack.ptr, stack.ptr, -1);
                Ok(fb.load(Type::Object, stack.ptr, 0))
            }
        }
    }

    /// Pops `n` values, returned bottom-most first.
    pub fn pop_n(&mut self, fb: &mut FunctionBuilder, n: usize, site: usize) -> Result<Vec<Reg>> {
        let mut values = (0..n)
            .map(|_| self.pop(fb, site))
            .collect::<Result<Vec<_>>>()?;
        values.reverse();
        Ok(values)
    }

    /// Copy of the top value.
    pub fn top(&mut self, fb: &mut FunctionBuilder, site: usize) -> Result<Reg> {
        self.topn(fb, 0, site)
    }

    /// Overwrites the top value.
    pub fn set_top(&mut self, fb: &mut FunctionBuilder, value: Reg, site: usize) -> Result<()> {
        self.setn(fb, 0, value, site)
    }

    /// Copy of the value `n` below the top.
    pub fn topn(&mut self, fb: &mut FunctionBuilder, n: usize, site: usize) -> Result<Reg> {
        match self {
            OperandStack::Static(stack) => {
                let slot = stack.live(n, site)?;
                Ok(fb.copy(slot))
            }
            OperandStack::Dynamic(stack) => {
                Ok(fb.load(Type::Object, stack.ptr, -(n as i32) - 1))
            }
        }
    }

    /// Overwrites the value `n` below the top.
    pub fn setn(&mut self, fb: &mut FunctionBuilder, n: usize, value: Reg, site: usize) -> Result<()> {
        match self {
            OperandStack::Static(stack) => {
                let slot = stack.live(n, site)?;
                fb.store(slot, value);
            }
            OperandStack::Dynamic(stack) => {
                fb.store_at(stack.ptr, -(n as i32) - 1, value);
            }
        }
        Ok(())
    }

    /// Checks that branching from `site` to `target` keeps every live
    /// value in a slot the target agrees on. Always succeeds for the
    /// dynamic model.
    pub fn validate_branch(&self, site: usize, target: usize) -> Result<()> {
        match self {
            OperandStack::Static(stack) => stack.validate_branch(site, target),
            OperandStack::Dynamic(_) => Ok(()),
        }
    }

    /// Drops values above `depth`.
    pub fn truncate(&mut self, fb: &mut FunctionBuilder, depth: usize, site: usize) -> Result<()> {
        match self {
            OperandStack::Static(stack) => {
                if depth > stack.shape.depth() {
                    return Err(CompileError::unsupported(
                        site,
                        format!(
                            "handler stack depth {} above the protected depth {}",
                            depth,
                            stack.shape.depth()
                        ),
                    ));
                }
                stack.shape.slots.truncate(depth);
            }
            OperandStack::Dynamic(stack) => {
                fb.ptr_add_into(stack.ptr, stack.bottom, depth as i32);
            }
        }
        Ok(())
    }

    /// Publishes the stack pointer to the thread before a call, so callee
    /// frames start above the live values and the collector sees them.
    pub fn sync_sp(&self, fb: &mut FunctionBuilder) {
        if let OperandStack::Dynamic(stack) = self {
            fb.sync_sp(stack.ptr);
        }
    }

    /// Current shape, for the static model.
    pub fn snapshot(&self) -> Option<StackShape> {
        match self {
            OperandStack::Static(stack) => Some(stack.shape.clone()),
            OperandStack::Dynamic(_) => None,
        }
    }

    /// Returns to a shape taken by [`OperandStack::snapshot`].
    pub fn restore(&mut self, fb: &mut FunctionBuilder, shape: &StackShape) {
        if let OperandStack::Static(stack) = self {
            stack.slot(fb, shape.depth());
            stack.shape = shape.clone();
        }
    }

    /// Static depth, if tracked.
    pub fn depth(&self) -> Option<usize> {
        match self {
            OperandStack::Static(stack) => Some(stack.shape.depth()),
            OperandStack::Dynamic(_) => None,
        }
    }

    /// Whether this is the static model.
    pub fn is_static(&self) -> bool {
        matches!(self, OperandStack::Static(_))
    }
}

fn underflow(site: usize) -> CompileError {
    CompileError::unsupported(site, "operand stack underflow")
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyperdrive_vm::backend::{Insn, Signature};

    fn builder() -> FunctionBuilder {
        FunctionBuilder::new("f", Signature::Fixed(1))
    }

    #[test]
    fn test_static_slots_reuse_registers_per_depth() {
        let mut fb = builder();
        let v = fb.param(1);
        let mut stack = OperandStack::Static(StaticStack::new());
        stack.push(&mut fb, v, 2);
        let popped = stack.pop(&mut fb, 2).unwrap();
        stack.push(&mut fb, popped, 4);
        match &stack {
            OperandStack::Static(s) => assert_eq!(s.regs.len(), 1),
            OperandStack::Dynamic(_) => unreachable!(),
        }
        assert_eq!(stack.depth(), Some(1));
    }

    #[test]
    fn test_validate_branch_rejects_slot_pushed_after_target() {
        let mut fb = builder();
        let v = fb.param(1);
        let mut stack = OperandStack::Static(StaticStack::new());
        stack.push(&mut fb, v, 2);
        assert!(stack.validate_branch(10, 2).is_ok());
        stack.push(&mut fb, v, 8);
        assert_eq!(
            stack.validate_branch(10, 4),
            Err(CompileError::UnsafeBranch { offset: 10, target: 4 })
        );
        assert!(stack.validate_branch(10, 8).is_ok());
    }

    #[test]
    fn test_pop_underflow_is_unsupported() {
        let mut fb = builder();
        let mut stack = OperandStack::Static(StaticStack::new());
        assert!(matches!(
            stack.pop(&mut fb, 3),
            Err(CompileError::UnsupportedConstruct { offset: 3, .. })
        ));
    }

    #[test]
    fn test_snapshot_restore() {
        let mut fb = builder();
        let v = fb.param(1);
        let mut stack = OperandStack::Static(StaticStack::new());
        stack.push(&mut fb, v, 1);
        let shape = stack.snapshot().unwrap();
        stack.push(&mut fb, v, 3);
        stack.truncate(&mut fb, 0, 3).unwrap();
        stack.restore(&mut fb, &shape);
        assert_eq!(stack.snapshot(), Some(shape));
        assert!(stack.truncate(&mut fb, 4, 5).is_err());
    }

    #[test]
    fn test_dynamic_stack_moves_pointer_and_syncs() {
        let mut fb = builder();
        let v = fb.param(1);
        let mut stack = OperandStack::Dynamic(DynamicStack::new(&mut fb, 8));
        stack.push(&mut fb, v, 0);
        stack.sync_sp(&mut fb);
        let _ = stack.pop(&mut fb, 0).unwrap();
        assert!(stack.validate_branch(9, 0).is_ok());
        assert_eq!(stack.snapshot(), None);
        let syncs = fb
            .insns()
            .iter()
            .filter(|insn| matches!(insn, Insn::SyncSp { .. }))
            .count();
        assert_eq!(syncs, 3);
    }
}
