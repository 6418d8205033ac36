// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! The per-function translator.
//!
//! One forward pass over the instruction sequence. At every offset the
//! translator enters the regions starting there, binds the offset's label,
//! emits the instruction and pops the tags of regions ending there. After
//! an instruction that never falls through, the static stack model is
//! reset to the shape a branch recorded for the next offset.

use std::sync::Arc;

use hyperdrive_vm::backend::{BinOp, FunctionBody, FunctionBuilder, Reg, RuntimeFn, Signature, UnOp};
use hyperdrive_vm::iseq::{CatchKind, Instruction, Iseq, IseqKind, Layout, Literal};
use hyperdrive_vm::{SymbolId, Value};
use tracing::{debug, trace};

use super::labels::{BranchSite, Condition, LabelManager};
use super::pc::ProgramCounter;
use super::regions::RegionCompiler;
use super::scope::{AddressableScope, RegisterScope, Scope, ScopeLayout};
use super::stack::{DynamicStack, OperandStack, StaticStack};
use super::{StackModel, Unit, arguments};
use crate::error::{CompileError, Result};
use crate::options::IterationStrategy;

/// What a function body is compiled as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    /// A method entry point
    Method,
    /// A block body driven by an iterate or a proc
    Block(IterationStrategy),
}

/// Compiles one instruction sequence into one native function body.
pub struct FunctionCompiler<'u, 'a> {
    pub(super) unit: &'u mut Unit<'a>,
    pub(super) kind: FunctionKind,
    pub(super) iseq: &'a Iseq,
    /// Enclosing sequences, outermost first, ending with `iseq`
    pub(super) chain: Vec<&'a Iseq>,
    pub(super) layout: Layout,
    pub(super) scope_layout: Option<Arc<ScopeLayout>>,
    pub(super) fb: FunctionBuilder,
    pub(super) pc: ProgramCounter,
    pub(super) stack: OperandStack,
    pub(super) labels: LabelManager,
    pub(super) regions: RegionCompiler,
    pub(super) scope: Scope<'a>,
    /// Whether control can fall into the next instruction
    pub(super) reachable: bool,
}

impl<'u, 'a> FunctionCompiler<'u, 'a> {
    /// Prepares the entry function of a method: prologue, scope and
    /// argument binding.
    pub fn method(unit: &'u mut Unit<'a>, iseq: &'a Iseq) -> Result<Self> {
        if iseq.kind == IseqKind::Block {
            return Err(CompileError::unsupported(0, "block sequence compiled as a method"));
        }
        let signature = arguments::signature(&iseq.params);
        let mut fb = FunctionBuilder::new(iseq.name.clone(), signature);
        let layout = iseq.layout();
        let regions = RegionCompiler::new(&mut fb, iseq, &layout)?;
        let stack = Self::operand_stack(&mut fb, unit.stack_model(), iseq);

        let self_value = match signature {
            Signature::Variadic => fb.param(2),
            _ => fb.param(0),
        };
        let scope_layout = if iseq.has_blocks() {
            Some(Arc::new(ScopeLayout::for_method(iseq)?))
        } else {
            None
        };
        let scope = match &scope_layout {
            Some(shared) => Scope::Addressable(AddressableScope::create(
                &mut fb,
                Arc::clone(shared),
                self_value,
                unit.symbols(),
            )),
            None => Scope::Registers(RegisterScope::new(self_value)),
        };

        let mut compiler = Self {
            unit,
            kind: FunctionKind::Method,
            iseq,
            chain: vec![iseq],
            layout,
            scope_layout,
            fb,
            pc: ProgramCounter::new(),
            stack,
            labels: LabelManager::new(),
            regions,
            scope,
            reachable: true,
        };
        for name in &iseq.locals {
            compiler.scope.declare(&mut compiler.fb, name);
        }
        compiler.bind_method_arguments()?;
        Ok(compiler)
    }

    /// Prepares the body of a block whose enclosing sequences are `chain`
    /// (ending with the block itself). The body reopens the method's scope
    /// from the handle it is called with.
    pub fn block(
        unit: &'u mut Unit<'a>,
        chain: Vec<&'a Iseq>,
        scope_layout: Arc<ScopeLayout>,
        strategy: IterationStrategy,
    ) -> Result<Self> {
        let Some(&iseq) = chain.last() else {
            return Err(CompileError::unsupported(0, "block without a sequence"));
        };
        let mut fb = FunctionBuilder::new(iseq.name.clone(), Signature::Internal(2));
        let layout = iseq.layout();
        let regions = RegionCompiler::new(&mut fb, iseq, &layout)?;
        let stack = Self::operand_stack(&mut fb, unit.stack_model(), iseq);
        let handle = fb.param(1);
        let scope = Scope::Addressable(AddressableScope::load(
            &mut fb,
            Arc::clone(&scope_layout),
            handle,
            unit.symbols(),
        ));

        let mut compiler = Self {
            unit,
            kind: FunctionKind::Block(strategy),
            iseq,
            chain,
            layout,
            scope_layout: Some(scope_layout),
            fb,
            pc: ProgramCounter::new(),
            stack,
            labels: LabelManager::new(),
            regions,
            scope,
            reachable: true,
        };
        compiler.bind_block_parameters()?;
        Ok(compiler)
    }

    fn operand_stack(fb: &mut FunctionBuilder, model: StackModel, iseq: &Iseq) -> OperandStack {
        match model {
            StackModel::Static => OperandStack::Static(StaticStack::new()),
            StackModel::Dynamic => {
                // Every instruction pushes at most one net value, and every
                // handler adds at most two.
                let reserve = iseq.code.len() + 2 * iseq.catch_table.len() + 1;
                OperandStack::Dynamic(DynamicStack::new(fb, reserve))
            }
        }
    }

    /// Whether this is a block body.
    pub fn is_block(&self) -> bool {
        matches!(self.kind, FunctionKind::Block(_))
    }

    /// Translates every instruction and finishes the function.
    pub fn compile(mut self) -> Result<FunctionBody> {
        let iseq = self.iseq;
        for (offset, insn, len) in iseq.instructions() {
            if !self.reachable
                && let Some(shape) = self.labels.shape_at(offset).cloned()
            {
                self.stack.restore(&mut self.fb, &shape);
            }
            for index in self.regions.starting_at(offset) {
                self.enter_region(index)?;
            }
            self.labels.record(offset, self.stack.snapshot(), offset)?;
            self.labels.place(&mut self.fb, offset);

            self.pc.advance(len);
            trace!(offset, insn = insn.mnemonic(), depth = ?self.stack.depth(), "translate");
            self.translate(insn)?;

            self.reachable = !insn.is_terminator();
            if self.reachable {
                for index in self.regions.ending_at(offset) {
                    self.regions.exit(&mut self.fb, index);
                }
            }
        }

        // Falling off the end, or branching to it, returns nil.
        self.labels.place(&mut self.fb, self.layout.end);
        let nil = self.fb.const_value(Value::NIL);
        self.fb.ret(nil);

        debug!(
            function = %self.iseq.name,
            insns = self.fb.len(),
            regions = self.regions.len(),
            labels = self.labels.len(),
            "function translated"
        );
        Ok(self.fb.finish()?)
    }

    // ========================================================================
    // Regions
    // ========================================================================

    fn enter_region(&mut self, index: usize) -> Result<()> {
        self.regions.enter(&mut self.fb, index);
        let after = self.fb.new_label();
        self.fb.branch(after);
        let dispatch = self.regions.get(index).dispatch;
        self.fb.place(dispatch);
        self.emit_dispatch(index)?;
        self.fb.place(after);
        Ok(())
    }

    /// The code a checkpoint resumes at: match the state, rebuild the
    /// handler's stack and continue at the region's target.
    fn emit_dispatch(&mut self, index: usize) -> Result<()> {
        let region = self.regions.get(index).clone();
        let entry = &region.entry;
        self.fb.pop_tag(region.tag);

        let reraise = match region.handled_state() {
            Some(state) => {
                let code = self.fb.const_int(state.code() as i64);
                let hit = self.fb.eq(region.state, code);
                let reraise = self.fb.new_label();
                self.fb.branch_unless(hit, reraise);
                Some(reraise)
            }
            None => None,
        };

        let shape = self.stack.snapshot();
        self.stack.truncate(&mut self.fb, entry.sp, entry.start)?;
        let target = region.target();
        match entry.kind {
            CatchKind::Rescue | CatchKind::Break | CatchKind::Next => {
                let payload = self.call(RuntimeFn::Payload, &[region.state]);
                self.stack.push(&mut self.fb, payload, target);
            }
            CatchKind::Ensure => {
                let one = self.fb.const_int(1);
                let shifted = self.fb.binary(BinOp::Shl, region.state, one);
                let state = self.fb.binary(BinOp::Or, shifted, one);
                self.stack.push(&mut self.fb, state, target);
                let payload = self.call(RuntimeFn::Payload, &[region.state]);
                self.stack.push(&mut self.fb, payload, target);
            }
            CatchKind::Retry | CatchKind::Redo => {}
        }

        let enclosing = self.regions.enclosing(index);
        let site = BranchSite {
            offset: entry.start,
            active: &enclosing,
        };
        self.labels.branch(
            &mut self.fb,
            &self.stack,
            &self.regions,
            site,
            Condition::Always,
            target,
        )?;
        if let Some(shape) = shape {
            self.stack.restore(&mut self.fb, &shape);
        }

        if let Some(reraise) = reraise {
            self.fb.place(reraise);
            self.fb.jump_tag(region.state);
        }
        Ok(())
    }

    // ========================================================================
    // Calls and variables
    // ========================================================================

    /// Emits a runtime call after publishing the stack pointer.
    pub(super) fn call(&mut self, target: RuntimeFn, args: &[Reg]) -> Reg {
        self.stack.sync_sp(&mut self.fb);
        self.fb.call(target, args)
    }

    /// Emits a runtime call whose result is unused.
    pub(super) fn call_void(&mut self, target: RuntimeFn, args: &[Reg]) {
        self.stack.sync_sp(&mut self.fb);
        self.fb.call_void(target, args);
    }

    pub(super) fn intern(&self, name: &str) -> SymbolId {
        self.unit.symbols().intern(name)
    }

    pub(super) fn push(&mut self, value: Reg) {
        let tag = self.pc.advanced();
        self.stack.push(&mut self.fb, value, tag);
    }

    pub(super) fn pop(&mut self) -> Result<Reg> {
        self.stack.pop(&mut self.fb, self.pc.site())
    }

    pub(super) fn pop_n(&mut self, n: usize) -> Result<Vec<Reg>> {
        self.stack.pop_n(&mut self.fb, n, self.pc.site())
    }

    pub(super) fn read_variable(&mut self, name: &str) -> Result<Reg> {
        let site = self.pc.site();
        if self.scope.is_addressable() {
            self.stack.sync_sp(&mut self.fb);
            self.scope.dynamic_get(&mut self.fb, name, site)
        } else {
            self.scope.get(&mut self.fb, name, site)
        }
    }

    pub(super) fn write_variable(&mut self, name: &str, value: Reg) -> Result<()> {
        let site = self.pc.site();
        if self.scope.is_addressable() {
            self.stack.sync_sp(&mut self.fb);
            self.scope.dynamic_set(&mut self.fb, name, value, site)
        } else {
            self.scope.set(&mut self.fb, name, value, site)
        }
    }

    fn local_name(&self, iseq: &'a Iseq, index: usize) -> Result<&'a str> {
        iseq.locals.get(index).map(String::as_str).ok_or_else(|| {
            CompileError::unsupported(
                self.pc.site(),
                format!("local index {} out of range in `{}`", index, iseq.name),
            )
        })
    }

    fn dynamic_name(&self, index: usize, level: usize) -> Result<&'a str> {
        let depth = self.chain.len() - 1;
        if level > depth {
            return Err(CompileError::unsupported(
                self.pc.site(),
                format!("getdynamic level {} outside the method", level),
            ));
        }
        if level > 0 && !self.scope.is_addressable() {
            return Err(CompileError::unsupported(
                self.pc.site(),
                "outer variable access without an addressable scope",
            ));
        }
        self.local_name(self.chain[depth - level], index)
    }

    fn literal(&mut self, literal: &Literal) -> Reg {
        let immediate = match literal {
            Literal::Nil => Some(Value::NIL),
            Literal::True => Some(Value::TRUE),
            Literal::False => Some(Value::FALSE),
            Literal::Int(n) => Value::fixnum(*n),
            Literal::Sym(name) => Some(Value::symbol(self.intern(name))),
            Literal::Str(_) | Literal::Array(_) => None,
        };
        match immediate {
            Some(value) => self.fb.const_value(value),
            None => self.call(RuntimeFn::Literal(Arc::new(literal.clone())), &[]),
        }
    }

    /// Resolves a relative branch operand to an instruction boundary.
    pub(super) fn branch_target(&self, relative: i32) -> Result<usize> {
        let site = self.pc.site();
        self.pc
            .resolve(relative)
            .filter(|&target| target == self.layout.end || self.layout.index_of(target).is_some())
            .ok_or_else(|| {
                CompileError::unsupported(site, "branch target is not an instruction boundary")
            })
    }

    fn branch_to(&mut self, cond: Condition, target: usize) -> Result<()> {
        let active = self.regions.active_at(self.pc.site());
        let site = BranchSite {
            offset: self.pc.site(),
            active: &active,
        };
        self.labels
            .branch(&mut self.fb, &self.stack, &self.regions, site, cond, target)
    }

    /// Invokes `mid` on the operands `[recv, args...]`.
    pub(super) fn invoke(&mut self, mid: &str, operands: &[Reg]) -> Reg {
        let mid = self.intern(mid);
        let argc = operands.len().saturating_sub(1) as u32;
        self.call(RuntimeFn::Invoke { mid, argc }, operands)
    }

    // ========================================================================
    // Instructions
    // ========================================================================

    fn translate(&mut self, insn: &'a Instruction) -> Result<()> {
        let site = self.pc.site();
        match insn {
            Instruction::Nop => {}
            Instruction::PutNil => {
                let nil = self.fb.const_value(Value::NIL);
                self.push(nil);
            }
            Instruction::PutSelf => {
                let recv = self.scope.self_value();
                self.push(recv);
            }
            Instruction::PutObject { value } => {
                let value = self.literal(value);
                self.push(value);
            }
            Instruction::PutString { value } => {
                let string = self.call(RuntimeFn::StrNew(Arc::from(value.as_str())), &[]);
                self.push(string);
            }
            Instruction::DupArray { values } => {
                let literal = Arc::new(Literal::Array(values.clone()));
                let array = self.call(RuntimeFn::Literal(literal), &[]);
                self.push(array);
            }
            Instruction::NewArray { count } => {
                let items = self.pop_n(*count)?;
                let array = self.call(RuntimeFn::ArrayNew { count: *count as u32 }, &items);
                self.push(array);
            }
            Instruction::NewHash { count } => {
                let items = self.pop_n(*count)?;
                let hash = self.call(RuntimeFn::HashNew { count: *count as u32 }, &items);
                self.push(hash);
            }
            Instruction::GetConstant { name } => {
                let name = self.intern(name);
                let value = self.call(RuntimeFn::Constant(name), &[]);
                self.push(value);
            }
            Instruction::GetLocal { index } => {
                let name = self.local_name(self.iseq, *index)?;
                let value = self.read_variable(name)?;
                self.push(value);
            }
            Instruction::SetLocal { index } => {
                let name = self.local_name(self.iseq, *index)?;
                let value = self.pop()?;
                self.write_variable(name, value)?;
            }
            Instruction::GetDynamic { index, level } => {
                let name = self.dynamic_name(*index, *level)?;
                let value = self.read_variable(name)?;
                self.push(value);
            }
            Instruction::SetDynamic { index, level } => {
                let name = self.dynamic_name(*index, *level)?;
                let value = self.pop()?;
                self.write_variable(name, value)?;
            }
            Instruction::Pop => {
                self.pop()?;
            }
            Instruction::Dup => {
                let top = self.stack.top(&mut self.fb, site)?;
                self.push(top);
            }
            Instruction::Swap => {
                let a = self.pop()?;
                let b = self.pop()?;
                self.push(a);
                self.push(b);
            }
            Instruction::TopN { n } => {
                let value = self.stack.topn(&mut self.fb, *n, site)?;
                self.push(value);
            }
            Instruction::SetN { n } => {
                let top = self.stack.top(&mut self.fb, site)?;
                self.stack.setn(&mut self.fb, *n, top, site)?;
            }
            Instruction::Jump { offset } => {
                let target = self.branch_target(*offset)?;
                self.branch_to(Condition::Always, target)?;
            }
            Instruction::BranchIf { offset } | Instruction::BranchUnless { offset } => {
                let target = self.branch_target(*offset)?;
                let value = self.pop()?;
                let truthy = self.fb.unary(UnOp::Truthy, value);
                let cond = match insn {
                    Instruction::BranchIf { .. } => Condition::If(truthy),
                    _ => Condition::Unless(truthy),
                };
                self.branch_to(cond, target)?;
            }
            Instruction::Send {
                mid,
                argc,
                block,
                flags,
            } => {
                if flags.splat {
                    return Err(CompileError::unsupported(site, "send with a splatted argument"));
                }
                if flags.blockarg {
                    return Err(CompileError::unsupported(site, "send with a block argument"));
                }
                match block {
                    Some(block) => self.send_with_block(mid, *argc, *block)?,
                    None => {
                        let mut operands = self.pop_n(*argc)?;
                        let recv = self.pop()?;
                        operands.insert(0, recv);
                        let result = self.invoke(mid, &operands);
                        self.push(result);
                    }
                }
            }
            Instruction::InvokeBlock { argc } => {
                if self.is_block() {
                    return Err(CompileError::unsupported(site, "yield inside a block"));
                }
                let args = self.pop_n(*argc)?;
                let result = self.call(RuntimeFn::Yield { argc: *argc as u32 }, &args);
                self.push(result);
            }
            Instruction::Leave => {
                let value = self.pop()?;
                let active = self.regions.active_at(site);
                self.regions.exit_all(&mut self.fb, &active);
                self.fb.ret(value);
            }
            Instruction::Throw { state } => {
                let value = self.pop()?;
                self.call_void(RuntimeFn::Throw { state: *state }, &[value]);
            }
            Instruction::Rethrow => {
                let payload = self.pop()?;
                let state = self.pop()?;
                self.call_void(RuntimeFn::Rethrow, &[state, payload]);
            }
            Instruction::OptPlus
            | Instruction::OptMinus
            | Instruction::OptMult
            | Instruction::OptLt
            | Instruction::OptLe
            | Instruction::OptGt
            | Instruction::OptGe
            | Instruction::OptEq
            | Instruction::OptNeq
            | Instruction::OptAref
            | Instruction::OptAset
            | Instruction::OptLtlt
            | Instruction::OptSucc
            | Instruction::OptNot => self.specialized(insn)?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyperdrive_vm::SymbolTable;
    use hyperdrive_vm::backend::Insn;
    use hyperdrive_vm::iseq::IseqBuilder;

    use crate::options::CompileOptions;

    fn translate(iseq: &Iseq, stack: StackModel) -> Result<FunctionBody> {
        let options = CompileOptions::default();
        let symbols = SymbolTable::new();
        let mut unit = Unit::new(&options, &symbols, stack);
        unit.reserve();
        FunctionCompiler::method(&mut unit, iseq)?.compile()
    }

    #[test]
    fn test_straight_line_method() {
        let mut b = IseqBuilder::method("add");
        b.required("a");
        b.required("b");
        b.getlocal("a").getlocal("b").op(Instruction::OptPlus).leave();
        let body = translate(&b.build().unwrap(), StackModel::Static).unwrap();
        assert_eq!(body.signature, Signature::Fixed(2));
        assert!(body.insns.iter().any(|insn| matches!(insn, Insn::Return { .. })));
    }

    #[test]
    fn test_dynamic_model_syncs_before_calls() {
        let mut b = IseqBuilder::method("s");
        b.putstring("a").putstring("b").newarray(2).leave();
        let body = translate(&b.build().unwrap(), StackModel::Dynamic).unwrap();
        let insns = &body.insns;
        for (i, insn) in insns.iter().enumerate() {
            if matches!(insn, Insn::Call { .. }) {
                assert!(matches!(insns[i - 1], Insn::SyncSp { .. }), "call at {} not synced", i);
            }
        }
    }

    #[test]
    fn test_splat_send_is_unsupported() {
        let mut b = IseqBuilder::method("s");
        b.putself().putnil();
        b.op(Instruction::Send {
            mid: "p".into(),
            argc: 1,
            block: None,
            flags: hyperdrive_vm::iseq::CallFlags {
                splat: true,
                ..Default::default()
            },
        });
        b.leave();
        let err = translate(&b.build().unwrap(), StackModel::Static).unwrap_err();
        assert!(matches!(err, CompileError::UnsupportedConstruct { offset: 2, .. }));
    }

    #[test]
    fn test_outer_level_in_method_is_unsupported() {
        let mut b = IseqBuilder::method("m");
        b.local("x");
        b.op(Instruction::GetDynamic { index: 0, level: 1 }).leave();
        let err = translate(&b.build().unwrap(), StackModel::Static).unwrap_err();
        assert_eq!(err.kind(), "unsupported_construct");
    }
}
