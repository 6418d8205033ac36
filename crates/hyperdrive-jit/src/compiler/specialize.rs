// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Inline fast paths for the `opt_*` instructions.
//!
//! Each fast path guards its operand types, computes the result in place
//! and falls back to a full method call when the guard or an overflow
//! check fails. Both paths store into one result register.

use hyperdrive_vm::Value;
use hyperdrive_vm::backend::{BinOp, CheckedOp, Label, Reg, RuntimeFn, Type, UnOp};
use hyperdrive_vm::iseq::Instruction;

use super::FunctionCompiler;
use crate::error::{CompileError, Result};

impl FunctionCompiler<'_, '_> {
    /// Translates a specialized instruction.
    pub(super) fn specialized(&mut self, insn: &Instruction) -> Result<()> {
        let site = self.pc.site();
        let Some(mid) = insn.method_name() else {
            return Err(CompileError::unsupported(site, insn.mnemonic()));
        };
        let (pops, _) = insn.stack_effect();
        let operands = self.pop_n(pops)?;
        let result = if self.unit.options().fast_paths() {
            self.fast_path(insn, mid, &operands)
        } else {
            self.invoke(mid, &operands)
        };
        self.push(result);
        Ok(())
    }

    fn fast_path(&mut self, insn: &Instruction, mid: &str, ops: &[Reg]) -> Reg {
        let result = self.fb.value(Type::Object);
        let slow = self.fb.new_label();
        let done = self.fb.new_label();

        let fast = match insn {
            Instruction::OptPlus => {
                self.guard_fixnums(&[ops[0], ops[1]], slow);
                let one = self.fb.const_int(1);
                let rhs = self.fb.sub(ops[1], one);
                self.fb.checked(CheckedOp::Add, ops[0], rhs, slow)
            }
            Instruction::OptMinus => {
                self.guard_fixnums(&[ops[0], ops[1]], slow);
                let one = self.fb.const_int(1);
                let rhs = self.fb.sub(ops[1], one);
                self.fb.checked(CheckedOp::Sub, ops[0], rhs, slow)
            }
            Instruction::OptMult => {
                self.guard_fixnums(&[ops[0], ops[1]], slow);
                let one = self.fb.const_int(1);
                let lhs = self.fb.binary(BinOp::Sar, ops[0], one);
                let rhs = self.fb.sub(ops[1], one);
                let product = self.fb.checked(CheckedOp::Mul, lhs, rhs, slow);
                self.fb.binary(BinOp::Or, product, one)
            }
            Instruction::OptLt
            | Instruction::OptLe
            | Instruction::OptGt
            | Instruction::OptGe
            | Instruction::OptEq
            | Instruction::OptNeq => {
                self.guard_fixnums(&[ops[0], ops[1]], slow);
                let op = match insn {
                    Instruction::OptLt => BinOp::Lt,
                    Instruction::OptLe => BinOp::Le,
                    Instruction::OptGt => BinOp::Gt,
                    Instruction::OptGe => BinOp::Ge,
                    Instruction::OptEq => BinOp::Eq,
                    _ => BinOp::Ne,
                };
                let flag = self.fb.binary(op, ops[0], ops[1]);
                self.fb.unary(UnOp::ToBool, flag)
            }
            Instruction::OptSucc => {
                self.guard_fixnums(&[ops[0]], slow);
                let two = self.fb.const_int(2);
                self.fb.checked(CheckedOp::Add, ops[0], two, slow)
            }
            Instruction::OptNot => {
                let truthy = self.fb.unary(UnOp::Truthy, ops[0]);
                let zero = self.fb.const_int(0);
                let falsy = self.fb.eq(truthy, zero);
                self.fb.unary(UnOp::ToBool, falsy)
            }
            Instruction::OptAref => self.direct(RuntimeFn::IndexFast, ops, slow),
            Instruction::OptAset => self.direct(RuntimeFn::IndexSetFast, ops, slow),
            Instruction::OptLtlt => self.direct(RuntimeFn::PushFast, ops, slow),
            _ => self.invoke(mid, ops),
        };
        self.fb.store(result, fast);
        self.fb.branch(done);

        self.fb.place(slow);
        let generic = self.invoke(mid, ops);
        self.fb.store(result, generic);
        self.fb.place(done);
        result
    }

    /// Branches to `slow` unless every operand is a fixnum. Fixnums have
    /// the low bit set, so it survives the `and` only if all have it.
    fn guard_fixnums(&mut self, operands: &[Reg], slow: Label) {
        let mut combined = operands[0];
        for &operand in &operands[1..] {
            combined = self.fb.and(combined, operand);
        }
        let all = self.fb.unary(UnOp::IsFixnum, combined);
        self.fb.branch_unless(all, slow);
    }

    /// Calls a direct collection helper, branching to `slow` when it
    /// reports the receiver as not applicable.
    fn direct(&mut self, helper: RuntimeFn, ops: &[Reg], slow: Label) -> Reg {
        let value = self.call(helper, ops);
        let undef = self.fb.const_value(Value::UNDEF);
        let miss = self.fb.eq(value, undef);
        self.fb.branch_if(miss, slow);
        value
    }
}

#[cfg(test)]
mod tests {
    use hyperdrive_vm::SymbolTable;
    use hyperdrive_vm::backend::{FunctionBody, Insn};
    use hyperdrive_vm::iseq::{Iseq, IseqBuilder};

    use crate::compiler::{FunctionCompiler, StackModel, Unit};
    use crate::options::CompileOptions;

    use super::*;

    fn binary_method(insn: Instruction) -> Iseq {
        let mut b = IseqBuilder::method("op");
        b.required("a");
        b.required("b");
        b.getlocal("a").getlocal("b").op(insn).leave();
        b.build().unwrap()
    }

    fn translate(iseq: &Iseq, optimization_level: u8) -> FunctionBody {
        let options = CompileOptions {
            optimization_level,
            ..Default::default()
        };
        let symbols = SymbolTable::new();
        let mut unit = Unit::new(&options, &symbols, StackModel::Static);
        unit.reserve();
        FunctionCompiler::method(&mut unit, iseq)
            .unwrap()
            .compile()
            .unwrap()
    }

    fn invokes(body: &FunctionBody) -> usize {
        body.insns
            .iter()
            .filter(|insn| matches!(insn, Insn::Call { target: RuntimeFn::Invoke { .. }, .. }))
            .count()
    }

    #[test]
    fn test_plus_has_checked_fast_path_and_generic_fallback() {
        let body = translate(&binary_method(Instruction::OptPlus), 2);
        assert!(body.insns.iter().any(|insn| matches!(
            insn,
            Insn::Checked {
                op: CheckedOp::Add,
                ..
            }
        )));
        assert_eq!(invokes(&body), 1);
    }

    #[test]
    fn test_level_zero_always_calls() {
        let body = translate(&binary_method(Instruction::OptLt), 0);
        assert!(!body.insns.iter().any(|insn| matches!(insn, Insn::Unary { .. })));
        assert_eq!(invokes(&body), 1);
    }

    #[test]
    fn test_aref_uses_direct_helper() {
        let body = translate(&binary_method(Instruction::OptAref), 1);
        assert!(body.insns.iter().any(|insn| matches!(
            insn,
            Insn::Call {
                target: RuntimeFn::IndexFast,
                ..
            }
        )));
    }
}
