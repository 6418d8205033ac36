// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Method argument binding.
//!
//! Methods with only required parameters take them as fixed native
//! parameters. Anything else uses the variadic convention: the prologue
//! checks the argument count, binds required and supplied optional
//! arguments from `argv`, gathers the rest array and jumps to the
//! optional-argument entry point for the number of optionals supplied.

use hyperdrive_vm::backend::{BinOp, Reg, RuntimeFn, Signature, Type};
use hyperdrive_vm::iseq::Params;
use tracing::trace;

use super::FunctionCompiler;
use super::labels::{BranchSite, Condition};
use crate::error::{CompileError, Result};

/// Native calling convention for a parameter shape.
pub fn signature(params: &Params) -> Signature {
    if params.is_simple() {
        Signature::Fixed(params.required.len())
    } else {
        Signature::Variadic
    }
}

impl FunctionCompiler<'_, '_> {
    /// Binds the parameters of the method being compiled.
    pub(super) fn bind_method_arguments(&mut self) -> Result<()> {
        let iseq = self.iseq;
        let params = &iseq.params;
        if params.block.is_some() {
            return Err(CompileError::unsupported(0, "block parameter declared with &"));
        }
        match self.fb.signature() {
            Signature::Fixed(n) => {
                for (i, name) in params.required.iter().take(n).enumerate() {
                    let value = self.fb.param(i + 1);
                    self.scope.bind_argument(&mut self.fb, name, value)?;
                }
                Ok(())
            }
            Signature::Variadic => self.bind_variadic(),
            Signature::Internal(_) => {
                Err(CompileError::unsupported(0, "method with an internal signature"))
            }
        }
    }

    fn bind_variadic(&mut self) -> Result<()> {
        let iseq = self.iseq;
        let params = &iseq.params;
        let (argc, argv) = (self.fb.param(0), self.fb.param(1));
        let (min, max) = params.arity();
        let nopt = params.optional.len();
        if nopt > 0 && params.opt_table.len() != nopt + 1 {
            return Err(CompileError::unsupported(
                0,
                format!(
                    "optional entry table has {} entries for {} optionals",
                    params.opt_table.len(),
                    nopt
                ),
            ));
        }
        trace!(min, ?max, optional = nopt, rest = params.rest.is_some(), "variadic prologue");

        self.check_arity(argc, min, max);

        for (i, name) in params.required.iter().enumerate() {
            let value = self.fb.load(Type::Object, argv, i as i32);
            self.scope.bind_argument(&mut self.fb, name, value)?;
        }

        let min_reg = self.fb.const_int(min as i64);
        let extra = self.fb.sub(argc, min_reg);
        for (k, name) in params.optional.iter().enumerate() {
            let index = self.fb.const_int(k as i64);
            let supplied = self.fb.binary(BinOp::Gt, extra, index);
            let skip = self.fb.new_label();
            self.fb.branch_unless(supplied, skip);
            let value = self.fb.load(Type::Object, argv, (min + k) as i32);
            self.scope.bind_argument(&mut self.fb, name, value)?;
            self.fb.place(skip);
        }

        let supplied = self.fb.value(Type::Int);
        if nopt > 0 {
            self.fb.store(supplied, extra);
            let cap = self.fb.const_int(nopt as i64);
            let over = self.fb.binary(BinOp::Gt, extra, cap);
            let keep = self.fb.new_label();
            self.fb.branch_unless(over, keep);
            self.fb.store(supplied, cap);
            self.fb.place(keep);
        } else {
            let zero = self.fb.const_int(0);
            self.fb.store(supplied, zero);
        }

        if let Some(rest) = &params.rest {
            let count = self.fb.sub(extra, supplied);
            let skipped = self.fb.add(min_reg, supplied);
            let start = self.fb.binary(BinOp::Add, argv, skipped);
            let array = self.call(RuntimeFn::ArrayFromMemory, &[start, count]);
            self.scope.bind_rest_argument(&mut self.fb, rest, array)?;
        }

        if nopt > 0 {
            self.dispatch_optional(supplied)?;
        }
        Ok(())
    }

    fn check_arity(&mut self, argc: Reg, min: usize, max: Option<usize>) {
        let error = RuntimeFn::ArityError {
            min: min as u32,
            max: max.map(|max| max as u32),
        };
        if min > 0 {
            let lo = self.fb.const_int(min as i64);
            let short = self.fb.binary(BinOp::Lt, argc, lo);
            let ok = self.fb.new_label();
            self.fb.branch_unless(short, ok);
            self.call_void(error.clone(), &[argc]);
            self.fb.place(ok);
        }
        if let Some(max) = max {
            let hi = self.fb.const_int(max as i64);
            let long = self.fb.binary(BinOp::Gt, argc, hi);
            let ok = self.fb.new_label();
            self.fb.branch_unless(long, ok);
            self.call_void(error, &[argc]);
            self.fb.place(ok);
        }
    }

    /// Jumps to the default-value code for the first optional that was not
    /// supplied, or past all of it.
    fn dispatch_optional(&mut self, supplied: Reg) -> Result<()> {
        let table = self.iseq.params.opt_table.clone();
        let (last, entries) = match table.split_last() {
            Some(split) => split,
            None => return Ok(()),
        };
        let site = BranchSite { offset: 0, active: &[] };
        for (k, &target) in entries.iter().enumerate() {
            let count = self.fb.const_int(k as i64);
            let hit = self.fb.eq(supplied, count);
            self.labels.branch(
                &mut self.fb,
                &self.stack,
                &self.regions,
                site,
                Condition::If(hit),
                target,
            )?;
        }
        self.labels.branch(
            &mut self.fb,
            &self.stack,
            &self.regions,
            site,
            Condition::Always,
            *last,
        )?;
        self.reachable = false;
        Ok(())
    }
}
