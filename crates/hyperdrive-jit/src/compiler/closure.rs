// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Calls with literal blocks.
//!
//! The block is compiled into a body function of the same unit taking
//! `(packed, scope)`, where `packed` is the yielded value (undef for no
//! arguments, the value itself for one, an array for several) and `scope`
//! is the handle of the method's addressable scope.
//!
//! Under the fast and splat strategies the call site builds an iteration
//! record in frame memory, `[recv, scope, argc, args...]`, and asks the
//! runtime to iterate: a per-site trampoline re-issues the method call with
//! the body pending as its block. Under the proc strategy the body is
//! wrapped in a proc object passed along with the call.

use std::sync::Arc;

use hyperdrive_vm::backend::{FunctionBuilder, RuntimeFn, Signature, Type};
use hyperdrive_vm::iseq::Iseq;
use hyperdrive_vm::{SymbolId, Value};
use tracing::debug;

use super::FunctionCompiler;
use super::labels::{BranchSite, Condition};
use super::scope::ScopeLayout;
use super::translator::FunctionKind;
use crate::error::{CompileError, Result};
use crate::options::IterationStrategy;

/// Words in front of the arguments of an iteration record.
const RECORD_HEADER: u32 = 3;

impl<'a> FunctionCompiler<'_, 'a> {
    /// Translates a `send` carrying block `block` of this sequence.
    pub(super) fn send_with_block(&mut self, mid: &str, argc: usize, block: usize) -> Result<()> {
        let site = self.pc.site();
        let iseq = self.iseq;
        let Some(child) = iseq.blocks.get(block) else {
            return Err(CompileError::unsupported(
                site,
                format!("block index {} out of range", block),
            ));
        };
        if child.params.block.is_some() {
            return Err(CompileError::unsupported(site, "block parameter declared with &"));
        }
        let (Some(handle), Some(layout)) = (self.scope.capture_handle(), self.scope_layout.clone())
        else {
            return Err(CompileError::unsupported(site, "closure without an addressable scope"));
        };

        let takes_params = child.params.positional_count() > 0 || child.params.rest.is_some();
        let strategy = match self.unit.options().iteration_strategy {
            IterationStrategy::Proc if takes_params => IterationStrategy::Fast,
            strategy => strategy,
        };
        debug!(method = mid, block = %child.name, %strategy, "block call");

        let body = self.compile_block_body(child, layout, strategy)?;
        let mid = self.intern(mid);
        let args = self.pop_n(argc)?;
        let recv = self.pop()?;

        let result = match strategy {
            IterationStrategy::Proc => {
                let body = self.fb.function_addr(body);
                let proc = self.call(RuntimeFn::ProcNew, &[body, handle]);
                let mut operands = vec![recv, proc];
                operands.extend(args);
                let argc = argc as u32;
                self.call(RuntimeFn::InvokeWithProc { mid, argc }, &operands)
            }
            IterationStrategy::Fast | IterationStrategy::Splat => {
                let trampoline = self.compile_trampoline(mid, argc)?;
                let offset = self.fb.frame_alloc(RECORD_HEADER + argc as u32);
                let record = self.fb.frame_addr(offset);
                self.fb.store_at(record, 0, recv);
                self.fb.store_at(record, 1, handle);
                let count = self.fb.const_value(Value::fixnum(argc as i64).unwrap_or(Value::NIL));
                self.fb.store_at(record, 2, count);
                for (i, &arg) in args.iter().enumerate() {
                    self.fb.store_at(record, RECORD_HEADER as i32 + i as i32, arg);
                }
                let trampoline = self.fb.function_addr(trampoline);
                let body = self.fb.function_addr(body);
                self.call(RuntimeFn::Iterate, &[trampoline, record, body, handle])
            }
        };
        self.push(result);
        Ok(())
    }

    fn compile_block_body(
        &mut self,
        child: &'a Iseq,
        layout: Arc<ScopeLayout>,
        strategy: IterationStrategy,
    ) -> Result<u32> {
        let index = self.unit.reserve();
        let mut chain = self.chain.clone();
        chain.push(child);
        let body = FunctionCompiler::block(self.unit, chain, layout, strategy)?.compile()?;
        self.unit.fill(index, body);
        Ok(index)
    }

    /// Emits the trampoline a call site iterates through: it reloads the
    /// receiver and arguments from the iteration record and makes the call.
    fn compile_trampoline(&mut self, mid: SymbolId, argc: usize) -> Result<u32> {
        let name = format!(
            "{}:iterate:{}",
            self.iseq.name,
            self.unit.symbols().name(mid)
        );
        let mut fb = FunctionBuilder::new(name, Signature::Internal(1));
        let record = fb.param(0);
        let mut operands = vec![fb.load(Type::Object, record, 0)];
        for i in 0..argc {
            operands.push(fb.load(Type::Object, record, RECORD_HEADER as i32 + i as i32));
        }
        let argc = argc as u32;
        let result = fb.call(RuntimeFn::InvokeIterBlock { mid, argc }, &operands);
        fb.ret(result);

        let index = self.unit.reserve();
        self.unit.fill(index, fb.finish()?);
        Ok(index)
    }

    /// Block prologue: resets the block's own locals and destructures the
    /// yielded value into its parameters.
    pub(super) fn bind_block_parameters(&mut self) -> Result<()> {
        let iseq = self.iseq;
        let params = &iseq.params;
        if params.block.is_some() {
            return Err(CompileError::unsupported(0, "block parameter declared with &"));
        }
        let strategy = match self.kind {
            FunctionKind::Block(strategy) => strategy,
            FunctionKind::Method => IterationStrategy::Fast,
        };

        let names: Vec<&str> = params
            .required
            .iter()
            .chain(&params.optional)
            .map(String::as_str)
            .collect();
        let nil = self.fb.const_value(Value::NIL);
        for local in &iseq.locals {
            let is_param = names.contains(&local.as_str()) || params.rest.as_ref() == Some(local);
            if !is_param {
                self.write_variable(local, nil)?;
            }
        }

        let packed = self.fb.param(0);
        let count = names.len() as u32;
        let rest = params.rest.is_some();
        if count > 0 || rest {
            let array = self.call(RuntimeFn::SplatParams { count, rest }, &[packed]);
            for (i, name) in names.iter().enumerate() {
                let value = self.call(RuntimeFn::ArrayEntry { index: i as u32 }, &[array]);
                self.scope.bind_argument(&mut self.fb, name, value)?;
            }
            if let Some(rest) = &params.rest {
                let value = self.call(RuntimeFn::ArrayEntry { index: count }, &[array]);
                self.scope.bind_rest_argument(&mut self.fb, rest, value)?;
            }
        } else if strategy == IterationStrategy::Splat {
            self.call_void(RuntimeFn::SplatParams { count: 0, rest: false }, &[packed]);
        }

        if !params.optional.is_empty() {
            let Some(&entry) = params.opt_table.last() else {
                return Err(CompileError::unsupported(0, "optional parameters without entry table"));
            };
            let site = BranchSite { offset: 0, active: &[] };
            self.labels.branch(
                &mut self.fb,
                &self.stack,
                &self.regions,
                site,
                Condition::Always,
                entry,
            )?;
            self.reachable = false;
        }
        Ok(())
    }
}
