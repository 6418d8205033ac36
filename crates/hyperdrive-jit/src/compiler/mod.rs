// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Instruction sequence to native code translation.
//!
//! # Module Structure
//!
//! - `translator`: the single-pass walk and per-opcode emitter
//! - `specialize`: inline fast paths for the `opt_*` instructions
//! - `closure`: block bodies, iterate trampolines and procs
//! - `arguments`: fixed and variable arity argument binding
//! - `scope` and `local`: variable storage
//! - `stack`: static and dynamic operand stack models
//! - `labels`: offset labels and branch emission
//! - `regions`: catch regions as handler-chain tags
//! - `pc`: the program counter

pub mod arguments;
pub mod closure;
pub mod labels;
pub mod local;
pub mod pc;
pub mod regions;
pub mod scope;
pub mod specialize;
pub mod stack;
pub mod translator;

pub use labels::{BranchSite, Condition, LabelManager};
pub use local::LocalCell;
pub use pc::ProgramCounter;
pub use regions::{Region, RegionCompiler};
pub use scope::{AddressableScope, RegisterScope, Scope, ScopeLayout};
pub use stack::{DynamicStack, OperandStack, StackShape, StaticStack};
pub use translator::FunctionCompiler;

use hyperdrive_vm::SymbolTable;
use hyperdrive_vm::backend::{FunctionBody, NativeFunction};
use hyperdrive_vm::iseq::Iseq;

use crate::error::{CompileError, Result};
use crate::options::CompileOptions;

/// Operand stack model used for every function of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackModel {
    /// Register slots
    Static,
    /// Runtime stack pointer
    Dynamic,
}

/// A unit under construction: the entry function and the closures it
/// owns, addressed by unit-local index.
#[derive(Debug)]
pub struct Unit<'a> {
    options: &'a CompileOptions,
    symbols: &'a SymbolTable,
    stack: StackModel,
    functions: Vec<Option<FunctionBody>>,
}

impl<'a> Unit<'a> {
    /// An empty unit.
    pub fn new(options: &'a CompileOptions, symbols: &'a SymbolTable, stack: StackModel) -> Self {
        Self {
            options,
            symbols,
            stack,
            functions: Vec::new(),
        }
    }

    /// Compile options.
    pub fn options(&self) -> &'a CompileOptions {
        self.options
    }

    /// Symbol table used for method and variable names.
    pub fn symbols(&self) -> &'a SymbolTable {
        self.symbols
    }

    /// Stack model.
    pub fn stack_model(&self) -> StackModel {
        self.stack
    }

    /// Reserves the next unit-local function index. Index 0 is the entry.
    pub fn reserve(&mut self) -> u32 {
        self.functions.push(None);
        self.functions.len() as u32 - 1
    }

    /// Fills a reserved index.
    pub fn fill(&mut self, index: u32, body: FunctionBody) {
        self.functions[index as usize] = Some(body);
    }

    /// Assembles the finished unit.
    pub fn finish(self) -> Result<NativeFunction> {
        let mut functions = self.functions.into_iter();
        let Some(Some(entry)) = functions.next() else {
            return Err(CompileError::unsupported(0, "unit without an entry function"));
        };
        let mut unit = NativeFunction::new(entry);
        for body in functions {
            match body {
                Some(body) => {
                    unit.add(body);
                }
                None => return Err(CompileError::unsupported(0, "unit with an unfinished closure")),
            }
        }
        Ok(unit)
    }
}

/// Compiles a method body into a unit with the given stack model.
pub fn compile_unit(
    iseq: &Iseq,
    options: &CompileOptions,
    symbols: &SymbolTable,
    stack: StackModel,
) -> Result<NativeFunction> {
    let mut unit = Unit::new(options, symbols, stack);
    let entry = unit.reserve();
    let body = FunctionCompiler::method(&mut unit, iseq)?.compile()?;
    unit.fill(entry, body);
    unit.finish()
}
