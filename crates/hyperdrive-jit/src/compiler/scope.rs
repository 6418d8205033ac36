// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Variable storage for one compiled function.
//!
//! Functions without closures keep every local in a register. Functions
//! that create closures, and the block bodies they own, share one
//! addressable scope block per method activation:
//!
//! ```text
//! word 0        1              2      3               4 ...
//! │ size        │ capture count │ self │ dynamic table │ cells ...
//! ```
//!
//! The block is wrapped in a GC handle whose mark callback scans it
//! conservatively and whose free callback releases it. Closures only ever
//! hold the handle.

use std::sync::Arc;

use hyperdrive_vm::backend::{FunctionBuilder, Reg, RuntimeFn, Type};
use hyperdrive_vm::iseq::Iseq;
use hyperdrive_vm::{SymbolTable, Value};
use rustc_hash::FxHashMap;
use tracing::debug;

use super::local::LocalCell;
use crate::error::{CompileError, Result};

/// Header words in front of the cells of a scope block.
pub const HEADER_WORDS: usize = 4;

const SIZE_SLOT: i32 = 0;
const CAPTURES_SLOT: i32 = 1;
const SELF_SLOT: i32 = 2;
const TABLE_SLOT: i32 = 3;

/// Cell assignment for a method scope: the method's own locals followed
/// by the locals of its immediate child blocks, one cell per distinct
/// name. Locals of deeper blocks live in the dynamic table.
///
/// Sibling blocks share the cells of names they both declare; each block
/// resets its own locals on entry. A block variable named like a
/// variable of an enclosing level would alias it, so such methods are
/// rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeLayout {
    names: Vec<String>,
    index: FxHashMap<String, usize>,
}

impl ScopeLayout {
    /// Computes the layout of `method`.
    pub fn for_method(method: &Iseq) -> Result<Self> {
        let mut enclosing: Vec<&str> = method.locals.iter().map(String::as_str).collect();
        for block in &method.blocks {
            check_shadowing(block, &mut enclosing)?;
        }

        let mut layout = Self::default();
        for name in &method.locals {
            layout.add(name);
        }
        for block in &method.blocks {
            for name in &block.locals {
                layout.add(name);
            }
        }
        for nested in method.blocks.iter().flat_map(|block| &block.blocks) {
            layout.check_dynamic(nested)?;
        }
        Ok(layout)
    }

    /// Locals of blocks below the first level must stay out of the cells.
    fn check_dynamic(&self, block: &Iseq) -> Result<()> {
        if let Some(name) = block.locals.iter().find(|name| self.index.contains_key(*name)) {
            return Err(CompileError::unsupported(
                0,
                format!("`{}` in `{}` reuses the name of a scope cell", name, block.name),
            ));
        }
        block.blocks.iter().try_for_each(|child| self.check_dynamic(child))
    }

    fn add(&mut self, name: &str) {
        if !self.index.contains_key(name) {
            self.index.insert(name.to_string(), self.names.len());
            self.names.push(name.to_string());
        }
    }

    /// Number of cells.
    pub fn captures(&self) -> usize {
        self.names.len()
    }

    /// Total block size in words.
    pub fn words(&self) -> usize {
        HEADER_WORDS + self.names.len()
    }

    /// Word offset of the cell for `name`.
    pub fn offset_of(&self, name: &str) -> Option<i32> {
        self.index.get(name).map(|i| (HEADER_WORDS + i) as i32)
    }

    /// Cell names in block order.
    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// Names bound as arguments, shared by both scope kinds.
#[derive(Debug, Clone, Default)]
struct Arguments {
    names: Vec<String>,
    rest: Option<String>,
}

/// Locals held in registers.
#[derive(Debug)]
pub struct RegisterScope {
    cells: FxHashMap<String, LocalCell>,
    args: Arguments,
    self_value: Reg,
}

impl RegisterScope {
    /// An empty scope for a function whose receiver is in `self_value`.
    pub fn new(self_value: Reg) -> Self {
        Self {
            cells: FxHashMap::default(),
            args: Arguments::default(),
            self_value,
        }
    }

    fn declare(&mut self, fb: &mut FunctionBuilder, name: &str) -> LocalCell {
        if let Some(cell) = self.cells.get(name) {
            return *cell;
        }
        let cell = LocalCell::register(fb);
        cell.init(fb);
        self.cells.insert(name.to_string(), cell);
        cell
    }
}

/// Locals held in a scope block.
#[derive(Debug)]
pub struct AddressableScope<'s> {
    layout: Arc<ScopeLayout>,
    block: Reg,
    handle: Reg,
    table: Reg,
    self_value: Reg,
    symbols: &'s SymbolTable,
    cells: FxHashMap<String, LocalCell>,
    args: Arguments,
}

impl<'s> AddressableScope<'s> {
    /// Emits construction of a fresh scope block for a method activation.
    pub fn create(
        fb: &mut FunctionBuilder,
        layout: Arc<ScopeLayout>,
        self_value: Reg,
        symbols: &'s SymbolTable,
    ) -> Self {
        let words = fb.const_int(layout.words() as i64);
        let block = fb.call(RuntimeFn::AllocZeroed, &[words]);

        let size = fb.const_int(layout.words() as i64);
        fb.store_at(block, SIZE_SLOT, size);
        let captures = fb.const_int(layout.captures() as i64);
        fb.store_at(block, CAPTURES_SLOT, captures);

        let nil = fb.const_value(Value::NIL);
        for i in 0..layout.captures() {
            fb.store_at(block, (HEADER_WORDS + i) as i32, nil);
        }

        let handle = fb.call(RuntimeFn::WrapScope, &[block]);
        fb.store_at(block, SELF_SLOT, self_value);

        // The table allocation may collect; everything above is reachable
        // through the handle by now.
        let table = fb.call(RuntimeFn::HashNew { count: 0 }, &[]);
        fb.store_at(block, TABLE_SLOT, table);

        debug!(cells = layout.captures(), "addressable scope");
        Self::with_block(layout, block, handle, table, self_value, symbols)
    }

    /// Emits code that reopens the scope behind `handle`, aliasing the
    /// parent activation's cells.
    pub fn load(
        fb: &mut FunctionBuilder,
        layout: Arc<ScopeLayout>,
        handle: Reg,
        symbols: &'s SymbolTable,
    ) -> Self {
        let block = fb.call(RuntimeFn::ScopePtr, &[handle]);
        let self_value = fb.load(Type::Object, block, SELF_SLOT);
        let table = fb.load(Type::Object, block, TABLE_SLOT);
        Self::with_block(layout, block, handle, table, self_value, symbols)
    }

    fn with_block(
        layout: Arc<ScopeLayout>,
        block: Reg,
        handle: Reg,
        table: Reg,
        self_value: Reg,
        symbols: &'s SymbolTable,
    ) -> Self {
        let cells = layout
            .names()
            .iter()
            .filter_map(|name| {
                let offset = layout.offset_of(name)?;
                Some((name.clone(), LocalCell::memory(block, offset)))
            })
            .collect();
        Self {
            layout,
            block,
            handle,
            table,
            self_value,
            symbols,
            cells,
            args: Arguments::default(),
        }
    }

    /// Register holding the scope block pointer.
    pub fn block(&self) -> Reg {
        self.block
    }

    /// Layout shared by every function of the unit.
    pub fn layout(&self) -> &Arc<ScopeLayout> {
        &self.layout
    }

    fn symbol(&self, fb: &mut FunctionBuilder, name: &str) -> Reg {
        fb.const_value(Value::symbol(self.symbols.intern(name)))
    }
}

/// The variable storage of one function.
#[derive(Debug)]
pub enum Scope<'s> {
    /// Every local in a register
    Registers(RegisterScope),
    /// Locals in a shared scope block
    Addressable(AddressableScope<'s>),
}

impl Scope<'_> {
    /// Declares `name`, initialized to nil. Declaring twice is harmless.
    pub fn declare(&mut self, fb: &mut FunctionBuilder, name: &str) {
        match self {
            Scope::Registers(scope) => {
                scope.declare(fb, name);
            }
            // Every cell of the layout exists from construction on.
            Scope::Addressable(_) => {}
        }
    }

    fn cell(&self, name: &str) -> Option<LocalCell> {
        match self {
            Scope::Registers(scope) => scope.cells.get(name).copied(),
            Scope::Addressable(scope) => scope.cells.get(name).copied(),
        }
    }

    /// Whether `name` has a cell.
    pub fn is_declared(&self, name: &str) -> bool {
        self.cell(name).is_some()
    }

    /// Reads a declared variable.
    pub fn get(&self, fb: &mut FunctionBuilder, name: &str, offset: usize) -> Result<Reg> {
        match self.cell(name) {
            Some(cell) => Ok(cell.get(fb)),
            None => Err(undeclared(name, offset)),
        }
    }

    /// Writes a declared variable.
    pub fn set(&self, fb: &mut FunctionBuilder, name: &str, value: Reg, offset: usize) -> Result<()> {
        match self.cell(name) {
            Some(cell) => {
                cell.set(fb, value);
                Ok(())
            }
            None => Err(undeclared(name, offset)),
        }
    }

    /// Reads a variable of any enclosing level. Names without a cell are
    /// looked up in the dynamic table; register scopes have no table.
    pub fn dynamic_get(&self, fb: &mut FunctionBuilder, name: &str, offset: usize) -> Result<Reg> {
        if let Some(cell) = self.cell(name) {
            return Ok(cell.get(fb));
        }
        match self {
            Scope::Registers(_) => Err(undeclared(name, offset)),
            Scope::Addressable(scope) => {
                let sym = scope.symbol(fb, name);
                Ok(fb.call(RuntimeFn::DynGet, &[scope.table, sym]))
            }
        }
    }

    /// Writes a variable of any enclosing level, falling back to the
    /// dynamic table like [`Scope::dynamic_get`].
    pub fn dynamic_set(
        &self,
        fb: &mut FunctionBuilder,
        name: &str,
        value: Reg,
        offset: usize,
    ) -> Result<()> {
        if let Some(cell) = self.cell(name) {
            cell.set(fb, value);
            return Ok(());
        }
        match self {
            Scope::Registers(_) => Err(undeclared(name, offset)),
            Scope::Addressable(scope) => {
                let sym = scope.symbol(fb, name);
                fb.call_void(RuntimeFn::DynSet, &[scope.table, sym, value]);
                Ok(())
            }
        }
    }

    /// Binds a positional argument.
    pub fn bind_argument(&mut self, fb: &mut FunctionBuilder, name: &str, value: Reg) -> Result<()> {
        self.declare(fb, name);
        self.dynamic_set(fb, name, value, 0)?;
        self.arguments_mut().names.push(name.to_string());
        Ok(())
    }

    /// Binds the rest argument array.
    pub fn bind_rest_argument(&mut self, fb: &mut FunctionBuilder, name: &str, value: Reg) -> Result<()> {
        self.declare(fb, name);
        self.dynamic_set(fb, name, value, 0)?;
        self.arguments_mut().rest = Some(name.to_string());
        Ok(())
    }

    fn arguments_mut(&mut self) -> &mut Arguments {
        match self {
            Scope::Registers(scope) => &mut scope.args,
            Scope::Addressable(scope) => &mut scope.args,
        }
    }

    /// Names bound by [`Scope::bind_argument`], in order.
    pub fn argument_names(&self) -> &[String] {
        match self {
            Scope::Registers(scope) => &scope.args.names,
            Scope::Addressable(scope) => &scope.args.names,
        }
    }

    /// Name bound by [`Scope::bind_rest_argument`].
    pub fn rest_argument(&self) -> Option<&str> {
        match self {
            Scope::Registers(scope) => scope.args.rest.as_deref(),
            Scope::Addressable(scope) => scope.args.rest.as_deref(),
        }
    }

    /// Register holding `self`.
    pub fn self_value(&self) -> Reg {
        match self {
            Scope::Registers(scope) => scope.self_value,
            Scope::Addressable(scope) => scope.self_value,
        }
    }

    /// The GC handle closures capture, for addressable scopes.
    pub fn capture_handle(&self) -> Option<Reg> {
        match self {
            Scope::Registers(_) => None,
            Scope::Addressable(scope) => Some(scope.handle),
        }
    }

    /// Whether locals live in a scope block.
    pub fn is_addressable(&self) -> bool {
        matches!(self, Scope::Addressable(_))
    }
}

fn check_shadowing<'i>(block: &'i Iseq, enclosing: &mut Vec<&'i str>) -> Result<()> {
    if let Some(name) = block.locals.iter().find(|name| enclosing.contains(&name.as_str())) {
        return Err(CompileError::unsupported(
            0,
            format!("`{}` in `{}` shadows an outer variable", name, block.name),
        ));
    }
    let mark = enclosing.len();
    enclosing.extend(block.locals.iter().map(String::as_str));
    for child in &block.blocks {
        check_shadowing(child, enclosing)?;
    }
    enclosing.truncate(mark);
    Ok(())
}

fn undeclared(name: &str, offset: usize) -> CompileError {
    CompileError::UndeclaredVariable {
        name: name.to_string(),
        offset,
    }
}
