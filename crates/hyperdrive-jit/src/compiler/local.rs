// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Local variable cells.

use hyperdrive_vm::Value;
use hyperdrive_vm::backend::{FunctionBuilder, Reg, Type};

/// Where one local variable lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalCell {
    /// A builder register owned by the function
    Register(Reg),
    /// A word of a scope block, `block` holding the block pointer
    Memory {
        /// Register holding the block pointer
        block: Reg,
        /// Word offset inside the block
        offset: i32,
    },
}

impl LocalCell {
    /// A fresh register-resident cell.
    pub fn register(fb: &mut FunctionBuilder) -> Self {
        LocalCell::Register(fb.value(Type::Object))
    }

    /// A cell at `offset` words into the block `block` points to.
    pub fn memory(block: Reg, offset: i32) -> Self {
        LocalCell::Memory { block, offset }
    }

    /// Stores nil.
    pub fn init(&self, fb: &mut FunctionBuilder) {
        let nil = fb.const_value(Value::NIL);
        self.set(fb, nil);
    }

    /// The current value. For register cells the result is the cell itself.
    pub fn get(&self, fb: &mut FunctionBuilder) -> Reg {
        match *self {
            LocalCell::Register(reg) => reg,
            LocalCell::Memory { block, offset } => fb.load(Type::Object, block, offset),
        }
    }

    /// Overwrites the value.
    pub fn set(&self, fb: &mut FunctionBuilder, value: Reg) {
        match *self {
            LocalCell::Register(reg) => fb.store(reg, value),
            LocalCell::Memory { block, offset } => fb.store_at(block, offset, value),
        }
    }
}
