// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! The native code backend.
//!
//! Compilers emit code through [`FunctionBuilder`], a thin register-machine
//! IR with typed values, labels, branches, memory access, calls into the
//! runtime, function addresses and handler-chain tags. Finished functions
//! are grouped into a [`NativeFunction`] unit, installed into the
//! [`CodeArena`] and run by the [`machine`] executor.
//!
//! ## Frame layout
//!
//! Each activation lives on the thread's value stack (memory block 0):
//!
//! ```text
//! base                       base + nregs          top
//! │ registers ...            │ frame memory ...    │ dynamic operand stack →
//! ```
//!
//! The thread's `sp` points at `top` on entry, so a callee's frame always
//! starts above everything the caller has synced.

mod builder;
mod function;
pub mod machine;

pub use builder::{BinOp, CheckedOp, FunctionBuilder, Insn, Label, Reg, RuntimeFn, TagSlot, Type, UnOp};
pub use function::{BackendError, CodeArena, CodeEntry, FuncId, FunctionBody, NativeFunction, Signature};

/// A pointer into runtime memory: `(block << 32) | word offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ptr(u64);

impl Ptr {
    /// Creates a pointer to `offset` words into `block`.
    pub fn new(block: u32, offset: u32) -> Self {
        Ptr(((block as u64) << 32) | offset as u64)
    }

    /// Reinterprets a raw word.
    pub fn from_raw(raw: u64) -> Self {
        Ptr(raw)
    }

    /// The raw word.
    pub fn raw(self) -> u64 {
        self.0
    }

    /// Memory block id.
    pub fn block(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Word offset inside the block.
    pub fn offset(self) -> u32 {
        self.0 as u32
    }

    /// Adds a signed word offset.
    pub fn add(self, words: i64) -> Self {
        let offset = (self.offset() as i64 + words) as u32;
        Ptr::new(self.block(), offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ptr_arithmetic_stays_in_block() {
        let p = Ptr::new(3, 10);
        assert_eq!(p.add(5).offset(), 15);
        assert_eq!(p.add(-10).offset(), 0);
        assert_eq!(p.add(5).block(), 3);
    }
}
