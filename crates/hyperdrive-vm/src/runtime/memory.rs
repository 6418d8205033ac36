// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Word-addressed memory blocks.
//!
//! Block 0 is the thread value stack. Every other block is allocated by
//! native code (scope blocks) and released by the free callback of the
//! data object that owns it.

use crate::backend::Ptr;

/// Memory blocks addressed by [`Ptr`].
#[derive(Debug)]
pub struct Memory {
    stack: Vec<u64>,
    stack_limit: usize,
    blocks: Vec<Option<Vec<u64>>>,
    free: Vec<u32>,
}

impl Memory {
    /// Creates memory with a value stack of at most `stack_limit` words.
    pub fn new(stack_limit: usize) -> Self {
        Self {
            stack: Vec::with_capacity(stack_limit.min(4096)),
            stack_limit,
            blocks: Vec::new(),
            free: Vec::new(),
        }
    }

    /// The value stack.
    pub fn stack(&self) -> &[u64] {
        &self.stack
    }

    /// The value stack, mutably.
    pub fn stack_mut(&mut self) -> &mut [u64] {
        &mut self.stack
    }

    /// Grows the value stack to at least `words`; false when over the limit.
    pub fn reserve_stack(&mut self, words: usize) -> bool {
        if words > self.stack_limit {
            return false;
        }
        if self.stack.len() < words {
            self.stack.resize(words, 0);
        }
        true
    }

    /// Allocates a zeroed block of `words` words.
    pub fn alloc(&mut self, words: usize) -> Ptr {
        let block = vec![0; words];
        let id = match self.free.pop() {
            Some(id) => {
                self.blocks[id as usize - 1] = Some(block);
                id
            }
            None => {
                self.blocks.push(Some(block));
                self.blocks.len() as u32
            }
        };
        Ptr::new(id, 0)
    }

    /// Releases the block `ptr` points into.
    pub fn release(&mut self, ptr: Ptr) {
        let id = ptr.block();
        if id == 0 {
            return;
        }
        if let Some(slot) = self.blocks.get_mut(id as usize - 1)
            && slot.take().is_some()
        {
            self.free.push(id);
        }
    }

    /// The words of the block `ptr` points into.
    pub fn block(&self, ptr: Ptr) -> Option<&[u64]> {
        match ptr.block() {
            0 => Some(&self.stack),
            id => self.blocks.get(id as usize - 1)?.as_deref(),
        }
    }

    fn block_mut(&mut self, id: u32) -> Option<&mut Vec<u64>> {
        match id {
            0 => Some(&mut self.stack),
            id => self.blocks.get_mut(id as usize - 1)?.as_mut(),
        }
    }

    /// Reads the word at `ptr`.
    pub fn read(&self, ptr: Ptr) -> Option<u64> {
        self.block(ptr)?.get(ptr.offset() as usize).copied()
    }

    /// Writes the word at `ptr`; false when out of bounds.
    pub fn write(&mut self, ptr: Ptr, word: u64) -> bool {
        match self
            .block_mut(ptr.block())
            .and_then(|block| block.get_mut(ptr.offset() as usize))
        {
            Some(slot) => {
                *slot = word;
                true
            }
            None => false,
        }
    }

    /// Number of live heap blocks.
    pub fn live_blocks(&self) -> usize {
        self.blocks.iter().filter(|block| block.is_some()).count()
    }
}
