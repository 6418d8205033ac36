// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Program counter over the instruction sequence being compiled.

/// Tracks the offset of the instruction being compiled (the branch site)
/// and the offset after it (the relative branch base, also used to tag
/// static stack slots).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgramCounter {
    site: usize,
    next: usize,
}

impl ProgramCounter {
    /// A counter at offset 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves back to offset 0.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Offset of the next instruction to be compiled.
    pub fn offset(&self) -> usize {
        self.next
    }

    /// Steps over an instruction of `len` words.
    pub fn advance(&mut self, len: usize) {
        self.site = self.next;
        self.next += len;
    }

    /// Offset of the instruction being compiled.
    pub fn site(&self) -> usize {
        self.site
    }

    /// Offset just past the instruction being compiled.
    pub fn advanced(&self) -> usize {
        self.next
    }

    /// Absolute target of a relative branch operand, or `None` when it
    /// lands before the start of the sequence.
    pub fn resolve(&self, relative: i32) -> Option<usize> {
        usize::try_from(self.next as i64 + relative as i64).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_and_resolve() {
        let mut pc = ProgramCounter::new();
        pc.advance(2);
        pc.advance(5);
        assert_eq!(pc.site(), 2);
        assert_eq!(pc.advanced(), 7);
        assert_eq!(pc.resolve(-7), Some(0));
        assert_eq!(pc.resolve(3), Some(10));
        assert_eq!(pc.resolve(-8), None);

        pc.reset();
        assert_eq!(pc.offset(), 0);
    }
}
