// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! An assembler for instruction sequences.
//!
//! The builder tracks the operand stack depth as instructions are emitted
//! so that catch regions can record the depth at their continuation, and
//! it resolves symbolic labels into relative branch offsets on
//! [`IseqBuilder::build`]. Like the YARV compiler, it adds a `break`
//! region around every `send` that carries a block.

use super::{CallFlags, CatchEntry, CatchKind, Instruction, Iseq, IseqKind, Literal, Params};
use crate::error::{Result, RuntimeError};

/// A symbolic position in the sequence under construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Debug, Default, Clone)]
struct LabelState {
    offset: Option<usize>,
    depth: Option<usize>,
}

#[derive(Debug)]
struct PendingRegion {
    kind: CatchKind,
    start: Label,
    end: Label,
    cont: Label,
    handler: Option<Label>,
    sp: usize,
}

/// Builds an [`Iseq`].
#[derive(Debug)]
pub struct IseqBuilder {
    name: String,
    kind: IseqKind,
    params: Params,
    locals: Vec<String>,
    code: Vec<Instruction>,
    offsets: Vec<usize>,
    next: usize,
    labels: Vec<LabelState>,
    fixups: Vec<(usize, Label)>,
    opt_labels: Vec<Label>,
    regions: Vec<PendingRegion>,
    blocks: Vec<Iseq>,
    depth: usize,
    reachable: bool,
}

impl IseqBuilder {
    /// Creates a builder for a sequence of the given kind.
    pub fn new(name: impl Into<String>, kind: IseqKind) -> Self {
        Self {
            name: name.into(),
            kind,
            params: Params::default(),
            locals: Vec::new(),
            code: Vec::new(),
            offsets: Vec::new(),
            next: 0,
            labels: Vec::new(),
            fixups: Vec::new(),
            opt_labels: Vec::new(),
            regions: Vec::new(),
            blocks: Vec::new(),
            depth: 0,
            reachable: true,
        }
    }

    /// Creates a method builder.
    pub fn method(name: impl Into<String>) -> Self {
        Self::new(name, IseqKind::Method)
    }

    /// Creates a block builder.
    pub fn block(name: impl Into<String>) -> Self {
        Self::new(name, IseqKind::Block)
    }

    /// Creates a top-level builder.
    pub fn top(name: impl Into<String>) -> Self {
        Self::new(name, IseqKind::Top)
    }

    // ========================================================================
    // Locals and parameters
    // ========================================================================

    /// Declares a local if absent and returns its index.
    pub fn local(&mut self, name: &str) -> usize {
        match self.locals.iter().position(|l| l == name) {
            Some(index) => index,
            None => {
                self.locals.push(name.to_string());
                self.locals.len() - 1
            }
        }
    }

    /// Declares a required parameter.
    pub fn required(&mut self, name: &str) -> usize {
        self.params.required.push(name.to_string());
        self.local(name)
    }

    /// Declares an optional parameter. Its default-value code must be
    /// emitted in order, each fragment starting at an [`opt_entry`](Self::opt_entry).
    pub fn optional(&mut self, name: &str) -> usize {
        self.params.optional.push(name.to_string());
        self.local(name)
    }

    /// Marks the entry point used when as many optional arguments were
    /// supplied as there are entries marked before this one.
    pub fn opt_entry(&mut self) {
        let label = self.label();
        self.place(label);
        self.opt_labels.push(label);
    }

    /// Declares the rest parameter.
    pub fn rest(&mut self, name: &str) -> usize {
        self.params.rest = Some(name.to_string());
        self.local(name)
    }

    /// Declares a block parameter.
    pub fn block_param(&mut self, name: &str) -> usize {
        self.params.block = Some(name.to_string());
        self.local(name)
    }

    // ========================================================================
    // Labels and stack depth
    // ========================================================================

    /// Allocates an unplaced label.
    pub fn label(&mut self) -> Label {
        self.labels.push(LabelState::default());
        Label(self.labels.len() - 1)
    }

    /// Places `label` at the current offset.
    pub fn place(&mut self, label: Label) {
        let state = &mut self.labels[label.0];
        state.offset = Some(self.next);
        match state.depth {
            Some(depth) if !self.reachable => self.depth = depth,
            _ => state.depth = Some(self.depth),
        }
        self.reachable = true;
    }

    /// Current offset.
    pub fn here(&self) -> usize {
        self.next
    }

    /// Current tracked stack depth.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Overrides the tracked stack depth.
    pub fn set_depth(&mut self, depth: usize) {
        self.depth = depth;
    }

    fn note_branch(&mut self, label: Label) {
        let depth = self.depth;
        let state = &mut self.labels[label.0];
        if state.depth.is_none() {
            state.depth = Some(depth);
        }
    }

    // ========================================================================
    // Emission
    // ========================================================================

    /// Emits an instruction and returns its offset.
    pub fn emit(&mut self, insn: Instruction) -> usize {
        let at = self.next;
        let (pops, pushes) = insn.stack_effect();
        self.depth = self.depth.saturating_sub(pops) + pushes;
        self.reachable = !insn.is_terminator();
        self.next += insn.len();
        self.offsets.push(at);
        self.code.push(insn);
        at
    }

    fn emit_branch(&mut self, insn: Instruction, label: Label) {
        let index = self.code.len();
        self.emit(insn);
        self.fixups.push((index, label));
        self.note_branch(label);
    }

    /// `putnil`
    pub fn putnil(&mut self) -> &mut Self {
        self.emit(Instruction::PutNil);
        self
    }

    /// `putself`
    pub fn putself(&mut self) -> &mut Self {
        self.emit(Instruction::PutSelf);
        self
    }

    /// `putobject`
    pub fn putobject(&mut self, value: Literal) -> &mut Self {
        self.emit(Instruction::PutObject { value });
        self
    }

    /// `putobject` of an integer.
    pub fn int(&mut self, n: i64) -> &mut Self {
        self.putobject(Literal::Int(n))
    }

    /// `putstring`
    pub fn putstring(&mut self, value: &str) -> &mut Self {
        self.emit(Instruction::PutString {
            value: value.to_string(),
        });
        self
    }

    /// `duparray`
    pub fn duparray(&mut self, values: Vec<Literal>) -> &mut Self {
        self.emit(Instruction::DupArray { values });
        self
    }

    /// `newarray`
    pub fn newarray(&mut self, count: usize) -> &mut Self {
        self.emit(Instruction::NewArray { count });
        self
    }

    /// `newhash`
    pub fn newhash(&mut self, count: usize) -> &mut Self {
        self.emit(Instruction::NewHash { count });
        self
    }

    /// `getconstant`
    pub fn getconstant(&mut self, name: &str) -> &mut Self {
        self.emit(Instruction::GetConstant {
            name: name.to_string(),
        });
        self
    }

    /// `getlocal`, declaring the local if needed.
    pub fn getlocal(&mut self, name: &str) -> &mut Self {
        let index = self.local(name);
        self.emit(Instruction::GetLocal { index });
        self
    }

    /// `setlocal`, declaring the local if needed.
    pub fn setlocal(&mut self, name: &str) -> &mut Self {
        let index = self.local(name);
        self.emit(Instruction::SetLocal { index });
        self
    }

    /// `getdynamic`
    pub fn getdynamic(&mut self, index: usize, level: usize) -> &mut Self {
        self.emit(Instruction::GetDynamic { index, level });
        self
    }

    /// `setdynamic`
    pub fn setdynamic(&mut self, index: usize, level: usize) -> &mut Self {
        self.emit(Instruction::SetDynamic { index, level });
        self
    }

    /// `pop`
    pub fn pop(&mut self) -> &mut Self {
        self.emit(Instruction::Pop);
        self
    }

    /// `dup`
    pub fn dup(&mut self) -> &mut Self {
        self.emit(Instruction::Dup);
        self
    }

    /// `swap`
    pub fn swap(&mut self) -> &mut Self {
        self.emit(Instruction::Swap);
        self
    }

    /// `topn`
    pub fn topn(&mut self, n: usize) -> &mut Self {
        self.emit(Instruction::TopN { n });
        self
    }

    /// `setn`
    pub fn setn(&mut self, n: usize) -> &mut Self {
        self.emit(Instruction::SetN { n });
        self
    }

    /// `jump`
    pub fn jump(&mut self, label: Label) -> &mut Self {
        self.emit_branch(Instruction::Jump { offset: 0 }, label);
        self
    }

    /// `branchif`
    pub fn branchif(&mut self, label: Label) -> &mut Self {
        self.emit_branch(Instruction::BranchIf { offset: 0 }, label);
        self
    }

    /// `branchunless`
    pub fn branchunless(&mut self, label: Label) -> &mut Self {
        self.emit_branch(Instruction::BranchUnless { offset: 0 }, label);
        self
    }

    /// `send` with an explicit receiver.
    pub fn send(&mut self, mid: &str, argc: usize) -> &mut Self {
        self.emit(Instruction::Send {
            mid: mid.to_string(),
            argc,
            block: None,
            flags: CallFlags::default(),
        });
        self
    }

    /// `send` to self (the receiver must still be pushed with `putself`).
    pub fn fcall(&mut self, mid: &str, argc: usize) -> &mut Self {
        self.emit(Instruction::Send {
            mid: mid.to_string(),
            argc,
            block: None,
            flags: CallFlags {
                fcall: true,
                ..CallFlags::default()
            },
        });
        self
    }

    /// `send` with an attached block, wrapped in a `break` region whose
    /// continuation is the following instruction.
    pub fn send_with_block(&mut self, mid: &str, argc: usize, block: Iseq) -> &mut Self {
        let index = self.blocks.len();
        self.blocks.push(block);
        let start = self.label();
        self.place(start);
        self.emit(Instruction::Send {
            mid: mid.to_string(),
            argc,
            block: Some(index),
            flags: CallFlags::default(),
        });
        let cont = self.label();
        self.place(cont);
        let sp = self.depth.saturating_sub(1);
        self.region(CatchKind::Break, start, cont, cont, None, sp);
        self
    }

    /// `invokeblock`
    pub fn invokeblock(&mut self, argc: usize) -> &mut Self {
        self.emit(Instruction::InvokeBlock { argc });
        self
    }

    /// `leave`
    pub fn leave(&mut self) -> &mut Self {
        self.emit(Instruction::Leave);
        self
    }

    /// `throw`
    pub fn throw(&mut self, state: u32) -> &mut Self {
        self.emit(Instruction::Throw { state });
        self
    }

    /// `rethrow`
    pub fn rethrow(&mut self) -> &mut Self {
        self.emit(Instruction::Rethrow);
        self
    }

    /// Emits any operand-free instruction.
    pub fn op(&mut self, insn: Instruction) -> &mut Self {
        self.emit(insn);
        self
    }

    // ========================================================================
    // Catch regions
    // ========================================================================

    /// Registers a catch region protecting `[start, end)`; `end` is the
    /// label placed right after the last protected instruction.
    pub fn region(
        &mut self,
        kind: CatchKind,
        start: Label,
        end: Label,
        cont: Label,
        handler: Option<Label>,
        sp: usize,
    ) {
        self.regions.push(PendingRegion {
            kind,
            start,
            end,
            cont,
            handler,
            sp,
        });
    }

    /// Registers a rescue region; the handler starts with the exception on
    /// top of a stack of depth `sp`.
    pub fn rescue(&mut self, start: Label, end: Label, handler: Label, cont: Label, sp: usize) {
        self.region(CatchKind::Rescue, start, end, cont, Some(handler), sp);
    }

    /// Registers an ensure region; the handler starts with the state code and
    /// payload on top of a stack of depth `sp` and must end in `rethrow`.
    pub fn ensure(&mut self, start: Label, end: Label, handler: Label, cont: Label, sp: usize) {
        self.region(CatchKind::Ensure, start, end, cont, Some(handler), sp);
    }

    // ========================================================================
    // Finishing
    // ========================================================================

    fn resolve(&self, label: Label) -> Result<usize> {
        self.labels[label.0].offset.ok_or_else(|| {
            RuntimeError::invalid_program(format!("{}: label {} never placed", self.name, label.0))
        })
    }

    /// Resolves labels and regions and validates the result.
    pub fn build(mut self) -> Result<Iseq> {
        for (index, label) in std::mem::take(&mut self.fixups) {
            let target = self.resolve(label)? as i64;
            let base = (self.offsets[index] + self.code[index].len()) as i64;
            let rel = (target - base) as i32;
            match &mut self.code[index] {
                Instruction::Jump { offset }
                | Instruction::BranchIf { offset }
                | Instruction::BranchUnless { offset } => *offset = rel,
                _ => unreachable!("fixup on a non-branch instruction"),
            }
        }

        let mut catch_table = Vec::with_capacity(self.regions.len());
        for region in &self.regions {
            let start = self.resolve(region.start)?;
            let end_exclusive = self.resolve(region.end)?;
            let end = self
                .offsets
                .iter()
                .copied()
                .filter(|&o| o >= start && o < end_exclusive)
                .max()
                .ok_or_else(|| {
                    RuntimeError::invalid_program(format!(
                        "{}: empty {} region at {}",
                        self.name,
                        region.kind.name(),
                        start
                    ))
                })?;
            let handler = match region.handler {
                Some(label) => Some(self.resolve(label)?),
                None => None,
            };
            catch_table.push(CatchEntry {
                kind: region.kind,
                start,
                end,
                cont: self.resolve(region.cont)?,
                handler,
                sp: region.sp,
            });
        }
        catch_table.sort_by_key(|entry| (entry.start, entry.end));

        let mut params = self.params;
        params.opt_table = self
            .opt_labels
            .iter()
            .map(|&label| self.labels[label.0].offset.unwrap_or(0))
            .collect();

        let iseq = Iseq {
            name: self.name,
            kind: self.kind,
            params,
            locals: self.locals,
            code: self.code,
            catch_table,
            blocks: self.blocks,
        };
        iseq.validate()?;
        Ok(iseq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_branch_is_relative_to_next_instruction() {
        let mut b = IseqBuilder::method("t");
        let done = b.label();
        b.putnil().branchunless(done).int(1).leave();
        b.place(done);
        b.int(2).leave();
        let iseq = b.build().unwrap();
        // putnil@0 branchunless@1 putobject@3 leave@5 putobject@6
        assert_eq!(iseq.code[1], Instruction::BranchUnless { offset: 3 });
    }

    #[test]
    fn test_depth_restored_at_label_after_jump() {
        let mut b = IseqBuilder::method("t");
        let other = b.label();
        let join = b.label();
        b.putnil().branchunless(other).int(1).jump(join);
        b.place(other);
        assert_eq!(b.depth(), 0);
        b.int(2);
        b.place(join);
        assert_eq!(b.depth(), 1);
        b.leave();
        assert!(b.build().is_ok());
    }

    #[test]
    fn test_send_with_block_adds_break_region() {
        let mut blk = IseqBuilder::block("blk");
        blk.putnil().leave();
        let blk = blk.build().unwrap();

        let mut b = IseqBuilder::method("t");
        b.duparray(vec![Literal::Int(1)]);
        b.send_with_block("each", 0, blk);
        b.leave();
        let iseq = b.build().unwrap();

        assert_eq!(iseq.catch_table.len(), 1);
        let entry = &iseq.catch_table[0];
        assert_eq!(entry.kind, CatchKind::Break);
        assert_eq!((entry.start, entry.end, entry.cont, entry.sp), (2, 2, 7, 0));
    }

    #[test]
    fn test_unplaced_label_is_an_error() {
        let mut b = IseqBuilder::method("t");
        let nowhere = b.label();
        b.jump(nowhere);
        assert!(b.build().is_err());
    }
}
