// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Native labels for bytecode offsets, and the branches that target them.

use hyperdrive_vm::backend::{FunctionBuilder, Label, Reg};
use rustc_hash::FxHashMap;
use tracing::trace;

use super::regions::RegionCompiler;
use super::stack::{OperandStack, StackShape};
use crate::error::{CompileError, Result};

/// When a branch is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    /// Always
    Always,
    /// When the register is non-zero
    If(Reg),
    /// When the register is zero
    Unless(Reg),
}

/// Where a branch comes from: the offset reported in errors and the
/// regions whose tags are on the chain at that point.
#[derive(Debug, Clone, Copy)]
pub struct BranchSite<'a> {
    /// Offset of the branching instruction
    pub offset: usize,
    /// Active regions, enclosing first
    pub active: &'a [usize],
}

/// One label per bytecode offset, plus the stack shape every predecessor
/// agreed on.
#[derive(Debug, Default)]
pub struct LabelManager {
    labels: FxHashMap<usize, Label>,
    shapes: FxHashMap<usize, StackShape>,
}

impl LabelManager {
    /// An empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// The label for `offset`, created on first use.
    pub fn label_at(&mut self, fb: &mut FunctionBuilder, offset: usize) -> Label {
        *self.labels.entry(offset).or_insert_with(|| fb.new_label())
    }

    /// Binds the label for `offset` to the current position.
    pub fn place(&mut self, fb: &mut FunctionBuilder, offset: usize) -> Label {
        let label = self.label_at(fb, offset);
        if !fb.is_placed(label) {
            fb.place(label);
        }
        label
    }

    /// Number of labels created.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Whether no label was created yet.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Shape recorded for `offset` by an earlier predecessor.
    pub fn shape_at(&self, offset: usize) -> Option<&StackShape> {
        self.shapes.get(&offset)
    }

    /// Records the stack shape a predecessor brings to `target`. Depths
    /// must agree across predecessors.
    pub fn record(&mut self, target: usize, shape: Option<StackShape>, site: usize) -> Result<()> {
        let Some(shape) = shape else {
            return Ok(());
        };
        match self.shapes.get(&target) {
            Some(known) if known.depth() != shape.depth() => {
                Err(CompileError::UnsafeBranch { offset: site, target })
            }
            Some(_) => Ok(()),
            None => {
                self.shapes.insert(target, shape);
                Ok(())
            }
        }
    }

    /// Emits a branch to the bytecode offset `target`, adjusting the
    /// handler chain on the taken path when the branch crosses region
    /// boundaries.
    pub fn branch(
        &mut self,
        fb: &mut FunctionBuilder,
        stack: &OperandStack,
        regions: &RegionCompiler,
        site: BranchSite<'_>,
        cond: Condition,
        target: usize,
    ) -> Result<()> {
        stack.validate_branch(site.offset, target)?;
        self.record(target, stack.snapshot(), site.offset)?;
        let label = self.label_at(fb, target);
        let dest = regions.active_at(target);
        trace!(site = site.offset, target, ?cond, "branch");

        if !regions.needs_transition(site.active, &dest) {
            match cond {
                Condition::Always => fb.branch(label),
                Condition::If(c) => fb.branch_if(c, label),
                Condition::Unless(c) => fb.branch_unless(c, label),
            }
            return Ok(());
        }

        let skip = match cond {
            Condition::Always => None,
            Condition::If(c) => {
                let skip = fb.new_label();
                fb.branch_unless(c, skip);
                Some(skip)
            }
            Condition::Unless(c) => {
                let skip = fb.new_label();
                fb.branch_if(c, skip);
                Some(skip)
            }
        };
        regions.transition(fb, site.active, &dest);
        fb.branch(label);
        if let Some(skip) = skip {
            fb.place(skip);
        }
        Ok(())
    }
}
