// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Catch regions compiled to handler-chain tags.
//!
//! Each catch table entry owns one tag and one state register. Entering
//! a region pushes the tag and records a checkpoint; a non-local exit
//! that reaches the tag resumes at the checkpoint with its state code,
//! which sends control to the region's dispatch block. Regions are kept
//! enclosing-first, so the regions active at any offset come out in the
//! order their tags are pushed.

use std::cmp::Reverse;

use hyperdrive_vm::State;
use hyperdrive_vm::backend::{FunctionBuilder, Label, Reg, TagSlot, Type};
use hyperdrive_vm::iseq::{CatchEntry, CatchKind, Iseq, Layout};
use tracing::debug;

use crate::error::{CompileError, Result};

/// One compiled region.
#[derive(Debug, Clone)]
pub struct Region {
    /// The catch table entry
    pub entry: CatchEntry,
    /// Tag pushed while the region is active
    pub tag: TagSlot,
    /// State code observed at the last checkpoint
    pub state: Reg,
    /// Start of the dispatch block
    pub dispatch: Label,
}

impl Region {
    /// State code this region handles; `None` for ensure, which handles
    /// every state.
    pub fn handled_state(&self) -> Option<State> {
        match self.entry.kind {
            CatchKind::Rescue => Some(State::Raise),
            CatchKind::Ensure => None,
            CatchKind::Retry => Some(State::Retry),
            CatchKind::Break => Some(State::Break),
            CatchKind::Redo => Some(State::Redo),
            CatchKind::Next => Some(State::Next),
        }
    }

    /// Offset control continues at once the exit is handled.
    pub fn target(&self) -> usize {
        match self.entry.kind {
            CatchKind::Rescue | CatchKind::Ensure => self.entry.handler.unwrap_or(self.entry.cont),
            _ => self.entry.cont,
        }
    }
}

/// All regions of one function.
#[derive(Debug, Default)]
pub struct RegionCompiler {
    regions: Vec<Region>,
}

impl RegionCompiler {
    /// Allocates a tag, a state register and a dispatch label per region.
    pub fn new(fb: &mut FunctionBuilder, iseq: &Iseq, layout: &Layout) -> Result<Self> {
        let table = &iseq.catch_table;
        for (i, a) in table.iter().enumerate() {
            for b in &table[i + 1..] {
                let disjoint = a.end < b.start || b.end < a.start;
                if !disjoint && !a.encloses(b) && !b.encloses(a) {
                    return Err(CompileError::unsupported(
                        b.start,
                        format!(
                            "{} region {}..={} partially overlaps {}..={}",
                            b.kind.name(),
                            b.start,
                            b.end,
                            a.start,
                            a.end
                        ),
                    ));
                }
            }
            let lands = |offset: usize| offset == layout.end || layout.index_of(offset).is_some();
            let handler_ok = a.handler.is_none_or(lands);
            if !lands(a.cont) || !handler_ok || layout.index_of(a.start).is_none() {
                return Err(CompileError::unsupported(
                    a.start,
                    format!("malformed {} region", a.kind.name()),
                ));
            }
        }

        let mut entries: Vec<CatchEntry> = table.clone();
        entries.sort_by_key(|entry| (entry.start, Reverse(entry.end)));
        let regions = entries
            .into_iter()
            .map(|entry| Region {
                entry,
                tag: fb.new_tag(),
                state: fb.value(Type::Int),
                dispatch: fb.new_label(),
            })
            .collect();
        Ok(Self { regions })
    }

    /// Number of regions.
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Whether the function has no regions.
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Region `index`.
    pub fn get(&self, index: usize) -> &Region {
        &self.regions[index]
    }

    /// Regions covering `offset`, enclosing first.
    pub fn active_at(&self, offset: usize) -> Vec<usize> {
        self.select(|entry| entry.covers(offset))
    }

    /// Regions whose first instruction is at `offset`, enclosing first.
    pub fn starting_at(&self, offset: usize) -> Vec<usize> {
        self.select(|entry| entry.start == offset)
    }

    /// Regions whose last instruction is at `offset`, innermost first.
    pub fn ending_at(&self, offset: usize) -> Vec<usize> {
        let mut ending = self.select(|entry| entry.end == offset);
        ending.reverse();
        ending
    }

    /// Regions whose tags are below `index` on the chain while it is
    /// active, enclosing first.
    pub fn enclosing(&self, index: usize) -> Vec<usize> {
        self.active_at(self.regions[index].entry.start)
            .into_iter()
            .take_while(|&i| i != index)
            .collect()
    }

    fn select(&self, pred: impl Fn(&CatchEntry) -> bool) -> Vec<usize> {
        self.regions
            .iter()
            .enumerate()
            .filter(|(_, region)| pred(&region.entry))
            .map(|(i, _)| i)
            .collect()
    }

    /// Pushes the region's tag and records its checkpoint; a non-zero
    /// state sends control to the dispatch block.
    pub fn enter(&self, fb: &mut FunctionBuilder, index: usize) {
        let region = &self.regions[index];
        fb.push_tag(region.tag);
        let state = fb.checkpoint(region.tag);
        fb.store(region.state, state);
        fb.branch_if(region.state, region.dispatch);
    }

    /// Pops the region's tag.
    pub fn exit(&self, fb: &mut FunctionBuilder, index: usize) {
        fb.pop_tag(self.regions[index].tag);
    }

    /// Whether moving between the two active sets changes the chain.
    pub fn needs_transition(&self, from: &[usize], to: &[usize]) -> bool {
        from != to
    }

    /// Emits the tag changes for a control transfer: regions left are
    /// popped innermost first, regions entered are pushed enclosing first
    /// with fresh checkpoints.
    pub fn transition(&self, fb: &mut FunctionBuilder, from: &[usize], to: &[usize]) {
        for &index in from.iter().rev() {
            if !to.contains(&index) {
                self.exit(fb, index);
            }
        }
        for &index in to {
            if !from.contains(&index) {
                debug!(kind = self.regions[index].entry.kind.name(), "re-entering region");
                self.enter(fb, index);
            }
        }
    }

    /// Pops every region in `active`, innermost first.
    pub fn exit_all(&self, fb: &mut FunctionBuilder, active: &[usize]) {
        for &index in active.iter().rev() {
            self.exit(fb, index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyperdrive_vm::backend::{Insn, Signature};
    use hyperdrive_vm::iseq::IseqBuilder;

    fn nested() -> Iseq {
        let mut b = IseqBuilder::top("nested");
        let (outer_start, inner_start) = (b.label(), b.label());
        let (inner_end, outer_end) = (b.label(), b.label());
        let (outer_handler, cont) = (b.label(), b.label());
        b.place(outer_start);
        b.putnil().pop();
        b.place(inner_start);
        b.putstring("x").throw(0);
        b.place(inner_end);
        b.putnil().pop();
        b.place(outer_end);
        b.jump(cont);
        b.place(outer_handler);
        b.set_depth(1);
        b.pop().putnil().leave();
        b.place(cont);
        b.putnil().leave();
        b.region(CatchKind::Retry, inner_start, inner_end, inner_start, None, 0);
        b.rescue(outer_start, outer_end, outer_handler, cont, 0);
        b.build().unwrap()
    }

    #[test]
    fn test_active_sets_are_enclosing_first() {
        let iseq = nested();
        let mut fb = FunctionBuilder::new("f", Signature::Fixed(0));
        let regions = RegionCompiler::new(&mut fb, &iseq, &iseq.layout()).unwrap();
        assert_eq!(regions.len(), 2);
        let inner_start = regions.get(1).entry.start;
        assert_eq!(regions.get(0).entry.kind, CatchKind::Rescue);
        assert_eq!(regions.active_at(inner_start), vec![0, 1]);
        assert_eq!(regions.active_at(0), vec![0]);
        assert_eq!(regions.enclosing(1), vec![0]);
        assert_eq!(regions.starting_at(inner_start), vec![1]);
    }

    #[test]
    fn test_transition_pops_inner_first_and_pushes_outer_first() {
        let iseq = nested();
        let mut fb = FunctionBuilder::new("f", Signature::Fixed(0));
        let regions = RegionCompiler::new(&mut fb, &iseq, &iseq.layout()).unwrap();
        let (outer, inner) = (regions.get(0).tag, regions.get(1).tag);

        regions.transition(&mut fb, &[0, 1], &[]);
        assert_eq!(fb.insns()[0], Insn::PopTag { tag: inner });
        assert_eq!(fb.insns()[1], Insn::PopTag { tag: outer });

        let before = fb.len();
        regions.transition(&mut fb, &[], &[0, 1]);
        let pushes: Vec<TagSlot> = fb.insns()[before..]
            .iter()
            .filter_map(|insn| match insn {
                Insn::PushTag { tag } => Some(*tag),
                _ => None,
            })
            .collect();
        assert_eq!(pushes, vec![outer, inner]);
    }

    #[test]
    fn test_partial_overlap_is_unsupported() {
        let mut iseq = nested();
        let end = iseq.catch_table[1].end;
        iseq.catch_table[0].end = end + 2;
        iseq.catch_table[0].start = 2;
        iseq.catch_table[1].start = 0;
        iseq.catch_table[1].end = 3;
        let mut fb = FunctionBuilder::new("f", Signature::Fixed(0));
        let err = RegionCompiler::new(&mut fb, &iseq, &iseq.layout()).unwrap_err();
        assert!(matches!(err, CompileError::UnsupportedConstruct { .. }));
    }
}
