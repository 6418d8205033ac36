// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Per-thread execution state.

use std::rc::Rc;
use std::sync::Arc;

use crate::backend::{FuncId, Reg};
use crate::iseq::Iseq;
use crate::symbol::SymbolId;
use crate::value::Value;

/// One entry of the handler chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TagRecord {
    /// Chain head saved when the tag was pushed
    pub prev: Option<usize>,
    /// Whether the tag is on the chain
    pub active: bool,
    /// Last state code observed at the checkpoint
    pub state: u32,
    /// Instruction to resume at, and the register receiving the state code
    pub resume: Option<(usize, Reg)>,
}

/// An interpreted block closed over its defining environment.
#[derive(Debug)]
pub struct IseqBlock {
    /// Block body
    pub iseq: Arc<Iseq>,
    /// Environment handle of the defining frame
    pub env: Value,
    /// Self of the defining frame
    pub self_value: Value,
    /// Block of the defining method, the target of `invokeblock`
    pub outer: Option<Block>,
}

/// A block attached to a call.
#[derive(Debug, Clone)]
pub enum Block {
    /// Compiled block body: `(value, scope handle)`
    Native {
        /// Body function
        body: FuncId,
        /// Scope handle of the defining frame
        scope: Value,
    },
    /// Interpreted block
    Iseq(Rc<IseqBlock>),
    /// A proc object passed as the block
    Proc(Value),
}

impl Block {
    /// Reports every value the block keeps alive.
    pub fn trace(&self, out: &mut Vec<Value>) {
        match self {
            Block::Native { scope, .. } => out.push(*scope),
            Block::Iseq(block) => {
                out.push(block.env);
                out.push(block.self_value);
                if let Some(outer) = &block.outer {
                    outer.trace(out);
                }
            }
            Block::Proc(proc) => out.push(*proc),
        }
    }
}

/// A method activation as seen by the runtime.
#[derive(Debug, Clone)]
pub struct ControlFrame {
    /// Receiver
    pub recv: Value,
    /// Method name
    pub mid: SymbolId,
    /// Attached block
    pub block: Option<Block>,
}

/// Execution state of the (single) interpreter thread.
#[derive(Debug, Default)]
pub struct ThreadState {
    /// Value stack top, in words
    pub sp: usize,
    /// Tag arena; native frames own contiguous ranges
    pub tags: Vec<TagRecord>,
    /// Head of the handler chain
    pub tag_head: Option<usize>,
    /// Exception being raised
    pub errinfo: Value,
    /// Payload of a break, next or return
    pub jump_value: Value,
    /// Method activations
    pub frames: Vec<ControlFrame>,
    /// Blocks waiting to be attached by an iterate trampoline
    pub iter_blocks: Vec<Block>,
    /// Values kept alive by host code
    pub pins: Vec<Value>,
    /// Native and interpreted call depth
    pub depth: usize,
}

impl ThreadState {
    /// Creates a fresh thread state.
    pub fn new() -> Self {
        Self {
            errinfo: Value::NIL,
            jump_value: Value::NIL,
            ..Self::default()
        }
    }

    /// Block of the innermost method activation.
    pub fn current_block(&self) -> Option<&Block> {
        self.frames.last()?.block.as_ref()
    }

    /// Reports every value the thread keeps alive, excluding the value stack.
    pub fn trace(&self, out: &mut Vec<Value>) {
        out.push(self.errinfo);
        out.push(self.jump_value);
        out.extend_from_slice(&self.pins);
        for frame in &self.frames {
            out.push(frame.recv);
            if let Some(block) = &frame.block {
                block.trace(out);
            }
        }
        for block in &self.iter_blocks {
            block.trace(out);
        }
    }
}
