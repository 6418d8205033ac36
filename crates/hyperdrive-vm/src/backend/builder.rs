// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! The code builder.

use std::sync::Arc;

use super::function::{BackendError, FunctionBody, Signature};
use crate::iseq::Literal;
use crate::symbol::SymbolId;
use crate::value::Value;

/// A virtual register holding one word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reg(pub(crate) u32);

impl Reg {
    /// Register number inside its function.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A native code target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(pub(crate) u32);

/// A handler-chain tag owned by one function activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TagSlot(pub(crate) u32);

impl TagSlot {
    /// Tag number inside its function.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// What a register holds. Informational; the executor treats every
/// register as a raw word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Type {
    /// A tagged [`Value`]
    Object,
    /// A raw signed integer
    Int,
    /// A memory [`Ptr`](super::Ptr)
    Ptr,
    /// A function handle
    Func,
}

/// Two-operand word operations. Comparisons are signed and produce 0 or 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    /// Wrapping add
    Add,
    /// Wrapping subtract
    Sub,
    /// Wrapping multiply
    Mul,
    /// Bitwise and
    And,
    /// Bitwise or
    Or,
    /// Bitwise xor
    Xor,
    /// Shift left
    Shl,
    /// Arithmetic shift right
    Sar,
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

/// Overflow-checked signed operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckedOp {
    /// Add
    Add,
    /// Subtract
    Sub,
    /// Multiply
    Mul,
}

/// One-operand word operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    /// Bitwise not
    Not,
    /// 1 when the word is a truthy value, else 0
    Truthy,
    /// 1 when the word is a fixnum, else 0
    IsFixnum,
    /// Maps 0/1 to `false`/`true`
    ToBool,
}

/// Runtime helpers callable from native code. Argument words are listed
/// in brackets.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeFn {
    /// `[recv, args...]`: invoke by name
    Invoke {
        /// Method name
        mid: SymbolId,
        /// Argument count
        argc: u32,
    },
    /// `[recv, args...]`: invoke with the innermost pending iterate block
    InvokeIterBlock {
        /// Method name
        mid: SymbolId,
        /// Argument count
        argc: u32,
    },
    /// `[recv, proc, args...]`: invoke passing a proc as the block
    InvokeWithProc {
        /// Method name
        mid: SymbolId,
        /// Argument count
        argc: u32,
    },
    /// `[trampoline, iter_arg, body, scope]`: drive a block
    Iterate,
    /// `[body, scope]`: wrap a compiled block in a proc object
    ProcNew,
    /// `[args...]`: yield to the current method's block
    Yield {
        /// Argument count
        argc: u32,
    },
    /// `[]`: materialize a literal
    Literal(Arc<Literal>),
    /// `[]`: a fresh string
    StrNew(Arc<str>),
    /// `[elements...]`
    ArrayNew {
        /// Element count
        count: u32,
    },
    /// `[key, value, ...]`
    HashNew {
        /// Number of words, twice the number of pairs
        count: u32,
    },
    /// `[]`: look up a constant
    Constant(SymbolId),
    /// `[ptr, count]`: array of `count` words read from memory
    ArrayFromMemory,
    /// `[array]`: element at a fixed index, nil when absent
    ArrayEntry {
        /// Element index
        index: u32,
    },
    /// `[recv, index]`: direct array/hash lookup, undef when not applicable
    IndexFast,
    /// `[recv, index, value]`: direct array/hash store, undef when not applicable
    IndexSetFast,
    /// `[recv, value]`: direct array append, undef when not applicable
    PushFast,
    /// `[words]`: allocate a zeroed memory block
    AllocZeroed,
    /// `[ptr]`: wrap a scope block in a GC handle with mark and free callbacks
    WrapScope,
    /// `[handle]`: the block pointer behind a scope handle
    ScopePtr,
    /// `[table, symbol]`: dynamic variable lookup, nil when absent
    DynGet,
    /// `[table, symbol, value]`: dynamic variable store
    DynSet,
    /// `[value]`: raise (state 0) or start a non-local exit
    Throw {
        /// State code
        state: u32,
    },
    /// `[state, payload]`: restore a pending exit and continue it
    Rethrow,
    /// `[argc]`: raise ArgumentError
    ArityError {
        /// Minimum argument count
        min: u32,
        /// Maximum argument count
        max: Option<u32>,
    },
    /// `[state]`: the payload of the exit being handled
    Payload,
    /// `[value]`: destructure a yielded value into `count` parameters
    /// (plus a trailing rest array when `rest`)
    SplatParams {
        /// Positional parameter count
        count: u32,
        /// Whether a rest parameter follows
        rest: bool,
    },
}

impl RuntimeFn {
    /// Short name for listings and logs.
    pub fn name(&self) -> &'static str {
        match self {
            RuntimeFn::Invoke { .. } => "invoke",
            RuntimeFn::InvokeIterBlock { .. } => "invoke_iter_block",
            RuntimeFn::InvokeWithProc { .. } => "invoke_with_proc",
            RuntimeFn::Iterate => "iterate",
            RuntimeFn::ProcNew => "proc_new",
            RuntimeFn::Yield { .. } => "yield",
            RuntimeFn::Literal(_) => "literal",
            RuntimeFn::StrNew(_) => "str_new",
            RuntimeFn::ArrayNew { .. } => "ary_new",
            RuntimeFn::HashNew { .. } => "hash_new",
            RuntimeFn::Constant(_) => "constant",
            RuntimeFn::ArrayFromMemory => "ary_from_memory",
            RuntimeFn::ArrayEntry { .. } => "ary_entry",
            RuntimeFn::IndexFast => "index_fast",
            RuntimeFn::IndexSetFast => "index_set_fast",
            RuntimeFn::PushFast => "push_fast",
            RuntimeFn::AllocZeroed => "alloc_zeroed",
            RuntimeFn::WrapScope => "wrap_scope",
            RuntimeFn::ScopePtr => "scope_ptr",
            RuntimeFn::DynGet => "dyn_get",
            RuntimeFn::DynSet => "dyn_set",
            RuntimeFn::Throw { .. } => "throw",
            RuntimeFn::Rethrow => "rethrow",
            RuntimeFn::ArityError { .. } => "arity_error",
            RuntimeFn::Payload => "payload",
            RuntimeFn::SplatParams { .. } => "splat_params",
        }
    }
}

/// One IR instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Insn {
    /// `dst = word`
    Const {
        /// Destination
        dst: Reg,
        /// Raw word
        word: u64,
    },
    /// `dst = src`
    Move {
        /// Destination
        dst: Reg,
        /// Source
        src: Reg,
    },
    /// `dst = lhs op rhs`
    Binary {
        /// Operation
        op: BinOp,
        /// Destination
        dst: Reg,
        /// Left operand
        lhs: Reg,
        /// Right operand
        rhs: Reg,
    },
    /// `dst = lhs op rhs`, jumping to `overflow` instead when it overflows
    Checked {
        /// Operation
        op: CheckedOp,
        /// Destination, untouched on overflow
        dst: Reg,
        /// Left operand
        lhs: Reg,
        /// Right operand
        rhs: Reg,
        /// Taken when the result does not fit
        overflow: Label,
    },
    /// `dst = op src`
    Unary {
        /// Operation
        op: UnOp,
        /// Destination
        dst: Reg,
        /// Operand
        src: Reg,
    },
    /// Unconditional jump
    Branch {
        /// Jump target
        target: Label,
    },
    /// Jump when `cond != 0`
    BranchIf {
        /// Condition word
        cond: Reg,
        /// Jump target
        target: Label,
    },
    /// Jump when `cond == 0`
    BranchUnless {
        /// Condition word
        cond: Reg,
        /// Jump target
        target: Label,
    },
    /// `dst = ptr[offset]`
    Load {
        /// Destination
        dst: Reg,
        /// Base pointer
        ptr: Reg,
        /// Offset in words
        offset: i32,
    },
    /// `ptr[offset] = src`
    Store {
        /// Base pointer
        ptr: Reg,
        /// Offset in words
        offset: i32,
        /// Value stored
        src: Reg,
    },
    /// `dst = ptr + offset` words
    PtrAdd {
        /// Destination
        dst: Reg,
        /// Base pointer
        ptr: Reg,
        /// Offset in words
        offset: i32,
    },
    /// `dst = &frame_memory[offset]`
    FrameAddr {
        /// Destination
        dst: Reg,
        /// Word offset into the frame memory
        offset: u32,
    },
    /// `dst = handle of unit function index`
    FuncAddr {
        /// Destination
        dst: Reg,
        /// Function index within the unit
        index: u32,
    },
    /// Call a runtime helper
    Call {
        /// Result register, if the helper returns a value
        dst: Option<Reg>,
        /// Helper called
        target: RuntimeFn,
        /// Arguments
        args: Vec<Reg>,
    },
    /// Call another function of the same unit
    CallFunction {
        /// Result register, if the result is used
        dst: Option<Reg>,
        /// Function index within the unit
        index: u32,
        /// Arguments
        args: Vec<Reg>,
    },
    /// `dst = thread sp` as a pointer
    LoadSp {
        /// Destination
        dst: Reg,
    },
    /// `thread sp = src`
    SyncSp {
        /// New stack pointer
        src: Reg,
    },
    /// Push a tag onto the thread's handler chain
    PushTag {
        /// Tag pushed
        tag: TagSlot,
    },
    /// Restore the chain head saved by the matching push
    PopTag {
        /// Tag popped
        tag: TagSlot,
    },
    /// Record a resume point in the tag; `dst = 0` now, the state code on resume
    Checkpoint {
        /// Receives the state code
        dst: Reg,
        /// Tag the resume point is recorded in
        tag: TagSlot,
    },
    /// Raise the state code in `state` up the handler chain
    JumpTag {
        /// State code
        state: Reg,
    },
    /// Return `src`
    Return {
        /// Returned value
        src: Reg,
    },
}

/// Builds one [`FunctionBody`].
#[derive(Debug)]
pub struct FunctionBuilder {
    name: String,
    signature: Signature,
    insns: Vec<Insn>,
    types: Vec<Type>,
    params: Vec<Reg>,
    labels: Vec<Option<usize>>,
    tags: u32,
    frame_words: u32,
}

impl FunctionBuilder {
    /// Creates a builder; parameter registers are allocated from the signature.
    pub fn new(name: impl Into<String>, signature: Signature) -> Self {
        let mut builder = Self {
            name: name.into(),
            signature,
            insns: Vec::new(),
            types: Vec::new(),
            params: Vec::new(),
            labels: Vec::new(),
            tags: 0,
            frame_words: 0,
        };
        let param_types: Vec<Type> = match signature {
            Signature::Fixed(n) => vec![Type::Object; n + 1],
            Signature::Variadic => vec![Type::Int, Type::Ptr, Type::Object],
            Signature::Internal(n) => vec![Type::Object; n],
        };
        for ty in param_types {
            let reg = builder.value(ty);
            builder.params.push(reg);
        }
        builder
    }

    /// Function name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Function signature.
    pub fn signature(&self) -> Signature {
        self.signature
    }

    /// The `i`th parameter register.
    pub fn param(&self, i: usize) -> Reg {
        self.params[i]
    }

    /// Number of instructions emitted so far.
    pub fn len(&self) -> usize {
        self.insns.len()
    }

    /// Whether nothing has been emitted.
    pub fn is_empty(&self) -> bool {
        self.insns.is_empty()
    }

    /// Emitted instructions.
    pub fn insns(&self) -> &[Insn] {
        &self.insns
    }

    fn emit(&mut self, insn: Insn) {
        self.insns.push(insn);
    }

    // ========================================================================
    // Values
    // ========================================================================

    /// Allocates a fresh register.
    pub fn value(&mut self, ty: Type) -> Reg {
        self.types.push(ty);
        Reg(self.types.len() as u32 - 1)
    }

    /// A register holding a constant word.
    pub fn const_word(&mut self, ty: Type, word: u64) -> Reg {
        let dst = self.value(ty);
        self.emit(Insn::Const { dst, word });
        dst
    }

    /// A register holding a constant value.
    pub fn const_value(&mut self, value: Value) -> Reg {
        self.const_word(Type::Object, value.raw())
    }

    /// A register holding a raw integer.
    pub fn const_int(&mut self, n: i64) -> Reg {
        self.const_word(Type::Int, n as u64)
    }

    /// `dst = src`
    pub fn store(&mut self, dst: Reg, src: Reg) {
        if dst != src {
            self.emit(Insn::Move { dst, src });
        }
    }

    /// Copies `src` into a fresh register.
    pub fn copy(&mut self, src: Reg) -> Reg {
        let ty = self.types[src.index()];
        let dst = self.value(ty);
        self.emit(Insn::Move { dst, src });
        dst
    }

    // ========================================================================
    // Arithmetic
    // ========================================================================

    /// `lhs op rhs` into a fresh register.
    pub fn binary(&mut self, op: BinOp, lhs: Reg, rhs: Reg) -> Reg {
        let ty = match op {
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => Type::Int,
            _ => self.types[lhs.index()],
        };
        let dst = self.value(ty);
        self.emit(Insn::Binary { op, dst, lhs, rhs });
        dst
    }

    /// Overflow-checked `lhs op rhs`; jumps to `overflow` when it overflows.
    pub fn checked(&mut self, op: CheckedOp, lhs: Reg, rhs: Reg, overflow: Label) -> Reg {
        let ty = self.types[lhs.index()];
        let dst = self.value(ty);
        self.emit(Insn::Checked {
            op,
            dst,
            lhs,
            rhs,
            overflow,
        });
        dst
    }

    /// `op src` into a fresh register.
    pub fn unary(&mut self, op: UnOp, src: Reg) -> Reg {
        let ty = match op {
            UnOp::Not => self.types[src.index()],
            UnOp::Truthy | UnOp::IsFixnum => Type::Int,
            UnOp::ToBool => Type::Object,
        };
        let dst = self.value(ty);
        self.emit(Insn::Unary { op, dst, src });
        dst
    }

    /// Wrapping add.
    pub fn add(&mut self, lhs: Reg, rhs: Reg) -> Reg {
        self.binary(BinOp::Add, lhs, rhs)
    }

    /// Wrapping subtract.
    pub fn sub(&mut self, lhs: Reg, rhs: Reg) -> Reg {
        self.binary(BinOp::Sub, lhs, rhs)
    }

    /// Bitwise and.
    pub fn and(&mut self, lhs: Reg, rhs: Reg) -> Reg {
        self.binary(BinOp::And, lhs, rhs)
    }

    /// Word equality (0 or 1).
    pub fn eq(&mut self, lhs: Reg, rhs: Reg) -> Reg {
        self.binary(BinOp::Eq, lhs, rhs)
    }

    /// Word inequality (0 or 1).
    pub fn ne(&mut self, lhs: Reg, rhs: Reg) -> Reg {
        self.binary(BinOp::Ne, lhs, rhs)
    }

    // ========================================================================
    // Control flow
    // ========================================================================

    /// Allocates an unplaced label.
    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() as u32 - 1)
    }

    /// Binds `label` to the next emitted instruction.
    pub fn place(&mut self, label: Label) {
        self.labels[label.0 as usize] = Some(self.insns.len());
    }

    /// Whether `label` has been placed.
    pub fn is_placed(&self, label: Label) -> bool {
        self.labels[label.0 as usize].is_some()
    }

    /// Unconditional jump.
    pub fn branch(&mut self, target: Label) {
        self.emit(Insn::Branch { target });
    }

    /// Jump when `cond` is non-zero.
    pub fn branch_if(&mut self, cond: Reg, target: Label) {
        self.emit(Insn::BranchIf { cond, target });
    }

    /// Jump when `cond` is zero.
    pub fn branch_unless(&mut self, cond: Reg, target: Label) {
        self.emit(Insn::BranchUnless { cond, target });
    }

    /// Returns `src` to the caller.
    pub fn ret(&mut self, src: Reg) {
        self.emit(Insn::Return { src });
    }

    // ========================================================================
    // Memory
    // ========================================================================

    /// Loads `ptr[offset]`.
    pub fn load(&mut self, ty: Type, ptr: Reg, offset: i32) -> Reg {
        let dst = self.value(ty);
        self.emit(Insn::Load { dst, ptr, offset });
        dst
    }

    /// Stores `src` at `ptr[offset]`.
    pub fn store_at(&mut self, ptr: Reg, offset: i32, src: Reg) {
        self.emit(Insn::Store { ptr, offset, src });
    }

    /// `ptr + offset` words into a fresh register.
    pub fn ptr_add(&mut self, ptr: Reg, offset: i32) -> Reg {
        let dst = self.value(Type::Ptr);
        self.emit(Insn::PtrAdd { dst, ptr, offset });
        dst
    }

    /// `dst = ptr + offset` words.
    pub fn ptr_add_into(&mut self, dst: Reg, ptr: Reg, offset: i32) {
        self.emit(Insn::PtrAdd { dst, ptr, offset });
    }

    /// Reserves `words` of frame memory and returns its offset.
    pub fn frame_alloc(&mut self, words: u32) -> u32 {
        let offset = self.frame_words;
        self.frame_words += words;
        offset
    }

    /// Address of frame memory at `offset`.
    pub fn frame_addr(&mut self, offset: u32) -> Reg {
        let dst = self.value(Type::Ptr);
        self.emit(Insn::FrameAddr { dst, offset });
        dst
    }

    /// Loads the thread stack pointer.
    pub fn load_sp(&mut self) -> Reg {
        let dst = self.value(Type::Ptr);
        self.emit(Insn::LoadSp { dst });
        dst
    }

    /// Stores `src` into the thread stack pointer.
    pub fn sync_sp(&mut self, src: Reg) {
        self.emit(Insn::SyncSp { src });
    }

    // ========================================================================
    // Calls and closures
    // ========================================================================

    /// Calls a runtime helper and returns its result.
    pub fn call(&mut self, target: RuntimeFn, args: &[Reg]) -> Reg {
        let dst = self.value(Type::Object);
        self.emit(Insn::Call {
            dst: Some(dst),
            target,
            args: args.to_vec(),
        });
        dst
    }

    /// Calls a runtime helper for its effect.
    pub fn call_void(&mut self, target: RuntimeFn, args: &[Reg]) {
        self.emit(Insn::Call {
            dst: None,
            target,
            args: args.to_vec(),
        });
    }

    /// Calls function `index` of the same unit.
    pub fn call_function(&mut self, index: u32, args: &[Reg]) -> Reg {
        let dst = self.value(Type::Object);
        self.emit(Insn::CallFunction {
            dst: Some(dst),
            index,
            args: args.to_vec(),
        });
        dst
    }

    /// Handle of function `index` of the same unit, for passing to the runtime.
    pub fn function_addr(&mut self, index: u32) -> Reg {
        let dst = self.value(Type::Func);
        self.emit(Insn::FuncAddr { dst, index });
        dst
    }

    // ========================================================================
    // Handler chain
    // ========================================================================

    /// Allocates a tag slot in this function's activation.
    pub fn new_tag(&mut self) -> TagSlot {
        self.tags += 1;
        TagSlot(self.tags - 1)
    }

    /// Pushes `tag` onto the handler chain.
    pub fn push_tag(&mut self, tag: TagSlot) {
        self.emit(Insn::PushTag { tag });
    }

    /// Pops `tag` from the handler chain.
    pub fn pop_tag(&mut self, tag: TagSlot) {
        self.emit(Insn::PopTag { tag });
    }

    /// Records a checkpoint; the result is 0 now and the state code when a
    /// non-local exit lands here.
    pub fn checkpoint(&mut self, tag: TagSlot) -> Reg {
        let dst = self.value(Type::Int);
        self.emit(Insn::Checkpoint { dst, tag });
        dst
    }

    /// Raises the state code in `state`.
    pub fn jump_tag(&mut self, state: Reg) {
        self.emit(Insn::JumpTag { state });
    }

    // ========================================================================
    // Finishing
    // ========================================================================

    /// Resolves labels and produces the function body.
    pub fn finish(self) -> Result<FunctionBody, BackendError> {
        let resolve = |label: Label| -> Result<usize, BackendError> {
            self.labels[label.0 as usize].ok_or_else(|| BackendError::UnplacedLabel {
                function: self.name.clone(),
                label: label.0,
            })
        };
        for insn in &self.insns {
            match insn {
                Insn::Checked { overflow: target, .. }
                | Insn::Branch { target }
                | Insn::BranchIf { target, .. }
                | Insn::BranchUnless { target, .. } => {
                    resolve(*target)?;
                }
                _ => {}
            }
        }
        let label_targets = self
            .labels
            .iter()
            .map(|slot| slot.unwrap_or(usize::MAX))
            .collect();
        Ok(FunctionBody {
            name: self.name,
            signature: self.signature,
            insns: self.insns,
            types: self.types,
            params: self.params,
            label_targets,
            ntags: self.tags as usize,
            frame_words: self.frame_words as usize,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_follow_signature() {
        let fb = FunctionBuilder::new("f", Signature::Fixed(2));
        assert_eq!(fb.param(0), Reg(0));
        assert_eq!(fb.param(2), Reg(2));

        let fb = FunctionBuilder::new("g", Signature::Variadic);
        assert_eq!(fb.types, vec![Type::Int, Type::Ptr, Type::Object]);
    }

    #[test]
    fn test_unplaced_label_fails_finish() {
        let mut fb = FunctionBuilder::new("f", Signature::Fixed(0));
        let label = fb.new_label();
        fb.branch(label);
        assert!(matches!(fb.finish(), Err(BackendError::UnplacedLabel { .. })));
    }

    #[test]
    fn test_store_to_self_is_elided() {
        let mut fb = FunctionBuilder::new("f", Signature::Fixed(0));
        let r = fb.param(0);
        fb.store(r, r);
        assert!(fb.is_empty());
    }
}
