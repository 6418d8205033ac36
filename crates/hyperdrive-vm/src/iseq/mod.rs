// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Instruction sequences.
//!
//! An [`Iseq`] is the linear, offset-addressed bytecode of one method, block
//! or top-level program, together with its local table, parameter shape and
//! catch table. Offsets count words: every instruction occupies one word
//! for its opcode plus one per operand, so [`Instruction::len`] is the
//! encoded length and relative branch operands are measured from the start
//! of the following instruction.

mod builder;
mod disasm;

pub use builder::{IseqBuilder, Label};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};

/// A literal operand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Literal {
    /// `nil`
    Nil,
    /// `true`
    True,
    /// `false`
    False,
    /// Integer (promoted to a bignum when outside fixnum range)
    Int(i64),
    /// String (a fresh string object per evaluation)
    Str(String),
    /// Symbol
    Sym(String),
    /// Array of literals (a fresh array per evaluation)
    Array(Vec<Literal>),
}

/// Call-site flags of a `send`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallFlags {
    /// Receiver is implicit self; private methods are callable
    pub fcall: bool,
    /// Bare identifier that could have been a local variable
    pub vcall: bool,
    /// Last argument is splatted (`f(*args)`)
    pub splat: bool,
    /// A block argument is passed explicitly (`f(&blk)`)
    pub blockarg: bool,
}

/// One instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Instruction {
    /// Do nothing
    Nop,
    /// Push nil
    #[serde(rename = "putnil")]
    PutNil,
    /// Push self
    #[serde(rename = "putself")]
    PutSelf,
    /// Push a literal
    #[serde(rename = "putobject")]
    PutObject {
        /// The literal
        value: Literal,
    },
    /// Push a new string
    #[serde(rename = "putstring")]
    PutString {
        /// Contents
        value: String,
    },
    /// Push a fresh copy of a literal array
    #[serde(rename = "duparray")]
    DupArray {
        /// Elements
        values: Vec<Literal>,
    },
    /// Pop `count` values into a new array
    #[serde(rename = "newarray")]
    NewArray {
        /// Element count
        count: usize,
    },
    /// Pop `count` values (key, value pairs) into a new hash
    #[serde(rename = "newhash")]
    NewHash {
        /// Number of stack items, twice the number of pairs
        count: usize,
    },
    /// Push a constant (class) by name
    #[serde(rename = "getconstant")]
    GetConstant {
        /// Constant name
        name: String,
    },
    /// Push a local of this sequence
    #[serde(rename = "getlocal")]
    GetLocal {
        /// Index into the local table
        index: usize,
    },
    /// Pop into a local of this sequence
    #[serde(rename = "setlocal")]
    SetLocal {
        /// Index into the local table
        index: usize,
    },
    /// Push a local of this or an enclosing sequence
    #[serde(rename = "getdynamic")]
    GetDynamic {
        /// Index into the local table of the sequence `level` levels up
        index: usize,
        /// Number of enclosing sequences to walk outward
        level: usize,
    },
    /// Pop into a local of this or an enclosing sequence
    #[serde(rename = "setdynamic")]
    SetDynamic {
        /// Index into the local table of the sequence `level` levels up
        index: usize,
        /// Number of enclosing sequences to walk outward
        level: usize,
    },
    /// Discard the top value
    Pop,
    /// Duplicate the top value
    Dup,
    /// Swap the two top values
    Swap,
    /// Push a copy of the value `n` below the top
    #[serde(rename = "topn")]
    TopN {
        /// Distance from the top (0 is the top)
        n: usize,
    },
    /// Overwrite the value `n` below the top with the top
    #[serde(rename = "setn")]
    SetN {
        /// Distance from the top
        n: usize,
    },
    /// Unconditional relative jump
    Jump {
        /// Relative to the following instruction
        offset: i32,
    },
    /// Pop; jump when truthy
    #[serde(rename = "branchif")]
    BranchIf {
        /// Relative to the following instruction
        offset: i32,
    },
    /// Pop; jump when falsy
    #[serde(rename = "branchunless")]
    BranchUnless {
        /// Relative to the following instruction
        offset: i32,
    },
    /// Invoke a method by name
    Send {
        /// Method name
        mid: String,
        /// Argument count
        argc: usize,
        /// Index into [`Iseq::blocks`] of the attached block
        #[serde(default)]
        block: Option<usize>,
        /// Call-site flags
        #[serde(default)]
        flags: CallFlags,
    },
    /// Yield to the method's block
    #[serde(rename = "invokeblock")]
    InvokeBlock {
        /// Argument count
        argc: usize,
    },
    /// Return the top value
    Leave,
    /// Pop a value and raise it (state 0) or leave with the given state
    Throw {
        /// State code, 0 to raise the value as an exception
        state: u32,
    },
    /// End of an ensure handler: pop payload and state, re-raise
    Rethrow,
    /// `+`
    OptPlus,
    /// `-`
    OptMinus,
    /// `*`
    OptMult,
    /// `<`
    OptLt,
    /// `<=`
    OptLe,
    /// `>`
    OptGt,
    /// `>=`
    OptGe,
    /// `==`
    OptEq,
    /// `!=`
    OptNeq,
    /// `[]`
    OptAref,
    /// `[]=`
    OptAset,
    /// `<<`
    OptLtlt,
    /// `succ`
    OptSucc,
    /// `!`
    OptNot,
}

impl Instruction {
    /// Encoded length in words.
    pub fn len(&self) -> usize {
        use Instruction::*;
        match self {
            GetDynamic { .. } | SetDynamic { .. } => 3,
            Send { .. } => 5,
            PutObject { .. }
            | PutString { .. }
            | DupArray { .. }
            | NewArray { .. }
            | NewHash { .. }
            | GetConstant { .. }
            | GetLocal { .. }
            | SetLocal { .. }
            | TopN { .. }
            | SetN { .. }
            | Jump { .. }
            | BranchIf { .. }
            | BranchUnless { .. }
            | InvokeBlock { .. }
            | Throw { .. } => 2,
            _ => 1,
        }
    }

    /// Instructions never have a zero length.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Stack effect as `(pops, pushes)`.
    pub fn stack_effect(&self) -> (usize, usize) {
        use Instruction::*;
        match self {
            Nop | Jump { .. } | SetN { .. } => (0, 0),
            PutNil | PutSelf | PutObject { .. } | PutString { .. } | DupArray { .. } => (0, 1),
            GetConstant { .. } | GetLocal { .. } | GetDynamic { .. } | TopN { .. } => (0, 1),
            NewArray { count } | NewHash { count } => (*count, 1),
            SetLocal { .. } | SetDynamic { .. } | Pop => (1, 0),
            BranchIf { .. } | BranchUnless { .. } | Leave | Throw { .. } => (1, 0),
            Dup => (1, 2),
            Swap => (2, 2),
            Send { argc, .. } => (argc + 1, 1),
            InvokeBlock { argc } => (*argc, 1),
            Rethrow => (2, 0),
            OptPlus | OptMinus | OptMult | OptLt | OptLe | OptGt | OptGe | OptEq | OptNeq
            | OptAref | OptLtlt => (2, 1),
            OptAset => (3, 1),
            OptSucc | OptNot => (1, 1),
        }
    }

    /// Whether control never falls through to the next instruction.
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Instruction::Jump { .. }
                | Instruction::Leave
                | Instruction::Throw { .. }
                | Instruction::Rethrow
        )
    }

    /// Relative branch operand, if this is a branch.
    pub fn branch_offset(&self) -> Option<i32> {
        match self {
            Instruction::Jump { offset }
            | Instruction::BranchIf { offset }
            | Instruction::BranchUnless { offset } => Some(*offset),
            _ => None,
        }
    }

    /// Method name invoked by a `send` or by the generic path of a
    /// specialized instruction.
    pub fn method_name(&self) -> Option<&str> {
        use Instruction::*;
        Some(match self {
            Send { mid, .. } => mid.as_str(),
            OptPlus => "+",
            OptMinus => "-",
            OptMult => "*",
            OptLt => "<",
            OptLe => "<=",
            OptGt => ">",
            OptGe => ">=",
            OptEq => "==",
            OptNeq => "!=",
            OptAref => "[]",
            OptAset => "[]=",
            OptLtlt => "<<",
            OptSucc => "succ",
            OptNot => "!",
            _ => return None,
        })
    }

    /// Mnemonic used by the disassembler.
    pub fn mnemonic(&self) -> &'static str {
        use Instruction::*;
        match self {
            Nop => "nop",
            PutNil => "putnil",
            PutSelf => "putself",
            PutObject { .. } => "putobject",
            PutString { .. } => "putstring",
            DupArray { .. } => "duparray",
            NewArray { .. } => "newarray",
            NewHash { .. } => "newhash",
            GetConstant { .. } => "getconstant",
            GetLocal { .. } => "getlocal",
            SetLocal { .. } => "setlocal",
            GetDynamic { .. } => "getdynamic",
            SetDynamic { .. } => "setdynamic",
            Pop => "pop",
            Dup => "dup",
            Swap => "swap",
            TopN { .. } => "topn",
            SetN { .. } => "setn",
            Jump { .. } => "jump",
            BranchIf { .. } => "branchif",
            BranchUnless { .. } => "branchunless",
            Send { .. } => "send",
            InvokeBlock { .. } => "invokeblock",
            Leave => "leave",
            Throw { .. } => "throw",
            Rethrow => "rethrow",
            OptPlus => "opt_plus",
            OptMinus => "opt_minus",
            OptMult => "opt_mult",
            OptLt => "opt_lt",
            OptLe => "opt_le",
            OptGt => "opt_gt",
            OptGe => "opt_ge",
            OptEq => "opt_eq",
            OptNeq => "opt_neq",
            OptAref => "opt_aref",
            OptAset => "opt_aset",
            OptLtlt => "opt_ltlt",
            OptSucc => "opt_succ",
            OptNot => "opt_not",
        }
    }
}

/// Handler kind of a catch region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatchKind {
    /// Exception handler
    Rescue,
    /// Runs on any non-local exit, then re-raises it
    Ensure,
    /// Restarts a begin block
    Retry,
    /// Target of `break` from a block
    Break,
    /// Restarts a block or loop body
    Redo,
    /// Ends the current block or loop iteration
    Next,
}

impl CatchKind {
    /// Name used by the disassembler.
    pub fn name(self) -> &'static str {
        match self {
            CatchKind::Rescue => "rescue",
            CatchKind::Ensure => "ensure",
            CatchKind::Retry => "retry",
            CatchKind::Break => "break",
            CatchKind::Redo => "redo",
            CatchKind::Next => "next",
        }
    }
}

/// A protected bytecode range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatchEntry {
    /// Handler kind
    pub kind: CatchKind,
    /// Offset of the first protected instruction
    pub start: usize,
    /// Offset of the last protected instruction (inclusive)
    pub end: usize,
    /// Continuation offset
    pub cont: usize,
    /// Offset of the handler fragment (rescue and ensure)
    #[serde(default)]
    pub handler: Option<usize>,
    /// Operand stack depth at the continuation, before the payload is pushed
    #[serde(default)]
    pub sp: usize,
}

impl CatchEntry {
    /// Whether `offset` lies inside the protected range.
    pub fn covers(&self, offset: usize) -> bool {
        offset >= self.start && offset <= self.end
    }

    /// Whether this region fully encloses `other`.
    pub fn encloses(&self, other: &CatchEntry) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// Kind of an instruction sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IseqKind {
    /// Method body
    Method,
    /// Block body
    Block,
    /// Top-level program
    Top,
}

/// Parameter shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Params {
    /// Required (leading) parameters
    pub required: Vec<String>,
    /// Optional parameters, in order
    pub optional: Vec<String>,
    /// `opt_table[k]` is the offset where execution starts when `k`
    /// optional arguments were supplied; `optional.len() + 1` entries
    pub opt_table: Vec<usize>,
    /// Rest parameter (`*rest`)
    pub rest: Option<String>,
    /// Block parameter (`&blk`)
    pub block: Option<String>,
}

impl Params {
    /// Whether the sequence takes only required parameters.
    pub fn is_simple(&self) -> bool {
        self.optional.is_empty() && self.rest.is_none() && self.block.is_none()
    }

    /// Minimum and maximum argument count; `None` means unbounded.
    pub fn arity(&self) -> (usize, Option<usize>) {
        let min = self.required.len();
        if self.rest.is_some() {
            (min, None)
        } else {
            (min, Some(min + self.optional.len()))
        }
    }

    /// Number of declared parameters, excluding the block parameter.
    pub fn positional_count(&self) -> usize {
        self.required.len() + self.optional.len()
    }
}

/// An instruction sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Iseq {
    /// Method or block name
    pub name: String,
    /// Sequence kind
    pub kind: IseqKind,
    /// Parameter shape
    #[serde(default)]
    pub params: Params,
    /// Local table; parameters come first
    #[serde(default)]
    pub locals: Vec<String>,
    /// Instructions
    pub code: Vec<Instruction>,
    /// Catch table, sorted by `(start, end)`
    #[serde(default)]
    pub catch_table: Vec<CatchEntry>,
    /// Child block sequences referenced by `send`
    #[serde(default)]
    pub blocks: Vec<Iseq>,
}

/// Offset bookkeeping for one sequence.
#[derive(Debug, Clone, Default)]
pub struct Layout {
    /// Offset of each instruction, by index
    pub offsets: Vec<usize>,
    /// Instruction index of each offset
    pub index: FxHashMap<usize, usize>,
    /// Offset one past the last instruction
    pub end: usize,
}

impl Layout {
    /// Instruction index at `offset`, if an instruction starts there.
    pub fn index_of(&self, offset: usize) -> Option<usize> {
        self.index.get(&offset).copied()
    }
}

impl Iseq {
    /// Walks the sequence yielding `(offset, instruction, encoded length)`.
    pub fn instructions(&self) -> impl Iterator<Item = (usize, &Instruction, usize)> + '_ {
        self.code.iter().scan(0usize, |offset, insn| {
            let at = *offset;
            let len = insn.len();
            *offset += len;
            Some((at, insn, len))
        })
    }

    /// Computes the offset layout.
    pub fn layout(&self) -> Layout {
        let mut layout = Layout::default();
        for (i, (offset, _, len)) in self.instructions().enumerate() {
            layout.offsets.push(offset);
            layout.index.insert(offset, i);
            layout.end = offset + len;
        }
        layout
    }

    /// Local table index of `name`.
    pub fn local_index(&self, name: &str) -> Option<usize> {
        self.locals.iter().position(|local| local == name)
    }

    /// Whether any `send` in this sequence carries a block.
    pub fn has_blocks(&self) -> bool {
        self.code
            .iter()
            .any(|insn| matches!(insn, Instruction::Send { block: Some(_), .. }))
    }

    /// Checks structural well-formedness: branch targets land on
    /// instruction boundaries, local and block indices are in range, the
    /// catch table is sorted and its regions nest without partial overlap.
    pub fn validate(&self) -> Result<()> {
        let layout = self.layout();
        let lands = |offset: usize| offset == layout.end || layout.index.contains_key(&offset);

        for (offset, insn, len) in self.instructions() {
            if let Some(rel) = insn.branch_offset() {
                let target = (offset + len) as i64 + rel as i64;
                if target < 0 || !lands(target as usize) {
                    return Err(RuntimeError::invalid_program(format!(
                        "{}: branch at {} to {} is not an instruction boundary",
                        self.name, offset, target
                    )));
                }
            }
            match insn {
                Instruction::GetLocal { index } | Instruction::SetLocal { index }
                    if *index >= self.locals.len() =>
                {
                    return Err(RuntimeError::invalid_program(format!(
                        "{}: local index {} out of range at {}",
                        self.name, index, offset
                    )));
                }
                Instruction::Send { block: Some(block), .. } if *block >= self.blocks.len() => {
                    return Err(RuntimeError::invalid_program(format!(
                        "{}: block index {} out of range at {}",
                        self.name, block, offset
                    )));
                }
                _ => {}
            }
        }

        for pair in self.catch_table.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            if (a.start, a.end) > (b.start, b.end) {
                return Err(RuntimeError::invalid_program(format!(
                    "{}: catch table is not sorted",
                    self.name
                )));
            }
        }
        for (i, a) in self.catch_table.iter().enumerate() {
            if a.start > a.end || !layout.index.contains_key(&a.start) {
                return Err(RuntimeError::invalid_program(format!(
                    "{}: malformed {} region {}..={}",
                    self.name,
                    a.kind.name(),
                    a.start,
                    a.end
                )));
            }
            for b in &self.catch_table[i + 1..] {
                let disjoint = a.end < b.start || b.end < a.start;
                if !disjoint && !a.encloses(b) && !b.encloses(a) {
                    return Err(RuntimeError::invalid_program(format!(
                        "{}: regions {}..={} and {}..={} partially overlap",
                        self.name, a.start, a.end, b.start, b.end
                    )));
                }
            }
        }

        for block in &self.blocks {
            block.validate()?;
        }
        Ok(())
    }
}

/// A method definition inside a [`Program`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodDef {
    /// Owning class name
    #[serde(default = "MethodDef::default_owner")]
    pub owner: String,
    /// Method body; its name is the method name
    pub iseq: Iseq,
}

impl MethodDef {
    fn default_owner() -> String {
        "Object".to_string()
    }
}

/// A loadable program: method definitions plus a top-level sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Program {
    /// Methods to define before running `main`
    #[serde(default)]
    pub methods: Vec<MethodDef>,
    /// Top-level sequence
    pub main: Iseq,
}

impl Program {
    /// Parses a program from JSON.
    pub fn from_json(source: &str) -> Result<Self> {
        let program: Program = serde_json::from_str(source)?;
        program.main.validate()?;
        for def in &program.methods {
            def.iseq.validate()?;
        }
        Ok(program)
    }

    /// Loads a program from a JSON file.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_json(&source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(code: Vec<Instruction>) -> Iseq {
        Iseq {
            name: "t".into(),
            kind: IseqKind::Method,
            params: Params::default(),
            locals: vec![],
            code,
            catch_table: vec![],
            blocks: vec![],
        }
    }

    #[test]
    fn test_offsets_follow_encoded_length() {
        let iseq = seq(vec![
            Instruction::PutObject { value: Literal::Int(1) },
            Instruction::PutNil,
            Instruction::Send {
                mid: "p".into(),
                argc: 1,
                block: None,
                flags: CallFlags::default(),
            },
            Instruction::Leave,
        ]);
        let offsets: Vec<_> = iseq.instructions().map(|(o, _, _)| o).collect();
        assert_eq!(offsets, vec![0, 2, 3, 8]);
        assert_eq!(iseq.layout().end, 9);
    }

    #[test]
    fn test_validate_rejects_mid_instruction_branch() {
        let iseq = seq(vec![
            Instruction::Jump { offset: 1 },
            Instruction::PutObject { value: Literal::Nil },
            Instruction::Leave,
        ]);
        assert!(iseq.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_partial_overlap() {
        let mut iseq = seq(vec![Instruction::PutNil; 6]);
        iseq.code.push(Instruction::Leave);
        let entry = |start, end| CatchEntry {
            kind: CatchKind::Rescue,
            start,
            end,
            cont: 6,
            handler: None,
            sp: 0,
        };
        iseq.catch_table = vec![entry(0, 3), entry(2, 5)];
        assert!(iseq.validate().is_err());

        iseq.catch_table = vec![entry(0, 5), entry(2, 3)];
        assert!(iseq.validate().is_ok());
    }

    #[test]
    fn test_params_arity() {
        let params = Params {
            required: vec!["a".into()],
            optional: vec!["b".into()],
            opt_table: vec![0, 4],
            rest: None,
            block: None,
        };
        assert_eq!(params.arity(), (1, Some(2)));
        assert!(!params.is_simple());
    }

    #[test]
    fn test_instruction_json_shape() {
        let json = r#"{"op":"send","mid":"+","argc":1}"#;
        let insn: Instruction = serde_json::from_str(json).unwrap();
        assert_eq!(
            insn,
            Instruction::Send {
                mid: "+".into(),
                argc: 1,
                block: None,
                flags: CallFlags::default()
            }
        );

        let cases = [
            (r#"{"op":"getlocal","index":0}"#, Instruction::GetLocal { index: 0 }),
            (r#"{"op":"putself"}"#, Instruction::PutSelf),
            (r#"{"op":"branchunless","offset":3}"#, Instruction::BranchUnless { offset: 3 }),
            (r#"{"op":"opt_plus"}"#, Instruction::OptPlus),
            (
                r#"{"op":"putobject","value":{"int":2}}"#,
                Instruction::PutObject { value: Literal::Int(2) },
            ),
            (
                r#"{"op":"getdynamic","index":1,"level":2}"#,
                Instruction::GetDynamic { index: 1, level: 2 },
            ),
            (r#"{"op":"invokeblock","argc":1}"#, Instruction::InvokeBlock { argc: 1 }),
        ];
        for (json, expected) in cases {
            let insn: Instruction = serde_json::from_str(json).unwrap();
            assert_eq!(insn, expected, "{}", json);
        }
    }

    #[test]
    fn test_wire_names_match_mnemonics() {
        let insns = [
            Instruction::PutNil,
            Instruction::PutString { value: "s".into() },
            Instruction::DupArray { values: vec![] },
            Instruction::NewHash { count: 0 },
            Instruction::GetConstant { name: "Foo".into() },
            Instruction::SetDynamic { index: 0, level: 1 },
            Instruction::TopN { n: 1 },
            Instruction::SetN { n: 1 },
            Instruction::BranchIf { offset: 0 },
            Instruction::Rethrow,
            Instruction::OptLtlt,
        ];
        for insn in insns {
            let value = serde_json::to_value(&insn).unwrap();
            assert_eq!(value["op"], insn.mnemonic());
        }
    }

    #[test]
    fn test_demo_program_parses() {
        let program = Program::from_json(include_str!("../../../../demos/fib.json")).unwrap();
        assert_eq!(program.methods.len(), 1);
        assert_eq!(program.methods[0].iseq.name, "fib");
        assert_eq!(program.main.code.last(), Some(&Instruction::Leave));
    }
}
