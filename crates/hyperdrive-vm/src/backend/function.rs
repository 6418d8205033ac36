// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Finished functions and the code arena.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use super::builder::{Insn, Label, Reg, Type};

/// Backend errors.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BackendError {
    /// A branch refers to a label that was never placed
    #[error("function `{function}`: label L{label} is referenced but never placed")]
    UnplacedLabel {
        /// Function name
        function: String,
        /// Label number
        label: u32,
    },
    /// A call refers to a function outside its unit
    #[error("function `{function}`: unit-local function {index} does not exist")]
    UnknownFunction {
        /// Function name
        function: String,
        /// Unit-local index
        index: u32,
    },
}

/// Calling convention of a native function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signature {
    /// `(self, arg1, ..., argN)`
    Fixed(usize),
    /// `(argc, argv, self)`
    Variadic,
    /// `N` raw words, used by trampolines and block bodies
    Internal(usize),
}

impl Signature {
    /// Number of parameter words.
    pub fn param_count(self) -> usize {
        match self {
            Signature::Fixed(n) => n + 1,
            Signature::Variadic => 3,
            Signature::Internal(n) => n,
        }
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signature::Fixed(n) => write!(f, "fixed({})", n),
            Signature::Variadic => write!(f, "variadic"),
            Signature::Internal(n) => write!(f, "internal({})", n),
        }
    }
}

/// A finished function.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionBody {
    /// Name, for logs and listings
    pub name: String,
    /// Calling convention
    pub signature: Signature,
    /// Instructions
    pub insns: Vec<Insn>,
    /// Register types, indexed by register number
    pub types: Vec<Type>,
    /// Parameter registers
    pub params: Vec<Reg>,
    /// Instruction index of each label
    pub label_targets: Vec<usize>,
    /// Tag slots needed per activation
    pub ntags: usize,
    /// Frame memory words needed per activation
    pub frame_words: usize,
}

impl FunctionBody {
    /// Number of registers.
    pub fn nregs(&self) -> usize {
        self.types.len()
    }

    /// Instruction index a label is bound to.
    pub fn target(&self, label: Label) -> usize {
        self.label_targets[label.0 as usize]
    }

    fn check_calls(&self, unit_len: usize) -> Result<(), BackendError> {
        for insn in &self.insns {
            let index = match insn {
                Insn::CallFunction { index, .. } | Insn::FuncAddr { index, .. } => *index,
                _ => continue,
            };
            if index as usize >= unit_len {
                return Err(BackendError::UnknownFunction {
                    function: self.name.clone(),
                    index,
                });
            }
        }
        Ok(())
    }
}

impl fmt::Display for FunctionBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "fn {} [{}] regs: {} tags: {} frame: {}",
            self.name,
            self.signature,
            self.nregs(),
            self.ntags,
            self.frame_words
        )?;
        for (pc, insn) in self.insns.iter().enumerate() {
            for (label, target) in self.label_targets.iter().enumerate() {
                if *target == pc {
                    writeln!(f, "L{}:", label)?;
                }
            }
            writeln!(f, "  {:04} {:?}", pc, insn)?;
        }
        Ok(())
    }
}

/// A compiled unit: an entry function plus the closures it references by
/// unit-local index. Index 0 is the entry.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeFunction {
    /// Unit name
    pub name: String,
    /// Functions; the entry first
    pub functions: Vec<Arc<FunctionBody>>,
}

impl NativeFunction {
    /// Creates a unit from an entry function.
    pub fn new(entry: FunctionBody) -> Self {
        Self {
            name: entry.name.clone(),
            functions: vec![Arc::new(entry)],
        }
    }

    /// Appends a function and returns its unit-local index.
    pub fn add(&mut self, body: FunctionBody) -> u32 {
        self.functions.push(Arc::new(body));
        self.functions.len() as u32 - 1
    }

    /// The entry function.
    pub fn entry(&self) -> &FunctionBody {
        &self.functions[0]
    }

    /// Total instruction count across the unit.
    pub fn insn_count(&self) -> usize {
        self.functions.iter().map(|f| f.insns.len()).sum()
    }
}

impl fmt::Display for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, body) in self.functions.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", body)?;
        }
        Ok(())
    }
}

/// Handle of an installed function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncId(pub(crate) u32);

impl FuncId {
    /// Reinterprets a function-handle word.
    pub fn from_word(word: u64) -> Self {
        FuncId(word as u32)
    }

    /// The function-handle word.
    pub fn word(self) -> u64 {
        self.0 as u64
    }
}

/// An installed function.
#[derive(Debug, Clone)]
pub struct CodeEntry {
    /// The code
    pub body: Arc<FunctionBody>,
    /// Arena index of the unit's entry, used to resolve unit-local calls
    pub unit_base: u32,
}

impl CodeEntry {
    /// Resolves a unit-local function index.
    pub fn resolve(&self, index: u32) -> FuncId {
        FuncId(self.unit_base + index)
    }
}

/// Storage for installed native code.
#[derive(Debug, Default)]
pub struct CodeArena {
    entries: Vec<CodeEntry>,
}

impl CodeArena {
    /// Creates an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a unit and returns the handle of its entry.
    pub fn install(&mut self, unit: NativeFunction) -> Result<FuncId, BackendError> {
        let len = unit.functions.len();
        for body in &unit.functions {
            body.check_calls(len)?;
        }
        let unit_base = self.entries.len() as u32;
        for body in unit.functions {
            self.entries.push(CodeEntry { body, unit_base });
        }
        Ok(FuncId(unit_base))
    }

    /// Looks up an installed function.
    pub fn get(&self, id: FuncId) -> Option<&CodeEntry> {
        self.entries.get(id.0 as usize)
    }

    /// Number of installed functions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is installed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
