// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Compile errors.
//!
//! Compilation is all-or-nothing: any error abandons the whole unit and
//! the method stays with the interpreter.

use hyperdrive_vm::backend::BackendError;
use thiserror::Error;

/// Result type for compilation.
pub type Result<T> = std::result::Result<T, CompileError>;

/// Why a method could not be compiled.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CompileError {
    /// A variable was read or written without being declared in scope
    #[error("undeclared variable `{name}` at offset {offset}")]
    UndeclaredVariable {
        /// Variable name
        name: String,
        /// Offset of the accessing instruction
        offset: usize,
    },

    /// A branch would carry operand stack values across a point where the
    /// static stack model cannot follow them
    #[error("unsafe branch at offset {offset} to {target}")]
    UnsafeBranch {
        /// Offset of the branching instruction
        offset: usize,
        /// Absolute branch target
        target: usize,
    },

    /// The sequence uses something this compiler does not handle
    #[error("unsupported construct at offset {offset}: {construct}")]
    UnsupportedConstruct {
        /// Offset of the offending instruction
        offset: usize,
        /// What was found
        construct: String,
    },

    /// Compilation was disabled for this method
    #[error("not compiling `{name}`")]
    NotCompiled {
        /// Method name
        name: String,
    },

    /// The backend rejected the emitted code
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
}

impl CompileError {
    /// Creates an unsupported-construct error.
    pub fn unsupported(offset: usize, construct: impl Into<String>) -> Self {
        CompileError::UnsupportedConstruct {
            offset,
            construct: construct.into(),
        }
    }

    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            CompileError::UndeclaredVariable { .. } => "undeclared_variable",
            CompileError::UnsafeBranch { .. } => "unsafe_branch",
            CompileError::UnsupportedConstruct { .. } => "unsupported_construct",
            CompileError::NotCompiled { .. } => "not_compiled",
            CompileError::Backend(_) => "backend",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_carry_offsets() {
        let err = CompileError::UnsafeBranch { offset: 7, target: 2 };
        assert_eq!(err.to_string(), "unsafe branch at offset 7 to 2");

        let err = CompileError::unsupported(3, "send with splat");
        assert_eq!(err.to_string(), "unsupported construct at offset 3: send with splat");
        assert_eq!(err.kind(), "unsupported_construct");
    }
}
