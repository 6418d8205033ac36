// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Runtime errors and non-local exit signals.

use thiserror::Error;

/// Result type for public runtime entry points.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Result type used inside the runtime, where a non-local exit travels as
/// `Err(Jump)` and its payload lives in the thread state.
pub type RunResult<T> = std::result::Result<T, Jump>;

/// Why control resumed at a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum State {
    /// `return` unwinding through frames
    Return = 1,
    /// `break` out of a block
    Break = 2,
    /// `next` inside a block or loop
    Next = 3,
    /// `retry` of a begin/rescue
    Retry = 4,
    /// `redo` of a block or loop body
    Redo = 5,
    /// A raised exception
    Raise = 6,
    /// `throw` to a `catch`
    Throw = 7,
    /// Unrecoverable failure
    Fatal = 8,
}

impl State {
    /// The integer code observed by a checkpoint.
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Decodes a state code. Zero (normal flow) and unknown codes yield `None`.
    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            1 => State::Return,
            2 => State::Break,
            3 => State::Next,
            4 => State::Retry,
            5 => State::Redo,
            6 => State::Raise,
            7 => State::Throw,
            8 => State::Fatal,
            _ => return None,
        })
    }

    /// Keyword name used in diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            State::Return => "return",
            State::Break => "break",
            State::Next => "next",
            State::Retry => "retry",
            State::Redo => "redo",
            State::Raise => "raise",
            State::Throw => "throw",
            State::Fatal => "fatal",
        }
    }
}

/// A non-local exit in flight.
///
/// This is a control signal rather than an error object: the exception or
/// jump value it carries is stored in the thread state (`errinfo` or
/// `jump_value`) so that handlers can pick it up after the unwind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Jump {
    /// The state code
    pub state: State,
}

impl Jump {
    /// Creates a jump with the given state.
    pub fn new(state: State) -> Self {
        Self { state }
    }
}

/// Errors surfaced at the runtime's public boundary.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// An exception escaped every handler
    #[error("{class}: {message}")]
    Uncaught {
        /// Exception class name
        class: String,
        /// Exception message
        message: String,
    },

    /// A break/next/redo/retry signal escaped its target
    #[error("LocalJumpError: unexpected {0}")]
    LocalJump(&'static str),

    /// Malformed program or instruction sequence
    #[error("invalid program: {0}")]
    InvalidProgram(String),

    /// Method not found when invoking from the host
    #[error("undefined method '{method}' for {receiver}")]
    NoMethod {
        /// Method name
        method: String,
        /// Receiver description
        receiver: String,
    },

    /// I/O error while loading a program
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error while loading a program
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RuntimeError {
    /// Create an invalid program error
    pub fn invalid_program(msg: impl Into<String>) -> Self {
        Self::InvalidProgram(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_codes_round_trip() {
        for code in 1..=8 {
            let state = State::from_code(code).unwrap();
            assert_eq!(state.code(), code);
        }
        assert!(State::from_code(0).is_none());
        assert!(State::from_code(9).is_none());
    }

    #[test]
    fn test_uncaught_display() {
        let err = RuntimeError::Uncaught {
            class: "RuntimeError".into(),
            message: "x".into(),
        };
        assert_eq!(err.to_string(), "RuntimeError: x");
    }
}
