// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! # hyperdrive-vm
//!
//! The host side of the hyperdrive method JIT: a small object runtime
//! with YARV-style instruction sequences, a reference interpreter, and the
//! native code backend that compiled methods target.
//!
//! ## Overview
//!
//! - [`value`]: one-word tagged values (fixnums, immediates, heap refs)
//! - [`iseq`]: instruction sequences, catch tables and an assembler
//! - [`runtime`]: heap, classes, method dispatch, blocks, non-local exits
//! - [`backend`]: the function builder, code arena and executor
//!
//! ## Quick Start
//!
//! ```rust
//! use hyperdrive_vm::iseq::{Instruction, IseqBuilder};
//! use hyperdrive_vm::runtime::{Runtime, RuntimeConfig};
//!
//! let mut b = IseqBuilder::top("main");
//! b.int(40).int(2).op(Instruction::OptPlus).leave();
//!
//! let mut rt = Runtime::new(RuntimeConfig::default());
//! let result = rt.run_main(&b.build().unwrap()).unwrap();
//! assert_eq!(result.as_fixnum(), Some(42));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod error;
pub mod iseq;
pub mod runtime;
pub mod symbol;
pub mod value;

pub use error::{Jump, Result, RunResult, RuntimeError, State};
pub use runtime::{Runtime, RuntimeConfig};
pub use symbol::{SymbolId, SymbolTable};
pub use value::Value;
