// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! # hyperdrive-jit
//!
//! A method-level compiler from YARV-style instruction sequences to the
//! native code backend of [`hyperdrive_vm`].
//!
//! Each method is translated in a single forward pass. Locals live in
//! registers, or in a shared scope block when the method creates blocks.
//! The operand stack is modelled at compile time with one register per
//! depth, falling back to a runtime stack pointer for branches the static
//! model cannot follow. Catch regions become tags on the thread's handler
//! chain, and the `opt_*` instructions get inline fixnum and collection
//! fast paths.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use hyperdrive_jit::{CompileOptions, Jit};
//! use hyperdrive_vm::iseq::{Instruction, IseqBuilder};
//! use hyperdrive_vm::runtime::{Runtime, RuntimeConfig};
//! use hyperdrive_vm::Value;
//!
//! let mut rt = Runtime::new(RuntimeConfig::default());
//! Jit::new(CompileOptions::default()).install(&mut rt);
//!
//! let mut b = IseqBuilder::method("double");
//! b.required("n");
//! b.getlocal("n").int(2).op(Instruction::OptMult).leave();
//! rt.define_method("Object", b.build().unwrap()).unwrap();
//!
//! let main = rt.main_object();
//! let result = rt.call_method(main, "double", &[Value::fixnum(21).unwrap()]).unwrap();
//! assert_eq!(result.as_fixnum(), Some(42));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod compiler;
pub mod driver;
pub mod error;
pub mod options;

pub use driver::{Decision, Jit, Outcome};
pub use error::{CompileError, Result};
pub use options::{CompileOptions, IterationStrategy, StackStrategy};

use hyperdrive_vm::SymbolTable;
use hyperdrive_vm::backend::NativeFunction;
use hyperdrive_vm::iseq::Iseq;
use tracing::{debug, info};

use compiler::{StackModel, compile_unit};

/// Compiles a method body into a native unit.
///
/// Under [`StackStrategy::Auto`] the unit is compiled with the static stack
/// model first and recompiled with the dynamic one if a branch turns out to
/// be unsafe.
pub fn compile(iseq: &Iseq, options: &CompileOptions, symbols: &SymbolTable) -> Result<NativeFunction> {
    if options.dont_compile {
        info!(method = %iseq.name, "not compiling");
        return Err(CompileError::NotCompiled {
            name: iseq.name.clone(),
        });
    }

    let unit = match options.stack {
        StackStrategy::Static => compile_unit(iseq, options, symbols, StackModel::Static),
        StackStrategy::Dynamic => compile_unit(iseq, options, symbols, StackModel::Dynamic),
        StackStrategy::Auto => match compile_unit(iseq, options, symbols, StackModel::Static) {
            Err(err @ CompileError::UnsafeBranch { .. }) => {
                debug!(method = %iseq.name, %err, "retrying with the dynamic stack model");
                compile_unit(iseq, options, symbols, StackModel::Dynamic)
            }
            other => other,
        },
    }?;

    info!(
        method = %iseq.name,
        functions = unit.functions.len(),
        insns = unit.insn_count(),
        "compiled"
    );
    Ok(unit)
}
