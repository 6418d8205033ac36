// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! The compile hook installed into a runtime.
//!
//! Newly defined methods start as stubs that compile on their first call,
//! or are compiled right away under `precompile`. A method that fails to
//! compile stays with the interpreter for good.

use std::sync::Arc;

use hyperdrive_vm::SymbolTable;
use hyperdrive_vm::backend::NativeFunction;
use hyperdrive_vm::iseq::Iseq;
use hyperdrive_vm::runtime::{CompileHook, Disposition, IseqMethod, MethodState, Runtime};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::Result;
use crate::options::CompileOptions;

/// What happened to one method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Native code was produced
    Compiled {
        /// Functions in the unit
        functions: usize,
        /// Backend instructions across the unit
        insns: usize,
    },
    /// The method stays interpreted
    Fallback {
        /// Error kind
        kind: &'static str,
        /// Error message
        reason: String,
    },
}

/// One compile attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Method name
    pub method: String,
    /// Result
    pub outcome: Outcome,
}

/// The JIT.
#[derive(Debug)]
pub struct Jit {
    options: CompileOptions,
    decisions: Mutex<Vec<Decision>>,
}

impl Jit {
    /// Creates a JIT with the given options.
    pub fn new(options: CompileOptions) -> Self {
        Self {
            options,
            decisions: Mutex::new(Vec::new()),
        }
    }

    /// Options in effect.
    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    /// Installs this JIT as the runtime's compile hook.
    pub fn install(self, rt: &mut Runtime) -> Arc<Self> {
        let jit = Arc::new(self);
        rt.set_compile_hook(Arc::clone(&jit) as Arc<dyn CompileHook>);
        jit
    }

    /// Compiles one method body, recording the outcome.
    pub fn compile_iseq(&self, iseq: &Iseq, symbols: &SymbolTable) -> Result<NativeFunction> {
        let result = crate::compile(iseq, &self.options, symbols);
        let outcome = match &result {
            Ok(unit) => Outcome::Compiled {
                functions: unit.functions.len(),
                insns: unit.insn_count(),
            },
            Err(err) => Outcome::Fallback {
                kind: err.kind(),
                reason: err.to_string(),
            },
        };
        self.decisions.lock().push(Decision {
            method: iseq.name.clone(),
            outcome,
        });
        result
    }

    /// Every compile attempt so far, in order.
    pub fn decisions(&self) -> Vec<Decision> {
        self.decisions.lock().clone()
    }

    /// Compiles every method still waiting for its first call and installs
    /// the results. Returns the number of methods now compiled.
    pub fn precompile_all(&self, rt: &mut Runtime) -> usize {
        let pending = rt.pending_methods();
        let symbols = Arc::clone(&rt.symbols);
        let results = self.compile_pending(&pending, &symbols);

        let mut compiled = 0;
        for (method, result) in pending.iter().zip(results) {
            match result {
                Ok(unit) => {
                    if matches!(rt.install_compiled(method, unit), MethodState::Compiled(_)) {
                        compiled += 1;
                    }
                }
                Err(err) => {
                    warn!(method = %method.name(), %err, "staying interpreted");
                    method.set_state(MethodState::Interpreted);
                }
            }
        }
        info!(pending = pending.len(), compiled, "precompiled");
        compiled
    }

    #[cfg(feature = "parallel")]
    fn compile_pending(
        &self,
        pending: &[Arc<IseqMethod>],
        symbols: &SymbolTable,
    ) -> Vec<Result<NativeFunction>> {
        use rayon::prelude::*;
        pending
            .par_iter()
            .map(|method| self.compile_iseq(&method.iseq, symbols))
            .collect()
    }

    #[cfg(not(feature = "parallel"))]
    fn compile_pending(
        &self,
        pending: &[Arc<IseqMethod>],
        symbols: &SymbolTable,
    ) -> Vec<Result<NativeFunction>> {
        pending
            .iter()
            .map(|method| self.compile_iseq(&method.iseq, symbols))
            .collect()
    }
}

impl CompileHook for Jit {
    fn method_added(&self, owner: &str, iseq: &Iseq) -> Disposition {
        if self.options.dont_compile {
            info!(owner, method = %iseq.name, "not compiling");
            Disposition::Interpret
        } else if self.options.precompile {
            Disposition::Compile
        } else {
            Disposition::Stub
        }
    }

    fn compile(&self, iseq: &Iseq, symbols: &SymbolTable) -> Option<NativeFunction> {
        match self.compile_iseq(iseq, symbols) {
            Ok(unit) => Some(unit),
            Err(err) => {
                warn!(method = %iseq.name, kind = err.kind(), %err, "compile failed, staying interpreted");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyperdrive_vm::iseq::IseqBuilder;
    use hyperdrive_vm::runtime::RuntimeConfig;

    fn answer() -> Iseq {
        let mut b = IseqBuilder::method("answer");
        b.int(42).leave();
        b.build().unwrap()
    }

    #[test]
    fn test_method_added_follows_options() {
        let iseq = answer();
        let jit = Jit::new(CompileOptions::default());
        assert_eq!(jit.method_added("Object", &iseq), Disposition::Stub);

        let jit = Jit::new(CompileOptions {
            precompile: true,
            ..Default::default()
        });
        assert_eq!(jit.method_added("Object", &iseq), Disposition::Compile);

        let jit = Jit::new(CompileOptions {
            dont_compile: true,
            precompile: true,
            ..Default::default()
        });
        assert_eq!(jit.method_added("Object", &iseq), Disposition::Interpret);
    }

    #[test]
    fn test_precompile_all_installs_pending_stubs() {
        let mut rt = Runtime::new(RuntimeConfig::default());
        let jit = Jit::new(CompileOptions::default()).install(&mut rt);
        let method = rt.define_method("Object", answer()).unwrap();
        assert_eq!(method.state(), MethodState::Stub);

        assert_eq!(jit.precompile_all(&mut rt), 1);
        assert!(matches!(method.state(), MethodState::Compiled(_)));
        assert!(matches!(
            jit.decisions()[0].outcome,
            Outcome::Compiled { functions: 1, .. }
        ));
    }
}
