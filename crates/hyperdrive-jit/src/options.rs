// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Compile options.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How blocks without parameters are passed to the method they are
/// attached to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationStrategy {
    /// The iterate primitive with a pending block
    #[default]
    Fast,
    /// A proc object passed as the call's block
    Proc,
    /// The iterate primitive, destructuring through the generic helper
    Splat,
}

/// Operand stack model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StackStrategy {
    /// Compile-time slots; unsafe branches abort compilation
    #[default]
    Static,
    /// A runtime stack pointer into the value stack
    Dynamic,
    /// Static, recompiling with the dynamic model on an unsafe branch
    Auto,
}

macro_rules! keyword_enum {
    ($ty:ident { $($variant:ident => $name:literal),+ $(,)? }) => {
        impl $ty {
            /// Keyword used in configuration files and on the command line.
            pub fn name(self) -> &'static str {
                match self {
                    $($ty::$variant => $name),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.name())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok($ty::$variant),)+
                    other => Err(format!(
                        "unknown {} `{}` (expected one of: {})",
                        stringify!($ty),
                        other,
                        [$($name),+].join(", ")
                    )),
                }
            }
        }
    };
}

keyword_enum!(IterationStrategy {
    Fast => "fast",
    Proc => "proc",
    Splat => "splat",
});

keyword_enum!(StackStrategy {
    Static => "static",
    Dynamic => "dynamic",
    Auto => "auto",
});

/// Options for one compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileOptions {
    /// 0 emits only generic dispatch; anything higher adds fast paths
    pub optimization_level: u8,
    /// Compile methods when they are defined instead of on first call
    pub precompile: bool,
    /// How parameterless blocks are passed
    pub iteration_strategy: IterationStrategy,
    /// Leave every method to the interpreter
    pub dont_compile: bool,
    /// Operand stack model
    pub stack: StackStrategy,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            optimization_level: 2,
            precompile: false,
            iteration_strategy: IterationStrategy::Fast,
            dont_compile: false,
            stack: StackStrategy::Static,
        }
    }
}

impl CompileOptions {
    /// Whether specialized instructions get inline fast paths.
    pub fn fast_paths(&self) -> bool {
        self.optimization_level > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keywords_round_trip_through_from_str() {
        assert_eq!("proc".parse::<IterationStrategy>(), Ok(IterationStrategy::Proc));
        assert_eq!("auto".parse::<StackStrategy>(), Ok(StackStrategy::Auto));
        assert_eq!(StackStrategy::Dynamic.to_string(), "dynamic");
        let err = "fancy".parse::<IterationStrategy>().unwrap_err();
        assert!(err.contains("fast, proc, splat"));
    }

    #[test]
    fn test_defaults() {
        let options = CompileOptions::default();
        assert_eq!(options.optimization_level, 2);
        assert!(options.fast_paths());
        assert!(!options.precompile);
        assert_eq!(options.stack, StackStrategy::Static);
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let options: CompileOptions =
            serde_json::from_str(r#"{ "iteration_strategy": "splat", "precompile": true }"#).unwrap();
        assert_eq!(options.iteration_strategy, IterationStrategy::Splat);
        assert!(options.precompile);
        assert_eq!(options.optimization_level, 2);
        assert_eq!(options.stack, StackStrategy::Static);
    }
}
