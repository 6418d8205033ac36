// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! `hyperdrive.toml` configuration.
//!
//! ```toml
//! [jit]
//! optimization_level = 2
//! precompile = true
//! iteration_strategy = "proc"
//! stack = "auto"
//!
//! [runtime]
//! gc_stress = false
//! max_depth = 2000
//! ```

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use hyperdrive_jit::CompileOptions;
use hyperdrive_vm::RuntimeConfig;
use serde::{Deserialize, Serialize};

use crate::cli::JitArgs;

/// Everything a run can be configured with.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HyperdriveConfig {
    /// Compiler options
    pub jit: CompileOptions,
    /// Runtime limits and GC behavior
    pub runtime: RuntimeConfig,
}

impl HyperdriveConfig {
    /// Loads a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let source = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::parse(&source).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Parses TOML source.
    pub fn parse(source: &str) -> Result<Self> {
        Ok(toml::from_str(source)?)
    }

    /// Applies command line overrides on top of the file.
    pub fn apply(&mut self, args: &JitArgs) {
        if let Some(level) = args.optimization_level {
            self.jit.optimization_level = level;
        }
        if args.precompile {
            self.jit.precompile = true;
        }
        if let Some(strategy) = args.iterate {
            self.jit.iteration_strategy = strategy;
        }
        if args.dont_compile {
            self.jit.dont_compile = true;
        }
        if let Some(stack) = args.stack {
            self.jit.stack = stack;
        }
        if args.gc_stress {
            self.runtime.gc_stress = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyperdrive_jit::{IterationStrategy, StackStrategy};

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = HyperdriveConfig::parse("").unwrap();
        assert_eq!(config, HyperdriveConfig::default());
        assert_eq!(config.jit.optimization_level, 2);
    }

    #[test]
    fn test_partial_sections() {
        let config = HyperdriveConfig::parse(
            r#"
            [jit]
            iteration_strategy = "splat"
            stack = "auto"

            [runtime]
            gc_stress = true
            "#,
        )
        .unwrap();
        assert_eq!(config.jit.iteration_strategy, IterationStrategy::Splat);
        assert_eq!(config.jit.stack, StackStrategy::Auto);
        assert!(!config.jit.precompile);
        assert!(config.runtime.gc_stress);
    }

    #[test]
    fn test_unknown_strategy_is_rejected() {
        assert!(HyperdriveConfig::parse("[jit]\nstack = \"sideways\"").is_err());
    }

    #[test]
    fn test_flags_override_file() {
        let mut config = HyperdriveConfig::parse("[jit]\noptimization_level = 2\nstack = \"auto\"").unwrap();
        config.apply(&JitArgs {
            optimization_level: Some(0),
            stack: Some(StackStrategy::Dynamic),
            precompile: true,
            ..JitArgs::default()
        });
        assert_eq!(config.jit.optimization_level, 0);
        assert_eq!(config.jit.stack, StackStrategy::Dynamic);
        assert!(config.jit.precompile);
        assert!(!config.jit.dont_compile);
    }
}
