// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Command line arguments.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use hyperdrive_jit::{IterationStrategy, StackStrategy};

/// hyperdrive - runs bytecode programs through a method-level JIT
#[derive(Parser, Debug)]
#[command(name = "hyperdrive")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log filter for compiler and runtime events, e.g. `debug` or
    /// `hyperdrive_jit=trace` (overrides RUST_LOG)
    #[arg(long, global = true)]
    pub jit_log: Option<String>,

    #[command(flatten)]
    pub jit: JitArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a program
    Run(ProgramArgs),

    /// Print the instruction sequences of a program
    Disasm(ProgramArgs),

    /// Compile every method of a program and report the outcome
    Compile(CompileArgs),
}

#[derive(Args, Debug)]
pub struct ProgramArgs {
    /// Program file (JSON)
    pub program: PathBuf,
}

#[derive(Args, Debug)]
pub struct CompileArgs {
    /// Program file (JSON)
    pub program: PathBuf,

    /// Also print the native code of each compiled method
    #[arg(long)]
    pub dump: bool,
}

/// Compiler and runtime overrides.
#[derive(Args, Debug, Default, Clone)]
pub struct JitArgs {
    /// Optimization level (0 disables fast paths)
    #[arg(short = 'O', global = true, value_name = "LEVEL")]
    pub optimization_level: Option<u8>,

    /// Compile methods when defined instead of on first call
    #[arg(long, global = true)]
    pub precompile: bool,

    /// Block passing strategy: fast, proc or splat
    #[arg(long, global = true, value_name = "STYLE")]
    pub iterate: Option<IterationStrategy>,

    /// Leave every method to the interpreter
    #[arg(long, global = true)]
    pub dont_compile: bool,

    /// Operand stack model: static, dynamic or auto
    #[arg(long, global = true, value_name = "MODEL")]
    pub stack: Option<StackStrategy>,

    /// Collect garbage at every safepoint
    #[arg(long, global = true)]
    pub gc_stress: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_flags_after_subcommand() {
        let cli = Cli::parse_from([
            "hyperdrive",
            "run",
            "prog.json",
            "-O",
            "0",
            "--iterate",
            "proc",
            "--stack",
            "auto",
        ]);
        assert_eq!(cli.jit.optimization_level, Some(0));
        assert_eq!(cli.jit.iterate, Some(IterationStrategy::Proc));
        assert_eq!(cli.jit.stack, Some(StackStrategy::Auto));
        assert!(matches!(cli.command, Commands::Run(ref args) if args.program == PathBuf::from("prog.json")));
    }

    #[test]
    fn test_unknown_stack_model_is_rejected() {
        assert!(Cli::try_parse_from(["hyperdrive", "run", "p.json", "--stack", "sideways"]).is_err());
    }
}
