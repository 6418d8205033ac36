// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! hyperdrive - runs YARV-style bytecode programs through a method-level JIT.
//!
//! ## Commands
//!
//! - `run` loads a JSON program, installs the JIT and runs `main`
//! - `disasm` prints every instruction sequence of a program
//! - `compile` compiles each method and reports which fall back

mod cli;
mod config;

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use hyperdrive_jit::{Jit, Outcome};
use hyperdrive_vm::iseq::Program;
use hyperdrive_vm::{Runtime, RuntimeError};
use owo_colors::OwoColorize;
use tracing::{debug, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use cli::{Cli, Commands, CompileArgs};
use config::HyperdriveConfig;

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.jit_log.as_deref());

    match dispatch(&cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}: {:#}", "Error".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(filter: Option<&str>) {
    let filter = match filter {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn dispatch(cli: &Cli) -> Result<ExitCode> {
    let mut config = match &cli.config {
        Some(path) => HyperdriveConfig::load(path)?,
        None => HyperdriveConfig::default(),
    };
    config.apply(&cli.jit);
    debug!(?config, "configuration");

    match &cli.command {
        Commands::Run(args) => run(&args.program, config),
        Commands::Disasm(args) => disasm(&args.program),
        Commands::Compile(args) => compile(args, config),
    }
}

fn load(path: &Path) -> Result<Program> {
    Program::load(path).with_context(|| format!("loading {}", path.display()))
}

/// Runs a program's `main` with every method going through the JIT.
fn run(path: &Path, mut config: HyperdriveConfig) -> Result<ExitCode> {
    let program = load(path)?;
    config.runtime.echo_output = true;

    let mut rt = Runtime::new(config.runtime);
    let jit = Jit::new(config.jit).install(&mut rt);
    let result = rt.run(&program);
    report(&jit);

    match result {
        Ok(_) => Ok(ExitCode::SUCCESS),
        Err(RuntimeError::Uncaught { class, message }) => {
            eprintln!("{}: {} ({})", "Uncaught".red().bold(), message, class.yellow());
            Ok(ExitCode::FAILURE)
        }
        Err(e) => Err(e.into()),
    }
}

fn report(jit: &Arc<Jit>) {
    let decisions = jit.decisions();
    let compiled = decisions
        .iter()
        .filter(|d| matches!(d.outcome, Outcome::Compiled { .. }))
        .count();
    info!(attempted = decisions.len(), compiled, "jit summary");
}

fn disasm(path: &Path) -> Result<ExitCode> {
    let program = load(path)?;
    for def in &program.methods {
        println!("{} {}#{}", "==".dimmed(), def.owner.cyan(), def.iseq.name.green().bold());
        println!("{}", def.iseq);
    }
    println!("{} {}", "==".dimmed(), program.main.name.green().bold());
    println!("{}", program.main);
    Ok(ExitCode::SUCCESS)
}

/// Compiles each method on its own and prints the outcome.
fn compile(args: &CompileArgs, config: HyperdriveConfig) -> Result<ExitCode> {
    let program = load(&args.program)?;
    let rt = Runtime::new(config.runtime);
    let jit = Jit::new(config.jit);

    let mut failed = 0;
    for def in &program.methods {
        let name = format!("{}#{}", def.owner, def.iseq.name);
        match jit.compile_iseq(&def.iseq, &rt.symbols) {
            Ok(unit) => {
                println!(
                    "{:>10} {} ({} functions, {} insns)",
                    "compiled".green().bold(),
                    name,
                    unit.functions.len(),
                    unit.insn_count()
                );
                if args.dump {
                    println!("{}", unit);
                }
            }
            Err(e) => {
                failed += 1;
                println!("{:>10} {} [{}] {}", "fallback".yellow().bold(), name, e.kind().cyan(), e);
            }
        }
    }

    let total = program.methods.len();
    println!();
    println!("{} of {} methods compiled", (total - failed).to_string().bold(), total);
    Ok(ExitCode::SUCCESS)
}
