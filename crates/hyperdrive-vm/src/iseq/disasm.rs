// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Human-readable listings of instruction sequences.

use std::fmt;

use super::{Instruction, Iseq, Literal};

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Nil => write!(f, "nil"),
            Literal::True => write!(f, "true"),
            Literal::False => write!(f, "false"),
            Literal::Int(n) => write!(f, "{}", n),
            Literal::Str(s) => write!(f, "{:?}", s),
            Literal::Sym(s) => write!(f, ":{}", s),
            Literal::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

impl Iseq {
    fn operands(&self, offset: usize, insn: &Instruction) -> String {
        use Instruction::*;
        let local = |index: &usize| {
            self.locals
                .get(*index)
                .map(|name| format!("{} ({})", name, index))
                .unwrap_or_else(|| index.to_string())
        };
        match insn {
            PutObject { value } => value.to_string(),
            PutString { value } => format!("{:?}", value),
            DupArray { values } => Literal::Array(values.clone()).to_string(),
            NewArray { count } | NewHash { count } => count.to_string(),
            GetConstant { name } => name.clone(),
            GetLocal { index } | SetLocal { index } => local(index),
            GetDynamic { index, level } | SetDynamic { index, level } => {
                format!("{}, {}", index, level)
            }
            TopN { n } | SetN { n } => n.to_string(),
            Jump { offset: rel } | BranchIf { offset: rel } | BranchUnless { offset: rel } => {
                let target = (offset + insn.len()) as i64 + *rel as i64;
                format!("{:04}", target)
            }
            Send {
                mid,
                argc,
                block,
                flags,
            } => {
                let mut out = format!(":{}, {}", mid, argc);
                if let Some(block) = block {
                    out.push_str(&format!(", block {}", block));
                }
                if flags.fcall {
                    out.push_str(", FCALL");
                }
                if flags.vcall {
                    out.push_str(", VCALL");
                }
                if flags.splat {
                    out.push_str(", SPLAT");
                }
                if flags.blockarg {
                    out.push_str(", BLOCKARG");
                }
                out
            }
            InvokeBlock { argc } => argc.to_string(),
            Throw { state } => state.to_string(),
            _ => String::new(),
        }
    }

    fn write_listing(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        let pad = " ".repeat(indent);
        writeln!(
            f,
            "{}== {:?} {} (locals: {})",
            pad,
            self.kind,
            self.name,
            self.locals.join(", ")
        )?;
        if !self.catch_table.is_empty() {
            writeln!(f, "{}catch table", pad)?;
            for entry in &self.catch_table {
                write!(
                    f,
                    "{}| {:<7} st: {:04} ed: {:04} cont: {:04} sp: {}",
                    pad,
                    entry.kind.name(),
                    entry.start,
                    entry.end,
                    entry.cont,
                    entry.sp
                )?;
                match entry.handler {
                    Some(handler) => writeln!(f, " handler: {:04}", handler)?,
                    None => writeln!(f)?,
                }
            }
        }
        for (offset, insn, _) in self.instructions() {
            writeln!(
                f,
                "{}{:04} {:<14} {}",
                pad,
                offset,
                insn.mnemonic(),
                self.operands(offset, insn)
            )?;
        }
        for block in &self.blocks {
            block.write_listing(f, indent + 2)?;
        }
        Ok(())
    }
}

impl fmt::Display for Iseq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_listing(f, 0)
    }
}
