// Copyright © 2024, Embark Studios, all rights reserved.
// Created: 26 February 2024

use anyhow::Result;
use clap::Parser;

mod describe;
mod run;

/// The command to run.
#[derive(Parser, Debug)]
pub(crate) enum Command {
    Describe(describe::DescribeArgs),
    Run(run::Args),
}

pub(crate) fn run(command: Command) -> Result<()> {
    match command {
        Command::Describe(config) => describe::describe(config),
        Command::Run(config) => run::run(config),
    }
}

/// Indent every line of `target` by `prefix_len` spaces.
pub(crate) fn indent_by(target: String, prefix_len: usize) -> String {
    let prefix = " ".repeat(prefix_len);

    target
        .lines()
        .map(|line| format!("{}{}", prefix, line))
        .collect::<Vec<_>>()
        .join("\n")
}
