// src/bin/strata.rs

use anyhow::Result;
use clap::Parser;
use colored::*;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use strata::{
    CancellationToken,
    cli::{Cli, handlers},
    system::executor,
};

// --- Command Definition and Registry ---

/// A launcher action, its aliases, and its handler. Handlers return the exit
/// code of the process.
struct CommandDefinition {
    name: &'static str,
    aliases: &'static [&'static str],
    /// Whether the action runs under a stage (`strata <stage> <action>`).
    staged: bool,
    handler: fn(Option<String>, Vec<String>, &CancellationToken) -> Result<i32>,
}

static COMMAND_REGISTRY: &[CommandDefinition] = &[
    CommandDefinition {
        name: "init",
        aliases: &["new"],
        staged: false,
        handler: handlers::init::handle,
    },
    CommandDefinition {
        name: "version",
        aliases: &[],
        staged: false,
        handler: handlers::version::handle,
    },
    CommandDefinition {
        name: "run",
        aliases: &[],
        staged: true,
        handler: handlers::run::handle,
    },
    CommandDefinition {
        name: "-c",
        aliases: &[],
        staged: true,
        handler: handlers::run::handle_inline,
    },
    CommandDefinition {
        name: "dry-run",
        aliases: &[],
        staged: true,
        handler: handlers::dry_run::handle,
    },
    CommandDefinition {
        name: "dump",
        aliases: &[],
        staged: true,
        handler: handlers::dump::handle,
    },
];

/// Finds a command definition in the registry by its name or alias.
fn find_command(name: &str) -> Option<&'static CommandDefinition> {
    COMMAND_REGISTRY
        .iter()
        .find(|cmd| cmd.name == name || cmd.aliases.contains(&name))
}

fn main() {
    let cancellation_token = Arc::new(AtomicBool::new(false));
    env_logger::init();

    match run_cli(Cli::parse(), cancellation_token) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            if let Some(executor::ExecutionError::Cancelled) = e.downcast_ref::<executor::ExecutionError>() {
                std::process::exit(130);
            }
            eprintln!("\n{}: {:#}", "Error".red().bold(), e);
            std::process::exit(1);
        }
    }
}

/// Routes `strata [stage] [action [args...]]`.
///
/// The first word is an action if the registry knows it; otherwise it is a
/// stage, and the second word (if any) must be a staged action.
fn run_cli(cli: Cli, cancellation_token: CancellationToken) -> Result<i32> {
    log::debug!("CLI args parsed: {:?}", cli);

    let mut words = cli.args.into_iter();
    let Some(first) = words.next() else {
        return handlers::shell::handle(None, Vec::new(), &cancellation_token);
    };

    if let Some(command) = find_command(&first) {
        return (command.handler)(None, words.collect(), &cancellation_token);
    }

    let stage = Some(first);
    match words.next() {
        None => handlers::shell::handle(stage, Vec::new(), &cancellation_token),
        Some(action) => match find_command(&action) {
            Some(command) if command.staged => (command.handler)(stage, words.collect(), &cancellation_token),
            Some(command) => anyhow::bail!("'{}' does not take a stage.", command.name),
            None => anyhow::bail!("Unknown action '{}'. See 'strata --help'.", action),
        },
    }
}
