// src/cli/args.rs
use clap::Parser;

#[derive(Parser, Debug, Default)]
#[command(no_binary_name = true)] // The action name is consumed by the router.
pub struct InitArgs {
    /// The stage to scaffold. `env_comm.toml` is always written; any other
    /// stage also gets its own file. Defaults to `comm`.
    pub stage: Option<String>,
}

#[derive(Parser, Debug, Default)]
#[command(no_binary_name = true)]
pub struct RunArgs {
    /// The command and its arguments, re-quoted into one shell line.
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

#[derive(Parser, Debug, Default)]
#[command(no_binary_name = true)]
pub struct InlineArgs {
    /// The command line, passed through as written.
    #[arg(allow_hyphen_values = true)]
    pub command: String,
}
