// src/cli/mod.rs

use clap::Parser;

pub mod args;
pub mod handlers;

const HELP_TEMPLATE: &str = "\
<title>strata</title> {version}
A per-project, stage-aware shell environment manager with live reloading.

<title>USAGE</title>
  <cmd>strata</cmd> <dim>[stage]</dim>                  Start an interactive session
  <cmd>strata</cmd> <dim>[stage]</dim> <hl>run</hl> <dim><command>...</dim>       Run one command under the environment
  <cmd>strata</cmd> <dim>[stage]</dim> <hl>-c</hl> <dim>\"<line>\"</dim>        Same, with the command as one string
  <cmd>strata</cmd> <dim>[stage]</dim> <hl>dry-run</hl>          Print the projected variables as exports
  <cmd>strata</cmd> <dim>[stage]</dim> <hl>dump</hl>             Write <hi>.env_<stage></hi> next to the definition
  <cmd>strata</cmd> <hl>init</hl> <dim>[stage]</dim>             Scaffold definition files here (default stage: comm)
  <cmd>strata</cmd> <hl>version</hl>                  Print the version

<group>STAGES</group>
  Definition files are named <hi>env_<stage>.toml</hi>. Without a stage, the
  closest directory holding definitions is used and its highest-priority
  stage wins (local > comm > test > ci > stage > prod).

<group>ENVIRONMENT</group>
  STRATA_DEBUG     Echo shell commands before running them
  RUST_LOG         Log verbosity (error, warn, info, debug)
";

/// Renders the semantic help template with or without colors.
fn build_help_string() -> &'static str {
    let use_colors = colored::control::SHOULD_COLORIZE.should_colorize();

    let title = if use_colors { "\x1b[1;33m" } else { "" }; // Bold Yellow
    let hl = if use_colors { "\x1b[1;36m" } else { "" }; // Bold Cyan
    let hi = if use_colors { "\x1b[1m" } else { "" };
    let cmd = if use_colors { "\x1b[36m" } else { "" }; // Cyan
    let group = if use_colors { "\x1b[1;32m" } else { "" }; // Bold Green
    let dim = if use_colors { "\x1b[2m" } else { "" };
    let reset = if use_colors { "\x1b[0m" } else { "" };

    let formatted_string = HELP_TEMPLATE
        .replace("<title>", title)
        .replace("</title>", reset)
        .replace("<hl>", hl)
        .replace("</hl>", reset)
        .replace("<hi>", hi)
        .replace("</hi>", reset)
        .replace("<cmd>", cmd)
        .replace("</cmd>", reset)
        .replace("<group>", group)
        .replace("</group>", reset)
        .replace("<dim>", dim)
        .replace("</dim>", reset);

    Box::leak(formatted_string.into_boxed_str())
}

/// strata: a per-project shell environment manager.
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about,
    help_template = { build_help_string() },
    styles = clap::builder::Styles::styled()
        .header(clap::builder::styling::AnsiColor::Yellow.on_default().bold())
        .usage(clap::builder::styling::AnsiColor::Yellow.on_default().bold())
        .literal(clap::builder::styling::AnsiColor::Cyan.on_default().bold())
        .placeholder(clap::builder::styling::AnsiColor::Green.on_default()),
)]
#[command(disable_help_subcommand = true)]
#[command(trailing_var_arg = true)]
pub struct Cli {
    /// Everything after the binary name; routed by `bin/strata.rs`.
    #[arg(allow_hyphen_values = true)]
    pub args: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hyphenated_actions_are_kept_as_arguments() {
        let cli = Cli::try_parse_from(["strata", "local", "-c", "echo hi"]).unwrap();
        assert_eq!(cli.args, vec!["local", "-c", "echo hi"]);

        let cli = Cli::try_parse_from(["strata", "run", "ls", "-la"]).unwrap();
        assert_eq!(cli.args, vec!["run", "ls", "-la"]);
    }
}
