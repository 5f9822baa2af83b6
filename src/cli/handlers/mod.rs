// src/cli/handlers/mod.rs

// One module per launcher action. Every handler receives the stage named on
// the command line (if any) and the remaining arguments, and returns the exit
// code of the process.

pub mod commons;
pub mod dry_run;
pub mod dump;
pub mod init;
pub mod run;
pub mod shell;
pub mod version;
