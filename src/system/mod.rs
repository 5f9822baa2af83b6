//! # System Interaction Layer
//!
//! Everything that touches the running operating system: child processes,
//! file events, the interactive shell host, and the reload supervisor that
//! ties them to the composed environment.
//!
//! ## Modules
//!
//! - **`executor`**: Spawns the configured system shell with an explicit
//!   environment, streaming both pipes line by line and honoring cancellation.
//! - **`watcher`**: Recursive file watching with include/exclude globs and a
//!   per-path debounce window. Emits settled batches of events.
//! - **`shell`**: The `ShellAdapter` seam and `LineShell`, the line-oriented
//!   host that runs dispatcher commands in process and everything else
//!   through the system shell.
//! - **`dispatcher`**: Routes input lines to project commands and runs the
//!   project's hooks around every command.
//! - **`supervisor`**: The Loading / Normal / Emergency state machine that
//!   keeps a running session consistent with the definition files on disk.

pub mod dispatcher;
pub mod executor;
pub mod shell;
pub mod supervisor;
pub mod watcher;
