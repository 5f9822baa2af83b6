// src/system/executor.rs

use crate::{CancellationToken, models::ShellSettings};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, Command as StdCommand, Stdio};
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::time::Duration;
use thiserror::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Command '{0}' could not be executed: {1}")]
    CommandFailed(String, std::io::Error),
    #[error("Operation was cancelled by the user.")]
    Cancelled,
}

/// Which pipe a line of output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

fn is_cancelled(token: &CancellationToken) -> bool {
    token.load(Ordering::Relaxed)
}

/// Runs `line` through the system shell with both output pipes streamed
/// line by line into `on_line`, on the calling thread. Returns the exit code.
///
/// Lines are delivered with their trailing newline. The child is killed if
/// the token is cancelled.
pub fn run_shell_streaming(
    shell: &ShellSettings,
    line: &str,
    cwd: &Path,
    env_vars: &HashMap<String, String>,
    cancellation_token: &CancellationToken,
    on_line: &mut dyn FnMut(Stream, String),
) -> Result<i32, ExecutionError> {
    if line.trim().is_empty() {
        return Ok(0);
    }

    let mut child = StdCommand::new(&shell.path)
        .args(&shell.args)
        .arg(line)
        .current_dir(dunce::simplified(cwd))
        .env_clear()
        .envs(env_vars)
        .stdin(Stdio::inherit())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| ExecutionError::CommandFailed(line.to_string(), e))?;

    let (tx, rx) = mpsc::channel::<(Stream, String)>();
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_reader(stdout, Stream::Stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_reader(stderr, Stream::Stderr, tx.clone()));
    }
    drop(tx);

    // Drain output until both pipes close, watching for cancellation.
    loop {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok((stream, text)) => on_line(stream, text),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if is_cancelled(cancellation_token) {
                    kill(&mut child);
                    return Err(ExecutionError::Cancelled);
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    for reader in readers {
        reader.join().ok();
    }

    let status = child
        .wait()
        .map_err(|e| ExecutionError::CommandFailed(line.to_string(), e))?;
    Ok(status.code().unwrap_or(-1))
}

fn spawn_reader<R: Read + Send + 'static>(
    pipe: R,
    stream: Stream,
    tx: mpsc::Sender<(Stream, String)>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&buf).into_owned();
                    if tx.send((stream, text)).is_err() {
                        break;
                    }
                }
            }
        }
    })
}

fn kill(child: &mut Child) {
    log::debug!("Cancellation requested, killing child process (PID: {})...", child.id());
    if let Err(e) = child.kill() {
        log::warn!("Failed to kill child process {}: {}", child.id(), e);
    }
    child.wait().ok();
}
