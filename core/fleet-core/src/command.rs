//! Bounded execution of external commands (`gh`, `git`).

use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{FleetError, Result};

pub(crate) struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
}

/// Runs a command, killing it if it outlives `timeout`.
pub(crate) fn run_with_timeout(
    program: &str,
    args: &[&str],
    cwd: Option<&Path>,
    timeout: Duration,
) -> Result<CommandOutput> {
    let rendered = format!("{} {}", program, args.join(" "));
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());
    if let Some(dir) = cwd.filter(|dir| dir.is_dir()) {
        command.current_dir(dir);
    }

    let mut child = command.spawn().map_err(|err| FleetError::CommandFailed {
        command: rendered.clone(),
        details: err.to_string(),
    })?;

    // Drain stdout on a helper thread so a chatty child can't fill the pipe
    // and deadlock against our wait loop.
    let reader = child.stdout.take().map(|mut stdout| {
        thread::spawn(move || {
            let mut buf = String::new();
            let _ = stdout.read_to_string(&mut buf);
            buf
        })
    });

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(FleetError::CommandTimedOut {
                    command: rendered,
                    secs: timeout.as_secs(),
                });
            }
            Ok(None) => thread::sleep(Duration::from_millis(25)),
            Err(err) => {
                let _ = child.kill();
                return Err(FleetError::CommandFailed {
                    command: rendered,
                    details: err.to_string(),
                });
            }
        }
    };

    let stdout = reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default();
    Ok(CommandOutput {
        success: status.success(),
        code: status.code(),
        stdout,
    })
}
