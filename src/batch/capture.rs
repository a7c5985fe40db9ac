use std::{
    io,
    path::Path,
    process::Stdio,
    time::Duration,
};

use tokio::{
    io::AsyncReadExt,
    process::{ChildStderr, ChildStdout},
};

use crate::{
    batch::{CommandResult, CommandStatus},
    command::Command,
};

/// Runs one command to completion (or until `timeout`), merging stdout and
/// stderr into one buffer in the order the bytes arrive.
pub(super) async fn capture(command: &Command, timeout: Option<Duration>, workdir: Option<&Path>) -> CommandResult {
    log::debug!("CMD ->> {command}");

    let words = match command.program_args() {
        Ok(words) => words,
        Err(err) => {
            return CommandResult::new(command.clone(), Vec::new(), CommandStatus::InvalidCommand {
                reason: err.to_string(),
            });
        }
    };

    let mut process = tokio::process::Command::new(&words[0]);
    process
        .args(&words[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = workdir {
        process.current_dir(dir);
    }
    // Own process group, so a timeout also reaches whatever the command started.
    #[cfg(unix)]
    if timeout.is_some() {
        process.process_group(0);
    }

    let mut child = match process.spawn() {
        Ok(child) => child,
        Err(err) => {
            return CommandResult::new(command.clone(), Vec::new(), CommandStatus::LaunchFailed {
                reason: err.to_string(),
            });
        }
    };

    let pid = child.id();
    let (Some(mut stdout), Some(mut stderr)) = (child.stdout.take(), child.stderr.take()) else {
        return CommandResult::new(command.clone(), Vec::new(), CommandStatus::LaunchFailed {
            reason: "output pipes were not created".to_string(),
        });
    };

    let mut output = Vec::new();
    let waited = {
        let finished = async {
            drain(&mut stdout, &mut stderr, &mut output).await?;
            child.wait().await
        };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, finished).await.ok(),
            None => Some(finished.await),
        }
    };

    let status = match waited {
        Some(Ok(status)) => CommandStatus::Exited { code: status.code() },
        Some(Err(err)) => CommandStatus::Io {
            reason: err.to_string(),
        },
        None => {
            #[cfg(unix)]
            if let Some(pid) = pid {
                kill_group(pid);
            }
            if let Err(err) = child.kill().await {
                log::warn!("failed to kill timed out command '{command}': {err}");
            }
            CommandStatus::TimedOut {
                seconds: timeout.map(|limit| limit.as_secs_f64()).unwrap_or_default(),
            }
        }
    };

    CommandResult::new(command.clone(), output, status)
}

#[cfg(unix)]
fn kill_group(pid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: plain syscall, `pgid` is the group created for this child.
    if unsafe { libc::kill(-pgid, libc::SIGKILL) } != 0 {
        log::debug!("killing process group {pgid}: {}", io::Error::last_os_error());
    }
}

async fn drain(stdout: &mut ChildStdout, stderr: &mut ChildStderr, combined: &mut Vec<u8>) -> io::Result<()> {
    let mut out_buf = [0u8; 8192];
    let mut err_buf = [0u8; 8192];
    let mut out_open = true;
    let mut err_open = true;

    while out_open || err_open {
        tokio::select! {
            read = stdout.read(&mut out_buf), if out_open => {
                match read? {
                    0 => out_open = false,
                    n => combined.extend_from_slice(&out_buf[..n]),
                }
            }
            read = stderr.read(&mut err_buf), if err_open => {
                match read? {
                    0 => err_open = false,
                    n => combined.extend_from_slice(&err_buf[..n]),
                }
            }
        }
    }

    Ok(())
}
