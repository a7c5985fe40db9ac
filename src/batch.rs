//! Sequential execution of external commands.
//!
//! Commands run strictly one after another. A failing command never stops the
//! batch: its output is kept, the batch is marked failed and the next command
//! starts. Nothing here returns an error for a failed command, callers look at
//! the returned flag or at [`BatchOutcome`].

use std::{
    fmt::Display,
    fs::OpenOptions,
    io::{self, Write},
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use serde::Serialize;

use crate::command::Command;

mod capture;

/// Commands to run, in order. Built from a single line or from a sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Commands(pub Vec<Command>);

impl From<Command> for Commands {
    fn from(command: Command) -> Self {
        Commands(vec![command])
    }
}

impl From<&str> for Commands {
    fn from(line: &str) -> Self {
        Commands(vec![line.into()])
    }
}

impl From<String> for Commands {
    fn from(line: String) -> Self {
        Commands(vec![line.into()])
    }
}

impl<T: Into<Command>> From<Vec<T>> for Commands {
    fn from(commands: Vec<T>) -> Self {
        Commands(commands.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Command>, const N: usize> From<[T; N]> for Commands {
    fn from(commands: [T; N]) -> Self {
        Commands(commands.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Command> + Clone> From<&[T]> for Commands {
    fn from(commands: &[T]) -> Self {
        Commands(commands.iter().cloned().map(Into::into).collect())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOptions {
    /// Append every command and its output here once the batch is done.
    pub log_path: Option<PathBuf>,
    /// Per-command limit; `None` or zero means no limit.
    pub timeout: Option<Duration>,
    /// Working directory for every command; defaults to the current one.
    pub workdir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommandStatus {
    /// The process ran to completion; `code` is `None` when a signal ended it.
    Exited { code: Option<i32> },
    TimedOut { seconds: f64 },
    LaunchFailed { reason: String },
    InvalidCommand { reason: String },
    /// Reading the output or waiting for the process failed.
    Io { reason: String },
}

impl CommandStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, CommandStatus::Exited { code: Some(0) })
    }
}

impl Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandStatus::Exited { code: Some(code) } => write!(f, "exited with status {code}"),
            CommandStatus::Exited { code: None } => write!(f, "terminated by signal"),
            CommandStatus::TimedOut { seconds } => write!(f, "timed out after {seconds}s"),
            CommandStatus::LaunchFailed { reason } => write!(f, "failed to launch: {reason}"),
            CommandStatus::InvalidCommand { reason } => write!(f, "invalid command: {reason}"),
            CommandStatus::Io { reason } => write!(f, "I/O error: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandResult {
    pub command: Command,
    /// Combined stdout and stderr. Never empty for a failed command.
    pub output: String,
    pub succeeded: bool,
    pub status: CommandStatus,
}

impl CommandResult {
    pub(crate) fn new(command: Command, output: Vec<u8>, status: CommandStatus) -> Self {
        let mut output = String::from_utf8_lossy(&output).into_owned();
        let succeeded = status.is_success();
        let timed_out = matches!(status, CommandStatus::TimedOut { .. });
        if timed_out || (!succeeded && output.is_empty()) {
            if !output.is_empty() && !output.ends_with('\n') {
                output.push('\n');
            }
            output.push_str(&format!("[{status}]\n"));
        }
        Self {
            command,
            output,
            succeeded,
            status,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("Failed to append command log to {path}: {source}")]
    Log {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchOutcome {
    pub results: Vec<CommandResult>,
}

impl BatchOutcome {
    /// `true` iff every command succeeded (an empty batch succeeds).
    pub fn succeeded(&self) -> bool {
        self.results.iter().all(|result| result.succeeded)
    }

    pub fn failures(&self) -> impl Iterator<Item = &CommandResult> {
        self.results.iter().filter(|result| !result.succeeded)
    }

    /// Each command line followed by its output, all joined with newlines.
    pub fn log_text(&self) -> String {
        self.results
            .iter()
            .flat_map(|result| [result.command.line(), result.output.as_str()])
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Appends [`Self::log_text`] to `path`, creating the file if needed.
    /// Nothing is written for an empty batch.
    pub fn append_log(&self, path: impl AsRef<Path>) -> Result<(), BatchError> {
        if self.results.is_empty() {
            return Ok(());
        }
        let path = path.as_ref();
        let to_err = |source| BatchError::Log {
            path: path.to_path_buf(),
            source,
        };
        let mut file = OpenOptions::new().create(true).append(true).open(path).map_err(to_err)?;
        file.write_all(self.log_text().as_bytes()).map_err(to_err)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandBatch {
    commands: Vec<Command>,
    options: BatchOptions,
}

impl CommandBatch {
    pub fn new(commands: impl Into<Commands>) -> Self {
        Self {
            commands: commands.into().0,
            options: BatchOptions::default(),
        }
    }

    pub fn with_options(mut self, options: BatchOptions) -> Self {
        self.options = options;
        self
    }

    pub fn log_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.log_path = Some(path.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    pub fn workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.options.workdir = Some(dir.into());
        self
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Runs every command in order and collects the results.
    ///
    /// Does not touch the log; see [`Self::run`] and [`BatchOutcome::append_log`].
    pub fn execute(&self) -> BatchOutcome {
        let timeout = self.options.timeout.filter(|limit| !limit.is_zero());
        let workdir = self.options.workdir.as_deref();

        let results = block_on(move || async move {
            let mut results = Vec::with_capacity(self.commands.len());
            for command in &self.commands {
                let result = capture::capture(command, timeout, workdir).await;
                if !result.succeeded {
                    log::warn!("command '{command}' failed: {}", result.status);
                }
                results.push(result);
            }
            results
        });

        let results = match results {
            Ok(results) => results,
            Err(err) => {
                log::error!("failed to start the process runtime: {err}");
                let reason = format!("process runtime unavailable: {err}");
                self.commands
                    .iter()
                    .map(|command| {
                        CommandResult::new(command.clone(), Vec::new(), CommandStatus::LaunchFailed {
                            reason: reason.clone(),
                        })
                    })
                    .collect()
            }
        };

        BatchOutcome { results }
    }

    /// Executes the batch, appends to the log if one is configured and
    /// returns whether everything succeeded.
    ///
    /// A log that cannot be written is reported through `log` and makes the
    /// call return `false`.
    pub fn run(&self) -> bool {
        let outcome = self.execute();
        let mut succeeded = outcome.succeeded();
        if let Some(path) = &self.options.log_path {
            if let Err(err) = outcome.append_log(path) {
                log::error!("{err}");
                succeeded = false;
            }
        }
        succeeded
    }
}

/// Drives the future built by `make` on a private current-thread runtime.
///
/// A runtime cannot be started from inside another one, so when the caller is
/// already on a tokio runtime the work moves to a scoped helper thread.
fn block_on<T, Fut>(make: impl FnOnce() -> Fut + Send) -> io::Result<T>
where
    T: Send,
    Fut: Future<Output = T>,
{
    let drive = move || -> io::Result<T> {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        Ok(runtime.block_on(make()))
    };

    if tokio::runtime::Handle::try_current().is_err() {
        return drive();
    }
    thread::scope(|scope| {
        scope
            .spawn(drive)
            .join()
            .unwrap_or_else(|_| Err(io::Error::other("process thread panicked")))
    })
}

/// Runs `commands` one after another and reports whether all of them succeeded.
pub fn execute_all(commands: impl Into<Commands>, log_path: Option<&Path>, timeout: Option<Duration>) -> bool {
    let options = BatchOptions {
        log_path: log_path.map(Path::to_path_buf),
        timeout,
        workdir: None,
    };
    CommandBatch::new(commands).with_options(options).run()
}
