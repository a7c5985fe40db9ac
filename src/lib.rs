//! Bounded parallel task execution and sequential command batches.
//!
//! [`runner::TaskRunner`] maps a function over a finite list of inputs, either
//! in the calling thread or on a fixed-size pool of worker threads, and hands
//! the results back lazily, in input order or in completion order.
//!
//! [`batch::CommandBatch`] runs external commands one after another, captures
//! their combined output and folds the outcome into a single success flag.

pub mod batch;
pub mod cli;
pub mod command;
pub mod progress;
pub mod runner;

pub use batch::{execute_all, BatchOutcome, CommandBatch, CommandResult, CommandStatus};
pub use command::Command;
pub use runner::{isolated, run, PoolError, RunOptions, TaskError, TaskRun, TaskRunner};
