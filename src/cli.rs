use std::{convert::Infallible, io::BufRead, path::PathBuf, time::Duration};

use anyhow::anyhow;
use clap::{Args, Parser, ValueEnum};
use colored::Colorize;
use handlebars::Handlebars;
use serde_json::json;

use crate::{
    batch::{BatchOptions, BatchOutcome, CommandBatch, CommandResult},
    command::{Command, CommandInstantiationError},
    runner::TaskRunner,
};

pub mod threads_config;

use threads_config::ThreadsConfig;

/// Run external commands in order, or once per input on a pool of workers.
///
/// `exec` runs a batch of commands one after another and keeps going when one
/// of them fails.
/// `each` renders a command template for every input and runs the resulting
/// commands in parallel.
#[derive(Parser, Debug)]
#[clap(name = "birb-pool", styles = cli_styles::CLAP_STYLES, verbatim_doc_comment)]
pub enum Cli {
    Exec(Exec),
    Each(Each),
}

/// Run commands one after another
#[derive(Parser, Debug)]
pub struct Exec {
    /// Commands to run, in order
    #[clap(required = true)]
    commands: Vec<String>,

    #[clap(flatten)]
    batch: BatchArgs,

    /// Output format
    #[clap(short, long, value_enum)]
    format: Option<OutputFormat>,
}

/// Run a command template once per input
///
/// The template is rendered with `{{input}}` and `{{index}}`. Inputs are read
/// from standard input, one per line, when none are given.
#[derive(Parser, Debug)]
#[clap(verbatim_doc_comment)]
pub struct Each {
    template: String,

    inputs: Vec<String>,

    /// Number of workers: `cpu`, `physical` or a number
    #[clap(short, long, default_value_t)]
    jobs: ThreadsConfig,

    /// Report results in input order
    #[clap(long)]
    ordered: bool,

    /// Do not show a progress bar
    #[clap(short, long)]
    quiet: bool,

    /// Progress bar label, defaults to the template
    #[clap(long)]
    label: Option<String>,

    #[clap(flatten)]
    batch: BatchArgs,

    /// Output format
    #[clap(short, long, value_enum)]
    format: Option<OutputFormat>,
}

#[derive(Args, Debug, Clone)]
pub struct BatchArgs {
    /// Run commands through `sh -c` instead of launching them directly
    #[clap(long)]
    shell: bool,

    /// Append every command and its output to this file
    #[clap(long)]
    log: Option<PathBuf>,

    /// Per-command timeout in seconds
    #[clap(long, value_parser = parse_timeout)]
    timeout: Option<Duration>,
}

impl BatchArgs {
    fn command(&self, line: &str) -> Command {
        if self.shell {
            Command::shell(line)
        } else {
            Command::argv(line)
        }
    }

    fn options(&self) -> BatchOptions {
        BatchOptions {
            log_path: self.log.clone(),
            timeout: self.timeout,
            workdir: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(ValueEnum)]
pub enum OutputFormat {
    Json,
}

fn parse_timeout(value: &str) -> Result<Duration, String> {
    let seconds: f64 = value.parse().map_err(|e| format!("{e}"))?;
    Duration::try_from_secs_f64(seconds).map_err(|e| format!("{e}"))
}

/// Returns whether every command succeeded.
pub fn main(args: &Cli) -> anyhow::Result<bool> {
    match args {
        Cli::Exec(args) => exec(args),
        Cli::Each(args) => each(args),
    }
}

fn exec(args: &Exec) -> anyhow::Result<bool> {
    let commands: Vec<Command> = args.commands.iter().map(|line| args.batch.command(line)).collect();
    let outcome = CommandBatch::new(commands)
        .with_options(args.batch.options())
        .execute();

    match args.format {
        Some(OutputFormat::Json) => println!("{}", serde_json::to_string_pretty(&outcome)?),
        None => outcome.results.iter().for_each(print_result),
    }

    if let Some(path) = &args.batch.log {
        outcome.append_log(path)?;
    }
    Ok(outcome.succeeded())
}

fn each(args: &Each) -> anyhow::Result<bool> {
    let inputs = if args.inputs.is_empty() {
        read_inputs(std::io::stdin().lock())?
    } else {
        args.inputs.clone()
    };
    let commands = render_commands(&args.batch.command(&args.template), &inputs)?;

    let mut runner = TaskRunner::new()
        .workers(args.jobs.get_num_threads())
        .ordered(args.ordered);
    if !args.quiet {
        runner = runner.progress(args.label.clone().unwrap_or_else(|| args.template.clone()));
    }

    let options = BatchOptions {
        log_path: None,
        ..args.batch.options()
    };
    let mut run = runner.run(
        move |command: &Command| {
            let mut outcome = CommandBatch::new(command.clone())
                .with_options(options.clone())
                .execute();
            Ok::<_, Infallible>(outcome.results.remove(0))
        },
        commands,
    )?;

    let mut results = Vec::new();
    while let Some(result) = run.next() {
        let result = result.map_err(|err| anyhow!("{err}"))?;
        if args.format.is_none() {
            run.suspend(|| print_result(&result));
        }
        results.push(result);
    }

    let outcome = BatchOutcome { results };
    if let Some(OutputFormat::Json) = args.format {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    }
    if let Some(path) = &args.batch.log {
        outcome.append_log(path)?;
    }
    Ok(outcome.succeeded())
}

fn read_inputs(reader: impl BufRead) -> std::io::Result<Vec<String>> {
    let mut inputs = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if !line.trim().is_empty() {
            inputs.push(line);
        }
    }
    Ok(inputs)
}

fn render_commands(template: &Command, inputs: &[String]) -> Result<Vec<Command>, CommandInstantiationError> {
    let mut handlebars = Handlebars::new();
    handlebars.register_escape_fn(handlebars::no_escape);
    handlebars.set_strict_mode(true);
    inputs
        .iter()
        .enumerate()
        .map(|(index, input)| template.instantiate(&mut handlebars, json!({ "input": input, "index": index })))
        .collect()
}

fn print_result(result: &CommandResult) {
    let status = if result.succeeded {
        "ok".green().bold()
    } else {
        result.status.to_string().red().bold()
    };
    println!("    {}\t{status}", result.command.line().bold().cyan());
    for line in result.output.lines() {
        println!("       | {line}");
    }
}
