use std::process::ExitCode;

use birb_pool::cli::Cli;
use clap::Parser;
use colored::Colorize;

fn main() -> ExitCode {
    env_logger::init();

    let args = Cli::parse();

    match birb_pool::cli::main(&args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("{} {err:#}", "error:".red().bold());
            ExitCode::from(2)
        }
    }
}
