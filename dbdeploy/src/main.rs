use std::process::ExitCode;

use clap::Parser;

mod args;
mod commands;

use args::{Cli, Command};

/// Exit status of any failure, including invalid arguments.
const FAILURE: u8 = 255;

fn init_logging(verbose: bool) {
    let env = env_logger::Env::default().default_filter_or("warn");
    let mut builder = env_logger::Builder::from_env(env);
    if verbose {
        builder.filter_level(log::LevelFilter::Trace);
    }
    builder.init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(FAILURE)
            } else {
                ExitCode::SUCCESS
            };
        }
    };
    init_logging(cli.verbose);

    let result = match cli.command {
        Command::Deploy(args) => commands::deploy(args).await,
        Command::History(command) => commands::history(command).await,
        Command::Shard(command) => commands::shard(command).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e:#}");
            eprintln!("Error: {e:#}");
            ExitCode::from(FAILURE)
        }
    }
}
