//! Command-line entry point for dotstate.

use anyhow::Result;
use clap::Parser;

use dotstate::cli::{Cli, Command};
use dotstate::commands::{self, CommandSetup};
use dotstate::logging;

fn main() -> Result<()> {
    let _ = enable_ansi_support::enable_ansi_support();
    let args = Cli::parse();
    logging::init_subscriber(args.verbose, args.command.name());

    let mut out = std::io::stdout().lock();
    match &args.command {
        Command::Version => commands::version::run(&mut out),
        Command::Completion(opts) => commands::completion::run(opts, &mut out),
        command => {
            let setup = CommandSetup::init(&args.global)?;
            match command {
                Command::Apply(targets) => commands::apply::run(&setup, targets),
                Command::Status(targets) => commands::status::run(&setup, targets, &mut out),
                Command::Managed => commands::managed::run(&setup, &mut out),
                Command::Dump(targets) => commands::dump::run(&setup, targets, &mut out),
                Command::Archive(opts) => commands::archive::run(&setup, opts),
                Command::State(state) => commands::state::run(&setup, state, &mut out),
                Command::Version | Command::Completion(_) => Ok(()),
            }
        }
    }
}
