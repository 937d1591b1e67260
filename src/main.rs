mod cli;
mod commands;
mod config;
mod paths;
mod ui;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Command, StateCommand};
use std::io;

/// Global context for the application
pub struct Context {
    pub verbose: u8,
    pub quiet: bool,
    pub workdir: Option<String>,
}

fn main() {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if cli.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .format_timestamp(None)
        .init();

    let ctx = Context {
        verbose: cli.verbose,
        quiet: cli.quiet,
        workdir: cli.workdir.clone(),
    };

    match run(&ctx, cli.command) {
        Ok(0) => {}
        Ok(code) => std::process::exit(code),
        Err(err) => {
            ui::error(&format!("{err:#}"));
            if let Some(e) = err.downcast_ref::<reconcile::Error>() {
                ui::dim(e.category().advice());
            }
            std::process::exit(1);
        }
    }
}

/// Dispatch a command and return the process exit code.
fn run(ctx: &Context, command: Command) -> Result<i32> {
    match command {
        Command::Plan(args) => {
            let detailed = args.detailed_exitcode;
            let has_changes = commands::plan::run(ctx, &args)?;
            Ok(if detailed && has_changes { 2 } else { 0 })
        }
        Command::Show { plan, json } => commands::plan::show(ctx, &plan, json).map(|()| 0),
        Command::Verify { plan, config } => {
            commands::plan::verify(ctx, &plan, &config.configs).map(|()| 0)
        }
        Command::Status(args) => commands::state::status(ctx, &args.configs).map(|()| 0),
        Command::State(cmd) => {
            match cmd {
                StateCommand::List => commands::state::list(ctx)?,
                StateCommand::Show { name } => commands::state::show(ctx, &name)?,
                StateCommand::Rm { name, yes } => commands::state::rm(ctx, &name, yes)?,
            }
            Ok(0)
        }
        Command::Unlock { force } => commands::state::unlock(ctx, force).map(|()| 0),
        Command::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "converge", &mut io::stdout());
            Ok(0)
        }
    }
}
