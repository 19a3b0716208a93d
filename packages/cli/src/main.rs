//! jobq - operator CLI for the priority job queue.
//!
//! Runs bounded worker loops, the supervised worker pool and the monitoring
//! API against a shared SurrealDB store.

mod cli;
mod commands;
mod config;
mod logging;
mod processors;

use std::process::ExitCode;

use clap::Parser;

use cli::{Cli, Command};
use commands::Context;
use config::AppConfig;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match AppConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    logging::init(cli.verbose, &config.log.level);

    let pool_command = matches!(cli.command, Command::Start(_) | Command::Restart(_));
    if config.store.is_in_process() && !pool_command {
        tracing::warn!(
            "Store endpoint {} is private to this process; set store.endpoint to share jobs",
            config.store.endpoint
        );
    }

    let ctx = match Context::open(config).await {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("Failed to open store: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Command::Run(args) => commands::run(&ctx, args, cli.verbose).await,
        Command::Stats { json } => commands::stats(&ctx, json).await,
        Command::Dlq { limit } => commands::dlq(&ctx, limit).await,
        Command::Start(args) => commands::start(&ctx, args).await,
        Command::Stop => commands::stop(&ctx).await,
        Command::Restart(args) => commands::restart(&ctx, args).await,
        Command::Status { json } => commands::status(&ctx, json).await,
        Command::Enqueue(args) => commands::enqueue(&ctx, args).await,
        Command::Serve { bind } => commands::serve(&ctx, bind).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
