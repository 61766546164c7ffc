// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! txcoord CLI entry point

use clap::Parser;
use colored::Colorize;

mod cli;
use cli::{Cli, Commands};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        log::LevelFilter::Debug
    } else if let Some(level) = cli.log_level {
        level.to_level_filter()
    } else {
        // RUST_LOG can still raise it
        log::LevelFilter::Warn
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    match cli.command {
        Commands::Version => {
            println!("{} {}", "txcoord".bold().green(), txcoord::VERSION);
            println!("Two-phase commit transaction coordinator");
            Ok(())
        }

        Commands::Inspect {
            log_dir,
            transaction,
            format,
        } => cli::handle_inspect(log_dir, transaction, format),

        Commands::InDoubt { log_dir, format } => cli::handle_in_doubt(log_dir, format),

        Commands::Forget {
            log_dir,
            transaction,
            yes,
        } => cli::handle_forget(log_dir, transaction, yes),

        Commands::Checkpoint { log_dir } => cli::handle_checkpoint(log_dir),

        Commands::Demo {
            log_dir,
            transactions,
            participants,
            abort_rate,
        } => cli::handle_demo(log_dir, transactions, participants, abort_rate),
    }
}
