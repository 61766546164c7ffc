// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Command-line argument definitions

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// txcoord: two-phase commit transaction coordinator tools
#[derive(Parser, Debug)]
#[command(name = "txcoord")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (overrides RUST_LOG)
    #[arg(long = "log-level", value_enum, global = true)]
    pub log_level: Option<LogLevel>,

    /// Shorthand for --log-level debug
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print version information
    Version,

    /// List the records in a transaction log
    Inspect {
        /// Log directory
        #[arg(short = 'l', long = "log-dir", default_value = "txlog")]
        log_dir: PathBuf,

        /// Only show records of this transaction
        #[arg(short = 't', long = "transaction")]
        transaction: Option<String>,

        #[arg(short = 'f', long = "format", value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },

    /// List transactions whose last record is not a completion
    InDoubt {
        #[arg(short = 'l', long = "log-dir", default_value = "txlog")]
        log_dir: PathBuf,

        #[arg(short = 'f', long = "format", value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },

    /// Mark an in-doubt or heuristic transaction as resolved by hand
    ///
    /// The coordinator owning the log must be stopped.
    Forget {
        #[arg(short = 'l', long = "log-dir", default_value = "txlog")]
        log_dir: PathBuf,

        /// Transaction id
        transaction: String,

        /// Do not ask for confirmation
        #[arg(short = 'y', long = "yes")]
        yes: bool,
    },

    /// Compact a stopped coordinator's log
    Checkpoint {
        #[arg(short = 'l', long = "log-dir", default_value = "txlog")]
        log_dir: PathBuf,
    },

    /// Run a workload against in-memory resources
    Demo {
        /// Log directory (a temporary one when omitted)
        #[arg(short = 'l', long = "log-dir")]
        log_dir: Option<PathBuf>,

        #[arg(short = 'n', long = "transactions", default_value_t = 20)]
        transactions: usize,

        #[arg(short = 'p', long = "participants", default_value_t = 3)]
        participants: usize,

        /// Probability that a participant votes to abort
        #[arg(long = "abort-rate", default_value_t = 0.1)]
        abort_rate: f64,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_level_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}
