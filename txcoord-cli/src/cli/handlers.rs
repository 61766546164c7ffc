// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Command handlers

use colored::*;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use txcoord::testing::MockResource;
use txcoord::{
    CoordinatorConfig, CoordinatorError, LogPhase, ResourceManager, TransactionCoordinator,
    TransactionId, TransactionLog, TransactionLogRecord, Vote,
};

use super::commands::OutputFormat;
use super::output::LogFormatter;

type CliResult = Result<(), Box<dyn std::error::Error>>;

pub fn handle_inspect(log_dir: PathBuf, transaction: Option<String>, format: OutputFormat) -> CliResult {
    let filter = transaction
        .map(|id| id.parse::<TransactionId>())
        .transpose()?;

    let records: Vec<TransactionLogRecord> = TransactionLog::read_dir(&log_dir)?
        .into_iter()
        .filter(|record| filter.map_or(true, |id| record.transaction_id == id))
        .collect();

    print!("{}", LogFormatter::format(&records, "Transaction Log", format));
    Ok(())
}

pub fn handle_in_doubt(log_dir: PathBuf, format: OutputFormat) -> CliResult {
    let records = open_records(&log_dir)?;
    print!("{}", LogFormatter::format(&records, "In-Doubt Transactions", format));
    Ok(())
}

pub fn handle_forget(log_dir: PathBuf, transaction: String, yes: bool) -> CliResult {
    let id: TransactionId = transaction.parse()?;
    let latest = TransactionLog::latest_by_transaction(TransactionLog::read_dir(&log_dir)?);

    let record = match latest.get(&id) {
        Some(record) => record,
        None => return Err(CoordinatorError::NotFound(id).into()),
    };
    if record.phase.is_closed() {
        return Err(format!("Transaction {} is already {}", id, record.phase).into());
    }

    if !yes {
        println!(
            "Transaction {} was last logged as {} with participants [{}].",
            id,
            record.phase.to_string().yellow(),
            record.participants.join(", ")
        );
        println!("Forgetting it tells recovery the participants were resolved by hand.");
        if !confirm("Forget this transaction?")? {
            println!("{}", "Aborted".yellow());
            return Ok(());
        }
    }

    let log = TransactionLog::open(&log_dir, CoordinatorConfig::default().max_segment_size)?;
    log.append(id, LogPhase::Forgotten, &record.participants)?;
    println!("{}", format!("✅ Transaction {} forgotten", id).green());
    Ok(())
}

pub fn handle_checkpoint(log_dir: PathBuf) -> CliResult {
    let log = TransactionLog::open(&log_dir, CoordinatorConfig::default().max_segment_size)?;
    let compaction = log.checkpoint()?;
    println!(
        "{}",
        format!(
            "✅ Checkpoint complete: {} records retained, {} segments removed",
            compaction.records_retained, compaction.segments_removed
        )
        .green()
    );
    Ok(())
}

pub fn handle_demo(
    log_dir: Option<PathBuf>,
    transactions: usize,
    participants: usize,
    abort_rate: f64,
) -> CliResult {
    if participants == 0 {
        return Err("participants must be at least 1".into());
    }
    if !(0.0..=1.0).contains(&abort_rate) {
        return Err("abort-rate must be between 0 and 1".into());
    }

    let log_dir = log_dir.unwrap_or_else(|| {
        std::env::temp_dir().join(format!("txcoord-demo-{}", uuid::Uuid::new_v4()))
    });

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run_demo(&log_dir, transactions, participants, abort_rate))?;

    println!("Log written to {}", log_dir.display());
    Ok(())
}

async fn run_demo(
    log_dir: &Path,
    transactions: usize,
    participants: usize,
    abort_rate: f64,
) -> Result<(), CoordinatorError> {
    let resources: Vec<Arc<MockResource>> = (0..participants)
        .map(|i| Arc::new(MockResource::new(format!("rm{}", i))))
        .collect();
    let registered: Vec<Arc<dyn ResourceManager>> = resources
        .iter()
        .map(|resource| {
            let resource: Arc<dyn ResourceManager> = resource.clone();
            resource
        })
        .collect();

    let coordinator = TransactionCoordinator::start(CoordinatorConfig::new(log_dir), registered).await?;
    if !coordinator.recovery_report().is_clean() {
        println!("{}", "Recovered transactions from an earlier run".yellow());
    }

    for _ in 0..transactions {
        let txn = coordinator.begin(None)?;
        for (i, resource) in resources.iter().enumerate() {
            let participant: Arc<dyn ResourceManager> = if fastrand::f64() < abort_rate {
                Arc::new(MockResource::new(format!("rm{}", i)).with_vote(Vote::Abort))
            } else {
                resource.clone()
            };
            txn.enlist(participant).await?;
        }

        match txn.commit().await {
            Ok(()) => log::info!("Transaction {} committed", txn.id()),
            Err(CoordinatorError::RolledBack { id, cause }) => {
                log::info!("Transaction {} rolled back: {}", id, cause)
            }
            Err(e) => println!("{}", format!("Transaction {} failed: {}", txn.id(), e).red()),
        }
    }

    print!("{}", LogFormatter::format_statistics(&coordinator.statistics()));
    coordinator.shutdown().await;
    Ok(())
}

/// Transactions whose last record is not closed, oldest first
fn open_records(log_dir: &Path) -> Result<Vec<TransactionLogRecord>, Box<dyn std::error::Error>> {
    let latest = TransactionLog::latest_by_transaction(TransactionLog::read_dir(log_dir)?);
    let mut open: Vec<TransactionLogRecord> = latest
        .into_values()
        .filter(|record| !record.phase.is_closed())
        .collect();
    open.sort_by_key(|record| record.position);
    Ok(open)
}

fn confirm(prompt: &str) -> Result<bool, std::io::Error> {
    print!("{} [y/N] ", prompt);
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}
