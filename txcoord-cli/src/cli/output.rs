// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Formatting of log records and reports for CLI output

use chrono::{DateTime, Utc};
use colored::*;
use comfy_table::{presets::UTF8_FULL, Cell, Color, Table};
use txcoord::{CoordinatorStatistics, LogPhase, TransactionLogRecord};

use super::commands::OutputFormat;

/// Formatter for transaction log records
pub struct LogFormatter;

impl LogFormatter {
    pub fn format(records: &[TransactionLogRecord], title: &str, format: OutputFormat) -> String {
        match format {
            OutputFormat::Table => Self::format_table(records, title),
            OutputFormat::Json => Self::format_json(records),
        }
    }

    fn format_table(records: &[TransactionLogRecord], title: &str) -> String {
        if records.is_empty() {
            return format!("{}\n", "No records found".yellow());
        }

        let mut output = String::new();
        output.push_str(&format!("{}\n", title.bold().green()));
        output.push_str(&format!("Records: {}\n\n", records.len()));

        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(
            ["Position", "Transaction", "Phase", "Logged at", "Participants"]
                .into_iter()
                .map(|col| Cell::new(col).fg(Color::Green))
                .collect::<Vec<_>>(),
        );

        for record in records {
            table.add_row(vec![
                Cell::new(record.position),
                Cell::new(record.transaction_id),
                Cell::new(record.phase).fg(Self::phase_color(record.phase)),
                Cell::new(Self::timestamp(record)),
                Cell::new(record.participants.join(", ")),
            ]);
        }

        output.push_str(&table.to_string());
        output.push('\n');
        output
    }

    fn format_json(records: &[TransactionLogRecord]) -> String {
        let json = serde_json::json!({
            "records": records.iter().map(|record| serde_json::json!({
                "position": record.position,
                "transaction_id": record.transaction_id.to_string(),
                "phase": record.phase.as_str(),
                "logged_at": Self::timestamp(record),
                "participants": record.participants,
            })).collect::<Vec<_>>(),
            "count": records.len(),
        });

        serde_json::to_string_pretty(&json).unwrap_or_else(|_| {
            "{\"status\": \"error\", \"error\": \"Could not serialize records to JSON\"}".to_string()
        })
    }

    /// Outcome counts of a finished demo run
    pub fn format_statistics(stats: &CoordinatorStatistics) -> String {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(vec![
            Cell::new("Outcome").fg(Color::Green),
            Cell::new("Transactions").fg(Color::Green),
        ]);
        table.add_row(vec![Cell::new("committed"), Cell::new(stats.committed_transactions)]);
        table.add_row(vec![
            Cell::new("rolled back"),
            Cell::new(stats.rolled_back_transactions),
        ]);
        table.add_row(vec![
            Cell::new("heuristic").fg(Color::Red),
            Cell::new(stats.heuristic_transactions),
        ]);
        table.add_row(vec![Cell::new("open"), Cell::new(stats.active_transactions + stats.completing_transactions)]);
        format!("{}\n", table)
    }

    fn timestamp(record: &TransactionLogRecord) -> String {
        DateTime::<Utc>::from(record.timestamp)
            .format("%Y-%m-%d %H:%M:%S%.3f")
            .to_string()
    }

    fn phase_color(phase: LogPhase) -> Color {
        match phase {
            LogPhase::Committed => Color::Green,
            LogPhase::RolledBack | LogPhase::Forgotten => Color::Grey,
            LogPhase::HeuristicMixed | LogPhase::HeuristicHazard => Color::Red,
            _ => Color::Yellow,
        }
    }
}
