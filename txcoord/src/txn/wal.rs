// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Write-ahead transaction log with persistent storage
//!
//! Every phase transition of a two-phase commit is appended here, and made
//! durable, before the coordinator acts on it. The log is a directory of
//! numbered segment files written in a compact binary format; recovery reads
//! them back and uses the last record of each transaction.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

use super::state::{Outcome, TransactionId, TransactionStatus};

/// Magic number to identify log segments and records
const LOG_MAGIC: u32 = 0x54584C47;
/// Current log format version
const LOG_VERSION: u16 = 1;
/// Size of the segment header
const HEADER_SIZE: u64 = 64;
/// Smallest possible encoded record: a record with no participants
const MIN_RECORD_SIZE: usize = 4 + 1 + 16 + 8 + 8 + 2 + 4;

/// Phase recorded for a transaction
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogPhase {
    Preparing = 1,
    Prepared = 2,
    Committing = 3,
    RollingBack = 4,
    Committed = 5,
    RolledBack = 6,
    HeuristicMixed = 7,
    HeuristicHazard = 8,
    /// An operator reconciled a heuristic or in-doubt transaction
    Forgotten = 9,
}

impl LogPhase {
    fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => LogPhase::Preparing,
            2 => LogPhase::Prepared,
            3 => LogPhase::Committing,
            4 => LogPhase::RollingBack,
            5 => LogPhase::Committed,
            6 => LogPhase::RolledBack,
            7 => LogPhase::HeuristicMixed,
            8 => LogPhase::HeuristicHazard,
            9 => LogPhase::Forgotten,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogPhase::Preparing => "PREPARING",
            LogPhase::Prepared => "PREPARED",
            LogPhase::Committing => "COMMITTING",
            LogPhase::RollingBack => "ROLLING_BACK",
            LogPhase::Committed => "COMMITTED",
            LogPhase::RolledBack => "ROLLED_BACK",
            LogPhase::HeuristicMixed => "HEURISTIC_MIXED",
            LogPhase::HeuristicHazard => "HEURISTIC_HAZARD",
            LogPhase::Forgotten => "FORGOTTEN",
        }
    }

    /// Closed records need no further action and may be dropped by a checkpoint
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            LogPhase::Committed | LogPhase::RolledBack | LogPhase::Forgotten
        )
    }

    pub fn is_heuristic(&self) -> bool {
        matches!(self, LogPhase::HeuristicMixed | LogPhase::HeuristicHazard)
    }

    /// The durable decision a record of this phase implies, if any
    pub fn decided_outcome(&self) -> Option<Outcome> {
        match self {
            LogPhase::Committing | LogPhase::Committed => Some(Outcome::Commit),
            LogPhase::RollingBack | LogPhase::RolledBack => Some(Outcome::Rollback),
            _ => None,
        }
    }

    /// Log phase written when a transaction reaches `status`
    pub fn for_status(status: TransactionStatus) -> Option<Self> {
        match status {
            TransactionStatus::Active => None,
            TransactionStatus::Preparing => Some(LogPhase::Preparing),
            TransactionStatus::Prepared => Some(LogPhase::Prepared),
            TransactionStatus::Committing => Some(LogPhase::Committing),
            TransactionStatus::Committed => Some(LogPhase::Committed),
            TransactionStatus::RollingBack => Some(LogPhase::RollingBack),
            TransactionStatus::RolledBack => Some(LogPhase::RolledBack),
            TransactionStatus::HeuristicMixed => Some(LogPhase::HeuristicMixed),
            TransactionStatus::HeuristicHazard => Some(LogPhase::HeuristicHazard),
        }
    }
}

impl std::fmt::Display for LogPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single phase record
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionLogRecord {
    pub transaction_id: TransactionId,
    pub phase: LogPhase,
    /// Resource ids in enlistment order
    pub participants: Vec<String>,
    pub timestamp: SystemTime,
    /// Monotonic position across all segments
    pub position: u64,
}

impl TransactionLogRecord {
    /// Serialize the record to its binary form
    ///
    /// Binary Format:
    /// - Magic (4 bytes): LOG_MAGIC
    /// - Phase (1 byte): LogPhase
    /// - Transaction ID (16 bytes)
    /// - Position (8 bytes): u64
    /// - Timestamp (8 bytes): u64 (nanos since UNIX_EPOCH)
    /// - Participant count (2 bytes): u16
    /// - Participants: (length u16, UTF-8 bytes) each
    /// - Checksum (4 bytes): CRC32 of everything before it
    pub fn encode(&self) -> Result<Vec<u8>, LogError> {
        let mut buffer = Vec::with_capacity(MIN_RECORD_SIZE + self.participants.len() * 24);

        buffer.extend_from_slice(&LOG_MAGIC.to_le_bytes());
        buffer.push(self.phase as u8);
        buffer.extend_from_slice(self.transaction_id.as_bytes());
        buffer.extend_from_slice(&self.position.to_le_bytes());

        let timestamp_nanos = self
            .timestamp
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        buffer.extend_from_slice(&timestamp_nanos.to_le_bytes());

        let count = u16::try_from(self.participants.len()).map_err(|_| {
            LogError::RecordTooLarge(format!("{} participants", self.participants.len()))
        })?;
        buffer.extend_from_slice(&count.to_le_bytes());
        for participant in &self.participants {
            let bytes = participant.as_bytes();
            let len = u16::try_from(bytes.len()).map_err(|_| {
                LogError::RecordTooLarge(format!("resource id of {} bytes", bytes.len()))
            })?;
            buffer.extend_from_slice(&len.to_le_bytes());
            buffer.extend_from_slice(bytes);
        }

        let checksum = crc32fast::hash(&buffer);
        buffer.extend_from_slice(&checksum.to_le_bytes());

        Ok(buffer)
    }

    /// Decode one record from the front of `data`, returning it with its encoded size
    pub fn decode(data: &[u8]) -> Result<(Self, usize), LogError> {
        let mut cursor = Cursor { data, offset: 0 };

        if cursor.u32()? != LOG_MAGIC {
            return Err(LogError::Corrupted("Invalid magic number".to_string()));
        }

        let phase = LogPhase::from_u8(cursor.u8()?)
            .ok_or_else(|| LogError::Corrupted("Invalid phase".to_string()))?;

        let mut id_bytes = [0u8; 16];
        id_bytes.copy_from_slice(cursor.take(16)?);
        let transaction_id = TransactionId::from_bytes(id_bytes);

        let position = cursor.u64()?;
        let timestamp = UNIX_EPOCH + Duration::from_nanos(cursor.u64()?);

        let count = cursor.u16()? as usize;
        let mut participants = Vec::with_capacity(count);
        for _ in 0..count {
            let len = cursor.u16()? as usize;
            let participant = String::from_utf8(cursor.take(len)?.to_vec())
                .map_err(|_| LogError::Corrupted("Invalid UTF-8 in resource id".to_string()))?;
            participants.push(participant);
        }

        let body_len = cursor.offset;
        let expected_checksum = cursor.u32()?;
        if expected_checksum != crc32fast::hash(&data[..body_len]) {
            return Err(LogError::Corrupted("Checksum mismatch".to_string()));
        }

        Ok((
            Self {
                transaction_id,
                phase,
                participants,
                timestamp,
                position,
            },
            cursor.offset,
        ))
    }
}

/// Bounds-checked little endian reader over a record buffer
struct Cursor<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], LogError> {
        if self.offset + len > self.data.len() {
            return Err(LogError::Truncated);
        }
        let slice = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, LogError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, LogError> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> Result<u32, LogError> {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(bytes))
    }

    fn u64(&mut self) -> Result<u64, LogError> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(bytes))
    }
}

/// Outcome of a log compaction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogCompaction {
    pub records_retained: usize,
    pub segments_removed: usize,
}

/// Current segment writer state
#[derive(Debug)]
struct SegmentWriter {
    writer: Option<BufWriter<File>>,
    segment_number: u64,
    segment_size: u64,
    next_position: u64,
}

/// Durable, append-only transaction log
#[derive(Debug)]
pub struct TransactionLog {
    dir: PathBuf,
    max_segment_size: u64,
    state: Mutex<SegmentWriter>,
}

impl TransactionLog {
    /// Open (or create) the log in `dir` and start a fresh segment for appends
    pub fn open(dir: impl Into<PathBuf>, max_segment_size: u64) -> Result<Self, LogError> {
        let dir = dir.into();
        create_dir_all(&dir)
            .map_err(|e| LogError::Io(format!("Failed to create log directory: {}", e)))?;

        // Checkpoints drop closed records, so the header also carries the next position
        let mut max_segment = 0u64;
        let mut next_position = 1u64;
        for (number, path) in Self::segment_files(&dir)? {
            max_segment = max_segment.max(number);
            next_position = next_position.max(Self::header_next_position(&path)?);
            for record in Self::read_segment(&path)? {
                next_position = next_position.max(record.position.saturating_add(1));
            }
        }

        let log = Self {
            dir,
            max_segment_size,
            state: Mutex::new(SegmentWriter {
                writer: None,
                segment_number: max_segment,
                segment_size: 0,
                next_position,
            }),
        };

        let segment = {
            let mut state = log.state.lock();
            log.rotate(&mut state)?;
            state.segment_number
        };

        log::debug!(
            "Opened transaction log at {} (segment {}, next position {})",
            log.dir.display(),
            segment,
            next_position
        );

        Ok(log)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append a record and wait until it is on disk
    pub fn append(
        &self,
        transaction_id: TransactionId,
        phase: LogPhase,
        participants: &[String],
    ) -> Result<TransactionLogRecord, LogError> {
        let mut state = self.state.lock();

        let record = TransactionLogRecord {
            transaction_id,
            phase,
            participants: participants.to_vec(),
            timestamp: SystemTime::now(),
            position: state.next_position,
        };
        let encoded = record.encode()?;

        if state.segment_size + encoded.len() as u64 > self.max_segment_size {
            self.rotate(&mut state)?;
        }

        Self::write_durably(&mut state, &encoded)?;
        state.next_position += 1;

        log::trace!(
            "Logged {} for transaction {} at position {}",
            phase,
            transaction_id,
            record.position
        );

        Ok(record)
    }

    /// Read every record in position order
    pub fn read_all(&self) -> Result<Vec<TransactionLogRecord>, LogError> {
        // Holding the writer lock keeps a concurrent append from being read half written
        let _state = self.state.lock();
        Self::read_dir(&self.dir)
    }

    /// Last record of each transaction
    pub fn last_records(&self) -> Result<HashMap<TransactionId, TransactionLogRecord>, LogError> {
        Ok(Self::latest_by_transaction(self.read_all()?))
    }

    /// Read every record of a log directory without opening it for writing
    pub fn read_dir(dir: &Path) -> Result<Vec<TransactionLogRecord>, LogError> {
        let mut records = Vec::new();
        for (_, path) in Self::segment_files(dir)? {
            records.extend(Self::read_segment(&path)?);
        }
        records.sort_by_key(|record| record.position);
        Ok(records)
    }

    /// Reduce records to the last one per transaction
    pub fn latest_by_transaction(
        records: Vec<TransactionLogRecord>,
    ) -> HashMap<TransactionId, TransactionLogRecord> {
        let mut latest: HashMap<TransactionId, TransactionLogRecord> = HashMap::new();
        for record in records {
            match latest.get(&record.transaction_id) {
                Some(existing) if existing.position >= record.position => {}
                _ => {
                    latest.insert(record.transaction_id, record);
                }
            }
        }
        latest
    }

    /// Rewrite the log so only the last record of each open transaction survives
    ///
    /// Retained records keep their original positions. The new segment is
    /// synced before older segments are removed, so a crash in between only
    /// leaves duplicates behind.
    pub fn checkpoint(&self) -> Result<LogCompaction, LogError> {
        let mut state = self.state.lock();

        let old_segments = Self::segment_files(&self.dir)?;
        let mut records = Vec::new();
        for (_, path) in &old_segments {
            records.extend(Self::read_segment(path)?);
        }

        let mut open: Vec<TransactionLogRecord> = Self::latest_by_transaction(records)
            .into_values()
            .filter(|record| !record.phase.is_closed())
            .collect();
        open.sort_by_key(|record| record.position);

        self.rotate(&mut state)?;
        for record in &open {
            let encoded = record.encode()?;
            Self::write_durably(&mut state, &encoded)?;
        }

        let mut removed = 0;
        for (number, path) in old_segments {
            if number < state.segment_number {
                std::fs::remove_file(&path).map_err(|e| {
                    LogError::Io(format!("Failed to remove segment {}: {}", path.display(), e))
                })?;
                removed += 1;
            }
        }

        log::debug!(
            "Checkpointed transaction log: {} open records kept, {} segments removed",
            open.len(),
            removed
        );

        Ok(LogCompaction {
            records_retained: open.len(),
            segments_removed: removed,
        })
    }

    fn write_durably(state: &mut SegmentWriter, encoded: &[u8]) -> Result<(), LogError> {
        let writer = state
            .writer
            .as_mut()
            .ok_or_else(|| LogError::Io("No active log segment".to_string()))?;

        writer
            .write_all(encoded)
            .map_err(|e| LogError::Io(format!("Failed to write log record: {}", e)))?;
        writer
            .flush()
            .map_err(|e| LogError::Io(format!("Failed to flush log: {}", e)))?;
        writer
            .get_mut()
            .sync_data()
            .map_err(|e| LogError::Io(format!("Failed to sync log: {}", e)))?;

        state.segment_size += encoded.len() as u64;
        Ok(())
    }

    /// Close the current segment and start the next one
    fn rotate(&self, state: &mut SegmentWriter) -> Result<(), LogError> {
        if let Some(mut old_writer) = state.writer.take() {
            old_writer
                .flush()
                .map_err(|e| LogError::Io(format!("Failed to flush old segment: {}", e)))?;
            old_writer
                .get_mut()
                .sync_all()
                .map_err(|e| LogError::Io(format!("Failed to sync old segment: {}", e)))?;
        }

        state.segment_number += 1;
        let file_path = self.dir.join(Self::segment_name(state.segment_number));

        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&file_path)
            .map_err(|e| LogError::Io(format!("Failed to create log segment: {}", e)))?;

        let mut writer = BufWriter::new(file);
        let header = Self::segment_header(state.next_position);
        writer
            .write_all(&header)
            .map_err(|e| LogError::Io(format!("Failed to write segment header: {}", e)))?;
        writer
            .flush()
            .map_err(|e| LogError::Io(format!("Failed to flush segment header: {}", e)))?;
        writer
            .get_mut()
            .sync_all()
            .map_err(|e| LogError::Io(format!("Failed to sync segment header: {}", e)))?;

        state.writer = Some(writer);
        state.segment_size = header.len() as u64;
        Ok(())
    }

    /// Header layout: magic, version, creation time, next position, padding
    fn segment_header(next_position: u64) -> Vec<u8> {
        let mut header = Vec::with_capacity(HEADER_SIZE as usize);
        header.extend_from_slice(&LOG_MAGIC.to_le_bytes());
        header.extend_from_slice(&LOG_VERSION.to_le_bytes());
        let created = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        header.extend_from_slice(&created.to_le_bytes());
        header.extend_from_slice(&next_position.to_le_bytes());
        // Reserved, pads the header to 64 bytes
        header.resize(HEADER_SIZE as usize, 0);
        header
    }

    /// Next position recorded in a segment header, zero if the header is short
    fn header_next_position(path: &Path) -> Result<u64, LogError> {
        let mut file = File::open(path)
            .map_err(|e| LogError::Io(format!("Failed to open log segment: {}", e)))?;
        let mut header = [0u8; 22];
        if file.read_exact(&mut header).is_err() {
            return Ok(0);
        }
        if u32::from_le_bytes([header[0], header[1], header[2], header[3]]) != LOG_MAGIC {
            return Ok(0);
        }
        let mut position = [0u8; 8];
        position.copy_from_slice(&header[14..22]);
        Ok(u64::from_le_bytes(position))
    }

    fn segment_name(number: u64) -> String {
        format!("segment_{:06}.log", number)
    }

    /// Segment files in `dir`, sorted by segment number
    fn segment_files(dir: &Path) -> Result<Vec<(u64, PathBuf)>, LogError> {
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let entries = std::fs::read_dir(dir)
            .map_err(|e| LogError::Io(format!("Failed to list log directory: {}", e)))?;

        let mut segments = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(number) = name
                .strip_prefix("segment_")
                .and_then(|s| s.strip_suffix(".log"))
                .and_then(|s| s.parse::<u64>().ok())
            {
                segments.push((number, entry.path()));
            }
        }
        segments.sort_by_key(|(number, _)| *number);
        Ok(segments)
    }

    /// Read all intact records of one segment
    ///
    /// Damaged bytes (a torn final write, a flipped bit) are skipped by
    /// scanning forward to the next magic number.
    pub fn read_segment(path: &Path) -> Result<Vec<TransactionLogRecord>, LogError> {
        let mut file = File::open(path)
            .map_err(|e| LogError::Io(format!("Failed to open log segment: {}", e)))?;

        let mut header = [0u8; 6];
        if file.read_exact(&mut header).is_err() {
            return Ok(Vec::new());
        }
        if u32::from_le_bytes([header[0], header[1], header[2], header[3]]) != LOG_MAGIC {
            return Err(LogError::Corrupted(format!(
                "{} is not a transaction log segment",
                path.display()
            )));
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version > LOG_VERSION {
            return Err(LogError::UnsupportedVersion(version));
        }

        file.seek(SeekFrom::Start(HEADER_SIZE))
            .map_err(|e| LogError::Io(format!("Failed to seek in log segment: {}", e)))?;

        let mut buffer = Vec::new();
        BufReader::new(file)
            .read_to_end(&mut buffer)
            .map_err(|e| LogError::Io(format!("Failed to read log segment: {}", e)))?;

        let mut records = Vec::new();
        let mut offset = 0;
        let mut skipped = 0usize;
        while offset + MIN_RECORD_SIZE <= buffer.len() {
            match TransactionLogRecord::decode(&buffer[offset..]) {
                Ok((record, size)) => {
                    records.push(record);
                    offset += size;
                }
                Err(_) => {
                    offset += 1;
                    skipped += 1;
                }
            }
        }

        if skipped > 0 {
            log::warn!(
                "Skipped {} damaged bytes in log segment {}",
                skipped,
                path.display()
            );
        }

        Ok(records)
    }
}

/// Transaction log errors
#[derive(Error, Debug)]
pub enum LogError {
    #[error("Log IO error: {0}")]
    Io(String),

    #[error("Corrupted log record: {0}")]
    Corrupted(String),

    #[error("Truncated log record")]
    Truncated,

    #[error("Log record too large: {0}")]
    RecordTooLarge(String),

    #[error("Unsupported log format version {0}")]
    UnsupportedVersion(u16),
}
