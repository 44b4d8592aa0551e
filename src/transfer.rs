//! Download bookkeeping: a JSONL log of image transfers written beside the
//! downloaded files, so an interrupted session shows what made it across.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub enum TransferStatus {
    Completed,
    SizeMismatch,
    Failed,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct TransferLogEntry {
    pub timestamp: String,
    /// Peer the image came from.
    pub server: String,
    /// Image index on the peer at transfer time.
    pub index: usize,
    /// Capture timestamp reported by LIST.
    pub capture_time: f64,
    pub expected_size: u64,
    pub received_size: u64,
    pub path: PathBuf,
    pub status: TransferStatus,
    pub error: Option<String>,
}

impl TransferLogEntry {
    pub fn new(server: String, index: usize, capture_time: f64, expected_size: u64) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            server,
            index,
            capture_time,
            expected_size,
            received_size: 0,
            path: PathBuf::new(),
            status: TransferStatus::Failed,
            error: None,
        }
    }
}

pub struct TransferLog {
    log_file_path: PathBuf,
}

impl TransferLog {
    pub fn new(output_root: &Path) -> Self {
        let log_file_path = output_root.join(".camfleet_downloads.jsonl");
        TransferLog { log_file_path }
    }

    pub fn add_entry(&self, entry: &TransferLogEntry) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file_path)
            .context("open transfer log")?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, entry)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    pub fn read_log(&self) -> Result<Vec<TransferLogEntry>> {
        if !self.log_file_path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.log_file_path).context("open transfer log for reading")?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line)?);
        }
        Ok(entries)
    }
}
