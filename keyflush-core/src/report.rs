//! First and last time every user was seen. Used to check a run: the report over the source
//! folders and the report over the repository must be the same.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::parser::Parser;

const REPORT_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Running first/last seen of one key. Folding is commutative, so lines may be observed in any
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirstLastSeen {
    pub first: DateTime<Utc>,
    pub last: DateTime<Utc>,
    pub entries: u64,
}

impl FirstLastSeen {
    fn new(time: DateTime<Utc>) -> Self {
        Self {
            first: time,
            last: time,
            entries: 1,
        }
    }

    fn observe(&mut self, time: DateTime<Utc>) {
        self.first = self.first.min(time);
        self.last = self.last.max(time);
        self.entries += 1;
    }
}

/// One line of the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeySummary {
    pub user: String,
    pub first: DateTime<Utc>,
    pub last: DateTime<Utc>,
    pub entries: u64,
}

impl KeySummary {
    /// `<user> - <first> - <last>`
    pub fn to_text(&self) -> String {
        format!(
            "{} - {} - {}",
            self.user,
            self.first.format(REPORT_TIME_FORMAT),
            self.last.format(REPORT_TIME_FORMAT)
        )
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::Config(format!("Failed to serialize report line: {e}")))
    }
}

#[derive(Debug, Default)]
pub struct Report {
    keys: BTreeMap<String, FirstLastSeen>,
    /// files scanned
    pub files: usize,
    /// lines that could not be parsed
    pub skipped: u64,
}

impl Report {
    pub fn observe(&mut self, key: &str, time: DateTime<Utc>) {
        match self.keys.get_mut(key) {
            Some(seen) => seen.observe(time),
            None => {
                self.keys.insert(key.to_string(), FirstLastSeen::new(time));
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&FirstLastSeen> {
        self.keys.get(key)
    }

    /// Every key, sorted.
    pub fn summaries(&self) -> Vec<KeySummary> {
        self.keys
            .iter()
            .map(|(user, seen)| KeySummary {
                user: user.clone(),
                first: seen.first,
                last: seen.last,
                entries: seen.entries,
            })
            .collect()
    }
}

/// Scans every regular file directly inside `folders`, line by line.
pub async fn scan<P: Parser>(folders: &[PathBuf], parser: &P) -> Result<Report> {
    let mut report = Report::default();

    for folder in folders {
        let mut entries = tokio::fs::read_dir(folder).await.map_err(|e| {
            Error::Source(format!("Failed to list {}: {e}", folder.display()))
        })?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let path = entry.path();
            let content = tokio::fs::read(&path).await?;
            for line in String::from_utf8_lossy(&content).lines() {
                if line.trim().is_empty() {
                    continue;
                }
                match parser.parse(line) {
                    Ok(record) => report.observe(&record.key, record.event_time),
                    Err(e) => {
                        report.skipped += 1;
                        warn!(file = %path.display(), error = %e, "Skipping malformed line");
                    }
                }
            }
            report.files += 1;
        }
        debug!(folder = %folder.display(), "Scanned folder");
    }

    Ok(report)
}
