use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::Sink;
use crate::error::Error;
use crate::message::BufferedRecord;

const FILE_EXTENSION: &str = "log";
const DEFAULT_MAX_OPEN_FILES: usize = 64;

/// FileSink appends the payload of every record, newline terminated, to `<repository>/<key>.log`.
///
/// Files are opened in append mode on first use and closed (after syncing) when the flush pass
/// ends. At most `max_open_files` stay open at once: opening one more syncs and closes the file
/// opened longest ago, so a pass may touch any number of keys.
pub struct FileSink {
    repository: PathBuf,
    max_open_files: usize,
    open_files: HashMap<String, File>,
    /// keys of `open_files`, oldest first
    open_order: VecDeque<String>,
}

impl FileSink {
    /// Creates the sink, creating the repository directory if it does not exist.
    pub async fn new(repository: impl Into<PathBuf>) -> crate::Result<Self> {
        let repository = repository.into();
        tokio::fs::create_dir_all(&repository).await.map_err(|e| {
            Error::Sink(format!(
                "Failed to create repository {}: {e}",
                repository.display()
            ))
        })?;
        info!(repository = %repository.display(), "File sink ready");
        Ok(Self {
            repository,
            max_open_files: DEFAULT_MAX_OPEN_FILES,
            open_files: HashMap::new(),
            open_order: VecDeque::new(),
        })
    }

    /// Caps the number of files kept open at once, at least one.
    pub fn with_max_open_files(mut self, max_open_files: usize) -> Self {
        self.max_open_files = max_open_files.max(1);
        self
    }

    /// Path of the output file of a key.
    pub fn path_for(&self, key: &str) -> PathBuf {
        key_path(&self.repository, key)
    }

    /// Number of files currently open.
    pub fn open_files(&self) -> usize {
        self.open_files.len()
    }

    async fn file_for(&mut self, key: &str) -> crate::Result<&mut File> {
        if !self.open_files.contains_key(key) {
            while self.open_files.len() >= self.max_open_files {
                let Some(oldest) = self.open_order.pop_front() else {
                    break;
                };
                if let Some(file) = self.open_files.remove(&oldest) {
                    sync_and_close(&oldest, file).await?;
                }
            }

            let path = self.path_for(key);
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
                .map_err(|e| Error::Sink(format!("Failed to open {}: {e}", path.display())))?;
            self.open_files.insert(key.to_string(), file);
            self.open_order.push_back(key.to_string());
        }
        self.open_files
            .get_mut(key)
            .ok_or_else(|| Error::Sink(format!("No open file for key {key}")))
    }
}

async fn sync_and_close(key: &str, mut file: File) -> crate::Result<()> {
    file.flush()
        .await
        .and(file.sync_data().await)
        .map_err(|e| Error::Sink(format!("Failed to sync output of key {key}: {e}")))
}

impl Sink for FileSink {
    async fn write(&mut self, key: &str, record: &BufferedRecord) -> crate::Result<()> {
        let mut line = Vec::with_capacity(record.payload.len() + 1);
        line.extend_from_slice(&record.payload);
        line.push(b'\n');

        let file = self.file_for(key).await?;
        file.write_all(&line)
            .await
            .map_err(|e| Error::Sink(format!("Failed to write record for key {key}: {e}")))
    }

    async fn flush(&mut self) -> crate::Result<()> {
        let count = self.open_files.len();
        self.open_order.clear();
        for (key, file) in self.open_files.drain() {
            sync_and_close(&key, file).await?;
        }
        debug!(files = count, "File sink synced");
        Ok(())
    }
}

/// Output file of a key. The key is escaped so it always names a single file inside the
/// repository: anything outside `[A-Za-z0-9_-]` (and a dot in first position) becomes `%XX`.
pub(crate) fn key_path(repository: &Path, key: &str) -> PathBuf {
    repository.join(format!("{}.{FILE_EXTENSION}", escape_key(key)))
}

fn escape_key(key: &str) -> String {
    if key.is_empty() {
        return "%".to_string();
    }
    let mut escaped = String::with_capacity(key.len());
    for (i, b) in key.bytes().enumerate() {
        let keep = b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || (b == b'.' && i > 0);
        if keep {
            escaped.push(b as char);
        } else {
            escaped.push_str(&format!("%{b:02X}"));
        }
    }
    escaped
}
