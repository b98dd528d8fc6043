use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

use super::LineSource;
use crate::error::Error;

/// FileSource reads the files `<prefix><N><suffix>` of a folder (e.g. `access0.log`,
/// `access1.log`, ...) in ascending order of `N`, line by line. Files of one folder are expected
/// to be ordered by time, so their concatenation is an ordered stream. Other files are ignored.
///
/// The folder is listed on the first read; a missing folder is a read failure of the source.
pub struct FileSource {
    name: String,
    folder: PathBuf,
    prefix: String,
    suffix: String,
    pending_files: Option<VecDeque<PathBuf>>,
    current: Option<(PathBuf, BufReader<File>)>,
}

impl FileSource {
    pub fn new(
        name: impl Into<String>,
        folder: impl Into<PathBuf>,
        prefix: impl Into<String>,
        suffix: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            folder: folder.into(),
            prefix: prefix.into(),
            suffix: suffix.into(),
            pending_files: None,
            current: None,
        }
    }

    /// Sequence number of a file name, if it matches `<prefix><N><suffix>`.
    fn sequence_of(&self, file_name: &str) -> Option<u64> {
        file_name
            .strip_prefix(self.prefix.as_str())?
            .strip_suffix(self.suffix.as_str())?
            .parse()
            .ok()
    }

    async fn list_files(&self) -> crate::Result<VecDeque<PathBuf>> {
        let mut entries = tokio::fs::read_dir(&self.folder).await.map_err(|e| {
            Error::Source(format!("Failed to list {}: {e}", self.folder.display()))
        })?;

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let file_name = entry.file_name();
            match file_name.to_str().and_then(|n| self.sequence_of(n)) {
                Some(seq) => files.push((seq, entry.path())),
                None => debug!(source = %self.name, file = ?file_name, "Ignoring file"),
            }
        }
        files.sort_by_key(|(seq, _)| *seq);

        debug!(source = %self.name, files = files.len(), "Listed source files");
        Ok(files.into_iter().map(|(_, path)| path).collect())
    }

    async fn open(path: &Path) -> crate::Result<BufReader<File>> {
        let file = File::open(path)
            .await
            .map_err(|e| Error::Source(format!("Failed to open {}: {e}", path.display())))?;
        Ok(BufReader::new(file))
    }
}

impl LineSource for FileSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&mut self, max: usize) -> crate::Result<Option<Vec<String>>> {
        if self.pending_files.is_none() {
            self.pending_files = Some(self.list_files().await?);
        }

        let mut lines = Vec::new();
        let mut buf = Vec::new();
        while lines.len() < max.max(1) {
            if self.current.is_none() {
                let next = self.pending_files.as_mut().and_then(VecDeque::pop_front);
                let Some(path) = next else {
                    break;
                };
                debug!(source = %self.name, file = %path.display(), "Reading file");
                let reader = Self::open(&path).await?;
                self.current = Some((path, reader));
            }
            let Some((path, reader)) = self.current.as_mut() else {
                break;
            };

            buf.clear();
            let read = reader.read_until(b'\n', &mut buf).await.map_err(|e| {
                Error::Source(format!("Failed to read {}: {e}", path.display()))
            })?;
            if read == 0 {
                self.current = None;
                continue;
            }

            while buf.last().is_some_and(|b| *b == b'\n' || *b == b'\r') {
                buf.pop();
            }
            lines.push(String::from_utf8_lossy(&buf).into_owned());
        }

        if lines.is_empty() {
            return Ok(None);
        }
        Ok(Some(lines))
    }
}
