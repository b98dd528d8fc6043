use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::message::BufferedRecord;

/// Appends every record under one file per key.
pub mod file;

/// Writes every record to the log, handy for debugging.
pub mod log;

/// Discards every record, emulates /dev/null.
pub mod blackhole;

pub use blackhole::BlackholeSink;
pub use file::FileSink;
pub use log::LogSink;

/// Durable, append-only output for finalized records.
///
/// The aggregator calls [LocalSink::write] once per record, in event-time order per key, and
/// never for the same record twice. [LocalSink::flush] is called at the end of every flush pass.
#[trait_variant::make(Sink: Send)]
#[allow(dead_code)]
pub trait LocalSink {
    /// Append one finalized record to the output of `key`.
    async fn write(&mut self, key: &str, record: &BufferedRecord) -> crate::Result<()>;

    /// Make everything written so far durable.
    async fn flush(&mut self) -> crate::Result<()>;
}

/// Which builtin sink to write to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkType {
    /// one file per key under the repository directory
    File { repository: PathBuf },
    Log,
    Blackhole,
}

impl Default for SinkType {
    fn default() -> Self {
        SinkType::File {
            repository: PathBuf::from("repository"),
        }
    }
}

impl fmt::Display for SinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkType::File { repository } => write!(f, "file({})", repository.display()),
            SinkType::Log => write!(f, "log"),
            SinkType::Blackhole => write!(f, "blackhole"),
        }
    }
}

/// Parses `file`, `file:<dir>`, `log` and `blackhole`.
impl FromStr for SinkType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some(("file", dir)) if !dir.is_empty() => Ok(SinkType::File {
                repository: PathBuf::from(dir),
            }),
            None if s == "file" => Ok(SinkType::default()),
            None if s == "log" => Ok(SinkType::Log),
            None if s == "blackhole" => Ok(SinkType::Blackhole),
            _ => Err(Error::Config(format!("Invalid sink type: {s}"))),
        }
    }
}
