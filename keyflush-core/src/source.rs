use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregator::AggregatorHandle;
use crate::error::{Error, Result};
use crate::parser::Parser;

/// Reads the numbered log files of one folder, in order.
pub mod file;

/// Serves lines from memory.
pub mod memory;

pub use file::FileSource;
pub use memory::MemorySource;

/// An ordered, non-restartable stream of raw lines from one source.
#[trait_variant::make(LineSource: Send)]
#[allow(dead_code)]
pub trait LocalLineSource {
    /// Name of the source.
    fn name(&self) -> &str;

    /// Reads up to `max` lines. `None` is the end of the stream, the source is not read again
    /// after that.
    async fn read(&mut self, max: usize) -> Result<Option<Vec<String>>>;
}

/// What a [SourceReader] did with its source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub name: String,
    /// lines read from the source
    pub read: u64,
    /// records handed to the aggregator
    pub ingested: u64,
    /// lines that could not be parsed
    pub skipped: u64,
    /// whether the source was read to the end and reported complete
    pub completed: bool,
}

/// Reads one source to the end, parses every line and feeds the records to the aggregator. Once
/// the source is exhausted it is reported complete, exactly once.
///
/// A malformed line is logged and skipped. A failure to read the source stops the reader without
/// reporting completion, so the source's watermark stays where it was.
pub struct SourceReader<L, P> {
    source: L,
    parser: Arc<P>,
    aggregator: AggregatorHandle,
    batch_size: usize,
    cln_token: CancellationToken,
}

impl<L, P> SourceReader<L, P>
where
    L: LineSource,
    P: Parser,
{
    pub fn new(
        source: L,
        parser: Arc<P>,
        aggregator: AggregatorHandle,
        batch_size: usize,
        cln_token: CancellationToken,
    ) -> Self {
        Self {
            source,
            parser,
            aggregator,
            batch_size: batch_size.max(1),
            cln_token,
        }
    }

    pub async fn run(mut self) -> Result<SourceStats> {
        let name = self.source.name().to_string();
        let mut stats = SourceStats {
            name: name.clone(),
            ..Default::default()
        };
        info!(source = %name, "Starting source reader");

        loop {
            let batch = tokio::select! {
                biased;
                _ = self.cln_token.cancelled() => {
                    warn!(source = %name, read = stats.read, "Source reader cancelled before the end of the source");
                    return Ok(stats);
                }
                batch = self.source.read(self.batch_size) => batch,
            };

            let lines = match batch {
                Ok(Some(lines)) => lines,
                Ok(None) => break,
                Err(e) => {
                    error!(source = %name, error = ?e, "Failed to read source");
                    return Err(Error::Source(format!("{name}: {e}")));
                }
            };

            let mut records = Vec::with_capacity(lines.len());
            for line in lines {
                if line.trim().is_empty() {
                    continue;
                }
                stats.read += 1;
                match self.parser.parse(&line) {
                    Ok(record) => records.push(record),
                    Err(e) => {
                        stats.skipped += 1;
                        warn!(source = %name, error = %e, "Skipping malformed line");
                    }
                }
            }

            if records.is_empty() {
                continue;
            }
            let count = records.len() as u64;
            self.aggregator.ingest_batch(&name, records).await?;
            stats.ingested += count;
            debug!(source = %name, count, "Ingested batch");
        }

        self.aggregator.mark_source_complete(&name).await?;
        stats.completed = true;
        info!(
            source = %name,
            read = stats.read,
            ingested = stats.ingested,
            skipped = stats.skipped,
            "Source complete"
        );
        Ok(stats)
    }
}
