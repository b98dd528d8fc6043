//! Wires one [SourceReader] per configured source to a single aggregator, waits for all of them
//! and then drives the final flush, so nothing that was ingested stays behind in memory.

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::aggregator::{AggregatorHandle, AggregatorStats, FlushStats};
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::parser::AccessLogParser;
use crate::sink::{BlackholeSink, FileSink, LogSink, SinkType};
use crate::source::{FileSource, SourceReader, SourceStats};

/// What a whole run did.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// per source, sorted by source name
    pub sources: Vec<SourceStats>,
    /// outcome of the final flush
    pub flush: FlushStats,
    pub stats: AggregatorStats,
}

pub struct Coordinator {
    settings: Settings,
}

impl Coordinator {
    pub fn new(settings: Settings) -> Result<Self> {
        settings.validate()?;
        Ok(Self { settings })
    }

    /// Reads every source to the end (or until `cln_token` is cancelled) and flushes everything.
    ///
    /// The final flush runs once all readers have stopped, whatever the reason. If a source could
    /// not be read, the error names it, but only after its records were flushed.
    pub async fn run(self, cln_token: CancellationToken) -> Result<RunSummary> {
        let aggregator = self.start_aggregator().await?;
        let parser = Arc::new(AccessLogParser::new()?);

        let mut readers = JoinSet::new();
        for source in &self.settings.sources {
            let line_source = FileSource::new(
                &source.name,
                &source.path,
                &self.settings.file_prefix,
                &self.settings.file_suffix,
            );
            let reader = SourceReader::new(
                line_source,
                Arc::clone(&parser),
                aggregator.clone(),
                self.settings.read_batch_size,
                cln_token.clone(),
            );
            readers.spawn(reader.run());
        }
        info!(
            sources = self.settings.sources.len(),
            sink = %self.settings.sink,
            "Started source readers"
        );

        let mut sources = Vec::with_capacity(self.settings.sources.len());
        let mut failures = Vec::new();
        while let Some(task) = readers.join_next().await {
            match task {
                Ok(Ok(stats)) => sources.push(stats),
                Ok(Err(e)) => failures.push(e.to_string()),
                Err(e) => {
                    error!(error = ?e, "Source reader task failed");
                    failures.push(format!("source reader task failed: {e:?}"));
                }
            }
        }
        sources.sort_by(|a, b| a.name.cmp(&b.name));

        let incomplete: Vec<&str> = sources
            .iter()
            .filter(|s| !s.completed)
            .map(|s| s.name.as_str())
            .collect();
        if !incomplete.is_empty() {
            warn!(?incomplete, "Sources stopped before their end");
        }

        let flush = aggregator.final_flush().await?;
        let stats = aggregator.stats().await?;
        info!(
            ingested = stats.ingested,
            flushed = stats.flushed,
            late = stats.late,
            sink_failures = stats.sink_failures,
            "Run finished"
        );

        if !failures.is_empty() {
            return Err(Error::Coordinator(format!(
                "{} source(s) failed: {}",
                failures.len(),
                failures.join("; ")
            )));
        }

        Ok(RunSummary {
            sources,
            flush,
            stats,
        })
    }

    async fn start_aggregator(&self) -> Result<AggregatorHandle> {
        let sources = self
            .settings
            .sources
            .iter()
            .map(|s| s.name.clone())
            .collect();
        let config = self.settings.aggregator_config();

        let handle = match &self.settings.sink {
            SinkType::File { repository } => {
                AggregatorHandle::new(sources, FileSink::new(repository).await?, config)
            }
            SinkType::Log => AggregatorHandle::new(sources, LogSink::new(), config),
            SinkType::Blackhole => AggregatorHandle::new(sources, BlackholeSink, config),
        };
        Ok(handle)
    }
}
