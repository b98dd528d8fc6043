//! Per-source watermarks and the global threshold derived from them.
//!
//! A source's [Watermark] is the highest event time it has produced so far. Since every source
//! is ordered by event time, no source can produce anything at or below its own watermark again.
//! The minimum across all sources is therefore a point in time that no future record can precede,
//! and anything buffered at or below it is final.

use std::collections::HashMap;
use std::fmt;

use tracing::debug;

use crate::error::{Error, Result};
use crate::message::{EventTime, SourceId};

/// Watermark of a single source.
///
/// The variant order is the logical order: [Watermark::Unseen] is below every event time and
/// [Watermark::Complete] is above every event time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Watermark {
    /// the source has not produced anything yet
    #[default]
    Unseen,
    /// highest event time produced so far
    At(EventTime),
    /// the source is exhausted and will never produce again
    Complete,
}

impl Watermark {
    /// Returns true if a record with the given event time is at or below this watermark.
    pub fn covers(&self, event_time: EventTime) -> bool {
        Watermark::At(event_time) <= *self
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Watermark::Unseen => write!(f, "unseen"),
            Watermark::At(t) => write!(f, "{}", t.to_rfc3339()),
            Watermark::Complete => write!(f, "complete"),
        }
    }
}

/// Watermark of every known source. Watermarks never move backwards.
#[derive(Debug, Clone, Default)]
pub struct WatermarkTable {
    watermarks: HashMap<SourceId, Watermark>,
}

impl WatermarkTable {
    /// Creates a table where every source starts as [Watermark::Unseen].
    pub fn new<I, S>(sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<SourceId>,
    {
        Self {
            watermarks: sources
                .into_iter()
                .map(|s| (s.into(), Watermark::Unseen))
                .collect(),
        }
    }

    /// Advances the watermark of `source` to `event_time` if it is ahead of the current one.
    /// Returns false when the event time is behind the current watermark (out of order), in which
    /// case the watermark is left as is.
    pub fn advance(&mut self, source: &str, event_time: EventTime) -> Result<bool> {
        let watermark = self.get_mut(source)?;
        let candidate = Watermark::At(event_time);
        if candidate > *watermark {
            *watermark = candidate;
            return Ok(true);
        }
        Ok(candidate == *watermark)
    }

    /// Marks the source as exhausted. Calling it again has no further effect.
    pub fn complete(&mut self, source: &str) -> Result<()> {
        let watermark = self.get_mut(source)?;
        if *watermark != Watermark::Complete {
            debug!(source, previous = %watermark, "Source complete");
            *watermark = Watermark::Complete;
        }
        Ok(())
    }

    /// Current watermark of a source.
    pub fn get(&self, source: &str) -> Option<Watermark> {
        self.watermarks.get(source).copied()
    }

    /// Minimum watermark across all sources. A table without sources never holds anything back.
    pub fn global_threshold(&self) -> Watermark {
        self.watermarks
            .values()
            .copied()
            .min()
            .unwrap_or(Watermark::Complete)
    }

    /// True once every source is complete.
    pub fn all_complete(&self) -> bool {
        self.watermarks.values().all(|w| *w == Watermark::Complete)
    }

    /// Snapshot of the table sorted by source name.
    pub fn snapshot(&self) -> Vec<(SourceId, Watermark)> {
        let mut entries: Vec<_> = self
            .watermarks
            .iter()
            .map(|(s, w)| (s.clone(), *w))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    fn get_mut(&mut self, source: &str) -> Result<&mut Watermark> {
        self.watermarks
            .get_mut(source)
            .ok_or_else(|| Error::Watermark(format!("unknown source {source}")))
    }
}
