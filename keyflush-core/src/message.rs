//! Records as they travel from a source to a sink. A [ParsedRecord] is what a parser produces
//! from one raw line, it becomes a [BufferedRecord] once the aggregator has accepted it under its
//! key and stays that way until it is flushed.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};

/// Name of a source (e.g. the folder of one server's logs).
pub type SourceId = String;

/// Event time of a record.
pub type EventTime = DateTime<Utc>;

/// A record extracted from a single raw line.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRecord {
    /// grouping key (e.g. user id)
    pub key: String,
    /// event time used for watermarking
    pub event_time: EventTime,
    /// opaque payload handed to the sink as-is
    pub payload: Bytes,
}

impl ParsedRecord {
    pub fn new(key: impl Into<String>, event_time: EventTime, payload: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            event_time,
            payload: payload.into(),
        }
    }
}

/// A record waiting in the aggregator buffer for its key.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedRecord {
    pub event_time: EventTime,
    /// arrival sequence across the whole aggregator, breaks event time ties
    pub sequence: u64,
    pub payload: Bytes,
}

impl fmt::Display for BufferedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EventTime - {} Seq - {} Payload - {}",
            self.event_time.timestamp_millis(),
            self.sequence,
            String::from_utf8_lossy(&self.payload)
        )
    }
}
