//! Turns a raw line into a [ParsedRecord]. The aggregator never looks at raw lines, so any line
//! format can be plugged in by implementing [Parser].

use bytes::Bytes;
use chrono::{DateTime, Utc};
use regex::Regex;

use crate::error::{Error, Result};
use crate::message::ParsedRecord;

/// Timestamp layout of the access logs, e.g. `10/Oct/2024:13:55:36 +0000`.
pub const ACCESS_LOG_TIME_FORMAT: &str = "%d/%b/%Y:%H:%M:%S %z";

/// Extracts key and event time from one raw line.
pub trait Parser: Send + Sync {
    fn parse(&self, line: &str) -> Result<ParsedRecord>;
}

/// Parser for access log lines of the form
/// `177.126.180.83 - - [10/Oct/2024:13:55:36 +0000] "GET /meme.jpg HTTP/1.1" 200 2148 "-" "userid=<id>"`.
///
/// The user id is the key, the bracketed time is the event time, and the whole line is the payload.
#[derive(Debug, Clone)]
pub struct AccessLogParser {
    user_id: Regex,
    timestamp: Regex,
}

impl AccessLogParser {
    pub fn new() -> Result<Self> {
        Ok(Self {
            user_id: Regex::new(r#"userid=([^"]*)""#)
                .map_err(|e| Error::Config(format!("Invalid user id pattern: {e}")))?,
            timestamp: Regex::new(r"\[([^\]]*)\]")
                .map_err(|e| Error::Config(format!("Invalid timestamp pattern: {e}")))?,
        })
    }

    /// Event time of a line without extracting anything else.
    pub fn event_time(&self, line: &str) -> Result<DateTime<Utc>> {
        let raw = self
            .timestamp
            .captures(line)
            .and_then(|c| c.get(1))
            .ok_or_else(|| Error::Parse(format!("no timestamp in line: {line}")))?
            .as_str();

        DateTime::parse_from_str(raw, ACCESS_LOG_TIME_FORMAT)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| Error::Parse(format!("invalid timestamp {raw}: {e}")))
    }
}

impl Parser for AccessLogParser {
    fn parse(&self, line: &str) -> Result<ParsedRecord> {
        let user_id = self
            .user_id
            .captures(line)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::Parse(format!("no user id in line: {line}")))?;

        let event_time = self.event_time(line)?;

        Ok(ParsedRecord {
            key: user_id.to_string(),
            event_time,
            payload: Bytes::copy_from_slice(line.as_bytes()),
        })
    }
}
