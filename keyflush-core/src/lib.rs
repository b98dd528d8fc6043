//! Keyed streaming aggregation over independently ordered sources.
//!
//! Every source delivers its records in event-time order. Records are buffered per key by the
//! [aggregator] and are only handed to a [sink] once every source has moved past their event time
//! (or has finished), which is tracked by the per-source [watermark] table. The [coordinator] wires
//! one [source::SourceReader] per source to a single aggregator and drives the final flush.

mod error;
pub use crate::error::{Error, Result};

pub mod aggregator;
pub mod config;
pub mod coordinator;
pub mod generator;
pub mod message;
pub mod parser;
pub mod report;
pub mod sink;
pub mod source;
pub mod watermark;

#[cfg(test)]
mod test_utils;

pub use crate::coordinator::{Coordinator, RunSummary};
