//! Sinks and helpers shared by the unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::Error;
use crate::message::{BufferedRecord, EventTime};
use crate::sink::Sink;

/// One record as seen by a test sink.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Written {
    pub(crate) key: String,
    pub(crate) event_time: EventTime,
    pub(crate) payload: String,
}

/// Keeps every write in memory, in the order it happened. Clones share the same storage.
#[derive(Clone, Default)]
pub(crate) struct CollectingSink {
    written: Arc<Mutex<Vec<Written>>>,
}

impl CollectingSink {
    pub(crate) fn records(&self) -> Vec<Written> {
        self.written.lock().clone()
    }

    /// Takes everything written so far.
    pub(crate) fn drain(&self) -> Vec<Written> {
        std::mem::take(&mut *self.written.lock())
    }

    pub(crate) fn payloads(&self, key: &str) -> Vec<String> {
        self.written
            .lock()
            .iter()
            .filter(|w| w.key == key)
            .map(|w| w.payload.clone())
            .collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.written.lock().is_empty()
    }
}

impl Sink for CollectingSink {
    async fn write(&mut self, key: &str, record: &BufferedRecord) -> crate::Result<()> {
        self.written.lock().push(Written {
            key: key.to_string(),
            event_time: record.event_time,
            payload: String::from_utf8_lossy(&record.payload).into_owned(),
        });
        Ok(())
    }

    async fn flush(&mut self) -> crate::Result<()> {
        Ok(())
    }
}

/// Fails the first `failures` writes, then behaves like a [CollectingSink].
#[derive(Clone)]
pub(crate) struct FailingSink {
    remaining_failures: Arc<AtomicUsize>,
    pub(crate) inner: CollectingSink,
}

impl FailingSink {
    pub(crate) fn new(failures: usize) -> Self {
        Self {
            remaining_failures: Arc::new(AtomicUsize::new(failures)),
            inner: CollectingSink::default(),
        }
    }
}

impl Sink for FailingSink {
    async fn write(&mut self, key: &str, record: &BufferedRecord) -> crate::Result<()> {
        let failing = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::Sink("injected write failure".to_string()));
        }
        self.inner.write(key, record).await
    }

    async fn flush(&mut self) -> crate::Result<()> {
        self.inner.flush().await
    }
}
