use super::Sink;
use crate::message::BufferedRecord;

/// Logs every record at `info`.
#[derive(Default)]
pub struct LogSink {
    written: u64,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Sink for LogSink {
    async fn write(&mut self, key: &str, record: &BufferedRecord) -> crate::Result<()> {
        tracing::info!("Key - {} {}", key, record);
        self.written += 1;
        Ok(())
    }

    async fn flush(&mut self) -> crate::Result<()> {
        tracing::debug!(written = self.written, "Log sink flushed");
        Ok(())
    }
}
