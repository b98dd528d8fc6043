use super::Sink;
use crate::message::BufferedRecord;

/// Blackhole is a sink to emulate /dev/null
pub struct BlackholeSink;

impl Sink for BlackholeSink {
    async fn write(&mut self, _key: &str, _record: &BufferedRecord) -> crate::Result<()> {
        Ok(())
    }

    async fn flush(&mut self) -> crate::Result<()> {
        Ok(())
    }
}
