use std::collections::VecDeque;

use super::LineSource;

/// MemorySource serves a fixed list of lines and then ends.
#[derive(Debug, Clone)]
pub struct MemorySource {
    name: String,
    lines: VecDeque<String>,
}

impl MemorySource {
    pub fn new(name: impl Into<String>, lines: impl IntoIterator<Item = String>) -> Self {
        Self {
            name: name.into(),
            lines: lines.into_iter().collect(),
        }
    }
}

impl LineSource for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&mut self, max: usize) -> crate::Result<Option<Vec<String>>> {
        if self.lines.is_empty() {
            return Ok(None);
        }
        let count = max.max(1).min(self.lines.len());
        Ok(Some(self.lines.drain(..count).collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_source_batches() {
        let mut source = MemorySource::new("mem", (0..5).map(|i| i.to_string()));
        assert_eq!(source.name(), "mem");
        assert_eq!(source.read(2).await.unwrap(), Some(vec!["0".into(), "1".into()]));
        assert_eq!(source.read(2).await.unwrap(), Some(vec!["2".into(), "3".into()]));
        assert_eq!(source.read(2).await.unwrap(), Some(vec!["4".into()]));
        assert_eq!(source.read(2).await.unwrap(), None);
        assert_eq!(source.read(2).await.unwrap(), None);
    }
}
