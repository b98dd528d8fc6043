//! Settings of a run. They are loaded from a base64 encoded JSON object and individual environment
//! variables, and the binary lets command line flags override them. Settings are passed around
//! explicitly.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use serde::{Deserialize, Serialize};

use crate::aggregator::AggregatorConfig;
use crate::error::{Error, Result};
use crate::sink::SinkType;

const ENV_OBJECT: &str = "KEYFLUSH_OBJECT";
const ENV_SOURCES: &str = "KEYFLUSH_SOURCES";
const ENV_REPOSITORY: &str = "KEYFLUSH_REPOSITORY";
const ENV_SINK: &str = "KEYFLUSH_SINK";
const ENV_READ_BATCH_SIZE: &str = "KEYFLUSH_READ_BATCH_SIZE";
const ENV_FLUSH_EVERY: &str = "KEYFLUSH_FLUSH_EVERY";
const ENV_FLUSH_INTERVAL_MS: &str = "KEYFLUSH_FLUSH_INTERVAL_MS";
const ENV_SINK_MAX_RETRY_ATTEMPTS: &str = "KEYFLUSH_SINK_MAX_RETRY_ATTEMPTS";
const ENV_SINK_RETRY_INTERVAL_MS: &str = "KEYFLUSH_SINK_RETRY_INTERVAL_MS";

const DEFAULT_FILE_PREFIX: &str = "access";
const DEFAULT_FILE_SUFFIX: &str = ".log";
const DEFAULT_READ_BATCH_SIZE: usize = 500;
const DEFAULT_FLUSH_EVERY: usize = 1;
const DEFAULT_SINK_MAX_RETRY_ATTEMPTS: u16 = 3;
const DEFAULT_SINK_RETRY_INTERVAL_MS: u64 = 10;
const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// One source: a folder holding the time ordered log files of one server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub path: PathBuf,
}

impl SourceConfig {
    /// Source named after the last component of its folder.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self { name, path }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    pub sources: Vec<SourceConfig>,
    pub sink: SinkType,
    /// log file names are `<file_prefix><N><file_suffix>`
    pub file_prefix: String,
    pub file_suffix: String,
    pub read_batch_size: usize,
    /// ingest requests between automatic flushes, 0 turns automatic flushing off
    pub flush_every: usize,
    pub flush_interval_ms: Option<u64>,
    pub sink_max_retry_attempts: u16,
    pub sink_retry_interval_ms: u64,
    pub channel_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            sink: SinkType::default(),
            file_prefix: DEFAULT_FILE_PREFIX.to_string(),
            file_suffix: DEFAULT_FILE_SUFFIX.to_string(),
            read_batch_size: DEFAULT_READ_BATCH_SIZE,
            flush_every: DEFAULT_FLUSH_EVERY,
            flush_interval_ms: None,
            sink_max_retry_attempts: DEFAULT_SINK_MAX_RETRY_ATTEMPTS,
            sink_retry_interval_ms: DEFAULT_SINK_RETRY_INTERVAL_MS,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl Settings {
    /// Loads the settings from the process environment, on top of the defaults.
    pub fn load() -> Result<Self> {
        let env_vars: HashMap<String, String> = env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect();
        env_vars.try_into()
    }

    /// Decodes a base64 encoded JSON settings object. Missing fields keep their defaults.
    pub fn from_encoded(obj: &str) -> Result<Self> {
        let decoded = BASE64_STANDARD
            .decode(obj.trim().as_bytes())
            .map_err(|e| Error::Config(format!("Failed to decode settings object: {e:?}")))?;
        serde_json::from_slice(&decoded)
            .map_err(|e| Error::Config(format!("Failed to parse settings object: {e:?}")))
    }

    /// Checks what cannot be expressed in the types.
    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            return Err(Error::Config("at least one source is required".to_string()));
        }
        let mut names: Vec<_> = self.sources.iter().map(|s| s.name.as_str()).collect();
        names.sort_unstable();
        if let Some(dup) = names.windows(2).find(|w| w[0] == w[1]) {
            return Err(Error::Config(format!("duplicate source name {}", dup[0])));
        }
        if self.read_batch_size == 0 {
            return Err(Error::Config("read batch size must be positive".to_string()));
        }
        Ok(())
    }

    pub fn aggregator_config(&self) -> AggregatorConfig {
        AggregatorConfig {
            flush_every: self.flush_every,
            flush_interval: self
                .flush_interval_ms
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
            sink_max_retry_attempts: self.sink_max_retry_attempts,
            sink_retry_interval: Duration::from_millis(self.sink_retry_interval_ms),
            channel_capacity: self.channel_capacity,
        }
    }
}

/// Settings from a set of environment variables. The encoded object, if any, is applied first and
/// the individual variables override it.
impl TryFrom<HashMap<String, String>> for Settings {
    type Error = Error;

    fn try_from(env_vars: HashMap<String, String>) -> Result<Self> {
        let mut settings = match env_vars.get(ENV_OBJECT) {
            Some(obj) => Self::from_encoded(obj)?,
            None => Settings::default(),
        };

        if let Some(sources) = env_vars.get(ENV_SOURCES) {
            settings.sources = sources
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(SourceConfig::from_path)
                .collect();
        }

        if let Some(sink) = env_vars.get(ENV_SINK) {
            settings.sink = sink.parse()?;
        }

        // the repository only makes sense for a plain `file` sink
        if let Some(repository) = env_vars.get(ENV_REPOSITORY) {
            if let Some(sink) = env_vars.get(ENV_SINK).filter(|s| s.trim() != "file") {
                return Err(Error::Config(format!(
                    "{ENV_REPOSITORY} cannot be combined with {ENV_SINK}={sink}"
                )));
            }
            settings.sink = SinkType::File {
                repository: PathBuf::from(repository),
            };
        }

        if let Some(v) = parse_var(&env_vars, ENV_READ_BATCH_SIZE)? {
            settings.read_batch_size = v;
        }
        if let Some(v) = parse_var(&env_vars, ENV_FLUSH_EVERY)? {
            settings.flush_every = v;
        }
        if let Some(v) = parse_var(&env_vars, ENV_FLUSH_INTERVAL_MS)? {
            settings.flush_interval_ms = Some(v);
        }
        if let Some(v) = parse_var(&env_vars, ENV_SINK_MAX_RETRY_ATTEMPTS)? {
            settings.sink_max_retry_attempts = v;
        }
        if let Some(v) = parse_var(&env_vars, ENV_SINK_RETRY_INTERVAL_MS)? {
            settings.sink_retry_interval_ms = v;
        }

        Ok(settings)
    }
}

fn parse_var<T>(env_vars: &HashMap<String, String>, name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Debug,
{
    env_vars
        .get(name)
        .map(|v| {
            v.trim()
                .parse()
                .map_err(|e| Error::Config(format!("Parsing {name}(set to '{v}'): {e:?}")))
        })
        .transpose()
}
