//! Writes synthetic access logs: a few server folders, each holding numbered log files whose
//! lines are one second apart, for a fixed population of random users. Every folder on its own is
//! time ordered, which is all a source has to guarantee.

use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;
use rand::seq::SliceRandom;
use tracing::info;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::parser::ACCESS_LOG_TIME_FORMAT;

const DEFAULT_SERVERS: usize = 4;
const DEFAULT_FILES: usize = 10;
const DEFAULT_ENTRIES: usize = 100;
const DEFAULT_USERS: usize = 10;

#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// folder the server folders are created in
    pub root: PathBuf,
    pub servers: usize,
    /// log files per server
    pub files: usize,
    /// lines per log file
    pub entries: usize,
    /// distinct user ids
    pub users: usize,
    pub file_prefix: String,
    pub file_suffix: String,
    /// time of the first line, `now` when not set
    pub start: Option<DateTime<Utc>>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            servers: DEFAULT_SERVERS,
            files: DEFAULT_FILES,
            entries: DEFAULT_ENTRIES,
            users: DEFAULT_USERS,
            file_prefix: "access".to_string(),
            file_suffix: ".log".to_string(),
            start: None,
        }
    }
}

/// What [generate] wrote.
#[derive(Debug, Clone)]
pub struct Generated {
    /// server folders, in the order they were filled
    pub folders: Vec<PathBuf>,
    pub users: Vec<String>,
    pub lines: usize,
}

/// Name of the n-th server folder, counting from one.
pub fn server_name(n: usize) -> String {
    format!("server{n:02}")
}

/// One access log line.
pub fn access_log_line(user: &str, time: DateTime<Utc>) -> String {
    format!(
        r#"177.126.180.83 - - [{}] "GET /meme.jpg HTTP/1.1" 200 2148 "-" "userid={user}""#,
        time.format(ACCESS_LOG_TIME_FORMAT)
    )
}

/// Generates the server folders under `config.root`. Folders are filled in random order, so the
/// first folder listed does not always hold the oldest lines.
pub async fn generate(config: &GeneratorConfig) -> Result<Generated> {
    if config.users == 0 {
        return Err(Error::Config("at least one user is required".to_string()));
    }

    let users: Vec<String> = (0..config.users)
        .map(|_| Uuid::new_v4().simple().to_string())
        .collect();

    let mut folders: Vec<PathBuf> = (1..=config.servers)
        .map(|n| config.root.join(server_name(n)))
        .collect();

    // the rng is not Send, keep it out of the awaits below
    let (picks, folders) = {
        let mut rng = rand::rng();
        folders.shuffle(&mut rng);
        let total = config.servers * config.files * config.entries;
        let picks: Vec<usize> = (0..total)
            .map(|_| rng.random_range(0..config.users))
            .collect();
        (picks, folders)
    };

    let mut time = config.start.unwrap_or_else(Utc::now);
    let mut picks = picks.into_iter();
    let mut lines = 0;
    for folder in &folders {
        tokio::fs::create_dir_all(folder).await?;
        for i in 0..config.files {
            let mut content = String::new();
            for user in picks.by_ref().take(config.entries) {
                time += TimeDelta::seconds(1);
                content.push_str(&access_log_line(&users[user], time));
                content.push('\n');
                lines += 1;
            }
            let path = log_path(folder, &config.file_prefix, i, &config.file_suffix);
            tokio::fs::write(&path, content).await?;
        }
    }

    info!(
        folders = folders.len(),
        users = users.len(),
        lines,
        "Generated access logs"
    );
    Ok(Generated {
        folders,
        users,
        lines,
    })
}

fn log_path(folder: &Path, prefix: &str, n: usize, suffix: &str) -> PathBuf {
    folder.join(format!("{prefix}{n}{suffix}"))
}
