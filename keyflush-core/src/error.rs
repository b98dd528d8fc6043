use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Config Error - {0}")]
    Config(String),

    #[error("Source Error - {0}")]
    Source(String),

    #[error("Parse Error - {0}")]
    Parse(String),

    #[error("Sink Error - {0}")]
    Sink(String),

    #[error("Watermark Error - {0}")]
    Watermark(String),

    #[error("Aggregator Error - {0}")]
    Aggregator(String),

    #[error("Coordinator Error - {0}")]
    Coordinator(String),

    #[error("IO Error - {0}")]
    Io(String),

    #[error("OneShot Receiver Error - {0}")]
    ActorPatternRecv(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(err: tokio::sync::oneshot::error::RecvError) -> Self {
        Error::ActorPatternRecv(err.to_string())
    }
}
