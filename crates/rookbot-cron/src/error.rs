use thiserror::Error;

#[derive(Debug, Error)]
pub enum CronError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("unsupported store version: {0}")]
    Version(u32),
    #[error("invalid job: {0}")]
    InvalidJob(String),
    #[error("cron service stopped")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, CronError>;
