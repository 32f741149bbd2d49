use thiserror::Error;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("log io: {0}")]
    Io(#[from] std::io::Error),

    #[error("log entry encode: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("log entry decode: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// A checksum mismatch before the last frame: not a torn write, the log
    /// itself is damaged.
    #[error("log corrupt at offset {offset}")]
    Corrupt { offset: u64 },

    #[error("log write refused: {0}")]
    Unavailable(String),
}
