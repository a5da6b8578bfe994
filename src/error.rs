use thiserror::Error;

/// Failures on the publish/subscribe side.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The broker session could not be established. Retryable by the caller.
    #[error("connection to {broker} failed: {reason}")]
    Connection { broker: String, reason: String },

    /// A payload could not be decoded. The previous snapshot is kept.
    #[error("failed to decode payload on {topic}: {reason}")]
    Decode { topic: String, reason: String },

    #[error("LED index {0} out of range (expected 0..{max})", max = crate::telemetry::LED_COUNT)]
    InvalidLedIndex(usize),

    #[error("synchronizer already has an active session")]
    AlreadyConnected,

    #[error("synchronizer has been stopped")]
    Stopped,
}

impl SyncError {
    pub fn connection<B: Into<String>, R: ToString>(broker: B, reason: R) -> Self {
        Self::Connection {
            broker: broker.into(),
            reason: reason.to_string(),
        }
    }

    pub fn decode<T: Into<String>, R: ToString>(topic: T, reason: R) -> Self {
        Self::Decode {
            topic: topic.into(),
            reason: reason.to_string(),
        }
    }
}

/// Failures on the camera side. None of these are fatal; the extractor
/// retries or skips and keeps going.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("failed to open stream {url}: {reason}")]
    StreamOpen { url: String, reason: String },

    #[error("stream read failed: {0}")]
    StreamRead(String),

    #[error("frame {sequence} failed to decode: {reason}")]
    FrameDecode { sequence: u64, reason: String },
}

impl FrameError {
    pub fn stream_open<U: Into<String>, R: ToString>(url: U, reason: R) -> Self {
        Self::StreamOpen {
            url: url.into(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

pub type Result<T> = std::result::Result<T, Error>;
