use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("malformed pattern data: {0}")]
    Json(#[from] serde_json::Error),

    #[error("track {0} out of range")]
    TrackOutOfRange(usize),

    #[error("bank {bank:?} slot {slot} out of range")]
    SlotOutOfRange { bank: String, slot: usize },

    #[error("an export is already in progress")]
    ExportInProgress,

    #[error("audio context unavailable: {0}")]
    ContextUnavailable(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
