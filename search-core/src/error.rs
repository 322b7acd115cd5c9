use thiserror::Error;

/// Error taxonomy shared by the whole engine. `Storage` and `Codec` wrap
/// the backing tree and value encoding; `Corrupt` covers records that
/// decode but violate the relational layout.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
