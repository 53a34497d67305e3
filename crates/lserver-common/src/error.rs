use thiserror::Error;

#[derive(Error, Debug)]
pub enum LserverError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Listen error: {0}")]
    Listen(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Context is busy")]
    Busy,

    #[error("Bad context index: {0}")]
    BadContextIndex(usize),

    #[error("Context is not active: {0}")]
    ContextNotActive(usize),

    #[error("There should be at least one active context")]
    LastActiveContext,

    #[error("Max contexts count will be exceeded")]
    ContextPoolFull,

    #[error("Thread count must be between 1 and 64, got {0}")]
    BadThreadCount(usize),

    #[error("Invalid borrow request on a waiting pool")]
    PoolWaiterOccupied,

    #[error("Invalid server handle: {0}")]
    BadServerHandle(i32),

    #[error("Shutdown guard already triggered")]
    AlreadyTriggered,

    #[error("Control transport error: {0}")]
    Control(String),
}

pub type Result<T> = std::result::Result<T, LserverError>;
