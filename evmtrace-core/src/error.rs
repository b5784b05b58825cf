use thiserror::Error;

pub type Result<T> = std::result::Result<T, EvmtraceError>;

#[derive(Error, Debug)]
pub enum EvmtraceError {
    #[error("ABI parsing error: {0}")]
    AbiParse(String),

    #[error("Event decoding error: {0}")]
    EventDecode(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Event not found in ABI: {0}")]
    EventNotFound(String),

    #[error(
        "Configured start block {start_block} is ahead of the latest recorded block {recorded} for app '{app_name}'"
    )]
    StartBlockAhead {
        app_name: String,
        start_block: u64,
        recorded: u64,
    },

    #[error("RPC error: {0}")]
    Rpc(String),
}

impl EvmtraceError {
    /// Errors that must stop the process before any tracking starts.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EvmtraceError::Config(_)
                | EvmtraceError::EventNotFound(_)
                | EvmtraceError::AbiParse(_)
                | EvmtraceError::StartBlockAhead { .. }
        )
    }
}
