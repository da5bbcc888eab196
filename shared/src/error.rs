use thiserror::Error;

/// Failures creating or attaching the control channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("control channel '{name}' does not exist")]
    NotFound { name: String },

    #[error("access to control channel '{name}' denied: {message}")]
    AccessDenied { name: String, message: String },

    #[error("control channel protocol mismatch: expected version {expected}, found {found}")]
    ProtocolMismatch { expected: u32, found: u32 },

    #[error("control channel name '{name}' is held by an incompatible peer (version {found})")]
    Incompatible { name: String, found: u32 },

    #[error("control channel size {requested} is smaller than the record ({required} bytes)")]
    TooSmall { requested: usize, required: usize },

    #[error("{op} failed for control channel '{name}': {message}")]
    Os {
        op: &'static str,
        name: String,
        message: String,
    },
}
