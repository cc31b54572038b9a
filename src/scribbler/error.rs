// Error taxonomy for the Scribbler link

/// Error types for Scribbler communication
#[derive(Debug, thiserror::Error)]
pub enum ScribblerError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("JSON encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Couldn't find robot named '{name}' on ports {first}..={last}")]
    ConnectionNotFound { name: String, first: u32, last: u32 },

    #[error("Transient link error on {port}: {reason}")]
    TransientLink { port: String, reason: String },

    #[error("Timed out waiting for reply: expected {expected} bytes, got {received}")]
    ProtocolTimeout { expected: usize, received: usize },

    #[error("Invalid response to opcode {opcode}: {reason}")]
    InvalidResponse { opcode: u8, reason: String },

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("{feature} is not supported on this chassis")]
    UnsupportedOnChassis { feature: &'static str },

    #[error("Cancelled by user")]
    UserCancelled,

    #[error("Link is closed")]
    LinkClosed,
}

pub type Result<T> = std::result::Result<T, ScribblerError>;

impl ScribblerError {
    /// Protocol-level failures worth a caller retry (as opposed to cancellation or misuse).
    pub fn is_timeout(&self) -> bool {
        matches!(self, ScribblerError::ProtocolTimeout { .. })
    }

    pub(crate) fn invalid(opcode: u8, reason: impl Into<String>) -> Self {
        ScribblerError::InvalidResponse {
            opcode,
            reason: reason.into(),
        }
    }
}
