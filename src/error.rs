use thiserror::Error;

/// Errors produced by the step control core.
///
/// Variants carry their detail as a formatted message rather than a boxed
/// source so the error stays `Clone`: a resolved step outcome is observed by
/// any number of concurrent waiters, each of which receives its own copy.
#[derive(Error, Debug, Clone)]
pub enum ControlError {
    #[error("precondition violated: {message}")]
    Precondition { message: String },

    #[error("failed to decode shared field: {message}")]
    Decode { message: String },

    #[error("shared memory error: {message}")]
    SharedMemory { message: String },

    #[error("configuration error: {message}")]
    Config { message: String },

    #[error("deadline exceeded: {message}")]
    Timeout { message: String },

    #[error("step was cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, ControlError>;

// Convenience constructors
impl ControlError {
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition {
            message: message.into(),
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    pub fn shared_memory(message: impl Into<String>) -> Self {
        Self::SharedMemory {
            message: message.into(),
        }
    }

    pub fn shared_memory_with_source(
        message: impl Into<String>,
        source: impl std::fmt::Display,
    ) -> Self {
        Self::SharedMemory {
            message: format!("{}: {}", message.into(), source),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::fmt::Display,
    ) -> Self {
        Self::Config {
            message: format!("{}: {}", message.into(), source),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }
}
