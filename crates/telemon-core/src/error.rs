use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Process not found: {0}")]
    ProcessNotFound(String),

    #[error("Failed to open process: {0}")]
    ProcessOpenFailed(String),

    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("No matching address: {0}")]
    NotFound(String),

    #[error("Failed to read process memory at address {address:#x}: {message}")]
    ReadFailed { address: u64, message: String },

    #[error("Verification failed: {0}")]
    Verification(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Check whether this error is a transient read failure that a scan
    /// recovers from by skipping the affected region.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::ReadFailed { .. })
    }

    pub fn read_failed(address: u64, message: impl Into<String>) -> Self {
        Error::ReadFailed {
            address,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::read_failed(0x1000, "gone").is_transient());
        assert!(!Error::NotFound("no candidate".to_string()).is_transient());
        assert!(!Error::Verification("prefix mismatch".to_string()).is_transient());
    }

    #[test]
    fn test_read_failed_display() {
        let err = Error::read_failed(0x7FF6_0000, "region unmapped");
        let msg = err.to_string();
        assert!(msg.contains("0x7ff60000"));
        assert!(msg.contains("region unmapped"));
    }
}
