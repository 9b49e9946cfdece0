use thiserror::Error;

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("broker configuration is missing required parameters (user, password)")]
    MissingCredentials,
    #[error("transport initialization failed: {0}")]
    Initialization(String),
    #[error("transport is not initialized properly; record dropped")]
    NotInitialized,
    #[error("failed to dispatch record: {0}")]
    Dispatch(String),
    #[error("transport is closed")]
    Closed,
    #[error("process metrics provider unavailable: {0}")]
    ProbeUnavailable(String),
    #[error("IO error in telemetry transport {0}")]
    Io(#[from] std::io::Error),
    #[error("couldnt serialize record: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("failed to set TelemetryLogger: {0}")]
    Logger(#[from] log::SetLoggerError),
    #[cfg(feature = "amqp")]
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),
}

impl TelemetryError {
    /// Whether the error means the broker channel it came from can no longer be trusted.
    #[must_use]
    pub const fn invalidates_connection(&self) -> bool {
        !matches!(
            self,
            Self::Serialization(_) | Self::MissingCredentials | Self::NotInitialized | Self::Closed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_errors_invalidate_connections() {
        assert!(TelemetryError::Dispatch("broken pipe".into()).invalidates_connection());
        assert!(TelemetryError::Io(std::io::ErrorKind::BrokenPipe.into()).invalidates_connection());
        assert!(!TelemetryError::Closed.invalidates_connection());
        assert!(!TelemetryError::NotInitialized.invalidates_connection());
    }

    #[test]
    fn display_mentions_cause() {
        let err = TelemetryError::Initialization("connection refused".into());
        assert_eq!(
            err.to_string(),
            "transport initialization failed: connection refused"
        );
    }
}
