use thiserror::Error;

/// Capture subsystem errors.
///
/// Builder-stage failures (`GraphCreation` through `Connection`) name the
/// exact stage that failed so device quirks are diagnosable without string
/// matching. State-machine misuse (`AlreadyRunning`, `NotRunning`,
/// `ConcurrentState`) is surfaced to the caller without side effects.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("device enumeration failed: {0}")]
    Enumeration(String),

    #[error("filter graph creation failed: {0}")]
    GraphCreation(String),

    #[error("frame sink insertion failed: {0}")]
    SinkInsert(String),

    #[error("media type negotiation failed: {0}")]
    MediaNegotiation(String),

    #[error("device binding failed: {0}")]
    DeviceBind(String),

    #[error("pin connection failed: {0}")]
    Connection(String),

    #[error("device index {index} out of range, catalog holds {count} devices")]
    InvalidDeviceIndex { index: usize, count: usize },

    #[error("capture session already running")]
    AlreadyRunning,

    #[error("capture session is not running")]
    NotRunning,

    #[error("start/stop called concurrently")]
    ConcurrentState,

    #[error("image encoding failed: {0}")]
    Encode(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("destination directory unavailable: {0}")]
    Path(String),

    #[error("capture pipeline fault: {0}")]
    PipelineFault(String),
}

/// Convenience Result alias.
pub type Result<T> = std::result::Result<T, CaptureError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_index_message_names_index_and_count() {
        let err = CaptureError::InvalidDeviceIndex { index: 3, count: 1 };
        let msg = err.to_string();
        assert!(msg.contains('3'), "got: {msg}");
        assert!(msg.contains('1'), "got: {msg}");
    }

    #[test]
    fn io_error_converts_via_from() {
        fn fails() -> Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"))?;
            Ok(())
        }
        assert!(matches!(fails(), Err(CaptureError::Io(_))));
    }

    #[test]
    fn builder_stages_are_distinct_kinds() {
        let stages = [
            CaptureError::GraphCreation("x".into()).to_string(),
            CaptureError::SinkInsert("x".into()).to_string(),
            CaptureError::MediaNegotiation("x".into()).to_string(),
            CaptureError::DeviceBind("x".into()).to_string(),
            CaptureError::Connection("x".into()).to_string(),
        ];
        for (i, a) in stages.iter().enumerate() {
            for b in stages.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }
}
