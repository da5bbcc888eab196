use crate::capture::CaptureError;
use crate::config::ConfigError;
use crate::injector::InjectError;
use shared::ChannelError;
use thiserror::Error;

/// Coarse failure category, deciding what the caller should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Target process or window not found. Retry after user action.
    Discovery,
    /// The OS denied access to the target. Retry elevated.
    Privilege,
    /// Control channel collision or version mismatch. Fatal to this connection attempt.
    Protocol,
    /// Capture failed or produced no frame. Retryable.
    Capture,
    /// The payload did not load in time or the loader reported failure.
    Injection,
    /// An operating system call failed for a reason outside this taxonomy. Retryable.
    System,
    /// Not available on this platform, or not implemented.
    Unsupported,
    /// Invalid configuration or call sequence.
    Usage,
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("target process '{0}' not found")]
    ProcessNotFound(String),

    #[error("target window not found: {0}")]
    WindowNotFound(String),

    #[error("controller is not connected")]
    NotConnected,

    #[error("{0} is not implemented")]
    Unimplemented(&'static str),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Inject(#[from] InjectError),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ControllerError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::ProcessNotFound(_) | Self::WindowNotFound(_) => ErrorClass::Discovery,
            Self::NotConnected => ErrorClass::Usage,
            Self::Unimplemented(_) => ErrorClass::Unsupported,
            Self::Channel(err) => match err {
                ChannelError::NotFound { .. } => ErrorClass::Discovery,
                ChannelError::AccessDenied { .. } => ErrorClass::Privilege,
                ChannelError::TooSmall { .. } => ErrorClass::Usage,
                ChannelError::ProtocolMismatch { .. } | ChannelError::Incompatible { .. } => {
                    ErrorClass::Protocol
                }
                ChannelError::Os { .. } => ErrorClass::System,
            },
            Self::Inject(err) => err.class(),
            Self::Capture(CaptureError::Unsupported) => ErrorClass::Unsupported,
            Self::Capture(CaptureError::InvalidWindow(_)) => ErrorClass::Discovery,
            Self::Capture(_) => ErrorClass::Capture,
            Self::Config(_) => ErrorClass::Usage,
        }
    }

    /// Actionable advice for the user, if there is any.
    pub fn hint(&self) -> Option<&'static str> {
        match self.class() {
            ErrorClass::Privilege => Some("run the controller with administrator privileges"),
            ErrorClass::Discovery => Some("make sure the target is running and its window exists"),
            ErrorClass::Protocol => Some("another controller build owns the control channel; close it first"),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn privilege_errors_hint_at_elevation() {
        let err = ControllerError::from(InjectError::AccessDenied {
            pid: 42,
            message: "Access is denied.".into(),
        });
        assert_eq!(err.class(), ErrorClass::Privilege);
        assert!(err.hint().unwrap().contains("administrator"));
        assert!(err.to_string().contains("42"));
    }

    #[test]
    fn pid_zero_is_discovery_not_privilege() {
        let err = ControllerError::from(InjectError::ProcessNotFound { pid: 0 });
        assert_eq!(err.class(), ErrorClass::Discovery);
    }

    #[test]
    fn version_collisions_are_protocol_errors() {
        let err = ControllerError::from(ChannelError::Incompatible {
            name: "Local\\x".into(),
            found: 9,
        });
        assert_eq!(err.class(), ErrorClass::Protocol);
    }

    #[test]
    fn mapping_failures_are_not_blamed_on_another_controller() {
        let err = ControllerError::from(ChannelError::Os {
            op: "MapViewOfFile",
            name: "Local\\x".into(),
            message: "Not enough memory resources are available.".into(),
        });
        assert_eq!(err.class(), ErrorClass::System);
        assert_eq!(err.hint(), None);
    }

    #[test]
    fn missing_frames_are_capture_errors() {
        let err = ControllerError::from(CaptureError::NoFrame { waited_ms: 100 });
        assert_eq!(err.class(), ErrorClass::Capture);
        assert_eq!(err.hint(), None);
    }
}
