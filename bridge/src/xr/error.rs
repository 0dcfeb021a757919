//! Runtime result codes the bridge reacts to.

use thiserror::Error;

/// Failure reported by an [`XrRuntime`](super::runtime::XrRuntime) call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    #[error("form factor unavailable")]
    FormFactorUnavailable,
    #[error("extension not present: {0}")]
    ExtensionNotPresent(String),
    #[error("API layer not present: {0}")]
    ApiLayerNotPresent(String),
    #[error("session not running")]
    SessionNotRunning,
    #[error("session not ready")]
    SessionNotReady,
    #[error("session not stopping")]
    SessionNotStopping,
    #[error("path invalid: {0}")]
    PathInvalid(String),
    #[error("path unsupported: {0}")]
    PathUnsupported(String),
    #[error("action type mismatch: expected {expected}, got {actual}")]
    ActionTypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },
    #[error("call order invalid: {0}")]
    CallOrderInvalid(&'static str),
    #[error("validation failure: {0}")]
    ValidationFailure(String),
    #[error("handle invalid")]
    HandleInvalid,
    #[error("instance lost")]
    InstanceLost,
    #[error("session lost")]
    SessionLost,
    #[error("graphics binding unsupported: {0}")]
    GraphicsBindingUnsupported(&'static str),
    #[error("runtime error {code}: {message}")]
    Other { code: i32, message: String },
}

impl RuntimeError {
    /// Errors after which the instance or session cannot be used again.
    pub fn is_loss(&self) -> bool {
        matches!(self, Self::InstanceLost | Self::SessionLost)
    }
}

pub type XrResult<T> = Result<T, RuntimeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = RuntimeError::ExtensionNotPresent("XR_EXT_debug_utils".into());
        assert_eq!(e.to_string(), "extension not present: XR_EXT_debug_utils");
        let e = RuntimeError::ActionTypeMismatch {
            expected: "boolean",
            actual: "float",
        };
        assert!(e.to_string().contains("expected boolean"));
    }

    #[test]
    fn test_loss_classification() {
        assert!(RuntimeError::SessionLost.is_loss());
        assert!(RuntimeError::InstanceLost.is_loss());
        assert!(!RuntimeError::SessionNotRunning.is_loss());
    }
}
