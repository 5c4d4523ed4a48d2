//! Error types shared by the coordinators and device backends.

use thiserror::Error;

/// Failure to acquire a capture or output device.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AcquisitionError {
    #[error("permission denied")]
    PermissionDenied,

    #[error("no device available")]
    NoDevice,

    #[error("device busy")]
    DeviceBusy,

    #[error("stream inactive right after acquisition")]
    StreamInactive,

    #[error("backend error: {0}")]
    Backend(String),
}

/// Failure reported by a device primitive (start, pause, load, ...).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// The underlying stream is gone.
    #[error("device is no longer active")]
    Inactive,

    /// The device refused the instruction in its current condition.
    #[error("device rejected instruction: {0}")]
    Rejected(String),
}

/// Errors surfaced by [`CaptureCoordinator`](crate::CaptureCoordinator) and
/// [`PlaybackCoordinator`](crate::PlaybackCoordinator).
///
/// None of these are fatal. The coordinator state is left unchanged, except
/// for [`CoordinatorError::DeviceInactive`] which resets the capture session to
/// `UnInitialized` so the next call re-acquires.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("device acquisition failed: {0}")]
    Acquisition(#[from] AcquisitionError),

    #[error("device became inactive")]
    DeviceInactive,

    #[error("{operation} is not valid while {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    #[error("{operation} did not take effect: expected {expected}, device reports {actual}")]
    TransitionFailed {
        operation: &'static str,
        expected: String,
        actual: String,
    },
}

impl CoordinatorError {
    pub(crate) fn invalid_state(operation: &'static str, state: impl ToString) -> Self {
        Self::InvalidState {
            operation,
            state: state.to_string(),
        }
    }

    pub(crate) fn transition_failed(
        operation: &'static str,
        expected: impl ToString,
        actual: impl ToString,
    ) -> Self {
        Self::TransitionFailed {
            operation,
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Whether this error came from device acquisition.
    pub fn is_acquisition(&self) -> bool {
        matches!(self, Self::Acquisition(_))
    }
}
