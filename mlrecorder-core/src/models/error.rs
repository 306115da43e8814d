use std::io;

use thiserror::Error;

use super::recording_type::RecordingType;

/// Errors that can occur while opening, recording or finalizing a session.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),

    #[error("{requested} cannot start while {active} is active")]
    ResourceBusy {
        requested: RecordingType,
        active: RecordingType,
    },

    #[error("output path is not writable: {0}")]
    PathUnwritable(String),

    #[error("disk full: {0}")]
    DiskFull(String),

    #[error("i/o error: {0}")]
    Io(String),

    #[error("capture interrupted: {0}")]
    Interrupted(String),

    #[error("device did not respond within {0} ms")]
    UnresponsiveDevice(u64),

    #[error("writer already finalized")]
    WriterClosed,

    #[error("configuration failed: {0}")]
    ConfigurationFailed(String),

    #[error("recorder has been shut down")]
    ShutDown,
}

impl CaptureError {
    /// Map an I/O error raised while writing or finalizing output.
    pub fn from_io(err: &io::Error, context: &str) -> Self {
        match err.kind() {
            io::ErrorKind::StorageFull => Self::DiskFull(format!("{context}: {err}")),
            _ => Self::Io(format!("{context}: {err}")),
        }
    }

    /// Map an I/O error raised while creating an output file or directory.
    pub fn from_create(err: &io::Error, context: &str) -> Self {
        match err.kind() {
            io::ErrorKind::StorageFull => Self::DiskFull(format!("{context}: {err}")),
            _ => Self::PathUnwritable(format!("{context}: {err}")),
        }
    }

    /// Errors returned synchronously from `start()` that never leave a registry entry.
    pub fn is_start_error(&self) -> bool {
        matches!(
            self,
            Self::DeviceUnavailable(_)
                | Self::PermissionDenied(_)
                | Self::FormatNegotiationFailed(_)
                | Self::ResourceBusy { .. }
                | Self::PathUnwritable(_)
                | Self::DiskFull(_)
        )
    }

    pub fn is_interruption(&self) -> bool {
        matches!(self, Self::Interrupted(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_full_maps_to_disk_full() {
        let err = io::Error::from(io::ErrorKind::StorageFull);
        assert!(matches!(CaptureError::from_io(&err, "write"), CaptureError::DiskFull(_)));
        assert!(matches!(CaptureError::from_create(&err, "create"), CaptureError::DiskFull(_)));
    }

    #[test]
    fn create_errors_map_to_unwritable() {
        let err = io::Error::from(io::ErrorKind::PermissionDenied);
        assert!(matches!(
            CaptureError::from_create(&err, "create"),
            CaptureError::PathUnwritable(_)
        ));
        assert!(matches!(CaptureError::from_io(&err, "write"), CaptureError::Io(_)));
    }

    #[test]
    fn resource_busy_names_both_types() {
        let err = CaptureError::ResourceBusy {
            requested: RecordingType::MixSystemMic,
            active: RecordingType::Microphone,
        };
        let text = err.to_string();
        assert!(text.contains("mix-system-mic"));
        assert!(text.contains("microphone"));
        assert!(err.is_start_error());
    }
}
