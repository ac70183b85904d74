//! Error taxonomy for the acquisition adapter.

use std::path::PathBuf;

use thiserror::Error;

use crate::device::DeviceError;

/// Failures surfaced by the capture session.
///
/// Per-feature rejections are recovered locally during bulk configuration
/// (logged and skipped); the remaining variants are structural and abort the
/// operation that produced them.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The camera identifier did not resolve to an openable device.
    #[error("could not open camera \"{id}\": {source}")]
    DeviceOpen {
        id: String,
        #[source]
        source: DeviceError,
    },

    /// The device rejected a named feature access.
    #[error("device rejected feature \"{feature}\": {source}")]
    FeatureRejected {
        feature: &'static str,
        #[source]
        source: DeviceError,
    },

    /// A settings description could not be applied wholesale.
    #[error("could not load settings from {path:?}: {source}")]
    SettingsLoad {
        path: PathBuf,
        #[source]
        source: DeviceError,
    },

    /// Frame buffer allocation or announcement failed.
    #[error("frame buffer allocation failed: {0}")]
    ResourceExhausted(#[source] DeviceError),

    /// The capture engine could not be brought up.
    #[error("could not start acquisition: {0}")]
    CaptureStart(#[source] DeviceError),

    /// The capture engine could not be torn down cleanly.
    #[error("could not stop acquisition: {0}")]
    CaptureStop(#[source] DeviceError),

    /// No device pixel format maps to the requested media format.
    #[error("no device pixel format maps to media format \"{requested}\"")]
    FormatNegotiation { requested: &'static str },

    /// The operation requires a connected camera.
    #[error("camera is not connected")]
    NotConnected,
}
