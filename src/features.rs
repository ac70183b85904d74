//! Typed access to named device features.
//!
//! Thin wrappers over the raw get/set surface that add the logging and
//! best-effort semantics bulk configuration relies on: a failed setter is
//! reported and returned, never panicked on, so callers can continue with
//! the remaining features.

use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::device::{Device, DeviceError, DeviceResult};
use crate::error::CaptureError;

/// GenICam SFNC feature names used by the adapter.
pub mod feature {
    pub const EXPOSURE_TIME: &str = "ExposureTime";
    /// Pre-SFNC name some older cameras still use for the exposure feature.
    pub const EXPOSURE_TIME_LEGACY: &str = "ExposureTimeAbs";
    pub const EXPOSURE_AUTO: &str = "ExposureAuto";
    pub const BALANCE_WHITE_AUTO: &str = "BalanceWhiteAuto";
    pub const GAIN: &str = "Gain";
    pub const WIDTH: &str = "Width";
    pub const HEIGHT: &str = "Height";
    pub const OFFSET_X: &str = "OffsetX";
    pub const OFFSET_Y: &str = "OffsetY";
    pub const PIXEL_FORMAT: &str = "PixelFormat";
    pub const TRIGGER_SELECTOR: &str = "TriggerSelector";
    pub const TRIGGER_MODE: &str = "TriggerMode";
    pub const TRIGGER_SOURCE: &str = "TriggerSource";
    pub const TRIGGER_ACTIVATION: &str = "TriggerActivation";
    pub const ACQUISITION_START: &str = "AcquisitionStart";
    pub const ACQUISITION_STOP: &str = "AcquisitionStop";
    pub const STREAM_BUFFER_ALIGNMENT: &str = "StreamBufferAlignment";
    pub const ADJUST_PACKET_SIZE: &str = "GVSPAdjustPacketSize";
}

const COMMAND_POLL_INTERVAL: Duration = Duration::from_millis(1);
/// Asynchronous command features must report completion within this window.
pub const COMMAND_DEADLINE: Duration = Duration::from_secs(2);

pub fn set_float(
    device: &mut dyn Device,
    name: &'static str,
    value: f64,
) -> Result<(), CaptureError> {
    debug!("Setting \"{name}\" to {value}");
    match device.set_float_feature(name, value) {
        Ok(()) => {
            debug!("Setting was changed successfully");
            Ok(())
        }
        Err(source) => {
            warn!("Failed to set \"{name}\" to {value}: {source}");
            Err(CaptureError::FeatureRejected { feature: name, source })
        }
    }
}

pub fn set_int(
    device: &mut dyn Device,
    name: &'static str,
    value: i64,
) -> Result<(), CaptureError> {
    debug!("Setting \"{name}\" to {value}");
    match device.set_int_feature(name, value) {
        Ok(()) => {
            debug!("Setting was changed successfully");
            Ok(())
        }
        Err(source) => {
            warn!("Failed to set \"{name}\" to {value}: {source}");
            Err(CaptureError::FeatureRejected { feature: name, source })
        }
    }
}

/// Sets an enumerated feature; a rejected value additionally reports what the
/// device would currently accept.
pub fn set_enum(
    device: &mut dyn Device,
    name: &'static str,
    value: &str,
) -> Result<(), CaptureError> {
    debug!("Setting \"{name}\" to {value}");
    match device.set_enum_feature(name, value) {
        Ok(()) => {
            debug!("Setting was changed successfully");
            Ok(())
        }
        Err(source) => {
            error!("Failed to set \"{name}\" to {value}: {source}");
            if source == DeviceError::InvalidValue {
                log_enum_entries(device, name);
            }
            Err(CaptureError::FeatureRejected { feature: name, source })
        }
    }
}

/// Reports the entries the device currently accepts for an enumerated
/// feature, to accompany an invalid-value rejection.
pub fn log_enum_entries(device: &dyn Device, name: &str) {
    match device.enum_entries(name) {
        Ok(entries) => {
            error!("The following values for the \"{name}\" feature are available:");
            for entry in entries {
                error!("    {entry}");
            }
        }
        Err(err) => error!("Could not list available values for \"{name}\": {err}"),
    }
}

/// Fires a command feature and waits for the device to report completion.
///
/// Completion polling is bounded: a device that never reports done fails
/// with [`DeviceError::Timeout`] instead of hanging the caller.
pub fn run_command_to_completion(device: &mut dyn Device, name: &str) -> DeviceResult<()> {
    debug!("Running \"{name}\" command");
    device.run_command(name)?;
    let deadline = Instant::now() + COMMAND_DEADLINE;
    loop {
        if device.command_done(name)? {
            return Ok(());
        }
        if Instant::now() >= deadline {
            warn!("Command \"{name}\" did not complete within {COMMAND_DEADLINE:?}");
            return Err(DeviceError::Timeout);
        }
        thread::sleep(COMMAND_POLL_INTERVAL);
    }
}

/// Snaps `value` onto the feature's value lattice `min + k * step`, clamped
/// to `[min, max]`. Half-distance ties take the lower lattice point.
pub fn round_to_increment(value: i64, min: i64, max: i64, step: i64) -> i64 {
    if max < min {
        return value;
    }
    if step <= 1 {
        return value.clamp(min, max);
    }
    let clamped = value.clamp(min, max);
    let remainder = (clamped - min) % step;
    let mut snapped = if remainder * 2 <= step {
        clamped - remainder
    } else {
        clamped - remainder + step
    };
    // max itself may sit off the lattice.
    let top = min + ((max - min) / step) * step;
    if snapped > top {
        snapped = top;
    }
    snapped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_on_the_lattice_pass_through() {
        assert_eq!(round_to_increment(640, 0, 1280, 4), 640);
        assert_eq!(round_to_increment(0, 0, 1280, 4), 0);
        assert_eq!(round_to_increment(1280, 0, 1280, 4), 1280);
    }

    #[test]
    fn off_lattice_values_snap_to_nearest() {
        assert_eq!(round_to_increment(641, 0, 1280, 4), 640);
        assert_eq!(round_to_increment(643, 0, 1280, 4), 644);
        assert_eq!(round_to_increment(5, 2, 100, 3), 5);
        assert_eq!(round_to_increment(6, 2, 100, 3), 5);
    }

    #[test]
    fn half_distance_ties_round_down() {
        assert_eq!(round_to_increment(642, 0, 1280, 4), 640);
        assert_eq!(round_to_increment(646, 0, 1280, 4), 644);
        assert_eq!(round_to_increment(3, 0, 100, 2), 2);
    }

    #[test]
    fn results_are_clamped_to_the_range() {
        assert_eq!(round_to_increment(-17, 0, 1280, 4), 0);
        assert_eq!(round_to_increment(5000, 0, 1280, 4), 1280);
        // Largest lattice point below an off-lattice maximum.
        assert_eq!(round_to_increment(5000, 0, 1282, 4), 1280);
    }

    #[test]
    fn degenerate_steps_fall_back_to_clamping() {
        assert_eq!(round_to_increment(7, 0, 10, 1), 7);
        assert_eq!(round_to_increment(7, 0, 10, 0), 7);
        assert_eq!(round_to_increment(42, 0, 10, 0), 10);
    }
}
