//! Abstract surface of the vendor camera driver.
//!
//! The adapter never talks to driver libraries directly; everything it needs
//! from a camera is expressed by the [`Transport`] and [`Device`] traits so
//! sessions can run against real hardware bindings or the in-process
//! simulator alike.

pub mod runtime;
pub mod sim;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

use crate::handoff::BufferRef;

/// Status codes a driver reports back, independent of any vendor numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("entity not found")]
    NotFound,
    #[error("invalid value")]
    InvalidValue,
    #[error("out of device resources")]
    Resources,
    #[error("device busy")]
    Busy,
    #[error("operation not supported")]
    Unsupported,
    #[error("device unreachable")]
    Unreachable,
    #[error("wrong feature type")]
    WrongType,
    #[error("timed out")]
    Timeout,
}

pub type DeviceResult<T> = Result<T, DeviceError>;

/// Identity of an opened camera.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub id: String,
    pub model: String,
    pub serial: String,
}

#[derive(Debug, Clone, Copy)]
pub struct ApiVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Invoked on a driver-owned thread whenever a queued buffer has been filled.
pub type FrameCallback = Arc<dyn Fn(BufferRef) + Send + Sync>;

/// Driver library entry points shared by every camera it can open.
pub trait Transport: Send + Sync {
    /// Global driver startup; paired with [`Transport::shutdown`] through the
    /// process-wide refcount in [`runtime`].
    fn startup(&self) -> DeviceResult<()>;

    fn shutdown(&self);

    fn version(&self) -> ApiVersion;

    fn open(&self, id: &str) -> DeviceResult<Box<dyn Device>>;
}

/// One opened camera.
///
/// Features are addressed by their GenICam-style names; the typed accessors
/// keep float/int/enum/command confusion out of the callers.
pub trait Device: Send {
    fn info(&self) -> DeviceInfo;

    fn float_feature(&self, name: &str) -> DeviceResult<f64>;
    fn set_float_feature(&mut self, name: &str, value: f64) -> DeviceResult<()>;

    fn int_feature(&self, name: &str) -> DeviceResult<i64>;
    fn set_int_feature(&mut self, name: &str, value: i64) -> DeviceResult<()>;

    fn enum_feature(&self, name: &str) -> DeviceResult<String>;
    fn set_enum_feature(&mut self, name: &str, value: &str) -> DeviceResult<()>;

    /// (min, max) for an integer feature.
    fn int_range(&self, name: &str) -> DeviceResult<(i64, i64)>;

    /// Step between valid values of an integer feature.
    fn int_increment(&self, name: &str) -> DeviceResult<i64>;

    /// Currently selectable entries of an enumerated feature.
    fn enum_entries(&self, name: &str) -> DeviceResult<Vec<String>>;

    /// Fires an asynchronous command feature; completion is observed through
    /// [`Device::command_done`].
    fn run_command(&mut self, name: &str) -> DeviceResult<()>;
    fn command_done(&self, name: &str) -> DeviceResult<bool>;

    /// Bytes one frame occupies under the current device configuration.
    fn payload_size(&self) -> DeviceResult<usize>;

    /// Applies a vendor settings description wholesale.
    fn load_settings(&mut self, path: &Path) -> DeviceResult<()>;

    /// Registers a buffer's memory so capture may fill it.
    fn announce_buffer(&mut self, buffer: BufferRef) -> DeviceResult<()>;

    /// Releases the driver-side registration of an announced buffer.
    fn revoke_buffer(&mut self, buffer: &BufferRef) -> DeviceResult<()>;

    /// Hands an announced buffer to the capture engine; `callback` fires on
    /// the driver thread once the buffer is filled.
    fn queue_buffer(&mut self, buffer: BufferRef, callback: FrameCallback) -> DeviceResult<()>;

    fn start_capture(&mut self) -> DeviceResult<()>;
    fn end_capture(&mut self) -> DeviceResult<()>;

    /// Returns every buffer still sitting in the driver's capture queue.
    /// After this completes no further callbacks fire until buffers are
    /// queued again.
    fn flush_capture_queue(&mut self) -> DeviceResult<()>;

    fn close(&mut self);
}
