//! Artemis bridges industrial cameras to streaming media pipelines.
//!
//! A fixed pool of frame buffers cycles through the camera driver: each
//! buffer is announced once, queued to the capture engine, filled by the
//! driver thread, handed to the consumer through a thread-safe queue, copied
//! into an output buffer and queued again. The [`CameraCapture`] state
//! machine coordinates connection, feature configuration, pixel-format
//! negotiation and the start/stop lifecycle; [`device::Transport`] and
//! [`device::Device`] abstract the vendor driver so sessions run against
//! real bindings or the built-in simulator in [`device::sim`].

pub mod acquisition;
pub mod device;
pub mod error;
pub mod features;
pub mod format;
pub mod handoff;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use acquisition::consumer::{OutputFrame, Pulled, VideoLayout, MAX_PLANES, PULL_POLL_INTERVAL};
pub use acquisition::pool::FRAME_BUFFER_COUNT;
pub use acquisition::{CameraCapture, FeatureSnapshot, MediaCaps, SessionState};
pub use error::CaptureError;
pub use format::{FormatFamily, MediaFormat};
pub use handoff::FrameStatus;

/// Mode of the automatic device features (exposure, white balance).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AutoMode {
    /// User controlled via the corresponding manual feature.
    #[default]
    Off,
    /// Adjusted once by the device, then back to `Off`.
    Once,
    /// Constantly adjusted by the device.
    Continuous,
}

impl AutoMode {
    pub fn as_device_value(self) -> &'static str {
        match self {
            AutoMode::Off => "Off",
            AutoMode::Once => "Once",
            AutoMode::Continuous => "Continuous",
        }
    }
}

/// Trigger to configure. Not every camera supports every selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerSelector {
    AcquisitionStart,
    AcquisitionEnd,
    AcquisitionActive,
    FrameStart,
    FrameEnd,
    FrameActive,
    FrameBurstStart,
    FrameBurstEnd,
    FrameBurstActive,
    LineStart,
    ExposureStart,
    ExposureEnd,
    ExposureActive,
}

impl TriggerSelector {
    pub fn as_device_value(self) -> &'static str {
        match self {
            TriggerSelector::AcquisitionStart => "AcquisitionStart",
            TriggerSelector::AcquisitionEnd => "AcquisitionEnd",
            TriggerSelector::AcquisitionActive => "AcquisitionActive",
            TriggerSelector::FrameStart => "FrameStart",
            TriggerSelector::FrameEnd => "FrameEnd",
            TriggerSelector::FrameActive => "FrameActive",
            TriggerSelector::FrameBurstStart => "FrameBurstStart",
            TriggerSelector::FrameBurstEnd => "FrameBurstEnd",
            TriggerSelector::FrameBurstActive => "FrameBurstActive",
            TriggerSelector::LineStart => "LineStart",
            TriggerSelector::ExposureStart => "ExposureStart",
            TriggerSelector::ExposureEnd => "ExposureEnd",
            TriggerSelector::ExposureActive => "ExposureActive",
        }
    }
}

/// Whether the selected trigger is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerMode {
    Off,
    On,
}

impl TriggerMode {
    pub fn as_device_value(self) -> &'static str {
        match self {
            TriggerMode::Off => "Off",
            TriggerMode::On => "On",
        }
    }
}

/// Signal feeding the selected trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerSource {
    Line0,
    Line1,
    Line2,
    Line3,
    Action0,
    Action1,
    Action2,
    Action3,
}

impl TriggerSource {
    pub fn as_device_value(self) -> &'static str {
        match self {
            TriggerSource::Line0 => "Line0",
            TriggerSource::Line1 => "Line1",
            TriggerSource::Line2 => "Line2",
            TriggerSource::Line3 => "Line3",
            TriggerSource::Action0 => "Action0",
            TriggerSource::Action1 => "Action1",
            TriggerSource::Action2 => "Action2",
            TriggerSource::Action3 => "Action3",
        }
    }
}

/// Edge or level of the source signal that fires the trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerActivation {
    RisingEdge,
    FallingEdge,
    AnyEdge,
    LevelHigh,
    LevelLow,
}

impl TriggerActivation {
    pub fn as_device_value(self) -> &'static str {
        match self {
            TriggerActivation::RisingEdge => "RisingEdge",
            TriggerActivation::FallingEdge => "FallingEdge",
            TriggerActivation::AnyEdge => "AnyEdge",
            TriggerActivation::LevelHigh => "LevelHigh",
            TriggerActivation::LevelLow => "LevelLow",
        }
    }
}

/// What to do with frames whose transfer was interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IncompleteFramePolicy {
    /// Requeue without emitting.
    #[default]
    Drop,
    /// Emit flagged; trailing regions may hold stale data.
    Submit,
}

/// Who provides the frame buffer memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AllocationMode {
    /// The adapter allocates aligned memory and announces it.
    #[default]
    SelfAllocated,
    /// The driver's transport layer provides memory on announcement.
    TransportAllocated,
}

/// Placement of the region of interest along one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Placement {
    Pixels(i64),
    /// Center the region on the sensor, honoring the device value lattice.
    Centered,
}

impl Default for Placement {
    fn default() -> Self {
        Placement::Pixels(0)
    }
}

/// Everything the host can configure about a capture session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Identifier of the camera to record from.
    pub camera_id: String,
    /// Vendor settings description applied wholesale on start. When set,
    /// the individual feature fields below are ignored; pixel format stays
    /// governed by the committed media format either way.
    pub settings_file: Option<PathBuf>,
    /// Exposure duration in microseconds; only applied when positive.
    pub exposure_time: f64,
    pub exposure_auto: AutoMode,
    pub balance_white_auto: AutoMode,
    /// Amplification applied to the video signal.
    pub gain: f64,
    pub offset_x: Placement,
    pub offset_y: Placement,
    /// Region width in pixels; unset means full sensor width.
    pub width: Option<i64>,
    /// Region height in pixels; unset means full sensor height.
    pub height: Option<i64>,
    /// Trigger fields left unset keep the device's current value.
    pub trigger_selector: Option<TriggerSelector>,
    pub trigger_mode: Option<TriggerMode>,
    pub trigger_source: Option<TriggerSource>,
    pub trigger_activation: Option<TriggerActivation>,
    pub incomplete_frame_policy: IncompleteFramePolicy,
    pub allocation_mode: AllocationMode,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            camera_id: String::new(),
            settings_file: None,
            exposure_time: 0.0,
            exposure_auto: AutoMode::Off,
            balance_white_auto: AutoMode::Off,
            gain: 0.0,
            offset_x: Placement::default(),
            offset_y: Placement::default(),
            width: None,
            height: None,
            trigger_selector: None,
            trigger_mode: None,
            trigger_source: None,
            trigger_activation: None,
            incomplete_frame_policy: IncompleteFramePolicy::Drop,
            allocation_mode: AllocationMode::SelfAllocated,
        }
    }
}

/// Clock the host pipeline timestamps frames with.
pub trait PipelineClock: Send + Sync {
    /// Current pipeline time minus the pipeline base time.
    fn running_time(&self) -> Duration;
}

/// Hooks the host pipeline supplies to a capture session: the running flag
/// the consumer's wait polls, and an optional timestamp clock.
#[derive(Clone)]
pub struct PipelineHandle {
    running: Arc<AtomicBool>,
    clock: Option<Arc<dyn PipelineClock>>,
}

impl PipelineHandle {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(true)),
            clock: None,
        }
    }

    pub fn with_clock(clock: Arc<dyn PipelineClock>) -> Self {
        Self {
            running: Arc::new(AtomicBool::new(true)),
            clock: Some(clock),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Clearing the flag cancels an in-flight pull within one poll interval.
    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub fn running_time(&self) -> Option<Duration> {
        self.clock.as_ref().map(|clock| clock.running_time())
    }
}

impl Default for PipelineHandle {
    fn default() -> Self {
        Self::new()
    }
}
