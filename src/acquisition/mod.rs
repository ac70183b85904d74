//! Camera connection, configuration and acquisition lifecycle.
//!
//! [`CameraCapture`] owns the opened device and moves it through
//! Disconnected -> Idle -> Acquiring. Buffers are only (re)announced and the
//! handoff queue only replaced while capture is stopped and flushed, so the
//! driver callback can never touch retired state.

pub mod consumer;
pub mod pool;

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::device::{runtime, Device, DeviceError, FrameCallback, Transport};
use crate::error::CaptureError;
use crate::features::{self, feature, round_to_increment};
use crate::format::{self, FormatFamily, MediaFormat, SupportedFormats};
use crate::handoff::{BufferRef, QueueHandle};
use crate::{
    CameraConfig, PipelineHandle, Placement, TriggerActivation, TriggerMode, TriggerSelector,
    TriggerSource,
};

use consumer::VideoLayout;
use pool::BufferPool;

/// Session state as seen by the host pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    /// Connected, not acquiring.
    Idle,
    Acquiring,
}

/// Formats and extent currently negotiable with the connected device.
#[derive(Debug, Clone)]
pub struct MediaCaps {
    pub width: i64,
    pub height: i64,
    pub raw_formats: Vec<MediaFormat>,
    pub mosaic_formats: Vec<MediaFormat>,
}

/// Current device-side values of the configurable features.
#[derive(Debug, Clone, Default)]
pub struct FeatureSnapshot {
    pub exposure_time: Option<f64>,
    pub exposure_auto: Option<String>,
    pub balance_white_auto: Option<String>,
    pub gain: Option<f64>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub offset_x: Option<i64>,
    pub offset_y: Option<i64>,
    pub trigger_selector: Option<String>,
    pub trigger_mode: Option<String>,
    pub trigger_source: Option<String>,
    pub trigger_activation: Option<String>,
}

/// Bridges one camera to the host pipeline.
pub struct CameraCapture {
    transport: Arc<dyn Transport>,
    pub(crate) config: CameraConfig,
    pub(crate) pipeline: PipelineHandle,
    pub(crate) device: Option<Box<dyn Device>>,
    formats: SupportedFormats,
    pool: BufferPool,
    pub(crate) queue: Arc<QueueHandle>,
    pub(crate) frame_callback: FrameCallback,
    state: SessionState,
    pub(crate) layout: Option<VideoLayout>,
    pub(crate) frames_pushed: u64,
}

impl CameraCapture {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: CameraConfig,
        pipeline: PipelineHandle,
    ) -> Self {
        // The driver thread's entire duty: push the filled descriptor onto
        // the queue its context points at.
        let frame_callback: FrameCallback = Arc::new(|buffer: BufferRef| buffer.hand_to_queue());
        Self {
            transport,
            config,
            pipeline,
            device: None,
            formats: SupportedFormats::default(),
            pool: BufferPool::default(),
            queue: QueueHandle::new(),
            frame_callback,
            state: SessionState::Disconnected,
            layout: None,
            frames_pushed: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &CameraConfig {
        &self.config
    }

    fn device_mut(&mut self) -> Result<&mut (dyn Device + 'static), CaptureError> {
        self.device.as_deref_mut().ok_or(CaptureError::NotConnected)
    }

    /// Opens the configured camera and prepares the session for negotiation.
    ///
    /// Packet size negotiation is advisory; only a failing open is fatal.
    pub fn connect(&mut self) -> Result<(), CaptureError> {
        if self.device.is_some() {
            return Ok(());
        }

        runtime::acquire(self.transport.as_ref()).map_err(|source| CaptureError::DeviceOpen {
            id: self.config.camera_id.clone(),
            source,
        })?;

        let mut device = match self.transport.open(&self.config.camera_id) {
            Ok(device) => device,
            Err(source) => {
                error!("Could not open camera \"{}\": {source}", self.config.camera_id);
                runtime::release(self.transport.as_ref());
                return Err(CaptureError::DeviceOpen {
                    id: self.config.camera_id.clone(),
                    source,
                });
            }
        };

        let info = device.info();
        info!(
            "Successfully opened camera {} (model \"{}\", serial \"{}\")",
            info.id, info.model, info.serial
        );

        // Raise the transport packet size where the link supports it.
        match features::run_command_to_completion(device.as_mut(), feature::ADJUST_PACKET_SIZE) {
            Ok(()) => debug!("Negotiated maximum transport packet size"),
            Err(err) => debug!("Packet size negotiation unavailable: {err}"),
        }

        match device.enum_entries(feature::PIXEL_FORMAT) {
            Ok(available) => {
                self.formats = SupportedFormats::from_available(&available);
                debug!("Camera offers {} mappable pixel formats", self.formats.len());
            }
            Err(err) => {
                warn!("Could not query supported pixel formats: {err}");
                self.formats = SupportedFormats::default();
            }
        }

        self.layout = current_layout(device.as_mut());
        self.device = Some(device);
        self.state = SessionState::Idle;
        Ok(())
    }

    /// Closes the device and releases the driver API registration.
    pub fn disconnect(&mut self) {
        if self.device.is_none() {
            return;
        }
        if let Err(err) = self.stop_acquisition() {
            warn!("Stopping acquisition during disconnect failed: {err}");
        }
        if let Some(mut device) = self.device.take() {
            self.pool.revoke_all(device.as_mut());
            device.close();
            info!("Closed camera {}", self.config.camera_id);
        }
        self.formats = SupportedFormats::default();
        self.layout = None;
        self.state = SessionState::Disconnected;
        runtime::release(self.transport.as_ref());
    }

    /// Pipeline start: connect, then apply the configured settings.
    ///
    /// Feature-level failures are logged and do not prevent starting; only
    /// a failed open or settings-file load aborts.
    pub fn start(&mut self) -> Result<(), CaptureError> {
        self.connect()?;

        if let Some(path) = self.config.settings_file.clone() {
            warn!(
                "\"{}\" was given as settings file. Feature settings passed as individual \
                 properties will be ignored",
                path.display()
            );
            let device = self.device_mut()?;
            if let Err(source) = device.load_settings(&path) {
                error!("Could not load settings from \"{}\": {source}", path.display());
                return Err(CaptureError::SettingsLoad { path, source });
            }
        } else {
            debug!("No settings file given. Applying features from individual properties instead");
            if let Err(err) = self.configure() {
                warn!("Configuration was only partially applied: {err}");
            }
        }
        Ok(())
    }

    /// Pipeline stop: ends acquisition and releases every buffer
    /// registration. The session stays connected.
    pub fn stop(&mut self) {
        if let Err(err) = self.stop_acquisition() {
            warn!("Stopping acquisition failed: {err}");
        }
        if let Some(device) = self.device.as_deref_mut() {
            self.pool.revoke_all(device);
        }
        // Stop and flush completed above, so the swap cannot race a callback.
        self.queue.replace();
    }

    /// Applies the configured features individually, in a fixed order.
    ///
    /// Best-effort: each failure is logged and the sequence continues; the
    /// returned error is the last one encountered. Stops acquisition first
    /// when live and restarts it afterwards.
    pub fn configure(&mut self) -> Result<(), CaptureError> {
        if self.device.is_none() {
            return Err(CaptureError::NotConnected);
        }
        let was_acquiring = self.state == SessionState::Acquiring;
        if was_acquiring {
            debug!("Camera was acquiring. Stopping to change feature settings");
            self.stop_acquisition()?;
        }

        let mut outcome = Ok(());
        {
            let device = self.device.as_deref_mut().ok_or(CaptureError::NotConnected)?;
            merge(&mut outcome, apply_exposure(device, &self.config));
            merge(
                &mut outcome,
                features::set_enum(
                    device,
                    feature::EXPOSURE_AUTO,
                    self.config.exposure_auto.as_device_value(),
                ),
            );
            merge(
                &mut outcome,
                features::set_enum(
                    device,
                    feature::BALANCE_WHITE_AUTO,
                    self.config.balance_white_auto.as_device_value(),
                ),
            );
            merge(
                &mut outcome,
                features::set_float(device, feature::GAIN, self.config.gain),
            );
            merge(&mut outcome, apply_roi(device, &self.config));
            merge(&mut outcome, apply_trigger_settings(device, &self.config));
        }

        if was_acquiring {
            debug!("Camera was acquiring before changing feature settings. Restarting");
            self.start_acquisition()?;
        }
        outcome
    }

    /// Applies the configured region of interest to the sensor.
    pub fn set_region_of_interest(&mut self) -> Result<(), CaptureError> {
        let config = self.config.clone();
        apply_roi(self.device_mut()?, &config)
    }

    /// Applies the configured trigger features in device order.
    pub fn set_trigger_configuration(&mut self) -> Result<(), CaptureError> {
        let config = self.config.clone();
        apply_trigger_settings(self.device_mut()?, &config)
    }

    /// Reports the currently negotiable media formats and sensor extent.
    pub fn query_caps(&mut self) -> Result<MediaCaps, CaptureError> {
        let formats = self.formats.clone();
        let device = self.device_mut()?;
        let width = device
            .int_feature(feature::WIDTH)
            .map_err(|source| CaptureError::FeatureRejected { feature: feature::WIDTH, source })?;
        let height = device
            .int_feature(feature::HEIGHT)
            .map_err(|source| CaptureError::FeatureRejected { feature: feature::HEIGHT, source })?;

        let mut raw_formats = Vec::new();
        let mut mosaic_formats = Vec::new();
        for media in formats.media_formats() {
            let bucket = match media.family() {
                FormatFamily::Raw => &mut raw_formats,
                FormatFamily::Mosaic => &mut mosaic_formats,
            };
            if !bucket.contains(&media) {
                bucket.push(media);
            }
        }
        debug!(
            "Reporting caps {width}x{height}, {} raw and {} mosaic formats",
            raw_formats.len(),
            mosaic_formats.len()
        );
        Ok(MediaCaps { width, height, raw_formats, mosaic_formats })
    }

    /// Commits a negotiated media format and (re)starts acquisition under it.
    ///
    /// Changing the pixel format is only possible while stopped, so a live
    /// session is stopped first and the handoff queue replaced wholesale:
    /// in-flight descriptors reference the previous format's semantics.
    /// Buffers are reallocated when the new payload no longer fits them.
    pub fn commit_format(&mut self, media: MediaFormat) -> Result<(), CaptureError> {
        if self.device.is_none() {
            return Err(CaptureError::NotConnected);
        }
        debug!("Committing media format \"{media}\"");
        let Some(vendor) = self.formats.vendor_for(media) else {
            error!("Could not find a matching device pixel format for media format \"{media}\"");
            return Err(CaptureError::FormatNegotiation { requested: media.name() });
        };
        debug!("Found matching device pixel format \"{vendor}\"");

        self.stop_acquisition()?;
        // No further callbacks can fire now; swap in a fresh queue.
        self.queue.replace();

        let config_mode = self.config.allocation_mode;
        let device = self.device.as_deref_mut().ok_or(CaptureError::NotConnected)?;
        if let Err(source) = device.set_enum_feature(feature::PIXEL_FORMAT, vendor) {
            error!("Could not set \"{}\" to \"{vendor}\": {source}", feature::PIXEL_FORMAT);
            return Err(CaptureError::FormatNegotiation { requested: media.name() });
        }

        let needs_reallocation = match device.payload_size() {
            Ok(size) => self.pool.buffer_capacity() < size,
            // It might have grown; reallocating is the safe reading.
            Err(err) => {
                warn!("Could not read payload size: {err}");
                true
            }
        };
        if needs_reallocation {
            debug!("Payload size increased or unset. Reallocating frame buffers");
            self.pool.revoke_all(device);
            self.pool.allocate(device, config_mode, &self.queue)?;
        }

        let width = device
            .int_feature(feature::WIDTH)
            .map_err(|source| CaptureError::FeatureRejected { feature: feature::WIDTH, source })?;
        let height = device
            .int_feature(feature::HEIGHT)
            .map_err(|source| CaptureError::FeatureRejected { feature: feature::HEIGHT, source })?;
        self.layout = Some(VideoLayout { format: media, width, height });

        self.start_acquisition()
    }

    /// Brings the capture engine up: queues every announced buffer and runs
    /// the acquisition start command.
    ///
    /// Partially queued state after a failure is left for the caller's
    /// teardown path; a retry goes through stop first.
    pub fn start_acquisition(&mut self) -> Result<(), CaptureError> {
        if self.state == SessionState::Acquiring {
            return Ok(());
        }
        if self.device.is_none() {
            return Err(CaptureError::NotConnected);
        }
        if self.pool.is_empty() {
            warn!("No frame buffers announced; cannot start acquisition");
            return Err(CaptureError::CaptureStart(DeviceError::Resources));
        }

        // Frames captured under a previous run must not leak into this one.
        let stale = self.queue.drain();
        if stale > 0 {
            debug!("Discarded {stale} stale frames from the handoff queue");
        }

        let device = self.device.as_deref_mut().ok_or(CaptureError::NotConnected)?;
        debug!("Starting the capture engine");
        device.start_capture().map_err(CaptureError::CaptureStart)?;

        debug!("Queueing the frame buffers");
        self.pool
            .queue_all(device, &self.frame_callback)
            .map_err(CaptureError::CaptureStart)?;

        features::run_command_to_completion(device, feature::ACQUISITION_START)
            .map_err(CaptureError::CaptureStart)?;

        self.state = SessionState::Acquiring;
        Ok(())
    }

    /// Tears the capture engine down.
    ///
    /// Idempotent: when already idle this still flushes the driver queue so
    /// no buffer can stay stuck there.
    pub fn stop_acquisition(&mut self) -> Result<(), CaptureError> {
        let Some(device) = self.device.as_deref_mut() else {
            return Ok(());
        };
        let was_acquiring = self.state == SessionState::Acquiring;
        let mut result = Ok(());

        if was_acquiring {
            if let Err(err) =
                features::run_command_to_completion(device, feature::ACQUISITION_STOP)
            {
                warn!("Acquisition stop command failed: {err}");
                result = Err(CaptureError::CaptureStop(err));
            }
            debug!("Stopping the capture engine");
            if let Err(err) = device.end_capture() {
                warn!("Stopping the capture engine failed: {err}");
                result = Err(CaptureError::CaptureStop(err));
            }
        }

        debug!("Flushing the capture queue");
        if let Err(err) = device.flush_capture_queue() {
            warn!("Flushing the capture queue failed: {err}");
        }

        if was_acquiring {
            self.state = SessionState::Idle;
        }
        result
    }

    /// Reads the device's current values for every configurable feature.
    /// Individual read failures are logged and leave the field unset.
    pub fn read_back(&mut self) -> Result<FeatureSnapshot, CaptureError> {
        let device = self.device_mut()?;

        let exposure_time = match device.float_feature(feature::EXPOSURE_TIME) {
            Ok(value) => Some(value),
            Err(DeviceError::NotFound) => {
                warn!(
                    "Failed to get \"{}\". Attempting \"{}\"",
                    feature::EXPOSURE_TIME,
                    feature::EXPOSURE_TIME_LEGACY
                );
                read_float(device, feature::EXPOSURE_TIME_LEGACY)
            }
            Err(err) => {
                warn!("Failed to read \"{}\": {err}", feature::EXPOSURE_TIME);
                None
            }
        };

        Ok(FeatureSnapshot {
            exposure_time,
            exposure_auto: read_enum(device, feature::EXPOSURE_AUTO),
            balance_white_auto: read_enum(device, feature::BALANCE_WHITE_AUTO),
            gain: read_float(device, feature::GAIN),
            width: read_int(device, feature::WIDTH),
            height: read_int(device, feature::HEIGHT),
            offset_x: read_int(device, feature::OFFSET_X),
            offset_y: read_int(device, feature::OFFSET_Y),
            trigger_selector: read_enum(device, feature::TRIGGER_SELECTOR),
            trigger_mode: read_enum(device, feature::TRIGGER_MODE),
            trigger_source: read_enum(device, feature::TRIGGER_SOURCE),
            trigger_activation: read_enum(device, feature::TRIGGER_ACTIVATION),
        })
    }
}

impl Drop for CameraCapture {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Keeps the most recent failure while letting the sequence continue.
fn merge(outcome: &mut Result<(), CaptureError>, step: Result<(), CaptureError>) {
    if let Err(err) = step {
        *outcome = Err(err);
    }
}

fn apply_exposure(device: &mut dyn Device, config: &CameraConfig) -> Result<(), CaptureError> {
    if config.exposure_time <= 0.0 {
        return Ok(());
    }
    debug!("Setting \"{}\" to {}", feature::EXPOSURE_TIME, config.exposure_time);
    match device.set_float_feature(feature::EXPOSURE_TIME, config.exposure_time) {
        Ok(()) => {
            debug!("Setting was changed successfully");
            Ok(())
        }
        Err(DeviceError::NotFound) => {
            warn!(
                "Feature \"{}\" not found. Attempting \"{}\"",
                feature::EXPOSURE_TIME,
                feature::EXPOSURE_TIME_LEGACY
            );
            features::set_float(device, feature::EXPOSURE_TIME_LEGACY, config.exposure_time)
        }
        Err(source) => {
            warn!(
                "Failed to set \"{}\" to {}: {source}",
                feature::EXPOSURE_TIME,
                config.exposure_time
            );
            Err(CaptureError::FeatureRejected { feature: feature::EXPOSURE_TIME, source })
        }
    }
}

/// Applies width, height and offsets in the order the sensor requires.
fn apply_roi(device: &mut dyn Device, config: &CameraConfig) -> Result<(), CaptureError> {
    let mut outcome = Ok(());

    // A stale offset clamps the settable extent, so zero both first.
    debug!("Temporarily resetting \"OffsetX\" and \"OffsetY\" to 0");
    merge(&mut outcome, features::set_int(device, feature::OFFSET_X, 0));
    merge(&mut outcome, features::set_int(device, feature::OFFSET_Y, 0));

    let (sensor_width, width) = apply_extent(device, feature::WIDTH, config.width, &mut outcome);
    let (sensor_height, height) =
        apply_extent(device, feature::HEIGHT, config.height, &mut outcome);

    merge(
        &mut outcome,
        apply_offset(device, feature::OFFSET_X, config.offset_x, sensor_width, width),
    );
    merge(
        &mut outcome,
        apply_offset(device, feature::OFFSET_Y, config.offset_y, sensor_height, height),
    );
    outcome
}

/// Sets one extent feature, falling back to the full sensor extent when no
/// explicit value is configured. Returns (sensor extent, applied extent).
fn apply_extent(
    device: &mut dyn Device,
    name: &'static str,
    configured: Option<i64>,
    outcome: &mut Result<(), CaptureError>,
) -> (Option<i64>, Option<i64>) {
    let sensor = match device.int_range(name) {
        Ok((_, max)) => Some(max),
        Err(err) => {
            warn!("Could not query full extent for \"{name}\": {err}");
            None
        }
    };
    let target = match configured {
        Some(value) => Some(value),
        None => {
            if let Some(full) = sensor {
                debug!("No explicit \"{name}\" configured. Using full extent {full}");
            }
            sensor
        }
    };
    if let Some(value) = target {
        merge(outcome, features::set_int(device, name, value));
    }
    (sensor, target)
}

/// Sets one offset feature, resolving a centering request against the
/// device-reported value lattice.
fn apply_offset(
    device: &mut dyn Device,
    name: &'static str,
    placement: Placement,
    sensor: Option<i64>,
    extent: Option<i64>,
) -> Result<(), CaptureError> {
    let value = match placement {
        Placement::Pixels(value) => value,
        Placement::Centered => {
            let desired = match (sensor, extent) {
                (Some(sensor), Some(extent)) => (sensor - extent) / 2,
                _ => {
                    warn!("Cannot center \"{name}\" without a known sensor extent. Using 0");
                    0
                }
            };
            debug!("Centering requested for \"{name}\". Desired value {desired}");
            let valid = match device.int_range(name) {
                Ok((min, max)) => match device.int_increment(name) {
                    Ok(step) => round_to_increment(desired, min, max, step),
                    Err(err) => {
                        debug!(
                            "Error during increment query for \"{name}\". \
                             Using initial desired value: {err}"
                        );
                        desired
                    }
                },
                Err(err) => {
                    debug!(
                        "Error during range query for \"{name}\". \
                         Using initial desired value: {err}"
                    );
                    desired
                }
            };
            if valid != desired {
                debug!("Desired {name}={desired} was not valid. Using nearest valid value {valid}");
            }
            valid
        }
    };
    features::set_int(device, name, value)
}

/// Applies the configured trigger features.
///
/// Devices require this exact order: selector, activation, source, mode.
/// Unset fields leave the device value untouched.
fn apply_trigger_settings(
    device: &mut dyn Device,
    config: &CameraConfig,
) -> Result<(), CaptureError> {
    debug!("Applying trigger settings");
    let mut outcome = Ok(());
    apply_trigger_field(
        device,
        feature::TRIGGER_SELECTOR,
        config.trigger_selector.map(TriggerSelector::as_device_value),
        &mut outcome,
    );
    apply_trigger_field(
        device,
        feature::TRIGGER_ACTIVATION,
        config.trigger_activation.map(TriggerActivation::as_device_value),
        &mut outcome,
    );
    apply_trigger_field(
        device,
        feature::TRIGGER_SOURCE,
        config.trigger_source.map(TriggerSource::as_device_value),
        &mut outcome,
    );
    apply_trigger_field(
        device,
        feature::TRIGGER_MODE,
        config.trigger_mode.map(TriggerMode::as_device_value),
        &mut outcome,
    );
    outcome
}

fn apply_trigger_field(
    device: &mut dyn Device,
    name: &'static str,
    value: Option<&'static str>,
    outcome: &mut Result<(), CaptureError>,
) {
    match value {
        None => debug!("\"{name}\" not configured. Not changing device value"),
        Some(value) => merge(outcome, features::set_enum(device, name, value)),
    }
}

/// Layout matching whatever the device is configured for right now.
fn current_layout(device: &mut dyn Device) -> Option<VideoLayout> {
    let vendor = device.enum_feature(feature::PIXEL_FORMAT).ok()?;
    let format = format::media_from_vendor(&vendor)?;
    let width = device.int_feature(feature::WIDTH).ok()?;
    let height = device.int_feature(feature::HEIGHT).ok()?;
    Some(VideoLayout { format, width, height })
}

fn read_float(device: &dyn Device, name: &str) -> Option<f64> {
    match device.float_feature(name) {
        Ok(value) => {
            debug!("Camera returned {value} for \"{name}\"");
            Some(value)
        }
        Err(err) => {
            warn!("Failed to read \"{name}\": {err}");
            None
        }
    }
}

fn read_int(device: &dyn Device, name: &str) -> Option<i64> {
    match device.int_feature(name) {
        Ok(value) => {
            debug!("Camera returned {value} for \"{name}\"");
            Some(value)
        }
        Err(err) => {
            warn!("Failed to read \"{name}\": {err}");
            None
        }
    }
}

fn read_enum(device: &dyn Device, name: &str) -> Option<String> {
    match device.enum_feature(name) {
        Ok(value) => {
            debug!("Camera returned \"{value}\" for \"{name}\"");
            Some(value)
        }
        Err(err) => {
            warn!("Failed to read \"{name}\": {err}");
            None
        }
    }
}
