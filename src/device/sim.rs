//! In-process virtual camera.
//!
//! Implements the full [`Transport`]/[`Device`] surface against a feature
//! store and a background driver thread that fills queued buffers with a
//! test pattern. The demo binary streams from it, and the test suite drives
//! the whole acquisition lifecycle against it; every mutating driver call is
//! recorded in an operation journal so tests can assert ordering and
//! announce/revoke balance.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use tracing::trace;

use crate::device::{
    ApiVersion, Device, DeviceError, DeviceInfo, DeviceResult, FrameCallback, Transport,
};
use crate::features::feature;
use crate::format;
use crate::handoff::{BufferRef, FrameStatus};

/// Tuning knobs for a simulated camera.
#[derive(Debug, Clone)]
pub struct SimOptions {
    pub sensor_width: i64,
    pub sensor_height: i64,
    /// Step between valid offset values, as real sensors commonly require.
    pub offset_increment: i64,
    /// Pause between frames produced by the driver thread.
    pub frame_interval: Duration,
    /// Device pixel formats the camera advertises, in enumeration order.
    pub pixel_formats: Vec<String>,
    /// Transfer status per frame id; frames beyond the list are complete.
    pub frame_statuses: Vec<FrameStatus>,
    /// Features whose setters fail with an invalid-value rejection.
    pub rejected_features: HashSet<String>,
    /// Features the camera does not expose at all.
    pub missing_features: HashSet<String>,
    /// Zero-based announce call that fails with a resource error.
    pub fail_announce_at: Option<usize>,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            sensor_width: 1920,
            sensor_height: 1080,
            offset_increment: 4,
            frame_interval: Duration::from_millis(2),
            pixel_formats: vec![
                "Mono8".to_string(),
                "Mono12".to_string(),
                "RGB8".to_string(),
                "BayerRG8".to_string(),
            ],
            frame_statuses: Vec::new(),
            rejected_features: HashSet::new(),
            missing_features: HashSet::new(),
            fail_announce_at: None,
        }
    }
}

/// One recorded driver call.
#[derive(Debug, Clone, PartialEq)]
pub enum SimOp {
    SetFloat(String, f64),
    SetInt(String, i64),
    SetEnum(String, String),
    RunCommand(String),
    LoadSettings(String),
    Announce,
    Revoke,
    Queue,
    StartCapture,
    EndCapture,
    Flush,
}

type Journal = Arc<Mutex<Vec<SimOp>>>;

struct SimState {
    opts: SimOptions,
    floats: HashMap<String, f64>,
    ints: HashMap<String, i64>,
    enums: HashMap<String, String>,
    enum_entries: HashMap<String, Vec<String>>,
    commands_run: HashSet<String>,
    acquiring: bool,
    capture_engine: bool,
    announced: Vec<BufferRef>,
    capture_queue: VecDeque<(BufferRef, FrameCallback)>,
    announce_seq: usize,
    next_frame_id: u64,
    journal: Journal,
}

impl SimState {
    fn new(opts: SimOptions, journal: Journal) -> Self {
        let mut floats = HashMap::new();
        floats.insert(feature::EXPOSURE_TIME.to_string(), 5000.0);
        floats.insert(feature::EXPOSURE_TIME_LEGACY.to_string(), 5000.0);
        floats.insert(feature::GAIN.to_string(), 0.0);

        let mut ints = HashMap::new();
        ints.insert(feature::WIDTH.to_string(), opts.sensor_width);
        ints.insert(feature::HEIGHT.to_string(), opts.sensor_height);
        ints.insert(feature::OFFSET_X.to_string(), 0);
        ints.insert(feature::OFFSET_Y.to_string(), 0);

        let auto_modes = vec!["Off".to_string(), "Once".to_string(), "Continuous".to_string()];
        let mut enums = HashMap::new();
        let mut enum_entries = HashMap::new();
        enums.insert(feature::EXPOSURE_AUTO.to_string(), "Off".to_string());
        enum_entries.insert(feature::EXPOSURE_AUTO.to_string(), auto_modes.clone());
        enums.insert(feature::BALANCE_WHITE_AUTO.to_string(), "Off".to_string());
        enum_entries.insert(feature::BALANCE_WHITE_AUTO.to_string(), auto_modes);
        enums.insert(feature::TRIGGER_SELECTOR.to_string(), "FrameStart".to_string());
        enum_entries.insert(
            feature::TRIGGER_SELECTOR.to_string(),
            vec!["FrameStart".to_string(), "AcquisitionStart".to_string()],
        );
        enums.insert(feature::TRIGGER_MODE.to_string(), "Off".to_string());
        enum_entries.insert(
            feature::TRIGGER_MODE.to_string(),
            vec!["Off".to_string(), "On".to_string()],
        );
        enums.insert(feature::TRIGGER_SOURCE.to_string(), "Line0".to_string());
        enum_entries.insert(
            feature::TRIGGER_SOURCE.to_string(),
            vec![
                "Line0".to_string(),
                "Line1".to_string(),
                "Line2".to_string(),
                "Line3".to_string(),
            ],
        );
        enums.insert(feature::TRIGGER_ACTIVATION.to_string(), "RisingEdge".to_string());
        enum_entries.insert(
            feature::TRIGGER_ACTIVATION.to_string(),
            vec![
                "RisingEdge".to_string(),
                "FallingEdge".to_string(),
                "AnyEdge".to_string(),
                "LevelHigh".to_string(),
                "LevelLow".to_string(),
            ],
        );
        let initial_format = opts
            .pixel_formats
            .first()
            .cloned()
            .unwrap_or_else(|| "Mono8".to_string());
        enums.insert(feature::PIXEL_FORMAT.to_string(), initial_format);
        enum_entries.insert(feature::PIXEL_FORMAT.to_string(), opts.pixel_formats.clone());

        Self {
            opts,
            floats,
            ints,
            enums,
            enum_entries,
            commands_run: HashSet::new(),
            acquiring: false,
            capture_engine: false,
            announced: Vec::new(),
            capture_queue: VecDeque::new(),
            announce_seq: 0,
            next_frame_id: 0,
            journal,
        }
    }

    fn present(&self, name: &str) -> DeviceResult<()> {
        if self.opts.missing_features.contains(name) {
            return Err(DeviceError::NotFound);
        }
        Ok(())
    }

    fn writable(&self, name: &str) -> DeviceResult<()> {
        self.present(name)?;
        if self.opts.rejected_features.contains(name) {
            return Err(DeviceError::InvalidValue);
        }
        Ok(())
    }

    fn int(&self, name: &str) -> i64 {
        self.ints.get(name).copied().unwrap_or(0)
    }

    fn int_range(&self, name: &str) -> DeviceResult<(i64, i64)> {
        self.present(name)?;
        match name {
            feature::WIDTH => Ok((16, self.opts.sensor_width - self.int(feature::OFFSET_X))),
            feature::HEIGHT => Ok((16, self.opts.sensor_height - self.int(feature::OFFSET_Y))),
            feature::OFFSET_X => Ok((0, self.opts.sensor_width - self.int(feature::WIDTH))),
            feature::OFFSET_Y => Ok((0, self.opts.sensor_height - self.int(feature::HEIGHT))),
            _ => Err(DeviceError::NotFound),
        }
    }

    fn record(&self, op: SimOp) {
        self.journal.lock().unwrap().push(op);
    }

    fn payload_size(&self) -> usize {
        let bytes_per_pixel = self
            .enums
            .get(feature::PIXEL_FORMAT)
            .and_then(|name| format::media_from_vendor(name))
            .map(|media| media.pixel_stride(0))
            .unwrap_or(1);
        (self.int(feature::WIDTH) * self.int(feature::HEIGHT)) as usize * bytes_per_pixel
    }
}

struct SimShared {
    state: Mutex<SimState>,
    shutdown: AtomicBool,
    /// Set while the driver thread is between popping a buffer and firing
    /// its callback; flush waits on it so no callback outlives a flush.
    busy: AtomicBool,
}

/// A virtual camera session.
pub struct SimCamera {
    id: String,
    shared: Arc<SimShared>,
    worker: Option<thread::JoinHandle<()>>,
}

impl SimCamera {
    fn open(id: &str, opts: SimOptions, journal: Journal) -> Self {
        let interval = opts.frame_interval;
        let shared = Arc::new(SimShared {
            state: Mutex::new(SimState::new(opts, journal)),
            shutdown: AtomicBool::new(false),
            busy: AtomicBool::new(false),
        });
        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name("sim-frame-driver".to_string())
            .spawn(move || drive_frames(worker_shared, interval))
            .ok();
        Self {
            id: id.to_string(),
            shared,
            worker,
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.shared.state.lock().unwrap()
    }
}

/// Driver thread: fills the next queued buffer and fires its callback.
fn drive_frames(shared: Arc<SimShared>, interval: Duration) {
    while !shared.shutdown.load(Ordering::Acquire) {
        shared.busy.store(true, Ordering::SeqCst);
        let job = {
            let mut state = shared.state.lock().unwrap();
            if state.acquiring && state.capture_engine {
                state.capture_queue.pop_front().map(|(buffer, callback)| {
                    let frame_id = state.next_frame_id;
                    state.next_frame_id += 1;
                    let status = state
                        .opts
                        .frame_statuses
                        .get(frame_id as usize)
                        .copied()
                        .unwrap_or_default();
                    (buffer, callback, frame_id, status)
                })
            } else {
                None
            }
        };

        if let Some((buffer, callback, frame_id, status)) = job {
            {
                let mut payload = buffer.payload();
                let fill = match status {
                    FrameStatus::Complete => payload.bytes_mut().len(),
                    // Leave the tail untouched, as an interrupted transfer would.
                    FrameStatus::Incomplete => payload.bytes_mut().len() / 2,
                };
                for (i, byte) in payload.bytes_mut()[..fill].iter_mut().enumerate() {
                    *byte = (frame_id as usize + i) as u8;
                }
                payload.status = status;
                payload.frame_id = frame_id;
            }
            trace!("Simulated frame {frame_id} ready ({status:?})");
            callback(buffer);
        }
        shared.busy.store(false, Ordering::SeqCst);

        thread::sleep(interval);
    }
}

impl Device for SimCamera {
    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            id: self.id.clone(),
            model: "Virtual GigE".to_string(),
            serial: "SIM-00042".to_string(),
        }
    }

    fn float_feature(&self, name: &str) -> DeviceResult<f64> {
        let state = self.state();
        state.present(name)?;
        match state.floats.get(name) {
            Some(value) => Ok(*value),
            None if state.ints.contains_key(name) || state.enums.contains_key(name) => {
                Err(DeviceError::WrongType)
            }
            None => Err(DeviceError::NotFound),
        }
    }

    fn set_float_feature(&mut self, name: &str, value: f64) -> DeviceResult<()> {
        let mut state = self.state();
        state.writable(name)?;
        if !state.floats.contains_key(name) {
            return if state.ints.contains_key(name) || state.enums.contains_key(name) {
                Err(DeviceError::WrongType)
            } else {
                Err(DeviceError::NotFound)
            };
        }
        state.floats.insert(name.to_string(), value);
        state.record(SimOp::SetFloat(name.to_string(), value));
        Ok(())
    }

    fn int_feature(&self, name: &str) -> DeviceResult<i64> {
        let state = self.state();
        state.present(name)?;
        match state.ints.get(name) {
            Some(value) => Ok(*value),
            None if state.floats.contains_key(name) || state.enums.contains_key(name) => {
                Err(DeviceError::WrongType)
            }
            None => Err(DeviceError::NotFound),
        }
    }

    fn set_int_feature(&mut self, name: &str, value: i64) -> DeviceResult<()> {
        let mut state = self.state();
        state.writable(name)?;
        if !state.ints.contains_key(name) {
            return if state.floats.contains_key(name) || state.enums.contains_key(name) {
                Err(DeviceError::WrongType)
            } else {
                Err(DeviceError::NotFound)
            };
        }
        let (min, max) = state.int_range(name)?;
        if value < min || value > max {
            return Err(DeviceError::InvalidValue);
        }
        state.ints.insert(name.to_string(), value);
        state.record(SimOp::SetInt(name.to_string(), value));
        Ok(())
    }

    fn enum_feature(&self, name: &str) -> DeviceResult<String> {
        let state = self.state();
        state.present(name)?;
        match state.enums.get(name) {
            Some(value) => Ok(value.clone()),
            None if state.floats.contains_key(name) || state.ints.contains_key(name) => {
                Err(DeviceError::WrongType)
            }
            None => Err(DeviceError::NotFound),
        }
    }

    fn set_enum_feature(&mut self, name: &str, value: &str) -> DeviceResult<()> {
        let mut state = self.state();
        state.writable(name)?;
        let Some(entries) = state.enum_entries.get(name) else {
            return if state.floats.contains_key(name) || state.ints.contains_key(name) {
                Err(DeviceError::WrongType)
            } else {
                Err(DeviceError::NotFound)
            };
        };
        if !entries.iter().any(|entry| entry == value) {
            return Err(DeviceError::InvalidValue);
        }
        state.enums.insert(name.to_string(), value.to_string());
        state.record(SimOp::SetEnum(name.to_string(), value.to_string()));
        Ok(())
    }

    fn int_range(&self, name: &str) -> DeviceResult<(i64, i64)> {
        self.state().int_range(name)
    }

    fn int_increment(&self, name: &str) -> DeviceResult<i64> {
        let state = self.state();
        state.present(name)?;
        match name {
            feature::OFFSET_X | feature::OFFSET_Y => Ok(state.opts.offset_increment),
            feature::WIDTH | feature::HEIGHT => Ok(4),
            _ => Err(DeviceError::NotFound),
        }
    }

    fn enum_entries(&self, name: &str) -> DeviceResult<Vec<String>> {
        let state = self.state();
        state.present(name)?;
        state
            .enum_entries
            .get(name)
            .cloned()
            .ok_or(DeviceError::NotFound)
    }

    fn run_command(&mut self, name: &str) -> DeviceResult<()> {
        let mut state = self.state();
        state.writable(name)?;
        match name {
            feature::ACQUISITION_START => state.acquiring = true,
            feature::ACQUISITION_STOP => state.acquiring = false,
            feature::ADJUST_PACKET_SIZE => {}
            _ => return Err(DeviceError::NotFound),
        }
        state.commands_run.insert(name.to_string());
        state.record(SimOp::RunCommand(name.to_string()));
        Ok(())
    }

    fn command_done(&self, name: &str) -> DeviceResult<bool> {
        let state = self.state();
        if state.commands_run.contains(name) {
            Ok(true)
        } else {
            Err(DeviceError::NotFound)
        }
    }

    fn payload_size(&self) -> DeviceResult<usize> {
        Ok(self.state().payload_size())
    }

    fn load_settings(&mut self, path: &Path) -> DeviceResult<()> {
        let state = self.state();
        state.record(SimOp::LoadSettings(path.display().to_string()));
        Ok(())
    }

    fn announce_buffer(&mut self, buffer: BufferRef) -> DeviceResult<()> {
        let mut state = self.state();
        let seq = state.announce_seq;
        state.announce_seq += 1;
        if state.opts.fail_announce_at == Some(seq) {
            return Err(DeviceError::Resources);
        }
        // Transport-allocated descriptors receive their memory here.
        buffer.payload().ensure_allocated(buffer.capacity());
        state.announced.push(buffer);
        state.record(SimOp::Announce);
        Ok(())
    }

    fn revoke_buffer(&mut self, buffer: &BufferRef) -> DeviceResult<()> {
        let mut state = self.state();
        let Some(index) = state
            .announced
            .iter()
            .position(|candidate| Arc::ptr_eq(candidate, buffer))
        else {
            return Err(DeviceError::NotFound);
        };
        state.announced.swap_remove(index);
        state
            .capture_queue
            .retain(|(candidate, _)| !Arc::ptr_eq(candidate, buffer));
        state.record(SimOp::Revoke);
        Ok(())
    }

    fn queue_buffer(&mut self, buffer: BufferRef, callback: FrameCallback) -> DeviceResult<()> {
        let mut state = self.state();
        if !state
            .announced
            .iter()
            .any(|candidate| Arc::ptr_eq(candidate, &buffer))
        {
            return Err(DeviceError::InvalidValue);
        }
        state.capture_queue.push_back((buffer, callback));
        state.record(SimOp::Queue);
        Ok(())
    }

    fn start_capture(&mut self) -> DeviceResult<()> {
        let mut state = self.state();
        state.capture_engine = true;
        state.record(SimOp::StartCapture);
        Ok(())
    }

    fn end_capture(&mut self) -> DeviceResult<()> {
        let mut state = self.state();
        state.capture_engine = false;
        state.record(SimOp::EndCapture);
        Ok(())
    }

    fn flush_capture_queue(&mut self) -> DeviceResult<()> {
        {
            let mut state = self.state();
            state.capture_queue.clear();
            state.record(SimOp::Flush);
        }
        // A buffer the driver thread already popped must finish its callback
        // before the flush returns; afterwards none can fire.
        while self.shared.busy.load(Ordering::Acquire) {
            thread::sleep(Duration::from_micros(50));
        }
        Ok(())
    }

    fn close(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for SimCamera {
    fn drop(&mut self) {
        self.close();
    }
}

/// Driver library front for [`SimCamera`] sessions.
pub struct SimTransport {
    opts: SimOptions,
    journal: Journal,
    startups: AtomicUsize,
    shutdowns: AtomicUsize,
}

impl SimTransport {
    pub fn new(opts: SimOptions) -> Self {
        Self {
            opts,
            journal: Journal::default(),
            startups: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
        }
    }

    /// Snapshot of every driver call recorded so far, across all cameras
    /// opened through this transport.
    pub fn operations(&self) -> Vec<SimOp> {
        self.journal.lock().unwrap().clone()
    }

    pub fn startup_count(&self) -> usize {
        self.startups.load(Ordering::SeqCst)
    }

    pub fn shutdown_count(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

impl Default for SimTransport {
    fn default() -> Self {
        Self::new(SimOptions::default())
    }
}

impl Transport for SimTransport {
    fn startup(&self) -> DeviceResult<()> {
        self.startups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }

    fn version(&self) -> ApiVersion {
        ApiVersion { major: 1, minor: 0, patch: 0 }
    }

    fn open(&self, id: &str) -> DeviceResult<Box<dyn Device>> {
        if id.is_empty() {
            return Err(DeviceError::NotFound);
        }
        Ok(Box::new(SimCamera::open(
            id,
            self.opts.clone(),
            self.journal.clone(),
        )))
    }
}
