//! Consumer-facing pull path.
//!
//! The host pipeline calls [`CameraCapture::pull`] to obtain the next output
//! buffer. The wait is a short bounded pop interleaved with a liveness check,
//! so pipeline shutdown is observed within one poll interval even when no
//! frames arrive.

use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::format::MediaFormat;
use crate::handoff::{BufferRef, FrameStatus};
use crate::IncompleteFramePolicy;

use super::CameraCapture;

/// Upper bound on one wait slice; also bounds shutdown latency.
pub const PULL_POLL_INTERVAL: Duration = Duration::from_millis(10);

pub const MAX_PLANES: usize = 4;

/// Video layout committed during format negotiation; downstream buffer
/// metadata is derived from it.
#[derive(Debug, Clone, Copy)]
pub struct VideoLayout {
    pub format: MediaFormat,
    pub width: i64,
    pub height: i64,
}

impl VideoLayout {
    /// Row stride per plane, computed as width times bytes-per-pixel since
    /// the device packs rows without padding.
    pub fn strides(&self) -> ([i64; MAX_PLANES], usize) {
        let planes = self.format.plane_count();
        let mut strides = [0i64; MAX_PLANES];
        for (plane, stride) in strides.iter_mut().enumerate().take(planes) {
            *stride = self.width * self.format.pixel_stride(plane) as i64;
        }
        (strides, planes)
    }
}

/// A filled frame handed to the pipeline.
#[derive(Debug, Clone)]
pub struct OutputFrame {
    pub data: Bytes,
    /// Pipeline running time at emission; unset without a pipeline clock.
    pub pts: Option<Duration>,
    /// Emission index, starting at 0. Dropped incomplete frames never reach
    /// emission and therefore do not advance it.
    pub offset: u64,
    pub offset_end: u64,
    pub format: MediaFormat,
    pub width: i64,
    pub height: i64,
    pub plane_count: usize,
    pub stride: [i64; MAX_PLANES],
    /// Set when an incomplete transfer was emitted under the submit policy;
    /// trailing regions may hold stale pixel data.
    pub incomplete: bool,
}

/// Outcome of one pull.
#[derive(Debug)]
pub enum Pulled {
    Frame(OutputFrame),
    /// The pipeline left its running state while waiting. Not an error.
    Cancelled,
}

impl CameraCapture {
    /// Blocks until a filled frame is available or the pipeline stops
    /// running, whichever comes first.
    pub fn pull(&mut self) -> Pulled {
        let (buffer, incomplete) = loop {
            let popped = self.queue.queue().pop_timeout(PULL_POLL_INTERVAL);

            if !self.pipeline.is_running() {
                // Hand a frame we will not emit straight back to the driver.
                if let Some(buffer) = popped {
                    self.requeue(buffer);
                }
                info!("Pipeline is no longer running. Aborting pull");
                return Pulled::Cancelled;
            }

            let Some(buffer) = popped else { continue };

            let (status, frame_id) = {
                let payload = buffer.payload();
                (payload.status, payload.frame_id)
            };
            match status {
                FrameStatus::Complete => {
                    trace!("Frame {frame_id} was complete");
                    break (buffer, false);
                }
                FrameStatus::Incomplete => {
                    warn!("Received frame {frame_id} was incomplete");
                    match self.config.incomplete_frame_policy {
                        IncompleteFramePolicy::Submit => {
                            debug!("Submitting incomplete frame as configured");
                            break (buffer, true);
                        }
                        IncompleteFramePolicy::Drop => {
                            debug!("Dropping incomplete frame and requeueing its buffer");
                            self.requeue(buffer);
                        }
                    }
                }
            }
        };

        let Some(layout) = self.layout else {
            // No format was ever committed, so nothing downstream could
            // interpret the bytes. Treat like a shutdown race.
            warn!("Frame arrived without a committed video layout; discarding");
            self.requeue(buffer);
            return Pulled::Cancelled;
        };

        // Timestamp before copying to stay as close to acquisition as we can.
        let pts = self.pipeline.running_time();

        let data = {
            let payload = buffer.payload();
            Bytes::copy_from_slice(payload.bytes())
        };
        // The payload may be overwritten again only after the copy above.
        self.requeue(buffer);

        let (stride, plane_count) = layout.strides();
        let frame = OutputFrame {
            data,
            pts,
            offset: self.frames_pushed,
            offset_end: self.frames_pushed + 1,
            format: layout.format,
            width: layout.width,
            height: layout.height,
            plane_count,
            stride,
            incomplete,
        };
        self.frames_pushed += 1;
        trace!("Emitting frame {} ({} bytes)", frame.offset, frame.data.len());
        Pulled::Frame(frame)
    }

    /// Returns a descriptor to the capture engine for reuse.
    fn requeue(&mut self, buffer: BufferRef) {
        let Some(device) = self.device.as_deref_mut() else {
            return;
        };
        if let Err(err) = device.queue_buffer(buffer, self.frame_callback.clone()) {
            warn!("Requeueing frame buffer failed: {err}");
        }
    }
}
