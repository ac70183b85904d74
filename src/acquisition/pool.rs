//! Fixed-size pool of frame buffers announced to the driver.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::device::{Device, DeviceError, FrameCallback};
use crate::error::CaptureError;
use crate::features::feature;
use crate::handoff::{BufferRef, FrameBuffer, QueueHandle};
use crate::AllocationMode;

/// Descriptors cycled through the driver per session. Fixed for the session
/// lifetime; the pool is only ever reallocated wholesale.
pub const FRAME_BUFFER_COUNT: usize = 10;

#[derive(Default)]
pub struct BufferPool {
    buffers: Vec<BufferRef>,
}

impl BufferPool {
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Capacity the current buffers were sized for, 0 when unpopulated.
    ///
    /// All buffers share one size, so inspecting the first is enough.
    pub fn buffer_capacity(&self) -> usize {
        self.buffers
            .first()
            .map(|buffer| buffer.capacity())
            .unwrap_or(0)
    }

    /// Sizes buffers from the device's current payload size, allocates them
    /// per `mode` and announces each one.
    ///
    /// On a partial failure the already-announced subset is revoked before
    /// the error propagates, so no driver-side registration can leak.
    pub fn allocate(
        &mut self,
        device: &mut dyn Device,
        mode: AllocationMode,
        queue: &Arc<QueueHandle>,
    ) -> Result<(), CaptureError> {
        let payload_size = device
            .payload_size()
            .map_err(CaptureError::ResourceExhausted)?;
        debug!("Got payload size of: {payload_size}");
        debug!("Allocating and announcing {FRAME_BUFFER_COUNT} frame buffers ({mode:?})");

        // Some transport layers perform better with aligned buffers; the
        // feature is advisory and absence simply leaves the default of 1.
        let alignment = match mode {
            AllocationMode::SelfAllocated => {
                let read = device.int_feature(feature::STREAM_BUFFER_ALIGNMENT);
                let alignment = read.unwrap_or(1).max(1) as usize;
                debug!("Using buffer alignment of {alignment} (read result was {read:?})");
                alignment
            }
            AllocationMode::TransportAllocated => 1,
        };

        for index in 0..FRAME_BUFFER_COUNT {
            let buffer = match mode {
                AllocationMode::SelfAllocated => {
                    FrameBuffer::self_allocated(payload_size, alignment, queue.clone())
                }
                AllocationMode::TransportAllocated => {
                    FrameBuffer::transport_allocated(payload_size, queue.clone())
                }
            };
            if let Err(err) = device.announce_buffer(buffer.clone()) {
                warn!("Announcing frame buffer {index} failed: {err}");
                self.revoke_all(device);
                return Err(CaptureError::ResourceExhausted(err));
            }
            self.buffers.push(buffer);
        }
        Ok(())
    }

    /// Revokes every announced descriptor and clears the pool.
    /// Safe to call on an unpopulated pool.
    pub fn revoke_all(&mut self, device: &mut dyn Device) {
        for buffer in self.buffers.drain(..) {
            if let Err(err) = device.revoke_buffer(&buffer) {
                warn!("Revoking frame buffer failed: {err}");
            }
        }
    }

    /// Hands every buffer to the capture engine.
    pub fn queue_all(
        &self,
        device: &mut dyn Device,
        callback: &FrameCallback,
    ) -> Result<(), DeviceError> {
        for buffer in &self.buffers {
            device.queue_buffer(buffer.clone(), callback.clone())?;
        }
        Ok(())
    }
}
