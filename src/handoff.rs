//! Frame buffer descriptors and the filled-frame handoff queue.
//!
//! A fixed set of descriptors cycles between the driver and the consumer for
//! the lifetime of a session: announce -> queue -> fill -> handoff -> copy ->
//! requeue. The driver-owned callback thread pushes filled descriptors into
//! the queue and never blocks; the consumer drains it with a bounded wait.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use arc_swap::ArcSwap;
use crossbeam::utils::CachePadded;

/// Transfer status the driver records when it fills a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameStatus {
    #[default]
    Complete,
    /// Transfer was interrupted; trailing regions may hold stale data.
    Incomplete,
}

/// Bytes of one frame, plus the fill metadata the driver sets alongside them.
///
/// Kept behind one lock so status and pixel data can never be observed
/// out of sync.
#[derive(Debug, Default)]
pub struct Payload {
    mem: Vec<u8>,
    offset: usize,
    len: usize,
    pub status: FrameStatus,
    pub frame_id: u64,
}

impl Payload {
    /// Allocates `capacity` bytes starting at an `alignment`-aligned address.
    fn aligned(capacity: usize, alignment: usize) -> Self {
        let alignment = alignment.max(1);
        let mem = vec![0u8; capacity + alignment - 1];
        let offset = mem.as_ptr().align_offset(alignment);
        Self {
            mem,
            offset,
            len: capacity,
            ..Self::default()
        }
    }

    /// Backing for buffers the transport layer populates on announcement.
    fn unallocated() -> Self {
        Self::default()
    }

    pub fn is_allocated(&self) -> bool {
        self.len > 0
    }

    /// Gives the region a backing allocation if it does not have one yet.
    pub fn ensure_allocated(&mut self, capacity: usize) {
        if self.len < capacity {
            self.mem = vec![0u8; capacity];
            self.offset = 0;
            self.len = capacity;
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.mem[self.offset..self.offset + self.len]
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.mem[self.offset..self.offset + self.len]
    }
}

/// A reusable frame buffer descriptor.
///
/// Either registered with the driver (announced) or fully owned by the pool;
/// the payload lock is only ever taken by whichever side currently holds the
/// buffer, so it is uncontended by protocol.
pub struct FrameBuffer {
    payload: Mutex<Payload>,
    capacity: usize,
    queue: Arc<QueueHandle>,
}

pub type BufferRef = Arc<FrameBuffer>;

impl FrameBuffer {
    /// Descriptor backed by adapter-allocated aligned memory.
    pub fn self_allocated(capacity: usize, alignment: usize, queue: Arc<QueueHandle>) -> BufferRef {
        Arc::new(Self {
            payload: Mutex::new(Payload::aligned(capacity, alignment)),
            capacity,
            queue,
        })
    }

    /// Descriptor whose memory the transport layer provides on announcement.
    pub fn transport_allocated(capacity: usize, queue: Arc<QueueHandle>) -> BufferRef {
        Arc::new(Self {
            payload: Mutex::new(Payload::unallocated()),
            capacity,
            queue,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn payload(&self) -> MutexGuard<'_, Payload> {
        self.payload.lock().unwrap()
    }

    /// Pushes this descriptor onto the queue its context points at.
    ///
    /// This is the entire callback duty of the driver thread: no blocking,
    /// no allocation, no device calls.
    pub fn hand_to_queue(self: &Arc<Self>) {
        self.queue.push(self.clone());
    }
}

#[derive(Default)]
struct QueueCounters {
    pushed: AtomicU64,
    popped: AtomicU64,
}

/// FIFO of filled descriptors between the driver callback and the consumer.
pub struct FrameQueue {
    tx: flume::Sender<BufferRef>,
    rx: flume::Receiver<BufferRef>,
    counters: CachePadded<QueueCounters>,
}

impl FrameQueue {
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            tx,
            rx,
            counters: CachePadded::new(QueueCounters::default()),
        }
    }

    /// Producer side; never blocks.
    pub fn push(&self, buffer: BufferRef) {
        self.counters.pushed.fetch_add(1, Ordering::Relaxed);
        // Both channel ends live in this struct, so the send cannot fail.
        let _ = self.tx.send(buffer);
    }

    /// Consumer side; waits at most `timeout` for a filled descriptor.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<BufferRef> {
        let buffer = self.rx.recv_timeout(timeout).ok()?;
        self.counters.popped.fetch_add(1, Ordering::Relaxed);
        Some(buffer)
    }

    /// Discards everything currently queued, returning how many were dropped.
    pub fn drain(&self) -> usize {
        let mut drained = 0;
        while self.rx.try_recv().is_ok() {
            drained += 1;
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// (pushed, popped) totals over the queue's lifetime.
    pub fn counters(&self) -> (u64, u64) {
        (
            self.counters.pushed.load(Ordering::Relaxed),
            self.counters.popped.load(Ordering::Relaxed),
        )
    }
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared per-buffer context carried through the driver.
///
/// Every descriptor of a session points at the same handle; the state machine
/// replaces the inner queue only while capture is stopped and the driver
/// queue flushed, so a callback can never push into a retired instance.
pub struct QueueHandle {
    current: ArcSwap<FrameQueue>,
}

impl QueueHandle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            current: ArcSwap::from_pointee(FrameQueue::new()),
        })
    }

    pub fn push(&self, buffer: BufferRef) {
        self.current.load().push(buffer);
    }

    /// Snapshot of the active queue for the consumer's bounded wait.
    pub fn queue(&self) -> Arc<FrameQueue> {
        self.current.load_full()
    }

    /// Installs a fresh empty queue. Only valid while no callbacks can fire.
    pub fn replace(&self) {
        self.current.store(Arc::new(FrameQueue::new()));
    }

    pub fn drain(&self) -> usize {
        self.current.load().drain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(queue: &Arc<QueueHandle>) -> BufferRef {
        FrameBuffer::self_allocated(16, 1, queue.clone())
    }

    #[test]
    fn push_and_pop_preserve_fifo_order() {
        let handle = QueueHandle::new();
        let first = buffer(&handle);
        let second = buffer(&handle);
        first.payload().frame_id = 1;
        second.payload().frame_id = 2;

        first.hand_to_queue();
        second.hand_to_queue();

        let queue = handle.queue();
        let a = queue.pop_timeout(Duration::from_millis(10)).unwrap();
        let b = queue.pop_timeout(Duration::from_millis(10)).unwrap();
        assert_eq!(a.payload().frame_id, 1);
        assert_eq!(b.payload().frame_id, 2);
        assert!(queue.pop_timeout(Duration::from_millis(1)).is_none());
        assert_eq!(queue.counters(), (2, 2));
    }

    #[test]
    fn replace_installs_an_empty_queue() {
        let handle = QueueHandle::new();
        let buf = buffer(&handle);
        buf.hand_to_queue();
        assert_eq!(handle.queue().len(), 1);

        handle.replace();
        assert!(handle.queue().is_empty());

        // Descriptors keep working against the fresh instance.
        buf.hand_to_queue();
        assert_eq!(handle.queue().len(), 1);
    }

    #[test]
    fn aligned_payload_honors_alignment() {
        let payload = Payload::aligned(64, 32);
        assert_eq!(payload.bytes().as_ptr() as usize % 32, 0);
        assert_eq!(payload.bytes().len(), 64);
    }

    #[test]
    fn transport_payload_starts_unallocated() {
        let mut payload = Payload::unallocated();
        assert!(!payload.is_allocated());
        payload.ensure_allocated(128);
        assert!(payload.is_allocated());
        assert_eq!(payload.bytes().len(), 128);
    }
}
