//! Bounded sample ring buffer
//!
//! Single producer (the receive loop) and single consumer (the downstream
//! pipeline). Storage is columnar and preallocated at resize time: one
//! sample column per slot across all channels plus its index, timestamp and
//! event word. A frame is copied in under one lock acquisition so a drain
//! never sees part of a frame.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::frame::SampleFrame;
use crate::config::OverflowPolicy;
use crate::error::BufferError;

/// Wait slice used while blocked on a full buffer
const WAIT_SLICE: Duration = Duration::from_millis(10);

struct Storage {
    /// Per-channel sample slots, `[channel][slot]`
    channels: Vec<Vec<f32>>,
    sample_indices: Vec<u64>,
    timestamps: Vec<f64>,
    event_words: Vec<u64>,
    capacity: usize,
    /// Oldest occupied slot
    head: usize,
    len: usize,
    policy: OverflowPolicy,
}

impl Storage {
    fn new(channel_count: usize, capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            channels: vec![vec![0.0; capacity]; channel_count],
            sample_indices: vec![0; capacity],
            timestamps: vec![0.0; capacity],
            event_words: vec![0; capacity],
            capacity,
            head: 0,
            len: 0,
            policy,
        }
    }

    fn free(&self) -> usize {
        self.capacity - self.len
    }

    fn write_frame(&mut self, frame: &SampleFrame) {
        let samples = frame.samples_per_frame();
        for column in 0..samples {
            let slot = (self.head + self.len + column) % self.capacity;
            for (channel, slots) in self.channels.iter_mut().enumerate() {
                slots[slot] = frame.data.get(channel, column);
            }
            self.sample_indices[slot] = frame.sample_indices[column];
            self.timestamps[slot] = frame.timestamps[column];
            self.event_words[slot] = frame.event_words[column];
        }
        self.len += samples;
    }
}

/// Samples handed to the consumer by one drain call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainedBlock {
    /// Per-channel samples, `[channel][sample]`
    pub channels: Vec<Vec<f32>>,
    pub sample_indices: Vec<u64>,
    pub timestamps: Vec<f64>,
    pub event_words: Vec<u64>,
}

impl DrainedBlock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sample columns
    pub fn len(&self) -> usize {
        self.sample_indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sample_indices.is_empty()
    }

    pub fn channel(&self, channel: usize) -> &[f32] {
        &self.channels[channel]
    }

    /// Empty the block, keeping its allocations
    pub fn clear(&mut self) {
        for channel in &mut self.channels {
            channel.clear();
        }
        self.sample_indices.clear();
        self.timestamps.clear();
        self.event_words.clear();
    }
}

/// Bounded columnar ring buffer of sequenced samples
pub struct SampleRingBuffer {
    storage: Mutex<Storage>,
    space_available: Condvar,
    interrupted: AtomicBool,
    overflow_count: AtomicUsize,
    frames_pushed: AtomicU64,
    samples_drained: AtomicU64,
}

impl SampleRingBuffer {
    /// Create a buffer holding `capacity` sample columns of `channel_count` channels
    pub fn new(channel_count: usize, capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            storage: Mutex::new(Storage::new(channel_count, capacity, policy)),
            space_available: Condvar::new(),
            interrupted: AtomicBool::new(false),
            overflow_count: AtomicUsize::new(0),
            frames_pushed: AtomicU64::new(0),
            samples_drained: AtomicU64::new(0),
        }
    }

    /// Append every column of `frame`.
    ///
    /// With [`OverflowPolicy::Block`] the call waits for the consumer until
    /// enough slots are free or [`interrupt`](Self::interrupt) is called.
    pub fn push(&self, frame: &SampleFrame) -> Result<(), BufferError> {
        let mut storage = self.storage.lock();

        if frame.channel_count() != storage.channels.len() {
            return Err(BufferError::ChannelMismatch {
                got: frame.channel_count(),
                expected: storage.channels.len(),
            });
        }

        let needed = frame.samples_per_frame();
        if needed > storage.capacity {
            self.overflow_count.fetch_add(1, Ordering::Relaxed);
            return Err(BufferError::Overflow {
                needed,
                free: storage.free(),
            });
        }

        let mut stalled = false;
        while storage.free() < needed {
            match storage.policy {
                OverflowPolicy::Reject => {
                    self.overflow_count.fetch_add(1, Ordering::Relaxed);
                    return Err(BufferError::Overflow {
                        needed,
                        free: storage.free(),
                    });
                }
                OverflowPolicy::Block => {
                    if self.interrupted.load(Ordering::Acquire) {
                        return Err(BufferError::Interrupted);
                    }
                    if !stalled {
                        stalled = true;
                        self.overflow_count.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!("Ring buffer full, waiting for consumer");
                    }
                    self.space_available.wait_for(&mut storage, WAIT_SLICE);
                }
            }
        }

        storage.write_frame(frame);
        self.frames_pushed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Move up to `max_samples` of the oldest columns into `block`.
    ///
    /// Returns the number of columns drained.
    pub fn drain_into(&self, block: &mut DrainedBlock, max_samples: usize) -> usize {
        let mut storage = self.storage.lock();
        let count = storage.len.min(max_samples);

        block.clear();
        block.channels.resize_with(storage.channels.len(), Vec::new);

        for offset in 0..count {
            let slot = (storage.head + offset) % storage.capacity;
            for (channel, slots) in storage.channels.iter().enumerate() {
                block.channels[channel].push(slots[slot]);
            }
            block.sample_indices.push(storage.sample_indices[slot]);
            block.timestamps.push(storage.timestamps[slot]);
            block.event_words.push(storage.event_words[slot]);
        }

        if count > 0 {
            storage.head = (storage.head + count) % storage.capacity;
            storage.len -= count;
            self.samples_drained.fetch_add(count as u64, Ordering::Relaxed);
            self.space_available.notify_all();
        }
        count
    }

    /// Drain up to `max_samples` into a new block
    pub fn drain(&self, max_samples: usize) -> DrainedBlock {
        let mut block = DrainedBlock::new();
        self.drain_into(&mut block, max_samples);
        block
    }

    /// Drain everything currently buffered
    pub fn drain_all(&self) -> DrainedBlock {
        self.drain(usize::MAX)
    }

    /// Reallocate for a new geometry, discarding all contents
    pub fn resize(&self, channel_count: usize, capacity: usize) {
        let mut storage = self.storage.lock();
        let policy = storage.policy;
        *storage = Storage::new(channel_count, capacity, policy);
        self.interrupted.store(false, Ordering::Release);
        self.space_available.notify_all();
    }

    /// Discard all buffered content
    pub fn clear(&self) {
        let mut storage = self.storage.lock();
        storage.head = 0;
        storage.len = 0;
        self.space_available.notify_all();
    }

    /// Abort any push blocked on a full buffer
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        let _guard = self.storage.lock();
        self.space_available.notify_all();
    }

    /// Allow blocking pushes again after [`interrupt`](Self::interrupt)
    pub fn resume(&self) {
        self.interrupted.store(false, Ordering::Release);
    }

    pub fn set_policy(&self, policy: OverflowPolicy) {
        self.storage.lock().policy = policy;
    }

    /// Get current number of buffered sample columns
    pub fn len(&self) -> usize {
        self.storage.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get capacity in sample columns
    pub fn capacity(&self) -> usize {
        self.storage.lock().capacity
    }

    pub fn channel_count(&self) -> usize {
        self.storage.lock().channels.len()
    }

    /// Get fill level as a fraction of capacity
    pub fn fill_level(&self) -> f32 {
        let storage = self.storage.lock();
        if storage.capacity == 0 {
            0.0
        } else {
            storage.len as f32 / storage.capacity as f32
        }
    }

    /// Get statistics
    pub fn stats(&self) -> BufferStats {
        let storage = self.storage.lock();
        BufferStats {
            len: storage.len,
            capacity: storage.capacity,
            frames_pushed: self.frames_pushed.load(Ordering::Relaxed),
            samples_drained: self.samples_drained.load(Ordering::Relaxed),
            overflow_count: self.overflow_count.load(Ordering::Relaxed),
        }
    }

    /// Reset statistics
    pub fn reset_stats(&self) {
        self.frames_pushed.store(0, Ordering::Relaxed);
        self.samples_drained.store(0, Ordering::Relaxed);
        self.overflow_count.store(0, Ordering::Relaxed);
    }
}

/// Ring buffer statistics
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct BufferStats {
    pub len: usize,
    pub capacity: usize,
    pub frames_pushed: u64,
    pub samples_drained: u64,
    pub overflow_count: usize,
}

/// Thread-safe handle to a ring buffer
pub type SharedRingBuffer = Arc<SampleRingBuffer>;
