//! Bounded sample series
//!
//! [`RingBuffer`] is the plain bounded deque used by per-window state.
//! [`SampleSeries`] wraps one in a `parking_lot::Mutex` so the ingestion path
//! can append while the controller iterates over a [`SampleSeries::snapshot`].

use std::collections::VecDeque;
use std::time::Instant;

use parking_lot::Mutex;

/// Connection-level series capacity
pub const GLOBAL_SERIES_CAPACITY: usize = 500;

/// Window-level series capacity
pub const WINDOW_SERIES_CAPACITY: usize = 100;

/// A timestamped value
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// When the value was observed
    pub at: Instant,
    /// Observed value
    pub value: f64,
}

impl Sample {
    /// Create a sample
    pub fn new(at: Instant, value: f64) -> Self {
        Self { at, value }
    }
}

/// A timestamped (size, elapsed) pair, e.g. pixels decoded in N microseconds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SizedSample {
    /// When the measurement completed
    pub at: Instant,
    /// Amount of work (pixels, bytes)
    pub size: f64,
    /// Time or cost the work took
    pub elapsed: f64,
}

impl SizedSample {
    /// Create a sized sample
    pub fn new(at: Instant, size: f64, elapsed: f64) -> Self {
        Self { at, size, elapsed }
    }
}

/// A timestamped value attributed to one window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowSample {
    /// When the value was observed
    pub at: Instant,
    /// Window the value belongs to
    pub window_id: u32,
    /// Observed value
    pub value: f64,
}

/// A latency measurement for a frame of `pixels` pixels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencySample {
    /// When the measurement completed
    pub at: Instant,
    /// Window the frame belonged to
    pub window_id: u32,
    /// Frame size in pixels
    pub pixels: u64,
    /// Latency in seconds
    pub latency: f64,
}

impl From<WindowSample> for Sample {
    fn from(s: WindowSample) -> Self {
        Sample::new(s.at, s.value)
    }
}

impl From<LatencySample> for Sample {
    fn from(s: LatencySample) -> Self {
        Sample::new(s.at, s.latency)
    }
}

impl From<LatencySample> for SizedSample {
    fn from(s: LatencySample) -> Self {
        SizedSample::new(s.at, s.pixels as f64, s.latency)
    }
}

// =============================================================================
// RingBuffer
// =============================================================================

/// Bounded deque, oldest evicted first
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T: Clone> RingBuffer<T> {
    /// Create a buffer holding at most `capacity` items (at least one)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append, evicting the oldest item when full
    pub fn push(&mut self, item: T) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    /// Items oldest first
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator + '_ {
        self.items.iter()
    }

    /// Most recent item
    pub fn last(&self) -> Option<&T> {
        self.items.back()
    }

    /// Number of items held
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when empty
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Maximum number of items held
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every item
    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Copy of the contents, oldest first
    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}

// =============================================================================
// SampleSeries
// =============================================================================

/// A [`RingBuffer`] shared between an ingestion path and readers
///
/// All access goes through one short-lived lock; readers work on snapshots
/// so appends are never blocked by a long computation.
#[derive(Debug)]
pub struct SampleSeries<T> {
    inner: Mutex<RingBuffer<T>>,
}

impl<T: Clone> SampleSeries<T> {
    /// Create a series holding at most `capacity` samples
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(RingBuffer::new(capacity)),
        }
    }

    /// Append a sample
    pub fn push(&self, sample: T) {
        self.inner.lock().push(sample);
    }

    /// Copy of the current contents, oldest first
    pub fn snapshot(&self) -> Vec<T> {
        self.inner.lock().to_vec()
    }

    /// Most recent sample
    pub fn last(&self) -> Option<T> {
        self.inner.lock().last().cloned()
    }

    /// Number of samples held
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// True when empty
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Drop every sample
    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}
