//! Damage Geometry and History
//!
//! Rectangle algebra used by the statistics, the video region detector and
//! the refresh scheduler, plus the bounded per-window damage history.
//!
//! # Rectangle algebra
//!
//! ```text
//!   A.subtract(B)            A ∩ B
//!  ┌───────────────┐
//!  │      top      │
//!  ├────┬─────┬────┤
//!  │left│ A∩B │rght│   area(A) == area(A∩B) + Σ area(pieces)
//!  ├────┴─────┴────┤
//!  │    bottom     │
//!  └───────────────┘
//! ```
//!
//! Subtraction yields at most four disjoint pieces (top and bottom bands span
//! the full width of `A`, side bands span only the overlap rows).
//!
//! # History
//!
//! [`DamageHistory`] is a fixed-capacity ring of [`DamageEvent`]s. It also
//! keeps a monotonic event counter that eviction never resets, which the
//! detector uses to debounce evaluations.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Errors
// =============================================================================

/// Malformed geometry coming from an untrusted damage feed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GeometryError {
    /// Negative origin coordinate
    #[error("negative origin ({x}, {y})")]
    NegativeOrigin { x: i64, y: i64 },

    /// Zero or negative size
    #[error("invalid size {width}x{height}")]
    InvalidSize { width: i64, height: i64 },

    /// Coordinates do not fit the pixel coordinate space
    #[error("rectangle ({x}, {y}, {width}, {height}) out of range")]
    OutOfRange {
        x: i64,
        y: i64,
        width: i64,
        height: i64,
    },
}

// =============================================================================
// Rectangle
// =============================================================================

/// An immutable window-relative rectangle
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Rectangle {
    /// X coordinate (pixels from left)
    pub x: u32,
    /// Y coordinate (pixels from top)
    pub y: u32,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

impl Rectangle {
    /// Create a new rectangle
    #[inline]
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Validate signed input from a damage feed
    ///
    /// Negative origins, empty or negative sizes and rectangles whose far
    /// edge overflows the coordinate space are rejected.
    pub fn from_signed(x: i64, y: i64, width: i64, height: i64) -> Result<Self, GeometryError> {
        if x < 0 || y < 0 {
            return Err(GeometryError::NegativeOrigin { x, y });
        }
        if width <= 0 || height <= 0 {
            return Err(GeometryError::InvalidSize { width, height });
        }
        let max = u32::MAX as i64;
        if x + width > max || y + height > max {
            return Err(GeometryError::OutOfRange {
                x,
                y,
                width,
                height,
            });
        }
        Ok(Self::new(x as u32, y as u32, width as u32, height as u32))
    }

    /// Rectangle covering a whole window
    #[inline]
    pub const fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    /// Area in pixels
    #[inline]
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Right edge (exclusive)
    #[inline]
    pub fn right(&self) -> u64 {
        self.x as u64 + self.width as u64
    }

    /// Bottom edge (exclusive)
    #[inline]
    pub fn bottom(&self) -> u64 {
        self.y as u64 + self.height as u64
    }

    /// True when the rectangle covers no pixels
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Check if this rectangle overlaps with another
    pub fn intersects(&self, other: &Rectangle) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && (self.x as u64) < other.right()
            && self.right() > other.x as u64
            && (self.y as u64) < other.bottom()
            && self.bottom() > other.y as u64
    }

    /// Overlapping part of two rectangles, if any
    pub fn intersection(&self, other: &Rectangle) -> Option<Rectangle> {
        if !self.intersects(other) {
            return None;
        }
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        Some(Rectangle::new(
            x,
            y,
            (right - x as u64) as u32,
            (bottom - y as u64) as u32,
        ))
    }

    /// True when `other` lies entirely inside this rectangle
    ///
    /// An empty rectangle is contained by anything it does not stick out of.
    pub fn contains_rect(&self, other: &Rectangle) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    /// Check if this rectangle contains a point
    #[inline]
    pub fn contains_point(&self, x: u32, y: u32) -> bool {
        x >= self.x && (x as u64) < self.right() && y >= self.y && (y as u64) < self.bottom()
    }

    /// Bounding box of two rectangles
    pub fn union(&self, other: &Rectangle) -> Rectangle {
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        let right = self.right().max(other.right());
        let bottom = self.bottom().max(other.bottom());
        Rectangle::new(
            x,
            y,
            (right - x as u64).min(u32::MAX as u64) as u32,
            (bottom - y as u64).min(u32::MAX as u64) as u32,
        )
    }

    /// Pieces of this rectangle not covered by `other`
    ///
    /// The pieces are pairwise disjoint. Returns `vec![*self]` when the two
    /// do not overlap and an empty list when `other` covers `self`.
    pub fn subtract(&self, other: &Rectangle) -> Vec<Rectangle> {
        let Some(overlap) = self.intersection(other) else {
            return if self.is_empty() { Vec::new() } else { vec![*self] };
        };

        let mut pieces = Vec::with_capacity(4);
        // top band, full width
        if overlap.y > self.y {
            pieces.push(Rectangle::new(self.x, self.y, self.width, overlap.y - self.y));
        }
        // bottom band, full width
        if overlap.bottom() < self.bottom() {
            pieces.push(Rectangle::new(
                self.x,
                overlap.bottom() as u32,
                self.width,
                (self.bottom() - overlap.bottom()) as u32,
            ));
        }
        // side bands only span the overlap rows
        if overlap.x > self.x {
            pieces.push(Rectangle::new(
                self.x,
                overlap.y,
                overlap.x - self.x,
                overlap.height,
            ));
        }
        if overlap.right() < self.right() {
            pieces.push(Rectangle::new(
                overlap.right() as u32,
                overlap.y,
                (self.right() - overlap.right()) as u32,
                overlap.height,
            ));
        }
        pieces
    }

    /// Clip to a window of the given size
    pub fn clip_to(&self, width: u32, height: u32) -> Option<Rectangle> {
        self.intersection(&Rectangle::full(width, height))
    }
}

impl fmt::Display for Rectangle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}@{},{}", self.width, self.height, self.x, self.y)
    }
}

/// Bounding box of every rectangle in the iterator
pub fn merge_all<'a, I>(rects: I) -> Option<Rectangle>
where
    I: IntoIterator<Item = &'a Rectangle>,
{
    rects.into_iter().fold(None, |acc, r| match acc {
        None => Some(*r),
        Some(m) => Some(m.union(r)),
    })
}

/// Add `rect` to a region list
///
/// Nothing is added when an existing entry already covers `rect`; entries
/// that `rect` covers are dropped.
pub fn add_rectangle(list: &mut Vec<Rectangle>, rect: Rectangle) {
    if rect.is_empty() || list.iter().any(|r| r.contains_rect(&rect)) {
        return;
    }
    list.retain(|r| !rect.contains_rect(r));
    list.push(rect);
}

/// Subtract `rect` from every entry of a region list
pub fn remove_rectangle(list: &mut Vec<Rectangle>, rect: &Rectangle) {
    if list.iter().all(|r| !r.intersects(rect)) {
        return;
    }
    let current = std::mem::take(list);
    for r in current {
        list.extend(r.subtract(rect));
    }
}

/// Total area of a region list (overlaps counted twice)
pub fn total_area(list: &[Rectangle]) -> u64 {
    list.iter().map(Rectangle::area).sum()
}

// =============================================================================
// Damage history
// =============================================================================

/// Minimum number of events a window damage history keeps
pub const MIN_HISTORY_CAPACITY: usize = 150;

/// Default history capacity
pub const DEFAULT_HISTORY_CAPACITY: usize = 400;

/// A window rectangle whose pixels changed at `at`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DamageEvent {
    /// When the damage was reported
    pub at: Instant,
    /// Damaged area
    pub rect: Rectangle,
}

impl DamageEvent {
    /// Create a new damage event
    pub fn new(at: Instant, rect: Rectangle) -> Self {
        Self { at, rect }
    }
}

/// Bounded ring of recent damage events for one window
#[derive(Debug, Clone)]
pub struct DamageHistory {
    events: VecDeque<DamageEvent>,
    capacity: usize,
    total: u64,
}

impl Default for DamageHistory {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAPACITY)
    }
}

impl DamageHistory {
    /// Create a history holding at least [`MIN_HISTORY_CAPACITY`] events
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(MIN_HISTORY_CAPACITY);
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
            total: 0,
        }
    }

    /// Record a damage event, evicting the oldest when full
    pub fn push(&mut self, event: DamageEvent) {
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
        self.total += 1;
    }

    /// Number of events ever recorded
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Number of events currently held
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// True when nothing is held
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Maximum number of events held
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Events oldest first
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &DamageEvent> + '_ {
        self.events.iter()
    }

    /// Most recent event
    pub fn last(&self) -> Option<&DamageEvent> {
        self.events.back()
    }

    /// Events recorded at or after `since`
    pub fn since(&self, since: Instant) -> impl Iterator<Item = &DamageEvent> + '_ {
        self.events.iter().filter(move |e| e.at >= since)
    }

    /// Events recorded within `window` of `now`
    pub fn recent(&self, now: Instant, window: Duration) -> Vec<DamageEvent> {
        match now.checked_sub(window) {
            Some(cutoff) => self.since(cutoff).copied().collect(),
            None => self.events.iter().copied().collect(),
        }
    }

    /// Pixels damaged at or after `since`
    pub fn pixels_since(&self, since: Instant) -> u64 {
        self.since(since).map(|e| e.rect.area()).sum()
    }

    /// Drop all events, keeping the running total
    pub fn clear(&mut self) {
        self.events.clear();
    }
}

// =============================================================================
// Tests
// =============================================================================
