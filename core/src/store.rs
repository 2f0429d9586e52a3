use std::collections::VecDeque;

use tracing::debug;

use crate::frame::Frame;

pub const DEFAULT_MAX_FRAMES: usize = 1000;

/// Time-ordered frame history with FIFO eviction and as-of-time lookup.
///
/// Frames arrive in capture order, so timestamps are non-decreasing by
/// construction and lookup can binary-search. Every removal path (eviction,
/// [`clear`](Self::clear), [`dispose`](Self::dispose)) releases the frame's
/// render handle before the frame leaves the index.
#[derive(Debug)]
pub struct FrameStore {
    frames: VecDeque<Frame>,
    max_frames: usize,
    disposed: bool,
}

impl FrameStore {
    pub fn new(max_frames: usize) -> Self {
        Self {
            frames: VecDeque::new(),
            max_frames: max_frames.max(1),
            disposed: false,
        }
    }

    /// Append a frame, evicting oldest-first while over capacity.
    ///
    /// After [`dispose`](Self::dispose) the frame is refused and its handle
    /// released immediately so nothing leaks.
    pub fn insert(&mut self, frame: Frame) {
        if self.disposed {
            frame.handle.release();
            return;
        }
        self.frames.push_back(frame);
        while self.frames.len() > self.max_frames {
            if let Some(evicted) = self.frames.pop_front() {
                evicted.handle.release();
                debug!(timestamp = evicted.timestamp, "evicted oldest frame");
            }
        }
    }

    /// Frame with the greatest timestamp `<= t`, ties going to the latest
    /// insert. `None` when the store is empty or `t` precedes every frame.
    pub fn frame_at_time(&self, t: f64) -> Option<&Frame> {
        let idx = self.frames.partition_point(|f| f.timestamp <= t);
        idx.checked_sub(1).and_then(|i| self.frames.get(i))
    }

    /// Bounds-checked positional access for timeline enumeration.
    pub fn frame_at_index(&self, index: usize) -> Option<&Frame> {
        self.frames.get(index)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Release every handle and empty the store. Capture may continue and
    /// repopulate afterwards.
    pub fn clear(&mut self) {
        for frame in self.frames.drain(..) {
            frame.handle.release();
        }
    }

    /// [`clear`](Self::clear), then permanently refuse further inserts.
    pub fn dispose(&mut self) {
        self.clear();
        self.disposed = true;
    }
}
