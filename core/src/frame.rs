use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;

/// Opaque handle to a frame's image data, suitable for handing to a display
/// layer. The owning store invalidates the handle when the frame is evicted
/// or the store disposed; clones share the validity flag, so a stale clone
/// held by a renderer stops yielding bytes the moment the frame is gone.
#[derive(Debug, Clone)]
pub struct RenderHandle {
    data: Bytes,
    valid: Arc<AtomicBool>,
}

impl RenderHandle {
    pub(crate) fn new(data: Bytes) -> Self {
        Self {
            data,
            valid: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Image bytes, or `None` once the handle has been released.
    pub fn bytes(&self) -> Option<&Bytes> {
        if self.is_valid() {
            Some(&self.data)
        } else {
            None
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Invalidate the handle. Returns `true` only on the first call;
    /// the flag flips exactly once.
    pub(crate) fn release(&self) -> bool {
        self.valid.swap(false, Ordering::AcqRel)
    }
}

/// One decoded camera frame: a complete JPEG payload plus the logical
/// timestamp it was captured at.
///
/// `timestamp` is in the time domain of the injected
/// [`TimeSource`](crate::session::TimeSource) — seconds, monotonic within
/// one session, not necessarily wall-clock.
#[derive(Debug, Clone)]
pub struct Frame {
    pub timestamp: f64,
    pub payload: Bytes,
    pub handle: RenderHandle,
}

impl Frame {
    pub fn new(payload: Bytes, timestamp: f64) -> Self {
        let handle = RenderHandle::new(payload.clone());
        Self {
            timestamp,
            payload,
            handle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_yields_bytes_while_valid() {
        let frame = Frame::new(Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xD9]), 1.0);
        assert!(frame.handle.is_valid());
        assert_eq!(
            frame.handle.bytes().unwrap().as_ref(),
            &[0xFF, 0xD8, 0xFF, 0xD9]
        );
    }

    #[test]
    fn release_flips_exactly_once() {
        let frame = Frame::new(Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xD9]), 1.0);
        assert!(frame.handle.release());
        assert!(!frame.handle.release());
        assert!(frame.handle.bytes().is_none());
    }

    #[test]
    fn clones_share_invalidation() {
        let frame = Frame::new(Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xD9]), 1.0);
        let clone = frame.handle.clone();
        frame.handle.release();
        assert!(!clone.is_valid());
        assert!(clone.bytes().is_none());
    }
}
