//! Capture a live MJPEG (Motion JPEG over HTTP multipart) stream into a
//! bounded, time-indexed frame history that a playback timeline can scrub.
//!
//! The pipeline: a [`session::StreamSession`] opens the HTTP connection,
//! validates the multipart boundary, and drives raw chunks through an
//! [`extract::FrameExtractor`], which emits complete JPEG payloads keyed off
//! the SOI/EOI markers. Each payload is stamped by an injected
//! [`session::TimeSource`] and inserted into a [`store::FrameStore`], which
//! evicts oldest-first past capacity and answers "what did the camera show
//! at time T" in `O(log n)`.

pub mod config;
pub mod extract;
pub mod frame;
pub mod session;
pub mod store;

pub use frame::{Frame, RenderHandle};
pub use session::{SessionError, SessionState, SessionStatus, StateObserver, StreamSession, TimeSource};
pub use store::FrameStore;
