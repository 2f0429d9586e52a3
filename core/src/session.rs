use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::CONTENT_TYPE;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::extract::{parse_boundary, FrameExtractor};
use crate::frame::Frame;
use crate::store::{FrameStore, DEFAULT_MAX_FRAMES};

/// Logical clock used to stamp frames. Supplied by the embedding
/// application so capture can run against wall time, synchronized log time,
/// or a test clock; the session never reads a system clock itself.
pub trait TimeSource: Send + Sync {
    /// Current logical time in seconds.
    fn now(&self) -> f64;
}

impl<F> TimeSource for F
where
    F: Fn() -> f64 + Send + Sync,
{
    fn now(&self) -> f64 {
        self()
    }
}

/// Snapshot handed to the observer after every transition and insertion.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub url: Option<String>,
    pub is_capturing: bool,
    pub frame_count: usize,
    pub error: Option<String>,
}

/// Callback seam for status displays; invoked instead of requiring polling.
pub trait StateObserver: Send + Sync {
    fn on_state(&self, status: &SessionStatus);
}

impl<F> StateObserver for F
where
    F: Fn(&SessionStatus) + Send + Sync,
{
    fn on_state(&self, status: &SessionStatus) {
        self(status)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Capturing,
    Error(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("HTTP connection failed: {0}")]
    HttpConnect(reqwest::Error),
    #[error("HTTP status {0}")]
    HttpStatus(u16),
    #[error("HTTP stream error: {0}")]
    HttpStream(reqwest::Error),
    #[error("Content-Type has no parseable multipart boundary")]
    MissingBoundary,
}

struct Shared {
    store: FrameStore,
    state: SessionState,
    url: Option<String>,
    observer: Option<Arc<dyn StateObserver>>,
    /// Bumped on every start/stop/dispose; a read task only writes state if
    /// its epoch is still current, so a replaced or stopped run cannot
    /// clobber its successor.
    epoch: u64,
    disposed: bool,
}

impl Shared {
    fn status(&self) -> SessionStatus {
        SessionStatus {
            url: self.url.clone(),
            is_capturing: matches!(self.state, SessionState::Capturing),
            frame_count: self.store.len(),
            error: match &self.state {
                SessionState::Error(msg) => Some(msg.clone()),
                _ => None,
            },
        }
    }
}

// A poisoned lock only means a panic mid-mutation elsewhere; the store's
// invariants hold after every statement, so recover the guard.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

type Notification = (SessionStatus, Option<Arc<dyn StateObserver>>);

fn emit(notification: Option<Notification>) {
    if let Some((status, Some(observer))) = notification {
        observer.on_state(&status);
    }
}

fn set_state(shared: &Mutex<Shared>, epoch: u64, state: SessionState) {
    let notification = {
        let mut s = lock(shared);
        if s.epoch != epoch {
            return;
        }
        s.state = state;
        Some((s.status(), s.observer.clone()))
    };
    emit(notification);
}

fn insert_frame(shared: &Mutex<Shared>, epoch: u64, frame: Frame) {
    let notification = {
        let mut s = lock(shared);
        if s.epoch != epoch {
            frame.handle.release();
            return;
        }
        s.store.insert(frame);
        Some((s.status(), s.observer.clone()))
    };
    emit(notification);
}

/// Owns one MJPEG capture: connection lifecycle, the read loop feeding the
/// extractor, and the frame store answering timeline queries.
///
/// Lifecycle is `Idle -> Connecting -> Capturing -> {Idle, Error}`. Both
/// `Idle` and `Error` accept a fresh [`start_capture`](Self::start_capture);
/// starting while a capture is active replaces it. All methods take `&self`
/// and are safe to call concurrently with the read loop — the store sits
/// behind one coarse mutex, which is plenty at camera frame rates.
pub struct StreamSession {
    shared: Arc<Mutex<Shared>>,
    time: Arc<dyn TimeSource>,
    connect_timeout: Duration,
    cancel: Mutex<Option<CancellationToken>>,
}

impl StreamSession {
    pub fn new(time: Arc<dyn TimeSource>) -> Self {
        Self::with_limits(time, DEFAULT_MAX_FRAMES, Duration::from_secs(10))
    }

    pub fn with_limits(
        time: Arc<dyn TimeSource>,
        max_frames: usize,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                store: FrameStore::new(max_frames),
                state: SessionState::Idle,
                url: None,
                observer: None,
                epoch: 0,
                disposed: false,
            })),
            time,
            connect_timeout,
            cancel: Mutex::new(None),
        }
    }

    pub fn set_observer(&self, observer: Arc<dyn StateObserver>) {
        let mut s = lock(&self.shared);
        if !s.disposed {
            s.observer = Some(observer);
        }
    }

    /// Begin capturing from `url`, replacing any capture already running.
    ///
    /// The previous run is cancelled and its frames released; a fresh
    /// session gets a fresh store so timestamps stay monotonic. Must be
    /// called from within a tokio runtime.
    pub fn start_capture(&self, url: &str) {
        let token = CancellationToken::new();
        if let Some(prev) = lock(&self.cancel).replace(token.clone()) {
            prev.cancel();
        }

        let (notification, epoch) = {
            let mut s = lock(&self.shared);
            if s.disposed {
                warn!("start_capture on a disposed session ignored");
                return;
            }
            s.epoch += 1;
            s.store.clear();
            s.url = Some(url.to_string());
            s.state = SessionState::Connecting;
            (Some((s.status(), s.observer.clone())), s.epoch)
        };
        emit(notification);

        info!(url, "starting capture");
        let shared = Arc::clone(&self.shared);
        let time = Arc::clone(&self.time);
        let url = url.to_string();
        let connect_timeout = self.connect_timeout;
        tokio::spawn(async move {
            run_capture(shared, time, url, token, connect_timeout, epoch).await;
        });
    }

    /// Cancel the read loop and return to `Idle`. Captured frames stay
    /// queryable. Cancellation is silent: it never surfaces as an error.
    pub fn stop_capture(&self) {
        if let Some(token) = lock(&self.cancel).take() {
            token.cancel();
        }
        let notification = {
            let mut s = lock(&self.shared);
            if s.disposed || s.state == SessionState::Idle {
                None
            } else {
                s.epoch += 1;
                s.state = SessionState::Idle;
                Some((s.status(), s.observer.clone()))
            }
        };
        emit(notification);
    }

    /// Release every captured frame. Capture, if running, continues and
    /// repopulates the store.
    pub fn clear_frames(&self) {
        let notification = {
            let mut s = lock(&self.shared);
            if s.disposed {
                None
            } else {
                s.store.clear();
                Some((s.status(), s.observer.clone()))
            }
        };
        emit(notification);
    }

    /// Cancel any in-flight read, release all frames, and detach the
    /// observer. Terminal: later `start_capture` calls are ignored.
    pub fn dispose(&self) {
        if let Some(token) = lock(&self.cancel).take() {
            token.cancel();
        }
        let mut s = lock(&self.shared);
        s.epoch += 1;
        s.store.dispose();
        s.state = SessionState::Idle;
        s.observer = None;
        s.disposed = true;
    }

    /// Frame with the greatest timestamp `<= t`, or `None`.
    pub fn frame_at_time(&self, t: f64) -> Option<Frame> {
        lock(&self.shared).store.frame_at_time(t).cloned()
    }

    pub fn frame_at_index(&self, index: usize) -> Option<Frame> {
        lock(&self.shared).store.frame_at_index(index).cloned()
    }

    pub fn frame_count(&self) -> usize {
        lock(&self.shared).store.len()
    }

    pub fn state(&self) -> SessionState {
        lock(&self.shared).state.clone()
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.dispose();
    }
}

async fn run_capture(
    shared: Arc<Mutex<Shared>>,
    time: Arc<dyn TimeSource>,
    url: String,
    cancel: CancellationToken,
    connect_timeout: Duration,
    epoch: u64,
) {
    match capture_loop(&shared, &time, &url, &cancel, connect_timeout, epoch).await {
        Ok(()) => {
            // Cooperative cancellation: stop/dispose already set the state.
            if !cancel.is_cancelled() {
                info!(url = %url, "stream ended");
                set_state(&shared, epoch, SessionState::Idle);
            }
        }
        Err(e) => {
            if !cancel.is_cancelled() {
                warn!(error = %e, url = %url, "capture failed");
                set_state(&shared, epoch, SessionState::Error(e.to_string()));
            }
        }
    }
}

async fn capture_loop(
    shared: &Mutex<Shared>,
    time: &Arc<dyn TimeSource>,
    url: &str,
    cancel: &CancellationToken,
    connect_timeout: Duration,
    epoch: u64,
) -> Result<(), SessionError> {
    let client = reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .build()
        .map_err(SessionError::HttpConnect)?;

    let response = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        r = client.get(url).send() => r.map_err(SessionError::HttpConnect)?,
    };

    if !response.status().is_success() {
        return Err(SessionError::HttpStatus(response.status().as_u16()));
    }

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let boundary = parse_boundary(content_type).ok_or(SessionError::MissingBoundary)?;
    debug!(boundary = %boundary, status = %response.status(), "connected to MJPEG stream");

    set_state(shared, epoch, SessionState::Capturing);

    let mut byte_stream = response.bytes_stream();
    let mut extractor = FrameExtractor::new();

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(url, "capture cancelled");
                return Ok(());
            }
            next = byte_stream.next() => match next {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => return Err(SessionError::HttpStream(e)),
                None => break,
            },
        };

        extractor.extend(&chunk);
        // Drain every fully-formed frame before the next read.
        while let Some(payload) = extractor.next_frame() {
            let frame = Frame::new(payload, time.now());
            insert_frame(shared, epoch, frame);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicU64, Ordering};

    use axum::body::Body;
    use axum::http::{header, StatusCode};
    use axum::routing::get;
    use axum::Router;
    use bytes::Bytes;

    use super::*;

    fn jpeg(body: &[u8]) -> Vec<u8> {
        let mut v = vec![0xFF, 0xD8];
        v.extend_from_slice(body);
        v.extend_from_slice(&[0xFF, 0xD9]);
        v
    }

    fn multipart_wire(payloads: &[Vec<u8>]) -> Vec<u8> {
        let mut wire = Vec::new();
        for p in payloads {
            wire.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
            wire.extend_from_slice(p);
            wire.extend_from_slice(b"\r\n");
        }
        wire
    }

    const MJPEG_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

    async fn serve(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn counting_clock() -> Arc<dyn TimeSource> {
        let ticks = AtomicU64::new(0);
        Arc::new(move || (ticks.fetch_add(1, Ordering::Relaxed) + 1) as f64)
    }

    async fn wait_until(session: &StreamSession, pred: impl Fn(&StreamSession) -> bool) {
        for _ in 0..500 {
            if pred(session) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "timed out waiting on session, state = {:?}, frames = {}",
            session.state(),
            session.frame_count()
        );
    }

    #[tokio::test]
    async fn new_session_is_idle_and_empty() {
        let session = StreamSession::new(counting_clock());
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.frame_count(), 0);
        assert!(session.frame_at_time(0.0).is_none());
    }

    #[tokio::test]
    async fn http_404_transitions_to_error_without_capturing() {
        let app = Router::new().route("/stream", get(|| async { StatusCode::NOT_FOUND }));
        let addr = serve(app).await;

        let session = StreamSession::new(counting_clock());
        let seen: Arc<Mutex<Vec<SessionStatus>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        session.set_observer(Arc::new(move |status: &SessionStatus| {
            lock(&sink).push(status.clone());
        }));

        session.start_capture(&format!("http://{addr}/stream"));
        wait_until(&session, |s| matches!(s.state(), SessionState::Error(_))).await;

        match session.state() {
            SessionState::Error(msg) => assert!(!msg.is_empty()),
            other => panic!("expected error state, got {other:?}"),
        }
        assert!(lock(&seen).iter().all(|s| !s.is_capturing));
    }

    #[tokio::test]
    async fn missing_boundary_is_a_protocol_error() {
        let app = Router::new().route(
            "/stream",
            get(|| async { ([(header::CONTENT_TYPE, "image/jpeg")], jpeg(b"x")) }),
        );
        let addr = serve(app).await;

        let session = StreamSession::new(counting_clock());
        session.start_capture(&format!("http://{addr}/stream"));
        wait_until(&session, |s| matches!(s.state(), SessionState::Error(_))).await;

        match session.state() {
            SessionState::Error(msg) => assert!(msg.contains("boundary")),
            other => panic!("expected error state, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn captures_frames_then_returns_to_idle_on_stream_end() {
        let payloads = vec![jpeg(b"first"), jpeg(b"second")];
        let wire = multipart_wire(&payloads);
        let app = Router::new().route(
            "/stream",
            get(move || async move { ([(header::CONTENT_TYPE, MJPEG_CONTENT_TYPE)], wire) }),
        );
        let addr = serve(app).await;

        let session = StreamSession::new(counting_clock());
        session.start_capture(&format!("http://{addr}/stream"));
        wait_until(&session, |s| {
            s.frame_count() == 2 && s.state() == SessionState::Idle
        })
        .await;

        assert_eq!(
            session.frame_at_index(0).unwrap().payload.as_ref(),
            payloads[0].as_slice()
        );
        assert_eq!(
            session.frame_at_index(1).unwrap().payload.as_ref(),
            payloads[1].as_slice()
        );
        assert!(session.frame_at_index(2).is_none());

        // Counting clock stamps 1.0 and 2.0.
        assert!(session.frame_at_time(0.5).is_none());
        assert_eq!(
            session.frame_at_time(1.5).unwrap().payload.as_ref(),
            payloads[0].as_slice()
        );
        assert_eq!(
            session.frame_at_time(10.0).unwrap().payload.as_ref(),
            payloads[1].as_slice()
        );
    }

    #[tokio::test]
    async fn stop_is_silent_and_keeps_frames() {
        let first = multipart_wire(&[jpeg(b"only")]);
        let app = Router::new().route(
            "/stream",
            get(move || async move {
                let chunks = futures_util::stream::iter(vec![Ok::<Bytes, Infallible>(
                    Bytes::from(first),
                )])
                .chain(futures_util::stream::pending());
                (
                    [(header::CONTENT_TYPE, MJPEG_CONTENT_TYPE)],
                    Body::from_stream(chunks),
                )
            }),
        );
        let addr = serve(app).await;

        let session = StreamSession::new(counting_clock());
        session.start_capture(&format!("http://{addr}/stream"));
        wait_until(&session, |s| {
            s.frame_count() == 1 && s.state() == SessionState::Capturing
        })
        .await;

        session.stop_capture();
        assert_eq!(session.state(), SessionState::Idle);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.frame_count(), 1);
    }

    #[tokio::test]
    async fn start_capture_replaces_an_active_run() {
        let endless = multipart_wire(&[jpeg(b"old")]);
        let finite = multipart_wire(&[jpeg(b"new-a"), jpeg(b"new-b")]);
        let app = Router::new()
            .route(
                "/endless",
                get(move || async move {
                    let chunks = futures_util::stream::iter(vec![Ok::<Bytes, Infallible>(
                        Bytes::from(endless),
                    )])
                    .chain(futures_util::stream::pending());
                    (
                        [(header::CONTENT_TYPE, MJPEG_CONTENT_TYPE)],
                        Body::from_stream(chunks),
                    )
                }),
            )
            .route(
                "/finite",
                get(move || async move { ([(header::CONTENT_TYPE, MJPEG_CONTENT_TYPE)], finite) }),
            );
        let addr = serve(app).await;

        let session = StreamSession::new(counting_clock());
        session.start_capture(&format!("http://{addr}/endless"));
        wait_until(&session, |s| s.frame_count() == 1).await;
        let old_handle = session.frame_at_index(0).unwrap().handle;

        session.start_capture(&format!("http://{addr}/finite"));
        wait_until(&session, |s| {
            s.frame_count() == 2 && s.state() == SessionState::Idle
        })
        .await;

        // The replaced run's frames were released with its store.
        assert!(!old_handle.is_valid());
        assert_eq!(
            session.frame_at_index(0).unwrap().payload.as_ref(),
            jpeg(b"new-a").as_slice()
        );
    }

    #[tokio::test]
    async fn clear_frames_keeps_capturing() {
        let wire = multipart_wire(&[jpeg(b"only")]);
        let app = Router::new().route(
            "/stream",
            get(move || async move { ([(header::CONTENT_TYPE, MJPEG_CONTENT_TYPE)], wire) }),
        );
        let addr = serve(app).await;

        let session = StreamSession::new(counting_clock());
        session.start_capture(&format!("http://{addr}/stream"));
        wait_until(&session, |s| s.frame_count() == 1).await;

        let handle = session.frame_at_index(0).unwrap().handle;
        session.clear_frames();
        assert_eq!(session.frame_count(), 0);
        assert!(!handle.is_valid());
    }

    #[tokio::test]
    async fn dispose_is_terminal() {
        let wire = multipart_wire(&[jpeg(b"only")]);
        let app = Router::new().route(
            "/stream",
            get(move || async move { ([(header::CONTENT_TYPE, MJPEG_CONTENT_TYPE)], wire) }),
        );
        let addr = serve(app).await;

        let session = StreamSession::new(counting_clock());
        session.start_capture(&format!("http://{addr}/stream"));
        wait_until(&session, |s| s.frame_count() == 1).await;
        let handle = session.frame_at_index(0).unwrap().handle;

        session.dispose();
        assert_eq!(session.frame_count(), 0);
        assert!(!handle.is_valid());
        assert_eq!(session.state(), SessionState::Idle);

        session.start_capture(&format!("http://{addr}/stream"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(session.frame_count(), 0);
        assert_eq!(session.state(), SessionState::Idle);
    }
}
