use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use frame_reel_core::config::Config;
use frame_reel_core::session::{SessionStatus, StreamSession, TimeSource};
use tracing::info;

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    // Session time: seconds since process start, so frame timestamps line up
    // with a playback timeline rather than wall clock.
    let started = Instant::now();
    let time: Arc<dyn TimeSource> = Arc::new(move || started.elapsed().as_secs_f64());

    let session = StreamSession::with_limits(
        time,
        config.capture.max_frames,
        Duration::from_secs(config.capture.connect_timeout_secs),
    );
    session.set_observer(Arc::new(|status: &SessionStatus| {
        info!(
            capturing = status.is_capturing,
            frames = status.frame_count,
            error = status.error.as_deref().unwrap_or(""),
            "session status"
        );
    }));

    info!(url = config.stream.url, max_frames = config.capture.max_frames, "starting capture");
    session.start_capture(&config.stream.url);

    tokio::signal::ctrl_c().await.ok();

    info!(frames = session.frame_count(), "stopping capture");
    session.stop_capture();
    session.dispose();
}
