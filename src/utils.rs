//! Utility functions shared across the codebase

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current wall-clock time in fractional seconds since the Unix epoch.
/// Returns 0.0 if system time is before the epoch (fallback behavior).
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs_f64()
}

/// Seconds since `start`, for log lines.
pub fn elapsed_secs(start: tokio::time::Instant, now: tokio::time::Instant) -> f64 {
    now.saturating_duration_since(start).as_secs_f64()
}

/// Resolves on Ctrl-C, or SIGTERM on Unix (e.g. `docker stop`).
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => tracing::warn!("SIGTERM handler unavailable: {e}"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Ctrl-C handler unavailable: {e}");
        std::future::pending::<()>().await;
    }
}
