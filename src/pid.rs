//! Minimal PID-file handling: write on startup, remove on clean exit.
//! No staleness detection or locking.

use std::path::Path;

pub async fn write(path: &Path) {
    let pid = std::process::id().to_string();
    if let Err(e) = tokio::fs::write(path, pid).await {
        tracing::warn!(path = %path.display(), error = %e, "failed to write PID file");
    }
}

pub async fn remove(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove PID file"),
    }
}
