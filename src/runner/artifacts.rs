//! Persistence of failure screenshots to durable blob storage.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::warn;

/// Number of save attempts before an upload is abandoned.
const MAX_SAVE_ATTEMPTS: u32 = 3;

/// Delay before the first retry; doubles per attempt.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Abstraction over blob storage for testability.
/// Real implementation: `FsArtifactStore`. Tests substitute fakes.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Persist `bytes` under `name` and return a long-lived retrieval
    /// reference (a URL path the API can serve).
    async fn save(&self, name: &str, bytes: &[u8], content_type: &str) -> Result<String>;
}

/// Blob store backed by a local directory, served back over
/// `GET /api/artifacts/{name}`.
pub struct FsArtifactStore {
    root: PathBuf,
    public_prefix: String,
}

impl FsArtifactStore {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            public_prefix: "/api/artifacts".to_string(),
        }
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn save(&self, name: &str, bytes: &[u8], _content_type: &str) -> Result<String> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .context("Failed to create artifacts directory")?;
        let path = self.root.join(name);
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write artifact {}", path.display()))?;
        Ok(format!("{}/{}", self.public_prefix, name))
    }
}

/// Derive the stored object name for a run's screenshot. Matches the
/// `<run-id>-<millis>.png` convention the dashboard links against.
pub fn screenshot_name(run_id: i64) -> String {
    format!("{}-{}.png", run_id, chrono::Utc::now().timestamp_millis())
}

/// Decode and persist one screenshot payload, retrying transient store
/// failures with doubling backoff before giving up.
pub async fn save_screenshot(
    store: &dyn ArtifactStore,
    run_id: i64,
    screenshot_base64: &str,
) -> Result<String> {
    let bytes = BASE64
        .decode(screenshot_base64)
        .context("Screenshot payload is not valid base64")?;
    let name = screenshot_name(run_id);

    let mut delay = RETRY_BASE_DELAY;
    let mut attempt = 1;
    loop {
        match store.save(&name, &bytes, "image/png").await {
            Ok(url) => return Ok(url),
            Err(e) if attempt < MAX_SAVE_ATTEMPTS => {
                warn!(
                    run_id,
                    attempt,
                    error = %e,
                    "Artifact save failed, retrying"
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => {
                return Err(e.context(format!(
                    "Artifact save failed after {} attempts",
                    MAX_SAVE_ATTEMPTS
                )));
            }
        }
    }
}
