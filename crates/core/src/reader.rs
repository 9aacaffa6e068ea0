//! Remote settings document source.
//!
//! The real transport (HTTP remote file service) lives outside this
//! repository; refresh cycles consume it through [`SettingsReader`]. A
//! file-backed implementation with mtime-based staleness ships here for
//! local hosting and tests.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

/// Reads the current settings document as text.
///
/// `read_current` returns `None` when the source is unavailable or its
/// content is older than the staleness tolerance; callers skip the refresh
/// cycle in that case rather than erroring.
#[async_trait]
pub trait SettingsReader: Send + Sync {
    /// Fetch the current document, `None` when unavailable or stale.
    async fn read_current(&self) -> Option<String>;

    /// How often refresh cycles should poll this source.
    fn polling_interval(&self) -> Duration {
        Duration::from_secs(30 * 60)
    }
}

/// `SettingsReader` over a local file.
pub struct FileSettingsReader {
    path: PathBuf,
    polling_interval: Duration,
    /// Maximum accepted document age; `None` accepts any mtime.
    staleness_tolerance: Option<Duration>,
}

impl FileSettingsReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            polling_interval: Duration::from_secs(30 * 60),
            staleness_tolerance: None,
        }
    }

    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    pub fn with_staleness_tolerance(mut self, tolerance: Duration) -> Self {
        self.staleness_tolerance = Some(tolerance);
        self
    }
}

#[async_trait]
impl SettingsReader for FileSettingsReader {
    async fn read_current(&self) -> Option<String> {
        if let Some(tolerance) = self.staleness_tolerance {
            let modified = tokio::fs::metadata(&self.path)
                .await
                .ok()?
                .modified()
                .ok()?;
            let age = modified.elapsed().unwrap_or_default();
            if age > tolerance {
                debug!(path = %self.path.display(), ?age, "settings document is stale");
                return None;
            }
        }

        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => Some(text),
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "settings document unavailable");
                None
            }
        }
    }

    fn polling_interval(&self) -> Duration {
        self.polling_interval
    }
}
