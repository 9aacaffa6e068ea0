//! Cross-process cache repository.
//!
//! The cache file is shared by every process on the machine, so mutation
//! follows acquire → read → mutate → write → release under an advisory file
//! lock on a sidecar lock file. The write goes through a temp file and an
//! atomic rename, so a crash mid-write leaves the previous cache intact.
//!
//! Lock acquisition is bounded by a caller-supplied timeout (`None` waits
//! indefinitely); hitting the timeout surfaces `BeaconError::LockTimeout`,
//! which the courtesy engine turns into its conservative fallback.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use tracing::debug;

use beacon_core::BeaconError;

use crate::cache::CachedTargetedNotifications;

/// How long to sleep between lock attempts when waiting with a timeout.
const RETRY_SLEEP: Duration = Duration::from_millis(50);

pub struct CacheRepository {
    path: PathBuf,
}

impl CacheRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Run `mutate` over the cache under the cross-process lock and persist
    /// the result.
    ///
    /// `operation` names the caller for lock-timeout diagnostics.
    pub async fn with_lock<T, F>(
        &self,
        operation: &str,
        timeout: Option<Duration>,
        mutate: F,
    ) -> Result<T, BeaconError>
    where
        F: FnOnce(&mut CachedTargetedNotifications) -> T + Send + 'static,
        T: Send + 'static,
    {
        let path = self.path.clone();
        let lock_path = self.lock_path();
        let operation = operation.to_string();

        tokio::task::spawn_blocking(move || {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }

            let lock_file = OpenOptions::new()
                .create(true)
                .write(true)
                .open(&lock_path)?;
            acquire(&lock_file, &operation, timeout)?;

            let result = (|| {
                let mut cache = match std::fs::read_to_string(&path) {
                    Ok(text) => CachedTargetedNotifications::from_json_lenient(&text),
                    Err(_) => CachedTargetedNotifications::default(),
                };

                let value = mutate(&mut cache);

                let json = cache.to_json()?;
                let tmp_path = path.with_extension("json.tmp");
                let mut tmp = File::create(&tmp_path)?;
                tmp.write_all(json.as_bytes())?;
                tmp.flush()?;
                std::fs::rename(&tmp_path, &path)?;

                Ok::<T, BeaconError>(value)
            })();

            let _ = fs2::FileExt::unlock(&lock_file);
            result
        })
        .await
        .map_err(|e| BeaconError::Other(format!("cache lock task failed: {e}")))?
    }
}

fn acquire(lock_file: &File, operation: &str, timeout: Option<Duration>) -> Result<(), BeaconError> {
    match timeout {
        None => {
            lock_file.lock_exclusive()?;
            Ok(())
        }
        Some(timeout) => {
            let start = Instant::now();
            loop {
                match lock_file.try_lock_exclusive() {
                    Ok(()) => return Ok(()),
                    Err(_) if start.elapsed() < timeout => {
                        debug!(operation, "cache lock busy, retrying");
                        std::thread::sleep(RETRY_SLEEP.min(timeout));
                    }
                    Err(_) => {
                        return Err(BeaconError::LockTimeout {
                            operation: operation.to_string(),
                            timeout,
                        })
                    }
                }
            }
        }
    }
}
