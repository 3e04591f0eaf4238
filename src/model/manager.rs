//! Model artifact lifecycle: resolve, download, verify, cache.
//!
//! Downloads stream into a staging file and only move into place after
//! verification, so a crash mid-download can never leave a ready-looking
//! artifact that is actually incomplete. Concurrent `ensure` calls for one
//! model coalesce onto a single download through a per-model lock.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::error::EngineError;
use crate::model::catalog::{self, CatalogEntry};

/// Download copy chunk size.
const CHUNK_SIZE: usize = 8 * 1024;

/// Availability of one artifact. Mutated only by [`ModelManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelStatus {
    /// No verified artifact on disk.
    NotDownloaded,
    /// A download is in flight.
    Downloading,
    /// Verified artifact in place; local providers may load it.
    Ready,
    /// Verification failed; a re-download is required.
    Corrupt,
}

/// One model artifact as seen by callers.
#[derive(Debug, Clone)]
pub struct ModelDescriptor {
    /// Catalog name.
    pub name: String,
    /// Expected size in bytes.
    pub expected_size: u64,
    /// Published SHA-256, when available.
    pub checksum: Option<String>,
    /// Cache path of the artifact.
    pub local_path: PathBuf,
    /// Current availability.
    pub status: ModelStatus,
}

/// Download progress snapshot passed to progress callbacks.
#[derive(Debug, Clone)]
pub struct DownloadProgress {
    /// Model being downloaded.
    pub model: String,
    /// Bytes written so far.
    pub downloaded: u64,
    /// Total bytes, when the server reports a length.
    pub total: Option<u64>,
}

/// Progress callback shared across threads.
pub type ProgressFn = dyn Fn(DownloadProgress) + Send + Sync;

/// Fetch failure, before classification.
#[derive(Debug)]
pub enum FetchError {
    /// Cancellation was requested mid-transfer.
    Cancelled,
    /// Transport or protocol failure.
    Failed(String),
}

/// Transport seam for artifact downloads; swapped for a scripted fetcher in
/// tests.
pub trait ModelFetcher: Send + Sync {
    /// Streams `url` into `dest`, reporting `(downloaded, total)` and
    /// honoring `cancel` at chunk boundaries.
    ///
    /// # Errors
    /// `FetchError::Cancelled` on cooperative cancellation, `Failed`
    /// otherwise.
    fn fetch(
        &self,
        url: &str,
        dest: &Path,
        progress: &dyn Fn(u64, Option<u64>),
        cancel: &CancelToken,
    ) -> Result<(), FetchError>;
}

/// Production fetcher over blocking reqwest.
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    /// Builds a client with a bounded connect timeout and no total-request
    /// timeout (artifacts are large; per-chunk progress is the liveness
    /// signal).
    ///
    /// # Errors
    /// Returns an error if the TLS backend cannot initialize.
    pub fn new() -> Result<Self, EngineError> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(None)
            .build()
            .map_err(|e| EngineError::Network(e.to_string()))?;
        Ok(Self { client })
    }
}

impl ModelFetcher for HttpFetcher {
    fn fetch(
        &self,
        url: &str,
        dest: &Path,
        progress: &dyn Fn(u64, Option<u64>),
        cancel: &CancelToken,
    ) -> Result<(), FetchError> {
        let mut response = self
            .client
            .get(url)
            .send()
            .map_err(|e| FetchError::Failed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(FetchError::Failed(format!(
                "HTTP {} from {url}",
                response.status()
            )));
        }

        let total = response.content_length();
        let mut file = fs::File::create(dest).map_err(|e| FetchError::Failed(e.to_string()))?;
        let mut buffer = [0_u8; CHUNK_SIZE];
        let mut downloaded = 0_u64;

        loop {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            let read = response
                .read(&mut buffer)
                .map_err(|e| FetchError::Failed(e.to_string()))?;
            if read == 0 {
                break;
            }
            std::io::Write::write_all(&mut file, &buffer[..read])
                .map_err(|e| FetchError::Failed(e.to_string()))?;
            downloaded += read as u64;
            progress(downloaded, total);
        }

        Ok(())
    }
}

/// Owned catalog row; lets tests inject entries with computed checksums.
#[derive(Debug, Clone)]
pub struct ModelSpec {
    /// Catalog name.
    pub name: String,
    /// Expected size in bytes (0 disables the size check).
    pub expected_size: u64,
    /// Published SHA-256 hex, when available.
    pub sha256: Option<String>,
    /// Download URL.
    pub url: String,
}

impl From<&CatalogEntry> for ModelSpec {
    fn from(entry: &CatalogEntry) -> Self {
        Self {
            name: entry.name.to_owned(),
            expected_size: entry.expected_size,
            sha256: entry.sha256.map(str::to_owned),
            url: entry.url.to_owned(),
        }
    }
}

/// Resolves, downloads, verifies, and caches model artifacts.
///
/// The manager is the sole reader/writer of the cache directory and the sole
/// mutator of per-model status.
pub struct ModelManager {
    cache_dir: PathBuf,
    specs: Vec<ModelSpec>,
    fetcher: Arc<dyn ModelFetcher>,
    states: Mutex<HashMap<String, ModelStatus>>,
    download_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ModelManager {
    /// Creates a manager over the built-in catalog.
    #[must_use]
    pub fn new(cache_dir: PathBuf, fetcher: Arc<dyn ModelFetcher>) -> Self {
        let specs = catalog::CATALOG.iter().map(ModelSpec::from).collect();
        Self::with_catalog(cache_dir, fetcher, specs)
    }

    /// Creates a manager over an explicit catalog.
    #[must_use]
    pub fn with_catalog(
        cache_dir: PathBuf,
        fetcher: Arc<dyn ModelFetcher>,
        specs: Vec<ModelSpec>,
    ) -> Self {
        Self {
            cache_dir,
            specs,
            fetcher,
            states: Mutex::new(HashMap::new()),
            download_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Enumerates known models in catalog order.
    #[must_use]
    pub fn list(&self) -> Vec<ModelDescriptor> {
        self.specs
            .iter()
            .map(|spec| self.describe(spec))
            .collect()
    }

    /// Descriptor for one model, or `None` if unknown.
    #[must_use]
    pub fn descriptor(&self, name: &str) -> Option<ModelDescriptor> {
        self.spec(name).map(|spec| self.describe(&spec))
    }

    /// Whether a model is in the catalog at all.
    #[must_use]
    pub fn knows(&self, name: &str) -> bool {
        self.spec(name).is_some()
    }

    /// Whether a verified artifact for `name` is in place.
    #[must_use]
    pub fn is_ready(&self, name: &str) -> bool {
        self.descriptor(name)
            .is_some_and(|d| d.status == ModelStatus::Ready)
    }

    /// Makes `name` ready, downloading and verifying if necessary.
    ///
    /// Blocking; callers on the async runtime go through
    /// [`ModelManager::ensure_background`]. Concurrent calls for one name
    /// coalesce: one download runs, every caller observes the result.
    ///
    /// # Errors
    /// `ModelDownload` (retryable) on transport failure, `ModelIntegrity`
    /// (fatal) on verification failure, `Cancelled` on cooperative
    /// cancellation.
    pub fn ensure(
        &self,
        name: &str,
        cancel: &CancelToken,
        on_progress: &ProgressFn,
    ) -> Result<ModelDescriptor, EngineError> {
        let spec = self.spec(name).ok_or_else(|| EngineError::ModelDownload {
            model: name.to_owned(),
            reason: "not in catalog".to_owned(),
        })?;

        // One download per model name; later callers block here and then see
        // the artifact the first caller produced.
        let lock = self.download_lock(name);
        let _guard = lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        let path = self.local_path(name);
        if path.exists() {
            if self.verify_file(&spec, &path).is_ok() {
                self.set_status(name, ModelStatus::Ready);
                debug!(model = name, "artifact already cached and verified");
                return Ok(self.describe(&spec));
            }
            warn!(model = name, "cached artifact failed verification, removing");
            let _ = fs::remove_file(&path);
        }

        fs::create_dir_all(&self.cache_dir).map_err(|e| EngineError::ModelDownload {
            model: name.to_owned(),
            reason: format!("cannot create cache directory: {e}"),
        })?;

        self.set_status(name, ModelStatus::Downloading);
        let staging = path.with_extension("tmp");
        info!(model = name, url = %spec.url, "downloading model artifact");

        let model_name = name.to_owned();
        let fetch_result = self.fetcher.fetch(
            &spec.url,
            &staging,
            &|downloaded, total| {
                on_progress(DownloadProgress {
                    model: model_name.clone(),
                    downloaded,
                    total,
                });
            },
            cancel,
        );

        if let Err(err) = fetch_result {
            let _ = fs::remove_file(&staging);
            self.set_status(name, ModelStatus::NotDownloaded);
            return Err(match err {
                FetchError::Cancelled => EngineError::Cancelled,
                FetchError::Failed(reason) => EngineError::ModelDownload {
                    model: name.to_owned(),
                    reason,
                },
            });
        }

        if let Err(err) = self.verify_file(&spec, &staging) {
            let _ = fs::remove_file(&staging);
            self.set_status(name, ModelStatus::Corrupt);
            return Err(err);
        }

        // Atomic publish: a verified artifact or nothing.
        fs::rename(&staging, &path).map_err(|e| EngineError::ModelDownload {
            model: name.to_owned(),
            reason: format!("failed to move artifact into place: {e}"),
        })?;

        self.set_status(name, ModelStatus::Ready);
        info!(model = name, path = %path.display(), "model artifact ready");
        Ok(self.describe(&spec))
    }

    /// Spawns `ensure` on the blocking pool, returning a cancellable handle.
    pub fn ensure_background(
        self: &Arc<Self>,
        name: &str,
        on_progress: Arc<ProgressFn>,
    ) -> EnsureTask {
        let cancel = CancelToken::new();
        let manager = Arc::clone(self);
        let model = name.to_owned();
        let task_cancel = cancel.clone();
        let handle = tokio::task::spawn_blocking(move || {
            manager.ensure(&model, &task_cancel, on_progress.as_ref())
        });
        EnsureTask {
            name: name.to_owned(),
            cancel,
            handle,
        }
    }

    /// Removes cached artifacts that fail verification. Returns the count
    /// removed.
    pub fn purge_corrupt(&self) -> usize {
        let mut removed = 0;
        for spec in &self.specs {
            let path = self.local_path(&spec.name);
            if path.exists() && self.verify_file(spec, &path).is_err() {
                warn!(model = %spec.name, "removing corrupt cached artifact");
                if fs::remove_file(&path).is_ok() {
                    self.set_status(&spec.name, ModelStatus::NotDownloaded);
                    removed += 1;
                }
            }
        }
        removed
    }

    fn spec(&self, name: &str) -> Option<ModelSpec> {
        self.specs.iter().find(|s| s.name == name).cloned()
    }

    fn describe(&self, spec: &ModelSpec) -> ModelDescriptor {
        let path = self.local_path(&spec.name);
        let status = {
            let states = self
                .states
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            states.get(&spec.name).copied()
        }
        .unwrap_or_else(|| {
            if path.exists() {
                // Unverified leftover from a previous run; verify lazily.
                if self.verify_file(spec, &path).is_ok() {
                    ModelStatus::Ready
                } else {
                    ModelStatus::Corrupt
                }
            } else {
                ModelStatus::NotDownloaded
            }
        });

        ModelDescriptor {
            name: spec.name.clone(),
            expected_size: spec.expected_size,
            checksum: spec.sha256.clone(),
            local_path: path,
            status,
        }
    }

    fn local_path(&self, name: &str) -> PathBuf {
        self.cache_dir.join(catalog::artifact_filename(name))
    }

    fn download_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .download_locks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(locks.entry(name.to_owned()).or_default())
    }

    fn set_status(&self, name: &str, status: ModelStatus) {
        let mut states = self
            .states
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        states.insert(name.to_owned(), status);
    }

    fn verify_file(&self, spec: &ModelSpec, path: &Path) -> Result<(), EngineError> {
        let actual_size = fs::metadata(path)
            .map(|m| m.len())
            .map_err(|e| EngineError::ModelIntegrity {
                model: spec.name.clone(),
                expected: format!("{} bytes", spec.expected_size),
                actual: format!("unreadable: {e}"),
            })?;

        // Coarse guard against truncated artifacts: 10 % size tolerance.
        if spec.expected_size > 0 {
            let diff = actual_size.abs_diff(spec.expected_size);
            if diff * 10 > spec.expected_size {
                return Err(EngineError::ModelIntegrity {
                    model: spec.name.clone(),
                    expected: format!("{} bytes", spec.expected_size),
                    actual: format!("{actual_size} bytes"),
                });
            }
        }

        if let Some(expected) = &spec.sha256 {
            let actual = sha256_file(path).map_err(|e| EngineError::ModelIntegrity {
                model: spec.name.clone(),
                expected: expected.clone(),
                actual: format!("unreadable: {e}"),
            })?;
            if &actual != expected {
                return Err(EngineError::ModelIntegrity {
                    model: spec.name.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        Ok(())
    }
}

/// Handle on a background `ensure`; cancelling removes the staging file and
/// restores `NotDownloaded`.
pub struct EnsureTask {
    name: String,
    cancel: CancelToken,
    handle: tokio::task::JoinHandle<Result<ModelDescriptor, EngineError>>,
}

impl EnsureTask {
    /// Model this task is ensuring.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Requests cooperative cancellation of the download.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the background work has completed.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Awaits the download result.
    ///
    /// # Errors
    /// Propagates the `ensure` error; a panicked task maps to
    /// `ModelDownload`.
    pub async fn wait(self) -> Result<ModelDescriptor, EngineError> {
        let name = self.name.clone();
        self.handle
            .await
            .unwrap_or_else(|e| {
                Err(EngineError::ModelDownload {
                    model: name,
                    reason: format!("download task failed: {e}"),
                })
            })
    }
}

/// Serializes background prefetches: selecting a new model cancels the
/// previous in-flight download.
pub struct Prefetcher {
    models: Arc<ModelManager>,
    current: Mutex<Option<EnsureTask>>,
}

impl Prefetcher {
    /// Creates an idle prefetcher.
    #[must_use]
    pub fn new(models: Arc<ModelManager>) -> Self {
        Self {
            models,
            current: Mutex::new(None),
        }
    }

    /// Starts ensuring `name` in the background, cancelling any in-flight
    /// download for a different model. No-op when the artifact is already
    /// ready or the name is unknown.
    pub fn prefetch(&self, name: &str, on_progress: Arc<ProgressFn>) {
        if !self.models.knows(name) || self.models.is_ready(name) {
            return;
        }

        let mut current = self
            .current
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if let Some(task) = current.as_ref() {
            if task.name() == name && !task.is_finished() {
                return;
            }
            task.cancel();
        }

        *current = Some(self.models.ensure_background(name, on_progress));
    }

    /// Cancels any in-flight prefetch.
    pub fn cancel(&self) {
        let current = self
            .current
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(task) = current.as_ref() {
            task.cancel();
        }
    }
}

fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0_u8; CHUNK_SIZE];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_digest(&hasher.finalize()))
}

/// Hex-encodes a digest.
pub(crate) fn hex_digest(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
