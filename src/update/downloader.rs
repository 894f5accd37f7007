//! Resumable artifact downloads with integrity verification.
//!
//! # Download Layout
//!
//! ```text
//! downloads/
//! ├── PersonalFinanceDashboard-1.0.1.exe            # verified artifact
//! ├── PersonalFinanceDashboard-1.0.2.exe.part       # bytes received so far
//! └── PersonalFinanceDashboard-1.0.2.exe.part.json  # which manifest the part belongs to
//! ```
//!
//! A `.part` file is only resumed when its sidecar names the same download
//! URL, size and SHA-256 as the manifest being fetched. Otherwise it is
//! discarded and the transfer starts from zero. If the server ignores the
//! range request the transfer restarts from zero as well. A `.part` file that
//! already holds every byte is moved into place without another request.
//!
//! Nothing leaves this module unverified: [`Downloader::download`] returns a
//! [`VerifiedArtifact`] only after size and SHA-256 both match.

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime};
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::core::UpdateError;
use crate::update::failover::{DownloadSource, FailoverSelector};
use crate::update::manifest::VersionManifest;
use crate::update::session::DownloadProgress;
use crate::update::transport::Transport;
use crate::update::verification::ChecksumVerifier;
use crate::utils::ensure_dir;

const PART_SUFFIX: &str = ".part";
const META_SUFFIX: &str = ".part.json";

/// Minimum spacing between progress callbacks.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Cancellation signal shared between a download and whoever may stop it.
///
/// The transfer waits on [`cancelled`](Self::cancelled) alongside the next
/// chunk, so a stalled stream still stops promptly.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<CancelState>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::SeqCst);
        self.0.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.cancelled.store(false, Ordering::SeqCst);
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let notified = self.0.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

/// An artifact whose size and checksum matched its manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedArtifact {
    pub path: PathBuf,
    pub manifest: VersionManifest,
    pub sha256: String,
    pub size: u64,
}

/// Sidecar recording which manifest a `.part` file belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct PartialDownload {
    download_url: String,
    download_size: u64,
    sha256: String,
}

impl PartialDownload {
    fn for_manifest(manifest: &VersionManifest) -> Self {
        Self {
            download_url: manifest.download_url.clone(),
            download_size: manifest.download_size,
            sha256: manifest.checksum.sha256().unwrap_or_default().to_string(),
        }
    }
}

/// Gates progress callbacks by time and byte thresholds.
struct ProgressThrottle {
    started: Instant,
    start_bytes: u64,
    last_emit: Option<(Instant, u64)>,
    total: u64,
}

impl ProgressThrottle {
    fn new(start_bytes: u64, total: u64) -> Self {
        Self {
            started: Instant::now(),
            start_bytes,
            last_emit: None,
            total,
        }
    }

    /// Progress to report for `done` bytes, or `None` to stay quiet.
    fn update(&mut self, done: u64) -> Option<DownloadProgress> {
        let now = Instant::now();
        let step = (self.total / 100).max(1);
        let due = match self.last_emit {
            None => true,
            Some((at, bytes)) => {
                done >= self.total
                    || now.duration_since(at) >= PROGRESS_INTERVAL
                    || done.saturating_sub(bytes) >= step
            }
        };
        if !due {
            return None;
        }
        self.last_emit = Some((now, done));

        let elapsed = now.duration_since(self.started).as_secs_f64();
        let transferred = done.saturating_sub(self.start_bytes);
        let bytes_per_sec = if elapsed > 0.0 { (transferred as f64 / elapsed) as u64 } else { 0 };
        let eta_secs = (bytes_per_sec > 0)
            .then(|| self.total.saturating_sub(done).div_ceil(bytes_per_sec));

        Some(DownloadProgress {
            bytes_done: done,
            bytes_total: self.total,
            bytes_per_sec,
            eta_secs,
        })
    }
}

/// Streams update artifacts into the download directory.
pub struct Downloader {
    transport: Arc<dyn Transport>,
    download_dir: PathBuf,
}

impl Downloader {
    pub fn new(transport: Arc<dyn Transport>, download_dir: impl Into<PathBuf>) -> Self {
        Self {
            transport,
            download_dir: download_dir.into(),
        }
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// Final path of the artifact for `manifest`.
    pub fn artifact_path(&self, manifest: &VersionManifest) -> PathBuf {
        self.download_dir.join(manifest.artifact_name())
    }

    pub fn part_path(&self, manifest: &VersionManifest) -> PathBuf {
        self.download_dir.join(format!("{}{PART_SUFFIX}", manifest.artifact_name()))
    }

    fn meta_path(&self, manifest: &VersionManifest) -> PathBuf {
        self.download_dir.join(format!("{}{META_SUFFIX}", manifest.artifact_name()))
    }

    /// Fetch and verify the artifact described by `manifest`.
    ///
    /// `sources` lists places serving the same artifact in preference order;
    /// a network failure on one moves to the next, keeping received bytes,
    /// and a mirror missing the file is skipped. An empty list means
    /// `manifest.download_url` only. When `selector` is given, every source
    /// backed by an endpoint reports its outcome to it.
    ///
    /// # Errors
    ///
    /// - [`UpdateError::DiskSpace`] before any byte is written
    /// - [`UpdateError::Network`] when every source failed
    /// - [`UpdateError::Cancelled`] when `cancel` fired; the partial file is kept
    /// - [`UpdateError::Integrity`] on size or SHA-256 mismatch; files are removed
    pub async fn download(
        &self,
        manifest: &VersionManifest,
        sources: &[DownloadSource],
        selector: Option<&FailoverSelector>,
        on_progress: &(dyn Fn(DownloadProgress) + Send + Sync),
        cancel: &CancelFlag,
    ) -> Result<VerifiedArtifact, UpdateError> {
        let path = self.fetch(manifest, sources, selector, on_progress, cancel).await?;
        self.verify(&path, manifest).await
    }

    /// Transfer the artifact to its final path without verifying it.
    pub async fn fetch(
        &self,
        manifest: &VersionManifest,
        sources: &[DownloadSource],
        selector: Option<&FailoverSelector>,
        on_progress: &(dyn Fn(DownloadProgress) + Send + Sync),
        cancel: &CancelFlag,
    ) -> Result<PathBuf, UpdateError> {
        ensure_dir(&self.download_dir)
            .map_err(|e| UpdateError::io("creating", &self.download_dir, e))?;

        let final_path = self.artifact_path(manifest);
        if file_len(&final_path).await == Some(manifest.download_size) {
            debug!("Artifact already present at {}", final_path.display());
            return Ok(final_path);
        }

        let offset = self.resume_offset(manifest).await?;
        self.check_disk_space(manifest.download_size.saturating_sub(offset))?;

        let fallback = [DownloadSource::direct(&manifest.download_url)];
        let sources = if sources.is_empty() { &fallback[..] } else { sources };
        let part = self.part_path(manifest);

        let mut last_error = None;
        for (index, source) in sources.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(UpdateError::Cancelled);
            }
            if file_len(&part).await == Some(manifest.download_size) {
                debug!("Partial download already complete");
                return self.complete(manifest, &final_path).await;
            }

            let started = tokio::time::Instant::now();
            let outcome = self.transfer(manifest, &source.url, on_progress, cancel).await;
            if let (Some(selector), Some(endpoint_id)) = (selector, &source.endpoint_id) {
                selector.record_outcome(endpoint_id, &outcome, started.elapsed()).await;
            }

            match outcome {
                Ok(()) => return self.complete(manifest, &final_path).await,
                Err(e) if e.is_retryable() => {
                    warn!("Download from {} failed: {}", source.url, e);
                    if let (Some(selector), Some(from)) = (selector, &source.endpoint_id) {
                        let to = sources.get(index + 1).and_then(|s| s.endpoint_id.as_deref());
                        selector.record_failover(from, to, &e.to_string()).await;
                    }
                    last_error = Some(e);
                }
                Err(e @ UpdateError::NotFound { .. }) => {
                    debug!(mirrored = source.mirrored, "Artifact not found at {}", source.url);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error
            .unwrap_or_else(|| UpdateError::network(&manifest.download_url, "no download source")))
    }

    /// Move a complete `.part` file to its final path.
    async fn complete(
        &self,
        manifest: &VersionManifest,
        final_path: &Path,
    ) -> Result<PathBuf, UpdateError> {
        let part = self.part_path(manifest);
        tokio::fs::rename(&part, final_path)
            .await
            .map_err(|e| UpdateError::io("moving", &part, e))?;
        let _ = tokio::fs::remove_file(self.meta_path(manifest)).await;
        info!(
            version = %manifest.version,
            "Downloaded {} bytes to {}",
            manifest.download_size,
            final_path.display()
        );
        Ok(final_path.to_path_buf())
    }

    /// Length of a resumable `.part` file for `manifest`, resetting it when it
    /// belongs to something else.
    async fn resume_offset(&self, manifest: &VersionManifest) -> Result<u64, UpdateError> {
        let part = self.part_path(manifest);
        let meta = self.meta_path(manifest);
        let expected = PartialDownload::for_manifest(manifest);

        let recorded = tokio::fs::read(&meta)
            .await
            .ok()
            .and_then(|bytes| serde_json::from_slice::<PartialDownload>(&bytes).ok());
        let existing = file_len(&part).await;

        if let (Some(recorded), Some(len)) = (&recorded, existing)
            && *recorded == expected
            && len <= manifest.download_size
        {
            info!("Resuming download of {} at byte {}", manifest.artifact_name(), len);
            return Ok(len);
        }

        if existing.is_some() {
            debug!("Discarding stale partial download {}", part.display());
        }
        let _ = tokio::fs::remove_file(&part).await;

        let content =
            serde_json::to_vec(&expected).map_err(|e| UpdateError::parse("download metadata", e))?;
        tokio::fs::write(&meta, content)
            .await
            .map_err(|e| UpdateError::io("writing", &meta, e))?;
        Ok(0)
    }

    fn check_disk_space(&self, required: u64) -> Result<(), UpdateError> {
        let available = fs4::available_space(&self.download_dir)
            .map_err(|e| UpdateError::io("checking free space on", &self.download_dir, e))?;
        if available < required {
            return Err(UpdateError::DiskSpace {
                path: self.download_dir.display().to_string(),
                required,
                available,
            });
        }
        Ok(())
    }

    /// Append the remainder of the artifact from `url` to the `.part` file.
    async fn transfer(
        &self,
        manifest: &VersionManifest,
        url: &str,
        on_progress: &(dyn Fn(DownloadProgress) + Send + Sync),
        cancel: &CancelFlag,
    ) -> Result<(), UpdateError> {
        let part = self.part_path(manifest);
        let total = manifest.download_size;
        let offset = file_len(&part).await.unwrap_or(0);

        let mut stream = self.transport.open(url, offset).await?;
        let mut done = if stream.partial { offset } else { 0 };
        if offset > 0 && !stream.partial {
            info!("Server ignored range request, restarting {} from zero", url);
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(stream.partial)
            .truncate(!stream.partial)
            .open(&part)
            .await
            .map_err(|e| UpdateError::io("opening", &part, e))?;

        let mut throttle = ProgressThrottle::new(done, total);
        if let Some(progress) = throttle.update(done) {
            on_progress(progress);
        }

        loop {
            let next = tokio::select! {
                next = stream.body.next() => next,
                () = cancel.cancelled() => None,
            };
            if cancel.is_cancelled() {
                file.flush().await.map_err(|e| UpdateError::io("writing", &part, e))?;
                info!("Download cancelled at {} of {} bytes", done, total);
                return Err(UpdateError::Cancelled);
            }
            let Some(chunk) = next else {
                break;
            };

            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    file.flush().await.map_err(|e| UpdateError::io("writing", &part, e))?;
                    return Err(e);
                }
            };

            done += chunk.len() as u64;
            if done > total {
                drop(file);
                self.discard(manifest).await;
                return Err(UpdateError::Integrity {
                    algorithm: "size".into(),
                    expected: total.to_string(),
                    actual: format!("more than {total}"),
                });
            }
            file.write_all(&chunk).await.map_err(|e| UpdateError::io("writing", &part, e))?;

            if let Some(progress) = throttle.update(done) {
                on_progress(progress);
            }
        }

        file.flush().await.map_err(|e| UpdateError::io("writing", &part, e))?;
        file.sync_all().await.map_err(|e| UpdateError::io("syncing", &part, e))?;

        if done < total {
            return Err(UpdateError::network(
                url,
                format!("connection closed after {done} of {total} bytes"),
            ));
        }
        Ok(())
    }

    /// Check size and checksums of a fetched artifact.
    ///
    /// On any mismatch the artifact and partial files are deleted.
    pub async fn verify(
        &self,
        path: &Path,
        manifest: &VersionManifest,
    ) -> Result<VerifiedArtifact, UpdateError> {
        let size = file_len(path).await.unwrap_or(0);
        if size != manifest.download_size {
            self.discard(manifest).await;
            return Err(UpdateError::Integrity {
                algorithm: "size".into(),
                expected: manifest.download_size.to_string(),
                actual: size.to_string(),
            });
        }

        match ChecksumVerifier::verify(path, &manifest.checksum).await {
            Ok(report) => Ok(VerifiedArtifact {
                path: path.to_path_buf(),
                manifest: manifest.clone(),
                sha256: report.sha256,
                size,
            }),
            Err(e) => {
                warn!("Discarding corrupt artifact {}: {}", path.display(), e);
                self.discard(manifest).await;
                Err(e)
            }
        }
    }

    /// Remove the artifact and any partial state for `manifest`.
    pub async fn discard(&self, manifest: &VersionManifest) {
        for path in [
            self.artifact_path(manifest),
            self.part_path(manifest),
            self.meta_path(manifest),
        ] {
            if let Err(e) = tokio::fs::remove_file(&path).await
                && e.kind() != std::io::ErrorKind::NotFound
            {
                warn!("Failed to remove {}: {}", path.display(), e);
            }
        }
    }

    /// Remove only the resumable partial state for `manifest`.
    pub async fn cleanup_partial(&self, manifest: &VersionManifest) {
        let _ = tokio::fs::remove_file(self.part_path(manifest)).await;
        let _ = tokio::fs::remove_file(self.meta_path(manifest)).await;
    }

    /// Delete all but the `keep` most recent completed artifacts.
    ///
    /// Partial downloads and `in_use` are left alone and not counted.
    /// Returns the number of files removed.
    pub async fn clean_old_downloads(
        &self,
        keep: usize,
        in_use: Option<&Path>,
    ) -> Result<usize, UpdateError> {
        let mut entries = match tokio::fs::read_dir(&self.download_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(UpdateError::io("listing", &self.download_dir, e)),
        };

        let mut artifacts: Vec<(SystemTime, PathBuf)> = Vec::new();
        while let Some(entry) =
            entries.next_entry().await.map_err(|e| UpdateError::io("listing", &self.download_dir, e))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(PART_SUFFIX) || name.ends_with(META_SUFFIX) {
                continue;
            }
            if in_use.is_some_and(|held| held == entry.path()) {
                continue;
            }
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if metadata.is_file() {
                let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                artifacts.push((modified, entry.path()));
            }
        }

        artifacts.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));
        let mut removed = 0;
        for (_, path) in artifacts.into_iter().skip(keep) {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    debug!("Removed old download {}", path.display());
                    removed += 1;
                }
                Err(e) => warn!("Failed to remove old download {}: {}", path.display(), e),
            }
        }
        Ok(removed)
    }
}

async fn file_len(path: &Path) -> Option<u64> {
    tokio::fs::metadata(path).await.ok().filter(|m| m.is_file()).map(|m| m.len())
}
