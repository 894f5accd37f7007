//! The update session state machine.
//!
//! [`UpdateManager`] owns the single [`UpdateSession`] of the process and
//! drives it through check → download → verify → install, applying the
//! configured policy (channel, interval, auto-download/install, skip list,
//! deferral, required override). Every state change is broadcast as a
//! [`SessionEvent`].
//!
//! # Session Guard
//!
//! A check is refused while a session is active; the caller gets the
//! current session back unchanged. The periodic scheduler and manual checks
//! go through the same [`UpdateManager::check`] entry point.
//!
//! # Failures
//!
//! Operational failures (network, integrity, disk space, install) end the
//! session in `Failed` or `RolledBack` with the error recorded on it; the
//! operation itself returns `Ok` with that snapshot. `Err` is reserved for
//! misuse such as installing without a verified artifact, cancelling an
//! install, or skipping a required update.

use chrono::Utc;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{DataDir, Deferral, SettingsStore, UpdateSettings};
use crate::core::{RollbackResult, UpdateError};
use crate::update::backup::{BackupManager, BackupRecord};
use crate::update::client::ManifestClient;
use crate::update::downloader::{CancelFlag, Downloader, VerifiedArtifact};
use crate::update::failover::{EndpointSummary, FailoverEvent, FailoverSelector};
use crate::update::installer::{InstallOptions, Installer};
use crate::update::manifest::VersionManifest;
use crate::update::session::{
    CheckTrigger, DownloadProgress, SessionEvent, SessionState, UpdateSession,
};
use crate::update::transport::Transport;
use crate::update::version_check::{
    CachedManifest, InstalledVersion, LocalVersion, VersionCache, VersionOrdering, compare,
};

const EVENT_CAPACITY: usize = 64;

/// Caller choices for [`UpdateManager::install`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstallRequest {
    /// Explicitly opt out of the pre-install backup. Refused for required updates.
    pub skip_backup: bool,
}

/// Orchestrates update sessions for one installed application.
pub struct UpdateManager {
    settings: tokio::sync::Mutex<SettingsStore>,
    transport: Arc<dyn Transport>,
    selector: RwLock<Arc<FailoverSelector>>,
    client: ManifestClient,
    downloader: Downloader,
    installer: Installer,
    cache: VersionCache,
    fallback_version: LocalVersion,
    session: Mutex<UpdateSession>,
    artifact: Mutex<Option<VerifiedArtifact>>,
    cancel: CancelFlag,
    cleanup_on_cancel: AtomicBool,
    events: broadcast::Sender<SessionEvent>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl UpdateManager {
    /// Build a manager from explicit settings; nothing is read from disk here.
    pub fn new(
        data_dir: &DataDir,
        settings: SettingsStore,
        install_dir: impl Into<PathBuf>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let selector = Self::build_selector(settings.get(), &transport);
        let installer = Installer::new(
            install_dir,
            BackupManager::new(data_dir.backups_dir()),
            data_dir.lock_path(),
        );
        let fallback_version = LocalVersion::new("0.0.0");
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            settings: tokio::sync::Mutex::new(settings),
            client: ManifestClient::new(transport.clone()),
            downloader: Downloader::new(transport.clone(), data_dir.downloads_dir()),
            transport,
            selector: RwLock::new(Arc::new(selector)),
            installer,
            cache: VersionCache::new(data_dir.version_cache_path()),
            session: Mutex::new(UpdateSession::idle(fallback_version.clone())),
            fallback_version,
            artifact: Mutex::new(None),
            cancel: CancelFlag::new(),
            cleanup_on_cancel: AtomicBool::new(false),
            events,
        }
    }

    /// Version assumed when the install directory has no version marker.
    #[must_use]
    pub fn with_fallback_version(mut self, version: LocalVersion) -> Self {
        self.session = Mutex::new(UpdateSession::idle(version.clone()));
        self.fallback_version = version;
        self
    }

    fn build_selector(settings: &UpdateSettings, transport: &Arc<dyn Transport>) -> FailoverSelector {
        FailoverSelector::new(
            settings.endpoints.clone(),
            settings.failover_policy(),
            transport.clone(),
        )
    }

    fn selector(&self) -> Arc<FailoverSelector> {
        self.selector.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn installer(&self) -> &Installer {
        &self.installer
    }

    pub fn downloader(&self) -> &Downloader {
        &self.downloader
    }

    pub fn backups(&self) -> &BackupManager {
        self.installer.backups()
    }

    /// Subscribe to session-state-change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Copy of the current session.
    pub fn snapshot(&self) -> UpdateSession {
        lock(&self.session).clone()
    }

    pub async fn settings(&self) -> UpdateSettings {
        self.settings.lock().await.get().clone()
    }

    /// Version currently installed, from the marker or the fallback.
    pub async fn local_version(&self) -> LocalVersion {
        match InstalledVersion::load(self.installer.install_dir()).await {
            Some(marker) => marker.local_version(),
            None => self.fallback_version.clone(),
        }
    }

    /// Last manifest cached for the configured channel.
    pub async fn cached_manifest(&self) -> Option<CachedManifest> {
        let channel = self.settings.lock().await.get().channel;
        self.cache.get(channel).await
    }

    /// Health plus request counters of every endpoint.
    pub async fn endpoint_summary(&self) -> Vec<EndpointSummary> {
        self.selector().summary().await
    }

    /// Probe every endpoint now, ignoring cached health and backoff.
    pub async fn probe_endpoints(&self) -> Vec<EndpointSummary> {
        let selector = self.selector();
        selector.probe_all().await;
        selector.summary().await
    }

    /// Failovers seen by this process, oldest first.
    pub async fn failover_history(&self) -> Vec<FailoverEvent> {
        self.selector().failover_history().await
    }

    fn publish(&self, session: &UpdateSession) {
        // No receivers is fine.
        let _ = self.events.send(session.event());
    }

    /// Apply `change` to the current session and broadcast the result.
    fn modify<R>(&self, change: impl FnOnce(&mut UpdateSession) -> R) -> (R, UpdateSession) {
        let mut session = lock(&self.session);
        let result = change(&mut session);
        self.publish(&session);
        (result, session.clone())
    }

    // -- settings ---------------------------------------------------------

    /// Re-read settings from disk and rebuild the endpoint selector.
    pub async fn reload_settings(&self) -> Result<(), UpdateError> {
        let mut store = self.settings.lock().await;
        store.reload().await?;
        let selector = Self::build_selector(store.get(), &self.transport);
        *self.selector.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(selector);
        info!("Reloaded update settings from {}", store.path().display());
        Ok(())
    }

    /// Write the current settings to disk.
    pub async fn persist_settings(&self) -> Result<(), UpdateError> {
        self.settings.lock().await.persist().await
    }

    /// Change settings in memory and persist them.
    pub async fn update_settings(
        &self,
        change: impl FnOnce(&mut UpdateSettings) -> Result<(), UpdateError>,
    ) -> Result<UpdateSettings, UpdateError> {
        let mut store = self.settings.lock().await;
        let before = store.get().clone();
        store.update(change)?;
        store.persist().await?;

        let after = store.get().clone();
        if before.endpoints != after.endpoints || before.failover_policy_key() != after.failover_policy_key() {
            let selector = Self::build_selector(&after, &self.transport);
            *self.selector.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(selector);
        }
        Ok(after)
    }

    // -- check ------------------------------------------------------------

    /// Check for an update.
    ///
    /// Refused while another session is active: the current session is
    /// returned unchanged. Scheduled and startup checks are answered from the
    /// version cache while it is younger than the check interval. An
    /// available update is downloaded and installed right away when policy
    /// allows and the manifest is `auto_update_eligible`.
    pub async fn check(&self, trigger: CheckTrigger) -> Result<UpdateSession, UpdateError> {
        let settings = self.settings().await;
        if settings.endpoints.is_empty() {
            return Err(UpdateError::Config {
                message: "no update endpoints configured".to_string(),
            });
        }

        let local = self.local_version().await;
        let claimed = {
            let mut session = lock(&self.session);
            if session.state.is_active() {
                debug!(state = %session.state, "Check refused, session already active");
                return Ok(session.clone());
            }
            let mut fresh = UpdateSession::idle(local.clone());
            fresh.trigger = Some(trigger);
            fresh.transition(SessionState::Checking)?;
            *session = fresh;
            *lock(&self.artifact) = None;
            self.publish(&session);
            session.id
        };
        info!(session = %claimed, ?trigger, channel = %settings.channel, "Checking for updates");

        let fetched = self.fetch_manifest(&settings, trigger).await;
        let (offered, eligible, snapshot) = {
            let mut session = lock(&self.session);
            if session.id != claimed || session.state != SessionState::Checking {
                debug!("Check result discarded, session was cancelled");
                return Ok(session.clone());
            }

            let manifest = match fetched {
                Ok(manifest) => manifest,
                Err(e) => {
                    warn!(session = %claimed, "Update check failed: {}", e);
                    session.fail(&e);
                    self.publish(&session);
                    return Ok(session.clone());
                }
            };

            let ordering = compare(&local, &manifest.version, manifest.build_number);
            let offered = ordering == VersionOrdering::Newer && self.is_offered(&settings, &manifest);
            if offered {
                session.transition(SessionState::UpdateAvailable)?;
                info!(
                    current = %local.version,
                    available = %manifest.version,
                    required = manifest.required,
                    "Update available"
                );
            } else {
                session.transition(SessionState::Idle)?;
                debug!(?ordering, version = %manifest.version, "No update offered");
            }
            let eligible = manifest.auto_update_eligible;
            session.current_manifest = Some(manifest);
            self.publish(&session);
            (offered, eligible, session.clone())
        };

        if offered && settings.auto_download && eligible {
            let snapshot = self.download().await?;
            if snapshot.state == SessionState::Verifying && settings.auto_install {
                return self.install(InstallRequest::default()).await;
            }
            return Ok(snapshot);
        }
        Ok(snapshot)
    }

    async fn fetch_manifest(
        &self,
        settings: &UpdateSettings,
        trigger: CheckTrigger,
    ) -> Result<VersionManifest, UpdateError> {
        if trigger != CheckTrigger::Manual
            && let Some(cached) = self.cache.get(settings.channel).await
            && cached.is_valid(settings.check_interval().as_secs())
        {
            debug!(checked_at = %cached.checked_at, "Using cached manifest");
            return Ok(cached.manifest);
        }

        let selector = self.selector();
        let (endpoint, manifest) =
            self.client.fetch_with_failover(&selector, settings.channel).await?;
        debug!(endpoint = %endpoint.id, "Manifest served");

        if let Err(e) = self.cache.put(&manifest).await {
            warn!("Failed to cache manifest: {}", e);
        }
        Ok(manifest)
    }

    /// Skip list and deferral apply unless the update is required.
    fn is_offered(&self, settings: &UpdateSettings, manifest: &VersionManifest) -> bool {
        if manifest.required {
            return true;
        }
        if settings.is_skipped(&manifest.version) {
            info!(version = %manifest.version, "Version is on the skip list");
            return false;
        }
        if settings.is_deferred(&manifest.version, Utc::now()) {
            info!(version = %manifest.version, "Version is deferred");
            return false;
        }
        true
    }

    // -- download ---------------------------------------------------------

    /// Download and verify the available update.
    ///
    /// On success the session waits in `Verifying` with the verified
    /// artifact until [`install`](Self::install) is called.
    pub async fn download(&self) -> Result<UpdateSession, UpdateError> {
        let (claimed, manifest) = {
            let mut session = lock(&self.session);
            if session.state != SessionState::UpdateAvailable {
                return Err(UpdateError::InvalidTransition {
                    state: session.state,
                    action: "download".to_string(),
                });
            }
            let Some(manifest) = session.current_manifest.clone() else {
                return Err(UpdateError::InvalidTransition {
                    state: session.state,
                    action: "download without a manifest".to_string(),
                });
            };
            session.transition(SessionState::Downloading)?;
            session.progress = Some(DownloadProgress {
                bytes_total: manifest.download_size,
                ..DownloadProgress::default()
            });
            self.cancel.reset();
            self.cleanup_on_cancel.store(false, Ordering::SeqCst);
            self.publish(&session);
            (session.id, manifest)
        };

        let selector = self.selector();
        let sources = selector.download_candidates(&manifest.download_url).await;
        let on_progress = |progress: DownloadProgress| {
            let mut session = lock(&self.session);
            if session.id == claimed && session.state == SessionState::Downloading {
                session.progress = Some(progress);
                self.publish(&session);
            }
        };

        let fetched = self
            .downloader
            .fetch(&manifest, &sources, Some(selector.as_ref()), &on_progress, &self.cancel)
            .await;

        let path = match fetched {
            Ok(path) => path,
            Err(e) => return Ok(self.finish_download_error(claimed, &manifest, e).await),
        };

        {
            let mut session = lock(&self.session);
            if session.id != claimed || session.state != SessionState::Downloading {
                return Ok(session.clone());
            }
            session.transition(SessionState::Verifying)?;
            self.publish(&session);
        }

        let verified = match self.downloader.verify(&path, &manifest).await {
            Ok(artifact) => artifact,
            Err(e) => return Ok(self.finish_download_error(claimed, &manifest, e).await),
        };

        let held = verified.path.clone();
        let sha256 = verified.sha256.clone();
        if !self.hold_artifact(claimed, verified) {
            debug!("Verified artifact dropped, session moved on");
            return Ok(self.snapshot());
        }
        info!(version = %manifest.version, %sha256, "Update downloaded and verified");

        let keep = self.settings.lock().await.get().keep_downloads;
        if let Err(e) = self.downloader.clean_old_downloads(keep, Some(&held)).await {
            warn!("Failed to clean old downloads: {}", e);
        }

        Ok(self.snapshot())
    }

    /// Keep `artifact` for install if session `claimed` is still verifying.
    fn hold_artifact(&self, claimed: uuid::Uuid, artifact: VerifiedArtifact) -> bool {
        let session = lock(&self.session);
        if session.id != claimed || session.state != SessionState::Verifying {
            return false;
        }
        *lock(&self.artifact) = Some(artifact);
        true
    }

    async fn finish_download_error(
        &self,
        claimed: uuid::Uuid,
        manifest: &VersionManifest,
        error: UpdateError,
    ) -> UpdateSession {
        if matches!(error, UpdateError::Cancelled) {
            if self.cleanup_on_cancel.load(Ordering::SeqCst) {
                self.downloader.cleanup_partial(manifest).await;
            }
            let (_, snapshot) = self.modify(|session| {
                if session.id == claimed && session.state != SessionState::Idle {
                    session.progress = None;
                    let _ = session.transition(SessionState::Idle);
                }
            });
            info!("Download cancelled");
            return snapshot;
        }

        warn!(version = %manifest.version, "Download failed: {}", error);
        let (_, snapshot) = self.modify(|session| {
            let running =
                matches!(session.state, SessionState::Downloading | SessionState::Verifying);
            if session.id == claimed && running {
                session.fail(&error);
            }
        });
        snapshot
    }

    // -- install ----------------------------------------------------------

    /// Install the verified artifact.
    ///
    /// A backup is taken unless the user opted out, either through
    /// `backup_before_update = false` or [`InstallRequest::skip_backup`].
    /// Required updates always take a backup. The opt-out is recorded on
    /// the session.
    pub async fn install(&self, request: InstallRequest) -> Result<UpdateSession, UpdateError> {
        let settings = self.settings().await;

        let (artifact, local, options) = {
            let mut session = lock(&self.session);
            if session.state != SessionState::Verifying {
                return Err(UpdateError::InvalidTransition {
                    state: session.state,
                    action: "install".to_string(),
                });
            }
            let Some(artifact) = lock(&self.artifact).clone() else {
                return Err(UpdateError::InvalidTransition {
                    state: session.state,
                    action: "install before verification finished".to_string(),
                });
            };

            let required = artifact.manifest.required;
            if required && request.skip_backup {
                return Err(UpdateError::RequiredUpdate {
                    version: artifact.manifest.version.clone(),
                    action: "installed without a backup".to_string(),
                });
            }
            session.backup_skipped =
                !required && (request.skip_backup || !settings.backup_before_update);
            session.transition(SessionState::Installing)?;
            self.publish(&session);
            let options = InstallOptions {
                create_backup: !session.backup_skipped,
            };
            (artifact, session.local_version.clone(), options)
        };

        if !artifact.manifest.rollback_supported {
            warn!(
                version = %artifact.manifest.version,
                "Release does not support rolling back once installed"
            );
        }
        let outcome = self.installer.install(&artifact, &local, options).await;

        let (_, snapshot) = self.modify(|session| match &outcome {
            Ok(result) => {
                session.backup_id.clone_from(&result.backup_id);
                session.local_version =
                    LocalVersion::new(&result.version).with_build(result.build_number);
                session.progress = None;
                let _ = session.transition(SessionState::Succeeded);
            }
            Err(e) => {
                session.backup_id = e.rollback().map(|r| r.backup_id.clone());
                session.fail(e);
            }
        });
        *lock(&self.artifact) = None;

        match &outcome {
            Ok(result) => {
                info!(version = %result.version, "Update installed");
                match self.installer.backups().prune(settings.keep_backups).await {
                    Ok(removed) if !removed.is_empty() => debug!(?removed, "Pruned backups"),
                    Ok(_) => {}
                    Err(e) => warn!("Failed to prune backups: {}", e),
                }
            }
            Err(e) if e.is_fatal() => {
                error!(
                    backup_id = e.rollback().map_or("none", |r| r.backup_id.as_str()),
                    attempted_version = %artifact.manifest.version,
                    "Install failed and rollback failed; restore manually from the backup: {}",
                    e
                );
            }
            Err(e) => warn!(attempted_version = %artifact.manifest.version, "Install failed: {}", e),
        }

        Ok(snapshot)
    }

    // -- cancel / skip / defer --------------------------------------------

    /// Cancel the current session.
    ///
    /// A running download stops at the next chunk and the session returns to
    /// `Idle` once it does; `cleanup` also removes the partial file. Other
    /// non-destructive states return to `Idle` immediately.
    ///
    /// # Errors
    ///
    /// [`UpdateError::CancellationRefused`] while installing.
    pub fn cancel(&self, cleanup: bool) -> Result<UpdateSession, UpdateError> {
        let mut session = lock(&self.session);
        match session.state {
            SessionState::Installing => Err(UpdateError::CancellationRefused),
            SessionState::Downloading => {
                self.cleanup_on_cancel.store(cleanup, Ordering::SeqCst);
                self.cancel.cancel();
                info!(session = %session.id, "Cancellation requested");
                Ok(session.clone())
            }
            SessionState::Idle => Ok(session.clone()),
            _ => {
                session.transition(SessionState::Idle)?;
                session.progress = None;
                *lock(&self.artifact) = None;
                self.publish(&session);
                Ok(session.clone())
            }
        }
    }

    fn current_required(&self, version: &str) -> bool {
        lock(&self.session)
            .current_manifest
            .as_ref()
            .is_some_and(|m| m.version == version && m.required)
    }

    /// Stop offering `version`. Refused for a required update.
    pub async fn skip_version(&self, version: &str) -> Result<UpdateSession, UpdateError> {
        if self.current_required(version) {
            return Err(UpdateError::RequiredUpdate {
                version: version.to_string(),
                action: "skipped".to_string(),
            });
        }

        self.update_settings(|s| {
            if !s.is_skipped(version) {
                s.skip_versions.push(version.to_string());
            }
            Ok(())
        })
        .await?;
        info!(version, "Version added to skip list");

        Ok(self.dismiss_offer(version))
    }

    /// Offer `version` again.
    pub async fn clear_skip_version(&self, version: &str) -> Result<bool, UpdateError> {
        let mut removed = false;
        self.update_settings(|s| {
            let before = s.skip_versions.len();
            s.skip_versions.retain(|v| v != version);
            removed = s.skip_versions.len() != before;
            Ok(())
        })
        .await?;
        Ok(removed)
    }

    /// "Remind me later": hide the available update for `hours`.
    pub async fn defer(&self, hours: u64) -> Result<UpdateSession, UpdateError> {
        let manifest = {
            let session = lock(&self.session);
            match (&session.state, &session.current_manifest) {
                (SessionState::UpdateAvailable, Some(manifest)) => manifest.clone(),
                (state, _) => {
                    return Err(UpdateError::InvalidTransition {
                        state: *state,
                        action: "defer".to_string(),
                    });
                }
            }
        };
        if manifest.required {
            return Err(UpdateError::RequiredUpdate {
                version: manifest.version,
                action: "deferred".to_string(),
            });
        }

        let hours = i64::try_from(hours).unwrap_or(i64::MAX).min(24 * 365);
        let until = Utc::now() + chrono::Duration::hours(hours);
        self.update_settings(|s| {
            s.deferred = Some(Deferral {
                version: manifest.version.clone(),
                until,
            });
            Ok(())
        })
        .await?;
        info!(version = %manifest.version, %until, "Update deferred");

        Ok(self.dismiss_offer(&manifest.version))
    }

    fn dismiss_offer(&self, version: &str) -> UpdateSession {
        let (_, snapshot) = self.modify(|session| {
            let offered = session.state == SessionState::UpdateAvailable
                && session.current_manifest.as_ref().is_some_and(|m| m.version == version);
            if offered {
                let _ = session.transition(SessionState::Idle);
            }
        });
        snapshot
    }

    // -- rollback ---------------------------------------------------------

    /// Restore a backup: the given one, or the newest.
    ///
    /// Refused while a session is active.
    pub async fn rollback(&self, backup_id: Option<&str>) -> Result<RollbackResult, UpdateError> {
        {
            let session = lock(&self.session);
            if session.state.is_active() {
                return Err(UpdateError::InvalidTransition {
                    state: session.state,
                    action: "roll back".to_string(),
                });
            }
        }

        let backup_id = match backup_id {
            Some(id) => id.to_string(),
            None => self
                .installer
                .backups()
                .latest()
                .await?
                .map(|b: BackupRecord| b.backup_id)
                .ok_or_else(|| UpdateError::BackupNotFound {
                    backup_id: "latest".to_string(),
                })?,
        };

        let result = self.installer.rollback(&backup_id).await?;
        let local = self.local_version().await;
        self.modify(|session| session.local_version = local);
        Ok(result)
    }

    // -- scheduling -------------------------------------------------------

    /// Run startup and periodic checks in the background.
    ///
    /// The interval is re-read from settings before every wait, so
    /// [`reload_settings`](Self::reload_settings) takes effect on the next cycle.
    pub fn spawn_scheduler(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if manager.settings().await.check_on_startup {
                manager.run_scheduled(CheckTrigger::Startup).await;
            }
            loop {
                let interval = manager.settings().await.check_interval();
                tokio::time::sleep(interval).await;
                manager.run_scheduled(CheckTrigger::Scheduled).await;
            }
        })
    }

    async fn run_scheduled(&self, trigger: CheckTrigger) {
        match self.check(trigger).await {
            Ok(session) => debug!(state = %session.state, ?trigger, "Scheduled check finished"),
            Err(e) => warn!(?trigger, "Scheduled check failed: {}", e),
        }
    }
}

impl UpdateSettings {
    fn failover_policy_key(&self) -> (String, u64, u64, u64) {
        (
            self.health_path.clone(),
            self.probe_timeout_secs,
            self.health_ttl_secs,
            self.failure_backoff_secs,
        )
    }
}
