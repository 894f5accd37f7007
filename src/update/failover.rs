//! Health-driven selection among redundant update endpoints.
//!
//! Endpoints are kept in priority order (lower `priority` value first). The
//! selector hands out the first endpoint believed healthy, probing it when
//! its cached health has expired. A failed endpoint is skipped until its
//! backoff window passes, then re-probed and restored on success.
//!
//! Health is process-local and never persisted; all timing uses
//! `tokio::time::Instant` so it follows the runtime clock. Alongside health
//! the selector keeps per-endpoint request counters and a bounded history of
//! failover events for diagnostics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::core::{Channel, UpdateError};
use crate::update::transport::Transport;

/// Manifest file name under each channel directory.
pub const MANIFEST_FILE: &str = "version.json";

/// Failover events kept in memory.
const FAILOVER_HISTORY_LIMIT: usize = 100;

/// A hosting target for manifests and artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: String,
    pub base_url: String,
    /// Lower values are preferred.
    #[serde(default)]
    pub priority: u32,
}

impl Endpoint {
    pub fn new(id: impl Into<String>, base_url: impl Into<String>, priority: u32) -> Self {
        Self {
            id: id.into(),
            base_url: base_url.into(),
            priority,
        }
    }

    fn base(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    /// `{base}/{channel}/version.json`
    #[must_use]
    pub fn manifest_url(&self, channel: Channel) -> String {
        format!("{}/{}/{}", self.base(), channel, MANIFEST_FILE)
    }

    #[must_use]
    pub fn health_url(&self, health_path: &str) -> String {
        let path = health_path.trim_start_matches('/');
        if path.is_empty() {
            format!("{}/", self.base())
        } else {
            format!("{}/{}", self.base(), path)
        }
    }
}

/// Probe and backoff timings.
#[derive(Debug, Clone)]
pub struct FailoverPolicy {
    pub health_path: String,
    pub probe_timeout: Duration,
    /// How long a successful probe is trusted.
    pub health_ttl: Duration,
    /// Base backoff after a failure; doubles per consecutive failure.
    pub failure_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for FailoverPolicy {
    fn default() -> Self {
        Self {
            health_path: "/health".to_string(),
            probe_timeout: Duration::from_secs(5),
            health_ttl: Duration::from_secs(300),
            failure_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(600),
        }
    }
}

/// Health record for one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointHealth {
    pub endpoint_id: String,
    pub last_check_time: Option<Instant>,
    pub is_healthy: bool,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    /// Round trip of the most recent health probe.
    pub probe_latency: Option<Duration>,
}

impl EndpointHealth {
    fn unknown(endpoint_id: &str) -> Self {
        Self {
            endpoint_id: endpoint_id.to_string(),
            last_check_time: None,
            is_healthy: false,
            consecutive_failures: 0,
            last_error: None,
            probe_latency: None,
        }
    }

    fn backoff(&self, policy: &FailoverPolicy) -> Duration {
        let exponent = self.consecutive_failures.saturating_sub(1).min(16);
        policy
            .failure_backoff
            .saturating_mul(1u32 << exponent)
            .min(policy.max_backoff)
    }
}

/// Request counters for one endpoint. Health probes are not counted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestStats {
    pub requests: u64,
    /// Requests that ended in a network error.
    pub failures: u64,
    total_latency: Duration,
}

impl RequestStats {
    pub fn successes(&self) -> u64 {
        self.requests - self.failures
    }

    pub fn average_latency(&self) -> Option<Duration> {
        if self.requests == 0 {
            return None;
        }
        let count = u32::try_from(self.requests).unwrap_or(u32::MAX);
        Some(self.total_latency / count)
    }
}

/// A request moved from one endpoint to another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailoverEvent {
    pub from: String,
    /// `None` when no endpoint was left to take over.
    pub to: Option<String>,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Health and traffic of one endpoint, for status displays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSummary {
    pub endpoint: Endpoint,
    pub health: EndpointHealth,
    pub stats: RequestStats,
}

/// One place an artifact can be fetched from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSource {
    pub url: String,
    /// Endpoint serving `url`, when it lives under one.
    pub endpoint_id: Option<String>,
    /// Same path on another endpoint rather than the URL the manifest names.
    pub mirrored: bool,
}

impl DownloadSource {
    /// The manifest's own URL, outside any configured endpoint.
    pub fn direct(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            endpoint_id: None,
            mirrored: false,
        }
    }
}

#[derive(Debug, Default)]
struct Activity {
    requests: HashMap<String, RequestStats>,
    failovers: VecDeque<FailoverEvent>,
}

/// What the selector should do with an endpoint right now.
enum Standing {
    Trusted,
    NeedsProbe,
    BackingOff,
}

/// Chooses which endpoint serves the next request.
pub struct FailoverSelector {
    endpoints: Vec<Endpoint>,
    policy: FailoverPolicy,
    transport: Arc<dyn Transport>,
    health: Mutex<HashMap<String, EndpointHealth>>,
    activity: Mutex<Activity>,
}

impl FailoverSelector {
    pub fn new(
        mut endpoints: Vec<Endpoint>,
        policy: FailoverPolicy,
        transport: Arc<dyn Transport>,
    ) -> Self {
        endpoints.sort_by_key(|e| e.priority);
        let health =
            endpoints.iter().map(|e| (e.id.clone(), EndpointHealth::unknown(&e.id))).collect();
        Self {
            endpoints,
            policy,
            transport,
            health: Mutex::new(health),
            activity: Mutex::new(Activity::default()),
        }
    }

    /// Endpoints in priority order.
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    fn standing(&self, health: &EndpointHealth, now: Instant) -> Standing {
        let Some(checked) = health.last_check_time else {
            return Standing::NeedsProbe;
        };
        let age = now.saturating_duration_since(checked);
        if health.is_healthy {
            if age < self.policy.health_ttl {
                Standing::Trusted
            } else {
                Standing::NeedsProbe
            }
        } else if age < health.backoff(&self.policy) {
            Standing::BackingOff
        } else {
            Standing::NeedsProbe
        }
    }

    /// Highest-priority endpoint currently healthy.
    ///
    /// Endpoints whose cached health has expired are probed in order; an
    /// endpoint still inside its failure backoff is skipped without probing.
    pub async fn select_endpoint(&self) -> Result<Endpoint, UpdateError> {
        for endpoint in &self.endpoints {
            let standing = {
                let health = self.health.lock().await;
                health
                    .get(&endpoint.id)
                    .map_or(Standing::NeedsProbe, |h| self.standing(h, Instant::now()))
            };

            match standing {
                Standing::Trusted => return Ok(endpoint.clone()),
                Standing::BackingOff => {
                    debug!(endpoint = %endpoint.id, "Skipping endpoint in backoff");
                }
                Standing::NeedsProbe => {
                    if self.probe(endpoint).await {
                        return Ok(endpoint.clone());
                    }
                }
            }
        }

        warn!("No healthy update endpoint among {}", self.endpoints.len());
        Err(UpdateError::AllEndpointsUnhealthy {
            attempted: self.endpoints.len(),
        })
    }

    /// Probe `endpoint` now and record the result.
    async fn probe(&self, endpoint: &Endpoint) -> bool {
        let url = endpoint.health_url(&self.policy.health_path);
        let started = Instant::now();
        let healthy = self.transport.probe(&url, self.policy.probe_timeout).await;
        let latency = started.elapsed();

        if healthy {
            self.mark_healthy(&endpoint.id).await;
        } else {
            self.mark_failed(&endpoint.id, "health probe failed").await;
        }
        if let Some(entry) = self.health.lock().await.get_mut(&endpoint.id) {
            entry.probe_latency = Some(latency);
        }
        healthy
    }

    /// Probe every endpoint regardless of cached health or backoff.
    pub async fn probe_all(&self) -> Vec<EndpointHealth> {
        for endpoint in &self.endpoints {
            self.probe(endpoint).await;
        }
        self.health_snapshot().await
    }

    pub async fn mark_healthy(&self, endpoint_id: &str) {
        let mut health = self.health.lock().await;
        let entry = health
            .entry(endpoint_id.to_string())
            .or_insert_with(|| EndpointHealth::unknown(endpoint_id));
        if !entry.is_healthy && entry.consecutive_failures > 0 {
            info!(endpoint = endpoint_id, "Endpoint recovered");
        }
        entry.is_healthy = true;
        entry.consecutive_failures = 0;
        entry.last_error = None;
        entry.last_check_time = Some(Instant::now());
    }

    pub async fn mark_failed(&self, endpoint_id: &str, reason: &str) {
        let mut health = self.health.lock().await;
        let entry = health
            .entry(endpoint_id.to_string())
            .or_insert_with(|| EndpointHealth::unknown(endpoint_id));
        entry.is_healthy = false;
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        entry.last_error = Some(reason.to_string());
        entry.last_check_time = Some(Instant::now());
        warn!(
            endpoint = endpoint_id,
            failures = entry.consecutive_failures,
            "Endpoint marked unhealthy: {}",
            reason
        );
    }

    /// Record the outcome of one request made against `endpoint_id`.
    ///
    /// A network error counts as a failure and marks the endpoint unhealthy.
    /// Cancellation is not a request outcome and is ignored; any other error
    /// means the endpoint answered.
    pub async fn record_outcome<T>(
        &self,
        endpoint_id: &str,
        outcome: &Result<T, UpdateError>,
        latency: Duration,
    ) {
        let failed = match outcome {
            Err(UpdateError::Cancelled) => return,
            Err(e) => e.is_retryable(),
            Ok(_) => false,
        };
        {
            let mut activity = self.activity.lock().await;
            let stats = activity.requests.entry(endpoint_id.to_string()).or_default();
            stats.requests += 1;
            stats.total_latency = stats.total_latency.saturating_add(latency);
            if failed {
                stats.failures += 1;
            }
        }
        if let (true, Err(e)) = (failed, outcome) {
            self.mark_failed(endpoint_id, &e.to_string()).await;
        }
    }

    /// Append to the failover history, dropping the oldest beyond the limit.
    pub async fn record_failover(&self, from: &str, to: Option<&str>, reason: &str) {
        info!(from, to = to.unwrap_or("none"), "Failing over: {}", reason);
        let mut activity = self.activity.lock().await;
        if activity.failovers.len() == FAILOVER_HISTORY_LIMIT {
            activity.failovers.pop_front();
        }
        activity.failovers.push_back(FailoverEvent {
            from: from.to_string(),
            to: to.map(str::to_string),
            reason: reason.to_string(),
            at: Utc::now(),
        });
    }

    /// Failover events, oldest first.
    pub async fn failover_history(&self) -> Vec<FailoverEvent> {
        self.activity.lock().await.failovers.iter().cloned().collect()
    }

    /// Run `op` against the selected endpoint, failing over on network errors.
    ///
    /// Each failure marks the endpoint unhealthy and moves on to the next
    /// one. At most one attempt per configured endpoint is made. Errors other
    /// than [`UpdateError::Network`] are returned immediately.
    pub async fn execute<T, F, Fut>(&self, mut op: F) -> Result<(Endpoint, T), UpdateError>
    where
        F: FnMut(Endpoint) -> Fut,
        Fut: Future<Output = Result<T, UpdateError>>,
    {
        let mut failed_over: Option<(String, String)> = None;

        for attempt in 1..=self.endpoints.len() {
            let selected = self.select_endpoint().await;
            if let Some((from, reason)) = failed_over.take() {
                let to = selected.as_ref().ok().map(|e| e.id.as_str());
                self.record_failover(&from, to, &reason).await;
            }
            let endpoint = selected?;

            let started = Instant::now();
            let outcome = op(endpoint.clone()).await;
            self.record_outcome(&endpoint.id, &outcome, started.elapsed()).await;
            match outcome {
                Ok(value) => return Ok((endpoint, value)),
                Err(e) if e.is_retryable() => {
                    debug!(endpoint = %endpoint.id, attempt, "Operation failed, failing over");
                    failed_over = Some((endpoint.id.clone(), e.to_string()));
                }
                Err(e) => return Err(e),
            }
        }

        if let Some((from, reason)) = failed_over {
            self.record_failover(&from, None, &reason).await;
        }
        Err(UpdateError::AllEndpointsUnhealthy {
            attempted: self.endpoints.len(),
        })
    }

    /// Where to fetch the artifact at `url` from, in order.
    ///
    /// `url` itself always comes first. If it lives under an endpoint's base
    /// URL, the same path on every other endpoint not currently backing off
    /// follows in priority order.
    pub async fn download_candidates(&self, url: &str) -> Vec<DownloadSource> {
        let owner = self.endpoints.iter().find_map(|e| {
            url.strip_prefix(e.base())
                .filter(|rest| rest.starts_with('/'))
                .map(|suffix| (e, suffix))
        });
        let Some((owner, suffix)) = owner else {
            return vec![DownloadSource::direct(url)];
        };

        let mut candidates = vec![DownloadSource {
            url: url.to_string(),
            endpoint_id: Some(owner.id.clone()),
            mirrored: false,
        }];

        let now = Instant::now();
        let health = self.health.lock().await;
        candidates.extend(
            self.endpoints
                .iter()
                .filter(|e| e.id != owner.id)
                .filter(|e| {
                    health
                        .get(&e.id)
                        .is_none_or(|h| !matches!(self.standing(h, now), Standing::BackingOff))
                })
                .map(|e| DownloadSource {
                    url: format!("{}{}", e.base(), suffix),
                    endpoint_id: Some(e.id.clone()),
                    mirrored: true,
                }),
        );
        candidates
    }

    /// Current health of every endpoint, in priority order.
    pub async fn health_snapshot(&self) -> Vec<EndpointHealth> {
        let health = self.health.lock().await;
        self.endpoints
            .iter()
            .map(|e| health.get(&e.id).cloned().unwrap_or_else(|| EndpointHealth::unknown(&e.id)))
            .collect()
    }

    /// Health and request counters of every endpoint, in priority order.
    pub async fn summary(&self) -> Vec<EndpointSummary> {
        let health = self.health_snapshot().await;
        let activity = self.activity.lock().await;
        self.endpoints
            .iter()
            .zip(health)
            .map(|(endpoint, health)| EndpointSummary {
                endpoint: endpoint.clone(),
                health,
                stats: activity.requests.get(&endpoint.id).cloned().unwrap_or_default(),
            })
            .collect()
    }
}
