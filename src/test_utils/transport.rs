//! In-memory [`Transport`] standing in for update endpoints and mirrors.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, stream};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::core::UpdateError;
use crate::update::failover::MANIFEST_FILE;
use crate::update::manifest::VersionManifest;
use crate::update::transport::{ByteStream, Transport};

const DEFAULT_CHUNK: usize = 4096;

#[derive(Debug)]
struct State {
    resources: HashMap<String, Vec<u8>>,
    down: HashSet<String>,
    failing: HashSet<String>,
    truncate: HashMap<String, usize>,
    stall: HashMap<String, usize>,
    range_support: bool,
    chunk_size: usize,
    latency: Duration,
    opens: Vec<(String, u64)>,
}

/// Serves registered URLs from memory.
///
/// Outages are keyed by base URL prefix: [`set_down`](Self::set_down) fails
/// health probes and requests, [`fail_requests`](Self::fail_requests) fails
/// only requests so the endpoint still looks healthy.
#[derive(Debug)]
pub struct FakeTransport {
    state: Mutex<State>,
    probes: AtomicUsize,
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                resources: HashMap::new(),
                down: HashSet::new(),
                failing: HashSet::new(),
                truncate: HashMap::new(),
                stall: HashMap::new(),
                range_support: true,
                chunk_size: DEFAULT_CHUNK,
                latency: Duration::ZERO,
                opens: Vec::new(),
            }),
            probes: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn put(&self, url: &str, body: Vec<u8>) {
        self.state().resources.insert(url.to_string(), body);
    }

    /// Serve `manifest` as `{base}/{channel}/version.json` and its artifact
    /// body, when registered separately, under `download_url`.
    pub fn publish_manifest(&self, base: &str, manifest: &VersionManifest) {
        let url = format!("{}/{}/{MANIFEST_FILE}", base.trim_end_matches('/'), manifest.channel);
        self.put(&url, super::fixtures::manifest_json(manifest));
    }

    pub fn set_down(&self, base: &str, down: bool) {
        let mut state = self.state();
        if down {
            state.down.insert(base.to_string());
        } else {
            state.down.remove(base);
        }
    }

    pub fn fail_requests(&self, base: &str, failing: bool) {
        let mut state = self.state();
        if failing {
            state.failing.insert(base.to_string());
        } else {
            state.failing.remove(base);
        }
    }

    /// The next stream opened for `url` ends with a network error after
    /// `bytes` bytes.
    pub fn truncate_after(&self, url: &str, bytes: usize) {
        self.state().truncate.insert(url.to_string(), bytes);
    }

    /// The next stream opened for `url` stops producing data after `bytes`
    /// bytes without ending.
    pub fn stall_after(&self, url: &str, bytes: usize) {
        self.state().stall.insert(url.to_string(), bytes);
    }

    pub fn set_range_support(&self, supported: bool) {
        self.state().range_support = supported;
    }

    pub fn set_chunk_size(&self, size: usize) {
        self.state().chunk_size = size.max(1);
    }

    /// Delay every manifest fetch by `latency` (tokio time).
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    /// Every `open` call as `(url, requested offset)`.
    pub fn opens(&self) -> Vec<(String, u64)> {
        self.state().opens.clone()
    }

    fn check_reachable(state: &State, url: &str) -> Result<(), UpdateError> {
        let blocked = state.down.iter().chain(state.failing.iter()).any(|base| url.starts_with(base));
        if blocked {
            return Err(UpdateError::network(url, "connection refused"));
        }
        Ok(())
    }

    fn resource(state: &State, url: &str) -> Result<Vec<u8>, UpdateError> {
        state
            .resources
            .get(url)
            .cloned()
            .ok_or_else(|| UpdateError::NotFound { url: url.to_string() })
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn fetch(&self, url: &str) -> Result<Bytes, UpdateError> {
        let latency = self.state().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let state = self.state();
        Self::check_reachable(&state, url)?;
        Self::resource(&state, url).map(Bytes::from)
    }

    async fn open(&self, url: &str, offset: u64) -> Result<ByteStream, UpdateError> {
        let mut state = self.state();
        state.opens.push((url.to_string(), offset));
        Self::check_reachable(&state, url)?;
        let body = Self::resource(&state, url)?;
        let total = body.len() as u64;

        let partial = state.range_support && offset > 0 && offset <= total;
        let start = if partial { usize::try_from(offset).unwrap_or(body.len()) } else { 0 };
        let mut remaining = body[start..].to_vec();

        let cut = state.truncate.remove(url);
        let stall = state.stall.remove(url);
        if let Some(limit) = cut.or(stall) {
            remaining.truncate(limit);
        }

        let mut items: Vec<Result<Bytes, UpdateError>> = remaining
            .chunks(state.chunk_size)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        if cut.is_some() {
            items.push(Err(UpdateError::network(url, "connection reset")));
        }

        let body = if stall.is_some() {
            stream::iter(items).chain(stream::pending()).boxed()
        } else {
            stream::iter(items).boxed()
        };
        Ok(ByteStream {
            partial,
            total: Some(total),
            body,
        })
    }

    async fn probe(&self, url: &str, _timeout: Duration) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        !self.state().down.iter().any(|base| url.starts_with(base))
    }
}
