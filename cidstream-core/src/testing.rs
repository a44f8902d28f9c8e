//! Scripted test doubles for the network, player and observer capabilities.
//!
//! Available to unit tests and, through the `test-utils` feature, to
//! integration tests and downstream crates.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use url::Url;

use crate::cid::Cid;
use crate::net::{
    ContainerFormat, ContainerProbe, FetchRequest, FetchResponse, HostResolver, NetworkStack,
    PlaybackProbe, ProbeError, ResolveError, Transport, TransportError,
};
use crate::observer::PlaybackObserver;
use crate::player::{BufferDemand, MediaSource, Player, PlayerError};
use crate::provider::{CorsMode, Provider, ProviderRegistry};
use crate::scheduler::Chunk;

const BASE32_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz234567";

/// Well-formed CIDv1 unique to `seed`.
pub fn test_cid(seed: u64) -> Cid {
    let mut digits = Vec::new();
    let mut value = seed;
    loop {
        digits.push(BASE32_ALPHABET[(value % 32) as usize]);
        value /= 32;
        if value == 0 {
            break;
        }
    }
    digits.reverse();

    let mut raw = String::from("b");
    raw.extend(std::iter::repeat_n('a', 58 - digits.len()));
    raw.extend(digits.into_iter().map(char::from));

    // 59 chars from the base32 alphabet always parse
    Cid::parse(&raw).unwrap_or_else(|e| panic!("test CID {raw}: {e}"))
}

/// `len` bytes starting with an MP4 `ftyp` box; byte `i` of the payload is
/// `i % 251` so slices are distinguishable.
pub fn fake_mp4(len: usize) -> Bytes {
    let mut data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    let header = b"\x00\x00\x00\x20ftypisom\x00\x00\x02\x00";
    let n = header.len().min(len);
    data[..n].copy_from_slice(&header[..n]);
    Bytes::from(data)
}

/// Registry of `count` cors providers `gw0..gwN` at `https://gwN.test/ipfs/{cid}`.
pub fn test_registry(count: usize) -> ProviderRegistry {
    let registry = ProviderRegistry::new();
    for i in 0..count {
        let provider = Provider::new(
            format!("gw{i}"),
            format!("Gateway {i}"),
            format!("https://gw{i}.test/ipfs/{{cid}}"),
            CorsMode::Cors,
        )
        .unwrap_or_else(|e| panic!("test provider gw{i}: {e}"));
        registry
            .register(provider)
            .unwrap_or_else(|e| panic!("register gw{i}: {e}"));
    }
    registry
}

/// Network stack over the given mocks with the real container probe.
pub fn test_network(transport: Arc<MockTransport>, resolver: Arc<MockResolver>) -> NetworkStack {
    NetworkStack {
        transport,
        resolver,
        probe: Arc::new(ContainerProbe),
    }
}

#[derive(Debug, Clone)]
enum Behavior {
    Serve(Bytes),
    Fail(TransportError),
    Status(u16),
    Stall,
}

/// Scripted behavior of one mock gateway host.
#[derive(Debug, Clone)]
pub struct MockGateway {
    behavior: Behavior,
    latency: Duration,
    content_type: Option<String>,
    fail_first: u64,
}

impl MockGateway {
    /// Serves `content` honoring range requests with `206`, or `416` past the end.
    pub fn serving(content: Bytes) -> Self {
        Self::with_behavior(Behavior::Serve(content))
    }

    /// Every request fails with a network error.
    pub fn failing() -> Self {
        Self::with_behavior(Behavior::Fail(TransportError::Network {
            reason: "connection reset".to_string(),
        }))
    }

    /// Every request fails the cross-origin check.
    pub fn cors_rejecting() -> Self {
        Self::with_behavior(Behavior::Fail(TransportError::Cors {
            reason: "missing Access-Control-Allow-Origin".to_string(),
        }))
    }

    /// Every request answers `status` with an empty body.
    pub fn status(status: u16) -> Self {
        Self::with_behavior(Behavior::Status(status))
    }

    /// Requests never complete.
    pub fn stalled() -> Self {
        Self::with_behavior(Behavior::Stall)
    }

    /// Delay before the response.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Declared content type of successful responses.
    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_string());
        self
    }

    /// The first `count` requests fail with a network error.
    pub fn failing_first(mut self, count: u64) -> Self {
        self.fail_first = count;
        self
    }

    fn with_behavior(behavior: Behavior) -> Self {
        Self {
            behavior,
            latency: Duration::ZERO,
            content_type: Some("video/mp4".to_string()),
            fail_first: 0,
        }
    }
}

#[derive(Debug, Default)]
struct TransportState {
    gateways: HashMap<String, MockGateway>,
    requests: HashMap<String, u64>,
    fetched: Vec<(String, Option<(u64, u64)>)>,
    active: HashMap<(String, u64), usize>,
    active_total: usize,
    max_per_range: usize,
    max_total: usize,
}

/// Transport answering from per-host [`MockGateway`] scripts.
///
/// Records every request and the peak concurrency, overall and per
/// `(path, range start)` key.
#[derive(Debug, Default)]
pub struct MockTransport {
    state: Arc<Mutex<TransportState>>,
}

struct ActiveGuard {
    state: Arc<Mutex<TransportState>>,
    key: (String, u64),
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.active_total -= 1;
        if let Some(count) = state.active.get_mut(&self.key) {
            *count -= 1;
        }
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts `host`; unscripted hosts fail with a network error.
    pub fn set_gateway(&self, host: &str, gateway: MockGateway) {
        self.state
            .lock()
            .gateways
            .insert(host.to_string(), gateway);
    }

    /// Requests made to `host`.
    pub fn fetch_count(&self, host: &str) -> u64 {
        self.state.lock().requests.get(host).copied().unwrap_or(0)
    }

    /// Requests made to any host.
    pub fn total_fetches(&self) -> u64 {
        self.state.lock().requests.values().sum()
    }

    /// Distinct `(host, range)` pairs requested.
    pub fn distinct_ranges(&self) -> u64 {
        let state = self.state.lock();
        let distinct: HashSet<_> = state.fetched.iter().collect();
        distinct.len() as u64
    }

    /// Ranges requested from `host`, in request order.
    pub fn ranges_for(&self, host: &str) -> Vec<Option<(u64, u64)>> {
        self.state
            .lock()
            .fetched
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, range)| *range)
            .collect()
    }

    /// Peak number of simultaneous requests for one resource range.
    pub fn max_concurrent_per_range(&self) -> usize {
        self.state.lock().max_per_range
    }

    /// Peak number of simultaneous requests overall.
    pub fn max_concurrent(&self) -> usize {
        self.state.lock().max_total
    }

    fn begin(&self, host: &str, request: &FetchRequest) -> (Option<MockGateway>, u64, ActiveGuard) {
        let key = (
            request.url.path().to_string(),
            request.range.map_or(0, |range| range.start),
        );
        let mut state = self.state.lock();

        let count = {
            let entry = state.requests.entry(host.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };
        state.fetched.push((
            host.to_string(),
            request.range.map(|range| (range.start, range.end)),
        ));

        state.active_total += 1;
        state.max_total = state.max_total.max(state.active_total);
        let per_range = {
            let entry = state.active.entry(key.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        state.max_per_range = state.max_per_range.max(per_range);

        let gateway = state.gateways.get(host).cloned();
        drop(state);

        (
            gateway,
            count,
            ActiveGuard {
                state: Arc::clone(&self.state),
                key,
            },
        )
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, TransportError> {
        let host = request.url.host_str().unwrap_or_default().to_string();
        let (gateway, count, _guard) = self.begin(&host, &request);

        let Some(gateway) = gateway else {
            return Err(TransportError::Network {
                reason: format!("unknown host {host}"),
            });
        };

        if !gateway.latency.is_zero() {
            tokio::time::sleep(gateway.latency).await;
        }
        if count <= gateway.fail_first {
            return Err(TransportError::Network {
                reason: format!("scripted failure {count}"),
            });
        }

        let opaque = request.cors_mode == CorsMode::NoCors;
        let respond = |status: u16, body: Bytes| FetchResponse {
            status,
            content_type: if opaque {
                None
            } else {
                gateway.content_type.clone()
            },
            body,
            opaque,
            first_byte_latency: gateway.latency,
        };

        match &gateway.behavior {
            Behavior::Fail(error) => Err(error.clone()),
            Behavior::Status(status) => Ok(respond(*status, Bytes::new())),
            Behavior::Stall => std::future::pending().await,
            Behavior::Serve(content) => {
                let len = content.len() as u64;
                match request.range {
                    None => Ok(respond(200, content.clone())),
                    Some(range) if range.start >= len => Ok(respond(416, Bytes::new())),
                    Some(range) => {
                        let end = (range.end + 1).min(len);
                        Ok(respond(
                            206,
                            content.slice(range.start as usize..end as usize),
                        ))
                    }
                }
            }
        }
    }
}

/// Resolver answering loopback for every host except scripted failures.
#[derive(Debug, Default)]
pub struct MockResolver {
    failing: Mutex<HashSet<String>>,
    fail_all: Mutex<bool>,
    calls: Mutex<Vec<String>>,
}

impl MockResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lookups of `host` fail.
    pub fn fail_host(&self, host: &str) {
        self.failing.lock().insert(host.to_string());
    }

    /// Every lookup fails.
    pub fn fail_all(&self) {
        *self.fail_all.lock() = true;
    }

    /// Hosts looked up, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl HostResolver for MockResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        self.calls.lock().push(host.to_string());
        if *self.fail_all.lock() || self.failing.lock().contains(host) {
            return Err(ResolveError::Lookup {
                host: host.to_string(),
                reason: "NXDOMAIN".to_string(),
            });
        }
        Ok(vec![IpAddr::from([127, 0, 0, 1])])
    }
}

/// Probe rejecting samples from scripted hosts, sniffing everything else.
#[derive(Debug, Default)]
pub struct MockProbe {
    rejecting: Mutex<HashSet<String>>,
}

impl MockProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Samples from `host` are reported undecodable.
    pub fn reject_host(&self, host: &str) {
        self.rejecting.lock().insert(host.to_string());
    }
}

#[async_trait]
impl PlaybackProbe for MockProbe {
    async fn probe(&self, url: &Url, sample: &Bytes) -> Result<ContainerFormat, ProbeError> {
        if url
            .host_str()
            .is_some_and(|host| self.rejecting.lock().contains(host))
        {
            return Err(ProbeError::Undecodable {
                reason: "scripted rejection".to_string(),
            });
        }
        ContainerProbe.probe(url, sample).await
    }
}

/// Calls received by a [`MockPlayer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerEvent {
    SetSource(Cid),
    Append { cid: Cid, index: u64 },
    ClearSource,
    Play,
    Pause,
    Seek(u64),
}

/// Player recording every call and consuming chunks as they arrive.
#[derive(Debug, Default)]
pub struct MockPlayer {
    events: Mutex<Vec<PlayerEvent>>,
    demand: Mutex<Option<BufferDemand>>,
    autoplay_blocked: Mutex<bool>,
    append_delay: Mutex<Option<Duration>>,
}

impl MockPlayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `play` report autoplay blocked.
    pub fn block_autoplay(&self) {
        *self.autoplay_blocked.lock() = true;
    }

    /// Makes every `append_chunk` wait `delay` before accepting the chunk.
    pub fn delay_appends(&self, delay: Duration) {
        *self.append_delay.lock() = Some(delay);
    }

    pub fn events(&self) -> Vec<PlayerEvent> {
        self.events.lock().clone()
    }

    /// Indices appended for `cid`, in append order.
    pub fn appended(&self, cid: &Cid) -> Vec<u64> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                PlayerEvent::Append { cid: c, index } if c == cid => Some(*index),
                _ => None,
            })
            .collect()
    }

    fn record(&self, event: PlayerEvent) {
        self.events.lock().push(event);
    }
}

#[async_trait]
impl Player for MockPlayer {
    async fn set_source(
        &self,
        source: &MediaSource,
        demand: BufferDemand,
    ) -> Result<(), PlayerError> {
        *self.demand.lock() = Some(demand);
        self.record(PlayerEvent::SetSource(source.cid.clone()));
        Ok(())
    }

    async fn append_chunk(&self, chunk: &Chunk) -> Result<(), PlayerError> {
        let delay = *self.append_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.record(PlayerEvent::Append {
            cid: chunk.cid.clone(),
            index: chunk.index,
        });
        if let Some(demand) = self.demand.lock().as_ref() {
            demand.consumed(1);
        }
        Ok(())
    }

    async fn clear_source(&self) {
        *self.demand.lock() = None;
        self.record(PlayerEvent::ClearSource);
    }

    async fn play(&self) -> Result<(), PlayerError> {
        self.record(PlayerEvent::Play);
        if *self.autoplay_blocked.lock() {
            return Err(PlayerError::AutoplayBlocked);
        }
        Ok(())
    }

    async fn pause(&self) {
        self.record(PlayerEvent::Pause);
    }

    async fn seek(&self, byte_position: u64) -> Result<(), PlayerError> {
        self.record(PlayerEvent::Seek(byte_position));
        Ok(())
    }
}

/// Events received by a [`RecordingObserver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObserverEvent {
    ChunkReady { cid: Cid, index: u64 },
    LoadFailed(String),
    AutoplayBlocked,
    Spinner(bool),
}

/// Observer recording every hook call.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<ObserverEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ObserverEvent> {
        self.events.lock().clone()
    }

    /// CIDs reported through `on_load_failed`.
    pub fn failed_loads(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                ObserverEvent::LoadFailed(cid) => Some(cid.clone()),
                _ => None,
            })
            .collect()
    }
}

impl PlaybackObserver for RecordingObserver {
    fn on_chunk_ready(&self, chunk: &Chunk) {
        self.events.lock().push(ObserverEvent::ChunkReady {
            cid: chunk.cid.clone(),
            index: chunk.index,
        });
    }

    fn on_load_failed(&self, cid: &str) {
        self.events
            .lock()
            .push(ObserverEvent::LoadFailed(cid.to_string()));
    }

    fn on_autoplay_blocked(&self) {
        self.events.lock().push(ObserverEvent::AutoplayBlocked);
    }

    fn on_spinner_update(&self, is_loading: bool) {
        self.events.lock().push(ObserverEvent::Spinner(is_loading));
    }
}
