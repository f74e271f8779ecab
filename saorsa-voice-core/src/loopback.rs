//! In-memory collaborators
//!
//! [`LoopbackBroker`] is an at-least-once pub/sub bus living in one process,
//! [`SimulatedMedia`] hands out fake microphone captures and
//! [`SimulatedConnector`] builds links that negotiate without touching the
//! network. Together they run two full orchestrators against each other in
//! tests and in the CLI demo. Each one exposes knobs for injecting the faults
//! the call logic must survive.

use crate::config::CallConfig;
use crate::connection::{ConnectionError, LinkEvent, LinkEventSink, PeerConnector, PeerLink};
use crate::media::{LocalAudio, LocalTrack, MediaError, MediaSource};
use crate::transport::{PubSubTransport, Subscription, TransportError};
use crate::types::{IceCandidate, RemoteTrack, SdpKind, SessionDescription, Topic};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// In-process pub/sub bus
///
/// Every publish is fanned out to all live subscribers of the topic,
/// including the publisher's own subscription.
#[derive(Default)]
pub struct LoopbackBroker {
    topics: Mutex<HashMap<Topic, Vec<mpsc::UnboundedSender<Bytes>>>>,
    duplicate_delivery: AtomicBool,
    failing_publishes: AtomicU32,
    publish_attempts: AtomicU64,
    published: Mutex<Vec<(Topic, Bytes)>>,
}

impl LoopbackBroker {
    /// Create an empty broker
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver every payload twice
    pub fn set_duplicate_delivery(&self, enabled: bool) {
        self.duplicate_delivery.store(enabled, Ordering::SeqCst);
    }

    /// Make the next `count` publishes fail
    pub fn fail_next_publishes(&self, count: u32) {
        self.failing_publishes.store(count, Ordering::SeqCst);
    }

    /// Publishes attempted so far, failed ones included
    pub fn publish_attempts(&self) -> u64 {
        self.publish_attempts.load(Ordering::SeqCst)
    }

    /// Live subscriptions on `topic`
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.topics
            .lock()
            .get(topic)
            .map_or(0, |subs| subs.iter().filter(|tx| !tx.is_closed()).count())
    }

    /// Payloads successfully published on `topic`, oldest first
    pub fn published(&self, topic: &Topic) -> Vec<Bytes> {
        self.published
            .lock()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// Inject a payload without counting it or applying failure injection
    pub async fn publish_raw(&self, topic: &Topic, payload: Bytes) {
        self.fan_out(topic, payload);
        tokio::task::yield_now().await;
    }

    fn fan_out(&self, topic: &Topic, payload: Bytes) {
        let copies = if self.duplicate_delivery.load(Ordering::SeqCst) {
            2
        } else {
            1
        };
        let mut topics = self.topics.lock();
        if let Some(subs) = topics.get_mut(topic) {
            subs.retain(|tx| !tx.is_closed());
            for tx in subs.iter() {
                for _ in 0..copies {
                    let _ = tx.send(payload.clone());
                }
            }
        }
    }
}

#[async_trait]
impl PubSubTransport for LoopbackBroker {
    async fn subscribe(&self, topic: &Topic) -> Result<Subscription, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics.lock().entry(topic.clone()).or_default().push(tx);
        tracing::trace!(topic = %topic, "Loopback subscription opened");
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn publish(&self, topic: &Topic, payload: Bytes) -> Result<(), TransportError> {
        self.publish_attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransportError::SendError(
                "injected publish failure".to_string(),
            ));
        }
        self.published.lock().push((topic.clone(), payload.clone()));
        self.fan_out(topic, payload);
        Ok(())
    }
}

/// Fake microphone
#[derive(Default)]
pub struct SimulatedMedia {
    denied: AtomicBool,
    delay: Mutex<Option<Duration>>,
    acquired: AtomicUsize,
    stops: Arc<AtomicUsize>,
}

impl SimulatedMedia {
    /// Media that grants access immediately
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse (or allow again) every acquisition
    pub fn set_denied(&self, denied: bool) {
        self.denied.store(denied, Ordering::SeqCst);
    }

    /// Hold every acquisition for `delay`, like a permission prompt
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    /// Captures handed out so far
    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    /// Total `stop` calls across every capture
    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaSource for SimulatedMedia {
    async fn acquire_local_audio(&self) -> Result<Box<dyn LocalAudio>, MediaError> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.denied.load(Ordering::SeqCst) {
            return Err(MediaError::DeviceAccess("permission denied".to_string()));
        }
        let n = self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimulatedAudio {
            track: LocalTrack::audio(format!("sim-mic-{n}")),
            stops: self.stops.clone(),
        }))
    }
}

/// Capture handed out by [`SimulatedMedia`]
///
/// Counts every `stop` call, repeated ones included.
#[derive(Debug)]
pub struct SimulatedAudio {
    track: LocalTrack,
    stops: Arc<AtomicUsize>,
}

impl LocalAudio for SimulatedAudio {
    fn tracks(&self) -> Vec<LocalTrack> {
        vec![self.track.clone()]
    }

    fn stop(&mut self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Behavior switches for links built by [`SimulatedConnector`]
#[derive(Debug, Clone)]
pub struct LinkBehavior {
    /// Report `Connected` once both descriptions are applied
    pub auto_connect: bool,
    /// Local candidates emitted after the local description is applied
    pub local_candidates: usize,
    /// Candidates whose line contains this marker are rejected
    pub reject_marker: Option<String>,
    /// Refuse the remote description
    pub fail_remote_description: bool,
}

impl Default for LinkBehavior {
    fn default() -> Self {
        Self {
            auto_connect: true,
            local_candidates: 1,
            reject_marker: None,
            fail_remote_description: false,
        }
    }
}

/// Builds [`SimulatedLink`]s and keeps a probe on each
#[derive(Default)]
pub struct SimulatedConnector {
    behavior: Mutex<LinkBehavior>,
    fail_create: AtomicBool,
    probes: Mutex<Vec<Arc<LinkProbe>>>,
}

impl SimulatedConnector {
    /// Connector whose links connect on their own
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the behavior of links created from now on
    pub fn set_behavior(&self, behavior: LinkBehavior) {
        *self.behavior.lock() = behavior;
    }

    /// Make [`PeerConnector::create`] fail
    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Probes of every link created so far, oldest first
    pub fn links(&self) -> Vec<Arc<LinkProbe>> {
        self.probes.lock().clone()
    }

    /// Probe of the most recently created link
    pub fn last_link(&self) -> Option<Arc<LinkProbe>> {
        self.probes.lock().last().cloned()
    }
}

#[async_trait]
impl PeerConnector for SimulatedConnector {
    async fn create(
        &self,
        config: &CallConfig,
        events: LinkEventSink,
    ) -> Result<Box<dyn PeerLink>, ConnectionError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ConnectionError::ConfigError(
                "injected create failure".to_string(),
            ));
        }
        let mut probes = self.probes.lock();
        let probe = Arc::new(LinkProbe {
            index: probes.len(),
            ice_servers: config.ice_servers.iter().flat_map(|s| s.urls.clone()).collect(),
            events,
            state: Mutex::new(LinkRecord::default()),
        });
        probes.push(probe.clone());
        tracing::debug!(link = probe.index, "Created simulated link");
        Ok(Box::new(SimulatedLink {
            behavior: self.behavior.lock().clone(),
            probe,
        }))
    }
}

#[derive(Debug, Default)]
struct LinkRecord {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    applied: Vec<IceCandidate>,
    audio: Vec<LocalTrack>,
    connected: bool,
    closes: usize,
}

/// Test-side view of one simulated link
pub struct LinkProbe {
    index: usize,
    ice_servers: Vec<String>,
    events: LinkEventSink,
    state: Mutex<LinkRecord>,
}

impl LinkProbe {
    /// Position in creation order
    pub fn index(&self) -> usize {
        self.index
    }

    /// ICE server URLs the link was configured with
    pub fn ice_servers(&self) -> &[String] {
        &self.ice_servers
    }

    /// Applied local description
    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    /// Applied remote description
    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    /// Remote candidates applied, in order
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied.clone()
    }

    /// Local tracks attached
    pub fn local_tracks(&self) -> Vec<LocalTrack> {
        self.state.lock().audio.clone()
    }

    /// How many times `close` ran
    pub fn close_count(&self) -> usize {
        self.state.lock().closes
    }

    /// Push an event as if the link produced it
    pub fn inject(&self, event: LinkEvent) {
        self.events.emit(event);
    }
}

/// Link that negotiates in memory
pub struct SimulatedLink {
    behavior: LinkBehavior,
    probe: Arc<LinkProbe>,
}

impl SimulatedLink {
    fn description(&self, kind: SdpKind) -> SessionDescription {
        let sdp = format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=-\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=rtpmap:111 opus/48000/2\r\n",
            self.probe.index
        );
        SessionDescription { kind, sdp }
    }

    fn maybe_connect(&self, record: &mut LinkRecord) -> bool {
        if self.behavior.auto_connect
            && !record.connected
            && record.local.is_some()
            && record.remote.is_some()
        {
            record.connected = true;
            return true;
        }
        false
    }

    fn announce_connected(&self) {
        self.probe.events.emit(LinkEvent::Connected);
        self.probe.events.emit(LinkEvent::RemoteTrack(RemoteTrack {
            track_id: format!("sim-remote-audio-{}", self.probe.index),
            stream_id: format!("sim-stream-{}", self.probe.index),
            kind: "audio".to_string(),
        }));
    }
}

#[async_trait]
impl PeerLink for SimulatedLink {
    async fn add_local_audio(&self, audio: &dyn LocalAudio) -> Result<(), ConnectionError> {
        self.probe.state.lock().audio.extend(audio.tracks());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, ConnectionError> {
        Ok(self.description(SdpKind::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError> {
        match &self.probe.state.lock().remote {
            Some(remote) if remote.kind == SdpKind::Offer => Ok(self.description(SdpKind::Answer)),
            _ => Err(ConnectionError::Negotiation(
                "no remote offer applied".to_string(),
            )),
        }
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectionError> {
        let connected = {
            let mut record = self.probe.state.lock();
            if record.closes > 0 {
                return Err(ConnectionError::Closed);
            }
            record.local = Some(description);
            self.maybe_connect(&mut record)
        };
        for i in 0..self.behavior.local_candidates {
            let mut candidate = IceCandidate::new(format!(
                "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host",
                self.probe.index * 100 + i,
                50000 + self.probe.index * 100 + i
            ));
            candidate.sdp_mid = Some("0".to_string());
            candidate.sdp_mline_index = Some(0);
            self.probe.events.emit(LinkEvent::LocalCandidate(candidate));
        }
        if connected {
            self.announce_connected();
        }
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectionError> {
        if self.behavior.fail_remote_description {
            return Err(ConnectionError::Negotiation(
                "injected remote description failure".to_string(),
            ));
        }
        let connected = {
            let mut record = self.probe.state.lock();
            if record.closes > 0 {
                return Err(ConnectionError::Closed);
            }
            record.remote = Some(description);
            self.maybe_connect(&mut record)
        };
        if connected {
            self.announce_connected();
        }
        Ok(())
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError> {
        let mut record = self.probe.state.lock();
        if record.remote.is_none() {
            return Err(ConnectionError::InvalidCandidate(
                "remote description not set".to_string(),
            ));
        }
        if let Some(marker) = &self.behavior.reject_marker {
            if candidate.candidate.contains(marker.as_str()) {
                return Err(ConnectionError::InvalidCandidate(candidate.candidate));
            }
        }
        record.applied.push(candidate);
        Ok(())
    }

    async fn close(&self) {
        self.probe.state.lock().closes += 1;
    }
}
