//! Call orchestration
//!
//! [`CallOrchestrator`] is the only owner of the topic registry. Each topic
//! holds one signaling channel and at most one call: either an offer waiting
//! for the user (pending) or a running session (active). Signals from every
//! channel and reports from every session are funnelled through a single pump
//! task, so registry updates happen one at a time.

use crate::config::CallConfig;
use crate::connection::{ConnectionError, PeerConnector};
use crate::identity::PeerIdentity;
use crate::media::{MediaError, MediaSource};
use crate::session::{
    CallSession, Opening, ReportKind, SessionDescriptor, SessionError, SessionHandle, SessionReport,
};
use crate::signaling::{SignalBody, SignalMessage, SignalingChannel, SignalingError};
use crate::transport::PubSubTransport;
use crate::types::{
    CallEndReason, CallEvent, CallId, CallMetadata, CallState, IceCandidate, SessionDescription,
    SessionRole, Topic,
};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

/// Call orchestration errors
#[derive(Error, Debug)]
pub enum CallError {
    /// Caller and callee are the same participant
    #[error("Cannot call yourself")]
    SelfCall,

    /// Topic already has a session or a pending offer
    #[error("Call already active on {0}")]
    AlreadyActive(Topic),

    /// Nothing to accept or decline
    #[error("No pending offer on {0}")]
    NoPendingOffer(Topic),

    /// Microphone unavailable
    #[error("Device access error: {0}")]
    DeviceAccess(#[source] MediaError),

    /// Signaling failed
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    /// Peer connection failed
    #[error("Connection error: {0}")]
    Connection(#[source] ConnectionError),

    /// Not connected in time
    #[error("Call timed out")]
    Timeout,

    /// Hung up or shut down while the call was being set up
    #[error("Call cancelled: {0}")]
    Cancelled(CallEndReason),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Anything else that ended the attempt
    #[error("Call failed: {0}")]
    Failed(String),
}

impl From<SessionError> for CallError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::DeviceAccess(e) => CallError::DeviceAccess(e),
            SessionError::Connection(e) => CallError::Connection(e),
            SessionError::Signaling(e) => CallError::Signaling(e),
            SessionError::Cancelled(reason) => CallError::Cancelled(reason),
            SessionError::TimedOut => CallError::Timeout,
            other => CallError::Failed(other.to_string()),
        }
    }
}

enum Inbound<I: PeerIdentity> {
    Signal(Topic, SignalMessage<I>),
    Report(SessionReport),
}

/// Finished call attempts remembered per topic
const FINISHED_CALLS_KEPT: usize = 16;

struct PendingOffer<I: PeerIdentity> {
    from: I,
    call: Option<CallId>,
    description: SessionDescription,
    meta: Option<CallMetadata>,
    candidates: Vec<IceCandidate>,
    received_at: DateTime<Utc>,
}

impl<I: PeerIdentity> PendingOffer<I> {
    /// Whether `other` is a repeat of this offer
    fn same_attempt(&self, other: &PendingOffer<I>) -> bool {
        match (self.call, other.call) {
            (Some(ours), Some(theirs)) => ours == theirs,
            _ => self.description == other.description,
        }
    }
}

enum Slot<I: PeerIdentity> {
    Vacant,
    Pending(PendingOffer<I>),
    Active(SessionHandle<I>),
}

struct TopicEntry<I: PeerIdentity> {
    remote: I,
    channel: Arc<SignalingChannel<I>>,
    slot: Slot<I>,
    /// Offer that arrived while a finished call still occupied the slot
    deferred: Option<PendingOffer<I>>,
    /// Attempts that ended here; their offers are not surfaced again
    finished: VecDeque<CallId>,
    listening: bool,
}

impl<I: PeerIdentity> TopicEntry<I> {
    fn is_idle(&self) -> bool {
        matches!(self.slot, Slot::Vacant) && self.deferred.is_none() && !self.listening
    }

    fn active(&self) -> Option<&SessionHandle<I>> {
        match &self.slot {
            Slot::Active(handle) => Some(handle),
            _ => None,
        }
    }

    fn remember(&mut self, call: Option<CallId>) {
        let Some(call) = call else {
            return;
        };
        if self.finished.contains(&call) {
            return;
        }
        if self.finished.len() == FINISHED_CALLS_KEPT {
            self.finished.pop_front();
        }
        self.finished.push_back(call);
    }

    fn has_finished(&self, call: Option<CallId>) -> bool {
        call.is_some_and(|call| self.finished.contains(&call))
    }
}

struct Registry<I: PeerIdentity> {
    entries: HashMap<Topic, TopicEntry<I>>,
}

impl<I: PeerIdentity> Registry<I> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Drop the topic and its channel if nothing needs it any more
    fn release_if_idle(&mut self, topic: &Topic) {
        if !self.entries.get(topic).is_some_and(TopicEntry::is_idle) {
            return;
        }
        if let Some(entry) = self.entries.remove(topic) {
            entry.channel.destroy();
            tracing::debug!(topic = %topic, "Released idle topic");
        }
    }
}

enum OfferDisposition {
    Surface,
    Replace,
    Defer,
    Ignore(&'static str),
}

struct Inner<I: PeerIdentity> {
    local: I,
    config: Arc<CallConfig>,
    transport: Arc<dyn PubSubTransport>,
    media: Arc<dyn MediaSource>,
    connector: Arc<dyn PeerConnector>,
    registry: Mutex<Registry<I>>,
    events: broadcast::Sender<CallEvent<I>>,
    inbound: mpsc::UnboundedSender<Inbound<I>>,
}

impl<I: PeerIdentity> Inner<I> {
    fn emit(&self, event: CallEvent<I>) {
        let _ = self.events.send(event);
    }

    /// Existing channel for `topic`, or a freshly subscribed one
    async fn channel_for(
        &self,
        registry: &mut Registry<I>,
        topic: &Topic,
        remote: &I,
    ) -> Result<Arc<SignalingChannel<I>>, CallError> {
        if let Some(entry) = registry.entries.get(topic) {
            return Ok(entry.channel.clone());
        }

        let channel = Arc::new(SignalingChannel::new(
            self.transport.clone(),
            topic.clone(),
            self.local.clone(),
            self.config.delivery_attempts(),
        ));
        let inbound = self.inbound.clone();
        let route = topic.clone();
        channel
            .subscribe(Arc::new(move |message| {
                let _ = inbound.send(Inbound::Signal(route.clone(), message));
            }))
            .await?;

        registry.entries.insert(
            topic.clone(),
            TopicEntry {
                remote: remote.clone(),
                channel: channel.clone(),
                slot: Slot::Vacant,
                deferred: None,
                finished: VecDeque::new(),
                listening: false,
            },
        );
        Ok(channel)
    }

    fn descriptor(
        &self,
        call_id: CallId,
        role: SessionRole,
        topic: &Topic,
        remote: I,
        channel: Arc<SignalingChannel<I>>,
    ) -> SessionDescriptor<I> {
        let inbound = self.inbound.clone();
        SessionDescriptor {
            call_id,
            role,
            remote,
            topic: topic.clone(),
            channel,
            config: self.config.clone(),
            media: self.media.clone(),
            connector: self.connector.clone(),
            reports: Arc::new(move |report| {
                let _ = inbound.send(Inbound::Report(report));
            }),
        }
    }

    fn incoming(&self, topic: &Topic, offer: &PendingOffer<I>) {
        tracing::info!(topic = %topic, from = %offer.from, "Incoming call");
        self.emit(CallEvent::IncomingCall {
            topic: topic.clone(),
            from: offer.from.clone(),
            meta: offer.meta.clone(),
            received_at: offer.received_at,
        });
    }

    /// Vacate the slot if `call_id` still owns it
    ///
    /// Called by whichever path learns about the end first; the other finds
    /// the slot already vacated and does nothing.
    fn retire(
        &self,
        registry: &mut Registry<I>,
        topic: &Topic,
        call_id: CallId,
        reason: Option<CallEndReason>,
    ) {
        let Some(entry) = registry.entries.get_mut(topic) else {
            return;
        };
        if entry.active().map(SessionHandle::call_id) != Some(call_id) {
            return;
        }
        entry.slot = Slot::Vacant;
        entry.remember(Some(call_id));
        if let Some(reason) = reason {
            self.emit(CallEvent::CallEnded {
                topic: topic.clone(),
                reason,
            });
        }
        self.promote_deferred(topic, entry);
        registry.release_if_idle(topic);
    }

    fn promote_deferred(&self, topic: &Topic, entry: &mut TopicEntry<I>) {
        if let Some(offer) = entry.deferred.take() {
            self.incoming(topic, &offer);
            entry.slot = Slot::Pending(offer);
        }
    }

    fn route_signal(&self, registry: &mut Registry<I>, topic: Topic, message: SignalMessage<I>) {
        let Some(entry) = registry.entries.get_mut(&topic) else {
            tracing::debug!(topic = %topic, kind = %message.kind(), "Signal for a released topic");
            return;
        };
        if message.from != entry.remote {
            tracing::debug!(topic = %topic, from = %message.from, "Ignoring signal from outside the pair");
            return;
        }

        let message = match message.body {
            SignalBody::Offer { description, meta } => {
                let offer = PendingOffer {
                    from: message.from,
                    call: message.call,
                    description,
                    meta,
                    candidates: Vec::new(),
                    received_at: Utc::now(),
                };
                self.on_offer(&topic, entry, offer);
                return;
            }
            body => SignalMessage { body, ..message },
        };

        let mut withdrawn = None;
        let mut held_withdrawn = false;
        match &mut entry.slot {
            Slot::Active(handle) => match (&mut entry.deferred, message.body) {
                (Some(deferred), SignalBody::Candidate(candidate))
                    if message.call.is_none() || message.call == deferred.call =>
                {
                    deferred.candidates.push(candidate);
                }
                (Some(deferred), SignalBody::Bye { .. })
                    if message.call.is_some() && message.call == deferred.call =>
                {
                    tracing::info!(topic = %topic, "Caller withdrew the held offer");
                    held_withdrawn = true;
                }
                (_, body) => {
                    let kind = body.kind();
                    if !handle.deliver(SignalMessage { body, ..message }) {
                        tracing::debug!(topic = %topic, kind = %kind, "Session already finished");
                    }
                }
            },
            Slot::Pending(offer) if !message.belongs_to(offer.call) => {
                tracing::debug!(topic = %topic, kind = %message.kind(), "Ignoring signal from another call attempt");
            }
            Slot::Pending(offer) => match message.body {
                SignalBody::Candidate(candidate) => {
                    offer.candidates.push(candidate);
                    tracing::debug!(
                        topic = %topic,
                        buffered = offer.candidates.len(),
                        "Buffered candidate for pending offer"
                    );
                }
                SignalBody::Bye { .. } => withdrawn = Some(offer.call),
                body => {
                    tracing::debug!(topic = %topic, kind = %body.kind(), "Ignoring signal for pending offer");
                }
            },
            Slot::Vacant => {
                tracing::debug!(topic = %topic, kind = %message.kind(), "Dropping orphaned signal");
            }
        }

        if held_withdrawn {
            if let Some(held) = entry.deferred.take() {
                entry.remember(held.call);
            }
        }
        if let Some(call) = withdrawn {
            entry.slot = Slot::Vacant;
            entry.remember(call);
            tracing::info!(topic = %topic, "Caller withdrew the offer");
            self.emit(CallEvent::CallEnded {
                topic: topic.clone(),
                reason: CallEndReason::RemoteHangUp,
            });
            registry.release_if_idle(&topic);
        }
    }

    fn on_offer(&self, topic: &Topic, entry: &mut TopicEntry<I>, offer: PendingOffer<I>) {
        let disposition = match &entry.slot {
            _ if entry.has_finished(offer.call) => {
                OfferDisposition::Ignore("offer from a finished call")
            }
            Slot::Vacant => OfferDisposition::Surface,
            Slot::Pending(existing) if existing.same_attempt(&offer) => {
                OfferDisposition::Ignore("repeat of the pending offer")
            }
            Slot::Pending(_) => OfferDisposition::Replace,
            Slot::Active(handle) if handle.state().is_negotiating() => {
                OfferDisposition::Ignore("session still negotiating")
            }
            Slot::Active(handle) if handle.answered(offer.call, &offer.description) => {
                OfferDisposition::Ignore("repeat of the answered offer")
            }
            Slot::Active(_)
                if entry
                    .deferred
                    .as_ref()
                    .is_some_and(|held| held.same_attempt(&offer)) =>
            {
                OfferDisposition::Ignore("repeat of the held offer")
            }
            Slot::Active(_) => OfferDisposition::Defer,
        };

        match disposition {
            OfferDisposition::Surface => {
                self.incoming(topic, &offer);
                entry.slot = Slot::Pending(offer);
            }
            OfferDisposition::Replace => {
                tracing::info!(topic = %topic, "Caller sent a new offer; replacing the pending one");
                self.incoming(topic, &offer);
                let replaced = std::mem::replace(&mut entry.slot, Slot::Pending(offer));
                if let Slot::Pending(replaced) = replaced {
                    entry.remember(replaced.call);
                }
            }
            OfferDisposition::Defer => {
                tracing::info!(topic = %topic, "Holding new offer until the current call closes");
                if let Some(replaced) = entry.deferred.replace(offer) {
                    entry.remember(replaced.call);
                }
            }
            OfferDisposition::Ignore(why) => {
                tracing::debug!(topic = %topic, why, "Ignoring duplicate offer");
            }
        }
    }

    fn apply_report(&self, registry: &mut Registry<I>, report: SessionReport) {
        let SessionReport {
            topic,
            call_id,
            kind,
        } = report;
        let live = registry
            .entries
            .get(&topic)
            .and_then(TopicEntry::active)
            .is_some_and(|handle| handle.call_id() == call_id);
        if !live {
            tracing::debug!(topic = %topic, call_id = %call_id, "Ignoring report from superseded session");
            return;
        }

        match kind {
            ReportKind::Connected => {
                tracing::info!(topic = %topic, call_id = %call_id, "Call connected");
                self.emit(CallEvent::CallConnected { topic, call_id });
            }
            ReportKind::RemoteTrack(track) => {
                self.emit(CallEvent::RemoteTrack { topic, track });
            }
            ReportKind::DeliveryFailed { kind, error } => {
                self.emit(CallEvent::DeliveryFailed {
                    topic,
                    message_type: kind.to_string(),
                    error,
                });
            }
            ReportKind::Closed(reason) => self.retire(registry, &topic, call_id, Some(reason)),
            ReportKind::Aborted(cause) => {
                tracing::debug!(topic = %topic, call_id = %call_id, cause = %cause, "Call attempt abandoned");
                self.retire(registry, &topic, call_id, None);
            }
        }
    }
}

async fn pump<I: PeerIdentity>(inner: Weak<Inner<I>>, mut inbound: mpsc::UnboundedReceiver<Inbound<I>>) {
    while let Some(item) = inbound.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let mut registry = inner.registry.lock().await;
        match item {
            Inbound::Signal(topic, message) => inner.route_signal(&mut registry, topic, message),
            Inbound::Report(report) => inner.apply_report(&mut registry, report),
        }
    }
    tracing::debug!("Call orchestrator pump stopped");
}

/// Top-level call controller for one local participant
pub struct CallOrchestrator<I: PeerIdentity> {
    inner: Arc<Inner<I>>,
    pump: JoinHandle<()>,
}

impl<I: PeerIdentity> CallOrchestrator<I> {
    /// Create an orchestrator; must be called inside a tokio runtime
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid
    pub fn new(
        local: I,
        transport: Arc<dyn PubSubTransport>,
        media: Arc<dyn MediaSource>,
        connector: Arc<dyn PeerConnector>,
        config: CallConfig,
    ) -> Result<Self, CallError> {
        config
            .validate()
            .map_err(|e| CallError::ConfigError(e.to_string()))?;

        let (events, _) = broadcast::channel(config.event_capacity);
        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            local,
            config: Arc::new(config),
            transport,
            media,
            connector,
            registry: Mutex::new(Registry::new()),
            events,
            inbound,
        });
        let pump = tokio::spawn(pump(Arc::downgrade(&inner), inbound_rx));

        tracing::info!(local = %inner.local, "Call orchestrator started");
        Ok(Self { inner, pump })
    }

    /// Create a builder
    #[must_use]
    pub fn builder(local: I, transport: Arc<dyn PubSubTransport>) -> CallOrchestratorBuilder<I> {
        CallOrchestratorBuilder::new(local, transport)
    }

    /// Local participant
    pub fn local(&self) -> &I {
        &self.inner.local
    }

    /// Configuration in use
    pub fn config(&self) -> &CallConfig {
        &self.inner.config
    }

    /// Subscribe to events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent<I>> {
        self.inner.events.subscribe()
    }

    /// Topic shared with `peer`
    ///
    /// # Errors
    ///
    /// Returns [`CallError::SelfCall`] if `peer` is the local participant
    pub fn topic_with(&self, peer: &I) -> Result<Topic, CallError> {
        if *peer == self.inner.local {
            return Err(CallError::SelfCall);
        }
        Ok(Topic::between(&self.inner.local, peer))
    }

    /// Keep the topic shared with `peer` open so their offers can arrive
    ///
    /// # Errors
    ///
    /// Returns error if `peer` is the local participant or the subscription fails
    #[tracing::instrument(skip(self), fields(peer = %peer))]
    pub async fn listen(&self, peer: &I) -> Result<Topic, CallError> {
        let topic = self.topic_with(peer)?;
        let mut registry = self.inner.registry.lock().await;
        self.inner.channel_for(&mut registry, &topic, peer).await?;
        if let Some(entry) = registry.entries.get_mut(&topic) {
            entry.listening = true;
        }
        tracing::info!(topic = %topic, "Listening for calls");
        Ok(topic)
    }

    /// Stop listening on the topic shared with `peer`
    ///
    /// Running calls are unaffected; the channel goes away once they end.
    #[tracing::instrument(skip(self), fields(peer = %peer))]
    pub async fn stop_listening(&self, peer: &I) {
        let Ok(topic) = self.topic_with(peer) else {
            return;
        };
        let mut registry = self.inner.registry.lock().await;
        if let Some(entry) = registry.entries.get_mut(&topic) {
            entry.listening = false;
        }
        registry.release_if_idle(&topic);
    }

    /// Call `to`, carrying `meta` with the offer
    ///
    /// Resolves once the offer was sent; connection progress arrives as
    /// events.
    ///
    /// # Errors
    ///
    /// Returns error if the topic is busy, the microphone is unavailable or
    /// the offer could not be created or delivered
    #[tracing::instrument(skip(self, meta), fields(peer = %to))]
    pub async fn start_call(&self, to: I, meta: Option<CallMetadata>) -> Result<Topic, CallError> {
        let topic = self.topic_with(&to)?;

        let (call_id, opened) = {
            let mut registry = self.inner.registry.lock().await;
            if registry
                .entries
                .get(&topic)
                .is_some_and(|entry| !matches!(entry.slot, Slot::Vacant))
            {
                tracing::warn!(topic = %topic, "Call already in progress");
                return Err(CallError::AlreadyActive(topic));
            }

            let channel = self.inner.channel_for(&mut registry, &topic, &to).await?;
            let desc = self
                .inner
                .descriptor(CallId::new(), SessionRole::Caller, &topic, to, channel);
            let call_id = desc.call_id;
            let (handle, opened) = CallSession::spawn(desc, Opening::Offer { meta });
            if let Some(entry) = registry.entries.get_mut(&topic) {
                entry.slot = Slot::Active(handle);
            }
            (call_id, opened)
        };

        tracing::info!(topic = %topic, call_id = %call_id, "Starting call");
        self.await_opening(&topic, call_id, opened).await?;
        Ok(topic)
    }

    /// Accept the offer pending on `topic`
    ///
    /// Resolves once the answer was sent.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::NoPendingOffer`] if there is nothing to accept, or
    /// the error that ended the answering session
    #[tracing::instrument(skip(self), fields(topic = %topic))]
    pub async fn accept_call(&self, topic: &Topic) -> Result<(), CallError> {
        let (call_id, opened) = {
            let mut registry = self.inner.registry.lock().await;
            let entry = registry
                .entries
                .get_mut(topic)
                .ok_or_else(|| CallError::NoPendingOffer(topic.clone()))?;
            let offer = match std::mem::replace(&mut entry.slot, Slot::Vacant) {
                Slot::Pending(offer) => offer,
                other => {
                    entry.slot = other;
                    return Err(CallError::NoPendingOffer(topic.clone()));
                }
            };

            // The answering session adopts the caller's attempt id
            let desc = self.inner.descriptor(
                offer.call.unwrap_or_else(CallId::new),
                SessionRole::Callee,
                topic,
                offer.from,
                entry.channel.clone(),
            );
            let call_id = desc.call_id;
            let (handle, opened) = CallSession::spawn(
                desc,
                Opening::Answer {
                    offer: offer.description,
                    candidates: offer.candidates,
                },
            );
            entry.slot = Slot::Active(handle);
            (call_id, opened)
        };

        tracing::info!(call_id = %call_id, "Accepting call");
        self.await_opening(topic, call_id, opened).await
    }

    /// Discard the offer pending on `topic`
    ///
    /// Nothing is sent to the caller; their attempt runs into its timeout.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::NoPendingOffer`] if there is nothing to decline
    #[tracing::instrument(skip(self), fields(topic = %topic))]
    pub async fn decline_call(&self, topic: &Topic) -> Result<(), CallError> {
        let mut registry = self.inner.registry.lock().await;
        let declined = match registry.entries.get_mut(topic) {
            Some(entry) if matches!(entry.slot, Slot::Pending(_)) => {
                if let Slot::Pending(offer) = std::mem::replace(&mut entry.slot, Slot::Vacant) {
                    entry.remember(offer.call);
                }
                true
            }
            _ => false,
        };
        if !declined {
            return Err(CallError::NoPendingOffer(topic.clone()));
        }

        tracing::info!("Declined incoming call");
        self.inner.emit(CallEvent::CallEnded {
            topic: topic.clone(),
            reason: CallEndReason::Declined,
        });
        registry.release_if_idle(topic);
        Ok(())
    }

    /// End whatever is happening on `topic`
    ///
    /// A running session closes at once and the peer gets a `bye`; a pending
    /// offer is declined. Unknown topics are ignored.
    #[tracing::instrument(skip(self), fields(topic = %topic))]
    pub async fn hang_up(&self, topic: &Topic) {
        let farewell = {
            let mut registry = self.inner.registry.lock().await;
            let Some(entry) = registry.entries.get_mut(topic) else {
                tracing::debug!("Nothing to hang up");
                return;
            };
            match std::mem::replace(&mut entry.slot, Slot::Vacant) {
                Slot::Active(handle) => {
                    handle.cancel(CallEndReason::LocalHangUp);
                    tracing::info!(call_id = %handle.call_id(), "Hung up");
                    entry.remember(Some(handle.call_id()));
                    self.inner.emit(CallEvent::CallEnded {
                        topic: topic.clone(),
                        reason: CallEndReason::LocalHangUp,
                    });
                    self.inner.promote_deferred(topic, entry);
                    Some((
                        entry.channel.clone(),
                        handle.remote().clone(),
                        handle.call_id(),
                    ))
                }
                Slot::Pending(offer) => {
                    entry.remember(offer.call);
                    tracing::info!("Declined incoming call");
                    self.inner.emit(CallEvent::CallEnded {
                        topic: topic.clone(),
                        reason: CallEndReason::Declined,
                    });
                    None
                }
                Slot::Vacant => None,
            }
        };

        if let Some((channel, remote, call_id)) = farewell {
            let bye = SignalBody::Bye { reason: None };
            if let Err(e) = channel.send_for_call(&remote, call_id, bye).await {
                tracing::warn!(error = %e, "Could not deliver bye");
                if matches!(e, SignalingError::Delivery { .. }) {
                    self.inner.emit(CallEvent::DeliveryFailed {
                        topic: topic.clone(),
                        message_type: "bye".to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }

        self.inner.registry.lock().await.release_if_idle(topic);
    }

    /// State of the session on `topic`, if one is running
    pub async fn call_state(&self, topic: &Topic) -> Option<CallState> {
        self.inner
            .registry
            .lock()
            .await
            .entries
            .get(topic)
            .and_then(TopicEntry::active)
            .map(SessionHandle::state)
    }

    /// Whether an offer on `topic` waits for accept or decline
    pub async fn has_pending_offer(&self, topic: &Topic) -> bool {
        self.inner
            .registry
            .lock()
            .await
            .entries
            .get(topic)
            .is_some_and(|entry| matches!(entry.slot, Slot::Pending(_)))
    }

    /// Topics with a running session, sorted
    pub async fn active_topics(&self) -> Vec<Topic> {
        let registry = self.inner.registry.lock().await;
        let mut topics: Vec<Topic> = registry
            .entries
            .iter()
            .filter(|(_, entry)| entry.active().is_some())
            .map(|(topic, _)| topic.clone())
            .collect();
        topics.sort();
        topics
    }

    /// Topics with an open signaling channel, sorted
    pub async fn open_topics(&self) -> Vec<Topic> {
        let registry = self.inner.registry.lock().await;
        let mut topics: Vec<Topic> = registry.entries.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Hang up every call, drop pending offers and close every channel
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        let entries = std::mem::take(&mut self.inner.registry.lock().await.entries);
        for (topic, entry) in entries {
            match entry.slot {
                Slot::Active(handle) => {
                    handle.cancel(CallEndReason::Shutdown);
                    self.inner.emit(CallEvent::CallEnded {
                        topic: topic.clone(),
                        reason: CallEndReason::Shutdown,
                    });
                    let bye = SignalBody::Bye {
                        reason: Some(CallEndReason::Shutdown.to_string()),
                    };
                    if let Err(e) = entry
                        .channel
                        .send_for_call(handle.remote(), handle.call_id(), bye)
                        .await
                    {
                        tracing::debug!(topic = %topic, error = %e, "Could not deliver bye");
                    }
                }
                Slot::Pending(_) => {
                    self.inner.emit(CallEvent::CallEnded {
                        topic: topic.clone(),
                        reason: CallEndReason::Shutdown,
                    });
                }
                Slot::Vacant => {}
            }
            entry.channel.destroy();
        }
        tracing::info!("Call orchestrator shut down");
    }

    async fn await_opening(
        &self,
        topic: &Topic,
        call_id: CallId,
        opened: oneshot::Receiver<Result<(), SessionError>>,
    ) -> Result<(), CallError> {
        let outcome = opened
            .await
            .unwrap_or(Err(SessionError::Cancelled(CallEndReason::Shutdown)));
        if let Err(e) = outcome {
            let mut registry = self.inner.registry.lock().await;
            self.inner
                .retire(&mut registry, topic, call_id, e.end_reason());
            return Err(e.into());
        }
        Ok(())
    }
}

impl<I: PeerIdentity> Drop for CallOrchestrator<I> {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Call orchestrator builder
pub struct CallOrchestratorBuilder<I: PeerIdentity> {
    local: I,
    transport: Arc<dyn PubSubTransport>,
    media: Option<Arc<dyn MediaSource>>,
    connector: Option<Arc<dyn PeerConnector>>,
    config: CallConfig,
}

impl<I: PeerIdentity> CallOrchestratorBuilder<I> {
    /// Create new builder
    #[must_use]
    pub fn new(local: I, transport: Arc<dyn PubSubTransport>) -> Self {
        Self {
            local,
            transport,
            media: None,
            connector: None,
            config: CallConfig::default(),
        }
    }

    /// Set the media source
    #[must_use]
    pub fn with_media(mut self, media: Arc<dyn MediaSource>) -> Self {
        self.media = Some(media);
        self
    }

    /// Set the peer connector
    #[must_use]
    pub fn with_connector(mut self, connector: Arc<dyn PeerConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Set configuration
    #[must_use]
    pub fn with_config(mut self, config: CallConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the orchestrator
    ///
    /// With the `webrtc-backend` feature, missing media and connector default
    /// to the WebRTC-backed ones.
    ///
    /// # Errors
    ///
    /// Returns error if a collaborator is missing or the configuration is invalid
    pub fn build(self) -> Result<CallOrchestrator<I>, CallError> {
        #[cfg(feature = "webrtc-backend")]
        let media = self
            .media
            .unwrap_or_else(|| Arc::new(crate::rtc::RtcMediaSource::new()) as Arc<dyn MediaSource>);
        #[cfg(not(feature = "webrtc-backend"))]
        let media = self
            .media
            .ok_or_else(|| CallError::ConfigError("media source not set".to_string()))?;

        #[cfg(feature = "webrtc-backend")]
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(crate::rtc::RtcConnector::new()) as Arc<dyn PeerConnector>);
        #[cfg(not(feature = "webrtc-backend"))]
        let connector = self
            .connector
            .ok_or_else(|| CallError::ConfigError("peer connector not set".to_string()))?;

        CallOrchestrator::new(self.local, self.transport, media, connector, self.config)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::identity::PeerIdentityString;
    use crate::loopback::{LoopbackBroker, SimulatedConnector, SimulatedMedia};
    use std::time::Duration;

    type Id = PeerIdentityString;

    fn orchestrator(local: &str, broker: &Arc<LoopbackBroker>) -> CallOrchestrator<Id> {
        CallOrchestrator::builder(Id::new(local), broker.clone())
            .with_media(Arc::new(SimulatedMedia::new()))
            .with_connector(Arc::new(SimulatedConnector::new()))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_builder_requires_collaborators_without_backend() {
        let broker: Arc<dyn PubSubTransport> = Arc::new(LoopbackBroker::new());
        let result = CallOrchestrator::builder(Id::new("A"), broker)
            .with_media(Arc::new(SimulatedMedia::new()))
            .build();
        if cfg!(feature = "webrtc-backend") {
            assert!(result.is_ok());
        } else {
            assert!(matches!(result, Err(CallError::ConfigError(_))));
        }
    }

    #[tokio::test]
    async fn test_builder_rejects_invalid_config() {
        let broker = Arc::new(LoopbackBroker::new());
        let config = CallConfig {
            event_capacity: 0,
            ..CallConfig::default()
        };
        let result = CallOrchestrator::builder(Id::new("A"), broker)
            .with_media(Arc::new(SimulatedMedia::new()))
            .with_connector(Arc::new(SimulatedConnector::new()))
            .with_config(config)
            .build();
        assert!(matches!(result, Err(CallError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_stale_report_is_ignored() {
        let broker = Arc::new(LoopbackBroker::new());
        let a = orchestrator("A", &broker);
        let mut events = a.subscribe_events();
        let topic = a.start_call(Id::new("B"), None).await.unwrap();

        a.inner
            .inbound
            .send(Inbound::Report(SessionReport {
                topic: topic.clone(),
                call_id: CallId::new(),
                kind: ReportKind::Closed(CallEndReason::Timeout),
            }))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(a.call_state(&topic).await, Some(CallState::Offering));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_listen_and_stop_listening_manage_channel() {
        let broker = Arc::new(LoopbackBroker::new());
        let a = orchestrator("A", &broker);
        let topic = a.listen(&Id::new("B")).await.unwrap();
        a.listen(&Id::new("B")).await.unwrap();
        assert_eq!(broker.subscriber_count(&topic), 1);
        assert_eq!(a.open_topics().await, vec![topic.clone()]);

        a.stop_listening(&Id::new("B")).await;
        assert!(a.open_topics().await.is_empty());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(broker.subscriber_count(&topic), 0);
    }

    #[tokio::test]
    async fn test_self_call_rejected() {
        let broker = Arc::new(LoopbackBroker::new());
        let a = orchestrator("A", &broker);
        assert!(matches!(
            a.start_call(Id::new("A"), None).await,
            Err(CallError::SelfCall)
        ));
        assert!(matches!(a.listen(&Id::new("A")).await, Err(CallError::SelfCall)));
        assert!(a.open_topics().await.is_empty());
    }
}
