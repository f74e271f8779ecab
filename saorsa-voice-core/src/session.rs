//! Call session state machine
//!
//! A session is one attempt to bring up a peer connection with one remote
//! participant. It runs as its own task and consumes a single inbox that
//! carries both signaling messages (routed by the orchestrator) and events from
//! its link, so description and candidate application never interleave.
//!
//! Every collaborator await is raced against the session's cancellation
//! signal and its connect deadline. When the await resolves the session checks
//! again that it was not cancelled and is still in the state the operation
//! expected; anything else is a stale result and is dropped.

use crate::config::CallConfig;
use crate::connection::{ConnectionError, LinkEvent, LinkEventSink, PeerConnector, PeerLink};
use crate::identity::PeerIdentity;
use crate::media::{MediaError, MediaGuard, MediaSource};
use crate::signaling::{SignalBody, SignalKind, SignalMessage, SignalingChannel, SignalingError};
use crate::types::{
    CallEndReason, CallId, CallMetadata, CallState, IceCandidate, RemoteTrack, SessionDescription,
    SessionRole, Topic,
};
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::Instrument;

/// Upper bound on link close and farewell sends during teardown
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a session stopped before or during negotiation
#[derive(Error, Debug)]
pub enum SessionError {
    /// Microphone unavailable
    #[error("Device access error: {0}")]
    DeviceAccess(#[from] MediaError),

    /// Link refused an operation or failed
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Offer or answer could not be delivered
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    /// Closed from outside
    #[error("Session cancelled: {0}")]
    Cancelled(CallEndReason),

    /// Not connected within the configured window
    #[error("Session timed out")]
    TimedOut,

    /// An operation finished after the session moved on
    #[error("Stale result: expected {expected}, session is {actual}")]
    Stale {
        /// State the operation started in
        expected: CallState,
        /// State found when it finished
        actual: CallState,
    },
}

impl SessionError {
    /// Reason reported with `CallEnded`, or `None` when the attempt is
    /// abandoned without one
    pub fn end_reason(&self) -> Option<CallEndReason> {
        match self {
            Self::DeviceAccess(_) => None,
            Self::Connection(e) => Some(CallEndReason::Failed(e.to_string())),
            Self::Signaling(e) => Some(CallEndReason::Failed(e.to_string())),
            Self::Cancelled(reason) => Some(reason.clone()),
            Self::TimedOut => Some(CallEndReason::Timeout),
            Self::Stale { actual, .. } => {
                Some(CallEndReason::Failed(format!("session moved to {actual}")))
            }
        }
    }
}

/// Callback the session reports through
pub(crate) type ReportSink = Arc<dyn Fn(SessionReport) + Send + Sync>;

/// Something the orchestrator needs to hear about, tagged with the session
#[derive(Debug)]
pub(crate) struct SessionReport {
    pub(crate) topic: Topic,
    pub(crate) call_id: CallId,
    pub(crate) kind: ReportKind,
}

#[derive(Debug)]
pub(crate) enum ReportKind {
    Connected,
    RemoteTrack(RemoteTrack),
    DeliveryFailed { kind: SignalKind, error: String },
    Closed(CallEndReason),
    /// Ended before media was acquired; no `CallEnded` is owed
    Aborted(String),
}

/// Everything a session needs, assembled before any link exists
pub(crate) struct SessionDescriptor<I: PeerIdentity> {
    pub(crate) call_id: CallId,
    pub(crate) role: SessionRole,
    pub(crate) remote: I,
    pub(crate) topic: Topic,
    pub(crate) channel: Arc<SignalingChannel<I>>,
    pub(crate) config: Arc<CallConfig>,
    pub(crate) media: Arc<dyn MediaSource>,
    pub(crate) connector: Arc<dyn PeerConnector>,
    pub(crate) reports: ReportSink,
}

/// First step a session takes
pub(crate) enum Opening {
    /// Create and send an offer
    Offer { meta: Option<CallMetadata> },
    /// Answer a buffered offer, applying candidates that arrived with it
    Answer {
        offer: SessionDescription,
        candidates: Vec<IceCandidate>,
    },
}

pub(crate) enum SessionInput<I: PeerIdentity> {
    Signal(SignalMessage<I>),
    Link(LinkEvent),
}

/// Orchestrator-side handle on a running session
pub(crate) struct SessionHandle<I: PeerIdentity> {
    call_id: CallId,
    remote: I,
    inbox: mpsc::UnboundedSender<SessionInput<I>>,
    cancel: watch::Sender<Option<CallEndReason>>,
    state: watch::Receiver<CallState>,
    answered_offer: Option<SessionDescription>,
}

impl<I: PeerIdentity> SessionHandle<I> {
    pub(crate) fn call_id(&self) -> CallId {
        self.call_id
    }

    pub(crate) fn remote(&self) -> &I {
        &self.remote
    }

    pub(crate) fn state(&self) -> CallState {
        *self.state.borrow()
    }

    /// Whether this session was started by answering the offer `call` carried
    ///
    /// Offers without an id are compared by description.
    pub(crate) fn answered(&self, call: Option<CallId>, offer: &SessionDescription) -> bool {
        self.answered_offer.as_ref().is_some_and(|answered| match call {
            Some(call) => call == self.call_id,
            None => answered == offer,
        })
    }

    /// Queue a signal; false once the session task is gone
    pub(crate) fn deliver(&self, message: SignalMessage<I>) -> bool {
        self.inbox.send(SessionInput::Signal(message)).is_ok()
    }

    /// Ask the session to close; the first reason wins
    pub(crate) fn cancel(&self, reason: CallEndReason) {
        self.cancel.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
    }
}

#[derive(Clone)]
struct Interrupts {
    cancel: watch::Receiver<Option<CallEndReason>>,
    deadline: Option<Instant>,
}

impl Interrupts {
    /// Run `fut` unless the session is cancelled or runs out of time first
    async fn settle<T>(mut self, fut: impl Future<Output = T>) -> Result<T, SessionError> {
        let deadline = self.deadline;
        tokio::select! {
            biased;
            reason = cancelled(&mut self.cancel) => Err(SessionError::Cancelled(reason)),
            () = expire(deadline) => Err(SessionError::TimedOut),
            output = fut => Ok(output),
        }
    }
}

async fn cancelled(cancel: &mut watch::Receiver<Option<CallEndReason>>) -> CallEndReason {
    match cancel.wait_for(Option::is_some).await {
        Ok(reason) => reason.clone().unwrap_or(CallEndReason::Shutdown),
        // Handle dropped along with the orchestrator
        Err(_) => CallEndReason::Shutdown,
    }
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

pub(crate) struct CallSession<I: PeerIdentity> {
    desc: SessionDescriptor<I>,
    state: CallState,
    state_tx: watch::Sender<CallState>,
    inbox: mpsc::UnboundedReceiver<SessionInput<I>>,
    sink: LinkEventSink,
    cancel: watch::Receiver<Option<CallEndReason>>,
    deadline: Instant,
    link: Option<Box<dyn PeerLink>>,
    media: Option<MediaGuard>,
    remote_applied: bool,
    pending: VecDeque<IceCandidate>,
    seen: HashSet<IceCandidate>,
    description_sent: bool,
}

impl<I: PeerIdentity> CallSession<I> {
    /// Start a session task
    ///
    /// The receiver resolves once the opening step (offer or answer sent)
    /// finished or failed.
    pub(crate) fn spawn(
        desc: SessionDescriptor<I>,
        opening: Opening,
    ) -> (SessionHandle<I>, oneshot::Receiver<Result<(), SessionError>>) {
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let (cancel_tx, cancel) = watch::channel(None);
        let (state_tx, state_rx) = watch::channel(CallState::Idle);
        let (opened_tx, opened_rx) = oneshot::channel();

        let link_tx = inbox_tx.clone();
        let sink = LinkEventSink::new(move |event| {
            let _ = link_tx.send(SessionInput::Link(event));
        });

        let answered_offer = match &opening {
            Opening::Answer { offer, .. } => Some(offer.clone()),
            Opening::Offer { .. } => None,
        };
        let handle = SessionHandle {
            call_id: desc.call_id,
            remote: desc.remote.clone(),
            inbox: inbox_tx,
            cancel: cancel_tx,
            state: state_rx,
            answered_offer,
        };

        let span = tracing::info_span!(
            "call_session",
            topic = %desc.topic,
            call_id = %desc.call_id,
            role = ?desc.role,
        );
        let session = Self {
            deadline: Instant::now() + desc.config.connect_timeout,
            desc,
            state: CallState::Idle,
            state_tx,
            inbox,
            sink,
            cancel,
            link: None,
            media: None,
            remote_applied: false,
            pending: VecDeque::new(),
            seen: HashSet::new(),
            description_sent: false,
        };
        tokio::spawn(session.run(opening, opened_tx).instrument(span));

        (handle, opened_rx)
    }

    async fn run(mut self, opening: Opening, opened: oneshot::Sender<Result<(), SessionError>>) {
        if let Err(e) = self.open(opening).await {
            tracing::warn!(error = %e, "Session failed to open");
            self.finish(&e).await;
            let _ = opened.send(Err(e));
            return;
        }
        let _ = opened.send(Ok(()));

        while self.state != CallState::Closed {
            let next = self.interrupts().settle(self.inbox.recv()).await;
            let result = match next {
                Ok(Some(input)) => self.handle(input).await,
                Ok(None) => Err(SessionError::Cancelled(CallEndReason::Shutdown)),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                self.finish(&e).await;
            }
        }
        tracing::debug!("Session task finished");
    }

    async fn open(&mut self, opening: Opening) -> Result<(), SessionError> {
        let audio = self
            .interrupts()
            .settle(self.desc.media.acquire_local_audio())
            .await??;
        self.media = Some(MediaGuard::new(audio));
        self.ensure(CallState::Idle)?;
        tracing::debug!("Local audio acquired");

        let next = match self.desc.role {
            SessionRole::Caller => CallState::Offering,
            SessionRole::Callee => CallState::Answering,
        };
        self.transition(next);

        let link = self
            .interrupts()
            .settle(self.desc.connector.create(&self.desc.config, self.sink.clone()))
            .await??;
        self.link = Some(link);
        self.ensure(next)?;

        if let (Some(link), Some(audio)) = (
            self.link.as_deref(),
            self.media.as_ref().and_then(MediaGuard::audio),
        ) {
            self.interrupts()
                .settle(link.add_local_audio(audio))
                .await??;
            self.ensure(next)?;
        }

        match opening {
            Opening::Offer { meta } => self.send_offer(meta).await,
            Opening::Answer { offer, candidates } => self.send_answer(offer, candidates).await,
        }
    }

    async fn send_offer(&mut self, meta: Option<CallMetadata>) -> Result<(), SessionError> {
        let link = self.link()?;
        let offer = self.interrupts().settle(link.create_offer()).await??;
        self.ensure(CallState::Offering)?;
        self.interrupts()
            .settle(link.set_local_description(offer.clone()))
            .await??;
        self.ensure(CallState::Offering)?;

        self.send_signal(SignalBody::Offer {
            description: offer,
            meta,
        })
        .await?;
        self.description_sent = true;
        self.ensure(CallState::Offering)?;
        tracing::info!("Offer sent");
        Ok(())
    }

    async fn send_answer(
        &mut self,
        offer: SessionDescription,
        early: Vec<IceCandidate>,
    ) -> Result<(), SessionError> {
        let link = self.link()?;
        self.interrupts()
            .settle(link.set_remote_description(offer))
            .await??;
        self.ensure(CallState::Answering)?;
        self.remote_applied = true;
        self.flush_pending().await?;

        if !early.is_empty() {
            tracing::debug!(count = early.len(), "Applying candidates received with the offer");
        }
        for candidate in early {
            self.on_remote_candidate(candidate).await?;
        }

        let link = self.link()?;
        let answer = self.interrupts().settle(link.create_answer()).await??;
        self.ensure(CallState::Answering)?;
        self.interrupts()
            .settle(link.set_local_description(answer.clone()))
            .await??;
        self.ensure(CallState::Answering)?;

        self.send_signal(SignalBody::Answer(answer)).await?;
        self.description_sent = true;
        self.ensure(CallState::Answering)?;
        tracing::info!("Answer sent");
        Ok(())
    }

    async fn handle(&mut self, input: SessionInput<I>) -> Result<(), SessionError> {
        match input {
            SessionInput::Signal(message) => self.on_signal(message).await,
            SessionInput::Link(event) => self.on_link_event(event).await,
        }
    }

    async fn on_signal(&mut self, message: SignalMessage<I>) -> Result<(), SessionError> {
        if !message.belongs_to(Some(self.desc.call_id)) {
            tracing::debug!(kind = %message.kind(), call = ?message.call, "Ignoring signal from another call attempt");
            return Ok(());
        }
        match message.body {
            SignalBody::Answer(description) => self.on_answer(description).await,
            SignalBody::Candidate(candidate) => self.on_remote_candidate(candidate).await,
            SignalBody::Bye { reason } => {
                tracing::info!(reason = ?reason, "Remote hung up");
                self.close(CallEndReason::RemoteHangUp).await;
                Ok(())
            }
            SignalBody::Offer { .. } => {
                tracing::debug!(state = %self.state, "Ignoring offer inside a live session");
                Ok(())
            }
        }
    }

    async fn on_answer(&mut self, description: SessionDescription) -> Result<(), SessionError> {
        if self.desc.role != SessionRole::Caller
            || self.state != CallState::Offering
            || self.remote_applied
        {
            tracing::debug!(state = %self.state, "Ignoring unexpected answer");
            return Ok(());
        }

        let link = self.link()?;
        self.interrupts()
            .settle(link.set_remote_description(description))
            .await??;
        self.ensure(CallState::Offering)?;
        self.remote_applied = true;
        self.flush_pending().await?;
        self.ensure(CallState::Offering)?;

        self.connected();
        Ok(())
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate) -> Result<(), SessionError> {
        if !self.seen.insert(candidate.clone()) {
            tracing::debug!(candidate = %candidate.candidate, "Skipping duplicate candidate");
            return Ok(());
        }
        if !self.remote_applied {
            self.pending.push_back(candidate);
            tracing::debug!(buffered = self.pending.len(), "Buffered early candidate");
            return Ok(());
        }
        self.apply_candidate(candidate).await
    }

    async fn flush_pending(&mut self) -> Result<(), SessionError> {
        if !self.pending.is_empty() {
            tracing::debug!(count = self.pending.len(), "Flushing buffered candidates");
        }
        while let Some(candidate) = self.pending.pop_front() {
            self.apply_candidate(candidate).await?;
        }
        Ok(())
    }

    async fn apply_candidate(&self, candidate: IceCandidate) -> Result<(), SessionError> {
        let line = candidate.candidate.clone();
        let link = self.link()?;
        match self.interrupts().settle(link.add_candidate(candidate)).await? {
            Ok(()) => tracing::trace!(candidate = %line, "Applied remote candidate"),
            Err(e) => tracing::warn!(candidate = %line, error = %e, "Remote candidate rejected"),
        }
        Ok(())
    }

    async fn on_link_event(&mut self, event: LinkEvent) -> Result<(), SessionError> {
        match event {
            LinkEvent::LocalCandidate(candidate) => {
                match self.send_signal(SignalBody::Candidate(candidate)).await {
                    Err(SessionError::Signaling(e)) => {
                        tracing::warn!(error = %e, "Local candidate not delivered");
                        Ok(())
                    }
                    other => other,
                }
            }
            LinkEvent::RemoteTrack(track) => {
                tracing::info!(track_id = %track.track_id, kind = %track.kind, "Remote track arrived");
                self.report(ReportKind::RemoteTrack(track));
                Ok(())
            }
            LinkEvent::Connected => {
                if self.state == CallState::Answering {
                    self.connected();
                } else {
                    tracing::debug!(state = %self.state, "Link reports connected");
                }
                Ok(())
            }
            LinkEvent::Closed => Err(ConnectionError::Closed.into()),
            LinkEvent::Failed(reason) => Err(ConnectionError::Failed(reason).into()),
        }
    }

    async fn send_signal(&self, body: SignalBody) -> Result<(), SessionError> {
        let kind = body.kind();
        let sent = self
            .interrupts()
            .settle(
                self.desc
                    .channel
                    .send_for_call(&self.desc.remote, self.desc.call_id, body),
            )
            .await?;
        if let Err(e) = sent {
            if matches!(e, SignalingError::Delivery { .. }) {
                self.report(ReportKind::DeliveryFailed {
                    kind,
                    error: e.to_string(),
                });
            }
            return Err(e.into());
        }
        Ok(())
    }

    fn connected(&mut self) {
        self.transition(CallState::Connected);
        self.report(ReportKind::Connected);
    }

    async fn finish(&mut self, error: &SessionError) {
        match error.end_reason() {
            Some(reason) => self.close(reason).await,
            None => self.abort(error.to_string()).await,
        }
    }

    /// Tear down and report; later calls do nothing
    async fn close(&mut self, reason: CallEndReason) {
        if self.state == CallState::Closed {
            return;
        }
        self.transition(CallState::Closed);

        if self.description_sent
            && matches!(reason, CallEndReason::Timeout | CallEndReason::Failed(_))
        {
            let bye = SignalBody::Bye {
                reason: Some(reason.to_string()),
            };
            match tokio::time::timeout(
                TEARDOWN_TIMEOUT,
                self.desc
                    .channel
                    .send_for_call(&self.desc.remote, self.desc.call_id, bye),
            )
            .await
            {
                Ok(Ok(())) => tracing::debug!("Sent bye"),
                Ok(Err(e)) => tracing::debug!(error = %e, "Could not send bye"),
                Err(_) => tracing::debug!("Bye send timed out"),
            }
        }

        self.teardown().await;
        tracing::info!(reason = %reason, "Call session closed");
        self.report(ReportKind::Closed(reason));
    }

    async fn abort(&mut self, cause: String) {
        if self.state == CallState::Closed {
            return;
        }
        self.transition(CallState::Closed);
        self.teardown().await;
        self.report(ReportKind::Aborted(cause));
    }

    async fn teardown(&mut self) {
        if let Some(link) = self.link.take() {
            if tokio::time::timeout(TEARDOWN_TIMEOUT, link.close())
                .await
                .is_err()
            {
                tracing::warn!("Link close timed out");
            }
        }
        if let Some(mut media) = self.media.take() {
            media.stop();
        }
        if !self.pending.is_empty() {
            tracing::debug!(dropped = self.pending.len(), "Discarding buffered candidates");
            self.pending.clear();
        }
    }

    fn transition(&mut self, next: CallState) {
        let old_state = self.state;
        self.state = next;
        self.state_tx.send_replace(next);
        tracing::info!(old_state = %old_state, new_state = %next, "Call state changed");
    }

    /// Stale-result guard
    fn ensure(&self, expected: CallState) -> Result<(), SessionError> {
        if let Some(reason) = self.cancel.borrow().clone() {
            return Err(SessionError::Cancelled(reason));
        }
        if self.state.is_negotiating() && Instant::now() >= self.deadline {
            return Err(SessionError::TimedOut);
        }
        if self.state != expected {
            return Err(SessionError::Stale {
                expected,
                actual: self.state,
            });
        }
        Ok(())
    }

    fn interrupts(&self) -> Interrupts {
        Interrupts {
            cancel: self.cancel.clone(),
            deadline: self.state.is_negotiating().then_some(self.deadline),
        }
    }

    fn link(&self) -> Result<&dyn PeerLink, SessionError> {
        self.link
            .as_deref()
            .ok_or(SessionError::Connection(ConnectionError::Closed))
    }

    fn report(&self, kind: ReportKind) {
        (self.desc.reports)(SessionReport {
            topic: self.desc.topic.clone(),
            call_id: self.desc.call_id,
            kind,
        });
    }
}
