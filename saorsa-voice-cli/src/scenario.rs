//! Loopback call scenarios
//!
//! Runs two orchestrators against one in-process broker and records what
//! each side observed.

use anyhow::{Context, Result};
use clap::ValueEnum;
use saorsa_voice_core::loopback::{LoopbackBroker, SimulatedConnector, SimulatedMedia};
use saorsa_voice_core::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

type Events = broadcast::Receiver<CallEvent<PeerIdentityString>>;

/// Slack on top of the connect timeout when waiting for the caller to give up
const TIMEOUT_MARGIN: Duration = Duration::from_secs(2);

/// How long to wait for steps that do not involve a timeout
const STEP_WAIT: Duration = Duration::from_secs(5);

/// What the callee does with the incoming call
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Scenario {
    /// Accept, connect, then the caller hangs up
    Accept,
    /// Decline; the caller runs into its connect timeout
    Decline,
    /// Like accept, with every message delivered twice
    Duplicate,
}

/// What each side saw
#[derive(Debug, Default)]
pub struct DemoReport {
    pub caller_events: Vec<String>,
    pub callee_events: Vec<String>,
    pub incoming_calls: usize,
    pub connected: bool,
    pub sessions: (usize, usize),
    pub caller_end: Option<CallEndReason>,
    pub callee_end: Option<CallEndReason>,
}

impl DemoReport {
    pub fn print(&self) {
        println!("caller:");
        for line in &self.caller_events {
            println!("  {line}");
        }
        println!("callee:");
        for line in &self.callee_events {
            println!("  {line}");
        }
        println!(
            "incoming calls: {} | connected: {} | sessions: {}/{}",
            self.incoming_calls, self.connected, self.sessions.0, self.sessions.1
        );
        if let Some(reason) = &self.caller_end {
            println!("caller ended: {reason}");
        }
        if let Some(reason) = &self.callee_end {
            println!("callee ended: {reason}");
        }
    }
}

pub fn describe(event: &CallEvent<PeerIdentityString>) -> String {
    match event {
        CallEvent::IncomingCall { from, meta, .. } => match meta {
            Some(meta) => format!("incoming call from {from} {}", meta.0),
            None => format!("incoming call from {from}"),
        },
        CallEvent::CallConnected { call_id, .. } => format!("connected ({call_id})"),
        CallEvent::CallEnded { reason, .. } => format!("ended: {reason}"),
        CallEvent::RemoteTrack { track, .. } => {
            format!("remote {} track {}", track.kind, track.track_id)
        }
        CallEvent::DeliveryFailed {
            message_type,
            error,
            ..
        } => format!("could not deliver {message_type}: {error}"),
    }
}

fn orchestrator(
    identity: &PeerIdentityString,
    broker: &Arc<LoopbackBroker>,
    config: &CallConfig,
) -> Result<CallOrchestrator<PeerIdentityString>> {
    Ok(
        CallOrchestrator::builder(identity.clone(), broker.clone())
            .with_media(Arc::new(SimulatedMedia::new()))
            .with_connector(Arc::new(SimulatedConnector::new()))
            .with_config(config.clone())
            .build()?,
    )
}

async fn wait_for(
    events: &mut Events,
    log: &mut Vec<String>,
    within: Duration,
    want: impl Fn(&CallEvent<PeerIdentityString>) -> bool,
) -> Result<CallEvent<PeerIdentityString>> {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .context("timed out waiting for call event")??;
        log.push(describe(&event));
        if want(&event) {
            return Ok(event);
        }
    }
}

fn drain(events: &mut Events, log: &mut Vec<String>) -> usize {
    let mut incoming = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, CallEvent::IncomingCall { .. }) {
            incoming += 1;
        }
        log.push(describe(&event));
    }
    incoming
}

fn end_reason(event: CallEvent<PeerIdentityString>) -> Option<CallEndReason> {
    match event {
        CallEvent::CallEnded { reason, .. } => Some(reason),
        _ => None,
    }
}

/// Run `scenario` between `caller` and `callee`
pub async fn run(
    scenario: Scenario,
    caller: &str,
    callee: &str,
    config: CallConfig,
) -> Result<DemoReport> {
    let broker = Arc::new(LoopbackBroker::new());
    if scenario == Scenario::Duplicate {
        broker.set_duplicate_delivery(true);
    }

    let caller_id = PeerIdentityString::new(caller);
    let callee_id = PeerIdentityString::new(callee);
    let a = orchestrator(&caller_id, &broker, &config)?;
    let b = orchestrator(&callee_id, &broker, &config)?;
    let mut a_events = a.subscribe_events();
    let mut b_events = b.subscribe_events();
    let mut report = DemoReport::default();

    b.listen(&caller_id).await?;
    let meta = CallMetadata(serde_json::json!({ "display_name": caller }));
    let topic = a.start_call(callee_id.clone(), Some(meta)).await?;
    tracing::info!(topic = %topic, "Offer sent");

    wait_for(&mut b_events, &mut report.callee_events, STEP_WAIT, |e| {
        matches!(e, CallEvent::IncomingCall { .. })
    })
    .await?;
    report.incoming_calls += 1;

    match scenario {
        Scenario::Decline => {
            b.decline_call(&topic).await?;
            let ended = wait_for(
                &mut a_events,
                &mut report.caller_events,
                config.connect_timeout + TIMEOUT_MARGIN,
                |e| matches!(e, CallEvent::CallEnded { .. }),
            )
            .await?;
            report.caller_end = end_reason(ended);
        }
        Scenario::Accept | Scenario::Duplicate => {
            b.accept_call(&topic).await?;
            let connected = |e: &CallEvent<PeerIdentityString>| {
                matches!(e, CallEvent::CallConnected { .. })
            };
            wait_for(&mut a_events, &mut report.caller_events, STEP_WAIT, connected).await?;
            wait_for(&mut b_events, &mut report.callee_events, STEP_WAIT, connected).await?;
            report.connected = true;
            report.sessions = (a.active_topics().await.len(), b.active_topics().await.len());

            a.hang_up(&topic).await;
            let ended = wait_for(&mut b_events, &mut report.callee_events, STEP_WAIT, |e| {
                matches!(e, CallEvent::CallEnded { .. })
            })
            .await?;
            report.callee_end = end_reason(ended);
        }
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    drain(&mut a_events, &mut report.caller_events);
    report.incoming_calls += drain(&mut b_events, &mut report.callee_events);

    a.shutdown().await;
    b.shutdown().await;
    Ok(report)
}
