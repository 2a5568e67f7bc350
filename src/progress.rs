//! Per-request typed progress channel (spec §4.3). Bound to one request,
//! not a process-wide sink — callers construct a `ProgressBus` and pass it
//! explicitly down through the Scheduler and Orchestrators (spec §9,
//! "Progress Bus as a capability, not a global"), the same way
//! `ConaryLabs-Mira::experts::council` threads a `ctx.broadcast` capability
//! through its phases rather than reaching for a global event sink.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::broadcast;

/// One of the eight pipeline stages a progress event belongs to, plus the
/// request-level `complete` terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Map,
    MediumScoring,
    Resolve,
    Reduce,
    LanguageCheck,
    CommentGroups,
    CommentSynthesis,
    Complete,
}

impl Phase {
    /// Ordering index used by tests to assert non-decreasing stage progress
    /// per expert (spec §8 property 8). `CommentGroups`/`CommentSynthesis`
    /// run in parallel with `Reduce`'s successors so they share no fixed
    /// position relative to `LanguageCheck`; callers that need the
    /// `map < medium_scoring < resolve < reduce < language_check` chain
    /// should filter to just those four phases first.
    pub fn order_index(self) -> u8 {
        match self {
            Phase::Map => 0,
            Phase::MediumScoring => 1,
            Phase::Resolve => 2,
            Phase::Reduce => 3,
            Phase::LanguageCheck => 4,
            Phase::CommentGroups => 5,
            Phase::CommentSynthesis => 6,
            Phase::Complete => 7,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Started,
    Progress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub phase: Phase,
    pub status: EventStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expert_id: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<JsonValue>,
}

impl ProgressEvent {
    pub fn new(phase: Phase, status: EventStatus, message: impl Into<String>) -> Self {
        Self {
            phase,
            status,
            expert_id: None,
            message: message.into(),
            payload: None,
        }
    }

    pub fn for_expert(mut self, expert_id: impl Into<String>) -> Self {
        self.expert_id = Some(expert_id.into());
        self
    }

    pub fn with_payload(mut self, payload: JsonValue) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// A single line on the streaming channel: either a real event or a
/// padding keepalive, per spec §6 ("`:keepalive` line padded to >= 2KB").
#[derive(Debug, Clone)]
pub enum StreamLine {
    Event(ProgressEvent),
    Keepalive,
}

const KEEPALIVE_PAD_BYTES: usize = 2048;

/// Render a keepalive as the literal SSE comment line the transport writes,
/// padded past 2KB so intermediary proxies don't buffer it.
pub fn render_keepalive() -> String {
    let mut line = String::from(":keepalive ");
    while line.len() < KEEPALIVE_PAD_BYTES {
        line.push('.');
    }
    line.push('\n');
    line
}

/// Per-request broadcast channel of [`ProgressEvent`]s. Many producers (the
/// Scheduler, each Orchestrator, each stage), one logical subscriber per
/// request. `tokio::sync::broadcast` gives FIFO-per-subscriber delivery and
/// a lagging/dropped subscriber never stalls producers — it just misses
/// events, which the Bus itself cannot prevent since the whole point is
/// decoupling production from consumption speed.
#[derive(Clone)]
pub struct ProgressBus {
    sender: broadcast::Sender<ProgressEvent>,
    keepalive_interval: Duration,
}

impl ProgressBus {
    pub fn new(keepalive_interval_secs: u64) -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            sender,
            keepalive_interval: Duration::from_secs(keepalive_interval_secs),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    /// Emit an event. Losing all subscribers is not an error — the event is
    /// simply dropped, which is the documented behavior of a bus with no
    /// listener.
    pub fn emit(&self, event: ProgressEvent) {
        let _ = self.sender.send(event);
    }

    /// Drive a receiver into a stream of [`StreamLine`]s, injecting a
    /// keepalive whenever the gap since the last real event exceeds the
    /// configured interval. Ends when the `complete` event passes through.
    pub async fn drain_with_keepalives(
        &self,
        mut rx: broadcast::Receiver<ProgressEvent>,
        mut on_line: impl FnMut(StreamLine),
    ) {
        loop {
            match tokio::time::timeout(self.keepalive_interval, rx.recv()).await {
                Ok(Ok(event)) => {
                    let is_complete = event.phase == Phase::Complete;
                    on_line(StreamLine::Event(event));
                    if is_complete {
                        return;
                    }
                }
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => return,
                Err(_elapsed) => on_line(StreamLine::Keepalive),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keepalive_line_is_at_least_2kb() {
        assert!(render_keepalive().len() >= 2048);
    }

    #[test]
    fn phase_order_is_monotonic_for_the_main_chain() {
        assert!(Phase::Map.order_index() < Phase::MediumScoring.order_index());
        assert!(Phase::MediumScoring.order_index() < Phase::Resolve.order_index());
        assert!(Phase::Resolve.order_index() < Phase::Reduce.order_index());
        assert!(Phase::Reduce.order_index() < Phase::LanguageCheck.order_index());
    }

    #[tokio::test]
    async fn emit_without_subscribers_does_not_panic() {
        let bus = ProgressBus::new(5);
        bus.emit(ProgressEvent::new(Phase::Map, EventStatus::Started, "starting"));
    }

    #[tokio::test]
    async fn subscriber_receives_events_in_order() {
        let bus = ProgressBus::new(5);
        let mut rx = bus.subscribe();

        bus.emit(ProgressEvent::new(Phase::Map, EventStatus::Started, "m1").for_expert("e1"));
        bus.emit(ProgressEvent::new(Phase::Map, EventStatus::Completed, "m2").for_expert("e1"));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.message, "m1");
        assert_eq!(second.message, "m2");
    }

    #[tokio::test]
    async fn drain_emits_keepalive_on_silence_then_stops_at_complete() {
        let bus = ProgressBus::new(0); // immediate timeout forces a keepalive first
        let rx = bus.subscribe();

        let bus2 = bus.clone();
        let emitter = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            bus2.emit(ProgressEvent::new(Phase::Complete, EventStatus::Completed, "done"));
        });

        let mut lines = Vec::new();
        bus.drain_with_keepalives(rx, |line| lines.push(line)).await;
        emitter.await.unwrap();

        assert!(lines.iter().any(|l| matches!(l, StreamLine::Keepalive)));
        assert!(matches!(lines.last(), Some(StreamLine::Event(e)) if e.phase == Phase::Complete));
    }
}
