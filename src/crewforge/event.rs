//! Workflow event system.
//!
//! The event bus is the single source of live state: every observable thing
//! a workflow does — turn boundaries, agent messages, artifact writes,
//! warnings, status transitions — flows through [`EventBus::publish`] and
//! fans out to subscribers.  The HTTP streaming endpoint is one subscriber;
//! the blocking submission path is another.
//!
//! # Delivery semantics
//!
//! - Best-effort, in-order per workflow.
//! - Publication never blocks the turn loop.
//! - Each subscriber has a bounded buffer; a subscriber that falls behind
//!   receives one `warning` event (`code = "subscriber_lagged"`) and is then
//!   dropped.
//! - New subscribers may optionally replay recent history (bounded to the
//!   last 200 events per workflow).
//! - A subscription ends after it delivers a terminal `workflow_status`
//!   event.

use chrono::{DateTime, Utc};
use futures_util::stream::Stream;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::pin::Pin;
use std::sync::Mutex;
use tokio::sync::broadcast;

/// Bounded per-workflow replay history.
const HISTORY_LIMIT: usize = 200;

/// Everything observable about a running workflow.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// A turn is beginning: `to` is about to respond to a message from `from`.
    TurnStarted {
        workflow_id: String,
        turn_index: usize,
        from: String,
        to: String,
    },
    /// An agent (or the system seed) produced a message.
    AgentMessage {
        workflow_id: String,
        turn_index: usize,
        from: String,
        to: String,
        content: String,
        timestamp: DateTime<Utc>,
    },
    /// An artifact extracted from a turn was persisted.
    ArtifactWritten {
        workflow_id: String,
        turn_index: usize,
        relative_path: String,
        kind: String,
        bytes: u64,
    },
    /// A recoverable problem was handled locally.
    Warning {
        workflow_id: String,
        code: String,
        detail: String,
    },
    /// The workflow changed status.
    WorkflowStatus {
        workflow_id: String,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl WorkflowEvent {
    /// The event kind tag used for subscription filtering.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkflowEvent::TurnStarted { .. } => "turn_started",
            WorkflowEvent::AgentMessage { .. } => "agent_message",
            WorkflowEvent::ArtifactWritten { .. } => "artifact_written",
            WorkflowEvent::Warning { .. } => "warning",
            WorkflowEvent::WorkflowStatus { .. } => "workflow_status",
        }
    }

    /// The workflow this event belongs to.
    pub fn workflow_id(&self) -> &str {
        match self {
            WorkflowEvent::TurnStarted { workflow_id, .. }
            | WorkflowEvent::AgentMessage { workflow_id, .. }
            | WorkflowEvent::ArtifactWritten { workflow_id, .. }
            | WorkflowEvent::Warning { workflow_id, .. }
            | WorkflowEvent::WorkflowStatus { workflow_id, .. } => workflow_id,
        }
    }

    /// `true` for a `workflow_status` event carrying a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowEvent::WorkflowStatus { status, .. }
                if status == "completed" || status == "failed" || status == "cancelled"
        )
    }
}

/// Boxed stream of events for one subscriber.
pub type EventStream = Pin<Box<dyn Stream<Item = WorkflowEvent> + Send>>;

struct Channel {
    tx: broadcast::Sender<WorkflowEvent>,
    history: VecDeque<WorkflowEvent>,
}

/// In-process pub/sub for workflow events.
///
/// Channels are created lazily per workflow.  The internal mutex guards only
/// map access and history bookkeeping; `broadcast::Sender::send` itself never
/// blocks, so publication is safe from inside the turn loop.
pub struct EventBus {
    channels: Mutex<HashMap<String, Channel>>,
    subscriber_buffer: usize,
}

impl EventBus {
    /// Create a bus whose subscribers each buffer up to `subscriber_buffer`
    /// events before being dropped as laggards.
    pub fn new(subscriber_buffer: usize) -> Self {
        EventBus {
            channels: Mutex::new(HashMap::new()),
            subscriber_buffer: subscriber_buffer.max(1),
        }
    }

    /// Publish an event to every current subscriber of its workflow and
    /// record it in the replay history.
    pub fn publish(&self, event: WorkflowEvent) {
        let mut channels = self.channels.lock().expect("event bus lock poisoned");
        let buffer = self.subscriber_buffer;
        let channel = channels
            .entry(event.workflow_id().to_string())
            .or_insert_with(|| Channel {
                tx: broadcast::channel(buffer).0,
                history: VecDeque::new(),
            });
        if channel.history.len() == HISTORY_LIMIT {
            channel.history.pop_front();
        }
        channel.history.push_back(event.clone());
        // No receivers is fine; the history still records the event.
        let _ = channel.tx.send(event);
    }

    /// Subscribe to a workflow's events, optionally filtered by kind and
    /// optionally preceded by a replay of recent history.
    pub fn subscribe(
        &self,
        workflow_id: &str,
        kinds: Option<HashSet<String>>,
        replay: bool,
    ) -> EventStream {
        let (rx, backlog) = {
            let mut channels = self.channels.lock().expect("event bus lock poisoned");
            let buffer = self.subscriber_buffer;
            let channel = channels
                .entry(workflow_id.to_string())
                .or_insert_with(|| Channel {
                    tx: broadcast::channel(buffer).0,
                    history: VecDeque::new(),
                });
            let backlog: VecDeque<WorkflowEvent> = if replay {
                channel.history.iter().cloned().collect()
            } else {
                VecDeque::new()
            };
            (channel.tx.subscribe(), backlog)
        };

        let workflow_id = workflow_id.to_string();
        let state = SubscriberState {
            backlog,
            rx,
            kinds,
            workflow_id,
            done: false,
        };
        Box::pin(futures_util::stream::unfold(state, |mut state| async move {
            loop {
                if state.done && state.backlog.is_empty() {
                    return None;
                }
                if let Some(event) = state.backlog.pop_front() {
                    // A replayed terminal event ends the stream just like a
                    // live one would.
                    if event.is_terminal() {
                        state.done = true;
                        state.backlog.clear();
                    }
                    if state.passes_filter(&event) {
                        return Some((event, state));
                    }
                    if state.done {
                        return None;
                    }
                    continue;
                }
                match state.rx.recv().await {
                    Ok(event) => {
                        let terminal = event.is_terminal();
                        if terminal {
                            state.done = true;
                        }
                        if state.passes_filter(&event) {
                            return Some((event, state));
                        }
                        if terminal {
                            return None;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        // Slow subscriber: deliver one warning, then drop it.
                        state.done = true;
                        let warning = WorkflowEvent::Warning {
                            workflow_id: state.workflow_id.clone(),
                            code: "subscriber_lagged".to_string(),
                            detail: format!("dropped after missing {} events", missed),
                        };
                        if state.passes_filter(&warning) {
                            return Some((warning, state));
                        }
                        return None;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        }))
    }

    /// Drop a workflow's channel and replay history once its in-memory
    /// record expires.
    pub fn remove(&self, workflow_id: &str) {
        self.channels
            .lock()
            .expect("event bus lock poisoned")
            .remove(workflow_id);
    }
}

struct SubscriberState {
    backlog: VecDeque<WorkflowEvent>,
    rx: broadcast::Receiver<WorkflowEvent>,
    kinds: Option<HashSet<String>>,
    workflow_id: String,
    done: bool,
}

impl SubscriberState {
    fn passes_filter(&self, event: &WorkflowEvent) -> bool {
        match &self.kinds {
            Some(kinds) => kinds.contains(event.kind()),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn status_event(id: &str, status: &str) -> WorkflowEvent {
        WorkflowEvent::WorkflowStatus {
            workflow_id: id.to_string(),
            status: status.to_string(),
            reason: None,
        }
    }

    #[tokio::test]
    async fn delivers_events_in_order_and_ends_on_terminal() {
        let bus = EventBus::new(16);
        let mut stream = bus.subscribe("wf", None, false);

        bus.publish(WorkflowEvent::TurnStarted {
            workflow_id: "wf".to_string(),
            turn_index: 0,
            from: "system".to_string(),
            to: "a".to_string(),
        });
        bus.publish(status_event("wf", "running"));
        bus.publish(status_event("wf", "completed"));

        assert_eq!(stream.next().await.unwrap().kind(), "turn_started");
        assert_eq!(stream.next().await.unwrap().kind(), "workflow_status");
        assert!(stream.next().await.unwrap().is_terminal());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn replay_covers_events_before_subscription() {
        let bus = EventBus::new(16);
        bus.publish(status_event("wf", "running"));

        let mut stream = bus.subscribe("wf", None, true);
        bus.publish(status_event("wf", "completed"));

        let first = stream.next().await.unwrap();
        assert!(matches!(
            first,
            WorkflowEvent::WorkflowStatus { ref status, .. } if status == "running"
        ));
        assert!(stream.next().await.unwrap().is_terminal());
    }

    #[tokio::test]
    async fn filter_restricts_kinds() {
        let bus = EventBus::new(16);
        let kinds: HashSet<String> = vec!["warning".to_string()].into_iter().collect();
        let mut stream = bus.subscribe("wf", Some(kinds), false);

        bus.publish(status_event("wf", "running"));
        bus.publish(WorkflowEvent::Warning {
            workflow_id: "wf".to_string(),
            code: "transport_error".to_string(),
            detail: "boom".to_string(),
        });
        bus.publish(status_event("wf", "completed"));

        let only = stream.next().await.unwrap();
        assert_eq!(only.kind(), "warning");
        // Terminal status is filtered out but still ends the stream.
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn events_are_isolated_per_workflow() {
        let bus = EventBus::new(16);
        let mut stream = bus.subscribe("wf-a", None, false);

        bus.publish(status_event("wf-b", "running"));
        bus.publish(status_event("wf-a", "completed"));

        let event = stream.next().await.unwrap();
        assert_eq!(event.workflow_id(), "wf-a");
    }

    #[tokio::test]
    async fn lagging_subscriber_gets_warning_then_drops() {
        let bus = EventBus::new(2);
        let mut stream = bus.subscribe("wf", None, false);

        for _ in 0..10 {
            bus.publish(status_event("wf", "running"));
        }

        // The receiver lagged past its buffer: first poll surfaces the drop.
        let mut saw_lag_warning = false;
        while let Some(event) = stream.next().await {
            if let WorkflowEvent::Warning { ref code, .. } = event {
                if code == "subscriber_lagged" {
                    saw_lag_warning = true;
                    break;
                }
            }
        }
        assert!(saw_lag_warning);
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn events_serialize_with_type_tags() {
        let event = status_event("wf", "completed");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "workflow_status");
        assert_eq!(json["status"], "completed");
        assert!(json.get("reason").is_none());
    }
}
