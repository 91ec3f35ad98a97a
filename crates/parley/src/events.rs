// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Typed meeting lifecycle events fanned out to subscribers.
//!
//! Each subscriber runs on its own tracked task, so a slow or failing
//! subscriber can never block its peers or the producer. The bus does not
//! persist anything; the meeting manager writes the matching
//! `meeting_events` row in the same critical section before emitting.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_util::task::TaskTracker;
use tracing::warn;
use uuid::Uuid;

use crate::model::ParticipantStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MeetingEventType {
    MeetingStarted,
    MeetingEnded,
    TurnChanged,
    ParticipantJoined,
    ParticipantLeft,
    TimeoutOccurred,
    MessagePosted,
    ParticipantStatusChanged,
    ErrorOccurred,
}

impl MeetingEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MeetingStarted => "MEETING_STARTED",
            Self::MeetingEnded => "MEETING_ENDED",
            Self::TurnChanged => "TURN_CHANGED",
            Self::ParticipantJoined => "PARTICIPANT_JOINED",
            Self::ParticipantLeft => "PARTICIPANT_LEFT",
            Self::TimeoutOccurred => "TIMEOUT_OCCURRED",
            Self::MessagePosted => "MESSAGE_POSTED",
            Self::ParticipantStatusChanged => "PARTICIPANT_STATUS_CHANGED",
            Self::ErrorOccurred => "ERROR_OCCURRED",
        }
    }
}

impl std::fmt::Display for MeetingEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tagged-union payload so subscribers can pattern-match the event shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MeetingEventData {
    MeetingStarted {
        host_id: Uuid,
        participant_ids: Vec<Uuid>,
    },
    MeetingEnded {
        host_id: Uuid,
    },
    TurnChanged {
        previous_speaker_id: Option<Uuid>,
        current_speaker_id: Option<Uuid>,
    },
    ParticipantJoined {
        agent_id: Uuid,
    },
    ParticipantLeft {
        agent_id: Uuid,
    },
    TimeoutOccurred {
        timed_out_agent_id: Uuid,
        next_speaker_id: Option<Uuid>,
    },
    MessagePosted {
        message_id: Uuid,
        sender_id: Uuid,
    },
    ParticipantStatusChanged {
        agent_id: Uuid,
        previous_status: ParticipantStatus,
        current_status: ParticipantStatus,
    },
    ErrorOccurred {
        error_kind: String,
        message: String,
        affected_agent_id: Option<Uuid>,
    },
}

impl MeetingEventData {
    pub fn event_type(&self) -> MeetingEventType {
        match self {
            Self::MeetingStarted { .. } => MeetingEventType::MeetingStarted,
            Self::MeetingEnded { .. } => MeetingEventType::MeetingEnded,
            Self::TurnChanged { .. } => MeetingEventType::TurnChanged,
            Self::ParticipantJoined { .. } => MeetingEventType::ParticipantJoined,
            Self::ParticipantLeft { .. } => MeetingEventType::ParticipantLeft,
            Self::TimeoutOccurred { .. } => MeetingEventType::TimeoutOccurred,
            Self::MessagePosted { .. } => MeetingEventType::MessagePosted,
            Self::ParticipantStatusChanged { .. } => MeetingEventType::ParticipantStatusChanged,
            Self::ErrorOccurred { .. } => MeetingEventType::ErrorOccurred,
        }
    }

    /// The agent most directly involved, for the audit row's `agent_id`.
    pub(crate) fn subject_agent(&self) -> Option<Uuid> {
        match self {
            Self::MeetingStarted { host_id, .. } | Self::MeetingEnded { host_id } => Some(*host_id),
            Self::TurnChanged { current_speaker_id, .. } => *current_speaker_id,
            Self::ParticipantJoined { agent_id }
            | Self::ParticipantLeft { agent_id }
            | Self::ParticipantStatusChanged { agent_id, .. } => Some(*agent_id),
            Self::TimeoutOccurred { timed_out_agent_id, .. } => Some(*timed_out_agent_id),
            Self::MessagePosted { sender_id, .. } => Some(*sender_id),
            Self::ErrorOccurred { affected_agent_id, .. } => *affected_agent_id,
        }
    }
}

/// A typed event delivered to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeetingEvent {
    pub meeting_id: Uuid,
    pub event_type: MeetingEventType,
    pub data: MeetingEventData,
    pub timestamp: DateTime<Utc>,
}

/// Subscriber callback. Errors are logged and isolated to the failing
/// subscriber.
pub type Subscriber =
    Arc<dyn Fn(MeetingEvent) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

pub struct EventBus {
    subscribers: RwLock<HashMap<MeetingEventType, Vec<Subscriber>>>,
    tracker: TaskTracker,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            tracker: TaskTracker::new(),
        }
    }

    /// Register a subscriber for one event type.
    pub fn subscribe<F, Fut>(&self, event_type: MeetingEventType, subscriber: F)
    where
        F: Fn(MeetingEvent) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let wrapped: Subscriber = Arc::new(move |event| Box::pin(subscriber(event)));
        self.subscribers
            .write()
            .entry(event_type)
            .or_default()
            .push(wrapped);
    }

    /// Fan an event out to every subscriber of its type, concurrently.
    pub fn emit(&self, meeting_id: Uuid, data: MeetingEventData) {
        let event_type = data.event_type();
        let subs = self
            .subscribers
            .read()
            .get(&event_type)
            .cloned()
            .unwrap_or_default();
        if subs.is_empty() {
            return;
        }
        let event = MeetingEvent {
            meeting_id,
            event_type,
            data,
            timestamp: Utc::now(),
        };
        for sub in subs {
            let event = event.clone();
            self.tracker.spawn(async move {
                if let Err(err) = sub(event).await {
                    warn!(
                        %meeting_id,
                        event_type = event_type.as_str(),
                        error = %err,
                        "event subscriber failed"
                    );
                }
            });
        }
    }

    /// Await all in-flight subscriber invocations.
    pub(crate) async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[path = "events_tests.rs"]
mod tests;
