// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Turn-timeout supervisor: one background timer per active meeting.
//!
//! The only producer of unsolicited state transitions. A timer that fires
//! after its turn already changed exits silently — cancellation races are
//! expected, the re-validation under the meeting lock is what matters.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::events::{EventBus, MeetingEventData};
use crate::lock::LockGuard;
use crate::meeting::{next_speaker, publish, TurnBoard};
use crate::model::{MeetingStatus, MessageType, ParticipantStatus};
use crate::store::{NewMessage, Store};

pub struct TurnTimeouts {
    store: Store,
    bus: Arc<EventBus>,
    board: Arc<TurnBoard>,
    timers: Mutex<HashMap<Uuid, JoinHandle<()>>>,
}

impl TurnTimeouts {
    pub(crate) fn new(store: Store, bus: Arc<EventBus>, board: Arc<TurnBoard>) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            board,
            timers: Mutex::new(HashMap::new()),
        })
    }

    /// Arm the timer for a speaker's turn, replacing any prior timer for
    /// this meeting. A missing or non-positive duration disables the timer.
    pub(crate) fn arm(
        this: &Arc<Self>,
        meeting_id: Uuid,
        speaker_id: Uuid,
        duration: Option<Duration>,
    ) {
        this.cancel(meeting_id);
        let Some(duration) = duration.filter(|d| !d.is_zero()) else {
            return;
        };
        let timer = Arc::clone(this);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            Self::on_fire(&timer, meeting_id, speaker_id).await;
        });
        if let Some(stale) = this.timers.lock().insert(meeting_id, handle) {
            stale.abort();
        }
        debug!(%meeting_id, %speaker_id, secs = duration.as_secs_f64(), "turn timer armed");
    }

    /// Cancel the timer for a meeting, if one is running.
    pub(crate) fn cancel(&self, meeting_id: Uuid) {
        if let Some(handle) = self.timers.lock().remove(&meeting_id) {
            handle.abort();
            debug!(%meeting_id, "turn timer cancelled");
        }
    }

    async fn on_fire(this: &Arc<Self>, meeting_id: Uuid, expected_speaker: Uuid) {
        if let Err(err) = Self::advance_expired(this, meeting_id, expected_speaker).await {
            // Supervisor errors never propagate; log and notify subscribers.
            warn!(%meeting_id, %expected_speaker, error = %err, "turn timeout handling failed");
            this.bus.emit(
                meeting_id,
                MeetingEventData::ErrorOccurred {
                    error_kind: err.code().to_owned(),
                    message: err.to_string(),
                    affected_agent_id: Some(expected_speaker),
                },
            );
        }
    }

    async fn advance_expired(
        this: &Arc<Self>,
        meeting_id: Uuid,
        expected_speaker: Uuid,
    ) -> Result<()> {
        // Cheap pre-checks before taking the lock.
        let Some(meeting) = this.store.meeting_by_id(meeting_id).await? else {
            return Ok(());
        };
        if meeting.status != MeetingStatus::Active
            || meeting.current_speaker_id != Some(expected_speaker)
        {
            debug!(%meeting_id, "turn timer fired stale, ignoring");
            return Ok(());
        }

        let lock = match LockGuard::acquire(this.store.pool(), meeting_id).await {
            Ok(lock) => lock,
            Err(Error::LockUnavailable(_)) => {
                // A user action holds the meeting; it will cancel or re-arm
                // this timer itself.
                debug!(%meeting_id, "meeting busy at timer fire, ignoring");
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        let outcome = Self::advance_under_lock(this, meeting_id, expected_speaker).await;
        lock.release().await?;
        outcome
    }

    async fn advance_under_lock(
        this: &Arc<Self>,
        meeting_id: Uuid,
        expected_speaker: Uuid,
    ) -> Result<()> {
        let Some(meeting) = this.store.meeting_by_id(meeting_id).await? else {
            return Ok(());
        };
        if meeting.status != MeetingStatus::Active
            || meeting.current_speaker_id != Some(expected_speaker)
        {
            return Ok(());
        }

        let participants = this.store.participants(meeting_id).await?;
        let attending: Vec<_> = participants
            .into_iter()
            .filter(|p| p.status == ParticipantStatus::Attending)
            .collect();
        let next = next_speaker(&attending, expected_speaker).map(|p| p.agent_id);

        // Synthetic timeout message: the one message shape with no sender.
        this.store
            .insert_message(NewMessage {
                sender_id: None,
                recipient_id: None,
                session_id: None,
                meeting_id: Some(meeting_id),
                message_type: MessageType::Timeout,
                content: json!({
                    "type": "timeout",
                    "timed_out": expected_speaker,
                    "next": next,
                }),
                metadata: json!({}),
            })
            .await?;

        this.store.set_current_speaker(meeting_id, next).await?;

        publish(
            &this.store,
            &this.bus,
            meeting_id,
            MeetingEventData::TimeoutOccurred {
                timed_out_agent_id: expected_speaker,
                next_speaker_id: next,
            },
        )
        .await?;
        publish(
            &this.store,
            &this.bus,
            meeting_id,
            MeetingEventData::TurnChanged {
                previous_speaker_id: Some(expected_speaker),
                current_speaker_id: next,
            },
        )
        .await?;
        this.board.wake(meeting_id);

        if let Some(next_id) = next {
            Self::arm(this, meeting_id, next_id, meeting.turn_duration());
        } else {
            warn!(%meeting_id, "turn timed out with no attending participants remaining");
        }
        debug!(%meeting_id, timed_out = %expected_speaker, next = ?next, "turn advanced on timeout");
        Ok(())
    }

    /// Cancel every timer and wait for in-flight fires to settle.
    pub(crate) async fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut timers = self.timers.lock();
            timers.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl std::fmt::Debug for TurnTimeouts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnTimeouts")
            .field("armed", &self.timers.lock().len())
            .finish_non_exhaustive()
    }
}
