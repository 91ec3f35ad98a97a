// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Meeting lifecycle and turn-based speaking.
//!
//! State machine per meeting: `CREATED --start(host)--> ACTIVE
//! --end(host)--> ENDED`. Every mutation of an active meeting (start,
//! speak, leave, end, timeout advance) runs under the per-meeting advisory
//! lock and re-reads state after acquiring it — a speak can race a turn
//! advance, so pre-lock reads are only good for early rejection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::Notify;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::events::{EventBus, MeetingEventData};
use crate::handler::HandlerRegistry;
use crate::lock::LockGuard;
use crate::model::{
    clean_external_id, Agent, HandlerKind, Meeting, MeetingEventRecord, MeetingParticipant,
    MeetingStatus, Message, MessageContext, MessageType, ParticipantStatus,
};
use crate::store::{NewMessage, Store};
use crate::turn_timer::TurnTimeouts;

/// Hard cap on meeting size.
const MAX_PARTICIPANTS: usize = 50;

/// Upper bound on configurable turn durations.
const MAX_TURN_DURATION: Duration = Duration::from_secs(3600);

/// Round-robin advancement: the ATTENDING participant with the smallest
/// `join_order` strictly greater than the current speaker's, wrapping to
/// the minimum. `attending` must be sorted by join order.
pub(crate) fn next_speaker(
    attending: &[MeetingParticipant],
    current: Uuid,
) -> Option<&MeetingParticipant> {
    if attending.is_empty() {
        return None;
    }
    match attending.iter().position(|p| p.agent_id == current) {
        Some(index) => attending.get((index + 1) % attending.len()),
        // Current speaker no longer attending (left mid-turn); wrap to the
        // front of the order.
        None => attending.first(),
    }
}

/// Per-meeting wake signal for callers parked on `speak_when_ready`.
/// Notified on every turn change and on meeting end.
pub(crate) struct TurnBoard {
    notifies: Mutex<HashMap<Uuid, Arc<Notify>>>,
}

impl TurnBoard {
    pub fn new() -> Self {
        Self {
            notifies: Mutex::new(HashMap::new()),
        }
    }

    pub fn handle(&self, meeting_id: Uuid) -> Arc<Notify> {
        Arc::clone(
            self.notifies
                .lock()
                .entry(meeting_id)
                .or_insert_with(|| Arc::new(Notify::new())),
        )
    }

    pub fn wake(&self, meeting_id: Uuid) {
        if let Some(notify) = self.notifies.lock().get(&meeting_id) {
            notify.notify_waiters();
        }
    }

    /// Final wake plus removal, once a meeting can no longer change turns.
    pub fn retire(&self, meeting_id: Uuid) {
        if let Some(notify) = self.notifies.lock().remove(&meeting_id) {
            notify.notify_waiters();
        }
    }

    /// Wake everything. Part of shutdown.
    pub fn drain(&self) {
        for (_, notify) in self.notifies.lock().drain() {
            notify.notify_waiters();
        }
    }
}

/// Persist the audit row for a lifecycle event, then fan it out to
/// subscribers. Called inside the critical section that made the change.
/// Only the started/turn/message/timeout/ended grammar lands in the audit
/// table; attendance changes and supervisor errors are bus-only.
pub(crate) async fn publish(
    store: &Store,
    bus: &EventBus,
    meeting_id: Uuid,
    data: MeetingEventData,
) -> Result<()> {
    let payload = serde_json::to_value(&data)
        .map_err(|err| Error::Validation(format!("unserializable event payload: {err}")))?;
    store
        .insert_meeting_event(
            meeting_id,
            data.event_type().as_str(),
            data.subject_agent(),
            payload,
        )
        .await?;
    bus.emit(meeting_id, data);
    Ok(())
}

/// Outcome of a `speak_when_ready` call.
#[derive(Debug)]
pub struct SpokenTurn {
    pub message_id: Uuid,
    /// Meeting messages persisted while the caller was parked, in
    /// chronological order.
    pub heard: Vec<Message>,
}

pub struct MeetingManager {
    store: Store,
    registry: Arc<HandlerRegistry>,
    bus: Arc<EventBus>,
    board: Arc<TurnBoard>,
    timeouts: Arc<TurnTimeouts>,
}

impl MeetingManager {
    pub(crate) fn new(
        store: Store,
        registry: Arc<HandlerRegistry>,
        bus: Arc<EventBus>,
        board: Arc<TurnBoard>,
        timeouts: Arc<TurnTimeouts>,
    ) -> Self {
        Self {
            store,
            registry,
            bus,
            board,
            timeouts,
        }
    }

    async fn agent(&self, external_id: &str) -> Result<Agent> {
        self.store
            .agent_by_external_id(external_id)
            .await?
            .ok_or_else(|| Error::AgentNotFound(external_id.to_owned()))
    }

    async fn meeting(&self, meeting_id: Uuid) -> Result<Meeting> {
        self.store
            .meeting_by_id(meeting_id)
            .await?
            .ok_or(Error::MeetingNotFound(meeting_id))
    }

    /// Create a meeting in CREATED state with its invited participants.
    pub async fn create_meeting(
        &self,
        host_external_id: &str,
        participant_external_ids: &[&str],
        turn_duration: Option<Duration>,
    ) -> Result<Uuid> {
        let host_ext = clean_external_id(host_external_id, "host external id")?;
        if participant_external_ids.is_empty() {
            return Err(Error::Validation("participants cannot be empty".to_owned()));
        }
        if participant_external_ids.len() > MAX_PARTICIPANTS {
            return Err(Error::Validation(format!(
                "participants cannot exceed {MAX_PARTICIPANTS}"
            )));
        }
        if let Some(duration) = turn_duration {
            if duration.is_zero() || duration > MAX_TURN_DURATION {
                return Err(Error::Validation(format!(
                    "turn duration must be in (0, {}] seconds",
                    MAX_TURN_DURATION.as_secs()
                )));
            }
        }
        let mut cleaned: Vec<String> = Vec::with_capacity(participant_external_ids.len());
        for raw in participant_external_ids {
            let ext = clean_external_id(raw, "participant external id")?;
            if ext == host_ext {
                return Err(Error::Validation(
                    "host cannot be a participant".to_owned(),
                ));
            }
            if cleaned.contains(&ext) {
                return Err(Error::Validation(format!("duplicate participant: {ext}")));
            }
            cleaned.push(ext);
        }

        let host = self.agent(&host_ext).await?;
        let mut participants = Vec::with_capacity(cleaned.len());
        for ext in &cleaned {
            participants.push(self.agent(ext).await?);
        }

        let meeting_id = self
            .store
            .insert_meeting(host.id, turn_duration.map(|d| d.as_secs_f64()))
            .await?;
        for (order, participant) in participants.iter().enumerate() {
            #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
            self.store
                .insert_participant(meeting_id, participant.id, order as i32)
                .await?;
        }

        info!(%meeting_id, host = %host_ext, participants = participants.len(),
              "meeting created");
        Ok(meeting_id)
    }

    /// Mark an invited participant as attending. Idempotent for agents that
    /// already attend.
    pub async fn attend_meeting(&self, agent_external_id: &str, meeting_id: Uuid) -> Result<()> {
        let agent_ext = clean_external_id(agent_external_id, "agent external id")?;
        let agent = self.agent(&agent_ext).await?;
        let meeting = self.meeting(meeting_id).await?;
        if meeting.status == MeetingStatus::Ended {
            return Err(Error::MeetingState(format!(
                "meeting {meeting_id} has ended"
            )));
        }
        let participant = self
            .store
            .participant(meeting_id, agent.id)
            .await?
            .ok_or_else(|| {
                Error::MeetingState(format!(
                    "{agent_ext} is not invited to meeting {meeting_id}"
                ))
            })?;
        match participant.status {
            ParticipantStatus::Attending => return Ok(()),
            ParticipantStatus::Invited => {}
            other => {
                return Err(Error::MeetingState(format!(
                    "{agent_ext} cannot attend from status {other}"
                )));
            }
        }
        self.store
            .set_participant_status(participant.id, ParticipantStatus::Attending)
            .await?;
        // Bus-only: the audit rows form the started..ended grammar, and
        // attendance precedes the start.
        self.bus.emit(
            meeting_id,
            MeetingEventData::ParticipantJoined { agent_id: agent.id },
        );
        info!(%meeting_id, agent = %agent_ext, "participant attending");
        Ok(())
    }

    /// Start the meeting (host only). Requires every participant to be
    /// attending; picks the lowest join order as first speaker and arms its
    /// turn timer.
    pub async fn start_meeting(&self, host_external_id: &str, meeting_id: Uuid) -> Result<()> {
        let host_ext = clean_external_id(host_external_id, "host external id")?;
        let host = self.agent(&host_ext).await?;

        let lock = LockGuard::acquire(self.store.pool(), meeting_id).await?;
        let outcome = self.start_locked(&host, &host_ext, meeting_id).await;
        lock.release().await?;
        outcome
    }

    async fn start_locked(&self, host: &Agent, host_ext: &str, meeting_id: Uuid) -> Result<()> {
        // Mandatory re-read: state may have changed before the lock landed.
        let meeting = self.meeting(meeting_id).await?;
        if meeting.host_id != host.id {
            return Err(Error::MeetingPermissionDenied(format!(
                "{host_ext} is not the host of meeting {meeting_id}"
            )));
        }
        if meeting.status != MeetingStatus::Created {
            return Err(Error::MeetingState(format!(
                "meeting {meeting_id} cannot start from status {}",
                meeting.status
            )));
        }
        let participants = self.store.participants(meeting_id).await?;
        if participants.is_empty() {
            return Err(Error::MeetingState(format!(
                "meeting {meeting_id} has no participants"
            )));
        }
        let absent = participants
            .iter()
            .filter(|p| p.status != ParticipantStatus::Attending)
            .count();
        if absent > 0 {
            return Err(Error::MeetingState(format!(
                "meeting {meeting_id} cannot start: {absent} participants not attending"
            )));
        }

        self.store.start_meeting(meeting_id).await?;
        // join_order ascending, so the first row is the first speaker.
        let first = &participants[0];
        self.store
            .set_current_speaker(meeting_id, Some(first.agent_id))
            .await?;
        TurnTimeouts::arm(
            &self.timeouts,
            meeting_id,
            first.agent_id,
            meeting.turn_duration(),
        );
        publish(
            &self.store,
            &self.bus,
            meeting_id,
            MeetingEventData::MeetingStarted {
                host_id: host.id,
                participant_ids: participants.iter().map(|p| p.agent_id).collect(),
            },
        )
        .await?;
        self.board.wake(meeting_id);
        info!(%meeting_id, first_speaker = %first.agent_id, "meeting started");
        Ok(())
    }

    /// Post a message as the current speaker and pass the turn. Fails with
    /// [`Error::NotYourTurn`] when the caller does not hold the turn.
    pub async fn speak(
        &self,
        agent_external_id: &str,
        meeting_id: Uuid,
        message: Value,
        metadata: Option<Value>,
    ) -> Result<Uuid> {
        let agent_ext = clean_external_id(agent_external_id, "agent external id")?;
        let agent = self.agent(&agent_ext).await?;
        self.speak_locked(&agent, meeting_id, message, metadata)
            .await
    }

    /// The speak critical section: lock, re-read, validate, persist,
    /// advance.
    async fn speak_locked(
        &self,
        agent: &Agent,
        meeting_id: Uuid,
        message: Value,
        metadata: Option<Value>,
    ) -> Result<Uuid> {
        let lock = LockGuard::acquire(self.store.pool(), meeting_id).await?;
        let outcome = self
            .speak_under_lock(agent, meeting_id, message, metadata)
            .await;
        lock.release().await?;
        outcome
    }

    async fn speak_under_lock(
        &self,
        agent: &Agent,
        meeting_id: Uuid,
        message: Value,
        metadata: Option<Value>,
    ) -> Result<Uuid> {
        let meeting = self.meeting(meeting_id).await?;
        if meeting.status != MeetingStatus::Active {
            return Err(Error::MeetingNotActive(meeting_id));
        }
        let participant = self.store.participant(meeting_id, agent.id).await?;
        if !participant.is_some_and(|p| p.status == ParticipantStatus::Attending) {
            return Err(Error::MeetingState(format!(
                "{} is not an attending participant of meeting {meeting_id}",
                agent.external_id
            )));
        }
        if meeting.current_speaker_id != Some(agent.id) {
            return Err(Error::NotYourTurn(format!(
                "{} does not hold the turn in meeting {meeting_id}",
                agent.external_id
            )));
        }

        let message_id = self
            .store
            .insert_message(NewMessage {
                sender_id: Some(agent.id),
                recipient_id: None,
                session_id: None,
                meeting_id: Some(meeting_id),
                message_type: MessageType::UserDefined,
                content: crate::conversation::wrap_content(message.clone()),
                metadata: metadata.clone().unwrap_or_else(|| json!({})),
            })
            .await?;

        let participants = self.store.participants(meeting_id).await?;
        let attending: Vec<MeetingParticipant> = participants
            .into_iter()
            .filter(|p| p.status == ParticipantStatus::Attending)
            .collect();
        let next = next_speaker(&attending, agent.id)
            .map(|p| p.agent_id)
            .ok_or_else(|| {
                Error::MeetingState(format!(
                    "meeting {meeting_id} has no attending participants"
                ))
            })?;

        self.store
            .set_current_speaker(meeting_id, Some(next))
            .await?;
        TurnTimeouts::arm(&self.timeouts, meeting_id, next, meeting.turn_duration());

        publish(
            &self.store,
            &self.bus,
            meeting_id,
            MeetingEventData::TurnChanged {
                previous_speaker_id: Some(agent.id),
                current_speaker_id: Some(next),
            },
        )
        .await?;
        publish(
            &self.store,
            &self.bus,
            meeting_id,
            MeetingEventData::MessagePosted {
                message_id,
                sender_id: agent.id,
            },
        )
        .await?;
        self.board.wake(meeting_id);

        // Hand the floor to the next speaker's handler, if user code wired
        // one up.
        if self.registry.has(HandlerKind::Meeting) {
            if let Some(next_agent) = self.store.agent_by_id(next).await? {
                let organization_id = self
                    .store
                    .organization_of_agent(agent.id)
                    .await?
                    .map(|org| org.external_id)
                    .unwrap_or_else(|| "unknown".to_owned());
                let context = MessageContext {
                    sender_id: agent.external_id.clone(),
                    receiver_id: next_agent.external_id,
                    organization_id,
                    handler_kind: HandlerKind::Meeting,
                    message_id,
                    session_id: None,
                    meeting_id: Some(meeting_id),
                    metadata: metadata.unwrap_or_else(|| json!({})),
                };
                self.registry
                    .invoke_detached(HandlerKind::Meeting, message, context);
            }
        }

        info!(%meeting_id, speaker = %agent.external_id, next_speaker = %next, %message_id,
              "turn advanced");
        Ok(message_id)
    }

    /// Speak, parking until the caller holds the turn. Returns the posted
    /// message id plus everything said in the meeting while parked.
    ///
    /// The park releases when the meeting leaves ACTIVE
    /// ([`Error::MeetingNotActive`]) or the caller's task is cancelled.
    pub async fn speak_when_ready(
        &self,
        agent_external_id: &str,
        meeting_id: Uuid,
        message: Value,
        metadata: Option<Value>,
    ) -> Result<SpokenTurn> {
        let agent_ext = clean_external_id(agent_external_id, "agent external id")?;
        let agent = self.agent(&agent_ext).await?;
        let membership = self.store.participant(meeting_id, agent.id).await?;
        if !membership.is_some_and(|p| p.status != ParticipantStatus::Left) {
            return Err(Error::MeetingState(format!(
                "{agent_ext} is not a participant of meeting {meeting_id}"
            )));
        }
        let parked_at = Utc::now();

        loop {
            let notify = self.board.handle(meeting_id);
            let notified = notify.notified();
            tokio::pin!(notified);
            // Register interest before reading state, so a turn change
            // between the read and the await still wakes us.
            notified.as_mut().enable();

            let meeting = self.meeting(meeting_id).await?;
            match meeting.status {
                MeetingStatus::Ended => {
                    // The loop's handle() call above may have repopulated
                    // the board for this ended meeting; drop it again.
                    self.board.retire(meeting_id);
                    return Err(Error::MeetingNotActive(meeting_id));
                }
                MeetingStatus::Created | MeetingStatus::Ready => {
                    // Not yet started; park until the start wakes the board.
                }
                MeetingStatus::Active if meeting.current_speaker_id == Some(agent.id) => {
                    match self
                        .speak_locked(&agent, meeting_id, message.clone(), metadata.clone())
                        .await
                    {
                        Ok(message_id) => {
                            let heard = self
                                .store
                                .meeting_messages_since(meeting_id, parked_at, Some(message_id))
                                .await?;
                            return Ok(SpokenTurn { message_id, heard });
                        }
                        // Lost a race with a timeout advance between the
                        // read and the lock; park again.
                        Err(Error::NotYourTurn(_) | Error::LockUnavailable(_)) => {}
                        Err(err) => return Err(err),
                    }
                }
                MeetingStatus::Active => {}
            }

            notified.await;
        }
    }

    /// Leave a meeting. The host cannot leave. A leaver holding the turn
    /// passes it to the first remaining attending participant.
    pub async fn leave_meeting(&self, agent_external_id: &str, meeting_id: Uuid) -> Result<()> {
        let agent_ext = clean_external_id(agent_external_id, "agent external id")?;
        let agent = self.agent(&agent_ext).await?;

        // Early rejections outside the lock; all decisions re-made under it.
        let meeting = self.meeting(meeting_id).await?;
        if meeting.status == MeetingStatus::Ended {
            return Err(Error::MeetingState(format!(
                "meeting {meeting_id} has ended"
            )));
        }
        if meeting.host_id == agent.id {
            return Err(Error::MeetingPermissionDenied(format!(
                "host {agent_ext} cannot leave meeting {meeting_id}"
            )));
        }

        let lock = LockGuard::acquire(self.store.pool(), meeting_id).await?;
        let outcome = self.leave_under_lock(&agent, meeting_id).await;
        lock.release().await?;
        outcome
    }

    async fn leave_under_lock(&self, agent: &Agent, meeting_id: Uuid) -> Result<()> {
        let meeting = self.meeting(meeting_id).await?;
        if meeting.status == MeetingStatus::Ended {
            return Err(Error::MeetingState(format!(
                "meeting {meeting_id} has ended"
            )));
        }
        let participant = self
            .store
            .participant(meeting_id, agent.id)
            .await?
            .ok_or_else(|| {
                Error::MeetingState(format!(
                    "{} is not a participant of meeting {meeting_id}",
                    agent.external_id
                ))
            })?;
        if participant.status == ParticipantStatus::Left {
            return Ok(());
        }

        let held_turn = meeting.status == MeetingStatus::Active
            && meeting.current_speaker_id == Some(agent.id);

        self.store
            .set_participant_status(participant.id, ParticipantStatus::Left)
            .await?;
        self.bus.emit(
            meeting_id,
            MeetingEventData::ParticipantLeft { agent_id: agent.id },
        );

        if held_turn {
            self.timeouts.cancel(meeting_id);
            let participants = self.store.participants(meeting_id).await?;
            let remaining: Vec<&MeetingParticipant> = participants
                .iter()
                .filter(|p| p.status == ParticipantStatus::Attending)
                .collect();
            let next = remaining.first().map(|p| p.agent_id);
            self.store.set_current_speaker(meeting_id, next).await?;
            if let Some(next_id) = next {
                TurnTimeouts::arm(&self.timeouts, meeting_id, next_id, meeting.turn_duration());
            } else {
                warn!(%meeting_id, "speaker left with no attending participants remaining");
            }
            publish(
                &self.store,
                &self.bus,
                meeting_id,
                MeetingEventData::TurnChanged {
                    previous_speaker_id: Some(agent.id),
                    current_speaker_id: next,
                },
            )
            .await?;
            self.board.wake(meeting_id);
        }

        info!(%meeting_id, agent = %agent.external_id, held_turn, "participant left");
        Ok(())
    }

    /// End the meeting (host only). The second call fails with
    /// [`Error::MeetingState`] and changes nothing.
    pub async fn end_meeting(&self, host_external_id: &str, meeting_id: Uuid) -> Result<()> {
        let host_ext = clean_external_id(host_external_id, "host external id")?;
        let host = self.agent(&host_ext).await?;

        let lock = LockGuard::acquire(self.store.pool(), meeting_id).await?;
        let outcome = self.end_under_lock(&host, &host_ext, meeting_id).await;
        lock.release().await?;
        outcome
    }

    async fn end_under_lock(&self, host: &Agent, host_ext: &str, meeting_id: Uuid) -> Result<()> {
        let meeting = self.meeting(meeting_id).await?;
        if meeting.host_id != host.id {
            return Err(Error::MeetingPermissionDenied(format!(
                "{host_ext} is not the host of meeting {meeting_id}"
            )));
        }
        if meeting.status == MeetingStatus::Ended {
            return Err(Error::MeetingState(format!(
                "meeting {meeting_id} is already ended"
            )));
        }

        self.timeouts.cancel(meeting_id);
        self.store.end_meeting(meeting_id).await?;
        self.store
            .insert_message(NewMessage {
                sender_id: Some(host.id),
                recipient_id: None,
                session_id: None,
                meeting_id: Some(meeting_id),
                message_type: MessageType::Ending,
                content: json!({
                    "type": "meeting_ended",
                    "host": host.id,
                }),
                metadata: json!({}),
            })
            .await?;
        publish(
            &self.store,
            &self.bus,
            meeting_id,
            MeetingEventData::MeetingEnded { host_id: host.id },
        )
        .await?;
        // Parked speakers observe ENDED on their next state read.
        self.board.retire(meeting_id);

        info!(%meeting_id, host = %host_ext, "meeting ended");
        Ok(())
    }

    /// Point-in-time snapshot of a meeting and its participants.
    pub async fn meeting_status(
        &self,
        meeting_id: Uuid,
    ) -> Result<(Meeting, Vec<MeetingParticipant>)> {
        let meeting = self.meeting(meeting_id).await?;
        let participants = self.store.participants(meeting_id).await?;
        Ok((meeting, participants))
    }

    /// Full replay of a meeting's messages in insertion order.
    pub async fn meeting_history(&self, meeting_id: Uuid) -> Result<Vec<Message>> {
        self.meeting(meeting_id).await?;
        self.store.messages_for_meeting(meeting_id).await
    }

    /// One filtered page of a meeting transcript (date range, message
    /// types, row limit).
    pub async fn meeting_history_filtered(
        &self,
        meeting_id: Uuid,
        filter: &crate::store::MessageFilter,
    ) -> Result<Vec<Message>> {
        self.meeting(meeting_id).await?;
        self.store
            .messages_for_meeting_filtered(meeting_id, filter)
            .await
    }

    /// The append-only audit trail for a meeting.
    pub async fn meeting_events(&self, meeting_id: Uuid) -> Result<Vec<MeetingEventRecord>> {
        self.meeting(meeting_id).await?;
        self.store.events_for_meeting(meeting_id).await
    }
}

#[cfg(test)]
#[path = "meeting_tests.rs"]
mod tests;
