// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! parley — coordination core for a multi-agent messaging service.
//!
//! Agents, grouped into organizations, exchange structured messages under
//! three patterns: one-way delivery, pairwise conversations (blocking
//! request/reply and queued sends), and multi-party meetings with
//! turn-based speaking. All durable state lives in PostgreSQL; cross-caller
//! coordination uses connection-scoped advisory locks plus an in-process
//! waiter/timer layer. Hosts wrap [`Parley`]; see the crate's `tests/specs`
//! for end-to-end flows.

pub mod client;
pub mod config;
pub mod conversation;
pub mod error;
pub mod events;
pub mod handler;
pub mod lock;
pub mod meeting;
pub mod model;
pub mod one_way;
pub mod store;
pub mod turn_timer;
pub(crate) mod waiter;

pub use client::Parley;
pub use config::Config;
pub use conversation::Conversation;
pub use error::{Error, Result};
pub use events::{EventBus, MeetingEvent, MeetingEventData, MeetingEventType};
pub use handler::HandlerRegistry;
pub use meeting::{MeetingManager, SpokenTurn};
pub use model::{
    Agent, HandlerKind, Meeting, MeetingEventRecord, MeetingParticipant, MeetingStatus, Message,
    MessageContext, MessageType, Organization, ParticipantStatus, Session, SessionOverview,
    SessionStatus,
};
pub use one_way::OneWayMessenger;
pub use store::{MessageFilter, MetadataMatch, MetadataQuery, Store};
