// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Boundary error taxonomy.
//!
//! Four propagation groups: input errors (caller fixes its arguments),
//! state errors (operation rejected, nothing mutated), coordination errors
//! (transient; the coordinator never retries internally), and fatal
//! persistence errors. Background tasks never surface errors here; they log
//! with `session_id`/`meeting_id` correlation and continue.

use std::fmt;
use std::time::Duration;

use uuid::Uuid;

use crate::model::HandlerKind;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// No agent with the given external id.
    AgentNotFound(String),
    /// No organization with the given external id.
    OrganizationNotFound(String),
    /// Malformed caller input; surfaced before any state mutation.
    Validation(String),
    /// The session is not in a state that allows the operation.
    SessionState(String),
    /// The session or meeting lock is held by another caller.
    LockUnavailable(String),
    /// The operation requires a handler for this kind and none is registered.
    NoHandlerRegistered(HandlerKind),
    /// A synchronously awaited handler missed its deadline.
    HandlerTimeout(HandlerKind),
    /// A blocking wait elapsed without a counterpart message.
    Timeout(Duration),
    MeetingNotFound(Uuid),
    /// The meeting is not in a state that allows the operation.
    MeetingState(String),
    MeetingNotActive(Uuid),
    /// A speak attempt by an agent that does not hold the turn.
    NotYourTurn(String),
    /// A host-only command issued by a non-host, or a host trying to leave.
    MeetingPermissionDenied(String),
    /// The store is unusable; callers are expected to escalate.
    Persistence(sqlx::Error),
}

impl Error {
    /// Stable machine-readable code for transports and logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AgentNotFound(_) => "AGENT_NOT_FOUND",
            Self::OrganizationNotFound(_) => "ORGANIZATION_NOT_FOUND",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::SessionState(_) => "SESSION_STATE_ERROR",
            Self::LockUnavailable(_) => "LOCK_UNAVAILABLE",
            Self::NoHandlerRegistered(_) => "NO_HANDLER_REGISTERED",
            Self::HandlerTimeout(_) => "HANDLER_TIMEOUT",
            Self::Timeout(_) => "TIMEOUT",
            Self::MeetingNotFound(_) => "MEETING_NOT_FOUND",
            Self::MeetingState(_) => "MEETING_STATE_ERROR",
            Self::MeetingNotActive(_) => "MEETING_NOT_ACTIVE",
            Self::NotYourTurn(_) => "NOT_YOUR_TURN",
            Self::MeetingPermissionDenied(_) => "MEETING_PERMISSION_DENIED",
            Self::Persistence(_) => "PERSISTENCE_ERROR",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AgentNotFound(id) => write!(f, "agent not found: {id}"),
            Self::OrganizationNotFound(id) => write!(f, "organization not found: {id}"),
            Self::Validation(msg) => write!(f, "invalid input: {msg}"),
            Self::SessionState(msg) => write!(f, "invalid session state: {msg}"),
            Self::LockUnavailable(msg) => write!(f, "lock unavailable: {msg}"),
            Self::NoHandlerRegistered(kind) => {
                write!(f, "no {kind} handler registered")
            }
            Self::HandlerTimeout(kind) => {
                write!(f, "{kind} handler missed its deadline")
            }
            Self::Timeout(waited) => {
                write!(f, "no response within {:.1}s", waited.as_secs_f64())
            }
            Self::MeetingNotFound(id) => write!(f, "meeting not found: {id}"),
            Self::MeetingState(msg) => write!(f, "invalid meeting state: {msg}"),
            Self::MeetingNotActive(id) => write!(f, "meeting {id} is not active"),
            Self::NotYourTurn(msg) => write!(f, "not your turn: {msg}"),
            Self::MeetingPermissionDenied(msg) => write!(f, "permission denied: {msg}"),
            Self::Persistence(err) => write!(f, "persistence failure: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Persistence(err) => Some(err),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::Persistence(err)
    }
}

impl Error {
    /// True when the underlying store error is a unique-constraint violation.
    /// Used to turn duplicate registrations into [`Error::Validation`].
    pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
        match err {
            sqlx::Error::Database(db) => db.code().as_deref() == Some("23505"),
            _ => false,
        }
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
