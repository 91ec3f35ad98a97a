// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Process-wide registry of user callbacks, one slot per [`HandlerKind`].
//!
//! Registration overwrites prior entries for the same kind; the callback
//! itself dispatches on the [`MessageContext`] it receives. Two invocation
//! modes: synchronous with an explicit deadline (used only when the caller
//! needs the return value), and detached on a supervised background task
//! that logs and swallows failures.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::Value;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::model::{HandlerKind, MessageContext};

/// User callback: `async (message, context) -> Option<reply>`. For
/// `conversation` handlers a non-null return is auto-persisted as the reply;
/// for every other kind the return value is ignored.
pub type Handler =
    Arc<dyn Fn(Value, MessageContext) -> BoxFuture<'static, anyhow::Result<Option<Value>>> + Send + Sync>;

/// Internal invocation failure; call sites map this onto the public
/// taxonomy (or swallow it, for detached dispatch).
#[derive(Debug)]
pub(crate) enum InvokeError {
    Missing(HandlerKind),
    Deadline(HandlerKind),
    Failed(anyhow::Error),
}

pub struct HandlerRegistry {
    slots: RwLock<HashMap<HandlerKind, Handler>>,
    /// Deadline applied to detached invocations.
    deadline: Duration,
    tracker: TaskTracker,
}

impl HandlerRegistry {
    pub fn new(deadline: Duration) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            deadline,
            tracker: TaskTracker::new(),
        }
    }

    /// Register the callback for a kind, replacing any prior entry.
    pub fn register<F, Fut>(&self, kind: HandlerKind, handler: F)
    where
        F: Fn(Value, MessageContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Option<Value>>> + Send + 'static,
    {
        let wrapped: Handler = Arc::new(move |msg, ctx| Box::pin(handler(msg, ctx)));
        if self.slots.write().insert(kind, wrapped).is_some() {
            debug!(kind = kind.as_str(), "handler replaced");
        }
    }

    pub fn has(&self, kind: HandlerKind) -> bool {
        self.slots.read().contains_key(&kind)
    }

    fn get(&self, kind: HandlerKind) -> Option<Handler> {
        self.slots.read().get(&kind).cloned()
    }

    /// Run the callback and wait for its return value, bounded by `deadline`.
    pub(crate) async fn invoke_sync(
        &self,
        kind: HandlerKind,
        message: Value,
        context: MessageContext,
        deadline: Duration,
    ) -> Result<Option<Value>, InvokeError> {
        let handler = self.get(kind).ok_or(InvokeError::Missing(kind))?;
        match tokio::time::timeout(deadline, handler(message, context)).await {
            Err(_) => Err(InvokeError::Deadline(kind)),
            Ok(Err(err)) => Err(InvokeError::Failed(err)),
            Ok(Ok(value)) => Ok(value),
        }
    }

    /// Fire-and-forget: run the callback on a tracked background task under
    /// the configured deadline. Failures and timeouts are logged, never
    /// propagated. A missing handler is a silent no-op.
    pub(crate) fn invoke_detached(
        &self,
        kind: HandlerKind,
        message: Value,
        context: MessageContext,
    ) {
        let Some(handler) = self.get(kind) else {
            debug!(kind = kind.as_str(), "no handler registered for detached dispatch");
            return;
        };
        let deadline = self.deadline;
        self.tracker.spawn(async move {
            let message_id = context.message_id;
            match tokio::time::timeout(deadline, handler(message, context)).await {
                Err(_) => warn!(
                    kind = kind.as_str(),
                    %message_id,
                    "detached handler missed its deadline"
                ),
                Ok(Err(err)) => warn!(
                    kind = kind.as_str(),
                    %message_id,
                    error = %err,
                    "detached handler failed"
                ),
                Ok(Ok(_)) => {}
            }
        });
    }

    /// Await all outstanding detached invocations.
    pub(crate) async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("registered", &self.slots.read().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[path = "handler_tests.rs"]
mod tests;
