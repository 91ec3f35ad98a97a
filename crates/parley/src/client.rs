// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The in-process coordinator handle that external hosts (CLIs, network
//! shells) wrap. Owns the pool, the handler registry, the event bus, the
//! waiter table, and the turn-timeout supervisor.

use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::conversation::Conversation;
use crate::error::{Error, Result};
use crate::events::{EventBus, MeetingEvent, MeetingEventType};
use crate::handler::HandlerRegistry;
use crate::meeting::{MeetingManager, TurnBoard};
use crate::model::{clean_external_id, Agent, HandlerKind, MessageContext, Organization};
use crate::one_way::OneWayMessenger;
use crate::store::Store;
use crate::turn_timer::TurnTimeouts;
use crate::waiter::WaiterTable;

pub struct Parley {
    config: Config,
    store: Store,
    registry: Arc<HandlerRegistry>,
    bus: Arc<EventBus>,
    waiters: Arc<WaiterTable>,
    board: Arc<TurnBoard>,
    timeouts: Arc<TurnTimeouts>,
    one_way: OneWayMessenger,
    conversation: Conversation,
    meeting: MeetingManager,
    shutdown: CancellationToken,
}

impl Parley {
    /// Connect to the store, apply the idempotent bootstrap schema, and
    /// wire up the coordinator.
    pub async fn connect(config: Config) -> Result<Self> {
        config.validate()?;
        let store = Store::connect(&config).await?;
        store.bootstrap().await?;
        Ok(Self::assemble(config, store))
    }

    /// Wire the coordinator over an already-connected store (tests, hosts
    /// managing their own pool). Skips the schema bootstrap.
    pub fn with_store(config: Config, store: Store) -> Result<Self> {
        config.validate()?;
        Ok(Self::assemble(config, store))
    }

    fn assemble(config: Config, store: Store) -> Self {
        let registry = Arc::new(HandlerRegistry::new(config.handler_deadline()));
        let bus = Arc::new(EventBus::new());
        let waiters = Arc::new(WaiterTable::new());
        let board = Arc::new(TurnBoard::new());
        let timeouts = TurnTimeouts::new(store.clone(), Arc::clone(&bus), Arc::clone(&board));
        let one_way = OneWayMessenger::new(store.clone(), Arc::clone(&registry));
        let conversation = Conversation::new(
            store.clone(),
            Arc::clone(&registry),
            Arc::clone(&waiters),
        );
        let meeting = MeetingManager::new(
            store.clone(),
            Arc::clone(&registry),
            Arc::clone(&bus),
            Arc::clone(&board),
            Arc::clone(&timeouts),
        );
        Self {
            config,
            store,
            registry,
            bus,
            waiters,
            board,
            timeouts,
            one_way,
            conversation,
            meeting,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    // -- Registration ---------------------------------------------------------

    pub async fn register_organization(&self, external_id: &str, name: &str) -> Result<Uuid> {
        let external_id = clean_external_id(external_id, "organization external id")?;
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::Validation(
                "organization name cannot be empty".to_owned(),
            ));
        }
        self.store.insert_organization(&external_id, name).await
    }

    pub async fn organization(&self, external_id: &str) -> Result<Organization> {
        let external_id = clean_external_id(external_id, "organization external id")?;
        self.store
            .organization_by_external_id(&external_id)
            .await?
            .ok_or(Error::OrganizationNotFound(external_id))
    }

    pub async fn register_agent(
        &self,
        external_id: &str,
        organization_external_id: &str,
        name: &str,
    ) -> Result<Uuid> {
        let external_id = clean_external_id(external_id, "agent external id")?;
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::Validation("agent name cannot be empty".to_owned()));
        }
        let organization = self.organization(organization_external_id).await?;
        self.store
            .insert_agent(&external_id, organization.id, name)
            .await
    }

    pub async fn agent(&self, external_id: &str) -> Result<Agent> {
        let external_id = clean_external_id(external_id, "agent external id")?;
        self.store
            .agent_by_external_id(&external_id)
            .await?
            .ok_or(Error::AgentNotFound(external_id))
    }

    pub async fn agents_in_organization(
        &self,
        organization_external_id: &str,
    ) -> Result<Vec<Agent>> {
        let organization = self.organization(organization_external_id).await?;
        self.store.agents_in_organization(organization.id).await
    }

    /// Delete an organization and everything it owns. Returns false when it
    /// did not exist.
    pub async fn remove_organization(&self, external_id: &str) -> Result<bool> {
        let external_id = clean_external_id(external_id, "organization external id")?;
        self.store.delete_organization(&external_id).await
    }

    /// Delete an agent and everything it owns. Returns false when it did
    /// not exist.
    pub async fn remove_agent(&self, external_id: &str) -> Result<bool> {
        let external_id = clean_external_id(external_id, "agent external id")?;
        self.store.delete_agent(&external_id).await
    }

    // -- Handlers and event subscriptions -------------------------------------

    /// Register the callback for a handler kind, replacing any prior one.
    pub fn register_handler<F, Fut>(&self, kind: HandlerKind, handler: F)
    where
        F: Fn(Value, MessageContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Option<Value>>> + Send + 'static,
    {
        self.registry.register(kind, handler);
    }

    pub fn has_handler(&self, kind: HandlerKind) -> bool {
        self.registry.has(kind)
    }

    /// Subscribe to one meeting lifecycle event type.
    pub fn subscribe<F, Fut>(&self, event_type: MeetingEventType, subscriber: F)
    where
        F: Fn(MeetingEvent) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.bus.subscribe(event_type, subscriber);
    }

    // -- Messaging surfaces ----------------------------------------------------

    pub fn one_way(&self) -> &OneWayMessenger {
        &self.one_way
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn meeting(&self) -> &MeetingManager {
        &self.meeting
    }

    /// Query messages by metadata predicates, optionally scoped to agents,
    /// a session, or a meeting, with limit/offset pagination.
    pub async fn find_messages(
        &self,
        query: &crate::store::MetadataQuery,
    ) -> Result<Vec<crate::model::Message>> {
        self.store.messages_by_metadata(query).await
    }

    /// Convenience: blocking send with the configured default timeout.
    pub async fn send_and_wait(
        &self,
        sender_external_id: &str,
        recipient_external_id: &str,
        message: Value,
    ) -> Result<Value> {
        self.conversation
            .send_and_wait(
                sender_external_id,
                recipient_external_id,
                message,
                self.config.reply_timeout(),
                None,
            )
            .await
    }

    /// Convenience: create a meeting with the configured default turn
    /// duration.
    pub async fn create_meeting(
        &self,
        host_external_id: &str,
        participant_external_ids: &[&str],
    ) -> Result<Uuid> {
        self.meeting
            .create_meeting(
                host_external_id,
                participant_external_ids,
                Some(self.config.turn_duration()),
            )
            .await
    }

    // -- Lifecycle -------------------------------------------------------------

    /// True once shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Orderly shutdown: stop intake, release parked callers, cancel turn
    /// timers, await event subscribers and detached handlers, close the
    /// pool.
    pub async fn shutdown(&self) -> Result<()> {
        info!("coordinator shutting down");
        self.shutdown.cancel();
        self.waiters.drain();
        self.board.drain();
        self.timeouts.shutdown().await;
        self.bus.shutdown().await;
        self.registry.shutdown().await;
        self.store.close().await;
        info!("coordinator shut down");
        Ok(())
    }
}

impl std::fmt::Debug for Parley {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Parley").finish_non_exhaustive()
    }
}
