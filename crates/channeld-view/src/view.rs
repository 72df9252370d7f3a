//! Channel data view: per-channel providers, the outbound merge cycle, and
//! handling of inbound updates, unsubscription, and spatial handover.
//!
//! Each tick the game layer calls
//! [`send_all_channel_updates`](ChannelDataView::send_all_channel_updates).
//! For every write-access channel with providers, the view creates an empty
//! snapshot of the channel's state type, lets every provider write its delta
//! into it, reaps providers marked removed, and sends the snapshot once.
//! Nothing is sent for a channel when no provider contributed.

use std::sync::Arc;

use channeld_net::connection::Connection;
use channeld_net::protocol::{
    BroadcastType, ChannelDataAccess, ChannelDataHandoverMessage, ChannelDataUpdateMessage,
    ChannelSubscriptionOptions, ChannelType, ConnectionType, MessageType,
    UnsubscribedFromChannelResultMessage,
};
use channeld_net::registry::{HandlerId, MessageContext, MessageHandler, typed_handler};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, error, info, warn};

use crate::data::{ChannelData, ChannelDataMessage, ChannelDataRegistry};
use crate::entity_map::EntityChannelMap;
use crate::provider::{ProviderSet, SharedProvider, lock};

// ---------------------------------------------------------------------------
// Hooks / config
// ---------------------------------------------------------------------------

/// Game-layer reactions to view events. Every method defaults to a no-op.
pub trait ViewHooks: Send + Sync {
    /// All providers of `channel_id` were dropped after unsubscribing.
    fn on_providers_removed(&self, _channel_id: u32, _providers: Vec<SharedProvider>) {}

    /// A handed-over entity left this connection's interest; delete its local
    /// representation. Its providers have already been detached and marked
    /// removed.
    fn destroy_entity(&self, _entity_id: u32) {}

    /// A handed-over entity is still visible but no longer owned here.
    fn revoke_authority(&self, _entity_id: u32) {}

    /// Materialize a handed-over entity under `channel_id`. The returned
    /// provider receives the handover state and is registered on the channel.
    fn spawn_entity(
        &self,
        _channel_id: u32,
        _entity_id: u32,
        _data: &dyn ChannelData,
    ) -> Option<SharedProvider> {
        None
    }
}

/// Hooks that ignore every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl ViewHooks for NoHooks {}

/// View behaviour switches.
#[derive(Debug, Clone, Default)]
pub struct ViewConfig {
    /// After a handover, move the context connection to read access on the
    /// source channel and write access on the destination.
    pub resubscribe_on_handover: bool,
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct ViewState {
    registry: ChannelDataRegistry,
    providers: DashMap<u32, ProviderSet>,
    snapshots: DashMap<u32, Box<dyn ChannelData>>,
    buffered: DashMap<u32, Box<dyn ChannelData>>,
    entities: EntityChannelMap,
    hooks: Arc<dyn ViewHooks>,
    config: ViewConfig,
}

impl ViewState {
    fn providers_of(&self, channel_id: u32) -> Vec<SharedProvider> {
        self.providers
            .get(&channel_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn add_provider(&self, channel_id: u32, provider: SharedProvider) -> bool {
        let added = self.providers.entry(channel_id).or_default().insert(provider);
        if added {
            info!("Added channel data provider to channel {}", channel_id);
        }
        added
    }

    /// Merge `delta` into the canonical snapshot of `channel_id`.
    fn apply_to_snapshot(&self, channel_id: u32, delta: &dyn ChannelData) {
        match self.snapshots.entry(channel_id) {
            Entry::Occupied(mut entry) => {
                if !entry.get_mut().merge_dyn(delta) {
                    warn!(
                        "Channel {} changed state type to {}, resetting its snapshot",
                        channel_id,
                        delta.type_url()
                    );
                    if let Some(fresh) = self.fresh_from(delta) {
                        entry.insert(fresh);
                    }
                }
            }
            Entry::Vacant(entry) => {
                if let Some(fresh) = self.fresh_from(delta) {
                    entry.insert(fresh);
                }
            }
        }
    }

    fn fresh_from(&self, delta: &dyn ChannelData) -> Option<Box<dyn ChannelData>> {
        let mut fresh = self.registry.create_by_type_url(delta.type_url())?;
        fresh.merge_dyn(delta);
        Some(fresh)
    }

    /// Detach the providers of `entity_id` from `channel_id`.
    fn take_entity_providers(&self, channel_id: u32, entity_id: u32) -> Vec<SharedProvider> {
        let taken = self
            .providers
            .get_mut(&channel_id)
            .map(|mut set| set.take_entity(entity_id))
            .unwrap_or_default();
        self.providers.remove_if(&channel_id, |_, set| set.is_empty());
        taken
    }

    fn buffer(&self, channel_id: u32, delta: Box<dyn ChannelData>) {
        match self.buffered.entry(channel_id) {
            Entry::Occupied(mut entry) => {
                if !entry.get_mut().accumulate_dyn(&*delta) {
                    warn!(
                        "Dropping buffered {} update for channel {}: type differs from pending update",
                        delta.type_url(),
                        channel_id
                    );
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(delta);
            }
        }
    }

    // ----- Outbound -----

    fn flush_channel(&self, conn: &mut Connection, channel_id: u32, channel_type: ChannelType) -> bool {
        let providers = self.providers_of(channel_id);
        if providers.is_empty() && !self.buffered.contains_key(&channel_id) {
            return false;
        }
        let Some(mut snapshot) = self.registry.create(channel_type) else {
            debug!("No channel data type registered for {} channel {}", channel_type, channel_id);
            return false;
        };

        let mut contributed = 0;
        for provider in &providers {
            if lock(provider).update_channel_data(snapshot.as_mut()) {
                contributed += 1;
            }
        }

        let reaped = self
            .providers
            .get_mut(&channel_id)
            .map(|mut set| set.reap())
            .unwrap_or(0);
        if reaped > 0 {
            info!("Removed {} channel data provider(s) from channel {}", reaped, channel_id);
            self.providers.remove_if(&channel_id, |_, set| set.is_empty());
        }

        if let Some((_, delta)) = self.buffered.remove(&channel_id) {
            if snapshot.accumulate_dyn(delta.as_ref()) {
                contributed += 1;
            } else {
                warn!(
                    "Dropping buffered {} update: channel {} carries {}",
                    delta.type_url(),
                    channel_id,
                    snapshot.type_url()
                );
            }
        }

        if contributed == 0 {
            return false;
        }

        self.apply_to_snapshot(channel_id, snapshot.as_ref());
        let data = match snapshot.pack() {
            Ok(data) => data,
            Err(e) => {
                error!("Failed to pack {} for channel {}: {}", snapshot.type_url(), channel_id, e);
                return false;
            }
        };
        let update = ChannelDataUpdateMessage {
            data,
            context_conn_id: 0,
        };
        match conn.send(
            channel_id,
            MessageType::ChannelDataUpdate.id(),
            &update,
            BroadcastType::NO_BROADCAST,
        ) {
            Ok(()) => {
                debug!(
                    "Sent {} update to channel {} from {} contributor(s)",
                    snapshot.type_url(),
                    channel_id,
                    contributed
                );
                true
            }
            Err(e) => {
                error!("Failed to send update to channel {}: {}", channel_id, e);
                false
            }
        }
    }

    // ----- Inbound -----

    fn handle_update(&self, ctx: &MessageContext, msg: &ChannelDataUpdateMessage) {
        let data = match self.registry.parse(&msg.data) {
            Ok(data) => data,
            Err(e) => {
                error!("Unable to parse channel data for channel {}: {}", ctx.channel_id, e);
                return;
            }
        };
        debug!("Received {} update for channel {}", data.type_url(), ctx.channel_id);
        self.apply_to_snapshot(ctx.channel_id, data.as_ref());

        let providers = self.providers_of(ctx.channel_id);
        if providers.is_empty() {
            warn!(
                "No provider registered for channel {}, type_url: {}",
                ctx.channel_id, msg.data.type_url
            );
            return;
        }
        for provider in &providers {
            lock(provider).on_channel_data_updated(data.as_ref());
        }
    }

    fn handle_unsub(
        &self,
        conn: &Connection,
        ctx: &MessageContext,
        msg: &UnsubscribedFromChannelResultMessage,
    ) {
        if conn.id() == 0 || msg.conn_id != conn.id() {
            return;
        }
        self.snapshots.remove(&ctx.channel_id);
        self.buffered.remove(&ctx.channel_id);
        if let Some((_, set)) = self.providers.remove(&ctx.channel_id) {
            info!(
                "Unsubscribed from channel {}, removed {} data provider(s)",
                ctx.channel_id,
                set.len()
            );
            self.hooks.on_providers_removed(ctx.channel_id, set.into_vec());
        }
    }

    fn handle_handover(&self, conn: &mut Connection, msg: &ChannelDataHandoverMessage) {
        let data = match self.registry.parse(&msg.data) {
            Ok(data) => data,
            Err(e) => {
                error!(
                    "Unable to parse handover data from channel {} to {}: {}",
                    msg.src_channel_id, msg.dst_channel_id, e
                );
                return;
            }
        };
        let (src, dst) = (msg.src_channel_id, msg.dst_channel_id);
        let entity_ids = data.entity_ids();
        info!(
            "Channel data handover from channel {} to {} ({} entities)",
            src,
            dst,
            entity_ids.len()
        );

        let tables = conn.channels();
        let src_subscribed = tables.is_subscribed(src);
        let dst_subscribed = tables.is_subscribed(dst);
        let dst_owned = tables.is_owned(dst);

        if src_subscribed {
            for &entity_id in &entity_ids {
                let moved = self.take_entity_providers(src, entity_id);
                if !dst_subscribed {
                    self.hooks.destroy_entity(entity_id);
                    self.entities.remove(entity_id);
                    for provider in &moved {
                        lock(provider).set_removed(true);
                    }
                    continue;
                }
                if !dst_owned {
                    self.hooks.revoke_authority(entity_id);
                }
                for provider in moved {
                    self.add_provider(dst, provider);
                }
            }
        }

        if dst_subscribed {
            self.apply_to_snapshot(dst, data.as_ref());
            if !src_subscribed {
                for &entity_id in &entity_ids {
                    let Some(provider) = self.hooks.spawn_entity(dst, entity_id, data.as_ref()) else {
                        continue;
                    };
                    lock(&provider).on_channel_data_updated(data.as_ref());
                    self.add_provider(dst, provider);
                }
            }
        }

        // Destroyed entities stay unmapped.
        if dst_subscribed || !src_subscribed {
            for &entity_id in &entity_ids {
                self.entities.insert(entity_id, dst);
            }
        }

        if self.config.resubscribe_on_handover && msg.context_conn_id != 0 {
            let moves = [
                (src, ChannelSubscriptionOptions::read_access()),
                (
                    dst,
                    ChannelSubscriptionOptions {
                        data_access: Some(ChannelDataAccess::WriteAccess),
                        ..ChannelSubscriptionOptions::default()
                    },
                ),
            ];
            for (channel_id, options) in moves {
                if let Err(e) =
                    conn.sub_connection_to_channel(msg.context_conn_id, channel_id, Some(options), None)
                {
                    error!(
                        "Failed to move conn {} to channel {}: {}",
                        msg.context_conn_id, channel_id, e
                    );
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ChannelDataView
// ---------------------------------------------------------------------------

/// Reconciles local providers with per-channel shared state.
pub struct ChannelDataView {
    state: Arc<ViewState>,
    handlers: Vec<(u32, HandlerId)>,
}

impl ChannelDataView {
    /// Create a view over the state types in `registry`.
    pub fn new(
        registry: ChannelDataRegistry,
        entities: EntityChannelMap,
        hooks: Arc<dyn ViewHooks>,
        config: ViewConfig,
    ) -> Self {
        Self {
            state: Arc::new(ViewState {
                registry,
                providers: DashMap::new(),
                snapshots: DashMap::new(),
                buffered: DashMap::new(),
                entities,
                hooks,
                config,
            }),
            handlers: Vec::new(),
        }
    }

    /// Attach the view's message handlers to `conn`.
    pub fn initialize(&mut self, conn: &mut Connection) {
        if !self.handlers.is_empty() {
            debug!("Channel data view already initialized");
            return;
        }

        let state = Arc::clone(&self.state);
        self.attach(
            conn,
            MessageType::ChannelDataUpdate,
            typed_handler(
                move |_: &mut Connection, ctx: &MessageContext, msg: &ChannelDataUpdateMessage| {
                    state.handle_update(ctx, msg)
                },
            ),
        );

        let state = Arc::clone(&self.state);
        self.attach(
            conn,
            MessageType::UnsubFromChannel,
            typed_handler(
                move |conn: &mut Connection,
                      ctx: &MessageContext,
                      msg: &UnsubscribedFromChannelResultMessage| {
                    state.handle_unsub(conn, ctx, msg)
                },
            ),
        );

        let state = Arc::clone(&self.state);
        self.attach(
            conn,
            MessageType::ChannelDataHandover,
            typed_handler(
                move |conn: &mut Connection, _: &MessageContext, msg: &ChannelDataHandoverMessage| {
                    state.handle_handover(conn, msg)
                },
            ),
        );

        info!("Channel data view initialized");
    }

    fn attach<H>(&mut self, conn: &mut Connection, msg_type: MessageType, handler: H)
    where
        H: MessageHandler<Connection> + 'static,
    {
        match conn.add_handler(msg_type.id(), handler) {
            Ok(id) => self.handlers.push((msg_type.id(), id)),
            Err(e) => error!("Failed to attach {:?} handler: {}", msg_type, e),
        }
    }

    /// Detach the view's message handlers from `conn`.
    pub fn uninitialize(&mut self, conn: &mut Connection) {
        for (msg_type, id) in self.handlers.drain(..) {
            conn.remove_handler(msg_type, id);
        }
        info!("Channel data view uninitialized");
    }

    /// Whether the handlers are attached.
    pub fn is_initialized(&self) -> bool {
        !self.handlers.is_empty()
    }

    /// Run one outbound cycle over every write-access channel. Returns the
    /// number of updates queued.
    pub fn send_all_channel_updates(&self, conn: &mut Connection) -> usize {
        let mut writable: Vec<(u32, ChannelType)> = conn
            .channels()
            .subscribed()
            .iter()
            .filter(|(_, sub)| sub.sub_options.can_update_data())
            .map(|(channel_id, sub)| (*channel_id, sub.channel_type))
            .collect();
        writable.sort_unstable_by_key(|(channel_id, _)| *channel_id);

        let mut sent = 0;
        for (channel_id, channel_type) in writable {
            if self.state.flush_channel(conn, channel_id, channel_type) {
                sent += 1;
            }
        }
        sent
    }

    // ----- Providers -----

    /// Register `provider` on `channel_id`. Returns `false` if already there.
    pub fn add_provider(&self, channel_id: u32, provider: SharedProvider) -> bool {
        self.state.add_provider(channel_id, provider)
    }

    /// Mark `provider` removed; it contributes once more and is reaped by the
    /// following flush.
    pub fn remove_provider(&self, channel_id: u32, provider: &SharedProvider) -> bool {
        let present = self
            .state
            .providers
            .get(&channel_id)
            .is_some_and(|set| set.contains(provider));
        if present {
            info!("Removing channel data provider from channel {}", channel_id);
            lock(provider).set_removed(true);
        }
        present
    }

    /// Register `provider` where its state belongs.
    ///
    /// Servers add it to every owned channel of the provider's channel type;
    /// clients add it to the channel that owns the provider's entity. Returns
    /// the number of channels it was added to.
    pub fn add_provider_to_default_channel(&self, conn: &Connection, provider: SharedProvider) -> usize {
        let (data_type, entity_id) = {
            let guard = lock(&provider);
            (guard.data_type(), guard.entity_id())
        };
        let Some(channel_type) = self.state.registry.channel_type_of(data_type) else {
            error!("Unregistered channel data type for provider");
            return 0;
        };

        match conn.connection_type() {
            ConnectionType::Server => {
                let mut owned: Vec<u32> = conn
                    .channels()
                    .owned()
                    .iter()
                    .filter(|(_, info)| info.channel_type == channel_type)
                    .map(|(channel_id, _)| *channel_id)
                    .collect();
                owned.sort_unstable();
                owned
                    .into_iter()
                    .filter(|&channel_id| self.add_provider(channel_id, Arc::clone(&provider)))
                    .count()
            }
            _ => {
                let channel_id = entity_id.and_then(|id| self.state.entities.get(id));
                match channel_id {
                    Some(channel_id) => usize::from(self.add_provider(channel_id, provider)),
                    None => {
                        error!("No channel mapping found for entity {:?}", entity_id);
                        0
                    }
                }
            }
        }
    }

    /// Mark `provider` removed on every channel it is registered on. Returns
    /// the number of channels affected.
    pub fn remove_provider_from_all_channels(&self, provider: &SharedProvider) -> usize {
        let channels: Vec<u32> = self
            .state
            .providers
            .iter()
            .filter(|entry| entry.value().contains(provider))
            .map(|entry| *entry.key())
            .collect();
        if !channels.is_empty() {
            info!("Removing channel data provider from channels {:?}", channels);
            lock(provider).set_removed(true);
        }
        channels.len()
    }

    /// Providers registered on `channel_id`.
    pub fn providers(&self, channel_id: u32) -> Vec<SharedProvider> {
        self.state.providers_of(channel_id)
    }

    /// Number of providers on `channel_id`.
    pub fn provider_count(&self, channel_id: u32) -> usize {
        self.state.providers.get(&channel_id).map_or(0, |set| set.len())
    }

    /// Mark every provider removed and flush once so the removals reach the
    /// hub. Call before disconnecting `conn`.
    pub fn on_disconnect(&self, conn: &mut Connection) -> usize {
        for entry in self.state.providers.iter() {
            for provider in entry.value().iter() {
                lock(provider).set_removed(true);
            }
        }
        self.send_all_channel_updates(conn)
    }

    // ----- Buffered updates -----

    /// Merge `delta` into the pending update of the channel owning `entity_id`.
    /// It is sent with that channel's next flush.
    pub fn buffer_update<T: ChannelDataMessage>(&self, entity_id: u32, delta: T) {
        let channel_id = self.state.entities.owning_channel(entity_id);
        self.buffer_channel_update(channel_id, delta);
    }

    /// Merge `delta` into the pending update of `channel_id`.
    pub fn buffer_channel_update<T: ChannelDataMessage>(&self, channel_id: u32, delta: T) {
        debug!("Buffering {} update for channel {}", T::TYPE_URL, channel_id);
        self.state.buffer(channel_id, Box::new(delta));
    }

    /// Whether `channel_id` has a pending buffered update.
    pub fn has_buffered_update(&self, channel_id: u32) -> bool {
        self.state.buffered.contains_key(&channel_id)
    }

    // ----- State -----

    /// A copy of the merged state of `channel_id`.
    pub fn channel_data<T: ChannelDataMessage>(&self, channel_id: u32) -> Option<T> {
        let entry = self.state.snapshots.get(&channel_id)?;
        let data: &dyn ChannelData = &**entry;
        data.downcast_ref::<T>().cloned()
    }

    /// The entity to channel table.
    pub fn entities(&self) -> &EntityChannelMap {
        &self.state.entities
    }

    /// The state type registry.
    pub fn registry(&self) -> &ChannelDataRegistry {
        &self.state.registry
    }
}

#[cfg(test)]
#[path = "view_tests.rs"]
mod tests;
