//! Process-wide entity to owning-channel table.

use std::sync::Arc;

use channeld_net::protocol::GLOBAL_CHANNEL_ID;
use dashmap::DashMap;
use tracing::warn;

/// Maps entity ids to the channel currently authoritative for them.
///
/// Cloning shares the table. Safe to use from the game and network threads at
/// once.
#[derive(Debug, Clone, Default)]
pub struct EntityChannelMap {
    inner: Arc<DashMap<u32, u32>>,
}

impl EntityChannelMap {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Point `entity_id` at `channel_id`. Returns the previous channel.
    pub fn insert(&self, entity_id: u32, channel_id: u32) -> Option<u32> {
        self.inner.insert(entity_id, channel_id)
    }

    /// Forget `entity_id`.
    pub fn remove(&self, entity_id: u32) -> Option<u32> {
        self.inner.remove(&entity_id).map(|(_, channel_id)| channel_id)
    }

    /// The channel owning `entity_id`, if mapped.
    pub fn get(&self, entity_id: u32) -> Option<u32> {
        self.inner.get(&entity_id).map(|entry| *entry)
    }

    /// The owning channel, or the global channel if `entity_id` is unmapped.
    pub fn owning_channel(&self, entity_id: u32) -> u32 {
        self.get(entity_id).unwrap_or_else(|| {
            warn!(
                "No owning channel found for entity {}, falling back to the global channel",
                entity_id
            );
            GLOBAL_CHANNEL_ID
        })
    }

    /// Entities currently mapped to `channel_id`.
    pub fn entities_in(&self, channel_id: u32) -> Vec<u32> {
        self.inner
            .iter()
            .filter(|entry| *entry.value() == channel_id)
            .map(|entry| *entry.key())
            .collect()
    }

    /// Number of mapped entities.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// True when no entity is mapped.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Forget every entity, for all clones.
    pub fn clear(&self) {
        self.inner.clear();
    }
}
