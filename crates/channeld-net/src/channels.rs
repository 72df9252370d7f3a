//! Per-connection channel bookkeeping: subscriptions, ownership, and the
//! listed-channel cache.

use std::collections::{HashMap, HashSet};

use crate::protocol::{
    ChannelInfo, ChannelType, CreateChannelResultMessage, SubscribedToChannelResultMessage,
};

/// How the local connection relates to a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRelation {
    /// Neither subscribed nor owner.
    NotRelated,
    /// A subscription request is in flight.
    Subscribing,
    /// Subscribed without owning the channel.
    Observer,
    /// Owner of the channel.
    Owner,
}

/// Result of recording a subscription acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionChange {
    /// First acknowledgment for this channel.
    New,
    /// Duplicate acknowledgment; options were merged into the existing entry.
    Merged,
}

/// Channel tables of one connection.
#[derive(Debug, Default)]
pub struct ChannelTables {
    subscribed: HashMap<u32, SubscribedToChannelResultMessage>,
    owned: HashMap<u32, CreateChannelResultMessage>,
    listed: HashMap<u32, ChannelInfo>,
    subscribing: HashSet<u32>,
}

impl ChannelTables {
    /// Create empty tables.
    pub fn new() -> Self {
        Self::default()
    }

    /// Note that a subscription request for `channel_id` was sent.
    pub fn mark_subscribing(&mut self, channel_id: u32) {
        if !self.subscribed.contains_key(&channel_id) {
            self.subscribing.insert(channel_id);
        }
    }

    /// Record a channel creation result. Returns `true` if `local_id` owns it.
    pub fn record_created(
        &mut self,
        channel_id: u32,
        result: &CreateChannelResultMessage,
        local_id: u32,
    ) -> bool {
        self.listed.insert(
            channel_id,
            ChannelInfo {
                channel_id,
                channel_type: result.channel_type,
                metadata: result.metadata.clone(),
            },
        );

        let owned = local_id != 0 && result.owner_conn_id == local_id;
        if owned {
            let mut entry = result.clone();
            entry.channel_id = channel_id;
            self.owned.insert(channel_id, entry);
        }
        owned
    }

    /// Record a subscription acknowledgment for the local connection.
    pub fn record_subscribed(
        &mut self,
        channel_id: u32,
        result: &SubscribedToChannelResultMessage,
    ) -> SubscriptionChange {
        self.subscribing.remove(&channel_id);
        match self.subscribed.get_mut(&channel_id) {
            Some(existing) => {
                existing.sub_options.merge_from(&result.sub_options);
                SubscriptionChange::Merged
            }
            None => {
                self.subscribed.insert(channel_id, result.clone());
                SubscriptionChange::New
            }
        }
    }

    /// Merge a listing into the cache.
    pub fn record_listed(&mut self, channels: &[ChannelInfo]) {
        for info in channels {
            self.listed.insert(info.channel_id, info.clone());
        }
    }

    /// Purge `channel_id` from every table. Returns `true` if it was owned.
    pub fn purge(&mut self, channel_id: u32) -> bool {
        self.subscribed.remove(&channel_id);
        self.subscribing.remove(&channel_id);
        self.listed.remove(&channel_id);
        self.owned.remove(&channel_id).is_some()
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.subscribed.clear();
        self.owned.clear();
        self.listed.clear();
        self.subscribing.clear();
    }

    /// How the local connection relates to `channel_id`.
    pub fn relation(&self, channel_id: u32) -> ChannelRelation {
        if self.owned.contains_key(&channel_id) {
            ChannelRelation::Owner
        } else if self.subscribed.contains_key(&channel_id) {
            ChannelRelation::Observer
        } else if self.subscribing.contains(&channel_id) {
            ChannelRelation::Subscribing
        } else {
            ChannelRelation::NotRelated
        }
    }

    /// Whether the local connection is subscribed to `channel_id`.
    pub fn is_subscribed(&self, channel_id: u32) -> bool {
        self.subscribed.contains_key(&channel_id)
    }

    /// Whether the local connection owns `channel_id`.
    pub fn is_owned(&self, channel_id: u32) -> bool {
        self.owned.contains_key(&channel_id)
    }

    /// Subscription entry for `channel_id`.
    pub fn subscription(&self, channel_id: u32) -> Option<&SubscribedToChannelResultMessage> {
        self.subscribed.get(&channel_id)
    }

    /// Every subscription.
    pub fn subscribed(&self) -> &HashMap<u32, SubscribedToChannelResultMessage> {
        &self.subscribed
    }

    /// Every owned channel.
    pub fn owned(&self) -> &HashMap<u32, CreateChannelResultMessage> {
        &self.owned
    }

    /// Every listed channel.
    pub fn listed(&self) -> &HashMap<u32, ChannelInfo> {
        &self.listed
    }

    /// Lowest owned channel id of the given type.
    pub fn first_owned_of(&self, channel_type: ChannelType) -> Option<u32> {
        self.owned
            .iter()
            .filter(|(_, info)| info.channel_type == channel_type)
            .map(|(id, _)| *id)
            .min()
    }

    /// Lowest subscribed channel id of the given type that grants write access.
    pub fn first_writable_of(&self, channel_type: ChannelType) -> Option<u32> {
        self.subscribed
            .iter()
            .filter(|(_, sub)| sub.channel_type == channel_type && sub.sub_options.can_update_data())
            .map(|(id, _)| *id)
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ChannelSubscriptionOptions;

    fn created(owner: u32, channel_type: ChannelType) -> CreateChannelResultMessage {
        CreateChannelResultMessage {
            channel_type,
            metadata: "world".to_string(),
            owner_conn_id: owner,
            channel_id: 0,
        }
    }

    fn sub_ack(conn_id: u32, options: ChannelSubscriptionOptions) -> SubscribedToChannelResultMessage {
        SubscribedToChannelResultMessage {
            conn_id,
            sub_options: options,
            channel_type: ChannelType::Subworld,
            ..Default::default()
        }
    }

    #[test]
    fn test_created_always_listed_owned_only_when_local() {
        let mut tables = ChannelTables::new();
        assert!(tables.record_created(1, &created(5, ChannelType::Subworld), 5));
        assert!(!tables.record_created(2, &created(9, ChannelType::Subworld), 5));

        assert_eq!(tables.relation(1), ChannelRelation::Owner);
        assert_eq!(tables.relation(2), ChannelRelation::NotRelated);
        assert!(tables.listed().contains_key(&1));
        assert!(tables.listed().contains_key(&2));
    }

    #[test]
    fn test_unauthenticated_never_owns() {
        let mut tables = ChannelTables::new();
        assert!(!tables.record_created(1, &created(0, ChannelType::Global), 0));
    }

    #[test]
    fn test_duplicate_sub_ack_merges() {
        let mut tables = ChannelTables::new();
        tables.mark_subscribing(7);
        assert_eq!(tables.relation(7), ChannelRelation::Subscribing);

        let first = tables.record_subscribed(7, &sub_ack(5, ChannelSubscriptionOptions::read_access()));
        assert_eq!(first, SubscriptionChange::New);
        assert_eq!(tables.relation(7), ChannelRelation::Observer);

        let second =
            tables.record_subscribed(7, &sub_ack(5, ChannelSubscriptionOptions::write_access(20)));
        assert_eq!(second, SubscriptionChange::Merged);
        assert_eq!(tables.subscribed().len(), 1);

        let sub = tables.subscription(7).unwrap();
        assert!(sub.sub_options.can_update_data());
        assert_eq!(sub.sub_options.fan_out_interval_ms, Some(20));
    }

    #[test]
    fn test_purge_reports_ownership() {
        let mut tables = ChannelTables::new();
        tables.record_created(3, &created(5, ChannelType::Subworld), 5);
        tables.record_subscribed(3, &sub_ack(5, ChannelSubscriptionOptions::write_access(10)));

        assert!(tables.purge(3));
        assert!(!tables.purge(3));
        assert_eq!(tables.relation(3), ChannelRelation::NotRelated);
        assert!(tables.listed().is_empty());
    }

    #[test]
    fn test_first_writable_of_type() {
        let mut tables = ChannelTables::new();
        tables.record_subscribed(9, &sub_ack(5, ChannelSubscriptionOptions::read_access()));
        tables.record_subscribed(4, &sub_ack(5, ChannelSubscriptionOptions::write_access(10)));
        tables.record_subscribed(6, &sub_ack(5, ChannelSubscriptionOptions::write_access(10)));

        assert_eq!(tables.first_writable_of(ChannelType::Subworld), Some(4));
        assert_eq!(tables.first_writable_of(ChannelType::Spatial), None);
    }
}
