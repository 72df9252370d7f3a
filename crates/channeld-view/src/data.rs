//! Type-erased channel state and the per-channel-type factory registry.
//!
//! Application state types implement [`ChannelDataMessage`]; the view works
//! with them through the object-safe [`ChannelData`] trait. A
//! [`ChannelDataRegistry`] maps each [`ChannelType`] to a factory for its
//! empty snapshot and each wire type URL to a parser.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt::Debug;

use channeld_net::protocol::{self, AnyData, ChannelType, MessageError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::merge::Merge;

// ---------------------------------------------------------------------------
// ChannelDataMessage / ChannelData
// ---------------------------------------------------------------------------

/// A concrete channel state type.
pub trait ChannelDataMessage:
    Merge + Serialize + DeserializeOwned + Default + Clone + Debug + Send + Sync + 'static
{
    /// Stable name carried in [`AnyData::type_url`].
    const TYPE_URL: &'static str;

    /// Entities this state (or delta) mentions.
    fn entity_ids(&self) -> Vec<u32> {
        Vec::new()
    }
}

/// Object-safe view of a [`ChannelDataMessage`].
pub trait ChannelData: Any + Debug + Send + Sync {
    /// Wire type URL.
    fn type_url(&self) -> &'static str;

    /// Merge `delta` into `self`. Returns `false` if `delta` is another type.
    fn merge_dyn(&mut self, delta: &dyn ChannelData) -> bool;

    /// Fold `delta` into a pending outbound delta, keeping tombstones.
    /// Returns `false` if `delta` is another type.
    fn accumulate_dyn(&mut self, delta: &dyn ChannelData) -> bool;

    /// Entities mentioned by this state.
    fn entity_ids(&self) -> Vec<u32>;

    /// Serialize into an [`AnyData`].
    fn pack(&self) -> Result<AnyData, MessageError>;

    /// Upcast for downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Mutable upcast for downcasting.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: ChannelDataMessage> ChannelData for T {
    fn type_url(&self) -> &'static str {
        T::TYPE_URL
    }

    fn merge_dyn(&mut self, delta: &dyn ChannelData) -> bool {
        match delta.as_any().downcast_ref::<T>() {
            Some(delta) => {
                self.merge(delta);
                true
            }
            None => false,
        }
    }

    fn accumulate_dyn(&mut self, delta: &dyn ChannelData) -> bool {
        match delta.as_any().downcast_ref::<T>() {
            Some(delta) => {
                self.accumulate(delta);
                true
            }
            None => false,
        }
    }

    fn entity_ids(&self) -> Vec<u32> {
        ChannelDataMessage::entity_ids(self)
    }

    fn pack(&self) -> Result<AnyData, MessageError> {
        AnyData::pack(T::TYPE_URL, self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl dyn ChannelData {
    /// Borrow as the concrete type `T`.
    pub fn downcast_ref<T: ChannelDataMessage>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// Mutably borrow as the concrete type `T`.
    pub fn downcast_mut<T: ChannelDataMessage>(&mut self) -> Option<&mut T> {
        self.as_any_mut().downcast_mut::<T>()
    }
}

// ---------------------------------------------------------------------------
// ChannelDataRegistry
// ---------------------------------------------------------------------------

/// Errors resolving channel state types.
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    /// No state type is registered under this type URL.
    #[error("no channel data type registered for {0:?}")]
    UnknownTypeUrl(String),

    /// The payload failed to decode.
    #[error(transparent)]
    Message(#[from] MessageError),
}

#[derive(Clone, Copy)]
struct DataDescriptor {
    type_id: TypeId,
    type_url: &'static str,
    create: fn() -> Box<dyn ChannelData>,
    parse: fn(&[u8]) -> Result<Box<dyn ChannelData>, MessageError>,
}

/// Maps channel types to their state type.
#[derive(Default)]
pub struct ChannelDataRegistry {
    by_channel_type: HashMap<ChannelType, DataDescriptor>,
    by_type_url: HashMap<&'static str, DataDescriptor>,
    channel_types: HashMap<TypeId, ChannelType>,
}

impl ChannelDataRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `T` as the state type of `channel_type`. Replaces any earlier entry.
    pub fn register<T: ChannelDataMessage>(&mut self, channel_type: ChannelType) {
        let descriptor = DataDescriptor {
            type_id: TypeId::of::<T>(),
            type_url: T::TYPE_URL,
            create: || Box::new(T::default()) as Box<dyn ChannelData>,
            parse: |bytes| {
                let value: T = protocol::decode_body(bytes)?;
                Ok(Box::new(value) as Box<dyn ChannelData>)
            },
        };
        if let Some(previous) = self.by_channel_type.insert(channel_type, descriptor) {
            if previous.type_id != descriptor.type_id {
                warn!(
                    "Replacing channel data type {} with {} for {} channels",
                    previous.type_url, descriptor.type_url, channel_type
                );
            }
        }
        self.by_type_url.insert(descriptor.type_url, descriptor);
        self.channel_types.insert(descriptor.type_id, channel_type);
        debug!("Registered {} for {} channels", T::TYPE_URL, channel_type);
    }

    /// A fresh empty snapshot for `channel_type`.
    pub fn create(&self, channel_type: ChannelType) -> Option<Box<dyn ChannelData>> {
        self.by_channel_type.get(&channel_type).map(|d| (d.create)())
    }

    /// Decode a packed state by its type URL.
    pub fn parse(&self, data: &AnyData) -> Result<Box<dyn ChannelData>, DataError> {
        let descriptor = self
            .by_type_url
            .get(data.type_url.as_str())
            .ok_or_else(|| DataError::UnknownTypeUrl(data.type_url.clone()))?;
        Ok((descriptor.parse)(&data.value)?)
    }

    /// A fresh empty instance of the state type behind `type_url`.
    pub fn create_by_type_url(&self, type_url: &str) -> Option<Box<dyn ChannelData>> {
        self.by_type_url.get(type_url).map(|d| (d.create)())
    }

    /// The channel type a state type was registered for.
    pub fn channel_type_of(&self, type_id: TypeId) -> Option<ChannelType> {
        self.channel_types.get(&type_id).copied()
    }

    /// Whether `channel_type` has a state type.
    pub fn is_registered(&self, channel_type: ChannelType) -> bool {
        self.by_channel_type.contains_key(&channel_type)
    }
}
