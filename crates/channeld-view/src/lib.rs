//! Channel data view: provider registration, per-tick delta merging, handover handling, and entity-scoped command routing.
pub mod command;
pub mod data;
pub mod entity_map;
pub mod merge;
pub mod provider;
pub mod view;

pub use command::{CommandDispatcher, CommandError, CommandMessage, CommandTarget};
pub use data::{ChannelData, ChannelDataMessage, ChannelDataRegistry, DataError};
pub use entity_map::EntityChannelMap;
pub use merge::{Merge, Removable, accumulate_map, merge_map, merge_nested, merge_option};
pub use provider::{ChannelDataProvider, ProviderSet, SharedProvider, lock, shared};
pub use view::{ChannelDataView, NoHooks, ViewConfig, ViewHooks};
