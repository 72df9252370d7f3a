//! Protocol message types and serialization.
//!
//! Every envelope on the wire carries a numeric message type. Types below
//! [`USER_SPACE_START`] are protocol messages owned by this crate; everything
//! at or above it is application traffic that the hub forwards opaquely.
//! Message bodies are serialized with [`postcard`] via [`encode_body`] and
//! [`decode_body`].

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// The channel every connection can reach once authenticated.
pub const GLOBAL_CHANNEL_ID: u32 = 0;

/// First message type id reserved for application ("user-space") messages.
pub const USER_SPACE_START: u32 = 100;

// ---------------------------------------------------------------------------
// Message type ids
// ---------------------------------------------------------------------------

/// Well-known protocol message types. The discriminant is the wire id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageType {
    /// Never sent; marks an uninitialised envelope.
    Invalid = 0,
    /// Authentication request / [`AuthResultMessage`].
    Auth = 1,
    /// Channel creation request / [`CreateChannelResultMessage`].
    CreateChannel = 3,
    /// Channel removal request and notification.
    RemoveChannel = 4,
    /// Channel listing request / [`ListChannelResultMessage`].
    ListChannel = 5,
    /// Subscription request / [`SubscribedToChannelResultMessage`].
    SubToChannel = 6,
    /// Unsubscription request / [`UnsubscribedFromChannelResultMessage`].
    UnsubFromChannel = 7,
    /// Channel state delta.
    ChannelDataUpdate = 8,
    /// Connection teardown notice.
    Disconnect = 9,
    /// Spatial channel creation / [`CreateSpatialChannelsResultMessage`].
    CreateSpatialChannel = 10,
    /// Point-to-channel query / [`QuerySpatialChannelResultMessage`].
    QuerySpatialChannel = 11,
    /// Ownership transfer of spatial state between channels.
    ChannelDataHandover = 12,
    /// Full list of spatial regions.
    SpatialRegionsUpdate = 13,
    /// First application message type.
    UserSpaceStart = 100,
}

impl MessageType {
    /// Wire id of this message type.
    pub const fn id(self) -> u32 {
        self as u32
    }

    /// Look up a protocol message type by wire id.
    pub fn from_id(id: u32) -> Option<Self> {
        let ty = match id {
            0 => Self::Invalid,
            1 => Self::Auth,
            3 => Self::CreateChannel,
            4 => Self::RemoveChannel,
            5 => Self::ListChannel,
            6 => Self::SubToChannel,
            7 => Self::UnsubFromChannel,
            8 => Self::ChannelDataUpdate,
            9 => Self::Disconnect,
            10 => Self::CreateSpatialChannel,
            11 => Self::QuerySpatialChannel,
            12 => Self::ChannelDataHandover,
            13 => Self::SpatialRegionsUpdate,
            100 => Self::UserSpaceStart,
            _ => return None,
        };
        Some(ty)
    }
}

/// Returns `true` if `msg_type` belongs to the application range.
pub fn is_user_space(msg_type: u32) -> bool {
    msg_type >= USER_SPACE_START
}

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// Kind of channel, assigned at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u32)]
pub enum ChannelType {
    /// Matches every type when used as a filter.
    #[default]
    Unknown = 0,
    /// The single process-wide channel.
    Global = 1,
    /// A channel private to its owner.
    Private = 2,
    /// An isolated sub-world.
    Subworld = 3,
    /// A rectangular region of world space.
    Spatial = 4,
    /// Reserved for tests.
    Test = 100,
}

impl ChannelType {
    const ALL: [ChannelType; 6] = [
        Self::Unknown,
        Self::Global,
        Self::Private,
        Self::Subworld,
        Self::Spatial,
        Self::Test,
    ];

    /// Wire id of this channel type.
    pub const fn id(self) -> u32 {
        self as u32
    }

    /// Look up a channel type by wire id.
    pub fn from_id(id: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|ty| ty.id() == id)
    }

    fn name(self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::Global => "Global",
            Self::Private => "Private",
            Self::Subworld => "Subworld",
            Self::Spatial => "Spatial",
            Self::Test => "Test",
        }
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error returned when a string names no [`ChannelType`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown channel type: {0:?}")]
pub struct ParseChannelTypeError(pub String);

impl FromStr for ChannelType {
    type Err = ParseChannelTypeError;

    /// Accepts a case-insensitive name (`"spatial"`) or a wire id (`"4"`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Ok(id) = trimmed.parse::<u32>() {
            return Self::from_id(id).ok_or_else(|| ParseChannelTypeError(s.to_string()));
        }
        Self::ALL
            .into_iter()
            .find(|ty| ty.name().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| ParseChannelTypeError(s.to_string()))
    }
}

/// Fan-out targeting for an outbound envelope. Values are bit flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BroadcastType(pub u32);

impl BroadcastType {
    /// Deliver to the channel owner only.
    pub const NO_BROADCAST: Self = Self(0);
    /// Deliver to every subscriber.
    pub const ALL: Self = Self(1);
    /// Deliver to every subscriber except the sender.
    pub const ALL_BUT_SENDER: Self = Self(2);
    /// Deliver to every subscriber except the channel owner.
    pub const ALL_BUT_OWNER: Self = Self(4);
    /// Deliver to a single connection named by the message.
    pub const SINGLE_CONNECTION: Self = Self(8);

    /// Returns `true` if every flag of `other` is set in `self`.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Which side of the hub a connection speaks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConnectionType {
    /// Not yet known (e.g. a result for a connection that already left).
    #[default]
    NoConnection,
    /// A game server instance.
    Server,
    /// A game client.
    Client,
}

/// Payload compression negotiated during authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CompressionType {
    /// Payloads are sent as-is.
    #[default]
    NoCompression,
    /// Payloads are LZ4 block-compressed.
    Lz4,
}

impl CompressionType {
    /// The header flag byte for this mode.
    pub const fn flag(self) -> u8 {
        match self {
            Self::NoCompression => 0,
            Self::Lz4 => 1,
        }
    }
}

/// Access level a subscription grants on channel data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum ChannelDataAccess {
    /// No access to channel data.
    #[default]
    NoAccess,
    /// Receives fan-out only.
    ReadAccess,
    /// May send channel data updates.
    WriteAccess,
}

/// Outcome of an authentication attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AuthResult {
    /// Credentials accepted.
    #[default]
    Successful,
    /// Player identifier token rejected.
    InvalidPit,
    /// Login token rejected.
    InvalidLt,
}

// ---------------------------------------------------------------------------
// Envelopes
// ---------------------------------------------------------------------------

/// One message inside a [`Packet`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MessagePack {
    /// Target (outbound) or source (inbound) channel.
    pub channel_id: u32,
    /// Fan-out flags, see [`BroadcastType`].
    pub broadcast: u32,
    /// Correlation id; 0 means no reply is expected.
    pub stub_id: u32,
    /// Numeric message type.
    pub msg_type: u32,
    /// Serialized message body.
    pub msg_body: Vec<u8>,
}

impl MessagePack {
    /// Rough serialized size, used to bound outbound packets.
    pub fn size_hint(&self) -> usize {
        // Four varint u32 fields (≤ 5 bytes each) plus the body length prefix.
        self.msg_body.len() + 25
    }
}

/// The unit of framing: an ordered batch of envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Packet {
    /// Envelopes in send order.
    pub messages: Vec<MessagePack>,
}

/// A typed message packed with the name of its type, so the receiver can pick
/// a decoder.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AnyData {
    /// Stable name of the packed type.
    pub type_url: String,
    /// Serialized value.
    pub value: Vec<u8>,
}

impl AnyData {
    /// Pack `value` under `type_url`.
    pub fn pack<T: Serialize>(type_url: &str, value: &T) -> Result<Self, MessageError> {
        Ok(Self {
            type_url: type_url.to_string(),
            value: encode_body(value)?,
        })
    }

    /// Unpack the value, checking the type name first.
    pub fn unpack<T: DeserializeOwned>(&self, type_url: &str) -> Result<T, MessageError> {
        if self.type_url != type_url {
            return Err(MessageError::TypeMismatch {
                expected: type_url.to_string(),
                actual: self.type_url.clone(),
            });
        }
        decode_body(&self.value)
    }
}

// ---------------------------------------------------------------------------
// Channel options
// ---------------------------------------------------------------------------

/// Per-subscription options. Absent fields mean "leave as is" when merged.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChannelSubscriptionOptions {
    /// Access level on channel data.
    pub data_access: Option<ChannelDataAccess>,
    /// Field paths this subscriber is interested in; empty means all.
    pub data_field_masks: Vec<String>,
    /// Fan-out cadence for this subscriber in milliseconds.
    pub fan_out_interval_ms: Option<u32>,
    /// Delay before the first fan-out in milliseconds.
    pub fan_out_delay_ms: Option<i32>,
}

impl ChannelSubscriptionOptions {
    /// Options granting write access with the given fan-out interval.
    pub fn write_access(fan_out_interval_ms: u32) -> Self {
        Self {
            data_access: Some(ChannelDataAccess::WriteAccess),
            fan_out_interval_ms: Some(fan_out_interval_ms),
            ..Self::default()
        }
    }

    /// Options granting read access only.
    pub fn read_access() -> Self {
        Self {
            data_access: Some(ChannelDataAccess::ReadAccess),
            ..Self::default()
        }
    }

    /// Whether these options allow sending channel data updates.
    pub fn can_update_data(&self) -> bool {
        self.data_access == Some(ChannelDataAccess::WriteAccess)
    }

    /// Merge `other` into `self`: present fields overwrite, masks accumulate.
    pub fn merge_from(&mut self, other: &ChannelSubscriptionOptions) {
        if other.data_access.is_some() {
            self.data_access = other.data_access;
        }
        for mask in &other.data_field_masks {
            if !self.data_field_masks.contains(mask) {
                self.data_field_masks.push(mask.clone());
            }
        }
        if other.fan_out_interval_ms.is_some() {
            self.fan_out_interval_ms = other.fan_out_interval_ms;
        }
        if other.fan_out_delay_ms.is_some() {
            self.fan_out_delay_ms = other.fan_out_delay_ms;
        }
    }
}

/// Hub-side merge options supplied when creating a channel.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChannelDataMergeOptions {
    /// Replace lists instead of appending.
    pub should_replace_list: bool,
    /// Maximum list length kept after a merge; 0 means unbounded.
    pub list_size_limit: u32,
    /// Drop from the front when truncating.
    pub truncate_top: bool,
    /// Honour `removed` flags on map entries.
    pub should_check_removable_map_field: bool,
}

// ---------------------------------------------------------------------------
// Protocol payloads
// ---------------------------------------------------------------------------

/// Credentials sent on [`MessageType::Auth`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AuthMessage {
    /// Player identifier token.
    pub player_identifier_token: String,
    /// Login token.
    pub login_token: String,
}

/// Hub reply to [`AuthMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AuthResultMessage {
    /// Whether the credentials were accepted.
    pub result: AuthResult,
    /// Connection id assigned by the hub.
    pub conn_id: u32,
    /// Negotiated payload compression.
    pub compression_type: CompressionType,
}

/// Request to create a (non-spatial) channel.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CreateChannelMessage {
    /// Type of channel to create.
    pub channel_type: ChannelType,
    /// Free-form metadata used for listing filters.
    pub metadata: String,
    /// Subscription options for the creator.
    pub sub_options: Option<ChannelSubscriptionOptions>,
    /// Initial channel data.
    pub data: Option<AnyData>,
    /// Hub-side merge behaviour.
    pub merge_options: Option<ChannelDataMergeOptions>,
}

/// Hub reply to [`CreateChannelMessage`], also fanned out to observers.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CreateChannelResultMessage {
    /// Type of the created channel.
    pub channel_type: ChannelType,
    /// Metadata of the created channel.
    pub metadata: String,
    /// Connection that owns the channel.
    pub owner_conn_id: u32,
    /// Id of the created channel.
    pub channel_id: u32,
}

/// Request or notification that a channel was removed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RemoveChannelMessage {
    /// Channel being removed.
    pub channel_id: u32,
}

/// Request to list channels.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ListChannelMessage {
    /// Only list this type; [`ChannelType::Unknown`] matches all.
    pub type_filter: ChannelType,
    /// Only list channels whose metadata matches one of these.
    pub metadata_filters: Vec<String>,
}

/// One listed channel.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChannelInfo {
    /// Channel id.
    pub channel_id: u32,
    /// Channel type.
    pub channel_type: ChannelType,
    /// Channel metadata.
    pub metadata: String,
}

/// Hub reply to [`ListChannelMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ListChannelResultMessage {
    /// Matching channels.
    pub channels: Vec<ChannelInfo>,
}

/// Request to subscribe a connection to the envelope's channel.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SubscribedToChannelMessage {
    /// Connection to subscribe.
    pub conn_id: u32,
    /// Requested options.
    pub sub_options: Option<ChannelSubscriptionOptions>,
}

/// Subscription acknowledgment, sent to the subscriber and the channel owner.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SubscribedToChannelResultMessage {
    /// Connection that was subscribed.
    pub conn_id: u32,
    /// Effective options.
    pub sub_options: ChannelSubscriptionOptions,
    /// Kind of the subscribed connection.
    pub conn_type: ConnectionType,
    /// Type of the channel.
    pub channel_type: ChannelType,
}

/// Request to unsubscribe a connection from the envelope's channel.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UnsubscribedFromChannelMessage {
    /// Connection to unsubscribe.
    pub conn_id: u32,
}

/// Unsubscription acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UnsubscribedFromChannelResultMessage {
    /// Connection that was unsubscribed.
    pub conn_id: u32,
    /// Kind of the unsubscribed connection.
    pub conn_type: ConnectionType,
    /// Type of the channel.
    pub channel_type: ChannelType,
}

/// A channel state delta.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChannelDataUpdateMessage {
    /// The packed delta.
    pub data: AnyData,
    /// Connection whose action caused the update, or 0.
    pub context_conn_id: u32,
}

/// Notice that a connection left.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DisconnectMessage {
    /// Connection that left.
    pub conn_id: u32,
}

/// Hub reply to a spatial channel creation request.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CreateSpatialChannelsResultMessage {
    /// Ids of every spatial channel created.
    pub spatial_channel_id: Vec<u32>,
    /// Metadata of the created channels.
    pub metadata: String,
    /// Connection that owns the channels.
    pub owner_conn_id: u32,
}

/// A point in world space.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SpatialInfo {
    /// X coordinate.
    pub x: f64,
    /// Y coordinate.
    pub y: f64,
    /// Z coordinate.
    pub z: f64,
}

impl SpatialInfo {
    /// Construct a point.
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

/// Request to map points to their spatial channels.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QuerySpatialChannelMessage {
    /// Points to look up.
    pub spatial_info: Vec<SpatialInfo>,
}

/// Hub reply to [`QuerySpatialChannelMessage`], one id per queried point.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QuerySpatialChannelResultMessage {
    /// Channel ids in query order.
    pub channel_id: Vec<u32>,
}

/// Full state moving from one spatial channel to another.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChannelDataHandoverMessage {
    /// Channel the state leaves.
    pub src_channel_id: u32,
    /// Channel the state enters.
    pub dst_channel_id: u32,
    /// Connection whose entities moved.
    pub context_conn_id: u32,
    /// The handed-over state.
    pub data: AnyData,
}

/// An axis-aligned world region served by one spatial channel.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SpatialRegion {
    /// Minimum corner (inclusive).
    pub min: SpatialInfo,
    /// Maximum corner (inclusive).
    pub max: SpatialInfo,
    /// Channel serving the region.
    pub channel_id: u32,
    /// Index of the server instance that owns the region.
    pub server_index: u32,
}

impl SpatialRegion {
    /// Whether `point` lies inside the region, bounds included.
    pub fn contains(&self, point: &SpatialInfo) -> bool {
        (self.min.x..=self.max.x).contains(&point.x)
            && (self.min.y..=self.max.y).contains(&point.y)
            && (self.min.z..=self.max.z).contains(&point.z)
    }
}

/// Full replacement of the known spatial regions.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SpatialRegionsUpdateMessage {
    /// Every region.
    pub regions: Vec<SpatialRegion>,
}

/// Body of every user-space message: the original sender plus opaque bytes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServerForwardMessage {
    /// Connection the payload came from.
    pub client_conn_id: u32,
    /// Application bytes.
    pub payload: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur while encoding or decoding message bodies.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    /// Postcard (de)serialization failed.
    #[error("serialization error: {0}")]
    Postcard(#[from] postcard::Error),

    /// No parser is registered for a protocol message type.
    #[error("no parser registered for message type {0}")]
    Unregistered(u32),

    /// A packed value did not carry the expected type name.
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        /// The type name the caller asked for.
        expected: String,
        /// The type name found in the payload.
        actual: String,
    },
}

// ---------------------------------------------------------------------------
// Serialization helpers
// ---------------------------------------------------------------------------

/// Serialize a message body.
pub fn encode_body<T: Serialize + ?Sized>(msg: &T) -> Result<Vec<u8>, MessageError> {
    Ok(postcard::to_allocvec(msg)?)
}

/// Deserialize a message body.
pub fn decode_body<T: DeserializeOwned>(data: &[u8]) -> Result<T, MessageError> {
    Ok(postcard::from_bytes(data)?)
}

/// Serialize a packet payload (before compression).
pub fn encode_packet_payload(packet: &Packet) -> Result<Vec<u8>, MessageError> {
    encode_body(packet)
}

/// Deserialize a packet payload (after decompression).
pub fn decode_packet_payload(data: &[u8]) -> Result<Packet, MessageError> {
    decode_body(data)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_ids_are_stable() {
        assert_eq!(MessageType::Auth.id(), 1);
        assert_eq!(MessageType::CreateChannel.id(), 3);
        assert_eq!(MessageType::ChannelDataUpdate.id(), 8);
        assert_eq!(MessageType::SpatialRegionsUpdate.id(), 13);
        assert_eq!(MessageType::UserSpaceStart.id(), USER_SPACE_START);
    }

    #[test]
    fn test_message_type_from_id() {
        assert_eq!(MessageType::from_id(6), Some(MessageType::SubToChannel));
        assert_eq!(MessageType::from_id(2), None);
        assert_eq!(MessageType::from_id(101), None);
    }

    #[test]
    fn test_user_space_threshold() {
        assert!(!is_user_space(13));
        assert!(!is_user_space(99));
        assert!(is_user_space(100));
        assert!(is_user_space(4000));
    }

    #[test]
    fn test_channel_type_parses_name_and_number() {
        assert_eq!("Spatial".parse::<ChannelType>(), Ok(ChannelType::Spatial));
        assert_eq!("subworld".parse::<ChannelType>(), Ok(ChannelType::Subworld));
        assert_eq!("1".parse::<ChannelType>(), Ok(ChannelType::Global));
        assert!("42".parse::<ChannelType>().is_err());
        assert!("Nowhere".parse::<ChannelType>().is_err());
    }

    #[test]
    fn test_channel_type_display_roundtrip() {
        for ty in ChannelType::ALL {
            assert_eq!(ty.to_string().parse::<ChannelType>(), Ok(ty));
        }
    }

    #[test]
    fn test_broadcast_flags() {
        let flags = BroadcastType(BroadcastType::ALL.0 | BroadcastType::ALL_BUT_OWNER.0);
        assert!(flags.contains(BroadcastType::ALL));
        assert!(flags.contains(BroadcastType::ALL_BUT_OWNER));
        assert!(!flags.contains(BroadcastType::SINGLE_CONNECTION));
    }

    #[test]
    fn test_sub_options_merge_keeps_absent_fields() {
        let mut existing = ChannelSubscriptionOptions::write_access(50);
        existing.data_field_masks.push("tanks".to_string());

        let update = ChannelSubscriptionOptions {
            fan_out_delay_ms: Some(200),
            data_field_masks: vec!["tanks".to_string(), "projectiles".to_string()],
            ..Default::default()
        };
        existing.merge_from(&update);

        assert!(existing.can_update_data());
        assert_eq!(existing.fan_out_interval_ms, Some(50));
        assert_eq!(existing.fan_out_delay_ms, Some(200));
        assert_eq!(existing.data_field_masks, vec!["tanks", "projectiles"]);
    }

    #[test]
    fn test_sub_options_merge_widens_access() {
        let mut existing = ChannelSubscriptionOptions::read_access();
        assert!(!existing.can_update_data());
        existing.merge_from(&ChannelSubscriptionOptions::write_access(10));
        assert!(existing.can_update_data());
    }

    #[test]
    fn test_any_data_roundtrip_checks_type_url() {
        let msg = RemoveChannelMessage { channel_id: 9 };
        let any = AnyData::pack("test.Remove", &msg).unwrap();
        let back: RemoveChannelMessage = any.unpack("test.Remove").unwrap();
        assert_eq!(back, msg);

        let wrong = any.unpack::<RemoveChannelMessage>("test.Other");
        assert!(matches!(wrong, Err(MessageError::TypeMismatch { .. })));
    }

    #[test]
    fn test_spatial_region_contains_bounds() {
        let region = SpatialRegion {
            min: SpatialInfo::new(0.0, 0.0, 0.0),
            max: SpatialInfo::new(10.0, 10.0, 10.0),
            channel_id: 65536,
            server_index: 0,
        };
        assert!(region.contains(&SpatialInfo::new(0.0, 5.0, 10.0)));
        assert!(!region.contains(&SpatialInfo::new(10.5, 5.0, 5.0)));
    }

    #[test]
    fn test_corrupted_body_rejected() {
        let result = decode_body::<AuthResultMessage>(&[0xFF, 0xFF, 0xFF]);
        assert!(result.is_err(), "Corrupted body should fail deserialization");
    }
}
