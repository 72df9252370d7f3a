//! channeld hub client: wire framing, message dispatch, RPC correlation, and the session lifecycle.
pub mod channels;
pub mod compression;
pub mod connection;
pub mod correlation;
pub mod framing;
pub mod guard;
pub mod protocol;
pub mod registry;
pub mod rpc;
pub mod spatial;

pub use channels::{ChannelRelation, ChannelTables, SubscriptionChange};
pub use compression::{CompressionConfig, CompressionError};
pub use connection::{
    ConnectError, Connection, ConnectionConfig, ConnectionState, ConnectionStateWatch, ReplyTo,
    RpcCallback, SessionEvent, UserSpaceMessage,
};
pub use correlation::{RpcError, RpcReply};
pub use framing::{
    FrameDecoder, FrameError, HEADER_LEN, MAX_PACKET_SIZE, PacketBuilder, encode_packet,
};
pub use guard::{ConnectionFactory, RoleGuard, SessionError};
pub use protocol::{
    AnyData, BroadcastType, ChannelDataAccess, ChannelSubscriptionOptions, ChannelType,
    CompressionType, ConnectionType, GLOBAL_CHANNEL_ID, MessageError, MessagePack, MessageType,
    Packet, SpatialInfo,
};
pub use registry::{HandlerId, Message, MessageContext, MessageHandler, typed_handler};
pub use rpc::{RpcFuture, on_reply};
pub use spatial::{SpatialLookupError, SpatialRegions};
