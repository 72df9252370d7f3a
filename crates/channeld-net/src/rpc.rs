//! Typed request helpers on [`Connection`].
//!
//! Every protocol request comes in two forms: one taking an optional
//! [`RpcCallback`] (build one with [`on_reply`]) and an `_async` form
//! returning an [`RpcFuture`]. Both continuations run during
//! [`Connection::tick_incoming`], after the reply's registered handlers; an
//! `RpcFuture` therefore only completes while something keeps ticking the
//! connection.

use std::any::{Any, type_name};
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde::Serialize;
use tokio::sync::oneshot;
use tracing::warn;

use crate::connection::{Connection, ReplyTo, RpcCallback};
use crate::correlation::{RpcError, RpcReply};
use crate::protocol::{
    AnyData, AuthMessage, AuthResultMessage, BroadcastType, ChannelDataMergeOptions,
    ChannelSubscriptionOptions, ChannelType, CreateChannelMessage, CreateChannelResultMessage,
    CreateSpatialChannelsResultMessage, GLOBAL_CHANNEL_ID, ListChannelMessage,
    ListChannelResultMessage, MessageError, MessageType, QuerySpatialChannelMessage,
    QuerySpatialChannelResultMessage, RemoveChannelMessage, SpatialInfo,
    SubscribedToChannelMessage, SubscribedToChannelResultMessage,
    UnsubscribedFromChannelMessage, UnsubscribedFromChannelResultMessage,
};
use crate::registry::MessageContext;

/// Wrap a closure over the concrete reply type as an [`RpcCallback`].
pub fn on_reply<R, F>(f: F) -> RpcCallback
where
    R: 'static,
    F: FnOnce(&mut Connection, &R) + Send + 'static,
{
    Box::new(move |conn: &mut Connection, ctx: &MessageContext, msg: &dyn Any| {
        match msg.downcast_ref::<R>() {
            Some(reply) => f(conn, reply),
            None => warn!(
                "RPC stub {} replied with message type {}, expected {}",
                ctx.stub_id,
                ctx.msg_type,
                type_name::<R>()
            ),
        }
    })
}

/// Resolves to the typed reply of one request.
#[must_use = "an RpcFuture does nothing unless awaited"]
pub struct RpcFuture<R> {
    rx: oneshot::Receiver<RpcReply>,
    _reply: PhantomData<fn() -> R>,
}

impl<R> RpcFuture<R> {
    fn new(rx: oneshot::Receiver<RpcReply>) -> Self {
        Self {
            rx,
            _reply: PhantomData,
        }
    }
}

impl<R: Any> Future for RpcFuture<R> {
    type Output = Result<R, RpcError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let reply = match Pin::new(&mut self.rx).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(_)) => Err(RpcError::Disconnected),
            Poll::Ready(Ok(reply)) => reply,
        };
        Poll::Ready(reply.and_then(|msg| {
            msg.downcast::<R>()
                .map(|boxed| *boxed)
                .map_err(|_| RpcError::UnexpectedReply(type_name::<R>()))
        }))
    }
}

impl Connection {
    fn request<T: Serialize>(
        &mut self,
        channel_id: u32,
        msg_type: MessageType,
        msg: &T,
        callback: Option<RpcCallback>,
    ) -> Result<u32, MessageError> {
        let reply = ReplyTo {
            callback,
            waiter: None,
        };
        self.send_with(channel_id, msg_type.id(), msg, BroadcastType::NO_BROADCAST, reply)
    }

    fn request_async<T: Serialize, R>(
        &mut self,
        channel_id: u32,
        msg_type: MessageType,
        msg: &T,
    ) -> Result<RpcFuture<R>, MessageError> {
        let (tx, rx) = oneshot::channel();
        let reply = ReplyTo {
            callback: None,
            waiter: Some(tx),
        };
        self.send_with(channel_id, msg_type.id(), msg, BroadcastType::NO_BROADCAST, reply)?;
        Ok(RpcFuture::new(rx))
    }

    // ----- Authentication -----

    /// Send credentials. The built-in handler records the assigned id.
    pub fn auth(
        &mut self,
        player_identifier_token: &str,
        login_token: &str,
        callback: Option<RpcCallback>,
    ) -> Result<u32, MessageError> {
        let msg = auth_message(player_identifier_token, login_token);
        self.request(GLOBAL_CHANNEL_ID, MessageType::Auth, &msg, callback)
    }

    /// Awaitable form of [`auth`](Self::auth).
    pub fn auth_async(
        &mut self,
        player_identifier_token: &str,
        login_token: &str,
    ) -> Result<RpcFuture<AuthResultMessage>, MessageError> {
        let msg = auth_message(player_identifier_token, login_token);
        self.request_async(GLOBAL_CHANNEL_ID, MessageType::Auth, &msg)
    }

    // ----- Channel lifecycle -----

    /// Ask the hub to create a channel.
    pub fn create_channel(
        &mut self,
        channel_type: ChannelType,
        metadata: &str,
        sub_options: Option<ChannelSubscriptionOptions>,
        data: Option<AnyData>,
        merge_options: Option<ChannelDataMergeOptions>,
        callback: Option<RpcCallback>,
    ) -> Result<u32, MessageError> {
        let msg = CreateChannelMessage {
            channel_type,
            metadata: metadata.to_string(),
            sub_options,
            data,
            merge_options,
        };
        self.request(GLOBAL_CHANNEL_ID, MessageType::CreateChannel, &msg, callback)
    }

    /// Awaitable form of [`create_channel`](Self::create_channel).
    pub fn create_channel_async(
        &mut self,
        channel_type: ChannelType,
        metadata: &str,
        sub_options: Option<ChannelSubscriptionOptions>,
        data: Option<AnyData>,
        merge_options: Option<ChannelDataMergeOptions>,
    ) -> Result<RpcFuture<CreateChannelResultMessage>, MessageError> {
        let msg = CreateChannelMessage {
            channel_type,
            metadata: metadata.to_string(),
            sub_options,
            data,
            merge_options,
        };
        self.request_async(GLOBAL_CHANNEL_ID, MessageType::CreateChannel, &msg)
    }

    /// Ask the hub to create the spatial channels this server owns.
    ///
    /// The reply is a [`CreateSpatialChannelsResultMessage`].
    pub fn create_spatial_channel(
        &mut self,
        metadata: &str,
        sub_options: Option<ChannelSubscriptionOptions>,
        data: Option<AnyData>,
        merge_options: Option<ChannelDataMergeOptions>,
        callback: Option<RpcCallback>,
    ) -> Result<u32, MessageError> {
        self.create_channel(ChannelType::Spatial, metadata, sub_options, data, merge_options, callback)
    }

    /// Awaitable form of [`create_spatial_channel`](Self::create_spatial_channel).
    pub fn create_spatial_channel_async(
        &mut self,
        metadata: &str,
        sub_options: Option<ChannelSubscriptionOptions>,
        data: Option<AnyData>,
        merge_options: Option<ChannelDataMergeOptions>,
    ) -> Result<RpcFuture<CreateSpatialChannelsResultMessage>, MessageError> {
        let msg = CreateChannelMessage {
            channel_type: ChannelType::Spatial,
            metadata: metadata.to_string(),
            sub_options,
            data,
            merge_options,
        };
        self.request_async(GLOBAL_CHANNEL_ID, MessageType::CreateChannel, &msg)
    }

    /// Ask the hub to remove a channel.
    pub fn remove_channel(
        &mut self,
        channel_id: u32,
        callback: Option<RpcCallback>,
    ) -> Result<u32, MessageError> {
        let msg = RemoveChannelMessage { channel_id };
        self.request(GLOBAL_CHANNEL_ID, MessageType::RemoveChannel, &msg, callback)
    }

    /// Awaitable form of [`remove_channel`](Self::remove_channel).
    pub fn remove_channel_async(
        &mut self,
        channel_id: u32,
    ) -> Result<RpcFuture<RemoveChannelMessage>, MessageError> {
        let msg = RemoveChannelMessage { channel_id };
        self.request_async(GLOBAL_CHANNEL_ID, MessageType::RemoveChannel, &msg)
    }

    /// List channels. [`ChannelType::Unknown`] matches every type.
    pub fn list_channel(
        &mut self,
        type_filter: ChannelType,
        metadata_filters: &[&str],
        callback: Option<RpcCallback>,
    ) -> Result<u32, MessageError> {
        let msg = list_message(type_filter, metadata_filters);
        self.request(GLOBAL_CHANNEL_ID, MessageType::ListChannel, &msg, callback)
    }

    /// Awaitable form of [`list_channel`](Self::list_channel).
    pub fn list_channel_async(
        &mut self,
        type_filter: ChannelType,
        metadata_filters: &[&str],
    ) -> Result<RpcFuture<ListChannelResultMessage>, MessageError> {
        let msg = list_message(type_filter, metadata_filters);
        self.request_async(GLOBAL_CHANNEL_ID, MessageType::ListChannel, &msg)
    }

    // ----- Subscriptions -----

    /// Subscribe this connection to `channel_id`.
    pub fn sub_to_channel(
        &mut self,
        channel_id: u32,
        options: Option<ChannelSubscriptionOptions>,
        callback: Option<RpcCallback>,
    ) -> Result<u32, MessageError> {
        self.sub_connection_to_channel(self.id(), channel_id, options, callback)
    }

    /// Awaitable form of [`sub_to_channel`](Self::sub_to_channel).
    pub fn sub_to_channel_async(
        &mut self,
        channel_id: u32,
        options: Option<ChannelSubscriptionOptions>,
    ) -> Result<RpcFuture<SubscribedToChannelResultMessage>, MessageError> {
        self.sub_connection_to_channel_async(self.id(), channel_id, options)
    }

    /// Subscribe another connection. Only the channel owner (or anyone on the
    /// global channel) may do so.
    pub fn sub_connection_to_channel(
        &mut self,
        conn_id: u32,
        channel_id: u32,
        options: Option<ChannelSubscriptionOptions>,
        callback: Option<RpcCallback>,
    ) -> Result<u32, MessageError> {
        let msg = SubscribedToChannelMessage {
            conn_id,
            sub_options: options,
        };
        if conn_id == self.id() {
            self.mark_subscribing(channel_id);
        }
        self.request(channel_id, MessageType::SubToChannel, &msg, callback)
    }

    /// Awaitable form of [`sub_connection_to_channel`](Self::sub_connection_to_channel).
    pub fn sub_connection_to_channel_async(
        &mut self,
        conn_id: u32,
        channel_id: u32,
        options: Option<ChannelSubscriptionOptions>,
    ) -> Result<RpcFuture<SubscribedToChannelResultMessage>, MessageError> {
        let msg = SubscribedToChannelMessage {
            conn_id,
            sub_options: options,
        };
        if conn_id == self.id() {
            self.mark_subscribing(channel_id);
        }
        self.request_async(channel_id, MessageType::SubToChannel, &msg)
    }

    /// Unsubscribe this connection from `channel_id`.
    pub fn unsub_from_channel(
        &mut self,
        channel_id: u32,
        callback: Option<RpcCallback>,
    ) -> Result<u32, MessageError> {
        self.unsub_connection_from_channel(self.id(), channel_id, callback)
    }

    /// Awaitable form of [`unsub_from_channel`](Self::unsub_from_channel).
    pub fn unsub_from_channel_async(
        &mut self,
        channel_id: u32,
    ) -> Result<RpcFuture<UnsubscribedFromChannelResultMessage>, MessageError> {
        self.unsub_connection_from_channel_async(self.id(), channel_id)
    }

    /// Unsubscribe another connection. Only the channel owner (or anyone on
    /// the global channel) may do so.
    pub fn unsub_connection_from_channel(
        &mut self,
        conn_id: u32,
        channel_id: u32,
        callback: Option<RpcCallback>,
    ) -> Result<u32, MessageError> {
        let msg = UnsubscribedFromChannelMessage { conn_id };
        self.request(channel_id, MessageType::UnsubFromChannel, &msg, callback)
    }

    /// Awaitable form of
    /// [`unsub_connection_from_channel`](Self::unsub_connection_from_channel).
    pub fn unsub_connection_from_channel_async(
        &mut self,
        conn_id: u32,
        channel_id: u32,
    ) -> Result<RpcFuture<UnsubscribedFromChannelResultMessage>, MessageError> {
        let msg = UnsubscribedFromChannelMessage { conn_id };
        self.request_async(channel_id, MessageType::UnsubFromChannel, &msg)
    }

    // ----- Spatial -----

    /// Ask which spatial channel serves each point.
    pub fn query_spatial_channel(
        &mut self,
        points: &[SpatialInfo],
        callback: Option<RpcCallback>,
    ) -> Result<u32, MessageError> {
        let msg = QuerySpatialChannelMessage {
            spatial_info: points.to_vec(),
        };
        self.request(GLOBAL_CHANNEL_ID, MessageType::QuerySpatialChannel, &msg, callback)
    }

    /// Awaitable form of [`query_spatial_channel`](Self::query_spatial_channel).
    pub fn query_spatial_channel_async(
        &mut self,
        points: &[SpatialInfo],
    ) -> Result<RpcFuture<QuerySpatialChannelResultMessage>, MessageError> {
        let msg = QuerySpatialChannelMessage {
            spatial_info: points.to_vec(),
        };
        self.request_async(GLOBAL_CHANNEL_ID, MessageType::QuerySpatialChannel, &msg)
    }
}

fn auth_message(player_identifier_token: &str, login_token: &str) -> AuthMessage {
    AuthMessage {
        player_identifier_token: player_identifier_token.to_string(),
        login_token: login_token.to_string(),
    }
}

fn list_message(type_filter: ChannelType, metadata_filters: &[&str]) -> ListChannelMessage {
    ListChannelMessage {
        type_filter,
        metadata_filters: metadata_filters.iter().map(|s| s.to_string()).collect(),
    }
}
