//! The hub session: socket, background receive loop, queues, and channel
//! bookkeeping.
//!
//! A [`Connection`] is driven from the game loop. [`Connection::connect`] is
//! the only operation that suspends; afterwards a background task reassembles
//! frames into an inbound queue and a writer task drains encoded packets to the
//! socket. [`Connection::tick`] runs handlers for everything received since the
//! last tick and flushes everything queued for sending as one packet.
//!
//! State changes are broadcast via a [`watch`] channel so any number of
//! consumers can react without polling.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::channels::{ChannelTables, SubscriptionChange};
use crate::compression::CompressionConfig;
use crate::correlation::{RpcError, RpcReply, StubTable};
use crate::framing::{self, FrameDecoder, MAX_PACKET_SIZE, PacketBuilder};
use crate::guard::RoleGuard;
use crate::protocol::{
    self, AuthResult, AuthResultMessage, BroadcastType, ChannelDataHandoverMessage,
    ChannelDataUpdateMessage, ChannelType, CompressionType, ConnectionType,
    CreateChannelResultMessage, CreateSpatialChannelsResultMessage, DisconnectMessage,
    GLOBAL_CHANNEL_ID, ListChannelResultMessage, MessageError, MessagePack, MessageType,
    QuerySpatialChannelResultMessage, RemoveChannelMessage, ServerForwardMessage, SpatialInfo,
    SpatialRegionsUpdateMessage, SubscribedToChannelResultMessage,
    UnsubscribedFromChannelResultMessage,
};
use crate::registry::{HandlerId, Message, MessageContext, MessageHandler, MessageRegistry, Parsed, typed_handler};
use crate::spatial::SpatialRegions;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket.
    Disconnected,
    /// Attempting to establish a TCP connection.
    Connecting,
    /// TCP connection established, not yet authenticated.
    Connected,
    /// The hub accepted our credentials and assigned an id.
    Authenticated,
}

/// Observable connection state backed by a [`watch`] channel.
///
/// Multiple subscribers can observe state transitions without polling.
pub struct ConnectionStateWatch {
    tx: watch::Sender<ConnectionState>,
    rx: watch::Receiver<ConnectionState>,
}

impl Default for ConnectionStateWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateWatch {
    /// Create a new watch initialized to [`ConnectionState::Disconnected`].
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(ConnectionState::Disconnected);
        Self { tx, rx }
    }

    /// Set the current connection state, notifying all subscribers.
    pub fn set(&self, state: ConnectionState) {
        let _ = self.tx.send(state);
    }

    /// Return a new subscriber receiver.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.rx.clone()
    }

    /// Return the current state without blocking.
    pub fn current(&self) -> ConnectionState {
        *self.rx.borrow()
    }
}

// ---------------------------------------------------------------------------
// Config, events, errors
// ---------------------------------------------------------------------------

/// Settings for one hub connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// How long [`Connection::connect`] waits for the TCP handshake. Default: 3 s.
    pub connect_timeout: Duration,
    /// Compression used until the hub negotiates one during authentication.
    pub compression: CompressionType,
    /// Payloads smaller than this are never compressed. Default: 256.
    pub compression_threshold: usize,
    /// Fail RPCs whose reply has not arrived after this long. Default: never.
    pub rpc_timeout: Option<Duration>,
    /// Largest packet payload sent or accepted. Default: [`MAX_PACKET_SIZE`].
    pub max_packet_size: usize,
    /// Log user-space traffic at debug level.
    pub show_user_space_log: bool,
    /// Channel type used to pick the default send channel.
    pub default_channel_type: Option<ChannelType>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(3000),
            compression: CompressionType::NoCompression,
            compression_threshold: CompressionConfig::default().threshold,
            rpc_timeout: None,
            max_packet_size: MAX_PACKET_SIZE,
            show_user_space_log: false,
            default_channel_type: None,
        }
    }
}

/// Events the owning layer should react to, drained with
/// [`Connection::poll_events`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The socket closed or failed.
    Disconnected,
    /// The hub rejected our credentials.
    AuthFailed(AuthResult),
}

/// Errors that can occur while connecting.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// The TCP handshake did not complete in time.
    #[error("connect timed out after {0:?}")]
    TimedOut(Duration),

    /// The connection already has a live socket.
    #[error("already connected")]
    AlreadyConnected,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Callback-style RPC continuation; runs after the reply's handlers.
pub type RpcCallback = Box<dyn FnOnce(&mut Connection, &MessageContext, &dyn Any) + Send>;

/// Continuations attached to an outbound request.
#[derive(Default)]
pub struct ReplyTo {
    /// Invoked with the reply during [`Connection::tick_incoming`].
    pub callback: Option<RpcCallback>,
    /// Completed with the reply during [`Connection::tick_incoming`].
    pub waiter: Option<oneshot::Sender<RpcReply>>,
}

impl ReplyTo {
    /// No reply expected.
    pub fn none() -> Self {
        Self::default()
    }

    /// Reply delivered to `callback`.
    pub fn callback(callback: RpcCallback) -> Self {
        Self {
            callback: Some(callback),
            waiter: None,
        }
    }
}

/// A user-space message with no registered parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSpaceMessage {
    /// Channel the message arrived on.
    pub channel_id: u32,
    /// Application message type.
    pub msg_type: u32,
    /// Connection the payload originally came from.
    pub client_conn_id: u32,
    /// Opaque application bytes.
    pub payload: Vec<u8>,
}

type UserSpaceHandler = Box<dyn Fn(&UserSpaceMessage) + Send + Sync>;

struct Link {
    writer_tx: mpsc::UnboundedSender<Vec<u8>>,
    shutdown_tx: watch::Sender<bool>,
    alive: Arc<AtomicBool>,
}

impl Link {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// A session with the hub.
pub struct Connection {
    guard: RoleGuard,
    config: ConnectionConfig,
    id: u32,
    compression: CompressionType,
    compression_config: CompressionConfig,
    remote: Option<(String, u16)>,
    state: Arc<ConnectionStateWatch>,

    tables: ChannelTables,
    spatial: SpatialRegions,
    default_channel: Option<u32>,

    registry: MessageRegistry<Connection>,
    user_space_handler: Option<UserSpaceHandler>,
    stubs: StubTable<RpcCallback>,

    incoming_tx: Sender<MessagePack>,
    incoming_rx: Receiver<MessagePack>,
    outgoing_tx: Sender<MessagePack>,
    outgoing_rx: Receiver<MessagePack>,
    carry_over: Option<MessagePack>,
    events_tx: Sender<SessionEvent>,
    events_rx: Receiver<SessionEvent>,

    link: Option<Link>,
    generation: Arc<AtomicU64>,
}

impl Connection {
    /// Create a disconnected connection holding `guard`'s role.
    ///
    /// Use [`ConnectionFactory`](crate::guard::ConnectionFactory) to obtain one.
    pub(crate) fn new(guard: RoleGuard, config: ConnectionConfig) -> Self {
        let (incoming_tx, incoming_rx) = unbounded();
        let (outgoing_tx, outgoing_rx) = unbounded();
        let (events_tx, events_rx) = unbounded();

        let mut conn = Self {
            guard,
            compression: config.compression,
            compression_config: CompressionConfig {
                threshold: config.compression_threshold,
            },
            config,
            id: 0,
            remote: None,
            state: Arc::new(ConnectionStateWatch::new()),
            tables: ChannelTables::new(),
            spatial: SpatialRegions::new(),
            default_channel: None,
            registry: MessageRegistry::new(),
            user_space_handler: None,
            stubs: StubTable::new(),
            incoming_tx,
            incoming_rx,
            outgoing_tx,
            outgoing_rx,
            carry_over: None,
            events_tx,
            events_rx,
            link: None,
            generation: Arc::new(AtomicU64::new(0)),
        };
        conn.register_builtin_handlers();
        conn
    }

    fn register_builtin_handlers(&mut self) {
        let r = &mut self.registry;
        r.register_with::<AuthResultMessage, _>(
            MessageType::Auth.id(),
            typed_handler(Self::handle_auth),
        );
        r.register_with::<CreateChannelResultMessage, _>(
            MessageType::CreateChannel.id(),
            typed_handler(Self::handle_create_channel),
        );
        r.register_with::<RemoveChannelMessage, _>(
            MessageType::RemoveChannel.id(),
            typed_handler(Self::handle_remove_channel),
        );
        r.register_with::<ListChannelResultMessage, _>(
            MessageType::ListChannel.id(),
            typed_handler(Self::handle_list_channel),
        );
        r.register_with::<SubscribedToChannelResultMessage, _>(
            MessageType::SubToChannel.id(),
            typed_handler(Self::handle_sub_to_channel),
        );
        r.register_with::<UnsubscribedFromChannelResultMessage, _>(
            MessageType::UnsubFromChannel.id(),
            typed_handler(Self::handle_unsub_from_channel),
        );
        r.register_with::<CreateSpatialChannelsResultMessage, _>(
            MessageType::CreateSpatialChannel.id(),
            typed_handler(Self::handle_create_spatial_channel),
        );
        r.register_with::<SpatialRegionsUpdateMessage, _>(
            MessageType::SpatialRegionsUpdate.id(),
            typed_handler(Self::handle_spatial_regions_update),
        );
        r.register::<ChannelDataUpdateMessage>(MessageType::ChannelDataUpdate.id());
        r.register::<DisconnectMessage>(MessageType::Disconnect.id());
        r.register::<QuerySpatialChannelResultMessage>(MessageType::QuerySpatialChannel.id());
        r.register::<ChannelDataHandoverMessage>(MessageType::ChannelDataHandover.id());
    }

    // ----- Accessors -----

    /// Hub-assigned id; 0 until authenticated.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Role this connection plays.
    pub fn connection_type(&self) -> ConnectionType {
        self.guard.role()
    }

    /// Compression currently applied to outbound packets.
    pub fn compression(&self) -> CompressionType {
        self.compression
    }

    /// Host and port of the last connect attempt.
    pub fn remote(&self) -> Option<(&str, u16)> {
        self.remote.as_ref().map(|(h, p)| (h.as_str(), *p))
    }

    /// Settings this connection was created with.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Return the connection state watch.
    pub fn state(&self) -> &Arc<ConnectionStateWatch> {
        &self.state
    }

    /// Whether a socket is open.
    pub fn is_connected(&self) -> bool {
        matches!(
            self.state.current(),
            ConnectionState::Connected | ConnectionState::Authenticated
        )
    }

    /// Whether the hub has assigned an id.
    pub fn is_authenticated(&self) -> bool {
        self.id != 0 && self.state.current() == ConnectionState::Authenticated
    }

    /// Subscription, ownership, and listing tables.
    pub fn channels(&self) -> &ChannelTables {
        &self.tables
    }

    /// Spatial regions pushed by the hub.
    pub fn spatial_regions(&self) -> &SpatialRegions {
        &self.spatial
    }

    /// Channel whose spatial region contains `point`, or the global channel.
    pub fn spatial_channel_at(&self, point: &SpatialInfo) -> u32 {
        self.spatial.channel_at(point)
    }

    /// Channel used when a send has no explicit target.
    pub fn default_channel_id(&self) -> u32 {
        self.default_channel.unwrap_or(GLOBAL_CHANNEL_ID)
    }

    /// Override the default send channel.
    pub fn set_default_channel(&mut self, channel_id: Option<u32>) {
        self.default_channel = channel_id;
    }

    pub(crate) fn mark_subscribing(&mut self, channel_id: u32) {
        self.tables.mark_subscribing(channel_id);
    }

    /// Number of requests still waiting for a reply.
    pub fn pending_rpc_count(&self) -> usize {
        self.stubs.len()
    }

    /// Drain session events raised since the last call.
    pub fn poll_events(&self) -> Vec<SessionEvent> {
        self.events_rx.try_iter().collect()
    }

    // ----- Handlers -----

    /// Register `T` as the body type of `msg_type`, dropping existing handlers.
    pub fn register_message<T>(&mut self, msg_type: u32)
    where
        T: serde::de::DeserializeOwned + Send + 'static,
    {
        self.registry.register::<T>(msg_type);
    }

    /// Register `T` for `msg_type` with a single handler.
    pub fn register_message_with<T, H>(&mut self, msg_type: u32, handler: H) -> HandlerId
    where
        T: serde::de::DeserializeOwned + Send + 'static,
        H: MessageHandler<Connection> + 'static,
    {
        self.registry.register_with::<T, H>(msg_type, handler)
    }

    /// Append a handler to a registered message type.
    pub fn add_handler<H>(&mut self, msg_type: u32, handler: H) -> Result<HandlerId, MessageError>
    where
        H: MessageHandler<Connection> + 'static,
    {
        self.registry.add_handler(msg_type, handler)
    }

    /// Detach a handler.
    pub fn remove_handler(&mut self, msg_type: u32, id: HandlerId) -> bool {
        self.registry.remove_handler(msg_type, id)
    }

    /// Handler for registered types without handlers of their own.
    pub fn set_default_handler<H>(&mut self, handler: H)
    where
        H: MessageHandler<Connection> + 'static,
    {
        self.registry.set_default_handler(handler);
    }

    /// Receiver for user-space messages that have no registered parser.
    pub fn set_user_space_handler<F>(&mut self, handler: F)
    where
        F: Fn(&UserSpaceMessage) + Send + Sync + 'static,
    {
        self.user_space_handler = Some(Box::new(handler));
    }

    // ----- Connect / disconnect -----

    /// Open the socket and start the background tasks.
    pub async fn connect(&mut self, host: &str, port: u16) -> Result<(), ConnectError> {
        if self.is_connected() {
            return Err(ConnectError::AlreadyConnected);
        }
        if self.link.is_some() {
            self.teardown();
        }

        self.remote = Some((host.to_string(), port));
        self.state.set(ConnectionState::Connecting);

        let timeout = self.config.connect_timeout;
        let stream = match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.state.set(ConnectionState::Disconnected);
                return Err(ConnectError::Io(e));
            }
            Err(_) => {
                self.state.set(ConnectionState::Disconnected);
                return Err(ConnectError::TimedOut(timeout));
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            self.state.set(ConnectionState::Disconnected);
            return Err(ConnectError::Io(e));
        }

        self.start_link(stream);
        info!("Connected to hub at {}:{}", host, port);
        Ok(())
    }

    /// Connect, then run exactly one of the continuations.
    ///
    /// `on_timeout` runs when the handshake times out; other failures are
    /// returned without running either.
    pub async fn connect_with<C, T>(
        &mut self,
        host: &str,
        port: u16,
        on_connected: C,
        on_timeout: T,
    ) -> Result<(), ConnectError>
    where
        C: FnOnce(&mut Connection),
        T: FnOnce(&mut Connection),
    {
        match self.connect(host, port).await {
            Ok(()) => {
                on_connected(self);
                Ok(())
            }
            Err(e @ ConnectError::TimedOut(_)) => {
                warn!("Connecting to {}:{} failed: {}", host, port, e);
                on_timeout(self);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn start_link(&mut self, stream: TcpStream) {
        let (reader, writer) = stream.into_split();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let alive = Arc::new(AtomicBool::new(true));

        self.state.set(ConnectionState::Connected);

        let reader_task = ReaderTask {
            incoming: self.incoming_tx.clone(),
            events: self.events_tx.clone(),
            state: Arc::clone(&self.state),
            alive: Arc::clone(&alive),
            generation: Arc::clone(&self.generation),
            my_generation: generation,
            decoder: FrameDecoder::new(self.config.max_packet_size),
            show_user_space_log: self.config.show_user_space_log,
        };
        tokio::spawn(reader_task.run(reader, shutdown_rx));
        tokio::spawn(write_loop(writer, writer_rx));

        self.link = Some(Link {
            writer_tx,
            shutdown_tx,
            alive,
        });
    }

    /// Close the socket and clear the session.
    ///
    /// With `flush_all`, everything queued is sent first. Subscriptions,
    /// ownership, and the id are always cleared so the connection can be
    /// reused.
    pub fn disconnect(&mut self, flush_all: bool) {
        if flush_all && self.link.is_some() {
            while self.tick_outgoing() > 0 {}
        }
        self.teardown();
    }

    fn teardown(&mut self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(link) = self.link.take() {
            let _ = link.shutdown_tx.send(true);
            // Dropping the sender lets the writer drain and close the socket.
            drop(link.writer_tx);
            info!("Disconnected from hub");
        }
        self.state.set(ConnectionState::Disconnected);

        self.id = 0;
        self.compression = self.config.compression;
        self.tables.clear();
        self.spatial.clear();
        self.default_channel = None;
        self.carry_over = None;
        while self.incoming_rx.try_recv().is_ok() {}
        while self.outgoing_rx.try_recv().is_ok() {}
        for pending in self.stubs.abandon_all() {
            pending.fail(RpcError::Disconnected);
        }
    }

    // ----- Sending -----

    /// Queue a pre-serialized body.
    pub fn send_raw(&mut self, channel_id: u32, msg_type: u32, body: Vec<u8>, broadcast: BroadcastType) {
        self.send_raw_with(channel_id, msg_type, body, broadcast, ReplyTo::none());
    }

    /// Queue a pre-serialized body with reply continuations. Returns the stub id.
    pub fn send_raw_with(
        &mut self,
        channel_id: u32,
        msg_type: u32,
        body: Vec<u8>,
        broadcast: BroadcastType,
        reply: ReplyTo,
    ) -> u32 {
        let stub_id = self.stubs.allocate(reply.callback, reply.waiter);
        if !protocol::is_user_space(msg_type) || self.config.show_user_space_log {
            debug!(
                "Send message(channel_id={}, stub_id={}, type={}, body_size={})",
                channel_id,
                stub_id,
                msg_type,
                body.len()
            );
        }

        let msg = MessagePack {
            channel_id,
            broadcast: broadcast.0,
            stub_id,
            msg_type,
            msg_body: body,
        };
        // Both ends live in `self`, so the queue cannot be disconnected.
        let _ = self.outgoing_tx.send(msg);
        stub_id
    }

    /// Serialize and queue a message.
    pub fn send<T: Serialize + ?Sized>(
        &mut self,
        channel_id: u32,
        msg_type: u32,
        msg: &T,
        broadcast: BroadcastType,
    ) -> Result<(), MessageError> {
        self.send_with(channel_id, msg_type, msg, broadcast, ReplyTo::none())
            .map(|_| ())
    }

    /// Serialize and queue a message with reply continuations. Returns the
    /// stub id.
    pub fn send_with<T: Serialize + ?Sized>(
        &mut self,
        channel_id: u32,
        msg_type: u32,
        msg: &T,
        broadcast: BroadcastType,
        reply: ReplyTo,
    ) -> Result<u32, MessageError> {
        let body = protocol::encode_body(msg)?;
        Ok(self.send_raw_with(channel_id, msg_type, body, broadcast, reply))
    }

    /// Number of messages waiting for the next flush.
    pub fn queued_len(&self) -> usize {
        self.outgoing_rx.len() + usize::from(self.carry_over.is_some())
    }

    // ----- Tick -----

    /// Drain inbound then outbound queues.
    pub fn tick(&mut self) {
        self.tick_incoming();
        self.tick_outgoing();
    }

    /// Run handlers and RPC continuations for everything received so far.
    ///
    /// Returns the number of envelopes processed. Never blocks.
    pub fn tick_incoming(&mut self) -> usize {
        let mut processed = 0;
        while let Ok(msg) = self.incoming_rx.try_recv() {
            self.dispatch(msg);
            processed += 1;
        }

        if let Some(timeout) = self.config.rpc_timeout {
            for (stub_id, pending) in self.stubs.expire(timeout) {
                warn!("RPC stub {} got no reply within {:?}", stub_id, timeout);
                pending.fail(RpcError::TimedOut(stub_id));
            }
        }

        if self.link.as_ref().is_some_and(|link| !link.is_alive()) {
            warn!("Connection to hub lost");
            self.teardown();
        }
        processed
    }

    /// Send everything queued as one packet (bounded by the max packet size).
    ///
    /// Returns the number of envelopes written.
    pub fn tick_outgoing(&mut self) -> usize {
        if self.link.is_none() || !self.is_connected() {
            return 0;
        }

        let mut builder = PacketBuilder::new(self.config.max_packet_size);
        loop {
            let next = match self.carry_over.take() {
                Some(msg) => msg,
                None => match self.outgoing_rx.try_recv() {
                    Ok(msg) => msg,
                    Err(_) => break,
                },
            };
            if let Some(rejected) = builder.try_push(next) {
                if builder.is_empty() {
                    error!(
                        "Dropping message type {} on channel {}: {} bytes never fit in a packet",
                        rejected.msg_type,
                        rejected.channel_id,
                        rejected.msg_body.len()
                    );
                    continue;
                }
                self.carry_over = Some(rejected);
                break;
            }
        }

        if builder.is_empty() {
            return 0;
        }
        let count = builder.len();
        let packet = builder.finish();
        let bytes = match framing::encode_packet(&packet, self.compression, &self.compression_config) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to encode packet: {}", e);
                return 0;
            }
        };
        if let Some(link) = &self.link {
            if link.writer_tx.send(bytes).is_err() {
                warn!("Writer task has stopped, dropping {} messages", count);
                return 0;
            }
        }
        count
    }

    fn dispatch(&mut self, envelope: MessagePack) {
        let ctx = MessageContext {
            channel_id: envelope.channel_id,
            broadcast: envelope.broadcast,
            stub_id: envelope.stub_id,
            msg_type: envelope.msg_type,
        };

        match self.registry.parse(envelope.msg_type, &envelope.msg_body) {
            Ok(Parsed::Known(msg)) => {
                for handler in self.registry.handlers_for(ctx.msg_type) {
                    handler.handle(self, &ctx, msg.as_ref());
                }
                self.resolve_rpc(&ctx, msg);
            }
            Ok(Parsed::UserSpace(fwd)) => self.forward_user_space(&ctx, fwd),
            Err(MessageError::Unregistered(msg_type)) => {
                error!("No parser registered for message type {}", msg_type);
            }
            Err(e) => {
                error!(
                    "Failed to parse message type {} on channel {}: {}",
                    ctx.msg_type, ctx.channel_id, e
                );
            }
        }
    }

    fn resolve_rpc(&mut self, ctx: &MessageContext, msg: Message) {
        let Some(pending) = self.stubs.resolve(ctx.stub_id) else {
            return;
        };
        debug!("Handling RPC reply type {}, stub_id {}", ctx.msg_type, ctx.stub_id);
        if let Some(callback) = pending.callback {
            callback(self, ctx, msg.as_ref());
        }
        if let Some(waiter) = pending.waiter {
            let _ = waiter.send(Ok(msg));
        }
    }

    fn forward_user_space(&mut self, ctx: &MessageContext, fwd: ServerForwardMessage) {
        let msg = UserSpaceMessage {
            channel_id: ctx.channel_id,
            msg_type: ctx.msg_type,
            client_conn_id: fwd.client_conn_id,
            payload: fwd.payload,
        };
        match &self.user_space_handler {
            Some(handler) => handler(&msg),
            None => warn!(
                "No handler for user-space message type {}, channel_id={}, client conn_id={}",
                msg.msg_type, msg.channel_id, msg.client_conn_id
            ),
        }
    }

    // ----- Built-in handlers -----

    fn handle_auth(&mut self, _ctx: &MessageContext, msg: &AuthResultMessage) {
        if msg.result != AuthResult::Successful {
            error!("Authentication failed: {:?}", msg.result);
            let _ = self.events_tx.send(SessionEvent::AuthFailed(msg.result));
            return;
        }
        if self.id != 0 {
            if self.id != msg.conn_id {
                warn!("Ignoring auth result for conn {}, already authenticated as {}", msg.conn_id, self.id);
            }
            return;
        }

        self.id = msg.conn_id;
        self.compression = msg.compression_type;
        if self.link.as_ref().is_none_or(Link::is_alive) {
            self.state.set(ConnectionState::Authenticated);
        }
        info!("Authenticated as conn {} ({:?})", self.id, self.compression);
    }

    fn handle_create_channel(&mut self, ctx: &MessageContext, msg: &CreateChannelResultMessage) {
        let channel_id = if msg.channel_id != 0 { msg.channel_id } else { ctx.channel_id };
        if self.tables.record_created(channel_id, msg, self.id) {
            info!("Created {} channel {}", msg.channel_type, channel_id);
            self.adopt_owned_default(channel_id, msg.channel_type);
        }
    }

    fn handle_create_spatial_channel(
        &mut self,
        _ctx: &MessageContext,
        msg: &CreateSpatialChannelsResultMessage,
    ) {
        for &channel_id in &msg.spatial_channel_id {
            let result = CreateChannelResultMessage {
                channel_type: ChannelType::Spatial,
                metadata: msg.metadata.clone(),
                owner_conn_id: msg.owner_conn_id,
                channel_id,
            };
            if self.tables.record_created(channel_id, &result, self.id) {
                self.adopt_owned_default(channel_id, ChannelType::Spatial);
            }
        }
    }

    fn handle_remove_channel(&mut self, _ctx: &MessageContext, msg: &RemoveChannelMessage) {
        self.tables.purge(msg.channel_id);
        self.drop_default(msg.channel_id);
        debug!("Channel {} removed", msg.channel_id);
    }

    fn handle_list_channel(&mut self, _ctx: &MessageContext, msg: &ListChannelResultMessage) {
        self.tables.record_listed(&msg.channels);
    }

    fn handle_sub_to_channel(&mut self, ctx: &MessageContext, msg: &SubscribedToChannelResultMessage) {
        if self.id == 0 || msg.conn_id != self.id {
            debug!("Conn {} subscribed to channel {}", msg.conn_id, ctx.channel_id);
            return;
        }

        if self.tables.record_subscribed(ctx.channel_id, msg) == SubscriptionChange::New {
            info!("Subscribed to {} channel {}", msg.channel_type, ctx.channel_id);
        }
        let writable = self
            .tables
            .subscription(ctx.channel_id)
            .is_some_and(|sub| sub.sub_options.can_update_data());
        if self.connection_type() == ConnectionType::Client
            && writable
            && self.default_channel.is_none()
            && self.config.default_channel_type == Some(msg.channel_type)
        {
            self.default_channel = Some(ctx.channel_id);
        }
    }

    fn handle_unsub_from_channel(
        &mut self,
        ctx: &MessageContext,
        msg: &UnsubscribedFromChannelResultMessage,
    ) {
        if self.id == 0 || msg.conn_id != self.id {
            debug!("Conn {} unsubscribed from channel {}", msg.conn_id, ctx.channel_id);
            return;
        }
        self.tables.purge(ctx.channel_id);
        self.drop_default(ctx.channel_id);
        info!("Unsubscribed from channel {}", ctx.channel_id);
    }

    fn handle_spatial_regions_update(&mut self, _ctx: &MessageContext, msg: &SpatialRegionsUpdateMessage) {
        debug!("Received {} spatial regions", msg.regions.len());
        self.spatial.update(msg.regions.clone());
    }

    fn adopt_owned_default(&mut self, channel_id: u32, channel_type: ChannelType) {
        if self.connection_type() == ConnectionType::Server
            && self.default_channel.is_none()
            && self.config.default_channel_type == Some(channel_type)
        {
            self.default_channel = Some(channel_id);
        }
    }

    fn drop_default(&mut self, channel_id: u32) {
        if self.default_channel == Some(channel_id) {
            info!("Default channel {} is gone, falling back to global", channel_id);
            self.default_channel = None;
        }
    }

    // ----- Test hooks -----

    /// Push an envelope into the inbound queue as if it had been received.
    #[cfg(any(test, feature = "test-util"))]
    pub fn enqueue_incoming(&self, envelope: MessagePack) {
        let _ = self.incoming_tx.send(envelope);
    }

    /// Take everything queued for sending without touching a socket.
    #[cfg(any(test, feature = "test-util"))]
    pub fn take_outgoing(&mut self) -> Vec<MessagePack> {
        let mut out: Vec<MessagePack> = self.carry_over.take().into_iter().collect();
        out.extend(self.outgoing_rx.try_iter());
        out
    }
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

struct ReaderTask {
    incoming: Sender<MessagePack>,
    events: Sender<SessionEvent>,
    state: Arc<ConnectionStateWatch>,
    alive: Arc<AtomicBool>,
    generation: Arc<AtomicU64>,
    my_generation: u64,
    decoder: FrameDecoder,
    show_user_space_log: bool,
}

impl ReaderTask {
    fn is_current(&self) -> bool {
        self.generation.load(Ordering::SeqCst) == self.my_generation
    }

    /// Read incoming bytes until the connection closes or shutdown is signalled.
    async fn run(mut self, mut reader: OwnedReadHalf, mut shutdown_rx: watch::Receiver<bool>) {
        let mut buf = [0u8; 4096];
        loop {
            tokio::select! {
                result = reader.read(&mut buf) => {
                    if !self.is_current() {
                        break;
                    }
                    match result {
                        Ok(0) => {
                            info!("Hub closed the connection");
                            self.lost();
                            break;
                        }
                        Err(e) => {
                            warn!("Receive failed: {}", e);
                            self.lost();
                            break;
                        }
                        Ok(n) => self.forward(&buf[..n]),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }

    fn forward(&mut self, bytes: &[u8]) {
        for envelope in self.decoder.decode(bytes) {
            if !protocol::is_user_space(envelope.msg_type) || self.show_user_space_log {
                debug!(
                    "Receive message(channel_id={}, stub_id={}, type={}, body_size={})",
                    envelope.channel_id,
                    envelope.stub_id,
                    envelope.msg_type,
                    envelope.msg_body.len()
                );
            }
            if self.incoming.send(envelope).is_err() {
                return;
            }
        }
    }

    fn lost(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.state.set(ConnectionState::Disconnected);
        let _ = self.events.send(SessionEvent::Disconnected);
    }
}

/// Write queued packets until the sender is dropped, then close the socket.
async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(bytes) = rx.recv().await {
        if let Err(e) = writer.write_all(&bytes).await {
            warn!("Send failed: {}", e);
            return;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
#[path = "connection_tests.rs"]
mod tests;
