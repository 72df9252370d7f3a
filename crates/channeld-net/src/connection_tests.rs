use super::*;

use std::sync::Mutex;

use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;

use crate::guard::ConnectionFactory;
use crate::protocol::{
    AuthMessage, ChannelSubscriptionOptions, Packet, SpatialRegion, encode_body,
};

fn connection(role: ConnectionType, config: ConnectionConfig) -> Connection {
    ConnectionFactory::new().create(role, config).unwrap()
}

fn envelope<T: Serialize>(channel_id: u32, msg_type: MessageType, stub_id: u32, msg: &T) -> MessagePack {
    MessagePack {
        channel_id,
        broadcast: 0,
        stub_id,
        msg_type: msg_type.id(),
        msg_body: encode_body(msg).unwrap(),
    }
}

fn auth_ok(conn_id: u32) -> AuthResultMessage {
    AuthResultMessage {
        result: AuthResult::Successful,
        conn_id,
        compression_type: CompressionType::Lz4,
    }
}

fn authenticate(conn: &mut Connection, conn_id: u32) {
    conn.enqueue_incoming(envelope(GLOBAL_CHANNEL_ID, MessageType::Auth, 0, &auth_ok(conn_id)));
    conn.tick_incoming();
}

fn sub_ack(conn_id: u32, channel_type: ChannelType, options: ChannelSubscriptionOptions) -> SubscribedToChannelResultMessage {
    SubscribedToChannelResultMessage {
        conn_id,
        sub_options: options,
        conn_type: ConnectionType::Client,
        channel_type,
    }
}

// ----- Authentication -----

#[test]
fn test_auth_sets_id_only_once() {
    let mut conn = connection(ConnectionType::Client, ConnectionConfig::default());
    authenticate(&mut conn, 5);
    authenticate(&mut conn, 9);

    assert_eq!(conn.id(), 5);
    assert_eq!(conn.compression(), CompressionType::Lz4);
    assert!(conn.is_authenticated());
}

#[test]
fn test_auth_failure_raises_event() {
    let mut conn = connection(ConnectionType::Client, ConnectionConfig::default());
    let failed = AuthResultMessage {
        result: AuthResult::InvalidLt,
        ..Default::default()
    };
    conn.enqueue_incoming(envelope(GLOBAL_CHANNEL_ID, MessageType::Auth, 0, &failed));
    conn.tick_incoming();

    assert_eq!(conn.id(), 0);
    assert_eq!(conn.poll_events(), vec![SessionEvent::AuthFailed(AuthResult::InvalidLt)]);
    assert!(conn.poll_events().is_empty());
}

// ----- Channels -----

#[test]
fn test_sub_ack_for_other_connection_not_recorded() {
    let mut conn = connection(ConnectionType::Server, ConnectionConfig::default());
    authenticate(&mut conn, 5);

    let other = sub_ack(8, ChannelType::Subworld, ChannelSubscriptionOptions::read_access());
    conn.enqueue_incoming(envelope(3, MessageType::SubToChannel, 0, &other));
    conn.tick_incoming();

    assert!(!conn.channels().is_subscribed(3));
}

#[test]
fn test_duplicate_sub_acks_merge_options() {
    let mut conn = connection(ConnectionType::Client, ConnectionConfig::default());
    authenticate(&mut conn, 5);

    let read = sub_ack(5, ChannelType::Subworld, ChannelSubscriptionOptions::read_access());
    let write = sub_ack(5, ChannelType::Subworld, ChannelSubscriptionOptions::write_access(30));
    conn.enqueue_incoming(envelope(3, MessageType::SubToChannel, 0, &read));
    conn.enqueue_incoming(envelope(3, MessageType::SubToChannel, 0, &write));
    conn.tick_incoming();

    assert_eq!(conn.channels().subscribed().len(), 1);
    assert!(conn.channels().subscription(3).unwrap().sub_options.can_update_data());
}

#[test]
fn test_client_default_channel_follows_writable_sub() {
    let config = ConnectionConfig {
        default_channel_type: Some(ChannelType::Subworld),
        ..Default::default()
    };
    let mut conn = connection(ConnectionType::Client, config);
    authenticate(&mut conn, 5);
    assert_eq!(conn.default_channel_id(), GLOBAL_CHANNEL_ID);

    let ack = sub_ack(5, ChannelType::Subworld, ChannelSubscriptionOptions::write_access(50));
    conn.enqueue_incoming(envelope(4, MessageType::SubToChannel, 0, &ack));
    conn.tick_incoming();
    assert_eq!(conn.default_channel_id(), 4);

    let unsub = UnsubscribedFromChannelResultMessage {
        conn_id: 5,
        ..Default::default()
    };
    conn.enqueue_incoming(envelope(4, MessageType::UnsubFromChannel, 0, &unsub));
    conn.tick_incoming();
    assert_eq!(conn.default_channel_id(), GLOBAL_CHANNEL_ID);
    assert!(!conn.channels().is_subscribed(4));
}

#[test]
fn test_removing_owned_default_channel_falls_back_to_global() {
    let config = ConnectionConfig {
        default_channel_type: Some(ChannelType::Subworld),
        ..Default::default()
    };
    let mut conn = connection(ConnectionType::Server, config);
    authenticate(&mut conn, 5);

    let created = CreateChannelResultMessage {
        channel_type: ChannelType::Subworld,
        metadata: "arena".to_string(),
        owner_conn_id: 5,
        channel_id: 0,
    };
    conn.enqueue_incoming(envelope(2, MessageType::CreateChannel, 0, &created));
    conn.tick_incoming();
    assert!(conn.channels().is_owned(2));
    assert_eq!(conn.default_channel_id(), 2);

    let removed = RemoveChannelMessage { channel_id: 2 };
    conn.enqueue_incoming(envelope(GLOBAL_CHANNEL_ID, MessageType::RemoveChannel, 0, &removed));
    conn.tick_incoming();
    assert!(!conn.channels().is_owned(2));
    assert!(conn.channels().listed().is_empty());
    assert_eq!(conn.default_channel_id(), GLOBAL_CHANNEL_ID);
}

#[test]
fn test_spatial_channels_recorded_as_owned() {
    let mut conn = connection(ConnectionType::Server, ConnectionConfig::default());
    authenticate(&mut conn, 5);

    let created = CreateSpatialChannelsResultMessage {
        spatial_channel_id: vec![65536, 65537],
        metadata: "grid".to_string(),
        owner_conn_id: 5,
    };
    conn.enqueue_incoming(envelope(GLOBAL_CHANNEL_ID, MessageType::CreateSpatialChannel, 0, &created));
    conn.tick_incoming();

    assert!(conn.channels().is_owned(65536));
    assert!(conn.channels().is_owned(65537));
    assert_eq!(conn.channels().listed()[&65537].channel_type, ChannelType::Spatial);
}

#[test]
fn test_spatial_regions_update_enables_lookup() {
    let mut conn = connection(ConnectionType::Server, ConnectionConfig::default());
    let update = SpatialRegionsUpdateMessage {
        regions: vec![SpatialRegion {
            min: SpatialInfo::new(0.0, 0.0, 0.0),
            max: SpatialInfo::new(100.0, 100.0, 100.0),
            channel_id: 65536,
            server_index: 0,
        }],
    };
    conn.enqueue_incoming(envelope(GLOBAL_CHANNEL_ID, MessageType::SpatialRegionsUpdate, 0, &update));
    conn.tick_incoming();

    assert_eq!(conn.spatial_channel_at(&SpatialInfo::new(50.0, 50.0, 50.0)), 65536);
    assert_eq!(conn.spatial_channel_at(&SpatialInfo::new(-1.0, 0.0, 0.0)), GLOBAL_CHANNEL_ID);
}

// ----- Dispatch -----

#[test]
fn test_handlers_run_before_rpc_callback() {
    let mut conn = connection(ConnectionType::Client, ConnectionConfig::default());
    authenticate(&mut conn, 5);
    let order = Arc::new(Mutex::new(Vec::new()));

    let handler_order = Arc::clone(&order);
    conn.add_handler(
        MessageType::SubToChannel.id(),
        move |_: &mut Connection, _: &MessageContext, _: &dyn Any| {
            handler_order.lock().unwrap().push("handler");
        },
    )
    .unwrap();

    let callback_order = Arc::clone(&order);
    let stub_id = conn
        .send_with(
            7,
            MessageType::SubToChannel.id(),
            &crate::protocol::SubscribedToChannelMessage::default(),
            BroadcastType::NO_BROADCAST,
            ReplyTo::callback(Box::new(move |conn: &mut Connection, _: &MessageContext, _: &dyn Any| {
                assert!(conn.channels().is_subscribed(7));
                callback_order.lock().unwrap().push("callback");
            })),
        )
        .unwrap();
    assert_ne!(stub_id, 0);

    let ack = sub_ack(5, ChannelType::Subworld, ChannelSubscriptionOptions::read_access());
    conn.enqueue_incoming(envelope(7, MessageType::SubToChannel, stub_id, &ack));
    // A duplicate reply must not fire the callback again.
    conn.enqueue_incoming(envelope(7, MessageType::SubToChannel, stub_id, &ack));
    conn.tick_incoming();

    assert_eq!(*order.lock().unwrap(), vec!["handler", "callback", "handler"]);
    assert_eq!(conn.pending_rpc_count(), 0);
}

#[test]
fn test_bad_messages_do_not_stop_processing() {
    let mut conn = connection(ConnectionType::Client, ConnectionConfig::default());
    conn.enqueue_incoming(MessagePack {
        msg_type: 2,
        ..Default::default()
    });
    conn.enqueue_incoming(MessagePack {
        msg_type: MessageType::Auth.id(),
        msg_body: vec![0xFF, 0xFF, 0xFF],
        ..Default::default()
    });
    conn.enqueue_incoming(envelope(GLOBAL_CHANNEL_ID, MessageType::Auth, 0, &auth_ok(3)));

    assert_eq!(conn.tick_incoming(), 3);
    assert_eq!(conn.id(), 3);
}

#[test]
fn test_user_space_forwarded_to_callback() {
    let mut conn = connection(ConnectionType::Server, ConnectionConfig::default());
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    conn.set_user_space_handler(move |msg: &UserSpaceMessage| sink.lock().unwrap().push(msg.clone()));

    let fwd = ServerForwardMessage {
        client_conn_id: 12,
        payload: b"fire".to_vec(),
    };
    conn.enqueue_incoming(MessagePack {
        channel_id: 3,
        msg_type: 120,
        msg_body: encode_body(&fwd).unwrap(),
        ..Default::default()
    });
    conn.tick_incoming();

    let received = received.lock().unwrap();
    assert_eq!(
        *received,
        vec![UserSpaceMessage {
            channel_id: 3,
            msg_type: 120,
            client_conn_id: 12,
            payload: b"fire".to_vec(),
        }]
    );
}

#[test]
fn test_default_handler_for_registered_type_without_handler() {
    let mut conn = connection(ConnectionType::Client, ConnectionConfig::default());
    let hits = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&hits);
    conn.set_default_handler(move |_: &mut Connection, ctx: &MessageContext, _: &dyn Any| {
        sink.lock().unwrap().push(ctx.msg_type);
    });

    let query = QuerySpatialChannelResultMessage {
        channel_id: vec![65536],
    };
    conn.enqueue_incoming(envelope(GLOBAL_CHANNEL_ID, MessageType::QuerySpatialChannel, 0, &query));
    conn.tick_incoming();

    assert_eq!(*hits.lock().unwrap(), vec![MessageType::QuerySpatialChannel.id()]);
}

// ----- RPC timeout -----

#[tokio::test]
async fn test_rpc_timeout_fails_waiter() {
    let config = ConnectionConfig {
        rpc_timeout: Some(Duration::ZERO),
        ..Default::default()
    };
    let mut conn = connection(ConnectionType::Client, config);
    let (tx, rx) = oneshot::channel();
    let stub_id = conn.send_raw_with(
        GLOBAL_CHANNEL_ID,
        MessageType::ListChannel.id(),
        Vec::new(),
        BroadcastType::NO_BROADCAST,
        ReplyTo {
            callback: None,
            waiter: Some(tx),
        },
    );

    conn.tick_incoming();
    assert_eq!(rx.await.unwrap().unwrap_err(), RpcError::TimedOut(stub_id));
    assert_eq!(conn.pending_rpc_count(), 0);
}

#[tokio::test]
async fn test_disconnect_fails_waiters_and_clears_session() {
    let mut conn = connection(ConnectionType::Client, ConnectionConfig::default());
    authenticate(&mut conn, 5);
    let (tx, rx) = oneshot::channel();
    conn.send_raw_with(
        GLOBAL_CHANNEL_ID,
        MessageType::ListChannel.id(),
        Vec::new(),
        BroadcastType::NO_BROADCAST,
        ReplyTo {
            callback: None,
            waiter: Some(tx),
        },
    );

    conn.disconnect(false);
    assert_eq!(rx.await.unwrap().unwrap_err(), RpcError::Disconnected);
    assert_eq!(conn.id(), 0);
    assert_eq!(conn.queued_len(), 0);
    assert!(!conn.is_connected());
}

// ----- Socket -----

async fn read_packets(stream: &mut TcpStream) -> Vec<Packet> {
    let mut decoder = FrameDecoder::default();
    let mut packets = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                decoder.push(&buf[..n]);
                while let Some(Ok(packet)) = decoder.next_frame() {
                    packets.push(packet);
                }
            }
        }
    }
    packets
}

#[tokio::test]
async fn test_connect_refused_is_io_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let mut conn = connection(ConnectionType::Client, ConnectionConfig::default());
    let result = conn.connect("127.0.0.1", port).await;
    assert!(matches!(result, Err(ConnectError::Io(_))));
    assert_eq!(conn.state().current(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_connect_timeout_runs_timeout_continuation() {
    // A hostname needs a lookup, so the connect cannot finish within a zero timeout.
    let config = ConnectionConfig {
        connect_timeout: Duration::ZERO,
        ..ConnectionConfig::default()
    };
    let mut conn = connection(ConnectionType::Client, config);
    let mut connected = false;
    let mut timed_out = false;

    let result = conn
        .connect_with("localhost", 12108, |_| connected = true, |_| timed_out = true)
        .await;

    assert!(matches!(result, Err(ConnectError::TimedOut(d)) if d == Duration::ZERO));
    assert!(timed_out);
    assert!(!connected);
    assert_eq!(conn.state().current(), ConnectionState::Disconnected);
    assert!(!conn.is_connected());
}

#[tokio::test]
async fn test_auth_roundtrip_with_hub() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let hub = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut decoder = FrameDecoder::default();
        let mut buf = [0u8; 1024];
        let request = loop {
            let n = stream.read(&mut buf).await.unwrap();
            let mut messages = decoder.decode(&buf[..n]);
            if !messages.is_empty() {
                break messages.remove(0);
            }
        };
        let auth: AuthMessage = protocol::decode_body(&request.msg_body).unwrap();
        assert_eq!(auth.login_token, "lt");

        let reply = Packet {
            messages: vec![envelope(GLOBAL_CHANNEL_ID, MessageType::Auth, request.stub_id, &auth_ok(42))],
        };
        let bytes = framing::encode_packet(&reply, CompressionType::NoCompression, &CompressionConfig::default()).unwrap();
        stream.write_all(&bytes).await.unwrap();
        read_packets(&mut stream).await
    });

    let mut conn = connection(ConnectionType::Client, ConnectionConfig::default());
    conn.connect("127.0.0.1", port).await.unwrap();
    assert_eq!(conn.state().current(), ConnectionState::Connected);

    let (tx, mut rx) = oneshot::channel();
    conn.send_with(
        GLOBAL_CHANNEL_ID,
        MessageType::Auth.id(),
        &AuthMessage {
            player_identifier_token: "pit".to_string(),
            login_token: "lt".to_string(),
        },
        BroadcastType::NO_BROADCAST,
        ReplyTo {
            callback: None,
            waiter: Some(tx),
        },
    )
    .unwrap();

    let reply = loop {
        conn.tick();
        if let Ok(reply) = rx.try_recv() {
            break reply;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    let reply = reply.unwrap();
    assert_eq!(reply.downcast_ref::<AuthResultMessage>().unwrap().conn_id, 42);
    assert_eq!(conn.id(), 42);
    assert_eq!(conn.state().current(), ConnectionState::Authenticated);

    conn.disconnect(true);
    hub.await.unwrap();
}

#[tokio::test]
async fn test_graceful_disconnect_flushes_queue() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let hub = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        read_packets(&mut stream).await
    });

    let mut conn = connection(ConnectionType::Server, ConnectionConfig::default());
    conn.connect("127.0.0.1", port).await.unwrap();
    for i in 0..3u8 {
        conn.send_raw(1, 100 + u32::from(i), vec![i; 8], BroadcastType::ALL);
    }
    conn.disconnect(true);

    let packets = hub.await.unwrap();
    let types: Vec<u32> = packets
        .into_iter()
        .flat_map(|p| p.messages)
        .map(|m| m.msg_type)
        .collect();
    assert_eq!(types, vec![100, 101, 102]);
}

#[tokio::test]
async fn test_oversized_batch_carried_over_in_order() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let hub = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        read_packets(&mut stream).await
    });

    let config = ConnectionConfig {
        max_packet_size: 200,
        ..Default::default()
    };
    let mut conn = connection(ConnectionType::Server, config);
    conn.connect("127.0.0.1", port).await.unwrap();
    for i in 0..3u8 {
        conn.send_raw(1, 100 + u32::from(i), vec![i; 100], BroadcastType::ALL);
    }

    assert_eq!(conn.tick_outgoing(), 1);
    assert_eq!(conn.queued_len(), 2);
    assert_eq!(conn.tick_outgoing(), 1);
    assert_eq!(conn.tick_outgoing(), 1);
    assert_eq!(conn.tick_outgoing(), 0);
    conn.disconnect(false);

    let packets = hub.await.unwrap();
    assert_eq!(packets.len(), 3);
    let types: Vec<u32> = packets.iter().map(|p| p.messages[0].msg_type).collect();
    assert_eq!(types, vec![100, 101, 102]);
}

#[tokio::test]
async fn test_remote_close_emits_disconnected_event() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        drop(stream);
    });

    let mut conn = connection(ConnectionType::Client, ConnectionConfig::default());
    conn.connect("127.0.0.1", port).await.unwrap();

    let mut events = Vec::new();
    for _ in 0..200 {
        conn.tick();
        events.extend(conn.poll_events());
        if !events.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    conn.tick();

    assert_eq!(events, vec![SessionEvent::Disconnected]);
    assert!(!conn.is_connected());
    assert!(conn.link.is_none());
}
