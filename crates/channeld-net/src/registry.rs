//! Message registry: parse incoming envelopes and dispatch them to handlers.
//!
//! The [`MessageRegistry`] maps numeric message types to a parser and an
//! ordered list of [`MessageHandler`]s. Handlers receive the parsed message as
//! `&dyn Any`; [`typed_handler`] wraps a closure that wants the concrete type.
//! Message types at or above [`USER_SPACE_START`](crate::protocol::USER_SPACE_START)
//! that have no parser are decoded as [`ServerForwardMessage`] and left for
//! the connection's user-space callback.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::warn;

use crate::protocol::{self, MessageError, ServerForwardMessage};

/// A parsed message body.
pub type Message = Box<dyn Any + Send>;

/// Parser turning a message body into a [`Message`].
pub type ParseFn = fn(&[u8]) -> Result<Message, MessageError>;

/// Envelope fields delivered alongside every parsed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageContext {
    /// Channel the message was received on.
    pub channel_id: u32,
    /// Broadcast flags of the envelope.
    pub broadcast: u32,
    /// Correlation id; 0 if the message is not a reply.
    pub stub_id: u32,
    /// Numeric message type.
    pub msg_type: u32,
}

/// Identifies one handler attached to a message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Trait for message handlers. Implemented for closures.
///
/// `C` is the object handlers mutate, normally the connection itself.
pub trait MessageHandler<C>: Send + Sync {
    /// Process a single parsed message.
    fn handle(&self, target: &mut C, ctx: &MessageContext, msg: &dyn Any);
}

/// Blanket implementation for closures.
impl<C, F> MessageHandler<C> for F
where
    F: Fn(&mut C, &MessageContext, &dyn Any) + Send + Sync,
{
    fn handle(&self, target: &mut C, ctx: &MessageContext, msg: &dyn Any) {
        self(target, ctx, msg);
    }
}

/// Wrap a closure over a concrete message type as a [`MessageHandler`].
///
/// Messages of any other type are logged and ignored.
pub fn typed_handler<C, T, F>(f: F) -> impl MessageHandler<C>
where
    T: 'static,
    F: Fn(&mut C, &MessageContext, &T) + Send + Sync,
{
    move |target: &mut C, ctx: &MessageContext, msg: &dyn Any| match msg.downcast_ref::<T>() {
        Some(typed) => f(target, ctx, typed),
        None => warn!(
            "Handler for message type {} expected {}",
            ctx.msg_type,
            std::any::type_name::<T>()
        ),
    }
}

/// Outcome of [`MessageRegistry::parse`].
pub enum Parsed {
    /// A registered message type.
    Known(Message),
    /// An unregistered user-space message.
    UserSpace(ServerForwardMessage),
}

fn parse_as<T: DeserializeOwned + Send + 'static>(body: &[u8]) -> Result<Message, MessageError> {
    let msg: T = protocol::decode_body(body)?;
    Ok(Box::new(msg))
}

struct Entry<C> {
    parser: ParseFn,
    handlers: Vec<(HandlerId, Arc<dyn MessageHandler<C>>)>,
}

/// Maps message types to parsers and handler chains.
pub struct MessageRegistry<C> {
    entries: HashMap<u32, Entry<C>>,
    default_handler: Option<Arc<dyn MessageHandler<C>>>,
    next_handler_id: u64,
}

impl<C> MessageRegistry<C> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            default_handler: None,
            next_handler_id: 1,
        }
    }

    /// Register `T` as the body type of `msg_type`, replacing any previous
    /// parser and dropping its handlers.
    pub fn register<T>(&mut self, msg_type: u32)
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.entries.insert(
            msg_type,
            Entry {
                parser: parse_as::<T>,
                handlers: Vec::new(),
            },
        );
    }

    /// Register `T` for `msg_type` with a single handler.
    pub fn register_with<T, H>(&mut self, msg_type: u32, handler: H) -> HandlerId
    where
        T: DeserializeOwned + Send + 'static,
        H: MessageHandler<C> + 'static,
    {
        self.register::<T>(msg_type);
        let id = self.next_id();
        if let Some(entry) = self.entries.get_mut(&msg_type) {
            entry.handlers.push((id, Arc::new(handler)));
        }
        id
    }

    /// Append a handler to an already registered type.
    pub fn add_handler<H>(&mut self, msg_type: u32, handler: H) -> Result<HandlerId, MessageError>
    where
        H: MessageHandler<C> + 'static,
    {
        let id = HandlerId(self.next_handler_id);
        let entry = self
            .entries
            .get_mut(&msg_type)
            .ok_or(MessageError::Unregistered(msg_type))?;
        entry.handlers.push((id, Arc::new(handler)));
        self.next_handler_id += 1;
        Ok(id)
    }

    /// Detach a handler. Returns `false` if it was not attached.
    pub fn remove_handler(&mut self, msg_type: u32, id: HandlerId) -> bool {
        let Some(entry) = self.entries.get_mut(&msg_type) else {
            return false;
        };
        let before = entry.handlers.len();
        entry.handlers.retain(|(hid, _)| *hid != id);
        entry.handlers.len() != before
    }

    /// Handler used for registered types that have no handler of their own.
    pub fn set_default_handler<H>(&mut self, handler: H)
    where
        H: MessageHandler<C> + 'static,
    {
        self.default_handler = Some(Arc::new(handler));
    }

    /// Whether a parser exists for `msg_type`.
    pub fn is_registered(&self, msg_type: u32) -> bool {
        self.entries.contains_key(&msg_type)
    }

    /// Number of handlers attached to `msg_type`.
    pub fn handler_count(&self, msg_type: u32) -> usize {
        self.entries.get(&msg_type).map_or(0, |e| e.handlers.len())
    }

    /// Parse a message body.
    pub fn parse(&self, msg_type: u32, body: &[u8]) -> Result<Parsed, MessageError> {
        if let Some(entry) = self.entries.get(&msg_type) {
            return (entry.parser)(body).map(Parsed::Known);
        }
        if protocol::is_user_space(msg_type) {
            return protocol::decode_body(body).map(Parsed::UserSpace);
        }
        Err(MessageError::Unregistered(msg_type))
    }

    /// Snapshot of the handlers to run for `msg_type`, in addition order.
    ///
    /// The returned list is detached from the registry, so handlers may
    /// mutate it while running.
    pub fn handlers_for(&self, msg_type: u32) -> Vec<Arc<dyn MessageHandler<C>>> {
        let handlers: Vec<_> = self
            .entries
            .get(&msg_type)
            .map(|e| e.handlers.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();
        if handlers.is_empty() {
            self.default_handler.iter().cloned().collect()
        } else {
            handlers
        }
    }

    fn next_id(&mut self) -> HandlerId {
        let id = HandlerId(self.next_handler_id);
        self.next_handler_id += 1;
        id
    }
}

impl<C> Default for MessageRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{RemoveChannelMessage, encode_body};

    #[derive(Default)]
    struct Recorder {
        calls: Vec<String>,
    }

    fn ctx(msg_type: u32) -> MessageContext {
        MessageContext {
            msg_type,
            ..Default::default()
        }
    }

    fn dispatch(registry: &MessageRegistry<Recorder>, rec: &mut Recorder, msg_type: u32, body: &[u8]) {
        let Ok(Parsed::Known(msg)) = registry.parse(msg_type, body) else {
            panic!("expected a known message");
        };
        for handler in registry.handlers_for(msg_type) {
            handler.handle(rec, &ctx(msg_type), msg.as_ref());
        }
    }

    #[test]
    fn test_handlers_run_in_addition_order() {
        let mut registry = MessageRegistry::<Recorder>::new();
        registry.register_with::<RemoveChannelMessage, _>(
            4,
            |r: &mut Recorder, _: &MessageContext, _: &dyn Any| r.calls.push("first".into()),
        );
        registry
            .add_handler(
                4,
                typed_handler(|r: &mut Recorder, _: &MessageContext, m: &RemoveChannelMessage| {
                    r.calls.push(format!("second:{}", m.channel_id))
                }),
            )
            .unwrap();

        let body = encode_body(&RemoveChannelMessage { channel_id: 12 }).unwrap();
        let mut rec = Recorder::default();
        dispatch(&registry, &mut rec, 4, &body);

        assert_eq!(rec.calls, vec!["first", "second:12"]);
    }

    #[test]
    fn test_register_replaces_handlers() {
        let mut registry = MessageRegistry::<Recorder>::new();
        registry.register_with::<RemoveChannelMessage, _>(
            4,
            |r: &mut Recorder, _: &MessageContext, _: &dyn Any| r.calls.push("old".into()),
        );
        registry.register::<RemoveChannelMessage>(4);
        assert_eq!(registry.handler_count(4), 0);
    }

    #[test]
    fn test_remove_handler() {
        let mut registry = MessageRegistry::<Recorder>::new();
        let first = registry.register_with::<RemoveChannelMessage, _>(
            4,
            |r: &mut Recorder, _: &MessageContext, _: &dyn Any| r.calls.push("first".into()),
        );
        registry
            .add_handler(4, |r: &mut Recorder, _: &MessageContext, _: &dyn Any| {
                r.calls.push("second".into())
            })
            .unwrap();

        assert!(registry.remove_handler(4, first));
        assert!(!registry.remove_handler(4, first));

        let body = encode_body(&RemoveChannelMessage { channel_id: 1 }).unwrap();
        let mut rec = Recorder::default();
        dispatch(&registry, &mut rec, 4, &body);
        assert_eq!(rec.calls, vec!["second"]);
    }

    #[test]
    fn test_add_handler_requires_registration() {
        let mut registry = MessageRegistry::<Recorder>::new();
        let result = registry.add_handler(4, |_: &mut Recorder, _: &MessageContext, _: &dyn Any| {});
        assert!(matches!(result, Err(MessageError::Unregistered(4))));
    }

    #[test]
    fn test_default_handler_used_when_none_attached() {
        let mut registry = MessageRegistry::<Recorder>::new();
        registry.register::<RemoveChannelMessage>(4);
        registry.set_default_handler(|r: &mut Recorder, c: &MessageContext, _: &dyn Any| {
            r.calls.push(format!("default:{}", c.msg_type))
        });

        let body = encode_body(&RemoveChannelMessage { channel_id: 1 }).unwrap();
        let mut rec = Recorder::default();
        dispatch(&registry, &mut rec, 4, &body);
        assert_eq!(rec.calls, vec!["default:4"]);
    }

    #[test]
    fn test_unregistered_protocol_type_is_error() {
        let registry = MessageRegistry::<Recorder>::new();
        assert!(matches!(
            registry.parse(5, &[]),
            Err(MessageError::Unregistered(5))
        ));
    }

    #[test]
    fn test_unregistered_user_space_type_forwarded() {
        let registry = MessageRegistry::<Recorder>::new();
        let fwd = ServerForwardMessage {
            client_conn_id: 3,
            payload: vec![1, 2, 3],
        };
        let body = encode_body(&fwd).unwrap();
        match registry.parse(150, &body) {
            Ok(Parsed::UserSpace(parsed)) => assert_eq!(parsed, fwd),
            _ => panic!("expected user-space forward"),
        }
    }

    #[test]
    fn test_typed_handler_ignores_wrong_type() {
        let handler = typed_handler(|r: &mut Recorder, _: &MessageContext, _: &RemoveChannelMessage| {
            r.calls.push("called".into())
        });
        let mut rec = Recorder::default();
        handler.handle(&mut rec, &ctx(4), &42u32);
        assert!(rec.calls.is_empty());
    }
}
