//! Topic routing of inbound publications to handlers

use super::Client;
use crate::packet::{Publish, QoS};
use bytes::Bytes;
use rumqttc::mqttbytes::{matches, valid_filter};
use std::sync::{Arc, RwLock};
use tracing::{debug, trace};

/// Callback invoked for each inbound publication on a matching filter
///
/// Handlers run on the client's dispatch task and should return quickly or
/// hand work off themselves.
pub type MessageHandler = Arc<dyn Fn(&Client, &Message) + Send + Sync>;

/// Wrap a closure as a [`MessageHandler`]
pub fn handler<F>(f: F) -> MessageHandler
where
    F: Fn(&Client, &Message) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// An inbound publication
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    pub message_id: u16,
}

impl Message {
    /// Payload as UTF-8 text, replacing invalid sequences
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

impl From<Publish> for Message {
    fn from(publish: Publish) -> Self {
        Self {
            topic: publish.topic,
            payload: publish.payload,
            qos: publish.qos,
            retain: publish.retain,
            dup: publish.dup,
            message_id: publish.message_id,
        }
    }
}

#[derive(Default)]
struct Routes {
    closed: bool,
    entries: Vec<(String, Vec<MessageHandler>)>,
    default_handler: Option<MessageHandler>,
}

/// Filter to handler registrations plus an optional default handler
#[derive(Default)]
pub struct Router {
    routes: RwLock<Routes>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("Router")
            .field("closed", &routes.closed)
            .field(
                "filters",
                &routes.entries.iter().map(|(f, _)| f).collect::<Vec<_>>(),
            )
            .field("has_default", &routes.default_handler.is_some())
            .finish()
    }
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `filter`; handlers for the same filter accumulate
    pub fn add_route(&self, filter: &str, handler: MessageHandler) {
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        routes.closed = false;
        match routes.entries.iter_mut().find(|(f, _)| f == filter) {
            Some((_, handlers)) => handlers.push(handler),
            None => routes.entries.push((filter.to_string(), vec![handler])),
        }
        debug!(filter, "Route added");
    }

    /// Remove every handler registered for exactly `filter`
    pub fn delete_route(&self, filter: &str) {
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        let before = routes.entries.len();
        routes.entries.retain(|(f, _)| f != filter);
        if routes.entries.len() != before {
            debug!(filter, "Route removed");
        }
    }

    pub fn set_default_handler(&self, handler: Option<MessageHandler>) {
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        routes.default_handler = handler;
    }

    pub fn filters(&self) -> Vec<String> {
        let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
        routes.entries.iter().map(|(f, _)| f.clone()).collect()
    }

    /// Handlers that should receive a publication on `topic`
    ///
    /// The default handler is returned only when no filter matches.
    pub fn handlers_for(&self, topic: &str) -> Vec<MessageHandler> {
        let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
        if routes.closed {
            return Vec::new();
        }
        let matched: Vec<MessageHandler> = routes
            .entries
            .iter()
            .filter(|(filter, _)| valid_filter(filter) && matches(topic, filter))
            .flat_map(|(_, handlers)| handlers.iter().cloned())
            .collect();
        if matched.is_empty() {
            routes.default_handler.iter().cloned().collect()
        } else {
            matched
        }
    }

    /// Invoke every handler matching `message.topic`
    ///
    /// Handlers run outside the route lock, so a handler may subscribe or
    /// unsubscribe on the same client.
    pub fn dispatch(&self, client: &Client, message: &Message) -> usize {
        let handlers = self.handlers_for(&message.topic);
        if handlers.is_empty() {
            trace!(topic = %message.topic, "No route for publication");
        }
        for handler in &handlers {
            handler(client, message);
        }
        handlers.len()
    }

    /// Resume dispatching after [`Router::close`]
    pub fn reopen(&self) {
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        routes.closed = false;
    }

    /// Stop dispatching and discard every route
    pub fn close(&self) {
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        routes.closed = true;
        routes.entries.clear();
    }
}
