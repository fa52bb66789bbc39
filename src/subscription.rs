//! Topic -> handler fan-out for push messages.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::transport::PushMeta;

/// Error returned by a push handler. Reported, never propagated to other handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "handler error: {}", self.0)
    }
}

impl std::error::Error for HandlerError {}

pub type Handler = Rc<dyn Fn(&Value, &PushMeta) -> Result<(), HandlerError>>;

/// Box a closure as a [`Handler`].
pub fn handler(f: impl Fn(&Value, &PushMeta) -> Result<(), HandlerError> + 'static) -> Handler {
    Rc::new(f)
}

/// Result of dispatching one push message.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Handlers that ran to completion.
    pub delivered: usize,
    /// Failures by handler position within the topic.
    pub errors: Vec<(usize, String)>,
}

/// Handler table shared by the facade and the push pump. Cloning shares the table.
#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    topics: Rc<RefCell<BTreeMap<String, Vec<Handler>>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `handler` to `topic`. Does not talk to the transport.
    pub fn subscribe(&self, topic: &str, handler: Handler) {
        let mut topics = self.topics.borrow_mut();
        let handlers = topics.entry(topic.to_string()).or_default();
        handlers.push(handler);
        debug!(topic, handlers = handlers.len(), "handler subscribed");
    }

    /// Run every handler of `topic` in registration order.
    pub fn dispatch(&self, topic: &str, payload: &Value, meta: &PushMeta) -> DispatchReport {
        // Snapshot so handlers may subscribe or unsubscribe while running.
        let handlers: Vec<Handler> = self
            .topics
            .borrow()
            .get(topic)
            .cloned()
            .unwrap_or_default();

        let mut report = DispatchReport::default();
        for (idx, handler) in handlers.iter().enumerate() {
            match handler(payload, meta) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(topic, handler = idx, error = %e, "push handler failed");
                    report.errors.push((idx, e.to_string()));
                }
            }
        }

        if handlers.is_empty() {
            debug!(topic, "push message for topic without handlers");
        }
        report
    }

    /// Forget every handler. Returns the topics that had at least one handler so the
    /// caller can tear down the transport subscriptions.
    pub fn unsubscribe_all(&self) -> Vec<String> {
        let topics = std::mem::take(&mut *self.topics.borrow_mut());
        let active: Vec<String> = topics
            .into_iter()
            .filter(|(_, handlers)| !handlers.is_empty())
            .map(|(topic, _)| topic)
            .collect();
        debug!(topics = active.len(), "unsubscribed all handlers");
        active
    }

    pub fn handler_count(&self, topic: &str) -> usize {
        self.topics.borrow().get(topic).map_or(0, Vec::len)
    }

    pub fn topics(&self) -> Vec<String> {
        self.topics.borrow().keys().cloned().collect()
    }
}
