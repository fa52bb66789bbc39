use std::cell::RefCell;
use std::collections::BTreeMap;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{PushMessage, PushTransport, SubscribeOptions};
use crate::subscription::SubscriptionRegistry;

/// Subscription change forwarded to the broker bridge.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PushCommand {
    Subscribe { topic: String, rh: u8 },
    Unsubscribe { topic: String },
}

/// [`PushTransport`] that keeps the active subscriptions in memory and optionally
/// forwards every change as a [`PushCommand`] over a channel.
#[derive(Default)]
pub struct ChannelPush {
    topics: RefCell<BTreeMap<String, SubscribeOptions>>,
    commands: Option<mpsc::UnboundedSender<PushCommand>>,
}

impl ChannelPush {
    /// Transport without a bridge; only records subscriptions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport plus the receiving end of its command stream.
    pub fn with_commands() -> (Self, mpsc::UnboundedReceiver<PushCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let push = Self {
            topics: RefCell::default(),
            commands: Some(tx),
        };
        (push, rx)
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.topics.borrow().keys().cloned().collect()
    }

    pub fn options(&self, topic: &str) -> Option<SubscribeOptions> {
        self.topics.borrow().get(topic).copied()
    }

    fn send(&self, command: PushCommand) {
        if let Some(tx) = &self.commands {
            if tx.send(command).is_err() {
                warn!("push bridge is gone; dropping subscription change");
            }
        }
    }
}

impl PushTransport for ChannelPush {
    fn subscribe(&self, topic: &str, options: SubscribeOptions) {
        let is_new = self
            .topics
            .borrow_mut()
            .insert(topic.to_string(), options)
            .is_none();
        debug!(topic, is_new, rh = options.retain_handling.code(), "push subscribe");
        self.send(PushCommand::Subscribe {
            topic: topic.to_string(),
            rh: options.retain_handling.code(),
        });
    }

    fn unsubscribe(&self, topic: &str) {
        if self.topics.borrow_mut().remove(topic).is_none() {
            return;
        }
        debug!(topic, "push unsubscribe");
        self.send(PushCommand::Unsubscribe {
            topic: topic.to_string(),
        });
    }
}

/// Feed inbound push messages into `registry` until the sender side closes.
/// Returns the number of messages dispatched.
pub async fn pump(mut inbound: mpsc::Receiver<PushMessage>, registry: SubscriptionRegistry) -> usize {
    let mut dispatched = 0;
    while let Some(message) = inbound.recv().await {
        let report = registry.dispatch(&message.topic, &message.payload, &message.meta());
        debug!(
            topic = %message.topic,
            delivered = report.delivered,
            failed = report.errors.len(),
            "push message dispatched"
        );
        dispatched += 1;
    }
    dispatched
}
