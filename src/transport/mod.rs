//! Collaborator seams: one-shot JSON queries over HTTP and topic-based push.
//!
//! The facade only talks to [`HttpFetch`] and [`PushTransport`]. The adapters in
//! this module bind them to `reqwest` and to an in-process channel; tests bind them
//! to scripted fakes.

mod http;
mod push;

pub use http::ReqwestHttp;
pub use push::{pump, ChannelPush, PushCommand};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Trait for errors that may succeed when the same call is made again.
pub trait IsRetryable {
    fn is_retryable(&self) -> bool;
}

/// Errors that can occur while fetching a query result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    Timeout,
    Http { status: u16, url: String },
    Network(String),
    Decode(String),
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchError::Timeout => write!(f, "request timed out"),
            FetchError::Http { status, url } => write!(f, "HTTP {} from {}", status, url),
            FetchError::Network(msg) => write!(f, "network error: {}", msg),
            FetchError::Decode(msg) => write!(f, "invalid response body: {}", msg),
        }
    }
}

impl std::error::Error for FetchError {}

impl IsRetryable for FetchError {
    fn is_retryable(&self) -> bool {
        match self {
            FetchError::Timeout => true,
            FetchError::Http { status, .. } => matches!(status, 502..=504),
            FetchError::Network(_) => true,
            FetchError::Decode(_) => false,
        }
    }
}

/// Callback receiving the outcome of one [`HttpFetch::get`].
pub type ResponseFn = Box<dyn FnOnce(Result<Value, FetchError>)>;

/// One logical query against the remote service.
pub trait HttpFetch {
    /// Issue a GET for `url`. `on_response` is called exactly once, possibly before
    /// `get` returns.
    fn get(&self, url: &str, on_response: ResponseFn);
}

/// Whether the broker replays its retained message when a subscription is made.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetainHandling {
    #[default]
    SendOnSubscribe,
    SendIfNew,
    DoNotSend,
}

impl RetainHandling {
    /// MQTT 5 `rh` subscription option value.
    pub fn code(self) -> u8 {
        match self {
            RetainHandling::SendOnSubscribe => 0,
            RetainHandling::SendIfNew => 1,
            RetainHandling::DoNotSend => 2,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeOptions {
    pub retain_handling: RetainHandling,
}

impl SubscribeOptions {
    /// Subscription that does not replay the retained message. Used when the
    /// initial HTTP query already contains the latest observation.
    pub fn skip_retained() -> Self {
        Self {
            retain_handling: RetainHandling::DoNotSend,
        }
    }
}

/// Topic-based push client.
pub trait PushTransport {
    fn subscribe(&self, topic: &str, options: SubscribeOptions);
    fn unsubscribe(&self, topic: &str);
}

/// Delivery metadata passed to push handlers next to the payload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PushMeta {
    /// The broker replayed a retained message instead of delivering a new one.
    pub retain: bool,
}

/// Inbound push message as it arrives from the broker bridge.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PushMessage {
    pub topic: String,
    pub payload: Value,
    #[serde(default)]
    pub retain: bool,
}

impl PushMessage {
    pub fn meta(&self) -> PushMeta {
        PushMeta {
            retain: self.retain,
        }
    }
}
