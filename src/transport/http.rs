use std::time::Duration;

use reqwest::Client;
use serde_json::Value;
use tracing::{debug, warn};

use super::{FetchError, HttpFetch, ResponseFn};

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// [`HttpFetch`] over `reqwest`.
///
/// Requests are spawned on the current tokio `LocalSet`, so `get` must be called
/// from inside one (`LocalSet::run_until` or a `spawn_local`ed task). The response
/// callback runs on the same thread and may touch `Rc` state.
#[derive(Clone)]
pub struct ReqwestHttp {
    client: Client,
}

impl ReqwestHttp {
    /// Create a client with the default timeout.
    /// Returns an error if the HTTP client fails to build (e.g., TLS configuration issues).
    pub fn new() -> Result<Self, String> {
        Self::with_timeout(FETCH_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| format!("failed to build HTTP client: {}", e))?;
        Ok(Self { client })
    }
}

impl HttpFetch for ReqwestHttp {
    fn get(&self, url: &str, on_response: ResponseFn) {
        let client = self.client.clone();
        let url = url.to_string();
        tokio::task::spawn_local(async move {
            let result = fetch_json(&client, &url).await;
            on_response(result);
        });
    }
}

async fn fetch_json(client: &Client, url: &str) -> Result<Value, FetchError> {
    debug!(url, "fetching");
    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Network(e.to_string())
        }
    })?;

    let status = response.status().as_u16();
    if !(200..300).contains(&status) {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "(failed to read body)".to_string());
        warn!(url, status, response_body = %body, "query returned error status");
        return Err(FetchError::Http {
            status,
            url: url.to_string(),
        });
    }

    response
        .json::<Value>()
        .await
        .map_err(|e| FetchError::Decode(e.to_string()))
}
