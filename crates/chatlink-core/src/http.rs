//! Blocking HTTP plumbing shared by the auth and backend clients.
//!
//! Requests run on `ureq` inside `spawn_blocking` so callers stay async.
//! Non-2xx responses are not errors at this layer: their status and JSON
//! body are handed back so each client can map them onto its own taxonomy.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;

/// Build a ureq agent with a per-request timeout.
pub(crate) fn agent(timeout: Duration) -> ureq::Agent {
    ureq::AgentBuilder::new().timeout(timeout).build()
}

/// A completed HTTP exchange, successful or not.
#[derive(Debug)]
pub(crate) struct HttpReply {
    pub status: u16,
    pub status_text: String,
    /// Parsed JSON body, or `Value::Null` when the body was empty or not JSON.
    pub body: Value,
}

impl HttpReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Non-empty string field of the JSON body.
    pub fn text_field(&self, name: &str) -> Option<String> {
        self.body
            .get(name)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    /// Decode the body into `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, String> {
        serde_json::from_value(self.body.clone()).map_err(|e| format!("malformed response: {e}"))
    }
}

/// Turn a ureq result into a reply, keeping non-2xx responses.
///
/// `Err` carries the transport failure text (DNS, refused, timeout).
pub(crate) fn into_reply(result: Result<ureq::Response, ureq::Error>) -> Result<HttpReply, String> {
    match result {
        Ok(response) | Err(ureq::Error::Status(_, response)) => Ok(read_reply(response)),
        Err(ureq::Error::Transport(transport)) => Err(transport.to_string()),
    }
}

fn read_reply(response: ureq::Response) -> HttpReply {
    let status = response.status();
    let status_text = response.status_text().to_string();
    let body = response
        .into_string()
        .ok()
        .and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or(Value::Null);
    HttpReply {
        status,
        status_text,
        body,
    }
}

/// Run a blocking request off the async executor.
pub(crate) async fn run_blocking<F>(request: F) -> Result<HttpReply, String>
where
    F: FnOnce() -> Result<HttpReply, String> + Send + 'static,
{
    tokio::task::spawn_blocking(request)
        .await
        .map_err(|e| format!("request task failed: {e}"))?
}
