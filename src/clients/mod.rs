//! Registry backends.
//!
//! The engine only sees the two traits below.  Each concrete client is a
//! thin HTTP adapter; all of them treat "already there" on add and
//! "already gone" on delete as success.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Response, StatusCode};

use crate::error::ClientError;
use crate::types::{DnsRecord, NewProxyHost};

pub mod adguardhome;
pub mod npm;
pub mod pihole;
pub mod session;

pub use adguardhome::AdguardHomeClient;
pub use npm::NpmClient;
pub use pihole::PiholeClient;

/// A DNS backend holding domain → address / alias records.
#[async_trait]
pub trait DnsRegistry: Send + Sync {
    /// Short backend name used in logs.
    fn name(&self) -> &'static str;

    /// Whether a domain can hold only one record regardless of kind.  When
    /// true any record for the domain counts as already present.
    fn one_record_per_domain(&self) -> bool {
        false
    }

    /// Current records, re-read on every call.
    async fn list_records(&self) -> Result<Vec<DnsRecord>, ClientError>;

    async fn add_record(&self, record: &DnsRecord) -> Result<(), ClientError>;

    async fn delete_record(&self, record: &DnsRecord) -> Result<(), ClientError>;
}

/// A reverse-proxy backend holding one host per domain.
#[async_trait]
pub trait ProxyRegistry: Send + Sync {
    fn name(&self) -> &'static str;

    /// Address DNS records should point at so traffic flows through the proxy.
    fn address(&self) -> &str;

    /// Current hosts as domain → backend identifier.
    async fn list_hosts(&self) -> Result<HashMap<String, i64>, ClientError>;

    /// Looks up a certificate by display name.
    async fn find_certificate(&self, name: &str) -> Result<Option<i64>, ClientError>;

    async fn add_host(&self, host: &NewProxyHost) -> Result<(), ClientError>;

    async fn delete_host(&self, id: i64) -> Result<(), ClientError>;
}

/// Upper bound for one backend request, so a stalled backend cannot hold
/// up the event loop or shutdown.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client shared by every backend.
pub fn http_client(timeout: Duration) -> Result<reqwest::Client, ClientError> {
    Ok(reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(CONNECT_TIMEOUT.min(timeout))
        .build()?)
}

/// Turns a non-success response into a [`ClientError`].
pub(crate) async fn check_status(resp: Response) -> Result<Response, ClientError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status == StatusCode::UNAUTHORIZED {
        return Err(ClientError::Unauthorized);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ClientError::Status {
        status: status.as_u16(),
        message: error_message(&body),
    })
}

/// Pulls `error.message` (or a bare `message`) out of a JSON error body,
/// falling back to the raw text.
pub(crate) fn error_message(body: &str) -> String {
    let value: serde_json::Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(_) => return body.trim().to_string(),
    };
    value
        .pointer("/error/message")
        .or_else(|| value.pointer("/message"))
        .and_then(|m| m.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| body.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn stalled_backend_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/control/rewrite/list"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!([]))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let http = http_client(Duration::from_millis(100)).unwrap();
        let client = AdguardHomeClient::new(http, &server.uri(), "admin", "pw");
        match client.list_records().await {
            Err(ClientError::Http(e)) => assert!(e.is_timeout()),
            other => panic!("expected a timeout, got {:?}", other),
        }
    }

    #[test]
    fn error_message_prefers_nested_message() {
        assert_eq!(
            error_message(r#"{"error":{"code":400,"message":"Domain already in use"}}"#),
            "Domain already in use"
        );
        assert_eq!(error_message(r#"{"message":"nope"}"#), "nope");
        assert_eq!(error_message("plain text\n"), "plain text");
        assert_eq!(error_message(r#"{"other":1}"#), r#"{"other":1}"#);
    }
}
