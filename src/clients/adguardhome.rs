//! AdGuard Home client managing DNS rewrites.
//!
//! AdGuard Home uses HTTP basic auth on every request, so there is no
//! session to refresh.  A rewrite has a single `answer` field that holds
//! either an IP or a domain; see [`DnsTarget::from_answer`].

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};

use super::{check_status, DnsRegistry};
use crate::error::ClientError;
use crate::types::{DnsRecord, DnsTarget};

const NAME: &str = "AdGuard Home";

#[derive(Debug, Serialize, Deserialize)]
struct Rewrite {
    domain: String,
    answer: String,
}

pub struct AdguardHomeClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
}

impl AdguardHomeClient {
    pub fn new(
        http: reqwest::Client,
        host: &str,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            http,
            base_url: format!("{}/control", host.trim_end_matches('/')),
            username: username.into(),
            password: password.into(),
        }
    }

    async fn post(&self, path: &str, record: &DnsRecord) -> Result<(), ClientError> {
        let payload = Rewrite {
            domain: record.domain.clone(),
            answer: record.target.value().to_string(),
        };
        let resp = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .basic_auth(&self.username, Some(&self.password))
            .json(&payload)
            .send()
            .await?;
        check_status(resp).await.map(|_| ())
    }
}

#[async_trait]
impl DnsRegistry for AdguardHomeClient {
    fn name(&self) -> &'static str {
        NAME
    }

    // A rewrite has a single answer field for both addresses and aliases.
    fn one_record_per_domain(&self) -> bool {
        true
    }

    async fn list_records(&self) -> Result<Vec<DnsRecord>, ClientError> {
        let resp = self
            .http
            .get(format!("{}/rewrite/list", self.base_url))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;
        let rewrites: Vec<Rewrite> = check_status(resp).await?.json().await?;
        Ok(rewrites
            .into_iter()
            .map(|r| DnsRecord {
                target: DnsTarget::from_answer(&r.answer),
                domain: r.domain,
            })
            .collect())
    }

    async fn add_record(&self, record: &DnsRecord) -> Result<(), ClientError> {
        match self.post("/rewrite/add", record).await {
            Err(ClientError::Status { status: 400, message }) if message.contains("exists") => {
                debug!("Rewrite for {} already exists", record.domain);
                Ok(())
            }
            other => other,
        }
    }

    async fn delete_record(&self, record: &DnsRecord) -> Result<(), ClientError> {
        match self.post("/rewrite/delete", record).await {
            Err(ClientError::Status { status: 400 | 404, message })
                if message.contains("not found") =>
            {
                debug!("Rewrite for {} already absent", record.domain);
                Ok(())
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{basic_auth, body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> AdguardHomeClient {
        AdguardHomeClient::new(reqwest::Client::new(), &server.uri(), "admin", "pw")
    }

    #[tokio::test]
    async fn rewrites_hold_one_answer_per_domain() {
        let server = MockServer::start().await;
        assert!(client(&server).one_record_per_domain());
    }

    #[tokio::test]
    async fn lists_rewrites_with_inferred_kind() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/control/rewrite/list"))
            .and(basic_auth("admin", "pw"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"domain": "a.example", "answer": "192.168.1.2", "enabled": true},
                {"domain": "b.example", "answer": "a.example", "enabled": true}
            ])))
            .mount(&server)
            .await;

        let records = client(&server).list_records().await.unwrap();
        assert_eq!(
            records,
            vec![
                DnsRecord {
                    domain: "a.example".into(),
                    target: DnsTarget::Address("192.168.1.2".into())
                },
                DnsRecord {
                    domain: "b.example".into(),
                    target: DnsTarget::Alias("a.example".into())
                },
            ]
        );
    }

    #[tokio::test]
    async fn add_and_delete_post_domain_and_answer() {
        let server = MockServer::start().await;
        let body = json!({"domain": "svc.example", "answer": "alt.example"});
        Mock::given(method("POST"))
            .and(path("/control/rewrite/add"))
            .and(body_json(body.clone()))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/control/rewrite/delete"))
            .and(body_json(body))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let record = DnsRecord {
            domain: "svc.example".into(),
            target: DnsTarget::Alias("alt.example".into()),
        };
        let c = client(&server);
        c.add_record(&record).await.unwrap();
        c.delete_record(&record).await.unwrap();
    }

    #[tokio::test]
    async fn unauthorized_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;
        assert!(matches!(
            client(&server).list_records().await.unwrap_err(),
            ClientError::Unauthorized
        ));
    }
}
