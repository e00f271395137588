//! Pi-hole (v6 API) client managing local DNS and CNAME records.

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::{Method, StatusCode, Url};
use serde::{Deserialize, Serialize};

use super::session::Session;
use super::{check_status, error_message, DnsRegistry};
use crate::error::ClientError;
use crate::types::{DnsRecord, DnsTarget};

const NAME: &str = "Pi-hole";
const SID_HEADER: &str = "X-FTL-SID";

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    password: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct LoginReply {
    #[serde(default)]
    session: LoginSession,
}

#[derive(Debug, Default, Deserialize)]
struct LoginSession {
    #[serde(default)]
    sid: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConfigReply {
    config: ConfigSection,
}

#[derive(Debug, Deserialize)]
struct ConfigSection {
    dns: DnsSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DnsSection {
    #[serde(default)]
    hosts: Vec<String>,
    #[serde(default)]
    cname_records: Vec<String>,
}

pub struct PiholeClient {
    http: reqwest::Client,
    base_url: Url,
    password: String,
    session: Session,
}

impl PiholeClient {
    pub fn new(
        http: reqwest::Client,
        host: &str,
        password: impl Into<String>,
    ) -> Result<Self, ClientError> {
        let raw = format!("{}/api/", host.trim_end_matches('/'));
        let base_url = Url::parse(&raw).map_err(|e| ClientError::Url(format!("{}: {}", raw, e)))?;
        Ok(Self {
            http,
            base_url,
            password: password.into(),
            session: Session::new(),
        })
    }

    /// Logs in eagerly so bad credentials surface at startup.
    pub async fn login(&self) -> Result<(), ClientError> {
        self.session.token(|| self.request_sid()).await.map(|_| ())
    }

    async fn request_sid(&self) -> Result<String, ClientError> {
        let resp = self
            .http
            .post(self.url(&["auth"])?)
            .json(&LoginRequest {
                password: &self.password,
            })
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        let reply: LoginReply = serde_json::from_str(&body).unwrap_or_default();
        match reply.session.sid {
            Some(sid) if status.is_success() && !sid.is_empty() => Ok(sid),
            _ => Err(ClientError::Login(
                reply
                    .session
                    .message
                    .unwrap_or_else(|| error_message(&body)),
            )),
        }
    }

    /// Builds a URL below `/api/`, percent-encoding each segment.
    fn url(&self, segments: &[&str]) -> Result<Url, ClientError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ClientError::Url(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn request(&self, method: Method, url: Url) -> Result<reqwest::Response, ClientError> {
        self.session
            .send(NAME, || self.request_sid(), |sid| {
                self.http
                    .request(method.clone(), url.clone())
                    .header(SID_HEADER, sid)
            })
            .await
    }

    async fn dns_section(&self, key: &str) -> Result<DnsSection, ClientError> {
        let resp = self
            .request(Method::GET, self.url(&["config", "dns", key])?)
            .await?;
        let reply: ConfigReply = check_status(resp).await?.json().await?;
        Ok(reply.config.dns)
    }

    /// `(collection, entry)` as addressed by the config API.
    fn entry(record: &DnsRecord) -> (&'static str, String) {
        match &record.target {
            DnsTarget::Address(ip) => ("hosts", format!("{} {}", ip, record.domain)),
            DnsTarget::Alias(target) => ("cnameRecords", format!("{},{}", record.domain, target)),
        }
    }
}

/// `"IP HOSTNAME [HOSTNAME...]"`
fn parse_host_entry(entry: &str) -> Option<Vec<DnsRecord>> {
    let mut parts = entry.split_whitespace();
    let ip = parts.next()?;
    let records: Vec<DnsRecord> = parts
        .map(|domain| DnsRecord {
            domain: domain.to_string(),
            target: DnsTarget::Address(ip.to_string()),
        })
        .collect();
    (!records.is_empty()).then_some(records)
}

/// `"domain,target[,ttl]"`
fn parse_cname_entry(entry: &str) -> Option<DnsRecord> {
    let mut parts = entry.split(',').map(str::trim);
    let domain = parts.next().filter(|d| !d.is_empty())?;
    let target = parts.next().filter(|t| !t.is_empty())?;
    Some(DnsRecord {
        domain: domain.to_string(),
        target: DnsTarget::Alias(target.to_string()),
    })
}

#[async_trait]
impl DnsRegistry for PiholeClient {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn list_records(&self) -> Result<Vec<DnsRecord>, ClientError> {
        let mut records = Vec::new();

        for entry in self.dns_section("hosts").await?.hosts {
            match parse_host_entry(&entry) {
                Some(parsed) => records.extend(parsed),
                None => warn!("Ignoring bad DNS host entry from Pi-hole: {:?}", entry),
            }
        }
        for entry in self.dns_section("cnameRecords").await?.cname_records {
            match parse_cname_entry(&entry) {
                Some(parsed) => records.push(parsed),
                None => warn!("Ignoring bad CNAME entry from Pi-hole: {:?}", entry),
            }
        }

        Ok(records)
    }

    async fn add_record(&self, record: &DnsRecord) -> Result<(), ClientError> {
        let (collection, entry) = Self::entry(record);
        self.put_entry(collection, &entry).await
    }

    async fn delete_record(&self, record: &DnsRecord) -> Result<(), ClientError> {
        let DnsTarget::Address(ip) = &record.target else {
            let (collection, entry) = Self::entry(record);
            return self.delete_entry(collection, &entry).await;
        };

        // Host lines may carry several names.  Such a line is rewritten
        // without this domain so the other names survive.
        let hosts = self.dns_section("hosts").await?.hosts;
        let Some(line) = hosts.iter().find(|line| {
            let mut parts = line.split_whitespace();
            parts.next() == Some(ip.as_str()) && parts.any(|d| d == record.domain)
        }) else {
            debug!("Pi-hole entry for {} -> {} already absent", record.domain, ip);
            return Ok(());
        };

        let others: Vec<&str> = line
            .split_whitespace()
            .skip(1)
            .filter(|d| *d != record.domain)
            .collect();
        self.delete_entry("hosts", line).await?;
        if !others.is_empty() {
            debug!("Keeping {} on Pi-hole host line for {}", others.join(" "), ip);
            self.put_entry("hosts", &format!("{} {}", ip, others.join(" ")))
                .await?;
        }
        Ok(())
    }
}

impl PiholeClient {
    async fn put_entry(&self, collection: &str, entry: &str) -> Result<(), ClientError> {
        let url = self.url(&["config", "dns", collection, entry])?;
        let resp = self.request(Method::PUT, url).await?;
        match check_status(resp).await {
            Ok(_) => Ok(()),
            Err(ClientError::Status { status: 400, message })
                if message.to_ascii_lowercase().contains("already present") =>
            {
                debug!("Pi-hole entry {:?} already present", entry);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn delete_entry(&self, collection: &str, entry: &str) -> Result<(), ClientError> {
        let url = self.url(&["config", "dns", collection, entry])?;
        let resp = self.request(Method::DELETE, url).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            debug!("Pi-hole entry {:?} already absent", entry);
            return Ok(());
        }
        check_status(resp).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client(server: &MockServer) -> PiholeClient {
        Mock::given(method("POST"))
            .and(path("/api/auth"))
            .and(body_json(json!({"password": "pw"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "session": {"valid": true, "sid": "sid-1", "validity": 300, "message": "password correct"}
            })))
            .mount(server)
            .await;
        PiholeClient::new(reqwest::Client::new(), &server.uri(), "pw").unwrap()
    }

    fn address(domain: &str, ip: &str) -> DnsRecord {
        DnsRecord {
            domain: domain.into(),
            target: DnsTarget::Address(ip.into()),
        }
    }

    fn alias(domain: &str, target: &str) -> DnsRecord {
        DnsRecord {
            domain: domain.into(),
            target: DnsTarget::Alias(target.into()),
        }
    }

    #[test]
    fn parses_host_entries() {
        assert_eq!(
            parse_host_entry("192.168.1.2 a.example b.example"),
            Some(vec![address("a.example", "192.168.1.2"), address("b.example", "192.168.1.2")])
        );
        assert_eq!(parse_host_entry("192.168.1.2"), None);
        assert_eq!(parse_host_entry(""), None);
    }

    #[test]
    fn parses_cname_entries() {
        assert_eq!(parse_cname_entry("a.example,b.example"), Some(alias("a.example", "b.example")));
        assert_eq!(
            parse_cname_entry("a.example,b.example,300"),
            Some(alias("a.example", "b.example"))
        );
        assert_eq!(parse_cname_entry("a.example"), None);
        assert_eq!(parse_cname_entry(",b.example"), None);
    }

    #[tokio::test]
    async fn login_failure_reports_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/auth"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "session": {"valid": false, "sid": null, "message": "password incorrect"}
            })))
            .mount(&server)
            .await;
        let c = PiholeClient::new(reqwest::Client::new(), &server.uri(), "bad").unwrap();
        match c.login().await.unwrap_err() {
            ClientError::Login(msg) => assert_eq!(msg, "password incorrect"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn lists_hosts_and_cnames() {
        let server = MockServer::start().await;
        let c = client(&server).await;
        Mock::given(method("GET"))
            .and(path("/api/config/dns/hosts"))
            .and(header(SID_HEADER, "sid-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "config": {"dns": {"hosts": ["192.168.1.2 a.example", "garbage"]}}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/config/dns/cnameRecords"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "config": {"dns": {"cnameRecords": ["b.example,a.example"]}}
            })))
            .mount(&server)
            .await;

        let records = c.list_records().await.unwrap();
        assert_eq!(
            records,
            vec![address("a.example", "192.168.1.2"), alias("b.example", "a.example")]
        );
    }

    #[tokio::test]
    async fn adds_host_entry_with_encoded_path() {
        let server = MockServer::start().await;
        let c = client(&server).await;
        Mock::given(method("PUT"))
            .and(path("/api/config/dns/hosts/192.168.1.2%20svc.example"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;
        c.add_record(&address("svc.example", "192.168.1.2")).await.unwrap();
    }

    #[tokio::test]
    async fn adds_cname_entry() {
        let server = MockServer::start().await;
        let c = client(&server).await;
        Mock::given(method("PUT"))
            .and(path("/api/config/dns/cnameRecords/svc.example,alt.example"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;
        c.add_record(&alias("svc.example", "alt.example")).await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_add_is_success() {
        let server = MockServer::start().await;
        let c = client(&server).await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": {"key": "bad_request", "message": "Item already present", "hint": null}
            })))
            .mount(&server)
            .await;
        c.add_record(&address("svc.example", "192.168.1.2")).await.unwrap();
    }

    #[tokio::test]
    async fn delete_of_absent_entry_is_success() {
        let server = MockServer::start().await;
        let c = client(&server).await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;
        c.delete_record(&alias("svc.example", "alt.example")).await.unwrap();
    }

    async fn mount_hosts(server: &MockServer, hosts: serde_json::Value) {
        Mock::given(method("GET"))
            .and(path("/api/config/dns/hosts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "config": {"dns": {"hosts": hosts}}
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn deletes_single_host_line() {
        let server = MockServer::start().await;
        let c = client(&server).await;
        mount_hosts(&server, json!(["192.168.1.2 svc.example"])).await;
        Mock::given(method("DELETE"))
            .and(path("/api/config/dns/hosts/192.168.1.2%20svc.example"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(201))
            .expect(0)
            .mount(&server)
            .await;
        c.delete_record(&address("svc.example", "192.168.1.2")).await.unwrap();
    }

    #[tokio::test]
    async fn delete_from_shared_host_line_keeps_other_names() {
        let server = MockServer::start().await;
        let c = client(&server).await;
        mount_hosts(&server, json!(["192.168.1.2 a.example svc.example b.example"])).await;
        Mock::given(method("DELETE"))
            .and(path("/api/config/dns/hosts/192.168.1.2%20a.example%20svc.example%20b.example"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/api/config/dns/hosts/192.168.1.2%20a.example%20b.example"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;
        c.delete_record(&address("svc.example", "192.168.1.2")).await.unwrap();
    }

    #[tokio::test]
    async fn delete_of_missing_host_sends_nothing() {
        let server = MockServer::start().await;
        let c = client(&server).await;
        mount_hosts(&server, json!(["192.168.1.9 svc.example"])).await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(204))
            .expect(0)
            .mount(&server)
            .await;
        c.delete_record(&address("svc.example", "192.168.1.2")).await.unwrap();
    }

    #[tokio::test]
    async fn expired_sid_is_refreshed_once() {
        let server = MockServer::start().await;
        let c = client(&server).await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(401))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;
        c.delete_record(&alias("svc.example", "alt.example")).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.iter().filter(|r| r.url.path() == "/api/auth").count(), 2);
    }
}
