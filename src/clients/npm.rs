//! Nginx Proxy Manager client.

use std::collections::HashMap;

use async_trait::async_trait;
use log::{debug, info};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};

use super::session::Session;
use super::{check_status, error_message, ProxyRegistry};
use crate::error::ClientError;
use crate::types::{NewProxyHost, Scheme};

const NAME: &str = "Nginx Proxy Manager";

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    identity: &'a str,
    secret: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenReply {
    #[serde(default)]
    token: String,
}

#[derive(Debug, Deserialize)]
struct ProxyHostReply {
    id: i64,
    #[serde(default)]
    domain_names: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CertificateReply {
    id: i64,
    #[serde(default)]
    nice_name: String,
}

#[derive(Debug, Serialize)]
struct ProxyHostPayload<'a> {
    domain_names: [&'a str; 1],
    forward_scheme: Scheme,
    forward_host: &'a str,
    forward_port: u16,
    certificate_id: i64,
    advanced_config: &'a str,
    allow_websocket_upgrade: bool,
    block_exploits: bool,
    caching_enabled: bool,
    http2_support: bool,
    hsts_enabled: bool,
    hsts_subdomains: bool,
    ssl_forced: bool,
    locations: Vec<serde_json::Value>,
    meta: serde_json::Map<String, serde_json::Value>,
}

impl<'a> From<&'a NewProxyHost> for ProxyHostPayload<'a> {
    fn from(host: &'a NewProxyHost) -> Self {
        let o = &host.options;
        Self {
            domain_names: [host.domain.as_str()],
            forward_scheme: o.scheme,
            forward_host: &host.forward_host,
            forward_port: host.forward_port,
            certificate_id: host.certificate_id.unwrap_or(0),
            advanced_config: &o.advanced_config,
            allow_websocket_upgrade: o.allow_websocket_upgrade,
            block_exploits: o.block_exploits,
            caching_enabled: o.caching_enabled,
            http2_support: o.http2_support,
            hsts_enabled: o.hsts_enabled,
            hsts_subdomains: o.hsts_subdomains,
            ssl_forced: o.ssl_forced,
            locations: Vec::new(),
            meta: serde_json::Map::new(),
        }
    }
}

pub struct NpmClient {
    http: reqwest::Client,
    base_url: String,
    address: String,
    identity: String,
    secret: String,
    session: Session,
}

impl NpmClient {
    /// `host` is the admin UI base URL, e.g. `http://192.168.1.2:81`.  Its
    /// host part doubles as the address DNS records point at.
    pub fn new(
        http: reqwest::Client,
        host: &str,
        identity: impl Into<String>,
        secret: impl Into<String>,
    ) -> Result<Self, ClientError> {
        let host = host.trim_end_matches('/');
        let url = if host.contains("://") {
            Url::parse(host)
        } else {
            Url::parse(&format!("http://{}", host))
        }
        .map_err(|e| ClientError::Url(format!("{}: {}", host, e)))?;
        let address = url
            .host_str()
            .ok_or_else(|| ClientError::Url(format!("{}: no host", host)))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();

        Ok(Self {
            http,
            base_url: format!("{}/api", url.as_str().trim_end_matches('/')),
            address,
            identity: identity.into(),
            secret: secret.into(),
            session: Session::new(),
        })
    }

    /// Logs in eagerly so bad credentials surface at startup.
    pub async fn login(&self) -> Result<(), ClientError> {
        self.session.token(|| self.request_token()).await.map(|_| ())
    }

    async fn request_token(&self) -> Result<String, ClientError> {
        let resp = self
            .http
            .post(format!("{}/tokens", self.base_url))
            .json(&LoginRequest {
                identity: &self.identity,
                secret: &self.secret,
            })
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(ClientError::Login(error_message(&body)));
        }
        match serde_json::from_str::<TokenReply>(&body) {
            Ok(reply) if !reply.token.is_empty() => Ok(reply.token),
            _ => Err(ClientError::Login(error_message(&body))),
        }
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .session
            .send(NAME, || self.request_token(), |token| {
                self.http.get(&url).bearer_auth(token)
            })
            .await?;
        Ok(check_status(resp).await?.json().await?)
    }
}

#[async_trait]
impl ProxyRegistry for NpmClient {
    fn name(&self) -> &'static str {
        NAME
    }

    fn address(&self) -> &str {
        &self.address
    }

    async fn list_hosts(&self) -> Result<HashMap<String, i64>, ClientError> {
        let hosts: Vec<ProxyHostReply> = self.get("/nginx/proxy-hosts").await?;
        Ok(hosts
            .into_iter()
            .flat_map(|h| h.domain_names.into_iter().map(move |d| (d, h.id)))
            .collect())
    }

    async fn find_certificate(&self, name: &str) -> Result<Option<i64>, ClientError> {
        let certificates: Vec<CertificateReply> = self.get("/nginx/certificates").await?;
        Ok(certificates
            .into_iter()
            .find(|c| c.nice_name == name)
            .map(|c| c.id))
    }

    async fn add_host(&self, host: &NewProxyHost) -> Result<(), ClientError> {
        let url = format!("{}/nginx/proxy-hosts", self.base_url);
        let payload = ProxyHostPayload::from(host);
        let resp = self
            .session
            .send(NAME, || self.request_token(), |token| {
                self.http.post(&url).bearer_auth(token).json(&payload)
            })
            .await?;

        match check_status(resp).await {
            Ok(_) => Ok(()),
            Err(ClientError::Status { status: 400, message })
                if message.contains("already in use") =>
            {
                debug!("Proxy host for {} already exists: {}", host.domain, message);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn delete_host(&self, id: i64) -> Result<(), ClientError> {
        let url = format!("{}/nginx/proxy-hosts/{}", self.base_url, id);
        let resp = self
            .session
            .send(NAME, || self.request_token(), |token| {
                self.http.delete(&url).bearer_auth(token)
            })
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            info!("Proxy host {} was already deleted", id);
            return Ok(());
        }
        check_status(resp).await.map(|_| ())
    }
}
