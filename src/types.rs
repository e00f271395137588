//! Data structures shared by the label schema, the reconciliation engine
//! and the registry adapters.
//!
//! A [`RoutingConfig`] is derived from a container's labels every time the
//! container is looked at.  It is never stored; the registries themselves
//! are the only source of truth for what currently exists.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// A container lifecycle transition, normalised from the runtime's action
/// strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerEvent {
    /// The container is running and should be routed.
    Start,
    /// The container has stopped (`die`, `stop` or `kill`) and its routes
    /// should be removed.
    Die,
}

impl ContainerEvent {
    /// Maps a runtime action string onto a transition.  Actions that do not
    /// affect routing (`create`, `pause`, `exec_start`, ...) yield `None`.
    pub fn from_action(action: &str) -> Option<Self> {
        match action {
            "start" => Some(Self::Start),
            "die" | "stop" | "kill" => Some(Self::Die),
            _ => None,
        }
    }
}

impl fmt::Display for ContainerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => f.write_str("start"),
            Self::Die => f.write_str("die"),
        }
    }
}

/// Scheme the reverse proxy uses to reach the container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => f.write_str("http"),
            Self::Https => f.write_str("https"),
        }
    }
}

/// Reverse-proxy behaviour requested through `plugNPiN.npmOptions.*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyOptions {
    pub scheme: Scheme,
    pub advanced_config: String,
    pub allow_websocket_upgrade: bool,
    pub block_exploits: bool,
    pub caching_enabled: bool,
    /// Name of an existing certificate to attach, looked up by its display name.
    pub certificate_name: Option<String>,
    pub http2_support: bool,
    pub hsts_enabled: bool,
    pub hsts_subdomains: bool,
    pub ssl_forced: bool,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            scheme: Scheme::Http,
            advanced_config: String::new(),
            allow_websocket_upgrade: false,
            block_exploits: true,
            caching_enabled: false,
            certificate_name: None,
            http2_support: false,
            hsts_enabled: false,
            hsts_subdomains: false,
            ssl_forced: false,
        }
    }
}

/// Options for the local DNS backend (Pi-hole).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PiholeOptions {
    /// When set, a CNAME to this domain is managed instead of an A record.
    pub target_domain: Option<String>,
}

/// Options for the DNS rewrite backend (AdGuard Home).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdguardHomeOptions {
    /// When set, the rewrite answers with this domain instead of an IP.
    pub target_domain: Option<String>,
}

/// Everything the engine needs to route one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingConfig {
    /// Host the proxy forwards to.
    pub address: String,
    pub port: u16,
    /// Public hostname.
    pub domain: String,
    pub proxy: ProxyOptions,
    pub pihole: PiholeOptions,
    pub adguard_home: AdguardHomeOptions,
}

/// What a DNS record resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DnsTarget {
    /// A/AAAA-style record.
    Address(String),
    /// CNAME-style record.
    Alias(String),
}

impl DnsTarget {
    /// Classifies a raw answer: anything that parses as an IP address is an
    /// address record, everything else an alias.
    pub fn from_answer(answer: &str) -> Self {
        if answer.parse::<IpAddr>().is_ok() {
            Self::Address(answer.to_string())
        } else {
            Self::Alias(answer.to_string())
        }
    }

    pub fn value(&self) -> &str {
        match self {
            Self::Address(v) | Self::Alias(v) => v,
        }
    }

    pub fn is_alias(&self) -> bool {
        matches!(self, Self::Alias(_))
    }
}

impl fmt::Display for DnsTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Address(ip) => write!(f, "A {}", ip),
            Self::Alias(target) => write!(f, "CNAME {}", target),
        }
    }
}

/// One entry as currently stored by a DNS backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DnsRecord {
    pub domain: String,
    pub target: DnsTarget,
}

/// A proxy host to be created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewProxyHost {
    pub domain: String,
    pub forward_host: String,
    pub forward_port: u16,
    pub certificate_id: Option<i64>,
    pub options: ProxyOptions,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actions_normalise_to_two_states() {
        assert_eq!(ContainerEvent::from_action("start"), Some(ContainerEvent::Start));
        assert_eq!(ContainerEvent::from_action("die"), Some(ContainerEvent::Die));
        assert_eq!(ContainerEvent::from_action("stop"), Some(ContainerEvent::Die));
        assert_eq!(ContainerEvent::from_action("kill"), Some(ContainerEvent::Die));
        assert_eq!(ContainerEvent::from_action("create"), None);
        assert_eq!(ContainerEvent::from_action("START"), None);
    }

    #[test]
    fn answers_are_classified_by_ip_parse() {
        assert_eq!(
            DnsTarget::from_answer("192.168.1.2"),
            DnsTarget::Address("192.168.1.2".into())
        );
        assert_eq!(DnsTarget::from_answer("::1"), DnsTarget::Address("::1".into()));
        assert_eq!(
            DnsTarget::from_answer("alt.example"),
            DnsTarget::Alias("alt.example".into())
        );
    }

    #[test]
    fn block_exploits_is_on_by_default() {
        let options = ProxyOptions::default();
        assert!(options.block_exploits);
        assert!(!options.caching_enabled);
        assert_eq!(options.scheme, Scheme::Http);
    }
}
