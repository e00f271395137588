//! Container label schema.
//!
//! Containers opt in by carrying both [`IP_LABEL`] and [`URL_LABEL`].  Every
//! other label is optional and tunes how the individual backends are
//! configured.

use std::collections::HashMap;

use crate::error::LabelError;
use crate::types::{AdguardHomeOptions, PiholeOptions, ProxyOptions, RoutingConfig, Scheme};

pub const IP_LABEL: &str = "plugNPiN.ip";
pub const URL_LABEL: &str = "plugNPiN.url";

pub const NPM_ADVANCED_CONFIG_LABEL: &str = "plugNPiN.npmOptions.advancedConfig";
pub const NPM_BLOCK_EXPLOITS_LABEL: &str = "plugNPiN.npmOptions.blockExploits";
pub const NPM_CACHING_ENABLED_LABEL: &str = "plugNPiN.npmOptions.cachingEnabled";
pub const NPM_CERTIFICATE_NAME_LABEL: &str = "plugNPiN.npmOptions.certificateName";
pub const NPM_HTTP2_SUPPORT_LABEL: &str = "plugNPiN.npmOptions.http2Support";
pub const NPM_HSTS_ENABLED_LABEL: &str = "plugNPiN.npmOptions.hstsEnabled";
pub const NPM_HSTS_SUBDOMAINS_LABEL: &str = "plugNPiN.npmOptions.hstsSubdomains";
pub const NPM_SCHEME_LABEL: &str = "plugNPiN.npmOptions.scheme";
pub const NPM_SSL_FORCED_LABEL: &str = "plugNPiN.npmOptions.forceSsl";
pub const NPM_WEBSOCKETS_SUPPORT_LABEL: &str = "plugNPiN.npmOptions.websocketsSupport";

pub const PIHOLE_TARGET_DOMAIN_LABEL: &str = "plugNPiN.piholeOptions.targetDomain";
pub const ADGUARD_HOME_TARGET_DOMAIN_LABEL: &str = "plugNPiN.adguardHomeOptions.targetDomain";

/// Labels a container must carry to be seen at all.  Used as the runtime
/// filter for both listing and the event subscription.
pub const REQUIRED_LABELS: [&str; 2] = [IP_LABEL, URL_LABEL];

/// Parses a container's labels into a routing configuration.
pub fn parse(labels: &HashMap<String, String>) -> Result<RoutingConfig, LabelError> {
    let raw_address = labels
        .get(IP_LABEL)
        .ok_or(LabelError::MissingRequiredLabel(IP_LABEL))?;
    let domain = labels
        .get(URL_LABEL)
        .ok_or(LabelError::MissingRequiredLabel(URL_LABEL))?;

    let (address, port) = parse_address(raw_address)?;
    let scheme = parse_scheme(labels.get(NPM_SCHEME_LABEL).map(String::as_str))?;

    // Absent means on; present but unparsable means off.
    let block_exploits = labels
        .get(NPM_BLOCK_EXPLOITS_LABEL)
        .map_or(true, |v| parse_bool(v).unwrap_or(false));

    let proxy = ProxyOptions {
        scheme,
        advanced_config: labels
            .get(NPM_ADVANCED_CONFIG_LABEL)
            .cloned()
            .unwrap_or_default(),
        allow_websocket_upgrade: flag(labels, NPM_WEBSOCKETS_SUPPORT_LABEL),
        block_exploits,
        caching_enabled: flag(labels, NPM_CACHING_ENABLED_LABEL),
        certificate_name: non_empty(labels, NPM_CERTIFICATE_NAME_LABEL),
        http2_support: flag(labels, NPM_HTTP2_SUPPORT_LABEL),
        hsts_enabled: flag(labels, NPM_HSTS_ENABLED_LABEL),
        hsts_subdomains: flag(labels, NPM_HSTS_SUBDOMAINS_LABEL),
        ssl_forced: flag(labels, NPM_SSL_FORCED_LABEL),
    };

    Ok(RoutingConfig {
        address,
        port,
        domain: domain.clone(),
        proxy,
        pihole: PiholeOptions {
            target_domain: non_empty(labels, PIHOLE_TARGET_DOMAIN_LABEL),
        },
        adguard_home: AdguardHomeOptions {
            target_domain: non_empty(labels, ADGUARD_HOME_TARGET_DOMAIN_LABEL),
        },
    })
}

/// Splits `host:port`.  Exactly one `:` is allowed.
fn parse_address(value: &str) -> Result<(String, u16), LabelError> {
    let (host, port) = value.split_once(':').ok_or_else(|| LabelError::MalformedAddress {
        label: IP_LABEL,
        reason: "missing ':'".to_string(),
    })?;
    if port.contains(':') {
        return Err(LabelError::MalformedAddress {
            label: IP_LABEL,
            reason: "must contain a single ':'".to_string(),
        });
    }

    if host.is_empty() {
        return Err(LabelError::MalformedAddress {
            label: IP_LABEL,
            reason: "missing host before ':'".to_string(),
        });
    }

    let port = match port.parse::<u16>() {
        Ok(p) if p > 0 => p,
        _ => {
            return Err(LabelError::MalformedAddress {
                label: IP_LABEL,
                reason: format!("value after ':' must be a port number, got '{}'", port),
            })
        }
    };

    Ok((host.to_string(), port))
}

fn parse_scheme(value: Option<&str>) -> Result<Scheme, LabelError> {
    let Some(value) = value else {
        return Ok(Scheme::Http);
    };
    match value.to_ascii_lowercase().as_str() {
        "http" => Ok(Scheme::Http),
        "https" => Ok(Scheme::Https),
        _ => Err(LabelError::InvalidScheme {
            label: NPM_SCHEME_LABEL,
            value: value.to_string(),
        }),
    }
}

/// Permissive boolean parsing: `1/0`, `t/f`, `true/false`, any case.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "t" | "true" => Some(true),
        "0" | "f" | "false" => Some(false),
        _ => None,
    }
}

fn flag(labels: &HashMap<String, String>, key: &str) -> bool {
    labels
        .get(key)
        .and_then(|v| parse_bool(v))
        .unwrap_or(false)
}

fn non_empty(labels: &HashMap<String, String>, key: &str) -> Option<String> {
    labels
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
