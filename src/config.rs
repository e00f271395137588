use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::ConfigError;

/// Environment variables read by the process.  Names are matched
/// case-insensitively and lowercased into the field names below.
const ENV_KEYS: [&str; 14] = [
    "DEBUG",
    "RUN_INTERVAL",
    "DOCKER_HOST",
    "DOCKER_HOSTS",
    "NGINX_PROXY_MANAGER_HOST",
    "NGINX_PROXY_MANAGER_USERNAME",
    "NGINX_PROXY_MANAGER_PASSWORD",
    "PIHOLE_DISABLED",
    "PIHOLE_HOST",
    "PIHOLE_PASSWORD",
    "ADGUARD_HOME_DISABLED",
    "ADGUARD_HOME_HOST",
    "ADGUARD_HOME_USERNAME",
    "ADGUARD_HOME_PASSWORD",
];

#[derive(Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(deserialize_with = "lenient_bool")]
    pub debug: bool,
    /// Go-style duration, e.g. `1h`, `15m`, `1h30m`.  `0` disables re-runs.
    #[serde(deserialize_with = "lenient_string")]
    pub run_interval: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker_host: Option<String>,
    /// Extra daemons, comma separated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker_hosts: Option<String>,

    pub nginx_proxy_manager_host: String,
    pub nginx_proxy_manager_username: String,
    #[serde(deserialize_with = "lenient_string")]
    pub nginx_proxy_manager_password: String,

    #[serde(deserialize_with = "lenient_bool")]
    pub pihole_disabled: bool,
    pub pihole_host: String,
    #[serde(deserialize_with = "lenient_string")]
    pub pihole_password: String,

    #[serde(deserialize_with = "lenient_bool")]
    pub adguard_home_disabled: bool,
    pub adguard_home_host: String,
    pub adguard_home_username: String,
    #[serde(deserialize_with = "lenient_string")]
    pub adguard_home_password: String,

    /// Parsed `run_interval`, filled in by [`Config::from_figment`].
    #[serde(skip)]
    pub interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debug: false,
            run_interval: "1h".into(),
            docker_host: None,
            docker_hosts: None,
            nginx_proxy_manager_host: String::new(),
            nginx_proxy_manager_username: String::new(),
            nginx_proxy_manager_password: String::new(),
            pihole_disabled: false,
            pihole_host: String::new(),
            pihole_password: String::new(),
            adguard_home_disabled: true,
            adguard_home_host: String::new(),
            adguard_home_username: String::new(),
            adguard_home_password: String::new(),
            interval: Duration::from_secs(3600),
        }
    }
}

// Keeps passwords out of the startup log.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("debug", &self.debug)
            .field("run_interval", &self.interval)
            .field("docker_hosts", &self.docker_hosts())
            .field("nginx_proxy_manager_host", &self.nginx_proxy_manager_host)
            .field("pihole_disabled", &self.pihole_disabled)
            .field("pihole_host", &self.pihole_host)
            .field("adguard_home_disabled", &self.adguard_home_disabled)
            .field("adguard_home_host", &self.adguard_home_host)
            .finish_non_exhaustive()
    }
}

impl Config {
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("plugnpin.toml"))
            .merge(Env::raw().only(&ENV_KEYS))
    }

    pub fn load(dry_run: bool) -> anyhow::Result<Self> {
        Self::from_figment(Self::figment(), dry_run)
    }

    pub fn from_figment(figment: Figment, dry_run: bool) -> anyhow::Result<Self> {
        let mut config: Config = figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        // Support Docker-style secrets
        for (var, field) in [
            ("NGINX_PROXY_MANAGER_PASSWORD_FILE", &mut config.nginx_proxy_manager_password),
            ("PIHOLE_PASSWORD_FILE", &mut config.pihole_password),
            ("ADGUARD_HOME_PASSWORD_FILE", &mut config.adguard_home_password),
        ] {
            if let Ok(secret_file) = std::env::var(var) {
                *field = std::fs::read_to_string(&secret_file)
                    .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", secret_file, e))?
                    .trim()
                    .to_string();
            }
        }

        config.interval = parse_duration(&config.run_interval)?;
        if !dry_run {
            config.validate()?;
        }
        Ok(config)
    }

    /// Checks that every enabled backend has what it needs to log in.
    /// Not needed in dry-run mode, where no backend is contacted.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("NGINX_PROXY_MANAGER_HOST", &self.nginx_proxy_manager_host, true),
            ("NGINX_PROXY_MANAGER_USERNAME", &self.nginx_proxy_manager_username, true),
            ("NGINX_PROXY_MANAGER_PASSWORD", &self.nginx_proxy_manager_password, true),
            ("PIHOLE_HOST", &self.pihole_host, !self.pihole_disabled),
            ("PIHOLE_PASSWORD", &self.pihole_password, !self.pihole_disabled),
            ("ADGUARD_HOME_HOST", &self.adguard_home_host, !self.adguard_home_disabled),
            ("ADGUARD_HOME_USERNAME", &self.adguard_home_username, !self.adguard_home_disabled),
            ("ADGUARD_HOME_PASSWORD", &self.adguard_home_password, !self.adguard_home_disabled),
        ];
        for (name, value, needed) in required {
            if needed && value.trim().is_empty() {
                return Err(ConfigError::Missing(name));
            }
        }
        Ok(())
    }

    /// Docker daemons to watch.  `None` stands for the local default.
    pub fn docker_hosts(&self) -> Vec<Option<String>> {
        let mut hosts: Vec<Option<String>> = Vec::new();
        let extra = self
            .docker_hosts
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(|h| Some(h.to_string()));

        hosts.push(self.docker_host.clone().filter(|h| !h.is_empty()));
        for host in extra {
            if !hosts.contains(&host) {
                hosts.push(host);
            }
        }
        // An explicit list replaces the implicit local daemon.
        if hosts.len() > 1 && hosts[0].is_none() {
            hosts.remove(0);
        }
        hosts
    }
}

/// Env values such as `RUN_INTERVAL=0` or a numeric password arrive as
/// numbers; they are still meant as text.
fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Int(i64),
        Float(f64),
        Bool(bool),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(s) => s,
        Raw::Int(i) => i.to_string(),
        Raw::Float(f) => f.to_string(),
        Raw::Bool(b) => b.to_string(),
    })
}

/// Booleans as Go's `strconv.ParseBool` reads them: `1`, `t`, `TRUE`, ...
fn lenient_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Bool(bool),
        Int(i64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Bool(b) => Ok(b),
        Raw::Int(1) => Ok(true),
        Raw::Int(0) => Ok(false),
        Raw::Int(i) => Err(serde::de::Error::custom(format!("invalid boolean '{}'", i))),
        Raw::Text(s) => crate::labels::parse_bool(s.trim())
            .ok_or_else(|| serde::de::Error::custom(format!("invalid boolean '{}'", s))),
    }
}

/// Parses a Go `time.Duration` string: a sequence of decimal numbers with
/// units `ns`, `us`, `µs`, `ms`, `s`, `m`, `h`.  A bare `0` is allowed.
pub fn parse_duration(value: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::RunInterval(format!("'{}'", value));
    let s = value.trim();

    if s.starts_with('-') {
        return Err(ConfigError::RunInterval(format!("'{}' must be >= 0", value)));
    }
    let s = s.strip_prefix('+').unwrap_or(s);
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() {
        return Err(invalid());
    }

    let mut total = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        let number: f64 = rest[..number_len].parse().map_err(|_| invalid())?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let nanos_per_unit = match &rest[..unit_len] {
            "ns" => 1e0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return Err(invalid()),
        };
        rest = &rest[unit_len..];
        total += number * nanos_per_unit;
    }

    Ok(Duration::from_nanos(total.round() as u64))
}
