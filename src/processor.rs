//! Reconciliation engine.
//!
//! Maps one container transition onto calls against the configured
//! backends.  Nothing is remembered between calls: every backend is listed
//! before it is written to, which is what makes repeated starts and stops
//! harmless.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use log::{debug, error, info, warn};

use crate::clients::{DnsRegistry, ProxyRegistry};
use crate::error::ClientError;
use crate::labels;
use crate::types::{ContainerEvent, DnsRecord, DnsTarget, NewProxyHost, RoutingConfig};

/// Where a container was seen.  Decides how loudly skips are logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Scan,
    Event,
}

/// What a backend ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Created,
    Deleted(usize),
    Unchanged,
    /// The backend could not be reconciled for a reason that is not a
    /// call failure, e.g. no address to point a record at.
    Skipped,
}

#[derive(Debug)]
pub struct BackendResult {
    pub backend: &'static str,
    pub result: Result<Outcome, ClientError>,
}

/// Per-backend results of one reconciliation.  Disabled backends do not
/// appear.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub results: Vec<BackendResult>,
}

impl ReconcileReport {
    pub fn is_ok(&self) -> bool {
        self.results.iter().all(|r| r.result.is_ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = (&'static str, &ClientError)> {
        self.results
            .iter()
            .filter_map(|r| r.result.as_ref().err().map(|e| (r.backend, e)))
    }

    #[cfg(test)]
    pub fn outcome(&self, backend: &str) -> Option<&Result<Outcome, ClientError>> {
        self.results
            .iter()
            .find(|r| r.backend == backend)
            .map(|r| &r.result)
    }
}

pub struct Processor {
    proxy: Option<Arc<dyn ProxyRegistry>>,
    pihole: Option<Arc<dyn DnsRegistry>>,
    adguard_home: Option<Arc<dyn DnsRegistry>>,
    dry_run: bool,
}

impl Processor {
    pub fn new(
        proxy: Option<Arc<dyn ProxyRegistry>>,
        pihole: Option<Arc<dyn DnsRegistry>>,
        adguard_home: Option<Arc<dyn DnsRegistry>>,
        dry_run: bool,
    ) -> Self {
        Self {
            proxy,
            pihole,
            adguard_home,
            dry_run,
        }
    }

    /// Parses `labels` and reconciles the container.  Returns `None` when
    /// the labels do not describe a routable container.
    pub async fn process(
        &self,
        name: &str,
        event: ContainerEvent,
        labels: &HashMap<String, String>,
        origin: Origin,
    ) -> Option<ReconcileReport> {
        let config = match labels::parse(labels) {
            Ok(config) => config,
            Err(e) if e.is_skip() => {
                match origin {
                    Origin::Scan => info!("Skipping container '{}': {}", name, e),
                    Origin::Event => debug!("Skipping event for container '{}': {}", name, e),
                }
                return None;
            }
            Err(e) => {
                error!("Error handling container '{}': {}", name, e);
                return None;
            }
        };
        Some(self.reconcile(name, event, &config).await)
    }

    /// Applies `event` for one container to every enabled backend.  The
    /// backends are driven concurrently and a failure in one never stops
    /// the others.
    pub async fn reconcile(
        &self,
        name: &str,
        event: ContainerEvent,
        config: &RoutingConfig,
    ) -> ReconcileReport {
        let msg = format!(
            "Handling {} of container '{}': ip={}, port={}, host={}",
            event, name, config.address, config.port, config.domain
        );
        if self.dry_run {
            info!("{}. In dry run mode, not doing anything.", msg);
            return ReconcileReport::default();
        }
        info!("{}", msg);

        let proxy = async {
            match &self.proxy {
                Some(proxy) => Some(BackendResult {
                    backend: proxy.name(),
                    result: self.sync_proxy(proxy.as_ref(), event, config).await,
                }),
                None => None,
            }
        };
        let pihole = self.sync_dns_backend(
            self.pihole.as_deref(),
            event,
            config,
            config.pihole.target_domain.as_deref(),
        );
        let adguard_home = self.sync_dns_backend(
            self.adguard_home.as_deref(),
            event,
            config,
            config.adguard_home.target_domain.as_deref(),
        );

        let (proxy, pihole, adguard_home) = tokio::join!(proxy, pihole, adguard_home);
        let report = ReconcileReport {
            results: [proxy, pihole, adguard_home].into_iter().flatten().collect(),
        };
        for r in &report.results {
            log_result(name, event, &config.domain, r);
        }
        report
    }

    async fn sync_proxy(
        &self,
        proxy: &dyn ProxyRegistry,
        event: ContainerEvent,
        config: &RoutingConfig,
    ) -> Result<Outcome, ClientError> {
        let hosts = proxy.list_hosts().await?;
        match event {
            ContainerEvent::Start => {
                if hosts.contains_key(&config.domain) {
                    return Ok(Outcome::Unchanged);
                }
                let certificate_id = match &config.proxy.certificate_name {
                    Some(cert) => resolve_certificate(proxy, cert, &config.domain).await,
                    None => None,
                };
                proxy
                    .add_host(&NewProxyHost {
                        domain: config.domain.clone(),
                        forward_host: config.address.clone(),
                        forward_port: config.port,
                        certificate_id,
                        options: config.proxy.clone(),
                    })
                    .await?;
                Ok(Outcome::Created)
            }
            ContainerEvent::Die => match hosts.get(&config.domain) {
                Some(&id) => {
                    proxy.delete_host(id).await?;
                    Ok(Outcome::Deleted(1))
                }
                None => Ok(Outcome::Unchanged),
            },
        }
    }

    async fn sync_dns_backend(
        &self,
        registry: Option<&dyn DnsRegistry>,
        event: ContainerEvent,
        config: &RoutingConfig,
        target_domain: Option<&str>,
    ) -> Option<BackendResult> {
        let registry = registry?;
        Some(BackendResult {
            backend: registry.name(),
            result: self.sync_dns(registry, event, config, target_domain).await,
        })
    }

    async fn sync_dns(
        &self,
        registry: &dyn DnsRegistry,
        event: ContainerEvent,
        config: &RoutingConfig,
        target_domain: Option<&str>,
    ) -> Result<Outcome, ClientError> {
        let domain = config.domain.as_str();
        match event {
            ContainerEvent::Start => {
                // Records point at the proxy, not the container, unless an
                // alias target was requested.
                let target = match target_domain {
                    Some(t) => DnsTarget::Alias(t.to_string()),
                    None => match &self.proxy {
                        Some(proxy) => DnsTarget::Address(proxy.address().to_string()),
                        None => {
                            warn!(
                                "No proxy address to point {} at, skipping {}",
                                domain,
                                registry.name()
                            );
                            return Ok(Outcome::Skipped);
                        }
                    },
                };

                let existing = registry.list_records().await?;
                let any_kind = registry.one_record_per_domain();
                if existing.iter().any(|r| {
                    r.domain == domain && (any_kind || r.target.is_alias() == target.is_alias())
                }) {
                    return Ok(Outcome::Unchanged);
                }
                registry
                    .add_record(&DnsRecord {
                        domain: domain.to_string(),
                        target,
                    })
                    .await?;
                Ok(Outcome::Created)
            }
            ContainerEvent::Die => {
                let stale: Vec<DnsRecord> = registry
                    .list_records()
                    .await?
                    .into_iter()
                    .filter(|r| r.domain == domain)
                    .filter(|r| match (target_domain, &r.target) {
                        (Some(t), DnsTarget::Alias(existing)) => existing == t,
                        (None, DnsTarget::Address(_)) => true,
                        _ => false,
                    })
                    .collect();

                // Delete every match, then report the first failure.
                let mut deleted = 0;
                let mut first_err = None;
                for record in &stale {
                    match registry.delete_record(record).await {
                        Ok(()) => deleted += 1,
                        Err(e) => {
                            warn!("Failed to delete {} {}: {}", record.domain, record.target, e);
                            first_err.get_or_insert(e);
                        }
                    }
                }
                match first_err {
                    Some(e) => Err(e),
                    None if deleted == 0 => Ok(Outcome::Unchanged),
                    None => Ok(Outcome::Deleted(deleted)),
                }
            }
        }
    }
}

async fn resolve_certificate(proxy: &dyn ProxyRegistry, name: &str, domain: &str) -> Option<i64> {
    match proxy.find_certificate(name).await {
        Ok(Some(id)) => Some(id),
        Ok(None) => {
            warn!(
                "Certificate '{}' not found, creating proxy host for {} without it",
                name, domain
            );
            None
        }
        Err(e) => {
            warn!(
                "Failed to look up certificate '{}', creating proxy host for {} without it: {}",
                name, domain, e
            );
            None
        }
    }
}

fn log_result(name: &str, event: ContainerEvent, domain: &str, r: &BackendResult) {
    match &r.result {
        Ok(Outcome::Created) => info!("Added {} entry for container '{}' ({})", r.backend, name, domain),
        Ok(Outcome::Deleted(n)) => info!(
            "Deleted {} {} entr{} for container '{}' ({})",
            n,
            r.backend,
            if *n == 1 { "y" } else { "ies" },
            name,
            domain
        ),
        Ok(Outcome::Unchanged) => debug!("{} already up to date for {}", r.backend, domain),
        Ok(Outcome::Skipped) => {}
        Err(e) => error!(
            "Failed to {} {} entry for container '{}' ({}): {}",
            Action(event),
            r.backend,
            name,
            domain,
            e
        ),
    }
}

struct Action(ContainerEvent);

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            ContainerEvent::Start => f.write_str("add"),
            ContainerEvent::Die => f.write_str("delete"),
        }
    }
}

#[cfg(test)]
pub(crate) mod fakes {
    //! In-memory registries that record every write.

    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::clients::{DnsRegistry, ProxyRegistry};
    use crate::error::ClientError;
    use crate::types::{DnsRecord, NewProxyHost};

    #[derive(Default)]
    pub struct FakeDns {
        pub name: &'static str,
        pub records: Mutex<Vec<DnsRecord>>,
        pub added: Mutex<Vec<DnsRecord>>,
        pub deleted: Mutex<Vec<DnsRecord>>,
        pub lists: AtomicUsize,
        pub fail: bool,
        pub single_answer: bool,
    }

    impl FakeDns {
        pub fn named(name: &'static str) -> Self {
            Self {
                name,
                ..Default::default()
            }
        }

        pub fn with(name: &'static str, records: Vec<DnsRecord>) -> Self {
            Self {
                name,
                records: Mutex::new(records),
                ..Default::default()
            }
        }

        /// Behaves like a rewrite service: one answer per domain.
        pub fn rewrites(name: &'static str, records: Vec<DnsRecord>) -> Self {
            Self {
                single_answer: true,
                ..Self::with(name, records)
            }
        }

        pub fn failing(name: &'static str) -> Self {
            Self {
                name,
                fail: true,
                ..Default::default()
            }
        }

        pub fn calls(&self) -> usize {
            self.lists.load(Ordering::SeqCst)
                + self.added.lock().unwrap().len()
                + self.deleted.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl DnsRegistry for FakeDns {
        fn name(&self) -> &'static str {
            self.name
        }

        fn one_record_per_domain(&self) -> bool {
            self.single_answer
        }

        async fn list_records(&self) -> Result<Vec<DnsRecord>, ClientError> {
            self.lists.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ClientError::Status {
                    status: 500,
                    message: "boom".into(),
                });
            }
            Ok(self.records.lock().unwrap().clone())
        }

        async fn add_record(&self, record: &DnsRecord) -> Result<(), ClientError> {
            self.added.lock().unwrap().push(record.clone());
            self.records.lock().unwrap().push(record.clone());
            Ok(())
        }

        async fn delete_record(&self, record: &DnsRecord) -> Result<(), ClientError> {
            self.deleted.lock().unwrap().push(record.clone());
            self.records.lock().unwrap().retain(|r| r != record);
            Ok(())
        }
    }

    pub struct FakeProxy {
        pub address: String,
        pub hosts: Mutex<HashMap<String, i64>>,
        pub certificates: HashMap<String, i64>,
        pub added: Mutex<Vec<NewProxyHost>>,
        pub deleted: Mutex<Vec<i64>>,
        pub lists: AtomicUsize,
        pub fail: bool,
    }

    impl Default for FakeProxy {
        fn default() -> Self {
            Self {
                address: "192.168.1.2".into(),
                hosts: Mutex::default(),
                certificates: HashMap::new(),
                added: Mutex::default(),
                deleted: Mutex::default(),
                lists: AtomicUsize::new(0),
                fail: false,
            }
        }
    }

    impl FakeProxy {
        pub fn calls(&self) -> usize {
            self.lists.load(Ordering::SeqCst)
                + self.added.lock().unwrap().len()
                + self.deleted.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ProxyRegistry for FakeProxy {
        fn name(&self) -> &'static str {
            "proxy"
        }

        fn address(&self) -> &str {
            &self.address
        }

        async fn list_hosts(&self) -> Result<HashMap<String, i64>, ClientError> {
            self.lists.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ClientError::Unauthorized);
            }
            Ok(self.hosts.lock().unwrap().clone())
        }

        async fn find_certificate(&self, name: &str) -> Result<Option<i64>, ClientError> {
            Ok(self.certificates.get(name).copied())
        }

        async fn add_host(&self, host: &NewProxyHost) -> Result<(), ClientError> {
            let mut hosts = self.hosts.lock().unwrap();
            let id = hosts.len() as i64 + 1;
            hosts.insert(host.domain.clone(), id);
            self.added.lock().unwrap().push(host.clone());
            Ok(())
        }

        async fn delete_host(&self, id: i64) -> Result<(), ClientError> {
            self.hosts.lock().unwrap().retain(|_, v| *v != id);
            self.deleted.lock().unwrap().push(id);
            Ok(())
        }
    }
}
