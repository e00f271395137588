//! plugNPiN daemon entry point.

use std::sync::Arc;

use clap::Parser;
use log::{error, info};
#[cfg(unix)]
use log::warn;
use tokio::signal;
use tokio_util::sync::CancellationToken;

mod cli;
mod clients;
mod config;
mod error;
mod labels;
mod processor;
mod runtime;
mod scheduler;
mod types;

use cli::Flags;
use clients::{AdguardHomeClient, DnsRegistry, NpmClient, PiholeClient, ProxyRegistry};
use config::Config;
use processor::Processor;
use runtime::{ContainerRuntime, DockerRuntime};
use scheduler::Scheduler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let flags = Flags::parse();

    // Load configuration
    let cfg = Config::load(flags.dry_run)?;

    // Initialize logging
    let level = if cfg.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
    info!("Starting plugNPiN with config: {:?}", cfg);
    if flags.dry_run {
        info!("Dry run: no backend will be contacted");
    }

    let processor = Arc::new(build_processor(&cfg, flags.dry_run).await?);

    let runtimes = connect_runtimes(&cfg)?;
    let scheduler = Arc::new(Scheduler::new(processor, runtimes));

    if cfg.interval.is_zero() {
        scheduler.run_once().await;
        return Ok(());
    }

    let cancel = CancellationToken::new();

    let events_scheduler = Arc::clone(&scheduler);
    let events_cancel = cancel.clone();
    let events_handle = tokio::spawn(async move {
        events_scheduler.listen_for_events(events_cancel).await;
    });

    let interval = cfg.interval;
    let scan_cancel = cancel.clone();
    let scan_handle = tokio::spawn(async move {
        scheduler.run_scheduled(interval, scan_cancel).await;
    });

    // Graceful Shutdown
    wait_for_shutdown().await;
    cancel.cancel();

    for (task, handle) in [("event listener", events_handle), ("scheduler", scan_handle)] {
        if let Err(e) = handle.await {
            error!("{} task failed: {}", task, e);
        }
    }

    info!("Shutdown complete.");
    Ok(())
}

/// Logs in to every enabled backend.  A backend that cannot be reached at
/// startup aborts the process.  Dry runs build no clients at all.
async fn build_processor(cfg: &Config, dry_run: bool) -> anyhow::Result<Processor> {
    if dry_run {
        return Ok(Processor::new(None, None, None, true));
    }

    let http = clients::http_client(clients::REQUEST_TIMEOUT)?;

    let npm = NpmClient::new(
        http.clone(),
        &cfg.nginx_proxy_manager_host,
        &cfg.nginx_proxy_manager_username,
        &cfg.nginx_proxy_manager_password,
    )?;
    npm.login()
        .await
        .map_err(|e| anyhow::anyhow!("Nginx Proxy Manager at {}: {}", cfg.nginx_proxy_manager_host, e))?;
    info!("Logged in to Nginx Proxy Manager at {}", cfg.nginx_proxy_manager_host);
    let proxy: Arc<dyn ProxyRegistry> = Arc::new(npm);

    let pihole: Option<Arc<dyn DnsRegistry>> = if cfg.pihole_disabled {
        info!("Pi-hole is disabled");
        None
    } else {
        let client = PiholeClient::new(http.clone(), &cfg.pihole_host, &cfg.pihole_password)?;
        client
            .login()
            .await
            .map_err(|e| anyhow::anyhow!("Pi-hole at {}: {}", cfg.pihole_host, e))?;
        info!("Logged in to Pi-hole at {}", cfg.pihole_host);
        Some(Arc::new(client))
    };

    let adguard_home: Option<Arc<dyn DnsRegistry>> = if cfg.adguard_home_disabled {
        info!("AdGuard Home is disabled");
        None
    } else {
        Some(Arc::new(AdguardHomeClient::new(
            http,
            &cfg.adguard_home_host,
            &cfg.adguard_home_username,
            &cfg.adguard_home_password,
        )))
    };

    Ok(Processor::new(Some(proxy), pihole, adguard_home, false))
}

fn connect_runtimes(cfg: &Config) -> anyhow::Result<Vec<Arc<dyn ContainerRuntime>>> {
    let mut runtimes: Vec<Arc<dyn ContainerRuntime>> = Vec::new();
    for host in cfg.docker_hosts() {
        match DockerRuntime::connect(host.as_deref()) {
            Ok(runtime) => runtimes.push(Arc::new(runtime)),
            Err(e) => error!(
                "Failed to connect to Docker daemon {}: {}",
                host.as_deref().unwrap_or("local"),
                e
            ),
        }
    }
    if runtimes.is_empty() {
        anyhow::bail!("No Docker daemon could be reached");
    }
    Ok(runtimes)
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    let mut term = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            warn!("Unable to listen for SIGTERM: {}", e);
            if let Err(e) = signal::ctrl_c().await {
                error!("Unable to listen for shutdown signal: {}", e);
            }
            return;
        }
    };
    tokio::select! {
        res = signal::ctrl_c() => match res {
            Ok(()) => info!("Received Ctrl+C, shutting down..."),
            Err(e) => error!("Unable to listen for shutdown signal: {}", e),
        },
        _ = term.recv() => info!("Received SIGTERM, shutting down..."),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down..."),
        Err(e) => error!("Unable to listen for shutdown signal: {}", e),
    }
}
