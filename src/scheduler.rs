//! Drives the processor: full scans, periodic re-scans and the live event
//! stream.  All loops share one cancellation token and check it only
//! between reconciliations, so a container that is being handled when the
//! token fires is always handled to completion.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::processor::{Origin, Processor};
use crate::runtime::ContainerRuntime;
use crate::types::ContainerEvent;

/// Counts from one full scan.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanSummary {
    pub containers: usize,
    pub reconciled: usize,
    pub failed: usize,
}

pub struct Scheduler {
    processor: Arc<Processor>,
    runtimes: Vec<Arc<dyn ContainerRuntime>>,
}

impl Scheduler {
    pub fn new(processor: Arc<Processor>, runtimes: Vec<Arc<dyn ContainerRuntime>>) -> Self {
        Self {
            processor,
            runtimes,
        }
    }

    /// One full scan that cannot be cancelled.
    pub async fn run_once(&self) -> ScanSummary {
        self.scan(&CancellationToken::new()).await
    }

    /// Lists every runtime and reconciles each container as started.  A
    /// runtime that cannot be listed is logged and skipped.
    async fn scan(&self, cancel: &CancellationToken) -> ScanSummary {
        let mut summary = ScanSummary::default();

        for runtime in &self.runtimes {
            let containers = match runtime.list_containers().await {
                Ok(c) => c,
                Err(e) => {
                    error!("Failed to get containers from {}: {}", runtime.host(), e);
                    continue;
                }
            };
            info!("Found {} containers on {}", containers.len(), runtime.host());
            summary.containers += containers.len();

            for container in containers {
                if cancel.is_cancelled() {
                    info!("Scan interrupted by shutdown");
                    return summary;
                }
                debug!("Processing container {} ({})", container.name, container.id);
                let report = self
                    .processor
                    .process(
                        &container.name,
                        ContainerEvent::Start,
                        &container.labels,
                        Origin::Scan,
                    )
                    .await;
                match report {
                    Some(r) if r.is_ok() => summary.reconciled += 1,
                    Some(r) => {
                        let backends: Vec<_> = r.failures().map(|(backend, _)| backend).collect();
                        debug!("{} failed on: {}", container.name, backends.join(", "));
                        summary.failed += 1;
                    }
                    None => {}
                }
            }
        }

        info!(
            "Done: {} containers, {} reconciled, {} with failures",
            summary.containers, summary.reconciled, summary.failed
        );
        summary
    }

    /// Scans now and then every `interval` until cancelled.  A zero
    /// interval scans exactly once.
    pub async fn run_scheduled(&self, interval: Duration, cancel: CancellationToken) {
        self.scan(&cancel).await;
        if interval.is_zero() {
            return;
        }

        let mut ticker = interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            info!("Will run again in {:?}", interval);
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Stopping scheduled runs");
                    return;
                }
                _ = ticker.tick() => {
                    self.scan(&cancel).await;
                }
            }
        }
    }

    /// Follows the event stream of every runtime until each one ends or
    /// the token is cancelled.
    pub async fn listen_for_events(&self, cancel: CancellationToken) {
        join_all(
            self.runtimes
                .iter()
                .map(|runtime| self.listen(runtime.as_ref(), &cancel)),
        )
        .await;
    }

    async fn listen(&self, runtime: &dyn ContainerRuntime, cancel: &CancellationToken) {
        let mut stream = runtime.events();
        info!("Listening for Docker events on {}...", runtime.host());

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Stopping stream of Docker events from {}", runtime.host());
                    return;
                }
                next = stream.next() => next,
            };

            match next {
                Some(Ok(event)) => {
                    debug!(
                        "Container event: {} for {} ({})",
                        event.event, event.name, event.id
                    );
                    self.processor
                        .process(&event.name, event.event, &event.labels, Origin::Event)
                        .await;
                }
                Some(Err(e)) => {
                    error!("Docker event listener for {} stopped: {}", runtime.host(), e);
                    return;
                }
                None => {
                    warn!("Docker event stream from {} ended", runtime.host());
                    return;
                }
            }
        }
    }
}
