use super::{Container, ContainerRuntime, RuntimeEvent};
use crate::error::RuntimeError;
use crate::labels::REQUIRED_LABELS;
use crate::types::ContainerEvent;
use async_trait::async_trait;
use bollard::container::ListContainersOptions;
use bollard::models::{ContainerSummary, EventMessage};
use bollard::system::EventsOptions;
use bollard::{Docker, API_DEFAULT_VERSION};
use futures_util::stream::{BoxStream, StreamExt};
use log::{debug, info};
use std::collections::HashMap;

/// Seconds before a request to the daemon times out.
const TIMEOUT_SECS: u64 = 120;

pub struct DockerRuntime {
    docker: Docker,
    host: String,
}

impl DockerRuntime {
    /// Connects to `host` (`unix://`, `tcp://` or `http://`), or to the
    /// local daemon as configured by `DOCKER_HOST` when `host` is `None`.
    pub fn connect(host: Option<&str>) -> Result<Self, RuntimeError> {
        let docker = match host {
            None => Docker::connect_with_local_defaults()?,
            Some(h) if h.starts_with("unix://") => {
                Docker::connect_with_socket(h, TIMEOUT_SECS, API_DEFAULT_VERSION)?
            }
            Some(h) => Docker::connect_with_http(h, TIMEOUT_SECS, API_DEFAULT_VERSION)?,
        };
        let host = host.unwrap_or("local").to_string();
        info!("Connected to Docker daemon: {}", host);
        Ok(Self { docker, host })
    }

    fn label_filters() -> HashMap<String, Vec<String>> {
        HashMap::from([(
            "label".to_string(),
            REQUIRED_LABELS.iter().map(|l| l.to_string()).collect(),
        )])
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn host(&self) -> &str {
        &self.host
    }

    async fn list_containers(&self) -> Result<Vec<Container>, RuntimeError> {
        debug!(
            "Getting containers with labels: {}",
            REQUIRED_LABELS.join(", ")
        );
        let opts = ListContainersOptions::<String> {
            all: false,
            filters: Self::label_filters(),
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(opts)).await?;
        Ok(containers.into_iter().filter_map(to_container).collect())
    }

    fn events(&self) -> BoxStream<'_, Result<RuntimeEvent, RuntimeError>> {
        let mut filters = Self::label_filters();
        filters.insert("type".to_string(), vec!["container".to_string()]);
        filters.insert(
            "event".to_string(),
            vec!["start".to_string(), "die".to_string()],
        );
        let opts = EventsOptions::<String> {
            filters,
            ..Default::default()
        };

        self.docker
            .events(Some(opts))
            .filter_map(|msg| async move {
                match msg {
                    Ok(event) => to_runtime_event(event).map(Ok),
                    Err(e) => Some(Err(e.into())),
                }
            })
            .boxed()
    }
}

/// Container names come back as `/name`.
fn parse_container_name(names: Option<&[String]>) -> Option<String> {
    names
        .and_then(|n| n.first())
        .map(|n| n.trim_start_matches('/').to_string())
        .filter(|n| !n.is_empty())
}

fn to_container(summary: ContainerSummary) -> Option<Container> {
    let id = summary.id?;
    let name = parse_container_name(summary.names.as_deref()).unwrap_or_else(|| id.clone());
    Some(Container {
        id,
        name,
        labels: summary.labels.unwrap_or_default(),
    })
}

/// Event attributes carry the container's labels alongside `name` and
/// `image`, which is all the engine needs.
fn to_runtime_event(event: EventMessage) -> Option<RuntimeEvent> {
    let action = event.action.unwrap_or_default();
    let Some(transition) = ContainerEvent::from_action(&action) else {
        debug!("Ignoring container action {:?}", action);
        return None;
    };

    let actor = event.actor?;
    let id = actor.id.unwrap_or_default();
    let labels = actor.attributes.unwrap_or_default();
    let name = labels
        .get("name")
        .filter(|n| !n.is_empty())
        .cloned()
        .unwrap_or_else(|| id.clone());
    if name.is_empty() {
        return None;
    }

    Some(RuntimeEvent {
        id,
        name,
        event: transition,
        labels,
    })
}
