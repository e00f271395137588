use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::error::RuntimeError;
use crate::types::ContainerEvent;

pub mod docker;
pub use docker::DockerRuntime;

/// A running container carrying the required labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    pub id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
}

/// A lifecycle event, already normalised to [`ContainerEvent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeEvent {
    pub id: String,
    pub name: String,
    pub event: ContainerEvent,
    pub labels: HashMap<String, String>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Human readable identity for logs (e.g. the daemon address).
    fn host(&self) -> &str;

    /// Running containers that carry the required labels.
    async fn list_containers(&self) -> Result<Vec<Container>, RuntimeError>;

    /// Start/die events for containers that carry the required labels.
    /// The stream ends when the runtime closes it.
    fn events(&self) -> BoxStream<'_, Result<RuntimeEvent, RuntimeError>>;
}
