//! Worker selection and container allocation.

use crate::heartbeat::HeartbeatedContainer;
use async_trait::async_trait;
use crucible_core::ports::{Container, ContainerProperties, WorkerDb, WorkerPool};
use crucible_core::workers::{ContainerIdentifier, ContainerSpec, WorkerInfo, PROPERTY_EPHEMERAL};
use crucible_core::{Error, Result};
use std::sync::Arc;
use std::time::Duration;

/// How often a held container's keepalive property is refreshed.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// What the pool asks a host to create.
#[derive(Debug, Clone, PartialEq)]
pub struct HostContainerSpec {
    pub rootfs: String,
    pub privileged: bool,
    pub properties: ContainerProperties,
}

/// One container host's API surface, as the pool consumes it.
#[async_trait]
pub trait ContainerHost: Send + Sync {
    async fn create(&self, spec: &HostContainerSpec) -> Result<Box<dyn Container>>;

    /// Containers whose property set includes every given property.
    async fn containers(&self, properties: &ContainerProperties)
        -> Result<Vec<Box<dyn Container>>>;
}

/// Turns a worker registration into a client for its host.
pub trait HostDialer: Send + Sync {
    fn dial(&self, worker: &WorkerInfo) -> Arc<dyn ContainerHost>;
}

pub struct Pool {
    db: Arc<dyn WorkerDb>,
    dialer: Arc<dyn HostDialer>,
}

impl Pool {
    pub fn new(db: Arc<dyn WorkerDb>, dialer: Arc<dyn HostDialer>) -> Self {
        Self { db, dialer }
    }

    fn host_spec(worker: &WorkerInfo, id: &ContainerIdentifier, spec: &ContainerSpec) -> Result<HostContainerSpec> {
        let mut properties = id.to_properties();

        let (rootfs, privileged) = match spec {
            ContainerSpec::Task(task) => (task.image.clone(), task.privileged),
            ContainerSpec::ResourceType(resource) => {
                let image = worker
                    .resource_image(&resource.resource_type)
                    .ok_or_else(|| {
                        Error::UnsupportedResourceType(resource.resource_type.clone())
                    })?;
                if resource.ephemeral {
                    properties.insert(PROPERTY_EPHEMERAL.to_string(), "true".to_string());
                }
                // Resource containers run their scripts as root.
                (image.to_string(), true)
            }
        };

        Ok(HostContainerSpec {
            rootfs,
            privileged,
            properties,
        })
    }
}

#[async_trait]
impl WorkerPool for Pool {
    async fn create_container(
        &self,
        id: &ContainerIdentifier,
        spec: &ContainerSpec,
    ) -> Result<Box<dyn Container>> {
        let workers = self.db.workers().await?;
        let worker = workers
            .iter()
            .find(|w| w.satisfies(spec))
            .ok_or(Error::NoCompatibleWorkers)?;

        let host = self.dialer.dial(worker);
        let container = host.create(&Self::host_spec(worker, id, spec)?).await?;
        Ok(Box::new(HeartbeatedContainer::start(
            container.into(),
            HEARTBEAT_INTERVAL,
        )))
    }

    async fn lookup_container(&self, id: &ContainerIdentifier) -> Result<Box<dyn Container>> {
        let properties = id.to_properties();
        let mut found = Vec::new();

        for worker in self.db.workers().await? {
            let host = self.dialer.dial(&worker);
            found.extend(host.containers(&properties).await?);
        }

        match found.len() {
            0 => Err(Error::ContainerNotFound),
            1 => {
                let container = found.pop().expect("just checked length");
                Ok(Box::new(HeartbeatedContainer::start(
                    container.into(),
                    HEARTBEAT_INTERVAL,
                )))
            }
            _ => Err(Error::MultipleContainers {
                handles: found.iter().map(|c| c.handle().to_string()).collect(),
            }),
        }
    }
}
