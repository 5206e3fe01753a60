//! Worker registrations and container identification.

use crate::config::Source;
use crate::ids::BuildId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A registered container host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub addr: String,
    #[serde(default)]
    pub active_containers: u32,
    #[serde(default)]
    pub resource_types: Vec<WorkerResourceType>,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerResourceType {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub image: String,
}

impl WorkerInfo {
    /// Whether this worker can host a container matching `spec`.
    pub fn satisfies(&self, spec: &ContainerSpec) -> bool {
        match spec {
            ContainerSpec::Task(task) => {
                task.platform == self.platform && self.tags_match(&task.tags)
            }
            ContainerSpec::ResourceType(resource) => {
                self.resource_image(&resource.resource_type).is_some()
                    && self.tags_match(&resource.tags)
            }
        }
    }

    pub fn resource_image(&self, resource_type: &str) -> Option<&str> {
        self.resource_types
            .iter()
            .find(|t| t.resource_type == resource_type)
            .map(|t| t.image.as_str())
    }

    // A tagged worker only serves requests naming a subset of its tags;
    // an untagged worker serves anyone.
    fn tags_match(&self, requested: &[String]) -> bool {
        if self.tags.is_empty() {
            return true;
        }
        if requested.is_empty() {
            return false;
        }
        requested.iter().all(|tag| self.tags.contains(tag))
    }
}

/// What kind of container a step needs.
#[derive(Debug, Clone, PartialEq)]
pub enum ContainerSpec {
    Task(TaskContainerSpec),
    ResourceType(ResourceTypeContainerSpec),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskContainerSpec {
    pub platform: String,
    pub tags: Vec<String>,
    pub image: String,
    pub privileged: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceTypeContainerSpec {
    pub resource_type: String,
    pub tags: Vec<String>,
    pub ephemeral: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerType {
    Check,
    Get,
    Put,
    Task,
}

impl ContainerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerType::Check => "check",
            ContainerType::Get => "get",
            ContainerType::Put => "put",
            ContainerType::Task => "task",
        }
    }
}

/// Identifying properties stamped onto a container at creation and matched
/// on lookup. Lookup matches the property subset that is set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerIdentifier {
    pub container_type: Option<ContainerType>,
    pub name: Option<String>,
    pub pipeline_name: Option<String>,
    pub build_id: Option<BuildId>,
    pub step_location: Option<u32>,
    pub check_type: Option<String>,
    pub check_source: Option<Source>,
}

pub const PROPERTY_TYPE: &str = "crucible:type";
pub const PROPERTY_NAME: &str = "crucible:name";
pub const PROPERTY_PIPELINE_NAME: &str = "crucible:pipeline-name";
pub const PROPERTY_BUILD_ID: &str = "crucible:build-id";
pub const PROPERTY_LOCATION: &str = "crucible:location";
pub const PROPERTY_CHECK_TYPE: &str = "crucible:check-type";
pub const PROPERTY_CHECK_SOURCE: &str = "crucible:check-source";
pub const PROPERTY_EPHEMERAL: &str = "crucible:ephemeral";
pub const PROPERTY_RESOURCE_PROCESS: &str = "crucible:resource-process";
pub const PROPERTY_RESOURCE_RESULT: &str = "crucible:resource-result";
pub const PROPERTY_KEEPALIVE: &str = "keepalive";

impl ContainerIdentifier {
    pub fn to_properties(&self) -> BTreeMap<String, String> {
        let mut props = BTreeMap::new();
        if let Some(t) = self.container_type {
            props.insert(PROPERTY_TYPE.to_string(), t.as_str().to_string());
        }
        if let Some(name) = &self.name {
            props.insert(PROPERTY_NAME.to_string(), name.clone());
        }
        if let Some(pipeline) = &self.pipeline_name {
            props.insert(PROPERTY_PIPELINE_NAME.to_string(), pipeline.clone());
        }
        if let Some(build_id) = self.build_id {
            props.insert(PROPERTY_BUILD_ID.to_string(), build_id.to_string());
        }
        if let Some(location) = self.step_location {
            props.insert(PROPERTY_LOCATION.to_string(), location.to_string());
        }
        if let Some(check_type) = &self.check_type {
            props.insert(PROPERTY_CHECK_TYPE.to_string(), check_type.clone());
        }
        if let Some(check_source) = &self.check_source {
            props.insert(
                PROPERTY_CHECK_SOURCE.to_string(),
                serde_json::to_string(check_source).unwrap_or_default(),
            );
        }
        props
    }
}
