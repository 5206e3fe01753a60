//! Versioned resources and build input/output value types.

use crate::config::Source;
use crate::ids::VersionedResourceId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An opaque version identifier chosen by the resource's type.
///
/// Treated as a content-addressed key: two versioned resources of the same
/// resource with equal version maps are the same row in the store.
pub type Version = BTreeMap<String, String>;

/// Builds a [`Version`] from string pairs. Mostly useful in tests.
pub fn version(pairs: &[(&str, &str)]) -> Version {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataField {
    pub name: String,
    pub value: String,
}

/// A concrete version of a resource, identified by `(resource, version)`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionedResource {
    pub resource: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default)]
    pub source: Source,
    pub version: Version,
    #[serde(default)]
    pub metadata: Vec<MetadataField>,
}

/// A versioned resource as persisted: its row id, whether an operator has
/// disabled it, and its position in the resource's check history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedVersionedResource {
    pub id: VersionedResourceId,
    pub enabled: bool,
    pub check_order: i64,
    #[serde(flatten)]
    pub versioned_resource: VersionedResource,
}

/// A named build input to be recorded against a build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildInput {
    pub name: String,
    pub versioned_resource: VersionedResource,
}

/// A build input as read back, with its first-occurrence flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedBuildInput {
    pub name: String,
    pub versioned_resource: VersionedResource,
    pub first_occurrence: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedBuildOutput {
    pub versioned_resource: VersionedResource,
}

/// Per-resource pause/error state maintained alongside the version history.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SavedResource {
    pub name: String,
    pub paused: bool,
    pub check_error: Option<String>,
}

impl SavedResource {
    pub fn failing_to_check(&self) -> bool {
        self.check_error.is_some()
    }
}
