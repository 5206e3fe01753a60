//! Pipeline configuration types.
//!
//! The structural shape of a user-declared pipeline: resources, jobs, and
//! the per-job plan sequence the build factory compiles. Parsing the outer
//! document format is a boundary concern; these types are the contract the
//! core consumes.

use crate::versions::Version;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Arbitrary resource-type-specific parameters.
pub type Params = serde_json::Map<String, serde_json::Value>;

/// Opaque resource source configuration (e.g. a git URI and branch).
pub type Source = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

impl PipelineConfig {
    pub fn resource(&self, name: &str) -> Option<&ResourceConfig> {
        self.resources.iter().find(|r| r.name == name)
    }

    pub fn job(&self, name: &str) -> Option<&JobConfig> {
        self.jobs.iter().find(|j| j.name == name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    #[serde(default)]
    pub jobs: Vec<String>,
    #[serde(default)]
    pub resources: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default)]
    pub source: Source,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub serial: bool,
    #[serde(default)]
    pub plan: Vec<PlanConfig>,
}

/// One entry in a job's plan sequence.
///
/// Exactly one of `aggregate`, `do`, `get`, `put`, or `task` is expected to
/// be set; the rest of the fields qualify it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate: Option<Vec<PlanConfig>>,
    #[serde(default, rename = "do", skip_serializing_if = "Option::is_none")]
    pub do_seq: Option<Vec<PlanConfig>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub get: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub put: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,

    /// Resource backing a get or put; defaults to the step name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(default)]
    pub passed: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<bool>,
    /// Version pin restricting a get's candidates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,

    #[serde(default)]
    pub privileged: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_config_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_config: Option<TaskConfig>,

    #[serde(default)]
    pub params: Params,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Explicit run conditions; absent means "after success" for any step
    /// past the first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Success,
    Failure,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub params: HashMap<String, String>,
    #[serde(default)]
    pub inputs: Vec<TaskInputConfig>,
    pub run: TaskRunConfig,
}

impl TaskConfig {
    /// Overlays `other` on top of `self`; set fields of `other` win.
    pub fn merged(mut self, other: TaskConfig) -> TaskConfig {
        if !other.platform.is_empty() {
            self.platform = other.platform;
        }
        if !other.image.is_empty() {
            self.image = other.image;
        }
        if !other.run.path.is_empty() {
            self.run = other.run;
        }
        if !other.inputs.is_empty() {
            self.inputs = other.inputs;
        }
        self.params.extend(other.params);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskInputConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskRunConfig {
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// A job input derived from the plan's get steps, with its scheduling
/// constraints.
#[derive(Debug, Clone, PartialEq)]
pub struct JobInput {
    pub name: String,
    pub resource: String,
    pub passed: Vec<String>,
    pub trigger: bool,
    pub version: Option<Version>,
}

impl JobConfig {
    /// The inputs the scheduler feeds to `get_latest_input_versions`, in
    /// plan order.
    pub fn inputs(&self) -> Vec<JobInput> {
        let mut inputs = Vec::new();
        collect_inputs(&self.plan, &mut inputs);
        inputs
    }
}

fn collect_inputs(seq: &[PlanConfig], out: &mut Vec<JobInput>) {
    for step in seq {
        if let Some(aggregate) = &step.aggregate {
            collect_inputs(aggregate, out);
        }
        if let Some(do_seq) = &step.do_seq {
            collect_inputs(do_seq, out);
        }
        if let Some(get) = &step.get {
            out.push(JobInput {
                name: get.clone(),
                resource: step.resource.clone().unwrap_or_else(|| get.clone()),
                passed: step.passed.clone(),
                trigger: step.trigger.unwrap_or(true),
                version: step.version.clone(),
            });
        }
    }
}
