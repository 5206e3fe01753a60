//! The declarative build plan.
//!
//! A plan is a recursive tree of step kinds. The scheduler's factory builds
//! one from a job's configuration; the engine compiles it into an executable
//! step tree and also persists it verbatim as engine metadata so an
//! interrupted build can be reconstructed after a restart.

use crate::config::{Condition, Params, Source, TaskConfig};
use crate::versions::Version;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Plan {
    /// Fetch a resource version into a named working-tree slot.
    Get(GetPlan),
    /// Push from the working tree, producing a new version.
    Put(PutPlan),
    /// Run a put; its dependent get follows on success, then `rest`.
    PutGet { head: PutPlan, rest: Box<Plan> },
    /// Run a task container against the working tree.
    Task(TaskPlan),
    /// Run children concurrently; succeeds iff all succeed.
    Aggregate { steps: Vec<Plan> },
    /// Run `a`, then `b`; pure ordering.
    Compose { a: Box<Plan>, b: Box<Plan> },
    /// Success/failure/ensure scaffolding around `step`.
    HookedCompose {
        step: Box<Plan>,
        next: Box<Plan>,
        on_failure: Box<Plan>,
        on_success: Box<Plan>,
        on_completion: Box<Plan>,
    },
    /// Run `plan` iff the prior overall status is in `conditions`.
    Conditional {
        conditions: Vec<Condition>,
        plan: Box<Plan>,
    },
    /// Run `step`; override its success to true.
    Try(Box<Plan>),
    /// Run `step`; cancel and fail with a timeout after `duration`.
    Timeout { step: Box<Plan>, duration: Duration },
    #[default]
    Noop,
}

impl Plan {
    pub fn is_noop(&self) -> bool {
        matches!(self, Plan::Noop)
    }

    pub fn boxed(self) -> Box<Plan> {
        Box::new(self)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetPlan {
    pub name: String,
    pub resource: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default)]
    pub source: Source,
    #[serde(default)]
    pub params: Params,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PutPlan {
    pub name: String,
    pub resource: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default)]
    pub source: Source,
    #[serde(default)]
    pub params: Params,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl PutPlan {
    /// The get that re-fetches whatever this put just produced.
    pub fn dependent_get(&self) -> GetPlan {
        GetPlan {
            name: self.name.clone(),
            resource: self.resource.clone(),
            resource_type: self.resource_type.clone(),
            source: self.source.clone(),
            params: self.params.clone(),
            version: None,
            tags: self.tags.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskPlan {
    pub name: String,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<TaskConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_path: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}
