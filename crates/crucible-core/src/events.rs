//! Build event types.
//!
//! Events are appended to a build's stream with a dense, per-build sequence
//! and replayed to subscribers in order. Every step-scoped event carries an
//! [`Origin`] so clients can attribute it to a stable coordinate in the
//! build's plan tree.

use crate::builds::BuildStatus;
use crate::versions::{MetadataField, Version};
use serde::{Deserialize, Serialize};

/// All events emitted on a build's stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BuildEvent {
    Log(LogPayload),
    Status(StatusPayload),
    Start(StartPayload),
    Finish(FinishPayload),
    Input(InputPayload),
    Output(OutputPayload),
    Error(ErrorPayload),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogPayload {
    pub origin: Origin,
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusPayload {
    pub status: BuildStatus,
    pub time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartPayload {
    pub origin: Origin,
    pub time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinishPayload {
    pub origin: Origin,
    pub time: i64,
    pub exit_status: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputPayload {
    pub origin: Origin,
    pub input: String,
    pub resource: String,
    pub version: Version,
    #[serde(default)]
    pub metadata: Vec<MetadataField>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputPayload {
    pub origin: Origin,
    pub resource: String,
    pub version: Version,
    #[serde(default)]
    pub metadata: Vec<MetadataField>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<Origin>,
    pub message: String,
}

/// Where a step-scoped event came from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Origin {
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub name: String,
    #[serde(default)]
    pub source: OriginSource,
    pub location: OriginLocation,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Check,
    Get,
    Put,
    #[default]
    Task,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OriginSource {
    #[default]
    Stdout,
    Stderr,
}

/// A stable coordinate identifying a step within a build.
///
/// Ids are assigned by a pre-order walk of the plan; aggregate members share
/// a `parallel_group` equal to the aggregate's id, and hook children carry
/// the hooked step's id as `parent_id` with `parallel_group` zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginLocation {
    pub id: u32,
    #[serde(default)]
    pub parent_id: u32,
    #[serde(default)]
    pub parallel_group: u32,
}

impl OriginLocation {
    pub fn new(id: u32) -> Self {
        OriginLocation {
            id,
            parent_id: 0,
            parallel_group: 0,
        }
    }

    pub fn incr(mut self, by: u32) -> Self {
        self.id += by;
        self
    }

    pub fn with_parent_id(mut self, parent_id: u32) -> Self {
        self.parent_id = parent_id;
        self
    }

    pub fn with_parallel_group(mut self, group: u32) -> Self {
        self.parallel_group = group;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_a_type_tag() {
        let event = BuildEvent::Log(LogPayload {
            origin: Origin {
                step_type: StepType::Task,
                name: "build".to_string(),
                source: OriginSource::Stdout,
                location: OriginLocation::new(1),
            },
            payload: "hello".to_string(),
        });

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "log");
        assert_eq!(json["origin"]["location"]["id"], 1);

        let back: BuildEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn status_events_carry_the_status() {
        let event = BuildEvent::Status(StatusPayload {
            status: BuildStatus::Succeeded,
            time: 123,
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["status"], "succeeded");
    }
}
