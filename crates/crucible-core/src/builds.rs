//! Build lifecycle types.

use crate::ids::BuildId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub id: BuildId,
    /// Per-job (or global, for one-offs) decimal counter.
    pub name: String,
    pub job_name: Option<String>,
    pub pipeline_name: Option<String>,
    pub status: BuildStatus,
    pub engine: Option<String>,
    pub engine_metadata: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl Build {
    pub fn is_one_off(&self) -> bool {
        self.job_name.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Pending,
    Started,
    Aborted,
    Errored,
    Failed,
    Succeeded,
}

impl BuildStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildStatus::Aborted
                | BuildStatus::Errored
                | BuildStatus::Failed
                | BuildStatus::Succeeded
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Pending => "pending",
            BuildStatus::Started => "started",
            BuildStatus::Aborted => "aborted",
            BuildStatus::Errored => "errored",
            BuildStatus::Failed => "failed",
            BuildStatus::Succeeded => "succeeded",
        }
    }
}

impl std::str::FromStr for BuildStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BuildStatus::Pending),
            "started" => Ok(BuildStatus::Started),
            "aborted" => Ok(BuildStatus::Aborted),
            "errored" => Ok(BuildStatus::Errored),
            "failed" => Ok(BuildStatus::Failed),
            "succeeded" => Ok(BuildStatus::Succeeded),
            other => Err(crate::Error::Internal(format!(
                "unknown build status: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
