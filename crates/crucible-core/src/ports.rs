//! Port traits between the core and its collaborators.
//!
//! The store, the lock service, and the container hosts are external to the
//! control plane; these traits are the exact surface the core uses from
//! them. Implementations live in the adapter crates.

use crate::builds::{Build, BuildStatus};
use crate::config::{JobInput, PipelineConfig, ResourceConfig};
use crate::events::BuildEvent;
use crate::ids::{BuildId, ConfigVersion, VersionedResourceId};
use crate::versions::{
    BuildInput, SavedBuildInput, SavedBuildOutput, SavedResource, SavedVersionedResource, Version,
};
use crate::workers::{ContainerIdentifier, ContainerSpec, WorkerInfo};
use crate::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;

/// A pipeline as listed, without its config payload.
#[derive(Debug, Clone, PartialEq)]
pub struct SavedPipeline {
    pub name: String,
    pub version: ConfigVersion,
    pub paused: bool,
}

/// Pipeline configuration storage with optimistic concurrency.
#[async_trait]
pub trait ConfigDb: Send + Sync {
    /// Saves `config`, bumping the version. `expected_version` zero creates
    /// the pipeline; a stale version fails with `ConfigComparisonFailed`.
    async fn save_config(
        &self,
        pipeline: &str,
        config: &PipelineConfig,
        expected_version: ConfigVersion,
        paused: Option<bool>,
    ) -> Result<ConfigVersion>;

    async fn get_config(&self, pipeline: &str) -> Result<(PipelineConfig, ConfigVersion)>;

    async fn get_pipelines(&self) -> Result<Vec<SavedPipeline>>;

    async fn set_pipeline_paused(&self, pipeline: &str, paused: bool) -> Result<()>;
}

/// Build lifecycle, inputs/outputs, and the per-build event stream.
#[async_trait]
pub trait BuildDb: Send + Sync {
    /// Creates a pending build, atomically assigning the job's next name.
    async fn create_job_build(&self, job: &str) -> Result<Build>;

    /// Creates a pending build with its inputs recorded, or surfaces the
    /// existing pending build with the same input set.
    async fn create_job_build_with_inputs(
        &self,
        job: &str,
        inputs: &[BuildInput],
    ) -> Result<Build>;

    /// Creates a pending build outside any job, named from a global counter.
    async fn create_one_off_build(&self) -> Result<Build>;

    async fn get_build(&self, id: BuildId) -> Result<Build>;
    async fn get_job_build(&self, job: &str, name: &str) -> Result<Build>;
    async fn get_all_builds(&self) -> Result<Vec<Build>>;
    async fn get_all_job_builds(&self, job: &str) -> Result<Vec<Build>>;
    async fn get_all_started_builds(&self) -> Result<Vec<Build>>;

    /// The job's most recent non-pending build, or its oldest pending one.
    async fn get_current_build(&self, job: &str) -> Result<Build>;

    /// The job's most recently finished build and its oldest in-flight one.
    async fn get_job_finished_and_next_build(
        &self,
        job: &str,
    ) -> Result<(Option<Build>, Option<Build>)>;

    /// The oldest pending build of the job, with its recorded inputs.
    async fn get_next_pending_build(&self, job: &str)
        -> Result<(Build, Vec<SavedBuildInput>)>;

    /// The most recent build of `job` whose recorded inputs include every
    /// given `(name, versioned resource)` pair.
    async fn get_job_build_for_inputs(&self, job: &str, inputs: &[BuildInput]) -> Result<Build>;

    /// Transitions pending to scheduled. With `serial`, refuses while an
    /// earlier pending build of the job exists or another build of the job
    /// is in flight. Idempotent for an already-scheduled build.
    async fn schedule_build(&self, id: BuildId, serial: bool) -> Result<bool>;

    /// Transitions to started, stamping the engine, its metadata, and the
    /// start time, and emits a started status event. Returns false if the
    /// build is already terminal (e.g. aborted before starting).
    async fn start_build(&self, id: BuildId, engine: &str, metadata: &str) -> Result<bool>;

    /// Transitions to a terminal status, stamps the end time, emits the
    /// final status event, and ends the build's event stream.
    async fn finish_build(&self, id: BuildId, status: BuildStatus) -> Result<()>;

    /// Marks the build aborted if not already terminal and wakes abort
    /// notifier subscribers. Abort is sticky: later subscribers are
    /// notified immediately.
    async fn abort_build(&self, id: BuildId) -> Result<()>;

    async fn abort_notifier(&self, id: BuildId) -> Result<Box<dyn AbortNotifier>>;

    /// Appends an event with the build's next sequence and publishes it.
    async fn save_build_event(&self, id: BuildId, event: &BuildEvent) -> Result<()>;

    /// Replays events from `from`, then tails until the build is terminal.
    async fn get_build_events(&self, id: BuildId, from: u32)
        -> Result<Box<dyn BuildEventSource>>;

    async fn save_build_engine_metadata(&self, id: BuildId, metadata: &str) -> Result<()>;

    async fn save_build_input(
        &self,
        id: BuildId,
        input: &BuildInput,
    ) -> Result<SavedVersionedResource>;

    async fn save_build_output(
        &self,
        id: BuildId,
        vr: &crate::versions::VersionedResource,
    ) -> Result<SavedVersionedResource>;

    async fn get_build_resources(
        &self,
        id: BuildId,
    ) -> Result<(Vec<SavedBuildInput>, Vec<SavedBuildOutput>)>;
}

/// A build's event stream.
///
/// `next` blocks until an event is available, returns `EndOfStream` once
/// the build is terminal and the backlog is drained, and `StreamClosed`
/// after `close`.
#[async_trait]
pub trait BuildEventSource: Send {
    async fn next(&mut self) -> Result<BuildEvent>;

    /// Idempotent; wakes any blocked `next`.
    fn close(&self);
}

/// Wakes when the build is aborted. Sticky: if the build is already
/// aborted, wakes immediately.
#[async_trait]
pub trait AbortNotifier: Send {
    async fn notified(&mut self) -> Result<()>;
}

/// Resource version history and input candidate selection.
#[async_trait]
pub trait VersionDb: Send + Sync {
    /// Upserts each version under the resource, assigning `check_order` to
    /// previously unseen entries in the order supplied.
    async fn save_resource_versions(
        &self,
        resource: &ResourceConfig,
        versions: &[Version],
    ) -> Result<()>;

    /// The resource's newest version by check order, enabled or not.
    /// `NoVersions` when the resource has no history.
    async fn get_latest_versioned_resource(
        &self,
        resource: &str,
    ) -> Result<SavedVersionedResource>;

    async fn enable_versioned_resource(&self, id: VersionedResourceId) -> Result<()>;
    async fn disable_versioned_resource(&self, id: VersionedResourceId) -> Result<()>;

    /// Whether `version` of `resource` is enabled. Unknown versions are
    /// considered enabled: nobody has disabled them yet.
    async fn version_enabled(&self, resource: &str, version: &Version) -> Result<bool>;

    /// The latest jointly-consistent candidate versions for the inputs, per
    /// the passed-constraint contract. `NoVersions` when no tuple exists.
    async fn get_latest_input_versions(
        &self,
        inputs: &[JobInput],
    ) -> Result<Vec<SavedVersionedResource>>;

    async fn get_resource(&self, resource: &str) -> Result<SavedResource>;
    async fn set_resource_paused(&self, resource: &str, paused: bool) -> Result<()>;

    /// Records (or with `None`, clears) the resource's last check error.
    async fn set_resource_check_error(&self, resource: &str, error: Option<&str>) -> Result<()>;
}

/// Worker registration storage with TTL leases.
#[async_trait]
pub trait WorkerDb: Send + Sync {
    /// Registers or re-registers a worker. A zero TTL never expires.
    async fn save_worker(&self, info: &WorkerInfo, ttl: Duration) -> Result<()>;

    /// All registrations that have not expired.
    async fn workers(&self) -> Result<Vec<WorkerInfo>>;
}

/// A named advisory lock request.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct NamedLock(String);

impl NamedLock {
    pub fn resource_checking(name: &str) -> Self {
        NamedLock(format!("resource: {name}"))
    }

    pub fn job_scheduling(name: &str) -> Self {
        NamedLock(format!("job: {name}"))
    }

    pub fn build_tracking(id: BuildId) -> Self {
        NamedLock(format!("build: {id}"))
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

/// Cluster-wide named reader/writer locks.
///
/// Locks are advisory in the store so that they are released when the
/// holder's connection dies. Multi-name acquisition is all-or-none.
#[async_trait]
pub trait Locker: Send + Sync {
    /// Blocks until every named lock is held exclusively.
    async fn acquire_write_lock(&self, locks: Vec<NamedLock>) -> Result<Box<dyn Lock>>;

    /// Fails fast with `LockConflict` if any name is contended.
    async fn acquire_write_lock_immediately(
        &self,
        locks: Vec<NamedLock>,
    ) -> Result<Box<dyn Lock>>;

    /// Blocks until every named lock is held shared.
    async fn acquire_read_lock(&self, locks: Vec<NamedLock>) -> Result<Box<dyn Lock>>;

    /// Names currently present in the lock registry.
    async fn list_locks(&self) -> Result<Vec<String>>;
}

#[async_trait]
pub trait Lock: Send {
    /// Drops the lock; the last holder of a name also removes it from the
    /// registry.
    async fn release(self: Box<Self>) -> Result<()>;
}

/// Chooses a worker for a spec and allocates or finds containers on it.
#[async_trait]
pub trait WorkerPool: Send + Sync {
    async fn create_container(
        &self,
        id: &ContainerIdentifier,
        spec: &ContainerSpec,
    ) -> Result<Box<dyn Container>>;

    /// Finds the one container whose properties match `id`. Zero matches is
    /// `ContainerNotFound`; several are `MultipleContainers`.
    async fn lookup_container(&self, id: &ContainerIdentifier) -> Result<Box<dyn Container>>;
}

/// A live container on some worker.
#[async_trait]
pub trait Container: Send + Sync {
    fn handle(&self) -> &str;

    async fn run(&self, spec: ProcessSpec) -> Result<Box<dyn Process>>;

    /// Reattaches to a process previously spawned in this container.
    async fn attach(&self, pid: u32) -> Result<Box<dyn Process>>;

    async fn property(&self, name: &str) -> Result<String>;
    async fn set_property(&self, name: &str, value: &str) -> Result<()>;

    /// Stops the running processes; `kill` skips the grace period.
    async fn stop(&self, kill: bool) -> Result<()>;

    async fn destroy(&self) -> Result<()>;

    /// Reads a tar stream of `path` out of the container.
    async fn stream_out(&self, path: &str) -> Result<Vec<u8>>;

    /// Writes a tar stream into the container at `path`.
    async fn stream_in(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Detaches from the container, stopping its keepalive heartbeat.
    fn release(&self);
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessSpec {
    pub path: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub dir: Option<String>,
    pub privileged: bool,
    /// Bytes written to the process's stdin before it is closed.
    pub stdin: Option<String>,
}

/// The result of waiting for a container process.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessResult {
    pub exit_status: i32,
    pub stdout: String,
    pub stderr: String,
}

#[async_trait]
pub trait Process: Send {
    fn id(&self) -> u32;

    async fn wait(&mut self) -> Result<ProcessResult>;
}

/// Properties a host reports for one of its containers.
pub type ContainerProperties = BTreeMap<String, String>;
