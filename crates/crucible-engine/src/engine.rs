//! The exec engine: builds as supervised step trees.

use crate::compile::StepCompiler;
use crate::delegate::{BuildDelegate, DbBuildDelegate};
use crate::step::{StepContext, WorkingTree};
use async_trait::async_trait;
use crucible_core::abort::{self, AbortSender};
use crucible_core::builds::Build;
use crucible_core::events::OriginLocation;
use crucible_core::plan::Plan;
use crucible_core::ports::{BuildDb, VersionDb, WorkerPool};
use crucible_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// A build engine: turns a stored build plus a plan into something that can
/// run, and reconstructs in-flight builds after a restart.
#[async_trait]
pub trait Engine: Send + Sync {
    fn name(&self) -> &str;

    async fn create_build(&self, build: &Build, plan: &Plan) -> Result<Arc<dyn RunningBuild>>;

    /// Reconstructs a build from its persisted engine metadata.
    async fn lookup_build(&self, build: &Build) -> Result<Arc<dyn RunningBuild>>;
}

#[async_trait]
pub trait RunningBuild: Send + Sync {
    fn metadata(&self) -> Result<String>;

    /// Sticky; in-flight steps observe it at their next suspension point.
    fn abort(&self);

    /// Drives the build to a terminal status. Safe to call exactly once.
    async fn resume(&self);
}

/// Registry of engines by name.
pub struct Engines {
    engines: Vec<Arc<dyn Engine>>,
}

impl Engines {
    pub fn new(engines: Vec<Arc<dyn Engine>>) -> Self {
        Self { engines }
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<dyn Engine>> {
        self.engines
            .iter()
            .find(|e| e.name() == name)
            .cloned()
            .ok_or_else(|| Error::UnknownEngine(name.to_string()))
    }
}

pub const ENGINE_NAME: &str = "exec.v1";

#[derive(Serialize, Deserialize)]
struct ExecMetadata {
    plan: Plan,
}

pub struct ExecEngine {
    db: Arc<dyn BuildDb>,
    versions: Arc<dyn VersionDb>,
    pool: Arc<dyn WorkerPool>,
}

impl ExecEngine {
    pub fn new(
        db: Arc<dyn BuildDb>,
        versions: Arc<dyn VersionDb>,
        pool: Arc<dyn WorkerPool>,
    ) -> Self {
        Self { db, versions, pool }
    }

    fn running(&self, build: &Build, plan: Plan) -> Arc<ExecBuild> {
        let (abort_tx, _) = abort::channel();
        Arc::new(ExecBuild {
            build: build.clone(),
            plan,
            db: self.db.clone(),
            versions: self.versions.clone(),
            pool: self.pool.clone(),
            abort_tx,
        })
    }
}

#[async_trait]
impl Engine for ExecEngine {
    fn name(&self) -> &str {
        ENGINE_NAME
    }

    async fn create_build(&self, build: &Build, plan: &Plan) -> Result<Arc<dyn RunningBuild>> {
        let running = self.running(build, plan.clone());
        // Persist the plan before anyone can observe the build as started,
        // so a crashed control plane can always reconstruct it.
        self.db
            .save_build_engine_metadata(build.id, &running.metadata()?)
            .await?;
        Ok(running)
    }

    async fn lookup_build(&self, build: &Build) -> Result<Arc<dyn RunningBuild>> {
        let raw = build
            .engine_metadata
            .as_deref()
            .ok_or_else(|| Error::Internal(format!("build {} has no engine metadata", build.id)))?;
        let metadata: ExecMetadata = serde_json::from_str(raw)?;
        Ok(self.running(build, metadata.plan))
    }
}

pub struct ExecBuild {
    build: Build,
    plan: Plan,
    db: Arc<dyn BuildDb>,
    versions: Arc<dyn VersionDb>,
    pool: Arc<dyn WorkerPool>,
    abort_tx: AbortSender,
}

#[async_trait]
impl RunningBuild for ExecBuild {
    fn metadata(&self) -> Result<String> {
        Ok(serde_json::to_string(&ExecMetadata {
            plan: self.plan.clone(),
        })?)
    }

    fn abort(&self) {
        let _ = self.abort_tx.send(true);
    }

    async fn resume(&self) {
        let delegate: Arc<dyn BuildDelegate> =
            Arc::new(DbBuildDelegate::new(self.db.clone(), self.build.id));

        // Stored aborts reach us through the store's notifier, covering
        // both pre-start aborts (sticky) and aborts issued elsewhere while
        // we run.
        let mut notifier = match self.db.abort_notifier(self.build.id).await {
            Ok(notifier) => notifier,
            Err(err) => {
                delegate.finish(Err(err), false).await;
                return;
            }
        };
        let abort_tx = self.abort_tx.clone();
        let watcher = tokio::spawn(async move {
            if notifier.notified().await.is_ok() {
                let _ = abort_tx.send(true);
            }
        });

        let compiler = StepCompiler {
            build_id: self.build.id,
            pipeline_name: self.build.pipeline_name.clone(),
            pool: self.pool.clone(),
            versions: self.versions.clone(),
            delegate: delegate.clone(),
        };
        let (root, _) = compiler.compile(&self.plan, OriginLocation::new(1));

        info!(build = %self.build.id, "running build");

        let artifacts = Arc::new(WorkingTree::new());
        let ctx = StepContext::new(self.abort_tx.subscribe(), artifacts.clone());
        let result = root.run(ctx).await;

        watcher.abort();
        artifacts.release_all().await;

        let aborted = *self.abort_tx.borrow();
        match result {
            Ok(outcome) => {
                info!(
                    build = %self.build.id,
                    succeeded = outcome.succeeded,
                    aborted,
                    "build finished"
                );
                delegate.finish(Ok(outcome.succeeded), aborted).await;
            }
            Err(Error::Aborted) => {
                info!(build = %self.build.id, "build aborted");
                delegate.finish(Ok(false), true).await;
            }
            Err(err) => {
                warn!(build = %self.build.id, error = %err, "build errored");
                delegate.finish(Err(err), aborted).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crucible_core::builds::BuildStatus;
    use crucible_core::config::{Condition, JobInput, Source, TaskConfig, TaskRunConfig};
    use crucible_core::events::BuildEvent;
    use crucible_core::ids::{BuildId, VersionedResourceId};
    use crucible_core::plan::{GetPlan, TaskPlan};
    use crucible_core::ports::{
        AbortNotifier, BuildEventSource, Container, Process, ProcessResult, ProcessSpec,
    };
    use crucible_core::versions::{
        version, BuildInput, SavedBuildInput, SavedBuildOutput, SavedResource,
        SavedVersionedResource, Version, VersionedResource,
    };
    use crucible_core::workers::{ContainerIdentifier, ContainerSpec};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::watch;

    struct FakeBuildDb {
        events: Mutex<Vec<BuildEvent>>,
        inputs: Mutex<Vec<BuildInput>>,
        outputs: Mutex<Vec<VersionedResource>>,
        finished: Mutex<Vec<(BuildId, BuildStatus)>>,
        metadata: Mutex<Option<String>>,
        started_builds: Mutex<Vec<Build>>,
        abort_tx: watch::Sender<bool>,
    }

    impl FakeBuildDb {
        fn new() -> Arc<Self> {
            let (abort_tx, _) = watch::channel(false);
            Arc::new(Self {
                events: Mutex::new(vec![]),
                inputs: Mutex::new(vec![]),
                outputs: Mutex::new(vec![]),
                finished: Mutex::new(vec![]),
                metadata: Mutex::new(None),
                started_builds: Mutex::new(vec![]),
                abort_tx,
            })
        }

        fn finished_status(&self, id: BuildId) -> Option<BuildStatus> {
            self.finished
                .lock()
                .unwrap()
                .iter()
                .find(|(build, _)| *build == id)
                .map(|(_, status)| *status)
        }
    }

    struct FakeAbortNotifier {
        rx: watch::Receiver<bool>,
    }

    #[async_trait]
    impl AbortNotifier for FakeAbortNotifier {
        async fn notified(&mut self) -> Result<()> {
            loop {
                if *self.rx.borrow_and_update() {
                    return Ok(());
                }
                if self.rx.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        }
    }

    #[async_trait]
    impl BuildDb for FakeBuildDb {
        async fn create_job_build(&self, _job: &str) -> Result<Build> {
            unimplemented!()
        }

        async fn create_job_build_with_inputs(
            &self,
            _job: &str,
            _inputs: &[BuildInput],
        ) -> Result<Build> {
            unimplemented!()
        }

        async fn create_one_off_build(&self) -> Result<Build> {
            unimplemented!()
        }

        async fn get_build(&self, _id: BuildId) -> Result<Build> {
            unimplemented!()
        }

        async fn get_job_build(&self, _job: &str, _name: &str) -> Result<Build> {
            unimplemented!()
        }

        async fn get_all_builds(&self) -> Result<Vec<Build>> {
            unimplemented!()
        }

        async fn get_all_job_builds(&self, _job: &str) -> Result<Vec<Build>> {
            unimplemented!()
        }

        async fn get_all_started_builds(&self) -> Result<Vec<Build>> {
            Ok(self.started_builds.lock().unwrap().clone())
        }

        async fn get_current_build(&self, _job: &str) -> Result<Build> {
            unimplemented!()
        }

        async fn get_job_finished_and_next_build(
            &self,
            _job: &str,
        ) -> Result<(Option<Build>, Option<Build>)> {
            unimplemented!()
        }

        async fn get_next_pending_build(
            &self,
            _job: &str,
        ) -> Result<(Build, Vec<SavedBuildInput>)> {
            unimplemented!()
        }

        async fn get_job_build_for_inputs(
            &self,
            _job: &str,
            _inputs: &[BuildInput],
        ) -> Result<Build> {
            unimplemented!()
        }

        async fn schedule_build(&self, _id: BuildId, _serial: bool) -> Result<bool> {
            unimplemented!()
        }

        async fn start_build(&self, _id: BuildId, _engine: &str, _metadata: &str) -> Result<bool> {
            unimplemented!()
        }

        async fn finish_build(&self, id: BuildId, status: BuildStatus) -> Result<()> {
            self.finished.lock().unwrap().push((id, status));
            Ok(())
        }

        async fn abort_build(&self, _id: BuildId) -> Result<()> {
            self.abort_tx.send(true).ok();
            Ok(())
        }

        async fn abort_notifier(&self, _id: BuildId) -> Result<Box<dyn AbortNotifier>> {
            Ok(Box::new(FakeAbortNotifier {
                rx: self.abort_tx.subscribe(),
            }))
        }

        async fn save_build_event(&self, _id: BuildId, event: &BuildEvent) -> Result<()> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }

        async fn get_build_events(
            &self,
            _id: BuildId,
            _from: u32,
        ) -> Result<Box<dyn BuildEventSource>> {
            unimplemented!()
        }

        async fn save_build_engine_metadata(&self, _id: BuildId, metadata: &str) -> Result<()> {
            *self.metadata.lock().unwrap() = Some(metadata.to_string());
            Ok(())
        }

        async fn save_build_input(
            &self,
            _id: BuildId,
            input: &BuildInput,
        ) -> Result<SavedVersionedResource> {
            self.inputs.lock().unwrap().push(input.clone());
            Ok(SavedVersionedResource {
                id: VersionedResourceId::new(1),
                enabled: true,
                check_order: 1,
                versioned_resource: input.versioned_resource.clone(),
            })
        }

        async fn save_build_output(
            &self,
            _id: BuildId,
            vr: &VersionedResource,
        ) -> Result<SavedVersionedResource> {
            self.outputs.lock().unwrap().push(vr.clone());
            Ok(SavedVersionedResource {
                id: VersionedResourceId::new(1),
                enabled: true,
                check_order: 1,
                versioned_resource: vr.clone(),
            })
        }

        async fn get_build_resources(
            &self,
            _id: BuildId,
        ) -> Result<(Vec<SavedBuildInput>, Vec<SavedBuildOutput>)> {
            unimplemented!()
        }
    }

    struct FakeVersionDb {
        enabled: bool,
    }

    #[async_trait]
    impl VersionDb for FakeVersionDb {
        async fn save_resource_versions(
            &self,
            _resource: &crucible_core::config::ResourceConfig,
            _versions: &[Version],
        ) -> Result<()> {
            Ok(())
        }

        async fn get_latest_versioned_resource(
            &self,
            _resource: &str,
        ) -> Result<SavedVersionedResource> {
            Err(Error::NoVersions)
        }

        async fn enable_versioned_resource(&self, _id: VersionedResourceId) -> Result<()> {
            Ok(())
        }

        async fn disable_versioned_resource(&self, _id: VersionedResourceId) -> Result<()> {
            Ok(())
        }

        async fn version_enabled(&self, _resource: &str, _version: &Version) -> Result<bool> {
            Ok(self.enabled)
        }

        async fn get_latest_input_versions(
            &self,
            _inputs: &[JobInput],
        ) -> Result<Vec<SavedVersionedResource>> {
            Err(Error::NoVersions)
        }

        async fn get_resource(&self, resource: &str) -> Result<SavedResource> {
            Ok(SavedResource {
                name: resource.to_string(),
                paused: false,
                check_error: None,
            })
        }

        async fn set_resource_paused(&self, _resource: &str, _paused: bool) -> Result<()> {
            Ok(())
        }

        async fn set_resource_check_error(
            &self,
            _resource: &str,
            _error: Option<&str>,
        ) -> Result<()> {
            Ok(())
        }
    }

    /// A pool whose containers run scripted processes: resource containers
    /// answer the get protocol, task containers run to completion (or hang
    /// when `hang_tasks`).
    struct ScriptedPool {
        hang_tasks: bool,
    }

    struct ScriptedContainer {
        stdout: String,
        hang: bool,
        properties: Mutex<std::collections::HashMap<String, String>>,
    }

    struct ScriptedProcess {
        stdout: String,
        hang: bool,
    }

    #[async_trait]
    impl Process for ScriptedProcess {
        fn id(&self) -> u32 {
            42
        }

        async fn wait(&mut self) -> Result<ProcessResult> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            Ok(ProcessResult {
                exit_status: 0,
                stdout: self.stdout.clone(),
                stderr: String::new(),
            })
        }
    }

    #[async_trait]
    impl Container for ScriptedContainer {
        fn handle(&self) -> &str {
            "scripted-handle"
        }

        async fn run(&self, _spec: ProcessSpec) -> Result<Box<dyn Process>> {
            Ok(Box::new(ScriptedProcess {
                stdout: self.stdout.clone(),
                hang: self.hang,
            }))
        }

        async fn attach(&self, _pid: u32) -> Result<Box<dyn Process>> {
            unimplemented!()
        }

        async fn property(&self, name: &str) -> Result<String> {
            self.properties
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .ok_or_else(|| Error::Internal(format!("no such property: {name}")))
        }

        async fn set_property(&self, name: &str, value: &str) -> Result<()> {
            self.properties
                .lock()
                .unwrap()
                .insert(name.to_string(), value.to_string());
            Ok(())
        }

        async fn stop(&self, _kill: bool) -> Result<()> {
            Ok(())
        }

        async fn destroy(&self) -> Result<()> {
            Ok(())
        }

        async fn stream_out(&self, _path: &str) -> Result<Vec<u8>> {
            Ok(vec![])
        }

        async fn stream_in(&self, _path: &str, _data: &[u8]) -> Result<()> {
            Ok(())
        }

        fn release(&self) {}
    }

    #[async_trait]
    impl WorkerPool for ScriptedPool {
        async fn create_container(
            &self,
            _id: &ContainerIdentifier,
            spec: &ContainerSpec,
        ) -> Result<Box<dyn Container>> {
            let (stdout, hang) = match spec {
                ContainerSpec::ResourceType(_) => (
                    r#"{"version": {"ref": "abc"}, "metadata": []}"#.to_string(),
                    false,
                ),
                ContainerSpec::Task(_) => ("task output".to_string(), self.hang_tasks),
            };
            Ok(Box::new(ScriptedContainer {
                stdout,
                hang,
                properties: Mutex::new(Default::default()),
            }))
        }

        async fn lookup_container(
            &self,
            _id: &ContainerIdentifier,
        ) -> Result<Box<dyn Container>> {
            Err(Error::ContainerNotFound)
        }
    }

    fn some_build() -> Build {
        Build {
            id: BuildId::new(7),
            name: "1".to_string(),
            job_name: Some("some-job".to_string()),
            pipeline_name: Some("main".to_string()),
            status: BuildStatus::Started,
            engine: Some(ENGINE_NAME.to_string()),
            engine_metadata: None,
            start_time: None,
            end_time: None,
        }
    }

    fn get_task_plan(pinned: Option<Version>) -> Plan {
        Plan::Compose {
            a: Plan::Aggregate {
                steps: vec![Plan::Get(GetPlan {
                    name: "some-input".to_string(),
                    resource: "some-resource".to_string(),
                    resource_type: "git".to_string(),
                    source: Source::new(),
                    params: Default::default(),
                    version: pinned,
                    tags: vec![],
                })],
            }
            .boxed(),
            b: Plan::Conditional {
                conditions: vec![Condition::Success],
                plan: Plan::Task(TaskPlan {
                    name: "build".to_string(),
                    privileged: false,
                    config: Some(TaskConfig {
                        platform: "linux".to_string(),
                        image: "some-image".to_string(),
                        run: TaskRunConfig {
                            path: "scripts/test".to_string(),
                            args: vec![],
                        },
                        ..Default::default()
                    }),
                    config_path: None,
                    tags: vec![],
                })
                .boxed(),
            }
            .boxed(),
        }
    }

    fn engine_with(db: Arc<FakeBuildDb>, enabled: bool, hang_tasks: bool) -> ExecEngine {
        ExecEngine::new(
            db,
            Arc::new(FakeVersionDb { enabled }),
            Arc::new(ScriptedPool { hang_tasks }),
        )
    }

    #[tokio::test]
    async fn runs_a_plan_to_success_with_stable_origins() {
        let db = FakeBuildDb::new();
        let engine = engine_with(db.clone(), true, false);

        let plan = get_task_plan(Some(version(&[("ref", "abc")])));
        let running = engine.create_build(&some_build(), &plan).await.unwrap();
        running.resume().await;

        assert_eq!(
            db.finished_status(BuildId::new(7)),
            Some(BuildStatus::Succeeded)
        );

        let inputs = db.inputs.lock().unwrap();
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs[0].name, "some-input");
        assert_eq!(
            inputs[0].versioned_resource.version,
            version(&[("ref", "abc")])
        );

        let events = db.events.lock().unwrap();
        let input_event = events
            .iter()
            .find_map(|e| match e {
                BuildEvent::Input(payload) => Some(payload),
                _ => None,
            })
            .expect("input event");
        // The aggregate occupies id 1; its member is id 2 in group 1.
        assert_eq!(input_event.origin.location.id, 2);
        assert_eq!(input_event.origin.location.parallel_group, 1);

        let finish_event = events
            .iter()
            .find_map(|e| match e {
                BuildEvent::Finish(payload) => Some(payload),
                _ => None,
            })
            .expect("finish event");
        assert_eq!(finish_event.origin.location.id, 3);
        assert_eq!(finish_event.origin.location.parallel_group, 0);
        assert_eq!(finish_event.exit_status, 0);
    }

    #[tokio::test]
    async fn plan_round_trips_through_engine_metadata() {
        let db = FakeBuildDb::new();
        let engine = engine_with(db.clone(), true, false);

        let plan = get_task_plan(None);
        let created = engine.create_build(&some_build(), &plan).await.unwrap();

        let stored = db.metadata.lock().unwrap().clone().unwrap();
        let mut build = some_build();
        build.engine_metadata = Some(stored.clone());

        let looked_up = engine.lookup_build(&build).await.unwrap();
        assert_eq!(looked_up.metadata().unwrap(), created.metadata().unwrap());
    }

    #[tokio::test]
    async fn abort_interrupts_a_running_build() {
        let db = FakeBuildDb::new();
        let engine = engine_with(db.clone(), true, true);

        let plan = get_task_plan(Some(version(&[("ref", "abc")])));
        let running = engine.create_build(&some_build(), &plan).await.unwrap();

        let handle = {
            let running = running.clone();
            tokio::spawn(async move { running.resume().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        running.abort();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("build should stop after abort")
            .unwrap();

        assert_eq!(
            db.finished_status(BuildId::new(7)),
            Some(BuildStatus::Aborted)
        );
    }

    #[tokio::test]
    async fn stored_abort_reaches_the_engine_through_the_notifier() {
        let db = FakeBuildDb::new();
        let engine = engine_with(db.clone(), true, true);

        let plan = get_task_plan(Some(version(&[("ref", "abc")])));
        let running = engine.create_build(&some_build(), &plan).await.unwrap();

        let handle = {
            let running = running.clone();
            tokio::spawn(async move { running.resume().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        db.abort_build(BuildId::new(7)).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("build should stop after stored abort")
            .unwrap();

        assert_eq!(
            db.finished_status(BuildId::new(7)),
            Some(BuildStatus::Aborted)
        );
    }

    #[tokio::test]
    async fn disabled_pinned_input_errors_the_build() {
        let db = FakeBuildDb::new();
        let engine = engine_with(db.clone(), false, false);

        let plan = get_task_plan(Some(version(&[("ref", "abc")])));
        let running = engine.create_build(&some_build(), &plan).await.unwrap();
        running.resume().await;

        assert_eq!(
            db.finished_status(BuildId::new(7)),
            Some(BuildStatus::Errored)
        );

        let events = db.events.lock().unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            BuildEvent::Error(payload) if payload.message.contains("disabled")
        )));
    }

    #[tokio::test]
    async fn tracker_resumes_started_builds_and_errors_orphans() {
        let db = FakeBuildDb::new();
        let engine: Arc<dyn Engine> = Arc::new(engine_with(db.clone(), true, false));
        let engines = Arc::new(Engines::new(vec![engine]));

        let metadata = serde_json::to_string(&ExecMetadata {
            plan: get_task_plan(Some(version(&[("ref", "abc")]))),
        })
        .unwrap();

        let mut resumable = some_build();
        resumable.engine_metadata = Some(metadata);

        let mut orphan = some_build();
        orphan.id = BuildId::new(8);
        orphan.engine = Some("long-gone".to_string());

        *db.started_builds.lock().unwrap() = vec![resumable, orphan];

        crate::tracker::BuildTracker::new(db.clone(), engines)
            .track()
            .await
            .unwrap();

        // The orphan is marked errored synchronously; the resumable build
        // finishes in a spawned task.
        assert_eq!(
            db.finished_status(BuildId::new(8)),
            Some(BuildStatus::Errored)
        );

        for _ in 0..100 {
            if db.finished_status(BuildId::new(7)).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            db.finished_status(BuildId::new(7)),
            Some(BuildStatus::Succeeded)
        );
    }
}
