//! Store behaviour tests against a real PostgreSQL.
//!
//! Run with: `cargo test -p crucible-tests --test store_tests --features integration`

#![cfg(feature = "integration")]

use crucible_core::builds::BuildStatus;
use crucible_core::config::{JobConfig, JobInput, PipelineConfig, ResourceConfig, Source};
use crucible_core::events::{BuildEvent, LogPayload, Origin, StatusPayload};
use crucible_core::ports::{BuildDb, ConfigDb, Locker, NamedLock, VersionDb, WorkerDb};
use crucible_core::versions::{version, BuildInput, MetadataField, VersionedResource};
use crucible_core::workers::WorkerInfo;
use crucible_core::Error;
use crucible_tests::context::StoreContext;
use crucible_tests::helpers::assert_completes_within;
use std::time::Duration;

fn vr(resource: &str, reference: &str) -> VersionedResource {
    VersionedResource {
        resource: resource.to_string(),
        resource_type: "some-type".to_string(),
        source: Source::new(),
        version: version(&[("ver", reference)]),
        metadata: vec![],
    }
}

fn input(name: &str, vr: VersionedResource) -> BuildInput {
    BuildInput {
        name: name.to_string(),
        versioned_resource: vr,
    }
}

fn log_event(payload: &str) -> BuildEvent {
    BuildEvent::Log(LogPayload {
        origin: Origin::default(),
        payload: payload.to_string(),
    })
}

fn resource_config(name: &str) -> ResourceConfig {
    ResourceConfig {
        name: name.to_string(),
        resource_type: "some-type".to_string(),
        source: Source::new(),
    }
}

fn job_input(resource: &str, passed: &[&str]) -> JobInput {
    JobInput {
        name: resource.to_string(),
        resource: resource.to_string(),
        passed: passed.iter().map(|p| p.to_string()).collect(),
        trigger: true,
        version: None,
    }
}

#[tokio::test]
async fn configs_save_under_optimistic_concurrency() {
    let ctx = StoreContext::new().await.unwrap();
    let configs = ctx.db.config_db();

    let config = PipelineConfig {
        resources: vec![resource_config("some-resource")],
        jobs: vec![JobConfig {
            name: "some-job".to_string(),
            ..Default::default()
        }],
        ..Default::default()
    };

    // Version zero creates.
    let v1 = configs
        .save_config("main", &config, 0, None)
        .await
        .unwrap();
    assert_eq!(v1, 1);

    let (loaded, version) = configs.get_config("main").await.unwrap();
    assert_eq!(loaded, config);
    assert_eq!(version, 1);

    // Saving against the current version bumps it; a stale version loses.
    let v2 = configs
        .save_config("main", &config, v1, None)
        .await
        .unwrap();
    assert_eq!(v2, 2);

    assert!(matches!(
        configs.save_config("main", &config, v1, None).await.unwrap_err(),
        Error::ConfigComparisonFailed
    ));
    assert!(matches!(
        configs.save_config("main", &config, 0, None).await.unwrap_err(),
        Error::ConfigComparisonFailed
    ));

    configs.set_pipeline_paused("main", true).await.unwrap();
    let pipelines = configs.get_pipelines().await.unwrap();
    assert_eq!(pipelines.len(), 1);
    assert!(pipelines[0].paused);
    assert_eq!(pipelines[0].version, 2);
}

#[tokio::test]
async fn resources_record_pause_state_and_check_errors() {
    let ctx = StoreContext::new().await.unwrap();
    let versions = ctx.db.version_db();

    let resource = versions.get_resource("some-resource").await.unwrap();
    assert!(!resource.paused);
    assert!(!resource.failing_to_check());

    versions
        .set_resource_check_error("some-resource", Some("some error"))
        .await
        .unwrap();
    let resource = versions.get_resource("some-resource").await.unwrap();
    assert!(resource.failing_to_check());
    assert_eq!(resource.check_error.as_deref(), Some("some error"));

    versions
        .set_resource_check_error("some-resource", None)
        .await
        .unwrap();
    let resource = versions.get_resource("some-resource").await.unwrap();
    assert!(!resource.failing_to_check());

    versions
        .set_resource_paused("some-resource", true)
        .await
        .unwrap();
    assert!(versions.get_resource("some-resource").await.unwrap().paused);
}

#[tokio::test]
async fn build_names_count_up_per_job_and_globally_for_one_offs() {
    let ctx = StoreContext::new().await.unwrap();
    let builds = ctx.db.build_db();

    let b1 = builds.create_job_build("some-job").await.unwrap();
    assert_eq!(b1.name, "1");
    assert_eq!(b1.job_name.as_deref(), Some("some-job"));
    assert_eq!(b1.status, BuildStatus::Pending);

    let b2 = builds.create_job_build("some-job").await.unwrap();
    assert_eq!(b2.name, "2");
    assert!(b2.id > b1.id);

    let other = builds.create_job_build("some-other-job").await.unwrap();
    assert_eq!(other.name, "1");

    let one_off = builds.create_one_off_build().await.unwrap();
    assert_eq!(one_off.name, "1");
    assert!(one_off.job_name.is_none());

    let next_one_off = builds.create_one_off_build().await.unwrap();
    assert_eq!(next_one_off.name, "2");

    let all = builds.get_all_builds().await.unwrap();
    let ids: Vec<_> = all.iter().map(|b| b.id).collect();
    assert_eq!(ids, vec![next_one_off.id, one_off.id, other.id, b2.id, b1.id]);
}

#[tokio::test]
async fn builds_read_back_as_created() {
    let ctx = StoreContext::new().await.unwrap();
    let builds = ctx.db.build_db();

    assert!(matches!(
        builds.get_current_build("some-job").await.unwrap_err(),
        Error::NoBuild
    ));
    assert!(matches!(
        builds.get_next_pending_build("some-job").await.unwrap_err(),
        Error::NoBuild
    ));

    let build = builds.create_job_build("some-job").await.unwrap();

    let got = builds.get_build(build.id).await.unwrap();
    assert_eq!(got, build);

    let current = builds.get_current_build("some-job").await.unwrap();
    assert_eq!(current, build);

    let (pending, inputs) = builds.get_next_pending_build("some-job").await.unwrap();
    assert_eq!(pending, build);
    assert!(inputs.is_empty());

    let by_name = builds.get_job_build("some-job", "1").await.unwrap();
    assert_eq!(by_name, build);

    // A newer pending build does not displace the current one.
    builds.create_job_build("some-job").await.unwrap();
    let current = builds.get_current_build("some-job").await.unwrap();
    assert_eq!(current.id, build.id);
}

#[tokio::test]
async fn started_builds_stamp_engine_metadata_and_time() {
    let ctx = StoreContext::new().await.unwrap();
    let builds = ctx.db.build_db();

    let build = builds.create_job_build("some-job").await.unwrap();
    let started = builds
        .start_build(build.id, "some-engine", "some-metadata")
        .await
        .unwrap();
    assert!(started);

    let current = builds.get_current_build("some-job").await.unwrap();
    assert_eq!(current.status, BuildStatus::Started);
    assert_eq!(current.engine.as_deref(), Some("some-engine"));
    assert_eq!(current.engine_metadata.as_deref(), Some("some-metadata"));
    let start = current.start_time.expect("start time stamped");
    assert!((chrono::Utc::now() - start).num_seconds().abs() < 5);

    let all_started = builds.get_all_started_builds().await.unwrap();
    assert_eq!(all_started.len(), 1);
    assert_eq!(all_started[0].id, build.id);

    builds
        .save_build_engine_metadata(build.id, "some-updated-metadata")
        .await
        .unwrap();
    let current = builds.get_current_build("some-job").await.unwrap();
    assert_eq!(
        current.engine_metadata.as_deref(),
        Some("some-updated-metadata")
    );

    builds
        .finish_build(build.id, BuildStatus::Succeeded)
        .await
        .unwrap();
    let finished = builds.get_build(build.id).await.unwrap();
    assert_eq!(finished.status, BuildStatus::Succeeded);
    assert!(finished.end_time.is_some());
}

#[tokio::test]
async fn finished_and_next_builds_track_the_jobs_frontier() {
    let ctx = StoreContext::new().await.unwrap();
    let builds = ctx.db.build_db();

    let (finished, next) = builds
        .get_job_finished_and_next_build("some-job")
        .await
        .unwrap();
    assert!(finished.is_none());
    assert!(next.is_none());

    let done = builds.create_job_build("some-job").await.unwrap();
    builds
        .finish_build(done.id, BuildStatus::Succeeded)
        .await
        .unwrap();

    let running = builds.create_job_build("some-job").await.unwrap();
    builds
        .start_build(running.id, "some-engine", "some-metadata")
        .await
        .unwrap();

    // A newer pending build does not displace the oldest in-flight one.
    let queued = builds.create_job_build("some-job").await.unwrap();

    let (finished, next) = builds
        .get_job_finished_and_next_build("some-job")
        .await
        .unwrap();
    assert_eq!(finished.unwrap().id, done.id);
    assert_eq!(next.as_ref().unwrap().id, running.id);

    builds
        .finish_build(running.id, BuildStatus::Succeeded)
        .await
        .unwrap();

    let (finished, next) = builds
        .get_job_finished_and_next_build("some-job")
        .await
        .unwrap();
    assert_eq!(finished.unwrap().id, running.id);
    assert_eq!(next.unwrap().id, queued.id);
}

#[tokio::test]
async fn scheduling_is_gated_by_the_serial_policy() {
    let ctx = StoreContext::new().await.unwrap();
    let builds = ctx.db.build_db();

    let first = builds.create_job_build("some-job").await.unwrap();

    // Plain scheduling succeeds and is idempotent, serially too.
    assert!(builds.schedule_build(first.id, false).await.unwrap());
    assert!(builds.schedule_build(first.id, false).await.unwrap());
    assert!(builds.schedule_build(first.id, true).await.unwrap());

    let second = builds.create_job_build("some-job").await.unwrap();

    // The first build is in flight, so the second cannot go serially...
    assert!(!builds.schedule_build(second.id, true).await.unwrap());
    // ...but a different job's build can.
    let other = builds.create_job_build("some-other-job").await.unwrap();
    assert!(builds.schedule_build(other.id, true).await.unwrap());

    for status in [
        BuildStatus::Succeeded,
        BuildStatus::Failed,
        BuildStatus::Errored,
        BuildStatus::Aborted,
    ] {
        let ctx = StoreContext::new().await.unwrap();
        let builds = ctx.db.build_db();

        let first = builds.create_job_build("some-job").await.unwrap();
        let second = builds.create_job_build("some-job").await.unwrap();
        builds.schedule_build(first.id, false).await.unwrap();

        assert!(!builds.schedule_build(second.id, true).await.unwrap());
        builds.finish_build(first.id, status).await.unwrap();
        assert!(builds.schedule_build(second.id, true).await.unwrap());
    }
}

#[tokio::test]
async fn serial_builds_cannot_jump_the_queue() {
    let ctx = StoreContext::new().await.unwrap();
    let builds = ctx.db.build_db();

    let first = builds.create_job_build("some-job").await.unwrap();
    let second = builds.create_job_build("some-job").await.unwrap();
    let third = builds.create_job_build("some-job").await.unwrap();

    builds
        .finish_build(first.id, BuildStatus::Succeeded)
        .await
        .unwrap();

    // The second build is still pending ahead of the third.
    assert!(!builds.schedule_build(third.id, true).await.unwrap());
    assert!(builds.schedule_build(second.id, true).await.unwrap());
}

#[tokio::test]
async fn aborting_before_the_start_wins() {
    let ctx = StoreContext::new().await.unwrap();
    let builds = ctx.db.build_db();

    let build = builds.create_job_build("some-job").await.unwrap();
    builds.abort_build(build.id).await.unwrap();

    let aborted = builds.get_build(build.id).await.unwrap();
    assert_eq!(aborted.status, BuildStatus::Aborted);

    assert!(!builds.schedule_build(build.id, false).await.unwrap());
    assert!(!builds
        .start_build(build.id, "some-engine", "some-metadata")
        .await
        .unwrap());
}

#[tokio::test]
async fn abort_notifies_existing_and_later_subscribers() {
    let ctx = StoreContext::new().await.unwrap();
    let builds = ctx.db.build_db();

    let build = builds.create_job_build("some-job").await.unwrap();

    let mut notifier = builds.abort_notifier(build.id).await.unwrap();
    let waiting = tokio::spawn(async move { notifier.notified().await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!waiting.is_finished());

    builds.abort_build(build.id).await.unwrap();
    assert_completes_within(waiting, Duration::from_secs(5))
        .await
        .unwrap()
        .unwrap();

    // Late subscribers observe the abort immediately.
    let mut late = builds.abort_notifier(build.id).await.unwrap();
    assert_completes_within(late.notified(), Duration::from_secs(5))
        .await
        .unwrap();
}

#[tokio::test]
async fn events_replay_then_tail_in_order() {
    let ctx = StoreContext::new().await.unwrap();
    let builds = ctx.db.build_db();

    let build = builds.create_job_build("some-job").await.unwrap();

    let mut events = builds.get_build_events(build.id, 0).await.unwrap();

    builds
        .save_build_event(build.id, &log_event("some "))
        .await
        .unwrap();
    assert_eq!(
        assert_completes_within(events.next(), Duration::from_secs(5))
            .await
            .unwrap(),
        log_event("some ")
    );

    builds
        .save_build_event(build.id, &log_event("log"))
        .await
        .unwrap();
    assert_eq!(
        assert_completes_within(events.next(), Duration::from_secs(5))
            .await
            .unwrap(),
        log_event("log")
    );

    // Subscribing from an offset skips the replayed prefix.
    let mut from_one = builds.get_build_events(build.id, 1).await.unwrap();
    assert_eq!(
        assert_completes_within(from_one.next(), Duration::from_secs(5))
            .await
            .unwrap(),
        log_event("log")
    );
    from_one.close();

    // A blocked subscriber wakes as soon as the next event is saved.
    let tail = tokio::spawn(async move {
        let event = events.next().await;
        (events, event)
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!tail.is_finished());

    builds
        .save_build_event(build.id, &log_event("log 2"))
        .await
        .unwrap();
    let (events, event) = assert_completes_within(tail, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(event.unwrap(), log_event("log 2"));
    events.close();

    // Closing makes later reads fail.
    let mut closed = builds.get_build_events(build.id, 0).await.unwrap();
    closed.close();
    assert!(matches!(
        closed.next().await.unwrap_err(),
        Error::StreamClosed
    ));
}

#[tokio::test]
async fn event_streams_carry_status_events_and_terminate() {
    let ctx = StoreContext::new().await.unwrap();
    let builds = ctx.db.build_db();

    let build = builds.create_job_build("some-job").await.unwrap();
    let mut events = builds.get_build_events(build.id, 0).await.unwrap();

    builds
        .save_build_event(build.id, &log_event("hello"))
        .await
        .unwrap();
    builds
        .save_build_event(build.id, &log_event("world"))
        .await
        .unwrap();

    assert!(builds
        .start_build(build.id, "some-engine", "some-metadata")
        .await
        .unwrap());
    builds
        .finish_build(build.id, BuildStatus::Succeeded)
        .await
        .unwrap();

    let started = builds.get_build(build.id).await.unwrap();

    assert_eq!(
        assert_completes_within(events.next(), Duration::from_secs(5))
            .await
            .unwrap(),
        log_event("hello")
    );
    assert_eq!(
        assert_completes_within(events.next(), Duration::from_secs(5))
            .await
            .unwrap(),
        log_event("world")
    );
    assert_eq!(
        assert_completes_within(events.next(), Duration::from_secs(5))
            .await
            .unwrap(),
        BuildEvent::Status(StatusPayload {
            status: BuildStatus::Started,
            time: started.start_time.unwrap().timestamp(),
        })
    );
    assert_eq!(
        assert_completes_within(events.next(), Duration::from_secs(5))
            .await
            .unwrap(),
        BuildEvent::Status(StatusPayload {
            status: BuildStatus::Succeeded,
            time: started.end_time.unwrap().timestamp(),
        })
    );
    assert!(matches!(
        assert_completes_within(events.next(), Duration::from_secs(5))
            .await
            .unwrap_err(),
        Error::EndOfStream
    ));
}

#[tokio::test]
async fn build_inputs_and_outputs_round_trip() {
    let ctx = StoreContext::new().await.unwrap();
    let builds = ctx.db.build_db();

    let build = builds.create_job_build("some-job").await.unwrap();

    let vr1 = vr("some-resource", "1");
    let vr2 = vr("some-other-resource", "2");

    builds
        .save_build_input(build.id, &input("some-input", vr1.clone()))
        .await
        .unwrap();

    // Not all queried inputs are present yet.
    assert!(matches!(
        builds
            .get_job_build_for_inputs(
                "some-job",
                &[input("some-input", vr1.clone()), input("some-other-input", vr2.clone())],
            )
            .await
            .unwrap_err(),
        Error::NoBuild
    ));

    builds
        .save_build_input(build.id, &input("some-random-input", vr2.clone()))
        .await
        .unwrap();
    builds
        .save_build_input(build.id, &input("some-other-input", vr2.clone()))
        .await
        .unwrap();

    let found = builds
        .get_job_build_for_inputs(
            "some-job",
            &[input("some-input", vr1.clone()), input("some-other-input", vr2.clone())],
        )
        .await
        .unwrap();
    assert_eq!(found.id, build.id);

    builds.save_build_output(build.id, &vr1).await.unwrap();

    let mut modified_vr2 = vr2.clone();
    modified_vr2.version = version(&[("ver", "3")]);
    builds
        .save_build_output(build.id, &modified_vr2)
        .await
        .unwrap();
    builds.save_build_output(build.id, &vr2).await.unwrap();

    let (inputs, outputs) = builds.get_build_resources(build.id).await.unwrap();
    assert_eq!(inputs.len(), 3);
    assert!(inputs.iter().all(|i| i.first_occurrence));

    // Outputs the build merely passed through are not reported.
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].versioned_resource.version, version(&[("ver", "3")]));

    // A later build of the same job with the same inputs is not a first
    // occurrence; another job's build is.
    let duplicate = builds.create_job_build("some-job").await.unwrap();
    builds
        .save_build_input(duplicate.id, &input("other-build-input", vr1.clone()))
        .await
        .unwrap();
    let (inputs, _) = builds.get_build_resources(duplicate.id).await.unwrap();
    assert!(!inputs[0].first_occurrence);

    let other_job = builds.create_job_build("some-other-job").await.unwrap();
    builds
        .save_build_input(other_job.id, &input("other-job-input", vr1.clone()))
        .await
        .unwrap();
    let (inputs, _) = builds.get_build_resources(other_job.id).await.unwrap();
    assert!(inputs[0].first_occurrence);
}

#[tokio::test]
async fn saving_an_input_updates_metadata_for_the_shared_version() {
    let ctx = StoreContext::new().await.unwrap();
    let builds = ctx.db.build_db();

    let build = builds.create_job_build("some-job").await.unwrap();

    let bare = vr("some-other-resource", "2");
    builds
        .save_build_input(build.id, &input("some-input", bare.clone()))
        .await
        .unwrap();

    let mut with_metadata = bare.clone();
    with_metadata.metadata = vec![
        MetadataField {
            name: "meta1".to_string(),
            value: "value1".to_string(),
        },
        MetadataField {
            name: "meta2".to_string(),
            value: "value2".to_string(),
        },
    ];
    builds
        .save_build_input(build.id, &input("some-other-input", with_metadata.clone()))
        .await
        .unwrap();

    let (inputs, _) = builds.get_build_resources(build.id).await.unwrap();
    assert_eq!(inputs.len(), 2);
    for saved in &inputs {
        assert_eq!(saved.versioned_resource.metadata, with_metadata.metadata);
    }

    // Saving again with empty metadata does not clobber it.
    builds
        .save_build_input(build.id, &input("some-input", bare))
        .await
        .unwrap();
    let (inputs, _) = builds.get_build_resources(build.id).await.unwrap();
    for saved in &inputs {
        assert_eq!(saved.versioned_resource.metadata, with_metadata.metadata);
    }
}

#[tokio::test]
async fn creating_a_build_with_inputs_is_idempotent() {
    let ctx = StoreContext::new().await.unwrap();
    let builds = ctx.db.build_db();

    let inputs = vec![
        input("first-input", vr("some-resource", "1")),
        input("second-input", vr("some-other-resource", "2")),
    ];

    let pending = builds
        .create_job_build_with_inputs("some-job", &inputs)
        .await
        .unwrap();

    let again = builds
        .create_job_build_with_inputs("some-job", &inputs)
        .await
        .unwrap();
    assert_eq!(again.id, pending.id);

    let found = builds
        .get_job_build_for_inputs("some-job", &inputs)
        .await
        .unwrap();
    assert_eq!(found.id, pending.id);

    let (next, next_inputs) = builds.get_next_pending_build("some-job").await.unwrap();
    assert_eq!(next.id, pending.id);
    assert_eq!(next_inputs.len(), 2);
    assert!(next_inputs.iter().all(|i| i.first_occurrence));
}

#[tokio::test]
async fn resource_versions_advance_with_saves() {
    let ctx = StoreContext::new().await.unwrap();
    let versions = ctx.db.version_db();
    let resource = resource_config("some-resource");

    versions
        .save_resource_versions(&resource, &[version(&[("version", "1")])])
        .await
        .unwrap();

    let latest = versions
        .get_latest_versioned_resource("some-resource")
        .await
        .unwrap();
    assert_eq!(latest.versioned_resource.version, version(&[("version", "1")]));
    let first_order = latest.check_order;

    versions
        .save_resource_versions(
            &resource,
            &[version(&[("version", "2")]), version(&[("version", "3")])],
        )
        .await
        .unwrap();

    let latest = versions
        .get_latest_versioned_resource("some-resource")
        .await
        .unwrap();
    assert_eq!(latest.versioned_resource.version, version(&[("version", "3")]));

    // Re-saving a known version neither creates a row nor reorders it.
    versions
        .save_resource_versions(&resource, &[version(&[("version", "1")])])
        .await
        .unwrap();
    let relatest = versions
        .get_latest_versioned_resource("some-resource")
        .await
        .unwrap();
    assert_eq!(relatest.versioned_resource.version, version(&[("version", "3")]));

    let builds = ctx.db.build_db();
    let build = builds.create_job_build("some-job").await.unwrap();
    let saved = builds
        .save_build_input(
            build.id,
            &input("some-input", vr("some-resource", "unused")),
        )
        .await
        .unwrap();
    assert!(saved.check_order > first_order);
}

#[tokio::test]
async fn disabled_versions_stop_being_candidates() {
    let ctx = StoreContext::new().await.unwrap();
    let versions = ctx.db.version_db();
    let resource = resource_config("some-resource");

    versions
        .save_resource_versions(&resource, &[version(&[("version", "1")])])
        .await
        .unwrap();
    let v1 = versions
        .get_latest_versioned_resource("some-resource")
        .await
        .unwrap();

    versions
        .save_resource_versions(&resource, &[version(&[("version", "2")])])
        .await
        .unwrap();
    let v2 = versions
        .get_latest_versioned_resource("some-resource")
        .await
        .unwrap();

    let inputs = [job_input("some-resource", &[])];

    let chosen = versions.get_latest_input_versions(&inputs).await.unwrap();
    assert_eq!(chosen[0].id, v2.id);

    versions.disable_versioned_resource(v2.id).await.unwrap();

    // Disabling does not hide the version from the explicit latest...
    let latest = versions
        .get_latest_versioned_resource("some-resource")
        .await
        .unwrap();
    assert_eq!(latest.id, v2.id);
    assert!(!latest.enabled);

    // ...but it stops being an input candidate.
    let chosen = versions.get_latest_input_versions(&inputs).await.unwrap();
    assert_eq!(chosen[0].id, v1.id);

    versions.disable_versioned_resource(v1.id).await.unwrap();
    assert!(matches!(
        versions.get_latest_input_versions(&inputs).await.unwrap_err(),
        Error::NoVersions
    ));

    versions.enable_versioned_resource(v2.id).await.unwrap();
    let chosen = versions.get_latest_input_versions(&inputs).await.unwrap();
    assert_eq!(chosen[0].id, v2.id);

    assert!(versions
        .enable_versioned_resource(crucible_core::ids::VersionedResourceId::new(4242))
        .await
        .is_err());
}

#[tokio::test]
async fn passed_constraints_pin_inputs_to_a_common_build() {
    let ctx = StoreContext::new().await.unwrap();
    let builds = ctx.db.build_db();
    let versions = ctx.db.version_db();

    let succeeded = |job: &str| {
        let builds = builds.clone();
        let job = job.to_string();
        async move {
            let build = builds.create_job_build(&job).await.unwrap();
            builds
                .finish_build(build.id, BuildStatus::Succeeded)
                .await
                .unwrap();
            build
        }
    };

    let j1b1 = succeeded("job-1").await;
    let j2b1 = succeeded("job-2").await;
    let sb1 = succeeded("shared-job").await;

    let inputs = [
        job_input("resource-1", &["shared-job", "job-1"]),
        job_input("resource-2", &["shared-job", "job-2"]),
    ];

    assert!(matches!(
        versions.get_latest_input_versions(&inputs).await.unwrap_err(),
        Error::NoVersions
    ));

    let r1_old = vr("resource-1", "r1-common-to-shared-and-j1");
    let r2_old = vr("resource-2", "r2-common-to-shared-and-j2");

    builds.save_build_output(sb1.id, &r1_old).await.unwrap();
    builds.save_build_output(sb1.id, &r2_old).await.unwrap();
    let saved_r1_old = builds.save_build_output(j1b1.id, &r1_old).await.unwrap();
    let saved_r2_old = builds.save_build_output(j2b1.id, &r2_old).await.unwrap();

    let chosen = versions.get_latest_input_versions(&inputs).await.unwrap();
    assert_eq!(chosen[0].id, saved_r1_old.id);
    assert_eq!(chosen[1].id, saved_r2_old.id);

    // A newer shared build emits both resources, but only job-1 has passed
    // its half: the older consistent pair must keep winning.
    let sb2 = succeeded("shared-job").await;
    let j1b2 = succeeded("job-1").await;
    let _j2b2 = succeeded("job-2").await;

    let r1_new = vr("resource-1", "new-r1-common-to-shared-and-j1");
    let r2_new = vr("resource-2", "new-r2-common-to-shared-and-j2");

    builds.save_build_output(sb2.id, &r1_new).await.unwrap();
    builds.save_build_output(sb2.id, &r2_new).await.unwrap();
    let saved_r1_new = builds.save_build_output(j1b2.id, &r1_new).await.unwrap();

    let chosen = versions.get_latest_input_versions(&inputs).await.unwrap();
    assert_eq!(chosen[0].id, saved_r1_old.id);
    assert_eq!(chosen[1].id, saved_r2_old.id);

    // The missing output lands; the newer pair becomes eligible.
    let saved_r2_new = builds.save_build_output(_j2b2.id, &r2_new).await.unwrap();

    let chosen = versions.get_latest_input_versions(&inputs).await.unwrap();
    assert_eq!(chosen[0].id, saved_r1_new.id);
    assert_eq!(chosen[1].id, saved_r2_new.id);
}

#[tokio::test]
async fn workers_expire_with_their_ttl() {
    let ctx = StoreContext::new().await.unwrap();
    let workers = ctx.db.worker_db();

    assert!(workers.workers().await.unwrap().is_empty());

    let info_a = WorkerInfo {
        addr: "1.2.3.4:7777".to_string(),
        active_containers: 42,
        ..Default::default()
    };
    let info_b = WorkerInfo {
        addr: "1.2.3.4:8888".to_string(),
        active_containers: 42,
        ..Default::default()
    };

    // No TTL means no expiry; re-registration is idempotent.
    workers.save_worker(&info_a, Duration::ZERO).await.unwrap();
    workers.save_worker(&info_a, Duration::ZERO).await.unwrap();
    assert_eq!(workers.workers().await.unwrap(), vec![info_a.clone()]);

    workers
        .save_worker(&info_b, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(workers.workers().await.unwrap().len(), 2);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(workers.workers().await.unwrap(), vec![info_a.clone()]);

    // Re-registering with a TTL overwrites the indefinite lease.
    workers
        .save_worker(&info_a, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(workers.workers().await.unwrap(), vec![info_a]);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(workers.workers().await.unwrap().is_empty());
}

#[tokio::test]
async fn write_locks_exclude_other_writers() {
    let ctx = StoreContext::new().await.unwrap();
    let locker = ctx.db.locker();

    let lock = locker
        .acquire_write_lock(vec![NamedLock::resource_checking("a-name")])
        .await
        .unwrap();

    let contender = {
        let locker = locker.clone();
        tokio::spawn(async move {
            locker
                .acquire_write_lock(vec![NamedLock::resource_checking("a-name")])
                .await
                .unwrap()
        })
    };

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!contender.is_finished());

    lock.release().await.unwrap();

    let second = assert_completes_within(contender, Duration::from_secs(5))
        .await
        .unwrap();
    second.release().await.unwrap();
}

#[tokio::test]
async fn immediate_acquisition_fails_fast_when_contended() {
    let ctx = StoreContext::new().await.unwrap();
    let locker = ctx.db.locker();

    let lock = locker
        .acquire_write_lock_immediately(vec![NamedLock::resource_checking("a-name")])
        .await
        .unwrap();

    assert!(matches!(
        locker
            .acquire_write_lock_immediately(vec![NamedLock::resource_checking("a-name")])
            .await
            .unwrap_err(),
        Error::LockConflict
    ));

    lock.release().await.unwrap();
}

#[tokio::test]
async fn readers_share_but_exclude_writers() {
    let ctx = StoreContext::new().await.unwrap();
    let locker = ctx.db.locker();

    let read = locker
        .acquire_read_lock(vec![NamedLock::resource_checking("a-name")])
        .await
        .unwrap();

    // Another reader gets in immediately.
    let second_read = assert_completes_within(
        locker.acquire_read_lock(vec![NamedLock::resource_checking("a-name")]),
        Duration::from_secs(5),
    )
    .await
    .unwrap();
    second_read.release().await.unwrap();

    // A writer has to wait for the reader.
    let writer = {
        let locker = locker.clone();
        tokio::spawn(async move {
            locker
                .acquire_write_lock(vec![NamedLock::resource_checking("a-name")])
                .await
                .unwrap()
        })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!writer.is_finished());

    read.release().await.unwrap();
    let write = assert_completes_within(writer, Duration::from_secs(5))
        .await
        .unwrap();

    // And readers wait for writers in turn.
    let reader = {
        let locker = locker.clone();
        tokio::spawn(async move {
            locker
                .acquire_read_lock(vec![NamedLock::resource_checking("a-name")])
                .await
                .unwrap()
        })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!reader.is_finished());

    write.release().await.unwrap();
    let read = assert_completes_within(reader, Duration::from_secs(5))
        .await
        .unwrap();
    read.release().await.unwrap();
}

#[tokio::test]
async fn multi_name_locks_block_on_either_name() {
    let ctx = StoreContext::new().await.unwrap();
    let locker = ctx.db.locker();

    let both = locker
        .acquire_write_lock(vec![
            NamedLock::resource_checking("name-1"),
            NamedLock::resource_checking("name-2"),
        ])
        .await
        .unwrap();

    // Different names do not contend at all.
    let other = assert_completes_within(
        locker.acquire_write_lock(vec![NamedLock::resource_checking("name-3")]),
        Duration::from_secs(5),
    )
    .await
    .unwrap();
    other.release().await.unwrap();

    let first_waiter = {
        let locker = locker.clone();
        tokio::spawn(async move {
            locker
                .acquire_write_lock(vec![NamedLock::resource_checking("name-1")])
                .await
                .unwrap()
        })
    };
    let second_waiter = {
        let locker = locker.clone();
        tokio::spawn(async move {
            locker
                .acquire_write_lock(vec![NamedLock::resource_checking("name-2")])
                .await
                .unwrap()
        })
    };

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!first_waiter.is_finished());
    assert!(!second_waiter.is_finished());

    both.release().await.unwrap();

    let first = assert_completes_within(first_waiter, Duration::from_secs(5))
        .await
        .unwrap();
    let second = assert_completes_within(second_waiter, Duration::from_secs(5))
        .await
        .unwrap();
    first.release().await.unwrap();
    second.release().await.unwrap();
}

#[tokio::test]
async fn the_last_holder_cleans_the_lock_registry() {
    let ctx = StoreContext::new().await.unwrap();
    let locker = ctx.db.locker();
    let name = NamedLock::resource_checking("a-name");

    let lock = locker.acquire_write_lock(vec![name.clone()]).await.unwrap();
    assert!(locker
        .list_locks()
        .await
        .unwrap()
        .contains(&name.name().to_string()));

    let contender = {
        let locker = locker.clone();
        let name = name.clone();
        tokio::spawn(async move { locker.acquire_write_lock(vec![name]).await.unwrap() })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    lock.release().await.unwrap();
    let second = assert_completes_within(contender, Duration::from_secs(5))
        .await
        .unwrap();

    // The name survives while someone still holds it.
    assert!(locker
        .list_locks()
        .await
        .unwrap()
        .contains(&name.name().to_string()));

    second.release().await.unwrap();
    assert!(locker.list_locks().await.unwrap().is_empty());
}
