//! Resource type script driver.
//!
//! A resource type ships three programs in its image: `check`, `in`, and
//! `out`. The wire contract for each is a JSON request on stdin, a JSON
//! response on stdout, and logs on stderr. Responses are memoised on the
//! container so that a control plane restarted mid-script reattaches to the
//! running process (or picks up its recorded result) instead of re-running
//! it.

use crucible_core::abort::{self, AbortReceiver};
use crucible_core::config::{Params, Source};
use crucible_core::ports::{Container, ProcessSpec};
use crucible_core::versions::{MetadataField, Version};
use crucible_core::workers::{PROPERTY_RESOURCE_PROCESS, PROPERTY_RESOURCE_RESULT};
use crucible_core::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

const CHECK_PATH: &str = "/opt/resource/check";
const IN_PATH: &str = "/opt/resource/in";
const OUT_PATH: &str = "/opt/resource/out";

/// Where get and put steps materialise their bits inside the container.
pub const GET_DIR: &str = "/tmp/build/get";
pub const PUT_DIR: &str = "/tmp/build/put";

/// A resource bound to a container of its type.
pub struct Resource {
    container: Arc<dyn Container>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VersionResult {
    pub version: Version,
    #[serde(default)]
    pub metadata: Vec<MetadataField>,
}

#[derive(Serialize)]
struct CheckRequest<'a> {
    source: &'a Source,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<&'a Version>,
}

#[derive(Serialize)]
struct InRequest<'a> {
    source: &'a Source,
    params: &'a Params,
    version: &'a Version,
}

#[derive(Serialize)]
struct OutRequest<'a> {
    source: &'a Source,
    params: &'a Params,
}

impl Resource {
    pub fn new(container: Arc<dyn Container>) -> Self {
        Self { container }
    }

    pub fn container(&self) -> &Arc<dyn Container> {
        &self.container
    }

    /// Newly-seen versions in chronological order, excluding `from`.
    pub async fn check(
        &self,
        source: &Source,
        from: Option<&Version>,
        abort: &mut AbortReceiver,
    ) -> Result<Vec<Version>> {
        let (versions, _) = self
            .run_script(CHECK_PATH, &[], &CheckRequest { source, version: from }, abort)
            .await?;
        Ok(versions)
    }

    /// Materialises `version` into the container's get directory. Returns
    /// the fetched version and the script's stderr log.
    pub async fn get(
        &self,
        source: &Source,
        params: &Params,
        version: &Version,
        abort: &mut AbortReceiver,
    ) -> Result<(VersionResult, String)> {
        self.run_script(
            IN_PATH,
            &[GET_DIR.to_string()],
            &InRequest {
                source,
                params,
                version,
            },
            abort,
        )
        .await
    }

    /// Produces a new version from the container's put directory. Returns
    /// the created version and the script's stderr log.
    pub async fn put(
        &self,
        source: &Source,
        params: &Params,
        abort: &mut AbortReceiver,
    ) -> Result<(VersionResult, String)> {
        self.run_script(
            OUT_PATH,
            &[PUT_DIR.to_string()],
            &OutRequest { source, params },
            abort,
        )
        .await
    }

    async fn run_script<T: DeserializeOwned>(
        &self,
        path: &str,
        args: &[String],
        request: &impl Serialize,
        abort: &mut AbortReceiver,
    ) -> Result<(T, String)> {
        // A memoised result means this script already ran to completion,
        // possibly under a previous control plane process.
        if let Ok(result) = self.container.property(PROPERTY_RESOURCE_RESULT).await {
            debug!(path, "reusing recorded script result");
            return Ok((serde_json::from_str(&result)?, String::new()));
        }

        let mut process = match self.container.property(PROPERTY_RESOURCE_PROCESS).await {
            Ok(pid) => {
                let pid: u32 = pid
                    .parse()
                    .map_err(|_| Error::Internal(format!("malformed process property: {pid}")))?;
                debug!(path, pid, "reattaching to running script");
                self.container.attach(pid).await?
            }
            Err(_) => {
                let stdin = serde_json::to_string(request)?;
                let process = self
                    .container
                    .run(ProcessSpec {
                        path: path.to_string(),
                        args: args.to_vec(),
                        stdin: Some(stdin),
                        ..Default::default()
                    })
                    .await?;
                self.container
                    .set_property(PROPERTY_RESOURCE_PROCESS, &process.id().to_string())
                    .await?;
                process
            }
        };

        let result = tokio::select! {
            result = process.wait() => result?,
            _ = abort::aborted(abort) => {
                self.container.stop(false).await?;
                return Err(Error::Aborted);
            }
        };

        if result.exit_status != 0 {
            return Err(Error::ScriptFailed {
                status: result.exit_status,
                stderr: result.stderr,
            });
        }

        self.container
            .set_property(PROPERTY_RESOURCE_RESULT, &result.stdout)
            .await?;

        Ok((serde_json::from_str(&result.stdout)?, result.stderr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crucible_core::ports::{Process, ProcessResult};
    use crucible_core::versions::version;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    struct ScriptedContainer {
        properties: Mutex<HashMap<String, String>>,
        stdout: String,
        exit_status: i32,
        hang: bool,
        runs: AtomicUsize,
        attaches: AtomicUsize,
        stopped: AtomicBool,
        last_stdin: Mutex<Option<String>>,
    }

    impl ScriptedContainer {
        fn new(stdout: &str, exit_status: i32) -> Arc<Self> {
            Arc::new(Self {
                properties: Mutex::new(HashMap::new()),
                stdout: stdout.to_string(),
                exit_status,
                hang: false,
                runs: AtomicUsize::new(0),
                attaches: AtomicUsize::new(0),
                stopped: AtomicBool::new(false),
                last_stdin: Mutex::new(None),
            })
        }

        fn hanging() -> Arc<Self> {
            Arc::new(Self {
                properties: Mutex::new(HashMap::new()),
                stdout: String::new(),
                exit_status: 0,
                hang: true,
                runs: AtomicUsize::new(0),
                attaches: AtomicUsize::new(0),
                stopped: AtomicBool::new(false),
                last_stdin: Mutex::new(None),
            })
        }

        fn with_property(self: Arc<Self>, name: &str, value: &str) -> Arc<Self> {
            self.properties
                .lock()
                .unwrap()
                .insert(name.to_string(), value.to_string());
            self
        }

        fn process(&self) -> ScriptedProcess {
            ScriptedProcess {
                result: ProcessResult {
                    exit_status: self.exit_status,
                    stdout: self.stdout.clone(),
                    stderr: String::new(),
                },
                hang: self.hang,
            }
        }
    }

    struct ScriptedProcess {
        result: ProcessResult,
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
            Ok(self.result.clone())
        }
    }

    #[async_trait]
    impl Container for ScriptedContainer {
        fn handle(&self) -> &str {
            "some-handle"
        }

        async fn run(&self, spec: ProcessSpec) -> Result<Box<dyn Process>> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            *self.last_stdin.lock().unwrap() = spec.stdin;
            Ok(Box::new(self.process()))
        }

        async fn attach(&self, _pid: u32) -> Result<Box<dyn Process>> {
            self.attaches.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(self.process()))
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
            self.stopped.store(true, Ordering::SeqCst);
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

    #[tokio::test]
    async fn check_sends_source_and_cursor_and_parses_versions() {
        let container =
            ScriptedContainer::new(r#"[{"ref": "abc"}, {"ref": "def"}]"#, 0);
        let resource = Resource::new(container.clone());

        let from = version(&[("ref", "old")]);
        let versions = resource
            .check(&Source::new(), Some(&from), &mut abort::never())
            .await
            .unwrap();

        assert_eq!(
            versions,
            vec![version(&[("ref", "abc")]), version(&[("ref", "def")])]
        );

        let stdin = container.last_stdin.lock().unwrap().clone().unwrap();
        let request: serde_json::Value = serde_json::from_str(&stdin).unwrap();
        assert_eq!(request["version"]["ref"], "old");
    }

    #[tokio::test]
    async fn result_is_memoised_on_the_container() {
        let container = ScriptedContainer::new(r#"{"version": {"ref": "abc"}}"#, 0);
        let resource = Resource::new(container.clone());

        let (result, _) = resource
            .get(
                &Source::new(),
                &Params::new(),
                &version(&[("ref", "abc")]),
                &mut abort::never(),
            )
            .await
            .unwrap();
        assert_eq!(result.version, version(&[("ref", "abc")]));

        let recorded = container
            .property(PROPERTY_RESOURCE_RESULT)
            .await
            .unwrap();
        assert!(recorded.contains("abc"));
        assert_eq!(container.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recorded_result_short_circuits_running() {
        let container = ScriptedContainer::new("unused", 1).with_property(
            PROPERTY_RESOURCE_RESULT,
            r#"{"version": {"ref": "abc"}, "metadata": [{"name": "a", "value": "a-value"}]}"#,
        );
        let resource = Resource::new(container.clone());

        let (result, logs) = resource
            .get(
                &Source::new(),
                &Params::new(),
                &version(&[("ref", "abc")]),
                &mut abort::never(),
            )
            .await
            .unwrap();

        assert_eq!(result.version, version(&[("ref", "abc")]));
        assert_eq!(result.metadata[0].name, "a");
        assert!(logs.is_empty());
        assert_eq!(container.runs.load(Ordering::SeqCst), 0);
        assert_eq!(container.attaches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn spawned_process_is_reattached_not_respawned() {
        let container = ScriptedContainer::new(r#"{"version": {"ref": "abc"}}"#, 0)
            .with_property(PROPERTY_RESOURCE_PROCESS, "42");
        let resource = Resource::new(container.clone());

        resource
            .get(
                &Source::new(),
                &Params::new(),
                &version(&[("ref", "abc")]),
                &mut abort::never(),
            )
            .await
            .unwrap();

        assert_eq!(container.runs.load(Ordering::SeqCst), 0);
        assert_eq!(container.attaches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_script_failure() {
        let container = ScriptedContainer::new("", 2);
        let resource = Resource::new(container);

        let err = resource
            .check(&Source::new(), None, &mut abort::never())
            .await
            .unwrap_err();

        match err {
            Error::ScriptFailed { status, .. } => assert_eq!(status, 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn abort_stops_the_container() {
        let container = ScriptedContainer::hanging();
        let resource = Resource::new(container.clone());
        let (tx, mut rx) = abort::channel();

        let handle = tokio::spawn(async move {
            resource
                .check(&Source::new(), None, &mut rx)
                .await
                .unwrap_err()
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();

        let err = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(err, Error::Aborted));
        assert!(container.stopped.load(Ordering::SeqCst));
    }
}
