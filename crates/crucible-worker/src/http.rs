//! HTTP client for container hosts.
//!
//! Hosts expose a small JSON surface for container and process management;
//! this adapter speaks it on behalf of the pool. The exact wire shape is a
//! host concern, not part of the control plane's contract.

use crate::pool::{ContainerHost, HostContainerSpec, HostDialer};
use async_trait::async_trait;
use crucible_core::ports::{Container, ContainerProperties, Process, ProcessResult, ProcessSpec};
use crucible_core::workers::WorkerInfo;
use crucible_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

fn worker_err(err: reqwest::Error) -> Error {
    Error::Worker(err.to_string())
}

#[derive(Clone)]
pub struct HttpDialer {
    client: reqwest::Client,
}

impl HttpDialer {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpDialer {
    fn default() -> Self {
        Self::new()
    }
}

impl HostDialer for HttpDialer {
    fn dial(&self, worker: &WorkerInfo) -> Arc<dyn ContainerHost> {
        Arc::new(HttpContainerHost {
            client: self.client.clone(),
            base: format!("http://{}", worker.addr),
        })
    }
}

pub struct HttpContainerHost {
    client: reqwest::Client,
    base: String,
}

#[derive(Serialize)]
struct CreateRequest<'a> {
    rootfs: &'a str,
    privileged: bool,
    properties: &'a ContainerProperties,
}

#[derive(Deserialize)]
struct ContainerResponse {
    handle: String,
}

#[async_trait]
impl ContainerHost for HttpContainerHost {
    async fn create(&self, spec: &HostContainerSpec) -> Result<Box<dyn Container>> {
        let response: ContainerResponse = self
            .client
            .post(format!("{}/containers", self.base))
            .json(&CreateRequest {
                rootfs: &spec.rootfs,
                privileged: spec.privileged,
                properties: &spec.properties,
            })
            .send()
            .await
            .map_err(worker_err)?
            .error_for_status()
            .map_err(worker_err)?
            .json()
            .await
            .map_err(worker_err)?;

        Ok(Box::new(HttpContainer {
            client: self.client.clone(),
            base: format!("{}/containers/{}", self.base, response.handle),
            handle: response.handle,
        }))
    }

    async fn containers(
        &self,
        properties: &ContainerProperties,
    ) -> Result<Vec<Box<dyn Container>>> {
        let filter = serde_json::to_string(properties)?;
        let response: Vec<ContainerResponse> = self
            .client
            .get(format!("{}/containers", self.base))
            .query(&[("properties", filter)])
            .send()
            .await
            .map_err(worker_err)?
            .error_for_status()
            .map_err(worker_err)?
            .json()
            .await
            .map_err(worker_err)?;

        Ok(response
            .into_iter()
            .map(|c| {
                Box::new(HttpContainer {
                    client: self.client.clone(),
                    base: format!("{}/containers/{}", self.base, c.handle),
                    handle: c.handle,
                }) as Box<dyn Container>
            })
            .collect())
    }
}

pub struct HttpContainer {
    client: reqwest::Client,
    base: String,
    handle: String,
}

#[derive(Deserialize)]
struct ProcessResponse {
    id: u32,
}

#[derive(Deserialize)]
struct PropertyResponse {
    value: String,
}

#[async_trait]
impl Container for HttpContainer {
    fn handle(&self) -> &str {
        &self.handle
    }

    async fn run(&self, spec: ProcessSpec) -> Result<Box<dyn Process>> {
        #[derive(Serialize)]
        struct RunRequest<'a> {
            path: &'a str,
            args: &'a [String],
            env: &'a [(String, String)],
            dir: Option<&'a str>,
            privileged: bool,
            stdin: Option<&'a str>,
        }

        let response: ProcessResponse = self
            .client
            .post(format!("{}/processes", self.base))
            .json(&RunRequest {
                path: &spec.path,
                args: &spec.args,
                env: &spec.env,
                dir: spec.dir.as_deref(),
                privileged: spec.privileged,
                stdin: spec.stdin.as_deref(),
            })
            .send()
            .await
            .map_err(worker_err)?
            .error_for_status()
            .map_err(worker_err)?
            .json()
            .await
            .map_err(worker_err)?;

        Ok(Box::new(HttpProcess {
            client: self.client.clone(),
            url: format!("{}/processes/{}/wait", self.base, response.id),
            id: response.id,
        }))
    }

    async fn attach(&self, pid: u32) -> Result<Box<dyn Process>> {
        Ok(Box::new(HttpProcess {
            client: self.client.clone(),
            url: format!("{}/processes/{}/wait", self.base, pid),
            id: pid,
        }))
    }

    async fn property(&self, name: &str) -> Result<String> {
        let response = self
            .client
            .get(format!("{}/properties/{}", self.base, name))
            .send()
            .await
            .map_err(worker_err)?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::Internal(format!("no such property: {name}")));
        }

        let property: PropertyResponse = response
            .error_for_status()
            .map_err(worker_err)?
            .json()
            .await
            .map_err(worker_err)?;
        Ok(property.value)
    }

    async fn set_property(&self, name: &str, value: &str) -> Result<()> {
        self.client
            .put(format!("{}/properties/{}", self.base, name))
            .json(&serde_json::json!({ "value": value }))
            .send()
            .await
            .map_err(worker_err)?
            .error_for_status()
            .map_err(worker_err)?;
        Ok(())
    }

    async fn stop(&self, kill: bool) -> Result<()> {
        self.client
            .post(format!("{}/stop", self.base))
            .json(&serde_json::json!({ "kill": kill }))
            .send()
            .await
            .map_err(worker_err)?
            .error_for_status()
            .map_err(worker_err)?;
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        self.client
            .delete(&self.base)
            .send()
            .await
            .map_err(worker_err)?
            .error_for_status()
            .map_err(worker_err)?;
        Ok(())
    }

    async fn stream_out(&self, path: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(format!("{}/files", self.base))
            .query(&[("path", path)])
            .send()
            .await
            .map_err(worker_err)?
            .error_for_status()
            .map_err(worker_err)?;

        Ok(response.bytes().await.map_err(worker_err)?.to_vec())
    }

    async fn stream_in(&self, path: &str, data: &[u8]) -> Result<()> {
        self.client
            .put(format!("{}/files", self.base))
            .query(&[("path", path)])
            .body(data.to_vec())
            .send()
            .await
            .map_err(worker_err)?
            .error_for_status()
            .map_err(worker_err)?;
        Ok(())
    }

    fn release(&self) {}
}

struct HttpProcess {
    client: reqwest::Client,
    url: String,
    id: u32,
}

#[async_trait]
impl Process for HttpProcess {
    fn id(&self) -> u32 {
        self.id
    }

    async fn wait(&mut self) -> Result<ProcessResult> {
        #[derive(Deserialize)]
        struct WaitResponse {
            exit_status: i32,
            #[serde(default)]
            stdout: String,
            #[serde(default)]
            stderr: String,
        }

        let response: WaitResponse = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(worker_err)?
            .error_for_status()
            .map_err(worker_err)?
            .json()
            .await
            .map_err(worker_err)?;

        Ok(ProcessResult {
            exit_status: response.exit_status,
            stdout: response.stdout,
            stderr: response.stderr,
        })
    }
}
