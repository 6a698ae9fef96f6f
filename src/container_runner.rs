//! Sandboxed agent-invocation containers.
//!
//! Each agent turn that opts into container isolation runs inside a
//! throwaway Docker container: stdin carries a JSON request, stdout
//! carries a JSON response framed between two sentinel lines so stray
//! stdout writes from the sandboxed process (library log spam, etc.)
//! can't be mistaken for the result. Shutdown follows the same
//! soft-kill-then-hard-kill shape as the subprocess lifecycle this is
//! grounded on: ask nicely, give it a grace period, then force it.

use crate::config::ContainerConfig;
use crate::error::{ContainerError, Result};
use bollard::Docker;
use bollard::container::{
    AttachContainerOptions, Config as ContainerCfg, RemoveContainerOptions, StopContainerOptions,
};
use bollard::models::HostConfig;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::timeout;

const OUTPUT_START: &str = "===AGENT_OUTPUT_START===";
const OUTPUT_END: &str = "===AGENT_OUTPUT_END===";
const GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Everything a single sandboxed invocation needs: the image to run and
/// the JSON payload to hand it on stdin.
pub struct ContainerRequest {
    pub image: String,
    pub input: serde_json::Value,
    pub env: HashMap<String, String>,
}

/// Bounds concurrent sandbox invocations and drives the container
/// lifecycle for each one.
pub struct ContainerRunner {
    docker: Docker,
    config: ContainerConfig,
    semaphore: Semaphore,
}

impl ContainerRunner {
    pub fn new(config: ContainerConfig) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| ContainerError::SpawnFailed(e.to_string()))?;
        Ok(Self {
            docker,
            semaphore: Semaphore::new(config.max_concurrent),
            config,
        })
    }

    /// Run one sandboxed invocation end to end: create, start, feed stdin,
    /// read the sentinel-framed result, tear down.
    pub async fn run(&self, request: ContainerRequest) -> Result<serde_json::Value> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| ContainerError::SpawnFailed(e.to_string()))?;

        let name = format!("loop-gateway-run-{}", uuid::Uuid::new_v4());
        let host_config = HostConfig {
            auto_remove: Some(false),
            memory: Some(self.config.memory_limit_bytes),
            nano_cpus: Some((self.config.cpu_limit * 1_000_000_000.0) as i64),
            network_mode: Some("none".to_string()),
            readonly_rootfs: Some(true),
            tmpfs: Some(HashMap::from([(
                "/tmp".to_string(),
                "rw,noexec,nosuid,size=64m".to_string(),
            )])),
            ..Default::default()
        };

        let env: Vec<String> = request
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let create_options = bollard::container::CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };
        let container_config = ContainerCfg {
            image: Some(request.image.clone()),
            env: Some(env),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            open_stdin: Some(true),
            tty: Some(false),
            host_config: Some(host_config),
            ..Default::default()
        };

        self.docker
            .create_container(Some(create_options), container_config)
            .await
            .map_err(|e| ContainerError::SpawnFailed(e.to_string()))?;

        let result = self.run_attached(&name, &request.input).await;

        self.teardown(&name).await;
        result
    }

    async fn run_attached(&self, name: &str, input: &serde_json::Value) -> Result<serde_json::Value> {
        let attach_options = AttachContainerOptions::<String> {
            stdin: Some(true),
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            ..Default::default()
        };
        let bollard::container::AttachContainerResults {
            mut output,
            mut input: stdin,
        } = self
            .docker
            .attach_container(name, Some(attach_options))
            .await
            .map_err(|e| ContainerError::SpawnFailed(e.to_string()))?;

        self.docker
            .start_container::<String>(name, None)
            .await
            .map_err(|e| ContainerError::SpawnFailed(e.to_string()))?;

        let payload = serde_json::to_vec(input).map_err(|e| ContainerError::InvalidOutput(e.to_string()))?;
        use tokio::io::AsyncWriteExt as _;
        stdin
            .write_all(&payload)
            .await
            .map_err(|e| ContainerError::SpawnFailed(e.to_string()))?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|e| ContainerError::SpawnFailed(e.to_string()))?;
        drop(stdin);

        let collected = timeout(
            Duration::from_millis(self.config.timeout_ms),
            collect_sentinel_framed(&mut output),
        )
        .await;

        match collected {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(ContainerError::Timeout(self.config.timeout_ms).into()),
        }
    }

    /// Stop gracefully, giving the sandboxed process [`GRACE_PERIOD`] to
    /// exit, then kill and remove regardless of whether it did.
    async fn teardown(&self, name: &str) {
        let _ = self
            .docker
            .stop_container(
                name,
                Some(StopContainerOptions {
                    t: GRACE_PERIOD.as_secs() as i64,
                }),
            )
            .await;
        let _ = self.docker.kill_container::<String>(name, None).await;
        let _ = self
            .docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;
    }
}

async fn collect_sentinel_framed(
    output: &mut (impl futures::Stream<Item = Result<bollard::container::LogOutput, bollard::errors::Error>>
              + Unpin),
) -> Result<serde_json::Value> {
    let mut buf = String::new();
    while let Some(chunk) = output.next().await {
        let chunk = chunk.map_err(|e| ContainerError::SpawnFailed(e.to_string()))?;
        buf.push_str(&chunk.to_string());
        if buf.contains(OUTPUT_END) {
            break;
        }
    }

    let start = buf.find(OUTPUT_START).ok_or_else(|| ContainerError::MissingSentinels {
        stderr_tail: tail(&buf, 512),
    })?;
    let after_start = start + OUTPUT_START.len();
    let end = buf[after_start..]
        .find(OUTPUT_END)
        .ok_or_else(|| ContainerError::MissingSentinels {
            stderr_tail: tail(&buf, 512),
        })?;

    let json_text = buf[after_start..after_start + end].trim();
    serde_json::from_str(json_text).map_err(|e| ContainerError::InvalidOutput(e.to_string()).into())
}

fn tail(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        s.to_string()
    } else {
        s[s.len() - max_bytes..].to_string()
    }
}
