use crate::error::{self, Result};
use crate::request::{ProbeResult, RequestDescriptor};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::AttachParams;
use kube::{Api, Client};
use log::{debug, warn};
use snafu::{ensure, OptionExt, ResultExt};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::time::Duration;
use tokio::io::AsyncReadExt;

/// The `--max-time` given to curl unless configured otherwise.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// The captured result of a command run inside a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the exit code was not reported.
    pub exit_code: Option<i32>,
    pub success: bool,
}

/// Runs commands inside pods. [`KubeExec`] is the implementation backed by the k8s API. Tests can
/// substitute their own.
#[async_trait]
pub trait PodExec: Send + Sync {
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
        command: Vec<String>,
    ) -> Result<ExecOutput>;
}

/// [`PodExec`] over the pod `exec` subresource.
#[derive(Clone)]
pub struct KubeExec {
    k8s_client: Client,
}

impl KubeExec {
    pub fn new(k8s_client: Client) -> Self {
        Self { k8s_client }
    }
}

#[async_trait]
impl PodExec for KubeExec {
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
        command: Vec<String>,
    ) -> Result<ExecOutput> {
        let pods: Api<Pod> = Api::namespaced(self.k8s_client.clone(), namespace);
        let mut params = AttachParams::default().stdout(true).stderr(true);
        if let Some(container) = container {
            params = params.container(container);
        }

        let mut process = pods
            .exec(pod, command, &params)
            .await
            .context(error::ExecSnafu { pod })?;
        let mut stdout_reader = process
            .stdout()
            .context(error::MissingStreamSnafu { what: "stdout" })?;
        let mut stderr_reader = process
            .stderr()
            .context(error::MissingStreamSnafu { what: "stderr" })?;
        let status = process
            .take_status()
            .context(error::MissingStreamSnafu { what: "status" })?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        let (stdout_read, stderr_read) = tokio::join!(
            stdout_reader.read_to_string(&mut stdout),
            stderr_reader.read_to_string(&mut stderr)
        );
        stdout_read.context(error::IoSnafu {
            action: "read exec stdout",
        })?;
        stderr_read.context(error::IoSnafu {
            action: "read exec stderr",
        })?;

        let status = status.await;
        session_closed(pod, process.join().await);

        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code: status.as_ref().and_then(exit_code),
            success: status
                .as_ref()
                .and_then(|s| s.status.as_deref())
                .map(|s| s == "Success")
                .unwrap_or_default(),
        })
    }
}

/// Logs a failure to tear down the exec session. The command's output and status have been read by
/// then, so the failure does not change the result.
fn session_closed<E>(pod: &str, joined: std::result::Result<(), E>) -> bool
where
    E: Display,
{
    match joined {
        Ok(()) => true,
        Err(e) => {
            warn!("Exec session in pod '{}' did not close cleanly: {}", pod, e);
            false
        }
    }
}

/// The exec status reports a failed command's exit code as a `StatusCause` with reason `ExitCode`.
fn exit_code(status: &Status) -> Option<i32> {
    if status.status.as_deref() == Some("Success") {
        return Some(0);
    }
    status
        .details
        .as_ref()?
        .causes
        .as_ref()?
        .iter()
        .find(|cause| cause.reason.as_deref() == Some("ExitCode"))
        .and_then(|cause| cause.message.as_deref())
        .and_then(|message| message.parse().ok())
}

/// Sends HTTP requests with `curl` from inside the source pod of a [`RequestDescriptor`], so the
/// request passes through that pod's sidecar.
pub struct HttpRequester<E> {
    exec: E,
    container: Option<String>,
    timeout: Duration,
}

impl<E> HttpRequester<E>
where
    E: PodExec,
{
    pub fn new(exec: E) -> Self {
        Self {
            exec,
            container: None,
            timeout: DEFAULT_HTTP_TIMEOUT,
        }
    }

    /// The container in the source pod that has `curl`. Defaults to the pod's default container.
    pub fn container(mut self, container: Option<String>) -> Self {
        self.container = container;
        self
    }

    /// Passed to curl as `--max-time`, so that a single request can not hang its caller. Fractions
    /// of a second are kept, down to a floor of one millisecond since curl treats `0` as no limit.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn command(&self, destination: &str) -> Vec<String> {
        // Dump the response headers to stdout and discard the body.
        vec![
            "curl".to_string(),
            "-sS".to_string(),
            "-o".to_string(),
            "/dev/null".to_string(),
            "-D".to_string(),
            "-".to_string(),
            "--max-time".to_string(),
            max_time(self.timeout),
            destination.to_string(),
        ]
    }

    /// Issues one request. Never fails: errors are reported in the returned [`ProbeResult`] with a
    /// status code of `0`.
    pub async fn request(&self, descriptor: &RequestDescriptor) -> ProbeResult {
        match self.try_request(descriptor).await {
            Ok((status_code, headers)) => ProbeResult::ok(status_code, headers),
            Err(e) => {
                debug!("{}: {}", descriptor, e);
                ProbeResult::failed(e)
            }
        }
    }

    async fn try_request(
        &self,
        descriptor: &RequestDescriptor,
    ) -> Result<(u16, BTreeMap<String, String>)> {
        let output = self
            .exec
            .exec(
                &descriptor.source_namespace,
                &descriptor.source_pod,
                self.container.as_deref(),
                self.command(&descriptor.destination),
            )
            .await?;
        ensure!(
            output.success,
            error::CommandFailedSnafu {
                pod: &descriptor.source_pod,
                exit_code: output.exit_code,
                stderr: output.stderr.trim(),
            }
        );
        parse_curl_headers(&output.stdout)
    }
}

/// Formats a timeout as the decimal seconds curl's `--max-time` takes.
fn max_time(timeout: Duration) -> String {
    timeout.max(Duration::from_millis(1)).as_secs_f64().to_string()
}

/// Parses the headers curl dumps with `-D -` into the status code and headers of the final
/// response. Header names are lower-cased. Earlier blocks (`100 Continue`, redirects that were
/// followed) are discarded.
pub fn parse_curl_headers(output: &str) -> Result<(u16, BTreeMap<String, String>)> {
    let mut status_code = None;
    let mut headers = BTreeMap::new();

    for line in output.lines().map(|line| line.trim_end_matches('\r')) {
        if line.starts_with("HTTP/") {
            let code = line
                .split_whitespace()
                .nth(1)
                .and_then(|code| code.parse::<u16>().ok())
                .context(error::ParseCurlSnafu {
                    reason: format!("invalid status line '{}'", line),
                })?;
            status_code = Some(code);
            headers.clear();
        } else if let Some((name, value)) = line.split_once(':') {
            if status_code.is_some() {
                headers.insert(name.trim().to_lowercase(), value.trim().to_string());
            }
        }
    }

    let status_code = status_code.context(error::ParseCurlSnafu {
        reason: "no status line in output",
    })?;
    Ok((status_code, headers))
}
