use crate::aggregate::Aggregator;
use crate::error::{self, Result};
use crate::http::{HttpRequester, KubeExec};
use crate::poll::RepeatedSuccess;
use crate::request::{ProbeResult, RequestDescriptor, ResultMap};
use crate::settings::Settings;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use log::{debug, info};
use snafu::ResultExt;
use std::num::NonZeroU32;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// # Test Context
///
/// Everything a test step needs to reach the cluster. Construct one when the suite starts and pass
/// it by reference to the steps that need it.
///
/// # Operations
///
/// - Send a request from a pod with [`TestContext::http_request`]
/// - Send many requests at once with [`TestContext::multiple_http_requests`]
/// - Wait until a route is stable with [`TestContext::wait_for_repeated_http_success`]
/// - Wait for application pods with [`TestContext::wait_for_pods_running`]
pub struct TestContext {
    pub k8s_client: Client,
    settings: Settings,
    requester: Arc<HttpRequester<KubeExec>>,
}

impl TestContext {
    /// Create a `TestContext` from the path to a kubeconfig file.
    pub async fn new_from_kubeconfig_path(
        kubeconfig_path: &Path,
        settings: Settings,
    ) -> Result<Self> {
        let kubeconfig = Kubeconfig::read_from(kubeconfig_path).context(error::ConfigReadSnafu)?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .context(error::ClientCreateKubeconfigSnafu)?;
        let k8s_client: Client = config.try_into().context(error::KubeSnafu {
            action: "create client from `Kubeconfig`",
        })?;
        Ok(Self::new_from_k8s_client(k8s_client, settings))
    }

    /// Create a `TestContext` using the default `kube::Client`.
    pub async fn new(settings: Settings) -> Result<Self> {
        let k8s_client = Client::try_default().await.context(error::KubeSnafu {
            action: "create default client",
        })?;
        Ok(Self::new_from_k8s_client(k8s_client, settings))
    }

    pub fn new_from_k8s_client(k8s_client: Client, settings: Settings) -> Self {
        let requester = HttpRequester::new(KubeExec::new(k8s_client.clone()))
            .container(settings.container.clone())
            .timeout(settings.http_timeout());
        Self {
            k8s_client,
            settings,
            requester: Arc::new(requester),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Send one HTTP request from the descriptor's source pod.
    pub async fn http_request(&self, descriptor: &RequestDescriptor) -> ProbeResult {
        self.requester.request(descriptor).await
    }

    /// Send every request concurrently and wait for all of them.
    pub async fn multiple_http_requests(&self, descriptors: Vec<RequestDescriptor>) -> ResultMap {
        let requester = Arc::clone(&self.requester);
        Aggregator::new()
            .with_max_in_flight(self.settings.max_in_flight)
            .run_all(descriptors, move |descriptor| {
                let requester = Arc::clone(&requester);
                async move { requester.request(&descriptor).await }
            })
            .await
    }

    /// Repeat a request until it has succeeded `required` times in a row, or `max_wait` passes.
    pub async fn wait_for_repeated_http_success(
        &self,
        descriptor: &RequestDescriptor,
        required: NonZeroU32,
        max_wait: Duration,
    ) -> bool {
        RepeatedSuccess::new(required, max_wait)
            .interval(self.settings.poll_interval())
            .wait(move || async move {
                let result = self.http_request(descriptor).await;
                debug!(
                    "{}: status {} {}",
                    descriptor,
                    result.status_code,
                    result.error.as_deref().unwrap_or_default()
                );
                result.is_success()
            })
            .await
    }

    /// The number of pods in `namespace` whose phase is `Running`.
    pub async fn pods_running(&self, namespace: &str) -> Result<usize> {
        let pods: Api<Pod> = Api::namespaced(self.k8s_client.clone(), namespace);
        let pods = pods
            .list(&ListParams::default())
            .await
            .context(error::KubeSnafu {
                action: format!("list pods in '{}'", namespace),
            })?;
        Ok(pods.into_iter().filter(is_running).count())
    }

    /// Wait until at least `expected` pods in `namespace` are running.
    pub async fn wait_for_pods_running(
        &self,
        namespace: &str,
        expected: usize,
        timeout: Duration,
    ) -> Result<()> {
        let start = Instant::now();
        loop {
            let running = self.pods_running(namespace).await?;
            if running >= expected {
                info!(
                    "{}/{} pods running in '{}' after {:?}",
                    running,
                    expected,
                    namespace,
                    start.elapsed()
                );
                return Ok(());
            }
            debug!("{}/{} pods running in '{}'", running, expected, namespace);
            if start.elapsed() >= timeout {
                return error::TimeoutSnafu {
                    duration: timeout,
                    what: format!("{} running pods in '{}'", expected, namespace),
                }
                .fail();
            }
            sleep(self.settings.poll_interval()).await;
        }
    }
}

fn is_running(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        .map(|phase| phase == "Running")
        .unwrap_or_default()
}
