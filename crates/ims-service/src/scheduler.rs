//! Cluster job scheduler interface and the Kubernetes implementation

use async_trait::async_trait;
use ims_common::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

/// Reference to a submitted job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub namespace: String,
    pub name: String,
}

/// Launches and removes cluster jobs from rendered job specifications
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Submit a rendered job specification, failing with `Scheduler`
    async fn submit_job(&self, spec: &Value) -> Result<JobHandle>;

    /// Remove a job and its pods, failing with `NotFound` if it is gone
    async fn delete_job(&self, handle: &JobHandle) -> Result<()>;
}

/// Talks to the Kubernetes batch API over REST
pub struct KubernetesScheduler {
    client: reqwest::Client,
    api_url: String,
    namespace: String,
    token: Option<String>,
}

impl KubernetesScheduler {
    pub fn new(api_url: impl Into<String>, namespace: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            namespace: namespace.into(),
            token,
        }
    }

    fn jobs_url(&self, namespace: &str) -> String {
        format!("{}/apis/batch/v1/namespaces/{}/jobs", self.api_url, namespace)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

fn spec_namespace<'a>(spec: &'a Value, default: &'a str) -> &'a str {
    spec.pointer("/metadata/namespace")
        .and_then(Value::as_str)
        .filter(|ns| !ns.is_empty())
        .unwrap_or(default)
}

#[async_trait]
impl Scheduler for KubernetesScheduler {
    async fn submit_job(&self, spec: &Value) -> Result<JobHandle> {
        let namespace = spec_namespace(spec, &self.namespace).to_string();

        let response = self
            .authorized(self.client.post(self.jobs_url(&namespace)))
            .json(spec)
            .send()
            .await
            .map_err(|e| Error::Scheduler(format!("Failed to reach the Kubernetes API: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(Error::Scheduler(format!(
                "Job submission rejected ({}): {}",
                status, body
            )));
        }

        let created: Value = response
            .json()
            .await
            .map_err(|e| Error::Scheduler(format!("Invalid job submission response: {}", e)))?;
        let name = created
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Scheduler("Job submission response has no name".to_string()))?
            .to_string();

        info!("Submitted Kubernetes job {}/{}", namespace, name);
        Ok(JobHandle { namespace, name })
    }

    async fn delete_job(&self, handle: &JobHandle) -> Result<()> {
        let url = format!(
            "{}/{}?propagationPolicy=Background",
            self.jobs_url(&handle.namespace),
            handle.name
        );

        let response = self
            .authorized(self.client.delete(url))
            .send()
            .await
            .map_err(|e| Error::Scheduler(format!("Failed to reach the Kubernetes API: {}", e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::not_found("kubernetes job", &handle.name));
        }
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(Error::Scheduler(format!(
                "Job deletion rejected ({}): {}",
                status, body
            )));
        }

        debug!("Deleted Kubernetes job {}/{}", handle.namespace, handle.name);
        Ok(())
    }
}
