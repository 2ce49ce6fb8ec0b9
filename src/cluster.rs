use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod as K8sPod;
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, PostParams};
use kube::Client;

use crate::orchestrator::{Orchestrator, OrchestratorError};
use crate::resources::{CiJob, JobSpec, JobStatus, Metadata, Pod};

// Job records are stored as a namespaced custom resource.
const JOB_GROUP: &str = "gaffer.dev";
const JOB_VERSION: &str = "v1";
const JOB_KIND: &str = "CiJob";

/// Kubernetes-backed orchestrator client. Job records live as `CiJob` custom
/// resources, pods as core v1 pods; both are bridged to the native types
/// through their JSON representation.
pub struct KubeOrchestrator {
    resource: ApiResource,
    jobs: Api<DynamicObject>,
    pods: Api<K8sPod>,
}

impl KubeOrchestrator {
    pub fn new(client: Client, namespace: &str) -> Self {
        let gvk = GroupVersionKind::gvk(JOB_GROUP, JOB_VERSION, JOB_KIND);
        let resource = ApiResource::from_gvk(&gvk);
        Self {
            jobs: Api::namespaced_with(client.clone(), namespace, &resource),
            pods: Api::namespaced(client, namespace),
            resource,
        }
    }
}

#[async_trait]
impl Orchestrator for KubeOrchestrator {
    async fn create_job(&self, job: CiJob) -> Result<CiJob, OrchestratorError> {
        let obj = to_dynamic(&job, &self.resource);
        let created = self
            .jobs
            .create(&PostParams::default(), &obj)
            .await
            .map_err(map_err)?;
        from_dynamic(created)
    }

    async fn list_jobs(&self, selector: &str) -> Result<Vec<CiJob>, OrchestratorError> {
        let list = self
            .jobs
            .list(&list_params(selector))
            .await
            .map_err(map_err)?;
        list.items.into_iter().map(from_dynamic).collect()
    }

    async fn replace_job(&self, name: &str, job: CiJob) -> Result<CiJob, OrchestratorError> {
        let obj = to_dynamic(&job, &self.resource);
        let replaced = self
            .jobs
            .replace(name, &PostParams::default(), &obj)
            .await
            .map_err(map_err)?;
        from_dynamic(replaced)
    }

    async fn create_pod(&self, pod: Pod) -> Result<Pod, OrchestratorError> {
        let obj = to_k8s_pod(&pod)?;
        let created = self
            .pods
            .create(&PostParams::default(), &obj)
            .await
            .map_err(map_err)?;
        from_k8s_pod(created)
    }

    async fn list_pods(&self, selector: &str) -> Result<Vec<Pod>, OrchestratorError> {
        let list = self
            .pods
            .list(&list_params(selector))
            .await
            .map_err(map_err)?;
        list.items.into_iter().map(from_k8s_pod).collect()
    }

    async fn delete_pod(&self, name: &str) -> Result<(), OrchestratorError> {
        self.pods
            .delete(name, &DeleteParams::default())
            .await
            .map_err(map_err)?;
        Ok(())
    }
}

fn list_params(selector: &str) -> ListParams {
    if selector.is_empty() {
        ListParams::default()
    } else {
        ListParams::default().labels(selector)
    }
}

fn map_err(err: kube::Error) -> OrchestratorError {
    match err {
        kube::Error::Api(ae) if ae.code == 422 => OrchestratorError::Unprocessable(ae.message),
        kube::Error::Api(ae) if ae.code == 409 => OrchestratorError::Conflict(ae.message),
        other => OrchestratorError::Transport(other.to_string()),
    }
}

fn to_dynamic(job: &CiJob, resource: &ApiResource) -> DynamicObject {
    let mut obj = DynamicObject::new(&job.metadata.name, resource);
    if !job.metadata.labels.is_empty() {
        obj.metadata.labels = Some(job.metadata.labels.clone());
    }
    if !job.metadata.resource_version.is_empty() {
        obj.metadata.resource_version = Some(job.metadata.resource_version.clone());
    }
    obj.data = serde_json::json!({
        "spec": job.spec,
        "status": job.status,
    });
    obj
}

fn from_dynamic(obj: DynamicObject) -> Result<CiJob, OrchestratorError> {
    let spec: JobSpec = match obj.data.get("spec") {
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|err| OrchestratorError::Transport(format!("decoding job spec: {err}")))?,
        None => JobSpec::default(),
    };
    let status: JobStatus = match obj.data.get("status") {
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|err| OrchestratorError::Transport(format!("decoding job status: {err}")))?,
        None => JobStatus::default(),
    };
    Ok(CiJob {
        metadata: Metadata {
            name: obj.metadata.name.unwrap_or_default(),
            labels: obj.metadata.labels.unwrap_or_default(),
            resource_version: obj.metadata.resource_version.unwrap_or_default(),
        },
        spec,
        status,
    })
}

fn to_k8s_pod(pod: &Pod) -> Result<K8sPod, OrchestratorError> {
    serde_json::from_value(serde_json::json!(pod))
        .map_err(|err| OrchestratorError::Transport(format!("encoding pod: {err}")))
}

fn from_k8s_pod(pod: K8sPod) -> Result<Pod, OrchestratorError> {
    serde_json::from_value(serde_json::json!(pod))
        .map_err(|err| OrchestratorError::Transport(format!("decoding pod: {err}")))
}
