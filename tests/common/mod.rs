use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::mpsc;

use gaffer::buildid::{BuildIdAllocator, BuildIdError};
use gaffer::config::Config;
use gaffer::controller::Controller;
use gaffer::forge::{Forge, ForgeError, PullChange};
use gaffer::orchestrator::{Orchestrator, OrchestratorError};
use gaffer::resources::{
    CiJob, Container, JobState, JobType, Metadata, Pod, PodPhase, PodSpec, PodStatus,
    PodTemplateSpec, Pull, Refs, Time,
};

/// In-memory orchestrator. Error injection slots fire once, on the next
/// matching operation.
#[derive(Default)]
pub struct FakeOrchestrator {
    pub jobs: Mutex<Vec<CiJob>>,
    pub pods: Mutex<Vec<Pod>>,
    pub deleted_pods: Mutex<Vec<String>>,
    pub create_pod_error: Mutex<Option<OrchestratorError>>,
    pub replace_job_error: Mutex<Option<OrchestratorError>>,
}

impl FakeOrchestrator {
    pub fn job(&self, name: &str) -> CiJob {
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .find(|j| j.metadata.name == name)
            .cloned()
            .unwrap_or_else(|| panic!("no job named {name}"))
    }

    pub fn jobs_with_identity(&self, identity: &str) -> Vec<CiJob> {
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .filter(|j| j.spec.job == identity)
            .cloned()
            .collect()
    }

    pub fn pod_count(&self) -> usize {
        self.pods.lock().unwrap().len()
    }
}

#[async_trait]
impl Orchestrator for FakeOrchestrator {
    async fn create_job(&self, job: CiJob) -> Result<CiJob, OrchestratorError> {
        self.jobs.lock().unwrap().push(job.clone());
        Ok(job)
    }

    async fn list_jobs(&self, _selector: &str) -> Result<Vec<CiJob>, OrchestratorError> {
        Ok(self.jobs.lock().unwrap().clone())
    }

    async fn replace_job(&self, name: &str, job: CiJob) -> Result<CiJob, OrchestratorError> {
        if let Some(err) = self.replace_job_error.lock().unwrap().take() {
            return Err(err);
        }
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.iter_mut().find(|j| j.metadata.name == name) {
            Some(existing) => *existing = job.clone(),
            None => jobs.push(job.clone()),
        }
        Ok(job)
    }

    async fn create_pod(&self, pod: Pod) -> Result<Pod, OrchestratorError> {
        if let Some(err) = self.create_pod_error.lock().unwrap().take() {
            return Err(err);
        }
        self.pods.lock().unwrap().push(pod.clone());
        Ok(pod)
    }

    async fn list_pods(&self, _selector: &str) -> Result<Vec<Pod>, OrchestratorError> {
        Ok(self.pods.lock().unwrap().clone())
    }

    async fn delete_pod(&self, name: &str) -> Result<(), OrchestratorError> {
        self.pods.lock().unwrap().retain(|p| p.metadata.name != name);
        self.deleted_pods.lock().unwrap().push(name.to_owned());
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeForge {
    pub changes: Vec<String>,
    pub fail: bool,
}

#[async_trait]
impl Forge for FakeForge {
    async fn get_pull_request_changes(
        &self,
        _org: &str,
        _repo: &str,
        _number: u64,
    ) -> Result<Vec<PullChange>, ForgeError> {
        if self.fail {
            return Err(ForgeError::Status(
                reqwest::StatusCode::INTERNAL_SERVER_ERROR,
            ));
        }
        Ok(self
            .changes
            .iter()
            .map(|filename| PullChange {
                filename: filename.clone(),
            })
            .collect())
    }
}

pub struct FakeBuildIds {
    next: AtomicU64,
    pub fail: bool,
}

impl Default for FakeBuildIds {
    fn default() -> Self {
        Self {
            next: AtomicU64::new(1000),
            fail: false,
        }
    }
}

impl FakeBuildIds {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }
}

#[async_trait]
impl BuildIdAllocator for FakeBuildIds {
    async fn allocate(&self, _job: &str) -> Result<String, BuildIdError> {
        if self.fail {
            return Err(BuildIdError::BadBody("flaked".to_owned()));
        }
        Ok(self.next.fetch_add(1, Ordering::SeqCst).to_string())
    }
}

pub struct Fixture {
    pub orchestrator: Arc<FakeOrchestrator>,
    pub forge: Arc<FakeForge>,
    pub build_ids: Arc<FakeBuildIds>,
    pub controller: Controller,
    pub reports: mpsc::Receiver<CiJob>,
}

pub fn fixture(config: Config, jobs: Vec<CiJob>, pods: Vec<Pod>) -> Fixture {
    fixture_with(config, jobs, pods, FakeForge::default(), FakeBuildIds::default())
}

pub fn fixture_with(
    config: Config,
    jobs: Vec<CiJob>,
    pods: Vec<Pod>,
    forge: FakeForge,
    build_ids: FakeBuildIds,
) -> Fixture {
    let orchestrator = Arc::new(FakeOrchestrator {
        jobs: Mutex::new(jobs),
        pods: Mutex::new(pods),
        ..Default::default()
    });
    let forge = Arc::new(forge);
    let build_ids = Arc::new(build_ids);
    let (reports_tx, reports_rx) = mpsc::channel(64);
    let controller = Controller::new(
        orchestrator.clone(),
        forge.clone(),
        build_ids.clone(),
        Arc::new(config),
        reports_tx,
    );
    Fixture {
        orchestrator,
        forge,
        build_ids,
        controller,
        reports: reports_rx,
    }
}

pub fn test_config() -> Config {
    Config::from_yaml("job_url_template: \"{{name}}/{{state}}\"\n").unwrap()
}

pub fn drain_reports(reports: &mut mpsc::Receiver<CiJob>) -> Vec<CiJob> {
    let mut out = Vec::new();
    while let Ok(job) = reports.try_recv() {
        out.push(job);
    }
    out
}

pub fn seconds(secs: i64) -> Time {
    Time(OffsetDateTime::from_unix_timestamp(secs).unwrap())
}

pub fn new_job(name: &str, identity: &str, r#type: JobType) -> CiJob {
    CiJob {
        metadata: Metadata {
            name: name.to_owned(),
            ..Default::default()
        },
        spec: gaffer::resources::JobSpec {
            job: identity.to_owned(),
            r#type,
            pod_template: pod_template(),
            ..Default::default()
        },
        status: gaffer::resources::JobStatus {
            state: JobState::Triggered,
            start_time: Some(seconds(1000)),
            ..Default::default()
        },
    }
}

pub fn pending_job(name: &str, identity: &str) -> CiJob {
    let mut job = new_job(name, identity, JobType::Periodic);
    job.status.state = JobState::Pending;
    job.status.pod_name = name.to_owned();
    job.status.build_id = "1".to_owned();
    job.status.url = format!("{name}/pending");
    job
}

pub fn presubmit_refs(org: &str, repo: &str, number: u64) -> Refs {
    Refs {
        org: org.to_owned(),
        repo: repo.to_owned(),
        base_ref: "master".to_owned(),
        base_sha: "abcdef".to_owned(),
        pulls: vec![Pull {
            number,
            author: "ferris".to_owned(),
            sha: "123456".to_owned(),
        }],
    }
}

pub fn pod(name: &str, phase: PodPhase) -> Pod {
    Pod {
        metadata: Metadata {
            name: name.to_owned(),
            ..Default::default()
        },
        spec: PodSpec::default(),
        status: PodStatus {
            phase,
            reason: String::new(),
        },
    }
}

fn pod_template() -> PodTemplateSpec {
    PodTemplateSpec {
        metadata: Metadata::default(),
        spec: PodSpec {
            containers: vec![Container {
                name: "test".to_owned(),
                image: "fake".to_owned(),
                ..Default::default()
            }],
            restart_policy: None,
        },
    }
}
