use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

use crate::buildid::{BuildIdAllocator, BuildIdError};
use crate::config::{render_job_url, Config, ConfigError};
use crate::forge::{Forge, ForgeError};
use crate::orchestrator::{Orchestrator, OrchestratorError};
use crate::resources::{
    CiJob, Container, EnvVar, JobSpec, JobState, JobStatus, JobType, Metadata, Pod, PodPhase,
    PodStatus, CREATED_BY_LABEL, JOB_NAME_LABEL, JOB_TYPE_LABEL,
};
use crate::utils;

// Environment injected into every container of a job's pod.
const JOB_NAME_ENV: &str = "JOB_NAME";
const JOB_TYPE_ENV: &str = "JOB_TYPE";
const BUILD_ID_ENV: &str = "BUILD_ID";
// Older workloads read the build number under this name.
const BUILD_NUMBER_ENV: &str = "BUILD_NUMBER";
const REPO_OWNER_ENV: &str = "REPO_OWNER";
const REPO_NAME_ENV: &str = "REPO_NAME";
const PULL_BASE_REF_ENV: &str = "PULL_BASE_REF";
const PULL_BASE_SHA_ENV: &str = "PULL_BASE_SHA";
const PULL_REFS_ENV: &str = "PULL_REFS";
const PULL_NUMBER_ENV: &str = "PULL_NUMBER";
const PULL_PULL_SHA_ENV: &str = "PULL_PULL_SHA";

#[derive(Debug)]
pub enum SyncError {
    Orchestrator(OrchestratorError),
    BuildId(BuildIdError),
    Forge(ForgeError),
    Config(ConfigError),
    /// Per-job failures collected over a whole tick, keyed by record name.
    Aggregate(Vec<(String, SyncError)>),
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::Orchestrator(err) => write!(f, "orchestrator: {err}"),
            SyncError::BuildId(err) => write!(f, "build id allocation: {err}"),
            SyncError::Forge(err) => write!(f, "forge: {err}"),
            SyncError::Config(err) => write!(f, "config: {err}"),
            SyncError::Aggregate(failures) => {
                write!(f, "{} job sync(s) failed:", failures.len())?;
                for (job, err) in failures {
                    write!(f, " [{job}: {err}]")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for SyncError {}

impl From<OrchestratorError> for SyncError {
    fn from(err: OrchestratorError) -> Self {
        SyncError::Orchestrator(err)
    }
}
impl From<BuildIdError> for SyncError {
    fn from(err: BuildIdError) -> Self {
        SyncError::BuildId(err)
    }
}
impl From<ForgeError> for SyncError {
    fn from(err: ForgeError) -> Self {
        SyncError::Forge(err)
    }
}
impl From<ConfigError> for SyncError {
    fn from(err: ConfigError) -> Self {
        SyncError::Config(err)
    }
}

/// The job reconciliation controller. One [`Controller::sync`] call drives
/// every job record one step toward completion: Triggered records are
/// admitted and get pods, Pending records follow their pod's phase, and
/// records whose externally visible status changed are handed to the
/// reporter.
pub struct Controller {
    orchestrator: Arc<dyn Orchestrator>,
    forge: Arc<dyn Forge>,
    build_ids: Arc<dyn BuildIdAllocator>,
    config: Arc<Config>,
    reporter: mpsc::Sender<CiJob>,
    // Pending-record count per job identity. Rebuilt from the snapshot at
    // the start of every tick so external edits cannot make it drift.
    pending_jobs: RwLock<BTreeMap<String, u32>>,
}

impl Controller {
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        forge: Arc<dyn Forge>,
        build_ids: Arc<dyn BuildIdAllocator>,
        config: Arc<Config>,
        reporter: mpsc::Sender<CiJob>,
    ) -> Self {
        Self {
            orchestrator,
            forge,
            build_ids,
            config,
            reporter,
            pending_jobs: RwLock::new(BTreeMap::new()),
        }
    }

    /// One tick. Succeeds iff every per-job reconcile succeeded; per-job
    /// failures are aggregated and returned after both partitions drain.
    pub async fn sync(&self) -> Result<(), SyncError> {
        let config = Arc::clone(&self.config);

        let mut jobs = self.orchestrator.list_jobs("").await?;
        let pods = self
            .orchestrator
            .list_pods(&format!("{CREATED_BY_LABEL}=true"))
            .await?;
        let pod_index: BTreeMap<String, Pod> = pods
            .into_iter()
            .map(|p| (p.metadata.name.clone(), p))
            .collect();

        {
            let mut pending = self.pending_jobs.write().await;
            pending.clear();
            for job in jobs.iter().filter(|j| j.status.state == JobState::Pending) {
                *pending.entry(job.spec.job.clone()).or_insert(0) += 1;
            }
        }

        let mut failures = self.terminate_dupes(&mut jobs).await;

        let (pending, non_pending): (Vec<CiJob>, Vec<CiJob>) = jobs
            .into_iter()
            .partition(|j| j.status.state == JobState::Pending);

        let total = pending.len() + non_pending.len();
        let workers = config.sync_workers().max(1);
        debug!(
            pending = pending.len(),
            other = non_pending.len(),
            workers,
            "Syncing job records"
        );

        // Sized so no worker ever blocks on a send.
        let (report_tx, mut report_rx) = mpsc::channel(total.max(1));
        let (error_tx, mut error_rx) = mpsc::channel(total.max(1));

        futures::join!(
            self.reconcile_all(pending, &pod_index, &config, &report_tx, &error_tx, workers),
            self.reconcile_all(
                non_pending,
                &pod_index,
                &config,
                &report_tx,
                &error_tx,
                workers
            ),
        );
        drop(report_tx);
        drop(error_tx);

        while let Some(job) = report_rx.recv().await {
            // The reporter buffer is owned externally and presumed ample;
            // filling it is a programming error, not back-pressure.
            self.reporter
                .try_send(job)
                .expect("reporter channel full or closed");
        }
        while let Some(failure) = error_rx.recv().await {
            failures.push(failure);
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(SyncError::Aggregate(failures))
        }
    }

    async fn reconcile_all(
        &self,
        jobs: Vec<CiJob>,
        pods: &BTreeMap<String, Pod>,
        config: &Config,
        reports: &mpsc::Sender<CiJob>,
        errors: &mpsc::Sender<(String, SyncError)>,
        workers: usize,
    ) {
        futures::stream::iter(jobs)
            .for_each_concurrent(workers, |job| async move {
                let name = job.metadata.name.clone();
                let result = match job.status.state {
                    JobState::Pending => self.sync_pending_job(job, pods, config, reports).await,
                    _ => self.sync_non_pending_job(job, pods, config, reports).await,
                };
                if let Err(err) = result {
                    error!(job = name.as_str(), %err, "Failed to sync job");
                    errors.send((name, err)).await.ok();
                }
            })
            .await;
    }

    /// Abort all but the newest non-complete run per (job, org, repo, pulls)
    /// identity. Batch and periodic jobs are exempt: they have no canonical
    /// newest member under this grouping.
    async fn terminate_dupes(&self, jobs: &mut [CiJob]) -> Vec<(String, SyncError)> {
        let mut failures = Vec::new();
        let mut newest: BTreeMap<DupeKey, usize> = BTreeMap::new();
        for i in 0..jobs.len() {
            if jobs[i].complete()
                || !matches!(
                    jobs[i].spec.r#type,
                    JobType::Presubmit | JobType::Postsubmit
                )
            {
                continue;
            }
            let key = DupeKey::of(&jobs[i]);
            let cancel = match newest.get(&key).copied() {
                None => {
                    newest.insert(key, i);
                    continue;
                }
                Some(prev) => {
                    if jobs[i].status.start_time > jobs[prev].status.start_time {
                        newest.insert(key, i);
                        prev
                    } else {
                        i
                    }
                }
            };

            let job = &mut jobs[cancel];
            debug!(job = job.metadata.name.as_str(), "Aborting duplicate run");
            job.status.state = JobState::Aborted;
            job.set_complete(utils::now());
            job.status.description = "Superseded by a newer run.".to_owned();
            let name = job.metadata.name.clone();
            match self.orchestrator.replace_job(&name, job.clone()).await {
                Ok(replaced) => *job = replaced,
                Err(err) => failures.push((name, err.into())),
            }
        }
        failures
    }

    /// Reconcile a record that has no admitted pod: Triggered records are
    /// started (subject to admission), terminal records are left alone.
    async fn sync_non_pending_job(
        &self,
        job: CiJob,
        pods: &BTreeMap<String, Pod>,
        config: &Config,
        reports: &mpsc::Sender<CiJob>,
    ) -> Result<(), SyncError> {
        if job.complete() {
            return Ok(());
        }
        if job.status.state != JobState::Triggered {
            debug!(
                job = job.metadata.name.as_str(),
                state = %job.status.state,
                "Skipping incomplete job in unexpected state"
            );
            return Ok(());
        }

        let snapshot = job.status.clone();
        let mut job = job;

        match pods.get(&job.metadata.name) {
            Some(pod) => {
                // A previous tick started the pod but failed to persist the
                // transition. Adopt it and claim its pending slot.
                job.status.state = JobState::Pending;
                job.status.pod_name = pod.metadata.name.clone();
                job.status.build_id = pod_build_id(pod);
                job.status.description = "Job triggered.".to_owned();
                self.increment_pending(&job.spec.job).await;
            }
            None => {
                if !self.try_admit(config, &job).await {
                    return Ok(());
                }
                let build_id = self.build_ids.allocate(&job.spec.job).await?;
                let pod = build_pod(&job, &build_id);
                match self.orchestrator.create_pod(pod).await {
                    Ok(created) => {
                        job.status.state = JobState::Pending;
                        job.status.pod_name = created.metadata.name.clone();
                        job.status.build_id = build_id;
                        job.status.description = "Job triggered.".to_owned();
                    }
                    Err(err) if err.is_unprocessable() => {
                        warn!(
                            job = job.metadata.name.as_str(),
                            %err,
                            "Pod rejected as unprocessable"
                        );
                        job.status.state = JobState::Error;
                        job.set_complete(utils::now());
                        job.status.description = "Job cannot be processed.".to_owned();
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }

        self.refresh_url(config, &mut job);

        let name = job.metadata.name.clone();
        let job = self.orchestrator.replace_job(&name, job).await?;

        if status_changed(&snapshot, &job.status) {
            reports.send(job).await.ok();
        }
        Ok(())
    }

    /// Reconcile an admitted record against its pod's phase.
    async fn sync_pending_job(
        &self,
        job: CiJob,
        pods: &BTreeMap<String, Pod>,
        config: &Config,
        reports: &mpsc::Sender<CiJob>,
    ) -> Result<(), SyncError> {
        let snapshot = job.status.clone();
        let mut job = job;
        let mut succeeded = false;

        let pod_name = if job.status.pod_name.is_empty() {
            job.metadata.name.clone()
        } else {
            job.status.pod_name.clone()
        };

        match pods.get(&pod_name) {
            None => {
                // The pod disappeared underneath us. Start it again.
                let build_id = self.build_ids.allocate(&job.spec.job).await?;
                let pod = build_pod(&job, &build_id);
                match self.orchestrator.create_pod(pod).await {
                    Ok(created) => {
                        info!(
                            job = job.metadata.name.as_str(),
                            "Restarted pod for pending job"
                        );
                        job.status.pod_name = created.metadata.name.clone();
                        job.status.build_id = build_id;
                        job.status.description = "Job re-scheduled.".to_owned();
                    }
                    Err(err) if err.is_unprocessable() => {
                        job.status.state = JobState::Error;
                        job.set_complete(utils::now());
                        job.status.description = "Job cannot be processed.".to_owned();
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            Some(pod) => match pod.status.phase {
                PodPhase::Unknown => {
                    // Node lost track of it; delete and respawn next tick.
                    info!(
                        pod = pod.metadata.name.as_str(),
                        "Deleting pod in unknown state"
                    );
                    self.orchestrator.delete_pod(&pod.metadata.name).await?;
                    return Ok(());
                }
                PodPhase::Failed if pod.evicted() => {
                    info!(pod = pod.metadata.name.as_str(), "Deleting evicted pod");
                    self.orchestrator.delete_pod(&pod.metadata.name).await?;
                    return Ok(());
                }
                PodPhase::Failed => {
                    job.status.state = JobState::Failure;
                    job.set_complete(utils::now());
                    job.status.description = "Job failed.".to_owned();
                }
                PodPhase::Succeeded => {
                    job.status.state = JobState::Success;
                    job.set_complete(utils::now());
                    job.status.description = "Job succeeded.".to_owned();
                    succeeded = true;
                }
                PodPhase::Pending | PodPhase::Running => {
                    if !job.status.url.is_empty() {
                        // Nothing to do until the pod finishes.
                        return Ok(());
                    }
                }
            },
        }

        self.refresh_url(config, &mut job);

        let name = job.metadata.name.clone();
        let job = match self.orchestrator.replace_job(&name, job.clone()).await {
            Ok(replaced) => replaced,
            Err(err) if err.is_unprocessable() => {
                warn!(job = name.as_str(), %err, "Job update rejected");
                job.status.state = JobState::Error;
                job.set_complete(utils::now());
                job.status.description = "Job update rejected.".to_owned();
                self.refresh_url(config, &mut job);
                // The stored record refused the update; the report is the
                // only trace this job leaves.
                reports.send(job).await.ok();
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        if status_changed(&snapshot, &job.status) {
            reports.send(job.clone()).await.ok();
        }

        if succeeded {
            self.materialize_follow_ons(&job, config).await?;
        }
        Ok(())
    }

    /// Create the follow-on records of a freshly successful parent. The
    /// parent's terminal state is persisted before this runs, so a failure
    /// here never replays on a later tick.
    async fn materialize_follow_ons(
        &self,
        parent: &CiJob,
        config: &Config,
    ) -> Result<(), SyncError> {
        for child in &parent.spec.run_after_success {
            if !self.run_after_success_can_run(parent, child, config).await? {
                debug!(
                    parent = parent.metadata.name.as_str(),
                    child = child.job.as_str(),
                    "Follow-on not eligible for this change set"
                );
                continue;
            }
            info!(
                parent = parent.metadata.name.as_str(),
                child = child.job.as_str(),
                "Materializing follow-on job"
            );
            self.orchestrator
                .create_job(CiJob::from_spec(child.clone()))
                .await?;
        }
        Ok(())
    }

    /// Whether a follow-on spec is eligible given the parent's change set.
    /// Only presubmit parents carry a change set to filter on.
    async fn run_after_success_can_run(
        &self,
        parent: &CiJob,
        child: &JobSpec,
        config: &Config,
    ) -> Result<bool, SyncError> {
        if parent.spec.r#type != JobType::Presubmit {
            return Ok(true);
        }
        let Some(refs) = &parent.spec.refs else {
            return Ok(true);
        };
        let Some(pull) = refs.pulls.first() else {
            return Ok(true);
        };
        let Some(presubmit) = config.presubmit(&refs.org, &refs.repo, &child.job) else {
            // The catalog moved on since the parent was created; run it.
            return Ok(true);
        };
        let Some(pattern) = presubmit.run_if_changed_regex() else {
            return Ok(true);
        };
        let changes = self
            .forge
            .get_pull_request_changes(&refs.org, &refs.repo, pull.number)
            .await?;
        Ok(changes.iter().any(|c| pattern.is_match(&c.filename)))
    }

    /// Decide whether a Triggered job may start a pod now and, if so, claim
    /// a pending slot for its identity. The stricter of the global and
    /// per-job caps wins. The claim happens under the write lock, so peers
    /// reconciling in parallel observe it before their own check.
    async fn try_admit(&self, config: &Config, job: &CiJob) -> bool {
        // Fast path: deny without contending for the write lock.
        {
            let pending = self.pending_jobs.read().await;
            if let Some(reason) = admission_denial(config, job, &pending) {
                debug!(job = job.metadata.name.as_str(), reason, "Deferring job");
                return false;
            }
        }
        let mut pending = self.pending_jobs.write().await;
        if let Some(reason) = admission_denial(config, job, &pending) {
            debug!(job = job.metadata.name.as_str(), reason, "Deferring job");
            return false;
        }
        *pending.entry(job.spec.job.clone()).or_insert(0) += 1;
        true
    }

    async fn increment_pending(&self, job_identity: &str) {
        let mut pending = self.pending_jobs.write().await;
        *pending.entry(job_identity.to_owned()).or_insert(0) += 1;
    }

    fn refresh_url(&self, config: &Config, job: &mut CiJob) {
        match render_job_url(&config.job_url_template, job) {
            Ok(url) => job.status.url = url,
            // Load-time validation makes this unreachable for well-formed
            // configs; a record that still trips it is unrunnable.
            Err(err) => {
                error!(job = job.metadata.name.as_str(), %err, "URL template failed");
                job.status.state = JobState::Error;
                job.set_complete(utils::now());
                job.status.description = format!("URL template failed: {err}");
            }
        }
    }
}

fn admission_denial(
    config: &Config,
    job: &CiJob,
    pending: &BTreeMap<String, u32>,
) -> Option<&'static str> {
    if config.max_concurrency > 0 {
        let total: u32 = pending.values().sum();
        if total >= config.max_concurrency {
            return Some("global concurrency cap reached");
        }
    }
    if job.spec.max_concurrency > 0 {
        let current = pending.get(&job.spec.job).copied().unwrap_or(0);
        if current >= job.spec.max_concurrency {
            return Some("job concurrency cap reached");
        }
    }
    None
}

/// A job is report-worthy iff an externally visible status field changed
/// during its reconcile.
fn status_changed(before: &JobStatus, after: &JobStatus) -> bool {
    before.state != after.state
        || before.url != after.url
        || before.pod_name != after.pod_name
        || before.build_id != after.build_id
        || before.description != after.description
}

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord)]
struct DupeKey {
    job: String,
    org: String,
    repo: String,
    pulls: Vec<crate::resources::Pull>,
}

impl DupeKey {
    fn of(job: &CiJob) -> Self {
        let refs = job.spec.refs.clone().unwrap_or_default();
        DupeKey {
            job: job.spec.job.clone(),
            org: refs.org,
            repo: refs.repo,
            pulls: refs.pulls,
        }
    }
}

/// Materialize the pod for a job record from its template, injecting the
/// standard environment into every container.
pub fn build_pod(job: &CiJob, build_id: &str) -> Pod {
    let template = &job.spec.pod_template;
    let mut labels = template.metadata.labels.clone();
    labels.insert(CREATED_BY_LABEL.to_owned(), "true".to_owned());
    labels.insert(JOB_NAME_LABEL.to_owned(), job.spec.job.clone());
    labels.insert(JOB_TYPE_LABEL.to_owned(), job.spec.r#type.to_string());

    let mut spec = template.spec.clone();
    for container in &mut spec.containers {
        inject_env(container, job, build_id);
    }

    Pod {
        metadata: Metadata {
            name: job.metadata.name.clone(),
            labels,
            resource_version: String::new(),
        },
        spec,
        status: PodStatus::default(),
    }
}

fn inject_env(container: &mut Container, job: &CiJob, build_id: &str) {
    let mut vars = vec![
        (JOB_NAME_ENV, job.spec.job.clone()),
        (JOB_TYPE_ENV, job.spec.r#type.to_string()),
        (BUILD_ID_ENV, build_id.to_owned()),
        (BUILD_NUMBER_ENV, build_id.to_owned()),
    ];
    if let Some(refs) = &job.spec.refs {
        vars.push((REPO_OWNER_ENV, refs.org.clone()));
        vars.push((REPO_NAME_ENV, refs.repo.clone()));
        vars.push((PULL_BASE_REF_ENV, refs.base_ref.clone()));
        vars.push((PULL_BASE_SHA_ENV, refs.base_sha.clone()));
        vars.push((PULL_REFS_ENV, refs.as_pull_refs()));
        if let Some(pull) = refs.pulls.first() {
            vars.push((PULL_NUMBER_ENV, pull.number.to_string()));
            vars.push((PULL_PULL_SHA_ENV, pull.sha.clone()));
        }
    }
    for (name, value) in vars {
        set_env(container, name, value);
    }
}

fn set_env(container: &mut Container, name: &str, value: String) {
    if let Some(existing) = container.env.iter_mut().find(|e| e.name == name) {
        existing.value = value;
    } else {
        container.env.push(EnvVar {
            name: name.to_owned(),
            value,
        });
    }
}

/// Recover the build ID of an adopted pod from its injected environment.
fn pod_build_id(pod: &Pod) -> String {
    pod.spec
        .containers
        .iter()
        .flat_map(|c| c.env.iter())
        .find(|e| e.name == BUILD_ID_ENV)
        .map(|e| e.value.clone())
        .unwrap_or_default()
}
