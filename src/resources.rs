use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Display;

use crate::utils;

// Label carried by every pod started by the controller.
pub const CREATED_BY_LABEL: &str = "created-by-gaffer";
// Labels tying pods and materialized jobs back to their job identity.
pub const JOB_NAME_LABEL: &str = "gaffer.dev/job";
pub const JOB_TYPE_LABEL: &str = "gaffer.dev/type";

pub trait Meta {
    fn metadata(&self) -> &Metadata;
    fn metadata_mut(&mut self) -> &mut Metadata;
}

macro_rules! impl_meta {
    ($r:ident) => {
        impl Meta for $r {
            fn metadata(&self) -> &Metadata {
                &self.metadata
            }
            fn metadata_mut(&mut self) -> &mut Metadata {
                &mut self.metadata
            }
        }
    };
}

impl_meta!(CiJob);
impl_meta!(Pod);

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    // Name must be unique across all records of a kind. It is the only record
    // identity the controller relies on; the pod started for a job reuses it.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    // An opaque value used for optimistic concurrency: replacing a record
    // whose resource version has moved on yields a conflict error.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_version: String,
}

/// The durable declaration of a unit of CI work, stored in the orchestrator.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CiJob {
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub spec: JobSpec,
    #[serde(default)]
    pub status: JobStatus,
}

impl CiJob {
    /// A job is complete iff its completion time is set. Complete jobs are
    /// terminal: the controller never touches them again.
    pub fn complete(&self) -> bool {
        self.status.completion_time.is_some()
    }

    pub fn set_complete(&mut self, at: Time) {
        self.status.completion_time = Some(at);
    }

    /// Materialize a fresh Triggered record from a spec, assigning a unique
    /// name and identity labels.
    pub fn from_spec(spec: JobSpec) -> CiJob {
        let mut labels = BTreeMap::new();
        labels.insert(JOB_NAME_LABEL.to_owned(), spec.job.clone());
        labels.insert(JOB_TYPE_LABEL.to_owned(), spec.r#type.to_string());
        CiJob {
            metadata: Metadata {
                name: utils::new_uid(),
                labels,
                resource_version: String::new(),
            },
            spec,
            status: JobStatus {
                state: JobState::Triggered,
                start_time: Some(utils::now()),
                description: "Job created.".to_owned(),
                ..Default::default()
            },
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    // The job identity. Many records may share it over time; concurrency
    // limits are accounted against it.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub job: String,

    #[serde(default)]
    pub r#type: JobType,

    // Maximum number of records of this identity allowed in Pending at once.
    // Zero means unlimited.
    #[serde(default, skip_serializing_if = "u32_is_zero")]
    pub max_concurrency: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refs: Option<Refs>,

    #[serde(default)]
    pub pod_template: PodTemplateSpec,

    // Child specs to materialize as new Triggered records once this job
    // transitions to Success. Children may carry their own children; the
    // embedding makes the graph a DAG by construction.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub run_after_success: Vec<JobSpec>,
}

fn u32_is_zero(val: &u32) -> bool {
    *val == 0
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    // Runs on a schedule, with no change set attached.
    #[default]
    Periodic,
    // Runs against a proposed change set (refs carry the pulls under test).
    Presubmit,
    // Runs against a branch head after merge.
    Postsubmit,
    // Runs against a batch of pulls merged together.
    Batch,
}

impl Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobType::Periodic => f.write_str("periodic"),
            JobType::Presubmit => f.write_str("presubmit"),
            JobType::Postsubmit => f.write_str("postsubmit"),
            JobType::Batch => f.write_str("batch"),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Refs {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub org: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repo: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub base_ref: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub base_sha: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pulls: Vec<Pull>,
}

impl Refs {
    /// Ref string of the form `base:sha,num:sha,...`, injected into pod
    /// environments so workloads can check out the exact change set.
    pub fn as_pull_refs(&self) -> String {
        let mut s = format!("{}:{}", self.base_ref, self.base_sha);
        for pull in &self.pulls {
            s.push_str(&format!(",{}:{}", pull.number, pull.sha));
        }
        s
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pull {
    pub number: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sha: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    #[serde(default)]
    pub state: JobState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<Time>,

    // Set exactly once, when the record reaches a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<Time>,

    // Name of the pod running this job. Once set it never changes for the
    // lifetime of the record.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pod_name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub build_id: String,

    // Once set, never reverts to empty.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    // Created but not yet admitted; no pod exists.
    #[default]
    Triggered,
    // Admitted; a pod has been (or is being) started.
    Pending,
    Success,
    Failure,
    // Terminated without running to completion, e.g. superseded by a newer
    // run of the same identity.
    Aborted,
    // The orchestrator rejected the job or its pod as unprocessable.
    Error,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Success | JobState::Failure | JobState::Aborted | JobState::Error
        )
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Triggered => f.write_str("triggered"),
            JobState::Pending => f.write_str("pending"),
            JobState::Success => f.write_str("success"),
            JobState::Failure => f.write_str("failure"),
            JobState::Aborted => f.write_str("aborted"),
            JobState::Error => f.write_str("error"),
        }
    }
}

/// The orchestrator-native workload that actually executes a job.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pod {
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub spec: PodSpec,
    #[serde(default)]
    pub status: PodStatus,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub containers: Vec<Container>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<PodRestartPolicy>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodRestartPolicy {
    Never,
    OnFailure,
    Always,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvVar {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodStatus {
    #[serde(default)]
    pub phase: PodPhase,

    // Machine-readable detail on the phase, e.g. `Evicted` on a Failed pod
    // that was pushed off its node and should be restarted elsewhere.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    // Pending: the pod has been accepted but one or more containers has not
    // started. Includes time spent scheduling and pulling images.
    #[default]
    Pending,
    // Running: the pod is bound to a node and at least one container is
    // running or starting.
    Running,
    // Succeeded: all containers terminated in success and will not restart.
    Succeeded,
    // Failed: all containers terminated and at least one exited non-zero or
    // was killed by the system.
    Failed,
    // Unknown: the state of the pod could not be obtained, typically a node
    // communication failure. The pod must be restarted elsewhere.
    Unknown,
}

pub const POD_REASON_EVICTED: &str = "Evicted";

impl Pod {
    pub fn evicted(&self) -> bool {
        self.status.phase == PodPhase::Failed && self.status.reason == POD_REASON_EVICTED
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodTemplateSpec {
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub spec: PodSpec,
}

/// RFC 3339 timestamp, the wire format for all times in the data model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Time(#[serde(with = "time::serde::rfc3339")] pub time::OffsetDateTime);
