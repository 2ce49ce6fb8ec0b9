use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

use crate::resources::CiJob;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid run_if_changed pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("job url template is empty")]
    MissingTemplate,
    #[error("job url template references unknown field {0:?}")]
    UnknownField(String),
    #[error("job url template has a malformed placeholder")]
    MalformedPlaceholder,
}

/// Options the controller consumes. Loaded from a YAML file and validated up
/// front: template and pattern problems are fatal here rather than surfacing
/// mid-tick.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    // Template for `status.url`, rendered against the job record after its
    // provisional status fields are set. `{{name}}`, `{{state}}`, etc.
    #[serde(default)]
    pub job_url_template: String,

    // Global cap on pending jobs across all identities. Zero means unlimited.
    #[serde(default)]
    pub max_concurrency: u32,

    // Bound on the per-tick reconcile fan-out. Defaults to the CPU count.
    #[serde(default)]
    pub sync_workers: Option<usize>,

    // Presubmit catalog keyed by "org/repo", consulted only to resolve
    // run_if_changed for follow-on eligibility.
    #[serde(default)]
    pub presubmits: BTreeMap<String, Vec<Presubmit>>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Presubmit {
    pub name: String,

    // Regex over changed filenames. When set, a follow-on of this name only
    // runs if at least one file in the parent's change set matches.
    #[serde(default)]
    pub run_if_changed: Option<String>,

    #[serde(skip)]
    run_if_changed_regex: Option<Regex>,
}

impl Presubmit {
    pub fn new(name: impl Into<String>, run_if_changed: Option<&str>) -> Result<Self, ConfigError> {
        let mut p = Presubmit {
            name: name.into(),
            run_if_changed: run_if_changed.map(str::to_owned),
            run_if_changed_regex: None,
        };
        p.compile()?;
        Ok(p)
    }

    fn compile(&mut self) -> Result<(), ConfigError> {
        if let Some(pattern) = &self.run_if_changed {
            self.run_if_changed_regex = Some(Regex::new(pattern)?);
        }
        Ok(())
    }

    pub fn run_if_changed_regex(&self) -> Option<&Regex> {
        self.run_if_changed_regex.as_ref()
    }
}

impl Config {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let mut config: Config = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&mut self) -> Result<(), ConfigError> {
        if self.job_url_template.is_empty() {
            return Err(ConfigError::MissingTemplate);
        }
        // Probe render so template problems fail at load time.
        render_job_url(&self.job_url_template, &CiJob::default())?;
        for entries in self.presubmits.values_mut() {
            for presubmit in entries {
                presubmit.compile()?;
            }
        }
        Ok(())
    }

    pub fn presubmit(&self, org: &str, repo: &str, job: &str) -> Option<&Presubmit> {
        self.presubmits
            .get(&format!("{org}/{repo}"))?
            .iter()
            .find(|p| p.name == job)
    }

    pub fn sync_workers(&self) -> usize {
        self.sync_workers.unwrap_or_else(num_cpus::get)
    }
}

/// Substitute `{{key}}` placeholders in the URL template with fields of the
/// job record.
pub fn render_job_url(template: &str, job: &CiJob) -> Result<String, ConfigError> {
    let placeholder = Regex::new(r"\{\{\s*([A-Za-z_]+)\s*\}\}")?;
    let mut unknown = None;
    let rendered = placeholder.replace_all(template, |caps: &regex::Captures| {
        match lookup_field(&caps[1], job) {
            Some(value) => value,
            None => {
                unknown.get_or_insert_with(|| caps[1].to_owned());
                String::new()
            }
        }
    });
    if let Some(key) = unknown {
        return Err(ConfigError::UnknownField(key));
    }
    if rendered.contains("{{") || rendered.contains("}}") {
        return Err(ConfigError::MalformedPlaceholder);
    }
    Ok(rendered.into_owned())
}

fn lookup_field(key: &str, job: &CiJob) -> Option<String> {
    match key {
        "name" => Some(job.metadata.name.clone()),
        "job" => Some(job.spec.job.clone()),
        "type" => Some(job.spec.r#type.to_string()),
        "state" => Some(job.status.state.to_string()),
        "pod" => Some(job.status.pod_name.clone()),
        "build" => Some(job.status.build_id.clone()),
        "org" => Some(
            job.spec
                .refs
                .as_ref()
                .map(|r| r.org.clone())
                .unwrap_or_default(),
        ),
        "repo" => Some(
            job.spec
                .refs
                .as_ref()
                .map(|r| r.repo.clone())
                .unwrap_or_default(),
        ),
        _ => None,
    }
}
