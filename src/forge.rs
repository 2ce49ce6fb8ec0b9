use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

/// One changed file in a pull request.
#[derive(Clone, Debug, Deserialize)]
pub struct PullChange {
    pub filename: String,
}

#[derive(Debug, Error)]
pub enum ForgeError {
    #[error("forge request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("forge returned status {0}")]
    Status(reqwest::StatusCode),
}

/// The slice of the source-forge API the controller consumes: change-set
/// listing for follow-on eligibility. Status and comment manipulation live
/// with the reporting pipeline, not here.
#[async_trait]
pub trait Forge: Send + Sync {
    async fn get_pull_request_changes(
        &self,
        org: &str,
        repo: &str,
        number: u64,
    ) -> Result<Vec<PullChange>, ForgeError>;
}

/// GitHub adapter over the REST v3 pull-request files endpoint.
pub struct GithubForge {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl GithubForge {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Forge for GithubForge {
    async fn get_pull_request_changes(
        &self,
        org: &str,
        repo: &str,
        number: u64,
    ) -> Result<Vec<PullChange>, ForgeError> {
        let url = format!(
            "{}/repos/{}/{}/pulls/{}/files",
            self.base_url, org, repo, number
        );
        let mut req = self
            .client
            .get(&url)
            .query(&[("per_page", "100")])
            .header(reqwest::header::USER_AGENT, "gaffer");
        if let Some(token) = &self.token {
            req = req.header(reqwest::header::AUTHORIZATION, format!("token {token}"));
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(ForgeError::Status(resp.status()));
        }
        Ok(resp.json().await?)
    }
}
