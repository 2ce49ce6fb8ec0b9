use async_trait::async_trait;
use thiserror::Error;

/// Allocation failures are transient: the job that wanted the ID stays
/// Triggered and retries on a later tick.
#[derive(Debug, Error)]
pub enum BuildIdError {
    #[error("build id request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("build id allocator returned status {0}")]
    Status(reqwest::StatusCode),
    #[error("build id allocator returned a non-decimal body: {0:?}")]
    BadBody(String),
}

/// Source of monotonically allocated build numbers, one per pod started.
/// Safe for concurrent use.
#[async_trait]
pub trait BuildIdAllocator: Send + Sync {
    async fn allocate(&self, job: &str) -> Result<String, BuildIdError>;
}

/// HTTP allocator client: `GET {url}?job={job}` returns the next build
/// number for that job identity as a decimal ASCII body.
pub struct TotClient {
    url: String,
    client: reqwest::Client,
}

impl TotClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl BuildIdAllocator for TotClient {
    async fn allocate(&self, job: &str) -> Result<String, BuildIdError> {
        let resp = self
            .client
            .get(&self.url)
            .query(&[("job", job)])
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(BuildIdError::Status(resp.status()));
        }
        let body = resp.text().await?;
        let id = body.trim();
        if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
            return Err(BuildIdError::BadBody(id.to_owned()));
        }
        Ok(id.to_owned())
    }
}
