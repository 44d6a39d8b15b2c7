pub mod github;
pub mod gitlab;
pub mod static_source;

use async_trait::async_trait;
use mod_connect_core::{models::RepositoryDescriptor, retry::ErrorClass};
use thiserror::Error;

/// Opaque continuation token: whatever the vendor hands back to resume a
/// listing from the next page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageToken(pub String);

/// One page of a repository listing.
#[derive(Debug, Default)]
pub struct RepoPage {
    pub repositories: Vec<RepositoryDescriptor>,
    /// Repositories the source asks to leave alone, with the reason.
    pub skipped: Vec<(RepositoryDescriptor, String)>,
    pub next: Option<PageToken>,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Invalid or missing credentials. Fatal for the whole run.
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("rate limited by provider")]
    RateLimited,
    #[error("transient network error: {0}")]
    Transient(String),
    /// The named organization does not exist. Yields an empty sequence.
    #[error("organization not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Auth(_) => ErrorClass::Fatal,
            Self::RateLimited | Self::Transient(_) => ErrorClass::Retryable,
            Self::NotFound(_) | Self::Other(_) => ErrorClass::Terminal,
        }
    }
}

/// Capability interface over one source-control vendor. Implementations make
/// outbound calls only; no local state is mutated.
#[async_trait]
pub trait SourceProvider: Send + Sync {
    /// Short vendor name, the provider half of repository identities.
    fn name(&self) -> &str;

    /// Host the listing calls go out to, for per-host concurrency limits.
    fn host(&self) -> &str;

    /// Fetch one page of repositories in `organization`, restartable from
    /// `token`. `None` starts from the beginning.
    async fn list_page(
        &self,
        organization: &str,
        token: Option<&PageToken>,
    ) -> Result<RepoPage, ProviderError>;
}

/// Numeric page tokens used by the page-numbered vendors.
fn parse_page_number(token: Option<&PageToken>) -> Result<u32, ProviderError> {
    match token {
        None => Ok(1),
        Some(token) => token
            .0
            .parse()
            .map_err(|_| ProviderError::Other(format!("invalid page token '{}'", token.0))),
    }
}
