use async_trait::async_trait;
use http::StatusCode;
use mod_connect_core::{
    config::GitHubConfig,
    models::{RepoId, RepositoryDescriptor, Visibility},
};
use octocrab::{GitHubError, Octocrab};
use serde::Deserialize;
use url::Url;

use crate::{PageToken, ProviderError, RepoPage, SourceProvider, parse_page_number};

const PER_PAGE: u8 = 100;

#[derive(serde::Serialize)]
struct PageParams {
    per_page: u8,
    page: u32,
}

/// The subset of the repository entity the pipeline needs.
#[derive(Debug, Deserialize)]
struct OrgRepo {
    name: String,
    clone_url: Option<Url>,
    default_branch: Option<String>,
    private: Option<bool>,
}

pub struct GitHubProvider {
    client: Octocrab,
    host: String,
}

impl GitHubProvider {
    /// `token` is a personal access token supplied by the environment.
    pub fn new(config: &GitHubConfig, token: String) -> Result<Self, ProviderError> {
        let mut builder = Octocrab::builder().personal_token(token);
        if config.api_url != "https://api.github.com" {
            builder = builder
                .base_uri(config.api_url.as_str())
                .map_err(|e| ProviderError::Other(format!("invalid GitHub API URL: {e}")))?;
        }
        let client = builder
            .build()
            .map_err(|e| ProviderError::Other(format!("failed to create GitHub client: {e}")))?;
        let host = Url::parse(&config.api_url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_owned))
            .unwrap_or_else(|| "api.github.com".to_string());
        Ok(Self { client, host })
    }
}

#[async_trait]
impl SourceProvider for GitHubProvider {
    fn name(&self) -> &str { "github" }

    fn host(&self) -> &str { &self.host }

    async fn list_page(
        &self,
        organization: &str,
        token: Option<&PageToken>,
    ) -> Result<RepoPage, ProviderError> {
        let page = parse_page_number(token)?;
        let repos: Vec<OrgRepo> = self
            .client
            .get(
                format!("/orgs/{organization}/repos"),
                Some(&PageParams { per_page: PER_PAGE, page }),
            )
            .await
            .map_err(|e| map_error(organization, e))?;
        // The listing endpoint paginates via Link headers; a full page means
        // there may be another one, and the trailing fetch comes back empty.
        let next =
            (repos.len() == PER_PAGE as usize).then(|| PageToken((page + 1).to_string()));
        let repositories = repos
            .into_iter()
            .filter_map(|repo| descriptor_from_repo(organization, repo))
            .collect();
        Ok(RepoPage { repositories, skipped: Vec::new(), next })
    }
}

fn map_error(organization: &str, err: octocrab::Error) -> ProviderError {
    match err {
        octocrab::Error::GitHub { source, .. } => match *source {
            GitHubError { status_code: StatusCode::UNAUTHORIZED, ref message, .. } => {
                ProviderError::Auth(message.clone())
            }
            GitHubError {
                status_code: StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS,
                ..
            } => ProviderError::RateLimited,
            GitHubError { status_code: StatusCode::NOT_FOUND, .. } => {
                ProviderError::NotFound(organization.to_string())
            }
            GitHubError { status_code, ref message, .. } if status_code.is_server_error() => {
                ProviderError::Transient(format!("GitHub returned {status_code}: {message}"))
            }
            GitHubError { status_code, ref message, .. } => {
                ProviderError::Other(format!("GitHub returned {status_code}: {message}"))
            }
        },
        err => ProviderError::Transient(err.to_string()),
    }
}

fn descriptor_from_repo(organization: &str, repo: OrgRepo) -> Option<RepositoryDescriptor> {
    let Some(clone_url) = repo.clone_url else {
        tracing::warn!("Repository {}/{} has no clone URL, skipping", organization, repo.name);
        return None;
    };
    let visibility = match repo.private {
        Some(false) => Visibility::Public,
        _ => Visibility::Private,
    };
    Some(RepositoryDescriptor {
        id: RepoId::new("github", organization, repo.name),
        clone_url,
        default_branch: repo.default_branch,
        visibility,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo(value: serde_json::Value) -> OrgRepo { serde_json::from_value(value).unwrap() }

    #[test]
    fn descriptor_mapping() {
        let repo = repo(serde_json::json!({
            "name": "rewrite",
            "clone_url": "https://github.com/openrewrite/rewrite.git",
            "default_branch": "main",
            "private": false,
        }));
        let descriptor = descriptor_from_repo("openrewrite", repo).unwrap();
        assert_eq!(descriptor.id, RepoId::new("github", "openrewrite", "rewrite"));
        assert_eq!(descriptor.clone_url.as_str(), "https://github.com/openrewrite/rewrite.git");
        assert_eq!(descriptor.default_branch.as_deref(), Some("main"));
        assert_eq!(descriptor.visibility, Visibility::Public);
    }

    #[test]
    fn repo_without_clone_url_is_dropped() {
        let repo = repo(serde_json::json!({ "name": "broken" }));
        assert!(descriptor_from_repo("org", repo).is_none());
    }

    #[test]
    fn page_tokens_are_numeric() {
        assert_eq!(parse_page_number(None).unwrap(), 1);
        assert_eq!(parse_page_number(Some(&PageToken("7".into()))).unwrap(), 7);
        assert!(parse_page_number(Some(&PageToken("x".into()))).is_err());
    }
}
