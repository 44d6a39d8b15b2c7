use async_trait::async_trait;
use http::{HeaderMap, StatusCode};
use mod_connect_core::{
    config::GitLabConfig,
    models::{RepoId, RepositoryDescriptor, Visibility},
};
use serde::Deserialize;
use url::Url;

use crate::{PageToken, ProviderError, RepoPage, SourceProvider, parse_page_number};

const PER_PAGE: u32 = 100;

pub struct GitLabProvider {
    client: reqwest::Client,
    base_url: Url,
    token: String,
    host: String,
}

impl GitLabProvider {
    /// `token` is a personal or group access token supplied by the
    /// environment; the minimum required grant is `read_api`.
    pub fn new(config: &GitLabConfig, token: String) -> Result<Self, ProviderError> {
        let base_url = Url::parse(config.base_url.trim_end_matches('/'))
            .map_err(|e| ProviderError::Other(format!("invalid GitLab base URL: {e}")))?;
        let host = base_url
            .host_str()
            .ok_or_else(|| ProviderError::Other("GitLab base URL has no host".to_string()))?
            .to_string();
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ProviderError::Other(format!("failed to create GitLab client: {e}")))?;
        Ok(Self { client, base_url, token, host })
    }

    fn projects_url(&self, organization: &str, page: u32) -> Result<Url, ProviderError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ProviderError::Other("GitLab base URL cannot be a base".to_string()))?
            .extend(["api", "v4", "groups", organization, "projects"]);
        url.query_pairs_mut()
            .append_pair("include_subgroups", "true")
            .append_pair("archived", "false")
            .append_pair("per_page", &PER_PAGE.to_string())
            .append_pair("page", &page.to_string());
        Ok(url)
    }
}

/// The subset of the project entity the pipeline needs.
#[derive(Debug, Deserialize)]
struct GitLabProject {
    path: String,
    path_with_namespace: String,
    http_url_to_repo: Url,
    default_branch: Option<String>,
    visibility: Option<String>,
}

#[async_trait]
impl SourceProvider for GitLabProvider {
    fn name(&self) -> &str { "gitlab" }

    fn host(&self) -> &str { &self.host }

    async fn list_page(
        &self,
        organization: &str,
        token: Option<&PageToken>,
    ) -> Result<RepoPage, ProviderError> {
        let page = parse_page_number(token)?;
        let url = self.projects_url(organization, page)?;
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| ProviderError::Transient(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, organization, &body));
        }
        let next = next_page_token(response.headers());
        let projects: Vec<GitLabProject> = response
            .json()
            .await
            .map_err(|e| ProviderError::Other(format!("failed to parse project listing: {e}")))?;
        let repositories = projects
            .into_iter()
            .map(|project| descriptor_from_project(organization, project))
            .collect();
        Ok(RepoPage { repositories, skipped: Vec::new(), next })
    }
}

fn classify_status(status: StatusCode, organization: &str, body: &str) -> ProviderError {
    match status {
        StatusCode::UNAUTHORIZED => ProviderError::Auth(body.to_string()),
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited,
        StatusCode::NOT_FOUND => ProviderError::NotFound(organization.to_string()),
        status if status.is_server_error() => {
            ProviderError::Transient(format!("GitLab returned {status}"))
        }
        status => ProviderError::Other(format!("GitLab returned {status}: {body}")),
    }
}

/// GitLab carries the continuation in the `x-next-page` header; it is empty
/// on the final page.
fn next_page_token(headers: &HeaderMap) -> Option<PageToken> {
    headers
        .get("x-next-page")
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(|value| PageToken(value.to_string()))
}

fn descriptor_from_project(organization: &str, project: GitLabProject) -> RepositoryDescriptor {
    // For subgroup projects the organization is the full namespace path, so
    // identities stay unique across subgroups.
    let namespace = project
        .path_with_namespace
        .rsplit_once('/')
        .map(|(namespace, _)| namespace.to_string())
        .unwrap_or_else(|| organization.to_string());
    let visibility = project
        .visibility
        .as_deref()
        .and_then(|v| v.parse().ok())
        .unwrap_or(Visibility::Private);
    RepositoryDescriptor {
        id: RepoId::new("gitlab", namespace, project.path),
        clone_url: project.http_url_to_repo,
        default_branch: project.default_branch,
        visibility,
    }
}
