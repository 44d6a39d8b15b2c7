use std::sync::OnceLock;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use mod_connect_core::models::{RepoId, RepositoryDescriptor, Visibility};
use regex::Regex;
use url::Url;

use crate::{PageToken, ProviderError, RepoPage, SourceProvider};

/// A repository list supplied directly (parsed from a CSV file) instead of
/// discovered from a vendor API. Rows marked skip surface as skipped
/// repositories and are neither cloned nor submitted.
pub struct StaticSource {
    provider: String,
    host: String,
    entries: Vec<StaticEntry>,
}

#[derive(Debug, Clone)]
pub struct StaticEntry {
    pub descriptor: RepositoryDescriptor,
    pub skip_reason: Option<String>,
}

impl StaticSource {
    /// Parse the repository CSV. Schema per row:
    ///
    /// `repoName[,branch[,style[,buildArgs[,skip[,skipReason]]]]]`
    ///
    /// `repoName` is `organization/repository`. The style and build-args
    /// columns are accepted for compatibility and ignored. A missing branch
    /// falls back to `default_branch`.
    pub fn from_csv(
        provider: &str,
        scm_base: &Url,
        default_branch: &str,
        contents: &str,
    ) -> Result<Self> {
        let host = scm_base
            .host_str()
            .with_context(|| format!("SCM base URL '{scm_base}' has no host"))?
            .to_string();
        let mut entries = Vec::new();
        for (line_no, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || (line_no == 0 && line.starts_with("repoName")) {
                continue;
            }
            let entry = parse_row(provider, scm_base, default_branch, line)
                .with_context(|| format!("Invalid repository CSV row {}", line_no + 1))?;
            entries.push(entry);
        }
        Ok(Self { provider: provider.to_string(), host, entries })
    }

    pub fn len(&self) -> usize { self.entries.len() }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
}

fn repo_name_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"^(?P<org>[A-Za-z0-9_.\-]+)/(?P<name>[A-Za-z0-9_.\-]+)$").unwrap()
    })
}

fn parse_row(
    provider: &str,
    scm_base: &Url,
    default_branch: &str,
    line: &str,
) -> Result<StaticEntry> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    let Some(caps) = repo_name_regex().captures(fields[0]) else {
        bail!("expected organization/repository, got '{}'", fields[0]);
    };
    let organization = &caps["org"];
    let name = &caps["name"];
    let branch = fields.get(1).filter(|b| !b.is_empty()).copied().unwrap_or(default_branch);
    let skip = fields.get(4).is_some_and(|v| v.eq_ignore_ascii_case("true"));
    let skip_reason = skip.then(|| {
        fields
            .get(5)
            .filter(|r| !r.is_empty())
            .map(|r| r.to_string())
            .unwrap_or_else(|| "marked skip in repository CSV".to_string())
    });
    let clone_url = format!(
        "{}/{}/{}.git",
        scm_base.as_str().trim_end_matches('/'),
        organization,
        name
    )
    .parse()
    .with_context(|| format!("cannot build clone URL for '{}'", fields[0]))?;
    Ok(StaticEntry {
        descriptor: RepositoryDescriptor {
            id: RepoId::new(provider, organization, name),
            clone_url,
            default_branch: Some(branch.to_string()),
            visibility: Visibility::Private,
        },
        skip_reason,
    })
}

#[async_trait]
impl SourceProvider for StaticSource {
    fn name(&self) -> &str { &self.provider }

    fn host(&self) -> &str { &self.host }

    async fn list_page(
        &self,
        _organization: &str,
        _token: Option<&PageToken>,
    ) -> Result<RepoPage, ProviderError> {
        let mut page = RepoPage::default();
        for entry in &self.entries {
            match &entry.skip_reason {
                Some(reason) => page.skipped.push((entry.descriptor.clone(), reason.clone())),
                None => page.repositories.push(entry.descriptor.clone()),
            }
        }
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url { "https://github.com".parse().unwrap() }

    #[tokio::test]
    async fn parses_rows_and_skips() {
        let csv = "\
repoName,repoBranch,desiredStyle,additionalBuildArgs,skip,skipReason
openrewrite/rewrite,main,,,false,
openrewrite/rewrite-spring,,,,true,does not build
moderneinc/mod-connect
";
        let source = StaticSource::from_csv("github", &base(), "main", csv).unwrap();
        assert_eq!(source.len(), 3);

        let page = source.list_page("", None).await.unwrap();
        assert!(page.next.is_none());
        assert_eq!(page.repositories.len(), 2);
        assert_eq!(page.skipped.len(), 1);

        let first = &page.repositories[0];
        assert_eq!(first.id, RepoId::new("github", "openrewrite", "rewrite"));
        assert_eq!(first.clone_url.as_str(), "https://github.com/openrewrite/rewrite.git");
        assert_eq!(first.default_branch.as_deref(), Some("main"));

        let (skipped, reason) = &page.skipped[0];
        assert_eq!(skipped.id.name, "rewrite-spring");
        assert_eq!(reason, "does not build");
    }

    #[test]
    fn rejects_malformed_repo_names() {
        for row in ["not-a-repo", "a/b/c", "org/ name with space"] {
            let csv = format!("{row},main");
            assert!(
                StaticSource::from_csv("github", &base(), "main", &csv).is_err(),
                "row '{row}' should be rejected"
            );
        }
    }

    #[test]
    fn skip_without_reason_gets_default() {
        let csv = "org/repo,,,,true";
        let source = StaticSource::from_csv("github", &base(), "main", csv).unwrap();
        let entry = &source.entries[0];
        assert_eq!(entry.skip_reason.as_deref(), Some("marked skip in repository CSV"));
    }
}
