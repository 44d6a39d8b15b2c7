use std::{fmt, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use url::Url;

/// Branch to sync when a provider does not report a default branch.
pub const DEFAULT_BRANCH: &str = "main";

/// The (provider, organization, name) triple uniquely naming a repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoId {
    pub provider: String,
    pub organization: String,
    pub name: String,
}

impl RepoId {
    pub fn new(
        provider: impl Into<String>,
        organization: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self { provider: provider.into(), organization: organization.into(), name: name.into() }
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.provider, self.organization, self.name)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    #[default]
    Private,
    Internal,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Private => "private",
            Self::Internal => "internal",
        }
    }
}

impl FromStr for Visibility {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(Self::Public),
            "private" => Ok(Self::Private),
            "internal" => Ok(Self::Internal),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// A repository as discovered from a provider. Immutable once discovered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryDescriptor {
    #[serde(flatten)]
    pub id: RepoId,
    pub clone_url: Url,
    pub default_branch: Option<String>,
    pub visibility: Visibility,
}

impl RepositoryDescriptor {
    pub fn branch(&self) -> &str { self.default_branch.as_deref().unwrap_or(DEFAULT_BRANCH) }
}

/// The local checkout of a repository's default branch, owned by the cache.
#[derive(Debug, Clone)]
pub struct WorkingCopy {
    pub descriptor: RepositoryDescriptor,
    pub local_path: PathBuf,
    pub revision: String,
    pub last_synced_at: OffsetDateTime,
}

/// The payload describing one repository's state at one revision.
///
/// Retries of a unit bump `attempt` but never change the
/// (identity, revision) pair the remote dedupes on.
#[derive(Debug, Clone)]
pub struct SubmissionUnit {
    pub descriptor: RepositoryDescriptor,
    pub revision: String,
    pub payload: serde_json::Value,
    pub attempt: u32,
}

impl SubmissionUnit {
    pub fn from_working_copy(copy: &WorkingCopy) -> Self {
        let payload = serde_json::json!({
            "cloneUrl": copy.descriptor.clone_url,
            "branch": copy.descriptor.branch(),
            "revision": copy.revision,
            "visibility": copy.descriptor.visibility,
        });
        Self {
            descriptor: copy.descriptor.clone(),
            revision: copy.revision.clone(),
            payload,
            attempt: 0,
        }
    }
}
