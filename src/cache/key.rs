//! Cache addressing: repository kinds and the tuple that names one cached
//! upstream file at an immutable commit.

use std::fmt;

// ---------------------------------------------------------------------------
// RepoType
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepoType {
    Model,
    Dataset,
    Space,
}

impl RepoType {
    /// Parse the plural path segment used in hub URLs (`models`, `datasets`,
    /// `spaces`).
    pub fn from_plural(segment: &str) -> Option<Self> {
        match segment {
            "models" => Some(RepoType::Model),
            "datasets" => Some(RepoType::Dataset),
            "spaces" => Some(RepoType::Space),
            _ => None,
        }
    }

    /// Plural form as it appears in hub URLs and on-disk layout.
    pub fn plural(&self) -> &'static str {
        match self {
            RepoType::Model => "models",
            RepoType::Dataset => "datasets",
            RepoType::Space => "spaces",
        }
    }

    /// Upstream resolve URLs omit the `models/` prefix for models.
    pub fn url_prefix(&self) -> &'static str {
        match self {
            RepoType::Model => "",
            RepoType::Dataset => "datasets/",
            RepoType::Space => "spaces/",
        }
    }
}

impl fmt::Display for RepoType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.plural())
    }
}

// ---------------------------------------------------------------------------
// CacheKey
// ---------------------------------------------------------------------------

/// Identity of one cached file: always keyed on the resolved commit hash,
/// never on a mutable branch or tag name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub repo_type: RepoType,
    pub org: String,
    pub name: String,
    pub commit: String,
    pub path: String,
}

impl CacheKey {
    pub fn new(
        repo_type: RepoType,
        org: impl Into<String>,
        name: impl Into<String>,
        commit: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            repo_type,
            org: org.into(),
            name: name.into(),
            commit: commit.into(),
            path: path.into(),
        }
    }

    /// `org/name` slug used for policy checks and logs.
    pub fn repo_slug(&self) -> String {
        format!("{}/{}", self.org, self.name)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}@{}:{}",
            self.repo_type, self.org, self.name, self.commit, self.path
        )
    }
}

/// A revision is a commit hash when it is exactly 40 lowercase hex digits.
/// Uppercase is rejected: the hub emits lowercase hashes, and cache paths
/// are keyed on the exact string.
pub fn is_commit_hash(revision: &str) -> bool {
    revision.len() == 40
        && revision
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}
