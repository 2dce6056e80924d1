//! Build identification carried into logs and the health endpoint.

use serde::Serialize;

/// Version and source control identity of the running binary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuildInfo {
    pub version: String,
    pub git_branch: String,
    pub git_commit: String,
}

impl BuildInfo {
    pub fn new(
        version: impl Into<String>,
        git_branch: impl Into<String>,
        git_commit: impl Into<String>,
    ) -> Self {
        Self {
            version: version.into(),
            git_branch: git_branch.into(),
            git_commit: git_commit.into(),
        }
    }

    /// Read from variables set at compile time. `GIT_BRANCH` and
    /// `GIT_COMMIT` are optional and fall back to `"unknown"`.
    pub fn from_env() -> Self {
        Self::new(
            env!("CARGO_PKG_VERSION"),
            option_env!("GIT_BRANCH").unwrap_or("unknown"),
            option_env!("GIT_COMMIT").unwrap_or("unknown"),
        )
    }
}
