//! Version and capability preconditions of the joining cluster

use async_trait::async_trait;
use kube::Client;
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use knitnet_common::{Error, Result};

/// Oldest Kubernetes release the join workflow supports
pub const MIN_KUBERNETES_VERSION: (u32, u32) = (1, 15);

/// Checks whether a cluster can be joined
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RequirementsChecker: Send + Sync {
    /// Every unmet requirement; empty when the cluster qualifies
    async fn check(&self) -> Result<Vec<String>>;
}

/// [`RequirementsChecker`] that asks the API server for its version
#[derive(Clone)]
pub struct KubeRequirementsChecker {
    client: Client,
}

impl KubeRequirementsChecker {
    /// Checker for the cluster `client` points at
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RequirementsChecker for KubeRequirementsChecker {
    async fn check(&self) -> Result<Vec<String>> {
        let info = self.client.apiserver_version().await?;
        debug!(major = %info.major, minor = %info.minor, git_version = %info.git_version, "API server version");
        Ok(check_version(&info.major, &info.minor).into_iter().collect())
    }
}

/// Compare a reported `major`/`minor` pair against [`MIN_KUBERNETES_VERSION`].
///
/// Vendor builds report minors like `"21+"`; the suffix is ignored.
pub fn check_version(major: &str, minor: &str) -> Option<String> {
    let parse = |s: &str| s.trim().trim_end_matches('+').parse::<u32>().ok();
    let (min_major, min_minor) = MIN_KUBERNETES_VERSION;

    match (parse(major), parse(minor)) {
        (Some(ma), Some(mi)) if (ma, mi) >= (min_major, min_minor) => None,
        (Some(ma), Some(mi)) => Some(format!(
            "Kubernetes {ma}.{mi} is older than the minimum supported {min_major}.{min_minor}"
        )),
        _ => Some(format!("unrecognised Kubernetes version {major:?}.{minor:?}")),
    }
}

/// Turn a list of unmet requirements into an error
pub fn ensure_met(unmet: Vec<String>) -> Result<()> {
    if unmet.is_empty() {
        Ok(())
    } else {
        Err(Error::Requirements {
            message: unmet.join("; "),
        })
    }
}
