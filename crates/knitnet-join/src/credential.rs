//! Broker credentials for a joining cluster
//!
//! The broker issues a service-account token per member cluster. The token
//! controller fills the secret asynchronously, so the join workflow polls
//! for it under a bounded backoff instead of failing on the first miss.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, ListParams};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use knitnet_common::retry::{wait_with_backoff, Backoff};
use knitnet_common::Result;

/// Annotation linking a token secret to its service account
pub const SERVICE_ACCOUNT_ANNOTATION: &str = "kubernetes.io/service-account.name";
/// Secret type carrying service-account tokens
pub const SERVICE_ACCOUNT_TOKEN_TYPE: &str = "kubernetes.io/service-account-token";

/// Identity under which the broker knows a cluster
pub fn cluster_identity(cluster_id: &str) -> String {
    format!("cluster-{cluster_id}")
}

/// A broker access token and the CA that signs the broker endpoint
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    /// Identity the token was issued for
    pub identity: String,
    /// Bearer token
    pub token: String,
    /// PEM bundle of the broker CA
    pub ca: Vec<u8>,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("identity", &self.identity)
            .field("token", &"<redacted>")
            .field("ca_bytes", &self.ca.len())
            .finish()
    }
}

/// Where credentials come from
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// The credential for `identity`, `None` while it is not issued yet
    async fn fetch(&self, identity: &str) -> Result<Option<Credential>>;
}

/// Reads service-account token secrets from the broker namespace.
///
/// Nothing here issues credentials. The broker administrator (the
/// `subctl`/broker tooling that onboards member clusters) must create the
/// `cluster-<clusterID>` ServiceAccount in the broker namespace; the
/// Kubernetes token controller then fills its
/// `kubernetes.io/service-account-token` secret. Until both exist the join
/// waits and finally times out.
#[derive(Clone)]
pub struct SecretCredentialSource {
    api: Api<Secret>,
}

impl SecretCredentialSource {
    /// Source over `namespace` on the broker cluster
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl CredentialSource for SecretCredentialSource {
    async fn fetch(&self, identity: &str) -> Result<Option<Credential>> {
        let params = ListParams::default().fields(&format!("type={SERVICE_ACCOUNT_TOKEN_TYPE}"));
        let secrets = self.api.list(&params).await?;

        Ok(secrets
            .items
            .iter()
            .filter(|s| issued_to(s, identity))
            .find_map(|s| credential_from_secret(identity, s)))
    }
}

/// True if the token secret belongs to the service account `identity`
pub fn issued_to(secret: &Secret, identity: &str) -> bool {
    secret
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(SERVICE_ACCOUNT_ANNOTATION))
        .is_some_and(|sa| sa == identity)
}

/// Extract `token` and `ca.crt`; `None` until the token controller fills them
pub fn credential_from_secret(identity: &str, secret: &Secret) -> Option<Credential> {
    let data = secret.data.as_ref()?;
    let token = String::from_utf8(data.get("token")?.0.clone()).ok()?;
    if token.is_empty() {
        return None;
    }
    let ca = data.get("ca.crt").map(|b| b.0.clone()).unwrap_or_default();
    Some(Credential {
        identity: identity.to_string(),
        token,
        ca,
    })
}

/// Poll `source` until the credential for `identity` exists.
///
/// A missing object counts as "not yet"; any other error ends the wait.
/// Running out of backoff steps fails with a timeout.
pub async fn wait_for_credential(
    source: &dyn CredentialSource,
    identity: &str,
    backoff: &Backoff,
) -> Result<Credential> {
    let operation = format!("credential for {identity}");
    wait_with_backoff(backoff, &operation, move || async move {
        match source.fetch(identity).await {
            Ok(found) => Ok(found),
            Err(e) if e.is_not_found() => {
                debug!(identity, "Credential not issued yet");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    })
    .await
}
