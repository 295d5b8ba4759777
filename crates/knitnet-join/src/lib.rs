//! Joining a cluster to a broker domain
//!
//! [`JoinOrchestrator`] discovers the cluster network, resolves the ranges
//! to use, checks preconditions, commits a global block when global
//! addressing is on, waits for the broker credential and registers the
//! cluster. Collaborators sit behind traits so each step can be exercised
//! against fakes.

#![deny(missing_docs)]

pub mod credential;
pub mod orchestrator;
pub mod registration;
pub mod request;
pub mod requirements;

pub use credential::{cluster_identity, Credential, CredentialSource, SecretCredentialSource};
pub use orchestrator::{JoinOrchestrator, JoinOrchestratorBuilder, JoinOutcome, JoinPhase};
pub use registration::{Registrar, SubmarinerRegistrar};
pub use request::{JoinRequest, ResolvedCidr, ResolvedNetworkConfig};
pub use requirements::{KubeRequirementsChecker, RequirementsChecker};
