//! Common types for knitnet: the `Knitnet` CRD, errors, retry and telemetry

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace the operator and the registration payload live in
pub const OPERATOR_NAMESPACE: &str = "submariner-operator";

/// Default namespace of the broker domain on the broker cluster
pub const BROKER_NAMESPACE: &str = "submariner-k8s-broker";

/// Field manager for server-side apply and status patches
pub const FIELD_MANAGER: &str = "knitnet-controller";

/// Default supernet subdivided among clusters for global addressing
pub const DEFAULT_GLOBALNET_CIDR_RANGE: &str = "242.0.0.0/8";

/// Default number of global addresses per cluster
pub const DEFAULT_GLOBALNET_CLUSTER_SIZE: u64 = 65536;
