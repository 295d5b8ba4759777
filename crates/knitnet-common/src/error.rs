//! Error types for the knitnet operator
//!
//! Errors are structured with fields so that the observability channel can
//! report exactly which probe, which CIDR or which ledger write failed.
//! Every component returns these up to the join orchestrator, which decides
//! whether the current attempt ends in `Failed`.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for knitnet operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// User-supplied value is syntactically invalid (CIDR, cluster ID, block size)
    #[error("malformed {field}: {message}")]
    MalformedInput {
        /// Which input was rejected (e.g. "clusterID", "globalnetCIDR")
        field: String,
        /// Description of what's invalid
        message: String,
    },

    /// A required object does not exist
    #[error("{kind} {name} not found")]
    NotFound {
        /// Kind of the missing object (e.g. "ConfigMap", "Credential")
        kind: String,
        /// Name of the missing object
        name: String,
    },

    /// Requested block collides with another cluster's assignment
    #[error("global CIDR {requested} overlaps {existing} assigned to cluster {cluster}")]
    Overlap {
        /// The block that was requested
        requested: String,
        /// The block it collides with
        existing: String,
        /// Owner of the colliding block
        cluster: String,
    },

    /// Requested block is not contained in the supernet
    #[error("global CIDR {requested} is not contained in supernet {supernet}")]
    OutOfBounds {
        /// The block that was requested
        requested: String,
        /// The supernet it must fit in
        supernet: String,
    },

    /// No free block of the requested size remains
    #[error("no free block of {block_size} addresses left in supernet {supernet}")]
    ExhaustedSpace {
        /// The exhausted supernet
        supernet: String,
        /// Block size that could not be placed
        block_size: u64,
    },

    /// Conditional write rejected because the object changed since it was read
    #[error("conflicting concurrent update of {resource}")]
    Conflict {
        /// The object whose version was stale
        resource: String,
    },

    /// Conditional writes kept conflicting until the retry budget ran out
    #[error("gave up updating {resource} after {attempts} conflicting attempts")]
    ConflictRetriesExhausted {
        /// The contended object
        resource: String,
        /// How many read-decide-write rounds were made
        attempts: u32,
    },

    /// A bounded wait loop ran out of steps
    #[error("timed out waiting for {operation} after {attempts} attempts")]
    Timeout {
        /// What was being waited on
        operation: String,
        /// Number of polls made before giving up
        attempts: u32,
    },

    /// Neither an explicit value nor discovery produced a CIDR
    #[error("no {kind} CIDR was discovered and none was configured")]
    NoCidrFound {
        /// "service" or "cluster"
        kind: String,
    },

    /// Target cluster fails version or capability preconditions
    #[error("cluster requirements not met: {message}")]
    Requirements {
        /// Every unmet requirement, joined
        message: String,
    },

    /// A network probe failed talking to the cluster
    #[error("network discovery failed in probe {probe}: {message}")]
    Discovery {
        /// Probe that was running
        probe: String,
        /// Underlying failure
        message: String,
    },

    /// Downstream registration rejected the resolved configuration
    #[error("registration of cluster {cluster} failed: {message}")]
    Registration {
        /// Cluster being registered
        cluster: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g. "reconciler", "create_client")
        context: String,
    },
}

impl Error {
    /// Create a malformed-input error for the named field
    pub fn malformed(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::MalformedInput {
            field: field.into(),
            message: msg.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a conflict error for a stale conditional write
    pub fn conflict(resource: impl Into<String>) -> Self {
        Self::Conflict {
            resource: resource.into(),
        }
    }

    /// Wrap a failure raised while a discovery probe was running
    pub fn discovery(probe: impl Into<String>, msg: impl std::fmt::Display) -> Self {
        Self::Discovery {
            probe: probe.into(),
            message: msg.to_string(),
        }
    }

    /// Create a registration error for a cluster
    pub fn registration(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Registration {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// True for the stale-version signal of a conditional write
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 409,
            _ => false,
        }
    }

    /// True when the object being looked up does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            _ => false,
        }
    }

    /// Check if this error is retryable
    ///
    /// Everything in the allocation taxonomy requires a configuration change
    /// or a fresh attempt. Conflicts and transport failures are transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // Don't retry on 4xx errors other than conflicts
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409
                )
            }
            Error::Conflict { .. } => true,
            Error::Internal { .. } => true,
            Error::MalformedInput { .. }
            | Error::NotFound { .. }
            | Error::Overlap { .. }
            | Error::OutOfBounds { .. }
            | Error::ExhaustedSpace { .. }
            | Error::ConflictRetriesExhausted { .. }
            | Error::Timeout { .. }
            | Error::NoCidrFound { .. }
            | Error::Requirements { .. }
            | Error::Discovery { .. }
            | Error::Registration { .. }
            | Error::Serialization { .. } => false,
        }
    }

    /// Short machine-readable name of the failure class, used as event reason suffix
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Kube { .. } => "Kubernetes",
            Error::MalformedInput { .. } => "MalformedInput",
            Error::NotFound { .. } => "NotFound",
            Error::Overlap { .. } => "Overlap",
            Error::OutOfBounds { .. } => "OutOfBounds",
            Error::ExhaustedSpace { .. } => "ExhaustedSpace",
            Error::Conflict { .. } => "Conflict",
            Error::ConflictRetriesExhausted { .. } => "ConflictRetriesExhausted",
            Error::Timeout { .. } => "Timeout",
            Error::NoCidrFound { .. } => "NoCIDRFound",
            Error::Requirements { .. } => "Requirements",
            Error::Discovery { .. } => "Discovery",
            Error::Registration { .. } => "Registration",
            Error::Serialization { .. } => "Serialization",
            Error::Internal { .. } => "Internal",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}
