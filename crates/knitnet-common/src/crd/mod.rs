//! Custom Resource Definitions for knitnet

mod knitnet;

pub use knitnet::{
    BrokerConfig, JoinConfig, Knitnet, KnitnetAction, KnitnetPhase, KnitnetSpec, KnitnetStatus,
};

/// Validate a cluster ID.
///
/// Rules (`^[a-z0-9][a-z0-9.-]*[a-z0-9]$`):
/// - At least two characters
/// - Lowercase letters, digits, `.` and `-` only
/// - Must start and end with a lowercase letter or digit
///
/// The ID becomes part of object names on the broker, so it has to be a
/// valid DNS-1123 subdomain fragment.
pub fn validate_cluster_id(id: &str) -> Result<(), crate::Error> {
    let invalid = |reason: &str| {
        Err(crate::Error::malformed(
            "clusterID",
            format!("{:?} {}", id, reason),
        ))
    };

    if id.len() < 2 {
        return invalid("must be at least two characters long");
    }

    let is_alnum = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();

    if !id.chars().all(|c| is_alnum(c) || c == '.' || c == '-') {
        return invalid("may only contain lowercase alphanumerics, '.' and '-'");
    }

    let starts_ok = id.chars().next().is_some_and(is_alnum);
    let ends_ok = id.chars().last().is_some_and(is_alnum);
    if !starts_ok || !ends_ok {
        return invalid("must start and end with a lowercase alphanumeric");
    }

    Ok(())
}
