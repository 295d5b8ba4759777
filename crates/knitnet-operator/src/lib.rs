//! Knitnet operator: reconciles `Knitnet` resources into a hosted broker
//! domain, a joined member cluster, or both

#![deny(missing_docs)]

pub mod controller;
pub mod gateway;
pub mod startup;

pub use controller::{error_policy, reconcile, Context};
