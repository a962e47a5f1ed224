//! Core egress policy engine for the cordon microVM sandbox.
//!
//! When a sandbox starts with an egress policy, the host launches a side
//! process (`cordon-egress`, built from `cordon-proxy` + `cordon-cli`) that
//! enforces domain-based allow/deny rules on all outbound guest traffic.
//! This crate holds the protocol-independent part: the [`Policy`] value the
//! HTTP, TLS, and DNS handlers all evaluate against.
//!
//! The policy is pure and immutable — build once with [`Policy::build`],
//! then share freely across tasks without locks.

pub mod error;
pub mod policy;

pub use error::{CordonError, Result};
pub use policy::{Action, Decision, DomainPattern, Policy, Reason, Rule, RuleSpec};
