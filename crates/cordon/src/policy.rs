//! Domain-based egress policy: ordered allow/deny rules with first-match-wins.
//!
//! The policy is built once from a default action and an ordered rule list,
//! then shared read-only by every protocol handler (HTTP Host, TLS SNI, DNS
//! QNAME). One model, three protocols.
//!
//! # Semantics
//!
//! - **First match wins**: rules are scanned in input order; the first
//!   pattern that matches decides. Later rules are never consulted.
//! - **Wildcard subdomain matching**: `*.example.com` matches
//!   `api.example.com` but not `example.com` itself. `*` matches any name.
//! - **Unidentifiable hosts**: an empty name or an IP literal cannot match
//!   any rule; the default action applies and the decision is tagged
//!   [`Reason::Unidentifiable`].
//! - Matching is case-insensitive and ignores a single trailing dot.

use crate::error::{CordonError, Result};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, Ipv6Addr};

/// Allow or deny.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Allow,
    Deny,
}

impl Action {
    /// Whether this action permits the traffic.
    #[must_use]
    pub fn is_allow(self) -> bool {
        matches!(self, Action::Allow)
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Allow => write!(f, "allow"),
            Action::Deny => write!(f, "deny"),
        }
    }
}

impl std::str::FromStr for Action {
    type Err = CordonError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "allow" => Ok(Action::Allow),
            "deny" => Ok(Action::Deny),
            _ => Err(CordonError::InvalidAction(s.to_string())),
        }
    }
}

/// A compiled domain pattern.
///
/// Patterns are stored lower-cased. `*` must be the leading label if
/// present; a pattern may contain at most one `*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainPattern {
    /// Match any domain ("*").
    Any,
    /// Match strict subdomains only ("*.example.com"): more labels than
    /// the suffix, ending in `.suffix`. Stores the suffix without the `*`
    /// (i.e. ".example.com").
    SubdomainsOnly(String),
    /// Match the exact domain ("example.com").
    Exact(String),
}

impl DomainPattern {
    /// Parse and validate a pattern string.
    ///
    /// # Errors
    ///
    /// Rejects empty patterns, more than one `*`, and `*` anywhere but the
    /// leading label.
    pub fn parse(pattern: &str) -> Result<Self> {
        let lower = pattern.trim().to_lowercase();

        if lower.is_empty() {
            return Err(CordonError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: "empty pattern".to_string(),
            });
        }

        if lower == "*" {
            return Ok(DomainPattern::Any);
        }

        if lower.matches('*').count() > 1 {
            return Err(CordonError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: "at most one wildcard is allowed".to_string(),
            });
        }

        if let Some(suffix) = lower.strip_prefix("*.") {
            if suffix.is_empty() {
                return Err(CordonError::InvalidPattern {
                    pattern: pattern.to_string(),
                    reason: "wildcard pattern has an empty suffix".to_string(),
                });
            }
            // Keep the dot: matching is a plain ends_with on ".suffix".
            return Ok(DomainPattern::SubdomainsOnly(format!(".{suffix}")));
        }

        if lower.contains('*') {
            return Err(CordonError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: "wildcard must be the leading label".to_string(),
            });
        }

        Ok(DomainPattern::Exact(lower))
    }

    /// Check this pattern against a normalized (lower-cased, no trailing
    /// dot) name.
    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        match self {
            DomainPattern::Any => true,
            DomainPattern::Exact(domain) => name == domain,
            DomainPattern::SubdomainsOnly(dot_suffix) => {
                // Strictly more labels than the suffix: the name must extend
                // past ".suffix", so `api.example.com` matches `.example.com`
                // but `example.com` does not.
                name.len() > dot_suffix.len() && name.ends_with(dot_suffix.as_str())
            }
        }
    }
}

impl std::fmt::Display for DomainPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DomainPattern::Any => write!(f, "*"),
            DomainPattern::SubdomainsOnly(dot_suffix) => write!(f, "*{dot_suffix}"),
            DomainPattern::Exact(domain) => write!(f, "{domain}"),
        }
    }
}

/// One `(pattern, action)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub pattern: DomainPattern,
    pub action: Action,
}

impl Rule {
    /// Build a rule from raw strings, validating the pattern.
    pub fn new(domain: &str, action: Action) -> Result<Self> {
        Ok(Self {
            pattern: DomainPattern::parse(domain)?,
            action,
        })
    }
}

/// Wire shape of a rule as passed on the command line:
/// `{"action":"allow","domain":"*.example.com"}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSpec {
    pub action: Action,
    pub domain: String,
}

impl TryFrom<RuleSpec> for Rule {
    type Error = CordonError;

    fn try_from(spec: RuleSpec) -> Result<Self> {
        Rule::new(&spec.domain, spec.action)
    }
}

/// Why a decision came out the way it did. Observability only; handlers
/// branch on the action, not the reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    /// No rule matched; the default action applied.
    Default,
    /// Rule at this index (input order) matched first.
    Rule(usize),
    /// The input was not a domain name (empty, IP literal); only the
    /// default action can apply.
    Unidentifiable,
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reason::Default => write!(f, "default"),
            Reason::Rule(i) => write!(f, "rule[{i}]"),
            Reason::Unidentifiable => write!(f, "unidentifiable"),
        }
    }
}

/// The outcome of evaluating one name against the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub action: Action,
    pub reason: Reason,
}

impl Decision {
    /// Whether the traffic is permitted.
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        self.action.is_allow()
    }
}

/// An immutable egress policy: `(default_action, ordered rules)`.
///
/// Build once, share read-only across all protocol handlers. No interior
/// mutability, so concurrent evaluation needs no locks.
#[derive(Debug, Clone)]
pub struct Policy {
    default_action: Action,
    rules: Vec<Rule>,
}

impl Policy {
    /// Build a policy from a default action and an ordered rule list.
    ///
    /// Rules are kept in input order with no deduplication; ordering is
    /// semantically significant (first match wins).
    #[must_use]
    pub fn build(default_action: Action, rules: Vec<Rule>) -> Self {
        Self {
            default_action,
            rules,
        }
    }

    /// Build a policy from raw rule specs, validating each pattern.
    ///
    /// # Errors
    ///
    /// Returns the first pattern validation failure.
    pub fn from_specs(default_action: Action, specs: Vec<RuleSpec>) -> Result<Self> {
        let rules = specs
            .into_iter()
            .map(Rule::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::build(default_action, rules))
    }

    /// The configured default action.
    #[must_use]
    pub fn default_action(&self) -> Action {
        self.default_action
    }

    /// Number of rules.
    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Evaluate a name against the policy.
    ///
    /// Empty names and IP literals are unidentifiable: no rule can match
    /// them and the default action applies. Otherwise the name is
    /// lower-cased, a single trailing dot is stripped, and rules are
    /// scanned in order.
    #[must_use]
    pub fn evaluate(&self, name: &str) -> Decision {
        if name.is_empty() || is_ip_literal(name) {
            return Decision {
                action: self.default_action,
                reason: Reason::Unidentifiable,
            };
        }

        let lower = name.to_lowercase();
        let normalized = lower.strip_suffix('.').unwrap_or(&lower);

        for (i, rule) in self.rules.iter().enumerate() {
            if rule.pattern.matches(normalized) {
                return Decision {
                    action: rule.action,
                    reason: Reason::Rule(i),
                };
            }
        }

        Decision {
            action: self.default_action,
            reason: Reason::Default,
        }
    }

    /// Evaluate an optional name; `None` is an unidentifiable host.
    ///
    /// Used by the transparent TLS handler when a flow carries no SNI.
    #[must_use]
    pub fn evaluate_opt(&self, name: Option<&str>) -> Decision {
        match name {
            Some(name) => self.evaluate(name),
            None => Decision {
                action: self.default_action,
                reason: Reason::Unidentifiable,
            },
        }
    }
}

/// Whether a string is an IP literal (IPv4 dotted-quad, or IPv6 with or
/// without CONNECT-style brackets).
fn is_ip_literal(name: &str) -> bool {
    if name.parse::<Ipv4Addr>().is_ok() || name.parse::<Ipv6Addr>().is_ok() {
        return true;
    }
    if let Some(inner) = name.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
        return inner.parse::<Ipv6Addr>().is_ok();
    }
    false
}
