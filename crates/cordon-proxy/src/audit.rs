//! Audit logging for egress decisions.
//!
//! Every allow/deny decision is logged with structured fields via
//! `tracing`. Payload bytes are never logged; only destination metadata
//! and the policy reason.

use cordon::Decision;
use tracing::info;

/// Which protocol listener produced the event.
#[derive(Debug, Clone, Copy)]
pub enum Protocol {
    /// HTTP forward proxy (plaintext or CONNECT).
    Http,
    /// Transparent SNI-inspecting TLS proxy.
    Tls,
    /// DNS forwarding resolver.
    Dns,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Http => write!(f, "http"),
            Protocol::Tls => write!(f, "tls"),
            Protocol::Dns => write!(f, "dns"),
        }
    }
}

/// Log an egress decision. `host` is the evaluated name, or `"-"` when
/// the host was unidentifiable.
pub fn log_decision(protocol: Protocol, host: &str, decision: &Decision) {
    info!(
        target: "cordon_proxy::audit",
        protocol = %protocol,
        host = if host.is_empty() { "-" } else { host },
        decision = %decision.action,
        reason = %decision.reason,
        "egress decision"
    );
}
