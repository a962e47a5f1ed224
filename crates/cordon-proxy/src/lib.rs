//! Egress enforcement proxy for the cordon microVM sandbox.
//!
//! When a sandbox starts with an egress policy, the host launches this
//! proxy as a long-lived side process and rewrites the guest's outbound
//! packets toward it. Three listeners share one immutable [`Policy`]:
//!
//! 1. **HTTP forward proxy** ([`http`]) — absolute-form plaintext requests
//!    and CONNECT tunnels from proxy-aware clients.
//! 2. **Transparent TLS proxy** ([`tls`]) — redirected HTTPS flows; the
//!    original destination comes from `SO_ORIGINAL_DST` and the policy is
//!    evaluated against the peeked ClientHello SNI. TLS is never
//!    terminated.
//! 3. **DNS proxy** ([`dns`]) — forwarding resolver that refuses queries
//!    for denied names and relays everything else verbatim.
//!
//! Handlers never share mutable state; every connection owns its sockets
//! and releases them on all exit paths.
//!
//! [`Policy`]: cordon::Policy

pub mod audit;
pub mod config;
pub mod dns;
pub mod error;
pub mod http;
pub mod origdst;
pub mod server;
pub mod sni;
pub mod tls;

pub use config::ProxyConfig;
pub use error::{ProxyError, Result};
pub use server::{start, BoundPorts, ProxyHandle};
