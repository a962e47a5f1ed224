//! Proxy configuration.
//!
//! The VM lifecycle manager launches `cordon-egress` with a bind address,
//! one port per enabled protocol listener, and the egress policy inputs.
//! Port 0 asks the OS for an ephemeral port; the actual bound ports are
//! reported back through [`ProxyHandle`](crate::server::ProxyHandle) so the
//! parent can persist them.

use crate::error::{ProxyError, Result};
use cordon::{Action, RuleSpec};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};

fn default_bind_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_dns_upstream() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), 53))
}

fn default_max_connections() -> usize {
    1024
}

/// Configuration for the egress proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Bind address for all listeners. This is the gateway IP the guest
    /// sees; binding to `0.0.0.0` is rejected so the proxy is not
    /// reachable from other host interfaces.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,

    /// HTTP forward-proxy listen port (0 = OS-assigned).
    #[serde(default)]
    pub http_port: u16,

    /// Transparent TLS proxy listen port. `None` disables the listener.
    #[serde(default)]
    pub tls_port: Option<u16>,

    /// DNS proxy listen port (UDP and TCP). `None` disables the listener.
    #[serde(default)]
    pub dns_port: Option<u16>,

    /// Upstream resolver the DNS proxy forwards to.
    #[serde(default = "default_dns_upstream")]
    pub dns_upstream: SocketAddr,

    /// Default action when no rule matches (or the host is
    /// unidentifiable).
    pub default_action: Action,

    /// Ordered rule list; first match wins.
    #[serde(default)]
    pub rules: Vec<RuleSpec>,

    /// Ceiling on concurrent connection handlers across all listeners.
    /// Excess accepts wait for a free slot rather than being refused.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl ProxyConfig {
    /// Validate the configuration before any listener binds.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Config`] for an unspecified bind address, a
    /// zero connection ceiling, or (on non-Linux hosts) a requested
    /// transparent TLS listener.
    pub fn validate(&self) -> Result<()> {
        if self.bind_addr.is_unspecified() {
            return Err(ProxyError::Config(format!(
                "bind address {} is unspecified; the proxy must bind only the guest-facing gateway address",
                self.bind_addr
            )));
        }

        if self.max_connections == 0 {
            return Err(ProxyError::Config(
                "max_connections must be at least 1".to_string(),
            ));
        }

        if self.tls_port.is_some() && !cfg!(target_os = "linux") {
            return Err(ProxyError::Config(
                "transparent TLS proxy requires SO_ORIGINAL_DST (Linux only)".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            http_port: 0,
            tls_port: None,
            dns_port: None,
            dns_upstream: default_dns_upstream(),
            default_action: Action::Deny,
            rules: Vec::new(),
            max_connections: default_max_connections(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ProxyConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bind_addr, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(config.max_connections, 1024);
    }

    #[test]
    fn test_unspecified_bind_rejected() {
        let config = ProxyConfig {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ProxyError::Config(_))));
    }

    #[test]
    fn test_zero_connection_ceiling_rejected() {
        let config = ProxyConfig {
            max_connections: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serialization() {
        let config = ProxyConfig {
            dns_port: Some(5353),
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: ProxyConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.dns_port, Some(5353));
        assert_eq!(deserialized.dns_upstream, config.dns_upstream);
    }
}
