//! CLI argument definitions for cordon-egress.
//!
//! Uses clap for argument parsing. The binary takes no subcommands: it is
//! launched once per sandbox by the VM lifecycle manager and runs until
//! signalled.

use clap::Parser;
use cordon::{Action, RuleSpec};
use std::net::{IpAddr, SocketAddr};

/// cordon-egress - egress enforcement proxy for a cordon sandbox
///
/// Listens on the guest-facing gateway address and enforces a domain
/// allow/deny policy over HTTP, transparently proxied TLS, and DNS.
/// The parent process is expected to persist the PID and the bound ports;
/// this binary writes nothing to stdout.
#[derive(Parser, Debug)]
#[command(name = "cordon-egress")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// HTTP forward-proxy listen port (0 = OS-assigned)
    #[arg(long)]
    pub port: u16,

    /// Transparent TLS proxy listen port; omit to disable the listener
    #[arg(long)]
    pub tls_port: Option<u16>,

    /// DNS proxy listen port (UDP and TCP); omit to disable the listener
    #[arg(long)]
    pub dns_port: Option<u16>,

    /// Upstream resolver the DNS proxy forwards allowed queries to
    #[arg(long, default_value = "8.8.8.8:53")]
    pub dns_upstream: SocketAddr,

    /// Bind address for all listeners; must not be 0.0.0.0
    #[arg(long)]
    pub bind: IpAddr,

    /// Action when no rule matches, and for unidentifiable hosts
    #[arg(long, value_parser = parse_action)]
    pub default_policy: Action,

    /// Policy rule as JSON: '{"action":"allow","domain":"*.example.com"}'.
    /// May be repeated; order is significant, first match wins.
    #[arg(long = "rule", value_parser = parse_rule)]
    pub rules: Vec<RuleSpec>,

    /// Silence all log output
    #[arg(long)]
    pub no_log: bool,
}

fn parse_action(s: &str) -> Result<Action, String> {
    s.parse().map_err(|e| format!("{e}"))
}

fn parse_rule(s: &str) -> Result<RuleSpec, String> {
    serde_json::from_str(s).map_err(|e| format!("invalid rule JSON: {e}"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_invocation() {
        let cli = Cli::parse_from([
            "cordon-egress",
            "--port",
            "0",
            "--bind",
            "127.0.0.1",
            "--default-policy",
            "deny",
        ]);
        assert_eq!(cli.port, 0);
        assert_eq!(cli.default_policy, Action::Deny);
        assert!(cli.tls_port.is_none());
        assert!(cli.dns_port.is_none());
        assert!(cli.rules.is_empty());
        assert!(!cli.no_log);
    }

    #[test]
    fn test_repeated_rules_keep_order() {
        let cli = Cli::parse_from([
            "cordon-egress",
            "--port",
            "8080",
            "--bind",
            "10.0.2.2",
            "--default-policy",
            "deny",
            "--rule",
            r#"{"action":"deny","domain":"*.blocked.com"}"#,
            "--rule",
            r#"{"action":"allow","domain":"*"}"#,
        ]);
        assert_eq!(cli.rules.len(), 2);
        assert_eq!(cli.rules[0].action, Action::Deny);
        assert_eq!(cli.rules[0].domain, "*.blocked.com");
        assert_eq!(cli.rules[1].action, Action::Allow);
    }

    #[test]
    fn test_malformed_rule_rejected() {
        let result = Cli::try_parse_from([
            "cordon-egress",
            "--port",
            "0",
            "--bind",
            "127.0.0.1",
            "--default-policy",
            "deny",
            "--rule",
            "not-json",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_default_policy_rejected() {
        let result = Cli::try_parse_from([
            "cordon-egress",
            "--port",
            "0",
            "--bind",
            "127.0.0.1",
            "--default-policy",
            "maybe",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_dns_upstream_parses_socket_addr() {
        let cli = Cli::parse_from([
            "cordon-egress",
            "--port",
            "0",
            "--bind",
            "127.0.0.1",
            "--default-policy",
            "allow",
            "--dns-port",
            "5353",
            "--dns-upstream",
            "1.1.1.1:53",
        ]);
        assert_eq!(cli.dns_upstream, "1.1.1.1:53".parse().unwrap());
        assert_eq!(cli.dns_port, Some(5353));
    }
}
