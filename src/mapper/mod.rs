//! Request target mapping.
//!
//! Pure domain-suffix matching against the routing snapshot. The mapper
//! never resolves anything itself and never touches the port; it only
//! swaps the hostname when a configured pattern matches.

use crate::domain::RouteEntry;
use tracing::info;

/// A dial target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        HostPort {
            host: host.into(),
            port,
        }
    }

    pub fn to_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Whether `host` equals `pattern` or is a subdomain of it.
///
/// Suffix matching is label-aligned: `notakamaized.net` does not match
/// `akamaized.net`.
pub fn matches_pattern(host: &str, pattern: &str) -> bool {
    if host == pattern {
        return true;
    }
    match host.strip_suffix(pattern) {
        Some(prefix) => prefix.ends_with('.'),
        None => false,
    }
}

/// Map a request target through the routing snapshot.
///
/// The first matching entry in configuration order wins. A matched entry
/// without a selected edge yet, like any unmatched host, passes through
/// untouched.
pub fn map_target(routes: &[RouteEntry], target: &HostPort) -> HostPort {
    for entry in routes {
        if matches_pattern(&target.host, &entry.pattern) {
            let Some(edge) = &entry.host else {
                return target.clone();
            };
            if *edge != target.host {
                info!(
                    from = %target.host,
                    to = %edge,
                    pattern = %entry.pattern,
                    "mapped request target"
                );
            }
            return HostPort::new(edge.clone(), target.port);
        }
    }
    target.clone()
}
