//! Host-pattern glob matching and private-IP classification.
//!
//! Grounded loosely on `router.rs`'s pattern of precompiling match state
//! once and reusing it across many lookups, adapted from exact/wildcard-
//! suffix matching to general globs (`*.example.com`, `api-*.internal`)
//! since the spec's host lists are glob patterns, not route prefixes.

use globset::{Glob, GlobSet, GlobSetBuilder};
use ipnet::IpNet;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::LazyLock;

/// Strip a trailing `:port` and lower-case the remainder.
pub fn normalize_host(host: &str) -> String {
    let host = host.rsplit_once(':').map(|(h, p)| {
        if p.chars().all(|c| c.is_ascii_digit()) { h } else { host }
    }).unwrap_or(host);
    host.to_ascii_lowercase()
}

/// Compile a list of glob patterns into a matcher. An empty pattern list
/// compiles to a matcher that matches nothing — callers decide what an
/// empty list means for them (the spec treats an empty `allowed_hosts` as
/// "allow all", which is handled by the caller, not here).
pub fn compile_globs(patterns: &[String]) -> Result<GlobSet, globset::Error> {
    let mut builder = GlobSetBuilder::new();
    for p in patterns {
        builder.add(Glob::new(p)?);
    }
    builder.build()
}

/// Convenience: does `host` match any of `patterns`? Compiles on every
/// call — fine for small, rarely-changing lists (host filters, secret
/// scopes); callers on a hot path should precompile with
/// [`compile_globs`] instead.
pub fn host_matches_any(host: &str, patterns: &[String]) -> bool {
    if patterns.is_empty() {
        return false;
    }
    match compile_globs(patterns) {
        Ok(set) => set.is_match(normalize_host(host)),
        Err(_) => false,
    }
}

static PRIVATE_V4_NETS: LazyLock<Vec<IpNet>> = LazyLock::new(|| {
    [
        "10.0.0.0/8",
        "172.16.0.0/12",
        "192.168.0.0/16",
        "127.0.0.0/8",
        "169.254.0.0/16",
    ]
    .iter()
    .map(|s| IpNet::from_str(s).unwrap())
    .collect()
});

static PRIVATE_V6_NETS: LazyLock<Vec<IpNet>> = LazyLock::new(|| {
    ["::1/128", "fc00::/7", "fe80::/10"]
        .iter()
        .map(|s| IpNet::from_str(s).unwrap())
        .collect()
});

/// Classify an IP against the standard private ranges:
/// `{10.0.0.0/8, 172.16.0.0/12, 192.168.0.0/16, 127.0.0.0/8,
/// 169.254.0.0/16, ::1/128, fc00::/7, fe80::/10}`.
pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(_) => PRIVATE_V4_NETS.iter().any(|n| n.contains(&ip)),
        IpAddr::V6(_) => PRIVATE_V6_NETS.iter().any(|n| n.contains(&ip)),
    }
}

/// True if `host` parses as an IP literal that falls in a private range.
/// Hostnames that are not IP literals return `false` — DNS resolution is
/// the interceptor's job, not this utility's; the host filter only
/// blocks private-IP *literals* at the policy layer (resolving every
/// hostname to check for DNS-rebinding is a defense-in-depth concern
/// handled separately).
pub fn is_private_host_literal(host: &str) -> bool {
    IpAddr::from_str(host).map(is_private_ip).unwrap_or(false)
}
