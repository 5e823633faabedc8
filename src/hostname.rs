//! Host-domain extraction from a system hostname (spec.md §4.1).
//!
//! The node's hostname is not itself DNS-relevant, but its domain suffix
//! contributes one extra search entry when it looks like a real, publicly
//! resolvable domain rather than a placeholder like `localhost` or a bare
//! `.local` name.

use psl::Psl;
use std::net::IpAddr;

/// Hostnames NetworkManager treats as "not specific to this host", mirrored
/// from the set of values a freshly installed distro ships in `/etc/hostname`.
const PLACEHOLDER_HOSTNAMES: &[&str] = &[
    "localhost",
    "localhost.localdomain",
    "localhost4",
    "localhost4.localdomain4",
    "localhost6",
    "localhost6.localdomain6",
    "(none)",
];

fn is_specific_hostname(hostname: &str) -> bool {
    if hostname.is_empty() {
        return false;
    }
    !PLACEHOLDER_HOSTNAMES
        .iter()
        .any(|p| p.eq_ignore_ascii_case(hostname))
}

/// Whether `domain` is a real, publicly registrable domain: it has a known
/// public suffix (TLD) and something registered under it. `assume_any_tld_is_public
/// = false` in spec.md terms — an unrecognized suffix (like `.local`) is never
/// treated as public, no matter how it's spelled.
fn is_valid_public_domain(domain: &str) -> bool {
    let bytes = domain.as_bytes();
    match psl::List.suffix(bytes) {
        Some(suffix) if suffix.is_known() => psl::List.domain(bytes).is_some(),
        _ => false,
    }
}

/// Implements spec.md §4.1 `set_hostname` extraction rule.
///
/// ```text
/// dcbw.example.com -> example.com
/// example.com      -> example.com
/// localhost        -> (none)
/// 192.0.2.1        -> (none)
/// host.local       -> (none)
/// ```
pub fn extract_host_domain(hostname: Option<&str>) -> Option<String> {
    let hostname = hostname?.trim();

    if !is_specific_hostname(hostname) {
        return None;
    }
    if hostname.ends_with(".in-addr.arpa") || hostname.ends_with(".ip6.arpa") {
        return None;
    }
    if hostname.parse::<IpAddr>().is_ok() {
        return None;
    }

    let dot = hostname.find('.')?;
    let suffix = &hostname[dot + 1..];

    if is_valid_public_domain(suffix) {
        return Some(suffix.to_string());
    }
    if is_valid_public_domain(hostname) {
        return Some(hostname.to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::extract_host_domain;

    #[test]
    fn scenarios_from_spec() {
        assert_eq!(
            extract_host_domain(Some("dcbw.example.com")),
            Some("example.com".to_string())
        );
        assert_eq!(
            extract_host_domain(Some("example.com")),
            Some("example.com".to_string())
        );
        assert_eq!(extract_host_domain(Some("localhost")), None);
        assert_eq!(extract_host_domain(Some("192.0.2.1")), None);
        assert_eq!(extract_host_domain(Some("host.local")), None);
        assert_eq!(extract_host_domain(None), None);
        assert_eq!(extract_host_domain(Some("")), None);
    }

    #[test]
    fn rejects_reverse_dns_names() {
        assert_eq!(extract_host_domain(Some("1.0.0.127.in-addr.arpa")), None);
    }

    #[test]
    fn no_dot_means_no_domain() {
        assert_eq!(extract_host_domain(Some("myhost")), None);
    }
}
