//! The sealed, immutable IP-configuration snapshot contributed by producers
//! (DHCP, static config, VPN tunnels, ...) and the optional global DNS
//! override.
//!
//! Neither type is owned or mutated by this crate; component A only ever
//! holds a reference-counted handle to one. See spec.md §3 "IP-config
//! snapshot" / "Global DNS configuration".

use ip_network::IpNetwork;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

/// Ternary the way `nm_l3_config_data_get_never_default` reports it:
/// the producer either said yes, said no, or never expressed an opinion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ternary {
    True,
    False,
    Unset,
}

#[derive(Debug)]
struct Inner {
    ifindex: i32,
    ifname: Option<String>,
    nameservers: Vec<IpAddr>,
    search: Vec<String>,
    domains: Vec<String>,
    wins: Vec<Ipv4Addr>,
    never_default: Ternary,
    dns_priority: i32,
    best_default_route: bool,
    addresses: Vec<IpNetwork>,
    non_default_routes: Vec<IpNetwork>,
    options: Vec<String>,
    nis_domain: Option<String>,
    nis_servers: Vec<Ipv4Addr>,
}

/// Immutable, reference-counted IP configuration contributed by one
/// producer for one interface. Two handles compare equal by identity
/// ([`IpConfigSnapshot::is_same_instance`]) the way the C source compares
/// `l3cd` pointers, and by value ([`IpConfigSnapshot::dns_semantically_equal`])
/// for the cases in spec §4.1 that require it.
#[derive(Debug, Clone)]
pub struct IpConfigSnapshot(Arc<Inner>);

impl PartialEq for IpConfigSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.is_same_instance(other)
    }
}
impl Eq for IpConfigSnapshot {}

impl IpConfigSnapshot {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ifindex: i32,
        ifname: Option<String>,
        nameservers: Vec<IpAddr>,
        search: Vec<String>,
        domains: Vec<String>,
        wins: Vec<Ipv4Addr>,
        never_default: Ternary,
        dns_priority: i32,
        best_default_route: bool,
        addresses: Vec<IpNetwork>,
        non_default_routes: Vec<IpNetwork>,
    ) -> Self {
        Self::with_options(
            ifindex,
            ifname,
            nameservers,
            search,
            domains,
            wins,
            never_default,
            dns_priority,
            best_default_route,
            addresses,
            non_default_routes,
            vec![],
            None,
            vec![],
        )
    }

    /// Full constructor, including the options/NIS fields component F needs
    /// that most callers leave empty. Kept separate from [`Self::new`] so
    /// the common case doesn't have to spell out three empty collections.
    #[allow(clippy::too_many_arguments)]
    pub fn with_options(
        ifindex: i32,
        ifname: Option<String>,
        nameservers: Vec<IpAddr>,
        search: Vec<String>,
        domains: Vec<String>,
        wins: Vec<Ipv4Addr>,
        never_default: Ternary,
        dns_priority: i32,
        best_default_route: bool,
        addresses: Vec<IpNetwork>,
        non_default_routes: Vec<IpNetwork>,
        options: Vec<String>,
        nis_domain: Option<String>,
        nis_servers: Vec<Ipv4Addr>,
    ) -> Self {
        assert!(ifindex > 0, "a snapshot's interface-index must be positive");
        Self(Arc::new(Inner {
            ifindex,
            ifname,
            nameservers,
            search,
            domains,
            wins,
            never_default,
            dns_priority,
            best_default_route,
            addresses,
            non_default_routes,
            options,
            nis_domain,
            nis_servers,
        }))
    }

    pub fn ifindex(&self) -> i32 {
        self.0.ifindex
    }

    pub fn ifname(&self) -> Option<&str> {
        self.0.ifname.as_deref()
    }

    pub fn nameservers(&self) -> &[IpAddr] {
        &self.0.nameservers
    }

    pub fn search(&self) -> &[String] {
        &self.0.search
    }

    pub fn domains(&self) -> &[String] {
        &self.0.domains
    }

    pub fn wins(&self) -> &[Ipv4Addr] {
        &self.0.wins
    }

    pub fn never_default(&self) -> Ternary {
        self.0.never_default
    }

    /// Signed DNS priority as the producer set it; 0 means "unset" and such
    /// a snapshot is rejected by the entry store (spec §3 invariant 2).
    pub fn dns_priority(&self) -> i32 {
        self.0.dns_priority
    }

    pub fn best_default_route(&self) -> bool {
        self.0.best_default_route
    }

    pub fn addresses(&self) -> &[IpNetwork] {
        &self.0.addresses
    }

    pub fn non_default_routes(&self) -> &[IpNetwork] {
        &self.0.non_default_routes
    }

    pub fn options(&self) -> &[String] {
        &self.0.options
    }

    pub fn nis_domain(&self) -> Option<&str> {
        self.0.nis_domain.as_deref()
    }

    pub fn nis_servers(&self) -> &[Ipv4Addr] {
        &self.0.nis_servers
    }

    /// Identity comparison, the way the C source compares `l3cd` pointers.
    pub fn is_same_instance(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Semantic comparison limited to DNS-relevant fields and route
    /// identity, used by [`crate::store::EntryStore::set_ip_config`] to
    /// decide whether a differing snapshot pointer is still "the same
    /// contribution" (spec §4.1).
    pub fn dns_semantically_equal(&self, other: &Self) -> bool {
        self.0.ifindex == other.0.ifindex
            && self.0.nameservers == other.0.nameservers
            && self.0.search == other.0.search
            && self.0.domains == other.0.domains
            && self.0.wins == other.0.wins
            && self.0.never_default == other.0.never_default
            && self.0.dns_priority == other.0.dns_priority
            && self.0.best_default_route == other.0.best_default_route
            && self.0.addresses == other.0.addresses
            && self.0.non_default_routes == other.0.non_default_routes
            && self.0.options == other.0.options
            && self.0.nis_domain == other.0.nis_domain
            && self.0.nis_servers == other.0.nis_servers
    }
}

/// One named domain entry of a [`GlobalDnsConfig`]: a set of servers that
/// apply to queries for that domain (or, for the wildcard domain `*`, to
/// every query) regardless of what any interface contributes.
#[derive(Debug, Clone)]
pub struct GlobalDnsDomain {
    pub servers: Vec<IpAddr>,
}

pub const GLOBAL_WILDCARD_DOMAIN: &str = "*";

/// Operator-supplied override, external to this crate and versioned by
/// whoever owns the running configuration. See spec.md §3 "Global DNS
/// configuration".
#[derive(Debug, Clone, Default)]
pub struct GlobalDnsConfig {
    pub search: Vec<String>,
    pub options: Vec<String>,
    pub domains: std::collections::BTreeMap<String, GlobalDnsDomain>,
}

impl GlobalDnsConfig {
    pub fn wildcard(&self) -> Option<&GlobalDnsDomain> {
        self.domains.get(GLOBAL_WILDCARD_DOMAIN)
    }

    /// Serialization fed into the fingerprint seed (spec §4.3, step 1).
    /// Order-independent over `domains` because `BTreeMap` iterates sorted.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        for s in &self.search {
            buf.extend_from_slice(s.as_bytes());
            buf.push(0);
        }
        for o in &self.options {
            buf.extend_from_slice(o.as_bytes());
            buf.push(0);
        }
        for (name, domain) in &self.domains {
            buf.extend_from_slice(name.as_bytes());
            buf.push(0);
            for server in &domain.servers {
                buf.extend_from_slice(server.to_string().as_bytes());
                buf.push(0);
            }
        }
        buf
    }
}
