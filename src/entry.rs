//! IP-entries and interface buckets: the records component A owns for each
//! live producer contribution. See spec.md §3 "IP-entry" / "Interface
//! bucket" and §4.2 for `merged_domains`.

use crate::family::Family;
use crate::snapshot::IpConfigSnapshot;
use std::fmt;

/// Opaque producer identity, e.g. a device pointer cast to an integer in
/// the original. We keep it as an opaque `u64` so callers can hand us
/// whatever stable identity they have (an address, a connection id, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceTag(pub u64);

/// Classification of one entry, ordered so that `#[derive(Ord)]` gives the
/// "descending by type" tie-break spec §3 and §4.1 require: `Vpn >
/// BestDevice > Default`. `Removed` is a request, never a stored state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum IpConfigType {
    Default,
    BestDevice,
    Vpn,
    /// Only ever appears as an input to `set_ip_config`; never stored.
    #[serde(skip)]
    Removed,
}

impl fmt::Display for IpConfigType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IpConfigType::Default => "default",
            IpConfigType::BestDevice => "best",
            IpConfigType::Vpn => "vpn",
            IpConfigType::Removed => "removed",
        })
    }
}

/// Per-entry merged domain state, populated only during an update cycle by
/// the domain-merge engine (component B) and cleared before it ends (spec
/// §3 invariant 4, §4.2 "Clear step").
///
/// `search` borrows from the owning entry's snapshot for the lifetime of
/// one update cycle; see DESIGN.md for why we copy instead (strategy (ii)
/// of spec.md §9 design notes).
#[derive(Debug, Clone, Default)]
pub struct MergedDomains {
    pub search: Vec<String>,
    pub reverse: Vec<String>,
    pub has_default_route: bool,
    pub has_default_route_exclusive: bool,
    pub has_default_route_explicit: bool,
}

impl MergedDomains {
    /// Invariant 6: `explicit ⇒ exclusive ⇒ has_default_route`.
    pub fn check_invariant(&self) {
        if self.has_default_route_explicit {
            debug_assert!(self.has_default_route_exclusive);
        }
        if self.has_default_route_exclusive {
            debug_assert!(self.has_default_route);
        }
    }
}

/// One (interface, address-family, source) contribution.
#[derive(Debug, Clone)]
pub struct IpEntry {
    pub snapshot: IpConfigSnapshot,
    pub source_tag: SourceTag,
    pub addr_family: Family,
    pub ip_config_type: IpConfigType,
    pub merged_domains: Option<MergedDomains>,
}

impl IpEntry {
    pub fn new(
        snapshot: IpConfigSnapshot,
        source_tag: SourceTag,
        addr_family: Family,
        ip_config_type: IpConfigType,
    ) -> Self {
        debug_assert_ne!(ip_config_type, IpConfigType::Removed);
        Self {
            snapshot,
            source_tag,
            addr_family,
            ip_config_type,
            merged_domains: None,
        }
    }

    pub fn ifindex(&self) -> i32 {
        self.snapshot.ifindex()
    }

    /// Entries with a zero priority are never stored (spec §3 invariant 2),
    /// so this is always non-zero for a live entry.
    pub fn priority(&self) -> i32 {
        self.snapshot.dns_priority()
    }
}

/// Monotonically increasing identity for entries stored in
/// [`crate::store::EntryStore`]. Using an id rather than pointers/indices
/// means removal never invalidates a live reference, matching spec §3
/// invariant 5 ("no external observer may hold a pointer into the list
/// across a mutation without re-obtaining the head") by construction: the
/// id is the only thing ever held across a mutation, and it is looked up
/// fresh each time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(pub u64);
