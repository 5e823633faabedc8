//! Component B — the domain-merge engine.
//!
//! Run once per update cycle against the sorted precedence list. Computes,
//! per entry, the effective search domains, the reverse-DNS domains, and
//! the default-route disposition. See spec.md §4.2.

use crate::entry::{EntryId, IpConfigType, MergedDomains};
use crate::family::Family;
use crate::snapshot::{IpConfigSnapshot, Ternary};
use crate::store::EntryStore;
use ip_network::IpNetwork;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Strip a leading `~`, trim whitespace, and collapse to the canonical
/// wildcard spelling (empty string). Spec §4.2 pass 2, step 1.
fn canonicalize(domain: &str) -> String {
    let trimmed = domain.trim();
    let stripped = trimmed.strip_prefix('~').unwrap_or(trimmed).trim();
    stripped.to_string()
}

/// Parent domains of `domain`, from its immediate parent down to the root
/// wildcard `""`. E.g. `sub.example.com` yields `example.com`, `com`, ``.
fn parents(domain: &str) -> impl Iterator<Item = &str> {
    std::iter::successors(Some(domain), |d| d.split_once('.').map(|(_, rest)| rest))
        .skip(1)
        .chain(std::iter::once(""))
}

/// Pass 1: which entries are eligible to contribute the synthetic wildcard
/// domain. Spec §4.2 "Pass 1 — wildcard eligibility".
fn wildcard_candidates(store: &EntryStore, sorted: &[EntryId]) -> std::collections::HashSet<EntryId> {
    let mut candidates = std::collections::HashSet::new();
    for &id in sorted {
        let entry = store.get(id).expect("id came from sorted_ids");
        if entry.snapshot.nameservers().is_empty() {
            continue;
        }
        let is_candidate = if entry.snapshot.best_default_route() {
            true
        } else {
            entry.ip_config_type == IpConfigType::Vpn
                && entry.snapshot.never_default() == Ternary::False
                && entry.snapshot.search().is_empty()
                && entry.snapshot.domains().is_empty()
        };
        if is_candidate {
            candidates.insert(id);
        }
    }
    candidates
}

fn reverse_domain_v4(addr: Ipv4Addr, prefix: u8) -> Option<String> {
    let full_octets = (prefix / 8) as usize;
    if full_octets == 0 {
        return None;
    }
    let octets = addr.octets();
    let labels: Vec<String> = octets[..full_octets]
        .iter()
        .rev()
        .map(|o| o.to_string())
        .collect();
    Some(format!("{}.in-addr.arpa", labels.join(".")))
}

fn reverse_domain_v6(addr: Ipv6Addr, prefix: u8) -> Option<String> {
    let full_nibbles = (prefix / 4) as usize;
    if full_nibbles == 0 {
        return None;
    }
    let mut nibbles = Vec::with_capacity(32);
    for byte in addr.octets() {
        nibbles.push(format!("{:x}", byte >> 4));
        nibbles.push(format!("{:x}", byte & 0xf));
    }
    let reversed: Vec<String> = nibbles[..full_nibbles].iter().rev().cloned().collect();
    Some(format!("{}.ip6.arpa", reversed.join(".")))
}

fn reverse_domain(net: &IpNetwork) -> Option<String> {
    match net.network_address() {
        IpAddr::V4(a) => reverse_domain_v4(a, net.netmask()),
        IpAddr::V6(a) => reverse_domain_v6(a, net.netmask()),
    }
}

fn build_reverse_domains(family: Family, snapshot: &IpConfigSnapshot) -> Vec<String> {
    let wants_v4 = family == Family::V4;
    snapshot
        .addresses()
        .iter()
        .chain(snapshot.non_default_routes().iter())
        .filter(|net| matches!(net, IpNetwork::V4(_)) == wants_v4)
        .filter_map(reverse_domain)
        .collect()
}

/// Runs the full two-pass merge over the sorted precedence list, filling in
/// `merged_domains` on every entry that has at least one nameserver.
pub fn run(store: &mut EntryStore, sorted_ids: &[EntryId]) {
    let wildcard_entries = wildcard_candidates(store, sorted_ids);
    let no_wildcard_collected = wildcard_entries.is_empty();

    // Shared across all entries of this cycle: domain -> priority of the
    // entry that first admitted it. Spec §4.2 pass 2, step 2.
    let mut tracking: HashMap<String, i32> = HashMap::new();
    let mut prev_priority = i32::MIN;

    for &id in sorted_ids {
        let (priority, source_domains, is_wildcard_candidate, family, snapshot) = {
            let entry = store.get(id).expect("id came from sorted_ids");
            if entry.snapshot.nameservers().is_empty() {
                continue;
            }
            let priority = entry.priority();
            debug_assert!(prev_priority <= priority, "sorted_ids must be priority-ascending");
            let source_domains: Vec<String> = if !entry.snapshot.search().is_empty() {
                entry.snapshot.search().to_vec()
            } else {
                entry.snapshot.domains().to_vec()
            };
            // Fallback rule: if no entry was flagged eligible in pass 1,
            // every non-VPN entry becomes a wildcard candidate.
            let is_wildcard_candidate = if no_wildcard_collected {
                entry.ip_config_type != IpConfigType::Vpn
            } else {
                wildcard_entries.contains(&id)
            };
            (
                priority,
                source_domains,
                is_wildcard_candidate,
                entry.addr_family,
                entry.snapshot.clone(),
            )
        };
        prev_priority = priority;

        let mut candidates: Vec<(String, bool)> =
            source_domains.iter().cloned().map(|d| (d, false)).collect();
        if is_wildcard_candidate {
            candidates.push(("~".to_string(), true));
        }

        let mut search = Vec::with_capacity(candidates.len());
        let mut has_default_route_explicit = false;
        let mut has_default_route_auto = false;

        for (domain_full, is_synthetic) in candidates {
            // The synthetic trailing candidate is only a candidate "iff no
            // explicit `~`/"" has yet been admitted for this entry" (spec
            // §4.2 pass 2): skip it once a real domain already claimed the
            // wildcard.
            if is_synthetic && has_default_route_explicit {
                continue;
            }

            let canonical = canonicalize(&domain_full);

            if let Some(&old_priority) = tracking.get(&canonical) {
                if old_priority < priority {
                    continue;
                }
            } else if parents(&canonical)
                .filter_map(|p| tracking.get(p).copied())
                .any(|parent_priority| parent_priority < 0 && parent_priority < priority)
            {
                continue;
            }

            tracking.insert(canonical.clone(), priority);

            if is_synthetic {
                has_default_route_auto = true;
            } else {
                search.push(domain_full);
                if canonical.is_empty() {
                    has_default_route_explicit = true;
                }
            }
        }

        let has_default_route_exclusive =
            has_default_route_explicit || (priority < 0 && has_default_route_auto);
        let has_default_route = has_default_route_exclusive || has_default_route_auto;

        let reverse = build_reverse_domains(family, &snapshot);

        let merged = MergedDomains {
            search,
            reverse,
            has_default_route,
            has_default_route_exclusive,
            has_default_route_explicit,
        };
        merged.check_invariant();

        store.get_mut(id).expect("id came from sorted_ids").merged_domains = Some(merged);
    }
}

/// Spec §4.2 "Clear step": wipe every `merged_domains` so that no stale
/// pointer into producer-owned memory can outlive the cycle.
pub fn clear(store: &mut EntryStore, sorted_ids: &[EntryId]) {
    for &id in sorted_ids {
        if let Some(entry) = store.get_mut(id) {
            entry.merged_domains = None;
        }
    }
}
