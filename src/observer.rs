//! Read-only property-bag projection for external (e.g. D-Bus) exposure.
//! See spec.md §6 "Observer property bag" and §9 "D-Bus property bag":
//! regenerated lazily on access, never mutated directly.

use crate::entry::{EntryId, IpConfigType};
use crate::file_mode::ResolverFileMode;
use crate::snapshot::GlobalDnsConfig;
use crate::store::EntryStore;
use serde::Serialize;

/// Fixed priority synthesized entries from the global DNS config are
/// reported at, preceding real entries in `configuration`.
pub const GLOBAL_CONFIG_PRIORITY: i32 = i32::MIN;

#[derive(Debug, Clone, Serialize)]
pub struct ConfigurationEntry {
    pub nameservers: Vec<String>,
    pub domains: Vec<String>,
    pub interface: Option<String>,
    pub priority: i32,
    pub vpn: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub mode: String,
    pub rc_manager: String,
    pub configuration: Vec<ConfigurationEntry>,
    pub update_pending: bool,
}

fn global_configuration_entries(global: &GlobalDnsConfig) -> Vec<ConfigurationEntry> {
    global
        .domains
        .iter()
        .map(|(domain, d)| ConfigurationEntry {
            nameservers: d.servers.iter().map(ToString::to_string).collect(),
            domains: vec![domain.clone()],
            interface: None,
            priority: GLOBAL_CONFIG_PRIORITY,
            vpn: false,
        })
        .collect()
}

fn entry_configuration(store: &EntryStore, id: EntryId) -> Option<ConfigurationEntry> {
    let entry = store.get(id)?;
    if entry.snapshot.nameservers().is_empty() {
        return None;
    }
    let mut domains: Vec<String> = entry.snapshot.search().to_vec();
    if domains.is_empty() {
        domains = entry.snapshot.domains().to_vec();
    }
    Some(ConfigurationEntry {
        nameservers: entry
            .snapshot
            .nameservers()
            .iter()
            .map(ToString::to_string)
            .collect(),
        domains,
        interface: entry.snapshot.ifname().map(str::to_string),
        priority: entry.priority(),
        vpn: entry.ip_config_type == IpConfigType::Vpn,
    })
}

/// Builds a fresh [`Snapshot`] from current state. Cheap enough to call on
/// every property read; there is no cached copy to invalidate.
pub fn build(
    mode: &str,
    rc_manager: ResolverFileMode,
    store: &EntryStore,
    sorted_ids: &[EntryId],
    global: Option<&GlobalDnsConfig>,
    update_pending: bool,
) -> Snapshot {
    let mut configuration = global.map(global_configuration_entries).unwrap_or_default();
    configuration.extend(sorted_ids.iter().filter_map(|&id| entry_configuration(store, id)));

    Snapshot {
        mode: mode.to_string(),
        rc_manager: rc_manager.to_string(),
        configuration,
        update_pending,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{IpConfigType as T, SourceTag};
    use crate::family::Family;
    use crate::snapshot::{IpConfigSnapshot, Ternary};

    #[test]
    fn serializes_mode_and_rc_manager_as_lowercase_strings() {
        let store = EntryStore::new();
        let snap = build(
            "default",
            ResolverFileMode::Symlink,
            &store,
            &[],
            None,
            false,
        );
        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("\"mode\":\"default\""));
        assert!(json.contains("\"rc_manager\":\"symlink\""));
    }

    #[test]
    fn entries_without_nameservers_are_skipped() {
        let mut store = EntryStore::new();
        store
            .set_ip_config(
                Family::V4,
                SourceTag(1),
                Some(IpConfigSnapshot::new(
                    2,
                    None,
                    vec!["1.1.1.1".parse().unwrap()],
                    vec![],
                    vec![],
                    vec![],
                    Ternary::Unset,
                    100,
                    false,
                    vec![],
                    vec![],
                )),
                T::Default,
                false,
            )
            .unwrap();
        let sorted = store.sorted_ids().to_vec();
        let snap = build("default", ResolverFileMode::Symlink, &store, &sorted, None, false);
        assert_eq!(snap.configuration.len(), 1);
    }
}
