//! Component A — the IP-config entry store.
//!
//! Owns every live [`IpEntry`], the per-interface buckets they belong to,
//! the best-per-family slots, and the lazily-sorted precedence list. See
//! spec.md §4.1.

use crate::entry::{EntryId, IpConfigType, IpEntry, SourceTag};
use crate::error::DnsError;
use crate::family::Family;
use crate::hostname::extract_host_domain;
use crate::snapshot::IpConfigSnapshot;
use std::collections::HashMap;

#[derive(Default)]
pub struct EntryStore {
    entries: HashMap<EntryId, IpEntry>,
    next_id: u64,
    /// ifindex -> entries of that interface. A bucket is "destroyed" simply
    /// by removing its (now-empty) key, matching spec §3's "Interface
    /// bucket ... destroyed when its list becomes empty".
    buckets: HashMap<i32, Vec<EntryId>>,
    best: [Option<EntryId>; 2],
    dirty: bool,
    sorted_cache: Vec<EntryId>,
    /// Stack of open batch labels, innermost last. Spec §4.1 `begin_updates`/
    /// `end_updates` nest and balance by label: callers must close in the
    /// reverse order they opened, each with the label it opened.
    batch_labels: Vec<String>,
    batch_changed: bool,
    host_domain: Option<String>,
}

impl EntryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc_id(&mut self) -> EntryId {
        let id = EntryId(self.next_id);
        self.next_id += 1;
        id
    }

    fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    fn bucket_remove(&mut self, ifindex: i32, id: EntryId) {
        if let Some(list) = self.buckets.get_mut(&ifindex) {
            list.retain(|&e| e != id);
            if list.is_empty() {
                self.buckets.remove(&ifindex);
            }
        }
    }

    fn destroy_entry(&mut self, id: EntryId) {
        if let Some(entry) = self.entries.remove(&id) {
            self.bucket_remove(entry.ifindex(), id);
            for slot in &mut self.best {
                if *slot == Some(id) {
                    *slot = None;
                }
            }
            self.mark_dirty();
        }
    }

    /// Demote the current best-per-family holder (if any) back to
    /// `Default`, then install `id` as the new holder. Spec §3 invariant 3:
    /// "`best-device` is unique per address family."
    fn set_best_slot(&mut self, family: Family, id: EntryId) {
        let idx = family.index();
        if let Some(prev) = self.best[idx] {
            if prev != id {
                if let Some(prev_entry) = self.entries.get_mut(&prev) {
                    prev_entry.ip_config_type = IpConfigType::Default;
                }
            }
        }
        self.best[idx] = Some(id);
    }

    /// Spec §4.1 `set_ip_config`. Returns whether anything changed.
    pub fn set_ip_config(
        &mut self,
        addr_family: Family,
        source_tag: SourceTag,
        snapshot: Option<IpConfigSnapshot>,
        ip_config_type: IpConfigType,
        replace_all: bool,
    ) -> Result<bool, DnsError> {
        if ip_config_type != IpConfigType::Removed && snapshot.is_none() {
            return Err(DnsError::bad_input(
                "type != removed requires a non-null snapshot",
            ));
        }

        let removing = ip_config_type == IpConfigType::Removed || snapshot.is_none();

        // Candidates matching (source_tag, addr_family): when we have a
        // snapshot we only need to look in its own interface's bucket;
        // when removing with no snapshot we must scan every bucket.
        let candidate_ids: Vec<EntryId> = match &snapshot {
            Some(s) => self
                .buckets
                .get(&s.ifindex())
                .into_iter()
                .flatten()
                .copied()
                .collect(),
            None => self.entries.keys().copied().collect(),
        };

        let mut keep: Option<EntryId> = None;
        let mut changed = false;

        for id in candidate_ids {
            let Some(entry) = self.entries.get(&id) else {
                continue;
            };
            if entry.source_tag != source_tag || entry.addr_family != addr_family {
                continue;
            }

            let is_identical_instance = snapshot
                .as_ref()
                .is_some_and(|s| entry.snapshot.is_same_instance(s));

            if is_identical_instance && keep.is_none() {
                keep = Some(id);
                continue;
            }

            let should_remove = removing
                || replace_all
                || !snapshot
                    .as_ref()
                    .is_some_and(|s| entry.snapshot.dns_semantically_equal(s));

            if should_remove {
                self.destroy_entry(id);
                changed = true;
            }
        }

        if removing {
            return Ok(changed);
        }
        let snapshot = snapshot.expect("checked above");

        if let Some(id) = keep {
            let entry = self.entries.get_mut(&id).expect("just looked up");
            if entry.ip_config_type != ip_config_type {
                entry.ip_config_type = ip_config_type;
                changed = true;
            }
            if ip_config_type == IpConfigType::BestDevice {
                self.set_best_slot(addr_family, id);
            }
            if changed {
                self.mark_dirty();
            }
            return Ok(changed);
        }

        // No entry survived to be refreshed: create one, but only if the
        // snapshot actually carries a priority (spec §3 invariant 2).
        if snapshot.dns_priority() == 0 {
            return Ok(changed);
        }

        let id = self.alloc_id();
        let ifindex = snapshot.ifindex();
        self.entries.insert(
            id,
            IpEntry::new(snapshot, source_tag, addr_family, ip_config_type),
        );
        self.buckets.entry(ifindex).or_default().push(id);
        if ip_config_type == IpConfigType::BestDevice {
            self.set_best_slot(addr_family, id);
        }
        self.mark_dirty();
        Ok(true)
    }

    /// Spec §4.1 `set_hostname`. Returns whether the stored host domain
    /// changed (callers use this, together with `skip_update` and whether a
    /// batch is open, to decide whether to run an update cycle).
    pub fn set_hostname(&mut self, hostname: Option<&str>) -> bool {
        let new_domain = extract_host_domain(hostname);
        if new_domain != self.host_domain {
            self.host_domain = new_domain;
            true
        } else {
            false
        }
    }

    pub fn host_domain(&self) -> Option<&str> {
        self.host_domain.as_deref()
    }

    /// Batch bracket, spec §4.1. `label` identifies the caller so nested
    /// opens/closes from independent callers can be validated against each
    /// other rather than only tracked as a bare depth counter. Returns the
    /// new nesting depth.
    pub fn begin_updates(&mut self, label: impl Into<String>) -> u32 {
        self.batch_labels.push(label.into());
        self.batch_labels.len() as u32
    }

    /// Balances a `begin_updates(label)`. `label` must match the innermost
    /// still-open bracket; a mismatch means callers unbalanced their own
    /// nesting (e.g. closing in the wrong order) and is logged rather than
    /// silently accepted, matching the spec's "nesting allowed" but not
    /// "nesting unchecked". Returns `Some(changed)` once the outermost
    /// bracket closes, where `changed` says whether any mutation happened
    /// during the batch and callers should therefore run one update cycle.
    /// Returns `None` while still nested.
    pub fn end_updates(&mut self, label: &str) -> Option<bool> {
        match self.batch_labels.pop() {
            Some(open) if open == label => {}
            Some(open) => {
                tracing::warn!(
                    expected = %open,
                    got = %label,
                    "end_updates label does not match the innermost begin_updates"
                );
            }
            None => {
                tracing::warn!(label, "end_updates without a matching begin_updates");
            }
        }
        if self.batch_labels.is_empty() {
            Some(std::mem::take(&mut self.batch_changed))
        } else {
            None
        }
    }

    pub fn in_batch(&self) -> bool {
        !self.batch_labels.is_empty()
    }

    /// Callers use this instead of directly tracking "did anything change"
    /// when a batch is open: record the change so `end_updates` knows to
    /// fire one cycle.
    pub fn note_batch_change(&mut self) {
        if self.in_batch() {
            self.batch_changed = true;
        }
    }

    /// Lazily re-sorts (if dirty) and returns the precedence list: ascending
    /// priority, descending `ip_config_type`, stable on ties. Spec §4.1
    /// "Sorting algorithm".
    pub fn sorted_ids(&mut self) -> &[EntryId] {
        if self.dirty {
            self.sorted_cache = self.entries.keys().copied().collect();
            self.sorted_cache.sort_by(|&a, &b| {
                let ea = &self.entries[&a];
                let eb = &self.entries[&b];
                ea.priority()
                    .cmp(&eb.priority())
                    .then_with(|| eb.ip_config_type.cmp(&ea.ip_config_type))
            });
            self.dirty = false;
        }
        &self.sorted_cache
    }

    pub fn get(&self, id: EntryId) -> Option<&IpEntry> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: EntryId) -> Option<&mut IpEntry> {
        self.entries.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn best_slot(&self, family: Family) -> Option<EntryId> {
        self.best[family.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::Ternary;
    use std::net::IpAddr;

    fn snap(ifindex: i32, ns: &str, prio: i32) -> IpConfigSnapshot {
        IpConfigSnapshot::new(
            ifindex,
            None,
            vec![ns.parse::<IpAddr>().unwrap()],
            vec![],
            vec![],
            vec![],
            Ternary::Unset,
            prio,
            false,
            vec![],
            vec![],
        )
    }

    #[test]
    fn zero_priority_is_dropped() {
        let mut store = EntryStore::new();
        let changed = store
            .set_ip_config(
                Family::V4,
                SourceTag(1),
                Some(snap(2, "1.1.1.1", 0)),
                IpConfigType::Default,
                false,
            )
            .unwrap();
        assert!(!changed);
        assert!(store.is_empty());
    }

    #[test]
    fn precedence_sort_priority_then_type() {
        let mut store = EntryStore::new();
        store
            .set_ip_config(
                Family::V4,
                SourceTag(1),
                Some(snap(2, "1.1.1.1", 100)),
                IpConfigType::Default,
                false,
            )
            .unwrap();
        store
            .set_ip_config(
                Family::V4,
                SourceTag(2),
                Some(snap(3, "8.8.8.8", 50)),
                IpConfigType::Default,
                false,
            )
            .unwrap();
        let sorted = store.sorted_ids().to_vec();
        assert_eq!(sorted.len(), 2);
        assert_eq!(store.get(sorted[0]).unwrap().priority(), 50);
        assert_eq!(store.get(sorted[1]).unwrap().priority(), 100);
    }

    #[test]
    fn best_device_unique_per_family() {
        let mut store = EntryStore::new();
        store
            .set_ip_config(
                Family::V4,
                SourceTag(1),
                Some(snap(2, "1.1.1.1", 100)),
                IpConfigType::BestDevice,
                false,
            )
            .unwrap();
        store
            .set_ip_config(
                Family::V4,
                SourceTag(2),
                Some(snap(3, "8.8.8.8", 100)),
                IpConfigType::BestDevice,
                false,
            )
            .unwrap();
        let best_holder = store.best_slot(Family::V4).unwrap();
        let count = store
            .entries
            .values()
            .filter(|e| e.ip_config_type == IpConfigType::BestDevice)
            .count();
        assert_eq!(count, 1);
        assert_eq!(store.get(best_holder).unwrap().snapshot.ifindex(), 3);
    }

    #[test]
    fn removing_last_entry_destroys_bucket() {
        let mut store = EntryStore::new();
        store
            .set_ip_config(
                Family::V4,
                SourceTag(1),
                Some(snap(2, "1.1.1.1", 100)),
                IpConfigType::Default,
                false,
            )
            .unwrap();
        assert!(store.buckets.contains_key(&2));
        store
            .set_ip_config(
                Family::V4,
                SourceTag(1),
                None,
                IpConfigType::Removed,
                false,
            )
            .unwrap();
        assert!(!store.buckets.contains_key(&2));
        assert!(store.is_empty());
    }

    #[test]
    fn no_op_same_snapshot_same_type() {
        let mut store = EntryStore::new();
        let s = snap(2, "1.1.1.1", 100);
        store
            .set_ip_config(
                Family::V4,
                SourceTag(1),
                Some(s.clone()),
                IpConfigType::Default,
                false,
            )
            .unwrap();
        let changed = store
            .set_ip_config(
                Family::V4,
                SourceTag(1),
                Some(s),
                IpConfigType::Default,
                false,
            )
            .unwrap();
        assert!(!changed);
    }

    #[test]
    fn nested_batches_balance_by_label() {
        let mut store = EntryStore::new();
        store.begin_updates("outer");
        store.begin_updates("inner");
        assert!(store.in_batch());
        assert_eq!(store.end_updates("inner"), None);
        assert!(store.in_batch());
        assert_eq!(store.end_updates("outer"), Some(false));
        assert!(!store.in_batch());
    }

    #[test]
    fn mismatched_label_still_pops_but_is_logged() {
        let mut store = EntryStore::new();
        store.begin_updates("outer");
        // Closing with the wrong label is a caller bug; we still pop the
        // bracket (so a later correctly-labeled `end_updates` isn't left
        // permanently nested) but only after warning.
        assert_eq!(store.end_updates("wrong"), Some(false));
        assert!(!store.in_batch());
    }
}
