//! The top-level `DnsManager`, tying components A–G together. See spec.md
//! §2 "Data flow" and §5 "Ordering guarantees".

use crate::backend::{
    cache::{DnsmasqBackend, SystemdResolvedBackend},
    file::FileBackend,
    Backend, UpdateData,
};
use crate::config::{DnsMode, Settings};
use crate::entry::{EntryId, IpConfigType, SourceTag};
use crate::error::DnsError;
use crate::family::FamilySelector;
use crate::file_mode::{self, ResolveInputs, ResolverFileMode};
use crate::fingerprint::{self, BackendRecord, Fingerprint};
use crate::merge;
use crate::observer::{self, Snapshot};
use crate::snapshot::{GlobalDnsConfig, IpConfigSnapshot};
use crate::store::EntryStore;
use crate::watchdog::{Watchdog, T_UPDATE_PENDING};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct BackendSlot {
    backend: Box<dyn Backend>,
    record: BackendRecord,
    watchdog: Watchdog,
    was_pending: bool,
    /// The back-end's own pending-flag handle, fetched once up front (spec
    /// §4.4) so it can be polled while `update()` is in flight rather than
    /// only after it resolves.
    pending_handle: Option<Arc<AtomicBool>>,
}

impl BackendSlot {
    fn new(backend: Box<dyn Backend>) -> Self {
        let name = backend.name();
        let pending_handle = backend.pending_flag();
        Self {
            backend,
            record: BackendRecord::default(),
            watchdog: Watchdog::new(name),
            was_pending: false,
            pending_handle,
        }
    }

    fn observe_pending(&mut self) {
        let is_pending = self.backend.update_pending();
        self.watchdog.observe(self.was_pending, is_pending);
        self.was_pending = is_pending;
    }

    /// Runs `backend.update(data)`, polling the back-end's pending-flag
    /// handle (if it has one) concurrently with the in-flight call. Without
    /// this, a back-end that flips its flag true→false entirely inside
    /// `update()` would never be observed as pending by a caller that only
    /// checks after `update()` returns, and the watchdog's `arm()` path
    /// would be unreachable for a genuinely slow back-end.
    async fn run_update(&mut self, data: &UpdateData<'_>) -> anyhow::Result<()> {
        let Some(flag) = self.pending_handle.clone() else {
            let result = self.backend.update(data).await;
            self.observe_pending();
            return result;
        };

        let update = self.backend.update(data);
        tokio::pin!(update);
        let mut poll = tokio::time::interval(T_UPDATE_PENDING / 4);
        poll.tick().await;
        loop {
            tokio::select! {
                result = &mut update => {
                    self.observe_pending();
                    return result;
                }
                _ = poll.tick() => {
                    let is_pending = flag.load(Ordering::SeqCst);
                    self.watchdog.observe(self.was_pending, is_pending);
                    self.was_pending = is_pending;
                }
            }
        }
    }

    /// External view: the back-end's own flag, unless the watchdog has
    /// latched it false for misbehaving past `T_UPDATE_PENDING` (spec
    /// §4.4).
    fn external_update_pending(&self) -> bool {
        self.backend.update_pending() && !self.watchdog.expired()
    }
}

/// Public entry point for the whole crate: owns the entry store, the
/// resolved file mode, and the back-end slots, and orchestrates one update
/// cycle per spec §2's data-flow description.
pub struct DnsManager {
    store: EntryStore,
    settings: Settings,
    mode: ResolverFileMode,
    cache_slot: Option<BackendSlot>,
    file_slot: BackendSlot,
    global: Option<GlobalDnsConfig>,
    set_update_flags: bool,
}

impl DnsManager {
    pub fn new(settings: Settings) -> Self {
        let mode = Self::resolve_mode(&settings);

        let cache_slot: Option<BackendSlot> = match settings.mode {
            DnsMode::SystemdResolved => Some(BackendSlot::new(Box::new(
                SystemdResolvedBackend::new(),
            ))),
            DnsMode::Dnsmasq => Some(BackendSlot::new(Box::new(DnsmasqBackend::new(
                settings.dnsmasq_binary.clone(),
                settings.runtime_dir.join("dnsmasq.conf"),
            )))),
            _ => None,
        };

        let file_config = crate::backend::file::FileBackendConfig {
            system_path: settings.system_resolv_conf_path.clone(),
            private_copy_path: settings.runtime_dir.join("resolv.conf"),
            no_stub_private_copy_path: settings.runtime_dir.join("no-stub-resolv.conf"),
            resolvconf_binary: settings.resolvconf_binary.clone(),
            netconfig_binary: settings.netconfig_binary.clone(),
        };
        let file_slot = BackendSlot::new(Box::new(FileBackend::new(file_config, mode)));

        Self {
            store: EntryStore::new(),
            settings,
            mode,
            cache_slot,
            file_slot,
            global: None,
            // First cycle after construction only seeds fingerprints; spec
            // §4.3 "startup seeding" keeps `update_to_do` clear so nothing
            // is pushed before a real change arrives.
            set_update_flags: false,
        }
    }

    fn resolve_mode(settings: &Settings) -> ResolverFileMode {
        file_mode::resolve(&ResolveInputs {
            rc_manager: settings.rc_manager,
            mode_is_systemd_resolved_or_dnsconfd: settings.mode.is_systemd_resolved_or_dnsconfd(),
            resolv_conf_path: &settings.system_resolv_conf_path,
            resolvconf_binary: Some(&settings.resolvconf_binary),
            netconfig_binary: Some(&settings.netconfig_binary),
        })
    }

    pub fn set_global_dns_config(&mut self, config: Option<GlobalDnsConfig>) {
        self.global = config;
        if self.store.in_batch() {
            self.store.note_batch_change();
        } else {
            self.run_update_cycle_sync();
        }
    }

    /// Spec §6 "Set operation". `family` may be `UNSPEC`, fanning out into
    /// one call per concrete family.
    pub fn set_ip_config(
        &mut self,
        family: FamilySelector,
        source_tag: SourceTag,
        snapshot: Option<IpConfigSnapshot>,
        ip_config_type: IpConfigType,
        replace_all: bool,
    ) -> Result<bool, DnsError> {
        let mut changed = false;
        for &f in family.families() {
            let family_changed = self.store.set_ip_config(
                f,
                source_tag,
                snapshot.clone(),
                ip_config_type,
                replace_all,
            )?;
            changed |= family_changed;
        }

        if changed {
            if self.store.in_batch() {
                self.store.note_batch_change();
            } else {
                // Outside a batch, a change triggers exactly one update
                // cycle synchronously before returning (spec §5).
                self.run_update_cycle_sync();
            }
        }
        Ok(changed)
    }

    /// Spec §6 "Set hostname".
    pub fn set_hostname(&mut self, hostname: Option<&str>, skip_update: bool) {
        let changed = self.store.set_hostname(hostname);
        if changed && !skip_update {
            if self.store.in_batch() {
                self.store.note_batch_change();
            } else {
                self.run_update_cycle_sync();
            }
        }
    }

    /// Spec §4.1 `begin_updates(label)`. `label` identifies the caller so
    /// independent nested callers can be validated against each other
    /// rather than collapsed into a bare depth counter.
    pub fn begin_updates(&mut self, label: &str) {
        self.store.begin_updates(label);
    }

    /// Balances `begin_updates(label)`; runs exactly one update cycle once
    /// the outermost bracket closes, if anything changed during the batch.
    pub fn end_updates(&mut self, label: &str) {
        if let Some(changed) = self.store.end_updates(label) {
            if changed {
                self.run_update_cycle_sync();
            }
        }
    }

    fn run_update_cycle_sync(&mut self) {
        let handle = tokio::runtime::Handle::try_current();
        match handle {
            Ok(handle) => {
                // We are already inside a runtime (the common case for a
                // daemon driven by an async event loop): block this thread
                // on the cycle, matching the synchronous contract of
                // `set_ip_config`/`end_updates` in spec §5.
                tokio::task::block_in_place(|| handle.block_on(self.update_dns()));
            }
            Err(_) => {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed to build a fallback single-threaded runtime");
                rt.block_on(self.update_dns());
            }
        }
    }

    /// Runs one full update cycle: merge, fingerprint, push to back-ends in
    /// fixed order (local-cache then file/helper), clear. Never panics and
    /// never propagates a per-back-end error out (spec §7 "Propagation
    /// policy"); those are logged and folded into the summary result.
    pub async fn update_dns(&mut self) -> anyhow::Result<()> {
        let span = tracing::info_span!("update_dns");
        let _enter = span.enter();

        let sorted_ids: Vec<EntryId> = self.store.sorted_ids().to_vec();
        merge::run(&mut self.store, &sorted_ids);

        let entries: Vec<&crate::entry::IpEntry> = sorted_ids
            .iter()
            .filter_map(|&id| self.store.get(id))
            .collect();
        let host_domain = self.store.host_domain().map(str::to_string);

        let mut caching_successful = false;
        let mut had_error = false;

        if let Some(slot) = &mut self.cache_slot {
            let fp = fingerprint_for(slot.backend.as_ref(), self.global.as_ref(), &self.store, &sorted_ids);
            slot.record.observe(fp, self.set_update_flags);
            if slot.record.update_to_do {
                let data = UpdateData {
                    entries: &entries,
                    host_domain: host_domain.as_deref(),
                    global: self.global.as_ref(),
                    caching_successful: false,
                    resolved_in_use: false,
                    resolver_depends_on_daemon: false,
                };
                match slot.run_update(&data).await {
                    Ok(()) => {
                        slot.record.clear_update_to_do();
                        caching_successful = true;
                    }
                    Err(e) => {
                        tracing::warn!(backend = slot.backend.name(), error = %e, "backend update failed");
                        had_error = true;
                    }
                }
            } else {
                slot.observe_pending();
            }
        }

        let resolved_in_use = matches!(self.settings.mode, DnsMode::SystemdResolved);
        let resolver_depends_on_daemon = caching_successful;

        {
            let slot = &mut self.file_slot;
            let fp = fingerprint_for(slot.backend.as_ref(), self.global.as_ref(), &self.store, &sorted_ids);
            slot.record.observe(fp, self.set_update_flags);
            if slot.record.update_to_do || caching_successful {
                let data = UpdateData {
                    entries: &entries,
                    host_domain: host_domain.as_deref(),
                    global: self.global.as_ref(),
                    caching_successful,
                    resolved_in_use,
                    resolver_depends_on_daemon,
                };
                match slot.run_update(&data).await {
                    Ok(()) => slot.record.clear_update_to_do(),
                    Err(e) => {
                        tracing::warn!(backend = slot.backend.name(), error = %e, "backend update failed");
                        had_error = true;
                    }
                }
            } else {
                slot.observe_pending();
            }
        }

        merge::clear(&mut self.store, &sorted_ids);
        self.set_update_flags = true;

        if had_error {
            anyhow::bail!("one or more back-ends failed this update cycle");
        }
        Ok(())
    }

    pub async fn stop(&mut self) -> anyhow::Result<()> {
        if let Some(slot) = &mut self.cache_slot {
            slot.backend.stop().await?;
        }
        self.file_slot.backend.stop().await?;
        Ok(())
    }

    pub fn get_update_pending(&self) -> bool {
        self.cache_slot
            .as_ref()
            .map(|s| s.external_update_pending())
            .unwrap_or(false)
            || self.file_slot.external_update_pending()
    }

    /// Spec.md §2: lets external connectivity probing share the D-Bus
    /// connection this manager already holds, instead of opening its own.
    /// `None` unless the registered local-cache back-end is
    /// `systemd-resolved` and it has actually connected.
    pub fn get_systemd_resolved(&self) -> Option<&SystemdResolvedBackend> {
        self.cache_slot
            .as_ref()
            .and_then(|slot| slot.backend.as_systemd_resolved())
            .filter(|b| b.is_running())
    }

    pub fn observer_snapshot(&mut self) -> Snapshot {
        let sorted = self.store.sorted_ids().to_vec();
        observer::build(
            self.settings.mode.as_str(),
            self.mode,
            &self.store,
            &sorted,
            self.global.as_ref(),
            self.get_update_pending(),
        )
    }
}

fn fingerprint_for(
    backend: &dyn Backend,
    global: Option<&GlobalDnsConfig>,
    store: &EntryStore,
    sorted_ids: &[EntryId],
) -> Fingerprint {
    fingerprint::compute(backend, global, store, sorted_ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_mode::RcManagerSetting;
    use crate::snapshot::Ternary;

    fn test_settings(dir: &std::path::Path) -> Settings {
        Settings {
            mode: DnsMode::Default,
            rc_manager: RcManagerSetting::Unmanaged,
            system_resolv_conf_path: dir.join("resolv.conf"),
            resolvconf_binary: dir.join("resolvconf"),
            netconfig_binary: dir.join("netconfig"),
            dnsmasq_binary: dir.join("dnsmasq"),
            runtime_dir: dir.to_path_buf(),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn set_ip_config_outside_batch_runs_one_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = DnsManager::new(test_settings(dir.path()));
        let snapshot = IpConfigSnapshot::new(
            2,
            None,
            vec!["1.1.1.1".parse().unwrap()],
            vec!["corp.example".to_string()],
            vec![],
            vec![],
            Ternary::Unset,
            100,
            false,
            vec![],
            vec![],
        );
        let changed = manager
            .set_ip_config(
                FamilySelector::V4,
                SourceTag(1),
                Some(snapshot),
                IpConfigType::Default,
                false,
            )
            .unwrap();
        assert!(changed);
        assert!(dir.path().join("resolv.conf").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn batch_defers_update_until_end_updates() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = DnsManager::new(test_settings(dir.path()));
        manager.begin_updates("test");
        let snapshot = IpConfigSnapshot::new(
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
        );
        manager
            .set_ip_config(
                FamilySelector::V4,
                SourceTag(1),
                Some(snapshot),
                IpConfigType::Default,
                false,
            )
            .unwrap();
        assert!(!dir.path().join("resolv.conf").exists());
        manager.end_updates("test");
        assert!(dir.path().join("resolv.conf").exists());
    }
}
