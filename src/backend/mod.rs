//! Component D — the back-end contract every resolver integration
//! implements, plus the two concrete families of back-end. See spec.md
//! §4.4 "Back-end interface".

pub mod cache;
pub mod file;

use crate::entry::IpEntry;
use crate::file_mode::ResolverFileMode;
use async_trait::async_trait;
use sha1::Sha1;
use std::net::IpAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// What an update cycle hands to a back-end once the merge engine has run.
/// Mirrors the `NMDnsIPConfigData` array the original passes to
/// `plugin_update()`, minus the parts (raw snapshot pointers) that only
/// make sense with GObject reference counting.
#[derive(Debug, Clone)]
pub struct UpdateData<'a> {
    pub entries: &'a [&'a IpEntry],
    pub host_domain: Option<&'a str>,
    pub global: Option<&'a crate::snapshot::GlobalDnsConfig>,
    /// Whether the local-cache back-end (E) succeeded this cycle, already
    /// run before F per the fixed ordering (spec §5 "Back-end update
    /// ordering").
    pub caching_successful: bool,
    /// Whether `systemd-resolved` specifically is the in-use caching
    /// back-end, which changes the loopback substitution address (spec
    /// §4.6 "Caching substitution": `127.0.0.53` vs. `127.0.0.1`).
    pub resolved_in_use: bool,
    /// Whether the resolver itself depends on this daemon staying up (e.g.
    /// it was pointed at a loopback stub); gates the restore-on-`stop`
    /// behavior in F (spec §4.6 "Shutdown").
    pub resolver_depends_on_daemon: bool,
}

/// A resolver integration: systemd-resolved, dnsmasq, or the flat-file
/// back-end. Object-safe so [`crate::manager::DnsManager`] can hold a
/// `Vec<Box<dyn Backend>>` of mixed concrete types, the way the teacher's
/// D-Bus and process-management code is reached through a trait object at
/// the call site (`dns_control/linux.rs`).
#[async_trait]
pub trait Backend: Send + Sync {
    /// Stable, lowercase name used in logs and in the observer's
    /// `configuration` dump. E.g. `"systemd-resolved"`, `"dnsmasq"`, `"file"`.
    fn name(&self) -> &'static str;

    /// Whether this back-end runs a local caching resolver, i.e. whether
    /// `/etc/resolv.conf` (when this back-end also owns the file) should
    /// point at `127.0.0.1` instead of the real upstream servers.
    fn is_caching(&self) -> bool;

    /// Feeds this back-end's view of `entry` into the running fingerprint
    /// hash (spec §4.3, step 2). Back-ends that only care about a subset of
    /// an entry's fields (e.g. the cache back-end ignores reverse domains
    /// the file back-end would include) hash only that subset, which is
    /// exactly why the hash is computed per back-end rather than once
    /// globally.
    fn contribute_fingerprint(&self, entry: &IpEntry, hasher: &mut Sha1);

    /// Pushes `data` to the resolver. Returns `Ok(())` on success; a
    /// transient failure (D-Bus not up yet, helper busy) is a
    /// [`crate::error::DnsError::BackendTransient`], a hard failure a
    /// [`crate::error::DnsError::BackendFailed`] — `update_dns()` uses the
    /// distinction to decide whether to keep `update_to_do` set for retry.
    async fn update(&mut self, data: &UpdateData<'_>) -> anyhow::Result<()>;

    /// Tears down whatever state `update` established, e.g. restoring the
    /// resolver file to its pre-managed contents. Called once, from
    /// `DnsManager::stop`.
    async fn stop(&mut self) -> anyhow::Result<()>;

    /// Whether this back-end has outstanding asynchronous work (e.g. a
    /// D-Bus call in flight) that the update-pending watchdog should wait
    /// out before reporting steady state.
    fn update_pending(&self) -> bool {
        false
    }

    /// A shared handle to this back-end's own pending flag, if it has one.
    /// Fetched once up front (before `update()` is called) so the manager
    /// can poll it *while* `update()` is in flight without needing a second
    /// `&self` borrow alongside `update`'s `&mut self` one — a back-end that
    /// only ever flips its flag from inside `update()` would otherwise never
    /// be observed as pending by a caller that only checks after `update()`
    /// returns.
    fn pending_flag(&self) -> Option<Arc<AtomicBool>> {
        None
    }

    /// Downcasts to the concrete systemd-resolved back-end, used by
    /// [`crate::manager::DnsManager::get_systemd_resolved`] to share the
    /// D-Bus connection with external connectivity probing (spec.md §2).
    /// `None` for every back-end except [`cache::SystemdResolvedBackend`]
    /// itself.
    fn as_systemd_resolved(&self) -> Option<&cache::SystemdResolvedBackend> {
        None
    }
}

/// Loopback address the caching back-ends point `/etc/resolv.conf` at.
pub const LOOPBACK_NAMESERVER: IpAddr = IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);

/// Resolver-file mode a file-writing back-end needs, used by
/// [`crate::manager::DnsManager`] to pick between [`cache`] and [`file`]
/// back-ends at start-up per spec §4.7.
pub fn requires_file_ownership(mode: ResolverFileMode) -> bool {
    !matches!(
        mode,
        ResolverFileMode::Unmanaged | ResolverFileMode::Immutable
    )
}
