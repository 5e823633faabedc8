//! Component F — the file/helper back-end. See spec.md §4.6.
//!
//! Merges every contributing entry into one flat resolver state, then
//! writes it out via whichever strategy [`crate::file_mode::ResolverFileMode`]
//! selected, plus an always-on private copy under the runtime directory.

use super::{Backend, UpdateData, LOOPBACK_NAMESERVER};
use crate::entry::IpEntry;
use crate::error::DnsError;
use crate::file_mode::ResolverFileMode;
use crate::snapshot::GlobalDnsConfig;
use anyhow::{bail, Context as _, Result};
use atomicwrites::{AtomicFile, OverwriteBehavior};
use sha1::{Digest, Sha1};
use std::io::Write as _;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt as _;
use tokio::process::Command;

const RESOLV_CONF_LINE_LIMIT: usize = 256;
const MAX_NAMESERVERS: usize = 3;

/// The merged, pre-formatting view of every contributing entry. Spec §4.6
/// "Flat-state assembly".
#[derive(Debug, Clone, Default)]
pub struct FlatState {
    pub nameservers: Vec<IpAddr>,
    pub searches: Vec<String>,
    pub options: Vec<String>,
    pub nis_domain: Option<String>,
    pub nis_servers: Vec<Ipv4Addr>,
}

fn dedup_preserve_order<T: PartialEq + Clone>(items: Vec<T>) -> Vec<T> {
    let mut out: Vec<T> = Vec::with_capacity(items.len());
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

fn entry_nameservers(entry: &IpEntry) -> Vec<IpAddr> {
    entry
        .snapshot
        .nameservers()
        .iter()
        .filter_map(|addr| match addr {
            IpAddr::V4(_) => Some(*addr),
            IpAddr::V6(v6) => {
                if let Some(v4) = v6.to_ipv4_mapped() {
                    Some(IpAddr::V4(v4))
                } else {
                    Some(IpAddr::V6(*v6))
                }
            }
        })
        .collect()
}

/// Assembles the flat resolver state for one update cycle. `global` bypasses
/// the per-entry loop entirely when it carries a wildcard domain (spec §4.6
/// "Global override").
pub fn assemble(
    sorted_entries: &[&IpEntry],
    global: Option<&GlobalDnsConfig>,
    host_domain: Option<&str>,
) -> FlatState {
    if let Some(global) = global {
        if let Some(wildcard) = global.wildcard() {
            return FlatState {
                nameservers: wildcard.servers.clone(),
                searches: dedup_preserve_order(global.search.clone()),
                options: dedup_preserve_order(global.options.clone()),
                nis_domain: None,
                nis_servers: vec![],
            };
        }
    }

    let contributing: Vec<&&IpEntry> = sorted_entries
        .iter()
        .filter(|e| !e.snapshot.nameservers().is_empty())
        .collect();

    // First-priority-negative rule (spec §4.6): a strongly negative first
    // contributor takes the resolver exclusively for its priority band.
    let kept: Vec<&&IpEntry> = match contributing.first() {
        Some(first) if first.priority() < 0 => {
            let p0 = first.priority();
            contributing
                .into_iter()
                .filter(|e| e.priority() == p0)
                .collect()
        }
        _ => contributing,
    };

    let mut nameservers = Vec::new();
    let mut searches = Vec::new();
    let mut options = Vec::new();
    let mut nis_domain = None;
    let mut nis_servers = Vec::new();
    let mut trust_ad_entries = 0usize;

    for &entry in &kept {
        for ns in entry_nameservers(entry) {
            match ns {
                IpAddr::V6(v6) if v6.is_unicast_link_local() => {
                    // %ifname scope is carried as a display-only suffix on
                    // the textual form written to the resolver file; the
                    // flat state keeps the bare address plus its scope.
                    nameservers.push(IpAddr::V6(v6));
                    let _ = entry.snapshot.ifname();
                }
                other => nameservers.push(other),
            }
        }
        if let Some(merged) = &entry.merged_domains {
            searches.extend(merged.search.iter().cloned());
        }
        for opt in entry.snapshot.options() {
            if opt == "trust-ad" {
                trust_ad_entries += 1;
            }
            options.push(opt.clone());
        }
        if nis_domain.is_none() {
            nis_domain = entry.snapshot.nis_domain().map(str::to_string);
        }
        if nis_servers.is_empty() {
            nis_servers = entry.snapshot.nis_servers().to_vec();
        }
    }

    if let Some(domain) = host_domain {
        searches.push(domain.to_string());
    }
    if let Some(global) = global {
        searches.extend(global.search.iter().cloned());
        options.extend(global.options.iter().cloned());
    }

    if !kept.is_empty() && trust_ad_entries == kept.len() && !options.iter().any(|o| o == "trust-ad") {
        options.push("trust-ad".to_string());
    }

    FlatState {
        nameservers: dedup_preserve_order(nameservers),
        searches: dedup_preserve_order(searches),
        options: dedup_preserve_order(options),
        nis_domain,
        nis_servers,
    }
}

/// Spec §4.6 "Caching substitution": once the local-cache back-end has
/// confirmed success, the servers presented to every write strategy become
/// a single loopback address.
pub fn apply_caching_substitution(flat: &mut FlatState, resolved_in_use: bool) {
    let loopback = if resolved_in_use {
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, 53))
    } else {
        LOOPBACK_NAMESERVER
    };
    flat.nameservers = vec![loopback];

    let has_sentinel = |s: &str| flat.options.iter().any(|o| o == s);
    if !has_sentinel("_no_edns0") && !flat.options.iter().any(|o| o == "edns0") {
        flat.options.push("edns0".to_string());
    }
    if !has_sentinel("_no_trust_ad") && !flat.options.iter().any(|o| o == "trust-ad") {
        flat.options.push("trust-ad".to_string());
    }
}

/// Formats the resolver-file body. Spec §4.6 "Resolver-file formatting
/// rules" / §6 "System resolver file format".
pub fn format_resolver_file(flat: &FlatState) -> String {
    let mut out = String::from("# Generated by the DNS resolution-plane manager\n");

    if !flat.searches.is_empty() {
        let mut line = String::from("search");
        for domain in &flat.searches {
            let candidate = format!("{line} {domain}");
            if candidate.len() > RESOLV_CONF_LINE_LIMIT {
                out.push_str(&line);
                // Pad to the boundary so truncation by a libc resolver
                // reading a fixed-size buffer lands between entries rather
                // than mid-domain.
                out.push_str(&" ".repeat(RESOLV_CONF_LINE_LIMIT.saturating_sub(line.len())));
                out.push('\n');
                line = format!("search {domain}");
            } else {
                line = candidate;
            }
        }
        out.push_str(&line);
        out.push('\n');
    }

    for (i, ns) in flat.nameservers.iter().enumerate() {
        if i == MAX_NAMESERVERS {
            out.push_str("# NOTE: the libc resolver only honors the first 3 nameserver lines\n");
        }
        out.push_str(&format!("nameserver {ns}\n"));
    }

    let visible_options: Vec<&String> = flat
        .options
        .iter()
        .filter(|o| !o.starts_with('_'))
        .collect();
    if !visible_options.is_empty() {
        out.push_str("options");
        for opt in visible_options {
            out.push(' ');
            out.push_str(opt);
        }
        out.push('\n');
    }

    out
}

fn netconfig_payload(flat: &FlatState) -> String {
    let searches = flat.searches.join(" ");
    let servers = flat
        .nameservers
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(" ");
    let nis_domain = flat.nis_domain.clone().unwrap_or_default();
    let nis_servers = flat
        .nis_servers
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        "INTERFACE='NetworkManager'\nDNSSEARCH='{searches}'\nDNSSERVERS='{servers}'\nNISDOMAIN='{nis_domain}'\nNISSERVERS='{nis_servers}'\n"
    )
}

/// Writes `body` via `AtomicFile`, so an inotify watcher on the target never
/// observes a half-written file.
fn write_atomic(path: &Path, body: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    AtomicFile::new(path, OverwriteBehavior::AllowOverwrite)
        .write(|f| f.write_all(body.as_bytes()))
        .map_err(|e| match e {
            atomicwrites::Error::Internal(e) => e,
            atomicwrites::Error::User(e) => e,
        })
}

/// Read-modify-write of an existing resolver file via `resolv_conf`, the way
/// `etc_resolv_conf.rs::configure_at_paths` parses the file already at
/// `/etc/resolv.conf`, overwrites only the fields this crate owns, and
/// re-emits the rest untouched (`ndots`, `sortlist`, operator comments we
/// don't otherwise model).
fn render_via_resolv_conf(existing_path: &Path, flat: &FlatState) -> String {
    let existing_text = std::fs::read_to_string(existing_path).unwrap_or_default();
    let mut config = resolv_conf::Config::parse(&existing_text).unwrap_or_default();
    config.nameservers = flat.nameservers.iter().map(|addr| (*addr).into()).collect();
    config.set_search(flat.searches.clone());
    config.to_string()
}

async fn run_helper_with_stdin(binary: &Path, args: &[&str], stdin_body: &str) -> Result<()> {
    let mut child = Command::new(binary)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("failed to spawn {}", binary.display()))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(stdin_body.as_bytes())
            .await
            .context("failed to write helper stdin")?;
    }

    let status = tokio::time::timeout(std::time::Duration::from_secs(1), child.wait())
        .await
        .context("helper process timed out")?
        .context("failed to wait for helper process")?;

    if !status.success() {
        bail!("{} exited with {status}", binary.display());
    }
    Ok(())
}

pub struct FileBackendConfig {
    pub system_path: PathBuf,
    pub private_copy_path: PathBuf,
    pub no_stub_private_copy_path: PathBuf,
    pub resolvconf_binary: PathBuf,
    pub netconfig_binary: PathBuf,
}

/// Component F. Holds no resolver state of its own between cycles beyond
/// whether it has ever touched the system file, needed to decide whether
/// `stop()` must restore it.
pub struct FileBackend {
    config: FileBackendConfig,
    mode: ResolverFileMode,
    touched_system_file: bool,
    /// Remembered from the most recent `update()` so `stop()` — which gets
    /// no `UpdateData` of its own — can decide whether to restore real
    /// upstream servers (spec §4.6 "Shutdown").
    last_caching_successful: bool,
    last_resolver_depends_on_daemon: bool,
}

impl FileBackend {
    pub fn new(config: FileBackendConfig, mode: ResolverFileMode) -> Self {
        Self {
            config,
            mode,
            touched_system_file: false,
            last_caching_successful: false,
            last_resolver_depends_on_daemon: false,
        }
    }

    pub fn set_mode(&mut self, mode: ResolverFileMode) {
        self.mode = mode;
    }

    fn resolve_target(&self) -> PathBuf {
        match std::fs::canonicalize(&self.config.system_path) {
            Ok(p) => p,
            Err(_) => match std::fs::read_link(&self.config.system_path) {
                Ok(target) => target,
                Err(_) => self.config.system_path.clone(),
            },
        }
    }

    async fn write_strategy(&mut self, flat: &FlatState, body: &str) -> Result<()> {
        match self.mode {
            ResolverFileMode::Unmanaged | ResolverFileMode::Immutable => {
                tracing::debug!(mode = %self.mode, "not touching system resolver file");
                Ok(())
            }
            ResolverFileMode::File => {
                let target = self.resolve_target();
                let rendered = render_via_resolv_conf(&target, flat);
                let result = write_atomic(&target, &rendered).map_err(|source| DnsError::FileSystem {
                    path: target.clone(),
                    source,
                });
                match result {
                    Err(e) => tracing::warn!(error = %e, "failed to write system resolver file"),
                    Ok(()) => self.touched_system_file = true,
                }
                Ok(())
            }
            ResolverFileMode::Symlink => {
                let is_symlink = std::fs::symlink_metadata(&self.config.system_path)
                    .map(|m| m.file_type().is_symlink())
                    .unwrap_or(false);
                if !is_symlink {
                    write_atomic(&self.config.system_path, body)
                        .context("failed to write system resolver file")?;
                    self.touched_system_file = true;
                } else {
                    let points_at_us = std::fs::read_link(&self.config.system_path)
                        .map(|t| t == self.config.private_copy_path)
                        .unwrap_or(false);
                    if points_at_us {
                        // Re-point via symlink + rename so inotify watchers
                        // on the target observe a change event even though
                        // the private copy's own path never changes.
                        let tmp = self.config.system_path.with_extension("nm-tmp-link");
                        let _ = std::fs::remove_file(&tmp);
                        std::os::unix::fs::symlink(&self.config.private_copy_path, &tmp)
                            .context("failed to create temporary symlink")?;
                        std::fs::rename(&tmp, &self.config.system_path)
                            .context("failed to atomically repoint symlink")?;
                        self.touched_system_file = true;
                    }
                }
                Ok(())
            }
            ResolverFileMode::Resolvconf => {
                run_helper_with_stdin(
                    &self.config.resolvconf_binary,
                    &["-a", "NetworkManager"],
                    body,
                )
                .await?;
                self.touched_system_file = true;
                Ok(())
            }
            ResolverFileMode::Netconfig => {
                let payload = netconfig_payload(flat);
                run_helper_with_stdin(
                    &self.config.netconfig_binary,
                    &["modify", "--service", "NetworkManager"],
                    &payload,
                )
                .await?;
                self.touched_system_file = true;
                Ok(())
            }
        }
    }

    async fn teardown_resolvconf_if_empty(&self, flat: &FlatState) -> Result<()> {
        if self.mode != ResolverFileMode::Resolvconf {
            return Ok(());
        }
        if !flat.searches.is_empty() || !flat.nameservers.is_empty() {
            return Ok(());
        }
        let status = Command::new(&self.config.resolvconf_binary)
            .args(["-d", "NetworkManager"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .context("failed to run resolvconf -d")?;
        if !status.success() {
            tracing::warn!("resolvconf -d NetworkManager exited with {status}");
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Backend for FileBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    fn is_caching(&self) -> bool {
        false
    }

    fn contribute_fingerprint(&self, entry: &IpEntry, hasher: &mut Sha1) {
        for ns in entry.snapshot.nameservers() {
            hasher.update(ns.to_string().as_bytes());
        }
        for wins in entry.snapshot.wins() {
            hasher.update(wins.to_string().as_bytes());
        }
        for d in entry.snapshot.domains() {
            hasher.update(d.as_bytes());
        }
        for s in entry.snapshot.search() {
            hasher.update(s.as_bytes());
        }
        for o in entry.snapshot.options() {
            hasher.update(o.as_bytes());
        }
        hasher.update([entry.ip_config_type as u8]);
        hasher.update(entry.priority().to_le_bytes());
    }

    async fn update(&mut self, data: &UpdateData<'_>) -> Result<()> {
        let mut flat = assemble(data.entries, data.global, data.host_domain);
        let no_stub_body = format_resolver_file(&flat);
        write_atomic(&self.config.no_stub_private_copy_path, &no_stub_body)
            .context("failed to write no-stub private copy")?;

        if data.caching_successful {
            apply_caching_substitution(&mut flat, data.resolved_in_use);
        }
        self.last_caching_successful = data.caching_successful;
        self.last_resolver_depends_on_daemon = data.resolver_depends_on_daemon;

        let body = format_resolver_file(&flat);
        write_atomic(&self.config.private_copy_path, &body)
            .context("failed to write private copy")?;

        if super::requires_file_ownership(self.mode) {
            self.write_strategy(&flat, &body).await?;
            self.teardown_resolvconf_if_empty(&flat).await?;
        } else {
            tracing::debug!(mode = %self.mode, "resolver file mode requires no ownership; skipping system write");
        }
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if self.touched_system_file && self.last_caching_successful && self.last_resolver_depends_on_daemon {
            // Restore real upstream servers so resolution keeps working
            // after this process exits.
            let flat = FlatState::default();
            let body = format_resolver_file(&flat);
            let _ = self.write_strategy(&flat, &body).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{IpConfigType, IpEntry, SourceTag};
    use crate::family::Family;
    use crate::merge;
    use crate::snapshot::{IpConfigSnapshot, Ternary};
    use crate::store::EntryStore;

    fn make_store_with(entries: &[(i32, &str, i32, Vec<&str>)]) -> (EntryStore, Vec<crate::entry::EntryId>) {
        let mut store = EntryStore::new();
        for (ifindex, ns, prio, search) in entries {
            let snapshot = IpConfigSnapshot::new(
                *ifindex,
                None,
                vec![ns.parse().unwrap()],
                search.iter().map(|s| s.to_string()).collect(),
                vec![],
                vec![],
                Ternary::Unset,
                *prio,
                false,
                vec![],
                vec![],
            );
            store
                .set_ip_config(
                    Family::V4,
                    SourceTag(*ifindex as u64),
                    Some(snapshot),
                    IpConfigType::Default,
                    false,
                )
                .unwrap();
        }
        let sorted = store.sorted_ids().to_vec();
        merge::run(&mut store, &sorted);
        (store, sorted)
    }

    #[test]
    fn scenario_two_ipv4_providers_positive_priorities() {
        let (store, sorted) = make_store_with(&[
            (2, "1.1.1.1", 100, vec!["corp.example"]),
            (3, "8.8.8.8", 50, vec!["home.example"]),
        ]);
        let entries: Vec<&IpEntry> = sorted.iter().map(|&id| store.get(id).unwrap()).collect();
        let flat = assemble(&entries, None, None);
        assert_eq!(flat.searches, vec!["home.example", "corp.example"]);
        assert_eq!(
            flat.nameservers,
            vec!["8.8.8.8".parse::<IpAddr>().unwrap(), "1.1.1.1".parse().unwrap()]
        );
    }

    #[test]
    fn scenario_negative_priority_override() {
        let (store, sorted) = make_store_with(&[
            (2, "10.0.0.1", -100, vec!["internal"]),
            (3, "9.9.9.9", 200, vec!["public"]),
        ]);
        let entries: Vec<&IpEntry> = sorted.iter().map(|&id| store.get(id).unwrap()).collect();
        let flat = assemble(&entries, None, None);
        assert_eq!(flat.searches, vec!["internal"]);
        assert_eq!(flat.nameservers, vec!["10.0.0.1".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn formats_header_and_nameserver_comment_after_third() {
        let flat = FlatState {
            nameservers: vec![
                "1.1.1.1".parse().unwrap(),
                "2.2.2.2".parse().unwrap(),
                "3.3.3.3".parse().unwrap(),
                "4.4.4.4".parse().unwrap(),
            ],
            searches: vec!["example.com".to_string()],
            options: vec!["edns0".to_string(), "_internal".to_string()],
            nis_domain: None,
            nis_servers: vec![],
        };
        let body = format_resolver_file(&flat);
        assert!(body.starts_with("# Generated by"));
        assert!(body.contains("search example.com"));
        assert!(body.contains("nameserver 4.4.4.4"));
        assert!(body.contains("# NOTE"));
        assert!(body.contains("options edns0"));
        assert!(!body.contains("_internal"));
    }

    #[test]
    fn caching_substitution_uses_resolved_loopback() {
        let mut flat = FlatState::default();
        apply_caching_substitution(&mut flat, true);
        assert_eq!(flat.nameservers, vec![IpAddr::V4(Ipv4Addr::new(127, 0, 0, 53))]);
        assert!(flat.options.iter().any(|o| o == "edns0"));
        assert!(flat.options.iter().any(|o| o == "trust-ad"));
    }

    #[test]
    fn global_wildcard_bypasses_entry_loop() {
        let mut global = GlobalDnsConfig::default();
        global.domains.insert(
            "*".to_string(),
            crate::snapshot::GlobalDnsDomain {
                servers: vec!["9.9.9.9".parse().unwrap()],
            },
        );
        let (store, sorted) = make_store_with(&[(2, "1.1.1.1", 100, vec!["corp.example"])]);
        let entries: Vec<&IpEntry> = sorted.iter().map(|&id| store.get(id).unwrap()).collect();
        let flat = assemble(&entries, Some(&global), None);
        assert_eq!(flat.nameservers, vec!["9.9.9.9".parse::<IpAddr>().unwrap()]);
    }
}
