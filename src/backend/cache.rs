//! Component E — local-cache back-ends: `systemd-resolved` (D-Bus) and a
//! managed `dnsmasq` child process. See spec.md §4.5.

use super::{Backend, UpdateData};
use crate::entry::IpEntry;
use crate::error::DnsError;
use anyhow::{Context as _, Result};
use sha1::{Digest, Sha1};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::process::{Child, Command};

/// Classifies a failed D-Bus call as transient (resolved not activated yet,
/// no owner on the bus) or a hard failure, the distinction `update_dns()`
/// uses to decide whether to keep retrying. zbus doesn't expose a stable
/// enum variant for "service not up yet" so this matches on the rendered
/// error text the way `dns_control/linux.rs` matches `resolvectl` stderr.
fn classify_zbus_error(backend: &'static str, context: &str, err: zbus::Error) -> anyhow::Error {
    let reason = format!("{context}: {err}");
    let transient = reason.contains("ServiceUnknown") || reason.contains("NameHasNoOwner");
    if transient {
        DnsError::BackendTransient { backend, reason }.into()
    } else {
        DnsError::BackendFailed { backend, reason }.into()
    }
}

fn hash_entry_for_cache(entry: &IpEntry, hasher: &mut Sha1) {
    hasher.update(entry.ifindex().to_le_bytes());
    for ns in entry.snapshot.nameservers() {
        hasher.update(ns.to_string().as_bytes());
        hasher.update([0]);
    }
    for d in entry.snapshot.search() {
        hasher.update(d.as_bytes());
        hasher.update([0]);
    }
    for d in entry.snapshot.domains() {
        hasher.update(d.as_bytes());
        hasher.update([0]);
    }
}

/// Drives `systemd-resolved` over its system D-Bus `org.freedesktop.resolve1`
/// object, the way `network_changes::linux` in the teacher reaches
/// `org.freedesktop.resolve1` to *watch* properties — here we *set* them via
/// `Manager.SetLinkDNS` / `SetLinkDomains` / `SetLinkDefaultRoute`.
pub struct SystemdResolvedBackend {
    connection: Option<zbus::Connection>,
    pending: Arc<AtomicBool>,
}

impl SystemdResolvedBackend {
    pub fn new() -> Self {
        Self {
            connection: None,
            pending: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether this back-end has ever connected to the system bus, i.e. is
    /// "running" in the sense spec.md §2's `get_systemd_resolved()` accessor
    /// cares about (external connectivity probing wants a live connection to
    /// share, not just a configured-but-dormant back-end).
    pub fn is_running(&self) -> bool {
        self.connection.is_some()
    }

    async fn connection(&mut self) -> Result<&zbus::Connection> {
        if self.connection.is_none() {
            self.connection = Some(
                zbus::Connection::system()
                    .await
                    .context("failed to connect to the system D-Bus for systemd-resolved")?,
            );
        }
        Ok(self.connection.as_ref().expect("just set"))
    }

    async fn proxy(&mut self) -> Result<zbus::Proxy<'static>> {
        let cxn = self.connection().await?.clone();
        zbus::Proxy::new(
            &cxn,
            "org.freedesktop.resolve1",
            "/org/freedesktop/resolve1",
            "org.freedesktop.resolve1.Manager",
        )
        .await
        .context("failed to build the resolve1.Manager proxy")
    }
}

impl Default for SystemdResolvedBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Backend for SystemdResolvedBackend {
    fn name(&self) -> &'static str {
        "systemd-resolved"
    }

    fn is_caching(&self) -> bool {
        true
    }

    fn contribute_fingerprint(&self, entry: &IpEntry, hasher: &mut Sha1) {
        hash_entry_for_cache(entry, hasher);
    }

    async fn update(&mut self, data: &UpdateData<'_>) -> Result<()> {
        self.pending.store(true, Ordering::SeqCst);
        let result = self.push(data).await;
        self.pending.store(false, Ordering::SeqCst);
        result
    }

    fn pending_flag(&self) -> Option<Arc<AtomicBool>> {
        Some(self.pending.clone())
    }

    async fn stop(&mut self) -> Result<()> {
        if self.connection.is_none() {
            return Ok(());
        }
        // We don't retain per-link state beyond the connection handle, so
        // reverting is a best-effort global flush rather than a per-link
        // `RevertLink` call.
        if let Ok(proxy) = self.proxy().await {
            let _: std::result::Result<(), zbus::Error> = proxy.call("FlushCaches", &()).await;
        }
        self.connection = None;
        Ok(())
    }

    fn update_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    fn as_systemd_resolved(&self) -> Option<&SystemdResolvedBackend> {
        Some(self)
    }
}

impl SystemdResolvedBackend {
    async fn push(&mut self, data: &UpdateData<'_>) -> Result<()> {
        let proxy = self.proxy().await?;
        for entry in data.entries {
            let ifindex = entry.ifindex();
            let servers: Vec<(i32, Vec<u8>)> = entry
                .snapshot
                .nameservers()
                .iter()
                .map(|addr| match addr {
                    std::net::IpAddr::V4(v4) => (libc::AF_INET, v4.octets().to_vec()),
                    std::net::IpAddr::V6(v6) => (libc::AF_INET6, v6.octets().to_vec()),
                })
                .collect();
            proxy
                .call::<_, _, ()>("SetLinkDNS", &(ifindex, servers))
                .await
                .map_err(|e| classify_zbus_error("systemd-resolved", &format!("SetLinkDNS failed for ifindex {ifindex}"), e))?;

            if let Some(merged) = &entry.merged_domains {
                let domains: Vec<(String, bool)> = merged
                    .search
                    .iter()
                    .map(|d| (d.clone(), false))
                    .chain(merged.has_default_route.then(|| ("~".to_string(), true)))
                    .collect();
                proxy
                    .call::<_, _, ()>("SetLinkDomains", &(ifindex, domains))
                    .await
                    .map_err(|e| classify_zbus_error("systemd-resolved", &format!("SetLinkDomains failed for ifindex {ifindex}"), e))?;
            }
        }
        Ok(())
    }
}

/// Managed `dnsmasq` child process: we own its lifetime and feed it the
/// flat resolver state as its upstream `server=` lines via a generated
/// config file, the way `dns_control/linux.rs`'s `configure_dns_for_tun`
/// shells out to a long-running helper (there, `resolvectl`; here, the
/// child itself).
pub struct DnsmasqBackend {
    binary: std::path::PathBuf,
    config_path: std::path::PathBuf,
    child: Option<Child>,
    /// Set for the duration of `spawn()`: the window in which the resolver
    /// is briefly unreachable while the old process (if any) is replaced.
    restarting: Arc<AtomicBool>,
}

impl DnsmasqBackend {
    pub fn new(binary: impl Into<std::path::PathBuf>, config_path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            config_path: config_path.into(),
            child: None,
            restarting: Arc::new(AtomicBool::new(false)),
        }
    }

    fn render_config(data: &UpdateData<'_>) -> String {
        let mut out = String::from("# Generated by the DNS resolution-plane manager\nno-resolv\n");
        for entry in data.entries {
            for ns in entry.snapshot.nameservers() {
                out.push_str(&format!("server={ns}\n"));
            }
        }
        if let Some(domain) = data.host_domain {
            out.push_str(&format!("domain={domain}\n"));
        }
        out
    }

    async fn spawn(&mut self) -> Result<()> {
        if let Some(child) = &mut self.child {
            if matches!(child.try_wait(), Ok(None)) {
                return Ok(());
            }
        }
        self.restarting.store(true, Ordering::SeqCst);
        let result = self.spawn_inner().await;
        self.restarting.store(false, Ordering::SeqCst);
        result
    }

    async fn spawn_inner(&mut self) -> Result<()> {
        let mut child = Command::new(&self.binary)
            .arg("--keep-in-foreground")
            .arg("--no-daemon")
            .arg("--conf-file")
            .arg(&self.config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.binary.display()))?;
        // Surface an immediate exit (bad config, missing permission) as a
        // hard failure instead of silently leaving a caching back-end that
        // looks alive but isn't.
        if let Ok(Some(status)) = child.try_wait() {
            return Err(DnsError::BackendFailed {
                backend: "dnsmasq",
                reason: format!("exited immediately with {status}"),
            }
            .into());
        }
        self.child = Some(child);
        Ok(())
    }
}

#[async_trait::async_trait]
impl Backend for DnsmasqBackend {
    fn name(&self) -> &'static str {
        "dnsmasq"
    }

    fn is_caching(&self) -> bool {
        true
    }

    fn contribute_fingerprint(&self, entry: &IpEntry, hasher: &mut Sha1) {
        hash_entry_for_cache(entry, hasher);
    }

    async fn update(&mut self, data: &UpdateData<'_>) -> Result<()> {
        let rendered = Self::render_config(data);
        tokio::fs::write(&self.config_path, rendered)
            .await
            .with_context(|| format!("failed to write {}", self.config_path.display()))?;
        self.spawn().await
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(mut child) = self.child.take() {
            child.start_kill().ok();
            let _ = tokio::time::timeout(std::time::Duration::from_secs(1), child.wait()).await;
        }
        Ok(())
    }

    fn update_pending(&self) -> bool {
        self.restarting.load(Ordering::SeqCst)
    }

    fn pending_flag(&self) -> Option<Arc<AtomicBool>> {
        Some(self.restarting.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{IpConfigType, IpEntry, SourceTag};
    use crate::family::Family;
    use crate::snapshot::{IpConfigSnapshot, Ternary};

    #[test]
    fn dnsmasq_config_lists_every_nameserver() {
        let snapshot = IpConfigSnapshot::new(
            2,
            None,
            vec!["1.1.1.1".parse().unwrap(), "8.8.8.8".parse().unwrap()],
            vec![],
            vec![],
            vec![],
            Ternary::Unset,
            100,
            false,
            vec![],
            vec![],
        );
        let entry = IpEntry::new(snapshot, SourceTag(1), Family::V4, IpConfigType::Default);
        let entries = [&entry];
        let data = UpdateData {
            entries: &entries,
            host_domain: Some("corp.example"),
            global: None,
            caching_successful: false,
            resolved_in_use: false,
            resolver_depends_on_daemon: false,
        };
        let rendered = DnsmasqBackend::render_config(&data);
        assert!(rendered.contains("server=1.1.1.1"));
        assert!(rendered.contains("server=8.8.8.8"));
        assert!(rendered.contains("domain=corp.example"));
    }
}
