//! Operator-facing configuration. See spec.md §6 and SPEC_FULL.md §C.
//!
//! Grounded on the teacher's `known_dirs` pattern for runtime-directory
//! resolution (a per-platform function with a sane fallback) and on its use
//! of environment-variable overrides for binary paths.

use crate::file_mode::RcManagerSetting;
use std::path::PathBuf;

const DEFAULT_RESOLV_CONF: &str = "/etc/resolv.conf";
const DEFAULT_RESOLVCONF_BINARY: &str = "/sbin/resolvconf";
const DEFAULT_NETCONFIG_BINARY: &str = "/sbin/netconfig";
const DEFAULT_DNSMASQ_BINARY: &str = "/usr/sbin/dnsmasq";

/// One of `default | systemd-resolved | dnsmasq | dnsconfd | none`. Spec §6
/// observer property; kept as a plain string the way the original's `mode`
/// is a bare C string, since its valid values are operator configuration
/// rather than a closed Rust-level contract the rest of this crate matches
/// on (only `resolve()` in [`crate::file_mode`] cares which one it is).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsMode {
    Default,
    SystemdResolved,
    Dnsmasq,
    Dnsconfd,
    None,
}

impl DnsMode {
    pub fn parse(value: &str) -> Self {
        match value {
            "systemd-resolved" => Self::SystemdResolved,
            "dnsmasq" => Self::Dnsmasq,
            "dnsconfd" => Self::Dnsconfd,
            "none" => Self::None,
            _ => Self::Default,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::SystemdResolved => "systemd-resolved",
            Self::Dnsmasq => "dnsmasq",
            Self::Dnsconfd => "dnsconfd",
            Self::None => "none",
        }
    }

    pub fn is_systemd_resolved_or_dnsconfd(&self) -> bool {
        matches!(self, Self::SystemdResolved | Self::Dnsconfd)
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub mode: DnsMode,
    pub rc_manager: RcManagerSetting,
    pub system_resolv_conf_path: PathBuf,
    pub resolvconf_binary: PathBuf,
    pub netconfig_binary: PathBuf,
    pub dnsmasq_binary: PathBuf,
    pub runtime_dir: PathBuf,
}

impl Settings {
    /// Reads operator-facing overrides the way the original reads build-time
    /// `#define`s: `NM_DNS_RESOLVCONF_PATH` / `NM_DNS_NETCONFIG_PATH` stand
    /// in for `RESOLVCONF_PATH` / `NETCONFIG_PATH`.
    pub fn from_env(mode: DnsMode, rc_manager: RcManagerSetting) -> Self {
        Self {
            mode,
            rc_manager,
            system_resolv_conf_path: PathBuf::from(DEFAULT_RESOLV_CONF),
            resolvconf_binary: std::env::var_os("NM_DNS_RESOLVCONF_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_RESOLVCONF_BINARY)),
            netconfig_binary: std::env::var_os("NM_DNS_NETCONFIG_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_NETCONFIG_BINARY)),
            dnsmasq_binary: std::env::var_os("NM_DNS_DNSMASQ_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DNSMASQ_BINARY)),
            runtime_dir: runtime_dir(),
        }
    }
}

/// Mirrors `known_dirs`-style resolution: prefer `XDG_RUNTIME_DIR`-ish
/// state, fall back to a fixed system path when unset (e.g. running as a
/// system daemon rather than a user session).
fn runtime_dir() -> PathBuf {
    dirs::runtime_dir().unwrap_or_else(|| PathBuf::from("/run/NetworkManager"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_roundtrips_through_as_str() {
        for mode in [
            DnsMode::Default,
            DnsMode::SystemdResolved,
            DnsMode::Dnsmasq,
            DnsMode::Dnsconfd,
            DnsMode::None,
        ] {
            assert_eq!(DnsMode::parse(mode.as_str()), mode);
        }
    }

    #[test]
    fn unrecognized_mode_falls_back_to_default() {
        assert_eq!(DnsMode::parse("unbound"), DnsMode::Default);
    }
}
