//! Component G — resolver-file mode resolution. See spec.md §4.7.
//!
//! Grounded on `init_resolv_conf_mode`/`_check_resconf_immutable`/
//! `_resolvconf_resolved_managed` in `nm-dns-manager.c`.

use std::fmt;
use std::fs;
use std::path::Path;

/// The resolved disposition of the system resolver file. Mirrors
/// `NMDnsManagerResolvConfManager`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverFileMode {
    Unmanaged,
    Immutable,
    Symlink,
    File,
    Resolvconf,
    Netconfig,
}

impl fmt::Display for ResolverFileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResolverFileMode::Unmanaged => "unmanaged",
            ResolverFileMode::Immutable => "immutable",
            ResolverFileMode::Symlink => "symlink",
            ResolverFileMode::File => "file",
            ResolverFileMode::Resolvconf => "resolvconf",
            ResolverFileMode::Netconfig => "netconfig",
        })
    }
}

/// Operator-facing `rc-manager` setting (spec §6 property). `Auto` and
/// `Unknown` never reach [`ResolverFileMode`] directly; they are resolved
/// down to a concrete mode by [`resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RcManagerSetting {
    Auto,
    Symlink,
    File,
    Resolvconf,
    Netconfig,
    Unmanaged,
}

impl RcManagerSetting {
    /// Parses the operator-facing string, defaulting unrecognized values to
    /// `auto` the way `init_resolv_conf_mode` does, logging a warning at
    /// the call site (spec §4.7 step 1).
    pub fn parse(value: &str) -> Self {
        match value {
            "auto" => Self::Auto,
            "symlink" | "none" => Self::Symlink,
            "file" => Self::File,
            "resolvconf" => Self::Resolvconf,
            "netconfig" => Self::Netconfig,
            "unmanaged" => Self::Unmanaged,
            _ => {
                let err = crate::error::DnsError::ConfigMalformed(value.to_string());
                tracing::warn!("{err}");
                Self::Auto
            }
        }
    }
}

/// Well-known systemd-resolved / dnsconfd targets, checked both as a
/// symlink-target string match and as a realpath/inode match. Grounded on
/// `_resolvconf_resolved_managed`'s `RESOLVED_PATHS`.
const RESOLVED_PATHS: &[&str] = &[
    "../run/systemd/resolve/stub-resolv.conf",
    "../run/systemd/resolve/resolv.conf",
    "../lib/systemd/resolv.conf",
    "../usr/lib/systemd/resolv.conf",
    "/run/systemd/resolve/stub-resolv.conf",
    "/run/systemd/resolve/resolv.conf",
    "/lib/systemd/resolv.conf",
    "/usr/lib/systemd/resolv.conf",
];

/// Whether `resolv_conf_path` is owned by systemd-resolved (or a
/// dnsconfd/resolved-compatible stand-in), used when `mode` is left
/// unspecified by the operator to auto-detect `systemd-resolved` mode
/// instead of requiring it to be named explicitly.
pub fn resolved_managed(resolv_conf_path: &Path) -> bool {
    let Ok(link_target) = fs::read_link(resolv_conf_path) else {
        return false;
    };
    let target_str = link_target.to_string_lossy();
    if RESOLVED_PATHS.iter().any(|p| target_str == *p) {
        return true;
    }

    let Ok(real) = fs::canonicalize(resolv_conf_path) else {
        return false;
    };
    let Ok(real_meta) = fs::metadata(&real) else {
        return false;
    };
    RESOLVED_PATHS.iter().any(|p| {
        fs::metadata(p)
            .map(|m| file_identity_eq(&m, &real_meta))
            .unwrap_or(false)
    })
}

#[cfg(target_os = "linux")]
fn file_identity_eq(a: &fs::Metadata, b: &fs::Metadata) -> bool {
    use std::os::linux::fs::MetadataExt;
    a.st_dev() == b.st_dev() && a.st_ino() == b.st_ino()
}

#[cfg(not(target_os = "linux"))]
fn file_identity_eq(_a: &fs::Metadata, _b: &fs::Metadata) -> bool {
    false
}

/// `FS_IOC_GETFLAGS`/`FS_IMMUTABLE_FL` check, grounded on
/// `_check_resconf_immutable`. Linux-only; non-Linux targets report never
/// immutable since the ioctl does not exist there.
#[cfg(target_os = "linux")]
fn is_immutable(path: &Path) -> bool {
    use std::os::fd::AsRawFd;

    const FS_IOC_GETFLAGS: libc::c_ulong = 0x8004_1250;
    const FS_IMMUTABLE_FL: libc::c_int = 0x0000_0010;

    let Ok(file) = fs::File::open(path) else {
        return false;
    };
    let mut flags: libc::c_int = 0;
    // SAFETY: `file` stays open for the call, `flags` is a valid out-pointer
    // of the size the ioctl expects.
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), FS_IOC_GETFLAGS, &mut flags as *mut _) };
    rc != -1 && (flags & FS_IMMUTABLE_FL) != 0
}

#[cfg(not(target_os = "linux"))]
fn is_immutable(_path: &Path) -> bool {
    false
}

/// Whether `path` is a regular file with at least one executable bit set.
/// Spec §4.7 step 4 requires the helper actually be runnable, not merely
/// present: a non-executable `/sbin/resolvconf` (wrong permissions, or a
/// directory) must not select `ResolverFileMode::Resolvconf`.
#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.exists()
}

/// Whether `resolv_conf_path` (or the symlink pointing there) is currently
/// a symlink, used to decide whether the immutable-bit check even applies
/// (only regular files/directories carry extended attributes).
fn is_symlink(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
}

/// Downgrades `setting` to [`ResolverFileMode::Immutable`] when the file
/// carries the immutable attribute. Spec §4.7 step 2.
fn check_immutable(setting: RcManagerSetting, resolv_conf_path: &Path) -> RcManagerSetting {
    if setting == RcManagerSetting::Unmanaged {
        return setting;
    }
    if !Path::new(resolv_conf_path).exists() && !is_symlink(resolv_conf_path) {
        return setting;
    }
    if setting == RcManagerSetting::Symlink && is_symlink(resolv_conf_path) {
        // A symlink pointing elsewhere backs `rc-manager=symlink` off on
        // its own; we never need the immutable check for it.
        return setting;
    }
    if is_immutable(resolv_conf_path) {
        return RcManagerSetting::Unmanaged; // caller maps to Immutable below
    }
    setting
}

pub struct ResolveInputs<'a> {
    pub rc_manager: RcManagerSetting,
    pub mode_is_systemd_resolved_or_dnsconfd: bool,
    pub resolv_conf_path: &'a Path,
    pub resolvconf_binary: Option<&'a Path>,
    pub netconfig_binary: Option<&'a Path>,
}

/// Resolves the final [`ResolverFileMode`] from the operator setting plus
/// what's actually on disk. Spec §4.7, steps 1-4.
pub fn resolve(inputs: &ResolveInputs<'_>) -> ResolverFileMode {
    let immutable_checked = check_immutable(inputs.rc_manager, inputs.resolv_conf_path);
    let was_downgraded_to_immutable =
        inputs.rc_manager != RcManagerSetting::Unmanaged && immutable_checked == RcManagerSetting::Unmanaged;
    if was_downgraded_to_immutable {
        return ResolverFileMode::Immutable;
    }

    match immutable_checked {
        RcManagerSetting::Unmanaged => ResolverFileMode::Unmanaged,
        RcManagerSetting::Symlink => ResolverFileMode::Symlink,
        RcManagerSetting::File => ResolverFileMode::File,
        RcManagerSetting::Resolvconf => ResolverFileMode::Resolvconf,
        RcManagerSetting::Netconfig => ResolverFileMode::Netconfig,
        RcManagerSetting::Auto => {
            // `dnsconfd`, like `systemd-resolved`, owns the system file
            // outright: `auto` always backs off to unmanaged for both.
            if inputs.mode_is_systemd_resolved_or_dnsconfd {
                ResolverFileMode::Unmanaged
            } else if inputs.resolvconf_binary.is_some_and(|p| is_executable(p)) {
                ResolverFileMode::Resolvconf
            } else if inputs.netconfig_binary.is_some_and(|p| is_executable(p)) {
                ResolverFileMode::Netconfig
            } else {
                ResolverFileMode::Symlink
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_wire_names() {
        assert_eq!(ResolverFileMode::Unmanaged.to_string(), "unmanaged");
        assert_eq!(ResolverFileMode::Immutable.to_string(), "immutable");
        assert_eq!(ResolverFileMode::Symlink.to_string(), "symlink");
        assert_eq!(ResolverFileMode::File.to_string(), "file");
        assert_eq!(ResolverFileMode::Resolvconf.to_string(), "resolvconf");
        assert_eq!(ResolverFileMode::Netconfig.to_string(), "netconfig");
    }

    #[test]
    fn parse_defaults_unknown_to_auto() {
        assert_eq!(RcManagerSetting::parse("bogus"), RcManagerSetting::Auto);
        assert_eq!(RcManagerSetting::parse("none"), RcManagerSetting::Symlink);
    }

    #[test]
    fn auto_with_systemd_resolved_mode_is_unmanaged() {
        let dir = tempfile::tempdir().unwrap();
        let resolv = dir.path().join("resolv.conf");
        let mode = resolve(&ResolveInputs {
            rc_manager: RcManagerSetting::Auto,
            mode_is_systemd_resolved_or_dnsconfd: true,
            resolv_conf_path: &resolv,
            resolvconf_binary: None,
            netconfig_binary: None,
        });
        assert_eq!(mode, ResolverFileMode::Unmanaged);
    }

    #[test]
    fn auto_falls_back_to_symlink_with_no_binaries() {
        let dir = tempfile::tempdir().unwrap();
        let resolv = dir.path().join("resolv.conf");
        let mode = resolve(&ResolveInputs {
            rc_manager: RcManagerSetting::Auto,
            mode_is_systemd_resolved_or_dnsconfd: false,
            resolv_conf_path: &resolv,
            resolvconf_binary: None,
            netconfig_binary: None,
        });
        assert_eq!(mode, ResolverFileMode::Symlink);
    }

    #[test]
    fn auto_prefers_resolvconf_binary_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let resolv = dir.path().join("resolv.conf");
        let resolvconf_bin = dir.path().join("resolvconf");
        fs::write(&resolvconf_bin, b"").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&resolvconf_bin, fs::Permissions::from_mode(0o755)).unwrap();
        }
        let mode = resolve(&ResolveInputs {
            rc_manager: RcManagerSetting::Auto,
            mode_is_systemd_resolved_or_dnsconfd: false,
            resolv_conf_path: &resolv,
            resolvconf_binary: Some(&resolvconf_bin),
            netconfig_binary: None,
        });
        assert_eq!(mode, ResolverFileMode::Resolvconf);
    }

    #[cfg(unix)]
    #[test]
    fn auto_ignores_non_executable_resolvconf_binary() {
        let dir = tempfile::tempdir().unwrap();
        let resolv = dir.path().join("resolv.conf");
        let resolvconf_bin = dir.path().join("resolvconf");
        fs::write(&resolvconf_bin, b"").unwrap();
        let mode = resolve(&ResolveInputs {
            rc_manager: RcManagerSetting::Auto,
            mode_is_systemd_resolved_or_dnsconfd: false,
            resolv_conf_path: &resolv,
            resolvconf_binary: Some(&resolvconf_bin),
            netconfig_binary: None,
        });
        assert_eq!(mode, ResolverFileMode::Symlink);
    }

    #[test]
    fn explicit_file_setting_without_immutable_bit_stays_file() {
        let dir = tempfile::tempdir().unwrap();
        let resolv = dir.path().join("resolv.conf");
        fs::write(&resolv, b"nameserver 127.0.0.1\n").unwrap();
        let mode = resolve(&ResolveInputs {
            rc_manager: RcManagerSetting::File,
            mode_is_systemd_resolved_or_dnsconfd: false,
            resolv_conf_path: &resolv,
            resolvconf_binary: None,
            netconfig_binary: None,
        });
        assert_eq!(mode, ResolverFileMode::File);
    }
}
