//! Error taxonomy for the DNS resolution-plane manager (spec.md §7).
//!
//! `NoOp` is deliberately absent: a no-op is not an error, it is the
//! `changed = false` return of [`crate::store::EntryStore::set_ip_config`].

use thiserror::Error;

/// Kinds of failure an update cycle can encounter. Matches the teacher's
/// convention of a `thiserror` enum for values callers need to match on,
/// layered under `anyhow::Result` at call boundaries that talk to the OS.
#[derive(Debug, Error)]
pub enum DnsError {
    /// A caller passed an inconsistent argument, e.g. `type = removed` with
    /// a non-null snapshot. Programmer error; no state change is made.
    #[error("bad input: {0}")]
    BadInput(String),

    /// The back-end is momentarily unavailable (D-Bus activation pending,
    /// helper busy). Surfaced to the observer as `update-pending = true`.
    #[error("backend `{backend}` transiently unavailable: {reason}")]
    BackendTransient { backend: &'static str, reason: String },

    /// The back-end returned a negative result, or the helper process
    /// exited non-zero. The fingerprint is left unchanged so an unrelated
    /// future change still retries.
    #[error("backend `{backend}` failed: {reason}")]
    BackendFailed { backend: &'static str, reason: String },

    /// Writing the system resolver file failed (immutable, ENOSPC, EACCES, ...).
    #[error("failed to write system resolver file {path}: {source}")]
    FileSystem {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An unrecognized `rc-manager` value was configured.
    #[error("unrecognized rc-manager value `{0}`, falling back to auto")]
    ConfigMalformed(String),
}

impl DnsError {
    pub fn bad_input(msg: impl Into<String>) -> Self {
        Self::BadInput(msg.into())
    }
}
