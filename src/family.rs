//! Address-family plumbing shared by the entry store and the merge engine.

use std::fmt;

/// The address family of a single stored entry.
///
/// Unlike [`FamilySelector`], an entry always belongs to exactly one family;
/// `UNSPEC` only exists at the public API boundary as shorthand for "do this
/// to both".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub const ALL: [Family; 2] = [Family::V4, Family::V6];

    pub fn index(self) -> usize {
        match self {
            Family::V4 => 0,
            Family::V6 => 1,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Family::V4 => "v4",
            Family::V6 => "v6",
        })
    }
}

/// What a caller of [`crate::DnsManager::set_ip_config`] may pass. `Unspec`
/// fans out into a call per family, per spec §3 "Lifecycle".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FamilySelector {
    V4,
    V6,
    Unspec,
}

impl FamilySelector {
    /// The concrete families this selector expands to.
    pub fn families(self) -> &'static [Family] {
        match self {
            FamilySelector::V4 => &[Family::V4],
            FamilySelector::V6 => &[Family::V6],
            FamilySelector::Unspec => &Family::ALL,
        }
    }
}
