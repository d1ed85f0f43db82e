//! Per-campaign processing locks.
//!
//! No two `process` runs may execute concurrently for the same
//! campaign. Locks are held across a short select-and-mark
//! transaction; a holder that dies keeps its entry until it goes
//! stale, at which point the next acquirer (or the periodic sweeper)
//! forcibly releases it.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::warn;

use crate::models::CampaignId;

/// A processing lock held past this is considered stale
pub const STALE_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Registry of campaigns currently being processed
pub struct CampaignLocks {
    locks: DashMap<CampaignId, Instant>,
}

impl CampaignLocks {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Try to take the processing lock for a campaign.
    ///
    /// A stale holder is forcibly displaced.
    pub fn try_acquire(&self, campaign_id: CampaignId) -> bool {
        self.try_acquire_with(campaign_id, STALE_LOCK_TIMEOUT)
    }

    fn try_acquire_with(&self, campaign_id: CampaignId, stale_after: Duration) -> bool {
        match self.locks.entry(campaign_id) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if entry.get().elapsed() >= stale_after {
                    warn!(
                        "Forcibly releasing stale processing lock for campaign {}",
                        campaign_id
                    );
                    entry.insert(Instant::now());
                    true
                } else {
                    false
                }
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Instant::now());
                true
            }
        }
    }

    pub fn release(&self, campaign_id: CampaignId) {
        self.locks.remove(&campaign_id);
    }

    /// Remove stale entries; returns how many were reclaimed.
    /// Run by the periodic sweeper.
    pub fn sweep(&self) -> usize {
        self.sweep_with(STALE_LOCK_TIMEOUT)
    }

    fn sweep_with(&self, stale_after: Duration) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, held_at| held_at.elapsed() < stale_after);
        let reclaimed = before - self.locks.len();
        if reclaimed > 0 {
            warn!("Reclaimed {} stale campaign processing locks", reclaimed);
        }
        reclaimed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_is_exclusive_until_released() {
        let locks = CampaignLocks::new();
        assert!(locks.try_acquire(1));
        assert!(!locks.try_acquire(1));
        assert!(locks.try_acquire(2));

        locks.release(1);
        assert!(locks.try_acquire(1));
    }

    #[test]
    fn stale_lock_is_forcibly_displaced() {
        let locks = CampaignLocks::new();
        assert!(locks.try_acquire(7));
        // With a zero staleness bound any held lock is already stale
        assert!(locks.try_acquire_with(7, Duration::ZERO));
    }

    #[test]
    fn sweep_reclaims_only_stale_entries() {
        let locks = CampaignLocks::new();
        assert!(locks.try_acquire(1));
        assert!(locks.try_acquire(2));

        assert_eq!(locks.sweep(), 0);
        assert_eq!(locks.sweep_with(Duration::ZERO), 2);
        assert!(locks.try_acquire(1));
    }
}
