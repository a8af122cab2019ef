//! Eviction policy
//!
//! Pure ordering function: given the resident set and the usage ledger,
//! produce the unload order. Least-frequently-used goes first, ties broken
//! by oldest last-use; pinned models are never candidates.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;

use crate::residency::ResidentModel;
use crate::storage::ledger::UsageLedger;

/// Unload order for the resident set, pinned models excluded. Ascending
/// windowed frequency, ties by oldest `last_used` (never-used sorts
/// first).
pub fn eviction_order(
    resident: &[ResidentModel],
    pinned: &HashSet<String>,
    ledger: &UsageLedger,
    window: Duration,
) -> Vec<String> {
    let mut candidates: Vec<(String, u64, Option<DateTime<Utc>>)> = resident
        .iter()
        .filter(|m| !pinned.contains(&m.name))
        .map(|m| {
            (
                m.name.clone(),
                ledger.frequency(&m.name, window),
                ledger.last_used(&m.name),
            )
        })
        .collect();

    candidates.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.2.cmp(&b.2)));
    candidates.into_iter().map(|(name, _, _)| name).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ledger::UsageRecord;

    fn resident(names: &[&str]) -> Vec<ResidentModel> {
        names
            .iter()
            .map(|n| ResidentModel {
                name: n.to_string(),
                ram_gb: 4.0,
                loaded_at: Utc::now(),
            })
            .collect()
    }

    fn record(count: u64, last_used: DateTime<Utc>) -> UsageRecord {
        let recent = (0..count).map(|_| last_used).collect();
        UsageRecord {
            invocations: count,
            last_used,
            recent,
        }
    }

    #[test]
    fn test_order_by_frequency_then_age() {
        let ledger = UsageLedger::in_memory();
        let now = Utc::now();
        // A and B tie at 5 uses; B's last use is older. C was used once.
        ledger.insert_record("a", record(5, now));
        ledger.insert_record("b", record(5, now - Duration::hours(2)));
        ledger.insert_record("c", record(1, now));

        let order = eviction_order(
            &resident(&["a", "b", "c"]),
            &HashSet::new(),
            &ledger,
            Duration::hours(24),
        );
        assert_eq!(order, vec!["c", "b", "a"]);
    }

    #[test]
    fn test_pinned_model_is_never_a_candidate() {
        let ledger = UsageLedger::in_memory();
        let pinned: HashSet<String> = ["a".to_string()].into_iter().collect();

        let order = eviction_order(
            &resident(&["a", "b"]),
            &pinned,
            &ledger,
            Duration::hours(24),
        );
        assert_eq!(order, vec!["b"]);
    }

    #[test]
    fn test_never_used_models_go_first() {
        let ledger = UsageLedger::in_memory();
        ledger.insert_record("used", record(3, Utc::now()));

        let order = eviction_order(
            &resident(&["used", "idle"]),
            &HashSet::new(),
            &ledger,
            Duration::hours(24),
        );
        assert_eq!(order, vec!["idle", "used"]);
    }

    #[test]
    fn test_stale_usage_counts_as_zero() {
        let ledger = UsageLedger::in_memory();
        let now = Utc::now();
        // "stale" has many invocations, all outside the window.
        ledger.insert_record("stale", record(50, now - Duration::hours(30)));
        ledger.insert_record("fresh", record(1, now));

        let order = eviction_order(
            &resident(&["fresh", "stale"]),
            &HashSet::new(),
            &ledger,
            Duration::hours(24),
        );
        assert_eq!(order, vec!["stale", "fresh"]);
    }
}
