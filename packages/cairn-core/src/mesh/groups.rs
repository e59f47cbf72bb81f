//! Discovered-group aggregation.
//!
//! While Discovering, every advertisement collapses into one row per group
//! name: the strongest signal seen and when the group was last heard.
//! Groups fall off the list after the advertisement timeout of silence.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

/// One group as shown to the user while scanning.
#[derive(Debug, Clone)]
pub struct DiscoveredGroup {
    /// Advertised group name.
    pub group_name: String,
    /// Strongest RSSI observed across the group's advertisers (dBm).
    pub highest_rssi: i16,
    /// When an advertisement for this group was last received.
    pub last_seen_at: Instant,
}

/// Serializable view of [`DiscoveredGroup`].
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredGroupInfo {
    /// Advertised group name.
    #[serde(rename = "groupName")]
    pub group_name: String,
    /// Strongest RSSI observed (dBm).
    #[serde(rename = "highestRssi")]
    pub highest_rssi: i16,
    /// Milliseconds since the group was last heard.
    #[serde(rename = "lastSeenMsAgo")]
    pub last_seen_ms_ago: u64,
}

/// Aggregates advertisements by group name.
#[derive(Default)]
pub struct GroupTracker {
    groups: HashMap<String, DiscoveredGroup>,
}

impl GroupTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one advertisement. Returns `true` when the row changed in a
    /// way the UI cares about (new group, or a stronger signal).
    pub fn observe(&mut self, group_name: &str, rssi: i16, now: Instant) -> bool {
        match self.groups.get_mut(group_name) {
            Some(group) => {
                group.last_seen_at = now;
                if rssi > group.highest_rssi {
                    group.highest_rssi = rssi;
                    true
                } else {
                    false
                }
            }
            None => {
                self.groups.insert(
                    group_name.to_string(),
                    DiscoveredGroup {
                        group_name: group_name.to_string(),
                        highest_rssi: rssi,
                        last_seen_at: now,
                    },
                );
                true
            }
        }
    }

    /// Evicts groups silent for longer than `timeout`; returns their names.
    pub fn sweep(&mut self, timeout: Duration, now: Instant) -> Vec<String> {
        let expired: Vec<String> = self
            .groups
            .values()
            .filter(|group| now.duration_since(group.last_seen_at) > timeout)
            .map(|group| group.group_name.clone())
            .collect();
        for name in &expired {
            self.groups.remove(name);
        }
        expired
    }

    /// Clears every row (leaving Discovering).
    pub fn clear(&mut self) {
        self.groups.clear();
    }

    /// Snapshot for the UI, strongest signal first.
    #[must_use]
    pub fn snapshot(&self, now: Instant) -> Vec<DiscoveredGroupInfo> {
        let mut rows: Vec<DiscoveredGroupInfo> = self
            .groups
            .values()
            .map(|group| DiscoveredGroupInfo {
                group_name: group.group_name.clone(),
                highest_rssi: group.highest_rssi,
                last_seen_ms_ago: now.duration_since(group.last_seen_at).as_millis() as u64,
            })
            .collect();
        rows.sort_by(|a, b| b.highest_rssi.cmp(&a.highest_rssi));
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time;

    #[tokio::test]
    async fn first_observation_creates_row() {
        let mut tracker = GroupTracker::new();
        assert!(tracker.observe("Hike", -70, Instant::now()));
        let rows = tracker.snapshot(Instant::now());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].group_name, "Hike");
        assert_eq!(rows[0].highest_rssi, -70);
    }

    #[tokio::test]
    async fn rssi_aggregates_to_strongest() {
        let mut tracker = GroupTracker::new();
        tracker.observe("Hike", -70, Instant::now());
        assert!(tracker.observe("Hike", -50, Instant::now()));
        assert!(!tracker.observe("Hike", -80, Instant::now()));
        assert_eq!(tracker.snapshot(Instant::now())[0].highest_rssi, -50);
    }

    #[tokio::test]
    async fn snapshot_sorts_strongest_first() {
        let mut tracker = GroupTracker::new();
        tracker.observe("Far", -90, Instant::now());
        tracker.observe("Near", -40, Instant::now());
        let rows = tracker.snapshot(Instant::now());
        assert_eq!(rows[0].group_name, "Near");
        assert_eq!(rows[1].group_name, "Far");
    }

    #[tokio::test(start_paused = true)]
    async fn silent_groups_expire() {
        let mut tracker = GroupTracker::new();
        tracker.observe("Hike", -70, Instant::now());

        time::advance(Duration::from_secs(3)).await;
        tracker.observe("Camp", -60, Instant::now());

        time::advance(Duration::from_secs(2)).await;
        let expired = tracker.sweep(Duration::from_secs(4), Instant::now());
        assert_eq!(expired, vec!["Hike".to_string()]);
        assert_eq!(tracker.snapshot(Instant::now()).len(), 1);
    }
}
