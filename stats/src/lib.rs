use serde::{Deserialize, Serialize};
use std::ops::AddAssign;

/// Counters for one DRAM channel.
#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStats {
    pub name: String,
    /// Reads that found their row already sensed
    pub rq_row_buffer_hit: u64,
    /// Reads that had to activate their row first
    pub rq_row_buffer_miss: u64,
    /// Writes that found their row already sensed
    pub wq_row_buffer_hit: u64,
    /// Writes that had to activate their row first
    pub wq_row_buffer_miss: u64,
    /// Write admissions refused because the write queue was full
    pub wq_full: u64,
    /// Clock cycles spent waiting for the data bus
    pub dbus_cycle_congested: u64,
    /// Bus grants that had to wait
    pub dbus_count_congested: u64,
}

impl ChannelStats {
    /// Total transactions put on the data bus.
    #[must_use]
    pub fn total_transactions(&self) -> u64 {
        self.rq_row_buffer_hit
            + self.rq_row_buffer_miss
            + self.wq_row_buffer_hit
            + self.wq_row_buffer_miss
    }
}

impl AddAssign for ChannelStats {
    fn add_assign(&mut self, other: Self) {
        self.rq_row_buffer_hit += other.rq_row_buffer_hit;
        self.rq_row_buffer_miss += other.rq_row_buffer_miss;
        self.wq_row_buffer_hit += other.wq_row_buffer_hit;
        self.wq_row_buffer_miss += other.wq_row_buffer_miss;
        self.wq_full += other.wq_full;
        self.dbus_cycle_congested += other.dbus_cycle_congested;
        self.dbus_count_congested += other.dbus_count_congested;
    }
}

/// Counters for the queues of one upstream channel.
///
/// These are bumped by the producing cache, not by the controller; the
/// controller only resets them at phase boundaries.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub rq_access: u64,
    pub rq_full: u64,
    pub pq_access: u64,
    pub pq_full: u64,
    pub wq_access: u64,
    pub wq_full: u64,
}

impl AddAssign for QueueStats {
    fn add_assign(&mut self, other: Self) {
        self.rq_access += other.rq_access;
        self.rq_full += other.rq_full;
        self.pq_access += other.pq_access;
        self.pq_full += other.pq_full;
        self.wq_access += other.wq_access;
        self.wq_full += other.wq_full;
    }
}

#[cfg(test)]
mod tests {
    use super::ChannelStats;

    #[test]
    fn channel_stats_accumulate() {
        let mut total = ChannelStats {
            name: "Channel 0".to_string(),
            rq_row_buffer_hit: 3,
            dbus_count_congested: 1,
            ..ChannelStats::default()
        };
        total += ChannelStats {
            rq_row_buffer_hit: 2,
            rq_row_buffer_miss: 7,
            ..ChannelStats::default()
        };
        assert_eq!(total.rq_row_buffer_hit, 5);
        assert_eq!(total.rq_row_buffer_miss, 7);
        assert_eq!(total.dbus_count_congested, 1);
        assert_eq!(total.total_transactions(), 12);
        assert_eq!(total.name, "Channel 0");
    }
}
