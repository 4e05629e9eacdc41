use serde::{Deserialize, Serialize};

/// Configuration of the off-chip DRAM model.
///
/// All timings are picoseconds; all topology values are counts. Counts must
/// be powers of two except `columns`, which must be a power-of-two multiple
/// of `prefetch_size`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Controller clock period
    pub clock_period: u64,
    /// Row precharge latency (tRP)
    pub t_rp: u64,
    /// Row-to-column latency (tRCD)
    pub t_rcd: u64,
    /// Column access strobe latency (tCAS)
    pub t_cas: u64,
    /// Data bus idle time when the read/write direction flips
    pub turnaround: u64,
    /// Width of one channel's data bus in bytes
    pub channel_width: usize,
    /// Number of bursts composing one logical transfer
    pub prefetch_size: usize,
    /// Cache line size in bytes
    pub line_size: usize,
    /// Number of independent channels
    pub channels: usize,
    /// Ranks per channel
    pub ranks: usize,
    /// Banks per rank
    pub banks: usize,
    /// Rows per bank
    pub rows: usize,
    /// Columns per row
    pub columns: usize,
    /// Read queue capacity per channel
    pub rq_size: usize,
    /// Write queue capacity per channel
    pub wq_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            clock_period: 1_250,
            t_rp: 12_500,
            t_rcd: 12_500,
            t_cas: 12_500,
            turnaround: 7_500,
            channel_width: 8,
            prefetch_size: 8,
            line_size: 64,
            channels: 1,
            ranks: 1,
            banks: 8,
            rows: 65_536,
            columns: 1_024,
            rq_size: 64,
            wq_size: 64,
        }
    }
}
