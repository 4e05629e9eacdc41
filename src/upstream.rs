use crate::fifo::Fifo;
use crate::request::{Request, Response};
use std::sync::{Arc, Mutex};

/// Shared handle to an upstream channel's response queue.
pub type ReturnQueue = Arc<Mutex<Fifo<Response>>>;

/// The queue bundle an upstream cache shares with the memory controller.
///
/// The cache pushes onto `rq`/`pq`/`wq`; the controller drains admissible
/// prefixes each tick and appends completions to `returned`.
#[derive(Debug, Default)]
pub struct UpstreamChannel {
    pub rq: Fifo<Request>,
    pub pq: Fifo<Request>,
    pub wq: Fifo<Request>,
    pub returned: ReturnQueue,
    pub sim_stats: stats::QueueStats,
    pub roi_stats: stats::QueueStats,
}

impl UpstreamChannel {
    /// An unbounded channel; the producing cache enforces its own limits.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn bounded(rq_size: usize, pq_size: usize, wq_size: usize) -> Self {
        Self {
            rq: Fifo::new(Some(rq_size)),
            pq: Fifo::new(Some(pq_size)),
            wq: Fifo::new(Some(wq_size)),
            ..Self::default()
        }
    }
}
