use crate::addrdec::DramAddressMapping;
use crate::config::Config;
use crate::dram::{DramChannel, DramRequest};
use crate::request::Request;
use crate::upstream::{ReturnQueue, UpstreamChannel};
use color_eyre::eyre::{self, ensure};
use human_bytes::human_bytes;
use std::sync::{Arc, Mutex};

/// The off-chip memory controller: fans requests from the upstream channels
/// out to the per-channel schedulers, once per simulated tick.
#[derive(Debug)]
pub struct MemoryController {
    channels: Vec<DramChannel>,
    mapping: DramAddressMapping,
    queues: Vec<Arc<Mutex<UpstreamChannel>>>,
    clock_period: u64,
    channel_width: usize,
    current_time: u64,
    pub warmup: bool,
}

impl MemoryController {
    pub fn new(
        config: &Config,
        queues: Vec<Arc<Mutex<UpstreamChannel>>>,
    ) -> eyre::Result<Self> {
        ensure!(config.clock_period > 0, "clock period must be nonzero");
        ensure!(
            config.rq_size > 0 && config.wq_size > 0,
            "queue capacities must be nonzero"
        );
        let mapping = DramAddressMapping::new(
            config.channel_width,
            config.prefetch_size,
            config.line_size,
            config.channels,
            config.banks,
            config.columns,
            config.ranks,
            config.rows,
        )?;
        let channels = (0..config.channels)
            .map(|_| DramChannel::new(config, mapping))
            .collect();
        Ok(Self {
            channels,
            mapping,
            queues,
            clock_period: config.clock_period,
            channel_width: config.channel_width,
            current_time: 0,
            warmup: false,
        })
    }

    /// Run one clock tick. Returns how many observable steps were made.
    pub fn operate(&mut self) -> u64 {
        self.current_time += self.clock_period;

        self.initiate_requests();

        let mut progress = 0;
        for channel in &mut self.channels {
            progress += channel.operate();
        }
        progress
    }

    /// Drain the admissible prefix of every upstream queue. The first packet
    /// a channel refuses stays put and stops that queue for this tick.
    fn initiate_requests(&mut self) {
        let upstreams = self.queues.clone();
        for upstream in &upstreams {
            let mut upstream = upstream.lock().unwrap();
            let UpstreamChannel {
                rq,
                pq,
                wq,
                returned,
                ..
            } = &mut *upstream;
            rq.drain_while(|pkt| self.add_rq(pkt, returned));
            pq.drain_while(|pkt| self.add_rq(pkt, returned));
            wq.drain_while(|pkt| self.add_wq(pkt));
        }
    }

    /// Admit a read into its channel's read queue. Fails on a full queue;
    /// the caller retries next tick.
    pub fn add_rq(&mut self, packet: &Request, returned: &ReturnQueue) -> bool {
        let index = self.mapping.channel(packet.address) as usize;
        let channel = &mut self.channels[index];

        let Some(slot) = channel.rq.iter().position(Option::is_none) else {
            return false;
        };
        let mut entry = DramRequest::new(packet, self.current_time);
        if packet.response_requested {
            entry.packets[0].to_return = vec![Arc::clone(returned)];
        }
        log::trace!("{packet} enters RQ[{slot}]");
        channel.rq[slot] = Some(entry);
        true
    }

    /// Admit a write into its channel's write queue.
    pub fn add_wq(&mut self, packet: &Request) -> bool {
        let index = self.mapping.channel(packet.address) as usize;
        let channel = &mut self.channels[index];

        let Some(slot) = channel.wq.iter().position(Option::is_none) else {
            channel.sim_stats.wq_full += 1;
            return false;
        };
        log::trace!("{packet} enters WQ[{slot}]");
        channel.wq[slot] = Some(DramRequest::new(packet, self.current_time));
        true
    }

    pub fn initialize(&self) {
        log::info!(
            "off-chip DRAM size: {} channels: {} width: {}-bit data rate: {} MT/s",
            human_bytes(self.size_bytes() as f64),
            self.channels.len(),
            8 * self.channel_width,
            1_000_000 / self.clock_period,
        );
    }

    /// Install fresh statistics and snapshot the warmup flag per channel.
    pub fn begin_phase(&mut self) {
        for (index, channel) in self.channels.iter_mut().enumerate() {
            channel.sim_stats = stats::ChannelStats {
                name: format!("Channel {index}"),
                ..stats::ChannelStats::default()
            };
            channel.warmup = self.warmup;
        }
        for upstream in &self.queues {
            let mut upstream = upstream.lock().unwrap();
            upstream.sim_stats = stats::QueueStats::default();
            upstream.roi_stats = stats::QueueStats::default();
        }
    }

    pub fn end_phase(&mut self, cpu: usize) {
        for channel in &mut self.channels {
            channel.end_phase(cpu);
        }
    }

    /// Total addressable bytes across all channels.
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.mapping.size_bytes()
    }

    #[must_use]
    pub fn channels(&self) -> &[DramChannel] {
        &self.channels
    }

    #[must_use]
    pub fn current_time(&self) -> u64 {
        self.current_time
    }

    #[must_use]
    pub fn address_mapping(&self) -> &DramAddressMapping {
        &self.mapping
    }

    /// Dump queue contents when the outer driver suspects a deadlock.
    pub fn print_deadlock(&self) {
        for (index, channel) in self.channels.iter().enumerate() {
            log::warn!("DRAM channel {index}");
            channel.print_deadlock();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryController;
    use crate::config::Config;
    use crate::request::{Builder, Request};
    use crate::upstream::UpstreamChannel;
    use std::sync::{Arc, Mutex};

    fn test_config() -> Config {
        Config {
            clock_period: 1_000,
            t_rp: 12_000,
            t_rcd: 12_000,
            t_cas: 12_000,
            turnaround: 7_000,
            channel_width: 8,
            prefetch_size: 8,
            line_size: 64,
            channels: 1,
            ranks: 1,
            banks: 1,
            rows: 1_024,
            columns: 256,
            rq_size: 8,
            wq_size: 8,
        }
    }

    fn upstream() -> Arc<Mutex<UpstreamChannel>> {
        Arc::new(Mutex::new(UpstreamChannel::new()))
    }

    fn read(addr: u64) -> Request {
        Builder {
            address: addr,
            v_address: addr,
            response_requested: true,
            ..Builder::default()
        }
        .build()
    }

    fn write(addr: u64, data: u64) -> Request {
        Builder {
            address: addr,
            v_address: addr,
            data,
            ..Builder::default()
        }
        .build()
    }

    fn responses(upstream: &Arc<Mutex<UpstreamChannel>>) -> usize {
        upstream.lock().unwrap().returned.lock().unwrap().len()
    }

    /// With tRP = tRCD = tCAS = 12 cycles and an 8-cycle burst, a cold read
    /// schedules on its admission tick, reaches the bus 36 cycles later, and
    /// completes 8 cycles after that.
    #[test]
    fn single_read_miss_completes_after_activation_and_burst() {
        let upstream = upstream();
        let mut controller = MemoryController::new(&test_config(), vec![upstream.clone()]).unwrap();
        upstream.lock().unwrap().rq.enqueue(read(0x1000));

        for _ in 0..44 {
            controller.operate();
        }
        assert_eq!(responses(&upstream), 0);

        controller.operate();
        assert_eq!(controller.current_time(), 45_000);
        assert_eq!(responses(&upstream), 1);
        assert_eq!(controller.channels()[0].sim_stats.rq_row_buffer_miss, 1);
        assert_eq!(controller.channels()[0].sim_stats.rq_row_buffer_hit, 0);

        let response = upstream
            .lock()
            .unwrap()
            .returned
            .lock()
            .unwrap()
            .dequeue()
            .unwrap();
        assert_eq!(response.address, 0x1000);
    }

    /// The second read to an already-sensed row skips precharge and
    /// activation, paying only tCAS before its burst.
    #[test]
    fn back_to_back_same_row_reads_hit_the_row_buffer() {
        let upstream = upstream();
        let mut controller = MemoryController::new(&test_config(), vec![upstream.clone()]).unwrap();
        upstream.lock().unwrap().rq.enqueue(read(0x1000));
        controller.operate();
        // same row, next column (the bank holds it until the first finishes)
        upstream.lock().unwrap().rq.enqueue(read(0x1200));

        // first read: admitted at 1000, on the bus at 37000, done at 45000
        while controller.current_time() < 45_000 {
            controller.operate();
        }
        assert_eq!(responses(&upstream), 1);

        // second read: scheduled at 45000 as a hit, done at 45+12+8 cycles
        while controller.current_time() < 64_000 {
            controller.operate();
        }
        assert_eq!(responses(&upstream), 1);
        controller.operate();
        assert_eq!(responses(&upstream), 2);
        assert_eq!(controller.channels()[0].sim_stats.rq_row_buffer_hit, 1);
        assert_eq!(controller.channels()[0].sim_stats.rq_row_buffer_miss, 1);
    }

    /// A read that collides with a pending write is answered from the write
    /// queue on its admission tick, carrying the write's data.
    #[test]
    fn pending_write_answers_colliding_read_immediately() {
        let upstream = upstream();
        let mut controller = MemoryController::new(&test_config(), vec![upstream.clone()]).unwrap();
        upstream.lock().unwrap().wq.enqueue(write(0x2000, 0xDEAD));
        controller.operate();

        upstream.lock().unwrap().rq.enqueue(read(0x2000));
        controller.operate();

        assert_eq!(responses(&upstream), 1);
        let response = upstream
            .lock()
            .unwrap()
            .returned
            .lock()
            .unwrap()
            .dequeue()
            .unwrap();
        assert_eq!(response.data, 0xDEAD);
        assert_eq!(response.address, 0x2000);
        // the read never produced a DRAM transaction
        assert_eq!(controller.channels()[0].sim_stats.rq_row_buffer_hit, 0);
        assert_eq!(controller.channels()[0].sim_stats.rq_row_buffer_miss, 0);

        // the write itself still goes to DRAM, once
        for _ in 0..60 {
            controller.operate();
        }
        assert_eq!(responses(&upstream), 1);
        assert_eq!(controller.channels()[0].sim_stats.wq_row_buffer_miss, 1);
        assert_eq!(controller.channels()[0].wq_occupancy(), 0);
    }

    /// Reads from distinct issuers to one line coalesce into a single DRAM
    /// transaction that answers every issuer.
    #[test]
    fn coalesced_reads_share_one_transaction() {
        let upstreams: Vec<_> = (0..3).map(|_| upstream()).collect();
        let mut controller =
            MemoryController::new(&test_config(), upstreams.to_vec()).unwrap();
        for upstream in &upstreams {
            upstream.lock().unwrap().rq.enqueue(read(0x3000));
        }

        controller.operate();
        {
            let channel = &controller.channels()[0];
            assert_eq!(channel.rq_occupancy(), 1);
            let entry = channel.rq.iter().flatten().next().unwrap();
            assert_eq!(entry.packets.len(), 1);
            assert_eq!(entry.packets[0].to_return.len(), 3);
        }

        for _ in 0..60 {
            controller.operate();
        }
        for upstream in &upstreams {
            assert_eq!(responses(upstream), 1);
        }
        let stats = &controller.channels()[0].sim_stats;
        assert_eq!(stats.total_transactions(), 1);
    }

    /// Filling the write queue past 7/8 flips the channel into write mode,
    /// un-schedules speculative reads, and charges the bus turnaround.
    #[test]
    fn write_queue_pressure_flips_the_bus_direction() {
        let upstream = upstream();
        let mut controller = MemoryController::new(&test_config(), vec![upstream.clone()]).unwrap();
        upstream.lock().unwrap().rq.enqueue(read(0x1000));
        controller.operate();
        assert!(controller.channels()[0].banks[0].valid);

        for line in 0..7u64 {
            upstream
                .lock()
                .unwrap()
                .wq
                .enqueue(write(0x10_000 + line * 0x4000, line));
        }
        controller.operate();

        let channel = &controller.channels()[0];
        assert!(channel.write_mode);
        assert_eq!(channel.dbus_cycle_available, 2_000 + 7_000);
        // the read was speculative and lost its bank
        let entry = channel.rq.iter().flatten().next().unwrap();
        assert!(!entry.scheduled);
        assert_eq!(entry.ready_time, 2_000);
    }

    /// During warmup the channel answers reads the same tick and drops
    /// writes, without touching any bank.
    #[test]
    fn warmup_passes_requests_through_without_timing() {
        let upstream = upstream();
        let mut controller = MemoryController::new(&test_config(), vec![upstream.clone()]).unwrap();
        controller.warmup = true;
        controller.begin_phase();
        upstream.lock().unwrap().rq.enqueue(read(0x4000));
        upstream.lock().unwrap().wq.enqueue(write(0x8000, 1));

        controller.operate();
        assert_eq!(responses(&upstream), 1);
        let channel = &controller.channels()[0];
        assert_eq!(channel.rq_occupancy(), 0);
        assert_eq!(channel.wq_occupancy(), 0);
        assert!(channel.banks.iter().all(|bank| !bank.valid));
        assert_eq!(channel.sim_stats.total_transactions(), 0);
    }

    /// A full write queue refuses admission, counts the refusal, and leaves
    /// the packet upstream for a later retry.
    #[test]
    fn full_write_queue_applies_backpressure() {
        let upstream = upstream();
        let mut controller = MemoryController::new(&test_config(), vec![upstream.clone()]).unwrap();
        for line in 0..9u64 {
            upstream
                .lock()
                .unwrap()
                .wq
                .enqueue(write(0x10_000 + line * 0x4000, line));
        }
        controller.operate();

        assert_eq!(controller.channels()[0].wq_occupancy(), 8);
        assert_eq!(controller.channels()[0].sim_stats.wq_full, 1);
        assert_eq!(upstream.lock().unwrap().wq.len(), 1);
    }

    /// Requests are routed to the channel their address maps to.
    #[test]
    fn requests_route_by_channel_bits() {
        let config = Config {
            channels: 2,
            ..test_config()
        };
        let upstream = upstream();
        let mut controller = MemoryController::new(&config, vec![upstream.clone()]).unwrap();
        // bit 6 selects the channel in this topology
        upstream.lock().unwrap().rq.enqueue(read(0x1000));
        upstream.lock().unwrap().rq.enqueue(read(0x1040));
        controller.operate();

        assert_eq!(controller.channels()[0].rq_occupancy(), 1);
        assert_eq!(controller.channels()[1].rq_occupancy(), 1);
    }

    #[test]
    fn begin_phase_names_channel_stats_and_snapshots_warmup() {
        let mut controller = MemoryController::new(&test_config(), Vec::new()).unwrap();
        controller.warmup = true;
        controller.begin_phase();
        assert_eq!(controller.channels()[0].sim_stats.name, "Channel 0");
        assert!(controller.channels()[0].warmup);
    }

    #[test]
    fn end_phase_snapshots_roi_stats() {
        let upstream = upstream();
        let mut controller = MemoryController::new(&test_config(), vec![upstream.clone()]).unwrap();
        upstream.lock().unwrap().rq.enqueue(read(0x1000));
        for _ in 0..60 {
            controller.operate();
        }
        controller.end_phase(0);
        assert_eq!(controller.channels()[0].roi_stats.rq_row_buffer_miss, 1);
    }

    #[test]
    fn reports_total_addressable_bytes() {
        // 6 offset + 0 channel + 0 bank + 0 rank + 5 column + 10 row bits
        let controller = MemoryController::new(&test_config(), Vec::new()).unwrap();
        assert_eq!(controller.size_bytes(), 1 << 21);
    }
}
