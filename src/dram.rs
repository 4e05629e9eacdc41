use crate::addrdec::DramAddressMapping;
use crate::address;
use crate::config::Config;
use crate::request::{Request, Response};
use crate::upstream::ReturnQueue;
use console::style;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Ready-time sentinel for entries that already own a bank.
const NEVER: u64 = u64::MAX;

/// Which per-channel queue a bank's scheduled entry lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Read,
    Write,
}

/// One upstream request folded into a queue entry. Several packets share an
/// entry when their addresses fall on the same line.
#[derive(Debug, Clone)]
pub struct Packet {
    pub address: address,
    pub v_address: address,
    pub data: u64,
    pub pf_metadata: u32,
    pub instr_depend_on_me: BTreeSet<u64>,
    pub asid: [u16; 2],
    pub to_return: Vec<ReturnQueue>,
}

impl Packet {
    fn new(req: &Request) -> Self {
        Self {
            address: req.address,
            v_address: req.v_address,
            data: req.data,
            pf_metadata: req.pf_metadata,
            instr_depend_on_me: req.instr_depend_on_me.clone(),
            asid: req.asid,
            to_return: Vec::new(),
        }
    }

    fn response(&self) -> Response {
        Response {
            address: self.address,
            v_address: self.v_address,
            data: self.data,
            pf_metadata: self.pf_metadata,
            instr_depend_on_me: self.instr_depend_on_me.clone(),
        }
    }

    fn push_response(&self, response: &Response) {
        for ret in &self.to_return {
            ret.lock().unwrap().enqueue(response.clone());
        }
    }
}

/// A queue slot: one or more same-line packets moving through the channel as
/// a single DRAM transaction.
#[derive(Debug, Clone)]
pub struct DramRequest {
    pub address: address,
    pub packets: Vec<Packet>,
    pub ready_time: u64,
    pub scheduled: bool,
    pub forward_checked: bool,
}

impl DramRequest {
    pub(crate) fn new(req: &Request, now: u64) -> Self {
        Self {
            address: req.address,
            packets: vec![Packet::new(req)],
            ready_time: now,
            scheduled: false,
            forward_checked: false,
        }
    }
}

/// Timing state of one (rank, bank) pair.
#[derive(Debug, Clone, Default)]
pub struct BankRequest {
    pub valid: bool,
    pub row_buffer_hit: bool,
    pub open_row: Option<u64>,
    pub ready_time: u64,
    /// Back-reference to the scheduled entry, as (queue, slot).
    pub pkt: Option<(QueueKind, usize)>,
}

/// One DRAM channel: request queues, per-bank timing, and the data bus.
#[derive(Debug)]
pub struct DramChannel {
    clock_period: u64,
    t_rp: u64,
    t_rcd: u64,
    t_cas: u64,
    dbus_turnaround: u64,
    /// Time to stream one full transfer at channel width.
    dbus_return_time: u64,
    mapping: DramAddressMapping,
    pub(crate) rq: Vec<Option<DramRequest>>,
    pub(crate) wq: Vec<Option<DramRequest>>,
    pub(crate) banks: Vec<BankRequest>,
    /// Bank whose data currently occupies the bus, if any.
    pub(crate) active_request: Option<usize>,
    pub(crate) write_mode: bool,
    pub(crate) dbus_cycle_available: u64,
    pub current_time: u64,
    pub warmup: bool,
    pub sim_stats: stats::ChannelStats,
    pub roi_stats: stats::ChannelStats,
}

impl DramChannel {
    #[must_use]
    pub fn new(config: &Config, mapping: DramAddressMapping) -> Self {
        Self {
            clock_period: config.clock_period,
            t_rp: config.t_rp,
            t_rcd: config.t_rcd,
            t_cas: config.t_cas,
            dbus_turnaround: config.turnaround,
            dbus_return_time: config.clock_period * config.prefetch_size as u64,
            rq: vec![None; config.rq_size],
            wq: vec![None; config.wq_size],
            banks: vec![BankRequest::default(); mapping.ranks() * mapping.banks()],
            mapping,
            active_request: None,
            write_mode: false,
            dbus_cycle_available: 0,
            current_time: 0,
            warmup: false,
            sim_stats: stats::ChannelStats::default(),
            roi_stats: stats::ChannelStats::default(),
        }
    }

    fn queue(&self, kind: QueueKind) -> &[Option<DramRequest>] {
        match kind {
            QueueKind::Read => &self.rq,
            QueueKind::Write => &self.wq,
        }
    }

    fn queue_mut(&mut self, kind: QueueKind) -> &mut [Option<DramRequest>] {
        match kind {
            QueueKind::Read => &mut self.rq,
            QueueKind::Write => &mut self.wq,
        }
    }

    pub(crate) fn bank_index(&self, addr: address) -> usize {
        self.mapping.rank(addr) as usize * self.mapping.banks() + self.mapping.bank(addr) as usize
    }

    #[must_use]
    pub fn rq_occupancy(&self) -> usize {
        self.rq.iter().flatten().count()
    }

    #[must_use]
    pub fn wq_occupancy(&self) -> usize {
        self.wq.iter().flatten().count()
    }

    /// Run one clock tick. Returns how many observable steps were made.
    pub fn operate(&mut self) -> u64 {
        self.current_time += self.clock_period;

        let mut progress = 0;
        if self.warmup {
            progress += self.drain_for_warmup();
        }

        progress += self.check_write_collision();
        progress += self.check_read_collision();
        progress += self.finish_dbus_request();
        self.swap_write_mode();
        progress += self.populate_dbus();
        progress += self.schedule_packets();
        progress
    }

    /// Timing-agnostic fast path: answer reads instantly, drop writes.
    fn drain_for_warmup(&mut self) -> u64 {
        let mut progress = 0;
        for slot in &mut self.rq {
            if let Some(entry) = slot.take() {
                for pkt in &entry.packets {
                    pkt.push_response(&pkt.response());
                }
                progress += 1;
            }
        }
        for slot in &mut self.wq {
            if slot.take().is_some() {
                progress += 1;
            }
        }
        progress
    }

    /// Drop writes that land on a line already covered by another write.
    fn check_write_collision(&mut self) -> u64 {
        let mut progress = 0;
        for idx in 0..self.wq.len() {
            let Some(addr) = self.wq[idx]
                .as_ref()
                .filter(|entry| !entry.forward_checked)
                .map(|entry| entry.address)
            else {
                continue;
            };

            let duplicate = self.wq.iter().enumerate().any(|(other, slot)| {
                other != idx
                    && slot
                        .as_ref()
                        .is_some_and(|entry| self.mapping.is_collision(entry.address, addr))
            });
            if duplicate {
                log::debug!("dropping duplicate write for {addr:#x}");
                self.wq[idx] = None;
                progress += 1;
            } else if let Some(entry) = self.wq[idx].as_mut() {
                entry.forward_checked = true;
            }
        }
        progress
    }

    /// Serve reads from pending writes and fold same-line reads together.
    fn check_read_collision(&mut self) -> u64 {
        let mut progress = 0;
        for idx in 0..self.rq.len() {
            let Some(addr) = self.rq[idx]
                .as_ref()
                .filter(|entry| !entry.forward_checked)
                .map(|entry| entry.address)
            else {
                continue;
            };

            // a pending write to the same line already holds the data
            let forwarded_data = self
                .wq
                .iter()
                .flatten()
                .find(|write| self.mapping.is_collision(write.address, addr))
                .map(|write| write.packets[0].data);

            // earlier slots take precedence as the merge target
            let merge_target = if forwarded_data.is_some() {
                None
            } else {
                (0..idx).chain(idx + 1..self.rq.len()).find(|&other| {
                    self.rq[other]
                        .as_ref()
                        .is_some_and(|entry| self.mapping.is_collision(entry.address, addr))
                })
            };

            if let Some(data) = forwarded_data {
                if let Some(entry) = self.rq[idx].take() {
                    log::debug!("answering read {addr:#x} from a pending write");
                    for pkt in &entry.packets {
                        let response = Response {
                            data,
                            ..pkt.response()
                        };
                        pkt.push_response(&response);
                    }
                    progress += 1;
                }
            } else if let Some(other) = merge_target {
                if let Some(entry) = self.rq[idx].take() {
                    log::debug!("coalescing read {addr:#x} into slot {other}");
                    if let Some(target) = self.rq[other].as_mut() {
                        merge_packets(target, entry.packets);
                    }
                    progress += 1;
                }
            } else if let Some(entry) = self.rq[idx].as_mut() {
                entry.forward_checked = true;
            }
        }
        progress
    }

    /// Complete the request currently streaming on the data bus.
    fn finish_dbus_request(&mut self) -> u64 {
        let Some(bank_idx) = self.active_request else {
            return 0;
        };
        if self.banks[bank_idx].ready_time > self.current_time {
            return 0;
        }

        if let Some((kind, slot)) = self.banks[bank_idx].pkt.take() {
            if let Some(entry) = self.queue_mut(kind)[slot].take() {
                log::trace!("request for {:#x} leaves the data bus", entry.address);
                for pkt in &entry.packets {
                    pkt.push_response(&pkt.response());
                }
            }
        }
        self.banks[bank_idx].valid = false;
        self.active_request = None;
        1
    }

    /// Flip between read and write bursts when the queues become unbalanced.
    fn swap_write_mode(&mut self) {
        // these watermarks control when to send out a burst of writes
        let high_watermark = (self.wq.len() * 7) >> 3;
        let low_watermark = (self.wq.len() * 6) >> 3;

        let wq_occu = self.wq_occupancy();
        let rq_occu = self.rq_occupancy();

        let flip = if self.write_mode {
            wq_occu == 0 || (rq_occu > 0 && wq_occu < low_watermark)
        } else {
            wq_occu >= high_watermark || (rq_occu == 0 && wq_occu > 0)
        };
        if !flip {
            return;
        }

        // in-flight scheduling is speculative; only the request already
        // bursting on the bus survives the flip
        for idx in 0..self.banks.len() {
            if Some(idx) == self.active_request || !self.banks[idx].valid {
                continue;
            }
            // a row sense that cannot finish before the flip is lost
            if self.banks[idx].ready_time < self.current_time + self.t_cas {
                self.banks[idx].open_row = None;
            }
            self.banks[idx].valid = false;
            if let Some((kind, slot)) = self.banks[idx].pkt.take() {
                let now = self.current_time;
                if let Some(entry) = self.queue_mut(kind)[slot].as_mut() {
                    entry.scheduled = false;
                    entry.ready_time = now;
                }
            }
        }

        self.dbus_cycle_available = match self.active_request {
            Some(bank) => self.banks[bank].ready_time,
            None => self.current_time,
        } + self.dbus_turnaround;

        self.write_mode = !self.write_mode;
        log::debug!(
            "{}, dbus free at {}",
            style(if self.write_mode {
                "switching to write mode"
            } else {
                "switching to read mode"
            })
            .red(),
            self.dbus_cycle_available,
        );
    }

    /// Put the most overdue bank's data on the bus, or account congestion.
    fn populate_dbus(&mut self) -> u64 {
        let mut next: Option<usize> = None;
        for (idx, bank) in self.banks.iter().enumerate() {
            if !bank.valid {
                continue;
            }
            let earlier = match next {
                None => true,
                Some(best) => bank.ready_time < self.banks[best].ready_time,
            };
            if earlier {
                next = Some(idx);
            }
        }
        let Some(bank_idx) = next else {
            return 0;
        };
        if self.banks[bank_idx].ready_time > self.current_time {
            return 0;
        }

        if self.active_request.is_none() && self.dbus_cycle_available <= self.current_time {
            self.active_request = Some(bank_idx);
            self.banks[bank_idx].ready_time = self.current_time + self.dbus_return_time;

            match (self.write_mode, self.banks[bank_idx].row_buffer_hit) {
                (false, true) => self.sim_stats.rq_row_buffer_hit += 1,
                (false, false) => self.sim_stats.rq_row_buffer_miss += 1,
                (true, true) => self.sim_stats.wq_row_buffer_hit += 1,
                (true, false) => self.sim_stats.wq_row_buffer_miss += 1,
            }
            1
        } else {
            let blocker = match self.active_request {
                Some(active) => self.banks[active].ready_time,
                None => self.dbus_cycle_available,
            };
            self.sim_stats.dbus_cycle_congested += (blocker - self.current_time) / self.clock_period;
            self.sim_stats.dbus_count_congested += 1;
            0
        }
    }

    /// Pick the next unscheduled entry and occupy its bank.
    fn schedule_packets(&mut self) -> u64 {
        let kind = if self.write_mode {
            QueueKind::Write
        } else {
            QueueKind::Read
        };
        let Some(slot) = self.next_schedule(kind) else {
            return 0;
        };
        let Some((addr, ready_time)) = self.queue(kind)[slot]
            .as_ref()
            .map(|entry| (entry.address, entry.ready_time))
        else {
            return 0;
        };
        if ready_time > self.current_time {
            return 0;
        }

        let bank_idx = self.bank_index(addr);
        if self.banks[bank_idx].valid {
            return 0;
        }

        let row = self.mapping.row(addr);
        let row_buffer_hit = self.banks[bank_idx].open_row == Some(row);
        let activation = if row_buffer_hit {
            0
        } else {
            self.t_rp + self.t_rcd
        };
        self.banks[bank_idx] = BankRequest {
            valid: true,
            row_buffer_hit,
            open_row: Some(row),
            ready_time: self.current_time + self.t_cas + activation,
            pkt: Some((kind, slot)),
        };
        if let Some(entry) = self.queue_mut(kind)[slot].as_mut() {
            entry.scheduled = true;
            entry.ready_time = NEVER;
        }
        log::trace!(
            "scheduled {:#x} onto bank {} (row buffer {})",
            addr,
            bank_idx,
            if row_buffer_hit { "hit" } else { "miss" },
        );
        1
    }

    /// The queue slot the bank scheduler should try next: unscheduled
    /// entries whose bank is free first, then earliest ready time, then
    /// lowest slot.
    fn next_schedule(&self, kind: QueueKind) -> Option<usize> {
        let queue = self.queue(kind);
        let mut best: Option<(usize, bool, u64)> = None;
        for (slot, entry) in queue.iter().enumerate() {
            let Some(entry) = entry.as_ref().filter(|entry| !entry.scheduled) else {
                continue;
            };
            let bank_free = !self.banks[self.bank_index(entry.address)].valid;
            best = match best {
                None => Some((slot, bank_free, entry.ready_time)),
                Some((_, best_free, best_ready)) => {
                    let preferred = if bank_free && best_free {
                        entry.ready_time < best_ready
                    } else {
                        bank_free && !best_free
                    };
                    if preferred {
                        Some((slot, bank_free, entry.ready_time))
                    } else {
                        best
                    }
                }
            };
        }
        best.map(|(slot, _, _)| slot)
    }

    pub fn end_phase(&mut self, _cpu: usize) {
        self.roi_stats = self.sim_stats.clone();
    }

    /// Dump queue contents when the outer driver suspects a deadlock.
    pub fn print_deadlock(&self) {
        for (name, queue) in [("RQ", &self.rq), ("WQ", &self.wq)] {
            log::warn!("{name} occupancy: {}", queue.iter().flatten().count());
            for (slot, entry) in queue.iter().enumerate() {
                let Some(entry) = entry else { continue };
                for pkt in &entry.packets {
                    log::warn!(
                        "{name}[{slot}] address: {:#x} v_addr: {:#x}",
                        pkt.address,
                        pkt.v_address,
                    );
                }
            }
        }
    }
}

/// Fold `packets` into `target`, unioning dependents and return sinks of
/// exact-address matches and appending the rest.
fn merge_packets(target: &mut DramRequest, packets: Vec<Packet>) {
    for pkt in packets {
        match target
            .packets
            .iter_mut()
            .find(|existing| existing.address == pkt.address)
        {
            Some(existing) => {
                existing.instr_depend_on_me.extend(pkt.instr_depend_on_me);
                for ret in pkt.to_return {
                    if !existing.to_return.iter().any(|known| Arc::ptr_eq(known, &ret)) {
                        existing.to_return.push(ret);
                    }
                }
            }
            None => target.packets.push(pkt),
        }
    }
}
