//! Per-node transmission statistics.
//!
//! A tracer keeps two sets of counters. The window counters are reset by the
//! slot allocator before every schedule it produces; the lifetime totals are
//! never reset and feed the final report.

use std::sync::Arc;

use bansim_common::SimTime;
use parking_lot::Mutex;
use serde::Serialize;

/// Shared handle to a node's tracer.
///
/// The node stack writes it; the coordinator's slot allocator reads and resets
/// every node's window.
pub type TracerHandle = Arc<Mutex<Tracer>>;

/// Transmit energy in watts for a power level in dBm.
pub fn dbm_to_watts(tx_power_dbm: f64) -> f64 {
    if tx_power_dbm == 0.0 {
        0.001
    } else {
        10f64.powf(tx_power_dbm / 10.0) / 1000.0
    }
}

/// Per-node statistics.
#[derive(Debug, Clone)]
pub struct Tracer {
    initial_energy_w: f64,

    // Window
    tx_packet_count: u64,
    success_tx_packet_count: u64,
    success_tx_bit: u64,
    consumed_energy_w: f64,
    reset_time: SimTime,

    // Lifetime
    total_tx_packet_count: u64,
    total_success_tx_packet_count: u64,
    total_success_tx_bit: u64,
    transaction_count: u64,
    requested_packet_count: u64,
}

impl Tracer {
    /// Create a tracer for a node with the given initial energy budget.
    pub fn new(initial_energy_w: f64) -> Self {
        Tracer {
            initial_energy_w,
            tx_packet_count: 0,
            success_tx_packet_count: 0,
            success_tx_bit: 0,
            consumed_energy_w: 0.0,
            reset_time: SimTime::ZERO,
            total_tx_packet_count: 0,
            total_success_tx_packet_count: 0,
            total_success_tx_bit: 0,
            transaction_count: 0,
            requested_packet_count: 0,
        }
    }

    /// Wrap a fresh tracer in a shared handle.
    pub fn shared(initial_energy_w: f64) -> TracerHandle {
        Arc::new(Mutex::new(Self::new(initial_energy_w)))
    }

    /// Zero the window counters. Lifetime totals are left untouched.
    pub fn reset(&mut self, now: SimTime) {
        self.tx_packet_count = 0;
        self.success_tx_packet_count = 0;
        self.success_tx_bit = 0;
        self.consumed_energy_w = 0.0;
        self.reset_time = now;
    }

    /// Record a PHY transmission of any frame type.
    pub fn add_tx_packet(&mut self, tx_power_dbm: f64) {
        self.tx_packet_count += 1;
        self.total_tx_packet_count += 1;
        self.transaction_count += 1;
        self.consumed_energy_w += dbm_to_watts(tx_power_dbm);
    }

    /// Record an acknowledged data frame of `size` bytes.
    pub fn add_success_tx_packet(&mut self, size: usize) {
        let bits = size as u64 * 8;
        self.success_tx_packet_count += 1;
        self.total_success_tx_packet_count += 1;
        self.success_tx_bit += bits;
        self.total_success_tx_bit += bits;
    }

    /// Record a data request from the application.
    pub fn add_requested_packet(&mut self) {
        self.requested_packet_count += 1;
    }

    /// Throughput in bit/s, over the window or the whole run.
    ///
    /// Returns -1 when the window has zero length.
    pub fn get_throughput(&self, now: SimTime, total: bool) -> f64 {
        if now == self.reset_time {
            return -1.0;
        }
        if total {
            self.total_success_tx_bit as f64 / now.as_secs_f64()
        } else {
            let elapsed = (now - self.reset_time).as_secs_f64();
            self.success_tx_bit as f64 / elapsed
        }
    }

    /// Packet delivery ratio, over the window or the whole run.
    pub fn get_pkt_delivery_ratio(&self, total: bool) -> f64 {
        let (success, tx) = if total {
            (self.total_success_tx_packet_count, self.total_tx_packet_count)
        } else {
            (self.success_tx_packet_count, self.tx_packet_count)
        };
        if success == 0 || tx == 0 {
            0.0
        } else {
            success as f64 / tx as f64
        }
    }

    /// Window energy relative to the initial budget.
    pub fn get_energy_consumption_ratio(&self) -> f64 {
        if self.initial_energy_w <= 0.0 {
            return 0.0;
        }
        self.consumed_energy_w / self.initial_energy_w
    }

    /// Transmissions over the whole run; not cleared by [`Tracer::reset`].
    pub fn get_transaction_count(&self) -> u64 {
        self.transaction_count
    }

    /// Data requests issued by the application.
    pub fn get_requested_packet_count(&self) -> u64 {
        self.requested_packet_count
    }

    /// Frames handed to the PHY over the whole run.
    pub fn get_enqueued_packet_count(&self) -> u64 {
        self.total_tx_packet_count
    }

    /// Acknowledged data frames over the whole run.
    pub fn get_success_packet_count(&self) -> u64 {
        self.total_success_tx_packet_count
    }

    /// Window transmission count.
    pub fn tx_packet_count(&self) -> u64 {
        self.tx_packet_count
    }

    /// Window success count.
    pub fn success_tx_packet_count(&self) -> u64 {
        self.success_tx_packet_count
    }

    /// Snapshot for the final report.
    pub fn summary(&self, now: SimTime) -> TracerSummary {
        TracerSummary {
            requested: self.requested_packet_count,
            enqueued: self.total_tx_packet_count,
            success: self.total_success_tx_packet_count,
            pdr: self.get_pkt_delivery_ratio(true),
            throughput_kbps: self.get_throughput(now, true) / 1000.0,
            transactions: self.transaction_count,
            energy_ratio: self.get_energy_consumption_ratio(),
        }
    }
}

impl Default for Tracer {
    fn default() -> Self {
        Self::new(1.0)
    }
}

/// Final per-node figures.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TracerSummary {
    /// Data requests issued.
    pub requested: u64,
    /// Frames handed to the PHY.
    pub enqueued: u64,
    /// Acknowledged data frames.
    pub success: u64,
    /// Lifetime packet delivery ratio.
    pub pdr: f64,
    /// Lifetime throughput in kbit/s.
    pub throughput_kbps: f64,
    /// Transmissions of any frame type.
    pub transactions: u64,
    /// Window energy over the initial budget.
    pub energy_ratio: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_energy_conversion() {
        assert_eq!(dbm_to_watts(0.0), 0.001);
        assert!((dbm_to_watts(10.0) - 0.01).abs() < 1e-12);
        assert!((dbm_to_watts(-10.0) - 0.0001).abs() < 1e-12);
    }

    #[test]
    fn test_reset_keeps_totals() {
        let mut tracer = Tracer::new(1.0);
        tracer.add_tx_packet(0.0);
        tracer.add_tx_packet(0.0);
        tracer.add_success_tx_packet(100);
        tracer.reset(SimTime::from_millis(500));

        assert_eq!(tracer.tx_packet_count(), 0);
        assert_eq!(tracer.success_tx_packet_count(), 0);
        assert_eq!(tracer.get_energy_consumption_ratio(), 0.0);
        assert_eq!(tracer.get_enqueued_packet_count(), 2);
        assert_eq!(tracer.get_success_packet_count(), 1);
        assert_eq!(tracer.get_transaction_count(), 2);
    }

    #[test]
    fn test_throughput_window_and_total() {
        let mut tracer = Tracer::new(1.0);
        assert_eq!(tracer.get_throughput(SimTime::ZERO, true), -1.0);

        tracer.add_success_tx_packet(100);
        assert!((tracer.get_throughput(SimTime::from_secs(1.0), true) - 800.0).abs() < 1e-9);

        tracer.reset(SimTime::from_secs(1.0));
        assert_eq!(tracer.get_throughput(SimTime::from_secs(1.0), false), -1.0);
        tracer.add_success_tx_packet(50);
        let window = tracer.get_throughput(SimTime::from_secs(1.5), false);
        assert!((window - 800.0).abs() < 1e-9);
        let total = tracer.get_throughput(SimTime::from_secs(2.0), true);
        assert!((total - 600.0).abs() < 1e-9);
    }

    #[test]
    fn test_pdr_zero_guards() {
        let mut tracer = Tracer::new(1.0);
        assert_eq!(tracer.get_pkt_delivery_ratio(true), 0.0);
        tracer.add_tx_packet(0.0);
        assert_eq!(tracer.get_pkt_delivery_ratio(false), 0.0);
        tracer.add_tx_packet(0.0);
        tracer.add_success_tx_packet(10);
        assert_eq!(tracer.get_pkt_delivery_ratio(true), 0.5);
    }

    #[test]
    fn test_energy_ratio() {
        let mut tracer = Tracer::new(0.01);
        tracer.add_tx_packet(0.0);
        assert!((tracer.get_energy_consumption_ratio() - 0.1).abs() < 1e-12);
    }
}
