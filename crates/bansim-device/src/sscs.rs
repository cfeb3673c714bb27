//! Service-specific convergence sublayer.
//!
//! The coordinator builds a beacon with the TDMA schedule every beacon period
//! and feeds each slot's outcome back to its [`SlotAllocator`]. Peripherals
//! issue a data request at a fixed cadence.

use std::sync::Arc;

use bansim_common::{
    timer_id, AssignedLinkElement, EntityId, EventPayload, FrameSubtype, FrameType, NodeId, Packet,
    SimContext, SimError, SimTime, TxParams,
};
use bansim_mobility::{MovementPhase, SharedMobility};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::mac::{DataConfirm, DataConfirmStatus, Mac, MacNotification};
use crate::{TIMER_SSCS_BEACON_PERIOD, TIMER_SSCS_SEND_DATA};

/// Produces the coordinator's TDMA schedule and learns from its outcome.
pub trait SlotAllocator: Send {
    /// Node for each time slot, `None` leaving the slot unallocated.
    ///
    /// Called once per beacon.
    fn get_time_slots(&mut self, phase: MovementPhase, now: SimTime) -> Vec<Option<NodeId>>;

    /// Feed back the outcome of one slot of the last schedule.
    fn train(&mut self, slot: usize, node: Option<NodeId>, phase: MovementPhase, now: SimTime);

    /// Movement phase the next schedule is for.
    fn detect_movement_phase(&self) -> MovementPhase;

    /// Human-readable dump of the learned state, if any.
    fn report(&self) -> Option<String> {
        None
    }
}

/// Allocator shared between the coordinator node and the runner.
pub type SharedSlotAllocator = Arc<Mutex<dyn SlotAllocator>>;

/// SSCS parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SscsConfig {
    pub ban_id: u32,
    /// Size of beacons and data frames in bytes.
    pub packet_size: usize,
    /// Allocation slots granted per schedule entry.
    pub time_slots: u32,
    /// Allocation slots left free after each entry.
    pub slot_duration: u32,
    /// Transmit power granted in each schedule entry (dBm).
    pub tx_power_dbm: f64,
    /// Interval between data requests.
    pub data_interval: SimTime,
    /// First data request.
    pub first_data_delay: SimTime,
}

impl Default for SscsConfig {
    fn default() -> Self {
        SscsConfig {
            ban_id: 0,
            packet_size: 10,
            time_slots: 8,
            slot_duration: 1,
            tx_power_dbm: 0.0,
            data_interval: SimTime::from_millis(100),
            first_data_delay: SimTime::from_micros(200),
        }
    }
}

/// One slot of a sent schedule, kept until the beacon period ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSlotRecord {
    pub slot: usize,
    pub node: Option<NodeId>,
    pub phase: MovementPhase,
}

/// Upcall counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SscsStats {
    pub beacons_sent: u64,
    pub data_requested: u64,
    pub data_received: u64,
    /// Frames confirmed without an acknowledgement being involved, plus
    /// acknowledged data frames.
    pub success: u64,
    pub acks_sent: u64,
    pub no_ack: u64,
    pub counter_error: u64,
    pub channel_access_failure: u64,
    pub other_failures: u64,
}

/// One node's SSCS.
pub struct Sscs {
    node: NodeId,
    entity: EntityId,
    config: SscsConfig,
    allocator: Option<SharedSlotAllocator>,
    mobility: SharedMobility,
    beacon_interval: SimTime,
    slot_records: Vec<TimeSlotRecord>,
    stats: SscsStats,
}

impl Sscs {
    /// A node is the coordinator iff it is given an allocator.
    pub fn new(
        node: NodeId,
        entity: EntityId,
        config: SscsConfig,
        mobility: SharedMobility,
        allocator: Option<SharedSlotAllocator>,
    ) -> Self {
        let beacon_interval = mobility.read().current_phase_duration();
        Sscs {
            node,
            entity,
            config,
            allocator,
            mobility,
            beacon_interval,
            slot_records: Vec::new(),
            stats: SscsStats::default(),
        }
    }

    pub fn is_coordinator(&self) -> bool {
        self.allocator.is_some()
    }

    pub fn config(&self) -> &SscsConfig {
        &self.config
    }

    pub fn stats(&self) -> &SscsStats {
        &self.stats
    }

    pub fn beacon_interval(&self) -> SimTime {
        self.beacon_interval
    }

    /// Slots of the last schedule still waiting to be trained.
    pub fn slot_records(&self) -> &[TimeSlotRecord] {
        &self.slot_records
    }

    fn post(&self, ctx: &mut SimContext, delay: SimTime, kind: u32) {
        ctx.post_event(
            delay,
            vec![self.entity],
            EventPayload::Timer {
                timer_id: timer_id(kind, 0),
            },
        );
    }

    /// The beacon period follows the current movement phase.
    fn update_beacon_interval(&mut self) {
        self.beacon_interval = self.mobility.read().current_phase_duration();
    }

    /// Build and queue a beacon carrying the next schedule.
    pub fn send_beacon(&mut self, mac: &mut Mac, ctx: &mut SimContext) -> Result<(), SimError> {
        let Some(allocator) = self.allocator.clone() else {
            warn!("Sscs[{}]: not a coordinator, ignoring send_beacon request", self.node);
            return Ok(());
        };

        let tx_params = TxParams::new(self.config.ban_id, self.node, NodeId::BROADCAST);
        let mut packet: Packet = mac.set_mac_header(
            &tx_params,
            FrameType::Management,
            FrameSubtype::Beacon,
            self.config.packet_size,
        )?;

        self.update_beacon_interval();
        let beacon_length_ms = self.beacon_interval.as_millis();
        info!(
            "Sscs[{}]: sending beacon, interval {}, phase {}",
            self.node,
            self.beacon_interval,
            self.mobility.read().current_phase()
        );

        let (phase, slots) = {
            let mut allocator = allocator.lock();
            let phase = allocator.detect_movement_phase();
            (phase, allocator.get_time_slots(phase, ctx.time()))
        };
        info!("Sscs[{}]: time slot configuration {:?}", self.node, slots);

        let beacon = packet.body_mut().as_beacon_mut().ok_or_else(|| SimError::HandlerError {
            entity: self.entity,
            message: "beacon frame without beacon body".to_string(),
        })?;
        beacon.sender_address = Some(self.node);
        beacon.beacon_period_length = Some(beacon_length_ms as u32);

        self.slot_records.clear();
        let mut offset: u32 = 0;
        for (slot, node) in slots.into_iter().enumerate() {
            if let Some(node) = node {
                beacon.push_link(AssignedLinkElement::new(
                    node,
                    offset,
                    self.config.time_slots,
                    self.config.tx_power_dbm,
                    slot as u32,
                ));
            }
            self.slot_records.push(TimeSlotRecord { slot, node, phase });
            offset += self.config.time_slots + self.config.slot_duration;
            if offset as u64 > beacon_length_ms {
                break;
            }
        }

        mac.mlme_data_request(packet, ctx);
        self.stats.beacons_sent += 1;
        self.post(ctx, self.beacon_interval, TIMER_SSCS_BEACON_PERIOD);
        Ok(())
    }

    /// The beacon period elapsed: train on every slot, then send the next beacon.
    pub fn beacon_interval_timeout(&mut self, mac: &mut Mac, ctx: &mut SimContext) -> Result<(), SimError> {
        if let Some(allocator) = self.allocator.as_ref() {
            let mut allocator = allocator.lock();
            for record in self.slot_records.drain(..) {
                allocator.train(record.slot, record.node, record.phase, ctx.time());
            }
        }
        self.send_beacon(mac, ctx)
    }

    /// Issue one data request to the coordinator and schedule the next.
    pub fn send_data(&mut self, mac: &mut Mac, ctx: &mut SimContext) -> Result<(), SimError> {
        let tx_params = TxParams::new(self.config.ban_id, self.node, NodeId::COORDINATOR);
        mac.mcps_data_request(&tx_params, self.config.packet_size, ctx)?;
        mac.tracer().lock().add_requested_packet();
        self.stats.data_requested += 1;
        self.post(ctx, self.config.data_interval, TIMER_SSCS_SEND_DATA);
        Ok(())
    }

    /// Outcome of a transmission.
    pub fn data_confirm(&mut self, confirm: DataConfirm) {
        debug!("Sscs[{}]: data confirm {:?}", self.node, confirm);
        match confirm.status {
            DataConfirmStatus::Success if confirm.node_id.is_some() => self.stats.acks_sent += 1,
            DataConfirmStatus::Success => self.stats.success += 1,
            DataConfirmStatus::NoAck => self.stats.no_ack += 1,
            DataConfirmStatus::CounterError => self.stats.counter_error += 1,
            DataConfirmStatus::ChannelAccessFailure => self.stats.channel_access_failure += 1,
            _ => self.stats.other_failures += 1,
        }
    }

    /// A data frame addressed to this node arrived.
    pub fn data_indication(&mut self, packet: &Packet) {
        debug!(
            "Sscs[{}]: data from {}, seq {:?}",
            self.node,
            packet.header().sender_id,
            packet.header().sequence_number()
        );
        self.stats.data_received += 1;
    }

    /// Dispatch a MAC upcall.
    pub fn handle_notification(&mut self, notification: MacNotification) {
        match notification {
            MacNotification::DataConfirm(confirm) => self.data_confirm(confirm),
            MacNotification::DataIndication(packet) => self.data_indication(&packet),
        }
    }
}
