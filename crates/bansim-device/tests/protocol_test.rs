//! End-to-end protocol scenarios: a coordinator and its peripherals exchange
//! frames over a real channel, driven by a minimal event loop.

use std::collections::{BTreeMap, BinaryHeap};
use std::sync::Arc;

use bansim_channel::{Channel, ChannelConfig, PropDelayModel, PropLossModel};
use bansim_common::{
    Entity, EntityId, Event, EventId, EventPayload, FrameBody, FrameSubtype, FrameType, MacHeader,
    NodeId, Packet, ReceiveAirEvent, SimContext, SimTime, TxParams,
};
use bansim_device::{
    AccessMode, Allocation, BanNode, MacState, NodeConfig, SharedSlotAllocator, SlotAllocator,
};
use bansim_mobility::{BodyPosition, MobilityHelper, MovementPhase};
use parking_lot::Mutex;

const CHANNEL: EntityId = EntityId(100);
const COORDINATOR: EntityId = EntityId(1);

fn peripheral(i: u32) -> EntityId {
    EntityId(2 + i as u64)
}

/// Hands out the same schedule every beacon.
struct FixedAllocator {
    slots: Vec<Option<NodeId>>,
}

impl SlotAllocator for FixedAllocator {
    fn get_time_slots(&mut self, _phase: MovementPhase, _now: SimTime) -> Vec<Option<NodeId>> {
        self.slots.clone()
    }

    fn train(&mut self, _slot: usize, _node: Option<NodeId>, _phase: MovementPhase, _now: SimTime) {}

    fn detect_movement_phase(&self) -> MovementPhase {
        MovementPhase::Phase0
    }
}

/// A frame as the channel saw it, at the end of its air time.
#[derive(Debug, Clone)]
struct Transmission {
    time: SimTime,
    sender: NodeId,
    frame_type: FrameType,
}

struct Harness {
    ctx: SimContext,
    queue: BinaryHeap<Event>,
    channel: Channel,
    nodes: BTreeMap<EntityId, BanNode>,
    air: Vec<Transmission>,
}

impl Harness {
    fn new(peripherals: u32, slots: Vec<Option<NodeId>>, configure: impl Fn(&mut NodeConfig)) -> Self {
        let mut helper = MobilityHelper::new();
        helper.add_mobility(NodeId::COORDINATOR, BodyPosition::Body);
        for i in 0..peripherals {
            helper.add_mobility(NodeId(i), BodyPosition::for_peripheral(i as usize).unwrap());
        }
        let mobility = helper.into_shared();

        let mut channel = Channel::new(CHANNEL, ChannelConfig::default(), mobility.clone());
        channel.set_loss_model(Box::new(PropLossModel::new()));
        channel.set_delay_model(Box::new(PropDelayModel::new()));

        let allocator: SharedSlotAllocator = Arc::new(Mutex::new(FixedAllocator { slots }));
        let mut nodes = BTreeMap::new();

        let mut config = NodeConfig::new(NodeId::COORDINATOR);
        configure(&mut config);
        channel.add_phy(COORDINATOR, NodeId::COORDINATOR);
        nodes.insert(
            COORDINATOR,
            BanNode::new(COORDINATOR, CHANNEL, config, mobility.clone(), Some(allocator)),
        );

        for i in 0..peripherals {
            let mut config = NodeConfig::new(NodeId(i));
            configure(&mut config);
            channel.add_phy(peripheral(i), NodeId(i));
            nodes.insert(
                peripheral(i),
                BanNode::new(peripheral(i), CHANNEL, config, mobility.clone(), None),
            );
        }

        let mut harness = Harness {
            ctx: SimContext::new(42),
            queue: BinaryHeap::new(),
            channel,
            nodes,
            air: Vec::new(),
        };
        for (id, node) in harness.nodes.iter_mut() {
            harness.ctx.set_source(*id);
            node.start(&mut harness.ctx).unwrap();
        }
        harness.flush();
        harness
    }

    fn flush(&mut self) {
        for event in self.ctx.take_pending_events() {
            self.queue.push(event);
        }
    }

    fn run_until(&mut self, end: SimTime) {
        while self.queue.peek().map_or(false, |e| e.time <= end) {
            let event = self.queue.pop().unwrap();
            self.ctx.set_time(event.time);
            for &target in &event.targets {
                self.ctx.set_source(target);
                if target == CHANNEL {
                    if let EventPayload::TransmitAir(tx) = &event.payload {
                        self.air.push(Transmission {
                            time: event.time,
                            sender: tx.packet.header().sender_id,
                            frame_type: tx.packet.header().frame_type(),
                        });
                    }
                    self.channel.handle_event(&event, &mut self.ctx).unwrap();
                } else if let Some(node) = self.nodes.get_mut(&target) {
                    node.handle_event(&event, &mut self.ctx).unwrap();
                }
            }
            self.flush();
        }
    }

    /// Deliver a foreign frame straight to a node's receiver.
    fn inject(&mut self, time: SimTime, target: EntityId, packet: Packet) {
        let id = self.ctx.next_event_id();
        self.queue.push(Event {
            id: EventId(id),
            time,
            source: CHANNEL,
            targets: vec![target],
            payload: EventPayload::ReceiveAir(ReceiveAirEvent {
                source_phy_id: CHANNEL,
                packet,
            }),
        });
    }

    fn node(&self, id: EntityId) -> &BanNode {
        &self.nodes[&id]
    }

    fn sent_by(&self, sender: NodeId, frame_type: FrameType) -> Vec<Transmission> {
        self.air
            .iter()
            .filter(|t| t.sender == sender && t.frame_type == frame_type)
            .cloned()
            .collect()
    }

    fn assert_tracers_consistent(&self) {
        for node in self.nodes.values() {
            let tracer = node.tracer();
            let tracer = tracer.lock();
            assert!(
                tracer.get_success_packet_count() <= tracer.get_enqueued_packet_count(),
                "node {} reports more successes than transmissions",
                node.node_id()
            );
        }
    }
}

fn schedule_with(slot: usize, node: NodeId) -> Vec<Option<NodeId>> {
    let mut slots = vec![None; 8];
    slots[slot] = Some(node);
    slots
}

/// A strong frame from another BAN.
fn foreign_frame() -> Packet {
    let tx = TxParams::new(1, NodeId(7), NodeId(0));
    let header = MacHeader::from_tx_params(&tx, FrameType::Data, FrameSubtype::DataUp0).unwrap();
    let mut packet = Packet::new(10, header, FrameBody::Data { priority: 0 });
    packet.spectrum.tx_power_dbm = 0.0;
    packet
}

#[test]
fn test_assigned_peripheral_transmits_inside_its_slot() {
    let mut h = Harness::new(2, schedule_with(2, NodeId(0)), |_| {});
    h.run_until(SimTime::from_millis(450));

    let beacons = h.sent_by(NodeId::COORDINATOR, FrameType::Management);
    assert_eq!(beacons.len(), 1);
    let air_time = h.node(COORDINATOR).mac().phy().tx_duration(10);
    let beacon_rx = beacons[0].time + air_time;

    // Slot 2 starts after two 9-slot entries
    assert_eq!(
        h.node(peripheral(0)).mac().allocation(),
        Some(Allocation {
            start: SimTime::from_micros(18_075),
            end: SimTime::from_micros(26_000),
        })
    );
    assert_eq!(h.node(peripheral(0)).mac().time_slot_index(), Some(2));

    let data = h.sent_by(NodeId(0), FrameType::Data);
    assert_eq!(data.len(), 1);
    let tx_start = data[0].time - air_time;
    assert!(tx_start >= beacon_rx + SimTime::from_micros(18_075), "sent before the slot: {}", tx_start);
    assert!(data[0].time <= beacon_rx + SimTime::from_micros(26_001), "overran the slot: {}", data[0].time);

    // Node 1 holds no slot and stays silent
    assert!(h.node(peripheral(1)).mac().allocation().is_none());
    assert!(h.sent_by(NodeId(1), FrameType::Data).is_empty());
    assert_eq!(h.node(peripheral(1)).sscs_stats().data_requested, 5);
    assert_eq!(h.node(peripheral(1)).mac().queue_len(), 5);
    assert_eq!(h.node(peripheral(1)).tracer().lock().get_enqueued_packet_count(), 0);

    h.assert_tracers_consistent();
}

#[test]
fn test_acknowledged_exchange_inside_slot() {
    let mut h = Harness::new(2, schedule_with(2, NodeId(0)), |_| {});
    h.run_until(SimTime::from_millis(450));

    let sender = h.node(peripheral(0));
    assert_eq!(sender.sscs_stats().success, 1);
    assert_eq!(sender.sscs_stats().no_ack, 0);
    assert_eq!(sender.mac_state(), MacState::Idle);
    assert_eq!(sender.tracer().lock().get_success_packet_count(), 1);
    // Later requests wait for the next beacon
    assert_eq!(sender.mac().queue_len(), 4);

    let coordinator = h.node(COORDINATOR);
    assert_eq!(coordinator.sscs_stats().data_received, 1);
    assert_eq!(coordinator.sscs_stats().acks_sent, 1);
    assert_eq!(h.sent_by(NodeId::COORDINATOR, FrameType::Control).len(), 1);

    h.assert_tracers_consistent();
}

#[test]
fn test_frames_below_sensitivity_never_reach_the_mac() {
    let mut h = Harness::new(2, schedule_with(2, NodeId(0)), |config| {
        if config.node_id == NodeId::COORDINATOR {
            config.phy.rx_sensitivity_dbm = 0.0;
        }
    });
    h.run_until(SimTime::from_millis(450));

    // The data frame went out but the coordinator never decoded it
    assert_eq!(h.sent_by(NodeId(0), FrameType::Data).len(), 1);
    assert_eq!(h.node(COORDINATOR).sscs_stats().data_received, 0);
    assert!(h.sent_by(NodeId::COORDINATOR, FrameType::Control).is_empty());

    let sender = h.node(peripheral(0));
    assert_eq!(sender.sscs_stats().no_ack, 1);
    assert_eq!(sender.sscs_stats().success, 0);
    assert_eq!(sender.mac_state(), MacState::Idle);

    h.assert_tracers_consistent();
}

#[test]
fn test_late_ack_reports_no_ack_without_retry() {
    // With 100-byte frames the ACK lands after the wait expires
    let mut h = Harness::new(2, schedule_with(2, NodeId(0)), |config| {
        config.sscs.packet_size = 100;
        config.mac.ack_packet_size = 100;
    });
    h.run_until(SimTime::from_millis(450));

    let coordinator = h.node(COORDINATOR);
    assert_eq!(coordinator.sscs_stats().data_received, 1);
    assert_eq!(coordinator.sscs_stats().acks_sent, 1);

    let sender = h.node(peripheral(0));
    assert_eq!(sender.sscs_stats().no_ack, 1);
    assert_eq!(sender.sscs_stats().success, 0);
    assert_eq!(sender.mac_state(), MacState::Idle);
    assert_eq!(sender.tracer().lock().get_success_packet_count(), 0);
    assert_eq!(h.sent_by(NodeId(0), FrameType::Data).len(), 1);

    h.assert_tracers_consistent();
}

#[test]
fn test_contention_access_delivers_with_ack() {
    let mut h = Harness::new(1, vec![None; 8], |config| {
        if config.node_id != NodeId::COORDINATOR {
            config.mac.access_mode = AccessMode::Contention;
        }
    });
    h.run_until(SimTime::from_millis(90));

    let sender = h.node(peripheral(0));
    assert_eq!(h.sent_by(NodeId(0), FrameType::Data).len(), 1);
    assert_eq!(sender.sscs_stats().success, 1);
    assert_eq!(sender.sscs_stats().channel_access_failure, 0);
    assert_eq!(h.node(COORDINATOR).sscs_stats().data_received, 1);

    h.assert_tracers_consistent();
}

#[test]
fn test_busy_channel_reports_access_failure_once() {
    let mut h = Harness::new(1, vec![None; 8], |config| {
        if config.node_id != NodeId::COORDINATOR {
            config.mac.access_mode = AccessMode::Contention;
        }
    });
    let mut t = SimTime::ZERO;
    while t < SimTime::from_millis(60) {
        h.inject(t, peripheral(0), foreign_frame());
        t = t + SimTime::from_micros(50);
    }
    h.run_until(SimTime::from_millis(90));

    let sender = h.node(peripheral(0));
    assert_eq!(sender.sscs_stats().channel_access_failure, 1);
    assert_eq!(sender.sscs_stats().success, 0);
    assert_eq!(sender.mac_state(), MacState::Idle);
    assert!(sender.mac().tx_packet().is_none());
    assert!(h.sent_by(NodeId(0), FrameType::Data).is_empty());
    assert_eq!(sender.tracer().lock().get_enqueued_packet_count(), 0);
}
