//! # bansim-channel
//!
//! Shared broadcast medium for the BAN simulator.
//!
//! The [`Channel`] entity receives `TransmitAir` events from transmitting
//! nodes and fans each one out to every other registered node as a
//! `ReceiveAir` event. Each receiver gets its own copy of the packet with the
//! path loss subtracted from the transmit power, delivered after the
//! propagation delay. Transmissions a body posture forbids are dropped before
//! they reach the air.

pub mod propagation;

use bansim_common::{
    Entity, EntityId, Event, EventPayload, NodeId, ReceiveAirEvent, SimContext, SimError, SimTime,
    TransmitAirEvent,
};
use bansim_mobility::SharedMobility;
use serde::Serialize;
use tracing::{debug, info, trace};

pub use propagation::{DelayModel, LossModel, PropDelayModel, PropLossModel, SPEED_OF_LIGHT};

// ============================================================================
// Configuration
// ============================================================================

/// Channel configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelConfig {
    /// Drop transmissions the sender's posture does not allow in its slot.
    pub tdma_gating: bool,
    /// Skip receivers sitting on a limb joint hidden behind the body.
    pub los_gating: bool,
    /// Fixed loss subtracted on every link in addition to path loss (dB).
    pub additional_tx_loss_db: f64,
}

impl ChannelConfig {
    /// Default additional loss.
    pub const DEFAULT_ADDITIONAL_TX_LOSS_DB: f64 = 0.0;
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            tdma_gating: true,
            los_gating: false,
            additional_tx_loss_db: Self::DEFAULT_ADDITIONAL_TX_LOSS_DB,
        }
    }
}

/// Fan-out counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChannelStats {
    /// Transmissions handed to the channel.
    pub transmissions: u64,
    /// Copies delivered towards receivers.
    pub deliveries: u64,
    /// Receivers skipped by slot admission.
    pub tdma_drops: u64,
    /// Receivers skipped by limb line of sight.
    pub los_drops: u64,
}

// ============================================================================
// Channel Entity
// ============================================================================

/// The broadcast medium.
pub struct Channel {
    id: EntityId,
    config: ChannelConfig,
    endpoints: Vec<(EntityId, NodeId)>,
    loss_model: Option<Box<dyn LossModel>>,
    delay_model: Option<Box<dyn DelayModel>>,
    mobility: SharedMobility,
    stats: ChannelStats,
}

impl Channel {
    /// Create a channel with no endpoints and no propagation models.
    pub fn new(id: EntityId, config: ChannelConfig, mobility: SharedMobility) -> Self {
        Channel {
            id,
            config,
            endpoints: Vec::new(),
            loss_model: None,
            delay_model: None,
            mobility,
            stats: ChannelStats::default(),
        }
    }

    /// Register a node entity as a receiver.
    pub fn add_phy(&mut self, entity: EntityId, node: NodeId) {
        self.endpoints.push((entity, node));
    }

    /// Set the loss model.
    pub fn set_loss_model(&mut self, model: Box<dyn LossModel>) {
        self.loss_model = Some(model);
    }

    /// Set the delay model.
    pub fn set_delay_model(&mut self, model: Box<dyn DelayModel>) {
        self.delay_model = Some(model);
    }

    /// Channel configuration.
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Fan-out counters.
    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    /// Fan a transmission out to every registered receiver except the sender.
    fn start_tx(&mut self, tx: &TransmitAirEvent, ctx: &mut SimContext) -> Result<(), SimError> {
        let loss_model = self.loss_model.as_deref().ok_or(SimError::MissingModel {
            entity: self.id,
            what: "loss model",
        })?;
        let delay_model = self.delay_model.as_deref().ok_or(SimError::MissingModel {
            entity: self.id,
            what: "delay model",
        })?;

        self.stats.transmissions += 1;
        let header = tx.packet.header();
        let sender_id = header.sender_id;
        let mobility = self.mobility.read();
        let sender_model = mobility.mobility(sender_id).ok_or(SimError::MissingModel {
            entity: self.id,
            what: "sender mobility model",
        })?;

        for &(receiver, receiver_id) in &self.endpoints {
            if receiver == tx.phy_id {
                continue;
            }
            let receiver_model = mobility.mobility(receiver_id).ok_or(SimError::MissingModel {
                entity: self.id,
                what: "receiver mobility model",
            })?;

            if self.config.tdma_gating && !sender_id.is_coordinator() {
                if let Some(slot) = header.time_slot_index {
                    if !mobility.can_transaction(sender_id, slot) {
                        info!(
                            "Channel: {} not allows transaction, dropping packet from: {} to: {}, sender's position: {}, current time slot info: {}",
                            mobility.current_phase(),
                            sender_id,
                            header.recipient_id,
                            sender_model.get_body_position(),
                            slot
                        );
                        self.stats.tdma_drops += 1;
                        continue;
                    }
                }
            }

            if self.config.los_gating && receiver_model.is_limb_blocked() {
                debug!(
                    "Channel: receiver {} at {} hidden behind the body, skipping",
                    receiver_id,
                    receiver_model.get_body_position()
                );
                self.stats.los_drops += 1;
                continue;
            }

            let path_loss_db = loss_model.calculate_path_loss(sender_model, receiver_model);
            let delay = delay_model.get_delay(sender_model, receiver_model);

            let mut packet = tx.packet.copy();
            packet.spectrum.tx_power_dbm -= path_loss_db + self.config.additional_tx_loss_db;
            trace!(
                "Channel: {} -> {} path loss {:.2} dB, rx power {:.2} dBm, delay {:.3e} s",
                sender_id,
                receiver_id,
                path_loss_db,
                packet.spectrum.tx_power_dbm,
                delay
            );

            ctx.post_event(
                SimTime::from_secs(delay),
                vec![receiver],
                EventPayload::ReceiveAir(ReceiveAirEvent {
                    source_phy_id: tx.phy_id,
                    packet,
                }),
            );
            self.stats.deliveries += 1;
        }
        Ok(())
    }
}

impl Entity for Channel {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        match &event.payload {
            EventPayload::TransmitAir(tx_event) => self.start_tx(tx_event, ctx),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bansim_common::{EventId, FrameBody, FrameSubtype, FrameType, MacHeader, Packet, TxParams};
    use bansim_mobility::{BodyPosition, MobilityHelper};

    const CHANNEL: EntityId = EntityId(100);

    fn mobility() -> SharedMobility {
        let mut helper = MobilityHelper::new();
        helper.add_mobility(NodeId::COORDINATOR, BodyPosition::Body);
        helper.add_mobility(NodeId(0), BodyPosition::LeftElbow);
        helper.add_mobility(NodeId(1), BodyPosition::LeftWrist);
        helper.add_mobility(NodeId(2), BodyPosition::RightElbow);
        helper.into_shared()
    }

    fn channel(config: ChannelConfig) -> Channel {
        let mut channel = Channel::new(CHANNEL, config, mobility());
        channel.set_loss_model(Box::new(PropLossModel::new()));
        channel.set_delay_model(Box::new(PropDelayModel::new()));
        channel.add_phy(EntityId(1), NodeId::COORDINATOR);
        channel.add_phy(EntityId(2), NodeId(0));
        channel.add_phy(EntityId(3), NodeId(1));
        channel.add_phy(EntityId(4), NodeId(2));
        channel
    }

    fn data_from(sender: NodeId, slot: u32) -> Packet {
        let tx = TxParams::new(0, sender, NodeId::COORDINATOR).with_time_slot(slot);
        let header = MacHeader::from_tx_params(&tx, FrameType::Data, FrameSubtype::DataUp0).unwrap();
        let mut packet = Packet::new(100, header, FrameBody::Data { priority: 0 });
        packet.spectrum.tx_power_dbm = 0.0;
        packet
    }

    fn transmit(channel: &mut Channel, phy: EntityId, packet: Packet) -> Vec<Event> {
        let mut ctx = SimContext::new(42);
        ctx.set_source(CHANNEL);
        let event = Event {
            id: EventId(0),
            time: SimTime::ZERO,
            source: phy,
            targets: vec![CHANNEL],
            payload: EventPayload::TransmitAir(TransmitAirEvent { phy_id: phy, packet }),
        };
        channel.handle_event(&event, &mut ctx).unwrap();
        ctx.take_pending_events()
    }

    fn rx_powers(events: &[Event]) -> Vec<(EntityId, f64)> {
        events
            .iter()
            .filter_map(|e| match &e.payload {
                EventPayload::ReceiveAir(rx) => Some((e.targets[0], rx.packet.spectrum.tx_power_dbm)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_fan_out_skips_sender_and_subtracts_loss() {
        let mut ch = channel(ChannelConfig::default());
        let events = transmit(&mut ch, EntityId(2), data_from(NodeId(0), 0));
        let powers = rx_powers(&events);
        let targets: Vec<EntityId> = powers.iter().map(|(t, _)| *t).collect();
        assert_eq!(targets, vec![EntityId(1), EntityId(3), EntityId(4)]);
        for (_, power) in powers {
            assert!(power < -20.0, "path loss not applied: {}", power);
        }
        assert!(events.iter().all(|e| e.time > SimTime::ZERO));
    }

    #[test]
    fn test_additional_loss_applied() {
        let mut plain = channel(ChannelConfig::default());
        let mut lossy = channel(ChannelConfig {
            additional_tx_loss_db: 10.0,
            ..ChannelConfig::default()
        });
        let a = rx_powers(&transmit(&mut plain, EntityId(2), data_from(NodeId(0), 0)));
        let b = rx_powers(&transmit(&mut lossy, EntityId(2), data_from(NodeId(0), 0)));
        for ((_, pa), (_, pb)) in a.iter().zip(b.iter()) {
            assert!((pa - pb - 10.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_tdma_gating_drops_disallowed_slot() {
        let mut ch = channel(ChannelConfig::default());
        // LEFT_ELBOW may not transact in slot 6 during PHASE_0
        let events = transmit(&mut ch, EntityId(2), data_from(NodeId(0), 6));
        assert!(events.is_empty());
        assert_eq!(ch.stats().tdma_drops, 3);

        let mut ungated = channel(ChannelConfig {
            tdma_gating: false,
            ..ChannelConfig::default()
        });
        assert_eq!(transmit(&mut ungated, EntityId(2), data_from(NodeId(0), 6)).len(), 3);
    }

    #[test]
    fn test_coordinator_bypasses_gating() {
        let mut ch = channel(ChannelConfig::default());
        let events = transmit(&mut ch, EntityId(1), data_from(NodeId::COORDINATOR, 7));
        assert_eq!(events.len(), 3);
    }

    #[test]
    fn test_los_gating_skips_hidden_limb() {
        let mut ch = channel(ChannelConfig {
            los_gating: true,
            ..ChannelConfig::default()
        });
        // RIGHT_ELBOW is behind the body in PHASE_0
        let events = transmit(&mut ch, EntityId(1), data_from(NodeId::COORDINATOR, 0));
        let targets: Vec<EntityId> = events.iter().map(|e| e.targets[0]).collect();
        assert_eq!(targets, vec![EntityId(2), EntityId(3)]);
        assert_eq!(ch.stats().los_drops, 1);
    }

    #[test]
    fn test_missing_delay_model_is_fatal() {
        let mut ch = Channel::new(CHANNEL, ChannelConfig::default(), mobility());
        ch.set_loss_model(Box::new(PropLossModel::new()));
        ch.add_phy(EntityId(1), NodeId::COORDINATOR);
        let mut ctx = SimContext::new(42);
        let event = Event {
            id: EventId(0),
            time: SimTime::ZERO,
            source: EntityId(2),
            targets: vec![CHANNEL],
            payload: EventPayload::TransmitAir(TransmitAirEvent {
                phy_id: EntityId(2),
                packet: data_from(NodeId(0), 0),
            }),
        };
        assert!(matches!(
            ch.handle_event(&event, &mut ctx),
            Err(SimError::MissingModel { what: "delay model", .. })
        ));
    }

    #[test]
    fn test_missing_sender_mobility_is_fatal() {
        let mut ch = channel(ChannelConfig::default());
        let mut ctx = SimContext::new(42);
        let event = Event {
            id: EventId(0),
            time: SimTime::ZERO,
            source: EntityId(9),
            targets: vec![CHANNEL],
            payload: EventPayload::TransmitAir(TransmitAirEvent {
                phy_id: EntityId(9),
                packet: data_from(NodeId(42), 0),
            }),
        };
        assert!(matches!(
            ch.handle_event(&event, &mut ctx),
            Err(SimError::MissingModel { .. })
        ));
    }
}
