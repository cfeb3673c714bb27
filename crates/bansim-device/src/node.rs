//! The node entity hosting one full protocol stack.

use bansim_common::{
    split_timer_id, timer_id, Entity, EntityId, Event, EventPayload, NodeId, SimContext, SimError,
    SimTime,
};
use bansim_mobility::SharedMobility;
use serde::Serialize;
use tracing::{debug, info_span};

use crate::mac::{Mac, MacConfig, MacState};
use crate::phy::{Phy, PhyConfig};
use crate::sscs::{SharedSlotAllocator, Sscs, SscsConfig, SscsStats};
use crate::tracer::{Tracer, TracerHandle};
use crate::{TIMER_SSCS_BEACON_PERIOD, TIMER_SSCS_SEND_BEACON, TIMER_SSCS_SEND_DATA};

/// Per-node configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct NodeConfig {
    pub node_id: NodeId,
    pub phy: PhyConfig,
    pub mac: MacConfig,
    pub sscs: SscsConfig,
    /// Energy budget the tracer reports consumption against (W).
    pub initial_energy_w: f64,
}

impl NodeConfig {
    /// Defaults for `node_id`.
    pub fn new(node_id: NodeId) -> Self {
        NodeConfig {
            node_id,
            phy: PhyConfig::default(),
            mac: MacConfig::default(),
            sscs: SscsConfig::default(),
            initial_energy_w: 1.0,
        }
    }
}

/// A BAN node: SSCS over MAC over PHY, driven by events.
pub struct BanNode {
    id: EntityId,
    node: NodeId,
    mac: Mac,
    sscs: Sscs,
}

impl BanNode {
    /// Create a node attached to `channel`. Passing an allocator makes it the
    /// coordinator.
    pub fn new(
        id: EntityId,
        channel: EntityId,
        config: NodeConfig,
        mobility: SharedMobility,
        allocator: Option<SharedSlotAllocator>,
    ) -> Self {
        let node = config.node_id;
        let tracer = Tracer::shared(config.initial_energy_w);
        let phy = Phy::new(node, id, channel, config.phy);
        let mac = Mac::new(node, id, config.mac, phy, tracer);
        let sscs = Sscs::new(node, id, config.sscs, mobility, allocator);
        BanNode { id, node, mac, sscs }
    }

    pub fn node_id(&self) -> NodeId {
        self.node
    }

    pub fn mac(&self) -> &Mac {
        &self.mac
    }

    pub fn sscs(&self) -> &Sscs {
        &self.sscs
    }

    pub fn tracer(&self) -> TracerHandle {
        self.mac.tracer().clone()
    }

    pub fn mac_state(&self) -> MacState {
        self.mac.state()
    }

    pub fn sscs_stats(&self) -> &SscsStats {
        self.sscs.stats()
    }

    /// Initialize the stack and post the node's first application timer:
    /// the first beacon for the coordinator, the first data request otherwise.
    pub fn start(&mut self, ctx: &mut SimContext) -> Result<(), SimError> {
        let _span = info_span!("node", id = %self.node).entered();
        self.mac.do_initialize(ctx)?;
        let (delay, kind) = if self.sscs.is_coordinator() {
            (SimTime::ZERO, TIMER_SSCS_SEND_BEACON)
        } else {
            (self.sscs.config().first_data_delay, TIMER_SSCS_SEND_DATA)
        };
        ctx.post_event(
            delay,
            vec![self.id],
            EventPayload::Timer {
                timer_id: timer_id(kind, 0),
            },
        );
        Ok(())
    }

    fn handle_timer(&mut self, kind: u32, token: u32, ctx: &mut SimContext) -> Result<(), SimError> {
        if self.mac.handle_timer(kind, token, ctx)? {
            return Ok(());
        }
        match kind {
            TIMER_SSCS_SEND_BEACON => self.sscs.send_beacon(&mut self.mac, ctx),
            TIMER_SSCS_BEACON_PERIOD => self.sscs.beacon_interval_timeout(&mut self.mac, ctx),
            TIMER_SSCS_SEND_DATA => self.sscs.send_data(&mut self.mac, ctx),
            _ => {
                debug!("Node[{}]: unknown timer kind {}", self.node, kind);
                Ok(())
            }
        }
    }

    fn deliver_notifications(&mut self) {
        for notification in self.mac.take_notifications() {
            self.sscs.handle_notification(notification);
        }
    }
}

impl Entity for BanNode {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        let _span = info_span!("node", id = %self.node).entered();
        match &event.payload {
            EventPayload::ReceiveAir(rx) => {
                self.mac.on_receive_air(rx.packet.clone(), ctx);
            }
            EventPayload::Timer { timer_id } => {
                let (kind, token) = split_timer_id(*timer_id);
                self.handle_timer(kind, token, ctx)?;
            }
            _ => {}
        }
        self.deliver_notifications();
        Ok(())
    }
}
