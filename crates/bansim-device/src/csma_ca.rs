//! CSMA/CA channel access.

use bansim_common::{timer_id, EntityId, EventPayload, NodeId, SimContext, SimTime};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::phy::PhyState;
use crate::{TIMER_CSMA_BACKOFF, TIMER_CSMA_CAN_PROCEED, TIMER_CSMA_REQUEST_CCA};

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsmaConfig {
    /// macMinBE.
    pub min_be: u8,
    /// macMaxBE.
    pub max_be: u8,
    /// macMaxCSMABackoffs.
    pub max_backoffs: u8,
    /// Unit backoff period in symbols.
    pub unit_backoff_period: u32,
    /// Slotted operation.
    pub slotted: bool,
}

impl Default for CsmaConfig {
    fn default() -> Self {
        CsmaConfig {
            min_be: 3,
            max_be: 5,
            max_backoffs: 4,
            unit_backoff_period: 20,
            slotted: false,
        }
    }
}

/// Result reported to the MAC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsmaOutcome {
    /// The medium is free; transmit now.
    ChannelIdle,
    /// Backoffs exhausted; the frame is dropped.
    ChannelAccessFailure,
}

/// Backoff state for one MAC.
#[derive(Debug)]
pub struct CsmaCa {
    node: NodeId,
    entity: EntityId,
    config: CsmaConfig,
    nb: u8,
    cw: u8,
    be: u8,
    cca_running: bool,
}

impl CsmaCa {
    pub fn new(node: NodeId, entity: EntityId, config: CsmaConfig) -> Self {
        CsmaCa {
            node,
            entity,
            config,
            nb: 0,
            cw: 2,
            be: config.min_be,
            cca_running: false,
        }
    }

    pub fn config(&self) -> &CsmaConfig {
        &self.config
    }

    /// Backoffs taken in the current attempt.
    pub fn nb(&self) -> u8 {
        self.nb
    }

    /// Current backoff exponent.
    pub fn be(&self) -> u8 {
        self.be
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

    /// Begin an access attempt.
    pub fn start(&mut self, ctx: &mut SimContext) {
        self.nb = 0;
        self.be = self.config.min_be;
        if self.config.slotted {
            self.cw = 2;
        }
        self.cca_running = false;
        // Slot boundaries are already aligned by the beacon schedule
        self.post(ctx, SimTime::ZERO, TIMER_CSMA_BACKOFF);
    }

    /// Draw a random backoff and schedule the next step after it.
    pub fn random_backoff_delay(&mut self, symbol_rate: f64, ctx: &mut SimContext) {
        let upper = 2f64.powi(self.be as i32 - 1) + 1.0;
        let periods: f64 = ctx.rng().gen_range(0.0..upper);
        let delay_secs = periods * self.config.unit_backoff_period as f64 / symbol_rate;
        debug!(
            "Csma[{}]: backoff {:.2} periods ({:.6} s), nb = {}, be = {}",
            self.node, periods, delay_secs, self.nb, self.be
        );
        let next = if self.config.slotted {
            TIMER_CSMA_CAN_PROCEED
        } else {
            TIMER_CSMA_REQUEST_CCA
        };
        self.post(ctx, SimTime::from_secs(delay_secs), next);
    }

    /// Slotted mode: the backoff ended on a slot boundary.
    pub fn can_proceed(&mut self, ctx: &mut SimContext) {
        self.post(ctx, SimTime::ZERO, TIMER_CSMA_REQUEST_CCA);
    }

    /// Mark a CCA as outstanding. The MAC then asks the PHY for it.
    pub fn begin_cca(&mut self) {
        self.cca_running = true;
    }

    /// Whether a CCA result is awaited.
    pub fn is_cca_running(&self) -> bool {
        self.cca_running
    }

    /// Consume a CCA result.
    pub fn plme_cca_confirm(&mut self, status: PhyState, ctx: &mut SimContext) -> Option<CsmaOutcome> {
        if !self.cca_running {
            return None;
        }
        self.cca_running = false;

        if status == PhyState::Idle {
            if self.config.slotted {
                self.cw = self.cw.saturating_sub(1);
                if self.cw == 0 {
                    return Some(CsmaOutcome::ChannelIdle);
                }
                self.post(ctx, SimTime::ZERO, TIMER_CSMA_REQUEST_CCA);
                return None;
            }
            return Some(CsmaOutcome::ChannelIdle);
        }

        if self.config.slotted {
            self.cw = 2;
        }
        self.be = (self.be + 1).min(self.config.max_be);
        self.nb += 1;
        if self.nb > self.config.max_backoffs {
            warn!("Csma[{}]: channel access failure after {} backoffs", self.node, self.nb);
            return Some(CsmaOutcome::ChannelAccessFailure);
        }
        self.post(ctx, SimTime::ZERO, TIMER_CSMA_BACKOFF);
        None
    }
}
