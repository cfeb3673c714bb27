//! # bansim-device
//!
//! IEEE 802.15.6 node stack for the BAN simulator.
//!
//! This crate provides:
//! - Physical layer state machine and air time ([`Phy`])
//! - CSMA/CA channel access ([`CsmaCa`])
//! - MAC with beacon-driven slot access and acknowledgements ([`Mac`])
//! - Per-node statistics ([`Tracer`])
//! - Convergence sublayer and the slot allocation interface ([`Sscs`], [`SlotAllocator`])
//! - The node entity hosting one stack ([`BanNode`])
//!
//! Layers talk through plain method calls inside one [`BanNode`]. Anything
//! that happens later is a timer posted back to the node, identified by one of
//! the `TIMER_*` kinds below.

pub mod csma_ca;
pub mod mac;
pub mod node;
pub mod phy;
pub mod sscs;
pub mod tracer;

pub use csma_ca::{CsmaCa, CsmaConfig, CsmaOutcome};
pub use mac::{
    AccessMode, Allocation, DataConfirm, DataConfirmStatus, Mac, MacConfig, MacNotification, MacState,
};
pub use node::{BanNode, NodeConfig};
pub use phy::{PdDataOutcome, Phy, PhyConfig, PhyOption, PhyState, PibAttribute};
pub use sscs::{SharedSlotAllocator, SlotAllocator, Sscs, SscsConfig, SscsStats, TimeSlotRecord};
pub use tracer::{Tracer, TracerHandle, TracerSummary};

// ============================================================================
// Timer Kinds
// ============================================================================

pub const TIMER_PHY_END_TX: u32 = 1;
/// Token: reception id.
pub const TIMER_PHY_END_RX: u32 = 2;
pub const TIMER_PHY_END_CCA: u32 = 3;
pub const TIMER_CSMA_BACKOFF: u32 = 4;
pub const TIMER_CSMA_CAN_PROCEED: u32 = 5;
pub const TIMER_CSMA_REQUEST_CCA: u32 = 6;
pub const TIMER_MAC_START_TX: u32 = 7;
pub const TIMER_MAC_CHECK_QUEUE: u32 = 8;
/// Token: ACK wait arming.
pub const TIMER_MAC_ACK_TIMEOUT: u32 = 9;
pub const TIMER_MAC_SEND_ACK: u32 = 10;
pub const TIMER_SSCS_SEND_BEACON: u32 = 11;
pub const TIMER_SSCS_BEACON_PERIOD: u32 = 12;
pub const TIMER_SSCS_SEND_DATA: u32 = 13;
