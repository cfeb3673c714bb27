//! # bansim-packet
//!
//! IEEE 802.15.6 MAC frame types for the BAN simulator.
//!
//! This crate provides the header and frame-body types carried by simulated
//! packets. Frames never leave process memory, so there is no wire codec:
//! the types model the fields the MAC reads and writes.
//!
//! ## Frame Structure
//!
//! - [`MacHeader`]: BAN id, sender, recipient, time slot tag and [`FrameControl`]
//! - [`FrameBody`]: one of Beacon, IAck, Data(priority) or none
//!
//! ## Example
//!
//! ```rust
//! use bansim_packet::{FrameBody, FrameSubtype, FrameType, MacHeader, NodeId, TxParams};
//!
//! let tx = TxParams::new(0, NodeId(1), NodeId::COORDINATOR).with_time_slot(3);
//! let header = MacHeader::from_tx_params(&tx, FrameType::Data, FrameSubtype::DataUp0).unwrap();
//! let body = FrameBody::for_subtype(FrameSubtype::DataUp0).unwrap();
//! assert_eq!(header.time_slot_index, Some(3));
//! assert!(matches!(body, FrameBody::Data { priority: 0 }));
//! ```

pub mod error;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use error::PacketError;

// ============================================================================
// Constants
// ============================================================================

/// Number of user priorities carried by data frame subtypes.
pub const NUM_USER_PRIORITIES: u8 = 8;

// ============================================================================
// Addressing
// ============================================================================

/// BAN node identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Recipient id addressing every node in the BAN.
    pub const BROADCAST: NodeId = NodeId(999);
    /// Id of the hub (coordinator) node.
    pub const COORDINATOR: NodeId = NodeId(99);

    /// Returns true for the broadcast address.
    pub fn is_broadcast(self) -> bool {
        self == NodeId::BROADCAST
    }

    /// Returns true for the coordinator id.
    pub fn is_coordinator(self) -> bool {
        self == NodeId::COORDINATOR
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Frame Control
// ============================================================================

/// Frame type field of the frame control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameType {
    /// Management frames (beacons).
    Management = 0,
    /// Control frames (acknowledgements).
    Control = 1,
    /// Data frames.
    Data = 2,
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameType::Management => write!(f, "MANAGEMENT"),
            FrameType::Control => write!(f, "CONTROL"),
            FrameType::Data => write!(f, "DATA"),
        }
    }
}

/// Frame subtype field of the frame control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameSubtype {
    /// Beacon (management).
    Beacon,
    /// Immediate acknowledgement (control).
    IAck,
    /// Data, user priority 0.
    DataUp0,
    /// Data, user priority 1.
    DataUp1,
    /// Data, user priority 2.
    DataUp2,
    /// Data, user priority 3.
    DataUp3,
    /// Data, user priority 4.
    DataUp4,
    /// Data, user priority 5.
    DataUp5,
    /// Data, user priority 6.
    DataUp6,
    /// Data, user priority 7.
    DataUp7,
    /// Reserved value with no frame body.
    Undefined,
}

impl FrameSubtype {
    /// Data subtype for a user priority, or `None` above priority 7.
    pub fn data(priority: u8) -> Option<Self> {
        let subtype = match priority {
            0 => FrameSubtype::DataUp0,
            1 => FrameSubtype::DataUp1,
            2 => FrameSubtype::DataUp2,
            3 => FrameSubtype::DataUp3,
            4 => FrameSubtype::DataUp4,
            5 => FrameSubtype::DataUp5,
            6 => FrameSubtype::DataUp6,
            7 => FrameSubtype::DataUp7,
            _ => return None,
        };
        Some(subtype)
    }

    /// Parse a raw subtype value (0 beacon, 1 I-Ack, 2..=9 data UP0..UP7, 10 undefined).
    pub fn from_raw(value: u8) -> Result<Self, PacketError> {
        match value {
            0 => Ok(FrameSubtype::Beacon),
            1 => Ok(FrameSubtype::IAck),
            2..=9 => FrameSubtype::data(value - 2).ok_or(PacketError::UnknownSubtypeValue(value)),
            10 => Ok(FrameSubtype::Undefined),
            _ => Err(PacketError::UnknownSubtypeValue(value)),
        }
    }

    /// User priority of a data subtype.
    pub fn user_priority(self) -> Option<u8> {
        match self {
            FrameSubtype::DataUp0 => Some(0),
            FrameSubtype::DataUp1 => Some(1),
            FrameSubtype::DataUp2 => Some(2),
            FrameSubtype::DataUp3 => Some(3),
            FrameSubtype::DataUp4 => Some(4),
            FrameSubtype::DataUp5 => Some(5),
            FrameSubtype::DataUp6 => Some(6),
            FrameSubtype::DataUp7 => Some(7),
            _ => None,
        }
    }

    /// Frame type this subtype belongs to.
    pub fn frame_type(self) -> Option<FrameType> {
        match self {
            FrameSubtype::Beacon => Some(FrameType::Management),
            FrameSubtype::IAck => Some(FrameType::Control),
            FrameSubtype::Undefined => None,
            _ => Some(FrameType::Data),
        }
    }

    /// Returns a lowercase label string suitable for logs and statistics.
    pub fn as_label(&self) -> &'static str {
        match self {
            FrameSubtype::Beacon => "beacon",
            FrameSubtype::IAck => "i_ack",
            FrameSubtype::DataUp0 => "data_up0",
            FrameSubtype::DataUp1 => "data_up1",
            FrameSubtype::DataUp2 => "data_up2",
            FrameSubtype::DataUp3 => "data_up3",
            FrameSubtype::DataUp4 => "data_up4",
            FrameSubtype::DataUp5 => "data_up5",
            FrameSubtype::DataUp6 => "data_up6",
            FrameSubtype::DataUp7 => "data_up7",
            FrameSubtype::Undefined => "undefined",
        }
    }
}

impl fmt::Display for FrameSubtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_label().to_uppercase())
    }
}

/// Transmission option requested for a frame; doubles as the ACK policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TxOption {
    /// No acknowledgement.
    #[default]
    None,
    /// Immediate acknowledgement required.
    Ack,
    /// Guaranteed time slot.
    Gts,
    /// Indirect transmission.
    Indirect,
}

impl TxOption {
    /// Returns true when the receiver has to answer with an I-Ack.
    pub fn requires_ack(self) -> bool {
        self == TxOption::Ack
    }
}

/// Frame control field.
///
/// Security, relay and fragmentation fields are carried unchanged and never
/// interpreted by the simulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameControl {
    /// Frame type.
    pub frame_type: FrameType,
    /// Frame subtype.
    pub frame_subtype: FrameSubtype,
    /// Acknowledgement policy.
    pub ack_policy: TxOption,
    /// Sequence number, stamped by the originating MAC.
    pub sequence_number: Option<u32>,
    /// Protocol version.
    pub protocol_version: u8,
    /// Security level.
    pub security_level: u8,
    /// Temporal key index.
    pub tk_index: u8,
    /// Relay flag.
    pub relay: bool,
    /// Ack timing flag.
    pub ack_timing: bool,
    /// More-data flag.
    pub more_data: bool,
    /// Last-frame flag.
    pub last_frame: bool,
    /// Fragment number.
    pub fragment_number: u8,
    /// Non-final-fragment flag.
    pub non_final_fragment: bool,
}

impl FrameControl {
    /// Create a frame control, rejecting subtypes that do not belong to the type.
    pub fn new(
        frame_type: FrameType,
        frame_subtype: FrameSubtype,
        ack_policy: TxOption,
        sequence_number: Option<u32>,
    ) -> Result<Self, PacketError> {
        match frame_subtype.frame_type() {
            None => return Err(PacketError::InvalidSubtype(frame_subtype)),
            Some(t) if t != frame_type => {
                return Err(PacketError::SubtypeMismatch {
                    frame_type,
                    subtype: frame_subtype,
                })
            }
            Some(_) => {}
        }
        Ok(FrameControl {
            frame_type,
            frame_subtype,
            ack_policy,
            sequence_number,
            protocol_version: 0,
            security_level: 0,
            tk_index: 0,
            relay: false,
            ack_timing: false,
            more_data: false,
            last_frame: false,
            fragment_number: 0,
            non_final_fragment: false,
        })
    }
}

// ============================================================================
// Transmission Parameters
// ============================================================================

/// Addressing and policy for one outgoing frame.
///
/// Every field the header needs is supplied at construction, so no two nodes
/// can share a half-filled instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxParams {
    /// BAN id.
    pub ban_id: u32,
    /// Sending node.
    pub node_id: NodeId,
    /// Receiving node, or [`NodeId::BROADCAST`].
    pub recipient_id: NodeId,
    /// Sequence number; the MAC stamps its own when this is `None`.
    pub seq_num: Option<u32>,
    /// Transmission option / ACK policy.
    pub tx_option: TxOption,
    /// Time slot tag copied into the header.
    pub time_slot: Option<u32>,
}

impl TxParams {
    /// Create parameters with no ACK, no sequence number and no slot tag.
    pub fn new(ban_id: u32, node_id: NodeId, recipient_id: NodeId) -> Self {
        TxParams {
            ban_id,
            node_id,
            recipient_id,
            seq_num: None,
            tx_option: TxOption::None,
            time_slot: None,
        }
    }

    /// Set the transmission option.
    pub fn with_tx_option(mut self, tx_option: TxOption) -> Self {
        self.tx_option = tx_option;
        self
    }

    /// Set the sequence number.
    pub fn with_seq_num(mut self, seq_num: u32) -> Self {
        self.seq_num = Some(seq_num);
        self
    }

    /// Set the time slot tag.
    pub fn with_time_slot(mut self, slot: u32) -> Self {
        self.time_slot = Some(slot);
        self
    }
}

// ============================================================================
// MAC Header
// ============================================================================

/// MAC header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacHeader {
    /// BAN id.
    pub ban_id: u32,
    /// Sender node id.
    pub sender_id: NodeId,
    /// Recipient node id.
    pub recipient_id: NodeId,
    /// Time slot the frame is sent in, if tagged.
    pub time_slot_index: Option<u32>,
    /// Frame control.
    pub frame_control: FrameControl,
}

impl MacHeader {
    /// Build a header from transmission parameters.
    pub fn from_tx_params(
        tx: &TxParams,
        frame_type: FrameType,
        frame_subtype: FrameSubtype,
    ) -> Result<Self, PacketError> {
        let frame_control = FrameControl::new(frame_type, frame_subtype, tx.tx_option, tx.seq_num)?;
        Ok(MacHeader {
            ban_id: tx.ban_id,
            sender_id: tx.node_id,
            recipient_id: tx.recipient_id,
            time_slot_index: tx.time_slot,
            frame_control,
        })
    }

    /// Frame type shortcut.
    pub fn frame_type(&self) -> FrameType {
        self.frame_control.frame_type
    }

    /// Frame subtype shortcut.
    pub fn frame_subtype(&self) -> FrameSubtype {
        self.frame_control.frame_subtype
    }

    /// Sequence number shortcut.
    pub fn sequence_number(&self) -> Option<u32> {
        self.frame_control.sequence_number
    }

    /// Returns true when the sender asked for an acknowledgement.
    pub fn requires_ack(&self) -> bool {
        self.frame_control.ack_policy.requires_ack()
    }
}

// ============================================================================
// Frame Bodies
// ============================================================================

/// One row of a beacon's TDMA schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignedLinkElement {
    /// Node granted the allocation.
    pub allocation_id: NodeId,
    /// Start of the allocation, in allocation slot units from the beacon.
    pub interval_start: u32,
    /// Length of the allocation, in allocation slot units.
    pub interval_end: u32,
    /// Transmit power the node should use, in dBm.
    pub tx_power: f64,
    /// Time slot index this allocation realises.
    pub time_slot_index: u32,
}

impl AssignedLinkElement {
    /// Create an element; every field is required.
    pub fn new(
        allocation_id: NodeId,
        interval_start: u32,
        interval_end: u32,
        tx_power: f64,
        time_slot_index: u32,
    ) -> Self {
        AssignedLinkElement {
            allocation_id,
            interval_start,
            interval_end,
            tx_power,
            time_slot_index,
        }
    }
}

/// Beacon frame body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Beacon {
    /// Sender address (coordinator).
    pub sender_address: Option<NodeId>,
    /// Beacon period length in allocation slots.
    pub beacon_period_length: Option<u32>,
    /// Allocation slot length field.
    pub allocation_slot_length: Option<u32>,
    /// TDMA schedule.
    pub assigned_links: Vec<AssignedLinkElement>,
}

impl Beacon {
    /// Append a schedule row.
    pub fn push_link(&mut self, element: AssignedLinkElement) {
        self.assigned_links.push(element);
    }

    /// Find the first allocation granted to `node`.
    pub fn assigned_link(&self, node: NodeId) -> Option<&AssignedLinkElement> {
        self.assigned_links.iter().find(|e| e.allocation_id == node)
    }
}

/// Frame body variants, one per frame subtype family.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum FrameBody {
    /// Beacon with TDMA schedule.
    Beacon(Beacon),
    /// Immediate acknowledgement.
    IAck,
    /// Data frame with user priority.
    Data {
        /// User priority (0-7).
        priority: u8,
    },
    /// No body.
    #[default]
    None,
}

impl FrameBody {
    /// Select the body variant for a subtype.
    pub fn for_subtype(subtype: FrameSubtype) -> Result<Self, PacketError> {
        match subtype {
            FrameSubtype::Beacon => Ok(FrameBody::Beacon(Beacon::default())),
            FrameSubtype::IAck => Ok(FrameBody::IAck),
            FrameSubtype::Undefined => Err(PacketError::InvalidSubtype(subtype)),
            data => data
                .user_priority()
                .map(|priority| FrameBody::Data { priority })
                .ok_or(PacketError::InvalidSubtype(data)),
        }
    }

    /// Beacon body, if any.
    pub fn as_beacon(&self) -> Option<&Beacon> {
        match self {
            FrameBody::Beacon(b) => Some(b),
            _ => None,
        }
    }

    /// Mutable beacon body, if any.
    pub fn as_beacon_mut(&mut self) -> Option<&mut Beacon> {
        match self {
            FrameBody::Beacon(b) => Some(b),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_for_subtype() {
        assert!(matches!(
            FrameBody::for_subtype(FrameSubtype::Beacon),
            Ok(FrameBody::Beacon(_))
        ));
        assert_eq!(FrameBody::for_subtype(FrameSubtype::IAck), Ok(FrameBody::IAck));
        assert_eq!(
            FrameBody::for_subtype(FrameSubtype::DataUp5),
            Ok(FrameBody::Data { priority: 5 })
        );
    }

    #[test]
    fn test_undefined_subtype_rejected() {
        assert_eq!(
            FrameBody::for_subtype(FrameSubtype::Undefined),
            Err(PacketError::InvalidSubtype(FrameSubtype::Undefined))
        );
        assert!(FrameControl::new(FrameType::Data, FrameSubtype::Undefined, TxOption::None, None).is_err());
    }

    #[test]
    fn test_subtype_type_mismatch() {
        let err = FrameControl::new(FrameType::Data, FrameSubtype::Beacon, TxOption::None, None).unwrap_err();
        assert_eq!(
            err,
            PacketError::SubtypeMismatch {
                frame_type: FrameType::Data,
                subtype: FrameSubtype::Beacon
            }
        );
    }

    #[test]
    fn test_subtype_from_raw() {
        assert_eq!(FrameSubtype::from_raw(0), Ok(FrameSubtype::Beacon));
        assert_eq!(FrameSubtype::from_raw(9), Ok(FrameSubtype::DataUp7));
        assert_eq!(FrameSubtype::from_raw(11), Err(PacketError::UnknownSubtypeValue(11)));
    }

    #[test]
    fn test_header_from_tx_params() {
        let tx = TxParams::new(0, NodeId(2), NodeId::COORDINATOR)
            .with_tx_option(TxOption::Ack)
            .with_seq_num(7)
            .with_time_slot(4);
        let header = MacHeader::from_tx_params(&tx, FrameType::Data, FrameSubtype::DataUp1).unwrap();
        assert_eq!(header.sender_id, NodeId(2));
        assert_eq!(header.recipient_id, NodeId(99));
        assert_eq!(header.sequence_number(), Some(7));
        assert_eq!(header.time_slot_index, Some(4));
        assert!(header.requires_ack());
    }

    #[test]
    fn test_beacon_lookup_by_node() {
        let mut beacon = Beacon::default();
        beacon.push_link(AssignedLinkElement::new(NodeId(0), 0, 8, 0.0, 0));
        beacon.push_link(AssignedLinkElement::new(NodeId(1), 9, 8, 0.0, 1));
        assert_eq!(beacon.assigned_link(NodeId(1)).map(|e| e.interval_start), Some(9));
        assert!(beacon.assigned_link(NodeId(5)).is_none());
    }

    #[test]
    fn test_broadcast_address() {
        assert!(NodeId(999).is_broadcast());
        assert!(!NodeId::COORDINATOR.is_broadcast());
        assert!(NodeId(99).is_coordinator());
    }
}
