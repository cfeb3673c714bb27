//! Error types for BAN frame construction.

use thiserror::Error;

use crate::{FrameSubtype, FrameType};

/// Errors raised while assembling a MAC frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    /// The frame subtype has no frame body variant.
    #[error("Invalid frame subtype: {0}")]
    InvalidSubtype(FrameSubtype),

    /// The frame subtype does not belong to the frame type.
    #[error("Frame subtype {subtype} does not belong to frame type {frame_type}")]
    SubtypeMismatch {
        /// Declared frame type.
        frame_type: FrameType,
        /// Declared frame subtype.
        subtype: FrameSubtype,
    },

    /// Raw subtype value outside the defined range.
    #[error("Unknown frame subtype value: {0}")]
    UnknownSubtypeValue(u8),
}
