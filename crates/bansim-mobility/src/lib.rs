//! # bansim-mobility
//!
//! Body posture model for the BAN simulator.
//!
//! Nodes are pinned to body positions. The body alternates between two
//! movement phases; on every toggle the arms and legs swing to the opposite
//! side of the torso plane (z = 1 m), which changes both link geometry and
//! which positions may transact in which TDMA slot.
//!
//! The helper is shared between the channel (admission and geometry) and the
//! slot allocator (phase detection), so it lives behind a [`SharedMobility`]
//! handle. A [`MobilityDriver`] entity toggles the phase on schedule.

use bansim_common::{
    split_timer_id, timer_id, Entity, EntityId, Event, EventPayload, NodeId, SimContext, SimError,
    SimTime, Vector3,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

// ============================================================================
// Constants
// ============================================================================

/// Duration of one movement phase in seconds.
pub const MOVEMENT_CYCLE_SECS: f64 = 0.5;

/// Number of TDMA slots covered by the transaction-ability table.
pub const TABLE_SLOTS: usize = 8;

/// Depth of the torso plane used by the line-of-sight heuristic, in meters.
pub const TORSO_PLANE_Z: f64 = 1.0;

// ============================================================================
// Body Positions
// ============================================================================

/// Where on the body a node is worn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BodyPosition {
    Head,
    LeftUpperTorso,
    LeftLowerTorso,
    RightUpperTorso,
    RightLowerTorso,
    LeftShoulder,
    RightShoulder,
    LeftElbow,
    LeftWrist,
    RightElbow,
    RightWrist,
    LeftKnee,
    LeftAnkle,
    RightKnee,
    RightAnkle,
    Body,
}

impl BodyPosition {
    /// All positions in index order.
    pub const ALL: [BodyPosition; 16] = [
        BodyPosition::Head,
        BodyPosition::LeftUpperTorso,
        BodyPosition::LeftLowerTorso,
        BodyPosition::RightUpperTorso,
        BodyPosition::RightLowerTorso,
        BodyPosition::LeftShoulder,
        BodyPosition::RightShoulder,
        BodyPosition::LeftElbow,
        BodyPosition::LeftWrist,
        BodyPosition::RightElbow,
        BodyPosition::RightWrist,
        BodyPosition::LeftKnee,
        BodyPosition::LeftAnkle,
        BodyPosition::RightKnee,
        BodyPosition::RightAnkle,
        BodyPosition::Body,
    ];

    /// Position for an index into [`BodyPosition::ALL`].
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Index into [`BodyPosition::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }

    /// Position worn by peripheral `i` (peripherals start at the left elbow).
    pub fn for_peripheral(i: usize) -> Option<Self> {
        Self::from_index(BodyPosition::LeftElbow.index() + i)
    }

    /// Upper-case name used in logs.
    pub fn name(self) -> &'static str {
        match self {
            BodyPosition::Head => "HEAD",
            BodyPosition::LeftUpperTorso => "LEFT_UPPER_TORSO",
            BodyPosition::LeftLowerTorso => "LEFT_LOWER_TORSO",
            BodyPosition::RightUpperTorso => "RIGHT_UPPER_TORSO",
            BodyPosition::RightLowerTorso => "RIGHT_LOWER_TORSO",
            BodyPosition::LeftShoulder => "LEFT_SHOULDER",
            BodyPosition::RightShoulder => "RIGHT_SHOULDER",
            BodyPosition::LeftElbow => "LEFT_ELBOW",
            BodyPosition::LeftWrist => "LEFT_WRIST",
            BodyPosition::RightElbow => "RIGHT_ELBOW",
            BodyPosition::RightWrist => "RIGHT_WRIST",
            BodyPosition::LeftKnee => "LEFT_KNEE",
            BodyPosition::LeftAnkle => "LEFT_ANKLE",
            BodyPosition::RightKnee => "RIGHT_KNEE",
            BodyPosition::RightAnkle => "RIGHT_ANKLE",
            BodyPosition::Body => "BODY",
        }
    }

    /// Limb band used by the limb line-of-sight check, if this is a limb joint.
    pub fn limb_band(self) -> Option<LimbBand> {
        match self {
            BodyPosition::LeftElbow | BodyPosition::RightElbow => Some(LimbBand::ELBOW),
            BodyPosition::LeftWrist | BodyPosition::RightWrist => Some(LimbBand::WRIST),
            BodyPosition::LeftKnee | BodyPosition::RightKnee => Some(LimbBand::KNEE),
            BodyPosition::LeftAnkle | BodyPosition::RightAnkle => Some(LimbBand::ANKLE),
            _ => None,
        }
    }

    /// Arm or leg joint that swings forward in PHASE_0.
    fn swings_forward_first(self) -> bool {
        matches!(
            self,
            BodyPosition::LeftElbow
                | BodyPosition::LeftWrist
                | BodyPosition::RightKnee
                | BodyPosition::RightAnkle
        )
    }

    /// Arm or leg joint that swings backward in PHASE_0.
    fn swings_backward_first(self) -> bool {
        matches!(
            self,
            BodyPosition::RightElbow
                | BodyPosition::RightWrist
                | BodyPosition::LeftKnee
                | BodyPosition::LeftAnkle
        )
    }
}

impl fmt::Display for BodyPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Height band and depth threshold of a limb joint.
///
/// A joint inside its height band and behind its depth threshold is hidden
/// from the front of the torso.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimbBand {
    /// Lower bound of the height band (m).
    pub y_min: f64,
    /// Upper bound of the height band (m).
    pub y_max: f64,
    /// Depth below which the joint is hidden (m).
    pub z_max: f64,
}

impl LimbBand {
    pub const ELBOW: LimbBand = LimbBand { y_min: 1.0, y_max: 1.2, z_max: 0.9 };
    pub const WRIST: LimbBand = LimbBand { y_min: 0.7, y_max: 0.95, z_max: 0.85 };
    pub const KNEE: LimbBand = LimbBand { y_min: 0.4, y_max: 0.6, z_max: 0.9 };
    pub const ANKLE: LimbBand = LimbBand { y_min: 0.0, y_max: 0.2, z_max: 0.8 };

    /// Returns true if `p` is hidden by this band.
    pub fn blocks(&self, p: &Vector3) -> bool {
        p.y >= self.y_min && p.y <= self.y_max && p.z < self.z_max
    }
}

// ============================================================================
// Movement Phases
// ============================================================================

/// Movement phase of the walking cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MovementPhase {
    #[serde(rename = "PHASE_0")]
    Phase0,
    #[serde(rename = "PHASE_1")]
    Phase1,
}

impl MovementPhase {
    /// Both phases in order.
    pub const ALL: [MovementPhase; 2] = [MovementPhase::Phase0, MovementPhase::Phase1];

    /// Phase index.
    pub fn index(self) -> usize {
        self as usize
    }

    /// The other phase.
    pub fn next(self) -> Self {
        match self {
            MovementPhase::Phase0 => MovementPhase::Phase1,
            MovementPhase::Phase1 => MovementPhase::Phase0,
        }
    }
}

impl fmt::Display for MovementPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MovementPhase::Phase0 => write!(f, "PHASE_0"),
            MovementPhase::Phase1 => write!(f, "PHASE_1"),
        }
    }
}

/// Phase list and per-phase durations.
#[derive(Debug, Clone, PartialEq)]
pub struct MovementInfo {
    /// Phases of one walking cycle.
    pub phases: Vec<MovementPhase>,
    /// Duration of each phase.
    pub phase_duration: Vec<SimTime>,
}

impl MovementInfo {
    /// Duration of `phase`.
    pub fn duration_of(&self, phase: MovementPhase) -> SimTime {
        self.phase_duration
            .get(phase.index())
            .copied()
            .unwrap_or_else(|| SimTime::from_secs(MOVEMENT_CYCLE_SECS))
    }
}

impl Default for MovementInfo {
    fn default() -> Self {
        MovementInfo {
            phases: MovementPhase::ALL.to_vec(),
            phase_duration: vec![SimTime::from_secs(MOVEMENT_CYCLE_SECS); MovementPhase::ALL.len()],
        }
    }
}

// ============================================================================
// Posture Table
// ============================================================================

/// Coordinate of a body position in a movement phase.
///
/// x is lateral, y is height and z is depth. Swinging joints mirror across the
/// torso plane between the two phases.
pub fn posture(phase: MovementPhase, position: BodyPosition) -> Vector3 {
    let (x, y, z) = match position {
        BodyPosition::Head => (0.0, 1.65, 1.05),
        BodyPosition::LeftUpperTorso => (-0.10, 1.35, 1.10),
        BodyPosition::LeftLowerTorso => (-0.10, 1.10, 1.10),
        BodyPosition::RightUpperTorso => (0.10, 1.35, 1.10),
        BodyPosition::RightLowerTorso => (0.10, 1.10, 1.10),
        BodyPosition::LeftShoulder => (-0.20, 1.45, 1.05),
        BodyPosition::RightShoulder => (0.20, 1.45, 1.05),
        BodyPosition::LeftElbow | BodyPosition::RightElbow => (0.25, 1.10, 1.15),
        BodyPosition::LeftWrist | BodyPosition::RightWrist => (0.25, 0.85, 1.25),
        BodyPosition::LeftKnee | BodyPosition::RightKnee => (0.10, 0.50, 1.15),
        BodyPosition::LeftAnkle | BodyPosition::RightAnkle => (0.10, 0.10, 1.25),
        BodyPosition::Body => (0.0, 1.00, 1.12),
    };
    let x = match position {
        BodyPosition::LeftElbow
        | BodyPosition::LeftWrist
        | BodyPosition::LeftKnee
        | BodyPosition::LeftAnkle => -x,
        _ => x,
    };

    let forward = match phase {
        MovementPhase::Phase0 => position.swings_forward_first(),
        MovementPhase::Phase1 => position.swings_backward_first(),
    };
    let swinging = position.swings_forward_first() || position.swings_backward_first();
    let z = if swinging && !forward { 2.0 * TORSO_PLANE_Z - z } else { z };
    Vector3::new(x, y, z)
}

// ============================================================================
// Mobility Model
// ============================================================================

/// Position of one node on the body.
#[derive(Debug, Clone, PartialEq)]
pub struct MobilityModel {
    body_position: BodyPosition,
    position: Vector3,
}

impl MobilityModel {
    /// Create a model at the PHASE_0 posture of `body_position`.
    pub fn new(body_position: BodyPosition) -> Self {
        MobilityModel {
            body_position,
            position: posture(MovementPhase::Phase0, body_position),
        }
    }

    /// Body position tag.
    pub fn get_body_position(&self) -> BodyPosition {
        self.body_position
    }

    /// Current coordinate.
    pub fn get_position(&self) -> Vector3 {
        self.position
    }

    /// Move the node.
    pub fn set_position(&mut self, position: Vector3) {
        self.position = position;
    }

    /// Distance in meters from this node to `other`.
    pub fn get_distance_from(&self, other: &Vector3) -> f64 {
        self.position.distance_to(other)
    }

    /// False iff the two points lie on opposite sides of the torso plane.
    pub fn is_los(&self, other: &Vector3) -> bool {
        (self.position.z - TORSO_PLANE_Z) * (other.z - TORSO_PLANE_Z) >= 0.0
    }

    /// Returns true if this node sits on a limb joint hidden behind the body.
    pub fn is_limb_blocked(&self) -> bool {
        self.body_position
            .limb_band()
            .map(|band| band.blocks(&self.position))
            .unwrap_or(false)
    }
}

// ============================================================================
// Mobility Helper
// ============================================================================

/// Which body positions may transact in which slot, per phase.
///
/// Positions absent from the table never transact.
pub fn transaction_ability(phase: MovementPhase, position: BodyPosition) -> Option<[bool; TABLE_SLOTS]> {
    const EARLY: [bool; TABLE_SLOTS] = [true, true, true, true, true, false, false, false];
    const LATE: [bool; TABLE_SLOTS] = [false, false, false, true, true, true, true, true];
    const ALWAYS: [bool; TABLE_SLOTS] = [true; TABLE_SLOTS];

    if position == BodyPosition::Body {
        return Some(ALWAYS);
    }
    let (first, second) = match phase {
        MovementPhase::Phase0 => (EARLY, LATE),
        MovementPhase::Phase1 => (LATE, EARLY),
    };
    if position.swings_forward_first() {
        Some(first)
    } else if position.swings_backward_first() {
        Some(second)
    } else {
        None
    }
}

/// Tracks the movement phase and every node's mobility model.
#[derive(Debug, Clone)]
pub struct MobilityHelper {
    current_phase: MovementPhase,
    phase_info: MovementInfo,
    mobility_list: BTreeMap<NodeId, MobilityModel>,
}

/// Shared handle to the mobility helper.
pub type SharedMobility = Arc<RwLock<MobilityHelper>>;

impl MobilityHelper {
    /// Create a helper in PHASE_0 with no nodes.
    pub fn new() -> Self {
        MobilityHelper {
            current_phase: MovementPhase::Phase0,
            phase_info: MovementInfo::default(),
            mobility_list: BTreeMap::new(),
        }
    }

    /// Create a helper whose phases each last `duration`.
    pub fn with_phase_duration(duration: SimTime) -> Self {
        let mut helper = Self::new();
        helper.phase_info.phase_duration = vec![duration; MovementPhase::ALL.len()];
        helper
    }

    /// Wrap into a shared handle.
    pub fn into_shared(self) -> SharedMobility {
        Arc::new(RwLock::new(self))
    }

    /// Current movement phase.
    pub fn current_phase(&self) -> MovementPhase {
        self.current_phase
    }

    /// Phase list and durations.
    pub fn phase_info(&self) -> &MovementInfo {
        &self.phase_info
    }

    /// Duration of the current phase.
    pub fn current_phase_duration(&self) -> SimTime {
        self.phase_info.duration_of(self.current_phase)
    }

    /// Register a node at a body position.
    pub fn add_mobility(&mut self, node: NodeId, body_position: BodyPosition) {
        let mut model = MobilityModel::new(body_position);
        model.set_position(posture(self.current_phase, body_position));
        self.mobility_list.insert(node, model);
    }

    /// Mobility model of `node`.
    pub fn mobility(&self, node: NodeId) -> Option<&MobilityModel> {
        self.mobility_list.get(&node)
    }

    /// Registered nodes and their models.
    pub fn mobility_list(&self) -> impl Iterator<Item = (NodeId, &MobilityModel)> {
        self.mobility_list.iter().map(|(id, m)| (*id, m))
    }

    /// Whether `sender` may transmit in `time_slot` during the current phase.
    pub fn can_transaction(&self, sender: NodeId, time_slot: u32) -> bool {
        let Some(model) = self.mobility_list.get(&sender) else {
            return false;
        };
        debug!(
            "Mobility: referencing transaction_ability[{}][{}][slot: {}]",
            self.current_phase,
            model.get_body_position(),
            time_slot
        );
        transaction_ability(self.current_phase, model.get_body_position())
            .and_then(|row| row.get(time_slot as usize).copied())
            .unwrap_or(false)
    }

    /// Toggle the movement phase and move every node to its new posture.
    pub fn change_cycle(&mut self) -> MovementPhase {
        self.current_phase = self.current_phase.next();
        for model in self.mobility_list.values_mut() {
            let position = posture(self.current_phase, model.get_body_position());
            model.set_position(position);
        }
        info!("Mobility: phase is now {}", self.current_phase);
        self.current_phase
    }
}

impl Default for MobilityHelper {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Phase Driver Entity
// ============================================================================

const TIMER_PHASE_TOGGLE: u32 = 1;

/// Entity that toggles the movement phase every phase duration minus 1 µs.
pub struct MobilityDriver {
    id: EntityId,
    helper: SharedMobility,
}

impl MobilityDriver {
    /// Create a driver for `helper`.
    pub fn new(id: EntityId, helper: SharedMobility) -> Self {
        MobilityDriver { id, helper }
    }

    /// Interval between toggles.
    pub fn toggle_period(&self) -> SimTime {
        let duration = self.helper.read().current_phase_duration();
        duration - SimTime::from_micros(1)
    }

    /// Timer ID of the toggle, for posting the first one.
    pub fn toggle_timer_id() -> u64 {
        timer_id(TIMER_PHASE_TOGGLE, 0)
    }
}

impl Entity for MobilityDriver {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        match &event.payload {
            EventPayload::Timer { timer_id } if split_timer_id(*timer_id).0 == TIMER_PHASE_TOGGLE => {
                self.helper.write().change_cycle();
                let period = self.toggle_period();
                ctx.post_timer(period, Self::toggle_timer_id());
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peripheral_positions_start_at_left_elbow() {
        assert_eq!(BodyPosition::for_peripheral(0), Some(BodyPosition::LeftElbow));
        assert_eq!(BodyPosition::for_peripheral(1), Some(BodyPosition::LeftWrist));
        assert_eq!(BodyPosition::for_peripheral(7), Some(BodyPosition::RightAnkle));
        assert_eq!(BodyPosition::for_peripheral(8), Some(BodyPosition::Body));
        assert_eq!(BodyPosition::for_peripheral(9), None);
    }

    #[test]
    fn test_transaction_table_swaps_between_phases() {
        let mut helper = MobilityHelper::new();
        helper.add_mobility(NodeId(0), BodyPosition::LeftElbow);
        helper.add_mobility(NodeId(2), BodyPosition::RightElbow);

        assert!(helper.can_transaction(NodeId(0), 0));
        assert!(!helper.can_transaction(NodeId(0), 5));
        assert!(!helper.can_transaction(NodeId(2), 0));
        assert!(helper.can_transaction(NodeId(2), 7));

        helper.change_cycle();
        assert_eq!(helper.current_phase(), MovementPhase::Phase1);
        assert!(!helper.can_transaction(NodeId(0), 0));
        assert!(helper.can_transaction(NodeId(0), 5));
        assert!(helper.can_transaction(NodeId(2), 0));
    }

    #[test]
    fn test_absent_positions_and_slots_not_allowed() {
        let mut helper = MobilityHelper::new();
        helper.add_mobility(NodeId(0), BodyPosition::Head);
        helper.add_mobility(NodeId(1), BodyPosition::LeftElbow);
        assert!(!helper.can_transaction(NodeId(0), 0));
        assert!(!helper.can_transaction(NodeId(1), 8));
        assert!(!helper.can_transaction(NodeId(5), 0));
    }

    #[test]
    fn test_coordinator_position_allowed_everywhere() {
        let mut helper = MobilityHelper::new();
        helper.add_mobility(NodeId::COORDINATOR, BodyPosition::Body);
        for slot in 0..TABLE_SLOTS as u32 {
            assert!(helper.can_transaction(NodeId::COORDINATOR, slot));
        }
    }

    #[test]
    fn test_limbs_swing_across_torso_plane() {
        for position in [BodyPosition::LeftElbow, BodyPosition::RightAnkle, BodyPosition::LeftKnee] {
            let a = posture(MovementPhase::Phase0, position);
            let b = posture(MovementPhase::Phase1, position);
            assert!((a.z - TORSO_PLANE_Z) * (b.z - TORSO_PLANE_Z) < 0.0, "{position} did not swing");
        }
        assert_eq!(
            posture(MovementPhase::Phase0, BodyPosition::Head),
            posture(MovementPhase::Phase1, BodyPosition::Head)
        );
    }

    #[test]
    fn test_is_los_straddle() {
        let model = MobilityModel::new(BodyPosition::Body);
        assert!(model.is_los(&Vector3::new(0.0, 0.0, 1.2)));
        assert!(!model.is_los(&Vector3::new(0.0, 0.0, 0.8)));
    }

    #[test]
    fn test_limb_blocked_only_when_behind() {
        let mut helper = MobilityHelper::new();
        helper.add_mobility(NodeId(0), BodyPosition::RightElbow);
        helper.add_mobility(NodeId(1), BodyPosition::Head);
        assert!(helper.mobility(NodeId(0)).map(|m| m.is_limb_blocked()).unwrap_or(false));
        assert!(!helper.mobility(NodeId(1)).map(|m| m.is_limb_blocked()).unwrap_or(true));
        helper.change_cycle();
        assert!(!helper.mobility(NodeId(0)).map(|m| m.is_limb_blocked()).unwrap_or(true));
    }

    #[test]
    fn test_driver_toggles_and_reschedules() {
        let helper = MobilityHelper::new().into_shared();
        let mut driver = MobilityDriver::new(EntityId(7), Arc::clone(&helper));
        let mut ctx = SimContext::new(42);
        ctx.set_source(EntityId(7));
        let event = Event {
            id: bansim_common::EventId(0),
            time: SimTime::ZERO,
            source: EntityId(7),
            targets: vec![EntityId(7)],
            payload: EventPayload::Timer {
                timer_id: MobilityDriver::toggle_timer_id(),
            },
        };
        driver.handle_event(&event, &mut ctx).unwrap();
        assert_eq!(helper.read().current_phase(), MovementPhase::Phase1);
        let pending = ctx.take_pending_events();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].time, SimTime::from_micros(499_999));
    }

    #[test]
    fn test_custom_phase_duration() {
        let helper = MobilityHelper::with_phase_duration(SimTime::from_millis(200));
        assert_eq!(helper.current_phase_duration(), SimTime::from_millis(200));
        let driver = MobilityDriver::new(EntityId(7), helper.into_shared());
        assert_eq!(driver.toggle_period(), SimTime::from_micros(199_999));
    }
}
