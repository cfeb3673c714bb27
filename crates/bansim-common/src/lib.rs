//! # bansim-common
//!
//! Common types and traits for the BAN simulation framework.
//!
//! This crate provides core simulation primitives including:
//! - Time representation ([`SimTime`])
//! - Cartesian coordinates ([`Vector3`])
//! - Entity identification ([`EntityId`])
//! - Event system ([`Event`], [`EventPayload`])
//! - Simulated packets ([`Packet`], [`SpectrumSignalParameters`])
//! - Simulation context ([`SimContext`])
//! - Entity traits ([`Entity`]) and the [`EntityRegistry`]
//! - Cancellable timers ([`CancellableTimer`])

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::error;

// Re-export frame types
pub use bansim_packet::{
    AssignedLinkElement, Beacon, FrameBody, FrameSubtype, FrameType, MacHeader, NodeId, PacketError,
    TxOption, TxParams,
};

// ============================================================================
// Error Types
// ============================================================================

/// Simulation errors.
///
/// Every variant is fatal: a handler returning one of these stops the run.
#[derive(Debug, Error)]
pub enum SimError {
    /// Entity not found.
    #[error("Entity not found: {0:?}")]
    EntityNotFound(EntityId),

    /// Invalid event target.
    #[error("Invalid event target: {0:?}")]
    InvalidTarget(EntityId),

    /// Simulation time overflow.
    #[error("Simulation time overflow")]
    TimeOverflow,

    /// A collaborator the entity needs was never wired in.
    #[error("Missing {what} in entity {entity:?}")]
    MissingModel {
        /// Entity that is missing the model.
        entity: EntityId,
        /// What is missing.
        what: &'static str,
    },

    /// A packet was required but absent.
    #[error("Missing packet in entity {entity:?}: {context}")]
    MissingPacket {
        /// Entity that expected the packet.
        entity: EntityId,
        /// Where the packet was expected.
        context: &'static str,
    },

    /// A state machine was driven into a transition it does not allow.
    #[error("Invalid state in entity {entity:?}: {message}")]
    InvalidState {
        /// Entity whose state machine rejected the transition.
        entity: EntityId,
        /// Description of the transition.
        message: String,
    },

    /// Frame construction failed.
    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),

    /// Event handler error.
    #[error("Event handler error in entity {entity:?}: {message}")]
    HandlerError {
        /// Entity that had the error.
        entity: EntityId,
        /// Error message.
        message: String,
    },
}

// ============================================================================
// Time Types
// ============================================================================

/// Simulation time in nanoseconds since simulation start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct SimTime(u64);

impl SimTime {
    /// Zero time.
    pub const ZERO: SimTime = SimTime(0);

    /// Create from nanoseconds.
    pub fn from_nanos(ns: u64) -> Self {
        SimTime(ns)
    }

    /// Create from microseconds.
    pub fn from_micros(us: u64) -> Self {
        SimTime(us * 1_000)
    }

    /// Create from milliseconds.
    pub fn from_millis(ms: u64) -> Self {
        SimTime(ms * 1_000_000)
    }

    /// Create from seconds (float), rounded to the nearest nanosecond.
    ///
    /// Negative and non-finite inputs clamp to zero.
    pub fn from_secs(s: f64) -> Self {
        if !s.is_finite() || s <= 0.0 {
            return SimTime::ZERO;
        }
        SimTime((s * 1e9).round() as u64)
    }

    /// Get as nanoseconds.
    pub fn as_nanos(&self) -> u64 {
        self.0
    }

    /// Get as microseconds.
    pub fn as_micros(&self) -> u64 {
        self.0 / 1_000
    }

    /// Get as milliseconds.
    pub fn as_millis(&self) -> u64 {
        self.0 / 1_000_000
    }

    /// Get as seconds (float).
    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / 1e9
    }

    /// Add duration to time.
    pub fn add(&self, duration: SimTime) -> Option<SimTime> {
        self.0.checked_add(duration.0).map(SimTime)
    }

    /// Subtract duration from time.
    pub fn sub(&self, duration: SimTime) -> Option<SimTime> {
        self.0.checked_sub(duration.0).map(SimTime)
    }
}

impl std::ops::Add for SimTime {
    type Output = SimTime;

    fn add(self, rhs: Self) -> Self::Output {
        SimTime(self.0 + rhs.0)
    }
}

impl std::ops::Sub for SimTime {
    type Output = SimTime;

    fn sub(self, rhs: Self) -> Self::Output {
        SimTime(self.0.saturating_sub(rhs.0))
    }
}

impl fmt::Display for SimTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.9}s", self.as_secs_f64())
    }
}

// ============================================================================
// Spatial Types
// ============================================================================

/// Cartesian coordinate in meters.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vector3 {
    /// X coordinate.
    pub x: f64,
    /// Y coordinate (height).
    pub y: f64,
    /// Z coordinate (depth).
    pub z: f64,
}

impl Vector3 {
    /// Create a new vector.
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Vector3 { x, y, z }
    }

    /// Euclidean distance to another point in meters.
    pub fn distance_to(&self, other: &Vector3) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

// ============================================================================
// Entity Types
// ============================================================================

/// Unique identifier for an entity in the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub u64);

impl EntityId {
    /// Create a new entity ID.
    pub fn new(id: u64) -> Self {
        EntityId(id)
    }
}

// ============================================================================
// Packet Types
// ============================================================================

/// Antenna attached to a transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AntennaModel {
    /// Isotropic antenna with no gain.
    #[default]
    Isotropic,
}

/// Spectrum parameters stamped by the transmitting PHY.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SpectrumSignalParameters {
    /// Time the transmission occupies the medium.
    pub duration: SimTime,
    /// Transmit power in dBm; reduced by path loss on each receiver's copy.
    pub tx_power_dbm: f64,
    /// Entity of the transmitting node.
    pub tx_phy: Option<EntityId>,
    /// Transmitting antenna.
    pub tx_antenna: AntennaModel,
}

/// Simulated packet.
///
/// Header and body are shared between the copies fanned out by the channel;
/// the spectrum parameters and success flag belong to each copy.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Size in bytes.
    pub size: usize,
    /// Reception outcome, set by the receiving PHY.
    pub success: bool,
    /// Spectrum parameters.
    pub spectrum: SpectrumSignalParameters,
    header: Arc<MacHeader>,
    body: Arc<FrameBody>,
}

impl Packet {
    /// Create a packet with a fully populated header.
    pub fn new(size: usize, header: MacHeader, body: FrameBody) -> Self {
        Packet {
            size,
            success: false,
            spectrum: SpectrumSignalParameters::default(),
            header: Arc::new(header),
            body: Arc::new(body),
        }
    }

    /// Per-receiver copy: shares header and body, owns its spectrum parameters.
    pub fn copy(&self) -> Self {
        Packet {
            size: self.size,
            success: false,
            spectrum: self.spectrum,
            header: Arc::clone(&self.header),
            body: Arc::clone(&self.body),
        }
    }

    /// MAC header.
    pub fn header(&self) -> &MacHeader {
        &self.header
    }

    /// Frame body.
    pub fn body(&self) -> &FrameBody {
        &self.body
    }

    /// Mutable frame body, cloned first if another copy shares it.
    pub fn body_mut(&mut self) -> &mut FrameBody {
        Arc::make_mut(&mut self.body)
    }

    /// Size in bits.
    pub fn size_bits(&self) -> u64 {
        self.size as u64 * 8
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub u64);

/// A simulation event.
#[derive(Debug, Clone)]
pub struct Event {
    /// Unique event ID.
    pub id: EventId,
    /// Time when the event occurs.
    pub time: SimTime,
    /// Entity that created the event.
    pub source: EntityId,
    /// Target entities for the event.
    pub targets: Vec<EntityId>,
    /// Event payload.
    pub payload: EventPayload,
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse ordering for min-heap (earliest time first, then posting order)
        other.time.cmp(&self.time).then_with(|| other.id.0.cmp(&self.id.0))
    }
}

/// Transmit air event - a PHY finished occupying the medium.
/// Directed to the Channel entity which fans out to receivers.
#[derive(Debug, Clone)]
pub struct TransmitAirEvent {
    /// Node entity that is transmitting.
    pub phy_id: EntityId,
    /// The packet being transmitted.
    pub packet: Packet,
}

/// Receive air event - sent from the Channel entity to a receiving node.
#[derive(Debug, Clone)]
pub struct ReceiveAirEvent {
    /// Node entity that transmitted.
    pub source_phy_id: EntityId,
    /// The receiver's own copy of the packet, after path loss.
    pub packet: Packet,
}

/// Event payload variants.
#[derive(Debug, Clone)]
pub enum EventPayload {
    // =========== Radio Layer Events ===========
    /// A PHY transmission is on the air (directed to the Channel entity).
    TransmitAir(TransmitAirEvent),
    /// A packet arrives at a receiver (from the Channel entity).
    ReceiveAir(ReceiveAirEvent),

    // =========== Scheduling ===========
    /// A delayed callback.
    Timer {
        /// Timer ID, see [`timer_id`].
        timer_id: u64,
    },

    // =========== Simulation Control ===========
    /// End the simulation.
    SimulationEnd,
}

// ============================================================================
// Timers
// ============================================================================

/// Pack a timer kind and a token into one timer ID.
pub fn timer_id(kind: u32, token: u32) -> u64 {
    ((kind as u64) << 32) | token as u64
}

/// Split a timer ID into its kind and token.
pub fn split_timer_id(id: u64) -> (u32, u32) {
    ((id >> 32) as u32, id as u32)
}

/// A timer that can be cancelled after it was posted.
///
/// Posted events are never removed from the queue. Instead each arming hands
/// out a fresh token, and a firing is live only if its token is still armed.
#[derive(Debug, Clone, Default)]
pub struct CancellableTimer {
    armed: Option<u32>,
    next_token: u32,
}

impl CancellableTimer {
    /// Create a disarmed timer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer, replacing any previous arming, and return its token.
    pub fn arm(&mut self) -> u32 {
        let token = self.next_token;
        self.next_token = self.next_token.wrapping_add(1);
        self.armed = Some(token);
        token
    }

    /// Forget the current arming.
    pub fn cancel(&mut self) {
        self.armed = None;
    }

    /// Returns true while an arming is outstanding.
    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    /// Consume a firing. Returns true if `token` is the live arming.
    pub fn fire(&mut self, token: u32) -> bool {
        if self.armed == Some(token) {
            self.armed = None;
            true
        } else {
            false
        }
    }
}

// ============================================================================
// Simulation Context
// ============================================================================

/// Context passed to entities during event handling.
pub struct SimContext {
    time: SimTime,
    rng: ChaCha8Rng,
    pending_events: Vec<Event>,
    next_event_id: u64,
    source_entity: EntityId,
}

impl SimContext {
    /// Create a new simulation context.
    pub fn new(seed: u64) -> Self {
        SimContext {
            time: SimTime::ZERO,
            rng: ChaCha8Rng::seed_from_u64(seed),
            pending_events: Vec::new(),
            next_event_id: 0,
            source_entity: EntityId(0),
        }
    }

    /// Get the current simulation time.
    pub fn time(&self) -> SimTime {
        self.time
    }

    /// Get mutable access to the random number generator.
    pub fn rng(&mut self) -> &mut ChaCha8Rng {
        &mut self.rng
    }

    /// Set the current time (used by event loop).
    pub fn set_time(&mut self, time: SimTime) {
        self.time = time;
    }

    /// Set the source entity (used by event loop).
    pub fn set_source(&mut self, entity: EntityId) {
        self.source_entity = entity;
    }

    /// Entity currently handling an event.
    pub fn source(&self) -> EntityId {
        self.source_entity
    }

    /// Post an event to occur after a delay.
    pub fn post_event(&mut self, delay: SimTime, targets: Vec<EntityId>, payload: EventPayload) {
        let event = Event {
            id: EventId(self.next_event_id),
            time: self.time + delay,
            source: self.source_entity,
            targets,
            payload,
        };
        self.next_event_id += 1;
        self.pending_events.push(event);
    }

    /// Post an event to occur immediately (at current time).
    pub fn post_immediate(&mut self, targets: Vec<EntityId>, payload: EventPayload) {
        self.post_event(SimTime::ZERO, targets, payload);
    }

    /// Post a timer back to the entity currently handling an event.
    pub fn post_timer(&mut self, delay: SimTime, timer_id: u64) {
        let target = self.source_entity;
        self.post_event(delay, vec![target], EventPayload::Timer { timer_id });
    }

    /// Take all pending events (used by event loop).
    pub fn take_pending_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.pending_events)
    }

    /// Get the next event ID (used by event loop for external event creation).
    pub fn next_event_id(&mut self) -> u64 {
        let id = self.next_event_id;
        self.next_event_id += 1;
        id
    }
}

// ============================================================================
// Entity Trait
// ============================================================================

/// Base trait for all simulation entities.
pub trait Entity: Send {
    /// Get the entity's unique ID.
    fn entity_id(&self) -> EntityId;

    /// Handle an event.
    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError>;
}

// ============================================================================
// Entity Registry
// ============================================================================

/// Registry for managing simulation entities.
pub struct EntityRegistry {
    entities: HashMap<EntityId, Box<dyn Entity>>,
}

impl EntityRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        EntityRegistry {
            entities: HashMap::new(),
        }
    }

    /// Register an entity.
    pub fn register(&mut self, entity: Box<dyn Entity>) {
        let id = entity.entity_id();
        self.entities.insert(id, entity);
    }

    /// Get an entity by ID.
    pub fn get(&self, id: EntityId) -> Option<&dyn Entity> {
        self.entities.get(&id).map(|e| e.as_ref())
    }

    /// Get a mutable reference to an entity by ID.
    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut Box<dyn Entity>> {
        self.entities.get_mut(&id)
    }

    /// Dispatch an event to its target entities.
    pub fn dispatch_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        for target in &event.targets {
            if let Some(entity) = self.entities.get_mut(target) {
                ctx.set_source(*target);
                entity.handle_event(event, ctx)?;
            } else {
                error!("EntityNotFound {:?} when dispatching {:?}", target, event.payload);
                return Err(SimError::EntityNotFound(*target));
            }
        }
        Ok(())
    }

    /// Get all entity IDs.
    pub fn entity_ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.entities.keys().copied()
    }

    /// Get the number of registered entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl Default for EntityRegistry {
    fn default() -> Self {
        Self::new()
    }
}
