//! Property constant definitions.
//!
//! The description string is what `bansim properties` prints, so it carries
//! everything a user needs: what the key controls, valid values and special
//! behavior. Doc comments are for implementation notes.

use super::{Property, PropertyDefault};

// ============================================================================
// Topology
// ============================================================================

/// Peripherals are placed from LEFT_ELBOW onwards, the ninth on BODY.
pub const NODE_COUNT: Property<usize> = Property::new(
    "node_count",
    "Number of peripheral nodes around the coordinator (1-9)",
    PropertyDefault::Integer(8),
);

// ============================================================================
// Beacon Schedule
// ============================================================================

pub const TIME_SLOTS: Property<usize> = Property::new(
    "time_slots",
    "Number of schedule entries the coordinator allocates in every beacon",
    PropertyDefault::Integer(8),
);

/// Also the length of each movement phase, which the beacon period follows.
pub const BEACON_INTERVAL: Property<f64> = Property::new(
    "beacon_interval",
    "Beacon period; each of the two movement phases lasts this long and carries one beacon",
    PropertyDefault::Float(500.0),
)
.with_unit("ms");

pub const SLOT_DURATION: Property<u32> = Property::new(
    "slot_duration",
    "Allocation slots left free after each schedule entry",
    PropertyDefault::Integer(1),
)
.with_unit("slots");

pub const PACKET_SIZE: Property<usize> = Property::new(
    "packet_size",
    "Size of beacon, data and acknowledgement frames",
    PropertyDefault::Integer(10),
)
.with_unit("bytes");

/// "scheduled" or "contention".
pub const ACCESS_MODE: Property<String> = Property::new(
    "access_mode",
    "Peripheral channel access: \"scheduled\" transmits only inside the slot granted by the beacon, \
     \"contention\" runs CSMA/CA before every transmission",
    PropertyDefault::String("scheduled"),
);

// ============================================================================
// Radio
// ============================================================================

pub const ADDITIONAL_TX_LOSS: Property<f64> = Property::new(
    "additional_tx_loss",
    "Fixed loss applied on every link on top of path loss",
    PropertyDefault::Float(0.0),
)
.with_unit("dB");

pub const RX_SENSITIVITY: Property<f64> = Property::new(
    "rx_sensitivity",
    "Lowest received power a PHY can decode",
    PropertyDefault::Float(-82.0),
)
.with_unit("dBm");

pub const LOS_GATING: Property<bool> = Property::new(
    "los_gating",
    "Drop frames towards limb joints hidden behind the body in the current posture",
    PropertyDefault::Bool(false),
);

// ============================================================================
// Slot Allocation
// ============================================================================

pub const USE_Q_LEARNING: Property<bool> = Property::new(
    "use_q_learning",
    "Learn the slot schedule with Q-learning; when false every beacon uses a round-robin schedule",
    PropertyDefault::Bool(true),
);

pub const LEARNING_RATE: Property<f64> = Property::new(
    "learning_rate",
    "Q-learning step size (0-1)",
    PropertyDefault::Float(0.5),
);

pub const DISCOUNT_FACTOR: Property<f64> = Property::new(
    "discount_factor",
    "Weight of the next slot's best Q value (0-1)",
    PropertyDefault::Float(0.9),
);

pub const EXPLORATION_RATE: Property<f64> = Property::new(
    "exploration_rate",
    "Probability of allocating a slot to a random node instead of the best known one (0-1)",
    PropertyDefault::Float(0.5),
);

pub const USE_UNALLOCATED: Property<bool> = Property::new(
    "use_unallocated",
    "Allow the trainer to leave a slot unallocated",
    PropertyDefault::Bool(false),
);

/// Node i gets priority `i + priority_weight`.
pub const PRIORITY_WEIGHT: Property<f64> = Property::new(
    "priority_weight",
    "Offset added to each node's index to form the priority that scales its reward",
    PropertyDefault::Float(0.1),
);

// ============================================================================
// Simulation
// ============================================================================

pub const SIMULATION_TIME: Property<f64> = Property::new(
    "simulation_time",
    "Simulated time to run; --duration on the command line overrides it",
    PropertyDefault::Float(10.0),
)
.with_unit("s");

pub const SEED: Property<u64> = Property::new(
    "seed",
    "Random seed for CSMA/CA backoff and slot exploration; --seed overrides it",
    PropertyDefault::Integer(0),
);

/// Used only when RUST_LOG is unset.
pub const LOG_LEVEL: Property<String> = Property::new(
    "log_level",
    "Log filter when RUST_LOG is not set (error, warn, info, debug, trace)",
    PropertyDefault::String("warn"),
);
