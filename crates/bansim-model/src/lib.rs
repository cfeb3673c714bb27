//! # bansim-model
//!
//! Configuration loading and simulation building for the BAN simulator.
//!
//! This crate provides:
//! - The property registry describing every configuration key
//! - Flat configuration loading from JSON or YAML files and strings
//! - [`SimulationConfig`], the typed view handed to every layer
//! - [`build_simulation`], which wires channel, mobility, trainer and nodes
//!
//! A configuration file is a single flat mapping from property name to value:
//!
//! ```yaml
//! node_count: 4
//! time_slots: 8
//! use_q_learning: true
//! learning_rate: "0.5"
//! ```

pub mod properties;

pub use properties::{
    default_value, get_property_def, is_known_property, FromPropertyValue, Property, PropertyDef,
    PropertyDefault, PropertySetError, PropertyType, PropertyValue, ResolvedProperties,
    ALL_PROPERTIES,
};

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use bansim_channel::{Channel, ChannelConfig, PropDelayModel, PropLossModel};
use bansim_common::{
    Entity, EntityId, EntityRegistry, Event, NodeId, SimContext, SimError, SimTime,
};
use bansim_device::{AccessMode, BanNode, NodeConfig, SharedSlotAllocator, TracerHandle};
use bansim_mobility::{BodyPosition, MobilityDriver, MobilityHelper, SharedMobility};
use bansim_rl::{QLearningConfig, QLearningTrainer};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use properties::definitions::*;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur while loading a configuration or building a simulation.
#[derive(Debug, Error)]
pub enum ModelError {
    /// YAML parsing error.
    #[error("YAML parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// JSON parsing error.
    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// A value that cannot be converted to its property's type.
    #[error("Property error: {0}")]
    PropertyError(#[from] PropertySetError),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Error while starting the entities.
    #[error("Simulation error: {0}")]
    Simulation(#[from] SimError),
}

// ============================================================================
// Loading
// ============================================================================

/// Load a configuration file. `.json` files are read as JSON, anything else as YAML.
pub fn load_config(path: &Path) -> Result<ResolvedProperties, ModelError> {
    let text = std::fs::read_to_string(path)?;
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if is_json {
        load_config_from_json(&text)
    } else {
        load_config_from_yaml(&text)
    }
}

/// Parse a flat JSON object.
pub fn load_config_from_json(json: &str) -> Result<ResolvedProperties, ModelError> {
    let raw: BTreeMap<String, serde_json::Value> = serde_json::from_str(json)?;
    let mut values = BTreeMap::new();
    for (key, value) in raw {
        let value = match value {
            serde_json::Value::Null => continue,
            serde_json::Value::Bool(b) => PropertyValue::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => PropertyValue::Integer(i),
                None => PropertyValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => PropertyValue::String(s),
            other => {
                return Err(ModelError::InvalidConfig(format!(
                    "{}: expected a scalar value, got {}",
                    key, other
                )))
            }
        };
        values.insert(key, value);
    }
    resolve(values)
}

/// Parse a flat YAML mapping. An empty document yields all defaults.
pub fn load_config_from_yaml(yaml: &str) -> Result<ResolvedProperties, ModelError> {
    let raw: Option<BTreeMap<String, serde_yaml::Value>> = serde_yaml::from_str(yaml)?;
    let mut values = BTreeMap::new();
    for (key, value) in raw.unwrap_or_default() {
        let value = match value {
            serde_yaml::Value::Null => continue,
            serde_yaml::Value::Bool(b) => PropertyValue::Bool(b),
            serde_yaml::Value::Number(n) => match n.as_i64() {
                Some(i) => PropertyValue::Integer(i),
                None => PropertyValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_yaml::Value::String(s) => PropertyValue::String(s),
            _ => {
                return Err(ModelError::InvalidConfig(format!(
                    "{}: expected a scalar value",
                    key
                )))
            }
        };
        values.insert(key, value);
    }
    resolve(values)
}

fn resolve(values: BTreeMap<String, PropertyValue>) -> Result<ResolvedProperties, ModelError> {
    let mut props = ResolvedProperties::new();
    for (key, value) in &values {
        if !is_known_property(key) {
            warn!("Ignoring unknown configuration key '{}'", key);
            continue;
        }
        props.set_by_name(key, value)?;
    }
    Ok(props)
}

// ============================================================================
// Typed Configuration
// ============================================================================

/// Everything [`build_simulation`] needs, split per layer.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationConfig {
    /// Peripherals around the coordinator.
    pub node_count: usize,
    /// Run length.
    pub simulation_time: SimTime,
    pub seed: u64,
    /// Log filter used when RUST_LOG is unset.
    pub log_level: String,
    /// Length of each movement phase and so of each beacon period.
    pub beacon_interval: SimTime,
    pub channel: ChannelConfig,
    /// Template for every peripheral; the node id is filled in per node.
    pub node: NodeConfig,
    pub q_learning: QLearningConfig,
}

impl SimulationConfig {
    /// Typed configuration from a resolved property set.
    pub fn from_properties(props: &ResolvedProperties) -> Result<Self, ModelError> {
        let node_count: usize = props.try_get(&NODE_COUNT)?;
        if node_count == 0 || BodyPosition::for_peripheral(node_count - 1).is_none() {
            return Err(ModelError::InvalidConfig(format!(
                "node_count must be between 1 and {}, got {}",
                peripheral_capacity(),
                node_count
            )));
        }

        let time_slots: usize = props.try_get(&TIME_SLOTS)?;
        if time_slots == 0 {
            return Err(ModelError::InvalidConfig("time_slots must be at least 1".to_string()));
        }
        let time_slots_u32 = u32::try_from(time_slots)
            .map_err(|_| ModelError::InvalidConfig(format!("time_slots too large: {}", time_slots)))?;

        let beacon_interval_ms: f64 = props.try_get(&BEACON_INTERVAL)?;
        if !(beacon_interval_ms.is_finite() && beacon_interval_ms > 0.0) {
            return Err(ModelError::InvalidConfig(format!(
                "beacon_interval must be positive, got {}",
                beacon_interval_ms
            )));
        }

        let simulation_secs: f64 = props.try_get(&SIMULATION_TIME)?;
        if !(simulation_secs.is_finite() && simulation_secs >= 0.0) {
            return Err(ModelError::InvalidConfig(format!(
                "simulation_time must not be negative, got {}",
                simulation_secs
            )));
        }

        let packet_size: usize = props.try_get(&PACKET_SIZE)?;
        if packet_size == 0 {
            return Err(ModelError::InvalidConfig("packet_size must be at least 1".to_string()));
        }

        for prop in [&LEARNING_RATE, &DISCOUNT_FACTOR, &EXPLORATION_RATE] {
            let value: f64 = props.try_get(prop)?;
            if !(0.0..=1.0).contains(&value) {
                return Err(ModelError::InvalidConfig(format!(
                    "{} must be between 0 and 1, got {}",
                    prop.name(),
                    value
                )));
            }
        }

        let access_mode = parse_access_mode(&props.try_get(&ACCESS_MODE)?)?;
        let seed: u64 = props.try_get(&SEED)?;

        let mut node = NodeConfig::new(NodeId(0));
        node.phy.rx_sensitivity_dbm = props.try_get(&RX_SENSITIVITY)?;
        node.mac.access_mode = access_mode;
        node.mac.ack_packet_size = packet_size;
        node.sscs.packet_size = packet_size;
        node.sscs.time_slots = time_slots_u32;
        node.sscs.slot_duration = props.try_get(&SLOT_DURATION)?;

        let channel = ChannelConfig {
            los_gating: props.try_get(&LOS_GATING)?,
            additional_tx_loss_db: props.try_get(&ADDITIONAL_TX_LOSS)?,
            ..ChannelConfig::default()
        };

        let q_learning = QLearningConfig {
            time_slots,
            learning_rate: props.try_get(&LEARNING_RATE)?,
            discount_factor: props.try_get(&DISCOUNT_FACTOR)?,
            exploration_rate: props.try_get(&EXPLORATION_RATE)?,
            use_unallocated: props.try_get(&USE_UNALLOCATED)?,
            use_q_learning: props.try_get(&USE_Q_LEARNING)?,
            priority_weight: props.try_get(&PRIORITY_WEIGHT)?,
            seed,
        };

        Ok(SimulationConfig {
            node_count,
            simulation_time: SimTime::from_secs(simulation_secs),
            seed,
            log_level: props.try_get(&LOG_LEVEL)?,
            beacon_interval: SimTime::from_secs(beacon_interval_ms / 1000.0),
            channel,
            node,
            q_learning,
        })
    }

    /// Replace the seed everywhere it is used.
    pub fn set_seed(&mut self, seed: u64) {
        self.seed = seed;
        self.q_learning.seed = seed;
    }
}

fn peripheral_capacity() -> usize {
    (0..).take_while(|&i| BodyPosition::for_peripheral(i).is_some()).count()
}

fn parse_access_mode(value: &str) -> Result<AccessMode, ModelError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "scheduled" => Ok(AccessMode::Scheduled),
        "contention" => Ok(AccessMode::Contention),
        other => Err(ModelError::InvalidConfig(format!(
            "access_mode must be \"scheduled\" or \"contention\", got \"{}\"",
            other
        ))),
    }
}

// ============================================================================
// Simulation Building
// ============================================================================

/// Information about a node in the built simulation.
#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    /// "coordinator" or "node<i>".
    pub name: String,
    pub node_id: NodeId,
    pub entity_id: u64,
    pub body_position: BodyPosition,
}

/// Result of building a simulation.
pub struct BuiltSimulation {
    /// Registry of all entities.
    pub entities: EntityRegistry,
    /// Initial events to seed the event queue.
    pub initial_events: Vec<Event>,
    /// Context the entities were started with; the event loop continues it.
    pub context: SimContext,
    /// Information about each node, coordinator first.
    pub node_infos: Vec<NodeInfo>,
    /// Statistics of every node.
    pub tracers: BTreeMap<NodeId, TracerHandle>,
    /// The coordinator's slot allocator.
    pub allocator: SharedSlotAllocator,
    pub mobility: SharedMobility,
    pub config: SimulationConfig,
}

/// Build a simulation from a configuration.
///
/// Entity ids are allocated in a fixed order (channel, mobility driver,
/// coordinator, then peripherals by index) so the same configuration and
/// seed always produce the same run.
pub fn build_simulation(config: &SimulationConfig) -> Result<BuiltSimulation, ModelError> {
    let mut entities = EntityRegistry::new();
    let mut ctx = SimContext::new(config.seed);
    let mut next_entity_id = 1u64;
    let mut alloc_id = || {
        let id = EntityId::new(next_entity_id);
        next_entity_id += 1;
        id
    };

    let channel_id = alloc_id();
    let mobility_id = alloc_id();
    let coordinator_id = alloc_id();
    let peripheral_ids: Vec<EntityId> = (0..config.node_count).map(|_| alloc_id()).collect();

    // Mobility: coordinator on the torso, peripherals from LEFT_ELBOW onwards
    let mut helper = MobilityHelper::with_phase_duration(config.beacon_interval);
    helper.add_mobility(NodeId::COORDINATOR, BodyPosition::Body);
    let mut positions = Vec::with_capacity(config.node_count);
    for i in 0..config.node_count {
        let position = BodyPosition::for_peripheral(i).ok_or_else(|| {
            ModelError::InvalidConfig(format!("no body position left for node {}", i))
        })?;
        helper.add_mobility(NodeId(i as u32), position);
        positions.push(position);
    }
    let mobility = helper.into_shared();

    let mut channel = Channel::new(channel_id, config.channel.clone(), Arc::clone(&mobility));
    channel.set_loss_model(Box::new(PropLossModel::new()));
    channel.set_delay_model(Box::new(PropDelayModel::new()));

    let mut node_infos = Vec::with_capacity(config.node_count + 1);
    let mut tracers = BTreeMap::new();
    let mut peripherals = Vec::with_capacity(config.node_count);
    for (i, (&entity_id, &position)) in peripheral_ids.iter().zip(&positions).enumerate() {
        let node_id = NodeId(i as u32);
        let node_config = NodeConfig {
            node_id,
            ..config.node
        };
        let node = BanNode::new(entity_id, channel_id, node_config, Arc::clone(&mobility), None);
        channel.add_phy(entity_id, node_id);
        tracers.insert(node_id, node.tracer());
        node_infos.push(NodeInfo {
            name: format!("node{}", i),
            node_id,
            entity_id: entity_id.0,
            body_position: position,
        });
        debug!("Created node {} at {} as entity {:?}", node_id, position, entity_id);
        peripherals.push(node);
    }

    // The trainer reads and resets the peripherals' windows
    let trainer = QLearningTrainer::new(
        config.q_learning.clone(),
        tracers.values().cloned().collect(),
        Arc::clone(&mobility),
    );
    let allocator: SharedSlotAllocator = Arc::new(Mutex::new(trainer));

    let mut coordinator_config = NodeConfig {
        node_id: NodeId::COORDINATOR,
        ..config.node
    };
    coordinator_config.mac.access_mode = AccessMode::Scheduled;
    let mut coordinator = BanNode::new(
        coordinator_id,
        channel_id,
        coordinator_config,
        Arc::clone(&mobility),
        Some(Arc::clone(&allocator)),
    );
    channel.add_phy(coordinator_id, NodeId::COORDINATOR);
    tracers.insert(NodeId::COORDINATOR, coordinator.tracer());
    node_infos.insert(
        0,
        NodeInfo {
            name: "coordinator".to_string(),
            node_id: NodeId::COORDINATOR,
            entity_id: coordinator_id.0,
            body_position: BodyPosition::Body,
        },
    );

    // Start every stack; this posts the first beacon and data requests
    ctx.set_source(coordinator_id);
    coordinator.start(&mut ctx)?;
    for node in &mut peripherals {
        ctx.set_source(node.entity_id());
        node.start(&mut ctx)?;
    }

    let driver = MobilityDriver::new(mobility_id, Arc::clone(&mobility));
    ctx.set_source(mobility_id);
    ctx.post_timer(driver.toggle_period(), MobilityDriver::toggle_timer_id());

    entities.register(Box::new(channel));
    entities.register(Box::new(driver));
    entities.register(Box::new(coordinator));
    for node in peripherals {
        entities.register(Box::new(node));
    }

    let initial_events = ctx.take_pending_events();
    info!(
        "Built simulation: {} peripherals, {} entities, {} initial events",
        config.node_count,
        entities.len(),
        initial_events.len()
    );

    Ok(BuiltSimulation {
        entities,
        initial_events,
        context: ctx,
        node_infos,
        tracers,
        allocator,
        mobility,
        config: config.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bansim_common::EventPayload;
    use bansim_device::SlotAllocator;

    fn config_from_yaml(yaml: &str) -> SimulationConfig {
        let props = load_config_from_yaml(yaml).unwrap();
        SimulationConfig::from_properties(&props).unwrap()
    }

    #[test]
    fn test_json_and_yaml_agree() {
        let json = r#"{"node_count": "3", "learning_rate": 0.25, "use_unallocated": true}"#;
        let yaml = "node_count: 3\nlearning_rate: '0.25'\nuse_unallocated: 'true'\n";
        let from_json = SimulationConfig::from_properties(&load_config_from_json(json).unwrap()).unwrap();
        let from_yaml = config_from_yaml(yaml);
        assert_eq!(from_json, from_yaml);
        assert_eq!(from_json.node_count, 3);
        assert_eq!(from_json.q_learning.learning_rate, 0.25);
        assert!(from_json.q_learning.use_unallocated);
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config = config_from_yaml("");
        assert_eq!(config.node_count, 8);
        assert_eq!(config.beacon_interval, SimTime::from_millis(500));
        assert_eq!(config.simulation_time, SimTime::from_secs(10.0));
        assert_eq!(config.node.sscs.packet_size, 10);
        assert_eq!(config.node.mac.ack_packet_size, 10);
        assert_eq!(config.node.sscs.time_slots, 8);
        assert_eq!(config.node.mac.access_mode, AccessMode::Scheduled);
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn test_layer_configs_follow_properties() {
        let config = config_from_yaml(
            "packet_size: 20\nslot_duration: 2\nrx_sensitivity: -90\nadditional_tx_loss: 3.5\n\
             los_gating: true\naccess_mode: Contention\nseed: 7\n",
        );
        assert_eq!(config.node.sscs.packet_size, 20);
        assert_eq!(config.node.mac.ack_packet_size, 20);
        assert_eq!(config.node.sscs.slot_duration, 2);
        assert_eq!(config.node.phy.rx_sensitivity_dbm, -90.0);
        assert_eq!(config.channel.additional_tx_loss_db, 3.5);
        assert!(config.channel.los_gating);
        assert_eq!(config.node.mac.access_mode, AccessMode::Contention);
        assert_eq!(config.q_learning.seed, 7);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let bad = [
            "node_count: 0",
            "node_count: 10",
            "node_count: many",
            "time_slots: 0",
            "beacon_interval: 0",
            "learning_rate: 1.5",
            "access_mode: polling",
            "packet_size: 0",
        ];
        for yaml in bad {
            let result = load_config_from_yaml(yaml)
                .and_then(|props| SimulationConfig::from_properties(&props));
            assert!(result.is_err(), "{} should be rejected", yaml);
        }
        assert!(matches!(
            load_config_from_json(r#"{"node_count": [1, 2]}"#),
            Err(ModelError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let config = config_from_yaml("node_count: 2\nplot: true\n");
        assert_eq!(config.node_count, 2);
    }

    #[test]
    fn test_load_config_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let json_path = dir.path().join("config.json");
        std::fs::write(&json_path, r#"{"node_count": 2}"#).unwrap();
        let yaml_path = dir.path().join("config.yaml");
        std::fs::write(&yaml_path, "node_count: 5\n").unwrap();
        assert_eq!(load_config(&json_path).unwrap().get(&NODE_COUNT), 2);
        assert_eq!(load_config(&yaml_path).unwrap().get(&NODE_COUNT), 5);
        assert!(matches!(
            load_config(&dir.path().join("missing.yaml")),
            Err(ModelError::IoError(_))
        ));
    }

    #[test]
    fn test_build_simulation_wiring() {
        let config = config_from_yaml("node_count: 3\nseed: 42\n");
        let sim = build_simulation(&config).unwrap();

        // Channel, mobility driver, coordinator and three peripherals
        assert_eq!(sim.entities.len(), 6);
        assert_eq!(sim.node_infos.len(), 4);
        assert_eq!(sim.node_infos[0].node_id, NodeId::COORDINATOR);
        assert_eq!(sim.node_infos[0].body_position, BodyPosition::Body);
        assert_eq!(sim.node_infos[1].body_position, BodyPosition::LeftElbow);
        assert_eq!(sim.node_infos[3].body_position, BodyPosition::RightElbow);
        assert_eq!(sim.tracers.len(), 4);
        assert!(sim.mobility.read().mobility(NodeId(2)).is_some());

        // One start timer per node plus the first mobility toggle
        assert_eq!(sim.initial_events.len(), 5);
        let toggle = sim
            .initial_events
            .iter()
            .find(|e| e.targets == vec![EntityId(2)])
            .unwrap();
        assert_eq!(toggle.time, SimTime::from_micros(499_999));
        let beacon = sim
            .initial_events
            .iter()
            .find(|e| e.targets == vec![EntityId(3)])
            .unwrap();
        assert_eq!(beacon.time, SimTime::ZERO);
        assert!(matches!(beacon.payload, EventPayload::Timer { .. }));
        let data_starts = sim
            .initial_events
            .iter()
            .filter(|e| e.time == SimTime::from_micros(200))
            .count();
        assert_eq!(data_starts, 3);
    }

    #[test]
    fn test_event_ids_unique_after_build() {
        let config = config_from_yaml("node_count: 2\n");
        let mut sim = build_simulation(&config).unwrap();
        let mut ids: Vec<u64> = sim.initial_events.iter().map(|e| e.id.0).collect();
        ids.push(sim.context.next_event_id());
        let count = ids.len();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), count);
    }

    #[test]
    fn test_trainer_disabled_is_round_robin() {
        let config = config_from_yaml("node_count: 3\ntime_slots: 4\nuse_q_learning: false\n");
        let sim = build_simulation(&config).unwrap();
        let slots = sim
            .allocator
            .lock()
            .get_time_slots(bansim_mobility::MovementPhase::Phase0, SimTime::ZERO);
        assert_eq!(
            slots,
            vec![Some(NodeId(0)), Some(NodeId(1)), Some(NodeId(2)), Some(NodeId(0))]
        );
        assert!(sim.allocator.lock().report().is_none());
    }
}
