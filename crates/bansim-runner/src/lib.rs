//! # bansim-runner library
//!
//! Library interface for the BAN simulation runner.
//!
//! This module exposes the event loop and the statistics it produces so that
//! simulations can be run programmatically and from integration tests. The
//! `bansim` binary is a thin CLI over [`EventLoop`].

use std::collections::{BTreeMap, BinaryHeap};
use std::time::Instant;

use bansim_common::{EntityId, EntityRegistry, Event, EventId, EventPayload, NodeId, SimContext};
pub use bansim_common::SimTime;
use bansim_device::{SharedSlotAllocator, SlotAllocator, TracerHandle, TracerSummary};
use bansim_mobility::BodyPosition;
use bansim_model::{BuiltSimulation, NodeInfo};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during simulation.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Model error.
    #[error("Model error: {0}")]
    Model(#[from] bansim_model::ModelError),

    /// Simulation error.
    #[error("Simulation error: {0}")]
    Simulation(#[from] bansim_common::SimError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

// ============================================================================
// Duration Parsing
// ============================================================================

/// Parse a duration string with units into seconds.
///
/// Supported formats:
/// - Plain number: `60` (interpreted as seconds)
/// - With unit suffix: `500ms`, `60s`, `10m`, `2h`
/// - Combined units: `1h30m`, `1m30s`, `2s500ms`
pub fn parse_duration(s: &str) -> Result<f64, String> {
    let s = s.trim();

    // If it's just a number, treat as seconds
    if let Ok(secs) = s.parse::<f64>() {
        if secs < 0.0 || !secs.is_finite() {
            return Err(format!("Invalid duration: '{}'", s));
        }
        return Ok(secs);
    }

    let mut total_seconds: f64 = 0.0;
    let mut current_number = String::new();
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() || c == '.' {
            current_number.push(c);
            continue;
        }
        if current_number.is_empty() {
            return Err(format!("Invalid duration format: unexpected '{}' in '{}'", c, s));
        }
        let value: f64 = current_number
            .parse()
            .map_err(|_| format!("Invalid number '{}' in duration '{}'", current_number, s))?;

        let multiplier = match c {
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                0.001
            }
            's' => 1.0,
            'm' => 60.0,
            'h' => 3600.0,
            _ => return Err(format!("Unknown duration unit '{}' in '{}'. Use ms, s, m or h.", c, s)),
        };

        total_seconds += value * multiplier;
        current_number.clear();
    }

    // If there's a trailing number without unit, treat as seconds
    if !current_number.is_empty() {
        let value: f64 = current_number
            .parse()
            .map_err(|_| format!("Invalid number '{}' in duration '{}'", current_number, s))?;
        total_seconds += value;
    }

    if s.is_empty() {
        return Err("Empty duration".to_string());
    }

    Ok(total_seconds)
}

// ============================================================================
// Simulation Statistics
// ============================================================================

/// Final figures of one node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStats {
    pub name: String,
    pub node_id: NodeId,
    pub body_position: BodyPosition,
    #[serde(flatten)]
    pub summary: TracerSummary,
}

/// Statistics collected during simulation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SimulationStats {
    /// Total events processed.
    pub total_events: u64,
    /// Frames put on the air.
    pub transmissions: u64,
    /// Frame copies handed to receiving PHYs.
    pub receptions: u64,
    /// Acknowledged data frames over all peripherals.
    pub deliveries: u64,
    /// Final simulation time.
    pub simulation_time_us: u64,
    /// Wall clock time in milliseconds.
    pub wall_time_ms: u64,
    /// Per-node results, coordinator first.
    pub nodes: Vec<NodeStats>,
}

// ============================================================================
// Event Loop
// ============================================================================

/// The main simulation event loop.
pub struct EventLoop {
    event_queue: BinaryHeap<Event>,
    entities: EntityRegistry,
    context: SimContext,
    stats: SimulationStats,
    node_infos: Vec<NodeInfo>,
    tracers: BTreeMap<NodeId, TracerHandle>,
    allocator: SharedSlotAllocator,
}

impl EventLoop {
    /// Create an event loop that continues the context the simulation was built with.
    pub fn new(simulation: BuiltSimulation) -> Self {
        let BuiltSimulation {
            entities,
            initial_events,
            context,
            node_infos,
            tracers,
            allocator,
            ..
        } = simulation;

        let event_queue: BinaryHeap<Event> = initial_events.into_iter().collect();

        EventLoop {
            event_queue,
            entities,
            context,
            stats: SimulationStats::default(),
            node_infos,
            tracers,
            allocator,
        }
    }

    /// Run the simulation until `duration`.
    ///
    /// A handler error stops the run and is returned; the statistics gathered
    /// so far stay available through [`EventLoop::stats`].
    pub fn run(&mut self, duration: SimTime) -> Result<SimulationStats, RunnerError> {
        let start_time = Instant::now();

        // End-of-simulation event, after everything else at that instant
        self.event_queue.push(Event {
            id: EventId(u64::MAX),
            time: duration,
            source: EntityId::new(0),
            targets: vec![],
            payload: EventPayload::SimulationEnd,
        });

        while let Some(event) = self.event_queue.pop() {
            self.context.set_time(event.time);

            if matches!(event.payload, EventPayload::SimulationEnd) {
                self.log_allocator_report();
                break;
            }

            if let Err(e) = self.entities.dispatch_event(&event, &mut self.context) {
                error!("Stopping at {}: {}", event.time, e);
                self.finalize(start_time);
                return Err(e.into());
            }

            for new_event in self.context.take_pending_events() {
                self.event_queue.push(new_event);
            }

            self.stats.total_events += 1;
            self.update_stats(&event);
        }

        self.finalize(start_time);
        Ok(self.stats.clone())
    }

    fn update_stats(&mut self, event: &Event) {
        match &event.payload {
            EventPayload::TransmitAir(_) => self.stats.transmissions += 1,
            EventPayload::ReceiveAir(_) => self.stats.receptions += event.targets.len() as u64,
            _ => {}
        }
    }

    fn log_allocator_report(&self) {
        if let Some(report) = self.allocator.lock().report() {
            info!("Slot allocator state at {}:\n{}", self.context.time(), report);
        }
    }

    fn finalize(&mut self, start_time: Instant) {
        let now = self.context.time();
        self.stats.simulation_time_us = now.as_micros();
        self.stats.wall_time_ms = start_time.elapsed().as_millis() as u64;
        self.stats.nodes = self
            .node_infos
            .iter()
            .filter_map(|info| {
                self.tracers.get(&info.node_id).map(|tracer| NodeStats {
                    name: info.name.clone(),
                    node_id: info.node_id,
                    body_position: info.body_position,
                    summary: tracer.lock().summary(now),
                })
            })
            .collect();
        self.stats.deliveries = self
            .stats
            .nodes
            .iter()
            .filter(|n| n.node_id != NodeId::COORDINATOR)
            .map(|n| n.summary.success)
            .sum();
    }

    /// Statistics gathered so far.
    pub fn stats(&self) -> &SimulationStats {
        &self.stats
    }

    /// Current simulation time.
    pub fn current_time(&self) -> SimTime {
        self.context.time()
    }

    /// Information about each node.
    pub fn node_infos(&self) -> &[NodeInfo] {
        &self.node_infos
    }

    /// The coordinator's slot allocator.
    pub fn allocator(&self) -> &SharedSlotAllocator {
        &self.allocator
    }
}

/// Create a new event loop from a built simulation.
pub fn create_event_loop(simulation: BuiltSimulation) -> EventLoop {
    EventLoop::new(simulation)
}

// Re-export key types for convenience
pub use bansim_model::{
    build_simulation, load_config, load_config_from_json, load_config_from_yaml, BuiltSimulation as SimulationBuild,
    SimulationConfig,
};
