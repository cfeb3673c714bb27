//! # bansim-rl
//!
//! Q-learning slot allocation for the BAN coordinator.
//!
//! [`QLearningTrainer`] implements [`SlotAllocator`]. The state is a movement
//! phase and a slot index; each action hands the slot to one node, or leaves
//! it unallocated when that action is enabled. After every beacon period the
//! coordinator feeds back the node it placed in each slot, and the trainer
//! rewards the allocation with that node's windowed throughput weighted by
//! its priority.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use bansim_common::{NodeId, SimTime};
use bansim_device::{SlotAllocator, TracerHandle};
use bansim_mobility::{MovementPhase, SharedMobility};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

// ============================================================================
// Configuration
// ============================================================================

/// Trainer parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QLearningConfig {
    /// Slots in every schedule.
    pub time_slots: usize,
    /// Step size of the Q update.
    pub learning_rate: f64,
    /// Weight of the next slot's best value.
    pub discount_factor: f64,
    /// Probability of picking a random action.
    pub exploration_rate: f64,
    /// Offer "leave the slot empty" as an action.
    pub use_unallocated: bool,
    /// When false, every schedule is round-robin and nothing is learned.
    pub use_q_learning: bool,
    /// Added to the node index to form its priority.
    pub priority_weight: f64,
    /// Seed of the exploration stream.
    pub seed: u64,
}

impl Default for QLearningConfig {
    fn default() -> Self {
        QLearningConfig {
            time_slots: 8,
            learning_rate: 0.5,
            discount_factor: 0.9,
            exploration_rate: 0.5,
            use_unallocated: false,
            use_q_learning: true,
            priority_weight: 0.1,
            seed: 0,
        }
    }
}

// ============================================================================
// Q-table
// ============================================================================

/// Q-table key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct State {
    pub phase: MovementPhase,
    pub slot: usize,
}

impl State {
    pub fn new(phase: MovementPhase, slot: usize) -> Self {
        State { phase, slot }
    }

    /// The following slot in the same phase.
    pub fn next(self) -> Self {
        State {
            phase: self.phase,
            slot: self.slot + 1,
        }
    }
}

/// Index of the largest value, lowest index on ties.
fn argmax(values: &[f64]) -> usize {
    let mut best = 0;
    for (i, v) in values.iter().enumerate() {
        if *v > values[best] {
            best = i;
        }
    }
    best
}

// ============================================================================
// Trainer
// ============================================================================

/// Epsilon-greedy Q-learning slot allocator.
pub struct QLearningTrainer {
    config: QLearningConfig,
    tracers: Vec<TracerHandle>,
    priorities: Vec<f64>,
    mobility: SharedMobility,
    q_table: BTreeMap<State, Vec<f64>>,
    rng: ChaCha8Rng,
}

impl QLearningTrainer {
    /// Create a trainer for the nodes whose tracers are given, in node order.
    pub fn new(config: QLearningConfig, tracers: Vec<TracerHandle>, mobility: SharedMobility) -> Self {
        let priorities = (0..tracers.len())
            .map(|i| i as f64 + config.priority_weight)
            .collect();
        let rng = ChaCha8Rng::seed_from_u64(config.seed);
        QLearningTrainer {
            config,
            tracers,
            priorities,
            mobility,
            q_table: BTreeMap::new(),
            rng,
        }
    }

    pub fn config(&self) -> &QLearningConfig {
        &self.config
    }

    pub fn node_count(&self) -> usize {
        self.tracers.len()
    }

    /// Number of actions per state.
    pub fn action_count(&self) -> usize {
        self.node_count() + usize::from(self.config.use_unallocated)
    }

    /// Priority of `node`.
    pub fn priority(&self, node: NodeId) -> Option<f64> {
        self.priorities.get(node.0 as usize).copied()
    }

    /// Learned values of `state`, if it was ever visited.
    pub fn q_values(&self, state: State) -> Option<&[f64]> {
        self.q_table.get(&state).map(Vec::as_slice)
    }

    fn row(&mut self, state: State) -> &mut Vec<f64> {
        let actions = self.action_count();
        self.q_table.entry(state).or_insert_with(|| vec![0.0; actions])
    }

    fn action_to_node(&self, action: usize) -> Option<NodeId> {
        if self.config.use_unallocated {
            action.checked_sub(1).map(|i| NodeId(i as u32))
        } else {
            Some(NodeId(action as u32))
        }
    }

    fn node_to_action(&self, node: Option<NodeId>) -> Option<usize> {
        match (node, self.config.use_unallocated) {
            (None, true) => Some(0),
            (None, false) => None,
            (Some(node), unallocated) => {
                let index = node.0 as usize;
                (index < self.node_count()).then_some(index + usize::from(unallocated))
            }
        }
    }

    /// Pick an action for `state`: random with the exploration probability,
    /// greedy otherwise.
    pub fn choose_action(&mut self, state: State) -> usize {
        let actions = self.action_count();
        let explore = self.rng.gen::<f64>() < self.config.exploration_rate;
        let action = if explore {
            self.rng.gen_range(0..actions)
        } else {
            argmax(self.row(state))
        };
        trace!(
            "QLearning: {} slot {} -> action {} ({})",
            state.phase,
            state.slot,
            action,
            if explore { "explore" } else { "exploit" }
        );
        action
    }

    /// Slot `i` goes to node `i mod node_count`.
    pub fn round_robin(&self) -> Vec<Option<NodeId>> {
        let nodes = self.node_count();
        (0..self.config.time_slots)
            .map(|i| (nodes > 0).then(|| NodeId((i % nodes) as u32)))
            .collect()
    }

    /// Reward for having given a slot to `node`.
    pub fn calculate_reward(&self, node: Option<NodeId>, now: SimTime) -> f64 {
        let Some(node) = node else {
            return 0.0;
        };
        let Some(tracer) = self.tracers.get(node.0 as usize) else {
            return 0.0;
        };
        let throughput = tracer.lock().get_throughput(now, false);
        if throughput <= 0.0 {
            return -1.0;
        }
        throughput * self.priority(node).unwrap_or(0.0)
    }

    fn update_q_table(&mut self, state: State, action: usize, reward: f64) {
        let next = self.row(state.next()).clone();
        let best_next = next[argmax(&next)];
        let lr = self.config.learning_rate;
        let discount = self.config.discount_factor;
        let row = self.row(state);
        row[action] += lr * (reward + discount * best_next - row[action]);
        debug!(
            "QLearning: updated {} slot {} action {}, reward {:.3}, value now {:.3}",
            state.phase, state.slot, action, reward, row[action]
        );
    }
}

impl SlotAllocator for QLearningTrainer {
    fn get_time_slots(&mut self, phase: MovementPhase, now: SimTime) -> Vec<Option<NodeId>> {
        for tracer in &self.tracers {
            tracer.lock().reset(now);
        }
        if !self.config.use_q_learning || self.action_count() == 0 {
            return self.round_robin();
        }

        let mut state = State::new(phase, 0);
        let mut slots = Vec::with_capacity(self.config.time_slots);
        for _ in 0..self.config.time_slots {
            let action = self.choose_action(state);
            slots.push(self.action_to_node(action));
            state = state.next();
        }

        if slots.iter().all(Option::is_none) {
            debug!("QLearning: every slot unallocated, falling back to round-robin");
            return self.round_robin();
        }
        slots
    }

    fn train(&mut self, slot: usize, node: Option<NodeId>, phase: MovementPhase, now: SimTime) {
        if !self.config.use_q_learning {
            return;
        }
        let Some(action) = self.node_to_action(node) else {
            trace!("QLearning: slot {} has no action to reinforce", slot);
            return;
        };
        let reward = self.calculate_reward(node, now);
        self.update_q_table(State::new(phase, slot), action, reward);
    }

    fn detect_movement_phase(&self) -> MovementPhase {
        self.mobility.read().current_phase()
    }

    fn report(&self) -> Option<String> {
        if !self.config.use_q_learning {
            return None;
        }
        let mut out = String::from("Q_TABLE\n[MOVEMENT_PHASE\tTIME_SLOT_INDEX]");
        if self.config.use_unallocated {
            out.push_str("\tACTION_UNALLOC");
        }
        for i in 0..self.node_count() {
            let _ = write!(out, "\tACTION_{}", i);
        }
        out.push('\n');
        for (state, values) in &self.q_table {
            let _ = write!(out, "{}\tSLOT_{}", state.phase, state.slot);
            for v in values {
                let _ = write!(out, "\t{:.3}", v);
            }
            out.push('\n');
        }
        info!("QLearning: {} states learned", self.q_table.len());
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bansim_device::Tracer;
    use bansim_mobility::MobilityHelper;

    fn trainer(nodes: usize, config: QLearningConfig) -> (QLearningTrainer, Vec<TracerHandle>) {
        let tracers: Vec<TracerHandle> = (0..nodes).map(|_| Tracer::shared(1.0)).collect();
        let trainer = QLearningTrainer::new(
            QLearningConfig { seed: 42, ..config },
            tracers.clone(),
            MobilityHelper::new().into_shared(),
        );
        (trainer, tracers)
    }

    fn greedy() -> QLearningConfig {
        QLearningConfig {
            exploration_rate: 0.0,
            ..QLearningConfig::default()
        }
    }

    #[test]
    fn test_disabled_trainer_is_round_robin() {
        let (mut t, _) = trainer(
            3,
            QLearningConfig {
                use_q_learning: false,
                ..QLearningConfig::default()
            },
        );
        let expected: Vec<Option<NodeId>> = [0, 1, 2, 0, 1, 2, 0, 1].iter().map(|&i| Some(NodeId(i))).collect();
        assert_eq!(t.get_time_slots(MovementPhase::Phase0, SimTime::ZERO), expected);

        t.train(0, Some(NodeId(0)), MovementPhase::Phase0, SimTime::from_millis(500));
        assert!(t.q_values(State::new(MovementPhase::Phase0, 0)).is_none());
        assert!(t.report().is_none());
    }

    #[test]
    fn test_greedy_ties_pick_lowest_index() {
        let (mut t, _) = trainer(3, greedy());
        let slots = t.get_time_slots(MovementPhase::Phase0, SimTime::ZERO);
        assert_eq!(slots, vec![Some(NodeId(0)); 8]);
    }

    #[test]
    fn test_all_unallocated_falls_back_to_round_robin() {
        let (mut t, _) = trainer(
            2,
            QLearningConfig {
                use_unallocated: true,
                ..greedy()
            },
        );
        assert_eq!(t.action_count(), 3);
        let slots = t.get_time_slots(MovementPhase::Phase1, SimTime::ZERO);
        assert_eq!(slots, t.round_robin());
    }

    #[test]
    fn test_idle_node_is_penalised() {
        let (mut t, _) = trainer(3, greedy());
        t.get_time_slots(MovementPhase::Phase0, SimTime::ZERO);
        t.train(0, Some(NodeId(0)), MovementPhase::Phase0, SimTime::from_millis(500));

        let q = t.q_values(State::new(MovementPhase::Phase0, 0)).unwrap();
        assert!((q[0] + 0.5).abs() < 1e-12);
        // Node 0 lost its tie
        let slots = t.get_time_slots(MovementPhase::Phase0, SimTime::from_millis(500));
        assert_eq!(slots[0], Some(NodeId(1)));
        assert_eq!(slots[1], Some(NodeId(0)));
    }

    #[test]
    fn test_throughput_reward_weighted_by_priority() {
        let (mut t, tracers) = trainer(3, greedy());
        t.get_time_slots(MovementPhase::Phase0, SimTime::ZERO);
        tracers[1].lock().add_success_tx_packet(10);

        // 80 bits over 0.5 s at priority 1.1
        let now = SimTime::from_millis(500);
        assert!((t.calculate_reward(Some(NodeId(1)), now) - 176.0).abs() < 1e-9);
        t.train(2, Some(NodeId(1)), MovementPhase::Phase0, now);
        let q = t.q_values(State::new(MovementPhase::Phase0, 2)).unwrap();
        assert!((q[1] - 88.0).abs() < 1e-9);
    }

    #[test]
    fn test_unallocated_slot_earns_nothing() {
        let (mut t, _) = trainer(
            2,
            QLearningConfig {
                use_unallocated: true,
                ..greedy()
            },
        );
        assert_eq!(t.calculate_reward(None, SimTime::from_millis(500)), 0.0);
        t.train(1, None, MovementPhase::Phase0, SimTime::from_millis(500));
        assert_eq!(t.q_values(State::new(MovementPhase::Phase0, 1)), Some(&[0.0, 0.0, 0.0][..]));
    }

    #[test]
    fn test_schedule_resets_tracer_windows() {
        let (mut t, tracers) = trainer(2, greedy());
        tracers[0].lock().add_tx_packet(0.0);
        t.get_time_slots(MovementPhase::Phase0, SimTime::from_millis(500));
        assert_eq!(tracers[0].lock().tx_packet_count(), 0);
        assert_eq!(tracers[0].lock().get_enqueued_packet_count(), 1);
    }

    #[test]
    fn test_exploration_stays_in_action_space() {
        let (mut t, _) = trainer(
            4,
            QLearningConfig {
                exploration_rate: 1.0,
                ..QLearningConfig::default()
            },
        );
        for _ in 0..20 {
            for node in t.get_time_slots(MovementPhase::Phase0, SimTime::ZERO).into_iter().flatten() {
                assert!(node.0 < 4);
            }
        }
    }

    #[test]
    fn test_report_lists_visited_states() {
        let (mut t, _) = trainer(2, greedy());
        t.get_time_slots(MovementPhase::Phase0, SimTime::ZERO);
        let report = t.report().unwrap();
        assert!(report.starts_with("Q_TABLE"));
        assert!(report.contains("ACTION_1"));
        assert!(report.contains("PHASE_0\tSLOT_7"));
    }
}
