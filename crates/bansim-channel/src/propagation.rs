//! Propagation loss and delay models.

use bansim_mobility::MobilityModel;
use tracing::warn;

/// Propagation speed of light in vacuum (m/s).
pub const SPEED_OF_LIGHT: f64 = 299_792_458.0;

/// Path loss between two mobility models.
pub trait LossModel: Send + Sync {
    /// Path loss in dB from `sender` to `receiver`.
    fn calculate_path_loss(&self, sender: &MobilityModel, receiver: &MobilityModel) -> f64;

    /// Received power in dBm under free-space (Friis) propagation.
    ///
    /// Returns `None` when the model has no carrier frequency.
    fn calculate_rx_power_friis(&self, tx_power_dbm: f64, a: &MobilityModel, b: &MobilityModel) -> Option<f64>;
}

/// Propagation delay between two mobility models.
pub trait DelayModel: Send + Sync {
    /// Delay in seconds from `sender` to `receiver`.
    fn get_delay(&self, sender: &MobilityModel, receiver: &MobilityModel) -> f64;
}

/// BAN log-distance loss model with a fixed NLOS shadowing penalty.
///
/// `PL(d) = 15.5 log10(d_mm) + 5.38 + 5.35`, plus 9.05 dB when the receiver is
/// out of line of sight (Dolmans and Fort, IEEE 802.15-08-0418-01-0006).
#[derive(Debug, Clone, PartialEq)]
pub struct PropLossModel {
    frequency_hz: Option<f64>,
    lambda: Option<f64>,
    min_loss_db: f64,
    system_loss: f64,
}

impl PropLossModel {
    /// Slope of the log-distance term.
    pub const A: f64 = 15.5;
    /// Offset.
    pub const B: f64 = 5.38;
    /// Mean of the log-normal term.
    pub const SIGMA_N: f64 = 5.35;
    /// Shadowing penalty applied out of line of sight.
    pub const SHADOWING_DB: f64 = 9.05;

    /// Model without a carrier frequency.
    pub fn new() -> Self {
        PropLossModel {
            frequency_hz: None,
            lambda: None,
            min_loss_db: 0.0,
            system_loss: 1.0,
        }
    }

    /// Set the carrier frequency used by the Friis fallback.
    pub fn with_frequency(mut self, frequency_hz: f64) -> Self {
        self.set_frequency(frequency_hz);
        self
    }

    /// Set the carrier frequency used by the Friis fallback.
    pub fn set_frequency(&mut self, frequency_hz: f64) {
        self.frequency_hz = Some(frequency_hz);
        self.lambda = Some(SPEED_OF_LIGHT / frequency_hz);
    }

    /// Carrier frequency, if set.
    pub fn frequency_hz(&self) -> Option<f64> {
        self.frequency_hz
    }

    /// Path loss in dB for a distance in meters.
    pub fn path_loss_at(distance_m: f64, is_los: bool) -> f64 {
        // log10 is undefined at zero; co-located nodes are treated as 1 mm apart
        let distance_mm = (distance_m * 1000.0).max(1.0);
        let mut path_loss_db = Self::A * distance_mm.log10() + Self::B + Self::SIGMA_N;
        if !is_los {
            path_loss_db += Self::SHADOWING_DB;
        }
        path_loss_db
    }
}

impl Default for PropLossModel {
    fn default() -> Self {
        Self::new()
    }
}

impl LossModel for PropLossModel {
    fn calculate_path_loss(&self, sender: &MobilityModel, receiver: &MobilityModel) -> f64 {
        let receiver_pos = receiver.get_position();
        let distance = sender.get_distance_from(&receiver_pos);
        Self::path_loss_at(distance, sender.is_los(&receiver_pos))
    }

    fn calculate_rx_power_friis(&self, tx_power_dbm: f64, a: &MobilityModel, b: &MobilityModel) -> Option<f64> {
        let lambda = self.lambda?;
        let distance = a.get_distance_from(&b.get_position());

        if distance < 3.0 * lambda {
            warn!(
                "PropLossModel: distance {:.3} m not within the far field region, propagation loss is inaccurate",
                distance
            );
        }
        if distance <= 0.0 {
            return Some(tx_power_dbm - self.min_loss_db);
        }

        let numerator = lambda * lambda;
        let denominator = 16.0 * std::f64::consts::PI * std::f64::consts::PI * distance * distance * self.system_loss;
        let loss_db = -10.0 * (numerator / denominator).log10();
        Some(tx_power_dbm - loss_db.max(self.min_loss_db))
    }
}

/// Constant-speed propagation delay.
#[derive(Debug, Clone, PartialEq)]
pub struct PropDelayModel {
    speed: f64,
}

impl PropDelayModel {
    /// Delay model at the speed of light.
    pub fn new() -> Self {
        PropDelayModel { speed: SPEED_OF_LIGHT }
    }
}

impl Default for PropDelayModel {
    fn default() -> Self {
        Self::new()
    }
}

impl DelayModel for PropDelayModel {
    fn get_delay(&self, sender: &MobilityModel, receiver: &MobilityModel) -> f64 {
        sender.get_distance_from(&receiver.get_position()) / self.speed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bansim_common::Vector3;
    use bansim_mobility::BodyPosition;

    fn model_at(x: f64, z: f64) -> MobilityModel {
        let mut m = MobilityModel::new(BodyPosition::Body);
        m.set_position(Vector3::new(x, 1.0, z));
        m
    }

    #[test]
    fn test_path_loss_monotonic_in_distance() {
        let mut last = f64::NEG_INFINITY;
        for step in 1..50 {
            let loss = PropLossModel::path_loss_at(step as f64 * 0.05, true);
            assert!(loss > last, "loss did not increase at step {}", step);
            last = loss;
        }
    }

    #[test]
    fn test_nlos_adds_shadowing() {
        for d in [0.1, 0.5, 1.0, 2.0] {
            let los = PropLossModel::path_loss_at(d, true);
            let nlos = PropLossModel::path_loss_at(d, false);
            assert!((nlos - los - PropLossModel::SHADOWING_DB).abs() < 1e-9);
        }
    }

    #[test]
    fn test_path_loss_value_at_one_meter() {
        // 15.5 * log10(1000) + 10.73
        let loss = PropLossModel::path_loss_at(1.0, true);
        assert!((loss - 57.23).abs() < 1e-9);
    }

    #[test]
    fn test_calculate_path_loss_uses_los() {
        let model = PropLossModel::new();
        let front = model_at(0.0, 1.2);
        let front_far = model_at(0.5, 1.2);
        let back_far = model_at(0.5, 0.8);
        let los = model.calculate_path_loss(&front, &front_far);
        let nlos = model.calculate_path_loss(&front, &back_far);
        assert!(nlos >= los);
    }

    #[test]
    fn test_friis_requires_frequency() {
        let a = model_at(0.0, 1.2);
        let b = model_at(1.0, 1.2);
        assert!(PropLossModel::new().calculate_rx_power_friis(0.0, &a, &b).is_none());

        let model = PropLossModel::new().with_frequency(2.4e9);
        let rx = model.calculate_rx_power_friis(0.0, &a, &b).unwrap();
        // Free space loss at 1 m, 2.4 GHz is about 40 dB
        assert!((rx + 40.05).abs() < 0.1, "rx = {}", rx);
        assert_eq!(model.calculate_rx_power_friis(3.0, &a, &a), Some(3.0));
    }

    #[test]
    fn test_delay_is_distance_over_c() {
        let a = model_at(0.0, 1.2);
        let b = model_at(SPEED_OF_LIGHT * 1e-9, 1.2);
        let delay = PropDelayModel::new().get_delay(&a, &b);
        assert!((delay - 1e-9).abs() < 1e-15);
    }
}
