//! Physical layer: transceiver state machine, air time and clear channel
//! assessment.

use bansim_common::{
    timer_id, AntennaModel, EntityId, EventPayload, NodeId, Packet, SimContext, SimTime,
    TransmitAirEvent,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::{TIMER_PHY_END_CCA, TIMER_PHY_END_RX, TIMER_PHY_END_TX};

/// Symbols per turnaround, also used as microseconds in the MAC guard term.
pub const A_TURNAROUND_TIME: u32 = 12;

/// Symbols a clear channel assessment listens for.
pub const CCA_DURATION_SYMBOLS: f64 = 8.0;

/// Largest accepted transmit power attribute value.
pub const MAX_TX_POWER: f64 = 191.0;

/// Margin above sensitivity that makes the energy detector report busy (dB).
pub const CCA_ENERGY_THRESHOLD_DB: f64 = 10.0;

// ============================================================================
// Enumerations
// ============================================================================

/// Transceiver state, also used as the status of PHY confirms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PhyState {
    Busy,
    BusyRx,
    BusyTx,
    ForceTrxOff,
    Idle,
    InvalidParameter,
    RxOn,
    Success,
    TrxOff,
    TxOn,
    Unsupported,
    ReadOnly,
    UnsupportedAttribute,
    Unspecified,
}

impl PhyState {
    fn is_busy(self) -> bool {
        matches!(self, PhyState::Busy | PhyState::BusyRx | PhyState::BusyTx)
    }
}

/// Band and modulation combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PhyOption {
    Bpsk868,
    Bpsk915,
    Ask868,
    Ask915,
    Oqpsk868,
    #[default]
    Oqpsk915,
    Oqpsk2400,
}

/// Rates and synchronization header layout of one [`PhyOption`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhyOptionParams {
    /// Bit rate in kbit/s.
    pub bit_rate_kbps: f64,
    /// Symbol rate in ksymbol/s.
    pub symbol_rate_ksps: f64,
    /// Preamble length in symbols.
    pub preamble_symbols: f64,
    /// Start of frame delimiter length in symbols.
    pub sfd_symbols: f64,
    /// PHY header length in symbols.
    pub phr_symbols: f64,
}

impl PhyOption {
    /// Rate and header table entry.
    pub const fn params(self) -> PhyOptionParams {
        let (bit, sym, pre, sfd, phr) = match self {
            PhyOption::Bpsk868 => (20.0, 20.0, 32.0, 8.0, 8.0),
            PhyOption::Bpsk915 => (40.0, 40.0, 32.0, 8.0, 8.0),
            PhyOption::Ask868 => (250.0, 12.5, 2.0, 1.0, 0.4),
            PhyOption::Ask915 => (250.0, 50.0, 6.0, 1.0, 1.6),
            PhyOption::Oqpsk868 => (100.0, 25.0, 8.0, 2.0, 2.0),
            PhyOption::Oqpsk915 => (250.0, 62.5, 8.0, 2.0, 2.0),
            PhyOption::Oqpsk2400 => (250.0, 62.5, 8.0, 2.0, 2.0),
        };
        PhyOptionParams {
            bit_rate_kbps: bit,
            symbol_rate_ksps: sym,
            preamble_symbols: pre,
            sfd_symbols: sfd,
            phr_symbols: phr,
        }
    }
}

/// PHY information base attribute with the value to set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PibAttribute {
    CurrentChannel(u32),
    ChannelsSupported(u32),
    TransmitPower(f64),
    CcaMode(u8),
    CurrentPage(u32),
}

// ============================================================================
// Configuration
// ============================================================================

/// Static PHY parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhyConfig {
    /// Band and modulation.
    pub option: PhyOption,
    /// Lowest received power that can be decoded (dBm).
    pub rx_sensitivity_dbm: f64,
    /// Noise term added to every received power (dB).
    pub noise_db: f64,
}

impl Default for PhyConfig {
    fn default() -> Self {
        PhyConfig {
            option: PhyOption::default(),
            rx_sensitivity_dbm: -82.0,
            noise_db: -10.0,
        }
    }
}

/// Outcome of [`Phy::pd_data_request`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PdDataOutcome {
    /// On the air; `pd_data_confirm(SUCCESS)` follows when the end timer fires.
    Started {
        /// Declared transmit power.
        tx_power_dbm: f64,
    },
    /// Not in TX_ON; the current state is the confirm status.
    Rejected(PhyState),
    /// Dropped without a confirm.
    Ignored,
}

#[derive(Debug, Clone)]
struct Reception {
    token: u32,
    packet: Packet,
}

// ============================================================================
// PHY
// ============================================================================

/// One node's physical layer.
///
/// Confirms are returned to the caller instead of being called back; the MAC
/// owns the PHY and feeds the returned status into its own handlers.
#[derive(Debug)]
pub struct Phy {
    node: NodeId,
    entity: EntityId,
    channel: EntityId,
    config: PhyConfig,
    state: PhyState,
    tx_power_dbm: f64,
    cca_mode: u8,
    tx_packet: Option<Packet>,
    rx: Option<Reception>,
    next_rx_token: u32,
    cca_peak_dbm: f64,
    cca_pending: bool,
}

impl Phy {
    /// Create a PHY for the node hosted by `entity`, attached to `channel`.
    pub fn new(node: NodeId, entity: EntityId, channel: EntityId, config: PhyConfig) -> Self {
        Phy {
            node,
            entity,
            channel,
            config,
            state: PhyState::TrxOff,
            tx_power_dbm: 0.0,
            cca_mode: 1,
            tx_packet: None,
            rx: None,
            next_rx_token: 0,
            cca_peak_dbm: f64::NEG_INFINITY,
            cca_pending: false,
        }
    }

    /// Current transceiver state.
    pub fn state(&self) -> PhyState {
        self.state
    }

    /// Static parameters.
    pub fn config(&self) -> &PhyConfig {
        &self.config
    }

    /// Declared transmit power.
    pub fn tx_power_dbm(&self) -> f64 {
        self.tx_power_dbm
    }

    /// Symbols per second.
    pub fn symbol_rate(&self) -> f64 {
        self.config.option.params().symbol_rate_ksps * 1000.0
    }

    /// Bits per second.
    pub fn bit_rate(&self) -> f64 {
        self.config.option.params().bit_rate_kbps * 1000.0
    }

    /// Synchronization header length in symbols.
    pub fn shr_duration(&self) -> f64 {
        let p = self.config.option.params();
        p.preamble_symbols + p.sfd_symbols
    }

    /// Symbols needed to carry one octet.
    pub fn symbols_per_octet(&self) -> f64 {
        self.symbol_rate() / (self.bit_rate() / 8.0)
    }

    /// Header air time in seconds.
    pub fn get_ppdu_header_tx_time(&self) -> f64 {
        let p = self.config.option.params();
        (p.preamble_symbols + p.sfd_symbols + p.phr_symbols) / self.symbol_rate()
    }

    /// Air time in seconds of a frame of `size` bytes.
    pub fn calc_tx_time(&self, size: usize) -> f64 {
        self.get_ppdu_header_tx_time() + (size * 8) as f64 / self.bit_rate()
    }

    /// Air time of a frame of `size` bytes.
    pub fn tx_duration(&self, size: usize) -> SimTime {
        SimTime::from_secs(self.calc_tx_time(size))
    }

    fn change_state(&mut self, new_state: PhyState) {
        trace!("Phy[{}]: {:?} -> {:?}", self.node, self.state, new_state);
        self.state = new_state;
    }

    fn discard_reception(&mut self) {
        if let Some(rx) = self.rx.take() {
            debug!(
                "Phy[{}]: reception from {} discarded by state change",
                self.node,
                rx.packet.header().sender_id
            );
        }
    }

    /// Set a PHY information base attribute.
    pub fn set_attribute_request(&mut self, attribute: PibAttribute) -> PhyState {
        match attribute {
            PibAttribute::TransmitPower(dbm) => {
                if dbm > MAX_TX_POWER {
                    return PhyState::InvalidParameter;
                }
                self.tx_power_dbm = dbm;
                PhyState::Success
            }
            PibAttribute::CcaMode(mode) => {
                if !(1..=3).contains(&mode) {
                    return PhyState::InvalidParameter;
                }
                self.cca_mode = mode;
                PhyState::Success
            }
            PibAttribute::CurrentChannel(_) | PibAttribute::ChannelsSupported(_) => {
                PhyState::UnsupportedAttribute
            }
            PibAttribute::CurrentPage(_) => PhyState::Unsupported,
        }
    }

    /// Request a transceiver state. Returns the confirm status, if any.
    pub fn set_trx_state_request(&mut self, new_state: PhyState) -> Option<PhyState> {
        if new_state == self.state {
            return Some(new_state);
        }
        match (self.state, new_state) {
            (PhyState::BusyTx, PhyState::RxOn | PhyState::TrxOff) => {
                self.tx_packet = None;
                self.change_state(new_state);
                Some(new_state)
            }
            (PhyState::BusyRx | PhyState::RxOn | PhyState::TxOn, PhyState::TrxOff) => {
                self.discard_reception();
                self.change_state(PhyState::TrxOff);
                Some(PhyState::TrxOff)
            }
            (PhyState::BusyRx | PhyState::RxOn | PhyState::TrxOff, PhyState::TxOn) => {
                self.discard_reception();
                self.change_state(PhyState::TxOn);
                Some(PhyState::TxOn)
            }
            (PhyState::BusyTx, PhyState::TxOn) => Some(PhyState::TxOn),
            (PhyState::TxOn | PhyState::TrxOff, PhyState::RxOn) => {
                self.change_state(PhyState::RxOn);
                Some(PhyState::RxOn)
            }
            // The reception in progress completes first
            (PhyState::BusyRx, PhyState::RxOn) => Some(PhyState::RxOn),
            _ => None,
        }
    }

    /// Put `packet` on the air.
    pub fn pd_data_request(&mut self, mut packet: Packet, ctx: &mut SimContext) -> PdDataOutcome {
        match self.state {
            PhyState::TxOn => {
                self.change_state(PhyState::BusyTx);
                let duration = self.tx_duration(packet.size);
                packet.spectrum.duration = duration;
                packet.spectrum.tx_power_dbm = self.tx_power_dbm;
                packet.spectrum.tx_phy = Some(self.entity);
                packet.spectrum.tx_antenna = AntennaModel::Isotropic;
                debug!(
                    "Phy[{}]: transmitting {} to {} ({} bytes, {})",
                    self.node,
                    packet.header().frame_subtype(),
                    packet.header().recipient_id,
                    packet.size,
                    duration
                );

                self.tx_packet = Some(packet.clone());
                ctx.post_event(
                    duration,
                    vec![self.channel],
                    EventPayload::TransmitAir(TransmitAirEvent {
                        phy_id: self.entity,
                        packet,
                    }),
                );
                ctx.post_event(
                    duration,
                    vec![self.entity],
                    EventPayload::Timer {
                        timer_id: timer_id(TIMER_PHY_END_TX, 0),
                    },
                );
                PdDataOutcome::Started {
                    tx_power_dbm: self.tx_power_dbm,
                }
            }
            PhyState::RxOn | PhyState::TrxOff | PhyState::BusyTx => {
                warn!(
                    "Phy[{}]: transmission requested in {:?}, frame not sent",
                    self.node, self.state
                );
                PdDataOutcome::Rejected(self.state)
            }
            _ => PdDataOutcome::Ignored,
        }
    }

    /// The transmission left the air. Returns the confirm status.
    pub fn end_tx(&mut self) -> PhyState {
        self.tx_packet = None;
        PhyState::Success
    }

    /// A frame starts arriving.
    pub fn start_rx(&mut self, mut packet: Packet, ctx: &mut SimContext) {
        let rx_power_dbm = packet.spectrum.tx_power_dbm + self.config.noise_db;
        self.cca_peak_dbm = self.cca_peak_dbm.max(rx_power_dbm);

        match self.state {
            PhyState::RxOn => {
                self.change_state(PhyState::BusyRx);
                packet.success = rx_power_dbm >= self.config.rx_sensitivity_dbm;
                if !packet.success {
                    warn!(
                        "Phy[{}]: frame from {} dropped, rx power {:.2} dBm below sensitivity {:.2} dBm",
                        self.node,
                        packet.header().sender_id,
                        rx_power_dbm,
                        self.config.rx_sensitivity_dbm
                    );
                }
                let token = self.next_rx_token;
                self.next_rx_token = self.next_rx_token.wrapping_add(1);
                let duration = self.tx_duration(packet.size);
                self.rx = Some(Reception { token, packet });
                ctx.post_event(
                    duration,
                    vec![self.entity],
                    EventPayload::Timer {
                        timer_id: timer_id(TIMER_PHY_END_RX, token),
                    },
                );
            }
            PhyState::BusyRx => {
                if let Some(rx) = self.rx.as_mut() {
                    rx.packet.success = false;
                }
                warn!(
                    "Phy[{}]: frame from {} dropped, collision with reception in progress",
                    self.node,
                    packet.header().sender_id
                );
            }
            state => {
                warn!(
                    "Phy[{}]: frame from {} dropped, transceiver in {:?}",
                    self.node,
                    packet.header().sender_id,
                    state
                );
            }
        }
    }

    /// The reception with `token` finished. Returns the frame if it decoded.
    pub fn end_rx(&mut self, token: u32) -> Option<Packet> {
        match self.rx.as_ref() {
            Some(rx) if rx.token == token => {}
            _ => return None,
        }
        let rx = self.rx.take()?;
        if self.state == PhyState::BusyRx {
            self.change_state(PhyState::RxOn);
        }
        if rx.packet.success {
            Some(rx.packet)
        } else {
            None
        }
    }

    /// Start a clear channel assessment. Returns an immediate confirm when
    /// the receiver is not listening.
    pub fn plme_cca_request(&mut self, ctx: &mut SimContext) -> Option<PhyState> {
        match self.state {
            PhyState::RxOn | PhyState::BusyRx => {
                self.cca_peak_dbm = f64::NEG_INFINITY;
                self.cca_pending = true;
                let delay = SimTime::from_secs(CCA_DURATION_SYMBOLS / self.symbol_rate());
                ctx.post_event(
                    delay,
                    vec![self.entity],
                    EventPayload::Timer {
                        timer_id: timer_id(TIMER_PHY_END_CCA, 0),
                    },
                );
                None
            }
            PhyState::TrxOff => Some(PhyState::TrxOff),
            _ => Some(PhyState::Busy),
        }
    }

    /// Finish the assessment. Returns IDLE or BUSY.
    pub fn end_cca(&mut self) -> Option<PhyState> {
        if !self.cca_pending {
            return None;
        }
        self.cca_pending = false;
        if self.state.is_busy() {
            return Some(PhyState::Busy);
        }
        let energy = self.cca_peak_dbm - self.config.rx_sensitivity_dbm >= CCA_ENERGY_THRESHOLD_DB;
        let carrier = self.state == PhyState::BusyRx;
        let busy = match self.cca_mode {
            1 => energy,
            2 => carrier,
            _ => energy && carrier,
        };
        Some(if busy { PhyState::Busy } else { PhyState::Idle })
    }
}
