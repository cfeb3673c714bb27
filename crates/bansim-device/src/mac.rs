//! MAC layer: transmit queue, beacon-driven slot access, acknowledgements and
//! channel access.
//!
//! The MAC owns its PHY and CSMA/CA instance. Confirms from below are handled
//! synchronously; notifications for the SSCS are collected in an outbox that the
//! hosting node drains after every event.

use std::collections::VecDeque;

use bansim_common::{
    timer_id, EntityId, EventPayload, FrameBody, FrameSubtype, FrameType, MacHeader, NodeId,
    Packet, SimContext, SimError, SimTime, TxOption, TxParams,
};
use bansim_common::CancellableTimer;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::csma_ca::{CsmaCa, CsmaConfig, CsmaOutcome};
use crate::phy::{PdDataOutcome, Phy, PhyState, PibAttribute, A_TURNAROUND_TIME};
use crate::tracer::TracerHandle;
use crate::{
    TIMER_CSMA_BACKOFF, TIMER_CSMA_CAN_PROCEED, TIMER_CSMA_REQUEST_CCA, TIMER_MAC_ACK_TIMEOUT,
    TIMER_MAC_CHECK_QUEUE, TIMER_MAC_SEND_ACK, TIMER_MAC_START_TX, TIMER_PHY_END_CCA,
    TIMER_PHY_END_RX, TIMER_PHY_END_TX,
};

// ============================================================================
// Constants
// ============================================================================

/// pAllocationSlotMin in microseconds.
pub const P_ALLOCATION_SLOT_MIN_US: u64 = 500;
/// pAllocationSlotResolution in microseconds.
pub const P_ALLOCATION_SLOT_RESOLUTION_US: u64 = 500;
/// pSIFS in microseconds.
pub const P_SIFS_US: u64 = 75;
/// pMIFS in microseconds.
pub const P_MIFS_US: u64 = 20;
/// pExtraIFS in microseconds.
pub const P_EXTRA_IFS_US: u64 = 10;
/// mClockResolution in microseconds.
pub const M_CLOCK_RESOLUTION_US: u64 = 4;
/// mAllocationSlotLength.
pub const M_ALLOCATION_SLOT_LENGTH: u64 = 1;

/// Length of one allocation slot.
pub fn slot_duration() -> SimTime {
    SimTime::from_micros(P_ALLOCATION_SLOT_MIN_US + M_ALLOCATION_SLOT_LENGTH * P_ALLOCATION_SLOT_RESOLUTION_US)
}

/// Guard kept free at the end of an allocation.
pub fn guard_time() -> SimTime {
    SimTime::from_micros(P_SIFS_US + P_EXTRA_IFS_US + M_CLOCK_RESOLUTION_US)
}

fn sifs() -> SimTime {
    SimTime::from_micros(P_SIFS_US)
}

// ============================================================================
// Types
// ============================================================================

/// MAC state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MacState {
    Idle,
    Csma,
    Sending,
    AckPending,
    ChannelAccessFailure,
    ChannelIdle,
}

/// How the MAC gets onto the medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    /// Transmit only inside the allocation granted by the last beacon.
    #[default]
    Scheduled,
    /// Run CSMA/CA before every transmission.
    Contention,
}

/// Status reported with a data confirm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataConfirmStatus {
    Success,
    TransactionOverflow,
    TransactionExpired,
    ChannelAccessFailure,
    InvalidAddress,
    InvalidGts,
    NoAck,
    CounterError,
    FrameTooLong,
    UnavailableKey,
    UnsupportedSecurity,
    InvalidParameter,
    ExceedAllocationInterval,
}

/// Outcome of a transmission, passed to the SSCS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataConfirm {
    pub status: DataConfirmStatus,
    /// Recipient of an acknowledgement that was sent.
    pub node_id: Option<NodeId>,
    /// Slot tag of an acknowledgement that was sent.
    pub time_slot: Option<u32>,
}

impl DataConfirm {
    fn status(status: DataConfirmStatus) -> Self {
        DataConfirm {
            status,
            node_id: None,
            time_slot: None,
        }
    }
}

/// Upcall queued for the SSCS.
#[derive(Debug, Clone)]
pub enum MacNotification {
    DataConfirm(DataConfirm),
    DataIndication(Packet),
}

/// Transmit window derived from the last beacon, relative to its reception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// Earliest transmit time.
    pub start: SimTime,
    /// End of the allocation.
    pub end: SimTime,
}

/// MAC parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MacConfig {
    pub ban_id: u32,
    pub tx_power_dbm: f64,
    pub cca_mode: u8,
    pub rx_on_when_idle: bool,
    pub access_mode: AccessMode,
    /// Size of the acknowledgements this MAC sends.
    pub ack_packet_size: usize,
    pub csma: CsmaConfig,
}

impl Default for MacConfig {
    fn default() -> Self {
        MacConfig {
            ban_id: 0,
            tx_power_dbm: 0.0,
            cca_mode: 1,
            rx_on_when_idle: true,
            access_mode: AccessMode::Scheduled,
            ack_packet_size: 10,
            csma: CsmaConfig::default(),
        }
    }
}

// ============================================================================
// MAC
// ============================================================================

/// One node's MAC.
#[derive(Debug)]
pub struct Mac {
    node: NodeId,
    entity: EntityId,
    config: MacConfig,
    phy: Phy,
    csma: CsmaCa,
    tracer: TracerHandle,
    state: MacState,
    tx_queue: VecDeque<Packet>,
    tx_packet: Option<Packet>,
    rx_packet: Option<Packet>,
    seq_num: u32,
    ack_timer: CancellableTimer,
    allocation: Option<Allocation>,
    beacon_rx_time: SimTime,
    time_slot_index: Option<u32>,
    outbox: Vec<MacNotification>,
}

impl Mac {
    pub fn new(node: NodeId, entity: EntityId, config: MacConfig, phy: Phy, tracer: TracerHandle) -> Self {
        Mac {
            node,
            entity,
            csma: CsmaCa::new(node, entity, config.csma),
            config,
            phy,
            tracer,
            state: MacState::Idle,
            tx_queue: VecDeque::new(),
            tx_packet: None,
            rx_packet: None,
            seq_num: 0,
            ack_timer: CancellableTimer::new(),
            allocation: None,
            beacon_rx_time: SimTime::ZERO,
            time_slot_index: None,
            outbox: Vec::new(),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node
    }

    pub fn config(&self) -> &MacConfig {
        &self.config
    }

    pub fn state(&self) -> MacState {
        self.state
    }

    pub fn phy(&self) -> &Phy {
        &self.phy
    }

    pub fn phy_mut(&mut self) -> &mut Phy {
        &mut self.phy
    }

    pub fn tracer(&self) -> &TracerHandle {
        &self.tracer
    }

    /// Frames waiting behind the one in flight.
    pub fn queue_len(&self) -> usize {
        self.tx_queue.len()
    }

    /// Frame being sent or awaiting its acknowledgement.
    pub fn tx_packet(&self) -> Option<&Packet> {
        self.tx_packet.as_ref()
    }

    pub fn allocation(&self) -> Option<Allocation> {
        self.allocation
    }

    pub fn time_slot_index(&self) -> Option<u32> {
        self.time_slot_index
    }

    /// Drain the notifications queued for the SSCS.
    pub fn take_notifications(&mut self) -> Vec<MacNotification> {
        std::mem::take(&mut self.outbox)
    }

    fn notify_confirm(&mut self, confirm: DataConfirm) {
        self.outbox.push(MacNotification::DataConfirm(confirm));
    }

    fn post(&self, ctx: &mut SimContext, delay: SimTime, kind: u32, token: u32) {
        ctx.post_event(
            delay,
            vec![self.entity],
            EventPayload::Timer {
                timer_id: timer_id(kind, token),
            },
        );
    }

    fn change_state(&mut self, state: MacState) {
        trace!("Mac[{}]: {:?} -> {:?}", self.node, self.state, state);
        self.state = state;
    }

    fn request_trx_state(&mut self, state: PhyState, ctx: &mut SimContext) -> Result<(), SimError> {
        if let Some(confirm) = self.phy.set_trx_state_request(state) {
            self.set_trx_state_confirm(confirm, ctx)?;
        }
        Ok(())
    }

    fn request_idle_trx_state(&mut self, ctx: &mut SimContext) -> Result<(), SimError> {
        let state = if self.config.rx_on_when_idle {
            PhyState::RxOn
        } else {
            PhyState::TrxOff
        };
        self.request_trx_state(state, ctx)
    }

    fn invalid_state(&self, message: String) -> SimError {
        SimError::InvalidState {
            entity: self.entity,
            message,
        }
    }

    /// Configure the PHY and enter the idle receive state.
    pub fn do_initialize(&mut self, ctx: &mut SimContext) -> Result<(), SimError> {
        self.phy
            .set_attribute_request(PibAttribute::TransmitPower(self.config.tx_power_dbm));
        self.phy.set_attribute_request(PibAttribute::CcaMode(self.config.cca_mode));
        self.request_idle_trx_state(ctx)?;
        info!("Mac[{}]: initialized", self.node);
        Ok(())
    }

    /// Build a frame. The header carries this MAC's current slot tag.
    pub fn set_mac_header(
        &self,
        tx_params: &TxParams,
        frame_type: FrameType,
        frame_subtype: FrameSubtype,
        size: usize,
    ) -> Result<Packet, SimError> {
        let mut tx_params = tx_params.clone();
        tx_params.time_slot = self.time_slot_index;
        let header = MacHeader::from_tx_params(&tx_params, frame_type, frame_subtype)?;
        let body = FrameBody::for_subtype(frame_subtype)?;
        Ok(Packet::new(size, header, body))
    }

    /// Queue a management frame and look at the queue right away.
    pub fn mlme_data_request(&mut self, packet: Packet, ctx: &mut SimContext) {
        debug!(
            "Mac[{}]: MLME-DATA.request, {} bytes from {} to {}",
            self.node,
            packet.size,
            packet.header().sender_id,
            packet.header().recipient_id
        );
        self.tx_queue.push_back(packet);
        self.post(ctx, SimTime::ZERO, TIMER_MAC_CHECK_QUEUE, 0);
    }

    /// Queue an acknowledged data frame.
    ///
    /// Under scheduled access the frame waits for the next allocation.
    pub fn mcps_data_request(
        &mut self,
        tx_params: &TxParams,
        size: usize,
        ctx: &mut SimContext,
    ) -> Result<(), SimError> {
        let tx_params = tx_params
            .clone()
            .with_tx_option(TxOption::Ack)
            .with_seq_num(self.seq_num);
        self.seq_num = self.seq_num.wrapping_add(1);
        let packet = self.set_mac_header(&tx_params, FrameType::Data, FrameSubtype::DataUp0, size)?;
        info!(
            "Mac[{}]: MCPS-DATA.request, seq {:?}, slot {:?}, to {}",
            self.node,
            packet.header().sequence_number(),
            packet.header().time_slot_index,
            packet.header().recipient_id
        );
        self.tx_queue.push_back(packet);
        if self.config.access_mode == AccessMode::Contention {
            self.post(ctx, SimTime::ZERO, TIMER_MAC_CHECK_QUEUE, 0);
        }
        Ok(())
    }

    /// Time to wait for an acknowledgement of a frame of `size` bytes.
    pub fn ack_wait_duration(&self, size: usize) -> SimTime {
        let symbols = A_TURNAROUND_TIME as f64
            + self.phy.shr_duration()
            + (6.0 * self.phy.symbols_per_octet()).ceil();
        let secs = symbols / self.phy.symbol_rate()
            + 2.0 * self.phy.calc_tx_time(size)
            + 4.0 * A_TURNAROUND_TIME as f64 * 1e-6;
        SimTime::from_secs(secs)
    }

    /// The PHY finished (or refused) a transmission.
    pub fn pd_data_confirm(&mut self, status: PhyState, ctx: &mut SimContext) -> Result<(), SimError> {
        match status {
            PhyState::Success => {
                let packet = self.tx_packet.as_ref().ok_or(SimError::MissingPacket {
                    entity: self.entity,
                    context: "pd_data_confirm",
                })?;
                let header = packet.header();
                let is_data = header.frame_type() == FrameType::Data;
                let requires_ack = header.requires_ack();
                let subtype = header.frame_subtype();
                let recipient = header.recipient_id;
                let slot = header.time_slot_index;
                let size = packet.size;

                if is_data && requires_ack {
                    self.set_mac_state(MacState::AckPending, ctx)?;
                    let wait = self.ack_wait_duration(size);
                    let token = self.ack_timer.arm();
                    self.post(ctx, wait, TIMER_MAC_ACK_TIMEOUT, token);
                    debug!(
                        "Mac[{}]: frame sent, ACK timeout at {}",
                        self.node,
                        ctx.time() + wait
                    );
                } else {
                    if subtype == FrameSubtype::IAck {
                        self.notify_confirm(DataConfirm {
                            status: DataConfirmStatus::Success,
                            node_id: Some(recipient),
                            time_slot: slot,
                        });
                    } else {
                        self.notify_confirm(DataConfirm::status(DataConfirmStatus::Success));
                    }
                    self.tx_packet = None;
                    self.change_state(MacState::Idle);
                    self.request_idle_trx_state(ctx)?;
                }
                Ok(())
            }
            PhyState::Unspecified => {
                warn!("Mac[{}]: PHY reported abnormal state {:?}", self.node, status);
                Ok(())
            }
            other => Err(self.invalid_state(format!(
                "PHY is not in the correct state for data transmission: {:?}",
                other
            ))),
        }
    }

    /// A frame was decoded by the PHY.
    pub fn pd_data_indication(&mut self, packet: Packet, ctx: &mut SimContext) -> Result<(), SimError> {
        let header = packet.header();
        debug!(
            "Mac[{}]: frame received from {}, type {:?}",
            self.node,
            header.sender_id,
            header.frame_type()
        );

        let accept = header.sender_id != self.node
            && header.ban_id == self.config.ban_id
            && (header.recipient_id.is_broadcast() || header.recipient_id == self.node);
        if !accept {
            trace!("Mac[{}]: frame from {} not for this node", self.node, header.sender_id);
            return Ok(());
        }

        let frame_type = header.frame_type();
        let requires_ack = header.requires_ack();
        let rx_seq = header.sequence_number();
        let is_broadcast = header.recipient_id.is_broadcast();

        if frame_type == FrameType::Management && is_broadcast {
            self.handle_beacon(&packet, ctx);
        }

        let state = self.state;
        self.rx_packet = Some(packet.clone());

        match frame_type {
            FrameType::Data => {
                self.outbox.push(MacNotification::DataIndication(packet));
                if requires_ack && state == MacState::AckPending {
                    warn!("Mac[{}]: NO ACK received, data frame arrived instead", self.node);
                    self.ack_timer.cancel();
                    self.tx_packet = None;
                    self.set_mac_state(MacState::Idle, ctx)?;
                    self.notify_confirm(DataConfirm::status(DataConfirmStatus::NoAck));
                }
                if requires_ack {
                    self.change_state(MacState::Idle);
                    self.post(ctx, sifs(), TIMER_MAC_SEND_ACK, 0);
                }
            }
            FrameType::Control if state == MacState::AckPending => {
                let tx = self.tx_packet.as_ref().ok_or(SimError::MissingPacket {
                    entity: self.entity,
                    context: "pd_data_indication",
                })?;
                if rx_seq == tx.header().sequence_number() {
                    if tx.header().frame_type() == FrameType::Data {
                        debug!("Mac[{}]: ACK received for seq {:?}", self.node, rx_seq);
                        self.tracer.lock().add_success_tx_packet(tx.size);
                        self.notify_confirm(DataConfirm::status(DataConfirmStatus::Success));
                        self.tx_packet = None;
                        self.ack_timer.cancel();
                        self.change_state(MacState::Idle);
                        self.request_idle_trx_state(ctx)?;
                        self.post(ctx, sifs(), TIMER_MAC_CHECK_QUEUE, 0);
                    }
                } else {
                    warn!(
                        "Mac[{}]: ACK sequence {:?} does not match pending {:?}, dropping frame",
                        self.node,
                        rx_seq,
                        tx.header().sequence_number()
                    );
                    self.ack_timer.cancel();
                    self.tx_packet = None;
                    self.notify_confirm(DataConfirm::status(DataConfirmStatus::CounterError));
                    self.set_mac_state(MacState::Idle, ctx)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn handle_beacon(&mut self, packet: &Packet, ctx: &mut SimContext) {
        self.beacon_rx_time = ctx.time();
        let link = packet
            .body()
            .as_beacon()
            .and_then(|beacon| beacon.assigned_link(self.node))
            .cloned();
        info!("Mac[{}]: beacon accepted", self.node);

        let Some(link) = link else {
            debug!("Mac[{}]: no allocation in this beacon", self.node);
            self.allocation = None;
            return;
        };

        self.phy
            .set_attribute_request(PibAttribute::TransmitPower(link.tx_power));
        let slot_ns = slot_duration().as_nanos();
        let offset = SimTime::from_nanos(link.interval_start as u64 * slot_ns);
        let allocation = Allocation {
            start: offset + sifs(),
            end: offset + SimTime::from_nanos(link.interval_end as u64 * slot_ns),
        };
        self.allocation = Some(allocation);
        self.time_slot_index = Some(link.time_slot_index);
        debug!(
            "Mac[{}]: time slot {}, alloc start {}, alloc end {}",
            self.node, link.time_slot_index, allocation.start, allocation.end
        );
        self.post(ctx, allocation.start, TIMER_MAC_START_TX, 0);
    }

    /// Whether a data frame of `size` bytes plus its acknowledgement still fits
    /// the current allocation.
    pub fn fits_allocation(&self, size: usize, now: SimTime) -> bool {
        let Some(allocation) = self.allocation else {
            return false;
        };
        let ns = |t: SimTime| t.as_nanos() as i64;
        let window = ns(allocation.end) - ns(allocation.start);
        let elapsed = ns(now) - ns(self.beacon_rx_time) - ns(allocation.start);
        let remain = window - elapsed;
        let tx_time = ns(self.phy.tx_duration(size));
        let ack_rx_time = tx_time;
        ns(slot_duration()) < remain && tx_time + ns(guard_time()) + ack_rx_time < remain
    }

    /// Transceiver state confirm from the PHY.
    pub fn set_trx_state_confirm(&mut self, status: PhyState, ctx: &mut SimContext) -> Result<(), SimError> {
        match (self.state, status) {
            (MacState::Sending, PhyState::TxOn) => {
                let packet = self.tx_packet.clone().ok_or(SimError::MissingPacket {
                    entity: self.entity,
                    context: "set_trx_state_confirm",
                })?;
                if packet.header().frame_type() == FrameType::Data
                    && self.config.access_mode == AccessMode::Scheduled
                    && !self.fits_allocation(packet.size, ctx.time())
                {
                    warn!("Mac[{}]: no remaining time left in allocation, TX deferred", self.node);
                    self.change_state(MacState::Idle);
                    return self.request_idle_trx_state(ctx);
                }
                debug!("Mac[{}]: TX start", self.node);
                match self.phy.pd_data_request(packet, ctx) {
                    PdDataOutcome::Started { tx_power_dbm } => {
                        self.tracer.lock().add_tx_packet(tx_power_dbm);
                    }
                    PdDataOutcome::Rejected(state) => self.pd_data_confirm(state, ctx)?,
                    PdDataOutcome::Ignored => {}
                }
            }
            (MacState::Csma, PhyState::RxOn | PhyState::Success) => self.csma.start(ctx),
            (MacState::Idle | MacState::AckPending, _) => {}
            (state, status) => {
                debug!("Mac[{}]: transceiver confirm {:?} ignored in {:?}", self.node, status, state);
            }
        }
        Ok(())
    }

    fn begin_transmission(&mut self, ctx: &mut SimContext) -> Result<(), SimError> {
        match self.config.access_mode {
            AccessMode::Scheduled => {
                self.change_state(MacState::Sending);
                self.request_trx_state(PhyState::TxOn, ctx)
            }
            AccessMode::Contention => self.set_mac_state(MacState::Csma, ctx),
        }
    }

    /// The allocation granted by the last beacon has started.
    pub fn start_tx(&mut self, ctx: &mut SimContext) -> Result<(), SimError> {
        if self.tx_packet.is_none() {
            trace!("Mac[{}]: start_tx with nothing in flight, checking queue", self.node);
            return self.set_mac_state(MacState::Idle, ctx);
        }
        match self.state {
            MacState::AckPending => {
                warn!("Mac[{}]: start_tx while waiting for ACK, dropping TX packet", self.node);
                self.ack_timer.cancel();
                self.tx_packet = None;
                self.notify_confirm(DataConfirm::status(DataConfirmStatus::NoAck));
                self.set_mac_state(MacState::Idle, ctx)
            }
            MacState::Idle => self.begin_transmission(ctx),
            _ => Ok(()),
        }
    }

    /// Move the next queued frame into flight if the MAC is free.
    pub fn check_queue(&mut self, ctx: &mut SimContext) -> Result<(), SimError> {
        if self.state != MacState::Idle || self.tx_packet.is_some() {
            return Ok(());
        }
        if let Some(packet) = self.tx_queue.pop_front() {
            self.tx_packet = Some(packet);
            self.begin_transmission(ctx)?;
        }
        Ok(())
    }

    /// Drive the MAC state machine.
    pub fn set_mac_state(&mut self, state: MacState, ctx: &mut SimContext) -> Result<(), SimError> {
        match state {
            MacState::Idle => {
                self.change_state(MacState::Idle);
                self.request_idle_trx_state(ctx)?;
                self.post(ctx, SimTime::ZERO, TIMER_MAC_CHECK_QUEUE, 0);
            }
            MacState::AckPending => {
                self.change_state(MacState::AckPending);
                self.request_trx_state(PhyState::RxOn, ctx)?;
            }
            MacState::Csma => {
                if self.state != MacState::Idle {
                    return Err(self.invalid_state(format!("CSMA/CA started in {:?}", self.state)));
                }
                self.change_state(MacState::Csma);
                self.request_trx_state(PhyState::RxOn, ctx)?;
            }
            MacState::ChannelIdle | MacState::ChannelAccessFailure | MacState::Sending => {
                return Err(self.invalid_state(format!("{:?} cannot be entered directly", state)));
            }
        }
        Ok(())
    }

    fn csma_outcome(&mut self, outcome: CsmaOutcome, ctx: &mut SimContext) -> Result<(), SimError> {
        if self.state != MacState::Csma {
            return Ok(());
        }
        match outcome {
            CsmaOutcome::ChannelIdle => {
                self.change_state(MacState::Sending);
                self.request_trx_state(PhyState::TxOn, ctx)
            }
            CsmaOutcome::ChannelAccessFailure => {
                warn!("Mac[{}]: no clear channel found, dropping TX packet", self.node);
                self.tx_packet = None;
                self.notify_confirm(DataConfirm::status(DataConfirmStatus::ChannelAccessFailure));
                self.set_mac_state(MacState::Idle, ctx)
            }
        }
    }

    fn request_cca(&mut self, ctx: &mut SimContext) -> Result<(), SimError> {
        self.csma.begin_cca();
        if let Some(status) = self.phy.plme_cca_request(ctx) {
            self.plme_cca_confirm(status, ctx)?;
        }
        Ok(())
    }

    /// Clear channel assessment result.
    pub fn plme_cca_confirm(&mut self, status: PhyState, ctx: &mut SimContext) -> Result<(), SimError> {
        if let Some(outcome) = self.csma.plme_cca_confirm(status, ctx) {
            self.csma_outcome(outcome, ctx)?;
        }
        Ok(())
    }

    /// Acknowledge the last accepted frame.
    pub fn send_ack(&mut self, ctx: &mut SimContext) -> Result<(), SimError> {
        if self.state != MacState::Idle {
            return Err(self.invalid_state(format!("send_ack in {:?}", self.state)));
        }
        let rx = self.rx_packet.as_ref().ok_or(SimError::MissingPacket {
            entity: self.entity,
            context: "send_ack",
        })?;
        let rx_header = rx.header();
        let mut tx_params = TxParams::new(self.config.ban_id, self.node, rx_header.sender_id);
        if let Some(seq) = rx_header.sequence_number() {
            tx_params = tx_params.with_seq_num(seq);
        }
        self.time_slot_index = rx_header.time_slot_index;
        debug!("Mac[{}]: sending ACK to {}", self.node, rx_header.sender_id);

        let ack = self.set_mac_header(
            &tx_params,
            FrameType::Control,
            FrameSubtype::IAck,
            self.config.ack_packet_size,
        )?;
        self.tx_packet = Some(ack);
        self.change_state(MacState::Sending);
        self.request_trx_state(PhyState::TxOn, ctx)
    }

    /// The ACK wait armed with `token` expired.
    pub fn ack_wait_timeout(&mut self, token: u32, ctx: &mut SimContext) -> Result<(), SimError> {
        if !self.ack_timer.fire(token) {
            trace!("Mac[{}]: stale ACK timeout ignored", self.node);
            return Ok(());
        }
        if self.state == MacState::AckPending {
            warn!("Mac[{}]: ACK timed out, dropping TX packet", self.node);
            self.tx_packet = None;
            self.set_mac_state(MacState::Idle, ctx)?;
            self.notify_confirm(DataConfirm::status(DataConfirmStatus::NoAck));
        }
        Ok(())
    }

    /// A frame arrives from the channel.
    pub fn on_receive_air(&mut self, packet: Packet, ctx: &mut SimContext) {
        self.phy.start_rx(packet, ctx);
    }

    /// Handle a PHY, CSMA/CA or MAC timer. Returns false for kinds that
    /// belong to another layer.
    pub fn handle_timer(&mut self, kind: u32, token: u32, ctx: &mut SimContext) -> Result<bool, SimError> {
        match kind {
            TIMER_PHY_END_TX => {
                let status = self.phy.end_tx();
                self.pd_data_confirm(status, ctx)?;
            }
            TIMER_PHY_END_RX => {
                if let Some(packet) = self.phy.end_rx(token) {
                    self.pd_data_indication(packet, ctx)?;
                }
            }
            TIMER_PHY_END_CCA => {
                if let Some(status) = self.phy.end_cca() {
                    self.plme_cca_confirm(status, ctx)?;
                }
            }
            TIMER_CSMA_BACKOFF => {
                let symbol_rate = self.phy.symbol_rate();
                self.csma.random_backoff_delay(symbol_rate, ctx);
            }
            TIMER_CSMA_CAN_PROCEED => self.csma.can_proceed(ctx),
            TIMER_CSMA_REQUEST_CCA => self.request_cca(ctx)?,
            TIMER_MAC_START_TX => self.start_tx(ctx)?,
            TIMER_MAC_CHECK_QUEUE => self.check_queue(ctx)?,
            TIMER_MAC_ACK_TIMEOUT => self.ack_wait_timeout(token, ctx)?,
            TIMER_MAC_SEND_ACK => self.send_ack(ctx)?,
            _ => return Ok(false),
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phy::PhyConfig;
    use crate::tracer::Tracer;
    use bansim_common::{split_timer_id, AssignedLinkElement};

    fn mac(node: u32) -> Mac {
        let phy = Phy::new(NodeId(node), EntityId(1), EntityId(2), PhyConfig::default());
        Mac::new(NodeId(node), EntityId(1), MacConfig::default(), phy, Tracer::shared(1.0))
    }

    fn timers(ctx: &mut SimContext) -> Vec<(u32, SimTime)> {
        ctx.take_pending_events()
            .iter()
            .filter_map(|e| match e.payload {
                EventPayload::Timer { timer_id } => Some((split_timer_id(timer_id).0, e.time)),
                _ => None,
            })
            .collect()
    }

    fn beacon_for(node: NodeId, interval_start: u32, slot: u32) -> Packet {
        let tx = TxParams::new(0, NodeId::COORDINATOR, NodeId::BROADCAST);
        let header = MacHeader::from_tx_params(&tx, FrameType::Management, FrameSubtype::Beacon).unwrap();
        let mut packet = Packet::new(100, header, FrameBody::for_subtype(FrameSubtype::Beacon).unwrap());
        packet
            .body_mut()
            .as_beacon_mut()
            .unwrap()
            .push_link(AssignedLinkElement::new(node, interval_start, 8, 0.0, slot));
        packet
    }

    #[test]
    fn test_constants() {
        assert_eq!(slot_duration(), SimTime::from_micros(1000));
        assert_eq!(guard_time(), SimTime::from_micros(89));
    }

    #[test]
    fn test_ack_wait_duration() {
        // (12 + 10 + 12) / 62500 + 2 * 3392 us + 48 us
        assert_eq!(mac(0).ack_wait_duration(100), SimTime::from_micros(544 + 6784 + 48));
    }

    #[test]
    fn test_initialize_enters_rx_on() {
        let mut ctx = SimContext::new(42);
        let mut m = mac(0);
        m.do_initialize(&mut ctx).unwrap();
        assert_eq!(m.phy().state(), PhyState::RxOn);
        assert_eq!(m.state(), MacState::Idle);
    }

    #[test]
    fn test_data_requests_number_frames() {
        let mut ctx = SimContext::new(42);
        let mut m = mac(0);
        let tx = TxParams::new(0, NodeId(0), NodeId::COORDINATOR);
        m.mcps_data_request(&tx, 100, &mut ctx).unwrap();
        m.mcps_data_request(&tx, 100, &mut ctx).unwrap();
        assert_eq!(m.queue_len(), 2);
        // Scheduled access waits for the allocation
        assert!(timers(&mut ctx).is_empty());
        assert_eq!(m.tx_queue[0].header().sequence_number(), Some(0));
        assert_eq!(m.tx_queue[1].header().sequence_number(), Some(1));
        assert!(m.tx_queue[1].header().requires_ack());
    }

    #[test]
    fn test_beacon_schedules_start_tx() {
        let mut ctx = SimContext::new(42);
        let mut m = mac(3);
        m.do_initialize(&mut ctx).unwrap();
        m.pd_data_indication(beacon_for(NodeId(3), 18, 2), &mut ctx).unwrap();

        let alloc = m.allocation().unwrap();
        assert_eq!(alloc.start, SimTime::from_micros(18_075));
        assert_eq!(alloc.end, SimTime::from_micros(26_000));
        assert_eq!(m.time_slot_index(), Some(2));
        assert_eq!(timers(&mut ctx), vec![(TIMER_MAC_START_TX, SimTime::from_micros(18_075))]);
    }

    #[test]
    fn test_beacon_without_link_clears_allocation() {
        let mut ctx = SimContext::new(42);
        let mut m = mac(3);
        m.pd_data_indication(beacon_for(NodeId(3), 0, 0), &mut ctx).unwrap();
        assert!(m.allocation().is_some());
        ctx.take_pending_events();

        m.pd_data_indication(beacon_for(NodeId(4), 0, 0), &mut ctx).unwrap();
        assert!(m.allocation().is_none());
        assert!(timers(&mut ctx).is_empty());
    }

    #[test]
    fn test_allocation_fit() {
        let mut ctx = SimContext::new(42);
        let mut m = mac(3);
        assert!(!m.fits_allocation(100, SimTime::ZERO));

        m.pd_data_indication(beacon_for(NodeId(3), 0, 0), &mut ctx).unwrap();
        let start = SimTime::from_micros(75);
        assert!(m.fits_allocation(100, start));
        // 7925 us window, 6873 us needed
        assert!(m.fits_allocation(100, start + SimTime::from_micros(1000)));
        assert!(!m.fits_allocation(100, start + SimTime::from_micros(1100)));
    }

    #[test]
    fn test_frames_for_other_nodes_are_ignored() {
        let mut ctx = SimContext::new(42);
        let mut m = mac(3);
        let tx = TxParams::new(0, NodeId(4), NodeId::COORDINATOR).with_tx_option(TxOption::Ack);
        let header = MacHeader::from_tx_params(&tx, FrameType::Data, FrameSubtype::DataUp0).unwrap();
        let packet = Packet::new(100, header, FrameBody::Data { priority: 0 });
        m.pd_data_indication(packet, &mut ctx).unwrap();
        assert!(m.take_notifications().is_empty());
        assert!(timers(&mut ctx).is_empty());
    }

    #[test]
    fn test_stale_ack_timeout_ignored() {
        let mut ctx = SimContext::new(42);
        let mut m = mac(3);
        m.ack_wait_timeout(0, &mut ctx).unwrap();
        assert!(m.take_notifications().is_empty());
        assert_eq!(m.state(), MacState::Idle);
    }

    #[test]
    fn test_send_ack_outside_idle_is_fatal() {
        let mut ctx = SimContext::new(42);
        let mut m = mac(3);
        m.state = MacState::Sending;
        assert!(matches!(m.send_ack(&mut ctx), Err(SimError::InvalidState { .. })));
    }

    #[test]
    fn test_csma_from_busy_state_is_fatal() {
        let mut ctx = SimContext::new(42);
        let mut m = mac(3);
        m.state = MacState::AckPending;
        assert!(m.set_mac_state(MacState::Csma, &mut ctx).is_err());
    }
}
