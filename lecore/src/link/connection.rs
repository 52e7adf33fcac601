//! Per-connection state and the data path.
//!
//! A [`Connection`] is created from the `LLData` of a `CONNECT_IND`, on either side of it, and
//! lives in the controller's connection pool until it is released. The scheduler owns the timing
//! of its events (anchor point, missed events); everything else is kept here.
//!
//! Every connection event follows the same steps:
//!
//! 1. [`prepare_event`] runs the control procedure engine and selects the data channel.
//! 2. The master builds its PDU with [`next_tx_pdu`] and hands it to the radio; the slave waits.
//! 3. A received PDU goes through [`receive`], which handles acknowledgement, decryption and
//!    dispatch. The slave then builds its answer with [`next_tx_pdu`].
//! 4. [`close_event`] counts the event against procedure timers and advances the event counter,
//!    applying an update whose instant was reached.
//!
//! [`Connection`]: struct.Connection.html
//! [`prepare_event`]: struct.Connection.html#method.prepare_event
//! [`next_tx_pdu`]: struct.Connection.html#method.next_tx_pdu
//! [`receive`]: struct.Connection.html#method.receive
//! [`close_event`]: struct.Connection.html#method.close_event

use {
    super::{
        advertising::{ConnectRequestData, SleepClockAccuracy},
        channel_map::ChannelMap,
        channel_selection::ChannelSelection,
        data::{CteInfo, DataPdu, Llid, SeqNum, MIN_PAYLOAD},
        device_address::DeviceAddress,
        features::FeatureSet,
        llcp::{ConnectionUpdateData, ControlPdu, LengthParams, VersionNumber},
        procedure::{timeout_events, ProcedureQueue},
        queue::{Consume, PduQueue},
        ConnHandle, EventQueue, Role,
    },
    crate::{
        config::Params,
        error::ErrorCode,
        phy::{DataChannel, Phy, PhySet},
        security::{rng::RandomSource, rng::Trng, CryptoError, EncryptionState},
        time::{Duration, Instant},
        utils::{Hex, HexSlice},
        Error,
    },
    core::num::Wrapping,
    heapless::Deque,
};

/// Connection events without a received packet after which establishment fails.
pub const ESTABLISHMENT_EVENTS: u32 = 6;

/// Number of connection events between queueing a PDU with an instant and that instant.
pub const INSTANT_OFFSET: u16 = 6;

/// Number of pending outgoing control PDUs.
pub const CTRL_TX_DEPTH: usize = 4;

/// Smallest and largest `MaxTxTime`/`MaxRxTime` values.
pub const MIN_PACKET_TIME: u16 = 328;
pub const MAX_PACKET_TIME: u16 = 17040;

/// Largest `MaxTxOctets`/`MaxRxOctets` value.
pub const MAX_OCTETS: u16 = 251;

/// Lifecycle of a connection. A released connection no longer exists.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnState {
    /// Created, no packet received yet.
    Establishing,
    Active,
    /// Torn down with the given reason; released at the end of the current scheduling step.
    Terminating(ErrorCode),
}

/// Connection parameters in their on-air units.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ConnParams {
    /// Connection interval in 1.25 ms units.
    pub interval: u16,
    pub latency: u16,
    /// Supervision timeout in 10 ms units.
    pub timeout: u16,
}

impl ConnParams {
    pub fn interval(&self) -> Duration {
        Duration::from_conn_units(self.interval)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_supervision_units(self.timeout)
    }

    /// Checks the allowed ranges and that the supervision timeout exceeds
    /// `(1 + latency) * interval * 2`.
    pub fn is_valid(&self) -> bool {
        (6..=3200).contains(&self.interval)
            && self.latency <= 499
            && (10..=3200).contains(&self.timeout)
            && u32::from(self.timeout) * 4 > (1 + u32::from(self.latency)) * u32::from(self.interval)
    }
}

/// Version information from `LL_VERSION_IND`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    pub vers_nr: VersionNumber,
    pub company_id: u16,
    pub sub_vers_nr: u16,
}

/// Per-connection counters, readable by the host.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct ConnStats {
    /// Connection events that were closed, including missed ones.
    pub events: u32,
    pub missed_events: u32,
    pub packets_rx: u32,
    pub packets_tx: u32,
    pub crc_errors: u32,
    pub last_rssi: i8,
}

/// PHYs in use and preferred, per direction.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PhyState {
    pub tx: Phy,
    pub rx: Phy,
    pub preferred_tx: PhySet,
    pub preferred_rx: PhySet,
}

/// Data length state: both sides' limits and the effective values derived from them.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DataLength {
    pub local: LengthParams,
    pub remote: LengthParams,
    pub eff_tx_octets: u16,
    pub eff_tx_time: u16,
    pub eff_rx_octets: u16,
    pub eff_rx_time: u16,
}

impl DataLength {
    /// The values every device supports before a data length update.
    pub const DEFAULT: LengthParams = LengthParams {
        max_rx_octets: MIN_PAYLOAD as u16,
        max_rx_time: MIN_PACKET_TIME,
        max_tx_octets: MIN_PAYLOAD as u16,
        max_tx_time: MIN_PACKET_TIME,
    };

    pub fn new(local: LengthParams) -> Self {
        let mut this = Self {
            local,
            remote: Self::DEFAULT,
            eff_tx_octets: 0,
            eff_tx_time: 0,
            eff_rx_octets: 0,
            eff_rx_time: 0,
        };
        this.recompute();
        this
    }

    /// Recomputes the effective values. Returns whether any of them changed.
    pub fn recompute(&mut self) -> bool {
        let octets = |a: u16, b: u16| a.min(b).max(MIN_PAYLOAD as u16).min(MAX_OCTETS);
        let time = |a: u16, b: u16| a.min(b).max(MIN_PACKET_TIME).min(MAX_PACKET_TIME);
        let new = (
            octets(self.local.max_tx_octets, self.remote.max_rx_octets),
            time(self.local.max_tx_time, self.remote.max_rx_time),
            octets(self.local.max_rx_octets, self.remote.max_tx_octets),
            time(self.local.max_rx_time, self.remote.max_tx_time),
        );
        let old = (
            self.eff_tx_octets,
            self.eff_tx_time,
            self.eff_rx_octets,
            self.eff_rx_time,
        );
        self.eff_tx_octets = new.0;
        self.eff_tx_time = new.1;
        self.eff_rx_octets = new.2;
        self.eff_rx_time = new.3;
        old != new
    }
}

/// An accepted update waiting for its instant.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InstantUpdate {
    Connection(ConnectionUpdateData),
    ChannelMap(ChannelMap),
    /// PHYs from our point of view.
    Phy { tx: Phy, rx: Phy },
}

/// New connection timing, reported to the scheduler when a connection update takes effect.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TimingChange {
    pub interval: Duration,
    /// Offset of the new anchor from the old anchor of the instant event.
    pub win_offset: Duration,
    pub win_size: Duration,
}

/// Everything a connection may touch outside of itself while processing an event.
pub(crate) struct EventCtx<'a, T: Trng> {
    pub now: Instant,
    pub rng: &'a mut RandomSource<T>,
    pub events: &'a mut EventQueue,
    /// Smallest connection interval (1.25 ms units) the scheduler can still accommodate.
    pub min_interval: u16,
}

/// Returns whether `instant` is no longer in the future, seen from event `counter`.
pub fn instant_passed(counter: u16, instant: u16) -> bool {
    let delta = instant.wrapping_sub(counter);
    delta == 0 || delta >= 32767
}

/// Connection state.
pub struct Connection {
    pub(super) handle: ConnHandle,
    pub(super) role: Role,
    pub(super) state: ConnState,
    pub(super) peer: DeviceAddress,
    pub(super) access_address: u32,
    pub(super) crc_init: u32,

    pub(super) channel_map: ChannelMap,
    pub(super) selection: ChannelSelection,
    /// Channel of the current (or last) connection event.
    pub(super) channel: DataChannel,
    /// Whether the current event already ran channel selection.
    pub(super) prepared: bool,

    pub(super) params: ConnParams,
    pub(super) win_size: u8,
    pub(super) peer_sca: SleepClockAccuracy,

    /// Counter of the next connection event to take place (`connEventCounter`).
    pub(super) event_counter: Wrapping<u16>,

    /// Update waiting for its instant.
    pub(super) pending: Option<(u16, InstantUpdate)>,

    pub(super) enc: EncryptionState,
    /// No new data PDUs go out while encryption is being started or paused.
    pub(super) data_paused: bool,
    /// Set once a pause completed, so the following start is reported as a key refresh.
    pub(super) refreshing: bool,

    pub(super) local_features: FeatureSet,
    /// Features used on this connection (local features masked with the peer's).
    pub(super) features: FeatureSet,
    pub(super) peer_features: Option<FeatureSet>,
    pub(super) peer_version: Option<VersionInfo>,
    pub(super) version_sent: bool,
    pub(super) local_version: VersionInfo,

    pub(super) phy: PhyState,
    pub(super) data_length: DataLength,

    pub(super) procedures: ProcedureQueue,
    /// Control PDUs waiting for transmission, ahead of data.
    pub(super) ctrl_tx: Deque<ControlPdu, CTRL_TX_DEPTH>,
    /// `CTEInfo` to attach to the queued `LL_CTE_RSP`.
    pub(super) cte_rsp_info: Option<CteInfo>,
    pub(super) cte_response_enabled: bool,

    /// Authenticated payload timeout.
    pub(super) apto: Duration,
    pub(super) last_authenticated: Instant,
    pub(super) apto_ping_queued: bool,

    pub(super) transmit_seq_num: SeqNum,
    pub(super) next_expected_seq_num: SeqNum,
    /// The unacknowledged PDU, exactly as sent (encrypted if encryption was on).
    pub(super) last_tx: Option<DataPdu>,
    /// The control PDU carried by `last_tx`, if any.
    pub(super) last_tx_ctrl: Option<ControlPdu>,

    pub(super) tx_queue: PduQueue,
    pub(super) rx_queue: PduQueue,

    pub(super) stats: ConnStats,
    pub(super) ctrl_timeout: Duration,
}

impl Connection {
    /// Creates the state of a connection established by a `CONNECT_IND` carrying `lldata`.
    ///
    /// `csa2` is set when both sides indicated support for Channel Selection Algorithm #2 in the
    /// `ChSel` header bits.
    pub(crate) fn new(
        handle: ConnHandle,
        role: Role,
        peer: DeviceAddress,
        lldata: &ConnectRequestData,
        csa2: bool,
        params: &Params,
        now: Instant,
    ) -> Self {
        let selection = if csa2 {
            ChannelSelection::csa2(lldata.access_address)
        } else {
            ChannelSelection::csa1(lldata.hop)
        };
        let local_length = LengthParams {
            max_rx_octets: params.max_rx_octets,
            max_rx_time: params.max_rx_time,
            max_tx_octets: params.max_tx_octets,
            max_tx_time: params.max_tx_time,
        };
        Self {
            handle,
            role,
            state: ConnState::Establishing,
            peer,
            access_address: lldata.access_address,
            crc_init: lldata.crc_init,
            channel_map: lldata.channel_map,
            selection,
            channel: DataChannel::new(0),
            prepared: false,
            params: ConnParams {
                interval: lldata.interval,
                latency: lldata.latency,
                timeout: lldata.timeout,
            },
            win_size: lldata.win_size,
            peer_sca: lldata.sca,
            event_counter: Wrapping(0),
            pending: None,
            enc: EncryptionState::new(role),
            data_paused: false,
            refreshing: false,
            local_features: params.features,
            features: params.features,
            peer_features: None,
            peer_version: None,
            version_sent: false,
            local_version: VersionInfo {
                vers_nr: crate::BLUETOOTH_VERSION,
                company_id: params.company_id,
                sub_vers_nr: params.sub_vers_nr,
            },
            phy: PhyState {
                tx: Phy::Le1M,
                rx: Phy::Le1M,
                preferred_tx: params.preferred_phys,
                preferred_rx: params.preferred_phys,
            },
            data_length: DataLength::new(local_length),
            procedures: ProcedureQueue::new(),
            ctrl_tx: Deque::new(),
            cte_rsp_info: None,
            cte_response_enabled: false,
            apto: params.default_apto,
            last_authenticated: now,
            apto_ping_queued: false,
            transmit_seq_num: SeqNum::ZERO,
            next_expected_seq_num: SeqNum::ZERO,
            last_tx: None,
            last_tx_ctrl: None,
            tx_queue: PduQueue::new(),
            rx_queue: PduQueue::new(),
            stats: ConnStats::default(),
            ctrl_timeout: params.ctrl_proc_timeout,
        }
    }

    pub fn handle(&self) -> ConnHandle {
        self.handle
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_establishing(&self) -> bool {
        self.state == ConnState::Establishing
    }

    pub fn is_terminating(&self) -> bool {
        matches!(self.state, ConnState::Terminating(_))
    }

    /// Returns the termination reason once the connection is being torn down.
    pub fn termination_reason(&self) -> Option<ErrorCode> {
        match self.state {
            ConnState::Terminating(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn peer(&self) -> DeviceAddress {
        self.peer
    }

    pub fn access_address(&self) -> u32 {
        self.access_address
    }

    pub fn crc_init(&self) -> u32 {
        self.crc_init
    }

    pub fn params(&self) -> ConnParams {
        self.params
    }

    /// Returns the configured interval between connection events.
    pub fn interval(&self) -> Duration {
        self.params.interval()
    }

    /// Returns the counter of the next connection event.
    pub fn event_counter(&self) -> u16 {
        self.event_counter.0
    }

    pub fn channel_map(&self) -> &ChannelMap {
        &self.channel_map
    }

    /// Data channel of the current (or most recent) connection event.
    pub fn channel(&self) -> DataChannel {
        self.channel
    }

    pub fn uses_csa2(&self) -> bool {
        self.selection.is_csa2()
    }

    pub fn phy(&self) -> PhyState {
        self.phy
    }

    pub fn data_length(&self) -> DataLength {
        self.data_length
    }

    pub fn stats(&self) -> ConnStats {
        self.stats
    }

    pub fn is_encrypted(&self) -> bool {
        self.enc.is_encrypted()
    }

    pub fn encryption(&self) -> &EncryptionState {
        &self.enc
    }

    /// Features in use on this connection.
    pub fn features(&self) -> FeatureSet {
        self.features
    }

    pub fn peer_features(&self) -> Option<FeatureSet> {
        self.peer_features
    }

    pub fn peer_version(&self) -> Option<VersionInfo> {
        self.peer_version
    }

    pub fn pending_update(&self) -> Option<(u16, InstantUpdate)> {
        self.pending
    }

    pub fn procedures(&self) -> &ProcedureQueue {
        &self.procedures
    }

    pub fn authenticated_payload_timeout(&self) -> Duration {
        self.apto
    }

    /// Supervision timeout expressed in connection events.
    pub fn lsto_events(&self) -> u32 {
        timeout_events(self.params.timeout(), self.interval())
    }

    /// Response timeout of control procedures expressed in connection events.
    pub(super) fn ctrl_timeout_events(&self) -> u32 {
        timeout_events(self.ctrl_timeout, self.interval())
    }

    /// Initial transmit window size.
    pub fn win_size(&self) -> Duration {
        Duration::from_conn_units(u16::from(self.win_size))
    }

    /// Receive window widening of a slave, `elapsed` after the last anchor it synchronized to.
    pub fn window_widening(&self, elapsed: Duration, local_ppm: u16) -> Duration {
        let ppm = u64::from(self.peer_sca.ppm()) + u64::from(local_ppm);
        let widening = ppm * u64::from(elapsed.as_micros()) / 1_000_000;
        Duration::from_micros(widening as u32 + 16)
    }

    /// Tears the connection down with `reason`.
    ///
    /// Only the first call has an effect, so the reason reported to the host is the first
    /// failure that occurred.
    pub(crate) fn terminate(&mut self, reason: ErrorCode) {
        if !self.is_terminating() {
            info!("[{:?}] terminating: {:?}", self.handle, reason);
            self.state = ConnState::Terminating(reason);
            self.procedures.clear();
            self.ctrl_tx.clear();
        }
    }

    /// Runs the procedure engine and selects the channel of the upcoming event.
    ///
    /// Calling this again before the event is closed (eg. after the radio refused the command)
    /// returns the same channel.
    pub(crate) fn prepare_event<T: Trng>(&mut self, ctx: &mut EventCtx<'_, T>) -> DataChannel {
        if self.prepared {
            return self.channel;
        }
        self.run_procedures(ctx);
        self.channel = self
            .selection
            .select(self.event_counter.0, &self.channel_map);
        self.prepared = true;
        self.channel
    }

    /// Returns the PDU to transmit next: the unacknowledged one, a control PDU, data, or an
    /// empty PDU, in that order of preference.
    pub(crate) fn next_tx_pdu<T: Trng>(&mut self, ctx: &mut EventCtx<'_, T>) -> DataPdu {
        if let Some(last) = &mut self.last_tx {
            last.header_mut().set_nesn(self.next_expected_seq_num);
            trace!("[{:?}] resend {:?}", self.handle, last);
            return last.clone();
        }

        let mut ctrl = None;
        let mut pdu = if let Some(pdu) = self.ctrl_tx.pop_front() {
            match DataPdu::control(&pdu) {
                Ok(mut encoded) => {
                    if pdu == ControlPdu::CteRsp {
                        encoded.set_cte_info(self.cte_rsp_info.take());
                    }
                    debug!("[{:?}] LLCP-> {:?}", self.handle, pdu);
                    ctrl = Some(pdu);
                    encoded
                }
                Err(e) => {
                    error!("[{:?}] can't encode {:?}: {}", self.handle, pdu, e);
                    DataPdu::empty()
                }
            }
        } else if !self.data_paused {
            let max = usize::from(self.data_length.eff_tx_octets);
            let result = self.tx_queue.consume_with(|pdu| {
                if pdu.payload().len() > max {
                    Consume::always(Err(Error::InvalidLength))
                } else {
                    Consume::always(Ok(pdu.clone()))
                }
            });
            match result {
                Ok(pdu) => pdu,
                Err(Error::InvalidLength) => {
                    warn!("[{:?}] dropping PDU longer than {} octets", self.handle, max);
                    DataPdu::empty()
                }
                Err(_) => DataPdu::empty(),
            }
        } else {
            DataPdu::empty()
        };

        if let Err(e) = self.enc.encrypt_pdu(&mut pdu) {
            warn!("[{:?}] encryption failed: {}", self.handle, e);
            self.terminate(crypto_reason(e));
            pdu = DataPdu::empty();
            ctrl = None;
        }

        let header = pdu.header_mut();
        header.set_sn(self.transmit_seq_num);
        header.set_nesn(self.next_expected_seq_num);
        header.set_md(false);

        self.stats.packets_tx += 1;
        self.last_tx = Some(pdu.clone());
        self.last_tx_ctrl = ctrl;
        if let Some(ctrl) = ctrl {
            self.on_control_sent(ctrl, ctx);
        }
        trace!("[{:?}] DATA-> {:?}", self.handle, pdu);
        pdu
    }

    /// Processes a PDU received during the current connection event.
    ///
    /// Returns whether the PDU was valid (correct CRC and decodable), which is what keeps the
    /// connection supervised.
    pub(crate) fn receive<T: Trng>(
        &mut self,
        raw: &[u8],
        crc_ok: bool,
        ctx: &mut EventCtx<'_, T>,
    ) -> bool {
        if !crc_ok {
            self.stats.crc_errors += 1;
            trace!("[{:?}] BADCRC {:?}", self.handle, HexSlice(raw));
            return false;
        }
        let mut pdu = match DataPdu::decode(raw) {
            Ok(pdu) => pdu,
            Err(e) => {
                debug!("[{:?}] undecodable PDU ({}): {:?}", self.handle, e, HexSlice(raw));
                return false;
            }
        };
        trace!("[{:?}] <-DATA {:?}", self.handle, pdu);

        self.stats.packets_rx += 1;
        if self.state == ConnState::Establishing {
            self.state = ConnState::Active;
            info!(
                "[{:?}] established, AA={:?}",
                self.handle,
                Hex(self.access_address)
            );
        }

        let header = pdu.header();
        self.process_ack(header.nesn(), ctx);
        if self.is_terminating() {
            return true;
        }

        if header.sn() != self.next_expected_seq_num {
            trace!("[{:?}] retransmission ignored", self.handle);
            return true;
        }

        // Without room for the result the PDU is not acknowledged, so the peer sends it again.
        let has_room = match pdu.llid() {
            Llid::Control => self.ctrl_tx.capacity() - self.ctrl_tx.len() >= 2,
            Llid::DataStart | Llid::DataCont => pdu.is_empty() || !self.rx_queue.is_full(),
            Llid::Reserved => true,
        };
        if !has_room {
            debug!("[{:?}] no room for PDU, NACKing", self.handle);
            return true;
        }

        if let Err(e) = self.enc.decrypt_pdu(&mut pdu) {
            warn!("[{:?}] decryption failed: {}", self.handle, e);
            self.terminate(crypto_reason(e));
            return true;
        }
        self.next_expected_seq_num = !self.next_expected_seq_num;

        if self.enc.rx_enabled() && !pdu.is_empty() {
            self.last_authenticated = ctx.now;
            self.apto_ping_queued = false;
        }

        match pdu.llid() {
            Llid::Control => self.handle_control_pdu(&pdu, ctx),
            Llid::DataStart | Llid::DataCont => {
                if pdu.payload().len() > usize::from(self.data_length.eff_rx_octets) {
                    warn!("[{:?}] PDU exceeds effective RX length", self.handle);
                }
                // Room was checked above.
                if !pdu.is_empty() && self.rx_queue.push(pdu).is_err() {
                    error!("[{:?}] RX queue overflow", self.handle);
                }
            }
            Llid::Reserved => {
                debug!("[{:?}] PDU with reserved LLID ignored", self.handle);
            }
        }
        true
    }

    /// Handles the `NESN` of a received PDU.
    fn process_ack<T: Trng>(&mut self, nesn: SeqNum, ctx: &mut EventCtx<'_, T>) {
        if nesn == self.transmit_seq_num || self.last_tx.is_none() {
            return;
        }
        self.transmit_seq_num = !self.transmit_seq_num;
        self.last_tx = None;
        if let Some(ctrl) = self.last_tx_ctrl.take() {
            self.on_control_acked(ctrl, ctx);
        }
    }

    /// Closes the current connection event and moves to the next one.
    ///
    /// `ran` is `false` for events that were skipped without radio activity. Returns the new
    /// timing if a connection update took effect at the new event.
    pub(crate) fn close_event<T: Trng>(
        &mut self,
        ran: bool,
        ctx: &mut EventCtx<'_, T>,
    ) -> Option<TimingChange> {
        if !self.prepared {
            self.selection.skip_event();
        }
        self.prepared = false;
        if !ran {
            self.stats.missed_events += 1;
        }
        self.stats.events += 1;
        self.tick_procedures();
        if self.is_terminating() {
            return None;
        }

        self.event_counter += Wrapping(1);
        match self.pending {
            Some((instant, update)) if instant == self.event_counter.0 => {
                self.pending = None;
                self.apply_instant(update, ctx)
            }
            _ => None,
        }
    }

    /// Records the RSSI of the last received packet.
    pub(crate) fn set_rssi(&mut self, rssi: i8) {
        self.stats.last_rssi = rssi;
    }

    /// Queues an L2CAP fragment for transmission.
    pub fn send_data(&mut self, llid: Llid, data: &[u8]) -> Result<(), Error> {
        if self.is_terminating() {
            return Err(Error::InvalidState);
        }
        if data.len() > usize::from(self.data_length.eff_tx_octets) {
            return Err(Error::InvalidLength);
        }
        let pdu = DataPdu::data(llid, data)?;
        self.tx_queue
            .push(pdu)
            .map_err(|_| Error::ResourceExhausted)
    }

    /// Takes the oldest received L2CAP fragment.
    pub fn receive_data(&mut self) -> Option<DataPdu> {
        self.rx_queue.pop()
    }
}

/// Termination reason for a failed CCM operation.
pub(super) fn crypto_reason(error: CryptoError) -> ErrorCode {
    match error {
        CryptoError::NoSessionKey => ErrorCode::PinOrKeyMissing,
        CryptoError::MicMismatch | CryptoError::CounterExhausted | CryptoError::PayloadTooLong => {
            ErrorCode::MicFailure
        }
    }
}
