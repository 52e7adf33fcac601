//! Link-Layer.
//!
//! This module contains the real-time part of a BLE controller: connections and their control
//! procedures, the non-connection roles, and the scheduler that shares a single radio between all
//! of them. The radio driver and the timer are supplied by the platform through [`Config`].
//!
//! Refer to the *Link Layer Specification* (Core Vol 6, Part B) for details and more graphics and
//! tables. If a field in a graphic is marked with `-`, it is set to 0 when sending and ignored when
//! receiving (the Core calls these "RFU" = Reserved for Future Use).
//!
//! # Operation
//!
//! The controller is driven by two entry points, both of which run to completion:
//!
//! * [`LinkLayer::update`] is called from the timer interrupt (and after any host call that
//!   changed the set of roles). It releases terminated connections, skips occurrences that can no
//!   longer be served, checks supervision timeouts, and programs the radio for the next task.
//! * [`LinkLayer::radio_done`] is called by the radio driver when a programmed operation ended. It
//!   hands a received packet to the task that is bound to the radio, and then schedules the next
//!   one.
//!
//! ```notrust
//!            update()                              radio_done(event)
//!               |                                         |
//!               v                                         v
//!   +-----------------------+   program()   +-----------------------+
//!   |       Scheduler       | ------------> |      Radio driver     |
//!   | (select, guard bands) |               | (TX/RX at time T on   |
//!   +-----------------------+               |  channel C, AA A)     |
//!         ^          |                      +-----------------------+
//!         | anchors  | kind                             |
//!         |          v                                  |
//!   +-----------------------+    receive() / next_tx_pdu()
//!   | Connection / roles    | <----------------------------+
//!   | (procedures, crypto)  |
//!   +-----------------------+ ---> host events, RX queues
//! ```
//!
//! Heavy background work (P-256 key agreement) never runs from these entry points. The host calls
//! [`LinkLayer::run_background`] from its idle loop.
//!
//! # Data Channel PDU
//!
//! A data channel PDU contains a 16-bit header, an optional `CTEInfo` octet and a variably-sized
//! payload. If the connection is encrypted and the payload contains at least 1 octet, a Message
//! Integrity Check (MIC) is appended at the end.
//!
//! ```notrust
//! LSB                                                           MSB
//! +-----------+-------------+----------------------+ - - - - - +
//! |  Header   |   CTEInfo   |        Payload       |    MIC    |
//! | (16 bits) |  (8 bits)   |   (0..=251 octets)   | (32 bits) |
//! +-----------+-------------+----------------------+ - - - - - +
//! ```
//!
//! Header:
//!
//! ```notrust
//! LSB                                                                        MSB
//! +----------+---------+---------+---------+---------+----------+--------------+
//! |   LLID   |  NESN   |   SN    |   MD    |   CP    |    -     |    Length    |
//! | (2 bits) | (1 bit) | (1 bit) | (1 bit) | (1 bit) | (2 bits) |   (8 bits)   |
//! +----------+---------+---------+---------+---------+----------+--------------+
//! ```
//!
//! `CTEInfo` is only present when `CP` is set. `Length` covers the payload and the MIC.
//!
//! [`Config`]: ../config/trait.Config.html
//! [`LinkLayer::update`]: struct.LinkLayer.html#method.update
//! [`LinkLayer::radio_done`]: struct.LinkLayer.html#method.radio_done
//! [`LinkLayer::run_background`]: struct.LinkLayer.html#method.run_background

pub mod advertising;
pub mod channel_map;
pub mod channel_selection;
pub mod connection;
mod control;
pub mod data;
pub mod device_address;
pub mod features;
pub mod llcp;
pub mod pool;
pub mod procedure;
pub mod queue;
pub mod roles;
pub mod scheduler;

#[cfg(test)]
mod tests;

use {
    self::{
        advertising::{
            is_valid_access_address, AdvPdu, ConnectRequestData, SleepClockAccuracy,
            ADVERTISING_ADDRESS, CRC_PRESET,
        },
        channel_map::ChannelMap,
        connection::{
            ConnParams, Connection, DataLength, EventCtx, TimingChange, VersionInfo,
            ESTABLISHMENT_EVENTS,
        },
        data::{CteInfo, CteType, DataPdu, Llid, MAX_PAYLOAD, MIC_SIZE},
        device_address::DeviceAddress,
        features::FeatureSet,
        pool::Pool,
        roles::{
            encode_pdu, AdvReport, Advertiser, AdvData, Initiator, PeriodicAdvertiser,
            PeriodicScanner, PeriodicSync, Scanner,
        },
        scheduler::{Scheduler, Selection, Task, TaskKind},
    },
    crate::{
        config::{Config, Params},
        ecdh::{EcdhOutcome, EcdhRequest, KeyAgreement, PublicKey, SharedSecret},
        error::{ErrorCode, HardwareError},
        phy::{AdvertisingChannel, DataChannel, Phy, PhySet},
        security::{self, rng::RandomSource, Key},
        time::{Duration, Instant, Timer},
        Error,
    },
    core::fmt,
    heapless::{Deque, Vec},
};

/// Maximum number of simultaneous connections.
pub const MAX_CONNECTIONS: usize = 8;

/// Max. PDU size in octets: header, `CTEInfo`, payload and MIC.
pub const MAX_PDU_SIZE: usize = 2 + 1 + MAX_PAYLOAD + MIC_SIZE;

/// Number of host events that can be pending.
pub const EVENT_QUEUE_DEPTH: usize = 16;

/// Radio time reserved for one advertising channel visit: the PDU, a request and our response.
const ADV_VISIT: Duration = Duration::from_micros(1_500);

/// On-air size of a `CONNECT_IND`: header, both addresses and `LLData`.
const CONNECT_IND_SIZE: usize = 2 + 6 + 6 + 22;

/// Receive window of a periodic scanner around the expected packet.
const PERIODIC_RX_MARGIN: Duration = Duration::from_micros(500);

/// An owned on-air PDU.
pub type PduBuf = Vec<u8, MAX_PDU_SIZE>;

/// Which side of a connection we are.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    /// Initiated the connection; transmits first in every connection event.
    Master,
    /// Accepted a connection from an advertising state.
    Slave,
}

/// Identifies a connection towards the host.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct ConnHandle(u16);

impl ConnHandle {
    pub fn from_index(index: usize) -> Self {
        ConnHandle(index as u16)
    }

    pub fn raw(&self) -> u16 {
        self.0
    }

    pub(crate) fn index(&self) -> usize {
        usize::from(self.0)
    }
}

impl fmt::Debug for ConnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where a radio operation takes place.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RadioChannel {
    Advertising(AdvertisingChannel),
    Data(DataChannel),
}

/// What the radio does once the start time is reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioOp {
    /// Transmit the PDU, then listen for a reply starting `T_IFS` after it.
    TransmitListen(PduBuf),

    /// Transmit the PDU and end the operation.
    Transmit(PduBuf),

    /// Listen for a packet that starts within `window`.
    Listen { window: Duration },
}

/// A command for the radio driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RadioCommand {
    /// Time at which the operation starts (first bit on air, or receiver ready).
    pub start: Instant,
    pub channel: RadioChannel,
    pub access_address: u32,
    /// Initialization value of the CRC-24 calculation. Only the low 24 bits are relevant.
    pub crc_init: u32,
    pub phy: Phy,
    pub op: RadioOp,
}

/// Outcome of a radio operation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RadioStatus {
    /// A packet was received.
    Received,
    /// A transmission ended, or nothing was received in time.
    Done,
    /// The radio failed. This halts the controller.
    Failed(HardwareError),
}

/// Completion report from the radio driver.
#[derive(Debug, Copy, Clone)]
pub struct RadioEvent<'a> {
    pub status: RadioStatus,
    /// Start of the received packet, or end of the operation when nothing was received.
    pub timestamp: Instant,
    /// The received PDU (header and payload, no CRC).
    pub pdu: &'a [u8],
    pub crc_ok: bool,
    pub rssi: i8,
}

impl<'a> RadioEvent<'a> {
    pub fn received(timestamp: Instant, pdu: &'a [u8], crc_ok: bool, rssi: i8) -> Self {
        Self {
            status: RadioStatus::Received,
            timestamp,
            pdu,
            crc_ok,
            rssi,
        }
    }

    pub fn done(timestamp: Instant) -> Self {
        Self {
            status: RadioStatus::Done,
            timestamp,
            pdu: &[],
            crc_ok: false,
            rssi: 0,
        }
    }
}

/// Trait for the radio driver.
///
/// The Link-Layer programs one operation at a time and is told about its end through
/// `LinkLayer::radio_done`.
pub trait Radio {
    /// Programs `cmd` to start at `cmd.start`.
    ///
    /// An error means the command was not accepted. The scheduler retries on its next pass.
    fn program(&mut self, cmd: &RadioCommand) -> Result<(), HardwareError>;

    /// Transmits `pdu` `T_IFS` after the end of the packet just reported as received, on the same
    /// channel and access address.
    fn respond(&mut self, pdu: &[u8]);

    /// Cancels the programmed operation. The driver does not report it as done.
    fn abort(&mut self);
}

/// Notifications for the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    ConnectionComplete {
        handle: ConnHandle,
        role: Role,
        peer: DeviceAddress,
        params: ConnParams,
    },
    DisconnectionComplete {
        handle: ConnHandle,
        reason: ErrorCode,
    },
    ConnectionUpdateComplete {
        handle: ConnHandle,
        status: ErrorCode,
        params: ConnParams,
    },
    RemoteFeatures {
        handle: ConnHandle,
        status: ErrorCode,
        features: FeatureSet,
    },
    RemoteVersion {
        handle: ConnHandle,
        version: VersionInfo,
    },
    EncryptionChange {
        handle: ConnHandle,
        status: ErrorCode,
        enabled: bool,
    },
    EncryptionKeyRefresh {
        handle: ConnHandle,
        status: ErrorCode,
    },
    /// The peer started encryption. Answer with `ltk_reply` or `ltk_negative_reply`.
    LtkRequest {
        handle: ConnHandle,
        rand: [u8; 8],
        ediv: u16,
    },
    DataLengthChange {
        handle: ConnHandle,
        length: DataLength,
    },
    PhyUpdateComplete {
        handle: ConnHandle,
        status: ErrorCode,
        tx: Phy,
        rx: Phy,
    },
    AuthenticatedPayloadTimeoutExpired {
        handle: ConnHandle,
    },
    CteRequestFailed {
        handle: ConnHandle,
        status: ErrorCode,
    },
    CteResponse {
        handle: ConnHandle,
        info: CteInfo,
        rssi: i8,
    },
    AdvertisingReport(AdvReport),
    PeriodicReport {
        rssi: i8,
        data: AdvData,
    },
    PeriodicSyncLost,
    ReadLocalP256Complete {
        status: ErrorCode,
        key: Option<PublicKey>,
    },
    DhKeyComplete {
        status: ErrorCode,
        key: Option<SharedSecret>,
    },
    /// The controller halted.
    HardwareError(HardwareError),
}

/// Pending host events, oldest first.
pub struct EventQueue {
    events: Deque<HostEvent, EVENT_QUEUE_DEPTH>,
}

impl EventQueue {
    pub const fn new() -> Self {
        Self {
            events: Deque::new(),
        }
    }

    /// Queues `event`, dropping it if the host fell behind.
    pub fn push(&mut self, event: HostEvent) {
        if let Err(event) = self.events.push_back(event) {
            warn!("host event queue full, dropping {:?}", event);
        }
    }

    pub fn pop(&mut self) -> Option<HostEvent> {
        self.events.pop_front()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Air time of an on-air PDU of `len` octets (header included).
fn air_time(phy: Phy, len: usize) -> Duration {
    let payload = len.saturating_sub(2) as u16;
    Duration::from_micros(u32::from(phy.packet_time(payload)))
}

/// Air time of the longest legacy advertising PDU.
fn max_adv_air_time() -> Duration {
    air_time(Phy::Le1M, 2 + 6 + advertising::MAX_ADV_DATA)
}

/// Shortens a receive window by the time needed after the last packet that may start in it.
fn shorten(window: Duration, tail: Duration) -> Duration {
    Duration::from_micros(window.as_micros().saturating_sub(tail.as_micros()))
}

/// Implementation of the real-time BLE Link-Layer logic.
///
/// This is the controller context: it owns the platform collaborators, the task scheduler, the
/// connection pool and the role state. Users must provide the platform bindings by implementing
/// [`Config`].
///
/// [`Config`]: ../config/trait.Config.html
pub struct LinkLayer<C: Config> {
    address: DeviceAddress,
    params: Params,
    timer: C::Timer,
    radio: C::Radio,
    rng: RandomSource<C::Trng>,
    ecdh: KeyAgreement<C::EcdhProvider>,
    scheduler: Scheduler<C::SecondaryPolicy>,
    connections: Pool<Connection, MAX_CONNECTIONS>,
    events: EventQueue,
    host_channel_map: ChannelMap,
    advertiser: Option<Advertiser>,
    scanner: Option<Scanner>,
    initiator: Option<Initiator>,
    periodic_advertiser: Option<PeriodicAdvertiser>,
    periodic_scanner: Option<PeriodicScanner>,
    halted: bool,
}

impl<C: Config> LinkLayer<C> {
    /// Creates a new Link-Layer.
    ///
    /// # Parameters
    ///
    /// * **`address`**: The device address to advertise and initiate with.
    /// * **`params`**: Run-time controller parameters.
    /// * **`timer`**, **`radio`**, **`trng`**, **`ecdh`**: Platform collaborators.
    /// * **`policy`**: Decides between secondary roles due at the same time.
    pub fn new(
        address: DeviceAddress,
        params: Params,
        timer: C::Timer,
        radio: C::Radio,
        trng: C::Trng,
        ecdh: C::EcdhProvider,
        policy: C::SecondaryPolicy,
    ) -> Self {
        trace!("new LinkLayer, dev={:?}", address);
        Self {
            address,
            params,
            timer,
            radio,
            rng: RandomSource::new(trng),
            ecdh: KeyAgreement::new(ecdh),
            scheduler: Scheduler::new(policy, &params),
            connections: Pool::new(),
            events: EventQueue::new(),
            host_channel_map: ChannelMap::with_all_channels(),
            advertiser: None,
            scanner: None,
            initiator: None,
            periodic_advertiser: None,
            periodic_scanner: None,
            halted: false,
        }
    }

    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Returns a reference to the timer instance used by the Link-Layer.
    pub fn timer(&mut self) -> &mut C::Timer {
        &mut self.timer
    }

    /// Returns a reference to the radio driver.
    pub fn radio(&mut self) -> &mut C::Radio {
        &mut self.radio
    }

    pub fn scheduler(&self) -> &Scheduler<C::SecondaryPolicy> {
        &self.scheduler
    }

    /// Returns whether a hardware error stopped the controller.
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    fn check_running(&self) -> Result<(), Error> {
        if self.halted {
            Err(Error::Halted)
        } else {
            Ok(())
        }
    }

    /// Takes the oldest pending host event.
    pub fn poll_event(&mut self) -> Option<HostEvent> {
        self.events.pop()
    }

    /// Runs a scheduling pass.
    ///
    /// Returns the time at which `update` must be called again if the radio couldn't be
    /// programmed. Otherwise the next call is due when the radio reports completion or the host
    /// changes the active roles.
    pub fn update(&mut self) -> Option<Instant> {
        if self.halted {
            return None;
        }
        let now = self.timer.now();
        self.schedule(now)
    }

    /// Processes the end of the programmed radio operation.
    pub fn radio_done(&mut self, event: RadioEvent<'_>) -> Option<Instant> {
        if self.halted {
            return None;
        }
        if let RadioStatus::Failed(code) = event.status {
            self.hardware_error(code);
            return None;
        }
        let now = self.timer.now();
        let kind = match self
            .scheduler
            .current()
            .and_then(|index| self.scheduler.task(index))
        {
            Some(task) => task.kind,
            None => {
                debug!("radio event without a bound task: {:?}", event.status);
                return self.schedule(now);
            }
        };

        match kind {
            TaskKind::Connection(handle) => self.connection_event_done(handle, &event, now),
            TaskKind::Advertiser => self.advertiser_done(&event, now),
            TaskKind::Scanner => self.scanner_done(&event),
            TaskKind::Initiator => self.initiator_done(&event, now),
            TaskKind::PeriodicAdvertiser => self.periodic_advertiser_done(&event),
            TaskKind::PeriodicScanner => self.periodic_scanner_done(&event),
        }
        self.schedule(now)
    }

    fn schedule(&mut self, now: Instant) -> Option<Instant> {
        loop {
            self.release_terminated();
            if self.scheduler.current().is_some() {
                return None;
            }
            let earliest = self.scheduler.earliest(now);
            self.skip_overdue(earliest, now);
            self.supervise();
            self.release_terminated();

            let selection = self.scheduler.select(earliest)?;
            let cmd = match self.build_command(&selection, now) {
                Some(cmd) => cmd,
                None => {
                    self.drop_orphan(&selection);
                    continue;
                }
            };
            match self.radio.program(&cmd) {
                Ok(()) => {
                    trace!(
                        "programmed {:?} at {} on {:?}",
                        selection.kind,
                        selection.start,
                        cmd.channel
                    );
                    self.scheduler.begin(&selection);
                    return None;
                }
                Err(e) => {
                    warn!("failed to program radio for {:?}: {}", selection.kind, e);
                    if self
                        .scheduler
                        .programming_failed(now, self.params.ctrl_proc_timeout)
                    {
                        self.hardware_error(HardwareError::PROGRAMMING_TIMEOUT);
                        return None;
                    }
                    return Some(now + self.scheduler.slot());
                }
            }
        }
    }

    /// Aborts a radio operation that hasn't started yet and schedules again. Called after the
    /// set of roles changed.
    fn reschedule(&mut self) {
        let now = self.timer.now();
        let reprogram_by = now + self.params.pre_guard;
        let pending = self
            .scheduler
            .current()
            .and_then(|index| self.scheduler.task(index))
            .and_then(|task| task.last_start)
            .map_or(false, |start| start.is_after(reprogram_by));
        if pending {
            self.radio.abort();
            self.scheduler.abort_current();
        }
        let _ = self.schedule(now);
    }

    /// Builds the radio command for `selection`. Returns `None` if its task has nothing to run.
    fn build_command(&mut self, selection: &Selection, now: Instant) -> Option<RadioCommand> {
        let (channel, access_address, crc_init, phy, op) = match selection.kind {
            TaskKind::Connection(handle) => {
                let min_interval = self.scheduler.min_interval();
                let conn = self.connections.get_mut(handle.index())?;
                if conn.is_terminating() {
                    return None;
                }
                let mut ctx = EventCtx {
                    now,
                    rng: &mut self.rng,
                    events: &mut self.events,
                    min_interval,
                };
                let channel = conn.prepare_event(&mut ctx);
                let (phy, op) = match conn.role() {
                    Role::Master => {
                        let pdu = conn.next_tx_pdu(&mut ctx);
                        match encode_pdu(|buf| pdu.encode(buf)) {
                            Ok(raw) => (conn.phy().tx, RadioOp::TransmitListen(raw)),
                            Err(e) => {
                                error!("[{:?}] can't encode {:?}: {}", handle, pdu, e);
                                conn.terminate(ErrorCode::UnspecifiedError);
                                return None;
                            }
                        }
                    }
                    Role::Slave => (
                        conn.phy().rx,
                        RadioOp::Listen {
                            window: selection.duration,
                        },
                    ),
                };
                if conn.is_terminating() {
                    return None;
                }
                (
                    RadioChannel::Data(channel),
                    conn.access_address(),
                    conn.crc_init(),
                    phy,
                    op,
                )
            }
            TaskKind::Advertiser => {
                let ch_sel = self
                    .params
                    .features
                    .contains(FeatureSet::CHANNEL_SELECTION_ALGORITHM_2);
                let adv = self.advertiser.as_mut()?;
                adv.visit_started(selection.start);
                let pdu = match adv.pdu(self.address, ch_sel) {
                    Ok(pdu) => pdu,
                    Err(e) => {
                        error!("can't encode advertising PDU: {}", e);
                        return None;
                    }
                };
                let op = if adv.is_scannable() {
                    RadioOp::TransmitListen(pdu)
                } else {
                    RadioOp::Transmit(pdu)
                };
                (
                    RadioChannel::Advertising(adv.channel()),
                    ADVERTISING_ADDRESS,
                    CRC_PRESET,
                    Phy::Le1M,
                    op,
                )
            }
            TaskKind::Scanner => (
                RadioChannel::Advertising(self.scanner.as_ref()?.channel()),
                ADVERTISING_ADDRESS,
                CRC_PRESET,
                Phy::Le1M,
                RadioOp::Listen {
                    window: shorten(selection.duration, max_adv_air_time()),
                },
            ),
            TaskKind::Initiator => (
                RadioChannel::Advertising(self.initiator.as_ref()?.channel()),
                ADVERTISING_ADDRESS,
                CRC_PRESET,
                Phy::Le1M,
                RadioOp::Listen {
                    // A packet starting late in the window must still be answered inside the slot.
                    window: shorten(
                        selection.duration,
                        max_adv_air_time()
                            + Duration::T_IFS
                            + air_time(Phy::Le1M, CONNECT_IND_SIZE),
                    ),
                },
            ),
            TaskKind::PeriodicAdvertiser => {
                let padv = self.periodic_advertiser.as_mut()?;
                let pdu = padv.pdu(self.address).ok()?;
                (
                    RadioChannel::Data(padv.train.channel()),
                    padv.train.access_address,
                    padv.train.crc_init,
                    Phy::Le1M,
                    RadioOp::Transmit(pdu),
                )
            }
            TaskKind::PeriodicScanner => {
                let pscan = self.periodic_scanner.as_mut()?;
                (
                    RadioChannel::Data(pscan.train.channel()),
                    pscan.train.access_address,
                    pscan.train.crc_init,
                    Phy::Le1M,
                    RadioOp::Listen {
                        window: selection.duration,
                    },
                )
            }
        };
        Some(RadioCommand {
            start: selection.start,
            channel,
            access_address,
            crc_init,
            phy,
            op,
        })
    }

    /// Frees the task of `selection` if nothing backs it anymore.
    fn drop_orphan(&mut self, selection: &Selection) {
        match selection.kind {
            // Terminating connections are released on the next pass.
            TaskKind::Connection(handle) if self.connections.is_used(handle.index()) => return,
            TaskKind::Connection(_) => {}
            TaskKind::Advertiser => self.advertiser = None,
            TaskKind::Scanner => self.scanner = None,
            TaskKind::Initiator => self.initiator = None,
            TaskKind::PeriodicAdvertiser => self.periodic_advertiser = None,
            TaskKind::PeriodicScanner => self.periodic_scanner = None,
        }
        warn!("dropping task for {:?}", selection.kind);
        self.scheduler.free(selection.task);
    }

    /// Closes every anchored occurrence that can no longer be served before `earliest`.
    fn skip_overdue(&mut self, earliest: Instant, now: Instant) {
        let min_interval = self.scheduler.min_interval();
        let local_ppm = self.params.sleep_clock_ppm;
        while let Some(index) = self.scheduler.overdue(earliest) {
            let kind = match self.scheduler.task(index) {
                Some(task) => task.kind,
                None => return,
            };
            match kind {
                TaskKind::Connection(handle) => {
                    let conn = match self.connections.get_mut(handle.index()) {
                        Some(conn) => conn,
                        None => {
                            self.scheduler.free(index);
                            continue;
                        }
                    };
                    let mut ctx = EventCtx {
                        now,
                        rng: &mut self.rng,
                        events: &mut self.events,
                        min_interval,
                    };
                    let change = conn.close_event(false, &mut ctx);
                    self.scheduler.skip(index, change);
                    debug!("[{:?}] missed connection event", handle);
                    if let Some(task) = self.scheduler.task_mut(index) {
                        update_slave_window(task, conn, change, local_ppm, self.params.slot_unit);
                    }
                }
                TaskKind::PeriodicAdvertiser => {
                    if let Some(padv) = &mut self.periodic_advertiser {
                        padv.train.event_done();
                    }
                    self.scheduler.skip(index, None);
                }
                TaskKind::PeriodicScanner => {
                    let synced = self
                        .periodic_scanner
                        .as_mut()
                        .map_or(false, |pscan| pscan.event_done(false));
                    if synced {
                        self.scheduler.skip(index, None);
                    } else {
                        self.periodic_sync_lost(index);
                    }
                }
                TaskKind::Advertiser | TaskKind::Scanner | TaskKind::Initiator => {
                    self.scheduler.skip(index, None);
                }
            }
        }
    }

    /// Terminates connections whose supervision timer expired.
    fn supervise(&mut self) {
        for (_, task) in self.scheduler.tasks() {
            let handle = match task.kind {
                TaskKind::Connection(handle) => handle,
                _ => continue,
            };
            let conn = match self.connections.get_mut(handle.index()) {
                Some(conn) => conn,
                None => continue,
            };
            if conn.is_establishing() && task.missed >= ESTABLISHMENT_EVENTS {
                warn!("[{:?}] establishment failed", handle);
                conn.terminate(ErrorCode::ConnectionFailedToBeEstablished);
            } else if task.missed >= conn.lsto_events() {
                warn!("[{:?}] supervision timeout after {} events", handle, task.missed);
                conn.terminate(ErrorCode::ConnectionTimeout);
            }
        }
    }

    /// Releases terminated connections and tells the host.
    fn release_terminated(&mut self) {
        let mut released: Vec<(ConnHandle, ErrorCode), MAX_CONNECTIONS> = Vec::new();
        for (_, conn) in self.connections.iter() {
            if let Some(reason) = conn.termination_reason() {
                // Capacity matches the pool.
                let _ = released.push((conn.handle(), reason));
            }
        }
        for (handle, reason) in released {
            if let Some(index) = self.scheduler.find(TaskKind::Connection(handle)) {
                if self.scheduler.current() == Some(index) {
                    self.radio.abort();
                    self.scheduler.abort_current();
                }
                self.scheduler.free(index);
            }
            self.connections.free(handle.index());
            info!("[{:?}] released: {:?}", handle, reason);
            self.events
                .push(HostEvent::DisconnectionComplete { handle, reason });
        }
    }

    fn hardware_error(&mut self, code: HardwareError) {
        error!("{}, halting controller", code);
        self.radio.abort();
        self.scheduler.abort_current();
        self.halted = true;
        self.events.push(HostEvent::HardwareError(code));
    }

    fn connection_event_done(&mut self, handle: ConnHandle, event: &RadioEvent<'_>, now: Instant) {
        let min_interval = self.scheduler.min_interval();
        let local_ppm = self.params.sleep_clock_ppm;
        let slot_unit = self.params.slot_unit;
        let conn = match self.connections.get_mut(handle.index()) {
            Some(conn) => conn,
            None => {
                self.scheduler.abort_current();
                return;
            }
        };
        let mut ctx = EventCtx {
            now,
            rng: &mut self.rng,
            events: &mut self.events,
            min_interval,
        };

        let mut synced = false;
        let mut end = event.timestamp;
        if event.status == RadioStatus::Received {
            conn.set_rssi(event.rssi);
            synced = conn.receive(event.pdu, event.crc_ok, &mut ctx);
            end += air_time(conn.phy().rx, event.pdu.len());
            if conn.role() == Role::Slave {
                // The slave answers every packet, acknowledging a termination too.
                let pdu = conn.next_tx_pdu(&mut ctx);
                match encode_pdu(|buf| pdu.encode(buf)) {
                    Ok(raw) => {
                        self.radio.respond(&raw);
                        end += Duration::T_IFS + air_time(conn.phy().tx, raw.len());
                    }
                    Err(e) => error!("[{:?}] can't encode {:?}: {}", handle, pdu, e),
                }
            }
        }

        if synced && conn.role() == Role::Slave {
            // Resynchronize to the master's actual anchor.
            let scheduler = &mut self.scheduler;
            if let Some(task) = scheduler
                .current()
                .and_then(|index| scheduler.task_mut(index))
            {
                task.anchor = event.timestamp;
                task.duration = slot_unit;
            }
        }
        let change = conn.close_event(true, &mut ctx);
        if let Some(index) = self
            .scheduler
            .complete(end, synced, change, Duration::from_micros(0))
        {
            if let Some(task) = self.scheduler.task_mut(index) {
                update_slave_window(task, conn, change, local_ppm, slot_unit);
            }
        }
    }

    fn advertiser_done(&mut self, event: &RadioEvent<'_>, now: Instant) {
        let mut request = None;
        if event.status == RadioStatus::Received && event.crc_ok {
            match AdvPdu::decode(event.pdu) {
                Ok((header, pdu)) => {
                    trace!("ADV<- {:?}", pdu);
                    request = Some((header.ch_sel(), pdu));
                }
                Err(e) => debug!("undecodable advertising PDU: {}", e),
            }
        }
        let adv = match &mut self.advertiser {
            Some(adv) => adv,
            None => {
                self.scheduler.abort_current();
                return;
            }
        };

        let mut end = event.timestamp;
        if event.status == RadioStatus::Received {
            end += air_time(Phy::Le1M, event.pdu.len());
        }
        match request {
            Some((_, AdvPdu::ScanReq { adv_a, scan_a })) if adv_a == self.address => {
                if adv.is_scannable() {
                    match adv.scan_response(self.address) {
                        Ok(rsp) => {
                            self.radio.respond(&rsp);
                            end += Duration::T_IFS + air_time(Phy::Le1M, rsp.len());
                            debug!("-> SCAN RSP to {:?}", scan_a);
                        }
                        Err(e) => error!("can't encode scan response: {}", e),
                    }
                }
            }
            Some((ch_sel, AdvPdu::ConnectInd { init_a, adv_a, lldata }))
                if adv_a == self.address && adv.connectable =>
            {
                if let Err(e) = lldata.validate() {
                    debug!("ignoring CONNECT_IND with invalid LLData: {}", e);
                } else if let Err(e) = self.scheduler.admit_connection(lldata.interval) {
                    debug!("ignoring CONNECT_IND: {}", e);
                } else {
                    // Connectable advertising ends with the connection.
                    self.scheduler.complete(end, false, None, Duration::from_micros(0));
                    self.stop_advertising_task();
                    let csa2 = ch_sel
                        && self
                            .params
                            .features
                            .contains(FeatureSet::CHANNEL_SELECTION_ALGORITHM_2);
                    if let Err(e) = self.establish(Role::Slave, init_a, &lldata, csa2, end, now) {
                        warn!("can't accept connection: {}", e);
                    }
                    return;
                }
            }
            _ => {}
        }

        let adv_delay = Duration::from_micros(self.rng.jitter() % 10_001);
        let next = adv.next_visit(end, adv_delay);
        if let Some(index) = self
            .scheduler
            .complete(end, false, None, Duration::from_micros(0))
        {
            if let Some(task) = self.scheduler.task_mut(index) {
                task.anchor = next;
            }
        }
    }

    fn scanner_done(&mut self, event: &RadioEvent<'_>) {
        if event.status == RadioStatus::Received && event.crc_ok {
            if let Ok((_, pdu)) = AdvPdu::decode(event.pdu) {
                if let Some(report) = AdvReport::from_pdu(&pdu, event.rssi) {
                    self.events.push(HostEvent::AdvertisingReport(report));
                }
            }
        }
        if let Some(scanner) = &mut self.scanner {
            scanner.window_done();
        }
        let end = match event.status {
            RadioStatus::Received => event.timestamp + air_time(Phy::Le1M, event.pdu.len()),
            _ => event.timestamp,
        };
        self.scheduler
            .complete(end, false, None, Duration::from_micros(0));
    }

    fn initiator_done(&mut self, event: &RadioEvent<'_>, now: Instant) {
        let received = event.status == RadioStatus::Received;
        let end = if received {
            event.timestamp + air_time(Phy::Le1M, event.pdu.len())
        } else {
            event.timestamp
        };
        let init = match &mut self.initiator {
            Some(init) => {
                init.window_done();
                init.clone()
            }
            None => {
                self.scheduler.abort_current();
                return;
            }
        };
        let target = if received && event.crc_ok {
            AdvPdu::decode(event.pdu)
                .ok()
                .filter(|(_, pdu)| init.accepts(pdu, self.address))
        } else {
            None
        };
        let (header, pdu) = match target {
            Some(target) => target,
            None => {
                self.scheduler
                    .complete(end, false, None, Duration::from_micros(0));
                return;
            }
        };
        if let Err(e) = self.scheduler.admit_connection(init.params.interval) {
            debug!("not connecting to {:?}: {}", pdu.advertiser(), e);
            self.scheduler
                .complete(end, false, None, Duration::from_micros(0));
            return;
        }

        let access_address = self.new_access_address();
        let crc_init = self.rng.jitter() & 0xFF_FFFF;
        let hop = 5 + (self.rng.jitter() % 12) as u8;

        // The transmit window opens 1.25 ms plus WinOffset after the end of the CONNECT_IND.
        let conn_ind_end = end + Duration::T_IFS + air_time(Phy::Le1M, CONNECT_IND_SIZE);
        self.scheduler
            .complete(conn_ind_end, false, None, Duration::from_micros(0));
        let base = conn_ind_end + Duration::CONN_UNIT;
        let interval = init.params.interval();
        let max_offset = u32::from(init.params.interval) - 1;
        let mut win_offset = 0;
        let mut candidate = base;
        for _ in 0..MAX_CONNECTIONS {
            let free = self.scheduler.free_anchor(candidate, interval);
            win_offset = (free - base).div_ceil(Duration::CONN_UNIT).min(max_offset);
            candidate = base + Duration::CONN_UNIT * win_offset;
            if candidate == free {
                break;
            }
        }

        let lldata = init.connect_request(
            access_address,
            crc_init,
            hop,
            win_offset as u16,
            self.host_channel_map,
            SleepClockAccuracy::from_ppm(self.params.sleep_clock_ppm),
        );
        let own_csa2 = self
            .params
            .features
            .contains(FeatureSet::CHANNEL_SELECTION_ALGORITHM_2);
        let peer = pdu.advertiser();
        let conn_ind = AdvPdu::ConnectInd {
            init_a: self.address,
            adv_a: peer,
            lldata,
        };
        let raw = match encode_pdu(|buf| conn_ind.encode(own_csa2, buf)) {
            Ok(raw) => raw,
            Err(e) => {
                error!("can't encode CONNECT_IND: {}", e);
                return;
            }
        };
        self.radio.respond(&raw);
        debug!("-> CONNECT_IND {:?}", conn_ind);

        let csa2 = own_csa2 && header.ch_sel();
        self.stop_initiator_task();
        if let Err(e) = self.establish(Role::Master, peer, &lldata, csa2, conn_ind_end, now) {
            warn!("can't create connection: {}", e);
        }
    }

    fn periodic_advertiser_done(&mut self, event: &RadioEvent<'_>) {
        if let Some(padv) = &mut self.periodic_advertiser {
            padv.train.event_done();
        }
        self.scheduler
            .complete(event.timestamp, true, None, Duration::from_micros(0));
    }

    fn periodic_scanner_done(&mut self, event: &RadioEvent<'_>) {
        let mut received = false;
        if event.status == RadioStatus::Received && event.crc_ok {
            if let Ok((_, AdvPdu::AdvNonconnInd { data, .. })) = AdvPdu::decode(event.pdu) {
                received = true;
                if let Ok(data) = Vec::from_slice(data) {
                    self.events.push(HostEvent::PeriodicReport {
                        rssi: event.rssi,
                        data,
                    });
                }
            }
        }
        let synced = self
            .periodic_scanner
            .as_mut()
            .map_or(false, |pscan| pscan.event_done(received));
        if let Some(index) = self
            .scheduler
            .complete(event.timestamp, received, None, Duration::from_micros(0))
        {
            if !synced {
                self.periodic_sync_lost(index);
            }
        }
    }

    fn periodic_sync_lost(&mut self, index: usize) {
        info!("periodic sync lost");
        self.scheduler.free(index);
        self.periodic_scanner = None;
        self.events.push(HostEvent::PeriodicSyncLost);
    }

    /// Generates an access address that follows the Core rules and isn't in use.
    fn new_access_address(&mut self) -> u32 {
        loop {
            let aa = self.rng.jitter();
            let in_use = self
                .connections
                .iter()
                .any(|(_, conn)| conn.access_address() == aa);
            if is_valid_access_address(aa) && !in_use {
                return aa;
            }
        }
    }

    /// Creates a connection from the `LLData` of a `CONNECT_IND` that ended at `conn_ind_end`.
    fn establish(
        &mut self,
        role: Role,
        peer: DeviceAddress,
        lldata: &ConnectRequestData,
        csa2: bool,
        conn_ind_end: Instant,
        now: Instant,
    ) -> Result<ConnHandle, Error> {
        let index = (0..MAX_CONNECTIONS)
            .find(|&i| !self.connections.is_used(i))
            .ok_or(Error::ResourceExhausted)?;
        let handle = ConnHandle::from_index(index);

        let window_start = conn_ind_end + Duration::CONN_UNIT + lldata.win_offset();
        let mut task = Task::new(
            TaskKind::Connection(handle),
            window_start,
            lldata.interval(),
            self.params.slot_unit,
        );
        let conn = Connection::new(handle, role, peer, lldata, csa2, &self.params, now);
        if role == Role::Slave {
            // The master may transmit anywhere in the transmit window.
            task.duration = self.params.slot_unit + lldata.win_size();
            task.widening = conn.window_widening(Duration::CONN_UNIT, self.params.sleep_clock_ppm);
        }
        let task_index = self.scheduler.alloc(task)?;
        if self.connections.alloc_from(index, conn).is_err() {
            self.scheduler.free(task_index);
            return Err(Error::ResourceExhausted);
        }

        info!(
            "[{:?}] connection created as {:?} with {:?}, {:?}",
            handle, role, peer, lldata
        );
        self.events.push(HostEvent::ConnectionComplete {
            handle,
            role,
            peer,
            params: ConnParams {
                interval: lldata.interval,
                latency: lldata.latency,
                timeout: lldata.timeout,
            },
        });
        Ok(handle)
    }

    fn stop_advertising_task(&mut self) {
        self.advertiser = None;
        if let Some(index) = self.scheduler.find(TaskKind::Advertiser) {
            self.scheduler.free(index);
        }
    }

    fn stop_initiator_task(&mut self) {
        self.initiator = None;
        if let Some(index) = self.scheduler.find(TaskKind::Initiator) {
            self.scheduler.free(index);
        }
    }

    /// Stops the role running as `kind`, aborting its radio operation if it is bound.
    fn stop_role(&mut self, kind: TaskKind) -> Result<(), Error> {
        self.check_running()?;
        let index = self.scheduler.find(kind).ok_or(Error::InvalidState)?;
        if self.scheduler.current() == Some(index) {
            self.radio.abort();
            self.scheduler.abort_current();
        }
        self.scheduler.free(index);
        match kind {
            TaskKind::Advertiser => self.advertiser = None,
            TaskKind::Scanner => self.scanner = None,
            TaskKind::Initiator => self.initiator = None,
            TaskKind::PeriodicAdvertiser => self.periodic_advertiser = None,
            TaskKind::PeriodicScanner => self.periodic_scanner = None,
            TaskKind::Connection(_) => {}
        }
        self.reschedule();
        Ok(())
    }

    /// Starts legacy advertising.
    ///
    /// Connectable advertising stops once a connection was established from it.
    pub fn start_advertising(
        &mut self,
        interval: Duration,
        connectable: bool,
        adv_data: &[u8],
        scan_data: &[u8],
    ) -> Result<(), Error> {
        self.check_running()?;
        if self.advertiser.is_some() {
            return Err(Error::InvalidState);
        }
        let adv = Advertiser::new(interval, connectable, adv_data, scan_data)?;
        let start = self.scheduler.earliest(self.timer.now());
        self.scheduler
            .alloc(Task::new(TaskKind::Advertiser, start, interval, ADV_VISIT))?;
        debug!("start advertising: {:?}", adv);
        self.advertiser = Some(adv);
        self.reschedule();
        Ok(())
    }

    pub fn stop_advertising(&mut self) -> Result<(), Error> {
        self.stop_role(TaskKind::Advertiser)
    }

    pub fn is_advertising(&self) -> bool {
        self.advertiser.is_some()
    }

    /// Starts passive scanning. Every scan window reports at most one advertising PDU.
    pub fn start_scanning(&mut self, interval: Duration, window: Duration) -> Result<(), Error> {
        self.check_running()?;
        if self.scanner.is_some() {
            return Err(Error::InvalidState);
        }
        let scanner = Scanner::new(interval, window)?;
        let start = self.scheduler.earliest(self.timer.now());
        self.scheduler
            .alloc(Task::new(TaskKind::Scanner, start, interval, window))?;
        self.scanner = Some(scanner);
        self.reschedule();
        Ok(())
    }

    pub fn stop_scanning(&mut self) -> Result<(), Error> {
        self.stop_role(TaskKind::Scanner)
    }

    /// Starts initiating a connection to `peer` (or the first connectable advertiser).
    ///
    /// Fails with `ResourceExhausted` if the scheduler can't service another connection with
    /// `params`.
    pub fn create_connection(
        &mut self,
        peer: Option<DeviceAddress>,
        scan_interval: Duration,
        scan_window: Duration,
        params: ConnParams,
    ) -> Result<(), Error> {
        self.check_running()?;
        if self.initiator.is_some() {
            return Err(Error::InvalidState);
        }
        let init = Initiator::new(peer, scan_interval, scan_window, params)?;
        self.scheduler.admit_connection(params.interval)?;
        if self.connections.len() == MAX_CONNECTIONS {
            return Err(Error::ResourceExhausted);
        }
        let start = self.scheduler.earliest(self.timer.now());
        self.scheduler.alloc(Task::new(
            TaskKind::Initiator,
            start,
            scan_interval,
            scan_window,
        ))?;
        self.initiator = Some(init);
        self.reschedule();
        Ok(())
    }

    pub fn cancel_create_connection(&mut self) -> Result<(), Error> {
        self.stop_role(TaskKind::Initiator)
    }

    /// Starts periodic advertising with `data`.
    pub fn start_periodic_advertising(
        &mut self,
        interval: Duration,
        data: &[u8],
    ) -> Result<(), Error> {
        self.check_running()?;
        if self.periodic_advertiser.is_some() {
            return Err(Error::InvalidState);
        }
        let access_address = self.new_access_address();
        let crc_init = self.rng.jitter() & 0xFF_FFFF;
        let padv = PeriodicAdvertiser::new(
            access_address,
            crc_init,
            self.host_channel_map,
            interval,
            data,
        )?;
        let start = self.scheduler.earliest(self.timer.now());
        let duration = air_time(Phy::Le1M, 2 + 6 + data.len());
        self.scheduler.alloc(Task::new(
            TaskKind::PeriodicAdvertiser,
            start,
            interval,
            duration,
        ))?;
        self.periodic_advertiser = Some(padv);
        self.reschedule();
        Ok(())
    }

    pub fn stop_periodic_advertising(&mut self) -> Result<(), Error> {
        self.stop_role(TaskKind::PeriodicAdvertiser)
    }

    /// Returns the sync information of the next periodic advertising event.
    pub fn periodic_sync_info(&self) -> Option<PeriodicSync> {
        let padv = self.periodic_advertiser.as_ref()?;
        let index = self.scheduler.find(TaskKind::PeriodicAdvertiser)?;
        let task = self.scheduler.task(index)?;
        Some(padv.sync_info(task.anchor))
    }

    /// Synchronizes to a periodic advertising train.
    pub fn sync_periodic(&mut self, sync: &PeriodicSync) -> Result<(), Error> {
        self.check_running()?;
        if self.periodic_scanner.is_some() {
            return Err(Error::InvalidState);
        }
        let mut pscan = PeriodicScanner::new(sync)?;
        let earliest = self.scheduler.earliest(self.timer.now());
        let mut anchor = sync.anchor - PERIODIC_RX_MARGIN;
        while anchor.is_before(earliest) {
            anchor += sync.interval;
            pscan.train.event_done();
        }
        let window = PERIODIC_RX_MARGIN * 2 + air_time(Phy::Le1M, 2 + 6 + advertising::MAX_ADV_DATA);
        self.scheduler.alloc(Task::new(
            TaskKind::PeriodicScanner,
            anchor,
            sync.interval,
            window,
        ))?;
        self.periodic_scanner = Some(pscan);
        self.reschedule();
        Ok(())
    }

    pub fn terminate_sync(&mut self) -> Result<(), Error> {
        self.stop_role(TaskKind::PeriodicScanner)
    }

    /// Sets the channels the host considers usable and starts a channel map update on every
    /// connection we are master of.
    pub fn set_host_channel_map(&mut self, map: ChannelMap) -> Result<(), Error> {
        self.check_running()?;
        if !map.is_valid() {
            return Err(Error::InvalidValue);
        }
        self.host_channel_map = map;
        for (_, conn) in self.connections.iter_mut() {
            if conn.role() == Role::Master && !conn.is_terminating() {
                if let Err(e) = conn.set_channel_map(map) {
                    warn!("[{:?}] channel map update not started: {}", conn.handle(), e);
                }
            }
        }
        Ok(())
    }

    pub fn connection(&self, handle: ConnHandle) -> Option<&Connection> {
        self.connections.get(handle.index())
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> + '_ {
        self.connections.iter().map(|(_, conn)| conn)
    }

    fn conn_mut(&mut self, handle: ConnHandle) -> Result<&mut Connection, Error> {
        self.check_running()?;
        self.connections
            .get_mut(handle.index())
            .ok_or(Error::UnknownConnection)
    }

    /// Terminates a connection with `reason` (usually `RemoteUserTerminated`).
    pub fn disconnect(&mut self, handle: ConnHandle, reason: ErrorCode) -> Result<(), Error> {
        self.conn_mut(handle)?.disconnect(reason)
    }

    /// Requests new connection parameters. Intervals are in 1.25 ms units, the timeout in 10 ms
    /// units.
    pub fn update_connection(
        &mut self,
        handle: ConnHandle,
        interval_min: u16,
        interval_max: u16,
        latency: u16,
        timeout: u16,
    ) -> Result<(), Error> {
        let min_interval = self.scheduler.min_interval();
        self.conn_mut(handle)?.update_connection(
            interval_min,
            interval_max,
            latency,
            timeout,
            min_interval,
        )
    }

    pub fn read_remote_features(&mut self, handle: ConnHandle) -> Result<(), Error> {
        self.conn_mut(handle)?.read_remote_features()
    }

    pub fn read_remote_version(&mut self, handle: ConnHandle) -> Result<(), Error> {
        self.conn_mut(handle)?.read_remote_version()
    }

    /// Starts or refreshes encryption on a connection we are master of.
    pub fn start_encryption(
        &mut self,
        handle: ConnHandle,
        ltk: Key,
        rand: [u8; 8],
        ediv: u16,
    ) -> Result<(), Error> {
        self.conn_mut(handle)?.start_encryption(ltk, rand, ediv)
    }

    pub fn ltk_reply(&mut self, handle: ConnHandle, ltk: Key) -> Result<(), Error> {
        self.conn_mut(handle)?.ltk_reply(ltk)
    }

    pub fn ltk_negative_reply(&mut self, handle: ConnHandle) -> Result<(), Error> {
        self.conn_mut(handle)?.ltk_negative_reply()
    }

    pub fn set_data_length(
        &mut self,
        handle: ConnHandle,
        tx_octets: u16,
        tx_time: u16,
    ) -> Result<(), Error> {
        self.conn_mut(handle)?.set_data_length(tx_octets, tx_time)
    }

    pub fn set_phy(
        &mut self,
        handle: ConnHandle,
        tx_phys: PhySet,
        rx_phys: PhySet,
    ) -> Result<(), Error> {
        self.conn_mut(handle)?.set_phy(tx_phys, rx_phys)
    }

    pub fn request_cte(
        &mut self,
        handle: ConnHandle,
        min_cte_len: u8,
        cte_type: CteType,
    ) -> Result<(), Error> {
        self.conn_mut(handle)?.request_cte(min_cte_len, cte_type)
    }

    pub fn set_cte_response_enabled(
        &mut self,
        handle: ConnHandle,
        enabled: bool,
    ) -> Result<(), Error> {
        self.conn_mut(handle)?.set_cte_response_enabled(enabled);
        Ok(())
    }

    pub fn set_authenticated_payload_timeout(
        &mut self,
        handle: ConnHandle,
        apto: Duration,
    ) -> Result<(), Error> {
        self.conn_mut(handle)?
            .set_authenticated_payload_timeout(apto)
    }

    /// Queues an L2CAP fragment on a connection.
    pub fn send_data(&mut self, handle: ConnHandle, llid: Llid, data: &[u8]) -> Result<(), Error> {
        self.conn_mut(handle)?.send_data(llid, data)
    }

    /// Takes the oldest L2CAP fragment received on a connection.
    pub fn receive_data(&mut self, handle: ConnHandle) -> Result<Option<DataPdu>, Error> {
        Ok(self.conn_mut(handle)?.receive_data())
    }

    /// The `LE Encrypt` primitive: AES-128 of `plaintext` under `key`.
    pub fn encrypt(&self, key: &Key, plaintext: &[u8; 16]) -> [u8; 16] {
        security::e(key, plaintext)
    }

    /// The `LE Rand` primitive. Always drawn from the cryptographic source.
    pub fn random(&mut self) -> Result<[u8; 8], Error> {
        self.check_running()?;
        self.rng.key_bytes()
    }

    /// Feeds platform entropy (eg. sampled timer jitter) into the DRBG.
    pub fn add_entropy(&mut self, seed: &[u8; security::rng::SEED_SIZE]) {
        self.rng.add_entropy(seed);
    }

    /// Requests a new local P-256 key pair. Completes with `ReadLocalP256Complete` after
    /// `run_background`.
    pub fn generate_p256_keypair(&mut self) -> Result<(), Error> {
        self.check_running()?;
        self.ecdh.submit(EcdhRequest::GenerateKeypair)
    }

    /// Requests the DHKey for `peer`. Completes with `DhKeyComplete` after `run_background`.
    pub fn generate_dhkey(&mut self, peer: PublicKey) -> Result<(), Error> {
        self.check_running()?;
        self.ecdh.submit(EcdhRequest::GenerateDhKey(peer))
    }

    /// Runs deferred background work. Returns whether anything was done.
    ///
    /// Must be called outside of `update` and `radio_done`, from the lowest-priority context.
    pub fn run_background(&mut self) -> bool {
        if self.halted || !self.ecdh.is_pending() {
            return false;
        }
        let ecdh = &mut self.ecdh;
        let outcome = match self.rng.with_crypto_rng(|rng| ecdh.run(rng)) {
            Ok(Some(outcome)) => outcome,
            Ok(None) => return false,
            Err(e) => {
                warn!("key agreement postponed: {}", e);
                return false;
            }
        };
        self.events.push(match outcome {
            EcdhOutcome::Keypair(key) => HostEvent::ReadLocalP256Complete {
                status: ErrorCode::Success,
                key: Some(key),
            },
            EcdhOutcome::DhKey(key) => HostEvent::DhKeyComplete {
                status: ErrorCode::Success,
                key: Some(key),
            },
            EcdhOutcome::InvalidPeerKey(e) => {
                debug!("DHKey: {}", e);
                HostEvent::DhKeyComplete {
                    status: ErrorCode::InvalidParameters,
                    key: None,
                }
            }
            EcdhOutcome::NoLocalKey => HostEvent::DhKeyComplete {
                status: ErrorCode::CommandDisallowed,
                key: None,
            },
        });
        true
    }
}

/// Recomputes the receive window of a slave connection task after an event was closed.
fn update_slave_window(
    task: &mut Task,
    conn: &Connection,
    change: Option<TimingChange>,
    local_ppm: u16,
    slot_unit: Duration,
) {
    if conn.role() != Role::Slave {
        return;
    }
    let elapsed = task.interval * (task.missed + 1);
    let max = Duration::from_micros(task.interval.as_micros() / 2) - Duration::T_IFS;
    task.widening = conn.window_widening(elapsed, local_ppm).min(max);
    if let Some(change) = change {
        task.duration = slot_unit + change.win_size;
    }
}
