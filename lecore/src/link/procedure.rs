//! LL control procedures and the per-connection procedure queue.
//!
//! Procedures started by our side are queued in a small FIFO. Only the head is *active*: its PDUs
//! are being exchanged and its response timer runs. The remaining entries wait until the active
//! one completes or fails.
//!
//! Procedures started by the peer don't go through the queue. The few that span several PDU
//! exchanges on our side keep their progress in a [`Responder`] slot next to the queue.
//!
//! Two procedures *conflict* when they are of the same kind, when both change connection timing at
//! an instant, or when both touch the encryption state. A conflicting local procedure is refused
//! synchronously with `Error::ProcedureCollision`; a conflicting peer procedure is answered with a
//! reject PDU (see `control`).
//!
//! [`Responder`]: enum.Responder.html

use {
    super::{channel_map::ChannelMap, data::CteType, llcp::ConnParamRequest, llcp::ControlOpcode},
    crate::{error::ErrorCode, phy::PhySet, security::Key, time::Duration, Error},
    heapless::Deque,
};

/// Number of local procedures that may wait behind the active one.
pub const PROCEDURE_QUEUE_DEPTH: usize = 4;

/// A locally initiated control procedure with its parameters.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Procedure {
    /// Master changes interval, latency and supervision timeout (`LL_CONNECTION_UPDATE_IND`).
    ConnectionUpdate {
        interval: u16,
        latency: u16,
        timeout: u16,
    },

    /// Master switches to a new channel map (`LL_CHANNEL_MAP_IND`).
    ChannelMapUpdate(ChannelMap),

    /// Master starts encryption, pausing it first if the link is already encrypted.
    Encryption {
        ltk: Key,
        rand: [u8; 8],
        ediv: u16,
    },

    FeatureExchange,

    VersionExchange,

    /// Sends `LL_TERMINATE_IND` with the given reason.
    Termination(ErrorCode),

    Ping,

    DataLengthUpdate,

    PhyUpdate {
        tx_phys: PhySet,
        rx_phys: PhySet,
    },

    /// Negotiates new connection parameters (`LL_CONNECTION_PARAM_REQ`).
    ConnParamRequest(ConnParamRequest),

    CteRequest {
        min_cte_len: u8,
        cte_type: CteType,
    },
}

/// The kind of a procedure, without its parameters.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProcedureKind {
    ConnectionUpdate,
    ChannelMapUpdate,
    Encryption,
    FeatureExchange,
    VersionExchange,
    Termination,
    Ping,
    DataLengthUpdate,
    PhyUpdate,
    ConnParamRequest,
    CteRequest,
}

impl ProcedureKind {
    /// Returns the kind of procedure started by a PDU with `opcode`, if it starts one.
    pub fn initiated_by(opcode: ControlOpcode) -> Option<Self> {
        Some(match opcode {
            ControlOpcode::ConnectionUpdateInd => ProcedureKind::ConnectionUpdate,
            ControlOpcode::ChannelMapInd => ProcedureKind::ChannelMapUpdate,
            ControlOpcode::EncReq | ControlOpcode::PauseEncReq => ProcedureKind::Encryption,
            ControlOpcode::FeatureReq | ControlOpcode::SlaveFeatureReq => {
                ProcedureKind::FeatureExchange
            }
            ControlOpcode::TerminateInd => ProcedureKind::Termination,
            ControlOpcode::PingReq => ProcedureKind::Ping,
            ControlOpcode::LengthReq => ProcedureKind::DataLengthUpdate,
            ControlOpcode::PhyReq => ProcedureKind::PhyUpdate,
            ControlOpcode::ConnectionParamReq => ProcedureKind::ConnParamRequest,
            ControlOpcode::CteReq => ProcedureKind::CteRequest,
            _ => return None,
        })
    }

    /// Whether the procedure changes connection timing or channels at an instant.
    pub fn uses_instant(self) -> bool {
        matches!(
            self,
            ProcedureKind::ConnectionUpdate
                | ProcedureKind::ChannelMapUpdate
                | ProcedureKind::PhyUpdate
                | ProcedureKind::ConnParamRequest
        )
    }

    /// Whether `self` and `other` may not run at the same time.
    pub fn conflicts_with(self, other: ProcedureKind) -> bool {
        self == other || (self.uses_instant() && other.uses_instant())
    }

    /// The opcode of the PDU that starts this procedure, as cited in `LL_REJECT_EXT_IND`.
    pub fn opcode(self) -> ControlOpcode {
        match self {
            ProcedureKind::ConnectionUpdate => ControlOpcode::ConnectionUpdateInd,
            ProcedureKind::ChannelMapUpdate => ControlOpcode::ChannelMapInd,
            ProcedureKind::Encryption => ControlOpcode::EncReq,
            ProcedureKind::FeatureExchange => ControlOpcode::FeatureReq,
            ProcedureKind::VersionExchange => ControlOpcode::VersionInd,
            ProcedureKind::Termination => ControlOpcode::TerminateInd,
            ProcedureKind::Ping => ControlOpcode::PingReq,
            ProcedureKind::DataLengthUpdate => ControlOpcode::LengthReq,
            ProcedureKind::PhyUpdate => ControlOpcode::PhyReq,
            ProcedureKind::ConnParamRequest => ControlOpcode::ConnectionParamReq,
            ProcedureKind::CteRequest => ControlOpcode::CteReq,
        }
    }
}

impl Procedure {
    pub fn kind(&self) -> ProcedureKind {
        match self {
            Procedure::ConnectionUpdate { .. } => ProcedureKind::ConnectionUpdate,
            Procedure::ChannelMapUpdate(_) => ProcedureKind::ChannelMapUpdate,
            Procedure::Encryption { .. } => ProcedureKind::Encryption,
            Procedure::FeatureExchange => ProcedureKind::FeatureExchange,
            Procedure::VersionExchange => ProcedureKind::VersionExchange,
            Procedure::Termination(_) => ProcedureKind::Termination,
            Procedure::Ping => ProcedureKind::Ping,
            Procedure::DataLengthUpdate => ProcedureKind::DataLengthUpdate,
            Procedure::PhyUpdate { .. } => ProcedureKind::PhyUpdate,
            Procedure::ConnParamRequest(_) => ProcedureKind::ConnParamRequest,
            Procedure::CteRequest { .. } => ProcedureKind::CteRequest,
        }
    }
}

/// Progress of the active local procedure.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Phase {
    /// The procedure hasn't sent anything yet.
    Start,

    /// The initiating PDU is queued or sent; waiting for the peer's answer.
    AwaitResponse,

    /// Everything is exchanged; the change takes effect at connection event `instant`.
    AwaitInstant(u16),

    /// `LL_PAUSE_ENC_REQ` sent, waiting for `LL_PAUSE_ENC_RSP`.
    AwaitPauseEncRsp,

    /// `LL_ENC_REQ` sent, waiting for `LL_ENC_RSP`.
    AwaitEncRsp,

    /// Waiting for the slave's `LL_START_ENC_REQ` (or a reject).
    AwaitStartEncReq,

    /// Our encrypted `LL_START_ENC_RSP` is out, waiting for the slave's.
    AwaitStartEncRsp,

    /// Our last PDU of the procedure must be acknowledged before it completes.
    AwaitAck,
}

/// What the engine has to do after a procedure made progress.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Nothing to do, the procedure is still running (or nothing was running).
    Pending,

    /// The procedure completed and was removed.
    Done,

    /// The connection must be terminated with this reason.
    Terminate(ErrorCode),
}

/// The procedure currently exchanging PDUs.
#[derive(Debug, Copy, Clone)]
pub struct ActiveProcedure {
    pub procedure: Procedure,
    pub phase: Phase,
    remaining_events: u32,
}

impl ActiveProcedure {
    pub fn kind(&self) -> ProcedureKind {
        self.procedure.kind()
    }

    /// Connection events left before the response timeout fires.
    pub fn remaining_events(&self) -> u32 {
        self.remaining_events
    }
}

/// Multi-step procedures started by the peer, in the state our side has reached.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Responder {
    /// Slave: `LL_ENC_RSP` is out, waiting for the host's LTK reply.
    AwaitLtk,

    /// Slave: `LL_START_ENC_REQ` is queued or out, waiting for the master's `LL_START_ENC_RSP`.
    AwaitStartEncRsp,

    /// Slave: our `LL_START_ENC_RSP` must be acknowledged to finish.
    AwaitStartEncRspAck,

    /// Slave: `LL_PAUSE_ENC_RSP` is out, waiting for the master's unencrypted one.
    AwaitPauseEncRsp,

    /// Slave: `LL_PHY_RSP` is out, waiting for `LL_PHY_UPDATE_IND`.
    AwaitPhyUpdate,

    /// Slave: `LL_CONNECTION_PARAM_RSP` is out, waiting for `LL_CONNECTION_UPDATE_IND`.
    AwaitConnUpdate,
}

impl Responder {
    pub fn kind(&self) -> ProcedureKind {
        match self {
            Responder::AwaitLtk
            | Responder::AwaitStartEncRsp
            | Responder::AwaitStartEncRspAck
            | Responder::AwaitPauseEncRsp => ProcedureKind::Encryption,
            Responder::AwaitPhyUpdate => ProcedureKind::PhyUpdate,
            Responder::AwaitConnUpdate => ProcedureKind::ConnParamRequest,
        }
    }
}

/// FIFO of local control procedures with a single active slot, plus the responder slot.
#[derive(Debug)]
pub struct ProcedureQueue {
    waiting: Deque<Procedure, PROCEDURE_QUEUE_DEPTH>,
    active: Option<ActiveProcedure>,
    responder: Option<(Responder, u32)>,
}

impl ProcedureQueue {
    pub fn new() -> Self {
        Self {
            waiting: Deque::new(),
            active: None,
            responder: None,
        }
    }

    /// Returns whether a procedure of kind `kind` would conflict with anything running or
    /// queued.
    pub fn conflicts(&self, kind: ProcedureKind) -> bool {
        self.active
            .iter()
            .map(|a| a.kind())
            .chain(self.waiting.iter().map(Procedure::kind))
            .chain(self.responder.iter().map(|(r, _)| r.kind()))
            .any(|other| other.conflicts_with(kind))
    }

    /// Appends a local procedure.
    ///
    /// Fails with `ProcedureCollision` if it conflicts with one that is active or waiting, and
    /// with `ResourceExhausted` if the queue is full. Termination may always be queued once; it
    /// replaces everything that is active or still waiting.
    pub fn enqueue(&mut self, procedure: Procedure) -> Result<(), Error> {
        if self.conflicts(procedure.kind()) {
            return Err(Error::ProcedureCollision);
        }
        if procedure.kind() == ProcedureKind::Termination {
            self.waiting.clear();
            self.active = None;
            self.responder = None;
            return self
                .waiting
                .push_front(procedure)
                .map_err(|_| Error::ResourceExhausted);
        }
        self.waiting
            .push_back(procedure)
            .map_err(|_| Error::ResourceExhausted)
    }

    /// Makes the oldest waiting procedure active if nothing is.
    ///
    /// `timeout_events` is the response timeout expressed in connection events. Returns the
    /// active procedure if one was started.
    pub fn activate_next(&mut self, timeout_events: u32) -> Option<&mut ActiveProcedure> {
        if self.active.is_some() {
            return None;
        }
        let procedure = self.waiting.pop_front()?;
        self.active = Some(ActiveProcedure {
            procedure,
            phase: Phase::Start,
            remaining_events: timeout_events,
        });
        self.active.as_mut()
    }

    /// The procedure `activate_next` would start.
    pub fn next_waiting(&self) -> Option<&Procedure> {
        self.waiting.front()
    }

    pub fn active(&self) -> Option<&ActiveProcedure> {
        self.active.as_ref()
    }

    pub fn active_mut(&mut self) -> Option<&mut ActiveProcedure> {
        self.active.as_mut()
    }

    /// Returns the kind of the active procedure.
    pub fn active_kind(&self) -> Option<ProcedureKind> {
        self.active.map(|a| a.kind())
    }

    /// Removes the active procedure once its final exchange completed (or it was rejected).
    pub fn complete(&mut self) -> Option<Procedure> {
        self.active.take().map(|a| a.procedure)
    }

    pub fn responder(&self) -> Option<Responder> {
        self.responder.map(|(r, _)| r)
    }

    /// Enters (or advances) a peer-initiated procedure, restarting its response timer.
    pub fn set_responder(&mut self, responder: Responder, timeout_events: u32) {
        self.responder = Some((responder, timeout_events));
    }

    pub fn clear_responder(&mut self) {
        self.responder = None;
    }

    /// Restarts the response timer of the active procedure, eg. after it made progress.
    pub fn restart_timer(&mut self, timeout_events: u32) {
        if let Some(active) = &mut self.active {
            active.remaining_events = timeout_events;
        }
    }

    /// Counts one connection event against the response timers.
    ///
    /// Returns `Terminate(LlResponseTimeout)` once either timer runs out. Procedures waiting for
    /// an instant are bounded by the instant itself and don't time out.
    pub fn tick(&mut self) -> Disposition {
        let mut expired = false;
        if let Some(active) = &mut self.active {
            if !matches!(active.phase, Phase::AwaitInstant(_)) {
                active.remaining_events = active.remaining_events.saturating_sub(1);
                expired |= active.remaining_events == 0;
            }
        }
        if let Some((responder, remaining)) = &mut self.responder {
            // The host, not the peer, answers LTK requests.
            if *responder != Responder::AwaitLtk {
                *remaining = remaining.saturating_sub(1);
                expired |= *remaining == 0;
            }
        }
        if expired {
            Disposition::Terminate(ErrorCode::LlResponseTimeout)
        } else {
            Disposition::Pending
        }
    }

    /// Returns whether nothing is active or waiting.
    pub fn is_idle(&self) -> bool {
        self.active.is_none() && self.waiting.is_empty() && self.responder.is_none()
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    /// Discards everything, eg. when the connection is torn down.
    pub fn clear(&mut self) {
        self.waiting.clear();
        self.active = None;
        self.responder = None;
    }
}

impl Default for ProcedureQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Converts a timeout into a number of connection events, rounding up.
pub fn timeout_events(timeout: Duration, interval: Duration) -> u32 {
    timeout.div_ceil(interval).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn_update() -> Procedure {
        Procedure::ConnectionUpdate {
            interval: 24,
            latency: 0,
            timeout: 100,
        }
    }

    #[test]
    fn at_most_one_active() {
        let mut queue = ProcedureQueue::new();
        queue.enqueue(Procedure::FeatureExchange).unwrap();
        queue.enqueue(Procedure::VersionExchange).unwrap();
        queue.enqueue(Procedure::Ping).unwrap();

        assert_eq!(
            queue.activate_next(10).map(|a| a.kind()),
            Some(ProcedureKind::FeatureExchange)
        );
        // Still busy.
        assert!(queue.activate_next(10).is_none());
        assert_eq!(queue.active_kind(), Some(ProcedureKind::FeatureExchange));
        assert_eq!(queue.waiting_len(), 2);

        assert_eq!(queue.complete(), Some(Procedure::FeatureExchange));
        assert_eq!(
            queue.activate_next(10).map(|a| a.kind()),
            Some(ProcedureKind::VersionExchange)
        );
    }

    #[test]
    fn collisions_are_refused() {
        let mut queue = ProcedureQueue::new();
        queue.enqueue(conn_update()).unwrap();

        // Same kind.
        assert_eq!(queue.enqueue(conn_update()), Err(Error::ProcedureCollision));
        // Different kind, but both use an instant.
        assert_eq!(
            queue.enqueue(Procedure::ChannelMapUpdate(ChannelMap::with_all_channels())),
            Err(Error::ProcedureCollision)
        );
        assert_eq!(
            queue.enqueue(Procedure::PhyUpdate {
                tx_phys: PhySet::LE_2M,
                rx_phys: PhySet::LE_2M,
            }),
            Err(Error::ProcedureCollision)
        );
        // Unrelated.
        queue.enqueue(Procedure::Ping).unwrap();

        // The conflict persists while it's active.
        queue.activate_next(5);
        assert_eq!(queue.enqueue(conn_update()), Err(Error::ProcedureCollision));

        // Peer-initiated procedures count too.
        queue.complete();
        queue.set_responder(Responder::AwaitPhyUpdate, 5);
        assert!(queue.conflicts(ProcedureKind::ChannelMapUpdate));
        assert!(!queue.conflicts(ProcedureKind::FeatureExchange));
    }

    #[test]
    fn capacity() {
        let mut queue = ProcedureQueue::new();
        queue.enqueue(Procedure::Ping).unwrap();
        queue.enqueue(Procedure::FeatureExchange).unwrap();
        queue.enqueue(Procedure::VersionExchange).unwrap();
        queue.enqueue(Procedure::DataLengthUpdate).unwrap();
        assert_eq!(
            queue.enqueue(Procedure::CteRequest {
                min_cte_len: 2,
                cte_type: CteType::AoA,
            }),
            Err(Error::ResourceExhausted)
        );

        // Termination replaces everything that hasn't started.
        queue
            .enqueue(Procedure::Termination(ErrorCode::RemoteUserTerminated))
            .unwrap();
        assert_eq!(queue.waiting_len(), 1);
        assert_eq!(
            queue.activate_next(3).map(|a| a.kind()),
            Some(ProcedureKind::Termination)
        );
    }

    #[test]
    fn response_timeout() {
        let mut queue = ProcedureQueue::new();
        queue.enqueue(Procedure::FeatureExchange).unwrap();
        queue.activate_next(3);
        assert_eq!(queue.tick(), Disposition::Pending);
        assert_eq!(queue.tick(), Disposition::Pending);
        assert_eq!(
            queue.tick(),
            Disposition::Terminate(ErrorCode::LlResponseTimeout)
        );
    }

    #[test]
    fn instant_wait_does_not_time_out() {
        let mut queue = ProcedureQueue::new();
        queue.enqueue(conn_update()).unwrap();
        queue.activate_next(1).unwrap().phase = Phase::AwaitInstant(100);
        for _ in 0..10 {
            assert_eq!(queue.tick(), Disposition::Pending);
        }
    }

    #[test]
    fn responder_timeout_spares_ltk_wait() {
        let mut queue = ProcedureQueue::new();
        queue.set_responder(Responder::AwaitLtk, 2);
        for _ in 0..10 {
            assert_eq!(queue.tick(), Disposition::Pending);
        }

        queue.set_responder(Responder::AwaitPhyUpdate, 2);
        assert_eq!(queue.tick(), Disposition::Pending);
        assert_eq!(
            queue.tick(),
            Disposition::Terminate(ErrorCode::LlResponseTimeout)
        );
    }

    #[test]
    fn next_waiting_is_the_next_to_start() {
        let mut queue = ProcedureQueue::new();
        assert!(queue.next_waiting().is_none());
        queue.enqueue(Procedure::Ping).unwrap();
        queue.enqueue(conn_update()).unwrap();
        assert_eq!(queue.next_waiting().map(Procedure::kind), Some(ProcedureKind::Ping));
        queue.activate_next(5);
        assert_eq!(
            queue.next_waiting().map(Procedure::kind),
            Some(ProcedureKind::ConnectionUpdate)
        );
    }

    #[test]
    fn timeout_event_count() {
        let interval = Duration::from_millis(30);
        assert_eq!(timeout_events(Duration::from_secs(40), interval), 1334);
        assert_eq!(
            timeout_events(Duration::from_secs(40), Duration::from_micros(7_500)),
            5334
        );
    }
}
