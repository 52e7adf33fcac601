//! Controller-level scenarios.
//!
//! Several `LinkLayer`s share a simulated air interface. `Air::step` executes the radio
//! operation that completes first; a transmission reaches every listener whose command matches
//! its channel and access address and whose window covers its start. Every node's radio
//! operations are checked to never overlap.

use {
    super::{
        channel_map::ChannelMap,
        connection::{ConnParams, InstantUpdate, ESTABLISHMENT_EVENTS},
        data::Llid,
        device_address::{AddressKind, DeviceAddress},
        llcp::{ControlOpcode, ControlPdu},
        procedure::ProcedureKind,
        scheduler::{PriorityTable, TaskKind},
        ConnHandle, DataPdu, HostEvent, LinkLayer, PduBuf, Radio, RadioChannel, RadioCommand,
        RadioEvent, RadioOp, RadioStatus,
    },
    crate::{
        config::{Config, Params},
        ecdh::P256Provider,
        error::{ErrorCode, HardwareError},
        phy::{Phy, PhySet},
        security::{derive_session_key, rng::testing::XorShiftTrng},
        time::{Duration, Instant, Timer},
        Error,
    },
};

/// How long a receiver listens for a reply after transmitting.
const REPLY_TIMEOUT: Duration = Duration::from_micros(100);

struct Sim;

impl Config for Sim {
    type Timer = ManualTimer;
    type Radio = MockRadio;
    type Trng = XorShiftTrng;
    type EcdhProvider = P256Provider;
    type SecondaryPolicy = PriorityTable;
}

struct ManualTimer(Instant);

impl Timer for ManualTimer {
    fn now(&self) -> Instant {
        self.0
    }
}

#[derive(Default)]
struct MockRadio {
    cmd: Option<RadioCommand>,
    responses: Vec<PduBuf>,
    fail: Option<HardwareError>,
}

impl Radio for MockRadio {
    fn program(&mut self, cmd: &RadioCommand) -> Result<(), HardwareError> {
        if let Some(e) = self.fail {
            return Err(e);
        }
        self.cmd = Some(cmd.clone());
        Ok(())
    }

    fn respond(&mut self, pdu: &[u8]) {
        self.responses.push(PduBuf::from_slice(pdu).unwrap());
    }

    fn abort(&mut self) {
        self.cmd = None;
    }
}

fn controller(id: u8) -> LinkLayer<Sim> {
    controller_with(id, Params::default())
}

fn controller_with(id: u8, params: Params) -> LinkLayer<Sim> {
    LinkLayer::new(
        DeviceAddress::new([id, 0x11, 0x22, 0x33, 0x44, 0xC5], AddressKind::Random),
        params,
        ManualTimer(Instant::from_raw_micros(0)),
        MockRadio::default(),
        XorShiftTrng::new(0x1234_5678 ^ u32::from(id)),
        P256Provider::new(),
        PriorityTable::default(),
    )
}

fn is_encryption_result(event: &HostEvent) -> bool {
    matches!(
        event,
        HostEvent::EncryptionChange { .. } | HostEvent::EncryptionKeyRefresh { .. }
    )
}

fn air_time(phy: Phy, len: usize) -> Duration {
    Duration::from_micros(u32::from(phy.packet_time(len as u16 - 2)))
}

fn conn_params(interval: u16, timeout: u16) -> ConnParams {
    ConnParams {
        interval,
        latency: 0,
        timeout,
    }
}

struct Air {
    nodes: Vec<LinkLayer<Sim>>,
    /// End of the last radio operation of every node.
    busy_until: Vec<Instant>,
    muted: Vec<bool>,
    /// Nothing is delivered while set.
    jammed: bool,
    events: Vec<Vec<HostEvent>>,
    /// Every PDU put on air, with its sender.
    sent: Vec<(usize, RadioChannel, PduBuf)>,
    now: Instant,
}

impl Air {
    fn new(count: u8) -> Self {
        Self::with_params(count, Params::default())
    }

    fn with_params(count: u8, params: Params) -> Self {
        let count_usize = usize::from(count);
        Self {
            nodes: (1..=count).map(|id| controller_with(id, params)).collect(),
            busy_until: vec![Instant::from_raw_micros(0); count_usize],
            muted: vec![false; count_usize],
            jammed: false,
            events: (0..count_usize).map(|_| Vec::new()).collect(),
            sent: Vec::new(),
            now: Instant::from_raw_micros(0),
        }
    }

    /// Returns node `i` for a host call at the current time.
    fn host(&mut self, i: usize) -> &mut LinkLayer<Sim> {
        let now = self.now;
        let ll = &mut self.nodes[i];
        if ll.timer().0.is_before(now) {
            ll.timer().0 = now;
        }
        ll
    }

    fn address(&self, i: usize) -> DeviceAddress {
        self.nodes[i].address()
    }

    /// Executes the radio operation that completes first. Returns `false` if no node has one.
    fn step(&mut self) -> bool {
        let mut next: Option<(usize, Instant)> = None;
        for i in 0..self.nodes.len() {
            if self.muted[i] {
                continue;
            }
            if let Some(cmd) = &self.nodes[i].radio().cmd {
                // A listener is decided once its window closed without a transmission.
                let due = match cmd.op {
                    RadioOp::Listen { window } => cmd.start + window,
                    _ => cmd.start,
                };
                if next.map_or(true, |(_, t)| due.is_before(t)) {
                    next = Some((i, due));
                }
            }
        }
        let (i, due) = match next {
            Some(next) => next,
            None => return false,
        };
        self.now = self.now.max(due);

        let cmd = self.take_cmd(i);
        match cmd.op {
            RadioOp::Listen { window } => {
                let end = cmd.start + window;
                self.finish(i, end, RadioEvent::done(end));
            }
            RadioOp::Transmit(_) | RadioOp::TransmitListen(_) => self.transmit(i, cmd),
        }
        true
    }

    fn take_cmd(&mut self, i: usize) -> RadioCommand {
        let cmd = self.nodes[i].radio().cmd.take().unwrap();
        assert!(
            !cmd.start.is_before(self.busy_until[i]),
            "node {} starts {:?} at {} while busy until {}",
            i,
            cmd.op,
            cmd.start,
            self.busy_until[i]
        );
        cmd
    }

    fn transmit(&mut self, j: usize, cmd: RadioCommand) {
        let (pdu, listen) = match &cmd.op {
            RadioOp::Transmit(pdu) => (pdu.clone(), false),
            RadioOp::TransmitListen(pdu) => (pdu.clone(), true),
            RadioOp::Listen { .. } => unreachable!(),
        };
        self.sent.push((j, cmd.channel, pdu.clone()));
        let tx_end = cmd.start + air_time(cmd.phy, pdu.len());
        let silent_end = if listen {
            tx_end + Duration::T_IFS + REPLY_TIMEOUT
        } else {
            tx_end
        };

        let k = match self.listener(j, &cmd) {
            Some(k) if !self.jammed => k,
            _ => {
                self.finish(j, silent_end, RadioEvent::done(silent_end));
                return;
            }
        };
        self.take_cmd(k);
        self.finish(
            k,
            tx_end,
            RadioEvent::received(cmd.start, &pdu[..], true, -40),
        );
        let response = self.nodes[k].radio().responses.pop();
        match response {
            Some(rsp) if listen => {
                self.sent.push((k, cmd.channel, rsp.clone()));
                let rsp_start = tx_end + Duration::T_IFS;
                let rsp_end = rsp_start + air_time(cmd.phy, rsp.len());
                self.busy_until[k] = rsp_end;
                self.finish(
                    j,
                    rsp_end,
                    RadioEvent::received(rsp_start, &rsp[..], true, -40),
                );
                self.nodes[j].radio().responses.clear();
            }
            _ => self.finish(j, silent_end, RadioEvent::done(silent_end)),
        }
    }

    /// Finds a node listening for `tx`.
    fn listener(&mut self, j: usize, tx: &RadioCommand) -> Option<usize> {
        for k in 0..self.nodes.len() {
            if k == j || self.muted[k] {
                continue;
            }
            if let Some(rx) = &self.nodes[k].radio().cmd {
                if let RadioOp::Listen { window } = rx.op {
                    if rx.channel == tx.channel
                        && rx.access_address == tx.access_address
                        && !tx.start.is_before(rx.start)
                        && !tx.start.is_after(rx.start + window)
                    {
                        return Some(k);
                    }
                }
            }
        }
        None
    }

    fn finish(&mut self, i: usize, end: Instant, event: RadioEvent<'_>) {
        self.busy_until[i] = end;
        let ll = &mut self.nodes[i];
        if ll.timer().0.is_before(end) {
            ll.timer().0 = end;
        }
        ll.radio_done(event);
        while let Some(event) = self.nodes[i].poll_event() {
            self.events[i].push(event);
        }
    }

    fn run_until(&mut self, max_steps: usize, mut done: impl FnMut(&mut Air) -> bool) {
        for _ in 0..max_steps {
            if done(self) {
                return;
            }
            assert!(self.step(), "no radio activity left");
        }
        assert!(done(self), "condition not reached in {} steps", max_steps);
    }

    fn find_event(&self, i: usize, f: impl Fn(&HostEvent) -> bool) -> Option<&HostEvent> {
        self.events[i].iter().find(|e| f(*e))
    }

    fn connection_to(&self, i: usize, peer: DeviceAddress) -> Option<ConnHandle> {
        self.events[i].iter().rev().find_map(|e| match e {
            HostEvent::ConnectionComplete {
                handle, peer: p, ..
            } if *p == peer => Some(*handle),
            _ => None,
        })
    }

    fn disconnection(&self, i: usize) -> Option<ErrorCode> {
        self.events[i].iter().find_map(|e| match e {
            HostEvent::DisconnectionComplete { reason, .. } => Some(*reason),
            _ => None,
        })
    }

    /// Control PDUs node `i` put on air in the clear, without retransmissions.
    fn control_sent(&self, i: usize) -> Vec<ControlPdu> {
        let mut pdus: Vec<ControlPdu> = Vec::new();
        let mut last_raw: Option<&PduBuf> = None;
        for (sender, channel, raw) in &self.sent {
            if *sender != i || !matches!(channel, RadioChannel::Data(_)) {
                continue;
            }
            // A retransmission differs at most in NESN and MD.
            let repeated = last_raw.map_or(false, |last| {
                last.len() == raw.len()
                    && last[0] & !0x14 == raw[0] & !0x14
                    && last[1..] == raw[1..]
            });
            last_raw = Some(raw);
            if repeated {
                continue;
            }
            if let Some(ctrl) = DataPdu::decode(raw).ok().and_then(|pdu| pdu.to_control().ok()) {
                pdus.push(ctrl);
            }
        }
        pdus
    }

    fn has_event(&self, i: usize, event: &HostEvent) -> bool {
        self.events[i].iter().any(|e| e == event)
    }

    /// Runs the encryption start (or key refresh) with `ltk` between master node 0 and slave
    /// node 1.
    fn encrypt(&mut self, m: ConnHandle, s: ConnHandle, ltk: [u8; 16]) {
        let requests = |air: &mut Air| {
            air.events[1]
                .iter()
                .filter(|e| matches!(e, HostEvent::LtkRequest { .. }))
                .count()
        };
        let before = requests(self);
        let done = |air: &mut Air| {
            air.events[0].iter().filter(|e| is_encryption_result(e)).count()
        };
        let done_before = done(self);
        self.host(0).start_encryption(m, ltk, [7; 8], 0x0102).unwrap();
        self.run_until(50, |air| requests(air) > before);
        self.host(1).ltk_reply(s, ltk).unwrap();
        self.run_until(50, |air| done(air) > done_before);
        assert!(self.nodes[0].connection(m).unwrap().is_encrypted());
        assert!(self.nodes[1].connection(s).unwrap().is_encrypted());
    }

    fn event_counter(&self, i: usize, handle: ConnHandle) -> u16 {
        self.nodes[i].connection(handle).unwrap().event_counter()
    }

    fn missed(&self, i: usize, handle: ConnHandle) -> u32 {
        self.nodes[i]
            .scheduler()
            .tasks()
            .find(|(_, t)| t.kind == TaskKind::Connection(handle))
            .map_or(0, |(_, t)| t.missed)
    }

    fn established(&self, i: usize, handle: ConnHandle) -> bool {
        self.nodes[i]
            .connection(handle)
            .map_or(false, |c| !c.is_establishing())
    }

    /// Lets `slave` advertise and `master` connect to it. Returns both handles.
    fn connect(&mut self, master: usize, slave: usize, params: ConnParams) -> (ConnHandle, ConnHandle) {
        let master_addr = self.address(master);
        let slave_addr = self.address(slave);
        self.host(slave)
            .start_advertising(Duration::from_millis(20), true, &[0x02, 0x01, 0x06], &[])
            .unwrap();
        self.host(master)
            .create_connection(
                Some(slave_addr),
                Duration::from_millis(10),
                Duration::from_millis(10),
                params,
            )
            .unwrap();
        self.run_until(20_000, |air| {
            air.connection_to(master, slave_addr).is_some()
                && air.connection_to(slave, master_addr).is_some()
        });
        let m = self.connection_to(master, slave_addr).unwrap();
        let s = self.connection_to(slave, master_addr).unwrap();
        assert!(!self.nodes[slave].is_advertising());
        (m, s)
    }

    /// Connects and runs until the first packets were exchanged.
    fn establish(&mut self, master: usize, slave: usize, params: ConnParams) -> (ConnHandle, ConnHandle) {
        let (m, s) = self.connect(master, slave, params);
        self.run_until(100, |air| air.established(master, m) && air.established(slave, s));
        (m, s)
    }
}

#[test]
fn connection_is_established() {
    let mut air = Air::new(2);
    let (m, s) = air.establish(0, 1, conn_params(24, 100));

    let master = air.nodes[0].connection(m).unwrap();
    let slave = air.nodes[1].connection(s).unwrap();
    assert_eq!(master.access_address(), slave.access_address());
    assert_eq!(master.crc_init(), slave.crc_init());
    assert_eq!(master.params(), conn_params(24, 100));
    assert_eq!(slave.params(), conn_params(24, 100));
    assert!(master.uses_csa2() && slave.uses_csa2());
    assert!(matches!(
        air.find_event(0, |e| matches!(e, HostEvent::ConnectionComplete { .. })),
        Some(HostEvent::ConnectionComplete {
            role: super::Role::Master,
            ..
        })
    ));

    air.run_until(1_000, |air| {
        air.event_counter(0, m) >= 50
    });
    assert_eq!(air.missed(0, m), 0);
    assert_eq!(air.missed(1, s), 0);
    assert_eq!(air.disconnection(0), None);
    assert_eq!(air.disconnection(1), None);
}

#[test]
fn radio_is_shared_without_overlap() {
    let mut air = Air::new(3);
    let (m1, _) = air.establish(0, 1, conn_params(24, 100));
    let (m2, _) = air.establish(0, 2, conn_params(40, 200));
    air.host(0)
        .start_advertising(Duration::from_millis(100), false, &[0x02, 0x01, 0x04], &[])
        .unwrap();

    // `step` asserts that no node's operations overlap.
    for _ in 0..10_000 {
        assert!(air.step());
    }

    for i in 0..3 {
        assert_eq!(air.disconnection(i), None, "node {} lost a connection", i);
    }
    assert!(air.nodes[0].connection(m1).is_some());
    assert!(air.nodes[0].connection(m2).is_some());
    let adv_visits = air
        .sent
        .iter()
        .filter(|(i, ch, _)| *i == 0 && matches!(ch, RadioChannel::Advertising(_)))
        .count();
    assert!(adv_visits > 100, "only {} advertising visits", adv_visits);
    assert!(air.event_counter(0, m1) > 1_000);
}

#[test]
fn supervision_timeout_boundary() {
    let mut air = Air::new(2);
    let (m, _) = air.establish(0, 1, conn_params(24, 30));
    let lsto = air.nodes[0].connection(m).unwrap().lsto_events();
    assert_eq!(lsto, 10);

    air.muted[1] = true;
    air.run_until(50, |air| air.missed(0, m) == lsto - 1);
    assert!(air.nodes[0].connection(m).is_some());
    assert_eq!(air.disconnection(0), None);

    assert!(air.step());
    assert!(air.nodes[0].connection(m).is_none());
    assert_eq!(air.disconnection(0), Some(ErrorCode::ConnectionTimeout));
}

#[test]
fn establishment_fails_after_six_events() {
    let mut air = Air::new(2);
    let (_, s) = air.connect(0, 1, conn_params(24, 100));
    air.muted[0] = true;

    for _ in 0..ESTABLISHMENT_EVENTS - 1 {
        assert!(air.step());
    }
    assert!(air.nodes[1].connection(s).is_some());
    assert!(air.step());
    assert!(air.nodes[1].connection(s).is_none());
    assert_eq!(
        air.disconnection(1),
        Some(ErrorCode::ConnectionFailedToBeEstablished)
    );
}

#[test]
fn connection_update_survives_missed_events_before_instant() {
    let mut air = Air::new(2);
    let (m, s) = air.establish(0, 1, conn_params(24, 100));
    air.host(0).update_connection(m, 40, 40, 0, 100).unwrap();

    air.run_until(20, |air| {
        air.nodes[0].connection(m).unwrap().pending_update().is_some()
    });
    let (instant, _) = air.nodes[0].connection(m).unwrap().pending_update().unwrap();
    assert_eq!(instant, air.event_counter(0, m).wrapping_add(6));

    air.run_until(20, |air| air.event_counter(0, m) == instant.wrapping_sub(4));
    assert_eq!(
        air.nodes[1].connection(s).unwrap().pending_update().map(|(i, _)| i),
        Some(instant)
    );

    // Events instant-4 ..= instant-2 are lost on both sides.
    air.jammed = true;
    air.run_until(20, |air| air.event_counter(0, m) == instant.wrapping_sub(1));
    air.jammed = false;

    air.run_until(20, |air| {
        air.event_counter(0, m) == instant.wrapping_add(10)
            && air.event_counter(1, s) == instant.wrapping_add(10)
    });
    for (i, h) in [(0, m), (1, s)] {
        let conn = air.nodes[i].connection(h).unwrap();
        assert_eq!(conn.params().interval, 40);
        assert_eq!(conn.interval(), Duration::from_millis(50));
        assert!(conn.pending_update().is_none());
        assert_eq!(air.missed(i, h), 0);
        assert!(matches!(
            air.find_event(i, |e| matches!(e, HostEvent::ConnectionUpdateComplete { .. })),
            Some(HostEvent::ConnectionUpdateComplete {
                status: ErrorCode::Success,
                params: ConnParams { interval: 40, .. },
                ..
            })
        ));
    }
}

#[test]
fn encryption_handshake() {
    let mut air = Air::new(2);
    let (m, s) = air.establish(0, 1, conn_params(24, 100));
    let ltk = [0x4C, 0x68, 0x38, 0x41, 0x39, 0xF5, 0x74, 0xD8, 0x36, 0xBC, 0xF3, 0x4E, 0x9D, 0xFB, 0x01, 0xBF];
    let rand = [0x74, 0x4E, 0x3A, 0x9E, 0x12, 0x7B, 0x5D, 0x61];

    air.host(0).start_encryption(m, ltk, rand, 0x2474).unwrap();
    assert_eq!(air.host(1).start_encryption(s, ltk, rand, 0), Err(Error::InvalidState));

    air.run_until(50, |air| {
        air.find_event(1, |e| matches!(e, HostEvent::LtkRequest { .. }))
            .is_some()
    });
    assert_eq!(
        air.find_event(1, |e| matches!(e, HostEvent::LtkRequest { .. })),
        Some(&HostEvent::LtkRequest {
            handle: s,
            rand,
            ediv: 0x2474
        })
    );
    air.host(1).ltk_reply(s, ltk).unwrap();

    let is_change = |e: &HostEvent| matches!(e, HostEvent::EncryptionChange { .. });
    air.run_until(50, |air| {
        air.find_event(0, is_change).is_some() && air.find_event(1, is_change).is_some()
    });
    assert_eq!(
        air.find_event(0, is_change),
        Some(&HostEvent::EncryptionChange {
            handle: m,
            status: ErrorCode::Success,
            enabled: true
        })
    );
    assert_eq!(
        air.find_event(1, is_change),
        Some(&HostEvent::EncryptionChange {
            handle: s,
            status: ErrorCode::Success,
            enabled: true
        })
    );
    assert!(air.nodes[0].connection(m).unwrap().is_encrypted());
    assert!(air.nodes[1].connection(s).unwrap().is_encrypted());

    let message = b"encrypted payload";
    air.host(0).send_data(m, Llid::DataStart, message).unwrap();
    let mut received: Option<DataPdu> = None;
    air.run_until(20, |air| {
        if received.is_none() {
            received = air.host(1).receive_data(s).unwrap();
        }
        received.is_some()
    });
    assert_eq!(received.unwrap().payload(), &message[..]);
    assert!(!air
        .sent
        .iter()
        .any(|(_, _, pdu)| pdu.windows(message.len()).any(|w| w == &message[..])));
}

#[test]
fn wrong_ltk_fails_mic_check() {
    let mut air = Air::new(2);
    let (m, s) = air.establish(0, 1, conn_params(24, 100));
    air.host(0).start_encryption(m, [1; 16], [2; 8], 3).unwrap();
    air.run_until(50, |air| {
        air.find_event(1, |e| matches!(e, HostEvent::LtkRequest { .. }))
            .is_some()
    });
    air.host(1).ltk_reply(s, [9; 16]).unwrap();

    air.run_until(50, |air| air.disconnection(1).is_some());
    assert_eq!(air.disconnection(1), Some(ErrorCode::MicFailure));
}

#[test]
fn ltk_negative_reply_ends_connection() {
    let mut air = Air::new(2);
    let (m, s) = air.establish(0, 1, conn_params(24, 100));
    air.host(0).start_encryption(m, [1; 16], [2; 8], 3).unwrap();
    air.run_until(50, |air| {
        air.find_event(1, |e| matches!(e, HostEvent::LtkRequest { .. }))
            .is_some()
    });
    air.host(1).ltk_negative_reply(s).unwrap();

    air.run_until(50, |air| {
        air.disconnection(0).is_some() && air.disconnection(1).is_some()
    });
    assert_eq!(
        air.find_event(0, |e| matches!(e, HostEvent::EncryptionChange { .. })),
        Some(&HostEvent::EncryptionChange {
            handle: m,
            status: ErrorCode::PinOrKeyMissing,
            enabled: false
        })
    );
    assert_eq!(air.disconnection(0), Some(ErrorCode::PinOrKeyMissing));
    assert_eq!(air.disconnection(1), Some(ErrorCode::PinOrKeyMissing));
    assert!(air.nodes[0].connection(m).is_none());
    assert!(air.nodes[1].connection(s).is_none());
    assert!(air.host(1).ltk_reply(s, [1; 16]).is_err());
}

#[test]
fn simultaneous_phy_updates_collide() {
    let mut air = Air::new(2);
    let (m, s) = air.establish(0, 1, conn_params(24, 100));
    air.host(0).set_phy(m, PhySet::LE_2M, PhySet::LE_2M).unwrap();
    air.host(1).set_phy(s, PhySet::LE_2M, PhySet::LE_2M).unwrap();

    let is_phy = |e: &HostEvent| matches!(e, HostEvent::PhyUpdateComplete { .. });
    air.run_until(100, |air| {
        air.find_event(0, is_phy).is_some() && air.find_event(1, is_phy).is_some()
    });
    assert_eq!(
        air.find_event(0, is_phy),
        Some(&HostEvent::PhyUpdateComplete {
            handle: m,
            status: ErrorCode::Success,
            tx: Phy::Le2M,
            rx: Phy::Le2M,
        })
    );
    assert_eq!(
        air.find_event(1, is_phy),
        Some(&HostEvent::PhyUpdateComplete {
            handle: s,
            status: ErrorCode::Success,
            tx: Phy::Le2M,
            rx: Phy::Le2M,
        })
    );

    // The master refused the slave's request.
    let collision_rejected = air.sent.iter().any(|(i, _, raw)| {
        *i == 0
            && DataPdu::decode(raw).ok().and_then(|pdu| pdu.to_control().ok())
                == Some(ControlPdu::RejectExtInd {
                    reject_opcode: ControlOpcode::PhyReq,
                    error_code: ErrorCode::LlProcedureCollision,
                })
    });
    assert!(collision_rejected);

    // Traffic continues on the new PHY.
    air.run_until(100, |air| {
        air.nodes[0].connection(m).unwrap().stats().packets_rx > 40
    });
    assert_eq!(air.nodes[0].connection(m).unwrap().phy().tx, Phy::Le2M);
    assert_eq!(air.nodes[1].connection(s).unwrap().phy().rx, Phy::Le2M);
    assert_eq!(air.disconnection(0), None);
}

#[test]
fn disconnect_reaches_peer() {
    let mut air = Air::new(2);
    let (m, _) = air.establish(0, 1, conn_params(24, 100));
    air.host(0)
        .disconnect(m, ErrorCode::RemoteUserTerminated)
        .unwrap();
    air.run_until(20, |air| {
        air.disconnection(0).is_some() && air.disconnection(1).is_some()
    });
    assert_eq!(air.disconnection(0), Some(ErrorCode::LocalHostTerminated));
    assert_eq!(air.disconnection(1), Some(ErrorCode::RemoteUserTerminated));
    assert_eq!(
        air.host(0).read_remote_version(m),
        Err(Error::UnknownConnection)
    );
}

#[test]
fn remote_features_and_version() {
    let mut air = Air::new(2);
    let (m, s) = air.establish(0, 1, conn_params(24, 100));
    air.host(0).read_remote_features(m).unwrap();
    air.host(1).read_remote_version(s).unwrap();

    air.run_until(50, |air| {
        air.find_event(0, |e| matches!(e, HostEvent::RemoteFeatures { .. }))
            .is_some()
            && air
                .find_event(1, |e| matches!(e, HostEvent::RemoteVersion { .. }))
                .is_some()
    });
    match air.find_event(0, |e| matches!(e, HostEvent::RemoteFeatures { .. })) {
        Some(HostEvent::RemoteFeatures {
            status, features, ..
        }) => {
            assert_eq!(*status, ErrorCode::Success);
            assert_eq!(*features, air.nodes[1].params().features);
        }
        other => panic!("{:?}", other),
    }
    match air.find_event(1, |e| matches!(e, HostEvent::RemoteVersion { .. })) {
        Some(HostEvent::RemoteVersion { version, .. }) => {
            assert_eq!(version.vers_nr, crate::BLUETOOTH_VERSION);
            assert_eq!(version.company_id, air.nodes[0].params().company_id);
        }
        other => panic!("{:?}", other),
    }
}

#[test]
fn scanner_reports_advertisers() {
    let mut air = Air::new(2);
    let advertiser = air.address(1);
    air.host(1)
        .start_advertising(Duration::from_millis(20), false, &[0x02, 0x01, 0x04], &[])
        .unwrap();
    air.host(0)
        .start_scanning(Duration::from_millis(10), Duration::from_millis(10))
        .unwrap();

    air.run_until(5_000, |air| {
        air.find_event(0, |e| matches!(e, HostEvent::AdvertisingReport(_)))
            .is_some()
    });
    match air.find_event(0, |e| matches!(e, HostEvent::AdvertisingReport(_))) {
        Some(HostEvent::AdvertisingReport(report)) => {
            assert_eq!(report.address, advertiser);
            assert_eq!(&report.data[..], &[0x02, 0x01, 0x04]);
            assert_eq!(report.rssi, -40);
        }
        other => panic!("{:?}", other),
    }

    air.host(0).stop_scanning().unwrap();
    assert_eq!(air.host(0).stop_scanning(), Err(Error::InvalidState));
}

#[test]
fn periodic_advertising_sync() {
    let mut air = Air::new(2);
    air.host(0)
        .start_periodic_advertising(Duration::from_millis(100), &[0x03, 0xFF, 0x12, 0x34])
        .unwrap();
    air.run_until(10, |air| air.nodes[0].periodic_sync_info().is_some());
    let sync = air.nodes[0].periodic_sync_info().unwrap();
    air.host(1).sync_periodic(&sync).unwrap();

    air.run_until(100, |air| {
        air.events[1]
            .iter()
            .filter(|e| matches!(e, HostEvent::PeriodicReport { .. }))
            .count()
            >= 3
    });
    assert!(air.events[1].iter().any(|e| match e {
        HostEvent::PeriodicReport { data, .. } => &data[..] == &[0x03, 0xFF, 0x12, 0x34],
        _ => false,
    }));

    air.host(0).stop_periodic_advertising().unwrap();
    air.run_until(20, |air| {
        air.find_event(1, |e| *e == HostEvent::PeriodicSyncLost)
            .is_some()
    });
    assert_eq!(air.host(1).terminate_sync(), Err(Error::InvalidState));
}

#[test]
fn key_agreement_runs_in_background() {
    let mut alice = controller(1);
    let mut bob = controller(2);
    assert!(!alice.run_background());

    let public_key = |ll: &mut LinkLayer<Sim>| {
        ll.generate_p256_keypair().unwrap();
        assert_eq!(ll.generate_p256_keypair(), Err(Error::InvalidState));
        assert!(ll.poll_event().is_none());
        assert!(ll.run_background());
        match ll.poll_event() {
            Some(HostEvent::ReadLocalP256Complete {
                status: ErrorCode::Success,
                key: Some(key),
            }) => key,
            other => panic!("{:?}", other),
        }
    };
    let alice_pk = public_key(&mut alice);
    let bob_pk = public_key(&mut bob);

    let dhkey = |ll: &mut LinkLayer<Sim>, peer| {
        ll.generate_dhkey(peer).unwrap();
        assert!(ll.run_background());
        ll.poll_event()
    };
    let a = dhkey(&mut alice, bob_pk);
    let b = dhkey(&mut bob, alice_pk);
    match (a, b) {
        (
            Some(HostEvent::DhKeyComplete {
                status: ErrorCode::Success,
                key: Some(a),
            }),
            Some(HostEvent::DhKeyComplete {
                status: ErrorCode::Success,
                key: Some(b),
            }),
        ) => assert_eq!(a, b),
        other => panic!("{:?}", other),
    }

    // The secret key was used up.
    assert_eq!(
        dhkey(&mut alice, bob_pk),
        Some(HostEvent::DhKeyComplete {
            status: ErrorCode::CommandDisallowed,
            key: None
        })
    );
}

#[test]
fn rand_and_encrypt() {
    let mut ll = controller(1);
    let a = ll.random().unwrap();
    let b = ll.random().unwrap();
    assert_ne!(a, b);

    // Session key derivation sample: e(LTK, SKD), least significant octet first.
    let key = [
        0xBF, 0x01, 0xFB, 0x9D, 0x4E, 0xF3, 0xBC, 0x36, 0xD8, 0x74, 0xF5, 0x39, 0x41, 0x38, 0x68,
        0x4C,
    ];
    let plaintext = [
        0x13, 0x02, 0xF1, 0xE0, 0xDF, 0xCE, 0xBD, 0xAC, 0x79, 0x68, 0x57, 0x46, 0x35, 0x24, 0x13,
        0x02,
    ];
    // SK 99AD1B52...27C2C666 (written most significant octet first), stored reversed.
    let expected = [
        0x66, 0xC6, 0xC2, 0x27, 0x8E, 0x3B, 0x8E, 0x05, 0x3E, 0x7E, 0xA3, 0x26, 0x52, 0x1B, 0xAD,
        0x99,
    ];
    assert_eq!(ll.encrypt(&key, &plaintext), expected);
}

#[test]
fn radio_failure_halts_controller() {
    let mut ll = controller(1);
    ll.start_advertising(Duration::from_millis(100), false, &[], &[])
        .unwrap();
    assert!(ll.radio().cmd.is_some());

    ll.radio_done(RadioEvent {
        status: RadioStatus::Failed(HardwareError::UNEXPECTED),
        timestamp: Instant::from_raw_micros(1_000),
        pdu: &[],
        crc_ok: false,
        rssi: 0,
    });
    assert!(ll.is_halted());
    assert!(ll.radio().cmd.is_none());
    assert_eq!(
        ll.poll_event(),
        Some(HostEvent::HardwareError(HardwareError::UNEXPECTED))
    );
    assert_eq!(ll.start_scanning(Duration::from_millis(10), Duration::from_millis(10)), Err(Error::Halted));
    assert_eq!(ll.update(), None);
}

#[test]
fn persistent_programming_failure_is_fatal() {
    let mut ll = controller(1);
    ll.radio().fail = Some(HardwareError::NO_TIMER);
    ll.start_advertising(Duration::from_millis(100), false, &[], &[])
        .unwrap();

    ll.timer().0 = Instant::from_raw_micros(0) + Duration::from_secs(20);
    let retry = ll.update().expect("retry requested");
    assert!(retry.is_after(ll.timer().now()));
    assert!(!ll.is_halted());

    ll.timer().0 = Instant::from_raw_micros(0) + Duration::from_secs(41);
    assert_eq!(ll.update(), None);
    assert!(ll.is_halted());
    assert_eq!(
        ll.poll_event(),
        Some(HostEvent::HardwareError(HardwareError::PROGRAMMING_TIMEOUT))
    );
}

#[test]
fn host_channel_map_reaches_connections() {
    let mut air = Air::new(2);
    let (m, s) = air.establish(0, 1, conn_params(24, 100));
    assert_eq!(
        air.host(0).set_host_channel_map(ChannelMap::from_raw([0x01, 0, 0, 0, 0])),
        Err(Error::InvalidValue)
    );
    let map = ChannelMap::from_raw([0xFF, 0x00, 0x00, 0x00, 0x00]);
    air.host(0).set_host_channel_map(map).unwrap();

    air.run_until(30, |air| {
        *air.nodes[0].connection(m).unwrap().channel_map() == map
            && *air.nodes[1].connection(s).unwrap().channel_map() == map
    });
    let before = air.nodes[0].connection(m).unwrap().stats().packets_rx;
    air.run_until(30, |air| {
        air.nodes[0].connection(m).unwrap().stats().packets_rx >= before + 20
    });
    assert!(air.nodes[0].connection(m).unwrap().channel().index() < 8);
}

#[test]
fn queued_update_waits_for_accepted_peer_request() {
    let mut air = Air::new(2);
    let (m, s) = air.establish(0, 1, conn_params(24, 100));
    air.host(0).read_remote_version(m).unwrap();
    air.host(0).read_remote_features(m).unwrap();
    air.host(0).update_connection(m, 40, 40, 0, 100).unwrap();
    air.host(1).update_connection(s, 30, 30, 0, 100).unwrap();

    air.run_until(400, |air| {
        let settled = |i: usize, h: ConnHandle| {
            air.nodes[i]
                .connection(h)
                .map_or(false, |c| c.params().interval == 40 && c.pending_update().is_none())
        };
        settled(0, m) && settled(1, s)
    });

    // The slave's request is granted first. The master's own update only goes out once that
    // one took effect.
    let instants: Vec<u16> = air
        .control_sent(0)
        .iter()
        .filter_map(|pdu| match pdu {
            ControlPdu::ConnectionUpdateInd(data) => Some(data.instant),
            _ => None,
        })
        .collect();
    assert_eq!(instants.len(), 2, "instants: {:?}", instants);
    assert!(instants[1].wrapping_sub(instants[0]) >= 6, "instants: {:?}", instants);
    assert!(air.has_event(
        1,
        &HostEvent::ConnectionUpdateComplete {
            handle: s,
            status: ErrorCode::Success,
            params: conn_params(30, 100),
        }
    ));
    assert_eq!(air.disconnection(0), None);
    assert_eq!(air.disconnection(1), None);
}

#[test]
fn peer_request_during_channel_map_update_is_rejected() {
    let mut air = Air::new(2);
    let (m, s) = air.establish(0, 1, conn_params(24, 100));
    let map = ChannelMap::from_raw([0xFF, 0xFF, 0x00, 0x00, 0x00]);
    air.host(0).set_host_channel_map(map).unwrap();
    air.host(1).update_connection(s, 30, 30, 0, 100).unwrap();

    let refused = HostEvent::ConnectionUpdateComplete {
        handle: s,
        status: ErrorCode::DifferentTransactionCollision,
        params: conn_params(24, 100),
    };
    air.run_until(50, |air| air.has_event(1, &refused));
    assert!(air.control_sent(0).contains(&ControlPdu::RejectExtInd {
        reject_opcode: ControlOpcode::ConnectionParamReq,
        error_code: ErrorCode::DifferentTransactionCollision,
    }));

    // The channel map update itself goes through.
    air.run_until(30, |air| {
        *air.nodes[0].connection(m).unwrap().channel_map() == map
            && *air.nodes[1].connection(s).unwrap().channel_map() == map
    });
    assert_eq!(air.nodes[1].connection(s).unwrap().params(), conn_params(24, 100));
    assert_eq!(air.disconnection(0), None);
    assert_eq!(air.disconnection(1), None);
}

#[test]
fn unanswered_encryption_request_times_out() {
    let mut params = Params::default();
    params.ctrl_proc_timeout = Duration::from_secs(1);
    let mut air = Air::with_params(2, params);
    let (m, _) = air.establish(0, 1, conn_params(24, 300));
    air.host(0).start_encryption(m, [1; 16], [2; 8], 3).unwrap();
    air.run_until(50, |air| {
        air.find_event(1, |e| matches!(e, HostEvent::LtkRequest { .. }))
            .is_some()
    });

    // The slave's host never answers.
    air.run_until(200, |air| air.disconnection(0).is_some());
    assert_eq!(air.disconnection(0), Some(ErrorCode::LlResponseTimeout));

    // Waiting for the host's key isn't bounded by the response timer. The slave only notices
    // that the master is gone.
    air.run_until(400, |air| air.disconnection(1).is_some());
    assert_eq!(air.disconnection(1), Some(ErrorCode::ConnectionTimeout));
}

#[test]
fn key_refresh_installs_new_session_key() {
    let mut air = Air::new(2);
    let (m, s) = air.establish(0, 1, conn_params(24, 100));
    let session_key = |air: &Air, i: usize, h: ConnHandle| {
        let enc = air.nodes[i].connection(h).unwrap().encryption();
        derive_session_key(
            enc.ltk().unwrap(),
            &enc.master_material().skd_m,
            &enc.slave_material().skd_s,
        )
    };

    air.encrypt(m, s, [0x11; 16]);
    let old = session_key(&air, 0, m);
    assert_eq!(session_key(&air, 1, s), old);

    let second = [0x22; 16];
    air.encrypt(m, s, second);
    air.run_until(20, |air| {
        air.has_event(
            1,
            &HostEvent::EncryptionKeyRefresh {
                handle: s,
                status: ErrorCode::Success,
            },
        )
    });
    assert!(air.has_event(
        0,
        &HostEvent::EncryptionKeyRefresh {
            handle: m,
            status: ErrorCode::Success,
        }
    ));
    let changes = air.events[0]
        .iter()
        .filter(|e| matches!(e, HostEvent::EncryptionChange { .. }))
        .count();
    assert_eq!(changes, 1);

    let new = session_key(&air, 0, m);
    assert_eq!(session_key(&air, 1, s), new);
    assert_ne!(new, old);
    assert_eq!(air.nodes[1].connection(s).unwrap().encryption().ltk(), Some(&second));

    let message = b"after refresh";
    air.host(0).send_data(m, Llid::DataStart, message).unwrap();
    let mut received: Option<DataPdu> = None;
    air.run_until(20, |air| {
        if received.is_none() {
            received = air.host(1).receive_data(s).unwrap();
        }
        received.is_some()
    });
    assert_eq!(received.unwrap().payload(), &message[..]);
    assert_eq!(air.disconnection(1), None);
}

#[test]
fn authenticated_payload_timeout() {
    let mut air = Air::new(2);
    let (m, s) = air.establish(0, 1, conn_params(24, 100));
    air.encrypt(m, s, [0x33; 16]);
    air.host(0)
        .set_authenticated_payload_timeout(m, Duration::from_millis(300))
        .unwrap();

    // Halfway through, the master pings, and the answer keeps the link authenticated.
    air.run_until(100, |air| {
        air.nodes[0].connection(m).unwrap().procedures().active_kind()
            == Some(ProcedureKind::Ping)
    });
    let expired = HostEvent::AuthenticatedPayloadTimeoutExpired { handle: m };
    let until = air.event_counter(0, m).wrapping_add(40);
    air.run_until(200, |air| air.event_counter(0, m) == until);
    assert!(!air.has_event(0, &expired));

    // Nothing gets through for longer than the timeout.
    air.jammed = true;
    air.run_until(100, |air| air.has_event(0, &expired));
    air.jammed = false;
    assert_eq!(air.disconnection(0), None);
    assert_eq!(air.disconnection(1), None);
}

#[test]
fn update_heard_after_its_instant_ends_connection() {
    let mut air = Air::new(2);
    let (m, s) = air.establish(0, 1, conn_params(24, 300));
    // All channels but 0, so both sides still meet on most events after the instant.
    let map = ChannelMap::from_raw([0xFE, 0xFF, 0xFF, 0xFF, 0x1F]);
    air.host(0).set_host_channel_map(map).unwrap();
    air.run_until(20, |air| {
        air.nodes[0].connection(m).unwrap().pending_update().is_some()
    });
    let (instant, update) = air.nodes[0].connection(m).unwrap().pending_update().unwrap();
    assert_eq!(update, InstantUpdate::ChannelMap(map));

    // The slave misses every transmission of the indication until the instant is over.
    air.jammed = true;
    air.run_until(50, |air| air.event_counter(0, m) == instant.wrapping_add(1));
    air.jammed = false;

    air.run_until(200, |air| air.disconnection(1).is_some());
    assert_eq!(air.disconnection(1), Some(ErrorCode::InstantPassed));
    assert!(air.nodes[1].connection(s).is_none());
}
