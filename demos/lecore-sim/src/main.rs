//! Runs two controllers against each other over a simulated radio.
//!
//! Node A advertises and node B connects to it. B then encrypts the link, switches both
//! directions to the 2M PHY and sends a few L2CAP fragments, after which it disconnects. Every
//! host event is logged with the simulated time; set `LECORE_LOG=trace` to also see the
//! scheduler's decisions.

mod logging;

use {
    lecore::{
        config::{Config, Params},
        ecdh::P256Provider,
        link::{
            connection::ConnParams,
            data::Llid,
            device_address::{AddressKind, DeviceAddress},
            scheduler::PriorityTable,
            ConnHandle, HostEvent, LinkLayer, PduBuf, Radio, RadioCommand, RadioEvent, RadioOp,
        },
        phy::PhySet,
        security::rng::testing::XorShiftTrng,
        time::{Duration, Timer},
        Error, ErrorCode, HardwareError,
    },
    log::{info, warn},
    logging::SimTimer,
};

const ADV_DATA: [u8; 13] = [
    0x02, 0x01, 0x06, // flags
    0x09, 0x09, b'l', b'e', b'c', b'o', b'r', b'e', b'-', b'A', // complete local name
];

const LTK: [u8; 16] = [
    0x9A, 0x2B, 0x11, 0x03, 0x5C, 0xD0, 0x77, 0x41, 0xE2, 0x08, 0x6F, 0x3D, 0xB4, 0xC9, 0x15, 0x80,
];
const RAND: [u8; 8] = [0x74, 0x4E, 0x3A, 0x9E, 0x12, 0x7B, 0x5D, 0x61];
const EDIV: u16 = 0x2474;

const MESSAGES: [&[u8]; 3] = [b"first fragment", b"second fragment", b"last fragment"];

/// Upper bound on simulated radio operations.
const MAX_STEPS: usize = 100_000;

/// How long a transmitter keeps listening for a reply that never comes.
const REPLY_TIMEOUT: Duration = Duration::from_micros(100);

struct Sim;

impl Config for Sim {
    type Timer = SimTimer;
    type Radio = SimRadio;
    type Trng = XorShiftTrng;
    type EcdhProvider = P256Provider;
    type SecondaryPolicy = PriorityTable;
}

/// Records the programmed operation. The air interface executes it.
#[derive(Default)]
struct SimRadio {
    cmd: Option<RadioCommand>,
    response: Option<PduBuf>,
}

impl Radio for SimRadio {
    fn program(&mut self, cmd: &RadioCommand) -> Result<(), HardwareError> {
        self.cmd = Some(cmd.clone());
        Ok(())
    }

    fn respond(&mut self, pdu: &[u8]) {
        self.response = PduBuf::from_slice(pdu).ok();
    }

    fn abort(&mut self) {
        self.cmd = None;
    }
}

fn node(id: u8) -> LinkLayer<Sim> {
    LinkLayer::new(
        DeviceAddress::new([id, 0x5E, 0xC0, 0x1E, 0x00, 0xC0], AddressKind::Random),
        Params::default(),
        SimTimer,
        SimRadio::default(),
        XorShiftTrng::new(0xC0FF_EE00 | u32::from(id)),
        P256Provider::new(),
        PriorityTable::default(),
    )
}

fn air_time(cmd: &RadioCommand, len: usize) -> Duration {
    Duration::from_micros(u32::from(cmd.phy.packet_time(len as u16 - 2)))
}

/// Two controllers sharing one medium.
struct Air {
    nodes: [LinkLayer<Sim>; 2],
}

impl Air {
    /// Executes the radio operation that completes first. Returns `false` once both radios are
    /// idle.
    fn step(&mut self) -> bool {
        let due = |ll: &mut LinkLayer<Sim>| {
            ll.radio().cmd.as_ref().map(|cmd| match cmd.op {
                RadioOp::Listen { window } => cmd.start + window,
                _ => cmd.start,
            })
        };
        let i = match (due(&mut self.nodes[0]), due(&mut self.nodes[1])) {
            (Some(a), Some(b)) => {
                if b.is_before(a) {
                    1
                } else {
                    0
                }
            }
            (Some(_), None) => 0,
            (None, Some(_)) => 1,
            (None, None) => return false,
        };
        let cmd = match self.nodes[i].radio().cmd.take() {
            Some(cmd) => cmd,
            None => return false,
        };
        let (pdu, listen) = match &cmd.op {
            RadioOp::Listen { window } => {
                let end = cmd.start + *window;
                logging::advance(end);
                self.nodes[i].radio_done(RadioEvent::done(end));
                return true;
            }
            RadioOp::Transmit(pdu) => (pdu.clone(), false),
            RadioOp::TransmitListen(pdu) => (pdu.clone(), true),
        };

        let tx_end = cmd.start + air_time(&cmd, pdu.len());
        let peer = 1 - i;
        let heard = match &self.nodes[peer].radio().cmd {
            Some(rx) => match rx.op {
                RadioOp::Listen { window } => {
                    rx.channel == cmd.channel
                        && rx.access_address == cmd.access_address
                        && !cmd.start.is_before(rx.start)
                        && !cmd.start.is_after(rx.start + window)
                }
                _ => false,
            },
            None => false,
        };
        let reply = if heard {
            self.nodes[peer].radio().cmd = None;
            logging::advance(tx_end);
            self.nodes[peer].radio_done(RadioEvent::received(cmd.start, &pdu, true, -52));
            self.nodes[peer].radio().response.take()
        } else {
            None
        };

        match reply {
            Some(rsp) if listen => {
                let rsp_start = tx_end + Duration::T_IFS;
                let rsp_end = rsp_start + air_time(&cmd, rsp.len());
                logging::advance(rsp_end);
                self.nodes[i].radio_done(RadioEvent::received(rsp_start, &rsp, true, -48));
            }
            _ => {
                let end = if listen {
                    tx_end + Duration::T_IFS + REPLY_TIMEOUT
                } else {
                    tx_end
                };
                logging::advance(end);
                self.nodes[i].radio_done(RadioEvent::done(end));
            }
        }
        true
    }
}

#[derive(Default)]
struct Progress {
    master: Option<ConnHandle>,
    slave: Option<ConnHandle>,
    received: usize,
    disconnected: usize,
}

fn handle_event(air: &mut Air, i: usize, event: HostEvent, progress: &mut Progress) -> Result<(), Error> {
    let name = ["A", "B"][i];
    info!("{}: {:?}", name, event);
    let ll = &mut air.nodes[i];
    match event {
        HostEvent::ConnectionComplete { handle, .. } if i == 1 => {
            progress.master = Some(handle);
            ll.read_remote_version(handle)?;
            ll.start_encryption(handle, LTK, RAND, EDIV)?;
        }
        HostEvent::ConnectionComplete { handle, .. } => progress.slave = Some(handle),
        HostEvent::LtkRequest { handle, rand, ediv } => {
            if rand == RAND && ediv == EDIV {
                ll.ltk_reply(handle, LTK)?;
            } else {
                ll.ltk_negative_reply(handle)?;
            }
        }
        HostEvent::EncryptionChange {
            handle,
            status: ErrorCode::Success,
            ..
        } if i == 1 => {
            ll.set_phy(handle, PhySet::LE_2M, PhySet::LE_2M)?;
            for msg in MESSAGES.iter() {
                ll.send_data(handle, Llid::DataStart, msg)?;
            }
        }
        HostEvent::EncryptionChange { status, .. } if status != ErrorCode::Success => {
            warn!("{}: encryption failed", name);
        }
        HostEvent::DisconnectionComplete { .. } => progress.disconnected += 1,
        _ => {}
    }
    Ok(())
}

fn main() -> Result<(), Error> {
    logging::init();

    let mut a = node(0xA0);
    let mut b = node(0xB0);
    let params = ConnParams {
        interval: 24,
        latency: 0,
        timeout: 200,
    };
    a.generate_p256_keypair()?;
    a.start_advertising(Duration::from_millis(30), true, &ADV_DATA, &[])?;
    b.create_connection(
        Some(a.address()),
        Duration::from_millis(10),
        Duration::from_millis(10),
        params,
    )?;

    let mut air = Air { nodes: [a, b] };
    let mut progress = Progress::default();
    for _ in 0..MAX_STEPS {
        if !air.step() {
            break;
        }
        for i in 0..2 {
            air.nodes[i].run_background();
            while let Some(event) = air.nodes[i].poll_event() {
                handle_event(&mut air, i, event, &mut progress)?;
            }
        }

        if let Some(handle) = progress.slave {
            if let Ok(Some(pdu)) = air.nodes[0].receive_data(handle) {
                info!("A: received {:?}", String::from_utf8_lossy(pdu.payload()));
                progress.received += 1;
                if progress.received == MESSAGES.len() {
                    if let Some(master) = progress.master {
                        air.nodes[1].disconnect(master, ErrorCode::RemoteUserTerminated)?;
                    }
                }
            }
        }
        if progress.disconnected == 2 {
            break;
        }
    }

    let now = SimTimer.now();
    if progress.disconnected == 2 {
        info!("done at {}", now);
    } else {
        warn!(
            "stopped at {} with {} of {} messages delivered",
            now,
            progress.received,
            MESSAGES.len()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adv_data_is_well_formed() {
        let mut rest = &ADV_DATA[..];
        let mut types = Vec::new();
        while let Some((&len, tail)) = rest.split_first() {
            let len = usize::from(len);
            assert!(len >= 1 && len <= tail.len(), "AD structure overruns: {:?}", rest);
            types.push(tail[0]);
            rest = &tail[len..];
        }
        assert_eq!(types, [0x01, 0x09]);
        assert_eq!(&ADV_DATA[5..], b"lecore-A");
    }
}
