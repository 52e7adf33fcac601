//! State of the roles that don't involve a connection.
//!
//! The `LinkLayer` owns at most one of each and dispatches to them by [`TaskKind`]. They build the
//! PDUs the radio sends and interpret what it receives, but never touch the radio themselves.
//!
//! [`TaskKind`]: ../scheduler/enum.TaskKind.html

use {
    super::{
        advertising::{AdvPdu, ConnectRequestData, PduType, MAX_ADV_DATA},
        channel_map::ChannelMap,
        channel_selection::ChannelSelection,
        connection::ConnParams,
        device_address::DeviceAddress,
        PduBuf, MAX_PDU_SIZE,
    },
    crate::{
        phy::{AdvertisingChannel, DataChannel},
        time::{Duration, Instant},
        Error,
    },
    core::num::Wrapping,
    heapless::Vec,
};

/// Advertising data or scan response data.
pub type AdvData = Vec<u8, MAX_ADV_DATA>;

/// Consecutive periodic advertising events without a packet after which the sync is lost.
pub const SYNC_TIMEOUT_EVENTS: u32 = 6;

/// Encodes a PDU into a radio buffer using `encode`.
pub(crate) fn encode_pdu(
    encode: impl FnOnce(&mut [u8]) -> Result<usize, Error>,
) -> Result<PduBuf, Error> {
    let mut buf = [0; MAX_PDU_SIZE];
    let len = encode(&mut buf)?;
    Vec::from_slice(&buf[..len]).map_err(|_| Error::InvalidLength)
}

fn adv_data(data: &[u8]) -> Result<AdvData, Error> {
    Vec::from_slice(data).map_err(|_| Error::InvalidLength)
}

/// Legacy advertising.
///
/// Every advertising event visits the three primary channels in order. Each visit is one task
/// occurrence: the PDU is sent and the radio listens for a `SCAN_REQ` or `CONNECT_IND`.
#[derive(Debug, Clone)]
pub struct Advertiser {
    pub interval: Duration,
    pub connectable: bool,
    adv_data: AdvData,
    scan_data: AdvData,
    channel: AdvertisingChannel,
    /// Start of the current advertising event.
    event_start: Option<Instant>,
}

impl Advertiser {
    pub fn new(
        interval: Duration,
        connectable: bool,
        adv_data: &[u8],
        scan_data: &[u8],
    ) -> Result<Self, Error> {
        // advInterval is 20 ms to 10.24 s.
        if !(20_000..=10_240_000).contains(&interval.as_micros()) {
            return Err(Error::InvalidValue);
        }
        Ok(Self {
            interval,
            connectable,
            adv_data: self::adv_data(adv_data)?,
            scan_data: self::adv_data(scan_data)?,
            channel: AdvertisingChannel::first(),
            event_start: None,
        })
    }

    pub fn channel(&self) -> AdvertisingChannel {
        self.channel
    }

    /// Builds the advertising PDU for the current channel.
    pub fn pdu(&self, address: DeviceAddress, ch_sel: bool) -> Result<PduBuf, Error> {
        let pdu = if self.connectable {
            AdvPdu::AdvInd {
                adv_a: address,
                data: &self.adv_data,
            }
        } else if self.scan_data.is_empty() {
            AdvPdu::AdvNonconnInd {
                adv_a: address,
                data: &self.adv_data,
            }
        } else {
            AdvPdu::AdvScanInd {
                adv_a: address,
                data: &self.adv_data,
            }
        };
        encode_pdu(|buf| pdu.encode(ch_sel, buf))
    }

    pub fn scan_response(&self, address: DeviceAddress) -> Result<PduBuf, Error> {
        let pdu = AdvPdu::ScanRsp {
            adv_a: address,
            data: &self.scan_data,
        };
        encode_pdu(|buf| pdu.encode(false, buf))
    }

    /// Returns whether a `SCAN_REQ` is answered.
    pub fn is_scannable(&self) -> bool {
        self.connectable || !self.scan_data.is_empty()
    }

    /// Records that a channel visit started at `start`.
    pub fn visit_started(&mut self, start: Instant) {
        if self.channel == AdvertisingChannel::first() {
            self.event_start = Some(start);
        }
    }

    /// Moves to the next channel. Returns the start of the next visit: right after `end` within
    /// an event, one interval plus `adv_delay` after the event start otherwise.
    pub fn next_visit(&mut self, end: Instant, adv_delay: Duration) -> Instant {
        self.channel = self.channel.cycle();
        if self.channel == AdvertisingChannel::first() {
            let start = self.event_start.take().unwrap_or(end);
            (start + self.interval + adv_delay).max(end)
        } else {
            end
        }
    }
}

/// Passive scanning.
#[derive(Debug, Clone)]
pub struct Scanner {
    pub interval: Duration,
    pub window: Duration,
    channel: AdvertisingChannel,
}

impl Scanner {
    pub fn new(interval: Duration, window: Duration) -> Result<Self, Error> {
        check_scan_timing(interval, window)?;
        Ok(Self {
            interval,
            window,
            channel: AdvertisingChannel::first(),
        })
    }

    pub fn channel(&self) -> AdvertisingChannel {
        self.channel
    }

    /// Switches channel after a scan window.
    pub fn window_done(&mut self) {
        self.channel = self.channel.cycle();
    }
}

/// 2.5 ms to 10.24 s, and the window can't exceed the interval.
fn check_scan_timing(interval: Duration, window: Duration) -> Result<(), Error> {
    let range = 2_500..=10_240_000;
    if range.contains(&interval.as_micros())
        && range.contains(&window.as_micros())
        && window.as_micros() <= interval.as_micros()
    {
        Ok(())
    } else {
        Err(Error::InvalidValue)
    }
}

/// A received advertising PDU, as reported to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvReport {
    pub kind: PduType,
    pub address: DeviceAddress,
    pub rssi: i8,
    pub data: AdvData,
}

impl AdvReport {
    /// Creates a report for the advertising PDUs a scanner reports.
    pub fn from_pdu(pdu: &AdvPdu<'_>, rssi: i8) -> Option<Self> {
        let (address, data): (_, &[u8]) = match *pdu {
            AdvPdu::AdvInd { adv_a, data }
            | AdvPdu::AdvNonconnInd { adv_a, data }
            | AdvPdu::AdvScanInd { adv_a, data }
            | AdvPdu::ScanRsp { adv_a, data } => (adv_a, data),
            AdvPdu::AdvDirectInd { adv_a, .. } => (adv_a, &[]),
            AdvPdu::ScanReq { .. } | AdvPdu::ConnectInd { .. } => return None,
        };
        Some(Self {
            kind: pdu.pdu_type(),
            address,
            rssi,
            data: Vec::from_slice(data).ok()?,
        })
    }
}

/// Initiating: scanning for one advertiser and connecting to it.
#[derive(Debug, Clone)]
pub struct Initiator {
    /// Advertiser to connect to. Any connectable advertiser if `None`.
    pub peer: Option<DeviceAddress>,
    pub interval: Duration,
    pub window: Duration,
    pub params: ConnParams,
    channel: AdvertisingChannel,
}

impl Initiator {
    pub fn new(
        peer: Option<DeviceAddress>,
        interval: Duration,
        window: Duration,
        params: ConnParams,
    ) -> Result<Self, Error> {
        check_scan_timing(interval, window)?;
        if !params.is_valid() {
            return Err(Error::InvalidValue);
        }
        Ok(Self {
            peer,
            interval,
            window,
            params,
            channel: AdvertisingChannel::first(),
        })
    }

    pub fn channel(&self) -> AdvertisingChannel {
        self.channel
    }

    pub fn window_done(&mut self) {
        self.channel = self.channel.cycle();
    }

    /// Returns whether we connect in response to `pdu`.
    pub fn accepts(&self, pdu: &AdvPdu<'_>, own: DeviceAddress) -> bool {
        let directed_ok = match pdu {
            AdvPdu::AdvDirectInd { target_a, .. } => *target_a == own,
            _ => true,
        };
        pdu.is_connectable()
            && directed_ok
            && self.peer.map_or(true, |peer| peer == pdu.advertiser())
    }

    /// Builds the `LLData` of the `CONNECT_IND` we send.
    pub fn connect_request(
        &self,
        access_address: u32,
        crc_init: u32,
        hop: u8,
        win_offset: u16,
        channel_map: ChannelMap,
        sca: super::advertising::SleepClockAccuracy,
    ) -> ConnectRequestData {
        ConnectRequestData {
            access_address,
            crc_init,
            win_size: 1,
            win_offset,
            interval: self.params.interval,
            latency: self.params.latency,
            timeout: self.params.timeout,
            channel_map,
            hop,
            sca,
        }
    }
}

/// What a periodic scanner needs to follow a periodic advertising train.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PeriodicSync {
    pub access_address: u32,
    pub crc_init: u32,
    pub channel_map: ChannelMap,
    pub interval: Duration,
    /// Start of the event with counter `event_counter`.
    pub anchor: Instant,
    pub event_counter: u16,
}

/// Event counting and channel hopping shared by both periodic roles.
///
/// Periodic advertising hops with Channel Selection Algorithm #2, keyed by its access address.
#[derive(Debug, Clone)]
pub struct PeriodicTrain {
    pub access_address: u32,
    pub crc_init: u32,
    pub channel_map: ChannelMap,
    pub interval: Duration,
    selection: ChannelSelection,
    counter: Wrapping<u16>,
}

impl PeriodicTrain {
    fn new(
        access_address: u32,
        crc_init: u32,
        channel_map: ChannelMap,
        interval: Duration,
        counter: u16,
    ) -> Result<Self, Error> {
        // 7.5 ms to 81.91875 s.
        if !channel_map.is_valid() || !(7_500..=81_918_750).contains(&interval.as_micros()) {
            return Err(Error::InvalidValue);
        }
        Ok(Self {
            access_address,
            crc_init,
            channel_map,
            interval,
            selection: ChannelSelection::csa2(access_address),
            counter: Wrapping(counter),
        })
    }

    pub fn event_counter(&self) -> u16 {
        self.counter.0
    }

    /// Channel of the upcoming event.
    pub fn channel(&mut self) -> DataChannel {
        self.selection.select(self.counter.0, &self.channel_map)
    }

    pub fn event_done(&mut self) {
        self.counter += Wrapping(1);
    }
}

/// Periodic advertising.
#[derive(Debug, Clone)]
pub struct PeriodicAdvertiser {
    pub train: PeriodicTrain,
    data: AdvData,
}

impl PeriodicAdvertiser {
    pub fn new(
        access_address: u32,
        crc_init: u32,
        channel_map: ChannelMap,
        interval: Duration,
        data: &[u8],
    ) -> Result<Self, Error> {
        Ok(Self {
            train: PeriodicTrain::new(access_address, crc_init, channel_map, interval, 0)?,
            data: adv_data(data)?,
        })
    }

    pub fn pdu(&self, address: DeviceAddress) -> Result<PduBuf, Error> {
        let pdu = AdvPdu::AdvNonconnInd {
            adv_a: address,
            data: &self.data,
        };
        encode_pdu(|buf| pdu.encode(false, buf))
    }

    /// Sync information for an event starting at `anchor`.
    pub fn sync_info(&self, anchor: Instant) -> PeriodicSync {
        PeriodicSync {
            access_address: self.train.access_address,
            crc_init: self.train.crc_init,
            channel_map: self.train.channel_map,
            interval: self.train.interval,
            anchor,
            event_counter: self.train.event_counter(),
        }
    }
}

/// A synchronized periodic scanner.
#[derive(Debug, Clone)]
pub struct PeriodicScanner {
    pub train: PeriodicTrain,
    /// Consecutive events without a packet.
    pub missed: u32,
}

impl PeriodicScanner {
    pub fn new(sync: &PeriodicSync) -> Result<Self, Error> {
        Ok(Self {
            train: PeriodicTrain::new(
                sync.access_address,
                sync.crc_init,
                sync.channel_map,
                sync.interval,
                sync.event_counter,
            )?,
            missed: 0,
        })
    }

    /// Records the outcome of an event. Returns `false` once the sync is lost.
    pub fn event_done(&mut self, received: bool) -> bool {
        self.train.event_done();
        if received {
            self.missed = 0;
        } else {
            self.missed += 1;
        }
        self.missed < SYNC_TIMEOUT_EVENTS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::device_address::AddressKind;

    fn addr(b: u8) -> DeviceAddress {
        DeviceAddress::new([b, 1, 2, 3, 4, 0xC5], AddressKind::Random)
    }

    #[test]
    fn advertiser_visits_all_channels_per_event() {
        let mut adv = Advertiser::new(Duration::from_millis(100), true, &[2, 1, 6], &[]).unwrap();
        let t0 = Instant::from_raw_micros(1_000);
        let delay = Duration::from_millis(3);

        adv.visit_started(t0);
        let t1 = adv.next_visit(t0 + Duration::from_millis(1), delay);
        assert_eq!(t1, t0 + Duration::from_millis(1));
        assert_eq!(adv.channel().index(), 38);

        adv.visit_started(t1);
        let t2 = adv.next_visit(t1 + Duration::from_millis(1), delay);
        assert_eq!(adv.channel().index(), 39);

        adv.visit_started(t2);
        let next = adv.next_visit(t2 + Duration::from_millis(1), delay);
        assert_eq!(adv.channel().index(), 37);
        assert_eq!(next, t0 + Duration::from_millis(103));
    }

    #[test]
    fn advertiser_pdus() {
        let adv = Advertiser::new(Duration::from_millis(100), false, &[1, 2, 3], &[]).unwrap();
        assert!(!adv.is_scannable());
        let raw = adv.pdu(addr(1), false).unwrap();
        let (_, pdu) = AdvPdu::decode(&raw).unwrap();
        assert_eq!(
            pdu,
            AdvPdu::AdvNonconnInd {
                adv_a: addr(1),
                data: &[1, 2, 3]
            }
        );

        assert_eq!(
            Advertiser::new(Duration::from_millis(100), true, &[0; 32], &[]).err(),
            Some(Error::InvalidLength)
        );
        assert_eq!(
            Advertiser::new(Duration::from_millis(10), true, &[], &[]).err(),
            Some(Error::InvalidValue)
        );
    }

    #[test]
    fn initiator_filters_advertisers() {
        let params = ConnParams {
            interval: 40,
            latency: 0,
            timeout: 100,
        };
        let init = Initiator::new(
            Some(addr(1)),
            Duration::from_millis(100),
            Duration::from_millis(50),
            params,
        )
        .unwrap();
        let own = addr(9);
        assert!(init.accepts(
            &AdvPdu::AdvInd {
                adv_a: addr(1),
                data: &[]
            },
            own
        ));
        assert!(!init.accepts(
            &AdvPdu::AdvInd {
                adv_a: addr(2),
                data: &[]
            },
            own
        ));
        assert!(!init.accepts(
            &AdvPdu::AdvNonconnInd {
                adv_a: addr(1),
                data: &[]
            },
            own
        ));
        assert!(!init.accepts(
            &AdvPdu::AdvDirectInd {
                adv_a: addr(1),
                target_a: addr(3)
            },
            own
        ));
    }

    #[test]
    fn periodic_sync_loss() {
        let adv = PeriodicAdvertiser::new(
            0x1234_5678,
            0x55_5555,
            ChannelMap::with_all_channels(),
            Duration::from_millis(10),
            &[1],
        )
        .unwrap();
        let mut scanner = PeriodicScanner::new(&adv.sync_info(Instant::from_raw_micros(0))).unwrap();
        for _ in 0..SYNC_TIMEOUT_EVENTS - 1 {
            assert!(scanner.event_done(false));
        }
        assert!(scanner.event_done(true));
        for _ in 0..SYNC_TIMEOUT_EVENTS - 1 {
            assert!(scanner.event_done(false));
        }
        assert!(!scanner.event_done(false));
        assert_eq!(scanner.train.event_counter(), 2 * SYNC_TIMEOUT_EVENTS as u16);
    }

    #[test]
    fn periodic_roles_hop_identically() {
        let mut adv = PeriodicAdvertiser::new(
            0x8E89_1234,
            0x12_3456,
            ChannelMap::with_all_channels(),
            Duration::from_millis(20),
            &[],
        )
        .unwrap();
        let mut scanner = PeriodicScanner::new(&adv.sync_info(Instant::from_raw_micros(0))).unwrap();
        for _ in 0..20 {
            assert_eq!(adv.train.channel(), scanner.train.channel());
            adv.train.event_done();
            scanner.event_done(true);
        }
    }
}
