//! Advertising channel PDUs.
//!
//! Only the parts of the advertising state machine the scheduler needs are modelled: the legacy
//! PDUs sent and received on the primary channels, and the `CONNECT_IND` that turns an advertiser
//! and an initiator into a connected slave and master.

use {
    super::{channel_map::ChannelMap, device_address::DeviceAddress},
    crate::{bytes::*, time::Duration, utils::HexSlice, Error},
    core::fmt,
};

/// Access address used on the primary advertising channels.
pub const ADVERTISING_ADDRESS: u32 = 0x8E89_BED6;

/// CRC initialization value used on the primary advertising channels.
pub const CRC_PRESET: u32 = 0x55_5555;

/// Maximum length of advertising or scan response data in legacy PDUs.
pub const MAX_ADV_DATA: usize = 31;

const CH_SEL: u16 = 1 << 5;
const TX_ADD: u16 = 1 << 6;
const RX_ADD: u16 = 1 << 7;

/// 16-bit Advertising Channel PDU header.
///
/// ```notrust
/// LSB                                                                     MSB
/// +------------+-------+---------+---------+---------+--------------+---------+
/// |  PDU Type  |   -   |  ChSel  |  TxAdd  |  RxAdd  |    Length    |    -    |
/// |  (4 bits)  |(1 bit)| (1 bit) | (1 bit) | (1 bit) |   (6 bits)   |(2 bits) |
/// +------------+-------+---------+---------+---------+--------------+---------+
/// ```
///
/// `ChSel` is only meaningful in `ADV_IND`, `ADV_DIRECT_IND` and `CONNECT_IND`, where it advertises
/// support for Channel Selection Algorithm #2.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Header(u16);

impl Header {
    pub fn new(ty: PduType) -> Self {
        Header(u16::from(u8::from(ty)))
    }

    pub fn from_u16(raw: u16) -> Self {
        Header(raw)
    }

    pub fn to_u16(&self) -> u16 {
        self.0
    }

    fn set_bit(&mut self, mask: u16, value: bool) {
        if value {
            self.0 |= mask;
        } else {
            self.0 &= !mask;
        }
    }

    pub fn type_(&self) -> PduType {
        PduType::from((self.0 & 0b1111) as u8)
    }

    pub fn ch_sel(&self) -> bool {
        self.0 & CH_SEL != 0
    }

    pub fn set_ch_sel(&mut self, value: bool) {
        self.set_bit(CH_SEL, value);
    }

    pub fn tx_add(&self) -> bool {
        self.0 & TX_ADD != 0
    }

    pub fn set_tx_add(&mut self, value: bool) {
        self.set_bit(TX_ADD, value);
    }

    pub fn rx_add(&self) -> bool {
        self.0 & RX_ADD != 0
    }

    pub fn set_rx_add(&mut self, value: bool) {
        self.set_bit(RX_ADD, value);
    }

    /// Returns the 6-bit payload length.
    pub fn payload_length(&self) -> u8 {
        ((self.0 >> 8) & 0x3F) as u8
    }

    pub fn set_payload_length(&mut self, length: u8) -> Result<(), Error> {
        if length > 0x3F {
            return Err(Error::InvalidLength);
        }
        self.0 = (self.0 & 0x00FF) | (u16::from(length) << 8);
        Ok(())
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field("PDU Type", &self.type_())
            .field("ChSel", &self.ch_sel())
            .field("TxAdd", &self.tx_add())
            .field("RxAdd", &self.rx_add())
            .field("len", &self.payload_length())
            .finish()
    }
}

enum_with_unknown! {
    /// 4-bit PDU type in the advertising header.
    #[derive(Debug)]
    pub enum PduType(u8) {
        /// Connectable and scannable undirected advertising.
        AdvInd = 0b0000,
        /// Connectable directed advertising.
        AdvDirectInd = 0b0001,
        /// Non-connectable, non-scannable undirected advertising.
        AdvNonconnInd = 0b0010,
        ScanReq = 0b0011,
        ScanRsp = 0b0100,
        ConnectInd = 0b0101,
        /// Scannable undirected advertising.
        AdvScanInd = 0b0110,
    }
}

/// Sleep clock accuracy bucket, as encoded in the 3-bit `SCA` field.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SleepClockAccuracy(u8);

impl SleepClockAccuracy {
    const PPM: [u16; 8] = [500, 250, 150, 100, 75, 50, 30, 20];

    pub fn from_field(raw: u8) -> Self {
        SleepClockAccuracy(raw & 0b111)
    }

    /// Returns the narrowest bucket that covers `ppm`.
    pub fn from_ppm(ppm: u16) -> Self {
        let field = Self::PPM
            .iter()
            .rposition(|&limit| ppm <= limit)
            .unwrap_or(0);
        SleepClockAccuracy(field as u8)
    }

    pub fn field(&self) -> u8 {
        self.0
    }

    /// Worst-case drift in parts per million.
    pub fn ppm(&self) -> u16 {
        Self::PPM[usize::from(self.0)]
    }
}

/// `LLData` of a `CONNECT_IND`: the initial parameters of a connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ConnectRequestData {
    pub access_address: u32,
    pub crc_init: u32,
    /// Transmit window size in 1.25 ms units.
    pub win_size: u8,
    /// Transmit window offset in 1.25 ms units.
    pub win_offset: u16,
    /// Connection interval in 1.25 ms units.
    pub interval: u16,
    pub latency: u16,
    /// Supervision timeout in 10 ms units.
    pub timeout: u16,
    pub channel_map: ChannelMap,
    pub hop: u8,
    pub sca: SleepClockAccuracy,
}

impl ConnectRequestData {
    pub fn interval(&self) -> Duration {
        Duration::from_conn_units(self.interval)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_supervision_units(self.timeout)
    }

    pub fn win_offset(&self) -> Duration {
        Duration::from_conn_units(self.win_offset)
    }

    pub fn win_size(&self) -> Duration {
        Duration::from_conn_units(u16::from(self.win_size))
    }

    /// Checks the parameter ranges of Core Vol 6, Part B, 2.3.3.1.
    pub fn validate(&self) -> Result<(), Error> {
        let interval_ok = (6..=3200).contains(&self.interval);
        let timeout_ok = (10..=3200).contains(&self.timeout);
        let hop_ok = (5..=16).contains(&self.hop);
        let window_ok = self.win_size >= 1
            && u16::from(self.win_size) <= 8
            && u16::from(self.win_size) <= self.interval.saturating_sub(1)
            && self.win_offset <= self.interval;
        // Timeout must exceed (1 + latency) * interval * 2.
        let lsto_ok = u32::from(self.timeout) * 10_000
            > (1 + u32::from(self.latency)) * u32::from(self.interval) * 1_250 * 2;
        if interval_ok
            && timeout_ok
            && hop_ok
            && window_ok
            && self.latency <= 499
            && lsto_ok
            && self.channel_map.is_valid()
        {
            Ok(())
        } else {
            Err(Error::InvalidValue)
        }
    }
}

impl<'a> FromBytes<'a> for ConnectRequestData {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        let access_address = bytes.read_u32_le()?;
        let crc_init = bytes.read_u24_le()?;
        let win_size = bytes.read_u8()?;
        let win_offset = bytes.read_u16_le()?;
        let interval = bytes.read_u16_le()?;
        let latency = bytes.read_u16_le()?;
        let timeout = bytes.read_u16_le()?;
        let channel_map = ChannelMap::from_bytes(bytes)?;
        let hop_sca = bytes.read_u8()?;
        Ok(Self {
            access_address,
            crc_init,
            win_size,
            win_offset,
            interval,
            latency,
            timeout,
            channel_map,
            hop: hop_sca & 0b1_1111,
            sca: SleepClockAccuracy::from_field(hop_sca >> 5),
        })
    }
}

impl ToBytes for ConnectRequestData {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u32_le(self.access_address)?;
        writer.write_u24_le(self.crc_init)?;
        writer.write_u8(self.win_size)?;
        writer.write_u16_le(self.win_offset)?;
        writer.write_u16_le(self.interval)?;
        writer.write_u16_le(self.latency)?;
        writer.write_u16_le(self.timeout)?;
        self.channel_map.to_bytes(writer)?;
        writer.write_u8((self.hop & 0b1_1111) | (self.sca.field() << 5))
    }
}

/// A decoded legacy advertising channel PDU.
#[derive(Copy, Clone, PartialEq, Eq)]
pub enum AdvPdu<'a> {
    AdvInd {
        adv_a: DeviceAddress,
        data: &'a [u8],
    },
    AdvDirectInd {
        adv_a: DeviceAddress,
        target_a: DeviceAddress,
    },
    AdvNonconnInd {
        adv_a: DeviceAddress,
        data: &'a [u8],
    },
    AdvScanInd {
        adv_a: DeviceAddress,
        data: &'a [u8],
    },
    ScanReq {
        scan_a: DeviceAddress,
        adv_a: DeviceAddress,
    },
    ScanRsp {
        adv_a: DeviceAddress,
        data: &'a [u8],
    },
    ConnectInd {
        init_a: DeviceAddress,
        adv_a: DeviceAddress,
        lldata: ConnectRequestData,
    },
}

impl<'a> AdvPdu<'a> {
    pub fn pdu_type(&self) -> PduType {
        match self {
            AdvPdu::AdvInd { .. } => PduType::AdvInd,
            AdvPdu::AdvDirectInd { .. } => PduType::AdvDirectInd,
            AdvPdu::AdvNonconnInd { .. } => PduType::AdvNonconnInd,
            AdvPdu::AdvScanInd { .. } => PduType::AdvScanInd,
            AdvPdu::ScanReq { .. } => PduType::ScanReq,
            AdvPdu::ScanRsp { .. } => PduType::ScanRsp,
            AdvPdu::ConnectInd { .. } => PduType::ConnectInd,
        }
    }

    /// Returns the advertiser address carried by the PDU.
    pub fn advertiser(&self) -> DeviceAddress {
        match *self {
            AdvPdu::AdvInd { adv_a, .. }
            | AdvPdu::AdvDirectInd { adv_a, .. }
            | AdvPdu::AdvNonconnInd { adv_a, .. }
            | AdvPdu::AdvScanInd { adv_a, .. }
            | AdvPdu::ScanReq { adv_a, .. }
            | AdvPdu::ScanRsp { adv_a, .. }
            | AdvPdu::ConnectInd { adv_a, .. } => adv_a,
        }
    }

    /// Returns whether an initiator may answer this PDU with a `CONNECT_IND`.
    pub fn is_connectable(&self) -> bool {
        matches!(self, AdvPdu::AdvInd { .. } | AdvPdu::AdvDirectInd { .. })
    }

    /// Decodes a PDU from its on-air representation, returning the header along with it.
    pub fn decode(raw: &'a [u8]) -> Result<(Header, Self), Error> {
        let mut bytes = ByteReader::new(raw);
        let header = Header::from_u16(bytes.read_u16_le()?);
        let mut payload = ByteReader::new(bytes.read_slice(usize::from(header.payload_length()))?);
        let (tx, rx) = (header.tx_add(), header.rx_add());

        let pdu = match header.type_() {
            PduType::AdvInd => AdvPdu::AdvInd {
                adv_a: DeviceAddress::read(&mut payload, tx)?,
                data: read_adv_data(&mut payload)?,
            },
            PduType::AdvNonconnInd => AdvPdu::AdvNonconnInd {
                adv_a: DeviceAddress::read(&mut payload, tx)?,
                data: read_adv_data(&mut payload)?,
            },
            PduType::AdvScanInd => AdvPdu::AdvScanInd {
                adv_a: DeviceAddress::read(&mut payload, tx)?,
                data: read_adv_data(&mut payload)?,
            },
            PduType::ScanRsp => AdvPdu::ScanRsp {
                adv_a: DeviceAddress::read(&mut payload, tx)?,
                data: read_adv_data(&mut payload)?,
            },
            PduType::AdvDirectInd => AdvPdu::AdvDirectInd {
                adv_a: DeviceAddress::read(&mut payload, tx)?,
                target_a: DeviceAddress::read(&mut payload, rx)?,
            },
            PduType::ScanReq => AdvPdu::ScanReq {
                scan_a: DeviceAddress::read(&mut payload, tx)?,
                adv_a: DeviceAddress::read(&mut payload, rx)?,
            },
            PduType::ConnectInd => AdvPdu::ConnectInd {
                init_a: DeviceAddress::read(&mut payload, tx)?,
                adv_a: DeviceAddress::read(&mut payload, rx)?,
                lldata: ConnectRequestData::from_bytes(&mut payload)?,
            },
            PduType::Unknown(_) => return Err(Error::InvalidValue),
        };
        payload.finish()?;
        Ok((header, pdu))
    }

    /// Encodes the PDU into `buf`, returning the number of bytes written.
    ///
    /// `ch_sel` sets the `ChSel` bit on the PDU types that carry it.
    pub fn encode(&self, ch_sel: bool, buf: &mut [u8]) -> Result<usize, Error> {
        let mut header = Header::new(self.pdu_type());
        let (first, second) = match self {
            AdvPdu::AdvDirectInd { adv_a, target_a } => (adv_a, Some(target_a)),
            AdvPdu::ScanReq { scan_a, adv_a } => (scan_a, Some(adv_a)),
            AdvPdu::ConnectInd { init_a, adv_a, .. } => (init_a, Some(adv_a)),
            AdvPdu::AdvInd { adv_a, .. }
            | AdvPdu::AdvNonconnInd { adv_a, .. }
            | AdvPdu::AdvScanInd { adv_a, .. }
            | AdvPdu::ScanRsp { adv_a, .. } => (adv_a, None),
        };
        header.set_tx_add(first.is_random());
        header.set_rx_add(second.map_or(false, |addr| addr.is_random()));
        if matches!(
            self,
            AdvPdu::AdvInd { .. } | AdvPdu::AdvDirectInd { .. } | AdvPdu::ConnectInd { .. }
        ) {
            header.set_ch_sel(ch_sel);
        }

        let (head, payload_buf) = buf.split_at_mut(2.min(buf.len()));
        let mut writer = ByteWriter::new(payload_buf);
        first.to_bytes(&mut writer)?;
        if let Some(second) = second {
            second.to_bytes(&mut writer)?;
        }
        match self {
            AdvPdu::AdvInd { data, .. }
            | AdvPdu::AdvNonconnInd { data, .. }
            | AdvPdu::AdvScanInd { data, .. }
            | AdvPdu::ScanRsp { data, .. } => {
                if data.len() > MAX_ADV_DATA {
                    return Err(Error::InvalidLength);
                }
                writer.write_slice(data)?;
            }
            AdvPdu::ConnectInd { lldata, .. } => lldata.to_bytes(&mut writer)?,
            AdvPdu::AdvDirectInd { .. } | AdvPdu::ScanReq { .. } => {}
        }
        let len = writer.position();
        header.set_payload_length(len as u8)?;
        ByteWriter::new(head).write_u16_le(header.to_u16())?;
        Ok(2 + len)
    }
}

fn read_adv_data<'a>(bytes: &mut ByteReader<'a>) -> Result<&'a [u8], Error> {
    let data = bytes.read_rest();
    if data.len() > MAX_ADV_DATA {
        Err(Error::InvalidLength)
    } else {
        Ok(data)
    }
}

impl fmt::Debug for AdvPdu<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdvPdu::AdvInd { adv_a, data }
            | AdvPdu::AdvNonconnInd { adv_a, data }
            | AdvPdu::AdvScanInd { adv_a, data }
            | AdvPdu::ScanRsp { adv_a, data } => write!(
                f,
                "{:?} {{ adv_a: {:?}, data: {:?} }}",
                self.pdu_type(),
                adv_a,
                HexSlice(data)
            ),
            AdvPdu::AdvDirectInd { adv_a, target_a } => {
                write!(f, "AdvDirectInd {{ {:?} -> {:?} }}", adv_a, target_a)
            }
            AdvPdu::ScanReq { scan_a, adv_a } => {
                write!(f, "ScanReq {{ {:?} -> {:?} }}", scan_a, adv_a)
            }
            AdvPdu::ConnectInd {
                init_a,
                adv_a,
                lldata,
            } => write!(
                f,
                "ConnectInd {{ {:?} -> {:?}, {:?} }}",
                init_a, adv_a, lldata
            ),
        }
    }
}

/// Checks the rules a freshly generated connection access address must satisfy.
///
/// See Core Vol 6, Part B, 2.1.2.
pub fn is_valid_access_address(aa: u32) -> bool {
    if aa == ADVERTISING_ADDRESS || (aa ^ ADVERTISING_ADDRESS).count_ones() <= 1 {
        return false;
    }
    let bytes = aa.to_le_bytes();
    if bytes.iter().all(|&b| b == bytes[0]) {
        return false;
    }

    // No more than six consecutive equal bits.
    let mut run = 1;
    for bit in 1..32 {
        if (aa >> bit) & 1 == (aa >> (bit - 1)) & 1 {
            run += 1;
            if run > 6 {
                return false;
            }
        } else {
            run = 1;
        }
    }

    // At least two transitions in the six most significant bits.
    let top = aa >> 26;
    let transitions = (top ^ (top >> 1)) & 0b1_1111;
    if transitions.count_ones() < 2 {
        return false;
    }

    // No more than 24 transitions overall.
    (aa ^ (aa >> 1)).count_ones() - ((aa ^ (aa >> 1)) >> 31) <= 24
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::device_address::AddressKind;

    fn lldata() -> ConnectRequestData {
        ConnectRequestData {
            access_address: 0x5065_A8E2,
            crc_init: 0x12_3456,
            win_size: 2,
            win_offset: 0,
            interval: 24,
            latency: 0,
            timeout: 72,
            channel_map: ChannelMap::with_all_channels(),
            hop: 9,
            sca: SleepClockAccuracy::from_ppm(50),
        }
    }

    #[test]
    fn connect_ind_layout() {
        let init_a = DeviceAddress::new([1, 2, 3, 4, 5, 6], AddressKind::Random);
        let adv_a = DeviceAddress::new([7, 8, 9, 10, 11, 12], AddressKind::Public);
        let pdu = AdvPdu::ConnectInd {
            init_a,
            adv_a,
            lldata: lldata(),
        };
        let mut buf = [0; 64];
        let len = pdu.encode(true, &mut buf).unwrap();
        assert_eq!(len, 2 + 34);
        // Type 5, ChSel, TxAdd (random initiator), length 34.
        assert_eq!(buf[0], 0x05 | 0x20 | 0x40);
        assert_eq!(buf[1], 34);
        // Hop in the low 5 bits, SCA 5 (50 ppm) above.
        assert_eq!(buf[2 + 12 + 21], 9 | (5 << 5));

        let (header, decoded) = AdvPdu::decode(&buf[..len]).unwrap();
        assert!(header.ch_sel());
        assert_eq!(decoded, pdu);
        assert!(lldata().validate().is_ok());
    }

    #[test]
    fn length_field_is_six_bits() {
        let mut header = Header::new(PduType::AdvInd);
        assert_eq!(header.set_payload_length(64), Err(Error::InvalidLength));
        header.set_payload_length(37).unwrap();
        // Reserved bits above the length are ignored on receive.
        let raw = Header::from_u16(header.to_u16() | 0xC000);
        assert_eq!(raw.payload_length(), 37);
    }

    #[test]
    fn invalid_connection_parameters() {
        let mut data = lldata();
        data.hop = 4;
        assert!(data.validate().is_err());

        let mut data = lldata();
        // 100 ms timeout at 30 ms interval with latency 1 violates the 2x rule.
        data.timeout = 10;
        data.latency = 1;
        assert!(data.validate().is_err());
    }

    #[test]
    fn access_address_rules() {
        assert!(!is_valid_access_address(ADVERTISING_ADDRESS));
        assert!(!is_valid_access_address(ADVERTISING_ADDRESS ^ 0x0100));
        assert!(!is_valid_access_address(0x5555_5555));
        assert!(!is_valid_access_address(0x0000_00FF));
        assert!(is_valid_access_address(0x5065_A8E2));
    }

    #[test]
    fn sca_buckets() {
        assert_eq!(SleepClockAccuracy::from_ppm(20).field(), 7);
        assert_eq!(SleepClockAccuracy::from_ppm(21).field(), 6);
        assert_eq!(SleepClockAccuracy::from_ppm(500).ppm(), 500);
        assert_eq!(SleepClockAccuracy::from_ppm(1000).field(), 0);
    }
}
