//! Data channel PDUs.

use {
    super::llcp::ControlPdu,
    crate::{bytes::*, Error},
    core::{fmt, ops::Not},
    heapless::Vec,
};

/// Maximum payload of a data channel PDU, not counting the MIC.
pub const MAX_PAYLOAD: usize = 251;

/// Payload size every implementation supports without a data length update.
pub const MIN_PAYLOAD: usize = 27;

/// Size of the message integrity check appended to encrypted, non-empty payloads.
pub const MIC_SIZE: usize = 4;

/// Storage for a PDU payload, including room for a MIC.
pub type PayloadBuf = Vec<u8, { MAX_PAYLOAD + MIC_SIZE }>;

/// A 1-bit sequence number, used for both `SN` and `NESN`.
#[derive(PartialEq, Eq, Copy, Clone, Default)]
pub struct SeqNum(bool);

impl SeqNum {
    pub const ZERO: Self = SeqNum(false);
    pub const ONE: Self = SeqNum(true);

    fn from_bit(bit: bool) -> Self {
        SeqNum(bit)
    }
}

/// Incrementing a sequence number flips it.
impl Not for SeqNum {
    type Output = Self;

    fn not(self) -> Self {
        SeqNum(!self.0)
    }
}

impl fmt::Debug for SeqNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.0 { "1" } else { "0" })
    }
}

const NESN: u16 = 1 << 2;
const SN: u16 = 1 << 3;
const MD: u16 = 1 << 4;
const CP: u16 = 1 << 5;

/// 16-bit data channel header preceding the payload.
///
/// Layout (Bluetooth 5.1):
///
/// ```notrust
/// LSB                                                                           MSB
/// +----------+---------+---------+---------+---------+------------+--------------+
/// |   LLID   |  NESN   |   SN    |   MD    |   CP    |     -      |    Length    |
/// | (2 bits) | (1 bit) | (1 bit) | (1 bit) | (1 bit) |  (2 bits)  |   (8 bits)   |
/// +----------+---------+---------+---------+---------+------------+--------------+
/// ```
///
/// `Length` counts the payload and the MIC, if present. When `CP` is set, a `CTEInfo` octet
/// follows the header and is not counted in `Length`.
///
/// ## Sequence Numbers
///
/// Each side keeps `transmitSeqNum` and `nextExpectedSeqNum`, both starting at 0. A new PDU is
/// sent with `SN = transmitSeqNum`; a retransmission reuses the original `SN`. Every PDU carries
/// `NESN = nextExpectedSeqNum`.
///
/// A received `NESN` different from our `transmitSeqNum` acknowledges our last PDU. A received
/// `SN` equal to `nextExpectedSeqNum` marks a new PDU; anything else is a retransmission and is
/// dropped after processing the acknowledgement.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Header(u16);

impl Header {
    /// Creates a header with the given LLID field and all other fields set to 0.
    pub fn new(llid: Llid) -> Self {
        Header(llid as u16)
    }

    pub fn from_u16(raw: u16) -> Self {
        Header(raw)
    }

    /// Returns the raw header, transmitted least significant bit first.
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

    pub fn llid(&self) -> Llid {
        match self.0 & 0b11 {
            0b01 => Llid::DataCont,
            0b10 => Llid::DataStart,
            0b11 => Llid::Control,
            _ => Llid::Reserved,
        }
    }

    pub fn nesn(&self) -> SeqNum {
        SeqNum::from_bit(self.0 & NESN != 0)
    }

    pub fn set_nesn(&mut self, nesn: SeqNum) {
        self.set_bit(NESN, nesn.0);
    }

    pub fn sn(&self) -> SeqNum {
        SeqNum::from_bit(self.0 & SN != 0)
    }

    pub fn set_sn(&mut self, sn: SeqNum) {
        self.set_bit(SN, sn.0);
    }

    /// More Data.
    pub fn md(&self) -> bool {
        self.0 & MD != 0
    }

    pub fn set_md(&mut self, md: bool) {
        self.set_bit(MD, md);
    }

    /// `CTEInfo` Present.
    pub fn cp(&self) -> bool {
        self.0 & CP != 0
    }

    pub fn set_cp(&mut self, cp: bool) {
        self.set_bit(CP, cp);
    }

    pub fn payload_length(&self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub fn set_payload_length(&mut self, len: u8) {
        self.0 = (u16::from(len) << 8) | (self.0 & 0x00ff);
    }

    /// Returns the additional authenticated data for CCM: the first header octet with `NESN`,
    /// `SN` and `MD` masked out.
    pub fn ccm_aad(&self) -> u8 {
        (self.0 as u8) & 0xE3
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field("LLID", &self.llid())
            .field("NESN", &self.nesn())
            .field("SN", &self.sn())
            .field("MD", &self.md())
            .field("CP", &self.cp())
            .field("Length", &self.payload_length())
            .finish()
    }
}

impl<'a> FromBytes<'a> for Header {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        Ok(Header(bytes.read_u16_le()?))
    }
}

impl ToBytes for Header {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u16_le(self.0)
    }
}

/// Values of the LLID field in `Header`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Llid {
    /// Reserved for future use.
    Reserved = 0b00,
    /// Continuation of an L2CAP message, or empty PDU.
    DataCont = 0b01,
    /// Start of an L2CAP message.
    DataStart = 0b10,
    /// LL control PDU.
    Control = 0b11,
}

/// Type of a Constant Tone Extension.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CteType {
    AoA,
    AoD1us,
    AoD2us,
}

impl CteType {
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(CteType::AoA),
            1 => Some(CteType::AoD1us),
            2 => Some(CteType::AoD2us),
            _ => None,
        }
    }

    pub fn bits(self) -> u8 {
        self as u8
    }
}

/// The `CTEInfo` octet following a header with `CP` set.
///
/// `CTETime` (5 bits) is the CTE length in 8 µs units, 2..=20. `CTEType` occupies the top 2 bits.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CteInfo {
    pub time: u8,
    pub kind: CteType,
}

impl CteInfo {
    pub fn to_u8(&self) -> u8 {
        (self.time & 0x1F) | (self.kind.bits() << 6)
    }

    pub fn from_u8(raw: u8) -> Result<Self, Error> {
        Ok(CteInfo {
            time: raw & 0x1F,
            kind: CteType::from_bits(raw >> 6).ok_or(Error::InvalidValue)?,
        })
    }
}

/// An owned data channel PDU, as queued for transmission or handed to the host.
#[derive(Clone, PartialEq, Eq)]
pub struct DataPdu {
    header: Header,
    cte_info: Option<CteInfo>,
    payload: PayloadBuf,
}

impl DataPdu {
    /// Creates an empty PDU that carries no message.
    ///
    /// This PDU is sent whenever there's nothing else to transmit. It is never encrypted.
    pub fn empty() -> Self {
        Self {
            header: Header::new(Llid::DataCont),
            cte_info: None,
            payload: Vec::new(),
        }
    }

    /// Creates a data PDU carrying an L2CAP fragment.
    pub fn data(llid: Llid, message: &[u8]) -> Result<Self, Error> {
        if llid != Llid::DataCont && llid != Llid::DataStart {
            return Err(Error::InvalidValue);
        }
        if message.len() > MAX_PAYLOAD || (llid == Llid::DataStart && message.is_empty()) {
            return Err(Error::InvalidLength);
        }
        let mut pdu = Self {
            header: Header::new(llid),
            cte_info: None,
            payload: Vec::new(),
        };
        pdu.set_payload(message)?;
        Ok(pdu)
    }

    /// Encodes an LL control PDU.
    pub fn control(pdu: &ControlPdu) -> Result<Self, Error> {
        let mut buf = [0; MAX_PAYLOAD];
        let mut writer = ByteWriter::new(&mut buf);
        pdu.to_bytes(&mut writer)?;
        let len = writer.position();

        let mut result = Self {
            header: Header::new(Llid::Control),
            cte_info: None,
            payload: Vec::new(),
        };
        result.set_payload(&buf[..len])?;
        Ok(result)
    }

    /// Decodes a PDU from its on-air representation (header, optional `CTEInfo`, payload).
    pub fn decode(raw: &[u8]) -> Result<Self, Error> {
        let mut bytes = ByteReader::new(raw);
        let header = Header::from_bytes(&mut bytes)?;
        let cte_info = if header.cp() {
            Some(CteInfo::from_u8(bytes.read_u8()?)?)
        } else {
            None
        };
        let payload = bytes.read_slice(usize::from(header.payload_length()))?;
        bytes.finish()?;
        Ok(Self {
            header,
            cte_info,
            payload: Vec::from_slice(payload).map_err(|_| Error::InvalidLength)?,
        })
    }

    /// Encodes the PDU into `buf`, returning the number of bytes written.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, Error> {
        let mut writer = ByteWriter::new(buf);
        self.header.to_bytes(&mut writer)?;
        if let Some(info) = self.cte_info {
            writer.write_u8(info.to_u8())?;
        }
        writer.write_slice(&self.payload)?;
        Ok(writer.position())
    }

    pub fn header(&self) -> Header {
        self.header
    }

    pub fn header_mut(&mut self) -> &mut Header {
        &mut self.header
    }

    pub fn llid(&self) -> Llid {
        self.header.llid()
    }

    pub fn cte_info(&self) -> Option<CteInfo> {
        self.cte_info
    }

    /// Attaches a `CTEInfo` octet and sets `CP` accordingly.
    pub fn set_cte_info(&mut self, info: Option<CteInfo>) {
        self.cte_info = info;
        self.header.set_cp(info.is_some());
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Gives mutable access to the payload buffer, for in-place encryption.
    ///
    /// The caller must call [`sync_length`](#method.sync_length) afterwards if it changes the
    /// payload length.
    pub fn payload_buf_mut(&mut self) -> &mut PayloadBuf {
        &mut self.payload
    }

    /// Writes the current payload length into the header.
    pub fn sync_length(&mut self) {
        self.header.set_payload_length(self.payload.len() as u8);
    }

    fn set_payload(&mut self, payload: &[u8]) -> Result<(), Error> {
        self.payload.clear();
        self.payload
            .extend_from_slice(payload)
            .map_err(|_| Error::InvalidLength)?;
        self.sync_length();
        Ok(())
    }

    /// Returns whether this is an empty PDU (`LLID` = continuation, no payload).
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Decodes the payload as an LL control PDU.
    pub fn to_control(&self) -> Result<ControlPdu, Error> {
        if self.llid() != Llid::Control {
            return Err(Error::InvalidValue);
        }
        ControlPdu::from_bytes(&mut ByteReader::new(&self.payload))
    }
}

impl fmt::Debug for DataPdu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataPdu")
            .field("header", &self.header)
            .field("cte_info", &self.cte_info)
            .field("payload", &crate::utils::HexSlice(&self.payload[..]))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_bits() {
        let mut header = Header::new(Llid::Control);
        header.set_nesn(SeqNum::ONE);
        header.set_md(true);
        header.set_cp(true);
        header.set_payload_length(27);
        assert_eq!(header.to_u16(), 0x1b37);
        assert_eq!(header.sn(), SeqNum::ZERO);
        assert_eq!(header.nesn(), SeqNum::ONE);
        // NESN, SN and MD don't take part in authentication.
        assert_eq!(header.ccm_aad(), 0x23);
        header.set_sn(SeqNum::ONE);
        assert_eq!(header.ccm_aad(), 0x23);
    }

    #[test]
    fn decode_with_cte_info() {
        let raw = [0x22, 0x02, 0x94, 0xaa, 0xbb];
        let pdu = DataPdu::decode(&raw).unwrap();
        assert_eq!(pdu.llid(), Llid::DataStart);
        assert_eq!(
            pdu.cte_info(),
            Some(CteInfo {
                time: 0x14,
                kind: CteType::AoD2us
            })
        );
        assert_eq!(pdu.payload(), &[0xaa, 0xbb]);

        let mut buf = [0; 8];
        let len = pdu.encode(&mut buf).unwrap();
        assert_eq!(&buf[..len], &raw[..]);
    }

    #[test]
    fn rejects_truncated_and_oversized() {
        assert_eq!(DataPdu::decode(&[0x02, 0x05, 0x00]), Err(Error::Eof));
        assert_eq!(DataPdu::decode(&[0x02, 0x01, 0x00, 0x00]), Err(Error::IncompleteParse));
        assert_eq!(
            DataPdu::data(Llid::DataStart, &[0; MAX_PAYLOAD + 1]),
            Err(Error::InvalidLength)
        );
        assert_eq!(DataPdu::data(Llid::DataStart, &[]), Err(Error::InvalidLength));
        assert_eq!(DataPdu::data(Llid::Control, &[1]), Err(Error::InvalidValue));
        assert!(DataPdu::empty().is_empty());
    }
}
