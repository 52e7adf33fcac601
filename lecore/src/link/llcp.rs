//! Packet structures of the Link Layer Control Protocol.
//!
//! Every LL control PDU consists of a 1-octet opcode followed by `CtrData` whose size is fixed per
//! opcode. A PDU whose `CtrData` length doesn't match its opcode is malformed and fails to decode;
//! the peer is then answered with `LL_UNKNOWN_RSP`, as it is for opcodes we don't know.

use {
    super::{channel_map::ChannelMap, data::CteType, features::FeatureSet},
    crate::{bytes::*, error::ErrorCode, phy::PhySet, time::Duration, Error},
};

/// `CtrData` of `LL_CONNECTION_UPDATE_IND`: a new set of connection parameters and the instant at
/// which they take effect.
///
/// All timing fields are in their on-air units (1.25 ms, supervision timeout 10 ms).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ConnectionUpdateData {
    pub win_size: u8,
    pub win_offset: u16,
    pub interval: u16,
    pub latency: u16,
    pub timeout: u16,
    pub instant: u16,
}

impl ConnectionUpdateData {
    /// Offset of the transmit window from the old anchor point of the instant.
    pub fn win_offset(&self) -> Duration {
        Duration::from_conn_units(self.win_offset)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_conn_units(self.interval)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_supervision_units(self.timeout)
    }
}

/// `CtrData` of `LL_CONNECTION_PARAM_REQ` and `LL_CONNECTION_PARAM_RSP`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ConnParamRequest {
    pub interval_min: u16,
    pub interval_max: u16,
    pub latency: u16,
    pub timeout: u16,
    pub preferred_periodicity: u8,
    pub reference_event: u16,
    /// Preferred anchor offsets; `0xFFFF` marks an unused entry.
    pub offsets: [u16; 6],
}

/// `CtrData` of `LL_LENGTH_REQ` and `LL_LENGTH_RSP`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LengthParams {
    pub max_rx_octets: u16,
    pub max_rx_time: u16,
    pub max_tx_octets: u16,
    pub max_tx_time: u16,
}

/// A structured representation of an LL Control PDU.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ControlPdu {
    /// `0x00`/`LL_CONNECTION_UPDATE_IND`: sent by the master, no response.
    ConnectionUpdateInd(ConnectionUpdateData),

    /// `0x01`/`LL_CHANNEL_MAP_IND`: sent by the master, no response.
    ChannelMapInd { map: ChannelMap, instant: u16 },

    /// `0x02`/`LL_TERMINATE_IND`: closes the connection, sent by either side.
    TerminateInd { error_code: ErrorCode },

    /// `0x03`/`LL_ENC_REQ`: master starts encryption.
    EncReq {
        rand: [u8; 8],
        ediv: u16,
        skd_m: [u8; 8],
        iv_m: [u8; 4],
    },

    /// `0x04`/`LL_ENC_RSP`: slave contributes its session key diversifier and IV half.
    EncRsp { skd_s: [u8; 8], iv_s: [u8; 4] },

    /// `0x05`/`LL_START_ENC_REQ`: slave is ready, sent unencrypted.
    StartEncReq,

    /// `0x06`/`LL_START_ENC_RSP`: sent encrypted, by master then slave.
    StartEncRsp,

    /// `0x07`/`LL_UNKNOWN_RSP`: the PDU with opcode `unknown_type` is unsupported or malformed.
    UnknownRsp { unknown_type: ControlOpcode },

    /// `0x08`/`LL_FEATURE_REQ`: master requests the slave's features.
    FeatureReq { features_master: FeatureSet },

    /// `0x09`/`LL_FEATURE_RSP`: answers either feature request.
    FeatureRsp { features: FeatureSet },

    /// `0x0A`/`LL_PAUSE_ENC_REQ`: master pauses encryption to change the key.
    PauseEncReq,

    /// `0x0B`/`LL_PAUSE_ENC_RSP`
    PauseEncRsp,

    /// `0x0C`/`LL_VERSION_IND`: sent by each side at most once per connection.
    VersionInd {
        vers_nr: VersionNumber,
        company_id: u16,
        sub_vers_nr: u16,
    },

    /// `0x0D`/`LL_REJECT_IND`
    RejectInd { error_code: ErrorCode },

    /// `0x0E`/`LL_SLAVE_FEATURE_REQ`: slave requests the master's features.
    SlaveFeatureReq { features_slave: FeatureSet },

    /// `0x0F`/`LL_CONNECTION_PARAM_REQ`
    ConnectionParamReq(ConnParamRequest),

    /// `0x10`/`LL_CONNECTION_PARAM_RSP`: sent by the slave only.
    ConnectionParamRsp(ConnParamRequest),

    /// `0x11`/`LL_REJECT_EXT_IND`: rejects the procedure started by `reject_opcode`.
    RejectExtInd {
        reject_opcode: ControlOpcode,
        error_code: ErrorCode,
    },

    /// `0x12`/`LL_PING_REQ`
    PingReq,

    /// `0x13`/`LL_PING_RSP`
    PingRsp,

    /// `0x14`/`LL_LENGTH_REQ`
    LengthReq(LengthParams),

    /// `0x15`/`LL_LENGTH_RSP`
    LengthRsp(LengthParams),

    /// `0x16`/`LL_PHY_REQ`: PHY preferences of the sender.
    PhyReq { tx_phys: PhySet, rx_phys: PhySet },

    /// `0x17`/`LL_PHY_RSP`: sent by the slave only.
    PhyRsp { tx_phys: PhySet, rx_phys: PhySet },

    /// `0x18`/`LL_PHY_UPDATE_IND`: sent by the master only. Both PHY sets empty means no change.
    PhyUpdateInd {
        m_to_s_phy: PhySet,
        s_to_m_phy: PhySet,
        instant: u16,
    },

    /// `0x19`/`LL_MIN_USED_CHANNELS_IND`: sent by the slave only.
    MinUsedChannelsInd { phys: PhySet, min_used_channels: u8 },

    /// `0x1A`/`LL_CTE_REQ`
    CteReq {
        /// Minimum CTE length in 8 µs units, 2..=20.
        min_cte_len: u8,
        cte_type: CteType,
    },

    /// `0x1B`/`LL_CTE_RSP`: carries the CTE itself, its `CTEInfo` is in the data header.
    CteRsp,

    /// Catch-all variant for opcodes we don't know.
    Unknown {
        opcode: ControlOpcode,
        /// Length of the (discarded) `CtrData`.
        len: u8,
    },
}

impl ControlPdu {
    /// Returns the opcode of this LL Control PDU.
    pub fn opcode(&self) -> ControlOpcode {
        match self {
            ControlPdu::ConnectionUpdateInd(_) => ControlOpcode::ConnectionUpdateInd,
            ControlPdu::ChannelMapInd { .. } => ControlOpcode::ChannelMapInd,
            ControlPdu::TerminateInd { .. } => ControlOpcode::TerminateInd,
            ControlPdu::EncReq { .. } => ControlOpcode::EncReq,
            ControlPdu::EncRsp { .. } => ControlOpcode::EncRsp,
            ControlPdu::StartEncReq => ControlOpcode::StartEncReq,
            ControlPdu::StartEncRsp => ControlOpcode::StartEncRsp,
            ControlPdu::UnknownRsp { .. } => ControlOpcode::UnknownRsp,
            ControlPdu::FeatureReq { .. } => ControlOpcode::FeatureReq,
            ControlPdu::FeatureRsp { .. } => ControlOpcode::FeatureRsp,
            ControlPdu::PauseEncReq => ControlOpcode::PauseEncReq,
            ControlPdu::PauseEncRsp => ControlOpcode::PauseEncRsp,
            ControlPdu::VersionInd { .. } => ControlOpcode::VersionInd,
            ControlPdu::RejectInd { .. } => ControlOpcode::RejectInd,
            ControlPdu::SlaveFeatureReq { .. } => ControlOpcode::SlaveFeatureReq,
            ControlPdu::ConnectionParamReq(_) => ControlOpcode::ConnectionParamReq,
            ControlPdu::ConnectionParamRsp(_) => ControlOpcode::ConnectionParamRsp,
            ControlPdu::RejectExtInd { .. } => ControlOpcode::RejectExtInd,
            ControlPdu::PingReq => ControlOpcode::PingReq,
            ControlPdu::PingRsp => ControlOpcode::PingRsp,
            ControlPdu::LengthReq(_) => ControlOpcode::LengthReq,
            ControlPdu::LengthRsp(_) => ControlOpcode::LengthRsp,
            ControlPdu::PhyReq { .. } => ControlOpcode::PhyReq,
            ControlPdu::PhyRsp { .. } => ControlOpcode::PhyRsp,
            ControlPdu::PhyUpdateInd { .. } => ControlOpcode::PhyUpdateInd,
            ControlPdu::MinUsedChannelsInd { .. } => ControlOpcode::MinUsedChannelsInd,
            ControlPdu::CteReq { .. } => ControlOpcode::CteReq,
            ControlPdu::CteRsp => ControlOpcode::CteRsp,
            ControlPdu::Unknown { opcode, .. } => *opcode,
        }
    }

    /// Returns the number of bytes `self` occupies on air, opcode included.
    pub fn encoded_size(&self) -> usize {
        match self {
            ControlPdu::Unknown { len, .. } => 1 + usize::from(*len),
            other => 1 + other.opcode().ctr_data_len().unwrap_or(0),
        }
    }
}

fn read_conn_params(bytes: &mut ByteReader<'_>) -> Result<ConnParamRequest, Error> {
    let mut params = ConnParamRequest {
        interval_min: bytes.read_u16_le()?,
        interval_max: bytes.read_u16_le()?,
        latency: bytes.read_u16_le()?,
        timeout: bytes.read_u16_le()?,
        preferred_periodicity: bytes.read_u8()?,
        reference_event: bytes.read_u16_le()?,
        offsets: [0; 6],
    };
    for offset in &mut params.offsets {
        *offset = bytes.read_u16_le()?;
    }
    Ok(params)
}

fn write_conn_params(params: &ConnParamRequest, buffer: &mut ByteWriter<'_>) -> Result<(), Error> {
    buffer.write_u16_le(params.interval_min)?;
    buffer.write_u16_le(params.interval_max)?;
    buffer.write_u16_le(params.latency)?;
    buffer.write_u16_le(params.timeout)?;
    buffer.write_u8(params.preferred_periodicity)?;
    buffer.write_u16_le(params.reference_event)?;
    for offset in &params.offsets {
        buffer.write_u16_le(*offset)?;
    }
    Ok(())
}

fn read_length(bytes: &mut ByteReader<'_>) -> Result<LengthParams, Error> {
    Ok(LengthParams {
        max_rx_octets: bytes.read_u16_le()?,
        max_rx_time: bytes.read_u16_le()?,
        max_tx_octets: bytes.read_u16_le()?,
        max_tx_time: bytes.read_u16_le()?,
    })
}

fn write_length(params: &LengthParams, buffer: &mut ByteWriter<'_>) -> Result<(), Error> {
    buffer.write_u16_le(params.max_rx_octets)?;
    buffer.write_u16_le(params.max_rx_time)?;
    buffer.write_u16_le(params.max_tx_octets)?;
    buffer.write_u16_le(params.max_tx_time)
}

fn read_phys(bytes: &mut ByteReader<'_>) -> Result<PhySet, Error> {
    Ok(PhySet::from_bits_truncate(bytes.read_u8()?))
}

impl<'a> FromBytes<'a> for ControlPdu {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        let opcode = ControlOpcode::from(bytes.read_u8()?);
        match opcode.ctr_data_len() {
            Some(len) if len != bytes.bytes_left() => return Err(Error::InvalidLength),
            _ => {}
        }

        let pdu = match opcode {
            ControlOpcode::ConnectionUpdateInd => {
                ControlPdu::ConnectionUpdateInd(ConnectionUpdateData {
                    win_size: bytes.read_u8()?,
                    win_offset: bytes.read_u16_le()?,
                    interval: bytes.read_u16_le()?,
                    latency: bytes.read_u16_le()?,
                    timeout: bytes.read_u16_le()?,
                    instant: bytes.read_u16_le()?,
                })
            }
            ControlOpcode::ChannelMapInd => ControlPdu::ChannelMapInd {
                map: ChannelMap::from_bytes(bytes)?,
                instant: bytes.read_u16_le()?,
            },
            ControlOpcode::TerminateInd => ControlPdu::TerminateInd {
                error_code: ErrorCode::from(bytes.read_u8()?),
            },
            ControlOpcode::EncReq => ControlPdu::EncReq {
                rand: bytes.read_array()?,
                ediv: bytes.read_u16_le()?,
                skd_m: bytes.read_array()?,
                iv_m: bytes.read_array()?,
            },
            ControlOpcode::EncRsp => ControlPdu::EncRsp {
                skd_s: bytes.read_array()?,
                iv_s: bytes.read_array()?,
            },
            ControlOpcode::StartEncReq => ControlPdu::StartEncReq,
            ControlOpcode::StartEncRsp => ControlPdu::StartEncRsp,
            ControlOpcode::UnknownRsp => ControlPdu::UnknownRsp {
                unknown_type: ControlOpcode::from(bytes.read_u8()?),
            },
            ControlOpcode::FeatureReq => ControlPdu::FeatureReq {
                features_master: FeatureSet::from_bytes(bytes)?,
            },
            ControlOpcode::FeatureRsp => ControlPdu::FeatureRsp {
                features: FeatureSet::from_bytes(bytes)?,
            },
            ControlOpcode::PauseEncReq => ControlPdu::PauseEncReq,
            ControlOpcode::PauseEncRsp => ControlPdu::PauseEncRsp,
            ControlOpcode::VersionInd => ControlPdu::VersionInd {
                vers_nr: VersionNumber::from(bytes.read_u8()?),
                company_id: bytes.read_u16_le()?,
                sub_vers_nr: bytes.read_u16_le()?,
            },
            ControlOpcode::RejectInd => ControlPdu::RejectInd {
                error_code: ErrorCode::from(bytes.read_u8()?),
            },
            ControlOpcode::SlaveFeatureReq => ControlPdu::SlaveFeatureReq {
                features_slave: FeatureSet::from_bytes(bytes)?,
            },
            ControlOpcode::ConnectionParamReq => {
                ControlPdu::ConnectionParamReq(read_conn_params(bytes)?)
            }
            ControlOpcode::ConnectionParamRsp => {
                ControlPdu::ConnectionParamRsp(read_conn_params(bytes)?)
            }
            ControlOpcode::RejectExtInd => ControlPdu::RejectExtInd {
                reject_opcode: ControlOpcode::from(bytes.read_u8()?),
                error_code: ErrorCode::from(bytes.read_u8()?),
            },
            ControlOpcode::PingReq => ControlPdu::PingReq,
            ControlOpcode::PingRsp => ControlPdu::PingRsp,
            ControlOpcode::LengthReq => ControlPdu::LengthReq(read_length(bytes)?),
            ControlOpcode::LengthRsp => ControlPdu::LengthRsp(read_length(bytes)?),
            ControlOpcode::PhyReq => ControlPdu::PhyReq {
                tx_phys: read_phys(bytes)?,
                rx_phys: read_phys(bytes)?,
            },
            ControlOpcode::PhyRsp => ControlPdu::PhyRsp {
                tx_phys: read_phys(bytes)?,
                rx_phys: read_phys(bytes)?,
            },
            ControlOpcode::PhyUpdateInd => ControlPdu::PhyUpdateInd {
                m_to_s_phy: read_phys(bytes)?,
                s_to_m_phy: read_phys(bytes)?,
                instant: bytes.read_u16_le()?,
            },
            ControlOpcode::MinUsedChannelsInd => ControlPdu::MinUsedChannelsInd {
                phys: read_phys(bytes)?,
                min_used_channels: bytes.read_u8()?,
            },
            ControlOpcode::CteReq => {
                let raw = bytes.read_u8()?;
                ControlPdu::CteReq {
                    min_cte_len: raw & 0x1F,
                    cte_type: CteType::from_bits(raw >> 6).ok_or(Error::InvalidValue)?,
                }
            }
            ControlOpcode::CteRsp => ControlPdu::CteRsp,
            ControlOpcode::Unknown(_) => {
                let rest = bytes.read_rest();
                ControlPdu::Unknown {
                    opcode,
                    len: rest.len() as u8,
                }
            }
        };
        Ok(pdu)
    }
}

impl ToBytes for ControlPdu {
    fn to_bytes(&self, buffer: &mut ByteWriter<'_>) -> Result<(), Error> {
        buffer.write_u8(self.opcode().into())?;
        match self {
            ControlPdu::ConnectionUpdateInd(data) => {
                buffer.write_u8(data.win_size)?;
                buffer.write_u16_le(data.win_offset)?;
                buffer.write_u16_le(data.interval)?;
                buffer.write_u16_le(data.latency)?;
                buffer.write_u16_le(data.timeout)?;
                buffer.write_u16_le(data.instant)
            }
            ControlPdu::ChannelMapInd { map, instant } => {
                map.to_bytes(buffer)?;
                buffer.write_u16_le(*instant)
            }
            ControlPdu::TerminateInd { error_code } | ControlPdu::RejectInd { error_code } => {
                buffer.write_u8(u8::from(*error_code))
            }
            ControlPdu::EncReq {
                rand,
                ediv,
                skd_m,
                iv_m,
            } => {
                buffer.write_slice(rand)?;
                buffer.write_u16_le(*ediv)?;
                buffer.write_slice(skd_m)?;
                buffer.write_slice(iv_m)
            }
            ControlPdu::EncRsp { skd_s, iv_s } => {
                buffer.write_slice(skd_s)?;
                buffer.write_slice(iv_s)
            }
            ControlPdu::UnknownRsp { unknown_type } => buffer.write_u8(u8::from(*unknown_type)),
            ControlPdu::FeatureReq {
                features_master: features,
            }
            | ControlPdu::FeatureRsp { features }
            | ControlPdu::SlaveFeatureReq {
                features_slave: features,
            } => features.to_bytes(buffer),
            ControlPdu::VersionInd {
                vers_nr,
                company_id,
                sub_vers_nr,
            } => {
                buffer.write_u8(u8::from(*vers_nr))?;
                buffer.write_u16_le(*company_id)?;
                buffer.write_u16_le(*sub_vers_nr)
            }
            ControlPdu::ConnectionParamReq(params) | ControlPdu::ConnectionParamRsp(params) => {
                write_conn_params(params, buffer)
            }
            ControlPdu::RejectExtInd {
                reject_opcode,
                error_code,
            } => {
                buffer.write_u8(u8::from(*reject_opcode))?;
                buffer.write_u8(u8::from(*error_code))
            }
            ControlPdu::LengthReq(params) | ControlPdu::LengthRsp(params) => {
                write_length(params, buffer)
            }
            ControlPdu::PhyReq { tx_phys, rx_phys } | ControlPdu::PhyRsp { tx_phys, rx_phys } => {
                buffer.write_u8(tx_phys.bits())?;
                buffer.write_u8(rx_phys.bits())
            }
            ControlPdu::PhyUpdateInd {
                m_to_s_phy,
                s_to_m_phy,
                instant,
            } => {
                buffer.write_u8(m_to_s_phy.bits())?;
                buffer.write_u8(s_to_m_phy.bits())?;
                buffer.write_u16_le(*instant)
            }
            ControlPdu::MinUsedChannelsInd {
                phys,
                min_used_channels,
            } => {
                buffer.write_u8(phys.bits())?;
                buffer.write_u8(*min_used_channels)
            }
            ControlPdu::CteReq {
                min_cte_len,
                cte_type,
            } => buffer.write_u8((min_cte_len & 0x1F) | (cte_type.bits() << 6)),
            ControlPdu::StartEncReq
            | ControlPdu::StartEncRsp
            | ControlPdu::PauseEncReq
            | ControlPdu::PauseEncRsp
            | ControlPdu::PingReq
            | ControlPdu::PingRsp
            | ControlPdu::CteRsp => Ok(()),
            // Only the length of unknown PDUs is kept, so they can't be re-encoded.
            ControlPdu::Unknown { .. } => Err(Error::InvalidValue),
        }
    }
}

enum_with_unknown! {
    /// Enumeration of all LL Control PDU opcodes defined up to Bluetooth 5.1.
    #[derive(Debug)]
    pub enum ControlOpcode(u8) {
        ConnectionUpdateInd = 0x00,
        ChannelMapInd = 0x01,
        TerminateInd = 0x02,
        EncReq = 0x03,
        EncRsp = 0x04,
        StartEncReq = 0x05,
        StartEncRsp = 0x06,
        UnknownRsp = 0x07,
        FeatureReq = 0x08,
        FeatureRsp = 0x09,
        PauseEncReq = 0x0A,
        PauseEncRsp = 0x0B,
        VersionInd = 0x0C,
        RejectInd = 0x0D,
        SlaveFeatureReq = 0x0E,
        ConnectionParamReq = 0x0F,
        ConnectionParamRsp = 0x10,
        RejectExtInd = 0x11,
        PingReq = 0x12,
        PingRsp = 0x13,
        LengthReq = 0x14,
        LengthRsp = 0x15,
        PhyReq = 0x16,
        PhyRsp = 0x17,
        PhyUpdateInd = 0x18,
        MinUsedChannelsInd = 0x19,
        CteReq = 0x1A,
        CteRsp = 0x1B,
    }
}

impl ControlOpcode {
    /// Returns the size of the `CtrData` following this opcode, or `None` for unknown opcodes.
    pub fn ctr_data_len(&self) -> Option<usize> {
        use self::ControlOpcode::*;

        Some(match self {
            ConnectionUpdateInd => 11,
            ChannelMapInd => 7,
            TerminateInd | UnknownRsp | RejectInd | CteReq => 1,
            EncReq => 22,
            EncRsp => 12,
            StartEncReq | StartEncRsp | PauseEncReq | PauseEncRsp | PingReq | PingRsp | CteRsp => 0,
            FeatureReq | FeatureRsp | SlaveFeatureReq | LengthReq | LengthRsp => 8,
            VersionInd => 5,
            ConnectionParamReq | ConnectionParamRsp => 23,
            RejectExtInd | PhyReq | PhyRsp | MinUsedChannelsInd => 2,
            PhyUpdateInd => 4,
            Unknown(_) => return None,
        })
    }
}

enum_with_unknown! {
    /// `VersNr` values of `LL_VERSION_IND`, from the Bluetooth assigned numbers.
    #[derive(Debug)]
    pub enum VersionNumber(u8) {
        V4_0 = 6,
        V4_1 = 7,
        V4_2 = 8,
        V5_0 = 9,
        V5_1 = 10,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(pdu: &ControlPdu) -> Vec<u8> {
        let mut buf = [0; 32];
        let mut writer = ByteWriter::new(&mut buf);
        pdu.to_bytes(&mut writer).unwrap();
        let len = writer.position();
        assert_eq!(len, pdu.encoded_size());
        buf[..len].to_vec()
    }

    #[test]
    fn payload_sizes_match_opcode_table() {
        let conn_params = ConnParamRequest {
            interval_min: 6,
            interval_max: 24,
            latency: 0,
            timeout: 100,
            preferred_periodicity: 0,
            reference_event: 0,
            offsets: [0xFFFF; 6],
        };
        let length = LengthParams {
            max_rx_octets: 251,
            max_rx_time: 2120,
            max_tx_octets: 251,
            max_tx_time: 2120,
        };
        let cases = [
            (
                ControlPdu::ConnectionUpdateInd(ConnectionUpdateData {
                    win_size: 1,
                    win_offset: 0,
                    interval: 24,
                    latency: 0,
                    timeout: 100,
                    instant: 6,
                }),
                12,
            ),
            (
                ControlPdu::ChannelMapInd {
                    map: ChannelMap::with_all_channels(),
                    instant: 0,
                },
                8,
            ),
            (
                ControlPdu::TerminateInd {
                    error_code: ErrorCode::RemoteUserTerminated,
                },
                2,
            ),
            (
                ControlPdu::EncReq {
                    rand: [0; 8],
                    ediv: 0,
                    skd_m: [0; 8],
                    iv_m: [0; 4],
                },
                23,
            ),
            (
                ControlPdu::EncRsp {
                    skd_s: [0; 8],
                    iv_s: [0; 4],
                },
                13,
            ),
            (ControlPdu::StartEncReq, 1),
            (
                ControlPdu::FeatureRsp {
                    features: FeatureSet::supported(),
                },
                9,
            ),
            (
                ControlPdu::VersionInd {
                    vers_nr: VersionNumber::V5_1,
                    company_id: 0xFFFF,
                    sub_vers_nr: 0,
                },
                6,
            ),
            (ControlPdu::ConnectionParamReq(conn_params), 24),
            (
                ControlPdu::RejectExtInd {
                    reject_opcode: ControlOpcode::PhyReq,
                    error_code: ErrorCode::DifferentTransactionCollision,
                },
                3,
            ),
            (ControlPdu::LengthRsp(length), 9),
            (
                ControlPdu::PhyUpdateInd {
                    m_to_s_phy: PhySet::LE_2M,
                    s_to_m_phy: PhySet::LE_2M,
                    instant: 9,
                },
                5,
            ),
            (
                ControlPdu::CteReq {
                    min_cte_len: 20,
                    cte_type: CteType::AoA,
                },
                2,
            ),
            (ControlPdu::CteRsp, 1),
        ];

        for (pdu, size) in &cases {
            let bytes = encode(pdu);
            assert_eq!(bytes.len(), *size, "{:?}", pdu);
            assert_eq!(bytes[0], u8::from(pdu.opcode()));
            let decoded = ControlPdu::from_bytes(&mut ByteReader::new(&bytes)).unwrap();
            assert_eq!(decoded, *pdu);
        }
    }

    #[test]
    fn wrong_length_is_malformed() {
        // LL_TERMINATE_IND without its error code.
        let raw = [0x02];
        assert_eq!(
            ControlPdu::from_bytes(&mut ByteReader::new(&raw)),
            Err(Error::InvalidLength)
        );
        // LL_PING_REQ with a trailing byte.
        let raw = [0x12, 0x00];
        assert_eq!(
            ControlPdu::from_bytes(&mut ByteReader::new(&raw)),
            Err(Error::InvalidLength)
        );
    }

    #[test]
    fn unknown_opcode_is_kept() {
        let raw = [0x30, 1, 2, 3];
        let pdu = ControlPdu::from_bytes(&mut ByteReader::new(&raw)).unwrap();
        assert_eq!(
            pdu,
            ControlPdu::Unknown {
                opcode: ControlOpcode::Unknown(0x30),
                len: 3,
            }
        );
        assert_eq!(pdu.encoded_size(), 4);
    }
}
