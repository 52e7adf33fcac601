use {
    crate::{bytes::*, Error},
    bitflags::bitflags,
};

bitflags! {
    /// A set of optional Link Layer features, as exchanged in `LL_FEATURE_REQ`,
    /// `LL_SLAVE_FEATURE_REQ` and `LL_FEATURE_RSP`.
    ///
    /// Only the bits defined up to Bluetooth 5.1 are known. Unknown bits received from a peer are
    /// dropped when decoding.
    pub struct FeatureSet: u64 {
        /// Encryption start and pause procedures.
        const LE_ENCRYPTION = 1 << 0;
        /// Connection parameters request procedure.
        const CONN_PARAM_REQ = 1 << 1;
        /// Support for `LL_REJECT_EXT_IND`.
        const EXTENDED_REJECT_INDICATION = 1 << 2;
        /// Slave-initiated feature exchange.
        const SLAVE_FEATURE_EXCHANGE = 1 << 3;
        /// LE Ping and the authenticated payload timeout.
        const LE_PING = 1 << 4;
        /// Data length update procedure (payloads above 27 octets).
        const LE_DATA_PACKET_LENGTH_EXTENSION = 1 << 5;
        const LL_PRIVACY = 1 << 6;
        const EXT_SCANNER_FILTER_POLICIES = 1 << 7;

        /// PHY update procedure towards LE 2M.
        const LE_2M_PHY = 1 << 8;
        const STABLE_MODULATION_INDEX_TX = 1 << 9;
        const STABLE_MODULATION_INDEX_RX = 1 << 10;
        /// PHY update procedure towards LE Coded.
        const LE_CODED_PHY = 1 << 11;
        const LE_EXTENDED_ADVERTISING = 1 << 12;
        const LE_PERIODIC_ADVERTISING = 1 << 13;
        /// Channel Selection Algorithm #2.
        const CHANNEL_SELECTION_ALGORITHM_2 = 1 << 14;
        const LE_POWER_CLASS_1 = 1 << 15;

        const MIN_USED_CHANNELS = 1 << 16;
        const CONNECTION_CTE_REQUEST = 1 << 17;
        const CONNECTION_CTE_RESPONSE = 1 << 18;
        const CONNECTIONLESS_CTE_TX = 1 << 19;
        const CONNECTIONLESS_CTE_RX = 1 << 20;
        const ANTENNA_SWITCHING_AOD = 1 << 21;
        const ANTENNA_SWITCHING_AOA = 1 << 22;
        const RECEIVING_CTE = 1 << 23;

        const PAST_SENDER = 1 << 24;
        const PAST_RECIPIENT = 1 << 25;
        const SLEEP_CLOCK_ACCURACY_UPDATES = 1 << 26;
        const REMOTE_PUBLIC_KEY_VALIDATION = 1 << 27;
    }
}

impl FeatureSet {
    /// Features whose peer bit is not trusted.
    ///
    /// These describe local capabilities with no meaning between controllers. Whatever the peer
    /// claims for them, the local setting stands.
    pub const IGNORED_FROM_PEER: FeatureSet = FeatureSet {
        bits: FeatureSet::LE_PING.bits
            | FeatureSet::LL_PRIVACY.bits
            | FeatureSet::EXT_SCANNER_FILTER_POLICIES.bits
            | FeatureSet::LE_EXTENDED_ADVERTISING.bits
            | FeatureSet::LE_PERIODIC_ADVERTISING.bits
            | FeatureSet::CONNECTIONLESS_CTE_TX.bits
            | FeatureSet::CONNECTIONLESS_CTE_RX.bits
            | FeatureSet::ANTENNA_SWITCHING_AOD.bits
            | FeatureSet::ANTENNA_SWITCHING_AOA.bits
            | FeatureSet::REMOTE_PUBLIC_KEY_VALIDATION.bits,
    };

    /// Returns the feature set implemented by this controller.
    pub fn supported() -> Self {
        FeatureSet::LE_ENCRYPTION
            | FeatureSet::CONN_PARAM_REQ
            | FeatureSet::EXTENDED_REJECT_INDICATION
            | FeatureSet::SLAVE_FEATURE_EXCHANGE
            | FeatureSet::LE_PING
            | FeatureSet::LE_DATA_PACKET_LENGTH_EXTENSION
            | FeatureSet::LE_2M_PHY
            | FeatureSet::LE_CODED_PHY
            | FeatureSet::CHANNEL_SELECTION_ALGORITHM_2
            | FeatureSet::CONNECTION_CTE_REQUEST
            | FeatureSet::CONNECTION_CTE_RESPONSE
    }

    /// Computes the feature set usable on a connection from the local set and the set a peer
    /// reported.
    ///
    /// Features the peer doesn't support are removed, except for those in
    /// [`IGNORED_FROM_PEER`](#associatedconstant.IGNORED_FROM_PEER). The result never contains a
    /// feature the local set lacks.
    pub fn negotiate(local: FeatureSet, peer: FeatureSet) -> FeatureSet {
        local & (peer | FeatureSet::IGNORED_FROM_PEER)
    }
}

impl ToBytes for FeatureSet {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u64_le(self.bits())
    }
}

impl<'a> FromBytes<'a> for FeatureSet {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        let raw = bytes.read_u64_le()?;
        Ok(Self::from_bits_truncate(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_peer_bits_are_dropped() {
        let raw = (1u64 << 40) | FeatureSet::LE_2M_PHY.bits();
        let mut bytes = [0; 8];
        bytes.copy_from_slice(&raw.to_le_bytes());
        let peer = FeatureSet::from_bytes(&mut ByteReader::new(&bytes)).unwrap();
        assert_eq!(peer, FeatureSet::LE_2M_PHY);
    }

    #[test]
    fn negotiation_never_adds_or_downgrades_ignored_bits() {
        let local = FeatureSet::supported();
        let used = FeatureSet::negotiate(local, FeatureSet::LE_ENCRYPTION);
        assert!(used.contains(FeatureSet::LE_ENCRYPTION));
        assert!(used.contains(FeatureSet::LE_PING));
        assert!(!used.contains(FeatureSet::LE_2M_PHY));
        assert!(!used.contains(FeatureSet::CONN_PARAM_REQ));

        let used = FeatureSet::negotiate(local, FeatureSet::all());
        assert_eq!(used, local);
        assert!(!used.contains(FeatureSet::LE_PERIODIC_ADVERTISING));
    }
}
