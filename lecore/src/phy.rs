//! Physical layer: RF channels and PHY modes.
//!
//! The link layer addresses channels by "channel index": 0..=36 are data channels and 37..=39 are
//! the primary advertising channels. The radio driver is responsible for converting these to RF
//! channels and whitening seeds; the helpers are provided here because they're fixed by the Core.

use {bitflags::bitflags, core::fmt};

fn rf_channel_freq(rf_channel: u8) -> u16 {
    2402 + u16::from(rf_channel) * 2
}

/// One of the three primary advertising channels (channel indices 37, 38 or 39).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AdvertisingChannel(u8);

impl AdvertisingChannel {
    /// Returns the first (lowest-numbered) advertising channel.
    pub fn first() -> Self {
        AdvertisingChannel(37)
    }

    /// Returns the next advertising channel, wrapping back to 37 after 39.
    pub fn cycle(&self) -> Self {
        if self.0 == 39 {
            AdvertisingChannel(37)
        } else {
            AdvertisingChannel(self.0 + 1)
        }
    }

    pub fn index(&self) -> u8 {
        self.0
    }

    /// RF channels 0, 12 and 39 carry advertising.
    pub fn rf_channel(&self) -> u8 {
        match self.0 {
            37 => 0,
            38 => 12,
            _ => 39,
        }
    }

    pub fn freq(&self) -> u16 {
        rf_channel_freq(self.rf_channel())
    }

    /// Initial value of the whitening LFSR (`x^7 + x^4 + 1`), position 0 in bit 6.
    pub fn whitening_iv(&self) -> u8 {
        0b0100_0000 | self.0
    }
}

/// One of 37 data channels (channel indices 0..=36).
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct DataChannel(u8);

impl DataChannel {
    /// Creates a `DataChannel` from a raw index.
    ///
    /// # Panics
    ///
    /// This will panic if `index` is not a valid data channel index. Valid indices are 0..=36.
    pub fn new(index: u8) -> Self {
        assert!(index <= 36, "invalid data channel index {}", index);
        DataChannel(index)
    }

    /// Returns the data channel index, always in range 0..=36.
    pub fn index(&self) -> u8 {
        self.0
    }

    /// RF channels 1-11 and 13-38 are used for data transmission.
    pub fn rf_channel(&self) -> u8 {
        if self.0 <= 10 {
            self.0 + 1
        } else {
            self.0 + 2
        }
    }

    pub fn freq(&self) -> u16 {
        rf_channel_freq(self.rf_channel())
    }

    pub fn whitening_iv(&self) -> u8 {
        0b0100_0000 | self.0
    }
}

impl fmt::Debug for DataChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch{}", self.0)
    }
}

/// A PHY in use on a connection, in one direction.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phy {
    Le1M,
    Le2M,
    /// LE Coded with S=8 coding, the worst case assumed for timing.
    LeCoded,
}

impl Phy {
    /// Returns the single-bit set representing this PHY in PHY PDUs.
    pub fn to_set(self) -> PhySet {
        match self {
            Phy::Le1M => PhySet::LE_1M,
            Phy::Le2M => PhySet::LE_2M,
            Phy::LeCoded => PhySet::LE_CODED,
        }
    }

    /// Air time of a data PDU with an `octets`-byte payload and a MIC, in microseconds.
    ///
    /// This is the quantity the data length procedure negotiates as "max time".
    pub fn packet_time(self, octets: u16) -> u16 {
        match self {
            Phy::Le1M => (octets + 14) * 8,
            Phy::Le2M => (octets + 15) * 4,
            Phy::LeCoded => 400 + (octets + 9) * 64,
        }
    }
}

impl Default for Phy {
    fn default() -> Self {
        Phy::Le1M
    }
}

bitflags! {
    /// A set of PHYs, encoded as in `LL_PHY_REQ`, `LL_PHY_RSP` and `LL_PHY_UPDATE_IND`.
    #[derive(Default)]
    pub struct PhySet: u8 {
        const LE_1M = 0x01;
        const LE_2M = 0x02;
        const LE_CODED = 0x04;
    }
}

impl PhySet {
    /// Picks the fastest PHY in the set: 2M, then 1M, then Coded.
    pub fn fastest(self) -> Option<Phy> {
        if self.contains(PhySet::LE_2M) {
            Some(Phy::Le2M)
        } else if self.contains(PhySet::LE_1M) {
            Some(Phy::Le1M)
        } else if self.contains(PhySet::LE_CODED) {
            Some(Phy::LeCoded)
        } else {
            None
        }
    }

    /// Converts a set with exactly one bit into a `Phy`.
    pub fn single(self) -> Option<Phy> {
        if self.bits().count_ones() == 1 {
            self.fastest()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_channel_rf_mapping() {
        assert_eq!(DataChannel::new(0).rf_channel(), 1);
        assert_eq!(DataChannel::new(10).rf_channel(), 11);
        assert_eq!(DataChannel::new(11).rf_channel(), 13);
        assert_eq!(DataChannel::new(36).freq(), 2478);
        assert_eq!(AdvertisingChannel::first().cycle().freq(), 2426);
    }

    #[test]
    fn packet_times_match_core_limits() {
        assert_eq!(Phy::Le1M.packet_time(27), 328);
        assert_eq!(Phy::Le1M.packet_time(251), 2120);
        assert_eq!(Phy::Le2M.packet_time(27), 168);
        assert_eq!(Phy::LeCoded.packet_time(27), 2704);
        assert_eq!(Phy::LeCoded.packet_time(251), 17040);
    }

    #[test]
    fn phy_preference() {
        assert_eq!(PhySet::all().fastest(), Some(Phy::Le2M));
        assert_eq!((PhySet::LE_1M | PhySet::LE_CODED).fastest(), Some(Phy::Le1M));
        assert_eq!(PhySet::empty().fastest(), None);
        assert_eq!((PhySet::LE_1M | PhySet::LE_2M).single(), None);
        assert_eq!(PhySet::LE_CODED.single(), Some(Phy::LeCoded));
    }
}
