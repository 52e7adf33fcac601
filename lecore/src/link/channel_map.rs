use {
    crate::{bytes::*, phy::DataChannel, Error},
    core::fmt,
};

/// Number of data channels.
pub const NUM_DATA_CHANNELS: u8 = 37;

/// A map marking data channels as used or unused, plus its remapping table.
///
/// Both channel selection algorithms fall back to the remapping table when the unmapped channel
/// they compute is not in use. The table lists the used channels in ascending order and is rebuilt
/// whenever the map changes.
///
/// A channel map exchanged with a peer must mark at least 2 channels as used, see
/// [`is_valid`](#method.is_valid).
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct ChannelMap {
    raw: [u8; 5],
    num_used_channels: u8,
    remap: [u8; NUM_DATA_CHANNELS as usize],
}

impl ChannelMap {
    /// Creates a channel map from the 5-octet `ChM` field.
    ///
    /// The least significant bit of the first octet is channel 0. The 3 most significant bits of
    /// the last octet are reserved and are cleared here.
    pub fn from_raw(mut raw: [u8; 5]) -> Self {
        raw[4] &= 0b1_1111;
        let mut remap = [0; NUM_DATA_CHANNELS as usize];
        let mut num_used_channels = 0;
        for index in 0..NUM_DATA_CHANNELS {
            if raw[usize::from(index / 8)] & (1 << (index % 8)) != 0 {
                remap[usize::from(num_used_channels)] = index;
                num_used_channels += 1;
            }
        }

        Self {
            raw,
            num_used_channels,
            remap,
        }
    }

    /// Creates a channel map that marks all data channels as used.
    pub fn with_all_channels() -> Self {
        Self::from_raw([0xff, 0xff, 0xff, 0xff, 0b1_1111])
    }

    /// Returns the raw `ChM` encoding of this map.
    pub fn to_raw(&self) -> [u8; 5] {
        self.raw
    }

    pub fn num_used_channels(&self) -> u8 {
        self.num_used_channels
    }

    /// Returns whether the map may be used on a connection (at least 2 used channels).
    pub fn is_valid(&self) -> bool {
        self.num_used_channels >= 2
    }

    pub fn is_used(&self, channel: DataChannel) -> bool {
        let index = channel.index();
        self.raw[usize::from(index / 8)] & (1 << (index % 8)) != 0
    }

    /// Returns an iterator over all used data channels, in ascending order.
    pub fn iter_used(&self) -> impl Iterator<Item = DataChannel> + '_ {
        self.remap[..usize::from(self.num_used_channels)]
            .iter()
            .map(|&index| DataChannel::new(index))
    }

    /// Returns the `n`th used channel (the remapping table entry `n`).
    ///
    /// # Panics
    ///
    /// This will panic when `n >= self.num_used_channels()`.
    pub fn by_index(&self, n: u8) -> DataChannel {
        assert!(n < self.num_used_channels, "remapping index out of range");
        DataChannel::new(self.remap[usize::from(n)])
    }

    /// Returns the intersection of `self` and `other`.
    pub fn intersect(&self, other: &ChannelMap) -> ChannelMap {
        let mut raw = self.raw;
        for (byte, other) in raw.iter_mut().zip(other.raw.iter()) {
            *byte &= other;
        }
        ChannelMap::from_raw(raw)
    }
}

impl Default for ChannelMap {
    fn default() -> Self {
        Self::with_all_channels()
    }
}

impl ToBytes for ChannelMap {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_slice(&self.raw)
    }
}

impl<'a> FromBytes<'a> for ChannelMap {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        Ok(ChannelMap::from_raw(bytes.read_array()?))
    }
}

impl fmt::Display for ChannelMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for index in 0..NUM_DATA_CHANNELS {
            let used = self.is_used(DataChannel::new(index));
            f.write_str(if used { "1" } else { "0" })?;
        }
        Ok(())
    }
}

impl fmt::Debug for ChannelMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} used)", self, self.num_used_channels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_channel() {
        // Not a valid map for a connection, but still well-formed.
        let map = ChannelMap::from_raw([0x01, 0, 0, 0, 0]);
        assert_eq!(map.num_used_channels(), 1);
        assert!(!map.is_valid());
        assert!(map.is_used(DataChannel::new(0)));
        assert!(!map.is_used(DataChannel::new(1)));
        assert!(!map.is_used(DataChannel::new(36)));
        assert_eq!(map.by_index(0), DataChannel::new(0));
        assert!(map.iter_used().eq(vec![DataChannel::new(0)]));
    }

    #[test]
    fn rfu_bits_ignored() {
        let map = ChannelMap::from_raw([0xff; 5]);
        assert_eq!(map.num_used_channels(), 37);
        assert_eq!(map, ChannelMap::with_all_channels());
        assert_eq!(map.to_raw()[4], 0x1f);
    }

    #[test]
    fn remap_table_is_ascending_used_channels() {
        let map = ChannelMap::from_raw([0x00, 0x06, 0xe0, 0x00, 0x1e]);
        let used: Vec<u8> = map.iter_used().map(|ch| ch.index()).collect();
        assert_eq!(used, vec![9, 10, 21, 22, 23, 33, 34, 35, 36]);
        assert_eq!(map.by_index(4), DataChannel::new(23));
    }

    #[test]
    fn intersection() {
        let a = ChannelMap::from_raw([0x0f, 0, 0, 0, 0]);
        let b = ChannelMap::from_raw([0x3c, 0, 0, 0, 0]);
        assert_eq!(a.intersect(&b).to_raw(), [0x0c, 0, 0, 0, 0]);
    }
}
