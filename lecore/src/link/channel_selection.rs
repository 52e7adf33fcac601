//! Data channel selection (Channel Selection Algorithms #1 and #2).
//!
//! CSA#1 hops linearly through the unmapped channels and therefore carries state from one
//! connection event to the next. CSA#2 derives the channel from the event counter alone, so it can
//! be evaluated for any event in isolation. Both remap onto the used-channel table of the current
//! [`ChannelMap`] when the unmapped channel is unused.

use {
    super::channel_map::{ChannelMap, NUM_DATA_CHANNELS},
    crate::phy::DataChannel,
};

/// Channel selection state of a connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChannelSelection {
    /// Channel Selection Algorithm #1.
    Csa1 {
        /// Hop increment, 5..=16.
        hop: u8,
        /// Unmapped channel of the previous connection event.
        last_unmapped: u8,
    },
    /// Channel Selection Algorithm #2.
    Csa2 { channel_id: u16 },
}

impl ChannelSelection {
    pub fn csa1(hop: u8) -> Self {
        ChannelSelection::Csa1 {
            hop,
            last_unmapped: 0,
        }
    }

    pub fn csa2(access_address: u32) -> Self {
        ChannelSelection::Csa2 {
            channel_id: channel_identifier(access_address),
        }
    }

    /// Selects the channel for connection event `counter`.
    ///
    /// For CSA#1, this must be called exactly once per connection event, in order, including
    /// events that are skipped (see [`skip_event`](#method.skip_event)).
    pub fn select(&mut self, counter: u16, map: &ChannelMap) -> DataChannel {
        match self {
            ChannelSelection::Csa1 { hop, last_unmapped } => {
                let (unmapped, channel) = csa1_next(*last_unmapped, *hop, map);
                *last_unmapped = unmapped;
                channel
            }
            ChannelSelection::Csa2 { channel_id } => csa2_channel(counter, *channel_id, map),
        }
    }

    /// Advances the hopping state over a connection event that did not take place.
    pub fn skip_event(&mut self) {
        if let ChannelSelection::Csa1 { hop, last_unmapped } = self {
            *last_unmapped = (*last_unmapped + *hop) % NUM_DATA_CHANNELS;
        }
    }

    pub fn is_csa2(&self) -> bool {
        matches!(self, ChannelSelection::Csa2 { .. })
    }
}

/// Performs one CSA#1 hop.
///
/// Returns the new unmapped channel, which must be passed back in on the next event, and the
/// channel to use.
pub fn csa1_next(last_unmapped: u8, hop: u8, map: &ChannelMap) -> (u8, DataChannel) {
    let unmapped = (last_unmapped + hop) % NUM_DATA_CHANNELS;
    let channel = DataChannel::new(unmapped);
    if map.is_used(channel) {
        (unmapped, channel)
    } else {
        let remapping_index = unmapped % map.num_used_channels();
        (unmapped, map.by_index(remapping_index))
    }
}

/// Derives the CSA#2 channel identifier from a connection's access address.
pub fn channel_identifier(access_address: u32) -> u16 {
    ((access_address >> 16) as u16) ^ (access_address as u16)
}

/// Reverses the bit order within each octet.
fn perm(value: u16) -> u16 {
    let [lo, hi] = value.to_le_bytes();
    u16::from_le_bytes([lo.reverse_bits(), hi.reverse_bits()])
}

/// Multiply, add, modulo 2^16.
fn mam(a: u16, b: u16) -> u16 {
    a.wrapping_mul(17).wrapping_add(b)
}

/// The CSA#2 event pseudo-random number `prn_e`.
pub fn prn_e(counter: u16, channel_id: u16) -> u16 {
    let mut prn = counter ^ channel_id;
    for _ in 0..3 {
        prn = mam(perm(prn), channel_id);
    }
    prn ^ channel_id
}

/// Computes the CSA#2 channel of event `counter`.
pub fn csa2_channel(counter: u16, channel_id: u16, map: &ChannelMap) -> DataChannel {
    let prn = prn_e(counter, channel_id);
    let unmapped = DataChannel::new((prn % u16::from(NUM_DATA_CHANNELS)) as u8);
    if map.is_used(unmapped) {
        unmapped
    } else {
        let remapping_index = (u32::from(map.num_used_channels()) * u32::from(prn)) >> 16;
        map.by_index(remapping_index as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_AA: u32 = 0x8E89_BED6;

    #[test]
    fn csa2_sample_data_all_channels() {
        let id = channel_identifier(SAMPLE_AA);
        assert_eq!(id, 0x305F);
        let map = ChannelMap::with_all_channels();
        let prns: Vec<u16> = (0..4).map(|c| prn_e(c, id)).collect();
        assert_eq!(prns, vec![56857, 1685, 38301, 27475]);
        let channels: Vec<u8> = (0..4).map(|c| csa2_channel(c, id, &map).index()).collect();
        assert_eq!(channels, vec![25, 20, 6, 21]);
    }

    #[test]
    fn csa2_sample_data_nine_channels() {
        let id = channel_identifier(SAMPLE_AA);
        let map = ChannelMap::from_raw([0x00, 0x06, 0xe0, 0x00, 0x1e]);
        let prns: Vec<u16> = (6..9).map(|c| prn_e(c, id)).collect();
        assert_eq!(prns, vec![10975, 5490, 46970]);
        let channels: Vec<u8> = (6..9).map(|c| csa2_channel(c, id, &map).index()).collect();
        assert_eq!(channels, vec![23, 9, 34]);
    }

    #[test]
    fn csa1_hops_and_remaps() {
        let mut sel = ChannelSelection::csa1(7);
        let all = ChannelMap::with_all_channels();
        let channels: Vec<u8> = (0..7).map(|c| sel.select(c, &all).index()).collect();
        assert_eq!(channels, vec![7, 14, 21, 28, 35, 5, 12]);

        // Channels 0, 4 and 20 used.
        let sparse = ChannelMap::from_raw([0x11, 0x00, 0x10, 0x00, 0x00]);
        let mut sel = ChannelSelection::csa1(5);
        let channels: Vec<u8> = (0..4).map(|c| sel.select(c, &sparse).index()).collect();
        // 5 -> 5%3=2 -> 20, 10 -> 1 -> 4, 15 -> 0 -> 0, 20 used.
        assert_eq!(channels, vec![20, 4, 0, 20]);
    }

    #[test]
    fn csa1_skip_matches_select() {
        let map = ChannelMap::from_raw([0xf0, 0x0f, 0xff, 0x00, 0x13]);
        let mut stepped = ChannelSelection::csa1(11);
        let mut skipped = stepped;
        for c in 0..5 {
            stepped.select(c, &map);
        }
        for _ in 0..4 {
            skipped.skip_event();
        }
        skipped.select(4, &map);
        assert_eq!(stepped, skipped);
    }

    #[test]
    fn selected_channels_always_used() {
        let map = ChannelMap::from_raw([0x81, 0x00, 0x40, 0x02, 0x10]);
        let id = channel_identifier(0x1234_5678);
        let mut csa1 = ChannelSelection::csa1(16);
        for counter in 0..=u16::MAX {
            assert!(map.is_used(csa2_channel(counter, id, &map)));
            assert!(map.is_used(csa1.select(counter, &map)));
        }
    }
}
