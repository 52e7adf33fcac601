//! Controller configuration.

use crate::{
    ecdh::EcdhProvider,
    link::{features::FeatureSet, scheduler::SecondaryPolicy, Radio},
    phy::PhySet,
    security::rng::Trng,
    time::{Duration, Timer},
};

/// Trait for link-layer controller configurations.
///
/// This trait binds the platform collaborators used by a [`LinkLayer`]. Every application must
/// define a type implementing it.
///
/// [`LinkLayer`]: ../link/struct.LinkLayer.html
pub trait Config {
    /// A timesource with microsecond resolution.
    type Timer: Timer;

    /// The radio driver.
    type Radio: Radio;

    /// Hardware entropy source.
    type Trng: Trng;

    /// P-256 implementation used for `LE Read Local P-256 Public Key` and `LE Generate DHKey`.
    type EcdhProvider: EcdhProvider;

    /// Decides between secondary roles competing for the same gap.
    type SecondaryPolicy: SecondaryPolicy;
}

/// Run-time controller parameters.
#[derive(Debug, Copy, Clone)]
pub struct Params {
    /// Radio time reserved per master connection in every interval.
    pub slot_unit: Duration,

    /// Guard band kept free in front of every radio operation.
    pub pre_guard: Duration,

    /// Guard band kept free after every radio operation.
    pub post_guard: Duration,

    /// Time after which an unanswered control procedure fails with `LL Response Timeout`.
    pub ctrl_proc_timeout: Duration,

    /// Initial authenticated payload timeout of new connections.
    pub default_apto: Duration,

    /// Worst-case accuracy of the local sleep clock, in ppm.
    pub sleep_clock_ppm: u16,

    pub company_id: u16,
    pub sub_vers_nr: u16,

    /// Features this controller supports.
    pub features: FeatureSet,

    pub max_tx_octets: u16,
    pub max_tx_time: u16,
    pub max_rx_octets: u16,
    pub max_rx_time: u16,

    /// PHYs the controller prefers when starting or answering a PHY update.
    pub preferred_phys: PhySet,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            slot_unit: Duration::CONN_UNIT,
            pre_guard: Duration::T_IFS,
            post_guard: Duration::T_IFS,
            ctrl_proc_timeout: Duration::from_secs(40),
            default_apto: Duration::from_secs(30),
            sleep_clock_ppm: 50,
            company_id: 0xFFFF,
            sub_vers_nr: 0x0001,
            features: FeatureSet::supported(),
            max_tx_octets: 251,
            max_tx_time: 2120,
            max_rx_octets: 251,
            max_rx_time: 2120,
            preferred_phys: PhySet::LE_1M | PhySet::LE_2M,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fit_data_length_limits() {
        let params = Params::default();
        assert!((27..=251).contains(&params.max_tx_octets));
        assert!((328..=17040).contains(&params.max_tx_time));
        assert_eq!(params.ctrl_proc_timeout.whole_millis(), 40_000);
        assert!(params.features.contains(FeatureSet::LE_ENCRYPTION));
    }
}
