//! Link encryption and key material.
//!
//! Keys, `SKD` and IV halves are stored in the order they're transmitted over the air and used by
//! the HCI, which is least significant octet first. AES itself works on most significant octet
//! first blocks, so [`e`] reverses its inputs and output. The session key is the one exception: it
//! only ever feeds the CCM engine and is therefore kept most significant octet first.
//!
//! [`e`]: fn.e.html

pub mod ccm;
pub mod rng;

pub use self::ccm::{Direction, LinkCipher, Nonce, MAX_PACKET_COUNTER};

use {
    crate::link::{data::DataPdu, Role},
    aes::{
        cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit},
        Aes128,
    },
    core::fmt,
};

/// A 128-bit key, least significant octet first.
pub type Key = [u8; 16];

/// Errors from the link encryption engine.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// A received PDU failed authentication.
    MicMismatch,

    /// The 39-bit packet counter of one direction is used up.
    CounterExhausted,

    /// Encryption was enabled without a session key.
    NoSessionKey,

    /// The payload doesn't leave room for the MIC.
    PayloadTooLong,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CryptoError::MicMismatch => "MIC mismatch",
            CryptoError::CounterExhausted => "packet counter exhausted",
            CryptoError::NoSessionKey => "no session key",
            CryptoError::PayloadTooLong => "payload too long for MIC",
        })
    }
}

/// The security function `e`: AES-128 as exposed by the HCI `LE Encrypt` command.
///
/// `key`, `plaintext` and the result are all least significant octet first.
pub fn e(key: &Key, plaintext: &[u8; 16]) -> [u8; 16] {
    let mut key_be = *key;
    key_be.reverse();
    let mut block = *plaintext;
    block.reverse();

    let cipher = Aes128::new(GenericArray::from_slice(&key_be));
    let block_ref = GenericArray::from_mut_slice(&mut block);
    cipher.encrypt_block(block_ref);

    block.reverse();
    block
}

/// Derives the session key from the long term key and both session key diversifiers.
///
/// `SKD = SKDm || SKDs` with `SKDm` in the least significant half, and `SK = e(LTK, SKD)`. The
/// returned key is most significant octet first, ready for [`LinkCipher::new`].
///
/// [`LinkCipher::new`]: ccm/struct.LinkCipher.html#method.new
pub fn derive_session_key(ltk: &Key, skd_m: &[u8; 8], skd_s: &[u8; 8]) -> [u8; 16] {
    let mut skd = [0; 16];
    skd[..8].copy_from_slice(skd_m);
    skd[8..].copy_from_slice(skd_s);
    let mut sk = e(ltk, &skd);
    sk.reverse();
    sk
}

/// The master's half of the key exchange, as sent in `LL_ENC_REQ`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct MasterKeyMaterial {
    pub rand: [u8; 8],
    pub ediv: u16,
    pub skd_m: [u8; 8],
    pub iv_m: [u8; 4],
}

/// The slave's half of the key exchange, as sent in `LL_ENC_RSP`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct SlaveKeyMaterial {
    pub skd_s: [u8; 8],
    pub iv_s: [u8; 4],
}

/// Per-connection encryption state.
///
/// Transmit and receive encryption are switched on separately since the start and pause
/// handshakes flip them at different points. Each direction has its own packet counter, reset
/// whenever a new session key is installed.
pub struct EncryptionState {
    role: Role,
    cipher: Option<LinkCipher>,
    iv: [u8; 8],
    tx_counter: u64,
    rx_counter: u64,
    tx_enabled: bool,
    rx_enabled: bool,
    ltk: Option<Key>,
    master: MasterKeyMaterial,
    slave: SlaveKeyMaterial,
}

impl EncryptionState {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            cipher: None,
            iv: [0; 8],
            tx_counter: 0,
            rx_counter: 0,
            tx_enabled: false,
            rx_enabled: false,
            ltk: None,
            master: MasterKeyMaterial::default(),
            slave: SlaveKeyMaterial::default(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Sets the long term key to use for the next session.
    pub fn set_ltk(&mut self, ltk: Key) {
        self.ltk = Some(ltk);
    }

    pub fn ltk(&self) -> Option<&Key> {
        self.ltk.as_ref()
    }

    pub fn set_master_material(&mut self, material: MasterKeyMaterial) {
        self.master = material;
    }

    pub fn master_material(&self) -> &MasterKeyMaterial {
        &self.master
    }

    pub fn set_slave_material(&mut self, material: SlaveKeyMaterial) {
        self.slave = material;
    }

    pub fn slave_material(&self) -> &SlaveKeyMaterial {
        &self.slave
    }

    /// Derives the session key and IV from the stored LTK and exchanged material.
    ///
    /// Both packet counters restart at 0. Encryption stays off in both directions until enabled.
    pub fn start_session(&mut self) -> Result<(), CryptoError> {
        let ltk = self.ltk.as_ref().ok_or(CryptoError::NoSessionKey)?;
        let sk = derive_session_key(ltk, &self.master.skd_m, &self.slave.skd_s);
        self.cipher = Some(LinkCipher::new(&sk));
        self.iv[..4].copy_from_slice(&self.master.iv_m);
        self.iv[4..].copy_from_slice(&self.slave.iv_s);
        self.tx_counter = 0;
        self.rx_counter = 0;
        self.tx_enabled = false;
        self.rx_enabled = false;
        Ok(())
    }

    pub fn enable_rx(&mut self) -> Result<(), CryptoError> {
        if self.cipher.is_none() {
            return Err(CryptoError::NoSessionKey);
        }
        self.rx_enabled = true;
        Ok(())
    }

    pub fn enable_tx(&mut self) -> Result<(), CryptoError> {
        if self.cipher.is_none() {
            return Err(CryptoError::NoSessionKey);
        }
        self.tx_enabled = true;
        Ok(())
    }

    pub fn disable_rx(&mut self) {
        self.rx_enabled = false;
    }

    pub fn disable_tx(&mut self) {
        self.tx_enabled = false;
    }

    /// Drops the session key. Used when pausing encryption or tearing the connection down.
    pub fn clear_session(&mut self) {
        self.cipher = None;
        self.tx_enabled = false;
        self.rx_enabled = false;
    }

    pub fn tx_enabled(&self) -> bool {
        self.tx_enabled
    }

    pub fn rx_enabled(&self) -> bool {
        self.rx_enabled
    }

    /// Returns whether both directions are encrypted.
    pub fn is_encrypted(&self) -> bool {
        self.tx_enabled && self.rx_enabled
    }

    pub fn tx_counter(&self) -> u64 {
        self.tx_counter
    }

    pub fn rx_counter(&self) -> u64 {
        self.rx_counter
    }

    fn tx_direction(&self) -> Direction {
        match self.role {
            Role::Master => Direction::MasterToSlave,
            Role::Slave => Direction::SlaveToMaster,
        }
    }

    fn rx_direction(&self) -> Direction {
        match self.role {
            Role::Master => Direction::SlaveToMaster,
            Role::Slave => Direction::MasterToSlave,
        }
    }

    /// Encrypts an outgoing PDU in place if transmit encryption is on.
    ///
    /// PDUs with an empty payload are sent in the clear and don't consume a counter value.
    pub fn encrypt_pdu(&mut self, pdu: &mut DataPdu) -> Result<(), CryptoError> {
        if !self.tx_enabled || pdu.payload().is_empty() {
            return Ok(());
        }
        if self.tx_counter > MAX_PACKET_COUNTER {
            return Err(CryptoError::CounterExhausted);
        }
        let cipher = self.cipher.as_ref().ok_or(CryptoError::NoSessionKey)?;
        let nonce = Nonce::new(self.tx_counter, self.tx_direction(), &self.iv);
        let aad = pdu.header().ccm_aad();
        cipher.encrypt(&nonce, aad, pdu.payload_buf_mut())?;
        pdu.sync_length();
        self.tx_counter += 1;
        Ok(())
    }

    /// Authenticates and decrypts an incoming PDU in place if receive encryption is on.
    pub fn decrypt_pdu(&mut self, pdu: &mut DataPdu) -> Result<(), CryptoError> {
        if !self.rx_enabled || pdu.payload().is_empty() {
            return Ok(());
        }
        if self.rx_counter > MAX_PACKET_COUNTER {
            return Err(CryptoError::CounterExhausted);
        }
        let cipher = self.cipher.as_ref().ok_or(CryptoError::NoSessionKey)?;
        let nonce = Nonce::new(self.rx_counter, self.rx_direction(), &self.iv);
        let aad = pdu.header().ccm_aad();
        cipher.decrypt(&nonce, aad, pdu.payload_buf_mut())?;
        pdu.sync_length();
        self.rx_counter += 1;
        Ok(())
    }
}

impl fmt::Debug for EncryptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionState")
            .field("role", &self.role)
            .field("has_session_key", &self.cipher.is_some())
            .field("tx_enabled", &self.tx_enabled)
            .field("rx_enabled", &self.rx_enabled)
            .field("tx_counter", &self.tx_counter)
            .field("rx_counter", &self.rx_counter)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{data::Llid, llcp::ControlPdu};

    fn rev<const N: usize>(mut bytes: [u8; N]) -> [u8; N] {
        bytes.reverse();
        bytes
    }

    const LTK_MSO: [u8; 16] = [
        0x4C, 0x68, 0x38, 0x41, 0x39, 0xF5, 0x74, 0xD8, 0x36, 0xBC, 0xF3, 0x4E, 0x9D, 0xFB, 0x01,
        0xBF,
    ];
    const SKD_M_MSO: [u8; 8] = [0xAC, 0xBD, 0xCE, 0xDF, 0xE0, 0xF1, 0x02, 0x13];
    const SKD_S_MSO: [u8; 8] = [0x02, 0x13, 0x24, 0x35, 0x46, 0x57, 0x68, 0x79];

    fn sample_material() -> (MasterKeyMaterial, SlaveKeyMaterial) {
        (
            MasterKeyMaterial {
                rand: [0; 8],
                ediv: 0,
                skd_m: rev(SKD_M_MSO),
                iv_m: [0x24, 0xAB, 0xDC, 0xBA],
            },
            SlaveKeyMaterial {
                skd_s: rev(SKD_S_MSO),
                iv_s: [0xBE, 0xBA, 0xAF, 0xDE],
            },
        )
    }

    fn state(role: Role) -> EncryptionState {
        let (master, slave) = sample_material();
        let mut state = EncryptionState::new(role);
        state.set_ltk(rev(LTK_MSO));
        state.set_master_material(master);
        state.set_slave_material(slave);
        state
    }

    #[test]
    fn e_matches_fips197() {
        let key = rev([
            0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d,
            0x0e, 0x0f,
        ]);
        let plaintext = rev([
            0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd,
            0xee, 0xff,
        ]);
        let expected = rev([
            0x69, 0xc4, 0xe0, 0xd8, 0x6a, 0x7b, 0x04, 0x30, 0xd8, 0xcd, 0xb7, 0x80, 0x70, 0xb4,
            0xc5, 0x5a,
        ]);
        assert_eq!(e(&key, &plaintext), expected);
        assert_eq!(
            e(&[0; 16], &[0; 16]),
            rev([
                0x66, 0xe9, 0x4b, 0xd4, 0xef, 0x8a, 0x2c, 0x3b, 0x88, 0x4c, 0xfa, 0x59, 0xca, 0x34,
                0x2b, 0x2e
            ])
        );
    }

    #[test]
    fn session_key_sample_data() {
        let sk = derive_session_key(&rev(LTK_MSO), &rev(SKD_M_MSO), &rev(SKD_S_MSO));
        assert_eq!(
            sk,
            [
                0x99, 0xad, 0x1b, 0x52, 0x26, 0xa3, 0x7e, 0x3e, 0x05, 0x8e, 0x3b, 0x8e, 0x27, 0xc2,
                0xc6, 0x66
            ]
        );
        // Deterministic for the same inputs, different for a new LTK.
        assert_eq!(
            derive_session_key(&rev(LTK_MSO), &rev(SKD_M_MSO), &rev(SKD_S_MSO)),
            sk
        );
        let mut other = rev(LTK_MSO);
        other[0] ^= 1;
        assert_ne!(
            derive_session_key(&other, &rev(SKD_M_MSO), &rev(SKD_S_MSO)),
            sk
        );
    }

    #[test]
    fn start_enc_rsp_exchange() {
        let mut master = state(Role::Master);
        let mut slave = state(Role::Slave);
        master.start_session().unwrap();
        slave.start_session().unwrap();
        master.enable_rx().unwrap();
        master.enable_tx().unwrap();
        slave.enable_rx().unwrap();

        let mut pdu = DataPdu::control(&ControlPdu::StartEncRsp).unwrap();
        pdu.header_mut().set_nesn(crate::link::data::SeqNum::ONE);
        pdu.header_mut().set_sn(crate::link::data::SeqNum::ONE);
        master.encrypt_pdu(&mut pdu).unwrap();
        assert_eq!(pdu.header().payload_length(), 5);
        assert_eq!(pdu.payload(), &[0x9f, 0xcd, 0xa7, 0xf4, 0x48]);
        assert_eq!(master.tx_counter(), 1);

        slave.decrypt_pdu(&mut pdu).unwrap();
        assert_eq!(pdu.to_control().unwrap(), ControlPdu::StartEncRsp);
        assert_eq!(slave.rx_counter(), 1);

        slave.enable_tx().unwrap();
        let mut pdu = DataPdu::control(&ControlPdu::StartEncRsp).unwrap();
        slave.encrypt_pdu(&mut pdu).unwrap();
        assert_eq!(pdu.payload(), &[0xa3, 0x4c, 0x13, 0xa4, 0x15]);
        master.decrypt_pdu(&mut pdu).unwrap();
        assert_eq!(pdu.payload(), &[0x06]);
    }

    #[test]
    fn empty_pdus_stay_plain() {
        let mut master = state(Role::Master);
        master.start_session().unwrap();
        master.enable_tx().unwrap();
        let mut pdu = DataPdu::empty();
        master.encrypt_pdu(&mut pdu).unwrap();
        assert!(pdu.is_empty());
        assert_eq!(master.tx_counter(), 0);
    }

    #[test]
    fn replay_and_corruption_fail() {
        let mut master = state(Role::Master);
        let mut slave = state(Role::Slave);
        master.start_session().unwrap();
        slave.start_session().unwrap();
        master.enable_tx().unwrap();
        slave.enable_rx().unwrap();

        let mut pdu = DataPdu::data(Llid::DataStart, b"\x02\x00\x04\x00AB").unwrap();
        master.encrypt_pdu(&mut pdu).unwrap();
        let replay = pdu.clone();
        slave.decrypt_pdu(&mut pdu).unwrap();
        assert_eq!(pdu.payload(), b"\x02\x00\x04\x00AB");

        // Counter has moved on, so the same ciphertext no longer authenticates.
        let mut replay = replay;
        assert_eq!(
            slave.decrypt_pdu(&mut replay),
            Err(CryptoError::MicMismatch)
        );
    }

    #[test]
    fn enabling_requires_session() {
        let mut state = EncryptionState::new(Role::Slave);
        assert_eq!(state.enable_tx(), Err(CryptoError::NoSessionKey));
        assert_eq!(state.start_session(), Err(CryptoError::NoSessionKey));
        state.set_ltk([1; 16]);
        state.start_session().unwrap();
        state.enable_tx().unwrap();
        state.clear_session();
        assert!(!state.tx_enabled());
    }
}
