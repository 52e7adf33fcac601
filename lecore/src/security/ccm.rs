//! AES-CCM for data channel PDUs.
//!
//! Link-layer CCM uses a 4-octet MIC and a 13-octet nonce (so a 2-octet length field). The nonce
//! is built from the 39-bit packet counter, a direction bit, and the 8-octet IV:
//!
//! ```notrust
//! octet   0..=3            4                  5..=8    9..=12
//!       +----------------+------------------+--------+--------+
//!       | counter[0..32] | counter[32..39]  |  IVm   |  IVs   |
//!       |                | | direction << 7 |        |        |
//!       +----------------+------------------+--------+--------+
//! ```
//!
//! The direction bit is 1 for PDUs sent by the master. The single octet of additional
//! authenticated data is the first header octet with `NESN`, `SN` and `MD` masked out.

use {
    super::CryptoError,
    crate::link::data::{PayloadBuf, MAX_PAYLOAD, MIC_SIZE},
    aes::Aes128,
    ccm::{
        aead::{
            consts::{U13, U4},
            generic_array::GenericArray,
            AeadInPlace, KeyInit,
        },
        Ccm,
    },
};

/// Size of the CCM nonce.
pub const NONCE_SIZE: usize = 13;

/// Packet counters are 39 bits wide.
pub const MAX_PACKET_COUNTER: u64 = (1 << 39) - 1;

/// Direction a PDU travels in, as encoded in the nonce.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    MasterToSlave,
    SlaveToMaster,
}

/// A CCM nonce for one PDU.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// Builds the nonce for the PDU with packet counter `counter`.
    ///
    /// `iv` is the combined `IVm || IVs`, both halves in transmission order.
    pub fn new(counter: u64, direction: Direction, iv: &[u8; 8]) -> Self {
        let mut nonce = [0; NONCE_SIZE];
        let counter = (counter & MAX_PACKET_COUNTER).to_le_bytes();
        nonce[..5].copy_from_slice(&counter[..5]);
        if direction == Direction::MasterToSlave {
            nonce[4] |= 0x80;
        }
        nonce[5..].copy_from_slice(iv);
        Nonce(nonce)
    }

    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }
}

type LinkCcm = Ccm<Aes128, U4, U13>;

/// CCM instance keyed with a session key.
pub struct LinkCipher {
    ccm: LinkCcm,
}

impl LinkCipher {
    /// Creates a cipher from a session key, most significant octet first.
    pub fn new(session_key: &[u8; 16]) -> Self {
        Self {
            ccm: LinkCcm::new(GenericArray::from_slice(session_key)),
        }
    }

    /// Encrypts `payload` in place and appends the MIC.
    pub fn encrypt(
        &self,
        nonce: &Nonce,
        aad: u8,
        payload: &mut PayloadBuf,
    ) -> Result<(), CryptoError> {
        if payload.len() > MAX_PAYLOAD {
            return Err(CryptoError::PayloadTooLong);
        }
        let tag = self
            .ccm
            .encrypt_in_place_detached(GenericArray::from_slice(&nonce.0), &[aad], payload)
            .map_err(|_| CryptoError::PayloadTooLong)?;
        payload
            .extend_from_slice(&tag)
            .map_err(|_| CryptoError::PayloadTooLong)
    }

    /// Verifies and strips the MIC, then decrypts `payload` in place.
    ///
    /// On MIC mismatch the payload is left in an unspecified state and must be discarded.
    pub fn decrypt(
        &self,
        nonce: &Nonce,
        aad: u8,
        payload: &mut PayloadBuf,
    ) -> Result<(), CryptoError> {
        let len = payload
            .len()
            .checked_sub(MIC_SIZE)
            .ok_or(CryptoError::MicMismatch)?;
        let mut mic = [0; MIC_SIZE];
        mic.copy_from_slice(&payload[len..]);
        self.ccm
            .decrypt_in_place_detached(
                GenericArray::from_slice(&nonce.0),
                &[aad],
                &mut payload[..len],
                GenericArray::from_slice(&mic),
            )
            .map_err(|_| CryptoError::MicMismatch)?;
        payload.truncate(len);
        Ok(())
    }
}
