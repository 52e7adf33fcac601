//! Elliptic Curve Diffie-Hellman (ECDH) on P-256.
//!
//! LE Secure Connections pairing needs a P-256 key pair and the DHKey computed from the peer's
//! public key. The curve operations sit behind the [`EcdhProvider`] and [`SecretKey`] traits so a
//! platform can plug in a hardware accelerator; [`P256Provider`] is the built-in software
//! implementation on top of the [`p256`] crate.
//!
//! Scalar multiplication takes on the order of 100 ms on a Cortex-M class core, far longer than
//! a connection event. Requests therefore go through the [`KeyAgreement`] job, which the
//! controller only advances from its background entry point and never from radio or timer
//! context.
//!
//! [`EcdhProvider`]: trait.EcdhProvider.html
//! [`SecretKey`]: trait.SecretKey.html
//! [`P256Provider`]: struct.P256Provider.html
//! [`KeyAgreement`]: struct.KeyAgreement.html
//! [`p256`]: https://docs.rs/p256

mod job;
mod p256;

pub use self::{job::*, p256::*};

use {
    crate::utils::HexSlice,
    core::fmt,
    rand_core::{CryptoRng, RngCore},
};

/// A P-256 public key (point on the curve) in uncompressed format.
///
/// The encoding is as specified in *[SEC 1: Elliptic Curve Cryptography]*, but without the leading
/// `0x04` byte: The first 32 Bytes are the big-endian encoding of the point's X coordinate, and the
/// remaining 32 Bytes are the Y coordinate, encoded the same way.
///
/// This type makes no validity guarantees. It can hold invalid keys such as the point at
/// infinity, and every consumer has to reject those.
///
/// [SEC 1: Elliptic Curve Cryptography]: http://www.secg.org/sec1-v2.pdf
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct PublicKey(pub [u8; 64]);

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({:?})", HexSlice(&self.0[..]))
    }
}

/// The DHKey resulting from an ECDH key agreement (X coordinate of the shared point, big-endian).
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct SharedSecret(pub [u8; 32]);

impl fmt::Debug for SharedSecret {
    // Don't leak the secret into logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

/// Error returned by [`SecretKey::agree`] when the public key of the other party is invalid.
///
/// [`SecretKey::agree`]: trait.SecretKey.html#tymethod.agree
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct InvalidPublicKey {}

impl InvalidPublicKey {
    /// Creates a new `InvalidPublicKey` error.
    pub fn new() -> Self {
        Self {}
    }
}

impl fmt::Display for InvalidPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid public key")
    }
}

/// Trait for ECDH providers.
pub trait EcdhProvider {
    /// Provider-defined secret key type.
    type SecretKey: SecretKey;

    /// Generates a P-256 key pair using cryptographically strong randomness.
    ///
    /// Implementors must only return valid private/public key pairs from this method. The
    /// controller passes its DRBG as `rng`; implementations may use their own entropy instead.
    fn generate_keypair<R>(&mut self, rng: &mut R) -> (Self::SecretKey, PublicKey)
    where
        R: RngCore + CryptoRng;
}

/// Secret key operations.
///
/// No requirements are imposed on where or how the key is stored, so keys held in a secure
/// element can implement this too.
pub trait SecretKey: Sized {
    /// Performs ECDH key agreement using the secret key `self` and the public key of the other
    /// party.
    ///
    /// Takes `self` by value so providers can enforce single use of ephemeral keys.
    ///
    /// # Errors
    ///
    /// If `foreign_key` is an invalid public key, implementors must return an error.
    fn agree(self, foreign_key: &PublicKey) -> Result<SharedSecret, InvalidPublicKey>;
}

/// Runs the P-256 provider conformance suite against `provider`.
///
/// This is a quick smoke test that does not provide any assurance about security properties.
/// The P-256 implementation should have a dedicated test suite.
pub fn run_tests(mut provider: impl EcdhProvider) {
    static RNG: &[u8] = &[
        0x1e, 0x66, 0x81, 0xb6, 0xa3, 0x4e, 0x06, 0x97, 0x75, 0xbe, 0xd4, 0x5c, 0xf9, 0x52, 0x3f,
        0xf1, 0x5b, 0x6a, 0x72, 0xe2, 0xb8, 0x35, 0xb3, 0x29, 0x5e, 0xe0, 0xbb, 0x92, 0x35, 0xa5,
        0xb9, 0x60, 0xc9, 0xaf, 0xe2, 0x72, 0x12, 0xf1, 0xc4, 0xfc, 0x10, 0x2d, 0x63, 0x2f, 0x05,
        0xd6, 0xe5, 0x0a, 0xbf, 0x2c, 0xb9, 0x02, 0x3a, 0x67, 0x23, 0x63, 0x36, 0x7a, 0x62, 0xe6,
        0x63, 0xce, 0x28, 0x98,
    ];

    // Replays a fixed sequence of pregenerated numbers. Never do this outside of tests.
    struct Rng(&'static [u8]);

    impl RngCore for Rng {
        fn next_u32(&mut self) -> u32 {
            rand_core::impls::next_u32_via_fill(self)
        }
        fn next_u64(&mut self) -> u64 {
            rand_core::impls::next_u64_via_fill(self)
        }
        fn fill_bytes(&mut self, dest: &mut [u8]) {
            if self.0.len() < dest.len() {
                panic!("ecdh::run_tests: ran out of pregenerated entropy");
            }

            let (head, tail) = self.0.split_at(dest.len());
            dest.copy_from_slice(head);
            self.0 = tail;
        }
        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
            self.fill_bytes(dest);
            Ok(())
        }
    }

    impl CryptoRng for Rng {}

    // Different key pairs come out of different entropy.
    let mut rng = Rng(RNG);
    let (secret1, public1) = provider.generate_keypair(&mut rng);
    let (secret2, public2) = provider.generate_keypair(&mut rng);
    assert_ne!(&public1.0[..], &public2.0[..]);

    // Both sides agree on the DHKey.
    let shared1 = secret1.agree(&public2).unwrap();
    let shared2 = secret2.agree(&public1).unwrap();
    assert_eq!(shared1.0, shared2.0);

    // The point at infinity is an invalid public key.
    let infty = PublicKey([0; 64]);
    let (secret, _) = provider.generate_keypair(&mut Rng(RNG));
    assert!(secret.agree(&infty).is_err());

    // Malicious public key not on the curve
    // (from https://web-in-security.blogspot.com/2015/09/practical-invalid-curve-attacks.html).
    let x = [
        0xb7, 0x0b, 0xf0, 0x43, 0xc1, 0x44, 0x93, 0x57, 0x56, 0xf8, 0xf4, 0x57, 0x8c, 0x36, 0x9c,
        0xf9, 0x60, 0xee, 0x51, 0x0a, 0x5a, 0x0f, 0x90, 0xe9, 0x3a, 0x37, 0x3a, 0x21, 0xf0, 0xd1,
        0x39, 0x7f,
    ];
    let y = [
        0x4a, 0x2e, 0x0d, 0xed, 0x57, 0xa5, 0x15, 0x6b, 0xb8, 0x2e, 0xb4, 0x31, 0x4c, 0x37, 0xfd,
        0x41, 0x55, 0x39, 0x5a, 0x7e, 0x51, 0x98, 0x8a, 0xf2, 0x89, 0xcc, 0xe5, 0x31, 0xb9, 0xc1,
        0x71, 0x92,
    ];
    let mut key = [0; 64];
    key[..32].copy_from_slice(&x);
    key[32..].copy_from_slice(&y);

    let (secret, _) = provider.generate_keypair(&mut Rng(RNG));
    assert!(secret.agree(&PublicKey(key)).is_err());
}
