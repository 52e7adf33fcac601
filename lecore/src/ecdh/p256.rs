use {
    super::{EcdhProvider, InvalidPublicKey, PublicKey, SecretKey, SharedSecret},
    p256::{ecdh::EphemeralSecret, elliptic_curve::sec1::ToEncodedPoint},
    rand_core::{CryptoRng, RngCore},
};

/// An `EcdhProvider` using the pure-Rust `p256` crate.
#[derive(Debug, Default)]
pub struct P256Provider {
    _p: (),
}

impl P256Provider {
    pub fn new() -> Self {
        Self { _p: () }
    }
}

impl EcdhProvider for P256Provider {
    type SecretKey = P256SecretKey;

    fn generate_keypair<R>(&mut self, rng: &mut R) -> (Self::SecretKey, PublicKey)
    where
        R: RngCore + CryptoRng,
    {
        let secret = EphemeralSecret::random(rng);
        let point = secret.public_key().to_encoded_point(false);

        // Uncompressed SEC1 encoding is `0x04 || X || Y`.
        let mut public = [0; 64];
        public.copy_from_slice(&point.as_bytes()[1..]);

        (P256SecretKey(secret), PublicKey(public))
    }
}

/// A P-256 secret key produced by [`P256Provider`].
///
/// [`P256Provider`]: struct.P256Provider.html
pub struct P256SecretKey(EphemeralSecret);

impl SecretKey for P256SecretKey {
    fn agree(self, foreign_key: &PublicKey) -> Result<SharedSecret, InvalidPublicKey> {
        let mut encoded = [0; 65];
        encoded[0] = 0x04;
        encoded[1..].copy_from_slice(&foreign_key.0);

        // Rejects the identity and points that aren't on the curve.
        let public = p256::PublicKey::from_sec1_bytes(&encoded)
            .map_err(|_| InvalidPublicKey::new())?;

        let shared = self.0.diffie_hellman(&public);
        let mut secret = [0; 32];
        secret.copy_from_slice(shared.raw_secret_bytes());
        Ok(SharedSecret(secret))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn testsuite() {
        super::super::run_tests(P256Provider::new());
    }
}
