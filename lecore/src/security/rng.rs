//! Random number sourcing.
//!
//! Anything security relevant (session key diversifiers, IVs, access addresses, ECDH secrets,
//! `LE Rand`) comes from [`RandomSource::key_material`], which only ever returns bytes derived
//! from the [`Trng`]: directly, or through a [`Drbg`] seeded and periodically reseeded from it.
//! If neither is available the request fails with [`Error::EntropyUnavailable`] rather than
//! degrading to a weaker generator.
//!
//! Timing jitter (advertising delay, scheduler tie breaks) uses [`RandomSource::jitter`], a
//! cheap xorshift generator that is allowed to be predictable.
//!
//! [`Error::EntropyUnavailable`]: ../../enum.Error.html#variant.EntropyUnavailable

use {
    crate::Error,
    rand_core::{CryptoRng, RngCore},
    sha2::{Digest, Sha256},
};

/// A hardware true random number generator.
pub trait Trng {
    /// Fills `dest` with entropy.
    ///
    /// Returns `Error::EntropyUnavailable` if the hardware can't currently deliver `dest.len()`
    /// bytes (eg. because its pool is drained).
    fn fill(&mut self, dest: &mut [u8]) -> Result<(), Error>;
}

impl<T: Trng + ?Sized> Trng for &'_ mut T {
    fn fill(&mut self, dest: &mut [u8]) -> Result<(), Error> {
        (**self).fill(dest)
    }
}

/// Size of the seed taken from the TRNG.
pub const SEED_SIZE: usize = 32;

/// Number of generate requests between mandatory reseeds.
pub const RESEED_INTERVAL: u32 = 1 << 16;

/// Deterministic random bit generator in the style of `Hash_DRBG` (NIST SP 800-90A) over
/// SHA-256.
///
/// Output block `i` of a request is `SHA-256(V || i)`. After every request the state is
/// advanced with `V = SHA-256(0x03 || V || C || reseed_counter)`, so earlier output can't be
/// recovered from a compromised state.
pub struct Drbg {
    v: [u8; 32],
    c: [u8; 32],
    reseed_counter: u32,
}

impl Drbg {
    /// Instantiates the generator from a seed.
    pub fn new(seed: &[u8; SEED_SIZE]) -> Self {
        let mut drbg = Self {
            v: [0; 32],
            c: [0; 32],
            reseed_counter: 0,
        };
        drbg.reseed(seed);
        drbg
    }

    /// Mixes fresh entropy into the state and resets the reseed counter.
    pub fn reseed(&mut self, seed: &[u8; SEED_SIZE]) {
        let v: [u8; 32] = Sha256::new()
            .chain_update([0x01u8])
            .chain_update(self.v)
            .chain_update(seed)
            .finalize()
            .into();
        self.c = Sha256::new()
            .chain_update([0x00u8])
            .chain_update(v)
            .finalize()
            .into();
        self.v = v;
        self.reseed_counter = 1;
    }

    /// Returns whether the generator must be reseeded before the next request.
    pub fn needs_reseed(&self) -> bool {
        self.reseed_counter >= RESEED_INTERVAL
    }

    /// Fills `dest` with output and advances the state.
    pub fn generate(&mut self, dest: &mut [u8]) {
        for (i, chunk) in dest.chunks_mut(32).enumerate() {
            let block: [u8; 32] = Sha256::new()
                .chain_update(self.v)
                .chain_update((i as u32).to_le_bytes())
                .finalize()
                .into();
            chunk.copy_from_slice(&block[..chunk.len()]);
        }

        self.v = Sha256::new()
            .chain_update([0x03u8])
            .chain_update(self.v)
            .chain_update(self.c)
            .chain_update(self.reseed_counter.to_le_bytes())
            .finalize()
            .into();
        self.reseed_counter = self.reseed_counter.saturating_add(1);
    }
}

impl RngCore for Drbg {
    fn next_u32(&mut self) -> u32 {
        rand_core::impls::next_u32_via_fill(self)
    }

    fn next_u64(&mut self) -> u64 {
        rand_core::impls::next_u64_via_fill(self)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.generate(dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
        self.generate(dest);
        Ok(())
    }
}

impl CryptoRng for Drbg {}

/// Xorshift32 PRNG for non-security-relevant jitter.
#[derive(Debug, Clone)]
pub struct XorShift32(u32);

impl XorShift32 {
    pub fn new(seed: u32) -> Self {
        // State must never be 0.
        XorShift32(if seed == 0 { 0x9E37_79B9 } else { seed })
    }

    pub fn next_u32(&mut self) -> u32 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        x
    }
}

/// The controller's random number front end.
pub struct RandomSource<T: Trng> {
    trng: T,
    drbg: Option<Drbg>,
    jitter: XorShift32,
}

impl<T: Trng> RandomSource<T> {
    /// Creates a random source and seeds the jitter generator from the TRNG if it can.
    pub fn new(mut trng: T) -> Self {
        let mut seed = [0; 4];
        let jitter_seed = match trng.fill(&mut seed) {
            Ok(()) => u32::from_le_bytes(seed),
            Err(_) => 0,
        };
        Self {
            trng,
            drbg: None,
            jitter: XorShift32::new(jitter_seed),
        }
    }

    /// Fills `dest` with cryptographically secure random bytes.
    ///
    /// Tries the TRNG first. If it is drained, falls back to the DRBG, reseeding it from the TRNG
    /// when it is due and the TRNG allows. Fails if the DRBG was never seeded, or is due for a
    /// reseed that can't happen.
    pub fn key_material(&mut self, dest: &mut [u8]) -> Result<(), Error> {
        if self.trng.fill(dest).is_ok() {
            // Opportunistically keep the DRBG topped up while entropy is plentiful.
            if self.drbg.as_ref().map_or(true, Drbg::needs_reseed) {
                let _ = self.seed_drbg();
            }
            return Ok(());
        }

        if self.drbg.as_ref().map_or(true, Drbg::needs_reseed) {
            self.seed_drbg()?;
        }
        match &mut self.drbg {
            Some(drbg) => {
                drbg.generate(dest);
                Ok(())
            }
            None => Err(Error::EntropyUnavailable),
        }
    }

    /// Returns a secure random array, eg. for `SKD` or IV halves.
    pub fn key_bytes<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let mut bytes = [0; N];
        self.key_material(&mut bytes)?;
        Ok(bytes)
    }

    /// Feeds additional entropy (eg. timer jitter sampled by the platform) into the DRBG.
    ///
    /// Instantiates the DRBG if it doesn't exist yet.
    pub fn add_entropy(&mut self, seed: &[u8; SEED_SIZE]) {
        match &mut self.drbg {
            Some(drbg) => drbg.reseed(seed),
            None => self.drbg = Some(Drbg::new(seed)),
        }
    }

    fn seed_drbg(&mut self) -> Result<(), Error> {
        let mut seed = [0; SEED_SIZE];
        self.trng.fill(&mut seed)?;
        self.add_entropy(&seed);
        Ok(())
    }

    /// Returns a non-cryptographic random number for timing jitter.
    pub fn jitter(&mut self) -> u32 {
        self.jitter.next_u32()
    }

    /// Runs `f` with an `RngCore + CryptoRng` view of the secure source.
    ///
    /// The view draws from the DRBG, which is (re)seeded from the TRNG first. Fails if it can't
    /// be seeded.
    pub fn with_crypto_rng<R>(
        &mut self,
        f: impl FnOnce(&mut Drbg) -> R,
    ) -> Result<R, Error> {
        if self.drbg.as_ref().map_or(true, Drbg::needs_reseed) {
            self.seed_drbg()?;
        } else {
            // Fresh entropy per use if available, without requiring it.
            let _ = self.seed_drbg();
        }
        match &mut self.drbg {
            Some(drbg) => Ok(f(drbg)),
            None => Err(Error::EntropyUnavailable),
        }
    }

    pub fn trng_mut(&mut self) -> &mut T {
        &mut self.trng
    }
}

/// Entropy sources for tests and simulation.
pub mod testing {
    use super::*;

    /// A deterministic "TRNG" with an optional byte budget, to simulate a drained pool.
    pub struct XorShiftTrng {
        rng: XorShift32,
        budget: Option<usize>,
    }

    impl XorShiftTrng {
        pub fn new(seed: u32) -> Self {
            Self {
                rng: XorShift32::new(seed),
                budget: None,
            }
        }

        /// Limits the number of bytes this source will deliver before failing.
        pub fn with_budget(seed: u32, budget: usize) -> Self {
            Self {
                rng: XorShift32::new(seed),
                budget: Some(budget),
            }
        }

        pub fn refill(&mut self, budget: usize) {
            self.budget = Some(budget);
        }
    }

    impl Trng for XorShiftTrng {
        fn fill(&mut self, dest: &mut [u8]) -> Result<(), Error> {
            if let Some(budget) = &mut self.budget {
                if *budget < dest.len() {
                    return Err(Error::EntropyUnavailable);
                }
                *budget -= dest.len();
            }
            for chunk in dest.chunks_mut(4) {
                let word = self.rng.next_u32().to_le_bytes();
                chunk.copy_from_slice(&word[..chunk.len()]);
            }
            Ok(())
        }
    }

    /// A TRNG that never delivers.
    pub struct NoEntropy;

    impl Trng for NoEntropy {
        fn fill(&mut self, _: &mut [u8]) -> Result<(), Error> {
            Err(Error::EntropyUnavailable)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{testing::*, *};

    #[test]
    fn drbg_is_deterministic_per_seed() {
        let mut a = Drbg::new(&[7; 32]);
        let mut b = Drbg::new(&[7; 32]);
        let mut c = Drbg::new(&[8; 32]);
        let (mut x, mut y, mut z) = ([0; 40], [0; 40], [0; 40]);
        a.generate(&mut x);
        b.generate(&mut y);
        c.generate(&mut z);
        assert_eq!(x[..], y[..]);
        assert_ne!(x[..], z[..]);

        // State advances between requests.
        a.generate(&mut y);
        assert_ne!(x[..], y[..]);
    }

    #[test]
    fn drbg_reseed_interval() {
        let mut drbg = Drbg::new(&[1; 32]);
        let mut out = [0; 4];
        for _ in 1..RESEED_INTERVAL {
            assert!(!drbg.needs_reseed());
            drbg.generate(&mut out);
        }
        assert!(drbg.needs_reseed());
        drbg.reseed(&[2; 32]);
        assert!(!drbg.needs_reseed());
    }

    #[test]
    fn never_falls_back_without_entropy() {
        let mut rng = RandomSource::new(NoEntropy);
        let mut key = [0; 16];
        assert_eq!(rng.key_material(&mut key), Err(Error::EntropyUnavailable));
        assert_eq!(
            rng.with_crypto_rng(|r| r.next_u32()),
            Err(Error::EntropyUnavailable)
        );
        // Jitter still works.
        let a = rng.jitter();
        assert_ne!(a, rng.jitter());
    }

    #[test]
    fn drbg_takes_over_when_trng_drains() {
        // 4 bytes of jitter seed + 16 bytes key + 32 bytes DRBG seed.
        let mut rng = RandomSource::new(XorShiftTrng::with_budget(3, 4 + 16 + 32));
        let first: [u8; 16] = rng.key_bytes().unwrap();
        let second: [u8; 16] = rng.key_bytes().unwrap();
        assert_ne!(first, second);
        assert!(rng.trng_mut().fill(&mut [0]).is_err());
    }

    #[test]
    fn platform_entropy_seeds_drbg() {
        let mut rng = RandomSource::new(NoEntropy);
        rng.add_entropy(&[0x55; 32]);
        let value: [u8; 8] = rng.key_bytes().unwrap();
        assert_ne!(value, [0; 8]);
    }
}
