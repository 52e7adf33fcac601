use {
    super::{EcdhProvider, InvalidPublicKey, PublicKey, SecretKey, SharedSecret},
    crate::Error,
    rand_core::{CryptoRng, RngCore},
};

/// A key agreement operation waiting for background time.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EcdhRequest {
    /// Generate a fresh local key pair, replacing any previous one.
    GenerateKeypair,

    /// Compute the DHKey from the peer's public key and the local secret key.
    ///
    /// This uses up the local key pair whatever the outcome. HCI's LE Generate DHKey keeps using
    /// the current key, so a host driving several pairings from one key pair has to request a
    /// new pair (`GenerateKeypair`) before every DHKey.
    GenerateDhKey(PublicKey),
}

/// Result of a completed [`EcdhRequest`].
///
/// [`EcdhRequest`]: enum.EcdhRequest.html
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EcdhOutcome {
    /// A new key pair was generated. Only the public half leaves the controller.
    Keypair(PublicKey),

    /// The DHKey was computed.
    DhKey(SharedSecret),

    /// The peer's public key was rejected.
    InvalidPeerKey(InvalidPublicKey),

    /// A DHKey was requested without a local key pair.
    NoLocalKey,
}

/// Deferred P-256 key agreement.
///
/// At most one request is outstanding. [`submit`] only records it; the curve arithmetic runs in
/// [`run`], which the controller calls from its background entry point.
///
/// [`submit`]: #method.submit
/// [`run`]: #method.run
pub struct KeyAgreement<P: EcdhProvider> {
    provider: P,
    secret: Option<P::SecretKey>,
    pending: Option<EcdhRequest>,
}

impl<P: EcdhProvider> KeyAgreement<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            secret: None,
            pending: None,
        }
    }

    /// Queues `request`. Fails with `InvalidState` if another one is still waiting.
    pub fn submit(&mut self, request: EcdhRequest) -> Result<(), Error> {
        if self.pending.is_some() {
            return Err(Error::InvalidState);
        }
        self.pending = Some(request);
        Ok(())
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Returns whether a local key pair exists for a DHKey computation.
    pub fn has_keypair(&self) -> bool {
        self.secret.is_some()
    }

    /// Executes the pending request, if any.
    ///
    /// The local secret key is single use. `SecretKey::agree` takes it by value, so every
    /// DHKey attempt consumes it, including one rejected for an invalid peer key. Later DHKey
    /// requests report `NoLocalKey` until a new key pair is generated.
    pub fn run<R>(&mut self, rng: &mut R) -> Option<EcdhOutcome>
    where
        R: RngCore + CryptoRng,
    {
        let request = self.pending.take()?;
        let outcome = match request {
            EcdhRequest::GenerateKeypair => {
                let (secret, public) = self.provider.generate_keypair(rng);
                self.secret = Some(secret);
                EcdhOutcome::Keypair(public)
            }
            EcdhRequest::GenerateDhKey(peer) => match self.secret.take() {
                Some(secret) => match secret.agree(&peer) {
                    Ok(shared) => EcdhOutcome::DhKey(shared),
                    Err(e) => EcdhOutcome::InvalidPeerKey(e),
                },
                None => EcdhOutcome::NoLocalKey,
            },
        };
        Some(outcome)
    }
}
