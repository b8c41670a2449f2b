use unseal_core::{
    Credential, DecryptEngine, DecryptError, DecryptOutcome, DetectionOutcome, OpenedSource,
    ResolvedTarget,
};

use crate::keyring::Keyring;

/// The sequoia-backed engine driven by the orchestrator.
pub struct NativeEngine {
    keyring: Keyring,
}

impl NativeEngine {
    pub fn new(keyring: Keyring) -> Self {
        NativeEngine { keyring }
    }

    /// Engine over the default home-directory keyring.
    pub fn open_default() -> Result<Self, DecryptError> {
        Ok(NativeEngine::new(Keyring::open_default()?))
    }

    pub fn keyring(&self) -> &Keyring {
        &self.keyring
    }

    pub fn keyring_mut(&mut self) -> &mut Keyring {
        &mut self.keyring
    }
}

impl DecryptEngine for NativeEngine {
    fn detect(&self, source: &mut OpenedSource) -> Result<DetectionOutcome, DecryptError> {
        crate::detect::detect(&self.keyring, source)
    }

    fn execute(
        &self,
        source: OpenedSource,
        detection: &DetectionOutcome,
        credential: Option<&Credential>,
        binary_output: bool,
        target: &ResolvedTarget,
    ) -> Result<DecryptOutcome, DecryptError> {
        crate::execute::execute(
            &self.keyring,
            source,
            detection,
            credential,
            binary_output,
            target,
        )
    }
}
