use std::collections::HashMap;
use std::sync::Mutex;

use crate::{Credential, CredentialNeed, DetectionOutcome, Passphrase};

/// Read-only view of the host's passphrase cache. The core never writes to
/// it; caching a freshly prompted passphrase is the host's responsibility.
pub trait PassphraseCache {
    fn lookup(&self, need: &CredentialNeed) -> Option<Passphrase>;
}

/// What the resolver concluded about the credential for a detected mode.
#[derive(Debug)]
pub enum Resolution {
    /// A cached credential satisfies the request.
    Ready(Credential),
    /// The host must supply a passphrase for this requirement.
    NeedsPassphrase(CredentialNeed),
    /// No credential is required (signed-only input).
    NotNeeded,
}

/// Determines which credential a detected input needs, consulting the cache.
/// Key material itself is never touched here; the executor retrieves it via
/// the resolved identifier.
pub fn resolve(outcome: &DetectionOutcome, cache: &dyn PassphraseCache) -> Resolution {
    match outcome {
        DetectionOutcome::Asymmetric(key_id) => {
            let need = CredentialNeed::Key(key_id.clone());
            match cache.lookup(&need) {
                Some(passphrase) => Resolution::Ready(Credential::KeySecret {
                    key_id: key_id.clone(),
                    passphrase,
                }),
                None => Resolution::NeedsPassphrase(need),
            }
        }
        DetectionOutcome::Symmetric => match cache.lookup(&CredentialNeed::Symmetric) {
            Some(passphrase) => Resolution::Ready(Credential::SymmetricPassphrase(passphrase)),
            None => Resolution::NeedsPassphrase(CredentialNeed::Symmetric),
        },
        DetectionOutcome::SignedOnly => Resolution::NotNeeded,
        // The orchestrator fails the request before resolution.
        DetectionOutcome::Undetectable => Resolution::NotNeeded,
    }
}

/// Simple session-scoped cache for hosts that have no dedicated cache
/// service. Interior mutability so the host can insert after a prompt while
/// the core holds the read-only trait view.
#[derive(Default)]
pub struct MemoryPassphraseCache {
    entries: Mutex<HashMap<CredentialNeed, Passphrase>>,
}

impl MemoryPassphraseCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, need: CredentialNeed, passphrase: Passphrase) {
        self.entries
            .lock()
            .expect("passphrase cache lock poisoned")
            .insert(need, passphrase);
    }
}

impl PassphraseCache for MemoryPassphraseCache {
    fn lookup(&self, need: &CredentialNeed) -> Option<Passphrase> {
        self.entries
            .lock()
            .expect("passphrase cache lock poisoned")
            .get(need)
            .cloned()
    }
}
