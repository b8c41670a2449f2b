use std::fs;
use std::io::{self, Read};

use openpgp::Cert;
use openpgp::KeyHandle;
use openpgp::cert::amalgamation::ValidAmalgamation;
use openpgp::crypto::{Password, SessionKey};
use openpgp::packet::{PKESK, SKESK, Signature};
use openpgp::parse::Parse;
use openpgp::parse::stream::{
    DecryptionHelper, DecryptorBuilder, MessageLayer, MessageStructure, VerificationError,
    VerificationHelper, VerifierBuilder,
};
use openpgp::policy::StandardPolicy;
use openpgp::types::SymmetricAlgorithm;
use sequoia_openpgp as openpgp;
use unseal_core::{
    Credential, DecryptError, DecryptOutcome, DetectionOutcome, KeyId, OpenedSource, Plaintext,
    RawVerification, ResolvedTarget, SignatureResult, classify,
};

use crate::keyring::Keyring;

/// Decrypts the source with the resolved credential and, when the plaintext
/// carries a signature, verifies it against the keyring. Runs exactly once
/// per request; every failure is surfaced verbatim, never retried here.
pub fn execute(
    keyring: &Keyring,
    source: OpenedSource,
    detection: &DetectionOutcome,
    credential: Option<&Credential>,
    binary_output: bool,
    target: &ResolvedTarget,
) -> Result<DecryptOutcome, DecryptError> {
    match detection {
        DetectionOutcome::SignedOnly => verify_signed_only(keyring, source, binary_output, target),
        _ => decrypt_and_verify(keyring, source, credential, binary_output, target),
    }
}

fn decrypt_and_verify(
    keyring: &Keyring,
    source: OpenedSource,
    credential: Option<&Credential>,
    binary_output: bool,
    target: &ResolvedTarget,
) -> Result<DecryptOutcome, DecryptError> {
    let credential = credential.ok_or_else(|| {
        DecryptError::Internal("credential required for encrypted input".to_string())
    })?;
    let helper = EngineHelper::with_credential(keyring, credential);
    let p = &StandardPolicy::new();
    let mut decryptor = match DecryptorBuilder::from_reader(source.into_reader())
        .map_err(|err| DecryptError::Malformed(format!("parse failed: {err}")))?
        .with_policy(p, None, helper)
    {
        Ok(decryptor) => decryptor,
        Err(err) => return Err(map_decrypt_failure(&err)),
    };

    let mut plaintext = Vec::new();
    if let Err(err) = decryptor.read_to_end(&mut plaintext) {
        return Err(map_read_failure(&err));
    }
    let raw = decryptor.into_helper().into_raw();
    deliver(plaintext, raw, binary_output, target)
}

fn verify_signed_only(
    keyring: &Keyring,
    source: OpenedSource,
    binary_output: bool,
    target: &ResolvedTarget,
) -> Result<DecryptOutcome, DecryptError> {
    let helper = EngineHelper::verify_only(keyring);
    let p = &StandardPolicy::new();
    let mut verifier = VerifierBuilder::from_reader(source.into_reader())
        .map_err(|err| DecryptError::Malformed(format!("parse failed: {err}")))?
        .with_policy(p, None, helper)
        .map_err(|err| DecryptError::Malformed(format!("verifier failed: {err}")))?;

    // A signature that fails to validate can abort the read; the verdict
    // still comes from the captured verification state.
    let mut content = Vec::new();
    let read_ok = verifier.read_to_end(&mut content).is_ok();
    let raw = verifier.into_helper().into_raw();
    if !read_ok && matches!(raw, RawVerification::Unsigned) {
        return Err(DecryptError::Malformed(
            "cleartext signature could not be processed".to_string(),
        ));
    }
    deliver(content, raw, binary_output, target)
}

fn deliver(
    plaintext: Vec<u8>,
    raw: RawVerification,
    binary_output: bool,
    target: &ResolvedTarget,
) -> Result<DecryptOutcome, DecryptError> {
    let signature: Option<SignatureResult> = match raw {
        RawVerification::Unsigned => None,
        other => Some(classify(other)),
    };
    let plaintext = match target {
        ResolvedTarget::File(path) => {
            fs::write(path, &plaintext).map_err(|err| {
                DecryptError::WriteFailed(format!("{}: {err}", path.display()))
            })?;
            Plaintext::FileWritten(path.clone())
        }
        ResolvedTarget::Message if !binary_output => {
            Plaintext::Text(String::from_utf8_lossy(&plaintext).into_owned())
        }
        ResolvedTarget::Message | ResolvedTarget::Stream => Plaintext::Bytes(plaintext),
    };
    Ok(DecryptOutcome { plaintext, signature })
}

fn map_decrypt_failure(err: &anyhow::Error) -> DecryptError {
    match err.downcast_ref::<openpgp::Error>() {
        Some(openpgp::Error::MissingSessionKey(_)) => DecryptError::WrongCredential,
        Some(openpgp::Error::ManipulatedMessage) => {
            DecryptError::CorruptInput("manipulated message".to_string())
        }
        Some(openpgp::Error::MalformedMessage(msg)) => DecryptError::Malformed(msg.clone()),
        Some(openpgp::Error::MalformedPacket(msg)) => DecryptError::Malformed(msg.clone()),
        _ => DecryptError::CorruptInput(format!("decryption failed: {err}")),
    }
}

fn map_read_failure(err: &io::Error) -> DecryptError {
    match openpgp_error_in_io_chain(err) {
        Some(openpgp::Error::MissingSessionKey(_)) => DecryptError::WrongCredential,
        Some(openpgp::Error::ManipulatedMessage) => {
            DecryptError::CorruptInput("manipulated message".to_string())
        }
        Some(openpgp::Error::MalformedMessage(msg)) => DecryptError::Malformed(msg.clone()),
        Some(openpgp::Error::MalformedPacket(msg)) => DecryptError::Malformed(msg.clone()),
        Some(other) => DecryptError::CorruptInput(format!("decryption failed: {other}")),
        None => DecryptError::StorageUnavailable(format!("read failed: {err}")),
    }
}

fn openpgp_error_in_io_chain(err: &io::Error) -> Option<&openpgp::Error> {
    let mut cur: Option<&(dyn std::error::Error + 'static)> = err
        .get_ref()
        .map(|e| e as &(dyn std::error::Error + 'static));
    while let Some(e) = cur {
        if let Some(inner) = e.downcast_ref::<openpgp::Error>() {
            return Some(inner);
        }
        cur = e.source();
    }
    None
}

/// Supplies key material to the decryptor and captures the raw verification
/// outcome for the classifier.
struct EngineHelper<'k> {
    keyring: &'k Keyring,
    key_passphrase: Option<Password>,
    symmetric_passphrase: Option<Password>,
    good: Option<(KeyId, Option<String>, bool)>,
    missing: Option<KeyId>,
    saw_signature: bool,
}

impl<'k> EngineHelper<'k> {
    fn with_credential(keyring: &'k Keyring, credential: &Credential) -> Self {
        let (key_passphrase, symmetric_passphrase) = match credential {
            Credential::KeySecret { passphrase, .. } => {
                (Some(Password::from(passphrase.expose())), None)
            }
            Credential::SymmetricPassphrase(passphrase) => {
                (None, Some(Password::from(passphrase.expose())))
            }
        };
        EngineHelper {
            keyring,
            key_passphrase,
            symmetric_passphrase,
            good: None,
            missing: None,
            saw_signature: false,
        }
    }

    fn verify_only(keyring: &'k Keyring) -> Self {
        EngineHelper {
            keyring,
            key_passphrase: None,
            symmetric_passphrase: None,
            good: None,
            missing: None,
            saw_signature: false,
        }
    }

    fn into_raw(self) -> RawVerification {
        if let Some((key_id, user_id, certified)) = self.good {
            RawVerification::Good {
                key_id,
                user_id,
                certified,
            }
        } else if let Some(key_id) = self.missing {
            RawVerification::MissingKey { key_id }
        } else if self.saw_signature {
            RawVerification::Bad { key_id: None }
        } else {
            RawVerification::Unsigned
        }
    }
}

impl VerificationHelper for EngineHelper<'_> {
    fn get_certs(&mut self, ids: &[KeyHandle]) -> openpgp::Result<Vec<Cert>> {
        Ok(self.keyring.certs_for(ids))
    }

    fn check(&mut self, structure: MessageStructure) -> openpgp::Result<()> {
        for layer in structure.iter() {
            if let MessageLayer::SignatureGroup { results } = layer {
                for result in results {
                    self.saw_signature = true;
                    match result {
                        Ok(good) => {
                            let cert = good.ka.cert();
                            let fingerprint = cert.fingerprint();
                            let user_id = good
                                .ka
                                .valid_cert()
                                .primary_userid()
                                .ok()
                                .map(|uid| uid.userid().to_string())
                                .or_else(|| {
                                    cert.userids().next().map(|uid| uid.userid().to_string())
                                });
                            if self.good.is_none() {
                                let certified = self.keyring.is_certified(&fingerprint);
                                self.good =
                                    Some((KeyId(fingerprint.to_hex()), user_id, certified));
                            }
                        }
                        Err(VerificationError::MissingKey { sig }) => {
                            if self.missing.is_none() {
                                self.missing = sig_issuer(sig);
                            }
                        }
                        Err(_) => {}
                    }
                }
            }
        }
        // Never fail the stream here: the plaintext is still delivered and
        // the classifier decides how the signature state is presented.
        Ok(())
    }
}

impl DecryptionHelper for EngineHelper<'_> {
    fn decrypt(
        &mut self,
        pkesks: &[PKESK],
        skesks: &[SKESK],
        sym_algo: Option<SymmetricAlgorithm>,
        decrypt: &mut dyn FnMut(Option<SymmetricAlgorithm>, &SessionKey) -> bool,
    ) -> openpgp::Result<Option<Cert>> {
        if let Some(password) = &self.symmetric_passphrase {
            for skesk in skesks {
                if let Ok((algo, sk)) = skesk.decrypt(password)
                    && decrypt(algo, &sk)
                {
                    return Ok(None);
                }
            }
            // Wrong passphrase: report no session key and let the caller map
            // the resulting failure to WrongCredential.
            return Ok(None);
        }

        let policy = StandardPolicy::new();
        for pkesk in pkesks {
            for cert in self.keyring.certs().iter().filter(|cert| cert.is_tsk()) {
                for key in cert
                    .keys()
                    .secret()
                    .with_policy(&policy, None)
                    .supported()
                    .alive()
                    .revoked(false)
                    .for_transport_encryption()
                {
                    let mut key = key.key().clone();
                    if key.secret().is_encrypted() {
                        let passphrase = match self.key_passphrase.as_ref() {
                            Some(passphrase) => passphrase,
                            None => continue,
                        };
                        match key.decrypt_secret(passphrase) {
                            Ok(decrypted) => key = decrypted,
                            Err(_) => continue,
                        }
                    }
                    let mut keypair = key.into_keypair()?;
                    if let Some((algo, sk)) = pkesk.decrypt(&mut keypair, sym_algo)
                        && decrypt(algo, &sk)
                    {
                        return Ok(Some(cert.clone()));
                    }
                }
            }
        }
        Ok(None)
    }
}

fn sig_issuer(sig: &Signature) -> Option<KeyId> {
    sig.get_issuers()
        .into_iter()
        .next()
        .map(|handle| KeyId(key_handle_hex(&handle)))
}

fn key_handle_hex(handle: &KeyHandle) -> String {
    match handle {
        KeyHandle::Fingerprint(fingerprint) => fingerprint.to_hex(),
        KeyHandle::KeyID(key_id) => key_id.to_hex(),
    }
}
