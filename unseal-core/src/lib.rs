use std::fmt;
use std::path::PathBuf;

use zeroize::Zeroizing;

mod classify;
mod orchestrate;
mod resolve;
mod source;

pub use classify::classify;
pub use orchestrate::{
    HostPrompt, Orchestrator, PendingCredential, PendingOutput, Progress, default_output_guess,
};
pub use resolve::{MemoryPassphraseCache, PassphraseCache, Resolution, resolve};
pub use source::{OpenedSource, PROBE_WINDOW_LIMIT, Probe, SourceReader};

/// Sanitizes untrusted text for display in a terminal.
///
/// OpenPGP User IDs are attacker-controlled and may contain control
/// characters or ANSI escape sequences. This function ensures terminal output
/// cannot be manipulated by stripping/escaping control bytes.
pub fn sanitize_for_terminal(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '\n' | '\r' | '\t' => out.push(' '),
            c if c.is_control() => {
                // ASCII-only escape to make the presence of a control char obvious.
                let code = c as u32;
                if code <= 0xFF {
                    out.push_str("\\x");
                    out.push_str(&format!("{:02X}", code));
                } else {
                    out.push_str("\\u{");
                    out.push_str(&format!("{:X}", code));
                    out.push('}');
                }
            }
            c => out.push(c),
        }
    }
    out
}

/// Opaque key identifier: uppercase hex of an OpenPGP fingerprint or key ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyId(pub String);

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A passphrase held in memory. Zeroed on drop; never printed by `Debug`.
#[derive(Clone)]
pub struct Passphrase(Zeroizing<String>);

impl Passphrase {
    pub fn new(secret: impl Into<String>) -> Self {
        Passphrase(Zeroizing::new(secret.into()))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passphrase(..)")
    }
}

/// Where the ciphertext comes from. Immutable once constructed for a request.
pub enum InputSource {
    Bytes(Vec<u8>),
    FilePath(PathBuf),
    /// An opaque stream handle obtained from the host. Consumed exactly once;
    /// cannot be reopened for a credential retry.
    Reader(Box<dyn std::io::Read + Send + Sync>),
}

impl fmt::Debug for InputSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputSource::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            InputSource::FilePath(path) => f.debug_tuple("FilePath").field(path).finish(),
            InputSource::Reader(_) => f.write_str("Reader(..)"),
        }
    }
}

/// What the encryption-mode probe concluded about an input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectionOutcome {
    /// Public-key encrypted to a locally-held secret key.
    Asymmetric(KeyId),
    /// Passphrase encrypted.
    Symmetric,
    /// Cleartext-signed, not encrypted; verification needs no credential.
    SignedOnly,
    /// No known encryption envelope.
    Undetectable,
}

/// The credential the resolver determined is required.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CredentialNeed {
    Key(KeyId),
    Symmetric,
}

/// A resolved credential, scoped to a single decrypt call.
#[derive(Clone)]
pub enum Credential {
    KeySecret {
        key_id: KeyId,
        passphrase: Passphrase,
    },
    SymmetricPassphrase(Passphrase),
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::KeySecret { key_id, .. } => {
                f.debug_struct("KeySecret").field("key_id", key_id).finish_non_exhaustive()
            }
            Credential::SymmetricPassphrase(_) => f.write_str("SymmetricPassphrase(..)"),
        }
    }
}

/// Desired form of the decrypted output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecryptTarget {
    /// Return the plaintext as text (or bytes with `binary_output`).
    Message,
    /// Write the plaintext to a file. With `output: None` the orchestrator
    /// asks the host for a path, offering a guess derived from the input name.
    File { output: Option<PathBuf> },
    /// Return the plaintext as a byte buffer.
    Stream,
}

/// A decrypt target with the output path settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedTarget {
    Message,
    File(PathBuf),
    Stream,
}

/// One user-initiated decrypt action. Constructed once, consumed by
/// [`Orchestrator::begin`].
#[derive(Debug)]
pub struct DecryptRequest {
    pub source: InputSource,
    pub binary_output: bool,
    pub target: DecryptTarget,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plaintext {
    Text(String),
    Bytes(Vec<u8>),
    FileWritten(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptOutcome {
    pub plaintext: Plaintext,
    /// `None` when the message carried no signature at all.
    pub signature: Option<SignatureResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureStatus {
    /// Signature verifies and the signer's key is locally certified.
    Valid,
    /// Signature verifies but the signer's key is not certified.
    ValidUncertified,
    /// The signer's key is not in the local keyring.
    UnknownSigner,
    /// Signature present but cryptographically invalid.
    Invalid,
    NoSignature,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureResult {
    pub status: SignatureStatus,
    pub signer_key_id: Option<KeyId>,
    pub signer_user_id: Option<String>,
}

/// Raw verification outcome as reported by the OpenPGP library, before
/// classification. Captured at the engine boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawVerification {
    Unsigned,
    Good {
        key_id: KeyId,
        user_id: Option<String>,
        certified: bool,
    },
    MissingKey {
        key_id: KeyId,
    },
    Bad {
        key_id: Option<KeyId>,
    },
}

/// Error taxonomy for the whole decrypt-verify pipeline. Every component
/// returns one of these; none is retried automatically.
#[derive(Debug)]
pub enum DecryptError {
    /// Input path does not resolve to a regular file.
    NotFound(String),
    /// The backing medium is not currently accessible.
    StorageUnavailable(String),
    /// Unparseable OpenPGP packets.
    Malformed(String),
    /// No known encryption envelope was found.
    Undetectable,
    /// Asymmetrically encrypted, but to no locally-held secret key.
    NoSecretKey,
    /// Decryption authentication failed: wrong passphrase or key.
    WrongCredential,
    /// Authenticated decryption failed structurally (tampered ciphertext).
    CorruptInput(String),
    /// The output destination is not writable.
    WriteFailed(String),
    /// The host dismissed a credential or output-path prompt.
    Cancelled,
    /// Out-of-taxonomy condition; surfaced rather than discarded.
    Internal(String),
}

impl fmt::Display for DecryptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecryptError::NotFound(what) => write!(f, "not found: {what}"),
            DecryptError::StorageUnavailable(what) => write!(f, "storage unavailable: {what}"),
            DecryptError::Malformed(what) => write!(f, "malformed input: {what}"),
            DecryptError::Undetectable => write!(f, "no known encryption found"),
            DecryptError::NoSecretKey => write!(f, "no matching secret key found"),
            DecryptError::WrongCredential => write!(f, "wrong passphrase or key"),
            DecryptError::CorruptInput(what) => write!(f, "corrupt input: {what}"),
            DecryptError::WriteFailed(what) => write!(f, "write failed: {what}"),
            DecryptError::Cancelled => write!(f, "cancelled"),
            DecryptError::Internal(what) => write!(f, "internal error: {what}"),
        }
    }
}

impl std::error::Error for DecryptError {}

/// The engine that actually inspects and decrypts OpenPGP data. Implemented
/// by `unseal-pgp`; the orchestrator drives it through this seam.
pub trait DecryptEngine {
    /// Probes the opened source for its encryption mode. Must only consume
    /// bytes through [`OpenedSource::probe`] so the executor later sees the
    /// stream byte-for-byte from the start.
    fn detect(&self, source: &mut OpenedSource) -> Result<DetectionOutcome, DecryptError>;

    /// Decrypts (and verifies, if signed) the source. Called exactly once per
    /// request; `credential` is `None` only for signed-only inputs.
    fn execute(
        &self,
        source: OpenedSource,
        detection: &DetectionOutcome,
        credential: Option<&Credential>,
        binary_output: bool,
        target: &ResolvedTarget,
    ) -> Result<DecryptOutcome, DecryptError>;
}
