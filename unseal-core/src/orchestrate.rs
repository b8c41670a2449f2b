use std::path::{Path, PathBuf};

use crate::{
    Credential, CredentialNeed, DecryptEngine, DecryptError, DecryptOutcome, DecryptRequest,
    DecryptTarget, DetectionOutcome, OpenedSource, Passphrase, PassphraseCache, Resolution,
    ResolvedTarget, resolve,
};

/// Sequences one decrypt-verify request:
/// open source -> detect mode -> resolve credential -> execute -> classify.
///
/// The state machine is encoded in consuming types rather than mutable
/// fields: [`Progress`] values are the states, and the pending states own the
/// opened source, so every exit path (including cancellation) releases it.
/// The orchestrator itself is reusable across requests.
pub struct Orchestrator<E> {
    engine: E,
}

impl<E: DecryptEngine> Orchestrator<E> {
    pub fn new(engine: E) -> Self {
        Orchestrator { engine }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Starts a request. Returns either the completed outcome or a suspension
    /// point waiting on the host.
    pub fn begin(
        &self,
        request: DecryptRequest,
        cache: &dyn PassphraseCache,
    ) -> Result<Progress<'_, E>, DecryptError> {
        let DecryptRequest {
            source,
            binary_output,
            target,
        } = request;
        let mut opened = OpenedSource::open(source)?;
        log::debug!("source opened: {opened:?}");
        let detection = self.engine.detect(&mut opened)?;
        log::debug!("mode detected: {detection:?}");
        if detection == DetectionOutcome::Undetectable {
            return Err(DecryptError::Undetectable);
        }
        match resolve(&detection, cache) {
            Resolution::NeedsPassphrase(need) => {
                log::debug!("awaiting credential: {need:?}");
                Ok(Progress::NeedsPassphrase(PendingCredential {
                    engine: &self.engine,
                    opened,
                    detection,
                    need,
                    binary_output,
                    target,
                }))
            }
            Resolution::Ready(credential) => advance(
                &self.engine,
                opened,
                detection,
                Some(credential),
                binary_output,
                target,
            ),
            Resolution::NotNeeded => {
                advance(&self.engine, opened, detection, None, binary_output, target)
            }
        }
    }

    /// Drives a request to completion against a host prompt surface,
    /// including the re-prompt loop on `WrongCredential`. A wrong *cached*
    /// credential is surfaced to the caller instead, so the host can
    /// invalidate its cache entry and start over.
    pub fn run(
        &self,
        request: DecryptRequest,
        cache: &dyn PassphraseCache,
        host: &mut dyn HostPrompt,
    ) -> Result<DecryptOutcome, DecryptError> {
        let mut progress = self.begin(request, cache)?;
        loop {
            match progress {
                Progress::Complete(outcome) => return Ok(outcome),
                Progress::NeedsPassphrase(pending) => {
                    let Some(passphrase) = host.ask_passphrase(pending.requirement()) else {
                        return Err(pending.cancel());
                    };
                    let retry = pending.reopen_point();
                    match pending.supply(passphrase) {
                        Ok(next) => progress = next,
                        Err(DecryptError::WrongCredential) => match retry {
                            Some(point) => {
                                log::warn!("wrong credential; prompting again");
                                progress = Progress::NeedsPassphrase(point);
                            }
                            None => return Err(DecryptError::WrongCredential),
                        },
                        Err(err) => return Err(err),
                    }
                }
                Progress::NeedsOutputPath(pending) => {
                    let Some(path) = host.ask_output_path(pending.default_guess()) else {
                        return Err(pending.cancel());
                    };
                    let retry = pending.reopen_point();
                    match pending.supply(path) {
                        Ok(next) => progress = next,
                        Err(DecryptError::WrongCredential) => match retry {
                            Some(point) => {
                                log::warn!("wrong credential; prompting again");
                                progress = Progress::NeedsPassphrase(point);
                            }
                            None => return Err(DecryptError::WrongCredential),
                        },
                        Err(err) => return Err(err),
                    }
                }
            }
        }
    }
}

/// Host callback surface. Returning `None` from either prompt cancels the
/// request; the orchestrator then fails with `Cancelled` and releases the
/// opened input.
pub trait HostPrompt {
    fn ask_passphrase(&mut self, need: &CredentialNeed) -> Option<Passphrase>;
    fn ask_output_path(&mut self, default_guess: &Path) -> Option<PathBuf>;
}

/// Observable state of an in-flight request.
pub enum Progress<'a, E> {
    Complete(DecryptOutcome),
    NeedsPassphrase(PendingCredential<'a, E>),
    NeedsOutputPath(PendingOutput<'a, E>),
}

impl<E> std::fmt::Debug for Progress<'_, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Progress::Complete(_) => f.write_str("Progress::Complete"),
            Progress::NeedsPassphrase(_) => f.write_str("Progress::NeedsPassphrase"),
            Progress::NeedsOutputPath(_) => f.write_str("Progress::NeedsOutputPath"),
        }
    }
}

/// Suspension point: the request is detected but waiting for a passphrase.
/// Owns the opened source; dropping or cancelling releases it.
pub struct PendingCredential<'a, E> {
    engine: &'a E,
    opened: OpenedSource,
    detection: DetectionOutcome,
    need: CredentialNeed,
    binary_output: bool,
    target: DecryptTarget,
}

impl<'a, E: DecryptEngine> PendingCredential<'a, E> {
    pub fn requirement(&self) -> &CredentialNeed {
        &self.need
    }

    /// Resumes with the host-supplied passphrase. Consumes the pending state;
    /// the execution runs at most once.
    pub fn supply(self, passphrase: Passphrase) -> Result<Progress<'a, E>, DecryptError> {
        let credential = match &self.need {
            CredentialNeed::Key(key_id) => Credential::KeySecret {
                key_id: key_id.clone(),
                passphrase,
            },
            CredentialNeed::Symmetric => Credential::SymmetricPassphrase(passphrase),
        };
        advance(
            self.engine,
            self.opened,
            self.detection,
            Some(credential),
            self.binary_output,
            self.target,
        )
    }

    /// A restart point for re-prompting after `WrongCredential`. Reopens the
    /// input from its origin and reuses the detection outcome, so the retry
    /// skips redundant probing. `None` for opaque streams, which cannot be
    /// consumed twice.
    pub fn reopen_point(&self) -> Option<PendingCredential<'a, E>> {
        if !self.opened.reopenable() {
            return None;
        }
        let opened = self.opened.reopen().ok()?;
        Some(PendingCredential {
            engine: self.engine,
            opened,
            detection: self.detection.clone(),
            need: self.need.clone(),
            binary_output: self.binary_output,
            target: self.target.clone(),
        })
    }

    /// The host dismissed the prompt. Releases the opened input.
    pub fn cancel(self) -> DecryptError {
        log::debug!("credential prompt cancelled; releasing input");
        DecryptError::Cancelled
    }
}

/// Suspension point: credential resolved, but the file target has no output
/// path yet.
pub struct PendingOutput<'a, E> {
    engine: &'a E,
    opened: OpenedSource,
    detection: DetectionOutcome,
    credential: Option<Credential>,
    binary_output: bool,
    default_guess: PathBuf,
}

impl<'a, E: DecryptEngine> PendingOutput<'a, E> {
    pub fn default_guess(&self) -> &Path {
        &self.default_guess
    }

    pub fn supply(self, output: PathBuf) -> Result<Progress<'a, E>, DecryptError> {
        execute(
            self.engine,
            self.opened,
            self.detection,
            self.credential,
            self.binary_output,
            ResolvedTarget::File(output),
        )
    }

    /// Restart point for re-prompting the passphrase; the output path will be
    /// asked for again after the new credential.
    pub fn reopen_point(&self) -> Option<PendingCredential<'a, E>> {
        let need = match &self.detection {
            DetectionOutcome::Asymmetric(key_id) => CredentialNeed::Key(key_id.clone()),
            DetectionOutcome::Symmetric => CredentialNeed::Symmetric,
            _ => return None,
        };
        if !self.opened.reopenable() {
            return None;
        }
        let opened = self.opened.reopen().ok()?;
        Some(PendingCredential {
            engine: self.engine,
            opened,
            detection: self.detection.clone(),
            need,
            binary_output: self.binary_output,
            target: DecryptTarget::File { output: None },
        })
    }

    pub fn cancel(self) -> DecryptError {
        log::debug!("output prompt cancelled; releasing input");
        DecryptError::Cancelled
    }
}

fn advance<'a, E: DecryptEngine>(
    engine: &'a E,
    opened: OpenedSource,
    detection: DetectionOutcome,
    credential: Option<Credential>,
    binary_output: bool,
    target: DecryptTarget,
) -> Result<Progress<'a, E>, DecryptError> {
    let resolved = match target {
        DecryptTarget::Message => ResolvedTarget::Message,
        DecryptTarget::Stream => ResolvedTarget::Stream,
        DecryptTarget::File { output: Some(path) } => ResolvedTarget::File(path),
        DecryptTarget::File { output: None } => {
            let default_guess = default_output_guess(opened.origin_path());
            log::debug!("awaiting output path (guess: {})", default_guess.display());
            return Ok(Progress::NeedsOutputPath(PendingOutput {
                engine,
                opened,
                detection,
                credential,
                binary_output,
                default_guess,
            }));
        }
    };
    execute(engine, opened, detection, credential, binary_output, resolved)
}

fn execute<'a, E: DecryptEngine>(
    engine: &'a E,
    opened: OpenedSource,
    detection: DetectionOutcome,
    credential: Option<Credential>,
    binary_output: bool,
    target: ResolvedTarget,
) -> Result<Progress<'a, E>, DecryptError> {
    log::debug!("executing decrypt-verify ({detection:?})");
    let outcome = engine.execute(opened, &detection, credential.as_ref(), binary_output, &target)?;
    log::debug!("request completed");
    Ok(Progress::Complete(outcome))
}

/// Suggests an output path for a file-target prompt: strip a recognized
/// OpenPGP extension, otherwise mark the name as decrypted.
pub fn default_output_guess(input: Option<&Path>) -> PathBuf {
    let Some(input) = input else {
        return PathBuf::from("decrypted.out");
    };
    match input.extension().and_then(|ext| ext.to_str()) {
        Some(ext) if matches!(ext.to_ascii_lowercase().as_str(), "pgp" | "gpg" | "asc") => {
            input.with_extension("")
        }
        _ => {
            let mut name = input.as_os_str().to_owned();
            name.push(".decrypted");
            PathBuf::from(name)
        }
    }
}
