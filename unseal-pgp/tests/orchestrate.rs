use std::fs;
use std::path::{Path, PathBuf};

use unseal_core::{
    CredentialNeed, DecryptError, DecryptRequest, DecryptTarget, HostPrompt, InputSource,
    MemoryPassphraseCache, Orchestrator, Passphrase, Plaintext, Progress,
};
use unseal_pgp::{Keyring, NativeEngine};

mod common;

use common::{encrypt_symmetric, encrypt_to, gen_key, tsk_bytes};

struct ScriptedHost {
    passphrases: Vec<Option<&'static str>>,
    asked: Vec<CredentialNeed>,
}

impl ScriptedHost {
    fn new(passphrases: Vec<Option<&'static str>>) -> Self {
        ScriptedHost {
            passphrases,
            asked: Vec::new(),
        }
    }
}

impl HostPrompt for ScriptedHost {
    fn ask_passphrase(&mut self, need: &CredentialNeed) -> Option<Passphrase> {
        self.asked.push(need.clone());
        self.passphrases.remove(0).map(Passphrase::new)
    }

    fn ask_output_path(&mut self, default_guess: &Path) -> Option<PathBuf> {
        Some(default_guess.to_path_buf())
    }
}

fn encrypted_file(dir: &Path, name: &str, passphrase: &str, plaintext: &[u8]) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, encrypt_symmetric(passphrase, plaintext)).expect("write fixture");
    path
}

#[test]
fn symmetric_file_with_correct_passphrase_completes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = encrypted_file(dir.path(), "secret.txt.pgp", "correct", b"original contents\n");

    let orchestrator = Orchestrator::new(NativeEngine::new(Keyring::from_certs(Vec::new())));
    let cache = MemoryPassphraseCache::new();
    let mut host = ScriptedHost::new(vec![Some("correct")]);
    let request = DecryptRequest {
        source: InputSource::FilePath(input),
        binary_output: false,
        target: DecryptTarget::Message,
    };

    let outcome = orchestrator.run(request, &cache, &mut host).expect("run");
    assert_eq!(outcome.plaintext, Plaintext::Text("original contents\n".into()));
    assert_eq!(host.asked, vec![CredentialNeed::Symmetric]);
}

#[test]
fn symmetric_file_with_wrong_passphrase_fails_wrong_credential() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = encrypted_file(dir.path(), "secret.txt.pgp", "correct", b"original contents\n");

    let orchestrator = Orchestrator::new(NativeEngine::new(Keyring::from_certs(Vec::new())));
    let cache = MemoryPassphraseCache::new();
    let request = DecryptRequest {
        source: InputSource::FilePath(input),
        binary_output: false,
        target: DecryptTarget::Message,
    };

    let pending = match orchestrator.begin(request, &cache).expect("begin") {
        Progress::NeedsPassphrase(pending) => pending,
        _ => panic!("expected a passphrase suspension"),
    };
    let err = pending
        .supply(Passphrase::new("wrong"))
        .expect_err("wrong passphrase");
    assert!(matches!(err, DecryptError::WrongCredential));
}

#[test]
fn wrong_then_correct_passphrase_recovers_via_reprompt() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = encrypted_file(dir.path(), "retry.pgp", "correct", b"retried\n");

    let orchestrator = Orchestrator::new(NativeEngine::new(Keyring::from_certs(Vec::new())));
    let cache = MemoryPassphraseCache::new();
    let mut host = ScriptedHost::new(vec![Some("wrong"), Some("correct")]);
    let request = DecryptRequest {
        source: InputSource::FilePath(input),
        binary_output: false,
        target: DecryptTarget::Message,
    };

    let outcome = orchestrator.run(request, &cache, &mut host).expect("run");
    assert_eq!(outcome.plaintext, Plaintext::Text("retried\n".into()));
    assert_eq!(host.asked.len(), 2);
}

#[test]
fn asymmetric_prompt_names_the_resolved_key() {
    let alice = gen_key("Alice <alice@example.org>", Some("alice-pass"));
    let keyring = Keyring::from_certs(vec![alice.clone()]);
    let ciphertext = encrypt_to(&alice, b"for alice\n", false);

    let orchestrator = Orchestrator::new(NativeEngine::new(keyring));
    let cache = MemoryPassphraseCache::new();
    let mut host = ScriptedHost::new(vec![Some("alice-pass")]);
    let request = DecryptRequest {
        source: InputSource::Bytes(ciphertext),
        binary_output: false,
        target: DecryptTarget::Message,
    };

    let outcome = orchestrator.run(request, &cache, &mut host).expect("run");
    assert_eq!(outcome.plaintext, Plaintext::Text("for alice\n".into()));
    assert_eq!(
        host.asked,
        vec![CredentialNeed::Key(unseal_core::KeyId(
            alice.fingerprint().to_hex()
        ))]
    );
}

#[test]
fn cached_passphrase_skips_the_prompt() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = encrypted_file(dir.path(), "cached.pgp", "session-pw", b"no prompt\n");

    let orchestrator = Orchestrator::new(NativeEngine::new(Keyring::from_certs(Vec::new())));
    let cache = MemoryPassphraseCache::new();
    cache.insert(CredentialNeed::Symmetric, Passphrase::new("session-pw"));
    let mut host = ScriptedHost::new(Vec::new());
    let request = DecryptRequest {
        source: InputSource::FilePath(input),
        binary_output: false,
        target: DecryptTarget::Message,
    };

    let outcome = orchestrator.run(request, &cache, &mut host).expect("run");
    assert_eq!(outcome.plaintext, Plaintext::Text("no prompt\n".into()));
    assert!(host.asked.is_empty());
}

#[test]
fn cancelling_the_prompt_releases_the_input_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = encrypted_file(dir.path(), "cancel.pgp", "pw", b"never read\n");

    let orchestrator = Orchestrator::new(NativeEngine::new(Keyring::from_certs(Vec::new())));
    let cache = MemoryPassphraseCache::new();
    let request = DecryptRequest {
        source: InputSource::FilePath(input.clone()),
        binary_output: false,
        target: DecryptTarget::Message,
    };

    let pending = match orchestrator.begin(request, &cache).expect("begin") {
        Progress::NeedsPassphrase(pending) => pending,
        _ => panic!("expected a passphrase suspension"),
    };
    let err = pending.cancel();
    assert!(matches!(err, DecryptError::Cancelled));

    // The handle is released: the same path can be opened for a new request
    // and even removed.
    let request = DecryptRequest {
        source: InputSource::FilePath(input.clone()),
        binary_output: false,
        target: DecryptTarget::Message,
    };
    assert!(matches!(
        orchestrator.begin(request, &cache).expect("reopen"),
        Progress::NeedsPassphrase(_)
    ));
    fs::remove_file(&input).expect("remove after cancel");
}

#[test]
fn file_target_prompts_for_output_and_writes_it() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = encrypted_file(dir.path(), "report.txt.pgp", "pw", b"report body\n");

    let orchestrator = Orchestrator::new(NativeEngine::new(Keyring::from_certs(Vec::new())));
    let cache = MemoryPassphraseCache::new();
    let mut host = ScriptedHost::new(vec![Some("pw")]);
    let request = DecryptRequest {
        source: InputSource::FilePath(input),
        binary_output: false,
        target: DecryptTarget::File { output: None },
    };

    let outcome = orchestrator.run(request, &cache, &mut host).expect("run");
    let expected = dir.path().join("report.txt");
    assert_eq!(outcome.plaintext, Plaintext::FileWritten(expected.clone()));
    assert_eq!(fs::read(&expected).expect("read output"), b"report body\n");
}

#[test]
fn missing_input_file_is_not_found() {
    let orchestrator = Orchestrator::new(NativeEngine::new(Keyring::from_certs(Vec::new())));
    let cache = MemoryPassphraseCache::new();
    let request = DecryptRequest {
        source: InputSource::FilePath(PathBuf::from("/no/such/file.pgp")),
        binary_output: false,
        target: DecryptTarget::Message,
    };
    let err = orchestrator.begin(request, &cache).expect_err("missing file");
    assert!(matches!(err, DecryptError::NotFound(_)));
}

#[test]
fn home_backed_keyring_decrypts_after_import() {
    let dir = tempfile::tempdir().expect("tempdir");
    let alice = gen_key("Alice <alice@example.org>", Some("alice-pass"));
    let mut keyring = Keyring::open(dir.path().join("home")).expect("open keyring");
    keyring.import(&tsk_bytes(&alice)).expect("import");

    // A fresh open must see the stored key.
    let keyring = Keyring::open(dir.path().join("home")).expect("reopen keyring");
    let ciphertext = encrypt_to(&alice, b"persisted\n", false);

    let orchestrator = Orchestrator::new(NativeEngine::new(keyring));
    let cache = MemoryPassphraseCache::new();
    let mut host = ScriptedHost::new(vec![Some("alice-pass")]);
    let request = DecryptRequest {
        source: InputSource::Bytes(ciphertext),
        binary_output: false,
        target: DecryptTarget::Message,
    };
    let outcome = orchestrator.run(request, &cache, &mut host).expect("run");
    assert_eq!(outcome.plaintext, Plaintext::Text("persisted\n".into()));
}
