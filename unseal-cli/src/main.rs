use std::fs;
use std::io::{self, IsTerminal, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use unseal_core::{
    CredentialNeed, DecryptOutcome, DecryptRequest, DecryptTarget, DetectionOutcome, HostPrompt,
    InputSource, MemoryPassphraseCache, OpenedSource, Orchestrator, Passphrase, Plaintext,
    SignatureStatus, sanitize_for_terminal,
};
use unseal_pgp::{Keyring, NativeEngine};

#[derive(Parser, Debug)]
#[command(
    name = "unseal",
    version,
    about = "Decrypt and verify OpenPGP inputs without knowing how they were protected"
)]
struct Cli {
    #[arg(
        long = "home",
        global = true,
        value_name = "DIR",
        help = "Keyring home directory (default: UNSEAL_HOME or the platform data dir)"
    )]
    home: Option<PathBuf>,

    #[arg(
        long = "passphrase",
        global = true,
        value_name = "PASS",
        help = "Unsafe passphrase via argv (requires --allow-unsafe-passphrase)",
        long_help = "Provide a passphrase directly on the command line (unsafe: leaks via shell history and process listings). Requires --allow-unsafe-passphrase. Prefer --passphrase-file."
    )]
    passphrase: Option<String>,

    #[arg(
        long = "passphrase-file",
        global = true,
        value_name = "FILE",
        help = "Read passphrase from file (recommended for scripting)"
    )]
    passphrase_file: Option<String>,

    #[arg(
        long = "allow-unsafe-passphrase",
        global = true,
        help = "Allow using --passphrase (unsafe)"
    )]
    allow_unsafe_passphrase: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Report how an input is protected without decrypting it.
    Detect {
        /// Input file; stdin when omitted.
        input: Option<PathBuf>,
    },
    /// Decrypt an input and verify its signature, prompting as needed.
    Decrypt {
        /// Input file; stdin when omitted.
        input: Option<PathBuf>,
        #[arg(short = 'o', long = "output", value_name = "FILE")]
        output: Option<PathBuf>,
        #[arg(
            long = "to-file",
            help = "Write the plaintext to a file, asking for the path"
        )]
        to_file: bool,
        #[arg(long = "binary", help = "Return raw bytes instead of text")]
        binary: bool,
    },
    /// Import keys from a file into the keyring.
    Import { path: PathBuf },
    /// List the keyring contents.
    ListKeys,
    /// Mark a key as certified, by full fingerprint.
    Trust { fingerprint: String },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    if cli.passphrase.is_some() && !cli.allow_unsafe_passphrase {
        return Err(anyhow!(
            "--passphrase is unsafe (leaks via shell history / process listings); use --passphrase-file, or pass --allow-unsafe-passphrase to proceed"
        ));
    }
    if cli.passphrase.is_some() && cli.passphrase_file.is_some() {
        eprintln!("warning: both --passphrase and --passphrase-file set; using file");
    }
    let preset = if let Some(path) = &cli.passphrase_file {
        Some(read_passphrase_file(path)?)
    } else {
        cli.passphrase.clone()
    };

    let home = cli.home.clone().unwrap_or_else(Keyring::resolve_home);
    let mut keyring = Keyring::open(home)?;

    match cli.cmd {
        Command::Detect { input } => {
            let source = input_source(input)?;
            let mut opened = OpenedSource::open(source)?;
            match unseal_pgp::detect(&keyring, &mut opened)? {
                DetectionOutcome::Asymmetric(key_id) => {
                    println!("asymmetric (secret key {key_id})");
                }
                DetectionOutcome::Symmetric => println!("symmetric (passphrase)"),
                DetectionOutcome::SignedOnly => println!("cleartext signed (not encrypted)"),
                DetectionOutcome::Undetectable => {
                    return Err(anyhow!("no known encryption found"));
                }
            }
            Ok(())
        }
        Command::Decrypt {
            input,
            output,
            to_file,
            binary,
        } => {
            let target = match (output, to_file) {
                (Some(path), _) => DecryptTarget::File { output: Some(path) },
                (None, true) => DecryptTarget::File { output: None },
                (None, false) => DecryptTarget::Message,
            };
            let request = DecryptRequest {
                source: input_source(input)?,
                binary_output: binary,
                target,
            };
            let orchestrator = Orchestrator::new(NativeEngine::new(keyring));
            let cache = MemoryPassphraseCache::new();
            let mut host = CliHost::new(preset.map(Passphrase::new));
            let outcome = orchestrator.run(request, &cache, &mut host)?;
            render_outcome(outcome)
        }
        Command::Import { path } => {
            let bytes = fs::read(&path)
                .map_err(|err| anyhow!("cannot read {}: {err}", path.display()))?;
            for key in keyring.import(&bytes)? {
                println!("imported key: {}", key.key_id);
            }
            Ok(())
        }
        Command::ListKeys => {
            let keys = keyring.list();
            if keys.is_empty() {
                println!("no keys found");
                return Ok(());
            }
            for key in keys {
                let user = key.user_id.as_deref().unwrap_or("(no user id)");
                let user = sanitize_for_terminal(user);
                let kind = if key.has_secret { "sec" } else { "pub" };
                let trust = if key.certified { "certified" } else { "uncertified" };
                println!("{} | {} | {} | {}", kind, key.key_id, user, trust);
            }
            Ok(())
        }
        Command::Trust { fingerprint } => {
            let key = keyring.mark_trusted(&fingerprint)?;
            let user = key.user_id.as_deref().unwrap_or("(no user id)");
            println!("certified key: {} ({})", key.key_id, sanitize_for_terminal(user));
            Ok(())
        }
    }
}

fn input_source(input: Option<PathBuf>) -> Result<InputSource> {
    match input {
        Some(path) => Ok(InputSource::FilePath(path)),
        None => {
            // Buffer stdin so a wrong passphrase can be retried.
            let mut bytes = Vec::new();
            io::stdin()
                .read_to_end(&mut bytes)
                .map_err(|err| anyhow!("cannot read stdin: {err}"))?;
            Ok(InputSource::Bytes(bytes))
        }
    }
}

fn render_outcome(outcome: DecryptOutcome) -> Result<()> {
    if let Some(signature) = &outcome.signature {
        let signer = signature
            .signer_user_id
            .as_deref()
            .map(sanitize_for_terminal)
            .unwrap_or_else(|| "(unknown user id)".to_string());
        let key_id = signature
            .signer_key_id
            .as_ref()
            .map(|id| id.to_string())
            .unwrap_or_else(|| "(no key id)".to_string());
        match signature.status {
            SignatureStatus::Valid => {
                eprintln!("signature: good, certified signer {signer} ({key_id})");
            }
            SignatureStatus::ValidUncertified => {
                eprintln!("signature: good, uncertified signer {signer} ({key_id})");
            }
            SignatureStatus::UnknownSigner => {
                eprintln!("signature: signer {key_id} not in keyring; import the key to verify");
            }
            SignatureStatus::Invalid => {
                eprintln!("signature: INVALID ({key_id})");
            }
            SignatureStatus::NoSignature => {}
        }
    }
    match outcome.plaintext {
        Plaintext::Text(text) => {
            print!("{text}");
            io::stdout().flush().ok();
        }
        Plaintext::Bytes(bytes) => {
            io::stdout()
                .write_all(&bytes)
                .map_err(|err| anyhow!("cannot write stdout: {err}"))?;
        }
        Plaintext::FileWritten(path) => {
            eprintln!("wrote {}", path.display());
        }
    }
    Ok(())
}

struct CliHost {
    preset: Option<Passphrase>,
    preset_used: bool,
}

impl CliHost {
    fn new(preset: Option<Passphrase>) -> Self {
        CliHost {
            preset,
            preset_used: false,
        }
    }
}

impl HostPrompt for CliHost {
    fn ask_passphrase(&mut self, need: &CredentialNeed) -> Option<Passphrase> {
        if !self.preset_used
            && let Some(preset) = self.preset.clone()
        {
            // A preset passphrase is tried once; a rejection falls through to
            // the interactive prompt instead of looping.
            self.preset_used = true;
            return Some(preset);
        }
        if !io::stdin().is_terminal() {
            return None;
        }
        let prompt = match need {
            CredentialNeed::Key(key_id) => format!("Passphrase for key {key_id}: "),
            CredentialNeed::Symmetric => "Message passphrase: ".to_string(),
        };
        rpassword::prompt_password(prompt).ok().map(Passphrase::new)
    }

    fn ask_output_path(&mut self, default_guess: &Path) -> Option<PathBuf> {
        if !io::stdin().is_terminal() {
            return Some(default_guess.to_path_buf());
        }
        eprint!("Output file [{}]: ", default_guess.display());
        io::stderr().flush().ok();
        let mut line = String::new();
        io::stdin().read_line(&mut line).ok()?;
        let line = line.trim();
        if line.is_empty() {
            Some(default_guess.to_path_buf())
        } else {
            Some(PathBuf::from(line))
        }
    }
}

fn read_passphrase_file(path: &str) -> Result<String> {
    const MAX_PASSPHRASE_FILE_BYTES: u64 = 16 * 1024;

    let meta = fs::metadata(path).map_err(|err| anyhow!("cannot read {path}: {err}"))?;
    if meta.len() > MAX_PASSPHRASE_FILE_BYTES {
        return Err(anyhow!("passphrase file too large: {path}"));
    }
    let text = fs::read_to_string(path).map_err(|err| anyhow!("cannot read {path}: {err}"))?;
    let line = text.lines().next().unwrap_or("");
    if line.is_empty() {
        return Err(anyhow!("passphrase file is empty: {path}"));
    }
    Ok(line.to_string())
}
