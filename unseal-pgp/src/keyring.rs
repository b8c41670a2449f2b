use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use openpgp::cert::CertParser;
use openpgp::parse::{PacketParser, Parse};
use openpgp::policy::StandardPolicy;
use openpgp::serialize::SerializeInto;
use openpgp::{Cert, Fingerprint, KeyHandle};
use sequoia_openpgp as openpgp;
use tempfile::NamedTempFile;
use unseal_core::{DecryptError, KeyId};

#[derive(Debug, Clone)]
pub struct KeyInfo {
    pub key_id: KeyId,
    pub user_id: Option<String>,
    pub has_secret: bool,
    pub certified: bool,
}

/// The local key store consulted by the detector (is this key id mine?), the
/// executor (secret key material) and the classifier (local trust marking).
/// The decrypt pipeline only reads it; `import` and `mark_trusted` exist for
/// the host.
///
/// On-disk layout under the home directory: `public/` and `secret/` hold one
/// `.pgp` file per fingerprint, `trusted` lists certified fingerprints one
/// per line.
pub struct Keyring {
    home: Option<PathBuf>,
    certs: Vec<Cert>,
    trusted: HashSet<String>,
}

impl Keyring {
    /// `UNSEAL_HOME`, the platform data dir, or a dot directory under the
    /// current working directory, in that order.
    pub fn resolve_home() -> PathBuf {
        if let Ok(value) = std::env::var("UNSEAL_HOME") {
            return PathBuf::from(value);
        }
        if let Some(dir) = dirs::data_local_dir() {
            return dir.join("unseal");
        }
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(".unseal")
    }

    pub fn open_default() -> Result<Self, DecryptError> {
        Self::open(Self::resolve_home())
    }

    pub fn open(home: PathBuf) -> Result<Self, DecryptError> {
        let mut certs: HashMap<String, Cert> = HashMap::new();
        for cert in load_certs_from_dir(&home.join("secret"))? {
            certs.insert(cert.fingerprint().to_hex(), cert);
        }
        for cert in load_certs_from_dir(&home.join("public"))? {
            let fpr = cert.fingerprint().to_hex();
            match certs.remove(&fpr) {
                Some(existing) => {
                    let merged = existing.merge_public(cert).map_err(|err| {
                        DecryptError::Malformed(format!("cert merge failed: {err}"))
                    })?;
                    certs.insert(fpr, merged);
                }
                None => {
                    certs.insert(fpr, cert);
                }
            }
        }
        let trusted = load_trusted(&home.join("trusted"))?;
        Ok(Keyring {
            home: Some(home),
            certs: certs.into_values().collect(),
            trusted,
        })
    }

    /// An in-memory keyring with no backing store, for embedding hosts.
    pub fn from_certs(certs: Vec<Cert>) -> Self {
        Keyring {
            home: None,
            certs,
            trusted: HashSet::new(),
        }
    }

    /// Marks a fingerprint as certified without touching any store.
    pub fn with_trusted(mut self, fingerprint: &Fingerprint) -> Self {
        self.trusted.insert(fingerprint.to_hex());
        self
    }

    pub fn certs(&self) -> &[Cert] {
        &self.certs
    }

    pub fn is_certified(&self, fingerprint: &Fingerprint) -> bool {
        self.trusted.contains(&fingerprint.to_hex())
    }

    /// The cert owning a secret encryption-capable key that the given
    /// recipient handle refers to, if any.
    pub(crate) fn secret_cert_for(&self, recipient: &KeyHandle) -> Option<&Cert> {
        let policy = StandardPolicy::new();
        for cert in &self.certs {
            if !cert.is_tsk() {
                continue;
            }
            for key in cert
                .keys()
                .secret()
                .with_policy(&policy, None)
                .supported()
                .alive()
                .revoked(false)
                .for_transport_encryption()
            {
                let handle: KeyHandle = key.key().fingerprint().into();
                if handle.aliases(recipient) {
                    return Some(cert);
                }
            }
        }
        None
    }

    /// Certs matching the given handles; all certs when none are given.
    pub(crate) fn certs_for(&self, ids: &[KeyHandle]) -> Vec<Cert> {
        if ids.is_empty() {
            return self.certs.clone();
        }
        let mut matches = Vec::new();
        for cert in &self.certs {
            let mut matched = false;
            for id in ids {
                if cert.fingerprint().aliases(id) {
                    matched = true;
                    break;
                }
                if cert.keys().any(|key| key.key().fingerprint().aliases(id)) {
                    matched = true;
                    break;
                }
            }
            if matched {
                matches.push(cert.clone());
            }
        }
        matches
    }

    pub fn list(&self) -> Vec<KeyInfo> {
        let mut keys: Vec<KeyInfo> = self.certs.iter().map(|c| self.info_from_cert(c)).collect();
        keys.sort_by(|a, b| a.key_id.0.cmp(&b.key_id.0));
        keys
    }

    fn info_from_cert(&self, cert: &Cert) -> KeyInfo {
        KeyInfo {
            key_id: KeyId(cert.fingerprint().to_hex()),
            user_id: cert.userids().next().map(|u| u.userid().to_string()),
            has_secret: cert.is_tsk(),
            certified: self.is_certified(&cert.fingerprint()),
        }
    }

    /// Imports certs from a key file (binary or armored) into the store.
    pub fn import(&mut self, bytes: &[u8]) -> Result<Vec<KeyInfo>, DecryptError> {
        let home = self.backing_home()?;
        ensure_dirs(&home)?;

        let ppr = PacketParser::from_bytes(bytes)
            .map_err(|err| DecryptError::Malformed(format!("parse failed: {err}")))?;
        let mut imported = Vec::new();
        for cert in CertParser::from(ppr) {
            let cert = cert
                .map_err(|err| DecryptError::Malformed(format!("invalid certificate: {err}")))?;
            if cert.is_tsk() {
                store_cert(&home, &cert, true)?;
            }
            store_cert(&home, &cert, false)?;
            imported.push(cert);
        }
        if imported.is_empty() {
            return Err(DecryptError::Malformed("no certificates found".to_string()));
        }

        *self = Keyring::open(home)?;
        Ok(imported.iter().map(|c| self.info_from_cert(c)).collect())
    }

    /// Marks a locally-held key as certified. Requires the full fingerprint
    /// to avoid certifying the wrong key on a short-id collision.
    pub fn mark_trusted(&mut self, selector: &str) -> Result<KeyInfo, DecryptError> {
        let home = self.backing_home()?;
        let needle = normalize_selector(selector);
        let cert = self
            .certs
            .iter()
            .find(|cert| cert.fingerprint().to_hex() == needle)
            .ok_or_else(|| {
                DecryptError::NotFound(format!("no key with full fingerprint {selector}"))
            })?;
        let info = self.info_from_cert(cert);
        self.trusted.insert(needle);

        ensure_dirs(&home)?;
        let mut lines: Vec<&str> = self.trusted.iter().map(|s| s.as_str()).collect();
        lines.sort_unstable();
        let body = lines.join("\n") + "\n";
        write_atomic(&home.join("trusted"), body.as_bytes(), 0o644)?;
        Ok(KeyInfo {
            certified: true,
            ..info
        })
    }

    fn backing_home(&self) -> Result<PathBuf, DecryptError> {
        self.home
            .clone()
            .ok_or_else(|| DecryptError::Internal("keyring has no backing store".to_string()))
    }
}

fn load_certs_from_dir(dir: &Path) -> Result<Vec<Cert>, DecryptError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut certs = Vec::new();
    for entry in fs::read_dir(dir)
        .map_err(|err| DecryptError::StorageUnavailable(format!("read dir failed: {err}")))?
    {
        let entry = entry
            .map_err(|err| DecryptError::StorageUnavailable(format!("read dir failed: {err}")))?;
        let path = entry.path();
        // Ignore non-cert artifacts (editor swap files, notes) in the store.
        let is_pgp = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pgp"));
        if !is_pgp || !path.is_file() {
            continue;
        }
        let bytes = fs::read(&path)
            .map_err(|err| DecryptError::StorageUnavailable(format!("read failed: {err}")))?;
        let ppr = PacketParser::from_bytes(&bytes)
            .map_err(|err| DecryptError::Malformed(format!("parse failed: {err}")))?;
        for cert in CertParser::from(ppr) {
            certs.push(cert.map_err(|err| {
                DecryptError::Malformed(format!("invalid certificate in store: {err}"))
            })?);
        }
    }
    Ok(certs)
}

fn load_trusted(path: &Path) -> Result<HashSet<String>, DecryptError> {
    if !path.exists() {
        return Ok(HashSet::new());
    }
    let text = fs::read_to_string(path)
        .map_err(|err| DecryptError::StorageUnavailable(format!("read failed: {err}")))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| line.to_ascii_uppercase())
        .collect())
}

fn ensure_dirs(home: &Path) -> Result<(), DecryptError> {
    for dir in [home.to_path_buf(), home.join("public"), home.join("secret")] {
        fs::create_dir_all(&dir)
            .map_err(|err| DecryptError::StorageUnavailable(format!("create dir failed: {err}")))?;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        // Secret material must not be reachable by other users.
        for dir in [home.to_path_buf(), home.join("secret")] {
            fs::set_permissions(&dir, fs::Permissions::from_mode(0o700)).map_err(|err| {
                DecryptError::StorageUnavailable(format!("chmod failed: {err}"))
            })?;
        }
    }
    Ok(())
}

fn store_cert(home: &Path, cert: &Cert, secret: bool) -> Result<(), DecryptError> {
    let fingerprint = cert.fingerprint().to_hex();
    let dir = home.join(if secret { "secret" } else { "public" });
    let path = dir.join(format!("{fingerprint}.pgp"));
    let bytes = if secret {
        cert.as_tsk()
            .to_vec()
            .map_err(|err| DecryptError::Internal(format!("serialize failed: {err}")))?
    } else {
        cert.to_vec()
            .map_err(|err| DecryptError::Internal(format!("serialize failed: {err}")))?
    };
    let mode = if secret { 0o600 } else { 0o644 };
    write_atomic(&path, &bytes, mode)
}

fn write_atomic(path: &Path, bytes: &[u8], mode: u32) -> Result<(), DecryptError> {
    let dir = path
        .parent()
        .ok_or_else(|| DecryptError::Internal("invalid path for atomic write".to_string()))?;
    let mut temp = NamedTempFile::new_in(dir)
        .map_err(|err| DecryptError::StorageUnavailable(format!("temp file error: {err}")))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = temp
            .as_file()
            .metadata()
            .map_err(|err| DecryptError::StorageUnavailable(format!("stat failed: {err}")))?
            .permissions();
        perms.set_mode(mode);
        temp.as_file()
            .set_permissions(perms)
            .map_err(|err| DecryptError::StorageUnavailable(format!("chmod failed: {err}")))?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    temp.write_all(bytes)
        .map_err(|err| DecryptError::StorageUnavailable(format!("write failed: {err}")))?;
    temp.as_file()
        .sync_all()
        .map_err(|err| DecryptError::StorageUnavailable(format!("sync failed: {err}")))?;
    temp.persist(path)
        .map_err(|err| DecryptError::StorageUnavailable(format!("persist failed: {err}")))?;
    Ok(())
}

fn normalize_selector(selector: &str) -> String {
    selector
        .trim()
        .trim_start_matches("0x")
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_normalization() {
        assert_eq!(normalize_selector("0xdead beef"), "DEADBEEF");
        assert_eq!(normalize_selector("  AB cd  "), "ABCD");
    }

    #[test]
    fn empty_keyring_has_no_matches() {
        let keyring = Keyring::from_certs(Vec::new());
        assert!(keyring.list().is_empty());
        let handle: KeyHandle = "0123456789ABCDEF0123456789ABCDEF01234567"
            .parse()
            .expect("handle");
        assert!(keyring.secret_cert_for(&handle).is_none());
    }
}
