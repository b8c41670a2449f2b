use std::io::Read;

use openpgp::Packet;
use openpgp::parse::{PacketParserBuilder, PacketParserResult, Parse};
use sequoia_openpgp as openpgp;
use unseal_core::{DecryptError, DetectionOutcome, KeyId, OpenedSource};

use crate::keyring::Keyring;

const CLEARTEXT_HEADER: &str = "-----BEGIN PGP SIGNED MESSAGE-----";
const CLEARTEXT_PROBE: u64 = 1024;

/// Decides how an input is protected before any credential is requested.
///
/// Two-phase probe: first look for a public-key encrypted session key
/// addressed to a locally-held secret key, then rewind the probe window and
/// look for a passphrase-encrypted session key. The probe only reads through
/// [`OpenedSource::probe`], so the executor later sees the stream intact.
pub fn detect(
    keyring: &Keyring,
    source: &mut OpenedSource,
) -> Result<DetectionOutcome, DecryptError> {
    if starts_cleartext_signed(source)? {
        log::debug!("input is a cleartext-signed message");
        return Ok(DetectionOutcome::SignedOnly);
    }
    match scan_asymmetric(keyring, source)? {
        AsymScan::LocalRecipient(key_id) => {
            log::debug!("asymmetric envelope for local key {key_id}");
            Ok(DetectionOutcome::Asymmetric(key_id))
        }
        AsymScan::ForeignRecipientsOnly => Err(DecryptError::NoSecretKey),
        AsymScan::NoAsymmetricEnvelope => {
            if scan_symmetric(source)? {
                log::debug!("symmetric envelope");
                Ok(DetectionOutcome::Symmetric)
            } else {
                Ok(DetectionOutcome::Undetectable)
            }
        }
    }
}

fn starts_cleartext_signed(source: &mut OpenedSource) -> Result<bool, DecryptError> {
    let mut head = Vec::new();
    source
        .probe()
        .take(CLEARTEXT_PROBE)
        .read_to_end(&mut head)
        .map_err(|err| DecryptError::StorageUnavailable(format!("read failed: {err}")))?;
    let text = String::from_utf8_lossy(&head);
    Ok(text.trim_start().starts_with(CLEARTEXT_HEADER))
}

enum AsymScan {
    LocalRecipient(KeyId),
    ForeignRecipientsOnly,
    NoAsymmetricEnvelope,
}

fn scan_asymmetric(
    keyring: &Keyring,
    source: &mut OpenedSource,
) -> Result<AsymScan, DecryptError> {
    let mut ppr = PacketParserBuilder::from_reader(source.probe())
        .map_err(|err| DecryptError::Malformed(format!("parse failed: {err}")))?
        .build()
        .map_err(|err| DecryptError::Malformed(format!("parse failed: {err}")))?;
    let mut saw_pkesk = false;
    while let PacketParserResult::Some(pp) = ppr {
        match &pp.packet {
            Packet::PKESK(pkesk) => {
                saw_pkesk = true;
                if let Some(recipient) = pkesk.recipient()
                    && let Some(cert) = keyring.secret_cert_for(&recipient)
                {
                    return Ok(AsymScan::LocalRecipient(KeyId(cert.fingerprint().to_hex())));
                }
            }
            Packet::SKESK(_) | Packet::Marker(_) => {}
            // The first non-ESK packet ends the envelope prefix; never
            // descend into the encrypted container itself.
            _ => break,
        }
        ppr = pp
            .next()
            .map_err(|err| DecryptError::Malformed(format!("parse failed: {err}")))?
            .1;
    }
    if saw_pkesk {
        Ok(AsymScan::ForeignRecipientsOnly)
    } else {
        Ok(AsymScan::NoAsymmetricEnvelope)
    }
}

fn scan_symmetric(source: &mut OpenedSource) -> Result<bool, DecryptError> {
    let mut ppr = PacketParserBuilder::from_reader(source.probe())
        .map_err(|err| DecryptError::Malformed(format!("parse failed: {err}")))?
        .build()
        .map_err(|err| DecryptError::Malformed(format!("parse failed: {err}")))?;
    while let PacketParserResult::Some(pp) = ppr {
        match &pp.packet {
            Packet::SKESK(_) => return Ok(true),
            Packet::PKESK(_) | Packet::Marker(_) => {}
            _ => break,
        }
        ppr = pp
            .next()
            .map_err(|err| DecryptError::Malformed(format!("parse failed: {err}")))?
            .1;
    }
    Ok(false)
}
