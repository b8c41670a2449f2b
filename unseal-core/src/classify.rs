use crate::{RawVerification, SignatureResult, SignatureStatus};

/// Maps a raw verification outcome to the trust state that drives the host's
/// UI decisions. Pure and total over [`RawVerification`]; the field
/// invariants from the data model are asserted in development builds.
pub fn classify(raw: RawVerification) -> SignatureResult {
    match raw {
        RawVerification::Unsigned => SignatureResult {
            status: SignatureStatus::NoSignature,
            signer_key_id: None,
            signer_user_id: None,
        },
        RawVerification::Good {
            key_id,
            user_id,
            certified,
        } => {
            debug_assert!(
                user_id.is_some(),
                "a verified signature must carry the signer's user id"
            );
            SignatureResult {
                status: if certified {
                    SignatureStatus::Valid
                } else {
                    SignatureStatus::ValidUncertified
                },
                signer_key_id: Some(key_id),
                signer_user_id: user_id,
            }
        }
        RawVerification::MissingKey { key_id } => SignatureResult {
            // The host should offer a key lookup for `signer_key_id`.
            status: SignatureStatus::UnknownSigner,
            signer_key_id: Some(key_id),
            signer_user_id: None,
        },
        RawVerification::Bad { key_id } => SignatureResult {
            status: SignatureStatus::Invalid,
            signer_key_id: key_id,
            signer_user_id: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KeyId;

    fn key() -> KeyId {
        KeyId("0123456789ABCDEF0123456789ABCDEF01234567".into())
    }

    #[test]
    fn classification_is_total_and_deterministic() {
        let fixtures = [
            (RawVerification::Unsigned, SignatureStatus::NoSignature),
            (
                RawVerification::Good {
                    key_id: key(),
                    user_id: Some("Alice <alice@example.org>".into()),
                    certified: true,
                },
                SignatureStatus::Valid,
            ),
            (
                RawVerification::Good {
                    key_id: key(),
                    user_id: Some("Alice <alice@example.org>".into()),
                    certified: false,
                },
                SignatureStatus::ValidUncertified,
            ),
            (
                RawVerification::MissingKey { key_id: key() },
                SignatureStatus::UnknownSigner,
            ),
            (
                RawVerification::Bad { key_id: None },
                SignatureStatus::Invalid,
            ),
        ];
        for (raw, expected) in fixtures {
            assert_eq!(classify(raw.clone()).status, expected);
            assert_eq!(classify(raw.clone()).status, classify(raw).status);
        }
    }

    #[test]
    fn unknown_signer_keeps_the_lookup_key_id() {
        let result = classify(RawVerification::MissingKey { key_id: key() });
        assert_eq!(result.signer_key_id, Some(key()));
        assert_eq!(result.signer_user_id, None);
    }

    #[test]
    fn valid_statuses_carry_signer_identity() {
        for certified in [true, false] {
            let result = classify(RawVerification::Good {
                key_id: key(),
                user_id: Some("Bob <bob@example.org>".into()),
                certified,
            });
            assert!(result.signer_key_id.is_some());
            assert!(result.signer_user_id.is_some());
        }
    }
}
