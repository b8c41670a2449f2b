#![allow(dead_code)]

use std::io::Write;

use openpgp::Cert;
use openpgp::cert::CertBuilder;
use openpgp::crypto::Password;
use openpgp::policy::StandardPolicy;
use openpgp::serialize::stream::{Armorer, Encryptor, LiteralWriter, Message, Signer};
use openpgp::serialize::SerializeInto;
use sequoia_openpgp as openpgp;

pub fn gen_key(user_id: &str, passphrase: Option<&str>) -> Cert {
    let mut builder = CertBuilder::general_purpose(Some(user_id.to_string()));
    if let Some(pass) = passphrase {
        builder = builder.set_password(Some(Password::from(pass)));
    }
    let (cert, _rev) = builder.generate().expect("keygen");
    cert
}

pub fn tsk_bytes(cert: &Cert) -> Vec<u8> {
    cert.as_tsk().to_vec().expect("serialize tsk")
}

pub fn cert_bytes(cert: &Cert) -> Vec<u8> {
    cert.to_vec().expect("serialize cert")
}

pub fn encrypt_to(recipient: &Cert, plaintext: &[u8], armor: bool) -> Vec<u8> {
    let p = &StandardPolicy::new();
    let mut recipients: Vec<openpgp::serialize::stream::Recipient> = Vec::new();
    for key in recipient
        .keys()
        .with_policy(p, None)
        .supported()
        .alive()
        .revoked(false)
        .for_transport_encryption()
    {
        recipients.push(key.into());
    }
    let mut sink = Vec::new();
    let mut message = Message::new(&mut sink);
    if armor {
        message = Armorer::new(message).build().expect("armorer");
    }
    let message = Encryptor::for_recipients(message, recipients)
        .build()
        .expect("encryptor");
    let mut message = LiteralWriter::new(message).build().expect("literal writer");
    message.write_all(plaintext).expect("write");
    message.finalize().expect("finalize");
    sink
}

pub fn encrypt_symmetric(passphrase: &str, plaintext: &[u8]) -> Vec<u8> {
    let mut sink = Vec::new();
    let message = Message::new(&mut sink);
    let message = Encryptor::with_passwords(message, Some(passphrase))
        .build()
        .expect("encryptor");
    let mut message = LiteralWriter::new(message).build().expect("literal writer");
    message.write_all(plaintext).expect("write");
    message.finalize().expect("finalize");
    sink
}

pub fn sign_and_encrypt(
    signer: &Cert,
    signer_passphrase: Option<&str>,
    recipient: &Cert,
    plaintext: &[u8],
) -> Vec<u8> {
    let p = &StandardPolicy::new();
    let mut recipients: Vec<openpgp::serialize::stream::Recipient> = Vec::new();
    for key in recipient
        .keys()
        .with_policy(p, None)
        .supported()
        .alive()
        .revoked(false)
        .for_transport_encryption()
    {
        recipients.push(key.into());
    }
    let keypair = signing_keypair(signer, signer_passphrase);
    let mut sink = Vec::new();
    let message = Message::new(&mut sink);
    let message = Encryptor::for_recipients(message, recipients)
        .build()
        .expect("encryptor");
    let message = Signer::new(message, keypair)
        .expect("signer")
        .build()
        .expect("signer build");
    let mut message = LiteralWriter::new(message).build().expect("literal writer");
    message.write_all(plaintext).expect("write");
    message.finalize().expect("finalize");
    sink
}

pub fn clearsign(signer: &Cert, signer_passphrase: Option<&str>, text: &[u8]) -> Vec<u8> {
    let keypair = signing_keypair(signer, signer_passphrase);
    let mut sink = Vec::new();
    let message = Message::new(&mut sink);
    let mut signer = Signer::new(message, keypair)
        .expect("signer")
        .cleartext()
        .build()
        .expect("signer build");
    signer.write_all(text).expect("write");
    signer.finalize().expect("finalize");
    sink
}

pub fn literal_message(plaintext: &[u8]) -> Vec<u8> {
    let mut sink = Vec::new();
    let message = Message::new(&mut sink);
    let mut message = LiteralWriter::new(message).build().expect("literal writer");
    message.write_all(plaintext).expect("write");
    message.finalize().expect("finalize");
    sink
}

fn signing_keypair(cert: &Cert, passphrase: Option<&str>) -> openpgp::crypto::KeyPair {
    let p = &StandardPolicy::new();
    let key = cert
        .keys()
        .secret()
        .with_policy(p, None)
        .supported()
        .alive()
        .revoked(false)
        .for_signing()
        .next()
        .expect("signing key");
    let mut key = key.key().clone();
    if key.secret().is_encrypted() {
        let password = Password::from(passphrase.expect("passphrase for encrypted signing key"));
        key = key.decrypt_secret(&password).expect("unlock signing key");
    }
    key.into_keypair().expect("keypair")
}
