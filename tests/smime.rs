// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! End-to-end exercises of the S/MIME context over scratch stores.

Fixtures are generated by `tests/data/generate.sh`: an RSA root CA
("Example Root CA"), leaf identities for alice and bob with rfc822Name
subject alternative names, PKCS#12 bundles (password `no.secret`), and a
CRL revoking alice's certificate.
*/

use {
    secure_mime::{
        certificate::common_name,
        crl::RevocationReason,
        CertificateRevocationList, CertificateSelector, CertificateStore, DigestAlgorithm,
        FileStore, Mailbox, PathBuildError, SecureMimeContext, SecureMimeError, SecureMimeType,
    },
    std::{io::Cursor, path::Path},
    x509_certificate::CapturedX509Certificate,
};

const ALICE_DER: &[u8] = include_bytes!("data/alice.der");
const BOB_DER: &[u8] = include_bytes!("data/bob.der");
const CA_DER: &[u8] = include_bytes!("data/ca.der");
const ALICE_P12: &[u8] = include_bytes!("data/alice.p12");
const BOB_P12: &[u8] = include_bytes!("data/bob.p12");
const REVOKED_CRL: &[u8] = include_bytes!("data/revoked.crl");

const PASSWORD: &str = "no.secret";

fn ca() -> CapturedX509Certificate {
    CapturedX509Certificate::from_der(CA_DER.to_vec()).unwrap()
}

fn bob() -> CapturedX509Certificate {
    CapturedX509Certificate::from_der(BOB_DER.to_vec()).unwrap()
}

fn file_store(dir: &Path, password: Option<&str>) -> FileStore {
    FileStore::with_paths(
        dir.join("addressbook.crt"),
        dir.join("root.crt"),
        dir.join("revoked.crl"),
        dir.join("user.p12"),
        password.map(String::from),
    )
}

/// A context owning alice's identity, with the root CA trusted.
fn alice_context(dir: &Path) -> SecureMimeContext {
    let store = file_store(dir, Some(PASSWORD));
    store.import_trusted_anchor(&ca()).unwrap();

    let context = SecureMimeContext::new(CertificateStore::File(store));
    context
        .import_pkcs12(&mut Cursor::new(ALICE_P12), PASSWORD)
        .unwrap();

    context
}

/// A context owning bob's identity.
fn bob_context(dir: &Path) -> SecureMimeContext {
    let store = file_store(dir, Some(PASSWORD));
    store.import_trusted_anchor(&ca()).unwrap();

    let context = SecureMimeContext::new(CertificateStore::File(store));
    context
        .import_pkcs12(&mut Cursor::new(BOB_P12), PASSWORD)
        .unwrap();

    context
}

/// An empty context: no anchors, no identities, nothing in the book.
fn empty_context(dir: &Path) -> SecureMimeContext {
    SecureMimeContext::new(CertificateStore::File(file_store(dir, None)))
}

#[test]
fn sign_then_verify_detached() {
    let dir = tempfile::tempdir().unwrap();
    let context = alice_context(dir.path());

    let content = b"Hello\r\n";
    let mut signature = Vec::new();

    let tag = context
        .sign(
            &Mailbox::from("alice@example.com"),
            DigestAlgorithm::Sha256,
            &mut Cursor::new(content),
            &mut signature,
        )
        .unwrap();
    assert_eq!(tag, SecureMimeType::SignedData);

    let signatures = context
        .verify(&mut Cursor::new(content), &signature)
        .unwrap();

    assert_eq!(signatures.len(), 1);
    let signature = &signatures[0];

    assert!(signature.is_integrity_valid());
    assert!(signature.chain_error().is_none(), "{:?}", signature.chain_error());
    assert!(signature.chain().is_some());

    let cert = signature.signer_certificate().unwrap();
    assert_eq!(common_name(cert.subject_name()).as_deref(), Some("Alice"));

    let age = chrono::Utc::now() - signature.creation_date().unwrap();
    assert!(age.num_seconds().abs() <= 5);
}

#[test]
fn encapsulated_sign_then_verify() {
    let dir = tempfile::tempdir().unwrap();
    let context = alice_context(dir.path());

    let content = b"Hello\r\n";
    let mut blob = Vec::new();

    context
        .encapsulated_sign(
            &Mailbox::from("alice@example.com"),
            DigestAlgorithm::Sha256,
            &mut Cursor::new(content),
            &mut blob,
        )
        .unwrap();

    let (extracted, signatures) = context
        .verify_encapsulated(&mut Cursor::new(&blob))
        .unwrap();

    assert_eq!(extracted, content);
    assert_eq!(signatures.len(), 1);
    assert!(signatures[0].is_integrity_valid());
    assert!(signatures[0].chain_error().is_none());

    let cert = signatures[0].signer_certificate().unwrap();
    assert_eq!(common_name(cert.subject_name()).as_deref(), Some("Alice"));
}

#[test]
fn tampered_content_fails_integrity() {
    let dir = tempfile::tempdir().unwrap();
    let context = alice_context(dir.path());

    let mut signature = Vec::new();
    context
        .sign(
            &Mailbox::from("alice@example.com"),
            DigestAlgorithm::Sha256,
            &mut Cursor::new(b"Hello\r\n"),
            &mut signature,
        )
        .unwrap();

    let signatures = context
        .verify(&mut Cursor::new(b"Hello, tampered\r\n"), &signature)
        .unwrap();

    assert_eq!(signatures.len(), 1);
    assert!(!signatures[0].is_integrity_valid());
}

#[test]
fn encrypt_then_decrypt() {
    let alice_dir = tempfile::tempdir().unwrap();
    let bob_dir = tempfile::tempdir().unwrap();

    let alice = alice_context(alice_dir.path());
    let bob = bob_context(bob_dir.path());

    // Alice learned bob's certificate at some point.
    alice.import_certificate(&self::bob()).unwrap();

    let mut envelope = Vec::new();
    let tag = alice
        .encrypt_for(
            &[Mailbox::from("bob@example.com")],
            &mut Cursor::new(b"secret"),
            &mut envelope,
        )
        .unwrap();
    assert_eq!(tag, SecureMimeType::EnvelopedData);

    let mut decrypted = Vec::new();
    bob.decrypt(&mut Cursor::new(&envelope), &mut decrypted)
        .unwrap();

    assert_eq!(decrypted, b"secret");
}

#[test]
fn decrypt_without_key_fails() {
    let alice_dir = tempfile::tempdir().unwrap();
    let other_dir = tempfile::tempdir().unwrap();

    let alice = alice_context(alice_dir.path());
    alice.import_certificate(&bob()).unwrap();

    let mut envelope = Vec::new();
    alice
        .encrypt_for(
            &[Mailbox::from("bob@example.com")],
            &mut Cursor::new(b"secret"),
            &mut envelope,
        )
        .unwrap();

    // A context without bob's key cannot open it; alice's own key does
    // not match the recipient info.
    let mut out = Vec::new();
    let err = alice
        .decrypt(&mut Cursor::new(&envelope), &mut out)
        .unwrap_err();
    assert!(matches!(err, SecureMimeError::PrivateKeyNotFound));

    let empty = empty_context(other_dir.path());
    let err = empty
        .decrypt(&mut Cursor::new(&envelope), &mut out)
        .unwrap_err();
    assert!(matches!(err, SecureMimeError::PrivateKeyNotFound));
}

#[test]
fn encrypt_for_unknown_mailbox() {
    let dir = tempfile::tempdir().unwrap();
    let context = empty_context(dir.path());

    let mut out = Vec::new();
    let err = context
        .encrypt_for(
            &[Mailbox::from("unknown@example.com")],
            &mut Cursor::new(b"x"),
            &mut out,
        )
        .unwrap_err();

    match err {
        SecureMimeError::CertificateNotFound(address, _) => {
            assert_eq!(address, "unknown@example.com")
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(out.is_empty());
}

#[test]
fn revoked_signer_reported_with_reason() {
    let dir = tempfile::tempdir().unwrap();
    let context = alice_context(dir.path());

    let crl = CertificateRevocationList::from_der(REVOKED_CRL.to_vec()).unwrap();
    context.import_crl(&crl).unwrap();

    let content = b"Hello\r\n";
    let mut signature = Vec::new();
    context
        .sign(
            &Mailbox::from("alice@example.com"),
            DigestAlgorithm::Sha256,
            &mut Cursor::new(content),
            &mut signature,
        )
        .unwrap();

    let signatures = context
        .verify(&mut Cursor::new(content), &signature)
        .unwrap();

    assert_eq!(signatures.len(), 1);
    assert!(signatures[0].is_integrity_valid());
    assert!(signatures[0].chain().is_none());

    match signatures[0].chain_error() {
        Some(PathBuildError::Revoked { reason, .. }) => {
            assert_eq!(*reason, RevocationReason::KeyCompromise)
        }
        other => panic!("expected a revocation error, got {:?}", other),
    }
}

#[test]
fn revocation_off_without_local_crls() {
    // The same signature, against a store without the CRL: trusted.
    let dir = tempfile::tempdir().unwrap();
    let context = alice_context(dir.path());

    let content = b"Hello\r\n";
    let mut signature = Vec::new();
    context
        .sign(
            &Mailbox::from("alice@example.com"),
            DigestAlgorithm::Sha256,
            &mut Cursor::new(content),
            &mut signature,
        )
        .unwrap();

    let signatures = context
        .verify(&mut Cursor::new(content), &signature)
        .unwrap();

    assert!(signatures[0].chain().is_some());
}

#[test]
fn compress_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let context = empty_context(dir.path());

    let mut content = vec![0u8; 1024 * 1024];
    let mut state = 0x9e3779b97f4a7c15u64;
    for byte in content.iter_mut() {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        *byte = (state >> 33) as u8;
    }

    let mut blob = Vec::new();
    let tag = context
        .compress(&mut Cursor::new(&content), &mut blob)
        .unwrap();
    assert_eq!(tag, SecureMimeType::CompressedData);

    let mut out = Vec::new();
    context
        .decompress(&mut Cursor::new(&blob), &mut out)
        .unwrap();

    assert_eq!(out, content);
}

#[test]
fn export_then_import_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let context = alice_context(dir.path());

    // Alice's certificate is on file in the address book.
    context
        .import_certificate(&CapturedX509Certificate::from_der(ALICE_DER.to_vec()).unwrap())
        .unwrap();

    let mut blob = Vec::new();
    let tag = context
        .export(&[Mailbox::from("alice@example.com")], &mut blob)
        .unwrap();
    assert_eq!(tag, SecureMimeType::CertsOnly);

    let before = std::fs::read(dir.path().join("addressbook.crt")).unwrap();

    context.import(&mut Cursor::new(&blob)).unwrap();

    let after = std::fs::read(dir.path().join("addressbook.crt")).unwrap();
    assert_eq!(before, after);
}

#[test]
fn verify_learns_correspondent_certificates() {
    let signer_dir = tempfile::tempdir().unwrap();
    let reader_dir = tempfile::tempdir().unwrap();

    let alice = alice_context(signer_dir.path());

    let content = b"Hello\r\n";
    let mut signature = Vec::new();
    alice
        .sign(
            &Mailbox::from("alice@example.com"),
            DigestAlgorithm::Sha256,
            &mut Cursor::new(content),
            &mut signature,
        )
        .unwrap();

    // A reader who has never heard of alice, but trusts the root.
    let store = file_store(reader_dir.path(), None);
    store.import_trusted_anchor(&ca()).unwrap();
    let reader = SecureMimeContext::new(CertificateStore::File(store));

    let signatures = reader
        .verify(&mut Cursor::new(content), &signature)
        .unwrap();

    assert!(signatures[0].is_integrity_valid());
    assert!(signatures[0].chain().is_some());

    // First contact populated the address book.
    let learned = reader
        .store()
        .get_certificate(&CertificateSelector::ByEmail("alice@example.com".into()))
        .unwrap();
    assert!(learned.is_some());

    // And alice is now resolvable as an encryption recipient.
    let recipient = reader
        .store()
        .cms_recipient(&Mailbox::from("alice@example.com"))
        .unwrap();
    assert_eq!(recipient.certificate.constructed_data(), ALICE_DER);
}

#[test]
fn absent_signer_certificate_reported() {
    use bcder::{encode::Values, Mode};

    let dir = tempfile::tempdir().unwrap();
    let context = empty_context(dir.path());

    // A detached signature stripped of its certificates: the signer can
    // be located neither in the payload nor locally.
    let mut raw =
        secure_mime::asn1::rfc5652::SignedData::decode_ber(include_bytes!(
            "data/signed-detached.der"
        ))
        .unwrap();
    raw.certificates = None;

    let mut stripped = Vec::new();
    raw.encode_ref()
        .write_encoded(Mode::Der, &mut stripped)
        .unwrap();

    let signatures = context
        .verify(&mut Cursor::new(b"Hello\r\n"), &stripped)
        .unwrap();

    assert_eq!(signatures.len(), 1);
    assert!(signatures[0].signer_certificate().is_none());
    assert!(matches!(
        signatures[0].chain_error(),
        Some(PathBuildError::CertificateNotFound(_))
    ));
    assert!(!signatures[0].is_integrity_valid());
}

#[test]
fn signer_resolution_requires_identity() {
    let dir = tempfile::tempdir().unwrap();
    let context = empty_context(dir.path());

    let mut out = Vec::new();
    let err = context
        .sign(
            &Mailbox::from("alice@example.com"),
            DigestAlgorithm::Sha256,
            &mut Cursor::new(b"x"),
            &mut out,
        )
        .unwrap_err();

    assert!(matches!(err, SecureMimeError::CertificateNotFound(..)));
    assert!(out.is_empty());
}
