// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! File-backed certificate store.

Material lives in four well-known files under a per-user directory:

* `addressbook.crt` — correspondent certificates (PEM or DER bundle)
* `root.crt` — trust anchors (PEM or DER bundle)
* `revoked.crl` — concatenated DER CRLs
* `user.p12` — the user's own identity, password protected

Updates are write-new-then-rename so a crash mid-import never truncates
a bundle, and writers serialize on an advisory lock next to each bundle.
Readers take the lock shared, so they proceed in parallel.
*/

use {
    crate::{
        certificate::{certificate_matches_address, sha256_fingerprint},
        crl::CertificateRevocationList,
        store::{CertificateSelector, CmsSigner, Mailbox, PrivateKey, TrustAnchor},
        DigestAlgorithm, SecureMimeError,
    },
    fs2::FileExt,
    log::{debug, warn},
    std::{
        collections::HashSet,
        fs::{File, OpenOptions},
        io::Write,
        path::{Path, PathBuf},
    },
    x509_certificate::CapturedX509Certificate,
};

const ADDRESSBOOK_FILE: &str = "addressbook.crt";
const ROOT_FILE: &str = "root.crt";
const REVOKED_FILE: &str = "revoked.crl";
const USER_FILE: &str = "user.p12";

/// Resolve the per-user store directory.
///
/// `%APPDATA%/mimekit` on Windows, `$HOME/.mimekit` elsewhere.
fn default_root() -> Result<PathBuf, SecureMimeError> {
    #[cfg(windows)]
    let base = dirs::config_dir();
    #[cfg(not(windows))]
    let base = dirs::home_dir();

    let base = base.ok_or(SecureMimeError::Argument(
        "cannot resolve the user's home directory",
    ))?;

    #[cfg(windows)]
    {
        Ok(base.join("mimekit"))
    }
    #[cfg(not(windows))]
    {
        Ok(base.join(".mimekit"))
    }
}

/// Advisory lock scoped to a store file.
///
/// The lock lives in a sibling file that is never renamed, so writers
/// replacing a bundle atomically still exclude each other. Dropping the
/// guard releases the lock on every exit path.
struct FileLock {
    file: File,
}

impl FileLock {
    fn lock_path(path: &Path) -> PathBuf {
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(".lock");

        path.with_file_name(name)
    }

    fn open(path: &Path) -> Result<File, SecureMimeError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        Ok(OpenOptions::new()
            .create(true)
            .write(true)
            .open(Self::lock_path(path))?)
    }

    fn exclusive(path: &Path) -> Result<Self, SecureMimeError> {
        let file = Self::open(path)?;
        file.lock_exclusive()?;

        Ok(Self { file })
    }

    fn shared(path: &Path) -> Result<Self, SecureMimeError> {
        let file = Self::open(path)?;
        file.lock_shared()?;

        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// Replace a file's contents atomically.
fn atomic_write(path: &Path, content: &[u8]) -> Result<(), SecureMimeError> {
    let parent = path
        .parent()
        .ok_or(SecureMimeError::Argument("store path has no parent"))?;
    std::fs::create_dir_all(parent)?;

    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(content)?;
    temp.persist(path).map_err(|e| e.error)?;

    Ok(())
}

/// Compute the byte length of the DER object at the front of `data`.
fn der_object_len(data: &[u8]) -> Option<usize> {
    if data.len() < 2 {
        return None;
    }

    let length_octet = data[1];

    if length_octet & 0x80 == 0 {
        Some(2 + length_octet as usize)
    } else {
        let count = (length_octet & 0x7f) as usize;

        if count == 0 || count > 4 || data.len() < 2 + count {
            return None;
        }

        let mut length = 0usize;
        for octet in &data[2..2 + count] {
            length = (length << 8) | *octet as usize;
        }

        Some(2 + count + length)
    }
}

/// Split a concatenation of DER objects into individual encodings.
fn split_der_objects(data: &[u8]) -> Result<Vec<&[u8]>, SecureMimeError> {
    let mut objects = Vec::new();
    let mut remaining = data;

    while !remaining.is_empty() {
        let len = der_object_len(remaining).ok_or(SecureMimeError::Argument(
            "malformed DER bundle in certificate store",
        ))?;

        if len > remaining.len() {
            return Err(SecureMimeError::Argument(
                "truncated DER bundle in certificate store",
            ));
        }

        objects.push(&remaining[..len]);
        remaining = &remaining[len..];
    }

    Ok(objects)
}

fn looks_like_pem(data: &[u8]) -> bool {
    data.starts_with(b"-----BEGIN") || data.starts_with(b"\n-----BEGIN")
}

/// An identity extracted from a PKCS#12 bundle.
#[derive(Debug)]
pub(crate) struct Pkcs12Identity {
    pub certificate: CapturedX509Certificate,
    pub private_key: PrivateKey,
    pub chain: Vec<CapturedX509Certificate>,
}

fn bmp_string(s: &str) -> Vec<u8> {
    let utf16: Vec<u16> = s.encode_utf16().collect();

    let mut bytes = Vec::with_capacity(utf16.len() * 2 + 2);
    for c in utf16 {
        bytes.push((c / 256) as u8);
        bytes.push((c % 256) as u8);
    }
    bytes.push(0x00);
    bytes.push(0x00);

    bytes
}

/// Parse PKCS#12 data into an identity.
///
/// The bundle must hold exactly one private key; the certificate whose
/// public key matches it becomes the identity certificate and the rest
/// form the chain.
pub(crate) fn parse_pkcs12(data: &[u8], password: &str) -> Result<Pkcs12Identity, SecureMimeError> {
    let pfx = p12::PFX::parse(data).map_err(|e| {
        SecureMimeError::Pkcs12(format!("data does not appear to be PKCS#12: {:?}", e))
    })?;

    if !pfx.verify_mac(password) {
        return Err(SecureMimeError::Pkcs12BadPassword);
    }

    let data = match pfx.auth_safe {
        p12::ContentInfo::Data(data) => data,
        _ => {
            return Err(SecureMimeError::Pkcs12(
                "unexpected PKCS#12 authSafe content".into(),
            ));
        }
    };

    let content_infos = yasna::parse_der(&data, |reader| {
        reader.collect_sequence_of(p12::ContentInfo::parse)
    })
    .map_err(|e| SecureMimeError::Pkcs12(format!("failed parsing inner ContentInfo: {:?}", e)))?;

    let bmp_password = bmp_string(password);

    let mut certificates = Vec::new();
    let mut private_key = None;

    for content in content_infos {
        let bags_data = match content {
            p12::ContentInfo::Data(inner) => inner,
            p12::ContentInfo::EncryptedData(encrypted) => {
                encrypted.data(&bmp_password).ok_or_else(|| {
                    SecureMimeError::Pkcs12("failed decrypting inner EncryptedData".into())
                })?
            }
            p12::ContentInfo::OtherContext(_) => {
                return Err(SecureMimeError::Pkcs12(
                    "unexpected content type in inner PKCS#12 data".into(),
                ));
            }
        };

        let bags = yasna::parse_ber(&bags_data, |reader| {
            reader.collect_sequence_of(p12::SafeBag::parse)
        })
        .map_err(|e| SecureMimeError::Pkcs12(format!("failed parsing SafeBag: {:?}", e)))?;

        for bag in bags {
            match bag.bag {
                p12::SafeBagKind::CertBag(cert_bag) => match cert_bag {
                    p12::CertBag::X509(cert_data) => {
                        certificates.push(CapturedX509Certificate::from_der(cert_data)?);
                    }
                    p12::CertBag::SDSI(_) => {
                        return Err(SecureMimeError::Pkcs12(
                            "unexpected SDSI certificate data".into(),
                        ));
                    }
                },
                p12::SafeBagKind::Pkcs8ShroudedKeyBag(key_bag) => {
                    let decrypted = key_bag.decrypt(&bmp_password).ok_or_else(|| {
                        SecureMimeError::Pkcs12(
                            "error decrypting shrouded key bag; is the password correct?".into(),
                        )
                    })?;

                    private_key = Some(PrivateKey::from_pkcs8_der(decrypted)?);
                }
                p12::SafeBagKind::OtherBagKind(_) => {
                    warn!("ignoring unknown bag type in PKCS#12 data");
                }
            }
        }
    }

    let private_key = private_key
        .ok_or_else(|| SecureMimeError::Pkcs12("no private key in PKCS#12 data".into()))?;

    let public_key = private_key.public_key_data();
    let position = certificates
        .iter()
        .position(|cert| cert.public_key_data().as_ref() == public_key.as_ref())
        .ok_or_else(|| {
            SecureMimeError::Pkcs12("no certificate matching the private key in PKCS#12".into())
        })?;

    let certificate = certificates.remove(position);

    Ok(Pkcs12Identity {
        certificate,
        private_key,
        chain: certificates,
    })
}

/// The default certificate store backend.
///
/// Bundle files are opened for the minimum scope of each operation; no
/// state is cached between calls, so external modifications are picked
/// up immediately.
#[derive(Clone)]
pub struct FileStore {
    addressbook_path: PathBuf,
    root_path: PathBuf,
    revoked_path: PathBuf,
    user_path: PathBuf,
    password: Option<String>,
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The password stays out of debug output.
        f.debug_struct("FileStore")
            .field("addressbook_path", &self.addressbook_path)
            .field("root_path", &self.root_path)
            .field("revoked_path", &self.revoked_path)
            .field("user_path", &self.user_path)
            .finish_non_exhaustive()
    }
}

impl FileStore {
    /// Construct a store rooted at the default per-user directory.
    ///
    /// The password is required iff the user PKCS#12 file exists.
    pub fn new(password: Option<String>) -> Result<Self, SecureMimeError> {
        let root = default_root()?;

        Ok(Self::with_paths(
            root.join(ADDRESSBOOK_FILE),
            root.join(ROOT_FILE),
            root.join(REVOKED_FILE),
            root.join(USER_FILE),
            password,
        ))
    }

    /// Construct a store over four explicit paths.
    pub fn with_paths(
        addressbook_path: PathBuf,
        root_path: PathBuf,
        revoked_path: PathBuf,
        user_path: PathBuf,
        password: Option<String>,
    ) -> Self {
        Self {
            addressbook_path,
            root_path,
            revoked_path,
            user_path,
            password,
        }
    }

    fn read_certificate_bundle(
        &self,
        path: &Path,
    ) -> Result<Vec<CapturedX509Certificate>, SecureMimeError> {
        if !path.exists() {
            return Ok(vec![]);
        }

        let _lock = FileLock::shared(path)?;
        let data = std::fs::read(path)?;

        if looks_like_pem(&data) {
            Ok(CapturedX509Certificate::from_pem_multiple(&data)?)
        } else {
            split_der_objects(&data)?
                .into_iter()
                .map(|der| CapturedX509Certificate::from_der(der.to_vec()).map_err(Into::into))
                .collect()
        }
    }

    fn load_identity(&self) -> Result<Option<Pkcs12Identity>, SecureMimeError> {
        if !self.user_path.exists() {
            return Ok(None);
        }

        let password = self.password.as_deref().ok_or(SecureMimeError::Argument(
            "a password is required to open the user PKCS#12 file",
        ))?;

        let _lock = FileLock::shared(&self.user_path)?;
        let data = std::fs::read(&self.user_path)?;

        parse_pkcs12(&data, password).map(Some)
    }

    pub(crate) fn all_certificates(
        &self,
    ) -> Result<Vec<CapturedX509Certificate>, SecureMimeError> {
        let mut certificates = self.read_certificate_bundle(&self.addressbook_path)?;

        if let Some(identity) = self.load_identity()? {
            certificates.push(identity.certificate);
            certificates.extend(identity.chain);
        }

        Ok(certificates)
    }

    pub(crate) fn get_certificate(
        &self,
        selector: &CertificateSelector,
    ) -> Result<Option<CapturedX509Certificate>, SecureMimeError> {
        Ok(self
            .all_certificates()?
            .into_iter()
            .find(|cert| selector.matches(cert)))
    }

    pub(crate) fn get_private_key(
        &self,
        selector: &CertificateSelector,
    ) -> Result<Option<PrivateKey>, SecureMimeError> {
        match self.load_identity()? {
            Some(identity) if selector.matches(&identity.certificate) => {
                Ok(Some(identity.private_key))
            }
            _ => Ok(None),
        }
    }

    pub(crate) fn trusted_anchors(&self) -> Result<HashSet<TrustAnchor>, SecureMimeError> {
        Ok(self
            .read_certificate_bundle(&self.root_path)?
            .into_iter()
            .map(TrustAnchor::new)
            .collect())
    }

    pub(crate) fn intermediates(&self) -> Result<Vec<CapturedX509Certificate>, SecureMimeError> {
        self.all_certificates()
    }

    pub(crate) fn crls(&self) -> Result<Vec<CertificateRevocationList>, SecureMimeError> {
        if !self.revoked_path.exists() {
            return Ok(vec![]);
        }

        let _lock = FileLock::shared(&self.revoked_path)?;
        let data = std::fs::read(&self.revoked_path)?;

        split_der_objects(&data)?
            .into_iter()
            .map(|der| CertificateRevocationList::from_der(der.to_vec()).map_err(Into::into))
            .collect()
    }

    pub(crate) fn cms_signer(
        &self,
        mailbox: &Mailbox,
        digest_algorithm: DigestAlgorithm,
    ) -> Result<CmsSigner, SecureMimeError> {
        let identity = self.load_identity()?.ok_or_else(|| {
            SecureMimeError::CertificateNotFound(
                mailbox.address.clone(),
                "no user identity is configured".into(),
            )
        })?;

        if !certificate_matches_address(&identity.certificate, &mailbox.address) {
            return Err(SecureMimeError::CertificateNotFound(
                mailbox.address.clone(),
                "the user identity is bound to a different address".into(),
            ));
        }

        Ok(CmsSigner {
            certificate: identity.certificate,
            private_key: identity.private_key,
            digest_algorithm,
            signed_attributes: vec![],
            unsigned_attributes: vec![],
            chain: identity.chain,
        })
    }

    pub(crate) fn import_certificate(
        &self,
        cert: &CapturedX509Certificate,
    ) -> Result<(), SecureMimeError> {
        self.append_certificate_to(&self.addressbook_path, cert)
    }

    /// Install a certificate as a trust anchor.
    pub fn import_trusted_anchor(
        &self,
        cert: &CapturedX509Certificate,
    ) -> Result<(), SecureMimeError> {
        self.append_certificate_to(&self.root_path, cert)
    }

    fn append_certificate_to(
        &self,
        path: &Path,
        cert: &CapturedX509Certificate,
    ) -> Result<(), SecureMimeError> {
        let _lock = FileLock::exclusive(path)?;

        let existing = if path.exists() {
            std::fs::read(path)?
        } else {
            vec![]
        };

        let fingerprint = sha256_fingerprint(cert);

        let current = if existing.is_empty() {
            vec![]
        } else if looks_like_pem(&existing) {
            CapturedX509Certificate::from_pem_multiple(&existing)?
        } else {
            split_der_objects(&existing)?
                .into_iter()
                .map(|der| CapturedX509Certificate::from_der(der.to_vec()).map_err(Into::into))
                .collect::<Result<Vec<_>, SecureMimeError>>()?
        };

        if current
            .iter()
            .any(|existing| sha256_fingerprint(existing) == fingerprint)
        {
            debug!("certificate already present in {}", path.display());
            return Ok(());
        }

        let mut content = existing;

        if content.is_empty() || looks_like_pem(&content) {
            content.extend_from_slice(cert.encode_pem().as_bytes());
            if !content.ends_with(b"\n") {
                content.push(b'\n');
            }
        } else {
            content.extend_from_slice(cert.constructed_data());
        }

        atomic_write(path, &content)
    }

    pub(crate) fn import_crl(
        &self,
        crl: &CertificateRevocationList,
    ) -> Result<(), SecureMimeError> {
        let _lock = FileLock::exclusive(&self.revoked_path)?;

        let existing = if self.revoked_path.exists() {
            std::fs::read(&self.revoked_path)?
        } else {
            vec![]
        };

        if split_der_objects(&existing)?
            .into_iter()
            .any(|der| der == crl.as_der())
        {
            debug!("CRL already present in {}", self.revoked_path.display());
            return Ok(());
        }

        let mut content = existing;
        content.extend_from_slice(crl.as_der());

        atomic_write(&self.revoked_path, &content)
    }

    pub(crate) fn import_pkcs12(
        &self,
        data: &[u8],
        password: &str,
    ) -> Result<(), SecureMimeError> {
        // Validate the payload (and the password) before touching disk.
        let identity = parse_pkcs12(data, password)?;

        // The chain travels in the user file; correspondent-facing copies
        // of the chain certificates also land in the address book so
        // recipient lookups keep working after the user file is replaced.
        for cert in &identity.chain {
            self.append_certificate_to(&self.addressbook_path, cert)?;
        }

        let _lock = FileLock::exclusive(&self.user_path)?;
        atomic_write(&self.user_path, data)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const ALICE_DER: &[u8] = include_bytes!("../../tests/data/alice.der");
    const BOB_DER: &[u8] = include_bytes!("../../tests/data/bob.der");
    const CA_DER: &[u8] = include_bytes!("../../tests/data/ca.der");
    const ALICE_P12: &[u8] = include_bytes!("../../tests/data/alice.p12");
    const REVOKED_CRL: &[u8] = include_bytes!("../../tests/data/revoked.crl");

    fn scratch_store(dir: &Path, password: Option<&str>) -> FileStore {
        FileStore::with_paths(
            dir.join("addressbook.crt"),
            dir.join("root.crt"),
            dir.join("revoked.crl"),
            dir.join("user.p12"),
            password.map(String::from),
        )
    }

    fn alice() -> CapturedX509Certificate {
        CapturedX509Certificate::from_der(ALICE_DER.to_vec()).unwrap()
    }

    #[test]
    fn import_certificate_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = scratch_store(dir.path(), None);

        store.import_certificate(&alice()).unwrap();
        store.import_certificate(&alice()).unwrap();

        let first = std::fs::read(dir.path().join("addressbook.crt")).unwrap();

        store.import_certificate(&alice()).unwrap();
        let second = std::fs::read(dir.path().join("addressbook.crt")).unwrap();

        assert_eq!(first, second);
        assert_eq!(store.all_certificates().unwrap().len(), 1);
    }

    #[test]
    fn lookup_by_email_after_import() {
        let dir = tempfile::tempdir().unwrap();
        let store = scratch_store(dir.path(), None);

        store.import_certificate(&alice()).unwrap();
        store
            .import_certificate(&CapturedX509Certificate::from_der(BOB_DER.to_vec()).unwrap())
            .unwrap();

        let found = store
            .get_certificate(&CertificateSelector::ByEmail("bob@example.com".into()))
            .unwrap()
            .unwrap();

        assert_eq!(found.constructed_data(), BOB_DER);
    }

    #[test]
    fn crl_import_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = scratch_store(dir.path(), None);

        let crl = CertificateRevocationList::from_der(REVOKED_CRL.to_vec()).unwrap();
        store.import_crl(&crl).unwrap();
        store.import_crl(&crl).unwrap();

        let crls = store.crls().unwrap();
        assert_eq!(crls.len(), 1);
        assert_eq!(crls[0].as_der(), REVOKED_CRL);
    }

    #[test]
    fn pkcs12_identity_loads() {
        let dir = tempfile::tempdir().unwrap();
        let store = scratch_store(dir.path(), Some("no.secret"));

        store.import_pkcs12(ALICE_P12, "no.secret").unwrap();

        let signer = store
            .cms_signer(&Mailbox::from("alice@example.com"), DigestAlgorithm::Sha256)
            .unwrap();

        assert_eq!(signer.certificate.constructed_data(), ALICE_DER);
        // The CA certificate traveled in the bundle.
        assert_eq!(signer.chain.len(), 1);
        assert_eq!(signer.chain[0].constructed_data(), CA_DER);

        let err = store
            .cms_signer(&Mailbox::from("bob@example.com"), DigestAlgorithm::Sha256)
            .unwrap_err();
        assert!(matches!(err, SecureMimeError::CertificateNotFound(..)));
    }

    #[test]
    fn pkcs12_wrong_password() {
        let err = parse_pkcs12(ALICE_P12, "wrong").unwrap_err();

        assert!(matches!(err, SecureMimeError::Pkcs12BadPassword));
    }

    #[test]
    fn private_key_lookup_respects_selector() {
        let dir = tempfile::tempdir().unwrap();
        let store = scratch_store(dir.path(), Some("no.secret"));
        store.import_pkcs12(ALICE_P12, "no.secret").unwrap();

        let cert = alice();
        let selector = CertificateSelector::ByIssuerSerial {
            issuer: cert.issuer_name().clone(),
            serial: cert.serial_number_asn1().clone(),
        };
        assert!(store.get_private_key(&selector).unwrap().is_some());

        let other = CertificateSelector::ByEmail("bob@example.com".into());
        assert!(store.get_private_key(&other).unwrap().is_none());
    }

    #[test]
    fn trust_anchor_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = scratch_store(dir.path(), None);

        let ca = CapturedX509Certificate::from_der(CA_DER.to_vec()).unwrap();
        store.import_trusted_anchor(&ca).unwrap();
        store.import_trusted_anchor(&ca).unwrap();

        let anchors = store.trusted_anchors().unwrap();
        assert_eq!(anchors.len(), 1);
    }

    #[test]
    fn der_bundle_reads() {
        let dir = tempfile::tempdir().unwrap();

        // A raw DER concatenation, as produced by foreign tooling.
        let mut bundle = ALICE_DER.to_vec();
        bundle.extend_from_slice(BOB_DER);
        std::fs::write(dir.path().join("addressbook.crt"), &bundle).unwrap();

        let store = scratch_store(dir.path(), None);
        assert_eq!(store.all_certificates().unwrap().len(), 2);
    }
}
