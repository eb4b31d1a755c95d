// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Certificate store backends.

A store resolves mailbox-addressed principals to signing and recipient
material and holds the local trust state: anchors, intermediates, and
revocation lists. Two backends exist: the default file-backed store and
a host-OS store on Windows. Dispatch is a two-variant enum rather than a
trait object; the call sites are hot paths during verification and there
is no third backend on the horizon.
*/

use {
    crate::{
        certificate::{
            certificate_matches_address, key_encipherment_allowed, sha256_fingerprint,
            subject_key_identifier,
        },
        crl::CertificateRevocationList,
        DigestAlgorithm, SecureMimeError,
    },
    bcder::Integer,
    std::{
        collections::HashSet,
        fmt::{Debug, Formatter},
        hash::{Hash, Hasher},
        io::Read,
    },
    x509_certificate::{
        certificate::certificate_is_subset_of, rfc3280::Name, rfc5652::Attribute,
        CapturedX509Certificate, InMemorySigningKeyPair,
    },
};

pub mod file;
#[cfg(windows)]
pub mod os;

pub use file::FileStore;
#[cfg(windows)]
pub use os::OsStore;

/// An addressable mail principal.
///
/// Only the address-spec participates in certificate matching; the display
/// name is carried for diagnostics.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Mailbox {
    pub name: Option<String>,
    pub address: String,
}

impl Mailbox {
    pub fn new(name: Option<String>, address: impl Into<String>) -> Self {
        Self {
            name,
            address: address.into(),
        }
    }
}

impl From<&str> for Mailbox {
    fn from(address: &str) -> Self {
        Self::new(None, address)
    }
}

impl std::fmt::Display for Mailbox {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} <{}>", name, self.address),
            None => f.write_str(&self.address),
        }
    }
}

/// Which CMS RecipientIdentifier variant to emit for a recipient.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SubjectIdentifierType {
    IssuerAndSerialNumber,
    SubjectKeyIdentifier,
}

impl Default for SubjectIdentifierType {
    fn default() -> Self {
        Self::IssuerAndSerialNumber
    }
}

/// A predicate uniquely identifying an X.509 certificate.
///
/// Expressed as a closed sum so backends can index rather than run an
/// opaque callback per candidate.
#[derive(Clone, Debug)]
pub enum CertificateSelector {
    /// Match on the subject distinguished name.
    BySubject(Name),

    /// Match on issuer distinguished name plus serial number.
    ByIssuerSerial { issuer: Name, serial: Integer },

    /// Match on the subject key identifier extension.
    BySubjectKeyIdentifier(Vec<u8>),

    /// Match on a bound email address, case-insensitively.
    ByEmail(String),
}

impl CertificateSelector {
    /// Whether a certificate satisfies this selector.
    pub fn matches(&self, cert: &CapturedX509Certificate) -> bool {
        match self {
            Self::BySubject(subject) => cert.subject_name() == subject,
            Self::ByIssuerSerial { issuer, serial } => {
                certificate_is_subset_of(serial, issuer, cert.serial_number_asn1(), cert.issuer_name())
            }
            Self::BySubjectKeyIdentifier(ski) => {
                subject_key_identifier(cert).as_deref() == Some(ski.as_slice())
            }
            Self::ByEmail(address) => certificate_matches_address(cert, address),
        }
    }
}

impl From<&crate::signed_data::SignerIdentifier> for CertificateSelector {
    fn from(identifier: &crate::signed_data::SignerIdentifier) -> Self {
        match identifier {
            crate::signed_data::SignerIdentifier::IssuerAndSerialNumber(issuer, serial) => {
                Self::ByIssuerSerial {
                    issuer: issuer.clone(),
                    serial: serial.clone(),
                }
            }
            crate::signed_data::SignerIdentifier::SubjectKeyIdentifier(ski) => {
                Self::BySubjectKeyIdentifier(ski.clone())
            }
        }
    }
}

impl From<&crate::envelope::RecipientIdentifier> for CertificateSelector {
    fn from(identifier: &crate::envelope::RecipientIdentifier) -> Self {
        match identifier {
            crate::envelope::RecipientIdentifier::IssuerAndSerialNumber(issuer, serial) => {
                Self::ByIssuerSerial {
                    issuer: issuer.clone(),
                    serial: serial.clone(),
                }
            }
            crate::envelope::RecipientIdentifier::SubjectKeyIdentifier(ski) => {
                Self::BySubjectKeyIdentifier(ski.clone())
            }
        }
    }
}

/// A private key held by a store.
///
/// Signing goes through ring; RSA key transport decryption goes through
/// the `rsa` crate. Both views are derived from the same PKCS#8 document.
pub struct PrivateKey {
    pkcs8_der: Vec<u8>,
    pair: InMemorySigningKeyPair,
}

impl PrivateKey {
    /// Construct an instance from PKCS#8 DER data.
    pub fn from_pkcs8_der(data: Vec<u8>) -> Result<Self, SecureMimeError> {
        let pair = InMemorySigningKeyPair::from_pkcs8_der(&data)?;

        Ok(Self {
            pkcs8_der: data,
            pair,
        })
    }

    /// The ring-backed signing view of this key.
    pub fn signing_key(&self) -> &InMemorySigningKeyPair {
        &self.pair
    }

    /// The PKCS#8 DER document backing this key.
    pub(crate) fn pkcs8_der(&self) -> &[u8] {
        &self.pkcs8_der
    }

    /// The RSA decryption view of this key.
    ///
    /// Fails for non-RSA keys, which cannot open key-transport envelopes.
    pub fn rsa_private_key(&self) -> Result<rsa::RsaPrivateKey, SecureMimeError> {
        use rsa::pkcs8::DecodePrivateKey;

        rsa::RsaPrivateKey::from_pkcs8_der(&self.pkcs8_der)
            .map_err(|e| SecureMimeError::NotSupported(format!("not an RSA private key: {}", e)))
    }

    /// The public key bytes corresponding to this private key.
    pub fn public_key_data(&self) -> bytes::Bytes {
        use x509_certificate::Sign;

        self.pair.public_key_data()
    }
}

impl Debug for PrivateKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of logs.
        f.debug_struct("PrivateKey").finish_non_exhaustive()
    }
}

/// Recipient material for one Encrypt operation.
///
/// Constructed per recipient per operation; not persisted.
#[derive(Clone, Debug)]
pub struct CmsRecipient {
    pub certificate: CapturedX509Certificate,
    pub identifier_type: SubjectIdentifierType,
}

impl CmsRecipient {
    pub fn new(certificate: CapturedX509Certificate) -> Self {
        Self {
            certificate,
            identifier_type: SubjectIdentifierType::default(),
        }
    }
}

/// Signer material assembled from a mailbox and preferred digest.
///
/// A signer always carries both a certificate and a private key; the
/// argument errors the original raises for null members cannot occur
/// here.
#[derive(Debug)]
pub struct CmsSigner {
    pub certificate: CapturedX509Certificate,
    pub private_key: PrivateKey,
    pub digest_algorithm: DigestAlgorithm,

    /// Extra attributes to cover with the signature, beyond the mandatory
    /// content-type/message-digest pair and the signing time.
    pub signed_attributes: Vec<Attribute>,

    /// Attributes attached to the signature without being signed.
    pub unsigned_attributes: Vec<Attribute>,

    /// The rest of the certificate chain stored with the identity, for
    /// embedding alongside the signer certificate.
    pub chain: Vec<CapturedX509Certificate>,
}

/// A certificate accepted as a root of trust.
///
/// Equality and hashing are by certificate fingerprint, so anchor sets
/// deduplicate across load paths.
#[derive(Clone, Debug)]
pub struct TrustAnchor {
    certificate: CapturedX509Certificate,
    fingerprint: Vec<u8>,
}

impl TrustAnchor {
    pub fn new(certificate: CapturedX509Certificate) -> Self {
        let fingerprint = sha256_fingerprint(&certificate);

        Self {
            certificate,
            fingerprint,
        }
    }

    pub fn certificate(&self) -> &CapturedX509Certificate {
        &self.certificate
    }
}

impl PartialEq for TrustAnchor {
    fn eq(&self, other: &Self) -> bool {
        self.fingerprint == other.fingerprint
    }
}

impl Eq for TrustAnchor {}

impl Hash for TrustAnchor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.fingerprint.hash(state);
    }
}

/// A certificate store backend.
pub enum CertificateStore {
    /// Material persisted in per-user bundle files.
    File(FileStore),

    /// Material held by the host operating system's certificate store.
    #[cfg(windows)]
    Os(OsStore),
}

impl CertificateStore {
    /// Locate a certificate matching a selector.
    pub fn get_certificate(
        &self,
        selector: &CertificateSelector,
    ) -> Result<Option<CapturedX509Certificate>, SecureMimeError> {
        match self {
            Self::File(store) => store.get_certificate(selector),
            #[cfg(windows)]
            Self::Os(store) => store.get_certificate(selector),
        }
    }

    /// Locate a private key for a certificate matching a selector.
    pub fn get_private_key(
        &self,
        selector: &CertificateSelector,
    ) -> Result<Option<PrivateKey>, SecureMimeError> {
        match self {
            Self::File(store) => store.get_private_key(selector),
            #[cfg(windows)]
            Self::Os(store) => store.get_private_key(selector),
        }
    }

    /// Obtain the set of trusted anchors.
    pub fn trusted_anchors(&self) -> Result<HashSet<TrustAnchor>, SecureMimeError> {
        match self {
            Self::File(store) => store.trusted_anchors(),
            #[cfg(windows)]
            Self::Os(store) => store.trusted_anchors(),
        }
    }

    /// Obtain candidate intermediate certificates for path building.
    pub fn intermediates(&self) -> Result<Vec<CapturedX509Certificate>, SecureMimeError> {
        match self {
            Self::File(store) => store.intermediates(),
            #[cfg(windows)]
            Self::Os(store) => store.intermediates(),
        }
    }

    /// Obtain the local certificate revocation lists.
    pub fn crls(&self) -> Result<Vec<CertificateRevocationList>, SecureMimeError> {
        match self {
            Self::File(store) => store.crls(),
            #[cfg(windows)]
            Self::Os(store) => store.crls(),
        }
    }

    /// Resolve recipient material for a mailbox.
    ///
    /// The resolved certificate must be capable of key encipherment.
    pub fn cms_recipient(&self, mailbox: &Mailbox) -> Result<CmsRecipient, SecureMimeError> {
        let candidates = match self {
            Self::File(store) => store.all_certificates()?,
            #[cfg(windows)]
            Self::Os(store) => store.all_certificates()?,
        };

        candidates
            .into_iter()
            .find(|cert| {
                certificate_matches_address(cert, &mailbox.address)
                    && key_encipherment_allowed(cert)
            })
            .map(CmsRecipient::new)
            .ok_or_else(|| {
                SecureMimeError::CertificateNotFound(
                    mailbox.address.clone(),
                    "no key-encipherment-capable certificate for address".into(),
                )
            })
    }

    /// Resolve signer material for a mailbox and preferred digest.
    pub fn cms_signer(
        &self,
        mailbox: &Mailbox,
        digest_algorithm: DigestAlgorithm,
    ) -> Result<CmsSigner, SecureMimeError> {
        match self {
            Self::File(store) => store.cms_signer(mailbox, digest_algorithm),
            #[cfg(windows)]
            Self::Os(store) => store.cms_signer(mailbox, digest_algorithm),
        }
    }

    /// Import a certificate into the backing store.
    ///
    /// Re-importing a certificate already present is a no-op.
    pub fn import_certificate(
        &self,
        cert: &CapturedX509Certificate,
    ) -> Result<(), SecureMimeError> {
        match self {
            Self::File(store) => store.import_certificate(cert),
            #[cfg(windows)]
            Self::Os(store) => store.import_certificate(cert),
        }
    }

    /// Import a certificate revocation list into the backing store.
    pub fn import_crl(&self, crl: &CertificateRevocationList) -> Result<(), SecureMimeError> {
        match self {
            Self::File(store) => store.import_crl(crl),
            #[cfg(windows)]
            Self::Os(store) => store.import_crl(crl),
        }
    }

    /// Import a password-protected PKCS#12 bundle.
    pub fn import_pkcs12(
        &self,
        reader: &mut impl Read,
        password: &str,
    ) -> Result<(), SecureMimeError> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;

        match self {
            Self::File(store) => store.import_pkcs12(&data, password),
            #[cfg(windows)]
            Self::Os(store) => store.import_pkcs12(&data, password),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const ALICE_DER: &[u8] = include_bytes!("../../tests/data/alice.der");
    const CA_DER: &[u8] = include_bytes!("../../tests/data/ca.der");

    fn alice() -> CapturedX509Certificate {
        CapturedX509Certificate::from_der(ALICE_DER.to_vec()).unwrap()
    }

    #[test]
    fn selector_by_email() {
        let selector = CertificateSelector::ByEmail("Alice@Example.com".into());
        assert!(selector.matches(&alice()));

        let selector = CertificateSelector::ByEmail("bob@example.com".into());
        assert!(!selector.matches(&alice()));
    }

    #[test]
    fn selector_by_issuer_serial() {
        let cert = alice();
        let selector = CertificateSelector::ByIssuerSerial {
            issuer: cert.issuer_name().clone(),
            serial: cert.serial_number_asn1().clone(),
        };
        assert!(selector.matches(&cert));

        let ca = CapturedX509Certificate::from_der(CA_DER.to_vec()).unwrap();
        assert!(!selector.matches(&ca));
    }

    #[test]
    fn selector_by_subject() {
        let cert = alice();
        let selector = CertificateSelector::BySubject(cert.subject_name().clone());
        assert!(selector.matches(&cert));
    }

    #[test]
    fn selector_by_ski() {
        let cert = alice();
        let ski = crate::certificate::subject_key_identifier(&cert).unwrap();
        assert!(CertificateSelector::BySubjectKeyIdentifier(ski).matches(&cert));
        assert!(!CertificateSelector::BySubjectKeyIdentifier(vec![1, 2, 3]).matches(&cert));
    }

    #[test]
    fn trust_anchor_identity() {
        let a = TrustAnchor::new(alice());
        let b = TrustAnchor::new(alice());
        let ca = TrustAnchor::new(CapturedX509Certificate::from_der(CA_DER.to_vec()).unwrap());

        let mut set = HashSet::new();
        set.insert(a);
        set.insert(b);
        set.insert(ca);

        assert_eq!(set.len(), 2);
    }
}
