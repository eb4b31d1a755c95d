// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! High-level interface to parsed CMS SignedData structures.

The types here wrap the raw ASN.1 and expose the operations verification
needs: locating signer certificates, checking signature integrity, and
checking that the digest in the signed attributes matches the content.

Signature integrity alone does not make signed mail trustworthy; trust
evaluation of the signing certificate is the path builder's job.
*/

use {
    crate::{
        asn1::rfc5652::{
            self, OID_CONTENT_TYPE, OID_MESSAGE_DIGEST, OID_SIGNING_TIME,
        },
        certificate::subject_key_identifier,
        crl::CertificateRevocationList,
        CmsError,
    },
    bcder::{Integer, OctetString, Oid},
    ring::{digest::Digest, signature::UnparsedPublicKey},
    std::{collections::HashSet, ops::Deref},
    x509_certificate::{
        asn1time,
        certificate::certificate_is_subset_of,
        rfc3280::Name,
        CapturedX509Certificate, DigestAlgorithm, SignatureAlgorithm,
    },
};

/// Represents a CMS SignedData structure.
///
/// This is the high-level type representing a CMS signature of some data.
/// It contains a description of what was signed, the cryptographic
/// signatures over it, and typically the X.509 certificates (and sometimes
/// CRLs) for the signing keys.
#[derive(Clone, Debug)]
pub struct SignedData {
    /// Content digest algorithms used.
    digest_algorithms: HashSet<DigestAlgorithm>,

    /// Content that was signed, when carried inline (encapsulated mode).
    signed_content: Option<Vec<u8>>,

    /// Certificates embedded within the data structure.
    certificates: Vec<CapturedX509Certificate>,

    /// Revocation lists embedded within the data structure.
    crls: Vec<CertificateRevocationList>,

    /// Describes content signatures.
    signers: Vec<SignerInfo>,
}

impl SignedData {
    /// Construct an instance by parsing BER data.
    pub fn parse_ber(data: &[u8]) -> Result<Self, CmsError> {
        Self::try_from(&rfc5652::SignedData::decode_ber(data)?)
    }

    /// Obtain encapsulated content that was signed.
    ///
    /// This is the defined `encapContentInfo eContent` value.
    pub fn signed_content(&self) -> Option<&[u8]> {
        self.signed_content.as_deref()
    }

    /// Certificates embedded in the structure.
    ///
    /// The parse preserves the original DER of each certificate, so
    /// signatures over them remain verifiable.
    pub fn certificates(&self) -> impl Iterator<Item = &CapturedX509Certificate> {
        self.certificates.iter()
    }

    /// Revocation lists embedded in the structure.
    pub fn crls(&self) -> impl Iterator<Item = &CertificateRevocationList> {
        self.crls.iter()
    }

    /// Obtain signing information attached to this instance.
    ///
    /// Each iterated value represents an entity that cryptographically
    /// signed the content.
    pub fn signers(&self) -> impl Iterator<Item = &SignerInfo> {
        self.signers.iter()
    }

    /// Digest algorithms declared at the SignedData level.
    pub fn digest_algorithms(&self) -> impl Iterator<Item = &DigestAlgorithm> {
        self.digest_algorithms.iter()
    }
}

impl TryFrom<&rfc5652::SignedData> for SignedData {
    type Error = CmsError;

    fn try_from(raw: &rfc5652::SignedData) -> Result<Self, Self::Error> {
        let digest_algorithms = raw
            .digest_algorithms
            .iter()
            .map(crate::algorithm::resolve_digest_algorithm_identifier)
            .collect::<Result<HashSet<_>, CmsError>>()?;

        let signed_content = raw
            .content_info
            .content
            .as_ref()
            .map(|content| content.to_bytes().to_vec());

        let certificates = match &raw.certificates {
            Some(certs) => certs
                .iter()
                .map(|choice| {
                    CapturedX509Certificate::from_der(choice.as_der().to_vec())
                        .map_err(CmsError::X509)
                })
                .collect::<Result<Vec<_>, CmsError>>()?,
            None => vec![],
        };

        let crls = match &raw.crls {
            Some(crls) => crls
                .0
                .iter()
                .map(|captured| CertificateRevocationList::from_der(captured.as_slice().to_vec()))
                .collect::<Result<Vec<_>, CmsError>>()?,
            None => vec![],
        };

        let signers = raw
            .signer_infos
            .iter()
            .map(SignerInfo::try_from)
            .collect::<Result<Vec<_>, CmsError>>()?;

        Ok(Self {
            digest_algorithms,
            signed_content,
            certificates,
            crls,
            signers,
        })
    }
}

/// Identifies the certificate a signer used.
#[derive(Clone, Debug)]
pub enum SignerIdentifier {
    /// The issuer name and serial number of the signing certificate.
    IssuerAndSerialNumber(Name, Integer),

    /// The subject key identifier of the signing certificate.
    SubjectKeyIdentifier(Vec<u8>),
}

impl SignerIdentifier {
    /// Whether the given certificate is the one this identifier names.
    pub fn matches(&self, cert: &CapturedX509Certificate) -> bool {
        match self {
            Self::IssuerAndSerialNumber(issuer, serial) => {
                // We're only locating the certificate here, not validating
                // it; subset matching tolerates extra RDN attributes in the
                // candidate.
                certificate_is_subset_of(serial, issuer, cert.serial_number_asn1(), cert.issuer_name())
            }
            Self::SubjectKeyIdentifier(ski) => {
                subject_key_identifier(cert).as_deref() == Some(ski.as_slice())
            }
        }
    }
}

/// Represents a CMS SignerInfo structure.
///
/// Instances are logically equivalent to a single signed assertion
/// within a SignedData payload. There can be multiple signers per
/// SignedData, which is why this type exists on its own.
#[derive(Clone, Debug)]
pub struct SignerInfo {
    /// How the signing certificate is referenced.
    identifier: SignerIdentifier,

    /// The algorithm used for digesting signed content.
    digest_algorithm: DigestAlgorithm,

    /// Algorithm used for signing the digest.
    signature_algorithm: SignatureAlgorithm,

    /// The cryptographic signature.
    signature: Vec<u8>,

    /// Parsed signed attributes.
    signed_attributes: Option<SignedAttributes>,

    /// DER data constituting the SignedAttributes, re-framed for digesting.
    digested_signed_attributes_data: Option<Vec<u8>>,
}

impl SignerInfo {
    /// How the signer references its certificate.
    pub fn identifier(&self) -> &SignerIdentifier {
        &self.identifier
    }

    /// Obtain the message digest algorithm used by this signer.
    pub fn digest_algorithm(&self) -> DigestAlgorithm {
        self.digest_algorithm
    }

    /// Obtain the cryptographic signing algorithm used by this signer.
    pub fn signature_algorithm(&self) -> SignatureAlgorithm {
        self.signature_algorithm
    }

    /// Obtain the raw bytes constituting the cryptographic signature.
    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// Obtain the `SignedAttributes` attached to this instance.
    pub fn signed_attributes(&self) -> Option<&SignedAttributes> {
        self.signed_attributes.as_ref()
    }

    /// The signing time asserted in the signed attributes, when present.
    ///
    /// The value is an unauthenticated claim by the signer until the
    /// signature over the attributes has been verified.
    pub fn signing_time(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.signed_attributes
            .as_ref()
            .and_then(|attrs| attrs.signing_time)
    }

    /// Verifies the signature defined by this signer given a [SignedData].
    ///
    /// The content that was signed is the encapsulated content combined
    /// with the signed attributes attached to this instance. The signing
    /// certificate must be among the certificates embedded in the
    /// [SignedData].
    pub fn verify_signature_with_signed_data(
        &self,
        signed_data: &SignedData,
    ) -> Result<(), CmsError> {
        let verifier = self.signature_verifier(signed_data.certificates())?;
        let signed_content = self.signed_content_with_signed_data(signed_data);

        verifier
            .verify(&signed_content, self.signature())
            .map_err(|_| CmsError::SignatureVerificationError)
    }

    /// Verifies the digest stored in signed attributes against encapsulated content.
    pub fn verify_message_digest_with_signed_data(
        &self,
        signed_data: &SignedData,
    ) -> Result<(), CmsError> {
        self.verify_message_digest_with_content_option(signed_data.signed_content())
    }

    /// Verifies the digest stored in signed attributes against external content.
    ///
    /// This is the detached-signature variant, where the content never
    /// leaves the caller.
    pub fn verify_message_digest_with_content(&self, content: &[u8]) -> Result<(), CmsError> {
        self.verify_message_digest_with_content_option(Some(content))
    }

    fn verify_message_digest_with_content_option(
        &self,
        content: Option<&[u8]>,
    ) -> Result<(), CmsError> {
        let signed_attributes = self
            .signed_attributes()
            .ok_or(CmsError::NoSignedAttributes)?;

        let wanted_digest: &[u8] = signed_attributes.message_digest.as_ref();
        let got_digest = self.compute_digest(content);

        // Susceptible to a timing side-channel, but the digest is public
        // knowledge derived from public content.
        if wanted_digest == got_digest.as_ref() {
            Ok(())
        } else {
            Err(CmsError::DigestNotEqual)
        }
    }

    /// Obtain an entity for validating the signature described by this instance.
    ///
    /// This attempts to locate the signing certificate in the passed
    /// iterable and constructs a ring verifier from its public key and
    /// the signer's declared algorithms.
    pub fn signature_verifier<'a, C>(
        &self,
        mut certs: C,
    ) -> Result<UnparsedPublicKey<bytes::Bytes>, CmsError>
    where
        C: Iterator<Item = &'a CapturedX509Certificate>,
    {
        let signing_cert = certs
            .find(|cert| self.identifier.matches(cert))
            .ok_or(CmsError::CertificateNotFound)?;

        let key_algorithm = signing_cert
            .key_algorithm()
            .ok_or(CmsError::SignatureVerificationError)?;

        let verification_algorithm = self
            .signature_algorithm
            .resolve_verification_algorithm(key_algorithm)
            .map_err(CmsError::X509)?;

        eprintln!("DEBUG key_algorithm={:?} sig_alg={:?} pubkey_len={}", key_algorithm, self.signature_algorithm, signing_cert.public_key_data().len());

        Ok(UnparsedPublicKey::new(
            verification_algorithm,
            signing_cert.public_key_data(),
        ))
    }

    /// Obtain the raw bytes of content that was signed given a [SignedData].
    pub fn signed_content_with_signed_data(&self, signed_data: &SignedData) -> Vec<u8> {
        self.signed_content(signed_data.signed_content())
    }

    /// Obtain the raw bytes of content that were digested and signed.
    ///
    /// When signed attributes are present, the signature covers their DER
    /// encoding rather than the content itself.
    pub fn signed_content(&self, content: Option<&[u8]>) -> Vec<u8> {
        if let Some(attributes_data) = &self.digested_signed_attributes_data {
            attributes_data.clone()
        } else {
            content.unwrap_or_default().to_vec()
        }
    }

    /// Compute the content digest using the signer's digest algorithm.
    pub fn compute_digest(&self, content: Option<&[u8]>) -> Digest {
        let mut hasher = self.digest_algorithm.digester();

        if let Some(content) = content {
            hasher.update(content);
        }

        hasher.finish()
    }
}

impl TryFrom<&rfc5652::SignerInfo> for SignerInfo {
    type Error = CmsError;

    fn try_from(signer_info: &rfc5652::SignerInfo) -> Result<Self, Self::Error> {
        let identifier = match &signer_info.sid {
            rfc5652::SignerIdentifier::IssuerAndSerialNumber(issuer) => {
                SignerIdentifier::IssuerAndSerialNumber(
                    issuer.issuer.clone(),
                    issuer.serial_number.clone(),
                )
            }
            rfc5652::SignerIdentifier::SubjectKeyIdentifier(ski) => {
                SignerIdentifier::SubjectKeyIdentifier(ski.to_bytes().to_vec())
            }
        };

        let digest_algorithm =
            crate::algorithm::resolve_digest_algorithm_identifier(&signer_info.digest_algorithm)?;
        let signature_algorithm = SignatureAlgorithm::from_oid_and_digest_algorithm(
            &signer_info.signature_algorithm.algorithm,
            digest_algorithm,
        )
        .map_err(CmsError::X509)?;
        let signature = signer_info.signature.to_bytes().to_vec();

        let signed_attributes = signer_info
            .signed_attributes
            .as_ref()
            .map(SignedAttributes::try_from)
            .transpose()?;

        let digested_signed_attributes_data = signer_info.signed_attributes_digested_content()?;

        Ok(SignerInfo {
            identifier,
            digest_algorithm,
            signature_algorithm,
            signature,
            signed_attributes,
            digested_signed_attributes_data,
        })
    }
}

/// Represents the contents of a CMS SignedAttributes structure.
#[derive(Clone, Debug)]
pub struct SignedAttributes {
    /// The content type of the value being signed.
    ///
    /// This is nearly always `id-data`.
    pub content_type: Oid,

    /// Holds the digest of the content that was signed.
    pub message_digest: Vec<u8>,

    /// The time the signature was allegedly created.
    pub signing_time: Option<chrono::DateTime<chrono::Utc>>,
}

impl TryFrom<&rfc5652::SignedAttributes> for SignedAttributes {
    type Error = CmsError;

    fn try_from(attributes: &rfc5652::SignedAttributes) -> Result<Self, Self::Error> {
        // Content type attribute MUST be present with exactly 1 value.
        let content_type = attributes
            .iter()
            .find(|attr| attr.typ == OID_CONTENT_TYPE)
            .ok_or(CmsError::MissingSignedAttributeContentType)?;

        if content_type.values.len() != 1 {
            return Err(CmsError::MalformedSignedAttributeContentType);
        }

        let content_type = content_type
            .values
            .first()
            .unwrap()
            .deref()
            .clone()
            .decode(|cons| Oid::take_from(cons))
            .map_err(|_| CmsError::MalformedSignedAttributeContentType)?;

        // Message digest attribute MUST be present with exactly 1 value.
        let message_digest = attributes
            .iter()
            .find(|attr| attr.typ == OID_MESSAGE_DIGEST)
            .ok_or(CmsError::MissingSignedAttributeMessageDigest)?;

        if message_digest.values.len() != 1 {
            return Err(CmsError::MalformedSignedAttributeMessageDigest);
        }

        let message_digest = message_digest
            .values
            .first()
            .unwrap()
            .deref()
            .clone()
            .decode(|cons| OctetString::take_from(cons))
            .map_err(|_| CmsError::MalformedSignedAttributeMessageDigest)?
            .to_bytes()
            .to_vec();

        // Signing time is optional, but common. Pull it out for convenience.
        let signing_time = attributes
            .iter()
            .find(|attr| attr.typ == OID_SIGNING_TIME)
            .map(|attr| {
                if attr.values.len() != 1 {
                    Err(CmsError::MalformedSignedAttributeSigningTime)
                } else {
                    let time = attr
                        .values
                        .first()
                        .unwrap()
                        .deref()
                        .clone()
                        .decode(|cons| asn1time::Time::take_from(cons))
                        .map_err(|_| CmsError::MalformedSignedAttributeSigningTime)?;

                    Ok(crate::certificate::time_datetime(&time))
                }
            })
            .transpose()?;

        Ok(Self {
            content_type,
            message_digest,
            signing_time,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const SIGNED_DETACHED: &[u8] = include_bytes!("../tests/data/signed-detached.der");
    const SIGNED_ENCAP: &[u8] = include_bytes!("../tests/data/signed-encap.der");
    const HELLO: &[u8] = b"Hello\r\n";

    #[test]
    fn parse_openssl_detached() {
        let signed_data = SignedData::parse_ber(SIGNED_DETACHED).unwrap();

        assert!(signed_data.signed_content().is_none());
        assert_eq!(signed_data.certificates().count(), 2);
        assert_eq!(signed_data.signers().count(), 1);

        for signer in signed_data.signers() {
            signer.verify_message_digest_with_content(HELLO).unwrap();
            signer
                .verify_signature_with_signed_data(&signed_data)
                .unwrap();
            assert!(signer.signing_time().is_some());
        }
    }

    #[test]
    fn parse_openssl_encapsulated() {
        let signed_data = SignedData::parse_ber(SIGNED_ENCAP).unwrap();

        assert_eq!(signed_data.signed_content(), Some(HELLO));

        for signer in signed_data.signers() {
            signer
                .verify_message_digest_with_signed_data(&signed_data)
                .unwrap();
            signer
                .verify_signature_with_signed_data(&signed_data)
                .unwrap();
        }
    }

    #[test]
    fn digest_mismatch_detected() {
        let signed_data = SignedData::parse_ber(SIGNED_DETACHED).unwrap();

        for signer in signed_data.signers() {
            assert!(matches!(
                signer.verify_message_digest_with_content(b"Hello, tampered\r\n"),
                Err(CmsError::DigestNotEqual)
            ));
        }
    }
}
