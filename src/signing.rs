// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Functionality for producing CMS SignedData payloads. */

use {
    crate::{
        asn1::rfc5652::{
            CertificateChoices, CertificateSet, CmsVersion, DigestAlgorithmIdentifier,
            DigestAlgorithmIdentifiers, EncapsulatedContentInfo, IssuerAndSerialNumber, RawDer,
            RevocationInfoChoices, SignatureValue, SignedAttributes, SignedData,
            SignerIdentifier, SignerInfo, SignerInfos, UnsignedAttributes, OID_CONTENT_TYPE,
            OID_ID_DATA, OID_MESSAGE_DIGEST, OID_SIGNING_TIME,
        },
        crl::CertificateRevocationList,
        DigestAlgorithm, SecureMimeError,
    },
    bcder::{
        encode::{PrimitiveContent, Values},
        Captured, Mode, OctetString, Oid,
    },
    bytes::Bytes,
    x509_certificate::{
        asn1time::UtcTime,
        rfc5652::{Attribute, AttributeValue},
        CapturedX509Certificate, InMemorySigningKeyPair, Sign,
    },
};

/// Builder type to construct an entity that will sign some data.
///
/// Instances are attached to [SignedDataBuilder] instances, where they
/// sign data using the configured settings.
pub struct SignerBuilder<'a> {
    /// The cryptographic key pair used for signing content.
    signing_key: &'a InMemorySigningKeyPair,

    /// X.509 certificate used for signing.
    signing_certificate: CapturedX509Certificate,

    /// Content digest algorithm to use.
    digest_algorithm: DigestAlgorithm,

    /// Pre-computed digest of the content being signed.
    ///
    /// Set when the content was digested in streaming fashion (detached
    /// signatures over large bodies). When absent, the digest is computed
    /// from the builder's encapsulated content.
    message_digest: Option<Vec<u8>>,

    /// The content type of the value being signed.
    ///
    /// This is a mandatory field for signed attributes. The default value
    /// is `id-data`.
    content_type: Oid,

    /// Extra attributes to include in the SignedAttributes set.
    extra_signed_attributes: Vec<Attribute>,

    /// Attributes to attach outside the signature envelope.
    extra_unsigned_attributes: Vec<Attribute>,
}

impl<'a> SignerBuilder<'a> {
    /// Construct a new entity that will sign content.
    pub fn new(
        signing_key: &'a InMemorySigningKeyPair,
        signing_certificate: CapturedX509Certificate,
    ) -> Self {
        Self {
            signing_key,
            signing_certificate,
            digest_algorithm: DigestAlgorithm::Sha256,
            message_digest: None,
            content_type: Oid(Bytes::copy_from_slice(OID_ID_DATA.as_ref())),
            extra_signed_attributes: Vec::new(),
            extra_unsigned_attributes: Vec::new(),
        }
    }

    /// The certificate this signer signs with.
    pub fn signing_certificate(&self) -> &CapturedX509Certificate {
        &self.signing_certificate
    }

    /// Define the content digest algorithm.
    #[must_use]
    pub fn digest_algorithm(mut self, algorithm: DigestAlgorithm) -> Self {
        self.digest_algorithm = algorithm;
        self
    }

    /// Provide a pre-computed digest of the content being signed.
    ///
    /// Callers streaming large detached content digest it while reading
    /// and hand the result here instead of buffering the content.
    #[must_use]
    pub fn message_digest(mut self, digest: Vec<u8>) -> Self {
        self.message_digest = Some(digest);
        self
    }

    /// Define the content type of the signed content.
    #[must_use]
    pub fn content_type(mut self, oid: Oid) -> Self {
        self.content_type = oid;
        self
    }

    /// Add an additional attribute to sign.
    #[must_use]
    pub fn signed_attribute(mut self, typ: Oid, values: Vec<AttributeValue>) -> Self {
        self.extra_signed_attributes.push(Attribute { typ, values });
        self
    }

    /// Add an attribute that travels with the signature but is not signed.
    #[must_use]
    pub fn unsigned_attribute(mut self, typ: Oid, values: Vec<AttributeValue>) -> Self {
        self.extra_unsigned_attributes.push(Attribute { typ, values });
        self
    }
}

/// Encapsulated content to sign.
enum SignedContent {
    /// No content is being signed.
    None,

    /// Signed content to be embedded in the signature.
    Inline(Vec<u8>),

    /// Signed content whose digest is captured but which won't be included
    /// in the signature (an RFC 5652 _external signature_).
    External(Vec<u8>),
}

/// Entity for incrementally deriving a SignedData primitive.
///
/// By default the encapsulated content is empty, which doubles as the
/// construction for certs-only payloads: add certificates and no signers
/// and the result is the degenerate SignedData S/MIME uses for
/// certificate export.
pub struct SignedDataBuilder<'a> {
    /// Encapsulated content to sign.
    signed_content: SignedContent,

    /// Entities who will generate signatures.
    signers: Vec<SignerBuilder<'a>>,

    /// X.509 certificates to add to the payload.
    certificates: Vec<CapturedX509Certificate>,

    /// Revocation lists to add to the payload.
    crls: Vec<CertificateRevocationList>,

    /// Whether signers assert a signing-time signed attribute.
    ///
    /// Applied uniformly: either every signer in the document claims a
    /// signing time or none does.
    signing_time: bool,
}

impl<'a> Default for SignedDataBuilder<'a> {
    fn default() -> Self {
        Self {
            signed_content: SignedContent::None,
            signers: vec![],
            certificates: vec![],
            crls: vec![],
            signing_time: true,
        }
    }
}

impl<'a> SignedDataBuilder<'a> {
    /// Define encapsulated content that will be stored inline in the produced signature.
    #[must_use]
    pub fn content_inline(mut self, content: Vec<u8>) -> Self {
        self.signed_content = SignedContent::Inline(content);
        self
    }

    /// Define content that is signed but won't be present in the produced signature.
    ///
    /// The content will be digested and the digest conveyed in the built
    /// signature, but the consumer must retain the original bytes to
    /// verify it.
    #[must_use]
    pub fn content_external(mut self, content: Vec<u8>) -> Self {
        self.signed_content = SignedContent::External(content);
        self
    }

    /// Add a signer.
    #[must_use]
    pub fn signer(mut self, signer: SignerBuilder<'a>) -> Self {
        self.signers.push(signer);
        self
    }

    /// Add a certificate to the payload.
    ///
    /// Duplicates are dropped.
    #[must_use]
    pub fn certificate(mut self, cert: CapturedX509Certificate) -> Self {
        if !self.certificates.iter().any(|x| x == &cert) {
            self.certificates.push(cert);
        }

        self
    }

    /// Add multiple certificates to the payload.
    #[must_use]
    pub fn certificates(mut self, certs: impl Iterator<Item = CapturedX509Certificate>) -> Self {
        for cert in certs {
            if !self.certificates.iter().any(|x| x == &cert) {
                self.certificates.push(cert);
            }
        }

        self
    }

    /// Add a certificate revocation list to the payload.
    #[must_use]
    pub fn crl(mut self, crl: CertificateRevocationList) -> Self {
        if !self.crls.iter().any(|x| x == &crl) {
            self.crls.push(crl);
        }

        self
    }

    /// Control emission of the signing-time signed attribute.
    #[must_use]
    pub fn signing_time(mut self, emit: bool) -> Self {
        self.signing_time = emit;
        self
    }

    /// Construct a DER-encoded ASN.1 document containing a `SignedData` object.
    ///
    /// RFC 5652 says `SignedData` is BER encoded. DER is a stricter subset
    /// of BER, so emitting DER is valid and better defined.
    pub fn build_der(&self) -> Result<Vec<u8>, SecureMimeError> {
        let mut signer_infos = SignerInfos::default();
        let mut seen_digest_algorithms = vec![];
        let mut seen_certificates = self.certificates.clone();

        for signer in &self.signers {
            // Resolving the digest OID fails for representable-but-unsupported
            // algorithms before a single byte is emitted. The resolved OID is
            // what goes on the wire.
            let digest_oid = signer.digest_algorithm.digest_oid_asn1()?;
            let digest_algorithm = signer.digest_algorithm.ring_digest()?;

            if !seen_digest_algorithms.contains(&signer.digest_algorithm) {
                seen_digest_algorithms.push(signer.digest_algorithm);
            }

            if !seen_certificates
                .iter()
                .any(|x| x == &signer.signing_certificate)
            {
                seen_certificates.push(signer.signing_certificate.clone());
            }

            let sid = SignerIdentifier::IssuerAndSerialNumber(IssuerAndSerialNumber {
                issuer: signer.signing_certificate.issuer_name().clone(),
                serial_number: signer.signing_certificate.serial_number_asn1().clone(),
            });

            // The message digest attribute is mandatory. It comes from the
            // streaming override when one was provided, otherwise from the
            // encapsulated content. The digest of empty content is valid
            // when only attributes are signed.
            let digest = if let Some(digest) = &signer.message_digest {
                digest.clone()
            } else {
                let mut hasher = digest_algorithm.digester();

                match &self.signed_content {
                    SignedContent::None => {}
                    SignedContent::Inline(content) | SignedContent::External(content) => {
                        hasher.update(content)
                    }
                }

                hasher.finish().as_ref().to_vec()
            };

            let mut signed_attributes = SignedAttributes::default();

            // The content-type attribute is mandatory.
            signed_attributes.push(Attribute {
                typ: Oid(Bytes::copy_from_slice(OID_CONTENT_TYPE.as_ref())),
                values: vec![AttributeValue::new(Captured::from_values(
                    Mode::Der,
                    signer.content_type.encode_ref(),
                ))],
            });

            // So is the message-digest attribute.
            signed_attributes.push(Attribute {
                typ: Oid(Bytes::copy_from_slice(OID_MESSAGE_DIGEST.as_ref())),
                values: vec![AttributeValue::new(Captured::from_values(
                    Mode::Der,
                    OctetString::new(Bytes::copy_from_slice(&digest)).encode(),
                ))],
            });

            if self.signing_time {
                signed_attributes.push(Attribute {
                    typ: Oid(Bytes::copy_from_slice(OID_SIGNING_TIME.as_ref())),
                    values: vec![AttributeValue::new(Captured::from_values(
                        Mode::Der,
                        UtcTime::now().encode(),
                    ))],
                });
            }

            signed_attributes.extend(signer.extra_signed_attributes.iter().cloned());

            // Signed attributes are DER encoded, and a DER SET OF is
            // sorted. bcder does not do this for us.
            let signed_attributes = signed_attributes.as_sorted()?;

            let unsigned_attributes = if signer.extra_unsigned_attributes.is_empty() {
                None
            } else {
                let mut attributes = UnsignedAttributes::default();
                attributes.extend(signer.extra_unsigned_attributes.iter().cloned());

                Some(attributes.as_sorted()?)
            };

            let mut signer_info = SignerInfo {
                version: CmsVersion::V1,
                sid,
                digest_algorithm: DigestAlgorithmIdentifier {
                    algorithm: digest_oid,
                    parameters: None,
                },
                signed_attributes: Some(signed_attributes),
                signature_algorithm: signer.signing_key.signature_algorithm()?.into(),
                signature: SignatureValue::new(Bytes::new()),
                unsigned_attributes,
                signed_attributes_data: None,
            };

            // The message being signed is the DER encoded signed attributes
            // when they are present, and we always create them above.
            let signed_content = signer_info
                .signed_attributes_digested_content()?
                .expect("signed attributes were just populated");

            let (signature, signature_algorithm) = signer.signing_key.sign(&signed_content)?;

            signer_info.signature = SignatureValue::new(Bytes::from(signature));
            signer_info.signature_algorithm = signature_algorithm.into();

            signer_infos.push(signer_info);
        }

        let mut digest_algorithms = DigestAlgorithmIdentifiers::default();
        for algorithm in seen_digest_algorithms {
            digest_algorithms.push(DigestAlgorithmIdentifier {
                algorithm: algorithm.digest_oid_asn1()?,
                parameters: None,
            });
        }

        // Most consumers prefer issuing certificates to come before the
        // issued, so sort the set in that direction.
        seen_certificates.sort_by(|a, b| a.compare_issuer(b));

        let mut certificates = CertificateSet::default();
        certificates.extend(
            seen_certificates
                .iter()
                .map(|cert| CertificateChoices::Certificate(RawDer::new(cert.constructed_data()))),
        );

        let crls = if self.crls.is_empty() {
            None
        } else {
            Some(RevocationInfoChoices(
                self.crls.iter().map(|crl| RawDer::new(crl.as_der())).collect(),
            ))
        };

        let signed_data = SignedData {
            version: CmsVersion::V1,
            digest_algorithms,
            content_info: EncapsulatedContentInfo {
                content_type: Oid(Bytes::copy_from_slice(OID_ID_DATA.as_ref())),
                content: match &self.signed_content {
                    SignedContent::None | SignedContent::External(_) => None,
                    SignedContent::Inline(content) => {
                        Some(OctetString::new(Bytes::copy_from_slice(content)))
                    }
                },
            },
            certificates: if certificates.is_empty() {
                None
            } else {
                Some(certificates)
            },
            crls,
            signer_infos,
        };

        let mut der = Vec::new();
        signed_data
            .encode_ref()
            .write_encoded(Mode::Der, &mut der)
            .map_err(crate::CmsError::Io)?;

        Ok(der)
    }
}

#[cfg(test)]
mod test {
    use {super::*, crate::signed_data};

    const ALICE_DER: &[u8] = include_bytes!("../tests/data/alice.der");
    const ALICE_PK8: &[u8] = include_bytes!("../tests/data/alice.pk8");
    const CA_DER: &[u8] = include_bytes!("../tests/data/ca.der");

    fn alice() -> (CapturedX509Certificate, InMemorySigningKeyPair) {
        (
            CapturedX509Certificate::from_der(ALICE_DER.to_vec()).unwrap(),
            InMemorySigningKeyPair::from_pkcs8_der(ALICE_PK8).unwrap(),
        )
    }

    #[test]
    fn simple_rsa_signature_inline() {
        let (cert, key) = alice();

        let der = SignedDataBuilder::default()
            .content_inline(b"Hello\r\n".to_vec())
            .certificate(CapturedX509Certificate::from_der(CA_DER.to_vec()).unwrap())
            .signer(SignerBuilder::new(&key, cert))
            .build_der()
            .unwrap();

        let signed_data = signed_data::SignedData::parse_ber(&der).unwrap();
        assert_eq!(signed_data.signed_content(), Some(b"Hello\r\n".as_ref()));
        assert_eq!(signed_data.certificates().count(), 2);

        for signer in signed_data.signers() {
            signer
                .verify_message_digest_with_signed_data(&signed_data)
                .unwrap();
            signer
                .verify_signature_with_signed_data(&signed_data)
                .unwrap();
            assert!(signer.signing_time().is_some());
        }
    }

    #[test]
    fn simple_rsa_signature_external() {
        let (cert, key) = alice();

        let der = SignedDataBuilder::default()
            .content_external(b"Hello\r\n".to_vec())
            .signer(SignerBuilder::new(&key, cert))
            .build_der()
            .unwrap();

        let signed_data = signed_data::SignedData::parse_ber(&der).unwrap();
        assert!(signed_data.signed_content().is_none());

        for signer in signed_data.signers() {
            signer.verify_message_digest_with_content(b"Hello\r\n").unwrap();
            signer
                .verify_signature_with_signed_data(&signed_data)
                .unwrap();
        }
    }

    #[test]
    fn streamed_digest_matches_inline_digest() {
        let (cert, key) = alice();

        let digest = ring::digest::digest(&ring::digest::SHA256, b"Hello\r\n");

        let der = SignedDataBuilder::default()
            .signer(
                SignerBuilder::new(&key, cert).message_digest(digest.as_ref().to_vec()),
            )
            .build_der()
            .unwrap();

        let signed_data = signed_data::SignedData::parse_ber(&der).unwrap();

        for signer in signed_data.signers() {
            signer.verify_message_digest_with_content(b"Hello\r\n").unwrap();
            signer
                .verify_signature_with_signed_data(&signed_data)
                .unwrap();
        }
    }

    #[test]
    fn digest_algorithm_oid_is_pkcs1() {
        let (cert, key) = alice();

        let der = SignedDataBuilder::default()
            .content_inline(b"x".to_vec())
            .signer(SignerBuilder::new(&key, cert))
            .build_der()
            .unwrap();

        let raw = crate::asn1::rfc5652::SignedData::decode_ber(&der).unwrap();

        // The digestAlgorithm fields carry the PKCS #1 signature-with-digest
        // OID from the registry, not the bare digest OID.
        assert_eq!(
            raw.digest_algorithms[0].algorithm.to_string(),
            DigestAlgorithm::Sha256.digest_oid().unwrap()
        );
        assert_eq!(
            raw.signer_infos[0].digest_algorithm.algorithm.to_string(),
            "1.2.840.113549.1.1.11"
        );
    }

    #[test]
    fn custom_attributes_round_trip() {
        let (cert, key) = alice();

        // smime-capabilities, as an arbitrary but realistic attribute type.
        let typ = Oid(Bytes::copy_from_slice(&[42, 134, 72, 134, 247, 13, 1, 9, 15]));
        let value = AttributeValue::new(Captured::from_values(
            Mode::Der,
            OctetString::new(Bytes::from_static(b"caps")).encode(),
        ));

        let der = SignedDataBuilder::default()
            .content_inline(b"x".to_vec())
            .signer(
                SignerBuilder::new(&key, cert)
                    .signed_attribute(typ.clone(), vec![value.clone()])
                    .unsigned_attribute(typ.clone(), vec![value]),
            )
            .build_der()
            .unwrap();

        // The signature covers the extra signed attribute and still verifies.
        let signed_data = signed_data::SignedData::parse_ber(&der).unwrap();
        for signer in signed_data.signers() {
            signer
                .verify_signature_with_signed_data(&signed_data)
                .unwrap();
        }

        let raw = crate::asn1::rfc5652::SignedData::decode_ber(&der).unwrap();
        let info = &raw.signer_infos[0];

        assert!(info
            .signed_attributes
            .as_ref()
            .unwrap()
            .iter()
            .any(|attr| attr.typ == typ));
        assert!(info
            .unsigned_attributes
            .as_ref()
            .unwrap()
            .iter()
            .any(|attr| attr.typ == typ));
    }

    #[test]
    fn signing_time_can_be_omitted() {
        let (cert, key) = alice();

        let der = SignedDataBuilder::default()
            .content_inline(b"x".to_vec())
            .signing_time(false)
            .signer(SignerBuilder::new(&key, cert))
            .build_der()
            .unwrap();

        let signed_data = signed_data::SignedData::parse_ber(&der).unwrap();

        for signer in signed_data.signers() {
            assert!(signer.signing_time().is_none());
            signer
                .verify_signature_with_signed_data(&signed_data)
                .unwrap();
        }
    }

    #[test]
    fn unsupported_digest_fails_before_emission() {
        let (cert, key) = alice();

        let err = SignedDataBuilder::default()
            .content_inline(b"x".to_vec())
            .signer(SignerBuilder::new(&key, cert).digest_algorithm(DigestAlgorithm::Tiger192))
            .build_der()
            .unwrap_err();

        assert!(matches!(err, SecureMimeError::NotSupported(_)));
    }

    #[test]
    fn certs_only_payload() {
        let cert = CapturedX509Certificate::from_der(ALICE_DER.to_vec()).unwrap();

        let der = SignedDataBuilder::default()
            .certificate(cert.clone())
            .build_der()
            .unwrap();

        let signed_data = signed_data::SignedData::parse_ber(&der).unwrap();
        assert_eq!(signed_data.signers().count(), 0);
        assert_eq!(
            signed_data.certificates().next().unwrap().constructed_data(),
            cert.constructed_data()
        );
    }

    #[test]
    fn embedded_crl_round_trips() {
        let (cert, key) = alice();
        let crl = crate::crl::CertificateRevocationList::from_der(
            include_bytes!("../tests/data/revoked.crl").to_vec(),
        )
        .unwrap();

        let der = SignedDataBuilder::default()
            .content_inline(b"x".to_vec())
            .crl(crl.clone())
            .signer(SignerBuilder::new(&key, cert))
            .build_der()
            .unwrap();

        let signed_data = signed_data::SignedData::parse_ber(&der).unwrap();
        let embedded = signed_data.crls().next().unwrap();
        assert_eq!(embedded.as_der(), crl.as_der());

        for signer in signed_data.signers() {
            signer
                .verify_signature_with_signed_data(&signed_data)
                .unwrap();
        }
    }
}
