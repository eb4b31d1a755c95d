// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Functionality for producing and consuming CMS EnvelopedData payloads.

Key transport is RSA PKCS #1 v1.5; content encryption is DES-EDE3-CBC.
The content encryption algorithm is fixed: there is no negotiation from
recipient SMIMECapabilities.
*/

use {
    crate::{
        asn1::rfc5652::{
            self, CmsVersion, ContentEncryptionAlgorithmIdentifier, EncryptedContentInfo,
            EnvelopedData as Asn1EnvelopedData, IssuerAndSerialNumber,
            KeyEncryptionAlgorithmIdentifier, KeyTransRecipientInfo, OID_DES_EDE3_CBC,
            OID_ID_DATA, OID_RSA_ENCRYPTION,
        },
        certificate::subject_key_identifier,
        store::SubjectIdentifierType,
        CmsError, SecureMimeError,
    },
    bcder::{
        encode::Values,
        Integer, Mode, OctetString, Oid,
    },
    bytes::Bytes,
    cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit},
    ring::rand::{SecureRandom, SystemRandom},
    rsa::{pkcs1::DecodeRsaPublicKey, Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey},
    x509_certificate::{certificate::certificate_is_subset_of, rfc3280::Name, CapturedX509Certificate},
};

type Des3CbcEncryptor = cbc::Encryptor<des::TdesEde3>;
type Des3CbcDecryptor = cbc::Decryptor<des::TdesEde3>;

/// Set each key octet to odd parity, as DES key schedules expect.
fn set_des_parity(key: &mut [u8]) {
    for byte in key.iter_mut() {
        let parity = byte.count_ones() % 2;

        if parity == 0 {
            *byte ^= 1;
        }
    }
}

/// Entity for incrementally deriving an EnvelopedData primitive.
pub struct EnvelopedDataBuilder {
    recipients: Vec<(CapturedX509Certificate, SubjectIdentifierType)>,
    content: Vec<u8>,
}

impl Default for EnvelopedDataBuilder {
    fn default() -> Self {
        Self {
            recipients: vec![],
            content: vec![],
        }
    }
}

impl EnvelopedDataBuilder {
    /// Define the plaintext to protect.
    ///
    /// The chosen cipher requires contiguous plaintext, so the content is
    /// materialized.
    #[must_use]
    pub fn content(mut self, content: Vec<u8>) -> Self {
        self.content = content;
        self
    }

    /// Add a recipient who will be able to open the envelope.
    #[must_use]
    pub fn recipient(
        mut self,
        certificate: CapturedX509Certificate,
        identifier_type: SubjectIdentifierType,
    ) -> Self {
        self.recipients.push((certificate, identifier_type));
        self
    }

    /// Construct a DER-encoded ASN.1 document containing an `EnvelopedData` object.
    pub fn build_der(&self) -> Result<Vec<u8>, SecureMimeError> {
        if self.recipients.is_empty() {
            return Err(SecureMimeError::Argument(
                "envelopes require at least one recipient",
            ));
        }

        let rng = SystemRandom::new();

        let mut cek = [0u8; 24];
        rng.fill(&mut cek).map_err(|_| CmsError::Rng)?;
        set_des_parity(&mut cek);

        let mut iv = [0u8; 8];
        rng.fill(&mut iv).map_err(|_| CmsError::Rng)?;

        let encryptor = Des3CbcEncryptor::new_from_slices(&cek, &iv)
            .map_err(|e| CmsError::ContentEncryption(e.to_string()))?;
        let ciphertext = encryptor.encrypt_padded_vec_mut::<Pkcs7>(&self.content);

        let mut all_issuer_serial = true;
        let mut recipient_infos = Vec::with_capacity(self.recipients.len());

        for (certificate, identifier_type) in &self.recipients {
            let public_key = RsaPublicKey::from_pkcs1_der(certificate.public_key_data().as_ref())
                .map_err(|e| CmsError::KeyTransport(e.to_string()))?;

            let encrypted_key = public_key
                .encrypt(&mut rand::thread_rng(), Pkcs1v15Encrypt, &cek)
                .map_err(|e| CmsError::KeyTransport(e.to_string()))?;

            let (version, rid) = match identifier_type {
                SubjectIdentifierType::IssuerAndSerialNumber => (
                    CmsVersion::V0,
                    rfc5652::RecipientIdentifier::IssuerAndSerialNumber(IssuerAndSerialNumber {
                        issuer: certificate.issuer_name().clone(),
                        serial_number: certificate.serial_number_asn1().clone(),
                    }),
                ),
                SubjectIdentifierType::SubjectKeyIdentifier => {
                    let ski = subject_key_identifier(certificate).ok_or(
                        SecureMimeError::Argument(
                            "recipient certificate has no subject key identifier",
                        ),
                    )?;

                    all_issuer_serial = false;

                    (
                        CmsVersion::V2,
                        rfc5652::RecipientIdentifier::SubjectKeyIdentifier(OctetString::new(
                            Bytes::from(ski),
                        )),
                    )
                }
            };

            recipient_infos.push(rfc5652::RecipientInfo::KeyTransRecipientInfo(
                KeyTransRecipientInfo {
                    version,
                    rid,
                    key_encryption_algorithm: KeyEncryptionAlgorithmIdentifier {
                        algorithm: Oid(Bytes::copy_from_slice(OID_RSA_ENCRYPTION.as_ref())),
                    },
                    encrypted_key: OctetString::new(Bytes::from(encrypted_key)),
                },
            ));
        }

        let enveloped = Asn1EnvelopedData {
            version: if all_issuer_serial {
                CmsVersion::V0
            } else {
                CmsVersion::V2
            },
            originator_info: None,
            recipient_infos,
            encrypted_content_info: EncryptedContentInfo {
                content_type: Oid(Bytes::copy_from_slice(OID_ID_DATA.as_ref())),
                content_encryption_algorithm: ContentEncryptionAlgorithmIdentifier {
                    algorithm: Oid(Bytes::copy_from_slice(OID_DES_EDE3_CBC.as_ref())),
                    iv: OctetString::new(Bytes::copy_from_slice(&iv)),
                },
                encrypted_content: Some(OctetString::new(Bytes::from(ciphertext))),
            },
        };

        let mut der = Vec::new();
        enveloped
            .encode_ref()
            .write_encoded(Mode::Der, &mut der)
            .map_err(CmsError::Io)?;

        Ok(der)
    }
}

/// Identifies the certificate whose key a RecipientInfo is encrypted to.
#[derive(Clone, Debug)]
pub enum RecipientIdentifier {
    IssuerAndSerialNumber(Name, Integer),
    SubjectKeyIdentifier(Vec<u8>),
}

impl RecipientIdentifier {
    /// Whether the given certificate is the one this identifier names.
    pub fn matches(&self, cert: &CapturedX509Certificate) -> bool {
        match self {
            Self::IssuerAndSerialNumber(issuer, serial) => {
                certificate_is_subset_of(serial, issuer, cert.serial_number_asn1(), cert.issuer_name())
            }
            Self::SubjectKeyIdentifier(ski) => {
                subject_key_identifier(cert).as_deref() == Some(ski.as_slice())
            }
        }
    }
}

/// One key-transport recipient of an envelope.
#[derive(Clone, Debug)]
pub struct RecipientInfo {
    identifier: RecipientIdentifier,
    key_encryption_algorithm: Oid,
    encrypted_key: Vec<u8>,
}

impl RecipientInfo {
    /// How the recipient's certificate is referenced.
    pub fn identifier(&self) -> &RecipientIdentifier {
        &self.identifier
    }
}

/// Represents a parsed CMS EnvelopedData structure.
#[derive(Clone, Debug)]
pub struct EnvelopedData {
    recipients: Vec<RecipientInfo>,
    content_encryption_algorithm: Oid,
    iv: Vec<u8>,
    encrypted_content: Vec<u8>,
}

impl EnvelopedData {
    /// Construct an instance by parsing BER data.
    pub fn parse_ber(data: &[u8]) -> Result<Self, CmsError> {
        let raw = Asn1EnvelopedData::decode_ber(data)?;

        let recipients = raw
            .recipient_infos
            .iter()
            .map(|info| {
                let rfc5652::RecipientInfo::KeyTransRecipientInfo(ktri) = info;

                let identifier = match &ktri.rid {
                    rfc5652::RecipientIdentifier::IssuerAndSerialNumber(issuer) => {
                        RecipientIdentifier::IssuerAndSerialNumber(
                            issuer.issuer.clone(),
                            issuer.serial_number.clone(),
                        )
                    }
                    rfc5652::RecipientIdentifier::SubjectKeyIdentifier(ski) => {
                        RecipientIdentifier::SubjectKeyIdentifier(ski.to_bytes().to_vec())
                    }
                };

                RecipientInfo {
                    identifier,
                    key_encryption_algorithm: ktri.key_encryption_algorithm.algorithm.clone(),
                    encrypted_key: ktri.encrypted_key.to_bytes().to_vec(),
                }
            })
            .collect();

        let encrypted_content = raw
            .encrypted_content_info
            .encrypted_content
            .as_ref()
            .ok_or(CmsError::MissingEncryptedContent)?
            .to_bytes()
            .to_vec();

        Ok(Self {
            recipients,
            content_encryption_algorithm: raw
                .encrypted_content_info
                .content_encryption_algorithm
                .algorithm
                .clone(),
            iv: raw
                .encrypted_content_info
                .content_encryption_algorithm
                .iv
                .to_bytes()
                .to_vec(),
            encrypted_content,
        })
    }

    /// The recipients able to open this envelope.
    pub fn recipients(&self) -> impl Iterator<Item = &RecipientInfo> {
        self.recipients.iter()
    }

    /// Decrypt the content using a recipient's RSA private key.
    ///
    /// The recipient info must belong to this envelope; its encrypted key
    /// is opened with the given private key and the result used to decrypt
    /// the content.
    pub fn decrypt(
        &self,
        recipient: &RecipientInfo,
        private_key: &RsaPrivateKey,
    ) -> Result<Vec<u8>, CmsError> {
        if recipient.key_encryption_algorithm != OID_RSA_ENCRYPTION {
            return Err(CmsError::UnsupportedAlgorithm(format!(
                "key encryption algorithm {}",
                recipient.key_encryption_algorithm
            )));
        }

        if self.content_encryption_algorithm != OID_DES_EDE3_CBC {
            return Err(CmsError::UnsupportedAlgorithm(format!(
                "content encryption algorithm {}",
                self.content_encryption_algorithm
            )));
        }

        let cek = private_key
            .decrypt(Pkcs1v15Encrypt, &recipient.encrypted_key)
            .map_err(|e| CmsError::KeyTransport(e.to_string()))?;

        let decryptor = Des3CbcDecryptor::new_from_slices(&cek, &self.iv)
            .map_err(|e| CmsError::ContentDecryption(e.to_string()))?;

        decryptor
            .decrypt_padded_vec_mut::<Pkcs7>(&self.encrypted_content)
            .map_err(|e| CmsError::ContentDecryption(e.to_string()))
    }
}

#[cfg(test)]
mod test {
    use {super::*, rsa::pkcs8::DecodePrivateKey};

    const BOB_DER: &[u8] = include_bytes!("../tests/data/bob.der");
    const BOB_PK8: &[u8] = include_bytes!("../tests/data/bob.pk8");
    const ALICE_PK8: &[u8] = include_bytes!("../tests/data/alice.pk8");
    const OPENSSL_ENVELOPED: &[u8] = include_bytes!("../tests/data/enveloped.der");

    fn bob_cert() -> CapturedX509Certificate {
        CapturedX509Certificate::from_der(BOB_DER.to_vec()).unwrap()
    }

    fn bob_key() -> RsaPrivateKey {
        RsaPrivateKey::from_pkcs8_der(BOB_PK8).unwrap()
    }

    #[test]
    fn roundtrip() {
        let der = EnvelopedDataBuilder::default()
            .content(b"secret".to_vec())
            .recipient(bob_cert(), SubjectIdentifierType::IssuerAndSerialNumber)
            .build_der()
            .unwrap();

        let enveloped = EnvelopedData::parse_ber(&der).unwrap();
        let recipient = enveloped
            .recipients()
            .find(|info| info.identifier().matches(&bob_cert()))
            .unwrap();

        assert_eq!(enveloped.decrypt(recipient, &bob_key()).unwrap(), b"secret");
    }

    #[test]
    fn roundtrip_subject_key_identifier() {
        let der = EnvelopedDataBuilder::default()
            .content(b"secret".to_vec())
            .recipient(bob_cert(), SubjectIdentifierType::SubjectKeyIdentifier)
            .build_der()
            .unwrap();

        let enveloped = EnvelopedData::parse_ber(&der).unwrap();
        let recipient = enveloped
            .recipients()
            .find(|info| info.identifier().matches(&bob_cert()))
            .unwrap();

        assert!(matches!(
            recipient.identifier(),
            RecipientIdentifier::SubjectKeyIdentifier(_)
        ));
        assert_eq!(enveloped.decrypt(recipient, &bob_key()).unwrap(), b"secret");
    }

    #[test]
    fn decrypt_openssl_envelope() {
        let enveloped = EnvelopedData::parse_ber(OPENSSL_ENVELOPED).unwrap();
        let recipient = enveloped
            .recipients()
            .find(|info| info.identifier().matches(&bob_cert()))
            .unwrap();

        assert_eq!(enveloped.decrypt(recipient, &bob_key()).unwrap(), b"secret");
    }

    #[test]
    fn wrong_key_fails() {
        let enveloped = EnvelopedData::parse_ber(OPENSSL_ENVELOPED).unwrap();
        let recipient = enveloped.recipients().next().unwrap();
        let alice_key = RsaPrivateKey::from_pkcs8_der(ALICE_PK8).unwrap();

        assert!(enveloped.decrypt(recipient, &alice_key).is_err());
    }

    #[test]
    fn zero_recipients_rejected() {
        let err = EnvelopedDataBuilder::default()
            .content(b"secret".to_vec())
            .build_der()
            .unwrap_err();

        assert!(matches!(err, SecureMimeError::Argument(_)));
    }
}
