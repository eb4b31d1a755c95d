// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! The S/MIME operation surface.

[SecureMimeContext] is what the surrounding MIME layer talks to. It
validates arguments, resolves mailboxes through the certificate store,
drives the CMS pipeline, and tags every produced blob with the
[SecureMimeType] the wrapper needs for the `smime-type` parameter.

All operations work on octet streams. Input streams are owned by the
caller and are never closed here. A single context is not re-entrant
during import or decrypt; the backing store is opened write-locked for
those operations.
*/

use {
    crate::{
        certificate::key_encipherment_allowed,
        compress,
        envelope::{EnvelopedData, EnvelopedDataBuilder},
        signed_data::SignedData,
        signing::{SignedDataBuilder, SignerBuilder},
        store::{
            CertificateSelector, CertificateStore, CmsRecipient, CmsSigner, FileStore, Mailbox,
        },
        verify::{verify_signed_data, DigitalSignatureCollection},
        DigestAlgorithm, SecureMimeError, SecureMimeType,
    },
    log::info,
    std::io::{Read, Write},
};

/// MIME type describing detached S/MIME signatures.
pub const SIGNATURE_PROTOCOL: &str = "application/pkcs7-signature";

/// MIME type describing S/MIME encrypted (and encapsulated) parts.
pub const ENCRYPTION_PROTOCOL: &str = "application/pkcs7-mime";

/// MIME type describing S/MIME certificate export parts.
pub const KEY_EXCHANGE_PROTOCOL: &str = "application/pkcs7-keys";

/// An S/MIME cryptography context bound to a certificate store.
pub struct SecureMimeContext {
    store: CertificateStore,
}

/// Seed a [SignerBuilder] from resolved signer material, carrying over
/// the digest choice and any custom signed/unsigned attributes.
fn signer_builder(signer: &CmsSigner) -> SignerBuilder<'_> {
    let mut builder =
        SignerBuilder::new(signer.private_key.signing_key(), signer.certificate.clone())
            .digest_algorithm(signer.digest_algorithm);

    for attribute in &signer.signed_attributes {
        builder = builder.signed_attribute(attribute.typ.clone(), attribute.values.clone());
    }

    for attribute in &signer.unsigned_attributes {
        builder = builder.unsigned_attribute(attribute.typ.clone(), attribute.values.clone());
    }

    builder
}

impl SecureMimeContext {
    /// Construct a context over an explicit store backend.
    pub fn new(store: CertificateStore) -> Self {
        Self { store }
    }

    /// Construct a context over the default file-backed store.
    ///
    /// The password unlocks the user's PKCS#12 file and is required iff
    /// that file exists.
    pub fn with_default_store(password: Option<String>) -> Result<Self, SecureMimeError> {
        Ok(Self::new(CertificateStore::File(FileStore::new(password)?)))
    }

    /// The certificate store this context resolves principals through.
    pub fn store(&self) -> &CertificateStore {
        &self.store
    }

    /// Whether a MIME protocol parameter names a format this context handles.
    ///
    /// An optional `x-` prefix on the subtype is tolerated; comparison is
    /// case-insensitive.
    pub fn supports(&self, protocol: &str) -> bool {
        let (typ, subtype) = match protocol.split_once('/') {
            Some(parts) => parts,
            None => return false,
        };

        if !typ.eq_ignore_ascii_case("application") {
            return false;
        }

        let subtype = if subtype.len() > 2 && subtype[..2].eq_ignore_ascii_case("x-") {
            &subtype[2..]
        } else {
            subtype
        };

        ["pkcs7-signature", "pkcs7-mime", "pkcs7-keys"]
            .iter()
            .any(|known| subtype.eq_ignore_ascii_case(known))
    }

    /// Produce a detached signature over a content stream.
    ///
    /// The content is digested while being read and never buffered. The
    /// resulting CMS SignedData (without encapsulated content) is written
    /// to `output`.
    pub fn sign(
        &self,
        signer: &Mailbox,
        digest_algorithm: DigestAlgorithm,
        content: &mut impl Read,
        output: &mut impl Write,
    ) -> Result<SecureMimeType, SecureMimeError> {
        let signer = self.store.cms_signer(signer, digest_algorithm)?;

        self.sign_detached(&signer, content, output)
    }

    /// Produce a detached signature using pre-resolved signer material.
    pub fn sign_detached(
        &self,
        signer: &CmsSigner,
        content: &mut impl Read,
        output: &mut impl Write,
    ) -> Result<SecureMimeType, SecureMimeError> {
        // Fail for unsupported digests before consuming the stream.
        let digest_algorithm = signer.digest_algorithm.ring_digest()?;

        let mut hasher = digest_algorithm.digester();
        let mut buffer = [0u8; 16384];

        loop {
            let count = content.read(&mut buffer)?;

            if count == 0 {
                break;
            }

            hasher.update(&buffer[..count]);
        }

        let digest = hasher.finish();

        let der = SignedDataBuilder::default()
            .certificates(signer.chain.iter().cloned())
            .signer(signer_builder(signer).message_digest(digest.as_ref().to_vec()))
            .build_der()?;

        output.write_all(&der)?;

        info!("produced detached signature ({} bytes)", der.len());

        Ok(SecureMimeType::SignedData)
    }

    /// Produce a signature with the content encapsulated in the payload.
    pub fn encapsulated_sign(
        &self,
        signer: &Mailbox,
        digest_algorithm: DigestAlgorithm,
        content: &mut impl Read,
        output: &mut impl Write,
    ) -> Result<SecureMimeType, SecureMimeError> {
        let signer = self.store.cms_signer(signer, digest_algorithm)?;

        self.encapsulated_sign_with(&signer, content, output)
    }

    /// Produce an encapsulated signature using pre-resolved signer material.
    pub fn encapsulated_sign_with(
        &self,
        signer: &CmsSigner,
        content: &mut impl Read,
        output: &mut impl Write,
    ) -> Result<SecureMimeType, SecureMimeError> {
        let mut body = Vec::new();
        content.read_to_end(&mut body)?;

        let der = SignedDataBuilder::default()
            .content_inline(body)
            .certificates(signer.chain.iter().cloned())
            .signer(signer_builder(signer))
            .build_der()?;

        output.write_all(&der)?;

        Ok(SecureMimeType::SignedData)
    }

    /// Verify a detached signature over a content stream.
    ///
    /// The content is drained to EOF before any signature record is
    /// produced. Trust failures are reported per signature; this call
    /// only fails for malformed input or store I/O problems.
    pub fn verify(
        &self,
        content: &mut impl Read,
        signature: &[u8],
    ) -> Result<DigitalSignatureCollection, SecureMimeError> {
        let mut body = Vec::new();
        content.read_to_end(&mut body)?;

        let signed_data = SignedData::parse_ber(signature)?;

        verify_signed_data(&signed_data, Some(&body), &self.store)
    }

    /// Verify an encapsulated signature, returning the extracted content.
    ///
    /// The octets are handed back for the caller's entity loader; the
    /// signature records describe who signed them.
    pub fn verify_encapsulated(
        &self,
        input: &mut impl Read,
    ) -> Result<(Vec<u8>, DigitalSignatureCollection), SecureMimeError> {
        let mut blob = Vec::new();
        input.read_to_end(&mut blob)?;

        let signed_data = SignedData::parse_ber(&blob)?;

        let content = signed_data
            .signed_content()
            .ok_or(crate::CmsError::MissingContent)?
            .to_vec();

        let signatures = verify_signed_data(&signed_data, None, &self.store)?;

        Ok((content, signatures))
    }

    /// Encrypt a content stream to a set of resolved recipients.
    pub fn encrypt(
        &self,
        recipients: &[CmsRecipient],
        content: &mut impl Read,
        output: &mut impl Write,
    ) -> Result<SecureMimeType, SecureMimeError> {
        if recipients.is_empty() {
            return Err(SecureMimeError::Argument(
                "encrypting requires at least one recipient",
            ));
        }

        for recipient in recipients {
            if !key_encipherment_allowed(&recipient.certificate) {
                return Err(SecureMimeError::Argument(
                    "recipient certificate is not capable of key encipherment",
                ));
            }
        }

        let mut body = Vec::new();
        content.read_to_end(&mut body)?;

        let mut builder = EnvelopedDataBuilder::default().content(body);

        for recipient in recipients {
            builder = builder.recipient(recipient.certificate.clone(), recipient.identifier_type);
        }

        let der = builder.build_der()?;
        output.write_all(&der)?;

        Ok(SecureMimeType::EnvelopedData)
    }

    /// Encrypt a content stream to mailboxes resolved through the store.
    pub fn encrypt_for(
        &self,
        mailboxes: &[Mailbox],
        content: &mut impl Read,
        output: &mut impl Write,
    ) -> Result<SecureMimeType, SecureMimeError> {
        if mailboxes.is_empty() {
            return Err(SecureMimeError::Argument(
                "encrypting requires at least one recipient",
            ));
        }

        let recipients = mailboxes
            .iter()
            .map(|mailbox| self.store.cms_recipient(mailbox))
            .collect::<Result<Vec<_>, SecureMimeError>>()?;

        self.encrypt(&recipients, content, output)
    }

    /// Decrypt an EnvelopedData blob.
    ///
    /// Recipient infos are tried in order; the first one the store can
    /// produce a private key for opens the envelope. The decrypted octets
    /// are written to `output` for the caller's entity loader. The store
    /// is never modified.
    pub fn decrypt(
        &self,
        input: &mut impl Read,
        output: &mut impl Write,
    ) -> Result<(), SecureMimeError> {
        let mut blob = Vec::new();
        input.read_to_end(&mut blob)?;

        let enveloped = EnvelopedData::parse_ber(&blob)?;

        for recipient in enveloped.recipients() {
            let selector = CertificateSelector::from(recipient.identifier());

            if let Some(private_key) = self.store.get_private_key(&selector)? {
                let content = enveloped.decrypt(recipient, &private_key.rsa_private_key()?)?;
                output.write_all(&content)?;

                return Ok(());
            }
        }

        Err(SecureMimeError::PrivateKeyNotFound)
    }

    /// Compress a content stream into a CompressedData blob.
    pub fn compress(
        &self,
        content: &mut impl Read,
        output: &mut impl Write,
    ) -> Result<SecureMimeType, SecureMimeError> {
        compress::compress(content, output)?;

        Ok(SecureMimeType::CompressedData)
    }

    /// Expand a CompressedData blob back into its content stream.
    pub fn decompress(
        &self,
        input: &mut impl Read,
        output: &mut impl Write,
    ) -> Result<(), SecureMimeError> {
        compress::decompress(input, output)
    }

    /// Export the certificates for a set of mailboxes as a certs-only blob.
    pub fn export(
        &self,
        mailboxes: &[Mailbox],
        output: &mut impl Write,
    ) -> Result<SecureMimeType, SecureMimeError> {
        if mailboxes.is_empty() {
            return Err(SecureMimeError::Argument(
                "exporting requires at least one mailbox",
            ));
        }

        let mut builder = SignedDataBuilder::default();

        for mailbox in mailboxes {
            let cert = self
                .store
                .get_certificate(&CertificateSelector::ByEmail(mailbox.address.clone()))?
                .ok_or_else(|| {
                    SecureMimeError::CertificateNotFound(
                        mailbox.address.clone(),
                        "no certificate for address".into(),
                    )
                })?;

            builder = builder.certificate(cert);
        }

        let der = builder.build_der()?;
        output.write_all(&der)?;

        Ok(SecureMimeType::CertsOnly)
    }

    /// Import the certificates and CRLs of a certs-only blob.
    pub fn import(&self, input: &mut impl Read) -> Result<(), SecureMimeError> {
        let mut blob = Vec::new();
        input.read_to_end(&mut blob)?;

        let signed_data = SignedData::parse_ber(&blob)?;

        for cert in signed_data.certificates() {
            self.store.import_certificate(cert)?;
        }

        for crl in signed_data.crls() {
            self.store.import_crl(crl)?;
        }

        Ok(())
    }

    /// Import a single certificate into the store.
    pub fn import_certificate(
        &self,
        cert: &x509_certificate::CapturedX509Certificate,
    ) -> Result<(), SecureMimeError> {
        self.store.import_certificate(cert)
    }

    /// Import a certificate revocation list into the store.
    pub fn import_crl(
        &self,
        crl: &crate::crl::CertificateRevocationList,
    ) -> Result<(), SecureMimeError> {
        self.store.import_crl(crl)
    }

    /// Import a password-protected PKCS#12 stream into the store.
    pub fn import_pkcs12(
        &self,
        input: &mut impl Read,
        password: &str,
    ) -> Result<(), SecureMimeError> {
        self.store.import_pkcs12(input, password)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn context() -> (SecureMimeContext, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::with_paths(
            dir.path().join("addressbook.crt"),
            dir.path().join("root.crt"),
            dir.path().join("revoked.crl"),
            dir.path().join("user.p12"),
            None,
        );

        (SecureMimeContext::new(CertificateStore::File(store)), dir)
    }

    #[test]
    fn protocol_support() {
        let (ctx, _dir) = context();

        assert!(ctx.supports("application/pkcs7-signature"));
        assert!(ctx.supports("application/pkcs7-mime"));
        assert!(ctx.supports("application/pkcs7-keys"));
        assert!(ctx.supports("application/x-pkcs7-signature"));
        assert!(ctx.supports("APPLICATION/X-PKCS7-MIME"));

        assert!(!ctx.supports("application/pgp-signature"));
        assert!(!ctx.supports("text/plain"));
        assert!(!ctx.supports("pkcs7-signature"));
        assert!(!ctx.supports("application/x-"));
    }

    #[test]
    fn signer_attributes_flow_through() {
        use {
            bcder::{encode::PrimitiveContent, Captured, Mode, OctetString, Oid},
            bytes::Bytes,
            x509_certificate::rfc5652::{Attribute, AttributeValue},
        };

        let (ctx, _dir) = context();

        let typ = Oid(Bytes::copy_from_slice(&[42, 134, 72, 134, 247, 13, 1, 9, 15]));
        let value = AttributeValue::new(Captured::from_values(
            Mode::Der,
            OctetString::new(Bytes::from_static(b"caps")).encode(),
        ));

        let signer = CmsSigner {
            certificate: x509_certificate::CapturedX509Certificate::from_der(
                include_bytes!("../tests/data/alice.der").to_vec(),
            )
            .unwrap(),
            private_key: crate::store::PrivateKey::from_pkcs8_der(
                include_bytes!("../tests/data/alice.pk8").to_vec(),
            )
            .unwrap(),
            digest_algorithm: DigestAlgorithm::Sha256,
            signed_attributes: vec![Attribute {
                typ: typ.clone(),
                values: vec![value.clone()],
            }],
            unsigned_attributes: vec![Attribute {
                typ: typ.clone(),
                values: vec![value],
            }],
            chain: vec![],
        };

        let mut out = Vec::new();
        ctx.sign_detached(&signer, &mut std::io::Cursor::new(b"Hello\r\n"), &mut out)
            .unwrap();

        let raw = crate::asn1::rfc5652::SignedData::decode_ber(&out).unwrap();
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
    fn export_requires_mailboxes() {
        let (ctx, _dir) = context();
        let mut out = Vec::new();

        assert!(matches!(
            ctx.export(&[], &mut out),
            Err(SecureMimeError::Argument(_))
        ));
        assert!(out.is_empty());
    }

    #[test]
    fn encrypt_requires_recipients() {
        let (ctx, _dir) = context();
        let mut out = Vec::new();

        assert!(matches!(
            ctx.encrypt(&[], &mut std::io::Cursor::new(b"x"), &mut out),
            Err(SecureMimeError::Argument(_))
        ));
        assert!(out.is_empty());
    }

    #[test]
    fn encrypt_for_unknown_recipient() {
        let (ctx, _dir) = context();
        let mut out = Vec::new();

        let err = ctx
            .encrypt_for(
                &[Mailbox::from("unknown@example.com")],
                &mut std::io::Cursor::new(b"x"),
                &mut out,
            )
            .unwrap_err();

        assert!(matches!(err, SecureMimeError::CertificateNotFound(..)));
        assert!(out.is_empty());
    }
}
