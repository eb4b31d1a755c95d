// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Signature verification orchestration.

Walks the signer infos of a parsed SignedData, cross-references
certificates, runs path building, and produces one record per signer.
Per-signature failures never abort the overall operation: the collection
always comes back whole, with errors attached to the signatures they
belong to.
*/

use {
    crate::{
        certificate::common_name,
        path::{CertificatePath, PathBuildError, PathBuilder},
        signed_data::{SignedData, SignerInfo},
        store::{CertificateSelector, CertificateStore},
        CmsError, SecureMimeError,
    },
    chrono::{DateTime, Utc},
    log::debug,
    x509_certificate::CapturedX509Certificate,
};

/// The outcome of evaluating one signature over a document.
///
/// Exactly one of [Self::chain] and [Self::chain_error] is populated on a
/// fully processed signature.
#[derive(Debug)]
pub struct DigitalSignature {
    signer_info: SignerInfo,
    creation_date: Option<DateTime<Utc>>,
    signer_certificate: Option<CapturedX509Certificate>,
    chain: Option<CertificatePath>,
    chain_error: Option<PathBuildError>,
    integrity_error: Option<CmsError>,
}

impl DigitalSignature {
    /// The raw signer info this record was derived from.
    pub fn signer_info(&self) -> &SignerInfo {
        &self.signer_info
    }

    /// The signing time asserted by the signer, when present.
    pub fn creation_date(&self) -> Option<DateTime<Utc>> {
        self.creation_date
    }

    /// The certificate that produced this signature, when located.
    pub fn signer_certificate(&self) -> Option<&CapturedX509Certificate> {
        self.signer_certificate.as_ref()
    }

    /// The validated certification path, when trust evaluation succeeded.
    pub fn chain(&self) -> Option<&CertificatePath> {
        self.chain.as_ref()
    }

    /// Why trust evaluation failed, when it did.
    pub fn chain_error(&self) -> Option<&PathBuildError> {
        self.chain_error.as_ref()
    }

    /// Why the cryptographic integrity check failed, when it did.
    pub fn integrity_error(&self) -> Option<&CmsError> {
        self.integrity_error.as_ref()
    }

    /// Whether the signature bytes verify over the signed content.
    ///
    /// This says nothing about trust in the signer; consult
    /// [Self::chain] for that.
    pub fn is_integrity_valid(&self) -> bool {
        self.integrity_error.is_none()
    }
}

pub type DigitalSignatureCollection = Vec<DigitalSignature>;

/// Verify every signature of a parsed SignedData against a store.
///
/// `content` supplies the detached body for external signatures; pass
/// `None` when the content is encapsulated.
///
/// Every certificate and CRL embedded in the payload is mirrored into
/// the store before any signature record is produced, so first contact
/// with a correspondent populates the address book.
pub fn verify_signed_data(
    signed_data: &SignedData,
    content: Option<&[u8]>,
    store: &CertificateStore,
) -> Result<DigitalSignatureCollection, SecureMimeError> {
    for cert in signed_data.certificates() {
        debug!(
            "learning certificate {} from signed payload",
            common_name(cert.subject_name()).unwrap_or_default()
        );
        store.import_certificate(cert)?;
    }

    for crl in signed_data.crls() {
        debug!("learning CRL from signed payload");
        store.import_crl(crl)?;
    }

    let anchors = store.trusted_anchors()?;
    let intermediates = store.intermediates()?;
    let local_crls = store.crls()?;

    let mut signatures = Vec::new();

    for signer in signed_data.signers() {
        let creation_date = signer.signing_time();

        // The payload's own certificates come first; the local store is
        // the fallback. Self-describing mail verifies against an empty
        // address book.
        let signer_certificate = match signed_data
            .certificates()
            .find(|cert| signer.identifier().matches(cert))
        {
            Some(cert) => Some(cert.clone()),
            None => store.get_certificate(&CertificateSelector::from(signer.identifier()))?,
        };

        let integrity_error = match &signer_certificate {
            Some(cert) => check_integrity(signer, signed_data, content, cert).err(),
            None => Some(CmsError::CertificateNotFound),
        };

        let (chain, chain_error) = match &signer_certificate {
            None => (
                None,
                Some(PathBuildError::CertificateNotFound(
                    "not present in the payload or any local store".into(),
                )),
            ),
            Some(cert) => {
                let mut builder = PathBuilder::new(anchors.clone())
                    .intermediates(intermediates.iter().cloned())
                    .intermediates(signed_data.certificates().cloned())
                    .local_crls(local_crls.iter().cloned())
                    .embedded_crls(signed_data.crls().cloned());

                if let Some(time) = creation_date {
                    builder = builder.at_time(time);
                }

                match builder.build(cert) {
                    Ok(chain) => (Some(chain), None),
                    Err(e) => (None, Some(e)),
                }
            }
        };

        signatures.push(DigitalSignature {
            signer_info: signer.clone(),
            creation_date,
            signer_certificate,
            chain,
            chain_error,
            integrity_error,
        });
    }

    Ok(signatures)
}

fn check_integrity(
    signer: &SignerInfo,
    signed_data: &SignedData,
    content: Option<&[u8]>,
    cert: &CapturedX509Certificate,
) -> Result<(), CmsError> {
    let verifier = signer.signature_verifier(std::iter::once(cert))?;
    let signed_content = signer.signed_content(signed_data.signed_content().or(content));

    verifier
        .verify(&signed_content, signer.signature())
        .map_err(|_| CmsError::SignatureVerificationError)?;

    // With signed attributes, the signature only covers the attributes;
    // the content is bound through the message-digest attribute.
    if signer.signed_attributes().is_some() {
        match signed_data.signed_content().or(content) {
            Some(body) => signer.verify_message_digest_with_content(body)?,
            None => return Err(CmsError::MissingContent),
        }
    }

    Ok(())
}
