// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! S/MIME cryptography in Rust.

This crate implements the cryptographic core of S/MIME mail protection:
generating and consuming CMS (RFC 5652) protected objects — signed,
encrypted, compressed, and certificate-export payloads — and evaluating
trust in the X.509 certificates that produced them.

Functionality includes:

* A streaming generator/parser layer converting message bodies into and
  out of CMS structures (`SignedData`, `EnvelopedData`, `CompressedData`,
  certs-only `SignedData`).
* PKIX certification path building against a local trust store, with
  revocation checking from CRL bundles and validity evaluated under the
  chain model (archived signatures keep verifying after roots expire).
* A certificate store abstraction resolving mailbox-addressed principals
  to signing and recipient material, backed by per-user files or, on
  Windows, the host certificate store.

What this crate does NOT do is parse or produce MIME itself. Operations
accept and return raw octet streams plus a [SecureMimeType] tag; the
surrounding MIME layer owns `application/pkcs7-mime` framing, transfer
encoding, and entity loading.

# Example

```no_run
use secure_mime::{DigestAlgorithm, Mailbox, SecureMimeContext};

let context = SecureMimeContext::with_default_store(Some("password".into()))?;

let mut content = std::io::Cursor::new(b"Hello\r\n".to_vec());
let mut signature = Vec::new();

context.sign(
    &Mailbox::from("alice@example.com"),
    DigestAlgorithm::Sha256,
    &mut content,
    &mut signature,
)?;
# Ok::<(), secure_mime::SecureMimeError>(())
```
*/

pub mod algorithm;
pub mod asn1;
pub mod certificate;
pub mod compress;
pub mod context;
pub mod crl;
pub mod envelope;
pub mod path;
pub mod signed_data;
pub mod signing;
pub mod store;
pub mod verify;

pub use {
    algorithm::DigestAlgorithm,
    context::{
        SecureMimeContext, ENCRYPTION_PROTOCOL, KEY_EXCHANGE_PROTOCOL, SIGNATURE_PROTOCOL,
    },
    crl::CertificateRevocationList,
    envelope::{EnvelopedData, EnvelopedDataBuilder},
    path::{CertificatePath, PathBuildError, PathBuilder},
    signed_data::SignedData,
    signing::{SignedDataBuilder, SignerBuilder},
    store::{
        CertificateSelector, CertificateStore, CmsRecipient, CmsSigner, FileStore, Mailbox,
        PrivateKey, SubjectIdentifierType, TrustAnchor,
    },
    verify::{DigitalSignature, DigitalSignatureCollection},
};

use thiserror::Error;

/// Which CMS structure a produced payload carries.
///
/// Emitted alongside output octets so the MIME wrapper can set the
/// `smime-type` parameter.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SecureMimeType {
    Data,
    SignedData,
    EnvelopedData,
    CompressedData,
    CertsOnly,
}

impl SecureMimeType {
    /// The `smime-type` parameter value for this payload kind.
    pub fn smime_type(&self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::SignedData => "signed-data",
            Self::EnvelopedData => "enveloped-data",
            Self::CompressedData => "compressed-data",
            Self::CertsOnly => "certs-only",
        }
    }

    /// Sniff the payload kind of a CMS blob from its ContentInfo.
    ///
    /// Useful when a part arrives without an `smime-type` parameter.
    /// Returns `None` when the data is not a CMS structure this crate
    /// recognizes. Signed payloads without signers report
    /// [Self::CertsOnly].
    pub fn detect(data: &[u8]) -> Option<Self> {
        use bcder::decode::Constructed;

        let content_info = Constructed::decode(data, bcder::Mode::Ber, |cons| {
            asn1::rfc5652::ContentInfo::take_from(cons)
        })
        .ok()?;

        if content_info.content_type == asn1::rfc5652::OID_ID_SIGNED_DATA {
            match SignedData::parse_ber(data) {
                Ok(signed_data) if signed_data.signers().count() == 0 => Some(Self::CertsOnly),
                Ok(_) => Some(Self::SignedData),
                Err(_) => None,
            }
        } else if content_info.content_type == asn1::rfc5652::OID_ID_ENVELOPED_DATA {
            Some(Self::EnvelopedData)
        } else if content_info.content_type == asn1::rfc3274::OID_ID_COMPRESSED_DATA {
            Some(Self::CompressedData)
        } else if content_info.content_type == asn1::rfc5652::OID_ID_DATA {
            Some(Self::Data)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn detect_payload_kinds() {
        assert_eq!(
            SecureMimeType::detect(include_bytes!("../tests/data/signed-encap.der")),
            Some(SecureMimeType::SignedData)
        );
        assert_eq!(
            SecureMimeType::detect(include_bytes!("../tests/data/enveloped.der")),
            Some(SecureMimeType::EnvelopedData)
        );
        assert_eq!(SecureMimeType::detect(b"not a cms blob"), None);
    }

    #[test]
    fn smime_type_parameters() {
        assert_eq!(SecureMimeType::SignedData.smime_type(), "signed-data");
        assert_eq!(SecureMimeType::CertsOnly.smime_type(), "certs-only");
    }
}

/// Errors raised while operating on CMS structures.
///
/// These surface through [SecureMimeError::Cms] unwrapped, preserving
/// the diagnostic detail of the layer that produced them.
#[derive(Debug, Error)]
pub enum CmsError {
    /// An error occurred decoding ASN.1 data.
    #[error("ASN.1 decode error: {0}")]
    Decode(#[from] bcder::decode::DecodeError<std::convert::Infallible>),

    /// The content-type attribute is missing from the SignedAttributes structure.
    #[error("content-type attribute missing from SignedAttributes")]
    MissingSignedAttributeContentType,

    /// The content-type attribute in the SignedAttributes structure is malformed.
    #[error("content-type attribute in SignedAttributes is malformed")]
    MalformedSignedAttributeContentType,

    /// The message-digest attribute is missing from the SignedAttributes structure.
    #[error("message-digest attribute missing from SignedAttributes")]
    MissingSignedAttributeMessageDigest,

    /// The message-digest attribute is malformed.
    #[error("message-digest attribute in SignedAttributes is malformed")]
    MalformedSignedAttributeMessageDigest,

    /// The signing-time signed attribute is malformed.
    #[error("signing-time attribute in SignedAttributes is malformed")]
    MalformedSignedAttributeSigningTime,

    /// A certificate was not found.
    #[error("certificate not found")]
    CertificateNotFound,

    /// Signature verification failed.
    #[error("signature verification failed")]
    SignatureVerificationError,

    /// No `SignedAttributes` were present when they should have been.
    #[error("SignedAttributes structure is missing")]
    NoSignedAttributes,

    /// Two content digests were not equivalent.
    #[error("digests not equivalent")]
    DigestNotEqual,

    /// An enveloped payload carries no encrypted content.
    #[error("no encrypted content present")]
    MissingEncryptedContent,

    /// A payload that must carry content does not.
    #[error("no encapsulated content present")]
    MissingContent,

    /// An algorithm this implementation does not handle was encountered.
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Key transport encryption or decryption failed.
    #[error("key transport failed: {0}")]
    KeyTransport(String),

    /// Content encryption failed.
    #[error("content encryption failed: {0}")]
    ContentEncryption(String),

    /// Content decryption failed.
    #[error("content decryption failed: {0}")]
    ContentDecryption(String),

    /// The system random generator failed.
    #[error("random generator failure")]
    Rng,

    /// An X.509 certificate error occurred.
    #[error("X.509 certificate error: {0}")]
    X509(x509_certificate::X509CertificateError),

    /// Error decoding PEM data.
    #[error("PEM error: {0}")]
    Pem(pem::PemError),

    /// A general I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Unified error type for S/MIME operations.
#[derive(Debug, Error)]
pub enum SecureMimeError {
    /// An argument failed validation before any I/O took place.
    #[error("invalid argument: {0}")]
    Argument(&'static str),

    /// A value outside the meaningful range of an enumeration was used.
    #[error("out of range: {0}")]
    OutOfRange(&'static str),

    /// The operation names functionality this implementation cannot produce.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// No certificate could be resolved for a mailbox.
    #[error("certificate not found for {0}: {1}")]
    CertificateNotFound(String, String),

    /// No recipient info of an envelope matched a held private key.
    #[error("a suitable private key could not be found for decrypting")]
    PrivateKeyNotFound,

    /// A CMS layer error, surfaced as-is.
    #[error("CMS error: {0}")]
    Cms(#[from] CmsError),

    /// An X.509 certificate handling error.
    #[error("X.509 certificate error: {0}")]
    X509(#[from] x509_certificate::X509CertificateError),

    /// A general I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// PKCS#12 data could not be processed.
    #[error("PKCS#12 error: {0}")]
    Pkcs12(String),

    /// The password for a PKCS#12 payload is incorrect.
    #[error("incorrect password for PKCS#12 data")]
    Pkcs12BadPassword,
}
