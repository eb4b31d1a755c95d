// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Digest algorithm registry.

Maps the digest algorithms representable in S/MIME messages to their
RFC 3851 `micalg` tokens and PKCS #1 OIDs. The enumeration deliberately
carries algorithms the rest of the stack cannot produce (RIPEMD-160,
Tiger/192, HAVAL-5-160, DoubleSha): they exist on the wire and in `micalg`
parameters of foreign mail, so they must be representable even though
attempting to sign with them fails.
*/

use {
    crate::{CmsError, SecureMimeError},
    bcder::{ConstOid, Oid},
    bytes::Bytes,
    std::fmt::{Display, Formatter},
    x509_certificate::rfc5280::AlgorithmIdentifier,
};

/// MD2 with RSA encryption.
///
/// 1.2.840.113549.1.1.2
const OID_MD2_RSA: ConstOid = Oid(&[42, 134, 72, 134, 247, 13, 1, 1, 2]);

/// MD4 with RSA encryption.
///
/// 1.2.840.113549.1.1.3
const OID_MD4_RSA: ConstOid = Oid(&[42, 134, 72, 134, 247, 13, 1, 1, 3]);

/// MD5 with RSA encryption.
///
/// 1.2.840.113549.1.1.4
const OID_MD5_RSA: ConstOid = Oid(&[42, 134, 72, 134, 247, 13, 1, 1, 4]);

/// SHA-1 with RSA encryption.
///
/// 1.2.840.113549.1.1.5
const OID_SHA1_RSA: ConstOid = Oid(&[42, 134, 72, 134, 247, 13, 1, 1, 5]);

/// SHA-256 with RSA encryption.
///
/// 1.2.840.113549.1.1.11
const OID_SHA256_RSA: ConstOid = Oid(&[42, 134, 72, 134, 247, 13, 1, 1, 11]);

/// SHA-384 with RSA encryption.
///
/// 1.2.840.113549.1.1.12
const OID_SHA384_RSA: ConstOid = Oid(&[42, 134, 72, 134, 247, 13, 1, 1, 12]);

/// SHA-512 with RSA encryption.
///
/// 1.2.840.113549.1.1.13
const OID_SHA512_RSA: ConstOid = Oid(&[42, 134, 72, 134, 247, 13, 1, 1, 13]);

/// SHA-224 with RSA encryption.
///
/// 1.2.840.113549.1.1.14
const OID_SHA224_RSA: ConstOid = Oid(&[42, 134, 72, 134, 247, 13, 1, 1, 14]);

/// A message digest algorithm.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum DigestAlgorithm {
    /// No digest algorithm specified.
    None,

    /// MD5.
    Md5,

    /// SHA-1.
    Sha1,

    /// RIPEMD-160.
    RipeMd160,

    /// Double SHA (an obsolete PGP construct).
    DoubleSha,

    /// MD2.
    Md2,

    /// Tiger/192.
    Tiger192,

    /// HAVAL with 5 passes and a 160 bit output.
    Haval5160,

    /// SHA-256.
    Sha256,

    /// SHA-384.
    Sha384,

    /// SHA-512.
    Sha512,

    /// SHA-224.
    Sha224,

    /// MD4.
    Md4,
}

impl DigestAlgorithm {
    /// Obtain the RFC 3851 `micalg` parameter token for this algorithm.
    ///
    /// Fails with [SecureMimeError::OutOfRange] for [Self::None] and for
    /// [Self::DoubleSha], which has no registered token.
    pub fn micalg_name(&self) -> Result<&'static str, SecureMimeError> {
        match self {
            Self::Md5 => Ok("md5"),
            Self::Sha1 => Ok("sha1"),
            Self::RipeMd160 => Ok("ripemd160"),
            Self::Md2 => Ok("md2"),
            Self::Tiger192 => Ok("tiger192"),
            Self::Haval5160 => Ok("haval-5-160"),
            Self::Sha256 => Ok("sha256"),
            Self::Sha384 => Ok("sha384"),
            Self::Sha512 => Ok("sha512"),
            Self::Sha224 => Ok("sha224"),
            Self::Md4 => Ok("md4"),
            Self::None | Self::DoubleSha => Err(SecureMimeError::OutOfRange(
                "digest algorithm has no micalg token",
            )),
        }
    }

    /// Resolve a `micalg` parameter token to a digest algorithm.
    ///
    /// Matching is case-insensitive. Unknown tokens resolve to
    /// [Self::None]; a `multipart/signed` part advertising an unknown
    /// digest is still verifiable from the signature itself, so this is
    /// not an error.
    pub fn from_micalg(token: &str) -> Self {
        match token.to_ascii_lowercase().as_str() {
            "md5" => Self::Md5,
            "sha1" | "sha-1" => Self::Sha1,
            "ripemd160" => Self::RipeMd160,
            "md2" => Self::Md2,
            "tiger192" => Self::Tiger192,
            "haval-5-160" => Self::Haval5160,
            "sha256" | "sha-256" => Self::Sha256,
            "sha384" | "sha-384" => Self::Sha384,
            "sha512" | "sha-512" => Self::Sha512,
            "sha224" | "sha-224" => Self::Sha224,
            "md4" => Self::Md4,
            _ => Self::None,
        }
    }

    fn pkcs1_oid(&self) -> Result<ConstOid, SecureMimeError> {
        match self {
            Self::Md2 => Ok(OID_MD2_RSA),
            Self::Md4 => Ok(OID_MD4_RSA),
            Self::Md5 => Ok(OID_MD5_RSA),
            Self::Sha1 => Ok(OID_SHA1_RSA),
            Self::Sha224 => Ok(OID_SHA224_RSA),
            Self::Sha256 => Ok(OID_SHA256_RSA),
            Self::Sha384 => Ok(OID_SHA384_RSA),
            Self::Sha512 => Ok(OID_SHA512_RSA),
            Self::RipeMd160 | Self::DoubleSha | Self::Tiger192 | Self::Haval5160 => Err(
                SecureMimeError::NotSupported(format!("no digest OID for {}", self)),
            ),
            Self::None => Err(SecureMimeError::OutOfRange(
                "no digest OID for the null digest algorithm",
            )),
        }
    }

    /// Obtain the PKCS #1 signature-with-digest OID for this algorithm.
    ///
    /// This is the OID emitted into CMS `digestAlgorithm` fields. Fails
    /// with [SecureMimeError::NotSupported] for the four algorithms that
    /// are representable but cannot be produced, and
    /// [SecureMimeError::OutOfRange] for [Self::None].
    pub fn digest_oid(&self) -> Result<String, SecureMimeError> {
        Ok(self.pkcs1_oid()?.to_string())
    }

    /// The ASN.1 form of [Self::digest_oid], for wire emission.
    pub(crate) fn digest_oid_asn1(&self) -> Result<Oid, SecureMimeError> {
        Ok(Oid(Bytes::copy_from_slice(self.pkcs1_oid()?.as_ref())))
    }

    /// Whether content can actually be digested with this algorithm.
    ///
    /// The signing stack is backed by ring, which provides the SHA family
    /// only.
    pub fn is_supported(&self) -> bool {
        matches!(self, Self::Sha1 | Self::Sha256 | Self::Sha384 | Self::Sha512)
    }

    /// Resolve the digest implementation used when signing content.
    ///
    /// Fails with [SecureMimeError::NotSupported] for algorithms ring
    /// cannot digest with, and [SecureMimeError::OutOfRange] for
    /// [Self::None].
    pub(crate) fn ring_digest(&self) -> Result<x509_certificate::DigestAlgorithm, SecureMimeError> {
        match self {
            Self::Sha1 => Ok(x509_certificate::DigestAlgorithm::Sha1),
            Self::Sha256 => Ok(x509_certificate::DigestAlgorithm::Sha256),
            Self::Sha384 => Ok(x509_certificate::DigestAlgorithm::Sha384),
            Self::Sha512 => Ok(x509_certificate::DigestAlgorithm::Sha512),
            Self::None => Err(SecureMimeError::OutOfRange(
                "no digest algorithm specified",
            )),
            _ => Err(SecureMimeError::NotSupported(format!(
                "cannot digest content with {}",
                self
            ))),
        }
    }
}

/// Resolve a CMS `digestAlgorithm` identifier to a digest implementation.
///
/// Both plain digest OIDs and the PKCS #1 signature-with-digest OIDs
/// appear in `digestAlgorithm` fields in the wild; this crate emits the
/// latter. Accept both.
pub(crate) fn resolve_digest_algorithm_identifier(
    identifier: &AlgorithmIdentifier,
) -> Result<x509_certificate::DigestAlgorithm, CmsError> {
    if let Ok(algorithm) = x509_certificate::DigestAlgorithm::try_from(identifier) {
        return Ok(algorithm);
    }

    let oid = &identifier.algorithm;

    if oid == &OID_SHA1_RSA {
        Ok(x509_certificate::DigestAlgorithm::Sha1)
    } else if oid == &OID_SHA256_RSA {
        Ok(x509_certificate::DigestAlgorithm::Sha256)
    } else if oid == &OID_SHA384_RSA {
        Ok(x509_certificate::DigestAlgorithm::Sha384)
    } else if oid == &OID_SHA512_RSA {
        Ok(x509_certificate::DigestAlgorithm::Sha512)
    } else {
        Err(CmsError::UnsupportedAlgorithm(format!(
            "digest algorithm {}",
            oid
        )))
    }
}

impl Default for DigestAlgorithm {
    fn default() -> Self {
        Self::Sha256
    }
}

impl Display for DigestAlgorithm {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::Md5 => f.write_str("MD5"),
            Self::Sha1 => f.write_str("SHA-1"),
            Self::RipeMd160 => f.write_str("RIPEMD-160"),
            Self::DoubleSha => f.write_str("DoubleSHA"),
            Self::Md2 => f.write_str("MD2"),
            Self::Tiger192 => f.write_str("Tiger/192"),
            Self::Haval5160 => f.write_str("HAVAL-5-160"),
            Self::Sha256 => f.write_str("SHA-256"),
            Self::Sha384 => f.write_str("SHA-384"),
            Self::Sha512 => f.write_str("SHA-512"),
            Self::Sha224 => f.write_str("SHA-224"),
            Self::Md4 => f.write_str("MD4"),
        }
    }
}
