// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! High-level interface to certificate revocation lists.

This is the revocation counterpart of the signed data types: a parsed
view over the ASN.1 with the raw DER retained, so lists can be mirrored
into stores and their signatures verified byte-exactly.
*/

use {
    crate::{asn1::rfc5280::CertificateList, CmsError},
    bcder::{
        decode::Constructed,
        ConstOid, Integer, Mode, Oid, Tag,
    },
    chrono::{DateTime, Utc},
    x509_certificate::{rfc3280::Name, CapturedX509Certificate, SignatureAlgorithm},
};

/// CRL entry extension holding the revocation reason.
///
/// 2.5.29.21
const OID_CRL_REASON: ConstOid = Oid(&[85, 29, 21]);

/// Why a certificate was revoked, as recorded in the CRL entry.
///
/// The values are the RFC 5280 CRLReason enumeration.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RevocationReason {
    Unspecified,
    KeyCompromise,
    CaCompromise,
    AffiliationChanged,
    Superseded,
    CessationOfOperation,
    CertificateHold,
    RemoveFromCrl,
    PrivilegeWithdrawn,
    AaCompromise,
}

impl RevocationReason {
    fn from_code(code: i8) -> Option<Self> {
        match code {
            0 => Some(Self::Unspecified),
            1 => Some(Self::KeyCompromise),
            2 => Some(Self::CaCompromise),
            3 => Some(Self::AffiliationChanged),
            4 => Some(Self::Superseded),
            5 => Some(Self::CessationOfOperation),
            6 => Some(Self::CertificateHold),
            8 => Some(Self::RemoveFromCrl),
            9 => Some(Self::PrivilegeWithdrawn),
            10 => Some(Self::AaCompromise),
            _ => None,
        }
    }
}

impl std::fmt::Display for RevocationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unspecified => "unspecified",
            Self::KeyCompromise => "key compromise",
            Self::CaCompromise => "CA compromise",
            Self::AffiliationChanged => "affiliation changed",
            Self::Superseded => "superseded",
            Self::CessationOfOperation => "cessation of operation",
            Self::CertificateHold => "certificate hold",
            Self::RemoveFromCrl => "remove from CRL",
            Self::PrivilegeWithdrawn => "privilege withdrawn",
            Self::AaCompromise => "AA compromise",
        };

        f.write_str(s)
    }
}

/// A revocation recorded for a specific certificate.
#[derive(Clone, Debug)]
pub struct RevocationEntry {
    pub serial_number: Integer,
    pub revocation_date: DateTime<Utc>,
    pub reason: Option<RevocationReason>,
}

/// Represents a parsed certificate revocation list.
#[derive(Clone, Debug)]
pub struct CertificateRevocationList {
    raw: Vec<u8>,
    list: CertificateList,
}

impl CertificateRevocationList {
    /// Construct an instance by parsing DER (or BER) encoded data.
    pub fn from_der(data: impl Into<Vec<u8>>) -> Result<Self, CmsError> {
        let raw = data.into();

        let list = Constructed::decode(raw.as_slice(), Mode::Ber, |cons| {
            CertificateList::take_from(cons)
        })?;

        Ok(Self { raw, list })
    }

    /// Construct an instance by parsing PEM armored data.
    ///
    /// The payload is a human readable string with
    /// `-------- BEGIN X509 CRL --------` armoring.
    pub fn from_pem(data: impl AsRef<[u8]>) -> Result<Self, CmsError> {
        let pem = pem::parse(data.as_ref()).map_err(CmsError::Pem)?;

        Self::from_der(pem.contents)
    }

    /// Obtain the DER data this instance was constructed from.
    pub fn as_der(&self) -> &[u8] {
        &self.raw
    }

    /// The distinguished name of the CRL issuer.
    pub fn issuer(&self) -> &Name {
        &self.list.tbs_cert_list.issuer
    }

    /// When this revocation list was published.
    pub fn this_update(&self) -> DateTime<Utc> {
        crate::certificate::time_datetime(&self.list.tbs_cert_list.this_update)
    }

    /// When the next revocation list is due, if declared.
    pub fn next_update(&self) -> Option<DateTime<Utc>> {
        self.list
            .tbs_cert_list
            .next_update
            .as_ref()
            .map(crate::certificate::time_datetime)
    }

    /// Number of revocation entries carried.
    pub fn len(&self) -> usize {
        self.list.tbs_cert_list.revoked_certificates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.tbs_cert_list.revoked_certificates.is_empty()
    }

    /// Look up the revocation entry for a certificate serial number.
    pub fn find_revoked(&self, serial_number: &Integer) -> Option<RevocationEntry> {
        self.list
            .tbs_cert_list
            .revoked_certificates
            .iter()
            .find(|entry| &entry.user_certificate == serial_number)
            .map(|entry| {
                let reason = entry
                    .crl_entry_extensions
                    .as_ref()
                    .and_then(|extensions| {
                        extensions.iter().find(|ext| ext.id == OID_CRL_REASON)
                    })
                    .and_then(|ext| {
                        let data = ext.value.to_bytes();

                        Constructed::decode(data.as_ref(), Mode::Der, |cons| {
                            cons.take_primitive_if(Tag::ENUMERATED, Integer::i8_from_primitive)
                        })
                        .ok()
                    })
                    .and_then(RevocationReason::from_code);

                RevocationEntry {
                    serial_number: entry.user_certificate.clone(),
                    revocation_date: crate::certificate::time_datetime(&entry.revocation_date),
                    reason,
                }
            })
    }

    /// Whether this CRL speaks for certificates issued by the given name.
    pub fn covers_issuer(&self, issuer: &Name) -> bool {
        self.issuer() == issuer
    }

    /// Verify the list's signature against the issuing certificate.
    pub fn verify_signed_by_certificate(
        &self,
        issuer: &CapturedX509Certificate,
    ) -> Result<(), CmsError> {
        let tbs = self
            .list
            .tbs_cert_list
            .raw_data
            .as_ref()
            .ok_or(CmsError::SignatureVerificationError)?;

        let signature_algorithm = SignatureAlgorithm::try_from(&self.list.signature_algorithm)
            .map_err(CmsError::X509)?;
        let key_algorithm = issuer
            .key_algorithm()
            .ok_or(CmsError::SignatureVerificationError)?;
        let verification_algorithm = signature_algorithm
            .resolve_verification_algorithm(key_algorithm)
            .map_err(CmsError::X509)?;

        let public_key = ring::signature::UnparsedPublicKey::new(
            verification_algorithm,
            issuer.public_key_data(),
        );

        public_key
            .verify(tbs, self.list.signature.octet_bytes().as_ref())
            .map_err(|_| CmsError::SignatureVerificationError)
    }
}

impl PartialEq for CertificateRevocationList {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for CertificateRevocationList {}

#[cfg(test)]
mod test {
    use super::*;

    const REVOKED_CRL: &[u8] = include_bytes!("../tests/data/revoked.crl");
    const CA_DER: &[u8] = include_bytes!("../tests/data/ca.der");
    const ALICE_DER: &[u8] = include_bytes!("../tests/data/alice.der");

    #[test]
    fn parse_and_query() {
        let crl = CertificateRevocationList::from_der(REVOKED_CRL.to_vec()).unwrap();
        let alice = CapturedX509Certificate::from_der(ALICE_DER.to_vec()).unwrap();

        assert!(crl.covers_issuer(alice.issuer_name()));
        assert_eq!(crl.len(), 1);

        let entry = crl.find_revoked(alice.serial_number_asn1()).unwrap();
        assert_eq!(entry.reason, Some(RevocationReason::KeyCompromise));

        // An unlisted serial is not revoked.
        let ca = CapturedX509Certificate::from_der(CA_DER.to_vec()).unwrap();
        assert!(crl.find_revoked(ca.serial_number_asn1()).is_none());
    }

    #[test]
    fn signature_verifies_against_issuer() {
        let crl = CertificateRevocationList::from_der(REVOKED_CRL.to_vec()).unwrap();
        let ca = CapturedX509Certificate::from_der(CA_DER.to_vec()).unwrap();
        let alice = CapturedX509Certificate::from_der(ALICE_DER.to_vec()).unwrap();

        crl.verify_signed_by_certificate(&ca).unwrap();
        assert!(crl.verify_signed_by_certificate(&alice).is_err());
    }
}
