// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Certificate revocation list structures from RFC 5280.

The `x509-certificate` crate declares `CertificateList` but does not
implement parsing for it, so the CRL codec lives here. The raw bytes of
the `TBSCertList` are captured during the parse so CRL signatures can be
verified against the exact input.
*/

use {
    bcder::{
        decode::{Constructed, DecodeError, Source},
        BitString, Integer, Tag,
    },
    x509_certificate::{
        asn1time::{GeneralizedTime, Time, UtcTime},
        rfc3280::Name,
        rfc5280::{AlgorithmIdentifier, Extensions, Version},
    },
};

/// Certificate list.
///
/// ```ASN.1
/// CertificateList  ::=  SEQUENCE  {
///      tbsCertList          TBSCertList,
///      signatureAlgorithm   AlgorithmIdentifier,
///      signature            BIT STRING  }
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CertificateList {
    pub tbs_cert_list: TbsCertList,
    pub signature_algorithm: AlgorithmIdentifier,
    pub signature: BitString,
}

impl CertificateList {
    pub fn take_from<S: Source>(cons: &mut Constructed<S>) -> Result<Self, DecodeError<S::Error>> {
        cons.take_sequence(|cons| Self::from_sequence(cons))
    }

    pub fn from_sequence<S: Source>(
        cons: &mut Constructed<S>,
    ) -> Result<Self, DecodeError<S::Error>> {
        let tbs_cert_list = TbsCertList::take_from(cons)?;
        let signature_algorithm = AlgorithmIdentifier::take_from(cons)?;
        let signature = BitString::take_from(cons)?;

        Ok(Self {
            tbs_cert_list,
            signature_algorithm,
            signature,
        })
    }
}

/// TBS certificate list.
///
/// ```ASN.1
/// TBSCertList  ::=  SEQUENCE  {
///   version                 Version OPTIONAL,
///                                -- if present, MUST be v2
///   signature               AlgorithmIdentifier,
///   issuer                  Name,
///   thisUpdate              Time,
///   nextUpdate              Time OPTIONAL,
///   revokedCertificates     SEQUENCE OF SEQUENCE  {
///     userCertificate         CertificateSerialNumber,
///     revocationDate          Time,
///     crlEntryExtensions      Extensions OPTIONAL
///   }  OPTIONAL,
///   crlExtensions           [0] EXPLICIT Extensions OPTIONAL }
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TbsCertList {
    pub version: Option<Version>,
    pub signature: AlgorithmIdentifier,
    pub issuer: Name,
    pub this_update: Time,
    pub next_update: Option<Time>,
    pub revoked_certificates: Vec<RevokedCertificate>,
    pub crl_extensions: Option<Extensions>,

    /// Raw bytes this instance was constructed from.
    ///
    /// This is what signature verification should be performed against.
    pub raw_data: Option<Vec<u8>>,
}

impl TbsCertList {
    pub fn take_from<S: Source>(cons: &mut Constructed<S>) -> Result<Self, DecodeError<S::Error>> {
        // The TBSCertList data is what the issuer signed, so stash away the
        // raw bytes for later signature verification.
        let mut res = None;

        let captured = cons.capture(|cons| {
            cons.take_sequence(|cons| {
                let version = match cons
                    .take_opt_primitive_if(Tag::INTEGER, Integer::i8_from_primitive)?
                {
                    None => None,
                    Some(0) => Some(Version::V1),
                    Some(1) => Some(Version::V2),
                    Some(2) => Some(Version::V3),
                    Some(_) => return Err(cons.content_err("unexpected TBSCertList version")),
                };

                let signature = AlgorithmIdentifier::take_from(cons)?;
                let issuer = Name::take_from(cons)?;
                let this_update = Time::take_from(cons)?;
                let next_update = take_opt_time(cons)?;

                let revoked_certificates = cons
                    .take_opt_sequence(|cons| {
                        let mut entries = Vec::new();

                        while let Some(entry) = RevokedCertificate::take_opt_from(cons)? {
                            entries.push(entry);
                        }

                        Ok(entries)
                    })?
                    .unwrap_or_default();

                let crl_extensions =
                    cons.take_opt_constructed_if(Tag::CTX_0, |cons| Extensions::take_from(cons))?;

                res = Some(Self {
                    version,
                    signature,
                    issuer,
                    this_update,
                    next_update,
                    revoked_certificates,
                    crl_extensions,
                    raw_data: None,
                });

                Ok(())
            })
        })?;

        let mut res = res.unwrap();
        res.raw_data = Some(captured.as_slice().to_vec());

        Ok(res)
    }
}

/// A single entry in the revokedCertificates sequence.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RevokedCertificate {
    pub user_certificate: Integer,
    pub revocation_date: Time,
    pub crl_entry_extensions: Option<Extensions>,
}

impl RevokedCertificate {
    pub fn take_opt_from<S: Source>(
        cons: &mut Constructed<S>,
    ) -> Result<Option<Self>, DecodeError<S::Error>> {
        cons.take_opt_sequence(|cons| {
            let user_certificate = Integer::take_from(cons)?;
            let revocation_date = Time::take_from(cons)?;
            let crl_entry_extensions = Extensions::take_opt_from(cons)?;

            Ok(Self {
                user_certificate,
                revocation_date,
                crl_entry_extensions,
            })
        })
    }
}

fn take_opt_time<S: Source>(
    cons: &mut Constructed<S>,
) -> Result<Option<Time>, DecodeError<S::Error>> {
    if let Some(utc) =
        cons.take_opt_primitive_if(Tag::UTC_TIME, |prim| UtcTime::from_primitive(prim))?
    {
        Ok(Some(Time::UtcTime(utc)))
    } else if let Some(generalized) = cons.take_opt_primitive_if(Tag::GENERALIZED_TIME, |prim| {
        GeneralizedTime::from_primitive_no_fractional_or_timezone_offsets(prim)
    })? {
        Ok(Some(Time::GeneralTime(generalized)))
    } else {
        Ok(None)
    }
}
