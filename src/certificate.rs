// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Functionality related to certificates.

S/MIME resolves people to certificates through email addresses. The
helpers here pull the relevant identity and capability bits out of X.509
certificates: rfc822Name subject alternative names, the legacy
emailAddress subject attribute, key usage flags, and subject key
identifiers.
*/

use {
    bcder::{
        decode::Constructed,
        string::Ia5String,
        BitString, ConstOid, Mode, OctetString, Oid, Tag,
    },
    x509_certificate::{rfc3280::Name, rfc5280, CapturedX509Certificate, X509Certificate},
};

/// Subject alternative name extension.
///
/// 2.5.29.17
const OID_SUBJECT_ALT_NAME: ConstOid = Oid(&[85, 29, 17]);

/// Key usage extension.
///
/// 2.5.29.15
const OID_KEY_USAGE: ConstOid = Oid(&[85, 29, 15]);

/// Subject key identifier extension.
///
/// 2.5.29.14
const OID_SUBJECT_KEY_IDENTIFIER: ConstOid = Oid(&[85, 29, 14]);

/// The emailAddress attribute in subject distinguished names.
///
/// 1.2.840.113549.1.9.1
const OID_EMAIL_ADDRESS: ConstOid = Oid(&[42, 134, 72, 134, 247, 13, 1, 9, 1]);

/// Key usage bit for keyEncipherment.
const KEY_USAGE_KEY_ENCIPHERMENT: usize = 2;

fn raw_certificate(cert: &CapturedX509Certificate) -> &rfc5280::Certificate {
    let cert: &X509Certificate = cert.as_ref();

    cert.as_ref()
}

fn find_extension<'a>(
    cert: &'a CapturedX509Certificate,
    oid: &ConstOid,
) -> Option<&'a rfc5280::Extension> {
    raw_certificate(cert)
        .iter_extensions()
        .find(|ext| &ext.id == oid)
}

/// Obtain the email addresses a certificate is bound to.
///
/// rfc822Name entries from the subject alternative name extension come
/// first. When the certificate carries no such entries, the legacy
/// emailAddress attribute of the subject distinguished name is consulted.
pub fn certificate_emails(cert: &CapturedX509Certificate) -> Vec<String> {
    let mut emails = Vec::new();

    if let Some(ext) = find_extension(cert, &OID_SUBJECT_ALT_NAME) {
        let data = ext.value.to_bytes();

        // rfc822Name is GeneralName alternative [1], an IMPLICIT IA5String.
        // Other alternatives are skipped. A malformed extension just means
        // no addresses from this source.
        let addresses = Constructed::decode(data.as_ref(), Mode::Der, |cons| {
            cons.take_sequence(|cons| {
                let mut addresses = Vec::new();

                loop {
                    if let Some(address) = cons
                        .take_opt_value_if(Tag::CTX_1, |content| Ia5String::from_content(content))?
                    {
                        addresses.push(address.to_string());
                        continue;
                    }

                    if cons.skip_one()?.is_none() {
                        break;
                    }
                }

                Ok(addresses)
            })
        })
        .unwrap_or_default();

        emails.extend(addresses);
    }

    if emails.is_empty() {
        let email_oid = Oid(OID_EMAIL_ADDRESS.as_ref().into());

        for atv in cert.subject_name().iter_by_oid(email_oid) {
            if let Ok(address) = atv.to_string() {
                emails.push(address);
            }
        }
    }

    emails
}

/// Whether a certificate is bound to the given email address.
///
/// Address comparison is case-insensitive, per the loose matching
/// practiced for rfc822Name values in mail software.
pub fn certificate_matches_address(cert: &CapturedX509Certificate, address: &str) -> bool {
    certificate_emails(cert)
        .iter()
        .any(|email| email.eq_ignore_ascii_case(address))
}

/// Whether a certificate's public key may be used for key encipherment.
///
/// A certificate without a key usage extension poses no restriction.
pub fn key_encipherment_allowed(cert: &CapturedX509Certificate) -> bool {
    match find_extension(cert, &OID_KEY_USAGE) {
        None => true,
        Some(ext) => {
            let data = ext.value.to_bytes();

            Constructed::decode(data.as_ref(), Mode::Der, |cons| BitString::take_from(cons))
                .map(|bits| bits.bit(KEY_USAGE_KEY_ENCIPHERMENT))
                .unwrap_or(false)
        }
    }
}

/// Obtain the subject key identifier of a certificate, if present.
pub fn subject_key_identifier(cert: &CapturedX509Certificate) -> Option<Vec<u8>> {
    let ext = find_extension(cert, &OID_SUBJECT_KEY_IDENTIFIER)?;
    let data = ext.value.to_bytes();

    Constructed::decode(data.as_ref(), Mode::Der, |cons| OctetString::take_from(cons))
        .ok()
        .map(|ski| ski.to_bytes().to_vec())
}

/// Compute the SHA-256 fingerprint over the certificate's DER encoding.
pub fn sha256_fingerprint(cert: &CapturedX509Certificate) -> Vec<u8> {
    ring::digest::digest(&ring::digest::SHA256, cert.constructed_data())
        .as_ref()
        .to_vec()
}

/// Convert an ASN.1 time value to a UTC timestamp.
pub(crate) fn time_datetime(time: &x509_certificate::asn1time::Time) -> chrono::DateTime<chrono::Utc> {
    match time {
        x509_certificate::asn1time::Time::UtcTime(utc) => **utc,
        x509_certificate::asn1time::Time::GeneralTime(gt) => {
            chrono::DateTime::<chrono::Utc>::from(gt.clone())
        }
    }
}

/// Obtain the validity window of a certificate as UTC timestamps.
pub(crate) fn validity_window(
    cert: &CapturedX509Certificate,
) -> (chrono::DateTime<chrono::Utc>, chrono::DateTime<chrono::Utc>) {
    let validity = &raw_certificate(cert).tbs_certificate.validity;

    (
        time_datetime(&validity.not_before),
        time_datetime(&validity.not_after),
    )
}

/// Obtain the first common name attribute of a distinguished name.
pub fn common_name(name: &Name) -> Option<String> {
    name.iter_common_name()
        .next()
        .and_then(|atv| atv.to_string().ok())
}

#[cfg(test)]
mod test {
    use super::*;

    const ALICE_DER: &[u8] = include_bytes!("../tests/data/alice.der");
    const CA_DER: &[u8] = include_bytes!("../tests/data/ca.der");

    #[test]
    fn email_from_subject_alt_name() {
        let cert = CapturedX509Certificate::from_der(ALICE_DER.to_vec()).unwrap();

        assert_eq!(certificate_emails(&cert), vec!["alice@example.com"]);
        assert!(certificate_matches_address(&cert, "ALICE@example.com"));
        assert!(!certificate_matches_address(&cert, "mallory@example.com"));
    }

    #[test]
    fn ca_has_no_email() {
        let cert = CapturedX509Certificate::from_der(CA_DER.to_vec()).unwrap();

        assert!(certificate_emails(&cert).is_empty());
    }

    #[test]
    fn key_usage() {
        let alice = CapturedX509Certificate::from_der(ALICE_DER.to_vec()).unwrap();
        let ca = CapturedX509Certificate::from_der(CA_DER.to_vec()).unwrap();

        assert!(key_encipherment_allowed(&alice));
        // The CA certificate is limited to keyCertSign and cRLSign.
        assert!(!key_encipherment_allowed(&ca));
    }

    #[test]
    fn ski_present() {
        let cert = CapturedX509Certificate::from_der(ALICE_DER.to_vec()).unwrap();

        assert!(subject_key_identifier(&cert).is_some());
    }

    #[test]
    fn subject_common_name() {
        let cert = CapturedX509Certificate::from_der(ALICE_DER.to_vec()).unwrap();

        assert_eq!(common_name(cert.subject_name()).as_deref(), Some("Alice"));
    }
}
