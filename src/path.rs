// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Certification path building.

Given a leaf certificate, a pool of candidate intermediates, CRLs and a
set of trust anchors, assemble a chain from the leaf to an anchor and
validate it.

Validity follows the chain model rather than the shell model: the leaf
must be valid at the reference instant (the asserted signing time, when
one exists), while every issuer must merely have been valid at the
moment it issued the next link. Archived mail therefore keeps verifying
after its root expires.

Revocation checking is driven by the caller's CRL pool. An empty local
pool means revocation is unconfigured, not that nothing is revoked;
lists embedded in a message refine an enabled check but never enable it,
since a sender controls what a message carries.
*/

use {
    crate::{
        certificate::{common_name, sha256_fingerprint, validity_window},
        crl::{CertificateRevocationList, RevocationReason},
        store::TrustAnchor,
    },
    chrono::{DateTime, Utc},
    log::{debug, warn},
    std::collections::HashSet,
    thiserror::Error,
    x509_certificate::CapturedX509Certificate,
};

/// Chains longer than this fail rather than loop.
const MAX_PATH_LENGTH: usize = 16;

/// A failure to build or validate a certification path.
#[derive(Debug, Error)]
pub enum PathBuildError {
    #[error("the signer certificate could not be located: {0}")]
    CertificateNotFound(String),

    #[error("no issuer certificate found for {0}")]
    IssuerNotFound(String),

    #[error("certificate {0} does not chain to a trusted anchor")]
    NoTrustedAnchor(String),

    #[error("signature on certificate {0} does not verify against its issuer")]
    SignatureInvalid(String),

    #[error("certificate {subject} was not yet valid at {at}")]
    NotYetValid {
        subject: String,
        at: DateTime<Utc>,
    },

    #[error("certificate {subject} had expired at {at}")]
    Expired {
        subject: String,
        at: DateTime<Utc>,
    },

    #[error("certificate {subject} was revoked on {revocation_date} ({reason})")]
    Revoked {
        subject: String,
        revocation_date: DateTime<Utc>,
        reason: RevocationReason,
    },

    #[error("certificate chain exceeds {MAX_PATH_LENGTH} links")]
    TooDeep,
}

/// A validated certification path.
///
/// Certificates are ordered leaf first, anchor last.
#[derive(Clone, Debug)]
pub struct CertificatePath {
    certificates: Vec<CapturedX509Certificate>,
}

impl CertificatePath {
    pub fn leaf(&self) -> &CapturedX509Certificate {
        &self.certificates[0]
    }

    pub fn anchor(&self) -> &CapturedX509Certificate {
        self.certificates
            .last()
            .expect("paths hold at least the leaf")
    }

    pub fn len(&self) -> usize {
        self.certificates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CapturedX509Certificate> {
        self.certificates.iter()
    }
}

fn describe(cert: &CapturedX509Certificate) -> String {
    common_name(cert.subject_name())
        .unwrap_or_else(|| format!("(serial {:?})", cert.serial_number_asn1()))
}

/// Builds validated certification paths.
///
/// The anchor set is snapshotted at construction and never mutated by a
/// verify in flight.
pub struct PathBuilder {
    anchors: HashSet<TrustAnchor>,
    intermediates: Vec<CapturedX509Certificate>,
    crls: Vec<CertificateRevocationList>,
    check_revocation: bool,
    reference_time: DateTime<Utc>,
}

impl PathBuilder {
    /// Construct a builder over a set of trust anchors.
    ///
    /// Revocation checking starts out disabled; it is switched on by
    /// [Self::local_crls] observing a non-empty pool.
    pub fn new(anchors: HashSet<TrustAnchor>) -> Self {
        Self {
            anchors,
            intermediates: vec![],
            crls: vec![],
            check_revocation: false,
            reference_time: Utc::now(),
        }
    }

    /// Add candidate intermediate certificates.
    #[must_use]
    pub fn intermediates(
        mut self,
        certs: impl IntoIterator<Item = CapturedX509Certificate>,
    ) -> Self {
        self.intermediates.extend(certs);
        self
    }

    /// Provide the locally configured CRLs.
    ///
    /// A non-empty pool enables revocation checking.
    #[must_use]
    pub fn local_crls(mut self, crls: impl IntoIterator<Item = CertificateRevocationList>) -> Self {
        let before = self.crls.len();
        self.crls.extend(crls);
        self.check_revocation = self.check_revocation || self.crls.len() > before;
        self
    }

    /// Provide CRLs that traveled inside the message being verified.
    ///
    /// These participate in an enabled revocation check but do not enable
    /// one on their own.
    #[must_use]
    pub fn embedded_crls(
        mut self,
        crls: impl IntoIterator<Item = CertificateRevocationList>,
    ) -> Self {
        self.crls.extend(crls);
        self
    }

    /// Evaluate validity at the given instant instead of now.
    ///
    /// Used with the signing time asserted in a signature so archived
    /// mail validates against the world as it was when signed.
    #[must_use]
    pub fn at_time(mut self, time: DateTime<Utc>) -> Self {
        self.reference_time = time;
        self
    }

    fn is_anchor(&self, cert: &CapturedX509Certificate) -> bool {
        self.anchors.contains(&TrustAnchor::new(cert.clone()))
    }

    /// Locate and signature-check the issuer of a certificate.
    ///
    /// Anchors are preferred over pool intermediates. Certificates already
    /// on the chain are not considered, which terminates loops.
    fn locate_issuer(
        &self,
        cert: &CapturedX509Certificate,
        seen: &HashSet<Vec<u8>>,
    ) -> Result<CapturedX509Certificate, PathBuildError> {
        let mut name_matched = false;

        let candidates = self
            .anchors
            .iter()
            .map(|anchor| anchor.certificate())
            .chain(self.intermediates.iter());

        for candidate in candidates {
            if candidate.subject_name() != cert.issuer_name() {
                continue;
            }

            if seen.contains(&sha256_fingerprint(candidate)) {
                continue;
            }

            name_matched = true;

            if cert.verify_signed_by_certificate(candidate).is_ok() {
                return Ok(candidate.clone());
            }
        }

        if name_matched {
            Err(PathBuildError::SignatureInvalid(describe(cert)))
        } else {
            Err(PathBuildError::IssuerNotFound(describe(cert)))
        }
    }

    fn check_validity(
        &self,
        cert: &CapturedX509Certificate,
        at: DateTime<Utc>,
    ) -> Result<(), PathBuildError> {
        let (not_before, not_after) = validity_window(cert);

        if at < not_before {
            return Err(PathBuildError::NotYetValid {
                subject: describe(cert),
                at,
            });
        }

        if at > not_after {
            return Err(PathBuildError::Expired {
                subject: describe(cert),
                at,
            });
        }

        Ok(())
    }

    /// Check a certificate against CRLs published by its issuer.
    fn check_revocation(
        &self,
        cert: &CapturedX509Certificate,
        issuer: &CapturedX509Certificate,
    ) -> Result<(), PathBuildError> {
        for crl in &self.crls {
            if !crl.covers_issuer(cert.issuer_name()) {
                continue;
            }

            if crl.verify_signed_by_certificate(issuer).is_err() {
                warn!(
                    "ignoring CRL for {} with an unverifiable signature",
                    describe(cert)
                );
                continue;
            }

            if let Some(entry) = crl.find_revoked(cert.serial_number_asn1()) {
                if entry.revocation_date <= self.reference_time {
                    return Err(PathBuildError::Revoked {
                        subject: describe(cert),
                        revocation_date: entry.revocation_date,
                        reason: entry.reason.unwrap_or(RevocationReason::Unspecified),
                    });
                }
            }
        }

        Ok(())
    }

    /// Build a validated path from `leaf` to a trusted anchor.
    pub fn build(
        &self,
        leaf: &CapturedX509Certificate,
    ) -> Result<CertificatePath, PathBuildError> {
        self.check_validity(leaf, self.reference_time)?;

        let mut chain = vec![leaf.clone()];
        let mut seen = HashSet::new();
        seen.insert(sha256_fingerprint(leaf));

        loop {
            let current = chain.last().expect("chain is never empty").clone();

            if self.is_anchor(&current) {
                debug!(
                    "path for {} terminates at anchor {} ({} links)",
                    describe(leaf),
                    describe(&current),
                    chain.len()
                );

                return Ok(CertificatePath {
                    certificates: chain,
                });
            }

            if chain.len() >= MAX_PATH_LENGTH {
                return Err(PathBuildError::TooDeep);
            }

            if current.subject_is_issuer() {
                // Self-issued and not an anchor: there is nowhere to go.
                return Err(PathBuildError::NoTrustedAnchor(describe(leaf)));
            }

            let issuer = self.locate_issuer(&current, &seen)?;

            // Chain validity: the issuer must have been valid when it
            // issued the current link.
            let (issued_at, _) = validity_window(&current);
            self.check_validity(&issuer, issued_at)?;

            if self.check_revocation {
                self.check_revocation(&current, &issuer)?;
            }

            seen.insert(sha256_fingerprint(&issuer));
            chain.push(issuer);
        }
    }
}

#[cfg(test)]
mod test {
    use {
        super::*,
        bcder::encode::Values,
        bytes::Bytes,
        x509_certificate::{
            asn1time::Time,
            rfc3280::Name,
            rfc5280,
            InMemorySigningKeyPair, Sign, SignatureAlgorithm, X509Certificate,
        },
    };

    const ALICE_DER: &[u8] = include_bytes!("../tests/data/alice.der");
    const CA_DER: &[u8] = include_bytes!("../tests/data/ca.der");
    const BOB_DER: &[u8] = include_bytes!("../tests/data/bob.der");
    const REVOKED_CRL: &[u8] = include_bytes!("../tests/data/revoked.crl");

    fn alice() -> CapturedX509Certificate {
        CapturedX509Certificate::from_der(ALICE_DER.to_vec()).unwrap()
    }

    fn ca() -> CapturedX509Certificate {
        CapturedX509Certificate::from_der(CA_DER.to_vec()).unwrap()
    }

    fn anchors() -> HashSet<TrustAnchor> {
        [TrustAnchor::new(ca())].into_iter().collect()
    }

    /// Issue an ED25519 certificate with a chosen validity window.
    fn issue_certificate(
        subject_cn: &str,
        issuer_cn: &str,
        issuer_key: Option<&InMemorySigningKeyPair>,
        serial: i32,
        not_before: chrono::DateTime<Utc>,
        not_after: chrono::DateTime<Utc>,
    ) -> (CapturedX509Certificate, InMemorySigningKeyPair) {
        let document = ring::signature::Ed25519KeyPair::generate_pkcs8(
            &ring::rand::SystemRandom::new(),
        )
        .unwrap();
        let key = InMemorySigningKeyPair::from_pkcs8_der(document.as_ref()).unwrap();

        let mut subject = Name::default();
        subject.append_common_name_utf8_string(subject_cn).unwrap();

        let mut issuer = Name::default();
        issuer.append_common_name_utf8_string(issuer_cn).unwrap();

        let signing_key = issuer_key.unwrap_or(&key);
        let signature_algorithm = SignatureAlgorithm::Ed25519;

        let tbs_certificate = rfc5280::TbsCertificate {
            version: Some(rfc5280::Version::V3),
            serial_number: serial.into(),
            signature: signature_algorithm.into(),
            issuer,
            validity: rfc5280::Validity {
                not_before: Time::from(not_before),
                not_after: Time::from(not_after),
            },
            subject,
            subject_public_key_info: rfc5280::SubjectPublicKeyInfo {
                algorithm: x509_certificate::KeyAlgorithm::Ed25519.into(),
                subject_public_key: bcder::BitString::new(
                    0,
                    Bytes::copy_from_slice(key.public_key_data().as_ref()),
                ),
            },
            issuer_unique_id: None,
            subject_unique_id: None,
            extensions: None,
            raw_data: None,
        };

        let mut tbs_der = Vec::new();
        tbs_certificate
            .encode_ref()
            .write_encoded(bcder::Mode::Der, &mut tbs_der)
            .unwrap();

        let (signature, _) = signing_key.sign(&tbs_der).unwrap();

        let cert = rfc5280::Certificate {
            tbs_certificate,
            signature_algorithm: signature_algorithm.into(),
            signature: bcder::BitString::new(0, Bytes::copy_from_slice(&signature)),
        };

        let cert = CapturedX509Certificate::try_from(X509Certificate::from(cert)).unwrap();

        (cert, key)
    }

    #[test]
    fn chain_to_anchor() {
        let path = PathBuilder::new(anchors())
            .build(&alice())
            .unwrap();

        assert_eq!(path.len(), 2);
        assert_eq!(path.leaf().constructed_data(), ALICE_DER);
        assert_eq!(path.anchor().constructed_data(), CA_DER);
    }

    #[test]
    fn issuer_from_intermediate_pool_is_not_trusted() {
        let err = PathBuilder::new(HashSet::new())
            .intermediates([ca()])
            .build(&alice())
            .unwrap_err();

        assert!(matches!(err, PathBuildError::NoTrustedAnchor(_)));
    }

    #[test]
    fn missing_issuer() {
        let err = PathBuilder::new(HashSet::new()).build(&alice()).unwrap_err();

        assert!(matches!(err, PathBuildError::IssuerNotFound(_)));
    }

    #[test]
    fn self_signed_anchor_is_its_own_path() {
        let path = PathBuilder::new(anchors()).build(&ca()).unwrap();

        assert_eq!(path.len(), 1);
    }

    #[test]
    fn revocation_disabled_without_local_crls() {
        let crl = CertificateRevocationList::from_der(REVOKED_CRL.to_vec()).unwrap();

        // Embedded-only CRLs do not enable the check.
        PathBuilder::new(anchors())
            .embedded_crls([crl])
            .build(&alice())
            .unwrap();
    }

    #[test]
    fn revocation_with_local_crl() {
        let crl = CertificateRevocationList::from_der(REVOKED_CRL.to_vec()).unwrap();

        let err = PathBuilder::new(anchors())
            .local_crls([crl.clone()])
            .build(&alice())
            .unwrap_err();

        assert!(matches!(
            err,
            PathBuildError::Revoked {
                reason: RevocationReason::KeyCompromise,
                ..
            }
        ));

        // Bob is not listed.
        let bob = CapturedX509Certificate::from_der(BOB_DER.to_vec()).unwrap();
        PathBuilder::new(anchors())
            .local_crls([crl])
            .build(&bob)
            .unwrap();
    }

    #[test]
    fn expired_leaf_rejected_at_now_but_accepted_at_signing_time() {
        let now = Utc::now();
        let (root, root_key) = issue_certificate(
            "Old Root",
            "Old Root",
            None,
            1,
            now - chrono::Duration::days(400),
            now + chrono::Duration::days(400),
        );
        let (leaf, _) = issue_certificate(
            "Old Leaf",
            "Old Root",
            Some(&root_key),
            2,
            now - chrono::Duration::days(300),
            now - chrono::Duration::days(10),
        );

        let anchors: HashSet<_> = [TrustAnchor::new(root)].into_iter().collect();

        let err = PathBuilder::new(anchors.clone()).build(&leaf).unwrap_err();
        assert!(matches!(err, PathBuildError::Expired { .. }));

        PathBuilder::new(anchors)
            .at_time(now - chrono::Duration::days(100))
            .build(&leaf)
            .unwrap();
    }

    #[test]
    fn expired_root_admitted_under_chain_validity() {
        let now = Utc::now();

        // The root has expired, but it was valid when it issued the leaf.
        let (root, root_key) = issue_certificate(
            "Expired Root",
            "Expired Root",
            None,
            1,
            now - chrono::Duration::days(400),
            now - chrono::Duration::days(50),
        );
        let (leaf, _) = issue_certificate(
            "Live Leaf",
            "Expired Root",
            Some(&root_key),
            2,
            now - chrono::Duration::days(300),
            now + chrono::Duration::days(300),
        );

        let anchors: HashSet<_> = [TrustAnchor::new(root)].into_iter().collect();

        let path = PathBuilder::new(anchors).build(&leaf).unwrap();
        assert_eq!(path.len(), 2);
    }

    #[test]
    fn forged_issuer_signature_detected() {
        let now = Utc::now();

        // A certificate claiming the trusted root as issuer, signed by
        // someone else entirely.
        let (root, _) = issue_certificate(
            "Root",
            "Root",
            None,
            1,
            now - chrono::Duration::days(10),
            now + chrono::Duration::days(10),
        );
        let (_, mallory_key) = issue_certificate(
            "Mallory",
            "Mallory",
            None,
            3,
            now - chrono::Duration::days(10),
            now + chrono::Duration::days(10),
        );
        let (forged, _) = issue_certificate(
            "Forged",
            "Root",
            Some(&mallory_key),
            4,
            now - chrono::Duration::days(5),
            now + chrono::Duration::days(5),
        );

        let anchors: HashSet<_> = [TrustAnchor::new(root)].into_iter().collect();

        let err = PathBuilder::new(anchors).build(&forged).unwrap_err();
        assert!(matches!(err, PathBuildError::SignatureInvalid(_)));
    }
}
