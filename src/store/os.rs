// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Host certificate store backend.

Reads from the current user's Windows certificate store under its
well-known logical names. The host does not release private key
material, so key lookups only resolve identities whose PKCS#12 was
imported through this process; see [OsStore::get_private_key].
*/

use {
    crate::{
        certificate::certificate_matches_address,
        crl::CertificateRevocationList,
        store::{CertificateSelector, CmsSigner, Mailbox, PrivateKey, TrustAnchor},
        DigestAlgorithm, SecureMimeError,
    },
    log::warn,
    schannel::cert_store::{CertAdd, CertStore, PfxImportOptions},
    std::{collections::HashSet, sync::Mutex},
    x509_certificate::CapturedX509Certificate,
};

/// Logical store names consulted by certificate lookups, in order.
const SEARCH_ORDER: &[&str] = &["My", "AddressBook", "TrustedPeople", "Root"];

/// The host certificate store backend.
pub struct OsStore {
    /// Key material for identities imported through this context.
    ///
    /// The OS store flags certificates as key-backed but does not export
    /// the keys, so imported PKCS#12 keys are retained here for signing
    /// and decryption.
    imported_keys: Mutex<Vec<(Vec<u8>, Vec<u8>)>>,
}

impl OsStore {
    pub fn new() -> Self {
        Self {
            imported_keys: Mutex::new(Vec::new()),
        }
    }

    fn open(name: &str) -> Result<CertStore, SecureMimeError> {
        Ok(CertStore::open_current_user(name)?)
    }

    fn certificates_in(name: &str) -> Result<Vec<CapturedX509Certificate>, SecureMimeError> {
        let store = Self::open(name)?;

        let mut certificates = Vec::new();
        for context in store.certs() {
            match CapturedX509Certificate::from_der(context.to_der().to_vec()) {
                Ok(cert) => certificates.push(cert),
                Err(e) => warn!("skipping unparseable certificate in {}: {}", name, e),
            }
        }

        Ok(certificates)
    }

    pub(crate) fn all_certificates(
        &self,
    ) -> Result<Vec<CapturedX509Certificate>, SecureMimeError> {
        let mut certificates = Vec::new();

        for name in SEARCH_ORDER {
            certificates.extend(Self::certificates_in(name)?);
        }

        Ok(certificates)
    }

    pub(crate) fn get_certificate(
        &self,
        selector: &CertificateSelector,
    ) -> Result<Option<CapturedX509Certificate>, SecureMimeError> {
        for name in SEARCH_ORDER {
            if let Some(cert) = Self::certificates_in(name)?
                .into_iter()
                .find(|cert| selector.matches(cert))
            {
                return Ok(Some(cert));
            }
        }

        Ok(None)
    }

    pub(crate) fn get_private_key(
        &self,
        selector: &CertificateSelector,
    ) -> Result<Option<PrivateKey>, SecureMimeError> {
        // Only `My` holds key-backed identities.
        let my = Self::certificates_in("My")?;

        let imported = self.imported_keys.lock().expect("lock poisoned");

        for (cert_der, pkcs8) in imported.iter() {
            let cert = CapturedX509Certificate::from_der(cert_der.clone())?;

            if selector.matches(&cert) && my.iter().any(|candidate| candidate == &cert) {
                return Ok(Some(PrivateKey::from_pkcs8_der(pkcs8.clone())?));
            }
        }

        Ok(None)
    }

    pub(crate) fn trusted_anchors(&self) -> Result<HashSet<TrustAnchor>, SecureMimeError> {
        Ok(Self::certificates_in("Root")?
            .into_iter()
            .map(TrustAnchor::new)
            .collect())
    }

    pub(crate) fn intermediates(&self) -> Result<Vec<CapturedX509Certificate>, SecureMimeError> {
        Self::certificates_in("CA")
    }

    pub(crate) fn crls(&self) -> Result<Vec<CertificateRevocationList>, SecureMimeError> {
        // The host store's CRL interface is not surfaced here; revocation
        // via this backend is effectively unconfigured.
        Ok(vec![])
    }

    pub(crate) fn cms_signer(
        &self,
        mailbox: &Mailbox,
        digest_algorithm: DigestAlgorithm,
    ) -> Result<CmsSigner, SecureMimeError> {
        let imported = self.imported_keys.lock().expect("lock poisoned");

        for (cert_der, pkcs8) in imported.iter() {
            let cert = CapturedX509Certificate::from_der(cert_der.clone())?;

            if certificate_matches_address(&cert, &mailbox.address) {
                return Ok(CmsSigner {
                    certificate: cert,
                    private_key: PrivateKey::from_pkcs8_der(pkcs8.clone())?,
                    digest_algorithm,
                    signed_attributes: vec![],
                    unsigned_attributes: vec![],
                    chain: vec![],
                });
            }
        }

        Err(SecureMimeError::CertificateNotFound(
            mailbox.address.clone(),
            "no key-backed certificate for address in the My store".into(),
        ))
    }

    pub(crate) fn import_certificate(
        &self,
        cert: &CapturedX509Certificate,
    ) -> Result<(), SecureMimeError> {
        let mut store = CertStore::open_current_user("AddressBook")?;
        let context = schannel::cert_context::CertContext::new(cert.constructed_data())?;
        store.add_cert(&context, CertAdd::UseExisting)?;

        Ok(())
    }

    pub(crate) fn import_crl(
        &self,
        _crl: &CertificateRevocationList,
    ) -> Result<(), SecureMimeError> {
        // Accepted but not persisted; the host store's CRL interface is
        // not wired up.
        warn!("CRL import into the OS certificate store is not supported; dropping");

        Ok(())
    }

    pub(crate) fn import_pkcs12(
        &self,
        data: &[u8],
        password: &str,
    ) -> Result<(), SecureMimeError> {
        let identity = crate::store::file::parse_pkcs12(data, password)?;

        let imported = PfxImportOptions::new().password(password).import(data)?;

        let mut my = CertStore::open_current_user("My")?;
        for context in imported.certs() {
            my.add_cert(&context, CertAdd::ReplaceExisting)?;
        }

        self.imported_keys.lock().expect("lock poisoned").push((
            identity.certificate.constructed_data().to_vec(),
            identity.private_key.pkcs8_der().to_vec(),
        ));

        Ok(())
    }
}

impl Default for OsStore {
    fn default() -> Self {
        Self::new()
    }
}
