//! Trusted CA pool and certificate blocklist
//!
//! The pool indexes CA certificates by fingerprint and is consulted on every
//! leaf verification. The blocklist holds fingerprints of certificates that
//! must be rejected regardless of their validity.

use std::collections::{HashMap, HashSet};

use crate::cert::Certificate;
use crate::error::{CertError, CertResult};

/// A set of trusted certificate authorities plus a fingerprint blocklist
#[derive(Debug, Default)]
pub struct CaPool {
    cas: HashMap<String, Certificate>,
    blocklist: HashSet<String>,
}

impl CaPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a pool from a PEM bundle of CA certificates, rejecting entries
    /// that are expired at `now`.
    pub fn new_from_pem(bundle: &[u8], now: i64) -> CertResult<Self> {
        let mut pool = Self::new();
        let mut rest = bundle;
        loop {
            rest = pool.add_ca_certificate(rest, now)?;
            if rest.is_empty() {
                return Ok(pool);
            }
        }
    }

    /// Parse one PEM block, validate it as a usable CA and add it to the
    /// pool. Returns the remaining input for chained blocks.
    pub fn add_ca_certificate<'a>(&mut self, pem: &'a [u8], now: i64) -> CertResult<&'a [u8]> {
        let (cert, rest) = Certificate::unmarshal_from_pem(pem)?;

        if !cert.details.is_ca {
            return Err(CertError::NotACa);
        }

        // a CA must carry a valid self-signature
        if !cert.check_signature(&cert.details.public_key) {
            return Err(CertError::SignatureMismatch);
        }

        if cert.expired(now) {
            return Err(CertError::Expired);
        }

        self.cas.insert(cert.fingerprint(), cert);
        Ok(rest)
    }

    /// Resolve the signing CA for a certificate by its issuer fingerprint.
    /// A missing or unknown issuer is the same failure: no trusted root.
    pub fn get_ca_for_cert(&self, cert: &Certificate) -> CertResult<&Certificate> {
        if cert.details.issuer.is_empty() {
            return Err(CertError::RootNotFound);
        }
        self.cas
            .get(&cert.details.issuer)
            .ok_or(CertError::RootNotFound)
    }

    /// Add a certificate to the blocklist by value.
    pub fn blocklist_certificate(&mut self, cert: &Certificate) {
        self.blocklist_fingerprint(cert.fingerprint());
    }

    /// Add a fingerprint to the blocklist.
    pub fn blocklist_fingerprint(&mut self, fingerprint: String) {
        self.blocklist.insert(fingerprint);
    }

    /// Drop every blocklist entry.
    pub fn reset_blocklist(&mut self) {
        self.blocklist.clear();
    }

    pub fn is_blocklisted(&self, cert: &Certificate) -> bool {
        self.is_blocklisted_fingerprint(&cert.fingerprint_with_cache(false))
    }

    pub(crate) fn is_blocklisted_fingerprint(&self, fingerprint: &str) -> bool {
        self.blocklist.contains(fingerprint)
    }

    /// Look up a trusted CA by its fingerprint.
    pub fn get_by_fingerprint(&self, fingerprint: &str) -> Option<&Certificate> {
        self.cas.get(fingerprint)
    }

    /// Fingerprints of every trusted CA.
    pub fn fingerprints(&self) -> impl Iterator<Item = &str> {
        self.cas.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.cas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cas.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::Curve;
    use crate::test_support::{new_test_ca, new_test_cert, now, window};

    #[test]
    fn test_pool_from_pem_bundle() {
        let (ca1, _, _) = new_test_ca(Curve::Curve25519, window(-60, 600), &[], &[], &[]);
        let (ca2, _, _) = new_test_ca(Curve::P256, window(-60, 600), &[], &[], &[]);

        let mut bundle = ca1.marshal_to_pem();
        bundle.push_str(&ca2.marshal_to_pem());

        let pool = CaPool::new_from_pem(bundle.as_bytes(), now()).unwrap();
        assert_eq!(pool.len(), 2);
        assert!(pool.fingerprints().any(|f| f == ca1.fingerprint()));
    }

    #[test]
    fn test_pool_rejects_non_ca() {
        let (ca, _, ca_key) = new_test_ca(Curve::Curve25519, window(-60, 600), &[], &[], &[]);
        let (leaf, _, _) = new_test_cert(&ca, &ca_key, "leaf", window(-60, 600), &[], &[], &[]);

        let mut pool = CaPool::new();
        let err = pool
            .add_ca_certificate(leaf.marshal_to_pem().as_bytes(), now())
            .unwrap_err();
        assert!(matches!(err, CertError::NotACa));
    }

    #[test]
    fn test_pool_rejects_expired_ca() {
        let (ca, _, _) = new_test_ca(Curve::Curve25519, (1000, 2000), &[], &[], &[]);
        let mut pool = CaPool::new();
        let err = pool
            .add_ca_certificate(ca.marshal_to_pem().as_bytes(), 3000)
            .unwrap_err();
        assert!(matches!(err, CertError::Expired));
    }

    #[test]
    fn test_get_ca_for_cert() {
        let (ca, _, ca_key) = new_test_ca(Curve::Curve25519, window(-60, 600), &[], &[], &[]);
        let (leaf, _, _) = new_test_cert(&ca, &ca_key, "leaf", window(-60, 600), &[], &[], &[]);

        let mut pool = CaPool::new();
        pool.add_ca_certificate(ca.marshal_to_pem().as_bytes(), now())
            .unwrap();

        let signer = pool.get_ca_for_cert(&leaf).unwrap();
        assert_eq!(signer.fingerprint(), ca.fingerprint());

        // a cert with no issuer has no root
        let (orphan, _, _) = new_test_ca(Curve::Curve25519, window(-60, 600), &[], &[], &[]);
        let mut orphan = orphan.clone();
        orphan.details.issuer.clear();
        assert!(matches!(
            pool.get_ca_for_cert(&orphan),
            Err(CertError::RootNotFound)
        ));
    }

    #[test]
    fn test_blocklist() {
        let (ca, _, _) = new_test_ca(Curve::Curve25519, window(-60, 600), &[], &[], &[]);

        let mut pool = CaPool::new();
        assert!(!pool.is_blocklisted(&ca));

        pool.blocklist_certificate(&ca);
        assert!(pool.is_blocklisted(&ca));

        pool.reset_blocklist();
        assert!(!pool.is_blocklisted(&ca));
    }
}
