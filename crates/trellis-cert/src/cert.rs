//! Overlay certificates
//!
//! A certificate binds a name, overlay addresses and group tags to a long-term
//! public key, signed by a certificate authority. Verification walks a fixed
//! pipeline: blocklist, signer lookup, validity windows, signature, and the
//! constraints the signing CA imposes on its leaves.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use ed25519_dalek::{Signer as _, Verifier as _};
use ipnet::Ipv4Net;
use p256::ecdsa::signature::{Signer as _, Verifier as _};
use p256::elliptic_curve::sec1::ToEncodedPoint as _;
use parking_lot::RwLock;
use prost::Message as _;
use serde::ser::{Serialize, SerializeMap, Serializer};
use sha2::{Digest, Sha256};

use crate::error::{CertError, CertResult};
use crate::pem;
use crate::pool::CaPool;
use crate::wire::{self, RawCertificate, RawCertificateDetails};

pub use crate::wire::Curve;

/// Minimum accepted public key length
pub const PUBLIC_KEY_LEN: usize = 32;

/// Ed25519 private keys carry the seed and the public half
pub const ED25519_PRIVATE_KEY_LEN: usize = 64;

/// The certificate fields covered by the signature
#[derive(Debug, Clone, PartialEq)]
pub struct CertificateDetails {
    pub name: String,
    pub ips: Vec<Ipv4Net>,
    pub subnets: Vec<Ipv4Net>,
    pub groups: Vec<String>,
    /// UNIX seconds, inclusive start of validity
    pub not_before: i64,
    /// UNIX seconds, inclusive end of validity
    pub not_after: i64,
    pub public_key: Vec<u8>,
    pub is_ca: bool,
    /// Hex fingerprint of the signing CA; empty when self-signed
    pub issuer: String,
    pub curve: Curve,

    /// Group set for O(1) subset checks
    pub inverted_groups: HashSet<String>,
}

impl CertificateDetails {
    /// Rebuild the derived group set after mutating `groups`.
    pub fn rebuild_inverted_groups(&mut self) {
        self.inverted_groups = self.groups.iter().cloned().collect();
    }
}

/// A signed certificate plus the caches used by verification
pub struct Certificate {
    pub details: CertificateDetails,
    /// Signed remotely through a PKCS#11 client; no key material is local
    pub pkcs11_backed: bool,
    pub signature: Vec<u8>,

    // One-shot memoization for verify_with_cache. Only reset_cache clears
    // these; mutating the certificate after caching is undefined.
    sha256sum: RwLock<Option<String>>,
    signature_verified: RwLock<Option<Vec<u8>>>,
}

/// Remote signer handle for PKCS#11 backed certificates
pub trait Pkcs11Signer {
    /// Sign and return an ASN.1-DER ECDSA signature over `data`.
    fn sign_asn1(&self, data: &[u8]) -> CertResult<Vec<u8>>;
}

impl Certificate {
    /// Build an unsigned certificate from details.
    pub fn unsigned(mut details: CertificateDetails) -> Self {
        details.rebuild_inverted_groups();
        Self {
            details,
            pkcs11_backed: false,
            signature: Vec::new(),
            sha256sum: RwLock::new(None),
            signature_verified: RwLock::new(None),
        }
    }

    /// Build an unsigned certificate whose key lives behind PKCS#11.
    pub fn unsigned_pkcs11(details: CertificateDetails) -> Self {
        let mut c = Self::unsigned(details);
        c.pkcs11_backed = true;
        c
    }

    /// Decode a certificate from its wire form.
    pub fn unmarshal(b: &[u8]) -> CertResult<Self> {
        if b.is_empty() {
            return Err(CertError::EmptyInput);
        }

        let raw = RawCertificate::decode(b)?;
        let rd = raw.details.ok_or(CertError::MissingDetails)?;

        if rd.public_key.len() < PUBLIC_KEY_LEN {
            return Err(CertError::ShortPublicKey(rd.public_key.len()));
        }

        let mut details = CertificateDetails {
            name: rd.name,
            ips: wire::words_to_nets(&rd.ips, "ips")?,
            subnets: wire::words_to_nets(&rd.subnets, "subnets")?,
            groups: rd.groups,
            not_before: rd.not_before,
            not_after: rd.not_after,
            public_key: rd.public_key,
            is_ca: rd.is_ca,
            issuer: hex::encode(&rd.issuer),
            curve: Curve::try_from(rd.curve).unwrap_or(Curve::Curve25519),
            inverted_groups: HashSet::new(),
        };
        details.rebuild_inverted_groups();

        Ok(Self {
            details,
            pkcs11_backed: false,
            signature: raw.signature,
            sha256sum: RwLock::new(None),
            signature_verified: RwLock::new(None),
        })
    }

    /// Decode the first certificate in a PEM bundle, returning the rest of
    /// the input for chained blocks.
    pub fn unmarshal_from_pem(b: &[u8]) -> CertResult<(Self, &[u8])> {
        let (block, rest) = pem::decode(b)?;
        if block.banner != pem::CERTIFICATE_BANNER {
            return Err(CertError::UnexpectedBanner(block.banner));
        }
        Ok((Self::unmarshal(&block.bytes)?, rest))
    }

    fn raw_details(&self) -> RawCertificateDetails {
        RawCertificateDetails {
            name: self.details.name.clone(),
            ips: wire::nets_to_words(&self.details.ips),
            subnets: wire::nets_to_words(&self.details.subnets),
            groups: self.details.groups.clone(),
            not_before: self.details.not_before,
            not_after: self.details.not_after,
            public_key: self.details.public_key.clone(),
            is_ca: self.details.is_ca,
            issuer: hex::decode(&self.details.issuer).unwrap_or_default(),
            curve: self.details.curve as i32,
        }
    }

    /// Encode to the wire form.
    pub fn marshal(&self) -> Vec<u8> {
        RawCertificate {
            details: Some(self.raw_details()),
            signature: self.signature.clone(),
        }
        .encode_to_vec()
    }

    /// Encode to the wire form and wrap in PEM.
    pub fn marshal_to_pem(&self) -> String {
        pem::encode(pem::CERTIFICATE_BANNER, &self.marshal())
    }

    /// Sign the certificate details with the provided private key.
    pub fn sign(&mut self, curve: Curve, key: &[u8]) -> CertResult<()> {
        if curve != self.details.curve {
            return Err(CertError::CurveMismatch);
        }

        let b = self.raw_details().encode_to_vec();

        let sig = match curve {
            Curve::Curve25519 => {
                let kp: &[u8; ED25519_PRIVATE_KEY_LEN] =
                    key.try_into().map_err(|_| CertError::InvalidKeyLength {
                        expected: ED25519_PRIVATE_KEY_LEN,
                        actual: key.len(),
                    })?;
                let signer = ed25519_dalek::SigningKey::from_keypair_bytes(kp)
                    .map_err(|_| CertError::InvalidPrivateKey(curve))?;
                signer.sign(&b).to_bytes().to_vec()
            }
            Curve::P256 => {
                let signer = p256::ecdsa::SigningKey::from_slice(key)
                    .map_err(|_| CertError::InvalidPrivateKey(curve))?;
                // ECDSA over the SHA-256 of the details, DER encoded
                let sig: p256::ecdsa::Signature = signer.sign(&b);
                sig.to_der().as_bytes().to_vec()
            }
        };

        self.signature = sig;
        Ok(())
    }

    /// Sign through a PKCS#11 client. Only P-256 is supported remotely.
    pub fn sign_pkcs11(&mut self, curve: Curve, client: &dyn Pkcs11Signer) -> CertResult<()> {
        if !self.pkcs11_backed {
            return Err(CertError::NotPkcs11Backed);
        }
        if curve != self.details.curve {
            return Err(CertError::CurveMismatch);
        }
        if curve != Curve::P256 {
            return Err(CertError::UnsupportedCurve(curve));
        }

        let b = self.raw_details().encode_to_vec();
        self.signature = client.sign_asn1(&b)?;
        Ok(())
    }

    /// Verify the signature against a public key. Returns false on any
    /// failure without distinguishing the cause.
    pub fn check_signature(&self, key: &[u8]) -> bool {
        let b = self.raw_details().encode_to_vec();
        match self.details.curve {
            Curve::Curve25519 => {
                let Ok(key) = key.try_into() else { return false };
                let Ok(vk) = ed25519_dalek::VerifyingKey::from_bytes(key) else {
                    return false;
                };
                let Ok(sig) = ed25519_dalek::Signature::from_slice(&self.signature) else {
                    return false;
                };
                vk.verify(&b, &sig).is_ok()
            }
            Curve::P256 => {
                let Ok(vk) = p256::ecdsa::VerifyingKey::from_sec1_bytes(key) else {
                    return false;
                };
                let Ok(sig) = p256::ecdsa::Signature::from_der(&self.signature) else {
                    return false;
                };
                vk.verify(&b, &sig).is_ok()
            }
        }
    }

    fn check_signature_with_cache(&self, key: &[u8], use_cache: bool) -> bool {
        if !use_cache {
            return self.check_signature(key);
        }

        if let Some(cached) = self.signature_verified.read().as_deref() {
            return cached == key;
        }

        let verified = self.check_signature(key);
        if verified {
            *self.signature_verified.write() = Some(key.to_vec());
        }
        verified
    }

    /// True when `at` (UNIX seconds) falls outside the validity window.
    pub fn expired(&self, at: i64) -> bool {
        self.details.not_before > at || self.details.not_after < at
    }

    /// Run the full verification pipeline against a CA pool.
    pub fn verify(&self, now: i64, pool: &CaPool) -> CertResult<()> {
        self.verify_inner(now, pool, false)
    }

    /// Like [`Certificate::verify`] but memoizes the fingerprint and the
    /// verifying public key. The caches are only cleared by
    /// [`Certificate::reset_cache`]; mutating the certificate after a cached
    /// verification is undefined.
    pub fn verify_with_cache(&self, now: i64, pool: &CaPool) -> CertResult<()> {
        self.verify_inner(now, pool, true)
    }

    /// Clear both verification caches.
    pub fn reset_cache(&self) {
        *self.sha256sum.write() = None;
        *self.signature_verified.write() = None;
    }

    fn verify_inner(&self, now: i64, pool: &CaPool, use_cache: bool) -> CertResult<()> {
        let fingerprint = self.fingerprint_with_cache(use_cache);
        if pool.is_blocklisted_fingerprint(&fingerprint) {
            return Err(CertError::Blocklisted);
        }

        // A certificate that is itself a trusted root checks against its own
        // key; there is no issuer to chase.
        if pool.get_by_fingerprint(&fingerprint).is_some() {
            if self.expired(now) {
                return Err(CertError::Expired);
            }
            if !self.check_signature_with_cache(&self.details.public_key, use_cache) {
                return Err(CertError::SignatureMismatch);
            }
            return Ok(());
        }

        let signer = pool.get_ca_for_cert(self)?;

        if signer.expired(now) {
            return Err(CertError::RootExpired);
        }

        if self.expired(now) {
            return Err(CertError::Expired);
        }

        if !self.check_signature_with_cache(&signer.details.public_key, use_cache) {
            return Err(CertError::SignatureMismatch);
        }

        self.check_root_constraints(signer)
    }

    /// Check the constraints the signing CA imposes on this certificate:
    /// validity containment, group subset, and address containment.
    pub fn check_root_constraints(&self, signer: &Certificate) -> CertResult<()> {
        if signer.details.not_after < self.details.not_after {
            return Err(CertError::ExpiresAfterSigner);
        }

        if signer.details.not_before > self.details.not_before {
            return Err(CertError::ValidBeforeSigner);
        }

        if !signer.details.inverted_groups.is_empty() {
            for group in &self.details.groups {
                if !signer.details.inverted_groups.contains(group) {
                    return Err(CertError::GroupNotOnSigner(group.clone()));
                }
            }
        }

        if !signer.details.ips.is_empty() {
            for ip in &self.details.ips {
                if !net_match(ip, &signer.details.ips) {
                    return Err(CertError::IpOutsideSignerRange(*ip));
                }
            }
        }

        if !signer.details.subnets.is_empty() {
            for subnet in &self.details.subnets {
                if !net_match(subnet, &signer.details.subnets) {
                    return Err(CertError::SubnetOutsideSignerRange(*subnet));
                }
            }
        }

        Ok(())
    }

    /// Check that a private key matches the public key in the certificate.
    pub fn verify_private_key(&self, curve: Curve, key: &[u8]) -> CertResult<()> {
        if self.pkcs11_backed {
            // No key material is held locally for PKCS#11 backed certs
            return Ok(());
        }
        if curve != self.details.curve {
            return Err(CertError::CurveMismatch);
        }

        let derived = match (self.details.is_ca, curve) {
            (true, Curve::Curve25519) => {
                let kp: &[u8; ED25519_PRIVATE_KEY_LEN] =
                    key.try_into().map_err(|_| CertError::InvalidKeyLength {
                        expected: ED25519_PRIVATE_KEY_LEN,
                        actual: key.len(),
                    })?;
                let sk = ed25519_dalek::SigningKey::from_keypair_bytes(kp)
                    .map_err(|_| CertError::InvalidPrivateKey(curve))?;
                sk.verifying_key().as_bytes().to_vec()
            }
            (false, Curve::Curve25519) => {
                let scalar: [u8; 32] = key.try_into().map_err(|_| CertError::InvalidKeyLength {
                    expected: 32,
                    actual: key.len(),
                })?;
                let secret = x25519_dalek::StaticSecret::from(scalar);
                x25519_dalek::PublicKey::from(&secret).as_bytes().to_vec()
            }
            (_, Curve::P256) => {
                let sk = p256::SecretKey::from_slice(key)
                    .map_err(|_| CertError::InvalidPrivateKey(curve))?;
                sk.public_key().to_encoded_point(false).as_bytes().to_vec()
            }
        };

        if derived != self.details.public_key {
            return Err(CertError::PublicKeyMismatch);
        }
        Ok(())
    }

    /// Hex SHA-256 of the marshaled certificate; the identity of a CA and
    /// the key into the blocklist.
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(self.marshal()))
    }

    pub(crate) fn fingerprint_with_cache(&self, use_cache: bool) -> String {
        if !use_cache {
            return self.fingerprint();
        }

        if let Some(cached) = self.sha256sum.read().as_ref() {
            return cached.clone();
        }

        let sum = self.fingerprint();
        *self.sha256sum.write() = Some(sum.clone());
        sum
    }
}

impl Clone for Certificate {
    fn clone(&self) -> Self {
        Self {
            details: self.details.clone(),
            pkcs11_backed: self.pkcs11_backed,
            signature: self.signature.clone(),
            sha256sum: RwLock::new(None),
            signature_verified: RwLock::new(None),
        }
    }
}

impl PartialEq for Certificate {
    fn eq(&self, other: &Self) -> bool {
        self.details == other.details && self.signature == other.signature
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("details", &self.details)
            .field("signature", &hex::encode(&self.signature))
            .finish()
    }
}

impl fmt::Display for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Certificate {{")?;
        writeln!(f, "    name: {}", self.details.name)?;
        writeln!(f, "    ips: {:?}", self.details.ips)?;
        writeln!(f, "    subnets: {:?}", self.details.subnets)?;
        writeln!(f, "    groups: {:?}", self.details.groups)?;
        writeln!(f, "    not before: {}", rfc3339(self.details.not_before))?;
        writeln!(f, "    not after: {}", rfc3339(self.details.not_after))?;
        writeln!(f, "    is ca: {}", self.details.is_ca)?;
        writeln!(f, "    issuer: {}", self.details.issuer)?;
        writeln!(f, "    public key: {}", hex::encode(&self.details.public_key))?;
        writeln!(f, "    curve: {}", self.details.curve)?;
        writeln!(f, "    fingerprint: {}", self.fingerprint())?;
        writeln!(f, "    signature: {}", hex::encode(&self.signature))?;
        write!(f, "}}")
    }
}

impl Serialize for Certificate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        struct Details<'a>(&'a CertificateDetails);

        impl Serialize for Details<'_> {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                let d = self.0;
                let mut map = serializer.serialize_map(Some(10))?;
                map.serialize_entry("name", &d.name)?;
                map.serialize_entry(
                    "ips",
                    &d.ips.iter().map(|n| n.to_string()).collect::<Vec<_>>(),
                )?;
                map.serialize_entry(
                    "subnets",
                    &d.subnets.iter().map(|n| n.to_string()).collect::<Vec<_>>(),
                )?;
                map.serialize_entry("groups", &d.groups)?;
                map.serialize_entry("notBefore", &rfc3339(d.not_before))?;
                map.serialize_entry("notAfter", &rfc3339(d.not_after))?;
                map.serialize_entry("publicKey", &hex::encode(&d.public_key))?;
                map.serialize_entry("isCa", &d.is_ca)?;
                map.serialize_entry("issuer", &d.issuer)?;
                map.serialize_entry("curve", &d.curve.to_string())?;
                map.end()
            }
        }

        let mut map = serializer.serialize_map(Some(3))?;
        map.serialize_entry("details", &Details(&self.details))?;
        map.serialize_entry("fingerprint", &self.fingerprint())?;
        map.serialize_entry("signature", &hex::encode(&self.signature))?;
        map.end()
    }
}

fn rfc3339(secs: i64) -> String {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_else(|| secs.to_string())
}

/// True when `cert_net` falls inside one of the signer ranges: the address is
/// covered and the signer mask is at least as wide.
fn net_match(cert_net: &Ipv4Net, signer_nets: &[Ipv4Net]) -> bool {
    signer_nets
        .iter()
        .any(|s| s.contains(&cert_net.addr()) && s.prefix_len() <= cert_net.prefix_len())
}
