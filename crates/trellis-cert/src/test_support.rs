//! Shared certificate fixtures for tests

use std::collections::HashSet;

use ipnet::Ipv4Net;

use crate::cert::{Certificate, CertificateDetails, Curve};
use crate::keys;

/// Current UNIX time in seconds.
pub(crate) fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// A validity window as offsets from now.
pub(crate) fn window(start_off: i64, end_off: i64) -> (i64, i64) {
    let n = now();
    (n + start_off, n + end_off)
}

/// Build a self-signed CA. Returns the certificate with its raw public and
/// private key bytes.
pub(crate) fn new_test_ca(
    curve: Curve,
    (not_before, not_after): (i64, i64),
    ips: &[Ipv4Net],
    subnets: &[Ipv4Net],
    groups: &[&str],
) -> (Certificate, Vec<u8>, Vec<u8>) {
    let (public, private) = match curve {
        Curve::Curve25519 => keys::ed25519_keypair(),
        Curve::P256 => keys::p256_keypair(false),
    };

    let details = CertificateDetails {
        name: "test ca".to_string(),
        ips: ips.to_vec(),
        subnets: subnets.to_vec(),
        groups: groups.iter().map(|g| g.to_string()).collect(),
        not_before,
        not_after,
        public_key: public.clone(),
        is_ca: true,
        issuer: String::new(),
        curve,
        inverted_groups: HashSet::new(),
    };

    let mut cert = Certificate::unsigned(details);
    cert.sign(curve, &private).expect("sign test ca");
    (cert, public, private)
}

/// Build a leaf signed by `ca`.
pub(crate) fn new_test_cert(
    ca: &Certificate,
    ca_key: &[u8],
    name: &str,
    (not_before, not_after): (i64, i64),
    ips: &[Ipv4Net],
    subnets: &[Ipv4Net],
    groups: &[&str],
) -> (Certificate, Vec<u8>, Vec<u8>) {
    let curve = ca.details.curve;
    let (public, private) = match curve {
        Curve::Curve25519 => keys::x25519_keypair(),
        Curve::P256 => keys::p256_keypair(false),
    };

    let details = CertificateDetails {
        name: name.to_string(),
        ips: ips.to_vec(),
        subnets: subnets.to_vec(),
        groups: groups.iter().map(|g| g.to_string()).collect(),
        not_before,
        not_after,
        public_key: public.clone(),
        is_ca: false,
        issuer: ca.fingerprint(),
        curve,
        inverted_groups: HashSet::new(),
    };

    let mut cert = Certificate::unsigned(details);
    cert.sign(curve, ca_key).expect("sign test cert");
    (cert, public, private)
}
