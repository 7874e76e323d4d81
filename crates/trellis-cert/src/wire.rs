//! Wire representation of certificates and encrypted keys
//!
//! Certificates serialize as a length-delimited structure with two top-level
//! fields: the details submessage and the signature over its encoding.
//! Addresses travel as pairs of 32-bit big-endian words (address, mask).

use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

use crate::error::{CertError, CertResult};

/// Top-level certificate wire structure
#[derive(Clone, PartialEq, prost::Message)]
pub struct RawCertificate {
    #[prost(message, optional, tag = "1")]
    pub details: Option<RawCertificateDetails>,
    #[prost(bytes = "vec", tag = "2")]
    pub signature: Vec<u8>,
}

/// Certificate details; the signature covers the encoding of this message
#[derive(Clone, PartialEq, prost::Message)]
pub struct RawCertificateDetails {
    #[prost(string, tag = "1")]
    pub name: String,
    /// (address, mask) pairs, big-endian words
    #[prost(uint32, repeated, tag = "2")]
    pub ips: Vec<u32>,
    #[prost(uint32, repeated, tag = "3")]
    pub subnets: Vec<u32>,
    #[prost(string, repeated, tag = "4")]
    pub groups: Vec<String>,
    #[prost(int64, tag = "5")]
    pub not_before: i64,
    #[prost(int64, tag = "6")]
    pub not_after: i64,
    #[prost(bytes = "vec", tag = "7")]
    pub public_key: Vec<u8>,
    #[prost(bool, tag = "8")]
    pub is_ca: bool,
    /// Raw SHA-256 of the signer's marshaled certificate
    #[prost(bytes = "vec", tag = "9")]
    pub issuer: Vec<u8>,
    #[prost(enumeration = "Curve", tag = "100")]
    pub curve: i32,
}

/// Signature curve of a certificate
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum Curve {
    Curve25519 = 0,
    P256 = 1,
}

impl std::fmt::Display for Curve {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Curve::Curve25519 => write!(f, "CURVE25519"),
            Curve::P256 => write!(f, "P256"),
        }
    }
}

/// Encrypted private key wire structure
#[derive(Clone, PartialEq, prost::Message)]
pub struct RawEncryptedData {
    #[prost(message, optional, tag = "1")]
    pub metadata: Option<RawEncryptionMetadata>,
    /// 12-byte nonce followed by the AEAD ciphertext
    #[prost(bytes = "vec", tag = "2")]
    pub ciphertext: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RawEncryptionMetadata {
    #[prost(string, tag = "1")]
    pub algorithm: String,
    #[prost(message, optional, tag = "2")]
    pub argon2: Option<RawArgon2Parameters>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RawArgon2Parameters {
    #[prost(int32, tag = "1")]
    pub version: i32,
    #[prost(uint32, tag = "2")]
    pub memory: u32,
    #[prost(uint32, tag = "3")]
    pub parallelism: u32,
    #[prost(uint32, tag = "4")]
    pub iterations: u32,
    #[prost(bytes = "vec", tag = "5")]
    pub salt: Vec<u8>,
}

/// Expand a network list into (address, mask) word pairs.
pub(crate) fn nets_to_words(nets: &[Ipv4Net]) -> Vec<u32> {
    let mut words = Vec::with_capacity(nets.len() * 2);
    for net in nets {
        words.push(u32::from(net.addr()));
        words.push(u32::from(net.netmask()));
    }
    words
}

/// Rebuild a network list from (address, mask) word pairs.
pub(crate) fn words_to_nets(words: &[u32], field: &'static str) -> CertResult<Vec<Ipv4Net>> {
    if words.len() % 2 != 0 {
        return Err(CertError::OddAddressCount(field));
    }

    let mut nets = Vec::with_capacity(words.len() / 2);
    for pair in words.chunks_exact(2) {
        let addr = Ipv4Addr::from(pair[0]);
        let prefix = mask_to_prefix(pair[1])?;
        // prefix is <= 32 here so construction cannot fail
        let net = Ipv4Net::new(addr, prefix).map_err(|_| CertError::InvalidMask)?;
        nets.push(net);
    }
    Ok(nets)
}

/// A mask word must be a contiguous run of ones.
fn mask_to_prefix(mask: u32) -> CertResult<u8> {
    let ones = mask.count_ones();
    let expected = if ones == 0 { 0 } else { u32::MAX << (32 - ones) };
    if mask != expected {
        return Err(CertError::InvalidMask);
    }
    Ok(ones as u8)
}
