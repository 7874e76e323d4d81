//! Certificates for the trellis mesh overlay
//!
//! Every participant in the overlay is identified by a certificate binding a
//! name, a set of overlay addresses and group tags to a long-term public key.
//! This crate provides:
//! - The certificate model: wire encoding, PEM framing, signing and the
//!   verification pipeline (Ed25519 or ECDSA P-256)
//! - The CA pool with its fingerprint blocklist
//! - Private-key storage formats, including Argon2id/AES-256-GCM encrypted
//!   PEM blocks
//! - Keypair generation for issuance

pub mod cert;
pub mod error;
pub mod keys;
pub mod pem;
pub mod pool;
pub mod wire;

#[cfg(test)]
mod test_support;

pub use cert::{Certificate, CertificateDetails, Curve, Pkcs11Signer, PUBLIC_KEY_LEN};
pub use error::{CertError, CertResult};
pub use pem::{Argon2Parameters, PemBlock};
pub use pool::CaPool;
