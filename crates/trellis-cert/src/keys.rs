//! Keypair generation for certificate issuance
//!
//! CA certificates sign with Ed25519 or ECDSA P-256; leaf certificates carry
//! X25519 or P-256 keys for the tunnel key agreement. All functions return
//! (public, private) raw byte pairs in the layout the certificate stores.

use ed25519_dalek::SigningKey;
use p256::elliptic_curve::sec1::ToEncodedPoint as _;
use rand::rngs::OsRng;
use rand::RngCore as _;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

/// Generate an Ed25519 keypair. The private half is the 64-byte seed+public
/// layout the signing code expects.
pub fn ed25519_keypair() -> (Vec<u8>, Vec<u8>) {
    let signing = SigningKey::generate(&mut OsRng);
    (
        signing.verifying_key().as_bytes().to_vec(),
        signing.to_keypair_bytes().to_vec(),
    )
}

/// Generate an X25519 keypair for a leaf certificate.
pub fn x25519_keypair() -> (Vec<u8>, Vec<u8>) {
    let mut scalar = [0u8; 32];
    OsRng.fill_bytes(&mut scalar);

    let secret = StaticSecret::from(scalar);
    let public = X25519Public::from(&secret);
    (public.as_bytes().to_vec(), secret.to_bytes().to_vec())
}

/// Generate a P-256 keypair. The public half is SEC1 encoded, compressed on
/// request (33 bytes) or uncompressed (65 bytes).
pub fn p256_keypair(compressed: bool) -> (Vec<u8>, Vec<u8>) {
    let secret = p256::SecretKey::random(&mut OsRng);
    let public = secret
        .public_key()
        .to_encoded_point(compressed)
        .as_bytes()
        .to_vec();
    (public, secret.to_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ed25519_layout() {
        let (public, private) = ed25519_keypair();
        assert_eq!(public.len(), 32);
        assert_eq!(private.len(), 64);
        // the public half is embedded in the tail of the private key
        assert_eq!(&private[32..], public.as_slice());
    }

    #[test]
    fn test_x25519_layout() {
        let (public, private) = x25519_keypair();
        assert_eq!(public.len(), 32);
        assert_eq!(private.len(), 32);
    }

    #[test]
    fn test_p256_layouts() {
        let (public, private) = p256_keypair(false);
        assert_eq!(public.len(), 65);
        assert_eq!(public[0], 0x04);
        assert_eq!(private.len(), 32);

        let (compressed, _) = p256_keypair(true);
        assert_eq!(compressed.len(), 33);
        assert!(compressed[0] == 0x02 || compressed[0] == 0x03);
    }
}
