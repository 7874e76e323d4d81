//! PEM framing for certificates and keys
//!
//! The canonical textual form of a certificate and of private/public keys is
//! PEM: a banner line, base64 of the wire bytes wrapped at 64 columns, and a
//! closing banner. Encrypted private keys carry an Argon2id-derived
//! AES-256-GCM sealed payload with the KDF parameters stored alongside.

use aes_gcm::aead::Aead as _;
use aes_gcm::{Aes256Gcm, KeyInit as _, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use prost::Message as _;
use rand::RngCore as _;

use crate::cert::{Curve, ED25519_PRIVATE_KEY_LEN};
use crate::error::{CertError, CertResult};
use crate::wire::{RawArgon2Parameters, RawEncryptedData, RawEncryptionMetadata};

pub const CERTIFICATE_BANNER: &str = "NEBULA CERTIFICATE";

pub const ED25519_PRIVATE_KEY_BANNER: &str = "NEBULA ED25519 PRIVATE KEY";
pub const ED25519_PUBLIC_KEY_BANNER: &str = "NEBULA ED25519 PUBLIC KEY";
pub const X25519_PRIVATE_KEY_BANNER: &str = "NEBULA X25519 PRIVATE KEY";
pub const X25519_PUBLIC_KEY_BANNER: &str = "NEBULA X25519 PUBLIC KEY";
pub const P256_PRIVATE_KEY_BANNER: &str = "NEBULA ECDSA P256 PRIVATE KEY";
pub const P256_PUBLIC_KEY_BANNER: &str = "NEBULA ECDSA P256 PUBLIC KEY";

pub const ENCRYPTED_ED25519_PRIVATE_KEY_BANNER: &str = "NEBULA ED25519 ENCRYPTED PRIVATE KEY";
pub const ENCRYPTED_P256_PRIVATE_KEY_BANNER: &str = "NEBULA ECDSA P256 ENCRYPTED PRIVATE KEY";

const ENCRYPTION_ALGORITHM: &str = "AES-256-GCM";
const AEAD_KEY_LEN: usize = 32;
const AEAD_NONCE_LEN: usize = 12;

/// One decoded PEM block
#[derive(Debug, Clone, PartialEq)]
pub struct PemBlock {
    pub banner: String,
    pub bytes: Vec<u8>,
}

/// Wrap `bytes` in a PEM block with the given banner.
pub fn encode(banner: &str, bytes: &[u8]) -> String {
    let mut out = format!("-----BEGIN {banner}-----\n");
    let b64 = BASE64.encode(bytes);
    for chunk in b64.as_bytes().chunks(64) {
        // chunks of an ASCII string stay valid UTF-8
        out.push_str(std::str::from_utf8(chunk).unwrap_or_default());
        out.push('\n');
    }
    out.push_str(&format!("-----END {banner}-----\n"));
    out
}

/// Decode the first PEM block in `input`, returning it together with the
/// remaining input after the closing banner.
pub fn decode(input: &[u8]) -> CertResult<(PemBlock, &[u8])> {
    let text = std::str::from_utf8(input).map_err(|_| CertError::InvalidPem)?;

    let begin_start = text.find("-----BEGIN ").ok_or(CertError::InvalidPem)?;
    let after_begin = &text[begin_start + "-----BEGIN ".len()..];
    let banner_end = after_begin.find("-----").ok_or(CertError::InvalidPem)?;
    let banner = &after_begin[..banner_end];

    let body_start = begin_start
        + "-----BEGIN ".len()
        + banner_end
        + "-----".len();
    let end_marker = format!("-----END {banner}-----");
    let end_rel = text[body_start..]
        .find(&end_marker)
        .ok_or(CertError::InvalidPem)?;

    let body: String = text[body_start..body_start + end_rel]
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    let bytes = BASE64.decode(body).map_err(|_| CertError::InvalidPem)?;

    let mut rest_start = body_start + end_rel + end_marker.len();
    // swallow the newline after the closing banner
    if text[rest_start..].starts_with('\n') {
        rest_start += 1;
    } else if text[rest_start..].starts_with("\r\n") {
        rest_start += 2;
    }

    Ok((
        PemBlock {
            banner: banner.to_string(),
            bytes,
        },
        &input[rest_start..],
    ))
}

fn decode_expecting<'a>(input: &'a [u8], banner: &str, len: usize) -> CertResult<(Vec<u8>, &'a [u8])> {
    let (block, rest) = decode(input)?;
    if block.banner != banner {
        return Err(CertError::UnexpectedBanner(block.banner));
    }
    if block.bytes.len() != len {
        return Err(CertError::InvalidKeyLength {
            expected: len,
            actual: block.bytes.len(),
        });
    }
    Ok((block.bytes, rest))
}

/// PEM-encode a signing private key for the given curve.
pub fn marshal_signing_private_key(curve: Curve, key: &[u8]) -> String {
    match curve {
        Curve::Curve25519 => encode(ED25519_PRIVATE_KEY_BANNER, key),
        Curve::P256 => encode(P256_PRIVATE_KEY_BANNER, key),
    }
}

/// Parse a signing private key PEM, returning the curve it belongs to.
pub fn unmarshal_signing_private_key(input: &[u8]) -> CertResult<(Curve, Vec<u8>, &[u8])> {
    let (block, rest) = decode(input)?;
    match block.banner.as_str() {
        ED25519_PRIVATE_KEY_BANNER => {
            if block.bytes.len() != ED25519_PRIVATE_KEY_LEN {
                return Err(CertError::InvalidKeyLength {
                    expected: ED25519_PRIVATE_KEY_LEN,
                    actual: block.bytes.len(),
                });
            }
            Ok((Curve::Curve25519, block.bytes, rest))
        }
        P256_PRIVATE_KEY_BANNER => {
            if block.bytes.len() != 32 {
                return Err(CertError::InvalidKeyLength {
                    expected: 32,
                    actual: block.bytes.len(),
                });
            }
            Ok((Curve::P256, block.bytes, rest))
        }
        other => Err(CertError::UnexpectedBanner(other.to_string())),
    }
}

pub fn marshal_x25519_private_key(key: &[u8]) -> String {
    encode(X25519_PRIVATE_KEY_BANNER, key)
}

pub fn unmarshal_x25519_private_key(input: &[u8]) -> CertResult<(Vec<u8>, &[u8])> {
    decode_expecting(input, X25519_PRIVATE_KEY_BANNER, 32)
}

pub fn marshal_x25519_public_key(key: &[u8]) -> String {
    encode(X25519_PUBLIC_KEY_BANNER, key)
}

pub fn unmarshal_x25519_public_key(input: &[u8]) -> CertResult<(Vec<u8>, &[u8])> {
    decode_expecting(input, X25519_PUBLIC_KEY_BANNER, 32)
}

pub fn marshal_ed25519_public_key(key: &[u8]) -> String {
    encode(ED25519_PUBLIC_KEY_BANNER, key)
}

pub fn unmarshal_ed25519_public_key(input: &[u8]) -> CertResult<(Vec<u8>, &[u8])> {
    decode_expecting(input, ED25519_PUBLIC_KEY_BANNER, 32)
}

/// Argon2id parameters stored next to an encrypted private key
#[derive(Debug, Clone, PartialEq)]
pub struct Argon2Parameters {
    pub version: i32,
    /// KiB
    pub memory: u32,
    pub parallelism: u32,
    pub iterations: u32,
    pub salt: Vec<u8>,
}

impl Argon2Parameters {
    /// Parameters with a fresh random salt.
    pub fn new(memory: u32, parallelism: u32, iterations: u32) -> Self {
        let mut salt = vec![0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        Self {
            version: 0x13,
            memory,
            parallelism,
            iterations,
            salt,
        }
    }

    fn derive_key(&self, passphrase: &[u8]) -> CertResult<[u8; AEAD_KEY_LEN]> {
        let version = argon2::Version::try_from(self.version as u32)
            .map_err(|e| CertError::KeyDerivation(e.to_string()))?;
        let params = argon2::Params::new(
            self.memory,
            self.iterations,
            self.parallelism,
            Some(AEAD_KEY_LEN),
        )
        .map_err(|e| CertError::KeyDerivation(e.to_string()))?;
        let argon = argon2::Argon2::new(argon2::Algorithm::Argon2id, version, params);

        let mut key = [0u8; AEAD_KEY_LEN];
        argon
            .hash_password_into(passphrase, &self.salt, &mut key)
            .map_err(|e| CertError::KeyDerivation(e.to_string()))?;
        Ok(key)
    }
}

/// Seal a signing private key under a passphrase and PEM-encode the result.
pub fn encrypt_and_marshal_signing_private_key(
    curve: Curve,
    key: &[u8],
    passphrase: &[u8],
    params: &Argon2Parameters,
) -> CertResult<String> {
    let aead_key = params.derive_key(passphrase)?;
    let cipher = Aes256Gcm::new_from_slice(&aead_key).map_err(|_| CertError::DecryptionFailed)?;

    let mut nonce = [0u8; AEAD_NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), key)
        .map_err(|_| CertError::DecryptionFailed)?;

    let mut blob = nonce.to_vec();
    blob.extend_from_slice(&ciphertext);

    let raw = RawEncryptedData {
        metadata: Some(RawEncryptionMetadata {
            algorithm: ENCRYPTION_ALGORITHM.to_string(),
            argon2: Some(RawArgon2Parameters {
                version: params.version,
                memory: params.memory,
                parallelism: params.parallelism,
                iterations: params.iterations,
                salt: params.salt.clone(),
            }),
        }),
        ciphertext: blob,
    };

    let banner = match curve {
        Curve::Curve25519 => ENCRYPTED_ED25519_PRIVATE_KEY_BANNER,
        Curve::P256 => ENCRYPTED_P256_PRIVATE_KEY_BANNER,
    };
    Ok(encode(banner, &raw.encode_to_vec()))
}

/// Open an encrypted signing private key PEM with a passphrase.
pub fn decrypt_and_unmarshal_signing_private_key<'a>(
    input: &'a [u8],
    passphrase: &[u8],
) -> CertResult<(Curve, Vec<u8>, &'a [u8])> {
    let (block, rest) = decode(input)?;
    let curve = match block.banner.as_str() {
        ENCRYPTED_ED25519_PRIVATE_KEY_BANNER => Curve::Curve25519,
        ENCRYPTED_P256_PRIVATE_KEY_BANNER => Curve::P256,
        other => return Err(CertError::UnexpectedBanner(other.to_string())),
    };

    let raw = RawEncryptedData::decode(block.bytes.as_slice())?;
    let metadata = raw.metadata.ok_or(CertError::DecryptionFailed)?;
    if metadata.algorithm != ENCRYPTION_ALGORITHM {
        return Err(CertError::UnsupportedEncryptionScheme(metadata.algorithm));
    }
    let argon2 = metadata.argon2.ok_or(CertError::DecryptionFailed)?;
    let params = Argon2Parameters {
        version: argon2.version,
        memory: argon2.memory,
        parallelism: argon2.parallelism,
        iterations: argon2.iterations,
        salt: argon2.salt,
    };

    if raw.ciphertext.len() < AEAD_NONCE_LEN {
        return Err(CertError::DecryptionFailed);
    }
    let (nonce, ciphertext) = raw.ciphertext.split_at(AEAD_NONCE_LEN);

    let aead_key = params.derive_key(passphrase)?;
    let cipher = Aes256Gcm::new_from_slice(&aead_key).map_err(|_| CertError::DecryptionFailed)?;
    let key = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CertError::DecryptionFailed)?;

    Ok((curve, key, rest))
}
