//! Certificate errors

use ipnet::Ipv4Net;
use thiserror::Error;

/// Certificate parsing, signing and verification errors
#[derive(Debug, Error)]
pub enum CertError {
    /// Certificate fingerprint is present in the pool blocklist
    #[error("certificate is in the block list")]
    Blocklisted,

    /// No CA in the pool matches the certificate issuer (or no issuer is set)
    #[error("certificate signed by unknown certificate authority")]
    RootNotFound,

    /// The signing CA is outside its validity window
    #[error("root certificate is expired")]
    RootExpired,

    /// The certificate is outside its validity window
    #[error("certificate is expired")]
    Expired,

    /// Signature does not verify against the signer's public key
    #[error("certificate signature did not match")]
    SignatureMismatch,

    /// Leaf validity extends past the signing certificate
    #[error("certificate expires after signing certificate")]
    ExpiresAfterSigner,

    /// Leaf validity starts before the signing certificate
    #[error("certificate is valid before the signing certificate")]
    ValidBeforeSigner,

    /// Leaf carries a group the signing CA is not allowed to issue
    #[error("certificate contained a group not present on the signing ca: {0}")]
    GroupNotOnSigner(String),

    /// Leaf carries an address outside the signing CA's ranges
    #[error("certificate contained an ip assignment outside the limitations of the signing ca: {0}")]
    IpOutsideSignerRange(Ipv4Net),

    /// Leaf carries a subnet outside the signing CA's ranges
    #[error("certificate contained a subnet assignment outside the limitations of the signing ca: {0}")]
    SubnetOutsideSignerRange(Ipv4Net),

    /// Empty input handed to an unmarshal function
    #[error("empty byte slice")]
    EmptyInput,

    /// Wire decoding failed
    #[error("certificate decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// The wire form carried no details submessage
    #[error("encoded details was missing")]
    MissingDetails,

    /// Address words must come in (address, mask) pairs
    #[error("encoded {0} should be in pairs, an odd number was found")]
    OddAddressCount(&'static str),

    /// A wire mask was not a contiguous prefix
    #[error("encoded netmask is not a valid prefix")]
    InvalidMask,

    /// Public key shorter than the minimum length
    #[error("public key was fewer than 32 bytes; got {0}")]
    ShortPublicKey(usize),

    /// Key material did not match the expected length for the curve
    #[error("key was not {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Key material could not be parsed for the declared curve
    #[error("invalid private key for curve {0}")]
    InvalidPrivateKey(crate::cert::Curve),

    /// Public key bytes could not be parsed for the declared curve
    #[error("invalid public key for curve {0}")]
    InvalidPublicKey(crate::cert::Curve),

    /// Certificate curve and supplied key curve disagree
    #[error("curve in cert and private key supplied don't match")]
    CurveMismatch,

    /// Derived public key differs from the one in the certificate
    #[error("public key in cert and private key supplied don't match")]
    PublicKeyMismatch,

    /// PEM framing was malformed or truncated
    #[error("invalid PEM data")]
    InvalidPem,

    /// A PEM block carried an unexpected banner
    #[error("bytes did not contain a proper banner: {0}")]
    UnexpectedBanner(String),

    /// Certificate pool rejected a non-CA certificate
    #[error("only certificate authorities can be added to the pool")]
    NotACa,

    /// Operation requires a PKCS#11 backed certificate (or must not have one)
    #[error("certificate is not PKCS#11 backed")]
    NotPkcs11Backed,

    /// The operation is not available for the declared curve
    #[error("invalid curve: {0}")]
    UnsupportedCurve(crate::cert::Curve),

    /// Remote signing through the PKCS#11 client failed
    #[error("pkcs11 signing failed: {0}")]
    Pkcs11(String),

    /// Key encryption scheme in an encrypted private key is not supported
    #[error("unsupported key encryption scheme: {0}")]
    UnsupportedEncryptionScheme(String),

    /// Argon2 key derivation failed
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    /// Wrong passphrase or corrupted ciphertext
    #[error("invalid passphrase or corrupt private key")]
    DecryptionFailed,
}

/// Result type for certificate operations
pub type CertResult<T> = Result<T, CertError>;
