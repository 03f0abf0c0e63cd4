//! Keypair generation for gateway access tokens
//!
//! The gateway signs the JWTs it hands out with a private key and verifies
//! them with the public half. Both halves are generated here and armored as
//! PEM so they can be stored in a Secret:
//!
//! - `key.pem`: PKCS#1 `RSA PRIVATE KEY`
//! - `cert.pem`: PKIX public key under a `CERTIFICATE` label, which is what
//!   the gateway proxy reads at startup
//!
//! Key material is never logged. [`Keypair`] redacts itself in `Debug` and
//! wipes the private PEM on drop.

use std::fmt;

use rand::rngs::OsRng;
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey, LineEnding};
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use thiserror::Error;
use zeroize::Zeroizing;

#[cfg(test)]
use mockall::automock;

/// RSA modulus size for generated keys
pub const KEY_BITS: usize = 4096;

/// PEM label of the public key block
pub const PUBLIC_KEY_LABEL: &str = "CERTIFICATE";

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Generated key did not pass its consistency check
    #[error("generated key is invalid: {0}")]
    InvalidKey(String),

    /// Key could not be PEM encoded
    #[error("key encoding failed: {0}")]
    EncodingFailed(String),

    /// PEM data could not be parsed
    #[error("key parsing error: {0}")]
    ParseError(String),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// A PEM-encoded keypair
#[derive(Clone)]
pub struct Keypair {
    private_key_pem: Zeroizing<Vec<u8>>,
    public_key_pem: Vec<u8>,
}

impl Keypair {
    /// Build a keypair from already encoded halves
    pub fn from_pem(private_key_pem: Vec<u8>, public_key_pem: Vec<u8>) -> Self {
        Self {
            private_key_pem: Zeroizing::new(private_key_pem),
            public_key_pem,
        }
    }

    /// PEM-encoded private key
    pub fn private_key_pem(&self) -> &[u8] {
        &self.private_key_pem
    }

    /// PEM-encoded public key
    pub fn public_key_pem(&self) -> &[u8] {
        &self.public_key_pem
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("private_key_pem", &"<redacted>")
            .field("public_key_pem_len", &self.public_key_pem.len())
            .finish()
    }
}

/// Source of signing keypairs
///
/// Generation is CPU-bound and may take seconds; callers in async code should
/// run it on a blocking thread.
#[cfg_attr(test, automock)]
pub trait KeypairGenerator: Send + Sync {
    /// Generate a fresh, independent keypair
    fn generate(&self) -> Result<Keypair>;
}

/// RSA-4096 keypair generator backed by the OS random source
#[derive(Clone, Debug, Default)]
pub struct RsaKeypairGenerator;

impl RsaKeypairGenerator {
    /// Create a new generator
    pub fn new() -> Self {
        Self
    }
}

impl KeypairGenerator for RsaKeypairGenerator {
    fn generate(&self) -> Result<Keypair> {
        let private_key = RsaPrivateKey::new(&mut OsRng, KEY_BITS).map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate RSA key: {}", e))
        })?;

        private_key
            .validate()
            .map_err(|e| PkiError::InvalidKey(e.to_string()))?;

        let private_key_pem = encode_private_key(&private_key)?;
        let public_key_pem = encode_public_key(&private_key.to_public_key())?;

        Ok(Keypair {
            private_key_pem,
            public_key_pem,
        })
    }
}

fn encode_private_key(key: &RsaPrivateKey) -> Result<Zeroizing<Vec<u8>>> {
    let pem = key
        .to_pkcs1_pem(LineEnding::LF)
        .map_err(|e| PkiError::EncodingFailed(format!("private key: {}", e)))?;
    Ok(Zeroizing::new(pem.as_bytes().to_vec()))
}

fn encode_public_key(key: &RsaPublicKey) -> Result<Vec<u8>> {
    let der = key
        .to_public_key_der()
        .map_err(|e| PkiError::EncodingFailed(format!("public key: {}", e)))?;

    let block = ::pem::Pem::new(PUBLIC_KEY_LABEL, der.as_bytes().to_vec());
    let config = ::pem::EncodeConfig::new().set_line_ending(::pem::LineEnding::LF);
    Ok(::pem::encode_config(&block, config).into_bytes())
}

/// Parse and validate an encoded keypair
///
/// Checks that both blocks carry the expected labels, that the private key
/// passes its consistency check, and that the public half belongs to it.
/// Returns the modulus size in bits.
pub fn verify_keypair(keypair: &Keypair) -> Result<usize> {
    let private_pem = std::str::from_utf8(keypair.private_key_pem())
        .map_err(|e| PkiError::ParseError(format!("private key is not UTF-8: {}", e)))?;
    let private_key = RsaPrivateKey::from_pkcs1_pem(private_pem)
        .map_err(|e| PkiError::ParseError(format!("failed to parse private key: {}", e)))?;
    private_key
        .validate()
        .map_err(|e| PkiError::InvalidKey(e.to_string()))?;

    let block = ::pem::parse(keypair.public_key_pem())
        .map_err(|e| PkiError::ParseError(format!("failed to parse public key PEM: {}", e)))?;
    if block.tag() != PUBLIC_KEY_LABEL {
        return Err(PkiError::ParseError(format!(
            "unexpected public key label: {}",
            block.tag()
        )));
    }
    let public_key = RsaPublicKey::from_public_key_der(block.contents())
        .map_err(|e| PkiError::ParseError(format!("failed to parse public key: {}", e)))?;

    if public_key != private_key.to_public_key() {
        return Err(PkiError::InvalidKey(
            "public key does not match private key".to_string(),
        ));
    }

    Ok(private_key.size() * 8)
}
