//! Signing and verification boundary for commits
//!
//! Commits are signed over their canonical unsigned bytes. Every signature
//! format question lives behind [`Signer`] and [`Verifier`]: signers always
//! return 64-byte compact `r || s` signatures in low-S form, and verifiers
//! accept compact or DER input but reject high-S signatures. Nothing else in
//! the crate looks at signature bytes.

use crate::error::{BoxError, CommitError};
use bytes::Bytes;

/// Produces a detached signature over commit bytes
pub trait Signer {
    /// Sign the given data and return signature as Bytes
    fn sign(&self, data: &[u8]) -> Result<Bytes, CommitError>;
}

/// Checks a detached signature over commit bytes
pub trait Verifier {
    /// Verify `signature` over `data`
    fn verify(&self, data: &[u8], signature: &[u8]) -> Result<(), CommitError>;
}

impl<T: Signer + ?Sized> Signer for &T {
    fn sign(&self, data: &[u8]) -> Result<Bytes, CommitError> {
        (**self).sign(data)
    }
}

impl<T: Verifier + ?Sized> Verifier for &T {
    fn verify(&self, data: &[u8], signature: &[u8]) -> Result<(), CommitError> {
        (**self).verify(data, signature)
    }
}

/// Adapts a closure (an HSM call, a remote signer) into a [`Signer`]
///
/// The closure's output is passed through unchanged, so it must already be
/// in the compact low-S form.
///
/// ```
/// use thicket_repo::commit::{FnSigner, Signer};
///
/// let signer = FnSigner(|data: &[u8]| -> Result<Vec<u8>, std::io::Error> {
///     Ok(vec![data.len() as u8; 64])
/// });
/// assert_eq!(signer.sign(b"abc").unwrap().len(), 64);
/// ```
pub struct FnSigner<F>(pub F);

impl<F, E> Signer for FnSigner<F>
where
    F: Fn(&[u8]) -> Result<Vec<u8>, E>,
    E: Into<BoxError>,
{
    fn sign(&self, data: &[u8]) -> Result<Bytes, CommitError> {
        (self.0)(data)
            .map(Bytes::from)
            .map_err(|e| CommitError::Signing(e.into()))
    }
}

impl<F> std::fmt::Debug for FnSigner<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FnSigner(..)")
    }
}

/// Public key of either supported curve
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicKey {
    /// secp256k1
    K256(k256::ecdsa::VerifyingKey),
    /// NIST P-256
    P256(p256::ecdsa::VerifyingKey),
}

impl PublicKey {
    /// Parse a SEC1-encoded (compressed or uncompressed) secp256k1 key
    pub fn k256_from_sec1(bytes: &[u8]) -> Result<Self, CommitError> {
        k256::ecdsa::VerifyingKey::from_sec1_bytes(bytes)
            .map(Self::K256)
            .map_err(|e| CommitError::InvalidKey(e.to_string()))
    }

    /// Parse a SEC1-encoded (compressed or uncompressed) P-256 key
    pub fn p256_from_sec1(bytes: &[u8]) -> Result<Self, CommitError> {
        p256::ecdsa::VerifyingKey::from_sec1_bytes(bytes)
            .map(Self::P256)
            .map_err(|e| CommitError::InvalidKey(e.to_string()))
    }

    /// Compressed SEC1 encoding
    pub fn to_sec1_compressed(&self) -> Vec<u8> {
        match self {
            PublicKey::K256(key) => key.to_encoded_point(true).as_bytes().to_vec(),
            PublicKey::P256(key) => key.to_encoded_point(true).as_bytes().to_vec(),
        }
    }
}

impl Verifier for PublicKey {
    fn verify(&self, data: &[u8], signature: &[u8]) -> Result<(), CommitError> {
        match self {
            PublicKey::K256(key) => Verifier::verify(key, data, signature),
            PublicKey::P256(key) => Verifier::verify(key, data, signature),
        }
    }
}

// identical for both curves
macro_rules! ecdsa_impls {
    ($curve:ident) => {
        impl Signer for $curve::ecdsa::SigningKey {
            fn sign(&self, data: &[u8]) -> Result<Bytes, CommitError> {
                use $curve::ecdsa::signature::Signer as _;
                let sig: $curve::ecdsa::Signature = self
                    .try_sign(data)
                    .map_err(|e| CommitError::Signing(Box::new(e)))?;
                let sig = sig.normalize_s().unwrap_or(sig);
                Ok(Bytes::copy_from_slice(&sig.to_bytes()))
            }
        }

        impl Verifier for $curve::ecdsa::VerifyingKey {
            fn verify(&self, data: &[u8], signature: &[u8]) -> Result<(), CommitError> {
                let sig = match signature.len() {
                    64 => $curve::ecdsa::Signature::from_slice(signature),
                    _ => $curve::ecdsa::Signature::from_der(signature),
                }
                .map_err(|e| CommitError::InvalidSignature(e.to_string()))?;
                if sig.normalize_s().is_some() {
                    return Err(CommitError::HighS);
                }
                $curve::ecdsa::signature::Verifier::verify(self, data, &sig)
                    .map_err(|_| CommitError::SignatureVerificationFailed)
            }
        }

        impl Verifier for $curve::ecdsa::SigningKey {
            fn verify(&self, data: &[u8], signature: &[u8]) -> Result<(), CommitError> {
                Verifier::verify(self.verifying_key(), data, signature)
            }
        }
    };
}

ecdsa_impls!(k256);
ecdsa_impls!(p256);
