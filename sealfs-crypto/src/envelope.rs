//! Key wrapping for principals.
//!
//! File keys are sealed to a recipient's X25519 public key with an ephemeral
//! sender keypair and XSalsa20-Poly1305, so every wrap is randomized and the
//! sender stays anonymous. Private keys are protected at rest with an
//! Argon2id-derived key; a verification token sealed under the same derived
//! key lets unlock tell a wrong passphrase apart from damaged key material.

use crypto_box::aead::{Aead, OsRng};
use crypto_box::{PublicKey, SalsaBox, SecretKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::cipher::{self, EncryptedData};
use crate::error::{CryptoError, CryptoResult};
use crate::key::{KdfParams, Salt, derive_key};

/// Algorithm id recorded with every passphrase-protected private key.
pub const PRIVATE_KEY_ALGORITHM: &str = "argon2id+chacha20poly1305";

/// Known plaintext sealed next to a protected private key.
const VERIFICATION_PLAINTEXT: &[u8] = b"sealfs-private-key-verification-v1";

/// X25519 keypair of a principal.
///
/// The secret key implements `ZeroizeOnDrop` (from crypto_box).
pub struct KeyPair {
    pub secret: SecretKey,
    pub public: PublicKey,
}

impl KeyPair {
    pub fn public_bytes(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    /// Reconstructs a keypair from raw secret key bytes.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = SecretKey::from(bytes);
        let public = secret.public_key();
        Self { secret, public }
    }
}

/// Generates a new X25519 keypair.
pub fn generate_keypair() -> KeyPair {
    let secret = SecretKey::generate(&mut OsRng);
    let public = secret.public_key();
    KeyPair { secret, public }
}

/// Short, log-safe fingerprint of a public key (first 8 bytes of SHA-256, hex).
pub fn fingerprint(public_key: &[u8; 32]) -> String {
    let digest = Sha256::digest(public_key);
    hex::encode(&digest[..8])
}

/// A payload key sealed to one recipient public key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedEnvelope {
    /// Ephemeral X25519 public key (sender side of the DH).
    pub ephemeral_public_key: [u8; 32],
    /// XSalsa20 nonce.
    pub nonce: [u8; 24],
    /// Sealed payload plus Poly1305 tag.
    pub ciphertext: Vec<u8>,
}

/// Seals `payload` for `recipient`.
///
/// The fresh envelope is opened once with the ephemeral side of the box
/// before it is returned, so a wrap that would not unwrap never leaves this
/// function.
pub fn seal_key(payload: &[u8], recipient: &PublicKey) -> CryptoResult<SealedEnvelope> {
    let ephemeral = SecretKey::generate(&mut OsRng);
    let ephemeral_pk = ephemeral.public_key();
    let salsa_box = SalsaBox::new(recipient, &ephemeral);

    let mut nonce = [0u8; 24];
    rand::rng().fill_bytes(&mut nonce);
    let nonce_ref = crypto_box::Nonce::from_slice(&nonce);

    let ciphertext = salsa_box
        .encrypt(nonce_ref, payload)
        .map_err(|e| CryptoError::Encryption(format!("envelope seal failed: {e}")))?;

    let check = Zeroizing::new(
        salsa_box
            .decrypt(nonce_ref, ciphertext.as_ref())
            .map_err(|_| CryptoError::Encryption("envelope self-check failed".to_string()))?,
    );
    if check.as_slice() != payload {
        return Err(CryptoError::Encryption("envelope self-check mismatch".to_string()));
    }

    Ok(SealedEnvelope {
        ephemeral_public_key: *ephemeral_pk.as_bytes(),
        nonce,
        ciphertext,
    })
}

/// Opens a sealed envelope with the recipient's private key.
///
/// Fails with [`CryptoError::WrongKey`] if the key does not match or the
/// envelope was modified; never returns a best-effort payload.
pub fn open_key(envelope: &SealedEnvelope, recipient: &SecretKey) -> CryptoResult<Zeroizing<Vec<u8>>> {
    let ephemeral_pk = PublicKey::from(envelope.ephemeral_public_key);
    let salsa_box = SalsaBox::new(&ephemeral_pk, recipient);

    salsa_box
        .decrypt(
            crypto_box::Nonce::from_slice(&envelope.nonce),
            envelope.ciphertext.as_ref(),
        )
        .map(Zeroizing::new)
        .map_err(|_| CryptoError::WrongKey)
}

/// A private key wrapped under a passphrase-derived key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassphraseProtectedKey {
    pub algorithm: String,
    pub kdf: KdfParams,
    pub salt: Salt,
    /// Known plaintext sealed under the derived key.
    pub verification: EncryptedData,
    /// The private key sealed under the derived key.
    pub encrypted: EncryptedData,
}

/// Wraps `secret` under a key derived from `passphrase`.
pub fn protect_private_key(
    secret: &SecretKey,
    passphrase: &str,
    kdf: &KdfParams,
) -> CryptoResult<PassphraseProtectedKey> {
    let salt = Salt::random();
    let derived = derive_key(passphrase, &salt, kdf)?;
    let secret_bytes = Zeroizing::new(secret.to_bytes());

    Ok(PassphraseProtectedKey {
        algorithm: PRIVATE_KEY_ALGORITHM.to_string(),
        kdf: *kdf,
        salt,
        verification: cipher::encrypt(&derived, VERIFICATION_PLAINTEXT)?,
        encrypted: cipher::encrypt(&derived, &secret_bytes[..])?,
    })
}

/// Unwraps a passphrase-protected private key.
///
/// A wrong passphrase yields [`CryptoError::InvalidPassphrase`]; a correct
/// passphrase over damaged key material yields [`CryptoError::CorruptKey`].
pub fn unprotect_private_key(
    protected: &PassphraseProtectedKey,
    passphrase: &str,
) -> CryptoResult<SecretKey> {
    if protected.algorithm != PRIVATE_KEY_ALGORITHM {
        return Err(CryptoError::CorruptKey(format!(
            "unsupported algorithm {}",
            protected.algorithm
        )));
    }

    let derived = derive_key(passphrase, &protected.salt, &protected.kdf)?;

    let token = cipher::decrypt(&derived, &protected.verification)
        .map_err(|_| CryptoError::InvalidPassphrase)?;
    if token != VERIFICATION_PLAINTEXT {
        return Err(CryptoError::InvalidPassphrase);
    }

    let plaintext = Zeroizing::new(
        cipher::decrypt(&derived, &protected.encrypted)
            .map_err(|_| CryptoError::CorruptKey("private key does not decrypt".to_string()))?,
    );
    let bytes: [u8; 32] = plaintext.as_slice().try_into().map_err(|_| {
        CryptoError::CorruptKey(format!("private key is {} bytes", plaintext.len()))
    })?;
    Ok(SecretKey::from(bytes))
}
