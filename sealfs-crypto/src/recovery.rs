//! BIP39 recovery phrases.
//!
//! An administrator may protect the recovery keypair with a generated
//! 12-word phrase instead of a typed secret. The phrase is used as the
//! passphrase for [`crate::protect_private_key`]; its 128 bits of entropy
//! are what make it safe to write down on paper.

use rand::RngCore;

use crate::error::{CryptoError, CryptoResult};

/// Generates a 12-word BIP39 mnemonic.
pub fn generate_recovery_mnemonic() -> CryptoResult<String> {
    let mut entropy = [0u8; 16];
    rand::rng().fill_bytes(&mut entropy);

    let mnemonic = bip39::Mnemonic::from_entropy(&entropy)
        .map_err(|e| CryptoError::KeyDerivation(format!("mnemonic generation failed: {e}")))?;

    Ok(mnemonic.to_string())
}

/// Checks that `phrase` is a well-formed BIP39 mnemonic (word list and checksum).
pub fn validate_recovery_mnemonic(phrase: &str) -> CryptoResult<()> {
    let _: bip39::Mnemonic = phrase
        .parse()
        .map_err(|e| CryptoError::KeyDerivation(format!("invalid mnemonic: {e}")))?;
    Ok(())
}
