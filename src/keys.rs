//! secp256k1 key material for signing community events.

use std::fmt;

use secp256k1::{Keypair, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("secret key is not valid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("secret key rejected: {0}")]
    Secp(#[from] secp256k1::Error),
}

/// Signing keypair. The secret never leaves the holder's process.
#[derive(Clone)]
pub struct Keys {
    keypair: Keypair,
}

impl Keys {
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let (secret, _) = secp.generate_keypair(&mut rand::thread_rng());
        Self {
            keypair: Keypair::from_secret_key(&secp, &secret),
        }
    }

    /// Recover keys from a pasted hex secret, re-deriving the public key.
    pub fn from_secret_hex(secret: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(secret.trim())?;
        let secret = SecretKey::from_slice(&bytes)?;
        let secp = Secp256k1::new();
        Ok(Self {
            keypair: Keypair::from_secret_key(&secp, &secret),
        })
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.keypair.secret_bytes())
    }

    /// X-only public key, hex encoded as it appears in `pubkey` fields.
    pub fn public_hex(&self) -> String {
        hex::encode(self.keypair.x_only_public_key().0.serialize())
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn to_pair(&self) -> KeyPairDto {
        KeyPairDto {
            nsec: self.secret_hex(),
            npub: self.public_hex(),
        }
    }
}

impl fmt::Debug for Keys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keys")
            .field("public", &self.public_hex())
            .field("secret", &mask_secret(&self.secret_hex()))
            .finish()
    }
}

/// Freshly generated pair as returned by `GET /community/keys`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyPairDto {
    pub nsec: String,
    pub npub: String,
}

/// Show only the first and last six characters of a secret.
pub fn mask_secret(secret: &str) -> String {
    if secret.len() <= 12 {
        return "*".repeat(secret.len());
    }
    format!("{}...{}", &secret[..6], &secret[secret.len() - 6..])
}
