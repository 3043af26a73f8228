//! Nostr event model, canonical hashing, signing and verification.

use std::time::{SystemTime, UNIX_EPOCH};

use secp256k1::{schnorr::Signature, Message, Secp256k1, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::keys::Keys;

/// Short text note.
pub const KIND_NOTE: u32 = 1;
/// Deletion request referencing other events through `e` tags.
pub const KIND_DELETION: u32 = 5;

/// Wrapper for a Nostr tag expressed as an array of strings.
///
/// Tags appear as small arrays where the first element denotes the type and the
/// following elements hold data. The community feed relies on:
///
/// - `t` – topic scope (community marker or subject)
/// - `g` – grade or level
/// - `perm` / `role` – reply permission and author role
/// - `p` – author public key, duplicated for author search
/// - `e` – parent event (replies) or retracted event (deletions)
/// - `edit-of` – event superseded by this one
///
/// Each tag is kept verbatim so uncommon tags survive a round trip.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Build a two-element `[key, value]` tag.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Tag(vec![key.into(), value.into()])
    }

    pub fn key(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }
}

/// Signed Nostr event as exchanged with relays and API clients.
///
/// ```json
/// {
///   "id": "aa11",
///   "pubkey": "79be...",
///   "kind": 1,
///   "created_at": 1700000000,
///   "tags": [["t", "blueorb"], ["g", "Primary 3"]],
///   "content": "What is 2+2?",
///   "sig": "deadbeef"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash).
    pub id: String,
    /// Author public key (hex, x-only).
    pub pubkey: String,
    /// Kind number, `1` for notes and `5` for deletions here.
    pub kind: u32,
    /// Unix timestamp of creation.
    pub created_at: u64,
    pub tags: Vec<Tag>,
    /// Event content body.
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

#[derive(Debug, Error)]
pub enum EventError {
    #[error("event id does not match its content")]
    IdMismatch,
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("invalid signature: {0}")]
    Signature(#[from] secp256k1::Error),
    #[error("serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

impl Event {
    /// Values of every tag whose first element is `key`.
    pub fn tag_values<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |t| t.key() == Some(key))
            .filter_map(Tag::value)
    }

    /// First value stored under `key`, if any.
    pub fn first_tag<'a>(&'a self, key: &'a str) -> Option<&'a str> {
        self.tag_values(key).next()
    }

    pub fn has_tag(&self, key: &str, value: &str) -> bool {
        self.tag_values(key).any(|v| v == value)
    }

    /// Recompute the id and check the Schnorr signature against `pubkey`.
    pub fn verify(&self) -> Result<(), EventError> {
        let hash = canonical_hash(&self.pubkey, self.created_at, self.kind, &self.tags, &self.content)?;
        if hex::encode(hash) != self.id {
            return Err(EventError::IdMismatch);
        }
        let sig = Signature::from_slice(&hex::decode(&self.sig)?)?;
        let pk = XOnlyPublicKey::from_slice(&hex::decode(&self.pubkey)?)?;
        let secp = Secp256k1::verification_only();
        let msg = Message::from_digest_slice(&hash)?;
        secp.verify_schnorr(&sig, &msg, &pk)?;
        Ok(())
    }
}

/// Event contents prior to hashing and signing.
#[derive(Debug, Clone, PartialEq)]
pub struct EventDraft {
    pub kind: u32,
    pub content: String,
    pub tags: Vec<Tag>,
    /// Defaults to the current time when signing.
    pub created_at: Option<u64>,
}

impl EventDraft {
    pub fn new(kind: u32, content: impl Into<String>, tags: Vec<Tag>) -> Self {
        Self {
            kind,
            content: content.into(),
            tags,
            created_at: None,
        }
    }

    #[cfg(test)]
    pub fn at(mut self, created_at: u64) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Derive the author from `keys`, compute the id and sign it.
    pub fn sign(self, keys: &Keys) -> Result<Event, EventError> {
        let pubkey = keys.public_hex();
        let created_at = self.created_at.unwrap_or_else(now);
        let hash = canonical_hash(&pubkey, created_at, self.kind, &self.tags, &self.content)?;
        let secp = Secp256k1::signing_only();
        let msg = Message::from_digest_slice(&hash)?;
        let sig = secp.sign_schnorr_no_aux_rand(&msg, keys.keypair());
        Ok(Event {
            id: hex::encode(hash),
            pubkey,
            kind: self.kind,
            created_at,
            tags: self.tags,
            content: self.content,
            sig: hex::encode(sig.as_ref()),
        })
    }
}

/// NIP-01 event hash over `[0, pubkey, created_at, kind, tags, content]`.
pub fn canonical_hash(
    pubkey: &str,
    created_at: u64,
    kind: u32,
    tags: &[Tag],
    content: &str,
) -> Result<[u8; 32], EventError> {
    let arr = serde_json::json!([0, pubkey, created_at, kind, tags, content]);
    let data = serde_json::to_vec(&arr)?;
    Ok(Sha256::digest(&data).into())
}

/// Current Unix time in seconds.
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
