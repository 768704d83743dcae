//! Canonical serialization, event ids, and Schnorr verification.

use anyhow::{anyhow, Result};
use secp256k1::{schnorr::Signature, Message, Secp256k1, XOnlyPublicKey};
use sha2::{Digest, Sha256};

use crate::event::Event;

/// Canonical serialization of an event: the UTF-8 JSON encoding of
/// `[0, pubkey, created_at, kind, tags, content]` with minimal whitespace
/// and tag order preserved.
pub fn canonical_bytes(ev: &Event) -> Result<Vec<u8>> {
    let arr = serde_json::json!([0, ev.pubkey, ev.created_at, ev.kind, ev.tags, ev.content]);
    Ok(serde_json::to_vec(&arr)?)
}

/// Recompute the event hash from its fields.
pub fn event_hash(ev: &Event) -> Result<[u8; 32]> {
    let hash = Sha256::digest(&canonical_bytes(ev)?);
    Ok(hash.into())
}

/// BIP-340 Schnorr verification of `sig` over `hash` for an x-only key.
/// Any decoding failure counts as a failed verification.
pub fn verify_schnorr(sig_hex: &str, hash: &[u8; 32], pubkey_hex: &str) -> bool {
    let Ok(sig_bytes) = hex::decode(sig_hex) else {
        return false;
    };
    let Ok(pk_bytes) = hex::decode(pubkey_hex) else {
        return false;
    };
    let Ok(sig) = Signature::from_slice(&sig_bytes) else {
        return false;
    };
    let Ok(pk) = XOnlyPublicKey::from_slice(&pk_bytes) else {
        return false;
    };
    let Ok(msg) = Message::from_digest_slice(hash) else {
        return false;
    };
    let secp = Secp256k1::verification_only();
    secp.verify_schnorr(&sig, &msg, &pk).is_ok()
}

/// Verify an event's id and Schnorr signature, erroring with the reason.
pub fn verify_event(ev: &Event) -> Result<()> {
    let hash = event_hash(ev)?;
    if hex::encode(hash) != ev.id {
        return Err(anyhow!("id mismatch"));
    }
    if !verify_schnorr(&ev.sig, &hash, &ev.pubkey) {
        return Err(anyhow!("signature verification failed"));
    }
    Ok(())
}
