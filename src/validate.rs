//! Admission validation and the rejection taxonomy.
//!
//! Every inbound event passes the structural and cryptographic checks here
//! before the kind-specific validators run. Rejections are typed; the wire
//! strings clients see come from the `Display` impl.

use thiserror::Error;

use crate::config::KindMap;
use crate::crypto;
use crate::event::{Address, Event};
use crate::schema::SchemaDoc;

const SECS_PER_DAY: u64 = 86400;

/// Expiry tag value on a credential grant.
pub const PERPETUAL: &str = "perpetual";

/// Typed admission rejection. Wire-level `OK` reasons are a presentation
/// of these variants.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Reject {
    #[error("invalid: {0}")]
    Structural(String),
    #[error("invalid: {0}")]
    Cryptographic(String),
    #[error("invalid: {0}")]
    Schema(String),
    #[error("invalid: credential verification failed - {0}")]
    Authority(String),
    #[error("invalid: credential verification failed - expired at {expired_at}")]
    Temporal { expired_at: u64 },
    #[error("invalid: credential verification failed - revoked at {revoked_at}: {reason}")]
    Revocation { revoked_at: u64, reason: String },
    #[error("error: {0}")]
    Transport(String),
}

fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Structural and cryptographic admission check for any event.
pub fn validate_event(ev: &Event, check_sig: bool) -> Result<(), Reject> {
    if ev.id.len() != 64 || !is_hex(&ev.id) {
        return Err(Reject::Structural("id must be 64 hex characters".into()));
    }
    if ev.pubkey.len() != 64 || !is_hex(&ev.pubkey) {
        return Err(Reject::Structural(
            "pubkey must be 64 hex characters".into(),
        ));
    }
    if ev.sig.len() != 128 || !is_hex(&ev.sig) {
        return Err(Reject::Structural("sig must be 128 hex characters".into()));
    }
    let hash = crypto::event_hash(ev)
        .map_err(|e| Reject::Structural(format!("unserializable event: {}", e)))?;
    if hex::encode(hash) != ev.id {
        return Err(Reject::Cryptographic("id mismatch".into()));
    }
    if check_sig && !crypto::verify_schnorr(&ev.sig, &hash, &ev.pubkey) {
        return Err(Reject::Cryptographic(
            "signature verification failed".into(),
        ));
    }
    Ok(())
}

/// Schema definition admission check: required tags plus an internally
/// consistent content document.
pub fn validate_schema_event(ev: &Event) -> Result<SchemaDoc, Reject> {
    if ev.d_tag().is_none() {
        return Err(Reject::Structural("schema definition missing d tag".into()));
    }
    if ev.tag("name").is_none() {
        return Err(Reject::Structural(
            "schema definition missing name tag".into(),
        ));
    }
    SchemaDoc::parse(&ev.content).map_err(Reject::Schema)
}

/// Tags a credential grant must carry.
const GRANT_TAGS: [&str; 6] = ["d", "p", "a", "class", "issued", "expires"];

/// Credential-grant admission check against a schema resolution oracle.
///
/// Chain authority is the verifier's concern; this only decides whether the
/// grant is well-formed against its schema's per-class policy.
pub fn validate_grant<F>(ev: &Event, kinds: &KindMap, resolve: F) -> Result<(), Reject>
where
    F: Fn(&str) -> Option<SchemaDoc>,
{
    for name in GRANT_TAGS {
        if ev.tag(name).is_none() {
            return Err(Reject::Structural(format!("grant missing {} tag", name)));
        }
    }
    let addr_str = ev.tag("a").unwrap();
    let addr = Address::parse(addr_str)
        .filter(|a| a.kind == kinds.schema)
        .ok_or_else(|| Reject::Structural(format!("malformed schema address {}", addr_str)))?;
    let schema = resolve(addr_str)
        .ok_or_else(|| Reject::Schema(format!("schema {} not found", addr_str)))?;
    let class_id = ev.tag("class").unwrap();
    let class = schema
        .class(class_id)
        .ok_or_else(|| Reject::Schema(format!("class {} not in schema", class_id)))?;

    let issued: u64 = ev
        .tag("issued")
        .unwrap()
        .parse()
        .map_err(|_| Reject::Structural("issued must be unix seconds".into()))?;
    let expires = ev.tag("expires").unwrap();
    if expires == PERPETUAL {
        if class.expiry.max_days.is_some() {
            return Err(Reject::Schema(format!(
                "class {} does not allow perpetual grants",
                class_id
            )));
        }
    } else {
        let expires: u64 = expires
            .parse()
            .map_err(|_| Reject::Structural("expires must be unix seconds or perpetual".into()))?;
        if let Some(max_days) = class.expiry.max_days {
            if expires > issued + max_days * SECS_PER_DAY {
                return Err(Reject::Schema(format!(
                    "expiry exceeds class {} bound of {} days",
                    class_id, max_days
                )));
            }
        }
    }

    // The schema authority issues root classes directly; everyone else must
    // reference their own credential.
    let root_issuer = class.root_issuable() && ev.pubkey == addr.pubkey;
    match (root_issuer, ev.tag("chain")) {
        (false, None) => Err(Reject::Structural(
            "non-root issuer without chain reference".into(),
        )),
        (true, Some(_)) => Err(Reject::Structural(
            "root-issued grant must not carry a chain reference".into(),
        )),
        _ => Ok(()),
    }
}

/// Revocation admission check: must point at a grant and carry a reason.
pub fn validate_revocation(ev: &Event, kinds: &KindMap) -> Result<(), Reject> {
    let addr = ev
        .tag("a")
        .ok_or_else(|| Reject::Structural("revocation missing a tag".into()))?;
    if Address::parse(addr).map(|a| a.kind) != Some(kinds.grant) {
        return Err(Reject::Structural(format!(
            "revocation must reference a grant address, got {}",
            addr
        )));
    }
    if ev.tag("reason").is_none() {
        return Err(Reject::Structural("revocation missing reason tag".into()));
    }
    Ok(())
}

/// Renewal admission check: must point at a grant and carry a new expiry.
pub fn validate_renewal(ev: &Event, kinds: &KindMap) -> Result<(), Reject> {
    let addr = ev
        .tag("a")
        .ok_or_else(|| Reject::Structural("renewal missing a tag".into()))?;
    if Address::parse(addr).map(|a| a.kind) != Some(kinds.grant) {
        return Err(Reject::Structural(format!(
            "renewal must reference a grant address, got {}",
            addr
        )));
    }
    let expires = ev
        .tag("expires")
        .ok_or_else(|| Reject::Structural("renewal missing expires tag".into()))?;
    if expires != PERPETUAL && expires.parse::<u64>().is_err() {
        return Err(Reject::Structural(
            "renewal expires must be unix seconds or perpetual".into(),
        ));
    }
    Ok(())
}

/// Full admission pipeline: structural and cryptographic checks, the
/// kind-specific validator, chain verification for grants, then persistence.
/// All failures map to one `Reject` variant.
pub fn admit_event(
    store: &crate::store::Store,
    ev: &Event,
    check_sig: bool,
    now: u64,
) -> Result<(), Reject> {
    validate_event(ev, check_sig)?;
    let kinds = store.kinds();
    if ev.kind == kinds.schema {
        validate_schema_event(ev)?;
    } else if ev.kind == kinds.grant {
        validate_grant(ev, &kinds, |addr| store.schema(addr).ok().flatten())?;
        match crate::verifier::verify(store, ev, now) {
            Ok(status) if status.is_valid() => {}
            Ok(crate::verifier::Status::Expired { expired_at }) => {
                return Err(Reject::Temporal { expired_at })
            }
            Ok(crate::verifier::Status::Revoked { revoked_at, reason }) => {
                return Err(Reject::Revocation { revoked_at, reason })
            }
            Ok(status) => return Err(Reject::Authority(status.to_string())),
            Err(_) => return Err(Reject::Transport("could not save event".into())),
        }
    } else if ev.kind == kinds.revoke {
        validate_revocation(ev, &kinds)?;
    } else if ev.kind == kinds.renew {
        validate_renewal(ev, &kinds)?;
    }
    match store.ingest(ev) {
        Ok(true) => Ok(()),
        Ok(false) | Err(_) => Err(Reject::Transport("could not save event".into())),
    }
}
