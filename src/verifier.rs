//! Credential chain verification.
//!
//! Walks a grant's chain reference back to the schema authority, enforcing
//! authority at the moment of issuance: the issuer must have held a valid,
//! in-scope credential when the downstream grant was signed. Later expiry or
//! revocation of an upstream credential does not retroactively invalidate a
//! grant unless the schema opts into cascade revocation.

use std::collections::HashSet;
use std::fmt;

use anyhow::Result;

use crate::event::{Address, Event};
use crate::schema::SchemaDoc;
use crate::store::Store;
use crate::validate::PERPETUAL;

/// Upper bound on upstream lookups per verification.
pub const MAX_CHAIN_DEPTH: u32 = 5;

/// Outcome of verifying a credential grant.
#[derive(Debug, Clone, PartialEq)]
pub enum Status {
    Valid { chain_depth: u32 },
    Invalid { reason: String },
    Expired { expired_at: u64 },
    Revoked { revoked_at: u64, reason: String },
}

impl Status {
    pub fn is_valid(&self) -> bool {
        matches!(self, Status::Valid { .. })
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Valid { chain_depth } => write!(f, "valid (chain depth {})", chain_depth),
            Status::Invalid { reason } => write!(f, "{}", reason),
            Status::Expired { expired_at } => write!(f, "expired at {}", expired_at),
            Status::Revoked { revoked_at, reason } => {
                write!(f, "revoked at {}: {}", revoked_at, reason)
            }
        }
    }
}

fn invalid(reason: impl Into<String>) -> Status {
    Status::Invalid {
        reason: reason.into(),
    }
}

/// Verify a credential grant event at wall time `now`.
pub fn verify(store: &Store, grant: &Event, now: u64) -> Result<Status> {
    let kinds = store.kinds();
    if grant.kind != kinds.grant {
        return Ok(invalid("not a credential grant event"));
    }
    let (Some(addr_str), Some(class_id), Some(issued_str)) =
        (grant.tag("a"), grant.tag("class"), grant.tag("issued"))
    else {
        return Ok(invalid("missing required tags"));
    };
    let Ok(issued) = issued_str.parse::<u64>() else {
        return Ok(invalid("malformed issued timestamp"));
    };

    // Revocation and effective expiry come from the credential index, which
    // already reflects renewals.
    let indexed = match grant.d_tag() {
        Some(d) => store.credential(&grant.pubkey, d)?,
        None => None,
    };
    if let Some(cred) = &indexed {
        if cred.revoked {
            return Ok(Status::Revoked {
                revoked_at: cred.revoked_at.unwrap_or(0),
                reason: cred
                    .revoke_reason
                    .clone()
                    .unwrap_or_else(|| "unspecified".into()),
            });
        }
    }
    let effective_expires = match &indexed {
        Some(cred) => cred.expires_at,
        None => grant.tag("expires").and_then(|v| {
            if v == PERPETUAL {
                None
            } else {
                v.parse().ok()
            }
        }),
    };
    if let Some(expired_at) = effective_expires.filter(|e| *e < now) {
        return Ok(Status::Expired { expired_at });
    }

    let Some(schema_addr) = Address::parse(addr_str).filter(|a| a.kind == kinds.schema) else {
        return Ok(invalid("malformed schema address"));
    };
    let Some(schema) = store.schema(addr_str)? else {
        return Ok(invalid("schema not found"));
    };
    let Some(class) = schema.class(class_id) else {
        return Ok(invalid(format!("class {} not found in schema", class_id)));
    };

    // The schema authority itself is the chain root.
    let root = schema_addr.pubkey.as_str();
    if class.root_issuable() && grant.pubkey == root {
        return Ok(Status::Valid { chain_depth: 0 });
    }
    let Some(chain_ref) = grant.tag("chain") else {
        return Ok(invalid("non-root issuer without chain reference"));
    };

    walk(
        store,
        &schema,
        addr_str,
        root,
        WalkStep {
            issuer: grant.pubkey.clone(),
            issued,
            class: class_id.to_string(),
            chain_ref: chain_ref.to_string(),
        },
    )
}

/// One link of the chain under inspection: the issuer of the previous grant
/// and the reference to that issuer's own credential.
struct WalkStep {
    issuer: String,
    issued: u64,
    class: String,
    chain_ref: String,
}

/// Iterative chain walk, bounded by `MAX_CHAIN_DEPTH` upstream lookups and
/// guarded against reference cycles. Every rule here evaluates at the
/// downstream grant's issuance time, never at `now`.
fn walk(
    store: &Store,
    schema: &SchemaDoc,
    schema_addr: &str,
    root: &str,
    first: WalkStep,
) -> Result<Status> {
    let kinds = store.kinds();
    let mut step = first;
    let mut visited: HashSet<(String, String)> = HashSet::new();

    for depth in 1.. {
        if depth > MAX_CHAIN_DEPTH {
            return Ok(invalid("chain too deep"));
        }
        let Some(addr) = Address::parse(&step.chain_ref).filter(|a| a.kind == kinds.grant) else {
            return Ok(invalid("invalid chain reference"));
        };
        if !visited.insert((addr.pubkey.clone(), addr.d.clone())) {
            return Ok(invalid("chain reference cycle"));
        }

        let Some(upstream) = store.grant_event(&addr.pubkey, &addr.d)? else {
            return Ok(invalid("issuer credential not found"));
        };
        if upstream.tag("p") != Some(step.issuer.as_str()) {
            return Ok(invalid("chain pubkey mismatch"));
        }
        if upstream.tag("a") != Some(schema_addr) {
            return Ok(invalid("chain crosses schema boundaries"));
        }
        let Some(up_class_id) = upstream.tag("class") else {
            return Ok(invalid("issuer credential missing class"));
        };
        let allowed_issuers = schema
            .class(&step.class)
            .map(|c| c.issued_by.clone())
            .unwrap_or_default();
        if !allowed_issuers.iter().any(|i| i == up_class_id) {
            return Ok(invalid(format!(
                "class {} not authorized to issue {}",
                up_class_id, step.class
            )));
        }
        let Some(up_class) = schema.class(up_class_id) else {
            return Ok(invalid(format!(
                "class {} not found in schema",
                up_class_id
            )));
        };
        if !up_class.scope.iter().any(|s| s == &step.class) {
            return Ok(invalid(format!(
                "class {} lacks scope for {}",
                up_class_id, step.class
            )));
        }

        // Authority at issuance: the upstream credential must already have
        // existed and must not have lapsed before the child was signed.
        let Some(up_issued) = upstream.tag("issued").and_then(|v| v.parse::<u64>().ok()) else {
            return Ok(invalid("issuer credential missing issued timestamp"));
        };
        if up_issued > step.issued {
            return Ok(invalid("issuer credential issued after downstream"));
        }
        let up_cred = store.credential(&upstream.pubkey, &addr.d)?;
        let up_expires = match &up_cred {
            Some(cred) => cred.expires_at,
            None => upstream.tag("expires").and_then(|v| {
                if v == PERPETUAL {
                    None
                } else {
                    v.parse().ok()
                }
            }),
        };
        if let Some(exp) = up_expires {
            if exp < step.issued {
                return Ok(invalid("issuer credential expired at issuance"));
            }
        }
        if let Some(cred) = &up_cred {
            if cred.revoked && up_class.cascade_revoke {
                if cred.revoked_at.unwrap_or(0) <= step.issued {
                    return Ok(invalid("issuer credential revoked (cascade)"));
                }
            }
        }

        if up_class.root_issuable() && upstream.pubkey == root {
            return Ok(Status::Valid { chain_depth: depth });
        }
        let Some(next_ref) = upstream.tag("chain") else {
            return Ok(invalid("non-root issuer without chain reference"));
        };
        step = WalkStep {
            issuer: upstream.pubkey.clone(),
            issued: up_issued,
            class: up_class_id.to_string(),
            chain_ref: next_ref.to_string(),
        };
    }
    unreachable!("walk loop always returns within the depth bound");
}
