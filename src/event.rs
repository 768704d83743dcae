//! Event model, tag access, and composite addresses.

use serde::{Deserialize, Serialize};

/// Simple tag wrapper preserving tag fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tag(pub Vec<String>);

/// Core event persisted on disk and served to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash).
    pub id: String,
    /// Author public key (hex, x-only).
    pub pubkey: String,
    /// Kind number, e.g. `1` or `30301`.
    pub kind: u32,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Arbitrary tags.
    pub tags: Vec<Tag>,
    /// Event content body.
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

impl Event {
    /// First value of the named tag, if present.
    pub fn tag(&self, name: &str) -> Option<&str> {
        self.tags.iter().find_map(|Tag(fields)| match fields.as_slice() {
            [t, val, ..] if t == name => Some(val.as_str()),
            _ => None,
        })
    }

    /// The `d` tag identifying parameterized-replaceable events.
    pub fn d_tag(&self) -> Option<&str> {
        self.tag("d")
    }

    /// Composite address of this event, when it carries a `d` tag.
    pub fn address(&self) -> Option<Address> {
        self.d_tag().map(|d| Address {
            kind: self.kind,
            pubkey: self.pubkey.clone(),
            d: d.to_string(),
        })
    }
}

/// Replaceable kinds keep only the newest event per `(kind, author)`.
pub fn is_replaceable(kind: u32) -> bool {
    kind == 0 || kind == 3 || (10000..20000).contains(&kind)
}

/// Parameterized-replaceable kinds key on `(kind, author, d)` instead.
pub fn is_param_replaceable(kind: u32) -> bool {
    (30000..40000).contains(&kind)
}

/// Composite cross-event reference `"<kind>:<pubkey>:<d>"`.
///
/// The tail after the second colon is taken verbatim, so `d` values may
/// themselves contain colons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub kind: u32,
    pub pubkey: String,
    pub d: String,
}

impl Address {
    /// Parse an address string, returning `None` on malformed input.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.splitn(3, ':');
        let kind = parts.next()?.parse().ok()?;
        let pubkey = parts.next()?.to_string();
        let d = parts.next()?.to_string();
        Some(Self { kind, pubkey, d })
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.kind, self.pubkey, self.d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_with_tags(tags: Vec<Tag>) -> Event {
        Event {
            id: "aa".into(),
            pubkey: "pk".into(),
            kind: 30301,
            created_at: 1,
            tags,
            content: String::new(),
            sig: String::new(),
        }
    }

    #[test]
    fn tag_lookup_returns_first_match() {
        let ev = event_with_tags(vec![
            Tag(vec!["d".into(), "one".into()]),
            Tag(vec!["d".into(), "two".into()]),
            Tag(vec!["p".into(), "peer".into()]),
        ]);
        assert_eq!(ev.tag("d"), Some("one"));
        assert_eq!(ev.tag("p"), Some("peer"));
        assert_eq!(ev.tag("a"), None);
    }

    #[test]
    fn short_tags_are_skipped() {
        let ev = event_with_tags(vec![Tag(vec!["d".into()])]);
        assert_eq!(ev.d_tag(), None);
        assert!(ev.address().is_none());
    }

    #[test]
    fn address_round_trip() {
        let addr = Address::parse("30301:abcdef:slug").unwrap();
        assert_eq!(addr.kind, 30301);
        assert_eq!(addr.pubkey, "abcdef");
        assert_eq!(addr.d, "slug");
        assert_eq!(addr.to_string(), "30301:abcdef:slug");
    }

    #[test]
    fn address_tail_keeps_colons() {
        let addr = Address::parse("30300:pk:a:b:c").unwrap();
        assert_eq!(addr.d, "a:b:c");
    }

    #[test]
    fn address_rejects_malformed() {
        assert!(Address::parse("not-a-kind:pk:d").is_none());
        assert!(Address::parse("30301:pk").is_none());
        assert!(Address::parse("").is_none());
    }

    #[test]
    fn kind_classes() {
        assert!(is_replaceable(0));
        assert!(is_replaceable(3));
        assert!(is_replaceable(10002));
        assert!(!is_replaceable(1));
        assert!(is_param_replaceable(30301));
        assert!(!is_param_replaceable(20000));
        assert!(!is_param_replaceable(40000));
    }

    #[test]
    fn event_address_uses_d_tag() {
        let ev = event_with_tags(vec![Tag(vec!["d".into(), "cred-1".into()])]);
        let addr = ev.address().unwrap();
        assert_eq!(addr.to_string(), "30301:pk:cred-1");
    }
}
