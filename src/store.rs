//! SQLite-backed event store with credential and schema projections.
//!
//! One connection behind a mutex; every per-event mutation (insert plus its
//! projection side effects) commits in a single transaction, so readers see
//! either the full effect of an event or none of it.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use rand::{seq::SliceRandom, thread_rng};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Transaction};
use serde_json::Value;

use crate::config::KindMap;
use crate::crypto;
use crate::event::{is_param_replaceable, is_replaceable, Address, Event, Tag};
use crate::validate::PERPETUAL;

/// Result cap applied when a filter names no limit.
pub const DEFAULT_LIMIT: usize = 500;

/// Current database schema version.
const CURRENT_VERSION: u32 = 1;

/// Persistent store for events, the credential projection, and the schema
/// cache.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    kinds: KindMap,
}

/// One row of the credential projection.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Credential {
    /// Event id of the grant backing this row.
    pub grant_id: String,
    /// Issuing pubkey (the grant's author).
    pub issuer: String,
    /// The grant's `d` tag.
    pub d: String,
    /// Recipient pubkey (`p` tag).
    pub recipient: String,
    /// Composite address of the schema (`a` tag).
    pub schema_addr: String,
    /// Class id within the schema.
    pub class: String,
    /// Issuance timestamp.
    pub issued: u64,
    /// Effective expiry; reflects renewals. `None` means perpetual.
    pub expires_at: Option<u64>,
    pub revoked: bool,
    pub revoked_at: Option<u64>,
    pub revoke_reason: Option<String>,
}

/// Subscription filter: union across listed values per field, intersection
/// across fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub ids: Option<Vec<String>>,
    pub authors: Option<Vec<String>>,
    pub kinds: Option<Vec<u32>>,
    pub e: Option<Vec<String>>,
    pub p: Option<Vec<String>>,
    pub a: Option<Vec<String>>,
    pub d: Option<Vec<String>>,
    pub since: Option<u64>,
    pub until: Option<u64>,
    pub limit: Option<usize>,
}

impl Filter {
    /// Build a `Filter` from a JSON filter object.
    pub fn from_value(val: &Value) -> Self {
        fn strings(val: &Value, key: &str) -> Option<Vec<String>> {
            val.get(key).and_then(|v| v.as_array()).map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect()
            })
        }
        let kinds = val.get("kinds").and_then(|v| v.as_array()).map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_u64().map(|u| u as u32))
                .collect()
        });
        Filter {
            ids: strings(val, "ids"),
            authors: strings(val, "authors"),
            kinds,
            e: strings(val, "#e"),
            p: strings(val, "#p"),
            a: strings(val, "#a"),
            d: strings(val, "#d"),
            since: val.get("since").and_then(|v| v.as_u64()),
            until: val.get("until").and_then(|v| v.as_u64()),
            limit: val
                .get("limit")
                .and_then(|v| v.as_u64())
                .map(|v| v as usize),
        }
    }

    /// Whether a single event matches this filter at wall time `now`.
    /// Used for live fan-out after EOSE.
    pub fn matches(&self, ev: &Event, now: u64) -> bool {
        if let Some(exp) = expiration_tag(ev) {
            if exp <= now {
                return false;
            }
        }
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|i| i == &ev.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|a| a == &ev.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&ev.kind) {
                return false;
            }
        }
        for (name, values) in [("e", &self.e), ("p", &self.p), ("a", &self.a), ("d", &self.d)] {
            if let Some(values) = values {
                let hit = ev.tags.iter().any(|Tag(fields)| {
                    matches!(fields.as_slice(), [t, v, ..] if t == name && values.contains(v))
                });
                if !hit {
                    return false;
                }
            }
        }
        if self.since.map_or(false, |s| ev.created_at < s) {
            return false;
        }
        if self.until.map_or(false, |u| ev.created_at > u) {
            return false;
        }
        true
    }
}

/// Seconds since the epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn expiration_tag(ev: &Event) -> Option<u64> {
    ev.tag("expiration").and_then(|v| v.parse().ok())
}

impl Store {
    /// Open (and migrate) a store at the given database path.
    pub fn open(path: impl AsRef<Path>, kinds: KindMap) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            kinds,
        })
    }

    /// Open an in-memory store, mainly for tests.
    pub fn open_memory(kinds: KindMap) -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            kinds,
        })
    }

    pub fn kinds(&self) -> KindMap {
        self.kinds
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("store mutex poisoned"))
    }

    /// Ingest an event, applying replaceable semantics and projection side
    /// effects atomically. Returns whether the event is accepted; an event
    /// already stored, or superseded by a newer stored version, is
    /// acknowledged without a new insert.
    pub fn ingest(&self, ev: &Event) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM events WHERE id = ?1)",
            params![ev.id],
            |row| row.get(0),
        )?;
        if exists {
            tx.commit()?;
            return Ok(true);
        }

        if is_replaceable(ev.kind) {
            if !replace_older(&tx, ev, None)? {
                tx.commit()?;
                return Ok(true);
            }
        } else if is_param_replaceable(ev.kind) {
            if let Some(d) = ev.d_tag() {
                if !replace_older(&tx, ev, Some(d))? {
                    tx.commit()?;
                    return Ok(true);
                }
            }
        }

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO events
               (id, pubkey, created_at, kind, tags, content, sig, d_tag, a_tag, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                ev.id,
                ev.pubkey,
                ev.created_at,
                ev.kind,
                serde_json::to_string(&ev.tags)?,
                ev.content,
                ev.sig,
                ev.d_tag(),
                ev.tag("a"),
                expiration_tag(ev),
            ],
        )?;
        if inserted == 0 {
            return Ok(false);
        }

        if ev.kind == self.kinds.grant {
            project_grant(&tx, ev)?;
        } else if ev.kind == self.kinds.schema {
            project_schema(&tx, ev)?;
        } else if ev.kind == self.kinds.revoke {
            project_revocation(&tx, ev, self.kinds.grant)?;
        } else if ev.kind == self.kinds.renew {
            project_renewal(&tx, ev, self.kinds.grant)?;
        }

        tx.commit()?;
        Ok(true)
    }

    /// Execute filter queries; the union of all filters, deduplicated by id,
    /// newest first. Events with a past `expiration` tag are omitted.
    pub fn query(&self, filters: &[Filter], now: u64) -> Result<Vec<Event>> {
        let conn = self.lock()?;
        let mut out: Vec<Event> = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for f in filters {
            for ev in run_filter(&conn, f, now)? {
                if seen.insert(ev.id.clone()) {
                    out.push(ev);
                }
            }
        }
        out.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(out)
    }

    /// Fetch a single event by id.
    pub fn event_by_id(&self, id: &str) -> Result<Option<Event>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, pubkey, created_at, kind, tags, content, sig
             FROM events WHERE id = ?1",
            params![id],
            row_to_event,
        )
        .optional()
        .context("event lookup")
    }

    /// The current grant event stored for `(issuer, d)`.
    pub fn grant_event(&self, issuer: &str, d: &str) -> Result<Option<Event>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, pubkey, created_at, kind, tags, content, sig
             FROM events
             WHERE kind = ?1 AND pubkey = ?2 AND d_tag = ?3
             ORDER BY created_at DESC, id ASC LIMIT 1",
            params![self.kinds.grant, issuer, d],
            row_to_event,
        )
        .optional()
        .context("grant lookup")
    }

    /// The credential projection row for `(issuer, d)`.
    pub fn credential(&self, issuer: &str, d: &str) -> Result<Option<Credential>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("{} WHERE issuer = ?1 AND d = ?2", CREDENTIAL_SELECT),
            params![issuer, d],
            row_to_credential,
        )
        .optional()
        .context("credential lookup")
    }

    /// The credential row backing a specific grant event id.
    pub fn credential_by_grant_id(&self, grant_id: &str) -> Result<Option<Credential>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("{} WHERE grant_id = ?1", CREDENTIAL_SELECT),
            params![grant_id],
            row_to_credential,
        )
        .optional()
        .context("credential lookup")
    }

    pub fn credentials_for_recipient(&self, recipient: &str) -> Result<Vec<Credential>> {
        self.credentials_where("recipient = ?1", recipient)
    }

    pub fn credentials_for_issuer(&self, issuer: &str) -> Result<Vec<Credential>> {
        self.credentials_where("issuer = ?1", issuer)
    }

    pub fn credentials_for_schema(&self, schema_addr: &str) -> Result<Vec<Credential>> {
        self.credentials_where("schema_addr = ?1", schema_addr)
    }

    pub fn credentials_for_class(&self, class: &str) -> Result<Vec<Credential>> {
        self.credentials_where("class = ?1", class)
    }

    fn credentials_where(&self, clause: &str, param: &str) -> Result<Vec<Credential>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE {} ORDER BY issued DESC",
            CREDENTIAL_SELECT, clause
        ))?;
        let rows = stmt
            .query_map(params![param], row_to_credential)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Cached schema document for a composite address.
    pub fn schema(&self, addr: &str) -> Result<Option<crate::schema::SchemaDoc>> {
        let conn = self.lock()?;
        let doc: Option<String> = conn
            .query_row(
                "SELECT doc FROM schemas WHERE addr = ?1",
                params![addr],
                |row| row.get(0),
            )
            .optional()?;
        match doc {
            Some(doc) => Ok(crate::schema::SchemaDoc::parse(&doc).ok()),
            None => Ok(None),
        }
    }

    /// Re-verify id and signature for a random sample of stored events.
    pub fn verify_sample(&self, sample: usize) -> Result<usize> {
        let mut events = {
            let conn = self.lock()?;
            let mut stmt = conn.prepare(
                "SELECT id, pubkey, created_at, kind, tags, content, sig FROM events",
            )?;
            let result = stmt.query_map([], row_to_event)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            result
        };
        events.shuffle(&mut thread_rng());
        let take = sample.min(events.len());
        for ev in events.iter().take(take) {
            crypto::verify_event(ev)
                .with_context(|| format!("stored event {} failed verification", ev.id))?;
        }
        Ok(take)
    }
}

/// Remove stored versions this event supersedes. Returns false when a
/// stored version wins the `(created_at, id)` comparison instead, in which
/// case the incoming event must not be inserted.
fn replace_older(tx: &Transaction<'_>, ev: &Event, d: Option<&str>) -> Result<bool> {
    let map = |row: &rusqlite::Row<'_>| Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?));
    let rows: Vec<(String, u64)> = match d {
        Some(d) => {
            let mut stmt = tx.prepare(
                "SELECT id, created_at FROM events
                 WHERE kind = ?1 AND pubkey = ?2 AND d_tag = ?3",
            )?;
            let rows = stmt
                .query_map(params![ev.kind, ev.pubkey, d], map)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        }
        None => {
            let mut stmt = tx.prepare(
                "SELECT id, created_at FROM events WHERE kind = ?1 AND pubkey = ?2",
            )?;
            let rows = stmt
                .query_map(params![ev.kind, ev.pubkey], map)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        }
    };
    // Greatest (created_at, id) wins; ties on created_at go to the
    // lexicographically smaller id.
    for (id, created_at) in &rows {
        let stored_wins =
            *created_at > ev.created_at || (*created_at == ev.created_at && *id <= ev.id);
        if stored_wins {
            return Ok(false);
        }
    }
    for (id, _) in rows {
        tx.execute("DELETE FROM events WHERE id = ?1", params![id])?;
    }
    Ok(true)
}

/// Upsert the credential projection for an admitted grant. Revocation state
/// on an existing row is preserved; the flag is monotonic.
fn project_grant(tx: &Transaction<'_>, ev: &Event) -> Result<()> {
    let (Some(d), Some(p), Some(a), Some(class), Some(issued)) = (
        ev.d_tag(),
        ev.tag("p"),
        ev.tag("a"),
        ev.tag("class"),
        ev.tag("issued").and_then(|v| v.parse::<u64>().ok()),
    ) else {
        return Ok(());
    };
    let expires_at: Option<u64> = match ev.tag("expires") {
        Some(PERPETUAL) => None,
        Some(v) => match v.parse() {
            Ok(n) => Some(n),
            Err(_) => return Ok(()),
        },
        None => return Ok(()),
    };
    tx.execute(
        "INSERT INTO credentials
           (issuer, d, grant_id, recipient, schema_addr, class, issued, expires_at, revoked)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0)
         ON CONFLICT(issuer, d) DO UPDATE SET
           grant_id = excluded.grant_id,
           recipient = excluded.recipient,
           schema_addr = excluded.schema_addr,
           class = excluded.class,
           issued = excluded.issued,
           expires_at = excluded.expires_at",
        params![ev.pubkey, d, ev.id, p, a, class, issued, expires_at],
    )?;
    Ok(())
}

/// Parse the schema document once and cache it by composite address.
fn project_schema(tx: &Transaction<'_>, ev: &Event) -> Result<()> {
    let Some(addr) = ev.address() else {
        return Ok(());
    };
    tx.execute(
        "INSERT INTO schemas (addr, pubkey, d, created_at, doc)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(addr) DO UPDATE SET
           created_at = excluded.created_at,
           doc = excluded.doc",
        params![addr.to_string(), ev.pubkey, addr.d, ev.created_at, ev.content],
    )?;
    Ok(())
}

/// Mark the referenced grant revoked. The first revocation sticks; no later
/// event clears or re-stamps it.
fn project_revocation(tx: &Transaction<'_>, ev: &Event, grant_kind: u32) -> Result<()> {
    let Some(addr) = ev.tag("a").and_then(Address::parse) else {
        return Ok(());
    };
    if addr.kind != grant_kind {
        return Ok(());
    }
    let reason = ev.tag("reason").unwrap_or("unspecified");
    tx.execute(
        "UPDATE credentials
         SET revoked = 1, revoked_at = ?3, revoke_reason = ?4
         WHERE issuer = ?1 AND d = ?2 AND revoked = 0",
        params![addr.pubkey, addr.d, ev.created_at, reason],
    )?;
    Ok(())
}

/// Extend the indexed expiry of the referenced grant, unless revoked.
fn project_renewal(tx: &Transaction<'_>, ev: &Event, grant_kind: u32) -> Result<()> {
    let Some(addr) = ev.tag("a").and_then(Address::parse) else {
        return Ok(());
    };
    if addr.kind != grant_kind {
        return Ok(());
    }
    let Some(expires) = ev.tag("expires").filter(|v| *v != PERPETUAL) else {
        return Ok(());
    };
    let Ok(expires_at) = expires.parse::<u64>() else {
        return Ok(());
    };
    tx.execute(
        "UPDATE credentials SET expires_at = ?3
         WHERE issuer = ?1 AND d = ?2 AND revoked = 0",
        params![addr.pubkey, addr.d, expires_at],
    )?;
    Ok(())
}

const CREDENTIAL_SELECT: &str = "SELECT grant_id, issuer, d, recipient, schema_addr, class,
        issued, expires_at, revoked, revoked_at, revoke_reason FROM credentials";

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let tags_json: String = row.get(4)?;
    let tags: Vec<Tag> = serde_json::from_str(&tags_json).unwrap_or_default();
    Ok(Event {
        id: row.get(0)?,
        pubkey: row.get(1)?,
        created_at: row.get(2)?,
        kind: row.get(3)?,
        tags,
        content: row.get(5)?,
        sig: row.get(6)?,
    })
}

fn row_to_credential(row: &rusqlite::Row<'_>) -> rusqlite::Result<Credential> {
    Ok(Credential {
        grant_id: row.get(0)?,
        issuer: row.get(1)?,
        d: row.get(2)?,
        recipient: row.get(3)?,
        schema_addr: row.get(4)?,
        class: row.get(5)?,
        issued: row.get(6)?,
        expires_at: row.get(7)?,
        revoked: row.get::<_, i64>(8)? != 0,
        revoked_at: row.get(9)?,
        revoke_reason: row.get(10)?,
    })
}

/// Run one filter against the events table.
fn run_filter(conn: &Connection, f: &Filter, now: u64) -> Result<Vec<Event>> {
    let mut sql = String::from(
        "SELECT id, pubkey, created_at, kind, tags, content, sig FROM events
         WHERE (expires_at IS NULL OR expires_at > ?1)",
    );
    let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(now)];

    fn in_clause(
        sql: &mut String,
        col: &str,
        vals: &[String],
        args: &mut Vec<Box<dyn rusqlite::ToSql>>,
    ) {
        let marks: Vec<String> = vals
            .iter()
            .map(|v| {
                args.push(Box::new(v.clone()));
                format!("?{}", args.len())
            })
            .collect();
        sql.push_str(&format!(" AND {} IN ({})", col, marks.join(",")));
    }

    if let Some(ids) = &f.ids {
        in_clause(&mut sql, "id", ids, &mut args);
    }
    if let Some(authors) = &f.authors {
        in_clause(&mut sql, "pubkey", authors, &mut args);
    }
    if let Some(kinds) = &f.kinds {
        let vals: Vec<String> = kinds.iter().map(|k| k.to_string()).collect();
        in_clause(&mut sql, "kind", &vals, &mut args);
    }
    if let Some(d) = &f.d {
        in_clause(&mut sql, "d_tag", d, &mut args);
    }
    if let Some(a) = &f.a {
        in_clause(&mut sql, "a_tag", a, &mut args);
    }
    // #e/#p match by substring over the serialized tag array.
    for (name, vals) in [("e", &f.e), ("p", &f.p)] {
        if let Some(vals) = vals {
            let mut likes = Vec::new();
            for v in vals {
                args.push(Box::new(format!("%[\"{}\",\"{}\"%", name, v)));
                likes.push(format!("tags LIKE ?{}", args.len()));
            }
            sql.push_str(&format!(" AND ({})", likes.join(" OR ")));
        }
    }
    if let Some(since) = f.since {
        args.push(Box::new(since));
        sql.push_str(&format!(" AND created_at >= ?{}", args.len()));
    }
    if let Some(until) = f.until {
        args.push(Box::new(until));
        sql.push_str(&format!(" AND created_at <= ?{}", args.len()));
    }
    let limit = f.limit.unwrap_or(DEFAULT_LIMIT);
    args.push(Box::new(limit as i64));
    sql.push_str(&format!(
        " ORDER BY created_at DESC, id ASC LIMIT ?{}",
        args.len()
    ));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(
            params_from_iter(args.iter().map(|b| b.as_ref())),
            row_to_event,
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Initialize or migrate the database schema. Idempotent.
fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;
    let current: u32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);
    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;
        for version in (current + 1)..=CURRENT_VERSION {
            match version {
                1 => apply_v1(&tx)?,
                _ => return Err(anyhow!("unknown migration version {}", version)),
            }
            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                params![version, unix_now()],
            )?;
        }
        tx.commit()?;
    }
    Ok(())
}

fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE events (
            id TEXT PRIMARY KEY,
            pubkey TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            kind INTEGER NOT NULL,
            tags TEXT NOT NULL,
            content TEXT NOT NULL,
            sig TEXT NOT NULL,
            d_tag TEXT,
            a_tag TEXT,
            expires_at INTEGER
        );
        CREATE INDEX idx_events_author ON events(pubkey);
        CREATE INDEX idx_events_kind ON events(kind);
        CREATE INDEX idx_events_created ON events(created_at);
        CREATE INDEX idx_events_d ON events(d_tag);
        CREATE INDEX idx_events_a ON events(a_tag);

        CREATE TABLE credentials (
            issuer TEXT NOT NULL,
            d TEXT NOT NULL,
            grant_id TEXT NOT NULL,
            recipient TEXT NOT NULL,
            schema_addr TEXT NOT NULL,
            class TEXT NOT NULL,
            issued INTEGER NOT NULL,
            expires_at INTEGER,
            revoked INTEGER NOT NULL DEFAULT 0,
            revoked_at INTEGER,
            revoke_reason TEXT,
            PRIMARY KEY (issuer, d)
        );
        CREATE INDEX idx_credentials_grant ON credentials(grant_id);
        CREATE INDEX idx_credentials_recipient ON credentials(recipient);
        CREATE INDEX idx_credentials_schema ON credentials(schema_addr);
        CREATE INDEX idx_credentials_class ON credentials(class);

        CREATE TABLE schemas (
            addr TEXT PRIMARY KEY,
            pubkey TEXT NOT NULL,
            d TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            doc TEXT NOT NULL
        );
        "#,
    )?;
    Ok(())
}
