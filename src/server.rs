//! HTTP endpoints for health checks, relay info, and queries.

use anyhow::Result;
use axum::{
    body::Body,
    extract::{Query as AxumQuery, State},
    http::header,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::{future::Future, net::SocketAddr, sync::Arc};

use crate::store::{unix_now, Filter, Store};

#[derive(Serialize, Deserialize)]
struct Health {
    status: String,
}

/// Start an HTTP server exposing `/healthz`, `/query`, and relay info.
pub async fn serve_http(
    addr: SocketAddr,
    store: Store,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let app = Router::new()
        .route("/", get(relay_info))
        .route("/healthz", get(healthz))
        .route("/query", get(query))
        .route("/credentials", get(credentials))
        .with_state(Arc::new(store));
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Health check endpoint.
async fn healthz() -> Json<Health> {
    Json(Health {
        status: "ok".to_string(),
    })
}

#[derive(Serialize, Deserialize)]
struct RelayInfo {
    name: String,
    software: String,
    version: String,
}

/// Basic relay information document.
async fn relay_info() -> impl axum::response::IntoResponse {
    (
        [(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")],
        Json(RelayInfo {
            name: "credr".into(),
            software: "credr".into(),
            version: env!("CARGO_PKG_VERSION").into(),
        }),
    )
}

#[derive(Deserialize)]
struct QueryParams {
    ids: Option<String>,
    authors: Option<String>,
    kinds: Option<String>,
    e: Option<String>,
    p: Option<String>,
    a: Option<String>,
    d: Option<String>,
    since: Option<String>,
    until: Option<String>,
    limit: Option<String>,
}

fn csv(input: Option<String>) -> Option<Vec<String>> {
    input.map(|s| s.split(',').map(|v| v.to_string()).collect())
}

/// Parse query parameters and return matching events as NDJSON.
async fn query(
    State(store): State<Arc<Store>>,
    AxumQuery(params): AxumQuery<QueryParams>,
) -> axum::response::Response {
    let f = Filter {
        ids: csv(params.ids),
        authors: csv(params.authors),
        kinds: params
            .kinds
            .map(|s| s.split(',').filter_map(|v| v.parse().ok()).collect()),
        e: csv(params.e),
        p: csv(params.p),
        a: csv(params.a),
        d: csv(params.d),
        since: params.since.as_deref().and_then(|v| v.parse().ok()),
        until: params.until.as_deref().and_then(|v| v.parse().ok()),
        limit: params.limit.as_deref().and_then(|v| v.parse().ok()),
    };
    let events = store.query(&[f], unix_now()).unwrap_or_default();
    let body = events
        .into_iter()
        .filter_map(|e| serde_json::to_string(&e).ok())
        .collect::<Vec<_>>()
        .join("\n");
    axum::response::Response::builder()
        .header("Content-Type", "application/x-ndjson")
        .body(Body::from(body))
        .unwrap_or_default()
}

#[derive(Deserialize)]
struct CredentialParams {
    grant: Option<String>,
    recipient: Option<String>,
    issuer: Option<String>,
    schema: Option<String>,
    class: Option<String>,
}

/// Credential-index lookups: exactly one of `grant`, `recipient`, `issuer`,
/// `schema`, or `class`.
async fn credentials(
    State(store): State<Arc<Store>>,
    AxumQuery(params): AxumQuery<CredentialParams>,
) -> Json<Vec<crate::store::Credential>> {
    let rows = if let Some(id) = params.grant {
        store
            .credential_by_grant_id(&id)
            .map(|c| c.into_iter().collect())
    } else if let Some(pk) = params.recipient {
        store.credentials_for_recipient(&pk)
    } else if let Some(pk) = params.issuer {
        store.credentials_for_issuer(&pk)
    } else if let Some(addr) = params.schema {
        store.credentials_for_schema(&addr)
    } else if let Some(class) = params.class {
        store.credentials_for_class(&class)
    } else {
        Ok(vec![])
    };
    Json(rows.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KindMap;
    use crate::crypto::test_keys::*;
    use crate::event::Tag;
    use reqwest::{self, header::ACCESS_CONTROL_ALLOW_ORIGIN};
    use tokio::task;

    #[tokio::test]
    async fn health_endpoint() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route("/healthz", get(super::healthz));
        let server = axum::serve(listener, app.into_make_service());
        let handle = task::spawn(async move {
            server.await.unwrap();
        });

        let url = format!("http://{}/healthz", addr);
        let resp = reqwest::get(&url).await.unwrap();
        let body: super::Health = resp.json().await.unwrap();
        assert_eq!(body.status, "ok");
        handle.abort();
    }

    #[tokio::test]
    async fn relay_info_endpoint() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route("/", get(super::relay_info));
        let server = axum::serve(listener, app.into_make_service());
        let handle = task::spawn(async move {
            server.await.unwrap();
        });

        let url = format!("http://{}/", addr);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(
            resp.headers().get(ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "*"
        );
        let info: super::RelayInfo = resp.json().await.unwrap();
        assert_eq!(info.name, "credr");
        handle.abort();
    }

    #[tokio::test]
    async fn query_endpoint_filters() {
        let store = Store::open_memory(KindMap::default()).unwrap();
        let events = vec![
            sign_event(&keypair(1), 1, 1, vec![], "aa"),
            sign_event(&keypair(1), 1, 2, vec![], "bb"),
            sign_event(&keypair(2), 1, 3, vec![], "cc"),
            sign_event(&keypair(1), 2, 4, vec![], "dd"),
        ];
        for ev in &events {
            store.ingest(ev).unwrap();
        }
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new()
            .route("/query", get(super::query))
            .with_state(Arc::new(store));
        let server = axum::serve(listener, app.into_make_service());
        let handle = task::spawn(async move {
            server.await.unwrap();
        });
        let url = format!(
            "http://{}/query?authors={},{}&kinds=1&since=2&until=3&limit=2",
            addr,
            pubkey_hex(1),
            pubkey_hex(2)
        );
        let resp = reqwest::get(&url).await.unwrap().text().await.unwrap();
        let lines: Vec<_> = resp.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains(&events[2].id));
        assert!(lines[1].contains(&events[1].id));
        handle.abort();
    }

    #[tokio::test]
    async fn query_tag_params() {
        let store = Store::open_memory(KindMap::default()).unwrap();
        let ev1 = sign_event(
            &keypair(1),
            30500,
            1,
            vec![
                Tag(vec!["d".into(), "slug".into()]),
                Tag(vec!["a".into(), "30300:pk:academy".into()]),
            ],
            "one",
        );
        let ev2 = sign_event(
            &keypair(1),
            30500,
            2,
            vec![Tag(vec!["d".into(), "other".into()])],
            "two",
        );
        store.ingest(&ev1).unwrap();
        store.ingest(&ev2).unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new()
            .route("/query", get(super::query))
            .with_state(Arc::new(store));
        let server = axum::serve(listener, app.into_make_service());
        let handle = task::spawn(async move {
            server.await.unwrap();
        });

        let url = format!("http://{}/query?d=slug", addr);
        let resp = reqwest::get(&url).await.unwrap().text().await.unwrap();
        assert_eq!(resp.lines().count(), 1);
        assert!(resp.contains(&ev1.id));

        let url = format!("http://{}/query?a=30300:pk:academy", addr);
        let resp = reqwest::get(&url).await.unwrap().text().await.unwrap();
        assert_eq!(resp.lines().count(), 1);
        assert!(resp.contains(&ev1.id));
        handle.abort();
    }

    #[tokio::test]
    async fn credentials_endpoint_lookups() {
        let kinds = KindMap::default();
        let store = Store::open_memory(kinds).unwrap();
        let schema_addr = format!("{}:{}:academy", kinds.schema, pubkey_hex(1));
        let tags = vec![
            Tag(vec!["d".into(), "dir-1".into()]),
            Tag(vec!["p".into(), pubkey_hex(2)]),
            Tag(vec!["a".into(), schema_addr.clone()]),
            Tag(vec!["class".into(), "director".into()]),
            Tag(vec!["issued".into(), "100".into()]),
            Tag(vec!["expires".into(), "200".into()]),
        ];
        let grant = sign_event(&keypair(1), kinds.grant, 100, tags, "");
        store.ingest(&grant).unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new()
            .route("/credentials", get(super::credentials))
            .with_state(Arc::new(store));
        let server = axum::serve(listener, app.into_make_service());
        let handle = task::spawn(async move {
            server.await.unwrap();
        });

        for query in [
            format!("grant={}", grant.id),
            format!("recipient={}", pubkey_hex(2)),
            format!("issuer={}", pubkey_hex(1)),
            format!("schema={}", schema_addr),
            "class=director".to_string(),
        ] {
            let url = format!("http://{}/credentials?{}", addr, query);
            let rows: serde_json::Value =
                reqwest::get(&url).await.unwrap().json().await.unwrap();
            assert_eq!(rows.as_array().unwrap().len(), 1, "query {}", query);
            assert_eq!(rows[0]["grant_id"], grant.id.as_str());
        }

        let url = format!("http://{}/credentials", addr);
        let rows: serde_json::Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
        assert!(rows.as_array().unwrap().is_empty());
        handle.abort();
    }

    #[tokio::test]
    async fn serve_http_bind_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let store = Store::open_memory(KindMap::default()).unwrap();
        assert!(super::serve_http(addr, store, std::future::pending())
            .await
            .is_err());
    }
}
