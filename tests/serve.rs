use assert_cmd::prelude::*;
use futures_util::{SinkExt, StreamExt};
use secp256k1::{Keypair, Message as SecpMessage, Secp256k1};
use sha2::{Digest, Sha256};
use std::{fs, net::TcpListener, process::Command, time::Duration};
use tempfile::TempDir;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::protocol::Message;

const KIND_SCHEMA: u32 = 30300;
const KIND_GRANT: u32 = 30301;

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn pubkey_hex(seed: u8) -> String {
    let secp = Secp256k1::new();
    let kp = Keypair::from_seckey_slice(&secp, &[seed; 32]).unwrap();
    hex::encode(kp.x_only_public_key().0.serialize())
}

fn signed_event_json(
    seed: u8,
    kind: u32,
    created_at: u64,
    tags: Vec<Vec<String>>,
    content: &str,
) -> serde_json::Value {
    let secp = Secp256k1::new();
    let kp = Keypair::from_seckey_slice(&secp, &[seed; 32]).unwrap();
    let pubkey = hex::encode(kp.x_only_public_key().0.serialize());
    let arr = serde_json::json!([0, pubkey, created_at, kind, tags, content]);
    let data = serde_json::to_vec(&arr).unwrap();
    let hash = Sha256::digest(&data);
    let id = hex::encode(hash);
    let msg = SecpMessage::from_digest_slice(&hash).unwrap();
    let sig = secp.sign_schnorr_no_aux_rand(&msg, &kp);
    serde_json::json!({
        "id": id,
        "pubkey": pubkey,
        "kind": kind,
        "created_at": created_at,
        "tags": tags,
        "content": content,
        "sig": hex::encode(sig.as_ref()),
    })
}

fn academy_doc() -> String {
    serde_json::json!({
        "classes": {
            "director": {
                "name": "Director",
                "scope": [],
                "issued_by": ["root"],
                "expiry": {"max_days": 365, "renewable": true},
                "cascade_revoke": true
            }
        }
    })
    .to_string()
}

fn schema_event() -> serde_json::Value {
    signed_event_json(
        1,
        KIND_SCHEMA,
        1,
        vec![
            vec!["d".into(), "academy".into()],
            vec!["name".into(), "Academy".into()],
        ],
        &academy_doc(),
    )
}

fn root_grant(now: u64) -> serde_json::Value {
    let tags = vec![
        vec!["d".into(), "dir-1".into()],
        vec!["p".into(), pubkey_hex(2)],
        vec!["a".into(), format!("{}:{}:academy", KIND_SCHEMA, pubkey_hex(1))],
        vec!["class".into(), "director".into()],
        vec!["issued".into(), now.to_string()],
        vec!["expires".into(), (now + 365 * 86400).to_string()],
    ];
    signed_event_json(1, KIND_GRANT, now, tags, "")
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

async fn next_text(
    ws: &mut (impl futures_util::Stream<
        Item = Result<Message, tokio_tungstenite::tungstenite::Error>,
    > + Unpin),
) -> serde_json::Value {
    loop {
        match ws.next().await.unwrap().unwrap() {
            Message::Text(t) => return serde_json::from_str(&t).unwrap(),
            _ => continue,
        }
    }
}

#[tokio::test]
async fn serve_cli_runs_http_and_ws() {
    let dir = TempDir::new().unwrap();
    let http_port = free_port();
    let ws_port = free_port();
    let env_path = dir.path().join("env");
    fs::write(
        &env_path,
        format!(
            "STORE_PATH={}\nBIND_HTTP=127.0.0.1:{}\nBIND_WS=127.0.0.1:{}\nVERIFY_SIG=1\n",
            dir.path().join("credr.db").display(),
            http_port,
            ws_port
        ),
    )
    .unwrap();

    let mut child = Command::cargo_bin("credr")
        .unwrap()
        .args(["--env", env_path.to_str().unwrap(), "serve"])
        .spawn()
        .unwrap();

    // allow servers to start
    sleep(Duration::from_millis(300)).await;

    // HTTP health check
    let url = format!("http://127.0.0.1:{}/healthz", http_port);
    let body: serde_json::Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
    assert_eq!(body["status"], "ok");

    // publish a schema and a root-issued grant over the wire
    let ws_url = format!("ws://127.0.0.1:{}/", ws_port);
    let (mut ws_stream, _) = tokio_tungstenite::connect_async(ws_url).await.unwrap();
    let now = unix_now();
    for ev in [schema_event(), root_grant(now)] {
        ws_stream
            .send(Message::Text(serde_json::json!(["EVENT", ev]).to_string()))
            .await
            .unwrap();
        let reply = next_text(&mut ws_stream).await;
        assert_eq!(reply[0], "OK");
        assert_eq!(reply[2], true, "rejected with {}", reply[3]);
    }

    // the grant comes back through a subscription, then EOSE
    let req = serde_json::json!(["REQ", "s", {"kinds": [KIND_GRANT]}]);
    ws_stream
        .send(Message::Text(req.to_string()))
        .await
        .unwrap();
    let ev = next_text(&mut ws_stream).await;
    assert_eq!(ev[0], "EVENT");
    assert_eq!(ev[1], "s");
    let eose = next_text(&mut ws_stream).await;
    assert_eq!(eose[0], "EOSE");

    // CLOSE is acknowledged
    ws_stream
        .send(Message::Text(serde_json::json!(["CLOSE", "s"]).to_string()))
        .await
        .unwrap();
    let closed = next_text(&mut ws_stream).await;
    assert_eq!(closed[0], "CLOSED");

    // the grant is also visible on the HTTP query surface
    let url = format!(
        "http://127.0.0.1:{}/query?kinds={}&authors={}",
        http_port,
        KIND_GRANT,
        pubkey_hex(1)
    );
    let text = reqwest::get(&url).await.unwrap().text().await.unwrap();
    assert_eq!(text.lines().count(), 1);
    assert!(text.contains("dir-1"));

    child.kill().unwrap();
    let _ = child.wait();
}
