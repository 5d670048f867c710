//! End-to-end broker tests over real WebSockets.
//!
//! Each test starts a broker on an ephemeral loopback port and drives it
//! with `tokio-tungstenite` as the client. Scenarios that need a terminal
//! multiplexer skip themselves when tmux is not installed, so the suite
//! stays runnable in minimal CI environments.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use tabz_broker::{server, Broker, BrokerConfig};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Serializes the tmux-backed scenarios: they share one tmux server, and
/// each broker's recovery pass would otherwise adopt a concurrent test's
/// sessions mid-assertion.
static TMUX_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

/// Whether tmux is installed and runnable on this machine.
fn tmux_available() -> bool {
    std::process::Command::new("tmux")
        .arg("-V")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Reserve an ephemeral port. Racy in principle, fine for tests.
fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind ephemeral");
    listener.local_addr().expect("local addr").port()
}

/// Start a broker on its own port; returns it and its bound port.
async fn start_broker() -> (Arc<Broker>, u16) {
    let port = free_port();
    let config = BrokerConfig {
        port,
        ..BrokerConfig::default()
    };
    let (broker, events) = Broker::new(config);
    let broker_for_server = Arc::clone(&broker);
    tokio::spawn(async move {
        if let Err(e) = server::run(broker_for_server, events).await {
            eprintln!("broker exited: {e:#}");
        }
    });

    // Wait for the listener to come up.
    for _ in 0..50 {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    (broker, port)
}

/// Open an authenticated client socket.
async fn connect_client(broker: &Broker, port: u16) -> Ws {
    let url = format!("ws://127.0.0.1:{port}/?token={}", broker.auth.token());
    let (ws, _) = connect_async(url).await.expect("ws connect");
    ws
}

async fn send_json(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string()))
        .await
        .expect("ws send");
}

/// Read frames until one matches `pred`, ignoring everything else
/// (telemetry, broadcasts for other tests' terminals). `None` on timeout.
async fn recv_until(ws: &mut Ws, timeout: Duration, pred: impl Fn(&Value) -> bool) -> Option<Value> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.checked_duration_since(tokio::time::Instant::now())?;
        match tokio::time::timeout(remaining, ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                if let Ok(value) = serde_json::from_str::<Value>(&text) {
                    if pred(&value) {
                        return Some(value);
                    }
                }
            }
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(_)) | None) => return None,
            Err(_) => return None,
        }
    }
}

/// Collect all `terminal-output` payloads for a terminal for `window`.
async fn collect_output(ws: &mut Ws, terminal_id: &str, window: Duration) -> String {
    let deadline = tokio::time::Instant::now() + window;
    let mut collected = String::new();
    while let Some(remaining) = deadline.checked_duration_since(tokio::time::Instant::now()) {
        match tokio::time::timeout(remaining, ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                if let Ok(value) = serde_json::from_str::<Value>(&text) {
                    if value["type"] == "terminal-output" && value["terminalId"] == terminal_id {
                        collected.push_str(value["data"].as_str().unwrap_or(""));
                    }
                }
            }
            Ok(Some(Ok(_))) => {}
            _ => break,
        }
    }
    collected
}

/// Poll `list-terminals` until the broker reports recovery finished.
async fn wait_recovery_complete(ws: &mut Ws) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(8);
    while tokio::time::Instant::now() < deadline {
        send_json(ws, json!({"type": "list-terminals"})).await;
        let response = recv_until(ws, Duration::from_secs(2), |v| v["type"] == "terminals").await;
        if response.is_some_and(|r| r["recoveryComplete"] == true) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    panic!("recovery never completed");
}

/// Spawn a terminal and wait for its broadcast. Returns the record.
async fn spawn_terminal(ws: &mut Ws, request_id: &str, working_dir: &str) -> Value {
    send_json(
        ws,
        json!({
            "type": "spawn",
            "requestId": request_id,
            "config": {"terminalType": "bash", "workingDir": working_dir}
        }),
    )
    .await;
    recv_until(ws, Duration::from_secs(10), |v| {
        v["type"] == "terminal-spawned" && v["requestId"] == request_id
    })
    .await
    .expect("terminal-spawned")["terminal"]
        .clone()
}

async fn close_terminal(ws: &mut Ws, terminal_id: &str) {
    send_json(ws, json!({"type": "close", "terminalId": terminal_id})).await;
    let _ = recv_until(ws, Duration::from_secs(5), |v| {
        v["type"] == "terminal-closed" && v["terminalId"] == terminal_id
    })
    .await;
}

// ---------------------------------------------------------------------------
// Multiplexer-free scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_invalid_token_closes_with_policy_violation() {
    let (_broker, port) = start_broker().await;

    let url = format!("ws://127.0.0.1:{port}/?token=wrong");
    let (mut ws, _) = connect_async(url).await.expect("upgrade still succeeds");

    let mut saw_policy_close = false;
    for _ in 0..5 {
        match ws.next().await {
            Some(Ok(Message::Close(Some(frame)))) => {
                assert_eq!(u16::from(frame.code), 1008);
                saw_policy_close = true;
                break;
            }
            Some(Ok(_)) => {}
            _ => break,
        }
    }
    assert!(saw_policy_close, "expected close code 1008");
}

#[tokio::test]
async fn test_connect_receives_memory_stats_snapshot() {
    let (broker, port) = start_broker().await;
    let mut ws = connect_client(&broker, port).await;

    let stats = recv_until(&mut ws, Duration::from_secs(5), |v| {
        v["type"] == "memory-stats"
    })
    .await
    .expect("immediate memory-stats");
    assert!(stats["connectionCount"].as_u64().unwrap_or(0) >= 1);
}

#[tokio::test]
async fn test_list_terminals_empty_on_fresh_broker() {
    let (broker, port) = start_broker().await;
    let mut ws = connect_client(&broker, port).await;

    send_json(&mut ws, json!({"type": "list-terminals"})).await;
    let response = recv_until(&mut ws, Duration::from_secs(5), |v| {
        v["type"] == "terminals"
    })
    .await
    .expect("terminals response");
    assert_eq!(response["terminals"].as_array().map(Vec::len), Some(0));
}

#[tokio::test]
async fn test_sidebar_identify_is_counted() {
    let (broker, port) = start_broker().await;
    let mut ws = connect_client(&broker, port).await;

    send_json(&mut ws, json!({"type": "identify", "clientType": "sidebar"})).await;
    // identify has no response; poll the snapshot until it reflects us.
    let mut counted = false;
    for _ in 0..20 {
        send_json(&mut ws, json!({"type": "list-terminals"})).await;
        let response = recv_until(&mut ws, Duration::from_secs(2), |v| {
            v["type"] == "terminals"
        })
        .await
        .expect("terminals response");
        if response["connectionCount"].as_u64() == Some(1) {
            counted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(counted, "sidebar connection should be counted");
}

#[tokio::test]
async fn test_unparseable_frame_terminates_connection() {
    let (broker, port) = start_broker().await;
    let mut ws = connect_client(&broker, port).await;

    ws.send(Message::Text("this is not json".to_string()))
        .await
        .expect("send garbage");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut terminated = false;
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(500), ws.next()).await {
            Ok(Some(Ok(Message::Close(_))) | Some(Err(_)) | None) => {
                terminated = true;
                break;
            }
            _ => {}
        }
    }
    assert!(terminated, "connection should be terminated after non-JSON frame");
}

#[tokio::test]
async fn test_malformed_rate_limit_terminates_connection() {
    let (broker, port) = start_broker().await;
    let mut ws = connect_client(&broker, port).await;

    // Valid JSON, invalid shape: costs a tick and an error frame each.
    for _ in 0..10 {
        send_json(&mut ws, json!({"type": "command"})).await;
        let error = recv_until(&mut ws, Duration::from_secs(2), |v| v["type"] == "error").await;
        assert!(error.is_some(), "within budget, connection stays open");
    }

    // The 11th trips the limit.
    send_json(&mut ws, json!({"type": "command"})).await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut terminated = false;
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(500), ws.next()).await {
            Ok(Some(Ok(Message::Close(_))) | Some(Err(_)) | None) => {
                terminated = true;
                break;
            }
            _ => {}
        }
    }
    assert!(terminated, "rate limit should terminate the connection");
}

#[tokio::test]
async fn test_http_token_endpoint_returns_process_token() {
    let (broker, port) = start_broker().await;

    let body: Value = reqwest::get(format!("http://127.0.0.1:{port}/api/auth/token"))
        .await
        .expect("GET token")
        .json()
        .await
        .expect("json body");
    assert_eq!(body["token"].as_str(), Some(broker.auth.token()));
}

#[tokio::test]
async fn test_http_spawn_rejects_bad_token() {
    let (_broker, port) = start_broker().await;

    let response = reqwest::Client::new()
        .post(format!("http://127.0.0.1:{port}/api/spawn"))
        .header("X-Auth-Token", "wrong")
        .json(&json!({"workingDir": "/tmp"}))
        .send()
        .await
        .expect("POST spawn");
    assert_eq!(response.status().as_u16(), 401);
}

#[tokio::test]
async fn test_reconnect_unknown_terminal_fails() {
    let (broker, port) = start_broker().await;
    let mut ws = connect_client(&broker, port).await;

    send_json(
        &mut ws,
        json!({"type": "reconnect", "terminalId": "ctt-ghost-00000000"}),
    )
    .await;
    let response = recv_until(&mut ws, Duration::from_secs(5), |v| {
        v["type"] == "reconnect-failed"
    })
    .await
    .expect("reconnect-failed");
    assert_eq!(response["terminalId"].as_str(), Some("ctt-ghost-00000000"));
}

// ---------------------------------------------------------------------------
// Multiplexer-backed scenarios (skip without tmux)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_spawn_and_type() {
    if !tmux_available() {
        eprintln!("skipping: tmux not installed");
        return;
    }
    let _tmux = TMUX_LOCK.lock().await;
    let (broker, port) = start_broker().await;
    let mut ws = connect_client(&broker, port).await;

    let terminal = spawn_terminal(&mut ws, "s1", "/tmp").await;
    let id = terminal["id"].as_str().expect("terminal id").to_string();
    assert!(id.starts_with("ctt-"));
    assert_eq!(terminal["sessionName"].as_str(), Some(id.as_str()));

    // Ownership came from originating the spawn; typing must echo back.
    send_json(
        &mut ws,
        json!({"type": "command", "terminalId": id, "command": "echo hello\n"}),
    )
    .await;
    let output = collect_output(&mut ws, &id, Duration::from_secs(2)).await;
    assert!(output.contains("hello"), "expected echoed output, got {output:?}");

    close_terminal(&mut ws, &id).await;
}

#[tokio::test]
async fn test_cross_client_ownership_isolation() {
    if !tmux_available() {
        eprintln!("skipping: tmux not installed");
        return;
    }
    let _tmux = TMUX_LOCK.lock().await;
    let (broker, port) = start_broker().await;
    let mut client_a = connect_client(&broker, port).await;
    let mut client_b = connect_client(&broker, port).await;

    send_json(
        &mut client_a,
        json!({
            "type": "spawn",
            "requestId": "a1",
            "config": {"terminalType": "bash", "workingDir": "/tmp"}
        }),
    )
    .await;

    // Both clients observe the broadcast.
    let spawned_b = recv_until(&mut client_b, Duration::from_secs(10), |v| {
        v["type"] == "terminal-spawned" && v["requestId"] == "a1"
    })
    .await
    .expect("B sees terminal-spawned");
    let spawned_a = recv_until(&mut client_a, Duration::from_secs(10), |v| {
        v["type"] == "terminal-spawned" && v["requestId"] == "a1"
    })
    .await
    .expect("A sees terminal-spawned");
    let id = spawned_a["terminal"]["id"].as_str().expect("id").to_string();
    assert_eq!(spawned_b["terminal"]["id"], spawned_a["terminal"]["id"]);

    send_json(
        &mut client_a,
        json!({"type": "command", "terminalId": id, "command": "printf X\n"}),
    )
    .await;

    let output_a = collect_output(&mut client_a, &id, Duration::from_secs(2)).await;
    assert!(output_a.contains('X'), "owner sees output, got {output_a:?}");

    // B never sent reconnect, so it owns nothing and receives nothing.
    let output_b = collect_output(&mut client_b, &id, Duration::from_secs(2)).await;
    assert!(output_b.is_empty(), "non-owner saw output: {output_b:?}");

    close_terminal(&mut client_a, &id).await;
}

#[tokio::test]
async fn test_duplicate_spawn_suppression() {
    if !tmux_available() {
        eprintln!("skipping: tmux not installed");
        return;
    }
    let _tmux = TMUX_LOCK.lock().await;
    let (broker, port) = start_broker().await;
    let mut ws = connect_client(&broker, port).await;

    // Let recovery settle first so the count below only moves on spawns.
    wait_recovery_complete(&mut ws).await;
    let before = broker.registry.get_active_terminal_count();

    let spawn = json!({
        "type": "spawn",
        "requestId": "dup",
        "config": {"terminalType": "bash", "workingDir": "/tmp"}
    });
    send_json(&mut ws, spawn.clone()).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    send_json(&mut ws, spawn).await;

    let first = recv_until(&mut ws, Duration::from_secs(10), |v| {
        v["type"] == "terminal-spawned" && v["requestId"] == "dup"
    })
    .await
    .expect("one terminal-spawned");
    let id = first["terminal"]["id"].as_str().expect("id").to_string();

    // No second broadcast for the same requestId.
    let second = recv_until(&mut ws, Duration::from_secs(2), |v| {
        v["type"] == "terminal-spawned" && v["requestId"] == "dup"
    })
    .await;
    assert!(second.is_none(), "duplicate spawn must be suppressed");
    assert_eq!(broker.registry.get_active_terminal_count(), before + 1);

    close_terminal(&mut ws, &id).await;
}

#[tokio::test]
async fn test_detach_preserves_close_destroys() {
    if !tmux_available() {
        eprintln!("skipping: tmux not installed");
        return;
    }
    let _tmux = TMUX_LOCK.lock().await;
    let (broker, port) = start_broker().await;
    let mut ws = connect_client(&broker, port).await;

    let terminal = spawn_terminal(&mut ws, "t2", "/tmp").await;
    let id = terminal["id"].as_str().expect("id").to_string();

    send_json(&mut ws, json!({"type": "detach", "terminalId": id})).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    send_json(&mut ws, json!({"type": "query-tmux-sessions"})).await;
    let sessions = recv_until(&mut ws, Duration::from_secs(5), |v| {
        v["type"] == "tmux-sessions-list"
    })
    .await
    .expect("session list");
    let listed: Vec<&str> = sessions["sessions"]
        .as_array()
        .expect("array")
        .iter()
        .filter_map(Value::as_str)
        .collect();
    assert!(listed.contains(&id.as_str()), "detached session must survive");

    send_json(&mut ws, json!({"type": "close", "terminalId": id})).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    send_json(&mut ws, json!({"type": "query-tmux-sessions"})).await;
    let sessions = recv_until(&mut ws, Duration::from_secs(5), |v| {
        v["type"] == "tmux-sessions-list"
    })
    .await
    .expect("session list");
    let listed: Vec<&str> = sessions["sessions"]
        .as_array()
        .expect("array")
        .iter()
        .filter_map(Value::as_str)
        .collect();
    assert!(!listed.contains(&id.as_str()), "closed session must be gone");
}

#[tokio::test]
async fn test_disconnect_grace_and_reconnect() {
    if !tmux_available() {
        eprintln!("skipping: tmux not installed");
        return;
    }
    let _tmux = TMUX_LOCK.lock().await;
    let (broker, port) = start_broker().await;
    let mut client_a = connect_client(&broker, port).await;

    let terminal = spawn_terminal(&mut client_a, "t3", "/tmp").await;
    let id = terminal["id"].as_str().expect("id").to_string();

    // Drop the owner; the grace period starts.
    drop(client_a);
    tokio::time::sleep(Duration::from_millis(500)).await;

    let mut client_b = connect_client(&broker, port).await;
    send_json(&mut client_b, json!({"type": "reconnect", "terminalId": id})).await;
    let response = recv_until(&mut client_b, Duration::from_secs(5), |v| {
        v["type"] == "terminal-reconnected" || v["type"] == "reconnect-failed"
    })
    .await
    .expect("reconnect response");
    assert_eq!(response["type"], "terminal-reconnected");
    assert_eq!(response["terminal"]["state"], "connected");

    // The PTY was never killed: typing still produces output.
    send_json(
        &mut client_b,
        json!({"type": "command", "terminalId": id, "command": "printf GRACE\n"}),
    )
    .await;
    let output = collect_output(&mut client_b, &id, Duration::from_secs(2)).await;
    assert!(output.contains("GRACE"), "expected output after reconnect, got {output:?}");

    close_terminal(&mut client_b, &id).await;
}

#[tokio::test]
async fn test_recovery_adopts_surviving_session() {
    if !tmux_available() {
        eprintln!("skipping: tmux not installed");
        return;
    }
    let _tmux = TMUX_LOCK.lock().await;

    // A session from a "previous" broker run.
    let session = "ctt-demo-abc12345";
    let _ = std::process::Command::new("tmux")
        .args(["kill-session", "-t", &format!("={session}")])
        .output();
    let created = std::process::Command::new("tmux")
        .args(["new-session", "-d", "-s", session, "-c", "/tmp"])
        .output()
        .expect("create pre-existing session");
    assert!(created.status.success(), "tmux new-session failed");

    let (broker, port) = start_broker().await;
    let mut ws = connect_client(&broker, port).await;

    // Recovery runs ~2.5 s after startup; poll the snapshot until it
    // reports completion.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(8);
    let mut recovered = None;
    while tokio::time::Instant::now() < deadline {
        send_json(&mut ws, json!({"type": "list-terminals"})).await;
        let response = recv_until(&mut ws, Duration::from_secs(2), |v| {
            v["type"] == "terminals"
        })
        .await
        .expect("terminals response");
        if response["recoveryComplete"] == true {
            let found = response["terminals"]
                .as_array()
                .expect("array")
                .iter()
                .find(|t| t["sessionName"] == session)
                .cloned();
            if found.is_some() {
                recovered = found;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    let record = recovered.expect("recovery should adopt the surviving session");
    assert_eq!(record["sessionName"].as_str(), Some(session));
    assert_eq!(record["workingDir"].as_str(), Some("/tmp"));

    let id = record["id"].as_str().expect("id").to_string();
    close_terminal(&mut ws, &id).await;
}

#[tokio::test]
async fn test_http_spawn_creates_terminal() {
    if !tmux_available() {
        eprintln!("skipping: tmux not installed");
        return;
    }
    let _tmux = TMUX_LOCK.lock().await;
    let (broker, port) = start_broker().await;

    let body: Value = reqwest::Client::new()
        .post(format!("http://127.0.0.1:{port}/api/spawn"))
        .header("X-Auth-Token", broker.auth.token())
        .json(&json!({"name": "api demo", "workingDir": "/tmp"}))
        .send()
        .await
        .expect("POST spawn")
        .json()
        .await
        .expect("json body");

    assert_eq!(body["success"], true);
    let id = body["terminal"]["id"].as_str().expect("terminal id").to_string();
    assert!(id.starts_with("ctt-"));
    assert_eq!(body["terminal"]["terminalType"], "bash");

    // Clean up through the registry directly.
    let _ = broker.registry.close_terminal(&id, true).await;
}
