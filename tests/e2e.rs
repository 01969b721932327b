use std::{net::SocketAddr, process::Stdio, time::Duration};

use anyhow::{Context, Result, anyhow};
use causal_chat::wire::SubscribeFrame;
use serde_json::{Value, json};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpListener,
    process::{Child, ChildStdin, ChildStdout, Command},
    select,
    sync::mpsc,
    time::{timeout, timeout_at},
};

const READ_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn interactive_session_end_to_end() -> Result<()> {
    let broker_addr = spawn_broker().await?;
    let (feed_addr, mut subs, push) = spawn_feed().await?;
    let mut client = spawn_client(broker_addr, feed_addr).await?;

    // Log in through the numbered menu.
    client.send_line("1").await?;
    client.send_line("alice").await?;
    client.send_line("pw1").await?;
    client.expect("logged in as alice").await?;

    // The feed sees the default direct-message filter first.
    let identity = timeout(READ_TIMEOUT, subs.recv())
        .await?
        .context("identity filter")?;
    assert_eq!(identity, "alice");

    // A direct message interleaves with the prompt.
    push.send(r#"{"topic":"alice","lamport_clock":50,"from":"bob","message":"hi alice"}"#.into())?;
    client.expect("(dm) bob: hi alice").await?;

    client.send_line("create-channel sports all about sports").await?;
    client.expect("channel 'sports' created").await?;

    client.send_line("subscribe sports").await?;
    client.expect("subscribed").await?;
    let sports = timeout(READ_TIMEOUT, subs.recv())
        .await?
        .context("sports filter")?;
    assert_eq!(sports, "sports");

    push.send(r#"{"topic":"sports","lamport_clock":99,"user":"alice","message":"hello"}"#.into())?;
    client.expect("[sports] alice: hello").await?;

    client.send_line("publish sports hello").await?;
    client.expect("published to 'sports'").await?;

    client.send_line("list-users").await?;
    client.expect("--- users ---").await?;
    client.expect("bob").await?;

    client.send_line("sync-time").await?;
    client.expect("server: 2026-08-07T12:00:00+00:00").await?;

    // User errors re-prompt without ending the session.
    client.send_line("bogus").await?;
    client.expect("unknown command 'bogus'").await?;

    client.send_line("quit").await?;
    client.expect("goodbye").await?;

    let status = timeout(READ_TIMEOUT, client.child.wait()).await??;
    assert!(status.success());
    Ok(())
}

#[tokio::test]
async fn agent_sessions_track_channels_without_subscribing() -> Result<()> {
    let broker_addr = spawn_broker().await?;
    let (feed_addr, mut subs, push) = spawn_feed().await?;
    let mut client = spawn_client(broker_addr, feed_addr).await?;

    client.send_line("1").await?;
    client.send_line("bot-observer").await?;
    client.send_line("pw2").await?;
    client.expect("logged in as bot-observer").await?;

    let identity = timeout(READ_TIMEOUT, subs.recv())
        .await?
        .context("identity filter")?;
    assert_eq!(identity, "bot-observer");

    // Creating a channel registers its topic with no subscribe command.
    client.send_line("create-channel news daily headlines").await?;
    client.expect("channel 'news' created").await?;
    let news = timeout(READ_TIMEOUT, subs.recv())
        .await?
        .context("news filter")?;
    assert_eq!(news, "news");

    push.send(r#"{"topic":"news","lamport_clock":7,"user":"carol","message":"breaking"}"#.into())?;
    client.expect("[news] carol: breaking").await?;

    // Listing channels registers the ones the agent had not seen yet.
    client.send_line("list-channels").await?;
    client.expect("--- channels ---").await?;
    let listed = timeout(READ_TIMEOUT, subs.recv())
        .await?
        .context("listing-time filter")?;
    assert_eq!(listed, "weather");

    push.send(r#"{"topic":"weather","lamport_clock":8,"user":"dan","message":"cloudy"}"#.into())?;
    client.expect("[weather] dan: cloudy").await?;

    client.send_line("quit").await?;
    client.expect("goodbye").await?;

    let status = timeout(READ_TIMEOUT, client.child.wait()).await??;
    assert!(status.success());
    Ok(())
}

#[tokio::test]
async fn registering_a_taken_identity_stays_anonymous() -> Result<()> {
    let broker_addr = spawn_broker().await?;
    let (feed_addr, _subs, _push) = spawn_feed().await?;
    let mut client = spawn_client(broker_addr, feed_addr).await?;

    client.send_line("2").await?;
    client.send_line("taken").await?;
    client.send_line("pw3").await?;
    client.expect("error: identity already registered").await?;

    // Still anonymous: the menu comes back and quitting exits cleanly.
    client.send_line("3").await?;
    client.expect("goodbye").await?;

    let status = timeout(READ_TIMEOUT, client.child.wait()).await??;
    assert!(status.success());
    Ok(())
}

struct ClientProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl ClientProcess {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.stdin
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("failed to send line '{line}'"))?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }

    /// Reads stdout lines until one contains `needle`. Prompts are written
    /// without a newline, so expectations match on substrings rather than
    /// whole lines.
    async fn expect(&mut self, needle: &str) -> Result<()> {
        let deadline = tokio::time::Instant::now() + READ_TIMEOUT;
        loop {
            let mut line = String::new();
            let read = timeout_at(deadline, self.stdout.read_line(&mut line))
                .await
                .map_err(|_| anyhow!("timed out waiting for '{needle}'"))??;
            if read == 0 {
                return Err(anyhow!("stream closed while waiting for '{needle}'"));
            }
            if line.contains(needle) {
                return Ok(());
            }
        }
    }
}

async fn spawn_client(broker: SocketAddr, feed: SocketAddr) -> Result<ClientProcess> {
    let binary = assert_cmd::cargo::cargo_bin!("causal-chat");

    let mut cmd = Command::new(binary);
    cmd.arg("--broker")
        .arg(broker.to_string())
        .arg("--feed")
        .arg(feed.to_string())
        .arg("--reply-timeout")
        .arg("5")
        .env("RUST_LOG", "warn")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    let mut child = cmd.spawn().context("failed to spawn the client")?;
    let stdin = child
        .stdin
        .take()
        .context("client stdin missing after spawn")?;
    let stdout = child
        .stdout
        .take()
        .context("client stdout missing after spawn")?;

    Ok(ClientProcess {
        child,
        stdin,
        stdout: BufReader::new(stdout),
    })
}

/// Minimal scripted broker: one client, one reply per request line.
async fn spawn_broker() -> Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        let mut clock: u64 = 100;

        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
            let Ok(request) = serde_json::from_str::<Value>(line.trim()) else {
                continue;
            };
            clock += 1;

            let service = request
                .get("service")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let data = request.get("data").cloned().unwrap_or_default();
            let reply = match service {
                "login" => json!({
                    "status": "OK",
                    "user": data.get("identity"),
                    "token": "T1",
                    "lamport_clock": clock,
                }),
                "addUser" => json!({
                    "status": "ERROR",
                    "message": "identity already registered",
                    "lamport_clock": clock,
                }),
                "addChannel" | "publish" | "message" => {
                    json!({"status": "OK", "lamport_clock": clock})
                }
                "subscribe" => json!({
                    "status": "OK",
                    "message": "subscribed",
                    "lamport_clock": clock,
                }),
                "listChannels" => json!({
                    "status": "OK",
                    "channels": [
                        {"title": "news", "description": "daily news"},
                        {"title": "weather", "description": "forecasts"},
                    ],
                    "lamport_clock": clock,
                }),
                "listUsers" => json!({
                    "status": "OK",
                    "users": ["alice", "bob"],
                    "lamport_clock": clock,
                }),
                "getTime" => json!({
                    "status": "OK",
                    "server_time_utc": "2026-08-07T12:00:00+00:00",
                    "lamport_clock": clock,
                }),
                _ => json!({
                    "status": "ERROR",
                    "message": "unknown service",
                    "lamport_clock": clock,
                }),
            };

            if writer.write_all(reply.to_string().as_bytes()).await.is_err() {
                return;
            }
            let _ = writer.write_all(b"\n").await;
        }
    });

    Ok(addr)
}

/// Fake relay: records subscribe frames, pushes test-provided lines.
async fn spawn_feed() -> Result<(
    SocketAddr,
    mpsc::UnboundedReceiver<String>,
    mpsc::UnboundedSender<String>,
)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (subs_tx, subs_rx) = mpsc::unbounded_channel();
    let (push_tx, mut push_rx) = mpsc::unbounded_channel::<String>();

    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            select! {
                read = reader.read_line(&mut line) => {
                    match read {
                        Ok(0) | Err(_) => return,
                        Ok(_) => {}
                    }
                    if let Ok(frame) = serde_json::from_str::<SubscribeFrame>(line.trim()) {
                        let _ = subs_tx.send(frame.subscribe);
                    }
                    line.clear();
                }
                pushed = push_rx.recv() => {
                    let Some(text) = pushed else { return };
                    if writer.write_all(text.as_bytes()).await.is_err() {
                        return;
                    }
                    let _ = writer.write_all(b"\n").await;
                }
            }
        }
    });

    Ok((addr, subs_rx, push_tx))
}
