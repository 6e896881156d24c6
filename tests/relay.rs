use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use mcp_pipe::process::ChildSignaller;
use mcp_pipe::{
    ChildCommand, ConnectionSession, ConnectionSupervisor, PipeError, ProcessBridge, RetryConfig,
    SessionEnd,
};

const STEP: Duration = Duration::from_secs(5);

async fn listen() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/mcp", listener.local_addr().unwrap());
    (listener, url)
}

async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    let (tcp, _) = timeout(STEP, listener.accept()).await.unwrap().unwrap();
    tokio_tungstenite::accept_async(tcp).await.unwrap()
}

async fn next_text(ws: &mut WebSocketStream<TcpStream>) -> String {
    loop {
        match timeout(STEP, ws.next()).await.unwrap().unwrap().unwrap() {
            Message::Text(text) => return text.as_str().to_string(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame {:?}", other),
        }
    }
}

fn sh_session(script: &str) -> ConnectionSession {
    ConnectionSession::new(
        ProcessBridge::new(Duration::from_secs(2)),
        ChildCommand::new("/bin/sh").arg("-c").arg(script),
    )
}

#[tokio::test]
async fn test_session_relays_both_directions() {
    let (listener, url) = listen().await;
    let session = sh_session("echo '[GUI_LOG]ready'; cat; exec sleep 30");
    let cancel = CancellationToken::new();

    let run = tokio::spawn(async move { session.run(&url, &cancel).await });

    let mut ws = accept(&listener).await;
    assert_eq!(next_text(&mut ws).await, "[GUI_LOG]ready");

    ws.send(Message::text("{\"jsonrpc\":\"2.0\",\"id\":1}")).await.unwrap();
    assert_eq!(next_text(&mut ws).await, "{\"jsonrpc\":\"2.0\",\"id\":1}");

    ws.send(Message::Binary(b"second".to_vec().into())).await.unwrap();
    assert_eq!(next_text(&mut ws).await, "second");

    ws.close(None).await.unwrap();
    let end = timeout(STEP, run).await.unwrap().unwrap().unwrap();
    assert_eq!(end, SessionEnd::RemoteClosed);
}

#[tokio::test]
async fn test_connect_failure_is_session_error() {
    let (listener, url) = listen().await;
    drop(listener);

    let session = sh_session("exec cat");
    let result = session.run(&url, &CancellationToken::new()).await;
    assert!(matches!(result, Err(PipeError::Connect(_))));
}

#[tokio::test]
async fn test_child_is_gone_after_remote_drops() {
    let (listener, url) = listen().await;
    let session = sh_session("echo $$; exec sleep 30");
    let cancel = CancellationToken::new();

    let run = tokio::spawn(async move { session.run(&url, &cancel).await });

    let mut ws = accept(&listener).await;
    let pid: u32 = next_text(&mut ws).await.parse().unwrap();
    assert!(ChildSignaller::from_raw(pid).is_alive());

    // no close handshake
    drop(ws);
    let result = timeout(STEP, run).await.unwrap().unwrap();
    assert!(result.is_err());
    assert!(!ChildSignaller::from_raw(pid).is_alive());
}

#[tokio::test]
async fn test_supervisor_reconnects_with_fresh_child() {
    let (listener, url) = listen().await;
    let session = sh_session("echo $$; exec cat");
    let cancel = CancellationToken::new();

    let supervisor = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut supervisor = ConnectionSupervisor::new(RetryConfig {
                initial_backoff: Duration::from_millis(50),
                max_backoff: Duration::from_millis(200),
                jitter_fraction: 0.1,
            });
            supervisor.run(&session, &url, &cancel).await;
        })
    };

    let mut first = accept(&listener).await;
    let first_pid: u32 = next_text(&mut first).await.parse().unwrap();
    first.close(None).await.unwrap();

    let mut second = accept(&listener).await;
    let second_pid: u32 = next_text(&mut second).await.parse().unwrap();
    assert_ne!(first_pid, second_pid);
    assert!(!ChildSignaller::from_raw(first_pid).is_alive());

    cancel.cancel();
    timeout(STEP, supervisor).await.unwrap().unwrap();
    assert!(!ChildSignaller::from_raw(second_pid).is_alive());
}

#[tokio::test]
async fn test_crashing_child_backs_off() {
    let (listener, url) = listen().await;
    let session = sh_session("echo boom >&2; exit 2");
    let cancel = CancellationToken::new();

    let supervisor = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut supervisor = ConnectionSupervisor::new(RetryConfig {
                initial_backoff: Duration::from_millis(100),
                max_backoff: Duration::from_secs(1),
                jitter_fraction: 0.0,
            });
            supervisor.run(&session, &url, &cancel).await;
            supervisor
        })
    };

    let mut accepted = Vec::new();
    let mut connections = Vec::new();
    for _ in 0..4 {
        connections.push(accept(&listener).await);
        accepted.push(Instant::now());
    }
    cancel.cancel();
    let supervisor = timeout(STEP, supervisor).await.unwrap().unwrap();

    let gaps: Vec<Duration> = accepted.windows(2).map(|w| w[1] - w[0]).collect();
    assert!(gaps[0] >= Duration::from_millis(100), "{:?}", gaps);
    assert!(gaps[1] >= Duration::from_millis(200), "{:?}", gaps);
    assert!(gaps[2] >= Duration::from_millis(400), "{:?}", gaps);
    assert!(supervisor.state().attempt_count() >= 3);
}
