//! Connection manager against a real WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use agentchat_client::core::{ConnectionState, InboundEvent, OutboundMessage, ReconnectPolicy};
use agentchat_client::{ConnectionError, ConnectionEvent, ConnectionManager, ConnectionOptions};
use agentchat_client::core::BearerToken;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

const TIMEOUT: Duration = Duration::from_secs(5);
const CLOSE: &str = "__close__";

/// What the server does with the n-th accepted TCP connection.
#[derive(Debug, Clone, Copy)]
enum Behaviour {
    /// Complete the handshake and relay frames.
    Serve,
    /// Drop the socket before the handshake.
    Refuse,
    /// Hold the socket open without ever answering the handshake.
    Stall,
}

struct TestServer {
    url: String,
    accepted: Arc<AtomicUsize>,
    auth_headers: Arc<Mutex<Vec<Option<String>>>>,
    /// Ping frames received from clients.
    pings: Arc<AtomicUsize>,
    /// Text frames received from clients.
    inbound: mpsc::UnboundedReceiver<String>,
    /// Frames to push to every served client; `CLOSE` closes them.
    push: broadcast::Sender<String>,
}

impl TestServer {
    async fn start(script: Vec<Behaviour>, then: Behaviour) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let auth_headers = Arc::new(Mutex::new(Vec::new()));
        let pings = Arc::new(AtomicUsize::new(0));
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let (push, _) = broadcast::channel::<String>(64);

        let server_accepted = accepted.clone();
        let server_headers = auth_headers.clone();
        let server_push = push.clone();
        let server_pings = pings.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let n = server_accepted.fetch_add(1, Ordering::SeqCst);
                let behaviour = script.get(n).copied().unwrap_or(then);
                match behaviour {
                    Behaviour::Refuse => drop(stream),
                    Behaviour::Stall => {
                        tokio::spawn(async move {
                            tokio::time::sleep(Duration::from_secs(30)).await;
                            drop(stream);
                        });
                    }
                    Behaviour::Serve => {
                        let rx = server_push.subscribe();
                        tokio::spawn(serve(
                            stream,
                            rx,
                            inbound_tx.clone(),
                            server_headers.clone(),
                            server_pings.clone(),
                        ));
                    }
                }
            }
        });

        Self {
            url: format!("ws://{addr}/ws"),
            accepted,
            auth_headers,
            pings,
            inbound,
            push,
        }
    }

    fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    fn push(&self, frame: &str) {
        self.push.send(frame.to_string()).unwrap();
    }

    fn close_clients(&self) {
        self.push(CLOSE);
    }

    async fn next_frame(&mut self) -> String {
        timeout(TIMEOUT, self.inbound.recv())
            .await
            .expect("timeout waiting for client frame")
            .expect("server stopped")
    }
}

async fn serve(
    stream: TcpStream,
    mut push: broadcast::Receiver<String>,
    inbound: mpsc::UnboundedSender<String>,
    headers: Arc<Mutex<Vec<Option<String>>>>,
    pings: Arc<AtomicUsize>,
) {
    let callback = |req: &Request, resp: Response| {
        let auth = req
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        headers.lock().push(auth);
        Ok::<_, ErrorResponse>(resp)
    };
    let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
        return;
    };
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let _ = inbound.send(text.to_string());
                }
                Some(Ok(Message::Ping(_))) => {
                    pings.fetch_add(1, Ordering::SeqCst);
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            out = push.recv() => match out {
                Ok(frame) if frame == CLOSE => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
                Ok(frame) => {
                    if sink.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            },
        }
    }
}

fn options(url: &str, base_delay_ms: u64, max_attempts: u32) -> ConnectionOptions {
    ConnectionOptions::new(url)
        .with_policy(ReconnectPolicy::new(
            max_attempts,
            Duration::from_millis(base_delay_ms),
        ))
        .with_connect_timeout(Duration::from_secs(2))
}

fn collect_events(manager: &ConnectionManager) -> mpsc::UnboundedReceiver<InboundEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    manager.on_message(move |event| {
        let _ = tx.send(event);
    });
    rx
}

async fn next_inbound(rx: &mut mpsc::UnboundedReceiver<InboundEvent>) -> InboundEvent {
    timeout(TIMEOUT, rx.recv())
        .await
        .expect("timeout waiting for inbound event")
        .expect("handler dropped")
}

async fn next_event(rx: &mut broadcast::Receiver<ConnectionEvent>) -> ConnectionEvent {
    timeout(TIMEOUT, rx.recv())
        .await
        .expect("timeout waiting for connection event")
        .expect("event channel closed")
}

/// Collect events up to and including the transition into `target`.
async fn events_until(
    rx: &mut broadcast::Receiver<ConnectionEvent>,
    target: ConnectionState,
) -> Vec<ConnectionEvent> {
    let mut seen = Vec::new();
    loop {
        let event = next_event(rx).await;
        let done = matches!(event, ConnectionEvent::StateChanged { to, .. } if to == target);
        seen.push(event);
        if done {
            return seen;
        }
    }
}

fn assert_legal_path(start: ConnectionState, events: &[ConnectionEvent]) {
    let mut current = start;
    for event in events {
        if let ConnectionEvent::StateChanged { from, to } = *event {
            assert_eq!(from, current, "transition must start where the last one ended");
            assert!(from.can_transition_to(to), "illegal edge {from} -> {to}");
            current = to;
        }
    }
}

async fn wait_for_state(manager: &ConnectionManager, target: ConnectionState) {
    timeout(TIMEOUT, async {
        while manager.state() != target {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("state never reached");
}

#[tokio::test]
async fn delivers_frames_in_order_and_filters_logs() {
    let mut server = TestServer::start(vec![], Behaviour::Serve).await;
    let manager = ConnectionManager::new(options(&server.url, 50, 5));
    let mut inbound = collect_events(&manager);

    manager.connect().await.unwrap();
    assert_eq!(manager.state(), ConnectionState::Connected);

    server.push(r#"{"type":"agent_log","msg":"x"}"#);
    server.push("{not json");
    server.push(r#"{"type":"agent_response","response":"42"}"#);
    server.push(r#"{"type":"user_message","data":"echo"}"#);
    server.push(r#"{"type":"tool_progress","step":1}"#);

    let first = next_inbound(&mut inbound).await;
    assert_eq!(first.frame(), &json!({"type": "agent_response", "response": "42"}));
    assert_eq!(first.response_text(), Some("42"));
    assert_eq!(next_inbound(&mut inbound).await.kind(), Some("user_message"));
    assert_eq!(next_inbound(&mut inbound).await.kind(), Some("tool_progress"));

    manager
        .send(&OutboundMessage::new("hello", "helper", "openai"))
        .unwrap();
    let frame: serde_json::Value = serde_json::from_str(&server.next_frame().await).unwrap();
    assert_eq!(
        frame,
        json!({"message": "hello", "llm_name": "helper", "provider": "openai"})
    );

    manager.disconnect();
}

#[tokio::test]
async fn handshake_carries_bearer_token() {
    let server = TestServer::start(vec![], Behaviour::Serve).await;
    let manager = ConnectionManager::new(
        options(&server.url, 50, 5).with_token(BearerToken::new("tok-9").unwrap()),
    );
    manager.connect().await.unwrap();
    assert_eq!(
        server.auth_headers.lock().clone(),
        vec![Some("Bearer tok-9".to_string())]
    );
    manager.disconnect();
}

#[tokio::test]
async fn connect_when_connected_is_a_noop() {
    let server = TestServer::start(vec![], Behaviour::Serve).await;
    let manager = ConnectionManager::new(options(&server.url, 50, 5));
    manager.connect().await.unwrap();
    manager.connect().await.unwrap();
    assert_eq!(server.accepted(), 1);
    manager.disconnect();
}

#[tokio::test]
async fn send_while_connecting_never_reaches_transport() {
    let mut server = TestServer::start(vec![Behaviour::Stall], Behaviour::Serve).await;
    let manager = ConnectionManager::new(options(&server.url, 50, 5));

    let connecting = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.connect().await })
    };
    wait_for_state(&manager, ConnectionState::Connecting).await;

    let msg = OutboundMessage::new("early", "m", "p");
    assert!(matches!(manager.send(&msg), Err(ConnectionError::NotConnected)));
    assert!(matches!(
        manager.connect().await,
        Err(ConnectionError::ConnectInProgress)
    ));

    manager.disconnect();
    let result = timeout(TIMEOUT, connecting).await.unwrap().unwrap();
    assert!(matches!(
        result,
        Err(ConnectionError::Aborted) | Err(ConnectionError::Timeout(_))
    ));
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(server.inbound.try_recv().is_err());
}

#[tokio::test]
async fn reconnects_with_linear_backoff() {
    let server = TestServer::start(
        vec![
            Behaviour::Serve,
            Behaviour::Refuse,
            Behaviour::Refuse,
            Behaviour::Serve,
        ],
        Behaviour::Serve,
    )
    .await;
    let manager = ConnectionManager::new(options(&server.url, 40, 5));
    let mut events = manager.subscribe();
    let mut inbound = collect_events(&manager);

    manager.connect().await.unwrap();
    let opened = events_until(&mut events, ConnectionState::Connected).await;

    server.close_clients();
    let mut recovered = events_until(&mut events, ConnectionState::Reconnecting).await;
    recovered.extend(events_until(&mut events, ConnectionState::Connected).await);

    let mut all = opened.clone();
    all.extend(recovered.iter().cloned());
    assert_legal_path(ConnectionState::Disconnected, &all);

    let scheduled: Vec<_> = recovered
        .iter()
        .filter_map(|e| match e {
            ConnectionEvent::ReconnectScheduled { attempt, delay } => Some((*attempt, *delay)),
            _ => None,
        })
        .collect();
    assert_eq!(
        scheduled,
        vec![
            (1, Duration::from_millis(40)),
            (2, Duration::from_millis(80)),
            (3, Duration::from_millis(120)),
        ]
    );
    let failures = recovered
        .iter()
        .filter(|e| matches!(e, ConnectionEvent::ReconnectFailed { .. }))
        .count();
    assert_eq!(failures, 2);

    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(manager.reconnect_attempts(), 0);
    assert_eq!(server.accepted(), 4);

    // The handler registered before the drop still receives frames.
    server.push(r#"{"type":"agent_response","response":"back"}"#);
    assert_eq!(next_inbound(&mut inbound).await.response_text(), Some("back"));

    manager.disconnect();
}

#[tokio::test]
async fn gives_up_after_max_attempts() {
    let server = TestServer::start(vec![Behaviour::Serve], Behaviour::Refuse).await;
    let manager = ConnectionManager::new(options(&server.url, 20, 3));
    let mut events = manager.subscribe();

    manager.connect().await.unwrap();
    events_until(&mut events, ConnectionState::Connected).await;

    server.close_clients();
    let trail = events_until(&mut events, ConnectionState::Disconnected).await;
    assert_legal_path(ConnectionState::Connected, &trail);

    let attempts: Vec<u32> = trail
        .iter()
        .filter_map(|e| match e {
            ConnectionEvent::ReconnectScheduled { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .collect();
    assert_eq!(attempts, vec![1, 2, 3]);
    assert_eq!(manager.reconnect_attempts(), 3);

    // Nothing else is scheduled once the manager gave up.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(matches!(
        events.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
    assert_eq!(server.accepted(), 4);
    assert_eq!(manager.state(), ConnectionState::Disconnected);

    let msg = OutboundMessage::new("late", "m", "p");
    assert!(matches!(manager.send(&msg), Err(ConnectionError::NotConnected)));
}

#[tokio::test]
async fn disconnect_cancels_pending_reconnect() {
    let server = TestServer::start(vec![], Behaviour::Serve).await;
    let manager = ConnectionManager::new(options(&server.url, 200, 5));
    let mut events = manager.subscribe();

    manager.connect().await.unwrap();
    events_until(&mut events, ConnectionState::Connected).await;

    server.close_clients();
    loop {
        if let ConnectionEvent::ReconnectScheduled { attempt: 1, .. } = next_event(&mut events).await {
            break;
        }
    }
    manager.disconnect();
    assert_eq!(manager.state(), ConnectionState::Disconnected);

    // Well past the first retry's timer.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(server.accepted(), 1);

    let trailing: Vec<_> = std::iter::from_fn(|| events.try_recv().ok()).collect();
    assert_eq!(
        trailing,
        vec![ConnectionEvent::StateChanged {
            from: ConnectionState::Reconnecting,
            to: ConnectionState::Disconnected
        }]
    );
}

#[tokio::test]
async fn explicit_disconnect_does_not_reconnect() {
    let server = TestServer::start(vec![], Behaviour::Serve).await;
    let manager = ConnectionManager::new(options(&server.url, 20, 5));

    manager.connect().await.unwrap();
    manager.disconnect();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(server.accepted(), 1);

    manager.connect().await.unwrap();
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(server.accepted(), 2);
    manager.disconnect();
}

#[tokio::test]
async fn explicit_connect_during_reconnect_takes_over() {
    let server = TestServer::start(vec![], Behaviour::Serve).await;
    let manager = ConnectionManager::new(options(&server.url, 1_000, 5));
    let mut events = manager.subscribe();

    manager.connect().await.unwrap();
    events_until(&mut events, ConnectionState::Connected).await;
    server.close_clients();
    events_until(&mut events, ConnectionState::Reconnecting).await;

    manager.connect().await.unwrap();
    let trail = events_until(&mut events, ConnectionState::Connected).await;
    assert_legal_path(ConnectionState::Reconnecting, &trail);

    // The scheduled retry was cancelled and never opens a second channel.
    tokio::time::sleep(Duration::from_millis(1_300)).await;
    assert_eq!(server.accepted(), 2);
    manager.disconnect();
}

#[tokio::test]
async fn heartbeat_pings_while_connected() {
    let server = TestServer::start(vec![], Behaviour::Serve).await;
    let manager = ConnectionManager::new(
        options(&server.url, 50, 5).with_heartbeat(Some(Duration::from_millis(30))),
    );
    manager.connect().await.unwrap();

    timeout(TIMEOUT, async {
        while server.pings.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("heartbeat pings never arrived");
    assert_eq!(manager.state(), ConnectionState::Connected);

    manager.disconnect();
}

#[tokio::test]
async fn no_pings_without_heartbeat() {
    let server = TestServer::start(vec![], Behaviour::Serve).await;
    let manager = ConnectionManager::new(options(&server.url, 50, 5));
    manager.connect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(server.pings.load(Ordering::SeqCst), 0);
    manager.disconnect();
}

#[tokio::test]
async fn panicking_handler_keeps_channel_open() {
    let mut server = TestServer::start(vec![], Behaviour::Serve).await;
    let manager = ConnectionManager::new(options(&server.url, 50, 5));
    let (tx, mut inbound) = mpsc::unbounded_channel();
    manager.on_message(move |event| {
        if event.kind() == Some("explode") {
            panic!("handler bug");
        }
        let _ = tx.send(event);
    });
    let mut events = manager.subscribe();
    manager.connect().await.unwrap();
    events_until(&mut events, ConnectionState::Connected).await;

    server.push(r#"{"type":"explode"}"#);
    server.push(r#"{"type":"agent_response","response":"still here"}"#);
    assert_eq!(
        next_inbound(&mut inbound).await.response_text(),
        Some("still here")
    );

    assert_eq!(manager.state(), ConnectionState::Connected);
    manager
        .send(&OutboundMessage::new("after", "m", "p"))
        .unwrap();
    assert!(server.next_frame().await.contains("after"));
    assert_eq!(server.accepted(), 1);
    assert!(events.try_recv().is_err(), "no state change after the panic");

    manager.disconnect();
}

#[tokio::test]
async fn failed_first_connect_retries_when_enabled() {
    let server = TestServer::start(
        vec![Behaviour::Refuse, Behaviour::Refuse],
        Behaviour::Serve,
    )
    .await;
    let manager = ConnectionManager::new(options(&server.url, 20, 5).with_initial_retry(true));
    let mut events = manager.subscribe();

    assert!(manager.connect().await.is_err());

    let trail = events_until(&mut events, ConnectionState::Connected).await;
    assert_legal_path(ConnectionState::Disconnected, &trail);
    assert_eq!(
        trail[..2],
        [
            ConnectionEvent::StateChanged {
                from: ConnectionState::Disconnected,
                to: ConnectionState::Connecting
            },
            ConnectionEvent::StateChanged {
                from: ConnectionState::Connecting,
                to: ConnectionState::Reconnecting
            },
        ]
    );
    let attempts: Vec<u32> = trail
        .iter()
        .filter_map(|e| match e {
            ConnectionEvent::ReconnectScheduled { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .collect();
    assert_eq!(attempts, vec![1, 2]);
    assert_eq!(server.accepted(), 3);
    assert_eq!(manager.reconnect_attempts(), 0);

    manager.disconnect();
}

#[tokio::test]
async fn failed_first_connect_is_final_by_default() {
    let server = TestServer::start(vec![], Behaviour::Refuse).await;
    let manager = ConnectionManager::new(options(&server.url, 20, 5));
    let mut events = manager.subscribe();

    assert!(manager.connect().await.is_err());
    tokio::time::sleep(Duration::from_millis(200)).await;

    let trail: Vec<_> = std::iter::from_fn(|| events.try_recv().ok()).collect();
    assert_eq!(
        trail,
        vec![
            ConnectionEvent::StateChanged {
                from: ConnectionState::Disconnected,
                to: ConnectionState::Connecting
            },
            ConnectionEvent::StateChanged {
                from: ConnectionState::Connecting,
                to: ConnectionState::Disconnected
            },
        ]
    );
    assert_eq!(server.accepted(), 1);
}
