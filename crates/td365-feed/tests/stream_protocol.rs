//! 프로세스 내 웹소켓 서버를 상대로 한 스트림 프로토콜 테스트.

mod common;

use common::{record, FakeServer, WAIT};
use crossbeam_channel::{unbounded, Receiver};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use td365_core::types::{PriceGrouping, Tick};
use td365_feed::{FeedError, StreamClient, StreamCredentials, StreamState, Termination};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;

fn credentials() -> StreamCredentials {
    StreamCredentials {
        login_id: "L-100".to_string(),
        token: "session-token".to_string(),
    }
}

/// 클라이언트를 백그라운드에서 시작하고 서버 쪽 핸드셰이크를 마칩니다.
async fn ready_client(
    server: &mut FakeServer,
    client: &Arc<StreamClient>,
) -> (common::ServerConn, Receiver<Tick>) {
    let (tick_tx, tick_rx) = unbounded();
    let starting = client.clone();
    let start = tokio::spawn(async move { starting.start("127.0.0.1", credentials(), tick_tx).await });

    let mut conn = server.next_conn().await;
    conn.handshake().await;

    start.await.unwrap().expect("start should resolve on Ready");
    assert_eq!(client.state(), StreamState::Ready);
    (conn, tick_rx)
}

async fn collect_ticks(rx: &Receiver<Tick>, count: usize) -> Vec<Tick> {
    let deadline = tokio::time::Instant::now() + WAIT;
    let mut ticks = Vec::with_capacity(count);
    while ticks.len() < count {
        ticks.extend(rx.try_iter());
        assert!(
            tokio::time::Instant::now() < deadline,
            "only {} of {} ticks arrived",
            ticks.len(),
            count
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    ticks
}

fn drain_states(events: &mut broadcast::Receiver<StreamState>) -> Vec<StreamState> {
    let mut states = Vec::new();
    while let Ok(state) = events.try_recv() {
        states.push(state);
    }
    states
}

#[tokio::test]
async fn test_handshake_sends_single_auth_reply() {
    let mut server = FakeServer::start().await;
    let client = Arc::new(StreamClient::new(server.config()));
    let (tick_tx, _tick_rx) = unbounded();

    let starting = client.clone();
    let start = tokio::spawn(async move { starting.start("127.0.0.1", credentials(), tick_tx).await });

    let mut conn = server.next_conn().await;
    let auth = conn.handshake().await;
    assert_eq!(auth["loginId"], "L-100");
    assert_eq!(auth["token"], "session-token");
    assert_eq!(auth["tradingAccountType"], "SPREAD");
    assert_eq!(auth["reason"], "Connect");
    assert_eq!(auth["clientVersion"], "1.0.0.6");

    start.await.unwrap().unwrap();
    assert_eq!(client.state(), StreamState::Ready);

    // 다음 프레임은 하트비트 응답이어야 함 (두 번째 인증 프레임 없음)
    conn.send_json(json!({
        "t": "heartbeat",
        "d": {"SentByServer": "2025-03-14T09:30:00", "MessagesReceived": 3, "PricesReceived": 0, "MessagesSent": 9, "PricesSent": 120}
    }))
    .await;
    let echo = conn.recv_json().await;
    assert_eq!(
        echo,
        json!({
            "SentByServer": "2025-03-14T09:30:00",
            "MessagesReceived": 3,
            "PricesReceived": 0,
            "MessagesSent": 9,
            "PricesSent": 120,
            "Visible": true,
            "action": "heartbeat"
        })
    );
}

#[tokio::test]
async fn test_subscribe_and_ticks_in_arrival_order() {
    let mut server = FakeServer::start().await;
    let client = Arc::new(StreamClient::new(server.config()));
    let (mut conn, ticks) = ready_client(&mut server, &client).await;

    client.subscribe(4021).await.unwrap();
    assert_eq!(
        conn.recv_json().await,
        json!({"quoteId": 4021, "priceGrouping": "Sampled", "action": "subscribe"})
    );

    conn.send_json(json!({
        "t": "subscribeResponse",
        "d": {"HasError": false, "Current": [record(4021, "100.0")], "PriceGrouping": "Sampled"}
    }))
    .await;
    for batch in 0..5u32 {
        let records = (1..=20u32).map(|i| record(batch * 20 + i, "101.5")).collect();
        conn.send_prices("Sampled", records).await;
    }
    conn.send_json(json!({"t": "p", "d": {"Sampled": ["broken,record"], "Delayed": [record(999, "7.25")]}}))
        .await;

    let received = collect_ticks(&ticks, 102).await;
    let ids: Vec<u32> = received.iter().map(|t| t.quote_id).collect();

    let mut expected = vec![4021];
    expected.extend(1..=100);
    expected.push(999);
    assert_eq!(ids, expected);
    assert_eq!(received[101].grouping, PriceGrouping::Delayed);

    client.unsubscribe(4021).await.unwrap();
    assert_eq!(conn.recv_json().await["action"], "unsubscribe");
}

#[tokio::test]
async fn test_clean_close_reconnects_and_replays_subscriptions() {
    let mut server = FakeServer::start().await;
    let client = Arc::new(StreamClient::new(server.config()));
    let mut events = client.state_events();
    let (mut conn, _ticks) = ready_client(&mut server, &client).await;

    client.subscribe(11).await.unwrap();
    client.subscribe(12).await.unwrap();
    conn.recv_json().await;
    conn.recv_json().await;

    conn.close().await;
    // 클라이언트의 Close 응답이 소켓을 버리기 전에 도착해야 함
    assert!(matches!(conn.recv().await, Some(Message::Close(_))));

    let mut second = server.next_conn().await;
    let auth = second.handshake().await;
    assert_eq!(auth["token"], "session-token");

    let replay_a = second.recv_json().await;
    let replay_b = second.recv_json().await;
    assert_eq!(replay_a["quoteId"], 11);
    assert_eq!(replay_b["quoteId"], 12);
    assert_eq!(replay_a["action"], "subscribe");

    // Ready 복귀 대기
    tokio::time::timeout(WAIT, async {
        while client.state() != StreamState::Ready {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let states = drain_states(&mut events);
    let reconnecting = states
        .iter()
        .position(|s| *s == StreamState::Reconnecting)
        .expect("should pass through Reconnecting");
    assert_eq!(states[reconnecting + 1], StreamState::Connecting);
    assert!(!states.contains(&StreamState::Disconnected));
    assert!(client.termination().is_none());
}

#[tokio::test]
async fn test_abrupt_drop_is_fatal_and_signals_once() {
    let mut server = FakeServer::start().await;
    let client = Arc::new(StreamClient::new(server.config()));
    let mut events = client.state_events();
    let (conn, _ticks) = ready_client(&mut server, &client).await;

    // close 핸드셰이크 없이 TCP 연결 종료
    drop(conn);

    let termination = tokio::time::timeout(WAIT, client.wait_for_disconnect())
        .await
        .unwrap();
    assert!(matches!(termination, Termination::Failed(_)));
    assert_eq!(client.state(), StreamState::Disconnected);

    // 두 번째 대기도 같은 결과를 즉시 반환
    assert_eq!(client.wait_for_disconnect().await, termination);

    let states = drain_states(&mut events);
    assert_eq!(
        states.iter().filter(|s| **s == StreamState::Disconnected).count(),
        1
    );
    assert!(!states.contains(&StreamState::Reconnecting));

    assert!(server.no_conn_within(Duration::from_millis(300)).await);
    assert!(matches!(client.subscribe(1).await, Err(FeedError::Shutdown)));
}

#[tokio::test]
async fn test_authentication_rejected() {
    let mut server = FakeServer::start().await;
    let client = Arc::new(StreamClient::new(server.config()));
    let (tick_tx, _tick_rx) = unbounded();

    let starting = client.clone();
    let start = tokio::spawn(async move { starting.start("127.0.0.1", credentials(), tick_tx).await });

    let mut conn = server.next_conn().await;
    conn.send_json(json!({"t": "connectResponse", "d": {}})).await;
    conn.recv_json().await;
    conn.send_json(json!({
        "t": "authenticationResponse",
        "d": {"HasError": true, "ErrorMessage": "Invalid token"}
    }))
    .await;

    let err = start.await.unwrap().unwrap_err();
    assert!(err.is_auth_error());
    assert!(err.to_string().contains("Invalid token"));
    assert_eq!(client.state(), StreamState::AuthFailed);
    assert_eq!(
        client.wait_for_disconnect().await,
        Termination::AuthFailed("Invalid token".to_string())
    );
}

#[tokio::test]
async fn test_subscribes_before_ready_flush_in_order() {
    let mut server = FakeServer::start().await;
    let config = td365_core::config::StreamConfig {
        pending_command_capacity: 3,
        ..server.config()
    };
    let client = Arc::new(StreamClient::new(config));
    let (tick_tx, _tick_rx) = unbounded();

    let starting = client.clone();
    let start = tokio::spawn(async move { starting.start("127.0.0.1", credentials(), tick_tx).await });

    let subscriber = client.clone();
    let requests = tokio::spawn(async move {
        futures::future::join_all((1..=4u32).map(|id| subscriber.subscribe(id))).await
    });

    let mut conn = server.next_conn().await;
    // 명령이 AwaitingAuth 상태에서 대기열에 들어갈 시간
    tokio::time::sleep(Duration::from_millis(200)).await;
    conn.handshake().await;
    start.await.unwrap().unwrap();

    let mut sent = Vec::new();
    for _ in 0..3 {
        let frame = conn.recv_json().await;
        assert_eq!(frame["action"], "subscribe");
        sent.push(frame["quoteId"].as_u64().unwrap());
    }
    assert_eq!(sent, vec![1, 2, 3]);

    let results = requests.await.unwrap();
    assert!(results[..3].iter().all(Result::is_ok));
    assert!(matches!(results[3], Err(FeedError::QueueFull(3))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_subscribes_from_caller_threads_flush_in_queue_order() {
    const CALLERS: u32 = 8;
    let mut server = FakeServer::start().await;
    let client = Arc::new(StreamClient::new(server.config()));
    let (tick_tx, _tick_rx) = unbounded();

    let starting = client.clone();
    let start = tokio::spawn(async move { starting.start("127.0.0.1", credentials(), tick_tx).await });
    let mut conn = server.next_conn().await;

    // 명령이 채널에 들어간 순서. 첫 poll이 명령을 보내므로 잠금 안에서 기록
    let queued = Arc::new(std::sync::Mutex::new(Vec::new()));
    let handle = tokio::runtime::Handle::current();
    let callers: Vec<_> = (1..=CALLERS)
        .map(|quote_id| {
            let client = client.clone();
            let queued = queued.clone();
            let handle = handle.clone();
            std::thread::spawn(move || {
                handle.block_on(async move {
                    let mut request = Box::pin(client.subscribe(quote_id));
                    {
                        let mut queued = queued.lock().unwrap();
                        let mut cx = Context::from_waker(futures::task::noop_waker_ref());
                        if let Poll::Ready(result) = request.as_mut().poll(&mut cx) {
                            return result;
                        }
                        queued.push(quote_id);
                    }
                    request.await
                })
            })
        })
        .collect();

    tokio::time::timeout(WAIT, async {
        while queued.lock().unwrap().len() < CALLERS as usize {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("every caller should queue before Ready");
    assert_ne!(client.state(), StreamState::Ready);

    conn.handshake().await;
    start.await.unwrap().unwrap();

    let mut sent = Vec::new();
    for _ in 0..CALLERS {
        // recv_json은 프레임 전체가 하나의 JSON이어야 통과
        let frame = conn.recv_json().await;
        assert_eq!(frame["action"], "subscribe");
        assert_eq!(frame["priceGrouping"], "Sampled");
        sent.push(frame["quoteId"].as_u64().unwrap() as u32);
    }
    assert_eq!(sent, *queued.lock().unwrap());

    for caller in callers {
        assert!(caller.join().unwrap().is_ok());
    }
    assert_eq!(client.state(), StreamState::Ready);
}

#[tokio::test]
async fn test_close_sends_close_frame() {
    let mut server = FakeServer::start().await;
    let client = Arc::new(StreamClient::new(server.config()));
    let (mut conn, _ticks) = ready_client(&mut server, &client).await;

    client.close().await.unwrap();

    assert!(matches!(conn.recv().await, Some(Message::Close(_)) | None));
    assert_eq!(client.wait_for_disconnect().await, Termination::Closed);
    assert_eq!(client.state(), StreamState::Disconnected);
    assert!(server.no_conn_within(Duration::from_millis(200)).await);

    // 두 번째 close는 아무 일도 하지 않음
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_idle_timeout_reconnects() {
    let mut server = FakeServer::start().await;
    let config = td365_core::config::StreamConfig {
        idle_timeout_secs: 1,
        ..server.config()
    };
    let client = Arc::new(StreamClient::new(config));
    let (mut first, _ticks) = ready_client(&mut server, &client).await;

    // 서버가 아무것도 보내지 않으면 기존 연결을 닫고 새 연결이 와야 함
    assert!(matches!(first.recv().await, Some(Message::Close(_))));
    let mut second = server.next_conn().await;
    second.handshake().await;
    assert!(client.termination().is_none());
}

#[tokio::test]
async fn test_wait_for_disconnect_without_start() {
    let client = StreamClient::new(td365_core::config::StreamConfig::default());
    assert_eq!(client.wait_for_disconnect().await, Termination::Closed);
    assert_eq!(client.state(), StreamState::Disconnected);
}

#[tokio::test]
async fn test_first_connect_failure_fails_start() {
    // 바인드 후 바로 닫아 사용되지 않는 포트를 얻음
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let config = td365_core::config::StreamConfig {
        scheme: "ws".to_string(),
        port,
        ..Default::default()
    };
    let client = StreamClient::new(config);
    let (tick_tx, _tick_rx) = unbounded();

    let err = client
        .start("127.0.0.1", credentials(), tick_tx)
        .await
        .unwrap_err();
    assert!(err.is_retryable(), "connection refused should be transient: {err:?}");
    assert!(matches!(
        client.wait_for_disconnect().await,
        Termination::Failed(_)
    ));
}
