//! 통합 테스트용 프로세스 내 스트림 서버.

#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use td365_core::config::StreamConfig;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};

pub const WAIT: Duration = Duration::from_secs(5);

/// 연결을 받아 업그레이드된 소켓을 테스트에 넘깁니다.
pub struct FakeServer {
    pub port: u16,
    conns: mpsc::UnboundedReceiver<WebSocketStream<TcpStream>>,
}

impl FakeServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, conns) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                if let Ok(ws) = accept_async(socket).await {
                    if tx.send(ws).is_err() {
                        break;
                    }
                }
            }
        });

        Self { port, conns }
    }

    pub fn config(&self) -> StreamConfig {
        StreamConfig {
            scheme: "ws".to_string(),
            port: self.port,
            path: "/".to_string(),
            reconnect_delay_ms: 50,
            connect_timeout_secs: 2,
            idle_timeout_secs: 5,
            ..Default::default()
        }
    }

    pub async fn next_conn(&mut self) -> ServerConn {
        let ws = tokio::time::timeout(WAIT, self.conns.recv())
            .await
            .expect("no connection within timeout")
            .expect("listener stopped");
        ServerConn { ws }
    }

    pub async fn no_conn_within(&mut self, wait: Duration) -> bool {
        tokio::time::timeout(wait, self.conns.recv()).await.is_err()
    }
}

/// 테스트가 조작하는 서버 쪽 연결 하나.
pub struct ServerConn {
    pub ws: WebSocketStream<TcpStream>,
}

impl ServerConn {
    pub async fn send_json(&mut self, value: Value) {
        self.ws.send(Message::Text(value.to_string())).await.unwrap();
    }

    /// ping/pong을 제외한 다음 메시지.
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            let next = tokio::time::timeout(WAIT, self.ws.next())
                .await
                .expect("no message within timeout");
            match next {
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(message)) => return Some(message),
                Some(Err(_)) | None => return None,
            }
        }
    }

    pub async fn recv_json(&mut self) -> Value {
        match self.recv().await {
            Some(Message::Text(text)) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    /// connectResponse와 authenticationResponse를 보내고 받은 인증 프레임을 반환합니다.
    pub async fn handshake(&mut self) -> Value {
        self.send_json(json!({"t": "connectResponse", "d": {}})).await;
        let auth = self.recv_json().await;
        assert_eq!(auth["action"], "authentication");
        self.send_json(json!({"t": "authenticationResponse", "d": {"HasError": false}}))
            .await;
        auth
    }

    pub async fn send_prices(&mut self, grouping: &str, records: Vec<String>) {
        self.send_json(json!({"t": "p", "d": {grouping: records}})).await;
    }

    pub async fn close(&mut self) {
        self.ws.close(None).await.unwrap();
    }
}

pub fn record(quote_id: u32, bid: &str) -> String {
    format!("{},{},{},1.5,1,1,,,hash{},0,,2025-03-14T09:30:00", quote_id, bid, bid, quote_id)
}
