//! 실시간 시세 스트림 클라이언트.
//!
//! 연결 하나를 소유하는 실행 루프 태스크를 띄우고, 외부에서는 명령 채널로만 조작합니다.
//! 서버가 정상적으로 연결을 닫으면 일정 시간 뒤 새 연결로 교체하고 재인증한 다음
//! 기존 구독을 복원합니다. 그 밖의 수신 에러는 루프를 끝내며 종료 신호는 한 번만 발생합니다.
//!
//! # 사용 예제
//!
//! ```rust,ignore
//! let (tick_tx, tick_rx) = crossbeam_channel::unbounded();
//! let client = StreamClient::new(StreamConfig::default());
//! client.start("demo-api.finsa.com.au", credentials, tick_tx).await?;
//! client.subscribe(4021).await?;
//! let reason = client.wait_for_disconnect().await;
//! ```

use super::handler::{FeedHandler, HandlerCommand, Outbound, StreamState};
use crate::error::{FeedError, FeedResult};
use crossbeam_channel::Sender;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use td365_core::config::StreamConfig;
use td365_core::types::Tick;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;

/// Close 프레임 전송과 flush에 허용하는 시간.
const CLOSE_TIMEOUT: Duration = Duration::from_millis(500);

/// 스트림 인증에 쓰는 자격 증명.
#[derive(Clone)]
pub struct StreamCredentials {
    pub login_id: String,
    pub token: String,
}

impl fmt::Debug for StreamCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamCredentials")
            .field("login_id", &self.login_id)
            .field("token", &"***")
            .finish()
    }
}

/// 연결이 서비스에서 완전히 빠진 이유.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// 명시적 종료
    Closed,
    /// 서버가 인증을 거부
    AuthFailed(String),
    /// 복구할 수 없는 에러
    Failed(String),
}

impl Termination {
    pub fn is_failure(&self) -> bool {
        !matches!(self, Termination::Closed)
    }

    /// 호출자에게 돌려줄 에러로 변환합니다.
    pub fn into_error(self) -> FeedError {
        match self {
            Termination::Closed => FeedError::Shutdown,
            Termination::AuthFailed(msg) => FeedError::Auth(msg),
            Termination::Failed(msg) => FeedError::Transient(msg),
        }
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Closed => write!(f, "closed"),
            Termination::AuthFailed(msg) => write!(f, "authentication failed: {}", msg),
            Termination::Failed(msg) => write!(f, "failed: {}", msg),
        }
    }
}

/// 연결 한 번이 끝난 이유.
enum SessionEnd {
    Reconnect(String),
    Closed,
    AuthFailed(String),
    Failed(FeedError),
}

/// 실시간 시세 스트림 클라이언트.
pub struct StreamClient {
    config: StreamConfig,
    cmd_tx: mpsc::UnboundedSender<HandlerCommand>,
    cmd_rx: Mutex<Option<mpsc::UnboundedReceiver<HandlerCommand>>>,
    state_tx: watch::Sender<StreamState>,
    events_tx: broadcast::Sender<StreamState>,
    termination_tx: watch::Sender<Option<Termination>>,
    cancel: CancellationToken,
    started: AtomicBool,
}

impl StreamClient {
    pub fn new(config: StreamConfig) -> Self {
        Self::with_cancel(config, CancellationToken::new())
    }

    /// 외부 종료 토큰에 묶인 클라이언트. 토큰이 취소되면 연결 중이든 Ready든 루프가 끝납니다.
    pub fn with_cancel(config: StreamConfig, cancel: CancellationToken) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(StreamState::Disconnected);
        let (events_tx, _) = broadcast::channel(64);
        let (termination_tx, _) = watch::channel(None);

        Self {
            config,
            cmd_tx,
            cmd_rx: Mutex::new(Some(cmd_rx)),
            state_tx,
            events_tx,
            termination_tx,
            cancel,
            started: AtomicBool::new(false),
        }
    }

    /// 현재 상태.
    pub fn state(&self) -> StreamState {
        *self.state_tx.borrow()
    }

    /// 상태 전이 알림을 구독합니다.
    pub fn state_events(&self) -> broadcast::Receiver<StreamState> {
        self.events_tx.subscribe()
    }

    /// 실행 루프를 띄우고 첫 Ready까지 기다립니다.
    ///
    /// 인증이 거부되면 `Auth`, 첫 연결이 실패하면 해당 에러를 반환합니다.
    /// 클라이언트당 한 번만 호출할 수 있습니다.
    pub async fn start(
        &self,
        host: &str,
        credentials: StreamCredentials,
        tick_tx: Sender<Tick>,
    ) -> FeedResult<()> {
        let cmd_rx = self
            .cmd_rx
            .lock()
            .ok()
            .and_then(|mut guard| guard.take())
            .ok_or_else(|| FeedError::Protocol("stream client already started".to_string()))?;
        self.started.store(true, Ordering::SeqCst);

        let (ready_tx, ready_rx) = oneshot::channel();
        let handler = FeedHandler::new(
            credentials.login_id,
            credentials.token,
            self.config.client_version.clone(),
            self.config.price_grouping,
            self.config.pending_command_capacity,
            self.config.debug_frames,
            tick_tx,
        );

        let run = RunLoop {
            url: self.config.url(host),
            config: self.config.clone(),
            handler,
            cmd_rx,
            state_tx: self.state_tx.clone(),
            events_tx: self.events_tx.clone(),
            termination_tx: self.termination_tx.clone(),
            cancel: self.cancel.clone(),
            ready_tx: Some(ready_tx),
            ever_ready: false,
        };
        tokio::spawn(run.run());

        match ready_rx.await {
            Ok(result) => result,
            Err(_) => Err(self
                .termination()
                .map(Termination::into_error)
                .unwrap_or(FeedError::Shutdown)),
        }
    }

    /// 종목 시세를 구독합니다. Ready 전이면 대기열에 들어가고 Ready가 되면 전송됩니다.
    pub async fn subscribe(&self, quote_id: u32) -> FeedResult<()> {
        self.request(|reply| HandlerCommand::Subscribe { quote_id, reply })
            .await
    }

    /// 종목 시세 구독을 해지합니다.
    pub async fn unsubscribe(&self, quote_id: u32) -> FeedResult<()> {
        self.request(|reply| HandlerCommand::Unsubscribe { quote_id, reply })
            .await
    }

    /// close 프레임을 보내고 연결을 종료합니다. 이미 종료되었으면 아무 일도 하지 않습니다.
    pub async fn close(&self) -> FeedResult<()> {
        if !self.started.load(Ordering::SeqCst) {
            self.set_termination(Termination::Closed);
            return Ok(());
        }

        match self.request(|reply| HandlerCommand::Close { reply }).await {
            Err(FeedError::Shutdown) => Ok(()),
            other => other,
        }
    }

    /// 실행 루프를 즉시 중단시킵니다.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        if !self.started.load(Ordering::SeqCst) {
            self.set_termination(Termination::Closed);
        }
    }

    /// 연결이 완전히 종료될 때까지 기다리고 그 이유를 반환합니다.
    ///
    /// 시작하지 않은 클라이언트는 바로 `Closed`를 반환합니다.
    pub async fn wait_for_disconnect(&self) -> Termination {
        if !self.started.load(Ordering::SeqCst) {
            return Termination::Closed;
        }

        let mut rx = self.termination_tx.subscribe();
        let result = match rx.wait_for(Option::is_some).await {
            Ok(value) => value.clone().unwrap_or(Termination::Closed),
            Err(_) => Termination::Closed,
        };
        result
    }

    /// 이미 종료되었다면 그 이유.
    pub fn termination(&self) -> Option<Termination> {
        self.termination_tx.borrow().clone()
    }

    async fn request(
        &self,
        make: impl FnOnce(oneshot::Sender<FeedResult<()>>) -> HandlerCommand,
    ) -> FeedResult<()> {
        if self.termination().is_some() {
            return Err(FeedError::Shutdown);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(make(reply_tx))
            .map_err(|_| FeedError::Shutdown)?;
        reply_rx.await.map_err(|_| FeedError::Shutdown)?
    }

    fn set_termination(&self, termination: Termination) {
        set_once(&self.termination_tx, termination);
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn set_once(tx: &watch::Sender<Option<Termination>>, termination: Termination) -> bool {
    tx.send_if_modified(|current| {
        if current.is_none() {
            *current = Some(termination);
            true
        } else {
            false
        }
    })
}

/// 실행 루프가 소유하는 상태.
struct RunLoop {
    url: String,
    config: StreamConfig,
    handler: FeedHandler,
    cmd_rx: mpsc::UnboundedReceiver<HandlerCommand>,
    state_tx: watch::Sender<StreamState>,
    events_tx: broadcast::Sender<StreamState>,
    termination_tx: watch::Sender<Option<Termination>>,
    cancel: CancellationToken,
    ready_tx: Option<oneshot::Sender<FeedResult<()>>>,
    ever_ready: bool,
}

impl RunLoop {
    async fn run(mut self) {
        info!(url = %self.url, "Stream run loop started");

        let termination = loop {
            if self.cancel.is_cancelled() {
                break Termination::Closed;
            }

            self.transition(StreamState::Connecting);
            let ws = match self.open().await {
                Ok(ws) => ws,
                Err(FeedError::Shutdown) => break Termination::Closed,
                Err(e) if self.ever_ready && e.is_retryable() => {
                    warn!(error = %e, "Reconnect attempt failed");
                    if !self.backoff().await {
                        break Termination::Closed;
                    }
                    continue;
                }
                Err(e) => {
                    error!(error = %e, url = %self.url, "Stream connect failed");
                    let message = e.to_string();
                    self.resolve_ready(Err(e));
                    break Termination::Failed(message);
                }
            };

            self.handler.on_connected();
            self.publish();

            match self.session(ws).await {
                SessionEnd::Reconnect(reason) => {
                    warn!(reason = %reason, "Stream connection lost, reconnecting");
                    if !self.backoff().await {
                        break Termination::Closed;
                    }
                }
                SessionEnd::Closed => break Termination::Closed,
                SessionEnd::AuthFailed(message) => {
                    self.resolve_ready(Err(FeedError::Auth(message.clone())));
                    break Termination::AuthFailed(message);
                }
                SessionEnd::Failed(e) => {
                    error!(error = %e, "Stream read failed");
                    let message = e.to_string();
                    self.resolve_ready(Err(e));
                    break Termination::Failed(message);
                }
            }
        };

        self.handler.fail_pending(|| FeedError::Shutdown);
        self.resolve_ready(Err(FeedError::Shutdown));
        if self.handler.state() != StreamState::AuthFailed {
            self.transition(StreamState::Disconnected);
        }

        // 루프 종료 후 들어온 명령에도 응답
        self.cmd_rx.close();
        while let Ok(command) = self.cmd_rx.try_recv() {
            reject(command);
        }

        info!(reason = %termination, "Stream run loop exited");
        set_once(&self.termination_tx, termination);
    }

    async fn open(&self) -> FeedResult<WsStream> {
        debug!(url = %self.url, "Opening stream connection");
        let connect = timeout(self.config.connect_timeout(), connect_async(self.url.as_str()));
        let result = tokio::select! {
            _ = self.cancel.cancelled() => return Err(FeedError::Shutdown),
            result = connect => result,
        };
        match result {
            Ok(Ok((ws, _response))) => {
                info!(url = %self.url, "Stream connected");
                Ok(ws)
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(FeedError::Transient(format!(
                "connect timed out after {:?}",
                self.config.connect_timeout()
            ))),
        }
    }

    /// 연결 하나를 끝날 때까지 처리합니다.
    async fn session(&mut self, ws: WsStream) -> SessionEnd {
        let (mut write, mut read) = ws.split();
        let idle = self.config.idle_timeout();
        let mut deadline = Instant::now() + idle;

        loop {
            if self.cancel.is_cancelled() {
                send_close(&mut write).await;
                return SessionEnd::Closed;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    send_close(&mut write).await;
                    return SessionEnd::Closed;
                }
                _ = sleep_until(deadline) => {
                    send_close(&mut write).await;
                    return SessionEnd::Reconnect(format!("no frame for {:?}", idle));
                }
                message = read.next() => {
                    deadline = Instant::now() + idle;
                    if let Some(end) = self.on_message(message, &mut write).await {
                        return end;
                    }
                }
                Some(command) = self.cmd_rx.recv() => {
                    if let HandlerCommand::Close { reply } = command {
                        info!("Closing stream connection");
                        send_close(&mut write).await;
                        let _ = reply.send(Ok(()));
                        return SessionEnd::Closed;
                    }
                    let outbound = match self.handler.handle_command(command) {
                        Ok(outbound) => outbound,
                        Err(e) => return SessionEnd::Failed(e),
                    };
                    if let Err(e) = send_all(&mut write, outbound).await {
                        return SessionEnd::Reconnect(e.to_string());
                    }
                }
            }
        }
    }

    async fn on_message(
        &mut self,
        message: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
        write: &mut WsWrite,
    ) -> Option<SessionEnd> {
        let text = match message {
            None => return Some(SessionEnd::Reconnect("stream ended".to_string())),
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Ping(data))) => {
                if let Err(e) = write.send(Message::Pong(data)).await {
                    return Some(SessionEnd::Reconnect(e.to_string()));
                }
                return None;
            }
            Some(Ok(Message::Close(frame))) => {
                // 자동으로 대기열에 들어간 Close 응답을 내보냄
                send_close(write).await;
                return Some(SessionEnd::Reconnect(format!("closed by server: {:?}", frame)));
            }
            Some(Ok(_)) => return None,
            Some(Err(e)) => return Some(SessionEnd::Failed(e.into())),
        };

        let before = self.handler.state();
        let outbound = match self.handler.handle_text(&text) {
            Ok(outbound) => outbound,
            Err(e) => return Some(SessionEnd::Failed(e)),
        };

        let after = self.handler.state();
        if after != before {
            self.publish();
        }
        if after == StreamState::AuthFailed {
            let message = self
                .handler
                .auth_error()
                .unwrap_or("authentication rejected")
                .to_string();
            return Some(SessionEnd::AuthFailed(message));
        }

        if let Err(e) = send_all(write, outbound).await {
            return Some(SessionEnd::Reconnect(e.to_string()));
        }

        if after == StreamState::Ready && before != StreamState::Ready {
            self.ever_ready = true;
            self.resolve_ready(Ok(()));
        }
        None
    }

    /// 재연결 대기. 대기 중에도 명령을 받아 대기열에 넣습니다.
    /// 종료 요청이 오면 `false`를 반환합니다.
    async fn backoff(&mut self) -> bool {
        self.transition(StreamState::Reconnecting);
        let wake = sleep(self.config.reconnect_delay());
        tokio::pin!(wake);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = &mut wake => return true,
                Some(command) = self.cmd_rx.recv() => {
                    if let HandlerCommand::Close { reply } = command {
                        let _ = reply.send(Ok(()));
                        return false;
                    }
                    if let Err(e) = self.handler.handle_command(command) {
                        warn!(error = %e, "Command rejected during reconnect");
                    }
                }
            }
        }
    }

    fn transition(&mut self, state: StreamState) {
        self.handler.set_state(state);
        self.publish();
    }

    fn publish(&self) {
        let state = self.handler.state();
        let changed = self.state_tx.send_if_modified(|current| {
            if *current != state {
                *current = state;
                true
            } else {
                false
            }
        });
        if changed {
            let _ = self.events_tx.send(state);
        }
    }

    fn resolve_ready(&mut self, result: FeedResult<()>) {
        if let Some(tx) = self.ready_tx.take() {
            let _ = tx.send(result);
        }
    }
}

/// 프레임을 순서대로 보냅니다. 실패하면 남은 요청자에게 에러를 알립니다.
async fn send_all(write: &mut WsWrite, outbound: Vec<Outbound>) -> FeedResult<()> {
    let mut outbound = outbound.into_iter();

    while let Some(Outbound { frame, reply }) = outbound.next() {
        match write.send(Message::Text(frame)).await {
            Ok(()) => {
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(()));
                }
            }
            Err(e) => {
                let message = e.to_string();
                if let Some(reply) = reply {
                    let _ = reply.send(Err(FeedError::Transient(message.clone())));
                }
                for rest in outbound {
                    if let Some(reply) = rest.reply {
                        let _ = reply.send(Err(FeedError::Transient(message.clone())));
                    }
                }
                return Err(FeedError::from(e));
            }
        }
    }
    Ok(())
}

/// Close 프레임을 보내고 flush합니다. 응답 없는 상대에게는 `CLOSE_TIMEOUT`까지만 기다립니다.
async fn send_close(write: &mut WsWrite) {
    match timeout(CLOSE_TIMEOUT, write.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "Close frame not sent"),
        Err(_) => debug!("Close frame flush timed out"),
    }
}

fn reject(command: HandlerCommand) {
    let reply = match command {
        HandlerCommand::Subscribe { reply, .. }
        | HandlerCommand::Unsubscribe { reply, .. }
        | HandlerCommand::Close { reply } => reply,
    };
    let _ = reply.send(Err(FeedError::Shutdown));
}
