//! 스트림 프로토콜 상태 기계.
//!
//! 소켓을 직접 다루지 않습니다. 수신 텍스트 프레임과 외부 명령을 받아
//! 상태를 바꾸고, 보내야 할 프레임 목록을 돌려줍니다. 디코딩된 틱은 틱 큐로 보냅니다.

use super::messages::{
    AuthenticationRequest, AuthenticationResponse, FrameKind, Heartbeat, HeartbeatReply,
    InboundFrame, SubscribeResponse, SubscriptionAction, SubscriptionRequest,
};
use crate::error::{FeedError, FeedResult};
use crate::parse::decode_records;
use crossbeam_channel::Sender;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use td365_core::types::{PriceGrouping, Tick};
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

/// 명령 처리 결과를 돌려받는 채널.
pub type Reply = oneshot::Sender<FeedResult<()>>;

/// 스트림 연결 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    Disconnected,
    Connecting,
    AwaitingAuth,
    Ready,
    Reconnecting,
    /// 인증 거부. 종료 상태
    AuthFailed,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// 외부에서 실행 루프로 보내는 명령.
pub enum HandlerCommand {
    Subscribe { quote_id: u32, reply: Reply },
    Unsubscribe { quote_id: u32, reply: Reply },
    Close { reply: Reply },
}

impl fmt::Debug for HandlerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Subscribe { quote_id, .. } => f.debug_tuple("Subscribe").field(quote_id).finish(),
            Self::Unsubscribe { quote_id, .. } => {
                f.debug_tuple("Unsubscribe").field(quote_id).finish()
            }
            Self::Close { .. } => write!(f, "Close"),
        }
    }
}

/// 소켓으로 보낼 프레임. 전송 결과는 `reply`가 있으면 그쪽으로 알립니다.
#[derive(Debug)]
pub struct Outbound {
    pub frame: String,
    pub reply: Option<Reply>,
}

impl Outbound {
    fn frame(frame: String) -> Self {
        Self { frame, reply: None }
    }
}

struct PendingCommand {
    action: SubscriptionAction,
    quote_id: u32,
    reply: Reply,
}

/// 프로토콜 상태와 구독 기록을 가진 핸들러.
pub struct FeedHandler {
    login_id: String,
    token: String,
    client_version: String,
    grouping: PriceGrouping,
    debug_frames: bool,
    state: StreamState,
    auth_sent: bool,
    auth_error: Option<String>,
    /// 재인증 후 다시 보낼 구독 (요청 순서 유지)
    subscriptions: Vec<u32>,
    pending: VecDeque<PendingCommand>,
    capacity: usize,
    tick_tx: Sender<Tick>,
    dropped_ticks: u64,
}

impl FeedHandler {
    pub fn new(
        login_id: impl Into<String>,
        token: impl Into<String>,
        client_version: impl Into<String>,
        grouping: PriceGrouping,
        capacity: usize,
        debug_frames: bool,
        tick_tx: Sender<Tick>,
    ) -> Self {
        Self {
            login_id: login_id.into(),
            token: token.into(),
            client_version: client_version.into(),
            grouping,
            debug_frames,
            state: StreamState::Disconnected,
            auth_sent: false,
            auth_error: None,
            subscriptions: Vec::new(),
            pending: VecDeque::new(),
            capacity,
            tick_tx,
            dropped_ticks: 0,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn set_state(&mut self, state: StreamState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "Stream state");
            self.state = state;
        }
    }

    /// 인증 거부 사유.
    pub fn auth_error(&self) -> Option<&str> {
        self.auth_error.as_deref()
    }

    /// 현재 기록된 구독 목록.
    pub fn subscriptions(&self) -> &[u32] {
        &self.subscriptions
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// 새 전송 연결이 열렸을 때 호출합니다.
    pub fn on_connected(&mut self) {
        self.auth_sent = false;
        self.set_state(StreamState::AwaitingAuth);
    }

    /// 수신 텍스트 프레임 하나를 처리합니다.
    ///
    /// 봉투 자체를 해석할 수 없으면 `Protocol` 에러입니다.
    pub fn handle_text(&mut self, text: &str) -> FeedResult<Vec<Outbound>> {
        if self.debug_frames {
            debug!(frame = text, "<<");
        }

        let frame: InboundFrame = serde_json::from_str(text)?;

        match frame.kind() {
            FrameKind::Heartbeat => {
                let heartbeat: Heartbeat = body(frame.d)?;
                trace!("Heartbeat");
                let reply = serde_json::to_string(&HeartbeatReply::from(heartbeat))?;
                Ok(vec![Outbound::frame(reply)])
            }
            FrameKind::ConnectResponse => self.on_connect_response(),
            FrameKind::ReconnectResponse => {
                debug!("reconnectResponse ignored");
                Ok(Vec::new())
            }
            FrameKind::AuthenticationResponse => {
                let response: AuthenticationResponse = body(frame.d)?;
                self.on_authentication_response(response)
            }
            FrameKind::SubscribeResponse => {
                let response: SubscribeResponse = body(frame.d)?;
                self.on_subscribe_response(response);
                Ok(Vec::new())
            }
            FrameKind::Price => {
                self.on_price(&frame.d);
                Ok(Vec::new())
            }
            FrameKind::Unknown => {
                warn!(tag = %frame.t, "Unhandled frame discarded");
                Ok(Vec::new())
            }
        }
    }

    /// 구독/해지 명령을 처리합니다.
    ///
    /// Ready이면 바로 보낼 프레임을 돌려주고, 아니면 대기열에 넣습니다.
    /// 대기열이 가득 차면 `QueueFull`로 즉시 응답합니다.
    pub fn handle_command(&mut self, command: HandlerCommand) -> FeedResult<Vec<Outbound>> {
        let (action, quote_id, reply) = match command {
            HandlerCommand::Subscribe { quote_id, reply } => {
                (SubscriptionAction::Subscribe, quote_id, reply)
            }
            HandlerCommand::Unsubscribe { quote_id, reply } => {
                (SubscriptionAction::Unsubscribe, quote_id, reply)
            }
            HandlerCommand::Close { reply } => {
                // 실행 루프가 직접 처리
                let _ = reply.send(Ok(()));
                return Ok(Vec::new());
            }
        };

        if self.state == StreamState::Ready {
            let frame = self.subscription_frame(action, quote_id)?;
            return Ok(vec![Outbound {
                frame,
                reply: Some(reply),
            }]);
        }

        if self.pending.len() >= self.capacity {
            warn!(quote_id, capacity = self.capacity, "Pending command queue full");
            let _ = reply.send(Err(FeedError::QueueFull(self.capacity)));
            return Ok(Vec::new());
        }

        debug!(quote_id, ?action, state = %self.state, "Queued until ready");
        self.pending.push_back(PendingCommand {
            action,
            quote_id,
            reply,
        });
        Ok(Vec::new())
    }

    /// 대기 중인 모든 명령을 주어진 에러로 실패시킵니다.
    pub fn fail_pending(&mut self, make_err: impl Fn() -> FeedError) {
        for pending in self.pending.drain(..) {
            let _ = pending.reply.send(Err(make_err()));
        }
    }

    fn on_connect_response(&mut self) -> FeedResult<Vec<Outbound>> {
        if self.state != StreamState::AwaitingAuth || self.auth_sent {
            warn!(state = %self.state, "Unexpected connectResponse ignored");
            return Ok(Vec::new());
        }

        let request = AuthenticationRequest::new(&self.login_id, &self.token, &self.client_version);
        let frame = serde_json::to_string(&request)?;
        self.auth_sent = true;
        debug!(login_id = %self.login_id, "Authentication sent");
        Ok(vec![Outbound::frame(frame)])
    }

    fn on_authentication_response(
        &mut self,
        response: AuthenticationResponse,
    ) -> FeedResult<Vec<Outbound>> {
        if self.state != StreamState::AwaitingAuth {
            warn!(state = %self.state, "Unexpected authenticationResponse ignored");
            return Ok(Vec::new());
        }

        if response.has_error {
            let message = response
                .error_message
                .unwrap_or_else(|| "authentication rejected".to_string());
            warn!(error = %message, "Stream authentication failed");
            self.auth_error = Some(message);
            self.set_state(StreamState::AuthFailed);
            return Ok(Vec::new());
        }

        self.set_state(StreamState::Ready);
        info!(
            replay = self.subscriptions.len(),
            pending = self.pending.len(),
            "Stream ready"
        );

        let replayed = self.subscriptions.clone();
        let mut outbound = Vec::with_capacity(replayed.len() + self.pending.len());

        // 재연결이면 이전 구독을 먼저 복원
        for &quote_id in &replayed {
            let request = SubscriptionRequest {
                quote_id,
                price_grouping: self.grouping,
                action: SubscriptionAction::Subscribe,
            };
            outbound.push(Outbound::frame(serde_json::to_string(&request)?));
        }

        while let Some(pending) = self.pending.pop_front() {
            // 복원 프레임이 이미 같은 구독을 보냄. 응답은 그 프레임 전송 결과를 따름
            if pending.action == SubscriptionAction::Subscribe
                && self.subscriptions.contains(&pending.quote_id)
            {
                let covering = replayed
                    .iter()
                    .position(|id| *id == pending.quote_id)
                    .and_then(|i| outbound.get_mut(i))
                    .filter(|out| out.reply.is_none());
                match covering {
                    Some(out) => out.reply = Some(pending.reply),
                    None => {
                        let _ = pending.reply.send(Ok(()));
                    }
                }
                debug!(quote_id = pending.quote_id, "Pending subscribe already covered");
                continue;
            }

            match self.subscription_frame(pending.action, pending.quote_id) {
                Ok(frame) => outbound.push(Outbound {
                    frame,
                    reply: Some(pending.reply),
                }),
                Err(e) => {
                    let _ = pending.reply.send(Err(e));
                }
            }
        }

        Ok(outbound)
    }

    fn on_subscribe_response(&mut self, response: SubscribeResponse) {
        if response.has_error {
            warn!(
                error = response.error_message.as_deref().unwrap_or("unknown"),
                "Subscription rejected"
            );
            return;
        }

        let grouping = match response.price_grouping.as_deref() {
            Some(name) => match name.parse::<PriceGrouping>() {
                Ok(grouping) => grouping,
                Err(e) => {
                    warn!(error = %e, "subscribeResponse grouping unknown, records skipped");
                    return;
                }
            },
            None => self.grouping,
        };

        let ticks = decode_records(response.current.iter().map(String::as_str), grouping);
        self.deliver(ticks);
    }

    fn on_price(&mut self, data: &Value) {
        for grouping in PriceGrouping::ALL {
            let Some(records) = data.get(grouping.as_str()).and_then(Value::as_array) else {
                continue;
            };
            if records.is_empty() {
                continue;
            }

            let strings = records.iter().filter_map(|record| {
                let text = record.as_str();
                if text.is_none() {
                    warn!(%grouping, "Non-string price record skipped");
                }
                text
            });
            let ticks = decode_records(strings, grouping);
            self.deliver(ticks);
        }
    }

    fn deliver(&mut self, ticks: Vec<Tick>) {
        for tick in ticks {
            if self.tick_tx.send(tick).is_err() {
                self.dropped_ticks += 1;
                if self.dropped_ticks == 1 {
                    warn!("Tick queue has no consumer, dropping ticks");
                }
            }
        }
    }

    /// 구독 기록을 갱신하고 전송할 프레임을 만듭니다.
    fn subscription_frame(&mut self, action: SubscriptionAction, quote_id: u32) -> FeedResult<String> {
        match action {
            SubscriptionAction::Subscribe => {
                if !self.subscriptions.contains(&quote_id) {
                    self.subscriptions.push(quote_id);
                }
            }
            SubscriptionAction::Unsubscribe => self.subscriptions.retain(|id| *id != quote_id),
        }

        let request = SubscriptionRequest {
            quote_id,
            price_grouping: self.grouping,
            action,
        };
        Ok(serde_json::to_string(&request)?)
    }
}

/// `d` 본문을 역직렬화합니다. 본문이 없으면 기본값입니다.
fn body<T: DeserializeOwned + Default>(value: Value) -> FeedResult<T> {
    if value.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(value)
        .map_err(|e| FeedError::Protocol(format!("frame body: {}", e)))
}
