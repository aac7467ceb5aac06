//! 스트림 프로토콜 메시지.
//!
//! 수신 프레임은 `{"t": <종류>, "d": {...}}` 형태이고,
//! 송신 프레임은 `"action"` 필드로 종류를 구분합니다.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use td365_core::types::PriceGrouping;

/// 수신 프레임 봉투.
#[derive(Debug, Deserialize)]
pub struct InboundFrame {
    pub t: String,
    #[serde(default)]
    pub d: Value,
}

impl InboundFrame {
    pub fn kind(&self) -> FrameKind {
        FrameKind::from_tag(&self.t)
    }
}

/// 수신 프레임 종류.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Heartbeat,
    ConnectResponse,
    ReconnectResponse,
    AuthenticationResponse,
    SubscribeResponse,
    Price,
    Unknown,
}

impl FrameKind {
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "heartbeat" => Self::Heartbeat,
            "connectResponse" => Self::ConnectResponse,
            "reconnectResponse" => Self::ReconnectResponse,
            "authenticationResponse" => Self::AuthenticationResponse,
            "subscribeResponse" => Self::SubscribeResponse,
            "p" => Self::Price,
            _ => Self::Unknown,
        }
    }
}

/// 서버 하트비트 본문. 카운터는 해석하지 않고 그대로 돌려보냅니다.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Heartbeat {
    pub sent_by_server: Value,
    pub messages_received: Value,
    pub prices_received: Value,
    pub messages_sent: Value,
    pub prices_sent: Value,
}

/// 인증 응답 본문. 필드가 없으면 성공으로 봅니다.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AuthenticationResponse {
    pub has_error: bool,
    pub error_message: Option<String>,
}

/// 구독 응답 본문. `Current`에 현재 가격 레코드가 실려 옵니다.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SubscribeResponse {
    pub has_error: bool,
    pub error_message: Option<String>,
    pub current: Vec<String>,
    pub price_grouping: Option<String>,
}

/// 하트비트 응답.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct HeartbeatReply {
    pub sent_by_server: Value,
    pub messages_received: Value,
    pub prices_received: Value,
    pub messages_sent: Value,
    pub prices_sent: Value,
    pub visible: bool,
    #[serde(rename = "action")]
    pub action: &'static str,
}

impl From<Heartbeat> for HeartbeatReply {
    fn from(hb: Heartbeat) -> Self {
        Self {
            sent_by_server: hb.sent_by_server,
            messages_received: hb.messages_received,
            prices_received: hb.prices_received,
            messages_sent: hb.messages_sent,
            prices_sent: hb.prices_sent,
            visible: true,
            action: "heartbeat",
        }
    }
}

/// `connectResponse`에 대한 인증 요청.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationRequest<'a> {
    pub action: &'static str,
    pub login_id: &'a str,
    pub trading_account_type: &'static str,
    pub token: &'a str,
    pub reason: &'static str,
    pub client_version: &'a str,
}

impl<'a> AuthenticationRequest<'a> {
    pub fn new(login_id: &'a str, token: &'a str, client_version: &'a str) -> Self {
        Self {
            action: "authentication",
            login_id,
            trading_account_type: "SPREAD",
            token,
            reason: "Connect",
            client_version,
        }
    }
}

/// 구독/해지 동작.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionAction {
    Subscribe,
    Unsubscribe,
}

/// 구독/해지 요청.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRequest {
    pub quote_id: u32,
    pub price_grouping: PriceGrouping,
    pub action: SubscriptionAction,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_kind_tags() {
        assert_eq!(FrameKind::from_tag("heartbeat"), FrameKind::Heartbeat);
        assert_eq!(FrameKind::from_tag("p"), FrameKind::Price);
        assert_eq!(FrameKind::from_tag("reconnectResponse"), FrameKind::ReconnectResponse);
        assert_eq!(FrameKind::from_tag("P"), FrameKind::Unknown);
    }

    #[test]
    fn test_heartbeat_echo_shape() {
        let hb: Heartbeat = serde_json::from_value(json!({
            "SentByServer": "2025-03-14T09:30:00",
            "MessagesReceived": 12,
            "PricesReceived": 0,
            "MessagesSent": 40,
            "PricesSent": 310
        }))
        .unwrap();

        let reply = serde_json::to_value(HeartbeatReply::from(hb)).unwrap();
        assert_eq!(
            reply,
            json!({
                "SentByServer": "2025-03-14T09:30:00",
                "MessagesReceived": 12,
                "PricesReceived": 0,
                "MessagesSent": 40,
                "PricesSent": 310,
                "Visible": true,
                "action": "heartbeat"
            })
        );
    }

    #[test]
    fn test_authentication_request_shape() {
        let req = AuthenticationRequest::new("login-1", "tok", "1.0.0.6");
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({
                "action": "authentication",
                "loginId": "login-1",
                "tradingAccountType": "SPREAD",
                "token": "tok",
                "reason": "Connect",
                "clientVersion": "1.0.0.6"
            })
        );
    }

    #[test]
    fn test_subscription_request_shape() {
        let req = SubscriptionRequest {
            quote_id: 4021,
            price_grouping: PriceGrouping::Sampled,
            action: SubscriptionAction::Unsubscribe,
        };
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({"quoteId": 4021, "priceGrouping": "Sampled", "action": "unsubscribe"})
        );
    }

    #[test]
    fn test_authentication_response_defaults_to_success() {
        let resp: AuthenticationResponse = serde_json::from_value(json!({})).unwrap();
        assert!(!resp.has_error);

        let resp: AuthenticationResponse =
            serde_json::from_value(json!({"HasError": true, "ErrorMessage": "bad token"})).unwrap();
        assert!(resp.has_error);
        assert_eq!(resp.error_message.as_deref(), Some("bad token"));
    }
}
