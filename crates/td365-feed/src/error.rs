//! 시세 클라이언트 에러 타입.

use thiserror::Error;
use tokio_tungstenite::tungstenite::{self, error::ProtocolError};

/// 세션/스트림 관련 에러.
#[derive(Debug, Error)]
pub enum FeedError {
    /// 인증 실패 (토큰 추출 실패, 쿠키 없음, 인증 응답 거부)
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// 일시적인 전송 에러 (소켓 종료/리셋/타임아웃). 다음 호출 또는 재연결로 복구
    #[error("Transient error: {0}")]
    Transient(String),

    /// 프로토콜 위반 (예상치 못한 상태 코드, 잘못된 리다이렉트, 필수 필드 누락)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// 시세 레코드 한 건의 디코딩 실패
    #[error("Decode error: {0}")]
    Decode(String),

    /// Ready 이전 구독 대기열이 가득 참
    #[error("Pending command queue full (capacity {0})")]
    QueueFull(usize),

    /// 클라이언트가 이미 종료됨
    #[error("Client shut down")]
    Shutdown,
}

/// 시세 클라이언트 결과 타입.
pub type FeedResult<T> = Result<T, FeedError>;

impl FeedError {
    /// 재시도 가능한 에러인지 확인.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FeedError::Transient(_))
    }

    /// 연결을 포기해야 하는 치명적 에러인지 확인.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FeedError::Auth(_) | FeedError::Protocol(_) | FeedError::Shutdown
        )
    }

    /// 인증 에러인지 확인.
    pub fn is_auth_error(&self) -> bool {
        matches!(self, FeedError::Auth(_))
    }
}

impl From<reqwest::Error> for FeedError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
            FeedError::Transient(err.to_string())
        } else {
            FeedError::Protocol(err.to_string())
        }
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(err: serde_json::Error) -> Self {
        FeedError::Protocol(format!("JSON: {}", err))
    }
}

impl From<std::io::Error> for FeedError {
    fn from(err: std::io::Error) -> Self {
        FeedError::Transient(err.to_string())
    }
}

impl From<tungstenite::Error> for FeedError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::ConnectionClosed
            | tungstenite::Error::AlreadyClosed
            | tungstenite::Error::Io(_)
            | tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                FeedError::Transient(err.to_string())
            }
            other => FeedError::Protocol(other.to_string()),
        }
    }
}
