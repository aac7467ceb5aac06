//! TD365 트레이딩 플랫폼 실시간 시세 클라이언트.
//!
//! 이 크레이트는 다음을 제공합니다:
//! - 쿠키/리다이렉트/gzip을 처리하는 HTTP 세션 클라이언트
//! - 가격 레코드 디코더
//! - 인증, 하트비트, 구독, 재연결을 처리하는 WebSocket 스트림 클라이언트
//! - 전용 I/O 스레드와 틱 전달 스레드를 가진 동기 파사드 ([`Platform`])
//! - 계정 인증 및 카탈로그 조회

pub mod auth;
pub mod error;
pub mod http;
pub mod parse;
pub mod platform;
pub mod websocket;

pub use auth::{authenticate, authenticate_demo, AccountDetail, AccountType, Authenticator};
pub use error::{FeedError, FeedResult};
pub use http::{CookieStore, SessionClient};
pub use parse::decode_tick;
pub use platform::Platform;
pub use websocket::{StreamClient, StreamCredentials, StreamState, Termination};
