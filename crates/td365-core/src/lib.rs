//! # TD365 Core
//!
//! TD365 실시간 시세 클라이언트의 공통 타입, 설정, 로깅을 제공합니다.
//!
//! 이 크레이트는 워크스페이스 전반에서 사용되는 기본 요소를 담습니다:
//! - 시세 틱 및 가격 그룹 타입
//! - 카탈로그(마켓 그룹/종목) DTO
//! - 설정 관리
//! - 로깅 인프라

pub mod config;
pub mod logging;
pub mod types;

pub use config::*;
pub use logging::*;
pub use types::*;
