//! TD365 CLI 도구.
//!
//! 이 crate는 다음 기능을 제공합니다:
//! - 실시간 시세 스트리밍
//! - 마켓 카탈로그 조회

pub mod commands;
