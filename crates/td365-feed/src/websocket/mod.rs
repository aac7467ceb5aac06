//! 실시간 시세 스트림 프로토콜.

pub mod client;
pub mod handler;
pub mod messages;

pub use client::{StreamClient, StreamCredentials, Termination};
pub use handler::{FeedHandler, HandlerCommand, StreamState};
