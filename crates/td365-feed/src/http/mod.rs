//! 쿠키 기반 HTTP 세션.

pub mod client;
pub mod cookie;

pub use client::{ConnectionState, HttpResponse, SessionClient};
pub use cookie::{Cookie, CookieStore};
