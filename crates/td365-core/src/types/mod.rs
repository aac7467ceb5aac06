//! 클라이언트 전반에서 사용되는 공통 타입.

mod market;
mod tick;

pub use market::*;
pub use tick::*;
