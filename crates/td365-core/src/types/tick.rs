//! 실시간 시세 틱 타입.
//!
//! 서버가 보내는 가격 레코드 한 건을 디코딩한 결과가 [`Tick`]입니다.
//! 틱은 생성 이후 변경되지 않으며 애플리케이션 콜백에 정확히 한 번 전달됩니다.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 가격 그룹.
///
/// 서버가 가격 업데이트를 얼마나 촘촘하게 묶어서 보내는지를 나타냅니다.
/// 가격 프레임 안에서 레코드 묶음의 키로도 사용됩니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PriceGrouping {
    /// 샘플링된 가격
    Sampled,
    /// 지연 가격
    Delayed,
    /// 그룹 가격
    Grouped,
}

impl PriceGrouping {
    /// 가격 프레임에서 확인하는 모든 그룹 (순서 고정).
    pub const ALL: [PriceGrouping; 3] = [
        PriceGrouping::Sampled,
        PriceGrouping::Delayed,
        PriceGrouping::Grouped,
    ];

    /// 와이어 상의 이름.
    pub fn as_str(&self) -> &'static str {
        match self {
            PriceGrouping::Sampled => "Sampled",
            PriceGrouping::Delayed => "Delayed",
            PriceGrouping::Grouped => "Grouped",
        }
    }
}

impl Default for PriceGrouping {
    fn default() -> Self {
        Self::Sampled
    }
}

impl fmt::Display for PriceGrouping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PriceGrouping {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sampled" => Ok(Self::Sampled),
            "delayed" => Ok(Self::Delayed),
            "grouped" => Ok(Self::Grouped),
            _ => Err(format!("Unknown price grouping: {}", s)),
        }
    }
}

/// 종목 하나에 대한 매수/매도 호가 업데이트.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    /// 종목 시세 ID
    pub quote_id: u32,
    /// 매수호가
    pub bid: Decimal,
    /// 매도호가
    pub ask: Decimal,
    /// 전일대비
    pub daily_change: Decimal,
    /// 직전 틱 대비 상승 여부
    pub is_up: bool,
    /// 거래 가능 여부
    pub tradable: bool,
    /// 고가
    pub high: Option<Decimal>,
    /// 저가
    pub low: Option<Decimal>,
    /// 서버가 부여한 가격 해시
    pub hash: String,
    /// 콜 전용 종목 여부
    pub call_only: bool,
    /// 중간가
    pub mid: Option<Decimal>,
    /// 서버 타임스탬프 (원문 그대로)
    pub server_time: String,
    /// 이 틱이 속한 가격 그룹
    pub grouping: PriceGrouping,
    /// 로컬 수신 시각
    pub received_at: DateTime<Utc>,
}

impl Tick {
    /// 스프레드(매도호가 - 매수호가)를 반환합니다.
    pub fn spread(&self) -> Decimal {
        self.ask - self.bid
    }
}

impl fmt::Display for Tick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] quote={} bid={} ask={}",
            self.grouping, self.quote_id, self.bid, self.ask
        )
    }
}
