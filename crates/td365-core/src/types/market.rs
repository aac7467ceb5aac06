//! 카탈로그 DTO.
//!
//! `UTSAPI.asmx` RPC 엔드포인트가 `{"d": [...]}` 봉투 안에 돌려주는
//! 마켓 그룹과 종목 정보의 와이어 형태입니다.

use serde::{Deserialize, Serialize};

/// 마켓 그룹 (슈퍼 그룹 포함).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct MarketGroup {
    #[serde(rename = "ID")]
    pub id: i64,
    pub name: String,
    pub is_super_group: bool,
    pub is_white_label_popular_market: bool,
    pub has_subscription: bool,
}

/// 거래 가능한 종목.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Market {
    #[serde(rename = "MarketID")]
    pub market_id: i64,
    /// 실시간 시세 구독에 사용하는 ID
    #[serde(rename = "QuoteID")]
    pub quote_id: u32,
    pub at_quote_at_market: bool,
    #[serde(rename = "ExchangeID")]
    pub exchange_id: i64,
    pub prc_gen_fractional_price: f64,
    pub prc_gen_decimal_places: i32,
    pub high: f64,
    pub low: f64,
    pub daily_change: f64,
    pub bid: f64,
    pub ask: f64,
    pub bet_per: f64,
    #[serde(rename = "IsGSLPercent")]
    pub is_gsl_percent: bool,
    #[serde(rename = "GSLDis")]
    pub gsl_dis: f64,
    pub min_close_order_dis_ticks: f64,
    pub min_open_order_dis_ticks: f64,
    pub display_bet_per: f64,
    pub is_in_portfolio: bool,
    pub tradable: bool,
    pub trade_on_web: bool,
    pub call_only: bool,
    pub market_name: String,
    pub trade_start_time: String,
    pub currency: String,
    pub allow_gtds_stops: bool,
    pub force_open: bool,
    pub margin: f64,
    pub margin_type: i32,
    #[serde(rename = "GSLCharge")]
    pub gsl_charge: f64,
    #[serde(rename = "IsGSLChargePercent")]
    pub is_gsl_charge_percent: bool,
    pub spread: f64,
    pub trade_rate_type: i32,
    pub open_trade_rate: f64,
    pub close_trade_rate: f64,
    pub min_open_trade_rate: f64,
    pub min_close_trade_rate: f64,
    pub price_decimal: i32,
    pub subscription: bool,
    #[serde(rename = "SuperGroupID")]
    pub super_group_id: i64,
}
