//! 가격 레코드 디코더.
//!
//! 레코드는 쉼표로 구분된 문자열입니다:
//!
//! ```text
//! quoteId,bid,ask,dailyChange,direction,tradable,high,low,hash,callOnly,mid,timestamp[,...]
//! ```
//!
//! 앞의 12개 필드만 해석하고 나머지는 무시합니다.

use crate::error::{FeedError, FeedResult};
use chrono::Utc;
use rust_decimal::Decimal;
use std::str::FromStr;
use td365_core::types::{PriceGrouping, Tick};
use tracing::warn;

/// 레코드에 필요한 최소 필드 수.
pub const MIN_FIELDS: usize = 12;

/// 레코드 한 건을 틱으로 디코딩합니다.
pub fn decode_tick(record: &str, grouping: PriceGrouping) -> FeedResult<Tick> {
    let fields: Vec<&str> = record.split(',').map(str::trim).collect();

    if fields.len() < MIN_FIELDS {
        return Err(FeedError::Decode(format!(
            "expected at least {} fields, got {}: {:?}",
            MIN_FIELDS,
            fields.len(),
            record
        )));
    }

    let quote_id = fields[0]
        .parse::<u32>()
        .map_err(|_| FeedError::Decode(format!("quoteId not an integer: {:?}", fields[0])))?;

    Ok(Tick {
        quote_id,
        bid: decimal(fields[1], "bid")?,
        ask: decimal(fields[2], "ask")?,
        daily_change: decimal(fields[3], "dailyChange")?,
        is_up: flag(fields[4], "direction")?,
        tradable: flag(fields[5], "tradable")?,
        high: optional_decimal(fields[6], "high")?,
        low: optional_decimal(fields[7], "low")?,
        hash: fields[8].to_string(),
        call_only: flag(fields[9], "callOnly")?,
        mid: optional_decimal(fields[10], "mid")?,
        server_time: fields[11].to_string(),
        grouping,
        received_at: Utc::now(),
    })
}

/// 여러 레코드를 디코딩합니다. 실패한 레코드는 로그를 남기고 건너뜁니다.
pub fn decode_records<'a, I>(records: I, grouping: PriceGrouping) -> Vec<Tick>
where
    I: IntoIterator<Item = &'a str>,
{
    records
        .into_iter()
        .filter_map(|record| match decode_tick(record, grouping) {
            Ok(tick) => Some(tick),
            Err(e) => {
                warn!(%grouping, error = %e, "Price record skipped");
                None
            }
        })
        .collect()
}

fn decimal(value: &str, field: &str) -> FeedResult<Decimal> {
    Decimal::from_str(value)
        .or_else(|_| Decimal::from_scientific(value))
        .map_err(|_| FeedError::Decode(format!("{} not numeric: {:?}", field, value)))
}

fn optional_decimal(value: &str, field: &str) -> FeedResult<Option<Decimal>> {
    if value.is_empty() {
        Ok(None)
    } else {
        decimal(value, field).map(Some)
    }
}

fn flag(value: &str, field: &str) -> FeedResult<bool> {
    match value {
        "1" => Ok(true),
        "0" => Ok(false),
        v if v.eq_ignore_ascii_case("true") => Ok(true),
        v if v.eq_ignore_ascii_case("false") => Ok(false),
        _ => Err(FeedError::Decode(format!("{} not a flag: {:?}", field, value))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const RECORD: &str = "4021,18250.5,18251.7,-35.2,1,1,18310.0,18190.4,a1b2c3,0,18251.1,2025-03-14T09:30:01.123";

    #[test]
    fn test_decode_exact_values() {
        let tick = decode_tick(RECORD, PriceGrouping::Sampled).unwrap();

        assert_eq!(tick.quote_id, 4021);
        assert_eq!(tick.bid, dec!(18250.5));
        assert_eq!(tick.ask, dec!(18251.7));
        assert_eq!(tick.daily_change, dec!(-35.2));
        assert!(tick.is_up);
        assert!(tick.tradable);
        assert_eq!(tick.high, Some(dec!(18310.0)));
        assert_eq!(tick.low, Some(dec!(18190.4)));
        assert_eq!(tick.hash, "a1b2c3");
        assert!(!tick.call_only);
        assert_eq!(tick.mid, Some(dec!(18251.1)));
        assert_eq!(tick.server_time, "2025-03-14T09:30:01.123");
        assert_eq!(tick.grouping, PriceGrouping::Sampled);
    }

    #[test]
    fn test_empty_optional_fields_and_extras() {
        let tick = decode_tick(
            "7,1.1,1.2,0,false,true,,,h,TRUE,,t,extra,fields",
            PriceGrouping::Grouped,
        )
        .unwrap();

        assert!(!tick.is_up);
        assert!(tick.call_only);
        assert_eq!(tick.high, None);
        assert_eq!(tick.low, None);
        assert_eq!(tick.mid, None);
        assert_eq!(tick.grouping, PriceGrouping::Grouped);
    }

    #[test]
    fn test_field_count_mismatch() {
        let err = decode_tick("4021,1.0,1.1", PriceGrouping::Sampled).unwrap_err();
        assert!(matches!(err, FeedError::Decode(_)));
    }

    #[test]
    fn test_non_numeric_price() {
        let record = RECORD.replacen("18250.5", "abc", 1);
        assert!(matches!(
            decode_tick(&record, PriceGrouping::Sampled),
            Err(FeedError::Decode(_))
        ));
    }

    #[test]
    fn test_bad_flag() {
        let record = "1,1,1,0,up,1,,,h,0,,t";
        assert!(matches!(
            decode_tick(record, PriceGrouping::Delayed),
            Err(FeedError::Decode(_))
        ));
    }

    #[test]
    fn test_bad_record_does_not_affect_siblings() {
        let good_two = RECORD.replacen("4021", "4022", 1);
        let records = [RECORD, "garbage", good_two.as_str()];

        let ticks = decode_records(records.iter().copied(), PriceGrouping::Delayed);

        assert_eq!(ticks.len(), 2);
        assert_eq!(ticks[0].quote_id, 4021);
        assert_eq!(ticks[1].quote_id, 4022);
    }
}
