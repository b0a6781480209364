//! Order scores for the ordered indexes.

use chrono::{DateTime, Utc};
use serde_json::Value as Json;

/// Score of null/absent values; sorts before everything else.
pub const MIN_SCORE: f64 = f64::MIN;

/// Bytes of a string that take part in its score. 6 bytes stay exact in an f64 mantissa.
const STRING_SCORE_BYTES: usize = 6;

/// 100ns ticks since the Unix epoch.
pub fn timestamp_score(ts: &DateTime<Utc>) -> f64 {
    let ticks = ts.timestamp() as i128 * 10_000_000 + (ts.timestamp_subsec_nanos() / 100) as i128;
    ticks as f64
}

/// Big-endian base-256 over the leading bytes, zero padded, so shorter prefixes sort first.
pub fn string_score(s: &str) -> f64 {
    let bytes = s.as_bytes();
    let mut acc = 0f64;
    for i in 0..STRING_SCORE_BYTES {
        acc = acc * 256.0 + bytes.get(i).copied().unwrap_or(0) as f64;
    }
    acc
}

pub fn score(v: Option<&Json>) -> f64 {
    match v {
        None | Some(Json::Null) => MIN_SCORE,
        Some(Json::Bool(b)) => if *b { 1.0 } else { 0.0 },
        Some(Json::Number(n)) => n.as_f64().unwrap_or(MIN_SCORE),
        Some(Json::String(s)) => match DateTime::parse_from_rfc3339(s) {
            Ok(ts) => timestamp_score(&ts.with_timezone(&Utc)),
            Err(_) => string_score(s),
        },
        Some(_) => MIN_SCORE,
    }
}

/// Full-precision sort key for values whose scores can tie. Strings past the scored bytes
/// and timestamps closer than an f64 tick apart still compare correctly on it.
pub fn tie_key(v: Option<&Json>) -> String {
    match v {
        Some(Json::String(s)) => match DateTime::parse_from_rfc3339(s) {
            Ok(ts) => ts.with_timezone(&Utc).format("%Y-%m-%dT%H:%M:%S%.9fZ").to_string(),
            Err(_) => s.clone(),
        },
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scores_follow_value_order() {
        assert_eq!(score(None), MIN_SCORE);
        assert_eq!(score(Some(&json!(null))), MIN_SCORE);
        assert_eq!(score(Some(&json!(true))), 1.0);
        assert_eq!(score(Some(&json!(false))), 0.0);
        assert_eq!(score(Some(&json!(-2.5))), -2.5);
        assert!(string_score("a") < string_score("ab"));
        assert!(string_score("ab") < string_score("b"));
        assert!(string_score("") < string_score("a"));
        let early = score(Some(&json!("2024-01-01T00:00:00Z")));
        let late = score(Some(&json!("2024-01-01T00:00:01Z")));
        assert_eq!(late - early, 10_000_000.0);
    }

    #[test]
    fn tie_keys_order_what_scores_cannot() {
        assert_eq!(string_score("widget-a"), string_score("widget-b"));
        assert!(tie_key(Some(&json!("widget-a"))) < tie_key(Some(&json!("widget-b"))));
        let a = tie_key(Some(&json!("2024-01-01T00:00:05Z")));
        let b = tie_key(Some(&json!("2024-01-01T00:00:05.000000001Z")));
        assert!(a < b, "{} {}", a, b);
        assert_eq!(tie_key(Some(&json!(3))), "");
        assert_eq!(tie_key(None), "");
    }
}
