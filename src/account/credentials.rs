//! Flex-typed credential bag
//!
//! Persistence layers hand us credential and operational values as strings,
//! integers, floats, or numeric strings depending on their age. The bag
//! normalizes on access so the rest of the core never branches on JSON types.
//! Time values accept RFC3339 or epoch seconds.

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CredentialBag(pub HashMap<String, Value>);

impl CredentialBag {
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    pub fn from_pairs<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Self(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn insert(&mut self, key: &str, value: Value) {
        self.0.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.0.get(key)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.0.get(key)? {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => {
                let t = s.trim();
                t.parse::<i64>()
                    .ok()
                    .or_else(|| t.parse::<f64>().ok().map(|f| f as i64))
            }
            _ => None,
        }
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        match self.0.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.0.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => n.as_i64().map(|v| v != 0),
            Value::String(s) => {
                let normalized = s.trim().to_ascii_lowercase();
                match normalized.as_str() {
                    "true" | "1" | "yes" | "on" | "enabled" => Some(true),
                    "false" | "0" | "no" | "off" | "disabled" | "" => Some(false),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    /// RFC3339 or epoch seconds, whichever the stored value carries.
    pub fn get_time(&self, key: &str) -> Option<DateTime<Utc>> {
        match self.0.get(key)? {
            Value::String(s) => {
                let t = s.trim();
                if let Ok(parsed) = DateTime::parse_from_rfc3339(t) {
                    return Some(parsed.with_timezone(&Utc));
                }
                let secs = t.parse::<f64>().ok()?;
                epoch_to_time(secs)
            }
            Value::Number(n) => epoch_to_time(n.as_f64()?),
            _ => None,
        }
    }

    /// String→string mapping stored as a JSON object (e.g. model mapping).
    pub fn get_string_map(&self, key: &str) -> Option<HashMap<String, String>> {
        let obj = self.0.get(key)?.as_object()?;
        let mut out = HashMap::with_capacity(obj.len());
        for (k, v) in obj {
            if let Some(s) = v.as_str() {
                out.insert(k.clone(), s.to_string());
            }
        }
        Some(out)
    }

    pub fn get_u16_list(&self, key: &str) -> Option<Vec<u16>> {
        let arr = self.0.get(key)?.as_array()?;
        Some(
            arr.iter()
                .filter_map(|v| match v {
                    Value::Number(n) => n.as_u64().map(|x| x as u16),
                    Value::String(s) => s.trim().parse::<u16>().ok(),
                    _ => None,
                })
                .collect(),
        )
    }
}

fn epoch_to_time(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    let whole = secs.trunc() as i64;
    let nanos = ((secs - secs.trunc()) * 1e9) as u32;
    Utc.timestamp_opt(whole, nanos).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bag() -> CredentialBag {
        CredentialBag::from_pairs([
            ("token", json!("sk-test")),
            ("expires_int", json!(1735689600)),
            ("expires_str", json!("1735689600")),
            ("expires_rfc", json!("2025-01-01T00:00:00Z")),
            ("expires_float", json!(1735689600.5)),
            ("priority", json!("42")),
            ("rate", json!("1.5")),
            ("flag_str", json!("on")),
            ("flag_num", json!(1)),
            ("mapping", json!({"claude-*": "claude-sonnet-4-5", "bad": 3})),
            ("codes", json!([500, "529"])),
        ])
    }

    #[test]
    fn test_numeric_string_normalization() {
        let b = bag();
        assert_eq!(b.get_i64("priority"), Some(42));
        assert_eq!(b.get_f64("rate"), Some(1.5));
        assert_eq!(b.get_str("priority"), Some("42".to_string()));
    }

    #[test]
    fn test_time_accepts_epoch_and_rfc3339() {
        let b = bag();
        let expected = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(b.get_time("expires_int"), Some(expected));
        assert_eq!(b.get_time("expires_str"), Some(expected));
        assert_eq!(b.get_time("expires_rfc"), Some(expected));
        assert!(b.get_time("expires_float").unwrap() >= expected);
        assert_eq!(b.get_time("token"), None);
    }

    #[test]
    fn test_boolish_values() {
        let b = bag();
        assert_eq!(b.get_bool("flag_str"), Some(true));
        assert_eq!(b.get_bool("flag_num"), Some(true));
        assert_eq!(b.get_bool("missing"), None);
    }

    #[test]
    fn test_string_map_skips_non_strings() {
        let b = bag();
        let map = b.get_string_map("mapping").unwrap();
        assert_eq!(map.get("claude-*").map(String::as_str), Some("claude-sonnet-4-5"));
        assert!(!map.contains_key("bad"));
    }

    #[test]
    fn test_u16_list() {
        let b = bag();
        assert_eq!(b.get_u16_list("codes"), Some(vec![500, 529]));
    }
}
