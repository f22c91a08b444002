use std::collections::BTreeMap;

use mqttgate_contracts::Params;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

pub const MAX_DECODED_ENTRIES: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("decoded object has {found} members, kept the first {limit}")]
pub struct TooManyEntries {
    pub limit: usize,
    pub found: usize,
}

/// Encodes parameters as a flat JSON object with sorted keys.
///
/// A duplicated key keeps its first value, the same one `Params::lookup`
/// returns.
pub fn encode(params: &Params) -> Result<String, CodecError> {
    let mut members: BTreeMap<&str, &str> = BTreeMap::new();
    for param in params {
        members
            .entry(param.key.as_str())
            .or_insert(param.value.as_str());
    }
    serde_json::to_string(&members).map_err(|e| CodecError::Encode(e.to_string()))
}

pub fn decode(text: &str) -> Result<Params, CodecError> {
    let (params, overflow) = decode_with_limit(text, MAX_DECODED_ENTRIES)?;
    if let Some(overflow) = overflow {
        warn!(
            limit = overflow.limit,
            found = overflow.found,
            "decoded object truncated"
        );
    }
    Ok(params)
}

/// Decodes a JSON object into parameters, keeping at most `limit` members in
/// key order. Non-string members are stored as their compact JSON text.
pub fn decode_with_limit(
    text: &str,
    limit: usize,
) -> Result<(Params, Option<TooManyEntries>), CodecError> {
    let value: Value = serde_json::from_str(text).map_err(|e| CodecError::Decode(e.to_string()))?;
    let members = match value {
        Value::Object(members) => members,
        other => {
            return Err(CodecError::Decode(format!(
                "expected a JSON object, got {}",
                kind_name(&other)
            )))
        }
    };

    let members: BTreeMap<String, Value> = members.into_iter().collect();
    let found = members.len();
    let params = members
        .into_iter()
        .take(limit)
        .map(|(key, value)| (key, value_text(value)))
        .collect();
    let overflow = (found > limit).then_some(TooManyEntries { limit, found });
    Ok((params, overflow))
}

fn value_text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn params(pairs: &[(&str, &str)]) -> Params {
        pairs.iter().copied().collect()
    }

    fn pair_set(params: &Params) -> BTreeSet<(String, String)> {
        params
            .iter()
            .map(|p| (p.key.clone(), p.value.clone()))
            .collect()
    }

    #[test]
    fn encode_sorts_keys() {
        let json = encode(&params(&[("zeta", "1"), ("alpha", "2"), ("mid", "")])).unwrap();
        assert_eq!(json, r#"{"alpha":"2","mid":"","zeta":"1"}"#);
    }

    #[test]
    fn encode_keeps_first_duplicate() {
        let json = encode(&params(&[("a", "1"), ("b", "2"), ("a", "3")])).unwrap();
        assert_eq!(json, r#"{"a":"1","b":"2"}"#);
    }

    #[test]
    fn encode_is_insertion_order_independent() {
        let a = encode(&params(&[("x", "1"), ("y", "2")])).unwrap();
        let b = encode(&params(&[("y", "2"), ("x", "1")])).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn encode_escapes_special_characters() {
        let json = encode(&params(&[("q", "say \"hi\"\n")])).unwrap();
        let back = decode(&json).unwrap();
        assert_eq!(back.lookup("q"), Some("say \"hi\"\n"));
    }

    #[test]
    fn decode_coerces_non_string_members() {
        let p = decode(r#"{"n":1.5,"b":true,"z":null,"o":{"k":[1,2]},"s":"x"}"#).unwrap();
        assert_eq!(p.lookup("n"), Some("1.5"));
        assert_eq!(p.lookup("b"), Some("true"));
        assert_eq!(p.lookup("z"), Some("null"));
        assert_eq!(p.lookup("o"), Some(r#"{"k":[1,2]}"#));
        assert_eq!(p.lookup("s"), Some("x"));
    }

    #[test]
    fn decode_rejects_non_objects() {
        assert!(matches!(decode("[1,2]"), Err(CodecError::Decode(_))));
        assert!(matches!(decode("\"text\""), Err(CodecError::Decode(_))));
        assert!(matches!(decode("{not json"), Err(CodecError::Decode(_))));
        assert!(matches!(decode(""), Err(CodecError::Decode(_))));
    }

    #[test]
    fn decode_caps_entries_without_failing() {
        let (p, overflow) = decode_with_limit(r#"{"c":"3","a":"1","b":"2"}"#, 2).unwrap();
        assert_eq!(p.len(), 2);
        assert_eq!(p.lookup("a"), Some("1"));
        assert_eq!(p.lookup("b"), Some("2"));
        assert_eq!(p.lookup("c"), None);
        assert_eq!(overflow, Some(TooManyEntries { limit: 2, found: 3 }));

        let (_, none) = decode_with_limit(r#"{"a":"1"}"#, 2).unwrap();
        assert_eq!(none, None);
    }

    #[test]
    fn decode_drops_empty_member_names() {
        let p = decode(r#"{"":"x","k":"v"}"#).unwrap();
        assert_eq!(p.len(), 1);
    }

    #[test]
    fn duplicates_collapse_across_round_trip() {
        let original = params(&[("a", "1"), ("b", "2"), ("a", "3")]);
        let back = decode(&encode(&original).unwrap()).unwrap();
        assert_eq!(pair_set(&back), pair_set(&params(&[("a", "1"), ("b", "2")])));
    }

    proptest! {
        #[test]
        fn round_trip_preserves_pairs(
            entries in proptest::collection::btree_map("[a-z][a-z0-9_-]{0,8}", "[ -~]{0,16}", 0..12)
        ) {
            let original: Params = entries.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
            let back = decode(&encode(&original).unwrap()).unwrap();
            prop_assert_eq!(pair_set(&back), pair_set(&original));
        }
    }
}
