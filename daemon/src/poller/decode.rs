use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde_json::Value;

/// IBC success acknowledgement payload
pub const IBC_ACK_SUCCESS: &str = r#"{"result":"AQ=="}"#;

/// Strip one layer of surrounding double-quotes. CCTP event attributes
/// arrive quoted on some node versions.
pub fn strip_quotes(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

/// Decode a `packet_data` attribute. The payload arrives as raw JSON, as a
/// JSON object with a single `value` string holding JSON, or as
/// base64-encoded JSON; the first decoder that parses wins.
pub fn decode_packet_data(raw: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(raw) {
        if let Some(inner) = value.get("value").and_then(Value::as_str) {
            if let Ok(nested) = serde_json::from_str::<Value>(inner) {
                return Some(nested);
            }
        }
        return Some(value);
    }

    let bytes = BASE64.decode(raw).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// True when `packet_ack` carries the IBC success acknowledgement
pub fn is_success_ack(packet_ack: &str) -> bool {
    if strip_quotes(packet_ack) == IBC_ACK_SUCCESS {
        return true;
    }
    // tolerate re-ordered or re-spaced JSON
    matches!(
        serde_json::from_str::<Value>(packet_ack),
        Ok(value) if value.get("result").and_then(Value::as_str) == Some("AQ==")
    )
}

/// Numeric amount comparison after stripping an optional `uusdc` suffix
/// from either side
pub fn amount_matches_uusdc(found: &str, expected: &str) -> bool {
    let found = strip_quotes(found).trim_end_matches("uusdc");
    let expected = strip_quotes(expected).trim_end_matches("uusdc");
    match (found.parse::<u128>(), expected.parse::<u128>()) {
        (Ok(a), Ok(b)) => a == b,
        _ => found == expected,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_strip_quotes() {
        assert_eq!(strip_quotes("\"100000\""), "100000");
        assert_eq!(strip_quotes("100000"), "100000");
        assert_eq!(strip_quotes("\"unbalanced"), "\"unbalanced");
    }

    #[test]
    fn test_decode_raw_json() {
        let decoded = decode_packet_data(r#"{"amount":"100000","denom":"uusdc"}"#).expect("raw");
        assert_eq!(decoded["amount"], "100000");
    }

    #[test]
    fn test_decode_value_wrapped_json() {
        let decoded = decode_packet_data(
            r#"{"value":"{\"amount\":\"100000\",\"denom\":\"uusdc\"}"}"#,
        )
        .expect("wrapped");
        assert_eq!(decoded["denom"], "uusdc");
    }

    #[test]
    fn test_decode_base64_json() {
        let raw = r#"{"amount":"100000","receiver":"tnam1q"}"#;
        let encoded = BASE64.encode(raw);
        let decoded = decode_packet_data(&encoded).expect("base64");
        assert_eq!(decoded["receiver"], "tnam1q");
    }

    #[test]
    fn test_decode_garbage_is_none() {
        assert!(decode_packet_data("definitely not json or base64!!!").is_none());
    }

    #[test]
    fn test_success_ack() {
        assert!(is_success_ack(r#"{"result":"AQ=="}"#));
        assert!(is_success_ack(r#"{"result": "AQ=="}"#));
        assert!(!is_success_ack(r#"{"error":"oops"}"#));
        assert!(!is_success_ack("AQ=="));
    }

    #[test]
    fn test_amount_matching() {
        assert!(amount_matches_uusdc("100000uusdc", "100000uusdc"));
        assert!(amount_matches_uusdc("100000", "100000uusdc"));
        assert!(amount_matches_uusdc("0100000", "100000"));
        assert!(!amount_matches_uusdc("99999uusdc", "100000uusdc"));
    }

    #[test]
    fn test_value_wrapper_without_json_inner_falls_back() {
        // a `value` field that is not nested JSON keeps the outer object
        let decoded = decode_packet_data(r#"{"value":"plain-string"}"#).expect("outer");
        assert_eq!(decoded, json!({"value": "plain-string"}));
    }
}
