//! # Checksum Validator
//!
//! Content hash of a record payload, taken at enqueue and re-taken before
//! every delivery attempt.
//!
//! The hash is SHA-256 over a canonical JSON rendering: object keys sorted,
//! no insignificant whitespace. Two payloads that differ only in key order
//! hash the same; any change to a key or value changes the hash.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::types::{Payload, QueueRecord};

/// Renders `value` as canonical JSON.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();

            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Value's Display escapes strings exactly like serde_json does.
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        leaf => out.push_str(&leaf.to_string()),
    }
}

/// Canonical JSON of a payload map.
pub fn canonical_payload(payload: &Payload) -> String {
    canonical_json(&Value::Object(payload.clone()))
}

/// Hex-encoded SHA-256 of the canonical payload.
pub fn compute_checksum(payload: &Payload) -> String {
    let digest = Sha256::digest(canonical_payload(payload).as_bytes());
    hex::encode(digest)
}

/// Returns true if the record's stored checksum matches its payload.
pub fn verify(record: &QueueRecord) -> bool {
    compute_checksum(&record.payload) == record.checksum
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        match value {
            Value::Object(map) => map,
            _ => panic!("test payload must be an object"),
        }
    }

    #[test]
    fn test_key_order_does_not_matter() {
        let a: Payload = serde_json::from_str(r#"{"b":1,"a":{"y":2,"x":[3,{"q":1,"p":2}]}}"#).unwrap();
        let b: Payload = serde_json::from_str(r#"{"a":{"x":[3,{"p":2,"q":1}],"y":2},"b":1}"#).unwrap();
        assert_eq!(compute_checksum(&a), compute_checksum(&b));
    }

    #[test]
    fn test_canonical_form() {
        let p = payload(json!({"lon": -77.39, "lat": 25.03, "note": "a\"b"}));
        assert_eq!(
            canonical_payload(&p),
            r#"{"lat":25.03,"lon":-77.39,"note":"a\"b"}"#
        );
    }

    #[test]
    fn test_checksum_is_sha256_hex() {
        let sum = compute_checksum(&Payload::new());
        assert_eq!(sum.len(), 64);
        // sha256("{}")
        assert_eq!(
            sum,
            "44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a"
        );
    }

    #[test]
    fn test_round_trip_and_tamper() {
        let mut record = QueueRecord::new(
            "agent-7",
            "tablet-3",
            crate::types::RecordType::Household,
            payload(json!({"household_size": 4, "members": ["a", "b"]})),
            Some(1),
            None,
        );
        assert!(verify(&record));

        // changed value
        record.payload.insert("household_size".into(), json!(5));
        assert!(!verify(&record));

        // renamed key
        record.payload.remove("household_size");
        record.payload.insert("household_sizes".into(), json!(4));
        assert!(!verify(&record));
    }

    #[test]
    fn test_stable_across_text_round_trip() {
        let readings = [25.0 + 5884.0 / 1e6, 22.717054649999994, -89.999999999999, 0.1 + 0.2];
        for lat in readings {
            let p = payload(json!({"lat": lat, "lon": -77.39}));
            let text = serde_json::to_string(&p).unwrap();
            let parsed: Payload = serde_json::from_str(&text).unwrap();
            assert_eq!(compute_checksum(&parsed), compute_checksum(&p), "lat {lat}");
        }

        for i in 0..20_000u32 {
            let lat = -90.0 + f64::from(i) * (180.0 / 19_999.0) + 1e-9 * f64::from(i % 7);
            let p = payload(json!({ "lat": lat }));
            let parsed: Payload = serde_json::from_str(&serde_json::to_string(&p).unwrap()).unwrap();
            assert_eq!(parsed, p, "lat {lat}");
        }
    }

    #[test]
    fn test_type_sensitive() {
        let a = payload(json!({"n": 1}));
        let b = payload(json!({"n": "1"}));
        assert_ne!(compute_checksum(&a), compute_checksum(&b));
    }
}
