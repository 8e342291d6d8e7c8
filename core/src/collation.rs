//! Total-order byte encoding for values.
//!
//! Sorting, cursor comparison and the range indexes of a backing store all
//! need one deterministic order across value types. Encoded bytes compare the
//! way the engine sorts: `Null < Bool < numbers < String`, numbers unified
//! across integer and float representations, missing values below everything.

use std::cmp::Ordering;

use trellis_proto::{EntityId, Value};

const TAG_NULL: u8 = 0x01;
const TAG_BOOL: u8 = 0x02;
const TAG_NUMBER: u8 = 0x03;
const TAG_STRING: u8 = 0x04;

/// Encode a value so that `encode(a) < encode(b)` iff `a` sorts before `b`.
pub fn encode_value(value: &Value) -> Vec<u8> {
    match value {
        Value::Null => vec![TAG_NULL],
        Value::Bool(b) => vec![TAG_BOOL, *b as u8],
        // i64 collates through f64; integer ties beyond 2^53 collapse
        Value::I64(i) => number_bytes(*i as f64),
        Value::F64(f) => number_bytes(*f),
        Value::String(s) => {
            let mut bytes = Vec::with_capacity(1 + s.len());
            bytes.push(TAG_STRING);
            bytes.extend_from_slice(s.as_bytes());
            bytes
        }
    }
}

fn number_bytes(f: f64) -> Vec<u8> {
    let bits = if f.is_nan() {
        u64::MAX // NaN sorts last among numbers
    } else {
        let bits = f.to_bits();
        if f >= 0.0 {
            bits ^ (1 << 63) // flip sign bit for positive numbers
        } else {
            !bits // flip all bits for negative numbers
        }
    };
    let mut bytes = Vec::with_capacity(9);
    bytes.push(TAG_NUMBER);
    bytes.extend_from_slice(&bits.to_be_bytes());
    bytes
}

/// Compare two values in collation order. Cross-type comparisons are
/// deterministic by construction.
pub fn compare(a: &Value, b: &Value) -> Ordering { encode_value(a).cmp(&encode_value(b)) }

/// Compare optional values; a missing value sorts as MIN.
pub fn compare_optional(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => compare(a, b),
    }
}

/// Equality under collation: `I64(20)` equals `F64(20.0)`.
pub fn values_equal(a: &Value, b: &Value) -> bool { compare(a, b) == Ordering::Equal }

/// Compare `(value, entity_id)` pairs, the order cursors restart from.
pub fn compare_keyed(a: (&Value, &EntityId), b: (&Value, &EntityId)) -> Ordering {
    compare(a.0, b.0).then_with(|| a.1.cmp(b.1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cross_type_order_is_fixed() {
        let null = Value::Null;
        let fal = Value::Bool(false);
        let tru = Value::Bool(true);
        let num = Value::I64(0);
        let s = Value::String(String::new());
        assert_eq!(compare(&null, &fal), Ordering::Less);
        assert_eq!(compare(&fal, &tru), Ordering::Less);
        assert_eq!(compare(&tru, &num), Ordering::Less);
        assert_eq!(compare(&num, &s), Ordering::Less);
    }

    #[test]
    fn numbers_unify_across_representations() {
        assert!(values_equal(&Value::I64(20), &Value::F64(20.0)));
        assert_eq!(compare(&Value::I64(-5), &Value::F64(-4.5)), Ordering::Less);
        assert_eq!(compare(&Value::F64(10.5), &Value::I64(11)), Ordering::Less);
    }

    #[test]
    fn negative_floats_sort_below_positive() {
        assert_eq!(compare(&Value::F64(-1.0), &Value::F64(1.0)), Ordering::Less);
        assert_eq!(compare(&Value::F64(-2.0), &Value::F64(-1.0)), Ordering::Less);
        assert_eq!(compare(&Value::F64(f64::NEG_INFINITY), &Value::I64(i64::MIN)), Ordering::Less);
    }

    #[test]
    fn strings_sort_bytewise() {
        assert_eq!(compare(&Value::from("a"), &Value::from("ab")), Ordering::Less);
        assert_eq!(compare(&Value::from("ab"), &Value::from("b")), Ordering::Less);
    }

    #[test]
    fn missing_sorts_as_min() {
        assert_eq!(compare_optional(None, Some(&Value::Null)), Ordering::Less);
        assert_eq!(compare_optional(None, None), Ordering::Equal);
    }
}
