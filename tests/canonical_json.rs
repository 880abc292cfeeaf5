use loomrail::canon::{CanonError, canonical_json_bytes, canonical_json_string};
use loomrail::digest::sha256_hex;
use proptest::prelude::*;
use serde_json::{Value, json};

fn arb_json(depth: u32) -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| json!(n)),
        // Finite doubles only; non-finite is rejected by contract.
        any::<f64>()
            .prop_filter("finite", |f| f.is_finite())
            .prop_map(|f| json!(f)),
        "[a-zA-Z0-9 _\\-\u{00e9}\u{4e16}]{0,20}".prop_map(Value::String),
    ];
    leaf.prop_recursive(depth, 64, 8, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
            prop::collection::btree_map("[a-z0-9_]{1,8}", inner, 0..6)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

proptest! {
    #[test]
    fn encoding_is_deterministic(value in arb_json(3)) {
        let first = canonical_json_bytes(&value).unwrap();
        for _ in 0..10 {
            prop_assert_eq!(&canonical_json_bytes(&value).unwrap(), &first);
        }
    }

    #[test]
    fn hash_of_canonical_bytes_is_stable(value in arb_json(3)) {
        let bytes = canonical_json_bytes(&value).unwrap();
        let digest = sha256_hex(&bytes);
        for _ in 0..10 {
            prop_assert_eq!(sha256_hex(&canonical_json_bytes(&value).unwrap()), digest.clone());
        }
    }

    #[test]
    fn output_reparses_to_the_same_value(value in arb_json(3)) {
        let text = canonical_json_string(&value).unwrap();
        let reparsed: Value = serde_json::from_str(&text).unwrap();
        let again = canonical_json_string(&reparsed).unwrap();
        prop_assert_eq!(text, again);
    }
}

#[test]
fn key_order_is_independent_of_insertion_order() {
    let a = json!({"b": 1, "a": {"z": true, "m": [1, 2]}});
    let b: Value = serde_json::from_str(r#"{"a":{"m":[1,2],"z":true},"b":1}"#).unwrap();
    assert_eq!(
        canonical_json_bytes(&a).unwrap(),
        canonical_json_bytes(&b).unwrap()
    );
}

#[test]
fn non_finite_fails_closed() {
    #[derive(serde::Serialize)]
    struct S {
        v: f64,
    }
    assert_eq!(
        canonical_json_string(&S { v: f64::INFINITY }).unwrap_err(),
        CanonError::NonFiniteNumber
    );
}
