//! RFC 8785 (JCS) canonical JSON serialization.
//!
//! Every durable artifact in the engine (execution snapshots, pinned
//! workflows, token payloads, event lines) is hashed or signed over its
//! canonical byte form, so serialization must be byte-deterministic:
//!
//! - Object keys sorted by UTF-16 code-unit order
//! - Numbers in ECMAScript `Number::toString` form, with `-0` normalized
//!   to `0`
//! - `NaN` and infinities rejected with [`CanonError::NonFiniteNumber`]
//! - Values JSON cannot express rejected with [`CanonError::UnsupportedValue`]
//! - UTF-8 output with no extraneous whitespace
//!
//! The implementation is a custom [`serde::Serializer`] rather than a
//! `serde_json::Value` walk: `serde_json` silently folds non-finite floats
//! to `null`, which would defeat the rejection contract.
//!
//! # Examples
//!
//! ```rust
//! use loomrail::canon::canonical_json_string;
//! use serde_json::json;
//!
//! let v = json!({"b": 2, "a": [1.0, -0.0], "s": "x"});
//! assert_eq!(
//!     canonical_json_string(&v).unwrap(),
//!     r#"{"a":[1,0],"b":2,"s":"x"}"#
//! );
//! ```

use miette::Diagnostic;
use serde::Serialize;
use serde::ser::{self, Serializer};
use std::cmp::Ordering;
use std::fmt::Write as _;
use thiserror::Error;

/// Errors from canonical serialization.
#[derive(Debug, Clone, Error, Diagnostic, PartialEq, Eq)]
pub enum CanonError {
    /// `NaN`, `+∞`, or `-∞` cannot appear in canonical JSON.
    #[error("non-finite number cannot be canonicalized")]
    #[diagnostic(
        code(loomrail::canon::non_finite_number),
        help("Replace NaN/Infinity with null or a finite sentinel before hashing.")
    )]
    NonFiniteNumber,

    /// The value has no JSON representation (non-string map key, custom
    /// serializer failure, etc.).
    #[error("value cannot be canonicalized: {reason}")]
    #[diagnostic(code(loomrail::canon::unsupported_value))]
    UnsupportedValue { reason: String },
}

impl ser::Error for CanonError {
    fn custom<T: std::fmt::Display>(msg: T) -> Self {
        CanonError::UnsupportedValue {
            reason: msg.to_string(),
        }
    }
}

/// Serializes a value to canonical JSON text.
pub fn canonical_json_string<T: Serialize + ?Sized>(value: &T) -> Result<String, CanonError> {
    let mut out = String::with_capacity(128);
    value.serialize(CanonSerializer { out: &mut out })?;
    Ok(out)
}

/// Serializes a value to canonical JSON bytes (UTF-8).
pub fn canonical_json_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CanonError> {
    canonical_json_string(value).map(String::into_bytes)
}

/// Compares two strings by UTF-16 code units, the JCS key order.
///
/// UTF-8 byte order and UTF-16 code-unit order agree inside the BMP but
/// diverge for supplementary-plane characters, whose surrogates sort below
/// `U+E000..U+FFFF`.
#[must_use]
pub fn utf16_cmp(a: &str, b: &str) -> Ordering {
    a.encode_utf16().cmp(b.encode_utf16())
}

fn escape_into(out: &mut String, s: &str) {
    out.push('"');
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{0008}' => out.push_str("\\b"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\u{000c}' => out.push_str("\\f"),
            '\r' => out.push_str("\\r"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

/// ECMAScript `Number::toString` for a finite, non-zero double.
///
/// Rust's `{:e}` formatting already yields the shortest round-trip digit
/// string; this applies the ECMAScript fixed/scientific thresholds
/// (fixed for 10^-6 ..= 10^20, scientific outside) on top of it.
fn format_es_number(out: &mut String, f: f64) {
    debug_assert!(f.is_finite() && f != 0.0);
    if f < 0.0 {
        out.push('-');
    }
    let sci = format!("{:e}", f.abs());
    let (mantissa, exp_str) = sci.split_once('e').expect("LowerExp output contains 'e'");
    let exp: i32 = exp_str.parse().expect("LowerExp exponent is an integer");
    let digits: String = mantissa.chars().filter(|c| *c != '.').collect();
    let k = digits.len() as i32;
    let n = exp + 1;

    if k <= n && n <= 21 {
        out.push_str(&digits);
        for _ in 0..(n - k) {
            out.push('0');
        }
    } else if 0 < n && n <= 21 {
        out.push_str(&digits[..n as usize]);
        out.push('.');
        out.push_str(&digits[n as usize..]);
    } else if -6 < n && n <= 0 {
        out.push_str("0.");
        for _ in 0..(-n) {
            out.push('0');
        }
        out.push_str(&digits);
    } else {
        out.push_str(&digits[..1]);
        if k > 1 {
            out.push('.');
            out.push_str(&digits[1..]);
        }
        let e = n - 1;
        let _ = write!(out, "e{}{}", if e >= 0 { '+' } else { '-' }, e.abs());
    }
}

struct CanonSerializer<'a> {
    out: &'a mut String,
}

impl<'a> Serializer for CanonSerializer<'a> {
    type Ok = ();
    type Error = CanonError;
    type SerializeSeq = SeqSerializer<'a>;
    type SerializeTuple = SeqSerializer<'a>;
    type SerializeTupleStruct = SeqSerializer<'a>;
    type SerializeTupleVariant = SeqSerializer<'a>;
    type SerializeMap = MapSerializer<'a>;
    type SerializeStruct = MapSerializer<'a>;
    type SerializeStructVariant = MapSerializer<'a>;

    fn serialize_bool(self, v: bool) -> Result<(), CanonError> {
        self.out.push_str(if v { "true" } else { "false" });
        Ok(())
    }

    fn serialize_i8(self, v: i8) -> Result<(), CanonError> {
        self.serialize_i64(i64::from(v))
    }

    fn serialize_i16(self, v: i16) -> Result<(), CanonError> {
        self.serialize_i64(i64::from(v))
    }

    fn serialize_i32(self, v: i32) -> Result<(), CanonError> {
        self.serialize_i64(i64::from(v))
    }

    fn serialize_i64(self, v: i64) -> Result<(), CanonError> {
        let _ = write!(self.out, "{v}");
        Ok(())
    }

    fn serialize_u8(self, v: u8) -> Result<(), CanonError> {
        self.serialize_u64(u64::from(v))
    }

    fn serialize_u16(self, v: u16) -> Result<(), CanonError> {
        self.serialize_u64(u64::from(v))
    }

    fn serialize_u32(self, v: u32) -> Result<(), CanonError> {
        self.serialize_u64(u64::from(v))
    }

    fn serialize_u64(self, v: u64) -> Result<(), CanonError> {
        let _ = write!(self.out, "{v}");
        Ok(())
    }

    fn serialize_f32(self, v: f32) -> Result<(), CanonError> {
        self.serialize_f64(f64::from(v))
    }

    fn serialize_f64(self, v: f64) -> Result<(), CanonError> {
        if !v.is_finite() {
            return Err(CanonError::NonFiniteNumber);
        }
        if v == 0.0 {
            // Covers -0.0: JCS normalizes both zeros to "0".
            self.out.push('0');
        } else {
            format_es_number(self.out, v);
        }
        Ok(())
    }

    fn serialize_char(self, v: char) -> Result<(), CanonError> {
        let mut buf = [0u8; 4];
        escape_into(self.out, v.encode_utf8(&mut buf));
        Ok(())
    }

    fn serialize_str(self, v: &str) -> Result<(), CanonError> {
        escape_into(self.out, v);
        Ok(())
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<(), CanonError> {
        use serde::ser::SerializeSeq;
        let mut seq = self.serialize_seq(Some(v.len()))?;
        for b in v {
            seq.serialize_element(b)?;
        }
        seq.end()
    }

    fn serialize_none(self) -> Result<(), CanonError> {
        self.out.push_str("null");
        Ok(())
    }

    fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> Result<(), CanonError> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<(), CanonError> {
        self.out.push_str("null");
        Ok(())
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<(), CanonError> {
        self.serialize_unit()
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
    ) -> Result<(), CanonError> {
        self.serialize_str(variant)
    }

    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<(), CanonError> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        value: &T,
    ) -> Result<(), CanonError> {
        let out = self.out;
        out.push('{');
        escape_into(out, variant);
        out.push(':');
        value.serialize(CanonSerializer { out: &mut *out })?;
        out.push('}');
        Ok(())
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<SeqSerializer<'a>, CanonError> {
        self.out.push('[');
        Ok(SeqSerializer {
            out: self.out,
            first: true,
        })
    }

    fn serialize_tuple(self, len: usize) -> Result<SeqSerializer<'a>, CanonError> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        len: usize,
    ) -> Result<SeqSerializer<'a>, CanonError> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        len: usize,
    ) -> Result<SeqSerializer<'a>, CanonError> {
        self.out.push('{');
        escape_into(self.out, variant);
        self.out.push(':');
        self.serialize_seq(Some(len))
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<MapSerializer<'a>, CanonError> {
        Ok(MapSerializer {
            out: self.out,
            entries: Vec::new(),
            pending_key: None,
            close_variant: false,
        })
    }

    fn serialize_struct(
        self,
        _name: &'static str,
        len: usize,
    ) -> Result<MapSerializer<'a>, CanonError> {
        self.serialize_map(Some(len))
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        _len: usize,
    ) -> Result<MapSerializer<'a>, CanonError> {
        self.out.push('{');
        escape_into(self.out, variant);
        self.out.push(':');
        Ok(MapSerializer {
            out: self.out,
            entries: Vec::new(),
            pending_key: None,
            close_variant: true,
        })
    }
}

struct SeqSerializer<'a> {
    out: &'a mut String,
    first: bool,
}

impl SeqSerializer<'_> {
    fn element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), CanonError> {
        if !self.first {
            self.out.push(',');
        }
        self.first = false;
        value.serialize(CanonSerializer { out: &mut *self.out })
    }
}

impl ser::SerializeSeq for SeqSerializer<'_> {
    type Ok = ();
    type Error = CanonError;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), CanonError> {
        self.element(value)
    }

    fn end(self) -> Result<(), CanonError> {
        self.out.push(']');
        Ok(())
    }
}

impl ser::SerializeTuple for SeqSerializer<'_> {
    type Ok = ();
    type Error = CanonError;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), CanonError> {
        self.element(value)
    }

    fn end(self) -> Result<(), CanonError> {
        self.out.push(']');
        Ok(())
    }
}

impl ser::SerializeTupleStruct for SeqSerializer<'_> {
    type Ok = ();
    type Error = CanonError;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), CanonError> {
        self.element(value)
    }

    fn end(self) -> Result<(), CanonError> {
        self.out.push(']');
        Ok(())
    }
}

impl ser::SerializeTupleVariant for SeqSerializer<'_> {
    type Ok = ();
    type Error = CanonError;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), CanonError> {
        self.element(value)
    }

    fn end(self) -> Result<(), CanonError> {
        self.out.push_str("]}");
        Ok(())
    }
}

/// Buffers map entries so keys can be emitted in UTF-16 code-unit order.
struct MapSerializer<'a> {
    out: &'a mut String,
    entries: Vec<(String, String)>,
    pending_key: Option<String>,
    close_variant: bool,
}

impl MapSerializer<'_> {
    fn finish(self) -> Result<(), CanonError> {
        let mut entries = self.entries;
        entries.sort_by(|(a, _), (b, _)| utf16_cmp(a, b));
        self.out.push('{');
        for (i, (key, value)) in entries.iter().enumerate() {
            if i > 0 {
                self.out.push(',');
            }
            escape_into(self.out, key);
            self.out.push(':');
            self.out.push_str(value);
        }
        self.out.push('}');
        if self.close_variant {
            self.out.push('}');
        }
        Ok(())
    }
}

impl ser::SerializeMap for MapSerializer<'_> {
    type Ok = ();
    type Error = CanonError;

    fn serialize_key<T: Serialize + ?Sized>(&mut self, key: &T) -> Result<(), CanonError> {
        self.pending_key = Some(key.serialize(MapKeySerializer)?);
        Ok(())
    }

    fn serialize_value<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), CanonError> {
        let key = self
            .pending_key
            .take()
            .ok_or_else(|| CanonError::UnsupportedValue {
                reason: "map value serialized before its key".to_string(),
            })?;
        let mut rendered = String::new();
        value.serialize(CanonSerializer { out: &mut rendered })?;
        self.entries.push((key, rendered));
        Ok(())
    }

    fn end(self) -> Result<(), CanonError> {
        self.finish()
    }
}

impl ser::SerializeStruct for MapSerializer<'_> {
    type Ok = ();
    type Error = CanonError;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), CanonError> {
        let mut rendered = String::new();
        value.serialize(CanonSerializer { out: &mut rendered })?;
        self.entries.push((key.to_string(), rendered));
        Ok(())
    }

    fn end(self) -> Result<(), CanonError> {
        self.finish()
    }
}

impl ser::SerializeStructVariant for MapSerializer<'_> {
    type Ok = ();
    type Error = CanonError;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), CanonError> {
        let mut rendered = String::new();
        value.serialize(CanonSerializer { out: &mut rendered })?;
        self.entries.push((key.to_string(), rendered));
        Ok(())
    }

    fn end(self) -> Result<(), CanonError> {
        self.finish()
    }
}

/// Map keys must render to strings; integers are stringified like
/// `serde_json` does, anything else is unsupported.
struct MapKeySerializer;

macro_rules! key_must_be_string {
    ($($method:ident: $ty:ty,)*) => {
        $(
            fn $method(self, _v: $ty) -> Result<String, CanonError> {
                Err(CanonError::UnsupportedValue {
                    reason: "map key must be a string".to_string(),
                })
            }
        )*
    };
}

impl Serializer for MapKeySerializer {
    type Ok = String;
    type Error = CanonError;
    type SerializeSeq = ser::Impossible<String, CanonError>;
    type SerializeTuple = ser::Impossible<String, CanonError>;
    type SerializeTupleStruct = ser::Impossible<String, CanonError>;
    type SerializeTupleVariant = ser::Impossible<String, CanonError>;
    type SerializeMap = ser::Impossible<String, CanonError>;
    type SerializeStruct = ser::Impossible<String, CanonError>;
    type SerializeStructVariant = ser::Impossible<String, CanonError>;

    fn serialize_str(self, v: &str) -> Result<String, CanonError> {
        Ok(v.to_string())
    }

    fn serialize_char(self, v: char) -> Result<String, CanonError> {
        Ok(v.to_string())
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
    ) -> Result<String, CanonError> {
        Ok(variant.to_string())
    }

    fn serialize_i8(self, v: i8) -> Result<String, CanonError> {
        Ok(v.to_string())
    }

    fn serialize_i16(self, v: i16) -> Result<String, CanonError> {
        Ok(v.to_string())
    }

    fn serialize_i32(self, v: i32) -> Result<String, CanonError> {
        Ok(v.to_string())
    }

    fn serialize_i64(self, v: i64) -> Result<String, CanonError> {
        Ok(v.to_string())
    }

    fn serialize_u8(self, v: u8) -> Result<String, CanonError> {
        Ok(v.to_string())
    }

    fn serialize_u16(self, v: u16) -> Result<String, CanonError> {
        Ok(v.to_string())
    }

    fn serialize_u32(self, v: u32) -> Result<String, CanonError> {
        Ok(v.to_string())
    }

    fn serialize_u64(self, v: u64) -> Result<String, CanonError> {
        Ok(v.to_string())
    }

    key_must_be_string! {
        serialize_bool: bool,
        serialize_f32: f32,
        serialize_f64: f64,
        serialize_bytes: &[u8],
    }

    fn serialize_none(self) -> Result<String, CanonError> {
        Err(CanonError::UnsupportedValue {
            reason: "map key must be a string".to_string(),
        })
    }

    fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> Result<String, CanonError> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<String, CanonError> {
        Err(CanonError::UnsupportedValue {
            reason: "map key must be a string".to_string(),
        })
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<String, CanonError> {
        Err(CanonError::UnsupportedValue {
            reason: "map key must be a string".to_string(),
        })
    }

    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<String, CanonError> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _value: &T,
    ) -> Result<String, CanonError> {
        Err(CanonError::UnsupportedValue {
            reason: "map key must be a string".to_string(),
        })
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Self::SerializeSeq, CanonError> {
        Err(CanonError::UnsupportedValue {
            reason: "map key must be a string".to_string(),
        })
    }

    fn serialize_tuple(self, _len: usize) -> Result<Self::SerializeTuple, CanonError> {
        Err(CanonError::UnsupportedValue {
            reason: "map key must be a string".to_string(),
        })
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleStruct, CanonError> {
        Err(CanonError::UnsupportedValue {
            reason: "map key must be a string".to_string(),
        })
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleVariant, CanonError> {
        Err(CanonError::UnsupportedValue {
            reason: "map key must be a string".to_string(),
        })
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Self::SerializeMap, CanonError> {
        Err(CanonError::UnsupportedValue {
            reason: "map key must be a string".to_string(),
        })
    }

    fn serialize_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStruct, CanonError> {
        Err(CanonError::UnsupportedValue {
            reason: "map key must be a string".to_string(),
        })
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStructVariant, CanonError> {
        Err(CanonError::UnsupportedValue {
            reason: "map key must be a string".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sorts_keys_and_strips_whitespace() {
        let v = json!({"z": 1, "a": {"y": 2, "b": 3}});
        assert_eq!(
            canonical_json_string(&v).unwrap(),
            r#"{"a":{"b":3,"y":2},"z":1}"#
        );
    }

    #[test]
    fn utf16_key_order_handles_supplementary_plane() {
        // U+1D306 (surrogates D834 DF06) sorts before U+FF00 in UTF-16
        // but after it in UTF-8 byte order.
        let v = json!({"\u{ff00}": 1, "\u{1d306}": 2});
        let s = canonical_json_string(&v).unwrap();
        let i_supp = s.find('\u{1d306}').unwrap();
        let i_bmp = s.find('\u{ff00}').unwrap();
        assert!(i_supp < i_bmp, "expected surrogate-order sort in {s:?}");
    }

    #[test]
    fn numbers_follow_ecmascript_formatting() {
        let cases: &[(f64, &str)] = &[
            (0.0, "0"),
            (-0.0, "0"),
            (1.0, "1"),
            (-1.5, "-1.5"),
            (0.1, "0.1"),
            (1e21, "1e+21"),
            (1e20, "100000000000000000000"),
            (5e-7, "5e-7"),
            (0.000001, "0.000001"),
            (123456.789, "123456.789"),
        ];
        for (input, expected) in cases {
            let got = canonical_json_string(&json!(*input)).unwrap();
            assert_eq!(&got, expected, "for {input}");
        }
    }

    #[test]
    fn rejects_non_finite() {
        #[derive(Serialize)]
        struct Holder {
            x: f64,
        }
        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let err = canonical_json_string(&Holder { x: bad }).unwrap_err();
            assert_eq!(err, CanonError::NonFiniteNumber);
        }
    }

    #[test]
    fn escapes_control_characters() {
        let v = json!({"k": "a\nb\u{0007}c\"d\\e"});
        assert_eq!(
            canonical_json_string(&v).unwrap(),
            "{\"k\":\"a\\nb\\u0007c\\\"d\\\\e\"}"
        );
    }

    #[test]
    fn repeated_encoding_is_byte_identical() {
        let v = json!({"arr": [1, 2.5, "x"], "obj": {"nested": true}, "n": null});
        let first = canonical_json_bytes(&v).unwrap();
        for _ in 0..100 {
            assert_eq!(canonical_json_bytes(&v).unwrap(), first);
        }
    }
}
