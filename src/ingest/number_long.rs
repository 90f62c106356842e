//! Tolerant decoding of the `count` field.
//!
//! Exports from the upstream document store encode 64-bit integers three ways:
//! a bare number (`1006`), a quoted number (`"1006"`) or an extended-JSON
//! wrapper (`{"$numberLong": "1006"}`). All of them decode to the same value.
//! `null` decodes to zero and is left for the range check to refuse.

use serde::de::{self, Deserializer, IgnoredAny, MapAccess, Visitor};
use serde::Deserialize;
use std::fmt;

const WRAPPER_KEY: &str = "$numberLong";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NumberLong(pub i64);

#[derive(Deserialize)]
#[serde(untagged)]
enum WrappedDigits {
    Number(i64),
    Text(String),
}

fn parse_digits<E: de::Error>(digits: &str) -> Result<i64, E> {
    digits
        .parse::<i64>()
        .map_err(|err| E::custom(format_args!("string number {digits:?}: {err}")))
}

struct NumberLongVisitor;

impl<'de> Visitor<'de> for NumberLongVisitor {
    type Value = NumberLong;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an integer, a numeric string or {\"$numberLong\": \"<digits>\"}")
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<NumberLong, E> {
        Ok(NumberLong(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<NumberLong, E> {
        i64::try_from(v)
            .map(NumberLong)
            .map_err(|_| E::custom(format_args!("number {v} overflows i64")))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<NumberLong, E> {
        parse_digits(v).map(NumberLong)
    }

    fn visit_unit<E: de::Error>(self) -> Result<NumberLong, E> {
        Ok(NumberLong(0))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<NumberLong, A::Error> {
        let mut value = None;
        while let Some(key) = map.next_key::<String>()? {
            if key == WRAPPER_KEY {
                let n = match map.next_value::<WrappedDigits>()? {
                    WrappedDigits::Number(n) => n,
                    WrappedDigits::Text(digits) => parse_digits(&digits)?,
                };
                value = Some(n);
            } else {
                map.next_value::<IgnoredAny>()?;
            }
        }
        value
            .map(NumberLong)
            .ok_or_else(|| de::Error::missing_field(WRAPPER_KEY))
    }
}

impl<'de> Deserialize<'de> for NumberLong {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(NumberLongVisitor)
    }
}
