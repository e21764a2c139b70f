// This file is part of chainweb-indexer.
// Copyright (C) 2025 Chainweb Indexer Contributors
// SPDX-License-Identifier: Apache-2.0
// Licensed under the Apache License, Version 2.0 (the "License");
// You may not use this file except in compliance with the License.
// You may obtain a copy of the License at
// http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Pact values as they appear in transaction outputs.
//!
//! Pact serializes arbitrary-precision numbers as tagged objects
//! (`{"decimal": "1.5"}`, `{"int": "42"}`) or as plain JSON numbers. Both
//! forms are rehydrated into exact numeric types here; nothing ever passes
//! through an IEEE-754 double, since downstream consumers compare exact
//! amounts and prices.

use crate::codec;
use bigdecimal::{BigDecimal, ToPrimitive, num_bigint::BigInt};
use serde::{
    Deserialize, Deserializer, Serialize, Serializer,
    ser::Error as SerError,
};
use serde_json::{Map, Number, Value};
use std::str::FromStr;

/// A decoded Pact value.
#[derive(Debug, Clone, PartialEq)]
pub enum PactValue {
    Null,
    Bool(bool),
    Int(i64),
    /// An integer beyond two's-complement 64 bit, kept lossless as its
    /// decimal string form.
    BigInt(String),
    Decimal(BigDecimal),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<PactValue>),
    Map(Vec<(String, PactValue)>),
}

impl From<Value> for PactValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(number) => from_number(number),
            Value::String(s) => Self::Str(s),
            Value::Array(values) => Self::List(values.into_iter().map(Into::into).collect()),
            Value::Object(object) => from_object(object),
        }
    }
}

/// JSON numbers keep their literal form (`serde_json` arbitrary precision),
/// so floats convert exactly and oversized integers degrade to [PactValue::BigInt]
/// instead of losing digits.
fn from_number(number: Number) -> PactValue {
    if let Some(n) = number.as_i64() {
        return PactValue::Int(n);
    }

    let literal = number.to_string();
    if literal.bytes().all(|b| b.is_ascii_digit() || b == b'-') {
        return PactValue::BigInt(literal);
    }

    BigDecimal::from_str(&literal)
        .map(PactValue::Decimal)
        .unwrap_or(PactValue::Str(literal))
}

fn from_object(object: Map<String, Value>) -> PactValue {
    if let Some(Value::String(s)) = object.get("decimal") {
        if let Ok(decimal) = BigDecimal::from_str(s) {
            return PactValue::Decimal(decimal);
        }
        // Unparseable tag: keep the raw object.
    } else if let Some(Value::String(s)) = object.get("int") {
        if let Ok(int) = BigInt::from_str(s) {
            return match int.to_i64() {
                Some(small) => PactValue::Int(small),
                None => PactValue::BigInt(int.to_string()),
            };
        }
    }

    PactValue::Map(
        object
            .into_iter()
            .map(|(key, value)| (key, value.into()))
            .collect(),
    )
}

impl<'de> Deserialize<'de> for PactValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Value::deserialize(deserializer).map(Into::into)
    }
}

impl Serialize for PactValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::Null => serializer.serialize_unit(),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Int(n) => serializer.serialize_i64(*n),
            Self::BigInt(s) => serializer.serialize_str(s),

            // Emitted as an arbitrary-precision JSON number, not via f64.
            Self::Decimal(decimal) => Number::from_str(&decimal.to_string())
                .map_err(S::Error::custom)?
                .serialize(serializer),

            Self::Str(s) => serializer.serialize_str(s),
            Self::Bytes(bytes) => serializer.serialize_str(&codec::base64_encode(bytes)),
            Self::List(values) => serializer.collect_seq(values),
            Self::Map(entries) => {
                serializer.collect_map(entries.iter().map(|(key, value)| (key, value)))
            }
        }
    }
}
