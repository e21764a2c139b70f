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

use derive_more::{Display, From};
use indexer_common::{codec, domain::PactValue};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sqlx::types::time::OffsetDateTime;
use std::iter;
use thiserror::Error;

/// Block hashes and request keys travel as URL-safe base64 strings and are
/// used verbatim as keys, never decoded.
pub type BlockHash = String;

/// Chain identifier, the decimal string form of the numeric chain id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Display, From)]
pub struct ChainId(String);

impl ChainId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ChainId {
    fn from(chain: &str) -> Self {
        Self(chain.to_owned())
    }
}

/// The node serializes the chain id as a number in block headers, but as a
/// string elsewhere; both are accepted.
impl<'de> Deserialize<'de> for ChainId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Number(u64),
            Text(String),
        }

        let chain = match Repr::deserialize(deserializer)? {
            Repr::Number(n) => n.to_string(),
            Repr::Text(s) => s,
        };

        Ok(Self(chain))
    }
}

impl Serialize for ChainId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

/// Hash and height of a block, enough to anchor branch walks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRef {
    pub hash: BlockHash,
    pub height: u64,
}

/// A Chainweb block as delivered by the node: header fields plus the payload
/// carrying base64-encoded transaction outputs.
#[derive(Debug, Clone, Deserialize)]
pub struct Block {
    pub header: Header,

    #[serde(rename = "payloadWithOutputs")]
    pub payload: Payload,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Header {
    pub hash: BlockHash,
    pub height: u64,
    pub parent: BlockHash,

    #[serde(rename = "chainId")]
    pub chain: ChainId,

    /// Microseconds since the Unix epoch.
    #[serde(rename = "creationTime")]
    pub creation_time: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Payload {
    pub coinbase: String,

    /// Pairs of base64-encoded command and output.
    #[serde(default)]
    pub transactions: Vec<(String, String)>,
}

impl Block {
    /// The block creation time as a UTC instant with microsecond precision.
    pub fn timestamp(&self) -> Result<OffsetDateTime, BlockDecodeError> {
        OffsetDateTime::from_unix_timestamp_nanos(self.header.creation_time as i128 * 1_000)
            .map_err(|_| BlockDecodeError::Timestamp(self.header.creation_time))
    }

    /// The decoded transaction outputs of the block: the coinbase output
    /// first, then each transaction's output in order.
    pub fn transaction_outputs(
        &self,
    ) -> impl Iterator<Item = Result<TransactionOutput, BlockDecodeError>> + '_ {
        iter::once(&self.payload.coinbase)
            .chain(self.payload.transactions.iter().map(|(_cmd, output)| output))
            .map(|encoded| decode_output(encoded))
    }

    /// All events emitted by the block, in transaction-output order.
    pub fn events(&self) -> Result<Vec<Event>, BlockDecodeError> {
        let ts = self.timestamp()?;

        let mut events = Vec::new();
        for (rank, output) in self.transaction_outputs().enumerate() {
            let output = output?;
            let req_key = output.req_key.unwrap_or_default();

            for event in output.events {
                events.push(Event {
                    name: event.fully_qualified_name(),
                    params: event.params,
                    req_key: req_key.clone(),
                    chain: self.header.chain.clone(),
                    block: self.header.hash.clone(),
                    rank: rank as u32,
                    height: self.header.height,
                    ts,
                });
            }
        }

        Ok(events)
    }
}

impl From<&Block> for BlockRef {
    fn from(block: &Block) -> Self {
        Self {
            hash: block.header.hash.clone(),
            height: block.header.height,
        }
    }
}

/// The fields of a decoded transaction output the indexer cares about.
#[derive(Debug, Clone, Deserialize)]
pub struct TransactionOutput {
    #[serde(rename = "reqKey", default)]
    pub req_key: Option<String>,

    #[serde(default)]
    pub events: Vec<PactEvent>,
}

/// An event entry of a transaction output's `events` array.
#[derive(Debug, Clone, Deserialize)]
pub struct PactEvent {
    pub module: ModuleName,
    pub name: String,

    #[serde(default)]
    pub params: Vec<PactValue>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModuleName {
    #[serde(default)]
    pub namespace: Option<String>,

    pub name: String,
}

impl PactEvent {
    /// `namespace.module.EVENT`, or `module.EVENT` for bare modules. An empty
    /// namespace counts as absent.
    pub fn fully_qualified_name(&self) -> String {
        match self.module.namespace.as_deref().filter(|ns| !ns.is_empty()) {
            Some(namespace) => format!("{namespace}.{}.{}", self.module.name, self.name),
            None => format!("{}.{}", self.module.name, self.name),
        }
    }
}

/// A contract event extracted from a block, ready for persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub name: String,
    pub params: Vec<PactValue>,
    pub req_key: String,
    pub chain: ChainId,
    pub block: BlockHash,

    /// Position within the block's transaction-output sequence, the coinbase
    /// output being 0.
    pub rank: u32,

    pub height: u64,
    pub ts: OffsetDateTime,
}

#[derive(Debug, Error)]
pub enum BlockDecodeError {
    #[error("cannot decode base64 transaction output")]
    Base64(#[from] base64::DecodeError),

    #[error("cannot decode transaction output JSON")]
    Json(#[from] serde_json::Error),

    #[error("block creation time {0} out of range")]
    Timestamp(u64),
}

fn decode_output(encoded: &str) -> Result<TransactionOutput, BlockDecodeError> {
    let bytes = codec::base64_decode(encoded)?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use crate::domain::{Block, ChainId, PactEvent};
    use bigdecimal::BigDecimal;
    use indexer_common::{codec, domain::PactValue};
    use serde_json::json;
    use std::str::FromStr;

    fn encode_output(output: serde_json::Value) -> String {
        codec::base64_encode(serde_json::to_vec(&output).unwrap())
    }

    fn block() -> Block {
        let coinbase = encode_output(json!({
            "reqKey": "cb",
            "result": {"status": "success"},
        }));
        let output = encode_output(json!({
            "reqKey": "k",
            "events": [
                {
                    "module": {"namespace": "ns", "name": "M"},
                    "name": "E",
                    "params": [42, {"decimal": "1.5"}],
                },
                {
                    "module": {"namespace": null, "name": "coin"},
                    "name": "TRANSFER",
                    "params": ["alice", "bob"],
                },
            ],
        }));

        let block = json!({
            "header": {
                "hash": "h4sh",
                "height": 1_500_000,
                "parent": "p4rent",
                "chainId": 0,
                "creationTime": 1_700_000_000_000_000_u64,
            },
            "payloadWithOutputs": {
                "coinbase": coinbase,
                "transactions": [["Y21k", output]],
            },
        });

        serde_json::from_value(block).unwrap()
    }

    #[test]
    fn test_header() {
        let block = block();
        assert_eq!(block.header.hash, "h4sh");
        assert_eq!(block.header.height, 1_500_000);
        assert_eq!(block.header.chain, ChainId::from("0"));
        assert_eq!(
            block.timestamp().unwrap().unix_timestamp_nanos(),
            1_700_000_000_000_000_000
        );
    }

    #[test]
    fn test_transaction_outputs_start_with_coinbase() {
        let outputs = block()
            .transaction_outputs()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].req_key.as_deref(), Some("cb"));
        assert!(outputs[0].events.is_empty());
        assert_eq!(outputs[1].req_key.as_deref(), Some("k"));
    }

    #[test]
    fn test_events() {
        let block = block();
        let events = block.events().unwrap();
        assert_eq!(events.len(), 2);

        let event = &events[0];
        assert_eq!(event.name, "ns.M.E");
        assert_eq!(
            event.params,
            vec![
                PactValue::Int(42),
                PactValue::Decimal(BigDecimal::from_str("1.5").unwrap()),
            ]
        );
        assert_eq!(event.req_key, "k");
        assert_eq!(event.chain, ChainId::from("0"));
        assert_eq!(event.block, "h4sh");
        assert_eq!(event.rank, 1);
        assert_eq!(event.height, 1_500_000);
        assert_eq!(event.ts, block.timestamp().unwrap());

        assert_eq!(events[1].name, "coin.TRANSFER");
    }

    #[test]
    fn test_fully_qualified_name_without_namespace() {
        let event = serde_json::from_value::<PactEvent>(json!({
            "module": {"namespace": "", "name": "coin"},
            "name": "TRANSFER",
            "params": [],
        }))
        .unwrap();
        assert_eq!(event.fully_qualified_name(), "coin.TRANSFER");
    }
}
