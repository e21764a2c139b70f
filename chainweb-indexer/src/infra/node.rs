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

use crate::domain::{Block, BlockHash, ChainId, node::Node};
use async_stream::try_stream;
use eventsource_client::{self as es, Client as _, ReconnectOptions, SSE};
use futures::{Stream, StreamExt};
use log::{info, warn};
use serde::Deserialize;
use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};
use thiserror::Error;
use tokio::time::sleep;

/// The branch walk sweeps the height range in windows of this many blocks.
const BLOCKS_PER_BATCH: u64 = 300;

/// Page size requested per branch request; the server follows up with a
/// `next` cursor.
const BRANCH_PAGE_LIMIT: u64 = 150;

/// How many recently streamed blocks to retain for parent-before-child
/// ordering.
const PARENT_CACHE_CAPACITY: usize = 256;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const READ_TIMEOUT: Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(10);

/// A [Node] implementation against the HTTP API of a chainweb-node.
#[derive(Debug, Clone)]
pub struct ChainwebNode {
    client: reqwest::Client,
    api_url: String,
}

impl ChainwebNode {
    /// Connect to the node at the given base URL: query `/info` to learn the
    /// network id, which all further API paths are scoped by.
    pub async fn connect(url: impl AsRef<str>) -> Result<Self, ChainwebNodeError> {
        let base_url = url.as_ref().trim_end_matches('/').to_owned();

        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .build()?;

        let info = client
            .get(format!("{base_url}/info"))
            .send()
            .await?
            .error_for_status()?
            .json::<NodeInfo>()
            .await?;
        info!(
            node_version = info.node_package_version,
            network = info.node_version;
            "connected to chainweb node"
        );

        let api_url = format!("{base_url}/chainweb/0.0/{}", info.node_version);

        Ok(Self { client, api_url })
    }
}

impl Node for ChainwebNode {
    type Error = ChainwebNodeError;

    fn blocks(
        &self,
        chain: &ChainId,
        parent: &BlockHash,
        min_height: u64,
        max_height: u64,
    ) -> impl Stream<Item = Result<Block, ChainwebNodeError>> + Send {
        let client = self.client.clone();
        let url = format!("{}/chain/{chain}/block/branch", self.api_url);
        let body = serde_json::json!({ "lower": [], "upper": [parent] });

        try_stream! {
            let mut hi = max_height;
            loop {
                let lo = min_height.max(hi.saturating_sub(BLOCKS_PER_BATCH - 1));

                let mut next: Option<String> = None;
                loop {
                    let mut query = vec![
                        ("limit", BRANCH_PAGE_LIMIT.to_string()),
                        ("minheight", lo.to_string()),
                        ("maxheight", hi.to_string()),
                    ];
                    if let Some(cursor) = &next {
                        query.push(("next", cursor.clone()));
                    }

                    let page = client
                        .post(&url)
                        .query(&query)
                        .json(&body)
                        .send()
                        .await?
                        .error_for_status()?
                        .json::<BranchPage>()
                        .await?;

                    for block in page.items {
                        yield block;
                    }

                    match page.next {
                        Some(cursor) if !cursor.is_empty() => next = Some(cursor),
                        _ => break,
                    }
                }

                if lo <= min_height {
                    break;
                }
                hi = lo - 1;
            }
        }
    }

    fn block_updates(&self) -> impl Stream<Item = Result<Block, ChainwebNodeError>> + Send {
        let url = format!("{}/block/updates", self.api_url);

        try_stream! {
            let mut cache = ParentCache::new(PARENT_CACHE_CAPACITY);

            loop {
                let mut events = match updates_client(&url) {
                    Ok(client) => client.stream(),
                    Err(error) => {
                        warn!(error:%; "cannot create block update stream");
                        sleep(RECONNECT_DELAY).await;
                        continue;
                    }
                };
                let mut connected = false;

                while let Some(item) = events.next().await {
                    match item {
                        Ok(SSE::Event(event)) => {
                            if !connected {
                                info!("block update stream connected");
                                connected = true;
                            }

                            match serde_json::from_str::<Block>(&event.data) {
                                Ok(block) => {
                                    for block in cache.admit(block) {
                                        yield block;
                                    }
                                }
                                Err(error) => warn!(error:%; "cannot decode streamed block"),
                            }
                        }

                        Ok(_) => {}

                        // The client reconnects internally; the error item is
                        // informational.
                        Err(error) => {
                            warn!(error:%; "block update stream error, reconnecting");
                            connected = false;
                        }
                    }
                }

                warn!("block update stream ended, reconnecting");
                sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum ChainwebNodeError {
    #[error("HTTP request failed")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Deserialize)]
struct NodeInfo {
    /// The network id, e.g. `mainnet01`.
    #[serde(rename = "nodeVersion")]
    node_version: String,

    #[serde(rename = "nodePackageVersion")]
    node_package_version: String,
}

#[derive(Debug, Deserialize)]
struct BranchPage {
    items: Vec<Block>,

    #[serde(default)]
    next: Option<String>,
}

fn updates_client(url: &str) -> Result<impl es::Client, es::Error> {
    let reconnect = ReconnectOptions::reconnect(true)
        .retry_initial(true)
        .delay(RECONNECT_DELAY)
        .delay_max(RECONNECT_DELAY)
        .build();

    Ok(es::ClientBuilder::for_url(url)?
        .method("POST".to_string())
        .reconnect(reconnect)
        .build())
}

/// Bounded FIFO cache of recently streamed blocks, keyed by hash. For every
/// incoming block the cached parent, when present, is replayed before the
/// block itself, so consumers observe a parent before its child even when a
/// reconnect delivers blocks a few steps ahead of what was already seen.
/// Replayed parents that were delivered before are deduplicated downstream by
/// the coordinator's coverage gating.
struct ParentCache {
    blocks: HashMap<BlockHash, Block>,
    order: VecDeque<BlockHash>,
    capacity: usize,
}

impl ParentCache {
    fn new(capacity: usize) -> Self {
        Self {
            blocks: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    /// Record an incoming block and return what to emit: the cached parent
    /// first, when present, then the block itself.
    fn admit(&mut self, block: Block) -> Vec<Block> {
        let mut emit = Vec::with_capacity(2);

        if let Some(parent) = self.blocks.get(&block.header.parent) {
            emit.push(parent.clone());
        }

        let hash = block.header.hash.clone();
        emit.push(block.clone());

        if self.blocks.insert(hash.clone(), block).is_none() {
            self.order.push_back(hash);
            while self.order.len() > self.capacity {
                if let Some(evicted) = self.order.pop_front() {
                    self.blocks.remove(&evicted);
                }
            }
        }

        emit
    }
}

#[cfg(test)]
mod tests {
    use crate::infra::node::ParentCache;
    use crate::domain::Block;
    use serde_json::json;

    fn block(hash: &str, height: u64, parent: &str) -> Block {
        serde_json::from_value(json!({
            "header": {
                "hash": hash,
                "height": height,
                "parent": parent,
                "chainId": 0,
                "creationTime": 1_700_000_000_000_000_u64,
            },
            "payloadWithOutputs": {
                "coinbase": "e30",
                "transactions": [],
            },
        }))
        .unwrap()
    }

    fn hashes(blocks: Vec<Block>) -> Vec<String> {
        blocks.into_iter().map(|block| block.header.hash).collect()
    }

    #[test]
    fn test_admit_replays_cached_parent() {
        let mut cache = ParentCache::new(256);

        // A arrives with an unknown parent.
        assert_eq!(hashes(cache.admit(block("a", 10, "z"))), vec!["a"]);

        // B's parent A is cached and gets replayed first.
        assert_eq!(hashes(cache.admit(block("b", 11, "a"))), vec!["a", "b"]);

        // After a reconnect C arrives; its parent B is still cached, A is
        // not replayed.
        assert_eq!(hashes(cache.admit(block("c", 12, "b"))), vec!["b", "c"]);
    }

    #[test]
    fn test_admit_evicts_fifo() {
        let mut cache = ParentCache::new(2);
        cache.admit(block("a", 1, "z"));
        cache.admit(block("b", 2, "a"));
        cache.admit(block("c", 3, "b"));

        // A was evicted, so a child of A finds no cached parent.
        assert_eq!(hashes(cache.admit(block("a2", 2, "a"))), vec!["a2"]);
        // C is still cached.
        assert_eq!(hashes(cache.admit(block("d", 4, "c"))), vec!["c", "d"]);
    }
}
