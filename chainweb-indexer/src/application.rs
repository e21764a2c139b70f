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

use crate::domain::{
    Block, BlockRef, CHAIN_COUNT, ChainId, Coordinator, WantedRange, clamp_range,
    node::Node,
    storage::Storage,
};
use anyhow::{Context, bail, ensure};
use futures::StreamExt;
use log::{error, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use std::{collections::HashMap, pin::pin, sync::Arc, time::Duration};
use tokio::{
    select,
    signal::unix::Signal,
    task::{self, JoinHandle},
    time::sleep,
};

/// Live-path progress is logged whenever the block height is a multiple of
/// this; gap-fill uses the coarser cadence.
const LIVE_LOG_EVERY: u64 = 200;
const FILL_LOG_EVERY: u64 = 1_000;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// How often each per-chain gap-fill task looks for missing ranges.
    #[serde(with = "humantime_serde", default = "fill_interval_default")]
    pub fill_interval: Duration,

    pub events: Vec<EventConfig>,
}

/// One entry of the configured watch-list.
#[derive(Debug, Clone, Deserialize)]
pub struct EventConfig {
    /// Fully-qualified event name, e.g. `marmalade-v2.ledger.SALE`.
    pub name: String,

    pub chains: Vec<ChainId>,

    /// Closed height range to index, both bounds optional.
    #[serde(default)]
    pub height: (Option<u64>, Option<u64>),
}

pub async fn run(
    config: Config,
    node: impl Node,
    storage: impl Storage,
    mut sigterm: Signal,
    mut sigint: Signal,
) -> anyhow::Result<()> {
    let Config {
        fill_interval,
        events,
    } = config;

    validate_events(&events)?;

    let names = events
        .iter()
        .map(|event| event.name.clone())
        .collect::<Vec<_>>();
    storage
        .provision(&names)
        .await
        .context("provision store tables and indexes")?;

    // Register every (event, chain) pair, trimming previously persisted
    // coverage to the now configured window.
    let coordinator = Arc::new(Coordinator::new());
    for event in &events {
        for chain in &event.chains {
            let persisted = storage
                .get_coverage(chain, &event.name)
                .await
                .context("load persisted coverage")?;
            let done = coordinator.register(chain, &event.name, event.height, persisted);
            storage
                .put_coverage(chain, &event.name, &done)
                .await
                .context("persist trimmed coverage")?;

            let (lo, hi) = clamp_range(event.height);
            info!(name = event.name.as_str(), chain:%, lo, hi; "watching event");
        }
    }

    // Drop events that fall outside the wanted windows, e.g. after a config
    // change tightened a range.
    for WantedRange {
        name,
        chain,
        lo,
        hi,
    } in coordinator.wanted()
    {
        let pruned = storage
            .prune(&chain, &name, lo, hi)
            .await
            .context("prune out-of-range events")?;
        if pruned > 0 {
            info!(name, chain:%, pruned; "pruned out-of-range events");
        }
    }

    let tips: Arc<RwLock<HashMap<ChainId, BlockRef>>> = Arc::default();
    let fill_tasks: Arc<Mutex<HashMap<ChainId, JoinHandle<()>>>> = Arc::default();

    let mut live_task = task::spawn({
        let node = node.clone();
        let storage = storage.clone();
        let coordinator = coordinator.clone();
        let tips = tips.clone();
        let fill_tasks = fill_tasks.clone();

        async move {
            let blocks = node.block_updates();
            let mut blocks = pin!(blocks);

            while let Some(block) = blocks.next().await {
                let block = block.context("get next block from node")?;

                // A failed transaction leaves neither events nor coverage
                // behind; the block is re-seen live or re-fetched by gap-fill.
                if let Err(error) =
                    index_block(&coordinator, &storage, &block, LIVE_LOG_EVERY).await
                {
                    let error = format!("{error:#}");
                    warn!(
                        error,
                        hash = block.header.hash.as_str(),
                        height = block.header.height;
                        "cannot index block"
                    );
                }

                let chain = block.header.chain.clone();
                tips.write().insert(chain.clone(), BlockRef::from(&block));

                if !fill_tasks.lock().contains_key(&chain) {
                    info!(chain:%; "starting gap-fill task");
                    let task = task::spawn(fill_missing_task(
                        chain.clone(),
                        fill_interval,
                        node.clone(),
                        storage.clone(),
                        coordinator.clone(),
                        tips.clone(),
                    ));
                    fill_tasks.lock().insert(chain, task);
                }
            }

            bail!("block update stream ended")
        }
    });

    let result = select! {
        result = &mut live_task => result
            .context("live_task panicked")
            .and_then(|r: anyhow::Result<()>| r.context("live_task failed")),

        _ = sigterm.recv() => {
            warn!("SIGTERM received");
            Ok(())
        }

        _ = sigint.recv() => {
            warn!("SIGINT received");
            Ok(())
        }
    };

    live_task.abort();
    for (_, task) in fill_tasks.lock().drain() {
        task.abort();
    }

    result
}

/// Index one block within a single store transaction: every event passing the
/// coordinator's gate, then the coverage extension for the block's height.
/// The chain's coverage rows are read under the store's row lock first, so a
/// transaction committed concurrently for the same height is observed before
/// gating and turns this one into a no-op. In-memory coverage is only updated
/// after a successful commit.
async fn index_block(
    coordinator: &Coordinator,
    storage: &impl Storage,
    block: &Block,
    log_every: u64,
) -> anyhow::Result<()> {
    let events = block.events().context("decode block events")?;
    let chain = &block.header.chain;
    let height = block.header.height;

    let mut tx = storage.begin().await.context("begin store transaction")?;

    let persisted = storage
        .lock_coverage(chain, &mut tx)
        .await
        .context("lock persisted coverage")?;
    coordinator.sync(chain, &persisted);

    for event in &events {
        if coordinator.should_index(&event.chain, &event.name, event.height) {
            storage
                .save_event(event, &mut tx)
                .await
                .context("save event")?;
        }
    }

    let updates = coordinator.stage(chain, height, height);
    if !updates.is_empty() {
        storage
            .save_coverage(chain, &updates, &mut tx)
            .await
            .context("save coverage")?;
    }

    storage
        .commit(tx)
        .await
        .context("commit store transaction")?;
    coordinator.apply(chain, height, height);

    if log_every > 0 && height % log_every == 0 {
        info!(chain:%, height; "indexed block");
    }

    Ok(())
}

async fn fill_missing_task(
    chain: ChainId,
    interval: Duration,
    node: impl Node,
    storage: impl Storage,
    coordinator: Arc<Coordinator>,
    tips: Arc<RwLock<HashMap<ChainId, BlockRef>>>,
) {
    loop {
        if let Err(error) = fill_missing(&chain, &node, &storage, &coordinator, &tips).await {
            let error = format!("{error:#}");
            error!(chain:%, error; "cannot fill missing blocks");
        }

        sleep(interval).await;
    }
}

/// Close the coverage gaps below the chain's current tip, newest gap first.
async fn fill_missing(
    chain: &ChainId,
    node: &impl Node,
    storage: &impl Storage,
    coordinator: &Coordinator,
    tips: &RwLock<HashMap<ChainId, BlockRef>>,
) -> anyhow::Result<()> {
    let Some(tip) = tips.read().get(chain).cloned() else {
        return Ok(());
    };

    let missing = coordinator.missing(chain, tip.height.saturating_sub(1));
    for (lo, hi) in missing.iter().rev() {
        info!(chain:%, lo, hi; "filling hole");

        let blocks = node.blocks(chain, &tip.hash, lo, hi);
        let mut blocks = pin!(blocks);
        while let Some(block) = blocks.next().await {
            let block = block.context("get historical block")?;
            index_block(coordinator, storage, &block, FILL_LOG_EVERY).await?;
        }

        info!(chain:%, lo, hi; "hole filled");
    }

    Ok(())
}

fn validate_events(events: &[EventConfig]) -> anyhow::Result<()> {
    ensure!(!events.is_empty(), "no events configured");

    for event in events {
        // Event names double as store table names, so the charset is strict.
        ensure!(
            !event.name.is_empty()
                && event.name.len() <= 48
                && event
                    .name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')),
            "invalid event name {:?}",
            event.name
        );

        ensure!(
            !event.chains.is_empty(),
            "no chains configured for event {}",
            event.name
        );
        for chain in &event.chains {
            ensure!(
                chain
                    .as_str()
                    .parse::<u64>()
                    .is_ok_and(|id| id < CHAIN_COUNT),
                "invalid chain {:?} for event {}",
                chain.as_str(),
                event.name
            );
        }
    }

    Ok(())
}

fn fill_interval_default() -> Duration {
    Duration::from_secs(120)
}

#[cfg(test)]
mod tests {
    use crate::{
        application::{EventConfig, fill_missing, index_block, validate_events},
        domain::{
            Block, BlockRef, ChainId, Coordinator, Event,
            node::Node,
            storage::{CoverageUpdate, Storage},
        },
    };
    use futures::{Stream, stream};
    use indexer_common::{domain::IntervalSet, error::BoxError};
    use parking_lot::{Mutex, RwLock};
    use serde_json::json;
    use std::{
        collections::{BTreeMap, HashMap},
        convert::Infallible,
        sync::Arc,
    };

    #[derive(Clone, Default)]
    struct MockStorage {
        state: Arc<Mutex<StoreState>>,
    }

    #[derive(Debug, Default, PartialEq)]
    struct StoreState {
        coverage: BTreeMap<(String, String), IntervalSet>,
        events: BTreeMap<String, Vec<(String, u64, u32)>>,
    }

    #[derive(Default)]
    struct MockTx {
        events: Vec<Event>,
        coverage: Vec<(String, String, IntervalSet)>,
    }

    impl Storage for MockStorage {
        type Tx = MockTx;

        async fn provision(&self, _event_names: &[String]) -> Result<(), sqlx::Error> {
            Ok(())
        }

        async fn get_coverage(
            &self,
            chain: &ChainId,
            name: &str,
        ) -> Result<Option<IntervalSet>, sqlx::Error> {
            let state = self.state.lock();
            Ok(state
                .coverage
                .get(&(chain.to_string(), name.to_owned()))
                .cloned())
        }

        async fn put_coverage(
            &self,
            chain: &ChainId,
            name: &str,
            range: &IntervalSet,
        ) -> Result<(), sqlx::Error> {
            let mut state = self.state.lock();
            state
                .coverage
                .insert((chain.to_string(), name.to_owned()), range.clone());
            Ok(())
        }

        async fn begin(&self) -> Result<MockTx, sqlx::Error> {
            Ok(MockTx::default())
        }

        async fn lock_coverage(
            &self,
            chain: &ChainId,
            _tx: &mut MockTx,
        ) -> Result<Vec<CoverageUpdate>, sqlx::Error> {
            let state = self.state.lock();
            Ok(state
                .coverage
                .iter()
                .filter(|((c, _), _)| c.as_str() == chain.as_str())
                .map(|((_, name), range)| CoverageUpdate {
                    name: name.clone(),
                    range: range.clone(),
                })
                .collect())
        }

        async fn save_event(&self, event: &Event, tx: &mut MockTx) -> Result<(), sqlx::Error> {
            tx.events.push(event.clone());
            Ok(())
        }

        async fn save_coverage(
            &self,
            chain: &ChainId,
            updates: &[CoverageUpdate],
            tx: &mut MockTx,
        ) -> Result<(), sqlx::Error> {
            for update in updates {
                tx.coverage.push((
                    chain.to_string(),
                    update.name.clone(),
                    update.range.clone(),
                ));
            }
            Ok(())
        }

        async fn commit(&self, tx: MockTx) -> Result<(), sqlx::Error> {
            let mut state = self.state.lock();
            for event in tx.events {
                state
                    .events
                    .entry(event.name.clone())
                    .or_default()
                    .push((event.req_key, event.height, event.rank));
            }
            for (chain, name, range) in tx.coverage {
                state.coverage.insert((chain, name), range);
            }
            Ok(())
        }

        async fn prune(
            &self,
            _chain: &ChainId,
            name: &str,
            lo: u64,
            hi: u64,
        ) -> Result<u64, sqlx::Error> {
            let mut state = self.state.lock();
            let Some(events) = state.events.get_mut(name) else {
                return Ok(0);
            };
            let before = events.len();
            events.retain(|&(_, height, _)| lo <= height && height <= hi);
            Ok((before - events.len()) as u64)
        }
    }

    #[derive(Clone, Default)]
    struct MockNode {
        branch_calls: Arc<Mutex<Vec<(u64, u64)>>>,
    }

    impl Node for MockNode {
        type Error = Infallible;

        fn blocks(
            &self,
            _chain: &ChainId,
            _parent: &String,
            min_height: u64,
            max_height: u64,
        ) -> impl Stream<Item = Result<Block, Infallible>> + Send {
            self.branch_calls.lock().push((min_height, max_height));
            stream::empty()
        }

        fn block_updates(&self) -> impl Stream<Item = Result<Block, Infallible>> + Send {
            stream::pending()
        }
    }

    fn block(height: u64) -> Block {
        let output = indexer_common::codec::base64_encode(
            serde_json::to_vec(&json!({
                "reqKey": "k",
                "events": [
                    {
                        "module": {"namespace": "ns", "name": "M"},
                        "name": "E",
                        "params": [42],
                    },
                    {
                        "module": {"namespace": null, "name": "other"},
                        "name": "X",
                        "params": [],
                    },
                ],
            }))
            .unwrap(),
        );

        serde_json::from_value(json!({
            "header": {
                "hash": format!("hash-{height}"),
                "height": height,
                "parent": format!("hash-{}", height - 1),
                "chainId": 0,
                "creationTime": 1_700_000_000_000_000_u64,
            },
            "payloadWithOutputs": {
                "coinbase": "e30",
                "transactions": [["Y21k", output]],
            },
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_index_block() -> Result<(), BoxError> {
        let storage = MockStorage::default();
        let coordinator = Coordinator::new();
        let chain = ChainId::from("0");
        coordinator.register(&chain, "ns.M.E", (None, None), None);

        index_block(&coordinator, &storage, &block(1_500_000), 0).await?;

        {
            let state = storage.state.lock();
            // The watched event is stored, the unwatched one is not.
            assert_eq!(
                state.events.get("ns.M.E"),
                Some(&vec![("k".to_string(), 1_500_000, 1)])
            );
            assert!(!state.events.contains_key("other.X"));
            // Coverage extended to exactly that height.
            assert_eq!(
                state.coverage.get(&("0".to_string(), "ns.M.E".to_string())),
                Some(&IntervalSet::singleton(1_500_000))
            );
        }
        assert!(!coordinator.should_index(&chain, "ns.M.E", 1_500_000));

        Ok(())
    }

    #[tokio::test]
    async fn test_index_block_is_idempotent() -> Result<(), BoxError> {
        let storage = MockStorage::default();
        let coordinator = Coordinator::new();
        coordinator.register(&ChainId::from("0"), "ns.M.E", (None, None), None);

        index_block(&coordinator, &storage, &block(1_500_000), 0).await?;
        let after_first = format!("{:?}", storage.state.lock());

        index_block(&coordinator, &storage, &block(1_500_000), 0).await?;
        let after_second = format!("{:?}", storage.state.lock());

        assert_eq!(after_first, after_second);

        Ok(())
    }

    #[tokio::test]
    async fn test_index_block_observes_concurrent_coverage() -> Result<(), BoxError> {
        let storage = MockStorage::default();
        let coordinator = Coordinator::new();
        let chain = ChainId::from("0");
        coordinator.register(&chain, "ns.M.E", (None, None), None);

        // Coverage for the height committed by another task and not yet
        // reflected in the in-memory state.
        storage
            .put_coverage(&chain, "ns.M.E", &IntervalSet::singleton(1_500_000))
            .await?;

        index_block(&coordinator, &storage, &block(1_500_000), 0).await?;

        // The locked rows are folded in before gating, so nothing is
        // inserted twice.
        assert!(!storage.state.lock().events.contains_key("ns.M.E"));
        assert!(!coordinator.should_index(&chain, "ns.M.E", 1_500_000));

        Ok(())
    }

    #[tokio::test]
    async fn test_index_block_advances_coverage_out_of_range() -> Result<(), BoxError> {
        let storage = MockStorage::default();
        let coordinator = Coordinator::new();
        let chain = ChainId::from("0");
        // The block height is outside the wanted window of ns.M.E but inside
        // the one of other.X.
        coordinator.register(&chain, "ns.M.E", (Some(1_400_000), Some(1_400_100)), None);
        coordinator.register(&chain, "other.X", (None, None), None);

        index_block(&coordinator, &storage, &block(1_500_000), 0).await?;

        let state = storage.state.lock();
        // No document for the out-of-range event, but coverage advanced for
        // the in-range one.
        assert!(!state.events.contains_key("ns.M.E"));
        assert_eq!(
            state.events.get("other.X"),
            Some(&vec![("k".to_string(), 1_500_000, 1)])
        );
        assert!(
            !state
                .coverage
                .contains_key(&("0".to_string(), "ns.M.E".to_string()))
        );
        assert_eq!(
            state.coverage.get(&("0".to_string(), "other.X".to_string())),
            Some(&IntervalSet::singleton(1_500_000))
        );

        Ok(())
    }

    #[tokio::test]
    async fn test_fill_missing_walks_holes_descending() -> Result<(), BoxError> {
        let node = MockNode::default();
        let storage = MockStorage::default();
        let coordinator = Coordinator::new();
        let chain = ChainId::from("0");
        coordinator.register(&chain, "A", (Some(2_000_000), None), None);
        coordinator.apply(&chain, 2_001_000, 2_001_999);

        let tips = RwLock::new(HashMap::from([(
            chain.clone(),
            BlockRef {
                hash: "tip".to_string(),
                height: 2_003_000,
            },
        )]));

        fill_missing(&chain, &node, &storage, &coordinator, &tips).await?;

        // The newest hole is fetched first, both bounded by the tip.
        assert_eq!(
            *node.branch_calls.lock(),
            vec![(2_002_000, 2_002_999), (2_000_000, 2_000_999)]
        );

        Ok(())
    }

    #[test]
    fn test_validate_events() {
        let event = |name: &str, chains: &[&str]| EventConfig {
            name: name.to_string(),
            chains: chains.iter().map(|&chain| ChainId::from(chain)).collect(),
            height: (None, None),
        };

        assert!(validate_events(&[event("ns.M.E", &["0", "19"])]).is_ok());
        assert!(validate_events(&[]).is_err());
        assert!(validate_events(&[event("", &["0"])]).is_err());
        assert!(validate_events(&[event("bad\"name", &["0"])]).is_err());
        assert!(validate_events(&[event("ns.M.E", &[])]).is_err());
        assert!(validate_events(&[event("ns.M.E", &["20"])]).is_err());
        assert!(validate_events(&[event("ns.M.E", &["x"])]).is_err());
    }
}
