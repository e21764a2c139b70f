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

use crate::domain::{ChainId, storage::CoverageUpdate};
use indexer_common::domain::IntervalSet;
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// No Pact events exist below this height on any chain.
pub const MIN_EVENT_HEIGHT: u64 = 1_138_000;
pub const MAX_EVENT_HEIGHT: u64 = 999_999_999;

/// Number of parallel chains of the network.
pub const CHAIN_COUNT: u64 = 20;

type CoverageByEvent = BTreeMap<String, IntervalSet>;

#[derive(Debug, Default)]
struct State {
    /// Height ranges to be indexed, per chain and event name, fixed after
    /// registration.
    wanted: BTreeMap<ChainId, CoverageByEvent>,

    /// Height ranges already indexed; always a subset of `wanted`. The
    /// authoritative copy lives in the store, extended transactionally with
    /// the events that justify each extension.
    done: BTreeMap<ChainId, CoverageByEvent>,
}

/// Tracks which block heights have been indexed for which events and gates
/// event persistence accordingly.
///
/// The interval maps are behind a mutex so the live consumer and the gap-fill
/// tasks can share the coordinator; making a staged coverage extension
/// durable before applying it is the application's responsibility.
#[derive(Debug, Default)]
pub struct Coordinator {
    state: Mutex<State>,
}

/// One entry of the flattened wanted registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WantedRange {
    pub name: String,
    pub chain: ChainId,
    pub lo: u64,
    pub hi: u64,
}

/// Clamp a configured height range into `[MIN_EVENT_HEIGHT, MAX_EVENT_HEIGHT]`,
/// open bounds falling back to the respective limit.
pub fn clamp_range(range: (Option<u64>, Option<u64>)) -> (u64, u64) {
    let (lo, hi) = range;
    (
        lo.unwrap_or(MIN_EVENT_HEIGHT).max(MIN_EVENT_HEIGHT),
        hi.unwrap_or(MAX_EVENT_HEIGHT).min(MAX_EVENT_HEIGHT),
    )
}

impl Coordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an event to be indexed on the given chain within the given
    /// height range. Previously persisted coverage is intersected with the
    /// wanted range, trimming regions that fall outside a now-tightened
    /// window; the returned set must be persisted right away.
    pub fn register(
        &self,
        chain: &ChainId,
        name: &str,
        range: (Option<u64>, Option<u64>),
        persisted: Option<IntervalSet>,
    ) -> IntervalSet {
        let (lo, hi) = clamp_range(range);
        let wanted = IntervalSet::closed(lo, hi);
        let done = persisted.unwrap_or_default().intersection(&wanted);

        let mut state = self.state.lock();
        state
            .wanted
            .entry(chain.clone())
            .or_default()
            .insert(name.to_owned(), wanted);
        state
            .done
            .entry(chain.clone())
            .or_default()
            .insert(name.to_owned(), done.clone());

        done
    }

    /// Whether an event occurrence at the given height still needs indexing:
    /// watched on that chain, within the wanted range, not yet covered.
    pub fn should_index(&self, chain: &ChainId, name: &str, height: u64) -> bool {
        let state = self.state.lock();

        let Some(wanted) = state.wanted.get(chain).and_then(|events| events.get(name)) else {
            return false;
        };
        let covered = state
            .done
            .get(chain)
            .and_then(|events| events.get(name))
            .is_some_and(|done| done.contains(height));

        wanted.contains(height) && !covered
    }

    /// Coverage updates extending `done` by `[lo, hi]` for every registered
    /// event on the chain, whether it fired in that range or not. Only
    /// changed sets are included. State is not touched; pass the updates to
    /// the store and call [Coordinator::apply] once they are durable.
    pub fn stage(&self, chain: &ChainId, lo: u64, hi: u64) -> Vec<CoverageUpdate> {
        let range = IntervalSet::closed(lo, hi);
        let state = self.state.lock();

        let Some(wanted_by_name) = state.wanted.get(chain) else {
            return Vec::new();
        };

        wanted_by_name
            .iter()
            .filter_map(|(name, wanted)| {
                let done = &state.done[chain][name];
                let new_done = done.union(&range).intersection(wanted);
                (new_done != *done).then(|| CoverageUpdate {
                    name: name.clone(),
                    range: new_done,
                })
            })
            .collect()
    }

    /// Merge `[lo, hi]` into the in-memory coverage of every registered event
    /// on the chain. Only call this after the matching staged updates have
    /// been committed.
    pub fn apply(&self, chain: &ChainId, lo: u64, hi: u64) {
        let range = IntervalSet::closed(lo, hi);
        let mut state = self.state.lock();

        let State { wanted, done } = &mut *state;
        let Some(wanted_by_name) = wanted.get(chain) else {
            return;
        };

        for (name, wanted) in wanted_by_name {
            let done = done
                .get_mut(chain)
                .and_then(|events| events.get_mut(name))
                .expect("done has an entry for every wanted event");
            *done = done.union(&range).intersection(wanted);
        }
    }

    /// Fold freshly read persisted coverage into the in-memory state, e.g.
    /// after taking the store's row locks on the chain's coverage rows. Rows
    /// of unregistered events are ignored; registered done sets only grow.
    pub fn sync(&self, chain: &ChainId, rows: &[CoverageUpdate]) {
        let mut state = self.state.lock();

        let State { wanted, done } = &mut *state;
        let Some(wanted_by_name) = wanted.get(chain) else {
            return;
        };

        for row in rows {
            let Some(wanted) = wanted_by_name.get(&row.name) else {
                continue;
            };
            let done = done
                .get_mut(chain)
                .and_then(|events| events.get_mut(&row.name))
                .expect("done has an entry for every wanted event");
            *done = done.union(&row.range).intersection(wanted);
        }
    }

    /// The heights still to be indexed on the chain, up to and including
    /// `max_height`: the union over all events of wanted minus done. Ascending;
    /// gap-fill iterates the result in descending order so the newest gap
    /// closes first.
    pub fn missing(&self, chain: &ChainId, max_height: u64) -> IntervalSet {
        let state = self.state.lock();

        let Some(wanted_by_name) = state.wanted.get(chain) else {
            return IntervalSet::new();
        };

        let mut missing = IntervalSet::new();
        for (name, wanted) in wanted_by_name {
            missing = missing.union(&wanted.difference(&state.done[chain][name]));
        }

        missing.intersection(&IntervalSet::closed(MIN_EVENT_HEIGHT, max_height))
    }

    /// The registered events flattened to (name, chain, lo, hi), for startup
    /// logging and pruning. Events whose wanted range is empty are skipped.
    pub fn wanted(&self) -> Vec<WantedRange> {
        let state = self.state.lock();

        state
            .wanted
            .iter()
            .flat_map(|(chain, events)| {
                events.iter().filter_map(|(name, wanted)| {
                    wanted.bounds().map(|(lo, hi)| WantedRange {
                        name: name.clone(),
                        chain: chain.clone(),
                        lo,
                        hi,
                    })
                })
            })
            .collect()
    }
}
