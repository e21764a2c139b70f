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

use crate::domain::{ChainId, Event};
use indexer_common::domain::IntervalSet;

/// The coverage row of one (chain, event) pair, as read under lock or
/// written back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverageUpdate {
    pub name: String,
    pub range: IntervalSet,
}

/// Storage abstraction.
#[trait_variant::make(Send)]
pub trait Storage
where
    Self: Clone + Send + Sync + 'static,
{
    /// Store transaction under which a block's events and its coverage
    /// extension commit or abort together.
    type Tx: Send;

    /// Create missing tables and indexes for the coordinator and the given
    /// event names.
    async fn provision(&self, event_names: &[String]) -> Result<(), sqlx::Error>;

    /// Get the persisted coverage for the given chain and event name.
    async fn get_coverage(
        &self,
        chain: &ChainId,
        name: &str,
    ) -> Result<Option<IntervalSet>, sqlx::Error>;

    /// Upsert the persisted coverage for the given chain and event name,
    /// outside of any transaction (registration path).
    async fn put_coverage(
        &self,
        chain: &ChainId,
        name: &str,
        range: &IntervalSet,
    ) -> Result<(), sqlx::Error>;

    async fn begin(&self) -> Result<Self::Tx, sqlx::Error>;

    /// Read and row-lock the persisted coverage of the given chain within
    /// the given transaction. Transactions for the same chain serialize
    /// here, so the returned ranges are authoritative until commit; chains
    /// lock disjoint rows.
    async fn lock_coverage(
        &self,
        chain: &ChainId,
        tx: &mut Self::Tx,
    ) -> Result<Vec<CoverageUpdate>, sqlx::Error>;

    /// Save the given event within the given transaction.
    async fn save_event(&self, event: &Event, tx: &mut Self::Tx) -> Result<(), sqlx::Error>;

    /// Upsert all given coverage rows for the given chain in one bulk write
    /// within the given transaction.
    async fn save_coverage(
        &self,
        chain: &ChainId,
        updates: &[CoverageUpdate],
        tx: &mut Self::Tx,
    ) -> Result<(), sqlx::Error>;

    async fn commit(&self, tx: Self::Tx) -> Result<(), sqlx::Error>;

    /// Delete all events of the given chain outside `[lo, hi]` from the given
    /// event's collection and return how many were deleted.
    async fn prune(
        &self,
        chain: &ChainId,
        name: &str,
        lo: u64,
        hi: u64,
    ) -> Result<u64, sqlx::Error>;
}
